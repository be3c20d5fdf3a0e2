use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which [`LocalStore`](crate::LocalStore) implementation to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Structured,
    Flat,
}

impl BackendKind {
    /// Parse a backend name. Unknown names fall back to `Structured`.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "flat" | "kv" => Self::Flat,
            _ => Self::Structured,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Database file. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    pub encryption_key: Option<String>,
}

impl StorageConfig {
    pub fn in_memory(backend: BackendKind) -> Self {
        Self {
            backend,
            path: None,
            encryption_key: None,
        }
    }

    /// Read `LANTERN_BACKEND`, `LANTERN_DB_PATH` and `LANTERN_ENCRYPTION_KEY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let backend = lookup("LANTERN_BACKEND")
            .map(|v| BackendKind::parse(&v))
            .unwrap_or_default();
        let path = lookup("LANTERN_DB_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let encryption_key = lookup("LANTERN_ENCRYPTION_KEY").filter(|v| !v.is_empty());

        Self {
            backend,
            path,
            encryption_key,
        }
    }
}
