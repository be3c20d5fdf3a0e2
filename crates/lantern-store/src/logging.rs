//! Structured reporting of contained storage failures.
//!
//! The facade never returns a storage error to its caller. Instead each
//! failure is handed to a [`StorageLogger`] as a [`StorageLog`] record so the
//! host can route it wherever it wants.

use std::fmt;

/// One contained failure.
#[derive(Debug, Clone)]
pub struct StorageLog {
    /// Component that failed, e.g. `"local_storage"`.
    pub scope: &'static str,
    /// Facade operation that was running, e.g. `"query_channels"`.
    pub operation: &'static str,
    pub error: String,
}

impl fmt::Display for StorageLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed in {}: {}", self.operation, self.scope, self.error)
    }
}

/// Sink for contained failures. Implementations can forward to tracing,
/// collect for tests, or discard.
pub trait StorageLogger: Send + Sync {
    fn log(&self, entry: StorageLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl StorageLogger for TracingLogger {
    fn log(&self, entry: StorageLog) {
        tracing::warn!(
            scope = entry.scope,
            operation = entry.operation,
            "{}",
            entry.error,
        );
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl StorageLogger for NullLogger {
    fn log(&self, _entry: StorageLog) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_operation_and_scope() {
        let entry = StorageLog {
            scope: "local_storage",
            operation: "add_member",
            error: "disk I/O error".into(),
        };
        assert_eq!(entry.to_string(), "add_member failed in local_storage: disk I/O error");
    }
}
