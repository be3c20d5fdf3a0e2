use thiserror::Error;

/// Live state that cannot be turned into rows, or rows that cannot be
/// turned back into live state.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("{entity} is missing required field `{field}`")]
    MissingField {
        entity: &'static str,
        field: &'static str,
    },

    #[error("corrupt JSON in {entity}.{field}: {source}")]
    Json {
        entity: &'static str,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Storage task failed: {0}")]
    Task(String),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
