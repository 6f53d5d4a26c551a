//! Error types for the endpoint impact core library.

/// Top-level error enum for the endpoint impact core library.
#[derive(Debug, thiserror::Error)]
pub enum ImpactError {
    #[error("Index error: {0}")]
    Index(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Entry point source error: {0}")]
    EntryPoints(String),

    #[error("Diff source error: {0}")]
    Diff(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ignore::Error> for ImpactError {
    fn from(err: ignore::Error) -> Self {
        ImpactError::Index(err.to_string())
    }
}

pub type ImpactResult<T> = Result<T, ImpactError>;
