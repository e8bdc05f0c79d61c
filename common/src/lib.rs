use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use thiserror::Error;
use url::ParseError;

pub mod config;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// Raw input could not be read or failed validation. Aborts the run before any write.
    #[error("Load error: {0}")]
    Load(String),

    /// A table could not be staged or published.
    #[error("Write error for table '{table}': {message}")]
    Write { table: String, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("DataFusion error: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid Uri: {0}")]
    InvalidUri(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn write(table: &str, cause: impl std::fmt::Display) -> Self {
        Error::Write {
            table: table.to_string(),
            message: cause.to_string(),
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::InvalidUri(format!("URL parse error: {}", err))
    }
}
