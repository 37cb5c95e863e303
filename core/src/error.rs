use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Integrity error for {hash}: {message}")]
    Integrity { hash: String, message: String },

    #[error("Could not create directory {} after {attempts} attempts", path.display())]
    DirectoryCreation { path: PathBuf, attempts: u32 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Object for {hash} is missing at {}", path.display())]
    ObjectMissing { hash: String, path: PathBuf },

    #[error("Unknown partition: {0}")]
    UnknownPartition(u32),

    #[error("Hash not found in manifest: {hash}")]
    NotInManifest { hash: String },

    #[error("Path not found in snapshot: {path}")]
    PathNotFound { path: String },

    #[error("Storage directory not found at {path}")]
    StorageNotFound { path: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors that must stop the whole run instead of being counted per job.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DirectoryCreation { .. } | Error::Configuration(_) | Error::ObjectMissing { .. }
        )
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Other(format!("worker task failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
