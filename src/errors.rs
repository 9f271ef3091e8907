use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Storage provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Query failed for {what}: {message}")]
    QueryFailure { what: String, message: String },

    #[error("Serialization failed: {0}")]
    SerializationFailure(String),

    #[error("Upload of {key} failed: {message}")]
    UploadFailure { key: String, message: String },

    #[error("Download of {key} failed: {message}")]
    DownloadFailure { key: String, message: String },

    #[error("Delete of {key} failed: {message}")]
    DeleteFailure { key: String, message: String },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Verification failed: {0}")]
    VerificationFailure(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("{what} timed out after {seconds} seconds")]
    Timeout { what: String, seconds: u64 },

    #[error("{what} exited with {status}: {stderr}")]
    Command {
        what: String,
        status: String,
        stderr: String,
    },

    #[error("Task failed: {0}")]
    TaskFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    pub fn query(what: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        BackupError::QueryFailure {
            what: what.into(),
            message: cause.to_string(),
        }
    }

    pub fn upload(key: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        BackupError::UploadFailure {
            key: key.into(),
            message: cause.to_string(),
        }
    }

    pub fn download(key: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        BackupError::DownloadFailure {
            key: key.into(),
            message: cause.to_string(),
        }
    }

    pub fn delete(key: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        BackupError::DeleteFailure {
            key: key.into(),
            message: cause.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        BackupError::ConfigurationError(message.into())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::SerializationFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
