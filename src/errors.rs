use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for DaemonError {
    fn from(err: std::io::Error) -> Self {
        DaemonError::Storage(err.to_string())
    }
}

impl From<rusqlite::Error> for DaemonError {
    fn from(err: rusqlite::Error) -> Self {
        DaemonError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(err: serde_json::Error) -> Self {
        DaemonError::Storage(err.to_string())
    }
}
