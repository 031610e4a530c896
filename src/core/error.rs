use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Invalid entity id '{0}'")]
    InvalidEntityId(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

impl<T> From<std::sync::PoisonError<T>> for StateError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        Self::DecodeError(err.to_string())
    }
}
