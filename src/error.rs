use crate::program::LoadError;
use crate::settings::SettingsError;
use crate::source::SourceError;

/// Top-level error for the binary. Faults inside a single compile, line or
/// source are handled where they happen; only these reach `main`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("I/O error: {message}")]
    IoError { message: String },
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("{message}")]
    ValidationError { message: String },
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::IoError {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::ValidationError {
            message: e.to_string(),
        }
    }
}
