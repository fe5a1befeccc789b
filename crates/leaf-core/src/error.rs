//! Error types for the LeafSense training pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the training pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image processing error
    #[error("Image processing error: {0}")]
    Image(String),

    /// Invalid or incomplete configuration. Fatal before any training state exists.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required path does not exist
    #[error("Path not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A sample could not be loaded or decoded
    #[error("Sample unavailable: {path}: {reason}")]
    Sample { path: PathBuf, reason: String },

    /// Model construction or weight loading error
    #[error("Model error: {0}")]
    Model(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Checkpoint persistence error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Export was requested but no checkpoint was ever written
    #[error("Export precondition failed: {0}")]
    ExportPrecondition(String),

    /// Graph conversion or artifact writing error
    #[error("Export error: {0}")]
    Export(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(String),
}

impl Error {
    /// Builds a sample error for the image at `path`.
    pub fn sample(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Sample {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err.to_string())
    }
}

/// Specialized Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
