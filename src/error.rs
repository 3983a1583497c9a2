use thiserror::Error;

/// Failures reported across the device link boundary.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device unavailable: {0}")]
    Unavailable(String),
    #[error("device busy: {0}")]
    Busy(String),
    #[error("frame read timed out")]
    Timeout,
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

impl DeviceError {
    /// Whether the capture loop should absorb this error and retry.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            DeviceError::Timeout | DeviceError::Io(_) | DeviceError::Decode(_)
        )
    }
}

/// Caller-visible inference failures.
#[derive(Debug, Error)]
pub enum InferError {
    #[error("Model not loaded")]
    ModelNotLoaded,
    #[error("Empty file")]
    EmptyFile,
    #[error("Invalid image file")]
    InvalidImage(#[source] image::ImageError),
    #[error("inference failed: {0}")]
    Inference(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing config file: {0}")]
    Missing(String),
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] config::ConfigError),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("JPEG encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("encoder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
