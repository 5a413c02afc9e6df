use thiserror::Error;

/// Common error type for AirSight components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid topic: {0}")]
    Topic(String),
}

/// Result type alias using AirSight's Error.
pub type Result<T> = std::result::Result<T, Error>;
