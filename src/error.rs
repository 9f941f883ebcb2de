//! Error handling for the printwatch engine

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found (unknown camera or alert id)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Camera / frame source error
    #[error("Camera error: {0}")]
    Camera(String),

    /// Inference error (encoder or classifier)
    #[error("Inference error: {0}")]
    Inference(String),

    /// Printer API error
    #[error("Printer error: {0}")]
    Printer(String),

    /// Persistence error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
