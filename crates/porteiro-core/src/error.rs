use thiserror::Error;

#[derive(Debug, Error)]
pub enum PorteiroError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PorteiroError {
    /// Short error code string for structured logs and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PorteiroError::Config(_) => "CONFIG_ERROR",
            PorteiroError::Serialization(_) => "SERIALIZATION_ERROR",
            PorteiroError::Io(_) => "IO_ERROR",
            PorteiroError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, PorteiroError>;
