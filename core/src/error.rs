/// Error types for the IM client and development backend
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Duplicate message: sent too quickly")]
    DuplicateMessage,

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No conversation selected")]
    NoConversation,
}

impl ImError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ImError::Status { status, .. } => Some(*status),
            ImError::DuplicateMessage => Some(409),
            ImError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ImError>;
