//! Error types for the AI plumbing

use thiserror::Error;

/// AI module error types
#[derive(Error, Debug)]
pub enum AiError {
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for AI operations
pub type Result<T> = std::result::Result<T, AiError>;
