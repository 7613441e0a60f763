//! Error types for chatmux

use thiserror::Error;

use crate::session::ChatError;
use crate::upstream::UpstreamError;

/// Main error type for chatmux operations
#[derive(Error, Debug)]
pub enum ChatmuxError {
    /// Configuration errors (missing file, bad TOML, empty credential list)
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors (bind, serve)
    #[error("Server error: {0}")]
    Server(String),

    /// Upstream provider errors raised outside of a chat turn
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Chat turn errors, already mapped into the public taxonomy
    #[error(transparent)]
    Chat(#[from] ChatError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for chatmux operations
pub type Result<T> = std::result::Result<T, ChatmuxError>;
