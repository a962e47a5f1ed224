//! Error types for the cordon core library.

use thiserror::Error;

/// Errors that can occur while building an egress policy.
#[derive(Error, Debug)]
pub enum CordonError {
    #[error("Invalid domain pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid action {0:?}: expected \"allow\" or \"deny\"")]
    InvalidAction(String),
}

/// Result type alias for cordon core operations.
pub type Result<T> = std::result::Result<T, CordonError>;
