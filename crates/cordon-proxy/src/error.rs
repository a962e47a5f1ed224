//! Error types for the cordon-proxy crate.

use thiserror::Error;

/// Errors that can occur in the egress proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("DNS parse error: {0}")]
    DnsParse(String),

    #[error("Upstream connection failed to {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("Upstream timed out: {host}")]
    UpstreamTimeout { host: String },

    #[error("Unsupported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("Policy error: {0}")]
    Policy(#[from] cordon::CordonError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
