//! Error types for the edge proxy

use thiserror::Error;

/// Errors that can occur while serving a proxied request.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Transport failure (DNS, connect, timeout) on an outbound call.
    #[error("Upstream unreachable: {url}: {source}")]
    UpstreamUnreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// `WWW-Authenticate` was present but did not carry a usable realm and service.
    #[error("Malformed WWW-Authenticate challenge: {0}")]
    MalformedAuthChallenge(String),

    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Body error: {0}")]
    Body(String),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
