//! Error types for the proxy.

use std::net::SocketAddr;
use thiserror::Error;

/// Failures that stop the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind the listening socket
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The listening socket can no longer be read
    #[error("failed to receive on listening socket: {0}")]
    Recv(#[source] std::io::Error),
}

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
