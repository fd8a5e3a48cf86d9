//! Error types for DF synchronization operations.

use thiserror::Error;

/// Errors that can occur in DF synchronization operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Broker connection error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Protocol error (unknown type, bad length, bad record count, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The buffer does not yet contain a complete frame.
    #[error("incomplete frame")]
    Incomplete,

    /// A VRF or interface name does not fit the wire format.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The synchronization tasks have been shut down.
    #[error("sync channel closed")]
    Closed,
}
