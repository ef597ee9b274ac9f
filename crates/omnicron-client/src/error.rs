//! Client error types.

use thiserror::Error;

/// Errors surfaced to a subscription's consumer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The server could not be reached and retries are exhausted.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The subscription is closed.
    #[error("subscription closed")]
    Closed,

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The server refused the subscription. Terminal: not retried.
    #[error("unauthorized for {stream}: {message}")]
    Unauthorized { stream: String, message: String },
}
