use std::io;

use thiserror::Error;

/// Errors surfaced by the client pipeline.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level failure: connection reset, refused, broken pipe.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The downstream transport gave up waiting for a response.
    #[error("request timed out")]
    Timeout,

    /// The request was rejected locally because every host was saturated
    /// and the queue had no room left.
    #[error("unable to make a request (queue is full), max queue size: {max_queue_size}")]
    QueueFull { max_queue_size: usize },

    /// The caller abandoned the request before it completed.
    #[error("request was cancelled")]
    Cancelled,

    /// The client was torn down while the request was still pending.
    #[error("client closed before the request completed")]
    Closed,
}

/// Errors raised while assembling a client pipeline.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("at least one host is required for channel {channel_name}")]
    NoHosts { channel_name: String },
}
