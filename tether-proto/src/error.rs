//! Error types for protocol operations.

use std::io;

/// Alias for `Result<T, tether_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the framing, value, and message layers.
///
/// Every variant except [`Error::SessionClosed`] is fatal to the session
/// that produced it. A semantically well-formed `ok=false` Response is not
/// an error at this layer; callers inspect it as a value.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Stream read/write failure, or EOF before the expected byte count.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Frame length exceeds the 16 MiB cap.
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    /// A value could not be decoded from the supported MessagePack subset.
    #[error("malformed value: {0}")]
    MalformedValue(&'static str),

    /// A payload decoded as values but violated the message shape contract.
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    /// A well-formed message of the wrong type arrived.
    #[error("expected {expected} message, got {got}")]
    UnexpectedType {
        /// The `type` field that was required.
        expected: &'static str,
        /// The `type` field that actually arrived.
        got: String,
    },

    /// Operation on a session that has already transitioned to Closed.
    #[error("session closed")]
    SessionClosed,

    /// A Data stream violated its ordering or size contract.
    #[error("stream protocol violation: {0}")]
    Stream(String),
}
