use std::io;
use thiserror::Error;

/// Errors raised while framing, encoding or caching protocol data.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying pipe failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the stream in the middle of a frame.
    #[error("connection closed in the middle of a frame")]
    Truncated,
    /// A frame announced a body larger than we accept.
    #[error("frame body of {0} bytes exceeds the limit")]
    TooLarge(usize),
    /// MessagePack encoding failed.
    #[error("failed to encode message: {0}")]
    Encode(String),
    /// MessagePack decoding failed.
    #[error("failed to decode message: {0}")]
    Decode(String),
    /// The body decoded to something other than a map.
    #[error("message body is not a map")]
    NotAMap,
    /// The body map carries no `"cmd"` string.
    #[error("message has no \"cmd\" field")]
    MissingCommand,
    /// More bytes arrived for a cached image than were declared.
    #[error("image {path} overflows its declared size: {received} > {total} bytes")]
    Overflow {
        /// Cache key of the transfer.
        path: String,
        /// Bytes received including the offending chunk.
        received: usize,
        /// Size declared when the transfer started.
        total: usize,
    },
    /// A chunk declared a different total than the transfer it belongs to.
    #[error("image {path} was announced with {expected} bytes, chunk declares {declared}")]
    SizeMismatch {
        /// Cache key of the transfer.
        path: String,
        /// Size declared when the transfer started.
        expected: usize,
        /// Size declared by the offending chunk.
        declared: usize,
    },
}

/// Result alias for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
