use thiserror::Error;

/// Errors produced while framing or parsing BT messages.
///
/// Every variant is a protocol error: the stream that produced it cannot be
/// resynchronized and must be closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// No `:` was found within the maximum encoded-length window.
    #[error("no length terminator within {0} bytes")]
    LengthOverflow(usize),
    /// The length prefix contained a non-digit or was empty.
    #[error("invalid length prefix")]
    InvalidLength,
    /// The length prefix was zero.
    #[error("empty message")]
    EmptyMessage,
    /// The decoded message length exceeds [`MAX_REQ_LEN`](crate::MAX_REQ_LEN).
    #[error("message of {0} bytes exceeds maximum size")]
    Oversize(usize),
    /// The payload is not a well-formed bencoded value.
    #[error("invalid bencoding: {0}")]
    Bencode(&'static str),
    /// The list decoded, but is not a recognized message shape.
    #[error("unrecognized message type")]
    InvalidKind,
    /// A request body exceeds the maximum message size.
    #[error("request body too long")]
    BodyTooLong,
}
