use std::io;

use thiserror::Error;

/// Errors returned by loon-quic operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying event loop rejected the operation.
    #[error("event loop: {0}")]
    Loop(#[from] loon::Error),

    /// TLS configuration was invalid.
    #[error("tls: {0}")]
    Tls(String),

    /// Outbound connection setup failed.
    #[error("connect: {0}")]
    Connect(#[from] quinn_proto::ConnectError),

    /// The connection is gone (closed, drained, or never existed).
    #[error("invalid connection")]
    InvalidConnection,

    /// The stream is gone or was never opened.
    #[error("invalid stream")]
    InvalidStream,

    /// The peer's stream concurrency limit has been reached.
    #[error("stream limit reached")]
    StreamsExhausted,

    /// A request body exceeds the protocol's maximum message size.
    #[error("request body too long")]
    BodyTooLong,

    /// Socket setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Application-level close codes used on streams and connections.
pub mod close_code {
    /// Graceful shutdown.
    pub const SHUTDOWN: u64 = 0;
    /// BT request stream framing or protocol violation.
    pub const BT_PROTOCOL_ERROR: u64 = 1;
    /// The endpoint does not accept peer-initiated streams.
    pub const STREAM_REJECTED: u64 = 2;
}
