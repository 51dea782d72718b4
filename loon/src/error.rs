use std::io;

use thiserror::Error;

/// Errors returned by the loon runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Syscall or io_uring operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Reactor setup failed (e.g., unsupported kernel features).
    #[error("reactor setup: {0}")]
    ReactorSetup(String),
    /// Invalid configuration value.
    #[error("configuration: {0}")]
    Config(String),
    /// The loop has shut down; the submission was not accepted.
    #[error("event loop has shut down")]
    Shutdown,
    /// No free timer slots; the ticker could not be armed.
    #[error("timer slot pool exhausted")]
    TimerExhausted,
    /// The UDP token does not refer to a live socket.
    #[error("invalid UDP socket")]
    InvalidUdpSocket,
}
