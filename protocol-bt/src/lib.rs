//! protocol-bt — length-prefixed bencoded request/response wire format.
//!
//! Every message on the wire is a bencoded list preceded by a plain decimal
//! length prefix:
//!
//! ```text
//! <decimal-length> ":" <bencoded-list>
//! ```
//!
//! The list is one of three shapes:
//!
//! ```text
//! l "C" <int req_id> <endpoint-name> <body> e     (command)
//! l "R" <int req_id> <body> e                    (response)
//! l "E" <int req_id> <body> e                    (error response)
//! ```
//!
//! This crate is sans-IO: [`FrameAccumulator`] consumes arbitrary byte
//! chunks and yields complete list payloads, and [`parse_message`] turns a
//! payload into a [`BtFrame`]. Transports feed bytes in; nothing here does
//! I/O or owns a socket.

mod bencode;
mod error;
mod frame;
mod streaming;

pub use bencode::{ListConsumer, ListProducer};
pub use error::FrameError;
pub use frame::{
    BtFrame, MAX_REQ_LEN, MAX_REQ_LEN_ENCODED, MessageKind, encode_command, encode_response,
    frame, parse_message,
};
pub use streaming::FrameAccumulator;
