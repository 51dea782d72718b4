//! BT message encoding and payload parsing.

use std::ops::Range;

use crate::bencode::{ListConsumer, ListProducer};
use crate::error::FrameError;

/// Maximum decoded message size in bytes.
pub const MAX_REQ_LEN: usize = 10_000_000;

/// Maximum length of the decimal length prefix, including the `:`.
/// Must be large enough to hold `MAX_REQ_LEN` followed by a colon.
pub const MAX_REQ_LEN_ENCODED: usize = 9; // "10000000:"

/// The role of a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// An invocation of a named endpoint, possibly expecting a reply.
    Command,
    /// A successful reply to a command.
    Response,
    /// An error reply to a command.
    Error,
}

impl MessageKind {
    fn tag(self) -> &'static str {
        match self {
            MessageKind::Command => "C",
            MessageKind::Response => "R",
            MessageKind::Error => "E",
        }
    }
}

/// A parsed message payload.
///
/// `endpoint` and `body` are offset ranges into the payload the frame was
/// parsed from, so the caller can hold views into a shared buffer without
/// copying. Commands carry a non-empty endpoint range; responses and errors
/// always have an empty one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtFrame {
    pub kind: MessageKind,
    pub req_id: i64,
    pub endpoint: Range<usize>,
    pub body: Range<usize>,
}

/// Encode a command payload (the bencoded list, without the length prefix).
pub fn encode_command(endpoint: &str, req_id: i64, body: &[u8]) -> Vec<u8> {
    let mut list = ListProducer::new();
    list.append_str(MessageKind::Command.tag());
    list.append_int(req_id);
    list.append_str(endpoint);
    list.append_bytes(body);
    list.finish()
}

/// Encode a response or error payload (without the length prefix).
pub fn encode_response(req_id: i64, body: &[u8], is_error: bool) -> Vec<u8> {
    let kind = if is_error { MessageKind::Error } else { MessageKind::Response };
    let mut list = ListProducer::new();
    list.append_str(kind.tag());
    list.append_int(req_id);
    list.append_bytes(body);
    list.finish()
}

/// Wrap a payload in its decimal length prefix, producing wire bytes.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + MAX_REQ_LEN_ENCODED);
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out
}

/// Parse a complete message payload (as yielded by
/// [`FrameAccumulator`](crate::FrameAccumulator)) into a [`BtFrame`].
pub fn parse_message(payload: &[u8]) -> Result<BtFrame, FrameError> {
    let mut list = ListConsumer::new(payload)?;

    let kind_range = list.next_bytes()?;
    let kind = match &payload[kind_range] {
        b"C" => MessageKind::Command,
        b"R" => MessageKind::Response,
        b"E" => MessageKind::Error,
        _ => return Err(FrameError::InvalidKind),
    };

    let req_id = list.next_int()?;

    let endpoint = if kind == MessageKind::Command {
        list.next_bytes()?
    } else {
        0..0
    };

    let body = list.next_bytes()?;
    list.finish()?;

    Ok(BtFrame { kind, req_id, endpoint, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_bytes() {
        let payload = encode_command("end", 42, b"");
        assert_eq!(payload, b"l1:Ci42e3:end0:e");
        assert_eq!(frame(&payload), b"16:l1:Ci42e3:end0:e");
    }

    #[test]
    fn response_wire_bytes() {
        assert_eq!(encode_response(42, b"ok", false), b"l1:Ri42e2:oke");
        assert_eq!(encode_response(42, b"no", true), b"l1:Ei42e2:noe");
    }

    #[test]
    fn parse_command() {
        let payload = encode_command("status", -3, b"hello");
        let frame = parse_message(&payload).unwrap();
        assert_eq!(frame.kind, MessageKind::Command);
        assert_eq!(frame.req_id, -3);
        assert_eq!(&payload[frame.endpoint], b"status");
        assert_eq!(&payload[frame.body], b"hello");
    }

    #[test]
    fn parse_response_has_empty_endpoint() {
        let payload = encode_response(9, b"body", false);
        let frame = parse_message(&payload).unwrap();
        assert_eq!(frame.kind, MessageKind::Response);
        assert_eq!(frame.req_id, 9);
        assert!(frame.endpoint.is_empty());
        assert_eq!(&payload[frame.body], b"body");
    }

    #[test]
    fn parse_error_kind() {
        let payload = encode_response(1, b"boom", true);
        let frame = parse_message(&payload).unwrap();
        assert_eq!(frame.kind, MessageKind::Error);
    }

    #[test]
    fn reject_unknown_kind() {
        assert_eq!(parse_message(b"l1:Xi1e0:e"), Err(FrameError::InvalidKind));
    }

    #[test]
    fn reject_command_missing_body() {
        // A command without a body field fails on the list terminator.
        assert!(parse_message(b"l1:Ci1e3:ende").is_err());
    }

    #[test]
    fn reject_extra_entries() {
        assert!(parse_message(b"l1:Ri1e0:0:e").is_err());
    }

    #[test]
    fn binary_body_round_trips() {
        let body: Vec<u8> = (0u8..=255).collect();
        let payload = encode_command("blob", 7, &body);
        let frame = parse_message(&payload).unwrap();
        assert_eq!(&payload[frame.body], &body[..]);
    }
}
