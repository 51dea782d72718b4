//! BT request streams: request/response RPC over a single QUIC stream.
//!
//! Outbound commands get a stream-local, strictly increasing request id and
//! an optional reply callback with a deadline. Inbound bytes run through the
//! incremental frame parser; responses are matched to in-flight requests by
//! binary search over the id-sorted list, commands are dispatched to a
//! registered handler table. A periodic sweep on the owning loop fails
//! requests whose deadline passed.
//!
//! User callbacks always run with no endpoint borrow outstanding — the
//! callback being invoked is individually checked out of the stream state —
//! so handlers may call `respond`, `command`, or `register_command`
//! synchronously.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::Weak;
use std::time::{Duration, Instant};

use bytes::Bytes;
use protocol_bt::{
    BtFrame, FrameAccumulator, FrameError, MAX_REQ_LEN, MessageKind, encode_command,
    encode_response, frame, parse_message,
};
use quinn_proto::StreamId;

use crate::endpoint::{EndpointRef, EndpointState, StreamEntry, with_endpoint};
use crate::engine::ConnKey;
use crate::error::{Error, close_code};
use crate::metrics;

/// How long a command with a reply callback waits before it is failed.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the owning endpoint sweeps in-flight requests for expiry.
pub(crate) const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_millis(25);

type ReplyFn = Box<dyn FnOnce(BtMessage) + Send>;

/// An in-flight request awaiting a response.
pub(crate) struct SentRequest {
    rid: i64,
    expiry: Instant,
    reply: ReplyFn,
}

/// Loop-confined state of one BT request stream.
pub(crate) struct BtStreamState {
    next_rid: i64,
    /// Sorted by rid: ids are allocated monotonically, entries appended.
    sent: VecDeque<SentRequest>,
    handlers: HashMap<String, Box<dyn FnMut(BtMessage) + Send>>,
    acc: FrameAccumulator,
    close_cb: Option<Box<dyn FnOnce(u64) + Send>>,
}

impl BtStreamState {
    pub(crate) fn new() -> Self {
        BtStreamState {
            next_rid: 0,
            sent: VecDeque::new(),
            handlers: HashMap::new(),
            acc: FrameAccumulator::new(),
            close_cb: None,
        }
    }

    /// Fail every in-flight request with a timed-out marker, plus the close
    /// callback if one is set. Returned closures run outside any borrow.
    pub(crate) fn drain_on_close(
        &mut self,
        sender: &BtSender,
        code: u64,
    ) -> Vec<Box<dyn FnOnce() + Send>> {
        let mut out: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        while let Some(req) = self.sent.pop_front() {
            let msg = BtMessage::timed_out_msg(req.rid, sender.clone());
            let reply = req.reply;
            out.push(Box::new(move || reply(msg)));
        }
        if let Some(close_cb) = self.close_cb.take() {
            out.push(Box::new(move || close_cb(code)));
        }
        out
    }
}

/// A message delivered to a command handler or reply callback.
///
/// Owns its backing payload; `endpoint()` and `body()` are offset views into
/// it, so the message can be cloned or sent across threads freely. Carries a
/// weak back-reference to its stream so [`respond`](Self::respond) works at
/// any later time.
#[derive(Clone)]
pub struct BtMessage {
    req_id: i64,
    kind: MessageKind,
    data: Bytes,
    endpoint: Range<usize>,
    body: Range<usize>,
    timed_out: bool,
    sender: BtSender,
}

impl BtMessage {
    fn from_frame(data: Bytes, frame: BtFrame, sender: BtSender) -> Self {
        BtMessage {
            req_id: frame.req_id,
            kind: frame.kind,
            data,
            endpoint: frame.endpoint,
            body: frame.body,
            timed_out: false,
            sender,
        }
    }

    /// Synthesized locally when a request's deadline passes or its stream
    /// closes with the request still in flight.
    fn timed_out_msg(req_id: i64, sender: BtSender) -> Self {
        BtMessage {
            req_id,
            kind: MessageKind::Error,
            data: Bytes::new(),
            endpoint: 0..0,
            body: 0..0,
            timed_out: true,
            sender,
        }
    }

    pub fn req_id(&self) -> i64 {
        self.req_id
    }

    /// The endpoint name a command was addressed to (empty for responses).
    pub fn endpoint(&self) -> &[u8] {
        &self.data[self.endpoint.clone()]
    }

    pub fn endpoint_str(&self) -> String {
        String::from_utf8_lossy(self.endpoint()).into_owned()
    }

    pub fn body(&self) -> &[u8] {
        &self.data[self.body.clone()]
    }

    /// Zero-copy slice of the body, sharing the message's backing buffer.
    pub fn body_bytes(&self) -> Bytes {
        self.data.slice(self.body.clone())
    }

    /// Whether the remote answered with an error response.
    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error && !self.timed_out
    }

    /// Whether this is a locally synthesized timeout (or stream-close)
    /// failure rather than a remote reply.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Success marker: neither timed out nor an error response.
    pub fn ok(&self) -> bool {
        !self.timed_out && self.kind != MessageKind::Error
    }

    /// Send a response to this message's request id. Usable from any thread,
    /// at any later time; fails once the loop is gone.
    pub fn respond(&self, body: impl Into<Bytes>, is_error: bool) -> Result<(), Error> {
        self.sender.respond(self.req_id, body.into(), is_error)
    }

    /// The stream this message arrived on, if it is still reachable.
    pub fn stream(&self) -> Option<BtRequestStream> {
        self.sender.stream()
    }
}

/// Weak back-reference from a message to its stream.
#[derive(Clone)]
pub(crate) struct BtSender {
    event_loop: Weak<loon::Loop>,
    endpoint_id: u64,
    local: std::net::SocketAddr,
    conn: ConnKey,
    stream: StreamId,
}

impl BtSender {
    fn respond(&self, rid: i64, body: Bytes, is_error: bool) -> Result<(), Error> {
        let Some(event_loop) = self.event_loop.upgrade() else {
            return Err(Error::Loop(loon::Error::Shutdown));
        };
        let id = self.endpoint_id;
        let (conn, stream) = (self.conn, self.stream);
        event_loop.call(move || {
            with_endpoint(id, |ep| ep.bt_send_response(conn, stream, rid, &body, is_error));
            crate::endpoint::flush_packets(id);
        })?;
        Ok(())
    }

    fn stream(&self) -> Option<BtRequestStream> {
        let event_loop = self.event_loop.upgrade()?;
        Some(BtRequestStream {
            ep: EndpointRef {
                id: self.endpoint_id,
                event_loop,
                local: self.local,
            },
            conn: self.conn,
            stream: self.stream,
        })
    }
}

/// Options for [`BtRequestStream::command`].
#[derive(Default)]
pub struct CommandOptions {
    pub(crate) reply: Option<ReplyFn>,
    pub(crate) timeout: Option<Duration>,
}

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect a response; `f` is invoked exactly once with the reply, an
    /// error reply, or a timed-out marker.
    pub fn reply(mut self, f: impl FnOnce(BtMessage) + Send + 'static) -> Self {
        self.reply = Some(Box::new(f));
        self
    }

    /// Deadline for the reply. Defaults to [`DEFAULT_REQUEST_TIMEOUT`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Handle to a BT request stream.
///
/// Cheap to clone; all operations dispatch onto the owning loop. The stream
/// itself lives in the endpoint until it (or its connection) closes.
#[derive(Clone)]
pub struct BtRequestStream {
    pub(crate) ep: EndpointRef,
    pub(crate) conn: ConnKey,
    pub(crate) stream: StreamId,
}

impl BtRequestStream {
    /// Invoke a remote endpoint. With [`CommandOptions::reply`] this becomes
    /// a request: the callback fires with the response or a timed-out
    /// marker. Without it the command is fire-and-forget.
    pub fn command(
        &self,
        endpoint: impl Into<String>,
        body: impl Into<Bytes>,
        opts: CommandOptions,
    ) -> Result<(), Error> {
        let endpoint = endpoint.into();
        let body = body.into();
        if body.len() > MAX_REQ_LEN {
            return Err(Error::BodyTooLong);
        }
        let (id, conn, stream) = (self.ep.id, self.conn, self.stream);
        self.ep.event_loop.call(move || {
            let failure = with_endpoint(id, |ep| {
                ep.bt_send_command(conn, stream, &endpoint, body, opts)
            })
            .flatten();
            crate::endpoint::flush_packets(id);
            if let Some(fail) = failure {
                fail();
            }
        })?;
        Ok(())
    }

    /// Register a handler for inbound commands addressed to `name`.
    pub fn register_command(
        &self,
        name: impl Into<String>,
        handler: impl FnMut(BtMessage) + Send + 'static,
    ) -> Result<(), Error> {
        let name = name.into();
        let handler = Box::new(handler);
        let (id, conn, stream) = (self.ep.id, self.conn, self.stream);
        self.ep.event_loop.call(move || {
            with_endpoint(id, |ep| {
                if let Some(st) = ep.bt_state_mut(conn, stream) {
                    st.handlers.insert(name, handler);
                }
            });
        })?;
        Ok(())
    }

    /// Send a response for `req_id` directly (the usual path is
    /// [`BtMessage::respond`]).
    pub fn respond(&self, req_id: i64, body: impl Into<Bytes>, is_error: bool) -> Result<(), Error> {
        let body = body.into();
        let (id, conn, stream) = (self.ep.id, self.conn, self.stream);
        self.ep.event_loop.call(move || {
            with_endpoint(id, |ep| ep.bt_send_response(conn, stream, req_id, &body, is_error));
            crate::endpoint::flush_packets(id);
        })?;
        Ok(())
    }

    /// Install a callback invoked once when the stream closes, with the
    /// application close code.
    pub fn set_close_callback(
        &self,
        f: impl FnOnce(u64) + Send + 'static,
    ) -> Result<(), Error> {
        let f = Box::new(f);
        let (id, conn, stream) = (self.ep.id, self.conn, self.stream);
        self.ep.event_loop.call(move || {
            with_endpoint(id, |ep| {
                if let Some(st) = ep.bt_state_mut(conn, stream) {
                    st.close_cb = Some(f);
                }
            });
        })?;
        Ok(())
    }

    /// Close the stream with an application code. Outstanding requests fail
    /// with a timed-out marker.
    pub fn close(&self, code: u64) -> Result<(), Error> {
        let (id, conn, stream) = (self.ep.id, self.conn, self.stream);
        self.ep.event_loop.call(move || {
            crate::endpoint::close_stream(id, conn, stream, code);
        })?;
        Ok(())
    }

    /// Remote address of the underlying connection.
    pub fn remote(&self) -> Result<std::net::SocketAddr, Error> {
        let (id, conn) = (self.ep.id, self.conn);
        self.ep
            .event_loop
            .call_get(move || {
                with_endpoint(id, |ep| ep.remote_of(conn)).flatten()
            })?
            .ok_or(Error::InvalidConnection)
    }
}

// ── Loop-side plumbing (EndpointState extensions) ────────────────────

impl EndpointState {
    pub(crate) fn bt_state_mut(
        &mut self,
        conn: ConnKey,
        stream: StreamId,
    ) -> Option<&mut BtStreamState> {
        match self.stream_entry_mut(conn, stream)? {
            StreamEntry::Bt(st) => Some(st),
            _ => None,
        }
    }

    pub(crate) fn bt_sender(&self, conn: ConnKey, stream: StreamId) -> BtSender {
        BtSender {
            event_loop: self.loop_weak(),
            endpoint_id: self.id(),
            local: self.local(),
            conn,
            stream,
        }
    }

    /// Allocate a request id, encode, track, and send a command.
    /// Returns a failure closure to run (with no borrow held) if the send
    /// could not be made and a reply was expected.
    pub(crate) fn bt_send_command(
        &mut self,
        conn: ConnKey,
        stream: StreamId,
        endpoint: &str,
        body: Bytes,
        opts: CommandOptions,
    ) -> Option<Box<dyn FnOnce() + Send>> {
        let sender = self.bt_sender(conn, stream);
        let fail = |reply: ReplyFn, rid: i64| -> Box<dyn FnOnce() + Send> {
            let msg = BtMessage::timed_out_msg(rid, sender.clone());
            Box::new(move || reply(msg))
        };

        let Some(st) = self.bt_state_mut(conn, stream) else {
            tracing::debug!("command on a closed BT stream");
            return opts.reply.map(|r| fail(r, -1));
        };

        let rid = st.next_rid;
        st.next_rid += 1;
        eprintln!("DEBUG bt_send_command rid={rid} endpoint={endpoint}");

        let payload = encode_command(endpoint, rid, &body);
        if payload.len() > MAX_REQ_LEN {
            tracing::warn!(rid, "encoded command exceeds maximum message size");
            return opts.reply.map(|r| fail(r, rid));
        }
        let wire = frame(&payload);

        if let Some(reply) = opts.reply {
            let expiry = Instant::now() + opts.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
            st.sent.push_back(SentRequest { rid, expiry, reply });
        }
        metrics::BT_REQUESTS_SENT.increment();

        if self
            .engine_mut()
            .stream_send(Instant::now(), conn, stream, wire.into())
            .is_err()
        {
            // Connection died under us; fail the request we just queued.
            if let Some(st) = self.bt_state_mut(conn, stream)
                && let Some(req) = st.sent.pop_back()
            {
                return Some(fail(req.reply, rid));
            }
        }
        None
    }

    pub(crate) fn bt_send_response(
        &mut self,
        conn: ConnKey,
        stream: StreamId,
        rid: i64,
        body: &[u8],
        is_error: bool,
    ) {
        if self.bt_state_mut(conn, stream).is_none() {
            tracing::debug!(rid, "response for a closed BT stream dropped");
            return;
        }
        let wire = frame(&encode_response(rid, body, is_error));
        let _ = self
            .engine_mut()
            .stream_send(Instant::now(), conn, stream, wire.into());
    }

    /// Pop expired requests, oldest first, across every BT stream. Ids grow
    /// with time, so each walk stops at the first unexpired entry.
    pub(crate) fn bt_collect_expired(&mut self, now: Instant) -> Vec<Box<dyn FnOnce() + Send>> {
        let mut due: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        for (conn, stream) in self.bt_stream_ids() {
            let sender = self.bt_sender(conn, stream);
            let Some(st) = self.bt_state_mut(conn, stream) else {
                continue;
            };
            while let Some(front) = st.sent.front() {
                if front.expiry > now {
                    break;
                }
                let req = st.sent.pop_front().expect("front exists");
                let msg = BtMessage::timed_out_msg(req.rid, sender.clone());
                let reply = req.reply;
                tracing::debug!(rid = msg.req_id, "request timed out");
                metrics::BT_TIMEOUTS.increment();
                due.push(Box::new(move || reply(msg)));
            }
        }
        due
    }
}

// ── Inbound data path ────────────────────────────────────────────────

/// Feed received chunks through the stream's frame parser and dispatch the
/// resulting messages. The stream state stays installed; only the specific
/// callback being invoked is checked out around the call.
pub(crate) fn process_stream_data(id: u64, conn: ConnKey, stream: StreamId, chunks: Vec<Bytes>) {
    for chunk in chunks {
        let frames = with_endpoint(id, |ep| {
            ep.bt_state_mut(conn, stream).map(|st| st.acc.push(&chunk))
        });
        let frames = match frames.flatten() {
            Some(Ok(frames)) => frames,
            Some(Err(error)) => {
                fail_protocol(id, conn, stream, &error);
                return;
            }
            None => return, // stream or endpoint gone
        };

        for payload in frames {
            match parse_message(&payload) {
                Ok(frame) => dispatch_frame(id, conn, stream, payload, frame),
                Err(error) => {
                    fail_protocol(id, conn, stream, &error);
                    return;
                }
            }
        }
    }
}

fn dispatch_frame(id: u64, conn: ConnKey, stream: StreamId, payload: Bytes, frame: BtFrame) {
    eprintln!("DEBUG dispatch_frame kind={:?} rid={}", frame.kind, frame.req_id);
    match frame.kind {
        MessageKind::Response | MessageKind::Error => {
            let req_id = frame.req_id;
            let hit = with_endpoint(id, |ep| {
                let sender = ep.bt_sender(conn, stream);
                let reply = ep.bt_state_mut(conn, stream).and_then(|st| {
                    match st.sent.binary_search_by(|req| req.rid.cmp(&req_id)) {
                        Ok(pos) => st.sent.remove(pos).map(|req| req.reply),
                        Err(_) => None,
                    }
                });
                (reply, sender)
            });
            match hit {
                Some((Some(reply), sender)) => {
                    metrics::BT_RESPONSES_MATCHED.increment();
                    reply(BtMessage::from_frame(payload, frame, sender));
                }
                Some((None, _)) => {
                    metrics::BT_RESPONSES_UNMATCHED.increment();
                    tracing::debug!(rid = req_id, "dropping unsolicited response");
                }
                None => {}
            }
        }
        MessageKind::Command => {
            let name = String::from_utf8_lossy(&payload[frame.endpoint.clone()]).into_owned();
            let taken = with_endpoint(id, |ep| {
                let sender = ep.bt_sender(conn, stream);
                let handler = ep
                    .bt_state_mut(conn, stream)
                    .and_then(|st| st.handlers.remove(&name));
                (handler, sender)
            });
            match taken {
                Some((Some(mut handler), sender)) => {
                    handler(BtMessage::from_frame(payload, frame, sender));
                    with_endpoint(id, |ep| {
                        if let Some(st) = ep.bt_state_mut(conn, stream) {
                            // The handler may have replaced itself while it
                            // ran; the newer registration wins.
                            st.handlers.entry(name).or_insert(handler);
                        }
                    });
                }
                Some((None, _)) => {
                    tracing::debug!(endpoint = %name, "no handler for inbound command");
                }
                None => {}
            }
        }
    }
}

/// Periodic sweep entry point, driven by the endpoint's ticker.
pub(crate) fn sweep_timeouts(endpoint_id: u64) {
    let now = Instant::now();
    let due = with_endpoint(endpoint_id, |ep| ep.bt_collect_expired(now)).unwrap_or_default();
    for fail in due {
        fail();
    }
}

/// Close a BT stream for a protocol violation: reset both directions, fail
/// everything in flight, and surface the close callback.
fn fail_protocol(id: u64, conn: ConnKey, stream: StreamId, error: &FrameError) {
    metrics::BT_PROTOCOL_ERRORS.increment();
    tracing::error!(%error, "BT protocol error; closing stream");
    crate::endpoint::close_stream(id, conn, stream, close_code::BT_PROTOCOL_ERROR);
}
