//! Endpoints: QUIC engines bound to a UDP socket and driven on the loop.
//!
//! The endpoint's state lives on the loop thread; the public [`Endpoint`] is
//! a handle whose operations dispatch onto the loop, and whose last drop
//! dispatches teardown there too. Datagram ingest, engine timers, stream
//! event fan-out, and the BT timeout sweep all run here.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use loon::{CallerId, Loop, Ticker, TickerOptions, UdpToken};
use quinn_proto::StreamId;

use crate::btstream::{self, BtRequestStream, BtStreamState};
use crate::config::{ClientTls, EndpointOptions, ServerTls};
use crate::connection::{ConnState, Connection, ConnectOptions, ListenOptions};
use crate::engine::{ConnKey, EngineEvent, QuicEngine, RecvOutcome};
use crate::error::{Error, close_code};
use crate::stream::{RawCloseFn, RawDataFn, Stream};

pub(crate) use crate::registry::with_endpoint;

/// How often engine timers (loss detection, idle timeout, ...) are driven.
const ENGINE_TIMER_INTERVAL: Duration = Duration::from_millis(10);

fn next_endpoint_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Lightweight reference to an endpoint: enough to dispatch jobs and build
/// further handles. Carries no ownership — teardown belongs to [`Endpoint`].
#[derive(Clone)]
pub(crate) struct EndpointRef {
    pub(crate) id: u64,
    pub(crate) event_loop: Arc<Loop>,
    pub(crate) local: SocketAddr,
}

/// How peer-initiated streams are handled.
pub(crate) enum StreamPolicy {
    /// Stop incoming streams with [`close_code::STREAM_REJECTED`].
    Reject,
    /// Wrap each incoming stream in a BT request stream.
    Bt,
    /// Deliver raw bytes to the shared data callback.
    Raw,
}

/// A tracked stream within a connection.
pub(crate) enum StreamEntry {
    Raw,
    Bt(BtStreamState),
}

/// Events queued for dispatch outside the state borrow.
pub(crate) enum AppEvent {
    Established(ConnKey),
    IncomingConn(ConnKey),
    BtOpened { conn: ConnKey, stream: StreamId },
    StreamData { conn: ConnKey, stream: StreamId, chunks: Vec<Bytes> },
    StreamClosed { conn: ConnKey, stream: StreamId, code: u64 },
    ConnClosed { conn: ConnKey, code: u64 },
}

/// Loop-confined endpoint state.
pub(crate) struct EndpointState {
    id: u64,
    local: SocketAddr,
    event_loop: Weak<Loop>,
    engine: QuicEngine,
    udp: UdpToken,
    conns: HashMap<ConnKey, ConnState>,
    pending: VecDeque<AppEvent>,
    policy: StreamPolicy,
    on_connection: Option<Box<dyn FnMut(Connection) + Send>>,
    on_bt_open: Option<Box<dyn FnMut(BtRequestStream) + Send>>,
    raw_on_data: Option<Arc<RawDataFn>>,
    raw_on_close: Option<Arc<RawCloseFn>>,
    /// Engine timer + BT sweep tickers; held so they live with the endpoint.
    tickers: Vec<Ticker>,
}

impl EndpointState {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn local(&self) -> SocketAddr {
        self.local
    }

    pub(crate) fn loop_weak(&self) -> Weak<Loop> {
        self.event_loop.clone()
    }

    pub(crate) fn engine_mut(&mut self) -> &mut QuicEngine {
        &mut self.engine
    }

    fn make_ref(&self) -> Option<EndpointRef> {
        Some(EndpointRef {
            id: self.id,
            event_loop: self.event_loop.upgrade()?,
            local: self.local,
        })
    }

    pub(crate) fn remote_of(&self, conn: ConnKey) -> Option<SocketAddr> {
        self.engine.remote_addr(conn)
    }

    pub(crate) fn stream_entry_mut(
        &mut self,
        conn: ConnKey,
        stream: StreamId,
    ) -> Option<&mut StreamEntry> {
        self.conns.get_mut(&conn)?.streams.get_mut(&stream)
    }

    /// Remote address recorded at connection setup, before the engine knows
    /// the connection (pre-handshake outbound case).
    pub(crate) fn conn_remote_hint(&self, conn: ConnKey) -> Option<SocketAddr> {
        self.conns.get(&conn)?.remote
    }

    pub(crate) fn insert_stream_entry(
        &mut self,
        conn: ConnKey,
        stream: StreamId,
        entry: StreamEntry,
    ) {
        if let Some(state) = self.conns.get_mut(&conn) {
            state.streams.insert(stream, entry);
        }
    }

    pub(crate) fn take_stream_entry(
        &mut self,
        conn: ConnKey,
        stream: StreamId,
    ) -> Option<StreamEntry> {
        self.conns.get_mut(&conn)?.streams.remove(&stream)
    }

    pub(crate) fn bt_stream_ids(&self) -> Vec<(ConnKey, StreamId)> {
        let mut ids = Vec::new();
        for (&conn, state) in &self.conns {
            for (&stream, entry) in &state.streams {
                if matches!(entry, StreamEntry::Bt(_)) {
                    ids.push((conn, stream));
                }
            }
        }
        ids
    }

    /// Translate engine events into app events, applying the incoming-stream
    /// policy. Runs under the state borrow; dispatch happens outside it.
    fn translate_events(&mut self) {
        while let Some(event) = self.engine.poll_event() {
            match event {
                EngineEvent::Connected(conn) => {
                    self.pending.push_back(AppEvent::Established(conn));
                }
                EngineEvent::Incoming(conn) => {
                    let remote = self.engine.remote_addr(conn);
                    self.conns.insert(conn, ConnState::incoming(remote));
                    self.pending.push_back(AppEvent::IncomingConn(conn));
                }
                EngineEvent::StreamOpened { conn, stream } => {
                    let Some(state) = self.conns.get_mut(&conn) else {
                        continue;
                    };
                    match self.policy {
                        StreamPolicy::Reject => {
                            tracing::debug!(?stream, "rejecting peer-initiated stream");
                            self.engine
                                .stream_close(conn, stream, close_code::STREAM_REJECTED);
                        }
                        StreamPolicy::Bt => {
                            state
                                .streams
                                .insert(stream, StreamEntry::Bt(BtStreamState::new()));
                            self.pending.push_back(AppEvent::BtOpened { conn, stream });
                        }
                        StreamPolicy::Raw => {
                            state.streams.insert(stream, StreamEntry::Raw);
                        }
                    }
                }
                EngineEvent::StreamReadable { conn, stream } => {
                    match self.engine.stream_recv(conn, stream) {
                        RecvOutcome::Data { chunks, fin } => {
                            if !chunks.is_empty() {
                                self.pending
                                    .push_back(AppEvent::StreamData { conn, stream, chunks });
                            }
                            if fin {
                                self.pending.push_back(AppEvent::StreamClosed {
                                    conn,
                                    stream,
                                    code: close_code::SHUTDOWN,
                                });
                            }
                        }
                        RecvOutcome::Reset(code) => {
                            self.pending
                                .push_back(AppEvent::StreamClosed { conn, stream, code });
                        }
                        RecvOutcome::Closed => {}
                    }
                }
                EngineEvent::ConnectionClosed { conn, reason } => {
                    let code = match &reason {
                        quinn_proto::ConnectionError::ApplicationClosed(app) => {
                            app.error_code.into_inner()
                        }
                        _ => {
                            tracing::debug!(%reason, "connection lost");
                            u64::MAX
                        }
                    };
                    self.pending.push_back(AppEvent::ConnClosed { conn, code });
                }
            }
        }
    }
}

// ── Loop-side driver functions ───────────────────────────────────────

/// UDP receive path: feed the engine, then pump events and packets.
pub(crate) fn ingest(id: u64, data: &[u8], peer: SocketAddr) {
    eprintln!("DEBUG ingest {} bytes from {:?}", data.len(), peer);
    let fed = with_endpoint(id, |ep| {
        ep.engine.handle_datagram(Instant::now(), data, peer);
    });
    if fed.is_some() {
        pump(id);
    }
}

/// Engine timer tick.
pub(crate) fn drive(id: u64) {
    let drove = with_endpoint(id, |ep| ep.engine.drive_timers(Instant::now()));
    if drove.is_some() {
        pump(id);
    }
}

/// Drain engine events and dispatch them until quiescent, flushing outgoing
/// packets between rounds.
pub(crate) fn pump(id: u64) {
    loop {
        let event = with_endpoint(id, |ep| {
            ep.translate_events();
            ep.pending.pop_front()
        });
        flush_packets(id);
        match event.flatten() {
            Some(event) => dispatch_event(id, event),
            None => break,
        }
    }
}

/// Hand every queued outgoing packet to the loop's UDP socket.
pub(crate) fn flush_packets(id: u64) {
    let batch = with_endpoint(id, |ep| {
        let mut packets = Vec::new();
        while let Some(packet) = ep.engine.poll_send() {
            packets.push(packet);
        }
        (ep.make_ref(), ep.udp, packets)
    });
    let Some((Some(ep_ref), token, packets)) = batch else {
        return;
    };
    for (dest, data) in packets {
        let _ = ep_ref.event_loop.udp_send(token, dest, &data);
    }
}

/// Close one stream with an application code, failing BT requests in flight.
pub(crate) fn close_stream(id: u64, conn: ConnKey, stream: StreamId, code: u64) {
    let entry = with_endpoint(id, |ep| {
        ep.engine.stream_close(conn, stream, code);
        (ep.take_stream_entry(conn, stream), ep.bt_sender(conn, stream))
    });
    if let Some((Some(StreamEntry::Bt(mut st)), sender)) = entry {
        for fail in st.drain_on_close(&sender, code) {
            fail();
        }
    }
    flush_packets(id);
}

fn dispatch_event(id: u64, event: AppEvent) {
    match event {
        AppEvent::Established(conn) => {
            let hit = with_endpoint(id, |ep| {
                let cb = ep.conns.get_mut(&conn).and_then(|c| c.on_established.take());
                (cb, ep.make_ref())
            });
            if let Some((Some(cb), Some(ep_ref))) = hit {
                cb(Connection::new(ep_ref, conn));
            }
        }
        AppEvent::IncomingConn(conn) => {
            let hit = with_endpoint(id, |ep| (ep.on_connection.take(), ep.make_ref()));
            if let Some((Some(mut cb), Some(ep_ref))) = hit {
                cb(Connection::new(ep_ref, conn));
                with_endpoint(id, |ep| {
                    if ep.on_connection.is_none() {
                        ep.on_connection = Some(cb);
                    }
                });
            }
        }
        AppEvent::BtOpened { conn, stream } => {
            let hit = with_endpoint(id, |ep| (ep.on_bt_open.take(), ep.make_ref()));
            if let Some((Some(mut cb), Some(ep_ref))) = hit {
                cb(BtRequestStream { ep: ep_ref, conn, stream });
                with_endpoint(id, |ep| {
                    if ep.on_bt_open.is_none() {
                        ep.on_bt_open = Some(cb);
                    }
                });
            }
        }
        AppEvent::StreamData { conn, stream, chunks } => {
            dispatch_stream_data(id, conn, stream, chunks);
        }
        AppEvent::StreamClosed { conn, stream, code } => {
            let taken = with_endpoint(id, |ep| {
                (
                    ep.take_stream_entry(conn, stream),
                    ep.bt_sender(conn, stream),
                    ep.raw_on_close.clone(),
                    ep.make_ref(),
                )
            });
            let Some((entry, sender, raw_close, ep_ref)) = taken else {
                return;
            };
            match entry {
                Some(StreamEntry::Bt(mut st)) => {
                    for fail in st.drain_on_close(&sender, code) {
                        fail();
                    }
                }
                Some(StreamEntry::Raw) => {
                    if let (Some(cb), Some(ep_ref)) = (raw_close, ep_ref) {
                        cb(Stream::new(ep_ref, conn, stream), code);
                    }
                }
                _ => {}
            }
        }
        AppEvent::ConnClosed { conn, code } => {
            let taken = with_endpoint(id, |ep| {
                let state = ep.conns.remove(&conn);
                (state, ep.raw_on_close.clone(), ep.make_ref())
            });
            let Some((Some(mut state), raw_close, ep_ref)) = taken else {
                return;
            };
            for (stream, entry) in state.streams.drain() {
                match entry {
                    StreamEntry::Bt(mut st) => {
                        let sender = match with_endpoint(id, |ep| ep.bt_sender(conn, stream)) {
                            Some(s) => s,
                            None => return,
                        };
                        for fail in st.drain_on_close(&sender, code) {
                            fail();
                        }
                    }
                    StreamEntry::Raw => {
                        if let (Some(cb), Some(ep_ref)) = (&raw_close, &ep_ref) {
                            cb(Stream::new(ep_ref.clone(), conn, stream), code);
                        }
                    }
                    _ => {}
                }
            }
            if let (Some(cb), Some(ep_ref)) = (state.on_closed.take(), ep_ref) {
                cb(Connection::new(ep_ref, conn), code);
            }
        }
    }
}

fn dispatch_stream_data(id: u64, conn: ConnKey, stream: StreamId, chunks: Vec<Bytes>) {
    enum Kind {
        Bt,
        Raw(Option<Arc<RawDataFn>>, Option<EndpointRef>),
    }

    let kind = with_endpoint(id, |ep| {
        let is_bt = match ep.stream_entry_mut(conn, stream) {
            Some(StreamEntry::Bt(_)) => true,
            Some(StreamEntry::Raw) => false,
            None => return None,
        };
        if is_bt {
            Some(Kind::Bt)
        } else {
            Some(Kind::Raw(ep.raw_on_data.clone(), ep.make_ref()))
        }
    });

    match kind.flatten() {
        Some(Kind::Bt) => btstream::process_stream_data(id, conn, stream, chunks),
        Some(Kind::Raw(Some(cb), Some(ep_ref))) => {
            for chunk in &chunks {
                cb(Stream::new(ep_ref.clone(), conn, stream), chunk);
            }
        }
        _ => {}
    }
}

// ── Construction and the public handle ───────────────────────────────

/// Create an endpoint on `event_loop`, bound to `local_addr`. Tickers are
/// tagged with `caller` so the owning network can tear them down.
pub(crate) fn create_endpoint(
    event_loop: &Arc<Loop>,
    local_addr: SocketAddr,
    opts: EndpointOptions,
    caller: CallerId,
) -> Result<Endpoint, Error> {
    let socket = std::net::UdpSocket::bind(local_addr)?;
    let local = socket.local_addr()?;
    let id = next_endpoint_id();

    let weak_loop = Arc::downgrade(event_loop);
    let ev = event_loop.clone();
    let setup: Result<(), Error> = event_loop.call_get(move || {
        let token = ev.add_udp_socket(socket, move |data, peer| ingest(id, data, peer))?;

        let mut state = EndpointState {
            id,
            local,
            event_loop: weak_loop,
            engine: QuicEngine::new(local, None, &opts),
            udp: token,
            conns: HashMap::new(),
            pending: VecDeque::new(),
            policy: StreamPolicy::Reject,
            on_connection: None,
            on_bt_open: None,
            raw_on_data: None,
            raw_on_close: None,
            tickers: Vec::new(),
        };

        let ticker_opts = TickerOptions { caller, ..TickerOptions::default() };
        state
            .tickers
            .push(ev.call_every(ENGINE_TIMER_INTERVAL, ticker_opts, move || drive(id))?);
        state.tickers.push(ev.call_every(
            btstream::TIMEOUT_SWEEP_INTERVAL,
            ticker_opts,
            move || btstream::sweep_timeouts(id),
        )?);

        crate::registry::install(id, state);
        tracing::debug!(%local, "endpoint installed");
        Ok(())
    })?;
    setup?;

    Ok(Endpoint {
        owner: Arc::new(EndpointOwner {
            r: EndpointRef {
                id,
                event_loop: event_loop.clone(),
                local,
            },
        }),
    })
}

/// A bound UDP address hosting QUIC connections on a loop.
///
/// Cloneable handle; the endpoint is torn down (connections closed, socket
/// removed) when the last handle drops.
#[derive(Clone)]
pub struct Endpoint {
    owner: Arc<EndpointOwner>,
}

struct EndpointOwner {
    r: EndpointRef,
}

impl Endpoint {
    /// The bound local address.
    pub fn local(&self) -> SocketAddr {
        self.owner.r.local
    }

    /// Accept inbound connections with the given TLS credentials and
    /// incoming-stream policy.
    pub fn listen(&self, tls: ServerTls, opts: ListenOptions) -> Result<(), Error> {
        let id = self.owner.r.id;
        self.owner.r.event_loop.call_get(move || {
            with_endpoint(id, |ep| {
                ep.engine.set_server_config(tls.config.clone());
                ep.policy = opts.policy;
                ep.on_connection = opts.on_connection;
                ep.on_bt_open = opts.on_bt_open;
                ep.raw_on_data = opts.raw_on_data;
                ep.raw_on_close = opts.raw_on_close;
                tracing::debug!("endpoint listening");
            })
            .ok_or(Error::InvalidConnection)
        })?
    }

    /// Initiate an outbound connection. The handle is returned immediately;
    /// `opts.on_established` fires once the handshake completes.
    pub fn connect(
        &self,
        remote: SocketAddr,
        tls: ClientTls,
        opts: ConnectOptions,
    ) -> Result<Connection, Error> {
        let id = self.owner.r.id;
        let ep_ref = self.owner.r.clone();
        let key: Result<ConnKey, Error> = self.owner.r.event_loop.call_get(move || {
            let key = with_endpoint(id, |ep| {
                let key =
                    ep.engine
                        .connect(Instant::now(), tls.config.clone(), remote, &opts.server_name)?;
                ep.conns.insert(key, ConnState::outbound(remote, opts));
                Ok::<ConnKey, Error>(key)
            })
            .ok_or(Error::InvalidConnection)??;
            flush_packets(id);
            Ok(key)
        })?;
        Ok(Connection::new(ep_ref, key?))
    }

    /// Gracefully close every connection on this endpoint.
    pub fn close_connections(&self) -> Result<(), Error> {
        let id = self.owner.r.id;
        self.owner.r.event_loop.call_get(move || {
            with_endpoint(id, |ep| {
                ep.engine
                    .close_all(Instant::now(), close_code::SHUTDOWN, b"shutdown");
            });
            pump(id);
        })?;
        Ok(())
    }

    /// Number of live connections (diagnostic).
    pub fn connection_count(&self) -> Result<usize, Error> {
        let id = self.owner.r.id;
        self.owner
            .r
            .event_loop
            .call_get(move || with_endpoint(id, |ep| ep.engine.connection_count()))?
            .ok_or(Error::InvalidConnection)
    }
}

impl Drop for EndpointOwner {
    fn drop(&mut self) {
        let id = self.r.id;
        let ev = self.r.event_loop.clone();
        let _ = self.r.event_loop.call(move || {
            let token = with_endpoint(id, |ep| {
                ep.engine
                    .close_all(Instant::now(), close_code::SHUTDOWN, b"endpoint closed");
                ep.udp
            });
            flush_packets(id);
            crate::registry::remove(id);
            if let Some(token) = token {
                ev.remove_udp_socket(token);
            }
            tracing::debug!("endpoint removed");
        });
    }
}
