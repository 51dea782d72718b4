//! Sans-IO QUIC engine.
//!
//! Wraps quinn-proto's state machine behind an event-queue API: datagrams
//! and timer ticks go in, application events and outgoing packets come out.
//! The engine does no I/O and holds no locks; the owning endpoint drives it
//! from the loop thread.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use quinn_proto::{
    ClientConfig, ConnectionError, ConnectionHandle, DatagramEvent, Dir, Event, ServerConfig,
    StreamEvent, StreamId, VarInt,
};
use slab::Slab;

use crate::config::EndpointOptions;
use crate::error::Error;

/// Identifier for a connection within one engine.
///
/// Carries a generation so a handle outliving its connection maps to
/// "invalid connection" rather than whatever reused the slab slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    index: u32,
    generation: u32,
}

/// Events surfaced to the endpoint layer.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    /// An outbound connection completed its handshake.
    Connected(ConnKey),
    /// An inbound connection completed its handshake.
    Incoming(ConnKey),
    /// The peer opened a bidirectional stream.
    StreamOpened { conn: ConnKey, stream: StreamId },
    /// Data may be available to read on a stream.
    StreamReadable { conn: ConnKey, stream: StreamId },
    /// A connection was closed or lost.
    ConnectionClosed { conn: ConnKey, reason: ConnectionError },
}

/// Result of reading a stream.
pub(crate) enum RecvOutcome {
    /// Ordered chunks, plus whether the peer finished cleanly after them.
    Data { chunks: Vec<Bytes>, fin: bool },
    /// The peer reset the stream with this application code.
    Reset(u64),
    /// The stream (or its connection) is gone.
    Closed,
}

struct WriteQueue {
    chunks: VecDeque<Bytes>,
    /// Bytes of the front chunk already accepted by quinn.
    offset: usize,
}

struct EngineConnection {
    handle: ConnectionHandle,
    conn: quinn_proto::Connection,
    generation: u32,
    outbound: bool,
    /// Flow-blocked stream data, drained on writable events.
    write_queues: HashMap<StreamId, WriteQueue>,
}

pub(crate) struct QuicEngine {
    endpoint: quinn_proto::Endpoint,
    connections: Slab<EngineConnection>,
    /// Maps `ConnectionHandle.0` → slab key. Grows as needed.
    handle_map: Vec<Option<u32>>,
    events: VecDeque<EngineEvent>,
    /// Outgoing UDP packets waiting to be sent.
    send_queue: VecDeque<(SocketAddr, Vec<u8>)>,
    transmit_buf: Vec<u8>,
    response_buf: Vec<u8>,
    local_addr: SocketAddr,
    send_queue_capacity: usize,
    next_generation: u32,
}

impl QuicEngine {
    pub(crate) fn new(
        local_addr: SocketAddr,
        server_config: Option<Arc<ServerConfig>>,
        opts: &EndpointOptions,
    ) -> Self {
        let endpoint = quinn_proto::Endpoint::new(
            Default::default(),
            server_config,
            opts.allow_mtud,
            opts.rng_seed,
        );
        QuicEngine {
            endpoint,
            connections: Slab::new(),
            handle_map: Vec::new(),
            events: VecDeque::new(),
            send_queue: VecDeque::new(),
            transmit_buf: Vec::with_capacity(1500),
            response_buf: Vec::with_capacity(1500),
            local_addr,
            send_queue_capacity: opts.send_queue_capacity,
            next_generation: 0,
        }
    }

    /// Install (or replace) the server-side TLS config, enabling inbound
    /// connections.
    pub(crate) fn set_server_config(&mut self, config: Arc<ServerConfig>) {
        self.endpoint.set_server_config(Some(config));
    }

    /// Feed an incoming UDP datagram to the QUIC state machine.
    pub(crate) fn handle_datagram(&mut self, now: Instant, data: &[u8], peer: SocketAddr) {
        let data = BytesMut::from(data);
        let event = self.endpoint.handle(
            now,
            peer,
            Some(self.local_addr.ip()),
            None, // ECN not surfaced by the loop's UDP hosting
            data,
            &mut self.response_buf,
        );

        match event {
            Some(DatagramEvent::ConnectionEvent(ch, event)) => {
                if let Some(&Some(key)) = self.handle_map.get(ch.0) {
                    let key = key as usize;
                    self.connections[key].conn.handle_event(event);
                    self.poll_connection(key, now);
                }
            }
            Some(DatagramEvent::NewConnection(incoming)) => {
                match self.endpoint.accept(incoming, now, &mut self.response_buf, None) {
                    Ok((ch, conn)) => {
                        let key = self.insert_connection(ch, conn, false);
                        self.drain_transmits(key, now);
                        self.poll_connection(key, now);
                    }
                    Err(_) => {
                        // No server config, or an early handshake failure.
                        tracing::trace!(%peer, "dropping unacceptable connection attempt");
                    }
                }
            }
            Some(DatagramEvent::Response(transmit)) => {
                // Stateless response (version negotiation, retry).
                let data = self.response_buf[..transmit.size].to_vec();
                self.queue_packet(transmit.destination, data);
            }
            None => {}
        }
    }

    /// Fire expired per-connection timeouts.
    pub(crate) fn drive_timers(&mut self, now: Instant) {
        let keys: Vec<u32> = self.connections.iter().map(|(k, _)| k as u32).collect();
        for key in keys {
            let key = key as usize;
            if !self.connections.contains(key) {
                continue;
            }
            if let Some(timeout) = self.connections[key].conn.poll_timeout()
                && timeout <= now
            {
                self.connections[key].conn.handle_timeout(now);
                self.drain_transmits(key, now);
                self.poll_connection(key, now);
            }
        }
    }

    /// Poll the next application event.
    pub(crate) fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    /// Poll the next outgoing UDP packet.
    pub(crate) fn poll_send(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.send_queue.pop_front()
    }

    /// Initiate an outbound connection. The returned key appears in a later
    /// [`EngineEvent::Connected`] once the handshake completes.
    pub(crate) fn connect(
        &mut self,
        now: Instant,
        config: ClientConfig,
        peer: SocketAddr,
        server_name: &str,
    ) -> Result<ConnKey, Error> {
        let (ch, conn) = self.endpoint.connect(now, config, peer, server_name)?;
        let key = self.insert_connection(ch, conn, true);
        self.drain_transmits(key, now);
        Ok(self.key_of(key))
    }

    /// Open a bidirectional stream.
    pub(crate) fn open_bi(&mut self, conn: ConnKey) -> Result<StreamId, Error> {
        let c = self.get_conn_mut(conn)?;
        c.conn
            .streams()
            .open(Dir::Bi)
            .ok_or(Error::StreamsExhausted)
    }

    /// Queue `data` on a stream and flush as much as flow control allows.
    pub(crate) fn stream_send(
        &mut self,
        now: Instant,
        conn: ConnKey,
        stream: StreamId,
        data: Bytes,
    ) -> Result<(), Error> {
        let key = self.slab_key(conn)?;
        {
            let c = &mut self.connections[key];
            c.write_queues
                .entry(stream)
                .or_insert_with(|| WriteQueue {
                    chunks: VecDeque::new(),
                    offset: 0,
                })
                .chunks
                .push_back(data);
        }
        self.flush_stream(key, stream);
        self.drain_transmits(key, now);
        Ok(())
    }

    /// Read everything currently available on a stream.
    pub(crate) fn stream_recv(&mut self, conn: ConnKey, stream: StreamId) -> RecvOutcome {
        let Ok(key) = self.slab_key(conn) else {
            return RecvOutcome::Closed;
        };
        let c = &mut self.connections[key];
        let mut recv = c.conn.recv_stream(stream);
        let mut reader = match recv.read(true) {
            Ok(chunks) => chunks,
            Err(_) => return RecvOutcome::Closed,
        };

        let mut chunks = Vec::new();
        let mut fin = false;
        let outcome = loop {
            match reader.next(usize::MAX) {
                Ok(Some(chunk)) => chunks.push(chunk.bytes),
                Ok(None) => {
                    fin = true;
                    break None;
                }
                Err(quinn_proto::ReadError::Blocked) => break None,
                Err(quinn_proto::ReadError::Reset(code)) => break Some(code.into_inner()),
            }
        };
        let _ = reader.finalize();

        match outcome {
            Some(code) => RecvOutcome::Reset(code),
            None => RecvOutcome::Data { chunks, fin },
        }
    }

    /// Close one stream in both directions with an application code.
    pub(crate) fn stream_close(&mut self, conn: ConnKey, stream: StreamId, code: u64) {
        let Ok(key) = self.slab_key(conn) else { return };
        let c = &mut self.connections[key];
        c.write_queues.remove(&stream);
        let code = VarInt::from_u64(code).unwrap_or(VarInt::from_u32(0));
        let _ = c.conn.send_stream(stream).reset(code);
        let _ = c.conn.recv_stream(stream).stop(code);
    }

    /// Close a connection with the given error code and reason.
    pub(crate) fn close_connection(&mut self, now: Instant, conn: ConnKey, code: u64, reason: &[u8]) {
        if let Ok(key) = self.slab_key(conn) {
            let code = VarInt::from_u64(code).unwrap_or(VarInt::from_u32(0));
            self.connections[key]
                .conn
                .close(now, code, Bytes::copy_from_slice(reason));
            self.drain_transmits(key, now);
            self.poll_connection(key, now);
        }
    }

    /// Close every connection (graceful endpoint shutdown).
    pub(crate) fn close_all(&mut self, now: Instant, code: u64, reason: &[u8]) {
        let keys: Vec<ConnKey> = self
            .connections
            .iter()
            .map(|(k, c)| ConnKey {
                index: k as u32,
                generation: c.generation,
            })
            .collect();
        for key in keys {
            self.close_connection(now, key, code, reason);
        }
    }

    pub(crate) fn remote_addr(&self, conn: ConnKey) -> Option<SocketAddr> {
        let c = self.connections.get(conn.index as usize)?;
        (c.generation == conn.generation).then(|| c.conn.remote_address())
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ── Internal helpers ─────────────────────────────────────────────

    fn key_of(&self, key: usize) -> ConnKey {
        ConnKey {
            index: key as u32,
            generation: self.connections[key].generation,
        }
    }

    fn slab_key(&self, conn: ConnKey) -> Result<usize, Error> {
        match self.connections.get(conn.index as usize) {
            Some(c) if c.generation == conn.generation => Ok(conn.index as usize),
            _ => Err(Error::InvalidConnection),
        }
    }

    fn get_conn_mut(&mut self, conn: ConnKey) -> Result<&mut EngineConnection, Error> {
        let key = self.slab_key(conn)?;
        Ok(&mut self.connections[key])
    }

    fn insert_connection(
        &mut self,
        ch: ConnectionHandle,
        conn: quinn_proto::Connection,
        outbound: bool,
    ) -> usize {
        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;
        let key = self.connections.insert(EngineConnection {
            handle: ch,
            conn,
            generation,
            outbound,
            write_queues: HashMap::new(),
        });

        let idx = ch.0;
        if idx >= self.handle_map.len() {
            self.handle_map.resize(idx + 1, None);
        }
        self.handle_map[idx] = Some(key as u32);
        key
    }

    fn remove_connection(&mut self, key: usize) {
        let ec = self.connections.remove(key);
        let idx = ec.handle.0;
        if idx < self.handle_map.len() {
            self.handle_map[idx] = None;
        }
    }

    /// Write queued stream data until quinn blocks.
    fn flush_stream(&mut self, key: usize, stream: StreamId) {
        let c = &mut self.connections[key];
        let Some(queue) = c.write_queues.get_mut(&stream) else {
            return;
        };
        while let Some(front) = queue.chunks.front() {
            let pending = &front[queue.offset..];
            if pending.is_empty() {
                queue.chunks.pop_front();
                queue.offset = 0;
                continue;
            }
            match c.conn.send_stream(stream).write(pending) {
                Ok(n) => {
                    queue.offset += n;
                    if queue.offset == front.len() {
                        queue.chunks.pop_front();
                        queue.offset = 0;
                    }
                    if n == 0 {
                        break;
                    }
                }
                Err(quinn_proto::WriteError::Blocked) => break,
                Err(_) => {
                    // Stream stopped or closed under us; drop what's left.
                    c.write_queues.remove(&stream);
                    return;
                }
            }
        }
        if queue.chunks.is_empty() {
            c.write_queues.remove(&stream);
        }
    }

    /// Drain all pending transmits from a connection into the send queue.
    fn drain_transmits(&mut self, key: usize, now: Instant) {
        loop {
            self.transmit_buf.clear();
            let transmit = self.connections[key]
                .conn
                .poll_transmit(now, 1, &mut self.transmit_buf);
            match transmit {
                Some(t) => {
                    let data = self.transmit_buf[..t.size].to_vec();
                    self.queue_packet(t.destination, data);
                }
                None => break,
            }
        }
    }

    /// Drain endpoint events and application events from a connection.
    fn poll_connection(&mut self, key: usize, now: Instant) {
        while let Some(event) = self.connections[key].conn.poll_endpoint_events() {
            if let Some(conn_event) = self
                .endpoint
                .handle_event(self.connections[key].handle, event)
            {
                self.connections[key].conn.handle_event(conn_event);
            }
        }

        self.drain_transmits(key, now);

        let conn_id = self.key_of(key);
        while let Some(event) = self.connections[key].conn.poll() {
            match event {
                Event::Connected => {
                    if self.connections[key].outbound {
                        self.events.push_back(EngineEvent::Connected(conn_id));
                    } else {
                        self.events.push_back(EngineEvent::Incoming(conn_id));
                    }
                }
                Event::ConnectionLost { reason } => {
                    self.events.push_back(EngineEvent::ConnectionClosed {
                        conn: conn_id,
                        reason,
                    });
                    self.remove_connection(key);
                    return;
                }
                Event::Stream(stream_event) => match stream_event {
                    StreamEvent::Opened { dir } => {
                        while let Some(stream) = self.connections[key].conn.streams().accept(dir) {
                            if dir == Dir::Bi {
                                self.events.push_back(EngineEvent::StreamOpened {
                                    conn: conn_id,
                                    stream,
                                });
                            }
                        }
                    }
                    StreamEvent::Readable { id } => {
                        self.events.push_back(EngineEvent::StreamReadable {
                            conn: conn_id,
                            stream: id,
                        });
                    }
                    StreamEvent::Writable { id } => {
                        // Flow control reopened; push any queued data out.
                        self.flush_stream(key, id);
                    }
                    StreamEvent::Finished { .. }
                    | StreamEvent::Stopped { .. }
                    | StreamEvent::Available { .. } => {}
                },
                Event::HandshakeDataReady | Event::DatagramReceived | Event::DatagramsUnblocked => {}
            }
        }

        self.drain_transmits(key, now);

        if self.connections.contains(key) && self.connections[key].conn.is_drained() {
            self.remove_connection(key);
        }
    }

    fn queue_packet(&mut self, destination: SocketAddr, data: Vec<u8>) {
        if self.send_queue.len() < self.send_queue_capacity {
            self.send_queue.push_back((destination, data));
        }
        // Drop excess packets — QUIC handles retransmission.
    }
}
