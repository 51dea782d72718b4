//! Connection handles and per-connection state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use quinn_proto::StreamId;

use crate::btstream::{BtRequestStream, BtStreamState};
use crate::endpoint::{EndpointRef, StreamEntry, StreamPolicy, flush_packets, pump, with_endpoint};
use crate::engine::ConnKey;
use crate::error::Error;
use crate::stream::{RawCloseFn, RawDataFn, Stream};

/// Loop-confined per-connection application state.
pub(crate) struct ConnState {
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) on_established: Option<Box<dyn FnOnce(Connection) + Send>>,
    pub(crate) on_closed: Option<Box<dyn FnOnce(Connection, u64) + Send>>,
    pub(crate) streams: HashMap<StreamId, StreamEntry>,
}

impl ConnState {
    pub(crate) fn incoming(remote: Option<SocketAddr>) -> Self {
        ConnState {
            remote,
            on_established: None,
            on_closed: None,
            streams: HashMap::new(),
        }
    }

    pub(crate) fn outbound(remote: SocketAddr, opts: ConnectOptions) -> Self {
        ConnState {
            remote: Some(remote),
            on_established: opts.on_established,
            on_closed: opts.on_closed,
            streams: HashMap::new(),
        }
    }
}

/// Options for [`Endpoint::connect`](crate::Endpoint::connect).
pub struct ConnectOptions {
    pub(crate) server_name: String,
    pub(crate) on_established: Option<Box<dyn FnOnce(Connection) + Send>>,
    pub(crate) on_closed: Option<Box<dyn FnOnce(Connection, u64) + Send>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            server_name: "localhost".to_string(),
            on_established: None,
            on_closed: None,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// TLS server name (SNI). Defaults to `localhost`.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Invoked on the loop thread when the handshake completes.
    pub fn on_established(mut self, f: impl FnOnce(Connection) + Send + 'static) -> Self {
        self.on_established = Some(Box::new(f));
        self
    }

    /// Invoked on the loop thread when the connection closes, with the
    /// application close code.
    pub fn on_closed(mut self, f: impl FnOnce(Connection, u64) + Send + 'static) -> Self {
        self.on_closed = Some(Box::new(f));
        self
    }
}

/// Options for [`Endpoint::listen`](crate::Endpoint::listen).
pub struct ListenOptions {
    pub(crate) policy: StreamPolicy,
    pub(crate) on_connection: Option<Box<dyn FnMut(Connection) + Send>>,
    pub(crate) on_bt_open: Option<Box<dyn FnMut(BtRequestStream) + Send>>,
    pub(crate) raw_on_data: Option<Arc<RawDataFn>>,
    pub(crate) raw_on_close: Option<Arc<RawCloseFn>>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        ListenOptions {
            policy: StreamPolicy::Reject,
            on_connection: None,
            on_bt_open: None,
            raw_on_data: None,
            raw_on_close: None,
        }
    }
}

impl ListenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked on the loop thread for every accepted connection.
    pub fn on_connection(mut self, f: impl FnMut(Connection) + Send + 'static) -> Self {
        self.on_connection = Some(Box::new(f));
        self
    }

    /// Wrap every peer-initiated stream in a BT request stream; `on_open`
    /// is where handlers get registered.
    pub fn bt_streams(mut self, on_open: impl FnMut(BtRequestStream) + Send + 'static) -> Self {
        self.policy = StreamPolicy::Bt;
        self.on_bt_open = Some(Box::new(on_open));
        self
    }

    /// Deliver peer-initiated streams as raw bytes to `on_data`.
    pub fn raw_streams(mut self, on_data: impl Fn(Stream, &[u8]) + Send + Sync + 'static) -> Self {
        self.policy = StreamPolicy::Raw;
        self.raw_on_data = Some(Arc::new(on_data));
        self
    }

    /// Callback for raw stream closure.
    pub fn on_raw_close(mut self, f: impl Fn(Stream, u64) + Send + Sync + 'static) -> Self {
        self.raw_on_close = Some(Arc::new(f));
        self
    }
}

/// Handle to a QUIC connection.
///
/// Cheap to clone. Dropping handles does not close the connection; the
/// endpoint owns it until either side closes.
#[derive(Clone)]
pub struct Connection {
    ep: EndpointRef,
    key: ConnKey,
}

impl Connection {
    pub(crate) fn new(ep: EndpointRef, key: ConnKey) -> Self {
        Connection { ep, key }
    }

    /// The peer's address.
    pub fn remote(&self) -> Result<SocketAddr, Error> {
        let (id, key) = (self.ep.id, self.key);
        self.ep
            .event_loop
            .call_get(move || {
                with_endpoint(id, |ep| {
                    ep.remote_of(key)
                        .or_else(|| ep.conn_remote_hint(key))
                })
                .flatten()
            })?
            .ok_or(Error::InvalidConnection)
    }

    /// Open a BT request stream on this connection.
    pub fn open_bt_stream(&self) -> Result<BtRequestStream, Error> {
        let (id, key) = (self.ep.id, self.key);
        let ep_ref = self.ep.clone();
        let stream: Result<StreamId, Error> = self.ep.event_loop.call_get(move || {
            with_endpoint(id, |ep| {
                let stream = ep.engine_mut().open_bi(key)?;
                ep.insert_stream_entry(key, stream, StreamEntry::Bt(BtStreamState::new()));
                Ok(stream)
            })
            .ok_or(Error::InvalidConnection)?
        })?;
        Ok(BtRequestStream {
            ep: ep_ref,
            conn: key,
            stream: stream?,
        })
    }

    /// Open a raw byte stream on this connection.
    pub fn open_stream(&self) -> Result<Stream, Error> {
        let (id, key) = (self.ep.id, self.key);
        let ep_ref = self.ep.clone();
        let stream: Result<StreamId, Error> = self.ep.event_loop.call_get(move || {
            with_endpoint(id, |ep| {
                let stream = ep.engine_mut().open_bi(key)?;
                ep.insert_stream_entry(key, stream, StreamEntry::Raw);
                Ok(stream)
            })
            .ok_or(Error::InvalidConnection)?
        })?;
        Ok(Stream::new(ep_ref, key, stream?))
    }

    /// Close the connection with an application code and reason.
    pub fn close(&self, code: u64, reason: &[u8]) -> Result<(), Error> {
        let (id, key) = (self.ep.id, self.key);
        let reason = reason.to_vec();
        self.ep.event_loop.call(move || {
            with_endpoint(id, |ep| {
                ep.engine_mut()
                    .close_connection(Instant::now(), key, code, &reason);
            });
            pump(id);
            flush_packets(id);
        })?;
        Ok(())
    }
}
