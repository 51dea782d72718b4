//! Raw byte streams.
//!
//! A [`Stream`] is an ordered, flow-controlled QUIC byte stream without
//! framing. Received bytes are delivered to the endpoint's shared raw data
//! callback on the loop thread; sends are queued and drained as flow
//! control allows. For request/response semantics, use
//! [`BtRequestStream`](crate::BtRequestStream) instead.

use std::time::Instant;

use bytes::Bytes;
use quinn_proto::StreamId;

use crate::endpoint::{EndpointRef, flush_packets, with_endpoint};
use crate::engine::ConnKey;
use crate::error::Error;

/// Shared callback for data arriving on raw streams.
pub(crate) type RawDataFn = dyn Fn(Stream, &[u8]) + Send + Sync;
/// Shared callback for raw stream closure (application close code).
pub(crate) type RawCloseFn = dyn Fn(Stream, u64) + Send + Sync;

/// Handle to a raw QUIC stream. Cheap to clone; operations dispatch onto
/// the owning loop.
#[derive(Clone)]
pub struct Stream {
    ep: EndpointRef,
    conn: ConnKey,
    stream: StreamId,
}

impl Stream {
    pub(crate) fn new(ep: EndpointRef, conn: ConnKey, stream: StreamId) -> Self {
        Stream { ep, conn, stream }
    }

    /// Queue `data` for transmission. Delivery is ordered and reliable;
    /// flow-blocked data is buffered and drained automatically.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        let data = data.into();
        let (id, conn, stream) = (self.ep.id, self.conn, self.stream);
        self.ep.event_loop.call(move || {
            with_endpoint(id, |ep| {
                let _ = ep
                    .engine_mut()
                    .stream_send(Instant::now(), conn, stream, data);
            });
            flush_packets(id);
        })?;
        Ok(())
    }

    /// Close both directions with an application code.
    pub fn close(&self, code: u64) -> Result<(), Error> {
        let (id, conn, stream) = (self.ep.id, self.conn, self.stream);
        self.ep.event_loop.call(move || {
            crate::endpoint::close_stream(id, conn, stream, code);
        })?;
        Ok(())
    }

    /// Index of the stream within its initiator/directionality class.
    pub fn id(&self) -> u64 {
        self.stream.index()
    }
}
