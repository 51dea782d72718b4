//! loon-quic — QUIC transport on a loon event loop.
//!
//! Builds on [quinn-proto](https://docs.rs/quinn-proto)'s sans-IO state
//! machine and [`loon`]'s single-threaded reactor. A [`Network`] groups
//! [`Endpoint`]s under one shared [`loon::Loop`]; endpoints host QUIC
//! connections over a loop-managed UDP socket; and [`BtRequestStream`]
//! layers a length-prefixed, bencoded request/response protocol over a
//! single bidirectional stream, with per-request timeouts.
//!
//! # Example
//!
//! ```rust,no_run
//! use loon_quic::{CommandOptions, ConnectOptions, EndpointOptions, ListenOptions, Network};
//!
//! fn main() -> Result<(), loon_quic::Error> {
//!     let net = Network::new()?;
//!     let ep = net.endpoint("127.0.0.1:0".parse().unwrap(), EndpointOptions::default())?;
//!
//!     # let (server_tls, client_tls): (loon_quic::ServerTls, loon_quic::ClientTls) = unimplemented!();
//!     // Server: answer "ping" on every incoming BT stream.
//!     ep.listen(server_tls, ListenOptions::new().bt_streams(|bt| {
//!         bt.register_command("ping", |msg| {
//!             let _ = msg.respond(&b"pong"[..], false);
//!         }).unwrap();
//!     }))?;
//!
//!     // Client: connect, open a BT stream, issue a request.
//!     let conn = ep.connect(ep.local(), client_tls, ConnectOptions::new())?;
//!     let bt = conn.open_bt_stream()?;
//!     bt.command("ping", &b""[..], CommandOptions::new().reply(|reply| {
//!         println!("ok={} body={:?}", reply.ok(), reply.body());
//!     }))?;
//!     Ok(())
//! }
//! ```
//!
//! All callbacks run on the loop thread; handles are cheap, cloneable, and
//! usable from any thread.

pub(crate) mod engine;
pub(crate) mod registry;

mod btstream;
mod config;
mod connection;
mod endpoint;
mod network;
mod stream;

pub mod error;
pub mod metrics;

/// A message delivered to a BT command handler or reply callback.
pub use btstream::BtMessage;
/// Request/response protocol over a single QUIC stream.
pub use btstream::BtRequestStream;
/// Options for [`BtRequestStream::command`].
pub use btstream::CommandOptions;
/// Default reply deadline for BT commands.
pub use btstream::DEFAULT_REQUEST_TIMEOUT;
/// Client TLS credentials.
pub use config::ClientTls;
/// Options for [`Network::endpoint`].
pub use config::EndpointOptions;
/// Server TLS credentials.
pub use config::ServerTls;
/// Handle to a QUIC connection.
pub use connection::Connection;
/// Options for [`Endpoint::connect`].
pub use connection::ConnectOptions;
/// Options for [`Endpoint::listen`].
pub use connection::ListenOptions;
/// A bound UDP address hosting QUIC connections.
pub use endpoint::Endpoint;
/// Errors returned by loon-quic operations.
pub use error::Error;
/// Application close codes.
pub use error::close_code;
/// Endpoint grouping and ticker scoping over a shared loop.
pub use network::Network;
/// Handle to a raw QUIC byte stream.
pub use stream::Stream;

/// Re-exported wire-format kinds used by [`BtMessage`].
pub use protocol_bt::MessageKind;

// Re-export these crates: users hold loon handles and build rustls configs.
pub use loon;
pub use rustls;
