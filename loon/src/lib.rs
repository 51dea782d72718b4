//! loon — a single-threaded io_uring event loop for Linux.
//!
//! A [`Loop`] owns one worker thread that drives an io_uring reactor.
//! Every callback — timers, UDP deliveries, submitted jobs — executes on
//! that thread; other threads submit work through a job queue paired with
//! an eventfd wake, the loop's only cross-thread ingress.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use loon::{Config, Loop, TickerOptions};
//!
//! fn main() -> Result<(), loon::Error> {
//!     let ev = Loop::new(Config::default())?;
//!
//!     ev.call_soon(|| println!("runs on the loop thread"))?;
//!
//!     let ticker = ev.call_every(Duration::from_millis(100), TickerOptions::default(), || {
//!         println!("tick");
//!     })?;
//!
//!     std::thread::sleep(Duration::from_millis(350));
//!     ticker.stop();
//!     ev.shutdown(false);
//!     Ok(())
//! }
//! ```
//!
//! # Submission API
//!
//! - [`Loop::call_soon`] — enqueue, FIFO per submitting thread.
//! - [`Loop::call`] — inline when already on the loop thread.
//! - [`Loop::call_get`] — synchronous RPC; blocks off-thread callers until
//!   the result is ready.
//! - [`Loop::call_later`] — one-shot, rebased to the submission instant.
//! - [`Loop::call_every`] / [`Loop::call_every_bound`] — periodic tickers,
//!   loop-managed or auto-cancelled when a weak owner expires.
//!
//! # Platform
//!
//! Linux 5.15+ (io_uring with async cancel and absolute timeouts).

pub(crate) mod completion;
pub(crate) mod ring;
pub(crate) mod timer;
pub(crate) mod udp;

pub mod config;
pub mod error;
pub mod metrics;

mod event_loop;
mod ticker;

/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Runtime errors.
pub use error::Error;
/// The single-threaded cooperative executor.
pub use event_loop::Loop;
/// A 16-bit tag grouping tickers by their creating component.
pub use ticker::CallerId;
/// Handle to a timer hosted on a [`Loop`].
pub use ticker::Ticker;
/// Options for [`Loop::call_every`].
pub use ticker::TickerOptions;
/// Opaque handle for a UDP socket hosted on a [`Loop`].
pub use udp::UdpToken;
