//! Network: ownership and scoping over a shared [`Loop`].
//!
//! A network groups endpoints under one loop and tags every ticker it
//! creates with its own caller id, so tearing one network down cancels its
//! timers without disturbing siblings sharing the loop. The last network
//! holding a privately owned loop also stops the loop thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use loon::{CallerId, Loop, Ticker, TickerOptions};

use crate::config::EndpointOptions;
use crate::endpoint::{self, Endpoint};
use crate::error::Error;

/// A group of endpoints sharing one event loop, with scoped ticker
/// teardown.
pub struct Network {
    event_loop: Arc<Loop>,
    net_id: CallerId,
    endpoints: std::sync::Mutex<Vec<Endpoint>>,
    shutdown_immediate: AtomicBool,
}

impl Network {
    /// Create a network with its own private loop.
    pub fn new() -> Result<Network, Error> {
        Self::with_config(loon::Config::default())
    }

    /// Create a network with its own private loop, configured explicitly.
    pub fn with_config(config: loon::Config) -> Result<Network, Error> {
        Ok(Self::with_loop(Loop::new(config)?))
    }

    /// Adopt an existing loop. The loop is shut down at network teardown
    /// only if this network ends up being its last owner.
    pub fn with_loop(event_loop: Arc<Loop>) -> Network {
        let net_id = CallerId::next();
        tracing::debug!(net_id = net_id.value(), "network created");
        Network {
            event_loop,
            net_id,
            endpoints: std::sync::Mutex::new(Vec::new()),
            shutdown_immediate: AtomicBool::new(false),
        }
    }

    /// A sibling network on the same loop with a fresh caller id.
    pub fn create_linked_network(&self) -> Network {
        Network::with_loop(self.event_loop.clone())
    }

    /// The shared loop.
    pub fn event_loop(&self) -> &Arc<Loop> {
        &self.event_loop
    }

    /// This network's ticker tag.
    pub fn caller_id(&self) -> CallerId {
        self.net_id
    }

    /// Skip graceful endpoint close at teardown.
    pub fn set_shutdown_immediate(&self, immediate: bool) {
        self.shutdown_immediate.store(immediate, Ordering::Release);
    }

    /// Create an endpoint bound to `local_addr`, installed on the loop.
    pub fn endpoint(
        &self,
        local_addr: SocketAddr,
        opts: EndpointOptions,
    ) -> Result<Endpoint, Error> {
        let ep = endpoint::create_endpoint(&self.event_loop, local_addr, opts, self.net_id)?;
        self.endpoints.lock().unwrap().push(ep.clone());
        Ok(ep)
    }

    // ── Loop forwarding ──────────────────────────────────────────────

    pub fn in_event_loop(&self) -> bool {
        self.event_loop.in_event_loop()
    }

    pub fn call_soon(&self, f: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        Ok(self.event_loop.call_soon(f)?)
    }

    pub fn call(&self, f: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        Ok(self.event_loop.call(f)?)
    }

    pub fn call_get<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        Ok(self.event_loop.call_get(f)?)
    }

    pub fn call_later(
        &self,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), Error> {
        Ok(self.event_loop.call_later(delay, f)?)
    }

    /// Create a periodic ticker tagged with this network's caller id.
    pub fn call_every(
        &self,
        interval: Duration,
        f: impl FnMut() + Send + 'static,
    ) -> Result<Ticker, Error> {
        self.call_every_opts(interval, TickerOptions::default(), f)
    }

    /// [`call_every`](Self::call_every) with explicit options; the caller
    /// tag is always overridden with this network's id.
    pub fn call_every_opts(
        &self,
        interval: Duration,
        opts: TickerOptions,
        f: impl FnMut() + Send + 'static,
    ) -> Result<Ticker, Error> {
        let opts = TickerOptions {
            caller: self.net_id,
            ..opts
        };
        Ok(self.event_loop.call_every(interval, opts, f)?)
    }

    /// Weak-bound periodic ticker (see [`Loop::call_every_bound`]), tagged
    /// with this network's caller id.
    pub fn call_every_bound<O: Send + Sync + 'static>(
        &self,
        interval: Duration,
        owner: &Arc<O>,
        f: impl FnMut() + Send + 'static,
    ) -> Result<(), Error> {
        Ok(self
            .event_loop
            .call_every_bound_in(interval, self.net_id, owner, f)?)
    }

    fn close_gracefully(&self) {
        let endpoints: Vec<Endpoint> = self.endpoints.lock().unwrap().clone();
        for ep in &endpoints {
            let _ = ep.close_connections();
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        tracing::debug!(net_id = self.net_id.value(), "network shutting down");
        let immediate = self.shutdown_immediate.load(Ordering::Acquire);

        if !immediate {
            self.close_gracefully();
        }

        // Release our endpoint handles; their teardown dispatches onto the
        // loop and runs during the graceful drain below (or dies with an
        // immediate stop).
        self.endpoints.lock().unwrap().clear();

        // If we are the last owner, stop the loop thread; any still-queued
        // teardown executes during the graceful drain.
        if Arc::strong_count(&self.event_loop) == 1 {
            self.event_loop.shutdown(immediate);
        }

        self.event_loop.stop_tickers(self.net_id);
        tracing::debug!(net_id = self.net_id.value(), "network shutdown complete");
    }
}
