//! Ticker handles and caller-id tagging.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::event_loop::{Shared, with_worker};

/// A 16-bit tag grouping tickers by the component that created them.
///
/// Multiple owners can share one [`Loop`](crate::Loop); each can tear down
/// its own tickers via [`Loop::stop_tickers`](crate::Loop::stop_tickers)
/// without disturbing siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerId(u16);

impl CallerId {
    /// The loop's own tag, used when no owner is specified.
    pub const LOOP: CallerId = CallerId(0);

    /// Allocate a fresh process-wide caller id. Wraps at 2^16, skipping the
    /// reserved loop tag.
    pub fn next() -> CallerId {
        static NEXT: AtomicU16 = AtomicU16::new(1);
        loop {
            let id = NEXT.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return CallerId(id);
            }
        }
    }

    pub fn value(self) -> u16 {
        self.0
    }
}

/// Options for [`Loop::call_every`](crate::Loop::call_every).
#[derive(Clone, Copy)]
pub struct TickerOptions {
    /// Arm the ticker as soon as it is registered. Default: true.
    pub start_immediately: bool,
    /// When true, the next fire is scheduled a full interval after the
    /// callback returns; otherwise fires keep the original cadence
    /// regardless of callback duration. Default: false.
    pub fixed_interval: bool,
    /// Disarm after the first fire. The handle can re-`start()` it.
    /// Default: false.
    pub one_shot: bool,
    /// Tag for scoped teardown. Default: [`CallerId::LOOP`].
    pub caller: CallerId,
}

impl Default for TickerOptions {
    fn default() -> Self {
        TickerOptions {
            start_immediately: true,
            fixed_interval: false,
            one_shot: false,
            caller: CallerId::LOOP,
        }
    }
}

pub(crate) fn next_ticker_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Handle to a periodic (or one-shot) timer on a [`Loop`](crate::Loop).
///
/// Cloneable; the timer is destroyed when the last handle drops or when the
/// loop shuts down, whichever comes first. `start`/`stop` may be called from
/// any thread.
#[derive(Clone)]
pub struct Ticker {
    inner: Arc<TickerHandle>,
}

struct TickerHandle {
    id: u64,
    running: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

impl Ticker {
    pub(crate) fn new(id: u64, running: Arc<AtomicBool>, shared: Weak<Shared>) -> Self {
        Ticker {
            inner: Arc::new(TickerHandle { id, running, shared }),
        }
    }

    /// Arm the ticker. Returns false if it was already running (or the loop
    /// is gone); the call has no effect in that case.
    pub fn start(&self) -> bool {
        let Some(shared) = self.inner.shared.upgrade() else {
            return false;
        };
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        let id = self.inner.id;
        let queued = shared.enqueue(Box::new(move || {
            with_worker(|w| w.arm_ticker(id, true));
        }));
        if queued.is_err() {
            self.inner.running.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Disarm the ticker. Returns false if it was already stopped. Does not
    /// interrupt a callback that is currently executing.
    pub fn stop(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(shared) = self.inner.shared.upgrade() {
            let id = self.inner.id;
            let _ = shared.enqueue(Box::new(move || {
                with_worker(|w| w.disarm_ticker(id));
            }));
        }
        true
    }

    /// Whether the ticker is armed, per the last successful transition.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        // Actual teardown happens on the loop thread; if the loop is already
        // gone, the entry died with it.
        self.running.store(false, Ordering::Release);
        if let Some(shared) = self.shared.upgrade() {
            let id = self.id;
            let _ = shared.enqueue(Box::new(move || {
                with_worker(|w| w.remove_ticker(id));
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_ids_are_unique() {
        let a = CallerId::next();
        let b = CallerId::next();
        assert_ne!(a, b);
        assert_ne!(a, CallerId::LOOP);
        assert_ne!(b, CallerId::LOOP);
    }

    #[test]
    fn default_options() {
        let opts = TickerOptions::default();
        assert!(opts.start_immediately);
        assert!(!opts.fixed_interval);
        assert!(!opts.one_shot);
        assert_eq!(opts.caller, CallerId::LOOP);
    }

    #[test]
    fn dead_loop_ticker_is_inert() {
        let running = Arc::new(AtomicBool::new(false));
        let ticker = Ticker::new(1, running, Weak::new());
        assert!(!ticker.start());
        assert!(!ticker.is_running());
        assert!(!ticker.stop());
    }
}
