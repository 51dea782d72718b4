//! Timer slots and the loop-confined ticker registry.
//!
//! Every armed timer owns one slot in a fixed-capacity pool. The slot holds
//! the `Timespec` at a stable address for the in-flight timeout SQE, and a
//! generation counter so a CQE from a released slot is recognized as stale
//! and ignored.
//!
//! Tickers live in a registry keyed by a process-unique id and grouped by
//! [`CallerId`]. The registry is only ever touched on the loop thread;
//! handles reach it by enqueuing jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use io_uring::types::Timespec;

use crate::metrics;
use crate::ring::Reactor;
use crate::ticker::CallerId;

/// Monotonic clock reading in nanoseconds (CLOCK_MONOTONIC, same clock the
/// reactor's absolute timeouts use).
pub(crate) fn mono_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn nanos_to_timespec(nanos: u64) -> Timespec {
    Timespec::new()
        .sec(nanos / 1_000_000_000)
        .nsec((nanos % 1_000_000_000) as u32)
}

/// Encode `(slot, generation)` into a 32-bit user_data payload.
pub(crate) fn encode_timer_payload(slot: u32, generation: u16) -> u32 {
    (slot & 0xFFFF) | ((generation as u32) << 16)
}

/// Decode a user_data payload back to `(slot, generation)`.
pub(crate) fn decode_timer_payload(payload: u32) -> (u32, u16) {
    (payload & 0xFFFF, (payload >> 16) as u16)
}

/// Fixed-capacity pool of timer slots.
///
/// Timespecs are allocated once and never move; io_uring reads them by
/// pointer when the timeout SQE is prepared.
struct TimerSlots {
    timespecs: Box<[Timespec]>,
    owners: Box<[u64]>,
    generations: Box<[u16]>,
    free: Vec<u32>,
}

impl TimerSlots {
    fn new(capacity: u32) -> Self {
        let cap = capacity as usize;
        TimerSlots {
            timespecs: vec![Timespec::new(); cap].into_boxed_slice(),
            owners: vec![0u64; cap].into_boxed_slice(),
            generations: vec![0u16; cap].into_boxed_slice(),
            free: (0..capacity).rev().collect(),
        }
    }

    /// Allocate a slot for `owner` with the given absolute deadline.
    /// Returns `(slot, generation)` or `None` if the pool is exhausted.
    fn allocate(&mut self, owner: u64, deadline_ns: u64) -> Option<(u32, u16)> {
        let slot = self.free.pop()?;
        let idx = slot as usize;
        self.owners[idx] = owner;
        self.timespecs[idx] = nanos_to_timespec(deadline_ns);
        Some((slot, self.generations[idx]))
    }

    /// Validate a fired slot against its generation and release it.
    /// Returns the owning ticker id, or `None` for a stale CQE.
    fn take(&mut self, slot: u32, generation: u16) -> Option<u64> {
        let idx = slot as usize;
        if idx >= self.generations.len() || self.generations[idx] != generation {
            return None;
        }
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free.push(slot);
        Some(self.owners[idx])
    }

    /// Release a slot whose CQE has not fired yet. Returns the generation the
    /// in-flight SQE was submitted with, for cancel targeting.
    fn release(&mut self, slot: u32) -> u16 {
        let idx = slot as usize;
        let old = self.generations[idx];
        self.generations[idx] = old.wrapping_add(1);
        self.free.push(slot);
        old
    }

    fn timespec_ptr(&self, slot: u32) -> *const Timespec {
        &self.timespecs[slot as usize] as *const Timespec
    }
}

/// A registered ticker. Callback storage is scoped to the entry, so dropping
/// the entry on the loop thread is what destroys the callback.
pub(crate) struct TickerEntry {
    pub(crate) caller: CallerId,
    pub(crate) interval_ns: u64,
    /// Absolute deadline of the next fire (valid while armed).
    pub(crate) deadline_ns: u64,
    pub(crate) callback: Option<Box<dyn FnMut() + Send>>,
    /// Shared with the handle; the source of truth for start/stop idempotency.
    pub(crate) running: Arc<AtomicBool>,
    /// Pre-fire liveness check for weak-bound tickers.
    pub(crate) alive: Option<Box<dyn Fn() -> bool + Send>>,
    pub(crate) one_shot: bool,
    pub(crate) fixed_interval: bool,
    /// Entry has no handle and removes itself after firing (`call_later`).
    pub(crate) ephemeral: bool,
    /// Armed timer slot, if any.
    pub(crate) slot: Option<u32>,
}

impl Drop for TickerEntry {
    fn drop(&mut self) {
        // Handles observe the stop no matter how the entry dies: explicit
        // removal, caller-id teardown, loop shutdown, or an insert job
        // discarded by an immediate shutdown.
        self.running.store(false, Ordering::Release);
    }
}

/// The callback extracted for one fire, with enough context to restore it.
pub(crate) struct PendingFire {
    pub(crate) id: u64,
    pub(crate) callback: Box<dyn FnMut() + Send>,
}

/// Loop-confined registry of tickers plus the timer slot pool.
pub(crate) struct TickerTable {
    entries: HashMap<u64, TickerEntry>,
    slots: TimerSlots,
}

impl TickerTable {
    pub(crate) fn new(capacity: u32) -> Self {
        TickerTable {
            entries: HashMap::new(),
            slots: TimerSlots::new(capacity),
        }
    }

    pub(crate) fn insert(&mut self, id: u64, entry: TickerEntry) {
        self.entries.insert(id, entry);
    }

    /// Arm a ticker's timer. With `fresh_deadline`, the next fire is
    /// `now + interval`; otherwise the entry's stored deadline is used
    /// (one-shots carry the deadline captured at submission).
    pub(crate) fn arm(&mut self, reactor: &mut Reactor, id: u64, fresh_deadline: bool) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.slot.is_some() {
            return;
        }
        if fresh_deadline {
            entry.deadline_ns = mono_nanos() + entry.interval_ns;
        }
        let Some((slot, generation)) = self.slots.allocate(id, entry.deadline_ns) else {
            metrics::TIMER_SLOTS_EXHAUSTED.increment();
            tracing::warn!(ticker = id, "timer slot pool exhausted; ticker not armed");
            entry.running.store(false, Ordering::Release);
            return;
        };
        if let Err(e) = reactor.submit_timer_abs(self.slots.timespec_ptr(slot), slot, generation) {
            tracing::warn!(ticker = id, error = %e, "failed to arm timer");
            self.slots.release(slot);
            entry.running.store(false, Ordering::Release);
            return;
        }
        entry.slot = Some(slot);
    }

    /// Disarm a ticker's timer, leaving the entry registered.
    pub(crate) fn disarm(&mut self, reactor: &mut Reactor, id: u64) {
        if let Some(entry) = self.entries.get_mut(&id)
            && let Some(slot) = entry.slot.take()
        {
            let old_generation = self.slots.release(slot);
            let _ = reactor.cancel_timer(slot, old_generation);
        }
    }

    /// Disarm and drop a ticker entry (and with it, its callback).
    pub(crate) fn remove(&mut self, reactor: &mut Reactor, id: u64) {
        self.disarm(reactor, id);
        self.entries.remove(&id);
    }

    /// Stop and remove every ticker tagged with `caller`.
    pub(crate) fn remove_caller(&mut self, reactor: &mut Reactor, caller: CallerId) {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.caller == caller)
            .map(|(&id, _)| id)
            .collect();
        tracing::debug!(caller = caller.value(), count = ids.len(), "stopping tickers");
        for id in ids {
            self.remove(reactor, id);
        }
    }

    /// Stop every ticker and clear its callback. Used during loop shutdown,
    /// before the worker thread exits.
    pub(crate) fn clear_all(&mut self) {
        self.entries.clear();
    }

    /// Handle a timer CQE: resolve the slot, apply stop/liveness/one-shot
    /// rules, re-arm best-effort cadence, and hand back the callback to run.
    ///
    /// The callback is extracted so the caller can invoke it with no borrow
    /// of the table outstanding; [`finish_fire`](Self::finish_fire) restores
    /// it afterwards.
    pub(crate) fn begin_fire(
        &mut self,
        reactor: &mut Reactor,
        slot: u32,
        generation: u16,
    ) -> Option<PendingFire> {
        let id = self.slots.take(slot, generation)?;
        let entry = self.entries.get_mut(&id)?;
        entry.slot = None;

        // Stopped between the fire and our processing of it.
        if !entry.running.load(Ordering::Acquire) {
            if entry.ephemeral {
                self.entries.remove(&id);
            }
            return None;
        }

        // Weak-bound: a dead owner cancels silently, without a final fire.
        if let Some(alive) = &entry.alive
            && !alive()
        {
            tracing::trace!(ticker = id, "ticker owner expired; cancelling");
            entry.running.store(false, Ordering::Release);
            self.entries.remove(&id);
            return None;
        }

        if entry.one_shot {
            entry.running.store(false, Ordering::Release);
        } else if !entry.fixed_interval {
            // Best-effort cadence: the next fire is scheduled from the
            // previous deadline, independent of callback duration.
            entry.deadline_ns += entry.interval_ns;
            let deadline = entry.deadline_ns;
            if let Some((next_slot, next_generation)) = self.slots.allocate(id, deadline) {
                let ts = self.slots.timespec_ptr(next_slot);
                if reactor.submit_timer_abs(ts, next_slot, next_generation).is_ok() {
                    self.entries.get_mut(&id).expect("entry exists").slot = Some(next_slot);
                } else {
                    self.slots.release(next_slot);
                }
            } else {
                metrics::TIMER_SLOTS_EXHAUSTED.increment();
            }
        }

        let entry = self.entries.get_mut(&id)?;
        let callback = entry.callback.take()?;
        if entry.one_shot && entry.ephemeral {
            self.entries.remove(&id);
        }
        metrics::TICKERS_FIRED.increment();
        Some(PendingFire { id, callback })
    }

    /// Restore the callback after a fire and apply fixed-interval re-arming.
    /// A ticker removed during its own callback stays removed.
    pub(crate) fn finish_fire(&mut self, reactor: &mut Reactor, fire: PendingFire) {
        let PendingFire { id, callback } = fire;
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.callback = Some(callback);
        if entry.fixed_interval
            && entry.slot.is_none()
            && entry.running.load(Ordering::Acquire)
        {
            // Fixed-interval cadence: the full interval starts after the
            // callback returns.
            self.arm(reactor, id, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_payload_round_trip() {
        let payload = encode_timer_payload(1234, 567);
        assert_eq!(decode_timer_payload(payload), (1234, 567));
    }

    #[test]
    fn slots_allocate_and_take() {
        let mut slots = TimerSlots::new(2);
        let (slot_a, gen_a) = slots.allocate(10, 1_000).unwrap();
        let (slot_b, _) = slots.allocate(11, 2_000).unwrap();
        assert_ne!(slot_a, slot_b);
        assert!(slots.allocate(12, 3_000).is_none());

        assert_eq!(slots.take(slot_a, gen_a), Some(10));
        // Released slot: the same (slot, generation) is now stale.
        assert_eq!(slots.take(slot_a, gen_a), None);
    }

    #[test]
    fn release_bumps_generation() {
        let mut slots = TimerSlots::new(1);
        let (slot, generation) = slots.allocate(7, 500).unwrap();
        let old = slots.release(slot);
        assert_eq!(old, generation);
        // The stale CQE for the released arm is ignored.
        assert_eq!(slots.take(slot, generation), None);
        // The slot is usable again with a fresh generation.
        let (slot2, gen2) = slots.allocate(8, 600).unwrap();
        assert_eq!(slot2, slot);
        assert_ne!(gen2, generation);
    }

    #[test]
    fn mono_clock_advances() {
        let a = mono_nanos();
        let b = mono_nanos();
        assert!(b >= a);
    }
}
