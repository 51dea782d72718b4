//! loon runtime metrics.
//!
//! Counters for job throughput, ticker activity, and UDP traffic.
//! Registered with [`metriken`] so an embedding application can expose them
//! through whatever exposition endpoint it already runs.

use metriken::{Counter, metric};

// ── Jobs ─────────────────────────────────────────────────────────

#[metric(name = "loon/jobs/executed", description = "Jobs executed on the loop thread")]
pub static JOBS_EXECUTED: Counter = Counter::new();

#[metric(
    name = "loon/jobs/rejected",
    description = "Jobs rejected because the loop had shut down"
)]
pub static JOBS_REJECTED: Counter = Counter::new();

#[metric(name = "loon/wakeups", description = "Cross-thread wake events observed")]
pub static WAKEUPS: Counter = Counter::new();

// ── Tickers ──────────────────────────────────────────────────────

#[metric(name = "loon/tickers/fired", description = "Ticker callbacks invoked")]
pub static TICKERS_FIRED: Counter = Counter::new();

#[metric(
    name = "loon/tickers/panics",
    description = "Ticker callbacks that panicked (caught)"
)]
pub static TICKER_PANICS: Counter = Counter::new();

#[metric(
    name = "loon/tickers/slots_exhausted",
    description = "Timer arm attempts that found no free slot"
)]
pub static TIMER_SLOTS_EXHAUSTED: Counter = Counter::new();

// ── UDP ──────────────────────────────────────────────────────────

#[metric(
    name = "loon/udp/datagrams_received",
    description = "UDP datagrams delivered to socket callbacks"
)]
pub static UDP_DATAGRAMS_RECEIVED: Counter = Counter::new();

#[metric(name = "loon/udp/datagrams_sent", description = "UDP datagrams sent")]
pub static UDP_DATAGRAMS_SENT: Counter = Counter::new();

#[metric(
    name = "loon/udp/send_dropped",
    description = "UDP datagrams dropped on send (socket buffer full)"
)]
pub static UDP_SEND_DROPPED: Counter = Counter::new();
