//! The event loop: a single worker thread driving an io_uring reactor.
//!
//! All callbacks — timers, UDP deliveries, user jobs — execute on the worker
//! thread. Other threads talk to the loop exclusively through the job queue
//! (a crossbeam channel) paired with an eventfd wake. Everything else the
//! loop owns is confined to the worker thread, reachable from jobs through a
//! thread-local set up for the lifetime of the run.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::completion::{OpTag, UserData};
use crate::config::Config;
use crate::error::Error;
use crate::metrics;
use crate::ring::Reactor;
use crate::ticker::{CallerId, Ticker, TickerOptions, next_ticker_id};
use crate::timer::{TickerEntry, TickerTable, decode_timer_payload, mono_nanos};
use crate::udp::{UdpRecvFn, UdpTable, UdpToken};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

const RUNNING: u8 = 0;
const STOP_GRACEFUL: u8 = 1;
const STOP_NOW: u8 = 2;

/// Cross-thread face of the loop: the job queue sender, the wake eventfd,
/// and the lifecycle flag. Everything else lives on the worker thread.
pub(crate) struct Shared {
    jobs: Sender<Job>,
    wake_fd: OwnedFd,
    state: AtomicU8,
}

impl Shared {
    /// Enqueue a job and wake the loop. Fails once shutdown has begun.
    pub(crate) fn enqueue(&self, job: Job) -> Result<(), Error> {
        if self.state.load(Ordering::Acquire) != RUNNING {
            metrics::JOBS_REJECTED.increment();
            return Err(Error::Shutdown);
        }
        if self.jobs.send(job).is_err() {
            metrics::JOBS_REJECTED.increment();
            return Err(Error::Shutdown);
        }
        self.wake();
        Ok(())
    }

    fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.wake_fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            );
        }
    }
}

/// The single-threaded cooperative executor.
///
/// Owns a worker thread that drives the reactor; accepts work from any
/// thread; hosts timers and UDP sockets. See the crate docs for the
/// submission API contract.
pub struct Loop {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Loop {
    /// Spawn a loop with its own worker thread. Returns once the reactor is
    /// live and accepting submissions.
    pub fn new(config: Config) -> Result<Arc<Loop>, Error> {
        config.validate()?;

        let wake_fd = unsafe {
            let fd = libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC);
            if fd < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            OwnedFd::from_raw_fd(fd)
        };

        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded::<Job>();
        let shared = Arc::new(Shared {
            jobs: jobs_tx,
            wake_fd,
            state: AtomicU8::new(RUNNING),
        });

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<ThreadId, Error>>(1);
        let worker_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run_worker(config, worker_shared, jobs_rx, ready_tx))
            .map_err(Error::Io)?;

        match ready_rx.recv() {
            Ok(Ok(thread_id)) => {
                tracing::debug!("event loop started");
                Ok(Arc::new(Loop {
                    shared,
                    thread: Mutex::new(Some(thread)),
                    thread_id,
                }))
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Shutdown)
            }
        }
    }

    /// Whether the current thread is the loop's worker thread.
    pub fn in_event_loop(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Enqueue `f` for execution on the loop thread. FIFO with respect to
    /// other `call_soon` submissions from the same thread; guaranteed to run
    /// unless the loop is torn down first.
    pub fn call_soon(&self, f: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        self.shared.enqueue(Box::new(f))
    }

    /// Run `f` inline if already on the loop thread, otherwise forward to
    /// [`call_soon`](Self::call_soon).
    pub fn call(&self, f: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        if self.in_event_loop() {
            f();
            Ok(())
        } else {
            self.call_soon(f)
        }
    }

    /// Synchronous RPC into the loop: inline if already on the loop thread,
    /// otherwise block until the loop has executed `f` and return its result.
    ///
    /// A panic inside `f` is re-raised on the calling thread; the loop itself
    /// survives. Returns [`Error::Shutdown`] if the loop dies before `f`
    /// runs.
    pub fn call_get<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.in_event_loop() {
            return Ok(f());
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.call_soon(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(result);
        })?;
        match rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => std::panic::resume_unwind(panic),
            Err(_) => Err(Error::Shutdown),
        }
    }

    /// Schedule a one-shot at `now + delay`.
    ///
    /// The deadline is captured here, at submission: by the time the loop
    /// observes the job only the residual delay remains, and a residual that
    /// has already elapsed fires immediately.
    pub fn call_later(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        let deadline_ns = mono_nanos().saturating_add(delay.as_nanos() as u64);
        let id = next_ticker_id();
        let mut f = Some(f);
        let entry = TickerEntry {
            caller: CallerId::LOOP,
            interval_ns: delay.as_nanos() as u64,
            deadline_ns,
            callback: Some(Box::new(move || {
                if let Some(f) = f.take() {
                    f()
                }
            })),
            running: Arc::new(AtomicBool::new(true)),
            alive: None,
            one_shot: true,
            fixed_interval: false,
            ephemeral: true,
            slot: None,
        };
        self.shared.enqueue(Box::new(move || {
            with_worker(|w| {
                w.tickers.insert(id, entry);
                w.arm_ticker(id, false);
            });
        }))
    }

    /// Create a periodic ticker and return its handle.
    pub fn call_every(
        &self,
        interval: Duration,
        opts: TickerOptions,
        f: impl FnMut() + Send + 'static,
    ) -> Result<Ticker, Error> {
        let id = next_ticker_id();
        let running = Arc::new(AtomicBool::new(opts.start_immediately));
        let entry = TickerEntry {
            caller: opts.caller,
            interval_ns: interval.as_nanos() as u64,
            deadline_ns: 0,
            callback: Some(Box::new(f)),
            running: running.clone(),
            alive: None,
            one_shot: opts.one_shot,
            fixed_interval: opts.fixed_interval,
            ephemeral: false,
            slot: None,
        };
        let start = opts.start_immediately;
        self.shared.enqueue(Box::new(move || {
            with_worker(|w| {
                w.tickers.insert(id, entry);
                if start {
                    w.arm_ticker(id, true);
                }
            });
        }))?;
        Ok(Ticker::new(id, running, Arc::downgrade(&self.shared)))
    }

    /// Create a periodic ticker whose continuation is conditioned on `owner`
    /// staying alive: once the owner expires, the ticker cancels itself at
    /// the pre-fire check without running the callback again.
    pub fn call_every_bound<O: Send + Sync + 'static>(
        &self,
        interval: Duration,
        owner: &Arc<O>,
        f: impl FnMut() + Send + 'static,
    ) -> Result<(), Error> {
        self.call_every_bound_in(interval, CallerId::LOOP, owner, f)
    }

    /// [`call_every_bound`](Self::call_every_bound) with an explicit caller
    /// tag, so scoped owners can tear the ticker down early.
    pub fn call_every_bound_in<O: Send + Sync + 'static>(
        &self,
        interval: Duration,
        caller: CallerId,
        owner: &Arc<O>,
        f: impl FnMut() + Send + 'static,
    ) -> Result<(), Error> {
        let weak = Arc::downgrade(owner);
        let id = next_ticker_id();
        let entry = TickerEntry {
            caller,
            interval_ns: interval.as_nanos() as u64,
            deadline_ns: 0,
            callback: Some(Box::new(f)),
            running: Arc::new(AtomicBool::new(true)),
            alive: Some(Box::new(move || weak.strong_count() > 0)),
            one_shot: false,
            fixed_interval: false,
            ephemeral: true,
            slot: None,
        };
        self.shared.enqueue(Box::new(move || {
            with_worker(|w| {
                w.tickers.insert(id, entry);
                w.arm_ticker(id, true);
            });
        }))
    }

    /// Stop and remove every ticker tagged with `caller`. A fire already in
    /// flight on the loop may still run before the removal executes; nothing
    /// runs after it.
    pub fn stop_tickers(&self, caller: CallerId) {
        let _ = self.call(move || {
            with_worker(|w| {
                let Worker { reactor, tickers, .. } = w;
                tickers.remove_caller(reactor, caller);
            });
        });
    }

    /// Host a UDP socket on the loop. `recv` is invoked on the loop thread
    /// for every datagram until the socket is removed.
    pub fn add_udp_socket(
        &self,
        socket: std::net::UdpSocket,
        recv: impl FnMut(&[u8], SocketAddr) + Send + 'static,
    ) -> Result<UdpToken, Error> {
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        static NEXT_TOKEN: AtomicU32 = AtomicU32::new(0);
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;
        let fd = OwnedFd::from(socket);
        let callback: Box<UdpRecvFn> = Box::new(recv);
        self.shared.enqueue(Box::new(move || {
            with_worker(|w| {
                let Worker { reactor, udp, .. } = w;
                udp.install(reactor, token, fd, local, callback);
            });
        }))?;
        Ok(UdpToken(token))
    }

    /// Send a datagram on a hosted socket. Runs inline on the loop thread;
    /// dispatched (copying `data`) otherwise.
    pub fn udp_send(&self, token: UdpToken, peer: SocketAddr, data: &[u8]) -> Result<(), Error> {
        if self.in_event_loop() {
            return with_worker(|w| w.udp.send(token.0, peer, data))
                .unwrap_or(Err(Error::Shutdown));
        }
        let owned = data.to_vec();
        self.call_soon(move || {
            with_worker(|w| {
                let _ = w.udp.send(token.0, peer, &owned);
            });
        })
    }

    /// Remove a hosted UDP socket. In-flight receive completions for it are
    /// discarded.
    pub fn remove_udp_socket(&self, token: UdpToken) {
        let _ = self.call(move || {
            with_worker(|w| {
                let Worker { reactor, udp, .. } = w;
                udp.begin_remove(reactor, token.0);
            });
        });
    }

    /// Shut the loop down. Graceful shutdown drains queued jobs before the
    /// worker exits; immediate shutdown breaks the loop at the next safe
    /// point. Either way, all tickers are stopped and their callbacks
    /// cleared before the thread is joined. Idempotent.
    pub fn shutdown(&self, immediate: bool) {
        let target = if immediate { STOP_NOW } else { STOP_GRACEFUL };
        let prev = self.shared.state.fetch_max(target, Ordering::AcqRel);
        if prev == RUNNING {
            tracing::debug!(immediate, "shutting down event loop");
        }
        self.shared.wake();
        if self.in_event_loop() {
            // Initiated from inside a callback; the loop exits after the
            // current iteration and the joiner is whoever drops us.
            return;
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
            tracing::debug!("event loop shutdown complete");
        }
    }

}

impl Drop for Loop {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

/// Worker-confined state: the reactor plus every table jobs may touch.
///
/// Field order matters for teardown: the reactor (and its ring fd) drops
/// first, after the shutdown drain has retired every SQE that references
/// table memory.
pub(crate) struct Worker {
    pub(crate) reactor: Reactor,
    pub(crate) tickers: TickerTable,
    pub(crate) udp: UdpTable,
}

impl Worker {
    pub(crate) fn arm_ticker(&mut self, id: u64, fresh_deadline: bool) {
        self.tickers.arm(&mut self.reactor, id, fresh_deadline);
    }

    pub(crate) fn disarm_ticker(&mut self, id: u64) {
        self.tickers.disarm(&mut self.reactor, id);
    }

    pub(crate) fn remove_ticker(&mut self, id: u64) {
        self.tickers.remove(&mut self.reactor, id);
    }
}

thread_local! {
    static WORKER: RefCell<Option<Worker>> = const { RefCell::new(None) };
}

/// Run `f` against the current thread's worker state. Returns `None` when
/// called off the loop thread or after the worker has torn down.
///
/// Never invoke user code from inside `f`: the worker state is borrowed for
/// the duration of the call, and user code is free to re-enter.
pub(crate) fn with_worker<R>(f: impl FnOnce(&mut Worker) -> R) -> Option<R> {
    WORKER.with(|w| w.borrow_mut().as_mut().map(f))
}

/// One unit of deferred work collected from a completion batch. Dispatched
/// with no worker borrow held, so callbacks can re-enter the loop's API.
enum Action {
    TimerFired { slot: u32, generation: u16 },
    UdpDatagram { token: u32, data: Vec<u8>, peer: SocketAddr },
}

fn run_worker(
    config: Config,
    shared: Arc<Shared>,
    jobs: Receiver<Job>,
    ready: Sender<Result<ThreadId, Error>>,
) {
    let wake_fd = shared.wake_fd.as_raw_fd();
    let mut worker = match Reactor::setup(&config, wake_fd) {
        Ok(reactor) => Worker {
            reactor,
            tickers: TickerTable::new(config.timer_slots),
            udp: UdpTable::new(config.udp_recv_buffer_size),
        },
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = worker.reactor.submit_wake_read() {
        let _ = ready.send(Err(Error::Io(e)));
        return;
    }

    WORKER.set(Some(worker));
    let _ = ready.send(Ok(thread::current().id()));

    // Kick the eventfd so the first submit_and_wait returns immediately and
    // any jobs enqueued during startup are processed.
    shared.wake();

    let mut cqe_batch: Vec<(u64, i32)> = Vec::with_capacity(64);
    let mut actions: Vec<Action> = Vec::with_capacity(64);

    loop {
        match shared.state.load(Ordering::Acquire) {
            STOP_NOW => break,
            STOP_GRACEFUL => {
                drain_jobs(&jobs);
                break;
            }
            _ => {}
        }

        let wait = with_worker(|w| -> std::io::Result<()> {
            w.reactor.submit_and_wait(1)?;
            cqe_batch.clear();
            w.reactor.drain_cqes(&mut cqe_batch);
            Ok(())
        });
        match wait {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "reactor wait failed; stopping loop");
                shared.state.fetch_max(STOP_NOW, Ordering::AcqRel);
                break;
            }
            None => break,
        }

        actions.clear();
        with_worker(|w| {
            for &(ud_raw, result) in cqe_batch.iter() {
                dispatch_cqe(w, ud_raw, result, &mut actions);
            }
        });

        for action in actions.drain(..) {
            match action {
                Action::TimerFired { slot, generation } => fire_timer(slot, generation),
                Action::UdpDatagram { token, data, peer } => deliver_datagram(token, &data, peer),
            }
        }

        drain_jobs(&jobs);
    }

    teardown();
    tracing::debug!("event loop thread exiting");
}

fn dispatch_cqe(worker: &mut Worker, ud_raw: u64, result: i32, actions: &mut Vec<Action>) {
    let ud = UserData(ud_raw);
    match ud.tag() {
        Some(OpTag::Wake) => {
            metrics::WAKEUPS.increment();
            let _ = worker.reactor.submit_wake_read();
        }
        Some(OpTag::Timer) => {
            // -ETIME is normal expiry; -ECANCELED (disarm) and stale
            // generations are ignored.
            if result == -libc::ETIME {
                let (slot, generation) = decode_timer_payload(ud.payload());
                actions.push(Action::TimerFired { slot, generation });
            }
        }
        Some(OpTag::UdpRecv) => {
            let token = ud.index();
            let Worker { reactor, udp, .. } = worker;
            if let Some((data, peer)) = udp.on_recv_cqe(reactor, token, result) {
                actions.push(Action::UdpDatagram { token, data, peer });
            }
        }
        Some(OpTag::Cancel) | Some(OpTag::DrainTimeout) | None => {}
    }
}

fn fire_timer(slot: u32, generation: u16) {
    let fire = with_worker(|w| {
        let Worker { reactor, tickers, .. } = w;
        tickers.begin_fire(reactor, slot, generation)
    })
    .flatten();
    let Some(mut fire) = fire else { return };

    if catch_unwind(AssertUnwindSafe(|| (fire.callback)())).is_err() {
        metrics::TICKER_PANICS.increment();
        tracing::error!(ticker = fire.id, "ticker callback panicked; ticker stays armed");
    }

    with_worker(|w| {
        let Worker { reactor, tickers, .. } = w;
        tickers.finish_fire(reactor, fire);
    });
}

fn deliver_datagram(token: u32, data: &[u8], peer: SocketAddr) {
    let callback = with_worker(|w| w.udp.take_callback(token)).flatten();
    let Some(mut callback) = callback else { return };
    callback(data, peer);
    with_worker(|w| w.udp.restore_callback(token, callback));
}

fn drain_jobs(jobs: &Receiver<Job>) {
    while let Ok(job) = jobs.try_recv() {
        metrics::JOBS_EXECUTED.increment();
        job();
    }
}

/// Stop every ticker, then retire all SQEs that reference worker memory
/// before the reactor (and its buffers) are dropped.
fn teardown() {
    with_worker(|w| w.tickers.clear_all());

    let mut pending = with_worker(|w| {
        let Worker { reactor, udp, .. } = w;
        udp.cancel_all(reactor)
    })
    .unwrap_or(0);

    let mut scratch: Vec<(u64, i32)> = Vec::new();
    for _ in 0..100 {
        if pending == 0 {
            break;
        }
        let done = with_worker(|w| {
            let _ = w.reactor.submit_drain_timeout();
            if w.reactor.submit_and_wait(1).is_err() {
                return pending;
            }
            scratch.clear();
            w.reactor.drain_cqes(&mut scratch);
            let mut retired = 0;
            for &(ud_raw, _result) in scratch.iter() {
                if UserData(ud_raw).tag() == Some(OpTag::UdpRecv) {
                    retired += 1;
                }
            }
            retired
        })
        .unwrap_or(pending);
        pending = pending.saturating_sub(done);
    }

    WORKER.set(None);
}
