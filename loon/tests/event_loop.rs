//! Integration tests: loop submission ordering, call_get semantics, ticker
//! lifecycle, and shutdown behavior.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use loon::{Config, Loop, TickerOptions};

fn new_loop() -> Arc<Loop> {
    Loop::new(Config::default()).expect("loop start")
}

#[test]
fn cross_thread_submission() {
    let ev = new_loop();
    let counter = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let ev = ev.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..2500 {
                    let c = counter.clone();
                    ev.call_soon(move || {
                        c.fetch_add(1, Ordering::Relaxed);
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in submitters {
        handle.join().unwrap();
    }

    // call_get runs after everything already queued from this thread; poll
    // until the other submitters' jobs have all executed too.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let seen = {
            let c = counter.clone();
            ev.call_get(move || c.load(Ordering::Relaxed)).unwrap()
        };
        if seen == 10_000 {
            break;
        }
        assert!(Instant::now() < deadline, "only {seen} of 10000 jobs ran");
        thread::sleep(Duration::from_millis(10));
    }

    ev.shutdown(false);
}

#[test]
fn same_thread_fifo_ordering() {
    let ev = new_loop();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    for i in 0..100 {
        let order = order.clone();
        ev.call_soon(move || order.lock().unwrap().push(i)).unwrap();
    }
    let collected = {
        let order = order.clone();
        ev.call_get(move || order.lock().unwrap().clone()).unwrap()
    };
    assert_eq!(collected, (0..100).collect::<Vec<_>>());

    ev.shutdown(false);
}

#[test]
fn call_get_returns_value_and_runs_on_loop() {
    let ev = new_loop();

    let on_loop = {
        let ev2 = ev.clone();
        ev.call_get(move || ev2.in_event_loop()).unwrap()
    };
    assert!(on_loop);
    assert!(!ev.in_event_loop());

    let value = ev.call_get(|| 21 * 2).unwrap();
    assert_eq!(value, 42);

    ev.shutdown(false);
}

#[test]
fn call_get_propagates_panic_and_loop_survives() {
    let ev = new_loop();

    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = ev.call_get(|| -> u32 { panic!("boom") });
    }));
    assert!(caught.is_err());

    // The loop is still functional afterwards.
    assert_eq!(ev.call_get(|| 7).unwrap(), 7);
    ev.shutdown(false);
}

#[test]
fn call_inline_on_loop_thread() {
    let ev = new_loop();
    let ev2 = ev.clone();
    let ran_inline = ev
        .call_get(move || {
            // `call` from the loop thread must run f before returning.
            let hit = Arc::new(AtomicUsize::new(0));
            let hit2 = hit.clone();
            ev2.call(move || {
                hit2.store(1, Ordering::Relaxed);
            })
            .unwrap();
            hit.load(Ordering::Relaxed)
        })
        .unwrap();
    assert_eq!(ran_inline, 1);
    ev.shutdown(false);
}

#[test]
fn call_later_fires_once_after_delay() {
    let ev = new_loop();
    let counter = Arc::new(AtomicUsize::new(0));

    let started = Instant::now();
    let c = counter.clone();
    ev.call_later(Duration::from_millis(50), move || {
        c.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();

    thread::sleep(Duration::from_millis(25));
    assert_eq!(counter.load(Ordering::Relaxed), 0);

    let deadline = Instant::now() + Duration::from_secs(2);
    while counter.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline, "one-shot never fired");
        thread::sleep(Duration::from_millis(5));
    }
    assert!(started.elapsed() >= Duration::from_millis(50));

    // And never again.
    thread::sleep(Duration::from_millis(150));
    assert_eq!(counter.load(Ordering::Relaxed), 1);

    ev.shutdown(false);
}

#[test]
fn ticker_managed_lifecycle() {
    let ev = new_loop();
    let counter = Arc::new(AtomicUsize::new(0));

    let c = counter.clone();
    let ticker = ev
        .call_every(Duration::from_millis(10), TickerOptions::default(), move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    assert!(ticker.is_running());

    // Redundant start is a no-op that reports failure.
    assert!(!ticker.start());

    let deadline = Instant::now() + Duration::from_secs(2);
    while counter.load(Ordering::Relaxed) < 10 {
        assert!(Instant::now() < deadline, "ticker not firing");
        thread::sleep(Duration::from_millis(5));
    }

    assert!(ticker.stop());
    assert!(!ticker.stop());
    assert!(!ticker.is_running());

    // Allow a possibly in-flight fire to land, then verify quiescence.
    thread::sleep(Duration::from_millis(30));
    let frozen = counter.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(counter.load(Ordering::Relaxed), frozen);

    // Fires resume after start().
    assert!(ticker.start());
    assert!(ticker.is_running());
    let deadline = Instant::now() + Duration::from_secs(2);
    while counter.load(Ordering::Relaxed) < frozen + 3 {
        assert!(Instant::now() < deadline, "ticker did not resume");
        thread::sleep(Duration::from_millis(5));
    }

    assert!(ticker.stop());
    ev.shutdown(false);
}

#[test]
fn one_shot_ticker_stops_itself() {
    let ev = new_loop();
    let counter = Arc::new(AtomicUsize::new(0));

    let opts = TickerOptions {
        one_shot: true,
        ..TickerOptions::default()
    };
    let c = counter.clone();
    let ticker = ev
        .call_every(Duration::from_millis(10), opts, move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while counter.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline, "one-shot ticker never fired");
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(counter.load(Ordering::Relaxed), 1);
    assert!(!ticker.is_running());

    // Restartable: a second start produces exactly one more fire.
    assert!(ticker.start());
    let deadline = Instant::now() + Duration::from_secs(2);
    while counter.load(Ordering::Relaxed) < 2 {
        assert!(Instant::now() < deadline, "restarted one-shot never fired");
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(counter.load(Ordering::Relaxed), 2);

    ev.shutdown(false);
}

#[test]
fn weak_bound_ticker_cancels_on_owner_drop() {
    let ev = new_loop();
    let counter = Arc::new(AtomicUsize::new(0));

    let owner = Arc::new(());
    let c = counter.clone();
    ev.call_every_bound(Duration::from_millis(10), &owner, move || {
        c.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();

    thread::sleep(Duration::from_millis(100));
    drop(owner);

    // At most one more fire can be in flight; after that, silence.
    thread::sleep(Duration::from_millis(30));
    let frozen = counter.load(Ordering::Relaxed);
    assert!(frozen >= 5, "expected ~10 fires before drop, got {frozen}");
    thread::sleep(Duration::from_millis(200));
    assert_eq!(counter.load(Ordering::Relaxed), frozen);

    ev.shutdown(false);
}

#[test]
fn ticker_callback_panic_keeps_ticker_armed() {
    let ev = new_loop();
    let counter = Arc::new(AtomicUsize::new(0));

    let c = counter.clone();
    let ticker = ev
        .call_every(Duration::from_millis(10), TickerOptions::default(), move || {
            let n = c.fetch_add(1, Ordering::Relaxed);
            if n == 0 {
                panic!("first fire panics");
            }
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while counter.load(Ordering::Relaxed) < 3 {
        assert!(Instant::now() < deadline, "ticker died after panic");
        thread::sleep(Duration::from_millis(5));
    }

    ticker.stop();
    ev.shutdown(false);
}

#[test]
fn fixed_interval_ticker_fires() {
    let ev = new_loop();
    let counter = Arc::new(AtomicUsize::new(0));

    let opts = TickerOptions {
        fixed_interval: true,
        ..TickerOptions::default()
    };
    let c = counter.clone();
    let ticker = ev
        .call_every(Duration::from_millis(10), opts, move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while counter.load(Ordering::Relaxed) < 5 {
        assert!(Instant::now() < deadline, "fixed-interval ticker not firing");
        thread::sleep(Duration::from_millis(5));
    }

    ticker.stop();
    ev.shutdown(false);
}

#[test]
fn submissions_after_shutdown_are_rejected() {
    let ev = new_loop();
    ev.shutdown(false);

    assert!(matches!(ev.call_soon(|| {}), Err(loon::Error::Shutdown)));
    assert!(matches!(
        ev.call_get(|| 1),
        Err(loon::Error::Shutdown)
    ));
    assert!(matches!(
        ev.call_later(Duration::from_millis(1), || {}),
        Err(loon::Error::Shutdown)
    ));
    assert!(
        ev.call_every(Duration::from_millis(1), TickerOptions::default(), || {})
            .is_err()
    );
}

#[test]
fn graceful_shutdown_drains_queued_jobs() {
    let ev = new_loop();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..1000 {
        let c = counter.clone();
        ev.call_soon(move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }
    ev.shutdown(false);
    assert_eq!(counter.load(Ordering::Relaxed), 1000);
}

#[test]
fn ticker_stops_when_loop_shuts_down() {
    let ev = new_loop();
    let ticker = ev
        .call_every(Duration::from_millis(10), TickerOptions::default(), || {})
        .unwrap();
    assert!(ticker.is_running());

    ev.shutdown(true);
    assert!(!ticker.is_running());
    // A start against a dead loop reports failure.
    assert!(!ticker.start());
}

#[test]
fn stop_tickers_by_caller_id() {
    let ev = new_loop();
    let counter_a = Arc::new(AtomicUsize::new(0));
    let counter_b = Arc::new(AtomicUsize::new(0));

    let id_a = loon::CallerId::next();
    let id_b = loon::CallerId::next();

    let ca = counter_a.clone();
    let opts_a = TickerOptions {
        caller: id_a,
        ..TickerOptions::default()
    };
    let _ticker_a = ev
        .call_every(Duration::from_millis(10), opts_a, move || {
            ca.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    let cb = counter_b.clone();
    let opts_b = TickerOptions {
        caller: id_b,
        ..TickerOptions::default()
    };
    let _ticker_b = ev
        .call_every(Duration::from_millis(10), opts_b, move || {
            cb.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    thread::sleep(Duration::from_millis(60));
    ev.stop_tickers(id_a);
    thread::sleep(Duration::from_millis(30));

    let frozen_a = counter_a.load(Ordering::Relaxed);
    let b_before = counter_b.load(Ordering::Relaxed);
    assert!(frozen_a >= 1);
    thread::sleep(Duration::from_millis(100));

    // A is silent; its sibling keeps firing.
    assert_eq!(counter_a.load(Ordering::Relaxed), frozen_a);
    assert!(counter_b.load(Ordering::Relaxed) > b_before);

    ev.shutdown(false);
}

#[test]
fn udp_socket_round_trip() {
    let ev = new_loop();

    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let loop_addr = socket.local_addr().unwrap();

    let (tx, rx) = crossbeam_channel::unbounded::<(Vec<u8>, std::net::SocketAddr)>();
    let ev_send = ev.clone();
    let token_cell = Arc::new(std::sync::OnceLock::new());
    let token_for_cb = token_cell.clone();
    let token = ev
        .add_udp_socket(socket, move |data, peer| {
            // Echo straight back from the loop thread.
            if let Some(&token) = token_for_cb.get() {
                let _ = ev_send.udp_send(token, peer, data);
            }
            let _ = tx.send((data.to_vec(), peer));
        })
        .unwrap();
    token_cell.set(token).unwrap();

    let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client.send_to(b"ping", loop_addr).unwrap();

    let (data, peer) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(data, b"ping");
    assert_eq!(peer, client.local_addr().unwrap());

    let mut buf = [0u8; 16];
    let (n, from) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, loop_addr);

    ev.remove_udp_socket(token);
    ev.shutdown(false);
}
