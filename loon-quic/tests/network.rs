//! Integration tests: network lifecycle, linked networks, and per-network
//! ticker scoping.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use loon_quic::{EndpointOptions, Network};

#[test]
fn network_starts_and_stops() {
    let net = Network::new().unwrap();
    assert!(!net.in_event_loop());
    assert_eq!(net.call_get(|| 40 + 2).unwrap(), 42);
    drop(net);
}

#[test]
fn endpoint_binds_an_ephemeral_port() {
    let net = Network::new().unwrap();
    let ep = net
        .endpoint("127.0.0.1:0".parse().unwrap(), EndpointOptions::default())
        .unwrap();
    assert_ne!(ep.local().port(), 0);
    assert_eq!(ep.connection_count().unwrap(), 0);
}

#[test]
fn linked_networks_share_the_loop() {
    let net_a = Network::new().unwrap();
    let net_b = net_a.create_linked_network();

    assert!(Arc::ptr_eq(net_a.event_loop(), net_b.event_loop()));
    assert_ne!(net_a.caller_id(), net_b.caller_id());

    // Both can schedule work on the shared loop.
    assert_eq!(net_b.call_get(|| 7).unwrap(), 7);
}

#[test]
fn dropping_a_linked_network_only_cancels_its_own_tickers() {
    let net_a = Network::new().unwrap();
    let net_b = net_a.create_linked_network();

    let count_a = Arc::new(AtomicUsize::new(0));
    let count_b = Arc::new(AtomicUsize::new(0));

    let ca = count_a.clone();
    let _ticker_a = net_a
        .call_every(Duration::from_millis(10), move || {
            ca.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    let cb = count_b.clone();
    let _ticker_b = net_b
        .call_every(Duration::from_millis(10), move || {
            cb.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(80));
    drop(net_b);

    // Allow any in-flight fire for B to land, then both sides settle.
    std::thread::sleep(Duration::from_millis(30));
    let frozen_b = count_b.load(Ordering::Relaxed);
    let a_before = count_a.load(Ordering::Relaxed);
    assert!(frozen_b >= 1);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(count_b.load(Ordering::Relaxed), frozen_b);
    assert!(count_a.load(Ordering::Relaxed) > a_before);
}

#[test]
fn last_network_stops_the_loop() {
    let net_a = Network::new().unwrap();
    let net_b = net_a.create_linked_network();
    let ev = net_a.event_loop().clone();

    drop(net_a);
    // The loop is still alive for the sibling (and for us).
    assert_eq!(net_b.call_get(|| 1).unwrap(), 1);

    drop(net_b);
    // We still hold an Arc, so the networks never saw themselves as the
    // last owner; the loop answers until we shut it down.
    assert_eq!(ev.call_get(|| 2).unwrap(), 2);
    ev.shutdown(false);
    assert!(ev.call_soon(|| {}).is_err());
}

#[test]
fn network_drop_stops_private_loop() {
    let net = Network::new().unwrap();
    let ev = {
        // Scope the clone so the network is the last owner at drop.
        let handle = net.event_loop();
        Arc::downgrade(handle)
    };
    drop(net);
    // The worker shut down with the network; the loop is unreachable.
    assert!(ev.upgrade().is_none());
}

#[test]
fn shutdown_immediate_skips_graceful_close() {
    let net = Network::new().unwrap();
    let _ep = net
        .endpoint("127.0.0.1:0".parse().unwrap(), EndpointOptions::default())
        .unwrap();
    net.set_shutdown_immediate(true);
    // Must not hang or panic.
    drop(net);
}

#[test]
fn call_later_forwarded_through_network() {
    let net = Network::new().unwrap();
    let (tx, rx) = crossbeam_channel::bounded(1);
    net.call_later(Duration::from_millis(20), move || {
        let _ = tx.send(());
    })
    .unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
}
