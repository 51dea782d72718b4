//! Integration tests: BT request streams over a real loopback QUIC
//! connection — round trips, error responses, late responses, timeouts.

use std::net::SocketAddr;
use std::time::Duration;

use loon_quic::{
    CommandOptions, ConnectOptions, Connection, EndpointOptions, ListenOptions, Network,
    close_code,
};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

// ── TLS setup ────────────────────────────────────────────────────────

fn tls_pair() -> (loon_quic::ServerTls, loon_quic::ClientTls) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let cert_der = CertificateDer::from(cert.cert);

    let server = loon_quic::ServerTls::from_single_cert(vec![cert_der.clone()], key.into()).unwrap();
    let client = loon_quic::ClientTls::trusting(&[cert_der]).unwrap();
    (server, client)
}

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Connect a client endpoint to `server_addr` and wait for the handshake.
fn connect_established(
    net: &Network,
    server_addr: SocketAddr,
    client_tls: loon_quic::ClientTls,
) -> Connection {
    let client = net.endpoint(any_addr(), EndpointOptions::default()).unwrap();
    let (established_tx, established_rx) = crossbeam_channel::bounded::<()>(1);
    let conn = client
        .connect(
            server_addr,
            client_tls,
            ConnectOptions::new().on_established(move |_conn| {
                let _ = established_tx.send(());
            }),
        )
        .unwrap();
    established_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("handshake");
    conn
}

// ── Tests ────────────────────────────────────────────────────────────

#[test]
fn command_round_trip() {
    let net = Network::new().unwrap();
    let (server_tls, client_tls) = tls_pair();

    let server = net.endpoint(any_addr(), EndpointOptions::default()).unwrap();
    server
        .listen(
            server_tls,
            ListenOptions::new().bt_streams(|bt| {
                bt.register_command("echo", |msg| {
                    let body = msg.body_bytes();
                    msg.respond(body, false).unwrap();
                })
                .unwrap();
            }),
        )
        .unwrap();

    let conn = connect_established(&net, server.local(), client_tls);
    let bt = conn.open_bt_stream().unwrap();

    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    bt.command(
        "echo",
        &b"hello from the other side"[..],
        CommandOptions::new().reply(move |reply| {
            let _ = reply_tx.send((reply.ok(), reply.req_id(), reply.body().to_vec()));
        }),
    )
    .unwrap();

    let (ok, req_id, body) = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(ok);
    assert_eq!(req_id, 0);
    assert_eq!(body, b"hello from the other side");
}

#[test]
fn pipelined_commands_match_by_request_id() {
    let net = Network::new().unwrap();
    let (server_tls, client_tls) = tls_pair();

    let server = net.endpoint(any_addr(), EndpointOptions::default()).unwrap();
    server
        .listen(
            server_tls,
            ListenOptions::new().bt_streams(|bt| {
                bt.register_command("double", |msg| {
                    let mut doubled = msg.body().to_vec();
                    doubled.extend_from_slice(msg.body());
                    msg.respond(doubled, false).unwrap();
                })
                .unwrap();
            }),
        )
        .unwrap();

    let conn = connect_established(&net, server.local(), client_tls);
    let bt = conn.open_bt_stream().unwrap();

    let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
    for label in ["a", "b", "c"] {
        let tx = reply_tx.clone();
        bt.command(
            "double",
            label.as_bytes().to_vec(),
            CommandOptions::new().reply(move |reply| {
                let _ = tx.send((reply.req_id(), reply.body().to_vec()));
            }),
        )
        .unwrap();
    }

    let mut replies = Vec::new();
    for _ in 0..3 {
        replies.push(reply_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    replies.sort();
    assert_eq!(
        replies,
        vec![
            (0, b"aa".to_vec()),
            (1, b"bb".to_vec()),
            (2, b"cc".to_vec()),
        ]
    );
}

#[test]
fn error_response_is_marked() {
    let net = Network::new().unwrap();
    let (server_tls, client_tls) = tls_pair();

    let server = net.endpoint(any_addr(), EndpointOptions::default()).unwrap();
    server
        .listen(
            server_tls,
            ListenOptions::new().bt_streams(|bt| {
                bt.register_command("fail", |msg| {
                    msg.respond(&b"nope"[..], true).unwrap();
                })
                .unwrap();
            }),
        )
        .unwrap();

    let conn = connect_established(&net, server.local(), client_tls);
    let bt = conn.open_bt_stream().unwrap();

    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    bt.command(
        "fail",
        &b""[..],
        CommandOptions::new().reply(move |reply| {
            let _ = reply_tx.send((reply.ok(), reply.is_error(), reply.timed_out()));
        }),
    )
    .unwrap();

    let (ok, is_error, timed_out) = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!ok);
    assert!(is_error);
    assert!(!timed_out);
}

#[test]
fn late_response_from_another_thread() {
    let net = Network::new().unwrap();
    let (server_tls, client_tls) = tls_pair();

    let server = net.endpoint(any_addr(), EndpointOptions::default()).unwrap();
    server
        .listen(
            server_tls,
            ListenOptions::new().bt_streams(|bt| {
                bt.register_command("later", |msg| {
                    // The message carries a weak back-reference to its
                    // stream; responding works long after the handler
                    // returned, from any thread.
                    std::thread::spawn(move || {
                        std::thread::sleep(Duration::from_millis(50));
                        msg.respond(&b"finally"[..], false).unwrap();
                    });
                })
                .unwrap();
            }),
        )
        .unwrap();

    let conn = connect_established(&net, server.local(), client_tls);
    let bt = conn.open_bt_stream().unwrap();

    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    bt.command(
        "later",
        &b""[..],
        CommandOptions::new().reply(move |reply| {
            let _ = reply_tx.send(reply.body().to_vec());
        }),
    )
    .unwrap();

    let body = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(body, b"finally");
}

#[test]
fn request_times_out_against_silent_peer() {
    let net = Network::new().unwrap();
    let (server_tls, client_tls) = tls_pair();

    // The server accepts BT streams but registers no handlers, so commands
    // are dropped without a response.
    let server = net.endpoint(any_addr(), EndpointOptions::default()).unwrap();
    server
        .listen(server_tls, ListenOptions::new().bt_streams(|_bt| {}))
        .unwrap();

    let conn = connect_established(&net, server.local(), client_tls);
    let bt = conn.open_bt_stream().unwrap();

    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    let started = std::time::Instant::now();
    bt.command(
        "void",
        &b""[..],
        CommandOptions::new()
            .timeout(Duration::from_millis(50))
            .reply(move |reply| {
                let _ = reply_tx.send((reply.ok(), reply.timed_out()));
            }),
    )
    .unwrap();

    let (ok, timed_out) = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!ok);
    assert!(timed_out);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(500),
        "timeout fired after {elapsed:?}"
    );
}

#[test]
fn timeout_order_is_oldest_first() {
    let net = Network::new().unwrap();
    let (server_tls, client_tls) = tls_pair();

    let server = net.endpoint(any_addr(), EndpointOptions::default()).unwrap();
    server
        .listen(server_tls, ListenOptions::new().bt_streams(|_bt| {}))
        .unwrap();

    let conn = connect_established(&net, server.local(), client_tls);
    let bt = conn.open_bt_stream().unwrap();

    let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
    for _ in 0..3 {
        let tx = reply_tx.clone();
        bt.command(
            "void",
            &b""[..],
            CommandOptions::new()
                .timeout(Duration::from_millis(50))
                .reply(move |reply| {
                    let _ = tx.send(reply.req_id());
                }),
        )
        .unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(reply_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    assert_eq!(order, vec![0, 1, 2]);
}

#[test]
fn stream_close_fails_inflight_requests() {
    let net = Network::new().unwrap();
    let (server_tls, client_tls) = tls_pair();

    let server = net.endpoint(any_addr(), EndpointOptions::default()).unwrap();
    server
        .listen(server_tls, ListenOptions::new().bt_streams(|_bt| {}))
        .unwrap();

    let conn = connect_established(&net, server.local(), client_tls);
    let bt = conn.open_bt_stream().unwrap();

    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    bt.command(
        "void",
        &b""[..],
        CommandOptions::new()
            .timeout(Duration::from_secs(30))
            .reply(move |reply| {
                let _ = reply_tx.send(reply.timed_out());
            }),
    )
    .unwrap();

    bt.close(close_code::SHUTDOWN).unwrap();

    let timed_out = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(timed_out, "in-flight request must fail on stream close");
}

#[test]
fn connection_close_fails_inflight_requests() {
    let net = Network::new().unwrap();
    let (server_tls, client_tls) = tls_pair();

    let server = net.endpoint(any_addr(), EndpointOptions::default()).unwrap();
    server
        .listen(server_tls, ListenOptions::new().bt_streams(|_bt| {}))
        .unwrap();

    let conn = connect_established(&net, server.local(), client_tls);
    let bt = conn.open_bt_stream().unwrap();

    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    bt.command(
        "void",
        &b""[..],
        CommandOptions::new()
            .timeout(Duration::from_secs(30))
            .reply(move |reply| {
                let _ = reply_tx.send(reply.timed_out());
            }),
    )
    .unwrap();

    conn.close(close_code::SHUTDOWN, b"bye").unwrap();

    let timed_out = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(timed_out, "in-flight request must fail on connection close");
}

#[test]
fn server_sees_registered_endpoint_name() {
    let net = Network::new().unwrap();
    let (server_tls, client_tls) = tls_pair();

    let (seen_tx, seen_rx) = crossbeam_channel::bounded(1);
    let server = net.endpoint(any_addr(), EndpointOptions::default()).unwrap();
    server
        .listen(
            server_tls,
            ListenOptions::new().bt_streams(move |bt| {
                let tx = seen_tx.clone();
                bt.register_command("status", move |msg| {
                    let _ = tx.send((msg.endpoint_str(), msg.body().to_vec(), msg.req_id()));
                    msg.respond(&b"ok"[..], false).unwrap();
                })
                .unwrap();
            }),
        )
        .unwrap();

    let conn = connect_established(&net, server.local(), client_tls);
    let bt = conn.open_bt_stream().unwrap();

    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    bt.command(
        "status",
        &b"probe"[..],
        CommandOptions::new().reply(move |_reply| {
            let _ = reply_tx.send(());
        }),
    )
    .unwrap();

    let (endpoint, body, req_id) = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(endpoint, "status");
    assert_eq!(body, b"probe");
    assert_eq!(req_id, 0);
    reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}
