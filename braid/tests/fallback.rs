//! Fallback to plain TCP and server-side JOIN edge cases.

use std::net::SocketAddr;
use std::sync::Arc;

use braid::{LoopbackNet, MetaSocket, MptcpConfig, MptcpStack, WireSegment};
use braid_core::join::FourTuple;
use braid_mptcp::codec::{decode_options, encode_options, MptcpOption};
use bytes::Bytes;

/// The receive path parses options exactly once and hands the batch to
/// the JOIN handler.
fn feed_join_syn(
    stack: &MptcpStack,
    key4: FourTuple,
    wire: &WireSegment,
) -> braid::Result<WireSegment> {
    let opts = decode_options(&wire.options);
    stack.on_join_syn(key4, wire, &opts)
}

fn join_syn(token: u32, addr_id: u8) -> WireSegment {
    WireSegment {
        seq: 7777,
        ack_seq: 0,
        wnd: 65535,
        syn: true,
        ack: false,
        fin: false,
        rst: false,
        payload: Bytes::new(),
        options: encode_options(&[MptcpOption::JoinSyn {
            backup: false,
            addr_id,
            token,
            nonce: 0x1234_5678,
        }]),
    }
}

#[test]
fn missing_capable_falls_back_to_plain_tcp_without_errors() {
    braid::dev_tracing::init_tracing();
    let net = LoopbackNet::new();
    // The server refuses multipath entirely.
    let server_stack = MptcpStack::new(MptcpConfig::default().with_enabled(false));
    let client_stack = MptcpStack::new(MptcpConfig::default());

    let b1: SocketAddr = "10.0.0.1:80".parse().unwrap();
    let listener = net.bind(&server_stack, b1);
    let handle = net
        .connect(&client_stack, "10.0.1.1:9001".parse().unwrap(), b1)
        .unwrap();
    let client = MetaSocket::new(handle, client_stack.clone(), Arc::new(net.clone()));

    // The control block was destroyed; the master carries on as TCP.
    assert_eq!(client_stack.connection_count(), 0);
    assert_eq!(client.state(), braid::MetaState::Established);

    // Application traffic observes no error in either direction.
    client.send(b"hello").unwrap();
    let plain = listener.accept_plain().unwrap();
    net.pump();
    assert_eq!(plain.take_received(), b"hello");

    plain.send(b"world");
    let mut buf = [0u8; 16];
    let n = client.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"world");
}

#[test]
fn disabled_client_never_negotiates_multipath() {
    let net = LoopbackNet::new();
    let server_stack = MptcpStack::new(MptcpConfig::default());
    let client_stack = MptcpStack::new(MptcpConfig::default().with_enabled(false));

    let b1: SocketAddr = "10.0.0.5:80".parse().unwrap();
    let listener = net.bind(&server_stack, b1);
    let handle = net
        .connect(&client_stack, "10.0.1.5:9001".parse().unwrap(), b1)
        .unwrap();
    let client = MetaSocket::new(handle, client_stack, Arc::new(net.clone()));

    client.send(b"plain from the start").unwrap();
    let plain = listener.accept_plain().unwrap();
    net.pump();
    assert_eq!(plain.take_received(), b"plain from the start");
    assert_eq!(server_stack.connection_count(), 0);
}

#[test]
fn join_with_unknown_token_is_refused_without_state() {
    let server_stack = MptcpStack::new(MptcpConfig::default());
    let key4 = FourTuple::new(
        "10.0.0.1:80".parse().unwrap(),
        "10.9.9.9:5555".parse().unwrap(),
    );

    let err = feed_join_syn(&server_stack, key4, &join_syn(0xdead_beef, 2)).unwrap_err();
    assert!(matches!(
        err,
        braid::MptcpError::TokenUnknown { token: 0xdead_beef }
    ));
    // No half-open entry was created.
    assert_eq!(server_stack.pending_join_count(), 0);
}

#[test]
fn join_source_address_overwrites_nat_stale_entry() {
    let net = LoopbackNet::new();
    let server_stack = MptcpStack::new(MptcpConfig::default());
    let client_stack = MptcpStack::new(MptcpConfig::default());

    let b1: SocketAddr = "10.0.0.1:80".parse().unwrap();
    let listener = net.bind(&server_stack, b1);
    let handle = net
        .connect(&client_stack, "10.0.1.1:9001".parse().unwrap(), b1)
        .unwrap();
    let _client = MetaSocket::new(handle, client_stack, Arc::new(net.clone()));
    let server = listener.accept().unwrap();

    // The peer once advertised id 3 at address X...
    let x: std::net::IpAddr = "203.0.113.10".parse().unwrap();
    server.handle().lock().remote_addrs.add(3, x, 0).unwrap();

    // ...but its JOIN arrives from Y: the observed source wins.
    let y: SocketAddr = "198.51.100.20:7000".parse().unwrap();
    let token = server.handle().lock().local_token;
    let key4 = FourTuple::new(b1, y);
    let synack = feed_join_syn(&server_stack, key4, &join_syn(token, 3)).unwrap();
    assert!(synack.syn && synack.ack);

    let mpcb = server.handle().lock();
    let entry = mpcb.remote_addrs.get(3).unwrap();
    assert_eq!(entry.addr, y.ip());
    assert_eq!(
        mpcb.remote_addrs.len(),
        1,
        "rebind must not create a duplicate entry"
    );
}

#[test]
fn checksum_mismatch_resets_subflow_and_arms_infinite_mapping() {
    use braid_mptcp::codec::{Dss, DssMapping};

    let net = LoopbackNet::new();
    let cfg = MptcpConfig::default().with_checksum(true);
    let server_stack = MptcpStack::new(cfg.clone());
    let client_stack = MptcpStack::new(cfg);

    let b1: SocketAddr = "10.0.0.1:80".parse().unwrap();
    let listener = net.bind(&server_stack, b1);
    let handle = net
        .connect(&client_stack, "10.0.1.1:9001".parse().unwrap(), b1)
        .unwrap();
    let client = MetaSocket::new(handle, client_stack, Arc::new(net.clone()));
    let server = listener.accept().unwrap();

    // Exchange some data first so the failure counts as mid-stream.
    client.send(b"valid bytes").unwrap();
    let mut buf = [0u8; 32];
    server.recv(&mut buf).unwrap();

    // A segment whose checksum does not cover its payload.
    let crafted = WireSegment {
        seq: server.handle().lock().subflow(1).unwrap().rcv_nxt,
        ack_seq: 0,
        wnd: 65535,
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        payload: Bytes::from_static(b"corrupted!"),
        options: encode_options(&[MptcpOption::Dss(Dss {
            data_ack: None,
            mapping: Some(DssMapping {
                data_seq: 0,
                sub_seq: 0,
                data_len: 10,
                checksum: Some(0x0bad),
            }),
            data_fin: false,
        })]),
    };

    let err = server
        .handle()
        .lock()
        .on_subflow_segment(1, crafted)
        .unwrap_err();
    assert!(matches!(
        err,
        braid::MptcpError::ChecksumMismatch { path_index: 1 }
    ));

    let mpcb = server.handle().lock();
    // The carrying subflow was reset and detached; the sender is told
    // to stop mapping.
    assert_eq!(mpcb.cnt_subflows(), 0);
    assert!(mpcb.send_infinite_mapping);
}

#[test]
fn peer_fail_option_switches_receive_to_infinite_mapping() {
    let net = LoopbackNet::new();
    let server_stack = MptcpStack::new(MptcpConfig::default());
    let client_stack = MptcpStack::new(MptcpConfig::default());

    let b1: SocketAddr = "10.0.0.1:80".parse().unwrap();
    let listener = net.bind(&server_stack, b1);
    let handle = net
        .connect(&client_stack, "10.0.1.1:9001".parse().unwrap(), b1)
        .unwrap();
    let client = MetaSocket::new(handle, client_stack, Arc::new(net.clone()));
    let _server = listener.accept().unwrap();

    let rcv_nxt = client.handle().lock().subflow(1).unwrap().rcv_nxt;
    let fail = WireSegment {
        seq: rcv_nxt,
        ack_seq: 0,
        wnd: 65535,
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        payload: Bytes::new(),
        options: encode_options(&[MptcpOption::Fail { dsn: 12345 }]),
    };
    client.handle().lock().on_subflow_segment(1, fail).unwrap();
    assert!(client.handle().lock().infinite_mapping_rcv);
}

#[test]
fn pending_join_expires_and_purges() {
    use std::time::{Duration, Instant};

    let net = LoopbackNet::new();
    let server_stack = MptcpStack::new(
        MptcpConfig::default().with_join_timeout(Duration::from_millis(1)),
    );
    let client_stack = MptcpStack::new(MptcpConfig::default());

    let b1: SocketAddr = "10.0.0.1:80".parse().unwrap();
    let _listener = net.bind(&server_stack, b1);
    let handle = net
        .connect(&client_stack, "10.0.1.1:9001".parse().unwrap(), b1)
        .unwrap();

    // A JOIN SYN that never completes.
    let token = {
        // The server's token for this connection is the client's
        // remote token.
        handle.lock().remote_token
    };
    let key4 = FourTuple::new(b1, "10.0.2.1:7000".parse().unwrap());
    feed_join_syn(&server_stack, key4, &join_syn(token, 2)).unwrap();
    assert_eq!(server_stack.pending_join_count(), 1);

    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(server_stack.expire_pending(Instant::now()), 1);
    assert_eq!(server_stack.pending_join_count(), 0);
}
