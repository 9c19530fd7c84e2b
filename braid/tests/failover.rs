//! Mid-stream path failure: reinjection covers the stranded bytes and
//! late recovery on the failed path lands as duplicates.

use std::net::SocketAddr;
use std::sync::Arc;

use braid::{Driver, LoopbackNet, MetaSocket, MptcpConfig, MptcpStack};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 249) as u8).collect()
}

#[test]
fn reinjection_covers_a_stalled_path_and_late_recovery_is_dropped() {
    braid::dev_tracing::init_tracing();
    let net = LoopbackNet::new();
    let server_stack = MptcpStack::new(MptcpConfig::default());
    let client_stack = MptcpStack::new(MptcpConfig::default());

    let b1: SocketAddr = "10.0.0.1:80".parse().unwrap();
    let listener = net.bind(&server_stack, b1);
    let handle = net
        .connect(&client_stack, "10.0.1.1:9001".parse().unwrap(), b1)
        .unwrap();
    let client = MetaSocket::new(handle, client_stack, Arc::new(net.clone()));
    let server = listener.accept().unwrap();

    client
        .add_local_address("10.0.2.1".parse().unwrap())
        .unwrap();
    net.pump();
    assert_eq!(client.subflow_count(), 2);

    let data = pattern(1_000_000);
    let mut received = Vec::with_capacity(data.len());
    let drain = |server: &MetaSocket, received: &mut Vec<u8>, upto: usize| {
        while received.len() < upto {
            let mut buf = vec![0u8; 64 * 1024];
            let n = server.recv(&mut buf).unwrap();
            received.extend_from_slice(&buf[..n]);
        }
    };

    // Phase 1: [0, 500k) rides subflow 1 only.
    client.handle().lock().noneligible = 1 << 1;
    let mut sent = 0;
    while sent < 500_000 {
        let end = (sent + 64 * 1024).min(500_000);
        sent += client.send(&data[sent..end]).unwrap();
        drain(&server, &mut received, sent);
    }

    // Phase 2: [500k, 600k) rides subflow 2, acknowledged.
    client.handle().lock().noneligible = 1 << 0;
    while sent < 600_000 {
        let end = (sent + 64 * 1024).min(600_000);
        sent += client.send(&data[sent..end]).unwrap();
        drain(&server, &mut received, sent);
    }
    {
        let mpcb = client.handle().lock();
        assert_eq!(mpcb.snd_una, mpcb.write_seq, "600k fully acknowledged");
    }

    // Subflow 2 stalls: [600k, 1M) is transmitted there but never
    // delivered.
    let l2 = net.link_of(client.handle(), 2).unwrap();
    net.hold(l2);
    while sent < 1_000_000 {
        let end = (sent + 64 * 1024).min(1_000_000);
        sent += client.send(&data[sent..end]).unwrap();
    }
    net.pump();
    assert_eq!(server.available(), 0, "held path delivers nothing");
    {
        let mpcb = client.handle().lock();
        assert_eq!(
            mpcb.write_seq.wrapping_sub(mpcb.snd_una),
            400_000,
            "[600k, 1M) is unacknowledged"
        );
    }

    // Declare the path potentially failed: the unacked range is cloned
    // for reinjection and subflow 1 carries it.
    client.handle().lock().noneligible = 0;
    client.mark_potentially_failed(2).unwrap();
    drain(&server, &mut received, 1_000_000);
    assert_eq!(received, data);

    let rcv_nxt_before = server.handle().lock().rx.rcv_nxt;

    // The stalled path recovers and delivers its stale copies: the
    // receiver discards every one as a duplicate.
    net.release(l2);
    net.pump();
    let mpcb = server.handle().lock();
    assert_eq!(mpcb.rx.rcv_nxt, rcv_nxt_before);
    assert_eq!(mpcb.rx.ofo_len(), 0);
    drop(mpcb);
    assert_eq!(server.available(), 0);
}

#[test]
fn link_events_toggle_pf_and_grow_the_inventory() {
    use braid::LinkEvent;

    let net = LoopbackNet::new();
    let server_stack = MptcpStack::new(MptcpConfig::default());
    let client_stack = MptcpStack::new(MptcpConfig::default());

    let b1: SocketAddr = "10.0.0.3:80".parse().unwrap();
    let listener = net.bind(&server_stack, b1);
    let handle = net
        .connect(&client_stack, "10.0.1.3:9001".parse().unwrap(), b1)
        .unwrap();
    let client = MetaSocket::new(handle, client_stack.clone(), Arc::new(net.clone()));
    let _server = listener.accept().unwrap();

    client
        .add_local_address("10.0.2.3".parse().unwrap())
        .unwrap();
    net.pump();
    assert_eq!(client.subflow_count(), 2);

    // DOWN marks the subflow potentially failed without teardown.
    let a2 = "10.0.2.3".parse().unwrap();
    client
        .handle()
        .lock()
        .on_link_event(LinkEvent::Down(a2))
        .unwrap();
    assert!(client.handle().lock().subflow(2).unwrap().pf);
    assert_eq!(client.subflow_count(), 2);

    // UP on the same address recovers it.
    client
        .handle()
        .lock()
        .on_link_event(LinkEvent::Up(a2))
        .unwrap();
    assert!(!client.handle().lock().subflow(2).unwrap().pf);

    // UP on a brand-new address grows the inventory and spawns a JOIN.
    let a3 = "10.0.3.3".parse().unwrap();
    let actions = client
        .handle()
        .lock()
        .on_link_event(LinkEvent::Up(a3))
        .unwrap();
    assert!(!actions.is_empty());
    net.execute(client.handle(), &client_stack, &actions);
    assert_eq!(client.subflow_count(), 3);
}

#[test]
fn potentially_failed_path_is_skipped_by_the_scheduler() {
    let net = LoopbackNet::new();
    let server_stack = MptcpStack::new(MptcpConfig::default());
    let client_stack = MptcpStack::new(MptcpConfig::default());

    let b1: SocketAddr = "10.0.0.2:80".parse().unwrap();
    let listener = net.bind(&server_stack, b1);
    let handle = net
        .connect(&client_stack, "10.0.1.2:9001".parse().unwrap(), b1)
        .unwrap();
    let client = MetaSocket::new(handle, client_stack, Arc::new(net.clone()));
    let server = listener.accept().unwrap();

    client
        .add_local_address("10.0.2.2".parse().unwrap())
        .unwrap();
    net.pump();

    // Hold subflow 2 the whole time; pf keeps the scheduler off it, so
    // everything flows over subflow 1 and arrives.
    let l2 = net.link_of(client.handle(), 2).unwrap();
    net.hold(l2);
    client.mark_potentially_failed(2).unwrap();

    let data = pattern(100_000);
    client.send(&data).unwrap();
    let mut received = Vec::new();
    while received.len() < data.len() {
        let mut buf = vec![0u8; 32 * 1024];
        let n = server.recv(&mut buf).unwrap();
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, data);
}
