//! In-memory loopback network.
//!
//! The reference embedding of the engine: every subflow is a pair of
//! in-process transports connected by queues, with the reliability and
//! ordering guarantees the TCP contract promises per path. Tests and
//! embedders without OS glue use this to run complete multipath
//! connections, including handshakes, JOINs, failure injection and
//! late delivery.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use braid_core::error::{MptcpError, Result};
use braid_core::join::FourTuple;
use braid_mptcp::codec::{decode_options, MptcpOption};
use braid_mptcp::mpcb::MpcbAction;
use braid_mptcp::stack::{JoinOutcome, Listener, MpcbHandle, MptcpStack};
use braid_mptcp::subflow::{SubflowTransport, TcpInfo, TcpState, WireSegment};
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::socket::Driver;

/// Identifies one subflow pipe inside the network.
pub type LinkId = usize;

/// One direction of a pipe.
struct Direction {
    tx: flume::Sender<WireSegment>,
    rx: flume::Receiver<WireSegment>,
    held: Mutex<Vec<WireSegment>>,
    info: Mutex<TcpInfo>,
}

impl Direction {
    fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            held: Mutex::new(Vec::new()),
            info: Mutex::new(TcpInfo::default()),
        }
    }
}

/// State shared between the two transports of one pipe.
struct LinkShared {
    /// Segments are parked instead of delivered (failure injection;
    /// release for late delivery).
    hold: AtomicBool,
    /// Segments are discarded outright.
    dead: AtomicBool,
    /// dirs[side] carries what `side` transmits.
    dirs: [Direction; 2],
}

impl LinkShared {
    fn new() -> Self {
        Self {
            hold: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            dirs: [Direction::new(), Direction::new()],
        }
    }

    fn send_from(&self, side: usize, seg: WireSegment) {
        if self.dead.load(Ordering::Relaxed) {
            return;
        }
        if self.hold.load(Ordering::Relaxed) {
            self.dirs[side].held.lock().push(seg);
            return;
        }
        let _ = self.dirs[side].tx.send(seg);
    }

    fn release_held(&self) {
        for dir in &self.dirs {
            for seg in dir.held.lock().drain(..) {
                let _ = dir.tx.send(seg);
            }
        }
    }
}

/// The transport handed to the engine for one side of a pipe.
struct LoopbackTransport {
    shared: Arc<LinkShared>,
    side: usize,
}

impl SubflowTransport for LoopbackTransport {
    fn send_segment(&mut self, seg: WireSegment) -> Result<()> {
        trace!(
            side = self.side,
            seq = seg.seq,
            len = seg.payload.len(),
            syn = seg.syn,
            "loopback segment"
        );
        self.shared.send_from(self.side, seg);
        Ok(())
    }

    fn close(&mut self) {
        self.shared.dirs[self.side].info.lock().state = TcpState::Closed;
    }

    fn reset(&mut self) {
        let rst = WireSegment {
            seq: 0,
            ack_seq: 0,
            wnd: 0,
            syn: false,
            ack: false,
            fin: false,
            rst: true,
            payload: Bytes::new(),
            options: Bytes::new(),
        };
        self.shared.send_from(self.side, rst);
        self.shared.dirs[self.side].info.lock().state = TcpState::Closed;
    }

    fn info(&self) -> TcpInfo {
        *self.shared.dirs[self.side].info.lock()
    }
}

/// The plain-TCP end of a fallen-back connection on the server side.
#[derive(Clone)]
pub struct PlainEndpoint {
    shared: Arc<LinkShared>,
    side: usize,
    recvq: Arc<Mutex<VecDeque<u8>>>,
}

impl PlainEndpoint {
    /// Bytes received so far.
    #[must_use]
    pub fn take_received(&self) -> Vec<u8> {
        self.recvq.lock().drain(..).collect()
    }

    /// Send raw bytes back to the peer.
    pub fn send(&self, payload: &[u8]) {
        self.shared.send_from(
            self.side,
            WireSegment {
                seq: 0,
                ack_seq: 0,
                wnd: 0,
                syn: false,
                ack: true,
                fin: false,
                rst: false,
                payload: Bytes::copy_from_slice(payload),
                options: Bytes::new(),
            },
        );
    }
}

/// What consumes segments arriving at one side of a pipe.
enum Sink {
    /// Server side before any connection exists: master handshakes and
    /// JOIN handshakes are told apart by their options.
    Gate {
        listener: Arc<Listener>,
        stack: MptcpStack,
        local: SocketAddr,
        remote: SocketAddr,
        accept_tx: flume::Sender<MpcbHandle>,
        plain_tx: flume::Sender<PlainEndpoint>,
    },

    /// An attached subflow of a live connection.
    Conn {
        handle: MpcbHandle,
        path_index: u8,
        stack: MptcpStack,
    },

    /// Plain-TCP child after fallback.
    Plain(PlainEndpoint),

    Dead,
}

struct ListenerEntry {
    listener: Arc<Listener>,
    stack: MptcpStack,
    accept_tx: flume::Sender<MpcbHandle>,
    plain_tx: flume::Sender<PlainEndpoint>,
}

struct NetState {
    links: Vec<Arc<LinkShared>>,
    sinks: Vec<[Sink; 2]>,
    listeners: HashMap<SocketAddr, ListenerEntry>,
    stacks: Vec<MptcpStack>,
    next_port: u16,
}

/// The loopback network fabric.
#[derive(Clone)]
pub struct LoopbackNet {
    state: Arc<Mutex<NetState>>,
}

impl Default for LoopbackNet {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState {
                links: Vec::new(),
                sinks: Vec::new(),
                listeners: HashMap::new(),
                stacks: Vec::new(),
                next_port: 49152,
            })),
        }
    }

    /// Bind a listener at `addr` for `stack`.
    pub fn bind(&self, stack: &MptcpStack, addr: SocketAddr) -> crate::socket::MetaListener {
        let listener = Arc::new(stack.listen(addr));
        let (accept_tx, accept_rx) = flume::unbounded();
        let (plain_tx, plain_rx) = flume::unbounded();
        let mut state = self.state.lock();
        state.stacks.push(stack.clone());
        state.listeners.insert(
            addr,
            ListenerEntry {
                listener,
                stack: stack.clone(),
                accept_tx,
                plain_tx,
            },
        );
        drop(state);
        crate::socket::MetaListener::new(accept_rx, plain_rx, stack.clone(), Arc::new(self.clone()))
    }

    /// Open a client connection to a bound address, driving the
    /// handshake to completion.
    pub fn connect(
        &self,
        stack: &MptcpStack,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<MpcbHandle> {
        let shared = Arc::new(LinkShared::new());
        let transport = Box::new(LoopbackTransport {
            shared: Arc::clone(&shared),
            side: 0,
        });

        let gate = {
            let state = self.state.lock();
            let entry = state
                .listeners
                .get(&remote)
                .ok_or(MptcpError::NotConnected)?;
            Sink::Gate {
                listener: Arc::clone(&entry.listener),
                stack: entry.stack.clone(),
                local: remote,
                remote: local,
                accept_tx: entry.accept_tx.clone(),
                plain_tx: entry.plain_tx.clone(),
            }
        };

        // The SYN fires inside connect, so the link must be wired first.
        let handle = stack.connect(local, remote, transport)?;
        {
            let mut state = self.state.lock();
            state.stacks.push(stack.clone());
            state.links.push(shared);
            state.sinks.push([
                Sink::Conn {
                    handle: Arc::clone(&handle),
                    path_index: 1,
                    stack: stack.clone(),
                },
                gate,
            ]);
        }
        self.pump();
        Ok(handle)
    }

    /// Deliver queued segments until the network is quiescent.
    pub fn pump(&self) {
        let mut state = self.state.lock();
        loop {
            let mut work = None;
            'scan: for (link_idx, link) in state.links.iter().enumerate() {
                for sender_side in 0..2 {
                    if let Ok(seg) = link.dirs[sender_side].rx.try_recv() {
                        work = Some((link_idx, 1 - sender_side, seg));
                        break 'scan;
                    }
                }
            }
            let Some((link_idx, recv_side, seg)) = work else {
                break;
            };
            self.dispatch(&mut state, link_idx, recv_side, seg);
        }
        for stack in &state.stacks {
            stack.drain_deferred();
        }
    }

    /// Find the link carrying a given subflow of a connection.
    #[must_use]
    pub fn link_of(&self, handle: &MpcbHandle, path_index: u8) -> Option<LinkId> {
        let state = self.state.lock();
        state.sinks.iter().position(|sides| {
            sides.iter().any(|s| match s {
                Sink::Conn {
                    handle: h,
                    path_index: pi,
                    ..
                } => Arc::ptr_eq(h, handle) && *pi == path_index,
                _ => false,
            })
        })
    }

    /// Set the smoothed RTT both transports of a link report.
    pub fn set_srtt(&self, link: LinkId, srtt: Duration) {
        let state = self.state.lock();
        for dir in &state.links[link].dirs {
            dir.info.lock().srtt = srtt;
        }
    }

    /// Park all traffic on a link (path stall).
    pub fn hold(&self, link: LinkId) {
        let state = self.state.lock();
        state.links[link].hold.store(true, Ordering::Relaxed);
    }

    /// Deliver everything parked on a link (late recovery).
    pub fn release(&self, link: LinkId) {
        let state = self.state.lock();
        state.links[link].hold.store(false, Ordering::Relaxed);
        state.links[link].release_held();
    }

    /// Discard all current and future traffic on a link.
    pub fn sever(&self, link: LinkId) {
        let state = self.state.lock();
        state.links[link].dead.store(true, Ordering::Relaxed);
    }

    fn alloc_port(state: &mut NetState) -> u16 {
        let port = state.next_port;
        state.next_port = state.next_port.wrapping_add(1).max(49152);
        port
    }

    fn transport_for(state: &NetState, link: LinkId, side: usize) -> Box<dyn SubflowTransport> {
        Box::new(LoopbackTransport {
            shared: Arc::clone(&state.links[link]),
            side,
        })
    }

    fn dispatch(&self, state: &mut NetState, link: LinkId, side: usize, seg: WireSegment) {
        // Clone the sink's contents out so the borrow of `state.sinks`
        // ends before any arm mutates the fabric.
        enum Route {
            Dead,
            Plain(PlainEndpoint),
            Conn {
                handle: MpcbHandle,
                path_index: u8,
                stack: MptcpStack,
            },
            Gate {
                listener: Arc<Listener>,
                stack: MptcpStack,
                local: SocketAddr,
                remote: SocketAddr,
                accept_tx: flume::Sender<MpcbHandle>,
                plain_tx: flume::Sender<PlainEndpoint>,
            },
        }

        let route = match &state.sinks[link][side] {
            Sink::Dead => Route::Dead,
            Sink::Plain(peer) => Route::Plain(peer.clone()),
            Sink::Conn {
                handle,
                path_index,
                stack,
            } => Route::Conn {
                handle: Arc::clone(handle),
                path_index: *path_index,
                stack: stack.clone(),
            },
            Sink::Gate {
                listener,
                stack,
                local,
                remote,
                accept_tx,
                plain_tx,
            } => Route::Gate {
                listener: Arc::clone(listener),
                stack: stack.clone(),
                local: *local,
                remote: *remote,
                accept_tx: accept_tx.clone(),
                plain_tx: plain_tx.clone(),
            },
        };

        match route {
            Route::Dead => {}

            Route::Plain(peer) => {
                peer.recvq.lock().extend(seg.payload.iter());
            }

            Route::Conn {
                handle,
                path_index,
                stack,
            } => {
                let result = handle.lock().on_subflow_segment(path_index, seg);
                match result {
                    Ok(actions) => {
                        for action in actions {
                            self.execute_action(state, &handle, &stack, &action);
                        }
                    }
                    Err(err) if err.is_fatal() => {
                        let token = handle.lock().local_token;
                        warn!(token, "fatal protocol error: {err}");
                        stack.remove(token);
                        state.sinks[link][side] = Sink::Dead;
                    }
                    Err(err) => {
                        debug!(path_index, "subflow error absorbed: {err}");
                    }
                }
            }

            Route::Gate {
                listener,
                stack,
                local,
                remote,
                accept_tx,
                plain_tx,
            } => {
                let key4 = FourTuple::new(local, remote);
                let opts = decode_options(&seg.options);
                let is_join_syn = opts
                    .iter()
                    .any(|o| matches!(o, MptcpOption::JoinSyn { .. }));
                let is_join_ack = opts
                    .iter()
                    .any(|o| matches!(o, MptcpOption::JoinAck { .. }));

                if seg.syn && !seg.ack {
                    let reply = if is_join_syn {
                        match stack.on_join_syn(key4, &seg, &opts) {
                            Ok(synack) => Some(synack),
                            Err(err) => {
                                // "Required key not available": signal
                                // only, no SYN-ACK, no pending entry.
                                warn!("JOIN refused: {err}");
                                Some(WireSegment {
                                    seq: 0,
                                    ack_seq: seg.seq.wrapping_add(1),
                                    wnd: 0,
                                    syn: false,
                                    ack: false,
                                    fin: false,
                                    rst: true,
                                    payload: Bytes::new(),
                                    options: Bytes::new(),
                                })
                            }
                        }
                    } else {
                        listener.on_syn(remote, &seg, &opts).ok()
                    };
                    if let Some(reply) = reply {
                        state.links[link].send_from(side, reply);
                    }
                } else if is_join_ack {
                    let transport = Self::transport_for(state, link, side);
                    match stack.on_join_ack(key4, &seg, &opts, transport) {
                        Ok(JoinOutcome::Attached { handle, path_index }) => {
                            state.sinks[link][side] = Sink::Conn {
                                handle,
                                path_index,
                                stack,
                            };
                        }
                        Ok(JoinOutcome::Deferred) => {
                            // The pump runs in user context: run the
                            // worker now and wire the child in.
                            stack.drain_deferred();
                            match stack.take_completed_join(&key4) {
                                Some((handle, path_index)) => {
                                    state.sinks[link][side] = Sink::Conn {
                                        handle,
                                        path_index,
                                        stack,
                                    };
                                }
                                None => debug!(?key4, "deferred JOIN did not complete"),
                            }
                        }
                        Err(err) => debug!("JOIN completion failed: {err}"),
                    }
                } else {
                    let transport = Self::transport_for(state, link, side);
                    match listener.on_ack(remote, &seg, &opts, transport) {
                        Ok(Some(handle)) => {
                            let _ = accept_tx.send(Arc::clone(&handle));
                            state.sinks[link][side] = Sink::Conn {
                                handle,
                                path_index: 1,
                                stack,
                            };
                        }
                        Ok(None) => {
                            let peer = PlainEndpoint {
                                shared: Arc::clone(&state.links[link]),
                                side,
                                recvq: Arc::new(Mutex::new(VecDeque::new())),
                            };
                            if !seg.payload.is_empty() {
                                peer.recvq.lock().extend(seg.payload.iter());
                            }
                            let _ = plain_tx.send(peer.clone());
                            state.sinks[link][side] = Sink::Plain(peer);
                        }
                        Err(err) => debug!("stray segment at listener: {err}"),
                    }
                }
            }
        }
    }

    fn execute_action(
        &self,
        state: &mut NetState,
        handle: &MpcbHandle,
        stack: &MptcpStack,
        action: &MpcbAction,
    ) {
        match action {
            MpcbAction::OpenSubflow {
                path_index,
                local,
                remote,
                ..
            } => {
                let Some(entry) = state.listeners.get(remote) else {
                    debug!(%remote, "no listener for join target");
                    return;
                };
                let listener = Arc::clone(&entry.listener);
                let gate_stack = entry.stack.clone();
                let accept_tx = entry.accept_tx.clone();
                let plain_tx = entry.plain_tx.clone();

                let mut local = *local;
                if local.port() == 0 {
                    local.set_port(Self::alloc_port(state));
                }

                let shared = Arc::new(LinkShared::new());
                state.links.push(Arc::clone(&shared));
                let link = state.links.len() - 1;
                state.sinks.push([
                    Sink::Conn {
                        handle: Arc::clone(handle),
                        path_index: *path_index,
                        stack: stack.clone(),
                    },
                    Sink::Gate {
                        listener,
                        stack: gate_stack,
                        local: *remote,
                        remote: local,
                        accept_tx,
                        plain_tx,
                    },
                ]);

                let transport = Box::new(LoopbackTransport { shared, side: 0 });
                let mut mpcb = handle.lock();
                let Some(path) = mpcb.paths.by_index(*path_index).copied() else {
                    state.sinks[link][0] = Sink::Dead;
                    return;
                };
                if let Err(err) = mpcb.start_join(&path, local, *remote, false, transport) {
                    warn!(path_index, "join initiation failed: {err}");
                    state.sinks[link][0] = Sink::Dead;
                }
            }
            MpcbAction::Fallback => {
                let token = handle.lock().local_token;
                stack.release_deferred(token);
            }
            MpcbAction::Destroy => {
                let token = handle.lock().local_token;
                stack.remove(token);
            }
        }
    }
}

impl Driver for LoopbackNet {
    fn drive(&self) {
        self.pump();
    }

    fn execute(&self, handle: &MpcbHandle, stack: &MptcpStack, actions: &[MpcbAction]) {
        let mut state = self.state.lock();
        for action in actions {
            self.execute_action(&mut state, handle, stack, action);
        }
        drop(state);
        self.pump();
    }
}
