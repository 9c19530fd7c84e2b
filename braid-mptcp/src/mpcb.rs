//! The multipath connection control block.
//!
//! One `Mpcb` anchors a meta-connection: the DSN-space send and receive
//! state, the subflow set, the address inventories and path table, and
//! the reinjection queue. It is a sans-IO state machine: wire segments
//! are fed in per subflow, transmissions go out through each subflow's
//! transport, and side effects the embedder must perform (opening a new
//! subflow, releasing a fallen-back block) come back as actions.
//!
//! Locking: the embedder wraps the block in one mutex which *is* the
//! master-subflow/meta lock; subflow state lives inside, so the
//! subflow-before-master ordering of the original design cannot invert.

use std::net::SocketAddr;

use braid_core::config::MptcpConfig;
use braid_core::error::{MptcpError, Result};
use braid_core::monitor::{ConnEvent, ConnEventSender};
use braid_core::segment::Segment;
use braid_core::seq;
use bytes::Bytes;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::codec::{
    self, decode_options, encode_options, Dss, DssMapping, MptcpOption,
};
use crate::handshake::{
    find_capable, find_join, generate_isn, generate_nonce, idsn_of, join_auth_digest,
    join_auth_word, token_of,
};
use crate::mapping::{self, MapVerdict};
use crate::path::{AddressSet, LinkEvent, Path, PathTable};
use crate::reassembly::{Ingest, MetaReceiver};
use crate::reinject::ReinjectQueue;
use crate::scheduler::{scheduler_by_index, Scheduler};
use crate::subflow::{Subflow, SubflowTransport, TcpState, WireSegment};

/// Meta-socket states, derived from the subflow states and clamped by
/// the DATA_FIN exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaState {
    Closed,
    SynSent,
    Established,
    CloseWait,
    FinWait1,
    FinWait2,
    Closing,
    LastAck,
}

impl MetaState {
    /// The application may still hand us bytes.
    #[must_use]
    pub const fn can_send(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }
}

/// Side effects the embedder must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MpcbAction {
    /// Open a new JOIN subflow on the given path: create a transport
    /// bound to `local`, then call [`Mpcb::start_join`].
    OpenSubflow {
        path_index: u8,
        local: SocketAddr,
        remote: SocketAddr,
        loc_id: u8,
        rem_id: u8,
        backup: bool,
    },

    /// The peer is not multipath capable; release this block and keep
    /// using the master as plain TCP.
    Fallback,

    /// Fatal protocol violation; drop the block entirely.
    Destroy,
}

pub type Actions = SmallVec<[MpcbAction; 2]>;

/// The multipath connection control block.
pub struct Mpcb {
    pub local_token: u32,
    pub remote_token: u32,
    pub local_key: u64,
    pub remote_key: u64,

    pub state: MetaState,
    pub server_side: bool,

    /// Plain-TCP fallback: no options, master only.
    pub fallen_back: bool,

    // Send side, DSN space.
    pub write_seq: u32,
    pub snd_una: u32,
    pub fin_enqueued: bool,
    pub send_infinite_mapping: bool,
    pub infinite_mapping_rcv: bool,

    /// Paths the scheduler must not use, by path-index bit.
    pub noneligible: u32,

    sendq: std::collections::VecDeque<Segment>,
    pub reinject: ReinjectQueue,

    // Receive side.
    pub rx: MetaReceiver,

    pub local_addrs: AddressSet,
    pub remote_addrs: AddressSet,
    pub paths: PathTable,

    subflows: Vec<Subflow>,

    /// Meta send buffer: the sum of subflow send buffers.
    pub sndbuf: usize,
    pub rcv_ssthresh: u32,
    pub window_clamp: u32,

    /// Control options awaiting a carrier segment (ADD_ADDR and
    /// friends).
    pending_opts: Vec<MptcpOption>,

    cfg: MptcpConfig,
    scheduler: &'static dyn Scheduler,
    events: Option<ConnEventSender>,
}

impl std::fmt::Debug for Mpcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mpcb")
            .field("token", &self.local_token)
            .field("state", &self.state)
            .field("subflows", &self.subflows.len())
            .field("write_seq", &self.write_seq)
            .field("snd_una", &self.snd_una)
            .field("rcv_nxt", &self.rx.rcv_nxt)
            .finish_non_exhaustive()
    }
}

impl Mpcb {
    /// Client-side construction: sends the master SYN immediately.
    ///
    /// `local_key` and the token derived from it must already be
    /// registered by the caller.
    pub fn new_client(
        cfg: MptcpConfig,
        local_key: u64,
        local: SocketAddr,
        remote: SocketAddr,
        transport: Box<dyn SubflowTransport>,
        events: Option<ConnEventSender>,
    ) -> Result<Self> {
        let scheduler = scheduler_by_index(cfg.scheduler);
        let mut master = Subflow::new(1, local, remote, transport);
        master.snd_isn = generate_isn();
        master.snd_nxt = master.snd_isn.wrapping_add(1);
        master.state = TcpState::SynSent;
        master.attached = true;

        let enabled = cfg.enabled;
        let options = if enabled {
            encode_options(&[MptcpOption::CapableSyn {
                checksum: cfg.checksum,
            }])
        } else {
            Bytes::new()
        };
        master.transport.send_segment(WireSegment {
            seq: master.snd_isn,
            ack_seq: 0,
            wnd: cfg.rcvbuf as u32,
            syn: true,
            ack: false,
            fin: false,
            rst: false,
            payload: Bytes::new(),
            options,
        })?;

        let write_seq = idsn_of(local_key);
        let mut mpcb = Self {
            local_token: token_of(local_key),
            remote_token: 0,
            local_key,
            remote_key: 0,
            state: MetaState::SynSent,
            server_side: false,
            fallen_back: !enabled,
            write_seq,
            snd_una: write_seq,
            fin_enqueued: false,
            send_infinite_mapping: false,
            infinite_mapping_rcv: false,
            noneligible: 0,
            sendq: std::collections::VecDeque::new(),
            reinject: ReinjectQueue::new(),
            rx: MetaReceiver::new(0, cfg.rcvbuf),
            local_addrs: AddressSet::new(),
            remote_addrs: AddressSet::new(),
            paths: PathTable::new(),
            subflows: Vec::new(),
            sndbuf: cfg.sndbuf,
            rcv_ssthresh: 0,
            window_clamp: 0,
            pending_opts: Vec::new(),
            cfg,
            scheduler,
            events,
        };
        mpcb.subflows.push(master);
        mpcb.recompute_buffers();
        Ok(mpcb)
    }

    /// Server-side construction, from a completed CAPABLE handshake.
    #[allow(clippy::too_many_arguments)]
    pub fn new_server(
        cfg: MptcpConfig,
        local_key: u64,
        remote_key: u64,
        local: SocketAddr,
        remote: SocketAddr,
        local_isn: u32,
        remote_isn: u32,
        transport: Box<dyn SubflowTransport>,
        events: Option<ConnEventSender>,
    ) -> Self {
        let scheduler = scheduler_by_index(cfg.scheduler);
        let mut master = Subflow::new(1, local, remote, transport);
        master.snd_isn = local_isn;
        master.snd_nxt = local_isn.wrapping_add(1);
        master.rcv_isn = remote_isn;
        master.rcv_nxt = remote_isn.wrapping_add(1);
        master.state = TcpState::Established;
        master.attached = true;

        let write_seq = idsn_of(local_key);
        let mut mpcb = Self {
            local_token: token_of(local_key),
            remote_token: token_of(remote_key),
            local_key,
            remote_key,
            state: MetaState::Established,
            server_side: true,
            fallen_back: false,
            write_seq,
            snd_una: write_seq,
            fin_enqueued: false,
            send_infinite_mapping: false,
            infinite_mapping_rcv: false,
            noneligible: 0,
            sendq: std::collections::VecDeque::new(),
            reinject: ReinjectQueue::new(),
            rx: MetaReceiver::new(idsn_of(remote_key), cfg.rcvbuf),
            local_addrs: AddressSet::new(),
            remote_addrs: AddressSet::new(),
            paths: PathTable::new(),
            subflows: Vec::new(),
            sndbuf: cfg.sndbuf,
            rcv_ssthresh: 0,
            window_clamp: 0,
            pending_opts: Vec::new(),
            cfg,
            scheduler,
            events,
        };
        mpcb.subflows.push(master);
        mpcb.recompute_buffers();
        mpcb.emit(|token, sf| ConnEvent::SubflowEstablished {
            token,
            path_index: 1,
            local: sf.local,
            remote: sf.remote,
        });
        mpcb
    }

    #[must_use]
    pub fn cnt_subflows(&self) -> usize {
        self.subflows.len()
    }

    #[must_use]
    pub fn master(&self) -> Option<&Subflow> {
        self.subflows.iter().find(|sf| sf.is_master())
    }

    #[must_use]
    pub fn subflow(&self, path_index: u8) -> Option<&Subflow> {
        self.subflows.iter().find(|sf| sf.path_index == path_index)
    }

    fn subflow_idx(&self, path_index: u8) -> Option<usize> {
        self.subflows.iter().position(|sf| sf.path_index == path_index)
    }

    #[must_use]
    pub fn config(&self) -> &MptcpConfig {
        &self.cfg
    }

    /// Unacknowledged plus unsent bytes currently buffered.
    #[must_use]
    pub fn inflight_bytes(&self) -> u32 {
        self.write_seq.wrapping_sub(self.snd_una)
    }

    /// Send-buffer space still available to the application.
    #[must_use]
    pub fn send_space(&self) -> usize {
        (self.sndbuf as u32).saturating_sub(self.inflight_bytes()) as usize
    }

    fn emit(&self, make: impl FnOnce(u32, &Subflow) -> ConnEvent) {
        if let (Some(tx), Some(master)) = (&self.events, self.master()) {
            let _ = tx.send(make(self.local_token, master));
        }
    }

    fn emit_plain(&self, event: ConnEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Recompute the meta buffer sums from the attached subflows.
    pub fn recompute_buffers(&mut self) {
        let mut sndbuf = 0usize;
        let mut rcvbuf = 0usize;
        let mut ssthresh = 0u32;
        let mut clamp = 0u32;
        for sf in &self.subflows {
            let info = sf.info();
            sndbuf += info.sndbuf;
            rcvbuf += info.rcvbuf;
            ssthresh = ssthresh.saturating_add(info.rcv_ssthresh);
            clamp = clamp.saturating_add(info.window_clamp);
        }
        self.sndbuf = sndbuf.max(self.cfg.sndbuf);
        self.rx.rcvbuf = rcvbuf.max(self.cfg.rcvbuf);
        self.rcv_ssthresh = ssthresh;
        self.window_clamp = clamp;
    }

    // ------------------------------------------------------------------
    // Subflow attach / detach
    // ------------------------------------------------------------------

    /// Attach a subflow at the head of the connection list.
    pub fn attach_subflow(&mut self, mut sf: Subflow) {
        sf.attached = true;
        debug!(path_index = sf.path_index, "subflow attached");
        self.subflows.insert(0, sf);
        self.recompute_buffers();
    }

    /// Detach a subflow. The block itself stays alive; the last handle
    /// dropping frees it.
    pub fn detach_subflow(&mut self, path_index: u8) -> Option<Subflow> {
        let idx = self.subflow_idx(path_index)?;
        let mut sf = self.subflows.remove(idx);
        sf.attached = false;
        self.recompute_buffers();
        self.emit_plain(ConnEvent::SubflowClosed {
            token: self.local_token,
            path_index,
        });
        debug!(path_index, "subflow detached");
        Some(sf)
    }

    /// Initiate a JOIN on a path published by the path table.
    pub fn start_join(
        &mut self,
        path: &Path,
        local: SocketAddr,
        remote: SocketAddr,
        backup: bool,
        transport: Box<dyn SubflowTransport>,
    ) -> Result<()> {
        let mut sf = Subflow::new(path.path_index, local, remote, transport);
        sf.loc_id = path.loc_id;
        sf.rem_id = path.rem_id;
        sf.backup = backup;
        sf.snd_isn = generate_isn();
        sf.snd_nxt = sf.snd_isn.wrapping_add(1);
        sf.local_nonce = generate_nonce();
        sf.state = TcpState::SynSent;

        let options = encode_options(&[MptcpOption::JoinSyn {
            backup,
            addr_id: path.loc_id,
            token: self.remote_token,
            nonce: sf.local_nonce,
        }]);
        sf.transport.send_segment(WireSegment {
            seq: sf.snd_isn,
            ack_seq: 0,
            wnd: self.rx.window(),
            syn: true,
            ack: false,
            fin: false,
            rst: false,
            payload: Bytes::new(),
            options,
        })?;
        self.attach_subflow(sf);
        Ok(())
    }

    /// Attach the child subflow of a completed server-side JOIN.
    #[allow(clippy::too_many_arguments)]
    pub fn accept_join_subflow(
        &mut self,
        path_index: u8,
        local: SocketAddr,
        remote: SocketAddr,
        loc_id: u8,
        rem_id: u8,
        backup: bool,
        local_isn: u32,
        remote_isn: u32,
        transport: Box<dyn SubflowTransport>,
    ) {
        let mut sf = Subflow::new(path_index, local, remote, transport);
        sf.loc_id = loc_id;
        sf.rem_id = rem_id;
        sf.backup = backup;
        sf.snd_isn = local_isn;
        sf.snd_nxt = local_isn.wrapping_add(1);
        sf.rcv_isn = remote_isn;
        sf.rcv_nxt = remote_isn.wrapping_add(1);
        sf.state = TcpState::Established;
        self.attach_subflow(sf);
        self.emit_plain(ConnEvent::SubflowEstablished {
            token: self.local_token,
            path_index,
            local,
            remote,
        });
    }

    /// Actions for every published path not yet carried by a subflow.
    /// Only the client side spawns spontaneously.
    pub fn open_pending_paths(&mut self) -> Actions {
        let mut actions = Actions::new();
        if self.server_side || self.fallen_back || self.state != MetaState::Established {
            return actions;
        }
        for path in self.paths.iter() {
            if self.subflows.iter().any(|sf| sf.path_index == path.path_index) {
                continue;
            }
            actions.push(MpcbAction::OpenSubflow {
                path_index: path.path_index,
                local: SocketAddr::new(path.loc_addr, path.loc_port),
                remote: SocketAddr::new(path.rem_addr, path.rem_port),
                loc_id: path.loc_id,
                rem_id: path.rem_id,
                backup: false,
            });
        }
        actions
    }

    /// Add a local address to the inventory, rebuild paths, queue its
    /// advertisement and report the JOINs worth opening.
    pub fn add_local_address(&mut self, addr: std::net::IpAddr) -> Result<Actions> {
        if self.local_addrs.find(addr, 0).is_some()
            || self.master().is_some_and(|m| m.local.ip() == addr)
        {
            return Ok(Actions::new());
        }
        let id = self.local_addrs.next_id();
        self.local_addrs.add(id, addr, 0)?;
        if self.state == MetaState::Established && !self.fallen_back {
            self.refresh_paths();
            self.queue_local_advertisements();
            return Ok(self.open_pending_paths());
        }
        Ok(Actions::new())
    }

    /// Rebuild the path table after an address change.
    pub fn refresh_paths(&mut self) {
        let Some(master) = self.master() else {
            return;
        };
        let master_local = (master.local.ip(), master.local.port());
        let master_remote = (master.remote.ip(), master.remote.port());
        if self.cfg.port_diversity() {
            self.paths.seed_ndiffports(
                self.cfg.ndiffports,
                master_local.0,
                master_remote.0,
                master_remote.1,
            );
        } else {
            self.paths
                .rebuild(&self.local_addrs, &self.remote_addrs, master_local, master_remote);
        }
        self.local_addrs.list_received = false;
        self.remote_addrs.list_received = false;
    }

    // ------------------------------------------------------------------
    // Application surface
    // ------------------------------------------------------------------

    /// Queue application bytes, bounded by the send buffer. Returns how
    /// many bytes were accepted.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize> {
        if self.fallen_back {
            return self.send_fallback(buf);
        }
        if !self.state.can_send() {
            return Err(match self.state {
                MetaState::SynSent => MptcpError::NotConnected,
                _ => MptcpError::ConnectionClosed,
            });
        }
        if self.fin_enqueued {
            return Err(MptcpError::ConnectionClosed);
        }

        let space = self.send_space();
        if space == 0 {
            return Err(MptcpError::WouldBlock);
        }
        let take = buf.len().min(space);
        let mss = usize::from(self.cfg.mss.max(1));
        let mut queued = 0;
        while queued < take {
            let chunk = (take - queued).min(mss);
            let mut seg = Segment::new(Bytes::copy_from_slice(&buf[queued..queued + chunk]));
            seg.data_seq = self.write_seq;
            seg.end_data_seq = self.write_seq.wrapping_add(chunk as u32);
            self.write_seq = seg.end_data_seq;
            self.sendq.push_back(seg);
            queued += chunk;
        }
        self.push()?;
        Ok(take)
    }

    fn send_fallback(&mut self, buf: &[u8]) -> Result<usize> {
        let Some(idx) = self.subflow_idx(1) else {
            return Err(MptcpError::NotConnected);
        };
        let sf = &mut self.subflows[idx];
        let wire = WireSegment {
            seq: sf.snd_nxt,
            ack_seq: sf.rcv_nxt,
            wnd: self.rx.window(),
            syn: false,
            ack: true,
            fin: false,
            rst: false,
            payload: Bytes::copy_from_slice(buf),
            options: Bytes::new(),
        };
        sf.transport.send_segment(wire)?;
        sf.snd_nxt = sf.snd_nxt.wrapping_add(buf.len() as u32);
        Ok(buf.len())
    }

    /// Copy readable meta bytes out. Returns bytes read and whether EOF
    /// was reached.
    pub fn recv(&mut self, buf: &mut [u8]) -> (usize, bool) {
        let out = self.rx.read(buf);
        // Freed receive space may warrant a window update.
        if let Some(wnd) = self.rx.take_window_update() {
            self.send_window_update(wnd);
        }
        out
    }

    /// Bytes ready for the application.
    #[must_use]
    pub fn available(&self) -> usize {
        self.rx.available()
    }

    /// Enqueue the DATA_FIN and start the close sequence.
    pub fn close(&mut self) -> Result<()> {
        if self.fallen_back {
            if let Some(idx) = self.subflow_idx(1) {
                self.subflows[idx].transport.close();
            }
            self.state = MetaState::Closed;
            return Ok(());
        }
        if self.fin_enqueued || !self.state.can_send() {
            return Ok(());
        }
        self.fin_enqueued = true;

        // The terminator consumes one byte of DSN space.
        let marker = Segment::data_fin_marker(self.write_seq);
        self.write_seq = self.write_seq.wrapping_add(1);
        self.sendq.push_back(marker);

        self.state = match self.state {
            MetaState::CloseWait => MetaState::LastAck,
            _ => MetaState::FinWait1,
        };
        debug!(state = ?self.state, "DATA_FIN enqueued");
        self.push()
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Drain the reinjection queue, then the send queue, while the
    /// scheduler finds takers.
    pub fn push(&mut self) -> Result<()> {
        if self.fallen_back {
            return Ok(());
        }
        loop {
            let (seg, from_reinject) = match self.reinject.pop() {
                Some(seg) => (seg, true),
                None => match self.sendq.pop_front() {
                    Some(seg) => (seg, false),
                    None => break,
                },
            };

            let Some(pi) = self.scheduler.select(&self.subflows, self.noneligible, &seg) else {
                if from_reinject {
                    self.reinject.push_front(seg);
                } else {
                    self.sendq.push_front(seg);
                }
                break;
            };
            self.transmit(pi, seg)?;
        }
        Ok(())
    }

    fn transmit(&mut self, path_index: u8, mut seg: Segment) -> Result<()> {
        let extra = std::mem::take(&mut self.pending_opts);
        let data_ack = self.rx.rcv_nxt;
        let wnd = self.rx.window();
        let checksum_on = self.cfg.checksum;
        let infinite = self.send_infinite_mapping;

        let idx = self
            .subflow_idx(path_index)
            .ok_or(MptcpError::SubflowReset { path_index })?;
        let sf = &mut self.subflows[idx];

        let mut opts = Vec::with_capacity(1 + extra.len());
        let mapping = if infinite {
            None
        } else {
            let data_len = seg.len() as u16;
            let sub_seq = sf.rel_snd_nxt();
            let checksum = checksum_on
                .then(|| codec::dss_checksum(seg.data_seq, sub_seq, data_len, &seg.payload));
            Some(DssMapping {
                data_seq: seg.data_seq,
                sub_seq,
                data_len,
                checksum,
            })
        };
        opts.push(MptcpOption::Dss(Dss {
            data_ack: Some(data_ack),
            mapping,
            data_fin: seg.data_fin,
        }));
        opts.extend(extra);

        let wire = WireSegment {
            seq: sf.snd_nxt,
            ack_seq: sf.rcv_nxt,
            wnd,
            syn: false,
            ack: true,
            fin: false,
            rst: false,
            payload: seg.payload.clone(),
            options: encode_options(&opts),
        };
        sf.transport.send_segment(wire)?;
        sf.snd_nxt = sf.snd_nxt.wrapping_add(seg.len() as u32);
        seg.mark_carried(path_index);
        trace!(
            path_index,
            data_seq = seg.data_seq,
            len = seg.len(),
            data_fin = seg.data_fin,
            "meta segment transmitted"
        );
        sf.rtx.push_back(seg);
        Ok(())
    }

    /// Announce the receive window (and current DATA_ACK) on the best
    /// available subflow.
    fn send_window_update(&mut self, wnd: u32) {
        let data_ack = self.rx.rcv_nxt;
        let extra = std::mem::take(&mut self.pending_opts);
        let Some(sf) = self
            .subflows
            .iter_mut()
            .find(|sf| sf.state.can_send() && !sf.pf)
        else {
            self.pending_opts = extra;
            return;
        };
        let mut opts = vec![MptcpOption::Dss(Dss::ack(data_ack))];
        opts.extend(extra);
        let wire = WireSegment::bare_ack(sf.snd_nxt, sf.rcv_nxt, wnd, encode_options(&opts));
        if sf.transport.send_segment(wire).is_err() {
            trace!(path_index = sf.path_index, "window update dropped");
        }
    }

    /// Advance the data-level acknowledgment point.
    pub fn on_data_ack(&mut self, data_ack: u32) {
        if !seq::after(data_ack, self.snd_una) {
            return;
        }
        if seq::after(data_ack, self.write_seq) {
            // Acking bytes never sent: ignore, the peer is confused.
            warn!(data_ack, write_seq = self.write_seq, "DATA_ACK beyond write_seq");
            return;
        }
        self.snd_una = data_ack;
        for sf in &mut self.subflows {
            sf.prune_rtx(data_ack);
        }
        self.reinject.prune_acked(data_ack);

        // Our DATA_FIN was acknowledged once everything is acked.
        if self.fin_enqueued && self.snd_una == self.write_seq {
            self.state = match self.state {
                MetaState::FinWait1 => MetaState::FinWait2,
                MetaState::Closing | MetaState::LastAck => {
                    self.close_all_subflows();
                    MetaState::Closed
                }
                other => other,
            };
            if self.state == MetaState::Closed {
                self.emit_plain(ConnEvent::Closed {
                    token: self.local_token,
                });
            }
        }
    }

    fn close_all_subflows(&mut self) {
        for sf in &mut self.subflows {
            sf.transport.close();
            sf.state = TcpState::Closed;
        }
    }

    // ------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------

    /// Declare a subflow potentially failed and arm reinjection.
    pub fn mark_potentially_failed(&mut self, path_index: u8) -> Result<()> {
        let Some(idx) = self.subflow_idx(path_index) else {
            return Ok(());
        };
        if self.subflows[idx].pf {
            return Ok(());
        }
        self.subflows[idx].pf = true;
        self.emit_plain(ConnEvent::SubflowPotentiallyFailed {
            token: self.local_token,
            path_index,
        });

        // Everything this path still owes gets cloned for the others.
        let eligible_mask: u32 = self
            .subflows
            .iter()
            .filter(|sf| sf.attached && !sf.pf && sf.state.can_send())
            .map(Subflow::path_mask)
            .fold(0, |m, b| m | b);
        let rtx = std::mem::take(&mut self.subflows[idx].rtx);
        self.reinject.harvest(&rtx, eligible_mask);
        self.subflows[idx].rtx = rtx;
        self.push()
    }

    /// Clear the potentially-failed mark (path recovered).
    pub fn clear_potentially_failed(&mut self, path_index: u8) {
        if let Some(idx) = self.subflow_idx(path_index) {
            self.subflows[idx].pf = false;
        }
    }

    /// Interface link transition: UP clears `pf` on matching subflows
    /// and may grow the local inventory; DOWN marks them potentially
    /// failed without teardown. Both families are treated alike.
    pub fn on_link_event(&mut self, event: LinkEvent) -> Result<Actions> {
        match event {
            LinkEvent::Up(addr) => {
                let mut matched = false;
                for sf in &mut self.subflows {
                    if sf.local.ip() == addr {
                        sf.pf = false;
                        matched = true;
                    }
                }
                let master_local = self.master().map(|m| m.local.ip());
                if !matched && master_local != Some(addr) && self.local_addrs.find(addr, 0).is_none()
                {
                    let id = self.local_addrs.next_id();
                    if self.local_addrs.add(id, addr, 0).is_ok() {
                        self.refresh_paths();
                        self.queue_local_advertisements();
                        return Ok(self.open_pending_paths());
                    }
                }
                Ok(Actions::new())
            }
            LinkEvent::Down(addr) => {
                let failed: Vec<u8> = self
                    .subflows
                    .iter()
                    .filter(|sf| sf.local.ip() == addr)
                    .map(|sf| sf.path_index)
                    .collect();
                for pi in failed {
                    self.mark_potentially_failed(pi)?;
                }
                Ok(Actions::new())
            }
        }
    }

    /// Queue ADD_ADDR options for local addresses not yet advertised.
    pub fn queue_local_advertisements(&mut self) {
        for entry in self.local_addrs.take_unadvertised() {
            self.pending_opts.push(MptcpOption::AddAddr {
                addr_id: entry.id,
                addr: entry.addr,
                port: (entry.port != 0).then_some(entry.port),
            });
        }
    }

    /// Revert to plain TCP on the master.
    fn fallback(&mut self) {
        warn!(token = self.local_token, "falling back to plain TCP");
        self.fallen_back = true;
        self.state = MetaState::Established;
        self.emit_plain(ConnEvent::FallbackToTcp {
            token: self.local_token,
        });
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Feed one wire segment received on a subflow.
    ///
    /// # Errors
    ///
    /// `MappingViolation` is fatal: the block is already torn down when
    /// it returns and the caller must drop it from the registry.
    pub fn on_subflow_segment(&mut self, path_index: u8, wire: WireSegment) -> Result<Actions> {
        let mut actions = Actions::new();
        let Some(idx) = self.subflow_idx(path_index) else {
            return Ok(actions);
        };

        if wire.rst {
            self.handle_subflow_reset(path_index);
            return Ok(actions);
        }

        if self.fallen_back {
            self.ingest_fallback(idx, &wire);
            return Ok(actions);
        }

        let opts = decode_options(&wire.options);

        // Handshake stages first.
        match self.subflows[idx].state {
            TcpState::SynSent if wire.syn && wire.ack => {
                return self.handle_synack(idx, &wire, &opts);
            }
            TcpState::SynSent | TcpState::SynReceived | TcpState::Closed => {
                // Nothing else is meaningful before establishment.
                return Ok(actions);
            }
            _ => {}
        }

        // Option side effects.
        let mut dss: Option<Dss> = None;
        for opt in &opts {
            match opt {
                MptcpOption::Dss(d) => dss = Some(*d),
                MptcpOption::AddAddr { addr_id, addr, port } => {
                    self.handle_add_addr(*addr_id, *addr, port.unwrap_or(0), &mut actions);
                }
                MptcpOption::RemoveAddr { ids } => {
                    for id in ids {
                        self.handle_remove_addr(*id);
                    }
                }
                MptcpOption::Fail { dsn } => {
                    debug!(dsn, "peer signalled infinite-mapping fallback");
                    self.infinite_mapping_rcv = true;
                }
                _ => {}
            }
        }

        if let Some(d) = dss {
            if let Some(ack) = d.data_ack {
                self.on_data_ack(ack);
            }
        }

        // Option handling may have detached subflows; re-resolve.
        let Some(idx) = self.subflow_idx(path_index) else {
            return Ok(actions);
        };

        // Payload (and DATA_FIN) processing.
        let delivered = self.ingest_payload(idx, &wire, dss)?;
        if delivered {
            // Freshly delivered bytes schedule a DATA_ACK.
            if let Some(wnd) = self.rx.take_window_update() {
                self.send_window_update(wnd);
            }
        }

        // A DATA_ACK may have opened send room.
        self.push()?;
        Ok(actions)
    }

    fn handle_synack(
        &mut self,
        idx: usize,
        wire: &WireSegment,
        opts: &[MptcpOption],
    ) -> Result<Actions> {
        let mut actions = Actions::new();
        let path_index = self.subflows[idx].path_index;
        {
            let sf = &mut self.subflows[idx];
            sf.rcv_isn = wire.seq;
            sf.rcv_nxt = wire.seq.wrapping_add(1);
        }

        if path_index == 1 {
            // Master: CAPABLE must be present or we fall back.
            match find_capable(opts) {
                Some(MptcpOption::CapableSynAck { key, checksum }) => {
                    self.remote_key = *key;
                    self.remote_token = token_of(*key);
                    self.rx = MetaReceiver::new(idsn_of(*key), self.rx.rcvbuf);
                    // Checksums run when either end requires them.
                    let checksum = *checksum || self.cfg.checksum;
                    self.cfg.checksum = checksum;

                    let ack_opts = encode_options(&[MptcpOption::CapableAck {
                        checksum,
                        key: self.local_key,
                        peer_key: self.remote_key,
                    }]);
                    let sf = &mut self.subflows[idx];
                    sf.state = TcpState::Established;
                    let wire_out =
                        WireSegment::bare_ack(sf.snd_nxt, sf.rcv_nxt, self.rx.window(), ack_opts);
                    sf.transport.send_segment(wire_out)?;

                    self.state = MetaState::Established;
                    self.emit(|token, m| ConnEvent::SubflowEstablished {
                        token,
                        path_index: 1,
                        local: m.local,
                        remote: m.remote,
                    });
                    self.queue_local_advertisements();
                    self.refresh_paths();
                    actions.extend(self.open_pending_paths());
                    Ok(actions)
                }
                _ => {
                    // No CAPABLE: plain TCP from here on. The embedder
                    // releases the block.
                    let sf = &mut self.subflows[idx];
                    sf.state = TcpState::Established;
                    let wire_out = WireSegment::bare_ack(
                        sf.snd_nxt,
                        sf.rcv_nxt,
                        self.rx.window(),
                        Bytes::new(),
                    );
                    sf.transport.send_segment(wire_out)?;
                    self.fallback();
                    actions.push(MpcbAction::Fallback);
                    Ok(actions)
                }
            }
        } else {
            // Slave: JOIN SYN-ACK must authenticate.
            match find_join(opts) {
                Some(MptcpOption::JoinSynAck { auth, nonce, .. }) => {
                    let expected = join_auth_word(
                        self.remote_key,
                        self.local_key,
                        *nonce,
                        self.subflows[idx].local_nonce,
                    );
                    if *auth != expected {
                        warn!(path_index, "JOIN SYN-ACK failed authentication");
                        self.subflows[idx].transport.reset();
                        self.detach_subflow(path_index);
                        return Err(MptcpError::JoinAuthFailed);
                    }
                    let digest = join_auth_digest(
                        self.local_key,
                        self.remote_key,
                        self.subflows[idx].local_nonce,
                        *nonce,
                    );
                    let ack_opts = encode_options(&[MptcpOption::JoinAck { auth: digest }]);
                    let wnd = self.rx.window();
                    let sf = &mut self.subflows[idx];
                    sf.state = TcpState::Established;
                    let wire_out = WireSegment::bare_ack(sf.snd_nxt, sf.rcv_nxt, wnd, ack_opts);
                    sf.transport.send_segment(wire_out)?;
                    self.emit_plain(ConnEvent::SubflowEstablished {
                        token: self.local_token,
                        path_index,
                        local: self.subflows[idx].local,
                        remote: self.subflows[idx].remote,
                    });
                    // New capacity: move queued data.
                    self.push()?;
                    Ok(actions)
                }
                _ => {
                    warn!(path_index, "JOIN SYN-ACK missing, resetting subflow");
                    self.subflows[idx].transport.reset();
                    self.detach_subflow(path_index);
                    Ok(actions)
                }
            }
        }
    }

    fn handle_add_addr(&mut self, addr_id: u8, addr: std::net::IpAddr, port: u16, actions: &mut Actions) {
        match self.remote_addrs.add(addr_id, addr, port) {
            Ok(update) => {
                if update != crate::path::AddrUpdate::Unchanged {
                    self.emit_plain(ConnEvent::AddressAdded {
                        token: self.local_token,
                        addr_id,
                        addr: SocketAddr::new(addr, port),
                    });
                    self.refresh_paths();
                    actions.extend(self.open_pending_paths());
                }
            }
            Err(err) => warn!(addr_id, %addr, "ADD_ADDR dropped: {err}"),
        }
    }

    fn handle_remove_addr(&mut self, addr_id: u8) {
        if !self.remote_addrs.remove_id(addr_id) {
            return;
        }
        self.emit_plain(ConnEvent::AddressRemoved {
            token: self.local_token,
            addr_id,
        });
        let dropped = self.paths.drop_remote_id(addr_id);
        for pi in dropped {
            if let Some(idx) = self.subflow_idx(pi) {
                self.subflows[idx].transport.reset();
                self.detach_subflow(pi);
            }
        }
        self.refresh_paths();
    }

    /// NAT rule applied from the JOIN path: the source address observed
    /// on a JOIN wins over what ADD_ADDR announced for that id.
    pub fn note_join_source(&mut self, addr_id: u8, observed: SocketAddr) {
        if let Some(entry) = self.remote_addrs.get(addr_id) {
            if entry.addr != observed.ip() {
                let _ = self
                    .remote_addrs
                    .add(addr_id, observed.ip(), entry.port);
                self.refresh_paths();
            }
        }
    }

    fn handle_subflow_reset(&mut self, path_index: u8) {
        warn!(path_index, "subflow reset by peer");
        let had = self.detach_subflow(path_index).is_some();
        if !had {
            return;
        }
        if self.subflows.is_empty() {
            self.state = MetaState::Closed;
            self.emit_plain(ConnEvent::Closed {
                token: self.local_token,
            });
        } else {
            // Outstanding data is covered by reinjection on survivors.
            let _ = self.push();
        }
    }

    fn ingest_fallback(&mut self, idx: usize, wire: &WireSegment) {
        if wire.payload.is_empty() {
            return;
        }
        let sf = &mut self.subflows[idx];
        sf.rcv_nxt = wire.seq.wrapping_add(wire.payload.len() as u32);
        let mut seg = Segment::new(wire.payload.clone());
        seg.data_seq = self.rx.rcv_nxt;
        seg.end_data_seq = self.rx.rcv_nxt.wrapping_add(wire.payload.len() as u32);
        let _ = self.rx.ingest(seg);
    }

    /// Map and reassemble the payload of one wire segment. Returns
    /// whether anything reached the meta layer.
    fn ingest_payload(
        &mut self,
        idx: usize,
        wire: &WireSegment,
        dss: Option<Dss>,
    ) -> Result<bool> {
        let path_index = self.subflows[idx].path_index;
        let mapping = dss.and_then(|d| d.mapping);
        let data_fin = dss.is_some_and(|d| d.data_fin);

        if wire.payload.is_empty() && !data_fin && !wire.fin {
            return Ok(false);
        }

        // Checksum validation runs when the segment covers its whole
        // mapping; a mismatch resets the carrying subflow and tells the
        // peer to stop mapping.
        if let Some(m) = mapping {
            if self.cfg.checksum {
                if let Some(stored) = m.checksum {
                    if wire.payload.len() == usize::from(m.data_len) {
                        let computed = codec::dss_checksum(
                            m.data_seq,
                            m.sub_seq,
                            m.data_len,
                            &wire.payload,
                        );
                        if computed != stored {
                            return self.checksum_failure(path_index);
                        }
                    }
                }
            }
        }

        // Build the meta segment, rebasing the wire-relative sub_seq.
        let mut seg = Segment::new(wire.payload.clone());
        seg.seq = wire.seq;
        seg.fin = wire.fin;
        seg.data_fin = data_fin;
        if let Some(m) = mapping {
            let rcv_isn = self.subflows[idx].rcv_isn;
            seg.sub_seq = rcv_isn.wrapping_add(m.sub_seq);
            seg.data_seq = m.data_seq;
            seg.data_len = m.data_len;
            seg.end_data_seq = m
                .data_seq
                .wrapping_add(u32::from(m.data_len))
                .wrapping_add(u32::from(data_fin));
            seg.has_checksum = m.checksum.is_some();
        } else if data_fin && wire.payload.is_empty() {
            // DATA_FIN with no mapping: it sits right at the peer's
            // current send point.
            let delivered = self.rx.ingest(Segment::data_fin_marker(self.rx.rcv_nxt));
            self.apply_delivery(delivered);
            self.advance_subflow_rcv(idx, wire);
            return Ok(true);
        }

        let verdict = {
            let sf = &mut self.subflows[idx];
            mapping::apply(&mut sf.cursor, &mut seg, self.rx.rcv_nxt, self.infinite_mapping_rcv)
        };
        let verdict = match verdict {
            Ok(v) => v,
            Err(err) => {
                // Mapping violations are fatal for the whole block.
                warn!(path_index, "mapping violation, tearing down");
                self.teardown();
                return Err(err);
            }
        };

        self.advance_subflow_rcv(idx, wire);

        match verdict {
            None => Ok(false),
            Some(MapVerdict::InOrder | MapVerdict::OutOfOrder) => {
                let delivered = self.rx.ingest(seg);
                self.apply_delivery(delivered);
                Ok(!matches!(delivered, Ingest::Duplicate))
            }
        }
    }

    fn advance_subflow_rcv(&mut self, idx: usize, wire: &WireSegment) {
        let sf = &mut self.subflows[idx];
        let mut nxt = wire.seq.wrapping_add(wire.payload.len() as u32);
        if wire.fin {
            nxt = nxt.wrapping_add(1);
            if sf.state == TcpState::Established {
                sf.state = TcpState::CloseWait;
            }
        }
        if seq::after(nxt, sf.rcv_nxt) {
            sf.rcv_nxt = nxt;
        }
    }

    fn apply_delivery(&mut self, delivered: Ingest) {
        if let Ingest::Delivered { data_fin: true, .. } = delivered {
            self.state = match self.state {
                MetaState::Established => MetaState::CloseWait,
                MetaState::FinWait1 => MetaState::Closing,
                MetaState::FinWait2 => {
                    // The peer still waits for this last DATA_ACK; it
                    // must leave before the subflows shut.
                    let wnd = self.rx.window();
                    self.send_window_update(wnd);
                    self.close_all_subflows();
                    self.emit_plain(ConnEvent::Closed {
                        token: self.local_token,
                    });
                    MetaState::Closed
                }
                other => other,
            };
            debug!(state = ?self.state, "DATA_FIN received");
        }
    }

    fn checksum_failure(&mut self, path_index: u8) -> Result<bool> {
        warn!(path_index, "DSS checksum mismatch");
        if let Some(idx) = self.subflow_idx(path_index) {
            self.subflows[idx].transport.reset();
        }
        self.detach_subflow(path_index);

        // Data was exchanged: tell the peer to stop mapping.
        if self.rx.rcv_nxt != self.rx.initial_dsn || self.snd_una != self.write_seq {
            self.pending_opts.push(MptcpOption::Fail {
                dsn: self.rx.rcv_nxt,
            });
            self.send_infinite_mapping = true;
            let wnd = self.rx.window();
            self.send_window_update(wnd);
        }
        Err(MptcpError::ChecksumMismatch { path_index })
    }

    /// Tear the whole block down (fatal protocol violation).
    pub fn teardown(&mut self) {
        for sf in &mut self.subflows {
            sf.transport.reset();
            sf.state = TcpState::Closed;
        }
        self.state = MetaState::Closed;
        self.emit_plain(ConnEvent::Closed {
            token: self.local_token,
        });
    }

    /// Subflow-level acknowledgment advanced: room may have opened.
    pub fn on_subflow_ack(&mut self, _path_index: u8) -> Result<()> {
        self.push()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subflow::TcpInfo;
    use std::sync::Arc;

    /// Transport that records everything the block transmits.
    #[derive(Clone)]
    struct RecordingTransport {
        sent: Arc<parking_lot::Mutex<Vec<WireSegment>>>,
        info: TcpInfo,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                sent: Arc::new(parking_lot::Mutex::new(Vec::new())),
                info: TcpInfo::default(),
            }
        }

        fn sent(&self) -> Vec<WireSegment> {
            self.sent.lock().clone()
        }

        fn last(&self) -> WireSegment {
            self.sent.lock().last().cloned().expect("nothing sent")
        }
    }

    impl SubflowTransport for RecordingTransport {
        fn send_segment(&mut self, seg: WireSegment) -> Result<()> {
            self.sent.lock().push(seg);
            Ok(())
        }
        fn close(&mut self) {}
        fn reset(&mut self) {}
        fn info(&self) -> TcpInfo {
            self.info
        }
    }

    const CLIENT_KEY: u64 = 0x1111_2222_3333_4444;
    const SERVER_KEY: u64 = 0x5555_6666_7777_8888;
    const SERVER_ISN: u32 = 9000;

    fn client() -> (Mpcb, RecordingTransport) {
        let t = RecordingTransport::new();
        let mpcb = Mpcb::new_client(
            MptcpConfig::default(),
            CLIENT_KEY,
            "10.0.0.2:5000".parse().unwrap(),
            "10.0.0.1:80".parse().unwrap(),
            Box::new(t.clone()),
            None,
        )
        .unwrap();
        (mpcb, t)
    }

    fn synack(options: bytes::Bytes) -> WireSegment {
        WireSegment {
            seq: SERVER_ISN,
            ack_seq: 0,
            wnd: 65535,
            syn: true,
            ack: true,
            fin: false,
            rst: false,
            payload: Bytes::new(),
            options,
        }
    }

    fn establish(mpcb: &mut Mpcb) {
        let opts = encode_options(&[MptcpOption::CapableSynAck {
            checksum: false,
            key: SERVER_KEY,
        }]);
        mpcb.on_subflow_segment(1, synack(opts)).unwrap();
        assert_eq!(mpcb.state, MetaState::Established);
    }

    fn dss_of(wire: &WireSegment) -> Option<Dss> {
        decode_options(&wire.options).iter().find_map(|o| match o {
            MptcpOption::Dss(d) => Some(*d),
            _ => None,
        })
    }

    #[test]
    fn master_syn_carries_capable() {
        let (_mpcb, t) = client();
        let syn = &t.sent()[0];
        assert!(syn.syn && !syn.ack);
        let opts = decode_options(&syn.options);
        assert!(matches!(opts[0], MptcpOption::CapableSyn { .. }));
    }

    #[test]
    fn establishment_derives_tokens_and_idsns() {
        let (mut mpcb, t) = client();
        establish(&mut mpcb);

        assert_eq!(mpcb.remote_key, SERVER_KEY);
        assert_eq!(mpcb.remote_token, token_of(SERVER_KEY));
        assert_eq!(mpcb.rx.rcv_nxt, idsn_of(SERVER_KEY));
        assert_eq!(mpcb.write_seq, idsn_of(CLIENT_KEY));
        assert_eq!(mpcb.snd_una, mpcb.write_seq);

        // The final handshake ACK echoes both keys.
        let ack = t.last();
        let opts = decode_options(&ack.options);
        assert!(matches!(
            opts[0],
            MptcpOption::CapableAck {
                key: CLIENT_KEY,
                peer_key: SERVER_KEY,
                ..
            }
        ));
    }

    #[test]
    fn missing_capable_falls_back() {
        let (mut mpcb, t) = client();
        let actions = mpcb.on_subflow_segment(1, synack(Bytes::new())).unwrap();
        assert!(actions.contains(&MpcbAction::Fallback));
        assert!(mpcb.fallen_back);
        assert_eq!(mpcb.state, MetaState::Established);

        // Sends keep flowing, without any MPTCP options.
        mpcb.send(b"plain").unwrap();
        let wire = t.last();
        assert_eq!(&wire.payload[..], b"plain");
        assert!(wire.options.is_empty());
    }

    #[test]
    fn send_chunks_by_mss_and_stamps_mappings() {
        let (mut mpcb, t) = client();
        establish(&mut mpcb);
        let before = t.sent().len();

        let data = vec![7u8; 3000];
        assert_eq!(mpcb.send(&data).unwrap(), 3000);

        let sent = t.sent();
        let chunks: Vec<_> = sent[before..].iter().filter(|w| !w.payload.is_empty()).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].payload.len(), 1400);
        assert_eq!(chunks[2].payload.len(), 200);

        // Mappings are contiguous in DSN space from the initial DSN.
        let mut dsn = idsn_of(CLIENT_KEY);
        for chunk in &chunks {
            let map = dss_of(chunk).unwrap().mapping.unwrap();
            assert_eq!(map.data_seq, dsn);
            assert_eq!(usize::from(map.data_len), chunk.payload.len());
            dsn = dsn.wrapping_add(u32::from(map.data_len));
        }
        assert_eq!(mpcb.write_seq, dsn);

        // Everything sits in the subflow retransmit view until a
        // DATA_ACK covers it.
        assert_eq!(mpcb.subflow(1).unwrap().rtx.len(), 3);
        assert_eq!(mpcb.inflight_bytes(), 3000);
    }

    #[test]
    fn data_ack_prunes_retransmit_state() {
        let (mut mpcb, _t) = client();
        establish(&mut mpcb);
        mpcb.send(&[1u8; 2000]).unwrap();

        let ack_opts = encode_options(&[MptcpOption::Dss(Dss::ack(mpcb.write_seq))]);
        let wire = WireSegment::bare_ack(SERVER_ISN + 1, 0, 65535, ack_opts);
        mpcb.on_subflow_segment(1, wire).unwrap();

        assert_eq!(mpcb.snd_una, mpcb.write_seq);
        assert!(mpcb.subflow(1).unwrap().rtx.is_empty());
    }

    #[test]
    fn close_enqueues_data_fin_and_walks_the_state_machine() {
        let (mut mpcb, t) = client();
        establish(&mut mpcb);

        mpcb.send(b"tail").unwrap();
        mpcb.close().unwrap();
        assert!(mpcb.fin_enqueued);
        assert_eq!(mpcb.state, MetaState::FinWait1);
        // The terminator consumed one DSN byte past the payload.
        assert_eq!(mpcb.write_seq, idsn_of(CLIENT_KEY).wrapping_add(5));

        let fin_wire = t.last();
        assert!(dss_of(&fin_wire).unwrap().data_fin);

        // Peer acknowledges everything including the terminator.
        let ack_opts = encode_options(&[MptcpOption::Dss(Dss::ack(mpcb.write_seq))]);
        mpcb.on_subflow_segment(1, WireSegment::bare_ack(SERVER_ISN + 1, 0, 65535, ack_opts))
            .unwrap();
        assert_eq!(mpcb.state, MetaState::FinWait2);

        // Peer's own DATA_FIN finishes the exchange.
        let fin_opts = encode_options(&[MptcpOption::Dss(Dss {
            data_ack: Some(mpcb.write_seq),
            mapping: Some(DssMapping {
                data_seq: idsn_of(SERVER_KEY),
                sub_seq: 1,
                data_len: 0,
                checksum: None,
            }),
            data_fin: true,
        })]);
        let wire = WireSegment {
            seq: SERVER_ISN + 1,
            ack_seq: 0,
            wnd: 65535,
            syn: false,
            ack: true,
            fin: false,
            rst: false,
            payload: Bytes::new(),
            options: fin_opts,
        };
        mpcb.on_subflow_segment(1, wire).unwrap();
        assert_eq!(mpcb.state, MetaState::Closed);
    }

    #[test]
    fn incoming_mapped_payload_reaches_the_reader_and_is_acked() {
        let (mut mpcb, t) = client();
        establish(&mut mpcb);

        let payload = Bytes::from_static(b"hello");
        let opts = encode_options(&[MptcpOption::Dss(Dss {
            data_ack: Some(mpcb.write_seq),
            mapping: Some(DssMapping {
                data_seq: idsn_of(SERVER_KEY),
                sub_seq: 1,
                data_len: 5,
                checksum: None,
            }),
            data_fin: false,
        })]);
        let wire = WireSegment {
            seq: SERVER_ISN + 1,
            ack_seq: 0,
            wnd: 65535,
            syn: false,
            ack: true,
            fin: false,
            rst: false,
            payload,
            options: opts,
        };
        mpcb.on_subflow_segment(1, wire).unwrap();

        assert_eq!(mpcb.available(), 5);
        let mut buf = [0u8; 8];
        let (n, eof) = mpcb.recv(&mut buf);
        assert_eq!((n, eof), (5, false));
        assert_eq!(&buf[..5], b"hello");

        // Delivery scheduled a DATA_ACK covering the new bytes.
        let ack = t.last();
        assert_eq!(
            dss_of(&ack).unwrap().data_ack,
            Some(idsn_of(SERVER_KEY).wrapping_add(5))
        );
    }

    #[test]
    fn meta_send_buffer_is_the_sum_over_subflows() {
        let (mut mpcb, _t) = client();
        establish(&mut mpcb);
        let single = mpcb.sndbuf;

        let t2 = RecordingTransport::new();
        let mut extra = Subflow::new(
            2,
            "10.0.2.2:5001".parse().unwrap(),
            "10.0.0.1:80".parse().unwrap(),
            Box::new(t2),
        );
        extra.state = TcpState::Established;
        mpcb.attach_subflow(extra);

        assert_eq!(mpcb.cnt_subflows(), 2);
        assert_eq!(mpcb.sndbuf, single * 2);

        mpcb.detach_subflow(2).unwrap();
        assert_eq!(mpcb.sndbuf, single);
    }

    #[test]
    fn send_before_establishment_is_refused() {
        let (mut mpcb, _t) = client();
        assert!(matches!(
            mpcb.send(b"early"),
            Err(MptcpError::NotConnected)
        ));
    }

    #[test]
    fn send_buffer_backpressure() {
        let (mut mpcb, _t) = client();
        establish(&mut mpcb);
        let space = mpcb.send_space();
        let data = vec![0u8; space + 1];
        assert_eq!(mpcb.send(&data).unwrap(), space);
        // No acks came back yet: the buffer is full.
        assert!(matches!(mpcb.send(&[0u8]), Err(MptcpError::WouldBlock)));
    }
}
