//! Subflow state and the TCP subflow contract.
//!
//! A subflow is one TCP connection contributing to a meta-connection.
//! The TCP machine itself (congestion control, retransmission, in-order
//! delivery per subflow) lives behind [`SubflowTransport`]; this module
//! keeps the multipath-side state: the path index, the mapping cursor,
//! the potentially-failed flag, and the retransmit view of meta
//! segments in flight on this path.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use braid_core::error::Result;
use braid_core::segment::Segment;
use bytes::Bytes;

use crate::mapping::MappingCursor;

/// TCP connection states, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// The subflow can carry fresh meta data.
    #[must_use]
    pub const fn can_send(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }
}

/// Readable per-subflow TCP state, sampled from the transport.
#[derive(Debug, Clone, Copy)]
pub struct TcpInfo {
    pub srtt: Duration,
    pub snd_cwnd: u32,
    pub in_flight: u32,
    pub state: TcpState,
    pub rcv_mss: u16,
    pub loss_recovery: bool,
    pub sndbuf: usize,
    pub rcvbuf: usize,
    pub rcv_ssthresh: u32,
    pub window_clamp: u32,
}

impl Default for TcpInfo {
    fn default() -> Self {
        Self {
            srtt: Duration::from_millis(100),
            snd_cwnd: u32::MAX,
            in_flight: 0,
            state: TcpState::Established,
            rcv_mss: 1400,
            loss_recovery: false,
            sndbuf: 256 * 1024,
            rcvbuf: 256 * 1024,
            rcv_ssthresh: 64 * 1024,
            window_clamp: 1 << 20,
        }
    }
}

/// One TCP segment as it crosses the subflow boundary, in either
/// direction. `options` is the raw TCP option region carrying the
/// multipath options.
#[derive(Debug, Clone)]
pub struct WireSegment {
    pub seq: u32,
    pub ack_seq: u32,
    pub wnd: u32,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Bytes,
    pub options: Bytes,
}

impl WireSegment {
    /// An empty ACK carrier at `seq`.
    #[must_use]
    pub fn bare_ack(seq: u32, ack_seq: u32, wnd: u32, options: Bytes) -> Self {
        Self {
            seq,
            ack_seq,
            wnd,
            syn: false,
            ack: true,
            fin: false,
            rst: false,
            payload: Bytes::new(),
            options,
        }
    }
}

/// The contract the external TCP machine fulfills for each subflow.
///
/// The transport owns reliability and ordering on its own path. It must
/// feed every payload delivery back through the connection's
/// `on_subflow_segment` and report send-window advances through
/// `on_subflow_ack`.
pub trait SubflowTransport: Send {
    /// Hand a segment to TCP for transmission.
    fn send_segment(&mut self, seg: WireSegment) -> Result<()>;

    /// Orderly close of this subflow.
    fn close(&mut self);

    /// Abortive reset of this subflow.
    fn reset(&mut self);

    /// Sample the readable TCP state.
    fn info(&self) -> TcpInfo;
}

/// Multipath-side state of one subflow.
pub struct Subflow {
    pub path_index: u8,
    pub loc_id: u8,
    pub rem_id: u8,
    pub local: SocketAddr,
    pub remote: SocketAddr,

    /// Backup priority: scheduled only when no regular path is usable.
    pub backup: bool,

    /// Potentially failed: excluded from scheduling until it recovers.
    pub pf: bool,

    /// On the connection's list.
    pub attached: bool,

    pub state: TcpState,

    /// The active receive-side DSS mapping.
    pub cursor: Option<MappingCursor>,

    /// Our initial sequence number; wire `sub_seq` on sends is relative
    /// to it.
    pub snd_isn: u32,

    /// Peer's initial sequence number; wire `sub_seq` on receptions is
    /// relative to it.
    pub rcv_isn: u32,

    /// Next subflow sequence we will transmit at.
    pub snd_nxt: u32,

    /// Next subflow sequence expected from the peer.
    pub rcv_nxt: u32,

    /// Meta segments sent on this path and not yet data-acked.
    pub rtx: VecDeque<Segment>,

    /// JOIN handshake nonce we generated (slaves only).
    pub local_nonce: u32,

    pub transport: Box<dyn SubflowTransport>,
}

impl std::fmt::Debug for Subflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subflow")
            .field("path_index", &self.path_index)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("pf", &self.pf)
            .field("backup", &self.backup)
            .field("rtx", &self.rtx.len())
            .finish_non_exhaustive()
    }
}

impl Subflow {
    /// Build a subflow around a transport. The caller assigns sequence
    /// numbers as its handshake progresses.
    #[must_use]
    pub fn new(
        path_index: u8,
        local: SocketAddr,
        remote: SocketAddr,
        transport: Box<dyn SubflowTransport>,
    ) -> Self {
        Self {
            path_index,
            loc_id: 0,
            rem_id: 0,
            local,
            remote,
            backup: false,
            pf: false,
            attached: false,
            state: TcpState::Closed,
            cursor: None,
            snd_isn: 0,
            rcv_isn: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            rtx: VecDeque::new(),
            local_nonce: 0,
            transport,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_master(&self) -> bool {
        self.path_index == 1
    }

    #[inline]
    #[must_use]
    pub const fn is_slave(&self) -> bool {
        !self.is_master()
    }

    /// This subflow's bit in a path mask.
    #[inline]
    #[must_use]
    pub const fn path_mask(&self) -> u32 {
        1u32 << (self.path_index - 1)
    }

    /// Wire-relative send sequence for the next byte.
    #[inline]
    #[must_use]
    pub const fn rel_snd_nxt(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_isn)
    }

    /// Sample transport state.
    #[must_use]
    pub fn info(&self) -> TcpInfo {
        self.transport.info()
    }

    /// Congestion window has room for one more segment.
    #[must_use]
    pub fn cwnd_has_room(&self) -> bool {
        let info = self.info();
        info.in_flight < info.snd_cwnd
    }

    /// Prune the retransmit view up to a data-level acknowledgment.
    pub fn prune_rtx(&mut self, data_ack: u32) {
        while let Some(front) = self.rtx.front() {
            if braid_core::seq::at_or_before(front.end_data_seq, data_ack) {
                self.rtx.pop_front();
            } else {
                break;
            }
        }
    }
}
