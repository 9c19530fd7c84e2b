//! Meta reassembly.
//!
//! Two queues in DSN space: the receive queue, contiguous from
//! `rcv_nxt`, and the out-of-order queue, sorted by `data_seq`. Subflows
//! deliver mapped segments in their own order; this module restores the
//! meta order, coalesces overlaps, and hands the application a single
//! byte stream ending in a DATA_FIN terminator.

use std::collections::VecDeque;

use braid_core::buffer::RecvBuffer;
use braid_core::segment::Segment;
use braid_core::seq;
use bytes::Buf;
use tracing::trace;

/// Outcome of ingesting one mapped segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Entirely before `rcv_nxt`; dropped.
    Duplicate,

    /// Parked on the out-of-order queue.
    Queued,

    /// Appended in meta order. `bytes` counts payload made readable
    /// (including drained out-of-order followers); `data_fin` reports
    /// that the stream terminator was reached.
    Delivered { bytes: usize, data_fin: bool },
}

/// Per-connection receive state in DSN space.
#[derive(Debug)]
pub struct MetaReceiver {
    /// Next DSN expected in meta order.
    pub rcv_nxt: u32,

    /// DSN up to which the application has consumed.
    pub copied_seq: u32,

    /// First DSN of the connection; every queued byte is at or after it.
    pub initial_dsn: u32,

    /// Receive buffer budget, the sum over subflow rcvbufs.
    pub rcvbuf: usize,

    /// Peer sent DATA_FIN and it was reached in sequence.
    pub rcv_shutdown: bool,

    rcvq: RecvBuffer,
    ofo: VecDeque<Segment>,
    announced_wnd: u32,
    ack_scheduled: bool,
    fin_consumed: bool,
}

impl MetaReceiver {
    #[must_use]
    pub fn new(initial_dsn: u32, rcvbuf: usize) -> Self {
        Self {
            rcv_nxt: initial_dsn,
            copied_seq: initial_dsn,
            initial_dsn,
            rcvbuf,
            rcv_shutdown: false,
            rcvq: RecvBuffer::new(),
            ofo: VecDeque::new(),
            announced_wnd: rcvbuf as u32,
            ack_scheduled: false,
            fin_consumed: false,
        }
    }

    /// Readable payload bytes.
    #[must_use]
    pub fn available(&self) -> usize {
        self.rcvq.len()
    }

    /// EOF: the terminator was reached and everything before it is read.
    #[must_use]
    pub fn at_eof(&self) -> bool {
        self.rcv_shutdown && self.rcvq.is_empty()
    }

    /// Number of segments parked out of order.
    #[must_use]
    pub fn ofo_len(&self) -> usize {
        self.ofo.len()
    }

    /// Ingest a segment whose DSN range was fixed by the mapping engine.
    pub fn ingest(&mut self, mut seg: Segment) -> Ingest {
        if seg.dsn_len() == 0 {
            return Ingest::Duplicate;
        }

        // Pure duplicate: everything at or before what we already have.
        if seq::at_or_before(seg.end_data_seq, self.rcv_nxt) {
            trace!(data_seq = seg.data_seq, "duplicate segment dropped");
            return Ingest::Duplicate;
        }

        // Gap ahead of us: park it.
        if seq::after(seg.data_seq, self.rcv_nxt) {
            self.insert_ofo(seg);
            return Ingest::Queued;
        }

        // In meta order, possibly overlapping the front.
        let mut bytes = self.append_in_order(&mut seg);
        let mut data_fin = seg.data_fin;
        if data_fin {
            self.rcv_shutdown = true;
        }

        // Drain whatever became contiguous.
        let (drained, drained_fin) = self.drain_ofo();
        bytes += drained;
        data_fin |= drained_fin;

        self.ack_scheduled = true;
        Ingest::Delivered { bytes, data_fin }
    }

    /// Copy readable bytes to the application, advancing `copied_seq`.
    ///
    /// Returns the byte count and whether EOF was consumed at the end of
    /// this read.
    pub fn read(&mut self, dst: &mut [u8]) -> (usize, bool) {
        let n = self.rcvq.read_into(dst);
        self.copied_seq = self.copied_seq.wrapping_add(n as u32);
        self.rcvq.eat_fin();
        if self.rcv_shutdown && self.rcvq.is_empty() && !self.fin_consumed {
            // The terminator consumes one DSN byte, exactly once.
            self.fin_consumed = true;
            self.copied_seq = self.copied_seq.wrapping_add(1);
        }
        (n, self.at_eof())
    }

    /// Current receive window in bytes.
    #[must_use]
    pub fn window(&self) -> u32 {
        (self.rcvbuf.saturating_sub(self.rcvq.len())) as u32
    }

    /// Window advertisement check: returns the new window when the freed
    /// space doubled the last announcement or an ACK is scheduled.
    pub fn take_window_update(&mut self) -> Option<u32> {
        let wnd = self.window();
        if self.ack_scheduled || wnd >= self.announced_wnd.saturating_mul(2) {
            self.ack_scheduled = false;
            self.announced_wnd = wnd;
            return Some(wnd);
        }
        None
    }

    /// Note that an ACK will go out on some subflow regardless.
    pub fn schedule_ack(&mut self) {
        self.ack_scheduled = true;
    }

    fn append_in_order(&mut self, seg: &mut Segment) -> usize {
        // Trim the head overlap against bytes we already queued.
        if seq::before(seg.data_seq, self.rcv_nxt) {
            let skip = self.rcv_nxt.wrapping_sub(seg.data_seq) as usize;
            let skip = skip.min(seg.payload.len());
            seg.payload.advance(skip);
            seg.data_seq = self.rcv_nxt;
        }
        let bytes = seg.payload.len();
        self.rcv_nxt = seg.end_data_seq;
        self.rcvq.push(seg.clone());
        trace!(rcv_nxt = self.rcv_nxt, bytes, "segment delivered in order");
        bytes
    }

    /// Insert into the out-of-order queue with coalescing.
    fn insert_ofo(&mut self, seg: Segment) {
        // A fully-contained duplicate adds nothing.
        for existing in &self.ofo {
            if existing.covers(&seg) {
                return;
            }
        }

        // A same-start segment that reaches further replaces the old one.
        if let Some(pos) = self
            .ofo
            .iter()
            .position(|s| s.data_seq == seg.data_seq && seq::after(seg.end_data_seq, s.end_data_seq))
        {
            self.ofo.remove(pos);
        }

        let pos = self
            .ofo
            .iter()
            .position(|s| seq::after(s.data_seq, seg.data_seq))
            .unwrap_or(self.ofo.len());
        self.ofo.insert(pos, seg);

        // Drop successors the new segment fully covers.
        let end = self.ofo[pos].end_data_seq;
        let mut i = pos + 1;
        while i < self.ofo.len() {
            if seq::at_or_before(self.ofo[i].end_data_seq, end) {
                self.ofo.remove(i);
            } else {
                break;
            }
        }
    }

    fn drain_ofo(&mut self) -> (usize, bool) {
        let mut bytes = 0;
        let mut data_fin = false;
        while let Some(front) = self.ofo.front() {
            if seq::after(front.data_seq, self.rcv_nxt) {
                break;
            }
            let mut seg = self.ofo.pop_front().expect("front exists");
            if seq::at_or_before(seg.end_data_seq, self.rcv_nxt) {
                continue; // Late duplicate that got parked earlier.
            }
            bytes += self.append_in_order(&mut seg);
            if seg.data_fin {
                self.rcv_shutdown = true;
                data_fin = true;
            }
        }
        (bytes, data_fin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn seg(data_seq: u32, payload: &'static [u8]) -> Segment {
        let mut s = Segment::new(Bytes::from_static(payload));
        s.data_seq = data_seq;
        s.end_data_seq = data_seq.wrapping_add(payload.len() as u32);
        s
    }

    fn fin_seg(data_seq: u32, payload: &'static [u8]) -> Segment {
        let mut s = seg(data_seq, payload);
        s.data_fin = true;
        s.end_data_seq = s.end_data_seq.wrapping_add(1);
        s
    }

    #[test]
    fn in_order_delivery() {
        let mut rx = MetaReceiver::new(0, 1 << 16);
        assert_eq!(
            rx.ingest(seg(0, b"abc")),
            Ingest::Delivered {
                bytes: 3,
                data_fin: false
            }
        );
        assert_eq!(rx.rcv_nxt, 3);
        let mut buf = [0u8; 8];
        let (n, eof) = rx.read(&mut buf);
        assert_eq!((n, eof), (3, false));
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn out_of_order_then_fill() {
        let mut rx = MetaReceiver::new(0, 1 << 16);
        assert_eq!(rx.ingest(seg(3, b"def")), Ingest::Queued);
        assert_eq!(rx.ofo_len(), 1);
        assert_eq!(
            rx.ingest(seg(0, b"abc")),
            Ingest::Delivered {
                bytes: 6,
                data_fin: false
            }
        );
        assert_eq!(rx.rcv_nxt, 6);
        assert_eq!(rx.ofo_len(), 0);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut rx = MetaReceiver::new(0, 1 << 16);
        rx.ingest(seg(0, b"abcdef"));
        assert_eq!(rx.ingest(seg(0, b"abc")), Ingest::Duplicate);
        assert_eq!(rx.ingest(seg(2, b"cdef")), Ingest::Duplicate);
        // Overlap extending past rcv_nxt is trimmed, not dropped.
        assert_eq!(
            rx.ingest(seg(4, b"efgh")),
            Ingest::Delivered {
                bytes: 2,
                data_fin: false
            }
        );
        assert_eq!(rx.rcv_nxt, 8);
        let mut buf = [0u8; 16];
        let (n, _) = rx.read(&mut buf);
        assert_eq!(&buf[..n], b"abcdefgh");
    }

    #[test]
    fn ofo_coalescing_rules() {
        let mut rx = MetaReceiver::new(0, 1 << 16);
        rx.ingest(seg(10, b"jklm"));
        // Fully contained: dropped.
        rx.ingest(seg(11, b"kl"));
        assert_eq!(rx.ofo_len(), 1);
        // Same start, longer: replaces.
        rx.ingest(seg(10, b"jklmno"));
        assert_eq!(rx.ofo_len(), 1);
        // New segment covering a successor swallows it.
        rx.ingest(seg(20, b"uv"));
        rx.ingest(seg(18, b"stuvw"));
        assert_eq!(rx.ofo_len(), 2);
        // Ordering is strict by data_seq.
        let fill = rx.ingest(seg(0, b"abcdefghij"));
        assert_eq!(
            fill,
            Ingest::Delivered {
                bytes: 16,
                data_fin: false
            }
        );
        let mut buf = [0u8; 32];
        let (n, _) = rx.read(&mut buf);
        assert_eq!(&buf[..n], b"abcdefghijjklmno");
        // The 18.. segment still waits for the 16..18 gap.
        assert_eq!(rx.ofo_len(), 1);
        assert_eq!(rx.rcv_nxt, 16);
    }

    #[test]
    fn data_fin_advances_one_byte_and_reports_eof() {
        let mut rx = MetaReceiver::new(100, 1 << 16);
        let got = rx.ingest(fin_seg(100, b"last"));
        assert_eq!(
            got,
            Ingest::Delivered {
                bytes: 4,
                data_fin: true
            }
        );
        assert_eq!(rx.rcv_nxt, 105);
        assert!(rx.rcv_shutdown);
        let mut buf = [0u8; 8];
        let (n, eof) = rx.read(&mut buf);
        assert_eq!(n, 4);
        assert!(eof);
        assert!(rx.at_eof());
    }

    #[test]
    fn data_fin_waits_for_the_gap() {
        let mut rx = MetaReceiver::new(0, 1 << 16);
        assert_eq!(rx.ingest(fin_seg(3, b"def")), Ingest::Queued);
        assert!(!rx.rcv_shutdown);
        let got = rx.ingest(seg(0, b"abc"));
        assert_eq!(
            got,
            Ingest::Delivered {
                bytes: 6,
                data_fin: true
            }
        );
        assert_eq!(rx.rcv_nxt, 7);
    }

    #[test]
    fn window_updates_on_ack_or_doubling() {
        let mut rx = MetaReceiver::new(0, 1000);
        rx.ingest(seg(0, b"0123456789"));
        // Ingest schedules an ACK.
        assert!(rx.take_window_update().is_some());
        assert!(rx.take_window_update().is_none());
    }
}
