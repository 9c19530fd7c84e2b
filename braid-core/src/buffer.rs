//! The segmented meta-receive buffer.
//!
//! Holds the in-order segments of the meta stream between reassembly and
//! the application reader. Segments arrive already contiguous in DSN
//! order; the reader drains them front to back, possibly consuming a
//! segment only partially.
//!
//! # Tradeoffs
//!
//! - **Fast path**: whole-segment reads hand the payload `Bytes` back with
//!   no copy beyond the user-buffer fill
//! - **Slow path**: partial reads split the front segment, which is a
//!   refcount operation on `Bytes`, still no byte copy inside the buffer

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use crate::segment::Segment;

#[derive(Debug, Default)]
pub struct RecvBuffer {
    segs: VecDeque<Segment>,
    len: usize,
}

impl RecvBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segs: VecDeque::new(),
            len: 0,
        }
    }

    /// Unread payload bytes. The DATA_FIN phantom byte is not counted.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append an in-order segment.
    ///
    /// The caller (the reassembler) guarantees DSN contiguity; empty
    /// DATA_FIN carriers are accepted so the reader can observe EOF in
    /// stream position.
    pub fn push(&mut self, seg: Segment) {
        if seg.is_empty() && !seg.data_fin {
            return;
        }
        self.len += seg.len();
        self.segs.push_back(seg);
    }

    /// Copy up to `dst.len()` bytes into `dst`, consuming them.
    ///
    /// Stops early at a DATA_FIN boundary so the reader sees EOF exactly
    /// in sequence. Returns the number of bytes copied.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(front) = self.segs.front_mut() else {
                break;
            };
            let take = (dst.len() - copied).min(front.payload.len());
            dst[copied..copied + take].copy_from_slice(&front.payload[..take]);
            front.payload.advance(take);
            copied += take;
            self.len -= take;

            if front.payload.is_empty() {
                // DATA_FIN is consumed by the reader as a zero-byte
                // terminator; leave it queued until everything before it
                // has been copied out, then eat it.
                let fin = front.data_fin;
                self.segs.pop_front();
                if fin {
                    break;
                }
            }
        }
        copied
    }

    /// Take up to `n` bytes from the front without copying when the front
    /// segment already holds them contiguously.
    pub fn take_bytes(&mut self, n: usize) -> Option<Bytes> {
        if n == 0 {
            return Some(Bytes::new());
        }
        if self.len == 0 {
            return None;
        }

        let front = self.segs.front_mut()?;
        if front.payload.len() >= n {
            self.len -= n;
            let out = front.payload.split_to(n);
            if front.payload.is_empty() && !front.data_fin {
                self.segs.pop_front();
            }
            return Some(out);
        }

        // Spans segments: copy.
        let want = n.min(self.len);
        let mut out = BytesMut::with_capacity(want);
        let mut remaining = want;
        while remaining > 0 {
            let Some(front) = self.segs.front_mut() else {
                break;
            };
            let take = remaining.min(front.payload.len());
            out.extend_from_slice(&front.payload[..take]);
            front.payload.advance(take);
            remaining -= take;
            self.len -= take;
            if front.payload.is_empty() {
                if front.data_fin {
                    break;
                }
                self.segs.pop_front();
            }
        }
        Some(out.freeze())
    }

    /// A DATA_FIN marker is at the front with no bytes before it.
    #[must_use]
    pub fn at_fin(&self) -> bool {
        self.segs
            .front()
            .is_some_and(|s| s.data_fin && s.payload.is_empty())
    }

    /// Consume a front DATA_FIN marker, if present.
    pub fn eat_fin(&mut self) -> bool {
        if self.at_fin() {
            self.segs.pop_front();
            return true;
        }
        false
    }
}
