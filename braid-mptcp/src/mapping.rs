//! DSN mapping engine.
//!
//! Each subflow carries a mapping cursor describing a window of subflow
//! bytes whose DSN is a linear offset of the subflow sequence. Segments
//! arriving in subflow order either carry a fresh mapping (replacing the
//! cursor) or fall inside the current window and get their DSN derived
//! by extrapolation. Bytes outside the window mean the peer is broken or
//! lying, which is fatal for the whole meta-connection.

use braid_core::error::MptcpError;
use braid_core::segment::Segment;
use braid_core::seq;
use tracing::trace;

/// The active DSS mapping of one subflow.
///
/// `sub_seq` is an absolute subflow sequence number; the receive path
/// rebases the wire-relative value against the subflow ISN before the
/// cursor is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingCursor {
    pub data_seq: u32,
    pub sub_seq: u32,
    pub data_len: u16,
    /// The mapping announced a DATA_FIN right after its last byte.
    pub data_fin: bool,
}

impl MappingCursor {
    /// Subflow sequence one past the mapped window.
    #[inline]
    #[must_use]
    pub const fn end_sub_seq(&self) -> u32 {
        self.sub_seq.wrapping_add(self.data_len as u32)
    }

    /// DSN for an absolute subflow sequence inside the window.
    #[inline]
    #[must_use]
    pub const fn dsn_for(&self, sub_seq: u32) -> u32 {
        self.data_seq.wrapping_add(sub_seq.wrapping_sub(self.sub_seq))
    }
}

/// Tri-state result of applying the cursor to one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapVerdict {
    /// The DSN range reaches the meta receive point; deliverable now.
    InOrder,

    /// Valid mapping, but ahead of the meta receive point.
    OutOfOrder,
}

/// Apply the subflow's mapping to a segment delivered in subflow order.
///
/// On entry, a segment that carried a DSS mapping has `data_len != 0`
/// and its `data_seq`/`sub_seq` fields populated from the option; the
/// cursor is replaced from them. Segments without a mapping must fit the
/// current cursor. On success the segment's DSN range is final and its
/// `data_len` is cleared to mark the mapping consumed.
///
/// Returns `Ok(None)` for segments that touch no DSN state (pure subflow
/// FIN or empty ack). `infinite` suppresses the containment check once
/// the peer fell back to an infinite mapping.
///
/// # Errors
///
/// `MappingViolation` when payload bytes land outside the mapped window;
/// the caller must tear the meta-connection down.
pub fn apply(
    cursor: &mut Option<MappingCursor>,
    seg: &mut Segment,
    rcv_nxt: u32,
    infinite: bool,
) -> Result<Option<MapVerdict>, MptcpError> {
    // A fresh mapping rides on this segment: it becomes the cursor.
    if seg.data_len != 0 || (seg.data_fin && seg.dsn_len() != 0) {
        *cursor = Some(MappingCursor {
            data_seq: seg.data_seq,
            sub_seq: seg.sub_seq,
            data_len: seg.data_len,
            data_fin: seg.data_fin,
        });
        trace!(
            data_seq = seg.data_seq,
            sub_seq = seg.sub_seq,
            data_len = seg.data_len,
            data_fin = seg.data_fin,
            "mapping cursor replaced"
        );
    }

    // Pure subflow-level FIN: acknowledged below the meta layer.
    if seg.is_empty() && seg.fin && !seg.data_fin {
        return Ok(None);
    }
    // Empty segment with no DATA_FIN carries nothing for the meta layer.
    if seg.is_empty() && !seg.data_fin {
        return Ok(None);
    }

    let Some(cur) = *cursor else {
        // Payload with no mapping ever seen on this subflow.
        return Err(MptcpError::MappingViolation);
    };

    if !infinite {
        let window_end = cur
            .end_sub_seq()
            .wrapping_add(u32::from(seg.fin || (seg.data_fin && seg.is_empty())));
        let fits = if seg.is_empty() {
            // Zero-length DATA_FIN carrier: its position must sit inside
            // or right at the end of the window.
            seq::at_or_after(seg.seq, cur.sub_seq) && seq::at_or_before(seg.seq, window_end)
        } else {
            seq::at_or_after(seg.seq, cur.sub_seq)
                && seq::at_or_before(seg.end_seq(), window_end)
        };
        if !fits {
            return Err(MptcpError::MappingViolation);
        }
    }

    let data_seq = cur.dsn_for(seg.seq);
    let mut end_data_seq = data_seq.wrapping_add(seg.len() as u32);

    // The mapping's DATA_FIN consumes one DSN byte when it lands at the
    // tail of this very segment and the segment announces it.
    if cur.data_fin && seg.data_fin && seg.end_seq() == cur.end_sub_seq() {
        end_data_seq = end_data_seq.wrapping_add(1);
    } else {
        seg.data_fin = false;
    }

    seg.data_seq = data_seq;
    seg.end_data_seq = end_data_seq;
    // Mapping consumed; a derived range is distinguishable from a
    // freshly received mapping from here on.
    seg.data_len = 0;

    let verdict = if seq::at_or_before(seg.data_seq, rcv_nxt) {
        MapVerdict::InOrder
    } else {
        MapVerdict::OutOfOrder
    };
    Ok(Some(verdict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn mapped_segment(seq: u32, payload: &'static [u8], map: (u32, u32, u16)) -> Segment {
        let mut seg = Segment::new(Bytes::from_static(payload));
        seg.seq = seq;
        seg.data_seq = map.0;
        seg.sub_seq = map.1;
        seg.data_len = map.2;
        seg
    }

    #[test]
    fn fresh_mapping_replaces_cursor() {
        let mut cursor = None;
        let mut seg = mapped_segment(1000, b"abcd", (5000, 1000, 8));
        let verdict = apply(&mut cursor, &mut seg, 5000, false).unwrap();
        assert_eq!(verdict, Some(MapVerdict::InOrder));
        assert_eq!(seg.data_seq, 5000);
        assert_eq!(seg.end_data_seq, 5004);
        assert_eq!(seg.data_len, 0, "mapping marked consumed");
        assert_eq!(
            cursor,
            Some(MappingCursor {
                data_seq: 5000,
                sub_seq: 1000,
                data_len: 8,
                data_fin: false
            })
        );
    }

    #[test]
    fn extrapolates_within_cursor() {
        let mut cursor = Some(MappingCursor {
            data_seq: 5000,
            sub_seq: 1000,
            data_len: 8,
            data_fin: false,
        });
        let mut seg = Segment::new(Bytes::from_static(b"efgh"));
        seg.seq = 1004;
        let verdict = apply(&mut cursor, &mut seg, 5004, false).unwrap();
        assert_eq!(verdict, Some(MapVerdict::InOrder));
        assert_eq!(seg.data_seq, 5004);
        assert_eq!(seg.end_data_seq, 5008);
    }

    #[test]
    fn ahead_of_meta_is_out_of_order() {
        let mut cursor = Some(MappingCursor {
            data_seq: 5000,
            sub_seq: 1000,
            data_len: 8,
            data_fin: false,
        });
        let mut seg = Segment::new(Bytes::from_static(b"efgh"));
        seg.seq = 1004;
        let verdict = apply(&mut cursor, &mut seg, 5000, false).unwrap();
        assert_eq!(verdict, Some(MapVerdict::OutOfOrder));
    }

    #[test]
    fn bytes_outside_window_are_fatal() {
        let mut cursor = Some(MappingCursor {
            data_seq: 5000,
            sub_seq: 1000,
            data_len: 4,
            data_fin: false,
        });
        let mut seg = Segment::new(Bytes::from_static(b"too long"));
        seg.seq = 1002;
        assert!(matches!(
            apply(&mut cursor, &mut seg, 5000, false),
            Err(MptcpError::MappingViolation)
        ));
    }

    #[test]
    fn payload_without_any_mapping_is_fatal() {
        let mut cursor = None;
        let mut seg = Segment::new(Bytes::from_static(b"x"));
        seg.seq = 1;
        assert!(apply(&mut cursor, &mut seg, 0, false).is_err());
    }

    #[test]
    fn pure_subflow_fin_touches_nothing() {
        let mut cursor = None;
        let mut seg = Segment::new(Bytes::new());
        seg.fin = true;
        assert_eq!(apply(&mut cursor, &mut seg, 0, false).unwrap(), None);
        assert!(cursor.is_none());
    }

    #[test]
    fn data_fin_at_tail_consumes_a_dsn_byte() {
        let mut cursor = None;
        let mut seg = mapped_segment(1000, b"abcd", (5000, 1000, 4));
        seg.data_fin = true;
        apply(&mut cursor, &mut seg, 5000, false).unwrap();
        assert_eq!(seg.end_data_seq, 5005);
        assert!(seg.data_fin);
    }

    #[test]
    fn data_fin_not_at_tail_is_stripped() {
        // Mapping spans 8 bytes; this segment only covers the first 4,
        // so the DATA_FIN cannot land here yet.
        let mut cursor = None;
        let mut seg = mapped_segment(1000, b"abcd", (5000, 1000, 8));
        seg.data_fin = true;
        apply(&mut cursor, &mut seg, 5000, false).unwrap();
        assert_eq!(seg.end_data_seq, 5004);
        assert!(!seg.data_fin);
        // The cursor still remembers it for the tail segment.
        assert!(cursor.unwrap().data_fin);
    }

    #[test]
    fn zero_length_data_fin_carrier() {
        let mut cursor = None;
        let mut seg = Segment::new(Bytes::new());
        seg.seq = 1000;
        seg.sub_seq = 1000;
        seg.data_seq = 5000;
        seg.data_len = 0;
        seg.data_fin = true;
        seg.end_data_seq = 5001; // dsn_len 1 marks the carried mapping
        let verdict = apply(&mut cursor, &mut seg, 5000, false).unwrap();
        assert_eq!(verdict, Some(MapVerdict::InOrder));
        assert_eq!(seg.data_seq, 5000);
        assert_eq!(seg.end_data_seq, 5001);
        assert!(seg.data_fin);
    }

    #[test]
    fn infinite_mapping_skips_containment() {
        let mut cursor = Some(MappingCursor {
            data_seq: 5000,
            sub_seq: 1000,
            data_len: 4,
            data_fin: false,
        });
        let mut seg = Segment::new(Bytes::from_static(b"well beyond the window"));
        seg.seq = 1004;
        let verdict = apply(&mut cursor, &mut seg, 5004, true).unwrap();
        assert_eq!(verdict, Some(MapVerdict::InOrder));
        assert_eq!(seg.data_seq, 5004);
    }
}
