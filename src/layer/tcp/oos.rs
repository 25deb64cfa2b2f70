//! Out-of-sequence segment bookkeeping.
//!
//! Keeps up to a small fixed number of received contiguous ranges past `rcv_nxt`, and at most
//! one received-FIN position. Ranges are disjoint, never touch and never overlap `rcv_nxt`;
//! merging is attempted on every insert.
use crate::wire::TcpSeqNumber;

/// Number of out-of-sequence ranges kept per connection.
pub(crate) const NUM_OOS_SEGS: usize = 4;

/// One contiguous region of buffered data, a FIN, or an end marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OosSeg {
    /// First sequence number (for data segments).
    start: TcpSeqNumber,
    /// One-past-last sequence number (for data segments).
    end: TcpSeqNumber,
}

impl OosSeg {
    /// An entry with `start == end + 1` marks the end of the used segments.
    fn is_end(self) -> bool {
        self.start == self.end.wrapping_add(1)
    }

    fn make_end() -> OosSeg {
        OosSeg { start: TcpSeqNumber(1), end: TcpSeqNumber(0) }
    }

    /// An entry with `start == end` represents a FIN. Both hold the FIN sequence number plus
    /// one, so a FIN never touches a preceding data segment, just as data segments never touch
    /// each other.
    fn is_fin(self) -> bool {
        self.start == self.end
    }

    /// The FIN sequence number of a FIN entry.
    fn fin_seq(self) -> TcpSeqNumber {
        self.start - 1usize
    }

    fn make_fin(fin_seq: TcpSeqNumber) -> OosSeg {
        let seg_seq = fin_seq + 1usize;
        OosSeg { start: seg_seq, end: seg_seq }
    }

    /// Either an end marker or a FIN (cheaper than checking both).
    fn is_end_or_fin(self) -> bool {
        self.start.since(self.end) <= 1
    }
}

/// The per-connection out-of-sequence buffer.
///
/// If fewer than `NUM_OOS_SEGS` entries are used, the first end marker terminates the list;
/// entries after it are undefined.
#[derive(Debug, Clone)]
pub(crate) struct OosBuffer {
    segs: [OosSeg; NUM_OOS_SEGS],
}

impl OosBuffer {
    pub fn new() -> Self {
        OosBuffer {
            segs: [OosSeg::make_end(); NUM_OOS_SEGS],
        }
    }

    /// Check if neither data nor FIN is buffered.
    pub fn is_nothing_buffered(&self) -> bool {
        self.segs[0].is_end()
    }

    /// Record a received segment.
    ///
    /// The segment must already have been trimmed to the receive window. `rcv_nxt` is the
    /// value from before this segment is applied. Returns whether an ACK should be forced
    /// (segment out of sequence or filling a gap), or `Err(())` on a FIN inconsistency, in
    /// which case nothing was updated.
    pub fn update_for_segment(
        &mut self,
        rcv_nxt: TcpSeqNumber,
        seg_start: TcpSeqNumber,
        seg_datalen: usize,
        seg_fin: bool,
    ) -> Result<bool, ()> {
        // An out-of-sequence segment needs an ACK right away; filling a gap also does, which
        // is detected below.
        let mut need_ack = seg_start != rcv_nxt;

        let seg_end = seg_start.wrapping_add(seg_datalen as u32);

        let mut num = self.count();

        // FIN consistency checks.
        if num > 0 && self.segs[num - 1].is_fin() {
            let fin_seq = self.segs[num - 1].fin_seq();

            // Data beyond an already recorded FIN.
            if seg_datalen > 0 && !seg_end.lte(fin_seq, rcv_nxt) {
                return Err(());
            }

            // A FIN at a different position.
            if seg_fin && seg_end != fin_seq {
                return Err(());
            }
        } else if seg_fin && num > 0 && !self.segs[num - 1].end.lte(seg_end, rcv_nxt) {
            // A FIN before already received data.
            return Err(());
        }

        if seg_datalen > 0 {
            // Skip entries strictly before this segment. A FIN entry is never skipped here
            // due to the data-beyond-FIN check above.
            let mut pos = 0;
            while pos < num && self.segs[pos].end.lt(seg_start, rcv_nxt) {
                pos += 1;
            }

            if pos == num || seg_end.lt(self.segs[pos].start, rcv_nxt) {
                // Nothing at `pos` touches the new segment: insert. If all slots are used and
                // we are not inserting at the very end, sacrifice the last slot. Newly
                // received data that precedes buffered data wins over it, which guarantees
                // that in-sequence data is always acceptable and the connection cannot stall
                // once the slots are exhausted. A FIN entry may be discarded this way; the
                // only loss is a missed chance to detect an inconsistency.
                if num == NUM_OOS_SEGS && pos < NUM_OOS_SEGS {
                    num -= 1;
                }

                if num < NUM_OOS_SEGS {
                    if pos < num {
                        need_ack = true;
                        self.segs.copy_within(pos..num, pos + 1);
                    }
                    self.segs[pos] = OosSeg { start: seg_start, end: seg_end };
                    num += 1;
                }
            } else {
                // The segment intersects or touches the entry at `pos`, which cannot be a FIN:
                // that would have failed the data-beyond-FIN check.
                debug_assert!(!self.segs[pos].is_fin());

                // Extend to the left.
                if seg_start.lt(self.segs[pos].start, rcv_nxt) {
                    need_ack = true;
                    self.segs[pos].start = seg_start;
                }

                // Extend to the right, then merge any entries the extension swallowed.
                if !seg_end.lte(self.segs[pos].end, rcv_nxt) {
                    need_ack = true;
                    self.segs[pos].end = seg_end;

                    let mut merge_pos = pos + 1;
                    while merge_pos < num
                        && !seg_end.lt(self.segs[merge_pos].start, rcv_nxt)
                    {
                        if seg_end.lte(self.segs[merge_pos].end, rcv_nxt) {
                            self.segs[pos].end = self.segs[merge_pos].end;
                            merge_pos += 1;
                            break;
                        }
                        merge_pos += 1;
                    }

                    let num_merged = merge_pos - (pos + 1);
                    if num_merged > 0 {
                        if merge_pos < num {
                            self.segs.copy_within(merge_pos..num, pos + 1);
                        }
                        num -= num_merged;
                    }
                }
            }
        }

        // Record a FIN if there is none yet and a slot is free; otherwise it is dropped,
        // which is safe since the peer will retransmit it.
        if seg_fin
            && (num == 0 || !self.segs[num - 1].is_fin())
            && num < NUM_OOS_SEGS
        {
            self.segs[num] = OosSeg::make_fin(seg_end);
            num += 1;
        }

        if num < NUM_OOS_SEGS {
            self.segs[num] = OosSeg::make_end();
        }
        debug_assert_eq!(num, self.count());

        Ok(need_ack)
    }

    /// Consume any data or FIN that has become in-sequence at `rcv_nxt`.
    ///
    /// Returns the length of consumable data beginning at `rcv_nxt` (zero if none) and whether
    /// a FIN immediately follows it.
    pub fn shift_available(&mut self, rcv_nxt: TcpSeqNumber) -> (usize, bool) {
        let mut datalen = 0;

        if !self.segs[0].is_end_or_fin() && self.segs[0].start == rcv_nxt {
            let seq_end = self.segs[0].end;
            datalen = seq_end.since(self.segs[0].start) as usize;

            // Shift the consumed entry out.
            let mut num = self.count();
            if num > 1 {
                self.segs.copy_within(1..num, 0);
            }
            num -= 1;
            self.segs[num] = OosSeg::make_end();

            // The next entry cannot hold data we could also consume now: there are always
            // gaps between entries.
            debug_assert!(self.segs[0].is_end_or_fin()
                || !self.segs[0].start.lte(seq_end, rcv_nxt));
        }

        // The FIN is reported, not consumed: re-reporting is harmless.
        let fin = self.segs[0].is_fin()
            && self.segs[0].fin_seq() == rcv_nxt.wrapping_add(datalen as u32);

        (datalen, fin)
    }

    /// The number of buffer bytes past `rcv_nxt` that buffered segments occupy.
    ///
    /// Used when the receive buffer is swapped out: this much of the region past the unread
    /// data must be preserved. A recorded FIN occupies no buffer space.
    pub fn max_extent(&self, rcv_nxt: TcpSeqNumber) -> usize {
        let mut extent = 0;
        let mut pos = 0;
        while pos < NUM_OOS_SEGS && !self.segs[pos].is_end() {
            if !self.segs[pos].is_fin() {
                extent = extent.max(self.segs[pos].end.since(rcv_nxt) as usize);
            }
            pos += 1;
        }
        extent
    }

    fn count(&self) -> usize {
        let mut num = 0;
        while num < NUM_OOS_SEGS && !self.segs[num].is_end() {
            num += 1;
        }
        num
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(value: u32) -> TcpSeqNumber {
        TcpSeqNumber(value as i32)
    }

    #[test]
    fn in_sequence_consume() {
        let mut oos = OosBuffer::new();
        assert!(oos.is_nothing_buffered());

        // In-sequence data does not force an ACK by itself.
        let need_ack = oos.update_for_segment(seq(100), seq(100), 10, false).unwrap();
        assert!(!need_ack);

        let (datalen, fin) = oos.shift_available(seq(100));
        assert_eq!(datalen, 10);
        assert!(!fin);
        assert!(oos.is_nothing_buffered());
    }

    #[test]
    fn gap_then_fill() {
        let mut oos = OosBuffer::new();

        assert!(oos.update_for_segment(seq(100), seq(120), 10, false).unwrap());
        let (datalen, _) = oos.shift_available(seq(100));
        assert_eq!(datalen, 0);

        // Filling the gap merges with the buffered range.
        assert!(oos.update_for_segment(seq(100), seq(100), 20, false).unwrap());
        let (datalen, fin) = oos.shift_available(seq(100));
        assert_eq!(datalen, 30);
        assert!(!fin);
    }

    #[test]
    fn merge_multiple_ranges() {
        let mut oos = OosBuffer::new();

        oos.update_for_segment(seq(0), seq(10), 5, false).unwrap();
        oos.update_for_segment(seq(0), seq(20), 5, false).unwrap();
        oos.update_for_segment(seq(0), seq(30), 5, false).unwrap();

        // One range swallowing all three.
        oos.update_for_segment(seq(0), seq(8), 30, false).unwrap();

        oos.update_for_segment(seq(0), seq(0), 8, false).unwrap();
        let (datalen, fin) = oos.shift_available(seq(0));
        assert_eq!(datalen, 38);
        assert!(!fin);
    }

    #[test]
    fn capacity_exhausted_prefers_earlier_data() {
        let mut oos = OosBuffer::new();

        // Fill all slots with spaced ranges.
        for i in 0..NUM_OOS_SEGS as u32 {
            oos.update_for_segment(seq(0), seq(100 + i * 20), 5, false).unwrap();
        }

        // A range before all buffered ones evicts the last slot instead of being dropped.
        oos.update_for_segment(seq(0), seq(50), 5, false).unwrap();
        oos.update_for_segment(seq(0), seq(0), 50, false).unwrap();
        let (datalen, _) = oos.shift_available(seq(0));
        assert_eq!(datalen, 55);
    }

    #[test]
    fn fin_reported_only_when_reached() {
        let mut oos = OosBuffer::new();

        // FIN at 130 with data [120, 130) still missing [100, 120).
        oos.update_for_segment(seq(100), seq(120), 10, true).unwrap();
        let (datalen, fin) = oos.shift_available(seq(100));
        assert_eq!(datalen, 0);
        assert!(!fin);

        oos.update_for_segment(seq(100), seq(100), 20, false).unwrap();
        let (datalen, fin) = oos.shift_available(seq(100));
        assert_eq!(datalen, 30);
        assert!(fin);
    }

    #[test]
    fn immediate_fin() {
        let mut oos = OosBuffer::new();
        let need_ack = oos.update_for_segment(seq(100), seq(100), 0, true).unwrap();
        assert!(!need_ack);
        let (datalen, fin) = oos.shift_available(seq(100));
        assert_eq!(datalen, 0);
        assert!(fin);
    }

    #[test]
    fn data_beyond_fin_is_inconsistent() {
        let mut oos = OosBuffer::new();
        oos.update_for_segment(seq(100), seq(110), 10, true).unwrap();
        assert!(oos.update_for_segment(seq(100), seq(125), 10, false).is_err());
    }

    #[test]
    fn fin_at_other_position_is_inconsistent() {
        let mut oos = OosBuffer::new();
        oos.update_for_segment(seq(100), seq(110), 10, true).unwrap();
        assert!(oos.update_for_segment(seq(100), seq(110), 5, true).is_err());
    }

    #[test]
    fn fin_before_buffered_data_is_inconsistent() {
        let mut oos = OosBuffer::new();
        oos.update_for_segment(seq(100), seq(110), 10, false).unwrap();
        assert!(oos.update_for_segment(seq(100), seq(100), 5, true).is_err());
    }

    #[test]
    fn fin_dropped_when_full() {
        let mut oos = OosBuffer::new();
        for i in 0..NUM_OOS_SEGS as u32 {
            oos.update_for_segment(seq(0), seq(100 + i * 20), 5, false).unwrap();
        }

        // No slot remains for the FIN; it is dropped without error.
        oos.update_for_segment(seq(0), seq(200), 0, true).unwrap();
        let (_, fin) = oos.shift_available(seq(0));
        assert!(!fin);
    }
}
