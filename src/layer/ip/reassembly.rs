//! IPv4 datagram reassembly.
//!
//! The implementation uses the strategy suggested in RFC 815, whereby hole descriptors are
//! placed at the beginnings of holes, inside the reassembly buffer itself. Each entry keeps a
//! singly linked list of holes in ascending offset order; the final descriptor-sized tail of the
//! buffer can never be covered by a fragment and therefore guarantees at least one hole always
//! exists in a live entry.
use crate::managed::Slice;
use crate::time::{Duration, Expiration, Instant};
use crate::wire::{Ipv4Address, IPV4_HEADER_LEN};

/// Maximum size of a reassembled payload, in bytes.
pub const MAX_REASS_SIZE: u16 = 1480;

/// Offset marking the absence of a further hole, and of a free entry.
const NULL_LINK: u16 = u16::max_value();

/// In-buffer hole descriptor: hole size followed by the offset of the next hole.
///
/// Stored raw in native endian; the descriptors never leave the host.
const HOLE_LEN: u16 = 4;

/// Size of the per-entry buffer.
///
/// The extra descriptor-sized tail cannot contain data, it exists so that a hole descriptor can
/// always be written after the reassembled data.
const REASS_BUFFER_SIZE: u16 = MAX_REASS_SIZE + HOLE_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HoleDescriptor {
    size: u16,
    next: u16,
}

impl HoleDescriptor {
    fn read(buf: &[u8], offset: u16) -> Self {
        let at = usize::from(offset);
        HoleDescriptor {
            size: u16::from_ne_bytes([buf[at], buf[at + 1]]),
            next: u16::from_ne_bytes([buf[at + 2], buf[at + 3]]),
        }
    }

    fn write(self, buf: &mut [u8], offset: u16) {
        let at = usize::from(offset);
        buf[at..at + 2].copy_from_slice(&self.size.to_ne_bytes());
        buf[at + 2..at + 4].copy_from_slice(&self.next.to_ne_bytes());
    }

    fn write_size(buf: &mut [u8], offset: u16, size: u16) {
        let at = usize::from(offset);
        buf[at..at + 2].copy_from_slice(&size.to_ne_bytes());
    }

    fn write_next(buf: &mut [u8], offset: u16, next: u16) {
        let at = usize::from(offset) + 2;
        buf[at..at + 2].copy_from_slice(&next.to_ne_bytes());
    }
}

/// The key identifying the datagram a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct FragKey {
    ident: u16,
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    // Only the 8-bit protocol participates in matching. The time-to-live of fragments of one
    // datagram may legitimately differ and is not part of the identity.
    protocol: u8,
}

/// One in-progress datagram.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Offset in `data` to the first hole, or `NULL_LINK` for a free entry.
    first_hole_offset: u16,
    /// The total data length, or 0 if no last fragment was received yet.
    data_length: u16,
    /// Time after which the entry is considered invalid.
    expiration: Instant,
    key: FragKey,
    /// Base IPv4 header of the first fragment that arrived; options are not stored.
    header: [u8; IPV4_HEADER_LEN],
    /// Data and holes; each hole starts with a descriptor.
    data: [u8; REASS_BUFFER_SIZE as usize],
}

impl Default for Entry {
    fn default() -> Self {
        Entry {
            first_hole_offset: NULL_LINK,
            data_length: 0,
            expiration: Instant::from_millis(0),
            key: FragKey::default(),
            header: [0; IPV4_HEADER_LEN],
            data: [0; REASS_BUFFER_SIZE as usize],
        }
    }
}

/// Runtime knobs of the reassembly engine.
#[derive(Debug, Clone, Copy)]
pub struct ReassemblyConfig {
    /// Hole-count cap per entry, 1..=250.
    pub max_holes: u8,
    /// Maximum entry lifetime in seconds, at least 5.
    pub max_time_secs: u8,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        ReassemblyConfig {
            max_holes: 10,
            max_time_secs: 60,
        }
    }
}

/// The reassembly engine over a fixed pool of entries.
///
/// The number of concurrently reassembled datagrams equals the length of the storage handed in;
/// a single entry is the usual configuration for small devices.
pub struct Reassembly<'a> {
    entries: Slice<'a, Entry>,
    config: ReassemblyConfig,
}

impl<'a> Reassembly<'a> {
    /// Create the engine over entry storage.
    ///
    /// # Panics
    /// Panics if the storage is empty or the configuration is out of its documented bounds.
    pub fn new(entries: Slice<'a, Entry>, config: ReassemblyConfig) -> Self {
        assert!(!entries.is_empty());
        assert!(config.max_holes >= 1 && config.max_holes <= 250);
        assert!(config.max_time_secs >= 5);
        Reassembly { entries, config }
    }

    /// Process a received fragment and possibly return the reassembled datagram.
    ///
    /// This must only be called for packets which are not complete datagrams, that is packets
    /// which have the more-fragments flag set or a nonzero fragment offset. `header` is the
    /// fragment's IPv4 header, of which the base part must match the other arguments.
    ///
    /// On completion, returns the base header of the first fragment that arrived together with
    /// the reassembled payload; both are valid until the next call.
    #[allow(clippy::too_many_arguments)]
    pub fn reassemble(
        &mut self,
        now: Instant,
        ident: u16,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        protocol: u8,
        ttl: u8,
        more_frags: bool,
        frag_offset: u16,
        header: &[u8],
        payload: &[u8],
    ) -> Option<(&[u8], &[u8])> {
        debug_assert!(more_frags || frag_offset > 0);
        debug_assert!(header.len() >= IPV4_HEADER_LEN);

        if payload.is_empty() || payload.len() > usize::from(u16::max_value()) {
            return None;
        }
        let frag_len = payload.len() as u16;

        let key = FragKey { ident, src_addr, dst_addr, protocol };

        // Look up an existing entry, opportunistically freeing expired ones, or allocate.
        let idx = match find_entry(&mut self.entries, now, key) {
            Some(idx) => idx,
            None => {
                let idx = alloc_entry(&self.entries);
                let entry = &mut self.entries[idx];
                let lifetime = Duration::from_secs(
                    u64::from(ttl.min(self.config.max_time_secs)));
                entry.expiration = now + lifetime;
                entry.key = key;
                entry.header.copy_from_slice(&header[..IPV4_HEADER_LEN]);
                entry.first_hole_offset = 0;
                entry.data_length = 0;
                // Write a hole from the start of data to infinity (REASS_BUFFER_SIZE). The
                // final descriptor-sized bytes of the hole serve as infinity because they can
                // not be filled by a fragment, so at least one hole always remains in the list.
                HoleDescriptor { size: REASS_BUFFER_SIZE, next: NULL_LINK }
                    .write(&mut entry.data, 0);
                idx
            }
        };

        let max_holes = self.config.max_holes;
        let entry = &mut self.entries[idx];

        match update_entry(entry, more_frags, frag_offset, frag_len, payload, max_holes) {
            Update::Complete => {
                // Free the entry; header and payload stay readable until the next call.
                entry.first_hole_offset = NULL_LINK;
                Some((&entry.header[..], &entry.data[..usize::from(entry.data_length)]))
            }
            Update::Incomplete => None,
            Update::Invalid => {
                net_debug!("reass: entry invalidated (ident={})", ident);
                entry.first_hole_offset = NULL_LINK;
                None
            }
        }
    }

    /// Free all expired entries.
    ///
    /// The periodic call doubles as the original purge timer: scanning with a key that cannot
    /// match marks every stale entry free.
    pub fn purge(&mut self, now: Instant) {
        let _ = find_entry(&mut self.entries, now, FragKey::default());
    }

    /// Earliest expiration among live entries.
    pub fn next_expiry(&self) -> Expiration {
        self.entries.iter()
            .filter(|entry| entry.first_hole_offset != NULL_LINK)
            .map(|entry| Expiration::When(entry.expiration))
            .fold(Expiration::Never, Expiration::min)
    }
}

enum Update {
    Complete,
    Incomplete,
    Invalid,
}

/// Find a live entry matching `key`, marking every expired entry as free on the way.
fn find_entry(entries: &mut Slice<Entry>, now: Instant, key: FragKey) -> Option<usize> {
    let mut found = None;
    for (idx, entry) in entries.iter_mut().enumerate() {
        if entry.first_hole_offset == NULL_LINK {
            continue;
        }

        if entry.expiration < now {
            entry.first_hole_offset = NULL_LINK;
            continue;
        }

        // Keep going through all entries so that every expired one gets purged.
        if entry.key == key {
            found = Some(idx);
        }
    }
    found
}

/// Pick a free entry, or failing that the one with the smallest remaining lifetime.
fn alloc_entry(entries: &Slice<Entry>) -> usize {
    let mut result = None;
    for (idx, entry) in entries.iter().enumerate() {
        if entry.first_hole_offset == NULL_LINK {
            return idx;
        }

        match result {
            None => result = Some(idx),
            Some(best) => {
                if entry.expiration < entries[best].expiration {
                    result = Some(idx);
                }
            }
        }
    }
    result.expect("entry storage is never empty")
}

fn update_entry(
    entry: &mut Entry,
    more_frags: bool,
    frag_offset: u16,
    frag_len: u16,
    payload: &[u8],
    max_holes: u8,
) -> Update {
    // Verify that the fragment fits into the buffer.
    if frag_offset > MAX_REASS_SIZE || frag_len > MAX_REASS_SIZE - frag_offset {
        return Update::Invalid;
    }
    let frag_end = frag_offset + frag_len;

    // Last-fragment sanity checks:
    // - The first last-fragment pins the data length; data already received beyond it is an
    //   inconsistency (detected in the hole walk below).
    // - Any further fragment must not extend past the pinned length.
    // - Any further last-fragment must end exactly at the pinned length.
    if !more_frags {
        if entry.data_length != 0 && frag_end != entry.data_length {
            return Update::Invalid;
        }
        entry.data_length = frag_end;
    } else if entry.data_length != 0 && frag_end > entry.data_length {
        return Update::Invalid;
    }

    // Update the hole list for this fragment.
    let mut prev_hole_offset = NULL_LINK;
    let mut hole_offset = entry.first_hole_offset;
    let mut num_holes: u16 = 0;
    loop {
        debug_assert!(hole_offset <= MAX_REASS_SIZE);
        let hole = HoleDescriptor::read(&entry.data, hole_offset);
        debug_assert!(hole.size <= REASS_BUFFER_SIZE - hole_offset);
        let hole_end = hole_offset + hole.size;

        // For a last fragment no hole may start beyond its end: that would mean data was
        // already received past the end of the datagram.
        if !more_frags && hole_offset > frag_end {
            return Update::Invalid;
        }

        if frag_offset >= hole_end || frag_end <= hole_offset {
            // No overlap with this hole, skip it.
            prev_hole_offset = hole_offset;
            hole_offset = hole.next;
            num_holes += 1;
        } else {
            // The fragment overlaps the hole: dismantle it and create up to two new ones.

            // A hole remains on the left.
            if frag_offset > hole_offset {
                let new_size = frag_offset - hole_offset;
                if new_size < HOLE_LEN {
                    return Update::Invalid;
                }
                // Same place as the old hole, so the link to it is already set up.
                HoleDescriptor::write_size(&mut entry.data, hole_offset, new_size);
                prev_hole_offset = hole_offset;
                num_holes += 1;
            }

            // A hole remains on the right.
            if frag_end < hole_end {
                let new_size = hole_end - frag_end;
                if new_size < HOLE_LEN {
                    return Update::Invalid;
                }
                HoleDescriptor { size: new_size, next: hole.next }
                    .write(&mut entry.data, frag_end);
                link_hole(entry, prev_hole_offset, frag_end);
                prev_hole_offset = frag_end;
                num_holes += 1;
            }

            link_hole(entry, prev_hole_offset, hole.next);
            hole_offset = hole.next;
        }

        if hole_offset == NULL_LINK {
            break;
        }
    }

    // The final descriptor-sized tail cannot be filled, so a hole must remain.
    debug_assert!(entry.first_hole_offset != NULL_LINK);

    // Copy the fragment into the buffer.
    entry.data[usize::from(frag_offset)..usize::from(frag_end)].copy_from_slice(payload);

    // Complete once the data length is known and the first hole starts at or past it; the
    // remaining hole is then exactly the terminal one from data_length to the buffer end.
    if entry.data_length == 0 || entry.first_hole_offset < entry.data_length {
        if num_holes > u16::from(max_holes) {
            return Update::Invalid;
        }
        return Update::Incomplete;
    }

    debug_assert_eq!(entry.first_hole_offset, entry.data_length);
    #[cfg(debug_assertions)]
    {
        let last = HoleDescriptor::read(&entry.data, entry.first_hole_offset);
        debug_assert_eq!(last.size, REASS_BUFFER_SIZE - entry.first_hole_offset);
        debug_assert_eq!(last.next, NULL_LINK);
    }

    Update::Complete
}

/// Point the predecessor link (or the list head) at `hole_offset`.
fn link_hole(entry: &mut Entry, prev_hole_offset: u16, hole_offset: u16) {
    if prev_hole_offset == NULL_LINK {
        entry.first_hole_offset = hole_offset;
    } else {
        HoleDescriptor::write_next(&mut entry.data, prev_hole_offset, hole_offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Address = Ipv4Address([10, 0, 0, 1]);
    const DST: Ipv4Address = Ipv4Address([10, 0, 0, 2]);

    fn engine(entries: usize) -> Reassembly<'static> {
        Reassembly::new(
            Slice::Owned(vec![Entry::default(); entries]),
            ReassemblyConfig::default())
    }

    fn header(ident: u16, ttl: u8) -> [u8; IPV4_HEADER_LEN] {
        let mut bytes = [0u8; IPV4_HEADER_LEN];
        {
            let packet = crate::wire::ipv4_packet::new_unchecked_mut(&mut bytes);
            packet.set_version(4);
            packet.set_header_len(IPV4_HEADER_LEN as u8);
            packet.set_ident(ident);
            packet.set_ttl(ttl);
            packet.set_protocol(crate::wire::IpProtocol::Tcp);
            packet.set_src_addr(SRC);
            packet.set_dst_addr(DST);
        }
        bytes
    }

    fn feed<'e>(
        engine: &'e mut Reassembly,
        now: Instant,
        ident: u16,
        more: bool,
        offset: u16,
        payload: &[u8],
    ) -> Option<(&'e [u8], &'e [u8])> {
        let header = header(ident, 64);
        engine.reassemble(now, ident, SRC, DST, 6, 64, more, offset, &header, payload)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn in_order_two_fragments() {
        let mut engine = engine(1);
        let now = Instant::from_millis(0);

        let first = pattern(1480, 1);
        let second = pattern(400, 2);

        assert!(feed(&mut engine, now, 42, true, 0, &first).is_none());
        let (hdr, done) = feed(&mut engine, now, 42, false, 1480, &second).expect("complete");
        assert_eq!(hdr.len(), IPV4_HEADER_LEN);
        assert_eq!(done.len(), 1880);
        assert_eq!(&done[..1480], &first[..]);
        assert_eq!(&done[1480..], &second[..]);
    }

    #[test]
    fn reordered_two_fragments() {
        let mut engine = engine(1);
        let now = Instant::from_millis(0);

        let first = pattern(1480, 1);
        let second = pattern(400, 2);

        // The tail fragment arrives first with a lower TTL; the header stored with the
        // entry is that first-arrived fragment's header.
        let tail_header = header(42, 17);
        assert!(engine
            .reassemble(now, 42, SRC, DST, 6, 17, false, 1480, &tail_header, &second)
            .is_none());
        let (hdr, done) = feed(&mut engine, now, 42, true, 0, &first).expect("complete");
        assert_eq!(crate::wire::ipv4_packet::new_unchecked(hdr).ttl(), 17);
        assert_eq!(done.len(), 1880);
        assert_eq!(&done[..1480], &first[..]);
        assert_eq!(&done[1480..], &second[..]);
    }

    #[test]
    fn any_permutation_same_payload() {
        // Three fragments of 8-aligned sizes, all six orders.
        let parts: [(u16, usize); 3] = [(0, 512), (512, 512), (1024, 240)];
        let orders: [[usize; 3]; 6] =
            [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        let data = pattern(1264, 9);

        for order in orders.iter() {
            let mut engine = engine(1);
            let now = Instant::from_millis(0);
            let mut result = None;
            for &i in order {
                let (offset, len) = parts[i];
                let more = usize::from(offset) + len != data.len();
                let slice = &data[usize::from(offset)..usize::from(offset) + len];
                if let Some((_, done)) = feed(&mut engine, now, 1, more, offset, slice) {
                    result = Some(done.to_vec());
                }
            }
            assert_eq!(result.expect("completed"), data, "order {:?}", order);
        }
    }

    #[test]
    fn overlap_beyond_last_fragment_invalidates() {
        let mut engine = engine(1);
        let now = Instant::from_millis(0);

        // Earlier data extends to 1480, then a last fragment claims an end at 1600 which does
        // not even fit the buffer.
        assert!(feed(&mut engine, now, 42, true, 0, &pattern(1480, 1)).is_none());
        assert!(feed(&mut engine, now, 42, false, 1200, &pattern(400, 2)).is_none());

        // The entry was invalidated: re-sending the closing fragment alone does not complete.
        assert!(feed(&mut engine, now, 42, false, 1480, &pattern(400, 3)).is_none());
    }

    #[test]
    fn data_beyond_last_fragment_end_invalidates() {
        let mut engine = engine(1);
        let now = Instant::from_millis(0);

        // Data reaches 64, then a last fragment ends at 48: a hole starts beyond the claimed
        // end, meaning data was received past the end of the datagram.
        assert!(feed(&mut engine, now, 7, true, 0, &pattern(64, 1)).is_none());
        assert!(feed(&mut engine, now, 7, false, 32, &pattern(16, 2)).is_none());

        // Invalidated; a consistent closing fragment alone cannot complete either.
        assert!(feed(&mut engine, now, 7, false, 64, &pattern(16, 3)).is_none());
    }

    #[test]
    fn distinct_idents_do_not_mix() {
        let mut engine = engine(2);
        let now = Instant::from_millis(0);

        assert!(feed(&mut engine, now, 1, true, 0, &pattern(64, 1)).is_none());
        assert!(feed(&mut engine, now, 2, true, 0, &pattern(64, 2)).is_none());
        let (_, done) = feed(&mut engine, now, 1, false, 64, &pattern(32, 3)).expect("complete");
        assert_eq!(done.len(), 96);
    }

    #[test]
    fn entry_expires() {
        let mut engine = engine(1);
        let t0 = Instant::from_millis(0);

        assert!(feed(&mut engine, t0, 1, true, 0, &pattern(64, 1)).is_none());
        assert_eq!(engine.next_expiry(), Expiration::When(Instant::from_secs(60)));

        // After expiry the closing fragment no longer finds the first half; it starts a fresh
        // entry instead, which the resent first half then completes.
        let late = Instant::from_secs(61);
        assert!(feed(&mut engine, late, 1, false, 64, &pattern(32, 2)).is_none());
        assert!(feed(&mut engine, late, 1, true, 0, &pattern(64, 1)).is_some());
    }

    #[test]
    fn lifetime_bounded_by_ttl() {
        let mut engine = engine(1);
        let now = Instant::from_millis(0);
        assert!(engine
            .reassemble(now, 1, SRC, DST, 6, 5, true, 0, &header(1, 5), &pattern(64, 1))
            .is_none());
        assert_eq!(engine.next_expiry(), Expiration::When(Instant::from_secs(5)));
    }

    #[test]
    fn eviction_prefers_least_lifetime() {
        let mut engine = engine(1);
        let now = Instant::from_millis(0);

        assert!(feed(&mut engine, now, 1, true, 0, &pattern(64, 1)).is_none());
        // A fragment of another datagram steals the only entry.
        assert!(feed(&mut engine, now, 2, true, 0, &pattern(64, 2)).is_none());
        let (_, done) = feed(&mut engine, now, 2, false, 64, &pattern(32, 3)).expect("complete");
        assert_eq!(done.len(), 96);
        // The original datagram is gone.
        assert!(feed(&mut engine, now, 1, false, 64, &pattern(32, 4)).is_none());
    }

    #[test]
    fn too_many_holes_invalidates() {
        let config = ReassemblyConfig { max_holes: 2, max_time_secs: 60 };
        let mut engine = Reassembly::new(
            Slice::Owned(vec![Entry::default(); 1]), config);
        let now = Instant::from_millis(0);

        // Each spaced fragment adds one hole before it; the second already leaves three holes
        // which exceeds max_holes == 2 and invalidates the entry. The third then starts over
        // on a fresh entry.
        let hdr = header(1, 64);
        assert!(engine
            .reassemble(now, 1, SRC, DST, 6, 64, true, 16, &hdr, &pattern(8, 1))
            .is_none());
        assert!(engine
            .reassemble(now, 1, SRC, DST, 6, 64, true, 48, &hdr, &pattern(8, 2))
            .is_none());
        assert!(engine
            .reassemble(now, 1, SRC, DST, 6, 64, true, 80, &hdr, &pattern(8, 3))
            .is_none());

        // The entry was invalidated above: completing the datagram now is impossible without
        // resending everything.
        assert!(engine
            .reassemble(now, 1, SRC, DST, 6, 64, true, 0, &hdr, &pattern(16, 4))
            .is_none());
        assert!(engine
            .reassemble(now, 1, SRC, DST, 6, 64, false, 88, &hdr, &pattern(8, 5))
            .is_none());
    }

    #[test]
    fn fragment_past_buffer_invalidates() {
        let mut engine = engine(1);
        let now = Instant::from_millis(0);
        assert!(feed(&mut engine, now, 1, true, 1480, &pattern(8, 1)).is_none());
    }

    #[test]
    fn hole_too_small_to_split_invalidates() {
        let mut engine = engine(1);
        let now = Instant::from_millis(0);
        // Leaves a 2-byte gap at the front, smaller than a hole descriptor.
        assert!(feed(&mut engine, now, 1, true, 8, &pattern(16, 1)).is_none());
        assert!(feed(&mut engine, now, 1, true, 0, &pattern(6, 2)).is_none());
        // Entry was destroyed, nothing can complete it.
        assert!(feed(&mut engine, now, 1, false, 24, &pattern(8, 3)).is_none());
    }
}
