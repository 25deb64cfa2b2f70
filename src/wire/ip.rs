use super::ipv4::Address;

enum_with_unknown! {
    /// IP protocol type.
    pub enum Protocol(u8) {
        Icmp = 0x01,
        Tcp  = 0x06,
        Udp  = 0x11,
    }
}

impl core::fmt::Display for Protocol {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Tcp  => write!(f, "TCP"),
            Protocol::Udp  => write!(f, "UDP"),
            Protocol::Unknown(id) => write!(f, "0x{:02x}", id),
        }
    }
}

/// Describes how to handle checksums.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Checksum {
    /// Checksum must be computed or checked manually.
    Manual,

    /// The checksum field is filled or checked by the NIC.
    Ignored,
}

impl Checksum {
    /// Check if a checksum should be calculated by the library.
    ///
    /// Otherwise it is ignored due to the assumption that it was offloaded or is otherwise
    /// undesirable to check.
    pub fn manual(self) -> bool {
        match self {
            Checksum::Manual => true,
            Checksum::Ignored => false,
        }
    }
}

pub(crate) mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::{Address, Protocol};

    fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub(crate) fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0;

        // For each 32-byte chunk...
        const CHUNK_SIZE: usize = 32;
        while data.len() >= CHUNK_SIZE {
            let mut d = &data[..CHUNK_SIZE];
            // ... take by 2 bytes and sum them.
            while d.len() >= 2 {
                accum += NetworkEndian::read_u16(d) as u32;
                d = &d[2..];
            }

            data = &data[CHUNK_SIZE..];
        }

        // Sum the rest that does not fit the last 32-byte chunk,
        // taking by 2 bytes.
        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        // Add the last remaining odd byte, if any.
        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub(crate) fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// Compute an IPv4 pseudo header checksum.
    pub(crate) fn pseudo_header(src_addr: Address, dst_addr: Address,
                         protocol: Protocol, length: u32) -> u16 {
        let mut proto_len = [0u8; 4];
        proto_len[1] = protocol.into();
        NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

        combine(&[
            data(src_addr.as_bytes()),
            data(dst_addr.as_bytes()),
            data(&proto_len[..])
        ])
    }

    /// An incremental RFC 1071 checksum.
    ///
    /// Words and slices can be folded in any order. A partially accumulated state can be cloned
    /// cheaply, which is used by the output engine to compute the header-side checksum once per
    /// batch of segments and combine it with a per-segment data checksum.
    #[derive(Clone, Copy, Debug, Default)]
    pub(crate) struct Accumulator {
        accum: u32,
    }

    impl Accumulator {
        pub fn new() -> Self {
            Accumulator::default()
        }

        pub fn add_u16(&mut self, value: u16) {
            self.accum += u32::from(value);
        }

        pub fn add_u32(&mut self, value: u32) {
            self.add_u16((value >> 16) as u16);
            self.add_u16(value as u16);
        }

        /// Fold in a byte slice. The slice must begin at an even offset of the checksummed data.
        pub fn add_data(&mut self, bytes: &[u8]) {
            self.accum += u32::from(data(bytes));
        }

        /// The finished checksum field value (complemented).
        pub fn finish(&self) -> u16 {
            !propagate_carries(self.accum)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::checksum::{data, combine, pseudo_header, Accumulator};

    #[test]
    fn checksum_odd_byte() {
        // The trailing odd byte occupies the high half of its word.
        assert_eq!(data(&[0x01]), 0x0100);
        assert_eq!(data(&[0x00, 0x01, 0x02]), 0x0201);
    }

    #[test]
    fn checksum_carry() {
        assert_eq!(data(&[0xff, 0xff, 0x00, 0x02]), 0x0001);
    }

    #[test]
    fn accumulator_matches_flat() {
        let bytes = [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04];
        let mut accum = Accumulator::new();
        accum.add_data(&bytes);
        assert_eq!(accum.finish(), !data(&bytes));

        let mut split = Accumulator::new();
        split.add_u16(0xdead);
        split.add_u32(0xbeef0102);
        split.add_data(&bytes[6..]);
        assert_eq!(split.finish(), accum.finish());
    }

    #[test]
    fn accumulator_pseudo_header() {
        let src = Address([10, 0, 0, 1]);
        let dst = Address([10, 0, 0, 2]);
        let flat = pseudo_header(src, dst, Protocol::Tcp, 20);

        let mut accum = Accumulator::new();
        accum.add_u32(src.to_network_integer());
        accum.add_u32(dst.to_network_integer());
        accum.add_u16(u8::from(Protocol::Tcp) as u16);
        accum.add_u16(20);
        assert_eq!(accum.finish(), !combine(&[flat]));
    }
}
