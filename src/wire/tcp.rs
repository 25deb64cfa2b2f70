use core::{cmp, fmt, ops};
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};
use super::ip::{checksum, Checksum, Protocol};
use super::ipv4::Address;

/// Length of the base TCP header, without options.
pub const HEADER_LEN: usize = 20;

/// The largest option run this implementation will ever emit.
///
/// Emitted options are limited to MSS (4 octets) and a NOP-padded window scale (4 octets).
pub const MAX_OPTIONS_LEN: usize = 8;

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2<sup>32</sup>.
/// Sequence numbers do not have a discontiguity when compared pairwise across a signed overflow,
/// which `PartialOrd` below implements via the signed difference.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub i32);

impl SeqNumber {
    /// The wrapped distance from `base` to `self`.
    ///
    /// This is the number of sequence counts `self` lies after `base`, modulo 2<sup>32</sup>.
    /// Segment acceptance tests compare such distances instead of raw numbers so that windows
    /// spanning a wrap-around behave correctly.
    pub fn since(self, base: SeqNumber) -> u32 {
        (self.0 as u32).wrapping_sub(base.0 as u32)
    }

    /// Advance by a possibly large unsigned amount, wrapping.
    pub fn wrapping_add(self, rhs: u32) -> SeqNumber {
        SeqNumber((self.0 as u32).wrapping_add(rhs) as i32)
    }

    /// `self <= other` in the window anchored at `base`.
    pub fn lte(self, other: SeqNumber, base: SeqNumber) -> bool {
        self.since(base) <= other.since(base)
    }

    /// `self < other` in the window anchored at `base`.
    pub fn lt(self, other: SeqNumber, base: SeqNumber) -> bool {
        self.since(base) < other.since(base)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        if rhs > i32::max_value() as usize {
            panic!("attempt to add to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_add(rhs as i32))
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        if rhs > i32::max_value() as usize {
            panic!("attempt to subtract from sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_sub(rhs as i32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub for SeqNumber {
    type Output = usize;

    fn sub(self, rhs: SeqNumber) -> usize {
        let result = self.0.wrapping_sub(rhs.0);
        if result < 0 {
            panic!("attempt to subtract sequence numbers with underflow")
        }
        result as usize
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        self.0.wrapping_sub(other.0).partial_cmp(&0)
    }
}

/// A set of tcp flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(pub u16);

byte_wrapper! {
    /// A byte sequence representing a TCP segment.
    #[derive(Debug, PartialEq, Eq)]
    pub struct tcp([u8]);
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::Field;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM:  Field = 4..8;
    pub const ACK_NUM:  Field = 8..12;
    pub const FLAGS:    Field = 12..14;
    pub const WIN_SIZE: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT:   Field = 18..20;

    pub fn OPTIONS(length: u8) -> Field {
        URGENT.end..(length as usize)
    }

    pub const FLG_FIN: u16 = 0x001;
    pub const FLG_SYN: u16 = 0x002;
    pub const FLG_RST: u16 = 0x004;
    pub const FLG_PSH: u16 = 0x008;
    pub const FLG_ACK: u16 = 0x010;
    pub const FLG_URG: u16 = 0x020;
    pub const FLG_ECE: u16 = 0x040;
    pub const FLG_CWR: u16 = 0x080;
    pub const FLG_NS:  u16 = 0x100;

    pub const OPT_END: u8 = 0x00;
    pub const OPT_NOP: u8 = 0x01;
    pub const OPT_MSS: u8 = 0x02;
    pub const OPT_WS:  u8 = 0x03;
}

impl tcp {
    /// Imbue a raw octet buffer with TCP segment structure.
    pub fn new_unchecked(buffer: &[u8]) -> &tcp {
        Self::__from_macro_new_unchecked(buffer)
    }

    /// Imbue a mutable octet buffer with TCP segment structure.
    pub fn new_unchecked_mut(buffer: &mut [u8]) -> &mut tcp {
        Self::__from_macro_new_unchecked_mut(buffer)
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(data: &[u8]) -> Result<&tcp> {
        let packet = Self::new_unchecked(data);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error::Truncated)` if the buffer is too short.
    /// Returns `Err(Error::Malformed)` if the header length field has a value smaller
    /// than the minimal header length.
    pub fn check_len(&self) -> Result<()> {
        let len = self.0.len();
        if len < field::URGENT.end {
            Err(Error::Truncated)
        } else {
            let header_len = usize::from(self.header_len());
            if len < header_len {
                Err(Error::Truncated)
            } else if header_len < field::URGENT.end {
                Err(Error::Malformed)
            } else {
                Ok(())
            }
        }
    }

    /// View the segment as a raw byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.0[field::SEQ_NUM]))
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.0[field::ACK_NUM]))
    }

    /// Read all flags at once.
    pub fn flags(&self) -> Flags {
        Flags(NetworkEndian::read_u16(&self.0[field::FLAGS]) & 0x1ff)
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        let raw = NetworkEndian::read_u16(&self.0[field::FLAGS]);
        ((raw >> 12) * 4) as u8
    }

    /// Return the window size field.
    #[inline]
    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the length of the segment, in terms of sequence space.
    pub fn sequence_len(&self) -> usize {
        self.payload_slice().len() + self.flags().sequence_len()
    }

    /// Return the options as a byte slice.
    #[inline]
    pub fn options(&self) -> &[u8] {
        &self.0[field::OPTIONS(self.header_len())]
    }

    /// Return the payload as a byte slice.
    #[inline]
    pub fn payload_slice(&self) -> &[u8] {
        &self.0[usize::from(self.header_len())..]
    }

    /// Validate the segment checksum.
    pub fn verify_checksum(&self, src_addr: Address, dst_addr: Address) -> bool {
        checksum::combine(&[
            checksum::pseudo_header(src_addr, dst_addr, Protocol::Tcp, self.0.len() as u32),
            checksum::data(&self.0)
        ]) == !0
    }

    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.0[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.0[field::ACK_NUM], value.0)
    }

    /// Set a combination of flags, clearing all others.
    #[inline]
    pub fn set_flags(&mut self, Flags(flags): Flags) {
        let raw = NetworkEndian::read_u16(&self.0[field::FLAGS]) & !0x0fff;
        NetworkEndian::write_u16(&mut self.0[field::FLAGS], raw | (flags & 0x1ff))
    }

    /// Set the header length, in octets.
    #[inline]
    pub fn set_header_len(&mut self, value: u8) {
        let raw = NetworkEndian::read_u16(&self.0[field::FLAGS]);
        let raw = (raw & !0xf000) | (u16::from(value) / 4) << 12;
        NetworkEndian::write_u16(&mut self.0[field::FLAGS], raw)
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    #[inline]
    pub fn set_urgent_at(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::URGENT], value)
    }

    /// Compute and fill in the segment checksum.
    pub fn fill_checksum(&mut self, src_addr: Address, dst_addr: Address) {
        self.set_checksum(0);
        let checksum = !checksum::combine(&[
            checksum::pseudo_header(src_addr, dst_addr, Protocol::Tcp, self.0.len() as u32),
            checksum::data(&self.0)
        ]);
        self.set_checksum(checksum)
    }

    /// Return the options as a mutable byte slice.
    #[inline]
    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        &mut self.0[field::OPTIONS(header_len)]
    }

    /// Return a mutable slice of the payload data.
    #[inline]
    pub fn payload_mut_slice(&mut self) -> &mut [u8] {
        let header_len = usize::from(self.header_len());
        &mut self.0[header_len..]
    }
}

impl AsRef<[u8]> for tcp {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Flags {
    /// Return the FIN flag.
    #[inline]
    pub fn fin(&self) -> bool {
        self.0 & field::FLG_FIN != 0
    }

    /// Return the SYN flag.
    #[inline]
    pub fn syn(&self) -> bool {
        self.0 & field::FLG_SYN != 0
    }

    /// Return the RST flag.
    #[inline]
    pub fn rst(&self) -> bool {
        self.0 & field::FLG_RST != 0
    }

    /// Return the PSH flag.
    #[inline]
    pub fn psh(&self) -> bool {
        self.0 & field::FLG_PSH != 0
    }

    /// Return the ACK flag.
    #[inline]
    pub fn ack(&self) -> bool {
        self.0 & field::FLG_ACK != 0
    }

    /// Set the FIN flag.
    #[inline]
    pub fn set_fin(&mut self, value: bool) {
        let flag = if value { field::FLG_FIN } else { 0 };
        self.0 = (self.0 & !field::FLG_FIN) | flag;
    }

    /// Set the SYN flag.
    #[inline]
    pub fn set_syn(&mut self, value: bool) {
        let flag = if value { field::FLG_SYN } else { 0 };
        self.0 = (self.0 & !field::FLG_SYN) | flag;
    }

    /// Set the RST flag.
    #[inline]
    pub fn set_rst(&mut self, value: bool) {
        let flag = if value { field::FLG_RST } else { 0 };
        self.0 = (self.0 & !field::FLG_RST) | flag;
    }

    /// Set the PSH flag.
    #[inline]
    pub fn set_psh(&mut self, value: bool) {
        let flag = if value { field::FLG_PSH } else { 0 };
        self.0 = (self.0 & !field::FLG_PSH) | flag;
    }

    /// Set the ACK flag.
    #[inline]
    pub fn set_ack(&mut self, value: bool) {
        let flag = if value { field::FLG_ACK } else { 0 };
        self.0 = (self.0 & !field::FLG_ACK) | flag;
    }

    /// Return the length of the control flags, in terms of sequence space.
    pub fn sequence_len(self) -> usize {
        (if self.syn() { 1 } else { 0 })
        + (if self.fin() { 1 } else { 0 })
    }
}

/// A representation of a single TCP option.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpOption<'a> {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    WindowScale(u8),
    Unknown { kind: u8, data: &'a [u8] },
}

impl<'a> TcpOption<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>)> {
        let (length, option);
        match *buffer.get(0).ok_or(Error::Truncated)? {
            field::OPT_END => {
                length = 1;
                option = TcpOption::EndOfList;
            }
            field::OPT_NOP => {
                length = 1;
                option = TcpOption::NoOperation;
            }
            kind => {
                length = *buffer.get(1).ok_or(Error::Truncated)? as usize;
                if length < 2 {
                    return Err(Error::Malformed);
                }
                let data = buffer.get(2..length).ok_or(Error::Truncated)?;
                match (kind, length) {
                    (field::OPT_MSS, 4) =>
                        option = TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data)),
                    (field::OPT_MSS, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_WS, 3) =>
                        option = TcpOption::WindowScale(data[0]),
                    (field::OPT_WS, _) =>
                        return Err(Error::Malformed),
                    (_, _) =>
                        option = TcpOption::Unknown { kind, data },
                }
            }
        }
        Ok((&buffer[length..], option))
    }

    pub fn buffer_len(&self) -> usize {
        match self {
            TcpOption::EndOfList => 1,
            TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::Unknown { data, .. } => 2 + data.len(),
        }
    }

    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
        let length;
        match *self {
            TcpOption::EndOfList => {
                length = 1;
                // There may be padding space which also should be initialized.
                for p in buffer.iter_mut() {
                    *p = field::OPT_END;
                }
            }
            TcpOption::NoOperation => {
                length = 1;
                buffer[0] = field::OPT_NOP;
            }
            TcpOption::MaxSegmentSize(value) => {
                length = 4;
                buffer[0] = field::OPT_MSS;
                buffer[1] = length as u8;
                NetworkEndian::write_u16(&mut buffer[2..], value);
            }
            TcpOption::WindowScale(value) => {
                length = 3;
                buffer[0] = field::OPT_WS;
                buffer[1] = length as u8;
                buffer[2] = value;
            }
            TcpOption::Unknown { kind, data: provided } => {
                length = 2 + provided.len();
                buffer[0] = kind;
                buffer[1] = length as u8;
                buffer[2..length].copy_from_slice(provided);
            }
        }
        &mut buffer[length..]
    }
}

/// A high-level representation of a Transmission Control Protocol segment header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_port:     u16,
    pub dst_port:     u16,
    pub flags:        Flags,
    pub seq_number:   SeqNumber,
    pub ack_number:   Option<SeqNumber>,
    pub window_len:   u16,
    pub window_scale: Option<u8>,
    pub max_seg_size: Option<u16>,
    pub payload_len:  u16,
}

impl Repr {
    /// Parse a Transmission Control Protocol segment and return a high-level representation.
    pub fn parse(packet: &tcp, checksum: Checksum, src_addr: Address, dst_addr: Address)
        -> Result<Repr>
    {
        packet.check_len()?;
        // Source and destination ports must be present.
        if packet.src_port() == 0 { return Err(Error::Malformed) }
        if packet.dst_port() == 0 { return Err(Error::Malformed) }

        if checksum.manual() && !packet.verify_checksum(src_addr, dst_addr) {
            return Err(Error::WrongChecksum);
        }

        let flags = packet.flags();
        let ack_number = if flags.ack() {
            Some(packet.ack_number())
        } else {
            None
        };
        // The URG flag and the urgent field are ignored. This behavior is standards-compliant,
        // however, most deployed systems (e.g. Linux) are *not* standards-compliant, and would
        // cut the byte at the urgent pointer from the stream.

        let mut max_seg_size = None;
        let mut window_scale = None;
        let mut options = packet.options();
        while options.len() > 0 {
            // A malformed or truncated option ends parsing; everything up to it stands.
            let (next_options, option) = match TcpOption::parse(options) {
                Ok(parsed) => parsed,
                Err(_) => break,
            };
            match option {
                TcpOption::EndOfList => break,
                TcpOption::NoOperation => (),
                TcpOption::MaxSegmentSize(value) =>
                    max_seg_size = Some(value),
                TcpOption::WindowScale(value) => {
                    // RFC 1323: the shift count must be limited to 14. If a Window Scale option
                    // is received with a shift.cnt value exceeding 14, the TCP should log the
                    // error but use 14 instead of the specified value.
                    window_scale = if value > 14 {
                        net_debug!("parsed window scaling factor {} > 14, using 14", value);
                        Some(14)
                    } else {
                        Some(value)
                    };
                },
                TcpOption::Unknown { .. } => (),
            }
            options = next_options;
        }

        Ok(Repr {
            src_port:     packet.src_port(),
            dst_port:     packet.dst_port(),
            flags,
            seq_number:   packet.seq_number(),
            ack_number,
            window_len:   packet.window_len(),
            window_scale,
            max_seg_size,
            payload_len:  packet.payload_slice().len() as u16,
        })
    }

    /// Return the length of a header that will be emitted from this high-level representation.
    ///
    /// This should be used for buffer space calculations.
    /// The TCP header length is a multiple of 4.
    pub fn header_len(&self) -> usize {
        let mut length = field::URGENT.end;
        if self.max_seg_size.is_some() {
            length += 4;
        }
        if self.window_scale.is_some() {
            // Written as NOP + window scale for alignment.
            length += 4;
        }
        debug_assert!(length % 4 == 0);
        length
    }

    /// Return the length of a segment that will be emitted from this high-level representation.
    pub fn buffer_len(&self) -> usize {
        self.header_len() + usize::from(self.payload_len)
    }

    /// Emit a high-level representation into a Transmission Control Protocol segment.
    ///
    /// The checksum is left zeroed; fill it after the payload has been written.
    pub fn emit(&self, packet: &mut tcp) {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_header_len(self.header_len() as u8);
        let mut flags = self.flags;
        flags.set_ack(self.ack_number.is_some());
        packet.set_flags(flags);
        packet.set_window_len(self.window_len);
        packet.set_checksum(0);
        packet.set_urgent_at(0);
        {
            let mut options = packet.options_mut();
            if let Some(value) = self.max_seg_size {
                let tmp = options; options = TcpOption::MaxSegmentSize(value).emit(tmp);
            }
            if let Some(value) = self.window_scale {
                let tmp = options; options = TcpOption::NoOperation.emit(tmp);
                let tmp = options; options = TcpOption::WindowScale(value).emit(tmp);
            }
            if options.len() > 0 {
                TcpOption::EndOfList.emit(options);
            }
        }
    }

    /// Return the length of the segment, in terms of sequence space.
    pub fn sequence_len(&self) -> usize {
        usize::from(self.payload_len) + self.flags.sequence_len()
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TCP src={} dst={}", self.src_port, self.dst_port)?;
        if self.flags.syn() { write!(f, " syn")? }
        if self.flags.fin() { write!(f, " fin")? }
        if self.flags.rst() { write!(f, " rst")? }
        if self.flags.psh() { write!(f, " psh")? }
        write!(f, " seq={}", self.seq_number)?;
        if let Some(ack_number) = self.ack_number {
            write!(f, " ack={}", ack_number)?;
        }
        write!(f, " win={}", self.window_len)?;
        write!(f, " len={}", self.payload_len)?;
        if let Some(max_seg_size) = self.max_seg_size {
            write!(f, " mss={}", max_seg_size)?;
        }
        if let Some(ws) = self.window_scale {
            write!(f, " ws={}", ws)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SRC_ADDR: Address = Address([192, 168, 1, 1]);
    const DST_ADDR: Address = Address([192, 168, 1, 2]);

    static PACKET_BYTES: [u8; 28] =
        [0xbf, 0x00, 0x00, 0x50,
         0x01, 0x23, 0x45, 0x67,
         0x89, 0xab, 0xcd, 0xef,
         0x60, 0x35, 0x01, 0x23,
         0x01, 0xbb, 0x02, 0x01,
         0x03, 0x03, 0x0c, 0x01,
         0xaa, 0x00, 0x00, 0xff];

    static OPTION_BYTES: [u8; 4] =
        [0x03, 0x03, 0x0c, 0x01];

    static PAYLOAD_BYTES: [u8; 4] =
        [0xaa, 0x00, 0x00, 0xff];

    #[test]
    fn test_deconstruct() {
        let packet = tcp::new_checked(&PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.src_port(), 48896);
        assert_eq!(packet.dst_port(), 80);
        assert_eq!(packet.seq_number(), SeqNumber(0x01234567));
        assert_eq!(packet.ack_number(), SeqNumber(0x89abcdefu32 as i32));
        assert_eq!(packet.header_len(), 24);
        assert_eq!(packet.flags().fin(), true);
        assert_eq!(packet.flags().syn(), false);
        assert_eq!(packet.flags().rst(), true);
        assert_eq!(packet.flags().psh(), false);
        assert_eq!(packet.flags().ack(), true);
        assert_eq!(packet.window_len(), 0x0123);
        assert_eq!(packet.options(), &OPTION_BYTES[..]);
        assert_eq!(packet.payload_slice(), &PAYLOAD_BYTES[..]);
    }

    #[test]
    fn test_truncated() {
        assert_eq!(tcp::new_checked(&PACKET_BYTES[..23]).err(), Some(Error::Truncated));
    }

    #[test]
    fn test_impossible_len() {
        let mut bytes = [0u8; 20];
        let packet = tcp::new_unchecked_mut(&mut bytes);
        packet.set_header_len(10);
        assert_eq!(packet.check_len(), Err(Error::Malformed));
    }

    fn packet_repr() -> Repr {
        Repr {
            src_port:     48896,
            dst_port:     80,
            seq_number:   SeqNumber(0x01234567),
            ack_number:   None,
            window_len:   0x0123,
            window_scale: None,
            flags:        Flags(super::field::FLG_SYN),
            max_seg_size: None,
            payload_len:  PAYLOAD_BYTES.len() as u16,
        }
    }

    #[test]
    fn test_emit_parse_roundtrip() {
        let repr = packet_repr();
        let mut bytes = vec![0xa5; repr.buffer_len()];
        repr.emit(tcp::new_unchecked_mut(&mut bytes));
        {
            let packet = tcp::new_unchecked_mut(&mut bytes);
            packet.payload_mut_slice().copy_from_slice(&PAYLOAD_BYTES);
            packet.fill_checksum(SRC_ADDR, DST_ADDR);
        }
        let packet = tcp::new_checked(&bytes).unwrap();
        assert!(packet.verify_checksum(SRC_ADDR, DST_ADDR));
        let parsed = Repr::parse(packet, Checksum::Manual, SRC_ADDR, DST_ADDR).unwrap();
        assert_eq!(parsed, repr);
    }

    #[test]
    fn test_emit_options() {
        let mut repr = packet_repr();
        repr.max_seg_size = Some(1460);
        repr.window_scale = Some(6);
        assert_eq!(repr.header_len(), 28);

        let mut bytes = vec![0; repr.buffer_len()];
        repr.emit(tcp::new_unchecked_mut(&mut bytes));
        let packet = tcp::new_checked(&bytes).unwrap();
        assert_eq!(packet.options(),
                   &[0x02, 0x04, 0x05, 0xb4, 0x01, 0x03, 0x03, 0x06]);
    }

    #[test]
    fn test_parse_unknown_option() {
        // An unknown option (kind 8, timestamps) is skipped by length.
        let mut repr = packet_repr();
        repr.payload_len = 0;
        let mut bytes = vec![0u8; 32];
        repr.emit(tcp::new_unchecked_mut(&mut bytes));
        {
            let packet = tcp::new_unchecked_mut(&mut bytes);
            packet.set_header_len(32);
            let options = packet.options_mut();
            options.copy_from_slice(
                &[0x08, 0x0a, 0, 0, 0, 1, 0, 0, 0, 2, 0x01, 0x00]);
            packet.fill_checksum(SRC_ADDR, DST_ADDR);
        }
        let packet = tcp::new_checked(&bytes).unwrap();
        let parsed = Repr::parse(packet, Checksum::Manual, SRC_ADDR, DST_ADDR).unwrap();
        assert_eq!(parsed.max_seg_size, None);
        assert_eq!(parsed.window_scale, None);
    }

    #[test]
    fn test_parse_malformed_option_prefix() {
        // A bad length octet ends option parsing; options before it are kept.
        let mut repr = packet_repr();
        repr.payload_len = 0;
        let mut bytes = vec![0u8; 28];
        repr.emit(tcp::new_unchecked_mut(&mut bytes));
        {
            let packet = tcp::new_unchecked_mut(&mut bytes);
            packet.set_header_len(28);
            let options = packet.options_mut();
            options.copy_from_slice(&[0x02, 0x04, 0x05, 0xb4, 0x09, 0x01, 0x00, 0x00]);
            packet.fill_checksum(SRC_ADDR, DST_ADDR);
        }
        let packet = tcp::new_checked(&bytes).unwrap();
        let parsed = Repr::parse(packet, Checksum::Manual, SRC_ADDR, DST_ADDR).unwrap();
        assert_eq!(parsed.max_seg_size, Some(1460));
    }

    macro_rules! assert_option_parses {
        ($opt:expr, $data:expr) => ({
            assert_eq!(TcpOption::parse($data), Ok((&[][..], $opt)));
            let buffer = &mut [0; 40][..$opt.buffer_len()];
            assert_eq!($opt.emit(buffer), &mut []);
            assert_eq!(&*buffer, $data);
        })
    }

    #[test]
    fn test_tcp_options() {
        assert_option_parses!(TcpOption::EndOfList,
                              &[0x00]);
        assert_option_parses!(TcpOption::NoOperation,
                              &[0x01]);
        assert_option_parses!(TcpOption::MaxSegmentSize(1500),
                              &[0x02, 0x04, 0x05, 0xdc]);
        assert_option_parses!(TcpOption::WindowScale(12),
                              &[0x03, 0x03, 0x0c]);
        assert_option_parses!(TcpOption::Unknown { kind: 12, data: &[1, 2, 3][..] },
                              &[0x0c, 0x05, 0x01, 0x02, 0x03])
    }

    #[test]
    fn test_malformed_tcp_options() {
        assert_eq!(TcpOption::parse(&[]),
                   Err(Error::Truncated));
        assert_eq!(TcpOption::parse(&[0xc]),
                   Err(Error::Truncated));
        assert_eq!(TcpOption::parse(&[0xc, 0x05, 0x01, 0x02]),
                   Err(Error::Truncated));
        assert_eq!(TcpOption::parse(&[0xc, 0x01]),
                   Err(Error::Malformed));
        assert_eq!(TcpOption::parse(&[0x2, 0x02]),
                   Err(Error::Malformed));
        assert_eq!(TcpOption::parse(&[0x3, 0x02]),
                   Err(Error::Malformed));
    }

    #[test]
    fn test_seq_number_order() {
        let a = SeqNumber(0x7fff_fff0u32 as i32);
        let b = a + 32;
        assert!(a < b);
        assert_eq!(b.since(a), 32);
        // Wrap across the signed boundary.
        let c = SeqNumber(-16);
        let d = c + 32;
        assert!(c < d);
        assert_eq!(d - c, 32);
        assert!(c.lte(d, c));
        assert!(!d.lte(c, c));
    }
}
