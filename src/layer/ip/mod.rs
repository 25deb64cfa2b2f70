//! The IP layer seam.
//!
//! The lower IPv4 send path (routing, interfaces, ARP, fragmentation of outgoing datagrams) is
//! out of scope for this crate and only appears here as the [`Ip4Tx`] collaborator trait. What
//! this module does implement is the receive-side plumbing that upper protocols need: datagram
//! [reassembly] and the [`Dispatcher`] that routes raw IPv4 packets through it.
//!
//! [`Ip4Tx`]: trait.Ip4Tx.html
//! [reassembly]: reassembly/index.html
//! [`Dispatcher`]: struct.Dispatcher.html
use core::fmt;

use crate::time::{Expiration, Instant};
use crate::wire::{Checksum, IpProtocol, Ipv4Repr, Ipv4Address, ipv4_packet};

pub mod reassembly;

pub use self::reassembly::{Reassembly, ReassemblyConfig};

/// Errors reported by the stack and by the lower IP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The lower layer cannot currently queue the datagram.
    BufferFull,

    /// The datagram exceeds the path MTU and must not be fragmented.
    FragNeeded,

    /// Link address resolution is in progress; the send will be retried via the retry token.
    ArpPending,

    /// No route exists towards the requested address.
    NoRoute,

    /// The ephemeral port range is exhausted for this remote endpoint.
    NoPortAvail,

    /// The PCB pool is exhausted.
    NoPcbAvail,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BufferFull => write!(f, "send buffer full"),
            Error::FragNeeded => write!(f, "fragmentation needed"),
            Error::ArpPending => write!(f, "link resolution pending"),
            Error::NoRoute => write!(f, "no route to host"),
            Error::NoPortAvail => write!(f, "no ephemeral port available"),
            Error::NoPcbAvail => write!(f, "no pcb available"),
        }
    }
}

/// The result type of stack operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Per-datagram flags for the lower send path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags(pub u8);

impl SendFlags {
    /// Prohibit fragmentation of the datagram (sets the IPv4 DF bit).
    pub const DONT_FRAGMENT: SendFlags = SendFlags(0x01);

    pub fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

/// Addressing and options of an outgoing datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendMeta {
    pub src_addr: Ipv4Address,
    pub dst_addr: Ipv4Address,
    pub protocol: IpProtocol,
    pub ttl: u8,
    pub flags: SendFlags,
}

/// A deferred-send handle.
///
/// When a send fails because link address resolution is in progress, the lower layer remembers
/// the token and hands it back to [`TcpStack::retry_sending`] once resolution completes. The
/// token is opaque to the lower layer; inside the stack it indexes the PCB that wanted to send.
///
/// [`TcpStack::retry_sending`]: ../tcp/struct.TcpStack.html#method.retry_sending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryToken(pub(crate) usize);

/// The lower IPv4 layer as seen from the transport protocols.
pub trait Ip4Tx {
    /// Select the local address and interface MTU for reaching `remote`.
    fn local_addr_for(&self, remote: Ipv4Address) -> Option<(Ipv4Address, u16)>;

    /// Current path MTU estimate towards `remote`.
    ///
    /// Never less than [`IPV4_MIN_MTU`](../../wire/constant.IPV4_MIN_MTU.html).
    fn pmtu(&self, remote: Ipv4Address) -> u16;

    /// Clamp the path MTU estimate for `remote` to the interface MTU.
    ///
    /// Called when a local send failed with [`Error::FragNeeded`], which indicates the interface
    /// MTU dropped below the current estimate.
    fn handle_local_packet_too_big(&mut self, remote: Ipv4Address);

    /// Queue one IP datagram.
    ///
    /// `payload` is the complete transport payload; the implementation prepends the IPv4 header.
    /// A failed send with `retry` present obliges the implementation to call back
    /// `retry_sending` with the token once the blocking condition (e.g. ARP) clears.
    fn send_dgram(&mut self, meta: SendMeta, payload: &[u8], retry: Option<RetryToken>)
        -> Result<()>;
}

/// Information about a received datagram handed to an upper protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxInfo {
    pub src_addr: Ipv4Address,
    pub dst_addr: Ipv4Address,
    pub protocol: IpProtocol,
    pub ttl: u8,
}

/// An upper protocol receiving reassembled datagrams.
pub trait Recv {
    fn receive(&mut self, now: Instant, info: RxInfo, payload: &[u8]);
}

/// Receive-side dispatch: checksum/shape validation, reassembly, delivery.
///
/// For each received IPv4 packet: if it is not fragmented the payload is delivered directly,
/// otherwise it runs through the reassembly engine and only a completed datagram is delivered.
pub struct Dispatcher<'a> {
    reassembly: Reassembly<'a>,
    checksum: Checksum,
}

impl<'a> Dispatcher<'a> {
    pub fn new(reassembly: Reassembly<'a>, checksum: Checksum) -> Self {
        Dispatcher { reassembly, checksum }
    }

    /// Process one raw IPv4 packet.
    ///
    /// Malformed packets are dropped silently, per the usual robustness rule for routers and
    /// hosts alike: nothing is reported to the peer.
    pub fn receive<H: Recv>(&mut self, now: Instant, frame: &[u8], handler: &mut H) {
        let packet = match ipv4_packet::new_checked(frame) {
            Ok(packet) => packet,
            Err(err) => return net_trace!("ip: dropped: {}", err),
        };

        let repr = match Ipv4Repr::parse(packet, self.checksum) {
            Ok(repr) => repr,
            Err(err) => return net_trace!("ip: dropped: {}", err),
        };

        let info = RxInfo {
            src_addr: repr.src_addr,
            dst_addr: repr.dst_addr,
            protocol: repr.protocol,
            ttl: repr.hop_limit,
        };

        if !packet.more_frags() && packet.frag_offset() == 0 {
            return handler.receive(now, info, packet.payload_slice());
        }

        let header = &packet.as_bytes()[..crate::wire::IPV4_HEADER_LEN];
        let complete = self.reassembly.reassemble(
            now,
            packet.ident(),
            info.src_addr,
            info.dst_addr,
            info.protocol.into(),
            info.ttl,
            packet.more_frags(),
            packet.frag_offset(),
            header,
            packet.payload_slice());

        if let Some((header, payload)) = complete {
            // The delivered datagram carries the base header of the first fragment.
            let header = ipv4_packet::new_unchecked(header);
            let info = RxInfo {
                src_addr: header.src_addr(),
                dst_addr: header.dst_addr(),
                protocol: header.protocol(),
                ttl: header.ttl(),
            };
            handler.receive(now, info, payload);
        }
    }

    /// Release expired reassembly entries.
    pub fn poll(&mut self, now: Instant) {
        self.reassembly.purge(now);
    }

    /// Earliest instant at which `poll` has something to do.
    pub fn next_poll_time(&self) -> Expiration {
        self.reassembly.next_expiry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::Slice;
    use crate::wire::IPV4_HEADER_LEN;

    struct Sink {
        delivered: Vec<(RxInfo, Vec<u8>)>,
    }

    impl Recv for Sink {
        fn receive(&mut self, _now: Instant, info: RxInfo, payload: &[u8]) {
            self.delivered.push((info, payload.to_vec()));
        }
    }

    fn frame(ident: u16, more: bool, offset: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; IPV4_HEADER_LEN + payload.len()];
        let total_len = bytes.len() as u16;
        {
            let packet = ipv4_packet::new_unchecked_mut(&mut bytes);
            packet.set_version(4);
            packet.set_header_len(IPV4_HEADER_LEN as u8);
            packet.set_total_len(total_len);
            packet.set_ident(ident);
            packet.clear_flags();
            packet.set_more_frags(more);
            packet.set_frag_offset(offset);
            packet.set_ttl(64);
            packet.set_protocol(IpProtocol::Udp);
            packet.set_src_addr(Ipv4Address::new(10, 0, 0, 1));
            packet.set_dst_addr(Ipv4Address::new(10, 0, 0, 2));
            packet.fill_checksum();
        }
        bytes[IPV4_HEADER_LEN..].copy_from_slice(payload);
        bytes
    }

    fn dispatcher() -> Dispatcher<'static> {
        let entries = vec![Default::default(); 1];
        let reassembly = Reassembly::new(Slice::Owned(entries), ReassemblyConfig::default());
        Dispatcher::new(reassembly, Checksum::Manual)
    }

    #[test]
    fn unfragmented_passthrough() {
        let mut dispatch = dispatcher();
        let mut sink = Sink { delivered: vec![] };
        let now = Instant::from_millis(0);

        dispatch.receive(now, &frame(7, false, 0, &[1, 2, 3]), &mut sink);
        assert_eq!(sink.delivered.len(), 1);
        assert_eq!(sink.delivered[0].1, &[1, 2, 3]);
        assert_eq!(sink.delivered[0].0.protocol, IpProtocol::Udp);
    }

    #[test]
    fn fragmented_two_parts() {
        let mut dispatch = dispatcher();
        let mut sink = Sink { delivered: vec![] };
        let now = Instant::from_millis(0);

        let first: Vec<u8> = (0..16).collect();
        let second: Vec<u8> = (16..24).collect();
        dispatch.receive(now, &frame(7, true, 0, &first), &mut sink);
        assert!(sink.delivered.is_empty());
        dispatch.receive(now, &frame(7, false, 16, &second), &mut sink);
        assert_eq!(sink.delivered.len(), 1);
        let expected: Vec<u8> = (0..24).collect();
        assert_eq!(sink.delivered[0].1, expected);
    }

    #[test]
    fn bad_checksum_dropped() {
        let mut dispatch = dispatcher();
        let mut sink = Sink { delivered: vec![] };
        let mut bytes = frame(7, false, 0, &[1, 2, 3]);
        bytes[10] ^= 0xff;
        dispatch.receive(Instant::from_millis(0), &bytes, &mut sink);
        assert!(sink.delivered.is_empty());
    }
}
