//! The TCP layer.
//!
//! Offers a full connection oriented transport on top of the ip layer seam: connection
//! lifecycle, retransmission, congestion control, out-of-order buffering, path-MTU tracking and
//! listen queueing. The design keeps all connection state in a fixed pool of protocol control
//! blocks owned by [`TcpStack`]; user code refers to connections through generation-checked
//! [`ConnKey`] handles and receives protocol events through the [`Events`] trait.
//!
//! Relevant material for reading:
//! Main TCP rfc (skip if confident): <https://tools.ietf.org/html/rfc793>
//! Errata and comments: <https://tools.ietf.org/html/rfc1122#section-4.2>
//! TCP congestion control: <https://tools.ietf.org/html/rfc5681>
//! Attack avoidance: <https://tools.ietf.org/html/rfc5961>
//!
//! ## Driving the stack
//!
//! All operations run to completion on the caller's thread. Three kinds of entry points exist:
//! received segments (via [`Incoming`] plugged into the ip [`Dispatcher`], or directly through
//! [`TcpStack::receive`]), timer service ([`TcpStack::poll`], with [`TcpStack::next_poll_time`]
//! for programming a single physical timer), and the user calls on connections. Each entry point
//! takes the current `Instant` and the [`Ip4Tx`] collaborator.
//!
//! [`TcpStack`]: struct.TcpStack.html
//! [`ConnKey`]: struct.ConnKey.html
//! [`Events`]: trait.Events.html
//! [`Incoming`]: struct.Incoming.html
//! [`Dispatcher`]: ../ip/struct.Dispatcher.html
//! [`TcpStack::receive`]: struct.TcpStack.html#method.receive
//! [`TcpStack::poll`]: struct.TcpStack.html#method.poll
//! [`TcpStack::next_poll_time`]: struct.TcpStack.html#method.next_poll_time
//! [`Ip4Tx`]: ../ip/trait.Ip4Tx.html
use crate::time::Duration;
use crate::wire::{IPV4_MIN_MTU, IPV4_TCP_HEADER_LEN};

mod buffer;
mod connection;
mod endpoint;
mod input;
mod isn;
mod oos;
mod output;
mod pcb;
pub mod queue;
#[cfg(test)]
mod tests;

pub use self::buffer::{RecvRing, SendRing};
pub use self::connection::{Acceptor, Control, ConnKey, Events, ListenerKey, ReclaimedBuffers};
pub use self::endpoint::{Incoming, IndexSlot, Listener, ListenParams, Pcb, Storage, TcpStack};
pub use self::isn::IsnGenerator;
pub use self::pcb::{PcbKey, State};

/// Maximum theoretically possible send and receive window.
pub const MAX_WINDOW: u32 = 0x3fff_ffff;

/// Don't allow the remote host to lower the effective MSS beyond this.
pub const MIN_ALLOWED_MSS: u16 = (IPV4_MIN_MTU - IPV4_TCP_HEADER_LEN) as u16;

/// Largest segment payload this stack will transmit, bounded by its transmit scratch buffer.
pub(crate) const MAX_SND_MSS: u16 = 1460;

/// How old at most an ACK may be to be considered acceptable (MAX.SND.WND in RFC 5961).
pub(crate) const MAX_ACK_BEFORE: u32 = 0xffff;

/// Window scale shift count to send and use in outgoing ACKs.
pub(crate) const RCV_WND_SHIFT: u8 = 6;

/// Number of duplicate ACKs to trigger fast retransmit/recovery.
pub(crate) const FAST_RTX_DUP_ACKS: u8 = 3;

/// Maximum number of additional duplicate ACKs that will result in CWND increase.
pub(crate) const MAX_ADDITIONAL_DUP_ACKS: u8 = 32;

/// Minimum amount to extend the receive window when a PCB is abandoned before the FIN has been
/// received.
pub(crate) const MIN_ABANDON_RCV_WND_INCR: u32 = 0xffff;

/// SYN_RCVD state timeout.
pub(crate) const SYN_RCVD_TIMEOUT: Duration = Duration::from_secs(20);

/// SYN_SENT state timeout.
pub(crate) const SYN_SENT_TIMEOUT: Duration = Duration::from_secs(30);

/// TIME_WAIT state timeout.
pub(crate) const TIME_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout to abort a connection after it has been abandoned.
pub(crate) const ABANDONED_TIMEOUT: Duration = Duration::from_secs(30);

/// Time after the send buffer is extended to running the output engine.
pub(crate) const OUTPUT_TIMER_DELAY: Duration = Duration::from_micros(500);

/// Time to retry after sending failed with `Error::BufferFull`.
pub(crate) const OUTPUT_RETRY_FULL: Duration = Duration::from_millis(100);

/// Time to retry after sending failed with any other error.
pub(crate) const OUTPUT_RETRY_OTHER: Duration = Duration::from_secs(2);

/// Retransmission times are kept in milliseconds in 16 bits, giving a range of 65 seconds.
pub(crate) type RttMillis = u16;

/// Initial retransmission time, before any round-trip-time measurement.
pub(crate) const INITIAL_RTX_TIME: RttMillis = 1_000;

/// Minimum retransmission time.
pub(crate) const MIN_RTX_TIME: RttMillis = 250;

/// Maximum retransmission time.
pub(crate) const MAX_RTX_TIME: RttMillis = 60_000;

/// Per-stack configuration.
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
    /// IP TTL on emitted segments.
    pub ttl: u8,
    /// First ephemeral port used for active opens.
    pub ephemeral_first: u16,
    /// Last ephemeral port used for active opens.
    pub ephemeral_last: u16,
    /// Default threshold below which trivial window updates are suppressed.
    ///
    /// Overridable per connection with
    /// [`Control::set_window_update_threshold`](struct.Control.html).
    pub window_update_threshold: u32,
    /// Keys of the keyed hash generating initial sequence numbers.
    ///
    /// Deployments should set these to device-unique secrets.
    pub isn_keys: (u64, u64),
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            ttl: 64,
            ephemeral_first: 49152,
            ephemeral_last: 65535,
            window_update_threshold: 2700,
            isn_keys: (0x243f_6a88_85a3_08d3, 0x1319_8a2e_0370_7344),
        }
    }
}

/// Initial congestion window per RFC 5681.
pub(crate) fn initial_cwnd(snd_mss: u16) -> u32 {
    if snd_mss > 2190 {
        2 * u32::from(snd_mss)
    } else if snd_mss > 1095 {
        3 * u32::from(snd_mss)
    } else {
        4 * u32::from(snd_mss)
    }
}

/// Resolve the effective send MSS from the interface MSS and the peer's MSS option.
///
/// Returns `None` when the peer requests an MSS below the permitted minimum.
pub(crate) fn calc_snd_mss(iface_mss: u16, peer_mss: Option<u16>) -> Option<u16> {
    let req_mss = peer_mss.unwrap_or(536);
    let mss = iface_mss.min(req_mss);
    if mss < MIN_ALLOWED_MSS {
        None
    } else {
        Some(mss)
    }
}
