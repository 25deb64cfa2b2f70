use core::fmt;

use crate::time::{Expiration, Instant};
use crate::wire::{Ipv4Address, TcpSeqNumber};

use super::buffer::{RecvRing, SendRing};
use super::oos::OosBuffer;
use super::RttMillis;

/// The classical TCP connection states.
///
/// The listening state has no PCB representation; listeners are tracked separately. The
/// `FinWait2TimeWait` state is not a standard TCP state but is used transiently when a FIN was
/// just received in `FinWait2` and the transition to `TimeWait` completes only after user
/// callbacks have run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    FinWait2TimeWait,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

impl State {
    /// Neither closed, handshaking nor lingering in TIME_WAIT.
    pub fn is_active(self) -> bool {
        match self {
            State::Closed | State::SynSent | State::SynRcvd | State::TimeWait => false,
            _ => true,
        }
    }

    pub fn is_syn_sent_or_rcvd(self) -> bool {
        match self {
            State::SynSent | State::SynRcvd => true,
            _ => false,
        }
    }

    /// States in which incoming data or FIN is still accepted.
    pub fn accepting_data(self) -> bool {
        match self {
            State::Established | State::FinWait1 | State::FinWait2 => true,
            _ => false,
        }
    }

    /// States in which data or FIN may still be transmitted.
    pub fn can_output(self) -> bool {
        match self {
            State::Established | State::CloseWait | State::FinWait1
                | State::Closing | State::LastAck => true,
            _ => false,
        }
    }

    /// States in which the user may still queue more data.
    pub fn is_snd_open(self) -> bool {
        match self {
            State::Established | State::CloseWait => true,
            _ => false,
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::Closed
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::SynSent => "SYN_SENT",
            State::SynRcvd => "SYN_RCVD",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN_WAIT_1",
            State::FinWait2 => "FIN_WAIT_2",
            State::FinWait2TimeWait => "FIN_WAIT_2*",
            State::Closing => "CLOSING",
            State::TimeWait => "TIME_WAIT",
            State::CloseWait => "CLOSE_WAIT",
            State::LastAck => "LAST_ACK",
        };
        f.write_str(name)
    }
}

/// The 14-bit PCB flag word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PcbFlags(u16);

#[allow(dead_code)]
impl PcbFlags {
    /// ACK is needed; used in input processing.
    pub const ACK_PENDING: u16 = 1 << 0;
    /// The output engine should run at the end of input processing. The flag implies
    /// `state.can_output()` and outstanding data at the point where it is checked; any change
    /// that would break this implication must clear the flag.
    pub const OUT_PENDING: u16 = 1 << 1;
    /// A FIN was sent at least once and is included in snd_nxt.
    pub const FIN_SENT: u16 = 1 << 2;
    /// A FIN is queued for sending.
    pub const FIN_PENDING: u16 = 1 << 3;
    /// Round-trip-time is being measured.
    pub const RTT_PENDING: u16 = 1 << 4;
    /// Round-trip-time is not in initial state.
    pub const RTT_VALID: u16 = 1 << 5;
    /// cwnd has been increased by snd_mss this round-trip.
    pub const CWND_INCRD: u16 = 1 << 6;
    /// A segment has been retransmitted and not yet acked.
    pub const RTX_ACTIVE: u16 = 1 << 7;
    /// The recover variable is valid (and >= snd_una).
    pub const RECOVER: u16 = 1 << 8;
    /// If the rtx timer is running it is for the idle timeout.
    pub const IDLE_TIMER: u16 = 1 << 9;
    /// Window scaling is used.
    pub const WND_SCALE: u16 = 1 << 10;
    /// Current cwnd is the initial cwnd.
    pub const CWND_INIT: u16 = 1 << 11;
    /// If the output timer is set it is for a send retry.
    pub const OUT_RETRY: u16 = 1 << 12;
    /// rcv_ann_wnd needs an update before sending a segment; implies an attached connection.
    pub const RCV_WND_UPD: u16 = 1 << 13;

    pub fn has(self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u16) {
        self.0 &= !flag;
    }

    pub fn has_and_clear(&mut self, flag: u16) -> bool {
        let had = self.has(flag);
        self.0 &= !flag;
        had
    }

    pub fn clear_all(&mut self) {
        self.0 = 0;
    }
}

/// Identity of a connection.
///
/// Ordered lexicographically; the key order is what the PCB indexes sort by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PcbKey {
    pub local_addr: Ipv4Address,
    pub remote_addr: Ipv4Address,
    pub local_port: u16,
    pub remote_port: u16,
}

/// The logical timers of a PCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timer {
    /// Aborts the PCB: handshake timeouts, TIME_WAIT expiry, abandonment.
    Abort,
    /// Runs the output engine after send buffer extension; doubles for send retry backoff.
    Output,
    /// Retransmission, window probe and cwnd idle reset.
    Rtx,
}

/// Per-PCB bundle multiplexing the logical timers onto one physical deadline.
///
/// Each logical timer stores its own `(kind, deadline)`; the embedder programs a single
/// physical timer from the earliest deadline reported by `next()`, reconciled once per
/// top-level event.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TimerSet {
    abort: Expiration,
    output: Expiration,
    rtx: Expiration,
}

impl TimerSet {
    fn slot(&mut self, kind: Timer) -> &mut Expiration {
        match kind {
            Timer::Abort => &mut self.abort,
            Timer::Output => &mut self.output,
            Timer::Rtx => &mut self.rtx,
        }
    }

    pub fn set(&mut self, kind: Timer, at: Instant) {
        *self.slot(kind) = Expiration::When(at);
    }

    pub fn unset(&mut self, kind: Timer) {
        *self.slot(kind) = Expiration::Never;
    }

    pub fn unset_all(&mut self) {
        *self = TimerSet::default();
    }

    pub fn is_set(&self, kind: Timer) -> bool {
        match kind {
            Timer::Abort => self.abort.is_set(),
            Timer::Output => self.output.is_set(),
            Timer::Rtx => self.rtx.is_set(),
        }
    }

    /// Earliest of the set deadlines.
    pub fn next(&self) -> Expiration {
        self.abort.min(self.output).min(self.rtx)
    }

    /// Pop one due timer, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Option<Timer> {
        // Fire in a fixed priority when deadlines coincide: abort wins, then output.
        for &kind in &[Timer::Abort, Timer::Output, Timer::Rtx] {
            let slot = match kind {
                Timer::Abort => &mut self.abort,
                Timer::Output => &mut self.output,
                Timer::Rtx => &mut self.rtx,
            };
            if slot.is_due(now) {
                *slot = Expiration::Never;
                return Some(kind);
            }
        }
        None
    }
}

/// Variables that exist only while a live connection object is attached.
///
/// On abandonment these are dropped with the attachment; the PCB core below suffices to drain
/// or reset the connection.
pub(crate) struct ConnVars<'a> {
    pub snd_buf: SendRing<'a>,
    pub rcv_buf: RecvRing<'a>,
    pub ooseq: OosBuffer,

    /// Send window advertised by the peer, relative to snd_una.
    pub snd_wnd: u32,
    /// Congestion window.
    pub cwnd: u32,
    /// Slow start threshold.
    pub ssthresh: u32,
    /// Bytes acknowledged since the last congestion-avoidance cwnd increase.
    pub cwnd_acked: u32,
    /// Snapshot of snd_nxt at entry into recovery.
    pub recover: TcpSeqNumber,
    /// Sequence number whose ACK completes the running RTT measurement.
    pub rtt_test_seq: TcpSeqNumber,
    /// Smoothed round-trip time, in ms.
    pub srtt: RttMillis,
    /// Round-trip time variance, in ms.
    pub rttvar: RttMillis,
    /// Threshold below which trivial window updates are suppressed.
    pub rcv_ann_thres: u32,
    /// The user closed sending before the connection was established.
    pub snd_closed: bool,
}

impl<'a> ConnVars<'a> {
    pub fn new(snd_buf: SendRing<'a>, rcv_buf: RecvRing<'a>, rcv_ann_thres: u32) -> Self {
        ConnVars {
            snd_buf,
            rcv_buf,
            ooseq: OosBuffer::new(),
            snd_wnd: 0,
            cwnd: 0,
            ssthresh: 0,
            cwnd_acked: 0,
            recover: TcpSeqNumber(0),
            rtt_test_seq: TcpSeqNumber(0),
            srtt: 0,
            rttvar: 0,
            rcv_ann_thres,
            snd_closed: false,
        }
    }
}

/// What currently owns a PCB.
pub(crate) enum Owner<'a> {
    /// Nothing: the PCB is reusable once drained.
    None,
    /// The listener that sponsored this `SynRcvd` PCB, by index.
    Listener(usize),
    /// A live user connection with its attached variables.
    Connection(ConnVars<'a>),
}

impl<'a> Owner<'a> {
    pub fn is_none(&self) -> bool {
        match self {
            Owner::None => true,
            _ => false,
        }
    }
}

/// Index value marking the absence of a link in the unreferenced list.
pub(crate) const NIL: usize = usize::max_value();

/// A TCP Protocol Control Block.
///
/// These are maintained internally within the stack and may survive reset of the associated
/// user connection. The struct is public only so that storage for the pool can be declared by
/// the embedder; all fields are managed by the stack.
pub struct Pcb<'a> {
    pub(crate) key: PcbKey,
    pub(crate) state: State,
    pub(crate) flags: PcbFlags,
    pub(crate) timers: TimerSet,

    /// Generation of the slot, bumped whenever the user-visible connection detaches.
    pub(crate) generation: u32,

    // Sender variables.
    pub(crate) snd_una: TcpSeqNumber,
    pub(crate) snd_nxt: TcpSeqNumber,
    /// The maximum segment size we will send.
    ///
    /// Dynamic based on path MTU discovery, but always between `MIN_ALLOWED_MSS` and
    /// `base_snd_mss` once established. Before that it temporarily stores the path MTU
    /// (`SynSent`) or the interface MSS (`SynRcvd`).
    pub(crate) snd_mss: u16,
    /// The base send MSS computed from the interface MTU and the peer's MSS option.
    pub(crate) base_snd_mss: u16,

    // Receiver variables.
    pub(crate) rcv_nxt: TcpSeqNumber,
    /// Announced receive window, relative to rcv_nxt. Fits `MAX_WINDOW`.
    pub(crate) rcv_ann_wnd: u32,

    // Round-trip-time and retransmission management.
    pub(crate) rto: RttMillis,
    pub(crate) rtt_test_time: Instant,
    pub(crate) num_dupack: u8,

    // Window scale shifts.
    pub(crate) snd_wnd_shift: u8,
    pub(crate) rcv_wnd_shift: u8,

    pub(crate) owner: Owner<'a>,
    /// Whether a user connection handle is attached. A PCB with connection variables but no
    /// attached user is abandoned: it keeps draining queued data and a FIN on its own.
    pub(crate) user_attached: bool,

    // Links of the unreferenced-PCB list, as slot indices.
    pub(crate) unrefed_prev: usize,
    pub(crate) unrefed_next: usize,
    /// Whether the PCB is linked into the unreferenced list at all.
    pub(crate) unrefed: bool,

    /// A send failed due to pending link resolution and a retry was registered.
    pub(crate) retry_registered: bool,
}

impl<'a> Default for Pcb<'a> {
    fn default() -> Self {
        Pcb {
            key: PcbKey::default(),
            state: State::Closed,
            flags: PcbFlags::default(),
            timers: TimerSet::default(),
            generation: 1,
            snd_una: TcpSeqNumber(0),
            snd_nxt: TcpSeqNumber(0),
            snd_mss: 0,
            base_snd_mss: 0,
            rcv_nxt: TcpSeqNumber(0),
            rcv_ann_wnd: 0,
            rto: super::INITIAL_RTX_TIME,
            rtt_test_time: Instant::from_millis(0),
            num_dupack: 0,
            snd_wnd_shift: 0,
            rcv_wnd_shift: 0,
            owner: Owner::None,
            user_attached: false,
            unrefed_prev: NIL,
            unrefed_next: NIL,
            unrefed: false,
            retry_registered: false,
        }
    }
}

impl<'a> Pcb<'a> {
    pub(crate) fn con(&self) -> Option<&ConnVars<'a>> {
        match &self.owner {
            Owner::Connection(vars) => Some(vars),
            _ => None,
        }
    }

    pub(crate) fn con_mut(&mut self) -> Option<&mut ConnVars<'a>> {
        match &mut self.owner {
            Owner::Connection(vars) => Some(vars),
            _ => None,
        }
    }

    pub(crate) fn listener(&self) -> Option<usize> {
        match self.owner {
            Owner::Listener(lis) => Some(lis),
            _ => None,
        }
    }

    pub(crate) fn has_flag(&self, flag: u16) -> bool {
        self.flags.has(flag)
    }

    pub(crate) fn set_flag(&mut self, flag: u16) {
        self.flags.set(flag)
    }

    pub(crate) fn clear_flag(&mut self, flag: u16) {
        self.flags.clear(flag)
    }

    pub(crate) fn has_and_clear_flag(&mut self, flag: u16) -> bool {
        self.flags.has_and_clear(flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Duration;

    #[test]
    fn state_predicates() {
        assert!(State::Established.is_active());
        assert!(State::FinWait2TimeWait.is_active());
        assert!(!State::TimeWait.is_active());
        assert!(!State::SynSent.is_active());

        assert!(State::FinWait2.accepting_data());
        assert!(!State::CloseWait.accepting_data());

        assert!(State::Closing.can_output());
        assert!(State::LastAck.can_output());
        assert!(!State::FinWait2.can_output());
        assert!(!State::TimeWait.can_output());

        assert!(State::CloseWait.is_snd_open());
        assert!(!State::FinWait1.is_snd_open());
    }

    #[test]
    fn flag_word() {
        let mut flags = PcbFlags::default();
        flags.set(PcbFlags::ACK_PENDING | PcbFlags::FIN_SENT);
        assert!(flags.has(PcbFlags::ACK_PENDING));
        assert!(flags.has(PcbFlags::FIN_SENT));
        assert!(flags.has_and_clear(PcbFlags::ACK_PENDING));
        assert!(!flags.has(PcbFlags::ACK_PENDING));
        assert!(!flags.has_and_clear(PcbFlags::ACK_PENDING));
        assert!(flags.has(PcbFlags::FIN_SENT));
    }

    #[test]
    fn timer_set_earliest() {
        let mut timers = TimerSet::default();
        assert_eq!(timers.next(), Expiration::Never);

        let base = Instant::from_millis(100);
        timers.set(Timer::Rtx, base + Duration::from_millis(30));
        timers.set(Timer::Abort, base + Duration::from_millis(50));
        assert_eq!(timers.next(), Expiration::When(base + Duration::from_millis(30)));

        timers.set(Timer::Output, base);
        assert_eq!(timers.next(), Expiration::When(base));

        // Due timers pop in deadline-then-priority order and unset themselves.
        assert_eq!(timers.take_due(base), Some(Timer::Output));
        assert_eq!(timers.take_due(base), None);
        assert_eq!(
            timers.take_due(base + Duration::from_millis(60)),
            Some(Timer::Abort));
        assert_eq!(
            timers.take_due(base + Duration::from_millis(60)),
            Some(Timer::Rtx));
        assert_eq!(timers.next(), Expiration::Never);
    }
}
