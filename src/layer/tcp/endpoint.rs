//! The PCB table and the stack's user surface.
//!
//! Holds the fixed PCB pool, two key-ordered indexes over it (active and time-wait), the list
//! of unreferenced PCBs ordered so the tail is the oldest reusable candidate, the listener
//! table, ephemeral port rotation and the user-facing operations. Input and output processing
//! live in the sibling modules and operate on the same `TcpStack` type.
use crate::layer::ip::{self, Error, Ip4Tx, Result, RetryToken, RxInfo};
use crate::managed::{List, Partial, Slice};
use crate::time::{Expiration, Instant};
use crate::wire::{
    Checksum, IpProtocol, Ipv4Address, TcpRepr, TcpSeqNumber, tcp_packet,
    IPV4_TCP_HEADER_LEN,
};

use super::connection::{ConnKey, Events, ListenerKey, ReclaimedBuffers};
use super::buffer::{RecvRing, SendRing};
use super::isn::IsnGenerator;
use super::pcb::{ConnVars, Owner, PcbFlags, PcbKey, State, Timer, NIL};
use super::{input, output, TcpConfig};

pub use super::pcb::Pcb;

/// One entry of a PCB key index.
pub type IndexSlot = (PcbKey, usize);

/// A key-ordered index over PCB slots: a sorted array with binary search.
pub(crate) struct KeyIndex<'a> {
    entries: List<'a, IndexSlot>,
}

impl<'a> KeyIndex<'a> {
    fn new(storage: Slice<'a, IndexSlot>) -> Self {
        KeyIndex { entries: Partial::new(storage) }
    }

    pub fn find(&self, key: &PcbKey) -> Option<usize> {
        self.entries
            .as_slice()
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|pos| self.entries.as_slice()[pos].1)
    }

    pub fn insert(&mut self, key: PcbKey, idx: usize) {
        match self.entries.as_slice().binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(_) => debug_assert!(false, "duplicate key in pcb index"),
            Err(pos) => {
                let slot = self.entries.insert_at(pos)
                    .expect("index storage sized to the pcb pool");
                *slot = (key, idx);
            }
        }
    }

    pub fn remove(&mut self, key: &PcbKey) {
        if let Ok(pos) = self.entries.as_slice().binary_search_by(|(k, _)| k.cmp(key)) {
            self.entries.remove_at(pos);
        }
    }
}

/// A listening socket.
///
/// Public only so that storage for the table can be declared by the embedder.
pub struct Listener {
    pub(crate) used: bool,
    pub(crate) addr: Ipv4Address,
    pub(crate) port: u16,
    pub(crate) max_pcbs: usize,
    pub(crate) num_pcbs: usize,
    pub(crate) initial_rcv_wnd: u32,
    /// The PCB currently published for acceptance, if any.
    pub(crate) accept_pcb: Option<usize>,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            used: false,
            addr: Ipv4Address::UNSPECIFIED,
            port: 0,
            max_pcbs: 0,
            num_pcbs: 0,
            initial_rcv_wnd: 0,
            accept_pcb: None,
        }
    }
}

/// Parameters of a passive open.
#[derive(Debug, Clone, Copy)]
pub struct ListenParams {
    /// Local address to bind; the unspecified address accepts any local address.
    pub addr: Ipv4Address,
    pub port: u16,
    /// Upper bound on simultaneous half-open (SYN_RCVD) connections for this listener.
    pub max_pcbs: usize,
    /// Receive window announced during the handshake, before a receive buffer exists.
    pub initial_rcv_wnd: u32,
}

/// All fixed storage of a stack.
pub struct Storage<'a> {
    pub pcbs: Slice<'a, Pcb<'a>>,
    pub active_index: Slice<'a, IndexSlot>,
    pub timewait_index: Slice<'a, IndexSlot>,
    pub listeners: Slice<'a, Listener>,
}

impl Storage<'static> {
    /// Heap-allocate storage for `num_pcbs` PCBs and `num_listeners` listener slots.
    #[cfg(feature = "std")]
    pub fn owned(num_pcbs: usize, num_listeners: usize) -> Self {
        Storage {
            pcbs: Slice::Owned((0..num_pcbs).map(|_| Pcb::default()).collect()),
            active_index: Slice::Owned(vec![Default::default(); num_pcbs]),
            timewait_index: Slice::Owned(vec![Default::default(); num_pcbs]),
            listeners: Slice::Owned((0..num_listeners).map(|_| Listener::default()).collect()),
        }
    }
}

/// Transmit scratch: base header, emitted options, one full-size segment payload.
pub(crate) const TX_BUF_LEN: usize =
    crate::wire::TCP_HEADER_LEN + crate::wire::TCP_MAX_OPTIONS_LEN
    + super::MAX_SND_MSS as usize;

/// The TCP protocol engine.
pub struct TcpStack<'a> {
    pub(crate) pcbs: Slice<'a, Pcb<'a>>,
    pub(crate) active: KeyIndex<'a>,
    pub(crate) timewait: KeyIndex<'a>,
    pub(crate) listeners: Slice<'a, Listener>,
    /// Head (hottest) of the unreferenced-PCB list.
    pub(crate) unrefed_head: usize,
    /// Tail (oldest reusable candidate) of the unreferenced-PCB list.
    pub(crate) unrefed_tail: usize,
    /// The PCB for which input is currently processed; cleared by an abort from within a
    /// callback so the input path can detect it and unwind.
    pub(crate) current_pcb: Option<usize>,
    pub(crate) next_ephemeral: u16,
    pub(crate) isn: IsnGenerator,
    pub(crate) config: TcpConfig,
    pub(crate) tx_buf: [u8; TX_BUF_LEN],
}

impl<'a> TcpStack<'a> {
    pub fn new(storage: Storage<'a>, config: TcpConfig) -> Self {
        assert!(!storage.pcbs.is_empty());
        assert!(storage.active_index.len() >= storage.pcbs.len());
        assert!(storage.timewait_index.len() >= storage.pcbs.len());
        assert!(config.ephemeral_first > 0);
        assert!(config.ephemeral_first <= config.ephemeral_last);

        let mut stack = TcpStack {
            pcbs: storage.pcbs,
            active: KeyIndex::new(storage.active_index),
            timewait: KeyIndex::new(storage.timewait_index),
            listeners: storage.listeners,
            unrefed_head: NIL,
            unrefed_tail: NIL,
            current_pcb: None,
            next_ephemeral: config.ephemeral_first,
            isn: IsnGenerator::new(config.isn_keys),
            config,
            tx_buf: [0; TX_BUF_LEN],
        };

        // All PCBs start closed and unreferenced.
        for idx in 0..stack.pcbs.len() {
            stack.unrefed_prepend(idx);
        }
        stack
    }

    // === Unreferenced list management ===
    //
    // The list is intrusive over slot indices. The head holds hot PCBs that should survive
    // reuse the longest; `allocate_pcb` always takes the tail.

    pub(crate) fn unrefed_prepend(&mut self, idx: usize) {
        debug_assert!(!self.pcbs[idx].unrefed);
        let old_head = self.unrefed_head;
        {
            let pcb = &mut self.pcbs[idx];
            pcb.unrefed = true;
            pcb.unrefed_prev = NIL;
            pcb.unrefed_next = old_head;
        }
        if old_head != NIL {
            self.pcbs[old_head].unrefed_prev = idx;
        } else {
            self.unrefed_tail = idx;
        }
        self.unrefed_head = idx;
    }

    pub(crate) fn unrefed_append(&mut self, idx: usize) {
        debug_assert!(!self.pcbs[idx].unrefed);
        let old_tail = self.unrefed_tail;
        {
            let pcb = &mut self.pcbs[idx];
            pcb.unrefed = true;
            pcb.unrefed_prev = old_tail;
            pcb.unrefed_next = NIL;
        }
        if old_tail != NIL {
            self.pcbs[old_tail].unrefed_next = idx;
        } else {
            self.unrefed_head = idx;
        }
        self.unrefed_tail = idx;
    }

    pub(crate) fn unrefed_remove(&mut self, idx: usize) {
        debug_assert!(self.pcbs[idx].unrefed);
        let (prev, next) = {
            let pcb = &mut self.pcbs[idx];
            pcb.unrefed = false;
            (pcb.unrefed_prev, pcb.unrefed_next)
        };
        if prev != NIL {
            self.pcbs[prev].unrefed_next = next;
        } else {
            self.unrefed_head = next;
        }
        if next != NIL {
            self.pcbs[next].unrefed_prev = prev;
        } else {
            self.unrefed_tail = prev;
        }
    }

    /// Keep a hot unreferenced PCB from being reused soon.
    pub(crate) fn move_unrefed_to_front(&mut self, idx: usize) {
        debug_assert!(self.pcb_is_unreferenced(idx));
        if self.pcbs[idx].unrefed && self.unrefed_head != idx {
            self.unrefed_remove(idx);
            self.unrefed_prepend(idx);
        }
    }

    /// Prefer an unreferenced PCB for the next reuse.
    pub(crate) fn move_unrefed_to_back(&mut self, idx: usize) {
        if self.pcbs[idx].unrefed {
            if self.unrefed_tail != idx {
                self.unrefed_remove(idx);
                self.unrefed_append(idx);
            }
        } else {
            self.unrefed_append(idx);
        }
    }

    pub(crate) fn pcb_is_unreferenced(&self, idx: usize) -> bool {
        let pcb = &self.pcbs[idx];
        match pcb.state {
            State::SynRcvd => match pcb.listener() {
                Some(lis) => self.listeners[lis].accept_pcb != Some(idx),
                None => true,
            },
            _ => !pcb.user_attached,
        }
    }

    /// Take the oldest reusable PCB, aborting whatever it still holds.
    pub(crate) fn allocate_pcb(
        &mut self,
        now: Instant,
        ip: &mut dyn Ip4Tx,
        events: &mut dyn Events<'a>,
    ) -> Option<usize> {
        let idx = self.unrefed_tail;
        if idx == NIL {
            return None;
        }
        debug_assert!(self.pcb_is_unreferenced(idx));

        if self.pcbs[idx].state != State::Closed {
            self.pcb_abort_default_rst(now, ip, events, idx);
        }
        debug_assert_eq!(self.pcbs[idx].state, State::Closed);
        Some(idx)
    }

    // === Abort and state exits ===

    /// Abort with an RST except in the states where none must be sent.
    pub(crate) fn pcb_abort_default_rst(
        &mut self,
        now: Instant,
        ip: &mut dyn Ip4Tx,
        events: &mut dyn Events<'a>,
        idx: usize,
    ) {
        let send_rst = match self.pcbs[idx].state {
            State::SynSent | State::SynRcvd | State::TimeWait => false,
            _ => true,
        };
        self.pcb_abort(now, ip, events, idx, send_rst);
    }

    pub(crate) fn pcb_abort(
        &mut self,
        now: Instant,
        ip: &mut dyn Ip4Tx,
        events: &mut dyn Events<'a>,
        idx: usize,
        send_rst: bool,
    ) {
        debug_assert!(self.pcbs[idx].state != State::Closed);

        if send_rst {
            self.pcb_send_rst(ip, idx);
        }

        if self.pcbs[idx].state == State::SynRcvd {
            self.pcb_unlink_lis(idx);
        } else {
            // Disassociate any connection; delivers the aborted event if one is attached.
            self.pcb_unlink_con(events, idx, true);
        }

        // Input processing detects aborts performed from within user callbacks through this.
        if self.current_pcb == Some(idx) {
            self.current_pcb = None;
        }

        // Remove the PCB from the index it lives in.
        let key = self.pcbs[idx].key;
        if self.pcbs[idx].state == State::TimeWait {
            self.timewait.remove(&key);
        } else {
            self.active.remove(&key);
        }

        // Make this PCB the preferred reuse candidate.
        self.move_unrefed_to_back(idx);

        let pcb = &mut self.pcbs[idx];
        pcb.timers.unset_all();
        pcb.retry_registered = false;
        pcb.flags.clear_all();
        pcb.state = State::Closed;
        pcb.owner = Owner::None;
        pcb.user_attached = false;
        pcb.generation = pcb.generation.wrapping_add(1);
    }

    /// Detach the connection from an exiting PCB.
    ///
    /// When a user is attached this delivers `connection_aborted` with the reclaimed ring
    /// storage; the PCB then joins the unreferenced list, appended when closing for good and
    /// prepended when it lives on (TIME_WAIT).
    pub(crate) fn pcb_unlink_con(
        &mut self,
        events: &mut dyn Events<'a>,
        idx: usize,
        closing: bool,
    ) {
        debug_assert!(self.pcbs[idx].state != State::SynRcvd);

        let user_attached = self.pcbs[idx].user_attached;
        let owner = core::mem::replace(&mut self.pcbs[idx].owner, Owner::None);
        if let Owner::Connection(vars) = owner {
            let key = ConnKey { idx, generation: self.pcbs[idx].generation };
            self.pcbs[idx].user_attached = false;
            self.pcbs[idx].generation = self.pcbs[idx].generation.wrapping_add(1);

            if user_attached {
                let buffers = ReclaimedBuffers {
                    snd: vars.snd_buf.into_storage(),
                    rcv: vars.rcv_buf.into_storage(),
                };
                events.connection_aborted(key, buffers);
            }

            if !self.pcbs[idx].unrefed {
                if closing {
                    self.unrefed_append(idx);
                } else {
                    self.unrefed_prepend(idx);
                }
            }
        }
    }

    pub(crate) fn pcb_unlink_lis(&mut self, idx: usize) {
        debug_assert_eq!(self.pcbs[idx].state, State::SynRcvd);

        if let Some(lis) = self.pcbs[idx].listener() {
            let listener = &mut self.listeners[lis];
            debug_assert!(listener.num_pcbs > 0);
            listener.num_pcbs -= 1;

            // A PCB in the middle of being accepted was off the unreferenced list.
            if listener.accept_pcb == Some(idx) {
                listener.accept_pcb = None;
                self.unrefed_append(idx);
            }
        }
        self.pcbs[idx].owner = Owner::None;
    }

    pub(crate) fn pcb_go_to_time_wait(
        &mut self,
        now: Instant,
        events: &mut dyn Events<'a>,
        idx: usize,
    ) {
        debug_assert!(!matches!(
            self.pcbs[idx].state,
            State::Closed | State::SynRcvd | State::TimeWait));

        self.pcb_unlink_con(events, idx, false);

        // Do not accept any further acknowledgements.
        let pcb = &mut self.pcbs[idx];
        pcb.snd_nxt = pcb.snd_una;
        pcb.state = State::TimeWait;

        let key = pcb.key;
        self.active.remove(&key);
        self.timewait.insert(key, idx);

        let pcb = &mut self.pcbs[idx];
        pcb.timers.unset(Timer::Output);
        pcb.timers.unset(Timer::Rtx);
        pcb.flags.clear(PcbFlags::OUT_PENDING);
        pcb.timers.set(Timer::Abort, now + super::TIME_WAIT_TIMEOUT);
    }

    pub(crate) fn pcb_go_to_fin_wait_2(&mut self, idx: usize) {
        debug_assert_eq!(self.pcbs[idx].state, State::FinWait1);

        let pcb = &mut self.pcbs[idx];
        pcb.state = State::FinWait2;
        pcb.timers.unset(Timer::Output);
        pcb.timers.unset(Timer::Rtx);
        pcb.flags.clear(PcbFlags::OUT_PENDING);
    }

    // === Lookup ===

    pub(crate) fn find_pcb(&self, key: &PcbKey) -> Option<usize> {
        self.active.find(key).or_else(|| self.timewait.find(key))
    }

    pub(crate) fn find_listener_for_rx(&self, addr: Ipv4Address, port: u16) -> Option<usize> {
        self.listeners.iter().position(|lis| {
            lis.used && lis.port == port
                && (lis.addr == addr || lis.addr.is_unspecified())
        })
    }

    pub(crate) fn get_ephemeral_port(&mut self, key_template: PcbKey) -> Option<u16> {
        let range = u32::from(self.config.ephemeral_last)
            - u32::from(self.config.ephemeral_first) + 1;
        for _ in 0..range {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port < self.config.ephemeral_last {
                port + 1
            } else {
                self.config.ephemeral_first
            };

            let key = PcbKey { local_port: port, ..key_template };
            if self.find_pcb(&key).is_none() {
                return Some(port);
            }
        }
        None
    }

    // === User API: open/listen ===

    /// Start listening.
    pub fn listen(&mut self, params: ListenParams) -> Result<ListenerKey> {
        if self.find_listener_for_rx(params.addr, params.port).is_some() {
            return Err(Error::NoPortAvail);
        }
        let slot = self.listeners.iter().position(|lis| !lis.used)
            .ok_or(Error::NoPcbAvail)?;

        self.listeners[slot] = Listener {
            used: true,
            addr: params.addr,
            port: params.port,
            max_pcbs: params.max_pcbs.max(1),
            num_pcbs: 0,
            initial_rcv_wnd: params.initial_rcv_wnd.min(super::MAX_WINDOW),
            accept_pcb: None,
        };
        Ok(ListenerKey(slot))
    }

    /// Stop listening; half-open connections of the listener are dropped silently.
    pub fn unlisten(&mut self, key: ListenerKey) {
        if !self.listeners[key.0].used {
            return;
        }
        for idx in 0..self.pcbs.len() {
            if self.pcbs[idx].state == State::SynRcvd
                && self.pcbs[idx].listener() == Some(key.0)
            {
                // No RST: the peer retries or times out, same as a lost SYN-ACK.
                self.pcb_unlink_lis(idx);
                let pcb_key = self.pcbs[idx].key;
                self.active.remove(&pcb_key);
                let pcb = &mut self.pcbs[idx];
                pcb.timers.unset_all();
                pcb.flags.clear_all();
                pcb.retry_registered = false;
                pcb.state = State::Closed;
                pcb.generation = pcb.generation.wrapping_add(1);
                self.move_unrefed_to_back(idx);
            }
        }
        self.listeners[key.0] = Listener::default();
    }

    /// Actively open a connection.
    pub fn connect(
        &mut self,
        now: Instant,
        ip: &mut dyn Ip4Tx,
        events: &mut dyn Events<'a>,
        remote_addr: Ipv4Address,
        remote_port: u16,
        snd_storage: Slice<'a, u8>,
        rcv_storage: Slice<'a, u8>,
    ) -> Result<ConnKey> {
        let (local_addr, iface_mtu) = ip.local_addr_for(remote_addr)
            .ok_or(Error::NoRoute)?;

        let key_template = PcbKey {
            local_addr,
            remote_addr,
            local_port: 0,
            remote_port,
        };
        let local_port = self.get_ephemeral_port(key_template)
            .ok_or(Error::NoPortAvail)?;
        let key = PcbKey { local_port, ..key_template };

        let iface_mss = iface_mtu.saturating_sub(IPV4_TCP_HEADER_LEN as u16)
            .min(super::MAX_SND_MSS);
        let pmtu = ip.pmtu(remote_addr);

        let idx = self.allocate_pcb(now, ip, events).ok_or(Error::NoPcbAvail)?;
        self.unrefed_remove(idx);

        let iss = self.isn.get_isn(key, now);

        // The initial receive window is at least one for the SYN and at most 16-bit wide
        // since SYN segments carry an unscaled window.
        let user_rcv_wnd = rcv_storage.len() as u32;
        let rcv_wnd = 1 + user_rcv_wnd.min(u32::from(u16::max_value()) - 1);

        let vars = ConnVars::new(
            SendRing::new(snd_storage),
            RecvRing::new(rcv_storage),
            self.config.window_update_threshold);

        {
            let pcb = &mut self.pcbs[idx];
            pcb.key = key;
            pcb.state = State::SynSent;
            pcb.flags.clear_all();
            pcb.flags.set(PcbFlags::WND_SCALE); // request the window scale option
            pcb.owner = Owner::Connection(vars);
            pcb.user_attached = true;
            pcb.rcv_nxt = TcpSeqNumber(0); // learned from the SYN-ACK
            pcb.rcv_ann_wnd = rcv_wnd;
            pcb.snd_una = iss;
            pcb.snd_nxt = iss;
            pcb.snd_mss = pmtu; // store the PMTU here until established
            pcb.base_snd_mss = iface_mss;
            pcb.rto = super::INITIAL_RTX_TIME;
            pcb.num_dupack = 0;
            pcb.snd_wnd_shift = 0;
            pcb.rcv_wnd_shift = super::RCV_WND_SHIFT;
            pcb.timers.set(Timer::Abort, now + super::SYN_SENT_TIMEOUT);
        }
        self.active.insert(key, idx);
        let rto = output::rto_duration(self.pcbs[idx].rto);
        self.pcbs[idx].timers.set(Timer::Rtx, now + rto);

        output::pcb_send_syn(self, now, ip, idx);

        Ok(ConnKey { idx, generation: self.pcbs[idx].generation })
    }

    // === Receive entry point ===

    /// Process a received TCP segment carried in an IPv4 payload.
    pub fn receive(
        &mut self,
        now: Instant,
        ip: &mut dyn Ip4Tx,
        events: &mut dyn Events<'a>,
        info: RxInfo,
        segment: &[u8],
    ) {
        if info.protocol != IpProtocol::Tcp {
            return;
        }

        let packet = match tcp_packet::new_checked(segment) {
            Ok(packet) => packet,
            Err(err) => return net_trace!("tcp: dropped: {}", err),
        };
        let repr = match TcpRepr::parse(
            packet, Checksum::Manual, info.src_addr, info.dst_addr)
        {
            Ok(repr) => repr,
            Err(err) => return net_trace!("tcp: dropped: {}", err),
        };
        let payload = packet.payload_slice();

        let key = PcbKey {
            local_addr: info.dst_addr,
            remote_addr: info.src_addr,
            local_port: repr.dst_port,
            remote_port: repr.src_port,
        };

        if let Some(idx) = self.find_pcb(&key) {
            return input::pcb_input(self, now, ip, events, idx, &repr, payload);
        }

        // Reject broadcast-sourced segments before considering new connections. PCB lookups
        // above get away without this because established tuples were sanity checked already.
        if !info.src_addr.is_unicast() {
            return;
        }

        if let Some(lis) = self.find_listener_for_rx(info.dst_addr, repr.dst_port) {
            return input::listen_input(self, now, ip, events, lis, &key, &repr, payload.len());
        }

        // Reply with RST, unless this is an RST.
        if !repr.flags.rst() {
            output::send_rst_reply(self, ip, &key, &repr, payload.len());
        }
    }

    // === Timers ===

    /// Run every due logical timer.
    pub fn poll(&mut self, now: Instant, ip: &mut dyn Ip4Tx, events: &mut dyn Events<'a>) {
        for idx in 0..self.pcbs.len() {
            loop {
                let due = self.pcbs[idx].timers.take_due(now);
                match due {
                    None => break,
                    Some(Timer::Abort) => {
                        debug_assert!(self.pcbs[idx].state != State::Closed);
                        self.pcb_abort_default_rst(now, ip, events, idx);
                    }
                    Some(Timer::Output) => {
                        self.pcbs[idx].flags.clear(PcbFlags::OUT_RETRY);
                        output::pcb_output_timer_handler(self, now, ip, idx);
                    }
                    Some(Timer::Rtx) => {
                        output::pcb_rtx_timer_handler(self, now, ip, idx);
                    }
                }
            }
        }
    }

    /// The earliest deadline across all PCB timer bundles.
    ///
    /// Within one logical step the embedder programs its single physical timer at most once,
    /// from this value.
    pub fn next_poll_time(&self) -> Expiration {
        self.pcbs.iter()
            .map(|pcb| pcb.timers.next())
            .fold(Expiration::Never, Expiration::min)
    }

    /// Re-attempt a send that previously failed with a pending link resolution.
    pub fn retry_sending(&mut self, now: Instant, ip: &mut dyn Ip4Tx, token: RetryToken) {
        let idx = token.0;
        if idx >= self.pcbs.len() || !self.pcbs[idx].retry_registered {
            return;
        }
        self.pcbs[idx].retry_registered = false;
        output::pcb_send_retry(self, now, ip, idx);
    }

    // === User API: connection operations ===

    pub(crate) fn conn_idx(&self, key: ConnKey) -> Option<usize> {
        let pcb = self.pcbs.get(key.idx)?;
        if pcb.generation == key.generation && pcb.user_attached {
            Some(key.idx)
        } else {
            None
        }
    }

    /// The state of a connection, `None` for stale handles.
    pub fn state_of(&self, key: ConnKey) -> Option<State> {
        self.conn_idx(key).map(|idx| self.pcbs[idx].state)
    }

    /// Queue data for sending. Returns the amount that fit into the send buffer.
    pub fn send(
        &mut self,
        now: Instant,
        ip: &mut dyn Ip4Tx,
        key: ConnKey,
        data: &[u8],
    ) -> usize {
        let idx = match self.conn_idx(key) {
            Some(idx) => idx,
            None => return 0,
        };
        let state = self.pcbs[idx].state;
        if state != State::SynSent && !state.is_snd_open() {
            return 0;
        }

        let amount = match self.pcbs[idx].con_mut() {
            Some(vars) => vars.snd_buf.enqueue(data),
            None => return 0,
        };

        if amount > 0 && state != State::SynSent {
            output::pcb_snd_buf_extended(self, now, idx);
        }
        let _ = ip;
        amount
    }

    /// Free space in the send buffer.
    pub fn send_free(&self, key: ConnKey) -> usize {
        self.conn_idx(key)
            .and_then(|idx| self.pcbs[idx].con())
            .map(|vars| vars.snd_buf.free())
            .unwrap_or(0)
    }

    /// Set the PSH index to the end of the queued data and expedite output.
    pub fn push(&mut self, now: Instant, ip: &mut dyn Ip4Tx, key: ConnKey) {
        let idx = match self.conn_idx(key) {
            Some(idx) => idx,
            None => return,
        };
        if let Some(vars) = self.pcbs[idx].con_mut() {
            vars.snd_buf.push_all();
        }
        let state = self.pcbs[idx].state;
        if state.can_output() && output::pcb_has_snd_outstanding(self, idx) {
            output::pcb_push_output(self, now, idx);
        }
        let _ = ip;
    }

    /// Close the sending direction; a FIN follows all queued data.
    pub fn shutdown_send(&mut self, now: Instant, ip: &mut dyn Ip4Tx, key: ConnKey) {
        let idx = match self.conn_idx(key) {
            Some(idx) => idx,
            None => return,
        };
        match self.pcbs[idx].state {
            State::SynSent => {
                // Remembered until the handshake completes.
                if let Some(vars) = self.pcbs[idx].con_mut() {
                    vars.snd_closed = true;
                }
            }
            state if state.is_snd_open() => {
                if let Some(vars) = self.pcbs[idx].con_mut() {
                    vars.snd_buf.push_all();
                }
                output::pcb_end_sending(self, now, idx);
            }
            _ => {}
        }
        let _ = ip;
    }

    /// Drain received data. Returns the amount read and re-announces window as appropriate.
    pub fn recv(
        &mut self,
        now: Instant,
        ip: &mut dyn Ip4Tx,
        key: ConnKey,
        out: &mut [u8],
    ) -> usize {
        let idx = match self.conn_idx(key) {
            Some(idx) => idx,
            None => return 0,
        };
        let amount = match self.pcbs[idx].con_mut() {
            Some(vars) => vars.rcv_buf.read(out),
            None => 0,
        };
        if amount > 0 {
            input::pcb_rcv_buf_extended(self, now, ip, idx);
        }
        amount
    }

    /// Bytes received and not yet drained.
    pub fn recv_available(&self, key: ConnKey) -> usize {
        self.conn_idx(key)
            .and_then(|idx| self.pcbs[idx].con())
            .map(|vars| vars.rcv_buf.unread())
            .unwrap_or(0)
    }

    /// Replace the receive buffer storage, preserving the occupied region.
    ///
    /// Returns the old storage, or gives the new storage back when it cannot hold the unread
    /// data plus any out-of-sequence region.
    pub fn set_recv_buf(
        &mut self,
        now: Instant,
        ip: &mut dyn Ip4Tx,
        key: ConnKey,
        storage: Slice<'a, u8>,
    ) -> core::result::Result<Slice<'a, u8>, Slice<'a, u8>> {
        let idx = match self.conn_idx(key) {
            Some(idx) => idx,
            None => return Err(storage),
        };
        let rcv_nxt = self.pcbs[idx].rcv_nxt;
        let vars = match self.pcbs[idx].con_mut() {
            Some(vars) => vars,
            None => return Err(storage),
        };

        let extent = vars.rcv_buf.unread() + vars.ooseq.max_extent(rcv_nxt);
        if extent > storage.len() {
            return Err(storage);
        }
        let old = vars.rcv_buf.migrate(storage, extent);

        // More buffer usually means more window to announce.
        input::pcb_rcv_buf_extended(self, now, ip, idx);
        Ok(old)
    }

    /// Override the window update suppression threshold of one connection.
    pub fn set_window_update_threshold(&mut self, key: ConnKey, threshold: u32) {
        if let Some(idx) = self.conn_idx(key) {
            if let Some(vars) = self.pcbs[idx].con_mut() {
                vars.rcv_ann_thres = threshold.min(super::MAX_WINDOW);
            }
        }
    }

    /// Drop interest in a connection.
    ///
    /// The receive storage is always handed back. If nothing remains to flush the PCB closes
    /// immediately and the send storage comes back too; otherwise the PCB is abandoned: the
    /// stack flushes queued data and a FIN by itself, announces extra window to hurry the
    /// peer along, gives up after a timeout, and the send storage (returned empty here) is
    /// recovered only by drop. No callbacks are delivered for this connection anymore.
    pub fn reset(
        &mut self,
        now: Instant,
        ip: &mut dyn Ip4Tx,
        key: ConnKey,
    ) -> Option<ReclaimedBuffers<'a>> {
        let idx = self.conn_idx(key)?;

        let must_abort = {
            let pcb = &self.pcbs[idx];
            let vars = pcb.con()?;
            // Data the peer already considers delivered cannot be un-received, and a PCB
            // still handshaking has nothing worth draining.
            pcb.state == State::SynSent
                || vars.rcv_buf.unread() > 0
                || !vars.ooseq.is_nothing_buffered()
        };

        // Detach the user in any case; no callbacks after reset.
        self.pcbs[idx].user_attached = false;
        self.pcbs[idx].generation = self.pcbs[idx].generation.wrapping_add(1);
        self.pcbs[idx].flags.clear(PcbFlags::RTT_PENDING);
        self.pcbs[idx].flags.clear(PcbFlags::RCV_WND_UPD);

        if must_abort {
            let owner = core::mem::replace(&mut self.pcbs[idx].owner, Owner::None);
            let buffers = match owner {
                Owner::Connection(vars) => Some(ReclaimedBuffers {
                    snd: vars.snd_buf.into_storage(),
                    rcv: vars.rcv_buf.into_storage(),
                }),
                _ => None,
            };
            self.unrefed_append(idx);
            // The abort path below sends no RST from SYN_SENT by itself.
            let send_rst = self.pcbs[idx].state != State::SynSent;
            self.pcb_abort(now, ip, &mut NoEvents, idx, send_rst);
            return buffers;
        }

        // Abandoned drain: flush everything and a FIN, then linger briefly. The receive
        // ring can be reclaimed right away: an abandoned PCB aborts on any arriving data, so
        // the ring is never written again. The send ring stays captive until it drains.
        let rcv = match self.pcbs[idx].con_mut() {
            Some(vars) => {
                let empty = RecvRing::new(Slice::empty());
                core::mem::replace(&mut vars.rcv_buf, empty).into_storage()
            }
            None => Slice::empty(),
        };
        self.unrefed_append(idx);
        input::pcb_abandoned(self, now, ip, idx);
        Some(ReclaimedBuffers { snd: Slice::empty(), rcv })
    }
}

/// Event sink for paths where no user can be attached anymore.
pub(crate) struct NoEvents;

impl<'a> Events<'a> for NoEvents {
    fn connection_aborted(&mut self, _key: ConnKey, _buffers: ReclaimedBuffers<'a>) {}
    fn data_received(&mut self, _conn: super::connection::Control<'_, 'a>, _amount: usize) {}
    fn accept_ready(
        &mut self,
        _listener: ListenerKey,
        _accept: super::connection::Acceptor<'_, 'a>,
    ) {}
}

/// Adapter plugging the TCP engine into the ip-layer dispatcher.
pub struct Incoming<'r, 'a, E> {
    pub stack: &'r mut TcpStack<'a>,
    pub ip: &'r mut dyn Ip4Tx,
    pub events: &'r mut E,
}

impl<'r, 'a, E: Events<'a>> ip::Recv for Incoming<'r, 'a, E> {
    fn receive(&mut self, now: Instant, info: RxInfo, payload: &[u8]) {
        self.stack.receive(now, &mut *self.ip, &mut *self.events, info, payload)
    }
}
