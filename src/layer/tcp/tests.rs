//! End-to-end behavior of the protocol engine over a scripted lower layer.
use crate::layer::ip::{Error, Ip4Tx, Result, RetryToken, RxInfo, SendMeta};
use crate::managed::Slice;
use crate::time::{Duration, Instant};
use crate::wire::{
    Checksum, IpProtocol, Ipv4Address, TcpFlags, TcpRepr, TcpSeqNumber, tcp_packet,
};

use super::queue::{ListenQueue, QueueSlot};
use super::{
    Acceptor, ConnKey, Control, Events, ListenParams, ListenerKey, ReclaimedBuffers,
    State, Storage, TcpConfig, TcpStack,
};

const LOCAL: Ipv4Address = Ipv4Address([10, 0, 0, 1]);
const REMOTE: Ipv4Address = Ipv4Address([10, 0, 0, 2]);

struct MockIp {
    sent: Vec<(SendMeta, Vec<u8>)>,
    mtu: u16,
    pmtu: u16,
    /// Errors to inject, consumed front first.
    fail_next: Vec<Error>,
}

impl MockIp {
    fn new() -> Self {
        MockIp {
            sent: vec![],
            mtu: 1500,
            pmtu: 1500,
            fail_next: vec![],
        }
    }

    /// Parse the `i`-th captured segment, verifying its checksum.
    fn segment(&self, i: usize) -> (TcpRepr, Vec<u8>) {
        let (meta, bytes) = &self.sent[i];
        let packet = tcp_packet::new_checked(bytes).expect("valid segment");
        let repr = TcpRepr::parse(packet, Checksum::Manual, meta.src_addr, meta.dst_addr)
            .expect("valid checksum");
        (repr, packet.payload_slice().to_vec())
    }

    fn last_segment(&self) -> (TcpRepr, Vec<u8>) {
        self.segment(self.sent.len() - 1)
    }
}

impl Ip4Tx for MockIp {
    fn local_addr_for(&self, _remote: Ipv4Address) -> Option<(Ipv4Address, u16)> {
        Some((LOCAL, self.mtu))
    }

    fn pmtu(&self, _remote: Ipv4Address) -> u16 {
        self.pmtu
    }

    fn handle_local_packet_too_big(&mut self, _remote: Ipv4Address) {
        self.pmtu = self.pmtu.min(self.mtu);
    }

    fn send_dgram(&mut self, meta: SendMeta, payload: &[u8], _retry: Option<RetryToken>)
        -> Result<()>
    {
        if !self.fail_next.is_empty() {
            return Err(self.fail_next.remove(0));
        }
        self.sent.push((meta, payload.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
struct TestEvents {
    established: Vec<ConnKey>,
    aborted: Vec<ConnKey>,
    received: Vec<(ConnKey, usize)>,
    acked: Vec<(ConnKey, usize)>,
    accepted: Vec<ConnKey>,
    /// Ring sizes for immediate acceptance of passive opens.
    accept_bufs: Option<(usize, usize)>,
    queue: Option<ListenQueue<'static>>,
}

impl Events<'static> for TestEvents {
    fn connection_established(&mut self, conn: Control<'_, 'static>) {
        self.established.push(conn.key());
    }

    fn connection_aborted(&mut self, key: ConnKey, buffers: ReclaimedBuffers<'static>) {
        if let Some(queue) = self.queue.as_mut() {
            if queue.handle_aborted(key, buffers).is_none() {
                return;
            }
        }
        self.aborted.push(key);
    }

    fn data_received(&mut self, conn: Control<'_, 'static>, amount: usize) {
        let key = conn.key();
        if let Some(queue) = self.queue.as_mut() {
            if queue.handle_data_received(conn, amount).is_none() {
                return;
            }
        }
        self.received.push((key, amount));
    }

    fn data_sent(&mut self, conn: Control<'_, 'static>, amount: usize) {
        self.acked.push((conn.key(), amount));
    }

    fn accept_ready(&mut self, listener: ListenerKey, accept: Acceptor<'_, 'static>) {
        if let Some(queue) = self.queue.as_mut() {
            if queue.handle_accept_ready(listener, accept) {
                return;
            }
            return;
        }
        if let Some((snd, rcv)) = self.accept_bufs {
            let key = accept
                .accept(Slice::Owned(vec![0; snd]), Slice::Owned(vec![0; rcv]))
                .expect("accept");
            self.accepted.push(key);
        }
    }
}

fn stack() -> TcpStack<'static> {
    TcpStack::new(Storage::owned(4, 2), TcpConfig::default())
}

fn rx_info() -> RxInfo {
    RxInfo {
        src_addr: REMOTE,
        dst_addr: LOCAL,
        protocol: IpProtocol::Tcp,
        ttl: 64,
    }
}

struct SegSpec {
    src_port: u16,
    dst_port: u16,
    seq: TcpSeqNumber,
    ack: Option<TcpSeqNumber>,
    syn: bool,
    fin: bool,
    rst: bool,
    window: u16,
    mss: Option<u16>,
    wscale: Option<u8>,
}

impl SegSpec {
    fn ack(seq: TcpSeqNumber, ack: TcpSeqNumber, window: u16) -> Self {
        SegSpec {
            src_port: 80,
            dst_port: 49152,
            seq,
            ack: Some(ack),
            syn: false,
            fin: false,
            rst: false,
            window,
            mss: None,
            wscale: None,
        }
    }

    fn build(&self, payload: &[u8]) -> Vec<u8> {
        let mut flags = TcpFlags::default();
        flags.set_syn(self.syn);
        flags.set_fin(self.fin);
        flags.set_rst(self.rst);
        let repr = TcpRepr {
            src_port: self.src_port,
            dst_port: self.dst_port,
            flags,
            seq_number: self.seq,
            ack_number: self.ack,
            window_len: self.window,
            window_scale: self.wscale,
            max_seg_size: self.mss,
            payload_len: payload.len() as u16,
        };
        let mut bytes = vec![0; repr.buffer_len()];
        repr.emit(tcp_packet::new_unchecked_mut(&mut bytes));
        {
            let packet = tcp_packet::new_unchecked_mut(&mut bytes);
            packet.payload_mut_slice().copy_from_slice(payload);
            packet.fill_checksum(REMOTE, LOCAL);
        }
        bytes
    }
}

/// Open a connection and complete the handshake against a scripted peer.
///
/// The peer uses ISN 1000, announces `peer_window` (unscaled) and scales with shift 6 when
/// `peer_ws`. Returns the connection key and our ISS.
fn establish(
    stack: &mut TcpStack<'static>,
    ip: &mut MockIp,
    events: &mut TestEvents,
    now: Instant,
    buf_size: usize,
    peer_window: u16,
    peer_ws: bool,
) -> (ConnKey, TcpSeqNumber) {
    let key = stack
        .connect(
            now, ip, events, REMOTE, 80,
            Slice::Owned(vec![0; buf_size]),
            Slice::Owned(vec![0; buf_size]))
        .expect("connect");

    let (syn, _) = ip.last_segment();
    assert!(syn.flags.syn() && !syn.flags.ack());
    assert_eq!(syn.src_port, 49152);
    assert_eq!(syn.dst_port, 80);
    assert_eq!(syn.max_seg_size, Some(1460));
    assert_eq!(syn.window_scale, Some(6));
    let iss = syn.seq_number;

    let syn_ack = SegSpec {
        src_port: 80,
        dst_port: 49152,
        seq: TcpSeqNumber(1000),
        ack: Some(iss + 1),
        syn: true,
        fin: false,
        rst: false,
        window: peer_window,
        mss: Some(1460),
        wscale: if peer_ws { Some(6) } else { None },
    };
    stack.receive(now, ip, events, rx_info(), &syn_ack.build(&[]));

    assert_eq!(events.established, vec![key]);
    let (ack, _) = ip.last_segment();
    assert!(ack.flags.ack() && !ack.flags.syn());
    assert_eq!(ack.seq_number, iss + 1);
    assert_eq!(ack.ack_number, Some(TcpSeqNumber(1001)));

    (key, iss)
}

#[test]
fn handshake_send_close_wire_sequence() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents::default();
    let now = Instant::from_millis(0);

    let (key, iss) = establish(&mut stack, &mut ip, &mut events, now, 1024, 65535, true);

    // Queue five bytes; pushing forces past the small-segment delay.
    assert_eq!(stack.send(now, &mut ip, key, b"hello"), 5);
    stack.push(now, &mut ip, key);
    stack.poll(now, &mut ip, &mut events);

    let (data, payload) = ip.last_segment();
    assert!(data.flags.ack() && data.flags.psh());
    assert_eq!(data.seq_number, iss + 1);
    assert_eq!(data.ack_number, Some(TcpSeqNumber(1001)));
    assert_eq!(payload, b"hello");

    // The peer acknowledges the data.
    let ack = SegSpec::ack(TcpSeqNumber(1001), iss + 6, 65535);
    stack.receive(now, &mut ip, &mut events, rx_info(), &ack.build(&[]));
    assert_eq!(events.acked, vec![(key, 5)]);

    // Our close emits a FIN carrying PSH.
    stack.shutdown_send(now, &mut ip, key);
    stack.poll(now, &mut ip, &mut events);
    let (fin, _) = ip.last_segment();
    assert!(fin.flags.fin() && fin.flags.ack());
    assert_eq!(fin.seq_number, iss + 6);
    assert_eq!(fin.ack_number, Some(TcpSeqNumber(1001)));
    assert_eq!(stack.state_of(key), Some(State::FinWait1));

    // The peer acknowledges our FIN and sends its own in one segment.
    let peer_fin = SegSpec {
        fin: true,
        ..SegSpec::ack(TcpSeqNumber(1001), iss + 7, 65535)
    };
    stack.receive(now, &mut ip, &mut events, rx_info(), &peer_fin.build(&[]));

    // The user saw the FIN and then the terminal event, storage included.
    assert_eq!(events.received, vec![(key, 0)]);
    assert_eq!(events.aborted, vec![key]);

    // The final ACK of the peer's FIN.
    let (last, _) = ip.last_segment();
    assert!(last.flags.ack() && !last.flags.fin() && !last.flags.rst());
    assert_eq!(last.seq_number, iss + 7);
    assert_eq!(last.ack_number, Some(TcpSeqNumber(1002)));

    // The handle went stale with the detachment.
    assert_eq!(stack.state_of(key), None);
}

#[test]
fn passive_open_and_receive() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents {
        accept_bufs: Some((512, 512)),
        ..TestEvents::default()
    };
    let now = Instant::from_millis(0);

    stack
        .listen(ListenParams {
            addr: Ipv4Address::UNSPECIFIED,
            port: 80,
            max_pcbs: 4,
            initial_rcv_wnd: 512,
        })
        .expect("listen");

    let syn = SegSpec {
        src_port: 40000,
        dst_port: 80,
        seq: TcpSeqNumber(5000),
        ack: None,
        syn: true,
        fin: false,
        rst: false,
        window: 4096,
        mss: Some(1400),
        wscale: Some(7),
    };
    stack.receive(now, &mut ip, &mut events, rx_info(), &syn.build(&[]));

    let (syn_ack, _) = ip.last_segment();
    assert!(syn_ack.flags.syn() && syn_ack.flags.ack());
    assert_eq!(syn_ack.ack_number, Some(TcpSeqNumber(5001)));
    assert_eq!(syn_ack.max_seg_size, Some(1460));
    // We echo our shift, not the peer's.
    assert_eq!(syn_ack.window_scale, Some(6));
    assert_eq!(syn_ack.window_len, 512);
    let server_iss = syn_ack.seq_number;

    // The handshake ACK triggers acceptance.
    let hs_ack = SegSpec {
        src_port: 40000,
        dst_port: 80,
        ..SegSpec::ack(TcpSeqNumber(5001), server_iss + 1, 4096)
    };
    stack.receive(now, &mut ip, &mut events, rx_info(), &hs_ack.build(&[]));
    assert_eq!(events.accepted.len(), 1);
    let key = events.accepted[0];
    assert_eq!(stack.state_of(key), Some(State::Established));

    // Data flows up.
    let data = SegSpec {
        src_port: 40000,
        dst_port: 80,
        ..SegSpec::ack(TcpSeqNumber(5001), server_iss + 1, 4096)
    };
    stack.receive(now, &mut ip, &mut events, rx_info(), &data.build(b"ping"));
    assert_eq!(events.received, vec![(key, 4)]);

    let mut buf = [0u8; 16];
    assert_eq!(stack.recv(now, &mut ip, key, &mut buf), 4);
    assert_eq!(&buf[..4], b"ping");

    // The data was acknowledged.
    let (ack, _) = ip.last_segment();
    assert_eq!(ack.ack_number, Some(TcpSeqNumber(5005)));
}

#[test]
fn out_of_order_segments_deliver_in_sequence() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents::default();
    let now = Instant::from_millis(0);

    let (key, _iss) = establish(&mut stack, &mut ip, &mut events, now, 1024, 65535, true);

    // Second segment first: buffered, nothing delivered, duplicate ACK forced.
    let sent_before = ip.sent.len();
    let snd_nxt = stack_snd_nxt(&stack, key);
    let spec = SegSpec::ack(TcpSeqNumber(1005), snd_nxt, 65535);
    stack.receive(now, &mut ip, &mut events, rx_info(), &spec.build(b"wxyz"));
    assert!(events.received.is_empty());
    let (dup_ack, _) = ip.segment(sent_before);
    assert_eq!(dup_ack.ack_number, Some(TcpSeqNumber(1001)));

    // The gap closes; everything is delivered at once and in order.
    let spec = SegSpec::ack(TcpSeqNumber(1001), snd_nxt, 65535);
    stack.receive(now, &mut ip, &mut events, rx_info(), &spec.build(b"abcd"));
    assert_eq!(events.received, vec![(key, 8)]);

    let mut buf = [0u8; 16];
    assert_eq!(stack.recv(now, &mut ip, key, &mut buf), 8);
    assert_eq!(&buf[..8], b"abcdwxyz");

    let (ack, _) = ip.last_segment();
    assert_eq!(ack.ack_number, Some(TcpSeqNumber(1009)));
}

fn stack_snd_nxt(stack: &TcpStack, key: ConnKey) -> TcpSeqNumber {
    // The peer must ack something valid; the SYN consumed one count past the ISS.
    let idx = stack.conn_idx(key).expect("live connection");
    stack.pcbs[idx].snd_nxt
}

#[test]
fn fast_retransmit_on_third_duplicate_ack() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents::default();
    let now = Instant::from_millis(0);

    let (key, iss) = establish(&mut stack, &mut ip, &mut events, now, 8192, 65535, true);

    // Five full segments; the initial congestion window (3 segments) goes out first.
    let payload = vec![0x5a; 5 * 1460];
    assert_eq!(stack.send(now, &mut ip, key, &payload), 5 * 1460);
    stack.push(now, &mut ip, key);
    let sent_before = ip.sent.len();
    stack.poll(now, &mut ip, &mut events);
    assert_eq!(ip.sent.len() - sent_before, 3);

    // The first segment is acknowledged; the window slides and the rest goes out.
    let s2_begin = iss + 1 + 1460;
    let ack1 = SegSpec::ack(TcpSeqNumber(1001), s2_begin, 65535);
    stack.receive(now, &mut ip, &mut events, rx_info(), &ack1.build(&[]));
    let after_ack = ip.sent.len();
    assert_eq!(after_ack - sent_before, 5);

    // The second segment is lost; three duplicate ACKs arrive.
    for _ in 0..3 {
        let dup = SegSpec::ack(TcpSeqNumber(1001), s2_begin, 65535);
        stack.receive(now, &mut ip, &mut events, rx_info(), &dup.build(&[]));
    }

    // Exactly one retransmission of the lost segment.
    let retransmitted: Vec<_> = ip.sent[after_ack..].iter().enumerate()
        .map(|(i, _)| ip.segment(after_ack + i).0)
        .filter(|repr| repr.seq_number == s2_begin)
        .collect();
    assert_eq!(retransmitted.len(), 1);
    assert_eq!(retransmitted[0].payload_len, 1460);

    // The cumulative ACK covering everything exits recovery; nothing is re-sent.
    let sent_before_exit = ip.sent.len();
    let full_ack = SegSpec::ack(TcpSeqNumber(1001), iss + 1 + 5 * 1460, 65535);
    stack.receive(now, &mut ip, &mut events, rx_info(), &full_ack.build(&[]));
    assert_eq!(events.acked.last(), Some(&(key, 5 * 1460)));
    for i in sent_before_exit..ip.sent.len() {
        let (repr, _) = ip.segment(i);
        assert_eq!(repr.payload_len, 0, "no data retransmitted after recovery exit");
    }
}

#[test]
fn zero_window_probe_every_rto() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents::default();
    let t0 = Instant::from_millis(0);

    // The peer advertises a zero window from the start.
    let (key, iss) = establish(&mut stack, &mut ip, &mut events, t0, 1024, 0, true);

    assert_eq!(stack.send(t0, &mut ip, key, b"stuck"), 5);
    stack.push(t0, &mut ip, key);
    let sent_before = ip.sent.len();
    stack.poll(t0, &mut ip, &mut events);
    // Nothing can be sent yet.
    assert_eq!(ip.sent.len(), sent_before);

    // After one RTO a probe of one byte goes out.
    let t1 = t0 + Duration::from_millis(1100);
    stack.poll(t1, &mut ip, &mut events);
    assert_eq!(ip.sent.len(), sent_before + 1);
    let (probe, payload) = ip.last_segment();
    assert_eq!(probe.seq_number, iss + 1);
    assert_eq!(payload, b"s");

    // The backoff doubles; another probe follows one doubled RTO later.
    let t2 = t1 + Duration::from_millis(2100);
    stack.poll(t2, &mut ip, &mut events);
    assert_eq!(ip.sent.len(), sent_before + 2);

    // An opened window releases the queued data at once.
    let open = SegSpec::ack(TcpSeqNumber(1001), iss + 1, 65535);
    stack.receive(t2, &mut ip, &mut events, rx_info(), &open.build(&[]));
    let (data, payload) = ip.last_segment();
    assert_eq!(data.seq_number, iss + 1);
    assert_eq!(payload, b"stuck");
}

#[test]
fn abandoned_connection_drains_and_times_out() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents::default();
    let t0 = Instant::from_millis(0);

    // Zero peer window keeps the queued kilobyte from being sent.
    let (key, iss) = establish(&mut stack, &mut ip, &mut events, t0, 2048, 0, true);
    assert_eq!(stack.send(t0, &mut ip, key, &[0x42; 1024]), 1024);

    let sent_before = ip.sent.len();
    let reclaimed = stack.reset(t0, &mut ip, key).expect("storage comes back");
    assert_eq!(reclaimed.rcv.len(), 2048);
    assert_eq!(stack.state_of(key), None);

    // Abandonment announces a window of at least 2^16 - 1 to hurry the peer.
    let (wnd_update, _) = ip.segment(sent_before);
    assert!(u32::from(wnd_update.window_len) << 6 >= 0xffff);

    // Once the peer opens its window, the stack flushes the data and its FIN on its own.
    let open = SegSpec::ack(TcpSeqNumber(1001), iss + 1, 65535);
    stack.receive(t0, &mut ip, &mut events, rx_info(), &open.build(&[]));
    let (drained, payload) = ip.last_segment();
    assert_eq!(payload.len(), 1024);
    assert!(drained.flags.fin());

    // No user events for a reset connection.
    assert!(events.aborted.is_empty());
    assert!(events.acked.is_empty());

    // The peer never finishes; the abort timer fires after 30 s with an RST.
    let t1 = t0 + Duration::from_secs(31);
    stack.poll(t1, &mut ip, &mut events);
    let (rst, _) = ip.last_segment();
    assert!(rst.flags.rst());
    assert!(events.aborted.is_empty());
}

#[test]
fn peer_rst_aborts_connection() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents::default();
    let now = Instant::from_millis(0);

    let (key, _iss) = establish(&mut stack, &mut ip, &mut events, now, 1024, 65535, true);

    let rst = SegSpec {
        rst: true,
        ack: None,
        ..SegSpec::ack(TcpSeqNumber(1001), TcpSeqNumber(0), 0)
    };
    stack.receive(now, &mut ip, &mut events, rx_info(), &rst.build(&[]));

    assert_eq!(events.aborted, vec![key]);
    assert_eq!(stack.state_of(key), None);
}

#[test]
fn blind_rst_outside_window_gets_challenge_ack() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents::default();
    let now = Instant::from_millis(0);

    let (key, _iss) = establish(&mut stack, &mut ip, &mut events, now, 1024, 65535, true);

    // In-window but not exactly at rcv_nxt: challenge ACK instead of a teardown.
    let sent_before = ip.sent.len();
    let rst = SegSpec {
        rst: true,
        ack: None,
        ..SegSpec::ack(TcpSeqNumber(1005), TcpSeqNumber(0), 0)
    };
    stack.receive(now, &mut ip, &mut events, rx_info(), &rst.build(&[]));

    assert!(events.aborted.is_empty());
    assert_eq!(stack.state_of(key), Some(State::Established));
    assert_eq!(ip.sent.len(), sent_before + 1);
    let (challenge, _) = ip.last_segment();
    assert!(challenge.flags.ack() && !challenge.flags.rst());
}

#[test]
fn stray_segment_gets_rst_reply() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents::default();
    let now = Instant::from_millis(0);

    // An ACK to a port nobody listens on.
    let stray = SegSpec {
        src_port: 4444,
        dst_port: 5555,
        ..SegSpec::ack(TcpSeqNumber(777), TcpSeqNumber(888), 100)
    };
    stack.receive(now, &mut ip, &mut events, rx_info(), &stray.build(&[]));

    let (rst, _) = ip.last_segment();
    assert!(rst.flags.rst());
    assert_eq!(rst.seq_number, TcpSeqNumber(888));
    assert_eq!(rst.src_port, 5555);
    assert_eq!(rst.dst_port, 4444);

    // Without an ACK, the reply acknowledges the segment instead.
    let stray = SegSpec {
        src_port: 4444,
        dst_port: 5555,
        ack: None,
        fin: true,
        ..SegSpec::ack(TcpSeqNumber(777), TcpSeqNumber(0), 100)
    };
    stack.receive(now, &mut ip, &mut events, rx_info(), &stray.build(b"xx"));
    let (rst, _) = ip.last_segment();
    assert!(rst.flags.rst() && rst.flags.ack());
    assert_eq!(rst.seq_number, TcpSeqNumber(0));
    // Two data bytes plus the FIN.
    assert_eq!(rst.ack_number, Some(TcpSeqNumber(777 + 3)));
}

#[test]
fn missing_window_scale_disables_scaling() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents::default();
    let now = Instant::from_millis(0);

    // Peer omits the window scale option and announces a tiny window of 4.
    let (key, iss) = establish(&mut stack, &mut ip, &mut events, now, 1024, 4, false);

    assert_eq!(stack.send(now, &mut ip, key, b"0123456789"), 10);
    stack.push(now, &mut ip, key);
    stack.poll(now, &mut ip, &mut events);

    // Only four bytes fit: the window is taken unscaled.
    let (seg, payload) = ip.last_segment();
    assert_eq!(seg.seq_number, iss + 1);
    assert_eq!(payload, b"0123");
}

#[test]
fn connect_errors() {
    let mut stack = TcpStack::new(Storage::owned(1, 1), TcpConfig::default());
    let mut ip = MockIp::new();
    let mut events = TestEvents::default();
    let now = Instant::from_millis(0);

    let first = stack.connect(
        now, &mut ip, &mut events, REMOTE, 80,
        Slice::Owned(vec![0; 64]), Slice::Owned(vec![0; 64]));
    assert!(first.is_ok());

    // The single PCB is referenced; a second open must fail cleanly.
    let second = stack.connect(
        now, &mut ip, &mut events, REMOTE, 80,
        Slice::Owned(vec![0; 64]), Slice::Owned(vec![0; 64]));
    assert_eq!(second.err(), Some(Error::NoPcbAvail));
}

#[test]
fn send_error_schedules_retry() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents::default();
    let t0 = Instant::from_millis(0);

    let (key, _iss) = establish(&mut stack, &mut ip, &mut events, t0, 1024, 65535, true);

    // The first transmission attempt fails with a full device queue.
    ip.fail_next.push(Error::BufferFull);
    assert_eq!(stack.send(t0, &mut ip, key, b"retry me"), 8);
    stack.push(t0, &mut ip, key);
    let sent_before = ip.sent.len();
    stack.poll(t0, &mut ip, &mut events);
    assert_eq!(ip.sent.len(), sent_before);

    // Not yet at the retry backoff.
    stack.poll(t0 + Duration::from_millis(50), &mut ip, &mut events);
    assert_eq!(ip.sent.len(), sent_before);

    // At 100 ms the segment goes out.
    stack.poll(t0 + Duration::from_millis(100), &mut ip, &mut events);
    assert_eq!(ip.sent.len(), sent_before + 1);
    let (_, payload) = ip.last_segment();
    assert_eq!(payload, b"retry me");
}

#[test]
fn syn_rcvd_times_out() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents {
        accept_bufs: Some((64, 64)),
        ..TestEvents::default()
    };
    let t0 = Instant::from_millis(0);

    stack
        .listen(ListenParams {
            addr: Ipv4Address::UNSPECIFIED,
            port: 80,
            max_pcbs: 2,
            initial_rcv_wnd: 64,
        })
        .expect("listen");

    let syn = SegSpec {
        src_port: 40000,
        dst_port: 80,
        seq: TcpSeqNumber(5000),
        ack: None,
        syn: true,
        fin: false,
        rst: false,
        window: 4096,
        mss: Some(1400),
        wscale: None,
    };
    stack.receive(t0, &mut ip, &mut events, rx_info(), &syn.build(&[]));
    let syn_acks_before = ip.sent.len();

    // The handshake never completes; first the SYN-ACK is retransmitted...
    stack.poll(t0 + Duration::from_millis(1100), &mut ip, &mut events);
    assert!(ip.sent.len() > syn_acks_before);

    // ...then the 20 s timeout reaps the half-open PCB, silently.
    let sent_before = ip.sent.len();
    stack.poll(t0 + Duration::from_secs(21), &mut ip, &mut events);
    assert!(events.accepted.is_empty());
    for i in sent_before..ip.sent.len() {
        let (repr, _) = ip.segment(i);
        assert!(!repr.flags.rst());
    }
}

#[test]
fn listen_queue_dispatches_ready_connections() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let t0 = Instant::from_millis(0);

    let listener = stack
        .listen(ListenParams {
            addr: Ipv4Address::UNSPECIFIED,
            port: 80,
            max_pcbs: 4,
            initial_rcv_wnd: 64,
        })
        .expect("listen");

    let slots = vec![
        QueueSlot::new(Slice::Owned(vec![0; 64])),
        QueueSlot::new(Slice::Owned(vec![0; 64])),
    ];
    let mut events = TestEvents {
        queue: Some(ListenQueue::new(
            listener, Slice::Owned(slots), Duration::from_secs(5))),
        ..TestEvents::default()
    };

    // Handshake of a client.
    let syn = SegSpec {
        src_port: 40000,
        dst_port: 80,
        seq: TcpSeqNumber(5000),
        ack: None,
        syn: true,
        fin: false,
        rst: false,
        window: 4096,
        mss: Some(1400),
        wscale: None,
    };
    stack.receive(t0, &mut ip, &mut events, rx_info(), &syn.build(&[]));
    let (syn_ack, _) = ip.last_segment();
    let server_iss = syn_ack.seq_number;

    let hs_ack = SegSpec {
        src_port: 40000,
        dst_port: 80,
        ..SegSpec::ack(TcpSeqNumber(5001), server_iss + 1, 4096)
    };
    stack.receive(t0, &mut ip, &mut events, rx_info(), &hs_ack.build(&[]));

    // Accepted into the queue but not ready yet.
    assert!(!events.queue.as_ref().unwrap().has_ready());

    // First data makes the slot ready.
    let data = SegSpec {
        src_port: 40000,
        dst_port: 80,
        ..SegSpec::ack(TcpSeqNumber(5001), server_iss + 1, 4096)
    };
    stack.receive(t0, &mut ip, &mut events, rx_info(), &data.build(b"GET /"));
    assert!(events.queue.as_ref().unwrap().has_ready());

    // Dequeue: drain the initial data, then install a bigger buffer and recycle the ring.
    let key = events.queue.as_mut().unwrap().take_ready().expect("ready");
    let mut buf = [0u8; 16];
    assert_eq!(stack.recv(t0, &mut ip, key, &mut buf), 5);
    assert_eq!(&buf[..5], b"GET /");

    let old = stack
        .set_recv_buf(t0, &mut ip, key, Slice::Owned(vec![0; 512]))
        .expect("swap buffer");
    assert_eq!(old.len(), 64);
    events.queue.as_mut().unwrap().release_storage(old);

    // Further data lands in the new buffer.
    let more = SegSpec {
        src_port: 40000,
        dst_port: 80,
        ..SegSpec::ack(TcpSeqNumber(5006), server_iss + 1, 4096)
    };
    stack.receive(t0, &mut ip, &mut events, rx_info(), &more.build(b"!"));
    assert_eq!(stack.recv_available(key), 1);
}

#[test]
fn listen_queue_drops_empty_fin_connections() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let t0 = Instant::from_millis(0);

    let listener = stack
        .listen(ListenParams {
            addr: Ipv4Address::UNSPECIFIED,
            port: 80,
            max_pcbs: 4,
            initial_rcv_wnd: 64,
        })
        .expect("listen");

    let slots = vec![QueueSlot::new(Slice::Owned(vec![0; 64]))];
    let mut events = TestEvents {
        queue: Some(ListenQueue::new(
            listener, Slice::Owned(slots), Duration::from_secs(5))),
        ..TestEvents::default()
    };

    let syn = SegSpec {
        src_port: 40000,
        dst_port: 80,
        seq: TcpSeqNumber(5000),
        ack: None,
        syn: true,
        fin: false,
        rst: false,
        window: 4096,
        mss: Some(1400),
        wscale: None,
    };
    stack.receive(t0, &mut ip, &mut events, rx_info(), &syn.build(&[]));
    let (syn_ack, _) = ip.last_segment();
    let server_iss = syn_ack.seq_number;

    let hs_ack = SegSpec {
        src_port: 40000,
        dst_port: 80,
        ..SegSpec::ack(TcpSeqNumber(5001), server_iss + 1, 4096)
    };
    stack.receive(t0, &mut ip, &mut events, rx_info(), &hs_ack.build(&[]));

    // The client closes without ever sending data: the slot is recycled, nothing is ready.
    let fin = SegSpec {
        src_port: 40000,
        dst_port: 80,
        fin: true,
        ..SegSpec::ack(TcpSeqNumber(5001), server_iss + 1, 4096)
    };
    stack.receive(t0, &mut ip, &mut events, rx_info(), &fin.build(&[]));
    assert!(!events.queue.as_ref().unwrap().has_ready());

    // The slot serves a new connection right away.
    let syn2 = SegSpec {
        src_port: 40001,
        dst_port: 80,
        seq: TcpSeqNumber(9000),
        ack: None,
        syn: true,
        fin: false,
        rst: false,
        window: 4096,
        mss: Some(1400),
        wscale: None,
    };
    stack.receive(t0, &mut ip, &mut events, rx_info(), &syn2.build(&[]));
    let (syn_ack2, _) = ip.last_segment();
    let iss2 = syn_ack2.seq_number;
    let hs_ack2 = SegSpec {
        src_port: 40001,
        dst_port: 80,
        ..SegSpec::ack(TcpSeqNumber(9001), iss2 + 1, 4096)
    };
    stack.receive(t0, &mut ip, &mut events, rx_info(), &hs_ack2.build(&[]));
    let data = SegSpec {
        src_port: 40001,
        dst_port: 80,
        ..SegSpec::ack(TcpSeqNumber(9001), iss2 + 1, 4096)
    };
    stack.receive(t0, &mut ip, &mut events, rx_info(), &data.build(b"hi"));
    assert!(events.queue.as_ref().unwrap().has_ready());
}

#[test]
fn pmtu_decrease_shrinks_segments() {
    let mut stack = stack();
    let mut ip = MockIp::new();
    let mut events = TestEvents::default();
    let now = Instant::from_millis(0);

    let (key, iss) = establish(&mut stack, &mut ip, &mut events, now, 4096, 65535, true);

    // The path MTU drops to 600; the quoted sequence matches the queue head, so the stack
    // retransmits immediately with the reduced segment size.
    assert_eq!(stack.send(now, &mut ip, key, &vec![7u8; 1460]), 1460);
    stack.push(now, &mut ip, key);
    stack.poll(now, &mut ip, &mut events);
    let (first, _) = ip.last_segment();
    assert_eq!(first.payload_len, 1460);

    ip.pmtu = 600;
    let sent_before = ip.sent.len();
    stack.pmtu_changed(now, &mut ip, REMOTE, Some(iss + 1));

    // The head is rebuilt at the reduced segment size; the rest follows in kind.
    assert!(ip.sent.len() > sent_before);
    let (resent, _) = ip.segment(sent_before);
    assert_eq!(resent.seq_number, iss + 1);
    assert_eq!(resent.payload_len, 600 - 40);
}
