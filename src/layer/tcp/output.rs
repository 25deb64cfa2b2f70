//! Output engine, retransmission and congestion control.
//!
//! `pcb_output` runs in two regimes. The normal one transmits queued data as the windows
//! permit and manages the retransmission timer. The rtx-or-probe one sends exactly one segment
//! from the head of the send queue, honors only the peer window and forces at least one
//! sequence count; it serves retransmission, fast retransmit and zero-window probing alike.
//!
//! Congestion control is Reno with NewReno-style recovery (RFC 5681): slow start, congestion
//! avoidance with an ACK accumulator, fast retransmit on the third duplicate ACK, recovery
//! deflation on the cumulative ACK covering `recover`, and a cwnd reset after idle periods.
use crate::layer::ip::{Error, Ip4Tx, Result, RetryToken, SendFlags, SendMeta};
use crate::time::{Duration, Instant};
use crate::wire::ip::checksum::Accumulator;
use crate::wire::{
    IpProtocol, TcpFlags, TcpRepr, TcpSeqNumber, tcp_packet,
    TCP_HEADER_LEN,
};

use super::endpoint::TcpStack;
use super::input;
use super::pcb::{Pcb, PcbFlags, PcbKey, State, Timer};
use super::RttMillis;

pub(crate) fn rto_duration(rto: RttMillis) -> Duration {
    Duration::from_millis(u64::from(rto))
}

/// Check if our FIN has been ACKed.
pub(crate) fn pcb_fin_acked(pcb: &Pcb) -> bool {
    pcb.has_flag(PcbFlags::FIN_SENT) && pcb.snd_una == pcb.snd_nxt
}

/// Check if there is any unacknowledged or unsent data or FIN.
pub(crate) fn pcb_has_snd_outstanding(stack: &TcpStack, idx: usize) -> bool {
    let pcb = &stack.pcbs[idx];
    debug_assert!(pcb.state.can_output());

    // Once sending is closed, a FIN is outstanding until acked.
    if !pcb.state.is_snd_open() {
        return true;
    }

    // While sending is open the connection variables must still exist.
    match pcb.con() {
        Some(vars) => vars.snd_buf.queued() > 0,
        None => false,
    }
}

/// Check for data or FIN that is no longer queued for sending but not yet ACKed.
///
/// Not the same as `snd_una != snd_nxt` because a retransmission timeout requeues everything.
pub(crate) fn pcb_has_snd_unacked(stack: &TcpStack, idx: usize) -> bool {
    let pcb = &stack.pcbs[idx];
    debug_assert!(pcb.state.can_output());

    let sent_unacked = pcb.con()
        .map(|vars| vars.snd_buf.sent_offset() > 0)
        .unwrap_or(false);
    sent_unacked
        || (!pcb.state.is_snd_open() && !pcb.has_flag(PcbFlags::FIN_PENDING))
}

/// Send a SYN or SYN-ACK (in the SYN_SENT or SYN_RCVD states respectively).
pub(crate) fn pcb_send_syn(
    stack: &mut TcpStack,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    idx: usize,
) {
    debug_assert!(stack.pcbs[idx].state.is_syn_sent_or_rcvd());

    let (key, seq, ack, window, mss, wscale) = {
        let pcb = &stack.pcbs[idx];

        // The interface MSS is parked in a differently-used field per state.
        let mss = if pcb.state == State::SynSent {
            pcb.base_snd_mss
        } else {
            pcb.snd_mss
        };

        let wscale = if pcb.has_flag(PcbFlags::WND_SCALE) {
            Some(pcb.rcv_wnd_shift)
        } else {
            None
        };

        // SYN and SYN-ACK always carry a non-scaled window.
        debug_assert!(pcb.rcv_ann_wnd <= u32::from(u16::max_value()));
        let window = pcb.rcv_ann_wnd as u16;

        let ack = if pcb.state == State::SynRcvd {
            Some(pcb.rcv_nxt)
        } else {
            None
        };

        (pcb.key, pcb.snd_una, ack, window, mss, wscale)
    };

    let mut flags = TcpFlags::default();
    flags.set_syn(true);

    let err = send_tcp_nodata(
        stack, ip, &key, seq, ack, window, flags, Some(mss), wscale, Some(idx));

    if err.is_ok() {
        if stack.pcbs[idx].snd_nxt == stack.pcbs[idx].snd_una {
            // First transmission: measure the handshake round trip.
            pcb_start_rtt_measurement(stack, now, idx, true);
            let pcb = &mut stack.pcbs[idx];
            pcb.snd_nxt = pcb.snd_nxt + 1usize;
        } else {
            // Retransmission spoils any running measurement.
            stack.pcbs[idx].clear_flag(PcbFlags::RTT_PENDING);
        }
    }
}

/// Send an empty ACK (which may be a window update).
pub(crate) fn pcb_send_empty_ack(stack: &mut TcpStack, ip: &mut dyn Ip4Tx, idx: usize) {
    let window = input::pcb_ann_wnd(stack, idx);
    let (key, seq, ack) = {
        let pcb = &stack.pcbs[idx];
        (pcb.key, pcb.snd_nxt, pcb.rcv_nxt)
    };
    let _ = send_tcp_nodata(
        stack, ip, &key, seq, Some(ack), window,
        TcpFlags::default(), None, None, Some(idx));
}

impl<'a> TcpStack<'a> {
    /// Send an RST for this PCB.
    pub(crate) fn pcb_send_rst(&mut self, ip: &mut dyn Ip4Tx, idx: usize) {
        let (key, seq, ack) = {
            let pcb = &self.pcbs[idx];
            let ack = if pcb.state == State::SynSent { None } else { Some(pcb.rcv_nxt) };
            (pcb.key, pcb.snd_nxt, ack)
        };
        send_rst(self, ip, &key, seq, ack);
    }

    /// Consume a path-MTU update towards `remote` and recompute affected send MSS values.
    ///
    /// `icmp_seq` is the send sequence number quoted by an ICMP fragmentation-needed message,
    /// when one triggered the update; a match against the first unacknowledged byte prompts an
    /// immediate retransmission.
    pub fn pmtu_changed(
        &mut self,
        now: Instant,
        ip: &mut dyn Ip4Tx,
        remote: crate::wire::Ipv4Address,
        icmp_seq: Option<TcpSeqNumber>,
    ) {
        let pmtu = ip.pmtu(remote);

        for idx in 0..self.pcbs.len() {
            if self.pcbs[idx].key.remote_addr != remote {
                continue;
            }
            match self.pcbs[idx].state {
                State::Closed | State::SynRcvd | State::TimeWait => continue,
                _ => {}
            }
            if self.pcbs[idx].con().is_none() {
                continue;
            }

            pcb_pmtu_changed(self, idx, pmtu);

            // Retransmit when the quoted sequence is exactly the head of the queue and the
            // window permits sending; the lost oversized segment is rebuilt with the new MSS.
            let retransmit = icmp_seq == Some(self.pcbs[idx].snd_una)
                && self.pcbs[idx].state.can_output()
                && pcb_has_snd_unacked(self, idx)
                && self.pcbs[idx].con().map(|vars| vars.snd_wnd > 0).unwrap_or(false);
            if retransmit {
                pcb_requeue_everything(self, idx);
                pcb_output(self, now, ip, idx, false);
            }
        }
    }
}

/// Force an ACK: immediately, or folded into the current input processing.
pub(crate) fn pcb_need_ack(stack: &mut TcpStack, ip: &mut dyn Ip4Tx, idx: usize) {
    debug_assert!(stack.pcbs[idx].state != State::Closed);

    if stack.current_pcb == Some(idx) {
        stack.pcbs[idx].set_flag(PcbFlags::ACK_PENDING);
    } else {
        pcb_send_empty_ack(stack, ip, idx);
    }
}

/// The user queued new data.
pub(crate) fn pcb_snd_buf_extended(stack: &mut TcpStack, now: Instant, idx: usize) {
    debug_assert!(stack.pcbs[idx].state.is_snd_open());
    debug_assert!(pcb_has_snd_outstanding(stack, idx));
    pcb_set_output_timer_for_output(stack, now, idx);
}

/// Close the sending side: state transition and FIN queueing.
pub(crate) fn pcb_end_sending(stack: &mut TcpStack, now: Instant, idx: usize) {
    debug_assert!(stack.pcbs[idx].state.is_snd_open());
    // Closing the send side pushes out everything still queued.
    debug_assert!(stack.pcbs[idx].con()
        .map(|vars| vars.snd_buf.psh_index() == vars.snd_buf.queued())
        .unwrap_or(true));

    let pcb = &mut stack.pcbs[idx];
    pcb.state = match pcb.state {
        State::Established => State::FinWait1,
        _ => {
            debug_assert_eq!(pcb.state, State::CloseWait);
            State::LastAck
        }
    };
    pcb.set_flag(PcbFlags::FIN_PENDING);

    pcb_push_output(stack, now, idx);
}

/// Schedule a run of the output engine soon.
pub(crate) fn pcb_push_output(stack: &mut TcpStack, now: Instant, idx: usize) {
    debug_assert!(stack.pcbs[idx].state.can_output());
    debug_assert!(pcb_has_snd_outstanding(stack, idx));

    if stack.current_pcb == Some(idx) {
        stack.pcbs[idx].set_flag(PcbFlags::OUT_PENDING);
    } else {
        pcb_set_output_timer_for_output(stack, now, idx);
    }
}

fn pcb_set_output_timer_for_output(stack: &mut TcpStack, now: Instant, idx: usize) {
    let pcb = &mut stack.pcbs[idx];

    // A pending retry deadline may be far out; the fresh data takes precedence.
    if pcb.flags.has_and_clear(PcbFlags::OUT_RETRY) {
        pcb.timers.unset(Timer::Output);
    }

    if !pcb.timers.is_set(Timer::Output) {
        pcb.timers.set(Timer::Output, now + super::OUTPUT_TIMER_DELAY);
    }
}

fn pcb_set_output_timer_for_retry(stack: &mut TcpStack, now: Instant, idx: usize, err: Error) {
    let after = if err == Error::BufferFull {
        super::OUTPUT_RETRY_FULL
    } else {
        super::OUTPUT_RETRY_OTHER
    };
    let pcb = &mut stack.pcbs[idx];
    pcb.timers.set(Timer::Output, now + after);
    pcb.set_flag(PcbFlags::OUT_RETRY);
}

/// Transmit segments.
///
/// With `rtx_or_probe` unset, sends queued data as the windows permit and keeps the rtx timer
/// consistent. With it set, sends exactly one segment from the head of the send queue without
/// advancing the queue position, honoring only the peer window and forcing at least one
/// sequence count.
pub(crate) fn pcb_output(
    stack: &mut TcpStack,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    idx: usize,
    rtx_or_probe: bool,
) {
    debug_assert!(stack.pcbs[idx].state.can_output());
    debug_assert!(pcb_has_snd_outstanding(stack, idx));

    let (mut rem_wnd, data_threshold, mut fin) = {
        let pcb = &stack.pcbs[idx];
        let vars = match pcb.con() {
            Some(vars) => vars,
            None => return,
        };

        if rtx_or_probe {
            // Ignore the congestion window but send at least one count.
            (vars.snd_wnd.max(1), 0usize, !pcb.state.is_snd_open())
        } else {
            debug_assert!(vars.cwnd >= u32::from(pcb.snd_mss));

            let full_wnd = vars.snd_wnd.min(vars.cwnd);
            let snd_offset = vars.snd_buf.sent_offset() as u32;
            let rem_wnd = full_wnd.saturating_sub(snd_offset);

            // Delay sending only when everything left is below one MSS and none of it is
            // being pushed.
            let psh_to_end = vars.snd_buf.queued() - vars.snd_buf.psh_index();
            let threshold = psh_to_end.min(usize::from(pcb.snd_mss) - 1);

            (rem_wnd, threshold, pcb.has_flag(PcbFlags::FIN_PENDING))
        }
    };

    // The helper computes the header-side checksum once for the whole batch.
    let mut batch = SegmentBatch::new();

    loop {
        let pending = {
            let vars = match stack.pcbs[idx].con() {
                Some(vars) => vars,
                None => return,
            };
            if rtx_or_probe { vars.snd_buf.queued() } else { vars.snd_buf.unsent() }
        };
        if !(pending > data_threshold || fin) || rem_wnd == 0 {
            break;
        }

        let offset = if rtx_or_probe {
            0
        } else {
            stack.pcbs[idx].con().map(|vars| vars.snd_buf.sent_offset()).unwrap_or(0)
        };

        match pcb_output_segment(stack, now, ip, idx, &mut batch, offset, fin, rem_wnd) {
            Err(err) => {
                // A send that exceeds the interface MTU means the path estimate is stale;
                // clamp it. No immediate retransmit, the retry timer covers it.
                if err == Error::FragNeeded {
                    let remote = stack.pcbs[idx].key.remote_addr;
                    ip.handle_local_packet_too_big(remote);
                    let pmtu = ip.pmtu(remote);
                    apply_pmtu_to_peer(stack, remote, pmtu);
                }

                if rtx_or_probe {
                    return;
                }

                pcb_set_output_timer_for_retry(stack, now, idx, err);
                break;
            }
            Ok((data_len, fin_sent)) => {
                if rtx_or_probe {
                    return;
                }

                if fin_sent {
                    debug_assert!(stack.pcbs[idx].has_flag(PcbFlags::FIN_PENDING));
                    stack.pcbs[idx].clear_flag(PcbFlags::FIN_PENDING);
                    fin = false;
                }

                if data_len > 0 {
                    if let Some(vars) = stack.pcbs[idx].con_mut() {
                        vars.snd_buf.mark_sent(data_len);
                    }
                }

                rem_wnd -= (data_len as u32) + u32::from(fin_sent);

                // Whatever went out carried the ACK already.
                stack.pcbs[idx].clear_flag(PcbFlags::ACK_PENDING);
            }
        }
    }

    // Data transmission supersedes any idle timeout.
    if stack.pcbs[idx].has_and_clear_flag(PcbFlags::IDLE_TIMER) {
        stack.pcbs[idx].timers.unset(Timer::Rtx);
    }

    // Leave a running retransmission timer alone; otherwise arm it when sent data awaits
    // acknowledgement, or when a zero window calls for probing.
    if !stack.pcbs[idx].timers.is_set(Timer::Rtx) {
        let zero_wnd = stack.pcbs[idx].con()
            .map(|vars| vars.snd_wnd == 0)
            .unwrap_or(false);
        if pcb_has_snd_unacked(stack, idx) || zero_wnd {
            let rto = rto_duration(stack.pcbs[idx].rto);
            stack.pcbs[idx].timers.set(Timer::Rtx, now + rto);
        }
    }
}

pub(crate) fn pcb_output_timer_handler(
    stack: &mut TcpStack,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    idx: usize,
) {
    // The timer is only armed in states that can output; a state exit unsets it.
    if stack.pcbs[idx].state.can_output() && pcb_has_snd_outstanding(stack, idx) {
        pcb_output(stack, now, ip, idx, false);
    }
}

pub(crate) fn pcb_rtx_timer_handler(
    stack: &mut TcpStack,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    idx: usize,
) {
    debug_assert!(stack.pcbs[idx].state.is_syn_sent_or_rcvd()
        || stack.pcbs[idx].state.can_output());

    // An idle timeout rather than a retransmission?
    if stack.pcbs[idx].has_and_clear_flag(PcbFlags::IDLE_TIMER) {
        // The connection was idle for a full timeout: restart from the initial window
        // (RFC 5681 section 4.1). The accumulator is reset so stale progress cannot cause
        // an increase later.
        let snd_mss = stack.pcbs[idx].snd_mss;
        let initial = super::initial_cwnd(snd_mss);
        let mut make_init = false;
        if let Some(vars) = stack.pcbs[idx].con_mut() {
            if vars.cwnd >= initial {
                vars.cwnd = initial;
                make_init = true;
            }
            vars.cwnd_acked = 0;
        }
        if make_init {
            stack.pcbs[idx].set_flag(PcbFlags::CWND_INIT);
        }
        return;
    }

    let syn_sent_rcvd = stack.pcbs[idx].state.is_syn_sent_or_rcvd();
    debug_assert!(syn_sent_rcvd || pcb_has_snd_outstanding(stack, idx));

    // Spurious expiration after the timer stopped being needed (nothing unacked and a open
    // window): return without re-arming.
    if !syn_sent_rcvd && !pcb_has_snd_unacked(stack, idx) {
        let nonzero_wnd = stack.pcbs[idx].con()
            .map(|vars| vars.snd_wnd != 0)
            .unwrap_or(true);
        if nonzero_wnd {
            return;
        }
    }

    // Exponential backoff, then restart the timer.
    {
        let pcb = &mut stack.pcbs[idx];
        pcb.rto = pcb.rto.saturating_mul(2).min(super::MAX_RTX_TIME);
        let rto = rto_duration(pcb.rto);
        pcb.timers.set(Timer::Rtx, now + rto);
    }

    // In the handshake states only the SYN or SYN-ACK is retransmitted.
    if syn_sent_rcvd {
        pcb_send_syn(stack, now, ip, idx);
        return;
    }

    let zero_wnd = stack.pcbs[idx].con()
        .map(|vars| vars.snd_wnd == 0)
        .unwrap_or(true);
    if zero_wnd {
        // Zero window probe.
        pcb_output(stack, now, ip, idx, true);
        return;
    }

    // A data or FIN retransmission.

    // ssthresh is updated only for the first retransmission of a flight (RFC 5681).
    if !stack.pcbs[idx].has_flag(PcbFlags::RTX_ACTIVE) {
        stack.pcbs[idx].set_flag(PcbFlags::RTX_ACTIVE);
        pcb_update_ssthresh_for_rtx(stack, idx);
    }

    // Restart from one segment; reset the accumulator so stale progress is forgotten.
    let snd_mss = stack.pcbs[idx].snd_mss;
    let snd_nxt = stack.pcbs[idx].snd_nxt;
    if let Some(vars) = stack.pcbs[idx].con_mut() {
        vars.cwnd = u32::from(snd_mss);
        vars.cwnd_acked = 0;
        vars.recover = snd_nxt;
    }
    stack.pcbs[idx].clear_flag(PcbFlags::CWND_INIT);
    stack.pcbs[idx].set_flag(PcbFlags::RECOVER);

    // Exit any fast recovery.
    stack.pcbs[idx].num_dupack = 0;

    pcb_requeue_everything(stack, idx);

    pcb_output(stack, now, ip, idx, false);
}

pub(crate) fn pcb_requeue_everything(stack: &mut TcpStack, idx: usize) {
    debug_assert!(stack.pcbs[idx].state.can_output());

    if let Some(vars) = stack.pcbs[idx].con_mut() {
        vars.snd_buf.requeue();
    }

    // Requeue any FIN.
    if !stack.pcbs[idx].state.is_snd_open() {
        stack.pcbs[idx].set_flag(PcbFlags::FIN_PENDING);
    }
}

/// Congestion control and RTT processing for a new cumulative ACK.
///
/// Called before the ACK is applied to `snd_una` and the buffers.
pub(crate) fn pcb_output_handle_acked(
    stack: &mut TcpStack,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    idx: usize,
    ack_num: TcpSeqNumber,
    acked: u32,
) {
    debug_assert!(stack.pcbs[idx].state.can_output());
    debug_assert!(pcb_has_snd_outstanding(stack, idx));

    // Whatever was retransmitted has now been acked.
    stack.pcbs[idx].clear_flag(PcbFlags::RTX_ACTIVE);

    // Complete a round-trip measurement that this ACK passes.
    if stack.pcbs[idx].has_flag(PcbFlags::RTT_PENDING) {
        let passed = stack.pcbs[idx].con()
            .map(|vars| vars.rtt_test_seq < ack_num)
            .unwrap_or(false);
        if passed {
            pcb_end_rtt_measurement(stack, now, idx);
            // Allow the next congestion-avoidance increase.
            stack.pcbs[idx].clear_flag(PcbFlags::CWND_INCRD);
        }
    }

    let num_dupack = stack.pcbs[idx].num_dupack;
    if stack.pcbs[idx].con().is_none() {
        stack.pcbs[idx].num_dupack = 0;
    } else if num_dupack < super::FAST_RTX_DUP_ACKS {
        // Not in fast recovery.
        stack.pcbs[idx].num_dupack = 0;

        let (cwnd, ssthresh, incrd) = {
            let pcb = &stack.pcbs[idx];
            let vars = pcb.con().expect("checked above");
            (vars.cwnd, vars.ssthresh, pcb.has_flag(PcbFlags::CWND_INCRD))
        };

        if cwnd <= ssthresh {
            // Slow start.
            pcb_increase_cwnd_acked(stack, idx, acked);
        } else if !incrd {
            // Congestion avoidance: accumulate, and once a full cwnd of data has been
            // acked, increase by one MSS and wait for the next RTT sample.
            let reached = {
                let vars = stack.pcbs[idx].con_mut().expect("checked above");
                vars.cwnd_acked = vars.cwnd_acked.saturating_add(acked);
                vars.cwnd_acked >= vars.cwnd
            };
            if reached {
                let accumulated = stack.pcbs[idx].con()
                    .map(|vars| vars.cwnd_acked)
                    .unwrap_or(0);
                pcb_increase_cwnd_acked(stack, idx, accumulated);
                if let Some(vars) = stack.pcbs[idx].con_mut() {
                    vars.cwnd_acked = 0;
                }
                stack.pcbs[idx].set_flag(PcbFlags::CWND_INCRD);
            }
        }
    } else {
        // In fast recovery; unacked data necessarily exists.
        debug_assert!(pcb_has_snd_unacked(stack, idx));

        let exits_recovery = !stack.pcbs[idx].has_flag(PcbFlags::RECOVER)
            || !stack.pcbs[idx].con()
                .map(|vars| ack_num < vars.recover)
                .unwrap_or(false);

        if exits_recovery {
            // Deflate the window; cwnd >= snd_mss holds because ssthresh >= snd_mss.
            let pcb = &stack.pcbs[idx];
            let flight = pcb.snd_nxt.since(ack_num);
            let snd_mss = u32::from(pcb.snd_mss);
            if let Some(vars) = stack.pcbs[idx].con_mut() {
                debug_assert!(vars.ssthresh >= snd_mss);
                vars.cwnd = vars.ssthresh.min(snd_mss + flight.max(snd_mss));
            }
            stack.pcbs[idx].num_dupack = 0;
        } else {
            // A partial ACK: retransmit the next segment and deflate by the acked amount,
            // re-inflating one MSS for a full segment's worth of progress.
            pcb_output(stack, now, ip, idx, true);

            let snd_mss = u32::from(stack.pcbs[idx].snd_mss);
            if let Some(vars) = stack.pcbs[idx].con_mut() {
                debug_assert!(vars.cwnd >= snd_mss);
                vars.cwnd -= acked.min(vars.cwnd - snd_mss);
                if acked >= snd_mss {
                    vars.cwnd = vars.cwnd.saturating_add(snd_mss);
                }
            }
        }
    }

    // If this ACK leaves `recover` behind the new snd_una, the variable loses meaning.
    if stack.pcbs[idx].has_flag(PcbFlags::RECOVER) {
        let behind = stack.pcbs[idx].con()
            .map(|vars| vars.recover < ack_num)
            .unwrap_or(true);
        if behind {
            stack.pcbs[idx].clear_flag(PcbFlags::RECOVER);
        }
    }
}

/// The duplicate ACK count just reached the fast retransmit threshold.
pub(crate) fn pcb_fast_rtx_dup_acks_received(
    stack: &mut TcpStack,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    idx: usize,
) {
    debug_assert!(stack.pcbs[idx].state.can_output());
    debug_assert!(pcb_has_snd_unacked(stack, idx));
    debug_assert_eq!(stack.pcbs[idx].num_dupack, super::FAST_RTX_DUP_ACKS);

    // With a valid recover at or past snd_nxt we must not restart recovery; back out one
    // count so the next duplicate ACK remains a candidate.
    if stack.pcbs[idx].has_flag(PcbFlags::RECOVER) {
        stack.pcbs[idx].num_dupack -= 1;
        return;
    }

    // Retransmit the head segment.
    pcb_output(stack, now, ip, idx, true);

    let snd_nxt = stack.pcbs[idx].snd_nxt;
    if stack.pcbs[idx].con().is_some() {
        stack.pcbs[idx].set_flag(PcbFlags::RECOVER);
        if let Some(vars) = stack.pcbs[idx].con_mut() {
            vars.recover = snd_nxt;
        }

        pcb_update_ssthresh_for_rtx(stack, idx);

        let snd_mss = u32::from(stack.pcbs[idx].snd_mss);
        if let Some(vars) = stack.pcbs[idx].con_mut() {
            vars.cwnd = vars.ssthresh.saturating_add(3 * snd_mss);
        }
        stack.pcbs[idx].clear_flag(PcbFlags::CWND_INIT);

        // The inflated window may allow sending more.
        stack.pcbs[idx].set_flag(PcbFlags::OUT_PENDING);
    }
}

/// A further duplicate ACK arrived while already in fast recovery.
pub(crate) fn pcb_extra_dup_ack_received(stack: &mut TcpStack, idx: usize) {
    debug_assert!(stack.pcbs[idx].state.can_output());
    debug_assert!(pcb_has_snd_unacked(stack, idx));
    debug_assert!(stack.pcbs[idx].num_dupack > super::FAST_RTX_DUP_ACKS);

    let snd_mss = u32::from(stack.pcbs[idx].snd_mss);
    if let Some(vars) = stack.pcbs[idx].con_mut() {
        vars.cwnd = vars.cwnd.saturating_add(snd_mss);
    }
    stack.pcbs[idx].set_flag(PcbFlags::OUT_PENDING);
}

fn pcb_increase_cwnd_acked(stack: &mut TcpStack, idx: usize, acked: u32) {
    let snd_mss = u32::from(stack.pcbs[idx].snd_mss);
    if let Some(vars) = stack.pcbs[idx].con_mut() {
        vars.cwnd = vars.cwnd.saturating_add(acked.min(snd_mss));
    }
    stack.pcbs[idx].clear_flag(PcbFlags::CWND_INIT);
}

/// Set ssthresh according to RFC 5681 equation (4).
fn pcb_update_ssthresh_for_rtx(stack: &mut TcpStack, idx: usize) {
    let pcb = &stack.pcbs[idx];
    let half_flight = pcb.snd_nxt.since(pcb.snd_una) / 2;
    let two_smss = 2 * u32::from(pcb.snd_mss);
    if let Some(vars) = stack.pcbs[idx].con_mut() {
        vars.ssthresh = half_flight.max(two_smss);
    }
}

pub(crate) fn pcb_start_rtt_measurement(
    stack: &mut TcpStack,
    now: Instant,
    idx: usize,
    syn: bool,
) {
    let pcb = &mut stack.pcbs[idx];
    pcb.set_flag(PcbFlags::RTT_PENDING);
    pcb.rtt_test_time = now;

    if !syn {
        let snd_nxt = pcb.snd_nxt;
        if let Some(vars) = stack.pcbs[idx].con_mut() {
            vars.rtt_test_seq = snd_nxt;
        }
    }
}

pub(crate) fn pcb_end_rtt_measurement(stack: &mut TcpStack, now: Instant, idx: usize) {
    debug_assert!(stack.pcbs[idx].has_flag(PcbFlags::RTT_PENDING));
    stack.pcbs[idx].clear_flag(PcbFlags::RTT_PENDING);

    let elapsed = now - stack.pcbs[idx].rtt_test_time;
    let this_rtt = elapsed.as_millis().min(u128::from(RttMillis::max_value())) as RttMillis;

    let first_sample = !stack.pcbs[idx].has_flag(PcbFlags::RTT_VALID);
    stack.pcbs[idx].set_flag(PcbFlags::RTT_VALID);

    let (srtt, rttvar) = match stack.pcbs[idx].con_mut() {
        Some(vars) => {
            if first_sample {
                vars.rttvar = this_rtt / 2;
                vars.srtt = this_rtt;
            } else {
                let rtt_diff = if vars.srtt > this_rtt {
                    vars.srtt - this_rtt
                } else {
                    this_rtt - vars.srtt
                };
                vars.rttvar =
                    ((3 * u32::from(vars.rttvar) + u32::from(rtt_diff)) / 4) as RttMillis;
                vars.srtt =
                    ((7 * u32::from(vars.srtt) + u32::from(this_rtt)) / 8) as RttMillis;
            }
            (vars.srtt, vars.rttvar)
        }
        None => return,
    };

    // RFC 6298: RTO = SRTT + max(G, 4*RTTVAR), bounded into the permitted range.
    let var_part = rttvar.saturating_mul(4).max(1);
    let base_rto = srtt.saturating_add(var_part);
    stack.pcbs[idx].rto = base_rto.max(super::MIN_RTX_TIME).min(super::MAX_RTX_TIME);
}

/// A send blocked on link resolution is now expected to succeed.
pub(crate) fn pcb_send_retry(
    stack: &mut TcpStack,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    idx: usize,
) {
    match stack.pcbs[idx].state {
        State::Closed => {}
        State::SynSent | State::SynRcvd => pcb_send_syn(stack, now, ip, idx),
        state if state.can_output() && pcb_has_snd_outstanding(stack, idx) => {
            pcb_output(stack, now, ip, idx, false);
        }
        _ => {}
    }
}

/// Calculate the effective send MSS from a path MTU.
pub(crate) fn calc_snd_mss_from_pmtu(base_snd_mss: u16, pmtu: u16) -> u16 {
    debug_assert!(pmtu >= crate::wire::IPV4_MIN_MTU as u16);

    let mtu_mss = pmtu - crate::wire::IPV4_TCP_HEADER_LEN as u16;
    let snd_mss = base_snd_mss.min(mtu_mss);

    // The result cannot fall below the minimum: base_snd_mss was validated against it, and
    // mtu_mss cannot be less since MIN_ALLOWED_MSS is defined from the minimum MTU.
    debug_assert!(snd_mss >= super::MIN_ALLOWED_MSS);
    snd_mss
}

/// Apply a changed path MTU to one PCB.
///
/// Must not transmit from here: the notification can originate inside the output path and
/// sending would recurse into another notification. Scheduling is left to the output timer.
pub(crate) fn pcb_pmtu_changed(stack: &mut TcpStack, idx: usize, pmtu: u16) {
    debug_assert!(!matches!(
        stack.pcbs[idx].state,
        State::Closed | State::SynRcvd | State::TimeWait));
    debug_assert!(stack.pcbs[idx].con().is_some());

    // While connecting, the estimate is simply parked in snd_mss.
    if stack.pcbs[idx].state == State::SynSent {
        stack.pcbs[idx].snd_mss = pmtu;
        return;
    }

    if !stack.pcbs[idx].state.can_output() {
        return;
    }

    let new_snd_mss = calc_snd_mss_from_pmtu(stack.pcbs[idx].base_snd_mss, pmtu);
    if new_snd_mss == stack.pcbs[idx].snd_mss {
        return;
    }
    stack.pcbs[idx].snd_mss = new_snd_mss;

    let snd_mss = u32::from(new_snd_mss);
    let cwnd_init = stack.pcbs[idx].has_flag(PcbFlags::CWND_INIT);
    let rtx_active = stack.pcbs[idx].has_flag(PcbFlags::RTX_ACTIVE);
    if let Some(vars) = stack.pcbs[idx].con_mut() {
        // ssthresh must not fall below the segment size.
        if vars.ssthresh < snd_mss {
            vars.ssthresh = snd_mss;
        }

        if cwnd_init {
            // Recalculate the initial window (RFC 5681 page 5).
            vars.cwnd = super::initial_cwnd(new_snd_mss);
        } else if vars.cwnd < snd_mss || rtx_active {
            // Keep cwnd at least one segment; after an un-acked retransmission it was set
            // to exactly one segment, which the new size restores.
            vars.cwnd = snd_mss;
        }
    }
}

fn apply_pmtu_to_peer(stack: &mut TcpStack, remote: crate::wire::Ipv4Address, pmtu: u16) {
    for idx in 0..stack.pcbs.len() {
        if stack.pcbs[idx].key.remote_addr != remote {
            continue;
        }
        match stack.pcbs[idx].state {
            State::Closed | State::SynRcvd | State::TimeWait => continue,
            _ => {}
        }
        if stack.pcbs[idx].con().is_none() {
            continue;
        }
        pcb_pmtu_changed(stack, idx, pmtu);
    }
}

/// Update snd_wnd to a freshly received value.
pub(crate) fn pcb_update_snd_wnd(stack: &mut TcpStack, idx: usize, new_snd_wnd: u32) {
    debug_assert!(!matches!(
        stack.pcbs[idx].state,
        State::Closed | State::SynSent | State::SynRcvd));
    // With a maximum shift of 14, a window of MAX_WINDOW or more cannot be reported.
    debug_assert!(new_snd_wnd <= super::MAX_WINDOW);

    if !stack.pcbs[idx].state.can_output() {
        return;
    }

    let old_snd_wnd = match stack.pcbs[idx].con() {
        Some(vars) => vars.snd_wnd,
        None => return,
    };
    if new_snd_wnd == old_snd_wnd {
        return;
    }

    if let Some(vars) = stack.pcbs[idx].con_mut() {
        vars.snd_wnd = new_snd_wnd;
    }

    if pcb_has_snd_outstanding(stack, idx) {
        // More may become sendable, or (rarely) probing must start.
        stack.pcbs[idx].set_flag(PcbFlags::OUT_PENDING);

        // On a zero/nonzero window transition the armed rtx timer may be for the wrong kind
        // of event (retransmission vs probe); drop it, output will re-arm as appropriate.
        if (new_snd_wnd == 0) != (old_snd_wnd == 0) {
            stack.pcbs[idx].timers.unset(Timer::Rtx);
        }
    }
}

/// Send an RST as a reply to a received segment, per RFC 793 rules for segments that belong
/// to no connection.
pub(crate) fn send_rst_reply(
    stack: &mut TcpStack,
    ip: &mut dyn Ip4Tx,
    key: &PcbKey,
    repr: &TcpRepr,
    data_len: usize,
) {
    let (seq, ack) = match repr.ack_number {
        Some(ack_num) => (ack_num, None),
        None => {
            let seqlen = data_len + repr.flags.sequence_len();
            (TcpSeqNumber(0), Some(repr.seq_number + seqlen))
        }
    };
    send_rst(stack, ip, key, seq, ack);
}

pub(crate) fn send_rst(
    stack: &mut TcpStack,
    ip: &mut dyn Ip4Tx,
    key: &PcbKey,
    seq_num: TcpSeqNumber,
    ack_num: Option<TcpSeqNumber>,
) {
    let mut flags = TcpFlags::default();
    flags.set_rst(true);
    let _ = send_tcp_nodata(stack, ip, key, seq_num, ack_num, 0, flags, None, None, None);
}

/// Emit a segment without payload: SYN, SYN-ACK, RST, or an empty ACK.
#[allow(clippy::too_many_arguments)]
fn send_tcp_nodata(
    stack: &mut TcpStack,
    ip: &mut dyn Ip4Tx,
    key: &PcbKey,
    seq_num: TcpSeqNumber,
    ack_num: Option<TcpSeqNumber>,
    window: u16,
    flags: TcpFlags,
    mss: Option<u16>,
    wscale: Option<u8>,
    retry_idx: Option<usize>,
) -> Result<()> {
    let repr = TcpRepr {
        src_port: key.local_port,
        dst_port: key.remote_port,
        flags,
        seq_number: seq_num,
        ack_number: ack_num,
        window_len: window,
        window_scale: wscale,
        max_seg_size: mss,
        payload_len: 0,
    };

    let len = repr.buffer_len();
    let mut buf = [0u8; TCP_HEADER_LEN + crate::wire::TCP_MAX_OPTIONS_LEN];
    repr.emit(tcp_packet::new_unchecked_mut(&mut buf[..len]));
    tcp_packet::new_unchecked_mut(&mut buf[..len])
        .fill_checksum(key.local_addr, key.remote_addr);

    let meta = SendMeta {
        src_addr: key.local_addr,
        dst_addr: key.remote_addr,
        protocol: IpProtocol::Tcp,
        ttl: stack.config.ttl,
        flags: SendFlags::DONT_FRAGMENT,
    };

    let result = ip.send_dgram(meta, &buf[..len], retry_idx.map(RetryToken));
    if result == Err(Error::ArpPending) {
        if let Some(idx) = retry_idx {
            stack.pcbs[idx].retry_registered = true;
        }
    }
    result
}

/// Common work shared by the segments of one output batch.
///
/// The first segment computes the checksum over the pseudo-header and the header fields that
/// do not vary within the batch; every further segment only folds in its own sequence number,
/// flags, length and data.
struct SegmentBatch {
    prepared: bool,
    partial: Accumulator,
    window: u16,
}

impl SegmentBatch {
    fn new() -> Self {
        SegmentBatch {
            prepared: false,
            partial: Accumulator::new(),
            window: 0,
        }
    }

    fn prepare(&mut self, stack: &mut TcpStack, idx: usize) {
        if self.prepared {
            return;
        }
        self.prepared = true;

        // Updating the window first also refreshes rcv_ann_wnd if flagged.
        self.window = input::pcb_ann_wnd(stack, idx);

        let pcb = &stack.pcbs[idx];
        let mut accum = Accumulator::new();
        accum.add_u16(u16::from(u8::from(IpProtocol::Tcp)));
        accum.add_u32(pcb.key.local_addr.to_network_integer());
        accum.add_u32(pcb.key.remote_addr.to_network_integer());
        accum.add_u16(pcb.key.local_port);
        accum.add_u16(pcb.key.remote_port);
        accum.add_u32(pcb.rcv_nxt.0 as u32);
        accum.add_u16(self.window);
        self.partial = accum;
    }
}

/// Build and send one data segment from queue offset `offset`.
///
/// Returns the payload length and whether a FIN went with it.
fn pcb_output_segment(
    stack: &mut TcpStack,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    idx: usize,
    batch: &mut SegmentBatch,
    offset: usize,
    fin_allowed: bool,
    rem_wnd: u32,
) -> Result<(usize, bool)> {
    debug_assert!(rem_wnd > 0);
    batch.prepare(stack, idx);

    // Disjoint borrows of the scratch buffer and the PCB pool.
    let TcpStack { tx_buf, pcbs, config, .. } = stack;
    let pcb = &mut pcbs[idx];
    let vars = match pcb.con() {
        Some(vars) => vars,
        None => return Err(Error::NoRoute),
    };

    let rem_data = vars.snd_buf.queued() - offset;

    // Segment size: remaining data, remaining window, maximum segment size.
    let seg_len = rem_data
        .min(rem_wnd as usize)
        .min(usize::from(pcb.snd_mss));
    debug_assert!(seg_len > 0 || fin_allowed);

    let mut flags = TcpFlags::default();
    flags.set_ack(true);

    // A FIN goes along when one is queued, no data follows this segment, and the window has
    // room for its sequence count.
    let fin_sent = fin_allowed && seg_len == rem_data && rem_wnd as usize > seg_len;
    if fin_sent {
        flags.set_fin(true);
        flags.set_psh(true);
    }

    // PSH when the push index falls within this segment.
    let psh_index = vars.snd_buf.psh_index();
    if psh_index > offset && psh_index <= offset + seg_len {
        flags.set_psh(true);
    }

    let seq_num = pcb.snd_una + offset;

    // Assemble header and payload in the scratch buffer.
    vars.snd_buf.read_at(
        offset, &mut tx_buf[TCP_HEADER_LEN..TCP_HEADER_LEN + seg_len]);

    {
        let segment = tcp_packet::new_unchecked_mut(&mut tx_buf[..TCP_HEADER_LEN + seg_len]);
        segment.set_src_port(pcb.key.local_port);
        segment.set_dst_port(pcb.key.remote_port);
        segment.set_seq_number(seq_num);
        segment.set_ack_number(pcb.rcv_nxt);
        segment.set_header_len(TCP_HEADER_LEN as u8);
        segment.set_flags(flags);
        segment.set_window_len(batch.window);
        segment.set_checksum(0);
        segment.set_urgent_at(0);
    }
    let offset_flags = ((TCP_HEADER_LEN as u16 / 4) << 12) | (flags.0 & 0x1ff);

    // Finish the batch checksum with the per-segment parts.
    let mut chksum = batch.partial;
    chksum.add_u32(seq_num.0 as u32);
    chksum.add_u16(offset_flags);
    chksum.add_u16((TCP_HEADER_LEN + seg_len) as u16);
    chksum.add_data(&tx_buf[TCP_HEADER_LEN..TCP_HEADER_LEN + seg_len]);
    let checksum = chksum.finish();
    tcp_packet::new_unchecked_mut(&mut tx_buf[..TCP_HEADER_LEN + seg_len])
        .set_checksum(checksum);

    let meta = SendMeta {
        src_addr: pcb.key.local_addr,
        dst_addr: pcb.key.remote_addr,
        protocol: IpProtocol::Tcp,
        ttl: config.ttl,
        flags: SendFlags::DONT_FRAGMENT,
    };

    let result = ip.send_dgram(
        meta, &tx_buf[..TCP_HEADER_LEN + seg_len], Some(RetryToken(idx)));
    if let Err(err) = result {
        if err == Error::ArpPending {
            pcb.retry_registered = true;
        }
        return Err(err);
    }

    let seg_seqlen = seg_len + usize::from(fin_sent);
    if fin_sent {
        pcb.set_flag(PcbFlags::FIN_SENT);
    }

    // A retransmission covering the measured sequence number invalidates the measurement.
    if pcb.has_flag(PcbFlags::RTT_PENDING) {
        let covers = pcb.con()
            .map(|vars| vars.rtt_test_seq.since(seq_num) < seg_seqlen as u32)
            .unwrap_or(false);
        if covers {
            pcb.clear_flag(PcbFlags::RTT_PENDING);
        }
    }

    // Track transmission of new sequence space.
    let seg_endseq = seq_num + seg_seqlen;
    if pcb.snd_nxt < seg_endseq {
        if !pcb.has_flag(PcbFlags::RTT_PENDING) {
            pcb.set_flag(PcbFlags::RTT_PENDING);
            pcb.rtt_test_time = now;
            let snd_nxt = pcb.snd_nxt;
            if let Some(vars) = pcb.con_mut() {
                vars.rtt_test_seq = snd_nxt;
            }
        }
        pcb.snd_nxt = seg_endseq;
    }

    Ok((seg_len, fin_sent))
}
