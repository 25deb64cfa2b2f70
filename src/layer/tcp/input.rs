//! Input segment processing.
//!
//! The receive path is decomposed the same way for every segment: basic processing (RST/SYN
//! handling, acceptability, trimming into the window, ACK validation), then state-specific
//! work (handshake completion or ACK/window processing), then receive-side data handling, and
//! finally any pending output. User callbacks run in the middle of this; an abort performed
//! inside one is detected through the current-PCB marker and unwinds the remaining stages.
use crate::layer::ip::{Error, Ip4Tx, Result};
use crate::managed::Slice;
use crate::time::Instant;
use crate::wire::{TcpRepr, TcpSeqNumber};

use super::buffer::{RecvRing, SendRing};
use super::connection::{Acceptor, ConnKey, Control, Events, ListenerKey};
use super::endpoint::TcpStack;
use super::pcb::{ConnVars, Owner, PcbFlags, PcbKey, State, Timer};
use super::{output, MAX_ACK_BEFORE, MAX_WINDOW, MIN_ABANDON_RCV_WND_INCR};

/// Process a segment addressed to an existing PCB.
pub(crate) fn pcb_input<'a>(
    stack: &mut TcpStack<'a>,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    events: &mut dyn Events<'a>,
    idx: usize,
    repr: &TcpRepr,
    payload: &[u8],
) {
    debug_assert!(stack.current_pcb.is_none());
    stack.current_pcb = Some(idx);

    pcb_input_core(stack, now, ip, events, idx, repr, payload);

    // The abort-detection marker is cleared by aborts from within callbacks.
    if stack.current_pcb.is_some() {
        stack.current_pcb = None;
    }
}

fn pcb_input_core<'a>(
    stack: &mut TcpStack<'a>,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    events: &mut dyn Events<'a>,
    idx: usize,
    repr: &TcpRepr,
    payload: &[u8],
) {
    debug_assert!(stack.pcbs[idx].state != State::Closed);

    let orig_data_len = payload.len();

    let (eff_rel_seq, seg_fin, acked, payload) =
        match pcb_input_basic_processing(stack, now, ip, events, idx, repr, payload) {
            Some(parts) => parts,
            None => return,
        };

    if stack.pcbs[idx].state.is_syn_sent_or_rcvd() {
        // Normally transitions to the established state.
        if !pcb_input_syn_sent_rcvd_processing(stack, now, ip, events, idx, repr, acked) {
            return;
        }
        debug_assert!(!stack.pcbs[idx].state.is_syn_sent_or_rcvd());
    } else if !pcb_input_ack_wnd_processing(
        stack, now, ip, events, idx, repr, acked, orig_data_len)
    {
        return;
    }

    if stack.pcbs[idx].state.accepting_data() {
        if !pcb_input_rcv_processing(stack, now, ip, events, idx, eff_rel_seq, seg_fin, payload)
        {
            return;
        }
    } else if stack.pcbs[idx].state == State::TimeWait {
        // Reply with an ACK and restart the timeout.
        stack.pcbs[idx].set_flag(PcbFlags::ACK_PENDING);
        stack.pcbs[idx].timers.set(Timer::Abort, now + super::TIME_WAIT_TIMEOUT);
    }

    // Output if needed.
    if stack.pcbs[idx].has_and_clear_flag(PcbFlags::OUT_PENDING) {
        debug_assert!(stack.pcbs[idx].state.can_output());
        debug_assert!(output::pcb_has_snd_outstanding(stack, idx));
        output::pcb_output(stack, now, ip, idx, false);
    }

    // An empty ACK is only needed if output did not already carry it.
    if stack.pcbs[idx].has_and_clear_flag(PcbFlags::ACK_PENDING) {
        output::pcb_send_empty_ack(stack, ip, idx);
    }
}

/// RST/SYN handling, acceptability, trim to window and RFC 5961 ACK validation.
///
/// Returns the effective relative sequence, the effective FIN flag, the acknowledged count and
/// the possibly trimmed payload, or `None` when processing stops here.
fn pcb_input_basic_processing<'a, 'p>(
    stack: &mut TcpStack<'a>,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    events: &mut dyn Events<'a>,
    idx: usize,
    repr: &TcpRepr,
    mut payload: &'p [u8],
) -> Option<(u32, bool, u32, &'p [u8])> {
    // Handle the uncommon flag combinations (RST set, SYN set or ACK not set).
    let common_ack = repr.flags.ack() && !repr.flags.rst() && !repr.flags.syn();
    if !common_ack {
        if !pcb_uncommon_flags_processing(stack, now, ip, events, idx, repr, payload.len()) {
            return None;
        }
    }

    let eff_rel_seq;
    let seg_fin;
    let acked;

    if stack.pcbs[idx].state == State::SynSent {
        // Only a SYN is accepted here; any data or FIN with it is ignored so that the receive
        // stage has nothing to do.
        eff_rel_seq = 0;
        payload = &payload[..0];
        seg_fin = false;

        // The ACK must acknowledge our SYN (RFC 793 p66), which also requires that we have
        // sent it at all.
        let pcb = &stack.pcbs[idx];
        let ack_num = repr.ack_number.unwrap_or(TcpSeqNumber(0));
        if pcb.snd_una == pcb.snd_nxt || repr.ack_number != Some(pcb.snd_nxt) {
            let key = pcb.key;
            output::send_rst(stack, ip, &key, ack_num, None);
            return None;
        }

        // The SYN is being acknowledged.
        acked = 1;
    } else {
        // The edge of the receive window: the announced window, or the actual buffer space
        // when more is available than was announced.
        let mut rcv_wnd = stack.pcbs[idx].rcv_ann_wnd;
        if stack.pcbs[idx].state != State::SynRcvd {
            if let Some(vars) = stack.pcbs[idx].con() {
                let avail_wnd = (vars.rcv_buf.free() as u32).min(MAX_WINDOW);
                rcv_wnd = rcv_wnd.max(avail_wnd);
            }
        }

        let pcb = &stack.pcbs[idx];
        let mut rel_seq = repr.seq_number.since(pcb.rcv_nxt);
        let mut fin = repr.flags.fin();
        let seqlen = payload.len() as u32 + u32::from(fin);

        if seqlen == 0 {
            // An empty segment is acceptable if it is within or at the right edge of the
            // window. Allowing the right edge with a nonzero window bends RFC 793, but such
            // segments occur normally when the sender exhausts our window and may carry
            // useful ACKs or window updates.
            if rel_seq > rcv_wnd {
                output::pcb_send_empty_ack(stack, ip, idx);
                return None;
            }
        } else {
            let last_rel_seq = rel_seq.wrapping_add(seqlen).wrapping_sub(1);
            let left_edge_in_window = rel_seq < rcv_wnd;
            let right_edge_in_window = last_rel_seq < rcv_wnd;

            // A segment cannot be long enough to start inside the window, leave it, wrap the
            // sequence space and end inside again; both edges in the window means all of it
            // is.
            if !left_edge_in_window || !right_edge_in_window {
                if left_edge_in_window {
                    // Data past the window is cut from the end.
                    let left_keep = rcv_wnd.wrapping_sub(rel_seq);
                    debug_assert!(left_keep > 0 && left_keep < seqlen);
                    fin = false; // a FIN would be outside the window
                    payload = &payload[..left_keep as usize];
                } else if right_edge_in_window {
                    // Data before the window was received already; cut it from the front.
                    let left_trim = rel_seq.wrapping_neg();
                    debug_assert!(left_trim > 0 && left_trim < seqlen);
                    rel_seq = 0;
                    // The FIN cannot be cut here since left_trim < seqlen.
                    payload = &payload[left_trim as usize..];
                } else {
                    // Entirely outside the window.
                    output::pcb_send_empty_ack(stack, ip, idx);
                    return None;
                }
            }
        }

        // ACK acceptability as per RFC 5961.
        let ack_num = match repr.ack_number {
            Some(ack_num) => ack_num,
            None => return None,
        };
        let pcb = &stack.pcbs[idx];
        let ack_minus_una = ack_num.since(pcb.snd_una);
        if ack_minus_una <= pcb.snd_nxt.since(pcb.snd_una) {
            // Not an old ACK.
            acked = ack_minus_una;
        } else {
            // An old or too-new ACK; permissibly old ones count as zero.
            let una_minus_ack = ack_minus_una.wrapping_neg();
            if una_minus_ack > MAX_ACK_BEFORE {
                output::pcb_send_empty_ack(stack, ip, idx);
                return None;
            }
            acked = 0;
        }

        eff_rel_seq = rel_seq;
        seg_fin = fin;
    }

    Some((eff_rel_seq, seg_fin, acked, payload))
}

/// Returns whether normal processing continues (only for a SYN-ACK in SYN_SENT).
fn pcb_uncommon_flags_processing<'a>(
    stack: &mut TcpStack<'a>,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    events: &mut dyn Events<'a>,
    idx: usize,
    repr: &TcpRepr,
    data_len: usize,
) -> bool {
    let state = stack.pcbs[idx].state;

    if repr.flags.rst() {
        // RST, handled as per RFC 5961.
        if state == State::SynSent {
            // Acceptable if it acknowledges the SYN. Because we may have sent an empty ACK
            // with seq_num == snd_una, ack_num == snd_una is also accepted.
            let pcb = &stack.pcbs[idx];
            let acceptable = match repr.ack_number {
                Some(ack) => ack.lte(pcb.snd_nxt, pcb.snd_una),
                None => false,
            };
            if acceptable {
                net_trace!("tcp: {}: connection refused", stack.pcbs[idx].key.remote_addr);
                stack.pcb_abort(now, ip, events, idx, false);
            }
        } else {
            let pcb = &stack.pcbs[idx];
            if repr.seq_number == pcb.rcv_nxt {
                stack.pcb_abort(now, ip, events, idx, false);
            } else if repr.seq_number.since(pcb.rcv_nxt) <= pcb.rcv_ann_wnd {
                // In the window but not exact: challenge ACK. The check is against the
                // announced window only; an RST within the larger actual buffer window is
                // ignored, which is harmless.
                output::pcb_send_empty_ack(stack, ip, idx);
            }
        }
        false
    } else if repr.flags.syn() {
        if state == State::SynSent {
            if repr.flags.ack() {
                // The expected SYN-ACK response; continue processing.
                true
            } else {
                // Simultaneous open is not supported; refuse it.
                let seqlen = data_len + repr.flags.sequence_len();
                let key = stack.pcbs[idx].key;
                output::send_rst(
                    stack, ip, &key,
                    TcpSeqNumber(0), Some(repr.seq_number + seqlen));
                false
            }
        } else {
            // SYN on a synchronized connection, as per RFC 5961.
            let pcb = &stack.pcbs[idx];
            if state == State::SynRcvd && repr.seq_number == pcb.rcv_nxt - 1usize {
                // A retransmission of the SYN: answer it again and renew the timeout.
                output::pcb_send_syn(stack, now, ip, idx);
                stack.pcbs[idx].timers.set(Timer::Abort, now + super::SYN_RCVD_TIMEOUT);
            } else {
                output::pcb_send_empty_ack(stack, ip, idx);
            }
            false
        }
    } else {
        // Segments with none of RST, SYN and ACK should never be sent; drop them. RFC 793
        // would have us send an empty ACK for out-of-window ones, which is skipped here.
        false
    }
}

fn pcb_input_syn_sent_rcvd_processing<'a>(
    stack: &mut TcpStack<'a>,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    events: &mut dyn Events<'a>,
    idx: usize,
    repr: &TcpRepr,
    acked: u32,
) -> bool {
    let syn_sent = stack.pcbs[idx].state == State::SynSent;
    debug_assert!(syn_sent || stack.pcbs[idx].state == State::SynRcvd);

    let mut proceed = true;

    if !syn_sent && repr.seq_number < stack.pcbs[idx].rcv_nxt {
        // Data before rcv_nxt was trimmed in basic processing, so this cannot normally fire,
        // but a strict check is cheap.
        output::pcb_send_empty_ack(stack, ip, idx);
        proceed = false;
    } else if acked == 0 {
        // Our SYN is not acknowledged. In SYN_SENT acked is always one here.
        let key = stack.pcbs[idx].key;
        let ack_num = repr.ack_number.unwrap_or(TcpSeqNumber(0));
        output::send_rst(stack, ip, &key, ack_num, None);
        proceed = false;
    } else if syn_sent && !repr.flags.syn() {
        // A bare ACK in SYN_SENT is dropped silently.
        proceed = false;
    }

    if !proceed {
        // At this stage a SYN_SENT PCB is always referenced and a SYN_RCVD one never is.
        if !syn_sent {
            stack.move_unrefed_to_front(idx);
        }
        return false;
    }

    // Only our SYN can have been acknowledged here.
    debug_assert!(stack.pcbs[idx].snd_nxt == stack.pcbs[idx].snd_una + 1usize);

    stack.pcbs[idx].timers.unset(Timer::Abort);
    stack.pcbs[idx].timers.unset(Timer::Rtx);

    // Stash the peer's window in snd_una until the established transition restores it; the
    // window in a SYN or SYN-ACK is unscaled only for SYN_SENT (snd_wnd_shift is still zero
    // there), while the ACK completing a passive open carries a scaled value already.
    let wnd = pcb_decode_wnd_size(&stack.pcbs[idx], repr.window_len);
    stack.pcbs[idx].snd_una = TcpSeqNumber(wnd as i32);

    if syn_sent {
        // Learn the peer's sequence numbering from the SYN.
        debug_assert_eq!(stack.pcbs[idx].rcv_nxt, TcpSeqNumber(0));
        debug_assert!(stack.pcbs[idx].rcv_ann_wnd > 0);
        stack.pcbs[idx].rcv_nxt = repr.seq_number + 1usize;
        stack.pcbs[idx].rcv_ann_wnd -= 1;

        stack.pcbs[idx].state = State::Established;

        // Resolve the final base send MSS from the peer's MSS option.
        let base = stack.pcbs[idx].base_snd_mss;
        match super::calc_snd_mss(base, repr.max_seg_size) {
            Some(mss) => stack.pcbs[idx].base_snd_mss = mss,
            None => {
                // The RST is an ACK due to the transition above.
                stack.pcb_abort(now, ip, events, idx, true);
                return false;
            }
        }

        // Window scale negotiation: if either side omitted the option, neither scales.
        debug_assert_eq!(stack.pcbs[idx].snd_wnd_shift, 0);
        match repr.window_scale {
            Some(scale) => stack.pcbs[idx].snd_wnd_shift = scale.min(14),
            None => stack.pcbs[idx].rcv_wnd_shift = 0,
        }

        // The path MTU was parked in snd_mss while handshaking.
        let pmtu = stack.pcbs[idx].snd_mss;
        pcb_complete_established_transition(stack, now, idx, pmtu);

        // Acknowledge the SYN-ACK.
        stack.pcbs[idx].set_flag(PcbFlags::ACK_PENDING);

        // Start transmitting anything queued while connecting.
        let (has_data, snd_closed) = match stack.pcbs[idx].con() {
            Some(vars) => (vars.snd_buf.queued() > 0, vars.snd_closed),
            None => (false, false),
        };
        if has_data {
            stack.pcbs[idx].set_flag(PcbFlags::OUT_PENDING);
        }
        if snd_closed {
            if let Some(vars) = stack.pcbs[idx].con_mut() {
                vars.snd_buf.push_all();
            }
            output::pcb_end_sending(stack, now, idx);
        }

        let key = ConnKey { idx, generation: stack.pcbs[idx].generation };
        events.connection_established(Control { stack: &mut *stack, ip: &mut *ip, now, key });
        if stack.current_pcb.is_none() {
            return false;
        }
        // Possible transitions in the callback (except to CLOSED):
        // - ESTABLISHED -> FIN_WAIT_1
    } else {
        let lis = match stack.pcbs[idx].listener() {
            Some(lis) => lis,
            None => return false,
        };
        debug_assert!(stack.listeners[lis].accept_pcb.is_none());

        // Publish the PCB for acceptance; off the unreferenced list it cannot be reused by
        // an allocation happening inside the callback.
        stack.listeners[lis].accept_pcb = Some(idx);
        stack.unrefed_remove(idx);

        events.accept_ready(
            ListenerKey(lis),
            Acceptor { stack: &mut *stack, ip: &mut *ip, now, listener: ListenerKey(lis) });
        if stack.current_pcb.is_none() {
            return false;
        }
        // Possible transitions in the callback (except to CLOSED):
        // - SYN_RCVD -> ESTABLISHED (via the acceptor)
        // - ESTABLISHED -> FIN_WAIT_1

        // Unaccepted, or accepted and immediately dropped again: refuse. The PCB must not
        // remain in SYN_RCVD since its variables were prepared for the transition.
        if stack.pcbs[idx].state == State::SynRcvd || !stack.pcbs[idx].user_attached {
            stack.pcb_abort(now, ip, events, idx, true);
            return false;
        }
    }

    debug_assert!(matches!(
        stack.pcbs[idx].state,
        State::Established | State::FinWait1));

    true
}

fn pcb_input_ack_wnd_processing<'a>(
    stack: &mut TcpStack<'a>,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    events: &mut dyn Events<'a>,
    idx: usize,
    repr: &TcpRepr,
    acked: u32,
    orig_data_len: usize,
) -> bool {
    debug_assert!(!matches!(
        stack.pcbs[idx].state,
        State::Closed | State::SynSent | State::SynRcvd));

    // Activity on an unreferenced PCB protects it from reuse for a while.
    if stack.pcb_is_unreferenced(idx) {
        stack.move_unrefed_to_front(idx);
    }

    let ack_num = match repr.ack_number {
        Some(ack_num) => ack_num,
        None => return false,
    };

    if acked > 0 {
        debug_assert!(stack.pcbs[idx].state.can_output());
        debug_assert!(output::pcb_has_snd_outstanding(stack, idx));

        // Congestion control and RTT bookkeeping first, while snd_una still holds the
        // pre-ACK value.
        output::pcb_output_handle_acked(stack, now, ip, idx, ack_num, acked);

        stack.pcbs[idx].snd_una = ack_num;

        let fin_acked = output::pcb_fin_acked(&stack.pcbs[idx]);
        let data_acked = acked - u32::from(fin_acked);

        if data_acked > 0 {
            let user_attached = stack.pcbs[idx].user_attached;
            match stack.pcbs[idx].con_mut() {
                Some(vars) => {
                    debug_assert!(data_acked as usize <= vars.snd_buf.queued());

                    // snd_wnd is relative to snd_una and so shrinks with it. Skipping the
                    // FIN count here is fine: once the FIN is acked the window no longer
                    // matters.
                    vars.snd_wnd -= (data_acked).min(vars.snd_wnd);

                    vars.snd_buf.consume(data_acked as usize);
                }
                // Unacked data implies the buffers still exist, even when abandoned.
                None => debug_assert!(false),
            }

            if user_attached {
                let key = ConnKey { idx, generation: stack.pcbs[idx].generation };
                events.data_sent(
                    Control { stack: &mut *stack, ip: &mut *ip, now, key },
                    data_acked as usize);
                if stack.current_pcb.is_none() {
                    return false;
                }
                // Possible transitions in the callback (except to CLOSED):
                // - ESTABLISHED -> FIN_WAIT_1
                // - CLOSE_WAIT -> LAST_ACK
            }
        }

        if fin_acked {
            debug_assert!(matches!(
                stack.pcbs[idx].state,
                State::FinWait1 | State::Closing | State::LastAck));

            match stack.pcbs[idx].state {
                State::FinWait1 => stack.pcb_go_to_fin_wait_2(idx),
                State::Closing => {
                    stack.pcb_go_to_time_wait(now, events, idx);
                    return false;
                }
                _ => {
                    // LAST_ACK: both sides are done.
                    stack.pcb_abort(now, ip, events, idx, false);
                    return false;
                }
            }
        } else if output::pcb_has_snd_outstanding(stack, idx) {
            // A running retransmission timeout became stale with this ACK. Scheduling
            // output restarts it as needed (retransmission or window probe).
            stack.pcbs[idx].timers.unset(Timer::Rtx);
            stack.pcbs[idx].set_flag(PcbFlags::OUT_PENDING);
        } else {
            // Nothing in flight: arm the idle timeout.
            let rto = output::rto_duration(stack.pcbs[idx].rto);
            stack.pcbs[idx].timers.set(Timer::Rtx, now + rto);
            stack.pcbs[idx].set_flag(PcbFlags::IDLE_TIMER);
            stack.pcbs[idx].clear_flag(PcbFlags::OUT_PENDING);
            stack.pcbs[idx].timers.unset(Timer::Output);
        }
    } else {
        // Duplicate ACK detection (RFC 5681), ordered so ordinary segments test cheaply.
        let is_dupack = orig_data_len == 0
            && !repr.flags.fin()
            && ack_num == stack.pcbs[idx].snd_una
            && stack.pcbs[idx].state.can_output()
            && output::pcb_has_snd_unacked(stack, idx)
            && match stack.pcbs[idx].con() {
                Some(vars) =>
                    pcb_decode_wnd_size(&stack.pcbs[idx], repr.window_len) == vars.snd_wnd,
                None => false,
            };

        if is_dupack {
            let limit = super::FAST_RTX_DUP_ACKS + super::MAX_ADDITIONAL_DUP_ACKS;
            if stack.pcbs[idx].num_dupack < limit {
                stack.pcbs[idx].num_dupack += 1;
                if stack.pcbs[idx].num_dupack == super::FAST_RTX_DUP_ACKS {
                    output::pcb_fast_rtx_dup_acks_received(stack, now, ip, idx);
                } else if stack.pcbs[idx].num_dupack > super::FAST_RTX_DUP_ACKS {
                    output::pcb_extra_dup_ack_received(stack, idx);
                }
            }
        }
    }

    // Window updates take the simple route: apply whenever the segment is not an old ACK.
    // This avoids snd_wl1/snd_wl2 tracking entirely; the worst case is using a stale window
    // value when reordered segments carry the same ACK number.
    if stack.pcbs[idx].snd_una == ack_num {
        let new_snd_wnd = pcb_decode_wnd_size(&stack.pcbs[idx], repr.window_len);
        output::pcb_update_snd_wnd(stack, idx, new_snd_wnd);
    }

    true
}

fn pcb_input_rcv_processing<'a>(
    stack: &mut TcpStack<'a>,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    events: &mut dyn Events<'a>,
    idx: usize,
    eff_rel_seq: u32,
    seg_fin: bool,
    payload: &[u8],
) -> bool {
    debug_assert!(stack.pcbs[idx].state.accepting_data());

    let rcv_datalen;
    let rcv_fin;

    if !stack.pcbs[idx].user_attached {
        // Abandoned: no one is left to consume data, so its arrival is fatal; a bare
        // in-sequence FIN still completes the close.
        if eff_rel_seq != 0 || !payload.is_empty() {
            stack.pcb_abort(now, ip, events, idx, true);
            return false;
        }
        rcv_datalen = 0;
        rcv_fin = seg_fin;
    } else {
        let rcv_nxt = stack.pcbs[idx].rcv_nxt;
        let vars = match stack.pcbs[idx].con_mut() {
            Some(vars) => vars,
            None => return false,
        };

        if eff_rel_seq == 0 && vars.ooseq.is_nothing_buffered() {
            // Fast path: in sequence, nothing buffered.
            rcv_datalen = payload.len();
            rcv_fin = seg_fin;

            if rcv_datalen > 0 {
                // Data that does not fit means the peer ignored our announced window.
                if !vars.rcv_buf.write_at(0, payload) {
                    stack.pcb_abort(now, ip, events, idx, true);
                    return false;
                }
            }
        } else {
            // Slow path: out-of-sequence buffering.
            let eff_seq = rcv_nxt.wrapping_add(eff_rel_seq);
            let need_ack = match vars.ooseq.update_for_segment(
                rcv_nxt, eff_seq, payload.len(), seg_fin)
            {
                Ok(need_ack) => need_ack,
                Err(()) => {
                    stack.pcb_abort(now, ip, events, idx, true);
                    return false;
                }
            };

            let fits = payload.is_empty()
                || vars.rcv_buf.write_at(eff_rel_seq as usize, payload);
            if !fits {
                stack.pcb_abort(now, ip, events, idx, true);
                return false;
            }

            if need_ack {
                stack.pcbs[idx].set_flag(PcbFlags::ACK_PENDING);
            }

            let vars = match stack.pcbs[idx].con_mut() {
                Some(vars) => vars,
                None => return false,
            };
            let (datalen, fin) = vars.ooseq.shift_available(rcv_nxt);
            rcv_datalen = datalen;
            rcv_fin = fin;
        }

        // Whatever became in-sequence was already written into the buffer; expose it.
        if rcv_datalen > 0 {
            match stack.pcbs[idx].con_mut() {
                Some(vars) => vars.rcv_buf.commit(rcv_datalen),
                None => return false,
            }
        }
    }

    let rcv_seqlen = rcv_datalen as u32 + u32::from(rcv_fin);
    pcb_process_received(stack, now, ip, events, idx, rcv_seqlen, rcv_datalen)
}

/// Advance `rcv_nxt`, make FIN state transitions and deliver the user callbacks.
fn pcb_process_received<'a>(
    stack: &mut TcpStack<'a>,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    events: &mut dyn Events<'a>,
    idx: usize,
    rcv_seqlen: u32,
    rcv_datalen: usize,
) -> bool {
    if rcv_seqlen == 0 {
        return true;
    }

    let fin = rcv_seqlen > rcv_datalen as u32;

    {
        let pcb = &mut stack.pcbs[idx];
        pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(rcv_seqlen);

        // rcv_ann_wnd is relative to rcv_nxt. The peer may overshoot the announced window
        // briefly when an update is in flight.
        pcb.rcv_ann_wnd = pcb.rcv_ann_wnd.saturating_sub(rcv_seqlen);

        pcb.set_flag(PcbFlags::ACK_PENDING);

        if fin {
            pcb.state = match pcb.state {
                State::Established => State::CloseWait,
                State::FinWait1 => State::Closing,
                _ => {
                    debug_assert_eq!(pcb.state, State::FinWait2);
                    // Hold the transition until the callbacks below have run; this inhibits
                    // window-update processing from inside them.
                    State::FinWait2TimeWait
                }
            };
        }
    }

    if rcv_datalen > 0 {
        // Due to window scaling the shrunken rcv_ann_wnd may round down to a value that
        // permits announcing more; update lazily when the next segment is sent.
        if stack.pcbs[idx].user_attached {
            stack.pcbs[idx].set_flag(PcbFlags::RCV_WND_UPD);

            let key = ConnKey { idx, generation: stack.pcbs[idx].generation };
            events.data_received(
                Control { stack: &mut *stack, ip: &mut *ip, now, key }, rcv_datalen);
            if stack.current_pcb.is_none() {
                return false;
            }
            // Possible transitions in the callback (except to CLOSED):
            // - ESTABLISHED -> FIN_WAIT_1
            // - CLOSE_WAIT -> LAST_ACK
        }
    }

    if fin {
        if stack.pcbs[idx].user_attached {
            let key = ConnKey { idx, generation: stack.pcbs[idx].generation };
            events.data_received(Control { stack: &mut *stack, ip: &mut *ip, now, key }, 0);
            if stack.current_pcb.is_none() {
                return false;
            }
            // Possible transitions in the callback (except to CLOSED):
            // - CLOSE_WAIT -> LAST_ACK
        }

        if stack.pcbs[idx].state == State::FinWait2TimeWait {
            stack.pcb_go_to_time_wait(now, events, idx);
        }
    }

    true
}

/// Process a SYN addressed to a listener.
pub(crate) fn listen_input<'a>(
    stack: &mut TcpStack<'a>,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    events: &mut dyn Events<'a>,
    lis: usize,
    key: &PcbKey,
    repr: &TcpRepr,
    data_len: usize,
) {
    let refuse = |stack: &mut TcpStack<'a>, ip: &mut dyn Ip4Tx| {
        output::send_rst_reply(stack, ip, key, repr, data_len);
    };

    // A new connection starts with a SYN and nothing else.
    let flags = repr.flags;
    if !flags.syn() || flags.ack() || flags.rst() || flags.fin() {
        // SYN+FIN is dropped here as well, though RFC 793 does not ask for that.
        if !flags.rst() && flags.ack() {
            return refuse(stack, ip);
        }
        return;
    }

    if stack.listeners[lis].num_pcbs >= stack.listeners[lis].max_pcbs {
        return refuse(stack, ip);
    }

    // The MSS towards this peer follows from the interface MTU.
    let iface_mss = match ip.local_addr_for(key.remote_addr) {
        Some((_, mtu)) => (mtu.saturating_sub(crate::wire::IPV4_TCP_HEADER_LEN as u16))
            .min(super::MAX_SND_MSS),
        None => return,
    };

    let base_snd_mss = match super::calc_snd_mss(iface_mss, repr.max_seg_size) {
        Some(mss) => mss,
        None => return refuse(stack, ip),
    };

    let idx = match stack.allocate_pcb(now, ip, events) {
        Some(idx) => idx,
        None => {
            // Resource exhaustion drops the SYN silently; the peer retransmits.
            net_debug!("tcp: no pcb for incoming connection to port {}", key.local_port);
            return;
        }
    };

    let iss = stack.isn.get_isn(*key, now);

    // The initial window is at most 16-bit wide since SYN-ACK segments have an unscaled
    // window field.
    let rcv_wnd = stack.listeners[lis].initial_rcv_wnd
        .min(u32::from(u16::max_value()));

    {
        let pcb = &mut stack.pcbs[idx];
        pcb.key = *key;
        pcb.state = State::SynRcvd;
        pcb.flags.clear_all();
        pcb.owner = Owner::Listener(lis);
        pcb.user_attached = false;
        pcb.rcv_nxt = repr.seq_number + 1usize;
        pcb.rcv_ann_wnd = rcv_wnd;
        pcb.snd_una = iss;
        pcb.snd_nxt = iss;
        pcb.snd_mss = iface_mss; // parked here until established
        pcb.base_snd_mss = base_snd_mss;
        pcb.rto = super::INITIAL_RTX_TIME;
        pcb.num_dupack = 0;
        pcb.snd_wnd_shift = 0;
        pcb.rcv_wnd_shift = 0;

        // Window scaling is used only when both sides advertise it.
        if let Some(scale) = repr.window_scale {
            pcb.flags.set(PcbFlags::WND_SCALE);
            pcb.snd_wnd_shift = scale.min(14);
            pcb.rcv_wnd_shift = super::RCV_WND_SHIFT;
        }
    }

    stack.listeners[lis].num_pcbs += 1;
    stack.active.insert(*key, idx);

    // SYN_RCVD PCBs remain unreferenced, but freshly touched ones resist reuse.
    stack.move_unrefed_to_front(idx);

    stack.pcbs[idx].timers.set(Timer::Abort, now + super::SYN_RCVD_TIMEOUT);
    let rto = output::rto_duration(stack.pcbs[idx].rto);
    stack.pcbs[idx].timers.set(Timer::Rtx, now + rto);

    output::pcb_send_syn(stack, now, ip, idx);
}

impl<'a> TcpStack<'a> {
    /// Accept the connection a listener currently publishes.
    pub(crate) fn accept_pending(
        &mut self,
        now: Instant,
        ip: &mut dyn Ip4Tx,
        listener: ListenerKey,
        snd_storage: Slice<'a, u8>,
        rcv_storage: Slice<'a, u8>,
    ) -> Result<ConnKey> {
        let lis = listener.0;
        let idx = match self.listeners[lis].accept_pcb.take() {
            Some(idx) => idx,
            None => return Err(Error::NoPcbAvail),
        };
        debug_assert_eq!(self.pcbs[idx].state, State::SynRcvd);

        self.listeners[lis].num_pcbs -= 1;

        let vars = ConnVars::new(
            SendRing::new(snd_storage),
            RecvRing::new(rcv_storage),
            self.config.window_update_threshold);

        let remote = self.pcbs[idx].key.remote_addr;
        {
            let pcb = &mut self.pcbs[idx];
            pcb.owner = Owner::Connection(vars);
            pcb.user_attached = true;
            pcb.state = State::Established;
        }

        let pmtu = ip.pmtu(remote);
        pcb_complete_established_transition(self, now, idx, pmtu);

        Ok(ConnKey { idx, generation: self.pcbs[idx].generation })
    }
}

/// Initialization that must wait until connection variables exist.
///
/// Called at the transition to the established state from either kind of open. Expects the
/// peer's initial window parked in `snd_una` by the handshake processing.
pub(crate) fn pcb_complete_established_transition(
    stack: &mut TcpStack,
    now: Instant,
    idx: usize,
    pmtu: u16,
) {
    debug_assert_eq!(stack.pcbs[idx].state, State::Established);

    // Complete the handshake RTT measurement if no retransmission spoiled it, otherwise
    // start over from the initial timeout which retransmissions may have inflated.
    if stack.pcbs[idx].has_flag(PcbFlags::RTT_PENDING) {
        output::pcb_end_rtt_measurement(stack, now, idx);
    } else {
        stack.pcbs[idx].rto = super::INITIAL_RTX_TIME;
    }

    stack.pcbs[idx].set_flag(PcbFlags::RCV_WND_UPD);

    let base = stack.pcbs[idx].base_snd_mss;
    stack.pcbs[idx].snd_mss = output::calc_snd_mss_from_pmtu(base, pmtu);

    let snd_wnd = stack.pcbs[idx].snd_una.0 as u32;
    stack.pcbs[idx].snd_una = stack.pcbs[idx].snd_nxt;

    let snd_mss = stack.pcbs[idx].snd_mss;
    stack.pcbs[idx].set_flag(PcbFlags::CWND_INIT);
    if let Some(vars) = stack.pcbs[idx].con_mut() {
        vars.snd_wnd = snd_wnd;
        vars.cwnd = super::initial_cwnd(snd_mss);
        vars.ssthresh = MAX_WINDOW;
        vars.cwnd_acked = 0;
    }
}

/// Get the scaled window size value to be put into a segment being sent.
pub(crate) fn pcb_ann_wnd(stack: &mut TcpStack, idx: usize) -> u16 {
    // Announce as much window as available even when a plain update would be suppressed by
    // the threshold. For performance the recalculation happens only when the update flag was
    // raised by a state change that could allow announcing more.
    if stack.pcbs[idx].state.accepting_data()
        && stack.pcbs[idx].has_and_clear_flag(PcbFlags::RCV_WND_UPD)
    {
        let ann_wnd = pcb_calc_wnd_update(stack, idx);
        if ann_wnd > stack.pcbs[idx].rcv_ann_wnd {
            stack.pcbs[idx].rcv_ann_wnd = ann_wnd;
        }
    }

    let pcb = &stack.pcbs[idx];
    let hdr_wnd = pcb.rcv_ann_wnd >> pcb.rcv_wnd_shift;

    // In the SYN states rcv_ann_wnd itself fits 16 bits; afterwards it never exceeds the
    // largest announceable window for the negotiated shift.
    debug_assert!(hdr_wnd <= u32::from(u16::max_value()));
    hdr_wnd as u16
}

/// React to the user having made room in the receive buffer.
pub(crate) fn pcb_rcv_buf_extended(
    stack: &mut TcpStack,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    idx: usize,
) {
    if !stack.pcbs[idx].state.accepting_data() || stack.pcbs[idx].con().is_none() {
        return;
    }

    let ann_wnd = pcb_calc_wnd_update(stack, idx);
    let threshold = stack.pcbs[idx].con()
        .map(|vars| vars.rcv_ann_thres)
        .unwrap_or(0);

    if ann_wnd >= stack.pcbs[idx].rcv_ann_wnd.saturating_add(threshold) {
        // Enough new window to be worth an immediate update.
        stack.pcbs[idx].rcv_ann_wnd = ann_wnd;
        stack.pcbs[idx].clear_flag(PcbFlags::RCV_WND_UPD);
        output::pcb_need_ack(stack, ip, idx);
    } else if ann_wnd > stack.pcbs[idx].rcv_ann_wnd {
        // Below the threshold: fold the update into the next sent segment.
        stack.pcbs[idx].set_flag(PcbFlags::RCV_WND_UPD);
    }
}

/// Announce extra receive window on abandonment to hurry the peer's remaining data and FIN.
pub(crate) fn pcb_update_rcv_wnd_after_abandoned(
    stack: &mut TcpStack,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    idx: usize,
    rcv_ann_thres: u32,
) {
    debug_assert!(stack.pcbs[idx].state.accepting_data());

    let mut min_window = rcv_ann_thres.max(MIN_ABANDON_RCV_WND_INCR);

    // Round up to a window the negotiated scale can express.
    let scale_mask = (1u32 << stack.pcbs[idx].rcv_wnd_shift) - 1;
    min_window = (min_window + scale_mask) & !scale_mask;

    min_window = min_window.min(max_rcv_wnd_ann(&stack.pcbs[idx]));

    if stack.pcbs[idx].rcv_ann_wnd < min_window {
        stack.pcbs[idx].rcv_ann_wnd = min_window;
        output::pcb_need_ack(stack, ip, idx);
    }
}

/// Put an abandoned PCB into self-draining mode.
pub(crate) fn pcb_abandoned(
    stack: &mut TcpStack,
    now: Instant,
    ip: &mut dyn Ip4Tx,
    idx: usize,
) {
    // The idle timeout belongs to an attended connection.
    if stack.pcbs[idx].has_and_clear_flag(PcbFlags::IDLE_TIMER) {
        stack.pcbs[idx].timers.unset(Timer::Rtx);
    }

    // Arrange for the FIN after whatever is still queued.
    if stack.pcbs[idx].state.is_snd_open() {
        if let Some(vars) = stack.pcbs[idx].con_mut() {
            vars.snd_buf.push_all();
        }
        output::pcb_end_sending(stack, now, idx);
    }

    if stack.pcbs[idx].state.accepting_data() {
        let threshold = stack.pcbs[idx].con()
            .map(|vars| vars.rcv_ann_thres)
            .unwrap_or(0);
        pcb_update_rcv_wnd_after_abandoned(stack, now, ip, idx, threshold);
    }

    stack.pcbs[idx].timers.set(Timer::Abort, now + super::ABANDONED_TIMEOUT);
}

/// Apply window scaling to a received window size value.
pub(crate) fn pcb_decode_wnd_size(pcb: &super::pcb::Pcb, wnd_size: u16) -> u32 {
    u32::from(wnd_size) << pcb.snd_wnd_shift
}

/// The maximum receive window that can be announced under the negotiated scaling.
pub(crate) fn max_rcv_wnd_ann(pcb: &super::pcb::Pcb) -> u32 {
    u32::from(u16::max_value()) << pcb.rcv_wnd_shift
}

/// How much window an ACK sent right now could announce.
fn pcb_calc_wnd_update(stack: &TcpStack, idx: usize) -> u32 {
    debug_assert!(stack.pcbs[idx].state.accepting_data());

    let pcb = &stack.pcbs[idx];
    let max_ann = max_rcv_wnd_ann(pcb);
    let bounded_wnd = match pcb.con() {
        Some(vars) => (vars.rcv_buf.free() as u32).min(max_ann),
        None => return 0,
    };

    // Drop the low-order bits the scale factor cannot transmit; max_ann doubles as the mask
    // since bounded_wnd <= max_ann.
    bounded_wnd & max_ann
}
