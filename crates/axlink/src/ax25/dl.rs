//! The data-link state machine: six states, driven by decoded frames,
//! user primitives, timer expiries and the send-queue drain tick.
//!
//! The automaton follows the AX.25 v2.2 SDL. Each dispatch is atomic:
//! every reply frame is queued on the egress side and all state is
//! updated before control returns to the caller. Known SDL errata are
//! resolved the accepted way: retry exhaustion in timer recovery stops
//! T1/T3 before disconnecting, and the REJ/SREJ window checks use the
//! strict upper bound so a frame that has never been transmitted is never
//! asked for again.

use tracing::{debug, trace};

use super::conn::{
    ConnId, ConnState, MAX_WINDOW, T3_DURATION_MINUTES, Version, seqno_in_range_excl,
    seqno_in_range_incl,
};
use super::error::DlError;
use super::event::{DlEvent, EventKind, FrameType};
use super::frame::{self, UInfo};
use super::node::Node;
use super::pool::{MAX_PACKET_SIZE, PacketId};
use super::socket::{SocketId, SocketKind};
use super::time::{Duration, Instant};

fn default_srtt() -> Duration {
    Duration::millis(200)
}

impl Node {
    /// Deliver one event to the automaton of its connection (or to the
    /// disconnected handler when no connection exists yet).
    pub(crate) fn dispatch(&mut self, ev: &mut DlEvent<'_>) {
        let state = ev
            .conn
            .map_or(ConnState::Disconnected, |c| self.conns.get(c).state);
        trace!(state = %state, event = %ev.kind, "dispatch");
        match state {
            ConnState::Disconnected => self.dl_disconnected(ev),
            ConnState::AwaitingConnection => self.dl_awaiting_connection(ev),
            ConnState::AwaitingRelease => self.dl_awaiting_release(ev),
            ConnState::Connected => self.dl_connected(ev),
            ConnState::TimerRecovery => self.dl_timer_recovery(ev),
            ConnState::AwaitingConnect22 => self.dl_awaiting_connect_2_2(ev),
        }

        if let Some(cid) = ev.conn {
            let conn = self.conns.get(cid);
            debug_assert!(
                conn.state == ConnState::Connected || conn.t3_expiry.is_zero(),
                "T3 running outside the connected state"
            );
        }
    }

    // ========================================================================
    // State 0: Disconnected
    // ========================================================================

    fn dl_disconnected(&mut self, ev: &mut DlEvent<'_>) {
        match ev.kind {
            EventKind::CtrlError => self.error_indication(ev.conn, DlError::InvalidControl),
            EventKind::InfoNotPermitted => {
                self.error_indication(ev.conn, DlError::UnexpectedInfo)
            }
            EventKind::IncorrectLength => {
                self.error_indication(ev.conn, DlError::IncorrectLength)
            }

            EventKind::Ua => {
                self.error_indication(ev.conn, DlError::UnexpectedUa);
                self.error_indication(ev.conn, DlError::UaWithoutFinal);
            }

            EventKind::Dm => {}

            EventKind::Ui => {
                self.ui_check(ev);
                if ev.p {
                    self.send_dm(ev, true);
                }
            }

            EventKind::Test => {
                if ev.ftype == FrameType::Cmd {
                    self.send_test(ev, ev.p);
                }
            }

            EventKind::DlDisconnect => {}

            EventKind::Disc => {
                ev.f = ev.p;
                self.send_dm(ev, ev.f);
            }

            EventKind::DlUnitData => self.send_ui(ev),

            // All other peer frames ask for a status we do not have.
            EventKind::UnknownFrame
            | EventKind::Xid
            | EventKind::I
            | EventKind::Rr
            | EventKind::Rnr
            | EventKind::Rej
            | EventKind::Srej
            | EventKind::Frmr => {
                ev.f = ev.p;
                self.send_dm(ev, ev.f);
            }

            EventKind::DlData
            | EventKind::DlFlowOn
            | EventKind::DlFlowOff
            | EventKind::LmData
            | EventKind::TimerExpireT1
            | EventKind::TimerExpireT2
            | EventKind::TimerExpireT3
            | EventKind::DrainSendQueue => {}

            EventKind::DlConnect => {
                // The entry point bound the connection and socket already.
                let Some(cid) = ev.conn else { return };
                {
                    let conn = self.conns.get_mut(cid);
                    conn.srtt = default_srtt();
                    conn.t1v = conn.srtt * 2;
                }
                self.establish_data_link(ev, cid);
                self.conns.get_mut(cid).l3_initiated = true;
                self.set_state(cid, ConnState::AwaitingConnection);
            }

            EventKind::Sabm | EventKind::Sabme => {
                ev.f = ev.p;

                // Without a listener bound to the local address the
                // connection is refused.
                let Some(listener) = self.sockets.find_listener(ev.dst()) else {
                    self.send_dm(ev, ev.f);
                    return;
                };

                let Some(cid) = self.conns.find_or_create(ev.dst(), ev.src(), ev.port) else {
                    self.counters.no_connections += 1;
                    self.send_dm(ev, ev.f);
                    return;
                };
                let Some(sid) =
                    self.sockets
                        .allocate(SocketKind::Connected, *ev.dst(), Some(cid))
                else {
                    self.counters.no_sockets += 1;
                    self.conns.release(cid);
                    self.send_dm(ev, ev.f);
                    return;
                };

                ev.conn = Some(cid);
                let accept = self.sockets.get(listener).on_connect.clone();
                self.sockets.get_mut(sid).on_connect = accept;

                {
                    let conn = self.conns.get_mut(cid);
                    conn.socket = Some(sid);
                    if ev.kind == EventKind::Sabm {
                        conn.set_version_2_0();
                    } else {
                        conn.set_version_2_2();
                    }
                    conn.srtt = default_srtt();
                    conn.t1v = conn.srtt * 2;
                    conn.l3_initiated = false;
                }

                self.send_ua(ev);
                self.reset_sequence_vars(cid);
                self.set_state(cid, ConnState::Connected);
                self.timer_start_t3(cid);
                self.connect_indication(cid);
            }
        }
    }

    // ========================================================================
    // State 1: Awaiting Connection
    // ========================================================================

    fn dl_awaiting_connection(&mut self, ev: &mut DlEvent<'_>) {
        let Some(cid) = ev.conn else { return };
        match ev.kind {
            EventKind::CtrlError => self.error_indication(ev.conn, DlError::InvalidControl),
            EventKind::InfoNotPermitted => {
                self.error_indication(ev.conn, DlError::UnexpectedInfo)
            }
            EventKind::IncorrectLength => {
                self.error_indication(ev.conn, DlError::IncorrectLength)
            }

            EventKind::DlConnect => {
                self.discard_queue(cid);
                self.conns.get_mut(cid).l3_initiated = true;
            }

            EventKind::DlDisconnect => {}

            EventKind::Sabm => {
                ev.f = ev.p;
                self.send_ua(ev);
            }

            EventKind::Sabme => {
                ev.f = ev.p;
                self.send_dm(ev, false);
                self.set_state(cid, ConnState::AwaitingConnect22);
            }

            EventKind::Disc => {
                ev.f = ev.p;
                self.send_dm(ev, ev.f);
            }

            EventKind::DlData => {
                if !self.conns.get(cid).l3_initiated {
                    self.queue_data(cid, ev.info);
                }
            }

            EventKind::DrainSendQueue => {
                if self.conns.get(cid).l3_initiated {
                    // The establishment will reset sequence state; queued
                    // data from before it is stale.
                    if let Some(bid) = self.conns.get_mut(cid).send_queue.pop_front() {
                        self.buffers.free(bid);
                    }
                }
            }

            EventKind::Ui => {
                self.ui_check(ev);
                if ev.p {
                    self.send_dm(ev, true);
                }
            }

            EventKind::Test => {
                if ev.ftype == FrameType::Cmd {
                    self.send_test(ev, ev.p);
                }
            }

            EventKind::DlUnitData => self.send_ui(ev),

            EventKind::TimerExpireT3
            | EventKind::TimerExpireT2
            | EventKind::DlFlowOff
            | EventKind::DlFlowOn
            | EventKind::UnknownFrame
            | EventKind::Xid
            | EventKind::I
            | EventKind::Rr
            | EventKind::Rnr
            | EventKind::Rej
            | EventKind::Srej
            | EventKind::Frmr
            | EventKind::LmData => {}

            EventKind::Dm => {
                if ev.f {
                    self.discard_queue(cid);
                    self.disconnect_indication(cid);
                    self.timer_stop_t1(cid);
                    self.timer_stop_t3(cid);
                    self.set_state(cid, ConnState::Disconnected);
                }
            }

            EventKind::Ua => {
                if !ev.f {
                    self.error_indication(ev.conn, DlError::UaWithoutFinal);
                    return;
                }

                let (l3, unacked) = {
                    let conn = self.conns.get(cid);
                    (conn.l3_initiated, conn.snd_state != conn.ack_state)
                };
                let indicate = l3 || unacked;
                if !l3 && unacked {
                    self.discard_queue(cid);
                }

                self.timer_stop_t1(cid);
                self.timer_stop_t2(cid);
                self.timer_start_t3(cid);
                self.reset_sequence_vars(cid);
                self.select_t1(cid);
                self.set_state(cid, ConnState::Connected);
                if indicate {
                    self.connect_indication(cid);
                }
            }

            EventKind::TimerExpireT1 => {
                let conn = self.conns.get(cid);
                if conn.rc == conn.n2 {
                    self.discard_queue(cid);
                    self.error_indication(ev.conn, DlError::ConnectTimeout);
                    self.disconnect_indication(cid);
                    self.timer_stop_t1(cid);
                    self.set_state(cid, ConnState::Disconnected);
                } else {
                    self.conns.get_mut(cid).rc += 1;
                    if self.conns.get(cid).modulo == 128 {
                        self.send_sabme(ev, true);
                    } else {
                        self.send_sabm(ev, true);
                    }
                    self.select_t1(cid);
                    self.timer_start_t1(cid);
                }
            }
        }
    }

    // ========================================================================
    // State 2: Awaiting Release
    // ========================================================================

    fn dl_awaiting_release(&mut self, ev: &mut DlEvent<'_>) {
        let Some(cid) = ev.conn else { return };
        match ev.kind {
            EventKind::CtrlError => self.error_indication(ev.conn, DlError::InvalidControl),
            EventKind::InfoNotPermitted => {
                self.error_indication(ev.conn, DlError::UnexpectedInfo)
            }
            EventKind::IncorrectLength => {
                self.error_indication(ev.conn, DlError::IncorrectLength)
            }

            EventKind::DlDisconnect => {
                self.send_dm(ev, false);
                self.timer_stop_t1(cid);
                self.timer_stop_t2(cid);
                self.set_state(cid, ConnState::Disconnected);
            }

            EventKind::Sabm | EventKind::Sabme => {
                ev.f = ev.p;
                self.send_dm(ev, ev.f);
            }

            EventKind::Disc => {
                ev.f = ev.p;
                self.send_ua(ev);
            }

            EventKind::DlUnitData => self.send_ui(ev),

            EventKind::I
            | EventKind::Rr
            | EventKind::Rnr
            | EventKind::Rej
            | EventKind::Srej => {
                if ev.p {
                    self.send_dm(ev, true);
                }
            }

            EventKind::Ui => {
                self.ui_check(ev);
                if ev.p {
                    self.send_dm(ev, true);
                }
            }

            EventKind::Test => {
                if ev.ftype == FrameType::Cmd {
                    self.send_test(ev, ev.p);
                }
            }

            EventKind::TimerExpireT3
            | EventKind::TimerExpireT2
            | EventKind::DlFlowOn
            | EventKind::DlFlowOff
            | EventKind::UnknownFrame
            | EventKind::Xid
            | EventKind::DlConnect
            | EventKind::DlData
            | EventKind::DrainSendQueue
            | EventKind::Frmr
            | EventKind::LmData => {}

            EventKind::Ua => {
                if ev.f {
                    self.disconnect_indication(cid);
                    self.timer_stop_t1(cid);
                    self.set_state(cid, ConnState::Disconnected);
                } else {
                    self.error_indication(ev.conn, DlError::UaWithoutFinal);
                }
            }

            EventKind::Dm => {
                if ev.f {
                    self.disconnect_indication(cid);
                    self.timer_stop_t1(cid);
                    self.set_state(cid, ConnState::Disconnected);
                }
            }

            EventKind::TimerExpireT1 => {
                let conn = self.conns.get(cid);
                if conn.rc == conn.n2 {
                    self.error_indication(ev.conn, DlError::ReleaseTimeout);
                    self.disconnect_indication(cid);
                    self.timer_stop_t1(cid);
                    self.set_state(cid, ConnState::Disconnected);
                } else {
                    self.conns.get_mut(cid).rc += 1;
                    self.send_disc(ev, true);
                    self.select_t1(cid);
                    self.timer_start_t1(cid);
                }
            }
        }
    }

    // ========================================================================
    // State 3: Connected
    // ========================================================================

    fn dl_connected(&mut self, ev: &mut DlEvent<'_>) {
        let Some(cid) = ev.conn else { return };
        match ev.kind {
            EventKind::CtrlError => {
                self.error_indication(ev.conn, DlError::InvalidControl);
                self.reestablish(ev, cid, true);
            }
            EventKind::InfoNotPermitted => {
                self.error_indication(ev.conn, DlError::UnexpectedInfo);
                self.reestablish(ev, cid, true);
            }
            EventKind::IncorrectLength => {
                self.error_indication(ev.conn, DlError::IncorrectLength);
                self.reestablish(ev, cid, true);
            }

            EventKind::DlConnect => {
                self.discard_queue(cid);
                self.establish_data_link(ev, cid);
                self.conns.get_mut(cid).l3_initiated = true;
                self.set_state(cid, ConnState::AwaitingConnection);
            }

            EventKind::DlDisconnect => {
                self.discard_queue(cid);
                self.conns.get_mut(cid).rc = 0;
                self.send_disc(ev, true);
                self.timer_stop_t3(cid);
                self.timer_start_t1(cid);
                self.set_state(cid, ConnState::AwaitingRelease);
            }

            EventKind::DlData => self.queue_data(cid, ev.info),

            EventKind::DrainSendQueue => self.drain_one(ev, cid),

            EventKind::TimerExpireT1 => {
                self.conns.get_mut(cid).rc = 1;
                self.timer_stop_t3(cid);
                self.transmit_inquiry(ev, cid);
                self.set_state(cid, ConnState::TimerRecovery);
            }

            EventKind::TimerExpireT3 => {
                self.conns.get_mut(cid).rc = 0;
                self.transmit_inquiry(ev, cid);
                self.set_state(cid, ConnState::TimerRecovery);
            }

            EventKind::TimerExpireT2 => {
                if self.conns.get(cid).ack_pending {
                    self.conns.get_mut(cid).ack_pending = false;
                    self.enquiry_response(ev, cid, false);
                }
                self.timer_stop_t2(cid);
            }

            EventKind::Sabm | EventKind::Sabme => self.peer_reset(ev, cid),

            EventKind::Disc => {
                self.discard_queue(cid);
                ev.f = ev.p;
                self.send_ua(ev);
                self.disconnect_indication(cid);
                self.timer_stop_t1(cid);
                self.timer_stop_t3(cid);
                self.set_state(cid, ConnState::Disconnected);
            }

            EventKind::Ua => {
                self.error_indication(ev.conn, DlError::UnexpectedUa);
                self.reestablish(ev, cid, false);
            }

            EventKind::Dm => {
                self.error_indication(ev.conn, DlError::UnexpectedDm);
                self.disconnect_indication(cid);
                self.discard_queue(cid);
                self.timer_stop_t1(cid);
                self.timer_stop_t3(cid);
                self.set_state(cid, ConnState::Disconnected);
            }

            EventKind::Frmr => {
                self.error_indication(ev.conn, DlError::UnexpectedFrame);
                self.reestablish(ev, cid, false);
            }

            EventKind::DlFlowOff => {
                if !self.conns.get(cid).self_busy {
                    self.conns.get_mut(cid).self_busy = true;
                    self.send_rnr(ev, FrameType::Cmd, false);
                    self.conns.get_mut(cid).ack_pending = false;
                    self.timer_stop_t2(cid);
                }
            }

            EventKind::DlFlowOn => {
                if self.conns.get(cid).self_busy {
                    self.conns.get_mut(cid).self_busy = false;
                    self.send_rr(ev, FrameType::Cmd, true);
                    self.conns.get_mut(cid).ack_pending = false;
                    self.timer_stop_t2(cid);
                    if !self.timer_running_t1(cid) {
                        self.timer_stop_t3(cid);
                        self.timer_start_t1(cid);
                    }
                }
            }

            EventKind::DlUnitData => self.send_ui(ev),

            EventKind::Ui => {
                self.ui_check(ev);
                if ev.p {
                    self.enquiry_response(ev, cid, true);
                }
            }

            EventKind::Test => {
                if ev.ftype == FrameType::Cmd {
                    self.send_test(ev, ev.p);
                }
            }

            EventKind::Rr | EventKind::Rnr => {
                self.conns.get_mut(cid).peer_busy = ev.kind == EventKind::Rnr;
                self.check_need_for_response(ev, cid);
                let conn = self.conns.get(cid);
                if seqno_in_range_incl(conn.ack_state, ev.nr, conn.snd_state) {
                    self.check_i_frame_acked(ev, cid);
                } else {
                    self.nr_error_recovery(ev, cid);
                    self.enter_awaiting(cid);
                }
            }

            EventKind::Rej => {
                self.conns.get_mut(cid).peer_busy = false;
                self.check_need_for_response(ev, cid);
                let conn = self.conns.get(cid);
                if seqno_in_range_excl(conn.ack_state, ev.nr, conn.snd_state) {
                    self.ack_sent_frames(cid, ev.nr);
                    self.timer_stop_t1(cid);
                    self.timer_stop_t3(cid);
                    self.select_t1(cid);
                    self.invoke_retransmission(cid, ev.nr);
                } else {
                    self.nr_error_recovery(ev, cid);
                    self.enter_awaiting(cid);
                }
            }

            EventKind::Srej => {
                self.conns.get_mut(cid).peer_busy = false;
                let conn = self.conns.get(cid);
                if seqno_in_range_excl(conn.ack_state, ev.nr, conn.snd_state) {
                    let pf = if ev.ftype == FrameType::Cmd { ev.p } else { ev.f };
                    if pf {
                        self.ack_sent_frames(cid, ev.nr);
                    }
                    self.timer_stop_t1(cid);
                    self.timer_start_t3(cid);
                    self.select_t1(cid);
                    self.retransmit_one(cid, ev.nr);
                } else {
                    self.nr_error_recovery(ev, cid);
                    self.enter_awaiting(cid);
                }
            }

            EventKind::I => {
                if ev.ftype != FrameType::Cmd {
                    self.error_indication(ev.conn, DlError::UnexpectedIResponse);
                    return;
                }
                if ev.info.len() >= self.conns.get(cid).n1 {
                    self.error_indication(ev.conn, DlError::InfoTooLong);
                    self.reestablish(ev, cid, false);
                    return;
                }
                let conn = self.conns.get(cid);
                if !seqno_in_range_incl(conn.ack_state, ev.nr, conn.snd_state) {
                    self.nr_error_recovery(ev, cid);
                    self.enter_awaiting(cid);
                    return;
                }
                self.check_i_frame_acked(ev, cid);
                self.i_frame_sequence(ev, cid);
            }

            EventKind::UnknownFrame | EventKind::Xid | EventKind::LmData => {}
        }
    }

    // ========================================================================
    // State 4: Timer Recovery
    // ========================================================================

    fn dl_timer_recovery(&mut self, ev: &mut DlEvent<'_>) {
        let Some(cid) = ev.conn else { return };
        match ev.kind {
            EventKind::CtrlError => {
                self.error_indication(ev.conn, DlError::InvalidControl);
                self.reestablish_to_awaiting(ev, cid, true);
            }
            EventKind::InfoNotPermitted => {
                self.error_indication(ev.conn, DlError::UnexpectedInfo);
                self.reestablish_to_awaiting(ev, cid, true);
            }
            EventKind::IncorrectLength => {
                self.error_indication(ev.conn, DlError::IncorrectLength);
                self.reestablish_to_awaiting(ev, cid, true);
            }

            EventKind::DlConnect => {
                self.discard_queue(cid);
                self.establish_data_link(ev, cid);
                self.conns.get_mut(cid).l3_initiated = true;
                self.set_state(cid, ConnState::AwaitingConnection);
            }

            EventKind::DlDisconnect => {
                self.discard_queue(cid);
                self.conns.get_mut(cid).rc = 0;
                self.send_disc(ev, true);
                self.timer_stop_t3(cid);
                self.timer_start_t1(cid);
                self.set_state(cid, ConnState::AwaitingRelease);
            }

            EventKind::DlData => self.queue_data(cid, ev.info),

            EventKind::DrainSendQueue => self.drain_one(ev, cid),

            EventKind::TimerExpireT1 => {
                {
                    let conn = self.conns.get(cid);
                    if conn.rc != conn.n2 {
                        self.conns.get_mut(cid).rc += 1;
                        self.transmit_inquiry(ev, cid);
                        return;
                    }
                }

                let conn = self.conns.get(cid);
                let err = if conn.ack_state == conn.snd_state {
                    if conn.peer_busy {
                        DlError::RetriesExhaustedBusy
                    } else {
                        DlError::RetriesExhaustedEnquiry
                    }
                } else {
                    DlError::RetriesExhaustedData
                };
                self.error_indication(ev.conn, err);
                self.disconnect_indication(cid);
                self.discard_queue(cid);
                self.send_dm(ev, ev.f);
                self.timer_stop_t1(cid);
                self.timer_stop_t3(cid);
                self.set_state(cid, ConnState::Disconnected);
            }

            EventKind::Sabm | EventKind::Sabme => {
                self.peer_reset(ev, cid);
                self.set_state(cid, ConnState::Connected);
            }

            EventKind::Rr | EventKind::Rnr => {
                self.conns.get_mut(cid).peer_busy = ev.kind == EventKind::Rnr;

                if ev.ftype == FrameType::Res && ev.f {
                    self.timer_stop_t1(cid);
                    self.select_t1(cid);
                    let conn = self.conns.get(cid);
                    if seqno_in_range_incl(conn.ack_state, ev.nr, conn.snd_state) {
                        self.ack_sent_frames(cid, ev.nr);
                        let conn = self.conns.get(cid);
                        if conn.snd_state == conn.rcv_state {
                            self.timer_start_t3(cid);
                            self.set_state(cid, ConnState::Connected);
                        } else {
                            self.invoke_retransmission(cid, ev.nr);
                        }
                    } else {
                        self.nr_error_recovery(ev, cid);
                        self.set_state(cid, ConnState::AwaitingConnection);
                    }
                } else {
                    if ev.ftype == FrameType::Cmd && ev.p {
                        self.enquiry_response(ev, cid, true);
                    }
                    let conn = self.conns.get(cid);
                    if seqno_in_range_incl(conn.ack_state, ev.nr, conn.snd_state) {
                        self.ack_sent_frames(cid, ev.nr);
                    } else {
                        self.nr_error_recovery(ev, cid);
                        self.set_state(cid, ConnState::AwaitingConnection);
                    }
                }
            }

            EventKind::Disc => {
                self.discard_queue(cid);
                ev.f = ev.p;
                self.send_ua(ev);
                self.disconnect_indication(cid);
                self.timer_stop_t1(cid);
                self.timer_stop_t3(cid);
                self.set_state(cid, ConnState::Disconnected);
            }

            EventKind::Ua => {
                self.error_indication(ev.conn, DlError::UnexpectedUa);
                self.establish_data_link(ev, cid);
                self.conns.get_mut(cid).l3_initiated = false;
                self.set_state(cid, ConnState::AwaitingConnection);
            }

            EventKind::TimerExpireT2 => {
                if self.conns.get(cid).ack_pending {
                    self.conns.get_mut(cid).ack_pending = false;
                    self.enquiry_response(ev, cid, false);
                }
                self.timer_stop_t2(cid);
            }

            EventKind::Ui => {
                self.ui_check(ev);
                if ev.p {
                    self.enquiry_response(ev, cid, true);
                }
            }

            EventKind::Test => {
                if ev.ftype == FrameType::Cmd {
                    self.send_test(ev, ev.p);
                }
            }

            EventKind::DlUnitData => self.send_ui(ev),

            EventKind::Rej => {
                self.conns.get_mut(cid).peer_busy = false;

                if ev.ftype == FrameType::Res && ev.f {
                    self.timer_stop_t1(cid);
                    self.select_t1(cid);
                } else if ev.ftype == FrameType::Cmd && ev.p {
                    self.enquiry_response(ev, cid, true);
                }

                let conn = self.conns.get(cid);
                if !seqno_in_range_excl(conn.ack_state, ev.nr, conn.snd_state) {
                    self.nr_error_recovery(ev, cid);
                    self.set_state(cid, ConnState::AwaitingConnection);
                    return;
                }
                self.ack_sent_frames(cid, ev.nr);

                let conn = self.conns.get(cid);
                if conn.snd_state != conn.ack_state {
                    self.invoke_retransmission(cid, ev.nr);
                    return;
                }
                if ev.ftype == FrameType::Res && ev.f {
                    self.timer_start_t3(cid);
                    self.set_state(cid, ConnState::Connected);
                }
            }

            EventKind::Dm => {
                self.error_indication(ev.conn, DlError::UnexpectedDm);
                self.disconnect_indication(cid);
                self.discard_queue(cid);
                self.timer_stop_t1(cid);
                self.timer_stop_t3(cid);
                self.set_state(cid, ConnState::Disconnected);
            }

            EventKind::DlFlowOff => {
                if !self.conns.get(cid).self_busy {
                    self.conns.get_mut(cid).self_busy = true;
                    self.send_rnr(ev, FrameType::Cmd, false);
                    self.conns.get_mut(cid).ack_pending = false;
                    self.timer_stop_t2(cid);
                }
            }

            EventKind::DlFlowOn => {
                if self.conns.get(cid).self_busy {
                    self.conns.get_mut(cid).self_busy = false;
                    self.send_rr(ev, FrameType::Cmd, true);
                    self.conns.get_mut(cid).ack_pending = false;
                    self.timer_stop_t2(cid);
                    if !self.timer_running_t1(cid) {
                        self.timer_stop_t3(cid);
                        self.timer_start_t1(cid);
                    }
                }
            }

            EventKind::Frmr => {
                self.error_indication(ev.conn, DlError::UnexpectedFrame);
                self.establish_data_link(ev, cid);
                self.conns.get_mut(cid).l3_initiated = false;
                self.set_state(cid, ConnState::AwaitingConnection);
            }

            EventKind::Srej => {
                self.conns.get_mut(cid).peer_busy = false;

                if ev.ftype == FrameType::Res {
                    self.timer_stop_t1(cid);
                    self.select_t1(cid);
                }

                let conn = self.conns.get(cid);
                if !seqno_in_range_excl(conn.ack_state, ev.nr, conn.snd_state) {
                    self.nr_error_recovery(ev, cid);
                    self.set_state(cid, ConnState::AwaitingConnection);
                    return;
                }

                let pf = if ev.ftype == FrameType::Cmd { ev.p } else { ev.f };
                if pf {
                    self.ack_sent_frames(cid, ev.nr);
                }

                let conn = self.conns.get(cid);
                if conn.ack_state != conn.snd_state {
                    self.retransmit_one(cid, ev.nr);
                    return;
                }
                if ev.ftype == FrameType::Res {
                    self.timer_start_t3(cid);
                    self.set_state(cid, ConnState::Connected);
                }
            }

            EventKind::I => {
                if ev.ftype != FrameType::Cmd {
                    self.error_indication(ev.conn, DlError::UnexpectedIResponse);
                    return;
                }
                if ev.info.len() >= self.conns.get(cid).n1 {
                    self.error_indication(ev.conn, DlError::InfoTooLong);
                    self.reestablish_to_awaiting(ev, cid, false);
                    return;
                }
                let conn = self.conns.get(cid);
                if !seqno_in_range_incl(conn.ack_state, ev.nr, conn.snd_state) {
                    self.nr_error_recovery(ev, cid);
                    self.set_state(cid, ConnState::AwaitingConnection);
                    return;
                }
                // T1 is already running for the enquiry; only the
                // acknowledge state advances here.
                self.ack_sent_frames(cid, ev.nr);
                self.i_frame_sequence(ev, cid);
            }

            EventKind::TimerExpireT3
            | EventKind::UnknownFrame
            | EventKind::Xid
            | EventKind::LmData => {}
        }
    }

    // ========================================================================
    // State 5: Awaiting v2.2 Connection
    // ========================================================================

    fn dl_awaiting_connect_2_2(&mut self, ev: &mut DlEvent<'_>) {
        let Some(cid) = ev.conn else { return };
        match ev.kind {
            EventKind::DlDisconnect => {}

            EventKind::DlConnect => {
                self.discard_queue(cid);
                self.conns.get_mut(cid).l3_initiated = true;
            }

            EventKind::DlUnitData => self.send_ui(ev),

            EventKind::DlData => {
                if !self.conns.get(cid).l3_initiated {
                    self.queue_data(cid, ev.info);
                }
            }

            EventKind::DrainSendQueue => {
                if self.conns.get(cid).l3_initiated {
                    if let Some(bid) = self.conns.get_mut(cid).send_queue.pop_front() {
                        self.buffers.free(bid);
                    }
                }
            }

            EventKind::DlFlowOff
            | EventKind::DlFlowOn
            | EventKind::TimerExpireT2
            | EventKind::TimerExpireT3 => {}

            EventKind::CtrlError => self.error_indication(ev.conn, DlError::InvalidControl),
            EventKind::InfoNotPermitted => {
                self.error_indication(ev.conn, DlError::UnexpectedInfo)
            }
            EventKind::IncorrectLength => {
                self.error_indication(ev.conn, DlError::IncorrectLength)
            }

            EventKind::Ui => {
                self.ui_check(ev);
                if ev.p {
                    self.send_dm(ev, true);
                }
            }

            EventKind::Dm => {
                if !ev.f {
                    self.set_state(cid, ConnState::AwaitingConnection);
                    return;
                }
                self.discard_queue(cid);
                self.disconnect_indication(cid);
                self.timer_stop_t1(cid);
                self.timer_stop_t3(cid);
                self.set_state(cid, ConnState::Disconnected);
            }

            EventKind::Ua => {
                if !ev.f {
                    self.error_indication(ev.conn, DlError::UaWithoutFinal);
                    return;
                }

                let indicate = {
                    let conn = self.conns.get(cid);
                    conn.l3_initiated || conn.snd_state == conn.ack_state
                };
                if !indicate {
                    // Unacked data from before the reset; restart the
                    // round-trip estimate instead.
                    let conn = self.conns.get_mut(cid);
                    conn.srtt = default_srtt();
                    conn.t1v = conn.srtt * 2;
                }

                self.timer_stop_t1(cid);
                self.timer_start_t3(cid);
                self.reset_sequence_vars(cid);
                self.select_t1(cid);
                self.set_state(cid, ConnState::Connected);
                if indicate {
                    self.connect_indication(cid);
                }
            }

            EventKind::TimerExpireT1 => {
                let conn = self.conns.get(cid);
                if conn.rc == conn.n2 {
                    self.discard_queue(cid);
                    self.error_indication(ev.conn, DlError::ConnectTimeout);
                    self.disconnect_indication(cid);
                    self.timer_stop_t1(cid);
                    self.set_state(cid, ConnState::Disconnected);
                    return;
                }
                self.conns.get_mut(cid).rc += 1;
                self.send_sabme(ev, true);
                self.select_t1(cid);
                self.timer_start_t1(cid);
            }

            EventKind::Frmr => {
                // The peer does not speak v2.2; fall back to 2.0.
                {
                    let conn = self.conns.get_mut(cid);
                    conn.srtt = default_srtt();
                    conn.t1v = conn.srtt * 2;
                    conn.set_version_2_0();
                }
                self.establish_data_link(ev, cid);
                self.conns.get_mut(cid).l3_initiated = true;
                self.set_state(cid, ConnState::AwaitingConnection);
            }

            EventKind::Sabme => {
                ev.f = ev.p;
                self.send_ua(ev);
            }

            EventKind::Sabm => {
                ev.f = ev.p;
                self.send_ua(ev);
                self.set_state(cid, ConnState::AwaitingConnection);
            }

            EventKind::Disc => {
                ev.f = ev.p;
                self.send_dm(ev, ev.f);
            }

            EventKind::Test => {
                if ev.ftype == FrameType::Cmd {
                    self.send_test(ev, ev.p);
                }
            }

            EventKind::LmData
            | EventKind::I
            | EventKind::Rr
            | EventKind::Rnr
            | EventKind::Rej
            | EventKind::Srej
            | EventKind::Xid
            | EventKind::UnknownFrame => {}
        }
    }

    // ========================================================================
    // Shared sub-procedures
    // ========================================================================

    /// Reset exceptions and sequence state, then transmit SABM or SABME
    /// with P=1 and arm T1.
    fn establish_data_link(&mut self, ev: &DlEvent<'_>, cid: ConnId) {
        self.clear_exception_conditions(cid);
        self.conns.get_mut(cid).rc = 1;
        if self.conns.get(cid).modulo == 128 {
            self.conns.get_mut(cid).set_version_2_2();
            self.send_sabme(ev, true);
        } else {
            self.conns.get_mut(cid).set_version_2_0();
            self.send_sabm(ev, true);
        }
        self.timer_stop_t3(cid);
        self.timer_start_t1(cid);
    }

    fn nr_error_recovery(&mut self, ev: &DlEvent<'_>, cid: ConnId) {
        self.error_indication(ev.conn, DlError::SequenceError);
        self.establish_data_link(ev, cid);
        self.conns.get_mut(cid).l3_initiated = false;
    }

    /// The common "link hiccup" exit from the connected states: error
    /// handling already done, re-establish and pick the awaiting state
    /// for the connection's version.
    fn reestablish(&mut self, ev: &DlEvent<'_>, cid: ConnId, l3: bool) {
        if l3 {
            self.discard_queue(cid);
        }
        self.establish_data_link(ev, cid);
        self.conns.get_mut(cid).l3_initiated = l3;
        self.enter_awaiting(cid);
    }

    /// As [`Node::reestablish`], but always lands in Awaiting-Connection
    /// (the timer-recovery exits do not branch on version).
    fn reestablish_to_awaiting(&mut self, ev: &DlEvent<'_>, cid: ConnId, l3: bool) {
        if l3 {
            self.discard_queue(cid);
        }
        self.establish_data_link(ev, cid);
        self.conns.get_mut(cid).l3_initiated = l3;
        self.set_state(cid, ConnState::AwaitingConnection);
    }

    fn enter_awaiting(&mut self, cid: ConnId) {
        let state = if self.conns.get(cid).version == Version::V2_2 {
            ConnState::AwaitingConnect22
        } else {
            ConnState::AwaitingConnection
        };
        self.set_state(cid, state);
    }

    /// Inbound SABM(E) on a live connection: the peer reset the link.
    fn peer_reset(&mut self, ev: &mut DlEvent<'_>, cid: ConnId) {
        if ev.kind == EventKind::Sabm {
            self.conns.get_mut(cid).set_version_2_0();
        } else {
            self.conns.get_mut(cid).set_version_2_2();
        }
        ev.f = ev.p;
        self.send_ua(ev);
        self.clear_exception_conditions(cid);
        self.error_indication(ev.conn, DlError::LinkReset);
        let unacked = {
            let conn = self.conns.get(cid);
            conn.snd_state != conn.ack_state
        };
        if unacked {
            self.discard_queue(cid);
            self.connect_indication(cid);
        }
        self.timer_stop_t1(cid);
        self.timer_start_t3(cid);
        self.reset_sequence_vars(cid);
    }

    /// Send RR or RNR as a command with P=1 and restart T1.
    fn transmit_inquiry(&mut self, ev: &DlEvent<'_>, cid: ConnId) {
        if self.conns.get(cid).self_busy {
            self.send_rnr(ev, FrameType::Cmd, true);
        } else {
            self.send_rr(ev, FrameType::Cmd, true);
        }
        self.conns.get_mut(cid).ack_pending = false;
        self.timer_start_t1(cid);
        self.timer_stop_t2(cid);
    }

    /// Send RR or RNR as a response with the given F bit.
    fn enquiry_response(&mut self, ev: &DlEvent<'_>, cid: ConnId, f: bool) {
        if self.conns.get(cid).self_busy {
            self.send_rnr(ev, FrameType::Res, f);
        } else {
            self.send_rr(ev, FrameType::Res, f);
        }
        self.conns.get_mut(cid).ack_pending = false;
        self.timer_stop_t2(cid);
    }

    fn check_need_for_response(&mut self, ev: &DlEvent<'_>, cid: ConnId) {
        if ev.ftype == FrameType::Cmd && ev.p {
            self.enquiry_response(ev, cid, true);
        } else if ev.ftype == FrameType::Res && ev.f {
            self.error_indication(ev.conn, DlError::UnexpectedFinal);
        }
    }

    /// Advance V(A) to `nr`, returning the acknowledged retransmission
    /// copies to the packet pool.
    fn ack_sent_frames(&mut self, cid: ConnId, nr: u8) {
        let modulo = self.conns.get(cid).modulo;
        let mut va = self.conns.get(cid).ack_state;
        while va != nr {
            if let Some(pkid) = self.conns.get_mut(cid).sent_buffer[va as usize].take() {
                self.packets.free(pkid);
            }
            va = (va + 1) % modulo;
        }
        self.conns.get_mut(cid).ack_state = nr;
    }

    fn check_i_frame_acked(&mut self, ev: &DlEvent<'_>, cid: ConnId) {
        let (peer_busy, snd_state, ack_state) = {
            let conn = self.conns.get(cid);
            (conn.peer_busy, conn.snd_state, conn.ack_state)
        };
        if peer_busy {
            self.ack_sent_frames(cid, ev.nr);
            if !self.timer_running_t1(cid) {
                self.timer_start_t1(cid);
            }
        } else if ev.nr == snd_state {
            self.ack_sent_frames(cid, ev.nr);
            self.timer_stop_t1(cid);
            self.timer_stop_t2(cid);
            self.timer_stop_t3(cid);
            self.select_t1(cid);
        } else if ev.nr != ack_state {
            self.ack_sent_frames(cid, ev.nr);
            self.timer_start_t1(cid);
        }
    }

    /// Recompute the smoothed round-trip time and the next T1 interval.
    fn select_t1(&mut self, cid: ConnId) {
        let conn = self.conns.get_mut(cid);
        if conn.rc == 0 {
            let srtt = (conn.srtt * 7 + conn.t1v - conn.t1_remaining) / 8;
            conn.srtt = srtt;
            conn.t1v = srtt * 2;
        } else if conn.t1_expired {
            conn.t1v = conn.srtt * (1i64 << (conn.rc as u32 + 1));
        }
    }

    /// Back V(S) up to `nr` and push every frame in between to the radio
    /// again, in order.
    fn invoke_retransmission(&mut self, cid: ConnId, nr: u8) {
        let modulo = self.conns.get(cid).modulo;
        let x = self.conns.get(cid).snd_state;
        let mut vs = nr;
        while vs != x {
            self.retransmit_one(cid, vs);
            vs = (vs + 1) % modulo;
        }
    }

    fn retransmit_one(&mut self, cid: ConnId, ns: u8) {
        if let Some(pkid) = self.conns.get(cid).sent_buffer[ns as usize] {
            self.transmit(pkid);
        }
    }

    /// Shared I-frame receive path after the N(R) bookkeeping: busy
    /// discard, in-sequence delivery with resequencing-queue drain, and
    /// the REJ/SREJ recovery replies.
    fn i_frame_sequence(&mut self, ev: &mut DlEvent<'_>, cid: ConnId) {
        if self.conns.get(cid).self_busy {
            // Own receiver busy: the payload is dropped.
            if ev.p {
                ev.f = true;
                self.send_rnr(ev, FrameType::Res, true);
                self.conns.get_mut(cid).ack_pending = false;
                self.timer_stop_t2(cid);
            }
            return;
        }

        let modulo = self.conns.get(cid).modulo;

        if ev.ns == self.conns.get(cid).rcv_state {
            {
                let conn = self.conns.get_mut(cid);
                conn.rcv_state = (conn.rcv_state + 1) % modulo;
                conn.rej_exception = false;
            }
            self.data_indication(cid, ev.info);

            // Frames queued behind the gap are now in sequence.
            loop {
                let vr = self.conns.get(cid).rcv_state;
                let Some(bid) = self.conns.get_mut(cid).srej_queue[vr as usize].take() else {
                    break;
                };
                let payload = self.buffers.get(bid).bytes().to_vec();
                self.buffers.free(bid);
                {
                    let conn = self.conns.get_mut(cid);
                    conn.srej_exception = conn.srej_exception.saturating_sub(1);
                    conn.rcv_state = (vr + 1) % modulo;
                }
                self.data_indication(cid, &payload);
            }

            if ev.p {
                ev.f = true;
                self.send_rr(ev, FrameType::Res, true);
                self.conns.get_mut(cid).ack_pending = false;
                self.timer_stop_t2(cid);
            } else if !self.conns.get(cid).ack_pending {
                self.conns.get_mut(cid).ack_pending = true;
                self.timer_start_t2(cid);
            }
            return;
        }

        if self.conns.get(cid).rej_exception {
            // Already asked for the retransmission; discard the payload.
            if ev.p {
                ev.f = true;
                self.send_rr(ev, FrameType::Res, true);
                self.conns.get_mut(cid).ack_pending = false;
                self.timer_stop_t2(cid);
            }
            return;
        }

        if !self.conns.get(cid).srej_enabled {
            self.conns.get_mut(cid).rej_exception = true;
            ev.f = ev.p;
            self.send_rej(ev, FrameType::Res, ev.f);
            self.conns.get_mut(cid).ack_pending = false;
            self.timer_stop_t2(cid);
            return;
        }

        if self.conns.get(cid).srej_exception > 0 {
            // Another gap while one is already outstanding.
            if self.store_out_of_order(cid, ev.ns, ev.info) {
                self.conns.get_mut(cid).srej_exception += 1;
                let vr = self.conns.get(cid).rcv_state;
                self.send_srej(ev, FrameType::Res, false, vr);
                self.conns.get_mut(cid).ack_pending = false;
                self.timer_stop_t2(cid);
            }
            return;
        }

        if ev.ns == (self.conns.get(cid).rcv_state + 1) % modulo {
            // Exactly one frame missing: selective reject fits.
            if self.store_out_of_order(cid, ev.ns, ev.info) {
                self.conns.get_mut(cid).srej_exception += 1;
                let vr = self.conns.get(cid).rcv_state;
                self.send_srej(ev, FrameType::Res, true, vr);
                self.conns.get_mut(cid).ack_pending = false;
                self.timer_stop_t2(cid);
            }
            return;
        }

        // Two or more frames missing: give up and use REJ (6.4.4.3).
        self.conns.get_mut(cid).rej_exception = true;
        ev.f = ev.p;
        self.send_rej(ev, FrameType::Res, ev.f);
        self.conns.get_mut(cid).ack_pending = false;
        self.timer_stop_t2(cid);
    }

    /// Park an out-of-order payload in the resequencing queue. Returns
    /// false (frame treated as lost) when the buffer pool is exhausted.
    fn store_out_of_order(&mut self, cid: ConnId, ns: u8, info: &[u8]) -> bool {
        let Some(bid) = self.buffers.allocate(info) else {
            self.counters.no_buffers += 1;
            return false;
        };
        if let Some(old) = self.conns.get_mut(cid).srej_queue[ns as usize].replace(bid) {
            self.buffers.free(old);
            let conn = self.conns.get_mut(cid);
            conn.srej_exception = conn.srej_exception.saturating_sub(1);
        }
        true
    }

    fn ui_check(&mut self, ev: &DlEvent<'_>) {
        if ev.ftype == FrameType::Cmd {
            let n1 = ev.conn.map_or(MAX_PACKET_SIZE, |c| self.conns.get(c).n1);
            if ev.info.len() < n1 {
                if let Some(sid) = ev.socket {
                    self.deliver_data(sid, ev.info);
                } else {
                    debug!("ignoring unconnected data: no listener");
                }
            } else {
                self.error_indication(ev.conn, DlError::IncorrectLength);
            }
        } else {
            self.error_indication(ev.conn, DlError::UiViolation);
        }
    }

    // ========================================================================
    // Queues and state transitions
    // ========================================================================

    fn queue_data(&mut self, cid: ConnId, info: &[u8]) {
        let Some(bid) = self.buffers.allocate(info) else {
            self.counters.no_buffers += 1;
            return;
        };
        self.conns.get_mut(cid).send_queue.push_back(bid);
    }

    fn discard_queue(&mut self, cid: ConnId) {
        while let Some(bid) = self.conns.get_mut(cid).send_queue.pop_front() {
            self.buffers.free(bid);
        }
    }

    /// Pop one payload off the send queue and transmit it as an I frame,
    /// respecting the window and the peer's busy condition.
    fn drain_one(&mut self, ev: &DlEvent<'_>, cid: ConnId) {
        {
            let conn = self.conns.get(cid);
            if conn.peer_busy
                || conn.snd_state == (conn.ack_state + conn.window_size) % conn.modulo
            {
                return;
            }
        }
        let Some(bid) = self.conns.get_mut(cid).send_queue.pop_front() else {
            return;
        };
        let Some(pkid) = self.packets.allocate() else {
            self.counters.no_packets += 1;
            self.conns.get_mut(cid).send_queue.push_front(bid);
            return;
        };

        let (ns, built) = {
            let conn = self.conns.get(cid);
            let ns = conn.snd_state;
            let nr = conn.rcv_state;
            let buf = self.buffers.get(bid);
            let pkt = self.packets.get_mut(pkid);
            let built = frame::build_i(pkt, ev, conn, false, nr, ns, ev.pid, buf.bytes());
            (ns, built)
        };

        match built {
            Ok(()) => {
                self.transmit(pkid);
                self.buffers.free(bid);
                if let Some(old) = self.conns.get_mut(cid).sent_buffer[ns as usize].replace(pkid)
                {
                    self.packets.free(old);
                }
                {
                    let conn = self.conns.get_mut(cid);
                    conn.snd_state = (conn.snd_state + 1) % conn.modulo;
                    conn.ack_pending = false;
                }
                self.timer_stop_t2(cid);
                if !self.timer_running_t1(cid) {
                    self.timer_stop_t3(cid);
                    self.timer_start_t1(cid);
                }
            }
            Err(_) => {
                // The payload cannot fit in a frame; it can never succeed.
                debug!("dropping oversized I-frame payload");
                self.packets.free(pkid);
                self.buffers.free(bid);
            }
        }
    }

    /// Zero the sequence variables and drop the per-sequence stores that
    /// key off them.
    fn reset_sequence_vars(&mut self, cid: ConnId) {
        for i in 0..MAX_WINDOW {
            if let Some(bid) = self.conns.get_mut(cid).srej_queue[i].take() {
                self.buffers.free(bid);
            }
            if let Some(pkid) = self.conns.get_mut(cid).sent_buffer[i].take() {
                self.packets.free(pkid);
            }
        }
        let conn = self.conns.get_mut(cid);
        conn.snd_state = 0;
        conn.ack_state = 0;
        conn.rcv_state = 0;
        conn.srej_exception = 0;
    }

    fn clear_exception_conditions(&mut self, cid: ConnId) {
        for i in 0..MAX_WINDOW {
            if let Some(bid) = self.conns.get_mut(cid).srej_queue[i].take() {
                self.buffers.free(bid);
            }
        }
        let conn = self.conns.get_mut(cid);
        conn.peer_busy = false;
        conn.rej_exception = false;
        conn.self_busy = false;
        conn.ack_pending = false;
        conn.srej_exception = 0;
    }

    /// Change connection state. Entering Disconnected releases the
    /// socket, returns all held pool slots and frees the table entry.
    fn set_state(&mut self, cid: ConnId, state: ConnState) {
        self.conns.get_mut(cid).state = state;
        if state == ConnState::Disconnected {
            if let Some(sid) = self.conns.get_mut(cid).socket.take() {
                self.sockets.free(sid);
            }
            self.discard_queue(cid);
            for i in 0..MAX_WINDOW {
                if let Some(bid) = self.conns.get_mut(cid).srej_queue[i].take() {
                    self.buffers.free(bid);
                }
                if let Some(pkid) = self.conns.get_mut(cid).sent_buffer[i].take() {
                    self.packets.free(pkid);
                }
            }
            // T2 is a response delay; it never outlives the connection.
            self.conns.get_mut(cid).t2_expiry = Instant::ZERO;
            self.conns.release(cid);
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn timer_running_t1(&self, cid: ConnId) -> bool {
        !self.conns.get(cid).t1_expiry.is_zero()
    }

    fn timer_start_t1(&mut self, cid: ConnId) {
        let now = self.now();
        let conn = self.conns.get_mut(cid);
        conn.t1_expiry = now + conn.t1v;
        conn.t1_expired = false;
    }

    fn timer_stop_t1(&mut self, cid: ConnId) {
        let now = self.now();
        let conn = self.conns.get_mut(cid);
        conn.t1_remaining = if conn.t1_expiry.is_zero() {
            Duration::ZERO
        } else {
            (conn.t1_expiry - now).max_zero()
        };
        conn.t1_expiry = Instant::ZERO;
        conn.t1_expired = false;
    }

    fn timer_start_t2(&mut self, cid: ConnId) {
        let now = self.now();
        let conn = self.conns.get_mut(cid);
        conn.t2_expiry = now + conn.t2;
    }

    fn timer_stop_t2(&mut self, cid: ConnId) {
        self.conns.get_mut(cid).t2_expiry = Instant::ZERO;
    }

    fn timer_start_t3(&mut self, cid: ConnId) {
        let now = self.now();
        self.conns.get_mut(cid).t3_expiry = now + Duration::minutes(T3_DURATION_MINUTES);
    }

    fn timer_stop_t3(&mut self, cid: ConnId) {
        self.conns.get_mut(cid).t3_expiry = Instant::ZERO;
    }

    // ========================================================================
    // Indications (core -> user callbacks)
    // ========================================================================

    pub(crate) fn connect_indication(&mut self, cid: ConnId) {
        let Some(sid) = self.conns.get(cid).socket else {
            return;
        };
        let cb = self.sockets.get(sid).on_connect.clone();
        if let Some(cb) = cb {
            cb(self, sid);
        }
    }

    pub(crate) fn data_indication(&mut self, cid: ConnId, data: &[u8]) {
        let Some(sid) = self.conns.get(cid).socket else {
            return;
        };
        self.deliver_data(sid, data);
    }

    /// Invoke a socket's `on_data`. The slot is taken for the duration of
    /// the call so the callback may re-enter the node; a replacement
    /// installed from inside the callback wins.
    pub(crate) fn deliver_data(&mut self, sid: SocketId, data: &[u8]) {
        let Some(mut cb) = self.sockets.get_mut(sid).on_data.take() else {
            return;
        };
        cb(self, sid, data);
        let slot = &mut self.sockets.get_mut(sid).on_data;
        if slot.is_none() {
            *slot = Some(cb);
        }
    }

    pub(crate) fn disconnect_indication(&mut self, cid: ConnId) {
        let Some(sid) = self.conns.get(cid).socket else {
            return;
        };
        let Some(mut cb) = self.sockets.get_mut(sid).on_disconnect.take() else {
            return;
        };
        cb(self, sid);
        let slot = &mut self.sockets.get_mut(sid).on_disconnect;
        if slot.is_none() {
            *slot = Some(cb);
        }
    }

    pub(crate) fn error_indication(&mut self, conn: Option<ConnId>, err: DlError) {
        debug!(error = %err, letter = ?err.letter(), "error indication");
        let Some(cid) = conn else { return };
        let Some(sid) = self.conns.get(cid).socket else {
            return;
        };
        let Some(mut cb) = self.sockets.get_mut(sid).on_error.take() else {
            return;
        };
        cb(self, sid, err);
        let slot = &mut self.sockets.get_mut(sid).on_error;
        if slot.is_none() {
            *slot = Some(cb);
        }
    }

    // ========================================================================
    // Frame transmission
    // ========================================================================

    fn transmit(&mut self, pkid: PacketId) {
        let pkt = self.packets.get(pkid);
        self.kiss.xmit(pkt.port, pkt.bytes(), &mut self.counters);
    }

    /// Build a frame into a fresh pool packet, transmit it, and return
    /// the slot. Drops the frame (counted) on pool exhaustion.
    fn send_frame(&mut self, build: impl FnOnce(&mut Self, PacketId) -> bool) {
        let Some(pkid) = self.packets.allocate() else {
            self.counters.no_packets += 1;
            return;
        };
        if build(self, pkid) {
            self.transmit(pkid);
        }
        self.packets.free(pkid);
    }

    fn send_u_frame(
        &mut self,
        ev: &DlEvent<'_>,
        cmd: u8,
        ftype: FrameType,
        p: bool,
        f: bool,
        info: UInfo<'_>,
    ) {
        self.send_frame(|node, pkid| {
            let conn = ev.conn.map(|c| node.conns.get(c));
            let pkt = node.packets.get_mut(pkid);
            frame::build_u(pkt, ev, conn, ftype, cmd, p, f, info).is_ok()
        });
    }

    fn send_s_frame(&mut self, ev: &DlEvent<'_>, cmd: u8, ftype: FrameType, pf: bool, nr: u8) {
        let Some(cid) = ev.conn else { return };
        self.send_frame(|node, pkid| {
            let conn = node.conns.get(cid);
            let pkt = node.packets.get_mut(pkid);
            frame::build_s(pkt, ev, conn, ftype, cmd, pf, nr).is_ok()
        });
    }

    fn send_dm(&mut self, ev: &DlEvent<'_>, f: bool) {
        self.send_u_frame(ev, frame::U_DM, FrameType::Res, ev.p, f, UInfo::None);
    }

    fn send_ua(&mut self, ev: &DlEvent<'_>) {
        self.send_u_frame(ev, frame::U_UA, FrameType::Res, ev.p, ev.f, UInfo::None);
    }

    fn send_sabm(&mut self, ev: &DlEvent<'_>, p: bool) {
        self.send_u_frame(ev, frame::U_SABM, FrameType::Cmd, p, false, UInfo::None);
    }

    fn send_sabme(&mut self, ev: &DlEvent<'_>, p: bool) {
        self.send_u_frame(ev, frame::U_SABME, FrameType::Cmd, p, false, UInfo::None);
    }

    fn send_disc(&mut self, ev: &DlEvent<'_>, p: bool) {
        self.send_u_frame(ev, frame::U_DISC, FrameType::Cmd, p, false, UInfo::None);
    }

    fn send_ui(&mut self, ev: &DlEvent<'_>) {
        self.send_u_frame(
            ev,
            frame::U_UI,
            FrameType::Cmd,
            ev.p,
            false,
            UInfo::Pid(ev.pid, ev.info),
        );
    }

    fn send_test(&mut self, ev: &DlEvent<'_>, f: bool) {
        self.send_u_frame(
            ev,
            frame::U_TEST,
            FrameType::Res,
            ev.p,
            f,
            UInfo::Raw(ev.info),
        );
    }

    fn send_rr(&mut self, ev: &DlEvent<'_>, ftype: FrameType, pf: bool) {
        let nr = ev.conn.map_or(0, |c| self.conns.get(c).rcv_state);
        self.send_s_frame(ev, frame::S_RR, ftype, pf, nr);
    }

    fn send_rnr(&mut self, ev: &DlEvent<'_>, ftype: FrameType, pf: bool) {
        let nr = ev.conn.map_or(0, |c| self.conns.get(c).rcv_state);
        self.send_s_frame(ev, frame::S_RNR, ftype, pf, nr);
    }

    fn send_rej(&mut self, ev: &DlEvent<'_>, ftype: FrameType, pf: bool) {
        let nr = ev.conn.map_or(0, |c| self.conns.get(c).rcv_state);
        self.send_s_frame(ev, frame::S_REJ, ftype, pf, nr);
    }

    fn send_srej(&mut self, ev: &DlEvent<'_>, ftype: FrameType, pf: bool, nr: u8) {
        self.send_s_frame(ev, frame::S_SREJ, ftype, pf, nr);
    }
}
