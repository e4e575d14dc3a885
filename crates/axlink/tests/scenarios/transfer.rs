//! Data transfer: windowing, acknowledgement, flow control, timer
//! recovery.

use axlink::ax25::frame::{S_RR, U_SABM, U_UA};
use axlink::ax25::{ConnState, Duration, EventKind, FrameType};

use crate::common::*;

#[test]
fn test_retransmission_after_lost_ack() {
    let (mut node, clock, obs) = listening_node(true);

    ingress(&mut node, &u_cmd(U_SABM, true));
    egress(&mut node, false);
    let sock = obs.socket.get().unwrap();

    // Exchange one frame; the echo goes out but the peer's RR is "lost".
    ingress(&mut node, &i_frame8(0, 0, false, b"hi"));
    node.tick();
    let out = egress(&mut node, false);
    assert_eq!(out[0].kind, EventKind::I);

    // T1 fires: the node enters timer recovery and polls with RR P=1.
    advance(&clock, Duration::seconds(30));
    node.tick();
    let out = egress(&mut node, false);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::Rr);
    assert_eq!(out[0].ftype, FrameType::Cmd);
    assert!(out[0].pf);
    assert_eq!(out[0].nr, 1);
    assert_eq!(
        node.connection_snapshot(sock).unwrap().state,
        ConnState::TimerRecovery
    );

    // The peer answers the poll: everything was received after all.
    ingress(&mut node, &s_frame8(S_RR, 1, true, false));
    let snap = node.connection_snapshot(sock).unwrap();
    assert_eq!(snap.state, ConnState::Connected);
    assert_eq!(snap.ack_state, 1);
    assert!(obs.errors.borrow().is_empty());
}

#[test]
fn test_window_limits_outstanding_frames() {
    let (mut node, _clock) = test_node();
    let sock = node.connect(peer(), local(), 0).unwrap();
    egress(&mut node, false);
    ingress(&mut node, &u_res(U_UA, true));

    for i in 0..6u8 {
        node.send(sock, &[b'm', b'0' + i]).unwrap();
    }
    node.tick();

    // v2.0 window is 4: the last two payloads stay queued.
    let out = egress(&mut node, false);
    let sent: Vec<u8> = out
        .iter()
        .filter(|f| f.kind == EventKind::I)
        .map(|f| f.ns)
        .collect();
    assert_eq!(sent, [0, 1, 2, 3]);

    // Acknowledging the window lets the rest flow.
    ingress(&mut node, &s_frame8(S_RR, 4, false, false));
    node.tick();
    let out = egress(&mut node, false);
    let sent: Vec<u8> = out
        .iter()
        .filter(|f| f.kind == EventKind::I)
        .map(|f| f.ns)
        .collect();
    assert_eq!(sent, [4, 5]);

    let snap = node.connection_snapshot(sock).unwrap();
    assert_eq!(snap.snd_state, 6);
    assert_eq!(snap.ack_state, 4);
}

#[test]
fn test_flow_control() {
    let (mut node, _clock, obs) = listening_node(false);
    ingress(&mut node, &u_cmd(U_SABM, true));
    egress(&mut node, false);
    let sock = obs.socket.get().unwrap();

    node.flow_off(sock).unwrap();
    let out = egress(&mut node, false);
    assert_eq!(out[0].kind, EventKind::Rnr);
    assert_eq!(out[0].ftype, FrameType::Cmd);

    // Busy receiver: the payload is discarded, and a poll is answered
    // with RNR F=1.
    ingress(&mut node, &i_frame8(0, 0, true, b"dropped"));
    assert!(obs.data.borrow().is_empty());
    let out = egress(&mut node, false);
    assert_eq!(out[0].kind, EventKind::Rnr);
    assert_eq!(out[0].ftype, FrameType::Res);
    assert!(out[0].pf);

    node.flow_on(sock).unwrap();
    let out = egress(&mut node, false);
    assert_eq!(out[0].kind, EventKind::Rr);
    assert_eq!(out[0].ftype, FrameType::Cmd);
    assert!(out[0].pf);

    // Delivery resumes.
    ingress(&mut node, &i_frame8(0, 0, false, b"kept"));
    assert_eq!(obs.data.borrow().as_slice(), &[b"kept".to_vec()]);
}

#[test]
fn test_t2_delays_the_acknowledgement() {
    let (mut node, clock, obs) = listening_node(false);
    ingress(&mut node, &u_cmd(U_SABM, true));
    egress(&mut node, false);
    let _ = obs;

    // No immediate response to an I frame without P.
    ingress(&mut node, &i_frame8(0, 0, false, b"one"));
    assert!(egress(&mut node, false).is_empty());

    // T2 expiry produces the delayed RR with F=0.
    advance(&clock, Duration::seconds(4));
    node.tick();
    let out = egress(&mut node, false);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::Rr);
    assert_eq!(out[0].ftype, FrameType::Res);
    assert!(!out[0].pf);
    assert_eq!(out[0].nr, 1);
}

#[test]
fn test_polled_i_frame_is_acked_immediately() {
    let (mut node, _clock, _obs) = listening_node(false);
    ingress(&mut node, &u_cmd(U_SABM, true));
    egress(&mut node, false);

    ingress(&mut node, &i_frame8(0, 0, true, b"urgent"));
    let out = egress(&mut node, false);
    assert_eq!(out[0].kind, EventKind::Rr);
    assert_eq!(out[0].ftype, FrameType::Res);
    assert!(out[0].pf);
    assert_eq!(out[0].nr, 1);
}

#[test]
fn test_keepalive_poll_after_idle() {
    let (mut node, clock, obs) = listening_node(false);
    ingress(&mut node, &u_cmd(U_SABM, true));
    egress(&mut node, false);
    let sock = obs.socket.get().unwrap();

    // T3 fires after fifteen idle minutes and the node polls the peer.
    advance(&clock, Duration::minutes(16));
    node.tick();
    let out = egress(&mut node, false);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::Rr);
    assert_eq!(out[0].ftype, FrameType::Cmd);
    assert!(out[0].pf);
    assert_eq!(
        node.connection_snapshot(sock).unwrap().state,
        ConnState::TimerRecovery
    );

    // The peer is still there.
    ingress(&mut node, &s_frame8(S_RR, 0, true, false));
    assert_eq!(
        node.connection_snapshot(sock).unwrap().state,
        ConnState::Connected
    );
}
