//! Error recovery: REJ, SREJ, sequence errors, retry exhaustion.

use axlink::ax25::frame::{U_SABM, U_SABME};
use axlink::ax25::{ConnState, DlError, Duration, EventKind, FrameType};

use crate::common::*;

#[test]
fn test_out_of_window_nr_recovers() {
    let (mut node, _clock, obs) = listening_node(false);
    ingress(&mut node, &u_cmd(U_SABM, true));
    egress(&mut node, false);
    let sock = obs.socket.get().unwrap();

    // Nothing has been sent, so any N(R) but 0 acknowledges frames that
    // do not exist.
    ingress(&mut node, &i_frame8(0, 2, false, b"bad"));

    assert!(obs.errors.borrow().contains(&DlError::SequenceError));
    let out = egress(&mut node, false);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::Sabm);
    assert!(out[0].pf);
    assert_eq!(
        node.connection_snapshot(sock).unwrap().state,
        ConnState::AwaitingConnection
    );
}

#[test]
fn test_rej_on_sequence_gap_v20() {
    let (mut node, _clock, obs) = listening_node(false);
    ingress(&mut node, &u_cmd(U_SABM, true));
    egress(&mut node, false);

    ingress(&mut node, &i_frame8(0, 0, false, b"a"));
    egress(&mut node, false);

    // Frame 1 lost; 2 arrives out of order. v2.0 has no SREJ.
    ingress(&mut node, &i_frame8(2, 0, false, b"c"));
    let out = egress(&mut node, false);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::Rej);
    assert_eq!(out[0].ftype, FrameType::Res);
    assert_eq!(out[0].nr, 1);

    // Further out-of-order frames are discarded without another REJ.
    ingress(&mut node, &i_frame8(3, 0, false, b"d"));
    assert!(egress(&mut node, false).is_empty());

    // The retransmission starting at the gap is accepted in order.
    ingress(&mut node, &i_frame8(1, 0, false, b"b"));
    ingress(&mut node, &i_frame8(2, 0, false, b"c"));
    assert_eq!(
        obs.data.borrow().as_slice(),
        &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );
}

#[test]
fn test_srej_fills_single_gap_v22() {
    let (mut node, _clock, obs) = listening_node(false);
    ingress(&mut node, &u_cmd(U_SABME, true));
    egress(&mut node, true);

    ingress(&mut node, &i_frame128(0, 0, false, b"a"));
    egress(&mut node, true);

    // Exactly one frame missing: selective reject asks for just it.
    ingress(&mut node, &i_frame128(2, 0, false, b"c"));
    let out = egress(&mut node, true);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::Srej);
    assert!(out[0].pf);
    assert_eq!(out[0].nr, 1);

    // The retransmitted gap releases the queued frame too, in order.
    ingress(&mut node, &i_frame128(1, 0, false, b"b"));
    assert_eq!(
        obs.data.borrow().as_slice(),
        &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );

    let snap = node.connection_snapshot(obs.socket.get().unwrap()).unwrap();
    assert_eq!(snap.rcv_state, 3);
    assert_eq!(snap.state, ConnState::Connected);
}

#[test]
fn test_srej_falls_back_to_rej_on_wider_gap_v22() {
    let (mut node, _clock, _obs) = listening_node(false);
    ingress(&mut node, &u_cmd(U_SABME, true));
    egress(&mut node, true);

    ingress(&mut node, &i_frame128(0, 0, false, b"a"));
    egress(&mut node, true);

    // Two or more frames missing: give up on SREJ.
    ingress(&mut node, &i_frame128(3, 0, false, b"d"));
    let out = egress(&mut node, true);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::Rej);
    assert_eq!(out[0].nr, 1);
}

#[test]
fn test_i_frame_at_n1_rejected() {
    let (mut node, _clock, obs) = listening_node(false);
    ingress(&mut node, &u_cmd(U_SABM, true));
    egress(&mut node, false);

    // One byte under the limit is fine.
    let payload = vec![b'x'; 2047];
    ingress(&mut node, &i_frame8(0, 0, false, &payload));
    assert_eq!(obs.data.borrow().len(), 1);
    assert_eq!(obs.data.borrow()[0].len(), 2047);
    egress(&mut node, false);

    // At the limit the link is torn down and re-established.
    let payload = vec![b'x'; 2048];
    ingress(&mut node, &i_frame8(1, 0, false, &payload));
    assert!(obs.errors.borrow().contains(&DlError::InfoTooLong));
    let out = egress(&mut node, false);
    assert_eq!(out.last().unwrap().kind, EventKind::Sabm);
    assert_eq!(
        node.connection_snapshot(obs.socket.get().unwrap())
            .unwrap()
            .state,
        ConnState::AwaitingConnection
    );
}

#[test]
fn test_retry_exhaustion_with_unacked_data() {
    let (mut node, clock, obs) = listening_node(true);
    ingress(&mut node, &u_cmd(U_SABM, true));
    egress(&mut node, false);
    let sock = obs.socket.get().unwrap();

    // Echoed data that is never acknowledged.
    ingress(&mut node, &i_frame8(0, 0, false, b"hi"));
    node.tick();
    egress(&mut node, false);

    let mut polls = 0;
    let mut dm_seen = false;
    for _ in 0..15 {
        advance(&clock, Duration::minutes(60));
        node.tick();
        for f in egress(&mut node, false) {
            match f.kind {
                EventKind::Rr => polls += 1,
                EventKind::Dm => dm_seen = true,
                other => panic!("unexpected frame {other}"),
            }
        }
        if node.connection_snapshot(sock).is_none() {
            break;
        }
    }

    // One poll entering timer recovery, nine more retries, then DM.
    assert_eq!(polls, 10);
    assert!(dm_seen);
    assert!(
        obs.errors
            .borrow()
            .contains(&DlError::RetriesExhaustedData)
    );
    assert_eq!(obs.disconnected.get(), 1);
    assert!(node.connection_snapshot(sock).is_none());
}

#[test]
fn test_rej_triggers_retransmission() {
    let (mut node, _clock) = test_node();
    let sock = node.connect(peer(), local(), 0).unwrap();
    egress(&mut node, false);
    ingress(&mut node, &u_res(axlink::ax25::frame::U_UA, true));

    node.send(sock, b"one").unwrap();
    node.send(sock, b"two").unwrap();
    node.send(sock, b"three").unwrap();
    node.tick();
    let out = egress(&mut node, false);
    assert_eq!(out.len(), 3);

    // The peer got frame 0 but not 1: REJ backs V(S) up and everything
    // from 1 goes out again.
    ingress(&mut node, &s_frame8(axlink::ax25::frame::S_REJ, 1, false, false));
    let out = egress(&mut node, false);
    let resent: Vec<(u8, Vec<u8>)> = out
        .iter()
        .filter(|f| f.kind == EventKind::I)
        .map(|f| (f.ns, f.info.clone()))
        .collect();
    assert_eq!(resent, [(1, b"two".to_vec()), (2, b"three".to_vec())]);

    let snap = node.connection_snapshot(sock).unwrap();
    assert_eq!(snap.ack_state, 1);
    assert_eq!(snap.snd_state, 3);
}

#[test]
fn test_srej_retransmits_single_frame() {
    let (mut node, _clock) = test_node();
    let sock = node.connect_extended(peer(), local(), 0).unwrap();
    egress(&mut node, true);
    ingress(&mut node, &u_res(axlink::ax25::frame::U_UA, true));

    node.send(sock, b"one").unwrap();
    node.send(sock, b"two").unwrap();
    node.send(sock, b"three").unwrap();
    node.tick();
    assert_eq!(egress(&mut node, true).len(), 3);

    // SREJ for just the middle frame.
    ingress(&mut node, &s_frame128(axlink::ax25::frame::S_SREJ, 1, false, false));
    let out = egress(&mut node, true);
    let resent: Vec<(u8, Vec<u8>)> = out
        .iter()
        .filter(|f| f.kind == EventKind::I)
        .map(|f| (f.ns, f.info.clone()))
        .collect();
    assert_eq!(resent, [(1, b"two".to_vec())]);
}
