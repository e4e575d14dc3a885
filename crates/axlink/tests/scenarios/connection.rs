//! Connection establishment and release.

use axlink::ax25::frame::{U_DISC, U_SABM, U_SABME, U_UA};
use axlink::ax25::{ConnState, DlError, Duration, EventKind, FrameType, Version};

use crate::common::*;

#[test]
fn test_inbound_connect_and_echo() {
    let (mut node, _clock, obs) = listening_node(true);

    // Peer opens the link.
    ingress(&mut node, &u_cmd(U_SABM, true));
    let out = egress(&mut node, false);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::Ua);
    assert_eq!(out[0].ftype, FrameType::Res);
    assert!(out[0].pf);
    assert_eq!(out[0].dst.to_string(), PEER);
    assert_eq!(out[0].src.to_string(), LOCAL);
    assert_eq!(obs.connected.get(), 1);

    let sock = obs.socket.get().unwrap();
    let snap = node.connection_snapshot(sock).unwrap();
    assert_eq!(snap.state, ConnState::Connected);
    assert_eq!(snap.version, Version::V2_0);

    // Peer sends "hi"; the handler echoes it back.
    ingress(&mut node, &i_frame8(0, 0, false, b"hi"));
    assert_eq!(obs.data.borrow().as_slice(), &[b"hi".to_vec()]);

    node.tick();
    let out = egress(&mut node, false);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::I);
    assert_eq!(out[0].ns, 0);
    assert_eq!(out[0].nr, 1);
    assert!(!out[0].pf);
    assert_eq!(out[0].pid, Some(0xF0));
    assert_eq!(out[0].info, b"hi");

    // Peer acknowledges.
    ingress(&mut node, &s_frame8(axlink::ax25::frame::S_RR, 1, false, false));
    let snap = node.connection_snapshot(sock).unwrap();
    assert_eq!(snap.state, ConnState::Connected);
    assert_eq!(snap.snd_state, 1);
    assert_eq!(snap.ack_state, 1);
    assert_eq!(snap.rcv_state, 1);
    assert!(obs.errors.borrow().is_empty());
}

#[test]
fn test_inbound_connect_refused_without_listener() {
    let (mut node, _clock) = test_node();
    // An outbound connection binds the local address, so frames to it
    // are ours, but nothing is listening for new inbound circuits.
    let other: axlink::Ssid = "GB7XX-4".parse().unwrap();
    node.connect(other, local(), 0).unwrap();
    egress(&mut node, false);

    ingress(&mut node, &u_cmd(U_SABM, true));
    let out = egress(&mut node, false);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::Dm);
    assert!(out[0].pf);
}

#[test]
fn test_inbound_sabme_negotiates_v22() {
    let (mut node, _clock, obs) = listening_node(false);

    ingress(&mut node, &u_cmd(U_SABME, true));
    let out = egress(&mut node, true);
    assert_eq!(out[0].kind, EventKind::Ua);
    assert!(out[0].pf);

    let snap = node.connection_snapshot(obs.socket.get().unwrap()).unwrap();
    assert_eq!(snap.version, Version::V2_2);
    assert_eq!(snap.state, ConnState::Connected);
}

#[test]
fn test_outbound_connect_success() {
    let (mut node, _clock) = test_node();
    let sock = node.connect(peer(), local(), 0).unwrap();
    let obs = observe(&mut node, sock);

    let out = egress(&mut node, false);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::Sabm);
    assert_eq!(out[0].ftype, FrameType::Cmd);
    assert!(out[0].pf);
    assert_eq!(out[0].dst.to_string(), PEER);
    assert_eq!(
        node.connection_snapshot(sock).unwrap().state,
        ConnState::AwaitingConnection
    );

    ingress(&mut node, &u_res(U_UA, true));
    assert_eq!(obs.connected.get(), 1);
    let snap = node.connection_snapshot(sock).unwrap();
    assert_eq!(snap.state, ConnState::Connected);
    assert_eq!((snap.snd_state, snap.ack_state, snap.rcv_state), (0, 0, 0));

    // Data flows immediately after.
    node.send(sock, b"ping").unwrap();
    node.tick();
    let out = egress(&mut node, false);
    assert_eq!(out[0].kind, EventKind::I);
    assert_eq!(out[0].info, b"ping");
}

#[test]
fn test_outbound_connect_timeout() {
    let (mut node, clock) = test_node();
    let sock = node.connect(peer(), local(), 0).unwrap();
    let obs = observe(&mut node, sock);

    let mut sabms = egress(&mut node, false)
        .iter()
        .filter(|f| f.kind == EventKind::Sabm)
        .count();

    for _ in 0..20 {
        advance(&clock, Duration::minutes(60));
        node.tick();
        sabms += egress(&mut node, false)
            .iter()
            .filter(|f| f.kind == EventKind::Sabm)
            .count();
        if node.connection_snapshot(sock).is_none() {
            break;
        }
    }

    // The initial SABM plus nine retries; the tenth expiry gives up.
    assert_eq!(sabms, 10);
    assert!(obs.errors.borrow().contains(&DlError::ConnectTimeout));
    assert_eq!(obs.disconnected.get(), 1);
    assert!(node.connection_snapshot(sock).is_none());
}

#[test]
fn test_peer_disconnect() {
    let (mut node, _clock, obs) = listening_node(false);
    ingress(&mut node, &u_cmd(U_SABM, true));
    egress(&mut node, false);
    let sock = obs.socket.get().unwrap();

    ingress(&mut node, &u_cmd(U_DISC, true));
    let out = egress(&mut node, false);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::Ua);
    assert!(out[0].pf);
    assert_eq!(obs.disconnected.get(), 1);
    assert!(node.connection_snapshot(sock).is_none());
}

#[test]
fn test_user_disconnect() {
    let (mut node, _clock) = test_node();
    let sock = node.connect(peer(), local(), 0).unwrap();
    let obs = observe(&mut node, sock);
    egress(&mut node, false);
    ingress(&mut node, &u_res(U_UA, true));

    node.disconnect(sock).unwrap();
    let out = egress(&mut node, false);
    assert_eq!(out[0].kind, EventKind::Disc);
    assert!(out[0].pf);
    assert_eq!(
        node.connection_snapshot(sock).unwrap().state,
        ConnState::AwaitingRelease
    );

    ingress(&mut node, &u_res(U_UA, true));
    assert_eq!(obs.disconnected.get(), 1);
    assert!(node.connection_snapshot(sock).is_none());
}

#[test]
fn test_ui_delivered_to_listener() {
    let (mut node, _clock) = test_node();
    let listener = node.listen(local()).unwrap();
    let obs = observe(&mut node, listener);

    ingress(&mut node, &ui_cmd(false, b"hello"));
    assert_eq!(obs.data.borrow().as_slice(), &[b"hello".to_vec()]);
    assert!(egress(&mut node, false).is_empty());

    // A UI command with P set is answered DM F=1 while disconnected.
    ingress(&mut node, &ui_cmd(true, b"ping"));
    let out = egress(&mut node, false);
    assert_eq!(out[0].kind, EventKind::Dm);
    assert!(out[0].pf);
}

#[test]
fn test_unit_data_sends_ui() {
    let (mut node, _clock) = test_node();
    node.unit_data(peer(), local(), 0, b"beacon text");
    let out = egress(&mut node, false);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, EventKind::Ui);
    assert_eq!(out[0].ftype, FrameType::Cmd);
    assert_eq!(out[0].pid, Some(0xF0));
    assert_eq!(out[0].info, b"beacon text");
    assert_eq!(out[0].dst.to_string(), PEER);
}

#[test]
fn test_send_on_listener_fails() {
    let (mut node, _clock) = test_node();
    let listener = node.listen(local()).unwrap();
    assert_eq!(
        node.send(listener, b"nope"),
        Err(DlError::NotConnected)
    );
}

#[test]
fn test_frames_for_other_stations_are_dropped() {
    let (mut node, _clock, _obs) = listening_node(false);

    let mut frame = Vec::new();
    frame.extend_from_slice(&"N0BODY-3".parse::<axlink::Ssid>().unwrap().encode(false, true));
    frame.extend_from_slice(&peer().encode(true, false));
    frame.push(U_SABM | 0x10);
    ingress(&mut node, &frame);

    assert!(egress(&mut node, false).is_empty());
    assert_eq!(node.counters().not_mine, 1);
}
