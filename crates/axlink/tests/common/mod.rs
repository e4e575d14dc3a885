//! Shared helpers for the end-to-end scenarios.
//!
//! Tests play the role of the peer station: they hand-assemble frames,
//! wrap them in KISS, feed them into the node byte by byte, and unwrap
//! and parse whatever the node queued for egress. Time is a fake clock
//! the tests advance by hand.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use axlink::ax25::frame::{self, parse_address_block, parse_control};
use axlink::ax25::{DlError, Duration, EventKind, FrameType, Instant, Node, SocketId, Ssid};

pub const LOCAL: &str = "2E0ITB-1";
pub const PEER: &str = "M7QQQ-1";

pub fn local() -> Ssid {
    LOCAL.parse().unwrap()
}

pub fn peer() -> Ssid {
    PEER.parse().unwrap()
}

/// A node on a hand-cranked clock, plus the crank.
pub fn test_node() -> (Node, Rc<Cell<i64>>) {
    let clock = Rc::new(Cell::new(1_000_000));
    let handle = clock.clone();
    let node = Node::with_clock(Box::new(move || Instant::from_nanos(handle.get())));
    (node, clock)
}

pub fn advance(clock: &Rc<Cell<i64>>, by: Duration) {
    clock.set(clock.get() + by.as_nanos());
}

/// Record of everything a socket's callbacks observed.
#[derive(Default)]
pub struct Observed {
    pub connected: Cell<u32>,
    pub disconnected: Cell<u32>,
    pub data: RefCell<Vec<Vec<u8>>>,
    pub errors: RefCell<Vec<DlError>>,
    /// The socket the callbacks fired on (the accepted one, for inbound).
    pub socket: Cell<Option<SocketId>>,
}

/// Install recording callbacks on a socket.
pub fn observe(node: &mut Node, sock: SocketId) -> Rc<Observed> {
    let obs = Rc::new(Observed::default());
    obs.socket.set(Some(sock));
    let o = obs.clone();
    node.set_on_connect(sock, move |_, _| o.connected.set(o.connected.get() + 1));
    let o = obs.clone();
    node.set_on_data(sock, move |_, _, data| o.data.borrow_mut().push(data.to_vec()));
    let o = obs.clone();
    node.set_on_disconnect(sock, move |_, _| o.disconnected.set(o.disconnected.get() + 1));
    let o = obs.clone();
    node.set_on_error(sock, move |_, _, err| o.errors.borrow_mut().push(err));
    obs
}

/// A listener whose accept handler records into an [`Observed`] and
/// optionally echoes received data back.
pub fn listening_node(echo: bool) -> (Node, Rc<Cell<i64>>, Rc<Observed>) {
    let (mut node, clock) = test_node();
    let listener = node.listen(local()).unwrap();
    let obs = Rc::new(Observed::default());
    let o = obs.clone();
    node.set_on_connect(listener, move |node, sock| {
        o.connected.set(o.connected.get() + 1);
        o.socket.set(Some(sock));
        let o2 = o.clone();
        node.set_on_data(sock, move |node, sock, data| {
            o2.data.borrow_mut().push(data.to_vec());
            if echo {
                let payload = data.to_vec();
                node.send(sock, &payload).unwrap();
            }
        });
        let o2 = o.clone();
        node.set_on_disconnect(sock, move |_, _| {
            o2.disconnected.set(o2.disconnected.get() + 1)
        });
        let o2 = o.clone();
        node.set_on_error(sock, move |_, _, err| o2.errors.borrow_mut().push(err));
    });
    (node, clock, obs)
}

// ============================================================================
// KISS (peer side, hand rolled)
// ============================================================================

pub fn kiss_wrap(frame: &[u8]) -> Vec<u8> {
    let mut out = vec![0xC0, 0x00];
    for &b in frame {
        match b {
            0xC0 => out.extend_from_slice(&[0xDB, 0xDC]),
            0xDB => out.extend_from_slice(&[0xDB, 0xDD]),
            _ => out.push(b),
        }
    }
    out.push(0xC0);
    out
}

/// Split an egress byte stream into unstuffed KISS data frames, with the
/// command byte stripped.
pub fn kiss_unwrap(stream: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut current = Vec::new();
    let mut escaped = false;
    for &b in stream {
        if escaped {
            current.push(match b {
                0xDC => 0xC0,
                0xDD => 0xDB,
                other => other,
            });
            escaped = false;
        } else if b == 0xDB {
            escaped = true;
        } else if b == 0xC0 {
            if !current.is_empty() {
                frames.push(current.split_off(0));
            }
        } else {
            current.push(b);
        }
    }
    frames
        .into_iter()
        .map(|f| {
            assert_eq!(f[0] & 0x0F, 0, "expected a KISS data frame");
            f[1..].to_vec()
        })
        .collect()
}

/// Feed one peer frame into the node on serial 0.
pub fn ingress(node: &mut Node, frame: &[u8]) {
    node.ingress(0, &kiss_wrap(frame));
}

/// Collect and parse everything the node queued for serial 0.
pub fn egress(node: &mut Node, extended: bool) -> Vec<Parsed> {
    match node.take_egress(0) {
        Some(bytes) => kiss_unwrap(&bytes)
            .iter()
            .map(|f| parse(f, extended))
            .collect(),
        None => Vec::new(),
    }
}

// ============================================================================
// Frames as the peer builds and reads them
// ============================================================================

fn addrs(cmd: bool) -> Vec<u8> {
    // Frames from the peer to the node: wire destination is the node.
    let mut out = Vec::new();
    out.extend_from_slice(&local().encode(false, cmd));
    out.extend_from_slice(&peer().encode(true, !cmd));
    out
}

/// An unnumbered command frame from the peer.
pub fn u_cmd(ctrl: u8, p: bool) -> Vec<u8> {
    let mut f = addrs(true);
    f.push(ctrl | if p { 0x10 } else { 0 });
    f
}

/// An unnumbered response frame from the peer.
pub fn u_res(ctrl: u8, f_bit: bool) -> Vec<u8> {
    let mut f = addrs(false);
    f.push(ctrl | if f_bit { 0x10 } else { 0 });
    f
}

/// A modulo-8 supervisory frame from the peer.
pub fn s_frame8(ctrl: u8, nr: u8, pf: bool, cmd: bool) -> Vec<u8> {
    let mut f = addrs(cmd);
    f.push(ctrl | if pf { 0x10 } else { 0 } | (nr << 5));
    f
}

/// A modulo-128 supervisory frame from the peer.
pub fn s_frame128(ctrl: u8, nr: u8, pf: bool, cmd: bool) -> Vec<u8> {
    let mut f = addrs(cmd);
    let ctl = ctrl as u16 | if pf { 0x0100 } else { 0 } | ((nr as u16) << 9);
    f.push((ctl & 0xFF) as u8);
    f.push((ctl >> 8) as u8);
    f
}

/// A modulo-8 I frame from the peer, PID 0xF0.
pub fn i_frame8(ns: u8, nr: u8, p: bool, info: &[u8]) -> Vec<u8> {
    let mut f = addrs(true);
    f.push(if p { 0x10 } else { 0 } | (nr << 5) | (ns << 1));
    f.push(frame::PID_NO_L3);
    f.extend_from_slice(info);
    f
}

/// A modulo-128 I frame from the peer, PID 0xF0.
pub fn i_frame128(ns: u8, nr: u8, p: bool, info: &[u8]) -> Vec<u8> {
    let mut f = addrs(true);
    let ctl = if p { 0x0100u16 } else { 0 } | ((nr as u16) << 9) | ((ns as u16) << 1);
    f.push((ctl & 0xFF) as u8);
    f.push((ctl >> 8) as u8);
    f.push(frame::PID_NO_L3);
    f.extend_from_slice(info);
    f
}

/// A UI command frame from the peer, PID 0xF0.
pub fn ui_cmd(p: bool, info: &[u8]) -> Vec<u8> {
    let mut f = addrs(true);
    f.push(frame::U_UI | if p { 0x10 } else { 0 });
    f.push(frame::PID_NO_L3);
    f.extend_from_slice(info);
    f
}

/// An egress frame as the peer sees it.
#[derive(Debug)]
pub struct Parsed {
    pub kind: EventKind,
    pub ftype: FrameType,
    pub pf: bool,
    pub nr: u8,
    pub ns: u8,
    pub pid: Option<u8>,
    pub info: Vec<u8>,
    pub dst: Ssid,
    pub src: Ssid,
}

pub fn parse(frame_bytes: &[u8], extended: bool) -> Parsed {
    let mut input = frame_bytes;
    let block = parse_address_block(&mut input).expect("address block");
    let ctl = parse_control(&mut input, extended).expect("control field");
    let (pid, info) = match ctl.kind {
        EventKind::I | EventKind::Ui => (Some(input[0]), input[1..].to_vec()),
        _ => (None, input.to_vec()),
    };
    Parsed {
        kind: ctl.kind,
        ftype: block.frame_type(),
        pf: ctl.pf,
        nr: ctl.nr,
        ns: ctl.ns,
        pid,
        info,
        dst: block.addrs[0],
        src: block.addrs[1],
    }
}
