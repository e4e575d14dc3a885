//! The event record driving the data-link state machine.
//!
//! Every stimulus, whether a decoded peer frame, a user primitive, a
//! timer firing or the send-queue drain tick, becomes one [`DlEvent`]
//! delivered to the dispatcher. The record carries the parsed frame
//! fields; handlers that build replies read the address vector back out
//! of it.

use std::fmt;

use super::conn::ConnId;
use super::socket::SocketId;
use super::ssid::Ssid;

/// Index of the destination address in the address vector.
pub const ADDR_DST: usize = 0;
/// Index of the source address.
pub const ADDR_SRC: usize = 1;
/// Index of the first digipeater address.
pub const ADDR_DIGI1: usize = 2;
/// An address block holds at most four addresses.
pub const MAX_ADDRESSES: usize = 4;

/// Every stimulus the state machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // Decoder-detected control errors
    CtrlError,
    InfoNotPermitted,
    IncorrectLength,
    // User primitives
    DlConnect,
    DlDisconnect,
    DlData,
    DlUnitData,
    DlFlowOn,
    DlFlowOff,
    // Link multiplexer
    LmData,
    // Peer frames
    Ua,
    Dm,
    Ui,
    Disc,
    Sabm,
    Sabme,
    Test,
    I,
    Rr,
    Rnr,
    Rej,
    Srej,
    Frmr,
    Xid,
    UnknownFrame,
    // Timers and internal ticks
    TimerExpireT1,
    TimerExpireT2,
    TimerExpireT3,
    DrainSendQueue,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::CtrlError => "CTRL_ERROR",
            EventKind::InfoNotPermitted => "INFO_NOT_PERMITTED",
            EventKind::IncorrectLength => "INCORRECT_LENGTH",
            EventKind::DlConnect => "DL_CONNECT",
            EventKind::DlDisconnect => "DL_DISCONNECT",
            EventKind::DlData => "DL_DATA",
            EventKind::DlUnitData => "DL_UNIT_DATA",
            EventKind::DlFlowOn => "DL_FLOW_ON",
            EventKind::DlFlowOff => "DL_FLOW_OFF",
            EventKind::LmData => "LM_DATA",
            EventKind::Ua => "UA",
            EventKind::Dm => "DM",
            EventKind::Ui => "UI",
            EventKind::Disc => "DISC",
            EventKind::Sabm => "SABM",
            EventKind::Sabme => "SABME",
            EventKind::Test => "TEST",
            EventKind::I => "I",
            EventKind::Rr => "RR",
            EventKind::Rnr => "RNR",
            EventKind::Rej => "REJ",
            EventKind::Srej => "SREJ",
            EventKind::Frmr => "FRMR",
            EventKind::Xid => "XID",
            EventKind::UnknownFrame => "UNKNOWN_FRAME",
            EventKind::TimerExpireT1 => "TIMER_EXPIRE_T1",
            EventKind::TimerExpireT2 => "TIMER_EXPIRE_T2",
            EventKind::TimerExpireT3 => "TIMER_EXPIRE_T3",
            EventKind::DrainSendQueue => "DRAIN_SENDQ",
        };
        f.write_str(name)
    }
}

/// Frame classification from the two command bits in the address block.
///
/// `Prev0`/`Prev3` are the encodings older AX.25 versions used; v2.2
/// peers always send `Cmd` or `Res`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Prev0 = 0b00,
    Cmd = 0b01,
    Res = 0b10,
    Prev3 = 0b11,
}

impl FrameType {
    /// The command bit placed in the destination address on transmit.
    pub fn dst_ch(self) -> bool {
        matches!(self, FrameType::Cmd | FrameType::Prev3)
    }

    /// The response bit placed in the source address on transmit.
    pub fn src_ch(self) -> bool {
        matches!(self, FrameType::Res | FrameType::Prev3)
    }
}

/// One stimulus, fully parsed.
///
/// For ingress frames the address vector is populated in wire order
/// (destination first) and `info` borrows from the decoded KISS frame.
/// For user primitives the caller fills the same fields with the
/// destination slot holding the *local* address, matching the shape of a
/// received frame so reply construction is uniform.
pub struct DlEvent<'a> {
    pub kind: EventKind,
    pub port: u8,
    pub addrs: [Ssid; MAX_ADDRESSES],
    pub addr_count: usize,
    pub ftype: FrameType,
    /// Poll bit; set only on commands.
    pub p: bool,
    /// Final bit; set only on responses.
    pub f: bool,
    pub nr: u8,
    pub ns: u8,
    /// Protocol id of I and UI frames.
    pub pid: u8,
    pub info: &'a [u8],
    pub conn: Option<ConnId>,
    /// The socket the frame would land on: the connected socket for the
    /// address pair, else the listener bound to the local address.
    pub socket: Option<SocketId>,
}

impl<'a> DlEvent<'a> {
    /// A bare event with no addresses or payload.
    pub fn new(kind: EventKind, port: u8) -> Self {
        DlEvent {
            kind,
            port,
            addrs: [Ssid::default(); MAX_ADDRESSES],
            addr_count: 0,
            ftype: FrameType::Cmd,
            p: false,
            f: false,
            nr: 0,
            ns: 0,
            pid: super::frame::PID_NO_L3,
            info: &[],
            conn: None,
            socket: None,
        }
    }

    /// An internal event (timer expiry, queue drain) for a connection.
    pub fn internal(kind: EventKind, conn: ConnId) -> Self {
        let mut ev = DlEvent::new(kind, 0);
        ev.conn = Some(conn);
        ev
    }

    /// A user primitive addressed by `(local, remote)`, laid out the way
    /// an ingress frame would be.
    pub fn primitive(kind: EventKind, local: Ssid, remote: Ssid, port: u8) -> Self {
        let mut ev = DlEvent::new(kind, port);
        ev.addrs[ADDR_DST] = local;
        ev.addrs[ADDR_SRC] = remote;
        ev.addr_count = 2;
        ev
    }

    pub fn dst(&self) -> &Ssid {
        &self.addrs[ADDR_DST]
    }

    pub fn src(&self) -> &Ssid {
        &self.addrs[ADDR_SRC]
    }
}
