//! AX.25 frame codec: header decode into events, and reply construction.
//!
//! Layout on the wire:
//!
//! ```text
//! +--------------------+--------------------+--------------------+...+---------+-----+------+
//! |      dest addr     |      src addr      |(optional)digipeater|   | control |(pid)| info |
//! |D0|D1|D2|D3|D4|D5|D6|S0|S1|S2|S3|S4|S5|S6|A0|A1|A2|A3|A4|A5|A6|   | 1-2 B   | 1 B |      |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+...+---------+-----+------+
//! ```
//!
//! U frames always carry an 8-bit control field; S and I frames carry 8 or
//! 16 bits depending on the connection's negotiated modulo, so decoding
//! them needs the connection looked up first.

use winnow::Parser;
use winnow::error::{ContextError, ErrMode};
use winnow::token::take;

use super::conn::Connection;
use super::error::FrameError;
use super::event::{ADDR_DIGI1, ADDR_DST, ADDR_SRC, DlEvent, EventKind, FrameType, MAX_ADDRESSES};
use super::pool::{Overflow, Packet};
use super::ssid::{ADDR_WIRE_LEN, Ssid, WireAddr};

/// "No layer 3" protocol id, used by plain applications.
pub const PID_NO_L3: u8 = 0xF0;

// 8-bit control field masks.
const CONTROL8_I_MASK: u8 = 0b0000_0001;
const CONTROL8_SU_MASK: u8 = 0b0000_0011;
const CONTROL8_NS_MASK: u8 = 0b0000_1110;
const CONTROL8_S_MASK: u8 = 0b0000_1100;
const CONTROL8_PF_MASK: u8 = 0b0001_0000;
const CONTROL8_M_MASK: u8 = 0b1110_1100;

// 16-bit control field masks (S and I frames under modulo 128).
const CONTROL16_NR_MASK: u16 = 0b1111_1110_0000_0000;
const CONTROL16_PF_MASK: u16 = 0b0000_0001_0000_0000;
const CONTROL16_NS_MASK: u16 = 0b0000_0000_1111_1110;
const CONTROL16_S_MASK: u16 = 0b0000_0000_0000_1100;
const CONTROL16_I_MASK: u16 = 0b0000_0000_0000_0001;

// Full control bytes for transmit.
pub const U_SABME: u8 = 0b0110_1111;
pub const U_SABM: u8 = 0b0010_1111;
pub const U_DISC: u8 = 0b0100_0011;
pub const U_DM: u8 = 0b0000_1111;
pub const U_UA: u8 = 0b0110_0011;
pub const U_FRMR: u8 = 0b1000_0111;
pub const U_UI: u8 = 0b0000_0011;
pub const U_XID: u8 = 0b1010_1111;
pub const U_TEST: u8 = 0b1110_0011;
pub const S_RR: u8 = 0b0000_0001;
pub const S_RNR: u8 = 0b0000_0101;
pub const S_REJ: u8 = 0b0000_1001;
pub const S_SREJ: u8 = 0b0000_1101;

/// The parsed address block of an ingress frame.
#[derive(Debug, Default, PartialEq)]
pub struct AddressBlock {
    pub addrs: [Ssid; MAX_ADDRESSES],
    /// Command/response bit for addresses 0 and 1, hop bit for 2 and 3.
    pub ch: [bool; MAX_ADDRESSES],
    pub count: usize,
}

impl AddressBlock {
    /// The frame classification from the two command bits.
    pub fn frame_type(&self) -> FrameType {
        match (self.ch[ADDR_DST], self.ch[ADDR_SRC]) {
            (false, false) => FrameType::Prev0,
            (true, false) => FrameType::Cmd,
            (false, true) => FrameType::Res,
            (true, true) => FrameType::Prev3,
        }
    }

    /// The first digipeater that has not yet repeated the frame, else the
    /// final destination.
    pub fn active_destination(&self) -> usize {
        for i in ADDR_DIGI1..self.count {
            if !self.ch[i] {
                return i;
            }
        }
        ADDR_DST
    }
}

/// Parse 2..4 addresses off the front of a frame.
pub fn parse_address_block(input: &mut &[u8]) -> Result<AddressBlock, FrameError> {
    let mut block = AddressBlock::default();
    loop {
        let chunk: &[u8] = take(ADDR_WIRE_LEN)
            .parse_next(input)
            .map_err(|_: ErrMode<ContextError>| FrameError::AddressUnderrun)?;
        let (wire, _) = WireAddr::from_prefix(chunk).ok_or(FrameError::AddressUnderrun)?;
        let (ssid, last, ch) = wire.decode().ok_or(FrameError::InvalidAddress)?;
        block.addrs[block.count] = ssid;
        block.ch[block.count] = ch;
        block.count += 1;
        if last {
            break;
        }
        if block.count >= MAX_ADDRESSES {
            return Err(FrameError::TooManyAddresses);
        }
    }
    if block.count < 2 {
        return Err(FrameError::TooFewAddresses);
    }
    Ok(block)
}

/// A decoded control field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    pub kind: EventKind,
    /// The raw P/F bit; the dispatcher assigns it to P or F based on the
    /// frame type.
    pub pf: bool,
    pub nr: u8,
    pub ns: u8,
}

/// Decode the control field. `extended` selects the 16-bit S/I form.
pub fn parse_control(input: &mut &[u8], extended: bool) -> Result<Control, FrameError> {
    let first = winnow::binary::u8
        .parse_next(input)
        .map_err(|_: ErrMode<ContextError>| FrameError::ControlUnderrun)?;

    if first & CONTROL8_SU_MASK == 0b11 {
        // U frames are 8 bits wide regardless of modulo.
        let kind = match first & CONTROL8_M_MASK {
            0b0010_1100 => EventKind::Sabm,
            0b0110_1100 => EventKind::Sabme,
            0b0100_0000 => EventKind::Disc,
            0b0000_1100 => EventKind::Dm,
            0b0110_0000 => EventKind::Ua,
            0b1000_0100 => EventKind::Frmr,
            0b0000_0000 => EventKind::Ui,
            0b1010_1100 => EventKind::Xid,
            0b1110_0000 => EventKind::Test,
            _ => EventKind::UnknownFrame,
        };
        return Ok(Control {
            kind,
            pf: first & CONTROL8_PF_MASK != 0,
            nr: 0,
            ns: 0,
        });
    }

    if extended {
        let second = winnow::binary::u8
            .parse_next(input)
            .map_err(|_: ErrMode<ContextError>| FrameError::ControlUnderrun)?;
        let ctl = ((second as u16) << 8) | first as u16;
        let pf = ctl & CONTROL16_PF_MASK != 0;
        let nr = ((ctl & CONTROL16_NR_MASK) >> 9) as u8;
        if ctl & CONTROL16_I_MASK == 0 {
            Ok(Control {
                kind: EventKind::I,
                pf,
                nr,
                ns: ((ctl & CONTROL16_NS_MASK) >> 1) as u8,
            })
        } else {
            let kind = match ctl & CONTROL16_S_MASK {
                0b0000 => EventKind::Rr,
                0b0100 => EventKind::Rnr,
                0b1000 => EventKind::Rej,
                0b1100 => EventKind::Srej,
                _ => EventKind::UnknownFrame,
            };
            Ok(Control { kind, pf, nr, ns: 0 })
        }
    } else {
        let pf = first & CONTROL8_PF_MASK != 0;
        let nr = first >> 5;
        if first & CONTROL8_I_MASK == 0 {
            Ok(Control {
                kind: EventKind::I,
                pf,
                nr,
                ns: (first & CONTROL8_NS_MASK) >> 1,
            })
        } else {
            let kind = match first & CONTROL8_S_MASK {
                0b0000 => EventKind::Rr,
                0b0100 => EventKind::Rnr,
                0b1000 => EventKind::Rej,
                0b1100 => EventKind::Srej,
                _ => EventKind::UnknownFrame,
            };
            Ok(Control { kind, pf, nr, ns: 0 })
        }
    }
}

/// Push the reply address block: source and destination swapped relative
/// to the event, digipeaters in reverse order, end marker on the last
/// byte, command/response bits per `ftype`.
///
/// Events without an address vector (timer ticks, queue drains) fall back
/// to the connection's stored pair.
pub fn push_reply_addrs(
    pkt: &mut Packet,
    ev: &DlEvent<'_>,
    conn: Option<&Connection>,
    ftype: FrameType,
) -> Result<(), Overflow> {
    pkt.port = conn.map_or(ev.port, |c| c.port);

    let mut order: [&Ssid; MAX_ADDRESSES] = [ev.dst(); MAX_ADDRESSES];
    let count;
    if ev.addr_count >= 2 {
        order[0] = ev.src();
        order[1] = ev.dst();
        // Digipeaters relay the reply in the opposite direction.
        for (slot, i) in (ADDR_DIGI1..ev.addr_count).rev().enumerate() {
            order[ADDR_DIGI1 + slot] = &ev.addrs[i];
        }
        count = ev.addr_count;
    } else if let Some(c) = conn {
        order[0] = &c.remote;
        order[1] = &c.local;
        count = 2;
    } else {
        count = 0;
    }

    for (i, ssid) in order[..count].iter().enumerate() {
        let ch = match i {
            ADDR_DST => ftype.dst_ch(),
            ADDR_SRC => ftype.src_ch(),
            _ => false,
        };
        pkt.push(&ssid.encode(i == count - 1, ch))?;
    }
    Ok(())
}

/// Push an unnumbered control byte.
pub fn push_u_control(
    pkt: &mut Packet,
    cmd: u8,
    ftype: FrameType,
    p: bool,
    f: bool,
) -> Result<(), Overflow> {
    let pf = if ftype == FrameType::Res { f } else { p };
    pkt.push_byte(cmd | if pf { CONTROL8_PF_MASK } else { 0 })
}

/// Push a supervisory control field in the width selected by `modulo`.
pub fn push_s_control(
    pkt: &mut Packet,
    modulo: u8,
    cmd: u8,
    ftype: FrameType,
    p: bool,
    f: bool,
    nr: u8,
) -> Result<(), Overflow> {
    let pf = if ftype == FrameType::Res { f } else { p };
    if modulo == 8 {
        let mut ctl = cmd;
        if pf {
            ctl |= CONTROL8_PF_MASK;
        }
        ctl |= (nr << 5) & 0b1110_0000;
        pkt.push_byte(ctl)
    } else {
        let mut ctl = cmd as u16;
        if pf {
            ctl |= CONTROL16_PF_MASK;
        }
        ctl |= ((nr as u16) << 9) & CONTROL16_NR_MASK;
        pkt.push_byte((ctl & 0xFF) as u8)?;
        pkt.push_byte((ctl >> 8) as u8)
    }
}

/// Push an information-frame control field.
pub fn push_i_control(
    pkt: &mut Packet,
    modulo: u8,
    p: bool,
    nr: u8,
    ns: u8,
) -> Result<(), Overflow> {
    if modulo == 8 {
        let mut ctl = 0u8;
        if p {
            ctl |= CONTROL8_PF_MASK;
        }
        ctl |= (nr << 5) & 0b1110_0000;
        ctl |= (ns << 1) & CONTROL8_NS_MASK;
        pkt.push_byte(ctl)
    } else {
        let mut ctl = 0u16;
        if p {
            ctl |= CONTROL16_PF_MASK;
        }
        ctl |= ((nr as u16) << 9) & CONTROL16_NR_MASK;
        ctl |= ((ns as u16) << 1) & CONTROL16_NS_MASK;
        pkt.push_byte((ctl & 0xFF) as u8)?;
        pkt.push_byte((ctl >> 8) as u8)
    }
}

/// Information field of an outgoing U frame.
pub enum UInfo<'a> {
    /// No information field (SABM, UA, DM, DISC).
    None,
    /// Raw bytes with no PID (TEST echoes).
    Raw(&'a [u8]),
    /// PID byte followed by payload (UI).
    Pid(u8, &'a [u8]),
}

/// Build a complete U frame: reply addresses, control, optional info.
pub fn build_u(
    pkt: &mut Packet,
    ev: &DlEvent<'_>,
    conn: Option<&Connection>,
    ftype: FrameType,
    cmd: u8,
    p: bool,
    f: bool,
    info: UInfo<'_>,
) -> Result<(), Overflow> {
    push_reply_addrs(pkt, ev, conn, ftype)?;
    push_u_control(pkt, cmd, ftype, p, f)?;
    match info {
        UInfo::None => {}
        UInfo::Raw(bytes) => pkt.push(bytes)?,
        UInfo::Pid(pid, bytes) => {
            pkt.push_byte(pid)?;
            pkt.push(bytes)?;
        }
    }
    Ok(())
}

/// Build a complete S frame in the connection's control-field width.
pub fn build_s(
    pkt: &mut Packet,
    ev: &DlEvent<'_>,
    conn: &Connection,
    ftype: FrameType,
    cmd: u8,
    pf: bool,
    nr: u8,
) -> Result<(), Overflow> {
    push_reply_addrs(pkt, ev, Some(conn), ftype)?;
    // One P/F argument; which bit it lands in follows the frame type.
    push_s_control(pkt, conn.modulo, cmd, ftype, pf, pf, nr)
}

/// Build a complete I frame (always a command).
pub fn build_i(
    pkt: &mut Packet,
    ev: &DlEvent<'_>,
    conn: &Connection,
    p: bool,
    nr: u8,
    ns: u8,
    pid: u8,
    info: &[u8],
) -> Result<(), Overflow> {
    push_reply_addrs(pkt, ev, Some(conn), FrameType::Cmd)?;
    push_i_control(pkt, conn.modulo, p, nr, ns)?;
    pkt.push_byte(pid)?;
    pkt.push(info)
}
