//! KISS framing: the byte-stuffed envelope between the core and a TNC.
//!
//! Ingress is a three-state byte-stream decoder per serial line; egress is
//! written stuffed into per-line queues that the platform driver flushes.
//! A "port" byte combines the TNC unit (high nibble) with the serial line
//! index (low nibble), so one node can speak to several radios across
//! several TNCs.

use bytes::{Bytes, BytesMut};

use super::node::Counters;
use super::pool::MAX_PACKET_SIZE;

/// Frame delimiter.
pub const FEND: u8 = 0xC0;
/// Escape introducer.
pub const FESC: u8 = 0xDB;
/// Escaped FEND.
pub const TFEND: u8 = 0xDC;
/// Escaped FESC.
pub const TFESC: u8 = 0xDD;

/// Number of serial lines the node can drive.
pub const MAX_SERIAL: usize = 2;

/// KISS command nibbles.
pub mod command {
    /// N bytes of frame data.
    pub const DATA: u8 = 0;
    /// TX delay in 10 ms units.
    pub const TXDELAY: u8 = 1;
    /// p-persistence parameter.
    pub const PERSIST: u8 = 2;
    /// Slot interval in 10 ms units.
    pub const SLOTTIME: u8 = 3;
    /// Obsolete TX tail.
    pub const TXTAIL: u8 = 4;
    /// 0 = half duplex, 1 = full duplex.
    pub const FULLDUP: u8 = 5;
    /// Implementation defined.
    pub const SETHW: u8 = 6;
    /// 2-byte id followed by frame data; the TNC acks transmission.
    pub const ACKMODE: u8 = 12;
}

/// Serial line index carried in the low nibble of a port byte.
pub fn port_serial(port: u8) -> u8 {
    port & 0x0F
}

/// TNC unit carried in the high nibble of a port byte.
pub fn port_unit(port: u8) -> u8 {
    port >> 4
}

/// Combine a TNC unit and serial line into a port byte.
pub fn make_port(unit: u8, serial: u8) -> u8 {
    (unit << 4) | (serial & 0x0F)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Discarding until a FEND synchronises the stream.
    Wait,
    /// Accumulating frame bytes.
    Data,
    /// Last byte was FESC.
    Escape,
}

/// Decoder for one serial line.
struct LineDecoder {
    state: DecodeState,
    buf: Vec<u8>,
}

impl LineDecoder {
    fn new() -> Self {
        LineDecoder {
            state: DecodeState::Wait,
            buf: Vec::with_capacity(MAX_PACKET_SIZE),
        }
    }

    /// Feed one byte. Returns a completed frame, without the delimiters.
    fn push(&mut self, byte: u8, counters: &mut Counters) -> Option<Vec<u8>> {
        match self.state {
            DecodeState::Wait => {
                if byte == FEND {
                    self.state = DecodeState::Data;
                    self.buf.clear();
                }
                None
            }
            DecodeState::Data => match byte {
                FEND => {
                    // Back-to-back frames share one FEND; stay in Data.
                    let frame = std::mem::replace(
                        &mut self.buf,
                        Vec::with_capacity(MAX_PACKET_SIZE),
                    );
                    if frame.is_empty() {
                        // Zero-length frames are padding.
                        None
                    } else {
                        Some(frame)
                    }
                }
                FESC => {
                    self.state = DecodeState::Escape;
                    None
                }
                _ => self.accept(byte, counters),
            },
            DecodeState::Escape => match byte {
                TFEND => {
                    self.state = DecodeState::Data;
                    self.accept(FEND, counters)
                }
                TFESC => {
                    self.state = DecodeState::Data;
                    self.accept(FESC, counters)
                }
                _ => {
                    // "No action is taken and frame assembly continues."
                    counters.kiss_bad_escape += 1;
                    self.state = DecodeState::Data;
                    None
                }
            },
        }
    }

    fn accept(&mut self, byte: u8, counters: &mut Counters) -> Option<Vec<u8>> {
        if self.buf.len() >= MAX_PACKET_SIZE {
            counters.kiss_overrun += 1;
            self.state = DecodeState::Wait;
            self.buf.clear();
            return None;
        }
        self.buf.push(byte);
        None
    }
}

/// A decoded ingress frame ready for the AX.25 layer.
pub struct KissData {
    /// Combined unit/serial port byte.
    pub port: u8,
    /// ACKMODE transfer id, when the TNC sent one.
    pub id: Option<u16>,
    /// The AX.25 frame bytes.
    pub frame: Vec<u8>,
    /// Offset of the AX.25 frame within `frame`.
    pub start: usize,
}

impl KissData {
    pub fn payload(&self) -> &[u8] {
        &self.frame[self.start..]
    }
}

/// Per-node KISS state: one decoder and one egress queue per serial line,
/// plus the ACKMODE id allocator.
pub struct Kiss {
    lines: [LineDecoder; MAX_SERIAL],
    tx: [BytesMut; MAX_SERIAL],
    next_id: u16,
}

impl Kiss {
    pub fn new() -> Self {
        Kiss {
            lines: std::array::from_fn(|_| LineDecoder::new()),
            tx: std::array::from_fn(|_| BytesMut::new()),
            next_id: 1,
        }
    }

    /// Feed one received byte; classify a completed frame if one ends here.
    pub fn push_byte(
        &mut self,
        serial: u8,
        byte: u8,
        counters: &mut Counters,
    ) -> Option<KissData> {
        let line = self.lines.get_mut(serial as usize)?;
        let frame = line.push(byte, counters)?;
        Self::classify(serial, frame, counters)
    }

    /// Split a raw KISS frame into command and AX.25 payload.
    fn classify(serial: u8, frame: Vec<u8>, counters: &mut Counters) -> Option<KissData> {
        let cmd = frame[0];
        let port = make_port(cmd >> 4, serial);
        match cmd & 0x0F {
            command::DATA => Some(KissData {
                port,
                id: None,
                frame,
                start: 1,
            }),
            command::ACKMODE => {
                if frame.len() < 3 {
                    counters.frame_underrun += 1;
                    return None;
                }
                let id = u16::from_be_bytes([frame[1], frame[2]]);
                Some(KissData {
                    port,
                    id: Some(id),
                    frame,
                    start: 3,
                })
            }
            _ => {
                counters.kiss_unknown_command += 1;
                None
            }
        }
    }

    /// Transmit one frame as a KISS data command.
    pub fn xmit(&mut self, port: u8, frame: &[u8], counters: &mut Counters) {
        let serial = port_serial(port) as usize;
        if serial >= MAX_SERIAL {
            return;
        }
        let tx = &mut self.tx[serial];
        tx.extend_from_slice(&[FEND]);
        stuff(tx, (port_unit(port) << 4) | command::DATA);
        for &b in frame {
            stuff(tx, b);
        }
        tx.extend_from_slice(&[FEND]);
        counters.frames_sent += 1;
        counters.bytes_sent += frame.len() as u64;
    }

    /// Transmit one frame as a KISS ACKMODE command, returning its id.
    pub fn xmit_ackmode(&mut self, port: u8, frame: &[u8], counters: &mut Counters) -> u16 {
        let id = self.allocate_id();
        let serial = port_serial(port) as usize;
        if serial >= MAX_SERIAL {
            return id;
        }
        let tx = &mut self.tx[serial];
        tx.extend_from_slice(&[FEND]);
        stuff(tx, (port_unit(port) << 4) | command::ACKMODE);
        let [hi, lo] = id.to_be_bytes();
        stuff(tx, hi);
        stuff(tx, lo);
        for &b in frame {
            stuff(tx, b);
        }
        tx.extend_from_slice(&[FEND]);
        counters.frames_sent += 1;
        counters.bytes_sent += frame.len() as u64;
        id
    }

    fn allocate_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = match self.next_id.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }

    /// Set the TNC's TX delay, in 10 ms units.
    pub fn set_txdelay(&mut self, port: u8, delay: u8) {
        self.config(port, command::TXDELAY, delay);
    }

    /// Set the TNC's slot time, in 10 ms units.
    pub fn set_slottime(&mut self, port: u8, slot: u8) {
        self.config(port, command::SLOTTIME, slot);
    }

    /// Select half or full duplex.
    pub fn set_duplex(&mut self, port: u8, full_duplex: bool) {
        self.config(port, command::FULLDUP, full_duplex as u8);
    }

    fn config(&mut self, port: u8, cmd: u8, value: u8) {
        let serial = port_serial(port) as usize;
        if serial >= MAX_SERIAL {
            return;
        }
        let tx = &mut self.tx[serial];
        tx.extend_from_slice(&[FEND]);
        stuff(tx, (port_unit(port) << 4) | cmd);
        stuff(tx, value);
        tx.extend_from_slice(&[FEND]);
    }

    /// Drain the pending egress bytes for one serial line.
    pub fn take_tx(&mut self, serial: u8) -> Option<Bytes> {
        let tx = self.tx.get_mut(serial as usize)?;
        if tx.is_empty() {
            None
        } else {
            Some(tx.split().freeze())
        }
    }
}

impl Default for Kiss {
    fn default() -> Self {
        Self::new()
    }
}

fn stuff(tx: &mut BytesMut, byte: u8) {
    match byte {
        FEND => tx.extend_from_slice(&[FESC, TFEND]),
        FESC => tx.extend_from_slice(&[FESC, TFESC]),
        _ => tx.extend_from_slice(&[byte]),
    }
}
