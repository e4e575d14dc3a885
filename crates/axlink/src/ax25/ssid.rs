//! Station identity: six-character callsign plus a 4-bit SSID suffix.
//!
//! On the wire each address occupies seven bytes with every call character
//! shifted left one bit; the freed low bit of the final byte marks the end
//! of the address block. The seventh byte packs the SSID into bits 4..1,
//! a command/response (or digipeater "has-been-repeated") bit into bit 7,
//! and two reserved bits that are always transmitted as ones.

use std::fmt;
use std::str::FromStr;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Callsign length in characters, space padded.
pub const CALL_LEN: usize = 6;

/// Wire size of one address.
pub const ADDR_WIRE_LEN: usize = 7;

/// Reserved bits of the SSID byte, set on transmit.
const SSID_RESERVED: u8 = 0b0110_0000;

/// End-of-address-block marker (low bit of the last address byte).
const ADDR_END: u8 = 0b0000_0001;

/// Command/response/hop bit of the SSID byte.
const ADDR_CH: u8 = 0b1000_0000;

/// Error type for SSID string parsing.
#[derive(Debug, thiserror::Error)]
pub enum SsidError {
    #[error("empty callsign")]
    Empty,

    #[error("callsign longer than {CALL_LEN} characters: {0}")]
    CallTooLong(String),

    #[error("invalid callsign character {0:?}")]
    InvalidChar(char),

    #[error("SSID suffix out of range 0..=15: {0}")]
    SuffixRange(String),
}

/// A station address: callsign plus SSID, e.g. `2E0ITB-1`.
///
/// Equality is structural over all seven stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ssid {
    call: [u8; CALL_LEN],
    ssid: u8,
}

impl Default for Ssid {
    fn default() -> Self {
        Ssid {
            call: [b' '; CALL_LEN],
            ssid: 0,
        }
    }
}

impl Ssid {
    /// Construct from a raw callsign and suffix. The callsign is
    /// upper-cased and space padded.
    pub fn new(call: &str, ssid: u8) -> Result<Self, SsidError> {
        if call.is_empty() {
            return Err(SsidError::Empty);
        }
        if call.len() > CALL_LEN {
            return Err(SsidError::CallTooLong(call.to_string()));
        }
        if ssid > 15 {
            return Err(SsidError::SuffixRange(ssid.to_string()));
        }
        let mut bytes = [b' '; CALL_LEN];
        for (i, ch) in call.chars().enumerate() {
            if !ch.is_ascii_alphanumeric() {
                return Err(SsidError::InvalidChar(ch));
            }
            bytes[i] = ch.to_ascii_uppercase() as u8;
        }
        Ok(Ssid { call: bytes, ssid })
    }

    /// The callsign without padding.
    pub fn call(&self) -> &str {
        let end = self
            .call
            .iter()
            .rposition(|&b| b != b' ')
            .map_or(0, |p| p + 1);
        // Constructors only admit ASCII.
        std::str::from_utf8(&self.call[..end]).unwrap_or("")
    }

    /// The numeric suffix, 0..=15.
    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Encode into wire form. `last` sets the end-of-address marker,
    /// `ch` the command/response/hop bit.
    pub fn encode(&self, last: bool, ch: bool) -> [u8; ADDR_WIRE_LEN] {
        let mut out = [0u8; ADDR_WIRE_LEN];
        for (o, c) in out.iter_mut().zip(self.call.iter()) {
            *o = c << 1;
        }
        out[CALL_LEN] = (self.ssid << 1) | SSID_RESERVED;
        if last {
            out[CALL_LEN] |= ADDR_END;
        }
        if ch {
            out[CALL_LEN] |= ADDR_CH;
        }
        out
    }
}

impl FromStr for Ssid {
    type Err = SsidError;

    /// Parse `CALL` or `CALL-N` with `N` in 0..=15, defaulting to 0.
    fn from_str(s: &str) -> Result<Self, SsidError> {
        match s.split_once('-') {
            Some((call, suffix)) => {
                let n: u8 = suffix
                    .parse()
                    .map_err(|_| SsidError::SuffixRange(suffix.to_string()))?;
                if n > 15 {
                    return Err(SsidError::SuffixRange(suffix.to_string()));
                }
                Ssid::new(call, n)
            }
            None => Ssid::new(s, 0),
        }
    }
}

impl fmt::Display for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.call(), self.ssid)
    }
}

/// One address in on-air form (mirrors the seven-byte wire layout).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WireAddr {
    call: [u8; CALL_LEN],
    ssid: u8,
}

impl WireAddr {
    /// Borrow an address from the front of a frame, returning the rest.
    pub fn from_prefix(data: &[u8]) -> Option<(&Self, &[u8])> {
        Self::ref_from_prefix(data).ok()
    }

    /// Decode into `(ssid, last, ch)`.
    ///
    /// Fails when any of the six call bytes has its low bit set; those
    /// bits are cleared by the encoding shift, so a set bit means the
    /// frame was not built by an AX.25 encoder.
    pub fn decode(&self) -> Option<(Ssid, bool, bool)> {
        if self.call.iter().any(|&b| b & ADDR_END != 0) {
            return None;
        }
        let mut call = [0u8; CALL_LEN];
        for (o, c) in call.iter_mut().zip(self.call.iter()) {
            *o = c >> 1;
        }
        let ssid = (self.ssid >> 1) & 0x0F;
        let last = self.ssid & ADDR_END != 0;
        let ch = self.ssid & ADDR_CH != 0;
        Some((Ssid { call, ssid }, last, ch))
    }
}
