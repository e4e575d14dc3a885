//! The connection table: per-circuit sequence state, parameters, timers
//! and queues.
//!
//! Connections live in a fixed pool keyed by `(port, local, remote)` and
//! return to it on entering the disconnected state. All references between
//! entities are pool indices; a released slot is simply reinitialised.

use std::collections::VecDeque;
use std::fmt;

use super::pool::{BufId, PacketId};
use super::socket::SocketId;
use super::ssid::Ssid;
use super::time::{Duration, Instant};

/// Capacity of the connection table.
pub const MAX_CONN: usize = 16;

/// T3 keepalive interval.
pub const T3_DURATION_MINUTES: i64 = 15;

/// Largest sequence-number space (modulo-128 operation).
pub const MAX_WINDOW: usize = 128;

/// Handle to a slot in the connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId(pub(crate) usize);

/// The six states of the data-link state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Disconnected,
    AwaitingConnection,
    AwaitingRelease,
    Connected,
    TimerRecovery,
    AwaitingConnect22,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Disconnected => "DISCONNECTED",
            ConnState::AwaitingConnection => "AWAITING_CONNECTION",
            ConnState::AwaitingRelease => "AWAITING_RELEASE",
            ConnState::Connected => "CONNECTED",
            ConnState::TimerRecovery => "TIMER_RECOVERY",
            ConnState::AwaitingConnect22 => "AWAITING_CONNECT_2_2",
        };
        f.write_str(name)
    }
}

/// Protocol version negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    /// Modulo-8 sequence numbers, no SREJ.
    #[default]
    V2_0,
    /// Modulo-128 sequence numbers, SREJ enabled.
    V2_2,
}

/// One virtual circuit.
pub struct Connection {
    pub port: u8,
    pub local: Ssid,
    pub remote: Ssid,

    /// Send state V(S): sequence number of the next I frame to transmit.
    pub snd_state: u8,
    /// Acknowledge state V(A): oldest unacknowledged sequence number.
    pub ack_state: u8,
    /// Receive state V(R): next expected sequence number.
    pub rcv_state: u8,

    pub state: ConnState,
    pub version: Version,
    /// Sequence-number space: 8 or 128.
    pub modulo: u8,
    /// Window size k.
    pub window_size: u8,
    /// Retry count.
    pub rc: u8,
    /// Maximum I-frame payload in bytes.
    pub n1: usize,
    /// Maximum number of retries.
    pub n2: u8,

    pub l3_initiated: bool,
    pub self_busy: bool,
    pub peer_busy: bool,
    pub ack_pending: bool,
    pub srej_enabled: bool,
    pub rej_exception: bool,
    /// Outstanding selective-reject requests.
    pub srej_exception: u8,

    /// Out-of-order received I frames awaiting the gap fill, by N(S).
    pub srej_queue: [Option<BufId>; MAX_WINDOW],
    /// Transmitted-but-unacknowledged I frames, by N(S).
    pub sent_buffer: [Option<PacketId>; MAX_WINDOW],
    /// FIFO of payloads awaiting a window slot.
    pub send_queue: VecDeque<BufId>,

    /// Smoothed round-trip time.
    pub srtt: Duration,
    /// Next T1 interval.
    pub t1v: Duration,
    /// Time left on T1 when it was last stopped.
    pub t1_remaining: Duration,
    /// T2 response-delay interval.
    pub t2: Duration,

    pub t1_expiry: Instant,
    pub t2_expiry: Instant,
    pub t3_expiry: Instant,
    /// Whether T1 last ended by expiring rather than being stopped.
    pub t1_expired: bool,

    pub socket: Option<SocketId>,
}

impl Default for Connection {
    fn default() -> Self {
        Connection {
            port: 0,
            local: Ssid::default(),
            remote: Ssid::default(),
            snd_state: 0,
            ack_state: 0,
            rcv_state: 0,
            state: ConnState::Disconnected,
            version: Version::V2_0,
            modulo: 8,
            window_size: 0,
            rc: 0,
            n1: 2048,
            n2: 10,
            l3_initiated: false,
            self_busy: false,
            peer_busy: false,
            ack_pending: false,
            srej_enabled: false,
            rej_exception: false,
            srej_exception: 0,
            srej_queue: [None; MAX_WINDOW],
            sent_buffer: [None; MAX_WINDOW],
            send_queue: VecDeque::new(),
            srtt: Duration::ZERO,
            t1v: Duration::ZERO,
            t1_remaining: Duration::ZERO,
            t2: Duration::ZERO,
            t1_expiry: Instant::ZERO,
            t2_expiry: Instant::ZERO,
            t3_expiry: Instant::ZERO,
            t1_expired: false,
            socket: None,
        }
    }
}

impl Connection {
    /// Apply the v2.0 parameter set (modulo 8, REJ-only recovery).
    pub fn set_version_2_0(&mut self) {
        self.version = Version::V2_0;
        self.srej_enabled = false;
        self.modulo = 8;
        self.n1 = 2048;
        self.window_size = 4;
        self.t2 = Duration::seconds(3);
        self.n2 = 10;
    }

    /// Apply the v2.2 parameter set (modulo 128, SREJ recovery).
    pub fn set_version_2_2(&mut self) {
        self.version = Version::V2_2;
        self.srej_enabled = true;
        self.modulo = 128;
        self.n1 = 2048;
        self.window_size = 32;
        self.t2 = Duration::seconds(3);
        self.n2 = 10;
    }

    /// Whether the connection uses the 16-bit control field.
    pub fn is_extended(&self) -> bool {
        self.version == Version::V2_2
    }
}

/// Returns true when `low <= x <= high` modulo the sequence space.
pub fn seqno_in_range_incl(low: u8, x: u8, high: u8) -> bool {
    if low <= high {
        low <= x && x <= high
    } else {
        x >= low || x <= high
    }
}

/// Returns true when `low <= x < high` modulo the sequence space.
///
/// The strict upper bound keeps reject handling from asking for a frame
/// that has not been transmitted yet; `low == high` is the empty window.
pub fn seqno_in_range_excl(low: u8, x: u8, high: u8) -> bool {
    use std::cmp::Ordering;
    match low.cmp(&high) {
        Ordering::Equal => false,
        Ordering::Less => low <= x && x < high,
        Ordering::Greater => x >= low || x < high,
    }
}

/// The connection table.
pub struct ConnTable {
    slots: Vec<Connection>,
}

impl ConnTable {
    pub fn new() -> Self {
        ConnTable {
            slots: (0..MAX_CONN).map(|_| Connection::default()).collect(),
        }
    }

    pub fn get(&self, id: ConnId) -> &Connection {
        &self.slots[id.0]
    }

    pub fn get_mut(&mut self, id: ConnId) -> &mut Connection {
        &mut self.slots[id.0]
    }

    /// Iterate over every slot id.
    pub fn ids(&self) -> impl Iterator<Item = ConnId> + use<> {
        (0..MAX_CONN).map(ConnId)
    }

    /// The unique live connection for `(local, remote, port)`.
    pub fn find(&self, local: &Ssid, remote: &Ssid, port: u8) -> Option<ConnId> {
        self.slots.iter().position(|c| {
            c.state != ConnState::Disconnected
                && c.port == port
                && c.local == *local
                && c.remote == *remote
        }).map(ConnId)
    }

    /// The live connection for the key, or a freshly initialised slot.
    /// `None` when the table is full.
    pub fn find_or_create(&mut self, local: &Ssid, remote: &Ssid, port: u8) -> Option<ConnId> {
        let mut free = None;
        for (i, c) in self.slots.iter().enumerate() {
            if c.state != ConnState::Disconnected {
                if c.port == port && c.local == *local && c.remote == *remote {
                    return Some(ConnId(i));
                }
            } else if free.is_none() {
                free = Some(i);
            }
        }
        let idx = free?;
        self.slots[idx] = Connection {
            port,
            local: *local,
            remote: *remote,
            ..Connection::default()
        };
        Some(ConnId(idx))
    }

    /// Reinitialise a slot that has reached the disconnected state.
    ///
    /// The caller must already have stopped every timer and returned all
    /// pool references held by the slot.
    pub fn release(&mut self, id: ConnId) {
        let conn = &mut self.slots[id.0];
        debug_assert_eq!(conn.state, ConnState::Disconnected);
        debug_assert!(conn.t1_expiry.is_zero());
        debug_assert!(conn.t2_expiry.is_zero());
        debug_assert!(conn.t3_expiry.is_zero());
        debug_assert!(conn.socket.is_none());
        *conn = Connection::default();
    }
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}
