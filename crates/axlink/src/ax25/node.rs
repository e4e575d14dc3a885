//! The node core: single owner of every table and pool.
//!
//! A [`Node`] is one AX.25 station. The platform driver feeds it received
//! serial bytes, calls [`Node::tick`] periodically (sleeping no longer
//! than the returned hint), and flushes the egress queues it fills.
//! Everything else (frame decode, the state machine, socket callbacks)
//! happens synchronously inside those calls, on one thread.

use std::rc::Rc;

use tracing::debug;

use super::conn::{ConnId, ConnState, ConnTable, Version};
use super::error::{DlError, Result};
use super::event::{ADDR_DST, ADDR_SRC, DlEvent, EventKind, FrameType};
use super::frame;
use super::kiss::{Kiss, KissData};
use super::pool::{BufferPool, PacketPool};
use super::socket::{SocketId, SocketKind, SocketTable};
use super::ssid::Ssid;
use super::time::{Duration, Instant};

/// Event and drop counters. Pool exhaustion is an expected condition
/// under load; these make it observable.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    /// Packet pool exhausted.
    pub no_packets: u64,
    /// Buffer pool exhausted.
    pub no_buffers: u64,
    /// Connection table exhausted.
    pub no_connections: u64,
    /// Socket table exhausted.
    pub no_sockets: u64,
    /// KISS frame exceeded the reassembly buffer.
    pub kiss_overrun: u64,
    /// Byte other than TFEND/TFESC followed FESC.
    pub kiss_bad_escape: u64,
    /// KISS command this node does not accept from a TNC.
    pub kiss_unknown_command: u64,
    /// Frame too short for its advertised shape.
    pub frame_underrun: u64,
    /// Address failed the bit-shift check, or a bad address count.
    pub invalid_address: u64,
    /// Frame addressed to some other station.
    pub not_mine: u64,
    /// Frame asked this node to digipeat.
    pub refused_digipeat: u64,
    /// Frames handed to the state machine.
    pub frames_received: u64,
    /// Frames queued for transmit.
    pub frames_sent: u64,
    /// Payload bytes queued for transmit.
    pub bytes_sent: u64,
}

/// Diagnostic snapshot of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnSnapshot {
    pub state: ConnState,
    pub version: Version,
    /// V(S).
    pub snd_state: u8,
    /// V(A).
    pub ack_state: u8,
    /// V(R).
    pub rcv_state: u8,
}

/// One AX.25 station: connection table, socket table, pools, KISS state.
pub struct Node {
    pub(crate) conns: ConnTable,
    pub(crate) sockets: SocketTable,
    pub(crate) packets: PacketPool,
    pub(crate) buffers: BufferPool,
    pub(crate) kiss: Kiss,
    pub(crate) counters: Counters,
    clock: Box<dyn Fn() -> Instant>,
}

impl Node {
    /// A node on the system monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(Box::new(Instant::now))
    }

    /// A node with an injected time source.
    pub fn with_clock(clock: Box<dyn Fn() -> Instant>) -> Self {
        Node {
            conns: ConnTable::new(),
            sockets: SocketTable::new(),
            packets: PacketPool::new(),
            buffers: BufferPool::new(),
            kiss: Kiss::new(),
            counters: Counters::default(),
            clock,
        }
    }

    pub(crate) fn now(&self) -> Instant {
        (self.clock)()
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Diagnostic view of the connection behind a socket, if it is live.
    pub fn connection_snapshot(&self, socket: SocketId) -> Option<ConnSnapshot> {
        let cid = self.sockets.get(socket).conn?;
        let conn = self.conns.get(cid);
        if conn.state == ConnState::Disconnected {
            return None;
        }
        Some(ConnSnapshot {
            state: conn.state,
            version: conn.version,
            snd_state: conn.snd_state,
            ack_state: conn.ack_state,
            rcv_state: conn.rcv_state,
        })
    }

    // ========================================================================
    // Platform interface
    // ========================================================================

    /// Deliver one byte received from a serial line.
    pub fn ingress_byte(&mut self, serial: u8, byte: u8) {
        if let Some(data) = self.kiss.push_byte(serial, byte, &mut self.counters) {
            self.frame_ingress(data);
        }
    }

    /// Deliver a run of received bytes.
    pub fn ingress(&mut self, serial: u8, bytes: &[u8]) {
        for &b in bytes {
            self.ingress_byte(serial, b);
        }
    }

    /// Run the periodic work: the timer-expiry sweep, then the send-queue
    /// drain. Returns the longest the caller may sleep before the next
    /// tick is due.
    pub fn tick(&mut self) -> Duration {
        let hint = self.expire_timers();
        self.drain_send_queues();
        hint
    }

    /// Drain the pending egress bytes for one serial line.
    pub fn take_egress(&mut self, serial: u8) -> Option<bytes::Bytes> {
        self.kiss.take_tx(serial)
    }

    /// Set the TNC's TX delay for a port, in 10 ms units.
    pub fn set_txdelay(&mut self, port: u8, delay: u8) {
        self.kiss.set_txdelay(port, delay);
    }

    /// Set the TNC's slot time for a port, in 10 ms units.
    pub fn set_slottime(&mut self, port: u8, slot: u8) {
        self.kiss.set_slottime(port, slot);
    }

    /// Select half or full duplex for a port.
    pub fn set_duplex(&mut self, port: u8, full_duplex: bool) {
        self.kiss.set_duplex(port, full_duplex);
    }

    // ========================================================================
    // Socket interface
    // ========================================================================

    /// Bind a listening socket to `local`, or return the one already
    /// bound to it.
    pub fn listen(&mut self, local: Ssid) -> Result<SocketId> {
        if let Some(id) = self.sockets.find_listener(&local) {
            return Ok(id);
        }
        let allocated = self.sockets.allocate(SocketKind::Listen, local, None);
        allocated.ok_or_else(|| {
            self.counters.no_sockets += 1;
            DlError::TableFull
        })
    }

    /// Open a v2.0 (modulo-8) connection to `remote`.
    pub fn connect(&mut self, remote: Ssid, local: Ssid, port: u8) -> Result<SocketId> {
        self.connect_inner(remote, local, port, Version::V2_0)
    }

    /// Open a v2.2 (modulo-128, SREJ) connection to `remote`.
    pub fn connect_extended(&mut self, remote: Ssid, local: Ssid, port: u8) -> Result<SocketId> {
        self.connect_inner(remote, local, port, Version::V2_2)
    }

    fn connect_inner(
        &mut self,
        remote: Ssid,
        local: Ssid,
        port: u8,
        version: Version,
    ) -> Result<SocketId> {
        if let Some(cid) = self.conns.find(&local, &remote, port) {
            // Live connection for this key: re-establish it.
            let sid = self.conns.get(cid).socket.ok_or(DlError::NotConnected)?;
            let mut ev = DlEvent::primitive(EventKind::DlConnect, local, remote, port);
            ev.conn = Some(cid);
            self.dispatch(&mut ev);
            return Ok(sid);
        }

        let Some(cid) = self.conns.find_or_create(&local, &remote, port) else {
            self.counters.no_connections += 1;
            return Err(DlError::TableFull);
        };
        let Some(sid) = self
            .sockets
            .allocate(SocketKind::Connected, local, Some(cid))
        else {
            self.counters.no_sockets += 1;
            self.conns.release(cid);
            return Err(DlError::TableFull);
        };

        {
            let conn = self.conns.get_mut(cid);
            conn.socket = Some(sid);
            match version {
                Version::V2_0 => conn.set_version_2_0(),
                Version::V2_2 => conn.set_version_2_2(),
            }
        }

        let mut ev = DlEvent::primitive(EventKind::DlConnect, local, remote, port);
        ev.conn = Some(cid);
        ev.socket = Some(sid);
        self.dispatch(&mut ev);
        Ok(sid)
    }

    /// Queue payload bytes on a connected socket.
    ///
    /// Fails softly under buffer exhaustion: the payload is dropped and
    /// counted, exactly as if the frame had been lost in transit.
    pub fn send(&mut self, socket: SocketId, data: &[u8]) -> Result<()> {
        let cid = self.connected_conn(socket)?;
        let mut ev = DlEvent::internal(EventKind::DlData, cid);
        ev.info = data;
        self.dispatch(&mut ev);
        Ok(())
    }

    /// Begin an orderly release of a connected socket.
    pub fn disconnect(&mut self, socket: SocketId) -> Result<()> {
        let cid = self.connected_conn(socket)?;
        let mut ev = DlEvent::internal(EventKind::DlDisconnect, cid);
        self.dispatch(&mut ev);
        Ok(())
    }

    /// Declare this side busy: the peer is told to stop sending.
    pub fn flow_off(&mut self, socket: SocketId) -> Result<()> {
        let cid = self.connected_conn(socket)?;
        let mut ev = DlEvent::internal(EventKind::DlFlowOff, cid);
        self.dispatch(&mut ev);
        Ok(())
    }

    /// Clear the busy condition set by [`Node::flow_off`].
    pub fn flow_on(&mut self, socket: SocketId) -> Result<()> {
        let cid = self.connected_conn(socket)?;
        let mut ev = DlEvent::internal(EventKind::DlFlowOn, cid);
        self.dispatch(&mut ev);
        Ok(())
    }

    /// Send a connectionless UI frame from `local` to `remote`.
    pub fn unit_data(&mut self, remote: Ssid, local: Ssid, port: u8, data: &[u8]) {
        let mut ev = DlEvent::primitive(EventKind::DlUnitData, local, remote, port);
        ev.info = data;
        ev.conn = self.conns.find(&local, &remote, port);
        self.dispatch(&mut ev);
    }

    fn connected_conn(&self, socket: SocketId) -> Result<ConnId> {
        let sock = self.sockets.get(socket);
        if sock.kind != SocketKind::Connected {
            return Err(DlError::NotConnected);
        }
        sock.conn.ok_or(DlError::NotConnected)
    }

    /// Install the accept callback on a listening (or connected) socket.
    pub fn set_on_connect(
        &mut self,
        socket: SocketId,
        cb: impl Fn(&mut Node, SocketId) + 'static,
    ) {
        self.sockets.get_mut(socket).on_connect = Some(Rc::new(cb));
    }

    /// Install the received-data callback.
    pub fn set_on_data(
        &mut self,
        socket: SocketId,
        cb: impl FnMut(&mut Node, SocketId, &[u8]) + 'static,
    ) {
        self.sockets.get_mut(socket).on_data = Some(Box::new(cb));
    }

    /// Install the disconnect callback.
    pub fn set_on_disconnect(
        &mut self,
        socket: SocketId,
        cb: impl FnMut(&mut Node, SocketId) + 'static,
    ) {
        self.sockets.get_mut(socket).on_disconnect = Some(Box::new(cb));
    }

    /// Install the error callback.
    pub fn set_on_error(
        &mut self,
        socket: SocketId,
        cb: impl FnMut(&mut Node, SocketId, DlError) + 'static,
    ) {
        self.sockets.get_mut(socket).on_error = Some(Box::new(cb));
    }

    // ========================================================================
    // Ingress
    // ========================================================================

    fn frame_ingress(&mut self, data: KissData) {
        let mut input = data.payload();

        let block = match frame::parse_address_block(&mut input) {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "dropping frame");
                match e {
                    super::error::FrameError::AddressUnderrun => self.counters.frame_underrun += 1,
                    _ => self.counters.invalid_address += 1,
                }
                return;
            }
        };

        let active = block.active_destination();
        if !self.is_local(&block.addrs[active]) {
            self.counters.not_mine += 1;
            return;
        }
        if active != ADDR_DST {
            // Addressed through us as a digipeater; we do not relay.
            self.counters.refused_digipeat += 1;
            return;
        }

        let local = block.addrs[ADDR_DST];
        let remote = block.addrs[ADDR_SRC];
        let conn = self.conns.find(&local, &remote, data.port);
        let extended = conn.is_some_and(|c| self.conns.get(c).is_extended());

        let ctl = match frame::parse_control(&mut input, extended) {
            Ok(c) => c,
            Err(_) => {
                self.counters.frame_underrun += 1;
                return;
            }
        };

        let ftype = block.frame_type();
        let mut ev = DlEvent::new(ctl.kind, data.port);
        ev.addrs = block.addrs;
        ev.addr_count = block.count;
        ev.ftype = ftype;
        if ftype == FrameType::Cmd {
            ev.p = ctl.pf;
        } else {
            ev.f = ctl.pf;
        }
        ev.nr = ctl.nr;
        ev.ns = ctl.ns;
        ev.conn = conn;
        ev.socket = conn
            .and_then(|c| self.conns.get(c).socket)
            .or_else(|| self.sockets.find_listener(&local));

        match ctl.kind {
            EventKind::I | EventKind::Ui => {
                if input.is_empty() {
                    // I and UI frames must carry at least a PID.
                    ev.kind = EventKind::IncorrectLength;
                } else {
                    ev.pid = input[0];
                    ev.info = &input[1..];
                }
            }
            EventKind::Test | EventKind::Frmr | EventKind::Xid | EventKind::UnknownFrame => {
                ev.info = input;
            }
            _ => {
                if !input.is_empty() {
                    // S frames and bare U frames have no information field.
                    ev.kind = EventKind::InfoNotPermitted;
                }
            }
        }

        self.counters.frames_received += 1;
        self.dispatch(&mut ev);
    }

    /// Whether a destination address belongs to this station: some socket
    /// or live connection is bound to it.
    fn is_local(&self, ssid: &Ssid) -> bool {
        let socket_bound = self.sockets.ids().any(|id| {
            let s = self.sockets.get(id);
            s.kind != SocketKind::Closed && s.local == *ssid
        });
        socket_bound
            || self.conns.ids().any(|id| {
                let c = self.conns.get(id);
                c.state != ConnState::Disconnected && c.local == *ssid
            })
    }

    // ========================================================================
    // Tickers
    // ========================================================================

    /// Fire every expired timer, re-scanning until a full pass fires
    /// nothing so that chained expiries resolve within one call. Returns
    /// the time until the earliest upcoming expiry.
    fn expire_timers(&mut self) -> Duration {
        let mut now;
        let mut next;
        loop {
            let mut triggered = false;
            now = self.now();
            next = now + Duration::seconds(3600);

            for id in self.conns.ids() {
                for (pick, kind) in [
                    (TimerField::T1, EventKind::TimerExpireT1),
                    (TimerField::T2, EventKind::TimerExpireT2),
                    (TimerField::T3, EventKind::TimerExpireT3),
                ] {
                    let conn = self.conns.get(id);
                    if conn.state == ConnState::Disconnected {
                        break;
                    }
                    let expiry = match pick {
                        TimerField::T1 => conn.t1_expiry,
                        TimerField::T2 => conn.t2_expiry,
                        TimerField::T3 => conn.t3_expiry,
                    };
                    if expiry.is_zero() {
                        continue;
                    }
                    if expiry <= now {
                        let conn = self.conns.get_mut(id);
                        match pick {
                            TimerField::T1 => {
                                conn.t1_expiry = Instant::ZERO;
                                conn.t1_expired = true;
                            }
                            TimerField::T2 => conn.t2_expiry = Instant::ZERO,
                            TimerField::T3 => conn.t3_expiry = Instant::ZERO,
                        }
                        let mut ev = DlEvent::internal(kind, id);
                        self.dispatch(&mut ev);
                        triggered = true;
                    } else {
                        next = next.min(expiry);
                    }
                }
            }

            if !triggered {
                break;
            }
        }
        next - now
    }

    /// Deliver the drain event to every connection with queued data and a
    /// non-busy peer, repeating while progress is being made.
    fn drain_send_queues(&mut self) {
        loop {
            let queued = |node: &Node| -> usize {
                node.conns
                    .ids()
                    .map(|id| node.conns.get(id).send_queue.len())
                    .sum()
            };
            let before = queued(self);
            if before == 0 {
                return;
            }
            for id in self.conns.ids() {
                let conn = self.conns.get(id);
                if conn.state == ConnState::Disconnected
                    || conn.peer_busy
                    || conn.send_queue.is_empty()
                {
                    continue;
                }
                let mut ev = DlEvent::internal(EventKind::DrainSendQueue, id);
                self.dispatch(&mut ev);
            }
            if queued(self) == before {
                return;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum TimerField {
    T1,
    T2,
    T3,
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}
