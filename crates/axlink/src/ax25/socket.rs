//! Sockets: the handles user applications hold on the data-link layer.
//!
//! A listening socket is bound to a local address and seeds inbound
//! connections; a connected socket fronts one connection. Callbacks are
//! installed per socket. The accept callback is shared (cloned from the
//! listener into every spawned socket); the per-connection callbacks are
//! `FnMut` slots taken out for the duration of each invocation, so a
//! callback may call straight back into the node.

use std::rc::Rc;

use super::conn::ConnId;
use super::error::DlError;
use super::node::Node;
use super::ssid::Ssid;

/// Capacity of the socket table.
pub const MAX_SOCKETS: usize = 16;

/// Handle to a slot in the socket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketKind {
    #[default]
    Closed,
    Listen,
    Connected,
}

/// Invoked when a connection completes, inbound or outbound.
pub type ConnectFn = Rc<dyn Fn(&mut Node, SocketId)>;
/// Invoked with each in-sequence I-frame payload.
pub type DataFn = Box<dyn FnMut(&mut Node, SocketId, &[u8])>;
/// Invoked when the connection releases.
pub type DisconnectFn = Box<dyn FnMut(&mut Node, SocketId)>;
/// Invoked with each protocol error indication.
pub type ErrorFn = Box<dyn FnMut(&mut Node, SocketId, DlError)>;

/// One socket-table slot.
#[derive(Default)]
pub struct Socket {
    pub kind: SocketKind,
    pub local: Ssid,
    pub conn: Option<ConnId>,
    pub on_connect: Option<ConnectFn>,
    pub on_data: Option<DataFn>,
    pub on_disconnect: Option<DisconnectFn>,
    pub on_error: Option<ErrorFn>,
}

/// The socket table.
pub struct SocketTable {
    slots: Vec<Socket>,
}

impl SocketTable {
    pub fn new() -> Self {
        SocketTable {
            slots: (0..MAX_SOCKETS).map(|_| Socket::default()).collect(),
        }
    }

    pub fn get(&self, id: SocketId) -> &Socket {
        &self.slots[id.0]
    }

    pub fn get_mut(&mut self, id: SocketId) -> &mut Socket {
        &mut self.slots[id.0]
    }

    /// Claim a closed slot. `None` when the table is full.
    pub fn allocate(&mut self, kind: SocketKind, local: Ssid, conn: Option<ConnId>) -> Option<SocketId> {
        let idx = self.slots.iter().position(|s| s.kind == SocketKind::Closed)?;
        self.slots[idx] = Socket {
            kind,
            local,
            conn,
            ..Socket::default()
        };
        Some(SocketId(idx))
    }

    /// Close a slot and drop its callbacks.
    pub fn free(&mut self, id: SocketId) {
        self.slots[id.0] = Socket::default();
    }

    /// The listener bound to `local`, if any.
    pub fn find_listener(&self, local: &Ssid) -> Option<SocketId> {
        self.slots
            .iter()
            .position(|s| s.kind == SocketKind::Listen && s.local == *local)
            .map(SocketId)
    }

    pub fn ids(&self) -> impl Iterator<Item = SocketId> + use<> {
        (0..MAX_SOCKETS).map(SocketId)
    }
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut tbl = SocketTable::new();
        let local: Ssid = "2E0ITB-1".parse().unwrap();
        let id = tbl.allocate(SocketKind::Listen, local, None).unwrap();
        assert_eq!(tbl.get(id).kind, SocketKind::Listen);
        tbl.free(id);
        assert_eq!(tbl.get(id).kind, SocketKind::Closed);
    }

    #[test]
    fn test_find_listener() {
        let mut tbl = SocketTable::new();
        let a: Ssid = "2E0ITB-1".parse().unwrap();
        let b: Ssid = "2E0ITB-2".parse().unwrap();
        let id = tbl.allocate(SocketKind::Listen, a, None).unwrap();
        assert_eq!(tbl.find_listener(&a), Some(id));
        assert_eq!(tbl.find_listener(&b), None);
    }

    #[test]
    fn test_exhaustion() {
        let mut tbl = SocketTable::new();
        let local: Ssid = "2E0ITB".parse().unwrap();
        for _ in 0..MAX_SOCKETS {
            tbl.allocate(SocketKind::Connected, local, None).unwrap();
        }
        assert!(tbl.allocate(SocketKind::Connected, local, None).is_none());
    }
}
