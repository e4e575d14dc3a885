//! AX.25 v2.2 data-link implementation.
//!
//! The layer stack, bottom up: [`kiss`] unwraps the byte-stuffed TNC
//! envelope, [`frame`] decodes headers into [`event::DlEvent`]s, [`dl`]
//! runs the per-connection automaton, and [`socket`] is the surface user
//! applications hold. [`node::Node`] owns all of it.
//!
//! # Example
//!
//! ```ignore
//! use axlink::ax25::{Node, Ssid};
//!
//! let mut node = Node::new();
//! let listener = node.listen("2E0ITB-1".parse()?)?;
//! node.set_on_connect(listener, |node, sock| {
//!     node.set_on_data(sock, |node, sock, data| {
//!         // Echo everything back.
//!         let payload = data.to_vec();
//!         let _ = node.send(sock, &payload);
//!     });
//! });
//! ```

pub mod conn;
mod dl;
pub mod error;
pub mod event;
pub mod frame;
pub mod kiss;
pub mod node;
pub mod pool;
pub mod socket;
pub mod ssid;
pub mod time;

pub use conn::{ConnId, ConnState, Version};
pub use error::{DlError, FrameError, Result};
pub use event::{DlEvent, EventKind, FrameType};
pub use kiss::{MAX_SERIAL, make_port, port_serial, port_unit};
pub use node::{ConnSnapshot, Counters, Node};
pub use pool::{MAX_PACKET_SIZE, MAX_PACKETS};
pub use socket::{MAX_SOCKETS, SocketId};
pub use ssid::{Ssid, SsidError};
pub use time::{Duration, Instant};
