//! AX.25 v2.2 data-link engine with KISS framing.
//!
//! This crate turns a byte-oriented radio link (a TNC speaking KISS over
//! a serial line or TCP) into reliable, sequenced, flow-controlled
//! virtual circuits between amateur stations. It implements the AX.25
//! v2.2 data-link state machine, both modulo-8 and modulo-128 sequence
//! numbering, selective reject, and the adaptive T1 retransmission timer.
//!
//! # Architecture
//!
//! Everything runs single-threaded and event-driven. An [`ax25::Node`]
//! owns all protocol state; the platform driver feeds it received bytes,
//! ticks its timers, and flushes its egress queues. Handlers never block,
//! and each event is processed atomically. The [`reactor`] module is the
//! hosted driver: a current-thread tokio loop speaking KISS over TCP to
//! TNCs such as Direwolf.
//!
//! # Example
//!
//! ```ignore
//! use axlink::ax25::Node;
//! use axlink::reactor::Reactor;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> std::io::Result<()> {
//!     let mut node = Node::new();
//!     let listener = node.listen("2E0ITB-1".parse().unwrap()).unwrap();
//!     node.set_on_connect(listener, |node, sock| {
//!         node.set_on_data(sock, |node, sock, data| {
//!             let payload = data.to_vec();
//!             let _ = node.send(sock, &payload);
//!         });
//!     });
//!
//!     let mut reactor = Reactor::new(node);
//!     reactor.attach_tcp("localhost:8001").await?;
//!     reactor.run().await
//! }
//! ```

pub mod ax25;
pub mod reactor;

pub use ax25::{Counters, DlError, Node, SocketId, Ssid};
pub use reactor::Reactor;
