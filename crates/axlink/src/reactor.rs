//! Hosted platform driver: a current-thread reactor for KISS-over-TCP
//! links.
//!
//! The reactor owns the main loop the concurrency model calls for: it
//! reads bytes from each attached TNC, hands them to the node, runs the
//! periodic tick, flushes egress, and sleeps no longer than the tick
//! hint. The node itself never blocks and never leaves this task; only
//! the per-link read halves run as spawned tasks, forwarding raw bytes
//! over a channel.
//!
//! KISS over TCP is the interface soundmodems such as Direwolf expose
//! (conventionally on port 8001).

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ax25::Node;
use crate::ax25::kiss::MAX_SERIAL;

/// The single-threaded driver owning a [`Node`] and its serial links.
pub struct Reactor {
    node: Node,
    links: Vec<OwnedWriteHalf>,
    rx: mpsc::Receiver<(u8, Bytes)>,
    tx: mpsc::Sender<(u8, Bytes)>,
}

impl Reactor {
    pub fn new(node: Node) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Reactor {
            node,
            links: Vec::new(),
            rx,
            tx,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    /// Connect to a TNC's KISS TCP port. Returns the serial index the
    /// link was assigned.
    pub async fn attach_tcp(&mut self, addr: &str) -> io::Result<u8> {
        if self.links.len() >= MAX_SERIAL {
            return Err(io::Error::other("all serial slots in use"));
        }
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let serial = self.links.len() as u8;
        let (mut read, write) = stream.into_split();
        self.links.push(write);

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                buf.reserve(4096);
                match read.read_buf(&mut buf).await {
                    Ok(0) => {
                        debug!(serial, "link closed by peer");
                        break;
                    }
                    Ok(_) => {
                        if tx.send((serial, buf.split().freeze())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(serial, error = %e, "link read failed");
                        break;
                    }
                }
            }
        });
        Ok(serial)
    }

    /// Run until the process is cancelled or a link write fails.
    pub async fn run(mut self) -> io::Result<()> {
        loop {
            let hint = self.node.tick();
            self.flush().await?;

            tokio::select! {
                received = self.rx.recv() => {
                    let Some((serial, bytes)) = received else {
                        return Ok(());
                    };
                    self.node.ingress(serial, &bytes);
                    // Drain whatever else already arrived before ticking.
                    while let Ok((serial, bytes)) = self.rx.try_recv() {
                        self.node.ingress(serial, &bytes);
                    }
                }
                _ = tokio::time::sleep(hint.to_std()) => {}
            }
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        for serial in 0..self.links.len() {
            if let Some(bytes) = self.node.take_egress(serial as u8) {
                self.links[serial].write_all(&bytes).await?;
            }
        }
        Ok(())
    }
}
