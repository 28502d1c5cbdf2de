//! UDP datagram transport.
//!
//! Sends go straight out on the shared socket; receives run on a
//! dedicated pump thread that feeds the node. UDP sends almost never
//! block, so the sync `Transport::send` stays cheap.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use wr_link::{LinkNode, Transport};

/// Largest datagram we ever expect; everything the link layer emits is
/// MTU-bounded well below this.
const RECV_BUF: usize = 4096;

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(listen: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(listen)
            .with_context(|| format!("binding UDP socket on {listen}"))?;
        info!(%listen, "UDP transport bound");
        Ok(Self { socket })
    }

    /// Spawn the receive pump: one blocking thread reading datagrams and
    /// handing them to the node.
    pub fn spawn_receive_pump(&self, node: Arc<LinkNode>) -> Result<JoinHandle<()>> {
        let socket = self.socket.try_clone().context("cloning UDP socket")?;
        let handle = std::thread::Builder::new()
            .name("wr-udp-recv".into())
            .spawn(move || {
                let mut buf = [0u8; RECV_BUF];
                loop {
                    match socket.recv_from(&mut buf) {
                        Ok((len, from)) => node.handle_datagram(&buf[..len], from),
                        Err(err) => {
                            warn!(%err, "UDP receive failed");
                            return;
                        }
                    }
                }
            })
            .context("spawning receive pump")?;
        Ok(handle)
    }
}

impl Transport for UdpTransport {
    fn send(&self, datagram: &[u8], dest: SocketAddr) {
        if let Err(err) = self.socket.send_to(datagram, dest) {
            debug!(%dest, %err, "UDP send failed");
        }
    }
}
