//! Datagram transport.
//!
//! `send` is fire-and-forget: failures are logged here and never reach the
//! caller. Inbound datagrams are decoded once and handed to the node's
//! dispatch loop as [`Envelope`]s over an unbounded channel; anything that
//! does not decode is dropped.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::protocol::{decode, encode, Envelope, Message};

pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: SocketAddr, message: Message);

    fn local_addr(&self) -> SocketAddr;
}

pub type Inbound = mpsc::UnboundedReceiver<Envelope>;

/// One UDP socket per node, shared by a reader task and a writer task.
pub struct UdpTransport {
    local: SocketAddr,
    outbound: mpsc::UnboundedSender<(SocketAddr, Message)>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<(Arc<Self>, Inbound)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(SocketAddr, Message)>();

        // reader
        {
            let socket = socket.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65535];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((n, from)) => match decode(&buf[..n]) {
                            Ok(message) => {
                                if in_tx.send(Envelope { from, message }).is_err() {
                                    debug!("[{}] dispatcher gone; reader exiting", local);
                                    break;
                                }
                            }
                            Err(e) => warn!("[{}] dropping malformed datagram from {}: {}", local, from, e),
                        },
                        Err(e) => error!("[{}] recv error: {}", local, e),
                    }
                }
            });
        }

        // writer
        tokio::spawn(async move {
            while let Some((to, msg)) = out_rx.recv().await {
                let buf = match encode(&msg) {
                    Ok(buf) => buf,
                    Err(e) => {
                        error!("[{}] cannot encode {} for {}: {}", local, msg.kind(), to, e);
                        continue;
                    }
                };
                if let Err(e) = socket.send_to(&buf, to).await {
                    debug!("[{}] send {} -> {} failed: {}", local, msg.kind(), to, e);
                }
            }
        });

        Ok((Arc::new(Self { local, outbound: out_tx }), in_rx))
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: SocketAddr, message: Message) {
        if self.outbound.send((to, message)).is_err() {
            error!("[{}] writer task is gone", self.local);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// In-process datagram fabric. Messages still pass through the JSON codec,
/// and any endpoint can be taken down to emulate a crashed or partitioned
/// node.
#[derive(Default)]
pub struct LoopbackNetwork {
    inner: Mutex<LoopbackInner>,
}

#[derive(Default)]
struct LoopbackInner {
    routes: HashMap<SocketAddr, mpsc::UnboundedSender<Envelope>>,
    down: HashSet<SocketAddr>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(self: &Arc<Self>, addr: SocketAddr) -> (Arc<LoopbackTransport>, Inbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().routes.insert(addr, tx);
        let transport = LoopbackTransport { addr, net: self.clone() };
        (Arc::new(transport), rx)
    }

    /// A down endpoint neither sends nor receives.
    pub fn set_down(&self, addr: SocketAddr, down: bool) {
        let mut inner = self.lock();
        if down {
            inner.down.insert(addr);
        } else {
            inner.down.remove(&addr);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackInner> {
        // a panicked test thread must not wedge the others
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, message: Message) {
        let bytes = match encode(&message) {
            Ok(b) => b,
            Err(e) => {
                error!("[{}] cannot encode {} for {}: {}", from, message.kind(), to, e);
                return;
            }
        };
        let inner = self.lock();
        if inner.down.contains(&from) || inner.down.contains(&to) {
            debug!("[{}] {} -> {} lost", from, message.kind(), to);
            return;
        }
        let Some(route) = inner.routes.get(&to) else {
            debug!("[{}] {} -> {} unreachable", from, message.kind(), to);
            return;
        };
        match decode(&bytes) {
            Ok(message) => {
                let _ = route.send(Envelope { from, message });
            }
            Err(e) => warn!("[{}] dropping malformed datagram from {}: {}", to, from, e),
        }
    }
}

pub struct LoopbackTransport {
    addr: SocketAddr,
    net: Arc<LoopbackNetwork>,
}

impl Transport for LoopbackTransport {
    fn send(&self, to: SocketAddr, message: Message) {
        self.net.deliver(self.addr, to, message);
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn loopback_delivers_with_source_address() {
        let net = LoopbackNetwork::new();
        let (a, _rx_a) = net.attach(addr(1));
        let (_b, mut rx_b) = net.attach(addr(2));

        a.send(addr(2), Message::Heartbeat { from: 1 });
        let env = rx_b.recv().await.unwrap();
        assert_eq!(env.from, addr(1));
        assert_eq!(env.message, Message::Heartbeat { from: 1 });
    }

    #[tokio::test]
    async fn down_endpoints_drop_traffic_silently() {
        let net = LoopbackNetwork::new();
        let (a, _rx_a) = net.attach(addr(1));
        let (_b, mut rx_b) = net.attach(addr(2));

        net.set_down(addr(2), true);
        a.send(addr(2), Message::Election { mid: 1 });
        a.send(addr(9), Message::Election { mid: 1 });
        assert!(rx_b.try_recv().is_err());

        net.set_down(addr(2), false);
        a.send(addr(2), Message::Election { mid: 7 });
        assert_eq!(rx_b.recv().await.unwrap().message, Message::Election { mid: 7 });
    }

    #[tokio::test]
    async fn udp_round_trip_and_malformed_drop() {
        let (a, _rx_a) = UdpTransport::bind(addr(0)).await.unwrap();
        let (b, mut rx_b) = UdpTransport::bind(addr(0)).await.unwrap();

        let raw = UdpSocket::bind(addr(0)).await.unwrap();
        raw.send_to(b"{not json", b.local_addr()).await.unwrap();

        a.send(b.local_addr(), Message::ListChatrooms);
        let env = rx_b.recv().await.unwrap();
        assert_eq!(env.message, Message::ListChatrooms);
        assert_eq!(env.from, a.local_addr());
    }
}
