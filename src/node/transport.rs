use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::service::AgreementHandle;
use crate::agreement::error::AgreementError;
use crate::membership::types::SiteId;
use crate::retry::Backoff;

/// Largest datagram we try to read.
const MAX_DATAGRAM_BYTES: usize = 65536;

/// Fire-and-forget delivery of encoded frames to peer sites.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Returns `false` when the frame could not be handed to the network.
    async fn send(&self, to: SiteId, frame: Vec<u8>) -> bool;
}

/// Hands `frame` to `transport`, retrying up to `attempts` times with `backoff` in between.
pub async fn send_with_retry(
    transport: &dyn PeerTransport,
    to: SiteId,
    frame: Vec<u8>,
    attempts: u32,
    mut backoff: Backoff,
) -> Result<(), AgreementError> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if transport.send(to, frame.clone()).await {
            return Ok(());
        }
        if attempt < attempts {
            tracing::trace!("Send {} to {} failed, retrying", attempt, to);
            backoff.wait().await;
        }
    }

    Err(AgreementError::TransientNetworkError {
        site: to,
        reason: format!("send failed after {} attempt(s)", attempts),
    })
}

/// One datagram per frame over a shared UDP socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peers: BTreeMap<SiteId, SocketAddr>,
}

impl UdpTransport {
    pub async fn bind(bind_addr: SocketAddr, peers: BTreeMap<SiteId, SocketAddr>) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        tracing::info!("Gossip socket bound to {}", socket.local_addr()?);

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            peers,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Feeds every received datagram into the agreement loop behind `handle`.
    pub fn spawn_receiver(self: &Arc<Self>, handle: AgreementHandle) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            transport.receive_loop(handle).await;
        })
    }

    async fn receive_loop(&self, handle: AgreementHandle) {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    if !handle.deliver(buf[..len].to_vec()) {
                        tracing::debug!("Agreement queue full, dropping frame from {}", src);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

#[async_trait]
impl PeerTransport for UdpTransport {
    async fn send(&self, to: SiteId, frame: Vec<u8>) -> bool {
        let Some(addr) = self.peers.get(&to) else {
            tracing::warn!("No gossip address known for site {}", to);
            return false;
        };

        match self.socket.send_to(&frame, addr).await {
            Ok(sent) => sent == frame.len(),
            Err(e) => {
                tracing::debug!("Failed to send {} bytes to {} ({}): {}", frame.len(), to, addr, e);
                false
            }
        }
    }
}
