//! STUN-bound UDP socket: a single unconnected UDP socket plus a background keepalive
//! task that periodically re-sends a Binding Request to a fixed STUN server and caches
//! whatever public endpoint the last reply carried.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

use svpn_core::error::{Error, Result};

use crate::stun::StunMessage;

/// An internal staging buffer large enough that a STUN reply is always decoded in full
/// even if the caller's own read buffer is smaller.
const STUN_STAGING_BUF: usize = 4096;

const MIN_KEEPALIVE: Duration = Duration::from_secs(10);

/// Minimum ten seconds; zero disables the loop entirely (the source's "negative
/// disables, small positive clamps to ten seconds" rule — see the STUN keepalive open
/// question).
fn normalize_keepalive(interval: Duration) -> Option<Duration> {
    if interval.is_zero() {
        None
    } else if interval < MIN_KEEPALIVE {
        Some(MIN_KEEPALIVE)
    } else {
        Some(interval)
    }
}

/// Wraps an unconnected UDP socket, a fixed STUN server endpoint, and a keepalive
/// interval. STUN datagrams are consumed transparently; everything else passes through
/// to `recv_from`.
pub struct StunSocket {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    public_endpoint: Arc<RwLock<Option<SocketAddr>>>,
}

impl StunSocket {
    /// Bind to `bind_addr` (use `0.0.0.0:0` / `[::]:0` for "any") and prepare to query
    /// `server` for the reflexive address.
    pub async fn bind(bind_addr: impl ToSocketAddrs, server: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(Error::from)?;
        Ok(Self {
            socket: Arc::new(socket),
            server,
            public_endpoint: Arc::new(RwLock::new(None)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::from)
    }

    /// Last successfully decoded reflexive address, or `None` before the first reply.
    pub async fn public_endpoint(&self) -> Option<SocketAddr> {
        *self.public_endpoint.read().await
    }

    /// Send one Binding Request and block until either a STUN reply updates
    /// `public_endpoint` or `deadline` elapses (surfaced as `Error::Timeout`). Intended
    /// to be called once at startup; the keepalive task in [`Self::spawn_keepalive`]
    /// takes over afterwards.
    pub async fn discover(&self, deadline: Duration) -> Result<SocketAddr> {
        self.send_binding_request().await?;
        timeout(deadline, self.wait_for_reply())
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn wait_for_reply(&self) -> Result<SocketAddr> {
        let mut buf = vec![0u8; STUN_STAGING_BUF];
        loop {
            let (len, _src) = self.socket.recv_from(&mut buf).await.map_err(Error::from)?;
            if let Some(addr) = self.try_consume_stun(&buf[..len]).await {
                return Ok(addr);
            }
        }
    }

    /// Send a single Binding Request to the configured server. A 1-second write
    /// timeout bounds the call; write errors are reported to the caller (the keepalive
    /// loop logs and continues instead of propagating).
    async fn send_binding_request(&self) -> Result<()> {
        let request = StunMessage::binding_request();
        let encoded = request.encode();
        timeout(Duration::from_secs(1), self.socket.send_to(&encoded, self.server))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::from)?;
        Ok(())
    }

    /// If `data` decodes as a STUN message carrying XOR-MAPPED-ADDRESS, cache and
    /// return the address. Decoding is purely structural — any well-formed STUN
    /// message is consumed, with no correlation to a specific outstanding request.
    async fn try_consume_stun(&self, data: &[u8]) -> Option<SocketAddr> {
        let msg = StunMessage::decode(data).ok()?;
        let addr = msg.xor_mapped_address().ok().flatten()?;
        *self.public_endpoint.write().await = Some(addr);
        Some(addr)
    }

    /// Read a datagram. STUN replies are intercepted and consumed (updating
    /// `public_endpoint` but never returned to the caller); only non-STUN datagrams are
    /// surfaced.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut staging = vec![0u8; STUN_STAGING_BUF.max(buf.len())];
        loop {
            let (len, src) = self.socket.recv_from(&mut staging).await.map_err(Error::from)?;
            if self.try_consume_stun(&staging[..len]).await.is_some() {
                continue;
            }
            let copy_len = len.min(buf.len());
            buf[..copy_len].copy_from_slice(&staging[..copy_len]);
            return Ok((copy_len, src));
        }
    }

    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        self.socket.send_to(buf, target).await.map_err(Error::from)
    }

    /// Spawn the cooperative keepalive task: re-sends a Binding Request every
    /// `interval`. `interval` is normalized per [`normalize_keepalive`] before the loop
    /// starts; a zero interval means the task returns immediately without looping.
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let Some(interval) = normalize_keepalive(interval) else {
            return tokio::spawn(async {});
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = this.send_binding_request().await {
                    warn!(error = %e, "STUN keepalive request failed");
                } else {
                    debug!("STUN keepalive request sent");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_interval_is_clamped_and_zero_disables() {
        assert_eq!(normalize_keepalive(Duration::from_secs(1)), Some(MIN_KEEPALIVE));
        assert_eq!(normalize_keepalive(Duration::from_secs(30)), Some(Duration::from_secs(30)));
        assert_eq!(normalize_keepalive(Duration::ZERO), None);
    }

    #[tokio::test]
    async fn discover_against_a_minimal_stun_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, client_addr) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();
            let mut response = request.clone();
            response.header.message_type = crate::stun::MessageType::BindingResponse;
            response.add_xor_mapped_address(client_addr);
            let encoded = response.encode();
            server.send_to(&encoded, client_addr).await.unwrap();
        });

        let client = StunSocket::bind("127.0.0.1:0", server_addr).await.unwrap();
        let addr = client.discover(Duration::from_secs(2)).await.unwrap();
        assert_eq!(addr.ip(), client.local_addr().unwrap().ip());
        assert_eq!(client.public_endpoint().await, Some(addr));
    }

    #[tokio::test]
    async fn discover_times_out_with_no_server() {
        let client = StunSocket::bind("127.0.0.1:0", "127.0.0.1:1").await.unwrap();
        let result = client.discover(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
