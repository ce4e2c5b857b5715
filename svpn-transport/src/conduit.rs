//! The NAT-aware packet conduit: bridges `(frame, inner-addr)` on the virtual-interface
//! side with `(datagram, outer-addr)` on the UDP side, via a [`Translator`].

use std::net::SocketAddr;
use std::sync::Mutex;

use tracing::debug;

use svpn_core::endpoint::Endpoint;
use svpn_core::error::Result;
use svpn_core::override_nat::Translator;

use crate::socket::StunSocket;

/// The tail of a physical datagram that claimed more than one inner alias: the cached
/// payload, its source outer endpoint, and the inner aliases still owed a delivery.
struct PendingFanout {
    payload: Vec<u8>,
    source_outer: Endpoint,
    remaining_inners: Vec<Endpoint>,
}

/// Wraps a single datagram socket and a translator, exposing `read_from`/`write_to`
/// with the fan-out semantics the virtual-interface pumps rely on. The ingress queue is
/// guarded by its own mutex, independent of the registry lock inside `translator`.
pub struct NatConduit<T: Translator> {
    socket: std::sync::Arc<StunSocket>,
    translator: T,
    pending: Mutex<Option<PendingFanout>>,
    outer_to_addr: fn(&Endpoint) -> Option<SocketAddr>,
    addr_to_outer: fn(SocketAddr) -> Endpoint,
}

impl<T: Translator> NatConduit<T> {
    pub fn new(
        socket: std::sync::Arc<StunSocket>,
        translator: T,
        outer_to_addr: fn(&Endpoint) -> Option<SocketAddr>,
        addr_to_outer: fn(SocketAddr) -> Endpoint,
    ) -> Self {
        Self {
            socket,
            translator,
            pending: Mutex::new(None),
            outer_to_addr,
            addr_to_outer,
        }
    }

    /// Egress: fan `payload` out to every outer endpoint mapped from `inner_dst`.
    /// Individual send failures are swallowed — one unreachable peer must not block
    /// delivery to the others. Always reports `payload.len()`.
    pub async fn write_to(&self, payload: &[u8], inner_dst: &Endpoint) -> usize {
        let outers = self.translator.translate_outbound(inner_dst);
        for outer in &outers {
            let Some(addr) = (self.outer_to_addr)(outer) else {
                continue;
            };
            if let Err(e) = self.socket.send_to(payload, addr).await {
                debug!(outer = %outer, error = %e, "fanout send failed, continuing");
            }
        }
        payload.len()
    }

    /// Ingress: pops a queued alias if one is pending, otherwise reads a fresh datagram
    /// and expands it across every inner alias mapped from its source outer endpoint,
    /// queuing the tail. Returns `(n, Some(inner))` for a recognised alias, `(n, None)`
    /// for a datagram from an unmapped outer endpoint.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Option<Endpoint>)> {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = pending.as_mut() {
                let inner = slot.remaining_inners.remove(0);
                let n = slot.payload.len().min(buf.len());
                buf[..n].copy_from_slice(&slot.payload[..n]);
                if slot.remaining_inners.is_empty() {
                    *pending = None;
                }
                return Ok((n, Some(inner)));
            }
        }

        let mut staging = vec![0u8; buf.len().max(2048)];
        let (len, src) = self.socket.recv_from(&mut staging).await?;
        let payload = &staging[..len];
        let source_outer = (self.addr_to_outer)(src);

        let mut inners = self.translator.translate_inbound(&source_outer);
        if inners.is_empty() {
            let n = len.min(buf.len());
            buf[..n].copy_from_slice(&payload[..n]);
            return Ok((n, None));
        }

        let first = inners.remove(0);
        let n = len.min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);

        if !inners.is_empty() {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            *pending = Some(PendingFanout {
                payload: payload.to_vec(),
                source_outer,
                remaining_inners: inners,
            });
        }

        Ok((n, Some(first)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svpn_core::registry::NatRegistry;
    use tokio::net::UdpSocket as TokioUdp;

    fn udp_endpoint(addr: SocketAddr) -> Endpoint {
        Endpoint::new("udp", addr.to_string())
    }

    fn endpoint_to_addr(e: &Endpoint) -> Option<SocketAddr> {
        e.value().parse().ok()
    }

    async fn bound_socket() -> std::sync::Arc<StunSocket> {
        std::sync::Arc::new(StunSocket::bind("127.0.0.1:0", "127.0.0.1:1").await.unwrap())
    }

    #[tokio::test]
    async fn two_aliases_fan_out_over_successive_reads() {
        let socket = bound_socket().await;
        let local_addr = socket.local_addr().unwrap();

        let sender = TokioUdp::bind("127.0.0.1:0").await.unwrap();
        let sender_addr = sender.local_addr().unwrap();

        let reg = NatRegistry::new();
        let i1 = Endpoint::new("eth", "aa:aa:aa:aa:aa:aa");
        let i2 = Endpoint::new("eth", "bb:bb:bb:bb:bb:bb");
        let o = udp_endpoint(sender_addr);
        reg.add_mapping(&i1, &o);
        reg.add_mapping(&i2, &o);

        let conduit = NatConduit::new(socket, reg, endpoint_to_addr, udp_endpoint);

        sender.send_to(b"hello", local_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n1, src1) = conduit.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n1], b"hello");
        let (n2, src2) = conduit.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n2], b"hello");

        let mut seen = vec![src1.unwrap(), src2.unwrap()];
        seen.sort();
        let mut expected = vec![i1, i2];
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn unmapped_source_returns_none_without_polluting_queue() {
        let socket = bound_socket().await;
        let local_addr = socket.local_addr().unwrap();
        let sender = TokioUdp::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"ping", local_addr).await.unwrap();

        let reg = NatRegistry::new();
        let conduit = NatConduit::new(socket, reg, endpoint_to_addr, udp_endpoint);

        let mut buf = [0u8; 16];
        let (n, src) = conduit.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert!(src.is_none());
    }
}
