#![forbid(unsafe_code)]

//! Virtual-interface adapter (component G): read/write frames, exposing the source
//! inner address parsed from the L2/L3 header.
//!
//! Device open, MTU handling, and platform quirks are explicitly out of scope beyond
//! the minimal cross-platform path this crate provides via the `tun` crate — that path
//! is exercised only at construction time, not unit-tested end to end.

pub mod frame;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use svpn_core::endpoint::Endpoint;
use svpn_core::error::{Error, Result};

pub use frame::{rewrite_tun_destination, tap_destination, tap_source, tun_destination, tun_source};

/// Layer-2 Ethernet frames (TAP) or layer-3 IP packets (TUN).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfaceMode {
    Tap,
    Tun,
}

/// Parse a frame's destination inner address, dispatching on `mode` the way
/// [`VirtualInterface::read_frame`] dispatches for the source address.
pub fn destination_of(mode: IfaceMode, frame: &[u8]) -> Option<Endpoint> {
    match mode {
        IfaceMode::Tap => tap_destination(frame),
        IfaceMode::Tun => tun_destination(frame),
    }
}

/// Presents a virtual interface as a `(frame, inner_src)` source/sink, generic over
/// TAP/TUN and over test doubles.
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Read one frame, returning its byte count and parsed source inner address (`None`
    /// if the frame was too short to carry one).
    async fn read_frame(&self, buf: &mut [u8]) -> Result<(usize, Option<Endpoint>)>;

    /// Write one frame. In TAP mode the payload passes through unchanged; in TUN mode
    /// the destination IP in the header may be rewritten to `inner_dst` first (IPv4
    /// only — see [`rewrite_tun_destination`]).
    async fn write_frame(&self, payload: &[u8], inner_dst: Option<&Endpoint>) -> Result<usize>;

    fn mode(&self) -> IfaceMode;
}

/// A real cross-platform TAP/TUN device backed by the `tun` crate. Construction
/// validates the device name/mode/MTU; actual read/write is not exercised by this
/// workspace's test suite beyond the pure byte-layout helpers in [`frame`].
pub struct DeviceInterface {
    device: tokio::sync::Mutex<tun::AsyncDevice>,
    mode: IfaceMode,
}

impl DeviceInterface {
    pub fn open(mode: IfaceMode, mtu: u32) -> Result<Self> {
        let mut config = tun::Configuration::default();
        config.up();
        if mtu > 0 {
            config.mtu(mtu as i32);
        }
        #[cfg(target_os = "linux")]
        config.layer(match mode {
            IfaceMode::Tap => tun::Layer::L2,
            IfaceMode::Tun => tun::Layer::L3,
        });

        let device = tun::create_as_async(&config)
            .map_err(|e| Error::device(format!("failed to open {mode:?} device: {e}")))?;

        Ok(Self {
            device: tokio::sync::Mutex::new(device),
            mode,
        })
    }
}

impl std::fmt::Debug for IfaceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IfaceMode::Tap => write!(f, "tap"),
            IfaceMode::Tun => write!(f, "tun"),
        }
    }
}

#[async_trait]
impl VirtualInterface for DeviceInterface {
    async fn read_frame(&self, buf: &mut [u8]) -> Result<(usize, Option<Endpoint>)> {
        let mut device = self.device.lock().await;
        let n = device
            .read(buf)
            .await
            .map_err(|e| Error::device(format!("iface read: {e}")))?;
        let src = match self.mode {
            IfaceMode::Tap => tap_source(&buf[..n]),
            IfaceMode::Tun => tun_source(&buf[..n]),
        };
        Ok((n, src))
    }

    async fn write_frame(&self, payload: &[u8], inner_dst: Option<&Endpoint>) -> Result<usize> {
        let mut owned;
        let out = match (self.mode, inner_dst) {
            (IfaceMode::Tun, Some(dst)) => {
                owned = payload.to_vec();
                if !rewrite_tun_destination(&mut owned, dst) {
                    warn!(dst = %dst, "TUN destination rewrite skipped (not IPv4)");
                }
                owned.as_slice()
            }
            _ => payload,
        };
        let mut device = self.device.lock().await;
        device
            .write_all(out)
            .await
            .map_err(|e| Error::device(format!("iface write: {e}")))?;
        Ok(out.len())
    }

    fn mode(&self) -> IfaceMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// An in-process virtual interface for testing pumps without a real device.
    struct LoopbackInterface {
        mode: IfaceMode,
        inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl VirtualInterface for LoopbackInterface {
        async fn read_frame(&self, buf: &mut [u8]) -> Result<(usize, Option<Endpoint>)> {
            let frame = self
                .inbound
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .recv()
                .await
                .ok_or_else(|| Error::device("loopback closed"))?;
            let n = frame.len().min(buf.len());
            buf[..n].copy_from_slice(&frame[..n]);
            let src = match self.mode {
                IfaceMode::Tap => tap_source(&buf[..n]),
                IfaceMode::Tun => tun_source(&buf[..n]),
            };
            Ok((n, src))
        }

        async fn write_frame(&self, payload: &[u8], _inner_dst: Option<&Endpoint>) -> Result<usize> {
            self.outbound
                .send(payload.to_vec())
                .map_err(|_| Error::device("loopback closed"))?;
            Ok(payload.len())
        }

        fn mode(&self) -> IfaceMode {
            self.mode
        }
    }

    #[tokio::test]
    async fn tap_pump_exposes_source_mac() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let iface = LoopbackInterface {
            mode: IfaceMode::Tap,
            inbound: Mutex::new(rx),
            outbound: out_tx,
        };

        let mut frame = vec![0u8; frame::TAP_HEADER_MIN];
        frame[6..12].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        tx.send(frame).unwrap();

        let mut buf = [0u8; 64];
        let (_n, src) = iface.read_frame(&mut buf).await.unwrap();
        assert_eq!(src, Some(Endpoint::new("eth", "aa:bb:cc:dd:ee:ff")));
    }
}
