//! Signal bus adapter (component C): a framed text-message duplex over a pub/sub
//! channel. The concrete broker binding (MQTT, websocket, etc.) is an external
//! integration; this crate defines the trait every gossip driver depends on, plus one
//! in-process adapter for composition and testing.

use async_trait::async_trait;
use tokio::sync::broadcast;

use svpn_core::error::{Error, Result};

/// A reliable duplex stream of text messages shared by every peer on a topic. The core
/// assumes: messages arrive intact (no partial reads across message boundaries); the
/// local sender may or may not receive its own messages (the registry must be
/// resilient either way); out-of-order delivery between peers is permitted.
#[async_trait]
pub trait SignalBus: Send + Sync {
    async fn send(&self, msg: &str) -> Result<()>;

    /// Blocks until a message is available. Callers that need a deadline wrap this
    /// with `tokio::time::timeout` and treat its expiry as `Error::Timeout`, which the
    /// gossip reader treats as benign and retries.
    async fn recv(&self) -> Result<String>;
}

/// An in-process topic backed by `tokio::sync::broadcast`. Every clone (via
/// [`BroadcastBus::subscribe`]) is an independent subscriber; a sender does receive its
/// own broadcasts, which exercises the resilience path called out for signal buses that
/// loop messages back (see the design note on the signal bus's self-delivery
/// behavior).
#[derive(Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<String>,
    rx: std::sync::Arc<tokio::sync::Mutex<broadcast::Receiver<String>>>,
}

impl BroadcastBus {
    /// Create a new topic with the given channel capacity (messages buffered per lagging
    /// subscriber before old ones are dropped).
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = broadcast::channel(capacity);
        Self {
            tx,
            rx: std::sync::Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Subscribe another peer to the same in-process topic.
    pub fn subscribe(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: std::sync::Arc::new(tokio::sync::Mutex::new(self.tx.subscribe())),
        }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl SignalBus for BroadcastBus {
    async fn send(&self, msg: &str) -> Result<()> {
        self.tx
            .send(msg.to_owned())
            .map_err(|_| Error::transport_closed("no subscribers on broadcast bus"))?;
        Ok(())
    }

    async fn recv(&self) -> Result<String> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(msg) => return Ok(msg),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::transport_closed("broadcast bus closed"))
                }
            }
        }
    }
}
