#![forbid(unsafe_code)]

//! The signal bus adapter (component C) and the gossip protocol + driver that connects
//! it to a `svpn_core::NatRegistry`.

pub mod bus;
pub mod gossip;

pub use bus::{BroadcastBus, SignalBus};
pub use gossip::{GossipDriver, GossipMessage};
