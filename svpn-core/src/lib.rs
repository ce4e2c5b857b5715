#![forbid(unsafe_code)]

//! Core data types for svpn: the `Endpoint` value, the NAT translation registry, the
//! override wrapper, configuration, and error handling.
//!
//! This crate is pure Rust and holds no network handle; `svpn-transport` and
//! `svpn-control` build the STUN socket, the packet conduit, and the gossip driver on
//! top of it.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod override_nat;
pub mod registry;

pub use endpoint::{Endpoint, Namespace};
pub use error::{Error, Result};
pub use override_nat::{OverrideNat, Translator};
pub use registry::NatRegistry;
