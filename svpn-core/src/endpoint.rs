//! Opaque, hashable, text-serialisable `(namespace, value)` address — the one value type
//! shared by the registry, the gossip wire format, and the virtual-interface adapters.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A namespace tag such as `"eth"`, `"udp"`, or `"ip"`. The set is open — this newtype
/// exists so call sites don't pass a raw `&str` where an `Endpoint` is expected, not to
/// enumerate known namespaces.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Wire-shape mirror of an `Endpoint`, field names fixed by the gossip protocol's
/// canonical JSON (`{"network": ..., "string": ...}`).
#[derive(Serialize, Deserialize)]
struct EndpointWire {
    network: String,
    string: String,
}

/// An immutable `(namespace, value)` pair. Equality and hashing are byte-equal on both
/// fields; no semantic validation of `value` is performed here — a MAC, a `host:port`,
/// or a textual IP address are all opaque strings as far as this type is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    namespace: Namespace,
    value: String,
}

impl Endpoint {
    pub fn new(namespace: impl Into<Namespace>, value: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            value: value.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_str()
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Canonical JSON marshal. Total — never fails.
    pub fn marshal(&self) -> String {
        let wire = EndpointWire {
            network: self.namespace.as_str().to_owned(),
            string: self.value.clone(),
        };
        // Serializing a plain struct of two Strings cannot fail.
        serde_json::to_string(&wire).unwrap_or_default()
    }

    /// Parse the canonical JSON form. Tolerant of key order; fails with
    /// `Error::MalformedEndpoint` on malformed JSON or missing fields.
    pub fn unmarshal(text: &str) -> Result<Self> {
        let wire: EndpointWire = serde_json::from_str(text)
            .map_err(|e| Error::malformed(format!("endpoint json: {e}")))?;
        Ok(Self {
            namespace: Namespace::new(wire.network),
            value: wire.string,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.value)
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.namespace.as_str(), self.value.as_str())
            .cmp(&(other.namespace.as_str(), other.value.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_matches_canonical_shape() {
        let e = Endpoint::new("udp", "203.0.113.1:4000");
        assert_eq!(e.marshal(), r#"{"network":"udp","string":"203.0.113.1:4000"}"#);
    }

    #[test]
    fn round_trip() {
        let e = Endpoint::new("eth", "aa:bb:cc:dd:ee:ff");
        let text = e.marshal();
        let back = Endpoint::unmarshal(&text).expect("valid json");
        assert_eq!(e, back);
    }

    #[test]
    fn unmarshal_tolerates_key_order() {
        let text = r#"{"string":"10.0.0.1","network":"ip"}"#;
        let e = Endpoint::unmarshal(text).expect("valid json");
        assert_eq!(e, Endpoint::new("ip", "10.0.0.1"));
    }

    #[test]
    fn unmarshal_rejects_missing_field() {
        let text = r#"{"network":"ip"}"#;
        assert!(Endpoint::unmarshal(text).is_err());
    }

    #[test]
    fn unmarshal_rejects_malformed_json() {
        assert!(Endpoint::unmarshal("not json").is_err());
    }

    #[test]
    fn ordering_is_lexicographic_on_namespace_then_value() {
        let a = Endpoint::new("eth", "aa:aa:aa:aa:aa:aa");
        let b = Endpoint::new("udp", "0.0.0.0:1");
        assert!(a < b);
    }
}
