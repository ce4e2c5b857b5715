//! Optional filter functions composed on top of a translator — e.g. "drop candidates
//! equal to my own outer endpoint" for hairpin avoidance.
//!
//! Grounded on `overridenat.go`, which wraps a `NAT` with two filter closures applied
//! after delegating to the inner translator. That file's `TranslateOutbound` sources its
//! filter input from `s.NAT.TranslateInbound(addr)` rather than `TranslateOutbound` —
//! the wrong direction, presumably a copy-paste slip from `TranslateInbound` just above
//! it. This wrapper uses each method's own matching-direction candidate list, per the
//! clean definition of the override wrapper as "a filter over a translator's own
//! candidates."

use crate::endpoint::Endpoint;

/// A translator: something that can resolve an inner address to its outer candidates
/// and vice versa. Implemented by `NatRegistry` directly; `OverrideNat` also implements
/// it so overrides can stack.
pub trait Translator: Send + Sync {
    fn translate_outbound(&self, inner: &Endpoint) -> Vec<Endpoint>;
    fn translate_inbound(&self, outer: &Endpoint) -> Vec<Endpoint>;
}

impl Translator for crate::registry::NatRegistry {
    fn translate_outbound(&self, inner: &Endpoint) -> Vec<Endpoint> {
        crate::registry::NatRegistry::translate_outbound(self, inner)
    }
    fn translate_inbound(&self, outer: &Endpoint) -> Vec<Endpoint> {
        crate::registry::NatRegistry::translate_inbound(self, outer)
    }
}

type Filter = Box<dyn Fn(&Endpoint, Vec<Endpoint>) -> Vec<Endpoint> + Send + Sync>;

/// A pure transformation composed over any `Translator`. Owns no state of its own
/// beyond the two optional filter closures.
pub struct OverrideNat<T: Translator> {
    inner: T,
    outbound_override: Option<Filter>,
    inbound_override: Option<Filter>,
}

impl<T: Translator> OverrideNat<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            outbound_override: None,
            inbound_override: None,
        }
    }

    pub fn with_outbound_override(
        mut self,
        f: impl Fn(&Endpoint, Vec<Endpoint>) -> Vec<Endpoint> + Send + Sync + 'static,
    ) -> Self {
        self.outbound_override = Some(Box::new(f));
        self
    }

    pub fn with_inbound_override(
        mut self,
        f: impl Fn(&Endpoint, Vec<Endpoint>) -> Vec<Endpoint> + Send + Sync + 'static,
    ) -> Self {
        self.inbound_override = Some(Box::new(f));
        self
    }

    /// Convenience constructor for hairpin avoidance: drop any outbound candidate equal
    /// to this host's own outer endpoint.
    pub fn drop_self_on_outbound(inner: T, self_outer: Endpoint) -> Self {
        Self::new(inner).with_outbound_override(move |_src, candidates| {
            candidates
                .into_iter()
                .filter(|c| c != &self_outer)
                .collect()
        })
    }
}

impl<T: Translator> Translator for OverrideNat<T> {
    fn translate_outbound(&self, inner: &Endpoint) -> Vec<Endpoint> {
        let candidates = self.inner.translate_outbound(inner);
        match &self.outbound_override {
            Some(f) => f(inner, candidates),
            None => candidates,
        }
    }

    fn translate_inbound(&self, outer: &Endpoint) -> Vec<Endpoint> {
        let candidates = self.inner.translate_inbound(outer);
        match &self.inbound_override {
            Some(f) => f(outer, candidates),
            None => candidates,
        }
    }
}
