//! The many-to-many bidirectional NAT translation registry — the core of the crate.
//!
//! A binding's existence is the disjunction of two independent facts: `learned` (an
//! `AddMapping` asserted it, i.e. it arrived via a peer's `ASSOC`) and `pinned` (a local
//! `PinMapping` asserted it). Keeping both bits, rather than collapsing to one pinned
//! flag, is what lets `UnpinMapping` drop-then-keep correctly without the index mix-up
//! the source has: a pinned binding that a peer never learned is dropped outright on
//! unpin; one a peer also announced survives as learned-only.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::endpoint::Endpoint;

#[derive(Debug, Clone, Copy, Default)]
struct BindingState {
    learned: bool,
    pinned: bool,
}

impl BindingState {
    fn exists(&self) -> bool {
        self.learned || self.pinned
    }
}

#[derive(Default)]
struct RegistryState {
    bindings: HashMap<(Endpoint, Endpoint), BindingState>,
    by_inner: HashMap<Endpoint, HashSet<Endpoint>>,
    by_outer: HashMap<Endpoint, HashSet<Endpoint>>,
}

impl RegistryState {
    fn link(&mut self, inner: &Endpoint, outer: &Endpoint) {
        self.by_inner
            .entry(inner.clone())
            .or_default()
            .insert(outer.clone());
        self.by_outer
            .entry(outer.clone())
            .or_default()
            .insert(inner.clone());
    }

    /// Remove the (inner, outer) pair from both indices, pruning keys whose set
    /// becomes empty so no key ever maps to an empty set.
    fn unlink(&mut self, inner: &Endpoint, outer: &Endpoint) {
        if let Some(set) = self.by_inner.get_mut(inner) {
            set.remove(outer);
            if set.is_empty() {
                self.by_inner.remove(inner);
            }
        }
        if let Some(set) = self.by_outer.get_mut(outer) {
            set.remove(inner);
            if set.is_empty() {
                self.by_outer.remove(outer);
            }
        }
    }
}

/// Thread-safe bidirectional many-to-many map inner↔outer with a pin flag and the
/// gossip-facing mutating operations. Holds no network handle; a `GossipDriver` (in
/// `svpn-control`) wraps this with the signal-bus reader/prober and performs the
/// broadcasts this table's operations call for.
#[derive(Default)]
pub struct NatRegistry {
    state: RwLock<RegistryState>,
}

impl NatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learned binding from `ASSOC`: insert with `pinned=false` if absent, otherwise
    /// leave the existing pin flag untouched. Idempotent.
    pub fn add_mapping(&self, inner: &Endpoint, outer: &Endpoint) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let key = (inner.clone(), outer.clone());
        let was_absent = !state
            .bindings
            .get(&key)
            .map(BindingState::exists)
            .unwrap_or(false);
        let entry = state.bindings.entry(key).or_default();
        entry.learned = true;
        if was_absent {
            state.link(inner, outer);
        }
    }

    /// Tombstone from `DISAC`: unconditional removal regardless of pin state.
    pub fn drop_mapping(&self, inner: &Endpoint, outer: &Endpoint) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let key = (inner.clone(), outer.clone());
        if state.bindings.remove(&key).is_some() {
            state.unlink(inner, outer);
        }
    }

    /// Local assertion: insert if absent, set `pinned=true`. The caller is expected to
    /// follow this with an `ASSOC i o` broadcast on the signal bus — this method itself
    /// performs no I/O.
    pub fn pin_mapping(&self, inner: &Endpoint, outer: &Endpoint) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let key = (inner.clone(), outer.clone());
        let was_absent = !state
            .bindings
            .get(&key)
            .map(BindingState::exists)
            .unwrap_or(false);
        let entry = state.bindings.entry(key).or_default();
        entry.pinned = true;
        if was_absent {
            state.link(inner, outer);
        }
    }

    /// Local retraction: clear the pin flag. If the binding was never learned from a
    /// peer, this is equivalent to removal; otherwise it survives as learned-only.
    pub fn unpin_mapping(&self, inner: &Endpoint, outer: &Endpoint) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let key = (inner.clone(), outer.clone());
        let Some(entry) = state.bindings.get_mut(&key) else {
            return;
        };
        entry.pinned = false;
        if !entry.learned {
            state.bindings.remove(&key);
            state.unlink(inner, outer);
        }
    }

    /// Snapshot of `by_inner[inner]`, independent of subsequent mutations.
    pub fn translate_outbound(&self, inner: &Endpoint) -> Vec<Endpoint> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .by_inner
            .get(inner)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of `by_outer[outer]`, independent of subsequent mutations.
    pub fn translate_inbound(&self, outer: &Endpoint) -> Vec<Endpoint> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .by_outer
            .get(outer)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every currently pinned `(inner, outer)` pair, for `Start()`'s `PROBE` reply and
    /// `Stop()`'s tombstone broadcast.
    pub fn snapshot_pinned(&self) -> Vec<(Endpoint, Endpoint)> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .bindings
            .iter()
            .filter(|(_, v)| v.pinned)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(ns: &str, v: &str) -> Endpoint {
        Endpoint::new(ns, v)
    }

    #[test]
    fn symmetry_holds_after_add() {
        let reg = NatRegistry::new();
        let i = ep("eth", "aa:aa:aa:aa:aa:aa");
        let o = ep("udp", "1.2.3.4:1");
        reg.add_mapping(&i, &o);
        assert_eq!(reg.translate_outbound(&i), vec![o.clone()]);
        assert_eq!(reg.translate_inbound(&o), vec![i.clone()]);
    }

    #[test]
    fn repeated_add_is_idempotent() {
        let reg = NatRegistry::new();
        let i = ep("eth", "aa:aa:aa:aa:aa:aa");
        let o = ep("udp", "1.2.3.4:1");
        for _ in 0..5 {
            reg.add_mapping(&i, &o);
        }
        assert_eq!(reg.translate_outbound(&i), vec![o]);
    }

    #[test]
    fn pin_then_unpin_removes_unlearned_binding() {
        let reg = NatRegistry::new();
        let i = ep("eth", "aa:aa:aa:aa:aa:aa");
        let o = ep("udp", "1.2.3.4:1");
        reg.pin_mapping(&i, &o);
        reg.unpin_mapping(&i, &o);
        assert!(reg.translate_outbound(&i).is_empty());
    }

    #[test]
    fn unpin_of_learned_binding_keeps_it_as_learned() {
        let reg = NatRegistry::new();
        let i = ep("eth", "aa:aa:aa:aa:aa:aa");
        let o = ep("udp", "1.2.3.4:1");
        reg.add_mapping(&i, &o);
        reg.pin_mapping(&i, &o);
        reg.unpin_mapping(&i, &o);
        assert_eq!(reg.translate_outbound(&i), vec![o.clone()]);
        assert!(reg.snapshot_pinned().is_empty());
    }

    #[test]
    fn add_then_drop_is_point_symmetric() {
        let reg = NatRegistry::new();
        let i = ep("eth", "aa:aa:aa:aa:aa:aa");
        let o = ep("udp", "1.2.3.4:1");
        reg.add_mapping(&i, &o);
        reg.drop_mapping(&i, &o);
        assert!(reg.translate_outbound(&i).is_empty());
        assert!(reg.translate_inbound(&o).is_empty());
    }

    #[test]
    fn add_never_downgrades_an_existing_pin() {
        let reg = NatRegistry::new();
        let i = ep("eth", "aa:aa:aa:aa:aa:aa");
        let o = ep("udp", "1.2.3.4:1");
        reg.pin_mapping(&i, &o);
        reg.add_mapping(&i, &o);
        assert_eq!(reg.snapshot_pinned(), vec![(i, o)]);
    }

    #[test]
    fn drop_is_unconditional_even_when_pinned() {
        let reg = NatRegistry::new();
        let i = ep("eth", "aa:aa:aa:aa:aa:aa");
        let o = ep("udp", "1.2.3.4:1");
        reg.pin_mapping(&i, &o);
        reg.drop_mapping(&i, &o);
        assert!(reg.translate_outbound(&i).is_empty());
        assert!(reg.snapshot_pinned().is_empty());
    }

    #[test]
    fn scenario_broadcast_alias_fans_to_two_outers() {
        let reg = NatRegistry::new();
        let broadcast = ep("eth", "ff:ff:ff:ff:ff:ff");
        let ux = ep("udp", "10.0.0.1:1");
        let uy = ep("udp", "10.0.0.2:1");
        reg.pin_mapping(&broadcast, &ux);
        reg.add_mapping(&broadcast, &uy);
        let mut outers = reg.translate_outbound(&broadcast);
        outers.sort();
        let mut expected = vec![ux, uy];
        expected.sort();
        assert_eq!(outers, expected);
    }
}
