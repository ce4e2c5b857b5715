//! The gossip protocol grammar (`PROBE` / `ASSOC` / `DISAC`) and the driver that ties a
//! [`SignalBus`] to a [`NatRegistry`]: a reader task dispatching incoming messages to
//! the registry, and an optional prober re-announcing this host's pinned bindings.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use svpn_core::endpoint::Endpoint;
use svpn_core::registry::NatRegistry;

use crate::bus::SignalBus;

const MIN_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum ten seconds; zero disables periodic re-probing (matches the STUN keepalive
/// clamp rule — see the design note on interval semantics).
fn normalize_probe_interval(interval: Duration) -> Option<Duration> {
    if interval.is_zero() {
        None
    } else if interval < MIN_PROBE_INTERVAL {
        Some(MIN_PROBE_INTERVAL)
    } else {
        Some(interval)
    }
}

/// A decoded gossip message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    Probe,
    Assoc(Endpoint, Endpoint),
    Disac(Endpoint, Endpoint),
}

/// Parse one line of the wire grammar. Any unrecognised first token, wrong arity, or
/// base64/JSON decode failure returns `None` — the caller drops the message silently
/// rather than treating it as an error worth propagating.
pub fn parse(line: &str) -> Option<GossipMessage> {
    let mut parts = line.split(' ');
    match parts.next()? {
        "PROBE" => {
            if parts.next().is_some() {
                return None;
            }
            Some(GossipMessage::Probe)
        }
        "ASSOC" => decode_pair(parts).map(|(i, o)| GossipMessage::Assoc(i, o)),
        "DISAC" => decode_pair(parts).map(|(i, o)| GossipMessage::Disac(i, o)),
        _ => None,
    }
}

fn decode_pair<'a>(mut parts: impl Iterator<Item = &'a str>) -> Option<(Endpoint, Endpoint)> {
    let a = parts.next()?;
    let b = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let i = decode_b64_endpoint(a)?;
    let o = decode_b64_endpoint(b)?;
    Some((i, o))
}

fn decode_b64_endpoint(field: &str) -> Option<Endpoint> {
    let bytes = BASE64.decode(field).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    Endpoint::unmarshal(&text).ok()
}

fn encode_b64_endpoint(e: &Endpoint) -> String {
    BASE64.encode(e.marshal())
}

pub fn encode_probe() -> String {
    "PROBE".to_string()
}

pub fn encode_assoc(inner: &Endpoint, outer: &Endpoint) -> String {
    format!("ASSOC {} {}", encode_b64_endpoint(inner), encode_b64_endpoint(outer))
}

pub fn encode_disac(inner: &Endpoint, outer: &Endpoint) -> String {
    format!("DISAC {} {}", encode_b64_endpoint(inner), encode_b64_endpoint(outer))
}

struct Tasks {
    reader: JoinHandle<()>,
    prober: Option<JoinHandle<()>>,
}

/// Drives a [`NatRegistry`] from a [`SignalBus`]: dispatches incoming gossip, and
/// optionally re-announces pinned bindings on a timer. `Start`/`Stop` are not expected
/// to be called concurrently with themselves.
pub struct GossipDriver<B: SignalBus + 'static> {
    bus: Arc<B>,
    registry: Arc<NatRegistry>,
    probe_interval: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
}

impl<B: SignalBus + 'static> GossipDriver<B> {
    pub fn new(bus: Arc<B>, registry: Arc<NatRegistry>, probe_interval: Duration) -> Self {
        Self {
            bus,
            registry,
            probe_interval,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(None),
        }
    }

    /// Reply to a received `PROBE` by broadcasting `ASSOC` for every currently pinned
    /// binding. This is the dispatch target for an incoming `GossipMessage::Probe`, not
    /// the act of sending a probe request — see `send_probe` for that.
    pub async fn respond_to_probe(&self) {
        for (inner, outer) in self.registry.snapshot_pinned() {
            if let Err(e) = self.bus.send(&encode_assoc(&inner, &outer)).await {
                warn!(error = %e, "failed to announce pinned binding");
            }
        }
    }

    /// Broadcast a `PROBE`, prompting every other peer listening on the bus to announce
    /// its pinned bindings via `respond_to_probe`.
    pub async fn send_probe(&self) {
        if let Err(e) = self.bus.send(&encode_probe()).await {
            warn!(error = %e, "failed to broadcast probe");
        }
    }

    /// Local assertion of a single binding: `PinMapping` on the registry followed by the
    /// single `ASSOC` broadcast the operation table calls for. The registry lock is
    /// released before this method ever touches the bus.
    pub async fn pin_and_announce(&self, inner: &Endpoint, outer: &Endpoint) {
        self.registry.pin_mapping(inner, outer);
        if let Err(e) = self.bus.send(&encode_assoc(inner, outer)).await {
            warn!(error = %e, "failed to announce pinned binding");
        }
    }

    fn dispatch(registry: &NatRegistry, line: &str) {
        match parse(line) {
            Some(GossipMessage::Probe) => {
                // Handled by the driver itself (see `respond_to_probe`), not by dispatch —
                // a bare PROBE carries no registry mutation, only a reply obligation.
            }
            Some(GossipMessage::Assoc(i, o)) => registry.add_mapping(&i, &o),
            Some(GossipMessage::Disac(i, o)) => registry.drop_mapping(&i, &o),
            None => debug!(%line, "ignoring malformed or unrecognised gossip message"),
        }
    }

    /// Spawn the reader and (if enabled) prober tasks, then perform one immediate
    /// `Probe()`.
    pub async fn start(self: &Arc<Self>) {
        let reader = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => break,
                        msg = this.bus.recv() => {
                            match msg {
                                Ok(line) => {
                                    if matches!(parse(&line), Some(GossipMessage::Probe)) {
                                        this.respond_to_probe().await;
                                    } else {
                                        Self::dispatch(&this.registry, &line);
                                    }
                                }
                                Err(e) if e.is_benign() => continue,
                                Err(e) => {
                                    warn!(error = %e, "signal bus transport closed, stopping reader");
                                    break;
                                }
                            }
                        }
                    }
                }
            })
        };

        let prober = normalize_probe_interval(self.probe_interval).map(|interval| {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick fires immediately; skip it, Start() already probed
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => break,
                        _ = ticker.tick() => this.send_probe().await,
                    }
                }
            })
        });

        *self.tasks.lock().await = Some(Tasks { reader, prober });
        self.send_probe().await;
    }

    /// Signal both tasks to terminate, wait for them to exit, then broadcast `DISAC`
    /// for every currently pinned binding (best-effort tombstone).
    pub async fn stop(self: &Arc<Self>) {
        self.cancel.cancel();
        if let Some(tasks) = self.tasks.lock().await.take() {
            let _ = tasks.reader.await;
            if let Some(prober) = tasks.prober {
                let _ = prober.await;
            }
        }
        for (inner, outer) in self.registry.snapshot_pinned() {
            if let Err(e) = self.bus.send(&encode_disac(&inner, &outer)).await {
                warn!(error = %e, "failed to broadcast tombstone on stop");
            }
        }
    }

    pub fn registry(&self) -> &Arc<NatRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastBus;

    fn ep(ns: &str, v: &str) -> Endpoint {
        Endpoint::new(ns, v)
    }

    #[test]
    fn assoc_round_trips_through_base64_json() {
        let i = ep("eth", "aa:aa:aa:aa:aa:aa");
        let o = ep("udp", "1.2.3.4:1");
        let line = encode_assoc(&i, &o);
        assert_eq!(parse(&line), Some(GossipMessage::Assoc(i, o)));
    }

    #[test]
    fn malformed_assoc_is_ignored() {
        assert_eq!(parse("ASSOC notbase64 alsonot"), None);
    }

    #[test]
    fn unrecognised_first_token_is_ignored() {
        assert_eq!(parse("HELLO world"), None);
    }

    #[test]
    fn probe_has_no_arguments() {
        assert_eq!(parse("PROBE"), Some(GossipMessage::Probe));
        assert_eq!(parse("PROBE extra"), None);
    }

    #[tokio::test]
    async fn assoc_then_disac_round_trips_registry_state() {
        let registry = Arc::new(NatRegistry::new());
        let i = ep("eth", "aa:aa:aa:aa:aa:aa");
        let o = ep("udp", "1.2.3.4:1");

        GossipDriver::<BroadcastBus>::dispatch(&registry, &encode_assoc(&i, &o));
        assert_eq!(registry.translate_outbound(&i), vec![o.clone()]);

        GossipDriver::<BroadcastBus>::dispatch(&registry, &encode_disac(&i, &o));
        assert!(registry.translate_outbound(&i).is_empty());
    }

    #[tokio::test]
    async fn probe_from_peer_converges_pinned_binding() {
        let bus_x = Arc::new(BroadcastBus::new(16));
        let bus_y = Arc::new(bus_x.subscribe()) as Arc<BroadcastBus>;

        let reg_x = Arc::new(NatRegistry::new());
        let i = ep("eth", "aa:aa:aa:aa:aa:aa");
        let o = ep("udp", "1.2.3.4:1");
        reg_x.pin_mapping(&i, &o);

        let driver_x = Arc::new(GossipDriver::new(bus_x.clone(), reg_x, Duration::ZERO));
        driver_x.start().await;

        let reg_y = Arc::new(NatRegistry::new());
        let driver_y = Arc::new(GossipDriver::new(bus_y, reg_y.clone(), Duration::ZERO));
        driver_y.start().await;

        bus_x.send(&encode_probe()).await.unwrap();

        // Give the reader task a turn to process the PROBE and the resulting ASSOC.
        for _ in 0..50 {
            if !reg_y.translate_outbound(&i).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(reg_y.translate_outbound(&i), vec![o]);

        driver_x.stop().await;
        driver_y.stop().await;
    }
}
