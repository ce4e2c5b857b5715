#![forbid(unsafe_code)]

//! svpn daemon: discovers this host's public UDP endpoint via STUN, drives a NAT
//! translation registry from gossip over a signal bus, and pumps frames between a
//! virtual TAP/TUN interface and the network.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use svpn_control::{BroadcastBus, GossipDriver};
use svpn_core::config::{IfaceMode as ConfigIfaceMode, SvpnConfig};
use svpn_core::endpoint::Endpoint;
use svpn_core::override_nat::OverrideNat;
use svpn_core::registry::NatRegistry;
use svpn_iface::{destination_of, DeviceInterface, IfaceMode, VirtualInterface};
use svpn_transport::{NatConduit, StunSocket};

const STUN_DISCOVER_TIMEOUT: Duration = Duration::from_secs(5);
const DIAGNOSTIC_INTERVAL: Duration = Duration::from_secs(5);

/// Command-line flags. Any value also present in `--config`'s TOML file is overridden
/// by the flag when both are given.
#[derive(Debug, Parser)]
#[command(name = "svpnd", version, about = "Peer-to-peer NAT-traversing overlay link")]
struct Cli {
    /// TOML configuration file. `log_level` is hot-reloaded when the file changes on
    /// disk; every other field is read once at startup.
    #[arg(long)]
    config: Option<PathBuf>,

    /// STUN server used to discover this host's public UDP endpoint.
    #[arg(long)]
    stun_server: Option<String>,

    /// Signal-bus URL. Accepted for forward compatibility with a real broker binding;
    /// unset or unrecognised values fall back to an in-process bus, which only
    /// self-discovers peers started in the same process.
    #[arg(long)]
    control_url: Option<String>,

    /// Virtual interface mode.
    #[arg(long, value_enum)]
    mode: Option<CliIfaceMode>,

    /// MTU hint passed to the interface driver. `0` means device default.
    #[arg(long)]
    mtu: Option<u32>,

    /// Local UDP bind address.
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: String,
}

/// Mirrors `svpn_core::config::IfaceMode` locally so clap can derive `ValueEnum` for it
/// (the orphan rule forbids implementing a foreign trait on a foreign type).
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliIfaceMode {
    Tap,
    Tun,
}

impl From<CliIfaceMode> for ConfigIfaceMode {
    fn from(mode: CliIfaceMode) -> Self {
        match mode {
            CliIfaceMode::Tap => ConfigIfaceMode::Tap,
            CliIfaceMode::Tun => ConfigIfaceMode::Tun,
        }
    }
}

fn udp_endpoint(addr: SocketAddr) -> Endpoint {
    Endpoint::new("udp", addr.to_string())
}

fn endpoint_to_addr(e: &Endpoint) -> Option<SocketAddr> {
    e.value().parse().ok()
}

fn to_iface_mode(mode: ConfigIfaceMode) -> IfaceMode {
    match mode {
        ConfigIfaceMode::Tap => IfaceMode::Tap,
        ConfigIfaceMode::Tun => IfaceMode::Tun,
    }
}

/// Installs the `fmt` subscriber behind a [`reload::Layer`] so the active `EnvFilter`
/// can be swapped at runtime, and returns the handle that does the swapping.
fn init_tracing(log_level: Option<&str>) -> reload::Handle<EnvFilter, Registry> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.unwrap_or("info")));
    let (filter_layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
    handle
}

/// Spawn a task that watches `path` for changes and reloads the tracing filter whenever
/// the parsed `log_level` field changes. Runs for the lifetime of the process.
fn spawn_config_reload(path: PathBuf, filter_handle: reload::Handle<EnvFilter, Registry>) {
    let (_initial, mut cfg_rx) = match SvpnConfig::watch_file(&path) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to watch config file, log level will not hot-reload");
            return;
        }
    };
    tokio::spawn(async move {
        while cfg_rx.changed().await.is_ok() {
            let updated = cfg_rx.borrow().clone();
            let Some(level) = updated.log_level.as_deref() else {
                continue;
            };
            match EnvFilter::try_new(level) {
                Ok(new_filter) => {
                    if filter_handle.reload(new_filter).is_ok() {
                        info!(log_level = %level, path = %path.display(), "reloaded log level from config file");
                    }
                }
                Err(e) => warn!(error = %e, log_level = %level, "ignoring invalid log_level from reloaded config"),
            }
        }
    });
}

fn resolve_config(cli: &Cli) -> Result<SvpnConfig> {
    let mut cfg = match &cli.config {
        Some(path) => SvpnConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SvpnConfig::default(),
    };
    if let Some(server) = &cli.stun_server {
        cfg.stun_server = server.clone();
    }
    if let Some(url) = &cli.control_url {
        cfg.control_url = Some(url.clone());
    }
    if let Some(mode) = cli.mode {
        cfg.mode = mode.into();
    }
    if let Some(mtu) = cli.mtu {
        cfg.mtu = mtu;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = resolve_config(&cli)?;
    let filter_handle = init_tracing(cfg.log_level.as_deref());
    if let Some(path) = &cli.config {
        spawn_config_reload(path.clone(), filter_handle);
    }

    if cfg.control_url.is_some() {
        warn!("--control-url is accepted but not wired to an external broker; using the in-process signal bus");
    }

    info!(stun_server = %cfg.stun_server, mode = ?cfg.mode, "starting svpn");

    let stun_addr: SocketAddr = tokio::net::lookup_host(cfg.stun_server.as_str())
        .await
        .with_context(|| format!("resolving STUN server {}", cfg.stun_server))?
        .next()
        .with_context(|| format!("no addresses for STUN server {}", cfg.stun_server))?;

    let socket = Arc::new(
        StunSocket::bind(cli.bind.as_str(), stun_addr)
            .await
            .context("binding UDP socket")?,
    );

    let self_public = socket
        .discover(STUN_DISCOVER_TIMEOUT)
        .await
        .context("STUN discovery failed")?;
    let self_outer = udp_endpoint(self_public);
    info!(outer = %self_outer, "discovered public endpoint");

    socket.spawn_keepalive(Duration::from_secs(cfg.stun_keepalive_secs));

    let registry = Arc::new(NatRegistry::new());
    let translator = OverrideNat::drop_self_on_outbound(
        ClonedRegistry(Arc::clone(&registry)),
        self_outer.clone(),
    );
    let conduit = Arc::new(NatConduit::new(
        Arc::clone(&socket),
        translator,
        endpoint_to_addr,
        udp_endpoint,
    ));

    let bus = Arc::new(BroadcastBus::default());
    let gossip = Arc::new(GossipDriver::new(
        Arc::clone(&bus),
        Arc::clone(&registry),
        Duration::from_secs(cfg.probe_interval_secs),
    ));
    gossip.start().await;

    let iface_mode = to_iface_mode(cfg.mode);
    let iface: Arc<dyn VirtualInterface> =
        Arc::new(DeviceInterface::open(iface_mode, cfg.mtu).context("opening virtual interface")?);

    let iface_to_net = tokio::spawn(pump_iface_to_net(
        Arc::clone(&iface),
        Arc::clone(&conduit),
        Arc::clone(&registry),
        Arc::clone(&gossip),
        self_outer.clone(),
        iface_mode,
    ));
    let net_to_iface = tokio::spawn(pump_net_to_iface(
        Arc::clone(&iface),
        Arc::clone(&conduit),
    ));
    let diagnostics = tokio::spawn(print_diagnostics(Arc::clone(&registry)));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");

    iface_to_net.abort();
    net_to_iface.abort();
    diagnostics.abort();
    gossip.stop().await;

    Ok(())
}

/// Wraps the shared registry so `OverrideNat<T>` can own a `Translator` by value while
/// every pump keeps its own `Arc` to the same underlying table.
#[derive(Clone)]
struct ClonedRegistry(Arc<NatRegistry>);

impl svpn_core::override_nat::Translator for ClonedRegistry {
    fn translate_outbound(&self, inner: &Endpoint) -> Vec<Endpoint> {
        self.0.translate_outbound(inner)
    }
    fn translate_inbound(&self, outer: &Endpoint) -> Vec<Endpoint> {
        self.0.translate_inbound(outer)
    }
}

async fn pump_iface_to_net(
    iface: Arc<dyn VirtualInterface>,
    conduit: Arc<NatConduit<OverrideNat<ClonedRegistry>>>,
    registry: Arc<NatRegistry>,
    gossip: Arc<GossipDriver<BroadcastBus>>,
    self_outer: Endpoint,
    mode: IfaceMode,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, src) = match iface.read_frame(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "interface read failed, stopping uplink pump");
                return;
            }
        };

        if let Some(src) = &src {
            if registry.translate_outbound(src).iter().all(|o| o != &self_outer) {
                gossip.pin_and_announce(src, &self_outer).await;
            }
        }

        if let Some(dst) = destination_of(mode, &buf[..n]) {
            conduit.write_to(&buf[..n], &dst).await;
        }
    }
}

async fn pump_net_to_iface(
    iface: Arc<dyn VirtualInterface>,
    conduit: Arc<NatConduit<OverrideNat<ClonedRegistry>>>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, inner) = match conduit.read_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "conduit read failed, stopping downlink pump");
                return;
            }
        };
        if let Err(e) = iface.write_frame(&buf[..n], inner.as_ref()).await {
            warn!(error = %e, "interface write failed");
        }
    }
}

async fn print_diagnostics(registry: Arc<NatRegistry>) {
    let mut ticker = tokio::time::interval(DIAGNOSTIC_INTERVAL);
    loop {
        ticker.tick().await;
        let mut pinned = registry.snapshot_pinned();
        pinned.sort();
        for (inner, outer) in &pinned {
            info!(%inner, %outer, "pinned binding");
        }
    }
}
