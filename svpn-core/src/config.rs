#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Configuration handling. Parses a TOML file into a strongly-typed structure and
//! supports hot-reloading via the `notify` crate. All public APIs are `async`-ready
//! but do not impose an async runtime themselves.

use notify::{
    Event, EventKind, RecommendedWatcher, RecursiveMode, Result as NotifyResult, Watcher,
};
use serde::Deserialize;
use std::{fs, path::Path, sync::Arc};
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Virtual interface mode: layer-2 Ethernet frames or layer-3 IP packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfaceMode {
    Tap,
    Tun,
}

impl Default for IfaceMode {
    fn default() -> Self {
        IfaceMode::Tap
    }
}

/// Primary configuration structure shared across the workspace's binaries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SvpnConfig {
    /// Logging verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: Option<String>,

    /// STUN server used to discover this host's public UDP endpoint.
    #[serde(default = "default_stun_server")]
    pub stun_server: String,

    /// Signal-bus URL. Only the in-process bus adapter is wired by default; binding
    /// this to a real broker is left to the embedding application.
    pub control_url: Option<String>,

    /// Virtual interface mode.
    pub mode: IfaceMode,

    /// MTU hint passed to the virtual interface driver. `0` means "device default".
    pub mtu: u32,

    /// Minimum 10s; zero or negative (represented here as `0`) disables the loop.
    #[serde(default = "default_keepalive_secs")]
    pub stun_keepalive_secs: u64,

    /// Minimum 10s; `0` disables periodic re-probing.
    #[serde(default = "default_probe_secs")]
    pub probe_interval_secs: u64,
}

impl Default for SvpnConfig {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            stun_server: default_stun_server(),
            control_url: None,
            mode: IfaceMode::default(),
            mtu: 0,
            stun_keepalive_secs: default_keepalive_secs(),
            probe_interval_secs: default_probe_secs(),
        }
    }
}

fn default_stun_server() -> String {
    "stun.l.google.com:19302".to_string()
}

fn default_keepalive_secs() -> u64 {
    25
}

fn default_probe_secs() -> u64 {
    30
}

impl SvpnConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path).map_err(Error::from)?;
        let cfg = toml::from_str::<SvpnConfig>(&data).map_err(Error::from)?;
        Ok(cfg)
    }

    /// Watch the configuration file for changes and receive updates through a watch
    /// channel.
    ///
    /// Returns the initial configuration and a [`watch::Receiver`] that yields a new
    /// [`SvpnConfig`] wrapped in [`Arc`] every time the file is modified on disk.
    pub fn watch_file<P: AsRef<Path>>(
        path: P,
    ) -> Result<(Arc<SvpnConfig>, watch::Receiver<Arc<SvpnConfig>>)> {
        let path_buf = path.as_ref().to_path_buf();
        let initial_cfg = Arc::new(Self::from_file(&path_buf)?);
        let path_in_closure = path_buf.clone();
        let (tx, rx) = watch::channel::<Arc<SvpnConfig>>(initial_cfg.clone());

        // `notify` requires the watcher to stay alive for as long as we want events. We
        // spawn it in the background and intentionally leak it so that it lives for the
        // process lifetime, avoiding a guard type in the public API.
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: NotifyResult<Event>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Modify(_)) {
                        match Self::from_file(&path_in_closure) {
                            Ok(updated) => {
                                let _ = tx.send(Arc::new(updated));
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "config reload failed, keeping previous value");
                            }
                        }
                    }
                }
            })?;

        watcher.watch(&path_buf, RecursiveMode::NonRecursive)?;
        std::mem::forget(watcher);

        Ok((initial_cfg, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = SvpnConfig::default();
        assert_eq!(cfg.stun_server, "stun.l.google.com:19302");
        assert_eq!(cfg.mode, IfaceMode::Tap);
        assert!(cfg.stun_keepalive_secs >= 10);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml = r#"
            mode = "tun"
            mtu = 1400
        "#;
        let cfg: SvpnConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.mode, IfaceMode::Tun);
        assert_eq!(cfg.mtu, 1400);
        assert_eq!(cfg.stun_server, "stun.l.google.com:19302");
    }

    #[test]
    fn from_file_reads_and_parses_a_real_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(file, r#"stun_server = "stun.example.org:3478""#).unwrap();
        writeln!(file, r#"mode = "tun""#).unwrap();

        let cfg = SvpnConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.stun_server, "stun.example.org:3478");
        assert_eq!(cfg.mode, IfaceMode::Tun);
    }

    #[test]
    fn from_file_surfaces_config_error_on_missing_path() {
        let result = SvpnConfig::from_file("/nonexistent/svpn.toml");
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
