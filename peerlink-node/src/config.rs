//! Load node config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration. File: ~/.config/peerlink/config.toml or /etc/peerlink/config.toml.
/// Env overrides: PEERLINK_DISCOVERY_PORT, PEERLINK_LISTEN_PORT, PEERLINK_APP_ID, PEERLINK_ADVERTISE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// First discovery datagram port (default 56789).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Contiguous fallback ports after `discovery_port`; adverts go to all of them (default 10).
    #[serde(default = "default_discovery_port_count")]
    pub discovery_port_count: u16,
    /// First port of the scanned stream listener range (default 57000).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_listen_port_count")]
    pub listen_port_count: u16,
    /// Broadcast addresses adverts are sent to.
    #[serde(default = "default_broadcast_targets")]
    pub broadcast_targets: Vec<String>,
    #[serde(default = "default_true")]
    pub advertise: bool,
    #[serde(default = "default_advertise_interval_ms")]
    pub advertise_interval_ms: u64,
    /// Upper bound on one idle wait of the network worker.
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_max_frames_per_tick")]
    pub max_frames_per_tick: usize,
    /// Application partition; empty accepts every application.
    #[serde(default)]
    pub app_id: String,
}

fn default_discovery_port() -> u16 {
    56789
}
fn default_discovery_port_count() -> u16 {
    10
}
fn default_listen_port() -> u16 {
    57000
}
fn default_listen_port_count() -> u16 {
    100
}
fn default_broadcast_targets() -> Vec<String> {
    vec!["255.255.255.255".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_advertise_interval_ms() -> u64 {
    2000
}
fn default_poll_wait_ms() -> u64 {
    100
}
fn default_handshake_timeout_ms() -> u64 {
    500
}
fn default_dial_timeout_ms() -> u64 {
    1000
}
fn default_max_frames_per_tick() -> usize {
    peerlink_core::DEFAULT_MAX_FRAMES_PER_TICK
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            discovery_port_count: default_discovery_port_count(),
            listen_port: default_listen_port(),
            listen_port_count: default_listen_port_count(),
            broadcast_targets: default_broadcast_targets(),
            advertise: true,
            advertise_interval_ms: default_advertise_interval_ms(),
            poll_wait_ms: default_poll_wait_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            max_frames_per_tick: default_max_frames_per_tick(),
            app_id: String::new(),
        }
    }
}

impl NodeConfig {
    pub fn advertise_interval(&self) -> Duration {
        Duration::from_millis(self.advertise_interval_ms)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> NodeConfig {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut NodeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("PEERLINK_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("PEERLINK_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(s) = var("PEERLINK_APP_ID") {
        c.app_id = s;
    }
    if let Some(b) = var("PEERLINK_ADVERTISE").and_then(|s| parse_bool(&s)) {
        c.advertise = b;
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn load_file() -> Option<NodeConfig> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<NodeConfig>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "invalid config, using defaults"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config, using defaults"),
            }
            break;
        }
    }
    None
}
