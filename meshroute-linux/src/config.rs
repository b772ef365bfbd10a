//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use meshroute_core::NodeAddress;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/meshroute/config.toml or /etc/meshroute/config.toml.
/// Env overrides: MESHROUTE_ADDRESS, MESHROUTE_PORT, MESHROUTE_GROUP, MESHROUTE_TARGET.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// This node's address, `a.b` (default "1.0").
    #[serde(default = "default_address")]
    pub address: String,
    /// UDP port shared by every node for both channels (default 45680).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Multicast group standing in for the radio broadcast channel.
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    /// Destination used by a bare `route` command.
    #[serde(default)]
    pub target: Option<String>,
    /// Only hear these nodes (emulates radio range). Empty hears everyone.
    #[serde(default)]
    pub neighbors: Vec<String>,
    /// Upper bound of the random delay before each broadcast (default 50 ms).
    #[serde(default = "default_rebroadcast_jitter_ms")]
    pub rebroadcast_jitter_ms: u64,
    /// tracing filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub routing: meshroute_core::Config,
}

fn default_address() -> String {
    "1.0".to_string()
}
fn default_port() -> u16 {
    45680
}
fn default_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 60, 61)
}
fn default_rebroadcast_jitter_ms() -> u64 {
    50
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            group: default_group(),
            target: None,
            neighbors: Vec::new(),
            rebroadcast_jitter_ms: default_rebroadcast_jitter_ms(),
            log_level: default_log_level(),
            routing: meshroute_core::Config::default(),
        }
    }
}

impl Config {
    pub fn node_address(&self) -> anyhow::Result<NodeAddress> {
        self.address
            .parse()
            .with_context(|| format!("invalid node address {:?}", self.address))
    }

    pub fn target_address(&self) -> anyhow::Result<Option<NodeAddress>> {
        self.target
            .as_deref()
            .map(|t| {
                t.parse()
                    .with_context(|| format!("invalid target address {:?}", t))
            })
            .transpose()
    }

    pub fn neighbor_addresses(&self) -> anyhow::Result<Vec<NodeAddress>> {
        self.neighbors
            .iter()
            .map(|n| {
                n.parse()
                    .with_context(|| format!("invalid neighbor address {:?}", n))
            })
            .collect()
    }

    pub fn rebroadcast_jitter(&self) -> Duration {
        Duration::from_millis(self.rebroadcast_jitter_ms)
    }
}

/// Load config: default, then config file (explicit path, else the first standard path present), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("MESHROUTE_ADDRESS") {
        c.address = s;
    }
    if let Some(s) = var("MESHROUTE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Some(s) = var("MESHROUTE_GROUP") {
        if let Ok(g) = s.parse::<Ipv4Addr>() {
            c.group = g;
        }
    }
    if let Some(s) = var("MESHROUTE_TARGET") {
        c.target = Some(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshroute/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshroute/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))
}
