//! Engine tunables. Deserializable so hosts can embed it in their own config files.

use std::time::Duration;

use serde::Deserialize;

use crate::table::EvictionPolicy;

/// Default routing table capacity (entries).
pub const DEFAULT_TABLE_CAPACITY: usize = 32;

/// Routing engine configuration. All durations are in milliseconds on the wire/config side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Maximum number of routing entries (default 32).
    #[serde(default = "default_table_capacity")]
    pub table_capacity: usize,
    /// What to do when the table is full and a new destination arrives.
    #[serde(default)]
    pub eviction: EvictionPolicy,
    /// How long a forwarded probe waits for the next hop's ack (default 3000).
    #[serde(default = "default_reply_wait_ms")]
    pub reply_wait_ms: u64,
    /// Lifetime of an unconfirmed reverse-path entry (default 6000).
    #[serde(default = "default_reverse_expiry_ms")]
    pub reverse_expiry_ms: u64,
    /// How long an originated discovery waits for a reply (default 5000).
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
}

fn default_table_capacity() -> usize {
    DEFAULT_TABLE_CAPACITY
}
fn default_reply_wait_ms() -> u64 {
    3000
}
fn default_reverse_expiry_ms() -> u64 {
    6000
}
fn default_discovery_timeout_ms() -> u64 {
    5000
}

impl Config {
    pub fn reply_wait(&self) -> Duration {
        Duration::from_millis(self.reply_wait_ms)
    }

    pub fn reverse_expiry(&self) -> Duration {
        Duration::from_millis(self.reverse_expiry_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            table_capacity: default_table_capacity(),
            eviction: EvictionPolicy::default(),
            reply_wait_ms: default_reply_wait_ms(),
            reverse_expiry_ms: default_reverse_expiry_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
        }
    }
}
