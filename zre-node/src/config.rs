//! Load config from file and environment.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use zre_core::BEACON_PORT;

/// Node configuration. File: ~/.config/zre/config.toml or
/// /etc/zre/config.toml. Env overrides: ZRE_NAME, ZRE_PORT,
/// ZRE_BEACON_PORT, ZRE_INTERVAL_MS, ZRE_HOST, ZRE_GROUP.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Node name; defaults to the first 6 hex chars of the UUID.
    #[serde(default)]
    pub name: Option<String>,
    /// TCP inbox port; 0 picks an ephemeral port.
    #[serde(default)]
    pub port: u16,
    /// UDP discovery port (default 5670).
    #[serde(default = "default_beacon_port")]
    pub beacon_port: u16,
    /// Beacon publish interval in milliseconds (default 1000).
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Address advertised in the endpoint; autodetected when unset.
    #[serde(default)]
    pub host: Option<String>,
    /// Group the chat daemon joins (default "chat").
    #[serde(default = "default_group")]
    pub group: String,
    /// Headers advertised to every new peer in HELLO.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_beacon_port() -> u16 {
    BEACON_PORT
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_group() -> String {
    "chat".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            port: 0,
            beacon_port: default_beacon_port(),
            interval_ms: default_interval_ms(),
            host: None,
            group: default_group(),
            headers: HashMap::new(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("ZRE_NAME") {
        if !s.is_empty() {
            c.name = Some(s);
        }
    }
    if let Ok(s) = std::env::var("ZRE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Ok(s) = std::env::var("ZRE_BEACON_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.beacon_port = p;
        }
    }
    if let Ok(s) = std::env::var("ZRE_INTERVAL_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.interval_ms = ms;
        }
    }
    if let Ok(s) = std::env::var("ZRE_HOST") {
        if !s.is_empty() {
            c.host = Some(s);
        }
    }
    if let Ok(s) = std::env::var("ZRE_GROUP") {
        if !s.is_empty() {
            c.group = s;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/zre/config.toml"));
    }
    out.push(PathBuf::from("/etc/zre/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
