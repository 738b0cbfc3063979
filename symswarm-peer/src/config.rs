//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use symswarm_core::block::{DEFAULT_BLOCK_SIZE, DEFAULT_REPAIR_RATIO, DEFAULT_SYMBOL_SIZE};
use symswarm_core::scheduler::DEFAULT_SLOTS;
use symswarm_core::{CodingParams, SendOrder, SymbolScheduler};

/// Peer configuration. File: ~/.config/symswarm/config.toml or /etc/symswarm/config.toml.
/// Env overrides: SYMSWARM_LISTEN_PORT, SYMSWARM_BLOCK_SIZE, SYMSWARM_SYMBOL_SIZE,
/// SYMSWARM_REPAIR_RATIO, SYMSWARM_SCHEDULER_SLOTS, SYMSWARM_SCHEDULER_SLOT,
/// SYMSWARM_SEND_PACE_MS, SYMSWARM_TRACKER_URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port; 0 picks an ephemeral port.
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_symbol_size")]
    pub symbol_size: u32,
    /// Repair blocks per source block (seeding only).
    #[serde(default = "default_repair_ratio")]
    pub repair_ratio: f64,
    /// Number of seeders striping one leecher's symbols between them (strided order).
    #[serde(default = "default_scheduler_slots")]
    pub scheduler_slots: u32,
    /// This seeder's stripe, `0..scheduler_slots`.
    #[serde(default)]
    pub scheduler_slot: u32,
    /// Pause after each symbol sent.
    #[serde(default = "default_send_pace_ms")]
    pub send_pace_ms: u64,
    #[serde(default)]
    pub send_order: SendOrder,
    /// Overrides the descriptor's announce URL.
    #[serde(default)]
    pub tracker_url: Option<String>,
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}
fn default_symbol_size() -> u32 {
    DEFAULT_SYMBOL_SIZE
}
fn default_repair_ratio() -> f64 {
    DEFAULT_REPAIR_RATIO
}
fn default_scheduler_slots() -> u32 {
    DEFAULT_SLOTS
}
fn default_send_pace_ms() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 0,
            block_size: default_block_size(),
            symbol_size: default_symbol_size(),
            repair_ratio: default_repair_ratio(),
            scheduler_slots: default_scheduler_slots(),
            scheduler_slot: 0,
            send_pace_ms: default_send_pace_ms(),
            send_order: SendOrder::default(),
            tracker_url: None,
        }
    }
}

impl Config {
    pub fn coding_params(&self) -> CodingParams {
        CodingParams {
            block_size: self.block_size,
            symbol_size: self.symbol_size,
            repair_ratio: self.repair_ratio,
        }
    }

    pub fn send_pace(&self) -> Duration {
        Duration::from_millis(self.send_pace_ms)
    }

    /// Scheduler template for this peer's stripe; each connection gets a fresh clone.
    pub fn scheduler(&self) -> Result<SymbolScheduler> {
        SymbolScheduler::new(self.scheduler_slots, self.scheduler_slot).with_context(|| {
            format!(
                "scheduler_slot = {}, scheduler_slots = {}",
                self.scheduler_slot, self.scheduler_slots
            )
        })
    }
}

/// Load config: merge default, then config file (explicit path, else the first default
/// path that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut c = match explicit {
        Some(p) => parse_file(p)?,
        None => load_default_file().unwrap_or_default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    c.scheduler()?;
    Ok(c)
}

fn parse_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/symswarm/config.toml"));
    }
    out.push(PathBuf::from("/etc/symswarm/config.toml"));
    out
}

fn load_default_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "ignoring config file");
            None
        }
    }
}

fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn set<T: FromStr>(field: &mut T, value: Option<String>) {
        if let Some(v) = value.and_then(|s| s.parse().ok()) {
            *field = v;
        }
    }
    set(&mut c.listen_port, lookup("SYMSWARM_LISTEN_PORT"));
    set(&mut c.block_size, lookup("SYMSWARM_BLOCK_SIZE"));
    set(&mut c.symbol_size, lookup("SYMSWARM_SYMBOL_SIZE"));
    set(&mut c.repair_ratio, lookup("SYMSWARM_REPAIR_RATIO"));
    set(&mut c.scheduler_slots, lookup("SYMSWARM_SCHEDULER_SLOTS"));
    set(&mut c.scheduler_slot, lookup("SYMSWARM_SCHEDULER_SLOT"));
    set(&mut c.send_pace_ms, lookup("SYMSWARM_SEND_PACE_MS"));
    if let Some(url) = lookup("SYMSWARM_TRACKER_URL") {
        c.tracker_url = Some(url);
    }
}
