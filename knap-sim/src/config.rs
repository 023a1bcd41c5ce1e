//! Load simulator config from file and environment.

use knap_core::config::ManagerConfig;
use knap_core::protocol::TriggerMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Simulator configuration. File: ~/.config/knap/config.toml or /etc/knap/config.toml.
/// Env overrides: KNAP_BUTTONS, KNAP_CLICK_INTERVAL_MS, KNAP_TRIGGER_MODE.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Simulated buttons to pair (default 2).
    #[serde(default = "default_buttons")]
    pub buttons: usize,
    /// Mean time between simulated presses (default 1500).
    #[serde(default = "default_click_interval_ms")]
    pub click_interval_ms: u64,
    /// Trigger mode applied to every button (default all categories).
    #[serde(default)]
    pub trigger_mode: TriggerMode,
    #[serde(default)]
    pub manager: ManagerConfig,
}

fn default_buttons() -> usize {
    2
}
fn default_click_interval_ms() -> u64 {
    1500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buttons: default_buttons(),
            click_interval_ms: default_click_interval_ms(),
            trigger_mode: TriggerMode::default(),
            manager: ManagerConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Apply overrides from `var`; unparsable values are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("KNAP_BUTTONS") {
        if let Ok(n) = s.parse::<usize>() {
            c.buttons = n;
        }
    }
    if let Some(s) = var("KNAP_CLICK_INTERVAL_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.click_interval_ms = ms.max(1);
        }
    }
    if let Some(s) = var("KNAP_TRIGGER_MODE") {
        match s.parse::<TriggerMode>() {
            Ok(mode) => c.trigger_mode = mode,
            Err(e) => warn!(error = %e, "Ignoring KNAP_TRIGGER_MODE"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/knap/config.toml"));
    }
    out.push(PathBuf::from("/etc/knap/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    read(&path)
}

fn read(path: &Path) -> Option<Config> {
    let s = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring invalid config file");
            None
        }
    }
}
