// SPDX-License-Identifier: MIT
//! Layered daemon configuration.
//!
//! Priority (highest to lowest): CLI / env var  >  `{data_dir}/config.toml`
//! >  built-in default. Agent definitions live in `[agents.<id>]` sections
//! and are turned into the typed [`AgentRegistry`](crate::registry::AgentRegistry)
//! at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::error;

use crate::maintenance::MaintenanceWindow;
use crate::registry::AgentSpec;

const DEFAULT_SELF_AGENT_ID: &str = "sentinel";
const DEFAULT_EVALUATION_INTERVAL_SECS: u64 = 300;

// ─── SafetyThresholds ─────────────────────────────────────────────────────────

/// Shared safety thresholds (`[safety]` in config.toml).
///
/// The escalation ladder, auto-restart controller, and kill-switch advisory
/// all read from this one struct so a single canonical set of numbers
/// governs every decision path.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SafetyThresholds {
    /// Heartbeat window consulted per decision (newest N). Default: 5.
    pub heartbeat_window: u32,
    /// Consecutive missed beats that trigger auto-restart (level 2). Default: 3.
    pub missed_beats_for_restart: u32,
    /// Maximum restart attempts per agent inside the rate window. Default: 3.
    pub max_restarts_per_window: u32,
    /// Trailing rate-limit window in seconds. Default: 3600 (1 hour) — the
    /// canonical window; see DESIGN.md.
    pub restart_window_secs: u64,
    /// Grace period after a restart command before polling the health
    /// endpoint for confirmation. Default: 5 seconds.
    pub restart_grace_secs: u64,
    /// Days of heartbeat history to retain. Default: 7.
    pub heartbeat_retention_days: u32,
    /// Kill advisory: unhealthy beats out of the last 10 that justify a
    /// kill recommendation. Default: 5.
    pub advisory_unhealthy_beats: u32,
    /// Kill advisory: cumulative rolling error count across the newest 3
    /// heartbeats that justifies a kill recommendation. Default: 10.
    pub advisory_error_burst: u32,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            heartbeat_window: 5,
            missed_beats_for_restart: 3,
            max_restarts_per_window: 3,
            restart_window_secs: 3600,
            restart_grace_secs: 5,
            heartbeat_retention_days: 7,
            advisory_unhealthy_beats: 5,
            advisory_error_burst: 10,
        }
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,sentineld=trace" (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default) | "json" (structured for log aggregators).
    log_format: Option<String>,
    /// Agent id the oversight engine itself runs under. The kill switch
    /// rejects this id unconditionally. Default: "sentinel".
    self_agent_id: Option<String>,
    /// Seconds between fleet evaluation cycles in `serve` mode (default: 300).
    evaluation_interval_secs: Option<u64>,
    /// Webhook URL for human notifications. Omit to log-only.
    notify_url: Option<String>,
    /// Safety thresholds (`[safety]`).
    safety: Option<SafetyThresholds>,
    /// Maintenance window (`[maintenance]`).
    maintenance: Option<MaintenanceWindow>,
    /// Supervised agents (`[agents.<id>]`).
    agents: Option<HashMap<String, AgentSpec>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── OversightConfig ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OversightConfig {
    pub data_dir: PathBuf,
    pub log: String,
    /// "pretty" | "json".
    pub log_format: String,
    /// The engine's own agent id — the one id the kill switch must never accept.
    pub self_agent_id: String,
    pub evaluation_interval_secs: u64,
    /// Webhook URL for the notification channel (SENTINELD_NOTIFY_URL env var).
    /// None = notifications are logged but not delivered.
    pub notify_url: Option<String>,
    pub safety: SafetyThresholds,
    pub maintenance: MaintenanceWindow,
    /// Raw agent sections; wrapped into an `AgentRegistry` by the caller.
    pub agents: HashMap<String, AgentSpec>,
}

impl OversightConfig {
    /// Build config from CLI/env args + optional TOML file.
    pub fn new(data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let log_format = std::env::var("SENTINELD_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let self_agent_id = toml
            .self_agent_id
            .unwrap_or_else(|| DEFAULT_SELF_AGENT_ID.to_string());

        let evaluation_interval_secs = toml
            .evaluation_interval_secs
            .unwrap_or(DEFAULT_EVALUATION_INTERVAL_SECS);

        let notify_url = std::env::var("SENTINELD_NOTIFY_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.notify_url);

        Self {
            data_dir,
            log,
            log_format,
            self_agent_id,
            evaluation_interval_secs,
            notify_url,
            safety: toml.safety.unwrap_or_default(),
            maintenance: toml.maintenance.unwrap_or_default(),
            agents: toml.agents.unwrap_or_default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("sentineld");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/sentineld or ~/.local/share/sentineld
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("sentineld");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("sentineld");
        }
    }
    #[allow(unreachable_code)]
    PathBuf::from(".sentineld")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceScope;

    #[test]
    fn defaults_apply_without_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = OversightConfig::new(Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.log, "info");
        assert_eq!(cfg.self_agent_id, "sentinel");
        assert_eq!(cfg.safety.missed_beats_for_restart, 3);
        assert_eq!(cfg.safety.max_restarts_per_window, 3);
        assert!(cfg.agents.is_empty());
        assert!(!cfg.maintenance.active);
    }

    #[test]
    fn toml_agents_and_safety_are_parsed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
log = "debug"
self_agent_id = "overseer"

[safety]
heartbeat_window = 10
restart_window_secs = 600

[maintenance]
start = "03:00"
duration_minutes = 60
days = ["sun"]
active = true

[agents.apex]
host = "agents@10.0.0.1"
service = "apex"
health_url = "http://localhost:9002/health"

[agents.david-bishop]
host = "agents@10.0.0.1"
service = "openclaw-gateway"
scope = "user"
protected = true
"#,
        )
        .unwrap();

        let cfg = OversightConfig::new(Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.log, "debug");
        assert_eq!(cfg.self_agent_id, "overseer");
        assert_eq!(cfg.safety.heartbeat_window, 10);
        assert_eq!(cfg.safety.restart_window_secs, 600);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.safety.missed_beats_for_restart, 3);
        assert!(cfg.maintenance.active);

        let david = &cfg.agents["david-bishop"];
        assert!(david.protected);
        assert_eq!(david.scope, ServiceScope::User);
        assert_eq!(
            cfg.agents["apex"].health_url.as_deref(),
            Some("http://localhost:9002/health")
        );
    }
}
