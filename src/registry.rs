// SPDX-License-Identifier: MIT
//! Typed registry of supervised agents.
//!
//! Replaces the ad hoc "agent id → host / service name" dictionaries of the
//! legacy monitor with one immutable, explicitly-injected object. Every
//! component that needs to know where an agent lives or how to control its
//! service receives an `Arc<AgentRegistry>` — there is no module-level
//! mutable state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Whether the agent's service unit is managed system-wide or per-user.
///
/// Per-user units are controlled with `systemctl --user`; system units with
/// `sudo systemctl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceScope {
    #[default]
    System,
    User,
}

/// Static description of one supervised agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique agent id (registry key, e.g. `"apex"`).
    #[serde(default)]
    pub id: String,
    /// Human-facing name used in notifications (defaults to the id).
    #[serde(default)]
    pub display_name: String,
    /// SSH host reference, e.g. `"agents@192.168.65.241"`.
    pub host: String,
    /// systemd service unit name.
    pub service: String,
    /// System vs. per-user service unit.
    #[serde(default)]
    pub scope: ServiceScope,
    /// HTTP health endpoint polled after a restart, if the agent has one.
    /// The URL is resolved from the agent's host (endpoints are typically
    /// localhost-bound), so the probe runs over the remote channel.
    #[serde(default)]
    pub health_url: Option<String>,
    /// Protected agents require an explicit human actor to be killed —
    /// automatic kill attempts are always rejected.
    #[serde(default)]
    pub protected: bool,
}

impl AgentSpec {
    fn systemctl(&self, verb: &str) -> String {
        match self.scope {
            ServiceScope::User => format!("systemctl --user {verb} {}", self.service),
            ServiceScope::System => format!("sudo systemctl {verb} {}", self.service),
        }
    }

    pub fn stop_command(&self) -> String {
        self.systemctl("stop")
    }

    pub fn start_command(&self) -> String {
        self.systemctl("start")
    }

    pub fn restart_command(&self) -> String {
        self.systemctl("restart")
    }

    /// Liveness probe command. `is-active` needs no elevated rights, so the
    /// system scope skips sudo here.
    pub fn is_active_command(&self) -> String {
        match self.scope {
            ServiceScope::User => format!("systemctl --user is-active {}", self.service),
            ServiceScope::System => format!("systemctl is-active {}", self.service),
        }
    }
}

/// Immutable lookup table of supervised agents, keyed by agent id.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentSpec>,
}

impl AgentRegistry {
    /// Build a registry from config sections, normalizing the `id` and
    /// `display_name` fields from the map keys.
    pub fn from_specs(specs: HashMap<String, AgentSpec>) -> Self {
        let agents = specs
            .into_iter()
            .map(|(id, mut spec)| {
                spec.id = id.clone();
                if spec.display_name.is_empty() {
                    spec.display_name = id.clone();
                }
                (id, spec)
            })
            .collect();
        Self { agents }
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentSpec> {
        self.agents.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// All agent ids in deterministic (sorted) order — the fleet evaluation
    /// loop iterates this.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Thread-safe shared registry.
pub type SharedAgentRegistry = Arc<AgentRegistry>;
