// SPDX-License-Identifier: MIT
//! Auto-restart controller.
//!
//! Remediation only happens when every gate passes, in order:
//!
//! 1. the agent is registered and not in the killed state;
//! 2. no maintenance window is active;
//! 3. the agent has missed ≥ the threshold of consecutive heartbeats;
//! 4. the remote service is confirmed *not* running (heartbeat absence is
//!    not proof of death — restarting a live process would be the bug);
//! 5. the restart rate limit has headroom.
//!
//! A gate failure is an expected outcome recorded as a skip, never an
//! error. Only the rate-limit gate produces an incident: by the time three
//! restarts inside the window have not fixed an agent, a human needs to
//! look at it.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::SafetyThresholds;
use crate::escalation::EscalationLadder;
use crate::health::HealthEvaluator;
use crate::maintenance::MaintenanceWindow;
use crate::notify::Notifier;
use crate::registry::{AgentRegistry, AgentSpec};
use crate::remote::{RemoteExecutor, CONTROL_TIMEOUT, STATUS_TIMEOUT};
use crate::storage::{AgentStatus, Storage};

/// Cap on raw command output captured into logs and incident context.
const OUTPUT_SNIPPET_LEN: usize = 500;

fn snippet(s: &str) -> String {
    s.chars().take(OUTPUT_SNIPPET_LEN).collect()
}

/// Outcome of one restart decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// A gate failed; nothing was attempted.
    Skipped(String),
    /// Rate limit tripped: incident raised, humans notified (level 3 path).
    Blocked { recent_attempts: u64 },
    /// Restart issued and confirmed; agent status set back to healthy.
    Restarted,
    /// Restart command succeeded but post-restart confirmation failed;
    /// agent status set to failed (level 3 path).
    Unconfirmed { notes: String },
    /// The restart command itself failed (level 3 path).
    CommandFailed { notes: String },
}

/// Applies the restart gates and performs the remediation attempt.
pub struct AutoRestartController {
    registry: Arc<AgentRegistry>,
    storage: Storage,
    remote: Arc<dyn RemoteExecutor>,
    notifier: Arc<dyn Notifier>,
    ladder: EscalationLadder,
    health: HealthEvaluator,
    maintenance: MaintenanceWindow,
    safety: SafetyThresholds,
}

impl AutoRestartController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        storage: Storage,
        remote: Arc<dyn RemoteExecutor>,
        notifier: Arc<dyn Notifier>,
        ladder: EscalationLadder,
        health: HealthEvaluator,
        maintenance: MaintenanceWindow,
        safety: SafetyThresholds,
    ) -> Self {
        Self {
            registry,
            storage,
            remote,
            notifier,
            ladder,
            health,
            maintenance,
            safety,
        }
    }

    /// Run the full gate sequence and, if everything passes, the restart.
    pub async fn check_and_restart(&self, agent_id: &str) -> anyhow::Result<RestartOutcome> {
        // Gate 1: known agent, not killed.
        let Some(spec) = self.registry.get(agent_id) else {
            return Ok(RestartOutcome::Skipped(format!("unknown agent: {agent_id}")));
        };
        if self.storage.agent_status(agent_id).await? == Some(AgentStatus::Killed) {
            return Ok(RestartOutcome::Skipped(
                "agent in killed state — approved resume required".to_string(),
            ));
        }

        // Gate 2: maintenance window suppresses remediation (not detection).
        if self.maintenance.contains(Utc::now()) {
            return Ok(RestartOutcome::Skipped("maintenance window active".to_string()));
        }

        // Gate 3: sustained missed heartbeats.
        let missed = self.health.missed_beats(agent_id).await?;
        if missed < self.safety.missed_beats_for_restart {
            return Ok(RestartOutcome::Skipped(format!(
                "only {missed} missed heartbeats (threshold: {})",
                self.safety.missed_beats_for_restart
            )));
        }

        // Gate 4: the service must actually be down.
        if self.service_is_active(spec).await {
            return Ok(RestartOutcome::Skipped(
                "service is still running — heartbeat data is stale".to_string(),
            ));
        }

        // Gate 5: rate limit.
        let cutoff = Utc::now() - ChronoDuration::seconds(self.safety.restart_window_secs as i64);
        let recent = self.storage.restart_attempts_since(agent_id, cutoff).await?;
        if recent >= u64::from(self.safety.max_restarts_per_window) {
            return self.block_for_rate_limit(agent_id, spec, recent).await;
        }

        self.attempt_restart(agent_id, spec).await
    }

    async fn service_is_active(&self, spec: &AgentSpec) -> bool {
        let result = self
            .remote
            .execute(&spec.host, &spec.is_active_command(), STATUS_TIMEOUT)
            .await;
        // `is-active` exits 0 only for an active unit; also require the
        // literal state so "inactive"/"failed" text never false-positives.
        result.success && result.output.trim() == "active"
    }

    async fn block_for_rate_limit(
        &self,
        agent_id: &str,
        spec: &AgentSpec,
        recent: u64,
    ) -> anyhow::Result<RestartOutcome> {
        let reason = format!(
            "restart rate limit reached: {recent} attempts in the last {}s",
            self.safety.restart_window_secs
        );
        warn!(agent_id, recent, "restart blocked by rate limit");
        let context = serde_json::json!({
            "recent_attempts": recent,
            "window_secs": self.safety.restart_window_secs,
        });
        self.storage
            .create_incident(agent_id, "restart_blocked", &reason, "auto", &context)
            .await?;
        self.ladder.raise_alert(agent_id, &reason).await?;
        self.notifier
            .notify(
                &format!("[SENTINEL] Restart Limit: {}", spec.display_name),
                &format!(
                    "Agent {agent_id} has been restarted {recent} times in the last {}s.\n\
                     Manual intervention required.",
                    self.safety.restart_window_secs
                ),
            )
            .await;
        Ok(RestartOutcome::Blocked {
            recent_attempts: recent,
        })
    }

    async fn attempt_restart(
        &self,
        agent_id: &str,
        spec: &AgentSpec,
    ) -> anyhow::Result<RestartOutcome> {
        info!(agent_id, service = %spec.service, "issuing restart");
        let result = self
            .remote
            .execute(&spec.host, &spec.restart_command(), CONTROL_TIMEOUT)
            .await;

        self.storage
            .log_restart_attempt(agent_id, result.success, "systemctl", &snippet(&result.output))
            .await?;

        if !result.success {
            let notes = snippet(&result.output);
            warn!(agent_id, notes = %notes, "restart command failed");
            let context = serde_json::json!({
                "output": notes,
                "host": spec.host,
                "service": spec.service,
            });
            self.storage
                .create_incident(agent_id, "restart_failure", "restart command failed", "auto", &context)
                .await?;
            self.ladder
                .raise_alert(agent_id, "restart command failed")
                .await?;
            self.notifier
                .notify(
                    &format!("[SENTINEL] Restart Error: {}", spec.display_name),
                    &format!("Failed to restart {agent_id}.\nError: {notes}"),
                )
                .await;
            return Ok(RestartOutcome::CommandFailed { notes });
        }

        // Command accepted — give the service a grace period, then confirm.
        tokio::time::sleep(Duration::from_secs(self.safety.restart_grace_secs)).await;

        if self.confirm_healthy(spec).await {
            self.storage
                .set_agent_status(agent_id, AgentStatus::Healthy)
                .await?;
            info!(agent_id, "restart confirmed — agent healthy");
            return Ok(RestartOutcome::Restarted);
        }

        let notes = "restarted but health check failed".to_string();
        warn!(agent_id, "restart unconfirmed — health check failed");
        self.storage
            .set_agent_status(agent_id, AgentStatus::Failed)
            .await?;
        let context = serde_json::json!({
            "health_url": spec.health_url,
            "host": spec.host,
            "service": spec.service,
        });
        self.storage
            .create_incident(agent_id, "restart_failure", &notes, "auto", &context)
            .await?;
        self.ladder.raise_alert(agent_id, &notes).await?;
        self.notifier
            .notify(
                &format!("[SENTINEL] Restart Failed: {}", spec.display_name),
                &format!(
                    "Agent {agent_id} was restarted but the health check failed.\n\
                     Manual intervention required."
                ),
            )
            .await;
        Ok(RestartOutcome::Unconfirmed { notes })
    }

    /// Poll the agent's health endpoint. No endpoint configured ⇒ assume the
    /// successful restart command is confirmation enough.
    async fn confirm_healthy(&self, spec: &AgentSpec) -> bool {
        let Some(url) = &spec.health_url else {
            return true;
        };
        matches!(
            self.remote.probe_health(&spec.host, url, STATUS_TIMEOUT).await,
            Some(200)
        )
    }
}
