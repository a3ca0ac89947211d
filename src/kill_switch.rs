// SPDX-License-Identifier: MIT
//! Kill switch.
//!
//! The hard-stop path for a misbehaving agent. Unlike the restart
//! controller, it runs no maintenance or rate gates — a human decided. It
//! does enforce three invariants:
//!
//! - the engine's own agent id is never killable, by anyone;
//! - protected agents are never killable by the automatic path, only by a
//!   named human actor;
//! - a kill records *intent*: the agent's status becomes `killed` even when
//!   the remote stop command fails, so nothing auto-restarts an agent a
//!   human wanted down.
//!
//! Auto-trigger detection is advisory only. It produces a recommendation
//! string for humans; it never invokes the kill itself.

use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::SafetyThresholds;
use crate::notify::Notifier;
use crate::registry::AgentRegistry;
use crate::remote::{RemoteExecutor, CONTROL_TIMEOUT};
use crate::storage::{AgentStatus, IncidentRow, Storage};

/// Heartbeats inspected by the auto-trigger advisory.
const ADVISORY_WINDOW: u32 = 10;
/// Newest heartbeats summed for the error-burst advisory.
const ERROR_BURST_SPAN: usize = 3;

/// Refusals and failures of the kill/resume paths.
///
/// Invariant violations are errors by design: callers must see the refusal,
/// not a silently-dropped request.
#[derive(Debug, Error)]
pub enum KillError {
    #[error("refusing to kill the oversight engine's own agent")]
    SelfKill,
    #[error("agent '{0}' is protected — automatic kill rejected, human actor required")]
    ProtectedAgent(String),
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    #[error("agent is not in the killed state (current: {current}) — nothing to resume")]
    NotKilled { current: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// What a kill actually did. `command_succeeded == false` still means the
/// agent is marked killed — the incident context carries the raw output for
/// the human who has to finish the job by hand.
#[derive(Debug)]
pub struct KillReport {
    pub command_succeeded: bool,
    pub incident: IncidentRow,
}

#[derive(Debug)]
pub struct ResumeReport {
    pub started: bool,
    pub output: String,
}

/// Combined view for the status CLI.
#[derive(Debug)]
pub struct KillStatus {
    pub status: Option<AgentStatus>,
    pub latest_kill: Option<IncidentRow>,
}

pub struct KillSwitch {
    registry: Arc<AgentRegistry>,
    storage: Storage,
    remote: Arc<dyn RemoteExecutor>,
    notifier: Arc<dyn Notifier>,
    safety: SafetyThresholds,
    /// The engine's own agent id — unconditionally unkillable.
    self_agent_id: String,
}

impl KillSwitch {
    pub fn new(
        registry: Arc<AgentRegistry>,
        storage: Storage,
        remote: Arc<dyn RemoteExecutor>,
        notifier: Arc<dyn Notifier>,
        safety: SafetyThresholds,
        self_agent_id: String,
    ) -> Self {
        Self {
            registry,
            storage,
            remote,
            notifier,
            safety,
            self_agent_id,
        }
    }

    /// Stop an agent and mark it killed. `triggered_by` is `"auto"` for the
    /// automatic path or the name of the human actor.
    pub async fn kill(
        &self,
        agent_id: &str,
        reason: &str,
        triggered_by: &str,
    ) -> Result<KillReport, KillError> {
        if agent_id == self.self_agent_id {
            error!(agent_id, triggered_by, "self-kill attempt rejected");
            return Err(KillError::SelfKill);
        }
        let spec = self
            .registry
            .get(agent_id)
            .ok_or_else(|| KillError::UnknownAgent(agent_id.to_string()))?;
        if spec.protected && triggered_by == "auto" {
            warn!(agent_id, reason, "automatic kill of protected agent rejected");
            self.notifier
                .notify(
                    &format!("[SENTINEL] Kill Request Blocked: {}", spec.display_name),
                    &format!(
                        "An automatic kill of protected agent {agent_id} was rejected.\n\
                         Reason given: {reason}\n\
                         If the kill is warranted, a human must issue it explicitly."
                    ),
                )
                .await;
            return Err(KillError::ProtectedAgent(agent_id.to_string()));
        }

        info!(agent_id, reason, triggered_by, "killing agent");
        let result = self
            .remote
            .execute(&spec.host, &spec.stop_command(), CONTROL_TIMEOUT)
            .await;
        if !result.success {
            warn!(agent_id, output = %result.output, "stop command failed — recording kill intent anyway");
        }

        let context = serde_json::json!({
            "host": spec.host,
            "service": spec.service,
            "command_succeeded": result.success,
            "output": result.output,
        });
        let incident = self
            .storage
            .create_incident(agent_id, "kill", reason, triggered_by, &context)
            .await?;
        // Intent before confirmation: killed status is what keeps the
        // restart controller away, and it must hold even if the service is
        // still up.
        self.storage
            .set_agent_status(agent_id, AgentStatus::Killed)
            .await?;

        self.notifier
            .notify(
                &format!("[SENTINEL] Agent Killed: {}", spec.display_name),
                &format!(
                    "Agent {agent_id} was killed by {triggered_by}.\n\
                     Reason: {reason}\n\
                     Stop command {}.",
                    if result.success { "succeeded" } else { "FAILED — verify manually" }
                ),
            )
            .await;

        Ok(KillReport {
            command_succeeded: result.success,
            incident,
        })
    }

    /// Bring a killed agent back. Only valid from the killed state, and only
    /// with a named approver.
    pub async fn resume(&self, agent_id: &str, approved_by: &str) -> Result<ResumeReport, KillError> {
        let spec = self
            .registry
            .get(agent_id)
            .ok_or_else(|| KillError::UnknownAgent(agent_id.to_string()))?;
        match self.storage.agent_status(agent_id).await? {
            Some(AgentStatus::Killed) => {}
            other => {
                return Err(KillError::NotKilled {
                    current: other.map_or_else(|| "unregistered".to_string(), |s| s.to_string()),
                });
            }
        }

        info!(agent_id, approved_by, "resuming killed agent");
        let result = self
            .remote
            .execute(&spec.host, &spec.start_command(), CONTROL_TIMEOUT)
            .await;
        if !result.success {
            // Stay killed: a failed start leaves nothing running to supervise.
            warn!(agent_id, output = %result.output, "start command failed — agent remains killed");
            return Ok(ResumeReport {
                started: false,
                output: result.output,
            });
        }

        self.storage
            .set_agent_status(agent_id, AgentStatus::Healthy)
            .await?;
        self.storage.resolve_kill_incident(agent_id, approved_by).await?;
        self.notifier
            .notify(
                &format!("[SENTINEL] Agent Resumed: {}", spec.display_name),
                &format!("Agent {agent_id} was resumed by {approved_by}."),
            )
            .await;
        Ok(ResumeReport {
            started: true,
            output: result.output,
        })
    }

    /// Advisory check: does recent heartbeat history justify recommending a
    /// kill? Returns the recommendation reason, or `None`. Never acts.
    pub async fn check_auto_triggers(&self, agent_id: &str) -> Result<Option<String>, KillError> {
        let beats = self
            .storage
            .recent_heartbeats(agent_id, ADVISORY_WINDOW)
            .await?;
        if beats.is_empty() {
            return Ok(None);
        }

        let unhealthy = beats
            .iter()
            .filter(|b| b.status != crate::health::HEALTHY)
            .count() as u32;
        if unhealthy >= self.safety.advisory_unhealthy_beats {
            return Ok(Some(format!(
                "{unhealthy} of the last {} heartbeats unhealthy",
                beats.len()
            )));
        }

        let burst: i64 = beats
            .iter()
            .take(ERROR_BURST_SPAN)
            .filter_map(|b| b.error_count)
            .sum();
        if burst >= i64::from(self.safety.advisory_error_burst) {
            return Ok(Some(format!(
                "error burst: {burst} errors across the last {ERROR_BURST_SPAN} heartbeats"
            )));
        }

        Ok(None)
    }

    /// Kill-state view of one agent for the status CLI.
    pub async fn kill_status(&self, agent_id: &str) -> Result<KillStatus, KillError> {
        Ok(KillStatus {
            status: self.storage.agent_status(agent_id).await?,
            latest_kill: self.storage.latest_kill_incident(agent_id).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingNotifier;
    use crate::registry::{AgentSpec, ServiceScope};
    use crate::remote::testing::MockRemote;
    use crate::remote::ExecResult;
    use crate::storage::HeartbeatRecord;
    use std::collections::HashMap;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Storage,
        remote: Arc<MockRemote>,
        notifier: Arc<RecordingNotifier>,
        switch: KillSwitch,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        let remote = Arc::new(MockRemote::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut specs = HashMap::new();
        specs.insert(
            "apex".to_string(),
            AgentSpec {
                id: String::new(),
                display_name: "Apex".to_string(),
                host: "agents@10.0.0.1".to_string(),
                service: "apex".to_string(),
                scope: ServiceScope::System,
                health_url: None,
                protected: false,
            },
        );
        specs.insert(
            "david-bishop".to_string(),
            AgentSpec {
                id: String::new(),
                display_name: "David Bishop".to_string(),
                host: "agents@10.0.0.1".to_string(),
                service: "openclaw-gateway".to_string(),
                scope: ServiceScope::User,
                health_url: None,
                protected: true,
            },
        );
        let switch = KillSwitch::new(
            Arc::new(AgentRegistry::from_specs(specs)),
            storage.clone(),
            remote.clone(),
            notifier.clone(),
            SafetyThresholds::default(),
            "sentinel".to_string(),
        );
        Fixture {
            _dir: dir,
            storage,
            remote,
            notifier,
            switch,
        }
    }

    async fn feed(storage: &Storage, agent: &str, beats: &[(&str, Option<i64>)]) {
        for (status, errors) in beats {
            storage
                .record_heartbeat(
                    agent,
                    &HeartbeatRecord {
                        status: status.to_string(),
                        error_count: *errors,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        }
    }

    #[tokio::test]
    async fn self_kill_is_always_rejected() {
        let f = fixture().await;
        let err = f.switch.kill("sentinel", "test", "ceo").await.unwrap_err();
        assert!(matches!(err, KillError::SelfKill));
        assert!(f.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn auto_kill_of_protected_agent_is_rejected_and_reported() {
        let f = fixture().await;
        let err = f
            .switch
            .kill("david-bishop", "looping", "auto")
            .await
            .unwrap_err();
        assert!(matches!(err, KillError::ProtectedAgent(_)));
        assert!(f.remote.calls().is_empty());
        assert!(f.notifier.subjects()[0].contains("Kill Request Blocked"));
        // No kill incident, no status change.
        assert!(f.storage.latest_kill_incident("david-bishop").await.unwrap().is_none());
        assert_eq!(f.storage.agent_status("david-bishop").await.unwrap(), None);
    }

    #[tokio::test]
    async fn human_can_kill_protected_agent() {
        let f = fixture().await;
        let report = f
            .switch
            .kill("david-bishop", "compromised", "ceo")
            .await
            .unwrap();
        assert!(report.command_succeeded);
        assert_eq!(
            f.storage.agent_status("david-bishop").await.unwrap(),
            Some(AgentStatus::Killed)
        );
        assert_eq!(f.remote.calls_containing("systemctl --user stop openclaw-gateway"), 1);
    }

    #[tokio::test]
    async fn kill_records_intent_even_when_stop_fails() {
        let f = fixture().await;
        f.remote.respond("stop", ExecResult::failure("connection refused"));
        let report = f.switch.kill("apex", "runaway", "ceo").await.unwrap();
        assert!(!report.command_succeeded);
        // Status and incident record the intent regardless.
        assert_eq!(
            f.storage.agent_status("apex").await.unwrap(),
            Some(AgentStatus::Killed)
        );
        let incident = f.storage.latest_kill_incident("apex").await.unwrap().unwrap();
        assert_eq!(incident.status, "active");
        assert_eq!(incident.triggered_by, "ceo");
        assert!(incident.context.contains("connection refused"));
        assert!(f.notifier.subjects().iter().any(|s| s.contains("Agent Killed")));
    }

    #[tokio::test]
    async fn unknown_agent_is_rejected() {
        let f = fixture().await;
        let err = f.switch.kill("ghost", "test", "ceo").await.unwrap_err();
        assert!(matches!(err, KillError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn resume_requires_killed_state() {
        let f = fixture().await;
        f.storage.set_agent_status("apex", AgentStatus::Failed).await.unwrap();
        let err = f.switch.resume("apex", "ceo").await.unwrap_err();
        assert!(matches!(err, KillError::NotKilled { current } if current == "failed"));
        assert!(f.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn resume_heals_and_resolves_the_kill_incident() {
        let f = fixture().await;
        f.switch.kill("apex", "runaway", "ceo").await.unwrap();
        let report = f.switch.resume("apex", "ceo").await.unwrap();
        assert!(report.started);
        assert_eq!(
            f.storage.agent_status("apex").await.unwrap(),
            Some(AgentStatus::Healthy)
        );
        let incident = f.storage.latest_kill_incident("apex").await.unwrap().unwrap();
        assert_eq!(incident.status, "resolved");
        assert_eq!(incident.resolved_by.as_deref(), Some("ceo"));
    }

    #[tokio::test]
    async fn failed_start_leaves_agent_killed() {
        let f = fixture().await;
        f.switch.kill("apex", "runaway", "ceo").await.unwrap();
        f.remote.respond("start", ExecResult::failure("unit masked"));
        let report = f.switch.resume("apex", "ceo").await.unwrap();
        assert!(!report.started);
        assert_eq!(
            f.storage.agent_status("apex").await.unwrap(),
            Some(AgentStatus::Killed)
        );
        let incident = f.storage.latest_kill_incident("apex").await.unwrap().unwrap();
        assert_eq!(incident.status, "active");
    }

    #[tokio::test]
    async fn advisory_fires_on_sustained_unhealthy_beats() {
        let f = fixture().await;
        feed(
            &f.storage,
            "apex",
            &[
                ("healthy", None),
                ("timeout", None),
                ("timeout", None),
                ("error:500", None),
                ("timeout", None),
                ("error:502", None),
            ],
        )
        .await;
        let reason = f.switch.check_auto_triggers("apex").await.unwrap();
        assert!(reason.unwrap().contains("heartbeats unhealthy"));
        // Advisory only — status untouched, no commands issued.
        assert_eq!(f.storage.agent_status("apex").await.unwrap(), None);
        assert!(f.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn advisory_fires_on_error_burst() {
        let f = fixture().await;
        feed(
            &f.storage,
            "apex",
            &[("healthy", Some(1)), ("healthy", Some(4)), ("healthy", Some(4)), ("healthy", Some(3))],
        )
        .await;
        // Newest three beats: 3 + 4 + 4 = 11 ≥ 10.
        let reason = f.switch.check_auto_triggers("apex").await.unwrap();
        assert!(reason.unwrap().contains("error burst"));
    }

    #[tokio::test]
    async fn advisory_is_quiet_for_healthy_history() {
        let f = fixture().await;
        feed(&f.storage, "apex", &[("healthy", Some(0)), ("healthy", None), ("timeout", Some(1))]).await;
        assert_eq!(f.switch.check_auto_triggers("apex").await.unwrap(), None);
    }

    #[tokio::test]
    async fn advisory_is_quiet_with_no_history() {
        let f = fixture().await;
        assert_eq!(f.switch.check_auto_triggers("apex").await.unwrap(), None);
    }
}
