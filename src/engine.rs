// SPDX-License-Identifier: MIT
//! Oversight engine.
//!
//! Owns one instance of every component and runs the per-agent decision
//! pipeline: heartbeat window → health classification → escalation ladder →
//! (at level 2) the auto-restart controller. Fleet evaluation fans out one
//! task per agent; a failure for one agent never aborts the cycle for the
//! rest.
//!
//! Concurrency contract: at most one pipeline in flight per agent. The
//! periodic evaluation path *rejects* when the agent is busy; kill and
//! resume *queue* — a human's intent is never dropped because a tick was in
//! progress.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::OversightConfig;
use crate::escalation::{EscalationLadder, LadderOutcome};
use crate::health::HealthEvaluator;
use crate::kill_switch::{KillError, KillReport, KillStatus, KillSwitch, ResumeReport};
use crate::notify::Notifier;
use crate::registry::AgentRegistry;
use crate::remote::RemoteExecutor;
use crate::restart::{AutoRestartController, RestartOutcome};
use crate::singleflight::AgentLocks;
use crate::storage::{AgentStatus, AgentStatusRow, HeartbeatRecord, Storage};

/// Result of one evaluation pipeline run for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// Another pipeline held the agent's lock; this tick was skipped.
    Busy,
    /// The id is not in the registry; nothing was recorded or escalated.
    Unknown,
    Evaluated(EvaluationReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationReport {
    pub agent_id: String,
    pub missed_beats: u32,
    pub status: AgentStatus,
    pub ladder: LadderOutcome,
    /// Set when the ladder reached level 2 and the restart controller ran.
    pub restart: Option<RestartOutcome>,
}

pub struct OversightEngine {
    registry: Arc<AgentRegistry>,
    storage: Storage,
    health: HealthEvaluator,
    ladder: EscalationLadder,
    restart: AutoRestartController,
    kill_switch: KillSwitch,
    locks: AgentLocks,
    restart_threshold: u32,
    heartbeat_retention_days: u32,
}

impl OversightEngine {
    pub fn new(
        config: &OversightConfig,
        storage: Storage,
        remote: Arc<dyn RemoteExecutor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let registry = Arc::new(AgentRegistry::from_specs(config.agents.clone()));
        let safety = config.safety.clone();
        let health = HealthEvaluator::new(
            storage.clone(),
            safety.heartbeat_window,
            safety.missed_beats_for_restart,
        );
        let ladder = EscalationLadder::new(storage.clone(), safety.missed_beats_for_restart);
        let restart = AutoRestartController::new(
            Arc::clone(&registry),
            storage.clone(),
            Arc::clone(&remote),
            Arc::clone(&notifier),
            ladder.clone(),
            health.clone(),
            config.maintenance.clone(),
            safety.clone(),
        );
        let kill_switch = KillSwitch::new(
            Arc::clone(&registry),
            storage.clone(),
            remote,
            notifier,
            safety.clone(),
            config.self_agent_id.clone(),
        );
        Self {
            registry,
            storage,
            health,
            ladder,
            restart,
            kill_switch,
            locks: AgentLocks::new(),
            restart_threshold: safety.missed_beats_for_restart,
            heartbeat_retention_days: safety.heartbeat_retention_days,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    // ─── Ingestion ──────────────────────────────────────────────────────────

    /// Accept one heartbeat from an agent. Registers the agent row on first
    /// contact without touching an existing status.
    pub async fn record_heartbeat(&self, agent_id: &str, beat: &HeartbeatRecord) -> Result<()> {
        self.storage.ensure_agent(agent_id).await?;
        self.storage.record_heartbeat(agent_id, beat).await
    }

    // ─── Evaluation ─────────────────────────────────────────────────────────

    /// Run the decision pipeline for one agent. Rejects (returns `Busy`)
    /// when another pipeline already holds the agent.
    pub async fn evaluate(&self, agent_id: &str) -> Result<EvaluationOutcome> {
        // Unregistered ids get no agent row, no escalation, no lock entry.
        if !self.registry.contains(agent_id) {
            warn!(agent_id, "evaluation requested for unregistered agent");
            return Ok(EvaluationOutcome::Unknown);
        }
        let Some(_guard) = self.locks.try_acquire(agent_id) else {
            info!(agent_id, "evaluation skipped — pipeline already in flight");
            return Ok(EvaluationOutcome::Busy);
        };

        self.storage.ensure_agent(agent_id).await?;
        let missed = self.health.missed_beats(agent_id).await?;
        let status = self.health.apply_classification(agent_id, missed).await?;
        let ladder = self.ladder.observe(agent_id, missed).await?;

        // Level 2 re-invokes the controller every cycle; its gates make the
        // call idempotent (killed, maintenance, still-alive, rate limit).
        let restart = if status != AgentStatus::Killed && missed >= self.restart_threshold {
            Some(self.restart.check_and_restart(agent_id).await?)
        } else {
            None
        };

        Ok(EvaluationOutcome::Evaluated(EvaluationReport {
            agent_id: agent_id.to_string(),
            missed_beats: missed,
            status,
            ladder,
            restart,
        }))
    }

    /// Evaluate the whole fleet concurrently. Per-agent failures are logged
    /// and reported; they never abort the cycle for other agents.
    pub async fn evaluate_all(self: &Arc<Self>) -> Vec<(String, Result<EvaluationOutcome>)> {
        let mut handles = Vec::new();
        for agent_id in self.registry.ids() {
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let outcome = engine.evaluate(&agent_id).await;
                (agent_id, outcome)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((agent_id, outcome)) => {
                    if let Err(e) = &outcome {
                        warn!(agent_id, err = %e, "agent evaluation failed");
                    }
                    results.push((agent_id, outcome));
                }
                Err(e) => warn!(err = %e, "evaluation task panicked"),
            }
        }
        results
    }

    /// One full cycle for the serve loop: fleet evaluation plus retention
    /// housekeeping.
    pub async fn run_cycle(self: &Arc<Self>) -> Vec<(String, Result<EvaluationOutcome>)> {
        let results = self.evaluate_all().await;
        match self.storage.prune_heartbeats(self.heartbeat_retention_days).await {
            Ok(0) => {}
            Ok(n) => info!(pruned = n, "pruned expired heartbeats"),
            Err(e) => warn!(err = %e, "heartbeat pruning failed"),
        }
        results
    }

    // ─── Kill / resume ──────────────────────────────────────────────────────

    /// Kill an agent. Queues behind any in-flight pipeline for the same
    /// agent rather than rejecting.
    pub async fn kill(
        &self,
        agent_id: &str,
        reason: &str,
        triggered_by: &str,
    ) -> Result<KillReport, KillError> {
        let _guard = self.locks.acquire(agent_id).await;
        self.kill_switch.kill(agent_id, reason, triggered_by).await
    }

    pub async fn resume(&self, agent_id: &str, approved_by: &str) -> Result<ResumeReport, KillError> {
        let _guard = self.locks.acquire(agent_id).await;
        self.kill_switch.resume(agent_id, approved_by).await
    }

    /// Advisory kill-trigger scan across the fleet. Read-only.
    pub async fn check_auto_triggers(&self) -> Result<Vec<(String, String)>> {
        let mut recommendations = Vec::new();
        for agent_id in self.registry.ids() {
            if let Some(reason) = self.kill_switch.check_auto_triggers(&agent_id).await? {
                recommendations.push((agent_id, reason));
            }
        }
        Ok(recommendations)
    }

    pub async fn kill_status(&self, agent_id: &str) -> Result<KillStatus, KillError> {
        self.kill_switch.kill_status(agent_id).await
    }

    pub async fn agent_statuses(&self) -> Result<Vec<AgentStatusRow>> {
        self.storage.list_agent_statuses().await
    }
}
