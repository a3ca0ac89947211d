// SPDX-License-Identifier: MIT
//! Heartbeat-driven health model.
//!
//! The only signal escalation decisions see is the count of **consecutive**
//! missed (non-"healthy") heartbeats starting from the newest — sustained
//! unhealthiness, not transient blips. An empty history counts as the full
//! window: no signal is never interpreted as healthy.

use anyhow::Result;

use crate::storage::{AgentStatus, Storage};

pub const HEALTHY: &str = "healthy";

/// Evaluates an agent's recent heartbeat window.
#[derive(Clone)]
pub struct HealthEvaluator {
    storage: Storage,
    window: u32,
    /// Missed-beat count at which an agent is classified failed; matches the
    /// ladder's auto-restart threshold.
    failed_threshold: u32,
}

impl HealthEvaluator {
    pub fn new(storage: Storage, window: u32, failed_threshold: u32) -> Self {
        Self {
            storage,
            window,
            failed_threshold,
        }
    }

    /// Count of consecutive non-healthy heartbeats, newest first, stopping
    /// at the first healthy entry. Empty history ⇒ the full window size.
    pub async fn missed_beats(&self, agent_id: &str) -> Result<u32> {
        let beats = self.storage.recent_heartbeats(agent_id, self.window).await?;
        if beats.is_empty() {
            return Ok(self.window);
        }
        let mut missed = 0;
        for beat in &beats {
            if beat.status == HEALTHY {
                break;
            }
            missed += 1;
        }
        Ok(missed)
    }

    /// Health classification derived from a missed-beat count.
    pub fn classify(&self, missed: u32) -> AgentStatus {
        if missed == 0 {
            AgentStatus::Healthy
        } else if missed < self.failed_threshold {
            AgentStatus::Degraded
        } else {
            AgentStatus::Failed
        }
    }

    /// Persist the derived classification.
    ///
    /// The health evaluator only ever writes degraded/failed (and healthy on
    /// recovery) — it never touches a killed agent; `killed` is terminal
    /// until an approved resume.
    pub async fn apply_classification(&self, agent_id: &str, missed: u32) -> Result<AgentStatus> {
        let derived = self.classify(missed);
        match self.storage.agent_status(agent_id).await? {
            Some(AgentStatus::Killed) => Ok(AgentStatus::Killed),
            Some(current) if current == derived => Ok(current),
            _ => {
                self.storage.set_agent_status(agent_id, derived).await?;
                Ok(derived)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::HeartbeatRecord;

    async fn setup() -> (tempfile::TempDir, Storage, HealthEvaluator) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        let eval = HealthEvaluator::new(storage.clone(), 5, 3);
        (dir, storage, eval)
    }

    async fn feed(storage: &Storage, agent: &str, statuses: &[&str]) {
        // Oldest first, so the last entry is the newest heartbeat.
        for status in statuses {
            storage
                .record_heartbeat(
                    agent,
                    &HeartbeatRecord {
                        status: status.to_string(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        }
    }

    #[tokio::test]
    async fn empty_history_counts_as_full_window() {
        let (_d, _s, eval) = setup().await;
        assert_eq!(eval.missed_beats("ghost").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn counts_consecutive_from_newest() {
        let (_d, storage, eval) = setup().await;
        feed(&storage, "alpha", &["healthy", "error:500", "error:500", "error:500", "error:500"]).await;
        assert_eq!(eval.missed_beats("alpha").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn stops_at_first_healthy() {
        let (_d, storage, eval) = setup().await;
        feed(&storage, "apex", &["error:500", "error:500", "healthy", "timeout", "timeout"]).await;
        assert_eq!(eval.missed_beats("apex").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn all_healthy_is_zero() {
        let (_d, storage, eval) = setup().await;
        feed(&storage, "apex", &["healthy", "healthy", "healthy"]).await;
        assert_eq!(eval.missed_beats("apex").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn classification_thresholds() {
        let (_d, _s, eval) = setup().await;
        assert_eq!(eval.classify(0), AgentStatus::Healthy);
        assert_eq!(eval.classify(1), AgentStatus::Degraded);
        assert_eq!(eval.classify(2), AgentStatus::Degraded);
        assert_eq!(eval.classify(3), AgentStatus::Failed);
        assert_eq!(eval.classify(5), AgentStatus::Failed);
    }

    #[tokio::test]
    async fn killed_status_is_never_overwritten() {
        let (_d, storage, eval) = setup().await;
        storage.set_agent_status("apex", AgentStatus::Killed).await.unwrap();
        feed(&storage, "apex", &["healthy"]).await;
        let status = eval.apply_classification("apex", 0).await.unwrap();
        assert_eq!(status, AgentStatus::Killed);
        assert_eq!(
            storage.agent_status("apex").await.unwrap(),
            Some(AgentStatus::Killed)
        );
    }
}
