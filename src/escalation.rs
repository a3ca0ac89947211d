// SPDX-License-Identifier: MIT
//! Escalation ladder.
//!
//! Four severity levels govern the automatic response to sustained
//! unhealthiness. A ladder position is monotonic: it only moves up, or
//! resolves entirely on a zero-missed-beat observation. Level 3 is reached
//! only through a failed or rate-limited restart, and level 4 is never
//! entered automatically — a human invokes the kill switch directly.

use anyhow::Result;
use tracing::info;

use crate::storage::{EscalationRow, Storage};

/// Ladder levels, in increasing severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationLevel {
    /// ≥1 missed beat; log only.
    Warning = 1,
    /// ≥3 consecutive missed beats; triggers the auto-restart controller.
    AutoRestart = 2,
    /// A restart attempt failed or the restart rate limit was exceeded.
    AlertHuman = 3,
    /// Manual only — the ladder never self-promotes here.
    KillRequired = 4,
}

impl EscalationLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(EscalationLevel::Warning),
            2 => Some(EscalationLevel::AutoRestart),
            3 => Some(EscalationLevel::AlertHuman),
            4 => Some(EscalationLevel::KillRequired),
            _ => None,
        }
    }
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EscalationLevel::Warning => "warning",
            EscalationLevel::AutoRestart => "auto-restart",
            EscalationLevel::AlertHuman => "alert-human",
            EscalationLevel::KillRequired => "kill-required",
        };
        write!(f, "{name}")
    }
}

/// Result of feeding one missed-beat observation to the ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LadderOutcome {
    /// Zero missed beats, nothing was open.
    Healthy,
    /// Zero missed beats resolved an open escalation (full recovery).
    Recovered,
    /// Open escalation already at or above the computed target — no-op.
    Unchanged(EscalationLevel),
    /// A new escalation was created at this level.
    Escalated(EscalationLevel),
}

/// Maps missed-beat counts and restart history onto ladder positions.
#[derive(Clone)]
pub struct EscalationLadder {
    storage: Storage,
    /// Missed beats at which level 2 (auto-restart) is reached.
    restart_threshold: u32,
}

impl EscalationLadder {
    pub fn new(storage: Storage, restart_threshold: u32) -> Self {
        Self {
            storage,
            restart_threshold,
        }
    }

    /// Target level from a missed-beat count alone. Never yields level 3 or
    /// 4 — those have their own entry paths.
    fn target_level(&self, missed: u32) -> Option<EscalationLevel> {
        if missed == 0 {
            None
        } else if missed >= self.restart_threshold {
            Some(EscalationLevel::AutoRestart)
        } else {
            Some(EscalationLevel::Warning)
        }
    }

    /// Feed one evaluation's missed-beat count to the ladder and apply the
    /// transition rule: escalate only upward; resolve on full recovery;
    /// repeated same-level observations are no-ops.
    pub async fn observe(&self, agent_id: &str, missed: u32) -> Result<LadderOutcome> {
        let current = self.storage.current_escalation(agent_id).await?;

        let Some(target) = self.target_level(missed) else {
            if current.is_some() {
                self.storage.resolve_escalation(agent_id, "recovery").await?;
                info!(agent_id, "escalation resolved — agent recovered");
                return Ok(LadderOutcome::Recovered);
            }
            return Ok(LadderOutcome::Healthy);
        };

        if let Some(open) = &current {
            let open_level = EscalationLevel::from_i64(open.level);
            if open_level.is_some_and(|l| l >= target) {
                return Ok(LadderOutcome::Unchanged(open_level.unwrap_or(target)));
            }
        }

        let reason = format!("{missed} consecutive missed heartbeats");
        self.escalate_to(agent_id, target, &reason).await?;
        Ok(LadderOutcome::Escalated(target))
    }

    /// Promote directly to level 3 — used by the auto-restart controller
    /// when an attempt fails or the rate limit trips. No-op if the ladder is
    /// already at level 3 or above.
    pub async fn raise_alert(&self, agent_id: &str, reason: &str) -> Result<LadderOutcome> {
        let current = self.storage.current_escalation(agent_id).await?;
        if let Some(open) = &current {
            if EscalationLevel::from_i64(open.level)
                .is_some_and(|l| l >= EscalationLevel::AlertHuman)
            {
                return Ok(LadderOutcome::Unchanged(EscalationLevel::AlertHuman));
            }
        }
        self.escalate_to(agent_id, EscalationLevel::AlertHuman, reason)
            .await?;
        Ok(LadderOutcome::Escalated(EscalationLevel::AlertHuman))
    }

    async fn escalate_to(
        &self,
        agent_id: &str,
        level: EscalationLevel,
        reason: &str,
    ) -> Result<EscalationRow> {
        info!(agent_id, level = %level, reason, "escalating");
        self.storage.escalate(agent_id, level.as_u8(), reason).await
    }

    /// Current unresolved escalation level, if any.
    pub async fn current_level(&self, agent_id: &str) -> Result<Option<EscalationLevel>> {
        Ok(self
            .storage
            .current_escalation(agent_id)
            .await?
            .and_then(|row| EscalationLevel::from_i64(row.level)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (tempfile::TempDir, Storage, EscalationLadder) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        let ladder = EscalationLadder::new(storage.clone(), 3);
        (dir, storage, ladder)
    }

    #[tokio::test]
    async fn zero_missed_with_nothing_open_is_healthy() {
        let (_d, _s, ladder) = setup().await;
        assert_eq!(ladder.observe("apex", 0).await.unwrap(), LadderOutcome::Healthy);
    }

    #[tokio::test]
    async fn one_missed_creates_warning() {
        let (_d, storage, ladder) = setup().await;
        assert_eq!(
            ladder.observe("apex", 1).await.unwrap(),
            LadderOutcome::Escalated(EscalationLevel::Warning)
        );
        assert_eq!(storage.unresolved_escalation_count("apex").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn repeated_observation_is_a_no_op() {
        let (_d, storage, ladder) = setup().await;
        ladder.observe("apex", 2).await.unwrap();
        assert_eq!(
            ladder.observe("apex", 2).await.unwrap(),
            LadderOutcome::Unchanged(EscalationLevel::Warning)
        );
        assert_eq!(storage.unresolved_escalation_count("apex").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn warning_promotes_to_auto_restart() {
        let (_d, storage, ladder) = setup().await;
        ladder.observe("apex", 1).await.unwrap();
        assert_eq!(
            ladder.observe("apex", 3).await.unwrap(),
            LadderOutcome::Escalated(EscalationLevel::AutoRestart)
        );
        // Still exactly one open row.
        assert_eq!(storage.unresolved_escalation_count("apex").await.unwrap(), 1);
        assert_eq!(
            ladder.current_level("apex").await.unwrap(),
            Some(EscalationLevel::AutoRestart)
        );
    }

    #[tokio::test]
    async fn never_downgrades_below_current_level() {
        let (_d, _s, ladder) = setup().await;
        ladder.observe("apex", 4).await.unwrap();
        // Missed count drops to 1 but stays non-zero: level must hold at 2.
        assert_eq!(
            ladder.observe("apex", 1).await.unwrap(),
            LadderOutcome::Unchanged(EscalationLevel::AutoRestart)
        );
    }

    #[tokio::test]
    async fn full_recovery_resolves() {
        let (_d, storage, ladder) = setup().await;
        ladder.observe("apex", 4).await.unwrap();
        assert_eq!(ladder.observe("apex", 0).await.unwrap(), LadderOutcome::Recovered);
        assert_eq!(storage.unresolved_escalation_count("apex").await.unwrap(), 0);
        assert_eq!(ladder.current_level("apex").await.unwrap(), None);
    }

    #[tokio::test]
    async fn raise_alert_reaches_level_three_once() {
        let (_d, storage, ladder) = setup().await;
        ladder.observe("apex", 3).await.unwrap();
        assert_eq!(
            ladder.raise_alert("apex", "restart failed").await.unwrap(),
            LadderOutcome::Escalated(EscalationLevel::AlertHuman)
        );
        assert_eq!(
            ladder.raise_alert("apex", "restart failed again").await.unwrap(),
            LadderOutcome::Unchanged(EscalationLevel::AlertHuman)
        );
        assert_eq!(storage.unresolved_escalation_count("apex").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missed_count_alone_never_reaches_level_three() {
        let (_d, _s, ladder) = setup().await;
        assert_eq!(
            ladder.observe("apex", 50).await.unwrap(),
            LadderOutcome::Escalated(EscalationLevel::AutoRestart)
        );
    }
}
