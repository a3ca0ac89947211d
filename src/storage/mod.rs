// SPDX-License-Identifier: MIT
//! SQLite persistence store for the oversight engine.
//!
//! Append-only logs (heartbeats, restart attempts, escalations, incidents)
//! plus the one mutable field the engine owns: an agent's current status.
//! WAL mode keeps concurrent per-agent pipelines from blocking each other;
//! the escalation transition (resolve old + create new) runs in a single
//! transaction so at most one unresolved escalation is ever visible.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

// ─── Domain enums ─────────────────────────────────────────────────────────────

/// Current supervised status of an agent.
///
/// `Killed` is terminal until an explicit, approved resume — and it records
/// *intent*: the kill switch sets it even when the remote stop command could
/// not be confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Healthy,
    Degraded,
    Failed,
    Killed,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Healthy => "healthy",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Failed => "failed",
            AgentStatus::Killed => "killed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(AgentStatus::Healthy),
            "degraded" => Some(AgentStatus::Degraded),
            "failed" => Some(AgentStatus::Failed),
            "killed" => Some(AgentStatus::Killed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Row types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HeartbeatRow {
    pub id: String,
    pub agent_id: String,
    pub timestamp: String,
    /// "healthy", "timeout", "error:<code>", …
    pub status: String,
    pub uptime_secs: Option<i64>,
    pub memory_mb: Option<i64>,
    pub active_tasks: Option<i64>,
    /// Rolling error count reported by the agent (last hour).
    pub error_count: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EscalationRow {
    pub id: String,
    pub agent_id: String,
    pub level: i64,
    pub reason: String,
    pub created_at: String,
    pub resolved_at: Option<String>,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RestartAttemptRow {
    pub id: String,
    pub agent_id: String,
    pub attempted_at: String,
    pub success: bool,
    pub method: String,
    pub notes: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct IncidentRow {
    pub id: String,
    pub agent_id: String,
    /// "kill" | "restart_failure" | "restart_blocked".
    pub incident_type: String,
    pub reason: String,
    /// "auto" or a named human actor.
    pub triggered_by: String,
    /// "active" | "resolved".
    pub status: String,
    /// JSON context blob (command output, host, service, …).
    pub context: String,
    pub created_at: String,
    pub resolved_at: Option<String>,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentStatusRow {
    pub agent_id: String,
    pub status: String,
    pub updated_at: String,
}

/// Heartbeat payload accepted from the external producer.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatRecord {
    pub status: String,
    pub uptime_secs: Option<i64>,
    pub memory_mb: Option<i64>,
    pub active_tasks: Option<i64>,
    pub error_count: Option<i64>,
}

// ─── Storage ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("sentineld.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        let stmts = [
            "CREATE TABLE IF NOT EXISTS agents (
                agent_id   TEXT PRIMARY KEY,
                status     TEXT NOT NULL DEFAULT 'healthy',
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS heartbeats (
                id           TEXT PRIMARY KEY,
                agent_id     TEXT NOT NULL,
                timestamp    TEXT NOT NULL,
                status       TEXT NOT NULL,
                uptime_secs  INTEGER,
                memory_mb    INTEGER,
                active_tasks INTEGER,
                error_count  INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_heartbeats_agent_ts
                ON heartbeats (agent_id, timestamp DESC)",
            "CREATE TABLE IF NOT EXISTS escalations (
                id          TEXT PRIMARY KEY,
                agent_id    TEXT NOT NULL,
                level       INTEGER NOT NULL,
                reason      TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                resolved_at TEXT,
                resolved_by TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_escalations_open
                ON escalations (agent_id) WHERE resolved_at IS NULL",
            "CREATE TABLE IF NOT EXISTS restart_log (
                id           TEXT PRIMARY KEY,
                agent_id     TEXT NOT NULL,
                attempted_at TEXT NOT NULL,
                success      INTEGER NOT NULL DEFAULT 0,
                method       TEXT NOT NULL,
                notes        TEXT NOT NULL DEFAULT ''
            )",
            "CREATE INDEX IF NOT EXISTS idx_restart_log_agent_ts
                ON restart_log (agent_id, attempted_at DESC)",
            "CREATE TABLE IF NOT EXISTS incidents (
                id            TEXT PRIMARY KEY,
                agent_id      TEXT NOT NULL,
                incident_type TEXT NOT NULL,
                reason        TEXT NOT NULL,
                triggered_by  TEXT NOT NULL DEFAULT 'auto',
                status        TEXT NOT NULL DEFAULT 'active',
                context       TEXT NOT NULL DEFAULT '{}',
                created_at    TEXT NOT NULL,
                resolved_at   TEXT,
                resolved_by   TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_incidents_agent
                ON incidents (agent_id, created_at DESC)",
        ];
        for stmt in stmts {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .context("storage migration failed")?;
        }
        Ok(())
    }

    // ─── Agents ─────────────────────────────────────────────────────────────

    /// Register an agent row or leave an existing one untouched.
    /// Status is deliberately not reset on re-registration — a killed agent
    /// stays killed across daemon restarts.
    pub async fn ensure_agent(&self, agent_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO agents (agent_id, status, updated_at) VALUES (?, 'healthy', ?)
             ON CONFLICT(agent_id) DO NOTHING",
        )
        .bind(agent_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn agent_status(&self, agent_id: &str) -> Result<Option<AgentStatus>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM agents WHERE agent_id = ?")
                .bind(agent_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(s,)| AgentStatus::parse(&s)))
    }

    pub async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO agents (agent_id, status, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET status = excluded.status,
                                                 updated_at = excluded.updated_at",
        )
        .bind(agent_id)
        .bind(status.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_agent_statuses(&self) -> Result<Vec<AgentStatusRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM agents ORDER BY agent_id")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    // ─── Heartbeats ─────────────────────────────────────────────────────────

    pub async fn record_heartbeat(&self, agent_id: &str, beat: &HeartbeatRecord) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO heartbeats
                 (id, agent_id, timestamp, status, uptime_secs, memory_mb, active_tasks, error_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(agent_id)
        .bind(&now)
        .bind(&beat.status)
        .bind(beat.uptime_secs)
        .bind(beat.memory_mb)
        .bind(beat.active_tasks)
        .bind(beat.error_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent `limit` heartbeats, newest first.
    pub async fn recent_heartbeats(&self, agent_id: &str, limit: u32) -> Result<Vec<HeartbeatRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM heartbeats WHERE agent_id = ?
                 ORDER BY timestamp DESC LIMIT ?",
            )
            .bind(agent_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    /// Delete heartbeats older than the retention horizon. Returns rows removed.
    pub async fn prune_heartbeats(&self, retention_days: u32) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::days(i64::from(retention_days))).to_rfc3339();
        let result = sqlx::query("DELETE FROM heartbeats WHERE timestamp < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ─── Restart log ────────────────────────────────────────────────────────

    pub async fn log_restart_attempt(
        &self,
        agent_id: &str,
        success: bool,
        method: &str,
        notes: &str,
    ) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO restart_log (id, agent_id, attempted_at, success, method, notes)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(agent_id)
        .bind(&now)
        .bind(success)
        .bind(method)
        .bind(notes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count restart attempts for an agent since `cutoff` (the rate window).
    pub async fn restart_attempts_since(
        &self,
        agent_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM restart_log WHERE agent_id = ? AND attempted_at > ?",
        )
        .bind(agent_id)
        .bind(cutoff.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }

    // ─── Escalations ────────────────────────────────────────────────────────

    /// The agent's current unresolved escalation, if any.
    pub async fn current_escalation(&self, agent_id: &str) -> Result<Option<EscalationRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM escalations WHERE agent_id = ? AND resolved_at IS NULL
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Resolve the current escalation (if any) and create a new one at
    /// `level` — a single transaction, so no intermediate state with zero or
    /// two unresolved rows is ever visible.
    pub async fn escalate(&self, agent_id: &str, level: u8, reason: &str) -> Result<EscalationRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE escalations SET resolved_at = ?, resolved_by = 'ladder'
             WHERE agent_id = ? AND resolved_at IS NULL",
        )
        .bind(&now)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO escalations (id, agent_id, level, reason, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(agent_id)
        .bind(i64::from(level))
        .bind(reason)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(EscalationRow {
            id,
            agent_id: agent_id.to_string(),
            level: i64::from(level),
            reason: reason.to_string(),
            created_at: now,
            resolved_at: None,
            resolved_by: None,
        })
    }

    /// Resolve the current escalation without creating a new one (recovery).
    /// Returns `true` if an escalation was open.
    pub async fn resolve_escalation(&self, agent_id: &str, resolved_by: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE escalations SET resolved_at = ?, resolved_by = ?
             WHERE agent_id = ? AND resolved_at IS NULL",
        )
        .bind(&now)
        .bind(resolved_by)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Number of unresolved escalations for an agent. Invariant: ≤ 1.
    pub async fn unresolved_escalation_count(&self, agent_id: &str) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM escalations WHERE agent_id = ? AND resolved_at IS NULL",
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }

    // ─── Incidents ──────────────────────────────────────────────────────────

    pub async fn create_incident(
        &self,
        agent_id: &str,
        incident_type: &str,
        reason: &str,
        triggered_by: &str,
        context: &serde_json::Value,
    ) -> Result<IncidentRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let context = context.to_string();
        sqlx::query(
            "INSERT INTO incidents
                 (id, agent_id, incident_type, reason, triggered_by, status, context, created_at)
             VALUES (?, ?, ?, ?, ?, 'active', ?, ?)",
        )
        .bind(&id)
        .bind(agent_id)
        .bind(incident_type)
        .bind(reason)
        .bind(triggered_by)
        .bind(&context)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(IncidentRow {
            id,
            agent_id: agent_id.to_string(),
            incident_type: incident_type.to_string(),
            reason: reason.to_string(),
            triggered_by: triggered_by.to_string(),
            status: "active".to_string(),
            context,
            created_at: now,
            resolved_at: None,
            resolved_by: None,
        })
    }

    /// Most recent kill incident (any status) for the dashboard/CLI.
    pub async fn latest_kill_incident(&self, agent_id: &str) -> Result<Option<IncidentRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM incidents WHERE agent_id = ? AND incident_type = 'kill'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Resolve the most recent active kill incident. Returns `true` if one
    /// was resolved.
    pub async fn resolve_kill_incident(&self, agent_id: &str, resolved_by: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE incidents SET status = 'resolved', resolved_at = ?, resolved_by = ?
             WHERE id = (SELECT id FROM incidents
                         WHERE agent_id = ? AND incident_type = 'kill' AND status = 'active'
                         ORDER BY created_at DESC LIMIT 1)",
        )
        .bind(&now)
        .bind(resolved_by)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn active_incidents(&self, agent_id: &str) -> Result<Vec<IncidentRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM incidents WHERE agent_id = ? AND status = 'active'
                 ORDER BY created_at DESC",
            )
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }
}
