// SPDX-License-Identifier: MIT
//! Per-agent single-flight locks.
//!
//! Exactly one remediation or kill pipeline may be in flight per agent id.
//! The scheduler's evaluation path *rejects* when the lock is held (an
//! overlapping tick is stale by definition); human-invoked kill/resume
//! *queues* behind the in-flight operation instead — the intent must not be
//! dropped. Locks for different agents are independent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock arena keyed by agent id.
#[derive(Default)]
pub struct AgentLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AgentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().expect("agent lock arena poisoned");
        Arc::clone(
            map.entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Non-blocking acquire. `None` means another pipeline holds the agent.
    pub fn try_acquire(&self, agent_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(agent_id).try_lock_owned().ok()
    }

    /// Queueing acquire — waits for the in-flight pipeline to finish.
    pub async fn acquire(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(agent_id).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_try_acquire_is_rejected() {
        let locks = AgentLocks::new();
        let guard = locks.try_acquire("apex");
        assert!(guard.is_some());
        assert!(locks.try_acquire("apex").is_none());
        drop(guard);
        assert!(locks.try_acquire("apex").is_some());
    }

    #[tokio::test]
    async fn different_agents_do_not_contend() {
        let locks = AgentLocks::new();
        let _a = locks.try_acquire("apex").unwrap();
        assert!(locks.try_acquire("cortex").is_some());
    }

    #[tokio::test]
    async fn acquire_queues_until_release() {
        let locks = Arc::new(AgentLocks::new());
        let guard = locks.try_acquire("apex").unwrap();

        let locks2 = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _g = locks2.acquire("apex").await;
        });

        // Still held — the waiter cannot have finished.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
    }
}
