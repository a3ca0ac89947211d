// SPDX-License-Identifier: MIT
//! sentineld — oversight engine for a fleet of autonomous agent services.
//!
//! Watches agent heartbeats, classifies health, walks unhealthy agents up a
//! four-level escalation ladder, auto-restarts failed services behind a set
//! of safety gates, and exposes an invariant-guarded kill switch for humans.
//!
//! The library crate carries the whole engine; `main.rs` is a thin clap
//! front-end over [`engine::OversightEngine`].

pub mod config;
pub mod engine;
pub mod escalation;
pub mod health;
pub mod kill_switch;
pub mod maintenance;
pub mod notify;
pub mod registry;
pub mod remote;
pub mod restart;
pub mod singleflight;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;

use config::OversightConfig;
use engine::OversightEngine;
use notify::WebhookNotifier;
use remote::SshExecutor;
use storage::Storage;

/// Build a fully-wired engine with the production side effects: SQLite
/// storage under the data dir, SSH remote execution, webhook notifications.
/// Tests wire [`engine::OversightEngine::new`] with mocks instead.
pub async fn bootstrap(config: &OversightConfig) -> Result<Arc<OversightEngine>> {
    let storage = Storage::new(&config.data_dir).await?;
    let remote = Arc::new(SshExecutor::new());
    let notifier = Arc::new(WebhookNotifier::new(config.notify_url.clone()));
    Ok(Arc::new(OversightEngine::new(
        config, storage, remote, notifier,
    )))
}
