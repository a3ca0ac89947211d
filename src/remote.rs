// SPDX-License-Identifier: MIT
//! Remote execution gateway.
//!
//! One trait seam for everything the engine does on an agent's host:
//! service control (`systemctl stop/start/restart/is-active`) and HTTP
//! health probing. The production implementation shells out over SSH with
//! bounded timeouts; tests inject a scripted mock.
//!
//! A timeout is reported as a failed [`ExecResult`], never an `Err` — remote
//! flakiness is an expected operational condition, and a decision cycle must
//! finish for every agent regardless.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Short timeout for status checks; a hung host must not stall the fleet cycle.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(15);
/// Longer timeout for stop/start/restart commands.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a remote command: exit success plus combined stdout+stderr.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub success: bool,
    pub output: String,
}

impl ExecResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Command channel to an agent's host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `host` and return (success, combined output).
    async fn execute(&self, host: &str, command: &str, timeout: Duration) -> ExecResult;

    /// Probe an HTTP health endpoint from the agent's host and return the
    /// status code. Endpoints are typically localhost-bound on the remote
    /// machine, so the probe runs over the same channel as commands.
    async fn probe_health(&self, host: &str, url: &str, timeout: Duration) -> Option<u16> {
        let cmd = format!("curl -s -o /dev/null -w '%{{http_code}}' --max-time 8 {url}");
        let result = self.execute(host, &cmd, timeout).await;
        if !result.success {
            return None;
        }
        result.output.trim().trim_matches('\'').parse().ok()
    }
}

/// SSH-backed executor (`ssh -o ConnectTimeout=10 -o BatchMode=yes <host> <cmd>`).
///
/// BatchMode keeps a missing key from degenerating into an interactive
/// password prompt that would hang until the timeout.
#[derive(Debug, Default, Clone)]
pub struct SshExecutor;

impl SshExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, host: &str, command: &str, timeout: Duration) -> ExecResult {
        debug!(host, command, "executing remote command");
        let child = Command::new("ssh")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(host)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        // No cancellation mid-flight: on timeout we report failure but the
        // ssh process is left to finish on its own — an aborted-but-maybe-
        // delivered control command is the dangerous failure mode here.
        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(out)) => {
                let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
                output.push_str(&String::from_utf8_lossy(&out.stderr));
                ExecResult {
                    success: out.status.success(),
                    output,
                }
            }
            Ok(Err(e)) => ExecResult::failure(format!("ssh spawn failed: {e}")),
            Err(_) => ExecResult::failure(format!(
                "ssh command timed out after {}s",
                timeout.as_secs()
            )),
        }
    }
}

/// Test support — a scripted in-memory executor.
/// Kept out of `#[cfg(test)]` so integration tests can use it.
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted executor: the first response whose key is a substring of the
    /// issued command wins; everything else gets the default result.
    /// Records every call for assertions.
    pub struct MockRemote {
        responses: Mutex<Vec<(String, ExecResult)>>,
        default: ExecResult,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl MockRemote {
        /// Mock where every unscripted command succeeds with empty output.
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(Vec::new()),
                default: ExecResult::ok(""),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Mock where every unscripted command fails.
        pub fn failing() -> Self {
            Self {
                responses: Mutex::new(Vec::new()),
                default: ExecResult::failure("mock failure"),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Script a response for any command containing `fragment`.
        pub fn respond(&self, fragment: impl Into<String>, result: ExecResult) {
            self.responses.lock().unwrap().push((fragment.into(), result));
        }

        /// All `(host, command)` pairs issued so far.
        pub fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        /// Number of issued commands containing `fragment`.
        pub fn calls_containing(&self, fragment: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, cmd)| cmd.contains(fragment))
                .count()
        }
    }

    impl Default for MockRemote {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl RemoteExecutor for MockRemote {
        async fn execute(&self, host: &str, command: &str, _timeout: Duration) -> ExecResult {
            self.calls
                .lock()
                .unwrap()
                .push((host.to_string(), command.to_string()));
            self.responses
                .lock()
                .unwrap()
                .iter()
                .find(|(frag, _)| command.contains(frag.as_str()))
                .map(|(_, r)| r.clone())
                .unwrap_or_else(|| self.default.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockRemote;
    use super::*;

    #[tokio::test]
    async fn probe_health_parses_status_code() {
        let exec = MockRemote::new();
        exec.respond("http_code", ExecResult::ok("'200'"));
        let code = exec
            .probe_health("agents@h", "http://localhost:9002/health", STATUS_TIMEOUT)
            .await;
        assert_eq!(code, Some(200));
    }

    #[tokio::test]
    async fn probe_health_on_command_failure_is_none() {
        let exec = MockRemote::failing();
        let code = exec
            .probe_health("agents@h", "http://x/health", STATUS_TIMEOUT)
            .await;
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn probe_health_on_garbage_output_is_none() {
        let exec = MockRemote::new();
        exec.respond("http_code", ExecResult::ok("connection refused"));
        let code = exec
            .probe_health("agents@h", "http://x/health", STATUS_TIMEOUT)
            .await;
        assert_eq!(code, None);
    }
}
