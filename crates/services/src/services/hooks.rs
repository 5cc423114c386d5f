//! Out-of-band notifications fired after a sync that changed the hash.
//!
//! Each hook runs in its own task behind a single-slot, latest-wins
//! mailbox: posting a hash replaces any undelivered one, and a failing
//! hook retries with whatever hash is latest at retry time. Hooks are
//! eventually-consistent with the published link, never a gate on the
//! sync loop.

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};
use utils::path::AbsPath;

use super::worktree::WorktreeManager;

/// Environment variable handed to the exechook.
pub const HASH_ENV: &str = "GITSYNC_HASH";
/// Header carried by webhook requests.
pub const HASH_HEADER: &str = "Gitsync-Hash";

/// In one-time mode a hook cannot retry forever; after this many failed
/// attempts it reports terminal failure into the exit code.
const ONE_TIME_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("command exited {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },
    #[error("timed out")]
    TimedOut,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("returned status {got}, wanted {want}")]
    UnexpectedStatus { got: u16, want: u16 },
}

#[async_trait]
pub trait Hook: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn backoff(&self) -> Duration;
    async fn send(&self, hash: &str) -> Result<(), HookError>;
}

/// Fork/exec a command in the worktree of the delivered hash.
pub struct ExecHook {
    command: String,
    root: AbsPath,
    timeout: Duration,
    backoff: Duration,
}

impl ExecHook {
    pub fn new(command: String, root: AbsPath, timeout: Duration, backoff: Duration) -> Self {
        Self {
            command,
            root,
            timeout,
            backoff,
        }
    }
}

#[async_trait]
impl Hook for ExecHook {
    fn name(&self) -> &'static str {
        "exechook"
    }

    fn backoff(&self) -> Duration {
        self.backoff
    }

    async fn send(&self, hash: &str) -> Result<(), HookError> {
        let cwd = WorktreeManager::worktree_path(&self.root, hash);
        let child = tokio::process::Command::new(&self.command)
            .current_dir(&cwd)
            .env(HASH_ENV, hash)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let out = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(out) => out?,
            Err(_) => return Err(HookError::TimedOut),
        };
        if !out.status.success() {
            return Err(HookError::CommandFailed {
                status: out
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "killed".to_string()),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// HTTP request carrying the hash in a header. A success status of 0 means
/// fire-and-forget: the request is sent, nothing is checked, nothing is
/// retried.
pub struct WebHook {
    url: String,
    method: reqwest::Method,
    success_status: i32,
    backoff: Duration,
    client: reqwest::Client,
}

impl WebHook {
    /// `method` must already have passed configuration validation.
    pub fn new(
        url: String,
        method: &str,
        success_status: i32,
        call_timeout: Duration,
        backoff: Duration,
    ) -> Self {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .expect("webhook method is validated at startup");
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .expect("reqwest client construction cannot fail with these options");
        Self {
            url,
            method,
            success_status,
            backoff,
            client,
        }
    }
}

#[async_trait]
impl Hook for WebHook {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn backoff(&self) -> Duration {
        self.backoff
    }

    async fn send(&self, hash: &str) -> Result<(), HookError> {
        let result = self
            .client
            .request(self.method.clone(), &self.url)
            .header(HASH_HEADER, hash)
            .send()
            .await;

        if self.success_status == 0 {
            if let Err(e) = result {
                debug!("fire-and-forget webhook error ignored: {e}");
            }
            return Ok(());
        }

        let got = result?.status().as_u16();
        let want = self.success_status as u16;
        if got != want {
            return Err(HookError::UnexpectedStatus { got, want });
        }
        Ok(())
    }
}

/// A running hook task plus the sending half of its mailbox.
pub struct HookRunner {
    tx: watch::Sender<Option<String>>,
    handle: JoinHandle<bool>,
}

impl HookRunner {
    pub fn spawn(hook: impl Hook, one_time: bool) -> Self {
        let (tx, rx) = watch::channel(None);
        let handle = tokio::spawn(run_loop(hook, rx, one_time));
        Self { tx, handle }
    }

    /// Post a hash, replacing any undelivered one.
    pub fn post(&self, hash: &str) {
        self.tx.send_replace(Some(hash.to_string()));
    }

    /// Close the mailbox and wait up to `grace` for the task to finish.
    /// Returns the hook's terminal status; a task still running after the
    /// grace period is aborted and counts as failed.
    pub async fn finish(mut self, grace: Duration) -> bool {
        drop(self.tx);
        match timeout(grace, &mut self.handle).await {
            Ok(res) => res.unwrap_or(false),
            Err(_) => {
                self.handle.abort();
                false
            }
        }
    }
}

async fn run_loop<H: Hook>(hook: H, mut rx: watch::Receiver<Option<String>>, one_time: bool) -> bool {
    loop {
        if rx.changed().await.is_err() {
            // Mailbox closed with nothing pending.
            return true;
        }
        let Some(mut hash) = rx.borrow_and_update().clone() else {
            continue;
        };

        let mut attempts = 0u32;
        let delivered = loop {
            attempts += 1;
            match hook.send(&hash).await {
                Ok(()) => {
                    info!("{} delivered {hash}", hook.name());
                    break true;
                }
                Err(e) => {
                    warn!("{} failed for {hash} (attempt {attempts}): {e}", hook.name());
                    if one_time && attempts >= ONE_TIME_MAX_ATTEMPTS {
                        break false;
                    }
                    tokio::time::sleep(hook.backoff()).await;
                    // Latest wins: if the hash advanced while we were
                    // failing, retry with the new one and never revisit
                    // the old.
                    if let Some(latest) = rx.borrow_and_update().clone() {
                        hash = latest;
                    }
                }
            }
        };

        if one_time {
            return delivered;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records every delivery attempt and fails the first `fail_first`.
    struct RecordingHook {
        calls: Arc<Mutex<Vec<String>>>,
        fail_first: usize,
        backoff: Duration,
    }

    #[async_trait]
    impl Hook for RecordingHook {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn backoff(&self) -> Duration {
            self.backoff
        }

        async fn send(&self, hash: &str) -> Result<(), HookError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(hash.to_string());
            if calls.len() <= self.fail_first {
                Err(HookError::TimedOut)
            } else {
                Ok(())
            }
        }
    }

    fn hook(fail_first: usize, backoff_ms: u64) -> (RecordingHook, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            RecordingHook {
                calls: calls.clone(),
                fail_first,
                backoff: Duration::from_millis(backoff_ms),
            },
            calls,
        )
    }

    #[tokio::test]
    async fn delivers_posted_hash() {
        let (hook, calls) = hook(0, 10);
        let runner = HookRunner::spawn(hook, false);
        runner.post("aaa");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runner.finish(Duration::from_secs(1)).await);
        assert_eq!(calls.lock().unwrap().as_slice(), ["aaa"]);
    }

    #[tokio::test]
    async fn retry_picks_up_latest_hash_and_never_revisits_old() {
        let (hook, calls) = hook(2, 50);
        let runner = HookRunner::spawn(hook, false);
        runner.post("aaa");
        // Let the first attempt (for aaa) fail, then advance the hash
        // while the hook is in its backoff sleep.
        tokio::time::sleep(Duration::from_millis(25)).await;
        runner.post("bbb");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(runner.finish(Duration::from_secs(1)).await);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.first().map(String::as_str), Some("aaa"));
        assert_eq!(calls.last().map(String::as_str), Some("bbb"));
        let first_bbb = calls.iter().position(|h| h == "bbb").unwrap();
        assert!(
            calls[first_bbb..].iter().all(|h| h == "bbb"),
            "old hash re-attempted after the new one arrived: {calls:?}"
        );
    }

    #[tokio::test]
    async fn one_time_mode_reports_terminal_failure() {
        let (hook, calls) = hook(usize::MAX, 5);
        let runner = HookRunner::spawn(hook, true);
        runner.post("aaa");
        assert!(!runner.finish(Duration::from_secs(5)).await);
        assert_eq!(calls.lock().unwrap().len(), ONE_TIME_MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn finish_without_post_succeeds() {
        let (hook, calls) = hook(0, 5);
        let runner = HookRunner::spawn(hook, false);
        assert!(runner.finish(Duration::from_secs(1)).await);
        assert!(calls.lock().unwrap().is_empty());
    }
}
