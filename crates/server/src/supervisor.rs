//! The outer loop: drives sync attempts under a per-attempt deadline,
//! tracks consecutive failures, publishes readiness, feeds the hook
//! mailboxes, and decides when the process is done (one-time, pinned,
//! fatal, or signaled).

use std::{
    fs,
    time::{Duration, SystemTime},
};

use services::services::{
    config::Settings,
    credentials::CredentialRefresher,
    hooks::HookRunner,
    metrics,
    repo::RepoService,
};
use tokio::{
    signal::unix::{Signal, SignalKind, signal},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use utils::path::AbsPath;

use crate::AppState;

/// How long hook tasks get to wind down on SIGINT/SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct Supervisor {
    settings: Settings,
    repo: RepoService,
    creds: Box<dyn CredentialRefresher>,
    hooks: Vec<HookRunner>,
    state: AppState,
    touch_file: Option<AbsPath>,
    error_file: Option<AbsPath>,
    failures: i32,
}

impl Supervisor {
    pub fn new(
        settings: Settings,
        repo: RepoService,
        creds: Box<dyn CredentialRefresher>,
        hooks: Vec<HookRunner>,
        state: AppState,
    ) -> Self {
        let touch_file = settings.touch_file.as_ref().map(|p| repo.root().rebase(p));
        let error_file = settings.error_file.as_ref().map(|p| repo.root().rebase(p));
        Self {
            settings,
            repo,
            creds,
            hooks,
            state,
            touch_file,
            error_file,
            failures: 0,
        }
    }

    /// Run until done; the return value is the process exit code.
    pub async fn run(mut self) -> i32 {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install SIGINT handler: {e}");
                return 1;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                return 1;
            }
        };
        let mut wake = match self.settings.parsed_wake_signal() {
            Some(raw) => match signal(SignalKind::from_raw(raw)) {
                Ok(s) => Some(s),
                Err(e) => {
                    error!("cannot install wake signal handler: {e}");
                    return 1;
                }
            },
            None => None,
        };

        let mut synced_once = false;
        loop {
            let started = Instant::now();
            let deadline = started + self.settings.sync_timeout;
            let result = tokio::select! {
                res = self.repo.sync(deadline, self.creds.as_ref()) => res,
                _ = sigint.recv() => return self.shutdown(0).await,
                _ = sigterm.recv() => return self.shutdown(0).await,
            };
            metrics::SYNC_DURATION.observe(started.elapsed().as_secs_f64());

            match result {
                Ok(outcome) => {
                    let status = if outcome.changed {
                        metrics::STATUS_SUCCESS
                    } else {
                        metrics::STATUS_NOOP
                    };
                    metrics::SYNC_TOTAL.with_label_values(&[status]).inc();

                    self.failures = 0;
                    self.state.set_ready();

                    // Hooks fire on every change, and once on the first
                    // success even when nothing changed (a restart against
                    // an already-correct root still notifies consumers).
                    if outcome.changed || !synced_once {
                        for hook in &self.hooks {
                            hook.post(&outcome.hash);
                        }
                    }
                    self.touch_trigger_file();
                    self.clear_error_file();
                    synced_once = true;

                    if self.settings.one_time {
                        info!("one-time sync complete at {}", outcome.hash);
                        return self.finish_hooks_one_time().await;
                    }

                    let pin_deadline = Instant::now() + self.settings.sync_timeout;
                    if self.repo.is_known_hash(pin_deadline).await {
                        info!(
                            "ref {:?} is a commit hash, no further updates are possible",
                            self.settings.git_ref
                        );
                        tokio::select! {
                            _ = sigint.recv() => {}
                            _ = sigterm.recv() => {}
                        }
                        return self.shutdown(0).await;
                    }

                    let cleanup_deadline = Instant::now() + self.settings.sync_timeout;
                    if let Err(e) = self.repo.cleanup(cleanup_deadline).await {
                        warn!("{e}");
                    }
                }
                Err(e) => {
                    metrics::SYNC_TOTAL
                        .with_label_values(&[metrics::STATUS_ERROR])
                        .inc();
                    self.failures += 1;
                    if e.is_timeout() {
                        warn!(
                            "sync attempt timed out ({} consecutive failures)",
                            self.failures
                        );
                    } else {
                        error!("sync failed ({} consecutive): {e}", self.failures);
                    }
                    self.write_error_file(&e.to_string());

                    if self.settings.max_failures >= 0 && self.failures > self.settings.max_failures
                    {
                        error!(
                            "{} consecutive failures exceed --max-failures={}, giving up",
                            self.failures, self.settings.max_failures
                        );
                        return self.shutdown(1).await;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.period) => {}
                _ = wake_recv(&mut wake) => debug!("woken by signal"),
                _ = sigint.recv() => return self.shutdown(0).await,
                _ = sigterm.recv() => return self.shutdown(0).await,
            }
        }
    }

    /// One-time mode waits for each hook to reach a terminal status; any
    /// terminal failure surfaces in the exit code.
    async fn finish_hooks_one_time(mut self) -> i32 {
        let grace = one_time_grace(&self.settings);
        let mut all_ok = true;
        for hook in self.hooks.drain(..) {
            all_ok &= hook.finish(grace).await;
        }
        if all_ok { 0 } else { 1 }
    }

    async fn shutdown(mut self, code: i32) -> i32 {
        for hook in self.hooks.drain(..) {
            if !hook.finish(SHUTDOWN_GRACE).await {
                debug!("hook still running after grace period, abandoned");
            }
        }
        code
    }

    fn touch_trigger_file(&self) {
        let Some(path) = &self.touch_file else { return };
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|f| f.set_modified(SystemTime::now()));
        if let Err(e) = result {
            warn!("could not touch {path}: {e}");
        }
    }

    fn write_error_file(&self, msg: &str) {
        let Some(path) = &self.error_file else { return };
        write_error_file(path.as_path(), msg);
    }

    fn clear_error_file(&self) {
        let Some(path) = &self.error_file else { return };
        if let Err(e) = fs::remove_file(path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("could not remove {path}: {e}");
        }
    }
}

/// Atomic write (tmp + rename) so a reader never sees a torn message.
/// Also used at startup for configuration errors, before a Supervisor
/// exists.
pub fn write_error_file(path: &std::path::Path, msg: &str) {
    let tmp = path.with_extension("tmp");
    let result = fs::write(&tmp, format!("{msg}\n")).and_then(|()| fs::rename(&tmp, path));
    if let Err(e) = result {
        warn!("could not write error file {}: {e}", path.display());
    }
}

async fn wake_recv(wake: &mut Option<Signal>) {
    match wake {
        Some(signal) => {
            signal.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// In one-time mode hooks self-terminate after their bounded retries;
/// this is a ceiling, not a pacing mechanism.
fn one_time_grace(settings: &Settings) -> Duration {
    let exec = (settings.exechook_timeout + settings.exechook_backoff) * 3;
    let web = (settings.webhook_timeout + settings.webhook_backoff) * 3;
    exec.max(web) + Duration::from_secs(5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_file_is_replaced_not_appended() {
        let td = tempfile::TempDir::new().unwrap();
        let path = td.path().join("error");
        write_error_file(&path, "first failure");
        write_error_file(&path, "second failure");
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "second failure\n"
        );
        // No tmp artifact left next to it.
        assert!(!td.path().join("error.tmp").exists());
    }
}
