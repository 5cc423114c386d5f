//! Why the external `git` binary instead of libgit2 bindings
//!
//! - Worktrees, sparse-checkout, shallow fetches and the credential cache
//!   are first-class in the CLI; libgit2 either lacks them or implements
//!   different semantics.
//! - Credential helpers, askpass and `GIT_SSH_COMMAND` compose for free.
//! - The operator can swap the binary (`--git`) to test against a specific
//!   git version.
//!
//! Every subprocess in the sync engine flows through [`GitCli::run`]: one
//! place owns deadlines, environment, output capture and logging.

use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    pin::pin,
    process::Stdio,
    time::Duration,
};

use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command, time::Instant};
use tracing::{debug, trace, warn};
use utils::redact::redact_url;

/// How long a child gets between SIGTERM and SIGKILL once its deadline has
/// expired.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("git executable not runnable: {0}")]
    NotAvailable(String),
    #[error("git {args} failed ({status}): {stderr}")]
    CommandFailed {
        args: String,
        status: String,
        stdout: String,
        stderr: String,
    },
    #[error("git {args} timed out")]
    TimedOut { args: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GitCliError {
    /// Deadline expiry needs to be distinguishable from ordinary failure so
    /// the supervisor can classify it as transient.
    pub fn is_timeout(&self) -> bool {
        matches!(self, GitCliError::TimedOut { .. })
    }
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Thin wrapper around the external `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_binary: PathBuf,
    env: Vec<(OsString, OsString)>,
}

impl GitCli {
    pub fn new(git_binary: impl Into<PathBuf>) -> Self {
        Self {
            git_binary: git_binary.into(),
            env: Vec::new(),
        }
    }

    /// Extra environment exported to every child, on top of the inherited
    /// one (`GIT_CONFIG_GLOBAL`, `GIT_SSH_COMMAND`, ...).
    pub fn export(&mut self, key: impl Into<OsString>, val: impl Into<OsString>) {
        self.env.push((key.into(), val.into()));
    }

    pub fn git_binary(&self) -> &Path {
        &self.git_binary
    }

    /// Check the binary actually runs; called once at startup so a missing
    /// binary is an environment error, not the first sync failure.
    pub async fn ensure_available(&self) -> Result<(), GitCliError> {
        let out = Command::new(&self.git_binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| GitCliError::NotAvailable(e.to_string()))?;
        if !out.status.success() {
            return Err(GitCliError::NotAvailable(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    /// Run `git <args>` in `cwd` and return captured output, failing on
    /// non-zero exit.
    pub async fn run<I, S>(
        &self,
        cwd: &Path,
        args: I,
        deadline: Instant,
    ) -> Result<GitOutput, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_with_stdin(cwd, args, None, deadline).await
    }

    /// Like [`run`](Self::run), with bytes piped to the child's stdin
    /// (`git credential approve` is the one caller that needs this).
    pub async fn run_with_stdin<I, S>(
        &self,
        cwd: &Path,
        args: I,
        stdin: Option<&[u8]>,
        deadline: Instant,
    ) -> Result<GitOutput, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let args_display = self.display_args(&args);

        if deadline.checked_duration_since(Instant::now()).is_none() {
            return Err(GitCliError::TimedOut { args: args_display });
        }

        debug!(cwd = %cwd.display(), "running git {args_display}");

        let mut cmd = Command::new(&self.git_binary);
        cmd.args(&args)
            .current_dir(cwd)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group: the child must not see the terminal's
            // SIGINT, and a group-wide kill reaps grandchildren (ssh).
            .process_group(0)
            .kill_on_drop(true);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin {
            let mut pipe = child.stdin.take().expect("stdin was piped");
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
        let mut wait = pin!(child.wait_with_output());

        let out = tokio::select! {
            res = &mut wait => res?,
            _ = tokio::time::sleep_until(deadline) => {
                warn!("git {args_display} exceeded its deadline, killing");
                if let Some(pgid) = pgid {
                    let _ = killpg(pgid, Signal::SIGTERM);
                }
                if tokio::time::timeout(KILL_GRACE, &mut wait).await.is_err() {
                    if let Some(pgid) = pgid {
                        let _ = killpg(pgid, Signal::SIGKILL);
                    }
                    let _ = wait.await;
                }
                return Err(GitCliError::TimedOut { args: args_display });
            }
        };

        let stdout = String::from_utf8_lossy(&out.stdout).to_string();
        let stderr = String::from_utf8_lossy(&out.stderr).to_string();
        trace!("git {args_display} stdout: {}", stdout.trim_end());
        trace!("git {args_display} stderr: {}", stderr.trim_end());

        if !out.status.success() {
            return Err(GitCliError::CommandFailed {
                args: args_display,
                status: out
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "killed".to_string()),
                stdout,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(GitOutput { stdout, stderr })
    }

    fn display_args(&self, args: &[OsString]) -> String {
        args.iter()
            .map(|a| redact_url(&a.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_separately() {
        let git = GitCli::new("git");
        let out = git
            .run(Path::new("/"), ["--version"], far_deadline())
            .await
            .unwrap();
        assert!(out.stdout.starts_with("git version"));
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_carries_both_streams() {
        let git = GitCli::new("git");
        let err = git
            .run(Path::new("/"), ["no-such-subcommand"], far_deadline())
            .await
            .unwrap_err();
        match err {
            GitCliError::CommandFailed { stderr, .. } => {
                assert!(stderr.contains("no-such-subcommand"), "stderr: {stderr}")
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_deadline_is_a_timeout() {
        let git = GitCli::new("git");
        let expired = Instant::now() - Duration::from_secs(1);
        let err = git
            .run(Path::new("/"), ["--version"], expired)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn missing_binary_is_not_available() {
        let git = GitCli::new("/no/such/git");
        assert!(matches!(
            git.ensure_available().await,
            Err(GitCliError::NotAvailable(_))
        ));
    }
}
