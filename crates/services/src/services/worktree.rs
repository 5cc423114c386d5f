//! Worktree lifecycle: one detached worktree per commit SHA under
//! `<root>/.worktrees/`, created with `--no-checkout`, configured
//! (sparse-checkout, hard reset, submodules), and swept once superseded.

use std::{
    ffi::OsStr,
    fs,
    path::Path,
    time::{Duration, SystemTime},
};

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use utils::path::AbsPath;

use super::{
    config::SubmodulesMode,
    git_cli::{GitCli, GitCliError},
};

/// Directory under the root holding one worktree per known hash.
pub const WORKTREES_DIR: &str = ".worktrees";

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cannot compute relative path from {from} to {to}")]
    RelativePath { from: String, to: String },
}

/// True for a full 40-character commit SHA; anything else under
/// `.worktrees/` is malformed and gets swept.
pub fn is_full_sha(name: &str) -> bool {
    name.len() == 40 && name.chars().all(|c| c.is_ascii_hexdigit())
}

pub struct WorktreeManager;

impl WorktreeManager {
    pub fn worktree_path(root: &AbsPath, hash: &str) -> AbsPath {
        root.join(WORKTREES_DIR).join(hash)
    }

    /// Create the worktree for `hash`, recovering from a prior crashed
    /// attempt by removing any leftover directory and pruning stale
    /// metadata first. The checkout itself is deferred to
    /// [`configure`](Self::configure).
    pub async fn create(
        git: &GitCli,
        root: &AbsPath,
        hash: &str,
        deadline: Instant,
    ) -> Result<AbsPath, WorktreeError> {
        let path = Self::worktree_path(root, hash);

        if path.exists() {
            info!("removing leftover worktree at {path}");
            fs::remove_dir_all(&path)?;
            git.run(root.as_path(), ["worktree", "prune", "--verbose"], deadline)
                .await?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(&parent)?;
        }

        let args: [&OsStr; 7] = [
            "worktree".as_ref(),
            "add".as_ref(),
            "--force".as_ref(),
            "--detach".as_ref(),
            path.as_ref(),
            hash.as_ref(),
            "--no-checkout".as_ref(),
        ];
        git.run(root.as_path(), args, deadline).await?;

        Self::relativize_gitdir(root, &path, hash)?;
        Ok(path)
    }

    /// Rewrite the worktree's `.git` pointer to a relative path so the
    /// whole root can be bind-mounted at a different absolute path and the
    /// worktree stays valid.
    fn relativize_gitdir(root: &AbsPath, path: &AbsPath, hash: &str) -> Result<(), WorktreeError> {
        let rel = root
            .relative_from(path)
            .ok_or_else(|| WorktreeError::RelativePath {
                from: path.to_string(),
                to: root.to_string(),
            })?;
        let pointer = format!(
            "gitdir: {}/.git/worktrees/{}\n",
            rel.display(),
            hash
        );
        fs::write(path.join(".git"), pointer)?;
        Ok(())
    }

    /// Populate and configure the worktree: sparse-checkout first (so the
    /// reset materializes only the requested cone), then a hard reset to
    /// the target hash, then submodules.
    #[allow(clippy::too_many_arguments)]
    pub async fn configure(
        git: &GitCli,
        root: &AbsPath,
        path: &AbsPath,
        hash: &str,
        sparse_checkout_file: Option<&Path>,
        submodules: SubmodulesMode,
        depth: u32,
        deadline: Instant,
    ) -> Result<(), WorktreeError> {
        let sparse_target = root
            .join(".git")
            .join("worktrees")
            .join(hash)
            .join("info")
            .join("sparse-checkout");
        match sparse_checkout_file {
            Some(src) => {
                debug!("applying sparse-checkout file {}", src.display());
                if let Some(dir) = sparse_target.parent() {
                    fs::create_dir_all(&dir)?;
                }
                fs::copy(src, &sparse_target)?;
                git.run(path.as_path(), ["sparse-checkout", "init"], deadline)
                    .await?;
            }
            None => {
                if sparse_target.exists() {
                    fs::remove_file(&sparse_target)?;
                }
            }
        }

        git.run(path.as_path(), ["reset", "--hard", hash, "--"], deadline)
            .await?;

        if submodules != SubmodulesMode::Off {
            let mut args = vec![
                "submodule".to_string(),
                "update".to_string(),
                "--init".to_string(),
            ];
            if submodules == SubmodulesMode::Recursive {
                args.push("--recursive".to_string());
            }
            if depth > 0 {
                args.push("--depth".to_string());
                args.push(depth.to_string());
            }
            git.run(path.as_path(), args, deadline).await?;
        }
        Ok(())
    }

    /// A worktree is sane when its directory is non-empty and fsck finds
    /// the underlying objects intact. Consumers only ever see worktrees
    /// that passed this.
    pub async fn sanity_check(git: &GitCli, path: &AbsPath, deadline: Instant) -> bool {
        let non_empty = fs::read_dir(&path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if !non_empty {
            return false;
        }
        git.run(
            path.as_path(),
            ["fsck", "--no-progress", "--connectivity-only"],
            deadline,
        )
        .await
        .is_ok()
    }

    /// Bump the directory mtime; cleanup measures the stale-retention
    /// window from this moment.
    pub fn mark_superseded(path: &AbsPath) -> Result<(), WorktreeError> {
        let file = fs::File::open(&path)?;
        file.set_modified(SystemTime::now())?;
        Ok(())
    }

    /// Remove every entry under `.worktrees` that is not the current hash
    /// and is either malformed or older than the retention window.
    /// Returns the accumulated errors rather than stopping at the first.
    pub fn sweep_stale(
        root: &AbsPath,
        current_hash: Option<&str>,
        retention: Duration,
    ) -> Vec<WorktreeError> {
        let dir = root.join(WORKTREES_DIR);
        let mut errors = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return errors,
            Err(e) => {
                errors.push(e.into());
                return errors;
            }
        };

        let now = SystemTime::now();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    errors.push(e.into());
                    continue;
                }
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if Some(name.as_ref()) == current_hash {
                continue;
            }

            let malformed = !entry.path().is_dir() || !is_full_sha(&name);
            let expired = match entry.metadata().and_then(|m| m.modified()) {
                Ok(mtime) => now
                    .duration_since(mtime)
                    .map(|age| age >= retention)
                    .unwrap_or(false),
                Err(_) => false,
            };
            if !malformed && !expired {
                continue;
            }

            info!(
                "removing {} worktree entry {name}",
                if malformed { "malformed" } else { "stale" }
            );
            let result = if entry.path().is_dir() {
                fs::remove_dir_all(entry.path())
            } else {
                fs::remove_file(entry.path())
            };
            if let Err(e) = result {
                warn!("failed to remove {name}: {e}");
                errors.push(e.into());
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_sha_detection() {
        assert!(is_full_sha("0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_full_sha("0123456789abcdef"));
        assert!(!is_full_sha("g123456789abcdef0123456789abcdef01234567"));
        assert!(!is_full_sha(""));
    }

    #[test]
    fn sweep_removes_malformed_and_keeps_current() {
        let td = tempfile::TempDir::new().unwrap();
        let root = AbsPath::canonicalize(td.path()).unwrap();
        let dir = root.join(WORKTREES_DIR);
        fs::create_dir_all(&dir).unwrap();

        let current = "0123456789abcdef0123456789abcdef01234567";
        fs::create_dir(dir.join(current)).unwrap();
        fs::create_dir(dir.join("not-a-sha")).unwrap();
        fs::write(dir.join("stray-file"), "x").unwrap();

        let errors = WorktreeManager::sweep_stale(&root, Some(current), Duration::ZERO);
        assert!(errors.is_empty());
        assert!(dir.join(current).exists());
        assert!(!dir.join("not-a-sha").exists());
        assert!(!dir.join("stray-file").exists());
    }

    #[test]
    fn sweep_honors_retention_window() {
        let td = tempfile::TempDir::new().unwrap();
        let root = AbsPath::canonicalize(td.path()).unwrap();
        let dir = root.join(WORKTREES_DIR);
        fs::create_dir_all(&dir).unwrap();

        let old = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        fs::create_dir(dir.join(old)).unwrap();

        // Fresh mtime, generous retention: survives.
        let errors = WorktreeManager::sweep_stale(&root, None, Duration::from_secs(3600));
        assert!(errors.is_empty());
        assert!(dir.join(old).exists());

        // Zero retention: anything non-current goes immediately.
        let errors = WorktreeManager::sweep_stale(&root, None, Duration::ZERO);
        assert!(errors.is_empty());
        assert!(!dir.join(old).exists());
    }
}
