//! Repository state: the on-disk layout under the root directory, the
//! sync operation that makes the published link reflect the remote, and
//! the cleanup pass that bounds disk usage.
//!
//! Layout invariants:
//! - bare metadata lives directly under the root, remote `origin` is the
//!   configured upstream;
//! - every materialized revision is a worktree at `.worktrees/<sha>`;
//! - the published link's target is always the relative
//!   `.worktrees/<sha>`, swapped atomically via rename.

use std::{fs, os::unix::fs::DirBuilderExt, path::PathBuf, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use utils::{path::AbsPath, redact::redact_url};

use super::{
    config::{GcMode, Settings, SubmodulesMode},
    credentials::{CredentialRefresher, CredentialsError},
    git_cli::{GitCli, GitCliError},
    metrics,
    worktree::{WorktreeError, WorktreeManager},
};

/// Branch name handed to `git init -b`; never pushed, never resolved.
const PLACEHOLDER_BRANCH: &str = "gitsync-placeholder";

/// Basename of the temporary symlink used for the atomic swap.
const TMP_LINK: &str = "tmp-link";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("credential refresh failed: {0}")]
    Credentials(#[from] CredentialsError),
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cannot resolve ref {git_ref:?} on {repo}")]
    CannotResolveRef { git_ref: String, repo: String },
    #[error("cannot compute link target from {from} to {to}")]
    LinkTarget { from: String, to: String },
    #[error("cleanup: {0}")]
    Cleanup(String),
}

impl RepoError {
    /// Deadline expiry anywhere in the attempt classifies the whole
    /// attempt as a (transient) timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            RepoError::Git(e) => e.is_timeout(),
            RepoError::Worktree(WorktreeError::Git(e)) => e.is_timeout(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub changed: bool,
    pub hash: String,
}

pub struct RepoService {
    git: GitCli,
    repo: String,
    git_ref: String,
    depth: u32,
    root: AbsPath,
    link: AbsPath,
    sparse_checkout_file: Option<PathBuf>,
    submodules: SubmodulesMode,
    gc: GcMode,
    stale_timeout: Duration,
    // The first attempt after process start always fetches, even when the
    // link already points at the resolved hash, so depth/unshallow
    // transitions take effect.
    fetched_once: bool,
}

impl RepoService {
    pub fn new(git: GitCli, settings: &Settings, root: AbsPath) -> Self {
        let link = root.rebase(settings.effective_link());
        Self {
            git,
            repo: settings.repo.clone(),
            git_ref: settings.git_ref.clone(),
            depth: settings.depth,
            root,
            link,
            sparse_checkout_file: settings.sparse_checkout_file.clone(),
            submodules: settings.submodules,
            gc: settings.gc,
            stale_timeout: settings.stale_worktree_timeout,
            fetched_once: false,
        }
    }

    pub fn root(&self) -> &AbsPath {
        &self.root
    }

    pub fn link(&self) -> &AbsPath {
        &self.link
    }

    /// The hash consumers currently see: the basename of the link target,
    /// or None when the link does not exist.
    pub fn current_hash(&self) -> Option<String> {
        let target = fs::read_link(&self.link).ok()?;
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// One sync attempt. Returns whether the published hash changed and
    /// what it now is.
    pub async fn sync(
        &mut self,
        deadline: Instant,
        creds: &dyn CredentialRefresher,
    ) -> Result<SyncOutcome, RepoError> {
        creds.refresh(deadline).await?;
        self.init_or_repair(deadline).await?;

        let remote_hash = self.resolve_ref(deadline).await?;
        let current = self.current_hash();

        if current.as_deref() == Some(remote_hash.as_str())
            && self.worktree_as_published(&remote_hash, deadline).await
        {
            if !self.fetched_once {
                self.fetch(&remote_hash, deadline).await?;
            }
            debug!("{} already synced to {remote_hash}", self.git_ref);
            return Ok(SyncOutcome {
                changed: false,
                hash: remote_hash,
            });
        }

        self.fetch(&remote_hash, deadline).await?;
        self.git
            .run(
                self.root.as_path(),
                ["reset", "--soft", "FETCH_HEAD"],
                deadline,
            )
            .await?;

        let worktree = WorktreeManager::create(&self.git, &self.root, &remote_hash, deadline).await?;
        WorktreeManager::configure(
            &self.git,
            &self.root,
            &worktree,
            &remote_hash,
            self.sparse_checkout_file.as_deref(),
            self.submodules,
            self.depth,
            deadline,
        )
        .await?;

        self.publish(&worktree)?;
        info!("published {} at {remote_hash}", self.git_ref);

        if let Some(prev) = current.filter(|prev| prev != &remote_hash) {
            let prev_path = WorktreeManager::worktree_path(&self.root, &prev);
            if prev_path.exists()
                && let Err(e) = WorktreeManager::mark_superseded(&prev_path)
            {
                warn!("could not mark {prev} superseded: {e}");
            }
        }

        Ok(SyncOutcome {
            changed: true,
            hash: remote_hash,
        })
    }

    /// The published-link fast path holds only when the worktree is sane
    /// and the link actually resolves to the expected worktree path (a
    /// moved root or hand-edited link forces a full sync).
    async fn worktree_as_published(&self, hash: &str, deadline: Instant) -> bool {
        let expected = WorktreeManager::worktree_path(&self.root, hash);
        let Ok(target) = fs::read_link(&self.link) else {
            return false;
        };
        let Some(link_dir) = self.link.parent() else {
            return false;
        };
        let resolved = dunce::canonicalize(link_dir.join(target).as_path()).ok();
        if resolved.as_deref() != Some(expected.as_path()) {
            debug!("link exists but does not resolve to {expected}");
            return false;
        }
        WorktreeManager::sanity_check(&self.git, &expected, deadline).await
    }

    /// Make the bare metadata usable: create the root if missing, wipe and
    /// re-init if it fails sanity, and point `origin` at the upstream.
    async fn init_or_repair(&self, deadline: Instant) -> Result<(), RepoError> {
        if !self.root.exists() {
            info!("creating root {}", self.root);
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o775)
                .create(&self.root)?;
        }

        if !self.sanity_check_repo(deadline).await {
            info!("bare metadata unusable, reinitializing {}", self.root);
            remove_dir_contents(&self.root)?;
            self.git
                .run(
                    self.root.as_path(),
                    ["init", "-b", PLACEHOLDER_BRANCH],
                    deadline,
                )
                .await?;
        }

        self.ensure_origin(deadline).await
    }

    /// Usable iff the root is non-empty, git agrees it is the top level,
    /// and fsck finds the object store connected.
    async fn sanity_check_repo(&self, deadline: Instant) -> bool {
        let non_empty = fs::read_dir(&self.root)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if !non_empty {
            return false;
        }
        let toplevel = match self
            .git
            .run(self.root.as_path(), ["rev-parse", "--show-toplevel"], deadline)
            .await
        {
            Ok(out) => PathBuf::from(out.stdout_trimmed()),
            Err(_) => return false,
        };
        if toplevel != *self.root.as_path() {
            debug!(
                "top level {} is not the root {}",
                toplevel.display(),
                self.root
            );
            return false;
        }
        self.git
            .run(self.root.as_path(), ["fsck", "--connectivity-only"], deadline)
            .await
            .is_ok()
    }

    async fn ensure_origin(&self, deadline: Instant) -> Result<(), RepoError> {
        let current = self
            .git
            .run(self.root.as_path(), ["remote", "get-url", "origin"], deadline)
            .await;
        match current {
            Ok(out) if out.stdout_trimmed() == self.repo => Ok(()),
            Ok(_) => {
                self.git
                    .run(
                        self.root.as_path(),
                        ["remote", "set-url", "origin", self.repo.as_str()],
                        deadline,
                    )
                    .await?;
                Ok(())
            }
            Err(_) => {
                self.git
                    .run(
                        self.root.as_path(),
                        ["remote", "add", "origin", self.repo.as_str()],
                        deadline,
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Resolve the configured reference to a remote commit SHA.
    ///
    /// `ls-remote <repo> <ref> <ref>^{}` answers for branches and tags;
    /// the peeled form always follows the bare form, so the last non-empty
    /// line dereferences annotated tags. A silent ls-remote means the ref
    /// may be a hash literal: full hashes pass through `rev-parse`
    /// unchanged, abbreviated ones resolve if the object is already local.
    async fn resolve_ref(&self, deadline: Instant) -> Result<String, RepoError> {
        let peeled = format!("{}^{{}}", self.git_ref);
        let out = self
            .git
            .run(
                self.root.as_path(),
                [
                    "ls-remote",
                    "-q",
                    self.repo.as_str(),
                    self.git_ref.as_str(),
                    peeled.as_str(),
                ],
                deadline,
            )
            .await?;
        if let Some(line) = out.stdout.lines().filter(|l| !l.trim().is_empty()).last() {
            if let Some(sha) = line.split('\t').next()
                && !sha.is_empty()
            {
                return Ok(sha.to_string());
            }
        }

        if let Ok(parsed) = self
            .git
            .run(
                self.root.as_path(),
                ["rev-parse", self.git_ref.as_str()],
                deadline,
            )
            .await
            && parsed.stdout_trimmed() == self.git_ref
        {
            return Ok(self.git_ref.clone());
        }

        if let Some(full) = self.known_hash(&self.git_ref, deadline).await {
            return Ok(full);
        }

        Err(RepoError::CannotResolveRef {
            git_ref: self.git_ref.clone(),
            repo: redact_url(&self.repo),
        })
    }

    /// The "user supplied a hash we already have" predicate: true when the
    /// ref resolves to a local commit whose SHA starts with the ref. This
    /// is what makes abbreviated SHAs work.
    pub async fn is_known_hash(&self, deadline: Instant) -> bool {
        self.known_hash(&self.git_ref, deadline).await.is_some()
    }

    async fn known_hash(&self, git_ref: &str, deadline: Instant) -> Option<String> {
        let commitish = format!("{git_ref}^{{commit}}");
        let out = self
            .git
            .run(
                self.root.as_path(),
                ["rev-parse", commitish.as_str()],
                deadline,
            )
            .await
            .ok()?;
        let sha = out.stdout_trimmed().to_string();
        sha.starts_with(git_ref).then_some(sha)
    }

    async fn fetch(&mut self, hash: &str, deadline: Instant) -> Result<(), RepoError> {
        let mut args = vec![
            "fetch".to_string(),
            self.repo.clone(),
            hash.to_string(),
            "--verbose".to_string(),
            "--no-progress".to_string(),
            "--prune".to_string(),
            "--no-auto-gc".to_string(),
        ];
        if self.depth > 0 {
            args.push("--depth".to_string());
            args.push(self.depth.to_string());
        } else if self.is_shallow(deadline).await? {
            args.push("--unshallow".to_string());
        }
        metrics::FETCH_TOTAL.inc();
        self.git.run(self.root.as_path(), args, deadline).await?;
        self.fetched_once = true;
        Ok(())
    }

    async fn is_shallow(&self, deadline: Instant) -> Result<bool, RepoError> {
        let out = self
            .git
            .run(
                self.root.as_path(),
                ["rev-parse", "--is-shallow-repository"],
                deadline,
            )
            .await?;
        Ok(out.stdout_trimmed() == "true")
    }

    /// The atomic handoff: build `tmp-link` next to the final link and
    /// rename it over. Rename is the linearization point; a reader sees
    /// the old complete worktree or the new one, nothing in between.
    fn publish(&self, worktree: &AbsPath) -> Result<(), RepoError> {
        let link_dir = self.link.parent().ok_or_else(|| RepoError::LinkTarget {
            from: self.link.to_string(),
            to: worktree.to_string(),
        })?;
        fs::create_dir_all(&link_dir)?;

        let target = worktree
            .relative_from(&link_dir)
            .ok_or_else(|| RepoError::LinkTarget {
                from: link_dir.to_string(),
                to: worktree.to_string(),
            })?;

        let tmp = link_dir.join(TMP_LINK);
        if fs::symlink_metadata(&tmp).is_ok() {
            fs::remove_file(&tmp)?;
        }
        std::os::unix::fs::symlink(&target, &tmp)?;
        fs::rename(&tmp, &self.link)?;
        debug!("link {} -> {}", self.link, target.display());
        Ok(())
    }

    /// Bound disk usage: sweep stale/malformed worktrees, prune metadata,
    /// expire reflogs, and run gc per the configured mode. Every step is
    /// attempted; errors are accumulated into one report.
    pub async fn cleanup(&self, deadline: Instant) -> Result<(), RepoError> {
        let mut errors: Vec<String> = Vec::new();

        for e in WorktreeManager::sweep_stale(
            &self.root,
            self.current_hash().as_deref(),
            self.stale_timeout,
        ) {
            errors.push(e.to_string());
        }

        if let Err(e) = self
            .git
            .run(
                self.root.as_path(),
                ["worktree", "prune", "--verbose"],
                deadline,
            )
            .await
        {
            errors.push(e.to_string());
        }

        if let Err(e) = self
            .git
            .run(
                self.root.as_path(),
                ["reflog", "expire", "--expire-unreachable=all", "--all"],
                deadline,
            )
            .await
        {
            errors.push(e.to_string());
        }

        let gc_args: Option<Vec<&str>> = match self.gc {
            GcMode::Auto => Some(vec!["gc", "--auto"]),
            GcMode::Always => Some(vec!["gc"]),
            GcMode::Aggressive => Some(vec!["gc", "--aggressive"]),
            GcMode::Off => None,
        };
        if let Some(args) = gc_args
            && let Err(e) = self.git.run(self.root.as_path(), args, deadline).await
        {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RepoError::Cleanup(errors.join("; ")))
        }
    }
}

/// Remove everything inside `dir` without removing `dir` itself; the root
/// may be a volume mount point.
fn remove_dir_contents(dir: &AbsPath) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
