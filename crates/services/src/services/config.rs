use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use thiserror::Error;

/// Hard floor for the sync period and the per-sync deadline. Anything
/// shorter is a misconfiguration, not a fast sync.
pub const MIN_DURATION: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--{flag} must be at least {}ms", MIN_DURATION.as_millis())]
    DurationTooShort { flag: &'static str },
    #[error("{0} are mutually exclusive")]
    MutuallyExclusive(&'static str),
    #[error("--password and --password-file are mutually exclusive")]
    TwoPasswords,
    #[error("--username requires --password or --password-file")]
    UsernameWithoutPassword,
    #[error("--password-file {0}: {1}")]
    PasswordFile(PathBuf, std::io::Error),
    #[error("unrecognized wake signal {0:?}")]
    BadWakeSignal(String),
    #[error("--webhook-method {0:?} is not a valid HTTP method")]
    BadWebhookMethod(String),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SubmodulesMode {
    /// Check out submodules, and their submodules, all the way down.
    Recursive,
    /// Check out only the first level of submodules.
    Shallow,
    /// Do not check out submodules at all.
    Off,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum GcMode {
    /// `git gc --auto`: let git decide.
    Auto,
    /// `git gc` after every cleanup pass.
    Always,
    /// `git gc --aggressive`.
    Aggressive,
    /// Never run gc.
    Off,
}

/// The full flag/env configuration surface. Every flag doubles as a
/// `GITSYNC_*` environment variable; legacy `GIT_SYNC_*` names are honored
/// with a deprecation warning (see [`promote_legacy_env`]).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gitsync",
    version,
    about = "Continuously materializes a remote Git revision into a local directory \
             and publishes it through an atomically-swapped symlink."
)]
pub struct Settings {
    /// Remote repository to sync.
    #[arg(long, env = "GITSYNC_REPO")]
    pub repo: String,

    /// Root directory owned by gitsync; bare metadata, worktrees and the
    /// published link all live under it.
    #[arg(long, env = "GITSYNC_ROOT")]
    pub root: PathBuf,

    /// Branch, tag, or commit SHA (possibly abbreviated) to sync.
    #[arg(long = "ref", env = "GITSYNC_REF", default_value = "HEAD")]
    pub git_ref: String,

    /// Fetch depth; 0 means full history.
    #[arg(long, env = "GITSYNC_DEPTH", default_value_t = 1)]
    pub depth: u32,

    /// Path of the published symlink, absolute or relative to --root.
    /// Defaults to the basename of --repo.
    #[arg(long, env = "GITSYNC_LINK")]
    pub link: Option<PathBuf>,

    /// File whose mtime is bumped after every successful sync, absolute or
    /// relative to --root.
    #[arg(long, env = "GITSYNC_TOUCH_FILE")]
    pub touch_file: Option<PathBuf>,

    /// File receiving the last fatal error message, absolute or relative to
    /// --root; removed on the next success.
    #[arg(long, env = "GITSYNC_ERROR_FILE")]
    pub error_file: Option<PathBuf>,

    /// Time between sync attempts.
    #[arg(long, env = "GITSYNC_PERIOD", default_value = "10s", value_parser = humantime::parse_duration)]
    pub period: Duration,

    /// Deadline for a single sync attempt, including all git subprocesses.
    #[arg(long, env = "GITSYNC_SYNC_TIMEOUT", default_value = "120s", value_parser = humantime::parse_duration)]
    pub sync_timeout: Duration,

    /// Exit after the first successful sync.
    #[arg(long, env = "GITSYNC_ONE_TIME")]
    pub one_time: bool,

    /// Signal (name or number) that wakes the sync loop early.
    #[arg(long, env = "GITSYNC_WAKE_SIGNAL")]
    pub wake_signal: Option<String>,

    /// Consecutive failures tolerated before giving up; 0 aborts on the
    /// first failure, negative retries forever.
    #[arg(long, env = "GITSYNC_MAX_FAILURES", default_value_t = 0, allow_hyphen_values = true)]
    pub max_failures: i32,

    /// Submodule checkout behavior.
    #[arg(long, env = "GITSYNC_SUBMODULES", value_enum, default_value_t = SubmodulesMode::Recursive)]
    pub submodules: SubmodulesMode,

    /// Garbage collection behavior during cleanup.
    #[arg(long, env = "GITSYNC_GC", value_enum, default_value_t = GcMode::Always)]
    pub gc: GcMode,

    /// Sparse-checkout specification file to apply to every worktree.
    #[arg(long, env = "GITSYNC_SPARSE_CHECKOUT_FILE")]
    pub sparse_checkout_file: Option<PathBuf>,

    /// How long a superseded worktree is kept before cleanup removes it;
    /// 0 removes it on the next cleanup pass.
    #[arg(long, env = "GITSYNC_STALE_WORKTREE_TIMEOUT", default_value = "0s", value_parser = humantime::parse_duration)]
    pub stale_worktree_timeout: Duration,

    /// Extra git config, comma-separated `key:value` pairs. Values may be
    /// double-quoted; `\n \t \" \, \\` are the recognized escapes.
    #[arg(long, env = "GITSYNC_GIT_CONFIG")]
    pub git_config: Option<String>,

    /// Command run after a sync that changed the hash; its working
    /// directory is the published worktree and it receives GITSYNC_HASH.
    #[arg(long, env = "GITSYNC_EXECHOOK_COMMAND")]
    pub exechook_command: Option<String>,

    /// Per-invocation timeout for the exechook.
    #[arg(long, env = "GITSYNC_EXECHOOK_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub exechook_timeout: Duration,

    /// Sleep between failed exechook attempts.
    #[arg(long, env = "GITSYNC_EXECHOOK_BACKOFF", default_value = "3s", value_parser = humantime::parse_duration)]
    pub exechook_backoff: Duration,

    /// URL called after a sync that changed the hash; the request carries a
    /// Gitsync-Hash header.
    #[arg(long, env = "GITSYNC_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// HTTP method for the webhook.
    #[arg(long, env = "GITSYNC_WEBHOOK_METHOD", default_value = "POST")]
    pub webhook_method: String,

    /// Status code that counts as webhook success; 0 (or -1) means
    /// fire-and-forget, never retried.
    #[arg(long, env = "GITSYNC_WEBHOOK_SUCCESS_STATUS", default_value_t = 200, allow_hyphen_values = true)]
    pub webhook_success_status: i32,

    /// Per-request timeout for the webhook.
    #[arg(long, env = "GITSYNC_WEBHOOK_TIMEOUT", default_value = "1s", value_parser = humantime::parse_duration)]
    pub webhook_timeout: Duration,

    /// Sleep between failed webhook attempts.
    #[arg(long, env = "GITSYNC_WEBHOOK_BACKOFF", default_value = "3s", value_parser = humantime::parse_duration)]
    pub webhook_backoff: Duration,

    /// Username for HTTP-auth repositories.
    #[arg(long, env = "GITSYNC_USERNAME")]
    pub username: Option<String>,

    /// Password for HTTP-auth repositories. Prefer --password-file.
    #[arg(long, env = "GITSYNC_PASSWORD")]
    pub password: Option<String>,

    /// File containing the password for HTTP-auth repositories.
    #[arg(long, env = "GITSYNC_PASSWORD_FILE")]
    pub password_file: Option<PathBuf>,

    /// URL answering `username=`/`password=` lines, queried before every
    /// sync.
    #[arg(long, env = "GITSYNC_ASKPASS_URL")]
    pub askpass_url: Option<String>,

    /// SSH private key to use for fetching.
    #[arg(long, env = "GITSYNC_SSH_KEY_FILE")]
    pub ssh_key_file: Option<PathBuf>,

    /// Enforce known_hosts checking for SSH.
    #[arg(long, env = "GITSYNC_SSH_KNOWN_HOSTS", default_value_t = true, action = clap::ArgAction::Set)]
    pub ssh_known_hosts: bool,

    /// known_hosts file used when checking is enforced.
    #[arg(long, env = "GITSYNC_SSH_KNOWN_HOSTS_FILE", default_value = "/etc/git-secret/known_hosts")]
    pub ssh_known_hosts_file: PathBuf,

    /// Cookie file handed to git for HTTP fetching.
    #[arg(long, env = "GITSYNC_COOKIE_FILE")]
    pub cookie_file: Option<PathBuf>,

    /// Append a passwd record for the current UID if it has none (some git
    /// and ssh builds refuse to run otherwise).
    #[arg(long, env = "GITSYNC_ADD_USER")]
    pub add_user: bool,

    /// Make created directories group-writable.
    #[arg(long, env = "GITSYNC_GROUP_WRITE")]
    pub group_write: bool,

    /// Bind address for the HTTP endpoint, e.g. ":9092" or
    /// "127.0.0.1:9092". Disabled when unset.
    #[arg(long, env = "GITSYNC_HTTP_BIND")]
    pub http_bind: Option<String>,

    /// Serve /metrics on the HTTP endpoint.
    #[arg(long, env = "GITSYNC_HTTP_METRICS", default_value_t = true, action = clap::ArgAction::Set)]
    pub http_metrics: bool,

    /// Serve /debug/pprof on the HTTP endpoint.
    #[arg(long, env = "GITSYNC_HTTP_PPROF")]
    pub http_pprof: bool,

    /// Path of the git binary to run.
    #[arg(long = "git", env = "GITSYNC_GIT", default_value = "git")]
    pub git_binary: PathBuf,

    /// Increase log verbosity (-v: debug, -vv: trace). RUST_LOG wins when
    /// set.
    #[arg(short, long, env = "GITSYNC_VERBOSE", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Environment variables that were renamed; the old spelling still works
/// but complains.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("GIT_SYNC_REPO", "GITSYNC_REPO"),
    ("GIT_SYNC_ROOT", "GITSYNC_ROOT"),
    ("GIT_SYNC_REF", "GITSYNC_REF"),
    ("GIT_SYNC_BRANCH", "GITSYNC_REF"),
    ("GIT_SYNC_DEPTH", "GITSYNC_DEPTH"),
    ("GIT_SYNC_LINK", "GITSYNC_LINK"),
    ("GIT_SYNC_PERIOD", "GITSYNC_PERIOD"),
    ("GIT_SYNC_WAIT", "GITSYNC_PERIOD"),
    ("GIT_SYNC_ONE_TIME", "GITSYNC_ONE_TIME"),
    ("GIT_SYNC_MAX_FAILURES", "GITSYNC_MAX_FAILURES"),
    ("GIT_SYNC_USERNAME", "GITSYNC_USERNAME"),
    ("GIT_SYNC_PASSWORD", "GITSYNC_PASSWORD"),
    ("GIT_SYNC_SSH_KEY_FILE", "GITSYNC_SSH_KEY_FILE"),
];

/// Copy legacy `GIT_SYNC_*` environment values to their `GITSYNC_*`
/// successors (when the successor is unset) so clap sees them. Runs before
/// [`Settings::parse`], and therefore before logging is configured, so the
/// deprecation notices are returned for the caller to log.
pub fn promote_legacy_env() -> Vec<String> {
    let mut deprecations = Vec::new();
    for (old, new) in LEGACY_ENV {
        if let Ok(val) = std::env::var(old) {
            deprecations.push(format!("{old} is deprecated, use {new}"));
            if std::env::var_os(new).is_none() {
                // Single-threaded startup; no other thread reads the
                // environment concurrently.
                unsafe { std::env::set_var(new, val) };
            }
        }
    }
    deprecations
}

impl Settings {
    /// Cross-flag validation clap cannot express. Also normalizes the
    /// webhook fire-and-forget alias (-1 → 0).
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.period < MIN_DURATION {
            return Err(ConfigError::DurationTooShort { flag: "period" });
        }
        if self.sync_timeout < MIN_DURATION {
            return Err(ConfigError::DurationTooShort {
                flag: "sync-timeout",
            });
        }

        if self.password.is_some() && self.password_file.is_some() {
            return Err(ConfigError::TwoPasswords);
        }
        if self.username.is_some() && self.password.is_none() && self.password_file.is_none() {
            return Err(ConfigError::UsernameWithoutPassword);
        }

        let auth_groups = [
            self.username.is_some(),
            self.askpass_url.is_some(),
            self.ssh_key_file.is_some(),
            self.cookie_file.is_some(),
        ];
        if auth_groups.iter().filter(|on| **on).count() > 1 {
            return Err(ConfigError::MutuallyExclusive(
                "--username/--password, --askpass-url, --ssh-key-file and --cookie-file",
            ));
        }

        if self.webhook_success_status == -1 {
            self.webhook_success_status = 0;
        }
        if reqwest::Method::from_bytes(self.webhook_method.as_bytes()).is_err() {
            return Err(ConfigError::BadWebhookMethod(self.webhook_method.clone()));
        }

        if let Some(sig) = &self.wake_signal {
            parse_signal(sig).ok_or_else(|| ConfigError::BadWakeSignal(sig.clone()))?;
        }

        Ok(())
    }

    /// Read --password or --password-file, whichever is set.
    pub fn resolve_password(&self) -> Result<Option<String>, ConfigError> {
        if let Some(pw) = &self.password {
            return Ok(Some(pw.clone()));
        }
        if let Some(file) = &self.password_file {
            let pw = std::fs::read_to_string(file)
                .map_err(|e| ConfigError::PasswordFile(file.clone(), e))?;
            return Ok(Some(pw.trim_end_matches('\n').to_string()));
        }
        Ok(None)
    }

    /// The published link path: --link, or the basename of --repo.
    pub fn effective_link(&self) -> PathBuf {
        if let Some(link) = &self.link {
            return link.clone();
        }
        let trimmed = self.repo.trim_end_matches('/');
        let base = trimmed.rsplit(['/', ':']).next().unwrap_or(trimmed);
        PathBuf::from(base)
    }

    pub fn parsed_wake_signal(&self) -> Option<i32> {
        self.wake_signal.as_deref().and_then(parse_signal)
    }
}

/// Accepts "SIGHUP", "HUP", or "1".
pub fn parse_signal(name: &str) -> Option<i32> {
    if let Ok(num) = name.parse::<i32>() {
        return (num > 0 && num < 32).then_some(num);
    }
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    use nix::sys::signal::Signal;
    full.parse::<Signal>().ok().map(|s| s as i32)
}
