//! Process environment and credential setup.
//!
//! gitsync never uses the operator's own git configuration: a private
//! global-config file is created at startup and exported through
//! `GIT_CONFIG_GLOBAL`, then all credential material (credential-cache
//! entries, cookie file, SSH command) is applied against that file. The
//! askpass URL is the one dynamic piece and is re-queried before every
//! sync.

use std::path::Path;

use async_trait::async_trait;
use tempfile::TempDir;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    config::{ConfigError, Settings},
    git_cli::{GitCli, GitCliError},
    gitconfig::{self, GitConfigParseError},
    metrics,
};

/// Defaults written into the private global config. Auto-gc is off because
/// cleanup drives gc explicitly; reflogs are pruned eagerly because the
/// bare metadata is a cache, not history.
const DEFAULT_CONFIGS: &[(&str, &str)] = &[
    ("gc.auto", "0"),
    ("gc.reflogExpire", "now"),
    ("credential.helper", "cache --timeout 3600"),
    ("safe.directory", "*"),
];

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid --git-config: {0}")]
    GitConfig(#[from] GitConfigParseError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("askpass request failed: {0}")]
    Askpass(#[from] reqwest::Error),
    #[error("askpass response is missing a {0}= line")]
    AskpassMissing(&'static str),
}

/// Per-sync credential refresh hook. The repository state calls this at
/// the top of every sync attempt; a failure aborts the attempt.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, deadline: Instant) -> Result<(), CredentialsError>;
}

pub struct Credentials {
    // Holds the private global config file; dropped on shutdown.
    config_dir: TempDir,
    git: GitCli,
    repo: String,
    askpass: Option<Askpass>,
}

struct Askpass {
    url: String,
    client: reqwest::Client,
}

impl Credentials {
    /// Create the private global config, export it (and the SSH command)
    /// into `git`'s child environment, then apply defaults, the operator's
    /// extra config pairs, and any static credential material.
    pub async fn setup(
        settings: &Settings,
        git: &mut GitCli,
        deadline: Instant,
    ) -> Result<Self, CredentialsError> {
        let config_dir = TempDir::with_prefix("gitsync-gitconfig-")?;
        let config_path = config_dir.path().join("config");
        std::fs::write(&config_path, "")?;
        git.export("GIT_CONFIG_GLOBAL", &config_path);
        debug!("private git config at {}", config_path.display());

        if let Some(key) = &settings.ssh_key_file {
            git.export(
                "GIT_SSH_COMMAND",
                ssh_command(key, settings.ssh_known_hosts, &settings.ssh_known_hosts_file),
            );
        }

        let cwd = config_dir.path().to_path_buf();
        for &(key, val) in DEFAULT_CONFIGS {
            git.run(&cwd, ["config", "--global", key, val], deadline)
                .await?;
        }

        if let Some(raw) = &settings.git_config {
            let pairs = gitconfig::parse_git_configs(raw)?;
            gitconfig::apply_git_configs(git, &cwd, &pairs, deadline).await?;
        }

        if let Some(cookie_file) = &settings.cookie_file {
            let args: [&std::ffi::OsStr; 4] = [
                "config".as_ref(),
                "--global".as_ref(),
                "http.cookiefile".as_ref(),
                cookie_file.as_os_str(),
            ];
            git.run(&cwd, args, deadline).await?;
        }

        let creds = Self {
            config_dir,
            git: git.clone(),
            repo: settings.repo.clone(),
            askpass: settings.askpass_url.as_ref().map(|url| Askpass {
                url: url.clone(),
                client: reqwest::Client::new(),
            }),
        };

        if let Some(username) = &settings.username {
            let password = settings.resolve_password()?.unwrap_or_default();
            creds.approve(username, &password, deadline).await?;
            info!("stored credentials for {username}");
        }

        Ok(creds)
    }

    /// Pipe a credential record into `git credential approve`, landing it
    /// in the cache configured above.
    async fn approve(
        &self,
        username: &str,
        password: &str,
        deadline: Instant,
    ) -> Result<(), CredentialsError> {
        let input = format!(
            "url={}\nusername={}\npassword={}\n\n",
            self.repo, username, password
        );
        self.git
            .run_with_stdin(
                self.config_dir.path(),
                ["credential", "approve"],
                Some(input.as_bytes()),
                deadline,
            )
            .await?;
        Ok(())
    }

    async fn refresh_askpass(
        &self,
        askpass: &Askpass,
        deadline: Instant,
    ) -> Result<(), CredentialsError> {
        metrics::ASKPASS_TOTAL.inc();
        let body = askpass
            .client
            .get(&askpass.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let mut username = None;
        let mut password = None;
        for line in body.lines() {
            if let Some(v) = line.strip_prefix("username=") {
                username = Some(v.to_string());
            } else if let Some(v) = line.strip_prefix("password=") {
                password = Some(v.to_string());
            }
        }
        let username = username.ok_or(CredentialsError::AskpassMissing("username"))?;
        let password = password.ok_or(CredentialsError::AskpassMissing("password"))?;
        self.approve(&username, &password, deadline).await
    }
}

#[async_trait]
impl CredentialRefresher for Credentials {
    async fn refresh(&self, deadline: Instant) -> Result<(), CredentialsError> {
        match &self.askpass {
            Some(askpass) => self.refresh_askpass(askpass, deadline).await,
            None => Ok(()),
        }
    }
}

/// The SSH command exported as GIT_SSH_COMMAND.
fn ssh_command(key_file: &Path, known_hosts: bool, known_hosts_file: &Path) -> String {
    if known_hosts {
        format!(
            "ssh -i {} -o StrictHostKeyChecking=yes -o UserKnownHostsFile={}",
            key_file.display(),
            known_hosts_file.display()
        )
    } else {
        format!(
            "ssh -i {} -o StrictHostKeyChecking=no",
            key_file.display()
        )
    }
}

/// No-credentials stand-in for tests and anonymous upstreams.
pub struct NoCredentials;

#[async_trait]
impl CredentialRefresher for NoCredentials {
    async fn refresh(&self, _deadline: Instant) -> Result<(), CredentialsError> {
        Ok(())
    }
}
