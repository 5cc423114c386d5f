use std::{
    fs,
    io::Write,
    os::unix::fs::{DirBuilderExt, PermissionsExt},
    process::ExitCode,
};

use anyhow::Context;
use clap::Parser;
use server::{AppState, routes, supervisor};
use services::services::{
    config::{self, Settings},
    credentials::Credentials,
    git_cli::GitCli,
    hooks::{ExecHook, HookRunner, WebHook},
    repo::RepoService,
};
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};
use utils::{path::AbsPath, redact::redact_url};

#[tokio::main]
async fn main() -> ExitCode {
    let deprecations = config::promote_legacy_env();
    let mut settings = Settings::parse();
    init_tracing(settings.verbose);
    for message in deprecations {
        warn!("{message}");
    }

    if let Err(e) = settings.validate() {
        eprintln!("gitsync: {e}\n\nRun with --help for usage.");
        export_startup_error(&settings, &e.to_string());
        return ExitCode::FAILURE;
    }

    match run(settings.clone()).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            error!("{e:#}");
            export_startup_error(&settings, &format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> anyhow::Result<i32> {
    if settings.add_user {
        ensure_user_record().context("--add-user")?;
    }

    let root = prepare_root(&settings)?;
    info!(
        "syncing {} ({}) into {root}",
        redact_url(&settings.repo),
        settings.git_ref
    );

    let mut git = GitCli::new(&settings.git_binary);
    git.ensure_available()
        .await
        .with_context(|| format!("checking git binary {:?}", settings.git_binary))?;

    let startup_deadline = Instant::now() + settings.sync_timeout;
    let creds = Credentials::setup(&settings, &mut git, startup_deadline)
        .await
        .context("setting up credentials")?;

    let repo = RepoService::new(git, &settings, root.clone());

    let mut hooks = Vec::new();
    if let Some(command) = &settings.exechook_command {
        hooks.push(HookRunner::spawn(
            ExecHook::new(
                command.clone(),
                root.clone(),
                settings.exechook_timeout,
                settings.exechook_backoff,
            ),
            settings.one_time,
        ));
    }
    if let Some(url) = &settings.webhook_url {
        hooks.push(HookRunner::spawn(
            WebHook::new(
                url.clone(),
                &settings.webhook_method,
                settings.webhook_success_status,
                settings.webhook_timeout,
                settings.webhook_backoff,
            ),
            settings.one_time,
        ));
    }

    let state = AppState::new(settings.http_metrics, settings.http_pprof);
    if let Some(bind) = &settings.http_bind {
        let addr = normalize_bind(bind);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding http endpoint on {addr}"))?;
        info!("http endpoint on {}", listener.local_addr()?);
        let router = routes::router(state.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("http endpoint: {e}");
            }
        });
    }

    let supervisor = supervisor::Supervisor::new(settings, repo, Box::new(creds), hooks, state);
    Ok(supervisor.run().await)
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!("warn,gitsync={level},server={level},services={level},utils={level}")
    });
    let env_filter = EnvFilter::try_new(filter).expect("failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();
}

/// Create the root if missing (0775 subject to umask), canonicalize it,
/// and apply --group-write.
fn prepare_root(settings: &Settings) -> anyhow::Result<AbsPath> {
    if !settings.root.exists() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o775)
            .create(&settings.root)
            .with_context(|| format!("creating root {}", settings.root.display()))?;
    }
    let root = AbsPath::canonicalize(&settings.root)?;
    if settings.group_write {
        let mut perms = fs::metadata(&root)?.permissions();
        perms.set_mode(perms.mode() | 0o020);
        fs::set_permissions(&root, perms)?;
    }
    Ok(root)
}

/// ":9092" means all interfaces; anything else is taken literally.
fn normalize_bind(bind: &str) -> String {
    if let Some(port) = bind.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        bind.to_string()
    }
}

/// git and ssh refuse to run for a UID with no passwd entry, which is how
/// arbitrary-UID containers present themselves. Append one.
fn ensure_user_record() -> anyhow::Result<()> {
    use nix::unistd::{User, getgid, getuid};
    let uid = getuid();
    if User::from_uid(uid)?.is_some() {
        return Ok(());
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    let record = format!("gitsync:x:{}:{}::{}:/sbin/nologin\n", uid, getgid(), home);
    let mut passwd = fs::OpenOptions::new().append(true).open("/etc/passwd")?;
    passwd.write_all(record.as_bytes())?;
    info!("added passwd record for uid {uid}");
    Ok(())
}

/// Best effort: configuration and startup errors land in the error file
/// too, so a watching consumer sees why gitsync never became ready.
fn export_startup_error(settings: &Settings, msg: &str) {
    let Some(error_file) = &settings.error_file else {
        return;
    };
    let path = if error_file.is_absolute() {
        error_file.clone()
    } else {
        settings.root.join(error_file)
    };
    supervisor::write_error_file(&path, msg);
}
