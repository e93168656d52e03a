#![recursion_limit = "256"]
#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand};
use eyre::Context as _;
use std::sync::Arc;
use tracing_subscriber::prelude::*;

mod admin;
mod allowlist;
mod config;
mod doctor;
mod errors;
mod fsutil;
mod gater;
mod invite_code;
mod invite_deposit;
mod lockout;
mod macaroon;
mod pairing_store;
mod pake;
mod paths;
mod peer;
mod protocol;
mod store;
mod totp;
mod vault;

#[derive(Parser, Debug)]
#[command(name = "meshward", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the relay's trust-and-pairing core: the admin API socket plus
    /// the background sweepers that keep probation, the vault's auto-seal
    /// clock, and expired pairing/invite state honest.
    Relay,
    /// Prints the directories and files this install uses.
    Paths,
    /// Prints a safe-to-paste diagnostic snapshot.
    Doctor {
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(paths: &paths::MeshwardPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("meshward.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(stderr_layer).with(file_layer).init();

    guard
}

/// Ensures only one relay process owns a given data dir's vault and admin
/// socket at a time. The returned file must be kept alive for the relay's
/// lifetime; dropping it releases the lock.
fn acquire_single_instance_lock(paths: &paths::MeshwardPaths) -> eyre::Result<std::fs::File> {
    use fs2::FileExt as _;

    let lock_path = paths.data_dir.join("meshward.lock");
    let lock_file = {
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .mode(fsutil::MODE_FILE_PRIVATE)
                .open(&lock_path)
                .with_context(|| format!("open lock file at {}", lock_path.display()))?
        }
        #[cfg(not(unix))]
        {
            std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)
                .with_context(|| format!("open lock file at {}", lock_path.display()))?
        }
    };
    lock_file
        .try_lock_exclusive()
        .with_context(|| format!("another meshward relay already holds {}", lock_path.display()))?;
    Ok(lock_file)
}

/// Builds every in-memory subsystem, binds the admin socket, and runs until
/// a shutdown signal arrives. The wire protocol handlers in `protocol::*`
/// are plain library functions over `AsyncRead + AsyncWrite` streams — this
/// relay owns their shared state but leaves dialing/accepting connections
/// to whatever transport the embedding application provides.
async fn run_relay(paths: paths::MeshwardPaths) -> eyre::Result<()> {
    paths.ensure_private_dirs().context("ensure private dirs")?;
    let _lock_file = acquire_single_instance_lock(&paths).context("acquire single-instance lock")?;

    let config_store = store::ConfigStore::new(&paths);
    let config = config_store.load_or_init_default().context("load config")?;

    let cookie = paths.write_admin_cookie().context("write admin cookie")?;
    tracing::info!(path = %paths.admin_cookie_path().display(), "wrote admin cookie");

    let allowlist = allowlist::AllowlistStore::new(paths.allowlist_path());
    let gater = Arc::new(gater::ConnectionGater::new(
        usize::try_from(config.probation_limit).unwrap_or(usize::MAX),
        chrono::Duration::seconds(i64::try_from(config.probation_timeout_secs).unwrap_or(i64::MAX)),
    ));
    let pairing_store = Arc::new(pairing_store::PairingTokenStore::new());
    let invite_store = Arc::new(invite_deposit::InviteDepositStore::new());
    let notify_dedup = Arc::new(protocol::notify::NotifyDedup::new(
        config.peer_notify_dedup_window_secs,
    ));

    let state = Arc::new(admin::AdminState::new(
        paths.clone(),
        cookie,
        config.clone(),
        allowlist,
        Arc::clone(&gater),
        Arc::clone(&pairing_store),
        Arc::clone(&invite_store),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let admin_paths = paths.clone();
    let admin_state = Arc::clone(&state);
    let admin_shutdown = shutdown_rx.clone();
    let admin_task = tokio::spawn(async move { admin::run(admin_paths, admin_state, admin_shutdown).await });

    let drain_timeout = std::time::Duration::from_secs(config.shutdown_drain_timeout_secs);

    let sweep_gater = Arc::clone(&gater);
    let sweep_pairing = Arc::clone(&pairing_store);
    let sweep_invites = Arc::clone(&invite_store);
    let sweep_notify = Arc::clone(&notify_dedup);
    let sweep_vault_state = Arc::clone(&state);
    let mut sweep_shutdown = shutdown_rx.clone();
    let sweep_task = tokio::spawn(async move {
        let probation_interval =
            std::time::Duration::from_secs(config.probation_timeout_secs.max(1).min(60));
        let cleanup_interval = std::time::Duration::from_secs(config.peer_notify_dedup_sweep_interval_secs.max(1));
        let auto_seal_interval = std::time::Duration::from_secs(30);
        let mut probation_ticker = tokio::time::interval(probation_interval);
        let mut cleanup_ticker = tokio::time::interval(cleanup_interval);
        let mut auto_seal_ticker = tokio::time::interval(auto_seal_interval);
        loop {
            tokio::select! {
                _ = probation_ticker.tick() => {
                    sweep_gater.sweep_probation(|peer| {
                        tracing::info!(peer = %peer, "probation timed out");
                    });
                }
                _ = cleanup_ticker.tick() => {
                    let cutoff = chrono::Utc::now() - chrono::Duration::days(7);
                    sweep_pairing.clean_expired(cutoff);
                    sweep_invites.clean_expired(cutoff);
                    sweep_notify.sweep();
                }
                _ = auto_seal_ticker.tick() => {
                    sweep_vault_state.check_auto_seal();
                }
                changed = sweep_shutdown.changed() => {
                    if changed.is_err() || *sweep_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    tracing::info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(drain_timeout, async {
        let _ = admin_task.await;
        let _ = sweep_task.await;
    })
    .await;

    state.force_seal();

    let admin_socket = paths.resolved_admin_socket_path(&config);
    if admin_socket.exists() {
        let _ = std::fs::remove_file(&admin_socket);
    }
    let cookie_path = paths.admin_cookie_path();
    if cookie_path.exists() {
        let _ = std::fs::remove_file(&cookie_path);
    }
    drop(_lock_file);
    let lock_path = paths.data_dir.join("meshward.lock");
    if lock_path.exists() {
        let _ = std::fs::remove_file(&lock_path);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = paths::MeshwardPaths::discover()?;
    std::fs::create_dir_all(&paths.data_dir).context("create data dir")?;
    let _log_guard = init_logging(&paths);

    match cli.cmd {
        Command::Relay => run_relay(paths).await.context("relay failed"),
        Command::Paths => {
            use std::io::Write as _;
            let s = serde_json::to_string(&serde_json::json!({
                "config_dir": paths.config_dir,
                "data_dir": paths.data_dir,
                "log_file": paths.log_file,
            }))
            .context("serialize paths")?;
            writeln!(std::io::stdout().lock(), "{s}").context("write paths")?;
            Ok(())
        }
        Command::Doctor { json } => doctor::run(json).await.context("doctor failed"),
    }
}
