//! Self-diagnostic CLI subcommand: a safe-to-paste snapshot of relay state
//! for bug reports, without ever touching a secret.

use crate::allowlist::AllowlistStore;
use crate::config::MeshwardConfig;
use crate::paths::MeshwardPaths;
use eyre::Context as _;
use serde_json::json;
use std::path::PathBuf;

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

#[cfg(not(any(unix, windows)))]
use tokio::net::TcpStream;

#[cfg(windows)]
fn pipe_name(paths: &MeshwardPaths, config: &MeshwardConfig) -> String {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    paths
        .resolved_admin_socket_path(config)
        .to_string_lossy()
        .hash(&mut h);
    format!(r"\\.\pipe\meshward-admin-{:016x}", h.finish())
}

#[cfg(unix)]
fn admin_transport_label(paths: &MeshwardPaths, config: &MeshwardConfig) -> (String, String) {
    (
        "unix_socket".to_owned(),
        paths.resolved_admin_socket_path(config).to_string_lossy().to_string(),
    )
}

#[cfg(windows)]
fn admin_transport_label(paths: &MeshwardPaths, config: &MeshwardConfig) -> (String, String) {
    ("named_pipe".to_owned(), pipe_name(paths, config))
}

#[cfg(not(any(unix, windows)))]
fn admin_transport_label(_paths: &MeshwardPaths, _config: &MeshwardConfig) -> (String, String) {
    ("tcp_loopback".to_owned(), "127.0.0.1:41778".to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|s| s.trim().to_owned()).filter(|s| !s.is_empty())
}

async fn probe_admin_listening(paths: &MeshwardPaths, config: &MeshwardConfig) -> (bool, Option<String>) {
    let timeout = std::time::Duration::from_millis(250);

    #[cfg(unix)]
    {
        let sock = paths.resolved_admin_socket_path(config);
        match tokio::time::timeout(timeout, UnixStream::connect(&sock)).await {
            Ok(Ok(_s)) => (true, None),
            Ok(Err(e)) => (false, Some(format!("connect failed: {e}"))),
            Err(_) => (false, Some("connect timed out".to_owned())),
        }
    }

    #[cfg(windows)]
    {
        let name = pipe_name(paths, config);
        match ClientOptions::new().open(&name) {
            Ok(_c) => (true, None),
            Err(e) => (false, Some(format!("open failed: {e}"))),
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        match tokio::time::timeout(timeout, TcpStream::connect("127.0.0.1:41778")).await {
            Ok(Ok(_s)) => (true, None),
            Ok(Err(e)) => (false, Some(format!("connect failed: {e}"))),
            Err(_) => (false, Some("connect timed out".to_owned())),
        }
    }
}

struct PathsReport {
    config_dir: PathBuf,
    data_dir: PathBuf,
    log_file: PathBuf,
}

struct ConfigReport {
    path: PathBuf,
    exists: bool,
    parse_ok: bool,
    error: Option<String>,
}

struct AllowlistReport {
    path: PathBuf,
    exists: bool,
    readable: bool,
    entry_count: Option<usize>,
    admin_count: Option<usize>,
}

struct VaultReport {
    path: PathBuf,
    initialized: bool,
}

struct AdminReport {
    cookie_path: PathBuf,
    cookie_exists: bool,
    transport: String,
    address: String,
    reachable: bool,
    note: Option<String>,
}

struct DoctorReport {
    version: &'static str,
    paths: PathsReport,
    config: ConfigReport,
    allowlist: AllowlistReport,
    vault: VaultReport,
    admin: AdminReport,
    env: serde_json::Value,
}

async fn collect(paths: &MeshwardPaths) -> eyre::Result<DoctorReport> {
    let config_path = paths.config_path();
    let config_exists = config_path.exists();
    let (config_ok, config_err, config) = if config_exists {
        match std::fs::read_to_string(&config_path)
            .context("read config.toml")
            .and_then(|s| toml::from_str::<MeshwardConfig>(&s).context("parse config.toml"))
        {
            Ok(cfg) => (true, None, cfg),
            Err(e) => (false, Some(format!("{e:#}")), MeshwardConfig::default()),
        }
    } else {
        (false, None, MeshwardConfig::default())
    };

    let allowlist_path = paths.allowlist_path();
    let allowlist_exists = allowlist_path.exists();
    let allowlist_store = AllowlistStore::new(allowlist_path.clone());
    let (allowlist_readable, entry_count, admin_count) = match allowlist_store.list() {
        Ok(entries) => {
            let admins = entries.iter().filter(|e| e.role() == crate::allowlist::Role::Admin).count();
            (true, Some(entries.len()), Some(admins))
        }
        Err(_) => (false, None, None),
    };

    let vault_path = paths.vault_path();
    let vault_initialized = vault_path.exists();

    let (admin_transport, admin_address) = admin_transport_label(paths, &config);
    let cookie_path = paths.admin_cookie_path();
    let cookie_exists = cookie_path.exists();
    let (admin_reachable, admin_note) = probe_admin_listening(paths, &config).await;

    let env = json!({
        "MESHWARD_CONFIG_DIR": env_opt("MESHWARD_CONFIG_DIR"),
        "MESHWARD_DATA_DIR": env_opt("MESHWARD_DATA_DIR"),
    });

    Ok(DoctorReport {
        version: env!("CARGO_PKG_VERSION"),
        paths: PathsReport {
            config_dir: paths.config_dir.clone(),
            data_dir: paths.data_dir.clone(),
            log_file: paths.log_file.clone(),
        },
        config: ConfigReport {
            path: config_path,
            exists: config_exists,
            parse_ok: config_ok,
            error: config_err,
        },
        allowlist: AllowlistReport {
            path: allowlist_path,
            exists: allowlist_exists,
            readable: allowlist_readable,
            entry_count,
            admin_count,
        },
        vault: VaultReport {
            path: vault_path,
            initialized: vault_initialized,
        },
        admin: AdminReport {
            cookie_path,
            cookie_exists,
            transport: admin_transport,
            address: admin_address,
            reachable: admin_reachable,
            note: admin_note,
        },
        env,
    })
}

fn print_json(out: &mut impl std::io::Write, r: &DoctorReport) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(&json!({
        "ok": true,
        "version": r.version,
        "paths": {
            "config_dir": r.paths.config_dir,
            "data_dir": r.paths.data_dir,
            "log_file": r.paths.log_file,
        },
        "config": {
            "path": r.config.path,
            "exists": r.config.exists,
            "parse_ok": r.config.parse_ok,
            "error": r.config.error,
        },
        "allowlist": {
            "path": r.allowlist.path,
            "exists": r.allowlist.exists,
            "readable": r.allowlist.readable,
            "entry_count": r.allowlist.entry_count,
            "admin_count": r.allowlist.admin_count,
        },
        "vault": {
            "path": r.vault.path,
            "initialized": r.vault.initialized,
        },
        "admin": {
            "cookie_path": r.admin.cookie_path,
            "cookie_exists": r.admin.cookie_exists,
            "transport": r.admin.transport,
            "address": r.admin.address,
            "reachable": r.admin.reachable,
            "note": r.admin.note,
        },
        "env": r.env,
        "hints": [
            "If admin.reachable is false, start the relay with: meshward relay",
            "If vault.initialized is false, call POST /v1/vault/init over the admin socket once the relay is running",
            "If allowlist.admin_count is 0, no peer can reach C11's remote unseal or drive the admin API's unseal/seal endpoints on its behalf",
        ]
    }))
    .context("serialize doctor json")?;
    writeln!(out, "{s}").context("write doctor json")?;
    Ok(())
}

fn print_human(out: &mut impl std::io::Write, r: &DoctorReport) -> eyre::Result<()> {
    writeln!(out, "meshward doctor (v{})", r.version).context("write header")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Paths:").context("write paths header")?;
    writeln!(out, "  config_dir: {}", r.paths.config_dir.display()).context("write paths")?;
    writeln!(out, "  data_dir:   {}", r.paths.data_dir.display()).context("write paths")?;
    writeln!(out, "  log_file:   {}", r.paths.log_file.display()).context("write paths")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Config:").context("write config header")?;
    writeln!(out, "  config.toml: {}", r.config.path.display()).context("write config")?;
    if !r.config.exists {
        writeln!(out, "  status: missing (will be created on first run)").context("write config")?;
    } else if r.config.parse_ok {
        writeln!(out, "  status: ok").context("write config")?;
    } else {
        writeln!(out, "  status: parse failed").context("write config")?;
        if let Some(e) = &r.config.error {
            let first = e.lines().next().unwrap_or("parse error");
            writeln!(out, "  error: {first}").context("write config")?;
        }
    }
    writeln!(out).context("write newline")?;

    writeln!(out, "Allowlist:").context("write allowlist header")?;
    writeln!(out, "  path: {}", r.allowlist.path.display()).context("write allowlist")?;
    writeln!(out, "  exists: {}", r.allowlist.exists).context("write allowlist")?;
    writeln!(out, "  readable: {}", r.allowlist.readable).context("write allowlist")?;
    writeln!(out, "  entries: {:?}", r.allowlist.entry_count).context("write allowlist")?;
    writeln!(out, "  admins: {:?}", r.allowlist.admin_count).context("write allowlist")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Vault:").context("write vault header")?;
    writeln!(out, "  path: {}", r.vault.path.display()).context("write vault")?;
    writeln!(out, "  initialized: {}", r.vault.initialized).context("write vault")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Admin API:").context("write admin header")?;
    writeln!(out, "  cookie_path: {}", r.admin.cookie_path.display()).context("write admin")?;
    writeln!(out, "  cookie_exists: {}", r.admin.cookie_exists).context("write admin")?;
    writeln!(out, "  transport: {}", r.admin.transport).context("write admin")?;
    writeln!(out, "  address: {}", r.admin.address).context("write admin")?;
    writeln!(out, "  reachable: {}", r.admin.reachable).context("write admin")?;
    if let Some(note) = &r.admin.note {
        writeln!(out, "  note: {note}").context("write admin")?;
    }
    writeln!(out).context("write newline")?;

    writeln!(out, "Env:").context("write env header")?;
    writeln!(
        out,
        "  MESHWARD_CONFIG_DIR: {:?}",
        r.env.get("MESHWARD_CONFIG_DIR").and_then(|v| v.as_str())
    )
    .context("write env")?;
    writeln!(
        out,
        "  MESHWARD_DATA_DIR: {:?}",
        r.env.get("MESHWARD_DATA_DIR").and_then(|v| v.as_str())
    )
    .context("write env")?;
    Ok(())
}

pub async fn run(as_json: bool) -> eyre::Result<()> {
    let paths = MeshwardPaths::discover()?;
    let report = collect(&paths).await.context("collect doctor report")?;
    let mut out = std::io::stdout().lock();
    if as_json {
        print_json(&mut out, &report)?;
    } else {
        print_human(&mut out, &report)?;
    }
    Ok(())
}
