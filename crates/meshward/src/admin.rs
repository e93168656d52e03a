//! Admin API: the local control plane an operator (or a CLI wrapper)
//! uses to drive pairing, invites, and the vault.
//!
//! Transport is a Unix domain socket carrying newline-delimited JSON, in the
//! same spirit as the daemon's JSON-RPC-over-`UnixListener` loop: one
//! connection per client, one JSON object per line in, one JSON object per
//! line out. Requests look like `{"method","path","authorization","body"}`;
//! responses look like `{"status","body"}`. Every request's `authorization`
//! field must carry `Bearer <cookie>`, where `<cookie>` is the one-time
//! cookie [`crate::paths::MeshwardPaths::write_admin_cookie`] wrote at
//! startup, compared in constant time.

use crate::allowlist::AllowlistStore;
use crate::config::MeshwardConfig;
use crate::errors::AdminError;
use crate::gater::ConnectionGater;
use crate::invite_deposit::{DepositStatus, InviteDepositStore};
use crate::macaroon::Macaroon;
use crate::pairing_store::PairingTokenStore;
use crate::paths::MeshwardPaths;
use chrono::Duration;
use eyre::Context as _;
use rand::Rng as _;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use subtle::ConstantTimeEq as _;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tracing::warn;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

#[cfg(not(any(unix, windows)))]
use tokio::net::{TcpListener, TcpStream};

/// Body + full request line are capped at 4KiB.
const MAX_LINE_BYTES: usize = 4096;

enum VaultCell {
    Uninitialized,
    Sealed(crate::vault::Vault),
    Unsealed(crate::vault::Vault),
}

impl VaultCell {
    fn load(path: &std::path::Path) -> Self {
        match crate::vault::Vault::open(path.to_path_buf()) {
            Ok(vault) => Self::Sealed(vault),
            Err(_) => Self::Uninitialized,
        }
    }

    const fn is_sealed(&self) -> Option<bool> {
        match self {
            Self::Uninitialized => None,
            Self::Sealed(_) => Some(true),
            Self::Unsealed(_) => Some(false),
        }
    }
}

/// Everything the admin API needs, shared with whatever else in the process
/// (background sweepers, and — once a real transport is wired in — the wire
/// protocol handlers) holds the same `Arc`s.
pub struct AdminState {
    paths: MeshwardPaths,
    cookie: String,
    config: MeshwardConfig,
    vault_path: std::path::PathBuf,
    vault: Mutex<VaultCell>,
    allowlist: AllowlistStore,
    gater: Arc<ConnectionGater>,
    pairing_store: Arc<PairingTokenStore>,
    invite_store: Arc<InviteDepositStore>,
}

impl AdminState {
    #[must_use]
    pub fn new(
        paths: MeshwardPaths,
        cookie: String,
        config: MeshwardConfig,
        allowlist: AllowlistStore,
        gater: Arc<ConnectionGater>,
        pairing_store: Arc<PairingTokenStore>,
        invite_store: Arc<InviteDepositStore>,
    ) -> Self {
        let vault_path = paths.vault_path();
        let vault = Mutex::new(VaultCell::load(&vault_path));
        Self {
            paths,
            cookie,
            config,
            vault_path,
            vault,
            allowlist,
            gater,
            pairing_store,
            invite_store,
        }
    }

    /// Seals the vault if it's currently unsealed and has outstayed its
    /// `auto_seal_minutes` timer. A no-op when uninitialized, already
    /// sealed, or the timer hasn't elapsed. Intended to be polled by a
    /// background ticker (spec §5's "periodic auto-seal check").
    pub fn check_auto_seal(&self) {
        let mut guard = self.vault.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let VaultCell::Unsealed(vault) = &mut *guard {
            if vault.should_auto_seal(chrono::Utc::now()) {
                vault.seal();
                tracing::info!("vault auto-sealed after idle timeout");
            }
        }
    }

    /// Unconditionally seals the vault if unsealed. Called on shutdown
    /// (spec §6: a terminating relay "seals the vault" before exiting).
    pub fn force_seal(&self) {
        let mut guard = self.vault.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let VaultCell::Unsealed(vault) = &mut *guard {
            vault.seal();
            tracing::info!("vault sealed on shutdown");
        }
    }
}

#[derive(Debug, Deserialize)]
struct AdminRequest {
    method: String,
    path: String,
    #[serde(default)]
    authorization: String,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Serialize)]
struct AdminResponse {
    status: u16,
    body: Value,
}

fn ok(body: Value) -> AdminResponse {
    AdminResponse { status: 200, body }
}

fn created(body: Value) -> AdminResponse {
    AdminResponse { status: 201, body }
}

fn error_response(e: AdminError) -> AdminResponse {
    let status = match e {
        AdminError::Unauthorized => 401,
        AdminError::NotFound => 404,
        AdminError::Conflict(_) => 409,
        AdminError::BadRequest(_) => 400,
        AdminError::VaultSealed => 423,
        AdminError::Internal(_) => 500,
    };
    AdminResponse {
        status,
        body: json!({ "error": e.to_string() }),
    }
}

fn constant_time_eq(expected: &str, got: &str) -> bool {
    expected.len() == got.len() && expected.as_bytes().ct_eq(got.as_bytes()).unwrap_u8() == 1
}

const BEARER_PREFIX: &str = "Bearer ";

/// Checks a request's `authorization` field against the admin cookie per
/// spec's `Bearer <cookie>` scheme.
fn authorized(expected_cookie: &str, authorization: &str) -> bool {
    match authorization.strip_prefix(BEARER_PREFIX) {
        Some(token) => constant_time_eq(expected_cookie, token),
        None => false,
    }
}

fn deposit_summary(d: &crate::invite_deposit::InviteDeposit) -> Value {
    json!({
        "id": d.id,
        "created_by": d.created_by,
        "created_at": d.created_at,
        "expires_at": d.expires_at,
        "status": match d.status {
            DepositStatus::Pending => "pending",
            DepositStatus::Consumed => "consumed",
            DepositStatus::Revoked => "revoked",
            DepositStatus::Expired => "expired",
        },
        "consumed_by": d.consumed_by,
        "consumed_at": d.consumed_at,
        "macaroon": d.macaroon.encode().ok(),
    })
}

fn pairing_summary(g: &crate::pairing_store::PairingGroup) -> Value {
    json!({
        "group_id": g.group_id,
        "namespace": g.namespace,
        "created_at": g.created_at,
        "expires_at": g.expires_at,
        "slot_count": g.slots.len(),
        "used_count": g.slots.iter().filter(|s| s.used_at.is_some()).count(),
        "is_complete": g.is_complete(),
    })
}

fn route_segments(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

fn handle_pair_create(state: &AdminState, body: &Value) -> Result<AdminResponse, AdminError> {
    let count = body
        .get("count")
        .and_then(Value::as_u64)
        .ok_or_else(|| AdminError::BadRequest("missing integer field: count".to_owned()))?;
    let ttl_secs = body.get("ttl_seconds").and_then(Value::as_i64).unwrap_or(3600);
    let namespace = body
        .get("namespace")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    let peer_ttl = body
        .get("expires_seconds")
        .and_then(Value::as_i64)
        .map(Duration::seconds);

    let (group_id, tokens) = state.pairing_store.create_group(
        usize::try_from(count).unwrap_or(0),
        Duration::seconds(ttl_secs),
        namespace,
        peer_ttl,
    );

    state.gater.set_enrollment_mode(
        true,
        usize::try_from(state.config.probation_limit).unwrap_or(usize::MAX),
        Duration::seconds(i64::try_from(state.config.probation_timeout_secs).unwrap_or(i64::MAX)),
    );

    let codes: Vec<String> = tokens.iter().map(hex::encode).collect();
    let expires_at = state.pairing_store.get(&group_id).map(|g| g.expires_at);
    Ok(created(
        json!({ "group_id": group_id, "codes": codes, "expires_at": expires_at }),
    ))
}

fn handle_pair_list(state: &AdminState) -> Result<AdminResponse, AdminError> {
    let groups: Vec<Value> = state.pairing_store.list().iter().map(pairing_summary).collect();
    Ok(ok(json!({ "groups": groups })))
}

fn handle_pair_revoke(state: &AdminState, group_id: &str) -> Result<AdminResponse, AdminError> {
    if !state.pairing_store.revoke(group_id) {
        return Err(AdminError::NotFound);
    }
    if state.pairing_store.active_count() == 0 {
        state.gater.set_enrollment_mode(
            false,
            usize::try_from(state.config.probation_limit).unwrap_or(usize::MAX),
            Duration::seconds(i64::try_from(state.config.probation_timeout_secs).unwrap_or(i64::MAX)),
        );
    }
    Ok(ok(json!({ "revoked": true })))
}

fn handle_invite_create(state: &AdminState, body: &Value) -> Result<AdminResponse, AdminError> {
    let created_by = body
        .get("created_by")
        .and_then(Value::as_str)
        .ok_or_else(|| AdminError::BadRequest("missing string field: created_by".to_owned()))?;
    let ttl_secs = body.get("ttl_secs").and_then(Value::as_i64);
    let predicates: Vec<String> = body
        .get("predicates")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(ToOwned::to_owned)).collect())
        .unwrap_or_default();

    let guard = state.vault.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let VaultCell::Unsealed(vault) = &*guard else {
        return Err(AdminError::VaultSealed);
    };
    let root_key = vault.root_key().map_err(AdminError::from)?;

    let mut id_bytes = [0_u8; 8];
    rand::rng().fill_bytes(&mut id_bytes);
    let mut macaroon = Macaroon::new("meshward-relay", root_key, hex::encode(id_bytes));
    for predicate in &predicates {
        macaroon.add_caveat(predicate.clone());
    }
    drop(guard);

    let deposit_id = state
        .invite_store
        .create(macaroon.clone(), created_by, ttl_secs.map(Duration::seconds));

    Ok(created(json!({
        "deposit_id": deposit_id,
        "macaroon": macaroon.encode().map_err(|e| AdminError::Internal(e.to_string()))?,
    })))
}

fn handle_invite_list(state: &AdminState) -> Result<AdminResponse, AdminError> {
    let deposits: Vec<Value> = state.invite_store.list().iter().map(deposit_summary).collect();
    Ok(ok(json!({ "deposits": deposits })))
}

fn deposit_error(e: crate::errors::DepositError) -> AdminError {
    match e {
        crate::errors::DepositError::NotFound => AdminError::NotFound,
        other => AdminError::Conflict(other.to_string()),
    }
}

fn handle_invite_revoke(state: &AdminState, id: &str) -> Result<AdminResponse, AdminError> {
    state.invite_store.revoke(id).map_err(deposit_error)?;
    Ok(ok(json!({ "revoked": true })))
}

fn handle_invite_patch(state: &AdminState, id: &str, body: &Value) -> Result<AdminResponse, AdminError> {
    let predicate = body
        .get("predicate")
        .and_then(Value::as_str)
        .ok_or_else(|| AdminError::BadRequest("missing string field: predicate".to_owned()))?;
    state.invite_store.add_caveat(id, predicate).map_err(deposit_error)?;
    Ok(ok(json!({ "updated": true })))
}

fn handle_vault_init(state: &AdminState, body: &Value) -> Result<AdminResponse, AdminError> {
    let passphrase = body
        .get("passphrase")
        .and_then(Value::as_str)
        .ok_or_else(|| AdminError::BadRequest("missing string field: passphrase".to_owned()))?;
    let enable_totp = body.get("enable_totp").and_then(Value::as_bool).unwrap_or(false);
    let auto_seal_minutes = body
        .get("auto_seal_minutes")
        .and_then(Value::as_u64)
        .unwrap_or(state.config.default_auto_seal_minutes);

    let mut guard = state.vault.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if !matches!(&*guard, VaultCell::Uninitialized) {
        return Err(AdminError::Conflict("vault already initialized".to_owned()));
    }

    let (vault, seed_phrase, totp_uri) = crate::vault::Vault::create(
        state.vault_path.clone(),
        &SecretString::new(passphrase.to_owned().into()),
        enable_totp,
        auto_seal_minutes,
    )
    .map_err(AdminError::from)?;
    *guard = VaultCell::Unsealed(vault);

    Ok(created(json!({
        "seed_phrase": seed_phrase,
        "totp_uri": totp_uri,
    })))
}

fn handle_unseal(state: &AdminState, body: &Value) -> Result<AdminResponse, AdminError> {
    let passphrase = body
        .get("passphrase")
        .and_then(Value::as_str)
        .ok_or_else(|| AdminError::BadRequest("missing string field: passphrase".to_owned()))?;
    let totp = body.get("totp").and_then(Value::as_str);

    let mut guard = state.vault.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let taken = std::mem::replace(&mut *guard, VaultCell::Uninitialized);
    let mut vault = match taken {
        VaultCell::Uninitialized => return Err(AdminError::NotFound),
        VaultCell::Unsealed(vault) => {
            *guard = VaultCell::Unsealed(vault);
            return Err(AdminError::Conflict("vault already unsealed".to_owned()));
        }
        VaultCell::Sealed(vault) => vault,
    };

    match vault.unseal(&SecretString::new(passphrase.to_owned().into()), totp) {
        Ok(()) => {
            *guard = VaultCell::Unsealed(vault);
            Ok(ok(json!({ "sealed": false })))
        }
        Err(e) => {
            *guard = VaultCell::Sealed(vault);
            Err(AdminError::from(e))
        }
    }
}

fn handle_seal(state: &AdminState) -> Result<AdminResponse, AdminError> {
    let mut guard = state.vault.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let taken = std::mem::replace(&mut *guard, VaultCell::Uninitialized);
    *guard = match taken {
        VaultCell::Uninitialized => return Err(AdminError::NotFound),
        VaultCell::Sealed(vault) => VaultCell::Sealed(vault),
        VaultCell::Unsealed(mut vault) => {
            vault.seal();
            VaultCell::Sealed(vault)
        }
    };
    Ok(ok(json!({ "sealed": true })))
}

fn handle_seal_status(state: &AdminState) -> Result<AdminResponse, AdminError> {
    let guard = state.vault.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let initialized = !matches!(&*guard, VaultCell::Uninitialized);
    let sealed = guard.is_sealed();
    let (totp_enabled, auto_seal_minutes) = match &*guard {
        VaultCell::Uninitialized => (None, None),
        VaultCell::Sealed(v) | VaultCell::Unsealed(v) => (Some(v.totp_enabled()), Some(v.auto_seal_minutes())),
    };
    Ok(ok(json!({
        "initialized": initialized,
        "sealed": sealed,
        "totp_enabled": totp_enabled,
        "auto_seal_minutes": auto_seal_minutes,
    })))
}

async fn route(state: &AdminState, req: &AdminRequest) -> Result<AdminResponse, AdminError> {
    let segments = route_segments(&req.path);
    match (req.method.as_str(), segments.as_slice()) {
        ("POST", ["v1", "pair"]) => handle_pair_create(state, &req.body),
        ("GET", ["v1", "pair"]) => handle_pair_list(state),
        ("DELETE", ["v1", "pair", group_id]) => handle_pair_revoke(state, group_id),
        ("POST", ["v1", "invite"]) => handle_invite_create(state, &req.body),
        ("GET", ["v1", "invite"]) => handle_invite_list(state),
        ("DELETE", ["v1", "invite", id]) => handle_invite_revoke(state, id),
        ("PATCH", ["v1", "invite", id]) => handle_invite_patch(state, id, &req.body),
        ("POST", ["v1", "vault", "init"]) => handle_vault_init(state, &req.body),
        ("POST", ["v1", "unseal"]) => handle_unseal(state, &req.body),
        ("POST", ["v1", "seal"]) => handle_seal(state),
        ("GET", ["v1", "seal-status"]) => handle_seal_status(state),
        _ => Err(AdminError::NotFound),
    }
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, resp: &AdminResponse) -> eyre::Result<()> {
    let line = serde_json::to_string(resp)?;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await?;
    Ok(())
}

async fn serve_connection<S>(stream: S, state: Arc<AdminState>) -> eyre::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.len() > MAX_LINE_BYTES {
            write_frame(
                &mut write_half,
                &AdminResponse {
                    status: 413,
                    body: json!({ "error": "request exceeds 4KiB" }),
                },
            )
            .await?;
            continue;
        }

        let req: AdminRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                write_frame(
                    &mut write_half,
                    &AdminResponse {
                        status: 400,
                        body: json!({ "error": format!("malformed request: {e}") }),
                    },
                )
                .await?;
                continue;
            }
        };

        if !authorized(&state.cookie, &req.authorization) {
            write_frame(&mut write_half, &error_response(AdminError::Unauthorized)).await?;
            continue;
        }

        let resp = match route(&state, &req).await {
            Ok(resp) => resp,
            Err(e) => error_response(e),
        };
        write_frame(&mut write_half, &resp).await?;
    }

    Ok(())
}

/// Binds the admin domain socket. Stale sockets (file present, nothing
/// listening) are removed; an actively-listening socket refuses to start
/// rather than stealing it out from under another relay process.
#[cfg(unix)]
pub async fn bind_listener(paths: &MeshwardPaths, config: &MeshwardConfig) -> eyre::Result<UnixListener> {
    let p = paths.resolved_admin_socket_path(config);
    if p.exists() {
        let probe = tokio::time::timeout(StdDuration::from_millis(200), UnixStream::connect(&p)).await;
        if matches!(probe, Ok(Ok(_))) {
            eyre::bail!("admin socket {} already has an active listener", p.display());
        }
        let md = std::fs::symlink_metadata(&p).context("stat existing admin socket")?;
        if md.file_type().is_symlink() {
            eyre::bail!("refusing to remove symlink at {}", p.display());
        }
        std::fs::remove_file(&p).with_context(|| format!("remove stale admin socket at {}", p.display()))?;
    }
    if let Some(parent) = p.parent() {
        crate::fsutil::ensure_private_dir(parent)?;
    }
    let listener =
        UnixListener::bind(&p).with_context(|| format!("bind admin socket at {}", p.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        if let Err(e) = std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o600)) {
            warn!(error = %e, "failed to set admin socket permissions");
        }
    }

    Ok(listener)
}

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

#[cfg(windows)]
pub async fn bind_listener(paths: &MeshwardPaths, config: &MeshwardConfig) -> eyre::Result<NamedPipeServer> {
    let name = pipe_name(paths, config);
    if ClientOptions::new().open(&name).is_ok() {
        eyre::bail!("admin pipe {name} already has an active listener");
    }
    ServerOptions::new()
        .first_pipe_instance(true)
        .create(&name)
        .with_context(|| format!("create named pipe server at {name}"))
}

#[cfg(not(any(unix, windows)))]
pub async fn bind_listener(_paths: &MeshwardPaths, _config: &MeshwardConfig) -> eyre::Result<TcpListener> {
    TcpListener::bind("127.0.0.1:41778")
        .await
        .context("bind tcp listener (loopback)")
}

/// Runs the admin API accept loop until `shutdown` resolves.
#[cfg(unix)]
pub async fn run(
    listener_paths: MeshwardPaths,
    state: Arc<AdminState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> eyre::Result<()> {
    let listener = bind_listener(&listener_paths, &state.config).await?;
    loop {
        let stream = tokio::select! {
            res = listener.accept() => res?.0,
            _ = shutdown.changed() => break,
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, state).await {
                warn!(error = %e, "admin connection handler failed");
            }
        });
    }
    Ok(())
}

#[cfg(windows)]
pub async fn run(
    listener_paths: MeshwardPaths,
    state: Arc<AdminState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> eyre::Result<()> {
    let mut pending = bind_listener(&listener_paths, &state.config).await?;
    loop {
        let server = tokio::select! {
            res = pending.connect() => { res?; pending }
            _ = shutdown.changed() => break,
        };
        pending = bind_listener(&listener_paths, &state.config).await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(server, state).await {
                warn!(error = %e, "admin connection handler failed");
            }
        });
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
pub async fn run(
    listener_paths: MeshwardPaths,
    state: Arc<AdminState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> eyre::Result<()> {
    let listener = bind_listener(&listener_paths, &state.config).await?;
    loop {
        let (stream, _addr) = tokio::select! {
            res = listener.accept() => res?,
            _ = shutdown.changed() => break,
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, state).await {
                warn!(error = %e, "admin connection handler failed");
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;

    fn test_state(dir: &std::path::Path) -> Arc<AdminState> {
        let paths = MeshwardPaths {
            config_dir: dir.join("config"),
            data_dir: dir.join("data"),
            log_file: dir.join("data/log.jsonl"),
        };
        paths.ensure_private_dirs().unwrap();
        let cookie = paths.write_admin_cookie().unwrap();
        let config = MeshwardConfig::default();
        let allowlist = AllowlistStore::new(paths.allowlist_path());
        let gater = Arc::new(ConnectionGater::new(8, Duration::minutes(5)));
        let pairing_store = Arc::new(PairingTokenStore::new());
        let invite_store = Arc::new(InviteDepositStore::new());
        Arc::new(AdminState::new(
            paths,
            cookie,
            config,
            allowlist,
            gater,
            pairing_store,
            invite_store,
        ))
    }

    #[tokio::test]
    async fn unauthorized_request_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let req = AdminRequest {
            method: "GET".to_owned(),
            path: "/v1/seal-status".to_owned(),
            authorization: "Bearer wrong".to_owned(),
            body: Value::Null,
        };
        assert!(!authorized(&state.cookie, &req.authorization));
    }

    #[tokio::test]
    async fn missing_bearer_prefix_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let req = AdminRequest {
            method: "GET".to_owned(),
            path: "/v1/seal-status".to_owned(),
            authorization: state.cookie.clone(),
            body: Value::Null,
        };
        assert!(!authorized(&state.cookie, &req.authorization));
    }

    #[tokio::test]
    async fn correct_bearer_cookie_is_authorized() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let authorization = format!("Bearer {}", state.cookie);
        assert!(authorized(&state.cookie, &authorization));
    }

    #[tokio::test]
    async fn vault_lifecycle_init_seal_unseal() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let status = handle_seal_status(&state).unwrap();
        assert_eq!(status.body["initialized"], false);

        let init = handle_vault_init(&state, &json!({ "passphrase": "hunter2" })).unwrap();
        assert_eq!(init.status, 201);
        assert!(init.body["seed_phrase"].is_string());

        let conflict = handle_vault_init(&state, &json!({ "passphrase": "again" })).unwrap_err();
        assert!(matches!(conflict, AdminError::Conflict(_)));

        let seal = handle_seal(&state).unwrap();
        assert_eq!(seal.body["sealed"], true);

        let unseal_err = handle_unseal(&state, &json!({ "passphrase": "wrong" })).unwrap_err();
        assert!(matches!(unseal_err, AdminError::VaultSealed | AdminError::BadRequest(_)));

        let unseal_ok = handle_unseal(&state, &json!({ "passphrase": "hunter2" })).unwrap();
        assert_eq!(unseal_ok.body["sealed"], false);
    }

    #[tokio::test]
    async fn invite_requires_unsealed_vault() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let err = handle_invite_create(&state, &json!({ "created_by": "admin" })).unwrap_err();
        assert!(matches!(err, AdminError::VaultSealed));

        handle_vault_init(&state, &json!({ "passphrase": "hunter2" })).unwrap();
        let created = handle_invite_create(&state, &json!({ "created_by": "admin", "predicates": ["service=proxy"] }))
            .unwrap();
        assert!(created.body["deposit_id"].is_string());
    }

    #[tokio::test]
    async fn pair_create_enables_enrollment_and_revoke_disables_it() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let resp = handle_pair_create(&state, &json!({ "count": 1 })).unwrap();
        let group_id = resp.body["group_id"].as_str().unwrap().to_owned();

        assert!(state.gater.intercept_secured(
            crate::peer::Direction::Inbound,
            &PeerId::parse("12D3KooWfresh").unwrap(),
            ""
        ));

        handle_pair_revoke(&state, &group_id).unwrap();
        assert_eq!(state.pairing_store.active_count(), 0);
        assert!(!state.gater.intercept_secured(
            crate::peer::Direction::Inbound,
            &PeerId::parse("12D3KooWanother").unwrap(),
            ""
        ));
    }
}
