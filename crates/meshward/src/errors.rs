//! Typed error taxonomy for the trust and pairing core.
//!
//! Internal call sites thread `eyre::Result` for context-chained propagation
//! (see `fsutil`, `paths`, `store`); these enums are the boundary types public
//! APIs and wire protocol handlers match on so callers get a stable `kind`
//! instead of parsing display strings.

use thiserror::Error;

/// Errors from the allowlist store (C1).
#[derive(Debug, Error)]
pub enum AllowlistError {
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("peer already authorized")]
    PeerAlreadyAuthorized,

    #[error("peer not found")]
    PeerNotFound,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from macaroon minting/verification (C2).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MacaroonError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("caveat failed: {0}")]
    CaveatFailed(String),
}

/// Errors from the sealed capability vault (C3).
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault is sealed")]
    Sealed,

    #[error("vault is already unsealed")]
    AlreadyUnsealed,

    #[error("invalid passphrase")]
    InvalidPassphrase,

    #[error("invalid totp code")]
    InvalidTotp,

    #[error("invalid recovery seed")]
    InvalidSeed,

    #[error("vault already initialized")]
    AlreadyInitialized,

    #[error("vault not initialized")]
    NotInitialized,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),
}

/// Errors from the invite deposit store (C4).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DepositError {
    #[error("deposit not found")]
    NotFound,

    #[error("deposit already consumed")]
    Consumed,

    #[error("deposit revoked")]
    Revoked,

    #[error("deposit expired")]
    Expired,
}

/// Opaque pairing failure (C5, C8). Spec §5/§7: uniform on the wire, a single
/// `reason` carried only for internal telemetry.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("pairing failed")]
pub struct PairingFailed {
    pub reason: PairingFailureReason,
}

impl PairingFailed {
    #[must_use]
    pub const fn new(reason: PairingFailureReason) -> Self {
        Self { reason }
    }
}

/// Internal-only categorization of why a pairing attempt failed. Never
/// serialized onto the wire; used for metrics/logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingFailureReason {
    GroupExpired,
    NoMatchingToken,
    SlotBurned,
    SlotAlreadyUsed,
    GroupNotFound,
}

/// Errors from the invite-code codec (C6).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InviteCodeError {
    #[error("malformed invite code: {0}")]
    Malformed(String),

    #[error("invite code version {0} is newer than supported; upgrade meshward")]
    NewerVersion(u8),

    #[error("invite code version {0} is not supported")]
    UnsupportedVersion(u8),
}

/// Errors from the PAKE handshake/session framing (C7).
#[derive(Debug, Error)]
pub enum PakeError {
    #[error("handshake not complete")]
    NotComplete,

    #[error("malformed handshake message: {0}")]
    Malformed(String),

    #[error("unsupported handshake version: {0}")]
    UnsupportedVersion(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("empty frame")]
    EmptyFrame,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the remote unseal protocol's lockout guard (C11).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UnsealProtocolError {
    #[error("permission denied: admin role required")]
    PermissionDenied,

    #[error("locked out for {remaining_secs}s")]
    LockedOut { remaining_secs: u64 },

    #[error("permanently blocked; operator must clear the lockout out-of-band")]
    PermanentlyBlocked,
}

/// Errors surfaced by the local admin API (C12).
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("vault sealed")]
    VaultSealed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<eyre::Report> for AdminError {
    fn from(e: eyre::Report) -> Self {
        Self::Internal(format!("{e:#}"))
    }
}

impl From<VaultError> for AdminError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::Sealed => Self::VaultSealed,
            VaultError::AlreadyInitialized => Self::Conflict(e.to_string()),
            other => Self::BadRequest(other.to_string()),
        }
    }
}
