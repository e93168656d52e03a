//! Vault: a passphrase-sealed 32-byte root key with an optional TOTP
//! second factor, auto-reseal, and seed-phrase recovery.

pub mod crypto;

use crate::errors::VaultError;
use crate::totp;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use crypto::CryptoBox;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use zeroize::Zeroize as _;

/// On-disk sealed representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedVault {
    salt_b64: String,
    root_key_box: CryptoBox,
    totp_enabled: bool,
    totp_secret_box: Option<CryptoBox>,
    auto_seal_minutes: u64,
    /// Fingerprint of the display seed phrase, so an operator can confirm
    /// they still hold the right recovery phrase without re-deriving keys.
    seed_hash: String,
}

enum State {
    Sealed,
    Unsealed {
        root_key: [u8; 32],
        totp_secret: Option<Vec<u8>>,
        unsealed_at: DateTime<Utc>,
    },
}

/// A sealed capability vault bound to a file on disk.
pub struct Vault {
    path: PathBuf,
    sealed: SealedVault,
    state: State,
}

fn seed_words(root_key: &[u8; 32]) -> String {
    root_key
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_seed(phrase: &str) -> Result<[u8; 32], VaultError> {
    let tokens: Vec<&str> = phrase.split_whitespace().collect();

    if tokens.len() == 32 && tokens.iter().all(|t| t.len() == 2 && t.chars().all(|c| c.is_ascii_hexdigit())) {
        let mut out = [0_u8; 32];
        for (slot, token) in out.iter_mut().zip(tokens.iter()) {
            *slot = u8::from_str_radix(token, 16).map_err(|_| VaultError::InvalidSeed)?;
        }
        return Ok(out);
    }

    if tokens.len() == 24 {
        let mnemonic = bip39::Mnemonic::parse_in_normalized(bip39::Language::English, phrase)
            .map_err(|_| VaultError::InvalidSeed)?;
        let entropy = mnemonic.to_entropy();
        let out: [u8; 32] = entropy.try_into().map_err(|_| VaultError::InvalidSeed)?;
        return Ok(out);
    }

    Err(VaultError::InvalidSeed)
}

fn seed_hash_of(phrase: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(phrase.as_bytes());
    hex::encode(hasher.finalize())
}

impl Vault {
    /// Creates a brand-new vault at `path`. Fails with `AlreadyInitialized`
    /// if a sealed vault is already persisted there. Returns the unsealed
    /// vault, the display seed phrase (shown once), and, if `enable_totp`,
    /// an `otpauth://` enrollment URI.
    pub fn create(
        path: impl Into<PathBuf>,
        passphrase: &SecretString,
        enable_totp: bool,
        auto_seal_minutes: u64,
    ) -> Result<(Self, String, Option<String>), VaultError> {
        let path = path.into();
        if path.exists() {
            return Err(VaultError::AlreadyInitialized);
        }

        let mut root_key = [0_u8; 32];
        crypto::fill_random(&mut root_key);
        let seed_phrase = seed_words(&root_key);

        let salt = crypto::random_salt16();
        let enc_key =
            crypto::derive_passphrase_key(passphrase, &salt).map_err(|e| VaultError::Crypto(e.to_string()))?;
        let root_key_box =
            crypto::encrypt(&enc_key, &root_key).map_err(|e| VaultError::Crypto(e.to_string()))?;

        let (totp_secret, totp_secret_box, totp_uri) = if enable_totp {
            let mut secret = vec![0_u8; 20];
            crypto::fill_random(&mut secret);
            let uri = totp::otpauth_uri(&secret, "meshward", "relay");
            let boxed = crypto::encrypt(&enc_key, &secret)
                .map_err(|e| VaultError::Crypto(e.to_string()))?;
            (Some(secret), Some(boxed), Some(uri))
        } else {
            (None, None, None)
        };

        let sealed = SealedVault {
            salt_b64: base64::engine::general_purpose::STANDARD.encode(salt),
            root_key_box,
            totp_enabled: enable_totp,
            totp_secret_box,
            auto_seal_minutes,
            seed_hash: seed_hash_of(&seed_phrase),
        };

        let vault = Self {
            path,
            sealed,
            state: State::Unsealed {
                root_key,
                totp_secret,
                unsealed_at: Utc::now(),
            },
        };
        vault.persist()?;

        Ok((vault, seed_phrase, totp_uri))
    }

    /// Opens the sealed vault at `path` without unsealing it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let path = path.into();
        if !path.exists() {
            return Err(VaultError::NotInitialized);
        }
        let raw = std::fs::read_to_string(&path)?;
        let sealed: SealedVault = serde_json::from_str(&raw)?;
        Ok(Self {
            path,
            sealed,
            state: State::Sealed,
        })
    }

    fn persist(&self) -> Result<(), VaultError> {
        let s = serde_json::to_string_pretty(&self.sealed)?;
        crate::fsutil::write_string_atomic_restrictive(&self.path, &s, crate::fsutil::MODE_FILE_PRIVATE)
            .map_err(|e| VaultError::Crypto(e.to_string()))?;
        Ok(())
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        matches!(self.state, State::Sealed)
    }

    #[must_use]
    pub fn totp_enabled(&self) -> bool {
        self.sealed.totp_enabled
    }

    #[must_use]
    pub fn auto_seal_minutes(&self) -> u64 {
        self.sealed.auto_seal_minutes
    }

    /// Unseals the vault, re-deriving the passphrase key and, if a second
    /// factor is configured, validating the submitted TOTP code. A TOTP
    /// failure zeroes the decrypted root key before returning, so no secret
    /// survives a rejected second factor.
    pub fn unseal(&mut self, passphrase: &SecretString, totp_code: Option<&str>) -> Result<(), VaultError> {
        if !self.is_sealed() {
            return Err(VaultError::AlreadyUnsealed);
        }

        let salt_bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.sealed.salt_b64)
            .map_err(|_| VaultError::InvalidPassphrase)?;
        let salt: [u8; 16] = salt_bytes.try_into().map_err(|_| VaultError::InvalidPassphrase)?;
        let enc_key = crypto::derive_passphrase_key(passphrase, &salt).map_err(|_| VaultError::InvalidPassphrase)?;

        let mut root_key_vec =
            crypto::decrypt(&enc_key, &self.sealed.root_key_box).map_err(|_| VaultError::InvalidPassphrase)?;
        let mut root_key: [u8; 32] = {
            let Ok(arr) = <[u8; 32]>::try_from(root_key_vec.as_slice()) else {
                return Err(VaultError::InvalidPassphrase);
            };
            arr
        };
        root_key_vec.zeroize();

        let totp_secret = if self.sealed.totp_enabled {
            let Some(boxed) = &self.sealed.totp_secret_box else {
                root_key.zeroize();
                return Err(VaultError::InvalidTotp);
            };
            let Some(code) = totp_code else {
                root_key.zeroize();
                return Err(VaultError::InvalidTotp);
            };
            let secret = crypto::decrypt(&enc_key, boxed).map_err(|_| {
                root_key.zeroize();
                VaultError::InvalidTotp
            })?;
            let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
            if !totp::validate(&secret, code, now) {
                root_key.zeroize();
                return Err(VaultError::InvalidTotp);
            }
            Some(secret)
        } else {
            None
        };

        self.state = State::Unsealed {
            root_key,
            totp_secret,
            unsealed_at: Utc::now(),
        };
        Ok(())
    }

    /// Returns the unsealed root key, or `Sealed` if not currently unsealed.
    pub fn root_key(&self) -> Result<&[u8; 32], VaultError> {
        match &self.state {
            State::Unsealed { root_key, .. } => Ok(root_key),
            State::Sealed => Err(VaultError::Sealed),
        }
    }

    #[must_use]
    pub fn unsealed_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            State::Unsealed { unsealed_at, .. } => Some(*unsealed_at),
            State::Sealed => None,
        }
    }

    /// Scrubs the root key and TOTP secret from memory and marks the vault
    /// sealed. Subsequent [`Vault::root_key`] calls return `Sealed`.
    pub fn seal(&mut self) {
        if let State::Unsealed {
            mut root_key,
            totp_secret,
            ..
        } = std::mem::replace(&mut self.state, State::Sealed)
        {
            root_key.zeroize();
            if let Some(mut secret) = totp_secret {
                secret.zeroize();
            }
        }
    }

    /// True when `auto_seal_minutes > 0` and more than that many minutes
    /// have passed since unsealing. An external ticker is expected to call
    /// this periodically and seal.
    #[must_use]
    pub fn should_auto_seal(&self, now: DateTime<Utc>) -> bool {
        let State::Unsealed { unsealed_at, .. } = &self.state else {
            return false;
        };
        self.sealed.auto_seal_minutes > 0
            && now.signed_duration_since(*unsealed_at).num_minutes() > i64::try_from(self.sealed.auto_seal_minutes).unwrap_or(i64::MAX)
    }

    /// Reconstructs `root_key` deterministically from a recovery phrase
    /// (either the 32-word hex literal display format or a 24-word BIP39
    /// mnemonic), re-encrypts it under `new_passphrase` with a fresh salt,
    /// and persists the result. The TOTP second factor, if any, cannot be
    /// recovered from the seed phrase alone and is dropped.
    pub fn recover_from_seed(
        path: impl Into<PathBuf>,
        phrase: &str,
        new_passphrase: &SecretString,
        auto_seal_minutes: u64,
    ) -> Result<(Self, String), VaultError> {
        let path = path.into();
        let root_key = parse_seed(phrase)?;
        let seed_phrase = seed_words(&root_key);

        let salt = crypto::random_salt16();
        let enc_key = crypto::derive_passphrase_key(new_passphrase, &salt)
            .map_err(|_| VaultError::InvalidSeed)?;
        let root_key_box =
            crypto::encrypt(&enc_key, &root_key).map_err(|_| VaultError::InvalidSeed)?;

        let sealed = SealedVault {
            salt_b64: base64::engine::general_purpose::STANDARD.encode(salt),
            root_key_box,
            totp_enabled: false,
            totp_secret_box: None,
            auto_seal_minutes,
            seed_hash: seed_hash_of(&seed_phrase),
        };

        let vault = Self {
            path,
            sealed,
            state: State::Unsealed {
                root_key,
                totp_secret: None,
                unsealed_at: Utc::now(),
            },
        };
        vault.persist()?;
        Ok((vault, seed_phrase))
    }
}
