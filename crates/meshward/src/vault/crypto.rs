//! Cryptographic primitives backing the vault: passphrase
//! stretching via Argon2id, and XChaCha20-Poly1305 sealed secret boxes.

use argon2::{
    password_hash::{PasswordHasher as _, SaltString},
    Algorithm, Argon2, Params, Version,
};
use base64::Engine as _;
use chacha20poly1305::{
    aead::{Aead as _, KeyInit as _},
    XChaCha20Poly1305, XNonce,
};
use eyre::Context as _;
use hkdf::Hkdf;
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// A sealed secret: version tag, random nonce, and ciphertext, each base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoBox {
    pub v: u8,
    pub nonce_b64: String,
    pub ct_b64: String,
}

pub fn fill_random(buf: &mut [u8]) {
    let mut rng = rand::rng();
    rng.fill_bytes(buf);
}

pub fn random_salt16() -> [u8; 16] {
    let mut s = [0_u8; 16];
    fill_random(&mut s);
    s
}

/// Stretches a passphrase into a 32-byte key via Argon2id with the
/// parameters this module fixes: `time=3, memory=64MiB, parallelism=4,
/// length=32`. Frozen here rather than left at the crate default so a future
/// `argon2` upgrade can't silently change what an existing vault needs to
/// unseal.
pub fn derive_passphrase_key(
    passphrase: &SecretString,
    salt16: &[u8; 16],
) -> eyre::Result<[u8; 32]> {
    let params =
        Params::new(64 * 1024, 3, 4, Some(32)).map_err(|e| eyre::eyre!("argon2 params: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let salt = SaltString::encode_b64(salt16).map_err(|e| eyre::eyre!("encode salt: {e}"))?;
    let mut out = [0_u8; 32];

    let hash = argon2
        .hash_password(passphrase.expose_secret().as_bytes(), &salt)
        .map_err(|e| eyre::eyre!("argon2 hash: {e}"))?;
    let bytes = hash
        .hash
        .ok_or_else(|| eyre::eyre!("argon2 missing hash"))?;
    let raw = bytes.as_bytes();
    let Some(prefix) = raw.get(..32) else {
        eyre::bail!("argon2 hash too short");
    };
    out.copy_from_slice(prefix);
    Ok(out)
}

/// Derives a purpose-scoped 32-byte subkey from a 32-byte master key via
/// HKDF-SHA256, so distinct uses of the same root key (e.g. PAKE framing vs.
/// macaroon signing) never share key material.
pub fn derive_subkey(master: &[u8; 32], context: &str, purpose: &str) -> eyre::Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, master);
    let info = format!("meshward:{context}:{purpose}");
    let mut out = [0_u8; 32];
    hk.expand(info.as_bytes(), &mut out)
        .map_err(|e| eyre::eyre!("hkdf expand: {e}"))?;
    Ok(out)
}

/// Encrypts with XChaCha20-Poly1305 under a fresh random 24-byte nonce.
pub fn encrypt(key32: &[u8; 32], plaintext: &[u8]) -> eyre::Result<CryptoBox> {
    let cipher = XChaCha20Poly1305::new_from_slice(key32).context("xchacha20poly1305 init")?;
    let mut nonce = [0_u8; 24];
    fill_random(&mut nonce);
    let ct = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| eyre::eyre!("xchacha20poly1305 encrypt: {e}"))?;

    Ok(CryptoBox {
        v: 1,
        nonce_b64: base64::engine::general_purpose::STANDARD.encode(nonce),
        ct_b64: base64::engine::general_purpose::STANDARD.encode(ct),
    })
}

/// Decrypts a [`CryptoBox`]. A mismatched key and a tampered ciphertext are
/// indistinguishable: both surface as the same AEAD failure, so callers that
/// need a uniform "wrong passphrase" error get it for
/// free.
pub fn decrypt(key32: &[u8; 32], b: &CryptoBox) -> eyre::Result<Vec<u8>> {
    if b.v != 1 {
        eyre::bail!("unsupported CryptoBox version: {}", b.v);
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key32).context("xchacha20poly1305 init")?;
    let nonce = base64::engine::general_purpose::STANDARD
        .decode(&b.nonce_b64)
        .context("decode nonce")?;
    if nonce.len() != 24 {
        eyre::bail!("invalid nonce length");
    }
    let ct = base64::engine::general_purpose::STANDARD
        .decode(&b.ct_b64)
        .context("decode ciphertext")?;

    let pt = cipher
        .decrypt(XNonce::from_slice(&nonce), ct.as_ref())
        .map_err(|e| eyre::eyre!("xchacha20poly1305 decrypt: {e}"))?;
    Ok(pt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::ContextCompat as _;

    #[test]
    fn roundtrip() -> eyre::Result<()> {
        let key = [7_u8; 32];
        let pt = b"test plaintext".to_vec();
        let boxv = encrypt(&key, &pt).context("encrypt")?;
        let out = decrypt(&key, &boxv).context("decrypt")?;
        assert_eq!(out, pt);
        Ok(())
    }

    #[test]
    fn wrong_key_fails() -> eyre::Result<()> {
        let key = [7_u8; 32];
        let pt = b"test plaintext".to_vec();
        let boxv = encrypt(&key, &pt).context("encrypt")?;
        let wrong = [8_u8; 32];
        let err = decrypt(&wrong, &boxv).err().context("wrong key must fail")?;
        assert!(err.to_string().contains("decrypt"));
        Ok(())
    }

    #[test]
    fn derive_passphrase_key_is_deterministic_for_same_inputs() -> eyre::Result<()> {
        let passphrase = SecretString::new("correct horse battery staple".to_owned().into());
        let salt = [1_u8; 16];
        let k1 = derive_passphrase_key(&passphrase, &salt).context("k1")?;
        let k2 = derive_passphrase_key(&passphrase, &salt).context("k2")?;
        assert_eq!(k1, k2);
        Ok(())
    }

    #[test]
    fn derive_subkey_differs_by_purpose() -> eyre::Result<()> {
        let master = [3_u8; 32];
        let a = derive_subkey(&master, "vault", "totp")?;
        let b = derive_subkey(&master, "vault", "pake")?;
        assert_ne!(a, b);
        Ok(())
    }
}
