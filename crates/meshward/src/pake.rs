//! PAKE Session: mutual authentication of inviter/joiner over an
//! untrusted stream using a shared 8-byte token.

use crate::errors::PakeError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::Rng as _;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize as _;

const HANDSHAKE_VERSION: u8 = 1;
const HKDF_INFO: &[u8] = b"meshward-invite-v1";
const MAX_FRAME_LEN: usize = 4096;
const NONCE_LEN: usize = 24;

/// Role label used in key-confirmation HMACs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Inviter,
    Joiner,
}

impl Role {
    const fn label(self) -> &'static [u8] {
        match self {
            Self::Inviter => b"inviter",
            Self::Joiner => b"joiner",
        }
    }
}

enum SessionState {
    AwaitingHandshake { ephemeral_secret: EphemeralSecret },
    Complete { key: [u8; 32] },
}

/// One side of a PAKE handshake. Holds its ephemeral secret until the
/// handshake completes, then only the derived session key.
pub struct PakeSession {
    role: Role,
    token: [u8; 8],
    state: SessionState,
}

impl PakeSession {
    /// Starts a handshake, returning the session plus the wire bytes to send:
    /// `[0x01 version][32-byte ephemeral public key]`.
    #[must_use]
    pub fn start(role: Role, token: [u8; 8]) -> (Self, Vec<u8>) {
        let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&ephemeral_secret);

        let mut wire = Vec::with_capacity(1 + 32);
        wire.push(HANDSHAKE_VERSION);
        wire.extend_from_slice(public.as_bytes());

        (
            Self {
                role,
                token,
                state: SessionState::AwaitingHandshake { ephemeral_secret },
            },
            wire,
        )
    }

    /// Consumes the peer's handshake message (`[version][32-byte public
    /// key]`) and derives the session key. Drops the ephemeral secret
    /// afterward (best-effort zeroing).
    pub fn complete(&mut self, peer_message: &[u8]) -> Result<(), PakeError> {
        let SessionState::AwaitingHandshake { .. } = &self.state else {
            return Ok(());
        };

        let &[version, ref rest @ ..] = peer_message else {
            return Err(PakeError::EmptyFrame);
        };
        if version != HANDSHAKE_VERSION {
            return Err(PakeError::UnsupportedVersion(version));
        }
        if rest.len() != 32 {
            return Err(PakeError::Malformed("ephemeral public key must be 32 bytes".into()));
        }
        let mut their_pk_bytes = [0_u8; 32];
        their_pk_bytes.copy_from_slice(rest);
        let their_pk = PublicKey::from(their_pk_bytes);

        let SessionState::AwaitingHandshake { ephemeral_secret } =
            std::mem::replace(&mut self.state, SessionState::Complete { key: [0_u8; 32] })
        else {
            unreachable!("checked above")
        };

        let shared = ephemeral_secret.diffie_hellman(&their_pk);
        drop(ephemeral_secret);

        let mut salt = Vec::with_capacity(32 + self.token.len());
        salt.extend_from_slice(shared.as_bytes());
        salt.extend_from_slice(&self.token);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut key = [0_u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|_| PakeError::DecryptionFailed)?;
        salt.zeroize();

        self.state = SessionState::Complete { key };
        Ok(())
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.state, SessionState::Complete { .. })
    }

    fn key(&self) -> Result<&[u8; 32], PakeError> {
        match &self.state {
            SessionState::Complete { key } => Ok(key),
            SessionState::AwaitingHandshake { .. } => Err(PakeError::NotComplete),
        }
    }

    /// Encrypts a plaintext frame body: `[24-byte nonce][ciphertext]`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, PakeError> {
        let key = self.key()?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        let mut nonce_bytes = [0_u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| PakeError::DecryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a frame body produced by [`Self::encrypt`].
    pub fn decrypt(&self, framed: &[u8]) -> Result<Vec<u8>, PakeError> {
        let key = self.key()?;
        if framed.len() < NONCE_LEN {
            return Err(PakeError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        let nonce = XNonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| PakeError::DecryptionFailed)
    }

    /// Key-confirmation MAC for this side's role.
    pub fn confirmation_mac(&self) -> Result<[u8; 32], PakeError> {
        let key = self.key()?;
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| PakeError::DecryptionFailed)?;
        mac.update(self.role.label());
        let out = mac.finalize().into_bytes();
        let mut result = [0_u8; 32];
        result.copy_from_slice(&out);
        Ok(result)
    }
}

/// Wraps a length-prefixed frame for the wire: `[2 BE length][body]`.
pub fn frame(body: &[u8]) -> Result<Vec<u8>, PakeError> {
    if body.is_empty() {
        return Err(PakeError::EmptyFrame);
    }
    if body.len() > MAX_FRAME_LEN {
        return Err(PakeError::FrameTooLarge(body.len()));
    }
    #[allow(clippy::cast_possible_truncation)]
    let len = body.len() as u16;
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Validates a received frame length prefix against this protocol's bounds.
pub fn validate_frame_len(len: usize) -> Result<(), PakeError> {
    if len == 0 {
        return Err(PakeError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(PakeError::FrameTooLarge(len));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_tokens_derive_same_key_and_exchange_frames() {
        let token = [9_u8; 8];
        let (mut inviter, inviter_msg) = PakeSession::start(Role::Inviter, token);
        let (mut joiner, joiner_msg) = PakeSession::start(Role::Joiner, token);

        inviter.complete(&joiner_msg).unwrap();
        joiner.complete(&inviter_msg).unwrap();

        assert_ne!(inviter.confirmation_mac().unwrap(), joiner.confirmation_mac().unwrap());

        let framed = inviter.encrypt(b"hello joiner").unwrap();
        let plaintext = joiner.decrypt(&framed).unwrap();
        assert_eq!(plaintext, b"hello joiner");
    }

    #[test]
    fn mismatched_tokens_fail_to_decrypt() {
        let (mut inviter, inviter_msg) = PakeSession::start(Role::Inviter, [1_u8; 8]);
        let (mut joiner, joiner_msg) = PakeSession::start(Role::Joiner, [2_u8; 8]);

        inviter.complete(&joiner_msg).unwrap();
        joiner.complete(&inviter_msg).unwrap();

        let framed = inviter.encrypt(b"secret").unwrap();
        assert!(joiner.decrypt(&framed).is_err());
    }

    #[test]
    fn encrypt_before_complete_refuses() {
        let (session, _msg) = PakeSession::start(Role::Inviter, [0_u8; 8]);
        assert!(matches!(session.encrypt(b"x"), Err(PakeError::NotComplete)));
    }

    #[test]
    fn frame_rejects_empty_and_oversize() {
        assert!(matches!(frame(&[]), Err(PakeError::EmptyFrame)));
        let big = vec![0_u8; MAX_FRAME_LEN + 1];
        assert!(matches!(frame(&big), Err(PakeError::FrameTooLarge(_))));
    }

    #[test]
    fn validate_frame_len_matches_frame_bounds() {
        assert!(validate_frame_len(0).is_err());
        assert!(validate_frame_len(MAX_FRAME_LEN + 1).is_err());
        assert!(validate_frame_len(10).is_ok());
    }
}
