//! RFC 6238 TOTP code validation. Code *generation* is an assumed external
//! primitive; this module only validates operator-supplied
//! codes against a shared secret the vault holds (C3).

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

const STEP_SECS: u64 = 30;
const DIGITS: u32 = 6;

fn hotp(secret: &[u8], counter: u64) -> u32 {
    let Ok(mut mac) = <HmacSha1 as Mac>::new_from_slice(secret) else {
        return 0;
    };
    mac.update(&counter.to_be_bytes());
    let hash = mac.finalize().into_bytes();
    let Some(&last) = hash.last() else {
        return 0;
    };
    let offset = usize::from(last & 0x0f);
    let Some(window) = hash.get(offset..offset + 4) else {
        return 0;
    };
    let mut bytes = [0_u8; 4];
    bytes.copy_from_slice(window);
    let code = u32::from_be_bytes(bytes) & 0x7fff_ffff;
    code % 10_u32.pow(DIGITS)
}

/// Generates the current code for `secret` at time `unix_secs`, for building
/// operator-facing TOTP URIs and for tests.
#[must_use]
pub fn code_at(secret: &[u8], unix_secs: u64) -> u32 {
    hotp(secret, unix_secs / STEP_SECS)
}

/// Validates a submitted code against `secret` at time `unix_secs`, allowing
/// the adjacent time step on either side.
#[must_use]
pub fn validate(secret: &[u8], submitted: &str, unix_secs: u64) -> bool {
    let Ok(submitted_code) = submitted.trim().parse::<u32>() else {
        return false;
    };
    let counter = unix_secs / STEP_SECS;
    for step in [counter.saturating_sub(1), counter, counter + 1] {
        if hotp(secret, step) == submitted_code {
            return true;
        }
    }
    false
}

/// Builds an `otpauth://totp/...` URI for enrollment in an authenticator app.
#[must_use]
pub fn otpauth_uri(secret: &[u8], issuer: &str, account: &str) -> String {
    use base32::Alphabet;
    let encoded = base32::encode(Alphabet::Rfc4648 { padding: false }, secret);
    format!(
        "otpauth://totp/{issuer}:{account}?secret={encoded}&issuer={issuer}&digits={DIGITS}&period={STEP_SECS}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_exact_step() {
        let secret = b"0123456789abcdef0123";
        let now = 1_700_000_000_u64;
        let code = code_at(secret, now);
        assert!(validate(secret, &format!("{code:06}"), now));
    }

    #[test]
    fn validate_accepts_adjacent_step_skew() {
        let secret = b"0123456789abcdef0123";
        let now = 1_700_000_000_u64;
        let next_step_time = now + STEP_SECS;
        let code = code_at(secret, now);
        assert!(validate(secret, &format!("{code:06}"), next_step_time));
    }

    #[test]
    fn validate_rejects_far_future_step() {
        let secret = b"0123456789abcdef0123";
        let now = 1_700_000_000_u64;
        let code = code_at(secret, now);
        assert!(!validate(secret, &format!("{code:06}"), now + 10 * STEP_SECS));
    }

    #[test]
    fn validate_rejects_garbage_input() {
        let secret = b"0123456789abcdef0123";
        assert!(!validate(secret, "not-a-number", 0));
    }
}
