//! Capability Token / Macaroon: an HMAC-chained bearer token supporting
//! attenuation-only caveats.

use crate::errors::MacaroonError;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq as _;

type HmacSha256 = Hmac<Sha256>;

/// An HMAC-chained bearer token. Only the root-key holder can mint one
/// (`new`); anyone holding a macaroon can attenuate it further (`add_caveat`)
/// without the root key, since attenuation only narrows what it authorizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macaroon {
    pub location: String,
    pub id: String,
    pub caveats: Vec<String>,
    signature: [u8; 32],
}

fn hmac_once(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).unwrap_or_else(|_| {
        // HMAC-SHA256 accepts keys of any length; this branch is unreachable.
        <HmacSha256 as Mac>::new_from_slice(&[0_u8; 32])
            .expect("zero-length fallback key is always valid")
    });
    mac.update(message);
    let out = mac.finalize().into_bytes();
    let mut sig = [0_u8; 32];
    sig.copy_from_slice(&out);
    sig
}

impl Macaroon {
    /// Mints a fresh macaroon: `signature = HMAC(root_key, id)`.
    #[must_use]
    pub fn new(location: impl Into<String>, root_key: &[u8], id: impl Into<String>) -> Self {
        let id = id.into();
        let signature = hmac_once(root_key, id.as_bytes());
        Self {
            location: location.into(),
            id,
            caveats: Vec::new(),
            signature,
        }
    }

    /// Attenuates the macaroon with a new first-party caveat, chaining the
    /// signature over it: `signature = HMAC(previous_signature, predicate)`.
    /// Does not require the root key.
    pub fn add_caveat(&mut self, predicate: impl Into<String>) {
        let predicate = predicate.into();
        self.signature = hmac_once(&self.signature, predicate.as_bytes());
        self.caveats.push(predicate);
    }

    /// Re-derives the HMAC chain from `(root_key, id, caveats)` and compares
    /// it to the stored signature in constant time, then runs `check` against
    /// every caveat. Unknown caveat keys must be rejected by `check`
    /// (fail-closed); this function does not special-case them.
    pub fn verify<F>(&self, root_key: &[u8], mut check: F) -> Result<(), MacaroonError>
    where
        F: FnMut(&str) -> Result<(), String>,
    {
        let mut expected = hmac_once(root_key, self.id.as_bytes());
        for caveat in &self.caveats {
            expected = hmac_once(&expected, caveat.as_bytes());
        }
        if expected.ct_eq(&self.signature).unwrap_u8() != 1 {
            return Err(MacaroonError::InvalidSignature);
        }
        for caveat in &self.caveats {
            check(caveat).map_err(MacaroonError::CaveatFailed)?;
        }
        Ok(())
    }

    /// JSON for structure, wrapped in URL-safe base64 for transport.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(s: &str) -> Result<Self, MacaroonError> {
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(s.trim())
            .map_err(|e| MacaroonError::CaveatFailed(format!("base64: {e}")))?;
        serde_json::from_slice(&raw).map_err(|e| MacaroonError::CaveatFailed(format!("json: {e}")))
    }
}

/// Parses a `key=value` caveat predicate, as produced by [`caveat`].
#[must_use]
pub fn parse_predicate(predicate: &str) -> Option<(&str, &str)> {
    predicate.split_once('=')
}

/// Builds a `key=value` caveat string.
#[must_use]
pub fn caveat(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

/// Context against which the default predicate set is checked.
#[derive(Debug, Default)]
pub struct CaveatContext<'a> {
    pub service: Option<&'a str>,
    pub group: Option<&'a str>,
    pub action: Option<&'a str>,
    /// Current usage count, compared against `peers_max`.
    pub used: u64,
    pub peers: Option<&'a [String]>,
    pub now: Option<DateTime<Utc>>,
    pub network: Option<&'a str>,
}

/// Checks one caveat against the default recognized predicate set. Unknown
/// keys fail closed. An empty value means "skip this check".
pub fn check_default_caveat(predicate: &str, ctx: &CaveatContext<'_>) -> Result<(), String> {
    let Some((key, value)) = parse_predicate(predicate) else {
        return Err(format!("malformed caveat: {predicate}"));
    };
    if value.is_empty() {
        return match key {
            "service" | "group" | "action" | "peers_max" | "delegate" | "expires" | "network" => {
                Ok(())
            }
            _ => Err(format!("unknown caveat key: {key}")),
        };
    }
    match key {
        "service" => match ctx.service {
            Some(v) if v == value => Ok(()),
            Some(v) => Err(format!("service mismatch: wanted {value}, have {v}")),
            None => Err("service not present in context".to_owned()),
        },
        "group" => match ctx.group {
            Some(v) if v == value => Ok(()),
            Some(v) => Err(format!("group mismatch: wanted {value}, have {v}")),
            None => Err("group not present in context".to_owned()),
        },
        "action" => match ctx.action {
            Some(v) if v == value => Ok(()),
            Some(v) => Err(format!("action mismatch: wanted {value}, have {v}")),
            None => Err("action not present in context".to_owned()),
        },
        "peers_max" => {
            let max: u64 = value
                .parse()
                .map_err(|_| format!("non-numeric peers_max: {value}"))?;
            if ctx.used >= max {
                Err(format!("peers_max exceeded: used={}, max={max}", ctx.used))
            } else {
                Ok(())
            }
        }
        "delegate" => match ctx.peers {
            Some(peers) if peers.iter().any(|p| p == value) => Ok(()),
            _ => Err(format!("delegate not authorized: {value}")),
        },
        "expires" => {
            let expires = DateTime::parse_from_rfc3339(value)
                .map_err(|e| format!("bad expires timestamp: {e}"))?
                .with_timezone(&Utc);
            let now = ctx.now.unwrap_or_else(Utc::now);
            if now > expires {
                Err(format!("expired at {value}"))
            } else {
                Ok(())
            }
        }
        "network" => match ctx.network {
            Some(v) if v == value => Ok(()),
            Some(v) => Err(format!("network mismatch: wanted {value}, have {v}")),
            None => Err("network not present in context".to_owned()),
        },
        other => Err(format!("unknown caveat key: {other}")),
    }
}
