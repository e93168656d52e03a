//! Pairing Token Store: in-memory groups of one-time pairing tokens,
//! with atomic "validate-and-use".

use crate::errors::{PairingFailed, PairingFailureReason};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::Rng as _;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use subtle::ConstantTimeEq as _;

type HmacSha256 = Hmac<Sha256>;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct PairingSlot {
    token_hash: [u8; 32],
    pub peer_id: Option<String>,
    pub name: Option<String>,
    pub used_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub hmac_proof: Option<[u8; 32]>,
}

#[derive(Debug, Clone)]
pub struct PairingGroup {
    pub group_id: String,
    pub namespace: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub peer_ttl: Option<Duration>,
    pub slots: Vec<PairingSlot>,
    revoked: bool,
}

impl PairingGroup {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|s| s.used_at.is_some())
    }

    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now <= self.expires_at
    }

    /// Peer ids already in this group, excluding `exclude_index`.
    #[must_use]
    pub fn peers_excluding(&self, exclude_index: usize) -> Vec<String> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, s)| *i != exclude_index)
            .filter_map(|(_, s)| s.peer_id.clone())
            .collect()
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut result = [0_u8; 32];
    result.copy_from_slice(&out);
    result
}

fn hmac_proof(token: &[u8], group_id: &str) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(token).unwrap_or_else(|_| {
        <HmacSha256 as Mac>::new_from_slice(&[0_u8; 32]).expect("zero-length fallback key is always valid")
    });
    mac.update(group_id.as_bytes());
    let out = mac.finalize().into_bytes();
    let mut result = [0_u8; 32];
    result.copy_from_slice(&out);
    result
}

/// A group's worth of one-time tokens, keyed by `group_id`.
#[derive(Default)]
pub struct PairingTokenStore {
    groups: Mutex<HashMap<String, PairingGroup>>,
}

impl PairingTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn random_group_id() -> String {
        let mut bytes = [0_u8; 4];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Creates a group of `count` one-time tokens. Returns `(group_id, raw
    /// tokens)`; the raw tokens are never retained — only their hashes.
    pub fn create_group(
        &self,
        count: usize,
        ttl: Duration,
        namespace: Option<String>,
        peer_ttl: Option<Duration>,
    ) -> (String, Vec<[u8; 16]>) {
        let now = Utc::now();
        let group_id = Self::random_group_id();

        let mut raw_tokens = Vec::with_capacity(count);
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let mut token = [0_u8; 16];
            rand::rng().fill_bytes(&mut token);
            slots.push(PairingSlot {
                token_hash: sha256(&token),
                peer_id: None,
                name: None,
                used_at: None,
                attempts: 0,
                hmac_proof: None,
            });
            raw_tokens.push(token);
        }

        let group = PairingGroup {
            group_id: group_id.clone(),
            namespace,
            created_at: now,
            expires_at: now + ttl,
            peer_ttl,
            slots,
            revoked: false,
        };

        let mut guard = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.insert(group_id.clone(), group);
        (group_id, raw_tokens)
    }

    /// Atomically validates a presented token against a group's slots and
    /// marks the matching slot used. Every failure path returns the same
    /// opaque [`PairingFailed`] to the caller; `reason` is for internal
    /// telemetry only.
    pub fn validate_and_use(
        &self,
        group_id: &str,
        token: &[u8; 16],
        peer_id: impl Into<String>,
        name: Option<String>,
    ) -> Result<(usize, [u8; 32]), PairingFailed> {
        let mut guard = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let group = guard
            .get_mut(group_id)
            .ok_or(PairingFailed::new(PairingFailureReason::GroupNotFound))?;

        let now = Utc::now();
        if now > group.expires_at || group.revoked {
            return Err(PairingFailed::new(PairingFailureReason::GroupExpired));
        }

        let presented_hash = sha256(token);
        let slot_index = group
            .slots
            .iter()
            .position(|s| s.token_hash.ct_eq(&presented_hash).unwrap_u8() == 1);

        let Some(slot_index) = slot_index else {
            return Err(PairingFailed::new(PairingFailureReason::NoMatchingToken));
        };

        let peer_id = peer_id.into();
        let group_id_owned = group.group_id.clone();
        let Some(slot) = group.slots.get_mut(slot_index) else {
            return Err(PairingFailed::new(PairingFailureReason::NoMatchingToken));
        };

        if slot.used_at.is_some() {
            slot.attempts += 1;
            if slot.attempts >= MAX_ATTEMPTS {
                return Err(PairingFailed::new(PairingFailureReason::SlotBurned));
            }
            return Err(PairingFailed::new(PairingFailureReason::SlotAlreadyUsed));
        }
        if slot.attempts >= MAX_ATTEMPTS {
            return Err(PairingFailed::new(PairingFailureReason::SlotBurned));
        }

        slot.peer_id = Some(peer_id);
        slot.name = name;
        slot.used_at = Some(now);
        let proof = hmac_proof(token, &group_id_owned);
        slot.hmac_proof = Some(proof);

        Ok((slot_index, proof))
    }

    /// As [`Self::validate_and_use`], but locates the owning group by
    /// scanning for a matching token hash first — the wire protocol (spec
    /// §4.8) presents only the raw token, never the group id.
    pub fn validate_and_use_by_token(
        &self,
        token: &[u8; 16],
        peer_id: impl Into<String>,
        name: Option<String>,
    ) -> Result<(String, usize, [u8; 32]), PairingFailed> {
        let presented_hash = sha256(token);
        let group_id = {
            let guard = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard
                .values()
                .find(|g| {
                    g.slots
                        .iter()
                        .any(|s| s.token_hash.ct_eq(&presented_hash).unwrap_u8() == 1)
                })
                .map(|g| g.group_id.clone())
        };
        let Some(group_id) = group_id else {
            return Err(PairingFailed::new(PairingFailureReason::NoMatchingToken));
        };
        let (slot_index, proof) = self.validate_and_use(&group_id, token, peer_id, name)?;
        Ok((group_id, slot_index, proof))
    }

    pub fn get(&self, group_id: &str) -> Option<PairingGroup> {
        let guard = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(group_id).cloned()
    }

    pub fn peers_in_group(&self, group_id: &str, exclude_index: usize) -> Vec<String> {
        let guard = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard
            .get(group_id)
            .map(|g| g.peers_excluding(exclude_index))
            .unwrap_or_default()
    }

    pub fn is_group_complete(&self, group_id: &str) -> bool {
        let guard = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(group_id).is_some_and(PairingGroup::is_complete)
    }

    pub fn list(&self) -> Vec<PairingGroup> {
        let guard = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        let guard = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        guard.values().filter(|g| g.is_active(now)).count()
    }

    pub fn revoke(&self, group_id: &str) -> bool {
        let mut guard = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(group) = guard.get_mut(group_id) {
            group.revoked = true;
            true
        } else {
            false
        }
    }

    pub fn clean_expired(&self, older_than: DateTime<Utc>) {
        let mut guard = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        guard.retain(|_, g| g.is_active(now) || g.created_at >= older_than);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_and_use_succeeds_once() {
        let store = PairingTokenStore::new();
        let (group_id, tokens) = store.create_group(1, Duration::minutes(5), None, None);
        store.validate_and_use(&group_id, &tokens[0], "peer-a", None).unwrap();
        let err = store
            .validate_and_use(&group_id, &tokens[0], "peer-a-retry", None)
            .unwrap_err();
        assert_eq!(err.reason, PairingFailureReason::SlotAlreadyUsed);
    }

    #[test]
    fn burns_after_three_failed_attempts() {
        let store = PairingTokenStore::new();
        let (group_id, tokens) = store.create_group(1, Duration::minutes(5), None, None);
        store.validate_and_use(&group_id, &tokens[0], "peer-a", None).unwrap();
        for _ in 0..2 {
            let _ = store.validate_and_use(&group_id, &tokens[0], "peer-b", None);
        }
        let err = store
            .validate_and_use(&group_id, &tokens[0], "peer-c", None)
            .unwrap_err();
        assert_eq!(err.reason, PairingFailureReason::SlotBurned);
    }

    #[test]
    fn expired_group_rejects_valid_token() {
        let store = PairingTokenStore::new();
        let (group_id, tokens) = store.create_group(1, Duration::seconds(-1), None, None);
        let err = store
            .validate_and_use(&group_id, &tokens[0], "peer-a", None)
            .unwrap_err();
        assert_eq!(err.reason, PairingFailureReason::GroupExpired);
    }

    #[test]
    fn wrong_token_does_not_match() {
        let store = PairingTokenStore::new();
        let (group_id, _tokens) = store.create_group(1, Duration::minutes(5), None, None);
        let err = store
            .validate_and_use(&group_id, &[0xff_u8; 16], "peer-a", None)
            .unwrap_err();
        assert_eq!(err.reason, PairingFailureReason::NoMatchingToken);
    }

    #[tokio::test]
    async fn exactly_one_concurrent_validate_succeeds() {
        use std::sync::Arc;
        let store = Arc::new(PairingTokenStore::new());
        let (group_id, tokens) = store.create_group(1, Duration::minutes(5), None, None);
        let token = tokens[0];

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let group_id = group_id.clone();
            handles.push(tokio::spawn(async move {
                store.validate_and_use(&group_id, &token, format!("peer-{i}"), None).is_ok()
            }));
        }

        let mut successes = 0;
        for h in handles {
            if h.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[test]
    fn validate_by_token_locates_owning_group() {
        let store = PairingTokenStore::new();
        let (other_group, other_tokens) = store.create_group(1, Duration::minutes(5), None, None);
        let (group_id, tokens) = store.create_group(1, Duration::minutes(5), None, None);
        let (found_group, _idx, _proof) = store
            .validate_and_use_by_token(&tokens[0], "peer-a", None)
            .unwrap();
        assert_eq!(found_group, group_id);
        let (found_other, _idx, _proof) = store
            .validate_and_use_by_token(&other_tokens[0], "peer-b", None)
            .unwrap();
        assert_eq!(found_other, other_group);
    }

    #[test]
    fn is_group_complete_tracks_all_slots() {
        let store = PairingTokenStore::new();
        let (group_id, tokens) = store.create_group(2, Duration::minutes(5), None, None);
        assert!(!store.is_group_complete(&group_id));
        store.validate_and_use(&group_id, &tokens[0], "peer-a", None).unwrap();
        assert!(!store.is_group_complete(&group_id));
        store.validate_and_use(&group_id, &tokens[1], "peer-b", None).unwrap();
        assert!(store.is_group_complete(&group_id));
    }
}
