//! Invite Deposit Store: the in-memory lifecycle of macaroon-backed
//! asynchronous invites.

use crate::errors::DepositError;
use crate::macaroon::Macaroon;
use chrono::{DateTime, Duration, Utc};
use rand::Rng as _;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositStatus {
    Pending,
    Consumed,
    Revoked,
    Expired,
}

#[derive(Debug, Clone)]
pub struct InviteDeposit {
    pub id: String,
    pub macaroon: Macaroon,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: DepositStatus,
    pub consumed_by: Option<String>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl InviteDeposit {
    fn promote_if_expired(&mut self, now: DateTime<Utc>) {
        if self.status == DepositStatus::Pending {
            if let Some(expires_at) = self.expires_at {
                if now > expires_at {
                    self.status = DepositStatus::Expired;
                }
            }
        }
    }
}

/// All operations serialize through a single mutex, including reads,
/// because `get`/`list` auto-promote past-deadline deposits to `Expired`.
#[derive(Default)]
pub struct InviteDepositStore {
    deposits: Mutex<HashMap<String, InviteDeposit>>,
}

impl InviteDepositStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn random_id() -> String {
        let mut bytes = [0_u8; 8];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    pub fn create(&self, macaroon: Macaroon, created_by: impl Into<String>, ttl: Option<Duration>) -> String {
        let now = Utc::now();
        let id = Self::random_id();
        let deposit = InviteDeposit {
            id: id.clone(),
            macaroon,
            created_by: created_by.into(),
            created_at: now,
            expires_at: ttl.map(|d| now + d),
            status: DepositStatus::Pending,
            consumed_by: None,
            consumed_at: None,
        };
        let mut guard = self.deposits.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.insert(id.clone(), deposit);
        id
    }

    pub fn get(&self, id: &str) -> Option<InviteDeposit> {
        let mut guard = self.deposits.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        let deposit = guard.get_mut(id)?;
        deposit.promote_if_expired(now);
        Some(deposit.clone())
    }

    pub fn list(&self) -> Vec<InviteDeposit> {
        let mut guard = self.deposits.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        for deposit in guard.values_mut() {
            deposit.promote_if_expired(now);
        }
        guard.values().cloned().collect()
    }

    /// Consumes a pending deposit, returning its macaroon. Auto-promotes a
    /// past-deadline deposit to `Expired` first, so a joiner racing the
    /// deadline sees `Expired` rather than a stale success.
    pub fn consume(&self, id: &str, peer_id: &str) -> Result<Macaroon, DepositError> {
        let mut guard = self.deposits.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        let deposit = guard.get_mut(id).ok_or(DepositError::NotFound)?;
        deposit.promote_if_expired(now);

        match deposit.status {
            DepositStatus::Consumed => Err(DepositError::Consumed),
            DepositStatus::Revoked => Err(DepositError::Revoked),
            DepositStatus::Expired => Err(DepositError::Expired),
            DepositStatus::Pending => {
                deposit.status = DepositStatus::Consumed;
                deposit.consumed_by = Some(peer_id.to_owned());
                deposit.consumed_at = Some(now);
                Ok(deposit.macaroon.clone())
            }
        }
    }

    pub fn revoke(&self, id: &str) -> Result<(), DepositError> {
        let mut guard = self.deposits.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let deposit = guard.get_mut(id).ok_or(DepositError::NotFound)?;
        if deposit.status == DepositStatus::Consumed {
            return Err(DepositError::Consumed);
        }
        deposit.status = DepositStatus::Revoked;
        Ok(())
    }

    /// Appends a caveat to a pending deposit's macaroon. Attenuation-only,
    /// so this never needs the root key.
    pub fn add_caveat(&self, id: &str, predicate: impl Into<String>) -> Result<(), DepositError> {
        let mut guard = self.deposits.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        let deposit = guard.get_mut(id).ok_or(DepositError::NotFound)?;
        deposit.promote_if_expired(now);
        match deposit.status {
            DepositStatus::Pending => {
                deposit.macaroon.add_caveat(predicate);
                Ok(())
            }
            DepositStatus::Consumed => Err(DepositError::Consumed),
            DepositStatus::Revoked => Err(DepositError::Revoked),
            DepositStatus::Expired => Err(DepositError::Expired),
        }
    }

    /// Sweeps `expired`/`revoked` deposits created before `older_than`.
    pub fn clean_expired(&self, older_than: DateTime<Utc>) {
        let mut guard = self.deposits.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        for deposit in guard.values_mut() {
            deposit.promote_if_expired(now);
        }
        guard.retain(|_, d| {
            !matches!(d.status, DepositStatus::Expired | DepositStatus::Revoked) || d.created_at >= older_than
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_macaroon() -> Macaroon {
        Macaroon::new("relay://local", b"root", "invite-1")
    }

    #[test]
    fn consume_is_exactly_once() {
        let store = InviteDepositStore::new();
        let id = store.create(test_macaroon(), "admin-peer", None);
        store.consume(&id, "joiner-1").unwrap();
        let err = store.consume(&id, "joiner-2").unwrap_err();
        assert!(matches!(err, DepositError::Consumed));
    }

    #[test]
    fn expired_deposit_cannot_be_consumed() {
        let store = InviteDepositStore::new();
        let id = store.create(test_macaroon(), "admin-peer", Some(Duration::seconds(-1)));
        let err = store.consume(&id, "joiner-1").unwrap_err();
        assert!(matches!(err, DepositError::Expired));
        let listed = store.list();
        assert_eq!(listed[0].status, DepositStatus::Expired);
    }

    #[test]
    fn revoke_rejects_consumed() {
        let store = InviteDepositStore::new();
        let id = store.create(test_macaroon(), "admin-peer", None);
        store.consume(&id, "joiner-1").unwrap();
        let err = store.revoke(&id).unwrap_err();
        assert!(matches!(err, DepositError::Consumed));
    }

    #[test]
    fn add_caveat_only_while_pending() {
        let store = InviteDepositStore::new();
        let id = store.create(test_macaroon(), "admin-peer", None);
        store.add_caveat(&id, "service=proxy").unwrap();
        store.consume(&id, "joiner-1").unwrap();
        let err = store.add_caveat(&id, "action=connect").unwrap_err();
        assert!(matches!(err, DepositError::Consumed));
    }

    #[test]
    fn clean_expired_sweeps_old_terminal_deposits() {
        let store = InviteDepositStore::new();
        let id = store.create(test_macaroon(), "admin-peer", Some(Duration::seconds(-1)));
        store.clean_expired(Utc::now() + Duration::seconds(1));
        assert!(store.get(&id).is_none());
    }
}
