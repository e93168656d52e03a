//! Per-peer lockout schedule backing the remote unseal protocol's brute-force
//! guard. Kept separate from the protocol handler since the schedule itself
//! has no wire concerns.

use crate::peer::PeerId;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Cooldowns for failures 5 through 10; failure 11+ is permanent.
const ESCALATION_MINUTES: [i64; 6] = [1, 5, 15, 60, 60, 60];
const FREE_FAILURES: u32 = 4;

#[derive(Debug, Clone, Default)]
struct PeerLockout {
    failures: u32,
    locked_until: Option<DateTime<Utc>>,
    permanently_blocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutCheck {
    Clear,
    LockedOut { remaining_secs: u64 },
    PermanentlyBlocked,
}

/// In-memory per-peer failure counters. Never reveals which factor
/// (passphrase vs TOTP) caused a failure — callers must record failures
/// uniformly regardless of which check failed.
#[derive(Default)]
pub struct LockoutTracker {
    peers: Mutex<HashMap<PeerId, PeerLockout>>,
}

impl LockoutTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks whether `peer` may attempt an unseal right now, without
    /// mutating state.
    pub fn check(&self, peer: &PeerId) -> LockoutCheck {
        let guard = self.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(entry) = guard.get(peer) else {
            return LockoutCheck::Clear;
        };
        if entry.permanently_blocked {
            return LockoutCheck::PermanentlyBlocked;
        }
        if let Some(until) = entry.locked_until {
            let now = Utc::now();
            if now < until {
                #[allow(clippy::cast_sign_loss)]
                let remaining_secs = (until - now).num_seconds().max(0) as u64;
                return LockoutCheck::LockedOut { remaining_secs };
            }
        }
        LockoutCheck::Clear
    }

    /// Records a failed attempt, applying the escalating cooldown schedule.
    pub fn record_failure(&self, peer: &PeerId) {
        let mut guard = self.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = guard.entry(peer.clone()).or_default();
        entry.failures += 1;

        if entry.failures <= FREE_FAILURES {
            return;
        }

        let escalation_index = (entry.failures - FREE_FAILURES - 1) as usize;
        if let Some(minutes) = ESCALATION_MINUTES.get(escalation_index) {
            entry.locked_until = Some(Utc::now() + Duration::minutes(*minutes));
        } else {
            entry.permanently_blocked = true;
            entry.locked_until = None;
        }
    }

    /// Clears a peer's lockout state on a successful unseal.
    pub fn record_success(&self, peer: &PeerId) {
        let mut guard = self.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.remove(peer);
    }

    /// Operator override to clear a permanent block out-of-band.
    pub fn clear(&self, peer: &PeerId) {
        let mut guard = self.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::parse("12D3KooWpeer").unwrap()
    }

    #[test]
    fn first_four_failures_are_free() {
        let tracker = LockoutTracker::new();
        let p = peer();
        for _ in 0..4 {
            tracker.record_failure(&p);
            assert_eq!(tracker.check(&p), LockoutCheck::Clear);
        }
    }

    #[test]
    fn fifth_failure_locks_out() {
        let tracker = LockoutTracker::new();
        let p = peer();
        for _ in 0..5 {
            tracker.record_failure(&p);
        }
        assert!(matches!(tracker.check(&p), LockoutCheck::LockedOut { .. }));
    }

    #[test]
    fn beyond_schedule_is_permanent() {
        let tracker = LockoutTracker::new();
        let p = peer();
        for _ in 0..11 {
            tracker.record_failure(&p);
        }
        assert_eq!(tracker.check(&p), LockoutCheck::PermanentlyBlocked);
    }

    #[test]
    fn success_clears_failures() {
        let tracker = LockoutTracker::new();
        let p = peer();
        for _ in 0..6 {
            tracker.record_failure(&p);
        }
        tracker.record_success(&p);
        assert_eq!(tracker.check(&p), LockoutCheck::Clear);
    }

    #[test]
    fn operator_clear_lifts_permanent_block() {
        let tracker = LockoutTracker::new();
        let p = peer();
        for _ in 0..11 {
            tracker.record_failure(&p);
        }
        tracker.clear(&p);
        assert_eq!(tracker.check(&p), LockoutCheck::Clear);
    }
}
