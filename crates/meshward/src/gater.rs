//! Connection Gater: the primary admission decision point for inbound
//! connections.

use crate::peer::{Direction, PeerId};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

struct GaterState {
    authorized: HashSet<PeerId>,
    expiry: HashMap<PeerId, DateTime<Utc>>,
    enrollment_enabled: bool,
    probation: HashMap<PeerId, DateTime<Utc>>,
    probation_limit: usize,
    probation_timeout: Duration,
}

/// Gates inbound connections for the overlay transport. All hooks besides
/// `intercept_secured` are trivially permissive; that hook holds
/// the actual admission algorithm.
pub struct ConnectionGater {
    state: RwLock<GaterState>,
    on_decision: Option<Box<dyn Fn(&str, Decision) + Send + Sync>>,
}

impl ConnectionGater {
    #[must_use]
    pub fn new(probation_limit: usize, probation_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(GaterState {
                authorized: HashSet::new(),
                expiry: HashMap::new(),
                enrollment_enabled: false,
                probation: HashMap::new(),
                probation_limit,
                probation_timeout,
            }),
            on_decision: None,
        }
    }

    #[must_use]
    pub fn with_decision_callback(mut self, callback: impl Fn(&str, Decision) + Send + Sync + 'static) -> Self {
        self.on_decision = Some(Box::new(callback));
        self
    }

    fn fire(&self, peer: &PeerId, decision: Decision) {
        if let Some(cb) = &self.on_decision {
            cb(peer.short(), decision);
        }
    }

    #[must_use]
    pub const fn intercept_peer_dial(&self, _peer: &PeerId) -> bool {
        true
    }

    #[must_use]
    pub const fn intercept_addr_dial(&self, _peer: &PeerId, _addr: &str) -> bool {
        true
    }

    #[must_use]
    pub const fn intercept_accept(&self, _conn_addrs: &str) -> bool {
        true
    }

    #[must_use]
    pub const fn intercept_upgraded(&self, _conn: &str) -> (bool, u8) {
        (true, 0)
    }

    /// The primary decision point. The authorized-peer path takes only the
    /// read lock; enrollment/probation admission releases the read guard and
    /// re-checks the predicate under the write lock before mutating.
    pub fn intercept_secured(&self, direction: Direction, peer: &PeerId, _conn_addrs: &str) -> bool {
        if direction != Direction::Inbound {
            return true;
        }

        let now = Utc::now();
        let read = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if read.authorized.contains(peer) {
            let decision = match read.expiry.get(peer) {
                Some(expires_at) if now > *expires_at => Decision::Deny,
                _ => Decision::Allow,
            };
            drop(read);
            self.fire(peer, decision);
            return decision == Decision::Allow;
        }

        let enrollment_open = read.enrollment_enabled && read.probation.len() < read.probation_limit;
        drop(read);
        if !enrollment_open {
            self.fire(peer, Decision::Deny);
            return false;
        }

        let mut write = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if write.authorized.contains(peer) {
            let decision = match write.expiry.get(peer) {
                Some(expires_at) if now > *expires_at => Decision::Deny,
                _ => Decision::Allow,
            };
            drop(write);
            self.fire(peer, decision);
            return decision == Decision::Allow;
        }
        if write.enrollment_enabled && write.probation.len() < write.probation_limit {
            write.probation.insert(peer.clone(), now);
            drop(write);
            self.fire(peer, Decision::Allow);
            return true;
        }

        drop(write);
        self.fire(peer, Decision::Deny);
        false
    }

    /// Called by C8 once a peer completes token validation.
    pub fn promote_peer(&self, peer: &PeerId) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.probation.remove(peer);
        state.authorized.insert(peer.clone());
    }

    pub fn set_peer_expiry(&self, peer: &PeerId, expires_at: DateTime<Utc>) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.expiry.insert(peer.clone(), expires_at);
    }

    /// Replaces the entire authorized set (hot-reload path).
    pub fn update_authorized_peers(&self, new_set: HashSet<PeerId>) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.authorized = new_set;
    }

    pub fn set_enrollment_mode(&self, enabled: bool, limit: usize, timeout: Duration) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.enrollment_enabled = enabled;
        state.probation_limit = limit;
        state.probation_timeout = timeout;
        if !enabled {
            state.probation.clear();
        }
    }

    /// Evicts probationary peers that have outstayed `probation_timeout`,
    /// invoking `on_evict` for each so the caller can disconnect them.
    pub fn sweep_probation(&self, on_evict: impl Fn(&PeerId)) {
        let now = Utc::now();
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let timeout = state.probation_timeout;
        let expired: Vec<PeerId> = state
            .probation
            .iter()
            .filter(|(_, admitted_at)| now - **admitted_at > timeout)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in &expired {
            state.probation.remove(peer);
        }
        drop(state);
        for peer in &expired {
            on_evict(peer);
        }
    }

    pub fn is_authorized(&self, peer: &PeerId) -> bool {
        let state = self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.authorized.contains(peer)
    }

    pub fn probation_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.probation.len()
    }
}
