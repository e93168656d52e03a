//! Peer-Notify Protocol: one-shot push of group membership to a
//! newly-identified peer.

use crate::allowlist::AllowlistStore;
use crate::pairing_store::PairingTokenStore;
use crate::peer::PeerId;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};

const VERSION: u8 = 1;
const SWEEP_INTERVAL_SECS: i64 = 300;

/// Tracks recently-notified peers so a flapping connection doesn't cause
/// duplicate notify pushes within the dedup window.
pub struct NotifyDedup {
    last_notified: Mutex<HashMap<PeerId, DateTime<Utc>>>,
    window: Duration,
}

impl NotifyDedup {
    /// `window_secs` is `config.peer_notify_dedup_window_secs`.
    #[must_use]
    pub fn new(window_secs: u64) -> Self {
        Self {
            last_notified: Mutex::new(HashMap::new()),
            window: Duration::seconds(i64::try_from(window_secs).unwrap_or(i64::MAX)),
        }
    }

    /// Returns `true` if `peer` should be (re-)notified right now, recording
    /// the attempt either way.
    pub fn should_notify(&self, peer: &PeerId) -> bool {
        let mut guard = self
            .last_notified
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        if let Some(last) = guard.get(peer) {
            if now - *last < self.window {
                return false;
            }
        }
        guard.insert(peer.clone(), now);
        true
    }

    /// Sweeps entries older than the dedup window; call on a timer every
    /// [`SWEEP_INTERVAL_SECS`].
    pub fn sweep(&self) {
        let mut guard = self
            .last_notified
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        guard.retain(|_, last| now - *last < self.window);
    }

    #[must_use]
    pub const fn sweep_interval_secs() -> i64 {
        SWEEP_INTERVAL_SECS
    }
}

/// Pushes the membership of `peer`'s group to `peer` over a freshly-opened
/// stream, if the allowlist shows a `group` attribute for it and the dedup
/// window allows a notify right now.
pub async fn notify_if_due<S>(
    stream: &mut S,
    dedup: &NotifyDedup,
    allowlist: &AllowlistStore,
    pairing_store: &PairingTokenStore,
    peer: &PeerId,
) -> eyre::Result<bool>
where
    S: AsyncWrite + Unpin,
{
    let entries = allowlist.list()?;
    let Some(entry) = entries.iter().find(|e| e.peer_id == *peer) else {
        return Ok(false);
    };
    let Some(group_id) = entry.group() else {
        return Ok(false);
    };
    if !dedup.should_notify(peer) {
        return Ok(false);
    }
    let Some(group) = pairing_store.get(group_id) else {
        return Ok(false);
    };

    let mut buf = Vec::new();
    buf.push(VERSION);
    let group_id_bytes = group.group_id.as_bytes();
    #[allow(clippy::cast_possible_truncation)]
    buf.push(group_id_bytes.len() as u8);
    buf.extend_from_slice(group_id_bytes);
    #[allow(clippy::cast_possible_truncation)]
    buf.push(group.slots.len() as u8);

    let peers: Vec<_> = group
        .slots
        .iter()
        .filter(|s| s.peer_id.as_deref() != Some(peer.as_str()))
        .filter_map(|s| Some((s.peer_id.clone()?, s.name.clone().unwrap_or_default(), s.hmac_proof)))
        .collect();

    #[allow(clippy::cast_possible_truncation)]
    buf.push(peers.len() as u8);
    for (pid, name, proof) in peers {
        let pid_bytes = pid.as_bytes();
        #[allow(clippy::cast_possible_truncation)]
        let pid_len = pid_bytes.len().min(u16::MAX as usize) as u16;
        buf.extend_from_slice(&pid_len.to_be_bytes());
        buf.extend_from_slice(&pid_bytes[..pid_len as usize]);

        let name_bytes = &name.as_bytes()[..name.len().min(255)];
        #[allow(clippy::cast_possible_truncation)]
        buf.push(name_bytes.len() as u8);
        buf.extend_from_slice(name_bytes);

        buf.extend_from_slice(&proof.unwrap_or([0_u8; 32]));
    }

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_skips_within_window_and_allows_after_clear() {
        let dedup = NotifyDedup::new(30);
        let peer = PeerId::parse("12D3KooWpeer").unwrap();
        assert!(dedup.should_notify(&peer));
        assert!(!dedup.should_notify(&peer));
    }

    #[test]
    fn sweep_evicts_stale_entries() {
        let dedup = NotifyDedup::new(30);
        let peer = PeerId::parse("12D3KooWpeer").unwrap();
        {
            let mut guard = dedup.last_notified.lock().unwrap();
            guard.insert(peer.clone(), Utc::now() - Duration::seconds(31));
        }
        dedup.sweep();
        assert!(dedup.should_notify(&peer));
    }

    #[tokio::test]
    async fn notify_pushes_group_members_to_stream() {
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        let allowlist = AllowlistStore::new(dir.path().join("allowlist.txt"));
        let pairing_store = PairingTokenStore::new();
        let dedup = NotifyDedup::new(30);

        let (group_id, tokens) = pairing_store.create_group(2, Duration::hours(1), None, None);
        let alice = PeerId::parse("12D3KooWAlice").unwrap();
        let bob = PeerId::parse("12D3KooWBob").unwrap();
        pairing_store
            .validate_and_use(&group_id, &tokens[0], alice.as_str(), Some("alice".into()))
            .unwrap();
        pairing_store
            .validate_and_use(&group_id, &tokens[1], bob.as_str(), Some("bob".into()))
            .unwrap();

        allowlist.add(&bob, Some("bob")).unwrap();
        allowlist.set_attr(&bob, "group", &group_id).unwrap();

        let (mut client, mut server) = tokio::io::duplex(4096);
        let notified = notify_if_due(&mut server, &dedup, &allowlist, &pairing_store, &bob)
            .await
            .unwrap();
        assert!(notified);

        drop(server);
        let mut out = Vec::new();
        use tokio::io::AsyncReadExt as _;
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out[0], VERSION);
    }
}
