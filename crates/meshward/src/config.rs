//! Operator-tunable configuration (TOML), loaded/saved through [`crate::store::ConfigStore`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshwardConfig {
    /// Concurrent enrollment admissions allowed before the probation window
    /// starts rejecting new unauthorized peers.
    pub probation_limit: u32,
    /// How long an enrolled peer may remain on probation before the gater
    /// reverts to rejecting it, in seconds.
    pub probation_timeout_secs: u64,
    /// De-duplication window for peer-notify pushes, in seconds (C9).
    pub peer_notify_dedup_window_secs: u64,
    /// Sweep interval for the peer-notify de-duplication map, in seconds.
    pub peer_notify_dedup_sweep_interval_secs: u64,
    /// Timeout for opening an outbound peer-notify stream, in seconds.
    pub peer_notify_open_timeout_secs: u64,
    /// Domain socket path override for the admin API (C12). When unset,
    /// resolved from [`crate::paths::MeshwardPaths::admin_socket_path`].
    pub admin_socket_path: Option<String>,
    /// Grace period for in-flight connections to drain on shutdown, in
    /// seconds.
    pub shutdown_drain_timeout_secs: u64,
    /// Read deadline for the remote unseal protocol stream, in seconds.
    pub unseal_read_deadline_secs: u64,
    /// Default `auto_seal_minutes` applied to newly created vaults when the
    /// admin API's `vault/init` body omits it (0 disables auto-seal).
    pub default_auto_seal_minutes: u64,
}

impl Default for MeshwardConfig {
    fn default() -> Self {
        Self {
            probation_limit: 8,
            probation_timeout_secs: 5 * 60,
            peer_notify_dedup_window_secs: 30,
            peer_notify_dedup_sweep_interval_secs: 5 * 60,
            peer_notify_open_timeout_secs: 10,
            admin_socket_path: None,
            shutdown_drain_timeout_secs: 3,
            unseal_read_deadline_secs: 30,
            default_auto_seal_minutes: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = MeshwardConfig::default();
        let s = toml::to_string_pretty(&cfg).unwrap();
        let back: MeshwardConfig = toml::from_str(&s).unwrap();
        assert_eq!(back.probation_limit, cfg.probation_limit);
        assert_eq!(back.unseal_read_deadline_secs, 30);
    }
}
