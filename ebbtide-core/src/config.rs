//! Centralized configuration for Ebbtide.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all Ebbtide components.
///
/// Groups related configuration settings into logical sections.
#[derive(Debug, Clone, Default)]
pub struct EbbtideConfig {
    pub connection: ConnectionConfig,
    pub crypto: CryptoConfig,
}

/// Per-connection protocol configuration.
///
/// Controls connection limits, timeouts, and keep-alive behavior for the
/// peer wire state machine.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// BitTorrent client identifier prefix for generated peer ids
    pub client_id: &'static str,
    /// Maximum concurrent peer connections
    pub max_connections: usize,
    /// Interval between keep-alive messages on an idle connection
    pub keep_alive_interval: Duration,
    /// Connection is torn down after this much inactivity
    pub idle_timeout: Duration,
    /// Handshake phase must finish within this window
    pub handshake_timeout: Duration,
    /// Upper bound on queued outbound bytes per connection
    pub max_outbound_buffer: usize,
    /// Whether unchoke slot accounting applies to peers on the local network
    pub unchoke_slots_on_local_network: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_id: "-EB0001-",
            max_connections: 50,
            keep_alive_interval: Duration::from_secs(120), // 2 minutes
            idle_timeout: Duration::from_secs(300),        // 5 minutes
            handshake_timeout: Duration::from_secs(10),
            max_outbound_buffer: 512 * 1024, // 512 KiB
            unchoke_slots_on_local_network: false,
        }
    }
}

/// Stream obfuscation policy for the handshake negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoPolicy {
    /// Never attempt an encrypted handshake
    Disabled,
    /// Try encrypted first, fall back to plaintext when attempts run out
    #[default]
    Preferred,
    /// Encrypted or nothing; exhausted attempts fail the handshake
    Required,
}

/// Encryption negotiation configuration.
#[derive(Debug, Clone)]
pub struct CryptoConfig {
    /// Whether and how hard to pursue an obfuscated channel
    pub policy: CryptoPolicy,
    /// Bounded number of encrypted handshake attempts before giving up
    pub max_attempts: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            policy: CryptoPolicy::Preferred,
            max_attempts: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = EbbtideConfig::default();
        assert_eq!(config.connection.client_id, "-EB0001-");
        assert_eq!(config.connection.max_connections, 50);
        assert_eq!(config.crypto.policy, CryptoPolicy::Preferred);
        assert_eq!(config.crypto.max_attempts, 2);
    }

    #[test]
    fn test_keep_alive_shorter_than_idle_timeout() {
        let config = ConnectionConfig::default();
        assert!(config.keep_alive_interval < config.idle_timeout);
    }
}
