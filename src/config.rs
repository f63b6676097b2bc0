//! Server configuration settings.

use std::time::Duration;

use crate::packets::negotiate::Dialect;

/// Specifies the configuration for the protocol front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Lowest dialect the server will negotiate.
    pub min_dialect: Dialect,
    /// Highest dialect the server will negotiate.
    pub max_dialect: Dialect,

    /// Gates the encryption capability bit and the emission of an
    /// encryption-capabilities negotiate context.
    pub encryption_enabled: bool,
    /// Gates the directory-leasing capability bit.
    pub directory_leasing_enabled: bool,
    /// Announced in the server security mode. Reserved for the signing
    /// layer; negotiation only stores it.
    pub signing_required: bool,

    /// How long after a restart only reclaim requests are accepted.
    pub grace_period: Duration,
    /// How long a lease break may stay unacknowledged before the server
    /// completes it on the client's behalf.
    pub lease_break_timeout: Duration,

    /// Whether write commits are batched in memory until an explicit
    /// flush, close or shutdown.
    pub deferred_commit_enabled: bool,

    /// Upper bound on byte-range locks a single owner may hold per share.
    pub max_locks_per_owner: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            min_dialect: Dialect::MIN,
            max_dialect: Dialect::MAX,
            encryption_enabled: true,
            directory_leasing_enabled: true,
            signing_required: false,
            grace_period: Duration::from_secs(90),
            lease_break_timeout: Duration::from_secs(35),
            deferred_commit_enabled: true,
            max_locks_per_owner: 1024,
        }
    }
}

impl ServerConfig {
    /// Validates common configuration settings.
    pub fn validate(&self) -> crate::Result<()> {
        if self.min_dialect > self.max_dialect {
            return Err(crate::Error::InvalidConfiguration(
                "minimum dialect is greater than maximum dialect".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grace_period, Duration::from_secs(90));
        assert!(config.deferred_commit_enabled);
    }

    #[test]
    fn test_inverted_dialect_range_rejected() {
        let config = ServerConfig {
            min_dialect: Dialect::Smb0311,
            max_dialect: Dialect::Smb0202,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
