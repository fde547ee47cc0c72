//! Runtime configuration for the presence, cache and feed layers.

use crate::pagination::PageLimits;
use crate::{ConfigError, ParleyError, ParleyResult};
use std::time::Duration;

/// Lifetime of cached views, one per cached kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTtls {
    pub chat_list: Duration,
    pub chat_detail: Duration,
    pub message_page: Duration,
    pub pinned_page: Duration,
    pub notification_page: Duration,
}

impl CacheTtls {
    /// The same lifetime for every kind.
    pub fn uniform(ttl: Duration) -> Self {
        Self {
            chat_list: ttl,
            chat_detail: ttl,
            message_page: ttl,
            pinned_page: ttl,
            notification_page: ttl,
        }
    }

    fn all(&self) -> [(&'static str, Duration); 5] {
        [
            ("cache.chat_list", self.chat_list),
            ("cache.chat_detail", self.chat_detail),
            ("cache.message_page", self.message_page),
            ("cache.pinned_page", self.pinned_page),
            ("cache.notification_page", self.notification_page),
        ]
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self::uniform(Duration::from_secs(300))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParleyConfig {
    /// Lifetime of the online marker without a heartbeat.
    pub presence_ttl: Duration,
    pub cache: CacheTtls,
    /// Page sizes for chat history and pinned messages.
    pub message_limits: PageLimits,
    pub notification_limits: PageLimits,
    /// Attempts at resolving a direct chat before giving up on a conflict.
    pub dm_create_attempts: u32,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            presence_ttl: Duration::from_secs(300),
            cache: CacheTtls::default(),
            message_limits: PageLimits::new(50, 100),
            notification_limits: PageLimits::new(20, 50),
            dm_create_attempts: 3,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl ParleyConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `PARLEY_PRESENCE_TTL_SECS` (default: 300)
    /// - `PARLEY_CACHE_TTL_SECS`: TTL for every cached kind (default: 300)
    /// - `PARLEY_MESSAGE_PAGE_DEFAULT` / `PARLEY_MESSAGE_PAGE_MAX` (default: 50 / 100)
    /// - `PARLEY_NOTIFICATION_PAGE_DEFAULT` / `PARLEY_NOTIFICATION_PAGE_MAX` (default: 20 / 50)
    /// - `PARLEY_DM_CREATE_ATTEMPTS` (default: 3)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            presence_ttl: env_u64("PARLEY_PRESENCE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.presence_ttl),
            cache: env_u64("PARLEY_CACHE_TTL_SECS")
                .map(|secs| CacheTtls::uniform(Duration::from_secs(secs)))
                .unwrap_or(defaults.cache),
            message_limits: PageLimits::new(
                env_u32("PARLEY_MESSAGE_PAGE_DEFAULT").unwrap_or(defaults.message_limits.default_limit),
                env_u32("PARLEY_MESSAGE_PAGE_MAX").unwrap_or(defaults.message_limits.max_limit),
            ),
            notification_limits: PageLimits::new(
                env_u32("PARLEY_NOTIFICATION_PAGE_DEFAULT")
                    .unwrap_or(defaults.notification_limits.default_limit),
                env_u32("PARLEY_NOTIFICATION_PAGE_MAX")
                    .unwrap_or(defaults.notification_limits.max_limit),
            ),
            dm_create_attempts: env_u32("PARLEY_DM_CREATE_ATTEMPTS")
                .unwrap_or(defaults.dm_create_attempts),
        }
    }

    /// Reject configurations that would break the TTL or paging contracts.
    pub fn validate(&self) -> ParleyResult<()> {
        if self.presence_ttl.is_zero() {
            return Err(invalid("presence_ttl", "0", "must be positive"));
        }
        for (field, ttl) in self.cache.all() {
            if ttl.is_zero() {
                return Err(invalid(field, "0", "must be positive"));
            }
        }
        for (field, limits) in [
            ("message_limits", self.message_limits),
            ("notification_limits", self.notification_limits),
        ] {
            if limits.max_limit == 0 {
                return Err(invalid(field, "0", "max_limit must be positive"));
            }
            if limits.default_limit == 0 || limits.default_limit > limits.max_limit {
                return Err(invalid(
                    field,
                    &limits.default_limit.to_string(),
                    "default_limit must be within 1..=max_limit",
                ));
            }
        }
        if self.dm_create_attempts == 0 {
            return Err(invalid("dm_create_attempts", "0", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ParleyError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ParleyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.presence_ttl, Duration::from_secs(300));
        assert_eq!(config.cache.chat_list, Duration::from_secs(300));
        assert_eq!(config.message_limits.max_limit, 100);
        assert_eq!(config.notification_limits.max_limit, 50);
    }

    #[test]
    fn test_zero_presence_ttl_rejected() {
        let config = ParleyConfig {
            presence_ttl: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ParleyError::Config(ConfigError::InvalidValue { field, .. })) if field == "presence_ttl"
        ));
    }

    #[test]
    fn test_zero_cache_ttl_rejected() {
        let mut config = ParleyConfig::default();
        config.cache.pinned_page = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ParleyError::Config(ConfigError::InvalidValue { field, .. })) if field == "cache.pinned_page"
        ));
    }

    #[test]
    fn test_default_above_cap_rejected() {
        let config = ParleyConfig {
            notification_limits: PageLimits::new(80, 50),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ParleyError::Config(ConfigError::InvalidValue { field, .. })) if field == "notification_limits"
        ));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = ParleyConfig {
            dm_create_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
