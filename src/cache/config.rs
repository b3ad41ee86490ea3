//! Query cache configuration.

use std::time::Duration;

const DEFAULT_KEEP_UNUSED_FOR_SECS: u64 = 60;

/// Tunables for [`QueryCache`](super::QueryCache).
#[derive(Debug, Clone)]
pub struct QueryCacheConfig {
    /// How long an entry with no subscribers stays cached before eviction.
    /// Zero evicts as soon as the last subscriber leaves.
    pub keep_unused_for: Duration,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            keep_unused_for: Duration::from_secs(DEFAULT_KEEP_UNUSED_FOR_SECS),
        }
    }
}

impl From<&crate::config::CacheSettings> for QueryCacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            keep_unused_for: settings.keep_unused_for,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_keeps_unused_entries_for_a_minute() {
        let config = QueryCacheConfig::default();
        assert_eq!(config.keep_unused_for, Duration::from_secs(60));
    }

    #[test]
    fn built_from_cache_settings() {
        let settings = crate::config::CacheSettings {
            keep_unused_for: Duration::from_secs(5),
        };
        let config = QueryCacheConfig::from(&settings);
        assert_eq!(config.keep_unused_for, Duration::from_secs(5));
    }
}
