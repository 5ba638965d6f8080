#![forbid(unsafe_code)]

use std::time::Duration;
use tracing::warn;

const ENV_PREFIX: &str = "CHUNKDB_";

pub const DEFAULT_MAX_HIERARCHY_DEPTH: usize = 128;

#[derive(Clone, Debug, PartialEq)]
pub struct StoreConfig {
    /// Deepest allowed distance from a root to any chunk below it.
    pub max_hierarchy_depth: usize,
    pub busy_timeout: Duration,
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    pub audit: AuditConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub max_bytes: usize,
    pub default_ttl: Duration,
    pub search_ttl: Duration,
}

/// Backoff for transient SQLite contention (`SQLITE_BUSY` / `SQLITE_LOCKED`).
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditConfig {
    pub batch_size: usize,
    pub pause: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_hierarchy_depth: DEFAULT_MAX_HIERARCHY_DEPTH,
            busy_timeout: Duration::from_secs(5),
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            max_bytes: 16 * 1024 * 1024,
            default_ttl: Duration::from_secs(30 * 60),
            search_ttl: Duration::from_secs(15 * 60),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            factor: 1.5,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            pause: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let scaled = (self.base_delay.as_millis() as f64 * self.factor.max(1.0).powi(exponent)).round();
        if !scaled.is_finite() || scaled >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(scaled as u64)
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `CHUNKDB_*` keys resolved through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let env = EnvReader { lookup: &lookup };

        Self {
            max_hierarchy_depth: env.usize("MAX_HIERARCHY_DEPTH", defaults.max_hierarchy_depth),
            busy_timeout: env.millis("BUSY_TIMEOUT_MS", defaults.busy_timeout),
            cache: CacheConfig {
                enabled: env.bool("CACHE_ENABLED", defaults.cache.enabled),
                max_entries: env.usize("CACHE_MAX_ENTRIES", defaults.cache.max_entries).max(1),
                max_bytes: env.usize("CACHE_MAX_BYTES", defaults.cache.max_bytes),
                default_ttl: env.secs("CACHE_TTL_SECS", defaults.cache.default_ttl),
                search_ttl: env.secs("SEARCH_CACHE_TTL_SECS", defaults.cache.search_ttl),
            },
            retry: RetryPolicy {
                max_attempts: env
                    .usize("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts as usize)
                    .clamp(1, 100) as u32,
                base_delay: env.millis("RETRY_BASE_DELAY_MS", defaults.retry.base_delay),
                max_delay: env.millis("RETRY_MAX_DELAY_MS", defaults.retry.max_delay),
                factor: defaults.retry.factor,
            },
            audit: AuditConfig {
                batch_size: env.usize("AUDIT_BATCH_SIZE", defaults.audit.batch_size).max(1),
                pause: env.millis("AUDIT_PAUSE_MS", defaults.audit.pause),
            },
        }
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn raw(&self, key: &str) -> Option<(String, String)> {
        let name = format!("{ENV_PREFIX}{key}");
        let value = (self.lookup)(&name)?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some((name, trimmed.to_string()))
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        let Some((name, value)) = self.raw(key) else {
            return default;
        };
        match value.parse::<usize>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(env = %name, value = %value, default, "unparsable config value, using default");
                default
            }
        }
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        let Some((name, value)) = self.raw(key) else {
            return default;
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!(env = %name, value = %value, default, "unparsable config value, using default");
                default
            }
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        let fallback = usize::try_from(default.as_millis()).unwrap_or(usize::MAX);
        Duration::from_millis(self.usize(key, fallback) as u64)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        let fallback = usize::try_from(default.as_secs()).unwrap_or(usize::MAX);
        Duration::from_secs(self.usize(key, fallback) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(StoreConfig::from_lookup(|_| None), StoreConfig::default());
    }

    #[test]
    fn overrides_and_bad_values() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("CHUNKDB_MAX_HIERARCHY_DEPTH", "8"),
            ("CHUNKDB_CACHE_ENABLED", "off"),
            ("CHUNKDB_CACHE_TTL_SECS", "not-a-number"),
            ("CHUNKDB_RETRY_MAX_ATTEMPTS", "0"),
            ("CHUNKDB_AUDIT_PAUSE_MS", " 25 "),
        ]));
        assert_eq!(config.max_hierarchy_depth, 8);
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.default_ttl, CacheConfig::default().default_ttl);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.audit.pause, Duration::from_millis(25));
    }

    #[test]
    fn retry_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2), Duration::from_millis(75));
        assert!(policy.delay_for(3) > policy.delay_for(2));
        assert_eq!(policy.delay_for(60), policy.max_delay);
    }
}
