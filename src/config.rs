use std::time::Duration;

/// Freshness and retention rules shared by every entry of a [`QueryCache`](crate::QueryCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Age after which a successful value counts as stale on its own.
    ///
    /// With `None` a value stays fresh until it is invalidated, which is what
    /// mutations rely on. Age-based staleness shows up in
    /// [`QueryEntry::is_stale`](crate::QueryEntry::is_stale) and makes
    /// [`ensure_fresh`](crate::QueryCache::ensure_fresh) start a new generation.
    pub stale_time: Option<Duration>,

    /// Idle period after which [`gc`](crate::QueryCache::gc) drops an entry
    /// that has no subscribers and no fetch in flight.
    pub cache_time: Duration,
}

const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(300);

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(None, DEFAULT_CACHE_TIME)
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn new(stale_time: Option<Duration>, cache_time: Duration) -> Self {
        Self {
            stale_time,
            cache_time,
        }
    }

    /// Same rules, with values going stale `stale_time` after they were written.
    #[must_use]
    pub const fn stale_after(self, stale_time: Duration) -> Self {
        Self {
            stale_time: Some(stale_time),
            ..self
        }
    }
}
