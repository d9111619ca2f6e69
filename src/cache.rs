//! Tenant cache (spec §4.B).
//!
//! Namespaced key/value cache over Redis with a circuit breaker: a sliding
//! failure counter that, past a threshold, opens a cooldown window during
//! which `get`/`set` are short-circuited so the caller degrades gracefully
//! (empty `get`, no-op `set`) instead of piling onto a dead backend.
//!
//! Grounded on the original system's `valkey_cache.py` (same namespacing
//! scheme, same consecutive-failure/cooldown shape) and the teacher's
//! `parking_lot`-guarded shared-state style.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone, Default)]
pub struct CacheStatus {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_ping_ok: bool,
    pub last_ping_at: Option<chrono::DateTime<chrono::Utc>>,
    pub cooldown_remaining_secs: Option<u64>,
}

struct BreakerState {
    hits: u64,
    misses: u64,
    sets: u64,
    failures: u64,
    last_error: Option<String>,
    last_ping_ok: bool,
    last_ping_at: Option<chrono::DateTime<chrono::Utc>>,
    disabled_until: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            hits: 0,
            misses: 0,
            sets: 0,
            failures: 0,
            last_error: None,
            last_ping_ok: false,
            last_ping_at: None,
            disabled_until: None,
        }
    }
}

pub struct TenantCache {
    client: Option<redis::Client>,
    namespace: String,
    schema_version: String,
    failure_threshold: u64,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl TenantCache {
    /// `redis_url = None` builds a cache that always misses — used in tests
    /// and whenever a deploy runs without a cache backend configured.
    pub fn new(
        redis_url: Option<&str>,
        namespace: impl Into<String>,
        schema_version: impl Into<String>,
        failure_threshold: u64,
        cooldown: Duration,
    ) -> Self {
        let client = redis_url.and_then(|url| redis::Client::open(url).ok());
        Self {
            client,
            namespace: namespace.into(),
            schema_version: schema_version.into(),
            failure_threshold,
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}:{}", self.namespace, self.schema_version, key)
    }

    fn cooldown_active(&self) -> bool {
        let mut state = self.state.lock();
        match state.disabled_until {
            Some(until) if until > Instant::now() => true,
            Some(_) => {
                state.disabled_until = None;
                state.failures = 0;
                false
            }
            None => false,
        }
    }

    fn record_failure(&self, err: impl ToString) {
        let mut state = self.state.lock();
        state.failures += 1;
        state.last_error = Some(err.to_string());
        state.last_ping_at = Some(chrono::Utc::now());
        state.last_ping_ok = false;
        if self.failure_threshold > 0 && state.failures >= self.failure_threshold {
            state.disabled_until = Some(Instant::now() + self.cooldown);
        }
    }

    fn mark_success(&self) {
        let mut state = self.state.lock();
        state.failures = 0;
        state.last_ping_at = Some(chrono::Utc::now());
        state.disabled_until = None;
        state.last_ping_ok = true;
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if self.cooldown_active() {
            return None;
        }
        let client = self.client.as_ref()?;
        let namespaced = self.namespaced(key);
        let result: Result<Option<String>, redis::RedisError> = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            redis::cmd("GET")
                .arg(&namespaced)
                .query_async(&mut conn)
                .await
        }
        .await;

        match result {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    self.mark_success();
                    self.state.lock().hits += 1;
                    Some(value)
                }
                Err(_) => {
                    self.state.lock().misses += 1;
                    None
                }
            },
            Ok(None) => {
                self.mark_success();
                self.state.lock().misses += 1;
                None
            }
            Err(e) => {
                self.record_failure(e);
                None
            }
        }
    }

    /// Set with a TTL in seconds; `ttl == 0` disables caching entirely.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        if ttl_secs == 0 || self.cooldown_active() {
            return;
        }
        let Some(client) = self.client.as_ref() else {
            return;
        };
        let Ok(raw) = serde_json::to_string(value) else {
            return;
        };
        let namespaced = self.namespaced(key);
        let result: Result<(), redis::RedisError> = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            redis::cmd("SET")
                .arg(&namespaced)
                .arg(&raw)
                .arg("EX")
                .arg(ttl_secs)
                .query_async(&mut conn)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                self.mark_success();
                self.state.lock().sets += 1;
            }
            Err(e) => self.record_failure(e),
        }
    }

    fn revision_key(kind: &str, user_id: &str, space_id: Option<&str>) -> String {
        format!("rev:{}:u{}:s{}", kind, user_id, space_id.unwrap_or("none"))
    }

    /// Increment the monotonic revision for `(kind, user_id, space_id)`. Any
    /// write that could affect a tenant's results calls this so result cache
    /// keys change and stale reads are never served without explicit deletes.
    pub async fn bump_revision(&self, kind: &str, user_id: &str, space_id: Option<&str>) -> u64 {
        let key = self.namespaced(&Self::revision_key(kind, user_id, space_id));
        let Some(client) = self.client.as_ref() else {
            return 0;
        };
        if self.cooldown_active() {
            return 0;
        }
        let result: Result<u64, redis::RedisError> = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            redis::cmd("INCR").arg(&key).query_async(&mut conn).await
        }
        .await;
        match result {
            Ok(v) => {
                self.mark_success();
                v
            }
            Err(e) => {
                self.record_failure(e);
                0
            }
        }
    }

    pub async fn get_revision(&self, kind: &str, user_id: &str, space_id: Option<&str>) -> u64 {
        let key = self.namespaced(&Self::revision_key(kind, user_id, space_id));
        if self.cooldown_active() {
            return 0;
        }
        let Some(client) = self.client.as_ref() else {
            return 0;
        };
        let result: Result<Option<String>, redis::RedisError> = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            redis::cmd("GET").arg(&key).query_async(&mut conn).await
        }
        .await;
        match result {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                self.record_failure(e);
                0
            }
        }
    }

    pub fn status(&self) -> CacheStatus {
        let state = self.state.lock();
        let cooldown_remaining_secs = state
            .disabled_until
            .map(|until| until.saturating_duration_since(Instant::now()).as_secs());
        CacheStatus {
            hits: state.hits,
            misses: state.misses,
            sets: state.sets,
            failures: state.failures,
            last_error: state.last_error.clone(),
            last_ping_ok: state.last_ping_ok,
            last_ping_at: state.last_ping_at,
            cooldown_remaining_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disconnected_cache() -> TenantCache {
        TenantCache::new(None, "shodh", "v1", 3, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn get_on_unconfigured_cache_is_none() {
        let cache = disconnected_cache();
        let v: Option<String> = cache.get("anything").await;
        assert!(v.is_none());
    }

    #[tokio::test]
    async fn set_on_unconfigured_cache_is_noop_and_does_not_panic() {
        let cache = disconnected_cache();
        cache.set("k", &"v".to_string(), 60).await;
        let status = cache.status();
        assert_eq!(status.sets, 0);
    }

    #[tokio::test]
    async fn zero_ttl_disables_caching() {
        let cache = disconnected_cache();
        cache.set("k", &"v".to_string(), 0).await;
        assert_eq!(cache.status().sets, 0);
    }

    #[test]
    fn namespacing_includes_app_and_schema_version() {
        let cache = disconnected_cache();
        assert_eq!(cache.namespaced("foo"), "shodh:v1:foo");
    }

    #[test]
    fn revision_key_handles_missing_space() {
        let key = TenantCache::revision_key("text", "u1", None);
        assert_eq!(key, "rev:text:uu1:snone");
    }

    #[test]
    fn status_reports_last_ping_at_after_a_probe() {
        let cache = disconnected_cache();
        assert!(cache.status().last_ping_at.is_none());
        cache.record_failure("boom");
        let status = cache.status();
        assert!(status.last_ping_at.is_some());
        assert!(!status.last_ping_ok);
        cache.mark_success();
        assert!(cache.status().last_ping_ok);
    }
}
