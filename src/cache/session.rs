use super::store::{Session, SessionStore};
use super::writeback::WritebackQueue;
use super::fingerprint;
use crate::config::CacheConfig;
use crate::core::Clock;
use crate::error::{CacheError, CacheResult};
use crate::metrics::CacheMetrics;
use crate::protocol::{reply_to_strings, Command};
use crate::router::{ReadOutcome, ReadWriteRouter};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FIELD_SESSION_ID: &str = "session_id";
const FIELD_USER_ID: &str = "user_id";
const FIELD_FINGERPRINT: &str = "token_fingerprint";
const FIELD_EXPIRES_AT: &str = "expires_at";
const FIELD_LAST_ACTIVITY_AT: &str = "last_activity_at";
const ATTRIBUTE_PREFIX: &str = "attr.";

/// Keys deleted per DEL when sweeping the namespace
const FLUSH_BATCH: usize = 256;

/// A session as stored in the cache: the session plus the fingerprint of
/// the token it was cached under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSession {
    pub token_fingerprint: String,
    pub session: Session,
}

impl CachedSession {
    pub fn to_fields(&self) -> Vec<(String, Vec<u8>)> {
        let session = &self.session;
        let mut fields = vec![
            (FIELD_SESSION_ID.to_string(), session.session_id.clone().into_bytes()),
            (FIELD_USER_ID.to_string(), session.user_id.clone().into_bytes()),
            (FIELD_FINGERPRINT.to_string(), self.token_fingerprint.clone().into_bytes()),
            (FIELD_EXPIRES_AT.to_string(), session.expires_at.to_string().into_bytes()),
            (
                FIELD_LAST_ACTIVITY_AT.to_string(),
                session.last_activity_at.to_string().into_bytes(),
            ),
        ];
        fields.extend(session.attributes.iter().map(|(name, value)| {
            (format!("{}{}", ATTRIBUTE_PREFIX, name), value.clone().into_bytes())
        }));
        fields
    }

    pub fn from_fields(fields: &HashMap<String, Bytes>) -> CacheResult<Self> {
        let text = |name: &str| -> CacheResult<String> {
            let raw = fields
                .get(name)
                .ok_or_else(|| CacheError::protocol(format!("cached session is missing {}", name)))?;
            String::from_utf8(raw.to_vec())
                .map_err(|_| CacheError::protocol(format!("cached session field {} is not UTF-8", name)))
        };
        let number = |name: &str| -> CacheResult<u64> {
            let raw = fields
                .get(name)
                .ok_or_else(|| CacheError::protocol(format!("cached session is missing {}", name)))?;
            btoi::btou(raw).map_err(|_| CacheError::protocol(format!("cached session field {} is not a number", name)))
        };

        let mut attributes = BTreeMap::new();
        for (name, value) in fields {
            if let Some(attribute) = name.strip_prefix(ATTRIBUTE_PREFIX) {
                attributes.insert(attribute.to_string(), String::from_utf8_lossy(value).into_owned());
            }
        }

        Ok(Self {
            token_fingerprint: text(FIELD_FINGERPRINT)?,
            session: Session {
                session_id: text(FIELD_SESSION_ID)?,
                user_id: text(FIELD_USER_ID)?,
                expires_at: number(FIELD_EXPIRES_AT)?,
                last_activity_at: number(FIELD_LAST_ACTIVITY_AT)?,
                attributes,
            },
        })
    }
}

struct CacheBackend {
    router: Arc<ReadWriteRouter>,
    writeback: WritebackQueue,
}

/// Cache-aside front for a `SessionStore`
pub struct SessionCache {
    settings: CacheConfig,
    backend: Option<CacheBackend>,
    store: Arc<dyn SessionStore>,
    metrics: Arc<CacheMetrics>,
    clock: Arc<dyn Clock>,
}

impl SessionCache {
    /// Caching front backed by `router`; also starts the write-back worker
    pub fn new(
        settings: CacheConfig,
        router: Arc<ReadWriteRouter>,
        store: Arc<dyn SessionStore>,
        metrics: Arc<CacheMetrics>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (writeback, worker) = WritebackQueue::spawn(
            Arc::clone(&router),
            settings.writeback_queue_capacity,
            settings.operation_timeout(),
            Arc::clone(&metrics),
            shutdown,
        );
        let cache = Self {
            settings,
            backend: Some(CacheBackend { router, writeback }),
            store,
            metrics,
            clock,
        };
        (cache, worker)
    }

    /// Every call goes straight to the store
    pub fn passthrough(
        settings: CacheConfig,
        store: Arc<dyn SessionStore>,
        metrics: Arc<CacheMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            backend: None,
            store,
            metrics,
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    fn session_key(&self, token_fingerprint: &str) -> String {
        format!("{}session:{}", self.settings.key_prefix, token_fingerprint)
    }

    fn user_index_key(&self, user_id: &str) -> String {
        format!("{}user:{}", self.settings.key_prefix, user_id)
    }

    /// Resolve a token to its session, from the cache when possible
    pub async fn validate(&self, token: &str) -> CacheResult<Option<Session>> {
        let started = Instant::now();
        let result = match &self.backend {
            Some(backend) => self.validate_cached(backend, token).await,
            None => self.from_source(token).await,
        };
        self.metrics.record_validate_latency(started.elapsed());
        result
    }

    async fn validate_cached(&self, backend: &CacheBackend, token: &str) -> CacheResult<Option<Session>> {
        if !backend.router.is_ready() {
            self.metrics.record_miss();
            return self.from_source(token).await;
        }

        let token_fingerprint = fingerprint(token);
        let key = self.session_key(&token_fingerprint);
        let ticket = backend.writeback.ticket();

        match backend.router.read(&key, self.settings.operation_timeout()).await {
            ReadOutcome::Hit(fields) => match CachedSession::from_fields(&fields) {
                Ok(cached)
                    if cached.token_fingerprint == token_fingerprint
                        && !cached.session.is_expired(self.clock.unix_time()) =>
                {
                    self.metrics.record_hit();
                    return Ok(Some(cached.session));
                }
                Ok(cached) => {
                    if cached.token_fingerprint != token_fingerprint {
                        warn!(key = %key, "cached session fingerprint mismatch, evicting");
                    } else {
                        debug!(key = %key, "cached session past its expiry, evicting");
                    }
                    self.metrics.record_miss();
                    backend.writeback.enqueue_evict(key.clone());
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "unreadable cached session, evicting");
                    self.metrics.record_miss();
                    backend.writeback.enqueue_evict(key.clone());
                }
            },
            ReadOutcome::Miss => self.metrics.record_miss(),
            ReadOutcome::Unavailable(_) => {
                self.metrics.record_miss();
                self.metrics.record_error();
            }
        }

        let session = self.from_source(token).await?;
        if let Some(session) = &session {
            if !session.is_expired(self.clock.unix_time()) {
                let cached = CachedSession {
                    token_fingerprint,
                    session: session.clone(),
                };
                let commands = self.store_commands(&key, &cached);
                backend.writeback.enqueue_store(key, commands, ticket);
            }
        }
        Ok(session)
    }

    async fn from_source(&self, token: &str) -> CacheResult<Option<Session>> {
        self.metrics.record_source_lookup();
        self.store.validate_session_from_source(token).await
    }

    /// Full overwrite of the entry plus its membership in the user index,
    /// both with the session TTL
    fn store_commands(&self, key: &str, cached: &CachedSession) -> Vec<Command> {
        let ttl = self.settings.session_ttl_sec;
        let index = self.user_index_key(&cached.session.user_id);
        let fields = cached.to_fields();
        vec![
            Command::del(&[key]),
            Command::hset(key, fields.iter().map(|(name, value)| (name.as_str(), value.as_slice()))),
            Command::expire(key, ttl),
            Command::sadd(&index, key),
            Command::expire(&index, ttl),
        ]
    }

    /// Drop the cached entry for `token`. Deleting an absent entry succeeds.
    pub async fn invalidate(&self, token: &str) -> CacheResult<()> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };

        backend.writeback.fence().await;
        let key = self.session_key(&fingerprint(token));
        match backend.router.delete(&[key.as_str()], self.settings.operation_timeout()).await {
            Ok(deleted) => {
                self.metrics.record_invalidation(deleted);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_error();
                warn!(key = %key, error = %e, "invalidation failed");
                Err(e)
            }
        }
    }

    /// Drop every cached entry of `user_id` through the per-user index.
    /// Returns the number of session entries removed.
    pub async fn invalidate_all_for_user(&self, user_id: &str) -> CacheResult<u64> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };

        backend.writeback.fence().await;
        let index = self.user_index_key(user_id);
        let timeout = self.settings.operation_timeout();

        let result = async {
            let members = reply_to_strings(backend.router.read_primary(Command::smembers(&index), timeout).await?)?;
            let removed = backend.router.delete(&members, timeout).await?;
            backend.router.delete(&[index.as_str()], timeout).await?;
            Ok(removed)
        }
        .await;

        match result {
            Ok(removed) => {
                self.metrics.record_invalidation(removed);
                info!(user_id = %user_id, removed, "invalidated cached sessions for user");
                Ok(removed)
            }
            Err(e) => {
                self.metrics.record_error();
                warn!(user_id = %user_id, error = %e, "user invalidation failed");
                Err(e)
            }
        }
    }

    /// Revoke the session behind `token` in the store, then drop it from
    /// the cache. Returns whether the store had an active session to revoke.
    pub async fn revoke_session(&self, token: &str) -> CacheResult<bool> {
        let revoked = match self.resolve_session_id(token).await? {
            Some(session_id) => self.store.revoke_session(&session_id).await?,
            None => false,
        };
        self.invalidate(token).await?;
        Ok(revoked)
    }

    /// Session id for `token`: from a matching cache entry, else the store.
    /// Never schedules a write-back.
    async fn resolve_session_id(&self, token: &str) -> CacheResult<Option<String>> {
        if let Some(backend) = self.backend.as_ref().filter(|b| b.router.is_ready()) {
            let token_fingerprint = fingerprint(token);
            let key = self.session_key(&token_fingerprint);
            if let ReadOutcome::Hit(fields) = backend.router.read(&key, self.settings.operation_timeout()).await {
                match CachedSession::from_fields(&fields) {
                    Ok(cached) if cached.token_fingerprint == token_fingerprint => {
                        return Ok(Some(cached.session.session_id));
                    }
                    _ => debug!(key = %key, "cached entry unusable for revocation, asking the store"),
                }
            }
        }
        Ok(self.from_source(token).await?.map(|session| session.session_id))
    }

    /// Revoke every session of a user in the store, then drop them from
    /// the cache. Returns the store's revocation count.
    pub async fn revoke_all_for_user(&self, user_id: &str) -> CacheResult<u64> {
        let revoked = self.store.revoke_all_user_sessions(user_id).await?;
        self.invalidate_all_for_user(user_id).await?;
        Ok(revoked)
    }

    /// Delete every key under the cache prefix on the current primary
    pub async fn flush_namespace(&self) -> CacheResult<u64> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };

        backend.writeback.fence().await;
        let timeout = self.settings.operation_timeout();
        let pattern = format!("{}*", self.settings.key_prefix);
        let keys = backend.router.scan_keys(&pattern, timeout).await?;

        let mut deleted = 0;
        for chunk in keys.chunks(FLUSH_BATCH) {
            deleted += backend.router.delete(chunk, timeout).await?;
        }
        self.metrics.record_invalidation(deleted);
        info!(deleted, "flushed session namespace");
        Ok(deleted)
    }

    /// Wait for queued write-backs and evictions to complete
    pub async fn flush_writebacks(&self) -> bool {
        match &self.backend {
            Some(backend) => backend.writeback.flush().await,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::testing::{session, Harness, MemorySessionStore};
    use std::time::Duration;

    #[test]
    fn test_fields_round_trip_with_attributes() {
        let mut s = session("s1", "u1", 2_000_000_000);
        s.attributes.insert("role".to_string(), "admin".to_string());
        let cached = CachedSession {
            token_fingerprint: fingerprint("t"),
            session: s,
        };

        let fields: HashMap<String, Bytes> = cached
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k, Bytes::from(v)))
            .collect();
        assert!(fields.contains_key("attr.role"));
        assert_eq!(CachedSession::from_fields(&fields).unwrap(), cached);
    }

    #[test]
    fn test_missing_field_is_protocol_error() {
        let mut fields = HashMap::new();
        fields.insert("session_id".to_string(), Bytes::from_static(b"s1"));
        assert!(matches!(
            CachedSession::from_fields(&fields),
            Err(CacheError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_cold_cache_then_hit() {
        let h = Harness::new(1);
        h.store.insert("tok-1", session("s1", "u1", h.far_future()));

        let first = h.cache.validate("tok-1").await.unwrap().unwrap();
        assert!(h.cache.flush_writebacks().await);
        assert!(h.cluster.key_exists(&h.session_key("tok-1")));

        let second = h.cache.validate("tok-1").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(h.store.lookups(), 1);

        let metrics = h.metrics.snapshot();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.writebacks, 1);
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_is_evicted_and_refetched() {
        let h = Harness::new(1);
        h.store.insert("tok-1", session("s1", "u1", h.far_future()));
        h.cache.validate("tok-1").await.unwrap();
        h.cache.flush_writebacks().await;

        let key = h.session_key("tok-1");
        h.cluster.set_hash_field(&key, "token_fingerprint", "0000");

        let validated = h.cache.validate("tok-1").await.unwrap().unwrap();
        assert_eq!(validated.session_id, "s1");
        assert_eq!(h.store.lookups(), 2);

        // Eviction and fresh write-back both ran; the entry is sound again
        h.cache.flush_writebacks().await;
        let stored = h.cluster.hash_field(&key, "token_fingerprint").unwrap();
        assert_eq!(stored, fingerprint("tok-1"));
        assert!(h.cache.validate("tok-1").await.unwrap().is_some());
        assert_eq!(h.store.lookups(), 2);
    }

    #[tokio::test]
    async fn test_expired_session_in_cache_is_not_served() {
        let h = Harness::new(1);
        let expires_at = h.cluster.manual_clock().unix_time() + 60;
        h.store.insert("tok-1", session("s1", "u1", expires_at));
        h.cache.validate("tok-1").await.unwrap();
        h.cache.flush_writebacks().await;

        // The session expires long before the cache entry would
        h.cluster.manual_clock().advance(Duration::from_secs(61));
        h.store.remove("tok-1");
        assert!(h.cache.validate("tok-1").await.unwrap().is_none());
        assert_eq!(h.store.lookups(), 2);

        h.cache.flush_writebacks().await;
        assert!(!h.cluster.key_exists(&h.session_key("tok-1")));
    }

    #[tokio::test]
    async fn test_negative_results_are_not_cached() {
        let h = Harness::new(1);
        assert!(h.cache.validate("unknown").await.unwrap().is_none());
        h.cache.flush_writebacks().await;
        assert!(!h.cluster.key_exists(&h.session_key("unknown")));

        h.store.insert("unknown", session("s9", "u9", h.far_future()));
        assert!(h.cache.validate("unknown").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_then_validate_goes_to_source() {
        let h = Harness::new(1);
        h.store.insert("tok-1", session("s1", "u1", h.far_future()));
        h.cache.validate("tok-1").await.unwrap();
        h.cache.flush_writebacks().await;

        h.cache.invalidate("tok-1").await.unwrap();
        assert!(!h.cluster.key_exists(&h.session_key("tok-1")));

        h.cache.validate("tok-1").await.unwrap();
        assert_eq!(h.store.lookups(), 2);
        assert_eq!(h.metrics.snapshot().hits, 0);

        // Second invalidation of the same token is not an error
        h.cache.invalidate("tok-1").await.unwrap();
        h.cache.invalidate("tok-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_errors_are_surfaced() {
        let h = Harness::new(1);
        h.cluster.fail_commands(&h.cluster.primary(), true);
        let result = h.cache.invalidate("tok-1").await;
        assert!(result.is_err());
        assert_eq!(h.metrics.snapshot().errors, 1);
    }

    #[tokio::test]
    async fn test_invalidate_all_for_user() {
        let h = Harness::new(1);
        for (token, id) in [("a", "s1"), ("b", "s2"), ("c", "s3")] {
            h.store.insert(token, session(id, "u1", h.far_future()));
        }
        h.store.insert("d", session("s4", "u2", h.far_future()));
        for token in ["a", "b", "c", "d"] {
            h.cache.validate(token).await.unwrap();
        }
        h.cache.flush_writebacks().await;

        let removed = h.cache.invalidate_all_for_user("u1").await.unwrap();
        assert_eq!(removed, 3);
        for token in ["a", "b", "c"] {
            assert!(!h.cluster.key_exists(&h.session_key(token)));
        }
        assert!(!h.cluster.key_exists("test:user:u1"));
        assert!(h.cluster.key_exists(&h.session_key("d")));
        assert!(h.cluster.key_exists("test:user:u2"));
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let h = Harness::new(1);
        h.store.insert("tok-1", session("s1", "u1", h.far_future()));
        h.cache.validate("tok-1").await.unwrap();
        h.cache.flush_writebacks().await;
        let key = h.session_key("tok-1");

        h.cluster.manual_clock().advance(Duration::from_secs(299));
        assert!(h.cluster.key_exists(&key));
        h.cluster.manual_clock().advance(Duration::from_secs(2));
        assert!(!h.cluster.key_exists(&key));
        assert!(!h.cluster.key_exists("test:user:u1"));
    }

    #[tokio::test]
    async fn test_no_replicas_falls_through_to_source() {
        let h = Harness::new(0);
        h.store.insert("tok-1", session("s1", "u1", h.far_future()));

        for _ in 0..3 {
            assert!(h.cache.validate("tok-1").await.unwrap().is_some());
        }
        assert_eq!(h.store.lookups(), 3);
        assert!(h.metrics.snapshot().errors >= 1);
    }

    #[tokio::test]
    async fn test_cache_is_transparent() {
        let h = Harness::new(2);
        let direct = SessionCache::passthrough(
            CacheConfig::default(),
            Arc::clone(&h.store) as Arc<dyn SessionStore>,
            Arc::new(CacheMetrics::new()),
            h.cluster.clock(),
        );
        assert!(!direct.is_enabled());

        h.store.insert("t1", session("s1", "u1", h.far_future()));
        h.store.insert("t2", session("s2", "u2", h.far_future()));
        for _ in 0..2 {
            for token in ["t1", "t2", "nope"] {
                let cached = h.cache.validate(token).await.unwrap();
                let uncached = direct.validate(token).await.unwrap();
                assert_eq!(cached, uncached);
            }
            h.cache.flush_writebacks().await;
        }
    }

    #[tokio::test]
    async fn test_failed_writeback_does_not_fail_validation() {
        let mut breaker = BreakerConfig::default();
        breaker.failure_threshold = 100;
        let h = Harness::with_settings(1, Harness::cache_settings(), breaker);
        h.store.insert("tok-1", session("s1", "u1", h.far_future()));
        h.cluster.fail_commands(&h.cluster.primary(), true);

        assert!(h.cache.validate("tok-1").await.unwrap().is_some());
        h.cache.flush_writebacks().await;
        let metrics = h.metrics.snapshot();
        assert_eq!(metrics.writebacks, 0);
        assert!(metrics.errors >= 1);
    }

    #[tokio::test]
    async fn test_revoke_session_hits_store_and_cache() {
        let h = Harness::new(1);
        h.store.insert("tok-1", session("s1", "u1", h.far_future()));
        h.cache.validate("tok-1").await.unwrap();
        h.cache.flush_writebacks().await;

        let lookups = h.store.lookups();
        assert!(h.cache.revoke_session("tok-1").await.unwrap());
        assert_eq!(h.store.lookups(), lookups, "session id came from the cache");
        assert!(!h.cluster.key_exists(&h.session_key("tok-1")));
        assert!(h.cache.validate("tok-1").await.unwrap().is_none());

        assert!(!h.cache.revoke_session("tok-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_uncached_session_resolves_id_from_store() {
        let h = Harness::new(1);
        h.store.insert("tok-1", session("s1", "u1", h.far_future()));
        h.store.insert("tok-2", session("s2", "u1", h.far_future()));

        assert!(h.cache.revoke_session("tok-1").await.unwrap());
        assert!(h.cache.flush_writebacks().await);
        assert!(!h.cluster.key_exists(&h.session_key("tok-1")));
        assert!(h.cache.validate("tok-1").await.unwrap().is_none());
        assert!(h.cache.validate("tok-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_revoke_unknown_token_is_false() {
        let h = Harness::new(1);
        assert!(!h.cache.revoke_session("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_all_for_user() {
        let h = Harness::new(1);
        h.store.insert("a", session("s1", "u1", h.far_future()));
        h.store.insert("b", session("s2", "u1", h.far_future()));
        h.cache.validate("a").await.unwrap();
        h.cache.validate("b").await.unwrap();
        h.cache.flush_writebacks().await;

        assert_eq!(h.cache.revoke_all_for_user("u1").await.unwrap(), 2);
        assert!(h.cache.validate("a").await.unwrap().is_none());
        assert!(h.cache.validate("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_namespace_only_touches_prefix() {
        let h = Harness::new(1);
        h.store.insert("a", session("s1", "u1", h.far_future()));
        h.cache.validate("a").await.unwrap();
        h.cache.flush_writebacks().await;
        h.cluster.set_hash_field("unrelated:key", "f", "v");

        let deleted = h.cache.flush_namespace().await.unwrap();
        assert_eq!(deleted, 2);
        assert!(!h.cluster.key_exists(&h.session_key("a")));
        assert!(h.cluster.key_exists("unrelated:key"));
    }

    #[tokio::test]
    async fn test_passthrough_store_errors_propagate() {
        let store = Arc::new(MemorySessionStore::new());
        store.set_failing(true);
        let cache = SessionCache::passthrough(
            CacheConfig::default(),
            store as Arc<dyn SessionStore>,
            Arc::new(CacheMetrics::new()),
            Arc::new(crate::core::SystemClock),
        );
        assert!(matches!(
            cache.validate("t").await,
            Err(CacheError::SessionStore { .. })
        ));
        assert!(cache.invalidate("t").await.is_ok());
        assert!(cache.flush_writebacks().await);
    }
}
