/// The session store of record the cache sits in front of
use crate::error::CacheResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A validated session as returned by the store of record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    /// Unix seconds
    pub expires_at: u64,
    /// Unix seconds
    pub last_activity_at: u64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Session {
    pub fn is_expired(&self, now_unix: u64) -> bool {
        self.expires_at <= now_unix
    }
}

/// Source of truth for sessions. Implementations talk to the database.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up the session for `token`; `None` when the token is unknown,
    /// revoked or expired
    async fn validate_session_from_source(&self, token: &str) -> CacheResult<Option<Session>>;

    /// Revoke a single session by id. Returns false when no such session
    /// was active.
    async fn revoke_session(&self, session_id: &str) -> CacheResult<bool>;

    /// Revoke every session of a user, returning how many were revoked
    async fn revoke_all_user_sessions(&self, user_id: &str) -> CacheResult<u64>;
}
