//! The Session Store (C3).
//!
//! Keyed like `modules::state::StateManager` (domain -> entry behind an
//! `Arc<RwLock<HashMap<..>>>`), but the entry shape and TTL/eviction
//! semantics follow `original_source/session_cache.py`'s `SessionCacheManager`
//! exactly: key prefix `titan:session:{domain}`, default TTL 25 minutes, lazy
//! expiry-on-read, and an `inject` helper that merges the clearance cookie
//! into the `Cookie` header and overwrites `User-Agent` (clearance is
//! UA-bound).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub const CACHE_KEY_PREFIX: &str = "titan:session:";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 25 * 60;

/// Per-domain cached session: a clearance cookie, the user-agent it was
/// issued under, and any additional cookies the clearance exchange set
/// (`__cf_bm`, `cf_clearance`, ...).
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub clearance_cookie: String,
    pub user_agent: String,
    pub extra_cookies: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new(clearance_cookie: impl Into<String>, user_agent: impl Into<String>) -> Self {
        let created_at = Utc::now();
        Self {
            clearance_cookie: clearance_cookie.into(),
            user_agent: user_agent.into(),
            extra_cookies: HashMap::new(),
            created_at,
            expires_at: created_at + chrono::Duration::seconds(DEFAULT_SESSION_TTL_SECS as i64),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = self.created_at + chrono::Duration::from_std(ttl).unwrap_or_default();
        self
    }

    pub fn with_extra_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_cookies.insert(name.into(), value.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }

    pub fn cache_key(domain: &str) -> String {
        format!("{CACHE_KEY_PREFIX}{domain}")
    }
}

/// The Session Store contract. Implementations are interchangeable and
/// selected at construction — Titan ships the in-memory implementation; a
/// remote-KV-backed implementation can satisfy the same trait.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, domain: &str) -> Option<SessionEntry>;
    async fn put(&self, domain: &str, entry: SessionEntry);
    async fn invalidate(&self, domain: &str) -> bool;
    async fn enumerate(&self) -> Vec<(String, SessionEntry)>;
}

/// Process-local session store.
#[derive(Default)]
pub struct InMemorySessionStore {
    entries: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, domain: &str) -> Option<SessionEntry> {
        let mut map = self.entries.write().expect("session store lock poisoned");
        match map.get(domain) {
            Some(entry) if entry.is_valid() => Some(entry.clone()),
            Some(_) => {
                map.remove(domain);
                None
            }
            None => None,
        }
    }

    async fn put(&self, domain: &str, entry: SessionEntry) {
        let mut map = self.entries.write().expect("session store lock poisoned");
        map.insert(domain.to_string(), entry);
    }

    async fn invalidate(&self, domain: &str) -> bool {
        let mut map = self.entries.write().expect("session store lock poisoned");
        map.remove(domain).is_some()
    }

    async fn enumerate(&self) -> Vec<(String, SessionEntry)> {
        let now = SystemTime::now();
        let _ = now;
        let map = self.entries.read().expect("session store lock poisoned");
        map.iter()
            .filter(|(_, e)| e.is_valid())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Merge a cached session's clearance cookie into a request's `Cookie`
/// header and overwrite its `User-Agent`, mirroring
/// `session_cache.py::inject_cached_cookies`.
pub async fn inject(
    store: &dyn SessionStore,
    domain: &str,
    headers: &mut HashMap<String, String>,
) -> Option<SessionEntry> {
    let entry = store.get(domain).await?;

    let mut cookie_value = format!("cf_clearance={}", entry.clearance_cookie);
    for (name, value) in &entry.extra_cookies {
        cookie_value.push_str(&format!("; {name}={value}"));
    }
    if let Some(existing) = headers.get("Cookie") {
        cookie_value = format!("{existing}; {cookie_value}");
    }
    headers.insert("Cookie".to_string(), cookie_value);
    headers.insert("User-Agent".to_string(), entry.user_agent.clone());

    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lazily_evicts_expired_entry_on_read() {
        let store = InMemorySessionStore::new();
        let entry = SessionEntry::new("abc", "Mozilla/5.0").with_ttl(Duration::from_millis(1));
        store.put("example.com", entry).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.get("example.com").await.is_none());
        assert!(store.enumerate().await.is_empty());
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let store = InMemorySessionStore::new();
        let entry = SessionEntry::new("abc", "Mozilla/5.0");
        store.put("example.com", entry.clone()).await;
        store.put("example.com", entry).await;
        assert_eq!(store.enumerate().await.len(), 1);
    }

    #[tokio::test]
    async fn inject_merges_cookie_and_overwrites_ua() {
        let store = InMemorySessionStore::new();
        let entry = SessionEntry::new("abc123", "Mozilla/5.0 (Titan)")
            .with_extra_cookie("__cf_bm", "xyz");
        store.put("example.com", entry).await;

        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), "curl/8.0".to_string());
        let injected = inject(&store, "example.com", &mut headers).await;

        assert!(injected.is_some());
        assert_eq!(headers.get("User-Agent").unwrap(), "Mozilla/5.0 (Titan)");
        assert!(headers.get("Cookie").unwrap().contains("cf_clearance=abc123"));
        assert!(headers.get("Cookie").unwrap().contains("__cf_bm=xyz"));
    }

    #[tokio::test]
    async fn inject_is_miss_for_unknown_domain() {
        let store = InMemorySessionStore::new();
        let mut headers = HashMap::new();
        assert!(inject(&store, "nowhere.example", &mut headers).await.is_none());
        assert!(headers.is_empty());
    }
}
