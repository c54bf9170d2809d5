use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchcore_shared::clients::redis::RedisClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::canonical_pair;

const COOLDOWN_PREFIX: &str = "matchcore:cooldown";

/// Tiered cooldown, modeled as a single enum plus a duration table rather
/// than polymorphism. Ordering matters only for display;
/// the store never holds more than one active cooldown per pair; whichever
/// mission result ran last overwrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CooldownKind {
    Notified,
    Rejected,
    Matched,
}

impl CooldownKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notified => "notified",
            Self::Rejected => "rejected",
            Self::Matched => "matched",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "notified" => Self::Notified,
            "rejected" => Self::Rejected,
            "matched" => Self::Matched,
            _ => return None,
        })
    }
}

/// Duration table driving the `SET key value EX ttl` call. Values are taken
/// from the configuration surface rather than hard-coded, so callers thread
/// `AppConfig`'s cooldown fields in; this table just picks the right one.
pub struct CooldownDurations {
    pub matched_secs: i64,
    pub rejected_secs: i64,
    pub notified_secs: i64,
}

impl CooldownDurations {
    pub fn for_kind(&self, kind: CooldownKind) -> i64 {
        match kind {
            CooldownKind::Matched => self.matched_secs,
            CooldownKind::Rejected => self.rejected_secs,
            CooldownKind::Notified => self.notified_secs,
        }
    }
}

/// Per-unordered-pair embargo on new missions. `set` is best-effort (a lost
/// cooldown at worst re-admits a pair early); `is_active` failing open is
/// deliberate for the same reason.
#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn is_active(&self, a: Uuid, b: Uuid) -> bool;
    async fn active_kind(&self, a: Uuid, b: Uuid) -> Option<CooldownKind>;
    async fn set(&self, a: Uuid, b: Uuid, kind: CooldownKind, durations: &CooldownDurations);
}

pub struct RedisCooldownStore {
    redis: RedisClient,
}

impl RedisCooldownStore {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    fn key(a: Uuid, b: Uuid) -> String {
        let (lo, hi) = canonical_pair(a, b);
        format!("{COOLDOWN_PREFIX}:{lo}:{hi}")
    }
}

#[async_trait]
impl CooldownStore for RedisCooldownStore {
    async fn is_active(&self, a: Uuid, b: Uuid) -> bool {
        self.redis.exists(&Self::key(a, b)).await.unwrap_or(false)
    }

    async fn active_kind(&self, a: Uuid, b: Uuid) -> Option<CooldownKind> {
        let value = self.redis.get(&Self::key(a, b)).await.ok().flatten()?;
        CooldownKind::parse(&value)
    }

    async fn set(&self, a: Uuid, b: Uuid, kind: CooldownKind, durations: &CooldownDurations) {
        let ttl = durations.for_kind(kind).max(1) as u64;
        if let Err(e) = self.redis.set(&Self::key(a, b), kind.as_str(), ttl).await {
            tracing::error!(error = %e, pair_a = %a, pair_b = %b, "failed to set cooldown");
        }
    }
}

/// In-memory fake with real expiry semantics, for orchestration tests.
#[derive(Default)]
pub struct InMemoryCooldownStore {
    entries: Mutex<HashMap<(Uuid, Uuid), (CooldownKind, DateTime<Utc>)>>,
}

impl InMemoryCooldownStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CooldownStore for InMemoryCooldownStore {
    async fn is_active(&self, a: Uuid, b: Uuid) -> bool {
        self.active_kind(a, b).await.is_some()
    }

    async fn active_kind(&self, a: Uuid, b: Uuid) -> Option<CooldownKind> {
        let key = canonical_pair(a, b);
        let entries = self.entries.lock().unwrap();
        let (kind, expires_at) = entries.get(&key)?;
        (*expires_at > Utc::now()).then_some(*kind)
    }

    async fn set(&self, a: Uuid, b: Uuid, kind: CooldownKind, durations: &CooldownDurations) {
        let key = canonical_pair(a, b);
        let expires_at = Utc::now() + chrono::Duration::seconds(durations.for_kind(kind).max(1));
        self.entries.lock().unwrap().insert(key, (kind, expires_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn durations() -> CooldownDurations {
        CooldownDurations {
            matched_secs: 14 * 24 * 3600,
            rejected_secs: 24 * 3600,
            notified_secs: 3600,
        }
    }

    #[test]
    fn matched_cooldown_outlasts_rejected_and_notified() {
        let durations = durations();
        assert!(durations.for_kind(CooldownKind::Matched) > durations.for_kind(CooldownKind::Rejected));
        assert!(durations.for_kind(CooldownKind::Rejected) > durations.for_kind(CooldownKind::Notified));
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [CooldownKind::Matched, CooldownKind::Rejected, CooldownKind::Notified] {
            assert_eq!(CooldownKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[tokio::test]
    async fn set_then_query_is_symmetric_in_pair_order() {
        let store = InMemoryCooldownStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        store.set(a, b, CooldownKind::Notified, &durations()).await;
        assert!(store.is_active(b, a).await);
        assert_eq!(store.active_kind(b, a).await, Some(CooldownKind::Notified));
    }

    #[tokio::test]
    async fn later_set_overwrites_the_previous_kind() {
        let store = InMemoryCooldownStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        store.set(a, b, CooldownKind::Notified, &durations()).await;
        store.set(a, b, CooldownKind::Matched, &durations()).await;
        assert_eq!(store.active_kind(a, b).await, Some(CooldownKind::Matched));
    }

    #[tokio::test]
    async fn expired_entry_is_not_active() {
        let store = InMemoryCooldownStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .entries
            .lock()
            .unwrap()
            .insert(canonical_pair(a, b), (CooldownKind::Notified, Utc::now() - chrono::Duration::seconds(1)));

        assert!(!store.is_active(a, b).await);
    }
}
