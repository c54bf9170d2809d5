use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchcore_shared::clients::redis::RedisClient;
use matchcore_shared::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::{canonical_pair, CollisionStatus};

const PAIR_PREFIX: &str = "matchcore:collision:pair";
const QUEUE_KEY: &str = "matchcore:collision:stability_queue";
const LOCK_PREFIX: &str = "matchcore:collision:inflight";

/// TTL applied to pair records wherever no caller-specific value applies;
/// long enough to outlive any observation period, short enough that an
/// abandoned pair cannot linger past the hour.
pub const DEFAULT_PAIR_TTL_SECS: u64 = 3600;

/// The ephemeral twin of a `CollisionEvent` row, keyed by the canonical
/// `(circle1_id, circle2_id)` pair (lexicographic on circle ids, per the
/// data model). TTL is refreshed on every re-observation by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollisionPair {
    pub circle1_id: Uuid,
    pub circle2_id: Uuid,
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    pub distance_meters: f64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: CollisionStatus,
}

fn pair_key(circle1: Uuid, circle2: Uuid) -> (Uuid, Uuid) {
    canonical_pair(circle1, circle2)
}

#[async_trait]
pub trait CollisionStateStore: Send + Sync {
    async fn get_pair(&self, circle1: Uuid, circle2: Uuid) -> CoreResult<Option<CollisionPair>>;
    async fn upsert_pair(&self, pair: CollisionPair, ttl_secs: u64) -> CoreResult<()>;
    async fn remove_pair(&self, circle1: Uuid, circle2: Uuid) -> CoreResult<()>;
    async fn stability_queue_add(&self, circle1: Uuid, circle2: Uuid, score_millis: f64) -> CoreResult<()>;
    async fn stability_queue_remove(&self, circle1: Uuid, circle2: Uuid) -> CoreResult<()>;
    async fn stability_queue_snapshot(&self) -> CoreResult<Vec<(Uuid, Uuid)>>;
    async fn try_acquire_in_flight_lock(
        &self,
        circle1: Uuid,
        circle2: Uuid,
        ttl_secs: u64,
    ) -> CoreResult<bool>;
    async fn release_in_flight_lock(&self, circle1: Uuid, circle2: Uuid) -> CoreResult<()>;
}

/// Production implementation over the shared `RedisClient`.
pub struct RedisCollisionStateStore {
    redis: RedisClient,
}

impl RedisCollisionStateStore {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl CollisionStateStore for RedisCollisionStateStore {
    async fn get_pair(&self, circle1: Uuid, circle2: Uuid) -> CoreResult<Option<CollisionPair>> {
        let (a, b) = pair_key(circle1, circle2);
        let raw = self
            .redis
            .get(&format!("{PAIR_PREFIX}:{a}:{b}"))
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;
        match raw {
            Some(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| CoreError::Internal(anyhow::anyhow!(e))),
            None => Ok(None),
        }
    }

    async fn upsert_pair(&self, pair: CollisionPair, ttl_secs: u64) -> CoreResult<()> {
        let (a, b) = pair_key(pair.circle1_id, pair.circle2_id);
        let data = serde_json::to_string(&pair).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        self.redis
            .set(&format!("{PAIR_PREFIX}:{a}:{b}"), &data, ttl_secs)
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))
    }

    async fn remove_pair(&self, circle1: Uuid, circle2: Uuid) -> CoreResult<()> {
        let (a, b) = pair_key(circle1, circle2);
        self.redis
            .del(&format!("{PAIR_PREFIX}:{a}:{b}"))
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))
    }

    async fn stability_queue_add(&self, circle1: Uuid, circle2: Uuid, score_millis: f64) -> CoreResult<()> {
        let (a, b) = pair_key(circle1, circle2);
        self.redis
            .zadd(QUEUE_KEY, &format!("{a}:{b}"), score_millis)
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))
    }

    async fn stability_queue_remove(&self, circle1: Uuid, circle2: Uuid) -> CoreResult<()> {
        let (a, b) = pair_key(circle1, circle2);
        self.redis
            .zrem(QUEUE_KEY, &format!("{a}:{b}"))
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))
    }

    async fn stability_queue_snapshot(&self) -> CoreResult<Vec<(Uuid, Uuid)>> {
        let members = self
            .redis
            .zrange(QUEUE_KEY, 0, -1)
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;
        Ok(members
            .into_iter()
            .filter_map(|m| {
                let (a, b) = m.split_once(':')?;
                Some((a.parse().ok()?, b.parse().ok()?))
            })
            .collect())
    }

    async fn try_acquire_in_flight_lock(
        &self,
        circle1: Uuid,
        circle2: Uuid,
        ttl_secs: u64,
    ) -> CoreResult<bool> {
        let (a, b) = pair_key(circle1, circle2);
        self.redis
            .set_nx(&format!("{LOCK_PREFIX}:{a}:{b}"), "1", ttl_secs)
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))
    }

    async fn release_in_flight_lock(&self, circle1: Uuid, circle2: Uuid) -> CoreResult<()> {
        let (a, b) = pair_key(circle1, circle2);
        self.redis
            .del(&format!("{LOCK_PREFIX}:{a}:{b}"))
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))
    }
}

/// In-memory fake used by unit tests: reproduces the same canonical
/// keying and lock semantics without a live Redis instance.
#[derive(Default)]
pub struct InMemoryCollisionStateStore {
    pairs: Mutex<HashMap<(Uuid, Uuid), CollisionPair>>,
    queue: Mutex<HashMap<(Uuid, Uuid), f64>>,
    locks: Mutex<HashMap<(Uuid, Uuid), DateTime<Utc>>>,
}

impl InMemoryCollisionStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CollisionStateStore for InMemoryCollisionStateStore {
    async fn get_pair(&self, circle1: Uuid, circle2: Uuid) -> CoreResult<Option<CollisionPair>> {
        Ok(self.pairs.lock().unwrap().get(&pair_key(circle1, circle2)).cloned())
    }

    async fn upsert_pair(&self, pair: CollisionPair, _ttl_secs: u64) -> CoreResult<()> {
        let key = pair_key(pair.circle1_id, pair.circle2_id);
        self.pairs.lock().unwrap().insert(key, pair);
        Ok(())
    }

    async fn remove_pair(&self, circle1: Uuid, circle2: Uuid) -> CoreResult<()> {
        self.pairs.lock().unwrap().remove(&pair_key(circle1, circle2));
        Ok(())
    }

    async fn stability_queue_add(&self, circle1: Uuid, circle2: Uuid, score_millis: f64) -> CoreResult<()> {
        self.queue
            .lock()
            .unwrap()
            .insert(pair_key(circle1, circle2), score_millis);
        Ok(())
    }

    async fn stability_queue_remove(&self, circle1: Uuid, circle2: Uuid) -> CoreResult<()> {
        self.queue.lock().unwrap().remove(&pair_key(circle1, circle2));
        Ok(())
    }

    async fn stability_queue_snapshot(&self) -> CoreResult<Vec<(Uuid, Uuid)>> {
        let mut entries: Vec<((Uuid, Uuid), f64)> =
            self.queue.lock().unwrap().iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        Ok(entries.into_iter().map(|(k, _)| k).collect())
    }

    async fn try_acquire_in_flight_lock(
        &self,
        circle1: Uuid,
        circle2: Uuid,
        ttl_secs: u64,
    ) -> CoreResult<bool> {
        let key = pair_key(circle1, circle2);
        let mut locks = self.locks.lock().unwrap();
        let now = Utc::now();
        if let Some(expires_at) = locks.get(&key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        locks.insert(key, now + chrono::Duration::seconds(ttl_secs as i64));
        Ok(true)
    }

    async fn release_in_flight_lock(&self, circle1: Uuid, circle2: Uuid) -> CoreResult<()> {
        self.locks.lock().unwrap().remove(&pair_key(circle1, circle2));
        Ok(())
    }
}

pub fn epoch_millis(instant: DateTime<Utc>) -> f64 {
    instant.timestamp_millis() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pair(c1: Uuid, c2: Uuid) -> CollisionPair {
        let now = Utc::now();
        CollisionPair {
            circle1_id: c1,
            circle2_id: c2,
            user1_id: Uuid::new_v4(),
            user2_id: Uuid::new_v4(),
            distance_meters: 10.0,
            first_seen_at: now,
            last_seen_at: now,
            status: CollisionStatus::Detecting,
        }
    }

    #[tokio::test]
    async fn upsert_and_get_is_order_independent() {
        let store = InMemoryCollisionStateStore::new();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        store.upsert_pair(make_pair(c1, c2), 60).await.unwrap();

        assert!(store.get_pair(c1, c2).await.unwrap().is_some());
        assert!(store.get_pair(c2, c1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn in_flight_lock_is_exclusive_until_released() {
        let store = InMemoryCollisionStateStore::new();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        assert!(store.try_acquire_in_flight_lock(c1, c2, 60).await.unwrap());
        assert!(!store.try_acquire_in_flight_lock(c2, c1, 60).await.unwrap());

        store.release_in_flight_lock(c1, c2).await.unwrap();
        assert!(store.try_acquire_in_flight_lock(c1, c2, 60).await.unwrap());
    }

    #[tokio::test]
    async fn stability_queue_snapshot_is_score_ordered() {
        let store = InMemoryCollisionStateStore::new();
        let (a1, a2) = (Uuid::new_v4(), Uuid::new_v4());
        let (b1, b2) = (Uuid::new_v4(), Uuid::new_v4());

        store.stability_queue_add(a1, a2, 200.0).await.unwrap();
        store.stability_queue_add(b1, b2, 100.0).await.unwrap();

        let snapshot = store.stability_queue_snapshot().await.unwrap();
        assert_eq!(snapshot[0], pair_key(b1, b2));
        assert_eq!(snapshot[1], pair_key(a1, a2));
    }
}
