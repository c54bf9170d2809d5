use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use matchcore_shared::clients::db::DbPool;
use matchcore_shared::types::geo::GeoPoint;
use matchcore_shared::{CoreError, CoreResult};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::schema::users;

#[derive(Debug, Clone, Copy)]
pub struct CachedPosition {
    pub point: GeoPoint,
    pub observed_at: DateTime<Utc>,
}

/// Durable per-user center position plus an in-process hot cache used purely
/// for the debounce decision in `CollisionDetector`. The cache is not shared
/// through Redis: debounce is a best-effort, single-process concern, and a
/// process restart losing it only costs one extra accepted update per user.
pub struct PositionStore {
    pool: DbPool,
    cache: Arc<RwLock<HashMap<Uuid, CachedPosition>>>,
}

impl PositionStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn last_position(&self, user_id: Uuid) -> Option<CachedPosition> {
        self.cache.read().await.get(&user_id).copied()
    }

    /// Test hook: seed the debounce cache without a durable write.
    #[cfg(test)]
    pub(crate) async fn prime_cache(&self, user_id: Uuid, point: GeoPoint, observed_at: DateTime<Utc>) {
        self.cache
            .write()
            .await
            .insert(user_id, CachedPosition { point, observed_at });
    }

    /// Persists the new center and refreshes the hot cache. Writes are
    /// linearizable per user because diesel serializes through the
    /// connection pool's single-row update; the cache write happens after
    /// the durable write succeeds.
    pub async fn update_position(
        &self,
        user_id: Uuid,
        point: GeoPoint,
        observed_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| CoreError::Transient(format!("db pool exhausted: {e}")))?;
            diesel::update(users::table.find(user_id))
                .set((
                    users::latitude.eq(point.lat),
                    users::longitude.eq(point.lng),
                    users::updated_at.eq(observed_at),
                ))
                .execute(&mut conn)
                .map_err(CoreError::Database)?;
            Ok::<(), CoreError>(())
        })
        .await
        .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))??;

        self.cache
            .write()
            .await
            .insert(user_id, CachedPosition { point, observed_at });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_is_empty_for_unknown_user() {
        // Exercises only the cache half of the store, since the durable half
        // requires a live Postgres connection that unit tests do not have.
        let cache: Arc<RwLock<HashMap<Uuid, CachedPosition>>> = Arc::new(RwLock::new(HashMap::new()));
        let user_id = Uuid::new_v4();
        assert!(cache.read().await.get(&user_id).is_none());
    }

    #[tokio::test]
    async fn cache_returns_most_recent_write() {
        let cache: Arc<RwLock<HashMap<Uuid, CachedPosition>>> = Arc::new(RwLock::new(HashMap::new()));
        let user_id = Uuid::new_v4();
        let p1 = GeoPoint::new(10.0, 10.0).unwrap();
        let p2 = GeoPoint::new(11.0, 11.0).unwrap();
        let now = Utc::now();

        cache.write().await.insert(
            user_id,
            CachedPosition {
                point: p1,
                observed_at: now,
            },
        );
        cache.write().await.insert(
            user_id,
            CachedPosition {
                point: p2,
                observed_at: now,
            },
        );

        let cached = cache.read().await.get(&user_id).copied().unwrap();
        assert_eq!(cached.point, p2);
    }
}
