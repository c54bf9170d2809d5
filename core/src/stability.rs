use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use diesel::prelude::*;
use matchcore_shared::clients::db::DbPool;
use matchcore_shared::{CoreError, CoreResult};

use crate::collision::store::DEFAULT_PAIR_TTL_SECS;
use crate::collision::{CollisionPair, CollisionStateStore};
use crate::models::CollisionStatus;
use crate::mission::orchestrator::MissionOrchestrator;
use crate::schema::collision_events;

pub struct StabilityWorkerConfig {
    pub tick_interval: Duration,
    pub stability_window_secs: i64,
    pub stale_window_secs: i64,
}

pub struct StabilityWorker {
    pool: DbPool,
    collision_store: Arc<dyn CollisionStateStore>,
    orchestrator: Arc<MissionOrchestrator>,
    config: StabilityWorkerConfig,
}

impl StabilityWorker {
    pub fn new(
        pool: DbPool,
        collision_store: Arc<dyn CollisionStateStore>,
        orchestrator: Arc<MissionOrchestrator>,
        config: StabilityWorkerConfig,
    ) -> Self {
        Self {
            pool,
            collision_store,
            orchestrator,
            config,
        }
    }

    /// Spawns the periodic tick loop on the current Tokio runtime. Mirrors
    /// the platform's `spawn_*_task` convention for background workers: a
    /// `tokio::time::interval` driving one pass of `tick` per period, with
    /// failures logged rather than aborting the loop.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick_interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.tick().await {
                    tracing::error!(error = %e, "stability worker tick failed");
                }
            }
        });
    }

    pub async fn tick(&self) -> CoreResult<()> {
        self.promote_stable_pairs().await?;
        self.age_out_stale_events()?;
        Ok(())
    }

    async fn promote_stable_pairs(&self) -> CoreResult<()> {
        let snapshot = self.collision_store.stability_queue_snapshot().await?;
        let now = Utc::now();

        for (circle1_id, circle2_id) in snapshot {
            let pair = match self.collision_store.get_pair(circle1_id, circle2_id).await? {
                Some(pair) => pair,
                None => {
                    self.collision_store
                        .stability_queue_remove(circle1_id, circle2_id)
                        .await?;
                    continue;
                }
            };

            if matches!(
                pair.status,
                CollisionStatus::MissionCreated | CollisionStatus::Matched | CollisionStatus::Cooldown
            ) {
                self.collision_store
                    .stability_queue_remove(circle1_id, circle2_id)
                    .await?;
                continue;
            }

            let elapsed = (now - pair.first_seen_at).num_seconds();
            if elapsed >= self.config.stability_window_secs {
                let pair = self.mark_stable(pair).await;
                if let Err(e) = self.orchestrator.create_mission_for_collision(&pair).await {
                    tracing::warn!(
                        circle1 = %circle1_id,
                        circle2 = %circle2_id,
                        error = %e,
                        "mission creation failed for stable pair"
                    );
                }
                self.collision_store
                    .stability_queue_remove(circle1_id, circle2_id)
                    .await?;
            }
        }

        Ok(())
    }

    /// Transitions a pair that has survived the observation window from
    /// `detecting` to `stable` in the ephemeral store, best-effort; promotion
    /// proceeds either way.
    async fn mark_stable(&self, mut pair: CollisionPair) -> CollisionPair {
        if pair.status == CollisionStatus::Detecting {
            pair.status = CollisionStatus::Stable;
            if let Err(e) = self
                .collision_store
                .upsert_pair(pair.clone(), DEFAULT_PAIR_TTL_SECS)
                .await
            {
                tracing::warn!(
                    circle1 = %pair.circle1_id,
                    circle2 = %pair.circle2_id,
                    error = %e,
                    "failed to mark collision pair stable"
                );
            }
        }
        pair
    }

    fn age_out_stale_events(&self) -> CoreResult<()> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| CoreError::Transient(format!("db pool exhausted: {e}")))?;
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.stale_window_secs);

        let stale: Vec<(uuid::Uuid, uuid::Uuid, uuid::Uuid)> = collision_events::table
            .filter(collision_events::first_seen_at.lt(cutoff))
            .filter(
                collision_events::status
                    .eq(CollisionStatus::Detecting.as_str())
                    .or(collision_events::status.eq(CollisionStatus::Stable.as_str())),
            )
            .select((collision_events::id, collision_events::circle1_id, collision_events::circle2_id))
            .load(&mut conn)
            .map_err(CoreError::Database)?;

        for (id, circle1_id, circle2_id) in &stale {
            if let Err(e) = diesel::update(collision_events::table.find(id))
                .set(collision_events::status.eq(CollisionStatus::Expired.as_str()))
                .execute(&mut conn)
            {
                tracing::warn!(error = %e, collision_event_id = %id, "failed to age out stale collision event");
            }
        }

        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "aged out stale collision events");
        }

        // Redis twin cleanup happens best-effort, outside the connection
        // borrow above (would otherwise need an async hop while holding a
        // sync connection).
        let store = self.collision_store.clone();
        let pairs: Vec<(uuid::Uuid, uuid::Uuid)> = stale.iter().map(|(_, c1, c2)| (*c1, *c2)).collect();
        tokio::spawn(async move {
            for (c1, c2) in pairs {
                let _ = store.remove_pair(c1, c2).await;
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::store::{epoch_millis, InMemoryCollisionStateStore};
    use crate::cooldown::{CooldownDurations, InMemoryCooldownStore};
    use crate::events::RecordingEventSink;
    use crate::mission::orchestrator::OrchestratorConfig;
    use crate::mission::queue::InMemoryMissionQueue;
    use diesel::r2d2::{ConnectionManager, Pool};
    use uuid::Uuid;

    fn lazy_pool() -> DbPool {
        let manager =
            ConnectionManager::<diesel::PgConnection>::new("postgres://unused.invalid/unused");
        Pool::builder()
            .max_size(1)
            .min_idle(Some(0))
            .connection_timeout(std::time::Duration::from_millis(100))
            .build_unchecked(manager)
    }

    fn make_pair(first_seen_at: chrono::DateTime<Utc>, status: CollisionStatus) -> CollisionPair {
        CollisionPair {
            circle1_id: Uuid::new_v4(),
            circle2_id: Uuid::new_v4(),
            user1_id: Uuid::new_v4(),
            user2_id: Uuid::new_v4(),
            distance_meters: 10.0,
            first_seen_at,
            last_seen_at: first_seen_at,
            status,
        }
    }

    fn worker(store: Arc<InMemoryCollisionStateStore>) -> StabilityWorker {
        let pool = lazy_pool();
        let orchestrator = Arc::new(MissionOrchestrator::new(
            pool.clone(),
            store.clone(),
            Arc::new(InMemoryCooldownStore::new()),
            CooldownDurations {
                matched_secs: 14 * 24 * 3600,
                rejected_secs: 24 * 3600,
                notified_secs: 3600,
            },
            Arc::new(InMemoryMissionQueue::new()),
            Arc::new(RecordingEventSink::new()),
            OrchestratorConfig {
                in_flight_ttl_secs: 60,
                mission_max_attempts: 3,
                queue_highwater: 1000,
            },
        ));
        StabilityWorker::new(
            pool,
            store,
            orchestrator,
            StabilityWorkerConfig {
                tick_interval: Duration::from_secs(5),
                stability_window_secs: 30,
                stale_window_secs: 45,
            },
        )
    }

    async fn enqueue(store: &InMemoryCollisionStateStore, pair: &CollisionPair) {
        store.upsert_pair(pair.clone(), 60).await.unwrap();
        store
            .stability_queue_add(pair.circle1_id, pair.circle2_id, epoch_millis(pair.first_seen_at))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pair_just_under_the_window_stays_queued() {
        let store = Arc::new(InMemoryCollisionStateStore::new());
        let pair = make_pair(
            Utc::now() - chrono::Duration::milliseconds(29_001),
            CollisionStatus::Detecting,
        );
        enqueue(&store, &pair).await;

        worker(store.clone()).promote_stable_pairs().await.unwrap();

        assert_eq!(store.stability_queue_snapshot().await.unwrap().len(), 1);
        let stored = store.get_pair(pair.circle1_id, pair.circle2_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CollisionStatus::Detecting);
    }

    #[tokio::test]
    async fn pair_at_the_window_boundary_is_promoted_and_dequeued() {
        let store = Arc::new(InMemoryCollisionStateStore::new());
        let pair = make_pair(
            Utc::now() - chrono::Duration::seconds(30),
            CollisionStatus::Detecting,
        );
        enqueue(&store, &pair).await;

        // Mission creation itself fails against the never-connecting pool;
        // promotion bookkeeping must still complete.
        worker(store.clone()).promote_stable_pairs().await.unwrap();

        assert!(store.stability_queue_snapshot().await.unwrap().is_empty());
        let stored = store.get_pair(pair.circle1_id, pair.circle2_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CollisionStatus::Stable);
    }

    #[tokio::test]
    async fn already_promoted_pair_is_dequeued_without_a_new_mission_attempt() {
        let store = Arc::new(InMemoryCollisionStateStore::new());
        let pair = make_pair(
            Utc::now() - chrono::Duration::seconds(60),
            CollisionStatus::MissionCreated,
        );
        enqueue(&store, &pair).await;

        worker(store.clone()).promote_stable_pairs().await.unwrap();

        assert!(store.stability_queue_snapshot().await.unwrap().is_empty());
        // Nobody touched the in-flight lock for it.
        assert!(store
            .try_acquire_in_flight_lock(pair.circle1_id, pair.circle2_id, 60)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn vanished_pair_is_dropped_from_the_queue() {
        let store = Arc::new(InMemoryCollisionStateStore::new());
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        store.stability_queue_add(c1, c2, 0.0).await.unwrap();

        worker(store.clone()).promote_stable_pairs().await.unwrap();

        assert!(store.stability_queue_snapshot().await.unwrap().is_empty());
    }
}
