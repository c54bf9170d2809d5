use std::sync::Arc;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use matchcore_shared::clients::db::DbPool;
use matchcore_shared::types::geo::GeoPoint;
use matchcore_shared::{CoreError, CoreResult};
use serde::Serialize;
use uuid::Uuid;

use crate::collision::store::{epoch_millis, CollisionPair, CollisionStateStore, DEFAULT_PAIR_TTL_SECS};
use crate::events::{DomainEvent, EventSink};
use crate::geo::GeoIndex;
use crate::models::{canonical_pair, Circle, CollisionStatus, NewCollisionEvent};
use crate::position::PositionStore;
use crate::schema::{circles, collision_events};
use matchcore_shared::types::event::payloads;

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub skipped: bool,
    pub collisions: usize,
}

pub struct CollisionDetectorConfig {
    pub min_movement_meters: f64,
    pub min_update_interval_secs: i64,
    pub collision_pair_ttl_secs: u64,
    pub clock_drift_tolerance_secs: i64,
    pub spatial_search_limit: i64,
}

impl Default for CollisionDetectorConfig {
    fn default() -> Self {
        Self {
            min_movement_meters: 20.0,
            min_update_interval_secs: 3,
            collision_pair_ttl_secs: DEFAULT_PAIR_TTL_SECS,
            clock_drift_tolerance_secs: 30,
            spatial_search_limit: 200,
        }
    }
}

pub struct CollisionDetector {
    pool: DbPool,
    position_store: Arc<PositionStore>,
    collision_store: Arc<dyn CollisionStateStore>,
    event_sink: Arc<dyn EventSink>,
    config: CollisionDetectorConfig,
}

impl CollisionDetector {
    pub fn new(
        pool: DbPool,
        position_store: Arc<PositionStore>,
        collision_store: Arc<dyn CollisionStateStore>,
        event_sink: Arc<dyn EventSink>,
        config: CollisionDetectorConfig,
    ) -> Self {
        Self {
            pool,
            position_store,
            collision_store,
            event_sink,
            config,
        }
    }

    pub async fn ingest(
        &self,
        user_id: Uuid,
        lat: f64,
        lon: f64,
        accuracy_m: Option<f64>,
        device_instant: DateTime<Utc>,
    ) -> CoreResult<IngestOutcome> {
        let point = GeoPoint::new(lat, lon).map_err(CoreError::Validation)?;
        if let Some(accuracy) = accuracy_m {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(CoreError::Validation(format!("accuracy {accuracy} must be a non-negative number")));
            }
        }
        let now = Utc::now();

        if (now - device_instant).num_seconds().abs() > self.config.clock_drift_tolerance_secs {
            tracing::debug!(user_id = %user_id, accuracy = ?accuracy_m, "rejecting position update: clock drift exceeds tolerance");
            return Ok(IngestOutcome {
                skipped: true,
                collisions: 0,
            });
        }

        if let Some(last) = self.position_store.last_position(user_id).await {
            let elapsed = (now - last.observed_at).num_seconds();
            let moved = matchcore_shared::types::geo::haversine_meters(last.point, point);
            if elapsed < self.config.min_update_interval_secs && moved < self.config.min_movement_meters {
                return Ok(IngestOutcome {
                    skipped: true,
                    collisions: 0,
                });
            }
        }

        if let Err(e) = self.position_store.update_position(user_id, point, now).await {
            tracing::warn!(user_id = %user_id, error = %e, "failed to persist position, continuing detection anyway");
        }

        let visitor_circle = match self.most_recent_active_circle(user_id)? {
            Some(c) => c,
            None => {
                // The mover has no active circle of her own: there is nothing
                // for another user's circle to pair against yet.
                return Ok(IngestOutcome {
                    skipped: false,
                    collisions: 0,
                });
            }
        };

        let geo_index = GeoIndex::new(&self.pool, self.config.spatial_search_limit);
        let nearby = geo_index.query_nearby(user_id, point)?;

        let mut collisions = 0usize;
        for candidate in nearby {
            let (circle1_id, circle2_id) = canonical_pair(visitor_circle.id, candidate.circle_id);
            match self
                .record_collision(
                    circle1_id,
                    circle2_id,
                    user_id,
                    candidate.owner_user_id,
                    candidate.distance_m,
                    now,
                )
                .await
            {
                Ok(()) => {
                    collisions += 1;
                    self.event_sink
                        .emit(
                            DomainEvent::CollisionDetected(payloads::CollisionDetected {
                                user_a_id: user_id,
                                user_b_id: candidate.owner_user_id,
                                circle_a_id: visitor_circle.id,
                                circle_b_id: candidate.circle_id,
                                distance_meters: candidate.distance_m,
                            }),
                            Some(user_id),
                        )
                        .await;
                }
                Err(e) => {
                    tracing::warn!(
                        circle1 = %circle1_id,
                        circle2 = %circle2_id,
                        error = %e,
                        "failed to upsert collision pair, continuing with remaining candidates"
                    );
                }
            }
        }

        Ok(IngestOutcome {
            skipped: false,
            collisions,
        })
    }

    fn most_recent_active_circle(&self, user_id: Uuid) -> CoreResult<Option<Circle>> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| CoreError::Transient(format!("db pool exhausted: {e}")))?;
        let now = Utc::now();

        circles::table
            .filter(circles::owner_user_id.eq(user_id))
            .filter(circles::status.eq("active"))
            .filter(circles::start_at.le(now))
            .filter(circles::expires_at.is_null().or(circles::expires_at.gt(now)))
            .order(circles::created_at.desc())
            .first::<Circle>(&mut conn)
            .optional()
            .map_err(CoreError::Database)
    }

    async fn record_collision(
        &self,
        circle1_id: Uuid,
        circle2_id: Uuid,
        user_id: Uuid,
        other_user_id: Uuid,
        distance_meters: f64,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let existing = self.collision_store.get_pair(circle1_id, circle2_id).await?;
        let first_seen_at = existing.as_ref().map(|p| p.first_seen_at).unwrap_or(now);
        let (user1_id, user2_id) = canonical_pair(user_id, other_user_id);

        let pair = CollisionPair {
            circle1_id,
            circle2_id,
            user1_id,
            user2_id,
            distance_meters,
            first_seen_at,
            last_seen_at: now,
            status: existing.map(|p| p.status).unwrap_or(CollisionStatus::Detecting),
        };

        self.collision_store
            .upsert_pair(pair, self.config.collision_pair_ttl_secs)
            .await?;
        self.collision_store
            .stability_queue_add(circle1_id, circle2_id, epoch_millis(first_seen_at))
            .await?;

        self.upsert_durable_mirror(circle1_id, circle2_id, user1_id, user2_id, distance_meters, first_seen_at, now);

        Ok(())
    }

    /// Best-effort: the durable mirror exists for audit and cross-restart
    /// recovery, but its failure must not abort collision detection.
    fn upsert_durable_mirror(
        &self,
        circle1_id: Uuid,
        circle2_id: Uuid,
        user1_id: Uuid,
        user2_id: Uuid,
        distance_meters: f64,
        first_seen_at: DateTime<Utc>,
        last_seen_at: DateTime<Utc>,
    ) {
        let mut conn = match self.pool.get() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "failed to get db connection for collision_events mirror");
                return;
            }
        };

        let existing: Option<Uuid> = collision_events::table
            .filter(collision_events::circle1_id.eq(circle1_id))
            .filter(collision_events::circle2_id.eq(circle2_id))
            .filter(collision_events::status.ne("expired"))
            .select(collision_events::id)
            .first(&mut conn)
            .optional()
            .unwrap_or(None);

        if let Some(id) = existing {
            if let Err(e) = diesel::update(collision_events::table.find(id))
                .set((
                    collision_events::distance_meters.eq(distance_meters),
                    collision_events::last_seen_at.eq(last_seen_at),
                ))
                .execute(&mut conn)
            {
                tracing::warn!(error = %e, "failed to refresh collision_events row");
            }
            return;
        }

        let new_row = NewCollisionEvent {
            id: Uuid::now_v7(),
            user1_id,
            user2_id,
            circle1_id,
            circle2_id,
            distance_meters,
            status: CollisionStatus::Detecting.as_str().to_string(),
            first_seen_at,
            last_seen_at,
        };

        if let Err(e) = diesel::insert_into(collision_events::table)
            .values(&new_row)
            .execute(&mut conn)
        {
            tracing::warn!(error = %e, "failed to insert collision_events row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::store::InMemoryCollisionStateStore;
    use crate::events::RecordingEventSink;
    use diesel::r2d2::{ConnectionManager, Pool};

    /// Pool that never connects. The debounce paths under test return before
    /// any database access.
    fn lazy_pool() -> DbPool {
        let manager = ConnectionManager::<diesel::PgConnection>::new("postgres://unused.invalid/unused");
        Pool::builder()
            .max_size(1)
            .min_idle(Some(0))
            .connection_timeout(std::time::Duration::from_millis(100))
            .build_unchecked(manager)
    }

    struct Harness {
        detector: CollisionDetector,
        position_store: Arc<PositionStore>,
        sink: Arc<RecordingEventSink>,
    }

    fn harness() -> Harness {
        let pool = lazy_pool();
        let position_store = Arc::new(PositionStore::new(pool.clone()));
        let sink = Arc::new(RecordingEventSink::new());
        let detector = CollisionDetector::new(
            pool,
            position_store.clone(),
            Arc::new(InMemoryCollisionStateStore::new()),
            sink.clone(),
            CollisionDetectorConfig::default(),
        );
        Harness {
            detector,
            position_store,
            sink,
        }
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = CollisionDetectorConfig::default();
        assert_eq!(config.min_movement_meters, 20.0);
        assert_eq!(config.min_update_interval_secs, 3);
        assert_eq!(config.clock_drift_tolerance_secs, 30);
        assert_eq!(config.spatial_search_limit, 200);
    }

    #[tokio::test]
    async fn out_of_range_coordinates_are_a_validation_error() {
        let h = harness();
        let outcome = h
            .detector
            .ingest(Uuid::new_v4(), 91.0, 0.0, None, Utc::now())
            .await;
        assert!(matches!(outcome, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn negative_accuracy_is_a_validation_error() {
        let h = harness();
        let outcome = h
            .detector
            .ingest(Uuid::new_v4(), 10.0, 10.0, Some(-5.0), Utc::now())
            .await;
        assert!(matches!(outcome, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn excessive_clock_drift_is_skipped_without_events() {
        let h = harness();
        let outcome = h
            .detector
            .ingest(
                Uuid::new_v4(),
                10.0,
                10.0,
                None,
                Utc::now() - chrono::Duration::seconds(31),
            )
            .await
            .unwrap();

        assert!(outcome.skipped);
        assert_eq!(outcome.collisions, 0);
        assert!(h.sink.routing_keys().is_empty());
    }

    #[tokio::test]
    async fn small_move_soon_after_the_last_update_is_debounced() {
        let h = harness();
        let user_id = Uuid::new_v4();
        let last = GeoPoint::new(10.0, 10.0).unwrap();
        h.position_store
            .prime_cache(user_id, last, Utc::now() - chrono::Duration::seconds(1))
            .await;

        // ~1.5m away, 1s later: both debounce thresholds trip.
        let outcome = h
            .detector
            .ingest(user_id, 10.00001, 10.00001, None, Utc::now())
            .await
            .unwrap();

        assert!(outcome.skipped);
        assert_eq!(outcome.collisions, 0);
        assert!(h.sink.routing_keys().is_empty());
    }

    #[tokio::test]
    async fn replaying_an_accepted_update_is_a_no_op() {
        let h = harness();
        let user_id = Uuid::new_v4();
        let point = GeoPoint::new(10.0, 10.0).unwrap();
        h.position_store.prime_cache(user_id, point, Utc::now()).await;

        let outcome = h
            .detector
            .ingest(user_id, point.lat, point.lng, None, Utc::now())
            .await
            .unwrap();

        assert!(outcome.skipped);
    }

    #[tokio::test]
    async fn old_enough_update_bypasses_the_movement_threshold() {
        let h = harness();
        let user_id = Uuid::new_v4();
        let last = GeoPoint::new(10.0, 10.0).unwrap();
        h.position_store
            .prime_cache(user_id, last, Utc::now() - chrono::Duration::seconds(10))
            .await;

        // Same spot but past the update interval: accepted, so the pipeline
        // proceeds to the durable write, which fails against the lazy pool
        // and is swallowed, and then errors on the circle lookup.
        let outcome = h
            .detector
            .ingest(user_id, 10.0, 10.0, None, Utc::now())
            .await;
        assert!(matches!(outcome, Err(CoreError::Transient(_)) | Err(CoreError::Database(_))));
    }

    #[tokio::test]
    async fn collision_pair_survives_order_swap_in_canonical_store() {
        let store = InMemoryCollisionStateStore::new();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let now = Utc::now();

        let pair = CollisionPair {
            circle1_id: c1,
            circle2_id: c2,
            user1_id: Uuid::new_v4(),
            user2_id: Uuid::new_v4(),
            distance_meters: 15.0,
            first_seen_at: now,
            last_seen_at: now,
            status: CollisionStatus::Detecting,
        };
        store.upsert_pair(pair, 60).await.unwrap();
        assert!(store.get_pair(c2, c1).await.unwrap().is_some());
    }
}
