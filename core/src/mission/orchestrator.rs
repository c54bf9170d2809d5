use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel::PgConnection;
use matchcore_shared::clients::db::DbPool;
use matchcore_shared::types::event::payloads;
use matchcore_shared::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collision::store::{CollisionPair, DEFAULT_PAIR_TTL_SECS};
use crate::collision::CollisionStateStore;
use crate::cooldown::{CooldownDurations, CooldownKind, CooldownStore};
use crate::events::{DomainEvent, EventSink};
use crate::match_store::MatchStore;
use crate::mission::queue::{MissionContext, MissionJob, MissionQueue};
use crate::models::{
    canonical_pair, Circle, CollisionStatus, MatchKind, MatchStatus, Mission, MissionStatus,
    NewCollisionEvent, NewMatch, NewMission,
};
use crate::schema::{circles, collision_events, missions};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionResult {
    pub success: bool,
    pub match_made: bool,
    pub transcript: serde_json::Value,
    pub judge_decision: Option<serde_json::Value>,
    pub error: Option<String>,
}

pub struct OrchestratorConfig {
    pub in_flight_ttl_secs: u64,
    pub mission_max_attempts: i32,
    pub queue_highwater: u64,
}

pub struct MissionOrchestrator {
    pool: DbPool,
    collision_store: Arc<dyn CollisionStateStore>,
    cooldown_store: Arc<dyn CooldownStore>,
    cooldown_durations: CooldownDurations,
    mission_queue: Arc<dyn MissionQueue>,
    event_sink: Arc<dyn EventSink>,
    config: OrchestratorConfig,
}

impl MissionOrchestrator {
    pub fn new(
        pool: DbPool,
        collision_store: Arc<dyn CollisionStateStore>,
        cooldown_store: Arc<dyn CooldownStore>,
        cooldown_durations: CooldownDurations,
        mission_queue: Arc<dyn MissionQueue>,
        event_sink: Arc<dyn EventSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            collision_store,
            cooldown_store,
            cooldown_durations,
            mission_queue,
            event_sink,
            config,
        }
    }

    /// Promotes a stable collision pair to a pending mission. Returns
    /// `Ok(None)` for every logical no-op (lock held, cooldown active, a
    /// mission already in flight for this observation period, no eligible
    /// circle) — these are not errors.
    pub async fn create_mission_for_collision(&self, pair: &CollisionPair) -> CoreResult<Option<Mission>> {
        let acquired = self
            .collision_store
            .try_acquire_in_flight_lock(pair.circle1_id, pair.circle2_id, self.config.in_flight_ttl_secs)
            .await?;
        if !acquired {
            tracing::debug!(circle1 = %pair.circle1_id, circle2 = %pair.circle2_id, "in-flight lock already held");
            return Ok(None);
        }

        // Only a successfully created mission keeps the lock (released when
        // its result lands). Every no-op and every failure gives it back
        // immediately instead of squatting on it for the full TTL.
        match self.create_under_lock(pair).await {
            Ok(Some(mission)) => Ok(Some(mission)),
            outcome => {
                if let Err(e) = self
                    .collision_store
                    .release_in_flight_lock(pair.circle1_id, pair.circle2_id)
                    .await
                {
                    tracing::warn!(
                        circle1 = %pair.circle1_id,
                        circle2 = %pair.circle2_id,
                        error = %e,
                        "failed to release in-flight lock after skipped mission creation"
                    );
                }
                outcome
            }
        }
    }

    async fn create_under_lock(&self, pair: &CollisionPair) -> CoreResult<Option<Mission>> {
        if self.cooldown_store.is_active(pair.user1_id, pair.user2_id).await {
            tracing::debug!(user1 = %pair.user1_id, user2 = %pair.user2_id, "cooldown active, skipping mission");
            return Ok(None);
        }

        let resolved = match self.resolve_mission_circles(pair)? {
            Some(resolved) => resolved,
            None => {
                tracing::debug!(
                    circle1 = %pair.circle1_id,
                    circle2 = %pair.circle2_id,
                    "no eligible circle for either side, abandoning mission creation"
                );
                return Ok(None);
            }
        };

        let backpressure = self.queue_over_highwater().await;

        let pair_owned = pair.clone();
        let owner_user_id = resolved.owner_user_id;
        let visitor_user_id = resolved.visitor_user_id;
        let owner_circle = resolved.owner_circle.clone();
        let visitor_circle_id = resolved.visitor_circle.id;
        let mission = {
            let pool = self.pool.clone();
            let owner_circle_id = owner_circle.id;
            tokio::task::spawn_blocking(move || -> CoreResult<Option<Mission>> {
                let pair = pair_owned;
                let mut conn = pool
                    .get()
                    .map_err(|e| CoreError::Transient(format!("db pool exhausted: {e}")))?;
                let collision_event_id = match resolve_collision_event(
                    &mut conn,
                    pair.circle1_id,
                    pair.circle2_id,
                    pair.user1_id,
                    pair.user2_id,
                    pair.distance_meters,
                )? {
                    Some(id) => id,
                    // The collision-event row already points at a live
                    // mission: a duplicate lock acquirer (replica worker,
                    // expired-lock latecomer) observes it and backs off.
                    None => return Ok(None),
                };

                let new_mission = NewMission {
                    id: Uuid::now_v7(),
                    owner_user_id,
                    visitor_user_id,
                    owner_circle_id,
                    visitor_circle_id,
                    collision_event_id,
                    status: MissionStatus::Pending.as_str().to_string(),
                    attempt_number: 1,
                    backpressure,
                    transcript: serde_json::json!([]),
                };

                let mission: Mission = diesel::insert_into(missions::table)
                    .values(&new_mission)
                    .get_result(&mut conn)
                    .map_err(CoreError::Database)?;

                if let Err(e) = diesel::update(collision_events::table.find(collision_event_id))
                    .set((
                        collision_events::status.eq(CollisionStatus::MissionCreated.as_str()),
                        collision_events::mission_id.eq(mission.id),
                    ))
                    .execute(&mut conn)
                {
                    tracing::warn!(error = %e, mission_id = %mission.id, "failed to mark collision_events mission_created");
                }

                Ok(Some(mission))
            })
            .await
            .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))??
        };

        let Some(mission) = mission else {
            return Ok(None);
        };

        // Keep the ephemeral twin in step so re-observation by the detector
        // (which preserves existing status) cannot re-admit the pair to
        // promotion while this mission is live.
        let mut promoted = pair.clone();
        promoted.status = CollisionStatus::MissionCreated;
        if let Err(e) = self
            .collision_store
            .upsert_pair(promoted, DEFAULT_PAIR_TTL_SECS)
            .await
        {
            tracing::warn!(error = %e, mission_id = %mission.id, "failed to mark collision pair mission_created");
        }

        let job = MissionJob {
            mission_id: mission.id,
            owner_user_id,
            visitor_user_id,
            owner_profile_snapshot: serde_json::json!({ "user_id": owner_user_id }),
            visitor_profile_snapshot: serde_json::json!({ "user_id": visitor_user_id }),
            owner_circle_snapshot: circle_snapshot(&owner_circle),
            context: MissionContext {
                approximate_time_iso: Utc::now(),
                approximate_distance_m: pair.distance_meters,
            },
        };

        if let Err(e) = self.mission_queue.enqueue(&job).await {
            tracing::error!(error = %e, mission_id = %mission.id, "failed to enqueue mission job, retry loop will pick it up");
        }

        self.event_sink
            .emit(
                DomainEvent::MissionStarted(payloads::MissionStarted {
                    mission_id: mission.id,
                    owner_user_id,
                    visitor_user_id,
                    attempt_number: mission.attempt_number,
                }),
                Some(owner_user_id),
            )
            .await;

        Ok(Some(mission))
    }

    /// The mission row is created regardless of queue depth; above the
    /// highwater mark it is tagged so a supervisor can throttle acceptance.
    async fn queue_over_highwater(&self) -> bool {
        match self.mission_queue.depth().await {
            Ok(Some(depth)) => {
                metrics::gauge!("mission_queue_depth").set(depth as f64);
                if depth >= self.config.queue_highwater {
                    tracing::warn!(depth, highwater = self.config.queue_highwater, "mission queue over highwater");
                    true
                } else {
                    false
                }
            }
            Ok(None) => false,
            Err(e) => {
                tracing::debug!(error = %e, "mission queue depth unavailable");
                false
            }
        }
    }

    /// Deterministic owner/visitor split: `circle1` is always the owner side.
    /// Re-resolves each side's currently-effective circle rather than trusting
    /// the one captured at detection time, since up to the stability window
    /// has elapsed and that circle may have expired in the interim.
    fn resolve_mission_circles(&self, pair: &CollisionPair) -> CoreResult<Option<ResolvedCircles>> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| CoreError::Transient(format!("db pool exhausted: {e}")))?;

        let owner_user_id = circles::table
            .find(pair.circle1_id)
            .select(circles::owner_user_id)
            .first::<Uuid>(&mut conn)
            .map_err(CoreError::Database)?;
        let visitor_user_id = circles::table
            .find(pair.circle2_id)
            .select(circles::owner_user_id)
            .first::<Uuid>(&mut conn)
            .map_err(CoreError::Database)?;

        let owner_circle = most_recent_active_circle(&mut conn, owner_user_id)?;
        let visitor_circle = most_recent_active_circle(&mut conn, visitor_user_id)?;

        match (owner_circle, visitor_circle) {
            (Some(owner_circle), Some(visitor_circle)) => Ok(Some(ResolvedCircles {
                owner_user_id,
                owner_circle,
                visitor_user_id,
                visitor_circle,
            })),
            _ => Ok(None),
        }
    }

    /// Records an interview outcome: terminal success/failure, retry
    /// scheduling, cooldowns, and match/chat materialisation.
    pub async fn handle_mission_result(
        &self,
        mission_id: Uuid,
        result: MissionResult,
    ) -> CoreResult<Option<Mission>> {
        let pool = self.pool.clone();
        let max_attempts = self.config.mission_max_attempts;
        let outcome = tokio::task::spawn_blocking(move || -> CoreResult<Option<HandledMission>> {
            let mut conn = pool
                .get()
                .map_err(|e| CoreError::Transient(format!("db pool exhausted: {e}")))?;
            handle_mission_result_sync(&mut conn, mission_id, &result, max_attempts)
        })
        .await
        .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))??;

        let Some(outcome) = outcome else {
            return Ok(None);
        };

        match &outcome.transition {
            Transition::AlreadyTerminal => {}
            Transition::Retrying { .. } => {}
            Transition::FailedTerminal => {
                self.cooldown_store
                    .set(
                        outcome.mission.owner_user_id,
                        outcome.mission.visitor_user_id,
                        CooldownKind::Notified,
                        &self.cooldown_durations,
                    )
                    .await;
                self.release_lock(outcome.pair_circles, outcome.mission.id).await;
                self.retire_pair(outcome.pair_circles, outcome.mission.id).await;
                self.event_sink
                    .emit(
                        DomainEvent::MissionFailed(payloads::MissionFailed {
                            mission_id: outcome.mission.id,
                            owner_user_id: outcome.mission.owner_user_id,
                            visitor_user_id: outcome.mission.visitor_user_id,
                            attempt_number: outcome.mission.attempt_number,
                            reason: outcome.mission.failure_reason.clone().unwrap_or_default(),
                        }),
                        Some(outcome.mission.owner_user_id),
                    )
                    .await;
            }
            Transition::CompletedNoMatch => {
                self.cooldown_store
                    .set(
                        outcome.mission.owner_user_id,
                        outcome.mission.visitor_user_id,
                        CooldownKind::Notified,
                        &self.cooldown_durations,
                    )
                    .await;
                self.release_lock(outcome.pair_circles, outcome.mission.id).await;
                self.retire_pair(outcome.pair_circles, outcome.mission.id).await;
                self.event_sink
                    .emit(
                        DomainEvent::MissionCompleted(payloads::MissionCompleted {
                            mission_id: outcome.mission.id,
                            owner_user_id: outcome.mission.owner_user_id,
                            visitor_user_id: outcome.mission.visitor_user_id,
                            match_made: false,
                        }),
                        Some(outcome.mission.owner_user_id),
                    )
                    .await;
            }
            Transition::Matched { activated, chat_id, inverse_match_id, match_id } => {
                self.cooldown_store
                    .set(
                        outcome.mission.owner_user_id,
                        outcome.mission.visitor_user_id,
                        CooldownKind::Matched,
                        &self.cooldown_durations,
                    )
                    .await;
                self.release_lock(outcome.pair_circles, outcome.mission.id).await;
                self.retire_pair(outcome.pair_circles, outcome.mission.id).await;

                if *activated {
                    self.event_sink
                        .emit(
                            DomainEvent::MatchActivated(payloads::MatchActivated {
                                match_id: *match_id,
                                inverse_match_id: inverse_match_id.unwrap_or(*match_id),
                                user_a_id: outcome.mission.owner_user_id,
                                user_b_id: outcome.mission.visitor_user_id,
                                chat_id: chat_id.unwrap_or(*match_id),
                            }),
                            Some(outcome.mission.owner_user_id),
                        )
                        .await;
                } else {
                    self.event_sink
                        .emit(
                            DomainEvent::MatchCreated(payloads::MatchCreated {
                                match_id: *match_id,
                                primary_user_id: outcome.mission.owner_user_id,
                                secondary_user_id: outcome.mission.visitor_user_id,
                                worth_it_score: AGENT_WORTH_IT_SCORE,
                            }),
                            Some(outcome.mission.owner_user_id),
                        )
                        .await;
                }
            }
        }

        if let Transition::Retrying { distance_m } = outcome.transition {
            let owner_circle_snapshot = self
                .load_circle(outcome.mission.owner_circle_id)
                .await
                .map(|c| circle_snapshot(&c))
                .unwrap_or_else(|| serde_json::json!({ "circle_id": outcome.mission.owner_circle_id }));

            let job = MissionJob {
                mission_id: outcome.mission.id,
                owner_user_id: outcome.mission.owner_user_id,
                visitor_user_id: outcome.mission.visitor_user_id,
                owner_profile_snapshot: serde_json::json!({ "user_id": outcome.mission.owner_user_id }),
                visitor_profile_snapshot: serde_json::json!({ "user_id": outcome.mission.visitor_user_id }),
                owner_circle_snapshot,
                context: MissionContext {
                    approximate_time_iso: Utc::now(),
                    approximate_distance_m: distance_m,
                },
            };
            if let Err(e) = self.mission_queue.enqueue(&job).await {
                tracing::error!(error = %e, mission_id = %outcome.mission.id, "failed to re-enqueue retried mission");
            }
        }

        Ok(Some(outcome.mission))
    }

    async fn load_circle(&self, circle_id: Uuid) -> Option<Circle> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().ok()?;
            circles::table.find(circle_id).first::<Circle>(&mut conn).ok()
        })
        .await
        .ok()
        .flatten()
    }

    /// Releases the in-flight lock under the collision-event pair key —
    /// the ids the lock was acquired with, which may differ from the
    /// mission's resolved circles.
    async fn release_lock(&self, pair_circles: (Uuid, Uuid), mission_id: Uuid) {
        if let Err(e) = self
            .collision_store
            .release_in_flight_lock(pair_circles.0, pair_circles.1)
            .await
        {
            tracing::warn!(error = %e, mission_id = %mission_id, "failed to release in-flight lock");
        }
    }

    /// A terminal outcome leaves a cooldown overlaying the pair; the
    /// ephemeral pair record itself is retired. Re-detection after the
    /// cooldown expires starts a fresh observation period from scratch.
    async fn retire_pair(&self, pair_circles: (Uuid, Uuid), mission_id: Uuid) {
        if let Err(e) = self
            .collision_store
            .remove_pair(pair_circles.0, pair_circles.1)
            .await
        {
            tracing::debug!(error = %e, mission_id = %mission_id, "failed to retire collision pair");
        }
    }
}

/// Score recorded on matches the interview pipeline decides on its own;
/// the judge verdict is binary, so there is no upstream score to carry.
const AGENT_WORTH_IT_SCORE: f64 = 0.95;

struct ResolvedCircles {
    owner_user_id: Uuid,
    owner_circle: Circle,
    visitor_user_id: Uuid,
    visitor_circle: Circle,
}

fn circle_snapshot(circle: &Circle) -> serde_json::Value {
    serde_json::json!({
        "circle_id": circle.id,
        "objective": circle.objective,
        "radius_meters": circle.radius_meters,
    })
}

/// Deterministic key for `pg_advisory_xact_lock`, stable regardless of which
/// side of the pair calls in first.
fn pair_lock_key(a: Uuid, b: Uuid) -> i64 {
    let (lo, hi) = canonical_pair(a, b);
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    lo.hash(&mut hasher);
    hi.hash(&mut hasher);
    hasher.finish() as i64
}

fn most_recent_active_circle(conn: &mut PgConnection, user_id: Uuid) -> CoreResult<Option<Circle>> {
    let now = Utc::now();
    circles::table
        .filter(circles::owner_user_id.eq(user_id))
        .filter(circles::status.eq("active"))
        .filter(circles::start_at.le(now))
        .filter(circles::expires_at.is_null().or(circles::expires_at.gt(now)))
        .order(circles::created_at.desc())
        .first::<Circle>(conn)
        .optional()
        .map_err(CoreError::Database)
}

/// The canonical circle pair a mission's collision event was recorded
/// under — the key its in-flight lock and ephemeral pair live at. Falls
/// back to the mission's resolved circles if the event row is gone.
fn collision_pair_circles(conn: &mut PgConnection, mission: &Mission) -> (Uuid, Uuid) {
    collision_events::table
        .find(mission.collision_event_id)
        .select((collision_events::circle1_id, collision_events::circle2_id))
        .first(conn)
        .unwrap_or((mission.owner_circle_id, mission.visitor_circle_id))
}

/// Resolves the durable collision-event row a new mission should attach to.
///
/// Returns `Ok(None)` when the pair's current row already points at a
/// non-terminal mission — the signal for a duplicate promoter to back off.
/// A row whose mission already finished describes a completed lifecycle, so
/// it is retired to `expired` and a fresh row opens the next observation
/// period; this is also what keeps a terminally-failed mission from ever
/// gaining a successor on the same collision event.
fn resolve_collision_event(
    conn: &mut PgConnection,
    circle1_id: Uuid,
    circle2_id: Uuid,
    user1_id: Uuid,
    user2_id: Uuid,
    distance_meters: f64,
) -> CoreResult<Option<Uuid>> {
    let existing: Option<(Uuid, Option<Uuid>)> = collision_events::table
        .filter(collision_events::circle1_id.eq(circle1_id))
        .filter(collision_events::circle2_id.eq(circle2_id))
        .filter(collision_events::status.ne(CollisionStatus::Expired.as_str()))
        .order(collision_events::created_at.desc())
        .select((collision_events::id, collision_events::mission_id))
        .first(conn)
        .optional()
        .map_err(CoreError::Database)?;

    match existing {
        Some((id, None)) => return Ok(Some(id)),
        Some((id, Some(mission_id))) => {
            let status: Option<String> = missions::table
                .find(mission_id)
                .select(missions::status)
                .first(conn)
                .optional()
                .map_err(CoreError::Database)?;
            let terminal = matches!(
                status.as_deref(),
                None | Some("completed") | Some("failed")
            );
            if !terminal {
                return Ok(None);
            }
            diesel::update(collision_events::table.find(id))
                .set(collision_events::status.eq(CollisionStatus::Expired.as_str()))
                .execute(conn)
                .map_err(CoreError::Database)?;
        }
        None => {}
    }

    let now = Utc::now();
    let row = NewCollisionEvent {
        id: Uuid::now_v7(),
        user1_id,
        user2_id,
        circle1_id,
        circle2_id,
        distance_meters,
        status: CollisionStatus::Stable.as_str().to_string(),
        first_seen_at: now,
        last_seen_at: now,
    };
    diesel::insert_into(collision_events::table)
        .values(&row)
        .returning(collision_events::id)
        .get_result(conn)
        .map(Some)
        .map_err(CoreError::Database)
}

enum Transition {
    /// Result for a mission that was already terminal: pure no-op, no
    /// cooldown refresh, no duplicate events.
    AlreadyTerminal,
    Retrying {
        distance_m: f64,
    },
    FailedTerminal,
    CompletedNoMatch,
    Matched {
        activated: bool,
        chat_id: Option<Uuid>,
        inverse_match_id: Option<Uuid>,
        match_id: Uuid,
    },
}

struct HandledMission {
    mission: Mission,
    /// The canonical circle pair the in-flight lock and ephemeral
    /// `CollisionPair` are keyed on. Taken from the collision-event row, not
    /// the mission's resolved circles: circle resolution at creation time
    /// may have picked different circles than the ones that collided, and
    /// releasing under the resolved ids would strand the real lock.
    pair_circles: (Uuid, Uuid),
    transition: Transition,
}

fn handle_mission_result_sync(
    conn: &mut PgConnection,
    mission_id: Uuid,
    result: &MissionResult,
    max_attempts: i32,
) -> CoreResult<Option<HandledMission>> {
    let mission: Option<Mission> = missions::table
        .find(mission_id)
        .first(conn)
        .optional()
        .map_err(CoreError::Database)?;
    let Some(mission) = mission else {
        return Ok(None);
    };

    let pair_circles = collision_pair_circles(conn, &mission);

    if mission.status == MissionStatus::Completed.as_str() || mission.status == MissionStatus::Failed.as_str() {
        // Already terminal: a redelivered or duplicate result is a no-op.
        return Ok(Some(HandledMission {
            transition: Transition::AlreadyTerminal,
            pair_circles,
            mission,
        }));
    }

    if !result.success {
        return handle_failure(conn, mission, pair_circles, result, max_attempts);
    }

    if !result.match_made {
        let updated: Mission = diesel::update(missions::table.find(mission.id))
            .set((
                missions::status.eq(MissionStatus::Completed.as_str()),
                missions::transcript.eq(&result.transcript),
                missions::judge_decision.eq(&result.judge_decision),
                missions::completed_at.eq(Utc::now()),
            ))
            .get_result(conn)
            .map_err(CoreError::Database)?;
        return Ok(Some(HandledMission {
            mission: updated,
            pair_circles,
            transition: Transition::CompletedNoMatch,
        }));
    }

    conn.transaction(|conn| -> CoreResult<Option<HandledMission>> {
        let updated: Mission = diesel::update(missions::table.find(mission.id))
            .set((
                missions::status.eq(MissionStatus::Completed.as_str()),
                missions::transcript.eq(&result.transcript),
                missions::judge_decision.eq(&result.judge_decision),
                missions::completed_at.eq(Utc::now()),
            ))
            .get_result(conn)
            .map_err(CoreError::Database)?;

        // Serialize both directions of a symmetric mission completion on the
        // same unordered pair so one of them always observes the other's
        // insert. A plain `FOR UPDATE` on the match read can't do this by
        // itself: when neither direction has inserted yet there is no row to
        // lock, so both sides would still read "no inverse" and both insert
        // a pending_accept row.
        diesel::sql_query("SELECT pg_advisory_xact_lock($1)")
            .bind::<BigInt, _>(pair_lock_key(updated.owner_user_id, updated.visitor_user_id))
            .execute(conn)
            .map_err(CoreError::Database)?;

        let existing = MatchStore::find_by_unordered_pair(conn, updated.owner_user_id, updated.visitor_user_id)?;

        let own_direction = existing
            .iter()
            .find(|m| m.primary_user_id == updated.owner_user_id && m.secondary_user_id == updated.visitor_user_id)
            .cloned();
        let inverse_direction = existing
            .iter()
            .find(|m| m.primary_user_id == updated.visitor_user_id && m.secondary_user_id == updated.owner_user_id)
            .cloned();

        let transition = if let Some(inverse) = inverse_direction {
            let activated_inverse = MatchStore::activate(conn, inverse.id)?;
            let own = match own_direction {
                Some(m) => MatchStore::activate(conn, m.id)?,
                None => MatchStore::create(
                    conn,
                    &NewMatch {
                        id: Uuid::now_v7(),
                        primary_user_id: updated.owner_user_id,
                        secondary_user_id: updated.visitor_user_id,
                        primary_circle_id: updated.owner_circle_id,
                        secondary_circle_id: updated.visitor_circle_id,
                        match_type: MatchKind::Match.as_str().to_string(),
                        worth_it_score: AGENT_WORTH_IT_SCORE,
                        status: MatchStatus::Active.as_str().to_string(),
                        collision_event_id: Some(updated.collision_event_id),
                    },
                )?,
            };
            let chat = MatchStore::upsert_chat_for_pair(conn, updated.owner_user_id, updated.visitor_user_id)?;

            Transition::Matched {
                activated: true,
                chat_id: Some(chat.id),
                inverse_match_id: Some(activated_inverse.id),
                match_id: own.id,
            }
        } else if let Some(own) = own_direction {
            // Redelivery of an already-created result: nothing new to do.
            Transition::Matched {
                activated: own.status == MatchStatus::Active.as_str(),
                chat_id: None,
                inverse_match_id: None,
                match_id: own.id,
            }
        } else {
            let own = MatchStore::create(
                conn,
                &NewMatch {
                    id: Uuid::now_v7(),
                    primary_user_id: updated.owner_user_id,
                    secondary_user_id: updated.visitor_user_id,
                    primary_circle_id: updated.owner_circle_id,
                    secondary_circle_id: updated.visitor_circle_id,
                    match_type: MatchKind::Match.as_str().to_string(),
                    worth_it_score: AGENT_WORTH_IT_SCORE,
                    status: MatchStatus::PendingAccept.as_str().to_string(),
                    collision_event_id: Some(updated.collision_event_id),
                },
            )?;
            Transition::Matched {
                activated: false,
                chat_id: None,
                inverse_match_id: None,
                match_id: own.id,
            }
        };

        Ok(Some(HandledMission {
            mission: updated,
            pair_circles,
            transition,
        }))
    })
}

fn handle_failure(
    conn: &mut PgConnection,
    mission: Mission,
    pair_circles: (Uuid, Uuid),
    result: &MissionResult,
    max_attempts: i32,
) -> CoreResult<Option<HandledMission>> {
    if mission.attempt_number < max_attempts {
        // Partial transcripts are kept across retries for diagnostics; the
        // next attempt starts from an empty conversation regardless.
        let updated: Mission = diesel::update(missions::table.find(mission.id))
            .set((
                missions::status.eq(MissionStatus::Pending.as_str()),
                missions::attempt_number.eq(mission.attempt_number + 1),
                missions::transcript.eq(&result.transcript),
                missions::failure_reason.eq(&result.error),
            ))
            .get_result(conn)
            .map_err(CoreError::Database)?;

        let distance_m: f64 = collision_events::table
            .find(updated.collision_event_id)
            .select(collision_events::distance_meters)
            .first(conn)
            .unwrap_or(0.0);

        return Ok(Some(HandledMission {
            mission: updated,
            pair_circles,
            transition: Transition::Retrying { distance_m },
        }));
    }

    let updated: Mission = diesel::update(missions::table.find(mission.id))
        .set((
            missions::status.eq(MissionStatus::Failed.as_str()),
            missions::transcript.eq(&result.transcript),
            missions::failure_reason.eq(&result.error),
            missions::completed_at.eq(Utc::now()),
        ))
        .get_result(conn)
        .map_err(CoreError::Database)?;
    Ok(Some(HandledMission {
        mission: updated,
        pair_circles,
        transition: Transition::FailedTerminal,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::store::InMemoryCollisionStateStore;
    use crate::cooldown::InMemoryCooldownStore;
    use crate::events::RecordingEventSink;
    use crate::mission::queue::InMemoryMissionQueue;
    use diesel::r2d2::{ConnectionManager, Pool};

    /// Pool that never connects; fine for paths that return before any
    /// database access, and fails fast for paths that do reach one.
    fn lazy_pool() -> DbPool {
        let manager = ConnectionManager::<PgConnection>::new("postgres://unused.invalid/unused");
        Pool::builder()
            .max_size(1)
            .min_idle(Some(0))
            .connection_timeout(std::time::Duration::from_millis(100))
            .build_unchecked(manager)
    }

    fn durations() -> CooldownDurations {
        CooldownDurations {
            matched_secs: 14 * 24 * 3600,
            rejected_secs: 24 * 3600,
            notified_secs: 3600,
        }
    }

    fn sample_pair() -> CollisionPair {
        let now = Utc::now();
        CollisionPair {
            circle1_id: Uuid::new_v4(),
            circle2_id: Uuid::new_v4(),
            user1_id: Uuid::new_v4(),
            user2_id: Uuid::new_v4(),
            distance_meters: 42.0,
            first_seen_at: now,
            last_seen_at: now,
            status: CollisionStatus::Detecting,
        }
    }

    fn orchestrator(
        collision_store: Arc<InMemoryCollisionStateStore>,
        cooldown_store: Arc<InMemoryCooldownStore>,
    ) -> MissionOrchestrator {
        MissionOrchestrator::new(
            lazy_pool(),
            collision_store,
            cooldown_store,
            durations(),
            Arc::new(InMemoryMissionQueue::new()),
            Arc::new(RecordingEventSink::new()),
            OrchestratorConfig {
                in_flight_ttl_secs: 60,
                mission_max_attempts: 3,
                queue_highwater: 1000,
            },
        )
    }

    #[tokio::test]
    async fn held_lock_short_circuits_to_none() {
        let collision_store = Arc::new(InMemoryCollisionStateStore::new());
        let cooldowns = Arc::new(InMemoryCooldownStore::new());
        let pair = sample_pair();

        collision_store
            .try_acquire_in_flight_lock(pair.circle1_id, pair.circle2_id, 60)
            .await
            .unwrap();

        let orch = orchestrator(collision_store, cooldowns);
        let created = orch.create_mission_for_collision(&pair).await.unwrap();
        assert!(created.is_none());
    }

    #[tokio::test]
    async fn active_cooldown_skips_and_releases_the_lock() {
        let collision_store = Arc::new(InMemoryCollisionStateStore::new());
        let cooldowns = Arc::new(InMemoryCooldownStore::new());
        let pair = sample_pair();

        cooldowns
            .set(pair.user1_id, pair.user2_id, CooldownKind::Notified, &durations())
            .await;

        let orch = orchestrator(collision_store.clone(), cooldowns);
        let created = orch.create_mission_for_collision(&pair).await.unwrap();
        assert!(created.is_none());

        // The lock must be free again for the next observation period.
        assert!(collision_store
            .try_acquire_in_flight_lock(pair.circle1_id, pair.circle2_id, 60)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn infrastructure_failure_after_the_lock_releases_it() {
        let collision_store = Arc::new(InMemoryCollisionStateStore::new());
        let cooldowns = Arc::new(InMemoryCooldownStore::new());
        let pair = sample_pair();

        // No cooldown, so creation proceeds to circle resolution, which
        // fails against the never-connecting pool.
        let orch = orchestrator(collision_store.clone(), cooldowns);
        let outcome = orch.create_mission_for_collision(&pair).await;
        assert!(outcome.is_err());

        assert!(collision_store
            .try_acquire_in_flight_lock(pair.circle1_id, pair.circle2_id, 60)
            .await
            .unwrap());
    }

    #[test]
    fn canonical_pair_used_for_cooldown_lookup_is_symmetric() {
        let a = Uuid::from_u128(9);
        let b = Uuid::from_u128(3);
        assert_eq!(canonical_pair(a, b), canonical_pair(b, a));
    }

    #[test]
    fn pair_lock_key_is_direction_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(pair_lock_key(a, b), pair_lock_key(b, a));
    }
}
