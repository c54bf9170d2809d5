use std::time::Duration;

use chrono::Utc;
use diesel::prelude::*;
use matchcore_shared::clients::db::DbPool;
use matchcore_shared::{CoreError, CoreResult};
use std::sync::Arc;

use crate::models::{CollisionStatus, MatchStatus};
use crate::schema::{collision_events, matches};

pub struct JanitorConfig {
    pub tick_interval: Duration,
    pub collision_expiry_secs: i64,
    pub match_pending_expiry_secs: i64,
}

/// Periodic sweep over the durable stores. Unlike `StabilityWorker`,
/// which only touches ephemeral state plus its own promotions, the janitor
/// only ever moves rows into a terminal `expired` state, so duplicate
/// instances running concurrently are harmless.
pub struct Janitor {
    pool: DbPool,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(pool: DbPool, config: JanitorConfig) -> Self {
        Self { pool, config }
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick_interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.tick() {
                    tracing::error!(error = %e, "janitor tick failed");
                }
            }
        });
    }

    fn tick(&self) -> CoreResult<()> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| CoreError::Transient(format!("db pool exhausted: {e}")))?;

        let collision_cutoff = Utc::now() - chrono::Duration::seconds(self.config.collision_expiry_secs);
        let expired_collisions = diesel::update(
            collision_events::table
                .filter(collision_events::created_at.lt(collision_cutoff))
                .filter(
                    collision_events::status
                        .ne(CollisionStatus::Expired.as_str())
                        .and(collision_events::status.ne(CollisionStatus::Matched.as_str())),
                ),
        )
        .set(collision_events::status.eq(CollisionStatus::Expired.as_str()))
        .execute(&mut conn)
        .map_err(CoreError::Database)?;

        let match_cutoff = Utc::now() - chrono::Duration::seconds(self.config.match_pending_expiry_secs);
        let expired_matches = diesel::update(
            matches::table
                .filter(matches::status.eq(MatchStatus::PendingAccept.as_str()))
                .filter(matches::created_at.lt(match_cutoff)),
        )
        .set(matches::status.eq(MatchStatus::Expired.as_str()))
        .execute(&mut conn)
        .map_err(CoreError::Database)?;

        if expired_collisions > 0 || expired_matches > 0 {
            tracing::info!(expired_collisions, expired_matches, "janitor sweep complete");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds_match_the_documented_windows() {
        let config = JanitorConfig {
            tick_interval: Duration::from_secs(600),
            collision_expiry_secs: 48 * 3600,
            match_pending_expiry_secs: 24 * 3600,
        };
        assert_eq!(config.collision_expiry_secs, 172_800);
        assert_eq!(config.match_pending_expiry_secs, 86_400);
    }
}
