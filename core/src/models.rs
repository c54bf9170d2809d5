use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{chats, circles, collision_events, matches, missions, users};

// --- User (position-owning slice only; profile columns belong to another service) ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = users)]
pub struct UserPositionUpdate {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

// --- Circle (read-only from this core's perspective) ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = circles)]
pub struct Circle {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub objective: String,
    pub radius_meters: f64,
    pub start_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Circle {
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.status == "active"
            && self.start_at <= now
            && self.expires_at.map(|exp| now < exp).unwrap_or(true)
    }
}

// --- CollisionEvent (durable mirror of the ephemeral Redis CollisionPair) ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = collision_events)]
pub struct CollisionEvent {
    pub id: Uuid,
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    pub circle1_id: Uuid,
    pub circle2_id: Uuid,
    pub distance_meters: f64,
    pub status: String,
    pub mission_id: Option<Uuid>,
    pub match_id: Option<Uuid>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = collision_events)]
pub struct NewCollisionEvent {
    pub id: Uuid,
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    pub circle1_id: Uuid,
    pub circle2_id: Uuid,
    pub distance_meters: f64,
    pub status: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

// --- Mission ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = missions)]
pub struct Mission {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub visitor_user_id: Uuid,
    pub owner_circle_id: Uuid,
    pub visitor_circle_id: Uuid,
    pub collision_event_id: Uuid,
    pub status: String,
    pub attempt_number: i32,
    /// Set when the mission queue was over its highwater mark at creation
    /// time; a supervisor can use it to throttle acceptance.
    pub backpressure: bool,
    pub transcript: serde_json::Value,
    pub judge_decision: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = missions)]
pub struct NewMission {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub visitor_user_id: Uuid,
    pub owner_circle_id: Uuid,
    pub visitor_circle_id: Uuid,
    pub collision_event_id: Uuid,
    pub status: String,
    pub attempt_number: i32,
    pub backpressure: bool,
    pub transcript: serde_json::Value,
}

// --- Match ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = matches)]
pub struct Match {
    pub id: Uuid,
    pub primary_user_id: Uuid,
    pub secondary_user_id: Uuid,
    pub primary_circle_id: Uuid,
    pub secondary_circle_id: Uuid,
    pub match_type: String,
    pub worth_it_score: f64,
    pub status: String,
    pub collision_event_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = matches)]
pub struct NewMatch {
    pub id: Uuid,
    pub primary_user_id: Uuid,
    pub secondary_user_id: Uuid,
    pub primary_circle_id: Uuid,
    pub secondary_circle_id: Uuid,
    pub match_type: String,
    pub worth_it_score: f64,
    pub status: String,
    pub collision_event_id: Option<Uuid>,
}

// --- Chat ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = chats)]
pub struct Chat {
    pub id: Uuid,
    pub user_a_id: Uuid,
    pub user_b_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = chats)]
pub struct NewChat {
    pub id: Uuid,
    pub user_a_id: Uuid,
    pub user_b_id: Uuid,
}

// --- Domain enums shared by orchestration logic; DB columns store their
// `as_str()` form as plain text, matching the platform's string-status
// convention (see e.g. livecam_requests.status in the sibling service). ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollisionStatus {
    Detecting,
    Stable,
    MissionCreated,
    Matched,
    Cooldown,
    Expired,
}

impl CollisionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detecting => "detecting",
            Self::Stable => "stable",
            Self::MissionCreated => "mission_created",
            Self::Matched => "matched",
            Self::Cooldown => "cooldown",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "detecting" => Self::Detecting,
            "stable" => Self::Stable,
            "mission_created" => Self::MissionCreated,
            "matched" => Self::Matched,
            "cooldown" => Self::Cooldown,
            "expired" => Self::Expired,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl MissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    PendingAccept,
    Active,
    Declined,
    Expired,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingAccept => "pending_accept",
            Self::Active => "active",
            Self::Declined => "declined",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
    Match,
    SoftMatch,
}

impl MatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::SoftMatch => "soft_match",
        }
    }
}

/// Unordered-pair key used everywhere a cooldown, history, or pair lock is
/// addressed: always the lexicographically smaller id first.
pub fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_pair_is_order_independent() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        assert_eq!(canonical_pair(a, b), canonical_pair(b, a));
    }

    #[test]
    fn circle_is_not_effective_before_start() {
        let now = Utc::now();
        let circle = Circle {
            id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            objective: "coffee".into(),
            radius_meters: 100.0,
            start_at: now + chrono::Duration::seconds(60),
            expires_at: None,
            status: "active".into(),
            created_at: now,
        };
        assert!(!circle.is_effective(now));
    }

    #[test]
    fn circle_is_not_effective_when_paused() {
        let now = Utc::now();
        let circle = Circle {
            id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            objective: "coffee".into(),
            radius_meters: 100.0,
            start_at: now - chrono::Duration::seconds(60),
            expires_at: None,
            status: "paused".into(),
            created_at: now,
        };
        assert!(!circle.is_effective(now));
    }
}
