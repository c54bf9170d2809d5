use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event envelope published onto the shared topic exchange.
///
/// Routing key format: `matchcore.{domain}.{action}`
/// Example: `matchcore.mission.started`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T: Serialize> {
    pub id: Uuid,
    pub source: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub data: T,
}

impl<T: Serialize> Event<T> {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: T) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            user_id: None,
            data,
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// Routing keys for the matchmaking-core event taxonomy.
pub mod routing_keys {
    pub const COLLISION_DETECTED: &str = "matchcore.collision.detected";

    pub const MISSION_STARTED: &str = "matchcore.mission.started";
    pub const MISSION_COMPLETED: &str = "matchcore.mission.completed";
    pub const MISSION_FAILED: &str = "matchcore.mission.failed";

    pub const MATCH_CREATED: &str = "matchcore.match.created";
    pub const MATCH_ACTIVATED: &str = "matchcore.match.activated";

    pub const CONVERSATION_STARTED: &str = "matchcore.conversation.started";
    pub const CONVERSATION_THINKING_STARTED: &str = "matchcore.conversation.thinking_started";
    pub const CONVERSATION_TURN_COMPLETED: &str = "matchcore.conversation.turn_completed";
    pub const CONVERSATION_THINKING_COMPLETED: &str = "matchcore.conversation.thinking_completed";
    pub const CONVERSATION_JUDGE_DECISION: &str = "matchcore.conversation.judge_decision";
    pub const CONVERSATION_COMPLETED: &str = "matchcore.conversation.completed";
}

/// Event data payloads, one per routing key above.
pub mod payloads {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CollisionDetected {
        pub user_a_id: Uuid,
        pub user_b_id: Uuid,
        pub circle_a_id: Uuid,
        pub circle_b_id: Uuid,
        pub distance_meters: f64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MissionStarted {
        pub mission_id: Uuid,
        pub owner_user_id: Uuid,
        pub visitor_user_id: Uuid,
        pub attempt_number: i32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MissionCompleted {
        pub mission_id: Uuid,
        pub owner_user_id: Uuid,
        pub visitor_user_id: Uuid,
        pub match_made: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MissionFailed {
        pub mission_id: Uuid,
        pub owner_user_id: Uuid,
        pub visitor_user_id: Uuid,
        pub attempt_number: i32,
        pub reason: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MatchCreated {
        pub match_id: Uuid,
        pub primary_user_id: Uuid,
        pub secondary_user_id: Uuid,
        pub worth_it_score: f64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MatchActivated {
        pub match_id: Uuid,
        pub inverse_match_id: Uuid,
        pub user_a_id: Uuid,
        pub user_b_id: Uuid,
        pub chat_id: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ConversationStarted {
        pub mission_id: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ConversationThinkingStarted {
        pub mission_id: Uuid,
        pub turn_index: u32,
        pub speaker: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ConversationTurnCompleted {
        pub mission_id: Uuid,
        pub turn_index: u32,
        pub speaker: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ConversationThinkingCompleted {
        pub mission_id: Uuid,
        pub turn_index: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ConversationJudgeDecision {
        pub mission_id: Uuid,
        pub should_notify: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ConversationCompleted {
        pub mission_id: Uuid,
        pub turn_count: u32,
    }
}
