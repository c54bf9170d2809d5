use async_trait::async_trait;
use matchcore_shared::clients::rabbitmq::RabbitMqClient;
use matchcore_shared::types::event::{payloads, routing_keys, Event};
use std::sync::Mutex;
use uuid::Uuid;

/// The full event taxonomy this core emits. Carrying the payload
/// inline keeps `EventSink::emit` a plain, object-safe trait method instead
/// of a generic one.
pub enum DomainEvent {
    CollisionDetected(payloads::CollisionDetected),
    MissionStarted(payloads::MissionStarted),
    MissionCompleted(payloads::MissionCompleted),
    MissionFailed(payloads::MissionFailed),
    MatchCreated(payloads::MatchCreated),
    MatchActivated(payloads::MatchActivated),
    ConversationStarted(payloads::ConversationStarted),
    ConversationThinkingStarted(payloads::ConversationThinkingStarted),
    ConversationTurnCompleted(payloads::ConversationTurnCompleted),
    ConversationThinkingCompleted(payloads::ConversationThinkingCompleted),
    ConversationJudgeDecision(payloads::ConversationJudgeDecision),
    ConversationCompleted(payloads::ConversationCompleted),
}

impl DomainEvent {
    fn routing_key(&self) -> &'static str {
        match self {
            Self::CollisionDetected(_) => routing_keys::COLLISION_DETECTED,
            Self::MissionStarted(_) => routing_keys::MISSION_STARTED,
            Self::MissionCompleted(_) => routing_keys::MISSION_COMPLETED,
            Self::MissionFailed(_) => routing_keys::MISSION_FAILED,
            Self::MatchCreated(_) => routing_keys::MATCH_CREATED,
            Self::MatchActivated(_) => routing_keys::MATCH_ACTIVATED,
            Self::ConversationStarted(_) => routing_keys::CONVERSATION_STARTED,
            Self::ConversationThinkingStarted(_) => routing_keys::CONVERSATION_THINKING_STARTED,
            Self::ConversationTurnCompleted(_) => routing_keys::CONVERSATION_TURN_COMPLETED,
            Self::ConversationThinkingCompleted(_) => routing_keys::CONVERSATION_THINKING_COMPLETED,
            Self::ConversationJudgeDecision(_) => routing_keys::CONVERSATION_JUDGE_DECISION,
            Self::ConversationCompleted(_) => routing_keys::CONVERSATION_COMPLETED,
        }
    }

    fn data(&self) -> serde_json::Value {
        match self {
            Self::CollisionDetected(p) => serde_json::to_value(p),
            Self::MissionStarted(p) => serde_json::to_value(p),
            Self::MissionCompleted(p) => serde_json::to_value(p),
            Self::MissionFailed(p) => serde_json::to_value(p),
            Self::MatchCreated(p) => serde_json::to_value(p),
            Self::MatchActivated(p) => serde_json::to_value(p),
            Self::ConversationStarted(p) => serde_json::to_value(p),
            Self::ConversationThinkingStarted(p) => serde_json::to_value(p),
            Self::ConversationTurnCompleted(p) => serde_json::to_value(p),
            Self::ConversationThinkingCompleted(p) => serde_json::to_value(p),
            Self::ConversationJudgeDecision(p) => serde_json::to_value(p),
            Self::ConversationCompleted(p) => serde_json::to_value(p),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}

/// Fire-and-forget lifecycle events for external observers. A
/// broker outage must never propagate to the caller — implementations log
/// and swallow.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: DomainEvent, user_id: Option<Uuid>);
}

pub struct RabbitMqEventSink {
    rabbitmq: RabbitMqClient,
}

impl RabbitMqEventSink {
    pub fn new(rabbitmq: RabbitMqClient) -> Self {
        Self { rabbitmq }
    }
}

#[async_trait]
impl EventSink for RabbitMqEventSink {
    async fn emit(&self, event: DomainEvent, user_id: Option<Uuid>) {
        let routing_key = event.routing_key();
        let mut envelope = Event::new("matchcore", routing_key, event.data());
        if let Some(uid) = user_id {
            envelope = envelope.with_user(uid);
        }

        if let Err(e) = self.rabbitmq.publish(routing_key, &envelope).await {
            tracing::error!(error = %e, routing_key = %routing_key, "failed to publish event");
        }
    }
}

/// In-memory fake recording every emitted event, used by orchestration unit
/// tests to assert on the event taxonomy without a live broker.
#[derive(Default)]
pub struct RecordingEventSink {
    pub emitted: Mutex<Vec<(&'static str, serde_json::Value, Option<Uuid>)>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routing_keys(&self) -> Vec<&'static str> {
        self.emitted.lock().unwrap().iter().map(|(k, _, _)| *k).collect()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn emit(&self, event: DomainEvent, user_id: Option<Uuid>) {
        let routing_key = event.routing_key();
        let data = event.data();
        self.emitted.lock().unwrap().push((routing_key, data, user_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_sink_captures_routing_key() {
        let sink = RecordingEventSink::new();
        sink.emit(
            DomainEvent::CollisionDetected(payloads::CollisionDetected {
                user_a_id: Uuid::new_v4(),
                user_b_id: Uuid::new_v4(),
                circle_a_id: Uuid::new_v4(),
                circle_b_id: Uuid::new_v4(),
                distance_meters: 12.0,
            }),
            None,
        )
        .await;

        assert_eq!(sink.routing_keys(), vec![routing_keys::COLLISION_DETECTED]);
    }
}
