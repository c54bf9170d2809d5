pub mod publisher;

pub use publisher::{DomainEvent, EventSink, RabbitMqEventSink, RecordingEventSink};
