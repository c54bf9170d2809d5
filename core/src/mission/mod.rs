pub mod orchestrator;
pub mod queue;

pub use orchestrator::{MissionOrchestrator, MissionResult, OrchestratorConfig};
pub use queue::{DequeuedJob, InMemoryMissionQueue, MissionContext, MissionJob, MissionQueue, RabbitMqMissionQueue};
