use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::message::Delivery;
use lapin::options::BasicAckOptions;
use matchcore_shared::clients::rabbitmq::RabbitMqClient;
use matchcore_shared::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

const QUEUE_NAME: &str = "matchcore.missions";
const ROUTING_KEY: &str = "matchcore.mission.job";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionContext {
    pub approximate_time_iso: DateTime<Utc>,
    pub approximate_distance_m: f64,
}

/// The wire payload consumed by `InterviewRunner`. Profile data is owned by
/// an external service this core never reaches over the network in this
/// deployment, so snapshots are opaque JSON blobs the orchestrator fills in
/// from whatever it has on hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionJob {
    pub mission_id: Uuid,
    pub owner_user_id: Uuid,
    pub visitor_user_id: Uuid,
    pub owner_profile_snapshot: serde_json::Value,
    pub visitor_profile_snapshot: serde_json::Value,
    pub owner_circle_snapshot: serde_json::Value,
    pub context: MissionContext,
}

/// A dequeued job plus whatever is needed to acknowledge it once processing
/// completes successfully. Redelivery is tolerated: a worker that crashes
/// mid-job simply lets the broker redeliver, and the runner's own status
/// check at the top of the job makes that safe.
pub struct DequeuedJob {
    pub job: MissionJob,
    ack_token: Uuid,
}

#[async_trait]
pub trait MissionQueue: Send + Sync {
    async fn enqueue(&self, job: &MissionJob) -> CoreResult<()>;
    async fn dequeue(&self) -> CoreResult<Option<DequeuedJob>>;
    async fn ack(&self, dequeued: DequeuedJob) -> CoreResult<()>;
    /// Current backlog, if the transport can report one. `None` means
    /// unknown; callers treat that as "not over the highwater mark".
    async fn depth(&self) -> CoreResult<Option<u64>>;
}

pub struct RabbitMqMissionQueue {
    rabbitmq: RabbitMqClient,
    consumer: Mutex<lapin::Consumer>,
    pending: Mutex<HashMap<Uuid, Delivery>>,
}

impl RabbitMqMissionQueue {
    pub async fn new(rabbitmq: RabbitMqClient) -> Result<Self, lapin::Error> {
        let consumer = rabbitmq.subscribe(QUEUE_NAME, &[ROUTING_KEY]).await?;
        Ok(Self {
            rabbitmq,
            consumer: Mutex::new(consumer),
            pending: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl MissionQueue for RabbitMqMissionQueue {
    async fn enqueue(&self, job: &MissionJob) -> CoreResult<()> {
        let payload = serde_json::to_vec(job).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        self.rabbitmq
            .publish_raw(ROUTING_KEY, &payload)
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))
    }

    async fn dequeue(&self) -> CoreResult<Option<DequeuedJob>> {
        use futures_lite::StreamExt;

        let mut consumer = self.consumer.lock().await;
        let delivery = match consumer.next().await {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => return Err(CoreError::Transient(e.to_string())),
            None => return Ok(None),
        };
        drop(consumer);

        let job: MissionJob = serde_json::from_slice(&delivery.data)
            .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        let ack_token = job.mission_id;
        self.pending.lock().await.insert(ack_token, delivery);

        Ok(Some(DequeuedJob { job, ack_token }))
    }

    async fn ack(&self, dequeued: DequeuedJob) -> CoreResult<()> {
        let delivery = self.pending.lock().await.remove(&dequeued.ack_token);
        if let Some(delivery) = delivery {
            delivery
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| CoreError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    async fn depth(&self) -> CoreResult<Option<u64>> {
        // A passive declare of an existing queue is a metadata read; the
        // broker answers with the current message count.
        let queue = self
            .rabbitmq
            .channel()
            .queue_declare(
                QUEUE_NAME,
                lapin::options::QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;
        Ok(Some(queue.message_count() as u64))
    }
}

/// In-memory fake used by orchestration tests that need a queue without a
/// broker.
#[derive(Default)]
pub struct InMemoryMissionQueue {
    jobs: Mutex<VecDeque<MissionJob>>,
}

impl InMemoryMissionQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MissionQueue for InMemoryMissionQueue {
    async fn enqueue(&self, job: &MissionJob) -> CoreResult<()> {
        self.jobs.lock().await.push_back(job.clone());
        Ok(())
    }

    async fn dequeue(&self) -> CoreResult<Option<DequeuedJob>> {
        let job = self.jobs.lock().await.pop_front();
        Ok(job.map(|job| DequeuedJob {
            ack_token: job.mission_id,
            job,
        }))
    }

    async fn ack(&self, _dequeued: DequeuedJob) -> CoreResult<()> {
        Ok(())
    }

    async fn depth(&self) -> CoreResult<Option<u64>> {
        Ok(Some(self.jobs.lock().await.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> MissionJob {
        MissionJob {
            mission_id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            visitor_user_id: Uuid::new_v4(),
            owner_profile_snapshot: serde_json::json!({}),
            visitor_profile_snapshot: serde_json::json!({}),
            owner_circle_snapshot: serde_json::json!({}),
            context: MissionContext {
                approximate_time_iso: Utc::now(),
                approximate_distance_m: 42.0,
            },
        }
    }

    #[tokio::test]
    async fn depth_increments_by_exactly_one_per_enqueue() {
        let queue = InMemoryMissionQueue::new();
        queue.enqueue(&sample_job()).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn dequeue_returns_jobs_in_fifo_order() {
        let queue = InMemoryMissionQueue::new();
        let first = sample_job();
        let second = sample_job();
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        let dequeued = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(dequeued.job.mission_id, first.mission_id);
        queue.ack(dequeued).await.unwrap();

        let dequeued = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(dequeued.job.mission_id, second.mission_id);
    }
}
