use std::sync::{Arc, Mutex};
use std::time::Duration;

use diesel::prelude::*;
use matchcore_shared::clients::db::DbPool;
use matchcore_shared::types::event::payloads;
use matchcore_shared::{CoreError, CoreResult};
use uuid::Uuid;

use crate::events::{DomainEvent, EventSink};
use crate::interview::generator::{GenerationParams, TextGenerator};
use crate::interview::judge::{Judge, JudgeDecision};
use crate::interview::prompt::{build_prompt, CircleSnapshot, InterviewContext, ProfileSnapshot, TranscriptTurn, TurnGoal};
use crate::mission::orchestrator::{MissionOrchestrator, MissionResult};
use crate::mission::queue::{DequeuedJob, MissionJob, MissionQueue};
use crate::models::{Mission, MissionStatus};
use crate::schema::missions;

pub struct InterviewRunnerConfig {
    pub worker_concurrency: usize,
    pub max_owner_turns: u32,
    pub mission_timeout: Duration,
}

pub struct InterviewRunner {
    pool: DbPool,
    mission_queue: Arc<dyn MissionQueue>,
    orchestrator: Arc<MissionOrchestrator>,
    generator: Arc<dyn TextGenerator>,
    judge: Arc<dyn Judge>,
    event_sink: Arc<dyn EventSink>,
    config: InterviewRunnerConfig,
}

impl InterviewRunner {
    pub fn new(
        pool: DbPool,
        mission_queue: Arc<dyn MissionQueue>,
        orchestrator: Arc<MissionOrchestrator>,
        generator: Arc<dyn TextGenerator>,
        judge: Arc<dyn Judge>,
        event_sink: Arc<dyn EventSink>,
        config: InterviewRunnerConfig,
    ) -> Self {
        Self {
            pool,
            mission_queue,
            orchestrator,
            generator,
            judge,
            event_sink,
            config,
        }
    }

    /// Spawns `worker_concurrency` independent consume loops sharing this
    /// queue, mirroring the platform's one-listener-per-concern convention
    /// but fanned out for throughput.
    pub fn spawn(self: Arc<Self>) {
        for worker_id in 0..self.config.worker_concurrency.max(1) {
            let this = self.clone();
            tokio::spawn(async move {
                loop {
                    match this.mission_queue.dequeue().await {
                        Ok(Some(dequeued)) => this.process(dequeued).await,
                        Ok(None) => tokio::time::sleep(Duration::from_millis(200)).await,
                        Err(e) => {
                            tracing::error!(worker_id, error = %e, "mission queue dequeue failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            });
        }
    }

    async fn process(&self, dequeued: DequeuedJob) {
        let job = dequeued.job.clone();

        match self.load_mission(job.mission_id) {
            Ok(Some(mission)) if mission.status == MissionStatus::Completed.as_str()
                || mission.status == MissionStatus::Failed.as_str() =>
            {
                tracing::debug!(mission_id = %job.mission_id, "mission already terminal, dropping redelivery");
            }
            Ok(Some(_)) => {
                self.run_job(&job).await;
            }
            Ok(None) => {
                tracing::warn!(mission_id = %job.mission_id, "mission row missing for dequeued job");
            }
            Err(e) => {
                tracing::error!(mission_id = %job.mission_id, error = %e, "failed to load mission before processing");
            }
        }

        if let Err(e) = self.mission_queue.ack(dequeued).await {
            tracing::warn!(mission_id = %job.mission_id, error = %e, "failed to ack mission job");
        }
    }

    fn load_mission(&self, mission_id: Uuid) -> CoreResult<Option<Mission>> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| CoreError::Transient(format!("db pool exhausted: {e}")))?;
        missions::table
            .find(mission_id)
            .first(&mut conn)
            .optional()
            .map_err(CoreError::Database)
    }

    fn mark_in_progress(&self, mission_id: Uuid) {
        let conn = self.pool.get();
        let Ok(mut conn) = conn else { return };
        if let Err(e) = diesel::update(missions::table.find(mission_id))
            .set((
                missions::status.eq(MissionStatus::InProgress.as_str()),
                missions::started_at.eq(chrono::Utc::now()),
            ))
            .execute(&mut conn)
        {
            tracing::warn!(mission_id = %mission_id, error = %e, "failed to mark mission in_progress");
        }
    }

    async fn run_job(&self, job: &MissionJob) {
        self.mark_in_progress(job.mission_id);
        self.event_sink
            .emit(
                DomainEvent::ConversationStarted(payloads::ConversationStarted { mission_id: job.mission_id }),
                Some(job.owner_user_id),
            )
            .await;

        let transcript: Arc<Mutex<Vec<TranscriptTurn>>> = Arc::new(Mutex::new(Vec::new()));

        let turn_result = tokio::time::timeout(
            self.config.mission_timeout,
            self.run_turns(job, transcript.clone()),
        )
        .await;

        let transcript_snapshot = transcript.lock().unwrap().clone();
        let transcript_json = serde_json::to_value(&transcript_snapshot).unwrap_or(serde_json::json!([]));

        let result = match turn_result {
            Ok(Ok(decision)) => {
                self.event_sink
                    .emit(
                        DomainEvent::ConversationJudgeDecision(payloads::ConversationJudgeDecision {
                            mission_id: job.mission_id,
                            should_notify: decision.should_notify,
                        }),
                        Some(job.owner_user_id),
                    )
                    .await;
                self.event_sink
                    .emit(
                        DomainEvent::ConversationCompleted(payloads::ConversationCompleted {
                            mission_id: job.mission_id,
                            turn_count: transcript_snapshot.len() as u32,
                        }),
                        Some(job.owner_user_id),
                    )
                    .await;

                MissionResult {
                    success: true,
                    match_made: decision.should_notify,
                    transcript: transcript_json,
                    judge_decision: Some(serde_json::json!(decision)),
                    error: None,
                }
            }
            Ok(Err(e)) => MissionResult {
                success: false,
                match_made: false,
                transcript: transcript_json,
                judge_decision: None,
                error: Some(e.to_string()),
            },
            Err(_elapsed) => {
                tracing::warn!(mission_id = %job.mission_id, "mission timed out");
                MissionResult {
                    success: false,
                    match_made: false,
                    transcript: transcript_json,
                    judge_decision: None,
                    error: Some("timeout".to_string()),
                }
            }
        };

        if let Err(e) = self.orchestrator.handle_mission_result(job.mission_id, result).await {
            tracing::error!(mission_id = %job.mission_id, error = %e, "failed to record mission result");
        }
    }

    async fn run_turns(&self, job: &MissionJob, transcript: Arc<Mutex<Vec<TranscriptTurn>>>) -> CoreResult<JudgeDecision> {
        let owner = ProfileSnapshot {
            user_id: job.owner_user_id,
            display_name: profile_display_name(&job.owner_profile_snapshot, "owner"),
        };
        let visitor = ProfileSnapshot {
            user_id: job.visitor_user_id,
            display_name: profile_display_name(&job.visitor_profile_snapshot, "visitor"),
        };
        let circle = CircleSnapshot {
            objective: job
                .owner_circle_snapshot
                .get("objective")
                .and_then(|v| v.as_str())
                .unwrap_or("meet up")
                .to_string(),
            radius_meters: job
                .owner_circle_snapshot
                .get("radius_meters")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
        };

        let mut goal = TurnGoal::OpenAndAskOneFocusedQuestion;
        let mut owner_turns: u32 = 0;
        let mut turn_index: u32 = 0;

        loop {
            let speaker_is_owner = turn_index % 2 == 0;
            let speaker = if speaker_is_owner { "owner" } else { "visitor" };

            if speaker_is_owner && owner_turns >= self.config.max_owner_turns && goal != TurnGoal::NotifyUser {
                goal = TurnGoal::NotifyUser;
            }

            let context = InterviewContext {
                approximate_distance_m: job.context.approximate_distance_m,
                speaker,
            };
            let snapshot = transcript.lock().unwrap().clone();
            let prompt = build_prompt(&owner, &visitor, &circle, &context, &snapshot, goal);

            self.event_sink
                .emit(
                    DomainEvent::ConversationThinkingStarted(payloads::ConversationThinkingStarted {
                        mission_id: job.mission_id,
                        turn_index,
                        speaker: speaker.to_string(),
                    }),
                    Some(job.owner_user_id),
                )
                .await;

            let outcome = self.generator.generate(&prompt, &GenerationParams::default()).await?;

            transcript.lock().unwrap().push(TranscriptTurn {
                speaker: speaker.to_string(),
                goal,
                text: outcome.text,
            });

            self.event_sink
                .emit(
                    DomainEvent::ConversationThinkingCompleted(payloads::ConversationThinkingCompleted {
                        mission_id: job.mission_id,
                        turn_index,
                    }),
                    Some(job.owner_user_id),
                )
                .await;
            self.event_sink
                .emit(
                    DomainEvent::ConversationTurnCompleted(payloads::ConversationTurnCompleted {
                        mission_id: job.mission_id,
                        turn_index,
                        speaker: speaker.to_string(),
                    }),
                    Some(job.owner_user_id),
                )
                .await;

            if speaker_is_owner {
                owner_turns += 1;
            }
            turn_index += 1;

            if goal == TurnGoal::NotifyUser {
                break;
            }

            if outcome.stop_suggested {
                goal = TurnGoal::NotifyUser;
                continue;
            }

            match goal.next() {
                Some(next) => goal = next,
                None => break,
            }
        }

        let final_transcript = transcript.lock().unwrap().clone();
        let decision = self
            .judge
            .evaluate(&circle.objective, &serde_json::to_value(&final_transcript).unwrap_or(serde_json::json!([])))
            .await;
        Ok(decision)
    }
}

fn profile_display_name(snapshot: &serde_json::Value, fallback: &str) -> String {
    snapshot
        .get("display_name")
        .and_then(|v| v.as_str())
        .unwrap_or(fallback)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::store::InMemoryCollisionStateStore;
    use crate::cooldown::{CooldownDurations, InMemoryCooldownStore};
    use crate::events::RecordingEventSink;
    use crate::interview::generator::{GenerationOutcome, HangingTextGenerator, ScriptedTextGenerator};
    use crate::interview::judge::ScriptedJudge;
    use crate::mission::orchestrator::OrchestratorConfig;
    use crate::mission::queue::{InMemoryMissionQueue, MissionContext};
    use diesel::r2d2::{ConnectionManager, Pool};
    use matchcore_shared::types::event::routing_keys;

    fn lazy_pool() -> DbPool {
        let manager =
            ConnectionManager::<diesel::PgConnection>::new("postgres://unused.invalid/unused");
        Pool::builder()
            .max_size(1)
            .min_idle(Some(0))
            .connection_timeout(std::time::Duration::from_millis(100))
            .build_unchecked(manager)
    }

    fn sample_job() -> MissionJob {
        MissionJob {
            mission_id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            visitor_user_id: Uuid::new_v4(),
            owner_profile_snapshot: serde_json::json!({ "display_name": "Alex" }),
            visitor_profile_snapshot: serde_json::json!({ "display_name": "Sam" }),
            owner_circle_snapshot: serde_json::json!({ "objective": "coffee", "radius_meters": 500.0 }),
            context: MissionContext {
                approximate_time_iso: chrono::Utc::now(),
                approximate_distance_m: 75.0,
            },
        }
    }

    struct Harness {
        runner: InterviewRunner,
        sink: Arc<RecordingEventSink>,
    }

    /// Runner wired against fakes. `run_turns` touches only the generator,
    /// judge, and event sink, so the never-connecting pool is fine.
    fn harness(generator: Arc<dyn TextGenerator>, judge: Arc<dyn Judge>) -> Harness {
        let pool = lazy_pool();
        let sink = Arc::new(RecordingEventSink::new());
        let queue = Arc::new(InMemoryMissionQueue::new());
        let orchestrator = Arc::new(MissionOrchestrator::new(
            pool.clone(),
            Arc::new(InMemoryCollisionStateStore::new()),
            Arc::new(InMemoryCooldownStore::new()),
            CooldownDurations {
                matched_secs: 14 * 24 * 3600,
                rejected_secs: 24 * 3600,
                notified_secs: 3600,
            },
            queue.clone(),
            sink.clone(),
            OrchestratorConfig {
                in_flight_ttl_secs: 60,
                mission_max_attempts: 3,
                queue_highwater: 1000,
            },
        ));
        let runner = InterviewRunner::new(
            pool,
            queue,
            orchestrator,
            generator,
            judge,
            sink.clone(),
            InterviewRunnerConfig {
                worker_concurrency: 1,
                max_owner_turns: 3,
                mission_timeout: Duration::from_secs(90),
            },
        );
        Harness { runner, sink }
    }

    fn scripted(texts: usize) -> Arc<dyn TextGenerator> {
        Arc::new(ScriptedTextGenerator::new(
            (0..texts)
                .map(|i| GenerationOutcome {
                    text: format!("turn {i}"),
                    stop_suggested: false,
                })
                .collect(),
        ))
    }

    #[test]
    fn profile_display_name_falls_back_when_absent() {
        assert_eq!(profile_display_name(&serde_json::json!({}), "owner"), "owner");
        assert_eq!(
            profile_display_name(&serde_json::json!({ "display_name": "Alex" }), "owner"),
            "Alex"
        );
    }

    #[tokio::test]
    async fn turn_loop_alternates_speakers_and_advances_goals() {
        let h = harness(scripted(5), Arc::new(ScriptedJudge::new(true)));
        let job = sample_job();
        let transcript = Arc::new(Mutex::new(Vec::new()));

        let decision = h.runner.run_turns(&job, transcript.clone()).await.unwrap();
        assert!(decision.should_notify);

        let turns = transcript.lock().unwrap().clone();
        let speakers: Vec<&str> = turns.iter().map(|t| t.speaker.as_str()).collect();
        let goals: Vec<TurnGoal> = turns.iter().map(|t| t.goal).collect();

        assert_eq!(speakers, vec!["owner", "visitor", "owner", "visitor", "owner"]);
        assert_eq!(
            goals,
            vec![
                TurnGoal::OpenAndAskOneFocusedQuestion,
                TurnGoal::ClarifyObjective,
                TurnGoal::ClarifyAvailability,
                TurnGoal::DecideAndClose,
                TurnGoal::NotifyUser,
            ]
        );
    }

    #[tokio::test]
    async fn stop_suggested_short_circuits_straight_to_the_notify_turn() {
        let generator: Arc<dyn TextGenerator> = Arc::new(ScriptedTextGenerator::new(vec![
            GenerationOutcome {
                text: "Let's meet now.".into(),
                stop_suggested: true,
            },
            GenerationOutcome {
                text: "You two should talk!".into(),
                stop_suggested: false,
            },
        ]));
        let h = harness(generator, Arc::new(ScriptedJudge::new(true)));
        let job = sample_job();
        let transcript = Arc::new(Mutex::new(Vec::new()));

        h.runner.run_turns(&job, transcript.clone()).await.unwrap();

        let turns = transcript.lock().unwrap().clone();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].goal, TurnGoal::NotifyUser);
    }

    #[tokio::test]
    async fn every_turn_emits_thinking_and_completion_events() {
        let h = harness(scripted(5), Arc::new(ScriptedJudge::new(false)));
        let job = sample_job();
        let transcript = Arc::new(Mutex::new(Vec::new()));

        h.runner.run_turns(&job, transcript).await.unwrap();

        let keys = h.sink.routing_keys();
        let started = keys.iter().filter(|k| **k == routing_keys::CONVERSATION_THINKING_STARTED).count();
        let completed = keys.iter().filter(|k| **k == routing_keys::CONVERSATION_TURN_COMPLETED).count();
        assert_eq!(started, 5);
        assert_eq!(completed, 5);
    }

    #[tokio::test]
    async fn exhausted_generator_script_surfaces_as_an_error() {
        let h = harness(scripted(2), Arc::new(ScriptedJudge::new(true)));
        let job = sample_job();
        let transcript = Arc::new(Mutex::new(Vec::new()));

        let outcome = h.runner.run_turns(&job, transcript.clone()).await;
        assert!(outcome.is_err());
        // The two turns that did complete stay recorded.
        assert_eq!(transcript.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_generator_trips_the_mission_timeout() {
        let h = harness(Arc::new(HangingTextGenerator), Arc::new(ScriptedJudge::new(true)));
        let job = sample_job();
        let transcript = Arc::new(Mutex::new(Vec::new()));

        let outcome = tokio::time::timeout(
            h.runner.config.mission_timeout,
            h.runner.run_turns(&job, transcript),
        )
        .await;
        assert!(outcome.is_err());
    }
}
