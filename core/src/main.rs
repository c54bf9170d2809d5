use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use matchcore::collision::{CollisionDetector, CollisionDetectorConfig, RedisCollisionStateStore};
use matchcore::config::AppConfig;
use matchcore::cooldown::{CooldownDurations, RedisCooldownStore};
use matchcore::events::RabbitMqEventSink;
use matchcore::interview::{HttpJudge, HttpTextGenerator, InterviewRunner, InterviewRunnerConfig};
use matchcore::janitor::{Janitor, JanitorConfig};
use matchcore::mission::{MissionOrchestrator, OrchestratorConfig, RabbitMqMissionQueue};
use matchcore::position::PositionStore;
use matchcore::routes;
use matchcore::socket;
use matchcore::stability::{StabilityWorker, StabilityWorkerConfig};
use matchcore::state::AppState;
use matchcore_shared::clients::rabbitmq::RabbitMqClient;
use matchcore_shared::clients::redis::RedisClient;
use socketioxide::SocketIo;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    matchcore_shared::middleware::init_tracing("matchcore");

    let config = AppConfig::load()?;
    let port = config.port;

    let db = matchcore_shared::clients::db::create_pool(&config.database_url);

    let rabbitmq = RabbitMqClient::connect(&config.rabbitmq_url).await?;
    let redis = RedisClient::connect(&config.redis_url).await?;

    let metrics_handle = matchcore_shared::middleware::init_metrics();

    let collision_store = Arc::new(RedisCollisionStateStore::new(redis.clone()));
    let cooldown_store = Arc::new(RedisCooldownStore::new(redis.clone()));
    let cooldown_durations = CooldownDurations {
        matched_secs: config.cooldown_matched_secs,
        rejected_secs: config.cooldown_rejected_secs,
        notified_secs: config.cooldown_notified_secs,
    };
    let position_store = Arc::new(PositionStore::new(db.clone()));
    let event_sink = Arc::new(RabbitMqEventSink::new(rabbitmq.clone()));
    let mission_queue = Arc::new(RabbitMqMissionQueue::new(rabbitmq.clone()).await?);

    let orchestrator = Arc::new(MissionOrchestrator::new(
        db.clone(),
        collision_store.clone(),
        cooldown_store.clone(),
        cooldown_durations,
        mission_queue.clone(),
        event_sink.clone(),
        OrchestratorConfig {
            in_flight_ttl_secs: config.in_flight_ttl_secs,
            mission_max_attempts: config.mission_max_attempts,
            queue_highwater: config.queue_highwater,
        },
    ));

    let collision_detector = Arc::new(CollisionDetector::new(
        db.clone(),
        position_store,
        collision_store.clone(),
        event_sink.clone(),
        CollisionDetectorConfig {
            min_movement_meters: config.min_movement_meters,
            min_update_interval_secs: config.min_update_interval_secs,
            spatial_search_limit: config.spatial_search_limit,
            ..CollisionDetectorConfig::default()
        },
    ));

    Arc::new(StabilityWorker::new(
        db.clone(),
        collision_store.clone(),
        orchestrator.clone(),
        StabilityWorkerConfig {
            tick_interval: Duration::from_secs(config.stability_tick_secs),
            stability_window_secs: config.stability_window_secs,
            stale_window_secs: config.stale_window_secs,
        },
    ))
    .spawn();

    Arc::new(Janitor::new(
        db.clone(),
        JanitorConfig {
            tick_interval: Duration::from_secs(config.janitor_tick_secs),
            collision_expiry_secs: config.collision_expiry_secs,
            match_pending_expiry_secs: config.match_pending_expiry_secs,
        },
    ))
    .spawn();

    let generator = Arc::new(HttpTextGenerator::new(config.llm_endpoint.clone()));
    let judge = Arc::new(HttpJudge::new(config.judge_endpoint.clone()));
    Arc::new(InterviewRunner::new(
        db.clone(),
        mission_queue.clone(),
        orchestrator.clone(),
        generator,
        judge,
        event_sink.clone(),
        InterviewRunnerConfig {
            worker_concurrency: config.interview_worker_concurrency,
            max_owner_turns: config.max_owner_turns,
            mission_timeout: Duration::from_secs(config.mission_timeout_secs),
        },
    ))
    .spawn();

    let state = Arc::new(AppState {
        db,
        config,
        metrics_handle,
        collision_detector,
    });

    let (sio_layer, io) = SocketIo::builder().with_state(state.clone()).build_layer();
    io.ns("/", socket::handlers::on_connect);

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        .layer(axum::middleware::from_fn(matchcore_shared::middleware::metrics_middleware))
        .layer(sio_layer)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "matchcore starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
