use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Env-filtered subscriber: human-readable output locally, JSON lines under
/// `MATCHCORE_ENV=production` for the platform's log shipper. The default
/// filter keeps the service itself at `debug` (the collision and mission
/// paths log their skip decisions there) and everything else at `info`;
/// `RUST_LOG` overrides it wholesale.
pub fn init_tracing(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{service_name}=debug")));

    let registry = tracing_subscriber::registry().with(env_filter);

    if in_production() {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    }

    tracing::info!(service = service_name, "tracing initialized");
}

fn in_production() -> bool {
    std::env::var("MATCHCORE_ENV")
        .map(|v| v == "production")
        .unwrap_or(false)
}
