use std::time::Duration;

use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

/// Connections are only ever borrowed for short synchronous bursts
/// (`spawn_blocking` sections, ticker sweeps), so the pool is sized to the
/// worst-case concurrent borrowers: the interview worker pool, the two
/// background tickers, and a handful of in-flight ingest calls.
const POOL_MAX_SIZE: u32 = 16;

pub fn create_pool(database_url: &str) -> DbPool {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(POOL_MAX_SIZE)
        .connection_timeout(Duration::from_secs(5))
        .build(manager)
        .expect("failed to create database pool");

    tracing::info!(max_size = POOL_MAX_SIZE, "database connection pool created");
    pool
}
