//! Worker process configuration, assembled from environment variables the
//! way the teacher's `DurableWorkerConfig::from_env` is.

use std::time::Duration;

use orchestrator_core::resolver::ResolveMode;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub poll_interval: Duration,
    pub poll_concurrency: usize,
    pub resolve_mode: ResolveMode,
    pub providers_dir: String,
}

impl Config {
    /// Reads `DATABASE_URL` (required) plus optional tunables, each falling
    /// back to a sensible default rather than failing the process.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable required"))?;

        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let poll_interval_secs: u64 = std::env::var("POLL_INTERVAL_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let poll_concurrency = std::env::var("POLL_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            });

        let resolve_mode = match std::env::var("RESOLVE_MODE").as_deref() {
            Ok("strict") => ResolveMode::Strict,
            _ => ResolveMode::FirstWins,
        };

        let providers_dir =
            std::env::var("PROVIDERS_DIR").unwrap_or_else(|_| "./providers".to_string());

        Ok(Self {
            database_url,
            database_max_connections,
            poll_interval: Duration::from_secs(poll_interval_secs),
            poll_concurrency,
            resolve_mode,
            providers_dir,
        })
    }
}
