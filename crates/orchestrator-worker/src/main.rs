mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator_core::{
    Engine, EngineConfig, ProviderManifest, ProviderResolver, ResourceManager, StepRegistry,
    WorkflowExecutor,
};
use orchestrator_core::persistence::PostgresStore;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orchestrator_worker=debug,orchestrator_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("orchestrator-worker starting...");

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the orchestration database")?;
    let store = Arc::new(PostgresStore::new(pool));
    store.migrate().await.context("failed to run database migrations")?;
    tracing::info!("database connection established and migrations applied");

    let resolver = Arc::new(load_providers(&config.providers_dir, config.resolve_mode)?);
    tracing::info!(
        providers_dir = %config.providers_dir,
        provider_count = resolver.providers().len(),
        "loaded provider manifests"
    );

    let resources = Arc::new(ResourceManager::new(Arc::clone(&store)));
    let registry = Arc::new(StepRegistry::with_default_executors());
    let executor = Arc::new(WorkflowExecutor::new(Arc::clone(&store), registry));

    let engine_config = EngineConfig {
        poll_interval: config.poll_interval,
        poll_concurrency: config.poll_concurrency,
    };
    let engine = Engine::new(resources, resolver, executor, engine_config);

    let cancel = CancellationToken::new();
    tokio::select! {
        _ = engine.run(cancel.clone()) => {
            tracing::warn!("engine poll loop exited on its own");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
    }

    tracing::info!("orchestrator-worker shutdown complete");
    Ok(())
}

/// Loads every `*.yaml`/`*.yml` provider manifest in `dir` (spec §6). An
/// empty or missing directory yields an empty resolver rather than an
/// error — a worker with no providers loaded yet can still start and poll.
fn load_providers(dir: &str, mode: orchestrator_core::resolver::ResolveMode) -> Result<ProviderResolver> {
    let mut resolver = ProviderResolver::new(mode);

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(dir, "providers directory not found, starting with no providers loaded");
            return Ok(resolver);
        }
        Err(err) => return Err(err).context(format!("failed to read providers directory '{dir}'")),
    };

    for entry in entries {
        let entry = entry.context("failed to read providers directory entry")?;
        let path = entry.path();
        let is_manifest = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if !is_manifest {
            continue;
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read provider manifest '{}'", path.display()))?;
        let manifest = ProviderManifest::from_yaml(&contents)
            .with_context(|| format!("failed to parse provider manifest '{}'", path.display()))?;
        let provider = manifest.into_provider();
        tracing::debug!(provider = %provider.name, path = %path.display(), "loaded provider manifest");
        resolver.load(provider);
    }

    Ok(resolver)
}
