/// Service setup and initialization
///
/// Wires together all components: SQLite store, workflow registry, engine
/// context, execution engine and job scheduler. Provides the factory used by
/// the binary and by embedders that want the full service.

use crate::{
    config::Config,
    runtime::{EngineContext, ExecutionEngine, JobSchedulerService},
    store::{PersistenceStore, SqliteStore},
    workflow::{capabilities::Capabilities, registry::WorkflowRegistry},
};
use anyhow::Result;
use std::{path::Path, sync::Arc};

/// A fully wired engine with its scheduler (not yet started)
pub struct Service {
    pub engine: ExecutionEngine,
    pub scheduler: Arc<JobSchedulerService>,
}

/// Build every component from configuration
pub async fn create_service(config: Config) -> Result<Service> {
    if let Some(dir) = database_dir(&config.database.url) {
        tracing::info!("📁 Ensuring data directory exists: {}", dir);
        std::fs::create_dir_all(&dir)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory '{}': {}", dir, e))?;
    }

    tracing::info!("🗄️ Opening store at {}", config.database.url);
    let store: Arc<dyn PersistenceStore> = Arc::new(
        SqliteStore::connect(&config.database.url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?,
    );

    tracing::info!("📊 Initializing workflow registry");
    let registry = Arc::new(WorkflowRegistry::new(Capabilities::builtin()));
    registry
        .init_from_store(store.as_ref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;

    let context = EngineContext::from_config(&config, store, registry);
    let engine = ExecutionEngine::new(context.clone());

    if let Some(dir) = &config.definitions_dir {
        deploy_definitions(&engine, dir).await?;
    }

    tracing::info!("⏰ Initializing job scheduler");
    let scheduler = Arc::new(JobSchedulerService::new(context, config.scheduler.clone()));

    tracing::info!("✅ Service initialized successfully");
    Ok(Service { engine, scheduler })
}

/// Run the service until ctrl-c
pub async fn start_service(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting mechaflow...");
    let service = create_service(config).await?;
    service.scheduler.start().await;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for shutdown signal: {}", e))?;

    service.scheduler.stop().await;
    tracing::info!("👋 mechaflow stopped");
    Ok(())
}

/// Deploy every `*.json` workflow source in `dir`. Invalid sources are logged
/// and skipped.
async fn deploy_definitions(engine: &ExecutionEngine, dir: &str) -> Result<()> {
    tracing::info!("📥 Deploying workflow definitions from {}", dir);
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read definitions directory '{}': {}", dir, e))?;

    let mut deployed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let json = tokio::fs::read_to_string(&path).await?;
        match engine.deploy_json(&json).await {
            Ok(workflow) => {
                deployed += 1;
                tracing::debug!("📄 {} → {}", path.display(), workflow.id);
            }
            Err(e) => tracing::warn!("⚠️ Skipping {}: {}", path.display(), e),
        }
    }
    tracing::info!("📥 Deployed {} workflow definition(s)", deployed);
    Ok(())
}

/// Parent directory of a file-backed SQLite URL
fn database_dir(url: &str) -> Option<String> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?
        .split('?')
        .next()?;
    if path.is_empty() || path.contains(":memory:") {
        return None;
    }
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
}
