// packages/agent/src/main.rs
//! Workflow Agent
//!
//! Claims workflow instances from the resource store and supervises the
//! processes that execute them.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use workflow_agent::observability::{init_metrics, init_tracing};
use workflow_agent::store::seed::SeedDocument;
use workflow_agent::{AgentConfig, MemoryStore, ProcessManagerRegistry, WorkflowInstanceManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AgentConfig::load().context("failed to load configuration")?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    info!("Starting Workflow Agent v{}", workflow_agent::VERSION);
    info!("Configuration loaded: {:?}", config);

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &config.store.seed_path {
        let report = SeedDocument::load(path)
            .await
            .with_context(|| format!("failed to load seed document {:?}", path))?
            .apply(&*store)
            .await?;
        info!("Seed applied: {} created, {} skipped", report.created, report.skipped);
    }

    // Resolve the process manager backend once; an unknown backend is fatal
    let process_manager = ProcessManagerRegistry::with_defaults().resolve(&config.process_manager)?;

    let cancel = CancellationToken::new();
    let manager = WorkflowInstanceManager::start(Arc::clone(&store), process_manager, &config, cancel.clone())
        .await
        .context("failed to start workflow instance manager")?;

    // Graceful shutdown handler
    let mut terminate = signal(SignalKind::terminate())?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        info!("Received shutdown signal, cleaning up...");
        shutdown.cancel();
    });

    let result = manager.run().await;
    manager.shutdown().await;

    match result {
        Ok(()) => {
            info!("Agent stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Agent failed: {}", e);
            Err(e.into())
        }
    }
}
