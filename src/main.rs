use std::process::ExitCode;
use std::sync::Arc;

use adaptive_tutor_core::config::Config;
use adaptive_tutor_core::logging;
use adaptive_tutor_core::tutor::{
    Catalog, ConceptGraph, ConceptGraphHandle, InMemoryInteractionLog, InMemoryQuestionBank,
    InMemoryStateRepository, TutorConfig, TutorEngine,
};
use adaptive_tutor_core::workers::WorkerManager;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let _log_guard = logging::init_tracing(&config);

    let tutor_config = match TutorConfig::load() {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = %err, "invalid tutor configuration");
            return ExitCode::FAILURE;
        }
    };

    let catalog = match &config.catalog_path {
        Some(path) => match Catalog::from_file(path) {
            Ok(catalog) => catalog,
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "failed to load catalog");
                return ExitCode::FAILURE;
            }
        },
        None => {
            tracing::warn!("TUTOR_CATALOG_PATH not set, starting with an empty concept graph");
            Catalog::default()
        }
    };

    let graph = match ConceptGraph::new(catalog.graph_version, catalog.concepts) {
        Ok(graph) => graph,
        Err(err) => {
            tracing::error!(error = %err, "concept graph rejected");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        version = graph.version(),
        concepts = graph.len(),
        questions = catalog.questions.len(),
        "catalog loaded"
    );

    let fairness_window_days = tutor_config.fairness.window_days;
    let engine = match TutorEngine::new(
        tutor_config,
        Arc::new(ConceptGraphHandle::new(graph)),
        Arc::new(InMemoryQuestionBank::new(catalog.questions)),
        Arc::new(InMemoryStateRepository::new()),
        Arc::new(InMemoryInteractionLog::new()),
    ) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            tracing::error!(error = %err, "tutor engine not initialized");
            return ExitCode::FAILURE;
        }
    };

    let worker_manager = match WorkerManager::new(Arc::clone(&engine), config.clone(), fairness_window_days).await {
        Ok(manager) => {
            if let Err(e) = manager.start().await {
                tracing::error!(error = %e, "failed to start workers");
            }
            Some(manager)
        }
        Err(e) => {
            tracing::warn!(error = %e, "worker manager not initialized");
            None
        }
    };

    tracing::info!("adaptive tutor core ready");
    shutdown_signal().await;
    tracing::info!("shutdown signal received, initiating graceful shutdown sequence");

    if let Some(ref manager) = worker_manager {
        manager.stop().await;
    }

    tracing::info!("Graceful shutdown complete");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
