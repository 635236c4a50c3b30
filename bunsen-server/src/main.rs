use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};

use bunsen_core::EventVerifier;
use bunsen_server::config::{Config, StateBackend};
use bunsen_server::dispatcher::{BackoffPolicy, DispatchClient, DispatchSettings};
use bunsen_server::github::{GitHubClient, WorkflowDispatchTrigger};
use bunsen_server::reconciliation::reconcile_abandoned_dispatches;
use bunsen_server::responder::create_responder;
use bunsen_server::store::SqliteRepository;
use bunsen_server::{build_router, AppState, Coordinator, RecordingLogger, ThreadStore};

fn open_store(config: &Config) -> Result<ThreadStore> {
    match config.state_backend {
        StateBackend::Sqlite => {
            let db_path = config.database_path();
            info!("Using state database: {}", db_path.display());
            let repository = SqliteRepository::new(&db_path)
                .with_context(|| format!("Failed to open {}", db_path.display()))?;
            Ok(ThreadStore::new(Arc::new(repository)))
        }
        StateBackend::Memory => {
            warn!("Using in-memory state: deduplication and dispatch status are lost on restart");
            Ok(ThreadStore::in_memory())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting bunsen {}", bunsen_server::get_version());

    let config = Config::from_env().context("Failed to load configuration from environment")?;
    info!("Configuration: {:?}", config);

    let recording_logger = if config.recording_enabled {
        match RecordingLogger::new(PathBuf::from(&config.recording_log_path)) {
            Ok(logger) => {
                info!(
                    "Recording enabled, logging to: {}",
                    config.recording_log_path
                );
                Some(logger)
            }
            Err(e) => {
                error!("Failed to initialize recording logger: {}", e);
                None
            }
        }
    } else {
        None
    };

    let store = open_store(&config)?;

    let github_client = GitHubClient::new_with_recording(
        config.github_auth.clone(),
        &config.github_api_url,
        recording_logger.clone(),
    )?;
    let trigger = WorkflowDispatchTrigger::new(
        github_client.clone(),
        &config.workflow_file,
        &config.workflow_ref,
    );
    let dispatcher = DispatchClient::new(
        Arc::new(trigger),
        store.clone(),
        DispatchSettings {
            max_attempts: config.dispatch_max_attempts,
            timeout: config.dispatch_timeout,
            backoff: BackoffPolicy::exponential(config.dispatch_backoff),
        },
    );
    let responder = create_responder(&config, recording_logger.clone())?;

    let coordinator = Coordinator::new(
        store.clone(),
        config.trigger_config(),
        responder,
        Arc::new(github_client),
        dispatcher,
        config.state_cas_max_attempts,
    );

    // Close out dispatches a previous instance left in flight before taking traffic.
    let max_age = chrono::Duration::from_std(config.dispatch_timeout)
        .context("Dispatch timeout out of range")?;
    if let Err(e) = reconcile_abandoned_dispatches(&store, max_age, chrono::Utc::now()).await {
        error!("Startup reconciliation failed: {}", e);
    }

    let app_state = Arc::new(AppState {
        verifier: EventVerifier::new(config.github_webhook_secret.clone()),
        coordinator,
        store,
        status_auth_token: config.status_auth_token.clone(),
        recording_logger,
    });

    let app = build_router(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
