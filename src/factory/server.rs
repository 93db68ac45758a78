use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::ai::{HttpModelClient, ModelResolver};
use super::analyze::Analyzer;
use super::api::{self, AppState, SharedState};
use super::callback::CallbackGateway;
use super::cancel::CancellationController;
use super::db::{DbHandle, ScoutDb};
use super::launcher::{AgentCommand, RunLauncher};
use super::process::OsProcessSupervisor;
use super::prompts::PromptSet;
use super::scheduler::Scheduler;
use super::sync::SyncEngine;
use super::tracker::TrackerSet;
use super::workspace::{GitCli, WorkspaceManager};
use crate::config::{ScoutConfig, Secrets};

/// Upper bound on a single `git fetch` before workspace creation.
const GIT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for the Scout server.
pub struct ServerConfig {
    pub scout: ScoutConfig,
    pub secrets: Secrets,
    /// Permissive CORS for a locally served dashboard.
    pub dev_mode: bool,
}

/// Everything the HTTP layer and the scheduler share.
pub struct Services {
    pub state: SharedState,
    pub sync: Arc<SyncEngine>,
}

/// Open the database and wire the production implementations of every
/// collaborator.
pub fn build_services(config: &ScoutConfig, secrets: &Secrets) -> Result<Services> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(
        ScoutDb::new(&config.db_path).context("Failed to initialize scout database")?,
    );

    let timeout = Duration::from_secs(config.http_timeout_secs);
    let prompts = Arc::new(PromptSet::load(config.prompts_dir.as_deref())?);
    let resolver = ModelResolver::from_secrets(secrets);
    let supervisor = Arc::new(OsProcessSupervisor);
    let workspaces = Arc::new(WorkspaceManager::new(
        Arc::new(GitCli::new(GIT_FETCH_TIMEOUT)),
        config.worktree_root(),
        config.git_remote.clone(),
    ));

    let launcher = Arc::new(RunLauncher::new(
        db.clone(),
        workspaces.clone(),
        supervisor.clone(),
        prompts.clone(),
        resolver,
        AgentCommand {
            program: config.agent_cmd.clone(),
            leading_args: config.agent_args.clone(),
            callback_url: format!("{}/api/callback", config.callback_base_url()),
        },
        config.runs_root(),
    ));
    let gateway = Arc::new(CallbackGateway::new(db.clone(), workspaces.clone()));
    let canceller = Arc::new(CancellationController::new(
        db.clone(),
        workspaces,
        supervisor,
        Duration::from_millis(config.cancel_grace_ms),
    ));
    let sync = Arc::new(SyncEngine::new(
        db.clone(),
        TrackerSet::from_secrets(secrets, timeout)?,
        config.sync.page_size,
        config.git_remote.clone(),
    ));
    let analyzer = Arc::new(Analyzer::new(
        db.clone(),
        Arc::new(HttpModelClient::new(secrets, timeout)?),
        prompts,
        resolver,
    ));

    let state = Arc::new(AppState {
        db,
        launcher,
        gateway,
        canceller,
        sync: sync.clone(),
        analyzer,
        models: resolver,
    });
    Ok(Services { state, sync })
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the Scout server and, when enabled, the background scheduler.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let scout = &config.scout;
    let services = build_services(scout, &config.secrets)?;

    let mut app = build_router(services.state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", scout.host, scout.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, callback = %scout.callback_base_url(), "scout listening");
    println!("Scout running at http://{}", local_addr);

    let token = CancellationToken::new();
    let tasks = if scout.sync.enabled {
        Arc::new(Scheduler::new(
            services.sync,
            Duration::from_secs(scout.sync.interval_secs.max(1)),
            Duration::from_secs(scout.sync.pr_check_interval_secs.max(1)),
        ))
        .spawn(token.clone())
    } else {
        info!("background sync disabled");
        Vec::new()
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(token.clone()))
        .await
        .context("Server error");

    token.cancel();
    for task in tasks {
        let _ = task.await;
    }
    served?;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                token.cancelled().await;
            }
        }
        _ = token.cancelled() => {}
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::test_support::Harness;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_via_full_router() -> Result<()> {
        let h = Harness::new().await?;
        let app = build_router(Arc::new(h.app_state()));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() -> Result<()> {
        let h = Harness::new().await?;
        let app = build_router(Arc::new(h.app_state()));
        let resp = app
            .oneshot(Request::builder().uri("/api/nothing").body(Body::empty())?)
            .await?;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn test_build_services_creates_database() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = ScoutConfig::default();
        config.db_path = dir.path().join("nested").join("scout.db");
        config.scratch_dir = dir.path().to_path_buf();
        let services = build_services(&config, &Secrets::default())?;
        assert!(config.db_path.exists());

        let resp = build_router(services.state)
            .oneshot(Request::builder().uri("/api/repos").body(Body::empty())?)
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);
        Ok(())
    }
}
