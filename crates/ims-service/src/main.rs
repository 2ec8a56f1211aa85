//! IMS Service
//!
//! REST API for image, recipe and job management

use std::sync::Arc;

use anyhow::{Context, Result};
use ims_service::{
    create_router, AppState, ArtifactManager, Config, FsObjectStore, KubernetesScheduler,
    Orchestrator, SshExecutor, Storage, TemplateRenderer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ims_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Invalid configuration")?;

    info!("Starting IMS Service");
    info!("  Data directory: {}", config.data_dir.display());
    info!("  Object store: {}", config.object_store_root.display());
    info!("  Job namespace: {}", config.job_namespace);
    info!("  Remote offload: {}", config.remote_offload);

    config.ensure_directories()?;

    // A corrupt collection is fatal; never serve partial data
    let storage = Storage::open(&config.data_dir).context("Failed to load record store")?;

    let service_store = Arc::new(FsObjectStore::new(
        &config.object_store_root,
        &config.service_owner,
    ));
    let admin_store = Arc::new(FsObjectStore::new(
        &config.object_store_root,
        &config.admin_owner,
    ));
    let artifacts = Arc::new(ArtifactManager::new(
        service_store,
        admin_store,
        &config.admin_owner,
    ));

    let templates = match &config.templates_dir {
        Some(dir) => TemplateRenderer::with_overrides(dir)
            .with_context(|| format!("Failed to load job templates from {}", dir.display()))?,
        None => TemplateRenderer::builtin(),
    };

    let scheduler = Arc::new(KubernetesScheduler::new(
        &config.kubernetes_api_url,
        &config.job_namespace,
        config.kubernetes_token()?,
    ));
    let remote = Arc::new(SshExecutor::new(
        &config.remote_ssh_user,
        &config.remote_ssh_key,
    ));

    let addr = config.api_address();
    let config = Arc::new(config);
    let orchestrator = Orchestrator::new(config, scheduler, remote, artifacts.clone(), templates);

    // Create application state
    let state = AppState::new(storage, artifacts, orchestrator);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("IMS Service API running on http://{}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
