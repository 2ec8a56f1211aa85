//! IMS Service
//!
//! Control plane for building and customizing boot images. Keeps image,
//! recipe, public key, job and remote build node records, moves artifacts
//! in the object store and launches build jobs on the cluster scheduler or
//! on remote build nodes.

pub mod artifacts;
pub mod balancer;
pub mod config;
pub mod handlers;
pub mod object_store;
pub mod orchestrator;
pub mod remote;
pub mod scheduler;
pub mod storage;
pub mod templates;

use axum::{
    routing::{get, patch},
    Router,
};
use ims_common::models::{Image, Job, PublicKey, Recipe, RemoteBuildNode};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use artifacts::ArtifactManager;
pub use config::Config;
pub use handlers::AppState;
pub use object_store::{FsObjectStore, ObjectStore};
pub use orchestrator::Orchestrator;
pub use remote::{RemoteExecutor, SshExecutor};
pub use scheduler::{KubernetesScheduler, Scheduler};
pub use storage::Storage;
pub use templates::TemplateRenderer;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    use handlers::*;

    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/v3/images",
            get(list_handler::<Image>)
                .post(create_image_handler)
                .delete(delete_images_handler),
        )
        .route(
            "/v3/images/{id}",
            get(get_handler::<Image>)
                .patch(patch_handler::<Image>)
                .delete(delete_image_handler),
        )
        .route(
            "/v3/recipes",
            get(list_handler::<Recipe>)
                .post(create_recipe_handler)
                .delete(delete_recipes_handler),
        )
        .route(
            "/v3/recipes/{id}",
            get(get_handler::<Recipe>)
                .patch(patch_recipe_handler)
                .delete(delete_recipe_handler),
        )
        .route(
            "/v3/public-keys",
            get(list_handler::<PublicKey>)
                .post(create_public_key_handler)
                .delete(delete_public_keys_handler),
        )
        .route(
            "/v3/public-keys/{id}",
            get(get_handler::<PublicKey>)
                .patch(patch_handler::<PublicKey>)
                .delete(delete_public_key_handler),
        )
        .route(
            "/v3/remote-build-nodes",
            get(list_handler::<RemoteBuildNode>)
                .post(create_remote_build_node_handler)
                .delete(delete_remote_build_nodes_handler),
        )
        .route(
            "/v3/remote-build-nodes/status",
            get(remote_build_node_status_handler),
        )
        .route(
            "/v3/remote-build-nodes/{id}",
            get(get_handler::<RemoteBuildNode>)
                .patch(patch_handler::<RemoteBuildNode>)
                .delete(delete_remote_build_node_handler),
        )
        .route(
            "/v3/jobs",
            get(list_jobs_handler)
                .post(create_job_handler)
                .delete(delete_jobs_handler),
        )
        .route(
            "/v3/jobs/{id}",
            get(get_handler::<Job>)
                .patch(update_job_status_handler)
                .delete(delete_job_handler),
        )
        .route(
            "/v3/deleted/images",
            get(list_deleted_handler::<Image>).patch(undelete_images_handler),
        )
        .route(
            "/v3/deleted/images/{id}",
            get(get_deleted_handler::<Image>).patch(undelete_image_handler),
        )
        .route(
            "/v3/deleted/recipes",
            get(list_deleted_handler::<Recipe>).patch(undelete_recipes_handler),
        )
        .route(
            "/v3/deleted/recipes/{id}",
            get(get_deleted_handler::<Recipe>).patch(undelete_recipe_handler),
        )
        .route(
            "/v3/deleted/public-keys",
            get(list_deleted_handler::<PublicKey>).patch(undelete_public_keys_handler),
        )
        .route(
            "/v3/deleted/public-keys/{id}",
            patch(undelete_public_key_handler).get(get_deleted_handler::<PublicKey>),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
