//! API handlers for the IMS service

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ims_common::models::{
    ArtifactLink, Image, ImageRequest, Job, JobRequest, JobStatus, JobType, PublicKey, PublicKeyRequest, Recipe,
    RecipeRequest, RemoteBuildNode, RemoteBuildNodeRequest, StatusUpdate,
};
use ims_common::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifacts::ArtifactManager;
use crate::balancer::{self, NodeLoad};
use crate::orchestrator::Orchestrator;
use crate::storage::{Storage, StoredRecord};

/// Shared application state
pub struct AppState {
    /// Single writer; handlers hold the lock for the whole request
    pub storage: Mutex<Storage>,
    pub artifacts: Arc<ArtifactManager>,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(storage: Storage, artifacts: Arc<ArtifactManager>, orchestrator: Orchestrator) -> Self {
        Self {
            storage: Mutex::new(storage),
            artifacts,
            orchestrator,
        }
    }
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound { .. } | Error::ArtifactMissing(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::InvalidTransition { .. } | Error::NoAvailableNode(_) => StatusCode::CONFLICT,
            _ if err.is_template() => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Storage(_) | Error::Scheduler(_) | Error::RemoteExecution(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", err);
        }

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "ims-service"
    }))
}

// Handlers shared by every collection

/// List live records
pub async fn list_handler<T: StoredRecord>(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<T>> {
    let storage = state.storage.lock().await;
    Json(storage.list::<T>(false).cloned().collect())
}

pub async fn get_handler<T: StoredRecord>(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<T>> {
    let storage = state.storage.lock().await;
    Ok(Json(storage.get_live::<T>(id)?))
}

/// Update the patchable fields of a record
pub async fn patch_handler<T: StoredRecord>(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult<Json<T>> {
    info!("Patching {} {}", T::KIND, id);

    let mut storage = state.storage.lock().await;
    Ok(Json(storage.update::<T>(id, &patch)?))
}

pub async fn list_deleted_handler<T: StoredRecord>(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<T>> {
    let storage = state.storage.lock().await;
    Json(storage.list_deleted::<T>().cloned().collect())
}

pub async fn get_deleted_handler<T: StoredRecord>(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<T>> {
    let storage = state.storage.lock().await;
    Ok(Json(storage.get_deleted::<T>(id)?))
}

/// Body of `PATCH /v3/deleted/{collection}/{id}`
#[derive(Debug, Deserialize)]
pub struct DeletedRecordPatch {
    pub operation: String,
}

/// Ids of the live records in a collection
fn live_ids<T: StoredRecord>(storage: &Storage) -> Vec<Uuid> {
    storage.list::<T>(false).map(|record| record.id()).collect()
}

fn deleted_ids<T: StoredRecord>(storage: &Storage) -> Vec<Uuid> {
    storage.list_deleted::<T>().map(|record| record.id()).collect()
}

impl DeletedRecordPatch {
    fn require_undelete(&self) -> ApiResult<()> {
        if self.operation != "undelete" {
            return Err(ApiError::bad_request(format!(
                "Unsupported operation: {}",
                self.operation
            )));
        }
        Ok(())
    }
}

// Images

pub async fn create_image_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ImageRequest>,
) -> ApiResult<(StatusCode, Json<Image>)> {
    info!("Creating image: {}", payload.name);

    let image = Image::from_request(payload)?;
    let mut storage = state.storage.lock().await;
    let image = storage.create(image)?;

    info!("Image created: {}", image.id);
    Ok((StatusCode::CREATED, Json(image)))
}

pub async fn delete_image_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    info!("Deleting image: {}", id);

    let mut storage = state.storage.lock().await;
    storage.get_live::<Image>(id)?;
    state.artifacts.delete_image(&mut storage, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Soft-delete every live image and its artifacts
pub async fn delete_images_handler(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    let mut storage = state.storage.lock().await;
    let ids = live_ids::<Image>(&storage);

    info!("Deleting {} images", ids.len());
    for id in ids {
        state.artifacts.delete_image(&mut storage, id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Restore every soft-deleted image
pub async fn undelete_images_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DeletedRecordPatch>,
) -> ApiResult<StatusCode> {
    payload.require_undelete()?;
    let mut storage = state.storage.lock().await;
    let ids = deleted_ids::<Image>(&storage);

    info!("Restoring {} images", ids.len());
    for id in ids {
        state.artifacts.restore_image(&mut storage, id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn undelete_image_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DeletedRecordPatch>,
) -> ApiResult<Json<Image>> {
    payload.require_undelete()?;
    info!("Restoring image: {}", id);

    let mut storage = state.storage.lock().await;
    Ok(Json(state.artifacts.restore_image(&mut storage, id).await?))
}

// Recipes

pub async fn create_recipe_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RecipeRequest>,
) -> ApiResult<(StatusCode, Json<Recipe>)> {
    info!("Creating recipe: {}", payload.name);

    let recipe = Recipe::from_request(payload)?;
    let mut storage = state.storage.lock().await;
    if let Some(link) = &recipe.link {
        check_recipe_link(&state, &storage, link, None).await?;
    }
    let recipe = storage.create(recipe)?;

    info!("Recipe created: {}", recipe.id);
    Ok((StatusCode::CREATED, Json(recipe)))
}

/// A link that is missing or already used by another recipe is unprocessable
async fn check_recipe_link(
    state: &AppState,
    storage: &Storage,
    link: &ArtifactLink,
    recipe_id: Option<Uuid>,
) -> ApiResult<()> {
    match state.artifacts.verify_recipe_link(storage, link, recipe_id).await {
        Ok(()) => Ok(()),
        Err(e @ (Error::Validation(_) | Error::ArtifactMissing(_))) => {
            info!("Rejected recipe link {}: {}", link.path, e);
            Err(ApiError::unprocessable(e.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Like [`patch_handler`], but a link being set must pass the recipe link checks
pub async fn patch_recipe_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult<Json<Recipe>> {
    info!("Patching recipe {}", id);

    let mut storage = state.storage.lock().await;
    let current = storage.get_live::<Recipe>(id)?;
    if let Some(value) = patch.get("link").filter(|value| !value.is_null()) {
        let link: ArtifactLink = serde_json::from_value(value.clone())
            .map_err(|e| ApiError::bad_request(format!("Invalid link: {}", e)))?;
        // an existing link cannot change, so only a first link is checked
        if current.link.is_none() {
            check_recipe_link(&state, &storage, &link, Some(id)).await?;
        }
    }
    Ok(Json(storage.update::<Recipe>(id, &patch)?))
}

pub async fn delete_recipe_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    info!("Deleting recipe: {}", id);

    let mut storage = state.storage.lock().await;
    storage.get_live::<Recipe>(id)?;
    state.artifacts.delete_recipe(&mut storage, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_recipes_handler(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    let mut storage = state.storage.lock().await;
    let ids = live_ids::<Recipe>(&storage);

    info!("Deleting {} recipes", ids.len());
    for id in ids {
        state.artifacts.delete_recipe(&mut storage, id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn undelete_recipes_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DeletedRecordPatch>,
) -> ApiResult<StatusCode> {
    payload.require_undelete()?;
    let mut storage = state.storage.lock().await;
    let ids = deleted_ids::<Recipe>(&storage);

    info!("Restoring {} recipes", ids.len());
    for id in ids {
        state.artifacts.restore_recipe(&mut storage, id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn undelete_recipe_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DeletedRecordPatch>,
) -> ApiResult<Json<Recipe>> {
    payload.require_undelete()?;
    info!("Restoring recipe: {}", id);

    let mut storage = state.storage.lock().await;
    Ok(Json(state.artifacts.restore_recipe(&mut storage, id).await?))
}

// Public keys

pub async fn create_public_key_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PublicKeyRequest>,
) -> ApiResult<(StatusCode, Json<PublicKey>)> {
    info!("Creating public key: {}", payload.name);

    let key = PublicKey::from_request(payload)?;
    let mut storage = state.storage.lock().await;
    let key = storage.create(key)?;
    Ok((StatusCode::CREATED, Json(key)))
}

pub async fn delete_public_key_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    info!("Deleting public key: {}", id);

    let mut storage = state.storage.lock().await;
    storage.get_live::<PublicKey>(id)?;
    storage.soft_delete::<PublicKey>(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_public_keys_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<StatusCode> {
    let mut storage = state.storage.lock().await;
    let ids = live_ids::<PublicKey>(&storage);

    info!("Deleting {} public keys", ids.len());
    for id in ids {
        storage.soft_delete::<PublicKey>(id)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn undelete_public_keys_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DeletedRecordPatch>,
) -> ApiResult<StatusCode> {
    payload.require_undelete()?;
    let mut storage = state.storage.lock().await;
    let ids = deleted_ids::<PublicKey>(&storage);

    info!("Restoring {} public keys", ids.len());
    for id in ids {
        storage.restore::<PublicKey>(id)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn undelete_public_key_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DeletedRecordPatch>,
) -> ApiResult<Json<PublicKey>> {
    payload.require_undelete()?;
    info!("Restoring public key: {}", id);

    let mut storage = state.storage.lock().await;
    Ok(Json(storage.restore::<PublicKey>(id)?))
}

// Remote build nodes

pub async fn create_remote_build_node_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RemoteBuildNodeRequest>,
) -> ApiResult<(StatusCode, Json<RemoteBuildNode>)> {
    info!("Adding remote build node: {}", payload.hostname);

    let node = RemoteBuildNode::from_request(payload)?;
    let mut storage = state.storage.lock().await;
    if storage
        .list::<RemoteBuildNode>(false)
        .any(|existing| existing.hostname == node.hostname)
    {
        return Err(ApiError::bad_request(format!(
            "Remote build node {} already exists",
            node.hostname
        )));
    }
    let node = storage.create(node)?;
    Ok((StatusCode::CREATED, Json(node)))
}

pub async fn delete_remote_build_node_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    info!("Removing remote build node: {}", id);

    let mut storage = state.storage.lock().await;
    storage.get_live::<RemoteBuildNode>(id)?;
    remove_remote_build_node(&mut storage, id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_remote_build_nodes_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<StatusCode> {
    let mut storage = state.storage.lock().await;
    let ids = live_ids::<RemoteBuildNode>(&storage);

    info!("Removing {} remote build nodes", ids.len());
    for id in ids {
        remove_remote_build_node(&mut storage, id)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Jobs already placed on the node keep running there
fn remove_remote_build_node(storage: &mut Storage, id: Uuid) -> Result<(), Error> {
    let active = balancer::active_jobs(storage.list::<Job>(false))
        .get(&id)
        .copied()
        .unwrap_or(0);
    if active > 0 {
        warn!("Remote build node {} removed with {} active jobs", id, active);
    }
    storage.soft_delete::<RemoteBuildNode>(id)?;
    Ok(())
}

/// Every live node with the number of jobs it is running
pub async fn remote_build_node_status_handler(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<NodeLoad>> {
    let storage = state.storage.lock().await;
    Json(balancer::node_loads(
        storage.list::<RemoteBuildNode>(false),
        storage.list::<Job>(false),
    ))
}

// Jobs

/// Optional filters on job listing and bulk deletion
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |status| job.status == status)
            && self.job_type.map_or(true, |job_type| job.job_type == job_type)
    }
}

pub async fn list_jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<JobFilter>,
) -> Json<Vec<Job>> {
    let storage = state.storage.lock().await;
    Json(
        storage
            .list::<Job>(false)
            .filter(|job| filter.matches(job))
            .cloned()
            .collect(),
    )
}

pub async fn create_job_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<JobRequest>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    info!(
        "Creating {} job for artifact {}",
        payload.job_type, payload.artifact_id
    );

    let mut storage = state.storage.lock().await;
    let job = state.orchestrator.create_job(&mut storage, payload).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Status callback from a running job
pub async fn update_job_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StatusUpdate>,
) -> ApiResult<Json<Job>> {
    info!("Status callback for job {}: {}", id, payload.status);

    let mut storage = state.storage.lock().await;
    Ok(Json(state.orchestrator.update_status(&mut storage, id, payload)?))
}

pub async fn delete_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    info!("Deleting job: {}", id);

    let mut storage = state.storage.lock().await;
    storage.get_live::<Job>(id)?;
    state.orchestrator.delete_job(&mut storage, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Delete every live job matching the filter
pub async fn delete_jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<JobFilter>,
) -> ApiResult<StatusCode> {
    let mut storage = state.storage.lock().await;
    let ids: Vec<Uuid> = storage
        .list::<Job>(false)
        .filter(|job| filter.matches(job))
        .map(|job| job.id)
        .collect();

    info!("Deleting {} jobs", ids.len());
    for id in ids {
        state.orchestrator.delete_job(&mut storage, id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}
