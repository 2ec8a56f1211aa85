//! Job orchestrator
//!
//! Creates jobs, applies status callbacks and tears jobs down. A job record
//! is persisted as `pending` before anything is submitted; from then on a
//! failure leaves the record in `error` with the cause as its message.

use std::sync::Arc;

use ims_common::models::{
    Arch, ArtifactLink, ConnectionInfo, Image, Job, JobRequest, JobStatus, JobType, PublicKey,
    Recipe, RemoteBuildNode, SshContainer, StatusUpdate, CUSTOMIZE_CONTAINER_NAME,
    DEBUG_CONTAINER_NAME,
};
use ims_common::{Error, Record, Result};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifacts::ArtifactManager;
use crate::balancer;
use crate::config::Config;
use crate::remote::{container_image, package_build_context, RemoteExecutor, RemoteLaunch};
use crate::scheduler::{JobHandle, Scheduler};
use crate::storage::Storage;
use crate::templates::{template_name, TemplateRenderer, TemplateValues};

const SSH_PORT: u16 = 22;
const DKMS_SERVICE_ACCOUNT: &str = "ims-service-job-mount";
const DKMS_CAPABILITY: &str = "SYS_ADMIN";

/// The record a job works on
#[derive(Debug, Clone)]
enum JobArtifact {
    Recipe(Recipe),
    Image(Image),
}

impl JobArtifact {
    fn arch(&self) -> Arch {
        match self {
            JobArtifact::Recipe(recipe) => recipe.arch,
            JobArtifact::Image(image) => image.arch,
        }
    }
}

pub fn kubernetes_job_name(job: &Job) -> String {
    format!("cray-ims-{}-{}", job.id, job.job_type)
}

pub fn kubernetes_service_name(job_id: Uuid) -> String {
    format!("cray-ims-{}-service", job_id)
}

/// `gib * factor` as a Kubernetes quantity
fn scaled_gib(gib: u32, factor: u32, field: &str) -> Result<String> {
    gib.checked_mul(factor)
        .map(|size| format!("{}Gi", size))
        .ok_or_else(|| Error::validation(format!("{} of {} GiB is too large", field, gib)))
}

/// Boolean as the job containers expect it
fn flag(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    scheduler: Arc<dyn Scheduler>,
    remote: Arc<dyn RemoteExecutor>,
    artifacts: Arc<ArtifactManager>,
    templates: TemplateRenderer,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        scheduler: Arc<dyn Scheduler>,
        remote: Arc<dyn RemoteExecutor>,
        artifacts: Arc<ArtifactManager>,
        templates: TemplateRenderer,
    ) -> Self {
        Self {
            config,
            scheduler,
            remote,
            artifacts,
            templates,
        }
    }

    /// Validate a job request, persist the job and launch it.
    ///
    /// Caller errors are returned before anything is written. Once the job
    /// record exists, a failure marks it `error` and is then returned.
    pub async fn create_job(&self, storage: &mut Storage, request: JobRequest) -> Result<Job> {
        request.validate()?;
        JobSizes::from_request(&request)?;

        let artifact = resolve_artifact(storage, &request)?;
        let public_key = storage.get_live::<PublicKey>(request.public_key_id)?;
        let arch = artifact.arch();

        let requested_node = match request.remote_build_node {
            Some(node_id) => Some(check_requested_node(storage, node_id, arch)?),
            None => None,
        };

        let download = self.download_link(&artifact).await?;

        let mut job = Job::new(&request, arch, self.require_dkms(&request, &artifact));
        job.kubernetes_namespace = Some(self.config.job_namespace.clone());
        job.kubernetes_service = Some(kubernetes_service_name(job.id));
        job.ssh_containers = self.ssh_containers(&request, &job);

        let node = match requested_node {
            Some(node) => Some(node),
            None => self.offload_target(storage, &job)?,
        };
        if let Some(node) = &node {
            job.assign_remote_build_node(node.id)?;
        }

        let job = storage.create(job)?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            artifact_id = %job.artifact_id,
            remote_build_node = ?node.as_ref().map(|n| n.hostname.as_str()),
            "Created job"
        );

        let job_id = job.id;
        match self
            .launch(storage, job, &artifact, &public_key, node.as_ref(), &download)
            .await
        {
            Ok(job) => Ok(job),
            Err(e) => {
                error!(job_id = %job_id, "Failed to launch job: {}", e);
                self.record_failure(storage, job_id, &e);
                Err(e)
            }
        }
    }

    /// Render, submit and, for remote jobs, start the remote container
    async fn launch(
        &self,
        storage: &mut Storage,
        mut job: Job,
        artifact: &JobArtifact,
        public_key: &PublicKey,
        node: Option<&RemoteBuildNode>,
        download: &ArtifactLink,
    ) -> Result<Job> {
        let recipe_type = match artifact {
            JobArtifact::Recipe(recipe) => Some(recipe.recipe_type),
            JobArtifact::Image(_) => None,
        };
        let sizes = JobSizes::from_job(&job)?;
        let values = self.template_values(&job, &sizes, artifact, public_key, node, download)?;
        let spec = self
            .templates
            .render(&template_name(job.job_type, recipe_type), &values)?;

        let handle = self.submit(&spec).await?;
        job.transition(JobStatus::Creating)?;
        job.kubernetes_job = Some(handle.name.clone());
        job.kubernetes_namespace = Some(handle.namespace.clone());
        let mut job = storage.replace(job)?;
        debug!(job_id = %job.id, "Job submitted as {}/{}", handle.namespace, handle.name);

        if let Some(node) = node {
            match self.launch_remote_with_timeout(node, job.id, &spec).await {
                Ok(container_name) => {
                    job.remote_container_name = Some(container_name);
                    job = storage.replace(job)?;
                }
                Err(e) => {
                    self.remove_scheduled(&handle).await;
                    return Err(e);
                }
            }
        }

        Ok(job)
    }

    async fn submit(&self, spec: &Value) -> Result<JobHandle> {
        let timeout = self.config.submit_timeout();
        match tokio::time::timeout(timeout, self.scheduler.submit_job(spec)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Scheduler(format!(
                "Job submission timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn launch_remote_with_timeout(
        &self,
        node: &RemoteBuildNode,
        job_id: Uuid,
        spec: &Value,
    ) -> Result<String> {
        let timeout = self.config.submit_timeout();
        match tokio::time::timeout(timeout, self.launch_remote(node, job_id, spec)).await {
            Ok(result) => result,
            Err(_) => Err(Error::RemoteExecution(format!(
                "Launch on remote build node {} timed out after {}s",
                node.hostname,
                timeout.as_secs()
            ))),
        }
    }

    async fn launch_remote(&self, node: &RemoteBuildNode, job_id: Uuid, spec: &Value) -> Result<String> {
        let launch = RemoteLaunch {
            job_id,
            image: container_image(spec)?,
            context: package_build_context(spec)?,
        };
        self.remote.launch(node, &launch).await
    }

    /// Best-effort removal of a submitted job whose launch failed later on
    async fn remove_scheduled(&self, handle: &JobHandle) {
        match self.scheduler.delete_job(handle).await {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(e) => warn!("Failed to remove job {}/{}: {}", handle.namespace, handle.name, e),
        }
    }

    /// Put a job into `error`, keeping `cause` as its message
    fn record_failure(&self, storage: &mut Storage, job_id: Uuid, cause: &Error) {
        let result = storage.get::<Job>(job_id).and_then(|mut job| {
            job.mark_error(cause.to_string())?;
            storage.replace(job)
        });
        if let Err(e) = result {
            error!(job_id = %job_id, "Failed to record job failure: {}", e);
        }
    }

    fn require_dkms(&self, request: &JobRequest, artifact: &JobArtifact) -> bool {
        if artifact.arch() == Arch::Aarch64 {
            return true;
        }
        if let Some(require_dkms) = request.require_dkms {
            return require_dkms;
        }
        match artifact {
            JobArtifact::Recipe(recipe) => recipe.require_dkms,
            JobArtifact::Image(_) => self.config.job_enable_dkms,
        }
    }

    fn ssh_containers(&self, request: &JobRequest, job: &Job) -> Vec<SshContainer> {
        let wanted = match job.job_type {
            JobType::Create if job.enable_debug => Some((DEBUG_CONTAINER_NAME.to_string(), false)),
            JobType::Create => None,
            JobType::Customize => Some(
                request
                    .ssh_containers
                    .as_ref()
                    .and_then(|containers| containers.first())
                    .map(|c| (c.name.clone(), c.jail))
                    .unwrap_or_else(|| (CUSTOMIZE_CONTAINER_NAME.to_string(), false)),
            ),
        };

        let Some((name, jail)) = wanted else {
            return Vec::new();
        };

        let cluster_host = format!(
            "{}.{}.svc.cluster.local",
            kubernetes_service_name(job.id),
            self.config.job_namespace
        );
        let connection_info = [
            ("customer_access", self.config.job_hostname(&job.id)),
            ("cluster.local", cluster_host),
        ]
        .into_iter()
        .map(|(path, host)| (path.to_string(), ConnectionInfo { host, port: SSH_PORT }))
        .collect();

        vec![SshContainer {
            name,
            jail,
            status: "pending".to_string(),
            connection_info,
        }]
    }

    /// Least-loaded node for an offloaded customize job, if any
    fn offload_target(&self, storage: &Storage, job: &Job) -> Result<Option<RemoteBuildNode>> {
        if job.job_type != JobType::Customize || !self.config.remote_offload {
            return Ok(None);
        }
        match balancer::select_node(
            storage.list::<RemoteBuildNode>(false),
            storage.list::<Job>(false),
            job.arch,
        ) {
            Ok(node) => Ok(Some(node.clone())),
            Err(Error::NoAvailableNode(arch)) => {
                debug!("No remote build node for {}, running job locally", arch);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// What the job downloads: the recipe archive or the image rootfs
    async fn download_link(&self, artifact: &JobArtifact) -> Result<ArtifactLink> {
        match artifact {
            JobArtifact::Recipe(recipe) => {
                let link = recipe.link.clone().ok_or_else(|| {
                    Error::validation(format!("Recipe {} has no archive uploaded", recipe.id))
                })?;
                self.artifacts.validate_artifact(&link).await?;
                Ok(link)
            }
            JobArtifact::Image(image) => {
                let manifest_link = match &image.link {
                    Some(link) if image.is_complete() => link,
                    _ => {
                        return Err(Error::validation(format!(
                            "Image {} has no manifest",
                            image.id
                        )))
                    }
                };
                let manifest = self.artifacts.read_manifest(manifest_link).await?;
                let rootfs = manifest.rootfs()?;
                rootfs.link.clone().ok_or_else(|| {
                    Error::validation(format!("Image {} rootfs artifact has no link", image.id))
                })
            }
        }
    }

    fn template_values(
        &self,
        job: &Job,
        sizes: &JobSizes,
        artifact: &JobArtifact,
        public_key: &PublicKey,
        node: Option<&RemoteBuildNode>,
        download: &ArtifactLink,
    ) -> Result<TemplateValues> {
        let config = &self.config;
        let ssh_jail = job.ssh_containers.first().map(|c| c.jail).unwrap_or(false);

        let runtime_class = if node.is_some() {
            None
        } else if job.arch == Arch::Aarch64 {
            Some(config.job_aarch64_runtime.clone())
        } else if job.require_dkms {
            Some(config.job_kata_runtime.clone())
        } else {
            None
        };
        let (service_account, capabilities) = if job.require_dkms {
            (Some(DKMS_SERVICE_ACCOUNT), vec![DKMS_CAPABILITY])
        } else {
            (None, Vec::new())
        };

        let mut values: TemplateValues = [
            ("id", json!(job.id)),
            ("job_name", json!(kubernetes_job_name(job))),
            ("namespace", json!(config.job_namespace)),
            ("callback_url", json!(config.callback_url)),
            ("size_gb", json!(sizes.size)),
            ("limit_gb", json!(sizes.limit)),
            ("pvc_gb", json!(sizes.pvc)),
            ("job_mem_size", json!(sizes.mem)),
            ("job_mem_limit", json!(sizes.mem_limit)),
            ("download_url", json!(download.path)),
            ("download_etag", json!(download.etag)),
            ("public_key", json!(public_key.public_key)),
            ("enable_debug", json!(flag(job.enable_debug))),
            ("ssh_jail", json!(flag(ssh_jail))),
            ("image_root_archive_name", json!(job.image_root_archive_name)),
            ("kernel_filename", json!(job.kernel_file_name)),
            ("initrd_filename", json!(job.initrd_file_name)),
            ("kernel_parameters_filename", json!(job.kernel_parameters_file_name)),
            ("address_pool", json!(config.customer_access_address_pool)),
            ("hostname", json!(config.job_hostname(&job.id))),
            ("s3_bucket", json!(config.boot_images_bucket)),
            ("job_enable_dkms", json!(flag(job.require_dkms))),
            ("runtime_class", json!(runtime_class)),
            ("service_account", json!(service_account)),
            ("security_privilege", json!(job.require_dkms)),
            ("security_capabilities", json!(capabilities)),
            ("arch", json!(job.arch)),
            (
                "remote_build_node",
                json!(node.map(|n| n.hostname.as_str()).unwrap_or_default()),
            ),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();

        if let JobArtifact::Recipe(recipe) = artifact {
            let dictionary = serde_json::to_string(&recipe.template_values())?;
            values.insert("template_dictionary".to_string(), json!(dictionary));
            values.insert("recipe_type".to_string(), json!(recipe.recipe_type));
        }

        Ok(values)
    }

    /// Apply a status callback.
    ///
    /// Backward moves and anything after a terminal status are rejected
    /// with `InvalidTransition` and leave the job unchanged.
    pub fn update_status(&self, storage: &mut Storage, id: Uuid, update: StatusUpdate) -> Result<Job> {
        let mut job = storage.get_live::<Job>(id)?;

        if let Err(e) = job.transition(update.status) {
            warn!(job_id = %id, "Rejected status callback: {}", e);
            return Err(e);
        }
        if update.message.is_some() {
            job.message = update.message;
        }
        if update.resultant_image_id.is_some() {
            job.resultant_image_id = update.resultant_image_id;
        }

        let job = storage.replace(job)?;
        if job.status.is_terminal() {
            info!(
                job_id = %id,
                status = %job.status,
                resultant_image_id = ?job.resultant_image_id,
                "Job finished"
            );
        } else {
            debug!(job_id = %id, status = %job.status, "Job status updated");
        }
        Ok(job)
    }

    /// Remove the scheduled job and any remote container, then soft-delete
    /// the record
    pub async fn delete_job(&self, storage: &mut Storage, id: Uuid) -> Result<Job> {
        let job = storage.get::<Job>(id)?;
        if job.is_deleted() {
            return Ok(job);
        }

        if let (Some(name), Some(namespace)) = (&job.kubernetes_job, &job.kubernetes_namespace) {
            let handle = JobHandle {
                namespace: namespace.clone(),
                name: name.clone(),
            };
            match self.scheduler.delete_job(&handle).await {
                Ok(()) => {}
                Err(Error::NotFound { .. }) => {
                    debug!(job_id = %id, "Scheduled job {} already gone", name);
                }
                Err(e) => return Err(e),
            }
        }

        if let (Some(node_id), Some(container)) = (job.remote_build_node, &job.remote_container_name) {
            match storage.get::<RemoteBuildNode>(node_id) {
                Ok(node) => {
                    if let Err(e) = self.remote.stop(&node, container).await {
                        warn!(job_id = %id, "Failed to stop remote container {}: {}", container, e);
                    }
                }
                Err(e) => warn!(job_id = %id, "Cannot stop remote container {}: {}", container, e),
            }
        }

        let job = storage.soft_delete::<Job>(id)?;
        info!(job_id = %id, "Deleted job");
        Ok(job)
    }
}

/// Resource quantities handed to the job templates
#[derive(Debug, Clone, PartialEq)]
struct JobSizes {
    size: String,
    limit: String,
    pvc: String,
    mem: String,
    mem_limit: String,
}

impl JobSizes {
    fn new(build_env_size: u32, job_mem_size: u32) -> Result<Self> {
        Ok(Self {
            size: scaled_gib(build_env_size, 1, "build_env_size")?,
            limit: scaled_gib(build_env_size, 3, "build_env_size")?,
            pvc: scaled_gib(build_env_size, 5, "build_env_size")?,
            mem: scaled_gib(job_mem_size, 1, "job_mem_size")?,
            mem_limit: scaled_gib(job_mem_size, 5, "job_mem_size")?,
        })
    }

    fn from_request(request: &JobRequest) -> Result<Self> {
        Self::new(request.build_env_size, request.job_mem_size)
    }

    fn from_job(job: &Job) -> Result<Self> {
        Self::new(job.build_env_size, job.job_mem_size)
    }
}

/// Load the job's artifact, checking it matches the job type
fn resolve_artifact(storage: &Storage, request: &JobRequest) -> Result<JobArtifact> {
    let id = request.artifact_id;
    let artifact = match request.job_type {
        JobType::Create => storage.get_live::<Recipe>(id).map(JobArtifact::Recipe),
        JobType::Customize => storage.get_live::<Image>(id).map(JobArtifact::Image),
    };

    match artifact {
        Err(Error::NotFound { .. }) if wrong_artifact_kind(storage, request) => {
            Err(Error::validation(format!(
                "{} jobs need a {}; artifact_id {} refers to something else",
                request.job_type,
                request.job_type.artifact_kind(),
                id
            )))
        }
        other => other,
    }
}

fn wrong_artifact_kind(storage: &Storage, request: &JobRequest) -> bool {
    let id = request.artifact_id;
    match request.job_type {
        JobType::Create => storage.get_live::<Image>(id).is_ok(),
        JobType::Customize => storage.get_live::<Recipe>(id).is_ok(),
    }
}

/// An explicitly requested node must be live, enabled and of the job's arch
fn check_requested_node(storage: &Storage, node_id: Uuid, arch: Arch) -> Result<RemoteBuildNode> {
    let node = storage.get_live::<RemoteBuildNode>(node_id)?;
    if !node.is_enabled() {
        return Err(Error::validation(format!(
            "Remote build node {} is disabled",
            node.hostname
        )));
    }
    if node.arch != arch {
        return Err(Error::validation(format!(
            "Remote build node {} is {}, the job needs {}",
            node.hostname, node.arch, arch
        )));
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{FsObjectStore, ObjectStore};
    use async_trait::async_trait;
    use ims_common::models::{
        ImageRequest, NodeStatus, PublicKeyRequest, RecipeRequest, RemoteBuildNodeRequest,
        S3Location,
    };
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeScheduler {
        submitted: Mutex<Vec<Value>>,
        deleted: Mutex<Vec<JobHandle>>,
        reject: bool,
        hang: bool,
    }

    #[async_trait]
    impl Scheduler for FakeScheduler {
        async fn submit_job(&self, spec: &Value) -> Result<JobHandle> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.reject {
                return Err(Error::Scheduler("quota exceeded".to_string()));
            }
            self.submitted.lock().unwrap().push(spec.clone());
            Ok(JobHandle {
                namespace: spec["metadata"]["namespace"].as_str().unwrap().to_string(),
                name: spec["metadata"]["name"].as_str().unwrap().to_string(),
            })
        }

        async fn delete_job(&self, handle: &JobHandle) -> Result<()> {
            self.deleted.lock().unwrap().push(handle.clone());
            Err(Error::not_found("kubernetes job", &handle.name))
        }
    }

    #[derive(Default)]
    struct FakeRemote {
        launched: Mutex<Vec<(String, Uuid)>>,
        stopped: Mutex<Vec<String>>,
        fail: bool,
        hang: bool,
    }

    #[async_trait]
    impl RemoteExecutor for FakeRemote {
        async fn launch(&self, node: &RemoteBuildNode, launch: &RemoteLaunch) -> Result<String> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail {
                return Err(Error::RemoteExecution("ssh: connection refused".to_string()));
            }
            self.launched
                .lock()
                .unwrap()
                .push((node.hostname.clone(), launch.job_id));
            Ok(launch.container_name())
        }

        async fn stop(&self, _node: &RemoteBuildNode, container_name: &str) -> Result<()> {
            self.stopped.lock().unwrap().push(container_name.to_string());
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        storage: Storage,
        store: Arc<FsObjectStore>,
        scheduler: Arc<FakeScheduler>,
        remote: Arc<FakeRemote>,
        orchestrator: Orchestrator,
    }

    fn fixture_with(scheduler: FakeScheduler, remote: FakeRemote, offload: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_paths(dir.path().join("data"), dir.path().join("objects")).unwrap();
        config.remote_offload = offload;
        config.submit_timeout_secs = 1;

        let store = Arc::new(FsObjectStore::new(dir.path().join("objects"), "ims"));
        let admin = Arc::new(FsObjectStore::new(dir.path().join("objects"), "sts"));
        let artifacts = Arc::new(ArtifactManager::new(store.clone(), admin, "sts"));
        let scheduler = Arc::new(scheduler);
        let remote = Arc::new(remote);

        let orchestrator = Orchestrator::new(
            Arc::new(config),
            scheduler.clone(),
            remote.clone(),
            artifacts,
            TemplateRenderer::builtin(),
        );
        Fixture {
            storage: Storage::open(dir.path().join("data")).unwrap(),
            _dir: dir,
            store,
            scheduler,
            remote,
            orchestrator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeScheduler::default(), FakeRemote::default(), false)
    }

    fn ed25519_key(comment: &str) -> String {
        use base64::Engine;
        let mut blob = Vec::new();
        blob.extend_from_slice(&11u32.to_be_bytes());
        blob.extend_from_slice(b"ssh-ed25519");
        blob.extend_from_slice(&32u32.to_be_bytes());
        blob.extend_from_slice(&[42u8; 32]);
        format!(
            "ssh-ed25519 {} {}",
            base64::engine::general_purpose::STANDARD.encode(blob),
            comment
        )
    }

    fn add_key(f: &mut Fixture) -> Uuid {
        let key = PublicKey::from_request(PublicKeyRequest {
            name: "admin".to_string(),
            public_key: ed25519_key("admin@host"),
        })
        .unwrap();
        f.storage.create(key).unwrap().id
    }

    async fn add_recipe(f: &mut Fixture, arch: Arch, require_dkms: bool) -> Uuid {
        let location = S3Location::new("ims", format!("recipes/{}/recipe.tgz", Uuid::new_v4()));
        let etag = f.store.put_object(&location, b"recipe archive".to_vec()).await.unwrap();
        let request: RecipeRequest = serde_json::from_value(json!({
            "name": "compute",
            "recipe_type": "kiwi-ng",
            "linux_distribution": "sles15",
            "arch": arch,
            "require_dkms": require_dkms,
            "link": {"path": location.to_string(), "etag": etag, "type": "s3"},
            "template_dictionary": [{"key": "CSM_RELEASE_VERSION", "value": "1.5"}]
        }))
        .unwrap();
        f.storage.create(Recipe::from_request(request).unwrap()).unwrap().id
    }

    async fn add_image(f: &mut Fixture, arch: Arch) -> Uuid {
        let id = Uuid::new_v4();
        let rootfs = S3Location::new("boot-images", format!("{}/rootfs", id));
        let rootfs_etag = f.store.put_object(&rootfs, b"squashfs".to_vec()).await.unwrap();
        let manifest = json!({
            "version": "1.0",
            "created": "2024-01-01 00:00:00",
            "artifacts": [{
                "type": "application/vnd.cray.image.rootfs.squashfs",
                "link": {"path": rootfs.to_string(), "etag": rootfs_etag, "type": "s3"},
                "md5": "0"
            }]
        });
        let manifest_location = S3Location::new("boot-images", format!("{}/manifest.json", id));
        let etag = f
            .store
            .put_object(&manifest_location, serde_json::to_vec(&manifest).unwrap())
            .await
            .unwrap();

        let image = Image::from_request(ImageRequest {
            name: "compute-image".to_string(),
            link: Some(ArtifactLink::s3(&manifest_location, etag)),
            arch,
            metadata: Default::default(),
        })
        .unwrap();
        f.storage.create(image).unwrap().id
    }

    fn add_node(f: &mut Fixture, hostname: &str, arch: Arch) -> RemoteBuildNode {
        let node = RemoteBuildNode::from_request(RemoteBuildNodeRequest {
            hostname: hostname.to_string(),
            arch,
            status: NodeStatus::Enabled,
        })
        .unwrap();
        f.storage.create(node).unwrap()
    }

    fn request(job_type: &str, artifact_id: Uuid, public_key_id: Uuid, extra: Value) -> JobRequest {
        let mut body = json!({
            "job_type": job_type,
            "artifact_id": artifact_id,
            "public_key_id": public_key_id,
            "image_root_archive_name": "compute"
        });
        if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            body.extend(extra.clone());
        }
        serde_json::from_value(body).unwrap()
    }

    fn env(spec: &Value) -> std::collections::BTreeMap<String, String> {
        crate::remote::container_env(spec)
    }

    #[tokio::test]
    async fn test_create_job_submits_and_moves_to_creating() {
        let mut f = fixture();
        let key = add_key(&mut f);
        let recipe = add_recipe(&mut f, Arch::X86_64, false).await;

        let job = f
            .orchestrator
            .create_job(&mut f.storage, request("create", recipe, key, json!({})))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Creating);
        assert_eq!(job.kubernetes_job.as_deref(), Some(kubernetes_job_name(&job).as_str()));
        assert_eq!(job.kernel_file_name, "vmlinuz");
        assert!(job.ssh_containers.is_empty());
        assert!(!job.require_dkms);

        let stored = f.storage.get::<Job>(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Creating);

        let submitted = f.scheduler.submitted.lock().unwrap();
        let spec = &submitted[0];
        assert_eq!(spec["metadata"]["name"], format!("cray-ims-{}-create", job.id));
        assert_eq!(spec["metadata"]["labels"]["ims-recipe-type"], "kiwi-ng");
        let env = env(spec);
        assert_eq!(env["JOB_ENABLE_DKMS"], "False");
        let dictionary: Value = serde_json::from_str(&env["RECIPE_TEMPLATE_DICTIONARY"]).unwrap();
        assert_eq!(dictionary, json!({"CSM_RELEASE_VERSION": "1.5"}));
    }

    #[tokio::test]
    async fn test_dkms_rules() {
        let mut f = fixture();
        let key = add_key(&mut f);

        let inherits = add_recipe(&mut f, Arch::X86_64, true).await;
        let job = f
            .orchestrator
            .create_job(&mut f.storage, request("create", inherits, key, json!({})))
            .await
            .unwrap();
        assert!(job.require_dkms);

        let job = f
            .orchestrator
            .create_job(
                &mut f.storage,
                request("create", inherits, key, json!({"require_dkms": false})),
            )
            .await
            .unwrap();
        assert!(!job.require_dkms);

        let arm = add_recipe(&mut f, Arch::Aarch64, false).await;
        let job = f
            .orchestrator
            .create_job(
                &mut f.storage,
                request("create", arm, key, json!({"require_dkms": false})),
            )
            .await
            .unwrap();
        assert!(job.require_dkms);
        assert_eq!(job.kernel_file_name, "Image");

        let submitted = f.scheduler.submitted.lock().unwrap();
        assert_eq!(
            submitted[2]["spec"]["template"]["spec"]["runtimeClassName"],
            "kata-qemu"
        );
        assert_eq!(submitted[1]["spec"]["template"]["spec"]["runtimeClassName"], Value::Null);
    }

    #[tokio::test]
    async fn test_customize_job_downloads_rootfs() {
        let mut f = fixture();
        let key = add_key(&mut f);
        let image = add_image(&mut f, Arch::X86_64).await;

        let job = f
            .orchestrator
            .create_job(&mut f.storage, request("customize", image, key, json!({})))
            .await
            .unwrap();

        assert_eq!(job.ssh_containers.len(), 1);
        let container = &job.ssh_containers[0];
        assert_eq!(container.name, CUSTOMIZE_CONTAINER_NAME);
        assert_eq!(container.status, "pending");
        assert_eq!(
            container.connection_info["cluster.local"].host,
            format!("cray-ims-{}-service.ims.svc.cluster.local", job.id)
        );
        assert_eq!(container.connection_info["customer_access"].port, 22);

        let submitted = f.scheduler.submitted.lock().unwrap();
        let download = submitted[0]["spec"]["template"]["spec"]["initContainers"][0]["env"]
            .as_array()
            .unwrap()
            .iter()
            .find(|var| var["name"] == "DOWNLOAD_URL")
            .unwrap()["value"]
            .clone();
        assert_eq!(download, format!("s3://boot-images/{}/rootfs", image));
    }

    #[tokio::test]
    async fn test_caller_errors_write_nothing() {
        let mut f = fixture();
        let key = add_key(&mut f);
        let recipe = add_recipe(&mut f, Arch::X86_64, false).await;

        // wrong artifact kind
        let err = f
            .orchestrator
            .create_job(&mut f.storage, request("customize", recipe, key, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // unknown key
        let err = f
            .orchestrator
            .create_job(&mut f.storage, request("create", recipe, Uuid::new_v4(), json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        // deleted recipe
        f.storage.soft_delete::<Recipe>(recipe).unwrap();
        let err = f
            .orchestrator
            .create_job(&mut f.storage, request("create", recipe, key, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        assert_eq!(f.storage.list::<Job>(true).count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_build_env_is_rejected_before_persisting() {
        let mut f = fixture();
        let key = add_key(&mut f);
        let recipe = add_recipe(&mut f, Arch::X86_64, false).await;

        let err = f
            .orchestrator
            .create_job(
                &mut f.storage,
                request("create", recipe, key, json!({"build_env_size": 2_000_000_000u32})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(f.storage.list::<Job>(true).count(), 0);
        assert!(f.scheduler.submitted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_scaled_sizes() {
        let sizes = JobSizes::new(15, 8).unwrap();
        assert_eq!(sizes.limit, "45Gi");
        assert_eq!(sizes.pvc, "75Gi");
        assert_eq!(sizes.mem_limit, "40Gi");

        let err = JobSizes::new(u32::MAX / 3, 8).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(JobSizes::new(8, u32::MAX).is_err());
    }

    #[tokio::test]
    async fn test_image_without_manifest_cannot_be_customized() {
        let mut f = fixture();
        let key = add_key(&mut f);
        let image = Image::from_request(ImageRequest {
            name: "empty".to_string(),
            link: None,
            arch: Arch::X86_64,
            metadata: Default::default(),
        })
        .unwrap();
        let image = f.storage.create(image).unwrap().id;

        let err = f
            .orchestrator
            .create_job(&mut f.storage, request("customize", image, key, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(f.storage.list::<Job>(true).count(), 0);
    }

    #[tokio::test]
    async fn test_requested_node_must_be_enabled_and_match() {
        let mut f = fixture();
        let key = add_key(&mut f);
        let image = add_image(&mut f, Arch::X86_64).await;

        let arm = add_node(&mut f, "arm-1", Arch::Aarch64);
        let err = f
            .orchestrator
            .create_job(
                &mut f.storage,
                request("customize", image, key, json!({"remote_build_node": arm.id})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut off = add_node(&mut f, "x86-off", Arch::X86_64);
        off.status = NodeStatus::Disabled;
        f.storage.replace(off.clone()).unwrap();
        let err = f
            .orchestrator
            .create_job(
                &mut f.storage,
                request("customize", image, key, json!({"remote_build_node": off.id})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_offload_picks_least_loaded_node() {
        let mut f = fixture_with(FakeScheduler::default(), FakeRemote::default(), true);
        let key = add_key(&mut f);
        let image = add_image(&mut f, Arch::X86_64).await;
        let first = add_node(&mut f, "node-a", Arch::X86_64);
        let second = add_node(&mut f, "node-b", Arch::X86_64);

        let one = f
            .orchestrator
            .create_job(&mut f.storage, request("customize", image, key, json!({})))
            .await
            .unwrap();
        let two = f
            .orchestrator
            .create_job(&mut f.storage, request("customize", image, key, json!({})))
            .await
            .unwrap();

        assert_eq!(one.remote_build_node, Some(first.id));
        assert_eq!(two.remote_build_node, Some(second.id));
        assert_eq!(one.remote_container_name, Some(format!("ims-{}", one.id)));

        let launched = f.remote.launched.lock().unwrap();
        assert_eq!(launched[0], ("node-a".to_string(), one.id));

        let submitted = f.scheduler.submitted.lock().unwrap();
        assert_eq!(submitted[0]["spec"]["template"]["spec"]["runtimeClassName"], Value::Null);
        assert_eq!(env(&submitted[0])["REMOTE_BUILD_NODE"], "node-a");
    }

    #[tokio::test]
    async fn test_offload_without_nodes_runs_locally() {
        let mut f = fixture_with(FakeScheduler::default(), FakeRemote::default(), true);
        let key = add_key(&mut f);
        let image = add_image(&mut f, Arch::X86_64).await;

        let job = f
            .orchestrator
            .create_job(&mut f.storage, request("customize", image, key, json!({})))
            .await
            .unwrap();
        assert_eq!(job.remote_build_node, None);
        assert_eq!(job.status, JobStatus::Creating);
    }

    #[tokio::test]
    async fn test_scheduler_rejection_leaves_job_in_error() {
        let scheduler = FakeScheduler {
            reject: true,
            ..Default::default()
        };
        let mut f = fixture_with(scheduler, FakeRemote::default(), false);
        let key = add_key(&mut f);
        let recipe = add_recipe(&mut f, Arch::X86_64, false).await;

        let err = f
            .orchestrator
            .create_job(&mut f.storage, request("create", recipe, key, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Scheduler(_)));

        let jobs: Vec<&Job> = f.storage.list::<Job>(false).collect();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Error);
        assert!(jobs[0].message.as_deref().unwrap().contains("quota exceeded"));
        assert!(jobs[0].completed.is_some());
    }

    #[tokio::test]
    async fn test_submission_timeout_is_a_failure() {
        let scheduler = FakeScheduler {
            hang: true,
            ..Default::default()
        };
        let mut f = fixture_with(scheduler, FakeRemote::default(), false);
        let key = add_key(&mut f);
        let recipe = add_recipe(&mut f, Arch::X86_64, false).await;

        let err = f
            .orchestrator
            .create_job(&mut f.storage, request("create", recipe, key, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Scheduler(_)));

        let job = f.storage.list::<Job>(false).next().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.message.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_remote_failure_removes_scheduled_job() {
        let remote = FakeRemote {
            fail: true,
            ..Default::default()
        };
        let mut f = fixture_with(FakeScheduler::default(), remote, false);
        let key = add_key(&mut f);
        let image = add_image(&mut f, Arch::X86_64).await;
        let node = add_node(&mut f, "node-a", Arch::X86_64);

        let err = f
            .orchestrator
            .create_job(
                &mut f.storage,
                request("customize", image, key, json!({"remote_build_node": node.id})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteExecution(_)));
        assert_eq!(f.scheduler.deleted.lock().unwrap().len(), 1);

        let job = f.storage.list::<Job>(false).next().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.remote_build_node, Some(node.id));
    }

    #[tokio::test]
    async fn test_remote_launch_timeout_is_a_failure() {
        let remote = FakeRemote {
            hang: true,
            ..Default::default()
        };
        let mut f = fixture_with(FakeScheduler::default(), remote, false);
        let key = add_key(&mut f);
        let image = add_image(&mut f, Arch::X86_64).await;
        let node = add_node(&mut f, "node-a", Arch::X86_64);

        let err = f
            .orchestrator
            .create_job(
                &mut f.storage,
                request("customize", image, key, json!({"remote_build_node": node.id})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteExecution(_)));
        assert_eq!(f.scheduler.deleted.lock().unwrap().len(), 1);

        let job = f.storage.list::<Job>(false).next().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.message.as_deref().unwrap().contains("timed out"));
        assert_eq!(job.remote_container_name, None);
    }

    #[tokio::test]
    async fn test_status_callbacks() {
        let mut f = fixture();
        let key = add_key(&mut f);
        let recipe = add_recipe(&mut f, Arch::X86_64, false).await;
        let job = f
            .orchestrator
            .create_job(&mut f.storage, request("create", recipe, key, json!({})))
            .await
            .unwrap();

        let update = |status: JobStatus| StatusUpdate {
            status,
            message: None,
            resultant_image_id: None,
        };

        f.orchestrator
            .update_status(&mut f.storage, job.id, update(JobStatus::Building))
            .unwrap();
        let image_id = Uuid::new_v4();
        let done = f
            .orchestrator
            .update_status(
                &mut f.storage,
                job.id,
                StatusUpdate {
                    status: JobStatus::Success,
                    message: Some("done".to_string()),
                    resultant_image_id: Some(image_id),
                },
            )
            .unwrap();
        assert_eq!(done.resultant_image_id, Some(image_id));
        assert!(done.completed.is_some());

        let err = f
            .orchestrator
            .update_status(&mut f.storage, job.id, update(JobStatus::Building))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(f.storage.get::<Job>(job.id).unwrap().status, JobStatus::Success);
    }

    #[tokio::test]
    async fn test_delete_job_tolerates_missing_scheduled_job() {
        let mut f = fixture();
        let key = add_key(&mut f);
        let image = add_image(&mut f, Arch::X86_64).await;
        let node = add_node(&mut f, "node-a", Arch::X86_64);
        let job = f
            .orchestrator
            .create_job(
                &mut f.storage,
                request("customize", image, key, json!({"remote_build_node": node.id})),
            )
            .await
            .unwrap();

        let deleted = f.orchestrator.delete_job(&mut f.storage, job.id).await.unwrap();
        assert!(deleted.is_deleted());
        assert_eq!(f.remote.stopped.lock().unwrap().as_slice(), [format!("ims-{}", job.id)]);
        assert_eq!(f.storage.list::<Job>(false).count(), 0);

        // deleting again changes nothing
        let again = f.orchestrator.delete_job(&mut f.storage, job.id).await.unwrap();
        assert_eq!(again.deleted, deleted.deleted);
    }
}
