//! Job records and the job status state machine

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{require_non_empty, Arch, ExtraFields, Record};
use crate::{Error, Result};

pub const DEFAULT_BUILD_ENV_SIZE_GB: u32 = 15;
pub const DEFAULT_JOB_MEM_SIZE_GB: u32 = 8;
/// Upper bound on `build_env_size`; jobs request up to five times this
pub const MAX_BUILD_ENV_SIZE_GB: u32 = 1024;
/// Upper bound on `job_mem_size`; jobs are limited to five times this
pub const MAX_JOB_MEM_SIZE_GB: u32 = 1024;
pub const DEFAULT_INITRD_FILE_NAME: &str = "initrd";
pub const DEFAULT_KERNEL_PARAMETERS_FILE_NAME: &str = "kernel-parameters";

/// Name of the SSH container added to debug create jobs
pub const DEBUG_CONTAINER_NAME: &str = "debug";
/// Name of the SSH container customize jobs get when none is requested
pub const CUSTOMIZE_CONTAINER_NAME: &str = "customize";

/// What a job does with its artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Build a new image from a recipe
    Create,
    /// Modify an existing image
    Customize,
}

impl JobType {
    /// Record kind the job's `artifact_id` must refer to
    pub fn artifact_kind(&self) -> &'static str {
        match self {
            JobType::Create => "recipe",
            JobType::Customize => "image",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Create => "create",
            JobType::Customize => "customize",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job status
///
/// Jobs move forward through the stages below and end in `success` or
/// `error`. `error` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Record persisted, nothing submitted yet
    Pending,
    /// Submitted to the scheduler
    Creating,
    FetchingImage,
    FetchingRecipe,
    /// Create job init stage
    WaitingForRepos,
    #[serde(alias = "building_image")]
    Building,
    #[serde(alias = "packaging_artifacts")]
    Packaging,
    /// Customize job waiting for the user to finish
    #[serde(alias = "waiting_on_user")]
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Creating => 1,
            JobStatus::FetchingImage | JobStatus::FetchingRecipe => 2,
            JobStatus::WaitingForRepos => 3,
            JobStatus::Building | JobStatus::Running => 4,
            JobStatus::Packaging => 5,
            JobStatus::Success | JobStatus::Error => 6,
        }
    }

    /// Whether a job in this status may move to `next`.
    ///
    /// Nothing leaves a terminal status. A `pending` job has not been
    /// submitted and can only become `creating` or `error`. Otherwise
    /// `error` is always allowed and any other status must not be an
    /// earlier stage. Repeating the current stage is accepted so retried
    /// callbacks are harmless.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == JobStatus::Pending {
            return matches!(next, JobStatus::Creating | JobStatus::Error);
        }
        next == JobStatus::Error || next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Creating => "creating",
            JobStatus::FetchingImage => "fetching_image",
            JobStatus::FetchingRecipe => "fetching_recipe",
            JobStatus::WaitingForRepos => "waiting_for_repos",
            JobStatus::Building => "building",
            JobStatus::Packaging => "packaging",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to reach an SSH container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
}

/// SSH container attached to a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshContainer {
    pub name: String,

    #[serde(default)]
    pub jail: bool,

    #[serde(default = "default_container_status")]
    pub status: String,

    /// Keyed by access path, `customer_access` and `cluster.local`
    #[serde(default)]
    pub connection_info: BTreeMap<String, ConnectionInfo>,
}

fn default_container_status() -> String {
    "pending".to_string()
}

/// SSH container requested by the user
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshContainerRequest {
    pub name: String,

    #[serde(default)]
    pub jail: bool,
}

/// Job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,

    pub created: DateTime<Utc>,

    pub job_type: JobType,

    /// Recipe id for create jobs, image id for customize jobs
    pub artifact_id: Uuid,

    pub public_key_id: Uuid,

    pub status: JobStatus,

    #[serde(default)]
    pub arch: Arch,

    #[serde(default)]
    pub require_dkms: bool,

    pub kernel_file_name: String,

    pub initrd_file_name: String,

    pub kernel_parameters_file_name: String,

    pub image_root_archive_name: String,

    #[serde(default)]
    pub enable_debug: bool,

    /// Size of the build environment in GiB
    pub build_env_size: u32,

    /// Memory of the build job in GiB
    pub job_mem_size: u32,

    /// Assigned remote build node; never changes once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_build_node: Option<Uuid>,

    #[serde(default)]
    pub ssh_containers: Vec<SshContainer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_job: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_service: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_container_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resultant_image_id: Option<Uuid>,

    /// Diagnostic for the last failure or status message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Set when the job reaches a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl Job {
    /// Create a pending job from a validated request
    pub fn new(request: &JobRequest, arch: Arch, require_dkms: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            created: Utc::now(),
            job_type: request.job_type,
            artifact_id: request.artifact_id,
            public_key_id: request.public_key_id,
            status: JobStatus::Pending,
            arch,
            require_dkms,
            kernel_file_name: request
                .kernel_file_name
                .clone()
                .unwrap_or_else(|| arch.default_kernel_file_name().to_string()),
            initrd_file_name: request.initrd_file_name.clone(),
            kernel_parameters_file_name: request.kernel_parameters_file_name.clone(),
            image_root_archive_name: request.image_root_archive_name.clone(),
            enable_debug: request.enable_debug,
            build_env_size: request.build_env_size,
            job_mem_size: request.job_mem_size,
            remote_build_node: None,
            ssh_containers: Vec::new(),
            kubernetes_job: None,
            kubernetes_service: None,
            kubernetes_namespace: None,
            remote_container_name: None,
            resultant_image_id: None,
            message: None,
            completed: None,
            deleted: None,
            extra: ExtraFields::new(),
        }
    }

    /// Move the job to `next`, or fail with `InvalidTransition`
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed = Some(Utc::now());
        }
        Ok(())
    }

    /// Mark job as failed, keeping the cause
    pub fn mark_error(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Error)?;
        self.message = Some(message.into());
        Ok(())
    }

    /// Assign a remote build node; a job keeps its first assignment
    pub fn assign_remote_build_node(&mut self, node_id: Uuid) -> Result<()> {
        match self.remote_build_node {
            Some(current) if current != node_id => Err(Error::validation(format!(
                "Job {} is already assigned to remote build node {}",
                self.id, current
            ))),
            _ => {
                self.remote_build_node = Some(node_id);
                Ok(())
            }
        }
    }

    /// Counts towards a remote node's load
    pub fn is_active(&self) -> bool {
        !self.is_deleted() && !self.status.is_terminal()
    }
}

impl Record for Job {
    const KIND: &'static str = "job";
    const COLLECTION: &'static str = "jobs";
    const PATCHABLE: &'static [&'static str] = &[];

    fn id(&self) -> Uuid {
        self.id
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn deleted(&self) -> Option<DateTime<Utc>> {
        self.deleted
    }

    fn set_deleted(&mut self, deleted: Option<DateTime<Utc>>) {
        self.deleted = deleted;
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("image_root_archive_name", &self.image_root_archive_name)?;
        require_non_empty("kernel_file_name", &self.kernel_file_name)?;
        require_non_empty("initrd_file_name", &self.initrd_file_name)?;
        if self.ssh_containers.len() > 1 {
            return Err(Error::validation("Only one SSH container is supported"));
        }
        Ok(())
    }
}

fn default_build_env_size() -> u32 {
    DEFAULT_BUILD_ENV_SIZE_GB
}

fn default_job_mem_size() -> u32 {
    DEFAULT_JOB_MEM_SIZE_GB
}

fn default_initrd_file_name() -> String {
    DEFAULT_INITRD_FILE_NAME.to_string()
}

fn default_kernel_parameters_file_name() -> String {
    DEFAULT_KERNEL_PARAMETERS_FILE_NAME.to_string()
}

/// User input for a new job
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRequest {
    pub job_type: JobType,

    pub artifact_id: Uuid,

    pub public_key_id: Uuid,

    pub image_root_archive_name: String,

    #[serde(default)]
    pub enable_debug: bool,

    #[serde(default = "default_build_env_size")]
    pub build_env_size: u32,

    #[serde(default = "default_job_mem_size")]
    pub job_mem_size: u32,

    /// Defaults by architecture
    #[serde(default)]
    pub kernel_file_name: Option<String>,

    #[serde(default = "default_initrd_file_name")]
    pub initrd_file_name: String,

    #[serde(default = "default_kernel_parameters_file_name")]
    pub kernel_parameters_file_name: String,

    #[serde(default)]
    pub require_dkms: Option<bool>,

    #[serde(default)]
    pub ssh_containers: Option<Vec<SshContainerRequest>>,

    #[serde(default)]
    pub remote_build_node: Option<Uuid>,
}

impl JobRequest {
    /// Field rules that need no other records
    pub fn validate(&self) -> Result<()> {
        require_non_empty("image_root_archive_name", &self.image_root_archive_name)?;
        if !(1..=MAX_BUILD_ENV_SIZE_GB).contains(&self.build_env_size) {
            return Err(Error::validation(format!(
                "build_env_size must be between 1 and {}",
                MAX_BUILD_ENV_SIZE_GB
            )));
        }
        if !(1..=MAX_JOB_MEM_SIZE_GB).contains(&self.job_mem_size) {
            return Err(Error::validation(format!(
                "job_mem_size must be between 1 and {}",
                MAX_JOB_MEM_SIZE_GB
            )));
        }
        if let Some(containers) = &self.ssh_containers {
            if self.job_type == JobType::Create {
                return Err(Error::validation(
                    "Create jobs may not define SSH containers",
                ));
            }
            if containers.len() > 1 {
                return Err(Error::validation("Only one SSH container is supported"));
            }
            for container in containers {
                require_non_empty("ssh_containers.name", &container.name)?;
            }
        }
        Ok(())
    }
}

/// Status callback sent by a running job
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusUpdate {
    pub status: JobStatus,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub resultant_image_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(job_type: &str) -> JobRequest {
        serde_json::from_value(json!({
            "job_type": job_type,
            "artifact_id": Uuid::new_v4(),
            "public_key_id": Uuid::new_v4(),
            "image_root_archive_name": "compute"
        }))
        .unwrap()
    }

    #[test]
    fn test_request_defaults() {
        let request = request("create");
        assert_eq!(request.build_env_size, 15);
        assert_eq!(request.job_mem_size, 8);
        assert_eq!(request.initrd_file_name, "initrd");
        assert_eq!(request.kernel_parameters_file_name, "kernel-parameters");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_kernel_file_name_follows_arch() {
        let request = request("customize");
        assert_eq!(Job::new(&request, Arch::X86_64, true).kernel_file_name, "vmlinuz");
        assert_eq!(Job::new(&request, Arch::Aarch64, true).kernel_file_name, "Image");
    }

    #[test]
    fn test_create_jobs_reject_ssh_containers() {
        let mut request = request("create");
        request.ssh_containers = Some(vec![SshContainerRequest {
            name: "mine".to_string(),
            jail: false,
        }]);
        assert!(request.validate().is_err());

        request.job_type = JobType::Customize;
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_forward_transitions() {
        let mut job = Job::new(&request("create"), Arch::X86_64, true);
        job.transition(JobStatus::Creating).unwrap();
        job.transition(JobStatus::Building).unwrap();
        job.transition(JobStatus::Building).unwrap();
        job.transition(JobStatus::Success).unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert!(job.completed.is_some());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut job = Job::new(&request("create"), Arch::X86_64, true);
        job.transition(JobStatus::Creating).unwrap();
        job.transition(JobStatus::Success).unwrap();

        let err = job.transition(JobStatus::Building).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(job.transition(JobStatus::Error).is_err());
        assert_eq!(job.status, JobStatus::Success);
    }

    #[test]
    fn test_no_regression_but_error_always_allowed() {
        let mut job = Job::new(&request("create"), Arch::X86_64, true);
        job.transition(JobStatus::Creating).unwrap();
        job.transition(JobStatus::Packaging).unwrap();
        assert!(job.transition(JobStatus::Building).is_err());
        assert!(job.transition(JobStatus::Creating).is_err());

        job.mark_error("disk full").unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.message.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_pending_straight_to_error() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Error));
    }

    #[test]
    fn test_pending_waits_for_submission() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Creating));
        for next in [JobStatus::Building, JobStatus::Running, JobStatus::Success] {
            assert!(!JobStatus::Pending.can_transition_to(next), "pending -> {}", next);
        }

        let mut job = Job::new(&request("customize"), Arch::X86_64, true);
        assert!(job.transition(JobStatus::Success).is_err());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_sizes_are_bounded() {
        let mut request = request("customize");
        request.build_env_size = 2_000_000_000;
        assert!(matches!(request.validate(), Err(Error::Validation(_))));

        request.build_env_size = MAX_BUILD_ENV_SIZE_GB;
        assert!(request.validate().is_ok());

        request.job_mem_size = MAX_JOB_MEM_SIZE_GB + 1;
        assert!(matches!(request.validate(), Err(Error::Validation(_))));

        request.job_mem_size = 0;
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_status_aliases() {
        let status: JobStatus = serde_json::from_value(json!("building_image")).unwrap();
        assert_eq!(status, JobStatus::Building);
        let status: JobStatus = serde_json::from_value(json!("waiting_on_user")).unwrap();
        assert_eq!(status, JobStatus::Running);
        assert_eq!(serde_json::to_value(JobStatus::WaitingForRepos).unwrap(), "waiting_for_repos");
    }

    #[test]
    fn test_remote_build_node_is_sticky() {
        let mut job = Job::new(&request("customize"), Arch::X86_64, true);
        let node = Uuid::new_v4();
        job.assign_remote_build_node(node).unwrap();
        job.assign_remote_build_node(node).unwrap();
        assert!(job.assign_remote_build_node(Uuid::new_v4()).is_err());
        assert_eq!(job.remote_build_node, Some(node));
    }
}
