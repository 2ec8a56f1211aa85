//! Entity model shared by the record store, the orchestrator and the API.
//!
//! Every persisted entity implements [`Record`]: an immutable `id` and
//! `created` timestamp, a soft-delete timestamp, and schema validation.
//! Entities keep unknown JSON fields in a flattened `extra` map so records
//! written by newer schema versions survive a rewrite untouched.

pub mod artifact;
pub mod image;
pub mod job;
pub mod public_key;
pub mod recipe;
pub mod remote_build_node;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

pub use artifact::{ArtifactLink, S3Location, ARTIFACT_LINK_TYPE_S3, DELETED_SUFFIX};
pub use image::{Image, ImageManifest, ImageRequest, ManifestArtifact};
pub use job::{
    ConnectionInfo, Job, JobRequest, JobStatus, JobType, SshContainer, SshContainerRequest,
    StatusUpdate, CUSTOMIZE_CONTAINER_NAME, DEBUG_CONTAINER_NAME,
};
pub use public_key::{PublicKey, PublicKeyRequest};
pub use recipe::{LinuxDistribution, Recipe, RecipeRequest, RecipeType, TemplateEntry};
pub use remote_build_node::{NodeStatus, RemoteBuildNode, RemoteBuildNodeRequest};

/// Unknown fields carried through a read/rewrite cycle.
pub type ExtraFields = serde_json::Map<String, serde_json::Value>;

/// CPU architecture of an image, recipe, job or build node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    #[default]
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }

    /// Kernel file name produced by image builds for this architecture
    pub fn default_kernel_file_name(&self) -> &'static str {
        match self {
            Arch::X86_64 => "vmlinuz",
            Arch::Aarch64 => "Image",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted entity living in a named collection.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Human readable entity name used in errors and logs
    const KIND: &'static str;

    /// Collection (and backing file) name
    const COLLECTION: &'static str;

    /// Top-level fields a patch may name. `id` and `created` are never patchable.
    const PATCHABLE: &'static [&'static str];

    fn id(&self) -> Uuid;

    fn created(&self) -> DateTime<Utc>;

    fn deleted(&self) -> Option<DateTime<Utc>>;

    fn set_deleted(&mut self, deleted: Option<DateTime<Utc>>);

    /// Check the entity's schema rules
    fn validate(&self) -> Result<()>;

    /// Rules on how a patch may change an existing record
    fn validate_patch(&self, _patched: &Self) -> Result<()> {
        Ok(())
    }

    fn is_deleted(&self) -> bool {
        self.deleted().is_some()
    }
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(crate::Error::validation(format!(
            "{} field must not be blank",
            field
        )));
    }
    Ok(())
}

/// A link, once set, may only be re-sent unchanged
pub(crate) fn check_link_patch(
    current: Option<&ArtifactLink>,
    patched: Option<&ArtifactLink>,
) -> Result<()> {
    match current {
        Some(current) if patched != Some(current) => Err(crate::Error::validation(
            "link may only be set if it is not already set",
        )),
        _ => Ok(()),
    }
}
