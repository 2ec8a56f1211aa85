//! Image records and image manifests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{check_link_patch, require_non_empty, Arch, ArtifactLink, ExtraFields, Record};
use crate::{Error, Result};

/// Manifest artifact type prefix identifying the root filesystem
pub const ROOTFS_ARTIFACT_TYPE_PREFIX: &str = "application/vnd.cray.image.rootfs.squashfs";

pub const IMAGE_MANIFEST_VERSION_1_0: &str = "1.0";

/// Image record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,

    pub created: DateTime<Utc>,

    pub name: String,

    /// Location of the image manifest; an image without one is incomplete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<ArtifactLink>,

    #[serde(default)]
    pub arch: Arch,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: ExtraFields,
}

/// User input for a new image
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageRequest {
    pub name: String,

    #[serde(default)]
    pub link: Option<ArtifactLink>,

    #[serde(default)]
    pub arch: Arch,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Image {
    pub fn from_request(request: ImageRequest) -> Result<Self> {
        let image = Self {
            id: Uuid::new_v4(),
            created: Utc::now(),
            name: request.name,
            link: request.link,
            arch: request.arch,
            metadata: request.metadata,
            deleted: None,
            extra: ExtraFields::new(),
        };
        image.validate()?;
        Ok(image)
    }

    /// A live image with a manifest can be customized
    pub fn is_complete(&self) -> bool {
        !self.is_deleted() && self.link.is_some()
    }
}

impl Record for Image {
    const KIND: &'static str = "image";
    const COLLECTION: &'static str = "images";
    const PATCHABLE: &'static [&'static str] = &["link", "arch", "metadata"];

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
        require_non_empty("name", &self.name)?;
        if let Some(link) = &self.link {
            link.validate()?;
        }
        Ok(())
    }

    fn validate_patch(&self, patched: &Self) -> Result<()> {
        check_link_patch(self.link.as_ref(), patched.link.as_ref())
    }
}

/// Contents of an image's `manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    pub artifacts: Vec<ManifestArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestArtifact {
    #[serde(rename = "type")]
    pub artifact_type: String,

    #[serde(default)]
    pub link: Option<ArtifactLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

impl ImageManifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: ImageManifest = serde_json::from_slice(bytes)
            .map_err(|e| Error::validation(format!("Image manifest is corrupt or invalid: {}", e)))?;

        if manifest.version != IMAGE_MANIFEST_VERSION_1_0 {
            return Err(Error::validation(format!(
                "Unsupported image manifest version: {}",
                manifest.version
            )));
        }

        Ok(manifest)
    }

    /// The single root filesystem artifact of the image
    pub fn rootfs(&self) -> Result<&ManifestArtifact> {
        let mut rootfs = self
            .artifacts
            .iter()
            .filter(|a| a.artifact_type.starts_with(ROOTFS_ARTIFACT_TYPE_PREFIX));

        let artifact = rootfs
            .next()
            .ok_or_else(|| Error::validation("The image manifest does not include any rootfs artifacts"))?;

        if rootfs.next().is_some() {
            return Err(Error::validation(
                "The image manifest includes multiple rootfs artifacts",
            ));
        }

        if artifact.link.is_none() {
            return Err(Error::validation(
                "The rootfs artifact in the image manifest does not have a link",
            ));
        }

        Ok(artifact)
    }
}
