//! Artifact links: references from metadata records to object-store blobs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const ARTIFACT_LINK_TYPE_S3: &str = "s3";

/// Suffix appended to an object key when the artifact is soft-deleted
pub const DELETED_SUFFIX: &str = ".deleted";

/// Reference to an artifact in the object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLink {
    /// `s3://bucket/key`
    pub path: String,

    /// Entity tag of the object when the link was recorded
    pub etag: String,

    /// Link type, currently always `s3`
    #[serde(rename = "type")]
    pub link_type: String,
}

impl ArtifactLink {
    pub fn s3(location: &S3Location, etag: impl Into<String>) -> Self {
        Self {
            path: location.to_string(),
            etag: etag.into(),
            link_type: ARTIFACT_LINK_TYPE_S3.to_string(),
        }
    }

    /// A link must carry a non-empty path, etag and type, and the type must be `s3`.
    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(Error::validation("link.path must not be blank"));
        }
        if self.etag.trim().is_empty() {
            return Err(Error::validation("link.etag must not be blank"));
        }
        if self.link_type != ARTIFACT_LINK_TYPE_S3 {
            return Err(Error::validation(format!(
                "link.type must be one of: {}",
                ARTIFACT_LINK_TYPE_S3
            )));
        }
        self.location().map(|_| ())
    }

    pub fn location(&self) -> Result<S3Location> {
        S3Location::parse(&self.path)
    }
}

impl fmt::Display for ArtifactLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (etag {})", self.path, self.etag)
    }
}

/// Bucket and key of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
}

impl S3Location {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse `s3://bucket/key`
    pub fn parse(path: &str) -> Result<Self> {
        let rest = path
            .strip_prefix("s3://")
            .ok_or_else(|| Error::validation(format!("Artifact path is not an s3 url: {}", path)))?;

        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| Error::validation(format!("Artifact path has no object key: {}", path)))?;

        let key = key.trim_start_matches('/');
        if bucket.is_empty() || key.is_empty() {
            return Err(Error::validation(format!(
                "Artifact path must name a bucket and a key: {}",
                path
            )));
        }

        Ok(Self::new(bucket, key))
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.key.ends_with(DELETED_SUFFIX)
    }

    /// Location the object moves to when soft-deleted
    pub fn soft_deleted(&self) -> Self {
        Self::new(self.bucket.clone(), format!("{}{}", self.key, DELETED_SUFFIX))
    }

    /// Location a soft-deleted object returns to, if this is one
    pub fn restored(&self) -> Option<Self> {
        self.key
            .strip_suffix(DELETED_SUFFIX)
            .filter(|key| !key.is_empty())
            .map(|key| Self::new(self.bucket.clone(), key))
    }
}

impl fmt::Display for S3Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}
