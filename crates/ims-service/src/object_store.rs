//! Object store interface and a filesystem backed implementation

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ims_common::models::S3Location;
use ims_common::{Error, Result};
use md5::Context;
use tracing::debug;

/// Metadata of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub etag: String,
    /// Tag of the account that wrote the object
    pub owner: String,
    pub size: u64,
}

/// Blob store holding image and recipe artifacts.
///
/// A missing object fails with `ArtifactMissing`, anything else with
/// `Storage`. Writes return the new object's etag.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, location: &S3Location) -> Result<Vec<u8>>;

    async fn put_object(&self, location: &S3Location, bytes: Vec<u8>) -> Result<String>;

    async fn copy_object(&self, source: &S3Location, destination: &S3Location) -> Result<String>;

    async fn delete_object(&self, location: &S3Location) -> Result<()>;

    async fn head_object(&self, location: &S3Location) -> Result<ObjectInfo>;
}

fn etag_of(bytes: &[u8]) -> String {
    let mut hasher = Context::new();
    hasher.consume(bytes);
    hex::encode(hasher.finalize().0)
}

/// Object store laid out as `<root>/<bucket>/<key>`.
///
/// The writing owner of each object is kept alongside it under
/// `<root>/.owners/<bucket>/<key>`. Copies belong to the account that
/// made them.
pub struct FsObjectStore {
    root: PathBuf,
    owner: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            owner: owner.into(),
        }
    }

    fn object_path(&self, location: &S3Location) -> Result<PathBuf> {
        let relative = Path::new(&location.bucket).join(&location.key);
        if relative
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(Error::Storage(format!("Invalid object location: {}", location)));
        }
        Ok(self.root.join(relative))
    }

    fn owner_path(&self, location: &S3Location) -> Result<PathBuf> {
        self.object_path(location)?;
        Ok(self
            .root
            .join(".owners")
            .join(&location.bucket)
            .join(&location.key))
    }

    async fn read(&self, location: &S3Location) -> Result<Vec<u8>> {
        let path = self.object_path(location)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ArtifactMissing(location.to_string()),
            _ => Error::Storage(format!("Failed to read {}: {}", location, e)),
        })
    }

    async fn write(&self, location: &S3Location, bytes: &[u8]) -> Result<String> {
        let storage_error = |e: std::io::Error| {
            Error::Storage(format!("Failed to write {}: {}", location, e))
        };

        let path = self.object_path(location)?;
        let owner_path = self.owner_path(location)?;
        for parent in [path.parent(), owner_path.parent()].into_iter().flatten() {
            tokio::fs::create_dir_all(parent).await.map_err(storage_error)?;
        }

        tokio::fs::write(&path, bytes).await.map_err(storage_error)?;
        tokio::fs::write(&owner_path, self.owner.as_bytes())
            .await
            .map_err(storage_error)?;

        Ok(etag_of(bytes))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get_object(&self, location: &S3Location) -> Result<Vec<u8>> {
        self.read(location).await
    }

    async fn put_object(&self, location: &S3Location, bytes: Vec<u8>) -> Result<String> {
        let etag = self.write(location, &bytes).await?;
        debug!("Stored {} ({} bytes)", location, bytes.len());
        Ok(etag)
    }

    async fn copy_object(&self, source: &S3Location, destination: &S3Location) -> Result<String> {
        let bytes = self.read(source).await?;
        let etag = self.write(destination, &bytes).await?;
        debug!("Copied {} to {}", source, destination);
        Ok(etag)
    }

    async fn delete_object(&self, location: &S3Location) -> Result<()> {
        let path = self.object_path(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ArtifactMissing(location.to_string()));
            }
            Err(e) => {
                return Err(Error::Storage(format!("Failed to delete {}: {}", location, e)));
            }
        }

        // owner tags are advisory
        let _ = tokio::fs::remove_file(self.owner_path(location)?).await;
        debug!("Deleted {}", location);
        Ok(())
    }

    async fn head_object(&self, location: &S3Location) -> Result<ObjectInfo> {
        let bytes = self.read(location).await?;
        let owner = match tokio::fs::read_to_string(self.owner_path(location)?).await {
            Ok(owner) => owner.trim().to_string(),
            Err(_) => self.owner.clone(),
        };

        Ok(ObjectInfo {
            etag: etag_of(&bytes),
            owner,
            size: bytes.len() as u64,
        })
    }
}
