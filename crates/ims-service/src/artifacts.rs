//! Artifact manager
//!
//! All object store moves go through here. Objects are immutable, so a
//! soft delete is a copy to `<key>.deleted` followed by a delete of the
//! original, and an undelete is the reverse. A metadata record is only
//! marked deleted after its artifacts have moved.

use std::sync::Arc;

use chrono::Utc;
use ims_common::models::{ArtifactLink, Image, ImageManifest, Recipe, S3Location};
use ims_common::{Error, Record, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::object_store::{ObjectInfo, ObjectStore};
use crate::storage::Storage;

/// Which account wrote an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactOwner {
    /// Uploaded through this service
    Service,
    /// Uploaded through the administrative path
    Admin,
}

pub struct ArtifactManager {
    service: Arc<dyn ObjectStore>,
    admin: Arc<dyn ObjectStore>,
    admin_owner: String,
}

impl ArtifactManager {
    /// `admin_owner` is the owner tag carried by objects the
    /// administrative account uploaded
    pub fn new(
        service: Arc<dyn ObjectStore>,
        admin: Arc<dyn ObjectStore>,
        admin_owner: impl Into<String>,
    ) -> Self {
        Self {
            service,
            admin,
            admin_owner: admin_owner.into(),
        }
    }

    fn store(&self, owner: ArtifactOwner) -> &dyn ObjectStore {
        match owner {
            ArtifactOwner::Service => self.service.as_ref(),
            ArtifactOwner::Admin => self.admin.as_ref(),
        }
    }

    /// Pick the credential set for operations on `link`
    pub async fn resolve_owner(&self, link: &ArtifactLink) -> Result<ArtifactOwner> {
        let info = self.service.head_object(&link.location()?).await?;
        if info.owner == self.admin_owner {
            Ok(ArtifactOwner::Admin)
        } else {
            Ok(ArtifactOwner::Service)
        }
    }

    /// Check the artifact exists; a changed etag is only logged
    pub async fn validate_artifact(&self, link: &ArtifactLink) -> Result<ObjectInfo> {
        let info = self.service.head_object(&link.location()?).await?;
        debug!("Artifact {} exists ({} bytes)", link, info.size);
        if info.etag != link.etag {
            warn!(
                "Artifact {} was found, but has etag {} that does not match the record",
                link, info.etag
            );
        }
        Ok(info)
    }

    /// Check a link can be attached to a recipe.
    ///
    /// No other recipe, live or soft-deleted, may reference the same
    /// object, and the object must exist. `recipe_id` is the recipe being
    /// patched, if any.
    pub async fn verify_recipe_link(
        &self,
        storage: &Storage,
        link: &ArtifactLink,
        recipe_id: Option<Uuid>,
    ) -> Result<()> {
        let wanted = live_path(link);
        let taken = storage
            .list::<Recipe>(true)
            .filter(|recipe| Some(recipe.id) != recipe_id)
            .find(|recipe| recipe.link.as_ref().map(live_path).as_deref() == Some(wanted.as_str()));
        if let Some(other) = taken {
            return Err(Error::validation(format!(
                "Link {} is already used by recipe {}",
                link.path, other.id
            )));
        }

        self.validate_artifact(link).await?;
        Ok(())
    }

    pub async fn read_manifest(&self, link: &ArtifactLink) -> Result<ImageManifest> {
        let bytes = self.service.get_object(&link.location()?).await?;
        ImageManifest::parse(&bytes)
    }

    async fn move_artifact(
        &self,
        link: &ArtifactLink,
        from: &S3Location,
        to: &S3Location,
    ) -> Result<ArtifactLink> {
        let store = self.store(self.resolve_owner(link).await?);
        let etag = store.copy_object(from, to).await?;
        store.delete_object(from).await?;
        Ok(ArtifactLink::s3(to, etag))
    }

    /// Move an artifact to its `.deleted` key and return the new link.
    ///
    /// Fails with `ArtifactMissing` if the object is gone, which callers
    /// treat as already deleted, or `Storage` for anything else. A link
    /// that already points at a `.deleted` key is returned as is.
    pub async fn soft_delete_artifact(&self, link: &ArtifactLink) -> Result<ArtifactLink> {
        let location = link.location()?;
        if location.is_soft_deleted() {
            return Ok(link.clone());
        }

        let deleted = location.soft_deleted();
        let new_link = self.move_artifact(link, &location, &deleted).await?;
        info!("Soft-deleted artifact {} to {}", location, deleted);
        Ok(new_link)
    }

    /// Move a soft-deleted artifact back to its original key
    pub async fn restore_artifact(&self, link: &ArtifactLink) -> Result<ArtifactLink> {
        let location = link.location()?;
        let Some(restored) = location.restored() else {
            return Ok(link.clone());
        };

        let new_link = self.move_artifact(link, &location, &restored).await?;
        info!("Restored artifact {} to {}", location, restored);
        Ok(new_link)
    }

    /// Soft-delete a recipe and its archive.
    ///
    /// A storage failure leaves the record untouched.
    pub async fn delete_recipe(&self, storage: &mut Storage, id: Uuid) -> Result<Recipe> {
        let mut recipe = storage.get::<Recipe>(id)?;
        if recipe.is_deleted() {
            return Ok(recipe);
        }

        if let Some(link) = &recipe.link {
            if let Some(moved) = tolerate_missing(self.soft_delete_artifact(link).await)? {
                recipe.link = Some(moved);
            }
        }

        recipe.set_deleted(Some(Utc::now()));
        let recipe = storage.replace(recipe)?;
        info!("Soft-deleted recipe {}", id);
        Ok(recipe)
    }

    pub async fn restore_recipe(&self, storage: &mut Storage, id: Uuid) -> Result<Recipe> {
        let mut recipe = storage.get_deleted::<Recipe>(id)?;

        if let Some(link) = &recipe.link {
            if let Some(moved) = tolerate_missing(self.restore_artifact(link).await)? {
                recipe.link = Some(moved);
            }
        }

        recipe.set_deleted(None);
        let recipe = storage.replace(recipe)?;
        info!("Restored recipe {}", id);
        Ok(recipe)
    }

    /// Soft-delete an image, every artifact its manifest lists, then the
    /// manifest.
    ///
    /// Failures on listed artifacts are logged and skipped. A storage
    /// failure on the manifest aborts and leaves the record untouched.
    pub async fn delete_image(&self, storage: &mut Storage, id: Uuid) -> Result<Image> {
        let mut image = storage.get::<Image>(id)?;
        if image.is_deleted() {
            return Ok(image);
        }

        if let Some(link) = image.link.clone() {
            match self.read_manifest(&link).await {
                Ok(manifest) => {
                    for artifact in manifest.artifacts.iter().filter_map(|a| a.link.as_ref()) {
                        if let Err(e) = self.soft_delete_artifact(artifact).await {
                            warn!("Could not soft-delete artifact {} of image {}: {}", artifact, id, e);
                        }
                    }
                }
                Err(e) => warn!("Could not read manifest {} of image {}: {}", link, id, e),
            }

            if let Some(moved) = tolerate_missing(self.soft_delete_artifact(&link).await)? {
                image.link = Some(moved);
            }
        }

        image.set_deleted(Some(Utc::now()));
        let image = storage.replace(image)?;
        info!("Soft-deleted image {}", id);
        Ok(image)
    }

    pub async fn restore_image(&self, storage: &mut Storage, id: Uuid) -> Result<Image> {
        let mut image = storage.get_deleted::<Image>(id)?;

        if let Some(link) = image.link.clone() {
            if let Some(moved) = tolerate_missing(self.restore_artifact(&link).await)? {
                image.link = Some(moved);
            }

            // the manifest still lists the artifacts under their live keys
            if let Some(manifest_link) = &image.link {
                match self.read_manifest(manifest_link).await {
                    Ok(manifest) => {
                        for artifact in manifest.artifacts.iter().filter_map(|a| a.link.as_ref()) {
                            if let Err(e) = self.restore_listed_artifact(artifact).await {
                                warn!("Could not restore artifact {} of image {}: {}", artifact, id, e);
                            }
                        }
                    }
                    Err(e) => warn!("Could not read manifest {} of image {}: {}", manifest_link, id, e),
                }
            }
        }

        image.set_deleted(None);
        let image = storage.replace(image)?;
        info!("Restored image {}", id);
        Ok(image)
    }

    async fn restore_listed_artifact(&self, live: &ArtifactLink) -> Result<ArtifactLink> {
        let deleted = live.location()?.soft_deleted();
        let deleted_link = ArtifactLink::s3(&deleted, live.etag.clone());
        self.restore_artifact(&deleted_link).await
    }
}

/// Path of the object a link refers to once any soft delete is undone
fn live_path(link: &ArtifactLink) -> String {
    link.location()
        .ok()
        .and_then(|location| location.restored())
        .map(|location| location.to_string())
        .unwrap_or_else(|| link.path.clone())
}

/// `ArtifactMissing` means there is nothing left to move
fn tolerate_missing(result: Result<ArtifactLink>) -> Result<Option<ArtifactLink>> {
    match result {
        Ok(link) => Ok(Some(link)),
        Err(Error::ArtifactMissing(path)) => {
            warn!("Artifact {} is already gone, treating as deleted", path);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
