pub mod error;
pub mod models;

pub use error::{Error, Result};
pub use models::{
    Arch, ArtifactLink, Image, ImageManifest, Job, JobRequest, JobStatus, JobType, PublicKey,
    Recipe, RecipeType, Record, RemoteBuildNode, S3Location, StatusUpdate,
};
