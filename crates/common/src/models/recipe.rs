//! Recipe records

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{check_link_patch, require_non_empty, Arch, ArtifactLink, ExtraFields, Record};
use crate::Result;

/// Build tool a recipe is written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipeType {
    #[serde(rename = "kiwi-ng")]
    KiwiNg,
    #[serde(rename = "packer")]
    Packer,
}

impl RecipeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipeType::KiwiNg => "kiwi-ng",
            RecipeType::Packer => "packer",
        }
    }
}

impl fmt::Display for RecipeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinuxDistribution {
    Sles12,
    Sles15,
    Centos7,
}

/// One template variable substituted into the recipe at build time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateEntry {
    pub key: String,
    pub value: String,
}

fn default_require_dkms() -> bool {
    true
}

/// Recipe record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: Uuid,

    pub created: DateTime<Utc>,

    pub name: String,

    /// Location of the recipe archive (tgz)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<ArtifactLink>,

    pub recipe_type: RecipeType,

    pub linux_distribution: LinuxDistribution,

    /// Records written before `arch` existed load as x86_64
    #[serde(default)]
    pub arch: Arch,

    #[serde(default = "default_require_dkms")]
    pub require_dkms: bool,

    #[serde(default)]
    pub template_dictionary: Vec<TemplateEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: ExtraFields,
}

/// User input for a new recipe
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecipeRequest {
    pub name: String,

    #[serde(default)]
    pub link: Option<ArtifactLink>,

    pub recipe_type: RecipeType,

    pub linux_distribution: LinuxDistribution,

    #[serde(default)]
    pub arch: Arch,

    #[serde(default = "default_require_dkms")]
    pub require_dkms: bool,

    #[serde(default)]
    pub template_dictionary: Vec<TemplateEntry>,
}

impl Recipe {
    pub fn from_request(request: RecipeRequest) -> Result<Self> {
        let recipe = Self {
            id: Uuid::new_v4(),
            created: Utc::now(),
            name: request.name,
            link: request.link,
            recipe_type: request.recipe_type,
            linux_distribution: request.linux_distribution,
            arch: request.arch,
            require_dkms: request.require_dkms,
            template_dictionary: request.template_dictionary,
            deleted: None,
            extra: ExtraFields::new(),
        };
        recipe.validate()?;
        Ok(recipe)
    }

    /// Template dictionary as a key/value map; later duplicates win
    pub fn template_values(&self) -> BTreeMap<&str, &str> {
        self.template_dictionary
            .iter()
            .map(|entry| (entry.key.as_str(), entry.value.as_str()))
            .collect()
    }
}

impl Record for Recipe {
    const KIND: &'static str = "recipe";
    const COLLECTION: &'static str = "recipes";
    const PATCHABLE: &'static [&'static str] = &["link"];

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
        for entry in &self.template_dictionary {
            require_non_empty("template_dictionary.key", &entry.key)?;
        }
        Ok(())
    }

    fn validate_patch(&self, patched: &Self) -> Result<()> {
        check_link_patch(self.link.as_ref(), patched.link.as_ref())
    }
}
