//! Job specification templates
//!
//! Templates are JSON documents with `${name}` placeholders. A placeholder
//! that is a whole JSON string (`"${build_env_size}"`) is replaced by the
//! value's JSON, so numbers, booleans and objects keep their type. A
//! placeholder inside a longer string is replaced by the value's text,
//! escaped for JSON.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use ims_common::models::{JobType, RecipeType};
use ims_common::{Error, Result};
use serde_json::Value;
use tracing::{debug, info};

const CREATE_KIWI_NG: &str = include_str!("../templates/create-kiwi-ng.json");
const CREATE_PACKER: &str = include_str!("../templates/create-packer.json");
const CUSTOMIZE: &str = include_str!("../templates/customize.json");

/// Substitution values keyed by placeholder name
pub type TemplateValues = BTreeMap<String, Value>;

/// Name of the template a job renders
pub fn template_name(job_type: JobType, recipe_type: Option<RecipeType>) -> String {
    match (job_type, recipe_type) {
        (JobType::Create, Some(recipe_type)) => format!("create-{}", recipe_type),
        (JobType::Create, None) => "create-kiwi-ng".to_string(),
        (JobType::Customize, _) => "customize".to_string(),
    }
}

/// Render `source` with `values` into a JSON document.
///
/// A placeholder with no value fails with `UnresolvedPlaceholder` naming
/// the key. Output that is not JSON fails with `Template`.
pub fn render(source: &str, values: &TemplateValues) -> Result<Value> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("${") {
        let (before, after) = rest.split_at(start);
        let end = after
            .find('}')
            .ok_or_else(|| Error::Template(format!("Unterminated placeholder near: {}", truncate(after))))?;
        let key = &after[2..end];
        let value = values
            .get(key)
            .ok_or_else(|| Error::UnresolvedPlaceholder(key.to_string()))?;
        let remaining = &after[end + 1..];

        let whole_string = before.ends_with('"') && remaining.starts_with('"');
        if whole_string {
            out.push_str(&before[..before.len() - 1]);
            out.push_str(&serde_json::to_string(value)?);
            rest = &remaining[1..];
        } else {
            out.push_str(before);
            out.push_str(&escaped_text(value)?);
            rest = remaining;
        }
    }
    out.push_str(rest);

    serde_json::from_str(&out).map_err(|e| Error::Template(format!("Rendered document is not JSON: {}", e)))
}

/// Text of a value embedded in a JSON string
fn escaped_text(value: &Value) -> Result<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let quoted = serde_json::to_string(&text)?;
    Ok(quoted[1..quoted.len() - 1].to_string())
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(40) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Named templates, the built-in set optionally overridden from a directory
pub struct TemplateRenderer {
    templates: HashMap<String, String>,
}

impl TemplateRenderer {
    pub fn builtin() -> Self {
        let templates = [
            ("create-kiwi-ng", CREATE_KIWI_NG),
            ("create-packer", CREATE_PACKER),
            ("customize", CUSTOMIZE),
        ]
        .into_iter()
        .map(|(name, source)| (name.to_string(), source.to_string()))
        .collect();

        Self { templates }
    }

    /// Built-in templates, replaced by any `<name>.json` found in `dir`
    pub fn with_overrides(dir: &Path) -> Result<Self> {
        let mut renderer = Self::builtin();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = std::fs::read_to_string(&path)?;
            info!("Using job template {} from {}", name, path.display());
            renderer.templates.insert(name.to_string(), source);
        }

        Ok(renderer)
    }

    pub fn render(&self, name: &str, values: &TemplateValues) -> Result<Value> {
        let source = self
            .templates
            .get(name)
            .ok_or_else(|| Error::Template(format!("Unknown job template: {}", name)))?;
        debug!("Rendering job template {}", name);
        render(source, values)
    }
}
