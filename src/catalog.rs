//! The worker's `models.json` catalog.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MODELS_FILE_NAME: &str = "models.json";

/// How to register a model that is not in the catalog. The worker reads
/// these from the `custom_models` block of bridgeData.yaml.
pub const CUSTOM_MODELS_HELP: &[&str] = &[
    "To add custom models, edit the 'custom_models' section in bridgeData.yaml.",
    "The format is:",
    "",
    "custom_models:",
    "  - name: My Custom Model",
    "    baseline: stable_diffusion_xl",
    "    filepath: /path/to/model/file.safetensors",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    #[serde(default = "unknown")]
    pub name: String,
    #[serde(rename = "type", default = "unknown")]
    pub kind: String,
    #[serde(default)]
    pub filesize: f64,
}

fn unknown() -> String {
    "Unknown".into()
}

impl ModelEntry {
    /// Size in mebibytes with one decimal, e.g. `"2048.0 MB"`.
    pub fn size_label(&self) -> String {
        format!("{:.1} MB", self.filesize / (1024.0 * 1024.0))
    }
}

/// Models sharing a type, in first-seen order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelGroup {
    pub kind: String,
    pub models: Vec<ModelEntry>,
}

pub fn models_path(folder: &Path) -> PathBuf {
    folder.join(MODELS_FILE_NAME)
}

/// `Ok(None)` when the worker has not produced a catalog yet.
pub fn load(folder: &Path) -> Result<Option<Vec<ModelEntry>>> {
    let path = models_path(folder);
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let models: Vec<ModelEntry> =
        serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))?;
    tracing::debug!(count = models.len(), "loaded model catalog");
    Ok(Some(models))
}

pub fn group_by_type(models: Vec<ModelEntry>) -> Vec<ModelGroup> {
    let mut groups: Vec<ModelGroup> = Vec::new();
    for model in models {
        match groups.iter_mut().find(|g| g.kind == model.kind) {
            Some(group) => group.models.push(model),
            None => groups.push(ModelGroup {
                kind: model.kind.clone(),
                models: vec![model],
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TempDir;

    #[test]
    fn missing_catalog_is_none() {
        let dir = TempDir::new("catalog-missing");
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn groups_preserve_first_seen_order() {
        let dir = TempDir::new("catalog-group");
        dir.write(
            MODELS_FILE_NAME,
            r#"[
                {"name": "Deliberate", "type": "stable_diffusion", "filesize": 2147483648},
                {"name": "4x_AnimeSharp", "type": "esrgan", "filesize": 67108864},
                {"name": "AlbedoBase XL", "type": "stable_diffusion"},
                {"filesize": 1048576}
            ]"#,
        );
        let groups = group_by_type(load(dir.path()).unwrap().unwrap());
        let kinds: Vec<_> = groups.iter().map(|g| g.kind.as_str()).collect();
        assert_eq!(kinds, ["stable_diffusion", "esrgan", "Unknown"]);
        assert_eq!(groups[0].models.len(), 2);
        assert_eq!(groups[0].models[0].size_label(), "2048.0 MB");
        assert_eq!(groups[0].models[1].size_label(), "0.0 MB");
        assert_eq!(groups[2].models[0].name, "Unknown");
        assert_eq!(groups[2].models[0].size_label(), "1.0 MB");
    }

    #[test]
    fn malformed_catalog_is_an_error() {
        let dir = TempDir::new("catalog-bad");
        dir.write(MODELS_FILE_NAME, r#"{"name": "not an array"}"#);
        assert!(load(dir.path()).is_err());
    }

    #[test]
    fn custom_model_snippet_is_valid_yaml() {
        let snippet = CUSTOM_MODELS_HELP[3..].join("\n");
        let doc: serde_yaml::Value = serde_yaml::from_str(&snippet).unwrap();
        let first = &doc["custom_models"][0];
        assert_eq!(first["baseline"].as_str(), Some("stable_diffusion_xl"));
        assert_eq!(first["name"].as_str(), Some("My Custom Model"));
    }
}
