//! Mirror of the worker's `bridgeData.yaml`.
//!
//! Only the settings the front-end edits are typed; every other key in the
//! document is carried in [`WorkerConfig::extra`] and written back unchanged.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "bridgeData.yaml";
pub const TEMPLATE_FILE_NAME: &str = "bridgeData_template.yaml";

/// Keys of the typed fields that hold lists of model names.
pub const LIST_FIELDS: &[&str] = &["models_to_load", "models_to_skip"];

/// Keys of the typed fields, in display order.
pub const FIELD_NAMES: &[&str] = &[
    "horde_api_key",
    "dreamer_name",
    "nsfw",
    "models_to_load",
    "max_threads",
    "max_power",
    "queue_size",
    "safety_on_gpu",
    "high_memory_mode",
    "max_batch",
    "allow_lora",
    "allow_controlnet",
    "allow_sdxl_controlnet",
    "allow_post_processing",
    "models_to_skip",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration at {} and no template at {}", path.display(), template.display())]
    TemplateMissing { path: PathBuf, template: PathBuf },
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("unknown setting '{0}'")]
    UnknownField(String),
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    /// Nothing exists on disk yet, so writing a fresh document loses nothing.
    pub fn is_missing(&self) -> bool {
        matches!(self, ConfigError::TemplateMissing { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub horde_api_key: String,
    pub dreamer_name: String,
    pub nsfw: bool,
    pub models_to_load: Vec<String>,
    pub max_threads: u32,
    pub max_power: u32,
    pub queue_size: u32,
    pub safety_on_gpu: bool,
    pub high_memory_mode: bool,
    pub max_batch: u32,
    pub allow_lora: bool,
    pub allow_controlnet: bool,
    pub allow_sdxl_controlnet: bool,
    pub allow_post_processing: bool,
    pub models_to_skip: Vec<String>,
    #[serde(flatten)]
    pub extra: Mapping,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            horde_api_key: String::new(),
            dreamer_name: String::new(),
            nsfw: false,
            models_to_load: Vec::new(),
            max_threads: 1,
            max_power: 32,
            queue_size: 1,
            safety_on_gpu: false,
            high_memory_mode: false,
            max_batch: 4,
            allow_lora: false,
            allow_controlnet: false,
            allow_sdxl_controlnet: false,
            allow_post_processing: false,
            models_to_skip: Vec::new(),
            extra: Mapping::new(),
        }
    }
}

/// Result of a load, noting whether the template had to be copied first.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: WorkerConfig,
    pub from_template: bool,
}

pub fn config_path(worker_folder: &Path) -> PathBuf {
    worker_folder.join(CONFIG_FILE_NAME)
}

pub fn template_path(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(TEMPLATE_FILE_NAME)
}

/// Load the document at `path` on top of the built-in defaults.
pub fn load(path: &Path) -> Result<WorkerConfig, ConfigError> {
    load_over(path, &WorkerConfig::default()).map(|l| l.config)
}

/// Load the document at `path`; recognized fields that are absent (or null)
/// keep the values from `prior`. Unknown keys come from the document only.
pub fn load_over(path: &Path, prior: &WorkerConfig) -> Result<LoadedConfig, ConfigError> {
    let from_template = ensure_config_file(path)?;

    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_over(path, &text, prior)?;
    tracing::info!(path = %path.display(), from_template, "loaded worker configuration");
    Ok(LoadedConfig {
        config,
        from_template,
    })
}

/// Copy the template next to `path` when the config file is missing.
/// Returns true when the template was copied.
fn ensure_config_file(path: &Path) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    let template = template_path(path);
    if !template.exists() {
        return Err(ConfigError::TemplateMissing {
            path: path.to_path_buf(),
            template,
        });
    }
    std::fs::copy(&template, path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(template = %template.display(), "created configuration from template");
    Ok(true)
}

fn parse_over(path: &Path, text: &str, prior: &WorkerConfig) -> Result<WorkerConfig, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let blank = text.lines().all(|l| {
        let t = l.trim();
        t.is_empty() || t.starts_with('#')
    });
    let doc: Value = if blank {
        Value::Null
    } else {
        serde_yaml::from_str(text).map_err(|e| parse_err(e.to_string()))?
    };
    let doc = match doc {
        Value::Null => Mapping::new(),
        Value::Mapping(m) => m,
        _ => return Err(parse_err("top-level document is not a mapping".into())),
    };

    let mut base_cfg = prior.clone();
    base_cfg.extra = Mapping::new();
    let mut merged = match serde_yaml::to_value(&base_cfg)? {
        Value::Mapping(m) => m,
        _ => Mapping::new(),
    };

    for (k, v) in doc {
        let recognized = k.as_str().map(|s| FIELD_NAMES.contains(&s)).unwrap_or(false);
        let empty_list = v.as_sequence().is_some_and(|seq| seq.is_empty());
        if recognized && (v.is_null() || empty_list) {
            continue;
        }
        merged.insert(k, v);
    }

    serde_yaml::from_value(Value::Mapping(merged)).map_err(|e| parse_err(e.to_string()))
}

/// Write the complete document to `path`, overwriting it in place.
pub fn save(config: &WorkerConfig, path: &Path) -> Result<(), ConfigError> {
    let text = serde_yaml::to_string(config)?;
    std::fs::write(path, text).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(path = %path.display(), "saved worker configuration");
    Ok(())
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.into(),
            value: raw.into(),
            reason: "expected true/false".into(),
        }),
    }
}

fn parse_bounded(key: &str, raw: &str, min: u32, max: u32) -> Result<u32, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: key.into(),
        value: raw.into(),
        reason,
    };
    let v: u32 = raw
        .trim()
        .parse()
        .map_err(|_| invalid("expected a whole number".into()))?;
    if !(min..=max).contains(&v) {
        return Err(invalid(format!("must be between {min} and {max}")));
    }
    Ok(v)
}

/// One entry per line, blank lines dropped. Model names may contain commas.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl WorkerConfig {
    /// Set one typed field from user text, with the same bounds the editor enforces.
    pub fn set_field(&mut self, key: &str, raw: &str) -> Result<(), ConfigError> {
        match key {
            "horde_api_key" => self.horde_api_key = raw.trim().to_string(),
            "dreamer_name" => self.dreamer_name = raw.trim().to_string(),
            "nsfw" => self.nsfw = parse_bool(key, raw)?,
            "models_to_load" => self.models_to_load = parse_list(raw),
            "max_threads" => self.max_threads = parse_bounded(key, raw, 1, 8)?,
            "max_power" => self.max_power = parse_bounded(key, raw, 8, 128)?,
            "queue_size" => self.queue_size = parse_bounded(key, raw, 0, 4)?,
            "safety_on_gpu" => self.safety_on_gpu = parse_bool(key, raw)?,
            "high_memory_mode" => self.high_memory_mode = parse_bool(key, raw)?,
            "max_batch" => self.max_batch = parse_bounded(key, raw, 1, 16)?,
            "allow_lora" => self.allow_lora = parse_bool(key, raw)?,
            "allow_controlnet" => self.allow_controlnet = parse_bool(key, raw)?,
            "allow_sdxl_controlnet" => self.allow_sdxl_controlnet = parse_bool(key, raw)?,
            "allow_post_processing" => self.allow_post_processing = parse_bool(key, raw)?,
            "models_to_skip" => self.models_to_skip = parse_list(raw),
            other => return Err(ConfigError::UnknownField(other.to_string())),
        }
        Ok(())
    }

    /// Copy with the API key masked, for output that leaves the process.
    pub fn masked(&self) -> WorkerConfig {
        WorkerConfig {
            horde_api_key: mask_secret(&self.horde_api_key),
            ..self.clone()
        }
    }

    /// `(key, value)` pairs for display; the API key is masked.
    pub fn display_fields(&self) -> Vec<(&'static str, String)> {
        let list = |v: &[String]| {
            if v.is_empty() {
                "-".to_string()
            } else {
                v.join(", ")
            }
        };
        vec![
            ("horde_api_key", mask_secret(&self.horde_api_key)),
            ("dreamer_name", self.dreamer_name.clone()),
            ("nsfw", self.nsfw.to_string()),
            ("models_to_load", list(&self.models_to_load)),
            ("max_threads", self.max_threads.to_string()),
            ("max_power", self.max_power.to_string()),
            ("queue_size", self.queue_size.to_string()),
            ("safety_on_gpu", self.safety_on_gpu.to_string()),
            ("high_memory_mode", self.high_memory_mode.to_string()),
            ("max_batch", self.max_batch.to_string()),
            ("allow_lora", self.allow_lora.to_string()),
            ("allow_controlnet", self.allow_controlnet.to_string()),
            ("allow_sdxl_controlnet", self.allow_sdxl_controlnet.to_string()),
            ("allow_post_processing", self.allow_post_processing.to_string()),
            ("models_to_skip", list(&self.models_to_skip)),
        ]
    }
}

/// Serialize through [`WorkerConfig::masked`] so event streams never carry the key.
pub fn serialize_masked<S>(config: &WorkerConfig, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    config.masked().serialize(serializer)
}

pub fn mask_secret(s: &str) -> String {
    let n = s.chars().count();
    if n == 0 {
        return "-".into();
    }
    if n <= 4 {
        return "*".repeat(n);
    }
    let tail: String = s.chars().skip(n - 4).collect();
    format!("{}{}", "*".repeat(n - 4), tail)
}
