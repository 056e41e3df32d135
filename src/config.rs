//! Training configuration resolution
//!
//! The user-authored document (`config.yaml`) is loosely specified: every key
//! is optional and most options can be given either as a flat key or inside a
//! nested group. [`resolve`] performs the single defaulting pass and produces
//! an immutable [`ResolvedConfig`] in which every value is concrete.
//!
//! Precedence for each leaf value, highest first:
//! command-line override, flat document key, nested group key, built-in default.

use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::dataset::{DatasetFolder, CAPTION_EXTENSION};
use crate::error::{Error, Result};

/// Base model trained against when the document names none
pub const DEFAULT_BASE_MODEL: &str = "black-forest-labs/FLUX.1-dev";
/// Model name used for the job when neither CLI nor document set one
pub const DEFAULT_MODEL_NAME: &str = "lora";
/// Default dataset location
pub const DEFAULT_DATA_FOLDER: &str = "/workspace/data";
/// Default training output location
pub const DEFAULT_TRAINING_FOLDER: &str = "/workspace/output";
/// Steps per image when the step count is derived from the dataset
pub const STEPS_PER_IMAGE: u64 = 100;

/// Raw configuration document as written by the user
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub trigger: Option<String>,
    pub prompts: Option<Vec<String>>,
    pub name: Option<String>,
    pub data_folder: Option<PathBuf>,
    pub input_folder: Option<PathBuf>,
    pub output_folder: Option<PathBuf>,
    pub device: Option<String>,
    pub steps: Option<u64>,
    pub batch_size: Option<usize>,
    pub lr: Option<f64>,
    pub optimizer: Option<String>,
    pub optimizer_args: Option<Mapping>,
    pub save_every: Option<u64>,
    pub max_step_saves_to_keep: Option<u32>,
    pub base_model: Option<String>,
    pub name_or_path: Option<String>,
    pub arch: Option<String>,
    pub sample_every: Option<u64>,
    pub sample_width: Option<u32>,
    pub sample_height: Option<u32>,
    pub sample_steps: Option<u32>,

    pub network: Option<NetworkOverrides>,
    pub save: Option<SaveOverrides>,
    pub train: Option<TrainOverrides>,
    pub model: Option<ModelOverrides>,
    pub sample: Option<SampleOverrides>,
    pub datasets: Option<DatasetOverrides>,

    /// Keys this resolver does not recognize
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Nested `network` group
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkOverrides {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(alias = "rank")]
    pub linear: Option<u32>,
    #[serde(alias = "alpha")]
    pub linear_alpha: Option<u32>,
}

/// Nested `save` group
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SaveOverrides {
    pub dtype: Option<String>,
    pub save_every: Option<u64>,
    pub max_step_saves_to_keep: Option<u32>,
}

/// Nested `train` group
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrainOverrides {
    pub batch_size: Option<usize>,
    pub steps: Option<u64>,
    pub gradient_accumulation_steps: Option<u32>,
    pub optimizer: Option<String>,
    pub optimizer_params: Option<Mapping>,
    pub lr: Option<f64>,
}

/// Nested `model` group
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelOverrides {
    pub name_or_path: Option<String>,
    pub arch: Option<String>,
    pub quantize: Option<bool>,
}

/// Nested `sample` group
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SampleOverrides {
    pub sampler: Option<String>,
    pub sample_every: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub prompts: Option<Vec<String>>,
    pub neg: Option<String>,
    pub seed: Option<u64>,
    pub walk_seed: Option<bool>,
    pub guidance_scale: Option<f64>,
    pub sample_steps: Option<u32>,
}

/// Nested `datasets` group (applies to the single training dataset)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatasetOverrides {
    pub caption_ext: Option<String>,
    pub caption_dropout_rate: Option<f64>,
    pub resolution: Option<Vec<u32>>,
}

/// Values supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Trigger word
    pub trigger: Option<String>,
    /// Model (job) name
    pub name: Option<String>,
}

/// Built-in defaults that depend on the host layout
#[derive(Debug, Clone)]
pub struct Defaults {
    /// Dataset folder used when the document names none
    pub data_folder: PathBuf,
    /// Training output folder used when the document names none
    pub training_folder: PathBuf,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            data_folder: PathBuf::from(DEFAULT_DATA_FOLDER),
            training_folder: PathBuf::from(DEFAULT_TRAINING_FOLDER),
        }
    }
}

/// How the number of training steps is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepPolicy {
    /// Use exactly this many steps
    Explicit(u64),
    /// Derive from the dataset: `image_count * n`
    PerImage(u64),
}

impl StepPolicy {
    /// Effective step count for a dataset of `image_count` images
    pub fn effective(&self, image_count: usize) -> u64 {
        match *self {
            StepPolicy::Explicit(steps) => steps,
            StepPolicy::PerImage(per_image) => image_count as u64 * per_image,
        }
    }
}

/// Fully resolved training parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    pub name: String,
    pub trigger_word: Option<String>,
    pub data_folder: PathBuf,
    pub training_folder: PathBuf,
    pub device: String,
    pub model: ModelSettings,
    pub network: NetworkSettings,
    pub save: SaveSettings,
    pub dataset: DatasetSettings,
    pub train: TrainSettings,
    pub sample: SampleSettings,
    pub prompts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSettings {
    pub name_or_path: String,
    pub arch: String,
    pub quantize: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSettings {
    pub kind: String,
    pub linear: u32,
    pub linear_alpha: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveSettings {
    pub dtype: String,
    pub save_every: u64,
    pub max_step_saves_to_keep: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSettings {
    pub caption_ext: String,
    pub caption_dropout_rate: f64,
    pub resolutions: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainSettings {
    pub batch_size: usize,
    pub steps: StepPolicy,
    pub gradient_accumulation_steps: u32,
    pub optimizer: String,
    pub optimizer_args: Mapping,
    pub lr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleSettings {
    pub sampler: String,
    pub sample_every: u64,
    pub width: u32,
    pub height: u32,
    pub neg: String,
    pub seed: u64,
    pub walk_seed: bool,
    pub guidance_scale: f64,
    pub sample_steps: u32,
}

/// Load the configuration document from disk
pub fn load_document(path: impl AsRef<Path>) -> Result<RawConfig> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(Error::config(format!(
            "Config file '{}' not found. Please create a 'config.yaml' file with at least a 'prompts' list.",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    parse_document(&content)
}

/// Parse a configuration document
pub fn parse_document(content: &str) -> Result<RawConfig> {
    if content.trim().is_empty() {
        return Ok(RawConfig::default());
    }
    serde_yaml::from_str(content)
        .map_err(|e| Error::config(format!("Failed to parse configuration document: {}", e)))
}

/// Resolve a raw document against the built-in defaults
pub fn resolve(raw: RawConfig, overrides: &CliOverrides) -> Result<ResolvedConfig> {
    resolve_with(raw, overrides, &Defaults::default())
}

/// Resolve a raw document with explicit host defaults
pub fn resolve_with(
    raw: RawConfig,
    overrides: &CliOverrides,
    defaults: &Defaults,
) -> Result<ResolvedConfig> {
    for key in raw.extra.keys() {
        warn!(key = %key, "Ignoring unrecognized configuration key");
    }

    let network = raw.network.unwrap_or_default();
    let save = raw.save.unwrap_or_default();
    let train = raw.train.unwrap_or_default();
    let model = raw.model.unwrap_or_default();
    let sample = raw.sample.unwrap_or_default();
    let datasets = raw.datasets.unwrap_or_default();

    let data_folder = raw
        .data_folder
        .or(raw.input_folder)
        .unwrap_or_else(|| defaults.data_folder.clone());
    DatasetFolder::open_non_empty(&data_folder)?;

    let prompts = raw.prompts.or(sample.prompts).unwrap_or_default();
    if prompts.is_empty() {
        return Err(Error::config(
            "No prompts found in the config file. Please add prompts to the 'config.yaml' file.",
        ));
    }

    let steps = match raw.steps.or(train.steps) {
        Some(steps) => StepPolicy::Explicit(steps),
        None => StepPolicy::PerImage(STEPS_PER_IMAGE),
    };

    let resolved = ResolvedConfig {
        name: overrides
            .name
            .clone()
            .or(raw.name)
            .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
        trigger_word: overrides.trigger.clone().or(raw.trigger),
        data_folder,
        training_folder: raw
            .output_folder
            .unwrap_or_else(|| defaults.training_folder.clone()),
        device: raw.device.unwrap_or_else(|| "cuda:0".to_string()),
        model: ModelSettings {
            name_or_path: raw
                .base_model
                .or(raw.name_or_path)
                .or(model.name_or_path)
                .unwrap_or_else(|| DEFAULT_BASE_MODEL.to_string()),
            arch: raw
                .arch
                .or(model.arch)
                .unwrap_or_else(|| "flux".to_string()),
            quantize: model.quantize.unwrap_or(true),
        },
        network: NetworkSettings {
            kind: network.kind.unwrap_or_else(|| "lora".to_string()),
            linear: network.linear.unwrap_or(16),
            linear_alpha: network.linear_alpha.unwrap_or(16),
        },
        save: SaveSettings {
            dtype: save.dtype.unwrap_or_else(|| "float16".to_string()),
            save_every: raw.save_every.or(save.save_every).unwrap_or(200),
            max_step_saves_to_keep: raw
                .max_step_saves_to_keep
                .or(save.max_step_saves_to_keep)
                .unwrap_or(4),
        },
        dataset: DatasetSettings {
            caption_ext: datasets
                .caption_ext
                .unwrap_or_else(|| CAPTION_EXTENSION.to_string()),
            caption_dropout_rate: datasets.caption_dropout_rate.unwrap_or(0.05),
            resolutions: datasets.resolution.unwrap_or_else(|| vec![512, 768, 1024]),
        },
        train: TrainSettings {
            batch_size: raw.batch_size.or(train.batch_size).unwrap_or(1),
            steps,
            gradient_accumulation_steps: train.gradient_accumulation_steps.unwrap_or(1),
            optimizer: raw
                .optimizer
                .or(train.optimizer)
                .unwrap_or_else(|| "adamw8bit".to_string()),
            optimizer_args: raw
                .optimizer_args
                .or(train.optimizer_params)
                .unwrap_or_default(),
            lr: raw.lr.or(train.lr).unwrap_or(4e-4),
        },
        sample: SampleSettings {
            sampler: sample.sampler.unwrap_or_else(|| "flowmatch".to_string()),
            sample_every: raw.sample_every.or(sample.sample_every).unwrap_or(200),
            width: raw.sample_width.or(sample.width).unwrap_or(1024),
            height: raw.sample_height.or(sample.height).unwrap_or(1024),
            neg: sample.neg.unwrap_or_default(),
            seed: sample.seed.unwrap_or(42),
            walk_seed: sample.walk_seed.unwrap_or(true),
            guidance_scale: sample.guidance_scale.unwrap_or(4.0),
            sample_steps: raw.sample_steps.or(sample.sample_steps).unwrap_or(20),
        },
        prompts,
    };

    resolved.validate()?;
    debug!(name = %resolved.name, steps = ?resolved.train.steps, "Configuration resolved");
    Ok(resolved)
}

impl ResolvedConfig {
    /// Reject values the training engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.train.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }
        if let StepPolicy::Explicit(0) = self.train.steps {
            return Err(Error::config("Step count must be greater than 0"));
        }
        if !(self.train.lr.is_finite() && self.train.lr > 0.0) {
            return Err(Error::config("Learning rate must be a positive number"));
        }
        if self.train.gradient_accumulation_steps == 0 {
            return Err(Error::config("Gradient accumulation steps must be greater than 0"));
        }
        if self.network.linear == 0 || self.network.linear_alpha == 0 {
            return Err(Error::config("Network rank and alpha must be greater than 0"));
        }
        if self.save.save_every == 0 || self.sample.sample_every == 0 {
            return Err(Error::config("Save and sample cadence must be greater than 0"));
        }
        if self.sample.width == 0 || self.sample.height == 0 || self.sample.sample_steps == 0 {
            return Err(Error::config("Sample size and steps must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.dataset.caption_dropout_rate) {
            return Err(Error::config("Caption dropout rate must be between 0.0 and 1.0"));
        }
        if self.dataset.resolutions.is_empty() {
            return Err(Error::config("At least one training resolution is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn dataset_with_images(count: usize) -> TempDir {
        let dir = TempDir::new().unwrap();
        for i in 0..count {
            fs::write(dir.path().join(format!("img{}.png", i)), b"png").unwrap();
        }
        dir
    }

    fn doc(data: &Path, body: &str) -> RawConfig {
        parse_document(&format!("data_folder: {}\n{}", data.display(), body)).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let data = dataset_with_images(2);
        let config = resolve(doc(data.path(), "prompts: [\"a cat\"]"), &CliOverrides::default()).unwrap();

        assert_eq!(config.name, "lora");
        assert_eq!(config.trigger_word, None);
        assert_eq!(config.model.name_or_path, DEFAULT_BASE_MODEL);
        assert_eq!(config.train.batch_size, 1);
        assert_eq!(config.train.optimizer, "adamw8bit");
        assert_eq!(config.train.lr, 4e-4);
        assert_eq!(config.train.steps, StepPolicy::PerImage(100));
        assert_eq!(config.save.save_every, 200);
        assert_eq!(config.save.max_step_saves_to_keep, 4);
        assert_eq!(config.network.linear, 16);
        assert_eq!(config.network.linear_alpha, 16);
        assert_eq!((config.sample.width, config.sample.height), (1024, 1024));
        assert_eq!(config.sample.sample_every, 200);
        assert_eq!(config.sample.sample_steps, 20);
        assert_eq!(config.sample.guidance_scale, 4.0);
        assert_eq!(config.training_folder, PathBuf::from(DEFAULT_TRAINING_FOLDER));
    }

    #[test]
    fn test_cli_overrides_win() {
        let data = dataset_with_images(1);
        let raw = doc(data.path(), "prompts: [p]\ntrigger: doc_trigger\nname: doc_name");
        let overrides = CliOverrides {
            trigger: Some("cli_trigger".into()),
            name: Some("cli_name".into()),
        };
        let config = resolve(raw, &overrides).unwrap();
        assert_eq!(config.trigger_word.as_deref(), Some("cli_trigger"));
        assert_eq!(config.name, "cli_name");
    }

    #[test]
    fn test_document_trigger_used_without_cli() {
        let data = dataset_with_images(1);
        let raw = doc(data.path(), "prompts: [p]\ntrigger: ohwx");
        let config = resolve(raw, &CliOverrides::default()).unwrap();
        assert_eq!(config.trigger_word.as_deref(), Some("ohwx"));
    }

    #[test]
    fn test_data_folder_beats_input_folder() {
        let data = dataset_with_images(1);
        let raw = parse_document(&format!(
            "prompts: [p]\ninput_folder: /nowhere\ndata_folder: {}",
            data.path().display()
        ))
        .unwrap();
        let config = resolve(raw, &CliOverrides::default()).unwrap();
        assert_eq!(config.data_folder, data.path());
    }

    #[test]
    fn test_input_folder_alias() {
        let data = dataset_with_images(1);
        let raw = parse_document(&format!("prompts: [p]\ninput_folder: {}", data.path().display()))
            .unwrap();
        assert_eq!(resolve(raw, &CliOverrides::default()).unwrap().data_folder, data.path());
    }

    #[test]
    fn test_nested_leaf_merge_keeps_siblings() {
        let data = dataset_with_images(1);
        let raw = doc(data.path(), "prompts: [p]\ntrain:\n  lr: 0.0001\nnetwork:\n  linear: 32");
        let config = resolve(raw, &CliOverrides::default()).unwrap();

        assert_eq!(config.train.lr, 1e-4);
        assert_eq!(config.train.batch_size, 1);
        assert_eq!(config.train.optimizer, "adamw8bit");
        assert_eq!(config.network.linear, 32);
        assert_eq!(config.network.linear_alpha, 16);
        assert_eq!(config.network.kind, "lora");
    }

    #[test]
    fn test_flat_key_beats_nested_group() {
        let data = dataset_with_images(1);
        let raw = doc(data.path(), "prompts: [p]\nlr: 0.0002\ntrain:\n  lr: 0.0001");
        assert_eq!(resolve(raw, &CliOverrides::default()).unwrap().train.lr, 2e-4);
    }

    #[test]
    fn test_base_model_alias_precedence() {
        let data = dataset_with_images(1);
        let raw = doc(data.path(), "prompts: [p]\nname_or_path: b/alias\nbase_model: a/primary");
        let config = resolve(raw, &CliOverrides::default()).unwrap();
        assert_eq!(config.model.name_or_path, "a/primary");
    }

    #[test]
    fn test_explicit_steps() {
        let data = dataset_with_images(3);
        let raw = doc(data.path(), "prompts: [p]\nsteps: 1500");
        let config = resolve(raw, &CliOverrides::default()).unwrap();
        assert_eq!(config.train.steps, StepPolicy::Explicit(1500));
        assert_eq!(config.train.steps.effective(3), 1500);
    }

    #[test]
    fn test_optimizer_args_preserve_order() {
        let data = dataset_with_images(1);
        let raw = doc(
            data.path(),
            "prompts: [p]\noptimizer: prodigy\noptimizer_args:\n  weight_decay: 0.01\n  betas: [0.9, 0.99]",
        );
        let config = resolve(raw, &CliOverrides::default()).unwrap();
        let keys: Vec<_> = config
            .train
            .optimizer_args
            .keys()
            .map(|k| k.as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["weight_decay", "betas"]);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let data = dataset_with_images(1);
        let raw = doc(data.path(), "prompts: [p]\nwandb_project: whatever");
        assert!(raw.extra.contains_key("wandb_project"));
        assert!(resolve(raw, &CliOverrides::default()).is_ok());
    }

    #[test]
    fn test_empty_prompts_rejected() {
        let data = dataset_with_images(1);
        let err = resolve(doc(data.path(), "prompts: []"), &CliOverrides::default()).unwrap_err();
        assert!(err.is_preflight());
        assert!(err.to_string().contains("No prompts"));

        let err = resolve(doc(data.path(), ""), &CliOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("No prompts"));
    }

    #[test]
    fn test_missing_and_empty_dataset_rejected() {
        let raw = parse_document("prompts: [p]\ndata_folder: /no/such/dir").unwrap();
        assert!(resolve(raw, &CliOverrides::default()).unwrap_err().is_preflight());

        let empty = TempDir::new().unwrap();
        let err = resolve(doc(empty.path(), "prompts: [p]"), &CliOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("No images found"));
    }

    #[test]
    fn test_missing_document_rejected() {
        let err = load_document("/no/such/config.yaml").unwrap_err();
        assert!(err.is_preflight());
    }

    #[test]
    fn test_empty_document_parses() {
        let raw = parse_document("  \n").unwrap();
        assert!(raw.prompts.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let data = dataset_with_images(1);
        for body in ["batch_size: 0", "lr: 0", "steps: 0", "save_every: 0", "network: {linear: 0}"] {
            let raw = doc(data.path(), &format!("prompts: [p]\n{}", body));
            assert!(resolve(raw, &CliOverrides::default()).is_err(), "accepted {}", body);
        }
    }

    #[test]
    fn test_host_defaults() {
        let data = dataset_with_images(1);
        let raw = parse_document("prompts: [p]").unwrap();
        let defaults = Defaults {
            data_folder: data.path().to_path_buf(),
            training_folder: PathBuf::from("/tmp/out"),
        };
        let config = resolve_with(raw, &CliOverrides::default(), &defaults).unwrap();
        assert_eq!(config.data_folder, data.path());
        assert_eq!(config.training_folder, PathBuf::from("/tmp/out"));
    }
}
