//! Training job compilation
//!
//! Turns a [`ResolvedConfig`] plus a fresh [`DatasetStats`] scan into the
//! nested job document consumed by the ai-toolkit training engine. Field
//! names, nesting and field order are part of that engine's contract, so the
//! document is modelled as explicit structs whose declaration order is the
//! serialized order.

use serde::{Serialize, Serializer};
use serde_yaml::Mapping;
use std::path::PathBuf;
use tracing::info;

use crate::config::ResolvedConfig;
use crate::dataset::DatasetStats;
use crate::error::Result;

/// Top-level job document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSpec {
    pub job: String,
    pub config: JobConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobConfig {
    pub name: String,
    pub process: Vec<ProcessSpec>,
    pub meta: MetaSpec,
}

/// One trainer process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub training_folder: PathBuf,
    pub device: String,
    pub trigger_word: Option<String>,
    pub network: NetworkSpec,
    pub save: SaveSpec,
    pub datasets: Vec<DatasetSpec>,
    pub train: TrainSpec,
    pub model: ModelSpec,
    pub sample: SampleSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub linear: u32,
    pub linear_alpha: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveSpec {
    pub dtype: String,
    pub save_every: u64,
    pub max_step_saves_to_keep: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSpec {
    pub folder_path: PathBuf,
    pub caption_ext: String,
    pub caption_dropout_rate: f64,
    pub shuffle_tokens: bool,
    pub cache_latents_to_disk: bool,
    pub resolution: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainSpec {
    pub batch_size: usize,
    pub steps: u64,
    pub gradient_accumulation_steps: u32,
    pub train_unet: bool,
    pub train_text_encoder: bool,
    pub content_or_style: String,
    pub gradient_checkpointing: bool,
    pub noise_scheduler: String,
    pub optimizer: String,
    #[serde(skip_serializing_if = "Mapping::is_empty")]
    pub optimizer_params: Mapping,
    pub lr: f64,
    pub skip_first_sample: bool,
    pub ema_config: EmaSpec,
    pub dtype: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmaSpec {
    pub use_ema: bool,
    pub ema_decay: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSpec {
    pub name_or_path: String,
    pub arch: String,
    pub is_flux: bool,
    pub quantize: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleSpec {
    pub sampler: String,
    pub sample_every: u64,
    pub width: u32,
    pub height: u32,
    pub prompts: Vec<String>,
    pub neg: String,
    pub seed: u64,
    pub walk_seed: bool,
    #[serde(serialize_with = "whole_as_integer")]
    pub guidance_scale: f64,
    pub sample_steps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaSpec {
    pub name: String,
    pub version: String,
}

impl JobSpec {
    /// The single trainer process of this job
    pub fn process(&self) -> &ProcessSpec {
        &self.config.process[0]
    }

    /// Encode as YAML, the format ai-toolkit reads
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Encode as pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Whole numbers go out as integers (`4`, not `4.0`), as the toolkit's own
/// example jobs write them
fn whole_as_integer<S: Serializer>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

/// Build the job document for the current dataset state.
///
/// Deterministic: identical inputs always give an identical document.
pub fn compile(config: &ResolvedConfig, stats: &DatasetStats) -> JobSpec {
    let steps = config.train.steps.effective(stats.image_count);
    info!(
        name = %config.name,
        images = stats.image_count,
        steps,
        "Compiling training job"
    );

    let process = ProcessSpec {
        kind: "sd_trainer".to_string(),
        training_folder: config.training_folder.clone(),
        device: config.device.clone(),
        trigger_word: config.trigger_word.clone(),
        network: NetworkSpec {
            kind: config.network.kind.clone(),
            linear: config.network.linear,
            linear_alpha: config.network.linear_alpha,
        },
        save: SaveSpec {
            dtype: config.save.dtype.clone(),
            save_every: config.save.save_every,
            max_step_saves_to_keep: config.save.max_step_saves_to_keep,
        },
        datasets: vec![DatasetSpec {
            folder_path: config.data_folder.clone(),
            caption_ext: config.dataset.caption_ext.clone(),
            caption_dropout_rate: config.dataset.caption_dropout_rate,
            shuffle_tokens: false,
            cache_latents_to_disk: true,
            resolution: config.dataset.resolutions.clone(),
        }],
        train: TrainSpec {
            batch_size: config.train.batch_size,
            steps,
            gradient_accumulation_steps: config.train.gradient_accumulation_steps,
            train_unet: true,
            train_text_encoder: false,
            content_or_style: "balanced".to_string(),
            gradient_checkpointing: true,
            noise_scheduler: "flowmatch".to_string(),
            optimizer: config.train.optimizer.clone(),
            optimizer_params: config.train.optimizer_args.clone(),
            lr: config.train.lr,
            skip_first_sample: true,
            ema_config: EmaSpec {
                use_ema: true,
                ema_decay: 0.99,
            },
            dtype: "bf16".to_string(),
        },
        model: ModelSpec {
            name_or_path: config.model.name_or_path.clone(),
            arch: config.model.arch.clone(),
            is_flux: config.model.arch.eq_ignore_ascii_case("flux"),
            quantize: config.model.quantize,
        },
        sample: SampleSpec {
            sampler: config.sample.sampler.clone(),
            sample_every: config.sample.sample_every,
            width: config.sample.width,
            height: config.sample.height,
            prompts: config.prompts.clone(),
            neg: config.sample.neg.clone(),
            seed: config.sample.seed,
            walk_seed: config.sample.walk_seed,
            guidance_scale: config.sample.guidance_scale,
            sample_steps: config.sample.sample_steps,
        },
    };

    JobSpec {
        job: "extension".to_string(),
        config: JobConfig {
            name: config.name.clone(),
            process: vec![process],
            meta: MetaSpec {
                name: "[name]".to_string(),
                version: "1.0".to_string(),
            },
        },
    }
}
