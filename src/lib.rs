//! FluxLoRA - LoRA training and serving for FLUX text-to-image models
//!
//! This crate drives two workflows around an externally hosted diffusion
//! model: preparing and launching adapter training jobs, and serving
//! generation requests with hot-swappable LoRA adapters.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod adapter;
pub mod caption;
pub mod config;
pub mod credentials;
pub mod dataset;
pub mod error;
pub mod generation;
pub mod job;
pub mod pipeline;
pub mod training;
pub mod worker;

// Re-exports
pub use adapter::{AdapterId, AdapterInfo, AdapterManager, AdapterRegistry, AdapterState};
pub use caption::{CaptionModel, CaptionPipeline, CaptionReport};
pub use config::{CliOverrides, RawConfig, ResolvedConfig};
pub use credentials::HfToken;
pub use dataset::{DatasetFolder, DatasetStats};
pub use error::{Error, Result};
pub use generation::{GenerationRequest, GenerationService};
pub use job::JobSpec;
pub use pipeline::{GenerationPipeline, SamplingParams, SchedulerConfig};
pub use training::{ToolkitRunner, TrainingEngine};

use tracing::{info, instrument};

/// Outcome of preparing a training run
#[derive(Debug, Clone)]
pub struct PreparedJob {
    /// Captioning results for this run
    pub captions: CaptionReport,
    /// Dataset counts taken after captioning
    pub stats: DatasetStats,
    /// The compiled job document
    pub job: JobSpec,
}

/// One training invocation: caption the dataset, compile, hand off
pub struct TrainingSession<E> {
    config: ResolvedConfig,
    engine: E,
}

impl<E: TrainingEngine> TrainingSession<E> {
    /// Create a session for an already resolved configuration
    pub fn new(config: ResolvedConfig, engine: E) -> Self {
        Self { config, engine }
    }

    /// The resolved configuration
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Compile the job from the dataset as it is, without captioning
    pub fn compile(&self) -> Result<PreparedJob> {
        let stats = DatasetFolder::open_non_empty(&self.config.data_folder)?.stats()?;
        Ok(PreparedJob {
            captions: CaptionReport::default(),
            stats,
            job: job::compile(&self.config, &stats),
        })
    }

    /// Caption unlabeled images and compile the job without training.
    ///
    /// The dataset is rescanned after captioning so the derived step count
    /// reflects the folder as it is now.
    #[instrument(skip_all, fields(name = %self.config.name))]
    pub fn prepare(&self, captioner: &mut CaptionPipeline) -> Result<PreparedJob> {
        let captions = captioner.process_folder(&self.config.data_folder)?;
        let prepared = PreparedJob {
            captions,
            ..self.compile()?
        };
        info!(
            images = prepared.stats.image_count,
            captioned = prepared.captions.captioned.len(),
            failed = prepared.captions.failed.len(),
            "Training job prepared"
        );
        Ok(prepared)
    }

    /// Hand a prepared job to the training engine and wait for it
    pub fn train(&self, prepared: &PreparedJob) -> Result<()> {
        self.engine.run(&prepared.job)
    }

    /// Prepare the job and run it to completion
    pub fn run(&self, captioner: &mut CaptionPipeline) -> Result<PreparedJob> {
        let prepared = self.prepare(captioner)?;
        self.train(&prepared)?;
        Ok(prepared)
    }
}
