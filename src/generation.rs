//! Generation service
//!
//! Serves text-to-image requests against one shared pipeline. Every call
//! holds a single lock across the adapter transition, the scheduler install,
//! the pipeline run and the file writes, so two requests can never interleave
//! their unload/load sequences on the shared weights.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::adapter::{AdapterId, AdapterInfo, AdapterManager, AdapterRegistry, AdapterState};
use crate::error::{Error, Result};
use crate::pipeline::{
    GeneratedImage, GenerationPipeline, SamplingParams, SchedulerConfig, DEFAULT_GUIDANCE_SCALE,
};

/// Smallest accepted image side
pub const MIN_DIMENSION: u32 = 512;
/// Largest accepted image side
pub const MAX_DIMENSION: u32 = 2048;
/// Image sides must be a multiple of this
pub const DIMENSION_STEP: u32 = 8;
/// Inference step bounds
pub const MAX_STEPS: u32 = 100;
/// Images per request bounds
pub const MAX_IMAGES: u32 = 4;

/// A text-to-image request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default = "default_steps")]
    pub steps: u32,
    /// Adapter to fuse, or base weights when absent
    #[serde(default)]
    pub adapter: Option<AdapterId>,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default)]
    pub guidance_scale: Option<f32>,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_steps() -> u32 {
    20
}

fn default_count() -> u32 {
    1
}

fn default_dimension() -> u32 {
    1024
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            steps: default_steps(),
            adapter: None,
            count: default_count(),
            width: default_dimension(),
            height: default_dimension(),
            guidance_scale: None,
            seed: None,
        }
    }

    pub fn with_adapter(mut self, adapter: AdapterId) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Check bounds and turn the request into pipeline parameters
    pub fn sampling_params(&self) -> Result<SamplingParams> {
        if self.prompt.trim().is_empty() {
            return Err(Error::invalid_input("Prompt must not be empty"));
        }
        if !(1..=MAX_STEPS).contains(&self.steps) {
            return Err(Error::invalid_input(format!(
                "Steps must be between 1 and {}, got {}",
                MAX_STEPS, self.steps
            )));
        }
        if !(1..=MAX_IMAGES).contains(&self.count) {
            return Err(Error::invalid_input(format!(
                "Number of images must be between 1 and {}, got {}",
                MAX_IMAGES, self.count
            )));
        }
        let guidance_scale = self.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE);
        if !guidance_scale.is_finite() || guidance_scale < 0.0 {
            return Err(Error::invalid_input(format!(
                "Invalid guidance scale: {}",
                guidance_scale
            )));
        }

        let width = snap_dimension(self.width);
        let height = snap_dimension(self.height);
        if (width, height) != (self.width, self.height) {
            warn!(
                requested_width = self.width,
                requested_height = self.height,
                width,
                height,
                "Adjusted resolution to the supported grid"
            );
        }

        Ok(SamplingParams {
            prompt: self.prompt.clone(),
            steps: self.steps,
            guidance_scale,
            count: self.count,
            width,
            height,
            seed: self.seed,
        })
    }
}

/// Clamp an image side to the supported range and floor it to the grid
pub fn snap_dimension(value: u32) -> u32 {
    let clamped = value.clamp(MIN_DIMENSION, MAX_DIMENSION);
    clamped - clamped % DIMENSION_STEP
}

struct Slot<P> {
    pipeline: P,
    adapters: AdapterManager,
}

/// Serializes generation requests over one pipeline
pub struct GenerationService<P> {
    slot: Mutex<Slot<P>>,
    registry: AdapterRegistry,
    output_dir: PathBuf,
    scheduler: SchedulerConfig,
}

impl<P: GenerationPipeline> GenerationService<P> {
    pub fn new(pipeline: P, registry: AdapterRegistry, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            slot: Mutex::new(Slot {
                pipeline,
                adapters: AdapterManager::new(registry.clone()),
            }),
            registry,
            output_dir: output_dir.into(),
            scheduler: SchedulerConfig::flow_match_euler(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Snapshot of the fused adapter
    pub fn adapter_state(&self) -> AdapterState {
        self.slot.lock().adapters.state().clone()
    }

    /// Like [`adapter_state`](Self::adapter_state), but `None` while a
    /// request holds the pipeline
    pub fn try_adapter_state(&self) -> Option<AdapterState> {
        self.slot.try_lock().map(|slot| slot.adapters.state().clone())
    }

    /// Rescan the adapter directory
    pub fn adapters(&self) -> Result<Vec<AdapterId>> {
        self.registry.list()
    }

    pub fn default_adapter(&self) -> Result<Option<AdapterId>> {
        self.registry.default_adapter()
    }

    pub fn inspect_adapter(&self, id: &AdapterId) -> Result<AdapterInfo> {
        self.registry.inspect(id)
    }

    /// Generate images and write them to the output directory.
    ///
    /// Returns the written paths in generation order. Any pipeline failure
    /// propagates and nothing is written for that call.
    #[instrument(skip(self, request), fields(adapter = ?request.adapter, count = request.count))]
    pub fn generate(&self, request: &GenerationRequest) -> Result<Vec<PathBuf>> {
        let params = request.sampling_params()?;

        let mut guard = self.slot.lock();
        let Slot { pipeline, adapters } = &mut *guard;

        match &request.adapter {
            Some(id) => adapters.ensure(pipeline, id)?,
            None => adapters.ensure_base(pipeline)?,
        };

        pipeline.set_scheduler(&self.scheduler)?;

        info!(
            steps = params.steps,
            width = params.width,
            height = params.height,
            guidance_scale = params.guidance_scale,
            "Generating images"
        );
        let images = pipeline.generate(&params)?;
        if images.len() != params.count as usize {
            return Err(Error::generation(format!(
                "Pipeline returned {} images, expected {}",
                images.len(),
                params.count
            )));
        }

        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let paths = persist_images(&self.output_dir, &timestamp, &images)?;
        drop(guard);

        info!(images = paths.len(), dir = %self.output_dir.display(), "Saved generated images");
        Ok(paths)
    }
}

/// Write images as `generated_<timestamp>_<n>.png`, never replacing a file
fn persist_images(dir: &Path, timestamp: &str, images: &[GeneratedImage]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;

    let mut paths = Vec::with_capacity(images.len());
    for (i, image) in images.iter().enumerate() {
        let stem = format!("generated_{}_{}", timestamp, i + 1);
        let path = write_unique(dir, &stem, &image.png)?;
        debug!(path = %path.display(), "Saved image");
        paths.push(path);
    }
    Ok(paths)
}

fn write_unique(dir: &Path, stem: &str, bytes: &[u8]) -> Result<PathBuf> {
    let mut suffix = 0u32;
    loop {
        let name = if suffix == 0 {
            format!("{}.png", stem)
        } else {
            format!("{}_{}.png", stem, suffix)
        };
        let path = dir.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(bytes)?;
                return Ok(path);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(e.into()),
        }
    }
}
