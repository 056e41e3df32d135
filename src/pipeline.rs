//! Generation pipeline boundary
//!
//! The diffusion pipeline itself (text encoders, transformer, VAE, sampler
//! math) lives outside this crate. This module defines what the rest of the
//! system needs from it: adapter fuse/unload, scheduler installation and a
//! batched text-to-image call.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Guidance scale used when a request does not set one
pub const DEFAULT_GUIDANCE_SCALE: f32 = 3.5;

/// Sampling scheduler installed before every generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler class name understood by the pipeline
    pub name: String,
    /// Whether the timestep shift adapts to image resolution
    pub use_dynamic_shifting: bool,
    /// Static shift applied when dynamic shifting is off
    pub shift: f32,
}

impl SchedulerConfig {
    /// Flow-matching Euler scheduler used by FLUX models
    pub fn flow_match_euler() -> Self {
        Self {
            name: "FlowMatchEulerDiscreteScheduler".to_string(),
            use_dynamic_shifting: true,
            shift: 3.0,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::flow_match_euler()
    }
}

/// Parameters of a single pipeline invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub prompt: String,
    pub steps: u32,
    pub guidance_scale: f32,
    pub count: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// One encoded output image
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    /// PNG-encoded bytes
    pub png: Vec<u8>,
}

/// A loaded text-to-image pipeline whose weights can take one LoRA adapter
#[cfg_attr(test, mockall::automock)]
pub trait GenerationPipeline: Send {
    /// Fuse adapter weights from `path` into the live model
    fn load_adapter(&mut self, path: &Path) -> Result<()>;

    /// Revert the live model to its base weights
    fn unload_adapter(&mut self) -> Result<()>;

    /// Install the sampling scheduler
    fn set_scheduler(&mut self, scheduler: &SchedulerConfig) -> Result<()>;

    /// Run the pipeline, returning images in generation order
    fn generate(&mut self, params: &SamplingParams) -> Result<Vec<GeneratedImage>>;
}

impl<P: GenerationPipeline + ?Sized> GenerationPipeline for Box<P> {
    fn load_adapter(&mut self, path: &Path) -> Result<()> {
        (**self).load_adapter(path)
    }

    fn unload_adapter(&mut self) -> Result<()> {
        (**self).unload_adapter()
    }

    fn set_scheduler(&mut self, scheduler: &SchedulerConfig) -> Result<()> {
        (**self).set_scheduler(scheduler)
    }

    fn generate(&mut self, params: &SamplingParams) -> Result<Vec<GeneratedImage>> {
        (**self).generate(params)
    }
}
