//! Test fixtures and utilities for integration tests

use fluxlora::{GenerationPipeline, Result, SamplingParams, SchedulerConfig};
use fluxlora::pipeline::GeneratedImage;
use fluxlora_cli::cli::config::Config;
use parking_lot::Mutex;
use safetensors::{Dtype, tensor::TensorView};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Create a temporary directory for test outputs
pub fn create_test_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().to_path_buf();
    (temp_dir, path)
}

/// Settings with every path inside `root`
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.paths.data_folder = root.join("data");
    config.paths.output_folder = root.join("output");
    config.paths.config_document = root.join("config.yaml");
    config.paths.token_file = root.join("token");
    config.paths.adapter_dir = root.join("output/lora");
    config.paths.image_dir = root.join("output/images");
    config.toolkit.dir = root.join("ai-toolkit");
    config
}

/// Write placeholder images into `dir`
pub fn create_dataset(dir: &Path, names: &[&str]) {
    fs::create_dir_all(dir).expect("Failed to create dataset dir");
    for name in names {
        fs::write(dir.join(name), b"not really an image").expect("Failed to write image");
    }
}

/// Write a small FLUX-style LoRA file with the given rank
pub fn write_adapter(dir: &Path, name: &str, rank: usize) -> PathBuf {
    fs::create_dir_all(dir).expect("Failed to create adapter dir");
    let down = vec![0u8; rank * 16 * 4];
    let up = vec![0u8; 16 * rank * 4];
    let tensors = vec![
        (
            "transformer.transformer_blocks.0.attn.to_q.lora_A.weight".to_string(),
            TensorView::new(Dtype::F32, vec![rank, 16], &down).expect("valid tensor"),
        ),
        (
            "transformer.transformer_blocks.0.attn.to_q.lora_B.weight".to_string(),
            TensorView::new(Dtype::F32, vec![16, rank], &up).expect("valid tensor"),
        ),
    ];
    let bytes = safetensors::serialize(tensors, &None).expect("Failed to serialize adapter");
    let path = dir.join(name);
    fs::write(&path, bytes).expect("Failed to write adapter");
    path
}

/// Calls seen by [`FakePipeline`]
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineCall {
    Load(PathBuf),
    Unload,
    Scheduler,
    Generate { steps: u32, count: u32, width: u32, height: u32 },
}

/// Pipeline returning one tiny PNG header per requested image
#[derive(Clone, Default)]
pub struct FakePipeline {
    pub calls: Arc<Mutex<Vec<PipelineCall>>>,
}

impl GenerationPipeline for FakePipeline {
    fn load_adapter(&mut self, path: &Path) -> Result<()> {
        self.calls.lock().push(PipelineCall::Load(path.to_path_buf()));
        Ok(())
    }

    fn unload_adapter(&mut self) -> Result<()> {
        self.calls.lock().push(PipelineCall::Unload);
        Ok(())
    }

    fn set_scheduler(&mut self, _scheduler: &SchedulerConfig) -> Result<()> {
        self.calls.lock().push(PipelineCall::Scheduler);
        Ok(())
    }

    fn generate(&mut self, params: &SamplingParams) -> Result<Vec<GeneratedImage>> {
        self.calls.lock().push(PipelineCall::Generate {
            steps: params.steps,
            count: params.count,
            width: params.width,
            height: params.height,
        });
        Ok((0..params.count)
            .map(|_| GeneratedImage {
                png: b"\x89PNG\r\n\x1a\n".to_vec(),
            })
            .collect())
    }
}
