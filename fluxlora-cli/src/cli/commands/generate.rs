use crate::cli::{
    config::Config,
    error::{CliError, CliResult},
    logging,
    progress::OutputMode,
};
use clap::Args;
use fluxlora::{
    credentials::{HfToken, HF_TOKEN_ENV},
    worker::WorkerPipeline,
    AdapterId, AdapterRegistry, GenerationPipeline, GenerationRequest, GenerationService,
};
use std::fs;
use tracing::info;

/// The service type used by `generate` and `serve`
pub type Service = GenerationService<Box<dyn GenerationPipeline>>;

#[derive(Args, Debug)]
pub struct GenerateCommand {
    /// Text prompt
    #[arg(short, long, help = "Text prompt")]
    pub prompt: String,

    /// Inference steps
    #[arg(short, long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub steps: u32,

    /// Adapter file name in the adapter directory
    #[arg(short, long, conflicts_with = "base", help = "Adapter to apply (defaults to the first one)")]
    pub adapter: Option<AdapterId>,

    /// Generate with the base weights only
    #[arg(long, help = "Use base weights without an adapter")]
    pub base: bool,

    /// Number of images
    #[arg(short = 'n', long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=4))]
    pub count: u32,

    /// Image width
    #[arg(long, default_value_t = 1024)]
    pub width: u32,

    /// Image height
    #[arg(long, default_value_t = 1024)]
    pub height: u32,

    /// Guidance scale
    #[arg(short, long, help = "Guidance scale (default 3.5)")]
    pub guidance: Option<f32>,

    /// Sampling seed
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Resolve the token, prepare directories and start the pipeline worker
pub fn start_service(config: &Config) -> CliResult<Service> {
    let token = HfToken::from_env(&config.paths.token_file)?;

    fs::create_dir_all(&config.paths.image_dir)?;
    let adapter_dir = &config.paths.adapter_dir;
    if adapter_dir.is_symlink() {
        info!(dir = %adapter_dir.display(), "Adapter directory is a symlink, using it as is");
    } else {
        fs::create_dir_all(adapter_dir)?;
    }

    let command = config
        .workers
        .pipeline
        .clone()
        .env(HF_TOKEN_ENV, token.expose());
    let pipeline: Box<dyn GenerationPipeline> = Box::new(WorkerPipeline::spawn(&command)?);

    Ok(GenerationService::new(
        pipeline,
        AdapterRegistry::new(adapter_dir),
        &config.paths.image_dir,
    ))
}

pub async fn execute(cmd: GenerateCommand, config: Config, output: OutputMode) -> CliResult<()> {
    let paths = tokio::task::spawn_blocking(move || -> CliResult<_> {
        let service = start_service(&config)?;

        let adapter = match (cmd.adapter, cmd.base) {
            (Some(adapter), _) => Some(adapter),
            (None, true) => None,
            (None, false) => service.default_adapter()?,
        };
        match &adapter {
            Some(id) => logging::info(&format!("Using adapter {}", id)),
            None => logging::info("Using base weights"),
        }

        let request = GenerationRequest {
            prompt: cmd.prompt,
            steps: cmd.steps,
            adapter,
            count: cmd.count,
            width: cmd.width,
            height: cmd.height,
            guidance_scale: cmd.guidance,
            seed: cmd.seed,
        };

        let spinner = output.spinner(&format!("Generating {} image(s)", request.count))?;
        let result = service.generate(&request);
        spinner.finish_and_clear();
        Ok(result?)
    })
    .await
    .map_err(|e| CliError::Other(e.into()))??;

    for path in &paths {
        logging::success(&format!("Image saved to: {}", path.display()));
    }
    Ok(())
}
