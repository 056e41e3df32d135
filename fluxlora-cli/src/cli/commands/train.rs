use crate::cli::{
    config::Config,
    error::{CliError, CliResult},
    logging,
    progress::OutputMode,
};
use clap::Args;
use fluxlora::{
    caption::{CaptionModel, CaptionOutcome, CaptionPipeline},
    config::{load_document, resolve_with, CliOverrides},
    credentials::{HfToken, HF_TOKEN_ENV},
    dataset::DatasetFolder,
    worker::{WorkerCaptioner, WorkerCommand},
    ResolvedConfig, ToolkitRunner, TrainingSession,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct TrainCommand {
    /// Optional trigger word
    pub trigger: Option<String>,

    /// Name of the trained model
    pub model_name: Option<String>,

    /// Training configuration document
    #[arg(short, long, env = "FLUXLORA_DOCUMENT", help = "Training configuration document")]
    pub document: Option<PathBuf>,

    /// Skip dataset captioning
    #[arg(long, help = "Skip dataset captioning")]
    pub skip_captions: bool,
}

pub async fn execute(cmd: TrainCommand, config: Config, output: OutputMode) -> CliResult<()> {
    // Preflight: nothing expensive is started until these pass
    let token = HfToken::from_env(&config.paths.token_file)?;
    let resolved = resolve_document(
        cmd.document.as_deref(),
        cmd.trigger.clone(),
        cmd.model_name.clone(),
        &config,
    )?;

    logging::info(&format!(
        "Training '{}' on {} with {}",
        resolved.name,
        resolved.data_folder.display(),
        resolved.model.name_or_path
    ));

    let caption_command = config
        .workers
        .caption
        .clone()
        .env(HF_TOKEN_ENV, token.expose());
    let runner = ToolkitRunner::new(&config.toolkit.dir)
        .with_python(&config.toolkit.python)
        .with_token(token);
    let skip_captions = cmd.skip_captions;

    let prepared = tokio::task::spawn_blocking(move || -> CliResult<_> {
        let session = TrainingSession::new(resolved, runner);
        let prepared = if skip_captions {
            session.compile()?
        } else {
            let mut captioner =
                caption_pipeline(&session.config().data_folder, caption_command, output)?;
            session.prepare(&mut captioner)?
        };

        if !prepared.captions.failed.is_empty() {
            warn!(
                failed = prepared.captions.failed.len(),
                "Some images have no caption and will train without one"
            );
        }
        info!(steps = prepared.job.process().train.steps, "Pre-process completed");

        let spinner = output.spinner(&format!(
            "Training {} for {} steps",
            prepared.job.config.name,
            prepared.job.process().train.steps
        ))?;
        let result = session.train(&prepared);
        spinner.finish_and_clear();
        result?;
        Ok(prepared)
    })
    .await
    .map_err(|e| CliError::Other(e.into()))??;

    logging::success(&format!(
        "Training finished. Adapters are in {}",
        prepared
            .job
            .process()
            .training_folder
            .join(&prepared.job.config.name)
            .display()
    ));
    Ok(())
}

/// Load and resolve the training document against the tool settings
pub fn resolve_document(
    document: Option<&Path>,
    trigger: Option<String>,
    name: Option<String>,
    config: &Config,
) -> CliResult<ResolvedConfig> {
    let path = document.unwrap_or(config.paths.config_document.as_path());
    let raw = load_document(path)?;
    let overrides = CliOverrides { trigger, name };
    Ok(resolve_with(raw, &overrides, &config.resolve_defaults())?)
}

/// Caption pipeline backed by the caption worker, with a progress bar
pub fn caption_pipeline(
    folder: &Path,
    command: WorkerCommand,
    output: OutputMode,
) -> CliResult<CaptionPipeline> {
    let total = DatasetFolder::open(folder)?.images()?.len() as u64;
    let progress = output.bar("Captioning", total)?;

    Ok(CaptionPipeline::new(move || {
        let model: Box<dyn CaptionModel> = Box::new(WorkerCaptioner::spawn(&command)?);
        Ok(model)
    })
    .on_progress(move |image, outcome| {
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let CaptionOutcome::Failed(reason) = outcome {
            progress.println(&format!("Failed to caption {}: {}", name, reason));
        }
        progress.advance(&name);
        if progress.position() >= total {
            progress.finish_and_clear();
        }
    }))
}
