use crate::cli::{
    commands::train::caption_pipeline,
    config::Config,
    error::{CliError, CliResult},
    logging,
    progress::OutputMode,
};
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct CaptionCommand {
    /// Folder of images to caption
    #[arg(short, long, help = "Image folder (defaults to the data folder)")]
    pub folder: Option<PathBuf>,
}

pub async fn execute(cmd: CaptionCommand, config: Config, output: OutputMode) -> CliResult<()> {
    let folder = cmd.folder.unwrap_or_else(|| config.paths.data_folder.clone());
    let command = config.workers.caption.clone();

    let report = tokio::task::spawn_blocking(move || -> CliResult<_> {
        let mut captioner = caption_pipeline(&folder, command, output)?;
        Ok(captioner.process_folder(&folder)?)
    })
    .await
    .map_err(|e| CliError::Other(e.into()))??;

    logging::success(&format!(
        "Captioned {} image(s), {} already had captions",
        report.captioned.len(),
        report.skipped.len()
    ));
    for (image, reason) in &report.failed {
        logging::warning(&format!("{}: {}", image.display(), reason));
    }
    Ok(())
}
