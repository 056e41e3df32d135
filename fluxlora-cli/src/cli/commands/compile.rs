use crate::cli::{
    commands::train::resolve_document,
    config::Config,
    error::CliResult,
    logging,
};
use clap::{Args, ValueEnum};
use fluxlora::{dataset::DatasetFolder, job};
use std::{fs, path::PathBuf};

#[derive(Args, Debug)]
pub struct CompileCommand {
    /// Optional trigger word
    pub trigger: Option<String>,

    /// Name of the trained model
    pub model_name: Option<String>,

    /// Training configuration document
    #[arg(short, long, env = "FLUXLORA_DOCUMENT", help = "Training configuration document")]
    pub document: Option<PathBuf>,

    /// Write the job here instead of stdout
    #[arg(short, long, help = "Output file")]
    pub out: Option<PathBuf>,

    /// Output encoding
    #[arg(long, value_enum, default_value_t = JobFormat::Yaml)]
    pub format: JobFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum JobFormat {
    Yaml,
    Json,
}

pub async fn execute(cmd: CompileCommand, config: Config) -> CliResult<()> {
    let resolved = resolve_document(
        cmd.document.as_deref(),
        cmd.trigger.clone(),
        cmd.model_name.clone(),
        &config,
    )?;
    let stats = DatasetFolder::open_non_empty(&resolved.data_folder)?.stats()?;
    let job = job::compile(&resolved, &stats);

    let content = match cmd.format {
        JobFormat::Yaml => job.to_yaml()?,
        JobFormat::Json => job.to_json()?,
    };

    match cmd.out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, content)?;
            logging::success(&format!(
                "Job '{}' ({} steps, {} images) written to {}",
                job.config.name,
                job.process().train.steps,
                stats.image_count,
                path.display()
            ));
        }
        None => print!("{}", content),
    }
    Ok(())
}
