//! Training engine runner
//!
//! Training itself is done by ai-toolkit. This module writes the compiled
//! job document to disk and runs the toolkit's entry point on it,
//! synchronously, until it exits.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, instrument};

use crate::credentials::{HfToken, HF_TOKEN_ENV};
use crate::error::{Error, Result};
use crate::job::JobSpec;

/// Something that can run a compiled training job to completion
pub trait TrainingEngine {
    fn run(&self, job: &JobSpec) -> Result<()>;
}

/// Runs jobs through ai-toolkit's `run.py`
#[derive(Debug, Clone)]
pub struct ToolkitRunner {
    toolkit_dir: PathBuf,
    python: String,
    token: Option<HfToken>,
}

impl ToolkitRunner {
    pub fn new(toolkit_dir: impl Into<PathBuf>) -> Self {
        Self {
            toolkit_dir: toolkit_dir.into(),
            python: "python".to_string(),
            token: None,
        }
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_token(mut self, token: HfToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn toolkit_dir(&self) -> &Path {
        &self.toolkit_dir
    }

    /// Where the job document for `job` is written
    pub fn job_file(&self, job: &JobSpec) -> PathBuf {
        job.process()
            .training_folder
            .join(format!("{}.job.yaml", job.config.name))
    }

    /// Write the job document, replacing any earlier one for the same name
    pub fn write_job(&self, job: &JobSpec) -> Result<PathBuf> {
        let path = self.job_file(job);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, job.to_yaml()?)?;
        Ok(path)
    }

    /// The toolkit invocation for a written job file
    pub fn command(&self, job_file: &Path) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.arg("run.py")
            .arg(job_file)
            .current_dir(&self.toolkit_dir)
            .env("HF_HUB_ENABLE_HF_TRANSFER", "1");
        if let Some(token) = &self.token {
            cmd.env(HF_TOKEN_ENV, token.expose());
        }
        cmd
    }
}

impl TrainingEngine for ToolkitRunner {
    #[instrument(skip(self, job), fields(name = %job.config.name))]
    fn run(&self, job: &JobSpec) -> Result<()> {
        let job_file = self.write_job(job)?;
        info!(
            job_file = %job_file.display(),
            steps = job.process().train.steps,
            "Starting training"
        );

        let status = self
            .command(&job_file)
            .status()
            .map_err(|e| Error::training(format!("failed to start '{}': {}", self.python, e)))?;

        if !status.success() {
            return Err(Error::training(format!("ai-toolkit exited with {}", status)));
        }

        info!("Training finished");
        Ok(())
    }
}
