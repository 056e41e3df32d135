//! Tool settings
//!
//! Where things live on disk, how to start the model workers, and where the
//! server binds. Layered lowest to highest: built-in defaults, the settings
//! file, then `FLUXLORA__*` environment variables
//! (`FLUXLORA__SERVER__PORT=8000`).

use crate::cli::error::{CliError, CliResult};
use directories::ProjectDirs;
use fluxlora::config::Defaults;
use fluxlora::worker::WorkerCommand;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "FLUXLORA";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub workers: WorkersConfig,
    pub toolkit: ToolkitConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Training images and their caption files
    pub data_folder: PathBuf,
    /// Training output, handed to the toolkit as `training_folder`
    pub output_folder: PathBuf,
    /// Training configuration document
    pub config_document: PathBuf,
    /// Hugging Face token file
    pub token_file: PathBuf,
    /// Trained adapters offered for generation
    pub adapter_dir: PathBuf,
    /// Generated images
    pub image_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub caption: WorkerCommand,
    pub pipeline: WorkerCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    /// ai-toolkit checkout containing `run.py`
    pub dir: PathBuf,
    pub python: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_folder: PathBuf::from("/workspace/data"),
            output_folder: PathBuf::from("/workspace/output"),
            config_document: PathBuf::from("/workspace/config.yaml"),
            token_file: PathBuf::from("/workspace/token"),
            adapter_dir: PathBuf::from("/workspace/output/lora"),
            image_dir: PathBuf::from("/workspace/output"),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            caption: WorkerCommand::new("python").arg("workers/caption_worker.py"),
            pipeline: WorkerCommand::new("python").arg("workers/flux_worker.py"),
        }
    }
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/workspace/ai-toolkit"),
            python: "python".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
        }
    }
}

impl Config {
    /// Host defaults for resolving a training document
    pub fn resolve_defaults(&self) -> Defaults {
        Defaults {
            data_folder: self.paths.data_folder.clone(),
            training_folder: self.paths.output_folder.clone(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> CliResult<()> {
        if self.server.port == 0 {
            return Err(CliError::ValidationError(
                "Server port must be non-zero".to_string(),
            ));
        }
        if self.workers.caption.program.trim().is_empty()
            || self.workers.pipeline.program.trim().is_empty()
        {
            return Err(CliError::ValidationError(
                "Worker commands must name a program".to_string(),
            ));
        }
        if self.toolkit.python.trim().is_empty() {
            return Err(CliError::ValidationError(
                "Toolkit python interpreter must be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load settings from `config_path` (or the default location) and the
/// environment.
///
/// A missing default file is fine; a missing explicitly named file is not.
pub fn load_config(config_path: Option<&Path>) -> CliResult<Config> {
    let config_file = match config_path {
        Some(path) if !path.exists() => return Err(CliError::ConfigNotFound(path.to_path_buf())),
        Some(path) => path.to_path_buf(),
        None => get_default_config_path()?,
    };

    let settings = ::config::Config::builder()
        .add_source(::config::File::from(config_file.as_path()).required(false))
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = settings.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(config: &Config, config_file: &Path) -> CliResult<()> {
    if let Some(parent) = config_file.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = match config_file.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::to_string(config)?,
        Some("toml") => toml::to_string(config)?,
        _ => serde_json::to_string_pretty(config)?,
    };

    fs::write(config_file, content)
        .map_err(|e| CliError::Config(format!("Failed to write config file: {}", e)))?;

    Ok(())
}

pub fn get_default_config_path() -> CliResult<PathBuf> {
    let proj_dirs = ProjectDirs::from("dev", "fluxlora", "fluxlora")
        .ok_or_else(|| CliError::Config("Failed to determine config directory".to_string()))?;

    Ok(proj_dirs.config_dir().join("config.yaml"))
}

pub fn show_config(config: &Config) -> CliResult<()> {
    let yaml_content = serde_yaml::to_string(config)?;
    println!("{}", yaml_content);
    Ok(())
}

pub fn init_config(config_path: Option<&Path>, force: bool) -> CliResult<PathBuf> {
    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => get_default_config_path()?,
    };

    if config_path.exists() && !force {
        return Err(CliError::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    save_config(&Config::default(), &config_path)?;
    Ok(config_path)
}
