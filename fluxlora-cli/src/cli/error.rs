use colored::*;
use std::path::PathBuf;
use thiserror::Error;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Core(#[from] fluxlora::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Print a user-friendly error message
    pub fn print_error(&self) {
        eprintln!("{} {}", "Error:".red().bold(), self);
        if let Some(hint) = self.hint() {
            eprintln!("\n{} {}", "Hint:".yellow(), hint);
        }
    }

    /// Follow-up advice shown under the error, if any
    pub fn hint(&self) -> Option<String> {
        let hint = match self {
            CliError::ConfigNotFound(_) => format!(
                "Run {} to create a default settings file",
                "fluxlora config init".cyan()
            ),
            CliError::InvalidArgument(_) => {
                format!("Use {} for more information", "fluxlora --help".cyan())
            }
            CliError::Server(_) => "Check that the port is not already in use".to_string(),
            CliError::Core(fluxlora::Error::Preflight(msg)) if msg.contains("Token") => format!(
                "You can also export {} instead of using a token file",
                "HF_TOKEN".cyan()
            ),
            CliError::Core(fluxlora::Error::Config(msg)) if msg.contains("prompts") => format!(
                "Add a list of sample prompts, e.g. {}",
                "prompts: [\"a photo of ohwx\"]".cyan()
            ),
            CliError::Core(fluxlora::Error::Worker(_)) => format!(
                "Check the worker commands with {}",
                "fluxlora config show".cyan()
            ),
            CliError::Core(e) if e.is_preflight() => {
                "Nothing was started. Fix the input above and run the command again".to_string()
            }
            _ => return None,
        };
        Some(hint)
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::InvalidArgument(_) => 2,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for CliError {
    fn from(err: serde_yaml::Error) -> Self {
        CliError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for CliError {
    fn from(err: toml::ser::Error) -> Self {
        CliError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for CliError {
    fn from(err: config::ConfigError) -> Self {
        CliError::Config(err.to_string())
    }
}
