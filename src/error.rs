//! Error types for the FluxLoRA system

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for FluxLoRA operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration document could not be resolved
    #[error("Configuration error: {0}")]
    Config(String),

    /// Environment is not ready to run (credentials, dataset)
    #[error("Preflight check failed: {0}")]
    Preflight(String),

    /// A single image could not be captioned
    #[error("Captioning failed for {}: {message}", path.display())]
    Caption {
        /// Image that failed
        path: PathBuf,
        /// Failure description
        message: String,
    },

    /// Adapter weights could not be fused into the pipeline
    #[error("Failed to load adapter '{id}': {message}")]
    AdapterLoad {
        /// Adapter identifier
        id: String,
        /// Failure description
        message: String,
    },

    /// Image generation failed inside the pipeline
    #[error("Generation error: {0}")]
    Generation(String),

    /// The training engine failed
    #[error("Training error: {0}")]
    Training(String),

    /// Worker process protocol failure
    #[error("Worker error: {0}")]
    Worker(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for FluxLoRA operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a preflight error
    pub fn preflight(msg: impl Into<String>) -> Self {
        Self::Preflight(msg.into())
    }

    /// Create a per-image captioning error
    pub fn caption(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Caption {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an adapter load error
    pub fn adapter_load(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::AdapterLoad {
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create a generation error
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a worker protocol error
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Errors raised before any expensive resource is acquired
    pub fn is_preflight(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Preflight(_))
    }
}
