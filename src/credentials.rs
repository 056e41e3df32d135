//! Hugging Face access token
//!
//! Gated base models need a token. It comes from `HF_TOKEN` when set, or
//! else from a plain-text token file. The token is handed to child processes
//! through their environment only.

use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};

/// Environment variable read by huggingface_hub
pub const HF_TOKEN_ENV: &str = "HF_TOKEN";

/// A resolved access token
#[derive(Clone, PartialEq, Eq)]
pub struct HfToken(String);

impl HfToken {
    /// Resolve the token from an environment value or the token file.
    ///
    /// A missing token file is created empty so the user has a place to
    /// paste the token; both that case and an empty file are preflight
    /// errors.
    pub fn resolve(env_value: Option<String>, token_path: &Path) -> Result<Self> {
        if let Some(value) = env_value.filter(|v| !v.trim().is_empty()) {
            info!("Using {} from environment variable", HF_TOKEN_ENV);
            return Ok(Self(value.trim().to_string()));
        }

        if !token_path.is_file() {
            if let Some(parent) = token_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::File::create(token_path)?;
            return Err(Error::preflight(format!(
                "Token file created at '{}'. Please add your Hugging Face token to it and run again.",
                token_path.display()
            )));
        }

        let token = fs::read_to_string(token_path)?.trim().to_string();
        if token.is_empty() {
            return Err(Error::preflight(format!(
                "Token file '{}' is empty. Please add your Hugging Face token to it and run again.",
                token_path.display()
            )));
        }

        info!(path = %token_path.display(), "Using Hugging Face token from file");
        Ok(Self(token))
    }

    /// Resolve using the current process environment
    pub fn from_env(token_path: &Path) -> Result<Self> {
        Self::resolve(std::env::var(HF_TOKEN_ENV).ok(), token_path)
    }

    /// The raw token value
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for HfToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HfToken(***)")
    }
}
