//! LoRA adapter lifecycle
//!
//! A generation pipeline can carry at most one fused adapter. The
//! [`AdapterManager`] tracks which one that is and sequences the swaps:
//! the previous adapter is always fully unloaded before the next one is
//! loaded, and a failed load leaves the manager in [`AdapterState::Unloaded`]
//! so the next request retries from a known state.
//!
//! Adapters are addressed by file name inside one adapter directory, the
//! layout ai-toolkit writes its trained `.safetensors` files into.

use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::pipeline::GenerationPipeline;

/// Extension of adapter weight files
pub const ADAPTER_EXTENSION: &str = ".safetensors";

/// Name of an adapter file inside the adapter directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AdapterId(String);

impl AdapterId {
    /// Validate an adapter file name.
    ///
    /// Only bare file names are accepted so an identifier can never point
    /// outside the adapter directory.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(Error::invalid_input(format!("Invalid adapter name: '{}'", name)));
        }
        Ok(Self(name))
    }

    /// The file name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AdapterId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for AdapterId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AdapterId> for String {
    fn from(id: AdapterId) -> Self {
        id.0
    }
}

/// Header-level facts about an adapter file
#[derive(Debug, Clone, Serialize)]
pub struct AdapterInfo {
    pub id: AdapterId,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub tensor_count: usize,
    /// Rank read from the first `lora_down` / `lora_A` tensor
    pub rank: Option<usize>,
}

/// Directory of trained adapter files
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    dir: PathBuf,
}

impl AdapterRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Adapter files in the directory, sorted by name.
    ///
    /// Symlinks count when their target is a `.safetensors` file, which is
    /// how adapters living elsewhere are usually exposed.
    pub fn list(&self) -> Result<Vec<AdapterId>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut adapters = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();

            let is_adapter = if name.ends_with(ADAPTER_EXTENSION) {
                true
            } else if entry.file_type()?.is_symlink() {
                fs::canonicalize(&path)
                    .map(|target| target.to_string_lossy().ends_with(ADAPTER_EXTENSION))
                    .unwrap_or(false)
            } else {
                false
            };

            if is_adapter {
                match AdapterId::new(name) {
                    Ok(id) => adapters.push(id),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping adapter file"),
                }
            }
        }
        adapters.sort();
        Ok(adapters)
    }

    /// First adapter in listing order
    pub fn default_adapter(&self) -> Result<Option<AdapterId>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Path of an adapter file
    pub fn resolve(&self, id: &AdapterId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    /// Parse the adapter's safetensors header.
    ///
    /// Missing, unreadable or corrupt files are reported as adapter load
    /// errors before the pipeline ever sees them.
    pub fn inspect(&self, id: &AdapterId) -> Result<AdapterInfo> {
        let path = self.resolve(id);
        let load_error = |msg: String| Error::adapter_load(id.as_str(), msg);

        if !path.is_file() {
            return Err(load_error(format!("weight file not found: {}", path.display())));
        }

        let buffer = fs::read(&path).map_err(|e| load_error(e.to_string()))?;
        let size_bytes = buffer.len() as u64;
        let tensors = SafeTensors::deserialize(&buffer)
            .map_err(|e| load_error(format!("invalid safetensors file: {}", e)))?;

        if tensors.len() == 0 {
            return Err(load_error("file contains no tensors".to_string()));
        }

        let rank = tensors
            .names()
            .into_iter()
            .filter(|name| name.contains(".lora_down.") || name.contains(".lora_A."))
            .min()
            .and_then(|name| tensors.tensor(name).ok())
            .and_then(|view| view.shape().first().copied());

        Ok(AdapterInfo {
            id: id.clone(),
            path,
            size_bytes,
            tensor_count: tensors.len(),
            rank,
        })
    }
}

/// Which adapter, if any, is fused into the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "adapter", rename_all = "snake_case")]
pub enum AdapterState {
    #[default]
    Unloaded,
    Loaded(AdapterId),
}

impl AdapterState {
    /// The fused adapter
    pub fn current(&self) -> Option<&AdapterId> {
        match self {
            AdapterState::Unloaded => None,
            AdapterState::Loaded(id) => Some(id),
        }
    }
}

/// Sequences adapter swaps on one pipeline
#[derive(Debug)]
pub struct AdapterManager {
    registry: AdapterRegistry,
    state: AdapterState,
}

impl AdapterManager {
    pub fn new(registry: AdapterRegistry) -> Self {
        Self {
            registry,
            state: AdapterState::Unloaded,
        }
    }

    pub fn state(&self) -> &AdapterState {
        &self.state
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Make `id` the single fused adapter.
    ///
    /// No-op when it already is. Otherwise the current adapter is unloaded
    /// first and `id` is loaded afterwards.
    pub fn ensure<P>(&mut self, pipeline: &mut P, id: &AdapterId) -> Result<&AdapterState>
    where
        P: GenerationPipeline + ?Sized,
    {
        if self.state.current() == Some(id) {
            debug!(adapter = %id, "Adapter already loaded");
            return Ok(&self.state);
        }

        self.unload_current(pipeline)?;
        self.load(pipeline, id)?;
        Ok(&self.state)
    }

    /// Revert the pipeline to base weights
    pub fn ensure_base<P>(&mut self, pipeline: &mut P) -> Result<&AdapterState>
    where
        P: GenerationPipeline + ?Sized,
    {
        self.unload_current(pipeline)?;
        Ok(&self.state)
    }

    /// Unload the fused adapter.
    ///
    /// If the pipeline fails to unload, its weights may still carry the
    /// adapter, so the state keeps reporting it.
    fn unload_current<P>(&mut self, pipeline: &mut P) -> Result<()>
    where
        P: GenerationPipeline + ?Sized,
    {
        if let AdapterState::Loaded(current) = &self.state {
            info!("Unloading LoRA: {}", current);
            if let Err(e) = pipeline.unload_adapter() {
                error!(adapter = %current, error = %e, "Failed to unload adapter");
                return Err(e);
            }
            self.state = AdapterState::Unloaded;
        }
        Ok(())
    }

    fn load<P>(&mut self, pipeline: &mut P, id: &AdapterId) -> Result<()>
    where
        P: GenerationPipeline + ?Sized,
    {
        let path = self.registry.resolve(id);
        info!("Loading LoRA: {}", path.display());

        let result = self.registry.inspect(id).and_then(|info| {
            debug!(
                adapter = %id,
                tensors = info.tensor_count,
                rank = ?info.rank,
                size_bytes = info.size_bytes,
                "Adapter file verified"
            );
            pipeline.load_adapter(&path)
        });

        match result {
            Ok(()) => {
                self.state = AdapterState::Loaded(id.clone());
                Ok(())
            }
            Err(e) => {
                self.state = AdapterState::Unloaded;
                error!(adapter = %id, error = %e, "Failed to load adapter");
                Err(match e {
                    Error::AdapterLoad { .. } => e,
                    other => Error::adapter_load(id.as_str(), other.to_string()),
                })
            }
        }
    }
}
