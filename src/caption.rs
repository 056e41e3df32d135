//! Dataset captioning
//!
//! Every training image needs a text label stored next to it. The pipeline
//! walks a dataset folder, skips images that already have a label and asks a
//! vision-language model for a detailed caption for the rest. The model is
//! expensive to bring up, so it is created lazily on the first image that
//! actually needs it and then kept for the lifetime of the pipeline.

use serde_json::Value;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use crate::dataset::{caption_path, DatasetFolder};
use crate::error::{Error, Result};

/// Task tag requesting a long-form caption
pub const DETAILED_CAPTION_TASK: &str = "<DETAILED_CAPTION>";

const BOILERPLATE_PREFIX: &str = "The image shows a";
const BOILERPLATE_PHRASE: &str = "of the image";

/// A vision-language model able to describe an image
pub trait CaptionModel: Send {
    /// Describe the image for the given task tag.
    ///
    /// Models answer either with a mapping keyed by task tag or with a bare
    /// string; both are returned as JSON.
    fn caption(&mut self, image: &Path, task: &str) -> Result<Value>;
}

/// Factory creating the captioning model on first use
pub type CaptionModelLoader = Box<dyn FnOnce() -> Result<Box<dyn CaptionModel>> + Send>;

/// Outcome of a single image
#[derive(Debug, Clone, PartialEq)]
pub enum CaptionOutcome {
    /// A label already existed
    Skipped,
    /// A new label was written
    Captioned(String),
    /// Captioning failed; no label was written
    Failed(String),
}

/// Summary of a folder run
#[derive(Debug, Default, Clone)]
pub struct CaptionReport {
    pub captioned: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl CaptionReport {
    /// Number of images looked at
    pub fn total(&self) -> usize {
        self.captioned.len() + self.skipped.len() + self.failed.len()
    }
}

/// Pull the caption text out of a model answer
pub fn extract_caption(answer: &Value, task: &str) -> String {
    match answer {
        Value::Object(map) if map.contains_key(task) => match &map[task] {
            Value::String(text) => text.clone(),
            Value::Array(parts) => parts
                .iter()
                .map(|part| match part {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" "),
            other => other.to_string(),
        },
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Strip the boilerplate the captioning model tends to emit.
///
/// The rules are literal substring edits tied to the model's current phrasing:
/// a leading "The image shows a" becomes "A", and every "of the image" is
/// removed. They are applied exactly, without whitespace cleanup.
pub fn normalize_caption(raw: &str) -> String {
    let caption = match raw.strip_prefix(BOILERPLATE_PREFIX) {
        Some(rest) => format!("A{}", rest),
        None => raw.to_string(),
    };
    caption.replace(BOILERPLATE_PHRASE, "")
}

/// Captions every unlabeled image in a dataset folder
pub struct CaptionPipeline {
    loader: Option<CaptionModelLoader>,
    model: Option<Box<dyn CaptionModel>>,
    task: String,
    on_progress: Option<Box<dyn Fn(&Path, &CaptionOutcome) + Send + Sync>>,
}

impl CaptionPipeline {
    /// Create a pipeline that loads its model through `loader` when first needed
    pub fn new<F>(loader: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn CaptionModel>> + Send + 'static,
    {
        Self {
            loader: Some(Box::new(loader)),
            model: None,
            task: DETAILED_CAPTION_TASK.to_string(),
            on_progress: None,
        }
    }

    /// Create a pipeline around an already loaded model
    pub fn with_model(model: Box<dyn CaptionModel>) -> Self {
        Self {
            loader: None,
            model: Some(model),
            task: DETAILED_CAPTION_TASK.to_string(),
            on_progress: None,
        }
    }

    /// Use a different task tag
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    /// Observe each image's outcome
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Path, &CaptionOutcome) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Whether the captioning model has been brought up
    pub fn is_model_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Caption all unlabeled images in `dir`.
    ///
    /// Safe to re-run: labeled images are skipped without touching the model,
    /// and a failed image is simply retried next time.
    pub fn process_folder(&mut self, dir: impl AsRef<Path>) -> Result<CaptionReport> {
        let folder = DatasetFolder::open(dir.as_ref())?;
        let mut report = CaptionReport::default();

        for image in folder.images()? {
            let outcome = self.process_image(&image)?;
            if let Some(callback) = &self.on_progress {
                callback(&image, &outcome);
            }
            match outcome {
                CaptionOutcome::Skipped => report.skipped.push(image),
                CaptionOutcome::Captioned(_) => report.captioned.push(image),
                CaptionOutcome::Failed(reason) => report.failed.push((image, reason)),
            }
        }

        info!(
            folder = %folder.path().display(),
            captioned = report.captioned.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Processed images"
        );
        Ok(report)
    }

    /// Caption one image.
    ///
    /// Only a failure to bring up the model is returned as an error; per-image
    /// problems are reported as [`CaptionOutcome::Failed`].
    fn process_image(&mut self, image: &Path) -> Result<CaptionOutcome> {
        let label = caption_path(image);
        let file_name = image.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

        if label.exists() {
            info!("Caption already exists for {}, skipping...", file_name);
            return Ok(CaptionOutcome::Skipped);
        }

        let task = self.task.clone();
        let model = self.model()?;
        info!(path = %image.display(), "Captioning image");

        let caption = match model.caption(image, &task) {
            Ok(answer) => normalize_caption(&extract_caption(&answer, &task)),
            Err(e) => {
                error!("Failed to get caption for {}: {}", file_name, e);
                return Ok(CaptionOutcome::Failed(e.to_string()));
            }
        };

        if caption.is_empty() {
            error!("Failed to get caption for {}: empty caption", file_name);
            return Ok(CaptionOutcome::Failed("empty caption".to_string()));
        }

        match write_new(&label, &caption) {
            Ok(true) => {
                info!("Caption saved for {}", file_name);
                Ok(CaptionOutcome::Captioned(caption))
            }
            Ok(false) => {
                warn!("Caption for {} appeared while captioning, keeping existing file", file_name);
                Ok(CaptionOutcome::Skipped)
            }
            Err(e) => {
                let err = Error::caption(image, e.to_string());
                error!("{}", err);
                Ok(CaptionOutcome::Failed(e.to_string()))
            }
        }
    }

    fn model(&mut self) -> Result<&mut Box<dyn CaptionModel>> {
        let model = match self.model.take() {
            Some(model) => model,
            None => {
                let loader = self
                    .loader
                    .take()
                    .ok_or_else(|| Error::internal("captioning model loader already consumed"))?;
                info!("Loading captioning model");
                loader()?
            }
        };
        Ok(self.model.insert(model))
    }
}

/// Write `content` to `path` unless it already exists.
///
/// Returns `Ok(false)` when the file was already present.
fn write_new(path: &Path, content: &str) -> std::io::Result<bool> {
    publish_new(path, |file| file.write_all(content.as_bytes()))
}

/// Fill a temporary file next to `path`, then move it into place without
/// replacing an existing file. A failed write leaves nothing at `path`.
fn publish_new<F>(path: &Path, fill: F) -> std::io::Result<bool>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = NamedTempFile::new_in(dir)?;
    fill(staged.as_file_mut())?;
    staged.as_file().sync_all()?;

    match staged.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}
