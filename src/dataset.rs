//! Training dataset folder scanning
//!
//! A dataset folder holds the training images and, next to each of them, a
//! caption file with the same stem. The folder is rescanned every time
//! statistics are needed so derived values always reflect its current state.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// File extensions recognized as training images (compared case-insensitively)
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif"];

/// Extension of caption files written next to images
pub const CAPTION_EXTENSION: &str = "txt";

/// Check whether a path names a recognized image file
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Sibling caption path for an image (`cat.png` -> `cat.txt`)
pub fn caption_path(image: &Path) -> PathBuf {
    image.with_extension(CAPTION_EXTENSION)
}

/// Snapshot of a dataset folder taken at scan time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatasetStats {
    /// Number of recognized images
    pub image_count: usize,
    /// Number of images that already have a caption file
    pub captioned_count: usize,
}

/// A directory of training images
#[derive(Debug, Clone)]
pub struct DatasetFolder {
    root: PathBuf,
}

impl DatasetFolder {
    /// Open an existing dataset folder
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::config(format!(
                "Input folder '{}' does not exist.",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Open a dataset folder and require at least one image in it
    pub fn open_non_empty(root: impl Into<PathBuf>) -> Result<Self> {
        let folder = Self::open(root)?;
        if folder.images()?.is_empty() {
            return Err(Error::config(format!(
                "No images found in the input folder '{}'. \
                 Please add some images (PNG, JPG, JPEG, or GIF) to the input folder and try again.",
                folder.root.display()
            )));
        }
        Ok(folder)
    }

    /// Folder path
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Recognized images, sorted by file name
    pub fn images(&self) -> Result<Vec<PathBuf>> {
        let mut images = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_file() && is_image(&path) {
                images.push(path);
            }
        }
        images.sort();
        Ok(images)
    }

    /// Scan the folder and count images and captions
    pub fn stats(&self) -> Result<DatasetStats> {
        let images = self.images()?;
        let captioned_count = images.iter().filter(|p| caption_path(p).exists()).count();
        let stats = DatasetStats {
            image_count: images.len(),
            captioned_count,
        };
        debug!(
            folder = %self.root.display(),
            images = stats.image_count,
            captioned = stats.captioned_count,
            "Scanned dataset folder"
        );
        Ok(stats)
    }
}
