//! Transient image files uploaded to the chat.
//!
//! Placeholders, previews and results are written under one directory
//! with per-user, per-job names and removed when the returned
//! [`TempImage`] is dropped.

use std::path::{Path, PathBuf};

use comfybot_core::types::UserId;
use image::{ImageFormat, RgbImage};

/// Longest side of the placeholder image. Only the aspect ratio matters.
const PLACEHOLDER_MAX_SIDE: u32 = 512;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A file that is deleted when dropped.
#[derive(Debug)]
pub struct TempImage {
    path: PathBuf,
}

impl TempImage {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempImage {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove temp image");
        }
    }
}

/// Directory that holds [`TempImage`]s.
#[derive(Debug, Clone)]
pub struct MediaDir {
    root: PathBuf,
}

impl MediaDir {
    /// Use `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, MediaError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// `comfybot` under the system temp directory.
    pub fn in_system_temp() -> Result<Self, MediaError> {
        Self::new(std::env::temp_dir().join("comfybot"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file(&self, kind: &str, user_id: UserId, job_id: u64, ext: &str) -> PathBuf {
        self.root.join(format!("{kind}_{user_id}_{job_id}.{ext}"))
    }

    /// Black JPEG with the aspect ratio of a `width` x `height` render.
    pub fn write_placeholder(
        &self,
        user_id: UserId,
        job_id: u64,
        width: u32,
        height: u32,
    ) -> Result<TempImage, MediaError> {
        let (w, h) = placeholder_size(width, height);
        let path = self.file("placeholder", user_id, job_id, "jpg");
        RgbImage::new(w, h).save_with_format(&path, ImageFormat::Jpeg)?;
        Ok(TempImage { path })
    }

    /// Decode a preview payload (header already stripped) and store it as PNG.
    pub fn write_preview(&self, user_id: UserId, job_id: u64, bytes: &[u8]) -> Result<TempImage, MediaError> {
        self.write_png("preview", user_id, job_id, bytes)
    }

    /// Decode the final image and store it as PNG.
    pub fn write_result(&self, user_id: UserId, job_id: u64, bytes: &[u8]) -> Result<TempImage, MediaError> {
        self.write_png("result", user_id, job_id, bytes)
    }

    fn write_png(&self, kind: &str, user_id: UserId, job_id: u64, bytes: &[u8]) -> Result<TempImage, MediaError> {
        let image = image::load_from_memory(bytes)?;
        let path = self.file(kind, user_id, job_id, "png");
        image.save_with_format(&path, ImageFormat::Png)?;
        Ok(TempImage { path })
    }
}

/// Scale `width` x `height` down so the longest side is at most
/// [`PLACEHOLDER_MAX_SIDE`], keeping both sides at least 1.
fn placeholder_size(width: u32, height: u32) -> (u32, u32) {
    let longest = width.max(height).max(1);
    if longest <= PLACEHOLDER_MAX_SIDE {
        return (width.max(1), height.max(1));
    }
    let scale = |side: u32| ((u64::from(side) * u64::from(PLACEHOLDER_MAX_SIDE)) / u64::from(longest)).max(1) as u32;
    (scale(width), scale(height))
}
