//! Image loading for the vision stage
//!
//! Images are decoded, re-encoded as PNG and base64 encoded before they are
//! attached to a model request. A file that does not decode is reported as
//! `PipelineError::ImageLoad`; no partially encoded payload is ever produced.

use crate::error::PipelineError;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use image::ImageFormat;
use std::io::Cursor;
use std::path::Path;

/// Transport-safe image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    /// MIME type of the encoded bytes
    pub mime_type: String,
    /// Base64 (standard alphabet) encoded bytes
    pub data_base64: String,
}

impl ImagePayload {
    /// PNG payload from already encoded base64 data
    #[inline]
    #[must_use]
    pub fn png_base64(data: impl Into<String>) -> Self {
        Self {
            mime_type: "image/png".to_string(),
            data_base64: data.into(),
        }
    }
}

/// Loads and encodes images
#[async_trait]
pub trait ImageLoader: Send + Sync {
    /// Load the image at `path` into a payload
    async fn load(&self, path: &Path) -> Result<ImagePayload, PipelineError>;
}

/// Decodes any supported format and re-encodes as PNG
#[derive(Debug, Clone, Copy, Default)]
pub struct PngImageLoader;

#[async_trait]
impl ImageLoader for PngImageLoader {
    async fn load(&self, path: &Path) -> Result<ImagePayload, PipelineError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| image_error(path, e.to_string()))?;

        let owned = path.to_path_buf();
        let encoded = tokio::task::spawn_blocking(move || encode_png(&bytes))
            .await
            .map_err(|e| image_error(&owned, format!("encoder task failed: {e}")))?
            .map_err(|reason| image_error(&owned, reason))?;

        tracing::debug!(path = %path.display(), bytes = encoded.len(), "image encoded");
        Ok(ImagePayload::png_base64(general_purpose::STANDARD.encode(encoded)))
    }
}

fn encode_png(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let decoded = image::load_from_memory(bytes).map_err(|e| format!("decode failed: {e}"))?;
    let mut png = Vec::new();
    decoded
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| format!("PNG encode failed: {e}"))?;
    Ok(png)
}

fn image_error(path: &Path, reason: String) -> PipelineError {
    PipelineError::ImageLoad {
        path: path.to_path_buf(),
        reason,
    }
}
