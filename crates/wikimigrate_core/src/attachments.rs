use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::log::{LogCategory, LogDetail, LogStatus, MigrationLog};
use crate::outline::Destination;

/// Quality ladder for the first compression tier: re-encode at the original
/// dimensions, decreasing quality, never below the floor.
const QUALITY_LADDER: [u8; 5] = [85, 70, 55, 40, 25];
const RESIZE_SCALE_START: f32 = 0.5;
const RESIZE_SCALE_STEP: f32 = 0.1;
const RESIZE_SCALE_FLOOR: f32 = 0.1;
const RESIZE_QUALITY_START: u8 = 75;
const RESIZE_QUALITY_STEP: u8 = 10;
const RESIZE_QUALITY_FLOOR: u8 = 30;

/// Only raster formats are worth re-encoding; everything else uploads as-is.
const RASTER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file not found: {0}")]
    Missing(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("upload failed for {path}: {}", reasons.join("; "))]
    Rejected { path: PathBuf, reasons: Vec<String> },
}

/// The markup transformer's view of attachment handling: hand over a local
/// file, get back the destination URL to rewrite the reference to.
pub trait AttachmentStore {
    fn upload(&mut self, file: &Path, referencing_doc: &str) -> Result<String, UploadError>;
}

/// Sequential upload pipeline with the compression fallback. The size ceiling
/// is advisory: when no compression tier fits, the original is attempted
/// anyway and the destination gets the final say.
pub struct AttachmentPipeline<'a> {
    destination: &'a dyn Destination,
    max_upload_bytes: u64,
    log: &'a mut MigrationLog,
}

impl<'a> AttachmentPipeline<'a> {
    pub fn new(
        destination: &'a dyn Destination,
        max_upload_bytes: u64,
        log: &'a mut MigrationLog,
    ) -> Self {
        Self {
            destination,
            max_upload_bytes,
            log,
        }
    }

    /// One upload attempt of the bytes at `payload`, named after `original`.
    fn attempt(&self, payload: &Path, original: &Path) -> Result<String, String> {
        let bytes = fs::read(payload).map_err(|err| format!("read failed: {err}"))?;
        let name = original
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("attachment");
        self.destination
            .upload_file(name, mime_for_path(original), &bytes)
            .map_err(|err| err.to_string())
    }
}

impl AttachmentStore for AttachmentPipeline<'_> {
    fn upload(&mut self, file: &Path, referencing_doc: &str) -> Result<String, UploadError> {
        if !file.exists() {
            self.log.record(
                referencing_doc,
                LogCategory::Attachments,
                LogStatus::Failed,
                "file not found",
                LogDetail::file(file),
            );
            return Err(UploadError::Missing(file.to_path_buf()));
        }
        let size = fs::metadata(file)
            .map_err(|source| UploadError::Io {
                path: file.to_path_buf(),
                source,
            })?
            .len();

        let mut reasons = Vec::new();
        let mut compressed: Option<NamedTempFile> = None;
        if size > self.max_upload_bytes {
            println!("  file too large ({size} bytes), compressing before upload");
            match compress_image(file, self.max_upload_bytes) {
                Ok(Some(candidate)) => compressed = Some(candidate),
                Ok(None) => reasons.push(format!(
                    "compression could not reach {} bytes",
                    self.max_upload_bytes
                )),
                Err(err) => reasons.push(format!("compression failed: {err}")),
            }
        }

        // Temp file removal on every path is carried by NamedTempFile's drop.
        if let Some(candidate) = &compressed {
            match self.attempt(candidate.path(), file) {
                Ok(url) => {
                    self.log.record(
                        referencing_doc,
                        LogCategory::Attachments,
                        LogStatus::Success,
                        "uploaded compressed attachment",
                        LogDetail::file(file).with_url(url.clone()),
                    );
                    return Ok(url);
                }
                Err(reason) => reasons.push(format!("compressed upload: {reason}")),
            }
        }

        match self.attempt(file, file) {
            Ok(url) => {
                self.log.record(
                    referencing_doc,
                    LogCategory::Attachments,
                    LogStatus::Success,
                    "uploaded attachment",
                    LogDetail::file(file).with_url(url.clone()),
                );
                Ok(url)
            }
            Err(reason) => {
                reasons.push(reason);
                self.log.record(
                    referencing_doc,
                    LogCategory::Attachments,
                    LogStatus::Failed,
                    format!("upload failed: {}", reasons.join("; ")),
                    LogDetail::file(file),
                );
                Err(UploadError::Rejected {
                    path: file.to_path_buf(),
                    reasons,
                })
            }
        }
    }
}

/// Compress a raster image to fit `target_bytes`, preserving dimensions at
/// decreasing quality first, then downscaling with a relaxed quality floor.
/// Returns None when the format is not raster or no tier fits: the loop is
/// bounded and a candidate is only accepted when it is both under the target
/// and no larger than the input.
pub fn compress_image(file: &Path, target_bytes: u64) -> Result<Option<NamedTempFile>> {
    let extension = file
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    if !matches!(extension.as_deref(), Some(ext) if RASTER_EXTENSIONS.contains(&ext)) {
        return Ok(None);
    }

    let original_bytes = fs::metadata(file)
        .with_context(|| format!("failed to stat {}", file.display()))?
        .len();
    let decoded = image::open(file)
        .with_context(|| format!("failed to decode {}", file.display()))?
        .to_rgb8();

    for quality in QUALITY_LADDER {
        let encoded = encode_jpeg(&decoded, quality)?;
        if fits(&encoded, target_bytes, original_bytes) {
            return write_candidate(&encoded).map(Some);
        }
    }

    let mut scale = RESIZE_SCALE_START;
    let mut quality = RESIZE_QUALITY_START;
    while scale > RESIZE_SCALE_FLOOR {
        let width = ((decoded.width() as f32 * scale) as u32).max(1);
        let height = ((decoded.height() as f32 * scale) as u32).max(1);
        let resized = image::imageops::resize(&decoded, width, height, FilterType::Lanczos3);
        let encoded = encode_jpeg(&resized, quality)?;
        if fits(&encoded, target_bytes, original_bytes) {
            println!("    resized to {width}x{height} at quality {quality}");
            return write_candidate(&encoded).map(Some);
        }
        scale -= RESIZE_SCALE_STEP;
        quality = quality
            .saturating_sub(RESIZE_QUALITY_STEP)
            .max(RESIZE_QUALITY_FLOOR);
    }

    Ok(None)
}

fn fits(encoded: &[u8], target_bytes: u64, original_bytes: u64) -> bool {
    let len = encoded.len() as u64;
    len <= target_bytes && len <= original_bytes
}

fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(img).context("JPEG encode failed")?;
    Ok(out.into_inner())
}

fn write_candidate(bytes: &[u8]) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("wikimigrate-")
        .suffix(".jpg")
        .tempfile()
        .context("failed to create compression temp file")?;
    file.write_all(bytes)
        .context("failed to write compression temp file")?;
    file.flush().context("failed to flush compression temp file")?;
    Ok(file)
}

/// Manual fallback for contexts with no upload endpoint at all: inline the
/// file as a base64 data URL. Never chosen automatically by the pipeline.
pub fn inline_as_data_url(file: &Path) -> Result<String> {
    let bytes = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    Ok(format!(
        "data:{};base64,{}",
        mime_for_path(file),
        BASE64.encode(bytes)
    ))
}

pub fn mime_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("xml") => "application/xml",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        Some("yaml" | "yml") => "application/yaml",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
