//! Corpus preparation: square center crop plus resize, and metadata listing.

use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{ImageReader, RgbImage};
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::harness::{is_supported_image, save_image};

/// Side length of the resized corpus.
pub const DEFAULT_SIZE: u32 = 512;

/// Crop the largest centered square and resize it to `size` x `size`.
#[must_use]
pub fn center_crop_and_resize(image: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let side = w.min(h);
    let left = (w - side) / 2;
    let top = (h - side) / 2;
    let square = imageops::crop_imm(image, left, top, side, side).to_image();
    imageops::resize(&square, size, size, FilterType::Triangle)
}

/// Supported image files below `root`, recursively, sorted.
///
/// # Errors
///
/// Returns an error if `root` cannot be read. Unreadable entries below it are
/// logged and skipped.
pub fn collect_images(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(std::io::Error::from(e).into()),
            Err(e) => {
                log::warn!("skipping unreadable entry: {e}");
                continue;
            }
        };
        if entry.file_type().is_file() && is_supported_image(entry.path()) {
            found.push(entry.into_path());
        }
    }
    found.sort();
    Ok(found)
}

/// Center-crop and resize every image under `input` into `output`,
/// mirroring relative paths.
///
/// Returns the written paths. Files that fail to decode are logged and skipped.
///
/// # Errors
///
/// Returns an error if `input` cannot be read or an output cannot be written.
pub fn prepare_directory(input: &Path, output: &Path, size: u32) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for path in collect_images(input)? {
        let img = match image::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                log::warn!("failed to read image {}: {e}", path.display());
                continue;
            }
        };
        let relative = path.strip_prefix(input).unwrap_or(&path);
        let target = output.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        save_image(&center_crop_and_resize(&img, size), &target)?;
        log::info!("cropped and resized {}", target.display());
        written.push(target);
    }
    Ok(written)
}

/// Size and format of one corpus image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageMetadata {
    /// File name without directories.
    pub filename: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// `<width>x<height>`.
    pub resolution: String,
    /// File size in KiB, two decimals.
    pub file_size_kb: f64,
    /// Detected container format.
    pub format: String,
}

/// Read dimensions and format of `path` without decoding pixels.
///
/// # Errors
///
/// Returns [`Error::ImageLoad`] if the header cannot be read.
#[allow(clippy::cast_precision_loss)]
pub fn read_metadata(path: &Path) -> Result<ImageMetadata> {
    let load_err = |source| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    };
    let reader = ImageReader::open(path)?.with_guessed_format()?;
    let format = reader
        .format()
        .map_or_else(|| "unknown".to_string(), |f| format!("{f:?}").to_uppercase());
    let (width, height) = reader.into_dimensions().map_err(load_err)?;
    let bytes = std::fs::metadata(path)?.len();

    Ok(ImageMetadata {
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        width,
        height,
        resolution: format!("{width}x{height}"),
        file_size_kb: (bytes as f64 / 1024.0 * 100.0).round() / 100.0,
        format,
    })
}

/// Metadata for every image under `root`; unreadable images are logged and skipped.
///
/// # Errors
///
/// Returns an error if `root` cannot be read.
pub fn image_metadata(root: &Path) -> Result<Vec<ImageMetadata>> {
    let mut rows = Vec::new();
    for path in collect_images(root)? {
        match read_metadata(&path) {
            Ok(meta) => rows.push(meta),
            Err(e) => log::warn!("failed to open {}: {e}", path.display()),
        }
    }
    Ok(rows)
}

/// Write metadata rows as CSV.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_metadata(path: &Path, rows: &[ImageMetadata]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
