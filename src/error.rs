//! Error types for the watermark-robustness crate.

use std::path::PathBuf;

/// Errors that can occur while sweeping, scoring, merging or summarizing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required input image could not be found or decoded.
    #[error("failed to load image {}: {source}", .path.display())]
    ImageLoad {
        /// Path of the image that failed to load.
        path: PathBuf,
        /// Underlying decoder error.
        source: image::ImageError,
    },

    /// A directory is missing the clean watermarked reference image.
    #[error("missing clean reference image at {}", .0.display())]
    MissingReference(PathBuf),

    /// The attack name is not one of the known attack families.
    #[error("unknown attack: {0}")]
    UnknownAttack(String),

    /// The watermarking method is not registered.
    #[error("unknown watermarking method: {0}")]
    UnknownMethod(String),

    /// A severity schedule is not ordered from mildest to harshest.
    #[error("severity schedule for {attack} is not strictly ordered mildest to harshest: {values:?}")]
    UnorderedSchedule {
        /// Attack the schedule belongs to.
        attack: String,
        /// The offending severity values.
        values: Vec<f64>,
    },

    /// A normalization range is inverted, degenerate or not finite.
    #[error("invalid severity range for {attack}: min={min}, max={max}")]
    InvalidRange {
        /// Attack the range belongs to.
        attack: String,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// The watermark payload cannot be carried by the method.
    #[error("invalid payload {payload:?}: {reason}")]
    InvalidPayload {
        /// The rejected payload.
        payload: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The image is too small to carry a watermark.
    #[error("image too small ({width}x{height}) to carry a {bits}-bit payload")]
    ImageTooSmall {
        /// Image width in pixels.
        width: u32,
        /// Image height in pixels.
        height: u32,
        /// Payload width in bits.
        bits: usize,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A results table is missing a required column.
    #[error("{} has no `{column}` column", .path.display())]
    MissingColumn {
        /// Table that was read.
        path: PathBuf,
        /// Column that was expected.
        column: String,
    },

    /// The external perceptual scorer exited unsuccessfully.
    #[error("perceptual scorer `{program}` failed with {status}")]
    ScorerFailed {
        /// Program that was run.
        program: String,
        /// Exit status reported by the OS.
        status: std::process::ExitStatus,
    },

    /// The output image format is not supported.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred during image processing (encode, save).
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// A CSV table could not be read or written.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A JSON document (config, manifest) could not be read or written.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
