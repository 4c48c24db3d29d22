//! Batch driver: every image x method x attack sweep of a run, and the
//! scoring, merging and summarizing stages that follow it.

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat, RgbImage};

use crate::codec::CodecRegistry;
use crate::config::{AttackPlan, ExperimentConfig};
use crate::dataset::collect_images;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::merge::merge_tree;
use crate::perceptual::{score_tree, ExternalScorer, PerceptualScorer, StructuralScorer};
use crate::report::{build_report, compare_variants, render_comparison, summarize_tree, ComparisonRow, Report};
use crate::sweep::sweep;

/// Outcome of one (image, method, attack) sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSummary {
    /// Source image.
    pub path: PathBuf,
    /// Watermarking method; empty when the image itself failed.
    pub method: String,
    /// Attack name; empty when the image itself failed.
    pub attack: String,
    /// Whether the sweep ran and was persisted.
    pub success: bool,
    /// Whether the clean watermarked copy decoded.
    pub can_decode_clean: bool,
    /// First failing severity.
    pub first_failure: Option<f64>,
    /// Last successful severity.
    pub last_success: Option<f64>,
    /// Human-readable status message.
    pub message: String,
}

impl SweepSummary {
    fn failed(path: &Path, method: &str, attack: &str, err: &Error) -> Self {
        Self {
            path: path.to_path_buf(),
            method: method.to_string(),
            attack: attack.to_string(),
            success: false,
            can_decode_clean: false,
            first_failure: None,
            last_success: None,
            message: err.to_string(),
        }
    }
}

/// A configured run: codecs, overlay and output layout.
///
/// Create once with [`Harness::new`] and reuse for every image.
#[derive(Debug)]
pub struct Harness {
    config: ExperimentConfig,
    registry: CodecRegistry,
    layout: Layout,
    overlay: Option<RgbImage>,
}

impl Harness {
    /// Validate `config` and prepare a run writing below `output_root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a configured
    /// overlay image cannot be loaded.
    pub fn new(config: ExperimentConfig, output_root: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let overlay = config.overlay()?;
        Ok(Self {
            registry: config.registry(),
            config,
            layout: Layout::new(output_root),
            overlay,
        })
    }

    /// The run's configuration.
    #[must_use]
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// The run's output layout.
    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Sweep every configured method and attack over one image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageLoad`] if the image cannot be loaded; nothing is
    /// written in that case. Failures of individual sweeps are reported in the
    /// returned summaries.
    pub fn run_image(&self, input: &Path) -> Result<Vec<SweepSummary>> {
        let image = image::open(input)
            .map_err(|source| Error::ImageLoad {
                path: input.to_path_buf(),
                source,
            })?
            .to_rgb8();
        let name = image_name(input);

        let mut summaries = Vec::new();
        for method in &self.config.methods {
            for plan in &self.config.attacks {
                let summary = self
                    .run_sweep(input, &image, &name, method, plan)
                    .unwrap_or_else(|e| {
                        log::warn!("{} {method}/{}: {e}", input.display(), plan.attack);
                        SweepSummary::failed(input, method, plan.attack.name(), &e)
                    });
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    fn run_sweep(
        &self,
        input: &Path,
        image: &RgbImage,
        name: &str,
        method: &str,
        plan: &AttackPlan,
    ) -> Result<SweepSummary> {
        let codec = self.registry.get(method)?;
        let attack = self.config.attack(plan.attack, self.overlay.as_ref());
        let schedule = plan.schedule()?;
        let out = sweep(image, codec.as_ref(), &attack, &schedule, &self.config.payload)?;
        out.persist(
            &self.layout.sweep_dir(plan.attack, method, name),
            &self.layout.decode_csv(plan.attack, method, name),
        )?;

        let trials = out.trials.len();
        Ok(SweepSummary {
            path: input.to_path_buf(),
            method: method.to_string(),
            attack: plan.attack.name().to_string(),
            success: true,
            can_decode_clean: out.clean.can_decode_clean,
            first_failure: out.first_failure(),
            last_success: out.last_success(),
            message: format!("{}/{trials} trials decoded", out.success_count()),
        })
    }

    /// Sweep every supported image below `input_dir`, including subdirectories.
    ///
    /// Uses parallel iteration when the `cli` feature is enabled (via rayon).
    /// An image that fails to load yields a single failed summary.
    #[must_use]
    pub fn run_directory(&self, input_dir: &Path) -> Vec<SweepSummary> {
        let entries = match collect_images(input_dir) {
            Ok(entries) => entries,
            Err(e) => return vec![SweepSummary::failed(input_dir, "", "", &e)],
        };

        let run = |path: &PathBuf| {
            self.run_image(path)
                .unwrap_or_else(|e| vec![SweepSummary::failed(path, "", "", &e)])
        };

        #[cfg(feature = "cli")]
        {
            use rayon::prelude::*;
            entries.par_iter().flat_map_iter(run).collect()
        }

        #[cfg(not(feature = "cli"))]
        {
            entries.iter().flat_map(run).collect()
        }
    }

    /// Perceptual scorer of this run: the configured external command, or the
    /// built-in structural scorer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty scorer command.
    pub fn scorer(&self) -> Result<Box<dyn PerceptualScorer>> {
        Ok(match &self.config.scorer_command {
            Some(command) => Box::new(ExternalScorer::from_command_line(command)?),
            None => Box::new(StructuralScorer),
        })
    }

    /// Score every sweep directory of every configured attack.
    ///
    /// # Errors
    ///
    /// Returns the first scoring error; the batch stops there.
    pub fn score(&self, scorer: &dyn PerceptualScorer) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for plan in &self.config.attacks {
            written.extend(score_tree(
                &self.layout,
                plan.attack,
                &self.config.variant,
                &self.config.methods,
                scorer,
            )?);
        }
        Ok(written)
    }

    /// Merge decode and score tables of every configured attack.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing table cannot be read or written.
    pub fn merge(&self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for plan in &self.config.attacks {
            written.extend(merge_tree(
                &self.layout,
                plan.attack,
                &self.config.variant,
                &self.config.methods,
            )?);
        }
        Ok(written)
    }

    /// Aggregate the merged tree of the configured variant.
    ///
    /// # Errors
    ///
    /// Returns an error if the variant has no ranges or a summary cannot be written.
    pub fn summarize(&self) -> Result<Report> {
        summarize_tree(
            &self.layout,
            &self.config.variant,
            &self.config.methods,
            self.config.range_table()?,
        )
    }

    /// Compare the merged trees of two variants and write the Markdown delta
    /// table to `summary/<base>_vs_<other>.md`.
    ///
    /// # Errors
    ///
    /// Returns an error if either variant has no ranges or the table cannot be written.
    pub fn compare(&self, base: &str, other: &str) -> Result<Vec<ComparisonRow>> {
        let methods = &self.config.methods;
        let base_report = build_report(&self.layout, base, methods, self.config.ranges_for(base)?);
        let other_report = build_report(&self.layout, other, methods, self.config.ranges_for(other)?);
        let rows = compare_variants(&base_report.rows, &other_report.rows);

        let dir = self.layout.root().join("summary");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{base}_vs_{other}.md"));
        std::fs::write(&path, render_comparison(&rows, base, other))?;
        log::info!("saved comparison to {}", path.display());
        Ok(rows)
    }
}

/// Image name used in result paths: the file stem.
#[must_use]
pub fn image_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Check if a file has a supported image extension.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => matches!(
            ext.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp"
        ),
        None => false,
    }
}

/// Save an RGB image, choosing the encoder from the extension.
///
/// JPEG output uses quality 100 so saving adds as little loss as possible.
///
/// # Errors
///
/// Returns an error if the format is unsupported or writing fails.
pub fn save_image(img: &RgbImage, path: &Path) -> Result<()> {
    let format =
        ImageFormat::from_path(path).map_err(|e| Error::UnsupportedFormat(e.to_string()))?;

    match format {
        ImageFormat::Jpeg => {
            let file = std::io::BufWriter::new(std::fs::File::create(path)?);
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(file, 100);
            encoder.encode_image(img)?;
        }
        ImageFormat::Png | ImageFormat::WebP | ImageFormat::Bmp => {
            DynamicImage::ImageRgb8(img.clone()).save_with_format(path, format)?;
        }
        _ => {
            return Err(Error::UnsupportedFormat(format!("{format:?}")));
        }
    }

    Ok(())
}
