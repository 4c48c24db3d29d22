//! Perceptual distance between a sweep's reference and its degraded images.
//!
//! A scorer reads one sweep directory (the clean watermarked reference plus
//! every degraded image) and writes `filename,lpips_score` rows, sorted by file
//! name, reference excluded. The learned LPIPS network runs out of process via
//! [`ExternalScorer`]; [`StructuralScorer`] is a built-in SSIM-based stand-in
//! with the same contract.

use std::path::{Path, PathBuf};
use std::process::Command;

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::attack::AttackKind;
use crate::error::{Error, Result};
use crate::harness::is_supported_image;
use crate::layout::{subdirectories, Layout, REFERENCE_FILE};
use crate::merge::is_reference;
use crate::table::{read_scores, write_scores, ScoreRow};

/// Side length both images are resized to before comparison.
pub const SCORE_SIZE: u32 = 256;

const WINDOW: usize = 8;
const STRIDE: usize = 4;
const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

/// Scores every degraded image of a sweep directory against its reference.
pub trait PerceptualScorer: Send + Sync {
    /// Score `dir` and write the result to `output_csv`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingReference`] if `dir` has no reference image, or
    /// any error from the scorer itself.
    fn score_directory(&self, dir: &Path, output_csv: &Path) -> Result<Vec<ScoreRow>>;
}

/// Runs an external program as `<program> <args..> --dir <dir> --output_csv <csv>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalScorer {
    program: String,
    args: Vec<String>,
}

impl ExternalScorer {
    /// Scorer invoking `program` with leading `args`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line such as
    /// `python calculate_lpips_scores.py`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty command line.
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("empty scorer command".to_string()))?;
        Ok(Self::new(program, parts.collect()))
    }
}

impl PerceptualScorer for ExternalScorer {
    fn score_directory(&self, dir: &Path, output_csv: &Path) -> Result<Vec<ScoreRow>> {
        let reference = dir.join(REFERENCE_FILE);
        if !reference.exists() {
            return Err(Error::MissingReference(reference));
        }
        if let Some(parent) = output_csv.parent() {
            std::fs::create_dir_all(parent)?;
        }

        log::debug!("running {} {:?} on {}", self.program, self.args, dir.display());
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg("--dir")
            .arg(dir)
            .arg("--output_csv")
            .arg(output_csv)
            .status()?;
        if !status.success() {
            return Err(Error::ScorerFailed {
                program: self.program.clone(),
                status,
            });
        }
        read_scores(output_csv)
    }
}

/// Built-in distance `1 - mean SSIM` over luma, on images resized to
/// [`SCORE_SIZE`] squared.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralScorer;

impl StructuralScorer {
    /// Distance between two images; 0 for identical images.
    #[must_use]
    pub fn distance(&self, reference: &RgbImage, other: &RgbImage) -> f64 {
        let a = luma_plane(reference);
        let b = luma_plane(other);
        (1.0 - mean_ssim(&a, &b, SCORE_SIZE as usize)).max(0.0)
    }
}

impl PerceptualScorer for StructuralScorer {
    fn score_directory(&self, dir: &Path, output_csv: &Path) -> Result<Vec<ScoreRow>> {
        let reference_path = dir.join(REFERENCE_FILE);
        if !reference_path.exists() {
            return Err(Error::MissingReference(reference_path));
        }
        let reference = load_rgb(&reference_path)?;

        let mut rows = Vec::new();
        for path in sorted_images(dir)? {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if is_reference(&filename) {
                continue;
            }
            let score = self.distance(&reference, &load_rgb(&path)?);
            log::debug!("{filename}: {score:.4}");
            rows.push(ScoreRow {
                filename,
                lpips_score: Some(score),
            });
        }

        write_scores(output_csv, &rows)?;
        log::info!("saved {} scores to {}", rows.len(), output_csv.display());
        Ok(rows)
    }
}

fn load_rgb(path: &Path) -> Result<RgbImage> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| Error::ImageLoad {
            path: path.to_path_buf(),
            source,
        })
}

fn sorted_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| is_supported_image(p))
        .collect();
    paths.sort();
    Ok(paths)
}

fn luma_plane(image: &RgbImage) -> Vec<f64> {
    let resized = imageops::resize(image, SCORE_SIZE, SCORE_SIZE, FilterType::Triangle);
    resized
        .pixels()
        .map(|p| 0.299 * f64::from(p[0]) + 0.587 * f64::from(p[1]) + 0.114 * f64::from(p[2]))
        .collect()
}

/// Mean SSIM over `WINDOW`-sized windows stepped by `STRIDE`.
#[allow(clippy::cast_precision_loss)]
fn mean_ssim(a: &[f64], b: &[f64], size: usize) -> f64 {
    let n = (WINDOW * WINDOW) as f64;
    let mut total = 0.0;
    let mut windows = 0usize;

    for y in (0..=size - WINDOW).step_by(STRIDE) {
        for x in (0..=size - WINDOW).step_by(STRIDE) {
            let (mut sa, mut sb, mut saa, mut sbb, mut sab) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for dy in 0..WINDOW {
                let row = (y + dy) * size + x;
                for (&pa, &pb) in a[row..row + WINDOW].iter().zip(&b[row..row + WINDOW]) {
                    sa += pa;
                    sb += pb;
                    saa += pa * pa;
                    sbb += pb * pb;
                    sab += pa * pb;
                }
            }
            let (mu_a, mu_b) = (sa / n, sb / n);
            let var_a = saa / n - mu_a * mu_a;
            let var_b = sbb / n - mu_b * mu_b;
            let cov = sab / n - mu_a * mu_b;
            total += ((2.0 * mu_a * mu_b + C1) * (2.0 * cov + C2))
                / ((mu_a * mu_a + mu_b * mu_b + C1) * (var_a + var_b + C2));
            windows += 1;
        }
    }
    total / windows as f64
}

/// Score every sweep directory of `attack` for each method.
///
/// Output goes to the score tree of `variant`. Directories are scored in
/// parallel with the `cli` feature.
///
/// # Errors
///
/// Returns the first scorer error; a missing reference or failed external
/// scorer aborts the batch.
pub fn score_tree(
    layout: &Layout,
    attack: AttackKind,
    variant: &str,
    methods: &[String],
    scorer: &dyn PerceptualScorer,
) -> Result<Vec<PathBuf>> {
    let jobs: Vec<(PathBuf, PathBuf)> = methods
        .iter()
        .flat_map(|method| {
            let method_dir = layout.decode_method_dir(attack, method);
            subdirectories(&method_dir)
                .into_iter()
                .map(move |image| {
                    (
                        method_dir.join(&image),
                        layout.score_csv(attack, variant, method, &image),
                    )
                })
        })
        .collect();

    #[cfg(feature = "cli")]
    {
        use rayon::prelude::*;
        jobs.par_iter()
            .map(|(dir, csv)| scorer.score_directory(dir, csv).map(|_| csv.clone()))
            .collect()
    }

    #[cfg(not(feature = "cli"))]
    {
        jobs.iter()
            .map(|(dir, csv)| scorer.score_directory(dir, csv).map(|_| csv.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack;

    #[allow(clippy::cast_possible_truncation)]
    fn textured(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let v = (x * 13 + y * 7) % 200;
            image::Rgb([v as u8, (255 - v) as u8, ((x * y) % 255) as u8])
        })
    }

    #[test]
    fn identical_images_have_zero_distance() {
        let img = textured(64, 64);
        assert!(StructuralScorer.distance(&img, &img) < 1e-9);
    }

    #[test]
    fn distance_grows_with_damage() {
        let img = textured(128, 128);
        let light = attack::mask_center(&img, 0.05);
        let heavy = attack::mask_center(&img, 0.6);
        let d_light = StructuralScorer.distance(&img, &light);
        let d_heavy = StructuralScorer.distance(&img, &heavy);
        assert!(d_light > 0.0);
        assert!(d_heavy > d_light, "{d_heavy} <= {d_light}");
    }

    #[test]
    fn scores_directory_sorted_without_reference() {
        let dir = tempfile::tempdir().unwrap();
        let img = textured(64, 64);
        img.save(dir.path().join(REFERENCE_FILE)).unwrap();
        attack::mask_center(&img, 0.5).save(dir.path().join("mask_frac50.png")).unwrap();
        attack::mask_center(&img, 0.1).save(dir.path().join("mask_frac10.png")).unwrap();
        std::fs::write(dir.path().join("manifest.json"), "{}").unwrap();

        let csv = dir.path().join("out/cat_lpips_scores.csv");
        let rows = StructuralScorer.score_directory(dir.path(), &csv).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, ["mask_frac10.png", "mask_frac50.png"]);
        assert_eq!(read_scores(&csv).unwrap(), rows);
    }

    #[test]
    fn missing_reference_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        textured(32, 32).save(dir.path().join("crop_ratio_0.50.png")).unwrap();
        let err = StructuralScorer
            .score_directory(dir.path(), &dir.path().join("x.csv"))
            .unwrap_err();
        assert!(matches!(err, Error::MissingReference(_)));

        let external = ExternalScorer::new("true", Vec::new());
        let err = external
            .score_directory(dir.path(), &dir.path().join("x.csv"))
            .unwrap_err();
        assert!(matches!(err, Error::MissingReference(_)));
    }

    #[cfg(unix)]
    #[test]
    fn failing_external_scorer_aborts() {
        let dir = tempfile::tempdir().unwrap();
        textured(32, 32).save(dir.path().join(REFERENCE_FILE)).unwrap();
        let scorer = ExternalScorer::new("false", Vec::new());
        let err = scorer
            .score_directory(dir.path(), &dir.path().join("out/x.csv"))
            .unwrap_err();
        assert!(matches!(err, Error::ScorerFailed { ref program, .. } if program == "false"));
    }

    #[test]
    fn command_line_is_split() {
        let scorer = ExternalScorer::from_command_line("python calculate_lpips_scores.py").unwrap();
        assert_eq!(
            scorer,
            ExternalScorer::new("python", vec!["calculate_lpips_scores.py".to_string()])
        );
        assert!(ExternalScorer::from_command_line("   ").is_err());
    }
}
