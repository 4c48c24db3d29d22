//! On-disk layout of the decode, score, merged and summary trees.
//!
//! ```text
//! <root>/decode/<attack>_test_results/<method>/<image>/           degraded images + manifest
//! <root>/decode/<attack>_test_results/<method>/<image>_<attack>_results.csv
//! <root>/lpips/<attack>_test_results/<variant>/<method>/<image>_lpips_scores.csv
//! <root>/merged/<attack>_test_results/<variant>/<method>/<image>_merged_results.csv
//! <root>/summary/<variant>/
//! ```

use std::path::{Path, PathBuf};

use crate::attack::AttackKind;

/// File name of the clean watermarked reference inside a sweep directory.
pub const REFERENCE_FILE: &str = "original_watermarked.png";

/// File name of the severity manifest inside a sweep directory.
pub const MANIFEST_FILE: &str = "manifest.json";

const DECODE_SUFFIX: &str = "_results.csv";
const SCORE_SUFFIX: &str = "_lpips_scores.csv";
const MERGED_SUFFIX: &str = "_merged_results.csv";

/// Root of every artifact produced by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The output root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root of the decode tree.
    #[must_use]
    pub fn decode_root(&self) -> PathBuf {
        self.root.join("decode")
    }

    /// Root of the perceptual score tree.
    #[must_use]
    pub fn lpips_root(&self) -> PathBuf {
        self.root.join("lpips")
    }

    /// Root of the merged tree.
    #[must_use]
    pub fn merged_root(&self) -> PathBuf {
        self.root.join("merged")
    }

    /// Directory receiving summary tables for `variant`.
    #[must_use]
    pub fn summary_dir(&self, variant: &str) -> PathBuf {
        self.root.join("summary").join(variant)
    }

    /// `<decode>/<attack>_test_results/<method>`.
    #[must_use]
    pub fn decode_method_dir(&self, attack: AttackKind, method: &str) -> PathBuf {
        attack_dir(&self.decode_root(), attack).join(method)
    }

    /// Directory holding the reference and degraded images of one sweep.
    #[must_use]
    pub fn sweep_dir(&self, attack: AttackKind, method: &str, image: &str) -> PathBuf {
        self.decode_method_dir(attack, method).join(image)
    }

    /// Decode table of one sweep.
    #[must_use]
    pub fn decode_csv(&self, attack: AttackKind, method: &str, image: &str) -> PathBuf {
        self.decode_method_dir(attack, method)
            .join(format!("{image}_{attack}{DECODE_SUFFIX}"))
    }

    /// `<lpips>/<attack>_test_results/<variant>/<method>`.
    #[must_use]
    pub fn score_method_dir(&self, attack: AttackKind, variant: &str, method: &str) -> PathBuf {
        attack_dir(&self.lpips_root(), attack).join(variant).join(method)
    }

    /// Perceptual scores of one sweep.
    #[must_use]
    pub fn score_csv(&self, attack: AttackKind, variant: &str, method: &str, image: &str) -> PathBuf {
        self.score_method_dir(attack, variant, method)
            .join(format!("{image}{SCORE_SUFFIX}"))
    }

    /// `<merged>/<attack>_test_results/<variant>/<method>`.
    #[must_use]
    pub fn merged_method_dir(&self, attack: AttackKind, variant: &str, method: &str) -> PathBuf {
        attack_dir(&self.merged_root(), attack).join(variant).join(method)
    }

    /// Merged table of one sweep.
    #[must_use]
    pub fn merged_csv(&self, attack: AttackKind, variant: &str, method: &str, image: &str) -> PathBuf {
        self.merged_method_dir(attack, variant, method)
            .join(format!("{image}{MERGED_SUFFIX}"))
    }
}

/// `<base>/<attack>_test_results`.
#[must_use]
pub fn attack_dir(base: &Path, attack: AttackKind) -> PathBuf {
    base.join(format!("{attack}_test_results"))
}

/// Image name of a merged table file, if `path` is one.
#[must_use]
pub fn merged_image_name(path: &Path) -> Option<String> {
    path.file_name()?
        .to_str()?
        .strip_suffix(MERGED_SUFFIX)
        .map(str::to_string)
}

/// Sorted subdirectory names of `dir`; empty when `dir` is unreadable.
#[must_use]
pub fn subdirectories(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(std::result::Result::ok)
                .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_the_tree_conventions() {
        let layout = Layout::new("/out");
        assert_eq!(
            layout.sweep_dir(AttackKind::Crop, "dctQim", "cat"),
            PathBuf::from("/out/decode/crop_test_results/dctQim/cat")
        );
        assert_eq!(
            layout.decode_csv(AttackKind::Noise, "dctQim", "cat"),
            PathBuf::from("/out/decode/noise_test_results/dctQim/cat_noise_results.csv")
        );
        assert_eq!(
            layout.score_csv(AttackKind::Jpeg, "original", "dctQim32", "dog"),
            PathBuf::from("/out/lpips/jpeg_test_results/original/dctQim32/dog_lpips_scores.csv")
        );
        assert_eq!(
            layout.merged_csv(AttackKind::Denoise, "resized", "dctQim", "dog"),
            PathBuf::from("/out/merged/denoising_test_results/resized/dctQim/dog_merged_results.csv")
        );
        assert_eq!(layout.summary_dir("resized"), PathBuf::from("/out/summary/resized"));
    }

    #[test]
    fn merged_image_name_strips_suffix() {
        assert_eq!(
            merged_image_name(Path::new("a/city_day_merged_results.csv")).as_deref(),
            Some("city_day")
        );
        assert_eq!(merged_image_name(Path::new("a/city_day_lpips_scores.csv")), None);
    }

    #[test]
    fn subdirectories_are_sorted_and_skip_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("c.txt"), "x").unwrap();
        assert_eq!(subdirectories(dir.path()), vec!["a".to_string(), "b".to_string()]);
        assert!(subdirectories(&dir.path().join("missing")).is_empty());
    }
}
