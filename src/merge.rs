//! Join decode tables with perceptual scores.
//!
//! Graded attacks join on the native severity rounded to three decimals. The
//! severity of a scored file comes from the sweep manifest when one exists,
//! otherwise from the number encoded in its file name. Binary attacks have no
//! severity and join on `attack_type` instead.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::attack::{AttackKind, CLEAN};
use crate::error::Result;
use crate::layout::{Layout, MANIFEST_FILE, REFERENCE_FILE};
use crate::table::{read_scores, DecodeTable, Manifest, MergedRecord, MergedTable, ScoreRow};

/// Reference file stem; any scored file containing it is the clean image.
const REFERENCE_STEM: &str = "original_watermarked";

fn mask_pattern() -> Option<&'static Regex> {
    static MASK: OnceLock<Option<Regex>> = OnceLock::new();
    MASK.get_or_init(|| Regex::new(r"mask_frac(\d+)").ok()).as_ref()
}

fn trailing_number_pattern() -> Option<&'static Regex> {
    static TRAILING: OnceLock<Option<Regex>> = OnceLock::new();
    TRAILING
        .get_or_init(|| Regex::new(r"(-?\d+(?:\.\d+)?)\.(?:jpe?g|png)$").ok())
        .as_ref()
}

/// Round to three decimals.
#[must_use]
pub fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[allow(clippy::cast_possible_truncation)]
fn join_key(v: f64) -> i64 {
    (v * 1000.0).round() as i64
}

/// Recover the native severity encoded in a degraded image's file name.
///
/// Mask files carry a percentage (`mask_frac25.png` is 0.25); every other
/// attack carries the value itself right before the extension
/// (`crop_ratio_0.40.png`, `jpeg_quality90.png`, `rotate_-4.png`).
#[must_use]
pub fn extract_threshold_from_filename(filename: &str, attack: AttackKind) -> Option<f64> {
    if attack == AttackKind::Mask {
        let caps = mask_pattern()?.captures(filename)?;
        return caps[1].parse::<f64>().ok().map(|p| p / 100.0);
    }
    let caps = trailing_number_pattern()?.captures(filename)?;
    caps[1].parse().ok()
}

/// Severity of a scored file: manifest first, file name as fallback.
fn score_severity(row: &ScoreRow, attack: AttackKind, manifest: Option<&Manifest>) -> Option<f64> {
    manifest
        .and_then(|m| m.severity_of(&row.filename))
        .or_else(|| extract_threshold_from_filename(&row.filename, attack))
}

/// Left-join `decode` with `scores`.
///
/// Every decode row appears exactly once in the output and keeps its order.
/// When several score rows share a key the first one wins.
#[must_use]
pub fn merge(
    decode: &DecodeTable,
    scores: &[ScoreRow],
    attack: AttackKind,
    manifest: Option<&Manifest>,
) -> MergedTable {
    let rows = if attack.is_binary() {
        merge_binary(decode, scores, attack)
    } else {
        merge_graded(decode, scores, attack, manifest)
    };
    MergedTable {
        severity_column: decode.severity_column.clone(),
        rows,
    }
}

fn merge_binary(decode: &DecodeTable, scores: &[ScoreRow], attack: AttackKind) -> Vec<MergedRecord> {
    let key_of = |row: &ScoreRow| {
        if row.filename.contains(REFERENCE_STEM) {
            CLEAN
        } else {
            attack.name()
        }
    };
    decode
        .rows
        .iter()
        .map(|trial| MergedRecord {
            trial: trial.clone(),
            threshold: None,
            lpips_score: scores
                .iter()
                .find(|s| key_of(s) == trial.attack_type)
                .and_then(|s| s.lpips_score),
        })
        .collect()
}

fn merge_graded(
    decode: &DecodeTable,
    scores: &[ScoreRow],
    attack: AttackKind,
    manifest: Option<&Manifest>,
) -> Vec<MergedRecord> {
    let keyed: Vec<(Option<i64>, Option<f64>)> = scores
        .iter()
        .map(|s| {
            let key = score_severity(s, attack, manifest).map(round3).map(join_key);
            (key, s.lpips_score)
        })
        .collect();

    let clean = decode.rows.iter().filter(|r| r.is_clean()).map(|trial| MergedRecord {
        trial: trial.clone(),
        threshold: None,
        lpips_score: None,
    });

    let attacked = decode.rows.iter().filter(|r| !r.is_clean()).map(|trial| {
        let mut trial = trial.clone();
        trial.severity = trial.severity.map(round3);
        let key = trial.severity.map(join_key);
        let lpips_score = key.and_then(|k| {
            keyed
                .iter()
                .find(|(sk, _)| *sk == Some(k))
                .and_then(|(_, score)| *score)
        });
        MergedRecord {
            threshold: trial.severity,
            trial,
            lpips_score,
        }
    });

    clean.chain(attacked).collect()
}

/// Merge one decode table with its score table and write the result.
///
/// The manifest is optional; without it severities are parsed from file names.
///
/// # Errors
///
/// Returns an error if either input cannot be read or the output cannot be written.
pub fn merge_files(
    decode_csv: &Path,
    score_csv: &Path,
    manifest: Option<&Path>,
    attack: AttackKind,
    output_csv: &Path,
) -> Result<MergedTable> {
    let decode = DecodeTable::read_csv(decode_csv)?;
    let scores = read_scores(score_csv)?;
    let manifest = manifest.and_then(|path| match Manifest::read(path) {
        Ok(m) => Some(m),
        Err(e) => {
            log::debug!("no usable manifest at {}: {e}", path.display());
            None
        }
    });
    let merged = merge(&decode, &scores, attack, manifest.as_ref());
    merged.write_csv(output_csv)?;
    log::info!("saved merged table {}", output_csv.display());
    Ok(merged)
}

/// Image names that have a decode table for `attack` and `method`, sorted.
#[must_use]
pub fn decoded_images(layout: &Layout, attack: AttackKind, method: &str) -> Vec<String> {
    let suffix = format!("_{attack}_results.csv");
    let mut names: Vec<String> = std::fs::read_dir(layout.decode_method_dir(attack, method))
        .map(|rd| {
            rd.filter_map(std::result::Result::ok)
                .filter_map(|e| {
                    e.file_name()
                        .to_str()
                        .and_then(|n| n.strip_suffix(&suffix))
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Merge every image of every method for one attack.
///
/// A pair whose decode or score table is missing is logged and skipped.
///
/// # Errors
///
/// Returns the first error from reading or writing a table that does exist.
pub fn merge_tree(
    layout: &Layout,
    attack: AttackKind,
    variant: &str,
    methods: &[String],
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for method in methods {
        let images = decoded_images(layout, attack, method);
        if images.is_empty() {
            log::warn!("no decode tables for {attack}/{method} under {}", layout.decode_root().display());
        }
        for image in images {
            let decode_csv = layout.decode_csv(attack, method, &image);
            let score_csv = layout.score_csv(attack, variant, method, &image);
            if !decode_csv.exists() || !score_csv.exists() {
                log::warn!(
                    "missing file(s): {} or {}",
                    score_csv.display(),
                    decode_csv.display()
                );
                continue;
            }
            let manifest = layout.sweep_dir(attack, method, &image).join(MANIFEST_FILE);
            let output = layout.merged_csv(attack, variant, method, &image);
            merge_files(&decode_csv, &score_csv, Some(&manifest), attack, &output)?;
            written.push(output);
        }
    }
    Ok(written)
}

/// Whether `filename` is the clean reference image.
#[must_use]
pub fn is_reference(filename: &str) -> bool {
    filename == REFERENCE_FILE || filename.contains(REFERENCE_STEM)
}
