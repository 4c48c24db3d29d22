//! Per-image threshold sweep.
//!
//! A sweep embeds the payload once, decodes the unattacked copy, then applies
//! one attack at every severity of a [`SeveritySchedule`] in order. The
//! [`ThresholdTracker`] records the first severity at which decoding failed and
//! the most recent severity at which it still succeeded; every row carries the
//! tracker state as of that row.

use std::collections::BTreeMap;
use std::path::Path;

use image::RgbImage;

use crate::attack::{Attack, AttackKind, Polarity, CLEAN};
use crate::codec::WatermarkCodec;
use crate::error::{Error, Result};
use crate::harness::save_image;
use crate::layout::{MANIFEST_FILE, REFERENCE_FILE};
use crate::table::{DecodeTable, Manifest, ManifestEntry, TrialRecord};

/// Maximum number of characters of a decoded payload kept in a trial row.
pub const DECODED_MAX_CHARS: usize = 25;

/// Severities for one attack, ordered mildest to harshest.
#[derive(Debug, Clone, PartialEq)]
pub struct SeveritySchedule {
    kind: AttackKind,
    values: Vec<f64>,
}

impl SeveritySchedule {
    /// Validate `values` as a schedule for `kind`.
    ///
    /// Graded attacks need strictly increasing values when higher is more
    /// severe and strictly decreasing values otherwise. Binary attacks take no
    /// values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnorderedSchedule`] for an out-of-order or non-finite
    /// schedule, and [`Error::Config`] for a non-empty binary schedule or two
    /// severities that would be saved under the same file name.
    pub fn new(kind: AttackKind, values: Vec<f64>) -> Result<Self> {
        if kind.is_binary() {
            if !values.is_empty() {
                return Err(Error::Config(format!("{kind} is a binary attack and takes no severities")));
            }
            return Ok(Self { kind, values });
        }

        let ordered = values.iter().all(|v| v.is_finite())
            && values.windows(2).all(|w| match kind.polarity() {
                Polarity::HigherIsMoreSevere => w[0] < w[1],
                Polarity::LowerIsMoreSevere => w[0] > w[1],
            });
        if !ordered {
            return Err(Error::UnorderedSchedule {
                attack: kind.name().to_string(),
                values,
            });
        }

        // each trial image is persisted under its file name
        let mut names = BTreeMap::new();
        for &v in &values {
            if let Some(prev) = names.insert(kind.file_name(Some(v)), v) {
                return Err(Error::Config(format!(
                    "{kind} severities {prev} and {v} map to the same file {}",
                    kind.file_name(Some(v))
                )));
            }
        }
        Ok(Self { kind, values })
    }

    /// The built-in schedule for `kind`.
    #[must_use]
    pub fn default_for(kind: AttackKind) -> Self {
        Self {
            kind,
            values: kind.default_schedule(),
        }
    }

    /// Attack the schedule belongs to.
    #[must_use]
    pub fn kind(&self) -> AttackKind {
        self.kind
    }

    /// Severities in sweep order.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Running first-failure / last-success state of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThresholdTracker {
    first_failure: Option<f64>,
    last_success: Option<f64>,
}

impl ThresholdTracker {
    /// A tracker that has seen no trials.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one trial outcome.
    ///
    /// A success always becomes the last success. A failure only counts as the
    /// first failure if none was recorded before.
    pub fn record(&mut self, severity: f64, success: bool) {
        if success {
            self.last_success = Some(severity);
        } else if self.first_failure.is_none() {
            self.first_failure = Some(severity);
        }
    }

    /// Severity of the first failure so far.
    #[must_use]
    pub fn first_failure(&self) -> Option<f64> {
        self.first_failure
    }

    /// Severity of the latest success so far.
    #[must_use]
    pub fn last_success(&self) -> Option<f64> {
        self.last_success
    }
}

/// Cut a decoded payload to [`DECODED_MAX_CHARS`] characters.
#[must_use]
pub fn truncate_decoded(decoded: &str) -> String {
    decoded.chars().take(DECODED_MAX_CHARS).collect()
}

/// One attacked trial: its row plus the degraded image.
#[derive(Debug, Clone)]
pub struct Trial {
    /// The decode table row.
    pub record: TrialRecord,
    /// File name the degraded image is persisted under.
    pub file_name: String,
    /// The degraded image.
    pub image: RgbImage,
}

/// Everything a sweep produced, ready to be persisted.
#[derive(Debug, Clone)]
pub struct SweepOutput {
    /// Attack that was swept.
    pub attack: AttackKind,
    /// Watermarking method.
    pub method: String,
    /// Payload actually embedded (after fitting to the method's width).
    pub payload: String,
    /// Clean watermarked reference.
    pub watermarked: RgbImage,
    /// The `clean` row.
    pub clean: TrialRecord,
    /// Attacked trials in schedule order.
    pub trials: Vec<Trial>,
    /// Noise seed in effect.
    pub seed: u64,
}

impl SweepOutput {
    /// All rows, clean first.
    #[must_use]
    pub fn records(&self) -> Vec<TrialRecord> {
        std::iter::once(self.clean.clone())
            .chain(self.trials.iter().map(|t| t.record.clone()))
            .collect()
    }

    /// The decode table of this sweep.
    #[must_use]
    pub fn table(&self) -> DecodeTable {
        DecodeTable {
            severity_column: self.attack.severity_column().to_string(),
            rows: self.records(),
        }
    }

    /// First failure after the final trial.
    #[must_use]
    pub fn first_failure(&self) -> Option<f64> {
        self.trials.last().and_then(|t| t.record.first_failure)
    }

    /// Last success after the final trial.
    #[must_use]
    pub fn last_success(&self) -> Option<f64> {
        self.trials.last().and_then(|t| t.record.last_success)
    }

    /// Number of attacked trials that decoded.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.trials.iter().filter(|t| t.record.success).count()
    }

    /// Write the reference, each degraded image and the manifest into
    /// `image_dir`, and the decode table to `csv_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory, image or table cannot be written.
    pub fn persist(&self, image_dir: &Path, csv_path: &Path) -> Result<()> {
        std::fs::create_dir_all(image_dir)?;
        save_image(&self.watermarked, &image_dir.join(REFERENCE_FILE))?;
        for trial in &self.trials {
            save_image(&trial.image, &image_dir.join(&trial.file_name))?;
        }

        let manifest = Manifest {
            attack: self.attack,
            method: self.method.clone(),
            reference: REFERENCE_FILE.to_string(),
            seed: (self.attack == AttackKind::Noise).then_some(self.seed),
            entries: self
                .trials
                .iter()
                .map(|t| ManifestEntry {
                    file_name: t.file_name.clone(),
                    severity: t.record.severity,
                })
                .collect(),
        };
        manifest.write(&image_dir.join(MANIFEST_FILE))?;

        self.table().write_csv(csv_path)?;
        log::info!("saved {} trials to {}", self.trials.len(), image_dir.display());
        Ok(())
    }
}

/// Run one attack sweep on `image`.
///
/// The payload is fitted to the codec's width, embedded once, and the clean
/// copy decoded. A failed clean decode is recorded but does not stop the sweep.
///
/// # Errors
///
/// Returns an error if the schedule belongs to another attack, the payload is
/// invalid, embedding fails or an attack fails.
pub fn sweep(
    image: &RgbImage,
    codec: &dyn WatermarkCodec,
    attack: &Attack,
    schedule: &SeveritySchedule,
    payload: &str,
) -> Result<SweepOutput> {
    let kind = attack.kind();
    if schedule.kind() != kind {
        return Err(Error::Config(format!(
            "schedule for {} used with {kind} attack",
            schedule.kind()
        )));
    }

    let payload = codec.width().prepare(payload)?;
    let watermarked = codec.embed(image, &payload)?;
    let clean_decode = codec.decode(&watermarked, &payload);
    let can_decode_clean = clean_decode.success;
    if !can_decode_clean {
        log::warn!(
            "{}: clean watermarked image does not decode ({:?})",
            codec.name(),
            truncate_decoded(&clean_decode.payload)
        );
    }

    let clean = TrialRecord {
        severity: None,
        decoded: truncate_decoded(&clean_decode.payload),
        success: can_decode_clean,
        attack_type: CLEAN.to_string(),
        can_decode_clean,
        first_failure: None,
        last_success: None,
    };

    log::info!("{} / {kind}: {:>10} | {:<25} | status", codec.name(), "severity", "decoded");
    log_row(codec.name(), kind, CLEAN, &clean.decoded, clean.success);

    let mut trials = Vec::new();
    if kind.is_binary() {
        let attacked = attack.apply(&watermarked, None)?;
        let decoded = codec.decode(&attacked, &payload);
        let record = TrialRecord {
            severity: None,
            decoded: truncate_decoded(&decoded.payload),
            success: decoded.success,
            attack_type: kind.name().to_string(),
            can_decode_clean,
            first_failure: None,
            last_success: None,
        };
        log_row(codec.name(), kind, kind.name(), &record.decoded, record.success);
        trials.push(Trial {
            record,
            file_name: kind.file_name(None),
            image: attacked,
        });
    } else {
        let mut tracker = ThresholdTracker::new();
        for &severity in schedule.values() {
            let attacked = attack.apply(&watermarked, Some(severity))?;
            let decoded = codec.decode(&attacked, &payload);
            tracker.record(severity, decoded.success);
            let record = TrialRecord {
                severity: Some(severity),
                decoded: truncate_decoded(&decoded.payload),
                success: decoded.success,
                attack_type: kind.name().to_string(),
                can_decode_clean,
                first_failure: tracker.first_failure(),
                last_success: tracker.last_success(),
            };
            log_row(codec.name(), kind, &severity.to_string(), &record.decoded, record.success);
            trials.push(Trial {
                record,
                file_name: kind.file_name(Some(severity)),
                image: attacked,
            });
        }
    }

    Ok(SweepOutput {
        attack: kind,
        method: codec.name().to_string(),
        payload,
        watermarked,
        clean,
        trials,
        seed: attack.seed(),
    })
}

fn log_row(method: &str, kind: AttackKind, severity: &str, decoded: &str, success: bool) {
    log::info!(
        "{method} / {kind}: {severity:>10} | {decoded:<25} | {}",
        if success { "ok" } else { "FAIL" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DctQimCodec, PayloadWidth, DEFAULT_KEY};

    #[allow(clippy::cast_possible_truncation)]
    fn textured(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let v = 60 + (x * 5 + y * 11) % 120;
            image::Rgb([v as u8, (190 - v / 2) as u8, (50 + (x ^ y) % 90) as u8])
        })
    }

    fn codec() -> DctQimCodec {
        DctQimCodec::new("dctQim", PayloadWidth::Bits64, DEFAULT_KEY)
    }

    #[test]
    fn tracker_matches_worked_example() {
        let mut tracker = ThresholdTracker::new();
        for (s, ok) in [(100.0, true), (90.0, true), (80.0, false), (70.0, false)] {
            tracker.record(s, ok);
        }
        assert_eq!(tracker.first_failure(), Some(80.0));
        assert_eq!(tracker.last_success(), Some(90.0));
    }

    #[test]
    fn first_failure_never_changes_once_set() {
        let mut tracker = ThresholdTracker::new();
        let outcomes = [true, false, true, false, false, true];
        let mut seen = None;
        for (i, ok) in outcomes.into_iter().enumerate() {
            tracker.record(f64::from(u8::try_from(i).unwrap()), ok);
            if seen.is_none() {
                seen = tracker.first_failure();
            }
            assert_eq!(tracker.first_failure(), seen);
        }
        assert_eq!(tracker.first_failure(), Some(1.0));
    }

    #[test]
    fn last_success_is_most_recent_success() {
        let mut tracker = ThresholdTracker::new();
        for (s, ok) in [(1.0, true), (2.0, false), (3.0, true), (4.0, false)] {
            tracker.record(s, ok);
        }
        assert_eq!(tracker.last_success(), Some(3.0));
        assert_eq!(tracker.first_failure(), Some(2.0));
    }

    #[test]
    fn schedule_requires_damage_order() {
        assert!(SeveritySchedule::new(AttackKind::Jpeg, vec![100.0, 90.0, 80.0]).is_ok());
        assert!(SeveritySchedule::new(AttackKind::Jpeg, vec![80.0, 90.0]).is_err());
        assert!(SeveritySchedule::new(AttackKind::Noise, vec![0.0, 5.0, 5.0]).is_err());
        assert!(SeveritySchedule::new(AttackKind::Noise, vec![0.0, f64::NAN]).is_err());
        assert!(SeveritySchedule::new(AttackKind::Upscale, vec![1.0]).is_err());
        assert!(SeveritySchedule::new(AttackKind::Upscale, vec![]).is_ok());
        for kind in AttackKind::ALL {
            let default = SeveritySchedule::default_for(kind);
            assert!(SeveritySchedule::new(kind, default.values().to_vec()).is_ok(), "{kind}");
        }
    }

    #[test]
    fn schedule_rejects_severities_sharing_a_file_name() {
        let crop = SeveritySchedule::new(AttackKind::Crop, vec![1.0, 0.995, 0.99]);
        assert!(matches!(crop, Err(Error::Config(msg)) if msg.contains("crop_ratio_0.99.png")));

        let mask = SeveritySchedule::new(AttackKind::Mask, vec![0.0, 0.125, 0.13]);
        assert!(matches!(mask, Err(Error::Config(msg)) if msg.contains("mask_frac13.png")));

        let fine = SeveritySchedule::new(AttackKind::Crop, vec![1.0, 0.99, 0.98]).unwrap();
        let names: std::collections::BTreeSet<String> = fine
            .values()
            .iter()
            .map(|&v| AttackKind::Crop.file_name(Some(v)))
            .collect();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn truncates_decoded_payloads() {
        let long = "x".repeat(40);
        assert_eq!(truncate_decoded(&long).len(), DECODED_MAX_CHARS);
        assert_eq!(truncate_decoded("qingquan"), "qingquan");
    }

    #[test]
    fn graded_sweep_rows_follow_schedule() {
        let image = textured(128, 128);
        let schedule = SeveritySchedule::new(AttackKind::Mask, vec![0.0, 0.1, 1.0]).unwrap();
        let out = sweep(&image, &codec(), &Attack::new(AttackKind::Mask), &schedule, "qingquan").unwrap();

        assert!(out.clean.can_decode_clean);
        assert!(out.clean.is_clean());
        assert_eq!(out.clean.severity, None);
        assert_eq!(out.trials.len(), 3);
        assert!(out.trials.iter().all(|t| t.record.can_decode_clean));
        assert_eq!(out.trials[0].record.severity, Some(0.0));
        assert!(out.trials[0].record.success);
        assert!(!out.trials[2].record.success);
        assert!(out.first_failure().is_some());
        assert_eq!(out.trials[2].file_name, "mask_frac100.png");
        assert_eq!(out.table().severity_column, "mask_fraction");
        assert_eq!(out.records().len(), 4);
    }

    #[test]
    fn binary_sweep_has_one_attack_row() {
        let image = textured(96, 96);
        let schedule = SeveritySchedule::default_for(AttackKind::Denoise);
        let out = sweep(&image, &codec(), &Attack::new(AttackKind::Denoise), &schedule, "qingquan").unwrap();
        assert_eq!(out.trials.len(), 1);
        let row = &out.trials[0].record;
        assert_eq!(row.attack_type, "denoising");
        assert_eq!(row.severity, None);
        assert_eq!(row.first_failure, None);
        assert_eq!(row.last_success, None);
        assert_eq!(out.trials[0].file_name, "denoised.png");
    }

    #[test]
    fn failed_clean_decode_does_not_stop_the_sweep() {
        struct Broken;
        impl WatermarkCodec for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn width(&self) -> PayloadWidth {
                PayloadWidth::Bits32
            }
            fn embed(&self, image: &RgbImage, _payload: &str) -> Result<RgbImage> {
                Ok(image.clone())
            }
            fn decode(&self, _image: &RgbImage, _expected: &str) -> crate::codec::Decoded {
                crate::codec::Decoded {
                    payload: "garbage".into(),
                    success: false,
                }
            }
        }

        let image = textured(32, 32);
        let schedule = SeveritySchedule::new(AttackKind::Jpeg, vec![100.0, 50.0]).unwrap();
        let out = sweep(&image, &Broken, &Attack::new(AttackKind::Jpeg), &schedule, "qingquan").unwrap();
        assert_eq!(out.payload, "qing");
        assert!(!out.clean.can_decode_clean);
        assert_eq!(out.trials.len(), 2);
        assert!(out.trials.iter().all(|t| !t.record.can_decode_clean));
        assert_eq!(out.first_failure(), Some(100.0));
        assert_eq!(out.last_success(), None);
    }

    #[test]
    fn mismatched_schedule_is_rejected() {
        let image = textured(64, 64);
        let schedule = SeveritySchedule::default_for(AttackKind::Crop);
        let err = sweep(&image, &codec(), &Attack::new(AttackKind::Jpeg), &schedule, "qingquan");
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn persist_writes_images_manifest_and_table() {
        let dir = tempfile::tempdir().unwrap();
        let image = textured(96, 96);
        let schedule = SeveritySchedule::new(AttackKind::Crop, vec![1.0, 0.5]).unwrap();
        let out = sweep(&image, &codec(), &Attack::new(AttackKind::Crop), &schedule, "qingquan").unwrap();

        let image_dir = dir.path().join("crop_test_results/dctQim/cat");
        let csv = dir.path().join("crop_test_results/dctQim/cat_crop_results.csv");
        out.persist(&image_dir, &csv).unwrap();

        assert!(image_dir.join(REFERENCE_FILE).exists());
        assert!(image_dir.join("crop_ratio_1.00.png").exists());
        assert!(image_dir.join("crop_ratio_0.50.png").exists());
        let manifest = Manifest::read(&image_dir.join(MANIFEST_FILE)).unwrap();
        assert_eq!(manifest.severity_of("crop_ratio_0.50.png"), Some(0.5));
        assert_eq!(manifest.seed, None);

        let table = DecodeTable::read_csv(&csv).unwrap();
        assert_eq!(table.severity_column, "crop_ratio");
        assert_eq!(table.rows, out.records());
    }
}
