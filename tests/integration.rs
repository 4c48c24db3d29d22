use std::path::Path;

use image::{Rgb, RgbImage};
use watermark_robustness::attack::AttackKind;
use watermark_robustness::layout::REFERENCE_FILE;
use watermark_robustness::merge::merge;
use watermark_robustness::perceptual::{PerceptualScorer, StructuralScorer};
use watermark_robustness::report::{aggregate, Aggregate};
use watermark_robustness::severity::{normalize, RangeTable, SeverityRange};
use watermark_robustness::sweep::ThresholdTracker;
use watermark_robustness::table::{DecodeTable, MergedTable, ScoreRow, TrialRecord};
use watermark_robustness::{AttackPlan, Error, ExperimentConfig, Harness};

#[allow(clippy::cast_possible_truncation)]
fn textured(w: u32, h: u32) -> RgbImage {
    RgbImage::from_fn(w, h, |x, y| {
        let v = 60 + (x * 5 + y * 3) % 120;
        Rgb([v as u8, (40 + (x ^ y) % 150) as u8, (200 - v / 2) as u8])
    })
}

fn pipeline_config() -> ExperimentConfig {
    ExperimentConfig {
        methods: vec!["dctQim".into()],
        attacks: vec![
            AttackPlan {
                attack: AttackKind::Jpeg,
                severities: Some(vec![100.0, 70.0, 40.0, 10.0]),
            },
            AttackPlan::default_for(AttackKind::Upscale),
        ],
        seed: Some(42),
        ..ExperimentConfig::default()
    }
}

fn trial(severity: Option<f64>, attack_type: &str, success: bool, clean_ok: bool) -> TrialRecord {
    TrialRecord {
        severity,
        decoded: String::new(),
        success,
        attack_type: attack_type.to_string(),
        can_decode_clean: clean_ok,
        first_failure: None,
        last_success: None,
    }
}

#[test]
fn full_pipeline_on_synthetic_image() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    textured(128, 128).save(input.path().join("tile.png")).unwrap();
    std::fs::write(input.path().join("readme.txt"), b"ignored").unwrap();

    let harness = Harness::new(pipeline_config(), output.path()).unwrap();
    let summaries = harness.run_directory(input.path());
    assert_eq!(summaries.len(), 2, "{summaries:?}");
    assert!(summaries.iter().all(|s| s.success), "{summaries:?}");

    let layout = harness.layout();
    let decode = DecodeTable::read_csv(&layout.decode_csv(AttackKind::Jpeg, "dctQim", "tile")).unwrap();
    assert_eq!(decode.severity_column, "jpeg_quality");
    assert_eq!(decode.rows.len(), 5);
    assert!(decode.rows[0].is_clean());

    let scored = harness.score(&StructuralScorer).unwrap();
    assert_eq!(scored.len(), 2);

    let merged_paths = harness.merge().unwrap();
    assert_eq!(merged_paths.len(), 2);

    let jpeg = MergedTable::read_csv(&layout.merged_csv(AttackKind::Jpeg, "resized", "dctQim", "tile")).unwrap();
    assert_eq!(jpeg.rows.len(), 5);
    assert!(jpeg.rows[0].trial.is_clean());
    assert_eq!(jpeg.rows[0].lpips_score, None);
    for row in &jpeg.rows[1..] {
        assert!(row.lpips_score.is_some(), "{row:?}");
        assert_eq!(row.threshold, row.trial.severity);
    }

    let upscale = MergedTable::read_csv(&layout.merged_csv(AttackKind::Upscale, "resized", "dctQim", "tile")).unwrap();
    assert_eq!(upscale.rows.len(), 2);
    assert_eq!(upscale.rows[1].trial.attack_type, "upscale");
    assert!(upscale.rows[1].lpips_score.is_some());

    let report = harness.summarize().unwrap();
    assert_eq!(report.rows.len(), 2);
    let summary_dir = layout.summary_dir("resized");
    for name in [
        "decode_lpips_summary.csv",
        "decode_lpips_summary.md",
        "decode_lpips_latex_table.tex",
        "first_failures.csv",
        "lpips_by_severity.csv",
    ] {
        assert!(summary_dir.join(name).exists(), "missing {name}");
    }
}

#[test]
fn scoring_without_reference_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    textured(32, 32).save(dir.path().join("jpeg_quality50.png")).unwrap();
    let err = StructuralScorer
        .score_directory(dir.path(), &dir.path().join("scores.csv"))
        .unwrap_err();
    assert!(matches!(err, Error::MissingReference(p) if p.ends_with(REFERENCE_FILE)));
}

#[test]
fn missing_source_image_is_fatal() {
    let output = tempfile::tempdir().unwrap();
    let harness = Harness::new(pipeline_config(), output.path()).unwrap();
    let err = harness.run_image(Path::new("/nonexistent/photo.png")).unwrap_err();
    assert!(matches!(err, Error::ImageLoad { .. }));
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let output = tempfile::tempdir().unwrap();
    let config = ExperimentConfig {
        attacks: vec![AttackPlan {
            attack: AttackKind::Jpeg,
            severities: Some(vec![10.0, 50.0, 100.0]),
        }],
        ..ExperimentConfig::default()
    };
    assert!(matches!(
        Harness::new(config, output.path()),
        Err(Error::UnorderedSchedule { .. })
    ));
}

#[test]
fn jpeg_normalization_scenario() {
    let table = RangeTable::resized();
    let close = |a: Option<f64>, b: f64| (a.unwrap() - b).abs() < 1e-9;
    assert!(close(normalize("jpeg", 100.0, &table), 0.0));
    assert!(close(normalize("jpeg", 10.0, &table), 1.0));
    assert!(close(normalize("jpeg", 55.0, &table), 0.5));
}

#[test]
fn normalization_is_bounded_and_reversal_is_symmetric() {
    let table = RangeTable::resized();
    for kind in AttackKind::ALL.iter().filter(|k| !k.is_binary()) {
        let range = table.get(kind.name()).unwrap();
        for i in 0..=20 {
            let v = range.min + (range.max - range.min) * f64::from(i) / 20.0;
            let n = range.normalize(v);
            assert!((0.0..=1.0).contains(&n), "{kind} {v} -> {n}");
            if range.reversed {
                assert!((n - (1.0 - range.scale(v))).abs() < 1e-12);
            }
        }
    }

    let degenerate = SeverityRange::observed(AttackKind::Crop, &[0.5, 0.5]).unwrap();
    assert_eq!(degenerate.normalize(0.1), 0.0);
    assert_eq!(degenerate.normalize(0.9), 0.0);
}

#[test]
fn sweep_threshold_scenario() {
    let mut tracker = ThresholdTracker::new();
    for (severity, ok) in [(100.0, true), (90.0, true), (80.0, false), (70.0, false)] {
        tracker.record(severity, ok);
    }
    assert_eq!(tracker.first_failure(), Some(80.0));
    assert_eq!(tracker.last_success(), Some(90.0));
}

#[test]
fn merge_scenario_keeps_every_decode_row() {
    let decode = DecodeTable {
        severity_column: "crop_ratio".into(),
        rows: vec![
            trial(None, "clean", true, true),
            trial(Some(0.4), "crop", true, true),
            trial(Some(0.5), "crop", false, true),
        ],
    };
    let scores = vec![
        ScoreRow {
            filename: "crop_ratio_0.40.png".into(),
            lpips_score: Some(0.12),
        },
        ScoreRow {
            filename: "crop_ratio_0.50.png".into(),
            lpips_score: Some(0.08),
        },
    ];
    let merged = merge(&decode, &scores, AttackKind::Crop, None);
    assert_eq!(merged.rows.len(), 3);
    assert_eq!(merged.rows[0].lpips_score, None);
    assert_eq!(merged.rows[1].lpips_score, Some(0.12));
    assert_eq!(merged.rows[2].lpips_score, Some(0.08));
}

#[test]
fn binary_merge_never_drops_rows() {
    let decode = DecodeTable {
        severity_column: "denoising".into(),
        rows: vec![
            trial(None, "clean", true, true),
            trial(None, "denoising", false, true),
        ],
    };
    let merged = merge(&decode, &[], AttackKind::Denoise, None);
    assert_eq!(merged.rows.len(), 2);
    assert!(merged.rows.iter().all(|r| r.lpips_score.is_none()));
}

#[test]
fn images_that_fail_clean_decode_are_excluded() {
    let table = |clean_ok: bool, lpips: f64| {
        let mut failed = trial(Some(50.0), "jpeg", false, clean_ok);
        failed.first_failure = Some(50.0);
        let decode = DecodeTable {
            severity_column: "jpeg_quality".into(),
            rows: vec![trial(None, "clean", clean_ok, clean_ok), failed],
        };
        let scores = vec![ScoreRow {
            filename: "jpeg_quality50.png".into(),
            lpips_score: Some(lpips),
        }];
        merge(&decode, &scores, AttackKind::Jpeg, None)
    };

    let tables = vec![table(true, 0.2), table(false, 0.9)];
    match aggregate(&tables, AttackKind::Jpeg, &RangeTable::resized()) {
        Aggregate::Stats(stat) => {
            assert_eq!(stat.image_count, 2);
            assert_eq!(stat.clean_decodable_count, 1);
            assert_eq!(stat.failure_count(), 1);
            assert!((stat.avg_lpips_at_failure() - 0.2).abs() < 1e-9);
        }
        other => panic!("expected stats, got {other:?}"),
    }

    let none = vec![table(false, 0.9)];
    assert!(matches!(
        aggregate(&none, AttackKind::Jpeg, &RangeTable::resized()),
        Aggregate::NoData { .. }
    ));
}
