//! Aggregation of merged tables into per-(attack, method) statistics, and the
//! CSV / Markdown / LaTeX renderings of those statistics.
//!
//! Only images whose clean watermarked copy decoded take part. For each such
//! image the first row carrying a `first_failure` gives the native threshold
//! and the perceptual distance at failure (binary attacks: the first failing
//! attack row). Spreads are population standard deviations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::attack::AttackKind;
use crate::error::Result;
use crate::layout::{merged_image_name, Layout};
use crate::merge::round3;
use crate::severity::{RangeTable, SeverityRange};
use crate::table::MergedTable;

/// Rendering of a value that does not apply.
pub const NOT_APPLICABLE: &str = "--";

/// Descriptive statistics of a non-empty sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    /// Sample size.
    pub count: usize,
    /// Arithmetic mean.
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    /// Median.
    pub median: f64,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
}

impl Summary {
    /// Statistics of `values`, or `None` when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(Self {
            count: values.len(),
            mean,
            std: var.sqrt(),
            median,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
        })
    }
}

/// Where one image first stopped decoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailurePoint {
    /// Native severity of the failure; `None` for binary attacks.
    pub threshold: Option<f64>,
    /// Perceptual distance at the failure.
    pub lpips: f64,
}

/// Statistics for one (attack, method) with at least one failure.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateStat {
    /// Native thresholds at failure; `None` for binary attacks.
    pub threshold: Option<Summary>,
    /// Semantic severities at failure; `None` without a normalization range.
    pub normalized_threshold: Option<Summary>,
    /// Perceptual distances at failure.
    pub lpips: Summary,
    /// Merged tables read.
    pub image_count: usize,
    /// Tables whose clean copy decoded.
    pub clean_decodable_count: usize,
    /// Thresholds that fell outside the normalization range and were clamped.
    pub clamped_count: usize,
}

impl AggregateStat {
    /// Mean native threshold at failure.
    #[must_use]
    pub fn avg_threshold(&self) -> Option<f64> {
        self.threshold.map(|s| s.mean)
    }

    /// Population std of the native threshold at failure.
    #[must_use]
    pub fn std_threshold(&self) -> Option<f64> {
        self.threshold.map(|s| s.std)
    }

    /// Mean perceptual distance at failure.
    #[must_use]
    pub fn avg_lpips_at_failure(&self) -> f64 {
        self.lpips.mean
    }

    /// Population std of the perceptual distance at failure.
    #[must_use]
    pub fn std_lpips_at_failure(&self) -> f64 {
        self.lpips.std
    }

    /// Images contributing a failure point.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.lpips.count
    }
}

/// Outcome of aggregating one (attack, method).
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    /// No image decoded cleanly; the method does not apply to this corpus.
    NoData {
        /// Merged tables read.
        image_count: usize,
    },
    /// Images decoded cleanly but none failed within the tested range.
    NoFailures {
        /// Merged tables read.
        image_count: usize,
        /// Tables whose clean copy decoded.
        clean_decodable_count: usize,
    },
    /// At least one failure point.
    Stats(AggregateStat),
}

impl Aggregate {
    /// Short machine-readable tag.
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self {
            Aggregate::NoData { .. } => "no_data",
            Aggregate::NoFailures { .. } => "no_failures",
            Aggregate::Stats(_) => "stats",
        }
    }

    /// The statistics, if any.
    #[must_use]
    pub fn stats(&self) -> Option<&AggregateStat> {
        match self {
            Aggregate::Stats(stat) => Some(stat),
            _ => None,
        }
    }

    /// Merged tables read.
    #[must_use]
    pub fn image_count(&self) -> usize {
        match self {
            Aggregate::NoData { image_count } | Aggregate::NoFailures { image_count, .. } => {
                *image_count
            }
            Aggregate::Stats(stat) => stat.image_count,
        }
    }

    /// Tables whose clean copy decoded.
    #[must_use]
    pub fn clean_decodable_count(&self) -> usize {
        match self {
            Aggregate::NoData { .. } => 0,
            Aggregate::NoFailures {
                clean_decodable_count,
                ..
            } => *clean_decodable_count,
            Aggregate::Stats(stat) => stat.clean_decodable_count,
        }
    }
}

/// Whether the table's clean row exists and decoded.
#[must_use]
pub fn is_clean_decodable(table: &MergedTable) -> bool {
    table.clean_row().is_some_and(|r| r.trial.can_decode_clean)
}

/// First failure point of one clean-decodable table.
///
/// Returns `None` for tables that are not clean-decodable, never failed, or
/// whose failing row lacks a threshold or a score.
#[must_use]
pub fn first_failure(table: &MergedTable, attack: AttackKind) -> Option<FailurePoint> {
    if !is_clean_decodable(table) {
        return None;
    }
    if attack.is_binary() {
        let row = table
            .rows
            .iter()
            .find(|r| !r.trial.is_clean() && !r.trial.success)?;
        return Some(FailurePoint {
            threshold: None,
            lpips: row.lpips_score?,
        });
    }
    let row = table.rows.iter().find(|r| r.trial.first_failure.is_some())?;
    Some(FailurePoint {
        threshold: Some(row.threshold?),
        lpips: row.lpips_score?,
    })
}

/// Aggregate the merged tables of one (attack, method).
#[must_use]
pub fn aggregate(tables: &[MergedTable], attack: AttackKind, ranges: &RangeTable) -> Aggregate {
    let image_count = tables.len();
    let clean_decodable_count = tables.iter().filter(|t| is_clean_decodable(t)).count();
    if clean_decodable_count == 0 {
        return Aggregate::NoData { image_count };
    }

    let points: Vec<FailurePoint> = tables.iter().filter_map(|t| first_failure(t, attack)).collect();
    if points.is_empty() {
        return Aggregate::NoFailures {
            image_count,
            clean_decodable_count,
        };
    }

    let thresholds: Vec<f64> = points.iter().filter_map(|p| p.threshold).collect();
    let lpips: Vec<f64> = points.iter().map(|p| p.lpips).collect();
    let range = ranges.get(attack.name());
    let normalized: Vec<f64> = range
        .map(|r| thresholds.iter().map(|&t| r.normalize(t)).collect())
        .unwrap_or_default();
    let clamped_count = range.map_or(0, |r| thresholds.iter().filter(|&&t| r.is_clamped(t)).count());
    if clamped_count > 0 {
        log::warn!("{attack}: {clamped_count} failure threshold(s) outside the normalization range were clamped");
    }

    match Summary::of(&lpips) {
        Some(lpips) => Aggregate::Stats(AggregateStat {
            threshold: Summary::of(&thresholds),
            normalized_threshold: Summary::of(&normalized),
            lpips,
            image_count,
            clean_decodable_count,
            clamped_count,
        }),
        None => Aggregate::NoFailures {
            image_count,
            clean_decodable_count,
        },
    }
}

/// Semantic severity of every row: 0 for the clean row, `None` when the row
/// has no threshold or the attack has no range.
#[must_use]
pub fn normalize_records(table: &MergedTable, attack: AttackKind, ranges: &RangeTable) -> Vec<Option<f64>> {
    table
        .rows
        .iter()
        .map(|r| {
            if r.trial.is_clean() {
                Some(0.0)
            } else {
                r.threshold.and_then(|t| ranges.normalize(attack.name(), t))
            }
        })
        .collect()
}

/// One line of the summary tables.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    /// Attack.
    pub attack: AttackKind,
    /// Watermarking method.
    pub method: String,
    /// The aggregate.
    pub aggregate: Aggregate,
}

/// One image's failure point, for the per-image table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageFailureRow {
    /// Attack name.
    pub attack: String,
    /// Watermarking method.
    pub method: String,
    /// Image name.
    pub image: String,
    /// `excluded`, `no_failure` or `failed`.
    pub status: &'static str,
    /// Native threshold at failure.
    pub threshold: Option<f64>,
    /// Semantic severity at failure.
    pub semantic_severity: Option<f64>,
    /// Perceptual distance at failure.
    pub lpips_score: Option<f64>,
}

/// Average perceptual distance at one native severity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeverityLpipsRow {
    /// Attack name.
    pub attack: String,
    /// Watermarking method.
    pub method: String,
    /// Native severity.
    pub threshold: f64,
    /// Severity scaled over the observed range.
    pub semantic_severity: f64,
    /// Mean distance across images.
    pub avg_lpips: f64,
    /// Images averaged.
    pub count: usize,
}

/// Per-image failure rows for one (attack, method).
#[must_use]
pub fn image_failures(
    tables: &[(String, MergedTable)],
    attack: AttackKind,
    method: &str,
    ranges: &RangeTable,
) -> Vec<ImageFailureRow> {
    tables
        .iter()
        .map(|(image, table)| {
            let point = first_failure(table, attack);
            let status = if !is_clean_decodable(table) {
                "excluded"
            } else if point.is_some() {
                "failed"
            } else {
                "no_failure"
            };
            let threshold = point.and_then(|p| p.threshold);
            ImageFailureRow {
                attack: attack.name().to_string(),
                method: method.to_string(),
                image: image.clone(),
                status,
                threshold,
                semantic_severity: threshold.and_then(|t| ranges.normalize(attack.name(), t)),
                lpips_score: point.map(|p| p.lpips),
            }
        })
        .collect()
}

/// Average distance per native severity, scaled over the observed severities.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn lpips_by_severity(tables: &[MergedTable], attack: AttackKind, method: &str) -> Vec<SeverityLpipsRow> {
    if attack.is_binary() {
        return Vec::new();
    }
    let mut groups: BTreeMap<i64, (f64, Vec<f64>)> = BTreeMap::new();
    for table in tables {
        for row in table.rows.iter().filter(|r| !r.trial.is_clean()) {
            if let (Some(t), Some(score)) = (row.threshold, row.lpips_score) {
                #[allow(clippy::cast_possible_truncation)]
                let key = (t * 1000.0).round() as i64;
                groups.entry(key).or_insert_with(|| (t, Vec::new())).1.push(score);
            }
        }
    }
    let observed: Vec<f64> = groups.values().map(|(t, _)| *t).collect();
    let Some(range) = SeverityRange::observed(attack, &observed) else {
        return Vec::new();
    };
    groups
        .into_values()
        .map(|(threshold, scores)| SeverityLpipsRow {
            attack: attack.name().to_string(),
            method: method.to_string(),
            threshold,
            semantic_severity: round3(range.normalize(threshold)),
            avg_lpips: scores.iter().sum::<f64>() / scores.len() as f64,
            count: scores.len(),
        })
        .collect()
}

/// Merged tables of one method directory as `(image, table)`, sorted by image.
///
/// Unreadable tables are logged and skipped.
#[must_use]
pub fn load_merged_dir(dir: &Path) -> Vec<(String, MergedTable)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<(String, PathBuf)> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter_map(|p| merged_image_name(&p).map(|image| (image, p)))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|(image, path)| match MergedTable::read_csv(&path) {
            Ok(table) => Some((image, table)),
            Err(e) => {
                log::warn!("skipping {}: {e}", path.display());
                None
            }
        })
        .collect()
}

/// Everything `summarize_tree` computed for one dataset variant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    /// One row per (attack, method) found, sorted by attack then method.
    pub rows: Vec<SummaryRow>,
    /// Per-image failure points.
    pub images: Vec<ImageFailureRow>,
    /// Average distance per severity.
    pub severities: Vec<SeverityLpipsRow>,
}

/// Aggregate every (attack, method) in the merged tree of `variant`.
#[must_use]
pub fn build_report(layout: &Layout, variant: &str, methods: &[String], ranges: &RangeTable) -> Report {
    let mut attacks = AttackKind::ALL.to_vec();
    attacks.sort_by_key(|a| a.name());

    let mut report = Report::default();
    for attack in attacks {
        for method in methods {
            let dir = layout.merged_method_dir(attack, variant, method);
            if !dir.is_dir() {
                continue;
            }
            let named = load_merged_dir(&dir);
            let tables: Vec<MergedTable> = named.iter().map(|(_, t)| t.clone()).collect();
            report.images.extend(image_failures(&named, attack, method, ranges));
            report.severities.extend(lpips_by_severity(&tables, attack, method));
            report.rows.push(SummaryRow {
                attack,
                method: method.clone(),
                aggregate: aggregate(&tables, attack, ranges),
            });
        }
    }
    report
}

/// Aggregate the merged tree of `variant` and write every summary artifact
/// into the variant's summary directory.
///
/// # Errors
///
/// Returns an error if an output file cannot be written.
pub fn summarize_tree(layout: &Layout, variant: &str, methods: &[String], ranges: &RangeTable) -> Result<Report> {
    let report = build_report(layout, variant, methods, ranges);
    if report.rows.is_empty() {
        log::warn!("no merged tables for variant {variant} under {}", layout.merged_root().display());
    }

    let out = layout.summary_dir(variant);
    std::fs::create_dir_all(&out)?;
    write_summary_csv(&out.join("decode_lpips_summary.csv"), &report.rows)?;
    std::fs::write(out.join("decode_lpips_summary.md"), render_markdown(&report.rows))?;
    std::fs::write(
        out.join("decode_lpips_latex_table.tex"),
        render_latex(&report.rows, methods),
    )?;
    write_serialized(&out.join("first_failures.csv"), &report.images)?;
    write_serialized(&out.join("lpips_by_severity.csv"), &report.severities)?;
    log::info!("saved summary for {variant} to {}", out.display());
    Ok(report)
}

fn write_serialized<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn fmt_value(v: Option<f64>) -> String {
    v.map_or_else(|| NOT_APPLICABLE.to_string(), |x| round3(x).to_string())
}

fn fmt_pm(s: Option<Summary>) -> String {
    match s {
        Some(s) => format!("{} ± {}", round3(s.mean), round3(s.std)),
        None => NOT_APPLICABLE.to_string(),
    }
}

const SUMMARY_HEADER: [&str; 16] = [
    "attack",
    "method",
    "status",
    "images",
    "clean_decodable",
    "failures",
    "avg_threshold",
    "std_threshold",
    "avg_norm_threshold",
    "std_norm_threshold",
    "avg_lpips",
    "std_lpips",
    "median_lpips",
    "min_lpips",
    "max_lpips",
    "clamped",
];

fn write_summary_csv(path: &Path, rows: &[SummaryRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(SUMMARY_HEADER)?;
    for row in rows {
        let stat = row.aggregate.stats();
        let lpips = stat.map(|s| s.lpips);
        let norm = stat.and_then(|s| s.normalized_threshold);
        writer.write_record([
            row.attack.name().to_string(),
            row.method.clone(),
            row.aggregate.status().to_string(),
            row.aggregate.image_count().to_string(),
            row.aggregate.clean_decodable_count().to_string(),
            stat.map_or(0, AggregateStat::failure_count).to_string(),
            fmt_value(stat.and_then(AggregateStat::avg_threshold)),
            fmt_value(stat.and_then(AggregateStat::std_threshold)),
            fmt_value(norm.map(|s| s.mean)),
            fmt_value(norm.map(|s| s.std)),
            fmt_value(lpips.map(|s| s.mean)),
            fmt_value(lpips.map(|s| s.std)),
            fmt_value(lpips.map(|s| s.median)),
            fmt_value(lpips.map(|s| s.min)),
            fmt_value(lpips.map(|s| s.max)),
            stat.map_or(0, |s| s.clamped_count).to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Markdown table with one row per (attack, method).
#[must_use]
pub fn render_markdown(rows: &[SummaryRow]) -> String {
    let mut out = String::from(
        "| Attack | Method | Images | Clean | Failures | Threshold | Norm Threshold | LPIPS at Failure |\n\
         |--------|--------|--------|-------|----------|-----------|----------------|------------------|\n",
    );
    for row in rows {
        let (threshold, norm, lpips, failures) = match &row.aggregate {
            Aggregate::Stats(s) => (
                fmt_pm(s.threshold),
                fmt_pm(s.normalized_threshold),
                fmt_pm(Some(s.lpips)),
                s.failure_count().to_string(),
            ),
            Aggregate::NoFailures { .. } => (
                "no failure".to_string(),
                "no failure".to_string(),
                NOT_APPLICABLE.to_string(),
                "0".to_string(),
            ),
            Aggregate::NoData { .. } => (
                NOT_APPLICABLE.to_string(),
                NOT_APPLICABLE.to_string(),
                NOT_APPLICABLE.to_string(),
                NOT_APPLICABLE.to_string(),
            ),
        };
        out.push_str(&format!(
            "| {} | {} | {} | {} | {failures} | {threshold} | {norm} | {lpips} |\n",
            row.attack,
            row.method,
            row.aggregate.image_count(),
            row.aggregate.clean_decodable_count(),
        ));
    }
    out
}

fn latex_escape(s: &str) -> String {
    s.replace('_', "\\_")
}

/// LaTeX table with one column per method and two lines per attack.
#[must_use]
pub fn render_latex(rows: &[SummaryRow], methods: &[String]) -> String {
    let mut lines = vec![
        "\\begin{table}[ht]".to_string(),
        "\\centering".to_string(),
        "\\caption{Average Semantic Thresholds and LPIPS Scores ($\\pm$ std) at First Decode Failure}"
            .to_string(),
        "\\label{tab:avg_normalized_threshold_lpips}".to_string(),
        "\\renewcommand{\\arraystretch}{1.2}".to_string(),
        format!("\\begin{{tabular}}{{|l|{}}}", "c|".repeat(methods.len())),
        "\\hline".to_string(),
    ];
    let header: Vec<String> = std::iter::once("\\textbf{Attack Type}".to_string())
        .chain(methods.iter().map(|m| format!("\\textbf{{{}}}", latex_escape(m))))
        .collect();
    lines.push(format!("{} \\\\", header.join(" & ")));
    lines.push("\\hline".to_string());

    let mut attacks: Vec<AttackKind> = rows.iter().map(|r| r.attack).collect();
    attacks.dedup();
    for attack in attacks {
        let mut thresh = vec![latex_escape(attack.name())];
        let mut lpips = vec![String::new()];
        for method in methods {
            let stat = rows
                .iter()
                .find(|r| r.attack == attack && &r.method == method)
                .map(|r| &r.aggregate);
            match stat {
                Some(Aggregate::Stats(s)) => {
                    thresh.push(match s.normalized_threshold {
                        Some(n) => format!("Threshold: {} $\\pm$ {}", round3(n.mean), round3(n.std)),
                        None => NOT_APPLICABLE.to_string(),
                    });
                    lpips.push(format!(
                        "LPIPS: {} $\\pm$ {}",
                        round3(s.lpips.mean),
                        round3(s.lpips.std)
                    ));
                }
                Some(Aggregate::NoFailures { .. }) => {
                    thresh.push("no failure".to_string());
                    lpips.push(NOT_APPLICABLE.to_string());
                }
                Some(Aggregate::NoData { .. }) | None => {
                    thresh.push(NOT_APPLICABLE.to_string());
                    lpips.push(NOT_APPLICABLE.to_string());
                }
            }
        }
        lines.push(format!("{} \\\\", thresh.join(" & ")));
        lines.push(format!("{} \\\\", lpips.join(" & ")));
        lines.push("\\hline".to_string());
    }
    lines.push("\\end{tabular}".to_string());
    lines.push("\\end{table}".to_string());
    lines.join("\n")
}

/// Change in mean and std between two dataset variants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delta {
    /// `other.mean - base.mean`.
    pub mean: f64,
    /// `other.std - base.std`.
    pub std: f64,
}

impl Delta {
    fn between(base: Option<Summary>, other: Option<Summary>) -> Option<Self> {
        let (b, o) = (base?, other?);
        Some(Self {
            mean: o.mean - b.mean,
            std: o.std - b.std,
        })
    }
}

/// Difference between two variants for one (attack, method).
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonRow {
    /// Attack.
    pub attack: AttackKind,
    /// Watermarking method.
    pub method: String,
    /// Change in normalized threshold at failure.
    pub threshold: Option<Delta>,
    /// Change in perceptual distance at failure.
    pub lpips: Option<Delta>,
}

/// Pair up (attack, method) rows present in both variants and compute deltas.
#[must_use]
pub fn compare_variants(base: &[SummaryRow], other: &[SummaryRow]) -> Vec<ComparisonRow> {
    base.iter()
        .filter_map(|b| {
            let o = other.iter().find(|o| o.attack == b.attack && o.method == b.method)?;
            let bs = b.aggregate.stats();
            let os = o.aggregate.stats();
            Some(ComparisonRow {
                attack: b.attack,
                method: b.method.clone(),
                threshold: Delta::between(
                    bs.and_then(|s| s.normalized_threshold),
                    os.and_then(|s| s.normalized_threshold),
                ),
                lpips: Delta::between(bs.map(|s| s.lpips), os.map(|s| s.lpips)),
            })
        })
        .collect()
}

/// Markdown rendering of [`compare_variants`].
#[must_use]
pub fn render_comparison(rows: &[ComparisonRow], base: &str, other: &str) -> String {
    let fmt = |d: Option<Delta>| match d {
        Some(d) => format!("{} ± {}", round3(d.mean), round3(d.std)),
        None => NOT_APPLICABLE.to_string(),
    };
    let mut out = format!(
        "Change from `{base}` to `{other}`.\n\n\
         | Attack | Method | Δ Threshold | Δ LPIPS at Failure |\n\
         |--------|--------|-------------|--------------------|\n"
    );
    for row in rows {
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            row.attack,
            row.method,
            fmt(row.threshold),
            fmt(row.lpips)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{MergedRecord, TrialRecord};

    fn record(severity: Option<f64>, success: bool, ff: Option<f64>, lpips: Option<f64>, clean_ok: bool) -> MergedRecord {
        let attack_type = if severity.is_none() { "clean" } else { "jpeg" };
        MergedRecord {
            trial: TrialRecord {
                severity,
                decoded: String::new(),
                success,
                attack_type: attack_type.into(),
                can_decode_clean: clean_ok,
                first_failure: ff,
                last_success: None,
            },
            threshold: severity,
            lpips_score: lpips,
        }
    }

    fn jpeg_table(clean_ok: bool, fail_at: Option<f64>, lpips: f64) -> MergedTable {
        let mut rows = vec![record(None, clean_ok, None, None, clean_ok)];
        for q in [100.0, 90.0, 80.0, 70.0] {
            let failed = fail_at.is_some_and(|f| q <= f);
            rows.push(record(Some(q), !failed, fail_at.filter(|_| failed), Some(lpips + (100.0 - q) / 100.0), clean_ok));
        }
        MergedTable {
            severity_column: "jpeg_quality".into(),
            rows,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn summary_uses_population_std() {
        let s = Summary::of(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(close(s.mean, 2.5));
        assert!(close(s.std, 1.25f64.sqrt()));
        assert!(close(s.median, 2.5));
        assert_eq!((s.min, s.max, s.count), (1.0, 4.0, 4));
        assert!(Summary::of(&[]).is_none());
    }

    #[test]
    fn aggregate_takes_first_failure_per_image() {
        let tables = vec![jpeg_table(true, Some(80.0), 0.1), jpeg_table(true, Some(90.0), 0.3)];
        let agg = aggregate(&tables, AttackKind::Jpeg, &RangeTable::resized());
        let stat = agg.stats().unwrap();
        assert!(close(stat.avg_threshold().unwrap(), 85.0));
        assert!(close(stat.std_threshold().unwrap(), 5.0));
        // lpips at 80 = 0.1 + 0.2, at 90 = 0.3 + 0.1
        assert!(close(stat.avg_lpips_at_failure(), 0.35));
        assert!(close(stat.std_lpips_at_failure(), 0.05));
        assert_eq!(stat.failure_count(), 2);
        assert_eq!(stat.clean_decodable_count, 2);
        let norm = stat.normalized_threshold.unwrap();
        assert!(close(norm.mean, 1.0 - 75.0 / 90.0));
    }

    #[test]
    fn images_without_clean_decode_are_excluded() {
        let tables = vec![jpeg_table(true, Some(80.0), 0.1), jpeg_table(false, Some(100.0), 0.9)];
        let stat = aggregate(&tables, AttackKind::Jpeg, &RangeTable::resized());
        let stat = stat.stats().unwrap();
        assert_eq!(stat.failure_count(), 1);
        assert_eq!(stat.image_count, 2);
        assert!(close(stat.avg_threshold().unwrap(), 80.0));
    }

    #[test]
    fn no_data_and_no_failures_are_distinct() {
        let none_clean = vec![jpeg_table(false, Some(80.0), 0.1)];
        assert_eq!(
            aggregate(&none_clean, AttackKind::Jpeg, &RangeTable::resized()),
            Aggregate::NoData { image_count: 1 }
        );
        let survivors = vec![jpeg_table(true, None, 0.1)];
        assert_eq!(
            aggregate(&survivors, AttackKind::Jpeg, &RangeTable::resized()),
            Aggregate::NoFailures {
                image_count: 1,
                clean_decodable_count: 1
            }
        );
        assert_eq!(aggregate(&[], AttackKind::Jpeg, &RangeTable::resized()).status(), "no_data");
    }

    #[test]
    fn failures_without_score_do_not_count() {
        let mut table = jpeg_table(true, Some(80.0), 0.1);
        for row in &mut table.rows {
            row.lpips_score = None;
        }
        let agg = aggregate(&[table], AttackKind::Jpeg, &RangeTable::resized());
        assert_eq!(agg.status(), "no_failures");
    }

    #[test]
    fn clamped_thresholds_are_counted() {
        let tables = vec![jpeg_table(true, Some(70.0), 0.1)];
        let mut ranges = RangeTable::new();
        ranges.insert("jpeg", SeverityRange::new("jpeg", 80.0, 100.0, true).unwrap());
        let stat = aggregate(&tables, AttackKind::Jpeg, &ranges);
        let stat = stat.stats().unwrap();
        assert_eq!(stat.clamped_count, 1);
        assert!(close(stat.normalized_threshold.unwrap().mean, 1.0));
    }

    #[test]
    fn binary_attack_uses_first_failing_row() {
        let table = MergedTable {
            severity_column: "upscale".into(),
            rows: vec![
                MergedRecord {
                    trial: TrialRecord {
                        severity: None,
                        decoded: "qingquan".into(),
                        success: true,
                        attack_type: "clean".into(),
                        can_decode_clean: true,
                        first_failure: None,
                        last_success: None,
                    },
                    threshold: None,
                    lpips_score: None,
                },
                MergedRecord {
                    trial: TrialRecord {
                        severity: None,
                        decoded: "xx".into(),
                        success: false,
                        attack_type: "upscale".into(),
                        can_decode_clean: true,
                        first_failure: None,
                        last_success: None,
                    },
                    threshold: None,
                    lpips_score: Some(0.2),
                },
            ],
        };
        let agg = aggregate(&[table], AttackKind::Upscale, &RangeTable::resized());
        let stat = agg.stats().unwrap();
        assert_eq!(stat.threshold, None);
        assert_eq!(stat.normalized_threshold, None);
        assert!(close(stat.avg_lpips_at_failure(), 0.2));
    }

    #[test]
    fn records_normalize_with_clean_at_zero() {
        let table = jpeg_table(true, Some(80.0), 0.1);
        let norm = normalize_records(&table, AttackKind::Jpeg, &RangeTable::resized());
        assert_eq!(norm[0], Some(0.0));
        assert!(close(norm[1].unwrap(), 0.0));
        assert!(close(norm[4].unwrap(), 1.0 - 60.0 / 90.0));
    }

    #[test]
    fn lpips_by_severity_averages_across_images() {
        let tables = vec![jpeg_table(true, Some(80.0), 0.1), jpeg_table(true, Some(80.0), 0.3)];
        let rows = lpips_by_severity(&tables, AttackKind::Jpeg, "dctQim");
        assert_eq!(rows.len(), 4);
        let at_70 = rows.iter().find(|r| close(r.threshold, 70.0)).unwrap();
        assert!(close(at_70.avg_lpips, 0.5));
        assert_eq!(at_70.count, 2);
        assert!(close(at_70.semantic_severity, 1.0));
        let at_100 = rows.iter().find(|r| close(r.threshold, 100.0)).unwrap();
        assert!(close(at_100.semantic_severity, 0.0));
    }

    #[test]
    fn renderings_mark_missing_values() {
        let rows = vec![
            SummaryRow {
                attack: AttackKind::Jpeg,
                method: "dctQim".into(),
                aggregate: aggregate(&[jpeg_table(true, Some(80.0), 0.1)], AttackKind::Jpeg, &RangeTable::resized()),
            },
            SummaryRow {
                attack: AttackKind::Jpeg,
                method: "dctQim32".into(),
                aggregate: Aggregate::NoData { image_count: 3 },
            },
        ];
        let md = render_markdown(&rows);
        assert!(md.contains("| jpeg | dctQim | 1 | 1 | 1 | 80 ± 0 |"));
        assert!(md.contains("| jpeg | dctQim32 | 3 | 0 | -- | -- | -- | -- |"));

        let tex = render_latex(&rows, &["dctQim".to_string(), "dctQim32".to_string()]);
        assert!(tex.contains("\\begin{tabular}{|l|c|c|}"));
        assert!(tex.contains("jpeg & Threshold: 0.222 $\\pm$ 0 & -- \\\\"));
        assert!(tex.ends_with("\\end{table}"));
    }

    #[test]
    fn comparison_reports_deltas() {
        let base = vec![SummaryRow {
            attack: AttackKind::Jpeg,
            method: "dctQim".into(),
            aggregate: aggregate(&[jpeg_table(true, Some(80.0), 0.1)], AttackKind::Jpeg, &RangeTable::resized()),
        }];
        let other = vec![SummaryRow {
            attack: AttackKind::Jpeg,
            method: "dctQim".into(),
            aggregate: aggregate(&[jpeg_table(true, Some(90.0), 0.1)], AttackKind::Jpeg, &RangeTable::resized()),
        }];
        let rows = compare_variants(&base, &other);
        assert_eq!(rows.len(), 1);
        let delta = rows[0].threshold.unwrap();
        assert!(close(delta.mean, -10.0 / 90.0));
        let md = render_comparison(&rows, "resized", "original");
        assert!(md.contains("| jpeg | dctQim | -0.111 ± 0 |"));
    }
}
