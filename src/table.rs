//! CSV and JSON persistence of sweep, score and merged tables.
//!
//! Decode tables keep one row per tested severity plus a leading `clean` row.
//! Their first column is named after the attack's native unit and holds either
//! the severity or the literal `clean`. Booleans are written as `true`/`false`
//! and read case-insensitively, so tables written by other tooling
//! (`True`/`False`) load as well. Empty cells mean "no value".

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use serde::{Deserialize, Serialize};

use crate::attack::{AttackKind, CLEAN};
use crate::error::{Error, Result};

const DECODED: &str = "decoded";
const SUCCESS: &str = "success";
const ATTACK_TYPE: &str = "attack_type";
const CAN_DECODE_CLEAN: &str = "can_decode_clean";
const FIRST_FAILURE: &str = "first_failure";
const LAST_SUCCESS: &str = "last_success";
const THRESHOLD: &str = "threshold";
const LPIPS_SCORE: &str = "lpips_score";

/// One row of a per-image sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    /// Native severity; `None` for the clean row and binary attacks.
    pub severity: Option<f64>,
    /// Decoded payload, truncated.
    pub decoded: String,
    /// Whether the payload was recovered.
    pub success: bool,
    /// `clean` or the attack name.
    pub attack_type: String,
    /// Whether the unattacked watermarked image decoded.
    pub can_decode_clean: bool,
    /// Severity of the first failing trial so far.
    pub first_failure: Option<f64>,
    /// Severity of the most recent successful trial so far.
    pub last_success: Option<f64>,
}

impl TrialRecord {
    /// Whether this is the unattacked reference row.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.attack_type == CLEAN
    }
}

/// A decode table as written by a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeTable {
    /// Name of the native severity column.
    pub severity_column: String,
    /// Rows in sweep order, clean row first.
    pub rows: Vec<TrialRecord>,
}

/// A decode row joined with its perceptual distance.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRecord {
    /// The decode row. Graded severities are rounded to 3 decimals.
    pub trial: TrialRecord,
    /// Native severity under an attack-agnostic name.
    pub threshold: Option<f64>,
    /// Perceptual distance to the clean watermarked reference.
    pub lpips_score: Option<f64>,
}

/// A merged table for one (image, method, attack).
#[derive(Debug, Clone, PartialEq)]
pub struct MergedTable {
    /// Name of the native severity column.
    pub severity_column: String,
    /// Rows, clean row first.
    pub rows: Vec<MergedRecord>,
}

/// One perceptual score produced for a degraded image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    /// File name of the degraded image inside the sweep directory.
    pub filename: String,
    /// Distance to the reference; `None` when the scorer left it blank or invalid.
    #[serde(deserialize_with = "csv::invalid_option")]
    pub lpips_score: Option<f64>,
}

/// Degraded files of one sweep with their severities stored as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Attack that produced the files.
    pub attack: AttackKind,
    /// Watermarking method.
    pub method: String,
    /// File name of the clean watermarked reference.
    pub reference: String,
    /// Noise seed used by the sweep, if any.
    pub seed: Option<u64>,
    /// One entry per degraded file, in sweep order.
    pub entries: Vec<ManifestEntry>,
}

/// A degraded file and the severity that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File name inside the sweep directory.
    pub file_name: String,
    /// Native severity; `None` for binary attacks.
    pub severity: Option<f64>,
}

impl Manifest {
    /// Severity recorded for `file_name`.
    #[must_use]
    pub fn severity_of(&self, file_name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.file_name == file_name)
            .and_then(|e| e.severity)
    }

    /// Write as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or serialized.
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Read a manifest written by [`Manifest::write`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or parsed.
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

fn fmt_bool(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

/// Parse a numeric cell; empty, `nan` and non-numeric cells become `None`.
#[must_use]
pub fn parse_number(cell: &str) -> Option<f64> {
    cell.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a boolean cell (`true`/`false` in any case, or `1`/`0`).
#[must_use]
pub fn parse_bool(cell: &str) -> bool {
    let cell = cell.trim();
    cell.eq_ignore_ascii_case("true") || cell == "1" || cell == "1.0"
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Column positions of a decode-style table.
struct Columns {
    path: PathBuf,
    headers: StringRecord,
}

impl Columns {
    fn index(&self, name: &str) -> Result<usize> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| Error::MissingColumn {
                path: self.path.clone(),
                column: name.to_string(),
            })
    }

    fn optional(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

struct TrialColumns {
    decoded: usize,
    success: usize,
    attack_type: usize,
    can_decode_clean: usize,
    first_failure: Option<usize>,
    last_success: Option<usize>,
}

impl TrialColumns {
    fn locate(columns: &Columns) -> Result<Self> {
        Ok(Self {
            decoded: columns.index(DECODED)?,
            success: columns.index(SUCCESS)?,
            attack_type: columns.index(ATTACK_TYPE)?,
            can_decode_clean: columns.index(CAN_DECODE_CLEAN)?,
            first_failure: columns.optional(FIRST_FAILURE),
            last_success: columns.optional(LAST_SUCCESS),
        })
    }

    fn parse(&self, record: &StringRecord) -> TrialRecord {
        let cell = |i: usize| record.get(i).unwrap_or("");
        let attack_type = cell(self.attack_type).to_string();
        let severity = if attack_type == CLEAN {
            None
        } else {
            parse_number(cell(0))
        };
        TrialRecord {
            severity,
            decoded: cell(self.decoded).to_string(),
            success: parse_bool(cell(self.success)),
            attack_type,
            can_decode_clean: parse_bool(cell(self.can_decode_clean)),
            first_failure: self.first_failure.and_then(|i| parse_number(cell(i))),
            last_success: self.last_success.and_then(|i| parse_number(cell(i))),
        }
    }
}

fn trial_cells(row: &TrialRecord) -> [String; 7] {
    let severity = if row.is_clean() {
        CLEAN.to_string()
    } else {
        fmt_opt(row.severity)
    };
    [
        severity,
        row.decoded.clone(),
        fmt_bool(row.success).to_string(),
        row.attack_type.clone(),
        fmt_bool(row.can_decode_clean).to_string(),
        fmt_opt(row.first_failure),
        fmt_opt(row.last_success),
    ]
}

fn trial_header(severity_column: &str) -> [&str; 7] {
    [
        severity_column,
        DECODED,
        SUCCESS,
        ATTACK_TYPE,
        CAN_DECODE_CLEAN,
        FIRST_FAILURE,
        LAST_SUCCESS,
    ]
}

fn open_columns(path: &Path) -> Result<(csv::Reader<File>, Columns)> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    Ok((
        reader,
        Columns {
            path: path.to_path_buf(),
            headers,
        },
    ))
}

impl DecodeTable {
    /// Write the table as CSV, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(trial_header(&self.severity_column))?;
        for row in &self.rows {
            writer.write_record(trial_cells(row))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a decode table. The first column is taken as the severity column.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or lacks a required column.
    pub fn read_csv(path: &Path) -> Result<Self> {
        let (mut reader, columns) = open_columns(path)?;
        let severity_column = columns.headers.get(0).unwrap_or_default().to_string();
        let trial = TrialColumns::locate(&columns)?;
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(trial.parse(&record?));
        }
        Ok(Self {
            severity_column,
            rows,
        })
    }

    /// The clean row, if present.
    #[must_use]
    pub fn clean_row(&self) -> Option<&TrialRecord> {
        self.rows.iter().find(|r| r.is_clean())
    }
}

impl MergedTable {
    /// Write the table as CSV, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let mut writer = csv::Writer::from_path(path)?;
        let mut header: Vec<&str> = trial_header(&self.severity_column).to_vec();
        header.extend([THRESHOLD, LPIPS_SCORE]);
        writer.write_record(&header)?;
        for row in &self.rows {
            let mut cells = trial_cells(&row.trial).to_vec();
            cells.push(fmt_opt(row.threshold));
            cells.push(fmt_opt(row.lpips_score));
            writer.write_record(&cells)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a merged table.
    ///
    /// A missing `threshold` column reads as all-`None`; `lpips_score` is required.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or lacks a required column.
    pub fn read_csv(path: &Path) -> Result<Self> {
        let (mut reader, columns) = open_columns(path)?;
        let severity_column = columns.headers.get(0).unwrap_or_default().to_string();
        let trial = TrialColumns::locate(&columns)?;
        let threshold = columns.optional(THRESHOLD);
        let lpips = columns.index(LPIPS_SCORE)?;
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let cell = |i: usize| record.get(i).unwrap_or("");
            rows.push(MergedRecord {
                trial: trial.parse(&record),
                threshold: threshold.and_then(|i| parse_number(cell(i))),
                lpips_score: parse_number(cell(lpips)),
            });
        }
        Ok(Self {
            severity_column,
            rows,
        })
    }

    /// The clean row, if present.
    #[must_use]
    pub fn clean_row(&self) -> Option<&MergedRecord> {
        self.rows.iter().find(|r| r.trial.is_clean())
    }
}

/// Write perceptual scores as `filename,lpips_score`.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_scores(path: &Path, scores: &[ScoreRow]) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for row in scores {
        writer.serialize(row)?;
    }
    if scores.is_empty() {
        writer.write_record(["filename", LPIPS_SCORE])?;
    }
    writer.flush()?;
    Ok(())
}

/// Read perceptual scores written by [`write_scores`] or an external scorer.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a row is malformed.
pub fn read_scores(path: &Path) -> Result<Vec<ScoreRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}
