//! Experiment configuration.
//!
//! One JSON document describes a whole run: payload, watermarking methods,
//! attacks with their severity schedules, noise seed, and the normalization
//! ranges of every dataset variant. Every field has a default, so a partial
//! document (or none at all) is enough.
//!
//! ```no_run
//! use watermark_robustness::ExperimentConfig;
//! use std::path::Path;
//!
//! let config = ExperimentConfig::from_json_file(Path::new("experiment.json"))?;
//! let ranges = config.range_table()?;
//! # Ok::<(), watermark_robustness::Error>(())
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::attack::{Attack, AttackKind};
use crate::codec::{CodecRegistry, DEFAULT_KEY};
use crate::error::{Error, Result};
use crate::severity::RangeTable;
use crate::sweep::SeveritySchedule;

/// Payload embedded by default.
pub const DEFAULT_PAYLOAD: &str = "qingquan";

/// Dataset variant used by default.
pub const DEFAULT_VARIANT: &str = "resized";

/// One attack to run, optionally with its own schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackPlan {
    /// Attack family.
    pub attack: AttackKind,
    /// Severities mildest to harshest; the built-in schedule when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severities: Option<Vec<f64>>,
}

impl AttackPlan {
    /// Plan using the built-in schedule.
    #[must_use]
    pub fn default_for(attack: AttackKind) -> Self {
        Self {
            attack,
            severities: None,
        }
    }

    /// Validated schedule of this plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured severities are not in damage order.
    pub fn schedule(&self) -> Result<SeveritySchedule> {
        match &self.severities {
            Some(values) => SeveritySchedule::new(self.attack, values.clone()),
            None => Ok(SeveritySchedule::default_for(self.attack)),
        }
    }
}

/// Complete configuration of a robustness run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Payload text; 32-bit methods embed its first four characters.
    pub payload: String,
    /// Watermarking methods, by registry name.
    pub methods: Vec<String>,
    /// Attacks to sweep.
    pub attacks: Vec<AttackPlan>,
    /// Noise seed; a random one is drawn per sweep and logged when absent.
    pub seed: Option<u64>,
    /// Key of the built-in codecs.
    pub key: u64,
    /// Image blended in by the overlay attack; a built-in logo when absent.
    pub overlay_path: Option<PathBuf>,
    /// Dataset variant whose ranges normalize severities.
    pub variant: String,
    /// Normalization ranges per dataset variant.
    pub ranges: BTreeMap<String, RangeTable>,
    /// External perceptual scorer command; the built-in scorer when absent.
    pub scorer_command: Option<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let mut ranges = BTreeMap::new();
        ranges.insert("resized".to_string(), RangeTable::resized());
        ranges.insert("original".to_string(), RangeTable::original());
        Self {
            payload: DEFAULT_PAYLOAD.to_string(),
            methods: vec!["dctQim".to_string(), "dctQim32".to_string()],
            attacks: AttackKind::ALL.iter().copied().map(AttackPlan::default_for).collect(),
            seed: None,
            key: DEFAULT_KEY,
            overlay_path: None,
            variant: DEFAULT_VARIANT.to_string(),
            ranges,
            scorer_command: None,
        }
    }
}

impl ExperimentConfig {
    /// Load and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let file = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Check every value the run depends on.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: unknown or missing methods, a payload
    /// a method cannot carry, duplicate attacks, an unordered schedule, an
    /// invalid range, a mask range in percent units, or an unknown variant.
    pub fn validate(&self) -> Result<()> {
        if self.methods.is_empty() {
            return Err(Error::Config("no watermarking methods configured".to_string()));
        }
        let registry = self.registry();
        for method in &self.methods {
            registry.get(method)?.width().prepare(&self.payload)?;
        }

        let mut seen = BTreeSet::new();
        for plan in &self.attacks {
            if !seen.insert(plan.attack) {
                return Err(Error::Config(format!("attack {} listed twice", plan.attack)));
            }
            plan.schedule()?;
        }

        for (variant, table) in &self.ranges {
            table.validate()?;
            if let Some(mask) = table.get(AttackKind::Mask.name()) {
                if mask.max > 1.0 {
                    return Err(Error::Config(format!(
                        "mask range of variant {variant} must use fractions (0..1), got max {}",
                        mask.max
                    )));
                }
            }
        }
        self.range_table()?;
        Ok(())
    }

    /// Ranges of the configured variant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the variant has no range table.
    pub fn range_table(&self) -> Result<&RangeTable> {
        self.ranges_for(&self.variant)
    }

    /// Ranges of `variant`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the variant has no range table.
    pub fn ranges_for(&self, variant: &str) -> Result<&RangeTable> {
        self.ranges
            .get(variant)
            .ok_or_else(|| Error::Config(format!("no normalization ranges for variant {variant}")))
    }

    /// Codec registry with the built-in methods keyed by [`ExperimentConfig::key`].
    #[must_use]
    pub fn registry(&self) -> CodecRegistry {
        CodecRegistry::with_builtin(self.key)
    }

    /// Load the configured overlay image, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageLoad`] if a configured overlay cannot be read.
    pub fn overlay(&self) -> Result<Option<RgbImage>> {
        self.overlay_path
            .as_deref()
            .map(|path| {
                image::open(path)
                    .map(|img| img.to_rgb8())
                    .map_err(|source| Error::ImageLoad {
                        path: path.to_path_buf(),
                        source,
                    })
            })
            .transpose()
    }

    /// Build the attack for `kind`, resolving the noise seed.
    ///
    /// A missing seed is drawn at random and logged so the sweep can be rerun.
    #[must_use]
    pub fn attack(&self, kind: AttackKind, overlay: Option<&RgbImage>) -> Attack {
        let seed = self.seed.unwrap_or_else(|| {
            let seed = rand::random::<u64>();
            if kind == AttackKind::Noise {
                log::info!("noise seed not configured, using {seed}");
            }
            seed
        });
        let attack = Attack::new(kind).with_seed(seed);
        match overlay {
            Some(img) if kind == AttackKind::Overlay => attack.with_overlay(img.clone()),
            _ => attack,
        }
    }

    /// Keep only the listed attacks, in the listed order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAttack`] for an unknown name.
    pub fn restrict_attacks(&mut self, names: &[String]) -> Result<()> {
        let mut plans = Vec::new();
        for name in names {
            let kind: AttackKind = name.parse()?;
            let plan = self
                .attacks
                .iter()
                .find(|p| p.attack == kind)
                .cloned()
                .unwrap_or_else(|| AttackPlan::default_for(kind));
            plans.push(plan);
        }
        self.attacks = plans;
        Ok(())
    }
}
