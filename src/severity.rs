//! Mapping native attack severities onto a common `[0, 1]` scale.
//!
//! Each attack measures its strength in its own unit (JPEG quality, crop ratio,
//! noise sigma, degrees). A [`SeverityRange`] fixes the span of that unit that
//! counts as "no damage" to "maximum tested damage", and whether the native
//! scale runs backwards. [`RangeTable`] keys ranges by attack name, one table per
//! dataset variant.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attack::{AttackKind, Polarity};
use crate::error::{Error, Result};

/// Normalization span of one attack's native unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityRange {
    /// Native value mapped to 0 (or 1 when reversed).
    pub min: f64,
    /// Native value mapped to 1 (or 0 when reversed).
    pub max: f64,
    /// Whether damage grows as the native value shrinks.
    pub reversed: bool,
}

impl SeverityRange {
    /// Create a validated range with `min < max`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRange`] if a bound is not finite or `min >= max`.
    pub fn new(attack: &str, min: f64, max: f64, reversed: bool) -> Result<Self> {
        let range = Self { min, max, reversed };
        range.validate(attack)?;
        Ok(range)
    }

    /// Range spanning the observed values, oriented by the attack's polarity.
    ///
    /// The range may be degenerate (a single observed value); [`normalize`]
    /// then maps everything to 0. Returns `None` for an empty or non-finite set.
    ///
    /// [`normalize`]: SeverityRange::normalize
    #[must_use]
    pub fn observed(kind: AttackKind, values: &[f64]) -> Option<Self> {
        let finite = values.iter().copied().filter(|v| v.is_finite());
        let (min, max) = finite.fold(None, |acc: Option<(f64, f64)>, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })?;
        Some(Self {
            min,
            max,
            reversed: kind.polarity() == Polarity::LowerIsMoreSevere,
        })
    }

    /// Check that the range is usable for a configured table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRange`] if a bound is not finite or `min >= max`.
    pub fn validate(&self, attack: &str) -> Result<()> {
        if self.min.is_finite() && self.max.is_finite() && self.min < self.max {
            Ok(())
        } else {
            Err(Error::InvalidRange {
                attack: attack.to_string(),
                min: self.min,
                max: self.max,
            })
        }
    }

    /// Scale `value` into `[0, 1]` without the reversal flip.
    #[must_use]
    pub fn scale(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if span == 0.0 {
            return 0.0;
        }
        ((value - self.min) / span).clamp(0.0, 1.0)
    }

    /// Semantic severity of `value`: 0 means undamaged, 1 the harshest tested.
    ///
    /// Out-of-range values are clamped. A degenerate range maps every value to 0.
    #[must_use]
    pub fn normalize(&self, value: f64) -> f64 {
        if self.max == self.min {
            return 0.0;
        }
        let v = self.scale(value);
        if self.reversed {
            1.0 - v
        } else {
            v
        }
    }

    /// Whether [`normalize`](SeverityRange::normalize) had to clamp `value`.
    #[must_use]
    pub fn is_clamped(&self, value: f64) -> bool {
        value < self.min || value > self.max
    }
}

/// Normalization ranges keyed by attack name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeTable {
    ranges: BTreeMap<String, SeverityRange>,
}

impl RangeTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the range for `attack`.
    pub fn insert(&mut self, attack: impl Into<String>, range: SeverityRange) {
        self.ranges.insert(attack.into(), range);
    }

    /// Range for `attack`, if configured.
    #[must_use]
    pub fn get(&self, attack: &str) -> Option<&SeverityRange> {
        self.ranges.get(attack)
    }

    /// Iterate over `(attack, range)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SeverityRange)> {
        self.ranges.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Semantic severity of `value` for `attack`, or `None` if the attack has no range.
    #[must_use]
    pub fn normalize(&self, attack: &str, value: f64) -> Option<f64> {
        self.get(attack).map(|r| r.normalize(value))
    }

    /// Validate every range in the table.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::InvalidRange`] found.
    pub fn validate(&self) -> Result<()> {
        for (attack, range) in &self.ranges {
            range.validate(attack)?;
            if let Ok(kind) = attack.parse::<AttackKind>() {
                let expected = kind.polarity() == Polarity::LowerIsMoreSevere;
                if range.reversed != expected {
                    log::warn!(
                        "range for {attack} has reversed={} but the attack's polarity implies {expected}",
                        range.reversed
                    );
                }
            }
        }
        Ok(())
    }

    /// Table built from observed native values per attack.
    #[must_use]
    pub fn observed<'a>(values: impl IntoIterator<Item = (AttackKind, &'a [f64])>) -> Self {
        let mut table = Self::new();
        for (kind, vals) in values {
            if let Some(range) = SeverityRange::observed(kind, vals) {
                table.insert(kind.name(), range);
            }
        }
        table
    }

    /// Ranges for the 512x512 center-cropped corpus.
    #[must_use]
    pub fn resized() -> Self {
        Self::from_bounds(&[
            (AttackKind::Crop, 0.4, 1.0),
            (AttackKind::DecreaseBrightness, 0.0, 1.0),
            (AttackKind::IncreaseBrightness, 1.0, 3.0),
            (AttackKind::Jpeg, 10.0, 100.0),
            (AttackKind::Mask, 0.0, 1.0),
            (AttackKind::Noise, 0.0, 50.0),
            (AttackKind::Overlay, 0.0, 1.0),
            (AttackKind::Resize, 0.1, 1.0),
            (AttackKind::Rotate, 0.0, 20.0),
        ])
    }

    /// Ranges for the original-resolution corpus.
    #[must_use]
    pub fn original() -> Self {
        Self::from_bounds(&[
            (AttackKind::Crop, 0.4, 1.0),
            (AttackKind::DecreaseBrightness, 0.2, 1.0),
            (AttackKind::IncreaseBrightness, 1.0, 2.0),
            (AttackKind::Jpeg, 50.0, 100.0),
            (AttackKind::Mask, 0.0, 0.8),
            (AttackKind::Noise, 0.0, 35.0),
            (AttackKind::Overlay, 0.0, 0.5),
            (AttackKind::Resize, 0.1, 1.0),
            (AttackKind::Rotate, 0.0, 4.0),
        ])
    }

    fn from_bounds(bounds: &[(AttackKind, f64, f64)]) -> Self {
        let mut table = Self::new();
        for &(kind, min, max) in bounds {
            table.insert(
                kind.name(),
                SeverityRange {
                    min,
                    max,
                    reversed: kind.polarity() == Polarity::LowerIsMoreSevere,
                },
            );
        }
        table
    }
}

/// Semantic severity of `value` for `attack` in `table`.
///
/// Returns `None` when the table has no range for the attack.
#[must_use]
pub fn normalize(attack: &str, value: f64, table: &RangeTable) -> Option<f64> {
    table.normalize(attack, value)
}
