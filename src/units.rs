use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

/// How many ulps below an integer a converted amount may land and still be
/// read as that integer. Covers the error of up to five scaling steps.
const SNAP_ULPS: f64 = 8.0;

/// Unit taxonomy understood by the engine. Richer resource types must be
/// mapped onto one of these before they reach the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    /// Dimensionless count (CPU cores, GPUs, licences).
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "Bytes (SI)")]
    BytesSi,
    #[serde(rename = "Bytes (IEC)")]
    BytesIec,
}

/// Ordered unit labels and the factor between neighbouring labels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitScale {
    pub divisor: f64,
    pub labels: &'static [&'static str],
}

pub const SI_SCALE: UnitScale = UnitScale {
    divisor: 1000.0,
    labels: &["B", "kB", "MB", "GB", "TB", "PB"],
};

pub const IEC_SCALE: UnitScale = UnitScale {
    divisor: 1024.0,
    labels: &["B", "KiB", "MiB", "GiB", "TiB", "PiB"],
};

impl UnitKind {
    /// `None` for dimensionless quantities, which are never scaled.
    pub fn scale(self) -> Option<&'static UnitScale> {
        match self {
            UnitKind::None => None,
            UnitKind::BytesSi => Some(&SI_SCALE),
            UnitKind::BytesIec => Some(&IEC_SCALE),
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::None => write!(f, "none"),
            UnitKind::BytesSi => write!(f, "Bytes (SI)"),
            UnitKind::BytesIec => write!(f, "Bytes (IEC)"),
        }
    }
}

/// An amount in base units (bytes, or a raw count). Scaled presentation is
/// always derived with [`to_display`], never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub amount: f64,
    #[serde(default)]
    pub unit: UnitKind,
}

impl Quantity {
    pub const fn new(amount: f64, unit: UnitKind) -> Self {
        Self { amount, unit }
    }

    pub const fn zero(unit: UnitKind) -> Self {
        Self { amount: 0.0, unit }
    }

    /// Amounts are only comparable when they share a base unit.
    pub fn ensure_same_unit(&self, other: &Quantity) -> Result<(), EngineError> {
        if self.unit != other.unit {
            return Err(EngineError::UnitMismatch {
                expected: self.unit,
                found: other.unit,
            });
        }
        Ok(())
    }

    /// The same quantity with fractional base units dropped.
    pub fn floored(self) -> Self {
        Self::new(floor_base(self.amount), self.unit)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (amount, label) = to_display(*self);
        if label.is_empty() {
            write!(f, "{amount}")
        } else {
            write!(f, "{amount} {label}")
        }
    }
}

/// Scale a base amount to the largest label it reaches, never past the
/// last label of the scale.
pub fn to_display(q: Quantity) -> (f64, &'static str) {
    let Some(scale) = q.unit.scale() else {
        return (q.amount, "");
    };
    let mut amount = q.amount;
    let mut idx = 0;
    while amount >= scale.divisor && idx + 1 < scale.labels.len() {
        amount /= scale.divisor;
        idx += 1;
    }
    (amount, scale.labels[idx])
}

/// Position of `label` in the scale of `kind`.
pub fn label_index(kind: UnitKind, label: &str) -> Option<usize> {
    kind.scale()?.labels.iter().position(|l| *l == label)
}

/// Inverse of [`to_display`]. The result is floored: fractional base units
/// cannot be allocated.
///
/// An unknown label is treated as the base label instead of failing, so a
/// drifted display layer degrades to "no scaling". The fallback is logged.
pub fn to_base(scaled: f64, label: &str, kind: UnitKind) -> f64 {
    let Some(scale) = kind.scale() else {
        return floor_base(scaled);
    };
    let idx = match label_index(kind, label) {
        Some(idx) => idx,
        None => {
            tracing::warn!("unknown unit label {label:?} for {kind}, amount left unscaled");
            metrics::counter!(crate::observability::UNKNOWN_UNIT_LABELS_TOTAL).increment(1);
            0
        }
    };
    let mut amount = scaled;
    for _ in 0..idx {
        amount *= scale.divisor;
    }
    floor_base(amount)
}

/// Floors a base amount. A value sitting a few ulps under an integer is
/// representation error from scaling and snaps up to that integer instead.
pub fn floor_base(value: f64) -> f64 {
    let ceil = value.ceil();
    if ceil > value && ceil - value <= ceil.abs() * SNAP_ULPS * f64::EPSILON {
        ceil
    } else {
        value.floor()
    }
}
