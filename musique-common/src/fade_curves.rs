//! Fade curve shapes for gain envelopes
//!
//! A curve maps normalized fade progress (0.0 = fade start, 1.0 = fade end)
//! onto normalized gain progress. Every curve satisfies `shape(0) == 0` and
//! `shape(1) == 1` and is monotonic in between, so an envelope interpolating
//! `start + (target - start) * shape(t)` never leaves the `[start, target]`
//! interval whichever direction it moves.

use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_2, PI};
use std::fmt;
use std::str::FromStr;

/// Fade curve types
///
/// - Linear: constant rate of change
/// - Exponential: slow start, fast finish
/// - Logarithmic: fast start, slow finish
/// - SCurve: smooth acceleration and deceleration
/// - EqualPower: quarter-sine, roughly constant perceived loudness when
///   two sources are faded against each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// v(t) = t
    #[default]
    Linear,

    /// v(t) = t²
    Exponential,

    /// v(t) = 1 - (1-t)²
    Logarithmic,

    /// v(t) = 0.5 × (1 - cos(π × t))
    #[serde(alias = "cosine", alias = "scurve")]
    SCurve,

    /// v(t) = sin(t × π/2)
    EqualPower,
}

impl FadeCurve {
    /// Map fade progress to gain progress.
    ///
    /// # Arguments
    /// * `position` - Normalized position through the fade (clamped to 0.0..=1.0)
    ///
    /// # Returns
    /// Fraction of the distance between start and target gain covered so far
    pub fn shape(&self, position: f32) -> f32 {
        let t = position.clamp(0.0, 1.0);

        let v = match self {
            FadeCurve::Linear => t,
            FadeCurve::Exponential => t * t,
            FadeCurve::Logarithmic => {
                let inv = 1.0 - t;
                1.0 - inv * inv
            }
            FadeCurve::SCurve => 0.5 * (1.0 - (PI * t).cos()),
            FadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
        };

        v.clamp(0.0, 1.0)
    }

    /// Canonical configuration string (lowercase, underscored)
    pub fn as_str(&self) -> &'static str {
        match self {
            FadeCurve::Linear => "linear",
            FadeCurve::Exponential => "exponential",
            FadeCurve::Logarithmic => "logarithmic",
            FadeCurve::SCurve => "s_curve",
            FadeCurve::EqualPower => "equal_power",
        }
    }

    /// Get all available fade curve variants
    pub fn all_variants() -> &'static [FadeCurve] {
        &[
            FadeCurve::Linear,
            FadeCurve::Exponential,
            FadeCurve::Logarithmic,
            FadeCurve::SCurve,
            FadeCurve::EqualPower,
        ]
    }
}

impl fmt::Display for FadeCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FadeCurve {
    type Err = crate::Error;

    /// Accepts the canonical names plus the aliases `cosine`, `scurve`,
    /// `s-curve` and `equalpower`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "linear" => Ok(FadeCurve::Linear),
            "exponential" => Ok(FadeCurve::Exponential),
            "logarithmic" => Ok(FadeCurve::Logarithmic),
            "cosine" | "scurve" | "s-curve" | "s_curve" => Ok(FadeCurve::SCurve),
            "equal_power" | "equalpower" => Ok(FadeCurve::EqualPower),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown fade curve '{}'",
                other
            ))),
        }
    }
}
