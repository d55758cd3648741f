//! Geometric signature comparison.
//!
//! The score is a crude proxy for face similarity built from box
//! dimensions only. It is order-sensitive: the normalizer is the first
//! argument's `width + height`, so `compare(a, b)` and `compare(b, a)`
//! generally differ. Which side is normalized against is chosen by
//! [`Normalization`].

use crate::types::FaceSignature;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Similarity of `b` to `a` in [0, 1]; 0 when either signature is absent.
///
/// `1 - (|a.w - b.w| + |a.h - b.h|) / (a.w + a.h)`, clamped.
pub fn compare(a: Option<&FaceSignature>, b: Option<&FaceSignature>) -> f32 {
    match (a, b) {
        (Some(a), Some(b)) => normalized(a, b, a.extent()),
        _ => 0.0,
    }
}

/// Raw `|Δwidth| + |Δheight|`, the unnormalized distance used by the
/// legacy threshold.
pub fn dimension_difference(a: &FaceSignature, b: &FaceSignature) -> f32 {
    (a.width - b.width).abs() + (a.height - b.height).abs()
}

fn normalized(a: &FaceSignature, b: &FaceSignature, denom: f32) -> f32 {
    if !denom.is_finite() || denom <= 0.0 {
        return 0.0;
    }
    let score = 1.0 - dimension_difference(a, b) / denom;
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Which signature supplies the comparator's denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// Normalize by the stored (registered) signature.
    #[default]
    Stored,
    /// Normalize by the detected box.
    Detected,
    /// Normalize by the mean extent of both boxes.
    Symmetric,
}

impl Normalization {
    /// Score a detected signature against a stored one.
    pub fn score(self, stored: &FaceSignature, detected: &FaceSignature) -> f32 {
        match self {
            Normalization::Stored => compare(Some(stored), Some(detected)),
            Normalization::Detected => compare(Some(detected), Some(stored)),
            Normalization::Symmetric => {
                normalized(stored, detected, (stored.extent() + detected.extent()) / 2.0)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Normalization::Stored => "stored",
            Normalization::Detected => "detected",
            Normalization::Symmetric => "symmetric",
        }
    }
}

impl FromStr for Normalization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stored" => Ok(Normalization::Stored),
            "detected" => Ok(Normalization::Detected),
            "symmetric" => Ok(Normalization::Symmetric),
            other => Err(format!("unknown normalization mode: {other}")),
        }
    }
}
