use crate::comparator::{dimension_difference, Normalization};
use crate::types::{FaceSignature, MatchResult, Member};
use std::fmt;

/// Default acceptance threshold for the normalized policy.
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.7;

/// Default acceptance bound for the legacy raw-difference policy.
pub const DEFAULT_MAX_DIFFERENCE: f32 = 50.0;

/// Pick the roster member whose stored signature scores highest against
/// `detected`. Members without a signature are skipped.
///
/// The running best starts at zero and only a strictly greater score
/// replaces it, so the first member wins ties and a roster that scores
/// zero everywhere yields `None`. No threshold is applied here.
pub fn find_best_match(
    detected: &FaceSignature,
    roster: &[Member],
    normalization: Normalization,
) -> Option<MatchResult> {
    let mut best: Option<(&Member, &FaceSignature)> = None;
    let mut highest = 0.0f32;

    for member in roster {
        let Some(stored) = member.face_signature.as_ref() else {
            continue;
        };
        let score = normalization.score(stored, detected);
        if score > highest {
            highest = score;
            best = Some((member, stored));
        }
    }

    best.map(|(member, stored)| MatchResult {
        member: member.clone(),
        score: highest,
        difference: dimension_difference(detected, stored),
    })
}

/// Pick the roster member with the smallest raw dimension difference.
/// First seen wins ties.
pub fn find_closest_by_difference(
    detected: &FaceSignature,
    roster: &[Member],
    normalization: Normalization,
) -> Option<MatchResult> {
    let mut best: Option<(&Member, &FaceSignature)> = None;
    let mut smallest = f32::INFINITY;

    for member in roster {
        let Some(stored) = member.face_signature.as_ref() else {
            continue;
        };
        let diff = dimension_difference(detected, stored);
        if diff < smallest {
            smallest = diff;
            best = Some((member, stored));
        }
    }

    best.map(|(member, stored)| MatchResult {
        member: member.clone(),
        score: normalization.score(stored, detected),
        difference: smallest,
    })
}

/// Outcome of applying a policy to a detected signature.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accepted(MatchResult),
    /// No candidate cleared the policy; carries the best candidate, if any.
    Rejected(Option<MatchResult>),
}

/// Strategy for choosing a candidate and deciding whether it is a match.
pub trait MatchPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Choose the best candidate from the roster, without thresholding.
    fn select(&self, detected: &FaceSignature, roster: &[Member]) -> Option<MatchResult>;

    /// Whether a candidate counts as a recognized member.
    fn evaluate(&self, candidate: &MatchResult) -> bool;

    fn decide(&self, detected: &FaceSignature, roster: &[Member]) -> Decision {
        match self.select(detected, roster) {
            Some(candidate) if self.evaluate(&candidate) => Decision::Accepted(candidate),
            other => Decision::Rejected(other),
        }
    }
}

/// Accept the highest normalized score when it reaches `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct NormalizedThreshold {
    pub threshold: f32,
    pub normalization: Normalization,
}

impl Default for NormalizedThreshold {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SCORE_THRESHOLD,
            normalization: Normalization::default(),
        }
    }
}

impl MatchPolicy for NormalizedThreshold {
    fn name(&self) -> &'static str {
        "normalized"
    }

    fn select(&self, detected: &FaceSignature, roster: &[Member]) -> Option<MatchResult> {
        find_best_match(detected, roster, self.normalization)
    }

    fn evaluate(&self, candidate: &MatchResult) -> bool {
        candidate.score >= self.threshold
    }
}

/// Legacy policy: accept the closest box when its raw dimension difference
/// is below `max_difference` pixels. Not equivalent to the normalized policy.
#[derive(Debug, Clone, Copy)]
pub struct RawDifference {
    pub max_difference: f32,
}

impl Default for RawDifference {
    fn default() -> Self {
        Self {
            max_difference: DEFAULT_MAX_DIFFERENCE,
        }
    }
}

impl MatchPolicy for RawDifference {
    fn name(&self) -> &'static str {
        "raw-difference"
    }

    fn select(&self, detected: &FaceSignature, roster: &[Member]) -> Option<MatchResult> {
        find_closest_by_difference(detected, roster, Normalization::Stored)
    }

    fn evaluate(&self, candidate: &MatchResult) -> bool {
        candidate.difference < self.max_difference
    }
}
