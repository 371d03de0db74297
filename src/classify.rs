// 🏷️ Classifier - signals + field levels → label
//
// A pure decision matrix over the two similarity signals. The first rule
// that fires wins. Same-name pairs whose probabilistic signal is low are the
// multi-location case: linked later, never merged.

use crate::config::{ThresholdProfile, ThresholdsConfig};
use crate::fellegi_sunter::ComparisonLevel;
use crate::scoring::CandidatePair;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Label {
    /// Safe to merge without review
    AutoMerge,
    /// Merge, backed by both signals at a slightly lower string bar
    Confirmed,
    /// Probably the same employer, needs review
    Likely,
    /// Same name, different establishment
    MultiLocation,
    /// Match found by a single signal or by the model alone
    NewMatch,
    LowConfidence,
}

impl Label {
    pub const ALL: [Label; 6] = [
        Label::AutoMerge,
        Label::Confirmed,
        Label::Likely,
        Label::MultiLocation,
        Label::NewMatch,
        Label::LowConfidence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::AutoMerge => "AUTO_MERGE",
            Label::Confirmed => "CONFIRMED",
            Label::Likely => "LIKELY",
            Label::MultiLocation => "MULTI_LOCATION",
            Label::NewMatch => "NEW_MATCH",
            Label::LowConfidence => "LOW_CONFIDENCE",
        }
    }

    /// Labels whose pairs feed merge groups
    pub fn is_merge(&self) -> bool {
        matches!(self, Label::AutoMerge | Label::Confirmed)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// DECISION MATRIX
// ============================================================================

/// Label one pair under one threshold profile
pub fn label(pair: &CandidatePair, t: &ThresholdProfile) -> Label {
    let name = pair.levels.name;
    let state = pair.levels.state;

    match (pair.string_signal, pair.probabilistic_signal) {
        (Some(s), Some(p)) => {
            if s >= t.string_signal_min && p >= t.probabilistic_signal_min && name == ComparisonLevel::Exact {
                Label::AutoMerge
            } else if s >= t.string_signal_moderate
                && p >= t.probabilistic_signal_min
                && name == ComparisonLevel::Exact
            {
                Label::Confirmed
            } else if s >= t.string_signal_min && p < t.probabilistic_signal_low {
                Label::MultiLocation
            } else if p >= t.probabilistic_signal_min
                && name >= ComparisonLevel::High
                && s < t.string_signal_moderate
            {
                Label::NewMatch
            } else if s >= t.string_signal_moderate
                && p >= t.probabilistic_signal_low
                && name >= ComparisonLevel::Partial
            {
                Label::Likely
            } else {
                Label::LowConfidence
            }
        }
        (None, Some(p)) if p >= t.single_signal_probabilistic_min && name == ComparisonLevel::Exact => {
            Label::NewMatch
        }
        (Some(s), None)
            if s >= t.single_signal_string_min
                && name == ComparisonLevel::Exact
                && state == ComparisonLevel::Exact =>
        {
            Label::NewMatch
        }
        _ => Label::LowConfidence,
    }
}

/// LowConfidence with every computed signal under the floor
pub fn is_non_match(pair: &CandidatePair, label: Label, t: &ThresholdProfile) -> bool {
    label == Label::LowConfidence
        && [pair.string_signal, pair.probabilistic_signal]
            .into_iter()
            .flatten()
            .all(|signal| signal < t.low_confidence_floor)
}

// ============================================================================
// CLASSIFIER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedPair {
    #[serde(flatten)]
    pub pair: CandidatePair,
    pub label: Label,
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    /// Every pair except the dropped non-matches
    pub retained: Vec<ClassifiedPair>,
    pub non_matches: usize,
    pub counts: BTreeMap<Label, usize>,
}

impl Classification {
    pub fn count(&self, label: Label) -> usize {
        self.counts.get(&label).copied().unwrap_or(0)
    }

    pub fn with_label(&self, label: Label) -> impl Iterator<Item = &ClassifiedPair> {
        self.retained.iter().filter(move |p| p.label == label)
    }
}

pub struct Classifier<'a> {
    thresholds: &'a ThresholdsConfig,
}

impl<'a> Classifier<'a> {
    pub fn new(thresholds: &'a ThresholdsConfig) -> Self {
        Classifier { thresholds }
    }

    /// Profile for the pair's source combination
    pub fn profile(&self, pair: &CandidatePair) -> ThresholdProfile {
        self.thresholds.profile_for(&pair.source1, &pair.source2)
    }

    pub fn label(&self, pair: &CandidatePair) -> Label {
        label(pair, &self.profile(pair))
    }

    pub fn classify_all(&self, pairs: Vec<CandidatePair>) -> Classification {
        let mut result = Classification::default();

        for pair in pairs {
            let profile = self.profile(&pair);
            let label = label(&pair, &profile);
            if is_non_match(&pair, label, &profile) {
                result.non_matches += 1;
                continue;
            }
            *result.counts.entry(label).or_insert(0) += 1;
            result.retained.push(ClassifiedPair { pair, label });
        }

        debug!(
            retained = result.retained.len(),
            non_matches = result.non_matches,
            "classification done"
        );
        result
    }
}

// ============================================================================
// TESTS
// ============================================================================
