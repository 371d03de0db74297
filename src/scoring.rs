// 📐 Similarity Scorer - two independent signals per candidate pair
//
// String signal:        0.5·max(levenshtein, token_sort) + 0.5·token_set
// Probabilistic signal: Fellegi-Sunter posterior over field comparison levels
//
// Which signals are computed for a pair depends on the blocking strategies
// that surfaced it. Scoring is read-only and runs data-parallel.

use crate::blocking::{CandidateSet, PairOrigin};
use crate::config::ProbabilisticConfig;
use crate::entities::EntityRecord;
use crate::fellegi_sunter::{ComparisonLevel, ComparisonVector, FellegiSunterModel};
use crate::normalize::tokens;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

// ============================================================================
// CANDIDATE PAIR
// ============================================================================

/// A scored candidate pair, `id1 < id2`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidatePair {
    pub id1: String,
    pub id2: String,
    pub source1: String,
    pub source2: String,

    /// None when no strategy feeding the string signal surfaced the pair
    pub string_signal: Option<f64>,

    /// None when no strategy feeding the probabilistic signal surfaced the pair
    pub probabilistic_signal: Option<f64>,

    pub levels: ComparisonVector,
    pub strategies: Vec<&'static str>,
}

impl CandidatePair {
    /// Number of signals computed for the pair
    pub fn signal_count(&self) -> usize {
        self.string_signal.is_some() as usize + self.probabilistic_signal.is_some() as usize
    }
}

// ============================================================================
// STRING SIMILARITY
// ============================================================================

/// Composite string signal over two normalized names
pub fn string_signal(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let whole = strsim::normalized_levenshtein(a, b);
    0.5 * whole.max(token_sort_ratio(a, b)) + 0.5 * token_set_ratio(a, b)
}

/// Levenshtein ratio after sorting tokens
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let sorted = |s: &str| {
        let mut t = tokens(s);
        t.sort_unstable();
        t.join(" ")
    };
    strsim::normalized_levenshtein(&sorted(a), &sorted(b))
}

/// Best ratio between the shared tokens and each side's full token set
///
/// Word order and duplicated words do not matter, and one name being a
/// token subset of the other scores 1.0.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let set_a: BTreeSet<&str> = tokens(a).into_iter().collect();
    let set_b: BTreeSet<&str> = tokens(b).into_iter().collect();

    let shared = join(set_a.intersection(&set_b));
    let only_a = join(set_a.difference(&set_b));
    let only_b = join(set_b.difference(&set_a));

    let combined_a = join_non_empty(&shared, &only_a);
    let combined_b = join_non_empty(&shared, &only_b);

    if shared.is_empty() {
        return strsim::normalized_levenshtein(&combined_a, &combined_b);
    }

    [
        strsim::normalized_levenshtein(&shared, &combined_a),
        strsim::normalized_levenshtein(&shared, &combined_b),
        strsim::normalized_levenshtein(&combined_a, &combined_b),
    ]
    .into_iter()
    .fold(0.0, f64::max)
}

fn join<'a>(words: impl Iterator<Item = &'a &'a str>) -> String {
    words.copied().collect::<Vec<_>>().join(" ")
}

fn join_non_empty(left: &str, right: &str) -> String {
    match (left.is_empty(), right.is_empty()) {
        (true, _) => right.to_string(),
        (_, true) => left.to_string(),
        _ => format!("{left} {right}"),
    }
}

// ============================================================================
// FIELD COMPARISON
// ============================================================================

/// Reduce two records to per-field comparison levels
pub fn compare(a: &EntityRecord, b: &EntityRecord, config: &ProbabilisticConfig) -> ComparisonVector {
    ComparisonVector {
        name: compare_name(&a.name_normalized, &b.name_normalized, config),
        state: compare_exact(a.state.as_deref(), b.state.as_deref()),
        city: compare_city(a.city.as_deref(), b.city.as_deref(), config),
        zip: compare_zip(a.zip.as_deref(), b.zip.as_deref()),
        industry: compare_industry(a.industry_code.as_deref(), b.industry_code.as_deref()),
    }
}

fn compare_name(a: &str, b: &str, config: &ProbabilisticConfig) -> ComparisonLevel {
    if a.is_empty() || b.is_empty() {
        return ComparisonLevel::Null;
    }
    if a == b {
        return ComparisonLevel::Exact;
    }
    let similarity = strsim::jaro_winkler(a, b);
    if similarity >= config.name_high {
        ComparisonLevel::High
    } else if similarity >= config.name_partial {
        ComparisonLevel::Partial
    } else {
        ComparisonLevel::NoMatch
    }
}

fn compare_exact(a: Option<&str>, b: Option<&str>) -> ComparisonLevel {
    match (a, b) {
        (Some(a), Some(b)) if a == b => ComparisonLevel::Exact,
        (Some(_), Some(_)) => ComparisonLevel::NoMatch,
        _ => ComparisonLevel::Null,
    }
}

fn compare_city(a: Option<&str>, b: Option<&str>, config: &ProbabilisticConfig) -> ComparisonLevel {
    match (a, b) {
        (Some(a), Some(b)) if a == b => ComparisonLevel::Exact,
        (Some(a), Some(b)) if strsim::jaro_winkler(a, b) >= config.city_high => ComparisonLevel::High,
        (Some(_), Some(_)) => ComparisonLevel::NoMatch,
        _ => ComparisonLevel::Null,
    }
}

fn compare_zip(a: Option<&str>, b: Option<&str>) -> ComparisonLevel {
    match (a, b) {
        (Some(a), Some(b)) if a == b => ComparisonLevel::Exact,
        (Some(a), Some(b)) if a.get(..3).is_some() && a.get(..3) == b.get(..3) => ComparisonLevel::Partial,
        (Some(_), Some(_)) => ComparisonLevel::NoMatch,
        _ => ComparisonLevel::Null,
    }
}

/// Six-digit agreement is Exact, a shared two-digit sector is Partial
fn compare_industry(a: Option<&str>, b: Option<&str>) -> ComparisonLevel {
    match (a, b) {
        (Some(a), Some(b)) if a == b => ComparisonLevel::Exact,
        (Some(a), Some(b)) if a.get(..2).is_some() && a.get(..2) == b.get(..2) => ComparisonLevel::Partial,
        (Some(_), Some(_)) => ComparisonLevel::NoMatch,
        _ => ComparisonLevel::Null,
    }
}

// ============================================================================
// SCORER
// ============================================================================

pub struct Scorer {
    model: FellegiSunterModel,
    config: ProbabilisticConfig,
}

impl Scorer {
    pub fn new(config: &ProbabilisticConfig) -> Self {
        Scorer {
            model: FellegiSunterModel::new(config.prior),
            config: config.clone(),
        }
    }

    /// Replace the default model parameters
    pub fn with_model(mut self, model: FellegiSunterModel) -> Self {
        self.model = model;
        self
    }

    pub fn model(&self) -> &FellegiSunterModel {
        &self.model
    }

    /// Score one pair; the caller guarantees `a.entity_id < b.entity_id`
    pub fn score_pair(&self, a: &EntityRecord, b: &EntityRecord, origin: &PairOrigin) -> CandidatePair {
        let levels = compare(a, b, &self.config);

        let string_signal = origin
            .signals
            .string()
            .then(|| string_signal(&a.name_normalized, &b.name_normalized));
        let probabilistic_signal = origin
            .signals
            .probabilistic()
            .then(|| self.model.probability(&levels));

        CandidatePair {
            id1: a.entity_id.clone(),
            id2: b.entity_id.clone(),
            source1: a.source.clone(),
            source2: b.source.clone(),
            string_signal,
            probabilistic_signal,
            levels,
            strategies: origin.strategies.clone(),
        }
    }

    /// Fit the model with EM over the comparison vectors of every candidate
    /// pair that feeds the probabilistic signal
    ///
    /// No-op when `em_iterations` is 0. Returns the rounds run.
    pub fn fit(&mut self, entities: &[EntityRecord], candidates: &CandidateSet) -> usize {
        if self.config.em_iterations == 0 {
            return 0;
        }
        let lookup = index_by_id(entities);
        let vectors: Vec<ComparisonVector> = candidates
            .pairs
            .par_iter()
            .filter(|(_, origin)| origin.signals.probabilistic())
            .filter_map(|((id1, id2), _)| {
                let a = lookup.get(id1.as_str())?;
                let b = lookup.get(id2.as_str())?;
                Some(compare(a, b, &self.config))
            })
            .collect();

        let rounds = self.model.train(&vectors, self.config.em_iterations);
        info!(
            vectors = vectors.len(),
            rounds,
            prior = self.model.prior,
            "probabilistic model trained"
        );
        rounds
    }

    /// Score every candidate pair in parallel, in candidate-key order
    pub fn score_all(&self, entities: &[EntityRecord], candidates: &CandidateSet) -> Vec<CandidatePair> {
        let lookup = index_by_id(entities);
        let work: Vec<_> = candidates.pairs.iter().collect();

        let scored: Vec<CandidatePair> = work
            .par_iter()
            .filter_map(|((id1, id2), origin)| {
                let a = lookup.get(id1.as_str())?;
                let b = lookup.get(id2.as_str())?;
                Some(self.score_pair(a, b, origin))
            })
            .collect();

        debug!(candidates = candidates.len(), scored = scored.len(), "scoring done");
        scored
    }
}

fn index_by_id(entities: &[EntityRecord]) -> HashMap<&str, &EntityRecord> {
    entities.iter().map(|e| (e.entity_id.as_str(), e)).collect()
}

// ============================================================================
// TESTS
// ============================================================================
