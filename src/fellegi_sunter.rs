// 🎲 Fellegi-Sunter model - the probabilistic match signal
//
// Each field of a candidate pair is reduced to a discrete comparison level.
// A level carries two probabilities:
//   m = P(level | records match)
//   u = P(level | records do not match)
// The posterior match probability is prior_odds · Π(m/u), mapped to [0, 1].
// `Null` (either side missing) contributes nothing, so sparse records are
// scored on what they have instead of being penalised.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// COMPARISON LEVELS
// ============================================================================

/// Discrete agreement level for one field, ordered weakest → strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonLevel {
    /// One side is missing the field
    Null,
    NoMatch,
    Partial,
    High,
    Exact,
}

impl ComparisonLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonLevel::Null => "null",
            ComparisonLevel::NoMatch => "no_match",
            ComparisonLevel::Partial => "partial",
            ComparisonLevel::High => "high",
            ComparisonLevel::Exact => "exact",
        }
    }
}

impl fmt::Display for ComparisonLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    State,
    City,
    Zip,
    Industry,
}

impl Field {
    pub const ALL: [Field; 5] = [Field::Name, Field::State, Field::City, Field::Zip, Field::Industry];
}

/// Per-field comparison levels for one candidate pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComparisonVector {
    pub name: ComparisonLevel,
    pub state: ComparisonLevel,
    pub city: ComparisonLevel,
    pub zip: ComparisonLevel,
    pub industry: ComparisonLevel,
}

impl ComparisonVector {
    pub fn get(&self, field: Field) -> ComparisonLevel {
        match field {
            Field::Name => self.name,
            Field::State => self.state,
            Field::City => self.city,
            Field::Zip => self.zip,
            Field::Industry => self.industry,
        }
    }
}

impl Default for ComparisonVector {
    fn default() -> Self {
        ComparisonVector {
            name: ComparisonLevel::Null,
            state: ComparisonLevel::Null,
            city: ComparisonLevel::Null,
            zip: ComparisonLevel::Null,
            industry: ComparisonLevel::Null,
        }
    }
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// m/u probabilities for one level of one field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelParams {
    pub level: ComparisonLevel,
    pub m: f64,
    pub u: f64,
}

impl LevelParams {
    fn new(level: ComparisonLevel, m: f64, u: f64) -> Self {
        LevelParams { level, m, u }
    }

    /// Bayes factor m/u
    pub fn bayes_factor(&self) -> f64 {
        self.m / self.u
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldParams {
    pub field: Field,
    pub levels: Vec<LevelParams>,
}

impl FieldParams {
    pub fn level(&self, level: ComparisonLevel) -> Option<&LevelParams> {
        self.levels.iter().find(|p| p.level == level)
    }
}

// ============================================================================
// MODEL
// ============================================================================

const MIN_PROBABILITY: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FellegiSunterModel {
    /// Prior probability that a candidate pair is a match
    pub prior: f64,
    pub fields: Vec<FieldParams>,
}

impl FellegiSunterModel {
    /// Default parameters with the given prior
    pub fn new(prior: f64) -> Self {
        use ComparisonLevel::*;

        let fields = vec![
            FieldParams {
                field: Field::Name,
                levels: vec![
                    LevelParams::new(Exact, 0.90, 0.001),
                    LevelParams::new(High, 0.06, 0.004),
                    LevelParams::new(Partial, 0.03, 0.02),
                    LevelParams::new(NoMatch, 0.01, 0.975),
                ],
            },
            FieldParams {
                field: Field::State,
                levels: vec![
                    LevelParams::new(Exact, 0.98, 0.05),
                    LevelParams::new(NoMatch, 0.02, 0.95),
                ],
            },
            FieldParams {
                field: Field::City,
                levels: vec![
                    LevelParams::new(Exact, 0.88, 0.01),
                    LevelParams::new(High, 0.07, 0.005),
                    LevelParams::new(NoMatch, 0.05, 0.985),
                ],
            },
            FieldParams {
                field: Field::Zip,
                levels: vec![
                    LevelParams::new(Exact, 0.70, 0.002),
                    LevelParams::new(Partial, 0.20, 0.05),
                    LevelParams::new(NoMatch, 0.10, 0.948),
                ],
            },
            FieldParams {
                field: Field::Industry,
                levels: vec![
                    LevelParams::new(Exact, 0.60, 0.05),
                    LevelParams::new(Partial, 0.25, 0.15),
                    LevelParams::new(NoMatch, 0.15, 0.80),
                ],
            },
        ];

        FellegiSunterModel { prior, fields }
    }

    /// Natural-log match weight: ln(prior odds) + Σ ln(m/u)
    pub fn log_odds(&self, vector: &ComparisonVector) -> f64 {
        let prior_odds = self.prior / (1.0 - self.prior);
        let mut total = prior_odds.ln();
        for params in &self.fields {
            let level = vector.get(params.field);
            if level == ComparisonLevel::Null {
                continue;
            }
            if let Some(p) = params.level(level) {
                total += p.bayes_factor().ln();
            }
        }
        total
    }

    /// Posterior match probability in [0, 1]
    pub fn probability(&self, vector: &ComparisonVector) -> f64 {
        let log_odds = self.log_odds(vector);
        1.0 / (1.0 + (-log_odds).exp())
    }

    /// Expectation-maximisation over unlabeled comparison vectors
    ///
    /// Re-estimates the prior and every m probability; u probabilities stay
    /// fixed. Returns the number of iterations actually run.
    pub fn train(&mut self, vectors: &[ComparisonVector], iterations: usize) -> usize {
        if vectors.is_empty() {
            return 0;
        }

        for round in 0..iterations {
            // E-step
            let posteriors: Vec<f64> = vectors.iter().map(|v| self.probability(v)).collect();
            let total: f64 = posteriors.iter().sum();

            // M-step
            let new_prior = (total / vectors.len() as f64).clamp(MIN_PROBABILITY, 0.5);
            let mut max_change = (new_prior - self.prior).abs();
            self.prior = new_prior;

            for params in &mut self.fields {
                let mut observed = 0.0;
                let mut per_level = vec![0.0; params.levels.len()];
                for (vector, p) in vectors.iter().zip(&posteriors) {
                    let level = vector.get(params.field);
                    if level == ComparisonLevel::Null {
                        continue;
                    }
                    if let Some(idx) = params.levels.iter().position(|l| l.level == level) {
                        per_level[idx] += p;
                        observed += p;
                    }
                }
                if observed <= 0.0 {
                    continue;
                }
                for (lp, weight) in params.levels.iter_mut().zip(per_level) {
                    let m = (weight / observed).clamp(MIN_PROBABILITY, 1.0);
                    max_change = max_change.max((m - lp.m).abs());
                    lp.m = m;
                }
            }

            if max_change < 1e-6 {
                return round + 1;
            }
        }

        iterations
    }
}

impl Default for FellegiSunterModel {
    fn default() -> Self {
        FellegiSunterModel::new(0.0005)
    }
}

// ============================================================================
// TESTS
// ============================================================================
