// 🏢 Entity Record - one employer row from one registry
//
// Identity: entity_id (stable, scoped to its source registry)
// Values: display name, location, identifiers, size metric
//
// Records are immutable once ingested; only a merge rewrites references
// to them or deletes them.

use crate::entities::identifier::{Identifier, IdentifierKind};
use crate::normalize::Normalizer;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    // ========================================================================
    // IDENTITY
    // ========================================================================
    /// Stable id, unique in the store (e.g. "osha:1187432")
    pub entity_id: String,

    /// Registry the record came from (e.g. "f7", "osha", "sec")
    pub source: String,

    // ========================================================================
    // VALUES
    // ========================================================================
    /// Display name as filed
    pub name: String,

    /// Normalized name (see normalize.rs)
    pub name_normalized: String,

    /// Two-letter state / jurisdiction code
    pub state: Option<String>,

    pub city: Option<String>,
    pub street: Option<String>,

    /// Five-digit postal code
    pub zip: Option<String>,

    /// Industry classification code (NAICS)
    pub industry_code: Option<String>,

    /// Typed identifiers, normalized
    #[serde(default)]
    pub identifiers: Vec<Identifier>,

    /// Size metric (headcount / unit size) used for keeper tie-breaking
    pub weight: Option<i64>,

    /// Denormalized parent reference asserted by the source
    pub parent_identifier: Option<Identifier>,
}

impl EntityRecord {
    /// Create a record with only the required fields; name is normalized
    pub fn new(entity_id: &str, source: &str, name: &str, normalizer: &Normalizer) -> Self {
        EntityRecord {
            entity_id: entity_id.to_string(),
            source: source.to_string(),
            name: name.to_string(),
            name_normalized: normalizer.normalize_name(name),
            state: None,
            city: None,
            street: None,
            zip: None,
            industry_code: None,
            identifiers: Vec::new(),
            weight: None,
            parent_identifier: None,
        }
    }

    /// Builder: state (normalized to a USPS code)
    pub fn with_state(mut self, state: &str, normalizer: &Normalizer) -> Self {
        self.state = non_empty(normalizer.normalize_state(state));
        self
    }

    /// Builder: city (normalized)
    pub fn with_city(mut self, city: &str, normalizer: &Normalizer) -> Self {
        self.city = non_empty(normalizer.normalize_city(city));
        self
    }

    pub fn with_street(mut self, street: &str, normalizer: &Normalizer) -> Self {
        self.street = non_empty(normalizer.normalize_street(street));
        self
    }

    pub fn with_zip(mut self, zip: &str) -> Self {
        self.zip = non_empty(crate::normalize::normalize_zip(zip));
        self
    }

    pub fn with_industry_code(mut self, code: &str) -> Self {
        let digits: String = code.chars().filter(|c| c.is_ascii_digit()).collect();
        self.industry_code = non_empty(digits);
        self
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Builder: add an identifier (ignored when nothing usable remains)
    pub fn with_identifier(mut self, kind: IdentifierKind, raw: &str) -> Self {
        if let Some(id) = Identifier::parse(kind, raw) {
            if !self.identifiers.contains(&id) {
                self.identifiers.push(id);
            }
        }
        self
    }

    pub fn with_parent(mut self, kind: IdentifierKind, raw: &str) -> Self {
        self.parent_identifier = Identifier::parse(kind, raw);
        self
    }

    /// First identifier of the given kind
    pub fn identifier(&self, kind: IdentifierKind) -> Option<&Identifier> {
        self.identifiers.iter().find(|id| id.kind == kind)
    }

    /// Has a usable name for blocking/scoring
    pub fn has_name(&self) -> bool {
        !self.name_normalized.is_empty()
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
