// 🪪 Identifier - typed registry identifiers
//
// Problem solved:
// - "12-3456789", "123456789", "3456789" → same tax ID once canonicalized
// - Each identifier space (tax ID, registry number, LEI, ticker) is kept apart;
//   values are only comparable within the same kind

use crate::error::LinkageError;
use crate::normalize::normalize_identifier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// IDENTIFIER KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    /// Employer tax ID (EIN), 9 digits
    TaxId,

    /// Corporate registry number (e.g. a filer index key), 10 digits
    RegistryNumber,

    /// Global legal-entity identifier, 20 alphanumerics
    Lei,

    /// Stock-exchange ticker
    Ticker,
}

impl IdentifierKind {
    pub const ALL: [IdentifierKind; 4] = [
        IdentifierKind::TaxId,
        IdentifierKind::RegistryNumber,
        IdentifierKind::Lei,
        IdentifierKind::Ticker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::TaxId => "tax_id",
            IdentifierKind::RegistryNumber => "registry_number",
            IdentifierKind::Lei => "lei",
            IdentifierKind::Ticker => "ticker",
        }
    }

    /// Canonical width after normalization (None = unbounded)
    pub fn width(&self) -> Option<usize> {
        match self {
            IdentifierKind::TaxId => Some(9),
            IdentifierKind::RegistryNumber => Some(10),
            IdentifierKind::Lei => Some(20),
            IdentifierKind::Ticker => None,
        }
    }

    /// Numeric kinds are left-padded with zeros up to their width
    pub fn is_numeric(&self) -> bool {
        matches!(self, IdentifierKind::TaxId | IdentifierKind::RegistryNumber)
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierKind {
    type Err = LinkageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tax_id" | "ein" => Ok(IdentifierKind::TaxId),
            "registry_number" | "cik" => Ok(IdentifierKind::RegistryNumber),
            "lei" => Ok(IdentifierKind::Lei),
            "ticker" => Ok(IdentifierKind::Ticker),
            other => Err(LinkageError::InvalidIdentifier(other.to_string())),
        }
    }
}

// ============================================================================
// IDENTIFIER
// ============================================================================

/// A normalized identifier value tagged with its kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    pub kind: IdentifierKind,
    pub value: String,
}

impl Identifier {
    /// Normalize a raw value; returns None when nothing usable remains
    pub fn parse(kind: IdentifierKind, raw: &str) -> Option<Self> {
        let value = normalize_identifier(raw, kind);
        if value.is_empty() || value.chars().all(|c| c == '0') {
            return None;
        }
        Some(Identifier { kind, value })
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}
