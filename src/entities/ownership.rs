// 🔗 Ownership links - raw parent/child assertions from source registries

use crate::entities::identifier::Identifier;
use crate::error::LinkageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Immediate parent / subsidiary
    Direct,

    /// Indirect or ultimate parent asserted without the intermediate levels
    Ultimate,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::Direct => "direct",
            RelationshipKind::Ultimate => "ultimate",
        }
    }
}

impl FromStr for RelationshipKind {
    type Err = LinkageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "" => Ok(RelationshipKind::Direct),
            "ultimate" | "indirect" => Ok(RelationshipKind::Ultimate),
            other => Err(LinkageError::Config(format!("unknown relationship kind '{other}'"))),
        }
    }
}

/// Confidence tier shared by hierarchy edges and crosswalk links
///
/// Ordered so that `High > Medium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    Medium,
    High,
}

impl ConfidenceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::High => "high",
            ConfidenceTier::Medium => "medium",
        }
    }
}

impl fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfidenceTier {
    type Err = LinkageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(ConfidenceTier::High),
            "medium" => Ok(ConfidenceTier::Medium),
            other => Err(LinkageError::Config(format!("unknown confidence tier '{other}'"))),
        }
    }
}

/// One row of a registry-native ownership table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipLink {
    pub child: Identifier,
    pub parent: Identifier,

    /// Registry that asserted the link
    pub source: String,

    pub relationship: RelationshipKind,
}
