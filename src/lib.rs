// Employer Linkage - Core Library
// Exposes all modules for use in the CLI and in tests

pub mod error;
pub mod config;
pub mod entities;
pub mod normalize;
pub mod db;
pub mod ingest;
pub mod blocking;       // Candidate-pair generation
pub mod fellegi_sunter; // Probabilistic match model (m/u, EM)
pub mod scoring;        // String + probabilistic signals
pub mod classify;       // Decision matrix → labels
pub mod cluster;        // Union-find, merge + location groups
pub mod keeper;         // Deterministic keeper selection
pub mod merge;          // Transactional multi-table merge
pub mod crosswalk;      // Cross-registry identifier joins
pub mod hierarchy;      // Ultimate-parent resolution
pub mod export;
pub mod pipeline;

// Re-export commonly used types
pub use error::{LinkageError, Result};
pub use config::{
    BlockingConfig, ColumnMapping, LinkageConfig, MergeConfig, ReferenceTable,
    ThresholdProfile, ThresholdsConfig,
};
pub use entities::{
    ConfidenceTier, EntityRecord, Identifier, IdentifierKind, OwnershipLink, RelationshipKind,
};
pub use normalize::Normalizer;
pub use db::{open, setup_database, MergeLogEntry};
pub use blocking::{BlockingIndex, CandidateSet};
pub use fellegi_sunter::{ComparisonLevel, ComparisonVector, FellegiSunterModel};
pub use scoring::{CandidatePair, Scorer};
pub use classify::{ClassifiedPair, Classifier, Label};
pub use cluster::{LocationGroup, UnionFind};
pub use keeper::{select_keeper, KeeperCandidate, MergeGroup};
pub use merge::{MergeExecutor, MergeOutcome};
pub use crosswalk::{build_crosswalk, CrosswalkRecord, JoinMethod};
pub use hierarchy::{resolve, HierarchyEdge, UltimateParent};
pub use pipeline::{run_dedup, DedupOptions, RunMode, RunSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
