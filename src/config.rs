// ⚙️ Configuration - thresholds and tables as data
//
// Everything tunable lives here and is loaded once at startup: signal
// thresholds (with per-source-pair profiles), blocking strategies,
// referencing tables for the merge, hierarchy hop cap, and the column
// mappings that adapt each registry's CSV layout.

use crate::entities::IdentifierKind;
use crate::error::{LinkageError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkageConfig {
    pub normalizer: NormalizerConfig,
    pub blocking: BlockingConfig,
    pub thresholds: ThresholdsConfig,
    pub probabilistic: ProbabilisticConfig,
    pub merge: MergeConfig,
    pub hierarchy: HierarchyConfig,
    pub crosswalk: CrosswalkConfig,
    /// Column mapping per registry, keyed by source name
    pub sources: HashMap<String, ColumnMapping>,
}

// ============================================================================
// NORMALIZER
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub extra_suffixes: Vec<String>,
    pub extra_stopwords: Vec<String>,
    /// Additional abbreviation → expansion pairs
    pub abbreviations: HashMap<String, String>,
}

// ============================================================================
// BLOCKING
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlockingConfig {
    /// Name prefix length for `state_prefix` blocks
    pub block_prefix_length: usize,

    /// Blocks above this size are skipped (flood guard)
    pub max_block_size: usize,

    /// Per-bucket cap for the catch-all pass (entities without a state)
    pub catch_all_max_block: usize,

    /// Total pair cap for the catch-all pass
    pub catch_all_max_pairs: usize,

    pub strategies: Vec<StrategyConfig>,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        BlockingConfig {
            block_prefix_length: 3,
            max_block_size: 1_000,
            catch_all_max_block: 50,
            catch_all_max_pairs: 20_000,
            strategies: vec![
                StrategyConfig {
                    kind: StrategyKind::StatePrefix,
                    signals: SignalSet::Both,
                    prefix_length: None,
                },
                StrategyConfig {
                    kind: StrategyKind::StateCity,
                    signals: SignalSet::Probabilistic,
                    prefix_length: None,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    #[serde(default)]
    pub signals: SignalSet,
    /// Overrides `block_prefix_length` for this strategy
    #[serde(default)]
    pub prefix_length: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// State + normalized-name prefix
    StatePrefix,
    /// State + normalized city
    StateCity,
    /// State only
    State,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::StatePrefix => "state_prefix",
            StrategyKind::StateCity => "state_city",
            StrategyKind::State => "state",
        }
    }
}

/// Which similarity signals a blocking strategy feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSet {
    #[default]
    Both,
    String,
    Probabilistic,
}

impl SignalSet {
    pub fn string(&self) -> bool {
        matches!(self, SignalSet::Both | SignalSet::String)
    }

    pub fn probabilistic(&self) -> bool {
        matches!(self, SignalSet::Both | SignalSet::Probabilistic)
    }

    /// Union of two signal sets
    pub fn union(self, other: SignalSet) -> SignalSet {
        let string = self.string() || other.string();
        let probabilistic = self.probabilistic() || other.probabilistic();
        match (string, probabilistic) {
            (true, true) => SignalSet::Both,
            (true, false) => SignalSet::String,
            _ => SignalSet::Probabilistic,
        }
    }
}

// ============================================================================
// THRESHOLDS
// ============================================================================

/// One set of classification thresholds
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ThresholdProfile {
    /// String signal at or above this is "high"
    pub string_signal_min: f64,
    /// String signal at or above this is "moderate"
    pub string_signal_moderate: f64,
    /// Probabilistic signal at or above this is "high"
    pub probabilistic_signal_min: f64,
    /// Probabilistic signal below this is "low" (multi-location evidence)
    pub probabilistic_signal_low: f64,
    /// Pairs with every signal below this are non-matches
    pub low_confidence_floor: f64,
    /// Stricter bar when only the probabilistic signal was computed
    pub single_signal_probabilistic_min: f64,
    /// Stricter bar when only the string signal was computed
    pub single_signal_string_min: f64,
}

impl Default for ThresholdProfile {
    fn default() -> Self {
        ThresholdProfile {
            string_signal_min: 0.90,
            string_signal_moderate: 0.75,
            probabilistic_signal_min: 0.85,
            probabilistic_signal_low: 0.40,
            low_confidence_floor: 0.60,
            single_signal_probabilistic_min: 0.95,
            single_signal_string_min: 0.97,
        }
    }
}

impl ThresholdProfile {
    fn validate(&self, label: &str) -> Result<()> {
        let values = [
            ("string_signal_min", self.string_signal_min),
            ("string_signal_moderate", self.string_signal_moderate),
            ("probabilistic_signal_min", self.probabilistic_signal_min),
            ("probabilistic_signal_low", self.probabilistic_signal_low),
            ("low_confidence_floor", self.low_confidence_floor),
            ("single_signal_probabilistic_min", self.single_signal_probabilistic_min),
            ("single_signal_string_min", self.single_signal_string_min),
        ];
        for (name, value) in values {
            if !(0.0..=1.0).contains(&value) {
                return Err(LinkageError::Config(format!(
                    "{label}: {name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.string_signal_moderate > self.string_signal_min {
            return Err(LinkageError::Config(format!(
                "{label}: string_signal_moderate must not exceed string_signal_min"
            )));
        }
        if self.probabilistic_signal_low > self.probabilistic_signal_min {
            return Err(LinkageError::Config(format!(
                "{label}: probabilistic_signal_low must not exceed probabilistic_signal_min"
            )));
        }
        Ok(())
    }
}

/// Partial profile overlaid on the default for one source pairing
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProfileOverride {
    pub string_signal_min: Option<f64>,
    pub string_signal_moderate: Option<f64>,
    pub probabilistic_signal_min: Option<f64>,
    pub probabilistic_signal_low: Option<f64>,
    pub low_confidence_floor: Option<f64>,
    pub single_signal_probabilistic_min: Option<f64>,
    pub single_signal_string_min: Option<f64>,
}

impl ProfileOverride {
    pub fn apply(&self, base: ThresholdProfile) -> ThresholdProfile {
        ThresholdProfile {
            string_signal_min: self.string_signal_min.unwrap_or(base.string_signal_min),
            string_signal_moderate: self
                .string_signal_moderate
                .unwrap_or(base.string_signal_moderate),
            probabilistic_signal_min: self
                .probabilistic_signal_min
                .unwrap_or(base.probabilistic_signal_min),
            probabilistic_signal_low: self
                .probabilistic_signal_low
                .unwrap_or(base.probabilistic_signal_low),
            low_confidence_floor: self.low_confidence_floor.unwrap_or(base.low_confidence_floor),
            single_signal_probabilistic_min: self
                .single_signal_probabilistic_min
                .unwrap_or(base.single_signal_probabilistic_min),
            single_signal_string_min: self
                .single_signal_string_min
                .unwrap_or(base.single_signal_string_min),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThresholdsConfig {
    #[serde(flatten)]
    pub default: ThresholdProfile,

    /// Overrides keyed "sourceA:sourceB" (order-insensitive)
    #[serde(default)]
    pub pairs: HashMap<String, ProfileOverride>,
}

impl ThresholdsConfig {
    /// Effective profile for a pair of sources
    pub fn profile_for(&self, source_a: &str, source_b: &str) -> ThresholdProfile {
        let forward = format!("{source_a}:{source_b}");
        let backward = format!("{source_b}:{source_a}");
        match self.pairs.get(&forward).or_else(|| self.pairs.get(&backward)) {
            Some(overlay) => overlay.apply(self.default),
            None => self.default,
        }
    }

    /// Resolved profiles for every configured pairing
    pub fn resolved(&self) -> BTreeMap<String, ThresholdProfile> {
        self.pairs
            .iter()
            .map(|(key, overlay)| (key.clone(), overlay.apply(self.default)))
            .collect()
    }
}

// ============================================================================
// PROBABILISTIC MODEL
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbabilisticConfig {
    /// Prior probability that a candidate pair is a match
    pub prior: f64,

    /// Expectation-maximisation passes over the candidate set (0 = off)
    pub em_iterations: usize,

    /// Name similarity at or above this is the `High` level
    pub name_high: f64,

    /// Name similarity at or above this is the `Partial` level
    pub name_partial: f64,

    /// City similarity at or above this is the `High` level
    pub city_high: f64,
}

impl Default for ProbabilisticConfig {
    fn default() -> Self {
        ProbabilisticConfig {
            prior: 0.0005,
            em_iterations: 0,
            name_high: 0.92,
            name_partial: 0.80,
            city_high: 0.90,
        }
    }
}

// ============================================================================
// MERGE
// ============================================================================

/// A table holding references to `entities.entity_id`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReferenceTable {
    pub table: String,
    pub column: String,

    /// Columns that, together with `column`, must stay unique; a rewrite that
    /// would duplicate a keeper row deletes the loser's row instead
    #[serde(default)]
    pub unique_columns: Vec<String>,
}

impl ReferenceTable {
    pub fn new(table: &str, column: &str, unique_columns: &[&str]) -> Self {
        ReferenceTable {
            table: table.to_string(),
            column: column.to_string(),
            unique_columns: unique_columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// "table.column" label used in logs and counts
    pub fn label(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Downstream tables referencing entity ids
    pub reference_tables: Vec<ReferenceTable>,

    /// Retries for a merge that hit transient lock contention
    pub max_retries: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            reference_tables: Vec::new(),
            max_retries: 3,
        }
    }
}

impl MergeConfig {
    /// Built-in referencing tables followed by the configured ones
    ///
    /// The crosswalk keys entities too, but its JSON link lists need their own
    /// rewrite (`db::repoint_crosswalk`).
    pub fn all_reference_tables(&self) -> Vec<ReferenceTable> {
        let mut tables = vec![
            ReferenceTable::new("entity_identifiers", "entity_id", &["kind", "value"]),
            ReferenceTable::new("location_groups", "entity_id", &["group_id"]),
            ReferenceTable::new("location_groups", "representative", &[]),
            ReferenceTable::new("ultimate_parents", "entity_id", &["space"]),
            ReferenceTable::new("ultimate_parents", "ultimate_parent_entity", &[]),
        ];
        for table in &self.reference_tables {
            if !tables.contains(table) {
                tables.push(table.clone());
            }
        }
        tables
    }
}

// ============================================================================
// HIERARCHY + CROSSWALK
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Hard cap on hops per parent-chain walk
    pub max_hops: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        HierarchyConfig { max_hops: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrosswalkConfig {
    /// Allow the name + state fallback join
    pub name_jurisdiction: bool,
}

impl Default for CrosswalkConfig {
    fn default() -> Self {
        CrosswalkConfig {
            name_jurisdiction: true,
        }
    }
}

// ============================================================================
// SOURCE COLUMN MAPPING
// ============================================================================

/// Maps one registry's CSV columns onto `EntityRecord` fields
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub entity_id: String,
    pub name: String,
    pub state: Option<String>,
    pub city: Option<String>,
    pub street: Option<String>,
    pub zip: Option<String>,
    pub industry_code: Option<String>,
    pub weight: Option<String>,
    /// Identifier kind name ("tax_id", "lei", ...) → column
    pub identifiers: BTreeMap<String, String>,
    pub parent_identifier: Option<String>,
    pub parent_kind: Option<IdentifierKind>,
    /// Prepended to raw ids to scope them to the source ("osha:")
    pub id_prefix: Option<String>,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        let identifiers = IdentifierKind::ALL
            .iter()
            .map(|kind| (kind.as_str().to_string(), kind.as_str().to_string()))
            .collect();

        ColumnMapping {
            entity_id: "entity_id".to_string(),
            name: "name".to_string(),
            state: Some("state".to_string()),
            city: Some("city".to_string()),
            street: Some("street".to_string()),
            zip: Some("zip".to_string()),
            industry_code: Some("industry_code".to_string()),
            weight: Some("weight".to_string()),
            identifiers,
            parent_identifier: Some("parent_identifier".to_string()),
            parent_kind: None,
            id_prefix: None,
        }
    }
}

// ============================================================================
// PARSE + VALIDATE
// ============================================================================

impl LinkageConfig {
    pub fn from_toml(input: &str) -> Result<Self> {
        let config: LinkageConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let input = std::fs::read_to_string(path)?;
                Self::from_toml(&input)
            }
            None => Ok(Self::default()),
        }
    }

    /// Column mapping for a source (defaults when not configured)
    pub fn mapping_for(&self, source: &str) -> ColumnMapping {
        self.sources.get(source).cloned().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.default.validate("thresholds")?;
        for (key, profile) in self.thresholds.resolved() {
            if key.split(':').count() != 2 {
                return Err(LinkageError::Config(format!(
                    "threshold pair key '{key}' must look like \"sourceA:sourceB\""
                )));
            }
            profile.validate(&format!("thresholds.pairs.{key}"))?;
        }

        if self.blocking.block_prefix_length == 0 {
            return Err(LinkageError::Config(
                "block_prefix_length must be at least 1".into(),
            ));
        }
        if self.blocking.strategies.is_empty() {
            return Err(LinkageError::Config(
                "at least one blocking strategy is required".into(),
            ));
        }
        if self
            .blocking
            .strategies
            .iter()
            .any(|s| s.prefix_length == Some(0))
        {
            return Err(LinkageError::Config(
                "strategy prefix_length must be at least 1".into(),
            ));
        }

        let prior = self.probabilistic.prior;
        if !(prior > 0.0 && prior < 1.0) {
            return Err(LinkageError::Config(format!(
                "probabilistic.prior must be within (0, 1), got {prior}"
            )));
        }

        if self.hierarchy.max_hops == 0 {
            return Err(LinkageError::Config("hierarchy.max_hops must be at least 1".into()));
        }

        for table in &self.merge.reference_tables {
            check_sql_identifier(&table.table)?;
            check_sql_identifier(&table.column)?;
            for column in &table.unique_columns {
                check_sql_identifier(column)?;
            }
            if table.table == "entities" {
                return Err(LinkageError::Config(
                    "the entities table cannot be a reference table".into(),
                ));
            }
        }

        for (source, mapping) in &self.sources {
            for kind in mapping.identifiers.keys() {
                kind.parse::<IdentifierKind>().map_err(|_| {
                    LinkageError::Config(format!(
                        "sources.{source}: unknown identifier kind '{kind}'"
                    ))
                })?;
            }
        }

        Ok(())
    }
}

impl ColumnMapping {
    /// Identifier columns with their parsed kinds (validated at load)
    pub fn identifier_columns(&self) -> Vec<(IdentifierKind, &str)> {
        self.identifiers
            .iter()
            .filter_map(|(kind, column)| Some((kind.parse().ok()?, column.as_str())))
            .collect()
    }
}

/// Table and column names are interpolated into SQL, so only plain
/// identifiers are accepted
pub fn check_sql_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(LinkageError::Config(format!("invalid SQL identifier '{name}'")))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[normalizer]
extra_suffixes = ["ag"]

[blocking]
block_prefix_length = 4
max_block_size = 200

[[blocking.strategies]]
kind = "state_prefix"
signals = "both"

[[blocking.strategies]]
kind = "state"
signals = "probabilistic"

[thresholds]
string_signal_min = 0.92
probabilistic_signal_min = 0.80

[thresholds.pairs."f7:osha"]
probabilistic_signal_min = 0.90

[probabilistic]
prior = 0.001
em_iterations = 5

[merge]
max_retries = 1

[[merge.reference_tables]]
table = "inspections"
column = "employer_id"

[[merge.reference_tables]]
table = "union_contracts"
column = "employer_id"
unique_columns = ["union_id"]

[hierarchy]
max_hops = 6

[sources.osha]
entity_id = "activity_nr"
name = "estab_name"
state = "site_state"
id_prefix = "osha:"

[sources.osha.identifiers]
tax_id = "ein"
"#;

    #[test]
    fn test_parse_full() {
        let config = LinkageConfig::from_toml(FULL).unwrap();
        assert_eq!(config.blocking.block_prefix_length, 4);
        assert_eq!(config.blocking.strategies.len(), 2);
        assert_eq!(config.blocking.strategies[1].kind, StrategyKind::State);
        assert_eq!(config.blocking.catch_all_max_block, 50, "unset field keeps default");
        assert_eq!(config.thresholds.default.string_signal_min, 0.92);
        assert_eq!(config.thresholds.default.string_signal_moderate, 0.75);
        assert_eq!(config.probabilistic.em_iterations, 5);
        assert_eq!(config.merge.reference_tables[1].unique_columns, vec!["union_id"]);
        assert_eq!(config.hierarchy.max_hops, 6);

        let osha = config.mapping_for("osha");
        assert_eq!(osha.entity_id, "activity_nr");
        assert_eq!(osha.identifiers.get("tax_id").unwrap(), "ein");
        assert_eq!(osha.identifier_columns(), vec![(IdentifierKind::TaxId, "ein")]);
        assert_eq!(osha.id_prefix.as_deref(), Some("osha:"));
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkageConfig::default();
        config.validate().unwrap();
        assert_eq!(config.blocking.block_prefix_length, 3);
        assert_eq!(config.hierarchy.max_hops, 10);
        assert_eq!(config.mapping_for("unknown").name, "name");
    }

    #[test]
    fn test_pair_profile_is_order_insensitive() {
        let config = LinkageConfig::from_toml(FULL).unwrap();
        let a = config.thresholds.profile_for("f7", "osha");
        let b = config.thresholds.profile_for("osha", "f7");
        assert_eq!(a, b);
        assert_eq!(a.probabilistic_signal_min, 0.90);
        assert_eq!(a.string_signal_min, 0.92, "unset override falls back to default");

        let other = config.thresholds.profile_for("f7", "sec");
        assert_eq!(other.probabilistic_signal_min, 0.80);
    }

    #[test]
    fn test_reference_tables_include_builtins() {
        let config = LinkageConfig::from_toml(FULL).unwrap();
        let tables = config.merge.all_reference_tables();
        assert_eq!(tables[0].table, "entity_identifiers");
        assert!(tables.iter().any(|t| t.label() == "location_groups.representative"));
        assert!(tables.iter().any(|t| t.label() == "ultimate_parents.ultimate_parent_entity"));
        assert!(tables.iter().any(|t| t.label() == "inspections.employer_id"));
    }

    #[test]
    fn test_reject_bad_threshold() {
        let err = LinkageConfig::from_toml("[thresholds]\nstring_signal_min = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("string_signal_min"));
    }

    #[test]
    fn test_reject_inverted_thresholds() {
        let input = "[thresholds]\nstring_signal_min = 0.7\nstring_signal_moderate = 0.8\n";
        let err = LinkageConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("string_signal_moderate"));
    }

    #[test]
    fn test_reject_sql_injection_in_table_name() {
        let input = r#"
[[merge.reference_tables]]
table = "inspections; DROP TABLE entities"
column = "employer_id"
"#;
        let err = LinkageConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("invalid SQL identifier"));
    }

    #[test]
    fn test_reject_unknown_identifier_kind() {
        let input = "[sources.sam.identifiers]\nduns = \"duns_number\"\n";
        let err = LinkageConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("duns"));
    }

    #[test]
    fn test_reject_unknown_strategy() {
        let input = "[[blocking.strategies]]\nkind = \"zip_prefix\"\n";
        assert!(LinkageConfig::from_toml(input).is_err());
    }

    #[test]
    fn test_signal_set_union() {
        assert_eq!(SignalSet::String.union(SignalSet::Probabilistic), SignalSet::Both);
        assert_eq!(SignalSet::String.union(SignalSet::String), SignalSet::String);
        assert_eq!(
            SignalSet::Probabilistic.union(SignalSet::Probabilistic),
            SignalSet::Probabilistic
        );
    }
}
