// 🧭 Crosswalk - link one employer's records across registries
//
// Join tiers, strongest first:
//   (a) exact shared identifier with a record in another source     → High
//   (b) transitive bridge through identifier links (any hop count)   → High
//   (c) normalized name + state, only for records with no identifier
//       link, only when the other source has exactly one candidate   → Medium
//
// Each linked record gets one row carrying every identifier known for its
// linked component, so downstream lookups can cross identifier spaces.

use crate::cluster::UnionFind;
use crate::config::CrosswalkConfig;
use crate::entities::{ConfidenceTier, EntityRecord, Identifier, IdentifierKind};
use crate::error::LinkageError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMethod {
    ExactIdentifier,
    Bridge,
    NameJurisdiction,
}

impl JoinMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinMethod::ExactIdentifier => "exact_identifier",
            JoinMethod::Bridge => "bridge",
            JoinMethod::NameJurisdiction => "name_jurisdiction",
        }
    }

    pub fn confidence(&self) -> ConfidenceTier {
        match self {
            JoinMethod::ExactIdentifier | JoinMethod::Bridge => ConfidenceTier::High,
            JoinMethod::NameJurisdiction => ConfidenceTier::Medium,
        }
    }
}

impl fmt::Display for JoinMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JoinMethod {
    type Err = LinkageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact_identifier" => Ok(JoinMethod::ExactIdentifier),
            "bridge" => Ok(JoinMethod::Bridge),
            "name_jurisdiction" => Ok(JoinMethod::NameJurisdiction),
            other => Err(LinkageError::Config(format!("unknown join method '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrosswalkRecord {
    pub entity_id: String,
    pub source: String,
    pub tax_id: Option<String>,
    pub registry_number: Option<String>,
    pub lei: Option<String>,
    pub ticker: Option<String>,

    /// Records in other sources, sorted
    pub linked_ids: Vec<String>,

    pub join_method: JoinMethod,
    pub confidence: ConfidenceTier,
}

impl CrosswalkRecord {
    pub fn identifier(&self, kind: IdentifierKind) -> Option<Identifier> {
        let value = match kind {
            IdentifierKind::TaxId => self.tax_id.as_ref(),
            IdentifierKind::RegistryNumber => self.registry_number.as_ref(),
            IdentifierKind::Lei => self.lei.as_ref(),
            IdentifierKind::Ticker => self.ticker.as_ref(),
        }?;
        Some(Identifier {
            kind,
            value: value.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrosswalkStats {
    pub exact_identifier: usize,
    pub bridge: usize,
    pub name_jurisdiction: usize,
    /// Name + state matched more than one record in some other source
    pub ambiguous_skipped: usize,
    pub unlinked: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Crosswalk {
    pub records: Vec<CrosswalkRecord>,
    pub stats: CrosswalkStats,
}

impl Crosswalk {
    /// entity_id → record
    pub fn by_entity(&self) -> HashMap<&str, &CrosswalkRecord> {
        self.records.iter().map(|r| (r.entity_id.as_str(), r)).collect()
    }
}

// ============================================================================
// BUILD
// ============================================================================

pub fn build_crosswalk(entities: &[EntityRecord], config: &CrosswalkConfig) -> Crosswalk {
    let by_id: HashMap<&str, &EntityRecord> = entities.iter().map(|e| (e.entity_id.as_str(), e)).collect();

    // identifier → holders
    let mut holders: BTreeMap<&Identifier, Vec<&EntityRecord>> = BTreeMap::new();
    for entity in entities {
        for id in &entity.identifiers {
            holders.entry(id).or_default().push(entity);
        }
    }

    let mut uf = UnionFind::new();
    for entity in entities {
        uf.add(&entity.entity_id);
    }
    for group in holders.values() {
        for pair in group.windows(2) {
            uf.union(&pair[0].entity_id, &pair[1].entity_id);
        }
    }

    let mut components: HashMap<String, Vec<&EntityRecord>> = HashMap::new();
    for entity in entities {
        if let Some(root) = uf.find(&entity.entity_id) {
            components.entry(root).or_default().push(entity);
        }
    }

    let mut crosswalk = Crosswalk::default();
    let mut unlinked: Vec<&EntityRecord> = Vec::new();

    for entity in entities {
        let direct: BTreeSet<&str> = entity
            .identifiers
            .iter()
            .flat_map(|id| holders.get(id).into_iter().flatten())
            .filter(|other| other.source != entity.source)
            .map(|other| other.entity_id.as_str())
            .collect();

        let component: Vec<&EntityRecord> = uf
            .find(&entity.entity_id)
            .and_then(|root| components.get(&root))
            .cloned()
            .unwrap_or_default();
        let linked: BTreeSet<&str> = component
            .iter()
            .filter(|other| other.source != entity.source)
            .map(|other| other.entity_id.as_str())
            .collect();

        let method = if !direct.is_empty() {
            JoinMethod::ExactIdentifier
        } else if !linked.is_empty() {
            JoinMethod::Bridge
        } else {
            unlinked.push(entity);
            continue;
        };

        match method {
            JoinMethod::ExactIdentifier => crosswalk.stats.exact_identifier += 1,
            _ => crosswalk.stats.bridge += 1,
        }
        crosswalk
            .records
            .push(make_record(entity, &component, linked.into_iter(), method));
    }

    if config.name_jurisdiction {
        name_jurisdiction_pass(&unlinked, entities, &by_id, &mut crosswalk);
    } else {
        crosswalk.stats.unlinked = unlinked.len();
    }

    crosswalk.records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    info!(
        exact = crosswalk.stats.exact_identifier,
        bridge = crosswalk.stats.bridge,
        name_jurisdiction = crosswalk.stats.name_jurisdiction,
        unlinked = crosswalk.stats.unlinked,
        "crosswalk built"
    );
    crosswalk
}

/// Fallback join for records without any identifier link
fn name_jurisdiction_pass(
    unlinked: &[&EntityRecord],
    entities: &[EntityRecord],
    by_id: &HashMap<&str, &EntityRecord>,
    crosswalk: &mut Crosswalk,
) {
    // (name, state) → source → ids
    let mut index: HashMap<(&str, &str), BTreeMap<&str, Vec<&str>>> = HashMap::new();
    for e in entities.iter().filter(|e| e.has_name()) {
        if let Some(state) = e.state.as_deref() {
            index
                .entry((e.name_normalized.as_str(), state))
                .or_default()
                .entry(e.source.as_str())
                .or_default()
                .push(e.entity_id.as_str());
        }
    }

    for entity in unlinked {
        let Some(state) = entity.state.as_deref() else {
            crosswalk.stats.unlinked += 1;
            continue;
        };
        if !entity.has_name() {
            crosswalk.stats.unlinked += 1;
            continue;
        }

        let mut linked: Vec<&str> = Vec::new();
        let mut ambiguous = false;
        if let Some(per_source) = index.get(&(entity.name_normalized.as_str(), state)) {
            for (source, ids) in per_source {
                if *source == entity.source {
                    continue;
                }
                match ids.as_slice() {
                    [only] => linked.push(*only),
                    _ => ambiguous = true,
                }
            }
        }
        if ambiguous {
            crosswalk.stats.ambiguous_skipped += 1;
        }
        if linked.is_empty() {
            crosswalk.stats.unlinked += 1;
            continue;
        }

        linked.sort_unstable();
        let mut component: Vec<&EntityRecord> = vec![*entity];
        component.extend(linked.iter().filter_map(|id| by_id.get(id).copied()));

        crosswalk.stats.name_jurisdiction += 1;
        crosswalk.records.push(make_record(
            entity,
            &component,
            linked.into_iter(),
            JoinMethod::NameJurisdiction,
        ));
    }
}

fn make_record<'a>(
    entity: &EntityRecord,
    component: &[&EntityRecord],
    linked: impl Iterator<Item = &'a str>,
    method: JoinMethod,
) -> CrosswalkRecord {
    // own identifier first, otherwise the component's only value; a
    // component holding two distinct values lends neither
    let pick = |kind: IdentifierKind| -> Option<String> {
        entity.identifier(kind).map(|id| id.value.clone()).or_else(|| {
            let values: BTreeSet<&str> = component
                .iter()
                .filter_map(|e| e.identifier(kind))
                .map(|id| id.value.as_str())
                .collect();
            match values.len() {
                1 => values.first().map(|v| v.to_string()),
                _ => None,
            }
        })
    };

    CrosswalkRecord {
        entity_id: entity.entity_id.clone(),
        source: entity.source.clone(),
        tax_id: pick(IdentifierKind::TaxId),
        registry_number: pick(IdentifierKind::RegistryNumber),
        lei: pick(IdentifierKind::Lei),
        ticker: pick(IdentifierKind::Ticker),
        linked_ids: linked.map(str::to_string).collect(),
        join_method: method,
        confidence: method.confidence(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
