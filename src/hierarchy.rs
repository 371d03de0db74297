// 🌳 Hierarchy Resolver - ultimate parent per entity, per identifier space
//
// Edges come from two places:
//   - the ownership_links table (registry-native)              → High
//   - each record's own parent_identifier field                → Medium
// A parent chain only makes sense inside one identifier space, so edges that
// cross spaces are rejected and every space is walked on its own.
//
// Walks are iterative with an explicit visited set and a hard hop cap. On a
// cycle the walk stops at the last new node and flags the result.

use crate::config::HierarchyConfig;
use crate::crosswalk::CrosswalkRecord;
use crate::entities::{ConfidenceTier, EntityRecord, Identifier, IdentifierKind, OwnershipLink, RelationshipKind};
use crate::error::LinkageError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HierarchyEdge {
    pub space: IdentifierKind,
    /// Child identifier value
    pub child: String,
    /// Parent identifier value
    pub parent: String,
    pub source: String,
    pub relationship: RelationshipKind,
    pub tier: ConfidenceTier,
}

/// Preferred edge first: Direct before Ultimate, then higher tier, then
/// smallest parent
fn edge_order(a: &HierarchyEdge, b: &HierarchyEdge) -> std::cmp::Ordering {
    a.relationship
        .cmp(&b.relationship)
        .then_with(|| b.tier.cmp(&a.tier))
        .then_with(|| a.parent.cmp(&b.parent))
        .then_with(|| a.source.cmp(&b.source))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UltimateParent {
    pub entity_id: String,
    pub space: IdentifierKind,
    pub ultimate_parent: String,
    /// Entity holding the ultimate parent identifier, when it is in the store
    pub ultimate_parent_entity: Option<String>,
    /// Hops walked, including a hop that closed a cycle
    pub depth: usize,
    /// Source of the last edge followed
    pub source: String,
    pub cycle_truncated: bool,
    pub hop_capped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HierarchyStats {
    pub edges_from_links: usize,
    pub edges_from_records: usize,
    pub cross_space_rejected: usize,
    /// Records with a parent but no identifier of their own in that space
    pub unplaced: usize,
    pub cycles: usize,
    pub hop_capped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    pub edges: Vec<HierarchyEdge>,
    pub parents: Vec<UltimateParent>,
    pub stats: HierarchyStats,
}

// ============================================================================
// EDGES
// ============================================================================

/// The record's identifier in one space: its own, else a High-tier
/// crosswalk row's
///
/// Name+state joins are too weak to place a record in a parent chain.
fn identifier_in_space(
    entity: &EntityRecord,
    kind: IdentifierKind,
    crosswalk: &HashMap<&str, &CrosswalkRecord>,
) -> Option<Identifier> {
    entity.identifier(kind).cloned().or_else(|| {
        crosswalk
            .get(entity.entity_id.as_str())
            .filter(|r| r.confidence == ConfidenceTier::High)
            .and_then(|r| r.identifier(kind))
    })
}

pub fn build_edges(
    entities: &[EntityRecord],
    links: &[OwnershipLink],
    crosswalk: &HashMap<&str, &CrosswalkRecord>,
    stats: &mut HierarchyStats,
) -> Vec<HierarchyEdge> {
    let mut edges: HashSet<HierarchyEdge> = HashSet::new();

    for link in links {
        if link.child.kind != link.parent.kind {
            warn!(child = %link.child, parent = %link.parent, "rejecting cross-space ownership link");
            stats.cross_space_rejected += 1;
            continue;
        }
        if link.child.value == link.parent.value {
            continue;
        }
        if edges.insert(HierarchyEdge {
            space: link.child.kind,
            child: link.child.value.clone(),
            parent: link.parent.value.clone(),
            source: link.source.clone(),
            relationship: link.relationship,
            tier: ConfidenceTier::High,
        }) {
            stats.edges_from_links += 1;
        }
    }

    for entity in entities {
        let Some(parent) = &entity.parent_identifier else {
            continue;
        };
        let Some(own) = identifier_in_space(entity, parent.kind, crosswalk) else {
            let missing = LinkageError::MissingField {
                entity_id: entity.entity_id.clone(),
                field: "identifier in parent space",
            };
            debug!(%missing, space = %parent.kind, "parent reference not placed");
            stats.unplaced += 1;
            continue;
        };
        if own.value == parent.value {
            continue;
        }
        if edges.insert(HierarchyEdge {
            space: parent.kind,
            child: own.value,
            parent: parent.value.clone(),
            source: entity.source.clone(),
            relationship: RelationshipKind::Direct,
            tier: ConfidenceTier::Medium,
        }) {
            stats.edges_from_records += 1;
        }
    }

    let mut edges: Vec<HierarchyEdge> = edges.into_iter().collect();
    edges.sort_by(|a, b| {
        a.space
            .cmp(&b.space)
            .then_with(|| a.child.cmp(&b.child))
            .then_with(|| edge_order(a, b))
    });
    edges
}

// ============================================================================
// WALK
// ============================================================================

/// Result of one parent-chain walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Walk {
    pub ultimate: String,
    pub depth: usize,
    pub source: String,
    pub cycle_truncated: bool,
    pub hop_capped: bool,
}

/// child → chosen edge, for one space
pub fn chosen_edges(edges: &[HierarchyEdge], space: IdentifierKind) -> HashMap<&str, &HierarchyEdge> {
    let mut chosen: HashMap<&str, &HierarchyEdge> = HashMap::new();
    for edge in edges.iter().filter(|e| e.space == space) {
        chosen
            .entry(edge.child.as_str())
            .and_modify(|current| {
                if edge_order(edge, *current).is_lt() {
                    *current = edge;
                }
            })
            .or_insert(edge);
    }
    chosen
}

/// Follow chosen edges up from `start`; None when `start` has no parent
pub fn walk(start: &str, chosen: &HashMap<&str, &HierarchyEdge>, max_hops: usize) -> Option<Walk> {
    let mut visited: HashSet<&str> = HashSet::from([start]);
    let mut current = start;
    let mut result = Walk {
        ultimate: start.to_string(),
        depth: 0,
        source: String::new(),
        cycle_truncated: false,
        hop_capped: false,
    };

    while let Some(edge) = chosen.get(current) {
        if result.depth == max_hops {
            result.hop_capped = true;
            break;
        }
        result.depth += 1;
        if !visited.insert(edge.parent.as_str()) {
            result.cycle_truncated = true;
            break;
        }
        current = edge.parent.as_str();
        result.source = edge.source.clone();
    }

    if result.depth == 0 {
        return None;
    }
    result.ultimate = current.to_string();
    Some(result)
}

// ============================================================================
// RESOLVER
// ============================================================================

pub fn resolve(
    entities: &[EntityRecord],
    links: &[OwnershipLink],
    crosswalk: &[CrosswalkRecord],
    config: &HierarchyConfig,
) -> Hierarchy {
    let crosswalk: HashMap<&str, &CrosswalkRecord> =
        crosswalk.iter().map(|r| (r.entity_id.as_str(), r)).collect();

    let mut hierarchy = Hierarchy::default();
    hierarchy.edges = build_edges(entities, links, &crosswalk, &mut hierarchy.stats);

    for space in IdentifierKind::ALL {
        let chosen = chosen_edges(&hierarchy.edges, space);
        if chosen.is_empty() {
            continue;
        }

        // identifier value → smallest holding entity id
        let mut holders: BTreeMap<&str, &str> = BTreeMap::new();
        for e in entities {
            if let Some(id) = e.identifier(space) {
                holders
                    .entry(id.value.as_str())
                    .and_modify(|h| {
                        if e.entity_id.as_str() < *h {
                            *h = e.entity_id.as_str();
                        }
                    })
                    .or_insert(e.entity_id.as_str());
            }
        }

        let starts: Vec<(&str, Identifier)> = entities
            .iter()
            .filter_map(|e| Some((e.entity_id.as_str(), identifier_in_space(e, space, &crosswalk)?)))
            .collect();

        let results: Vec<UltimateParent> = starts
            .par_iter()
            .filter_map(|(entity_id, own)| {
                let w = walk(&own.value, &chosen, config.max_hops)?;
                Some(UltimateParent {
                    entity_id: entity_id.to_string(),
                    space,
                    ultimate_parent_entity: holders.get(w.ultimate.as_str()).map(|h| h.to_string()),
                    ultimate_parent: w.ultimate,
                    depth: w.depth,
                    source: w.source,
                    cycle_truncated: w.cycle_truncated,
                    hop_capped: w.hop_capped,
                })
            })
            .collect();

        for r in &results {
            if r.cycle_truncated {
                let cycle = LinkageError::CycleDetected {
                    identifier: r.ultimate_parent.clone(),
                    depth: r.depth,
                };
                warn!(entity = %r.entity_id, space = %space, "{cycle}");
                hierarchy.stats.cycles += 1;
            }
            if r.hop_capped {
                hierarchy.stats.hop_capped += 1;
            }
        }
        debug!(space = %space, resolved = results.len(), "hierarchy space walked");
        hierarchy.parents.extend(results);
    }

    hierarchy
        .parents
        .sort_by(|a, b| a.entity_id.cmp(&b.entity_id).then_with(|| a.space.cmp(&b.space)));

    info!(
        edges = hierarchy.edges.len(),
        resolved = hierarchy.parents.len(),
        cycles = hierarchy.stats.cycles,
        "hierarchy resolved"
    );
    hierarchy
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;

    const LEI_X: &str = "549300XXXXXXXXXXXX01";
    const LEI_Y: &str = "549300YYYYYYYYYYYY02";
    const LEI_Z: &str = "549300ZZZZZZZZZZZZ03";

    fn lei(value: &str) -> Identifier {
        Identifier::parse(IdentifierKind::Lei, value).unwrap()
    }

    fn create_test_link(child: &str, parent: &str, relationship: RelationshipKind) -> OwnershipLink {
        OwnershipLink {
            child: lei(child),
            parent: lei(parent),
            source: "gleif".to_string(),
            relationship,
        }
    }

    fn create_test_entity(id: &str, lei_value: &str) -> EntityRecord {
        let n = Normalizer::default();
        EntityRecord::new(id, "gleif", id, &n).with_identifier(IdentifierKind::Lei, lei_value)
    }

    fn parent_of<'a>(h: &'a Hierarchy, id: &str) -> &'a UltimateParent {
        h.parents.iter().find(|p| p.entity_id == id).unwrap()
    }

    #[test]
    fn test_chain_resolves_to_top() {
        let entities = vec![
            create_test_entity("x", LEI_X),
            create_test_entity("y", LEI_Y),
            create_test_entity("z", LEI_Z),
        ];
        let links = vec![
            create_test_link(LEI_X, LEI_Y, RelationshipKind::Direct),
            create_test_link(LEI_Y, LEI_Z, RelationshipKind::Direct),
        ];
        let h = resolve(&entities, &links, &[], &HierarchyConfig::default());

        let x = parent_of(&h, "x");
        assert_eq!(x.ultimate_parent, LEI_Z);
        assert_eq!(x.ultimate_parent_entity.as_deref(), Some("z"));
        assert_eq!(x.depth, 2);
        assert!(!x.cycle_truncated);
        assert_eq!(parent_of(&h, "y").depth, 1);
        // the top of the chain has no parent record
        assert!(h.parents.iter().all(|p| p.entity_id != "z"));
    }

    #[test]
    fn test_cycle_is_truncated() {
        let entities = vec![create_test_entity("x", LEI_X)];
        let links = vec![
            create_test_link(LEI_X, LEI_Y, RelationshipKind::Direct),
            create_test_link(LEI_Y, LEI_Z, RelationshipKind::Direct),
            create_test_link(LEI_Z, LEI_X, RelationshipKind::Direct),
        ];
        let h = resolve(&entities, &links, &[], &HierarchyConfig::default());

        let x = parent_of(&h, "x");
        assert_eq!(x.depth, 3);
        assert_eq!(x.ultimate_parent, LEI_Z);
        assert!(x.cycle_truncated);
        assert!(!x.hop_capped);
        assert_eq!(h.stats.cycles, 1);
    }

    #[test]
    fn test_hop_cap() {
        let values: Vec<String> = (0..6).map(|i| format!("5493000000000000000{i}")).collect();
        let links: Vec<OwnershipLink> = values
            .windows(2)
            .map(|w| create_test_link(&w[0], &w[1], RelationshipKind::Direct))
            .collect();
        let entities = vec![create_test_entity("bottom", &values[0])];
        let config = HierarchyConfig { max_hops: 3 };

        let h = resolve(&entities, &links, &[], &config);
        let bottom = parent_of(&h, "bottom");
        assert_eq!(bottom.depth, 3);
        assert_eq!(bottom.ultimate_parent, values[3]);
        assert!(bottom.hop_capped);
    }

    #[test]
    fn test_direct_preferred_over_ultimate() {
        let entities = vec![create_test_entity("x", LEI_X)];
        let links = vec![
            create_test_link(LEI_X, LEI_Z, RelationshipKind::Ultimate),
            create_test_link(LEI_X, LEI_Y, RelationshipKind::Direct),
        ];
        let h = resolve(&entities, &links, &[], &HierarchyConfig::default());
        assert_eq!(parent_of(&h, "x").ultimate_parent, LEI_Y);
    }

    #[test]
    fn test_registry_link_beats_record_field() {
        let entities = vec![create_test_entity("x", LEI_X).with_parent(IdentifierKind::Lei, LEI_Z)];
        let links = vec![create_test_link(LEI_X, LEI_Y, RelationshipKind::Direct)];
        let h = resolve(&entities, &links, &[], &HierarchyConfig::default());

        assert_eq!(h.edges.len(), 2);
        assert_eq!(h.stats.edges_from_records, 1);
        let x = parent_of(&h, "x");
        assert_eq!(x.ultimate_parent, LEI_Y);
        assert_eq!(x.source, "gleif");
    }

    #[test]
    fn test_cross_space_link_rejected() {
        let link = OwnershipLink {
            child: lei(LEI_X),
            parent: Identifier::parse(IdentifierKind::TaxId, "123456789").unwrap(),
            source: "sec".to_string(),
            relationship: RelationshipKind::Direct,
        };
        let h = resolve(&[create_test_entity("x", LEI_X)], &[link], &[], &HierarchyConfig::default());
        assert!(h.edges.is_empty());
        assert!(h.parents.is_empty());
        assert_eq!(h.stats.cross_space_rejected, 1);
    }

    #[test]
    fn test_crosswalk_supplies_missing_identifier() {
        let n = Normalizer::default();
        let f7 = EntityRecord::new("f7:1", "f7", "Acme", &n).with_parent(IdentifierKind::Lei, LEI_Y);
        let unplaced = EntityRecord::new("f7:2", "f7", "Bolt", &n).with_parent(IdentifierKind::Lei, LEI_Y);
        let crosswalk = vec![CrosswalkRecord {
            entity_id: "f7:1".to_string(),
            source: "f7".to_string(),
            tax_id: None,
            registry_number: None,
            lei: Some(LEI_X.to_string()),
            ticker: None,
            linked_ids: vec!["gleif:1".to_string()],
            join_method: crate::crosswalk::JoinMethod::ExactIdentifier,
            confidence: ConfidenceTier::High,
        }];

        let h = resolve(&[f7, unplaced], &[], &crosswalk, &HierarchyConfig::default());
        let acme = parent_of(&h, "f7:1");
        assert_eq!(acme.ultimate_parent, LEI_Y);
        assert_eq!(h.edges[0].tier, ConfidenceTier::Medium);
        assert_eq!(h.stats.unplaced, 1);
    }

    #[test]
    fn test_name_state_join_does_not_place_record() {
        let n = Normalizer::default();
        let f7 = EntityRecord::new("f7:1", "f7", "Acme", &n).with_parent(IdentifierKind::Lei, LEI_Y);
        let crosswalk = vec![CrosswalkRecord {
            entity_id: "f7:1".to_string(),
            source: "f7".to_string(),
            tax_id: None,
            registry_number: None,
            lei: Some(LEI_X.to_string()),
            ticker: None,
            linked_ids: vec!["gleif:1".to_string()],
            join_method: crate::crosswalk::JoinMethod::NameJurisdiction,
            confidence: ConfidenceTier::Medium,
        }];

        let h = resolve(&[f7], &[], &crosswalk, &HierarchyConfig::default());
        assert!(h.edges.is_empty());
        assert!(h.parents.is_empty());
        assert_eq!(h.stats.unplaced, 1);
    }

    #[test]
    fn test_cycle_from_record_parents() {
        let entities = vec![
            create_test_entity("x", LEI_X).with_parent(IdentifierKind::Lei, LEI_Y),
            create_test_entity("y", LEI_Y).with_parent(IdentifierKind::Lei, LEI_Z),
            create_test_entity("z", LEI_Z).with_parent(IdentifierKind::Lei, LEI_X),
        ];
        let h = resolve(&entities, &[], &[], &HierarchyConfig::default());

        assert_eq!(h.stats.edges_from_records, 3);
        assert!(h.edges.iter().all(|e| e.tier == ConfidenceTier::Medium));

        let x = parent_of(&h, "x");
        assert_eq!(x.depth, 3);
        assert_eq!(x.ultimate_parent, LEI_Z);
        assert_eq!(x.ultimate_parent_entity.as_deref(), Some("z"));
        assert!(x.cycle_truncated);
        assert!(!x.hop_capped);
        assert_eq!(h.stats.cycles, 3);
    }

    #[test]
    fn test_walk_without_parent() {
        let chosen = HashMap::new();
        assert!(walk(LEI_X, &chosen, 10).is_none());
    }
}
