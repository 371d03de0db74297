// 🧱 Blocking Index - bound the comparison space
//
// Entities are only compared when they share a block key under at least one
// configured strategy. Candidate sets from all strategies are unioned, each
// pair remembering which strategies surfaced it and which signals those
// strategies feed.
//
// Entities without a state cannot be indexed; they go through a separate
// catch-all pass keyed on name prefix alone, capped per bucket and overall.

use crate::config::{BlockingConfig, SignalSet, StrategyConfig, StrategyKind};
use crate::entities::EntityRecord;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub type BlockKey = String;

/// Label recorded for pairs from the catch-all pass
pub const CATCH_ALL: &str = "catch_all";

// ============================================================================
// CANDIDATES
// ============================================================================

/// Where a candidate pair came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairOrigin {
    pub signals: SignalSet,
    pub strategies: Vec<&'static str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlockingStats {
    pub entities_indexed: usize,
    /// Excluded: empty normalized name (MissingField)
    pub missing_name: usize,
    /// Routed to the catch-all pass: no state (MissingField)
    pub missing_state: usize,
    pub oversized_blocks_skipped: usize,
    pub catch_all_pairs: usize,
    pub catch_all_truncated: bool,
    pub pairs_per_strategy: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    /// Keyed by (id1, id2) with id1 < id2
    pub pairs: BTreeMap<(String, String), PairOrigin>,
    pub stats: BlockingStats,
}

impl CandidateSet {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn add(&mut self, a: &str, b: &str, signals: SignalSet, strategy: &'static str) -> bool {
        if a == b {
            return false;
        }
        let key = ordered_pair(a, b);
        match self.pairs.get_mut(&key) {
            Some(origin) => {
                origin.signals = origin.signals.union(signals);
                if !origin.strategies.contains(&strategy) {
                    origin.strategies.push(strategy);
                }
                false
            }
            None => {
                self.pairs.insert(
                    key,
                    PairOrigin {
                        signals,
                        strategies: vec![strategy],
                    },
                );
                true
            }
        }
    }
}

/// Normalize a pair so that id1 < id2
pub fn ordered_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// First `len` non-space characters of a normalized name
pub fn name_prefix(normalized: &str, len: usize) -> String {
    normalized
        .chars()
        .filter(|c| !c.is_whitespace())
        .take(len)
        .collect()
}

// ============================================================================
// BLOCKING INDEX
// ============================================================================

pub struct BlockingIndex<'a> {
    config: &'a BlockingConfig,
}

impl<'a> BlockingIndex<'a> {
    pub fn new(config: &'a BlockingConfig) -> Self {
        BlockingIndex { config }
    }

    /// Block key for one entity under one strategy
    ///
    /// None when the entity lacks a field the strategy needs.
    pub fn block_key(&self, strategy: &StrategyConfig, entity: &EntityRecord) -> Option<BlockKey> {
        if !entity.has_name() {
            return None;
        }
        let state = entity.state.as_deref()?;
        match strategy.kind {
            StrategyKind::StatePrefix => {
                let len = strategy
                    .prefix_length
                    .unwrap_or(self.config.block_prefix_length);
                Some(format!("{state}|{}", name_prefix(&entity.name_normalized, len)))
            }
            StrategyKind::StateCity => {
                let city = entity.city.as_deref()?;
                Some(format!("{state}|{city}"))
            }
            StrategyKind::State => Some(state.to_string()),
        }
    }

    /// Block key → entity ids for one strategy
    pub fn blocks(
        &self,
        entities: &[EntityRecord],
        strategy: &StrategyConfig,
    ) -> BTreeMap<BlockKey, Vec<String>> {
        let mut blocks: BTreeMap<BlockKey, Vec<String>> = BTreeMap::new();
        for entity in entities {
            if let Some(key) = self.block_key(strategy, entity) {
                blocks.entry(key).or_default().push(entity.entity_id.clone());
            }
        }
        blocks
    }

    /// Union of candidate pairs across every strategy plus the catch-all pass
    pub fn candidate_pairs(&self, entities: &[EntityRecord]) -> CandidateSet {
        let mut set = CandidateSet::default();

        set.stats.missing_name = entities.iter().filter(|e| !e.has_name()).count();
        set.stats.missing_state = entities
            .iter()
            .filter(|e| e.has_name() && e.state.is_none())
            .count();
        set.stats.entities_indexed = entities.len() - set.stats.missing_name - set.stats.missing_state;

        for strategy in &self.config.strategies {
            let label = strategy.kind.as_str();
            let mut added = 0usize;

            for (key, ids) in self.blocks(entities, strategy) {
                if ids.len() > self.config.max_block_size {
                    warn!(
                        strategy = label,
                        block = %key,
                        size = ids.len(),
                        "skipping oversized block"
                    );
                    set.stats.oversized_blocks_skipped += 1;
                    continue;
                }
                for i in 0..ids.len() {
                    for j in (i + 1)..ids.len() {
                        if set.add(&ids[i], &ids[j], strategy.signals, label) {
                            added += 1;
                        }
                    }
                }
            }

            debug!(strategy = label, new_pairs = added, "blocking strategy done");
            *set.stats.pairs_per_strategy.entry(label.to_string()).or_insert(0) += added;
        }

        self.catch_all_pass(entities, &mut set);
        set
    }

    /// Entities without a state, compared by name prefix against everything
    /// sharing that prefix
    fn catch_all_pass(&self, entities: &[EntityRecord], set: &mut CandidateSet) {
        if set.stats.missing_state == 0 {
            return;
        }

        let len = self.config.block_prefix_length;
        let mut buckets: BTreeMap<String, Vec<&EntityRecord>> = BTreeMap::new();
        for entity in entities.iter().filter(|e| e.has_name()) {
            buckets
                .entry(name_prefix(&entity.name_normalized, len))
                .or_default()
                .push(entity);
        }

        let mut added = 0usize;
        'buckets: for (prefix, members) in buckets {
            if !members.iter().any(|e| e.state.is_none()) {
                continue;
            }
            if members.len() > self.config.catch_all_max_block {
                warn!(prefix = %prefix, size = members.len(), "skipping oversized catch-all bucket");
                set.stats.oversized_blocks_skipped += 1;
                continue;
            }
            for i in 0..members.len() {
                for j in (i + 1)..members.len() {
                    let (a, b) = (members[i], members[j]);
                    if a.state.is_some() && b.state.is_some() {
                        continue;
                    }
                    if added >= self.config.catch_all_max_pairs {
                        warn!(cap = self.config.catch_all_max_pairs, "catch-all pair cap reached");
                        set.stats.catch_all_truncated = true;
                        break 'buckets;
                    }
                    if set.add(&a.entity_id, &b.entity_id, SignalSet::Both, CATCH_ALL) {
                        added += 1;
                    }
                }
            }
        }

        set.stats.catch_all_pairs = added;
        set.stats
            .pairs_per_strategy
            .insert(CATCH_ALL.to_string(), added);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;

    fn entity(id: &str, name: &str, state: &str, city: &str) -> EntityRecord {
        let n = Normalizer::default();
        EntityRecord::new(id, "test", name, &n)
            .with_state(state, &n)
            .with_city(city, &n)
    }

    fn strategy(kind: StrategyKind, signals: SignalSet) -> StrategyConfig {
        StrategyConfig {
            kind,
            signals,
            prefix_length: None,
        }
    }

    #[test]
    fn test_state_prefix_key() {
        let config = BlockingConfig::default();
        let index = BlockingIndex::new(&config);
        let e = entity("a", "Acme Foods, Inc.", "NY", "Buffalo");
        let s = strategy(StrategyKind::StatePrefix, SignalSet::Both);
        assert_eq!(index.block_key(&s, &e).unwrap(), "NY|acm");

        let mut long = s.clone();
        long.prefix_length = Some(5);
        assert_eq!(index.block_key(&long, &e).unwrap(), "NY|acmef");
    }

    #[test]
    fn test_missing_state_has_no_key() {
        let config = BlockingConfig::default();
        let index = BlockingIndex::new(&config);
        let e = entity("a", "Acme Foods", "", "Buffalo");
        let s = strategy(StrategyKind::State, SignalSet::Both);
        assert!(index.block_key(&s, &e).is_none());
    }

    #[test]
    fn test_blocks_group_by_key() {
        let config = BlockingConfig::default();
        let index = BlockingIndex::new(&config);
        let entities = vec![
            entity("a", "Acme Foods", "NY", "Buffalo"),
            entity("b", "Acme Foods LLC", "NY", "Rochester"),
            entity("c", "Acme Foods", "PA", "Erie"),
            entity("d", "Zenith Steel", "NY", "Buffalo"),
        ];
        let s = strategy(StrategyKind::StatePrefix, SignalSet::Both);
        let blocks = index.blocks(&entities, &s);
        assert_eq!(blocks["NY|acm"], vec!["a", "b"]);
        assert_eq!(blocks["PA|acm"], vec!["c"]);
        assert_eq!(blocks["NY|zen"], vec!["d"]);
    }

    #[test]
    fn test_strategies_are_unioned() {
        let config = BlockingConfig::default();
        let index = BlockingIndex::new(&config);
        let entities = vec![
            entity("a", "Acme Foods", "NY", "Buffalo"),
            entity("b", "Acme Foods LLC", "NY", "Rochester"),
            // shares both the prefix and the city with "a"
            entity("c", "ACME-Foods Holdings", "NY", "Buffalo"),
            entity("d", "Buffalo Acme Foods", "NY", "Buffalo"),
        ];
        let set = index.candidate_pairs(&entities);

        let ab = &set.pairs[&ordered_pair("a", "b")];
        assert_eq!(ab.signals, SignalSet::Both);
        assert_eq!(ab.strategies, vec!["state_prefix"]);

        let ad = &set.pairs[&ordered_pair("a", "d")];
        assert_eq!(ad.signals, SignalSet::Probabilistic);
        assert_eq!(ad.strategies, vec!["state_city"]);

        let ac = &set.pairs[&ordered_pair("a", "c")];
        assert_eq!(ac.signals, SignalSet::Both);
        assert_eq!(ac.strategies, vec!["state_prefix", "state_city"]);

        assert!(!set.pairs.contains_key(&ordered_pair("b", "d")));
    }

    #[test]
    fn test_pairs_are_ordered() {
        let config = BlockingConfig::default();
        let index = BlockingIndex::new(&config);
        let entities = vec![
            entity("z", "Acme Foods", "NY", "Buffalo"),
            entity("m", "Acme Foods", "NY", "Buffalo"),
        ];
        let set = index.candidate_pairs(&entities);
        for (id1, id2) in set.pairs.keys() {
            assert!(id1 < id2);
        }
    }

    #[test]
    fn test_oversized_block_is_skipped() {
        let config = BlockingConfig {
            max_block_size: 2,
            strategies: vec![strategy(StrategyKind::State, SignalSet::Both)],
            ..BlockingConfig::default()
        };
        let index = BlockingIndex::new(&config);
        let entities = vec![
            entity("a", "Acme", "NY", ""),
            entity("b", "Bolt", "NY", ""),
            entity("c", "Cord", "NY", ""),
        ];
        let set = index.candidate_pairs(&entities);
        assert!(set.is_empty());
        assert_eq!(set.stats.oversized_blocks_skipped, 1);
    }

    #[test]
    fn test_catch_all_pass_handles_missing_state() {
        let config = BlockingConfig::default();
        let index = BlockingIndex::new(&config);
        let entities = vec![
            entity("a", "Acme Foods", "NY", "Buffalo"),
            entity("b", "Acme Foods", "", ""),
            entity("c", "Acme Foods Co", "", ""),
            entity("d", "Inc.", "NY", ""),
        ];
        let set = index.candidate_pairs(&entities);

        assert_eq!(set.stats.missing_state, 2);
        assert_eq!(set.stats.missing_name, 1);
        assert_eq!(set.stats.entities_indexed, 1);
        assert_eq!(set.stats.catch_all_pairs, 3);
        assert_eq!(set.pairs[&ordered_pair("a", "b")].strategies, vec![CATCH_ALL]);
        assert!(set.pairs.contains_key(&ordered_pair("b", "c")));
        assert!(!set.pairs.keys().any(|(x, y)| x == "d" || y == "d"));
    }

    #[test]
    fn test_catch_all_pair_cap() {
        let config = BlockingConfig {
            catch_all_max_pairs: 2,
            ..BlockingConfig::default()
        };
        let index = BlockingIndex::new(&config);
        let entities: Vec<EntityRecord> = (0..5)
            .map(|i| entity(&format!("e{i}"), "Acme Foods", "", ""))
            .collect();
        let set = index.candidate_pairs(&entities);
        assert_eq!(set.stats.catch_all_pairs, 2);
        assert!(set.stats.catch_all_truncated);
    }
}
