// 🧩 Clusterer - union-find over labeled pairs
//
// Merge groups: connected components of AutoMerge / Confirmed pairs.
// Location groups: connected components of MultiLocation pairs, built on a
// separate union-find so that a multi-location link never pulls two records
// into the same merge.

use crate::classify::{ClassifiedPair, Label};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

// ============================================================================
// UNION-FIND
// ============================================================================

/// Disjoint sets over string ids (path compression + union by rank)
#[derive(Debug, Clone, Default)]
pub struct UnionFind {
    index: HashMap<String, usize>,
    ids: Vec<String>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an id as its own singleton set (no-op if known)
    pub fn add(&mut self, id: &str) -> usize {
        if let Some(&slot) = self.index.get(id) {
            return slot;
        }
        let slot = self.ids.len();
        self.index.insert(id.to_string(), slot);
        self.ids.push(id.to_string());
        self.parent.push(slot);
        self.rank.push(0);
        slot
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn find_slot(&mut self, slot: usize) -> usize {
        let mut root = slot;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = slot;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Representative id of the set containing `id`
    pub fn find(&mut self, id: &str) -> Option<String> {
        let slot = *self.index.get(id)?;
        let root = self.find_slot(slot);
        Some(self.ids[root].clone())
    }

    /// Join the sets of `a` and `b`, registering either if new
    pub fn union(&mut self, a: &str, b: &str) {
        let a = self.add(a);
        let b = self.add(b);
        let (ra, rb) = (self.find_slot(a), self.find_slot(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    pub fn connected(&mut self, a: &str, b: &str) -> bool {
        match (self.index.get(a).copied(), self.index.get(b).copied()) {
            (Some(a), Some(b)) => self.find_slot(a) == self.find_slot(b),
            _ => a == b,
        }
    }

    /// Components with at least `min_size` members; members sorted, groups
    /// ordered by their smallest member
    pub fn components(&mut self, min_size: usize) -> Vec<Vec<String>> {
        let mut by_root: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for slot in 0..self.ids.len() {
            let root = self.find_slot(slot);
            by_root.entry(root).or_default().push(self.ids[slot].clone());
        }

        let mut groups: Vec<Vec<String>> = by_root
            .into_values()
            .filter(|members| members.len() >= min_size)
            .map(|mut members| {
                members.sort();
                members
            })
            .collect();
        groups.sort();
        groups
    }
}

// ============================================================================
// GROUPS
// ============================================================================

/// Components (size ≥ 2) of the merge-labeled pairs
pub fn merge_components(pairs: &[ClassifiedPair]) -> Vec<Vec<String>> {
    let mut uf = UnionFind::new();
    for p in pairs.iter().filter(|p| p.label.is_merge()) {
        uf.union(&p.pair.id1, &p.pair.id2);
    }
    uf.components(2)
}

/// Components (size ≥ 2) of MultiLocation pairs after remapping members
/// deleted by a merge onto their keeper
pub fn location_components(pairs: &[ClassifiedPair], remap: &HashMap<String, String>) -> Vec<Vec<String>> {
    let resolve = |id: &str| remap.get(id).cloned().unwrap_or_else(|| id.to_string());

    let mut uf = UnionFind::new();
    for p in pairs.iter().filter(|p| p.label == Label::MultiLocation) {
        let (a, b) = (resolve(&p.pair.id1), resolve(&p.pair.id2));
        if a != b {
            uf.union(&a, &b);
        }
    }
    uf.components(2)
}

/// Establishments of one employer, linked but kept as separate records
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationGroup {
    /// Stable across runs with the same membership
    pub group_id: String,
    pub representative: String,
    pub members: Vec<String>,
}

impl LocationGroup {
    pub fn new(mut members: Vec<String>, representative: String) -> Self {
        members.sort();
        members.dedup();
        LocationGroup {
            group_id: group_id(&members),
            representative,
            members,
        }
    }
}

/// SHA-256 over the sorted member ids
pub fn group_id(sorted_members: &[String]) -> String {
    let mut hasher = Sha256::new();
    for id in sorted_members {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================
