// 👑 Keeper Selector - which record of a merge group survives
//
// Total order: weight desc, reference count desc, name asc, entity id asc.
// The result does not depend on input order.

use serde::Serialize;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeeperCandidate {
    pub entity_id: String,
    pub name: String,
    /// Missing weight sorts below any known weight
    pub weight: Option<i64>,
    /// Rows across reference tables pointing at the entity
    pub reference_count: i64,
}

/// `Less` means `a` is the better keeper
pub fn keeper_order(a: &KeeperCandidate, b: &KeeperCandidate) -> Ordering {
    b.weight
        .cmp(&a.weight)
        .then_with(|| b.reference_count.cmp(&a.reference_count))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.entity_id.cmp(&b.entity_id))
}

/// Best candidate, or None for an empty group
pub fn select_keeper(candidates: &[KeeperCandidate]) -> Option<&KeeperCandidate> {
    candidates.iter().min_by(|a, b| keeper_order(a, b))
}

/// A merge group with its keeper chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeGroup {
    pub keeper: String,
    /// Sorted
    pub to_delete: Vec<String>,
}

impl MergeGroup {
    /// None for an empty group
    pub fn from_candidates(candidates: &[KeeperCandidate]) -> Option<Self> {
        let keeper = select_keeper(candidates)?.entity_id.clone();
        let mut to_delete: Vec<String> = candidates
            .iter()
            .map(|c| c.entity_id.clone())
            .filter(|id| *id != keeper)
            .collect();
        to_delete.sort();
        to_delete.dedup();
        Some(MergeGroup { keeper, to_delete })
    }

    pub fn members(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.keeper).chain(self.to_delete.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_candidate(id: &str, name: &str, weight: Option<i64>, refs: i64) -> KeeperCandidate {
        KeeperCandidate {
            entity_id: id.to_string(),
            name: name.to_string(),
            weight,
            reference_count: refs,
        }
    }

    #[test]
    fn test_weight_wins_first() {
        let group = vec![
            create_test_candidate("a", "Acme", Some(10), 50),
            create_test_candidate("b", "Acme", Some(200), 0),
        ];
        assert_eq!(select_keeper(&group).unwrap().entity_id, "b");
    }

    #[test]
    fn test_missing_weight_sorts_last() {
        let group = vec![
            create_test_candidate("a", "Acme", None, 50),
            create_test_candidate("b", "Acme", Some(1), 0),
        ];
        assert_eq!(select_keeper(&group).unwrap().entity_id, "b");
    }

    #[test]
    fn test_tie_breaks() {
        let by_refs = vec![
            create_test_candidate("a", "Acme", Some(5), 1),
            create_test_candidate("b", "Acme", Some(5), 3),
        ];
        assert_eq!(select_keeper(&by_refs).unwrap().entity_id, "b");

        let by_name = vec![
            create_test_candidate("a", "Zeta Acme", Some(5), 3),
            create_test_candidate("b", "Acme", Some(5), 3),
        ];
        assert_eq!(select_keeper(&by_name).unwrap().entity_id, "b");

        let by_id = vec![
            create_test_candidate("b", "Acme", Some(5), 3),
            create_test_candidate("a", "Acme", Some(5), 3),
        ];
        assert_eq!(select_keeper(&by_id).unwrap().entity_id, "a");
    }

    #[test]
    fn test_keeper_is_permutation_invariant() {
        let base = vec![
            create_test_candidate("a", "Acme", Some(5), 3),
            create_test_candidate("b", "Acme", Some(5), 3),
            create_test_candidate("c", "Acme Foods", Some(5), 3),
            create_test_candidate("d", "Acme", None, 9),
        ];
        let expected = select_keeper(&base).unwrap().entity_id.clone();

        let orders: [[usize; 4]; 6] = [
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [1, 0, 3, 2],
            [2, 3, 0, 1],
            [3, 0, 2, 1],
            [1, 3, 0, 2],
        ];
        for order in orders {
            let shuffled: Vec<_> = order.iter().map(|&i| base[i].clone()).collect();
            assert_eq!(select_keeper(&shuffled).unwrap().entity_id, expected);
        }
        assert_eq!(expected, "a");
    }

    #[test]
    fn test_merge_group_from_candidates() {
        let group = MergeGroup::from_candidates(&[
            create_test_candidate("c", "Acme", Some(1), 0),
            create_test_candidate("a", "Acme", Some(9), 0),
            create_test_candidate("b", "Acme", Some(1), 0),
        ])
        .unwrap();
        assert_eq!(group.keeper, "a");
        assert_eq!(group.to_delete, vec!["b", "c"]);
        assert_eq!(group.members().count(), 3);
        assert!(MergeGroup::from_candidates(&[]).is_none());
    }
}
