//! Property-based tests for the R*-tree's structural invariants.

use proptest::prelude::*;
use rstar_index::{Mbr, RTree, RectQuery, WithMbr};

type Item = WithMbr<f64, 2, usize>;

prop_compose! {
    fn arb_rect()(x in 0.0..100.0f64, y in 0.0..100.0f64, w in 0.1..10.0f64, h in 0.1..10.0f64) -> Mbr<f64, 2> {
        Mbr::from_corners([x, y], [x + w, y + h])
    }
}

proptest! {
    #[test]
    fn tree_stays_structurally_valid_through_inserts(rects in prop::collection::vec(arb_rect(), 1..200)) {
        let mut tree: RTree<f64, 2, Item> = RTree::new(3, 8).unwrap();
        for (i, rect) in rects.iter().enumerate() {
            tree.insert(WithMbr::new(rect.clone(), i));
        }
        prop_assert_eq!(tree.len(), rects.len());
        prop_assert!(tree.verify().is_ok());
    }

    #[test]
    fn overlap_query_never_misses_a_contained_candidate(rects in prop::collection::vec(arb_rect(), 5..150)) {
        let mut tree: RTree<f64, 2, Item> = RTree::new(3, 8).unwrap();
        for (i, rect) in rects.iter().enumerate() {
            tree.insert(WithMbr::new(rect.clone(), i));
        }
        let query_region = Mbr::from_corners([20.0, 20.0], [60.0, 60.0]);
        let found: std::collections::HashSet<usize> = tree
            .iter_query(RectQuery::Overlaps(query_region.clone()))
            .map(|(_, _, entry)| entry.item)
            .collect();
        for (i, rect) in rects.iter().enumerate() {
            if query_region.intersects(rect) {
                prop_assert!(found.contains(&i), "missed overlapping rect {}", i);
            } else {
                prop_assert!(!found.contains(&i), "spuriously matched non-overlapping rect {}", i);
            }
        }
    }

    #[test]
    fn erasing_every_item_empties_the_tree_and_stays_valid(
        rects in prop::collection::vec(arb_rect(), 1..120),
        seed in 0u64..10_000,
    ) {
        let mut tree: RTree<f64, 2, Item> = RTree::new(3, 8).unwrap();
        let mut ids = Vec::new();
        for (i, rect) in rects.iter().enumerate() {
            ids.push(tree.insert(WithMbr::new(rect.clone(), i)));
        }
        // deterministic pseudo-shuffle of removal order, keyed by `seed`
        let mut order: Vec<usize> = (0..ids.len()).collect();
        let mut state = seed.wrapping_add(1);
        for i in (1..order.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let j = (state >> 33) as usize % (i + 1);
            order.swap(i, j);
        }
        for &idx in &order {
            tree.erase(ids[idx]);
            prop_assert!(tree.verify().is_ok());
        }
        prop_assert!(tree.is_empty());
    }

    #[test]
    fn retain_keeps_exactly_the_matching_predicate(rects in prop::collection::vec(arb_rect(), 1..150)) {
        let mut tree: RTree<f64, 2, Item> = RTree::new(3, 8).unwrap();
        for (i, rect) in rects.iter().enumerate() {
            tree.insert(WithMbr::new(rect.clone(), i));
        }
        let removed = tree.retain(RectQuery::ContainedBy(Mbr::largest()), |entry| entry.item % 2 == 0);
        prop_assert!(removed.iter().all(|(_, entry)| entry.item % 2 != 0));
        prop_assert!(tree.verify().is_ok());
        let remaining: Vec<usize> = tree.iter().map(|(_, _, entry)| entry.item).collect();
        prop_assert!(remaining.iter().all(|i| i % 2 == 0));
        prop_assert_eq!(remaining.len() + removed.len(), rects.len());
    }

    #[test]
    fn rebuild_after_bulk_mutation_preserves_items(rects in prop::collection::vec(arb_rect(), 1..150)) {
        let mut tree: RTree<f64, 2, Item> = RTree::new(3, 8).unwrap();
        let mut ids = Vec::new();
        for (i, rect) in rects.iter().enumerate() {
            ids.push(tree.insert(WithMbr::new(rect.clone(), i)));
        }
        for (i, id) in ids.iter().enumerate() {
            if i % 5 == 0 {
                tree.erase(*id);
            }
        }
        tree.rebuild();
        prop_assert!(tree.verify().is_ok());
        let remaining: std::collections::HashSet<usize> = tree.iter().map(|(_, _, entry)| entry.item).collect();
        prop_assert_eq!(remaining.len(), tree.len());
    }
}
