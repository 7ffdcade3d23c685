//! Property-based tests for weighted sets and consolidation bases.

use std::collections::{BTreeMap, HashMap, HashSet};

use proptest::prelude::*;
use rollup::dimension::{Dimension, DimensionId, DimensionKind};
use rollup::element::{ElementId, ElementType};
use rollup::weights::WeightedSet;

// =============================================================================
// Test helpers
// =============================================================================

/// Dyadic weights only: sums and products stay exact, so incremental and
/// from-scratch computations must agree bit for bit.
fn weight() -> impl Strategy<Value = f64> {
    return prop_oneof![Just(1.0), Just(2.0), Just(0.5), Just(-1.0), Just(3.0), Just(-0.5)];
}

#[derive(Clone, Debug)]
enum SetOp {
    Set(u64, f64),
    Add(u64, f64),
    Remove(u64),
}

fn arbitrary_set_op() -> impl Strategy<Value = SetOp> {
    // A small id range forces runs to merge, split, and cancel.
    prop_oneof![
        (0u64..24, weight()).prop_map(|(id, w)| SetOp::Set(id, w)),
        (0u64..24, weight()).prop_map(|(id, w)| SetOp::Add(id, w)),
        (0u64..24).prop_map(SetOp::Remove),
    ]
}

/// Flatten the consolidation graph from scratch, the slow obvious way.
fn naive_base(dimension: &Dimension, id: ElementId) -> HashMap<u64, f64> {
    let element = dimension.element_by_id(id).unwrap();
    if element.children.is_empty() {
        return HashMap::from([(id.raw(), 1.0)]);
    }
    let mut out = HashMap::new();
    for (child, edge) in &element.children {
        for (leaf, contribution) in naive_base(dimension, *child) {
            *out.entry(leaf).or_insert(0.0) += edge * contribution;
        }
    }
    out.retain(|_, w| *w != 0.0);
    return out;
}

fn cached_base(dimension: &Dimension, id: ElementId) -> HashMap<u64, f64> {
    return dimension
        .element_by_id(id)
        .unwrap()
        .base
        .iter()
        .map(|(leaf, w)| (leaf.raw(), w))
        .collect();
}

// =============================================================================
// Weighted set vs. a map model
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn weighted_set_matches_map_model(ops in prop::collection::vec(arbitrary_set_op(), 1..60)) {
        let mut set = WeightedSet::new();
        let mut model: BTreeMap<u64, f64> = BTreeMap::new();

        for op in &ops {
            match *op {
                SetOp::Set(id, w) => {
                    set.set(ElementId::new(id), w);
                    if w == 0.0 {
                        model.remove(&id);
                    } else {
                        model.insert(id, w);
                    }
                }
                SetOp::Add(id, w) => {
                    set.add(ElementId::new(id), w);
                    let total = model.get(&id).copied().unwrap_or(0.0) + w;
                    if total == 0.0 {
                        model.remove(&id);
                    } else {
                        model.insert(id, total);
                    }
                }
                SetOp::Remove(id) => {
                    set.remove(ElementId::new(id));
                    model.remove(&id);
                }
            }
        }

        prop_assert_eq!(set.len(), model.len() as u64);
        let flattened: BTreeMap<u64, f64> = set.iter().map(|(id, w)| (id.raw(), w)).collect();
        prop_assert_eq!(flattened, model);
    }

    #[test]
    fn sub_scaled_inverts_add_scaled(
        base_ops in prop::collection::vec(arbitrary_set_op(), 0..40),
        delta_ops in prop::collection::vec(arbitrary_set_op(), 1..40),
        factor in weight(),
    ) {
        let apply = |ops: &[SetOp]| {
            let mut set = WeightedSet::new();
            for op in ops {
                match *op {
                    SetOp::Set(id, w) => set.set(ElementId::new(id), w),
                    SetOp::Add(id, w) => set.add(ElementId::new(id), w),
                    SetOp::Remove(id) => set.remove(ElementId::new(id)),
                }
            }
            set
        };
        let base = apply(&base_ops);
        let delta = apply(&delta_ops);

        let mut set = base.clone();
        set.add_scaled(&delta, factor);
        set.sub_scaled(&delta, factor);
        prop_assert_eq!(set, base);
    }

    #[test]
    fn compaction_preserves_content(ops in prop::collection::vec(arbitrary_set_op(), 1..60)) {
        let mut set = WeightedSet::new();
        for op in &ops {
            match *op {
                SetOp::Set(id, w) => set.set(ElementId::new(id), w),
                SetOp::Add(id, w) => set.add(ElementId::new(id), w),
                SetOp::Remove(id) => set.remove(ElementId::new(id)),
            }
        }
        let mut compacted = set.clone();
        compacted.compact();
        prop_assert!(compacted.run_count() <= set.run_count());
        prop_assert_eq!(compacted, set);
    }
}

// =============================================================================
// Consolidation bases vs. from-scratch flattening
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Link a random DAG (edges always point to earlier elements, so no
    /// cycles), then delete a random few, and require the incrementally
    /// maintained bases to equal a from-scratch flattening at every step.
    #[test]
    fn incremental_bases_match_recomputation(
        count in 3usize..10,
        raw_edges in prop::collection::vec((0usize..10, 0usize..10, weight()), 0..25),
        raw_doomed in prop::collection::vec(0usize..10, 0..3),
    ) {
        let mut dimension = Dimension::new(DimensionId::new(1), "fuzz", DimensionKind::Normal);
        let ids: Vec<ElementId> = (0..count)
            .map(|i| dimension.add_element(None, &format!("e{i}"), ElementType::Numeric).unwrap())
            .collect();

        let mut seen = HashSet::new();
        for (parent, child, edge) in &raw_edges {
            let parent = parent % count;
            let child = child % count;
            if child >= parent || !seen.insert((parent, child)) {
                continue;
            }
            dimension.add_children(ids[parent], &[(ids[child], *edge)], true).unwrap();
        }

        for id in &ids {
            prop_assert_eq!(cached_base(&dimension, *id), naive_base(&dimension, *id));
        }

        let doomed: Vec<ElementId> = raw_doomed
            .iter()
            .map(|i| ids[i % count])
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if !doomed.is_empty() {
            dimension.delete_elements(&doomed).unwrap();
        }
        dimension.ensure_elements_info();

        let mut max_level = 0;
        for element in dimension.elements() {
            let id = element.id;
            prop_assert_eq!(cached_base(&dimension, id), naive_base(&dimension, id));
            max_level = max_level.max(element.level);
        }
        prop_assert_eq!(dimension.max_level(), max_level);
    }
}
