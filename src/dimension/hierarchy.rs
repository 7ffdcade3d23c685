//! Hierarchy invariants: cycle detection, string-consolidation cascades,
//! and the level/indent/depth/base-element recompute passes.
//!
//! The consolidation graph is a DAG of id references inside one
//! [`ElementStore`]. All traversals here are explicit worklists over ids;
//! nothing recurses on user-sized data.
//!
//! Two recompute directions exist:
//!
//! - **Upward** (leaves → roots): `level` and the memoized `base` weighted
//!   sets. A node's values depend only on its children, so the pass runs in
//!   reverse-topological order.
//! - **Downward** (roots → leaves): `depth` and `indent`. A node's values
//!   depend only on its parents. `indent` intentionally follows the *first*
//!   parent in insertion order while `depth` takes the max over all
//!   parents; this asymmetry is long-standing observable behavior and is
//!   pinned by a regression test.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::element::{ElementId, ElementType};
use crate::weights::WeightedSet;

use super::slots::ElementStore;

/// All ids reachable by following child edges from `roots`, including the
/// roots themselves.
pub(crate) fn descendant_closure(
    store: &ElementStore,
    roots: impl IntoIterator<Item = ElementId>,
) -> FxHashSet<ElementId> {
    let mut seen: FxHashSet<ElementId> = FxHashSet::default();
    let mut work: Vec<ElementId> = roots.into_iter().collect();
    while let Some(id) = work.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(element) = store.by_id(id) {
            work.extend(element.children.iter().map(|(child, _)| *child));
        }
    }
    return seen;
}

/// All ids reachable by following parent edges from `roots`, including the
/// roots themselves.
pub(crate) fn ancestor_closure(
    store: &ElementStore,
    roots: impl IntoIterator<Item = ElementId>,
) -> FxHashSet<ElementId> {
    let mut seen: FxHashSet<ElementId> = FxHashSet::default();
    let mut work: Vec<ElementId> = roots.into_iter().collect();
    while let Some(id) = work.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(element) = store.by_id(id) {
            work.extend(element.parents.iter().copied());
        }
    }
    return seen;
}

/// Check that linking `children` under `parent` keeps the graph acyclic.
///
/// Runs before any mutation: either the whole link is legal or nothing
/// changes. Rejects the parent appearing among its own children, repeated
/// child ids in the input, and any child whose descendant closure reaches
/// an ancestor of the parent.
pub(crate) fn cycle_check(
    store: &ElementStore,
    parent: ElementId,
    children: &[(ElementId, f64)],
) -> Result<(), String> {
    let mut proposed: FxHashSet<ElementId> = FxHashSet::default();
    for (child, _) in children {
        if *child == parent {
            return Err(format!("element {parent} cannot consolidate itself"));
        }
        if !proposed.insert(*child) {
            return Err(format!("element {child} appears twice in the child list"));
        }
    }
    let ancestors = ancestor_closure(store, [parent]);
    let descendants = descendant_closure(store, proposed.iter().copied());
    if let Some(id) = descendants.iter().find(|id| ancestors.contains(id)) {
        return Err(format!("element {id} is both ancestor and descendant of {parent}"));
    }
    return Ok(());
}

/// Is this element a string leaf or a string consolidation?
pub(crate) fn is_string_like(store: &ElementStore, id: ElementId) -> bool {
    match store.by_id(id) {
        Some(element) => {
            return element.kind == ElementType::String || element.string_consolidation;
        }
        None => return false,
    }
}

/// Recompute `string_consolidation` for `start`, cascading to ancestors
/// only while the flag actually flips. Returns the ids whose flag changed.
pub(crate) fn cascade_string_consolidation(
    store: &mut ElementStore,
    start: ElementId,
) -> Vec<ElementId> {
    let mut changed = Vec::new();
    let mut work: Vec<ElementId> = vec![start];
    while let Some(id) = work.pop() {
        let Some(element) = store.by_id(id) else { continue };
        let children: SmallVec<[ElementId; 4]> =
            element.children.iter().map(|(child, _)| *child).collect();
        let flag = children.iter().any(|child| is_string_like(store, *child));
        let element = store
            .by_id_mut(id)
            .unwrap_or_else(|| unreachable!("element vanished mid-cascade"));
        if element.string_consolidation == flag {
            continue;
        }
        element.string_consolidation = flag;
        changed.push(id);
        let parents: SmallVec<[ElementId; 4]> = store
            .by_id(id)
            .map(|element| element.parents.clone())
            .unwrap_or_default();
        work.extend(parents);
    }
    return changed;
}

/// Reverse-topological order (children before parents) of `affected`,
/// treating elements outside the set as already up to date.
fn upward_order(store: &ElementStore, affected: &FxHashSet<ElementId>) -> Vec<ElementId> {
    return kahn_order(store, affected, /* follow_children: */ true);
}

/// Topological order (parents before children) of `affected`.
fn downward_order(store: &ElementStore, affected: &FxHashSet<ElementId>) -> Vec<ElementId> {
    return kahn_order(store, affected, /* follow_children: */ false);
}

fn kahn_order(
    store: &ElementStore,
    affected: &FxHashSet<ElementId>,
    follow_children: bool,
) -> Vec<ElementId> {
    let mut pending: rustc_hash::FxHashMap<ElementId, usize> = rustc_hash::FxHashMap::default();
    let mut ready: Vec<ElementId> = Vec::new();
    for id in affected {
        let count = match store.by_id(*id) {
            Some(element) if follow_children => {
                element.children.iter().filter(|(child, _)| affected.contains(child)).count()
            }
            Some(element) => {
                element.parents.iter().filter(|parent| affected.contains(parent)).count()
            }
            None => 0,
        };
        if count == 0 {
            ready.push(*id);
        } else {
            pending.insert(*id, count);
        }
    }
    let mut order = Vec::with_capacity(affected.len());
    while let Some(id) = ready.pop() {
        order.push(id);
        let next: SmallVec<[ElementId; 4]> = match store.by_id(id) {
            Some(element) if follow_children => element.parents.clone(),
            Some(element) => element.children.iter().map(|(child, _)| *child).collect(),
            None => SmallVec::new(),
        };
        for dependent in next {
            if let Some(count) = pending.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    pending.remove(&dependent);
                    ready.push(dependent);
                }
            }
        }
    }
    debug_assert!(pending.is_empty(), "cycle in consolidation graph");
    return order;
}

/// Recompute one element's `level` and `base` from its children, which
/// must already be up to date.
fn refresh_one_upward(store: &mut ElementStore, id: ElementId) {
    let Some(element) = store.by_id(id) else { return };
    let children = element.children.clone();
    if children.is_empty() {
        let mut base = WeightedSet::new();
        base.set(id, 1.0);
        let element = store.by_id_mut(id).unwrap_or_else(|| unreachable!());
        element.level = 0;
        element.base = base;
        return;
    }
    let mut level = 0;
    let mut base = WeightedSet::new();
    for (child, weight) in &children {
        if let Some(child_element) = store.by_id(*child) {
            level = level.max(child_element.level + 1);
            base.add_scaled(&child_element.base, *weight);
        }
    }
    base.compact();
    let element = store.by_id_mut(id).unwrap_or_else(|| unreachable!());
    element.level = level;
    element.base = base;
}

/// Recompute `level` only (not `base`) for `seeds` and everything above
/// them. The incremental mutation paths maintain `base` by delta
/// propagation instead of rebuilding it.
pub(crate) fn refresh_levels_upward(
    store: &mut ElementStore,
    seeds: impl IntoIterator<Item = ElementId>,
) -> u32 {
    let affected = ancestor_closure(store, seeds);
    let mut max_level = 0;
    for id in upward_order(store, &affected) {
        let Some(element) = store.by_id(id) else { continue };
        let children = element.children.clone();
        let mut level = 0;
        for (child, _) in &children {
            if let Some(child_element) = store.by_id(*child) {
                level = level.max(child_element.level + 1);
            }
        }
        max_level = max_level.max(level);
        if let Some(element) = store.by_id_mut(id) {
            element.level = level;
        }
    }
    return max_level;
}

/// Apply `delta` to `start`'s base set and propagate it along every
/// ancestor path, scaled by the edge weights. This is the incremental
/// alternative to rebuilding each ancestor's base from scratch: removing a
/// child subtracts exactly its weighted contribution everywhere it rolled
/// up to.
/// `blocked` ids are neither updated nor traversed; deletions pass the set
/// of doomed elements so contributions cannot be subtracted twice through
/// a doomed intermediate.
pub(crate) fn propagate_base_delta(
    store: &mut ElementStore,
    start: ElementId,
    delta: &WeightedSet,
    blocked: &FxHashSet<ElementId>,
) {
    let mut work: Vec<(ElementId, f64)> = vec![(start, 1.0)];
    while let Some((id, factor)) = work.pop() {
        if blocked.contains(&id) {
            continue;
        }
        let Some(element) = store.by_id(id) else { continue };
        let parents = element.parents.clone();
        if let Some(element) = store.by_id_mut(id) {
            element.base.add_scaled(delta, factor);
        }
        for parent in parents {
            let edge = store
                .by_id(parent)
                .and_then(|parent_element| parent_element.child_weight(id))
                .unwrap_or(0.0);
            if edge != 0.0 {
                work.push((parent, factor * edge));
            }
        }
    }
}

/// Recompute `depth` and `indent` for `seeds` and everything below them.
/// Returns the maximum `(indent, depth)` seen among refreshed elements.
pub(crate) fn refresh_downward(
    store: &mut ElementStore,
    seeds: impl IntoIterator<Item = ElementId>,
) -> (u32, u32) {
    let affected = descendant_closure(store, seeds);
    let order = downward_order(store, &affected);
    let mut maxima = (0, 0);
    for id in order {
        refresh_one_downward(store, id);
        if let Some(element) = store.by_id(id) {
            maxima.0 = maxima.0.max(element.indent);
            maxima.1 = maxima.1.max(element.depth);
        }
    }
    return maxima;
}

fn refresh_one_downward(store: &mut ElementStore, id: ElementId) {
    let Some(element) = store.by_id(id) else { return };
    let parents = element.parents.clone();
    let mut depth = 0;
    let mut indent = 1;
    if let Some(first) = parents.first() {
        for parent in &parents {
            if let Some(parent_element) = store.by_id(*parent) {
                depth = depth.max(parent_element.depth + 1);
            }
        }
        // First parent wins for indent, by design asymmetric with depth.
        if let Some(first_element) = store.by_id(*first) {
            indent = first_element.indent + 1;
        }
    }
    let element = store.by_id_mut(id).unwrap_or_else(|| unreachable!());
    element.depth = depth;
    element.indent = indent;
}

/// Full recompute of every element's structural info. Returns the new
/// `(max_level, max_indent, max_depth)` maxima.
pub(crate) fn update_elements_info(store: &mut ElementStore) -> (u32, u32, u32) {
    let everyone: FxHashSet<ElementId> = store.ids().collect();
    for id in upward_order(store, &everyone) {
        refresh_one_upward(store, id);
    }
    for id in downward_order(store, &everyone) {
        refresh_one_downward(store, id);
    }
    let mut maxima = (0, 0, 0);
    for element in store.iter_unordered() {
        maxima.0 = maxima.0.max(element.level);
        maxima.1 = maxima.1.max(element.indent);
        maxima.2 = maxima.2.max(element.depth);
    }
    return maxima;
}
