//! Dimensions: ordered element collections with consolidation hierarchies.
//!
//! A dimension owns its element store and enforces every hierarchy
//! invariant: an element is `Consolidated` iff it has children, the graph
//! stays acyclic, `string_consolidation` reflects reachable string
//! children, positions stay a dense permutation, and the cached base
//! element sets always equal the weighted flattening of the graph.
//!
//! Mutations keep the cached info correct incrementally where that is
//! cheap (base sets by delta propagation, levels by a bounded upward pass)
//! and set `changed_info` where an exact answer would require a full pass
//! (anything that can shrink the running maxima). `ensure_elements_info`
//! settles the flag; the transaction layer calls it before commit, and
//! bulk replay calls it once per bulk section instead of once per record.

mod hierarchy;
mod slots;

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::element::{DeleteKind, Element, ElementId, ElementType};
use crate::error::{Conflict, EngineError, Result};
use crate::versioned::{Commit, Merge, Token, merge_scalar};
use crate::weights::WeightedSet;

use hierarchy::{
    cascade_string_consolidation, cycle_check, propagate_base_delta, refresh_downward,
    refresh_levels_upward, update_elements_info,
};
use slots::ElementStore;

/// Stable, externally visible dimension identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimensionId(u64);

impl DimensionId {
    pub fn new(raw: u64) -> DimensionId {
        return DimensionId(raw);
    }

    pub fn raw(&self) -> u64 {
        return self.0;
    }
}

impl std::fmt::Display for DimensionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "{}", self.0);
    }
}

/// Behavioral variant of a dimension, dispatched by exhaustive match.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DimensionKind {
    #[default]
    Normal,
    /// Transparent indirection to another dimension. The target is data,
    /// resolved once per operation by the database layer.
    Alias { target: DimensionId },
    /// Holds the rights model; structurally frozen for ordinary callers.
    Rights,
    /// Backs element attributes of another dimension.
    Attributes,
    /// Computed on the fly; has no stored elements of its own.
    Virtual,
}

impl DimensionKind {
    /// Numeric code used by the snapshot file format. Alias targets are
    /// stored in a separate field.
    pub fn code(&self) -> u32 {
        match self {
            DimensionKind::Normal => return 0,
            DimensionKind::Alias { .. } => return 1,
            DimensionKind::Rights => return 2,
            DimensionKind::Attributes => return 3,
            DimensionKind::Virtual => return 4,
        }
    }

    pub fn from_code(code: u32, alias_target: Option<DimensionId>) -> Option<DimensionKind> {
        match code {
            0 => return Some(DimensionKind::Normal),
            1 => return alias_target.map(|target| DimensionKind::Alias { target }),
            2 => return Some(DimensionKind::Rights),
            3 => return Some(DimensionKind::Attributes),
            4 => return Some(DimensionKind::Virtual),
            _ => return None,
        }
    }
}

/// An ordered, versioned collection of elements plus its indexes.
#[derive(Clone, Debug)]
pub struct Dimension {
    pub id: DimensionId,
    pub name: Box<str>,
    pub kind: DimensionKind,
    /// Monotone change counter, bumped on every committed change.
    pub token: Token,
    pub deletable: bool,
    pub renamable: bool,
    pub changeable: bool,
    pub(crate) store: ElementStore,
    next_element_id: u64,
    max_level: u32,
    max_indent: u32,
    max_depth: u32,
    /// Set when a mutation may have shrunk the maxima or left level/depth
    /// info stale; settled by `ensure_elements_info`.
    changed_info: bool,
}

impl Dimension {
    pub fn new(id: DimensionId, name: impl Into<Box<str>>, kind: DimensionKind) -> Dimension {
        return Dimension {
            id,
            name: name.into(),
            kind,
            token: Token::new(),
            deletable: true,
            renamable: true,
            changeable: true,
            store: ElementStore::new(),
            next_element_id: 1,
            max_level: 0,
            max_indent: 0,
            max_depth: 0,
            changed_info: false,
        };
    }

    // ------------------------------------------------------------------
    // Lookup surface
    // ------------------------------------------------------------------

    pub fn len(&self) -> usize {
        return self.store.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.store.is_empty();
    }

    pub fn element_by_id(&self, id: ElementId) -> Result<&Element> {
        return self
            .store
            .by_id(id)
            .ok_or_else(|| EngineError::NotFound(format!("element {id} in dimension {}", self.name)));
    }

    pub fn element_by_name(&self, name: &str) -> Result<&Element> {
        return self
            .store
            .by_name(name)
            .ok_or_else(|| EngineError::NotFound(format!("element '{name}' in dimension {}", self.name)));
    }

    pub fn element_by_position(&self, position: u32) -> Result<&Element> {
        return self.store.by_position(position).ok_or_else(|| {
            EngineError::InvalidPosition(format!("position {position} in dimension {}", self.name))
        });
    }

    /// Elements in position order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> + '_ {
        return self.store.iter();
    }

    pub fn max_level(&self) -> u32 {
        return self.max_level;
    }

    pub fn max_indent(&self) -> u32 {
        return self.max_indent;
    }

    pub fn max_depth(&self) -> u32 {
        return self.max_depth;
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create an element. `explicit_id` is used by journal replay and the
    /// snapshot loader; interactive callers pass `None`.
    pub fn add_element(
        &mut self,
        explicit_id: Option<ElementId>,
        name: &str,
        kind: ElementType,
    ) -> Result<ElementId> {
        self.guard_changeable()?;
        if name.is_empty() {
            return Err(EngineError::InvalidType("element name must not be empty".to_string()));
        }
        if self.store.contains_name(name) {
            return Err(EngineError::NameInUse(name.to_string()));
        }
        if kind == ElementType::Consolidated {
            return Err(EngineError::InvalidType(
                "elements become consolidated by receiving children".to_string(),
            ));
        }
        let id = match explicit_id {
            Some(id) => {
                if self.store.contains_id(id) {
                    return Err(EngineError::Internal(format!("element id {id} already exists")));
                }
                self.next_element_id = self.next_element_id.max(id.raw() + 1);
                id
            }
            None => {
                let id = ElementId::new(self.next_element_id);
                self.next_element_id += 1;
                id
            }
        };
        let position = self.store.len() as u32;
        self.store.insert(Element::new(id, name, kind, position));
        self.max_indent = self.max_indent.max(1);
        return Ok(id);
    }

    pub fn rename_element(&mut self, id: ElementId, new_name: &str) -> Result<()> {
        self.guard_changeable()?;
        if new_name.is_empty() {
            return Err(EngineError::InvalidType("element name must not be empty".to_string()));
        }
        let element = self.element_by_id(id)?;
        if element.protected {
            return Err(EngineError::Unchangeable(format!("element {} is protected", element.name)));
        }
        if element.name.as_ref() == new_name {
            return Ok(());
        }
        if self.store.contains_name(new_name) {
            return Err(EngineError::NameInUse(new_name.to_string()));
        }
        let old_name = element.name.clone();
        let element = self.store.by_id_mut(id).unwrap_or_else(|| unreachable!());
        element.name = new_name.into();
        self.store.rekey_name(&old_name, new_name);
        return Ok(());
    }

    /// Change an element's type. Returns which stored cells the cubes over
    /// this dimension must purge.
    pub fn change_element_type(&mut self, id: ElementId, new_kind: ElementType) -> Result<DeleteKind> {
        self.guard_changeable()?;
        let element = self.element_by_id(id)?;
        let old_kind = element.kind;
        if old_kind == new_kind {
            return Ok(DeleteKind::None);
        }
        if element.protected {
            return Err(EngineError::Unchangeable(format!("element {} is protected", element.name)));
        }
        if new_kind == ElementType::Consolidated {
            return Err(EngineError::InvalidType(
                "elements become consolidated by receiving children".to_string(),
            ));
        }
        if old_kind == ElementType::Consolidated {
            self.remove_children(id)?;
        }
        let element = self.store.by_id_mut(id).unwrap_or_else(|| unreachable!());
        element.kind = new_kind;
        let parents = element.parents.clone();
        for parent in parents {
            cascade_string_consolidation(&mut self.store, parent);
        }
        match old_kind {
            ElementType::Numeric => return Ok(DeleteKind::Numeric),
            ElementType::String => return Ok(DeleteKind::String),
            ElementType::Consolidated => return Ok(DeleteKind::All),
            ElementType::Undefined => return Ok(DeleteKind::None),
        }
    }

    /// Link weighted children under `parent`, converting it to
    /// `Consolidated`. All-or-nothing: the cycle check runs before any
    /// mutation. A child already linked has its weight updated in place
    /// when `preserve_order` is set, and is moved to the end of the child
    /// list in input order otherwise.
    pub fn add_children(
        &mut self,
        parent: ElementId,
        children: &[(ElementId, f64)],
        preserve_order: bool,
    ) -> Result<()> {
        self.guard_changeable()?;
        self.element_by_id(parent)?;
        for (child, _) in children {
            self.element_by_id(*child)?;
        }
        if children.is_empty() {
            return Ok(());
        }
        cycle_check(&self.store, parent, children).map_err(EngineError::CircularReference)?;

        let was_leaf = self.element_by_id(parent)?.children.is_empty();
        // Base contribution delta for the parent and its ancestors.
        let mut delta = WeightedSet::new();
        for (child, weight) in children {
            let old_weight = self.element_by_id(parent)?.child_weight(*child);
            let child_base = self.element_by_id(*child)?.base.clone();
            match old_weight {
                None => {
                    delta.add_scaled(&child_base, *weight);
                    let parent_element =
                        self.store.by_id_mut(parent).unwrap_or_else(|| unreachable!());
                    parent_element.children.push((*child, *weight));
                    let child_element =
                        self.store.by_id_mut(*child).unwrap_or_else(|| unreachable!());
                    child_element.parents.push(parent);
                }
                Some(old) => {
                    delta.add_scaled(&child_base, *weight - old);
                    let parent_element =
                        self.store.by_id_mut(parent).unwrap_or_else(|| unreachable!());
                    let at = parent_element
                        .children
                        .iter()
                        .position(|(id, _)| id == child)
                        .unwrap_or_else(|| unreachable!());
                    if preserve_order {
                        parent_element.children[at].1 = *weight;
                    } else {
                        parent_element.children.remove(at);
                        parent_element.children.push((*child, *weight));
                    }
                }
            }
        }
        {
            let parent_element = self.store.by_id_mut(parent).unwrap_or_else(|| unreachable!());
            parent_element.kind = ElementType::Consolidated;
        }
        if was_leaf {
            // The parent stops contributing itself as a leaf.
            delta.add(parent, -1.0);
        }
        propagate_base_delta(&mut self.store, parent, &delta, &FxHashSet::default());
        let level = refresh_levels_upward(&mut self.store, [parent]);
        let child_ids: SmallVec<[ElementId; 4]> = children.iter().map(|(id, _)| *id).collect();
        let (indent, depth) = refresh_downward(&mut self.store, child_ids);
        cascade_string_consolidation(&mut self.store, parent);
        self.max_level = self.max_level.max(level);
        self.max_indent = self.max_indent.max(indent);
        self.max_depth = self.max_depth.max(depth);
        return Ok(());
    }

    /// Detach every child of `parent`, reverting it to `Numeric`. Returns
    /// the detached child ids.
    pub fn remove_children(&mut self, parent: ElementId) -> Result<Vec<ElementId>> {
        return self.remove_children_not_in(parent, &[]);
    }

    /// Detach every child of `parent` not listed in `keep`. If nothing
    /// remains the parent reverts to `Numeric`. The removed contribution is
    /// subtracted along every ancestor path rather than rebuilt.
    pub fn remove_children_not_in(
        &mut self,
        parent: ElementId,
        keep: &[ElementId],
    ) -> Result<Vec<ElementId>> {
        self.guard_changeable()?;
        let element = self.element_by_id(parent)?;
        let (removed, kept): (SmallVec<[(ElementId, f64); 4]>, SmallVec<[(ElementId, f64); 4]>) =
            element.children.iter().copied().partition(|(child, _)| !keep.contains(child));
        if removed.is_empty() {
            return Ok(Vec::new());
        }
        let mut delta = WeightedSet::new();
        for (child, weight) in &removed {
            let child_base = self.element_by_id(*child)?.base.clone();
            delta.add_scaled(&child_base, -weight);
        }
        for (child, _) in &removed {
            let child_element = self.store.by_id_mut(*child).unwrap_or_else(|| unreachable!());
            child_element.parents.retain(|id| *id != parent);
        }
        let reverts = kept.is_empty();
        {
            let parent_element = self.store.by_id_mut(parent).unwrap_or_else(|| unreachable!());
            parent_element.children = kept;
            if reverts {
                parent_element.kind = ElementType::Numeric;
                // A fresh leaf contributes itself again.
                delta.add(parent, 1.0);
            }
        }
        propagate_base_delta(&mut self.store, parent, &delta, &FxHashSet::default());
        refresh_levels_upward(&mut self.store, [parent]);
        let removed_ids: Vec<ElementId> = removed.iter().map(|(id, _)| *id).collect();
        refresh_downward(&mut self.store, removed_ids.iter().copied());
        cascade_string_consolidation(&mut self.store, parent);
        // Maxima may have shrunk.
        self.changed_info = true;
        return Ok(removed_ids);
    }

    /// Move an element to `new_position`, shifting everything between by
    /// one slot. O(distance moved).
    pub fn move_element(&mut self, id: ElementId, new_position: u32) -> Result<()> {
        self.guard_changeable()?;
        let element = self.element_by_id(id)?;
        if new_position as usize >= self.store.len() {
            return Err(EngineError::InvalidPosition(format!(
                "position {new_position} out of range for dimension {}",
                self.name
            )));
        }
        let old_position = element.position;
        self.store.shift_position(old_position, new_position);
        return Ok(());
    }

    pub fn move_elements(&mut self, moves: &[(ElementId, u32)]) -> Result<()> {
        for (id, position) in moves {
            self.move_element(*id, *position)?;
        }
        return Ok(());
    }

    /// Delete elements, detaching them from the graph and compacting the
    /// position space. Returns the removed elements so the caller can fan
    /// out cell purges to the cubes.
    pub fn delete_elements(&mut self, ids: &[ElementId]) -> Result<Vec<Element>> {
        self.guard_changeable()?;
        for id in ids {
            self.element_by_id(*id)?;
        }
        let doomed: FxHashSet<ElementId> = ids.iter().copied().collect();

        // Per-surviving-parent contribution deltas, read against the
        // frozen pre-delete bases.
        let mut deltas: FxHashMap<ElementId, WeightedSet> = FxHashMap::default();
        let mut orphaned: Vec<ElementId> = Vec::new();
        for id in &doomed {
            let element = self.element_by_id(*id)?;
            let parents = element.parents.clone();
            let children = element.children.clone();
            let own_base = element.base.clone();
            for parent in parents {
                if doomed.contains(&parent) {
                    continue;
                }
                let weight = self
                    .element_by_id(parent)?
                    .child_weight(*id)
                    .unwrap_or_else(|| unreachable!("parent link without child link"));
                deltas.entry(parent).or_default().add_scaled(&own_base, -weight);
            }
            for (child, _) in children {
                if !doomed.contains(&child) {
                    orphaned.push(child);
                }
            }
        }

        // Unlink survivors from the doomed on both sides.
        let mut reverted: Vec<ElementId> = Vec::new();
        for (parent, _) in deltas.iter() {
            let parent_element = self.store.by_id_mut(*parent).unwrap_or_else(|| unreachable!());
            parent_element.children.retain(|(child, _)| !doomed.contains(child));
            if parent_element.children.is_empty() {
                parent_element.kind = ElementType::Numeric;
                reverted.push(*parent);
            }
        }
        for child in &orphaned {
            if let Some(child_element) = self.store.by_id_mut(*child) {
                child_element.parents.retain(|parent| !doomed.contains(parent));
            }
        }
        for parent in &reverted {
            deltas
                .get_mut(parent)
                .unwrap_or_else(|| unreachable!())
                .add(*parent, 1.0);
        }
        for (parent, delta) in &deltas {
            propagate_base_delta(&mut self.store, *parent, delta, &doomed);
        }
        let touched_parents: Vec<ElementId> = deltas.keys().copied().collect();
        refresh_levels_upward(&mut self.store, touched_parents.iter().copied());
        refresh_downward(&mut self.store, orphaned.iter().copied());
        for parent in &touched_parents {
            cascade_string_consolidation(&mut self.store, *parent);
        }

        let removed = self.store.delete(ids);
        self.changed_info = true;
        return Ok(removed);
    }

    /// Delete every element at once. Journaled as a single command.
    pub fn clear_elements(&mut self) -> Result<Vec<Element>> {
        self.guard_changeable()?;
        let removed = self.store.clear();
        self.max_level = 0;
        self.max_indent = 0;
        self.max_depth = 0;
        self.changed_info = false;
        return Ok(removed);
    }

    /// Settle the `changed_info` flag: full recompute of base sets,
    /// level/indent/depth, and the maxima. Cheap when the flag is clear.
    pub fn ensure_elements_info(&mut self) {
        if !self.changed_info {
            return;
        }
        let (max_level, max_indent, max_depth) = update_elements_info(&mut self.store);
        self.max_level = max_level;
        self.max_indent = max_indent;
        self.max_depth = max_depth;
        self.changed_info = false;
    }

    /// Protect or unprotect an element. Protected elements refuse renames
    /// and type changes; system setup uses this for structural members.
    pub fn set_protected(&mut self, id: ElementId, protected: bool) -> Result<()> {
        let element = self
            .store
            .by_id_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("element {id}")))?;
        element.protected = protected;
        return Ok(());
    }

    // ------------------------------------------------------------------
    // Snapshot load hooks (see `storage`)
    // ------------------------------------------------------------------

    /// Rebuild a dimension header from a snapshot row.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_snapshot(
        id: DimensionId,
        name: Box<str>,
        kind: DimensionKind,
        deletable: bool,
        renamable: bool,
        changeable: bool,
        next_element_id: u64,
        token: Token,
    ) -> Dimension {
        let mut dimension = Dimension::new(id, name, kind);
        dimension.deletable = deletable;
        dimension.renamable = renamable;
        dimension.changeable = changeable;
        dimension.next_element_id = next_element_id;
        dimension.token = token;
        return dimension;
    }

    /// Insert a fully linked element from a snapshot row. Rows arrive in
    /// position order; derived info is rebuilt by `finish_snapshot_load`.
    pub(crate) fn insert_snapshot_element(&mut self, element: Element) {
        self.next_element_id = self.next_element_id.max(element.id.raw() + 1);
        self.store.insert(element);
    }

    pub(crate) fn next_element_id(&self) -> u64 {
        return self.next_element_id;
    }

    /// Recompute everything derived (base sets, levels, maxima) after the
    /// last snapshot row of this dimension.
    pub(crate) fn finish_snapshot_load(&mut self) {
        self.changed_info = true;
        self.ensure_elements_info();
    }

    fn guard_changeable(&self) -> Result<()> {
        let changeable = match self.kind {
            DimensionKind::Normal | DimensionKind::Attributes | DimensionKind::Alias { .. } => {
                self.changeable
            }
            DimensionKind::Rights | DimensionKind::Virtual => false,
        };
        if !changeable {
            return Err(EngineError::Unchangeable(format!("dimension {}", self.name)));
        }
        return Ok(());
    }
}

impl Merge for Dimension {
    fn merge3(
        &mut self,
        theirs: &Dimension,
        base: &Dimension,
    ) -> std::result::Result<(), Conflict> {
        merge_scalar(&mut self.name, &theirs.name, &base.name, "dimension.name")?;
        merge_scalar(&mut self.kind, &theirs.kind, &base.kind, "dimension.kind")?;
        merge_scalar(&mut self.deletable, &theirs.deletable, &base.deletable, "dimension.deletable")?;
        merge_scalar(&mut self.renamable, &theirs.renamable, &base.renamable, "dimension.renamable")?;
        merge_scalar(
            &mut self.changeable,
            &theirs.changeable,
            &base.changeable,
            "dimension.changeable",
        )?;
        merge_scalar(
            &mut self.next_element_id,
            &theirs.next_element_id,
            &base.next_element_id,
            "dimension.next_element_id",
        )?;
        self.store.merge3(&theirs.store, &base.store)?;
        // Token and maxima are derived: adopt the larger and recompute the
        // maxima lazily after a genuine both-sides merge.
        self.token = self.token.max(theirs.token);
        self.max_level = self.max_level.max(theirs.max_level);
        self.max_indent = self.max_indent.max(theirs.max_indent);
        self.max_depth = self.max_depth.max(theirs.max_depth);
        self.changed_info = true;
        return Ok(());
    }
}

impl Commit for Dimension {
    fn on_commit(&mut self) {
        self.token.bump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dimension() -> Dimension {
        return Dimension::new(DimensionId::new(1), "Products", DimensionKind::Normal);
    }

    fn add(dim: &mut Dimension, name: &str) -> ElementId {
        return dim.add_element(None, name, ElementType::Numeric).unwrap();
    }

    #[test]
    fn add_element_assigns_positions_and_ids() {
        let mut dim = dimension();
        let a = add(&mut dim, "A");
        let b = add(&mut dim, "B");
        assert_ne!(a, b);
        assert_eq!(dim.element_by_name("A").unwrap().position, 0);
        assert_eq!(dim.element_by_name("B").unwrap().position, 1);
        assert_eq!(dim.len(), 2);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut dim = dimension();
        add(&mut dim, "A");
        let err = dim.add_element(None, "A", ElementType::Numeric).unwrap_err();
        assert_eq!(err, EngineError::NameInUse("A".to_string()));
    }

    #[test]
    fn explicit_id_collision_is_internal() {
        let mut dim = dimension();
        let a = add(&mut dim, "A");
        let err = dim.add_element(Some(a), "B", ElementType::Numeric).unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[test]
    fn add_children_consolidates_and_aggregates() {
        let mut dim = dimension();
        let a = add(&mut dim, "A");
        let b = add(&mut dim, "B");
        let total = add(&mut dim, "Total");
        dim.add_children(total, &[(a, 1.0), (b, 2.0)], true).unwrap();

        let element = dim.element_by_id(total).unwrap();
        assert_eq!(element.kind, ElementType::Consolidated);
        assert_eq!(element.base.get(a), Some(1.0));
        assert_eq!(element.base.get(b), Some(2.0));
        assert_eq!(element.level, 1);
        assert_eq!(dim.max_level(), 1);
        assert_eq!(dim.element_by_id(a).unwrap().depth, 1);
        assert_eq!(dim.element_by_id(a).unwrap().indent, 2);
    }

    #[test]
    fn self_child_fails_without_mutation() {
        let mut dim = dimension();
        let a = add(&mut dim, "A");
        let b = add(&mut dim, "B");
        let total = add(&mut dim, "Total");
        dim.add_children(total, &[(a, 1.0), (b, 2.0)], true).unwrap();

        let err = dim.add_children(total, &[(total, 1.0)], true).unwrap_err();
        assert!(matches!(err, EngineError::CircularReference(_)));
        // Unchanged: still exactly A and B.
        let element = dim.element_by_id(total).unwrap();
        assert_eq!(element.children.len(), 2);
        assert_eq!(element.kind, ElementType::Consolidated);
    }

    #[test]
    fn descendant_cycle_fails() {
        let mut dim = dimension();
        let leaf = add(&mut dim, "leaf");
        let mid = add(&mut dim, "mid");
        let top = add(&mut dim, "top");
        dim.add_children(mid, &[(leaf, 1.0)], true).unwrap();
        dim.add_children(top, &[(mid, 1.0)], true).unwrap();

        let err = dim.add_children(leaf, &[(top, 1.0)], true).unwrap_err();
        assert!(matches!(err, EngineError::CircularReference(_)));
    }

    #[test]
    fn remove_children_reverts_and_subtracts() {
        let mut dim = dimension();
        let a = add(&mut dim, "A");
        let total = add(&mut dim, "Total");
        let grand = add(&mut dim, "Grand");
        dim.add_children(total, &[(a, 3.0)], true).unwrap();
        dim.add_children(grand, &[(total, 2.0)], true).unwrap();
        assert_eq!(dim.element_by_id(grand).unwrap().base.get(a), Some(6.0));

        let removed = dim.remove_children(total).unwrap();
        assert_eq!(removed, vec![a]);
        let total_element = dim.element_by_id(total).unwrap();
        assert_eq!(total_element.kind, ElementType::Numeric);
        assert!(total_element.children.is_empty());
        // Total now rolls up into Grand as a leaf of its own.
        let grand_element = dim.element_by_id(grand).unwrap();
        assert_eq!(grand_element.base.get(a), None);
        assert_eq!(grand_element.base.get(total), Some(2.0));
        assert!(dim.element_by_id(a).unwrap().parents.is_empty());
    }

    #[test]
    fn remove_children_not_in_keeps_the_kept() {
        let mut dim = dimension();
        let a = add(&mut dim, "A");
        let b = add(&mut dim, "B");
        let total = add(&mut dim, "Total");
        dim.add_children(total, &[(a, 1.0), (b, 1.0)], true).unwrap();

        let removed = dim.remove_children_not_in(total, &[b]).unwrap();
        assert_eq!(removed, vec![a]);
        let element = dim.element_by_id(total).unwrap();
        assert_eq!(element.kind, ElementType::Consolidated);
        assert_eq!(element.base.get(b), Some(1.0));
        assert_eq!(element.base.get(a), None);
    }

    #[test]
    fn change_type_of_consolidated_drops_children() {
        let mut dim = dimension();
        let a = add(&mut dim, "A");
        let total = add(&mut dim, "Total");
        dim.add_children(total, &[(a, 1.0)], true).unwrap();

        let purge = dim.change_element_type(total, ElementType::String).unwrap();
        assert_eq!(purge, DeleteKind::All);
        let element = dim.element_by_id(total).unwrap();
        assert_eq!(element.kind, ElementType::String);
        assert!(element.children.is_empty());
    }

    #[test]
    fn protected_element_type_is_frozen() {
        let mut dim = dimension();
        let a = add(&mut dim, "A");
        dim.set_protected(a, true).unwrap();
        let err = dim.change_element_type(a, ElementType::String).unwrap_err();
        assert!(matches!(err, EngineError::Unchangeable(_)));
    }

    #[test]
    fn string_child_marks_consolidation() {
        let mut dim = dimension();
        let s = dim.add_element(None, "S", ElementType::String).unwrap();
        let total = add(&mut dim, "Total");
        let grand = add(&mut dim, "Grand");
        dim.add_children(total, &[(s, 1.0)], true).unwrap();
        dim.add_children(grand, &[(total, 1.0)], true).unwrap();

        assert!(dim.element_by_id(total).unwrap().string_consolidation);
        assert!(dim.element_by_id(grand).unwrap().string_consolidation);

        dim.remove_children(total).unwrap();
        assert!(!dim.element_by_id(grand).unwrap().string_consolidation);
    }

    #[test]
    fn move_element_shifts_neighbors() {
        let mut dim = dimension();
        let ids: Vec<ElementId> = (0..5).map(|i| add(&mut dim, &format!("e{i}"))).collect();
        dim.move_element(ids[4], 0).unwrap();
        let order: Vec<ElementId> = dim.elements().map(|e| e.id).collect();
        assert_eq!(order, vec![ids[4], ids[0], ids[1], ids[2], ids[3]]);
        assert!(dim.move_element(ids[0], 9).is_err());
    }

    #[test]
    fn delete_elements_compacts_and_reverts_parents() {
        let mut dim = dimension();
        let a = add(&mut dim, "A");
        let b = add(&mut dim, "B");
        let total = add(&mut dim, "Total");
        dim.add_children(total, &[(a, 1.0), (b, 1.0)], true).unwrap();

        let removed = dim.delete_elements(&[a, b]).unwrap();
        assert_eq!(removed.len(), 2);
        let element = dim.element_by_id(total).unwrap();
        assert_eq!(element.kind, ElementType::Numeric);
        assert!(element.children.is_empty());
        assert_eq!(element.position, 0);
        assert_eq!(dim.len(), 1);
        dim.ensure_elements_info();
        assert_eq!(dim.max_level(), 0);
    }

    #[test]
    fn delete_middle_of_diamond_updates_bases_once() {
        let mut dim = dimension();
        let leaf = add(&mut dim, "leaf");
        let mid = add(&mut dim, "mid");
        let top = add(&mut dim, "top");
        dim.add_children(mid, &[(leaf, 2.0)], true).unwrap();
        dim.add_children(top, &[(mid, 3.0), (leaf, 1.0)], true).unwrap();
        assert_eq!(dim.element_by_id(top).unwrap().base.get(leaf), Some(7.0));

        dim.delete_elements(&[mid]).unwrap();
        let top_element = dim.element_by_id(top).unwrap();
        // Only the direct edge remains.
        assert_eq!(top_element.base.get(leaf), Some(1.0));
        assert_eq!(top_element.children.len(), 1);
    }

    #[test]
    fn rights_dimension_is_unchangeable() {
        let mut dim = Dimension::new(DimensionId::new(9), "#rights", DimensionKind::Rights);
        let err = dim.add_element(None, "A", ElementType::Numeric).unwrap_err();
        assert!(matches!(err, EngineError::Unchangeable(_)));
    }

    #[test]
    fn disjoint_transactions_merge() {
        let mut base = dimension();
        let a = add(&mut base, "A");
        let b = add(&mut base, "B");

        let mut ours = base.clone();
        ours.rename_element(a, "A2").unwrap();
        let mut theirs = base.clone();
        theirs.rename_element(b, "B2").unwrap();

        ours.merge3(&theirs, &base).unwrap();
        assert!(ours.element_by_name("A2").is_ok());
        assert!(ours.element_by_name("B2").is_ok());
    }

    #[test]
    fn racing_transactions_conflict() {
        let mut base = dimension();
        let a = add(&mut base, "A");

        let mut ours = base.clone();
        ours.rename_element(a, "left").unwrap();
        let mut theirs = base.clone();
        theirs.rename_element(a, "right").unwrap();

        assert!(ours.merge3(&theirs, &base).is_err());
    }
}
