//! Slab storage for elements plus the three dimension indexes.
//!
//! Elements live in a slot vector; freed slots are reused, and every reuse
//! bumps the slot's generation so a stale handle can never alias a newer
//! element. External code addresses elements by [`ElementId`]; `Slot`
//! handles stay inside the dimension.
//!
//! Three injective indexes hang off the slab: id→slot, name→slot, and the
//! dense position→slot vector that gives clients their stable iteration
//! order. After a three-way merge the indexes are rebuilt from the merged
//! slots and validated; a duplicate name or a broken position permutation
//! means the two transactions raced structurally, which surfaces as a merge
//! conflict rather than a corrupt index.

use rustc_hash::FxHashMap;

use crate::element::{Element, ElementId};
use crate::error::Conflict;
use crate::versioned::merge_slots;

/// Generational handle to a slab slot. Never exposed outside the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Slot {
    pub index: u32,
    pub generation: u32,
}

/// The element list and its indexes.
#[derive(Clone, Debug, Default)]
pub(crate) struct ElementStore {
    slots: Vec<Option<Element>>,
    generations: Vec<u32>,
    free: Vec<u32>,
    by_id: FxHashMap<ElementId, Slot>,
    by_name: FxHashMap<Box<str>, Slot>,
    by_position: Vec<Slot>,
}

impl ElementStore {
    pub fn new() -> ElementStore {
        return ElementStore::default();
    }

    /// Live element count.
    pub fn len(&self) -> usize {
        return self.by_position.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.by_position.is_empty();
    }

    pub fn contains_id(&self, id: ElementId) -> bool {
        return self.by_id.contains_key(&id);
    }

    pub fn contains_name(&self, name: &str) -> bool {
        return self.by_name.contains_key(name);
    }

    /// Insert a new element. Its `position` must be the current length
    /// (append only; moves come later).
    pub fn insert(&mut self, element: Element) -> Slot {
        assert_eq!(element.position as usize, self.by_position.len(), "insert is append-only");
        let id = element.id;
        let name = element.name.clone();
        let slot = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(element);
                Slot { index, generation: self.generations[index as usize] }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Some(element));
                self.generations.push(0);
                Slot { index, generation: 0 }
            }
        };
        self.by_id.insert(id, slot);
        self.by_name.insert(name, slot);
        self.by_position.push(slot);
        return slot;
    }

    pub fn get(&self, slot: Slot) -> Option<&Element> {
        if self.generations.get(slot.index as usize) != Some(&slot.generation) {
            return None;
        }
        return self.slots.get(slot.index as usize).and_then(|entry| entry.as_ref());
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut Element> {
        if self.generations.get(slot.index as usize) != Some(&slot.generation) {
            return None;
        }
        return self.slots.get_mut(slot.index as usize).and_then(|entry| entry.as_mut());
    }

    pub fn slot_by_id(&self, id: ElementId) -> Option<Slot> {
        return self.by_id.get(&id).copied();
    }

    pub fn slot_by_name(&self, name: &str) -> Option<Slot> {
        return self.by_name.get(name).copied();
    }

    pub fn slot_by_position(&self, position: u32) -> Option<Slot> {
        return self.by_position.get(position as usize).copied();
    }

    pub fn by_id(&self, id: ElementId) -> Option<&Element> {
        return self.slot_by_id(id).and_then(|slot| self.get(slot));
    }

    pub fn by_id_mut(&mut self, id: ElementId) -> Option<&mut Element> {
        let slot = self.slot_by_id(id)?;
        return self.get_mut(slot);
    }

    pub fn by_name(&self, name: &str) -> Option<&Element> {
        return self.slot_by_name(name).and_then(|slot| self.get(slot));
    }

    pub fn by_position(&self, position: u32) -> Option<&Element> {
        return self.slot_by_position(position).and_then(|slot| self.get(slot));
    }

    /// Iterate elements in position order.
    pub fn iter(&self) -> impl Iterator<Item = &Element> + '_ {
        return self.by_position.iter().filter_map(|slot| self.get(*slot));
    }

    /// Iterate elements in slab order. Used by recompute passes that do
    /// their own ordering.
    pub fn iter_unordered(&self) -> impl Iterator<Item = &Element> + '_ {
        return self.slots.iter().filter_map(|entry| entry.as_ref());
    }

    pub fn ids(&self) -> impl Iterator<Item = ElementId> + '_ {
        return self.by_position.iter().filter_map(|slot| self.get(*slot)).map(|element| element.id);
    }

    /// Re-key the name index after a rename. The element itself must
    /// already carry `new_name`.
    pub fn rekey_name(&mut self, old_name: &str, new_name: &str) {
        if let Some(slot) = self.by_name.remove(old_name) {
            self.by_name.insert(new_name.into(), slot);
        }
    }

    /// Move the element at `from` to `to`, shifting everything between by
    /// one slot. Only the affected span is touched: O(|from - to|).
    pub fn shift_position(&mut self, from: u32, to: u32) {
        let (from, to) = (from as usize, to as usize);
        if from == to {
            return;
        }
        let (lo, hi) = (from.min(to), from.max(to));
        if from < to {
            self.by_position[lo..=hi].rotate_left(1);
        } else {
            self.by_position[lo..=hi].rotate_right(1);
        }
        for position in lo..=hi {
            let moved = self.by_position[position];
            if let Some(element) = self.get_mut(moved) {
                element.position = position as u32;
            }
        }
    }

    /// Delete the given ids, compacting the position space. Positions above
    /// a deleted element shift down by the number of deletions at or below
    /// them; relative order of survivors is preserved.
    pub fn delete(&mut self, ids: &[ElementId]) -> Vec<Element> {
        let mut doomed: Vec<(u32, Slot)> = ids
            .iter()
            .filter_map(|id| {
                let slot = self.slot_by_id(*id)?;
                let element = self.get(slot)?;
                return Some((element.position, slot));
            })
            .collect();
        // Sorted by position so the single compaction walk below is right.
        doomed.sort_by_key(|(position, _)| *position);

        let mut removed = Vec::with_capacity(doomed.len());
        for (_, slot) in doomed.iter().rev() {
            let element = self.detach(*slot);
            self.by_position.remove(element.position as usize);
            removed.push(element);
        }
        // One pass from the first hole reassigns the dense positions.
        if let Some((first, _)) = doomed.first() {
            for position in (*first as usize)..self.by_position.len() {
                let slot = self.by_position[position];
                if let Some(element) = self.get_mut(slot) {
                    element.position = position as u32;
                }
            }
        }
        removed.reverse();
        return removed;
    }

    /// Drop every element at once. Cheaper than `delete` of all ids and
    /// used by the bulk clear command.
    pub fn clear(&mut self) -> Vec<Element> {
        let cleared: Vec<Element> = self.slots.iter_mut().filter_map(Option::take).collect();
        for generation in self.generations.iter_mut() {
            *generation += 1;
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.by_id.clear();
        self.by_name.clear();
        self.by_position.clear();
        return cleared;
    }

    /// Remove one element from the slab and the id/name indexes, bumping
    /// the slot generation. Position index handling is the caller's job.
    fn detach(&mut self, slot: Slot) -> Element {
        let element = self.slots[slot.index as usize]
            .take()
            .unwrap_or_else(|| unreachable!("detach of vacant slot"));
        self.generations[slot.index as usize] += 1;
        self.free.push(slot.index);
        self.by_id.remove(&element.id);
        self.by_name.remove(&element.name);
        return element;
    }

    /// Three-way merge: slots merge entry-wise, generations take the
    /// maximum (they only grow), and the indexes are rebuilt from the
    /// merged slots. Index validation failures mean the transactions raced
    /// structurally and are reported as conflicts.
    pub fn merge3(&mut self, theirs: &ElementStore, base: &ElementStore) -> Result<(), Conflict> {
        merge_slots(&mut self.slots, &theirs.slots, &base.slots, "elements")?;
        self.generations.resize(self.slots.len(), 0);
        for (i, generation) in self.generations.iter_mut().enumerate() {
            let theirs_gen = theirs.generations.get(i).copied().unwrap_or(0);
            *generation = (*generation).max(theirs_gen);
        }
        return self.rebuild_indexes();
    }

    /// Rebuild id/name/position indexes and the free list from the slots.
    fn rebuild_indexes(&mut self) -> Result<(), Conflict> {
        self.free.clear();
        self.by_id.clear();
        self.by_name.clear();
        let live = self.slots.iter().flatten().count();
        self.by_position = vec![Slot { index: u32::MAX, generation: 0 }; live];
        for (index, entry) in self.slots.iter().enumerate() {
            let Some(element) = entry else {
                self.free.push(index as u32);
                continue;
            };
            let slot = Slot { index: index as u32, generation: self.generations[index] };
            if self.by_id.insert(element.id, slot).is_some() {
                return Err(Conflict::at(format!("elements.id[{}]", element.id)));
            }
            if self.by_name.insert(element.name.clone(), slot).is_some() {
                return Err(Conflict::at(format!("elements.name[{}]", element.name)));
            }
            let position = element.position as usize;
            if position >= live || self.by_position[position].index != u32::MAX {
                return Err(Conflict::at(format!("elements.position[{position}]")));
            }
            self.by_position[position] = slot;
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementType;

    fn element(raw_id: u64, name: &str, position: u32) -> Element {
        return Element::new(ElementId::new(raw_id), name, ElementType::Numeric, position);
    }

    #[test]
    fn insert_and_lookup() {
        let mut store = ElementStore::new();
        store.insert(element(1, "Jan", 0));
        store.insert(element(2, "Feb", 1));

        assert_eq!(store.len(), 2);
        assert_eq!(store.by_id(ElementId::new(2)).unwrap().name.as_ref(), "Feb");
        assert_eq!(store.by_name("Jan").unwrap().id, ElementId::new(1));
        assert_eq!(store.by_position(1).unwrap().id, ElementId::new(2));
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let mut store = ElementStore::new();
        let first = store.insert(element(1, "Jan", 0));
        store.delete(&[ElementId::new(1)]);
        let second = store.insert(element(2, "Feb", 0));

        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        // The stale handle resolves to nothing.
        assert!(store.get(first).is_none());
        assert_eq!(store.get(second).unwrap().id, ElementId::new(2));
    }

    #[test]
    fn delete_compacts_positions() {
        let mut store = ElementStore::new();
        for i in 0..10 {
            store.insert(element(i, &format!("e{i}"), i as u32));
        }
        store.delete(&[ElementId::new(2), ElementId::new(5), ElementId::new(7)]);

        assert_eq!(store.len(), 7);
        let survivors: Vec<u64> = store.iter().map(|e| e.id.raw()).collect();
        assert_eq!(survivors, vec![0, 1, 3, 4, 6, 8, 9]);
        for (position, element) in store.iter().enumerate() {
            assert_eq!(element.position as usize, position);
        }
    }

    #[test]
    fn shift_position_is_local() {
        let mut store = ElementStore::new();
        for i in 0..5 {
            store.insert(element(i, &format!("e{i}"), i as u32));
        }
        store.shift_position(3, 1);
        let order: Vec<u64> = store.iter().map(|e| e.id.raw()).collect();
        assert_eq!(order, vec![0, 3, 1, 2, 4]);
        for (position, element) in store.iter().enumerate() {
            assert_eq!(element.position as usize, position);
        }

        // And back the other way.
        store.shift_position(1, 3);
        let order: Vec<u64> = store.iter().map(|e| e.id.raw()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        for (position, element) in store.iter().enumerate() {
            assert_eq!(element.position as usize, position);
        }
    }

    #[test]
    fn clear_empties_everything() {
        let mut store = ElementStore::new();
        for i in 0..4 {
            store.insert(element(i, &format!("e{i}"), i as u32));
        }
        let cleared = store.clear();
        assert_eq!(cleared.len(), 4);
        assert!(store.is_empty());
        assert!(store.by_name("e0").is_none());
        // Slots are reusable after a clear.
        store.insert(element(9, "fresh", 0));
        assert_eq!(store.by_name("fresh").unwrap().id, ElementId::new(9));
    }

    #[test]
    fn merge_detects_structural_race() {
        let mut base = ElementStore::new();
        for i in 0..3 {
            base.insert(element(i, &format!("e{i}"), i as u32));
        }
        // One side deletes e0 (shifting positions), the other appends.
        let mut ours = base.clone();
        ours.delete(&[ElementId::new(0)]);
        let mut theirs = base.clone();
        theirs.insert(element(7, "late", 3));

        assert!(ours.merge3(&theirs, &base).is_err());
    }

    #[test]
    fn merge_of_disjoint_edits_succeeds() {
        let mut base = ElementStore::new();
        for i in 0..3 {
            base.insert(element(i, &format!("e{i}"), i as u32));
        }
        let mut ours = base.clone();
        ours.by_id_mut(ElementId::new(0)).unwrap().protected = true;
        let mut theirs = base.clone();
        theirs.by_id_mut(ElementId::new(2)).unwrap().name = "renamed".into();
        theirs.rekey_name("e2", "renamed");

        ours.merge3(&theirs, &base).unwrap();
        assert!(ours.by_id(ElementId::new(0)).unwrap().protected);
        assert_eq!(ours.by_name("renamed").unwrap().id, ElementId::new(2));
    }
}
