//! Elements: the members of a dimension.
//!
//! An element is a single node in the dimension's consolidation graph. It
//! references its parents and children only by [`ElementId`]; the owning
//! dimension resolves ids to storage through its indexes. Elements never
//! own each other, so dropping one can never tear down a subtree.

use smallvec::SmallVec;

use crate::weights::WeightedSet;

/// Stable, externally visible element identity.
///
/// Ids are assigned once and survive renames, moves, and save/load cycles.
/// The storage-local slot an element occupies is a separate, unexposed
/// concept (see `dimension::slots`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

impl ElementId {
    pub fn new(raw: u64) -> ElementId {
        return ElementId(raw);
    }

    pub fn raw(&self) -> u64 {
        return self.0;
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "{}", self.0);
    }
}

/// The value kind an element stores or consolidates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ElementType {
    #[default]
    Numeric,
    String,
    /// Derived from weighted children. An element is `Consolidated` iff its
    /// child list is non-empty; the dimension maintains this invariant.
    Consolidated,
    Undefined,
}

impl ElementType {
    /// Numeric code used by the journal and snapshot file formats.
    pub fn code(&self) -> u32 {
        match self {
            ElementType::Numeric => return 1,
            ElementType::String => return 2,
            ElementType::Consolidated => return 4,
            ElementType::Undefined => return 0,
        }
    }

    pub fn from_code(code: u32) -> Option<ElementType> {
        match code {
            1 => return Some(ElementType::Numeric),
            2 => return Some(ElementType::String),
            4 => return Some(ElementType::Consolidated),
            0 => return Some(ElementType::Undefined),
            _ => return None,
        }
    }
}

/// Which stored cell values a cube must purge when an element is removed
/// or retyped. Consumed by the cell storage engine, produced here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeleteKind {
    /// Structural change only; no cells affected.
    None,
    /// Purge numeric cells.
    Numeric,
    /// Purge string cells.
    String,
    /// Purge everything stored under the element.
    All,
}

/// One member of a dimension.
///
/// `parents` and `children` are id references resolved through the owning
/// dimension. `children` is ordered and weighted: consolidation order is
/// visible to clients and the weight scales each child's contribution.
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    pub id: ElementId,
    pub name: Box<str>,
    pub kind: ElementType,
    /// Dense ordinal within the dimension; iteration order for clients.
    pub position: u32,
    /// Max distance to any leaf descendant. Leaves have level 0.
    pub level: u32,
    /// 1 + first parent's indent; roots have indent 1. First-parent-wins is
    /// intentional and asymmetric with `depth` (see the regression test
    /// pinning it).
    pub indent: u32,
    /// Max distance from any root ancestor. Roots have depth 0.
    pub depth: u32,
    /// True iff at least one child is `String` or itself a string
    /// consolidation. Maintained by cascade on child/type changes.
    pub string_consolidation: bool,
    /// Protected elements refuse type changes and renames.
    pub protected: bool,
    pub parents: SmallVec<[ElementId; 4]>,
    pub children: SmallVec<[(ElementId, f64); 4]>,
    /// Flattened leaf contribution weights, memoized bottom-up.
    pub base: WeightedSet,
}

impl Element {
    pub fn new(id: ElementId, name: impl Into<Box<str>>, kind: ElementType, position: u32) -> Element {
        let mut element = Element {
            id,
            name: name.into(),
            kind,
            position,
            level: 0,
            indent: 1,
            depth: 0,
            string_consolidation: false,
            protected: false,
            parents: SmallVec::new(),
            children: SmallVec::new(),
            base: WeightedSet::new(),
        };
        // A leaf contributes itself with weight 1.
        if element.is_leaf() {
            element.base.set(id, 1.0);
        }
        return element;
    }

    pub fn is_leaf(&self) -> bool {
        return self.children.is_empty();
    }

    pub fn is_consolidated(&self) -> bool {
        return self.kind == ElementType::Consolidated;
    }

    /// The weight of the edge to `child`, if linked.
    pub fn child_weight(&self, child: ElementId) -> Option<f64> {
        return self.children.iter().find(|(id, _)| *id == child).map(|(_, weight)| *weight);
    }

    pub fn has_parent(&self, parent: ElementId) -> bool {
        return self.parents.contains(&parent);
    }
}
