//! Cube metadata and the boundary to the cell storage engine.
//!
//! The engine tracks which cubes exist and which dimensions they span, but
//! cell values, aggregation math, and rule evaluation live behind the
//! [`CellEngine`] trait: when a structural change invalidates stored
//! cells, the engine tells the cell store what to purge and nothing more.

use crate::dimension::DimensionId;
use crate::element::{DeleteKind, Element, ElementId, ElementType};
use crate::error::Conflict;
use crate::versioned::{Commit, Merge, Token, merge_scalar};

/// Stable, externally visible cube identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CubeId(u64);

impl CubeId {
    pub fn new(raw: u64) -> CubeId {
        return CubeId(raw);
    }

    pub fn raw(&self) -> u64 {
        return self.0;
    }
}

impl std::fmt::Display for CubeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "{}", self.0);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CubeKind {
    #[default]
    Normal,
    /// Stores element attributes of a dimension.
    Attributes,
    /// Engine-managed bookkeeping cube.
    System,
}

impl CubeKind {
    pub fn code(&self) -> u32 {
        match self {
            CubeKind::Normal => return 0,
            CubeKind::Attributes => return 1,
            CubeKind::System => return 2,
        }
    }

    pub fn from_code(code: u32) -> Option<CubeKind> {
        match code {
            0 => return Some(CubeKind::Normal),
            1 => return Some(CubeKind::Attributes),
            2 => return Some(CubeKind::System),
            _ => return None,
        }
    }
}

/// Metadata for one cube. Cell storage is external; see [`CellEngine`].
#[derive(Clone, Debug)]
pub struct Cube {
    pub id: CubeId,
    pub name: Box<str>,
    /// The dimensions spanning this cube, in axis order.
    pub dimensions: Vec<DimensionId>,
    pub kind: CubeKind,
    pub deletable: bool,
    pub token: Token,
}

impl Cube {
    pub fn new(
        id: CubeId,
        name: impl Into<Box<str>>,
        dimensions: Vec<DimensionId>,
        kind: CubeKind,
    ) -> Cube {
        return Cube {
            id,
            name: name.into(),
            dimensions,
            kind,
            deletable: true,
            token: Token::new(),
        };
    }

    pub fn spans(&self, dimension: DimensionId) -> bool {
        return self.dimensions.contains(&dimension);
    }
}

impl Merge for Cube {
    fn merge3(&mut self, theirs: &Cube, base: &Cube) -> Result<(), Conflict> {
        merge_scalar(&mut self.name, &theirs.name, &base.name, "cube.name")?;
        merge_scalar(&mut self.dimensions, &theirs.dimensions, &base.dimensions, "cube.dimensions")?;
        merge_scalar(&mut self.kind, &theirs.kind, &base.kind, "cube.kind")?;
        merge_scalar(&mut self.deletable, &theirs.deletable, &base.deletable, "cube.deletable")?;
        self.token = self.token.max(theirs.token);
        return Ok(());
    }
}

impl Commit for Cube {
    fn on_commit(&mut self) {
        self.token.bump();
    }
}

/// Which stored cells must be purged when `element` disappears or changes
/// type out from under the cubes that span its dimension.
pub fn purge_kind_for(element: &Element) -> DeleteKind {
    match element.kind {
        ElementType::Numeric => return DeleteKind::Numeric,
        ElementType::String => return DeleteKind::String,
        ElementType::Consolidated => return DeleteKind::All,
        ElementType::Undefined => return DeleteKind::All,
    }
}

/// Boundary to the out-of-scope cell storage engine.
///
/// Implementations receive purge notifications inside the commit path and
/// must not call back into the database.
pub trait CellEngine: Send + Sync {
    /// Purge cells referencing one element of `dimension` in `cube`.
    fn delete_element(
        &self,
        cube: CubeId,
        dimension: DimensionId,
        element: ElementId,
        kind: DeleteKind,
    );

    /// Purge cells for several elements at once. The default fans out to
    /// `delete_element`; bulk-aware stores override it.
    fn delete_elements(
        &self,
        cube: CubeId,
        dimension: DimensionId,
        elements: &[ElementId],
        kind: DeleteKind,
    ) {
        for element in elements {
            self.delete_element(cube, dimension, *element, kind);
        }
    }
}
