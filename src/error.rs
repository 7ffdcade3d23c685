//! Error taxonomy for the engine.
//!
//! Every fallible operation returns `Result<T, EngineError>`. The variants
//! are kinds, not call sites: the HTTP layer above maps each kind to a
//! response code, so two operations failing for the same reason must fail
//! with the same variant.
//!
//! Merge conflicts are deliberately *not* part of this taxonomy. A conflict
//! is the normal outcome of two transactions racing on the same state and
//! drives an internal retry; it never reaches a caller as an error. See
//! [`Conflict`].

use thiserror::Error;

/// Typed failure returned by every fallible engine operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// A dimension, element, or cube id/name is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested name is already taken within its namespace.
    #[error("name already in use: {0}")]
    NameInUse(String),

    /// Linking the requested children would create a cycle.
    #[error("circular reference: {0}")]
    CircularReference(String),

    /// An element or dimension type is invalid for the operation.
    #[error("invalid type: {0}")]
    InvalidType(String),

    /// A position is out of range or not a valid target.
    #[error("invalid position: {0}")]
    InvalidPosition(String),

    /// The operation mode is not applicable to this entity.
    #[error("invalid mode: {0}")]
    InvalidMode(String),

    /// The entity is protected or not changable.
    #[error("unchangeable: {0}")]
    Unchangeable(String),

    /// The acting user lacks the required rights.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// A snapshot or journal file on disk is unreadable or inconsistent.
    #[error("corrupt file: {0}")]
    CorruptFile(String),

    /// A journal predates the minimum supported format version.
    #[error("journal version {found} is older than minimum supported {minimum}")]
    InvalidVersion { found: u32, minimum: u32 },

    /// The dimension is blocked by an active cube-level lock.
    #[error("dimension locked: {0}")]
    DimensionLocked(String),

    /// The database has never been saved, so there is nowhere to reload from.
    #[error("database has never been saved: {0}")]
    DatabaseUnsaved(String),

    /// Allocation failure surfaced by the platform.
    #[error("out of memory")]
    OutOfMemory,

    /// Invariant violation. Indicates a bug in the engine, not bad input.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Marker returned by a failed three-way merge.
///
/// Carries the path of the first conflicting field for diagnostics. The
/// transaction machinery catches this and retries against a fresh
/// snapshot; user code never sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    /// Dotted path to the conflicting field, e.g. `"dimension.elements[3]"`.
    pub path: String,
}

impl Conflict {
    pub fn at(path: impl Into<String>) -> Conflict {
        return Conflict { path: path.into() };
    }

    /// Prefix the conflict path with an enclosing structure's name.
    pub fn nested(self, outer: &str) -> Conflict {
        return Conflict { path: format!("{outer}.{}", self.path) };
    }
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "merge conflict at {}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_paths_nest() {
        let conflict = Conflict::at("elements[3]").nested("products");
        assert_eq!(conflict.path, "products.elements[3]");
        assert_eq!(conflict.to_string(), "merge conflict at products.elements[3]");
    }

    #[test]
    fn errors_format_with_context() {
        let err = EngineError::NameInUse("Total".to_string());
        assert_eq!(err.to_string(), "name already in use: Total");

        let err = EngineError::InvalidVersion { found: 0, minimum: 1 };
        assert!(err.to_string().contains("minimum supported 1"));
    }
}
