//! Copy-on-write versioning with three-way merge.
//!
//! Every mutable collection in the engine (the element list, its indexes,
//! the dimension list, the cube list, the database state itself) is wrapped
//! in [`Versioned`]. Key design decisions:
//!
//! 1. **Checkout clones once**: a transaction that mutates a structure
//!    first checks it out, cloning the shared data and remembering the
//!    shared version as its merge base. Later writes within the same
//!    transaction mutate the private copy in place.
//!
//! 2. **Readers never lock**: the committed snapshot is an `Arc` graph
//!    shared by any number of reader threads. Writers only ever touch their
//!    private copies, so a reader's view is consistent for as long as it
//!    holds the `Arc`.
//!
//! 3. **Three-way merge, field by field**: at commit time each field is
//!    compared against the transaction's base. Untouched fields adopt the
//!    concurrently committed value; touched fields keep the local value;
//!    fields changed on both sides conflict, failing the whole merge and
//!    retrying the transaction. Nested versioned structures merge
//!    recursively, and pointer identity against the base detects "untouched"
//!    without deep comparison.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::Conflict;

/// Monotone version counter exposed to clients for cache invalidation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u64);

impl Token {
    pub fn new() -> Token {
        return Token(0);
    }

    pub fn value(&self) -> u64 {
        return self.0;
    }

    /// Restore a persisted counter value.
    pub fn from_value(raw: u64) -> Token {
        return Token(raw);
    }

    /// Advance the counter. Called once per committed change.
    pub fn bump(&mut self) {
        self.0 += 1;
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "{}", self.0);
    }
}

/// Three-way merge over a structure's fields.
///
/// `self` is the transaction's private copy, `theirs` the concurrently
/// committed value, `base` the snapshot the transaction started from.
pub trait Merge: Sized {
    fn merge3(&mut self, theirs: &Self, base: &Self) -> Result<(), Conflict>;
}

/// Post-commit hook for structures that carry their own [`Token`].
pub trait Commit {
    /// Called exactly once when the enclosing transaction commits and this
    /// structure was checked out (i.e. actually changed).
    fn on_commit(&mut self) {}
}

/// Merge a single scalar field under the three-way rule.
pub fn merge_scalar<T: Clone + PartialEq>(
    ours: &mut T,
    theirs: &T,
    base: &T,
    path: &str,
) -> Result<(), Conflict> {
    if *ours == *base {
        // Untouched locally: adopt whatever the other side did.
        *ours = theirs.clone();
        return Ok(());
    }
    if *theirs == *base || *theirs == *ours {
        return Ok(());
    }
    return Err(Conflict::at(path));
}

/// Merge a keyed map of plain values. Insertions, deletions, and value
/// changes each follow the three-way rule per key.
pub fn merge_map<K, V>(
    ours: &mut FxHashMap<K, V>,
    theirs: &FxHashMap<K, V>,
    base: &FxHashMap<K, V>,
    path: &str,
) -> Result<(), Conflict>
where
    K: Clone + Eq + std::hash::Hash,
    V: Clone + PartialEq,
{
    let mut keys: Vec<K> = ours.keys().cloned().collect();
    for key in theirs.keys().chain(base.keys()) {
        if !ours.contains_key(key) && !keys.contains(key) {
            keys.push(key.clone());
        }
    }
    for key in keys {
        let in_base = base.get(&key);
        let in_theirs = theirs.get(&key);
        match (ours.get(&key), in_theirs, in_base) {
            (Some(mine), Some(other), Some(orig)) => {
                if mine == orig {
                    if other != orig {
                        ours.insert(key, other.clone());
                    }
                } else if other != orig && other != mine {
                    return Err(Conflict::at(path));
                }
            }
            // We deleted; ok only if they left it alone.
            (None, Some(other), Some(orig)) => {
                if other != orig {
                    return Err(Conflict::at(path));
                }
            }
            // They deleted; ok only if we left it alone.
            (Some(mine), None, Some(orig)) => {
                if mine == orig {
                    ours.remove(&key);
                } else {
                    return Err(Conflict::at(path));
                }
            }
            // Both added the same key independently.
            (Some(mine), Some(other), None) => {
                if mine != other {
                    return Err(Conflict::at(path));
                }
            }
            // One-sided additions and agreed deletions.
            (Some(_), None, None) => {}
            (None, Some(other), None) => {
                ours.insert(key, other.clone());
            }
            (None, None, _) => {}
        }
    }
    return Ok(());
}

/// Merge a slot-indexed vector (`None` = vacant slot). Slots are compared
/// positionally; growth on either side carries over.
pub fn merge_slots<T>(
    ours: &mut Vec<Option<T>>,
    theirs: &[Option<T>],
    base: &[Option<T>],
    path: &str,
) -> Result<(), Conflict>
where
    T: Clone + PartialEq,
{
    let len = ours.len().max(theirs.len()).max(base.len());
    ours.resize_with(len, || None);
    for i in 0..len {
        let in_theirs = theirs.get(i).and_then(|slot| slot.as_ref());
        let in_base = base.get(i).and_then(|slot| slot.as_ref());
        let mine = ours[i].as_ref();
        let untouched = mine == in_base;
        if untouched {
            if in_theirs != in_base {
                ours[i] = in_theirs.cloned();
            }
        } else if in_theirs != in_base && in_theirs != mine {
            return Err(Conflict::at(format!("{path}[{i}]")));
        }
    }
    return Ok(());
}

/// A shared-or-checked-out snapshot of `T`.
///
/// State machine: `Shared` —`check_out`→ `CheckedOut` —`merge`+`commit`→
/// `Shared` again (or a conflict, abandoning the private copy).
#[derive(Clone, Debug)]
pub struct Versioned<T> {
    data: Arc<T>,
    /// The shared snapshot this copy was cloned from; `None` while shared.
    base: Option<Arc<T>>,
    checked_out: bool,
}

impl<T: Clone> Versioned<T> {
    pub fn new(data: T) -> Versioned<T> {
        return Versioned { data: Arc::new(data), base: None, checked_out: false };
    }

    /// Read access. Never clones, never locks.
    pub fn get(&self) -> &T {
        return &self.data;
    }

    /// Hand out the underlying snapshot. The caller can read it for as
    /// long as it likes without blocking writers.
    pub fn share(&self) -> Arc<T> {
        return Arc::clone(&self.data);
    }

    pub fn is_checked_out(&self) -> bool {
        return self.checked_out;
    }

    /// Make this snapshot privately writable, cloning the shared data the
    /// first time. Idempotent within a transaction.
    pub fn check_out(&mut self) -> &mut T {
        if !self.checked_out {
            self.base = Some(Arc::clone(&self.data));
            self.data = Arc::new(T::clone(&self.data));
            self.checked_out = true;
        }
        // The private copy is uniquely owned: it was freshly allocated on
        // checkout and never shared afterwards.
        return Arc::get_mut(&mut self.data)
            .unwrap_or_else(|| unreachable!("checked-out snapshot is aliased"));
    }

    /// Pointer-identity view of the shared snapshot, for "did they change
    /// it" tests without deep comparison.
    pub fn shares_data_with(&self, other: &Versioned<T>) -> bool {
        return Arc::ptr_eq(&self.data, &other.data);
    }
}

impl<T: Clone + Merge + Commit> Versioned<T> {
    /// Three-way merge against the latest committed snapshot.
    ///
    /// Cheap cases are resolved by pointer identity: if this snapshot was
    /// never checked out it adopts `theirs` wholesale; if `theirs` still is
    /// the base we checked out from, the local copy stands. Only when both
    /// sides moved does the field-wise merge run.
    pub fn merge(&mut self, theirs: &Versioned<T>) -> Result<(), Conflict> {
        if !self.checked_out {
            *self = theirs.clone();
            return Ok(());
        }
        let base = self
            .base
            .as_ref()
            .unwrap_or_else(|| unreachable!("checked-out snapshot has no base"))
            .clone();
        if Arc::ptr_eq(&base, &theirs.data) {
            return Ok(());
        }
        debug!("three-way merge required, both sides changed");
        let data = Arc::get_mut(&mut self.data)
            .unwrap_or_else(|| unreachable!("checked-out snapshot is aliased"));
        return data.merge3(&theirs.data, &base);
    }

    /// Finalize a successful merge: the private copy becomes the new shared
    /// snapshot and the structure's own token advances.
    pub fn commit(&mut self) {
        if !self.checked_out {
            return;
        }
        if let Some(data) = Arc::get_mut(&mut self.data) {
            data.on_commit();
        }
        self.base = None;
        self.checked_out = false;
    }
}

/// Merge a map of nested versioned structures. Entry-level adds and
/// deletes follow the three-way rule; entries present on both sides merge
/// recursively through [`Versioned::merge`].
pub fn merge_versioned_map<K, T>(
    ours: &mut FxHashMap<K, Versioned<T>>,
    theirs: &FxHashMap<K, Versioned<T>>,
    base: &FxHashMap<K, Versioned<T>>,
    path: &str,
) -> Result<(), Conflict>
where
    K: Clone + Eq + std::hash::Hash,
    T: Clone + Merge + Commit,
{
    let mut keys: Vec<K> = ours.keys().cloned().collect();
    for key in theirs.keys().chain(base.keys()) {
        if !ours.contains_key(key) && !keys.contains(key) {
            keys.push(key.clone());
        }
    }
    for key in keys {
        let ours_has = ours.contains_key(&key);
        let in_theirs = theirs.get(&key);
        let in_base = base.get(&key);
        match (ours_has, in_theirs, in_base) {
            (true, Some(other), Some(_)) => {
                let mine = ours.get_mut(&key).unwrap_or_else(|| unreachable!());
                mine.merge(other).map_err(|conflict| conflict.nested(path))?;
            }
            // We deleted the entry; they must not have changed it.
            (false, Some(other), Some(orig)) => {
                if !other.shares_data_with(orig) {
                    return Err(Conflict::at(path));
                }
            }
            // They deleted the entry; we must not have changed it.
            (true, None, Some(_)) => {
                if ours[&key].is_checked_out() {
                    return Err(Conflict::at(path));
                }
                ours.remove(&key);
            }
            // Both sides added the same key independently.
            (true, Some(_), None) => {
                return Err(Conflict::at(path));
            }
            (true, None, None) => {}
            (false, Some(other), None) => {
                ours.insert(key, other.clone());
            }
            (false, None, _) => {}
        }
    }
    return Ok(());
}
