//! The database: dimension and cube collections, transactions, and the
//! load/save/unload lifecycle.
//!
//! Concurrency model:
//!
//! - Readers grab the committed snapshot (an `Arc` graph) under a brief
//!   pointer lock and then read lock-free for as long as they like.
//! - Writers run their whole mutation against a private checked-out copy;
//!   nothing blocks during business logic.
//! - The only serialization point is `try_commit`: merge + pointer swap +
//!   journal append happen under one mutex per database. A merge conflict
//!   retries the entire transaction against a fresh snapshot; contention
//!   on a single dimension is expected to be rare, so the retry loop is
//!   bounded rather than queued.
//!
//! Durability: every committed transaction appends its records to the
//! journal before returning. Journal append and pointer swap are not
//! atomic with each other; the chronological replay at load time is what
//! reconciles a crash between the two.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::context::TransactionContext;
use crate::cube::{CellEngine, Cube, CubeId, CubeKind, purge_kind_for};
use crate::dimension::{Dimension, DimensionId, DimensionKind};
use crate::element::{DeleteKind, ElementId, ElementType};
use crate::error::{Conflict, EngineError, Result};
use crate::journal::replay::{ChronologicalMerge, ReplayItem};
use crate::journal::{Command, JournalWriter, Record, join_list, read_journal};
use crate::storage;
use crate::versioned::{Commit, Merge, Token, Versioned, merge_scalar, merge_versioned_map};

/// How many times a transaction retries after merge conflicts before the
/// engine treats the contention as a bug.
const MERGE_RETRY_LIMIT: usize = 16;

/// Lifecycle of a database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseStatus {
    Unloaded,
    Loading,
    Loaded,
}

/// The versioned value all transactions snapshot: dimension and cube
/// collections plus the id counters.
#[derive(Clone, Debug)]
pub struct DatabaseState {
    pub name: Box<str>,
    pub(crate) dimensions: FxHashMap<DimensionId, Versioned<Dimension>>,
    pub(crate) cubes: FxHashMap<CubeId, Versioned<Cube>>,
    pub(crate) next_dimension_id: u64,
    pub(crate) next_cube_id: u64,
    pub token: Token,
}

impl DatabaseState {
    pub(crate) fn new(name: impl Into<Box<str>>) -> DatabaseState {
        return DatabaseState {
            name: name.into(),
            dimensions: FxHashMap::default(),
            cubes: FxHashMap::default(),
            next_dimension_id: 1,
            next_cube_id: 1,
            token: Token::new(),
        };
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    pub fn dimension(&self, id: DimensionId) -> Result<&Dimension> {
        return self
            .dimensions
            .get(&id)
            .map(Versioned::get)
            .ok_or_else(|| EngineError::NotFound(format!("dimension {id}")));
    }

    pub fn dimension_by_name(&self, name: &str) -> Result<&Dimension> {
        return self
            .dimensions
            .values()
            .map(Versioned::get)
            .find(|dimension| dimension.name.as_ref() == name)
            .ok_or_else(|| EngineError::NotFound(format!("dimension '{name}'")));
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &Dimension> + '_ {
        return self.dimensions.values().map(Versioned::get);
    }

    pub fn cube(&self, id: CubeId) -> Result<&Cube> {
        return self
            .cubes
            .get(&id)
            .map(Versioned::get)
            .ok_or_else(|| EngineError::NotFound(format!("cube {id}")));
    }

    pub fn cube_by_name(&self, name: &str) -> Result<&Cube> {
        return self
            .cubes
            .values()
            .map(Versioned::get)
            .find(|cube| cube.name.as_ref() == name)
            .ok_or_else(|| EngineError::NotFound(format!("cube '{name}'")));
    }

    pub fn cubes(&self) -> impl Iterator<Item = &Cube> + '_ {
        return self.cubes.values().map(Versioned::get);
    }

    /// Follow an alias dimension to its target, one hop, validating that
    /// the target exists. Non-alias dimensions resolve to themselves.
    pub fn resolve_dimension(&self, id: DimensionId) -> Result<DimensionId> {
        match self.dimension(id)?.kind {
            DimensionKind::Alias { target } => {
                self.dimension(target)?;
                return Ok(target);
            }
            _ => return Ok(id),
        }
    }

    // ------------------------------------------------------------------
    // Mutation surface (shared by transactions and journal replay)
    // ------------------------------------------------------------------

    pub(crate) fn dimension_checkout(&mut self, id: DimensionId) -> Result<&mut Dimension> {
        return self
            .dimensions
            .get_mut(&id)
            .map(Versioned::check_out)
            .ok_or_else(|| EngineError::NotFound(format!("dimension {id}")));
    }

    pub(crate) fn create_dimension(
        &mut self,
        explicit_id: Option<DimensionId>,
        name: &str,
        kind: DimensionKind,
    ) -> Result<DimensionId> {
        if self.dimension_by_name(name).is_ok() {
            return Err(EngineError::NameInUse(name.to_string()));
        }
        if let DimensionKind::Alias { target } = kind {
            self.dimension(target)?;
        }
        let id = match explicit_id {
            Some(id) => {
                if self.dimensions.contains_key(&id) {
                    return Err(EngineError::Internal(format!("dimension id {id} already exists")));
                }
                self.next_dimension_id = self.next_dimension_id.max(id.raw() + 1);
                id
            }
            None => {
                let id = DimensionId::new(self.next_dimension_id);
                self.next_dimension_id += 1;
                id
            }
        };
        let mut versioned = Versioned::new(Dimension::new(id, name, kind));
        // A created structure counts as changed within its transaction.
        versioned.check_out();
        self.dimensions.insert(id, versioned);
        return Ok(id);
    }

    pub(crate) fn rename_dimension(&mut self, id: DimensionId, new_name: &str) -> Result<()> {
        let dimension = self.dimension(id)?;
        if dimension.name.as_ref() == new_name {
            return Ok(());
        }
        if !dimension.renamable {
            return Err(EngineError::Unchangeable(format!("dimension {}", dimension.name)));
        }
        if self.dimension_by_name(new_name).is_ok() {
            return Err(EngineError::NameInUse(new_name.to_string()));
        }
        self.dimension_checkout(id)?.name = new_name.into();
        return Ok(());
    }

    pub(crate) fn delete_dimension(&mut self, id: DimensionId) -> Result<()> {
        let dimension = self.dimension(id)?;
        if !dimension.deletable {
            return Err(EngineError::Unchangeable(format!("dimension {}", dimension.name)));
        }
        if let Some(cube) = self.cubes().find(|cube| cube.spans(id)) {
            return Err(EngineError::DimensionLocked(format!(
                "dimension {} is used by cube {}",
                dimension.name, cube.name
            )));
        }
        self.dimensions.remove(&id);
        return Ok(());
    }

    pub(crate) fn create_cube(
        &mut self,
        explicit_id: Option<CubeId>,
        name: &str,
        dimensions: Vec<DimensionId>,
        kind: CubeKind,
    ) -> Result<CubeId> {
        if self.cube_by_name(name).is_ok() {
            return Err(EngineError::NameInUse(name.to_string()));
        }
        for dimension in &dimensions {
            self.dimension(*dimension)?;
        }
        let id = match explicit_id {
            Some(id) => {
                if self.cubes.contains_key(&id) {
                    return Err(EngineError::Internal(format!("cube id {id} already exists")));
                }
                self.next_cube_id = self.next_cube_id.max(id.raw() + 1);
                id
            }
            None => {
                let id = CubeId::new(self.next_cube_id);
                self.next_cube_id += 1;
                id
            }
        };
        let mut versioned = Versioned::new(Cube::new(id, name, dimensions, kind));
        versioned.check_out();
        self.cubes.insert(id, versioned);
        return Ok(id);
    }

    pub(crate) fn delete_cube(&mut self, id: CubeId) -> Result<()> {
        let cube = self.cube(id)?;
        if !cube.deletable {
            return Err(EngineError::Unchangeable(format!("cube {}", cube.name)));
        }
        self.cubes.remove(&id);
        return Ok(());
    }

    /// Settle deferred structural info on every dimension this snapshot
    /// has checked out.
    fn ensure_elements_info(&mut self) {
        for versioned in self.dimensions.values_mut() {
            if versioned.is_checked_out() {
                versioned.check_out().ensure_elements_info();
            }
        }
    }

    /// Clear the checkout flags of every nested structure. Used when a
    /// freshly built state becomes the first committed snapshot.
    pub(crate) fn commit_all(&mut self) {
        for versioned in self.dimensions.values_mut() {
            versioned.commit();
        }
        for versioned in self.cubes.values_mut() {
            versioned.commit();
        }
    }
}

impl Merge for DatabaseState {
    fn merge3(
        &mut self,
        theirs: &DatabaseState,
        base: &DatabaseState,
    ) -> std::result::Result<(), Conflict> {
        merge_scalar(&mut self.name, &theirs.name, &base.name, "database.name")?;
        merge_scalar(
            &mut self.next_dimension_id,
            &theirs.next_dimension_id,
            &base.next_dimension_id,
            "database.next_dimension_id",
        )?;
        merge_scalar(
            &mut self.next_cube_id,
            &theirs.next_cube_id,
            &base.next_cube_id,
            "database.next_cube_id",
        )?;
        merge_versioned_map(&mut self.dimensions, &theirs.dimensions, &base.dimensions, "dimensions")?;
        merge_versioned_map(&mut self.cubes, &theirs.cubes, &base.cubes, "cubes")?;
        self.token = self.token.max(theirs.token);
        return Ok(());
    }
}

impl Commit for DatabaseState {
    fn on_commit(&mut self) {
        self.commit_all();
        self.token.bump();
    }
}

/// Which journal a queued record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JournalTarget {
    Database,
    Cube(CubeId),
}

/// A queued cell purge, dispatched to the cell engine after commit.
struct Purge {
    cube: CubeId,
    dimension: DimensionId,
    elements: Vec<ElementId>,
    kind: DeleteKind,
}

/// A private, consistent snapshot a caller mutates and then commits.
///
/// All reads within the transaction see its own writes. Dropping the
/// transaction without committing abandons the private copy; nothing was
/// ever visible to other threads.
pub struct Transaction {
    ctx: TransactionContext,
    state: Versioned<DatabaseState>,
    records: Vec<(JournalTarget, Record)>,
    purges: Vec<Purge>,
    in_bulk: bool,
}

impl Transaction {
    /// Read view of the transaction's state, including its own writes.
    pub fn state(&self) -> &DatabaseState {
        return self.state.get();
    }

    fn log(&mut self, target: JournalTarget, command: Command, fields: Vec<String>) {
        self.records.push((target, Record::new(&self.ctx, command, fields)));
    }

    /// Run a batch of operations as one journaled bulk section. Replay
    /// buffers the framed records and recomputes derived hierarchy info
    /// once for the whole section instead of once per record, which is
    /// what makes large element loads affordable to recover.
    ///
    /// The frame is closed even when `f` fails partway: operations that
    /// succeeded before the failure are in the transaction state, so
    /// their records must stay journaled in case the caller commits
    /// anyway. Nested calls fold into the outer section.
    pub fn bulk<T>(&mut self, f: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        if self.in_bulk {
            return f(self);
        }
        self.log(JournalTarget::Database, Command::BulkStart, Vec::new());
        self.in_bulk = true;
        let result = f(self);
        self.in_bulk = false;
        self.log(JournalTarget::Database, Command::BulkStop, Vec::new());
        return result;
    }

    /// Queue cell purges for every cube spanning `dimension`.
    fn purge_cubes(&mut self, dimension: DimensionId, elements: Vec<ElementId>, kind: DeleteKind) {
        if kind == DeleteKind::None || elements.is_empty() {
            return;
        }
        let cubes: Vec<CubeId> = self
            .state()
            .cubes()
            .filter(|cube| cube.spans(dimension))
            .map(|cube| cube.id)
            .collect();
        for cube in cubes {
            self.purges.push(Purge { cube, dimension, elements: elements.clone(), kind });
        }
    }

    // ------------------------------------------------------------------
    // Dimension collection operations
    // ------------------------------------------------------------------

    pub fn add_dimension(&mut self, name: &str, kind: DimensionKind) -> Result<DimensionId> {
        let id = self.state.check_out().create_dimension(None, name, kind)?;
        let (kind_code, alias) = kind_fields(kind);
        self.log(
            JournalTarget::Database,
            Command::CreateDimension,
            vec![id.to_string(), name.to_string(), kind_code, alias],
        );
        return Ok(id);
    }

    pub fn rename_dimension(&mut self, id: DimensionId, new_name: &str) -> Result<()> {
        self.state.check_out().rename_dimension(id, new_name)?;
        self.log(
            JournalTarget::Database,
            Command::RenameDimension,
            vec![id.to_string(), new_name.to_string()],
        );
        return Ok(());
    }

    pub fn delete_dimension(&mut self, id: DimensionId) -> Result<()> {
        self.state.check_out().delete_dimension(id)?;
        self.log(JournalTarget::Database, Command::DeleteDimension, vec![id.to_string()]);
        return Ok(());
    }

    // ------------------------------------------------------------------
    // Cube collection operations
    // ------------------------------------------------------------------

    pub fn add_cube(
        &mut self,
        name: &str,
        dimensions: Vec<DimensionId>,
        kind: CubeKind,
    ) -> Result<CubeId> {
        let dimension_list = join_list(dimensions.iter().map(|id| id.raw()));
        let id = self.state.check_out().create_cube(None, name, dimensions, kind)?;
        self.log(
            JournalTarget::Database,
            Command::CreateCube,
            vec![id.to_string(), name.to_string(), dimension_list, kind.code().to_string()],
        );
        return Ok(id);
    }

    pub fn delete_cube(&mut self, id: CubeId) -> Result<()> {
        self.state.check_out().delete_cube(id)?;
        self.log(JournalTarget::Database, Command::DeleteCube, vec![id.to_string()]);
        return Ok(());
    }

    // ------------------------------------------------------------------
    // Element operations (dimension-scoped, alias-resolved)
    // ------------------------------------------------------------------

    pub fn add_element(
        &mut self,
        dimension: DimensionId,
        name: &str,
        kind: ElementType,
    ) -> Result<ElementId> {
        let dimension = self.state().resolve_dimension(dimension)?;
        let id = self.state.check_out().dimension_checkout(dimension)?.add_element(None, name, kind)?;
        self.log(
            JournalTarget::Database,
            Command::CreateElement,
            vec![dimension.to_string(), id.to_string(), name.to_string(), kind.code().to_string()],
        );
        return Ok(id);
    }

    pub fn rename_element(
        &mut self,
        dimension: DimensionId,
        element: ElementId,
        new_name: &str,
    ) -> Result<()> {
        let dimension = self.state().resolve_dimension(dimension)?;
        self.state.check_out().dimension_checkout(dimension)?.rename_element(element, new_name)?;
        self.log(
            JournalTarget::Database,
            Command::RenameElement,
            vec![dimension.to_string(), element.to_string(), new_name.to_string()],
        );
        return Ok(());
    }

    pub fn change_element_type(
        &mut self,
        dimension: DimensionId,
        element: ElementId,
        new_kind: ElementType,
    ) -> Result<()> {
        let dimension = self.state().resolve_dimension(dimension)?;
        let purge = self
            .state
            .check_out()
            .dimension_checkout(dimension)?
            .change_element_type(element, new_kind)?;
        self.log(
            JournalTarget::Database,
            Command::ChangeElementType,
            vec![dimension.to_string(), element.to_string(), new_kind.code().to_string()],
        );
        self.purge_cubes(dimension, vec![element], purge);
        return Ok(());
    }

    pub fn add_children(
        &mut self,
        dimension: DimensionId,
        parent: ElementId,
        children: &[(ElementId, f64)],
        preserve_order: bool,
    ) -> Result<()> {
        let dimension = self.state().resolve_dimension(dimension)?;
        self.state
            .check_out()
            .dimension_checkout(dimension)?
            .add_children(parent, children, preserve_order)?;
        self.log(
            JournalTarget::Database,
            Command::AppendChildren,
            vec![
                dimension.to_string(),
                parent.to_string(),
                join_list(children.iter().map(|(id, _)| id.raw())),
                join_list(children.iter().map(|(_, weight)| *weight)),
                (preserve_order as u32).to_string(),
            ],
        );
        return Ok(());
    }

    pub fn remove_children(&mut self, dimension: DimensionId, parent: ElementId) -> Result<()> {
        return self.remove_children_not_in(dimension, parent, &[]);
    }

    pub fn remove_children_not_in(
        &mut self,
        dimension: DimensionId,
        parent: ElementId,
        keep: &[ElementId],
    ) -> Result<()> {
        let dimension = self.state().resolve_dimension(dimension)?;
        self.state
            .check_out()
            .dimension_checkout(dimension)?
            .remove_children_not_in(parent, keep)?;
        self.log(
            JournalTarget::Database,
            Command::RemoveChildren,
            vec![
                dimension.to_string(),
                parent.to_string(),
                join_list(keep.iter().map(|id| id.raw())),
            ],
        );
        return Ok(());
    }

    pub fn move_element(
        &mut self,
        dimension: DimensionId,
        element: ElementId,
        position: u32,
    ) -> Result<()> {
        let dimension = self.state().resolve_dimension(dimension)?;
        self.state.check_out().dimension_checkout(dimension)?.move_element(element, position)?;
        self.log(
            JournalTarget::Database,
            Command::MoveElement,
            vec![dimension.to_string(), element.to_string(), position.to_string()],
        );
        return Ok(());
    }

    pub fn move_elements(
        &mut self,
        dimension: DimensionId,
        moves: &[(ElementId, u32)],
    ) -> Result<()> {
        for (element, position) in moves {
            self.move_element(dimension, *element, *position)?;
        }
        return Ok(());
    }

    pub fn delete_elements(&mut self, dimension: DimensionId, elements: &[ElementId]) -> Result<()> {
        let dimension = self.state().resolve_dimension(dimension)?;
        let removed =
            self.state.check_out().dimension_checkout(dimension)?.delete_elements(elements)?;
        self.log(
            JournalTarget::Database,
            Command::DeleteElements,
            vec![dimension.to_string(), join_list(elements.iter().map(|id| id.raw()))],
        );
        self.queue_purges_for_removed(dimension, &removed);
        return Ok(());
    }

    pub fn clear_elements(&mut self, dimension: DimensionId) -> Result<()> {
        let dimension = self.state().resolve_dimension(dimension)?;
        let removed = self.state.check_out().dimension_checkout(dimension)?.clear_elements()?;
        self.log(JournalTarget::Database, Command::ClearElements, vec![dimension.to_string()]);
        self.queue_purges_for_removed(dimension, &removed);
        return Ok(());
    }

    fn queue_purges_for_removed(
        &mut self,
        dimension: DimensionId,
        removed: &[crate::element::Element],
    ) {
        let mut by_kind: FxHashMap<DeleteKind, Vec<ElementId>> = FxHashMap::default();
        for element in removed {
            by_kind.entry(purge_kind_for(element)).or_default().push(element.id);
        }
        for (kind, elements) in by_kind {
            self.purge_cubes(dimension, elements, kind);
        }
    }
}

/// Outcome of a single commit attempt.
enum CommitOutcome {
    Committed,
    Conflict(Conflict),
}

/// Journal writers and lifecycle bookkeeping, guarded by the commit lock.
struct Inner {
    status: DatabaseStatus,
    dirty: bool,
    /// False until the first successful save; unload needs somewhere to
    /// reload from.
    saved: bool,
    database_journal: Option<JournalWriter>,
    cube_journals: FxHashMap<CubeId, JournalWriter>,
}

/// One multidimensional database on disk.
pub struct Database {
    directory: PathBuf,
    committed: Mutex<Versioned<DatabaseState>>,
    inner: Mutex<Inner>,
    cell_engine: Mutex<Option<Arc<dyn CellEngine>>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f
            .debug_struct("Database")
            .field("directory", &self.directory)
            .field("status", &self.status())
            .finish_non_exhaustive();
    }
}

impl Database {
    /// Create a fresh, empty, loaded database rooted at `directory`. The
    /// database is dirty and unsaved until the first `save`.
    pub fn create(directory: impl Into<PathBuf>, name: &str) -> Result<Database> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)
            .map_err(|err| EngineError::CorruptFile(format!("create database directory: {err}")))?;
        info!(name, directory = %directory.display(), "database created");
        return Ok(Database {
            directory,
            committed: Mutex::new(Versioned::new(DatabaseState::new(name))),
            inner: Mutex::new(Inner {
                status: DatabaseStatus::Loaded,
                dirty: true,
                saved: false,
                database_journal: None,
                cube_journals: FxHashMap::default(),
            }),
            cell_engine: Mutex::new(None),
        });
    }

    /// Open a database directory and load it: snapshot file, then journal
    /// replay, then (if anything changed) an immediate save.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Database> {
        let database = Database {
            directory: directory.into(),
            committed: Mutex::new(Versioned::new(DatabaseState::new(""))),
            inner: Mutex::new(Inner {
                status: DatabaseStatus::Unloaded,
                dirty: false,
                saved: true,
                database_journal: None,
                cube_journals: FxHashMap::default(),
            }),
            cell_engine: Mutex::new(None),
        };
        database.load()?;
        return Ok(database);
    }

    /// Plug in the external cell storage engine. Purge notifications go
    /// nowhere until this is set.
    pub fn set_cell_engine(&self, engine: Arc<dyn CellEngine>) {
        *self.cell_engine.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(engine);
    }

    pub fn status(&self) -> DatabaseStatus {
        return self.lock_inner().status;
    }

    pub fn directory(&self) -> &Path {
        return &self.directory;
    }

    /// The latest committed snapshot. Readers hold it as long as they
    /// like; it never changes underneath them.
    pub fn snapshot(&self) -> Arc<DatabaseState> {
        return self
            .committed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .share();
    }

    /// Run a read-only closure against the committed snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&DatabaseState) -> T) -> T {
        return f(&self.snapshot());
    }

    /// Begin a transaction against the committed snapshot.
    pub fn begin(&self, ctx: &TransactionContext) -> Result<Transaction> {
        if self.lock_inner().status != DatabaseStatus::Loaded {
            return Err(EngineError::InvalidMode("database is not loaded".to_string()));
        }
        let state = self
            .committed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        return Ok(Transaction {
            ctx: ctx.clone(),
            state,
            records: Vec::new(),
            purges: Vec::new(),
            in_bulk: false,
        });
    }

    /// Run `f` in a transaction, committing on success and retrying the
    /// whole closure on merge conflicts. This is the normal write path.
    pub fn write<T>(
        &self,
        ctx: &TransactionContext,
        f: impl Fn(&mut Transaction) -> Result<T>,
    ) -> Result<T> {
        for attempt in 0..MERGE_RETRY_LIMIT {
            let mut tx = self.begin(ctx)?;
            let value = f(&mut tx)?;
            match self.try_commit(tx)? {
                CommitOutcome::Committed => return Ok(value),
                CommitOutcome::Conflict(conflict) => {
                    debug!(attempt, %conflict, "transaction conflicted, retrying");
                }
            }
        }
        return Err(EngineError::Internal(format!(
            "transaction conflicted {MERGE_RETRY_LIMIT} times"
        )));
    }

    /// Commit a transaction built with `begin`. Exposed for callers that
    /// manage their own retry policy; most code uses `write`.
    pub fn commit(&self, tx: Transaction) -> Result<bool> {
        match self.try_commit(tx)? {
            CommitOutcome::Committed => return Ok(true),
            CommitOutcome::Conflict(_) => return Ok(false),
        }
    }

    fn try_commit(&self, mut tx: Transaction) -> Result<CommitOutcome> {
        if tx.records.is_empty() && !tx.state.is_checked_out() {
            return Ok(CommitOutcome::Committed);
        }
        // Single critical section per database: merge, swap, journal.
        let mut inner = self.lock_inner();
        // Open every journal the records need before the snapshot moves:
        // an open failure here is an ordinary error, afterwards it would
        // be a silently unjournaled commit.
        for (target, _) in &tx.records {
            self.writer_for(&mut inner, *target)?;
        }
        let mut committed = self.committed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(conflict) = tx.state.merge(&committed) {
            return Ok(CommitOutcome::Conflict(conflict));
        }
        tx.state.check_out().ensure_elements_info();
        tx.state.commit();
        *committed = tx.state;
        drop(committed);

        for (target, record) in &tx.records {
            let writer = match self.writer_for(&mut inner, *target) {
                Ok(writer) => writer,
                Err(err) => {
                    // The snapshot moved but the journal is unreachable.
                    // The process cannot promise durability anymore.
                    error!(%err, "journal unavailable after commit, aborting");
                    std::process::abort();
                }
            };
            if let Err(err) = writer.append(record) {
                error!(%err, "journal append failed after commit, aborting");
                std::process::abort();
            }
            if record.command == Command::DeleteCube {
                if let JournalTarget::Database = target {
                    // ignore errors: cube journal may never have existed
                    let _ = self.drop_cube_journal(&mut inner, record);
                }
            }
        }
        let inner_mut = &mut *inner;
        let mut flushed: Vec<&mut JournalWriter> = Vec::new();
        if let Some(writer) = inner_mut.database_journal.as_mut() {
            flushed.push(writer);
        }
        flushed.extend(inner_mut.cube_journals.values_mut());
        for writer in flushed {
            if let Err(err) = writer.flush() {
                error!(%err, "journal flush failed after commit, aborting");
                std::process::abort();
            }
        }
        inner.dirty = true;
        drop(inner);

        self.dispatch_purges(&tx.purges);
        return Ok(CommitOutcome::Committed);
    }

    fn dispatch_purges(&self, purges: &[Purge]) {
        let engine = self
            .cell_engine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(engine) = engine else { return };
        for purge in purges {
            engine.delete_elements(purge.cube, purge.dimension, &purge.elements, purge.kind);
        }
    }

    fn writer_for<'a>(
        &self,
        inner: &'a mut Inner,
        target: JournalTarget,
    ) -> Result<&'a mut JournalWriter> {
        match target {
            JournalTarget::Database => {
                if inner.database_journal.is_none() {
                    inner.database_journal =
                        Some(JournalWriter::open(storage::database_journal_path(&self.directory))?);
                }
                return Ok(inner
                    .database_journal
                    .as_mut()
                    .unwrap_or_else(|| unreachable!()));
            }
            JournalTarget::Cube(id) => {
                if !inner.cube_journals.contains_key(&id) {
                    let writer =
                        JournalWriter::open(storage::cube_journal_path(&self.directory, id))?;
                    inner.cube_journals.insert(id, writer);
                }
                return Ok(inner
                    .cube_journals
                    .get_mut(&id)
                    .unwrap_or_else(|| unreachable!()));
            }
        }
    }

    /// Remove the journal files of a deleted cube so a later replay never
    /// resurrects its records.
    fn drop_cube_journal(&self, inner: &mut Inner, record: &Record) -> Result<()> {
        let id = CubeId::new(record.field_u64(0)?);
        inner.cube_journals.remove(&id);
        let path = storage::cube_journal_path(&self.directory, id);
        let _ = std::fs::remove_file(crate::journal::archive_path(&path));
        let _ = std::fs::remove_file(path);
        return Ok(());
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Load from disk: recover the snapshot file, replay pending journals
    /// chronologically, and save immediately if replay changed anything.
    pub fn load(&self) -> Result<()> {
        {
            let mut inner = self.lock_inner();
            if inner.status == DatabaseStatus::Loaded {
                return Ok(());
            }
            inner.status = DatabaseStatus::Loading;
        }
        let result = self.load_impl();
        let mut inner = self.lock_inner();
        match &result {
            Ok(()) => inner.status = DatabaseStatus::Loaded,
            Err(_) => inner.status = DatabaseStatus::Unloaded,
        }
        return result;
    }

    fn load_impl(&self) -> Result<()> {
        let path = storage::recover_snapshot(&self.directory)?;
        let mut state = storage::read_snapshot(&path)?;
        info!(name = %state.name, "database snapshot loaded, replaying journals");
        let changed = self.replay_journals(&mut state)?;
        state.commit_all();

        {
            let mut committed =
                self.committed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *committed = Versioned::new(state);
        }
        {
            let mut inner = self.lock_inner();
            inner.saved = true;
            inner.dirty = changed;
            inner.status = DatabaseStatus::Loaded;
        }
        if changed {
            // Fold the replayed deltas into a fresh snapshot right away so
            // the journals can be archived and never replayed twice.
            info!("journal replay changed state, saving immediately");
            self.save()?;
        }
        return Ok(());
    }

    /// Chronological k-way replay of the database journal and every cube
    /// journal. Returns whether any record was applied.
    fn replay_journals(&self, state: &mut DatabaseState) -> Result<bool> {
        let mut merge = ChronologicalMerge::new();
        merge.add_stream(read_journal(&storage::database_journal_path(&self.directory))?);
        let mut known_cubes: Vec<CubeId> = state.cubes().map(|cube| cube.id).collect();
        known_cubes.sort();
        for cube in &known_cubes {
            merge.add_stream(read_journal(&storage::cube_journal_path(&self.directory, *cube))?);
        }

        let mut changed = false;
        while let Some(item) = merge.next_item() {
            match item {
                ReplayItem::Single(_, record) => {
                    changed |= self.apply_record(state, &record, &mut merge, &mut known_cubes)?;
                    state.ensure_elements_info();
                }
                ReplayItem::Bulk(_, records) => {
                    // One deferred info pass for the whole section.
                    for record in &records {
                        changed |= self.apply_record(state, record, &mut merge, &mut known_cubes)?;
                    }
                    state.ensure_elements_info();
                }
            }
        }
        return Ok(changed);
    }

    /// Apply one replayed record to the model. Expected-duplicate errors
    /// (the crash happened after journal append and after the mutation
    /// reached the last saved snapshot) are logged and skipped so replay
    /// stays idempotent.
    fn apply_record(
        &self,
        state: &mut DatabaseState,
        record: &Record,
        merge: &mut ChronologicalMerge,
        known_cubes: &mut Vec<CubeId>,
    ) -> Result<bool> {
        let outcome = self.apply_record_impl(state, record, merge, known_cubes);
        match outcome {
            Ok(()) => return Ok(true),
            Err(err @ (EngineError::CorruptFile(_) | EngineError::InvalidVersion { .. })) => {
                return Err(err);
            }
            Err(err) => {
                warn!(command = record.command.name(), %err, "skipping unappliable journal record");
                return Ok(false);
            }
        }
    }

    fn apply_record_impl(
        &self,
        state: &mut DatabaseState,
        record: &Record,
        merge: &mut ChronologicalMerge,
        known_cubes: &mut Vec<CubeId>,
    ) -> Result<()> {
        match record.command {
            Command::CreateDimension => {
                let id = DimensionId::new(record.field_u64(0)?);
                let kind = parse_kind_fields(record, 2)?;
                state.create_dimension(Some(id), record.field(1)?, kind)?;
            }
            Command::RenameDimension => {
                let id = DimensionId::new(record.field_u64(0)?);
                state.rename_dimension(id, record.field(1)?)?;
            }
            Command::DeleteDimension => {
                state.delete_dimension(DimensionId::new(record.field_u64(0)?))?;
            }
            Command::CreateElement => {
                let dimension = DimensionId::new(record.field_u64(0)?);
                let element = ElementId::new(record.field_u64(1)?);
                let kind = ElementType::from_code(record.field_u32(3)?).ok_or_else(|| {
                    EngineError::CorruptFile("bad element type in journal".to_string())
                })?;
                state.dimension_checkout(dimension)?.add_element(
                    Some(element),
                    record.field(2)?,
                    kind,
                )?;
            }
            Command::RenameElement => {
                let dimension = DimensionId::new(record.field_u64(0)?);
                let element = ElementId::new(record.field_u64(1)?);
                state.dimension_checkout(dimension)?.rename_element(element, record.field(2)?)?;
            }
            Command::ChangeElementType => {
                let dimension = DimensionId::new(record.field_u64(0)?);
                let element = ElementId::new(record.field_u64(1)?);
                let kind = ElementType::from_code(record.field_u32(2)?).ok_or_else(|| {
                    EngineError::CorruptFile("bad element type in journal".to_string())
                })?;
                state.dimension_checkout(dimension)?.change_element_type(element, kind)?;
            }
            Command::AppendChildren => {
                let dimension = DimensionId::new(record.field_u64(0)?);
                let parent = ElementId::new(record.field_u64(1)?);
                let ids = record.field_u64s(2)?;
                let weights = record.field_f64s(3)?;
                if ids.len() != weights.len() {
                    return Err(EngineError::CorruptFile(
                        "child id and weight lists differ in length".to_string(),
                    ));
                }
                let preserve_order = record.field_u32(4)? != 0;
                let children: Vec<(ElementId, f64)> = ids
                    .into_iter()
                    .map(ElementId::new)
                    .zip(weights)
                    .collect();
                state
                    .dimension_checkout(dimension)?
                    .add_children(parent, &children, preserve_order)?;
            }
            Command::RemoveChildren => {
                let dimension = DimensionId::new(record.field_u64(0)?);
                let parent = ElementId::new(record.field_u64(1)?);
                let keep: Vec<ElementId> =
                    record.field_u64s(2)?.into_iter().map(ElementId::new).collect();
                state.dimension_checkout(dimension)?.remove_children_not_in(parent, &keep)?;
            }
            Command::MoveElement => {
                let dimension = DimensionId::new(record.field_u64(0)?);
                let element = ElementId::new(record.field_u64(1)?);
                state.dimension_checkout(dimension)?.move_element(element, record.field_u32(2)?)?;
            }
            Command::DeleteElements => {
                let dimension = DimensionId::new(record.field_u64(0)?);
                let ids: Vec<ElementId> =
                    record.field_u64s(1)?.into_iter().map(ElementId::new).collect();
                state.dimension_checkout(dimension)?.delete_elements(&ids)?;
            }
            Command::ClearElements => {
                let dimension = DimensionId::new(record.field_u64(0)?);
                state.dimension_checkout(dimension)?.clear_elements()?;
            }
            Command::CreateCube => {
                let id = CubeId::new(record.field_u64(0)?);
                let dimensions: Vec<DimensionId> =
                    record.field_u64s(2)?.into_iter().map(DimensionId::new).collect();
                let kind = CubeKind::from_code(record.field_u32(3)?).ok_or_else(|| {
                    EngineError::CorruptFile("bad cube kind in journal".to_string())
                })?;
                state.create_cube(Some(id), record.field(1)?, dimensions, kind)?;
                // The new cube's journal joins the merge set from here on.
                if !known_cubes.contains(&id) {
                    known_cubes.push(id);
                    merge.add_stream(read_journal(&storage::cube_journal_path(
                        &self.directory,
                        id,
                    ))?);
                }
            }
            Command::DeleteCube => {
                state.delete_cube(CubeId::new(record.field_u64(0)?))?;
            }
            Command::Version | Command::BulkStart | Command::BulkStop => {
                // Framing records carry no model change.
            }
        }
        return Ok(());
    }

    /// Persist a consistent snapshot: write the temporary file, atomically
    /// replace the primary, then archive the journals. A no-op when
    /// nothing is dirty.
    pub fn save(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.status != DatabaseStatus::Loaded {
            return Err(EngineError::InvalidMode("database is not loaded".to_string()));
        }
        if !inner.dirty && inner.saved {
            return Ok(());
        }
        let state = self
            .committed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .share();

        let tmp = storage::tmp_snapshot_path(&self.directory);
        storage::write_snapshot(&tmp, &state)?;

        let primary = storage::snapshot_path(&self.directory);
        if primary.exists() {
            if let Err(err) = std::fs::remove_file(&primary) {
                error!(%err, "cannot remove primary snapshot, aborting");
                std::process::abort();
            }
        }
        if let Err(err) = std::fs::rename(&tmp, &primary) {
            error!(%err, "cannot promote snapshot, aborting");
            std::process::abort();
        }

        // Journals are archived only after the new primary is in place.
        // Up to that point a crash recovers from the old primary plus the
        // still-live journals; afterwards a leftover live journal merely
        // replays records the snapshot already holds, which replay skips.
        self.archive_journals(&mut inner, &state)?;

        inner.dirty = false;
        inner.saved = true;
        info!(name = %state.name, "database saved");
        return Ok(());
    }

    fn archive_journals(&self, inner: &mut Inner, state: &DatabaseState) -> Result<()> {
        let writer = self.writer_for(inner, JournalTarget::Database)?;
        writer.archive()?;
        let mut cube_ids: Vec<CubeId> = state.cubes().map(|cube| cube.id).collect();
        cube_ids.sort();
        for cube in cube_ids {
            if storage::cube_journal_path(&self.directory, cube).exists() {
                let writer = self.writer_for(inner, JournalTarget::Cube(cube))?;
                writer.archive()?;
            }
        }
        return Ok(());
    }

    /// Discard the in-memory state. Fails if the database has never been
    /// saved, because there would be nowhere to reload it from. Committed
    /// writes since the last save are already journaled; a later load
    /// replays them, so a dirty-but-saved database unloads fine.
    pub fn unload(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.status != DatabaseStatus::Loaded {
            return Ok(());
        }
        if !inner.saved {
            return Err(EngineError::DatabaseUnsaved(
                "unload needs a snapshot to reload from".to_string(),
            ));
        }
        let mut committed = self.committed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *committed = Versioned::new(DatabaseState::new(""));
        inner.status = DatabaseStatus::Unloaded;
        inner.database_journal = None;
        inner.cube_journals.clear();
        info!("database unloaded");
        return Ok(());
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        return self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    }
}

fn kind_fields(kind: DimensionKind) -> (String, String) {
    let alias = match kind {
        DimensionKind::Alias { target } => target.to_string(),
        _ => String::new(),
    };
    return (kind.code().to_string(), alias);
}

fn parse_kind_fields(record: &Record, at: usize) -> Result<DimensionKind> {
    let code = record.field_u32(at)?;
    let alias = record.field(at + 1)?;
    let target = if alias.is_empty() {
        None
    } else {
        Some(DimensionId::new(alias.parse().map_err(|_| {
            EngineError::CorruptFile("bad alias target in journal".to_string())
        })?))
    };
    return DimensionKind::from_code(code, target)
        .ok_or_else(|| EngineError::CorruptFile("bad dimension kind in journal".to_string()));
}
