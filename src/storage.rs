//! Snapshot persistence: the sectioned text file a database saves to.
//!
//! The snapshot is a line-oriented text file in the same field dialect as
//! the journal (`;`-separated, CSV-style quoting, comma-separated
//! sub-lists). Sections appear in a fixed order:
//!
//! ```text
//! VERSION;release;service_release;build
//! DATABASE;name;next_dimension_id;next_cube_id;token
//! DIMENSIONS;count
//! id;name;kind;alias;deletable;renamable;changeable;next_element_id;token
//! ELEMENTS;dimension_id;count          (one section per dimension)
//! id;name;position;type;protected;string_consolidation;parents;children;weights
//! CUBES;count
//! id;name;dimensions;kind;deletable;token
//! ```
//!
//! Element rows are written in position order and derived info (base sets,
//! levels, maxima) is rebuilt on load rather than persisted, so a snapshot
//! written from a loaded snapshot is byte-identical.
//!
//! Crash protocol: `save` writes the complete snapshot to `database.csv.tmp`,
//! removes the primary, renames the tmp into place, and only then archives
//! the journals. `recover_snapshot` inverts that at load time: a tmp
//! without a primary is a completed save that died before the rename and
//! is promoted; a tmp next to a primary is an unfinished write and is
//! discarded, the primary plus the still-live journals being authoritative.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::cube::{Cube, CubeId, CubeKind};
use crate::database::DatabaseState;
use crate::dimension::{Dimension, DimensionId, DimensionKind};
use crate::element::{Element, ElementId, ElementType};
use crate::error::{EngineError, Result};
use crate::journal::{escape, join_list, split_line};
use crate::versioned::{Token, Versioned};

/// Current snapshot format version.
pub const SNAPSHOT_RELEASE: u32 = 1;
pub const SNAPSHOT_SERVICE_RELEASE: u32 = 0;
pub const SNAPSHOT_BUILD: u32 = 1;

/// Snapshots written before this release cannot be read.
pub const MIN_SUPPORTED_SNAPSHOT: u32 = 1;

pub(crate) fn snapshot_path(directory: &Path) -> PathBuf {
    return directory.join("database.csv");
}

pub(crate) fn tmp_snapshot_path(directory: &Path) -> PathBuf {
    return directory.join("database.csv.tmp");
}

pub(crate) fn database_journal_path(directory: &Path) -> PathBuf {
    return directory.join("database.log");
}

pub(crate) fn cube_journal_path(directory: &Path, cube: CubeId) -> PathBuf {
    return directory.join(format!("cube_{}.log", cube.raw()));
}

/// Pick the snapshot file to load, applying the crash recovery rules.
pub(crate) fn recover_snapshot(directory: &Path) -> Result<PathBuf> {
    let primary = snapshot_path(directory);
    let tmp = tmp_snapshot_path(directory);
    match (primary.exists(), tmp.exists()) {
        (true, true) => {
            // The save died while writing the tmp; the primary is intact.
            warn!(tmp = %tmp.display(), "discarding unfinished snapshot write");
            std::fs::remove_file(&tmp)
                .map_err(|err| EngineError::CorruptFile(format!("remove stale tmp: {err}")))?;
            return Ok(primary);
        }
        (true, false) => return Ok(primary),
        (false, true) => {
            // The save died between removing the primary and the rename;
            // the tmp is a complete snapshot.
            info!(tmp = %tmp.display(), "promoting completed snapshot write");
            std::fs::rename(&tmp, &primary)
                .map_err(|err| EngineError::CorruptFile(format!("promote tmp snapshot: {err}")))?;
            return Ok(primary);
        }
        (false, false) => {
            return Err(EngineError::CorruptFile(format!(
                "no snapshot in {}",
                directory.display()
            )));
        }
    }
}

/// Write a complete snapshot of `state` to `path` and sync it to disk.
pub(crate) fn write_snapshot(path: &Path, state: &DatabaseState) -> Result<()> {
    let file = File::create(path)
        .map_err(|err| EngineError::CorruptFile(format!("create snapshot {}: {err}", path.display())))?;
    let mut out = BufWriter::new(file);
    write_snapshot_to(&mut out, state)
        .map_err(|err| EngineError::Internal(format!("write snapshot: {err}")))?;
    let file = out
        .into_inner()
        .map_err(|err| EngineError::Internal(format!("flush snapshot: {err}")))?;
    file.sync_all()
        .map_err(|err| EngineError::Internal(format!("sync snapshot: {err}")))?;
    return Ok(());
}

fn write_snapshot_to(out: &mut impl Write, state: &DatabaseState) -> std::io::Result<()> {
    writeln!(out, "VERSION;{SNAPSHOT_RELEASE};{SNAPSHOT_SERVICE_RELEASE};{SNAPSHOT_BUILD}")?;
    writeln!(
        out,
        "DATABASE;{};{};{};{}",
        escape(&state.name),
        state.next_dimension_id,
        state.next_cube_id,
        state.token.value()
    )?;

    let mut dimensions: Vec<&Dimension> = state.dimensions().collect();
    dimensions.sort_by_key(|dimension| dimension.id);
    writeln!(out, "DIMENSIONS;{}", dimensions.len())?;
    for dimension in &dimensions {
        let alias = match dimension.kind {
            DimensionKind::Alias { target } => target.to_string(),
            _ => String::new(),
        };
        writeln!(
            out,
            "{};{};{};{};{};{};{};{};{}",
            dimension.id,
            escape(&dimension.name),
            dimension.kind.code(),
            alias,
            dimension.deletable as u32,
            dimension.renamable as u32,
            dimension.changeable as u32,
            dimension.next_element_id(),
            dimension.token.value()
        )?;
    }
    for dimension in &dimensions {
        writeln!(out, "ELEMENTS;{};{}", dimension.id, dimension.len())?;
        for element in dimension.elements() {
            writeln!(
                out,
                "{};{};{};{};{};{};{};{};{}",
                element.id,
                escape(&element.name),
                element.position,
                element.kind.code(),
                element.protected as u32,
                element.string_consolidation as u32,
                join_list(element.parents.iter().map(|id| id.raw())),
                join_list(element.children.iter().map(|(id, _)| id.raw())),
                join_list(element.children.iter().map(|(_, weight)| *weight))
            )?;
        }
    }

    let mut cubes: Vec<&Cube> = state.cubes().collect();
    cubes.sort_by_key(|cube| cube.id);
    writeln!(out, "CUBES;{}", cubes.len())?;
    for cube in &cubes {
        writeln!(
            out,
            "{};{};{};{};{};{}",
            cube.id,
            escape(&cube.name),
            join_list(cube.dimensions.iter().map(|id| id.raw())),
            cube.kind.code(),
            cube.deletable as u32,
            cube.token.value()
        )?;
    }
    return Ok(());
}

/// Parse a snapshot file back into a database state.
pub(crate) fn read_snapshot(path: &Path) -> Result<DatabaseState> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| EngineError::CorruptFile(format!("read snapshot {}: {err}", path.display())))?;
    let mut lines = Cursor::new(&contents);

    let version = lines.section("VERSION")?;
    let release = parse_u32(version.field(1)?)?;
    if release < MIN_SUPPORTED_SNAPSHOT {
        return Err(EngineError::InvalidVersion { found: release, minimum: MIN_SUPPORTED_SNAPSHOT });
    }

    let header = lines.section("DATABASE")?;
    let mut state = DatabaseState::new(header.field(1)?.to_string());
    state.next_dimension_id = parse_u64(header.field(2)?)?;
    state.next_cube_id = parse_u64(header.field(3)?)?;
    state.token = Token::from_value(parse_u64(header.field(4)?)?);

    let count = parse_u64(lines.section("DIMENSIONS")?.field(1)?)?;
    let mut loaded: Vec<Dimension> = Vec::new();
    for _ in 0..count {
        let row = lines.row()?;
        let id = DimensionId::new(parse_u64(row.field(0)?)?);
        let alias = row.field(3)?;
        let target = if alias.is_empty() {
            None
        } else {
            Some(DimensionId::new(parse_u64(alias)?))
        };
        let kind = DimensionKind::from_code(parse_u32(row.field(2)?)?, target)
            .ok_or_else(|| corrupt("unknown dimension kind"))?;
        if loaded.iter().any(|dimension| dimension.id == id) {
            return Err(corrupt("duplicate dimension id"));
        }
        loaded.push(Dimension::from_snapshot(
            id,
            row.field(1)?.into(),
            kind,
            parse_bool(row.field(4)?)?,
            parse_bool(row.field(5)?)?,
            parse_bool(row.field(6)?)?,
            parse_u64(row.field(7)?)?,
            Token::from_value(parse_u64(row.field(8)?)?),
        ));
    }

    // Elements fill the plain dimensions before they are wrapped, so
    // loading never counts as a checkout and tokens stay put.
    for dimension in &mut loaded {
        let header = lines.section("ELEMENTS")?;
        let id = DimensionId::new(parse_u64(header.field(1)?)?);
        if id != dimension.id {
            return Err(corrupt("element sections out of order"));
        }
        let count = parse_u64(header.field(2)?)?;
        for position in 0..count {
            let row = lines.row()?;
            let element = parse_element(&row, position as u32)?;
            dimension.insert_snapshot_element(element);
        }
        dimension.finish_snapshot_load();
    }
    for dimension in loaded {
        state.dimensions.insert(dimension.id, Versioned::new(dimension));
    }

    let count = parse_u64(lines.section("CUBES")?.field(1)?)?;
    for _ in 0..count {
        let row = lines.row()?;
        let id = CubeId::new(parse_u64(row.field(0)?)?);
        let dimensions: Vec<DimensionId> =
            parse_u64_list(row.field(2)?)?.into_iter().map(DimensionId::new).collect();
        for dimension in &dimensions {
            state.dimension(*dimension)?;
        }
        let kind = CubeKind::from_code(parse_u32(row.field(3)?)?)
            .ok_or_else(|| corrupt("unknown cube kind"))?;
        let mut cube = Cube::new(id, row.field(1)?.to_string(), dimensions, kind);
        cube.deletable = parse_bool(row.field(4)?)?;
        cube.token = Token::from_value(parse_u64(row.field(5)?)?);
        if state.cubes.insert(id, Versioned::new(cube)).is_some() {
            return Err(corrupt("duplicate cube id"));
        }
    }

    return Ok(state);
}

fn parse_element(row: &Row, expected_position: u32) -> Result<Element> {
    let id = ElementId::new(parse_u64(row.field(0)?)?);
    let position = parse_u32(row.field(2)?)?;
    if position != expected_position {
        return Err(corrupt("element positions are not dense"));
    }
    let kind = ElementType::from_code(parse_u32(row.field(3)?)?)
        .ok_or_else(|| corrupt("unknown element type"))?;
    let mut element = Element::new(id, row.field(1)?.to_string(), kind, position);
    element.protected = parse_bool(row.field(4)?)?;
    element.string_consolidation = parse_bool(row.field(5)?)?;
    element.parents = parse_u64_list(row.field(6)?)?.into_iter().map(ElementId::new).collect();
    let children = parse_u64_list(row.field(7)?)?;
    let weights = parse_f64_list(row.field(8)?)?;
    if children.len() != weights.len() {
        return Err(corrupt("child id and weight lists differ in length"));
    }
    element.children = children.into_iter().map(ElementId::new).zip(weights).collect();
    return Ok(element);
}

// ----------------------------------------------------------------------
// Line cursor and field parsing
// ----------------------------------------------------------------------

struct Row {
    fields: Vec<String>,
}

impl Row {
    fn field(&self, i: usize) -> Result<&str> {
        return self
            .fields
            .get(i)
            .map(String::as_str)
            .ok_or_else(|| corrupt(&format!("missing snapshot field {i}")));
    }
}

struct Cursor<'a> {
    lines: std::str::Lines<'a>,
}

impl<'a> Cursor<'a> {
    fn new(contents: &'a str) -> Cursor<'a> {
        return Cursor { lines: contents.lines() };
    }

    fn row(&mut self) -> Result<Row> {
        let line = loop {
            match self.lines.next() {
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
                None => return Err(corrupt("snapshot ends early")),
            }
        };
        let fields = split_line(line).map_err(|err| corrupt(&format!("bad snapshot line: {err}")))?;
        return Ok(Row { fields });
    }

    /// The next row, which must start with the given section tag.
    fn section(&mut self, tag: &str) -> Result<Row> {
        let row = self.row()?;
        if row.field(0)? != tag {
            return Err(corrupt(&format!("expected {tag} section")));
        }
        return Ok(row);
    }
}

fn corrupt(message: &str) -> EngineError {
    return EngineError::CorruptFile(message.to_string());
}

fn parse_u64(raw: &str) -> Result<u64> {
    return raw.parse().map_err(|_| corrupt(&format!("bad number: {raw}")));
}

fn parse_u32(raw: &str) -> Result<u32> {
    return raw.parse().map_err(|_| corrupt(&format!("bad number: {raw}")));
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw {
        "0" => return Ok(false),
        "1" => return Ok(true),
        _ => return Err(corrupt(&format!("bad flag: {raw}"))),
    }
}

fn parse_u64_list(raw: &str) -> Result<Vec<u64>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    return raw.split(',').map(parse_u64).collect();
}

fn parse_f64_list(raw: &str) -> Result<Vec<f64>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    return raw
        .split(',')
        .map(|part| part.parse().map_err(|_| corrupt(&format!("bad weight: {part}"))))
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> DatabaseState {
        let mut state = DatabaseState::new("demo");
        let products = state
            .create_dimension(None, "Products; \"special\"", DimensionKind::Normal)
            .unwrap();
        let months = state.create_dimension(None, "Months", DimensionKind::Normal).unwrap();
        {
            let dimension = state.dimension_checkout(products).unwrap();
            let a = dimension.add_element(None, "Desktop", ElementType::Numeric).unwrap();
            let b = dimension.add_element(None, "Notebook", ElementType::Numeric).unwrap();
            let total = dimension.add_element(None, "Total", ElementType::Numeric).unwrap();
            dimension.add_children(total, &[(a, 1.0), (b, 2.5)], true).unwrap();
        }
        {
            let dimension = state.dimension_checkout(months).unwrap();
            dimension.add_element(None, "Jan", ElementType::Numeric).unwrap();
        }
        state.create_cube(None, "Sales", vec![products, months], CubeKind::Normal).unwrap();
        state.commit_all();
        return state;
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.csv");
        let state = sample_state();
        write_snapshot(&path, &state).unwrap();

        let loaded = read_snapshot(&path).unwrap();
        assert_eq!(loaded.name, state.name);
        let products = loaded.dimension_by_name("Products; \"special\"").unwrap();
        assert_eq!(products.len(), 3);
        let total = products.element_by_name("Total").unwrap();
        let b = products.element_by_name("Notebook").unwrap();
        // Derived info was rebuilt, not copied.
        assert_eq!(total.base.get(b.id), Some(2.5));
        assert_eq!(total.level, 1);
        let cube = loaded.cube_by_name("Sales").unwrap();
        assert_eq!(cube.dimensions.len(), 2);
    }

    #[test]
    fn snapshot_write_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.csv");
        let second = dir.path().join("second.csv");
        let state = sample_state();
        write_snapshot(&first, &state).unwrap();

        let loaded = read_snapshot(&first).unwrap();
        write_snapshot(&second, &loaded).unwrap();
        assert_eq!(
            std::fs::read_to_string(&first).unwrap(),
            std::fs::read_to_string(&second).unwrap()
        );
    }

    #[test]
    fn recovery_promotes_lone_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let state = sample_state();
        write_snapshot(&tmp_snapshot_path(dir.path()), &state).unwrap();

        let path = recover_snapshot(dir.path()).unwrap();
        assert_eq!(path, snapshot_path(dir.path()));
        assert!(!tmp_snapshot_path(dir.path()).exists());
        assert!(read_snapshot(&path).is_ok());
    }

    #[test]
    fn recovery_discards_tmp_next_to_primary() {
        let dir = tempfile::tempdir().unwrap();
        let state = sample_state();
        write_snapshot(&snapshot_path(dir.path()), &state).unwrap();
        std::fs::write(tmp_snapshot_path(dir.path()), "partial garbage").unwrap();

        let path = recover_snapshot(dir.path()).unwrap();
        assert_eq!(path, snapshot_path(dir.path()));
        assert!(!tmp_snapshot_path(dir.path()).exists());
    }

    #[test]
    fn missing_snapshot_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(recover_snapshot(dir.path()), Err(EngineError::CorruptFile(_))));
    }

    #[test]
    fn future_minimum_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.csv");
        std::fs::write(&path, "VERSION;0;0;1\nDATABASE;demo;1;1;0\nDIMENSIONS;0\nCUBES;0\n").unwrap();
        let err = read_snapshot(&path).unwrap_err();
        assert_eq!(err, EngineError::InvalidVersion { found: 0, minimum: MIN_SUPPORTED_SNAPSHOT });
    }
}
