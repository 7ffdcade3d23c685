//! Save/load lifecycle and the tmp-file crash protocol.

use rollup::context::TransactionContext;
use rollup::cube::CubeKind;
use rollup::database::{Database, DatabaseStatus};
use rollup::dimension::DimensionKind;
use rollup::element::ElementType;
use rollup::error::EngineError;

fn ctx() -> TransactionContext {
    return TransactionContext::new("alice", "persistence-test");
}

fn populate(database: &Database) {
    database
        .write(&ctx(), |tx| {
            let products = tx.add_dimension("Products", DimensionKind::Normal)?;
            let months = tx.add_dimension("Months", DimensionKind::Normal)?;
            let desktop = tx.add_element(products, "Desktop", ElementType::Numeric)?;
            let notebook = tx.add_element(products, "Notebook", ElementType::Numeric)?;
            let total = tx.add_element(products, "Total", ElementType::Numeric)?;
            tx.add_children(products, total, &[(desktop, 1.0), (notebook, 2.5)], true)?;
            tx.add_element(months, "Jan", ElementType::Numeric)?;
            tx.add_cube("Sales", vec![products, months], CubeKind::Normal)?;
            Ok(())
        })
        .unwrap();
}

// =============================================================================
// Round trips
// =============================================================================

#[test]
fn saved_databases_reload_identically() {
    let dir = tempfile::tempdir().unwrap();
    let database = Database::create(dir.path(), "demo").unwrap();
    populate(&database);
    database.save().unwrap();

    let reloaded = Database::open(dir.path()).unwrap();
    let snapshot = reloaded.snapshot();
    assert_eq!(snapshot.name.as_ref(), "demo");
    let products = snapshot.dimension_by_name("Products").unwrap();
    assert_eq!(products.len(), 3);
    let total = products.element_by_name("Total").unwrap();
    let notebook = products.element_by_name("Notebook").unwrap();
    assert_eq!(total.kind, ElementType::Consolidated);
    assert_eq!(total.base.get(notebook.id), Some(2.5));
    assert_eq!(products.max_level(), 1);
    let cube = snapshot.cube_by_name("Sales").unwrap();
    assert_eq!(cube.dimensions.len(), 2);
}

#[test]
fn reload_is_a_fixed_point() {
    let dir = tempfile::tempdir().unwrap();
    let database = Database::create(dir.path(), "demo").unwrap();
    populate(&database);
    database.save().unwrap();
    let first = std::fs::read_to_string(dir.path().join("database.csv")).unwrap();

    // Load, mutate, save, and compare the stable parts: loading alone must
    // not perturb what a save writes.
    let reloaded = Database::open(dir.path()).unwrap();
    reloaded
        .write(&ctx(), |tx| {
            let products = tx.state().dimension_by_name("Products")?.id;
            tx.add_element(products, "Tablet", ElementType::Numeric)?;
            Ok(())
        })
        .unwrap();
    reloaded.save().unwrap();
    let second = std::fs::read_to_string(dir.path().join("database.csv")).unwrap();
    assert_ne!(first, second);
    assert!(second.contains("Tablet"));

    // A load/save cycle with no writes is byte-stable.
    let again = Database::open(dir.path()).unwrap();
    drop(again);
    let third = std::fs::read_to_string(dir.path().join("database.csv")).unwrap();
    assert_eq!(second, third);
}

// =============================================================================
// Crash protocol
// =============================================================================

#[test]
fn lone_tmp_snapshot_is_promoted() {
    let dir = tempfile::tempdir().unwrap();
    let database = Database::create(dir.path(), "demo").unwrap();
    populate(&database);
    database.save().unwrap();

    // Simulate a crash between removing the primary and the rename.
    let primary = dir.path().join("database.csv");
    let tmp = dir.path().join("database.csv.tmp");
    std::fs::rename(&primary, &tmp).unwrap();

    let reloaded = Database::open(dir.path()).unwrap();
    assert!(reloaded.snapshot().dimension_by_name("Products").is_ok());
    assert!(primary.exists());
    assert!(!tmp.exists());
}

#[test]
fn stale_tmp_next_to_primary_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let database = Database::create(dir.path(), "demo").unwrap();
    populate(&database);
    database.save().unwrap();

    // Simulate a crash in the middle of writing the tmp file.
    let tmp = dir.path().join("database.csv.tmp");
    std::fs::write(&tmp, "VERSION;1;0;1\nDATABASE;truncated").unwrap();

    let reloaded = Database::open(dir.path()).unwrap();
    assert!(reloaded.snapshot().dimension_by_name("Products").is_ok());
    assert!(!tmp.exists());
}

#[test]
fn empty_directory_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let err = Database::open(dir.path()).unwrap_err();
    assert!(matches!(err, EngineError::CorruptFile(_)));
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn unsaved_databases_refuse_to_unload() {
    let dir = tempfile::tempdir().unwrap();
    let database = Database::create(dir.path(), "demo").unwrap();
    populate(&database);

    let err = database.unload().unwrap_err();
    assert!(matches!(err, EngineError::DatabaseUnsaved(_)));

    database.save().unwrap();
    database.unload().unwrap();
    assert_eq!(database.status(), DatabaseStatus::Unloaded);

    // Unloaded databases refuse transactions but can load again.
    assert!(matches!(database.begin(&ctx()), Err(EngineError::InvalidMode(_))));
    database.load().unwrap();
    assert!(database.snapshot().dimension_by_name("Products").is_ok());
}

#[test]
fn journaled_writes_survive_an_unload() {
    let dir = tempfile::tempdir().unwrap();
    let database = Database::create(dir.path(), "demo").unwrap();
    populate(&database);
    database.save().unwrap();

    // Committed but never saved: the journal alone carries it.
    database
        .write(&ctx(), |tx| {
            let products = tx.state().dimension_by_name("Products")?.id;
            tx.add_element(products, "Tablet", ElementType::Numeric)?;
            Ok(())
        })
        .unwrap();

    database.unload().unwrap();
    database.load().unwrap();
    let products = database.snapshot().dimension_by_name("Products").unwrap().id;
    assert!(database.snapshot().dimension(products).unwrap().element_by_name("Tablet").is_ok());
}

#[test]
fn save_without_changes_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let database = Database::create(dir.path(), "demo").unwrap();
    populate(&database);
    database.save().unwrap();
    let before = std::fs::metadata(dir.path().join("database.csv")).unwrap().modified().unwrap();

    database.save().unwrap();
    let after = std::fs::metadata(dir.path().join("database.csv")).unwrap().modified().unwrap();
    assert_eq!(before, after);
}
