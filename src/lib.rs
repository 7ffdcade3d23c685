//! Rollup - an in-memory multidimensional storage engine.
//!
//! Dimensions hold ordered elements with weighted consolidation
//! hierarchies; cubes span dimensions; every change runs in a
//! copy-on-write transaction that merges three-way at commit and lands in
//! an append-only journal. Loading a database replays pending journals
//! chronologically on top of the last saved snapshot.
//!
//! # Quick Start
//!
//! ```
//! use rollup::context::TransactionContext;
//! use rollup::database::Database;
//! use rollup::element::ElementType;
//! use rollup::dimension::DimensionKind;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let database = Database::create(dir.path(), "demo").unwrap();
//! let ctx = TransactionContext::new("alice", "quick-start");
//!
//! let products = database.write(&ctx, |tx| {
//!     let products = tx.add_dimension("Products", DimensionKind::Normal)?;
//!     let desktop = tx.add_element(products, "Desktop", ElementType::Numeric)?;
//!     let notebook = tx.add_element(products, "Notebook", ElementType::Numeric)?;
//!     let total = tx.add_element(products, "Total", ElementType::Numeric)?;
//!     tx.add_children(products, total, &[(desktop, 1.0), (notebook, 1.0)], true)?;
//!     Ok(products)
//! }).unwrap();
//!
//! let snapshot = database.snapshot();
//! let total = snapshot.dimension(products).unwrap().element_by_name("Total").unwrap();
//! assert_eq!(total.level, 1);
//! database.save().unwrap();
//! ```

pub mod context;
pub mod cube;
pub mod database;
pub mod dimension;
pub mod element;
pub mod error;
pub mod journal;
mod storage;
pub mod versioned;
pub mod weights;
