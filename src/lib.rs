//! Transactional spatial feature table engine for GeoPackage files, built on
//! top of rusqlite.
//!
//! ## Overview
//!
//! - `FeatureStore` represents one open GeoPackage file.
//! - `FeatureTable` represents a single feature table in the store.
//! - `Feature` represents one row: id, optional geometry, attribute values.
//! - `Value` (re-exported from rusqlite) is the dynamic attribute value.
//!
//! `FeatureStore` is the entry point and supports several open modes:
//!
//! - `FeatureStore::open_read_only(path)`: open an existing file without
//!   write access.
//! - `FeatureStore::open(path)`: open an existing file for read/write.
//! - `FeatureStore::create(path)`: create a new file.
//! - `FeatureStore::create_in_memory()`: create a transient in-memory store.
//!
//! Tables are obtained with `FeatureStore::table(name)` for existing tables
//! or `FeatureStore::create_table(...)` for new ones. Spatial tables get an
//! R-tree index with trigger-based maintenance; large write bursts inside a
//! transaction switch the index to a batched bulk-load mode transparently,
//! flushed at commit.
//!
//! ## Writing
//!
//! ```no_run
//! use featurepack::{ColumnSpec, ColumnType, Feature, FeatureStore};
//! use featurepack::{GeometryColumnSpec, GeometryKind, Value};
//! use geo_types::Point;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = FeatureStore::create("data.gpkg")?;
//!     let table = store.create_table(
//!         "points",
//!         Some(GeometryColumnSpec::new("geom", GeometryKind::Point, 4326)),
//!         &[
//!             ColumnSpec::new("name", ColumnType::Text),
//!             ColumnSpec::new("rank", ColumnType::Int64),
//!         ],
//!     )?;
//!
//!     let feature = Feature::new()
//!         .with_geometry(&Point::new(139.767, 35.681))?
//!         .with_values([Value::from("tokyo".to_string()), Value::from(1_i64)]);
//!     let fid = table.create(&feature)?;
//!     assert_eq!(fid, 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Reading
//!
//! ```no_run
//! use featurepack::{Envelope, FeatureQuery, FeatureStore};
//!
//! let store = FeatureStore::open_read_only("data.gpkg")?;
//! let table = store.table("points")?;
//!
//! // Spatially filtered iteration goes through the R-tree when one exists.
//! let query = FeatureQuery::new().with_spatial_filter(Envelope::new(135.0, 140.0, 34.0, 36.0));
//! for feature in table.query(&query)? {
//!     let _id = feature.fid();
//!     let _geom = feature.geometry()?;
//!     let _name = feature.property("name");
//! }
//! # Ok::<(), featurepack::StoreError>(())
//! ```
//!
//! For large tables, `features_batch(batch_size)` / `query_batch` iterate in
//! chunks and bound peak memory.
//!
//! ## Transactions
//!
//! ```no_run
//! use featurepack::FeatureStore;
//! # fn insert_many(_: &featurepack::FeatureTable<'_>) -> featurepack::Result<()> { Ok(()) }
//!
//! let store = FeatureStore::open("data.gpkg")?;
//! store.begin_transaction()?;
//! let table = store.table("points")?;
//! insert_many(&table)?;
//! store.commit_transaction()?; // flushes deferred index work, persists caches
//! # Ok::<(), featurepack::StoreError>(())
//! ```
//!
//! Rolling back instead discards any deferred index batch and restores the
//! cached extent and feature count to their pre-transaction state.
//!
//! ## Schema evolution
//!
//! Columns can be added, renamed, retyped, reordered and deleted, and tables
//! renamed, through `FeatureTable::add_column` and friends. Changes SQLite's
//! native ALTER cannot express are performed as an atomic shadow-table
//! rewrite that preserves data, triggers, indexes and referential integrity.

mod catalog_sql;
mod conversions;
mod error;
mod geom;
mod sql_functions;
mod store;
mod txn;
mod types;

pub use error::{Result, StoreError};
pub use geom::Envelope;
pub use geom::codec::{self, BlobHeader, EncodeOptions, EnvelopeKind};
pub use sql_functions::register_spatial_functions;
pub use store::{
    ColumnChanges, Feature, FeatureBatchIterator, FeatureIterator, FeatureQuery, FeatureStore,
    FeatureTable,
};
pub use types::{
    ColumnSpec, ColumnType, Dimension, GeometryColumnSpec, GeometryKind, StoreOptions,
};

// Re-export types used in public signatures to keep the API self-contained.
pub use rusqlite::types::Value;
