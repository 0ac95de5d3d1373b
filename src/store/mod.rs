//! The feature store: datasource, tables, features, spatial index and schema
//! evolution, all sharing one rusqlite connection.

mod feature;
mod schema;
mod spatial_index;
mod store;
mod table;

pub use feature::{Feature, FeatureBatchIterator, FeatureIterator};
pub use schema::ColumnChanges;
pub use store::FeatureStore;
pub use table::{FeatureQuery, FeatureTable};
