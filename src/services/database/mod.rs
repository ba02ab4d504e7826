//! MySQL connections and schema introspection.

mod cache;
mod manager;
mod schema;
mod types;

pub use cache::SchemaCache;
pub use manager::{DatabaseManager, Endpoint, connectivity_kind};
pub use types::{
    Cardinality, Column, DatabaseSchema, ForeignKey, Index, IndexKind, Relationship, TableEntity,
};
