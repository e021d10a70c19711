//! # Schema Catalog
//!
//! Logical schema per tenant: collections, fields, rename aliases and the
//! append-only schema op ledger. Stored in ordinary tables next to the
//! tenant data so catalog changes commit atomically with the DDL they
//! describe.

pub mod migrate;
pub mod model;
pub mod store;

pub use migrate::{migrate, CATALOG_VERSION};
pub use model::{
    alias_is_live, Collection, CollectionAlias, Field, FieldAlias, FieldType, OnDelete, OpType,
    Project, RelationSpec, RelationType, SchemaOp,
};
pub use store::{
    get_collection, get_field, get_project, list_collections, list_fields, list_schema_ops,
    new_id,
};
