//! CmObject schema metadata
//!
//! This crate is the read-only **Metadata Service** consumed by the loader:
//!
//! - typed ids for objects, classes and fields (`ObjectId`, `ClassId`, `FieldId`)
//! - class/field descriptors and the field-kind taxonomy
//!   (basic scalar, multilingual, owning, reference; atomic/collection/sequence)
//! - the `MetadataService` trait plus `SchemaCatalog`, an in-memory implementation
//! - the `.cms` schema dialect (`dsl`) and an embedded core schema that covers
//!   every class the implicit-reference resolver relies on
//!
//! Field XML tags follow the FieldWorks convention `FieldName` + owning class id
//! (`Senses5002`). A plain field name is also accepted when it is unique.

pub mod catalog;
pub mod dsl;
pub mod ids;

pub use catalog::{
    BasicType, Cardinality, ClassDescriptor, FieldDescriptor, FieldKind, ListRootPath,
    MetadataService, SchemaCatalog, SchemaError,
};
pub use dsl::{parse_schema, SchemaParseError};
pub use ids::{ClassId, FieldId, ObjectId, WsId};

/// The core schema shipped with the loader (`core.cms`).
pub const CORE_SCHEMA: &str = include_str!("core.cms");

/// Build a catalog from the embedded core schema.
pub fn core_catalog() -> Result<SchemaCatalog, SchemaError> {
    SchemaCatalog::from_dsl(CORE_SCHEMA)
}
