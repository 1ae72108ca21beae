//! Fatal import errors.
//!
//! Anything reported here aborts the current operation. Recoverable problems
//! (row failures, data-quality oddities) are collected by
//! [`Diagnostics`](crate::diagnostics::Diagnostics) instead.

use cmload_schema::SchemaError;
use cmload_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("XML error in {document} at byte {position}: {message}")]
    Xml {
        document: String,
        position: usize,
        message: String,
    },

    #[error("unknown element <{0}>")]
    UnknownElement(String),

    #[error("unexpected nesting: {0}")]
    UnexpectedNesting(String),

    #[error("unbalanced tags: expected </{expected}>, found </{found}>")]
    UnbalancedTag { expected: String, found: String },

    #[error("repeated object GUID {0}")]
    RepeatedGuid(Uuid),

    #[error("repeated object id `{0}`")]
    RepeatedName(String),

    #[error("{field} mixes children with and without an explicit ord")]
    MixedSequenceOrder { field: String },

    #[error("{field} uses ord {ord} more than once")]
    DuplicateOrder { field: String, ord: u32 },

    #[error("a full load needs an empty store, found {0} objects")]
    StoreNotEmpty(usize),

    #[error("invalid import target: {0}")]
    InvalidTarget(String),

    #[error("{field} is not a field of {class}")]
    FieldNotOnClass { field: String, class: String },

    #[error("external entity `{0}` includes itself")]
    EntityCycle(String),

    #[error("invalid {what}: `{value}`")]
    InvalidValue { what: String, value: String },

    #[error("the schema does not define {0}")]
    MissingSchema(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("format codec error: {0}")]
    Format(String),

    #[error("store rejected {what}: {reason}")]
    Rejected { what: String, reason: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LoadResult<T> = Result<T, LoadError>;
