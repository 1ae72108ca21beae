//! Bulk Object Store
//!
//! The loader never talks to a database directly. Every write goes through
//! the `ObjectStore` trait, which models the bulk operations of the target
//! relational schema:
//!
//! ```text
//!   create_objects ──► set_owners ──► set_scalar_fields / set_multilingual_fields
//!                                      insert_references
//!   delete_objects (cascading through ownership)
//! ```
//!
//! Batched writes report a `RowStatus` per row so callers can log individual
//! failures and keep going; the outer `StoreError` is reserved for failures of
//! the store itself (I/O, codec, connectivity).
//!
//! `MemoryStore` is the in-memory implementation used by the CLI (as a
//! `bincode` snapshot) and by the test suites.

pub mod memory;

pub use memory::{MemoryStore, WriteStats};

use chrono::NaiveDateTime;
use cmload_schema::{Cardinality, ClassId, FieldId, ObjectId, WsId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewObject {
    pub id: ObjectId,
    pub class: ClassId,
    pub guid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerAssignment {
    pub child: ObjectId,
    pub owner: ObjectId,
    pub field: FieldId,
    pub kind: Cardinality,
    /// Position within an owning sequence; `None` appends.
    pub ord: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Boolean(bool),
    Integer(i64),
    Numeric(String),
    Float(f64),
    Time(NaiveDateTime),
    Guid(Uuid),
    Binary(Vec<u8>),
    GenDate(i64),
    Text(String),
    /// Formatted string: plain text plus an opaque run-format blob.
    Formatted { text: String, fmt: Vec<u8> },
}

impl ScalarValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ScalarValue::Text(text) | ScalarValue::Formatted { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ScalarValue::Integer(v) | ScalarValue::GenDate(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiText {
    pub text: String,
    pub fmt: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarWrite {
    pub object: ObjectId,
    pub field: FieldId,
    pub value: ScalarValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultilingualWrite {
    pub object: ObjectId,
    pub field: FieldId,
    pub ws: WsId,
    pub text: String,
    pub fmt: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceWrite {
    pub source: ObjectId,
    pub field: FieldId,
    pub target: ObjectId,
    pub ord: Option<u32>,
}

/// Outcome of one row of a batched call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowStatus {
    Ok,
    Failed(String),
}

impl RowStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RowStatus::Ok)
    }

    fn failed(message: impl Into<String>) -> Self {
        RowStatus::Failed(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub owner: ObjectId,
    pub field: FieldId,
    pub kind: Cardinality,
    pub ord: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRow {
    pub id: ObjectId,
    pub class: ClassId,
    pub guid: Uuid,
    pub owner: Option<Ownership>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRow {
    pub source: ObjectId,
    pub field: FieldId,
    pub target: ObjectId,
    pub ord: Option<u32>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot codec error: {0}")]
    Codec(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Store seam
// ============================================================================

/// Batched writes plus the read queries the loader issues against the target
/// store (existing-object detection, list indices, headword indices).
pub trait ObjectStore {
    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    fn create_objects(&mut self, rows: &[NewObject]) -> StoreResult<Vec<RowStatus>>;

    fn create_object(&mut self, row: &NewObject) -> StoreResult<RowStatus> {
        Ok(first_status(self.create_objects(std::slice::from_ref(row))?))
    }

    fn set_owners(&mut self, rows: &[OwnerAssignment]) -> StoreResult<Vec<RowStatus>>;

    fn set_owner(&mut self, row: &OwnerAssignment) -> StoreResult<RowStatus> {
        Ok(first_status(self.set_owners(std::slice::from_ref(row))?))
    }

    fn set_scalar_fields(&mut self, rows: &[ScalarWrite]) -> StoreResult<Vec<RowStatus>>;

    fn set_scalar_field(&mut self, row: &ScalarWrite) -> StoreResult<RowStatus> {
        Ok(first_status(self.set_scalar_fields(std::slice::from_ref(row))?))
    }

    fn set_multilingual_fields(
        &mut self,
        rows: &[MultilingualWrite],
    ) -> StoreResult<Vec<RowStatus>>;

    fn set_multilingual_field(&mut self, row: &MultilingualWrite) -> StoreResult<RowStatus> {
        Ok(first_status(
            self.set_multilingual_fields(std::slice::from_ref(row))?,
        ))
    }

    /// Atomic inserts replace, collection inserts ignore duplicates, sequence
    /// inserts honour `ord` (or append when it is `None`).
    fn insert_references(
        &mut self,
        kind: Cardinality,
        rows: &[ReferenceWrite],
    ) -> StoreResult<Vec<RowStatus>>;

    /// Remove one reference row; `false` when no such row exists.
    fn remove_reference(
        &mut self,
        source: ObjectId,
        field: FieldId,
        target: ObjectId,
    ) -> StoreResult<bool>;

    /// Remove every stored value of a basic or reference field.
    fn clear_field(&mut self, object: ObjectId, field: FieldId) -> StoreResult<()>;

    /// Delete objects and everything they own. Returns the number of rows removed.
    fn delete_objects(&mut self, ids: &[ObjectId]) -> StoreResult<usize>;

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn max_object_id(&self) -> ObjectId;

    fn object_count(&self) -> usize;

    fn lookup_guid(&self, guid: &Uuid) -> Option<ObjectId>;

    fn object(&self, id: ObjectId) -> Option<ObjectRow>;

    /// Objects whose class is exactly `class`, ordered by id.
    fn objects_of_class(&self, class: ClassId) -> Vec<ObjectId>;

    /// Objects owned by `owner` through `field`, ordered by ord then id.
    fn owned_objects(&self, owner: ObjectId, field: FieldId) -> Vec<ObjectId>;

    /// Every object owned directly by `owner`, with the owning field.
    fn owned_children(&self, owner: ObjectId) -> Vec<(FieldId, ObjectId)>;

    fn scalar(&self, object: ObjectId, field: FieldId) -> Option<ScalarValue>;

    fn multilingual(&self, object: ObjectId, field: FieldId, ws: WsId) -> Option<MultiText>;

    fn multilingual_all(&self, object: ObjectId, field: FieldId) -> Vec<(WsId, MultiText)>;

    /// Outgoing references of one field, ordered.
    fn references(&self, source: ObjectId, field: FieldId) -> Vec<ReferenceRow>;

    /// Every reference row pointing at `target`.
    fn referrers(&self, target: ObjectId) -> Vec<ReferenceRow>;

    fn contains(&self, id: ObjectId) -> bool {
        self.object(id).is_some()
    }
}

fn first_status(mut statuses: Vec<RowStatus>) -> RowStatus {
    if statuses.is_empty() {
        RowStatus::failed("store returned no status")
    } else {
        statuses.swap_remove(0)
    }
}
