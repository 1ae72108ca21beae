//! Import policies.
//!
//! The four operations share one two-pass engine. What differs between them
//! (how an object element is bound to an id, whether it is created, merged or
//! handed to reconciliation, and what runs once pass 1 has reached the store)
//! is supplied by an `ImportPolicy`.

use crate::error::LoadResult;
use crate::identity::{IdentityMode, Resolution};
use crate::pass1::{BaseContext, ParsedDocument, ParsedObject};
use crate::reconcile;
use crate::schema::FieldInfo;
use crate::session::ImportSession;
use cmload_schema::{Cardinality, ClassId, MetadataService, ObjectId};

/// One object element as seen by pass 1.
#[derive(Debug, Clone, Copy)]
pub struct ObjectRequest<'r> {
    pub raw_id: Option<&'r str>,
    pub class: ClassId,
    /// Owner and owning field, when the element is nested in one.
    pub placement: Option<(ObjectId, FieldInfo)>,
    /// Directly under the operation's base context.
    pub top_level: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Goes into the pending-object ledger.
    Create,
    /// Already exists; only its fields are written.
    Merge,
    /// Left to the reconciliation engine.
    Defer,
}

pub trait ImportPolicy {
    fn name(&self) -> &'static str;

    fn identity_mode(&self) -> IdentityMode;

    fn base_context(&self) -> BaseContext;

    fn requires_empty_store(&self) -> bool {
        false
    }

    /// Replace reference fields of pre-existing objects instead of appending.
    fn update_mode(&self) -> bool {
        false
    }

    /// New children of a pre-existing sequence go after its current children.
    fn appends_to_existing(&self) -> bool {
        true
    }

    /// `<Merge>` and `<Delete>` directives take effect.
    fn accepts_directives(&self) -> bool {
        false
    }

    fn resolve_object_identity(
        &self,
        session: &mut ImportSession<'_>,
        request: &ObjectRequest<'_>,
    ) -> LoadResult<Resolution> {
        session
            .identity
            .resolve(request.raw_id, self.identity_mode(), &*session.store)
    }

    fn should_create_or_merge(&self, object: &ParsedObject) -> Disposition {
        if object.is_new {
            Disposition::Create
        } else {
            Disposition::Merge
        }
    }

    fn post_process_after_store(
        &self,
        _session: &mut ImportSession<'_>,
        _doc: &ParsedDocument,
    ) -> LoadResult<()> {
        Ok(())
    }
}

// ============================================================================
// Full load
// ============================================================================

/// Every object is new; the store must start out empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullLoadPolicy;

impl ImportPolicy for FullLoadPolicy {
    fn name(&self) -> &'static str {
        "full load"
    }

    fn identity_mode(&self) -> IdentityMode {
        IdentityMode::Strict
    }

    fn base_context(&self) -> BaseContext {
        BaseContext::Roots
    }

    fn requires_empty_store(&self) -> bool {
        true
    }
}

// ============================================================================
// Object into field
// ============================================================================

/// Top-level objects go into `owner.field`. An occupied atomic slot holding
/// the same class is filled in place; any other occupant is replaced.
#[derive(Debug, Clone, Copy)]
pub struct FieldImportPolicy {
    pub owner: ObjectId,
    pub field: FieldInfo,
}

impl ImportPolicy for FieldImportPolicy {
    fn name(&self) -> &'static str {
        "object import"
    }

    fn identity_mode(&self) -> IdentityMode {
        IdentityMode::Strict
    }

    fn base_context(&self) -> BaseContext {
        BaseContext::Field {
            owner: self.owner,
            field: self.field,
        }
    }

    fn resolve_object_identity(
        &self,
        session: &mut ImportSession<'_>,
        request: &ObjectRequest<'_>,
    ) -> LoadResult<Resolution> {
        let occupant = if request.top_level && self.field.cardinality() == Some(Cardinality::Atomic)
        {
            session
                .store
                .owned_objects(self.owner, self.field.id)
                .first()
                .and_then(|id| session.store.object(*id))
        } else {
            None
        };

        match occupant {
            Some(row) if row.class == request.class => {
                tracing::debug!(slot = %row.id, "filling occupied atomic slot in place");
                session.identity.bind_existing(request.raw_id, row.id, row.guid)
            }
            Some(row) => {
                let mut resolution = session.identity.resolve(
                    request.raw_id,
                    IdentityMode::Strict,
                    &*session.store,
                )?;
                tracing::debug!(
                    replaced = %row.id,
                    class = %session.schema.class_name(row.class),
                    "atomic slot occupant of another class will be replaced"
                );
                resolution.replaces = Some(row.id);
                Ok(resolution)
            }
            None => session
                .identity
                .resolve(request.raw_id, IdentityMode::Strict, &*session.store),
        }
    }
}

// ============================================================================
// Several fields into one owner
// ============================================================================

/// Top-level elements are fields of `owner`. Known GUIDs merge into their
/// objects; an object in an atomic owning field of a pre-existing owner
/// merges into the current occupant.
#[derive(Debug, Clone, Copy)]
pub struct MergeFieldsPolicy {
    pub owner: ObjectId,
    pub class: ClassId,
}

impl ImportPolicy for MergeFieldsPolicy {
    fn name(&self) -> &'static str {
        "field import"
    }

    fn identity_mode(&self) -> IdentityMode {
        IdentityMode::Merge
    }

    fn base_context(&self) -> BaseContext {
        BaseContext::Object {
            owner: self.owner,
            class: self.class,
        }
    }

    fn update_mode(&self) -> bool {
        true
    }

    fn resolve_object_identity(
        &self,
        session: &mut ImportSession<'_>,
        request: &ObjectRequest<'_>,
    ) -> LoadResult<Resolution> {
        if let Some((owner, field)) = request.placement {
            if session.is_preexisting(owner) && field.cardinality() == Some(Cardinality::Atomic) {
                let occupant = session
                    .store
                    .owned_objects(owner, field.id)
                    .first()
                    .and_then(|id| session.store.object(*id));
                if let Some(row) = occupant.filter(|row| row.class == request.class) {
                    return session.identity.bind_existing(request.raw_id, row.id, row.guid);
                }
            }
        }
        session
            .identity
            .resolve(request.raw_id, IdentityMode::Merge, &*session.store)
    }
}

// ============================================================================
// List update
// ============================================================================

/// Objects are bound against the store and handed to the reconciliation
/// engine, which creates, moves, merges and deletes before pass 2 runs.
#[derive(Debug, Clone, Copy)]
pub struct ListUpdatePolicy {
    pub owner: ObjectId,
    pub field: FieldInfo,
}

impl ImportPolicy for ListUpdatePolicy {
    fn name(&self) -> &'static str {
        "list update"
    }

    fn identity_mode(&self) -> IdentityMode {
        IdentityMode::Merge
    }

    fn base_context(&self) -> BaseContext {
        BaseContext::Field {
            owner: self.owner,
            field: self.field,
        }
    }

    fn update_mode(&self) -> bool {
        true
    }

    fn appends_to_existing(&self) -> bool {
        false
    }

    fn accepts_directives(&self) -> bool {
        true
    }

    fn should_create_or_merge(&self, _object: &ParsedObject) -> Disposition {
        Disposition::Defer
    }

    fn post_process_after_store(
        &self,
        session: &mut ImportSession<'_>,
        doc: &ParsedDocument,
    ) -> LoadResult<()> {
        let summary = reconcile::reconcile(session, doc, self.owner, self.field)?;
        session.report.reconcile = Some(summary);
        Ok(())
    }
}
