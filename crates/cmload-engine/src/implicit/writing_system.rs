//! Writing systems and the duplicate reversal-index redirect.

use super::{LinkSite, LinkTarget};
use crate::error::LoadResult;
use crate::schema::SessionSchema;
use crate::session::ImportSession;
use crate::tokens::Attributes;
use ahash::AHashMap;
use cmload_schema::{MetadataService, ObjectId, WsId};
use cmload_store::{ObjectStore, OwnerAssignment, ReferenceWrite, RowStatus};

/// Locale code to writing-system object. Codes compare case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct WritingSystems {
    by_code: AHashMap<String, WsId>,
}

impl WritingSystems {
    /// Every `LgWritingSystem` already in the store, keyed by `ICULocale`.
    pub fn load(store: &dyn ObjectStore, schema: &SessionSchema<'_>) -> Self {
        let mut known = Self::default();
        let (Some(class), Some(locale)) = (
            schema.class_id_for_name("LgWritingSystem"),
            schema.field_named("LgWritingSystem", "ICULocale"),
        ) else {
            return known;
        };
        for id in store.objects_of_class(class) {
            if let Some(code) = store.scalar(id, locale.id) {
                if let Some(code) = code.as_text() {
                    known.learn(code, id);
                }
            }
        }
        known
    }

    pub fn get(&self, code: &str) -> Option<WsId> {
        self.by_code.get(&code.trim().to_lowercase()).copied()
    }

    pub fn learn(&mut self, code: &str, id: WsId) {
        self.by_code.insert(code.trim().to_lowercase(), id);
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

/// A reversal index created by this document for a writing system that
/// already had one. Everything written to `duplicate` goes to `survivor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateIndex {
    pub duplicate: ObjectId,
    pub survivor: ObjectId,
}

/// Rule 6: `<Link ws=".."/>` names the writing system itself.
pub(crate) fn resolve_reference(
    session: &mut ImportSession<'_>,
    site: LinkSite,
    attrs: &Attributes,
) -> LoadResult<LinkTarget> {
    let Some(code) = attrs.non_empty("ws") else {
        return Ok(LinkTarget::Unresolved);
    };
    let ws = session.ws_id(code)?;

    if session.schema.is_a(site.owner_class, "ReversalIndex")
        && !session.is_preexisting(site.owner)
        && session
            .schema
            .field_named("ReversalIndex", "WritingSystem")
            .is_some_and(|f| f.id == site.field.id)
    {
        if let Some(survivor) = existing_index_for(session, ws, site.owner) {
            session.buffer.redirect(site.owner, survivor);
            session.implicit.reversal.forget(site.owner);
            session.implicit.duplicates.push(DuplicateIndex {
                duplicate: site.owner,
                survivor,
            });
            session.diag.data_quality(
                "duplicate-reversal-index",
                format!(
                    "reversal index {} duplicates {survivor} for writing system `{code}`; merging",
                    site.owner
                ),
            );
        }
    }
    Ok(LinkTarget::Resolved(ws))
}

/// A pre-existing reversal index (other than `except`) for `ws`.
fn existing_index_for(session: &ImportSession<'_>, ws: WsId, except: ObjectId) -> Option<ObjectId> {
    let class = session.schema.class_id_for_name("ReversalIndex")?;
    let field = session.schema.field_named("ReversalIndex", "WritingSystem")?;
    session
        .store
        .objects_of_class(class)
        .into_iter()
        .filter(|id| *id != except && session.is_preexisting(*id))
        .find(|id| {
            session
                .store
                .references(*id, field.id)
                .iter()
                .any(|r| r.target == ws)
        })
}

/// Move the children and referrers of each duplicate reversal index to its
/// survivor, then delete the duplicate.
pub(crate) fn merge_duplicates(session: &mut ImportSession<'_>) -> LoadResult<()> {
    let duplicates = std::mem::take(&mut session.implicit.duplicates);
    if duplicates.is_empty() {
        return Ok(());
    }
    session.flush_fields()?;

    for DuplicateIndex {
        duplicate,
        survivor,
    } in duplicates
    {
        let mut moved = 0usize;
        for (field, child) in session.store.owned_children(duplicate) {
            let Some(kind) = session.schema.info(field).and_then(|f| f.cardinality()) else {
                continue;
            };
            let status = session.store.set_owner(&OwnerAssignment {
                child,
                owner: survivor,
                field,
                kind,
                ord: None,
            })?;
            match status {
                RowStatus::Ok => moved += 1,
                RowStatus::Failed(reason) => session.diag.row_failure(
                    "reparent-failed",
                    format!("moving {child} from {duplicate} to {survivor}: {reason}"),
                ),
            }
        }

        for row in session.store.referrers(duplicate) {
            let Some(kind) = session.schema.info(row.field).and_then(|f| f.cardinality()) else {
                continue;
            };
            session
                .store
                .remove_reference(row.source, row.field, duplicate)?;
            let statuses = session.store.insert_references(
                kind,
                &[ReferenceWrite {
                    source: row.source,
                    field: row.field,
                    target: survivor,
                    ord: row.ord,
                }],
            )?;
            if let Some(RowStatus::Failed(reason)) = statuses.into_iter().next() {
                session.diag.row_failure(
                    "retarget-failed",
                    format!("{} of {}: {reason}", session.schema.field_name(row.field), row.source),
                );
            }
        }

        session.store.delete_objects(&[duplicate])?;
        tracing::info!(%duplicate, %survivor, moved, "merged duplicate reversal index");
    }
    Ok(())
}
