//! Rule 3: reversal index entries named by form.
//!
//! `<Link ws="en" form="animal|dog"/>` resolves inside the reversal index for
//! `en`: `animal` among the index's entries, `dog` among the subentries of
//! `animal`. Forms match exactly; missing indexes and entries are created.

use super::{nfd, LinkTarget};
use crate::error::LoadResult;
use crate::schema::FieldInfo;
use crate::session::ImportSession;
use crate::tokens::Attributes;
use ahash::AHashMap;
use cmload_schema::{ObjectId, WsId};

#[derive(Debug, Default)]
pub struct ReversalCache {
    indexes: AHashMap<WsId, ObjectId>,
    /// (parent, ws, form) of entries seen so far.
    entries: AHashMap<(ObjectId, WsId, String), ObjectId>,
}

impl ReversalCache {
    /// Drop an index that turned out to duplicate another one.
    pub fn forget(&mut self, index: ObjectId) {
        self.indexes.retain(|_, id| *id != index);
        self.entries.retain(|(parent, _, _), _| *parent != index);
    }
}

/// Split a `|`-delimited entry path; empty segments are dropped.
pub fn split_path(form: &str) -> Vec<&str> {
    form.split('|')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect()
}

pub(crate) fn resolve_entry(
    session: &mut ImportSession<'_>,
    attrs: &Attributes,
) -> LoadResult<LinkTarget> {
    let (Some(code), Some(form)) = (attrs.non_empty("ws"), attrs.non_empty("form")) else {
        return Ok(LinkTarget::Unresolved);
    };
    let ws = session.ws_id(code)?;
    let segments = split_path(form);
    if segments.is_empty() {
        return Ok(LinkTarget::Unresolved);
    }

    let index = index_for(session, ws)?;
    let top = session.schema.require_field("ReversalIndex", "Entries")?;
    let sub = session.schema.require_field("ReversalIndexEntry", "Subentries")?;

    let mut parent = index;
    for (depth, segment) in segments.iter().enumerate() {
        let field = if depth == 0 { top } else { sub };
        parent = entry_in(session, parent, field, ws, segment)?;
    }
    Ok(LinkTarget::Resolved(parent))
}

/// The reversal index of `ws`, created in `LexDb.ReversalIndexes` if missing.
fn index_for(session: &mut ImportSession<'_>, ws: WsId) -> LoadResult<ObjectId> {
    if let Some(index) = session.implicit.reversal.indexes.get(&ws) {
        return Ok(session.buffer.redirect_target(*index));
    }
    session.flush_fields()?;
    let class = session.schema.require_class("ReversalIndex")?;
    let ws_field = session.schema.require_field("ReversalIndex", "WritingSystem")?;
    let duplicates: Vec<ObjectId> = session
        .implicit
        .duplicates
        .iter()
        .map(|d| d.duplicate)
        .collect();

    for index in session.store.objects_of_class(class) {
        if duplicates.contains(&index) {
            continue;
        }
        for row in session.store.references(index, ws_field.id) {
            session.implicit.reversal.indexes.entry(row.target).or_insert(index);
        }
    }
    if let Some(index) = session.implicit.reversal.indexes.get(&ws) {
        return Ok(*index);
    }

    let lex_db = session.lex_db()?;
    let owner = session.schema.require_field("LexDb", "ReversalIndexes")?;
    let index = session.create_now(class, Some((lex_db, owner)))?;
    session.put_reference(ws_field, index, ws, None)?;
    session.implicit.reversal.indexes.insert(ws, index);
    tracing::debug!(%index, %ws, "created reversal index");
    Ok(index)
}

/// The child of `parent.field` whose `ReversalForm` in `ws` is `form`.
fn entry_in(
    session: &mut ImportSession<'_>,
    parent: ObjectId,
    field: FieldInfo,
    ws: WsId,
    form: &str,
) -> LoadResult<ObjectId> {
    let key = (parent, ws, nfd(form));
    if let Some(entry) = session.implicit.reversal.entries.get(&key) {
        return Ok(*entry);
    }

    session.flush_fields()?;
    let reversal_form = session.schema.require_field("ReversalIndexEntry", "ReversalForm")?;
    let existing = session
        .store
        .owned_objects(parent, field.id)
        .into_iter()
        .find(|child| {
            session.text_of(*child, reversal_form.id, ws).as_deref() == Some(key.2.as_str())
        });
    let entry = match existing {
        Some(entry) => entry,
        None => {
            let class = session.schema.require_class("ReversalIndexEntry")?;
            let entry = session.create_now(class, Some((parent, field)))?;
            session.put_text(entry, reversal_form, ws, form)?;
            tracing::debug!(%entry, form, "created reversal entry");
            entry
        }
    };
    session.implicit.reversal.entries.insert(key, entry);
    Ok(entry)
}
