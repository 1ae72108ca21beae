//! List reconciliation.
//!
//! Runs between pass 1 and pass 2 of a list update. The stored tree under
//! `owner.field` (the original) is compared with the tree parsed from the
//! update document (the revised), and the store is changed in place:
//!
//! 1. classify every original object: matched, merged away, deleted, custom
//!    (added outside the canonical source and kept), or orphaned
//! 2. plan owner changes for moved revised objects and for custom objects
//!    whose owner goes away
//! 3. create revised objects that are new
//! 4. apply the owner changes, sequence children at out-of-range positions
//! 5. point references to merged-away objects at their merge targets
//! 6. delete merged, deleted and orphaned objects
//! 7. renumber the sequences that were touched
//! 8. clear basic fields of matched objects so pass 2 can rewrite them
//!
//! An update whose revised tree equals the stored one changes no ownership.

pub mod records;

use crate::error::LoadResult;
use crate::ledger::create_rows;
use crate::pass1::{ParsedDocument, ParsedObject};
use crate::progress::Phase;
use crate::schema::FieldInfo;
use crate::session::ImportSession;
use ahash::{AHashMap, AHashSet};
use cmload_schema::{ClassId, FieldKind, MetadataService, ObjectId};
use cmload_store::{NewObject, OwnerAssignment, ReferenceWrite, RowStatus};
use records::{
    ItemStatus, ObjInfoSet, UpdateDeleteInfo, UpdateLinkInfo, UpdateMergeInfo, UpdateObjInfo,
};
use serde::Serialize;
use std::fmt;

/// Sequence positions at or above this are temporary.
pub const TEMP_ORD_BASE: u32 = 0x4000_0000;

fn temp_ord(id: ObjectId) -> u32 {
    TEMP_ORD_BASE.saturating_add(id.raw())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub original: usize,
    pub matched: usize,
    pub created: usize,
    pub moved: usize,
    pub merged: usize,
    pub deleted: usize,
    pub custom: usize,
    pub links_repaired: usize,
    pub reordered: usize,
    pub fields_cleared: usize,
    /// Rows removed by the cascading delete.
    pub removed_rows: usize,
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} original: {} matched, {} created, {} moved, {} merged, {} deleted, {} custom; \
             {} links repaired, {} reordered, {} fields cleared",
            self.original,
            self.matched,
            self.created,
            self.moved,
            self.merged,
            self.deleted,
            self.custom,
            self.links_repaired,
            self.reordered,
            self.fields_cleared
        )
    }
}

/// One planned owner change.
#[derive(Debug, Clone, Copy)]
struct Move {
    child: ObjectId,
    owner: ObjectId,
    field: FieldInfo,
    /// Pre-existing object (counted as moved rather than created).
    existing: bool,
}

pub fn reconcile(
    session: &mut ImportSession<'_>,
    doc: &ParsedDocument,
    owner: ObjectId,
    field: FieldInfo,
) -> LoadResult<ReconcileSummary> {
    session.flush_fields()?;
    session.progress.tick(Phase::Reconcile, 0);
    let mut summary = ReconcileSummary::default();

    let mut original = ObjInfoSet::load_closure(&*session.store, owner, field.id);
    summary.original = original.len();
    let item_class = item_class(session, owner, field);

    let (merges, deletes) = resolve_directives(session, doc, &original);
    classify(session, doc, &mut original, &merges, &deletes, item_class);
    for info in original.iter() {
        match info.status {
            ItemStatus::Matched => summary.matched += 1,
            ItemStatus::Custom => summary.custom += 1,
            _ => {}
        }
    }

    let doomed = deletion_set(&original);
    let moves = plan_moves(session, doc, &original);
    session.progress.tick(Phase::Reconcile, 20);

    summary.created = create_revised(session, doc)?;
    session.report.objects_created += summary.created;
    apply_moves(session, &moves, &mut summary)?;
    session.progress.tick(Phase::Reconcile, 50);

    repair_links(session, &original, &merges, &mut summary)?;
    delete_removed(session, &original, &doomed, &mut summary)?;
    summary.merged = merges.len();
    session.progress.tick(Phase::Reconcile, 80);

    correct_orders(session, doc, &moves, &mut summary)?;
    clear_obsolete_fields(session, doc, &original, &mut summary)?;
    session.progress.tick(Phase::Reconcile, 100);

    tracing::info!(%summary, "list reconciled");
    Ok(summary)
}

/// The class of the list's items: `ItemClsid` of a possibility list, else
/// the field's target class.
fn item_class(session: &ImportSession<'_>, owner: ObjectId, field: FieldInfo) -> Option<ClassId> {
    let declared = session
        .store
        .object(owner)
        .filter(|row| session.schema.is_a(row.class, "CmPossibilityList"))
        .and_then(|_| session.schema.field_named("CmPossibilityList", "ItemClsid"))
        .and_then(|f| session.store.scalar(owner, f.id))
        .and_then(|v| v.as_integer())
        .and_then(|raw| u32::try_from(raw).ok())
        .map(ClassId::new)
        .filter(|class| session.schema.class(*class).is_some());
    declared.or(field.target_class)
}

// ============================================================================
// Matching
// ============================================================================

fn resolve_directives(
    session: &mut ImportSession<'_>,
    doc: &ParsedDocument,
    original: &ObjInfoSet,
) -> (Vec<UpdateMergeInfo>, Vec<UpdateDeleteInfo>) {
    let mut merges = Vec::new();
    let mut deletes = Vec::new();

    for directive in &doc.merges {
        let Some(from) = original.by_guid(&directive.from) else {
            session.diag.data_quality(
                "merge-source-unknown",
                format!("<Merge from=\"{}\">: not in the list; ignored", directive.from),
            );
            continue;
        };
        if doc.find_guid(&directive.from).is_some() {
            session.diag.data_quality(
                "merge-source-revised",
                format!(
                    "<Merge from=\"{}\">: the object is still in the document; ignored",
                    directive.from
                ),
            );
            continue;
        }
        let to = doc
            .find_guid(&directive.to)
            .map(|o| o.id)
            .or_else(|| session.store.lookup_guid(&directive.to));
        match to {
            Some(to) => merges.push(UpdateMergeInfo { from: from.id, to }),
            None => {
                session.diag.data_quality(
                    "merge-target-unknown",
                    format!(
                        "<Merge to=\"{}\">: no such object; {} is deleted instead",
                        directive.to, from.id
                    ),
                );
                deletes.push(UpdateDeleteInfo { id: from.id });
            }
        }
    }

    for guid in &doc.deletes {
        match original.by_guid(guid) {
            Some(_) if doc.find_guid(guid).is_some() => session.diag.data_quality(
                "delete-revised",
                format!("<Delete guid=\"{guid}\">: the object is still in the document; ignored"),
            ),
            Some(info) => deletes.push(UpdateDeleteInfo { id: info.id }),
            None => session.diag.data_quality(
                "delete-unknown",
                format!("<Delete guid=\"{guid}\">: not in the list; ignored"),
            ),
        }
    }
    (merges, deletes)
}

/// Set the status of every original object. The closure is in pre-order,
/// so an owner is classified before what it owns.
fn classify(
    session: &ImportSession<'_>,
    doc: &ParsedDocument,
    original: &mut ObjInfoSet,
    merges: &[UpdateMergeInfo],
    deletes: &[UpdateDeleteInfo],
    item_class: Option<ClassId>,
) {
    let revised: AHashSet<_> = doc.objects.iter().map(|o| o.guid).collect();
    let infos: Vec<UpdateObjInfo> = original.iter().copied().collect();

    for info in infos {
        let status = if revised.contains(&info.guid) {
            ItemStatus::Matched
        } else if let Some(merge) = merges.iter().find(|m| m.from == info.id) {
            ItemStatus::MergedInto(merge.to)
        } else if deletes.iter().any(|d| d.id == info.id) {
            ItemStatus::Deleted
        } else {
            let is_item = item_class.is_some_and(|c| session.schema.is_subclass(info.class, c));
            let owner_custom = info
                .owner
                .and_then(|o| original.status(o.owner))
                .is_some_and(|s| s == ItemStatus::Custom);
            if is_item || owner_custom {
                ItemStatus::Custom
            } else {
                ItemStatus::Orphan
            }
        };
        original.set_status(info.id, status);
    }
}

/// Removed objects none of whose owners is also removed.
fn deletion_set(original: &ObjInfoSet) -> Vec<ObjectId> {
    original
        .iter()
        .filter(|info| info.status.is_removed())
        .filter(|info| {
            !original
                .ancestors(info.id)
                .into_iter()
                .any(|a| original.status(a).is_some_and(ItemStatus::is_removed))
        })
        .map(|info| info.id)
        .collect()
}

// ============================================================================
// Placement
// ============================================================================

fn class_of(session: &ImportSession<'_>, doc: &ParsedDocument, id: ObjectId) -> Option<ClassId> {
    session
        .store
        .object(id)
        .map(|row| row.class)
        .or_else(|| doc.objects.iter().find(|o| o.id == id).map(|o| o.class))
}

/// Nearest surviving owner for a custom object whose owner goes away: the
/// merge target when it can hold the same field, else further up.
fn find_valid_owner(
    session: &ImportSession<'_>,
    doc: &ParsedDocument,
    original: &ObjInfoSet,
    id: ObjectId,
) -> Option<(ObjectId, FieldInfo)> {
    let mut ownership = original.by_id(id)?.owner?;
    loop {
        let field = session.schema.info(ownership.field)?;
        match original.status(ownership.owner) {
            None | Some(ItemStatus::Matched) | Some(ItemStatus::Custom) => {
                return Some((ownership.owner, field));
            }
            Some(ItemStatus::MergedInto(target)) => {
                let fits = class_of(session, doc, target)
                    .is_some_and(|class| session.schema.is_subclass(class, field.owner_class));
                if fits {
                    return Some((target, field));
                }
            }
            Some(ItemStatus::Deleted) | Some(ItemStatus::Orphan) => {}
        }
        ownership = original.by_id(ownership.owner)?.owner?;
    }
}

fn needs_move(session: &ImportSession<'_>, object: &ParsedObject) -> bool {
    let Some(placement) = object.owner else {
        return false;
    };
    if object.is_new {
        return true;
    }
    match session.store.object(object.id).and_then(|row| row.owner) {
        Some(current) => {
            current.owner != placement.owner
                || current.field != placement.field.id
                || (placement.field.is_sequence() && current.ord != placement.ord)
        }
        None => true,
    }
}

fn plan_moves(
    session: &mut ImportSession<'_>,
    doc: &ParsedDocument,
    original: &ObjInfoSet,
) -> Vec<Move> {
    let mut moves: Vec<Move> = doc
        .objects
        .iter()
        .filter(|object| needs_move(&*session, object))
        .filter_map(|object| {
            object.owner.map(|placement| Move {
                child: object.id,
                owner: placement.owner,
                field: placement.field,
                existing: !object.is_new,
            })
        })
        .collect();

    let stranded: Vec<ObjectId> = original
        .iter()
        .filter(|info| info.status == ItemStatus::Custom)
        .filter(|info| {
            info.owner
                .and_then(|o| original.status(o.owner))
                .is_some_and(ItemStatus::is_removed)
        })
        .map(|info| info.id)
        .collect();
    for custom in stranded {
        match find_valid_owner(session, doc, original, custom) {
            Some((owner, field)) => moves.push(Move {
                child: custom,
                owner,
                field,
                existing: true,
            }),
            None => session.diag.integrity(
                "no-valid-owner",
                format!("custom object {custom} has no surviving owner and is deleted with it"),
            ),
        }
    }
    moves
}

fn create_revised(session: &mut ImportSession<'_>, doc: &ParsedDocument) -> LoadResult<usize> {
    let rows: Vec<NewObject> = doc
        .objects
        .iter()
        .filter(|o| o.is_new)
        .map(|o| NewObject {
            id: o.id,
            class: o.class,
            guid: o.guid,
        })
        .collect();
    if rows.is_empty() {
        return Ok(0);
    }
    let mut ctx = session.create_ctx();
    Ok(create_rows(&mut ctx, &rows)?.len())
}

/// Apply owner changes, retrying failures while each round makes progress.
fn apply_moves(
    session: &mut ImportSession<'_>,
    moves: &[Move],
    summary: &mut ReconcileSummary,
) -> LoadResult<()> {
    let mut pending: Vec<(Move, OwnerAssignment)> = moves
        .iter()
        .filter_map(|m| {
            let kind = m.field.cardinality()?;
            Some((
                *m,
                OwnerAssignment {
                    child: m.child,
                    owner: m.owner,
                    field: m.field.id,
                    kind,
                    ord: m.field.is_sequence().then(|| temp_ord(m.child)),
                },
            ))
        })
        .collect();

    loop {
        let attempted = pending.len();
        let mut failed = Vec::new();
        for (m, row) in pending {
            match session.store.set_owner(&row)? {
                RowStatus::Ok => {
                    if m.existing {
                        summary.moved += 1;
                    }
                }
                RowStatus::Failed(reason) => failed.push((m, row, reason)),
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        if failed.len() == attempted {
            for (_, row, reason) in failed {
                session.diag.row_failure(
                    "move-failed",
                    format!(
                        "could not move {} to {} of {}: {reason}",
                        row.child,
                        session.schema.field_name(row.field),
                        row.owner
                    ),
                );
            }
            return Ok(());
        }
        pending = failed.into_iter().map(|(m, row, _)| (m, row)).collect();
    }
}

// ============================================================================
// Links, deletion, order, fields
// ============================================================================

fn repair_links(
    session: &mut ImportSession<'_>,
    original: &ObjInfoSet,
    merges: &[UpdateMergeInfo],
    summary: &mut ReconcileSummary,
) -> LoadResult<()> {
    for merge in merges {
        let links: Vec<UpdateLinkInfo> = session
            .store
            .referrers(merge.from)
            .into_iter()
            .filter(|row| {
                !original
                    .status(row.source)
                    .is_some_and(ItemStatus::is_removed)
            })
            .map(|row| UpdateLinkInfo {
                source: row.source,
                field: row.field,
                target: row.target,
                ord: row.ord,
            })
            .collect();

        for link in links {
            let Some(kind) = session.schema.info(link.field).and_then(|f| f.cardinality()) else {
                continue;
            };
            session
                .store
                .remove_reference(link.source, link.field, link.target)?;
            let statuses = session.store.insert_references(
                kind,
                &[ReferenceWrite {
                    source: link.source,
                    field: link.field,
                    target: merge.to,
                    ord: link.ord,
                }],
            )?;
            match statuses.into_iter().next() {
                Some(RowStatus::Failed(reason)) => session.diag.row_failure(
                    "link-repair-failed",
                    format!(
                        "{} of {} could not be pointed at {}: {reason}",
                        session.schema.field_name(link.field),
                        link.source,
                        merge.to
                    ),
                ),
                _ => summary.links_repaired += 1,
            }
        }
    }
    Ok(())
}

fn delete_removed(
    session: &mut ImportSession<'_>,
    original: &ObjInfoSet,
    doomed: &[ObjectId],
    summary: &mut ReconcileSummary,
) -> LoadResult<()> {
    summary.deleted = doomed
        .iter()
        .filter(|id| !matches!(original.status(**id), Some(ItemStatus::MergedInto(_))))
        .count();
    for chunk in doomed.chunks(session.config.delete_chunk_size.max(1)) {
        summary.removed_rows += session.store.delete_objects(chunk)?;
    }
    if !doomed.is_empty() {
        tracing::debug!(
            roots = doomed.len(),
            rows = summary.removed_rows,
            "deleted removed objects"
        );
    }
    Ok(())
}

fn current_ord(session: &ImportSession<'_>, child: ObjectId) -> Option<u32> {
    session
        .store
        .object(child)
        .and_then(|row| row.owner)
        .and_then(|o| o.ord)
}

/// Renumber each sequence that received a child: revised children in
/// document order first, then any others in their current order.
fn correct_orders(
    session: &mut ImportSession<'_>,
    doc: &ParsedDocument,
    moves: &[Move],
    summary: &mut ReconcileSummary,
) -> LoadResult<()> {
    let mut containers: Vec<(ObjectId, FieldInfo)> = Vec::new();
    for m in moves.iter().filter(|m| m.field.is_sequence()) {
        if !containers.iter().any(|(o, f)| *o == m.owner && f.id == m.field.id) {
            containers.push((m.owner, m.field));
        }
    }

    for (owner, field) in containers {
        let rank: AHashMap<ObjectId, u32> = doc
            .objects
            .iter()
            .filter_map(|o| {
                let placement = o.owner?;
                (placement.owner == owner && placement.field.id == field.id)
                    .then(|| (o.id, placement.ord.unwrap_or(u32::MAX)))
            })
            .collect();
        let mut children = session.store.owned_objects(owner, field.id);
        // Stable: children outside the document keep their relative order.
        children.sort_by_key(|child| rank.get(child).copied().unwrap_or(u32::MAX));

        let wrong: Vec<(ObjectId, u32)> = children
            .iter()
            .enumerate()
            .map(|(index, child)| (*child, index as u32 + 1))
            .filter(|(child, ord)| current_ord(&*session, *child) != Some(*ord))
            .collect();
        if wrong.is_empty() {
            continue;
        }
        let Some(kind) = field.cardinality() else {
            continue;
        };

        // Park first so final positions never collide.
        for (child, _) in &wrong {
            if current_ord(&*session, *child).is_some_and(|ord| ord < TEMP_ORD_BASE) {
                let row = OwnerAssignment {
                    child: *child,
                    owner,
                    field: field.id,
                    kind,
                    ord: Some(temp_ord(*child)),
                };
                if let RowStatus::Failed(reason) = session.store.set_owner(&row)? {
                    session
                        .diag
                        .row_failure("reorder-failed", format!("parking {child}: {reason}"));
                }
            }
        }
        for (child, ord) in wrong {
            let row = OwnerAssignment {
                child,
                owner,
                field: field.id,
                kind,
                ord: Some(ord),
            };
            match session.store.set_owner(&row)? {
                RowStatus::Ok => summary.reordered += 1,
                RowStatus::Failed(reason) => session.diag.row_failure(
                    "reorder-failed",
                    format!("placing {child} at {ord} in {owner}: {reason}"),
                ),
            }
        }
    }
    Ok(())
}

/// Clear basic fields of matched pre-existing objects so values left out of
/// the revised document do not survive. Configured fields are kept.
fn clear_obsolete_fields(
    session: &mut ImportSession<'_>,
    doc: &ParsedDocument,
    original: &ObjInfoSet,
    summary: &mut ReconcileSummary,
) -> LoadResult<()> {
    for object in doc.objects.iter().filter(|o| !o.is_new) {
        if original.status(object.id) != Some(ItemStatus::Matched) {
            continue;
        }
        let fields: Vec<_> = session
            .schema
            .fields_of_class(object.class)
            .into_iter()
            .filter(|d| matches!(d.kind, FieldKind::Basic(_)))
            .filter(|d| {
                let label = format!("{}.{}", session.schema.class_name(d.owner_class), d.name);
                !session.config.preserved_fields.iter().any(|p| *p == label)
            })
            .map(|d| d.id)
            .collect();
        for field in fields {
            let stored = session.store.scalar(object.id, field).is_some()
                || !session.store.multilingual_all(object.id, field).is_empty();
            if stored {
                session.store.clear_field(object.id, field)?;
                summary.fields_cleared += 1;
            }
        }
    }
    Ok(())
}
