//! Pending-object ledger and staged creation.
//!
//! Pass 1 only records objects. Materialisation then runs in waves:
//!
//! ```text
//!   roots ──► wave 1: owned objects whose owner exists
//!         ──► wave 2: owned objects whose owner was created in wave 1
//!         ──► ...      until nothing is pending or a scan adds nothing
//! ```
//!
//! Each scan trims the already-processed prefix and suffix of the pending
//! list so repeated scans stay cheap for document-ordered input.

use crate::config::LoadConfig;
use crate::diagnostics::Diagnostics;
use crate::error::LoadResult;
use crate::progress::{percent, Phase, ProgressSink};
use ahash::{AHashMap, AHashSet};
use cmload_schema::{Cardinality, ClassId, FieldId, ObjectId};
use cmload_store::{NewObject, ObjectStore, OwnerAssignment, RowStatus};
use roaring::RoaringBitmap;
use uuid::Uuid;

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRoot {
    pub class: ClassId,
    pub id: ObjectId,
    pub guid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOwned {
    pub class: ClassId,
    pub id: ObjectId,
    pub guid: Uuid,
    pub owner: ObjectId,
    pub field: FieldId,
    pub kind: Cardinality,
    pub ord: Option<u32>,
}

impl PendingOwned {
    fn new_object(&self) -> NewObject {
        NewObject {
            id: self.id,
            class: self.class,
            guid: self.guid,
        }
    }

    fn assignment(&self) -> OwnerAssignment {
        OwnerAssignment {
            child: self.id,
            owner: self.owner,
            field: self.field,
            kind: self.kind,
            ord: self.ord,
        }
    }
}

// ============================================================================
// Created-object set
// ============================================================================

/// Objects known to exist in the store. Ids below the threshold live in a
/// bitmap, later ones (implicit objects created mid-pass) in a hash set.
#[derive(Debug, Clone)]
pub struct CreatedObjectSet {
    threshold: u32,
    low: RoaringBitmap,
    high: AHashSet<ObjectId>,
}

impl CreatedObjectSet {
    pub fn new(threshold: ObjectId) -> Self {
        Self {
            threshold: threshold.raw(),
            low: RoaringBitmap::new(),
            high: AHashSet::new(),
        }
    }

    /// Move the bitmap/hash boundary; existing members are kept.
    pub fn set_threshold(&mut self, threshold: ObjectId) {
        let moved: Vec<ObjectId> = self
            .high
            .iter()
            .copied()
            .filter(|id| id.raw() < threshold.raw())
            .collect();
        for id in moved {
            self.high.remove(&id);
            self.low.insert(id.raw());
        }
        self.threshold = self.threshold.max(threshold.raw());
    }

    pub fn insert(&mut self, id: ObjectId) -> bool {
        if id.raw() < self.threshold {
            self.low.insert(id.raw())
        } else {
            self.high.insert(id)
        }
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        if id.raw() < self.threshold {
            self.low.contains(id.raw())
        } else {
            self.high.contains(&id)
        }
    }

    pub fn len(&self) -> usize {
        self.low.len() as usize + self.high.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreationOutcome {
    pub created: usize,
    pub waves: usize,
    pub stranded: usize,
}

#[derive(Debug, Default)]
pub struct Ledger {
    roots: Vec<PendingRoot>,
    owned: Vec<PendingOwned>,
}

/// Store context for one materialisation run.
pub struct CreateContext<'s> {
    pub store: &'s mut dyn ObjectStore,
    pub created: &'s mut CreatedObjectSet,
    pub config: &'s LoadConfig,
    pub diag: &'s mut Diagnostics,
    pub progress: &'s mut dyn ProgressSink,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_root(&mut self, root: PendingRoot) {
        self.roots.push(root);
    }

    pub fn push_owned(&mut self, owned: PendingOwned) {
        self.owned.push(owned);
    }

    pub fn len(&self) -> usize {
        self.roots.len() + self.owned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create every pending object whose owner chain exists. Consumes the ledger.
    pub fn materialize(self, ctx: &mut CreateContext<'_>) -> LoadResult<CreationOutcome> {
        let total = self.len();
        let mut outcome = CreationOutcome::default();

        if !self.roots.is_empty() {
            let rows: Vec<NewObject> = self
                .roots
                .iter()
                .map(|r| NewObject {
                    id: r.id,
                    class: r.class,
                    guid: r.guid,
                })
                .collect();
            let ok = create_rows(ctx, &rows)?;
            outcome.created += ok.len();
            ctx.progress.tick(Phase::Create, percent(outcome.created, total));
        }

        let pending_ids: AHashSet<ObjectId> = self.owned.iter().map(|o| o.id).collect();
        let mut slots: Vec<Option<PendingOwned>> = self.owned.into_iter().map(Some).collect();
        let mut start = 0usize;
        let mut end = slots.len();
        let mut owner_known: AHashMap<ObjectId, bool> = AHashMap::new();

        while start < end {
            let mut wave: Vec<PendingOwned> = Vec::new();
            for slot in &mut slots[start..end] {
                let Some(entry) = slot else { continue };
                let owner = entry.owner;
                let ready = if ctx.created.contains(owner) {
                    true
                } else if pending_ids.contains(&owner) {
                    false
                } else {
                    // Pre-existing owner: ask the store once.
                    *owner_known
                        .entry(owner)
                        .or_insert_with(|| ctx.store.contains(owner))
                };
                if ready {
                    wave.push(*entry);
                    *slot = None;
                }
            }

            while start < end && slots[start].is_none() {
                start += 1;
            }
            while end > start && slots[end - 1].is_none() {
                end -= 1;
            }

            if wave.is_empty() {
                ctx.diag.integrity(
                    "stalled-creation",
                    format!(
                        "nothing added in a scan of presumably hierarchically-arranged data; \
                         {} objects have missing or cyclic owners",
                        slots[start..end].iter().flatten().count()
                    ),
                );
                for entry in slots[start..end].iter().flatten() {
                    ctx.diag.integrity(
                        "stranded-object",
                        format!(
                            "object {} ({}, guid {}) not created: owner {} never materialised",
                            entry.id, entry.class, entry.guid, entry.owner
                        ),
                    );
                    outcome.stranded += 1;
                }
                break;
            }

            outcome.waves += 1;
            let rows: Vec<NewObject> = wave.iter().map(PendingOwned::new_object).collect();
            let ok = create_rows(ctx, &rows)?;
            let owners: Vec<OwnerAssignment> = wave
                .iter()
                .filter(|w| ok.contains(&w.id))
                .map(PendingOwned::assignment)
                .collect();
            assign_owners(ctx, &owners)?;
            outcome.created += ok.len();
            tracing::debug!(wave = outcome.waves, size = wave.len(), "creation wave");
            ctx.progress.tick(Phase::Create, percent(outcome.created, total));
        }

        Ok(outcome)
    }
}

// ============================================================================
// Batching
// ============================================================================

/// Create rows with the singleton or chunked bulk path. Returns the ids that
/// now exist; failures are logged per row.
pub fn create_rows(
    ctx: &mut CreateContext<'_>,
    rows: &[NewObject],
) -> LoadResult<AHashSet<ObjectId>> {
    let mut ok = AHashSet::with_capacity(rows.len());
    if rows.len() < ctx.config.singleton_threshold {
        for row in rows {
            let status = ctx.store.create_object(row)?;
            record_create(ctx, &mut ok, row, status);
        }
    } else {
        for chunk in rows.chunks(ctx.config.create_chunk_size.max(1)) {
            let statuses = ctx.store.create_objects(chunk)?;
            for (row, status) in chunk.iter().zip(statuses) {
                record_create(ctx, &mut ok, row, status);
            }
        }
    }
    Ok(ok)
}

fn record_create(
    ctx: &mut CreateContext<'_>,
    ok: &mut AHashSet<ObjectId>,
    row: &NewObject,
    status: RowStatus,
) {
    match status {
        RowStatus::Ok => {
            ctx.created.insert(row.id);
            ok.insert(row.id);
        }
        RowStatus::Failed(reason) => ctx.diag.row_failure(
            "create-failed",
            format!(
                "could not create {} ({}, guid {}): {reason}",
                row.id, row.class, row.guid
            ),
        ),
    }
}

/// Owner assignments in chunks; failures logged per row. Returns rows applied.
pub fn assign_owners(ctx: &mut CreateContext<'_>, rows: &[OwnerAssignment]) -> LoadResult<usize> {
    let mut applied = 0;
    for chunk in rows.chunks(ctx.config.create_chunk_size.max(1)) {
        let statuses = ctx.store.set_owners(chunk)?;
        for (row, status) in chunk.iter().zip(statuses) {
            match status {
                RowStatus::Ok => applied += 1,
                RowStatus::Failed(reason) => ctx.diag.row_failure(
                    "owner-failed",
                    format!(
                        "could not place {} in {} of {}: {reason}",
                        row.child, row.field, row.owner
                    ),
                ),
            }
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use cmload_store::MemoryStore;
    use proptest::prelude::*;

    fn owned(id: u32, owner: u32) -> PendingOwned {
        PendingOwned {
            class: ClassId::new(1),
            id: ObjectId::new(id),
            guid: Uuid::new_v4(),
            owner: ObjectId::new(owner),
            field: FieldId::new(1001),
            kind: Cardinality::Collection,
            ord: None,
        }
    }

    fn run(ledger: Ledger, store: &mut MemoryStore) -> (CreationOutcome, Diagnostics) {
        let config = LoadConfig::default();
        let mut created = CreatedObjectSet::new(ObjectId::new(1000));
        let mut diag = Diagnostics::new(100);
        let mut progress = NoProgress;
        let mut ctx = CreateContext {
            store,
            created: &mut created,
            config: &config,
            diag: &mut diag,
            progress: &mut progress,
        };
        let outcome = ledger.materialize(&mut ctx).unwrap();
        (outcome, diag)
    }

    #[test]
    fn children_listed_before_owners_still_get_created() {
        let mut ledger = Ledger::new();
        ledger.push_owned(owned(4, 3));
        ledger.push_owned(owned(3, 2));
        ledger.push_owned(owned(2, 1));
        ledger.push_root(PendingRoot {
            class: ClassId::new(1),
            id: ObjectId::new(1),
            guid: Uuid::new_v4(),
        });

        let mut store = MemoryStore::new();
        let (outcome, diag) = run(ledger, &mut store);
        assert_eq!(outcome.created, 4);
        assert_eq!(outcome.waves, 3);
        assert_eq!(diag.total(), 0);
        assert_eq!(
            store.object(ObjectId::new(4)).unwrap().owner.unwrap().owner,
            ObjectId::new(3)
        );
    }

    #[test]
    fn cyclic_owners_are_reported_not_created() {
        let mut ledger = Ledger::new();
        ledger.push_owned(owned(10, 11));
        ledger.push_owned(owned(11, 10));
        let mut store = MemoryStore::new();
        let (outcome, diag) = run(ledger, &mut store);
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.stranded, 2);
        assert!(diag.has_key("stalled-creation"));
        assert_eq!(store.object_count(), 0);
    }

    #[test]
    fn created_set_splits_on_threshold() {
        let mut set = CreatedObjectSet::new(ObjectId::new(10));
        set.insert(ObjectId::new(3));
        set.insert(ObjectId::new(30));
        assert!(set.contains(ObjectId::new(3)));
        assert!(set.contains(ObjectId::new(30)));
        assert!(!set.contains(ObjectId::new(4)));
        set.set_threshold(ObjectId::new(50));
        assert!(set.contains(ObjectId::new(30)));
        assert_eq!(set.len(), 2);
    }

    proptest! {
        /// A random forest given in shuffled order is fully created in at
        /// most depth + 1 waves.
        #[test]
        fn waves_terminate_within_depth(
            parents in proptest::collection::vec(0usize..1000, 1..40),
            rotate in 0usize..40,
        ) {
            // parents[i] picks an owner among the nodes before i (or none).
            let n = parents.len();
            let mut owner_of: Vec<Option<usize>> = Vec::with_capacity(n);
            for (i, p) in parents.iter().enumerate() {
                owner_of.push(if i == 0 || p % 4 == 0 { None } else { Some(p % i) });
            }
            let mut depth = vec![0usize; n];
            for i in 0..n {
                depth[i] = owner_of[i].map(|o| depth[o] + 1).unwrap_or(0);
            }
            let max_depth = depth.iter().copied().max().unwrap_or(0);

            let mut order: Vec<usize> = (0..n).collect();
            order.rotate_left(rotate % n);
            let mut ledger = Ledger::new();
            for i in order {
                let id = i as u32 + 1;
                match owner_of[i] {
                    None => ledger.push_root(PendingRoot {
                        class: ClassId::new(1),
                        id: ObjectId::new(id),
                        guid: Uuid::new_v4(),
                    }),
                    Some(o) => ledger.push_owned(owned(id, o as u32 + 1)),
                }
            }

            let mut store = MemoryStore::new();
            let (outcome, _) = run(ledger, &mut store);
            prop_assert_eq!(outcome.created, n);
            prop_assert_eq!(outcome.stranded, 0);
            prop_assert!(outcome.waves <= max_depth);
        }
    }
}
