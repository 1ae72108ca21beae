//! In-memory `ObjectStore` with `bincode` snapshots.

use crate::{
    MultiText, MultilingualWrite, NewObject, ObjectRow, ObjectStore, OwnerAssignment,
    Ownership, ReferenceRow, ReferenceWrite, RowStatus, ScalarValue, ScalarWrite, StoreError,
    StoreResult,
};
use ahash::{AHashMap, AHashSet};
use cmload_schema::{Cardinality, ClassId, FieldId, ObjectId, WsId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// Counters of mutating calls, by row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub creates: usize,
    pub owner_updates: usize,
    pub deletes: usize,
    pub scalar_writes: usize,
    pub multilingual_writes: usize,
    pub reference_writes: usize,
    pub reference_removals: usize,
    pub field_clears: usize,
}

impl WriteStats {
    /// Structural mutations only (creates, moves, deletes).
    pub fn structural(&self) -> usize {
        self.creates + self.owner_updates + self.deletes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct RefSlot {
    target: ObjectId,
    ord: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStore {
    objects: AHashMap<ObjectId, ObjectRow>,
    guids: AHashMap<Uuid, ObjectId>,
    children: AHashMap<ObjectId, Vec<ObjectId>>,
    scalars: AHashMap<(ObjectId, FieldId), ScalarValue>,
    multilingual: AHashMap<(ObjectId, FieldId), BTreeMap<WsId, MultiText>>,
    references: AHashMap<(ObjectId, FieldId), Vec<RefSlot>>,
    incoming: AHashMap<ObjectId, AHashSet<(ObjectId, FieldId)>>,
    #[serde(skip)]
    stats: WriteStats,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = WriteStats::default();
    }

    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StoreError::Codec(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> StoreResult<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Load a snapshot, or start empty when the file does not exist yet.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        ids.sort();
        ids
    }

    fn is_owned_by(&self, candidate: ObjectId, ancestor: ObjectId) -> bool {
        let mut current = Some(candidate);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self
                .objects
                .get(&id)
                .and_then(|row| row.owner.map(|o| o.owner));
        }
        false
    }

    fn detach_from_owner(&mut self, child: ObjectId) {
        let Some(owner) = self.objects.get(&child).and_then(|r| r.owner) else {
            return;
        };
        if let Some(list) = self.children.get_mut(&owner.owner) {
            list.retain(|c| *c != child);
        }
    }

    fn apply_owner(&mut self, row: &OwnerAssignment) -> RowStatus {
        if !self.objects.contains_key(&row.owner) {
            return RowStatus::failed(format!("owner {} does not exist", row.owner));
        }
        if !self.objects.contains_key(&row.child) {
            return RowStatus::failed(format!("object {} does not exist", row.child));
        }
        if self.is_owned_by(row.owner, row.child) {
            return RowStatus::failed(format!(
                "making {} own {} would create an ownership cycle",
                row.owner, row.child
            ));
        }

        let ord = match row.kind {
            Cardinality::Sequence => {
                let siblings: Vec<Option<u32>> = self
                    .children
                    .get(&row.owner)
                    .into_iter()
                    .flatten()
                    .filter(|c| **c != row.child)
                    .filter_map(|c| self.objects.get(c))
                    .filter_map(|r| r.owner)
                    .filter(|o| o.field == row.field)
                    .map(|o| o.ord)
                    .collect();
                match row.ord {
                    Some(ord) if siblings.contains(&Some(ord)) => {
                        return RowStatus::failed(format!(
                            "order {ord} already used in {} of {}",
                            row.field, row.owner
                        ));
                    }
                    Some(ord) => Some(ord),
                    None => Some(siblings.into_iter().flatten().max().unwrap_or(0) + 1),
                }
            }
            Cardinality::Atomic | Cardinality::Collection => None,
        };

        self.detach_from_owner(row.child);
        self.children.entry(row.owner).or_default().push(row.child);
        if let Some(object) = self.objects.get_mut(&row.child) {
            object.owner = Some(Ownership {
                owner: row.owner,
                field: row.field,
                kind: row.kind,
                ord,
            });
        }
        self.stats.owner_updates += 1;
        RowStatus::Ok
    }

    fn apply_reference(&mut self, kind: Cardinality, row: &ReferenceWrite) -> RowStatus {
        if !self.objects.contains_key(&row.source) {
            return RowStatus::failed(format!("source {} does not exist", row.source));
        }
        if !self.objects.contains_key(&row.target) {
            return RowStatus::failed(format!("target {} does not exist", row.target));
        }
        let key = (row.source, row.field);
        let slots = self.references.entry(key).or_default();
        match kind {
            Cardinality::Atomic => {
                let previous: Vec<ObjectId> = slots.drain(..).map(|s| s.target).collect();
                slots.push(RefSlot {
                    target: row.target,
                    ord: None,
                });
                for old in previous {
                    if old != row.target {
                        if let Some(set) = self.incoming.get_mut(&old) {
                            set.remove(&key);
                        }
                    }
                }
            }
            Cardinality::Collection => {
                if slots.iter().any(|s| s.target == row.target) {
                    return RowStatus::Ok;
                }
                slots.push(RefSlot {
                    target: row.target,
                    ord: None,
                });
            }
            Cardinality::Sequence => {
                let ord = match row.ord {
                    Some(ord) if slots.iter().any(|s| s.ord == Some(ord)) => {
                        return RowStatus::failed(format!(
                            "reference order {ord} already used in {} of {}",
                            row.field, row.source
                        ));
                    }
                    Some(ord) => ord,
                    None => slots.iter().filter_map(|s| s.ord).max().unwrap_or(0) + 1,
                };
                slots.push(RefSlot {
                    target: row.target,
                    ord: Some(ord),
                });
                slots.sort_by_key(|s| s.ord);
            }
        }
        self.incoming.entry(row.target).or_default().insert(key);
        self.stats.reference_writes += 1;
        RowStatus::Ok
    }

    fn collect_closure(&self, roots: &[ObjectId]) -> AHashSet<ObjectId> {
        let mut doomed = AHashSet::new();
        let mut stack: Vec<ObjectId> = roots
            .iter()
            .copied()
            .filter(|id| self.objects.contains_key(id))
            .collect();
        while let Some(id) = stack.pop() {
            if !doomed.insert(id) {
                continue;
            }
            if let Some(kids) = self.children.get(&id) {
                stack.extend(kids.iter().copied());
            }
        }
        doomed
    }
}

impl ObjectStore for MemoryStore {
    fn create_objects(&mut self, rows: &[NewObject]) -> StoreResult<Vec<RowStatus>> {
        let mut statuses = Vec::with_capacity(rows.len());
        for row in rows {
            if row.id.raw() == 0 {
                statuses.push(RowStatus::failed("object id 0 is reserved"));
            } else if self.objects.contains_key(&row.id) {
                statuses.push(RowStatus::failed(format!("object {} already exists", row.id)));
            } else if self.guids.contains_key(&row.guid) {
                statuses.push(RowStatus::failed(format!("guid {} already exists", row.guid)));
            } else {
                self.objects.insert(
                    row.id,
                    ObjectRow {
                        id: row.id,
                        class: row.class,
                        guid: row.guid,
                        owner: None,
                    },
                );
                self.guids.insert(row.guid, row.id);
                self.stats.creates += 1;
                statuses.push(RowStatus::Ok);
            }
        }
        Ok(statuses)
    }

    fn set_owners(&mut self, rows: &[OwnerAssignment]) -> StoreResult<Vec<RowStatus>> {
        Ok(rows.iter().map(|row| self.apply_owner(row)).collect())
    }

    fn set_scalar_fields(&mut self, rows: &[ScalarWrite]) -> StoreResult<Vec<RowStatus>> {
        let mut statuses = Vec::with_capacity(rows.len());
        for row in rows {
            if !self.objects.contains_key(&row.object) {
                statuses.push(RowStatus::failed(format!("object {} does not exist", row.object)));
                continue;
            }
            self.scalars
                .insert((row.object, row.field), row.value.clone());
            self.stats.scalar_writes += 1;
            statuses.push(RowStatus::Ok);
        }
        Ok(statuses)
    }

    fn set_multilingual_fields(
        &mut self,
        rows: &[MultilingualWrite],
    ) -> StoreResult<Vec<RowStatus>> {
        let mut statuses = Vec::with_capacity(rows.len());
        for row in rows {
            if !self.objects.contains_key(&row.object) {
                statuses.push(RowStatus::failed(format!("object {} does not exist", row.object)));
                continue;
            }
            let values = self.multilingual.entry((row.object, row.field)).or_default();
            if row.text.is_empty() {
                values.remove(&row.ws);
            } else {
                values.insert(
                    row.ws,
                    MultiText {
                        text: row.text.clone(),
                        fmt: row.fmt.clone(),
                    },
                );
            }
            self.stats.multilingual_writes += 1;
            statuses.push(RowStatus::Ok);
        }
        Ok(statuses)
    }

    fn insert_references(
        &mut self,
        kind: Cardinality,
        rows: &[ReferenceWrite],
    ) -> StoreResult<Vec<RowStatus>> {
        Ok(rows
            .iter()
            .map(|row| self.apply_reference(kind, row))
            .collect())
    }

    fn remove_reference(
        &mut self,
        source: ObjectId,
        field: FieldId,
        target: ObjectId,
    ) -> StoreResult<bool> {
        let key = (source, field);
        let Some(slots) = self.references.get_mut(&key) else {
            return Ok(false);
        };
        let Some(pos) = slots.iter().position(|s| s.target == target) else {
            return Ok(false);
        };
        slots.remove(pos);
        if !slots.iter().any(|s| s.target == target) {
            if let Some(set) = self.incoming.get_mut(&target) {
                set.remove(&key);
            }
        }
        self.stats.reference_removals += 1;
        Ok(true)
    }

    fn clear_field(&mut self, object: ObjectId, field: FieldId) -> StoreResult<()> {
        let key = (object, field);
        let mut cleared = self.scalars.remove(&key).is_some();
        cleared |= self.multilingual.remove(&key).is_some();
        if let Some(slots) = self.references.remove(&key) {
            for slot in slots {
                if let Some(set) = self.incoming.get_mut(&slot.target) {
                    set.remove(&key);
                }
            }
            cleared = true;
        }
        if cleared {
            self.stats.field_clears += 1;
        }
        Ok(())
    }

    fn delete_objects(&mut self, ids: &[ObjectId]) -> StoreResult<usize> {
        let doomed = self.collect_closure(ids);
        if doomed.is_empty() {
            return Ok(0);
        }

        for id in &doomed {
            self.detach_from_owner(*id);
        }
        for id in &doomed {
            if let Some(row) = self.objects.remove(id) {
                self.guids.remove(&row.guid);
            }
            self.children.remove(id);
        }

        self.scalars.retain(|(obj, _), _| !doomed.contains(obj));
        self.multilingual.retain(|(obj, _), _| !doomed.contains(obj));

        // Incoming rows from surviving sources into doomed targets.
        let mut touched: Vec<(ObjectId, FieldId)> = Vec::new();
        for id in &doomed {
            if let Some(sources) = self.incoming.remove(id) {
                touched.extend(sources);
            }
        }
        for key in touched {
            if let Some(slots) = self.references.get_mut(&key) {
                slots.retain(|s| !doomed.contains(&s.target));
            }
        }
        let outgoing: Vec<((ObjectId, FieldId), Vec<RefSlot>)> = self
            .references
            .iter()
            .filter(|((src, _), _)| doomed.contains(src))
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (key, slots) in outgoing {
            self.references.remove(&key);
            for slot in slots {
                if let Some(set) = self.incoming.get_mut(&slot.target) {
                    set.remove(&key);
                }
            }
        }

        self.stats.deletes += doomed.len();
        Ok(doomed.len())
    }

    fn max_object_id(&self) -> ObjectId {
        self.objects
            .keys()
            .copied()
            .max()
            .unwrap_or(ObjectId::new(0))
    }

    fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn lookup_guid(&self, guid: &Uuid) -> Option<ObjectId> {
        self.guids.get(guid).copied()
    }

    fn object(&self, id: ObjectId) -> Option<ObjectRow> {
        self.objects.get(&id).cloned()
    }

    fn objects_of_class(&self, class: ClassId) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|row| row.class == class)
            .map(|row| row.id)
            .collect();
        ids.sort();
        ids
    }

    fn owned_objects(&self, owner: ObjectId, field: FieldId) -> Vec<ObjectId> {
        let mut owned: Vec<(Option<u32>, ObjectId)> = self
            .children
            .get(&owner)
            .into_iter()
            .flatten()
            .filter_map(|c| self.objects.get(c))
            .filter_map(|row| row.owner.filter(|o| o.field == field).map(|o| (o.ord, row.id)))
            .collect();
        owned.sort();
        owned.into_iter().map(|(_, id)| id).collect()
    }

    fn owned_children(&self, owner: ObjectId) -> Vec<(FieldId, ObjectId)> {
        let mut owned: Vec<(FieldId, Option<u32>, ObjectId)> = self
            .children
            .get(&owner)
            .into_iter()
            .flatten()
            .filter_map(|c| self.objects.get(c))
            .filter_map(|row| row.owner.map(|o| (o.field, o.ord, row.id)))
            .collect();
        owned.sort();
        owned.into_iter().map(|(f, _, id)| (f, id)).collect()
    }

    fn scalar(&self, object: ObjectId, field: FieldId) -> Option<ScalarValue> {
        self.scalars.get(&(object, field)).cloned()
    }

    fn multilingual(&self, object: ObjectId, field: FieldId, ws: WsId) -> Option<MultiText> {
        self.multilingual
            .get(&(object, field))
            .and_then(|values| values.get(&ws))
            .cloned()
    }

    fn multilingual_all(&self, object: ObjectId, field: FieldId) -> Vec<(WsId, MultiText)> {
        self.multilingual
            .get(&(object, field))
            .map(|values| values.iter().map(|(ws, t)| (*ws, t.clone())).collect())
            .unwrap_or_default()
    }

    fn references(&self, source: ObjectId, field: FieldId) -> Vec<ReferenceRow> {
        self.references
            .get(&(source, field))
            .map(|slots| {
                slots
                    .iter()
                    .map(|s| ReferenceRow {
                        source,
                        field,
                        target: s.target,
                        ord: s.ord,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn referrers(&self, target: ObjectId) -> Vec<ReferenceRow> {
        let mut rows: Vec<ReferenceRow> = self
            .incoming
            .get(&target)
            .into_iter()
            .flatten()
            .flat_map(|(source, field)| self.references(*source, *field))
            .filter(|row| row.target == target)
            .collect();
        rows.sort_by_key(|r| (r.source, r.field, r.ord));
        rows
    }
}
