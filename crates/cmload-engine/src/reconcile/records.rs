//! Record sets of one list update.

use ahash::AHashMap;
use cmload_schema::{ClassId, FieldId, ObjectId};
use cmload_store::{ObjectStore, Ownership};
use uuid::Uuid;

/// How an original object relates to the update document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    /// Present in the revised tree.
    Matched,
    /// Named by `<Merge from>`; folded into the given object.
    MergedInto(ObjectId),
    /// Named by `<Delete>`.
    Deleted,
    /// Added outside the canonical source; kept as is.
    Custom,
    /// Neither revised nor custom; removed.
    Orphan,
}

impl ItemStatus {
    pub fn is_removed(self) -> bool {
        matches!(
            self,
            ItemStatus::MergedInto(_) | ItemStatus::Deleted | ItemStatus::Orphan
        )
    }
}

/// An object of the original tree, as stored before the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateObjInfo {
    pub id: ObjectId,
    pub guid: Uuid,
    pub class: ClassId,
    pub owner: Option<Ownership>,
    pub status: ItemStatus,
}

/// A reference into the original tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateLinkInfo {
    pub source: ObjectId,
    pub field: FieldId,
    pub target: ObjectId,
    pub ord: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateMergeInfo {
    pub from: ObjectId,
    pub to: ObjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateDeleteInfo {
    pub id: ObjectId,
}

/// Objects indexed by GUID and by id.
#[derive(Debug, Clone, Default)]
pub struct ObjInfoSet {
    items: Vec<UpdateObjInfo>,
    by_guid: AHashMap<Uuid, usize>,
    by_id: AHashMap<ObjectId, usize>,
}

impl ObjInfoSet {
    /// The ownership closure of `owner.field` (owning edges only).
    pub fn load_closure(store: &dyn ObjectStore, owner: ObjectId, field: FieldId) -> Self {
        let mut set = Self::default();
        let mut pending = store.owned_objects(owner, field);
        pending.reverse();
        while let Some(id) = pending.pop() {
            let Some(row) = store.object(id) else {
                continue;
            };
            set.push(UpdateObjInfo {
                id,
                guid: row.guid,
                class: row.class,
                owner: row.owner,
                status: ItemStatus::Orphan,
            });
            let mut children: Vec<ObjectId> = store
                .owned_children(id)
                .into_iter()
                .map(|(_, child)| child)
                .collect();
            children.reverse();
            pending.extend(children);
        }
        set
    }

    pub fn push(&mut self, info: UpdateObjInfo) {
        let index = self.items.len();
        self.by_guid.insert(info.guid, index);
        self.by_id.insert(info.id, index);
        self.items.push(info);
    }

    pub fn by_guid(&self, guid: &Uuid) -> Option<&UpdateObjInfo> {
        self.by_guid.get(guid).map(|i| &self.items[*i])
    }

    pub fn by_id(&self, id: ObjectId) -> Option<&UpdateObjInfo> {
        self.by_id.get(&id).map(|i| &self.items[*i])
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn set_status(&mut self, id: ObjectId, status: ItemStatus) {
        if let Some(index) = self.by_id.get(&id) {
            self.items[*index].status = status;
        }
    }

    pub fn status(&self, id: ObjectId) -> Option<ItemStatus> {
        self.by_id(id).map(|info| info.status)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpdateObjInfo> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Owners of `id` within the set, nearest first.
    pub fn ancestors(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut chain = Vec::new();
        let mut current = self.by_id(id).and_then(|info| info.owner);
        while let Some(owner) = current {
            let Some(info) = self.by_id(owner.owner) else {
                break;
            };
            if chain.contains(&info.id) {
                break;
            }
            chain.push(info.id);
            current = info.owner;
        }
        chain
    }
}
