//! Identity resolution: XML `id` attributes to `(ObjectId, GUID)` pairs.
//!
//! GUID-shaped ids (`I`/`g` prefix and braces optional) go through a
//! GUID→id table; anything else is a session-local name used only for
//! in-file `target="..."` references. Fresh ids come from a counter that
//! starts above the largest id already in the store.

use crate::error::{LoadError, LoadResult};
use ahash::AHashMap;
use cmload_schema::ObjectId;
use cmload_store::ObjectStore;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedId {
    Guid(Uuid),
    Name(String),
}

/// Parse an XML object id.
pub fn parse_object_id(raw: &str) -> ParsedId {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix('I')
        .or_else(|| trimmed.strip_prefix('g'))
        .unwrap_or(trimmed);
    let body = body
        .strip_prefix('{')
        .and_then(|b| b.strip_suffix('}'))
        .unwrap_or(body);
    match Uuid::parse_str(body) {
        Ok(guid) => ParsedId::Guid(guid),
        Err(_) => match Uuid::parse_str(trimmed) {
            Ok(guid) => ParsedId::Guid(guid),
            Err(_) => ParsedId::Name(trimmed.to_string()),
        },
    }
}

/// `Strict`: every GUID must be new to the session and the store.
/// `Merge`: a GUID that is already known resolves to the known object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    Strict,
    Merge,
}

/// Where a GUID mapping came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// An object element of this document.
    Element,
    /// Looked up in the store (reference target, not yet seen as an element).
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub id: ObjectId,
    pub guid: Uuid,
    /// No row exists for this object yet.
    pub is_new: bool,
    /// Existing object that this one displaces (filled atomic slot of another class).
    pub replaces: Option<ObjectId>,
}

#[derive(Debug)]
pub struct IdentityResolver {
    by_guid: AHashMap<Uuid, (ObjectId, Binding)>,
    by_name: AHashMap<String, ObjectId>,
    guid_of: AHashMap<ObjectId, Uuid>,
    next: ObjectId,
    first_new: ObjectId,
}

impl IdentityResolver {
    /// Start allocating above `store_max`.
    pub fn new(store_max: ObjectId) -> Self {
        let first_new = store_max.next();
        Self {
            by_guid: AHashMap::new(),
            by_name: AHashMap::new(),
            guid_of: AHashMap::new(),
            next: first_new,
            first_new,
        }
    }

    pub fn allocate(&mut self) -> ObjectId {
        let id = self.next;
        self.next = self.next.next();
        id
    }

    /// First id handed out by this session; smaller ids pre-date it.
    pub fn first_new(&self) -> ObjectId {
        self.first_new
    }

    /// Next id the counter would hand out.
    pub fn next_id(&self) -> ObjectId {
        self.next
    }

    pub fn is_session_object(&self, id: ObjectId) -> bool {
        id >= self.first_new
    }

    /// GUID assigned to a session object, when known.
    pub fn guid_of(&self, id: ObjectId) -> Option<Uuid> {
        self.guid_of.get(&id).copied()
    }

    /// Resolve the id of an object element.
    pub fn resolve(
        &mut self,
        raw: Option<&str>,
        mode: IdentityMode,
        store: &dyn ObjectStore,
    ) -> LoadResult<Resolution> {
        let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
            return Ok(self.fresh(Uuid::new_v4()));
        };

        match parse_object_id(raw) {
            ParsedId::Guid(guid) => {
                if let Some((id, binding)) = self.by_guid.get(&guid).copied() {
                    return match (mode, binding) {
                        (IdentityMode::Strict, Binding::Element) => {
                            Err(LoadError::RepeatedGuid(guid))
                        }
                        (IdentityMode::Strict, Binding::Store) if !self.is_session_object(id) => {
                            Err(LoadError::RepeatedGuid(guid))
                        }
                        _ => {
                            self.by_guid.insert(guid, (id, Binding::Element));
                            Ok(Resolution {
                                id,
                                guid,
                                is_new: false,
                                replaces: None,
                            })
                        }
                    };
                }
                if let Some(id) = store.lookup_guid(&guid) {
                    if mode == IdentityMode::Strict {
                        return Err(LoadError::RepeatedGuid(guid));
                    }
                    self.by_guid.insert(guid, (id, Binding::Element));
                    return Ok(Resolution {
                        id,
                        guid,
                        is_new: false,
                        replaces: None,
                    });
                }
                let resolution = self.fresh(guid);
                self.by_guid.insert(guid, (resolution.id, Binding::Element));
                Ok(resolution)
            }
            ParsedId::Name(name) => {
                if self.by_name.contains_key(&name) {
                    return Err(LoadError::RepeatedName(name));
                }
                let resolution = self.fresh(Uuid::new_v4());
                self.by_name.insert(name, resolution.id);
                Ok(resolution)
            }
        }
    }

    /// Bind an element id to an existing store object (fill-in-place merges).
    pub fn bind_existing(
        &mut self,
        raw: Option<&str>,
        id: ObjectId,
        guid: Uuid,
    ) -> LoadResult<Resolution> {
        match raw.filter(|r| !r.trim().is_empty()).map(parse_object_id) {
            Some(ParsedId::Guid(g)) => {
                if let Some((bound, Binding::Element)) = self.by_guid.get(&g).copied() {
                    if bound != id {
                        return Err(LoadError::RepeatedGuid(g));
                    }
                }
                self.by_guid.insert(g, (id, Binding::Element));
            }
            Some(ParsedId::Name(name)) => {
                if self.by_name.contains_key(&name) {
                    return Err(LoadError::RepeatedName(name));
                }
                self.by_name.insert(name, id);
            }
            None => {}
        }
        self.by_guid.entry(guid).or_insert((id, Binding::Element));
        Ok(Resolution {
            id,
            guid,
            is_new: false,
            replaces: None,
        })
    }

    /// Resolve a `target="..."` reference without creating anything.
    pub fn lookup_target(&mut self, raw: &str, store: &dyn ObjectStore) -> Option<ObjectId> {
        match parse_object_id(raw) {
            ParsedId::Guid(guid) => {
                if let Some((id, _)) = self.by_guid.get(&guid) {
                    return Some(*id);
                }
                let id = store.lookup_guid(&guid)?;
                self.by_guid.insert(guid, (id, Binding::Store));
                Some(id)
            }
            ParsedId::Name(name) => self.by_name.get(&name).copied(),
        }
    }

    /// Register an object created outside the element stream (implicit objects).
    pub fn register_generated(&mut self, id: ObjectId, guid: Uuid) {
        self.by_guid.insert(guid, (id, Binding::Element));
        self.guid_of.insert(id, guid);
    }

    fn fresh(&mut self, guid: Uuid) -> Resolution {
        let id = self.allocate();
        self.guid_of.insert(id, guid);
        Resolution {
            id,
            guid,
            is_new: true,
            replaces: None,
        }
    }
}
