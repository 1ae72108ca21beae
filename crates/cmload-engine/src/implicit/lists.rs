//! Possibility lists: rules 1, 4 and 5.
//!
//! Items are matched case-insensitively by name, then by abbreviation, then
//! (with a warning) with the two swapped. Anything still unmatched becomes a
//! new item of the list's item class.

use super::{fold, LinkSite, LinkTarget};
use crate::error::LoadResult;
use crate::schema::FieldInfo;
use crate::session::ImportSession;
use crate::tokens::Attributes;
use ahash::AHashMap;
use cmload_schema::{ClassId, FieldId, MetadataService, ObjectId, WsId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemMatch {
    /// Name matched name, or abbreviation matched abbreviation.
    Direct(ObjectId),
    /// The name hit one item and the abbreviation another; the name wins.
    Conflicting { by_name: ObjectId, by_abbr: ObjectId },
    /// Only the swapped comparison matched.
    Swapped(ObjectId),
    Missing,
}

/// Names and abbreviations of one list (or one owner's slots or classes) in one
/// writing system.
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    by_name: AHashMap<String, ObjectId>,
    by_abbr: AHashMap<String, ObjectId>,
}

impl NameIndex {
    pub fn insert(&mut self, id: ObjectId, name: Option<&str>, abbr: Option<&str>) {
        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            self.by_name.entry(fold(name)).or_insert(id);
        }
        if let Some(abbr) = abbr.filter(|a| !a.trim().is_empty()) {
            self.by_abbr.entry(fold(abbr)).or_insert(id);
        }
    }

    pub fn lookup(&self, name: Option<&str>, abbr: Option<&str>) -> ItemMatch {
        let name = name.map(fold);
        let abbr = abbr.map(fold);
        let hit = |map: &AHashMap<String, ObjectId>, key: &Option<String>| {
            key.as_ref().and_then(|k| map.get(k)).copied()
        };

        match (hit(&self.by_name, &name), hit(&self.by_abbr, &abbr)) {
            (Some(by_name), Some(by_abbr)) if by_name != by_abbr => {
                ItemMatch::Conflicting { by_name, by_abbr }
            }
            (Some(id), _) | (None, Some(id)) => ItemMatch::Direct(id),
            (None, None) => match hit(&self.by_abbr, &name).or_else(|| hit(&self.by_name, &abbr)) {
                Some(id) => ItemMatch::Swapped(id),
                None => ItemMatch::Missing,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len().max(self.by_abbr.len())
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty() && self.by_abbr.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ListInfo {
    item_class: ClassId,
    closed: bool,
    names: NameIndex,
}

#[derive(Debug, Default)]
pub struct ListCache {
    /// Keyed by (list, writing system).
    lists: AHashMap<(ObjectId, WsId), ListInfo>,
    /// Affix slots and inflection classes, keyed by (part of speech, field, ws).
    owned: AHashMap<(ObjectId, FieldId, WsId), NameIndex>,
}

/// What a link asks for, with the request's own words for diagnostics.
struct Wanted<'a> {
    ws: WsId,
    name: Option<&'a str>,
    abbr: Option<&'a str>,
}

impl Wanted<'_> {
    fn describe(&self) -> String {
        match (self.name, self.abbr) {
            (Some(n), Some(a)) => format!("name `{n}` / abbr `{a}`"),
            (Some(n), None) => format!("name `{n}`"),
            (None, Some(a)) => format!("abbr `{a}`"),
            (None, None) => "an unnamed item".to_string(),
        }
    }
}

// ============================================================================
// Rule 5: generic list items
// ============================================================================

pub(crate) fn resolve_possibility(
    session: &mut ImportSession<'_>,
    site: LinkSite,
    attrs: &Attributes,
) -> LoadResult<LinkTarget> {
    let Some(code) = attrs.non_empty("ws") else {
        return Ok(LinkTarget::Unresolved);
    };
    let ws = session.ws_id(code)?;
    let Some(list) = list_root(session, site)? else {
        session.diag.unresolved(
            "no-list-root",
            format!(
                "{} of {} has no possibility list to resolve `{}` in",
                session.schema.field_name(site.field.id),
                site.owner,
                attrs.get("name").or(attrs.get("abbr")).unwrap_or_default()
            ),
        );
        return Ok(LinkTarget::Unresolved);
    };

    let wanted = Wanted {
        ws,
        name: attrs.non_empty("name"),
        abbr: attrs.non_empty("abbr"),
    };
    let (item, created) = find_or_create_item(session, list, site.field.target_class, &wanted)?;

    if created {
        if let Some(vernacular) = attrs.non_empty("wsv") {
            let wsv = session.ws_id(vernacular)?;
            let name_field = session.schema.require_field("CmPossibility", "Name")?;
            let abbr_field = session.schema.require_field("CmPossibility", "Abbreviation")?;
            let namev = attrs.non_empty("namev");
            let abbrv = attrs.non_empty("abbrv");
            if let Some(namev) = namev.or(abbrv) {
                session.put_text(item, name_field, wsv, namev)?;
            }
            if let Some(abbrv) = abbrv.or(namev) {
                session.put_text(item, abbr_field, wsv, abbrv)?;
            }
        }
    }
    Ok(LinkTarget::Resolved(item))
}

/// The possibility list a reference field draws its items from.
fn list_root(session: &mut ImportSession<'_>, site: LinkSite) -> LoadResult<Option<ObjectId>> {
    // A reversal entry's part of speech comes from its own index.
    if session.schema.is_a(site.owner_class, "ReversalIndexEntry")
        && session
            .schema
            .field_named("ReversalIndexEntry", "PartOfSpeech")
            .is_some_and(|f| f.id == site.field.id)
    {
        let Some(index) = owning_ancestor(session, site.owner, "ReversalIndex") else {
            return Ok(None);
        };
        return session
            .owned_or_create(index, "ReversalIndex", "PartsOfSpeech", "CmPossibilityList")
            .map(Some);
    }

    let Some(path) = session
        .schema
        .field(site.field.id)
        .and_then(|d| d.list_root.clone())
    else {
        return Ok(None);
    };
    let holder = match path.owner_class.as_str() {
        "LexDb" => Some(session.lex_db()?),
        other => session.singleton(other),
    };
    match holder {
        Some(holder) => session
            .owned_or_create(holder, &path.owner_class, &path.field, "CmPossibilityList")
            .map(Some),
        None => Ok(None),
    }
}

fn owning_ancestor(session: &ImportSession<'_>, start: ObjectId, class: &str) -> Option<ObjectId> {
    let mut current = session.store.object(start)?.owner?.owner;
    loop {
        let row = session.store.object(current)?;
        if session.schema.is_a(row.class, class) {
            return Some(current);
        }
        current = row.owner?.owner;
    }
}

/// Find an item in `list` by name/abbreviation, creating it when nothing
/// matches. Returns the item and whether it is new.
fn find_or_create_item(
    session: &mut ImportSession<'_>,
    list: ObjectId,
    target: Option<ClassId>,
    wanted: &Wanted<'_>,
) -> LoadResult<(ObjectId, bool)> {
    let key = (list, wanted.ws);
    if !session.implicit.lists.lists.contains_key(&key) {
        let info = load_list(session, list, target, wanted.ws)?;
        session.implicit.lists.lists.insert(key, info);
    }
    let Some(info) = session.implicit.lists.lists.get(&key) else {
        return Ok((list, false));
    };
    let (item_class, closed) = (info.item_class, info.closed);

    match info.names.lookup(wanted.name, wanted.abbr) {
        ItemMatch::Direct(id) => Ok((id, false)),
        ItemMatch::Conflicting { by_name, by_abbr } => {
            session.diag.data_quality(
                "name-abbr-conflict",
                format!(
                    "{} matches {by_name} by name but {by_abbr} by abbreviation; using {by_name}",
                    wanted.describe()
                ),
            );
            Ok((by_name, false))
        }
        ItemMatch::Swapped(id) => {
            session.diag.data_quality(
                "name-abbr-swapped",
                format!(
                    "{} only matches {id} with name and abbreviation swapped",
                    wanted.describe()
                ),
            );
            Ok((id, false))
        }
        ItemMatch::Missing => {
            if closed {
                session.diag.data_quality(
                    "closed-list",
                    format!("adding {} to closed list {list}", wanted.describe()),
                );
            }
            let possibilities = session.schema.require_field("CmPossibilityList", "Possibilities")?;
            let id = create_named(session, item_class, list, possibilities, wanted)?;
            if let Some(info) = session.implicit.lists.lists.get_mut(&key) {
                info.names.insert(id, wanted.name.or(wanted.abbr), wanted.abbr.or(wanted.name));
            }
            tracing::debug!(%id, %list, item = %wanted.describe(), "created list item");
            Ok((id, true))
        }
    }
}

fn load_list(
    session: &mut ImportSession<'_>,
    list: ObjectId,
    target: Option<ClassId>,
    ws: WsId,
) -> LoadResult<ListInfo> {
    session.flush_fields()?;
    let schema = &session.schema;
    let possibilities = schema.require_field("CmPossibilityList", "Possibilities")?;
    let sub = schema.require_field("CmPossibility", "SubPossibilities")?;
    let name = schema.require_field("CmPossibility", "Name")?;
    let abbr = schema.require_field("CmPossibility", "Abbreviation")?;

    let declared = schema
        .field_named("CmPossibilityList", "ItemClsid")
        .and_then(|f| session.store.scalar(list, f.id))
        .and_then(|v| v.as_integer())
        .and_then(|raw| u32::try_from(raw).ok())
        .map(ClassId::new)
        .filter(|c| schema.class(*c).is_some());
    let item_class = match (declared, target) {
        (Some(class), _) => class,
        (None, Some(target)) if !schema.is_abstract(target) => target,
        _ => schema.require_class("CmPossibility")?,
    };
    let closed = schema
        .field_named("CmPossibilityList", "IsClosed")
        .and_then(|f| session.store.scalar(list, f.id))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut names = NameIndex::default();
    let mut pending = session.store.owned_objects(list, possibilities.id);
    while let Some(item) = pending.pop() {
        names.insert(
            item,
            session.text_of(item, name.id, ws).as_deref(),
            session.text_of(item, abbr.id, ws).as_deref(),
        );
        pending.extend(session.store.owned_objects(item, sub.id));
    }
    tracing::debug!(
        %list,
        items = names.len(),
        class = %schema.class_name(item_class),
        "indexed possibility list"
    );
    Ok(ListInfo {
        item_class,
        closed,
        names,
    })
}

/// New object in `owner.field` with `Name` and `Abbreviation` set, each
/// defaulting to the other.
fn create_named(
    session: &mut ImportSession<'_>,
    class: ClassId,
    owner: ObjectId,
    field: FieldInfo,
    wanted: &Wanted<'_>,
) -> LoadResult<ObjectId> {
    let id = session.create_now(class, Some((owner, field)))?;
    let class_name = session.schema.class_name(class);
    let name_field = session.schema.field_named(&class_name, "Name");
    let abbr_field = session.schema.field_named(&class_name, "Abbreviation");
    if let (Some(field), Some(text)) = (name_field, wanted.name.or(wanted.abbr)) {
        session.put_text(id, field, wanted.ws, text)?;
    }
    if let (Some(field), Some(text)) = (abbr_field, wanted.abbr.or(wanted.name)) {
        session.put_text(id, field, wanted.ws, text)?;
    }
    Ok(id)
}

// ============================================================================
// Rules 1 and 4: slots and inflection classes of a part of speech
// ============================================================================

/// The part of speech named by `nameOwner` / `abbrOwner`.
fn owner_part_of_speech(
    session: &mut ImportSession<'_>,
    ws: WsId,
    attrs: &Attributes,
) -> LoadResult<Option<ObjectId>> {
    let Some(project) = session.lang_project() else {
        session.diag.unresolved(
            "no-project",
            "part of speech lookup needs a LangProject".to_string(),
        );
        return Ok(None);
    };
    let list =
        session.owned_or_create(project, "LangProject", "PartsOfSpeech", "CmPossibilityList")?;
    let pos_class = session.schema.class_id_for_name("PartOfSpeech");
    let wanted = Wanted {
        ws,
        name: attrs.non_empty("nameOwner"),
        abbr: attrs.non_empty("abbrOwner"),
    };
    find_or_create_item(session, list, pos_class, &wanted).map(|(pos, _)| Some(pos))
}

/// Find or create a named child of `pos` in `field_name`.
fn owned_item(
    session: &mut ImportSession<'_>,
    pos: ObjectId,
    field_name: &str,
    class_name: &str,
    wanted: &Wanted<'_>,
) -> LoadResult<ObjectId> {
    let field = session.schema.require_field("PartOfSpeech", field_name)?;
    let class = session.schema.require_class(class_name)?;
    let key = (pos, field.id, wanted.ws);

    if !session.implicit.lists.owned.contains_key(&key) {
        session.flush_fields()?;
        let name = session.schema.field_named(class_name, "Name");
        let abbr = session.schema.field_named(class_name, "Abbreviation");
        let mut names = NameIndex::default();
        for child in session.store.owned_objects(pos, field.id) {
            let text =
                |f: Option<FieldInfo>| f.and_then(|f| session.text_of(child, f.id, wanted.ws));
            names.insert(child, text(name).as_deref(), text(abbr).as_deref());
        }
        session.implicit.lists.owned.insert(key, names);
    }

    let found = session
        .implicit
        .lists
        .owned
        .get(&key)
        .map(|names| names.lookup(wanted.name, wanted.abbr))
        .unwrap_or(ItemMatch::Missing);
    match found {
        ItemMatch::Direct(id) | ItemMatch::Conflicting { by_name: id, .. } => Ok(id),
        ItemMatch::Swapped(id) => {
            session.diag.data_quality(
                "name-abbr-swapped",
                format!(
                    "{} only matches {id} with name and abbreviation swapped",
                    wanted.describe()
                ),
            );
            Ok(id)
        }
        ItemMatch::Missing => {
            let id = create_named(session, class, pos, field, wanted)?;
            if let Some(names) = session.implicit.lists.owned.get_mut(&key) {
                names.insert(id, wanted.name.or(wanted.abbr), wanted.abbr.or(wanted.name));
            }
            Ok(id)
        }
    }
}

/// Rule 1: an inflectional affix slot, matched by exact name only.
pub(crate) fn resolve_affix_slot(
    session: &mut ImportSession<'_>,
    attrs: &Attributes,
) -> LoadResult<LinkTarget> {
    let (Some(code), Some(name)) = (attrs.non_empty("ws"), attrs.non_empty("name")) else {
        return Ok(LinkTarget::Unresolved);
    };
    let ws = session.ws_id(code)?;
    let Some(pos) = owner_part_of_speech(session, ws, attrs)? else {
        return Ok(LinkTarget::Unresolved);
    };
    let wanted = Wanted {
        ws,
        name: Some(name),
        abbr: None,
    };
    owned_item(session, pos, "AffixSlots", "MoInflAffixSlot", &wanted).map(LinkTarget::Resolved)
}

/// Rule 4: an inflection class, matched by name and abbreviation.
pub(crate) fn resolve_inflection_class(
    session: &mut ImportSession<'_>,
    attrs: &Attributes,
) -> LoadResult<LinkTarget> {
    let Some(code) = attrs.non_empty("ws") else {
        return Ok(LinkTarget::Unresolved);
    };
    let ws = session.ws_id(code)?;
    let Some(pos) = owner_part_of_speech(session, ws, attrs)? else {
        return Ok(LinkTarget::Unresolved);
    };
    let wanted = Wanted {
        ws,
        name: attrs.non_empty("name"),
        abbr: attrs.non_empty("abbr"),
    };
    owned_item(session, pos, "InflectionClasses", "MoInflClass", &wanted).map(LinkTarget::Resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> NameIndex {
        let mut names = NameIndex::default();
        names.insert(ObjectId::new(1), Some("Noun"), Some("n"));
        names.insert(ObjectId::new(2), Some("Verb"), Some("v"));
        names
    }

    #[test]
    fn name_then_abbreviation() {
        let names = index();
        assert_eq!(names.lookup(Some("noun"), None), ItemMatch::Direct(ObjectId::new(1)));
        assert_eq!(names.lookup(None, Some("V")), ItemMatch::Direct(ObjectId::new(2)));
        assert_eq!(
            names.lookup(Some("Noun"), Some("n")),
            ItemMatch::Direct(ObjectId::new(1))
        );
    }

    #[test]
    fn name_wins_over_conflicting_abbreviation() {
        assert_eq!(
            index().lookup(Some("Noun"), Some("v")),
            ItemMatch::Conflicting {
                by_name: ObjectId::new(1),
                by_abbr: ObjectId::new(2)
            }
        );
    }

    #[test]
    fn swapped_only_when_nothing_direct_matches() {
        let names = index();
        assert_eq!(names.lookup(Some("v"), None), ItemMatch::Swapped(ObjectId::new(2)));
        assert_eq!(names.lookup(None, Some("Noun")), ItemMatch::Swapped(ObjectId::new(1)));
        assert_eq!(names.lookup(Some("Adverb"), Some("adv")), ItemMatch::Missing);
    }

    #[test]
    fn first_item_with_a_name_keeps_it() {
        let mut names = index();
        names.insert(ObjectId::new(3), Some("NOUN"), None);
        assert_eq!(names.lookup(Some("noun"), None), ItemMatch::Direct(ObjectId::new(1)));
    }
}
