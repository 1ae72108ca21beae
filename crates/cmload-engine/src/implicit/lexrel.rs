//! Lexical relations (rule 7).
//!
//! `<LexSenseReferences>` and `<LexEntryReferences>` hold links such as
//! `<Link type="Synonym" sense="quick 1"/>`. They are collected in pass 2 and
//! assembled into `LexReference` chains at its end, once per relation type:
//!
//! - collection: unordered sets; two sets merge when one contains the other
//! - pair: exactly two members, order irrelevant
//! - asymmetric: an ordered (head, dependent) pair
//! - tree: one head with its dependents
//! - sequence: members ordered by explicit position
//!
//! Relations already in the store seed the chains, so re-importing the same
//! relations adds nothing.
//!
//! Links are grouped per relation type with the reverse flag kept on each
//! member. A link named by the type's `ReverseName`, or carrying `rev="1"`,
//! swaps head and dependent, so a relation written from either end lands in
//! the same chain as its forward form.

use super::crossref::Lexicon;
use super::fold;
use crate::element::VirtualField;
use crate::error::LoadResult;
use crate::pass1::explicit_ord;
use crate::schema::FieldInfo;
use crate::session::ImportSession;
use crate::tokens::Attributes;
use ahash::AHashMap;
use cmload_schema::{ObjectId, WsId};
use cmload_store::ScalarValue;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MappingType {
    Collection,
    Pair,
    Asymmetric,
    Tree,
    Sequence,
}

impl MappingType {
    pub fn code(self) -> i64 {
        match self {
            MappingType::Collection => 0,
            MappingType::Pair => 1,
            MappingType::Asymmetric => 2,
            MappingType::Tree => 3,
            MappingType::Sequence => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(MappingType::Collection),
            1 => Some(MappingType::Pair),
            2 => Some(MappingType::Asymmetric),
            3 => Some(MappingType::Tree),
            4 => Some(MappingType::Sequence),
            _ => None,
        }
    }

    pub fn from_keyword(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "collection" => Some(MappingType::Collection),
            "pair" => Some(MappingType::Pair),
            "asymmetric" | "asymmetricpair" => Some(MappingType::Asymmetric),
            "tree" => Some(MappingType::Tree),
            "sequence" => Some(MappingType::Sequence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationLink {
    pub owner: ObjectId,
    pub kind: VirtualField,
    pub type_name: String,
    pub ws: Option<WsId>,
    pub locator: String,
    pub wants_sense: bool,
    pub reverse: bool,
    pub ord: Option<u32>,
    pub mapping: Option<MappingType>,
}

pub(crate) fn record_relation(
    session: &mut ImportSession<'_>,
    owner: ObjectId,
    kind: VirtualField,
    attrs: &Attributes,
) -> LoadResult<()> {
    let Some(type_name) = attrs.non_empty("type") else {
        session.diag.data_quality(
            "relation-without-type",
            format!("lexical relation link on {owner} has no type; skipped"),
        );
        return Ok(());
    };
    let (locator, wants_sense) = match (attrs.non_empty("sense"), attrs.non_empty("entry")) {
        (Some(sense), _) => (sense, true),
        (None, Some(entry)) => (entry, false),
        (None, None) => {
            session.diag.data_quality(
                "relation-without-target",
                format!("`{type_name}` relation on {owner} names neither entry nor sense; skipped"),
            );
            return Ok(());
        }
    };
    let ws = match attrs.non_empty("wsv").or(attrs.non_empty("ws")) {
        Some(code) => Some(session.ws_id(code)?),
        None => None,
    };
    let mapping = match attrs.non_empty("mapping") {
        Some(raw) => {
            let parsed = MappingType::from_keyword(raw);
            if parsed.is_none() {
                session.diag.data_quality(
                    "unknown-mapping",
                    format!("unknown relation mapping `{raw}` on {owner}; using collection"),
                );
            }
            parsed
        }
        None => None,
    };

    session.implicit.relations.push(RelationLink {
        owner,
        kind,
        type_name: type_name.trim().to_string(),
        ws,
        locator: locator.trim().to_string(),
        wants_sense,
        reverse: matches!(attrs.get("rev"), Some("1") | Some("true")),
        ord: explicit_ord(attrs)?,
        mapping,
    });
    Ok(())
}

// ============================================================================
// Chain assembly
// ============================================================================

/// Merge `incoming` into `chain` when one set contains the other.
pub fn merge_collection(chain: &mut BTreeSet<ObjectId>, incoming: &BTreeSet<ObjectId>) -> bool {
    if incoming.is_subset(chain) {
        true
    } else if chain.is_subset(incoming) {
        chain.extend(incoming.iter().copied());
        true
    } else {
        false
    }
}

/// One `LexReference`, stored or about to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub existing: Option<ObjectId>,
    pub members: Vec<ObjectId>,
    /// Members already stored.
    pub seeded: usize,
}

impl Chain {
    fn new(members: Vec<ObjectId>) -> Self {
        Self {
            existing: None,
            members,
            seeded: 0,
        }
    }

    fn is_dirty(&self) -> bool {
        self.members.len() >= 2 && (self.existing.is_none() || self.members.len() > self.seeded)
    }

    fn push_missing(&mut self, members: impl IntoIterator<Item = ObjectId>) {
        for member in members {
            if !self.members.contains(&member) {
                self.members.push(member);
            }
        }
    }
}

/// A resolved relation link: `owner` (the element holding the link) and
/// its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub owner: ObjectId,
    pub target: ObjectId,
    pub reverse: bool,
    pub ord: Option<u32>,
}

impl Member {
    fn head_and_dependent(&self) -> (ObjectId, ObjectId) {
        if self.reverse {
            (self.target, self.owner)
        } else {
            (self.owner, self.target)
        }
    }
}

/// Fold the links of one relation type into its chains. Returns a message
/// per link that could not be placed.
pub fn assemble(mapping: MappingType, chains: &mut Vec<Chain>, links: &[Member]) -> Vec<String> {
    let mut conflicts = Vec::new();

    // Links grouped by their owner, in document order.
    let mut owners: Vec<ObjectId> = Vec::new();
    let mut by_owner: AHashMap<ObjectId, Vec<Member>> = AHashMap::new();
    for link in links {
        by_owner
            .entry(link.owner)
            .or_insert_with(|| {
                owners.push(link.owner);
                Vec::new()
            })
            .push(*link);
    }

    match mapping {
        MappingType::Collection => {
            for owner in &owners {
                let mut ordered = vec![*owner];
                for link in &by_owner[owner] {
                    if !ordered.contains(&link.target) {
                        ordered.push(link.target);
                    }
                }
                let incoming: BTreeSet<ObjectId> = ordered.iter().copied().collect();
                let merged = chains.iter_mut().any(|chain| {
                    let mut set: BTreeSet<ObjectId> = chain.members.iter().copied().collect();
                    let fits = merge_collection(&mut set, &incoming);
                    if fits {
                        chain.push_missing(ordered.iter().copied());
                    }
                    fits
                });
                if !merged {
                    chains.push(Chain::new(ordered));
                }
            }
        }
        MappingType::Pair => {
            for link in links {
                let pair: BTreeSet<ObjectId> = [link.owner, link.target].into_iter().collect();
                let known = chains
                    .iter()
                    .any(|c| c.members.iter().copied().collect::<BTreeSet<_>>() == pair);
                if !known {
                    chains.push(Chain::new(vec![link.owner, link.target]));
                }
            }
        }
        MappingType::Asymmetric => {
            for link in links {
                let (head, dependent) = link.head_and_dependent();
                if !chains.iter().any(|c| c.members == [head, dependent]) {
                    chains.push(Chain::new(vec![head, dependent]));
                }
            }
        }
        MappingType::Tree => {
            for link in links {
                let (head, dependent) = link.head_and_dependent();
                match chains.iter_mut().find(|c| c.members.first() == Some(&head)) {
                    Some(chain) => chain.push_missing([dependent]),
                    None => chains.push(Chain::new(vec![head, dependent])),
                }
            }
        }
        MappingType::Sequence => {
            for owner in &owners {
                let mut positions: BTreeMap<u32, ObjectId> = BTreeMap::new();
                for (index, link) in by_owner[owner].iter().enumerate() {
                    let position = link.ord.unwrap_or(index as u32 + 1);
                    match positions.get(&position) {
                        Some(existing) if *existing != link.target => {
                            conflicts.push(format!(
                                "{owner}: position {position} already holds {existing}; {} dropped",
                                link.target
                            ))
                        }
                        Some(_) => {}
                        None => {
                            positions.insert(position, link.target);
                        }
                    }
                }
                let ordered = std::iter::once(*owner).chain(positions.into_values());
                match chains.iter_mut().find(|c| c.members.first() == Some(owner)) {
                    Some(chain) => chain.push_missing(ordered),
                    None => chains.push(Chain::new(ordered.collect())),
                }
            }
        }
    }
    conflicts
}

// ============================================================================
// Relation types
// ============================================================================

struct TypeIndex {
    list: ObjectId,
    by_name: AHashMap<String, ObjectId>,
    by_reverse: AHashMap<String, ObjectId>,
    mapping: AHashMap<ObjectId, MappingType>,
    name: FieldInfo,
    mapping_field: FieldInfo,
}

impl TypeIndex {
    fn load(session: &mut ImportSession<'_>) -> LoadResult<Self> {
        let lex_db = session.lex_db()?;
        let list = session.owned_or_create(lex_db, "LexDb", "References", "CmPossibilityList")?;
        session.flush_fields()?;
        let possibilities = session.schema.require_field("CmPossibilityList", "Possibilities")?;
        let name = session.schema.require_field("CmPossibility", "Name")?;
        let reverse = session.schema.require_field("LexRefType", "ReverseName")?;
        let mapping_field = session.schema.require_field("LexRefType", "MappingType")?;

        let mut index = Self {
            list,
            by_name: AHashMap::new(),
            by_reverse: AHashMap::new(),
            mapping: AHashMap::new(),
            name,
            mapping_field,
        };
        for ty in session.store.owned_objects(list, possibilities.id) {
            for (_, text) in session.store.multilingual_all(ty, name.id) {
                index.by_name.entry(fold(&text.text)).or_insert(ty);
            }
            for (_, text) in session.store.multilingual_all(ty, reverse.id) {
                index.by_reverse.entry(fold(&text.text)).or_insert(ty);
            }
            if let Some(mapping) = session
                .store
                .scalar(ty, mapping_field.id)
                .and_then(|v| v.as_integer())
                .and_then(MappingType::from_code)
            {
                index.mapping.insert(ty, mapping);
            }
        }
        Ok(index)
    }

    /// The relation type of a link and whether the link runs in reverse.
    fn resolve(
        &mut self,
        session: &mut ImportSession<'_>,
        link: &RelationLink,
    ) -> LoadResult<(ObjectId, bool)> {
        let key = fold(&link.type_name);
        if let Some(ty) = self.by_name.get(&key) {
            return Ok((*ty, link.reverse));
        }
        if let Some(ty) = self.by_reverse.get(&key) {
            return Ok((*ty, !link.reverse));
        }

        let class = session.schema.require_class("LexRefType")?;
        let possibilities = session.schema.require_field("CmPossibilityList", "Possibilities")?;
        let ty = session.create_now(class, Some((self.list, possibilities)))?;
        let ws = match link.ws {
            Some(ws) => ws,
            None => session.default_analysis_ws()?,
        };
        let mapping = link.mapping.unwrap_or(MappingType::Collection);
        session.put_text(ty, self.name, ws, &link.type_name)?;
        session.put_scalar(ty, self.mapping_field, ScalarValue::Integer(mapping.code()))?;
        session.diag.data_quality(
            "new-relation-type",
            format!("lexical relation type `{}` was not defined; created {ty}", link.type_name),
        );
        self.by_name.insert(key, ty);
        self.mapping.insert(ty, mapping);
        Ok((ty, link.reverse))
    }
}

/// Stored `LexReference` chains of one type.
fn existing_chains(session: &ImportSession<'_>, ty: ObjectId) -> LoadResult<Vec<Chain>> {
    let members = session.schema.require_field("LexRefType", "Members")?;
    let targets = session.schema.require_field("LexReference", "Targets")?;
    Ok(session
        .store
        .owned_objects(ty, members.id)
        .into_iter()
        .map(|reference| {
            let mut rows = session.store.references(reference, targets.id);
            rows.sort_by_key(|r| r.ord);
            let members: Vec<ObjectId> = rows.into_iter().map(|r| r.target).collect();
            Chain {
                existing: Some(reference),
                seeded: members.len(),
                members,
            }
        })
        .collect())
}

fn write_chains(session: &mut ImportSession<'_>, ty: ObjectId, chains: &[Chain]) -> LoadResult<()> {
    let class = session.schema.require_class("LexReference")?;
    let members_field = session.schema.require_field("LexRefType", "Members")?;
    let targets = session.schema.require_field("LexReference", "Targets")?;

    for chain in chains.iter().filter(|c| c.is_dirty()) {
        let (reference, start, offset) = match chain.existing {
            None => {
                session.report.lexical_relations += 1;
                let reference = session.create_now(class, Some((ty, members_field)))?;
                (reference, 0, 0)
            }
            // Update mode clears the field before the first write, so the
            // whole chain is rewritten.
            Some(reference) if session.update_mode && session.is_preexisting(reference) => {
                (reference, 0, 0)
            }
            // Appended members go after the highest stored ord.
            Some(reference) => {
                let max = session
                    .store
                    .references(reference, targets.id)
                    .iter()
                    .filter_map(|r| r.ord)
                    .max()
                    .unwrap_or(0);
                (reference, chain.seeded, max)
            }
        };
        for (position, member) in chain.members.iter().enumerate().skip(start) {
            let ord = offset + (position - start) as u32 + 1;
            session.put_reference(targets, reference, *member, Some(ord))?;
        }
    }
    Ok(())
}

/// Resolve collected relation links and write the resulting chains.
pub(crate) fn resolve_relations(
    session: &mut ImportSession<'_>,
    lexicon: &mut Lexicon,
    links: Vec<RelationLink>,
) -> LoadResult<()> {
    if links.is_empty() {
        return Ok(());
    }
    let mut types = TypeIndex::load(session)?;

    let mut groups: BTreeMap<ObjectId, Vec<Member>> = BTreeMap::new();
    for link in &links {
        let (ty, reverse) = types.resolve(session, link)?;
        let target = lexicon.target(session, &link.locator, link.wants_sense, link.ws)?;
        session.report.deferred_links += 1;
        if target == link.owner {
            session.diag.data_quality(
                "self-relation",
                format!(
                    "`{}` relation of {} points at itself; skipped",
                    link.type_name, link.owner
                ),
            );
            continue;
        }
        groups.entry(ty).or_default().push(Member {
            owner: link.owner,
            target,
            reverse,
            ord: link.ord,
        });
    }

    for (ty, members) in groups {
        let mapping = types
            .mapping
            .get(&ty)
            .copied()
            .unwrap_or(MappingType::Collection);
        let mut chains = existing_chains(session, ty)?;
        for conflict in assemble(mapping, &mut chains, &members) {
            session.diag.unresolved("relation-conflict", conflict);
        }
        write_chains(session, ty, &chains)?;
    }
    tracing::info!(
        links = links.len(),
        relations = session.report.lexical_relations,
        "assembled lexical relations"
    );
    Ok(())
}
