//! Implicit reference resolution.
//!
//! A `<Link>` without a `target` attribute names its target indirectly: a
//! writing system plus a name or abbreviation, a literal form, a headword
//! locator or a file path. The attribute sets overlap, so the rules are
//! tried in a fixed priority order and the first one that applies wins.
//! Targets that do not exist yet are created on the spot.
//!
//! | rule | attributes                          | target                        |
//! |------|-------------------------------------|-------------------------------|
//! | 1    | ws name nameOwner/abbrOwner         | inflectional affix slot       |
//! | 2    | ws entry/sense                      | entry or sense (deferred)     |
//! | 3    | ws form, reversal-entry field       | reversal index entry          |
//! | 4    | ws name/abbr nameOwner/abbrOwner    | inflection class              |
//! | 5    | ws name/abbr                        | possibility list item         |
//! | 6    | ws                                  | writing system                |
//! | 7    | entry/sense in a virtual field      | lexical relation (deferred)   |
//! | 8    | form                                | phonological environment      |
//! | 9    | path                                | external file                 |

pub mod crossref;
pub mod environment;
pub mod lexrel;
pub mod lists;
pub mod media;
pub mod reversal;
pub mod writing_system;

use crate::error::LoadResult;
use crate::progress::Phase;
use crate::schema::FieldInfo;
use crate::session::ImportSession;
use crate::tokens::Attributes;
use cmload_schema::{ClassId, MetadataService, ObjectId};
use std::time::Instant;
use unicode_normalization::UnicodeNormalization;

/// Outcome of resolving one `<Link>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTarget {
    Resolved(ObjectId),
    /// Index into the deferred cross-reference list.
    Deferred(usize),
    Unresolved,
}

/// The reference field a `<Link>` sits in.
#[derive(Debug, Clone, Copy)]
pub struct LinkSite {
    pub owner: ObjectId,
    pub owner_class: ClassId,
    pub field: FieldInfo,
}

#[derive(Debug, Default)]
pub struct ImplicitState {
    pub(crate) lists: lists::ListCache,
    pub(crate) reversal: reversal::ReversalCache,
    pub(crate) environments: environment::EnvironmentCache,
    pub(crate) folders: media::FolderCache,
    pub(crate) deferred: Vec<crossref::DeferredLink>,
    pub(crate) relations: Vec<lexrel::RelationLink>,
    pub(crate) duplicates: Vec<writing_system::DuplicateIndex>,
}

/// What the target class of a reference field says about the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFamily {
    AffixSlot,
    ReversalEntry,
    InflectionClass,
    Other,
}

impl TargetFamily {
    fn of(session: &ImportSession<'_>, field: FieldInfo) -> Self {
        let Some(target) = field.target_class else {
            return TargetFamily::Other;
        };
        if session.schema.is_a(target, "MoInflAffixSlot") {
            TargetFamily::AffixSlot
        } else if session.schema.is_a(target, "ReversalIndexEntry") {
            TargetFamily::ReversalEntry
        } else if session.schema.is_a(target, "MoInflClass") {
            TargetFamily::InflectionClass
        } else {
            TargetFamily::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRule {
    AffixSlot,
    CrossReference,
    ReversalEntry,
    InflectionClass,
    Possibility,
    WritingSystem,
    Environment,
    ExternalFile,
    Unresolvable,
}

/// Pick the rule for a `<Link>` without `target`.
pub fn classify_link(attrs: &Attributes, family: TargetFamily) -> LinkRule {
    let has = |key: &str| attrs.non_empty(key).is_some();
    let ws = has("ws");
    let named = has("name") || has("abbr");
    let owner_named = has("nameOwner") || has("abbrOwner");

    if ws && has("name") && owner_named && family == TargetFamily::AffixSlot {
        LinkRule::AffixSlot
    } else if ws && (has("entry") || has("sense")) {
        LinkRule::CrossReference
    } else if ws && has("form") && family == TargetFamily::ReversalEntry {
        LinkRule::ReversalEntry
    } else if ws && named && owner_named && family == TargetFamily::InflectionClass {
        LinkRule::InflectionClass
    } else if ws && named {
        LinkRule::Possibility
    } else if ws && !has("form") && !has("path") {
        LinkRule::WritingSystem
    } else if has("form") {
        LinkRule::Environment
    } else if has("path") {
        LinkRule::ExternalFile
    } else {
        LinkRule::Unresolvable
    }
}

pub fn resolve_link(
    session: &mut ImportSession<'_>,
    site: LinkSite,
    attrs: &Attributes,
) -> LoadResult<LinkTarget> {
    let rule = classify_link(attrs, TargetFamily::of(session, site.field));
    tracing::trace!(?rule, owner = %site.owner, "implicit link");
    match rule {
        LinkRule::AffixSlot => lists::resolve_affix_slot(session, attrs),
        LinkRule::CrossReference => crossref::defer(session, site, attrs),
        LinkRule::ReversalEntry => reversal::resolve_entry(session, attrs),
        LinkRule::InflectionClass => lists::resolve_inflection_class(session, attrs),
        LinkRule::Possibility => lists::resolve_possibility(session, site, attrs),
        LinkRule::WritingSystem => writing_system::resolve_reference(session, site, attrs),
        LinkRule::Environment => environment::resolve(session, attrs),
        LinkRule::ExternalFile => media::resolve(session, site, attrs),
        LinkRule::Unresolvable => {
            let described: Vec<String> = attrs
                .iter()
                .map(|(k, v)| format!("{k}=\"{v}\""))
                .collect();
            session.diag.unresolved(
                "unresolvable-link",
                format!(
                    "<Link {}> in {} of {}: no target can be inferred",
                    described.join(" "),
                    session.schema.field_name(site.field.id),
                    site.owner
                ),
            );
            Ok(LinkTarget::Unresolved)
        }
    }
}

/// End of pass 2: resolve deferred cross references and lexical relations,
/// then fold duplicate reversal indexes into their originals.
pub fn finish_pass(session: &mut ImportSession<'_>) -> LoadResult<()> {
    session.flush_fields()?;
    let deferred = std::mem::take(&mut session.implicit.deferred);
    let relations = std::mem::take(&mut session.implicit.relations);

    if !deferred.is_empty() || !relations.is_empty() {
        let started = Instant::now();
        session.progress.tick(Phase::CrossReferences, 0);
        let mut lexicon = crossref::Lexicon::build(session)?;
        crossref::resolve_deferred(session, &mut lexicon, deferred)?;
        lexrel::resolve_relations(session, &mut lexicon, relations)?;
        session.flush_fields()?;
        session.progress.tick(Phase::CrossReferences, 100);
        session
            .report
            .record_phase(Phase::CrossReferences, started.elapsed());
    }

    writing_system::merge_duplicates(session)
}

/// Canonical decomposition, the form every stored string is kept in.
pub(crate) fn nfd(text: &str) -> String {
    text.nfd().collect()
}

/// Case-insensitive lookup key.
pub(crate) fn fold(text: &str) -> String {
    nfd(text.trim()).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        Attributes::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn overlapping_attribute_sets_follow_priority() {
        let slot = attrs(&[("ws", "en"), ("name", "ASP"), ("nameOwner", "Verb")]);
        assert_eq!(
            classify_link(&slot, TargetFamily::AffixSlot),
            LinkRule::AffixSlot
        );
        assert_eq!(
            classify_link(&slot, TargetFamily::InflectionClass),
            LinkRule::InflectionClass
        );
        assert_eq!(
            classify_link(&slot, TargetFamily::Other),
            LinkRule::Possibility
        );

        let sense = attrs(&[("ws", "en"), ("sense", "run 2"), ("name", "x")]);
        assert_eq!(
            classify_link(&sense, TargetFamily::Other),
            LinkRule::CrossReference
        );
    }

    #[test]
    fn forms_depend_on_writing_system_and_field() {
        let reversal = attrs(&[("ws", "en"), ("form", "dog|puppy")]);
        assert_eq!(
            classify_link(&reversal, TargetFamily::ReversalEntry),
            LinkRule::ReversalEntry
        );
        assert_eq!(
            classify_link(&reversal, TargetFamily::Other),
            LinkRule::Environment
        );
        let env = attrs(&[("form", "/ _ #")]);
        assert_eq!(classify_link(&env, TargetFamily::Other), LinkRule::Environment);
    }

    #[test]
    fn bare_writing_system_and_paths() {
        assert_eq!(
            classify_link(&attrs(&[("ws", "de")]), TargetFamily::Other),
            LinkRule::WritingSystem
        );
        assert_eq!(
            classify_link(&attrs(&[("path", "pics/a.png")]), TargetFamily::Other),
            LinkRule::ExternalFile
        );
        assert_eq!(
            classify_link(&attrs(&[("name", "Noun")]), TargetFamily::Other),
            LinkRule::Unresolvable
        );
        assert_eq!(
            classify_link(&attrs(&[("ws", "")]), TargetFamily::Other),
            LinkRule::Unresolvable
        );
    }

    #[test]
    fn fold_ignores_case_and_composition() {
        assert_eq!(fold(" Caf\u{e9} "), fold("CAFE\u{301}"));
    }
}
