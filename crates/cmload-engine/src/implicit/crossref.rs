//! Deferred entry and sense cross references (rule 2).
//!
//! Locators such as `sense="run 2.1"` name a headword and a sense path. They
//! are collected during pass 2 and resolved at its end against a headword
//! index of the whole lexicon. An unknown headword (or a missing sense)
//! gets a minimal stand-in so every reference points somewhere.

use super::{fold, LinkSite, LinkTarget};
use crate::error::LoadResult;
use crate::schema::FieldInfo;
use crate::session::ImportSession;
use crate::tokens::Attributes;
use ahash::AHashMap;
use cmload_schema::{ClassId, ObjectId, WsId};
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredLink {
    pub source: ObjectId,
    pub field: FieldInfo,
    pub ws: WsId,
    pub locator: String,
    pub wants_sense: bool,
    /// Filled in when the enclosing field closes.
    pub ord: Option<u32>,
}

pub(crate) fn defer(
    session: &mut ImportSession<'_>,
    site: LinkSite,
    attrs: &Attributes,
) -> LoadResult<LinkTarget> {
    let Some(code) = attrs.non_empty("ws") else {
        return Ok(LinkTarget::Unresolved);
    };
    let (locator, wants_sense) = match (attrs.non_empty("sense"), attrs.non_empty("entry")) {
        (Some(sense), _) => (sense, true),
        (None, Some(entry)) => (entry, false),
        (None, None) => return Ok(LinkTarget::Unresolved),
    };
    let ws = session.ws_id(code)?;
    let index = session.implicit.deferred.len();
    session.implicit.deferred.push(DeferredLink {
        source: site.owner,
        field: site.field,
        ws,
        locator: locator.trim().to_string(),
        wants_sense,
        ord: None,
    });
    Ok(LinkTarget::Deferred(index))
}

// ============================================================================
// Locators
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub headword: String,
    /// 1-based sense numbers, outermost first.
    pub senses: Vec<u32>,
}

fn locator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.*\S)\s+(\d+(?:\.\d+)*)$").expect("locator pattern is valid")
    })
}

/// `headword [n[.m...]]`: the trailing number path is split off when present.
pub fn parse_locator(raw: &str) -> Locator {
    let raw = raw.trim();
    match locator_pattern().captures(raw) {
        Some(caps) => Locator {
            headword: caps[1].to_string(),
            senses: caps[2]
                .split('.')
                .filter_map(|n| n.parse().ok())
                .filter(|n| *n > 0)
                .collect(),
        },
        None => Locator {
            headword: raw.to_string(),
            senses: Vec::new(),
        },
    }
}

// ============================================================================
// Headword index
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct LexiconSchema {
    entry_class: ClassId,
    sense_class: ClassId,
    stem_class: ClassId,
    entries: FieldInfo,
    citation_form: FieldInfo,
    lexeme_form: FieldInfo,
    form: FieldInfo,
    morph_type: Option<FieldInfo>,
    prefix: Option<FieldInfo>,
    postfix: Option<FieldInfo>,
    homograph: Option<FieldInfo>,
    entry_senses: FieldInfo,
    sub_senses: FieldInfo,
    entry_residue: FieldInfo,
    sense_residue: FieldInfo,
}

impl LexiconSchema {
    fn load(session: &ImportSession<'_>) -> LoadResult<Self> {
        let schema = &session.schema;
        Ok(Self {
            entry_class: schema.require_class("LexEntry")?,
            sense_class: schema.require_class("LexSense")?,
            stem_class: schema.require_class("MoStemAllomorph")?,
            entries: schema.require_field("LexDb", "Entries")?,
            citation_form: schema.require_field("LexEntry", "CitationForm")?,
            lexeme_form: schema.require_field("LexEntry", "LexemeForm")?,
            form: schema.require_field("MoForm", "Form")?,
            morph_type: schema.field_named("MoForm", "MorphType"),
            prefix: schema.field_named("MoMorphType", "Prefix"),
            postfix: schema.field_named("MoMorphType", "Postfix"),
            homograph: schema.field_named("LexEntry", "HomographNumber"),
            entry_senses: schema.require_field("LexEntry", "Senses")?,
            sub_senses: schema.require_field("LexSense", "Senses")?,
            entry_residue: schema.require_field("LexEntry", "ImportResidue")?,
            sense_residue: schema.require_field("LexSense", "ImportResidue")?,
        })
    }
}

/// Headword keys to entries, built once per resolution pass.
pub struct Lexicon {
    schema: LexiconSchema,
    headwords: AHashMap<String, ObjectId>,
    /// Sense locators already resolved, keyed by folded headword and path.
    senses: AHashMap<(String, Vec<u32>), ObjectId>,
}

impl Lexicon {
    pub(crate) fn build(session: &mut ImportSession<'_>) -> LoadResult<Self> {
        session.flush_fields()?;
        let schema = LexiconSchema::load(session)?;
        let mut headwords = AHashMap::new();
        for entry in session.store.objects_of_class(schema.entry_class) {
            for key in headword_keys(session, &schema, entry) {
                headwords.entry(key).or_insert(entry);
            }
        }
        tracing::debug!(headwords = headwords.len(), "built headword index");
        Ok(Self {
            schema,
            headwords,
            senses: AHashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.headwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headwords.is_empty()
    }

    /// Resolve a locator to an entry or sense, fabricating what is missing.
    pub(crate) fn target(
        &mut self,
        session: &mut ImportSession<'_>,
        locator: &str,
        wants_sense: bool,
        ws: Option<WsId>,
    ) -> LoadResult<ObjectId> {
        let parsed = parse_locator(locator);

        if !wants_sense {
            if let Some(entry) = self.headwords.get(&fold(locator)) {
                return Ok(*entry);
            }
            // `bank 2` names homograph 2 of `bank`.
            if let [homograph] = parsed.senses.as_slice() {
                let key = fold(&format!("{}{homograph}", parsed.headword));
                if let Some(entry) = self.headwords.get(&key) {
                    return Ok(*entry);
                }
            }
            return self.entry(session, &parsed.headword, ws, locator);
        }

        let path = if parsed.senses.is_empty() {
            vec![1]
        } else {
            parsed.senses
        };
        let key = (fold(&parsed.headword), path);
        if let Some(sense) = self.senses.get(&key) {
            return Ok(*sense);
        }
        let entry = self.entry(session, &parsed.headword, ws, locator)?;

        let mut parent = entry;
        let mut field = self.schema.entry_senses;
        for number in &key.1 {
            let children = session.store.owned_objects(parent, field.id);
            parent = match children.get(*number as usize - 1) {
                Some(child) => *child,
                None => self.stand_in_sense(session, parent, field, locator)?,
            };
            field = self.schema.sub_senses;
        }
        self.senses.insert(key, parent);
        Ok(parent)
    }

    fn entry(
        &mut self,
        session: &mut ImportSession<'_>,
        headword: &str,
        ws: Option<WsId>,
        locator: &str,
    ) -> LoadResult<ObjectId> {
        let key = fold(headword);
        if let Some(entry) = self.headwords.get(&key) {
            return Ok(*entry);
        }

        let s = self.schema;
        let lex_db = session.lex_db()?;
        let entry = session.create_now(s.entry_class, Some((lex_db, s.entries)))?;
        let form = session.create_now(s.stem_class, Some((entry, s.lexeme_form)))?;
        let ws = match ws {
            Some(ws) => ws,
            None => session.default_vernacular_ws()?,
        };
        session.put_text(form, s.form, ws, headword)?;
        session.put_string(entry, s.entry_residue, None, &residue_note("entry", locator))?;
        session.report.stand_ins += 1;
        session.diag.data_quality(
            "stand-in-entry",
            format!(
                "no entry `{headword}` for cross reference `{locator}`; created stand-in {entry}"
            ),
        );
        self.headwords.insert(key, entry);
        Ok(entry)
    }

    fn stand_in_sense(
        &mut self,
        session: &mut ImportSession<'_>,
        parent: ObjectId,
        field: FieldInfo,
        locator: &str,
    ) -> LoadResult<ObjectId> {
        let s = self.schema;
        let sense = session.create_now(s.sense_class, Some((parent, field)))?;
        session.put_string(sense, s.sense_residue, None, &residue_note("sense", locator))?;
        session.report.stand_ins += 1;
        session.diag.data_quality(
            "stand-in-sense",
            format!(
                "no sense for cross reference `{locator}` under {parent}; created stand-in {sense}"
            ),
        );
        Ok(sense)
    }
}

fn residue_note(what: &str, locator: &str) -> String {
    format!("This {what} was created automatically to satisfy the cross reference `{locator}`.")
}

/// Index keys of one entry: decorated form, decorated form with homograph
/// number, and the bare form, for every form the entry has.
fn headword_keys(session: &ImportSession<'_>, s: &LexiconSchema, entry: ObjectId) -> Vec<String> {
    let store = &*session.store;
    let lexeme = store.owned_objects(entry, s.lexeme_form.id).first().copied();

    let mut forms: Vec<String> = store
        .multilingual_all(entry, s.citation_form.id)
        .into_iter()
        .map(|(_, t)| t.text)
        .collect();
    if forms.is_empty() {
        if let Some(lexeme) = lexeme {
            forms = store
                .multilingual_all(lexeme, s.form.id)
                .into_iter()
                .map(|(_, t)| t.text)
                .collect();
        }
    }

    let morph_type = lexeme
        .zip(s.morph_type)
        .and_then(|(lexeme, field)| store.references(lexeme, field.id).first().map(|r| r.target));
    let marker = |field: Option<FieldInfo>| {
        morph_type
            .zip(field)
            .and_then(|(mt, f)| store.scalar(mt, f.id))
            .and_then(|v| v.as_text().map(str::to_string))
            .unwrap_or_default()
    };
    let (prefix, postfix) = (marker(s.prefix), marker(s.postfix));
    let homograph = s
        .homograph
        .and_then(|f| store.scalar(entry, f.id))
        .and_then(|v| v.as_integer())
        .filter(|n| *n > 0);

    let mut keys = Vec::new();
    for form in forms.iter().filter(|f| !f.trim().is_empty()) {
        let decorated = format!("{prefix}{form}{postfix}");
        if let Some(n) = homograph {
            keys.push(fold(&format!("{decorated}{n}")));
        }
        keys.push(fold(&decorated));
        keys.push(fold(form));
    }
    keys
}

/// Write every deferred cross reference to its resolved target.
pub(crate) fn resolve_deferred(
    session: &mut ImportSession<'_>,
    lexicon: &mut Lexicon,
    links: Vec<DeferredLink>,
) -> LoadResult<()> {
    let total = links.len();
    for link in links {
        let target = lexicon.target(session, &link.locator, link.wants_sense, Some(link.ws))?;
        session.put_reference(link.field, link.source, target, link.ord)?;
        session.report.deferred_links += 1;
    }
    if total > 0 {
        tracing::info!(total, "resolved deferred cross references");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_numbers_are_sense_paths() {
        assert_eq!(
            parse_locator("Xyzzy 1"),
            Locator {
                headword: "Xyzzy".to_string(),
                senses: vec![1]
            }
        );
        assert_eq!(parse_locator("run up 2.3").senses, vec![2, 3]);
        assert_eq!(parse_locator("run up 2.3").headword, "run up");
    }

    #[test]
    fn plain_headwords_keep_inner_digits() {
        assert_eq!(parse_locator("bank2").headword, "bank2");
        assert!(parse_locator("bank2").senses.is_empty());
        assert_eq!(parse_locator("  take off ").headword, "take off");
        assert!(parse_locator("7").senses.is_empty());
    }
}
