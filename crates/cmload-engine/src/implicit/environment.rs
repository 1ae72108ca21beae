//! Rule 8: phonological environments named by their string representation.

use super::{nfd, LinkTarget};
use crate::error::LoadResult;
use crate::session::ImportSession;
use crate::tokens::Attributes;
use ahash::AHashMap;
use cmload_schema::ObjectId;

/// `StringRepresentation` text to environment, loaded from the whole table on
/// first use.
#[derive(Debug, Default)]
pub struct EnvironmentCache {
    by_form: Option<AHashMap<String, ObjectId>>,
}

pub(crate) fn resolve(
    session: &mut ImportSession<'_>,
    attrs: &Attributes,
) -> LoadResult<LinkTarget> {
    let Some(form) = attrs.non_empty("form") else {
        return Ok(LinkTarget::Unresolved);
    };
    let key = nfd(form.trim());
    let representation = session
        .schema
        .require_field("PhEnvironment", "StringRepresentation")?;

    if session.implicit.environments.by_form.is_none() {
        session.flush_fields()?;
        let class = session.schema.require_class("PhEnvironment")?;
        let mut by_form = AHashMap::new();
        for id in session.store.objects_of_class(class) {
            if let Some(text) = session
                .store
                .scalar(id, representation.id)
                .and_then(|v| v.as_text().map(str::to_string))
            {
                by_form.entry(text.trim().to_string()).or_insert(id);
            }
        }
        tracing::debug!(environments = by_form.len(), "indexed phonological environments");
        session.implicit.environments.by_form = Some(by_form);
    }

    if let Some(id) = session
        .implicit
        .environments
        .by_form
        .as_ref()
        .and_then(|m| m.get(&key))
    {
        return Ok(LinkTarget::Resolved(*id));
    }

    let container = match session.lang_project() {
        Some(project) => {
            session.owned_or_create(project, "LangProject", "PhonologicalData", "PhPhonData")?
        }
        None => {
            let class = session.schema.require_class("PhPhonData")?;
            match session.singleton("PhPhonData") {
                Some(existing) => existing,
                None => session.create_now(class, None)?,
            }
        }
    };
    let class = session.schema.require_class("PhEnvironment")?;
    let environments = session.schema.require_field("PhPhonData", "Environments")?;
    let id = session.create_now(class, Some((container, environments)))?;
    let ws = session.default_vernacular_ws()?;
    session.put_string(id, representation, Some(ws), form.trim())?;
    if let Some(by_form) = session.implicit.environments.by_form.as_mut() {
        by_form.insert(key, id);
    }
    tracing::debug!(%id, form, "created phonological environment");
    Ok(LinkTarget::Resolved(id))
}
