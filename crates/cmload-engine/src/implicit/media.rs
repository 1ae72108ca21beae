//! Rule 9: external files named by path.
//!
//! Every `<Link path=".."/>` becomes a new `CmFile` in a shared project folder:
//! "Local Pictures" for picture fields, "Local Media" for everything else.

use super::{LinkSite, LinkTarget};
use crate::error::LoadResult;
use crate::session::ImportSession;
use crate::tokens::Attributes;
use ahash::AHashMap;
use cmload_schema::{MetadataService, ObjectId};
use std::path::{Path, PathBuf};

pub const PICTURE_FOLDER: &str = "Local Pictures";
pub const MEDIA_FOLDER: &str = "Local Media";

#[derive(Debug, Default)]
pub struct FolderCache {
    folders: AHashMap<&'static str, ObjectId>,
}

/// `path` as found on disk: absolute paths are kept, relative ones are taken
/// against `base` when one is configured.
pub fn locate(path: &str, base: Option<&Path>) -> PathBuf {
    let raw = Path::new(path);
    match base {
        Some(base) if raw.is_relative() => base.join(raw),
        _ => raw.to_path_buf(),
    }
}

pub(crate) fn resolve(
    session: &mut ImportSession<'_>,
    site: LinkSite,
    attrs: &Attributes,
) -> LoadResult<LinkTarget> {
    let Some(path) = attrs.non_empty("path") else {
        return Ok(LinkTarget::Unresolved);
    };
    let located = locate(path.trim(), session.config.base_import_dir.as_deref());
    if !located.exists() {
        session.diag.data_quality(
            "missing-file",
            format!(
                "{} of {} refers to `{}`, which does not exist",
                session.schema.field_name(site.field.id),
                site.owner,
                located.display()
            ),
        );
    }

    let (folder_name, project_field) = if session.schema.is_a(site.owner_class, "CmPicture") {
        (PICTURE_FOLDER, "Pictures")
    } else {
        (MEDIA_FOLDER, "Media")
    };
    let folder = folder(session, folder_name, project_field)?;

    let file_class = session.schema.require_class("CmFile")?;
    let files = session.schema.require_field("CmFolder", "Files")?;
    let internal_path = session.schema.require_field("CmFile", "InternalPath")?;
    let file = session.create_now(file_class, Some((folder, files)))?;
    session.put_string(file, internal_path, None, &located.to_string_lossy())?;
    Ok(LinkTarget::Resolved(file))
}

/// Find or create the named folder in `LangProject.<project_field>`.
fn folder(
    session: &mut ImportSession<'_>,
    name: &'static str,
    project_field: &str,
) -> LoadResult<ObjectId> {
    if let Some(folder) = session.implicit.folders.folders.get(name) {
        return Ok(*folder);
    }
    session.flush_fields()?;
    let class = session.schema.require_class("CmFolder")?;
    let name_field = session.schema.require_field("CmFolder", "Name")?;
    let ws = session.default_analysis_ws()?;

    let placement = match session.lang_project() {
        Some(project) => {
            let field = session.schema.require_field("LangProject", project_field)?;
            Some((project, field))
        }
        None => None,
    };
    let candidates = match placement {
        Some((project, field)) => session.store.owned_objects(project, field.id),
        None => session.store.objects_of_class(class),
    };
    let existing = candidates.into_iter().find(|id| {
        session
            .any_text_of(*id, name_field.id, ws)
            .is_some_and(|text| text == name)
    });

    let folder = match existing {
        Some(folder) => folder,
        None => {
            let folder = session.create_now(class, placement)?;
            session.put_text(folder, name_field, ws, name)?;
            tracing::debug!(%folder, name, "created file folder");
            folder
        }
    };
    session.implicit.folders.folders.insert(name, folder);
    Ok(folder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_the_base_directory() {
        let base = Path::new("/data/import");
        assert_eq!(
            locate("pics/cat.jpg", Some(base)),
            PathBuf::from("/data/import/pics/cat.jpg")
        );
        assert_eq!(locate("/abs/cat.jpg", Some(base)), PathBuf::from("/abs/cat.jpg"));
        assert_eq!(locate("cat.jpg", None), PathBuf::from("cat.jpg"));
    }
}
