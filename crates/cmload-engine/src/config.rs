//! Loader configuration.

use crate::error::{LoadError, LoadResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tunables for batching, truncation and implicit-object defaults.
///
/// Every field has a default, so a JSON file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Below this many rows, objects are created one call per row.
    pub singleton_threshold: usize,
    /// Rows per bulk create/owner call.
    pub create_chunk_size: usize,
    /// Buffered field values (per kind) that trigger a flush.
    pub field_flush_threshold: usize,
    /// Text longer than this (in chars) goes through the singleton write path.
    pub bundle_text_limit: usize,
    /// Hard limit for indexed text columns; longer values are truncated.
    pub max_indexable_len: usize,
    /// Ids per cascading delete call.
    pub delete_chunk_size: usize,
    /// Repeats of one diagnostic that are logged before only counting.
    pub max_repeated_messages: usize,
    /// Directory used to resolve relative picture/media paths.
    pub base_import_dir: Option<PathBuf>,
    pub default_analysis_ws: String,
    pub default_vernacular_ws: String,
    /// `Class.Field` names whose values survive list-update cleanup.
    pub preserved_fields: Vec<String>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            singleton_threshold: 5,
            create_chunk_size: 2000,
            field_flush_threshold: 1000,
            bundle_text_limit: 2000,
            max_indexable_len: 4000,
            delete_chunk_size: 500,
            max_repeated_messages: 20,
            base_import_dir: None,
            default_analysis_ws: "en".to_string(),
            default_vernacular_ws: "fr".to_string(),
            preserved_fields: vec![
                "CmPossibility.Description".to_string(),
                "CmMajorObject.Description".to_string(),
            ],
        }
    }
}

impl LoadConfig {
    pub fn from_json(text: &str) -> LoadResult<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| LoadError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> LoadResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> LoadResult<()> {
        let sizes = [
            ("create_chunk_size", self.create_chunk_size),
            ("field_flush_threshold", self.field_flush_threshold),
            ("delete_chunk_size", self.delete_chunk_size),
            ("max_indexable_len", self.max_indexable_len),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(LoadError::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}
