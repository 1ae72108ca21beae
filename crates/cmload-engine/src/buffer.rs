//! Deferred field buffer.
//!
//! Pass 2 appends field values here; the buffer is flushed whenever one kind
//! reaches `field_flush_threshold` and at the end of the pass. A flush NFD
//! normalises text, truncates over-long indexed text, sends ordinary values
//! as one bulk call and oversized values one row at a time.

use crate::config::LoadConfig;
use crate::diagnostics::Diagnostics;
use crate::error::LoadResult;
use ahash::AHashMap;
use cmload_schema::{Cardinality, FieldId, ObjectId, WsId};
use cmload_store::{
    MultilingualWrite, ObjectStore, ReferenceWrite, RowStatus, ScalarValue, ScalarWrite,
};
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone)]
struct ScalarEntry {
    write: ScalarWrite,
    indexable: bool,
}

#[derive(Debug, Clone)]
struct TextEntry {
    write: MultilingualWrite,
    indexable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub scalar: usize,
    pub multilingual: usize,
    pub reference: usize,
    pub failed: usize,
}

impl FlushStats {
    pub fn total(&self) -> usize {
        self.scalar + self.multilingual + self.reference
    }
}

#[derive(Debug, Default)]
pub struct FieldBuffer {
    scalars: Vec<ScalarEntry>,
    texts: Vec<TextEntry>,
    references: Vec<(Cardinality, ReferenceWrite)>,
    /// Objects whose writes go to another object (duplicate reversal indexes).
    redirects: AHashMap<ObjectId, ObjectId>,
}

impl FieldBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_scalar(
        &mut self,
        object: ObjectId,
        field: FieldId,
        value: ScalarValue,
        indexable: bool,
    ) {
        self.scalars.push(ScalarEntry {
            write: ScalarWrite {
                object,
                field,
                value,
            },
            indexable,
        });
    }

    pub fn append_multilingual(
        &mut self,
        object: ObjectId,
        field: FieldId,
        ws: WsId,
        text: String,
        fmt: Option<Vec<u8>>,
        indexable: bool,
    ) {
        self.texts.push(TextEntry {
            write: MultilingualWrite {
                object,
                field,
                ws,
                text,
                fmt,
            },
            indexable,
        });
    }

    pub fn append_reference(
        &mut self,
        kind: Cardinality,
        source: ObjectId,
        field: FieldId,
        target: ObjectId,
        ord: Option<u32>,
    ) {
        self.references.push((
            kind,
            ReferenceWrite {
                source,
                field,
                target,
                ord,
            },
        ));
    }

    pub fn redirect(&mut self, from: ObjectId, to: ObjectId) {
        self.redirects.insert(from, to);
    }

    pub fn redirect_target(&self, id: ObjectId) -> ObjectId {
        self.redirects.get(&id).copied().unwrap_or(id)
    }

    pub fn len(&self) -> usize {
        self.scalars.len() + self.texts.len() + self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One field kind has reached the flush threshold.
    pub fn needs_flush(&self, threshold: usize) -> bool {
        self.scalars.len() >= threshold
            || self.texts.len() >= threshold
            || self.references.len() >= threshold
    }

    pub fn flush(
        &mut self,
        store: &mut dyn ObjectStore,
        config: &LoadConfig,
        diag: &mut Diagnostics,
    ) -> LoadResult<FlushStats> {
        let mut stats = FlushStats::default();
        if self.is_empty() {
            return Ok(stats);
        }

        let scalars = std::mem::take(&mut self.scalars);
        let texts = std::mem::take(&mut self.texts);
        let references = std::mem::take(&mut self.references);

        // Scalars
        let mut small = Vec::new();
        let mut large = Vec::new();
        for entry in scalars {
            let mut write = entry.write;
            write.object = self.redirect_target(write.object);
            normalize_scalar(&mut write, entry.indexable, config, diag);
            if scalar_weight(&write.value) < config.bundle_text_limit {
                small.push(write);
            } else {
                large.push(write);
            }
        }
        let statuses = store.set_scalar_fields(&small)?;
        stats.scalar += count(&small, statuses, &mut stats.failed, diag, |w| {
            format!("scalar {} of {}", w.field, w.object)
        });
        for write in large {
            let status = store.set_scalar_field(&write)?;
            stats.scalar += count(
                std::slice::from_ref(&write),
                vec![status],
                &mut stats.failed,
                diag,
                |w| format!("scalar {} of {}", w.field, w.object),
            );
        }

        // Multilingual
        let mut small = Vec::new();
        let mut large = Vec::new();
        for entry in texts {
            let mut write = entry.write;
            write.object = self.redirect_target(write.object);
            write.text = write.text.nfd().collect();
            if entry.indexable {
                write.text =
                    truncate_indexable(write.text, write.field, write.object, config, diag);
            }
            let weight = write.text.chars().count() + write.fmt.as_ref().map_or(0, Vec::len);
            if weight < config.bundle_text_limit {
                small.push(write);
            } else {
                large.push(write);
            }
        }
        let statuses = store.set_multilingual_fields(&small)?;
        stats.multilingual += count(&small, statuses, &mut stats.failed, diag, |w| {
            format!("{} of {} (ws {})", w.field, w.object, w.ws)
        });
        for write in large {
            let status = store.set_multilingual_field(&write)?;
            stats.multilingual += count(
                std::slice::from_ref(&write),
                vec![status],
                &mut stats.failed,
                diag,
                |w| format!("{} of {} (ws {})", w.field, w.object, w.ws),
            );
        }

        // References, one bulk call per cardinality.
        for kind in [Cardinality::Atomic, Cardinality::Collection, Cardinality::Sequence] {
            let rows: Vec<ReferenceWrite> = references
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, w)| ReferenceWrite {
                    source: self.redirect_target(w.source),
                    target: self.redirect_target(w.target),
                    ..*w
                })
                .collect();
            if rows.is_empty() {
                continue;
            }
            let statuses = store.insert_references(kind, &rows)?;
            stats.reference += count(&rows, statuses, &mut stats.failed, diag, |w| {
                format!("reference {} of {} to {}", w.field, w.source, w.target)
            });
        }

        tracing::debug!(
            scalar = stats.scalar,
            multilingual = stats.multilingual,
            reference = stats.reference,
            failed = stats.failed,
            "flushed field buffer"
        );
        Ok(stats)
    }
}

fn count<T>(
    rows: &[T],
    statuses: Vec<RowStatus>,
    failed: &mut usize,
    diag: &mut Diagnostics,
    describe: impl Fn(&T) -> String,
) -> usize {
    let mut ok = 0;
    for (row, status) in rows.iter().zip(statuses) {
        match status {
            RowStatus::Ok => ok += 1,
            RowStatus::Failed(reason) => {
                *failed += 1;
                diag.row_failure("field-write-failed", format!("{}: {reason}", describe(row)));
            }
        }
    }
    ok
}

fn scalar_weight(value: &ScalarValue) -> usize {
    match value {
        ScalarValue::Text(text) => text.chars().count(),
        ScalarValue::Formatted { text, fmt } => text.chars().count() + fmt.len(),
        ScalarValue::Binary(bytes) => bytes.len(),
        ScalarValue::Numeric(text) => text.len(),
        _ => 0,
    }
}

fn normalize_scalar(
    write: &mut ScalarWrite,
    indexable: bool,
    config: &LoadConfig,
    diag: &mut Diagnostics,
) {
    match &mut write.value {
        ScalarValue::Text(text) => {
            let normalized: String = text.nfd().collect();
            *text = if indexable {
                truncate_indexable(normalized, write.field, write.object, config, diag)
            } else {
                normalized
            };
        }
        ScalarValue::Formatted { text, .. } => {
            *text = text.nfd().collect();
        }
        _ => {}
    }
}

fn truncate_indexable(
    text: String,
    field: FieldId,
    object: ObjectId,
    config: &LoadConfig,
    diag: &mut Diagnostics,
) -> String {
    let len = text.chars().count();
    if len <= config.max_indexable_len {
        return text;
    }
    diag.data_quality(
        "truncated-text",
        format!(
            "{field} of {object}: {len} characters truncated to {}",
            config.max_indexable_len
        ),
    );
    text.chars().take(config.max_indexable_len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmload_schema::ClassId;
    use cmload_store::{MemoryStore, NewObject};
    use uuid::Uuid;

    fn store_with(n: u32) -> MemoryStore {
        let mut store = MemoryStore::new();
        let rows: Vec<NewObject> = (1..=n)
            .map(|i| NewObject {
                id: ObjectId::new(i),
                class: ClassId::new(1),
                guid: Uuid::new_v4(),
            })
            .collect();
        store.create_objects(&rows).unwrap();
        store
    }

    #[test]
    fn flush_normalizes_and_truncates() {
        let mut store = store_with(2);
        let config = LoadConfig {
            max_indexable_len: 3,
            bundle_text_limit: 2,
            ..LoadConfig::default()
        };
        let mut diag = Diagnostics::new(10);
        let mut buffer = FieldBuffer::new();
        buffer.append_multilingual(
            ObjectId::new(1),
            FieldId::new(10),
            ObjectId::new(2),
            "\u{e9}t\u{e9}".to_string(),
            None,
            true,
        );
        buffer.append_scalar(ObjectId::new(1), FieldId::new(11), ScalarValue::Integer(4), false);
        let stats = buffer.flush(&mut store, &config, &mut diag).unwrap();

        assert_eq!(stats.multilingual, 1);
        assert_eq!(stats.scalar, 1);
        assert!(buffer.is_empty());
        let stored = store
            .multilingual(ObjectId::new(1), FieldId::new(10), ObjectId::new(2))
            .unwrap();
        // NFD of "été" is five chars; the limit keeps three.
        assert_eq!(stored.text, "e\u{301}t");
        assert!(diag.has_key("truncated-text"));
    }

    #[test]
    fn redirects_apply_to_sources_and_targets() {
        let mut store = store_with(3);
        let mut diag = Diagnostics::new(10);
        let mut buffer = FieldBuffer::new();
        buffer.redirect(ObjectId::new(3), ObjectId::new(2));
        buffer.append_reference(
            Cardinality::Collection,
            ObjectId::new(1),
            FieldId::new(20),
            ObjectId::new(3),
            None,
        );
        buffer
            .flush(&mut store, &LoadConfig::default(), &mut diag)
            .unwrap();
        let refs = store.references(ObjectId::new(1), FieldId::new(20));
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].target, ObjectId::new(2));
    }

    #[test]
    fn failed_rows_are_counted_not_fatal() {
        let mut store = store_with(1);
        let mut diag = Diagnostics::new(10);
        let mut buffer = FieldBuffer::new();
        buffer.append_scalar(ObjectId::new(9), FieldId::new(11), ScalarValue::Integer(1), false);
        let stats = buffer
            .flush(&mut store, &LoadConfig::default(), &mut diag)
            .unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.scalar, 0);
    }
}
