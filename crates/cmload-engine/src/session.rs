//! Per-operation import state.
//!
//! One `ImportSession` owns every cache, buffer and counter of a single
//! operation and is passed explicitly to both passes, the implicit-reference
//! resolver and the reconciliation engine.

use crate::buffer::FieldBuffer;
use crate::config::LoadConfig;
use crate::diagnostics::Diagnostics;
use crate::element::{ElementCache, ElementTypeInfo};
use crate::error::{LoadError, LoadResult};
use crate::fmt::plain_text;
use crate::identity::IdentityResolver;
use crate::implicit::writing_system::WritingSystems;
use crate::implicit::ImplicitState;
use crate::ledger::{CreateContext, CreatedObjectSet};
use crate::progress::{Phase, ProgressSink};
use crate::report::LoadReport;
use crate::schema::{FieldInfo, SessionSchema};
use ahash::AHashSet;
use cmload_schema::{Cardinality, ClassId, FieldId, MetadataService, ObjectId, WsId};
use cmload_store::{NewObject, ObjectStore, OwnerAssignment, RowStatus, ScalarValue};
use uuid::Uuid;

pub struct ImportSession<'s> {
    pub(crate) store: &'s mut dyn ObjectStore,
    pub(crate) schema: SessionSchema<'s>,
    pub(crate) config: &'s LoadConfig,
    pub(crate) progress: &'s mut dyn ProgressSink,
    pub(crate) diag: Diagnostics,
    pub(crate) report: LoadReport,
    pub(crate) identity: IdentityResolver,
    pub(crate) elements: ElementCache,
    pub(crate) created: CreatedObjectSet,
    pub(crate) buffer: FieldBuffer,
    pub(crate) implicit: ImplicitState,
    pub(crate) ws: WritingSystems,
    /// Reference fields of pre-existing objects are replaced, not appended to.
    pub(crate) update_mode: bool,
    cleared: AHashSet<(ObjectId, FieldId)>,
}

impl<'s> ImportSession<'s> {
    pub fn new(
        store: &'s mut dyn ObjectStore,
        meta: &'s dyn MetadataService,
        config: &'s LoadConfig,
        progress: &'s mut dyn ProgressSink,
        operation: &str,
        document: &str,
        update_mode: bool,
    ) -> LoadResult<Self> {
        config.validate()?;
        let schema = SessionSchema::new(meta);
        let identity = IdentityResolver::new(store.max_object_id());
        let created = CreatedObjectSet::new(identity.first_new());
        let ws = WritingSystems::load(&*store, &schema);
        tracing::info!(
            operation,
            document,
            existing_objects = store.object_count(),
            writing_systems = ws.len(),
            "starting import session"
        );
        Ok(Self {
            store,
            schema,
            config,
            progress,
            diag: Diagnostics::new(config.max_repeated_messages),
            report: LoadReport::new(operation, document),
            identity,
            elements: ElementCache::new(),
            created,
            buffer: FieldBuffer::new(),
            implicit: ImplicitState::default(),
            ws,
            update_mode,
            cleared: AHashSet::new(),
        })
    }

    pub(crate) fn classify(&mut self, tag: &str) -> ElementTypeInfo {
        self.elements.classify(tag, &self.schema)
    }

    /// The object has a row in the store (pre-existing or created this session).
    pub(crate) fn exists(&self, id: ObjectId) -> bool {
        if self.identity.is_session_object(id) {
            self.created.contains(id)
        } else {
            self.store.contains(id)
        }
    }

    /// The object pre-dates this session.
    pub(crate) fn is_preexisting(&self, id: ObjectId) -> bool {
        !self.identity.is_session_object(id)
    }

    pub(crate) fn create_ctx(&mut self) -> CreateContext<'_> {
        CreateContext {
            store: &mut *self.store,
            created: &mut self.created,
            config: self.config,
            diag: &mut self.diag,
            progress: &mut *self.progress,
        }
    }

    // ------------------------------------------------------------------
    // Implicit objects
    // ------------------------------------------------------------------

    /// Create one object immediately, optionally owned by `(owner, field)`
    /// (appended when the field is a sequence).
    pub(crate) fn create_now(
        &mut self,
        class: ClassId,
        owner: Option<(ObjectId, FieldInfo)>,
    ) -> LoadResult<ObjectId> {
        let id = self.identity.allocate();
        let guid = Uuid::new_v4();
        let status = self.store.create_object(&NewObject { id, class, guid })?;
        if let RowStatus::Failed(reason) = status {
            return Err(LoadError::Rejected {
                what: format!("new {}", self.schema.class_name(class)),
                reason,
            });
        }
        self.created.insert(id);
        self.identity.register_generated(id, guid);

        if let Some((owner, field)) = owner {
            let kind = field.cardinality().unwrap_or(Cardinality::Collection);
            let status = self.store.set_owner(&OwnerAssignment {
                child: id,
                owner,
                field: field.id,
                kind,
                ord: None,
            })?;
            if let RowStatus::Failed(reason) = status {
                return Err(LoadError::Rejected {
                    what: format!(
                        "placing {id} in {} of {owner}",
                        self.schema.field_name(field.id)
                    ),
                    reason,
                });
            }
        }
        self.report.implicit_objects += 1;
        tracing::debug!(%id, class = %self.schema.class_name(class), "created implicit object");
        Ok(id)
    }

    /// First object of exactly `class_name`, if the schema and store have one.
    pub(crate) fn singleton(&self, class_name: &str) -> Option<ObjectId> {
        let class = self.schema.class_id_for_name(class_name)?;
        self.store.objects_of_class(class).first().copied()
    }

    /// The object in `owner.field`, created as `class_name` when the slot is empty.
    pub(crate) fn owned_or_create(
        &mut self,
        owner: ObjectId,
        owner_class: &str,
        field_name: &str,
        class_name: &str,
    ) -> LoadResult<ObjectId> {
        let field = self.schema.require_field(owner_class, field_name)?;
        if let Some(existing) = self.store.owned_objects(owner, field.id).first() {
            return Ok(*existing);
        }
        let class = self.schema.require_class(class_name)?;
        self.create_now(class, Some((owner, field)))
    }

    pub(crate) fn lang_project(&self) -> Option<ObjectId> {
        self.singleton("LangProject")
    }

    /// The lexicon database, created under the project (or as a root) when missing.
    pub(crate) fn lex_db(&mut self) -> LoadResult<ObjectId> {
        if let Some(db) = self.singleton("LexDb") {
            return Ok(db);
        }
        match self.lang_project() {
            Some(project) => self.owned_or_create(project, "LangProject", "LexDb", "LexDb"),
            None => {
                let class = self.schema.require_class("LexDb")?;
                self.create_now(class, None)
            }
        }
    }

    // ------------------------------------------------------------------
    // Writing systems
    // ------------------------------------------------------------------

    /// Writing-system object for a locale code; an unknown code creates one.
    pub(crate) fn ws_id(&mut self, code: &str) -> LoadResult<WsId> {
        if let Some(ws) = self.ws.get(code) {
            return Ok(ws);
        }
        let class = self.schema.require_class("LgWritingSystem")?;
        let locale = self.schema.require_field("LgWritingSystem", "ICULocale")?;
        let owner = match self.lang_project() {
            Some(project) => Some((
                project,
                self.schema.require_field("LangProject", "WritingSystems")?,
            )),
            None => None,
        };
        let id = self.create_now(class, owner)?;
        self.put_scalar(id, locale, ScalarValue::Text(code.to_string()))?;
        self.ws.learn(code, id);
        self.diag.data_quality(
            "new-writing-system",
            format!("writing system `{code}` was not defined; created {id}"),
        );
        Ok(id)
    }

    pub(crate) fn default_analysis_ws(&mut self) -> LoadResult<WsId> {
        let code = self.config.default_analysis_ws.clone();
        self.ws_id(&code)
    }

    pub(crate) fn default_vernacular_ws(&mut self) -> LoadResult<WsId> {
        let code = self.config.default_vernacular_ws.clone();
        self.ws_id(&code)
    }

    // ------------------------------------------------------------------
    // Buffered field writes
    // ------------------------------------------------------------------

    pub(crate) fn put_scalar(
        &mut self,
        object: ObjectId,
        field: FieldInfo,
        value: ScalarValue,
    ) -> LoadResult<()> {
        let indexable = field.basic().is_some_and(|b| b.is_indexable());
        self.buffer.append_scalar(object, field.id, value, indexable);
        self.maybe_flush()
    }

    pub(crate) fn put_multi(
        &mut self,
        object: ObjectId,
        field: FieldInfo,
        ws: WsId,
        text: String,
        fmt: Option<Vec<u8>>,
    ) -> LoadResult<()> {
        let indexable = field.basic().is_some_and(|b| b.is_indexable());
        self.buffer
            .append_multilingual(object, field.id, ws, text, fmt, indexable);
        self.maybe_flush()
    }

    /// Plain text into a multilingual field, formatted or not as the field requires.
    pub(crate) fn put_text(
        &mut self,
        object: ObjectId,
        field: FieldInfo,
        ws: WsId,
        text: &str,
    ) -> LoadResult<()> {
        let fmt = match field.basic() {
            Some(basic) if basic.is_formatted() => Some(plain_text(Some(ws), text)?.1),
            _ => None,
        };
        self.put_multi(object, field, ws, text.to_string(), fmt)
    }

    /// Plain text into a single-string field.
    pub(crate) fn put_string(
        &mut self,
        object: ObjectId,
        field: FieldInfo,
        ws: Option<WsId>,
        text: &str,
    ) -> LoadResult<()> {
        let value = match field.basic() {
            Some(basic) if basic.is_formatted() => {
                let (text, fmt) = plain_text(ws, text)?;
                ScalarValue::Formatted { text, fmt }
            }
            _ => ScalarValue::Text(text.to_string()),
        };
        self.put_scalar(object, field, value)
    }

    /// Buffer one reference. In update mode the field of a pre-existing
    /// source is cleared before its first new value.
    pub(crate) fn put_reference(
        &mut self,
        field: FieldInfo,
        source: ObjectId,
        target: ObjectId,
        ord: Option<u32>,
    ) -> LoadResult<()> {
        let Some(kind) = field.cardinality().filter(|_| field.is_reference()) else {
            self.diag.data_quality(
                "not-a-reference",
                format!(
                    "{} of {source} is not a reference field",
                    self.schema.field_name(field.id)
                ),
            );
            return Ok(());
        };
        let source = self.buffer.redirect_target(source);
        if self.update_mode
            && self.is_preexisting(source)
            && self.cleared.insert((source, field.id))
        {
            self.store.clear_field(source, field.id)?;
        }
        self.buffer
            .append_reference(kind, source, field.id, target, ord);
        self.maybe_flush()
    }

    pub(crate) fn maybe_flush(&mut self) -> LoadResult<()> {
        if self.buffer.needs_flush(self.config.field_flush_threshold) {
            self.flush_fields()?;
        }
        Ok(())
    }

    pub(crate) fn flush_fields(&mut self) -> LoadResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let stats = self
            .buffer
            .flush(&mut *self.store, self.config, &mut self.diag)?;
        self.report.scalar_writes += stats.scalar;
        self.report.multilingual_writes += stats.multilingual;
        self.report.reference_writes += stats.reference;
        self.progress.tick(Phase::Fields, 100);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Stored text of a multilingual field.
    pub(crate) fn text_of(&self, object: ObjectId, field: FieldId, ws: WsId) -> Option<String> {
        self.store.multilingual(object, field, ws).map(|t| t.text)
    }

    /// Stored text of a multilingual field in any writing system, preferring `ws`.
    pub(crate) fn any_text_of(&self, object: ObjectId, field: FieldId, ws: WsId) -> Option<String> {
        self.text_of(object, field, ws).or_else(|| {
            self.store
                .multilingual_all(object, field)
                .into_iter()
                .map(|(_, t)| t.text)
                .next()
        })
    }

    /// Largest ord among the current children of a sequence field.
    pub(crate) fn max_child_ord(&self, owner: ObjectId, field: FieldId) -> u32 {
        self.store
            .owned_objects(owner, field)
            .into_iter()
            .filter_map(|child| self.store.object(child))
            .filter_map(|row| row.owner.and_then(|o| o.ord))
            .max()
            .unwrap_or(0)
    }

    /// Close the session: flush, summarise diagnostics and hand back the report.
    pub fn finish(mut self) -> LoadResult<LoadReport> {
        self.flush_fields()?;
        self.diag.finish();
        self.report.custom_fields = self.schema.custom_count();
        self.report.absorb_diagnostics(&self.diag);
        tracing::info!(
            operation = %self.report.operation,
            created = self.report.objects_created,
            implicit = self.report.implicit_objects,
            diagnostics = self.diag.total(),
            "import session finished"
        );
        Ok(self.report)
    }
}
