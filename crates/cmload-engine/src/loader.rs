//! The four top-level operations.
//!
//! Each one validates its target, picks an [`ImportPolicy`] and runs the same
//! pipeline: pass 1, replaced-occupant deletion, staged creation, policy
//! post-processing (reconciliation for list updates), pass 2 and the
//! end-of-pass resolution of cross references and duplicates.

use crate::config::LoadConfig;
use crate::error::{LoadError, LoadResult};
use crate::ledger::{Ledger, PendingOwned, PendingRoot};
use crate::pass1::{self, ParsedDocument};
use crate::pass2;
use crate::policy::{
    Disposition, FieldImportPolicy, FullLoadPolicy, ImportPolicy, ListUpdatePolicy,
    MergeFieldsPolicy,
};
use crate::progress::{NoProgress, Phase, ProgressSink};
use crate::report::LoadReport;
use crate::schema::FieldInfo;
use crate::session::ImportSession;
use crate::tokens::XmlSource;
use cmload_schema::{FieldId, MetadataService, ObjectId};
use cmload_store::ObjectStore;
use std::time::Instant;

pub struct Loader<'a> {
    store: &'a mut dyn ObjectStore,
    meta: &'a dyn MetadataService,
    config: LoadConfig,
    progress: Box<dyn ProgressSink + 'a>,
}

impl<'a> Loader<'a> {
    pub fn new(store: &'a mut dyn ObjectStore, meta: &'a dyn MetadataService) -> Self {
        Self {
            store,
            meta,
            config: LoadConfig::default(),
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_config(mut self, config: LoadConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(mut self, sink: impl ProgressSink + 'a) -> Self {
        self.progress = Box::new(sink);
        self
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Two-pass import of a whole database into an empty store.
    pub fn load_full_database(&mut self, source: &XmlSource) -> LoadResult<LoadReport> {
        self.run(&FullLoadPolicy, source)
    }

    /// Import one object (or fill an occupied atomic slot) into `owner.field`.
    pub fn import_object_into_field(
        &mut self,
        source: &XmlSource,
        owner: ObjectId,
        field: FieldId,
    ) -> LoadResult<LoadReport> {
        let field = self.owning_target(owner, field)?;
        self.run(&FieldImportPolicy { owner, field }, source)
    }

    /// Merge-aware import of several fields of `owner`.
    pub fn import_multiple_fields_into_owner(
        &mut self,
        source: &XmlSource,
        owner: ObjectId,
    ) -> LoadResult<LoadReport> {
        let row = self
            .store
            .object(owner)
            .ok_or_else(|| LoadError::InvalidTarget(format!("no object {owner}")))?;
        self.run(
            &MergeFieldsPolicy {
                owner,
                class: row.class,
            },
            source,
        )
    }

    /// Reconcile the tree under `owner.field` with the document.
    pub fn update_list_from_xml(
        &mut self,
        source: &XmlSource,
        owner: ObjectId,
        field: FieldId,
    ) -> LoadResult<LoadReport> {
        let field = self.owning_target(owner, field)?;
        self.run(&ListUpdatePolicy { owner, field }, source)
    }

    fn owning_target(&self, owner: ObjectId, field: FieldId) -> LoadResult<FieldInfo> {
        let row = self
            .store
            .object(owner)
            .ok_or_else(|| LoadError::InvalidTarget(format!("no object {owner}")))?;
        let desc = self
            .meta
            .field(field)
            .ok_or_else(|| LoadError::InvalidTarget(format!("unknown field {field}")))?;
        if !desc.kind.is_owning() {
            return Err(LoadError::InvalidTarget(format!(
                "{} is not an owning field",
                desc.name
            )));
        }
        if !self.meta.is_subclass(row.class, desc.owner_class) {
            return Err(LoadError::FieldNotOnClass {
                field: desc.name.clone(),
                class: self.meta.class_name(row.class),
            });
        }
        Ok(FieldInfo::of(desc))
    }

    fn run(&mut self, policy: &dyn ImportPolicy, source: &XmlSource) -> LoadResult<LoadReport> {
        if policy.requires_empty_store() {
            let existing = self.store.object_count();
            if existing > 0 {
                return Err(LoadError::StoreNotEmpty(existing));
            }
        }
        let document = source.name();
        let mut session = ImportSession::new(
            &mut *self.store,
            self.meta,
            &self.config,
            &mut *self.progress,
            policy.name(),
            &document,
            policy.update_mode(),
        )?;

        let started = Instant::now();
        let doc = pass1::run(&mut session, policy, source)?;
        session.report.elements = doc.elements;
        session.report.record_phase(Phase::Discover, started.elapsed());

        if !policy.accepts_directives() && (!doc.merges.is_empty() || !doc.deletes.is_empty()) {
            session.diag.data_quality(
                "ignored-directive",
                format!(
                    "{} <Merge>/<Delete> directives ignored by a {}",
                    doc.merges.len() + doc.deletes.len(),
                    policy.name()
                ),
            );
        }

        replace_occupants(&mut session, &doc)?;
        session.created.set_threshold(session.identity.next_id());

        let started = Instant::now();
        create_pending(&mut session, &doc)?;
        session.report.record_phase(Phase::Create, started.elapsed());

        let started = Instant::now();
        policy.post_process_after_store(&mut session, &doc)?;
        if session.report.reconcile.is_some() {
            session.report.record_phase(Phase::Reconcile, started.elapsed());
        }

        let started = Instant::now();
        pass2::run(&mut session, policy, &doc, source)?;
        session.report.record_phase(Phase::Fields, started.elapsed());

        session.finish()
    }
}

/// Delete atomic-slot occupants that top-level objects of another class replace.
fn replace_occupants(session: &mut ImportSession<'_>, doc: &ParsedDocument) -> LoadResult<()> {
    let replaced: Vec<ObjectId> = doc.objects.iter().filter_map(|o| o.replaces).collect();
    if replaced.is_empty() {
        return Ok(());
    }
    let removed = session.store.delete_objects(&replaced)?;
    tracing::info!(occupants = replaced.len(), rows = removed, "replaced atomic slot occupants");
    Ok(())
}

fn create_pending(session: &mut ImportSession<'_>, doc: &ParsedDocument) -> LoadResult<()> {
    let mut ledger = Ledger::new();
    for object in doc.objects.iter().filter(|o| o.disposition == Disposition::Create) {
        match object.owner {
            None => ledger.push_root(PendingRoot {
                class: object.class,
                id: object.id,
                guid: object.guid,
            }),
            Some(placement) => {
                let Some(kind) = placement.field.cardinality() else {
                    continue;
                };
                ledger.push_owned(PendingOwned {
                    class: object.class,
                    id: object.id,
                    guid: object.guid,
                    owner: placement.owner,
                    field: placement.field.id,
                    kind,
                    ord: placement.ord,
                });
            }
        }
    }

    session.report.objects_merged = doc.count(Disposition::Merge);
    if ledger.is_empty() {
        return Ok(());
    }
    let pending = ledger.len();
    let outcome = {
        let mut ctx = session.create_ctx();
        ledger.materialize(&mut ctx)?
    };
    session.report.objects_created += outcome.created;
    session.report.creation_waves = outcome.waves;
    session.report.objects_stranded = outcome.stranded;
    tracing::info!(
        pending,
        created = outcome.created,
        waves = outcome.waves,
        stranded = outcome.stranded,
        "staged creation finished"
    );
    Ok(())
}
