//! CmLoad import engine
//!
//! Loads an XML serialisation of a CmObject graph into an [`ObjectStore`]:
//!
//! ```text
//!   XmlSource ──► pass 1 ──► ledger ──► [reconcile] ──► pass 2 ──► cross refs
//!                 (ids,      (staged    (list          (fields,    (headwords,
//!                  owners)    creation)  updates)       links)      relations)
//! ```
//!
//! Pass 1 assigns ids and records ownership without touching the store. The
//! ledger creates objects in owner-first waves. Pass 2 replays the document
//! and writes basic fields and references through a bounded buffer, creating
//! implicitly referenced objects (list items, reversal entries, environments,
//! files) on the way. Cross references to entries and senses are resolved at
//! the end against a headword index.
//!
//! Every operation returns a [`LoadReport`]; fatal problems are a
//! [`LoadError`], everything recoverable is counted in the report.
//!
//! [`ObjectStore`]: cmload_store::ObjectStore

pub mod buffer;
pub mod config;
pub mod diagnostics;
pub mod element;
pub mod error;
pub mod fmt;
pub mod identity;
pub mod implicit;
pub mod ledger;
pub mod loader;
pub mod pass1;
pub mod pass2;
pub mod policy;
pub mod progress;
pub mod reconcile;
pub mod report;
pub mod schema;
pub mod session;
pub mod tokens;

pub use config::LoadConfig;
pub use diagnostics::{DiagnosticKind, Diagnostics};
pub use error::{LoadError, LoadResult};
pub use loader::Loader;
pub use policy::{
    Disposition, FieldImportPolicy, FullLoadPolicy, ImportPolicy, ListUpdatePolicy,
    MergeFieldsPolicy,
};
pub use progress::{NoProgress, Phase, ProgressSink, RecordedProgress};
pub use reconcile::ReconcileSummary;
pub use report::LoadReport;
pub use session::ImportSession;
pub use tokens::XmlSource;
