//! Per-operation summary returned by every [`Loader`](crate::Loader) entry point.

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::progress::Phase;
use crate::reconcile::ReconcileSummary;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub operation: String,
    pub document: String,
    pub phases: Vec<(Phase, Duration)>,
    pub elements: usize,
    pub objects_created: usize,
    pub objects_merged: usize,
    pub objects_stranded: usize,
    pub creation_waves: usize,
    pub scalar_writes: usize,
    pub multilingual_writes: usize,
    pub reference_writes: usize,
    pub custom_fields: usize,
    pub implicit_objects: usize,
    pub deferred_links: usize,
    pub lexical_relations: usize,
    pub stand_ins: usize,
    pub reconcile: Option<ReconcileSummary>,
    pub diagnostics: BTreeMap<DiagnosticKind, usize>,
    /// Diagnostics per message key, e.g. `closed-list`.
    pub diagnostic_keys: BTreeMap<String, usize>,
    pub suppressed_messages: usize,
}

impl LoadReport {
    pub fn new(operation: &str, document: &str) -> Self {
        Self {
            operation: operation.to_string(),
            document: document.to_string(),
            ..Self::default()
        }
    }

    pub fn record_phase(&mut self, phase: Phase, elapsed: Duration) {
        tracing::info!(%phase, elapsed_ms = elapsed.as_millis() as u64, "phase finished");
        self.phases.push((phase, elapsed));
    }

    pub fn absorb_diagnostics(&mut self, diag: &Diagnostics) {
        self.diagnostics = diag.counts().clone();
        self.diagnostic_keys = diag.key_counts();
        self.suppressed_messages = diag.suppressed().iter().map(|(_, n)| n).sum();
    }

    pub fn diagnostic_count(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics.get(&kind).copied().unwrap_or(0)
    }

    pub fn key_count(&self, key: &str) -> usize {
        self.diagnostic_keys.get(key).copied().unwrap_or(0)
    }

    pub fn total_duration(&self) -> Duration {
        self.phases.iter().map(|(_, d)| *d).sum()
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} of {}", self.operation, self.document)?;
        for (phase, elapsed) in &self.phases {
            writeln!(f, "  {phase:<17} {:>8.3}s", elapsed.as_secs_f64())?;
        }
        writeln!(f, "  elements parsed:     {}", self.elements)?;
        writeln!(
            f,
            "  objects created:     {} in {} waves ({} merged, {} stranded)",
            self.objects_created, self.creation_waves, self.objects_merged, self.objects_stranded
        )?;
        writeln!(
            f,
            "  field writes:        {} scalar, {} multilingual, {} reference",
            self.scalar_writes, self.multilingual_writes, self.reference_writes
        )?;
        writeln!(f, "  custom fields:       {}", self.custom_fields)?;
        writeln!(
            f,
            "  implicit objects:    {} ({} stand-in entries)",
            self.implicit_objects, self.stand_ins
        )?;
        writeln!(
            f,
            "  deferred links:      {} ({} lexical relations)",
            self.deferred_links, self.lexical_relations
        )?;
        if let Some(rec) = &self.reconcile {
            writeln!(f, "  reconcile:           {rec}")?;
        }
        if self.diagnostics.is_empty() {
            writeln!(f, "  diagnostics:         none")?;
        } else {
            for (kind, count) in &self.diagnostics {
                writeln!(f, "  {kind:<20} {count}")?;
            }
        }
        if self.suppressed_messages > 0 {
            writeln!(f, "  (repeated messages not logged: {})", self.suppressed_messages)?;
        }
        Ok(())
    }
}
