//! Soft-failure collector.
//!
//! Row failures and data-quality warnings never abort an import. They are
//! logged through `tracing` as they happen and counted here; once one message
//! key has been seen `max_repeated_messages` times, further occurrences are
//! only counted and summarised by [`Diagnostics::finish`].

use ahash::AHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DiagnosticKind {
    /// One row of a batched store call failed.
    RowFailure,
    /// Recoverable oddity in the source data.
    DataQuality,
    /// Structural inconsistency that was tolerated (e.g. stranded objects).
    Integrity,
    /// A reference that could not be resolved.
    Unresolved,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DiagnosticKind::RowFailure => "row failure",
            DiagnosticKind::DataQuality => "data quality",
            DiagnosticKind::Integrity => "integrity",
            DiagnosticKind::Unresolved => "unresolved",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub key: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    limit: usize,
    counts: BTreeMap<DiagnosticKind, usize>,
    seen: AHashMap<String, usize>,
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Record one diagnostic. `key` groups repeats of the same message shape.
    pub fn report(&mut self, kind: DiagnosticKind, key: &str, message: impl Into<String>) {
        *self.counts.entry(kind).or_default() += 1;
        let seen = self.seen.entry(key.to_string()).or_default();
        *seen += 1;
        if *seen > self.limit {
            return;
        }

        let message = message.into();
        match kind {
            DiagnosticKind::RowFailure => tracing::error!(%key, "{message}"),
            DiagnosticKind::Integrity => tracing::warn!(%key, "integrity: {message}"),
            DiagnosticKind::DataQuality | DiagnosticKind::Unresolved => {
                tracing::warn!(%key, "{message}")
            }
        }
        self.entries.push(Diagnostic {
            kind,
            key: key.to_string(),
            message,
        });
    }

    pub fn row_failure(&mut self, key: &str, message: impl Into<String>) {
        self.report(DiagnosticKind::RowFailure, key, message);
    }

    pub fn data_quality(&mut self, key: &str, message: impl Into<String>) {
        self.report(DiagnosticKind::DataQuality, key, message);
    }

    pub fn integrity(&mut self, key: &str, message: impl Into<String>) {
        self.report(DiagnosticKind::Integrity, key, message);
    }

    pub fn unresolved(&mut self, key: &str, message: impl Into<String>) {
        self.report(DiagnosticKind::Unresolved, key, message);
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &BTreeMap<DiagnosticKind, usize> {
        &self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Logged diagnostics, in the order they were reported.
    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.seen.contains_key(key)
    }

    /// Occurrences per message key, suppressed repeats included.
    pub fn key_counts(&self) -> BTreeMap<String, usize> {
        self.seen.iter().map(|(k, n)| (k.clone(), *n)).collect()
    }

    /// Message keys that went over the repeat limit, with how many were not logged.
    pub fn suppressed(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = self
            .seen
            .iter()
            .filter(|(_, n)| **n > self.limit)
            .map(|(k, n)| (k.clone(), n - self.limit))
            .collect();
        out.sort();
        out
    }

    /// Log the summary of suppressed repeats.
    pub fn finish(&self) {
        for (key, hidden) in self.suppressed() {
            tracing::warn!(%key, "{hidden} further occurrences were not logged");
        }
    }
}
