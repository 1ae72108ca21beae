//! Coarse progress callbacks.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Phase {
    /// Pass 1: identity and ownership discovery.
    Discover,
    /// Staged creation of pending objects.
    Create,
    /// List reconciliation.
    Reconcile,
    /// Pass 2: field and reference population.
    Fields,
    /// Deferred cross references and lexical relations.
    CrossReferences,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Discover => "discover",
            Phase::Create => "create",
            Phase::Reconcile => "reconcile",
            Phase::Fields => "fields",
            Phase::CrossReferences => "cross-references",
        };
        f.write_str(label)
    }
}

/// Receives a tick after each creation wave and each buffer flush.
pub trait ProgressSink {
    fn tick(&mut self, phase: Phase, percent: u8);
}

impl<T: ProgressSink + ?Sized> ProgressSink for &mut T {
    fn tick(&mut self, phase: Phase, percent: u8) {
        (**self).tick(phase, percent);
    }
}

/// Discards every tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn tick(&mut self, _phase: Phase, _percent: u8) {}
}

/// Keeps every tick; handy for callers that report after the fact.
#[derive(Debug, Clone, Default)]
pub struct RecordedProgress {
    pub ticks: Vec<(Phase, u8)>,
}

impl ProgressSink for RecordedProgress {
    fn tick(&mut self, phase: Phase, percent: u8) {
        self.ticks.push((phase, percent));
    }
}

/// `done / total` as a whole percentage, clamped to 100.
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}
