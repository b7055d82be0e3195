//! Mutable state of one document run.
//!
//! Passed by `&mut` into each stage instead of living on the extractor, so a
//! stage can be exercised in isolation with a fresh [`RunState`].

use std::collections::HashSet;

/// Slice-level tallies, summed over the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceCounters {
    pub accepted: usize,
    pub duplicates: usize,
    pub too_short: usize,
    pub repetitive: usize,
    pub failed: usize,
    pub structured_failures: usize,
}

#[derive(Debug, Default)]
pub struct RunState {
    /// Fingerprints of every slice accepted so far in this run.
    pub seen_fingerprints: HashSet<String>,
    /// Failed or repetitive windows in a row within the current sub-document.
    pub consecutive_failures: u32,
    pub counters: SliceCounters,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fingerprint. Returns `false` when it was already seen.
    pub fn remember(&mut self, fingerprint: &str) -> bool {
        self.seen_fingerprints.insert(fingerprint.to_string())
    }

    /// Reset per-sub-document state.
    pub fn begin_sub_document(&mut self) {
        self.consecutive_failures = 0;
    }
}
