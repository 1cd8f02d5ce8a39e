//! Running/peak counters for the allocator.
//!
//! Observational only: nothing here feeds back into allocation decisions.
//! Recording is compiled in with the `stats` feature; the snapshot types are
//! always available so hosts can deserialize telemetry without the feature.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCounters {
    /// Every call, including no-op calls (null pointer, zero size).
    pub calls: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl OpCounters {
    pub fn noops(&self) -> u64 {
        self.calls - self.succeeded - self.failed
    }
}

/// How successful `reallocate` calls were satisfied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReallocOutcomes {
    pub unchanged: u64,
    pub shrunk_in_place: u64,
    pub grown_in_place: u64,
    pub moved: u64,
}

/// Point-in-time view of the pool.
///
/// `used_*` figures are running totals; `free_*` figures come from walking the
/// pool when the snapshot is taken. For any pool,
/// `used_payload_bytes + used_overhead_bytes + free_payload_bytes + free_overhead_bytes`
/// equals the initial usable payload plus one block header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub active_allocations: usize,
    pub peak_active_allocations: usize,
    pub used_payload_bytes: usize,
    pub peak_used_payload_bytes: usize,
    pub used_overhead_bytes: usize,
    pub free_payload_bytes: usize,
    pub free_overhead_bytes: usize,
    pub free_blocks: usize,
    pub largest_free_block: usize,
    pub allocate: OpCounters,
    pub free: OpCounters,
    pub reallocate: OpCounters,
    pub realloc_outcomes: ReallocOutcomes,
}

/// How a single successful `reallocate` was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReallocOutcome {
    Unchanged,
    ShrunkInPlace,
    GrownInPlace,
    Moved,
}

/// Counters owned by an allocator. Single-owner, so plain integers suffice.
#[cfg(feature = "stats")]
#[derive(Debug, Clone, Default)]
pub(crate) struct StatsRecorder {
    active: usize,
    peak_active: usize,
    used_payload: usize,
    peak_used_payload: usize,
    allocate: OpCounters,
    free: OpCounters,
    reallocate: OpCounters,
    outcomes: ReallocOutcomes,
}

#[cfg(feature = "stats")]
impl StatsRecorder {
    pub(crate) fn record_allocate(&mut self, payload: Option<usize>) {
        self.allocate.calls += 1;
        if let Some(payload) = payload {
            self.allocate.succeeded += 1;
            self.active += 1;
            self.record_used(self.used_payload + payload);
        }
    }

    pub(crate) fn record_allocate_failed(&mut self) {
        self.allocate.calls += 1;
        self.allocate.failed += 1;
    }

    pub(crate) fn record_free(&mut self, payload: Option<usize>) {
        self.free.calls += 1;
        if let Some(payload) = payload {
            self.free.succeeded += 1;
            self.active -= 1;
            self.record_used(self.used_payload - payload);
        }
    }

    pub(crate) fn record_free_failed(&mut self) {
        self.free.calls += 1;
        self.free.failed += 1;
    }

    pub(crate) fn record_reallocate(
        &mut self,
        outcome: ReallocOutcome,
        old_payload: usize,
        new_payload: usize,
    ) {
        self.reallocate.calls += 1;
        self.reallocate.succeeded += 1;
        match outcome {
            ReallocOutcome::Unchanged => self.outcomes.unchanged += 1,
            ReallocOutcome::ShrunkInPlace => self.outcomes.shrunk_in_place += 1,
            ReallocOutcome::GrownInPlace => self.outcomes.grown_in_place += 1,
            ReallocOutcome::Moved => self.outcomes.moved += 1,
        }
        self.record_used(self.used_payload - old_payload + new_payload);
    }

    pub(crate) fn record_reallocate_failed(&mut self) {
        self.reallocate.calls += 1;
        self.reallocate.failed += 1;
    }

    /// Record a new "used payload bytes" value; updates peaks if higher.
    fn record_used(&mut self, used_payload: usize) {
        self.used_payload = used_payload;
        self.peak_used_payload = self.peak_used_payload.max(used_payload);
        self.peak_active = self.peak_active.max(self.active);
        #[cfg(feature = "tracing")]
        tracing::trace!(
            used_payload,
            peak = self.peak_used_payload,
            active = self.active,
            "pool usage"
        );
    }

    /// Running figures only; the allocator fills in the free side.
    pub(crate) fn snapshot(&self) -> AllocatorStats {
        AllocatorStats {
            active_allocations: self.active,
            peak_active_allocations: self.peak_active,
            used_payload_bytes: self.used_payload,
            peak_used_payload_bytes: self.peak_used_payload,
            allocate: self.allocate,
            free: self.free,
            reallocate: self.reallocate,
            realloc_outcomes: self.outcomes,
            ..AllocatorStats::default()
        }
    }
}
