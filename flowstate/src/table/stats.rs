//! Flow table statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic flow table counters
#[derive(Debug, Default)]
pub struct TableStats {
    lookups: AtomicU64,
    hits: AtomicU64,
    installs: AtomicU64,
    rejected_capacity: AtomicU64,
    rejected_limit: AtomicU64,
    /// Records removed because their deadline passed
    expired: AtomicU64,
    /// Records removed by owner or set deletion
    cascaded: AtomicU64,
    parents_reclaimed: AtomicU64,
    resizes: AtomicU64,
    resize_failures: AtomicU64,
    /// Keepalive segments handed to the sink
    probes_requested: AtomicU64,
    /// Resets handed to the sink on cascading deletion
    resets_requested: AtomicU64,
}

impl TableStats {
    /// Create zeroed statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_lookup(&self, hit: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_install(&self) {
        self.installs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_capacity(&self) {
        self.rejected_capacity.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_limit(&self) {
        self.rejected_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self, n: usize) {
        self.expired.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_cascaded(&self, n: usize) {
        self.cascaded.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_parents_reclaimed(&self, n: usize) {
        self.parents_reclaimed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_resize(&self) {
        self.resizes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resize_failure(&self) {
        self.resize_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_probes(&self, n: usize) {
        self.probes_requested.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_resets(&self, n: usize) {
        self.resets_requested.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Total lookups
    #[must_use]
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Lookups that matched a record
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Records created by install
    #[must_use]
    pub fn installs(&self) -> u64 {
        self.installs.load(Ordering::Relaxed)
    }

    /// Installs refused because the table was full
    #[must_use]
    pub fn rejected_capacity(&self) -> u64 {
        self.rejected_capacity.load(Ordering::Relaxed)
    }

    /// Installs refused by admission control
    #[must_use]
    pub fn rejected_limit(&self) -> u64 {
        self.rejected_limit.load(Ordering::Relaxed)
    }

    /// Records removed by expiry
    #[must_use]
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Records removed by cascading deletion
    #[must_use]
    pub fn cascaded(&self) -> u64 {
        self.cascaded.load(Ordering::Relaxed)
    }

    /// Limit parents reclaimed
    #[must_use]
    pub fn parents_reclaimed(&self) -> u64 {
        self.parents_reclaimed.load(Ordering::Relaxed)
    }

    /// Completed resizes
    #[must_use]
    pub fn resizes(&self) -> u64 {
        self.resizes.load(Ordering::Relaxed)
    }

    /// Resizes that could not allocate
    #[must_use]
    pub fn resize_failures(&self) -> u64 {
        self.resize_failures.load(Ordering::Relaxed)
    }

    /// Total keepalive segments requested
    #[must_use]
    pub fn probes_requested(&self) -> u64 {
        self.probes_requested.load(Ordering::Relaxed)
    }

    /// Total cascade resets requested
    #[must_use]
    pub fn resets_requested(&self) -> u64 {
        self.resets_requested.load(Ordering::Relaxed)
    }

    /// Snapshot of the counters plus current table occupancy
    #[must_use]
    pub fn snapshot(&self, records: usize, buckets: usize) -> TableStatsSnapshot {
        TableStatsSnapshot {
            lookups: self.lookups(),
            hits: self.hits(),
            installs: self.installs(),
            rejected_capacity: self.rejected_capacity(),
            rejected_limit: self.rejected_limit(),
            expired: self.expired(),
            cascaded: self.cascaded(),
            parents_reclaimed: self.parents_reclaimed(),
            resizes: self.resizes(),
            resize_failures: self.resize_failures(),
            probes_requested: self.probes_requested(),
            resets_requested: self.resets_requested(),
            records,
            buckets,
        }
    }
}

/// Point-in-time copy of [`TableStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatsSnapshot {
    pub lookups: u64,
    pub hits: u64,
    pub installs: u64,
    pub rejected_capacity: u64,
    pub rejected_limit: u64,
    pub expired: u64,
    pub cascaded: u64,
    pub parents_reclaimed: u64,
    pub resizes: u64,
    pub resize_failures: u64,
    pub probes_requested: u64,
    pub resets_requested: u64,
    /// Records currently held, parents included
    pub records: usize,
    /// Current bucket count
    pub buckets: usize,
}

impl TableStatsSnapshot {
    /// Fraction of lookups that found a record
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}
