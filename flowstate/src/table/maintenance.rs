//! Periodic maintenance pass
//!
//! One pass, under the coarse lock:
//! 1. decide whether this is a keepalive pass
//! 2. walk every bucket, unlinking expired and cascaded records and
//!    collecting keepalive probes
//! 3. drop the unlinked children, then reclaim limit groups they emptied
//! 4. grow the bucket array if chains got long
//! 5. free everything else
//!
//! Probes and resets go to the sink after the coarse lock is released.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{reset_segments, FlowTable, MAX_BUCKET_COUNT};
use crate::control::ControlSegment;
use crate::flow::key::bucket_index;
use crate::flow::{Direction, FlowRecord, LimitGroup, RecordKind, RuleId, SetId, TcpPhase};

/// Owner selector of a cascading deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OwnerFilter {
    Rule(RuleId),
    Set(SetId),
}

impl fmt::Display for OwnerFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule(rule) => write!(f, "rule {}", rule.0),
            Self::Set(set) => write!(f, "set {}", set.0),
        }
    }
}

/// A cascade that may still have stragglers in the table.
///
/// Records installed before the cascade started carry an epoch no greater
/// than `epoch`; anything newer belongs to a later incarnation of the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingCascade {
    pub(crate) filter: OwnerFilter,
    pub(crate) epoch: u64,
}

impl PendingCascade {
    pub(crate) fn applies_to(&self, record: &FlowRecord) -> bool {
        if record.epoch() > self.epoch {
            return false;
        }
        let owner = record.owner();
        match self.filter {
            OwnerFilter::Rule(rule) => owner.rule == rule,
            OwnerFilter::Set(set) => owner.set == set,
        }
    }
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Records removed because their deadline passed
    pub expired: usize,
    /// Stragglers removed by pending cascades
    pub cascaded: usize,
    /// Limit groups reclaimed
    pub parents_reclaimed: usize,
    /// Keepalive segments handed to the sink
    pub probes: usize,
    /// Resets handed to the sink for cascaded flows
    pub resets: usize,
    /// New bucket count, if the pass grew the table
    pub resized_to: Option<usize>,
    pub keepalive_pass: bool,
    /// The pass stopped before visiting every bucket
    pub cancelled: bool,
}

impl TickReport {
    /// Whether the pass changed anything
    pub fn is_idle(&self) -> bool {
        self.expired == 0
            && self.cascaded == 0
            && self.parents_reclaimed == 0
            && self.probes == 0
            && self.resets == 0
            && self.resized_to.is_none()
    }
}

impl FlowTable {
    /// Run one full maintenance pass
    pub fn run_maintenance(&self) -> TickReport {
        self.run_maintenance_until(&AtomicBool::new(false))
    }

    /// Run one maintenance pass, stopping between buckets once `cancel` is set.
    ///
    /// Records already unlinked when the pass stops are still freed and
    /// their limit groups updated; the resize step is skipped.
    pub fn run_maintenance_until(&self, cancel: &AtomicBool) -> TickReport {
        let structure = self.structure.write();
        let now = self.clock.now();
        let tunables = self.tunables.load_full();
        let config = &tunables.config;
        let keepalive_pass =
            config.keepalive && self.keepalive_due(now, Duration::from_secs(config.keepalive_period_secs));
        let keepalive_interval = Duration::from_secs(config.keepalive_interval_secs);
        let cascades = self.pending.lock().clone();

        let mut report = TickReport {
            keepalive_pass,
            ..TickReport::default()
        };
        let mut children = Vec::new();
        let mut deferred = Vec::new();
        let mut probes = Vec::new();
        let mut resets = Vec::new();

        let array = self.array.load_full();
        for bucket in array.iter() {
            if cancel.load(Ordering::Acquire) {
                report.cancelled = true;
                break;
            }

            let mut guard = bucket.lock();
            let records = std::mem::take(&mut guard.records);
            let mut kept = Vec::with_capacity(records.len());
            for record in records {
                if record.is_parent() {
                    if record.group().map_or(true, |group| group.is_unused()) {
                        report.parents_reclaimed += 1;
                        deferred.push(record);
                    } else {
                        kept.push(record);
                    }
                    continue;
                }

                let cascaded = cascades.iter().any(|c| c.applies_to(&record));
                if cascaded || record.is_expired(now) {
                    if cascaded {
                        report.cascaded += 1;
                        if config.reset_on_cascade {
                            resets.extend(reset_segments(&record));
                        }
                    } else {
                        report.expired += 1;
                    }
                    if record.kind() == RecordKind::LimitChild {
                        children.push(record);
                    } else {
                        deferred.push(record);
                    }
                    continue;
                }

                if keepalive_pass && needs_keepalive(&record, now, keepalive_interval) {
                    probes.extend(ControlSegment::keepalive_pair(*record.key(), record.tcp()));
                }
                kept.push(record);
            }
            guard.records = kept;
        }

        // Children hand their slots back as they drop
        let mut emptied: Vec<Arc<LimitGroup>> = Vec::new();
        for child in children.drain(..) {
            let group = child.group().cloned();
            self.release_slots(1);
            drop(child);
            if let Some(group) = group {
                if group.is_unused() && !emptied.iter().any(|g| Arc::ptr_eq(g, &group)) {
                    emptied.push(group);
                }
            }
        }
        report.parents_reclaimed += self.reclaim_groups(&emptied, &mut deferred);
        self.release_slots(deferred.len());

        if !report.cancelled {
            report.resized_to = self.grow_if_crowded(config.max_buckets);
        }

        drop(deferred);
        drop(structure);

        if !report.cancelled {
            self.pending.lock().retain(|c| !cascades.contains(c));
        }

        report.probes = probes.len();
        report.resets = resets.len();
        self.stats.record_probes(report.probes);
        self.stats.record_resets(report.resets);
        self.dispatch(probes);
        self.dispatch(resets);

        self.stats.record_expired(report.expired);
        self.stats.record_cascaded(report.cascaded);
        self.stats.record_parents_reclaimed(report.parents_reclaimed);

        if !report.is_idle() {
            debug!(
                expired = report.expired,
                cascaded = report.cascaded,
                parents = report.parents_reclaimed,
                probes = report.probes,
                resets = report.resets,
                records = self.len(),
                "Maintenance pass"
            );
        }
        report
    }

    /// Unlink the parent records of groups that are still unused, visiting
    /// each bucket once. Caller holds the coarse lock.
    fn reclaim_groups(&self, groups: &[Arc<LimitGroup>], deferred: &mut Vec<FlowRecord>) -> usize {
        if groups.is_empty() {
            return 0;
        }
        let array = self.array.load();
        let mut homes: Vec<(usize, &Arc<LimitGroup>)> = groups
            .iter()
            .map(|group| (bucket_index(group.key().flow_hash(), array.len()), group))
            .collect();
        homes.sort_unstable_by_key(|(index, _)| *index);

        let mut reclaimed = 0;
        let mut start = 0;
        while start < homes.len() {
            let index = homes[start].0;
            let end = homes[start..]
                .iter()
                .position(|(i, _)| *i != index)
                .map_or(homes.len(), |n| start + n);
            let run = &homes[start..end];
            start = end;

            let mut guard = array.get(index).lock();
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut guard.records)
                .into_iter()
                .partition(|record| {
                    record.is_parent()
                        && record.group().is_some_and(|group| {
                            group.is_unused() && run.iter().any(|(_, g)| Arc::ptr_eq(g, group))
                        })
                });
            guard.records = kept;

            // A re-admitted group stays; one missing from its home bucket is a bug.
            for (_, group) in run {
                let found = gone
                    .iter()
                    .chain(guard.records.iter())
                    .filter_map(FlowRecord::group)
                    .any(|g| Arc::ptr_eq(g, group));
                if !found {
                    error!(group = %group.key(), bucket = index, "Limit group missing from its bucket, skipping");
                }
            }
            drop(guard);

            reclaimed += gone.len();
            deferred.extend(gone);
        }
        reclaimed
    }

    /// Grow the array when the average chain is longer than two.
    /// Caller holds the coarse lock.
    fn grow_if_crowded(&self, max_buckets: usize) -> Option<usize> {
        let buckets = self.array.load().len();
        let records = self.len();
        let ceiling = max_buckets.min(MAX_BUCKET_COUNT);
        if records <= buckets * 2 || buckets >= ceiling {
            return None;
        }

        let target = (records / 2).next_power_of_two().clamp(buckets * 2, ceiling);
        match self.resize_locked(target) {
            Ok(()) => Some(target),
            Err(e) => {
                self.stats.record_resize_failure();
                warn!(from = buckets, to = target, error = %e, "Flow table resize failed");
                None
            }
        }
    }

    fn keepalive_due(&self, now: Instant, period: Duration) -> bool {
        let mut last = self.last_keepalive.lock();
        match *last {
            Some(at) if now.saturating_duration_since(at) < period => false,
            Some(_) => {
                *last = Some(now);
                true
            }
            None => {
                // The first pass starts the period
                *last = Some(now);
                false
            }
        }
    }
}

/// Established TCP flows close to expiry that have not refreshed
fn needs_keepalive(record: &FlowRecord, now: Instant, interval: Duration) -> bool {
    if record.tcp_phase() != Some(TcpPhase::Established) {
        return false;
    }
    let tcp = record.tcp();
    let stale = !(tcp.fresh_ack(Direction::Forward)
        && tcp.fresh_ack(Direction::Reverse));
    stale && record.remaining(now) <= interval
}
