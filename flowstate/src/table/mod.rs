//! The flow table
//!
//! A fixed power-of-two array of independently locked buckets, published
//! through `ArcSwap`. The packet path (lookup, install) only ever takes one
//! bucket lock at a time. Structural work (resize, cascades, maintenance)
//! holds a coarse lock exclusively; `install` and `export` hold it shared,
//! so no record is created while a cascade is walking the buckets. The
//! coarse lock is always taken before any bucket lock.
//!
//! Resize drains and seals old buckets one by one while holding the coarse
//! lock. A lookup that lands on a sealed bucket backs off, waits for the
//! coarse lock and retries against the new array, so every lookup sees
//! either the complete old array or the complete new one.

mod bucket;
mod handle;
mod maintenance;
mod stats;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::FlowTableConfig;
use crate::control::{ControlSegment, ControlSink, NullSink};
use crate::error::{ConfigError, InstallError, InstallResult};
use crate::flow::key::bucket_index;
use crate::flow::record::Linkage;
use crate::flow::{
    ChildLink, Direction, FlowKey, FlowRecord, LifetimePolicy, LimitGroup, LimitSpec, PacketInfo,
    RecordKind, RuleId, RuleRef, SetId, TcpPhase, TrackKind,
};

use bucket::{BucketArray, BucketGuard};
use maintenance::{OwnerFilter, PendingCascade};

pub use handle::RecordHandle;
pub use maintenance::TickReport;
pub use stats::{TableStats, TableStatsSnapshot};

/// Largest supported bucket count
pub const MAX_BUCKET_COUNT: usize = 65536;

/// Runtime-tunable settings, swapped as a unit
#[derive(Debug)]
struct Tunables {
    config: FlowTableConfig,
    policy: LifetimePolicy,
}

impl Tunables {
    fn new(config: &FlowTableConfig) -> Self {
        Self {
            policy: LifetimePolicy::from_config(config),
            config: config.clone(),
        }
    }
}

/// Serializable view of one record, for listing tracked state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub protocol: u8,
    pub src: std::net::SocketAddr,
    pub dst: std::net::SocketAddr,
    pub kind: RecordKind,
    pub owner: RuleRef,
    /// TCP phase, absent for other protocols and limit parents
    pub phase: Option<TcpPhase>,
    pub expires_in_ms: u64,
    pub packets_fwd: u64,
    pub packets_rev: u64,
    pub bytes_fwd: u64,
    pub bytes_rev: u64,
    /// Live children, parents only
    pub child_count: Option<u32>,
    /// Configured limit, limit records only
    pub limit: Option<u32>,
}

impl FlowSnapshot {
    fn of(record: &FlowRecord, now: Instant) -> Self {
        let key = record.key();
        let is_parent = record.kind() == RecordKind::LimitParent;
        Self {
            protocol: key.protocol().number(),
            src: key.src(),
            dst: key.dst(),
            kind: record.kind(),
            owner: record.owner(),
            phase: if is_parent { None } else { record.tcp_phase() },
            expires_in_ms: u64::try_from(record.remaining(now).as_millis()).unwrap_or(u64::MAX),
            packets_fwd: record.packets(Direction::Forward),
            packets_rev: record.packets(Direction::Reverse),
            bytes_fwd: record.bytes(Direction::Forward),
            bytes_rev: record.bytes(Direction::Reverse),
            child_count: record.child_count(),
            limit: record.group().map(|group| group.limit()),
        }
    }
}

/// Stateful flow table
///
/// # Example
///
/// ```
/// use flowstate::config::FlowTableConfig;
/// use flowstate::flow::{FlowKey, PacketInfo, RuleRef, TcpFlags, TrackKind};
/// use flowstate::FlowTable;
///
/// let table = FlowTable::new(FlowTableConfig::default()).unwrap();
/// let key = FlowKey::tcp("10.0.0.1:40000".parse().unwrap(), "10.0.0.2:80".parse().unwrap());
///
/// let syn = PacketInfo::tcp(TcpFlags::SYN, 0, 60);
/// let handle = table.install(key, &syn, TrackKind::KeepState, RuleRef::new(100, 0)).unwrap();
/// drop(handle);
///
/// let (handle, _dir) = table
///     .lookup(&key.reversed(), &PacketInfo::tcp(TcpFlags::SYN | TcpFlags::ACK, 1, 60))
///     .unwrap();
/// assert_eq!(handle.owner(), RuleRef::new(100, 0));
/// ```
pub struct FlowTable {
    array: ArcSwap<BucketArray>,
    /// Coarse lock: exclusive for resize, cascades and maintenance,
    /// shared for install and export
    structure: RwLock<()>,
    records: AtomicUsize,
    tunables: ArcSwap<Tunables>,
    epoch: AtomicU64,
    pending: Mutex<Vec<PendingCascade>>,
    last_keepalive: Mutex<Option<Instant>>,
    stats: TableStats,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ControlSink>,
}

impl FlowTable {
    /// Create a table on the system clock that discards control segments.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration does not validate or the
    /// initial bucket array cannot be allocated.
    pub fn new(config: FlowTableConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let array = BucketArray::new(config.buckets)
            .map_err(|e| ConfigError::validation(e.to_string()))?;

        debug!(
            buckets = config.buckets,
            max_records = config.max_records,
            "Flow table created"
        );

        Ok(Self {
            array: ArcSwap::from_pointee(array),
            structure: RwLock::new(()),
            records: AtomicUsize::new(0),
            tunables: ArcSwap::from_pointee(Tunables::new(&config)),
            epoch: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            last_keepalive: Mutex::new(None),
            stats: TableStats::new(),
            clock: Arc::new(SystemClock),
            sink: Arc::new(NullSink),
        })
    }

    /// Use a different time source
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Send keepalive probes and resets to `sink`
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ControlSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Records currently held, limit parents included
    pub fn len(&self) -> usize {
        self.records.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current bucket count
    pub fn bucket_count(&self) -> usize {
        self.array.load().len()
    }

    /// Counters
    pub fn stats(&self) -> &TableStats {
        &self.stats
    }

    /// Counters plus current occupancy
    pub fn stats_snapshot(&self) -> TableStatsSnapshot {
        self.stats.snapshot(self.len(), self.bucket_count())
    }

    /// Interval between maintenance passes
    pub fn tick_interval(&self) -> Duration {
        self.tunables.load().config.tick()
    }

    /// Active configuration
    pub fn config(&self) -> FlowTableConfig {
        self.tunables.load().config.clone()
    }

    /// Find the record for `key` and apply the packet to it.
    ///
    /// A hit moves the record to the head of its bucket, advances its TCP
    /// state and deadline, and returns it locked together with the packet's
    /// orientation. Limit parents and expired records never match.
    pub fn lookup(&self, key: &FlowKey, info: &PacketInfo) -> Option<(RecordHandle, Direction)> {
        let now = self.clock.now();
        let tunables = self.tunables.load();
        let (bucket, _) = self.lock_bucket(key.flow_hash());

        let found = bucket.find_match(key, now);
        self.stats.record_lookup(found.is_some());
        let (index, direction) = found?;

        let handle = touch(bucket, index, direction, info, now, &tunables.policy);
        Some((handle, direction))
    }

    /// Create state for a flow and apply the packet that created it.
    ///
    /// `info` is the packet that missed in [`lookup`](Self::lookup); it
    /// counts as the flow's first forward packet. If a live record for the
    /// flow already exists (installed by a racing caller) the packet is
    /// applied to it and a handle to it is returned instead. Limited flows
    /// are first admitted against their limit group, which is created on
    /// demand.
    ///
    /// Install holds the coarse lock shared, so it never interleaves with a
    /// cascade: state for an owner being deleted is either removed by the
    /// cascade or created after it returned.
    ///
    /// # Errors
    ///
    /// `OutOfCapacity` when the table is full, `LimitExceeded` when the
    /// flow's limit group is full. Nothing is created on error.
    pub fn install(
        &self,
        key: FlowKey,
        info: &PacketInfo,
        kind: TrackKind,
        owner: RuleRef,
    ) -> InstallResult<RecordHandle> {
        let _structure = self.structure.read();
        let now = self.clock.now();
        let tunables = self.tunables.load_full();
        let policy = &tunables.policy;
        let hash = key.flow_hash();

        let link = match kind {
            TrackKind::KeepState => Linkage::Bidirectional,
            TrackKind::Limit(spec) => {
                {
                    let (bucket, _) = self.lock_bucket(hash);
                    if let Some((index, direction)) = bucket.find_match(&key, now) {
                        return Ok(touch(bucket, index, direction, info, now, policy));
                    }
                }
                Linkage::Child(self.admit(&key, spec, owner, now, &tunables)?)
            }
        };

        let (mut bucket, index) = self.lock_bucket(hash);
        match bucket.find_flow(&key) {
            Some((existing, direction)) if !bucket.records[existing].is_expired(now) => {
                // `link` drops here, handing back any admitted slot
                return Ok(touch(bucket, existing, direction, info, now, policy));
            }
            Some((existing, _)) => {
                let stale = bucket.records.remove(existing);
                self.release_slots(1);
                self.stats.record_expired(1);
                trace!(flow = %stale.key(), "Replacing expired record");
            }
            None => {}
        }

        if let Err(e) = self.reserve_slot(&tunables.config) {
            warn!(flow = %key, owner = %owner, "Install rejected, table full");
            return Err(e);
        }

        let lifetime = policy.initial(key.protocol());
        let epoch = self.epoch.load(Ordering::Acquire);
        let mut record = FlowRecord::new(key, link, owner, now, lifetime, index, epoch);
        record.apply(Direction::Forward, info, now, policy);
        debug!(flow = %key, owner = %owner, kind = ?record.kind(), "Installed flow state");
        bucket.records.insert(0, record);
        self.stats.record_install();

        Ok(RecordHandle::new(bucket, 0, Direction::Forward))
    }

    /// Admit a new child against its limit group, creating the group on
    /// first use. Only the group's bucket is locked here.
    fn admit(
        &self,
        key: &FlowKey,
        spec: LimitSpec,
        owner: RuleRef,
        now: Instant,
        tunables: &Tunables,
    ) -> InstallResult<ChildLink> {
        let group_key = key.masked(spec.mask);
        let (mut bucket, index) = self.lock_bucket(group_key.flow_hash());

        let admitted = match bucket.find_group(&group_key, spec.mask, owner) {
            Some(group) => group.admit(),
            None if spec.limit == 0 => Err(InstallError::LimitExceeded { limit: 0 }),
            None => {
                self.reserve_slot(&tunables.config)?;
                let group = Arc::new(LimitGroup::new(group_key, spec, owner));
                let link = group.admit();
                let lifetime = tunables.policy.initial(key.protocol());
                let epoch = self.epoch.load(Ordering::Acquire);
                bucket.records.push(FlowRecord::new(
                    group_key,
                    Linkage::Parent(group),
                    owner,
                    now,
                    lifetime,
                    index,
                    epoch,
                ));
                debug!(group = %group_key, limit = spec.limit, owner = %owner, "Created limit group");
                link
            }
        };

        if let Err(InstallError::LimitExceeded { limit }) = &admitted {
            self.stats.record_rejected_limit();
            warn!(flow = %key, group = %group_key, limit, "Install rejected, limit reached");
        }
        admitted
    }

    /// Remove every non-parent record matching `pred`.
    ///
    /// Records are unlinked bucket by bucket and freed only after the walk
    /// finishes. Returns the number removed.
    pub fn remove_matching<F>(&self, pred: F) -> usize
    where
        F: FnMut(&FlowRecord) -> bool,
    {
        let structure = self.structure.write();
        let removed = self.unlink_where(pred);
        drop(structure);

        let count = removed.len();
        self.release_slots(count);
        drop(removed);
        if count > 0 {
            debug!(removed = count, "Removed matching flow records");
        }
        count
    }

    /// Remove all flow state. Limit parents go on the next maintenance pass.
    pub fn flush(&self) -> usize {
        let count = self.remove_matching(|_| true);
        info!(removed = count, "Flow table flushed");
        count
    }

    /// Re-home every record into `new_count` buckets.
    ///
    /// # Errors
    ///
    /// `InvalidBucketCount` if `new_count` is not a power of two in
    /// `[1, MAX_BUCKET_COUNT]`, or the new array cannot be allocated. The
    /// table is unchanged on error.
    pub fn resize(&self, new_count: usize) -> InstallResult<()> {
        if !new_count.is_power_of_two() || new_count > MAX_BUCKET_COUNT {
            return Err(InstallError::InvalidBucketCount(new_count));
        }
        let _structure = self.structure.write();
        self.resize_locked(new_count)
    }

    /// Caller holds the coarse lock.
    fn resize_locked(&self, new_count: usize) -> InstallResult<()> {
        let old = self.array.load_full();
        let old_count = old.len();
        if old_count == new_count {
            return Ok(());
        }

        let fresh = BucketArray::new(new_count)?;
        let mut moved = 0usize;
        for bucket in old.iter() {
            let records = {
                let mut guard = bucket.lock();
                guard.sealed = true;
                std::mem::take(&mut guard.records)
            };
            // `fresh` is not published yet, so these locks are uncontended
            for mut record in records {
                let index = bucket_index(record.key().flow_hash(), new_count);
                record.set_bucket_index(index);
                fresh.get(index).lock().records.push(record);
                moved += 1;
            }
        }

        self.array.store(Arc::new(fresh));
        self.stats.record_resize();
        info!(from = old_count, to = new_count, records = moved, "Flow table resized");
        Ok(())
    }

    /// Cascade-delete every record owned by `rule`.
    ///
    /// Returns the number of records removed synchronously. Records
    /// installed concurrently for the same owner are caught by the next
    /// maintenance pass.
    pub fn expire_owned_by(&self, rule: RuleId) -> usize {
        self.cascade(OwnerFilter::Rule(rule))
    }

    /// Cascade-delete every record whose owner belongs to `set`
    pub fn expire_owned_by_set(&self, set: SetId) -> usize {
        self.cascade(OwnerFilter::Set(set))
    }

    fn cascade(&self, filter: OwnerFilter) -> usize {
        let reset = self.tunables.load().config.reset_on_cascade;
        let mut resets = Vec::new();

        let structure = self.structure.write();
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel);
        let pending = PendingCascade { filter, epoch };
        self.remember_cascade(pending);
        let removed = self.unlink_where(|record| {
            let hit = pending.applies_to(record);
            if hit && reset {
                resets.extend(reset_segments(record));
            }
            hit
        });
        drop(structure);

        let count = removed.len();
        self.release_slots(count);
        drop(removed);
        self.stats.record_cascaded(count);
        info!(owner = %filter, removed = count, resets = resets.len(), "Cascading deletion");

        self.stats.record_resets(resets.len());
        self.dispatch(resets);
        count
    }

    /// Queue a cascade for the next maintenance pass. Repeated cascades for
    /// the same owner collapse into one entry carrying the newest epoch.
    fn remember_cascade(&self, cascade: PendingCascade) {
        let mut pending = self.pending.lock();
        match pending.iter_mut().find(|c| c.filter == cascade.filter) {
            Some(existing) => existing.epoch = existing.epoch.max(cascade.epoch),
            None => pending.push(cascade),
        }
    }

    /// Serializable copy of every record, parents included
    pub fn export(&self) -> Vec<FlowSnapshot> {
        let now = self.clock.now();
        let _structure = self.structure.read();
        let array = self.array.load();
        let mut out = Vec::with_capacity(self.len());
        for bucket in array.iter() {
            let guard = bucket.lock();
            out.extend(guard.records.iter().map(|record| FlowSnapshot::of(record, now)));
        }
        out
    }

    /// Apply new lifetimes and limits to a live table.
    ///
    /// The bucket count is not touched; use [`resize`](Self::resize).
    /// Existing deadlines keep their value until the next refresh.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` and keeps the old settings if `config` does
    /// not validate.
    pub fn reconfigure(&self, config: &FlowTableConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.tunables.store(Arc::new(Tunables::new(config)));
        info!(
            max_records = config.max_records,
            max_buckets = config.max_buckets,
            keepalive = config.keepalive,
            "Flow table reconfigured"
        );
        Ok(())
    }

    /// Lock the current home bucket of `hash`, retrying across a resize.
    fn lock_bucket(&self, hash: u64) -> (BucketGuard, usize) {
        loop {
            let array = self.array.load();
            let index = bucket_index(hash, array.len());
            let guard = array.get(index).lock_arc();
            if !guard.sealed {
                return (guard, index);
            }
            drop(guard);
            // A resize is publishing a new array; wait for it to finish.
            drop(self.structure.read_recursive());
        }
    }

    /// Caller holds the coarse lock.
    fn unlink_where<F>(&self, mut pred: F) -> Vec<FlowRecord>
    where
        F: FnMut(&FlowRecord) -> bool,
    {
        let array = self.array.load();
        let mut removed = Vec::new();
        for bucket in array.iter() {
            let mut guard = bucket.lock();
            removed.extend(guard.take_where(&mut pred));
        }
        removed
    }

    fn reserve_slot(&self, config: &FlowTableConfig) -> InstallResult<()> {
        let max = config.max_records;
        self.records
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| {
                self.stats.record_rejected_capacity();
                InstallError::OutOfCapacity { max }
            })
    }

    fn release_slots(&self, n: usize) {
        if n > 0 {
            self.records.fetch_sub(n, Ordering::AcqRel);
        }
    }

    fn dispatch(&self, segments: Vec<ControlSegment>) {
        for segment in segments {
            self.sink.send_control_segment(segment);
        }
    }
}

/// Move a matched record to the head of its bucket and apply the packet
fn touch(
    mut bucket: BucketGuard,
    index: usize,
    direction: Direction,
    info: &PacketInfo,
    now: Instant,
    policy: &LifetimePolicy,
) -> RecordHandle {
    bucket.promote(index);
    bucket.records[0].apply(direction, info, now, policy);
    RecordHandle::new(bucket, 0, direction)
}

/// Resets for an established TCP flow being torn down
fn reset_segments(record: &FlowRecord) -> Vec<ControlSegment> {
    if record.tcp_phase() == Some(TcpPhase::Established) {
        ControlSegment::reset_pair(*record.key(), record.tcp()).to_vec()
    } else {
        Vec::new()
    }
}

impl fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTable")
            .field("records", &self.len())
            .field("buckets", &self.bucket_count())
            .field("clock", &self.clock)
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}
