//! Buckets and the bucket array
//!
//! Each bucket is an independently locked `Vec` of records. The array itself
//! is immutable once published; resize builds a new one and swaps it in.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::error::{InstallError, InstallResult};
use crate::flow::{Direction, FlowKey, FlowRecord, LimitGroup, LimitMask, RuleRef};

/// Owned guard on one bucket, kept alive by a record handle
pub(crate) type BucketGuard = ArcMutexGuard<RawMutex, Bucket>;

/// One hash chain
#[derive(Debug, Default)]
pub(crate) struct Bucket {
    pub(crate) records: Vec<FlowRecord>,
    /// Set once resize has drained this bucket; the array it belongs to is
    /// about to be replaced and must not receive new records.
    pub(crate) sealed: bool,
}

impl Bucket {
    /// Live, non-parent record for this flow in either orientation
    pub(crate) fn find_match(&self, key: &FlowKey, now: Instant) -> Option<(usize, Direction)> {
        self.records.iter().enumerate().find_map(|(i, record)| {
            if record.is_parent() || record.is_expired(now) {
                return None;
            }
            record.key().matches(key).map(|dir| (i, dir))
        })
    }

    /// Any non-parent record for this flow, expired or not
    pub(crate) fn find_flow(&self, key: &FlowKey) -> Option<(usize, Direction)> {
        self.records.iter().enumerate().find_map(|(i, record)| {
            if record.is_parent() {
                return None;
            }
            record.key().matches(key).map(|dir| (i, dir))
        })
    }

    /// Limit group stored in this bucket for the masked key and owner
    pub(crate) fn find_group(
        &self,
        key: &FlowKey,
        mask: LimitMask,
        owner: RuleRef,
    ) -> Option<Arc<LimitGroup>> {
        self.records
            .iter()
            .filter(|record| record.is_parent())
            .filter_map(FlowRecord::group)
            .find(|group| group.identifies(key, mask, owner))
            .cloned()
    }

    /// Move the record at `index` to the head of the chain
    pub(crate) fn promote(&mut self, index: usize) {
        if index > 0 {
            self.records[..=index].rotate_right(1);
        }
    }

    /// Unlink every non-parent record matching `pred`, preserving chain order
    pub(crate) fn take_where<F>(&mut self, mut pred: F) -> Vec<FlowRecord>
    where
        F: FnMut(&FlowRecord) -> bool,
    {
        if self.records.is_empty() {
            return Vec::new();
        }
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.records)
            .into_iter()
            .partition(|record| !record.is_parent() && pred(record));
        self.records = kept;
        taken
    }
}

/// Fixed-size array of buckets
#[derive(Debug)]
pub(crate) struct BucketArray {
    buckets: Box<[Arc<Mutex<Bucket>>]>,
}

impl BucketArray {
    /// Allocate `count` empty buckets, failing instead of aborting when
    /// memory is short
    pub(crate) fn new(count: usize) -> InstallResult<Self> {
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(count)
            .map_err(|_| InstallError::InvalidBucketCount(count))?;
        buckets.resize_with(count, || Arc::new(Mutex::new(Bucket::default())));
        Ok(Self {
            buckets: buckets.into_boxed_slice(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn get(&self, index: usize) -> &Arc<Mutex<Bucket>> {
        &self.buckets[index]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Mutex<Bucket>>> {
        self.buckets.iter()
    }
}
