use std::fmt;
use std::time::Instant;

use super::bucket::BucketGuard;
use crate::flow::{Direction, FlowKey, FlowRecord, RecordKind, RuleRef};

/// Access to a matched or installed record.
///
/// The handle keeps the record's bucket locked until it is dropped, so the
/// record cannot expire, move or be freed while it is held. Drop it before
/// calling any other table operation: a waiting resize, cascade or
/// maintenance pass would otherwise block both sides.
pub struct RecordHandle {
    guard: BucketGuard,
    index: usize,
    direction: Direction,
}

impl RecordHandle {
    pub(crate) fn new(guard: BucketGuard, index: usize, direction: Direction) -> Self {
        Self {
            guard,
            index,
            direction,
        }
    }

    /// Orientation of the packet relative to the stored key
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// The record itself
    pub fn record(&self) -> &FlowRecord {
        &self.guard.records[self.index]
    }

    /// Owning rule, for the caller to continue rule evaluation
    pub fn owner(&self) -> RuleRef {
        self.record().owner()
    }

    pub fn kind(&self) -> RecordKind {
        self.record().kind()
    }

    pub fn key(&self) -> &FlowKey {
        self.record().key()
    }

    pub fn expire_at(&self) -> Instant {
        self.record().expire_at()
    }
}

impl fmt::Debug for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordHandle")
            .field("record", self.record())
            .field("direction", &self.direction)
            .finish()
    }
}
