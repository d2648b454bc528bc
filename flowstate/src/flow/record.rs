//! Flow records ("dynamic rules") and limit groups
//!
//! A record lives in exactly one bucket of the table. Limit children share
//! their parent through an `Arc<LimitGroup>`; the child count is an atomic
//! held by the group, and dropping a child's link decrements it, so a
//! parent can never outlive its bookkeeping or be freed under a child.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::key::{Direction, FlowKey, LimitMask};
use super::state::{datagram_refresh, LifetimePolicy, PacketInfo, Refresh, TcpPhase, TcpTracker};
use crate::error::InstallError;

/// Identifier of a static rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub u32);

/// Identifier of a rule set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetId(pub u8);

/// The static rule that owns a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleRef {
    /// Rule identity
    pub rule: RuleId,
    /// Set the rule belongs to
    pub set: SetId,
}

impl RuleRef {
    /// Create an owner reference
    #[must_use]
    pub const fn new(rule: u32, set: u8) -> Self {
        Self {
            rule: RuleId(rule),
            set: SetId(set),
        }
    }
}

impl fmt::Display for RuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule {} (set {})", self.rule.0, self.set.0)
    }
}

/// Admission control parameters for a limited flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSpec {
    /// Fields shared by every flow counted against the same limit
    pub mask: LimitMask,
    /// Maximum concurrently tracked flows in the group
    pub limit: u32,
}

impl LimitSpec {
    /// Create a limit specification
    #[must_use]
    pub const fn new(mask: LimitMask, limit: u32) -> Self {
        Self { mask, limit }
    }
}

/// How a flow should be tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Plain bidirectional state
    KeepState,
    /// State counted against a limit group
    Limit(LimitSpec),
}

/// Record kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Bidirectional,
    LimitChild,
    LimitParent,
}

/// Shared state of a limit parent
#[derive(Debug)]
pub struct LimitGroup {
    key: FlowKey,
    mask: LimitMask,
    owner: RuleRef,
    limit: u32,
    children: AtomicU32,
}

impl LimitGroup {
    pub(crate) fn new(key: FlowKey, spec: LimitSpec, owner: RuleRef) -> Self {
        Self {
            key,
            mask: spec.mask,
            owner,
            limit: spec.limit,
            children: AtomicU32::new(0),
        }
    }

    /// Masked key identifying the group
    pub const fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Mask the group was created with
    pub const fn mask(&self) -> LimitMask {
        self.mask
    }

    /// Rule that owns the group
    pub const fn owner(&self) -> RuleRef {
        self.owner
    }

    /// Configured limit
    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Live children referencing this group
    pub fn child_count(&self) -> u32 {
        self.children.load(Ordering::Acquire)
    }

    pub(crate) fn is_unused(&self) -> bool {
        self.child_count() == 0
    }

    pub(crate) fn identifies(&self, key: &FlowKey, mask: LimitMask, owner: RuleRef) -> bool {
        self.key == *key && self.mask == mask && self.owner.rule == owner.rule
    }

    /// Count one more child unless the group is full.
    ///
    /// Callers hold the parent's bucket lock, which is also the only place
    /// the sweep reclaims unused groups, so a group admitted here cannot be
    /// reclaimed before the child link exists.
    pub(crate) fn admit(self: &Arc<Self>) -> Result<ChildLink, InstallError> {
        let limit = self.limit;
        self.children
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| InstallError::LimitExceeded { limit })?;
        Ok(ChildLink(Arc::clone(self)))
    }
}

/// A counted reference from a child to its group.
///
/// Dropping the link gives the slot back.
#[derive(Debug)]
pub struct ChildLink(Arc<LimitGroup>);

impl ChildLink {
    /// The group this child is counted against
    pub fn group(&self) -> &Arc<LimitGroup> {
        &self.0
    }
}

impl Drop for ChildLink {
    fn drop(&mut self) {
        let previous = self.0.children.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            // Underflow would mean a child was counted twice; restore and carry on.
            self.0.children.fetch_add(1, Ordering::AcqRel);
            tracing::error!(group = %self.0.key, "Limit group child count underflow");
        }
    }
}

#[derive(Debug)]
pub(crate) enum Linkage {
    Bidirectional,
    Child(ChildLink),
    Parent(Arc<LimitGroup>),
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    packets: u64,
    bytes: u64,
}

/// A tracked flow
#[derive(Debug)]
pub struct FlowRecord {
    key: FlowKey,
    link: Linkage,
    owner: RuleRef,
    tcp: TcpTracker,
    expire_at: Instant,
    created_at: Instant,
    bucket_index: usize,
    epoch: u64,
    forward: Counters,
    reverse: Counters,
}

impl FlowRecord {
    pub(crate) fn new(
        key: FlowKey,
        link: Linkage,
        owner: RuleRef,
        now: Instant,
        lifetime: Duration,
        bucket_index: usize,
        epoch: u64,
    ) -> Self {
        Self {
            key,
            link,
            owner,
            tcp: TcpTracker::default(),
            expire_at: now + lifetime,
            created_at: now,
            bucket_index,
            epoch,
            forward: Counters::default(),
            reverse: Counters::default(),
        }
    }

    /// Flow key in the orientation of the creating packet
    pub const fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Record kind
    pub const fn kind(&self) -> RecordKind {
        match self.link {
            Linkage::Bidirectional => RecordKind::Bidirectional,
            Linkage::Child(_) => RecordKind::LimitChild,
            Linkage::Parent(_) => RecordKind::LimitParent,
        }
    }

    /// Owning static rule
    pub const fn owner(&self) -> RuleRef {
        self.owner
    }

    /// Limit group of a child, or the group a parent represents
    pub fn group(&self) -> Option<&Arc<LimitGroup>> {
        match &self.link {
            Linkage::Bidirectional => None,
            Linkage::Child(link) => Some(link.group()),
            Linkage::Parent(group) => Some(group),
        }
    }

    /// Child count, for parents only
    pub fn child_count(&self) -> Option<u32> {
        match &self.link {
            Linkage::Parent(group) => Some(group.child_count()),
            _ => None,
        }
    }

    /// Observed TCP state
    pub const fn tcp(&self) -> &TcpTracker {
        &self.tcp
    }

    /// TCP phase, for TCP flows
    pub fn tcp_phase(&self) -> Option<TcpPhase> {
        self.key.is_tcp().then(|| self.tcp.phase())
    }

    /// Absolute deadline
    pub const fn expire_at(&self) -> Instant {
        self.expire_at
    }

    /// Creation time
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Home bucket in the current array
    pub const fn bucket_index(&self) -> usize {
        self.bucket_index
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expire_at <= now
    }

    /// Time left before expiry
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expire_at.saturating_duration_since(now)
    }

    /// Packets seen in one direction
    pub const fn packets(&self, dir: Direction) -> u64 {
        match dir {
            Direction::Forward => self.forward.packets,
            Direction::Reverse => self.reverse.packets,
        }
    }

    /// Bytes seen in one direction
    pub const fn bytes(&self, dir: Direction) -> u64 {
        match dir {
            Direction::Forward => self.forward.bytes,
            Direction::Reverse => self.reverse.bytes,
        }
    }

    pub(crate) const fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) const fn is_parent(&self) -> bool {
        matches!(self.link, Linkage::Parent(_))
    }

    pub(crate) fn set_bucket_index(&mut self, index: usize) {
        self.bucket_index = index;
    }

    pub(crate) fn extend_to(&mut self, deadline: Instant) {
        self.expire_at = deadline;
    }

    /// Apply a matching packet: counters, state machine, deadline.
    pub(crate) fn apply(&mut self, dir: Direction, info: &PacketInfo, now: Instant, policy: &LifetimePolicy) {
        let counters = match dir {
            Direction::Forward => &mut self.forward,
            Direction::Reverse => &mut self.reverse,
        };
        counters.packets += 1;
        counters.bytes += u64::from(info.len);

        let refresh = if self.key.is_tcp() {
            let segment = info.tcp.unwrap_or_default();
            let (next, refresh) = self.tcp.observe(dir, segment);
            if next.phase() != self.tcp.phase() {
                trace!(
                    flow = %self.key,
                    from = ?self.tcp.phase(),
                    to = ?next.phase(),
                    "TCP phase change"
                );
            }
            self.tcp = next;
            refresh
        } else {
            datagram_refresh(self.key.protocol())
        };

        if let Refresh::Extend(class) = refresh {
            self.expire_at = now + policy.lifetime(class);
        }
    }
}
