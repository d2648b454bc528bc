//! Per-flow state machine and lifetime policy
//!
//! TCP flows accumulate the SYN/FIN/RST flags seen in each direction. The
//! combined flag set selects a [`TcpPhase`], and the phase selects which
//! lifetime the next packet grants. UDP and other protocols have a single
//! phase each.
//!
//! ```text
//!            SYN (one side)        SYN (both sides)         FIN (either side)
//!   Idle ──────────────────► Opening ───────────────► Established ─────────────► Closing
//!     │                         │                        │                         │
//!     └─────────── RST or unexpected flag combination ───┴─────────────────────────┴──► Reset
//! ```
//!
//! Established flows only refresh their deadline once *both* directions have
//! acknowledged new data since the previous refresh.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::key::{Direction, IpProtocol};
use crate::config::FlowTableConfig;

bitflags::bitflags! {
    /// TCP header flags, using their on-the-wire bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
    }
}

impl TcpFlags {
    /// Flags that drive the state machine
    pub const TRACKED: Self = Self::SYN.union(Self::FIN).union(Self::RST);
}

/// TCP fields the table needs from a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpSegment {
    /// Header flags
    pub flags: TcpFlags,
    /// Acknowledgment number (meaningful when `ACK` is set)
    pub ack: u32,
}

impl TcpSegment {
    /// Create a segment description
    #[must_use]
    pub const fn new(flags: TcpFlags, ack: u32) -> Self {
        Self { flags, ack }
    }
}

/// What the rule matcher extracted from a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketInfo {
    /// TCP fields, if the packet is TCP
    pub tcp: Option<TcpSegment>,
    /// Packet length in bytes
    pub len: u32,
}

impl PacketInfo {
    /// A TCP packet
    #[must_use]
    pub const fn tcp(flags: TcpFlags, ack: u32, len: u32) -> Self {
        Self {
            tcp: Some(TcpSegment::new(flags, ack)),
            len,
        }
    }

    /// A non-TCP packet
    #[must_use]
    pub const fn other(len: u32) -> Self {
        Self { tcp: None, len }
    }
}

/// Coarse phase of a TCP flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpPhase {
    /// No tracked flag seen yet
    Idle,
    /// SYN seen from one side only
    Opening,
    /// SYN seen from both sides, no FIN
    Established,
    /// Both SYNs and at least one FIN
    Closing,
    /// RST seen, or a flag combination no healthy connection produces
    Reset,
}

/// Which lifetime a transition grants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeClass {
    Syn,
    Ack,
    Fin,
    Rst,
    Udp,
    Short,
}

/// Deadline update requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Leave `expire_at` as it is
    Keep,
    /// Set `expire_at = now + lifetime(class)`
    Extend(LifetimeClass),
}

/// Observed TCP state of one flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpTracker {
    flags_fwd: TcpFlags,
    flags_rev: TcpFlags,
    fresh_ack_fwd: bool,
    fresh_ack_rev: bool,
    ack_fwd: Option<u32>,
    ack_rev: Option<u32>,
}

impl TcpTracker {
    /// Tracked flags seen in one direction
    pub const fn flags(&self, dir: Direction) -> TcpFlags {
        match dir {
            Direction::Forward => self.flags_fwd,
            Direction::Reverse => self.flags_rev,
        }
    }

    /// Highest acknowledgment number seen in one direction
    pub const fn ack(&self, dir: Direction) -> Option<u32> {
        match dir {
            Direction::Forward => self.ack_fwd,
            Direction::Reverse => self.ack_rev,
        }
    }

    /// Whether a new ack arrived in `dir` since the last refresh
    pub const fn fresh_ack(&self, dir: Direction) -> bool {
        match dir {
            Direction::Forward => self.fresh_ack_fwd,
            Direction::Reverse => self.fresh_ack_rev,
        }
    }

    /// Classify the combined flag set
    pub fn phase(&self) -> TcpPhase {
        let all = self.flags_fwd | self.flags_rev;
        if all.is_empty() {
            return TcpPhase::Idle;
        }
        if all.contains(TcpFlags::RST) {
            return TcpPhase::Reset;
        }

        let syn_fwd = self.flags_fwd.contains(TcpFlags::SYN);
        let syn_rev = self.flags_rev.contains(TcpFlags::SYN);
        let fin = all.contains(TcpFlags::FIN);

        match (syn_fwd, syn_rev, fin) {
            (true, false, false) | (false, true, false) => TcpPhase::Opening,
            (true, true, false) => TcpPhase::Established,
            (true, true, true) => TcpPhase::Closing,
            _ => TcpPhase::Reset,
        }
    }

    /// Apply one segment and return the next state plus the deadline update.
    ///
    /// Pure: the tracker itself is not modified.
    #[must_use]
    pub fn observe(&self, dir: Direction, segment: TcpSegment) -> (Self, Refresh) {
        let mut next = *self;
        let seen = segment.flags & TcpFlags::TRACKED;
        match dir {
            Direction::Forward => next.flags_fwd |= seen,
            Direction::Reverse => next.flags_rev |= seen,
        }

        let refresh = match next.phase() {
            TcpPhase::Opening => Refresh::Extend(LifetimeClass::Syn),
            TcpPhase::Established => {
                if segment.flags.contains(TcpFlags::ACK) {
                    next.record_ack(dir, segment.ack);
                }
                if next.fresh_ack_fwd && next.fresh_ack_rev {
                    next.fresh_ack_fwd = false;
                    next.fresh_ack_rev = false;
                    Refresh::Extend(LifetimeClass::Ack)
                } else {
                    Refresh::Keep
                }
            }
            TcpPhase::Closing => Refresh::Extend(LifetimeClass::Fin),
            TcpPhase::Idle | TcpPhase::Reset => Refresh::Extend(LifetimeClass::Rst),
        };

        (next, refresh)
    }

    fn record_ack(&mut self, dir: Direction, ack: u32) {
        let (slot, fresh) = match dir {
            Direction::Forward => (&mut self.ack_fwd, &mut self.fresh_ack_fwd),
            Direction::Reverse => (&mut self.ack_rev, &mut self.fresh_ack_rev),
        };
        let advanced = match *slot {
            None => true,
            Some(prev) => seq_gt(ack, prev),
        };
        if advanced {
            *slot = Some(ack);
            *fresh = true;
        }
    }
}

/// Sequence-space comparison that survives wraparound
#[inline]
#[allow(clippy::cast_possible_wrap)]
const fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Lifetimes granted by each transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifetimePolicy {
    pub syn: Duration,
    pub ack: Duration,
    pub fin: Duration,
    pub rst: Duration,
    pub udp: Duration,
    pub short: Duration,
}

impl Default for LifetimePolicy {
    fn default() -> Self {
        Self::from_config(&FlowTableConfig::default())
    }
}

impl LifetimePolicy {
    /// Build the policy from configuration.
    ///
    /// FIN and RST lifetimes are clamped below the keepalive period so a
    /// closing flow is always gone before the next keepalive pass.
    pub fn from_config(config: &FlowTableConfig) -> Self {
        let ceiling = config.keepalive_period_secs.saturating_sub(1).max(1);
        let clamp = |name: &str, secs: u64| {
            if secs > ceiling {
                warn!(
                    lifetime = name,
                    configured = secs,
                    clamped = ceiling,
                    "Lifetime must stay below the keepalive period, clamping"
                );
                ceiling
            } else {
                secs
            }
        };

        Self {
            syn: Duration::from_secs(config.syn_lifetime_secs),
            ack: Duration::from_secs(config.ack_lifetime_secs),
            fin: Duration::from_secs(clamp("fin", config.fin_lifetime_secs)),
            rst: Duration::from_secs(clamp("rst", config.rst_lifetime_secs)),
            udp: Duration::from_secs(config.udp_lifetime_secs),
            short: Duration::from_secs(config.short_lifetime_secs),
        }
    }

    /// Duration for a lifetime class
    pub const fn lifetime(&self, class: LifetimeClass) -> Duration {
        match class {
            LifetimeClass::Syn => self.syn,
            LifetimeClass::Ack => self.ack,
            LifetimeClass::Fin => self.fin,
            LifetimeClass::Rst => self.rst,
            LifetimeClass::Udp => self.udp,
            LifetimeClass::Short => self.short,
        }
    }

    /// Lifetime of a freshly installed record
    pub const fn initial(&self, protocol: IpProtocol) -> Duration {
        match protocol {
            IpProtocol::Tcp => self.syn,
            IpProtocol::Udp => self.udp,
            _ => self.short,
        }
    }
}

/// Deadline update for a non-TCP packet
pub(crate) const fn datagram_refresh(protocol: IpProtocol) -> Refresh {
    match protocol {
        IpProtocol::Udp => Refresh::Extend(LifetimeClass::Udp),
        _ => Refresh::Extend(LifetimeClass::Short),
    }
}
