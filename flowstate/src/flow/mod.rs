//! Flow identity, per-flow state and records
//!
//! - [`key`]: canonical flow keys, the commutative hash and limit masks
//! - [`state`]: the TCP state machine and lifetime policy
//! - [`record`]: flow records, owners and limit groups

pub mod key;
pub mod record;
pub mod state;

pub use key::{AddressFamily, Direction, FlowKey, IpProtocol, LimitMask};
pub use record::{
    ChildLink, FlowRecord, LimitGroup, LimitSpec, RecordKind, RuleId, RuleRef, SetId, TrackKind,
};
pub use state::{
    LifetimeClass, LifetimePolicy, PacketInfo, Refresh, TcpFlags, TcpPhase, TcpSegment,
    TcpTracker,
};
