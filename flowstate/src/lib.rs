//! flowstate: stateful flow tracking for packet filters
//!
//! This crate provides the connection-state table a stateful firewall
//! consults on every packet: bidirectional flow records with TCP state and
//! per-state lifetimes, per-group admission limits, cascading deletion when
//! rules go away, and periodic maintenance with keepalive probing.
//!
//! # Features
//!
//! - **Concurrent table**: per-bucket locks on the packet path, online resize
//! - **TCP tracking**: SYN/FIN/RST state machine with ack-driven refresh
//! - **Admission control**: limit groups keyed by a masked flow key
//! - **Cascading deletion**: by rule or rule set, with optional resets
//! - **Maintenance**: expiry sweep, keepalive probes, automatic growth
//!
//! # Architecture
//!
//! ```text
//! packet → classify → FlowTable::lookup ──hit──→ RecordHandle (owner rule)
//!                          │ miss
//!                          ↓
//!                  rule match → FlowTable::install
//!
//! MaintenanceScheduler ──tick──→ run_maintenance ──probes──→ ControlSink
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use flowstate::config::FlowTableConfig;
//! use flowstate::flow::{FlowKey, LimitMask, LimitSpec, PacketInfo, RuleRef, TcpFlags, TrackKind};
//! use flowstate::FlowTable;
//!
//! let table = Arc::new(FlowTable::new(FlowTableConfig::default()).unwrap());
//! let key = FlowKey::tcp("10.0.0.1:51000".parse().unwrap(), "10.0.0.2:22".parse().unwrap());
//!
//! // Miss: the rule matcher decides to keep state, two flows per source at most
//! let syn = PacketInfo::tcp(TcpFlags::SYN, 0, 60);
//! assert!(table.lookup(&key, &syn).is_none());
//! let limit = TrackKind::Limit(LimitSpec::new(LimitMask::SRC_ADDR, 2));
//! drop(table.install(key, &syn, limit, RuleRef::new(500, 0)).unwrap());
//!
//! // The reply matches the same record
//! let (handle, _) = table
//!     .lookup(&key.reversed(), &PacketInfo::tcp(TcpFlags::SYN | TcpFlags::ACK, 1, 60))
//!     .unwrap();
//! assert_eq!(handle.owner(), RuleRef::new(500, 0));
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`flow`]: Flow keys, TCP state and records
//! - [`table`]: The flow table and its maintenance pass
//! - [`scheduler`]: Periodic maintenance on a tokio runtime
//! - [`control`]: Control-segment sinks
//! - [`clock`]: Time sources
//! - [`error`]: Error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod flow;
pub mod scheduler;
pub mod table;

// Re-export commonly used types at the crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FlowTableConfig, LogConfig, SimulatorConfig};
pub use control::{ChannelSink, ControlSegment, ControlSink, NullSink, RecordingSink};
pub use error::{ConfigError, FlowStateError, InstallError, InstallResult};
pub use flow::{Direction, FlowKey, PacketInfo, RuleRef, TrackKind};
pub use scheduler::MaintenanceScheduler;
pub use table::{FlowSnapshot, FlowTable, RecordHandle, TableStatsSnapshot, TickReport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
