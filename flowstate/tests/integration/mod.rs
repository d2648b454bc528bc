//! Integration tests for flowstate
//!
//! # Test Organization
//!
//! - `lifecycle`: lookup orientation, TCP/UDP lifetimes, keepalive probes
//! - `admission`: limit groups and their reclamation
//! - `resize`: manual and automatic bucket array growth
//! - `cascade`: deletion by rule and rule set
//! - `concurrency`: concurrent install, lookup and resize
//!
//! Time-dependent tests drive a `ManualClock`; none of them sleep.

pub mod admission;
pub mod cascade;
pub mod lifecycle;
pub mod resize;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use flowstate::config::FlowTableConfig;
use flowstate::flow::{FlowKey, PacketInfo, RuleRef, TcpFlags, TrackKind};
use flowstate::{FlowTable, ManualClock, RecordingSink};

/// Opening SYN, the packet most TCP flows are installed from
pub const SYN: PacketInfo = PacketInfo::tcp(TcpFlags::SYN, 0, 60);

/// A non-TCP packet
pub const DATAGRAM: PacketInfo = PacketInfo::other(64);

/// A table on a manual clock that records control segments
pub struct Harness {
    pub table: FlowTable,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new(config: FlowTableConfig) -> Self {
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(RecordingSink::new());
        let table = FlowTable::new(config)
            .expect("valid config")
            .with_clock(clock.clone())
            .with_sink(sink.clone());
        Self { table, clock, sink }
    }

    pub fn advance_secs(&self, secs: u64) {
        self.clock.advance(std::time::Duration::from_secs(secs));
    }

    /// Install from a SYN and complete the three-way handshake
    pub fn establish(&self, key: FlowKey, owner: RuleRef) {
        assert!(self.table.lookup(&key, &SYN).is_none(), "{key} already tracked");
        drop(self.table.install(key, &SYN, TrackKind::KeepState, owner).unwrap());
        self.send(&key.reversed(), TcpFlags::SYN | TcpFlags::ACK, 1001);
        self.send(&key, TcpFlags::ACK, 5001);
    }

    /// Deliver one TCP segment, releasing the record immediately
    pub fn send(&self, key: &FlowKey, flags: TcpFlags, ack: u32) {
        let hit = self.table.lookup(key, &PacketInfo::tcp(flags, ack, 64));
        assert!(hit.is_some(), "no state for {key}");
    }
}

pub fn addr(host: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 20, 0, host)), port)
}

/// TCP flow from 10.20.0.`host`:`port` to 10.20.0.254:443
pub fn tcp_key(host: u8, port: u16) -> FlowKey {
    FlowKey::tcp(addr(host, port), addr(254, 443))
}
