//! Packet-synthesis boundary
//!
//! The table never builds or transmits packets. When a flow needs a
//! keepalive probe or a reset it describes the segment as a
//! [`ControlSegment`] and hands it to a [`ControlSink`]. The sink owns
//! header construction, checksums and transmission; the table ignores the
//! outcome.

use std::fmt;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::flow::{Direction, FlowKey, TcpFlags, TcpTracker};

/// A TCP control segment the network layer should emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSegment {
    /// Flow the segment belongs to
    pub key: FlowKey,
    /// Sequence number
    pub seq: u32,
    /// Acknowledgment number
    pub ack: u32,
    /// TCP flags
    pub flags: TcpFlags,
    /// `Forward` travels from the key's source to its destination
    pub direction: Direction,
}

impl ControlSegment {
    /// Keepalive probes for an established flow missing fresh acks.
    ///
    /// A SYN-flagged probe goes in the direction lacking a fresh ack, with
    /// its sequence one behind what the peer last acknowledged, so the peer
    /// answers with a duplicate ACK instead of treating it as a new
    /// handshake. A bare ACK goes the other way.
    pub fn keepalive_pair(key: FlowKey, tcp: &TcpTracker) -> [Self; 2] {
        let probe_dir = if tcp.fresh_ack(Direction::Forward) {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        let (seq, ack) = numbers(tcp, probe_dir);
        let probe = Self {
            key,
            seq: seq.wrapping_sub(1),
            ack,
            flags: TcpFlags::SYN,
            direction: probe_dir,
        };

        let ack_dir = probe_dir.opposite();
        let (seq, ack) = numbers(tcp, ack_dir);
        let bare_ack = Self {
            key,
            seq,
            ack,
            flags: TcpFlags::ACK,
            direction: ack_dir,
        };

        [probe, bare_ack]
    }

    /// Resets toward both endpoints of a flow being torn down
    pub fn reset_pair(key: FlowKey, tcp: &TcpTracker) -> [Self; 2] {
        [Direction::Forward, Direction::Reverse].map(|direction| {
            let (seq, ack) = numbers(tcp, direction);
            Self {
                key,
                seq,
                ack,
                flags: TcpFlags::RST | TcpFlags::ACK,
                direction,
            }
        })
    }
}

/// Sequence and ack numbers for a segment sent in `dir`.
///
/// The sender's next sequence number is what the opposite side last
/// acknowledged; its ack is what the sender itself last acknowledged.
fn numbers(tcp: &TcpTracker, dir: Direction) -> (u32, u32) {
    let seq = tcp.ack(dir.opposite()).unwrap_or(0);
    let ack = tcp.ack(dir).unwrap_or(0);
    (seq, ack)
}

/// Capability that builds and transmits control segments
pub trait ControlSink: Send + Sync + fmt::Debug {
    /// Emit a segment; failures stay inside the sink
    fn send_control_segment(&self, segment: ControlSegment);
}

/// Sink that discards every segment
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ControlSink for NullSink {
    fn send_control_segment(&self, _segment: ControlSegment) {}
}

/// Sink that forwards segments to an async transmit task
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ControlSegment>,
}

impl ChannelSink {
    /// Create a sink and the receiver the transmit task drains
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlSegment>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ControlSink for ChannelSink {
    fn send_control_segment(&self, segment: ControlSegment) {
        if self.tx.send(segment).is_err() {
            trace!(flow = %segment.key, "Control segment dropped, transmit task gone");
        }
    }
}

/// Sink that keeps every segment, for inspection
#[derive(Debug, Default)]
pub struct RecordingSink {
    segments: Mutex<Vec<ControlSegment>>,
}

impl RecordingSink {
    /// Create an empty recording sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all recorded segments
    pub fn take(&self) -> Vec<ControlSegment> {
        std::mem::take(&mut *self.segments.lock())
    }

    /// Number of recorded segments
    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.segments.lock().is_empty()
    }
}

impl ControlSink for RecordingSink {
    fn send_control_segment(&self, segment: ControlSegment) {
        self.segments.lock().push(segment);
    }
}
