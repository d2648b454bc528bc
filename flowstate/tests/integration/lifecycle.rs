//! Flow lifecycle: orientation, lifetimes and keepalives

use flowstate::config::FlowTableConfig;
use flowstate::flow::{
    Direction, FlowKey, IpProtocol, PacketInfo, RecordKind, RuleRef, TcpFlags, TcpPhase, TrackKind,
};

use super::{addr, tcp_key, Harness, DATAGRAM, SYN};

const OWNER: RuleRef = RuleRef::new(1000, 3);

#[test]
fn test_hash_is_orientation_independent() {
    let key = tcp_key(1, 33000);
    assert_eq!(key.flow_hash(), key.reversed().flow_hash());
    assert_ne!(key.flow_hash(), tcp_key(1, 33001).flow_hash());
}

#[test]
fn test_both_orientations_reach_the_same_record() {
    let h = Harness::new(FlowTableConfig::default());
    let key = tcp_key(2, 33000);
    drop(h.table.install(key, &SYN, TrackKind::KeepState, OWNER).unwrap());

    let created = {
        let (handle, dir) = h.table.lookup(&key, &PacketInfo::tcp(TcpFlags::SYN, 0, 60)).unwrap();
        assert_eq!(dir, Direction::Forward);
        handle.record().created_at()
    };
    {
        let (handle, dir) = h
            .table
            .lookup(&key.reversed(), &PacketInfo::tcp(TcpFlags::SYN | TcpFlags::ACK, 1, 60))
            .unwrap();
        assert_eq!(dir, Direction::Reverse);
        assert_eq!(handle.record().created_at(), created);
        // The installing SYN and its retransmission
        assert_eq!(handle.record().packets(Direction::Forward), 2);
        assert_eq!(handle.record().packets(Direction::Reverse), 1);
        assert_eq!(handle.kind(), RecordKind::Bidirectional);
        assert_eq!(handle.owner(), OWNER);
    }
    assert_eq!(h.table.len(), 1);
}

#[test]
fn test_miss_install_handshake_reaches_established() {
    let h = Harness::new(FlowTableConfig::default());
    let key = tcp_key(8, 43000);

    // Packet path: miss, then create state from the same SYN
    assert!(h.table.lookup(&key, &SYN).is_none());
    {
        let handle = h.table.install(key, &SYN, TrackKind::KeepState, OWNER).unwrap();
        assert_eq!(handle.direction(), Direction::Forward);
        assert_eq!(handle.record().packets(Direction::Forward), 1);
        assert_eq!(handle.record().bytes(Direction::Forward), 60);
    }
    assert_eq!(h.table.export()[0].phase, Some(TcpPhase::Opening));

    h.send(&key.reversed(), TcpFlags::SYN | TcpFlags::ACK, 1001);
    assert_eq!(h.table.export()[0].phase, Some(TcpPhase::Established));
    h.send(&key, TcpFlags::ACK, 5001);
    h.send(&key.reversed(), TcpFlags::ACK, 1001);

    let flow = &h.table.export()[0];
    assert_eq!(flow.phase, Some(TcpPhase::Established));
    assert_eq!(flow.expires_in_ms, 300_000);
    assert_eq!(flow.packets_fwd, 2);
    assert_eq!(flow.packets_rev, 2);
}

#[test]
fn test_install_from_ack_is_not_opening() {
    let h = Harness::new(FlowTableConfig::default());
    let key = tcp_key(9, 44000);

    // Mid-stream pickup: no tracked flags, so only the short idle lifetime
    let ack = PacketInfo::tcp(TcpFlags::ACK, 7, 52);
    drop(h.table.install(key, &ack, TrackKind::KeepState, OWNER).unwrap());
    let flow = &h.table.export()[0];
    assert_eq!(flow.phase, Some(TcpPhase::Idle));
    assert_eq!(flow.expires_in_ms, 1_000);
    assert_eq!(flow.bytes_fwd, 52);
}

#[test]
fn test_tcp_lifetime_transitions() {
    let h = Harness::new(FlowTableConfig::default());
    let key = tcp_key(3, 40000);
    drop(h.table.install(key, &SYN, TrackKind::KeepState, OWNER).unwrap());
    let expiry = || h.table.export()[0].expires_in_ms;

    // Installed from a SYN: opening, 20s
    assert_eq!(expiry(), 20_000);
    assert_eq!(h.table.export()[0].phase, Some(TcpPhase::Opening));

    // SYN/ACK two seconds later: established, deadline unchanged
    h.advance_secs(2);
    h.send(&key.reversed(), TcpFlags::SYN | TcpFlags::ACK, 1001);
    assert_eq!(expiry(), 18_000);
    assert_eq!(h.table.export()[0].phase, Some(TcpPhase::Established));

    // ACK completes fresh acks in both directions: 300s
    h.advance_secs(1);
    h.send(&key, TcpFlags::ACK, 5001);
    assert_eq!(expiry(), 300_000);

    // A repeated ack is not progress
    h.advance_secs(10);
    h.send(&key.reversed(), TcpFlags::ACK, 1001);
    h.send(&key, TcpFlags::ACK, 5001);
    assert_eq!(expiry(), 290_000);

    // FINs: closing, 1s
    h.send(&key, TcpFlags::FIN | TcpFlags::ACK, 5001);
    assert_eq!(expiry(), 1_000);
    assert_eq!(h.table.export()[0].phase, Some(TcpPhase::Closing));
    h.send(&key.reversed(), TcpFlags::FIN | TcpFlags::ACK, 1002);
    assert_eq!(expiry(), 1_000);

    // Gone after a sweep past one second
    h.advance_secs(2);
    assert!(h.table.lookup(&key, &PacketInfo::tcp(TcpFlags::ACK, 1003, 40)).is_none());
    let report = h.table.run_maintenance();
    assert_eq!(report.expired, 1);
    assert!(h.table.is_empty());
}

#[test]
fn test_rst_shortens_lifetime() {
    let h = Harness::new(FlowTableConfig::default());
    let key = tcp_key(4, 40000);
    h.establish(key, OWNER);

    h.send(&key.reversed(), TcpFlags::RST, 0);
    let flow = &h.table.export()[0];
    assert_eq!(flow.phase, Some(TcpPhase::Reset));
    assert_eq!(flow.expires_in_ms, 1_000);
}

#[test]
fn test_udp_and_other_lifetimes() {
    let h = Harness::new(FlowTableConfig::default());
    let udp = FlowKey::udp(addr(5, 5353), addr(254, 53));
    let icmp = FlowKey::new(IpProtocol::Icmp, addr(5, 0), addr(254, 0));

    drop(h.table.install(udp, &DATAGRAM, TrackKind::KeepState, OWNER).unwrap());
    drop(h.table.install(icmp, &DATAGRAM, TrackKind::KeepState, OWNER).unwrap());

    h.advance_secs(4);
    drop(h.table.lookup(&udp.reversed(), &PacketInfo::other(512)));
    drop(h.table.lookup(&icmp, &PacketInfo::other(84)));

    let flows = h.table.export();
    let udp_flow = flows.iter().find(|f| f.protocol == 17).unwrap();
    let icmp_flow = flows.iter().find(|f| f.protocol == 1).unwrap();
    assert_eq!(udp_flow.expires_in_ms, 10_000);
    assert_eq!(udp_flow.bytes_rev, 512);
    assert_eq!(udp_flow.phase, None);
    assert_eq!(icmp_flow.expires_in_ms, 5_000);

    h.advance_secs(6);
    assert_eq!(h.table.run_maintenance().expired, 1);
    assert!(h.table.lookup(&udp, &PacketInfo::other(1)).is_some());
}

#[test]
fn test_keepalive_probes_quiet_flow() {
    let h = Harness::new(FlowTableConfig::default());
    let key = tcp_key(6, 41000);
    h.establish(key, OWNER);
    h.table.run_maintenance();
    assert!(h.sink.is_empty());

    // 300s lifetime: not close enough to expiry yet
    h.advance_secs(5);
    let report = h.table.run_maintenance();
    assert!(report.keepalive_pass);
    assert_eq!(report.probes, 0);

    // Within the 20s keepalive window
    h.advance_secs(285);
    let report = h.table.run_maintenance();
    assert!(report.keepalive_pass);
    assert_eq!(report.probes, 2);

    let segments = h.sink.take();
    assert!(segments.iter().all(|s| s.key == key));
    let probe = segments.iter().find(|s| s.flags == TcpFlags::SYN).unwrap();
    // Sequence one behind what the peer acknowledged
    assert_eq!(probe.seq, 1000);
    assert_eq!(probe.ack, 5001);
    assert_eq!(h.table.stats().probes_requested(), 2);

    // The peer answers both probes with fresh acks: full refresh
    h.send(&key.reversed(), TcpFlags::ACK, 1500);
    h.send(&key, TcpFlags::ACK, 5500);
    assert_eq!(h.table.export()[0].expires_in_ms, 300_000);
}

#[test]
fn test_expired_record_is_replaced_on_install() {
    let h = Harness::new(FlowTableConfig::default());
    let key = tcp_key(7, 42000);
    drop(h.table.install(key, &SYN, TrackKind::KeepState, OWNER).unwrap());

    h.advance_secs(21);
    let owner = RuleRef::new(2000, 0);
    let handle = h.table.install(key, &SYN, TrackKind::KeepState, owner).unwrap();
    assert_eq!(handle.owner(), owner);
    drop(handle);
    assert_eq!(h.table.len(), 1);
}
