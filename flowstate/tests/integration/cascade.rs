//! Cascading deletion by owner

use flowstate::config::FlowTableConfig;
use flowstate::flow::{
    Direction, LimitMask, LimitSpec, PacketInfo, RecordKind, RuleId, RuleRef, SetId, TcpFlags, TrackKind,
};

use super::{tcp_key, Harness, SYN};

const WEB: RuleRef = RuleRef::new(10, 1);
const SSH: RuleRef = RuleRef::new(20, 1);
const DNS: RuleRef = RuleRef::new(30, 2);

fn limited(n: u32) -> TrackKind {
    TrackKind::Limit(LimitSpec::new(LimitMask::SRC_ADDR, n))
}

fn populate(h: &Harness) {
    for port in 0..4 {
        drop(h.table.install(tcp_key(1, 1000 + port), &SYN, TrackKind::KeepState, WEB).unwrap());
        drop(h.table.install(tcp_key(2, 2000 + port), &SYN, TrackKind::KeepState, SSH).unwrap());
        drop(h.table.install(tcp_key(3, 3000 + port), &SYN, TrackKind::KeepState, DNS).unwrap());
    }
}

fn owners(h: &Harness) -> Vec<RuleRef> {
    h.table.export().into_iter().map(|f| f.owner).collect()
}

#[test]
fn test_rule_cascade_removes_only_that_rule() {
    let h = Harness::new(FlowTableConfig::default());
    populate(&h);

    assert_eq!(h.table.expire_owned_by(RuleId(10)), 4);
    assert_eq!(h.table.len(), 8);
    assert!(owners(&h).iter().all(|o| *o != WEB));
    assert!(h.table.lookup(&tcp_key(1, 1000), &PacketInfo::other(0)).is_none());
    assert!(h.table.lookup(&tcp_key(2, 2000), &PacketInfo::other(0)).is_some());

    // Nothing left for the rule
    assert_eq!(h.table.expire_owned_by(RuleId(10)), 0);
    assert_eq!(h.table.stats().cascaded(), 4);
}

#[test]
fn test_set_cascade_removes_every_member_rule() {
    let h = Harness::new(FlowTableConfig::default());
    populate(&h);

    assert_eq!(h.table.expire_owned_by_set(SetId(1)), 8);
    assert_eq!(owners(&h), vec![DNS; 4]);
}

#[test]
fn test_cascade_leaves_parent_for_next_sweep() {
    let h = Harness::new(FlowTableConfig::default());
    drop(h.table.install(tcp_key(4, 4000), &SYN, limited(2), WEB).unwrap());
    drop(h.table.install(tcp_key(4, 4001), &SYN, limited(2), WEB).unwrap());
    drop(h.table.install(tcp_key(5, 5000), &SYN, limited(2), SSH).unwrap());

    assert_eq!(h.table.expire_owned_by(RuleId(10)), 2);
    let flows = h.table.export();
    let web_parent = flows
        .iter()
        .find(|f| f.owner == WEB)
        .expect("parent outlives its children");
    assert_eq!(web_parent.kind, RecordKind::LimitParent);
    assert_eq!(web_parent.child_count, Some(0));

    let report = h.table.run_maintenance();
    assert_eq!(report.parents_reclaimed, 1);
    assert_eq!(report.cascaded, 0);
    assert!(owners(&h).iter().all(|o| *o == SSH));
    assert_eq!(h.table.len(), 2);
}

#[test]
fn test_flows_installed_after_cascade_survive() {
    let h = Harness::new(FlowTableConfig::default());
    populate(&h);
    h.table.expire_owned_by(RuleId(10));

    // The rule is re-added and picks up new traffic
    drop(h.table.install(tcp_key(1, 1100), &SYN, TrackKind::KeepState, WEB).unwrap());
    drop(h.table.install(tcp_key(1, 1101), &SYN, limited(1), WEB).unwrap());

    let report = h.table.run_maintenance();
    assert_eq!(report.cascaded, 0);
    assert!(h.table.lookup(&tcp_key(1, 1100), &PacketInfo::other(0)).is_some());
    assert!(h.table.lookup(&tcp_key(1, 1101), &PacketInfo::other(0)).is_some());
    assert_eq!(h.table.len(), 8 + 3);
}

#[test]
fn test_cascade_resets_established_flows() {
    let h = Harness::new(FlowTableConfig::default().with_reset_on_cascade(true));
    let established = tcp_key(6, 6000);
    let opening = tcp_key(6, 6001);
    h.establish(established, WEB);
    drop(h.table.install(opening, &SYN, TrackKind::KeepState, WEB).unwrap());

    assert_eq!(h.table.expire_owned_by(RuleId(10)), 2);

    let segments = h.sink.take();
    assert_eq!(segments.len(), 2);
    assert!(segments.iter().all(|s| s.key == established));
    assert!(segments.iter().all(|s| s.flags == TcpFlags::RST | TcpFlags::ACK));

    let forward = segments.iter().find(|s| s.direction == Direction::Forward).unwrap();
    assert_eq!(forward.seq, 1001);
    assert_eq!(forward.ack, 5001);
    assert_eq!(h.table.stats().resets_requested(), 2);
    assert_eq!(h.table.stats().probes_requested(), 0);
}

#[test]
fn test_cascade_is_silent_without_reset_option() {
    let h = Harness::new(FlowTableConfig::default());
    h.establish(tcp_key(7, 7000), SSH);

    assert_eq!(h.table.expire_owned_by_set(SetId(1)), 1);
    assert!(h.sink.is_empty());
    assert!(h.table.is_empty());
}
