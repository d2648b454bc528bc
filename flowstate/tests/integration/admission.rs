//! Admission control through limit groups

use flowstate::config::FlowTableConfig;
use flowstate::flow::{LimitMask, LimitSpec, PacketInfo, RecordKind, RuleRef, TcpFlags, TrackKind};
use flowstate::{FlowSnapshot, InstallError};

use super::{tcp_key, Harness, SYN};

const OWNER: RuleRef = RuleRef::new(700, 0);

fn limit(n: u32) -> TrackKind {
    TrackKind::Limit(LimitSpec::new(LimitMask::SRC_ADDR, n))
}

fn parents(flows: &[FlowSnapshot]) -> Vec<&FlowSnapshot> {
    flows.iter().filter(|f| f.kind == RecordKind::LimitParent).collect()
}

#[test]
fn test_third_flow_rejected_fourth_admitted_after_expiry() {
    let h = Harness::new(FlowTableConfig::default());

    drop(h.table.install(tcp_key(1, 1001), &SYN, limit(2), OWNER).unwrap());
    drop(h.table.install(tcp_key(1, 1002), &SYN, limit(2), OWNER).unwrap());

    let err = h.table.install(tcp_key(1, 1003), &SYN, limit(2), OWNER).unwrap_err();
    assert_eq!(err, InstallError::LimitExceeded { limit: 2 });
    assert!(err.is_recoverable());
    assert_eq!(h.table.stats().rejected_limit(), 1);
    // Two children plus their parent, nothing from the rejected flow
    assert_eq!(h.table.len(), 3);

    // Keep the second flow alive, let the first run out
    h.advance_secs(10);
    drop(h.table.lookup(&tcp_key(1, 1002), &PacketInfo::tcp(TcpFlags::SYN, 0, 60)));
    h.advance_secs(11);

    // Expired but not yet swept: the slot is still taken
    assert!(h.table.install(tcp_key(1, 1004), &SYN, limit(2), OWNER).is_err());

    let report = h.table.run_maintenance();
    assert_eq!(report.expired, 1);
    assert_eq!(report.parents_reclaimed, 0);

    let handle = h.table.install(tcp_key(1, 1004), &SYN, limit(2), OWNER).unwrap();
    assert_eq!(handle.kind(), RecordKind::LimitChild);
    assert_eq!(handle.record().group().map(|g| g.child_count()), Some(2));
}

#[test]
fn test_groups_are_per_masked_key_and_owner() {
    let h = Harness::new(FlowTableConfig::default());

    drop(h.table.install(tcp_key(1, 2001), &SYN, limit(1), OWNER).unwrap());
    // Different source address: separate group
    drop(h.table.install(tcp_key(2, 2001), &SYN, limit(1), OWNER).unwrap());
    // Same source, different rule: separate group
    drop(h.table.install(tcp_key(1, 2002), &SYN, limit(1), RuleRef::new(701, 0)).unwrap());
    // Same source and rule: full
    assert!(h.table.install(tcp_key(1, 2003), &SYN, limit(1), OWNER).is_err());

    let flows = h.table.export();
    let groups = parents(&flows);
    assert_eq!(groups.len(), 3);
    assert!(groups.iter().all(|g| g.child_count == Some(1) && g.limit == Some(1)));
}

#[test]
fn test_reinstall_of_existing_child_does_not_consume_a_slot() {
    let h = Harness::new(FlowTableConfig::default());
    let key = tcp_key(3, 3001);

    drop(h.table.install(key, &SYN, limit(1), OWNER).unwrap());
    let handle = h.table.install(key.reversed(), &SYN, limit(1), OWNER).unwrap();
    assert_eq!(handle.record().group().map(|g| g.child_count()), Some(1));
    drop(handle);
    assert_eq!(h.table.len(), 2);
}

#[test]
fn test_parent_reclaimed_once_unused() {
    let h = Harness::new(FlowTableConfig::default());
    drop(h.table.install(tcp_key(4, 4001), &SYN, limit(3), OWNER).unwrap());
    drop(h.table.install(tcp_key(4, 4002), &SYN, limit(3), OWNER).unwrap());

    h.advance_secs(21);
    let report = h.table.run_maintenance();
    assert_eq!(report.expired, 2);
    assert_eq!(report.parents_reclaimed, 1);
    assert!(h.table.is_empty());

    // A new flow recreates the group from scratch
    drop(h.table.install(tcp_key(4, 4003), &SYN, limit(3), OWNER).unwrap());
    let flows = h.table.export();
    assert_eq!(parents(&flows)[0].child_count, Some(1));
}

#[test]
fn test_parents_are_invisible_to_lookup() {
    let h = Harness::new(FlowTableConfig::default());
    let all = TrackKind::Limit(LimitSpec::new(LimitMask::all(), 5));
    let key = tcp_key(5, 5001);
    drop(h.table.install(key, &SYN, all, OWNER).unwrap());
    h.table.flush();

    // The parent's key equals the flow key under a full mask
    assert_eq!(h.table.len(), 1);
    assert!(h.table.lookup(&key, &PacketInfo::other(0)).is_none());
}

#[test]
fn test_capacity_counts_parents() {
    let h = Harness::new(FlowTableConfig::default().with_max_records(2));
    drop(h.table.install(tcp_key(6, 6001), &SYN, limit(5), OWNER).unwrap());

    let err = h.table.install(tcp_key(6, 6002), &SYN, limit(5), OWNER).unwrap_err();
    assert_eq!(err, InstallError::OutOfCapacity { max: 2 });

    // The admitted slot was handed back
    let flows = h.table.export();
    assert_eq!(parents(&flows)[0].child_count, Some(1));
}
