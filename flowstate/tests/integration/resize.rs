//! Bucket array resizing

use flowstate::config::FlowTableConfig;
use flowstate::flow::{FlowKey, LimitMask, LimitSpec, PacketInfo, RuleRef, TrackKind};
use flowstate::InstallError;

use super::{addr, Harness, DATAGRAM};

const OWNER: RuleRef = RuleRef::new(10, 0);

fn spread_key(i: u32) -> FlowKey {
    let [_, _, hi, lo] = i.to_be_bytes();
    FlowKey::udp(addr(hi, 10_000 + u16::from(lo)), addr(254, 53))
}

fn assert_all_present(h: &Harness, count: u32) {
    let buckets = h.table.bucket_count();
    for i in 0..count {
        let key = spread_key(i);
        for probe in [key, key.reversed()] {
            let (handle, _) = h
                .table
                .lookup(&probe, &PacketInfo::other(1))
                .unwrap_or_else(|| panic!("flow {i} lost at {buckets} buckets"));
            let expected = usize::try_from(key.flow_hash() & (buckets as u64 - 1)).unwrap();
            assert_eq!(handle.record().bucket_index(), expected);
        }
    }
}

#[test]
fn test_resize_keeps_every_flow_reachable() {
    const FLOWS: u32 = 10_000;
    let h = Harness::new(
        FlowTableConfig::default()
            .with_buckets(256)
            .with_max_buckets(256),
    );
    for i in 0..FLOWS {
        drop(h.table.install(spread_key(i), &DATAGRAM, TrackKind::KeepState, OWNER).unwrap());
    }
    assert_eq!(h.table.len(), FLOWS as usize);

    h.table.resize(4096).unwrap();
    assert_eq!(h.table.bucket_count(), 4096);
    assert_all_present(&h, FLOWS);

    h.table.resize(16).unwrap();
    assert_eq!(h.table.bucket_count(), 16);
    assert_all_present(&h, FLOWS);

    assert_eq!(h.table.len(), FLOWS as usize);
    assert_eq!(h.table.stats().resizes(), 2);
}

#[test]
fn test_limit_groups_survive_resize() {
    let h = Harness::new(FlowTableConfig::default().with_buckets(4));
    let spec = TrackKind::Limit(LimitSpec::new(LimitMask::SRC_ADDR, 2));
    drop(h.table.install(spread_key(1), &DATAGRAM, spec, OWNER).unwrap());

    h.table.resize(1024).unwrap();
    drop(h.table.install(spread_key(2), &DATAGRAM, spec, OWNER).unwrap());
    assert!(matches!(
        h.table.install(spread_key(3), &DATAGRAM, spec, OWNER),
        Err(InstallError::LimitExceeded { limit: 2 })
    ));
    assert_eq!(h.table.len(), 3);
}

#[test]
fn test_maintenance_grows_crowded_table() {
    let h = Harness::new(
        FlowTableConfig::default()
            .with_buckets(8)
            .with_max_buckets(64),
    );
    for i in 0..100 {
        drop(h.table.install(spread_key(i), &DATAGRAM, TrackKind::KeepState, OWNER).unwrap());
    }

    let report = h.table.run_maintenance();
    assert_eq!(report.resized_to, Some(64));
    assert_eq!(h.table.bucket_count(), 64);
    assert_all_present(&h, 100);

    // At the ceiling: no further growth
    for i in 100..300 {
        drop(h.table.install(spread_key(i), &DATAGRAM, TrackKind::KeepState, OWNER).unwrap());
    }
    assert_eq!(h.table.run_maintenance().resized_to, None);
    assert_eq!(h.table.bucket_count(), 64);
}

#[test]
fn test_sparse_table_is_not_grown() {
    let h = Harness::new(FlowTableConfig::default().with_buckets(16));
    for i in 0..32 {
        drop(h.table.install(spread_key(i), &DATAGRAM, TrackKind::KeepState, OWNER).unwrap());
    }
    assert_eq!(h.table.run_maintenance().resized_to, None);
    assert_eq!(h.table.bucket_count(), 16);
}

#[test]
fn test_invalid_bucket_counts_rejected() {
    let h = Harness::new(FlowTableConfig::default());
    for bad in [0, 3, 1000, 1 << 17] {
        assert_eq!(h.table.resize(bad), Err(InstallError::InvalidBucketCount(bad)));
    }
    assert_eq!(h.table.bucket_count(), 256);
    assert_eq!(h.table.stats().resizes(), 0);

    // Resizing to the current count is a no-op
    h.table.resize(256).unwrap();
    assert_eq!(h.table.stats().resizes(), 0);
}

#[test]
fn test_maintenance_grows_default_table() {
    const FLOWS: u32 = 10_000;
    let h = Harness::new(FlowTableConfig::default());
    for i in 0..FLOWS {
        drop(h.table.install(spread_key(i), &DATAGRAM, TrackKind::KeepState, OWNER).unwrap());
    }
    assert_eq!(h.table.bucket_count(), 256);

    let report = h.table.run_maintenance();
    assert!(report.resized_to.is_some());
    assert_eq!(report.resized_to, Some(8192));
    assert_eq!(h.table.bucket_count(), 8192);
    assert_eq!(h.table.len(), FLOWS as usize);
    assert_all_present(&h, FLOWS);
}
