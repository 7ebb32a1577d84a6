use berylmgr::core::catalog::{CureStatus, NodeRole, NodeRow, SyncState};
use berylmgr::core::standby::plan_sync_standby;
use berylmgr::core::wal::WalLsn;
use proptest::prelude::*;

fn slave(id: u64, name: &str, sync: SyncState, in_cluster: bool) -> NodeRow {
    NodeRow {
        id,
        name: name.to_string(),
        host: 1,
        port: 5432 + id as u16,
        role: NodeRole::DatanodeSlave,
        master_id: Some(100),
        sync_state: sync,
        path: format!("/data/{name}"),
        inited: true,
        in_cluster,
        allow_cure: true,
        cure_status: CureStatus::Normal,
    }
}

#[test]
fn sync_members_come_first_then_potentials() {
    let slaves = vec![
        slave(1, "dn1s", SyncState::Sync, true),
        slave(2, "dn1p", SyncState::Potential, true),
    ];
    let plan = plan_sync_standby(&slaves, None, None);
    assert_eq!(plan.value, "1 (dn1s, dn1p)");
    assert!(plan.upgrades.is_empty());
    assert!(plan.warning.is_none());
}

#[test]
fn async_slaves_never_appear() {
    let slaves = vec![
        slave(1, "dn1s", SyncState::Sync, true),
        slave(2, "dn1a", SyncState::Async, true),
    ];
    let plan = plan_sync_standby(&slaves, None, None);
    assert_eq!(plan.value, "1 (dn1s)");
}

#[test]
fn empty_set_yields_empty_value_and_warning() {
    let plan = plan_sync_standby(&[], None, None);
    assert_eq!(plan.value, "");
    assert!(plan.warning.is_some());
}

#[test]
fn all_async_warns_but_proceeds() {
    let slaves = vec![slave(1, "dn1a", SyncState::Async, true)];
    let plan = plan_sync_standby(&slaves, None, None);
    assert_eq!(plan.value, "");
    assert!(plan.warning.unwrap().contains("async"));
}

#[test]
fn potential_is_promoted_when_no_sync_member_remains() {
    let slaves = vec![slave(2, "dn1p", SyncState::Potential, true)];
    let plan = plan_sync_standby(&slaves, None, None);
    assert_eq!(plan.value, "1 (dn1p)");
    assert_eq!(plan.upgrades, vec![2]);
    assert!(!plan.notices.is_empty());
}

#[test]
fn promotion_prefers_in_cluster_then_scan_order() {
    let slaves = vec![
        slave(1, "out", SyncState::Potential, false),
        slave(2, "in_b", SyncState::Potential, true),
        slave(3, "in_a", SyncState::Potential, true),
    ];
    // The out-of-cluster slave is not a member at all; among the in-cluster
    // potentials, the lowest id wins.
    let plan = plan_sync_standby(&slaves, None, None);
    assert_eq!(plan.upgrades, vec![2]);
    assert_eq!(plan.value, "1 (in_b, in_a)");
}

#[test]
fn newly_added_potential_is_silently_upgraded() {
    let slaves = vec![slave(5, "dn1p", SyncState::Potential, false)];
    let plan = plan_sync_standby(&slaves, None, Some(5));
    assert_eq!(plan.upgrades, vec![5]);
    assert_eq!(plan.value, "1 (dn1p)");
    assert!(plan.notices[0].contains("upgraded"));
}

#[test]
fn newly_added_joins_an_existing_sync_list() {
    let slaves = vec![
        slave(1, "dn1s", SyncState::Sync, true),
        slave(5, "dn1p", SyncState::Potential, false),
    ];
    let plan = plan_sync_standby(&slaves, None, Some(5));
    assert_eq!(plan.value, "1 (dn1s, dn1p)");
    assert!(plan.upgrades.is_empty());
}

#[test]
fn exclusion_drops_the_named_slave() {
    let slaves = vec![
        slave(1, "dn1s", SyncState::Sync, true),
        slave(2, "dn1p", SyncState::Potential, true),
    ];
    let plan = plan_sync_standby(&slaves, Some(1), None);
    assert_eq!(plan.value, "1 (dn1p)");
    assert_eq!(plan.upgrades, vec![2]);
}

#[test]
fn wal_lsn_parses_and_orders() {
    let a: WalLsn = "0/3000000".parse().unwrap();
    let b: WalLsn = "0/5000000".parse().unwrap();
    let c: WalLsn = "1/0".parse().unwrap();
    assert!(a < b);
    assert!(b < c);
    assert_eq!(c.0, 1u64 << 32);
    assert!(!WalLsn::ZERO.is_valid());
    assert!(a.is_valid());
    assert_eq!(b.to_string(), "0/5000000");
    assert!("nonsense".parse::<WalLsn>().is_err());
}

proptest! {
    /// The parameter string is canonical: any permutation of the scan
    /// order produces byte-identical output.
    #[test]
    fn sync_list_is_scan_order_independent(permutation in Just(vec![
        (1u64, "s1", SyncState::Sync, true),
        (2, "s2", SyncState::Sync, true),
        (3, "p1", SyncState::Potential, true),
        (4, "p2", SyncState::Potential, false),
        (5, "a1", SyncState::Async, true),
        (6, "p3", SyncState::Potential, true),
    ]).prop_shuffle()) {
        let reference: Vec<NodeRow> = vec![
            slave(1, "s1", SyncState::Sync, true),
            slave(2, "s2", SyncState::Sync, true),
            slave(3, "p1", SyncState::Potential, true),
            slave(4, "p2", SyncState::Potential, false),
            slave(5, "a1", SyncState::Async, true),
            slave(6, "p3", SyncState::Potential, true),
        ];
        let shuffled: Vec<NodeRow> = permutation
            .into_iter()
            .map(|(id, name, sync, in_cluster)| slave(id, name, sync, in_cluster))
            .collect();
        let expected = plan_sync_standby(&reference, None, None);
        let got = plan_sync_standby(&shuffled, None, None);
        prop_assert_eq!(expected.value, got.value);
        prop_assert_eq!(expected.upgrades, got.upgrades);
    }
}
