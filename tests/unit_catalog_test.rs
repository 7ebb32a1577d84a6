use berylmgr::core::catalog::{
    Catalog, CureStatus, HostRow, NodePredicate, NodeRole, NodeRow, SyncState,
};
use berylmgr::core::errors::BerylMgrError;

fn host(name: &str) -> HostRow {
    HostRow {
        id: 0,
        name: name.to_string(),
        address: "127.0.0.1".to_string(),
        agent_port: 8432,
        os_user: "beryl".to_string(),
    }
}

fn node(name: &str, host: u64, port: u16, role: NodeRole, master: Option<u64>) -> NodeRow {
    NodeRow {
        id: 0,
        name: name.to_string(),
        host,
        port,
        role,
        master_id: master,
        sync_state: if role.is_slave() {
            SyncState::Sync
        } else {
            SyncState::None
        },
        path: format!("/data/{name}"),
        inited: true,
        in_cluster: true,
        allow_cure: true,
        cure_status: CureStatus::Normal,
    }
}

#[tokio::test]
async fn insert_assigns_ids_and_scan_is_id_ordered() {
    let catalog = Catalog::new();
    let mut txn = catalog.begin().await;
    let h = txn.insert_host(host("h1")).unwrap();
    let m = txn
        .insert(node("dn1", h, 5432, NodeRole::DatanodeMaster, None))
        .unwrap();
    let s1 = txn
        .insert(node("dn1s", h, 5433, NodeRole::DatanodeSlave, Some(m)))
        .unwrap();
    let s2 = txn
        .insert(node("dn1p", h, 5434, NodeRole::DatanodeSlave, Some(m)))
        .unwrap();
    assert!(m < s1 && s1 < s2);

    let slaves = txn.slaves_of(m);
    assert_eq!(
        slaves.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![s1, s2]
    );
    txn.commit();
}

#[tokio::test]
async fn location_uniqueness_is_enforced() {
    let catalog = Catalog::new();
    let mut txn = catalog.begin().await;
    let h = txn.insert_host(host("h1")).unwrap();
    txn.insert(node("dn1", h, 5432, NodeRole::DatanodeMaster, None))
        .unwrap();

    // Same (host, port).
    let mut dup = node("dn2", h, 5432, NodeRole::DatanodeMaster, None);
    dup.path = "/data/other".to_string();
    assert!(matches!(
        txn.insert(dup),
        Err(BerylMgrError::InvariantViolation(_))
    ));

    // Same (host, path).
    let mut dup = node("dn3", h, 5999, NodeRole::DatanodeMaster, None);
    dup.path = "/data/dn1".to_string();
    assert!(matches!(
        txn.insert(dup),
        Err(BerylMgrError::InvariantViolation(_))
    ));
    txn.abort();
}

#[tokio::test]
async fn a_slave_may_never_follow_another_slave() {
    let catalog = Catalog::new();
    let mut txn = catalog.begin().await;
    let h = txn.insert_host(host("h1")).unwrap();
    let m = txn
        .insert(node("dn1", h, 5432, NodeRole::DatanodeMaster, None))
        .unwrap();
    let s = txn
        .insert(node("dn1s", h, 5433, NodeRole::DatanodeSlave, Some(m)))
        .unwrap();

    let grand = node("dn1ss", h, 5434, NodeRole::DatanodeSlave, Some(s));
    assert!(matches!(
        txn.insert(grand),
        Err(BerylMgrError::InvariantViolation(_))
    ));
    txn.abort();
}

#[tokio::test]
async fn slave_families_must_match() {
    let catalog = Catalog::new();
    let mut txn = catalog.begin().await;
    let h = txn.insert_host(host("h1")).unwrap();
    let gtm = txn
        .insert(node("gtm1", h, 6666, NodeRole::GtmMaster, None))
        .unwrap();
    let wrong = node("dn1s", h, 5433, NodeRole::DatanodeSlave, Some(gtm));
    assert!(matches!(
        txn.insert(wrong),
        Err(BerylMgrError::InvariantViolation(_))
    ));
    txn.abort();
}

#[tokio::test]
async fn abort_discards_all_writes() {
    let catalog = Catalog::new();
    {
        let mut txn = catalog.begin().await;
        let h = txn.insert_host(host("h1")).unwrap();
        txn.insert(node("dn1", h, 5432, NodeRole::DatanodeMaster, None))
            .unwrap();
        txn.abort();
    }
    let (nodes, hosts) = catalog.snapshot().await;
    assert!(nodes.is_empty());
    assert!(hosts.is_empty());
}

#[tokio::test]
async fn cure_status_cas_fails_on_unexpected_state() {
    let catalog = Catalog::new();
    let id = {
        let mut txn = catalog.begin().await;
        let h = txn.insert_host(host("h1")).unwrap();
        let id = txn
            .insert(node("dn1", h, 5432, NodeRole::DatanodeMaster, None))
            .unwrap();
        txn.commit();
        id
    };

    let mut txn = catalog.begin().await;
    assert!(matches!(
        txn.update_cure_status(id, CureStatus::WaitSwitch, CureStatus::Switching),
        Err(BerylMgrError::CatalogConflict(_))
    ));
    txn.update_cure_status(id, CureStatus::Normal, CureStatus::WaitSwitch)
        .unwrap();
    txn.commit();

    let txn = catalog.begin().await;
    assert_eq!(
        txn.select_by_id(id).unwrap().cure_status,
        CureStatus::WaitSwitch
    );
    txn.abort();
}

async fn try_fence(catalog: Catalog, id: u64) -> Result<(), BerylMgrError> {
    let mut txn = catalog.begin().await;
    match txn.update_cure_status(id, CureStatus::WaitSwitch, CureStatus::Switching) {
        Ok(()) => {
            txn.commit();
            Ok(())
        }
        Err(e) => {
            txn.abort();
            Err(e)
        }
    }
}

/// Two workers race the wait-switch fence; exactly one wins and the loser
/// observes a catalog conflict with no side effects.
#[tokio::test]
async fn concurrent_fence_has_exactly_one_winner() {
    let catalog = Catalog::new();
    let id = {
        let mut txn = catalog.begin().await;
        let h = txn.insert_host(host("h1")).unwrap();
        let mut row = node("dn1", h, 5432, NodeRole::DatanodeMaster, None);
        row.cure_status = CureStatus::WaitSwitch;
        let id = txn.insert(row).unwrap();
        txn.commit();
        id
    };

    let a = tokio::spawn(try_fence(catalog.clone(), id));
    let b = tokio::spawn(try_fence(catalog.clone(), id));
    let (ra, rb) = (a.await.unwrap(), b.await.unwrap());

    let winners = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = if ra.is_err() { ra } else { rb };
    assert!(matches!(loser, Err(BerylMgrError::CatalogConflict(_))));

    let txn = catalog.begin().await;
    assert_eq!(
        txn.select_by_id(id).unwrap().cure_status,
        CureStatus::Switching
    );
    txn.abort();
}

#[tokio::test]
async fn predicate_filters_compose() {
    let catalog = Catalog::new();
    let mut txn = catalog.begin().await;
    let h = txn.insert_host(host("h1")).unwrap();
    let m = txn
        .insert(node("dn1", h, 5432, NodeRole::DatanodeMaster, None))
        .unwrap();
    let mut out = node("dn1s", h, 5433, NodeRole::DatanodeSlave, Some(m));
    out.in_cluster = false;
    txn.insert(out).unwrap();
    txn.insert(node("dn1p", h, 5434, NodeRole::DatanodeSlave, Some(m)))
        .unwrap();

    let in_cluster_slaves = txn.select_where(&NodePredicate {
        role: Some(NodeRole::DatanodeSlave),
        in_cluster: Some(true),
        ..NodePredicate::default()
    });
    assert_eq!(in_cluster_slaves.len(), 1);
    assert_eq!(in_cluster_slaves[0].name, "dn1p");
    txn.abort();
}
