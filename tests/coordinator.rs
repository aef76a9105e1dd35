use std::sync::Arc;
use std::time::Duration;

use pixy_coordinator::coordinator::{Coordinator, GroupIdentity};
use pixy_coordinator::store::testing::MemoryStore;
use pixy_coordinator::store::Store;

fn identity(member_id: &str) -> GroupIdentity {
    GroupIdentity {
        cluster: "it-cluster".to_string(),
        group: "orders".to_string(),
        member_id: member_id.to_string(),
    }
}

/// End-to-end: two members join the same group, each claims a disjoint
/// partition, and the snapshot seen by both reflects the full
/// membership before either claim is attempted, mirroring a consumer
/// that waits for a stable view before starting to own partitions.
#[tokio::test]
async fn two_members_join_and_claim_disjoint_partitions() {
    let store = Arc::new(MemoryStore::new());
    let retry_backoff = Duration::from_millis(10);
    let rebalance_delay = Duration::from_millis(20);

    let mut coord_a = Coordinator::spawn(
        identity("m1"),
        Arc::clone(&store) as Arc<dyn Store>,
        retry_backoff,
        rebalance_delay,
    );
    let mut coord_b = Coordinator::spawn(
        identity("m2"),
        Arc::clone(&store) as Arc<dyn Store>,
        retry_backoff,
        rebalance_delay,
    );

    coord_a.submit(vec!["orders.created".to_string()]);
    coord_b.submit(vec!["orders.created".to_string()]);

    let snapshot_a = wait_for_full_membership(&mut coord_a, 2).await;
    let snapshot_b = wait_for_full_membership(&mut coord_b, 2).await;

    assert_eq!(snapshot_a.len(), 2);
    assert_eq!(snapshot_b.len(), 2);

    let (_c1_tx, c1_rx) = tokio::sync::oneshot::channel();
    let (_c2_tx, c2_rx) = tokio::sync::oneshot::channel();

    let release_a = coord_a.claim_partition("orders.created", 0, c1_rx).await;
    let release_b = coord_a.claim_partition("orders.created", 1, c2_rx).await;

    assert!(store.is_claimed("orders", "orders.created", 0));
    assert!(store.is_claimed("orders", "orders.created", 1));

    release_a.release().await;
    release_b.release().await;

    coord_a.stop().await;
    coord_b.stop().await;
}

/// After `stop`, the member's registration is gone and no further
/// snapshots are delivered, even if a peer changes its subscriptions
/// afterward.
#[tokio::test]
async fn stop_leaves_no_registration_and_quiesces_the_channel() {
    let store = Arc::new(MemoryStore::new());
    let retry_backoff = Duration::from_millis(10);
    let rebalance_delay = Duration::from_millis(20);

    let mut coord = Coordinator::spawn(
        identity("m1"),
        Arc::clone(&store) as Arc<dyn Store>,
        retry_backoff,
        rebalance_delay,
    );

    coord.submit(vec!["orders.created".to_string()]);
    let _ = coord.subscriptions().recv().await.unwrap();

    coord.stop().await;

    assert!(!store.has_member("orders", "m1"));
    assert_eq!(coord.subscriptions().recv().await, None);

    store.put_member("orders", "m2", vec!["orders.created".to_string()]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coord.subscriptions().recv().await, None);
}

async fn wait_for_full_membership(
    coord: &mut Coordinator,
    expected_members: usize,
) -> pixy_coordinator::topic::GroupSnapshot {
    loop {
        let snapshot = coord.subscriptions().recv().await.unwrap();
        if snapshot.len() >= expected_members {
            return snapshot;
        }
    }
}
