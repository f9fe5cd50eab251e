// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

use consus_config::{
    local_cluster, partition_for, replica_sets_agree, CommId, MemberState, KVS_PARTITIONS,
};

#[test]
fn cluster_builder() {
    // GIVEN a three data center deployment
    let cluster = local_cluster(3, 5, 3);

    // THEN every data center got one group of five and three stores.
    assert_eq!(cluster.config.data_centers.len(), 3);
    assert_eq!(cluster.config.groups.len(), 3);
    for group in &cluster.config.groups {
        assert_eq!(group.size(), 5);
        assert_eq!(group.quorum(), 3);
    }
    for stores in &cluster.kvs_ids {
        assert_eq!(stores.len(), 3);
    }

    // AND group membership lookups line up with the allocated ids.
    for (group, ids) in cluster.config.groups.iter().zip(&cluster.txman_ids) {
        for (idx, id) in ids.iter().enumerate() {
            assert_eq!(group.index(*id), Some(idx));
            assert!(cluster.config.is_member(group.id, *id));
        }
    }
}

#[test]
fn hashing_is_consistent_across_views() {
    let cluster = local_cluster(4, 3, 1);
    let dc = cluster.config.data_centers[0].id;

    let a = cluster.config.hash(dc, b"accounts", b"alice").unwrap();
    let b = cluster.config.hash(dc, b"accounts", b"alice").unwrap();
    assert_eq!(a, b);
    for target in &a.replicas {
        assert!(replica_sets_agree(*target, &a, &b));
    }
    assert!(!replica_sets_agree(CommId::new(4242), &a, &b));

    let partition = partition_for(b"accounts", b"alice");
    assert!((partition.value() as usize) < KVS_PARTITIONS);
}

#[test]
fn offline_stores_are_not_chosen() {
    let mut cluster = local_cluster(2, 3, 1);
    let dc = cluster.config.data_centers[0].id;
    let first = cluster.kvs_ids[0][0];
    cluster
        .config
        .kvss
        .iter_mut()
        .find(|k| k.id == first)
        .unwrap()
        .state = MemberState::Offline;
    assert_eq!(cluster.config.choose_kvs(dc), Some(cluster.kvs_ids[0][1]));
}
