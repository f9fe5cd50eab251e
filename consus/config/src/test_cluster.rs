// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    ClusterConfig, ClusterId, CommId, DataCenter, DataCenterId, Kvs, MemberState, PaxosGroup,
    PaxosGroupId, Ring, Txman, VersionId,
};

/// A locally built cluster snapshot plus the id ranges it allocated, for
/// in-process test deployments.
pub struct LocalCluster {
    pub config: ClusterConfig,
    /// Transaction manager ids, grouped per paxos group in group order.
    pub txman_ids: Vec<Vec<CommId>>,
    /// Key-value store ids per data center in data-center order.
    pub kvs_ids: Vec<Vec<CommId>>,
}

/// Creates a cluster snapshot for local testing: `dcs` data centers, one
/// paxos group of `members_per_group` transaction managers per data center,
/// and `kvs_per_dc` key-value stores per data center, all ONLINE.
///
/// Ids are allocated deterministically: transaction managers from 101 upward,
/// key-value stores from 1001 upward.
pub fn local_cluster(kvs_per_dc: usize, members_per_group: usize, dcs: usize) -> LocalCluster {
    assert!(dcs >= 1);
    let mut next_txman = 101u64;
    let mut next_kvs = 1001u64;
    let mut data_centers = Vec::new();
    let mut txmans = Vec::new();
    let mut groups = Vec::new();
    let mut kvss = Vec::new();
    let mut rings = Vec::new();
    let mut txman_ids = Vec::new();
    let mut kvs_ids = Vec::new();

    for d in 0..dcs {
        let dc = DataCenterId::new(d as u64 + 1);
        data_centers.push(DataCenter {
            id: dc,
            name: format!("dc{}", d + 1),
        });

        let mut members = Vec::new();
        for _ in 0..members_per_group {
            let id = CommId::new(next_txman);
            next_txman += 1;
            members.push(id);
            txmans.push(Txman {
                id,
                dc,
                state: MemberState::Online,
            });
        }
        groups.push(PaxosGroup::new(
            PaxosGroupId::new(d as u64 + 1),
            dc,
            members.clone(),
        ));
        txman_ids.push(members);

        let mut stores = Vec::new();
        for _ in 0..kvs_per_dc {
            let id = CommId::new(next_kvs);
            next_kvs += 1;
            stores.push(id);
            kvss.push(Kvs {
                id,
                dc,
                state: MemberState::Online,
            });
        }
        let replication = stores.len().min(3).max(1);
        rings.push(Ring::new(dc, replication, &stores));
        kvs_ids.push(stores);
    }

    LocalCluster {
        config: ClusterConfig {
            cluster: ClusterId::new(1),
            version: VersionId::new(1),
            data_centers,
            txmans,
            groups,
            kvss,
            rings,
        },
        txman_ids,
        kvs_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_cluster_allocates_disjoint_ids() {
        let cluster = local_cluster(2, 3, 2);
        assert_eq!(cluster.config.groups.len(), 2);
        assert_eq!(cluster.config.txmans.len(), 6);
        assert_eq!(cluster.config.kvss.len(), 4);
        for group in &cluster.config.groups {
            for member in &group.members {
                assert!(cluster.config.kvs_state(*member).is_none());
                assert_eq!(
                    cluster.config.txman_state(*member),
                    Some(MemberState::Online)
                );
            }
        }
    }
}
