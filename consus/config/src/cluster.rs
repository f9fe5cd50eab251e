// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::{
    partition_for, ClusterId, CommId, DataCenterId, PaxosGroupId, ReplicaSet, Ring, VersionId,
    MAX_REPLICATION_FACTOR,
};

/// Lifecycle of a server as tracked by the coordinator. Only ONLINE servers
/// are considered for leadership and message targeting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Registered,
    Online,
    Offline,
}

/// A data center participating in the deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataCenter {
    pub id: DataCenterId,
    pub name: String,
}

/// A transaction manager and its coordinator-assigned state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Txman {
    pub id: CommId,
    pub dc: DataCenterId,
    pub state: MemberState,
}

/// A key-value store node and its coordinator-assigned state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Kvs {
    pub id: CommId,
    pub dc: DataCenterId,
    pub state: MemberState,
}

/// A group of up to nine transaction managers in one data center that jointly
/// own transactions and replicate their operation logs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosGroup {
    pub id: PaxosGroupId,
    pub dc: DataCenterId,
    pub members: Vec<CommId>,
}

impl PaxosGroup {
    pub fn new(id: PaxosGroupId, dc: DataCenterId, members: Vec<CommId>) -> Self {
        assert!(!members.is_empty());
        assert!(members.len() <= MAX_REPLICATION_FACTOR);
        Self { id, dc, members }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Majority threshold over the group's members.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Index of `id` within the group, or None for non-members.
    pub fn index(&self, id: CommId) -> Option<usize> {
        self.members.iter().position(|m| *m == id)
    }
}

/// A versioned snapshot of cluster membership published by the coordinator:
/// data centers, transaction managers and their paxos groups, key-value store
/// nodes and the per-data-center rings.
///
/// Snapshots are immutable; a new configuration epoch is published as a whole
/// new value behind an atomic pointer swap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster: ClusterId,
    pub version: VersionId,
    pub data_centers: Vec<DataCenter>,
    pub txmans: Vec<Txman>,
    pub groups: Vec<PaxosGroup>,
    pub kvss: Vec<Kvs>,
    pub rings: Vec<Ring>,
}

impl ClusterConfig {
    pub fn get_group(&self, id: PaxosGroupId) -> Option<&PaxosGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// All groups `id` is a member of.
    pub fn groups_for(&self, id: CommId) -> Vec<PaxosGroupId> {
        self.groups
            .iter()
            .filter(|g| g.index(id).is_some())
            .map(|g| g.id)
            .collect()
    }

    pub fn is_member(&self, group: PaxosGroupId, id: CommId) -> bool {
        self.get_group(group)
            .map(|g| g.index(id).is_some())
            .unwrap_or(false)
    }

    pub fn txman_state(&self, id: CommId) -> Option<MemberState> {
        self.txmans.iter().find(|t| t.id == id).map(|t| t.state)
    }

    pub fn kvs_state(&self, id: CommId) -> Option<MemberState> {
        self.kvss.iter().find(|k| k.id == id).map(|k| k.state)
    }

    pub fn txman_dc(&self, id: CommId) -> Option<DataCenterId> {
        self.txmans.iter().find(|t| t.id == id).map(|t| t.dc)
    }

    pub fn kvs_dc(&self, id: CommId) -> Option<DataCenterId> {
        self.kvss.iter().find(|k| k.id == id).map(|k| k.dc)
    }

    /// Chooses the set of groups a transaction beginning in `home` solicits
    /// votes from: the home group plus one group in every other data center.
    /// Fails when some data center currently has no group.
    pub fn choose_groups(&self, home: PaxosGroupId) -> Option<Vec<PaxosGroupId>> {
        let home_group = self.get_group(home)?;
        let mut chosen = vec![home];
        for dc in &self.data_centers {
            if dc.id == home_group.dc {
                continue;
            }
            let other = self.groups.iter().find(|g| g.dc == dc.id)?;
            chosen.push(other.id);
        }
        Some(chosen)
    }

    /// The first ONLINE member of `group`, in member-index order.
    pub fn first_alive(&self, group: PaxosGroupId) -> Option<CommId> {
        let g = self.get_group(group)?;
        g.members
            .iter()
            .copied()
            .find(|m| self.txman_state(*m) == Some(MemberState::Online))
    }

    /// Any ONLINE key-value store in `dc`, for use as the initiating replica
    /// of a replicated operation.
    pub fn choose_kvs(&self, dc: DataCenterId) -> Option<CommId> {
        self.kvss
            .iter()
            .find(|k| k.dc == dc && k.state == MemberState::Online)
            .map(|k| k.id)
    }

    pub fn ring(&self, dc: DataCenterId) -> Option<&Ring> {
        self.rings.iter().find(|r| r.dc == dc)
    }

    /// Maps a (table, key) pair to its replica set within `dc`.
    pub fn hash(&self, dc: DataCenterId, table: &[u8], key: &[u8]) -> Option<ReplicaSet> {
        let ring = self.ring(dc)?;
        let rs = ring.replica_set(partition_for(table, key));
        if rs.num_replicas() == 0 {
            return None;
        }
        Some(rs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_cluster;

    #[test]
    fn group_quorum_and_index() {
        let members: Vec<CommId> = (1..=5).map(CommId::new).collect();
        let group = PaxosGroup::new(PaxosGroupId::new(1), DataCenterId::new(1), members);
        assert_eq!(group.quorum(), 3);
        assert_eq!(group.index(CommId::new(3)), Some(2));
        assert_eq!(group.index(CommId::new(77)), None);
    }

    #[test]
    fn choose_groups_spans_every_data_center() {
        let cluster = local_cluster(3, 3, 2);
        let home = cluster.config.groups[0].id;
        let chosen = cluster.config.choose_groups(home).unwrap();
        assert_eq!(chosen.len(), 3);
        assert_eq!(chosen[0], home);
        let mut dcs: Vec<_> = chosen
            .iter()
            .map(|g| cluster.config.get_group(*g).unwrap().dc)
            .collect();
        dcs.sort();
        dcs.dedup();
        assert_eq!(dcs.len(), 3);
    }

    #[test]
    fn first_alive_skips_offline_members() {
        let mut cluster = local_cluster(1, 3, 1);
        let group = cluster.config.groups[0].clone();
        let first = group.members[0];
        cluster
            .config
            .txmans
            .iter_mut()
            .find(|t| t.id == first)
            .unwrap()
            .state = MemberState::Offline;
        assert_eq!(cluster.config.first_alive(group.id), Some(group.members[1]));
    }

    #[test]
    fn snapshot_survives_serialization() {
        let cluster = local_cluster(2, 3, 2);
        let bytes = bcs::to_bytes(&cluster.config).unwrap();
        let decoded: ClusterConfig = bcs::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.version, cluster.config.version);
        assert_eq!(decoded.groups, cluster.config.groups);
    }
}
