// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::{CommId, DataCenterId, PartitionId};

/// Number of partitions in each data center's ring. Each (table, key) pair
/// hashes to exactly one partition; replicas are the distinct owners of the
/// partitions that follow it on the ring.
pub const KVS_PARTITIONS: usize = 65536;

/// Upper bound on replication within a group or a replica set.
pub const MAX_REPLICATION_FACTOR: usize = 9;

/// The replicas responsible for one (table, key) pair within a data center.
///
/// `replicas[i]` currently owns the i-th copy; `transitioning[i]` is the
/// server taking over that copy during migration, or `CommId::none()`. An
/// operation on the pair must succeed on both sides of every slot before its
/// quorum counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub desired_replication: usize,
    pub replicas: Vec<CommId>,
    pub transitioning: Vec<CommId>,
}

impl ReplicaSet {
    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    fn slot_of(&self, target: CommId) -> Option<usize> {
        self.replicas
            .iter()
            .chain(self.transitioning.iter())
            .position(|id| *id == target)
            .map(|idx| idx % self.replicas.len().max(1))
    }
}

/// Two views of a replica set agree on `target` when both place it in the same
/// slot with the same current owner and the same transitioning owner. Views
/// from servers holding different configuration versions fail this check and
/// the caller retries.
pub fn replica_sets_agree(target: CommId, a: &ReplicaSet, b: &ReplicaSet) -> bool {
    let (sa, sb) = match (a.slot_of(target), b.slot_of(target)) {
        (Some(sa), Some(sb)) => (sa, sb),
        _ => return false,
    };
    sa == sb
        && a.replicas.get(sa) == b.replicas.get(sb)
        && a.transitioning.get(sa) == b.transitioning.get(sb)
}

/// One data center's consistent-hash ring: each partition has a current owner
/// and, while the partition is migrating, a next owner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ring {
    pub dc: DataCenterId,
    pub desired_replication: usize,
    owners: Vec<CommId>,
    next_owners: Vec<CommId>,
}

impl Ring {
    /// Builds a ring assigning the partitions round-robin over `owners`.
    /// An empty owner list produces a ring that maps everything to no one.
    pub fn new(dc: DataCenterId, desired_replication: usize, owners: &[CommId]) -> Self {
        assert!(desired_replication <= MAX_REPLICATION_FACTOR);
        let assigned = (0..KVS_PARTITIONS)
            .map(|p| {
                if owners.is_empty() {
                    CommId::none()
                } else {
                    owners[p % owners.len()]
                }
            })
            .collect();
        Self {
            dc,
            desired_replication,
            owners: assigned,
            next_owners: vec![CommId::none(); KVS_PARTITIONS],
        }
    }

    pub fn owner(&self, partition: PartitionId) -> CommId {
        self.owners[partition.value() as usize % KVS_PARTITIONS]
    }

    pub fn set_next_owner(&mut self, partition: PartitionId, next: CommId) {
        self.next_owners[partition.value() as usize % KVS_PARTITIONS] = next;
    }

    /// Walks the ring forward from `partition`, collecting distinct owners
    /// until the desired replication factor is reached or the ring is
    /// exhausted. The actual factor may come up short on small clusters.
    pub fn replica_set(&self, partition: PartitionId) -> ReplicaSet {
        let start = partition.value() as usize % KVS_PARTITIONS;
        let mut replicas: Vec<CommId> = Vec::with_capacity(self.desired_replication);
        let mut transitioning: Vec<CommId> = Vec::with_capacity(self.desired_replication);
        for i in 0..KVS_PARTITIONS {
            let idx = (start + i) % KVS_PARTITIONS;
            let owner = self.owners[idx];
            if owner.is_none() || replicas.contains(&owner) {
                continue;
            }
            replicas.push(owner);
            transitioning.push(self.next_owners[idx]);
            if replicas.len() == self.desired_replication {
                break;
            }
        }
        ReplicaSet {
            desired_replication: self.desired_replication,
            replicas,
            transitioning,
        }
    }
}

/// Stable 64-bit FNV-1a over the (table, key) pair. Every server must map a
/// pair to the same partition, so this cannot be a per-process hasher.
pub fn partition_for(table: &[u8], key: &[u8]) -> PartitionId {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET;
    for &b in table {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h ^= 0xff;
    h = h.wrapping_mul(PRIME);
    for &b in key {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    PartitionId::new(h % KVS_PARTITIONS as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_stable_and_keyed_on_both_fields() {
        let p = partition_for(b"table", b"key");
        assert_eq!(p, partition_for(b"table", b"key"));
        assert_ne!(p, partition_for(b"table", b"key2"));
        assert_ne!(partition_for(b"ab", b"c"), partition_for(b"a", b"bc"));
    }

    #[test]
    fn replica_set_collects_distinct_owners() {
        let owners: Vec<CommId> = (1..=5).map(CommId::new).collect();
        let ring = Ring::new(DataCenterId::new(1), 3, &owners);
        let rs = ring.replica_set(PartitionId::new(17));
        assert_eq!(rs.num_replicas(), 3);
        assert_eq!(rs.replicas[0], CommId::new(17 % 5 + 1));
        let mut sorted = rs.replicas.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
    }

    #[test]
    fn replica_set_short_of_desired_on_small_clusters() {
        let owners = vec![CommId::new(1), CommId::new(2)];
        let ring = Ring::new(DataCenterId::new(1), 3, &owners);
        let rs = ring.replica_set(PartitionId::new(0));
        assert_eq!(rs.desired_replication, 3);
        assert_eq!(rs.num_replicas(), 2);
    }

    #[test]
    fn agreement_requires_identical_slots() {
        let owners: Vec<CommId> = (1..=4).map(CommId::new).collect();
        let ring = Ring::new(DataCenterId::new(1), 2, &owners);
        let a = ring.replica_set(PartitionId::new(3));
        let b = a.clone();
        let target = a.replicas[0];
        assert!(replica_sets_agree(target, &a, &b));

        let mut c = a.clone();
        c.transitioning[0] = CommId::new(9);
        assert!(!replica_sets_agree(target, &a, &c));

        let mut d = a.clone();
        d.replicas.rotate_left(1);
        assert!(!replica_sets_agree(target, &a, &d));
    }
}
