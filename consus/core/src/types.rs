// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt;

use consus_config::PaxosGroupId;
use serde::{Deserialize, Serialize};

/// Wire encoding of a commit vote: "commit\0\0" read as a big-endian u64.
pub const VOTE_COMMIT: u64 = 0x636f6d6d69740000;
/// Wire encoding of an abort vote: "abort\0\0\0" read as a big-endian u64.
pub const VOTE_ABORT: u64 = 0x61626f7274000000;

/// A decided transaction outcome. On the wire and in the voting engines votes
/// travel as raw u64 values so that the Paxos machinery stays value-agnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    Commit,
    Abort,
}

impl Vote {
    pub fn as_u64(&self) -> u64 {
        match self {
            Vote::Commit => VOTE_COMMIT,
            Vote::Abort => VOTE_ABORT,
        }
    }

    pub fn from_u64(v: u64) -> Option<Vote> {
        match v {
            VOTE_COMMIT => Some(Vote::Commit),
            VOTE_ABORT => Some(Vote::Abort),
            _ => None,
        }
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vote::Commit => write!(f, "COMMIT"),
            Vote::Abort => write!(f, "ABORT"),
        }
    }
}

/// Globally unique transaction identity: the group the transaction began in,
/// its wallclock start in microseconds, and a random nonce.
///
/// Ordering is wound-wait priority: smaller `(start, nonce)` preempts larger.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    pub group: PaxosGroupId,
    pub start: u64,
    pub nonce: u64,
}

impl TransactionId {
    pub fn new(group: PaxosGroupId, start: u64, nonce: u64) -> Self {
        Self {
            group,
            start,
            nonce,
        }
    }

    /// Whether this transaction wounds `other` when both contend for a lock.
    pub fn preempts(&self, other: &TransactionId) -> bool {
        (self.start, self.nonce) < (other.start, other.nonce)
    }
}

impl Ord for TransactionId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.start, self.nonce, self.group).cmp(&(other.start, other.nonce, other.group))
    }
}

impl PartialOrd for TransactionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "txid({}:{}:{})",
            self.group.value(),
            self.start,
            self.nonce
        )
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One transaction as executed by one data center's paxos group. The same
/// transaction appears under several transaction groups, one per data center
/// soliciting a vote; `group == txid.group` marks the home group.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionGroup {
    pub group: PaxosGroupId,
    pub txid: TransactionId,
}

impl TransactionGroup {
    pub fn new(group: PaxosGroupId, txid: TransactionId) -> Self {
        Self { group, txid }
    }

    pub fn home(txid: TransactionId) -> Self {
        Self {
            group: txid.group,
            txid,
        }
    }

    pub fn is_home(&self) -> bool {
        self.group == self.txid.group
    }

    /// The same transaction as seen by another data center's group.
    pub fn with_group(&self, group: PaxosGroupId) -> Self {
        Self {
            group,
            txid: self.txid,
        }
    }
}

impl fmt::Display for TransactionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transaction({}:{}:{}:{})",
            self.group.value(),
            self.txid.group.value(),
            self.txid.start,
            self.txid.nonce
        )
    }
}

impl fmt::Debug for TransactionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_round_trips_through_wire_constants() {
        assert_eq!(Vote::from_u64(Vote::Commit.as_u64()), Some(Vote::Commit));
        assert_eq!(Vote::from_u64(Vote::Abort.as_u64()), Some(Vote::Abort));
        assert_eq!(Vote::from_u64(42), None);
        assert_eq!(VOTE_COMMIT, u64::from_be_bytes(*b"commit\0\0"));
        assert_eq!(VOTE_ABORT, u64::from_be_bytes(*b"abort\0\0\0"));
    }

    #[test]
    fn preemption_orders_by_start_then_nonce() {
        let old = TransactionId::new(PaxosGroupId::new(1), 5, 9);
        let young = TransactionId::new(PaxosGroupId::new(2), 10, 1);
        assert!(old.preempts(&young));
        assert!(!young.preempts(&old));

        let tie = TransactionId::new(PaxosGroupId::new(3), 5, 8);
        assert!(tie.preempts(&old));
        assert!(!old.preempts(&old));
    }
}
