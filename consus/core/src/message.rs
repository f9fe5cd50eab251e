// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire messages and durable-log records. Everything is bcs-serialized;
//! serialize-then-deserialize is byte-stable.

use bytes::Bytes;
use consus_config::{CommId, PartitionId, PaxosGroupId, ReplicaSet, VersionId};
use serde::{Deserialize, Serialize};

use crate::error::{ConsusError, ConsusResult, ReturnCode};
use crate::generalized_paxos::{Command, MessageP1a, MessageP1b, MessageP2a, MessageP2b};
use crate::paxos_synod::{Ballot, PValue};
use crate::types::{TransactionGroup, TransactionId};

/// Flag bit on a replicated write marking a deletion.
pub const WRITE_TOMBSTONE: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOp {
    Lock,
    Unlock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WoundAction {
    /// Stop replicating the lock request; another request of the same
    /// transaction supersedes it.
    DropRequest,
    /// The transaction lost a wound-wait race and must abort-vote.
    Abort,
}

/// A record in the durable log. The transaction operation records double as
/// the Paxos-2a payload replicated within the home group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    Nop,
    Config {
        version: VersionId,
    },
    TxBegin {
        tg: TransactionGroup,
        seqno: u64,
        timestamp: u64,
        dcs: Vec<PaxosGroupId>,
    },
    TxRead {
        tg: TransactionGroup,
        seqno: u64,
        table: Bytes,
        key: Bytes,
        timestamp: u64,
    },
    TxWrite {
        tg: TransactionGroup,
        seqno: u64,
        table: Bytes,
        key: Bytes,
        value: Bytes,
    },
    TxPrepare {
        tg: TransactionGroup,
        seqno: u64,
    },
    TxAbort {
        tg: TransactionGroup,
        seqno: u64,
    },
    LocalVote1a {
        tg: TransactionGroup,
        idx: u8,
        ballot: Ballot,
    },
    LocalVote2a {
        tg: TransactionGroup,
        idx: u8,
        pvalue: PValue,
    },
    LocalLearn {
        tg: TransactionGroup,
        idx: u8,
        value: u64,
    },
    GlobalPropose {
        tg: TransactionGroup,
        command: Command,
    },
    GlobalVote1a {
        tg: TransactionGroup,
        message: MessageP1a,
    },
    GlobalVote2a {
        tg: TransactionGroup,
        message: MessageP2a,
    },
    GlobalVote2b {
        tg: TransactionGroup,
        message: MessageP2b,
    },
    Disposition {
        tg: TransactionGroup,
        outcome: u64,
    },
}

impl LogEntry {
    /// Whether this record is a transaction operation replicated via Paxos 2a.
    pub fn is_transaction_op(&self) -> bool {
        matches!(
            self,
            LogEntry::TxBegin { .. }
                | LogEntry::TxRead { .. }
                | LogEntry::TxWrite { .. }
                | LogEntry::TxPrepare { .. }
                | LogEntry::TxAbort { .. }
        )
    }

    pub fn transaction_group(&self) -> Option<TransactionGroup> {
        match self {
            LogEntry::Nop | LogEntry::Config { .. } => None,
            LogEntry::TxBegin { tg, .. }
            | LogEntry::TxRead { tg, .. }
            | LogEntry::TxWrite { tg, .. }
            | LogEntry::TxPrepare { tg, .. }
            | LogEntry::TxAbort { tg, .. }
            | LogEntry::LocalVote1a { tg, .. }
            | LogEntry::LocalVote2a { tg, .. }
            | LogEntry::LocalLearn { tg, .. }
            | LogEntry::GlobalPropose { tg, .. }
            | LogEntry::GlobalVote1a { tg, .. }
            | LogEntry::GlobalVote2a { tg, .. }
            | LogEntry::GlobalVote2b { tg, .. }
            | LogEntry::Disposition { tg, .. } => Some(*tg),
        }
    }

    pub fn seqno(&self) -> Option<u64> {
        match self {
            LogEntry::TxBegin { seqno, .. }
            | LogEntry::TxRead { seqno, .. }
            | LogEntry::TxWrite { seqno, .. }
            | LogEntry::TxPrepare { seqno, .. }
            | LogEntry::TxAbort { seqno, .. } => Some(*seqno),
            _ => None,
        }
    }

    pub fn encode(&self) -> ConsusResult<Vec<u8>> {
        bcs::to_bytes(self).map_err(ConsusError::SerializationFailure)
    }

    pub fn decode(bytes: &[u8]) -> ConsusResult<Self> {
        bcs::from_bytes(bytes).map_err(ConsusError::MalformedMessage)
    }
}

/// The payload of a `ClientResponse`, keyed by the request nonce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientReply {
    Begun {
        txid: TransactionId,
        members: Vec<CommId>,
    },
    Read {
        rc: ReturnCode,
        timestamp: u64,
        value: Option<Bytes>,
    },
    Write {
        rc: ReturnCode,
    },
    Finished {
        rc: ReturnCode,
    },
}

/// Every message exchanged between clients, transaction managers, and
/// key-value stores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // Client <-> transaction manager.
    ClientResponse {
        nonce: u64,
        reply: ClientReply,
    },
    TxBegin {
        nonce: u64,
    },
    TxRead {
        txid: TransactionId,
        nonce: u64,
        seqno: u64,
        table: Bytes,
        key: Bytes,
    },
    TxWrite {
        txid: TransactionId,
        nonce: u64,
        seqno: u64,
        table: Bytes,
        key: Bytes,
        value: Bytes,
    },
    TxCommit {
        txid: TransactionId,
        nonce: u64,
        seqno: u64,
    },
    TxAbort {
        txid: TransactionId,
        nonce: u64,
        seqno: u64,
    },

    // Transaction manager <-> transaction manager, within one group.
    TxWound {
        tg: TransactionGroup,
    },
    Paxos2a {
        entry: LogEntry,
    },
    Paxos2b {
        tg: TransactionGroup,
        seqno: u64,
    },
    LvVote1a {
        tg: TransactionGroup,
        idx: u8,
        ballot: Ballot,
    },
    LvVote1b {
        tg: TransactionGroup,
        idx: u8,
        ballot: Ballot,
        pvalue: PValue,
    },
    LvVote2a {
        tg: TransactionGroup,
        idx: u8,
        pvalue: PValue,
    },
    LvVote2b {
        tg: TransactionGroup,
        idx: u8,
        pvalue: PValue,
    },
    LvVoteLearn {
        tg: TransactionGroup,
        idx: u8,
        value: u64,
    },
    CommitRecord {
        tg: TransactionGroup,
        entries: Vec<LogEntry>,
    },

    // Transaction manager <-> transaction manager, across data centers.
    GvPropose {
        tg: TransactionGroup,
        command: Command,
    },
    GvVote1a {
        tg: TransactionGroup,
        message: MessageP1a,
    },
    GvVote1b {
        tg: TransactionGroup,
        message: MessageP1b,
    },
    GvVote2a {
        tg: TransactionGroup,
        message: MessageP2a,
    },
    GvVote2b {
        tg: TransactionGroup,
        message: MessageP2b,
    },
    GvOutcome {
        tg: TransactionGroup,
        outcome: u64,
    },

    // Transaction manager <-> key-value store.
    KvsRepRd {
        nonce: u64,
        table: Bytes,
        key: Bytes,
        timestamp: u64,
    },
    KvsRepRdResp {
        nonce: u64,
        rc: ReturnCode,
        timestamp: u64,
        value: Option<Bytes>,
    },
    KvsRepWr {
        nonce: u64,
        flags: u8,
        table: Bytes,
        key: Bytes,
        timestamp: u64,
        value: Bytes,
    },
    KvsRepWrResp {
        nonce: u64,
        rc: ReturnCode,
    },
    KvsLockOp {
        nonce: u64,
        tg: TransactionGroup,
        table: Bytes,
        key: Bytes,
        op: LockOp,
    },
    KvsLockOpResp {
        nonce: u64,
        rc: ReturnCode,
    },

    // Key-value store <-> key-value store.
    KvsRawRd {
        nonce: u64,
        table: Bytes,
        key: Bytes,
        timestamp: u64,
    },
    KvsRawRdResp {
        nonce: u64,
        rc: ReturnCode,
        timestamp: u64,
        value: Option<Bytes>,
        rs: ReplicaSet,
    },
    KvsRawWr {
        nonce: u64,
        flags: u8,
        table: Bytes,
        key: Bytes,
        timestamp: u64,
        value: Bytes,
    },
    KvsRawWrResp {
        nonce: u64,
        rc: ReturnCode,
        rs: ReplicaSet,
    },
    KvsRawLk {
        nonce: u64,
        tg: TransactionGroup,
        table: Bytes,
        key: Bytes,
        op: LockOp,
    },
    KvsRawLkResp {
        nonce: u64,
        tg: TransactionGroup,
        rs: ReplicaSet,
    },
    KvsWoundXact {
        nonce: u64,
        action: WoundAction,
        tg: TransactionGroup,
    },
    KvsMigrateSyn {
        partition: PartitionId,
        version: VersionId,
    },
    KvsMigrateAck {
        partition: PartitionId,
        version: VersionId,
    },
}

impl Message {
    pub fn encode(&self) -> ConsusResult<Bytes> {
        bcs::to_bytes(self)
            .map(Bytes::from)
            .map_err(ConsusError::SerializationFailure)
    }

    pub fn decode(bytes: &[u8]) -> ConsusResult<Self> {
        bcs::from_bytes(bytes).map_err(ConsusError::MalformedMessage)
    }

    /// Variant name for metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            Message::ClientResponse { .. } => "client_response",
            Message::TxBegin { .. } => "tx_begin",
            Message::TxRead { .. } => "tx_read",
            Message::TxWrite { .. } => "tx_write",
            Message::TxCommit { .. } => "tx_commit",
            Message::TxAbort { .. } => "tx_abort",
            Message::TxWound { .. } => "tx_wound",
            Message::Paxos2a { .. } => "paxos_2a",
            Message::Paxos2b { .. } => "paxos_2b",
            Message::LvVote1a { .. } => "lv_vote_1a",
            Message::LvVote1b { .. } => "lv_vote_1b",
            Message::LvVote2a { .. } => "lv_vote_2a",
            Message::LvVote2b { .. } => "lv_vote_2b",
            Message::LvVoteLearn { .. } => "lv_vote_learn",
            Message::CommitRecord { .. } => "commit_record",
            Message::GvPropose { .. } => "gv_propose",
            Message::GvVote1a { .. } => "gv_vote_1a",
            Message::GvVote1b { .. } => "gv_vote_1b",
            Message::GvVote2a { .. } => "gv_vote_2a",
            Message::GvVote2b { .. } => "gv_vote_2b",
            Message::GvOutcome { .. } => "gv_outcome",
            Message::KvsRepRd { .. } => "kvs_rep_rd",
            Message::KvsRepRdResp { .. } => "kvs_rep_rd_resp",
            Message::KvsRepWr { .. } => "kvs_rep_wr",
            Message::KvsRepWrResp { .. } => "kvs_rep_wr_resp",
            Message::KvsLockOp { .. } => "kvs_lock_op",
            Message::KvsLockOpResp { .. } => "kvs_lock_op_resp",
            Message::KvsRawRd { .. } => "kvs_raw_rd",
            Message::KvsRawRdResp { .. } => "kvs_raw_rd_resp",
            Message::KvsRawWr { .. } => "kvs_raw_wr",
            Message::KvsRawWrResp { .. } => "kvs_raw_wr_resp",
            Message::KvsRawLk { .. } => "kvs_raw_lk",
            Message::KvsRawLkResp { .. } => "kvs_raw_lk_resp",
            Message::KvsWoundXact { .. } => "kvs_wound_xact",
            Message::KvsMigrateSyn { .. } => "kvs_migrate_syn",
            Message::KvsMigrateAck { .. } => "kvs_migrate_ack",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consus_config::AbstractId;
    use crate::generalized_paxos::{BallotKind, CStruct, GpBallot};

    fn sample_tg() -> TransactionGroup {
        TransactionGroup::home(TransactionId::new(PaxosGroupId::new(3), 1234567, 42))
    }

    fn sample_messages() -> Vec<Message> {
        let tg = sample_tg();
        let ballot = Ballot::new(7, CommId::new(101));
        let pvalue = PValue::new(ballot, crate::types::VOTE_COMMIT);
        let gp_ballot = GpBallot::new(BallotKind::Fast, 3, AbstractId::new(3));
        let cstruct = CStruct {
            commands: vec![Command::new(1, b"vote".to_vec())],
        };
        vec![
            Message::TxBegin { nonce: 1 },
            Message::ClientResponse {
                nonce: 1,
                reply: ClientReply::Begun {
                    txid: tg.txid,
                    members: vec![CommId::new(101), CommId::new(102)],
                },
            },
            Message::TxRead {
                txid: tg.txid,
                nonce: 2,
                seqno: 1,
                table: Bytes::from_static(b"t"),
                key: Bytes::from_static(b"k"),
            },
            Message::TxWrite {
                txid: tg.txid,
                nonce: 3,
                seqno: 2,
                table: Bytes::from_static(b"t"),
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
            },
            Message::TxCommit {
                txid: tg.txid,
                nonce: 4,
                seqno: 3,
            },
            Message::Paxos2a {
                entry: LogEntry::TxWrite {
                    tg,
                    seqno: 2,
                    table: Bytes::from_static(b"t"),
                    key: Bytes::from_static(b"k"),
                    value: Bytes::from_static(b"v"),
                },
            },
            Message::Paxos2b { tg, seqno: 2 },
            Message::LvVote1a { tg, idx: 0, ballot },
            Message::LvVote1b {
                tg,
                idx: 0,
                ballot,
                pvalue,
            },
            Message::LvVote2a { tg, idx: 1, pvalue },
            Message::LvVoteLearn {
                tg,
                idx: 1,
                value: crate::types::VOTE_ABORT,
            },
            Message::GvPropose {
                tg,
                command: Command::new(0, b"payload".to_vec()),
            },
            Message::GvVote1a {
                tg,
                message: MessageP1a { ballot: gp_ballot },
            },
            Message::GvVote2a {
                tg,
                message: MessageP2a {
                    ballot: gp_ballot,
                    value: cstruct.clone(),
                },
            },
            Message::GvVote2b {
                tg,
                message: MessageP2b {
                    ballot: gp_ballot,
                    acceptor: AbstractId::new(4),
                    value: cstruct,
                },
            },
            Message::KvsLockOp {
                nonce: 9,
                tg,
                table: Bytes::from_static(b"t"),
                key: Bytes::from_static(b"k"),
                op: LockOp::Lock,
            },
            Message::KvsWoundXact {
                nonce: 9,
                action: WoundAction::Abort,
                tg,
            },
            Message::KvsRawRdResp {
                nonce: 10,
                rc: ReturnCode::Success,
                timestamp: 99,
                value: Some(Bytes::from_static(b"v")),
                rs: ReplicaSet::default(),
            },
        ]
    }

    #[test]
    fn messages_round_trip_byte_stable() {
        for message in sample_messages() {
            let bytes = message.encode().unwrap();
            let decoded = Message::decode(&bytes).unwrap();
            assert_eq!(decoded, message, "{}", message.name());
            let re_encoded = decoded.encode().unwrap();
            assert_eq!(re_encoded, bytes, "{}", message.name());
        }
    }

    #[test]
    fn log_entries_round_trip() {
        let tg = sample_tg();
        let entries = vec![
            LogEntry::Nop,
            LogEntry::Config {
                version: VersionId::new(8),
            },
            LogEntry::TxBegin {
                tg,
                seqno: 0,
                timestamp: 55,
                dcs: vec![PaxosGroupId::new(3), PaxosGroupId::new(9)],
            },
            LogEntry::TxPrepare { tg, seqno: 4 },
            LogEntry::LocalLearn {
                tg,
                idx: 2,
                value: crate::types::VOTE_COMMIT,
            },
            LogEntry::Disposition {
                tg,
                outcome: crate::types::VOTE_COMMIT,
            },
        ];
        for entry in entries {
            let bytes = entry.encode().unwrap();
            assert_eq!(LogEntry::decode(&bytes).unwrap(), entry);
        }
    }

    #[test]
    fn transaction_ops_carry_group_and_seqno() {
        let tg = sample_tg();
        let entry = LogEntry::TxPrepare { tg, seqno: 7 };
        assert!(entry.is_transaction_op());
        assert_eq!(entry.transaction_group(), Some(tg));
        assert_eq!(entry.seqno(), Some(7));
        assert!(!LogEntry::Nop.is_transaction_op());
        assert_eq!(LogEntry::Nop.transaction_group(), None);
    }
}
