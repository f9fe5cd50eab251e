// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! The transaction state machine run by every member of the home paxos group
//! (and, once a commit record arrives, by one group per other data center).
//!
//! Client operations land in a mutable array indexed by in-transaction
//! sequence number. Each operation is replicated to the group as a Paxos-2a
//! log entry; the state machine advances only on operations durably
//! acknowledged by a quorum. A final prepare or abort operation moves the
//! transaction into the local vote, then the global vote, and finally the
//! side-effect phases that write data and release locks.

use std::time::Instant;

use bytes::Bytes;
use consus_config::{CommId, PaxosGroup, PaxosGroupId, MAX_REPLICATION_FACTOR};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::ReturnCode;
use crate::kvs_client::TxCallback;
use crate::message::{ClientReply, LockOp, LogEntry, Message};
use crate::node::TransactionManager;
use crate::types::{TransactionGroup, Vote, VOTE_ABORT, VOTE_COMMIT};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum TxState {
    Initialized,
    Executing,
    LocalCommitVote,
    GlobalCommitVote,
    Committed,
    Aborted,
    Terminated,
    Collected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum OpKind {
    #[default]
    Nop,
    Begin,
    Read,
    Write,
    Prepare,
    Abort,
}

/// Field-presence flags for idempotent merging of retried operations.
#[derive(Default)]
struct Comparison {
    kind: bool,
    table: bool,
    key: bool,
    value: bool,
}

#[derive(Default)]
struct Operation {
    kind: OpKind,
    table: Bytes,
    key: Bytes,
    value: Bytes,

    // Read results surfaced to the client.
    rc: ReturnCode,
    timestamp: u64,
    read_value: Option<Bytes>,

    // Lock and read lifecycle at the home data center.
    require_read_lock: bool,
    read_locked: bool,
    read_done: bool,
    read_lock_released: bool,
    read_stamp: Option<Instant>,

    // Write lifecycle at the home data center.
    require_write: bool,
    write_locked: bool,
    write_put_done: bool,
    write_finished: bool,
    write_stamp: Option<Instant>,

    // Durability of this operation's Paxos-2a log entry.
    log_write_issued: bool,
    log_write_durable: bool,
    durable: [bool; MAX_REPLICATION_FACTOR],
    paxos_stamps: [Option<Instant>; MAX_REPLICATION_FACTOR],
    paxos_2b_stamps: [Option<Instant>; MAX_REPLICATION_FACTOR],

    // Reply address for the client that issued this operation.
    client: Option<(CommId, u64)>,
}

impl Operation {
    fn set_client(&mut self, client: CommId, nonce: u64) {
        self.client = Some((client, nonce));
    }

    /// Merges `op` into this slot. An empty slot adopts the operation; an
    /// occupied one must match on every compared field.
    fn merge(&mut self, op: Operation, cmp: &Comparison) -> bool {
        if self.kind == OpKind::Nop {
            self.kind = op.kind;
            self.table = op.table;
            self.key = op.key;
            self.value = op.value;
            return true;
        }
        !((cmp.kind && self.kind != op.kind)
            || (cmp.table && self.table != op.table)
            || (cmp.key && self.key != op.key)
            || (cmp.value && self.value != op.value))
    }
}

struct TxInner {
    state: TxState,
    init_timestamp: u64,
    group: PaxosGroup,
    dcs: Vec<PaxosGroupId>,
    dcs_stamps: Vec<Option<Instant>>,
    // Data centers known to have recorded this transaction's outcome; the
    // home group gossips the commit record until all of them have.
    dcs_confirmed: Vec<bool>,
    timestamp: u64,
    prefer_to_commit: bool,
    ops: Vec<Operation>,
    // Durable notifications arriving before begin() is known.
    deferred_2b: Vec<(CommId, u64)>,
}

pub(crate) struct Transaction {
    tg: TransactionGroup,
    inner: Mutex<TxInner>,
}

impl Transaction {
    pub fn new(tg: TransactionGroup) -> Self {
        Self {
            tg,
            inner: Mutex::new(TxInner {
                state: TxState::Initialized,
                init_timestamp: 0,
                group: PaxosGroup::default(),
                dcs: Vec::new(),
                dcs_stamps: Vec::new(),
                dcs_confirmed: Vec::new(),
                timestamp: 0,
                prefer_to_commit: true,
                ops: Vec::new(),
                deferred_2b: Vec::new(),
            }),
        }
    }

    pub fn finished(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == TxState::Initialized || inner.state == TxState::Collected
    }

    #[cfg(test)]
    pub fn state(&self) -> TxState {
        self.inner.lock().state
    }

    #[cfg(test)]
    pub fn ops_len(&self) -> usize {
        self.inner.lock().ops.len()
    }

    #[cfg(test)]
    pub fn prefers_commit(&self) -> bool {
        self.inner.lock().prefer_to_commit
    }

    // Commands coming from the client.

    pub fn begin(
        &self,
        client: CommId,
        nonce: u64,
        timestamp: u64,
        group: &PaxosGroup,
        dcs: Vec<PaxosGroupId>,
        tm: &TransactionManager,
    ) {
        let mut inner = self.inner.lock();
        self.internal_begin("client", timestamp, group, dcs, &mut inner, tm);
        if let Some(op) = inner.ops.get_mut(0) {
            op.set_client(client, nonce);
        }
        self.work(&mut inner, tm);
    }

    pub fn read(
        &self,
        client: CommId,
        nonce: u64,
        seqno: u64,
        table: Bytes,
        key: Bytes,
        tm: &TransactionManager,
    ) {
        let mut inner = self.inner.lock();
        if self.internal_read("client", seqno, table, key, &mut inner, tm) {
            let op = &mut inner.ops[seqno as usize];
            op.require_read_lock = true;
            op.set_client(client, nonce);
        }
        self.work(&mut inner, tm);
    }

    pub fn write(
        &self,
        client: CommId,
        nonce: u64,
        seqno: u64,
        table: Bytes,
        key: Bytes,
        value: Bytes,
        tm: &TransactionManager,
    ) {
        let mut inner = self.inner.lock();
        if self.internal_write("client", seqno, table, key, value, &mut inner, tm) {
            let op = &mut inner.ops[seqno as usize];
            op.require_write = true;
            op.set_client(client, nonce);
        }
        self.work(&mut inner, tm);
    }

    pub fn prepare(&self, client: CommId, nonce: u64, seqno: u64, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if self.internal_end("client", OpKind::Prepare, seqno, &mut inner, tm) {
            inner.ops[seqno as usize].set_client(client, nonce);
        }
        self.work(&mut inner, tm);
    }

    pub fn abort(&self, client: CommId, nonce: u64, seqno: u64, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if self.internal_end("client", OpKind::Abort, seqno, &mut inner, tm) {
            inner.ops[seqno as usize].set_client(client, nonce);
        }
        self.work(&mut inner, tm);
    }

    // Replication within the home group.

    pub fn paxos_2a(&self, entry: LogEntry, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        match entry {
            LogEntry::TxBegin {
                seqno,
                timestamp,
                dcs,
                ..
            } => {
                if seqno != 0 {
                    self.invariant_violation("paxos 2a::begin", &mut inner, tm);
                } else {
                    let config = tm.config();
                    match config.get_group(self.tg.group) {
                        Some(group) => {
                            let group = group.clone();
                            self.internal_begin("paxos 2a", timestamp, &group, dcs, &mut inner, tm)
                        }
                        None => self.invariant_violation("paxos 2a::begin", &mut inner, tm),
                    }
                }
            }
            LogEntry::TxRead {
                seqno, table, key, ..
            } => {
                if self.internal_read("paxos 2a", seqno, table, key, &mut inner, tm) {
                    let op = &mut inner.ops[seqno as usize];
                    op.require_read_lock = true;
                    op.read_locked = true;
                    op.read_done = true;
                }
            }
            LogEntry::TxWrite {
                seqno,
                table,
                key,
                value,
                ..
            } => {
                if self.internal_write("paxos 2a", seqno, table, key, value, &mut inner, tm) {
                    let op = &mut inner.ops[seqno as usize];
                    op.require_write = true;
                    op.write_locked = true;
                }
            }
            LogEntry::TxPrepare { seqno, .. } => {
                self.internal_end("paxos 2a", OpKind::Prepare, seqno, &mut inner, tm);
            }
            LogEntry::TxAbort { seqno, .. } => {
                self.internal_end("paxos 2a", OpKind::Abort, seqno, &mut inner, tm);
            }
            _ => {
                error!("{} received non-operation paxos 2a entry", self.tg);
                self.avoid_commit_if_possible(&mut inner, tm);
            }
        }
        self.work(&mut inner, tm);
    }

    pub fn paxos_2b(&self, from: CommId, seqno: u64, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        self.internal_paxos_2b(from, seqno, &mut inner, tm);
        self.work(&mut inner, tm);
    }

    /// Durability callback for this member's own log write of operation
    /// `seqno`.
    pub fn log_durable(&self, seqno: u64, tm: &TransactionManager) {
        {
            let mut inner = self.inner.lock();
            let Some(op) = inner.ops.get_mut(seqno as usize) else {
                return;
            };
            op.log_write_durable = true;
        }
        self.paxos_2b(tm.own_id(), seqno, tm);
    }

    /// A serialized transaction history gossiped from the home data center,
    /// sufficient to reconstruct enough state here to vote.
    pub fn commit_record(&self, entries: Vec<LogEntry>, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if !inner.ops.is_empty() {
            self.work(&mut inner, tm);
            return;
        }
        for entry in entries {
            match entry {
                LogEntry::TxBegin {
                    seqno,
                    timestamp,
                    dcs,
                    ..
                } => {
                    if seqno != 0 {
                        self.invariant_violation("commit record::begin", &mut inner, tm);
                        continue;
                    }
                    let config = tm.config();
                    match config.get_group(self.tg.group) {
                        Some(group) => {
                            let group = group.clone();
                            self.internal_begin(
                                "commit record",
                                timestamp,
                                &group,
                                dcs,
                                &mut inner,
                                tm,
                            );
                        }
                        None => self.invariant_violation("commit record::begin", &mut inner, tm),
                    }
                }
                LogEntry::TxPrepare { seqno, .. } => {
                    self.internal_end("commit record", OpKind::Prepare, seqno, &mut inner, tm);
                }
                // Reads and writes take effect only at the home data center;
                // other participants vote on begin/prepare alone.
                LogEntry::TxRead { .. } | LogEntry::TxWrite { .. } => {}
                other => {
                    error!(
                        "{} commit record carries unexpected entry {other:?}",
                        self.tg
                    );
                    self.avoid_commit_if_possible(&mut inner, tm);
                }
            }
        }
        if inner.ops.is_empty() || inner.ops.last().map(|op| op.kind) != Some(OpKind::Prepare) {
            error!("{} commit record did not end in a prepare", self.tg);
            self.avoid_commit_if_possible(&mut inner, tm);
        }
        self.work(&mut inner, tm);
    }

    /// Wound-wait: an older transaction wants a lock this one holds.
    pub fn wound(&self, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        debug!("{} wounded; preferring abort", self.tg);
        inner.prefer_to_commit = false;
        tm.local_voter(self.tg).preempt();
        self.work(&mut inner, tm);
    }

    pub fn externally_work_state_machine(&self, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        self.work(&mut inner, tm);
    }

    // Key-value store callbacks.

    pub fn kvs_read_locked(&self, seqno: u64, rc: ReturnCode, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.ops.get_mut(seqno as usize) {
            if matches!(rc, ReturnCode::Success | ReturnCode::LessDurable) {
                op.read_locked = true;
                op.read_stamp = None;
            }
        }
        self.work(&mut inner, tm);
    }

    pub fn kvs_read_value(
        &self,
        seqno: u64,
        rc: ReturnCode,
        timestamp: u64,
        value: Option<Bytes>,
        tm: &TransactionManager,
    ) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(op) = inner.ops.get_mut(seqno as usize) {
            if op.require_read_lock && !op.read_done {
                op.read_done = true;
                op.rc = rc;
                op.timestamp = timestamp;
                op.read_value = value;
                if inner.state == TxState::Executing {
                    inner.timestamp = inner.timestamp.max(timestamp + 1);
                }
            }
        }
        self.work(inner, tm);
    }

    pub fn kvs_read_unlocked(&self, seqno: u64, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.ops.get_mut(seqno as usize) {
            op.read_lock_released = true;
        }
        self.work(&mut inner, tm);
    }

    pub fn kvs_write_locked(&self, seqno: u64, rc: ReturnCode, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.ops.get_mut(seqno as usize) {
            if matches!(rc, ReturnCode::Success | ReturnCode::LessDurable) {
                op.write_locked = true;
                op.write_stamp = None;
            }
        }
        self.work(&mut inner, tm);
    }

    pub fn kvs_write_put_done(&self, seqno: u64, rc: ReturnCode, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.ops.get_mut(seqno as usize) {
            match rc {
                ReturnCode::Success | ReturnCode::LessDurable => {
                    op.write_put_done = true;
                    op.write_stamp = None;
                }
                other => {
                    // Keep retrying; a write that cannot land after commit is
                    // an operational fault, not a protocol outcome.
                    error!("{} write of op {seqno} failed with {other:?}", self.tg);
                }
            }
        }
        self.work(&mut inner, tm);
    }

    pub fn kvs_write_unlocked(&self, seqno: u64, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.ops.get_mut(seqno as usize) {
            op.write_finished = true;
        }
        self.work(&mut inner, tm);
    }

    // Internal operation ingestion.

    fn ensure_initialized(&self, inner: &mut TxInner) {
        if inner.state == TxState::Initialized {
            inner.state = TxState::Executing;
        }
    }

    fn internal_begin(
        &self,
        source: &str,
        timestamp: u64,
        group: &PaxosGroup,
        dcs: Vec<PaxosGroupId>,
        inner: &mut TxInner,
        tm: &TransactionManager,
    ) {
        self.ensure_initialized(inner);
        if inner.state > TxState::Executing {
            debug!("{}.ops[0]: {source} begin dropped; already voting", self.tg);
            return;
        }
        debug!(
            "{}.ops[0]: {source} initiated begin() across {} data centers @ {timestamp}",
            self.tg,
            dcs.len()
        );

        let op = Operation {
            kind: OpKind::Begin,
            ..Operation::default()
        };
        let cmp = Comparison {
            kind: true,
            ..Comparison::default()
        };
        if !self.resize_to_hold(0, inner)
            || !inner.ops[0].merge(op, &cmp)
            || (inner.init_timestamp != 0 && inner.init_timestamp != timestamp)
        {
            self.invariant_violation("begin", inner, tm);
            return;
        }

        if inner.init_timestamp == 0 {
            info!("{} began in {} data centers", self.tg, dcs.len());
            inner.init_timestamp = timestamp;
            inner.timestamp = inner.timestamp.max(timestamp);
            inner.group = group.clone();
            inner.dcs = dcs;
            inner.dcs_stamps = vec![None; inner.dcs.len()];
            inner.dcs_confirmed = inner.dcs.iter().map(|dc| *dc == self.tg.group).collect();
            for (from, seqno) in std::mem::take(&mut inner.deferred_2b) {
                debug!(
                    "{}.ops[{seqno}]: processing deferred durable notification from {from}",
                    self.tg
                );
                self.internal_paxos_2b(from, seqno, inner, tm);
            }
        }
    }

    fn internal_read(
        &self,
        source: &str,
        seqno: u64,
        table: Bytes,
        key: Bytes,
        inner: &mut TxInner,
        tm: &TransactionManager,
    ) -> bool {
        self.ensure_initialized(inner);
        if inner.state > TxState::Executing {
            debug!(
                "{}.ops[{seqno}]: {source} read dropped; already voting",
                self.tg
            );
            return false;
        }
        debug!("{}.ops[{seqno}]: {source} initiated read()", self.tg);

        let op = Operation {
            kind: OpKind::Read,
            table,
            key,
            ..Operation::default()
        };
        let cmp = Comparison {
            kind: true,
            table: true,
            key: true,
            value: false,
        };
        if !self.resize_to_hold(seqno, inner) || !inner.ops[seqno as usize].merge(op, &cmp) {
            self.invariant_violation("read", inner, tm);
            return false;
        }
        true
    }

    fn internal_write(
        &self,
        source: &str,
        seqno: u64,
        table: Bytes,
        key: Bytes,
        value: Bytes,
        inner: &mut TxInner,
        tm: &TransactionManager,
    ) -> bool {
        self.ensure_initialized(inner);
        if inner.state > TxState::Executing {
            debug!(
                "{}.ops[{seqno}]: {source} write dropped; already voting",
                self.tg
            );
            return false;
        }
        debug!("{}.ops[{seqno}]: {source} initiated write()", self.tg);

        let op = Operation {
            kind: OpKind::Write,
            table,
            key,
            value,
            ..Operation::default()
        };
        let cmp = Comparison {
            kind: true,
            table: true,
            key: true,
            value: true,
        };
        if !self.resize_to_hold(seqno, inner) || !inner.ops[seqno as usize].merge(op, &cmp) {
            self.invariant_violation("write", inner, tm);
            return false;
        }
        true
    }

    fn internal_end(
        &self,
        source: &str,
        kind: OpKind,
        seqno: u64,
        inner: &mut TxInner,
        tm: &TransactionManager,
    ) -> bool {
        self.ensure_initialized(inner);
        if inner.state > TxState::Executing {
            debug!(
                "{}.ops[{seqno}]: {source} {kind:?} dropped; already voting",
                self.tg
            );
            return false;
        }
        debug!("{}.ops[{seqno}]: {source} initiated {kind:?}", self.tg);

        let op = Operation {
            kind,
            ..Operation::default()
        };
        let cmp = Comparison {
            kind: true,
            ..Comparison::default()
        };
        if !self.resize_to_hold(seqno, inner) || !inner.ops[seqno as usize].merge(op, &cmp) {
            self.invariant_violation("end of transaction", inner, tm);
            return false;
        }
        true
    }

    fn internal_paxos_2b(
        &self,
        from: CommId,
        seqno: u64,
        inner: &mut TxInner,
        tm: &TransactionManager,
    ) {
        self.ensure_initialized(inner);
        if inner.init_timestamp == 0 {
            debug!(
                "{}.ops[{seqno}]: durable notification deferred until begin()",
                self.tg
            );
            inner.deferred_2b.push((from, seqno));
            return;
        }
        let Some(idx) = inner.group.index(from) else {
            error!(
                "{}.ops[{seqno}]: {from} misrepresents itself as a member of {}",
                self.tg, self.tg.group
            );
            return;
        };
        if !self.resize_to_hold(seqno, inner) {
            self.invariant_violation("durable notification", inner, tm);
            return;
        }
        let op = &mut inner.ops[seqno as usize];
        if !op.durable[idx] {
            op.durable[idx] = true;
            debug!(
                "{}.ops[{seqno}]: durable notification from {from}",
                self.tg
            );
        }
    }

    fn resize_to_hold(&self, seqno: u64, inner: &mut TxInner) -> bool {
        let seqno = seqno as usize;
        for (i, op) in inner.ops.iter().enumerate() {
            if i < seqno && matches!(op.kind, OpKind::Prepare | OpKind::Abort) {
                return false;
            }
        }
        if inner.ops.len() <= seqno {
            if inner.state != TxState::Executing {
                return false;
            }
            inner.ops.resize_with(seqno + 1, Operation::default);
        }
        true
    }

    fn invariant_violation(&self, what: &str, inner: &mut TxInner, tm: &TransactionManager) {
        error!("{} {what} violates invariants; preferring abort", self.tg);
        self.avoid_commit_if_possible(inner, tm);
    }

    fn avoid_commit_if_possible(&self, inner: &mut TxInner, tm: &TransactionManager) {
        inner.prefer_to_commit = false;
        tm.local_voter(self.tg).set_preferred_vote(VOTE_ABORT);
    }

    // The state machine proper.

    fn work(&self, inner: &mut TxInner, tm: &TransactionManager) {
        match inner.state {
            TxState::Initialized => {}
            TxState::Executing => self.work_executing(inner, tm),
            TxState::LocalCommitVote => self.work_local_commit_vote(inner, tm),
            TxState::GlobalCommitVote => self.work_global_commit_vote(inner, tm),
            TxState::Committed => self.work_finalize(inner, tm, true),
            TxState::Aborted => self.work_finalize(inner, tm, false),
            TxState::Terminated => self.work_terminated(inner, tm),
            TxState::Collected => {}
        }
    }

    fn work_executing(&self, inner: &mut TxInner, tm: &TransactionManager) {
        let mut done = 0;
        for i in 0..inner.ops.len() {
            if inner.ops[i].kind == OpKind::Nop {
                continue;
            }
            if inner.ops[i].require_read_lock && !inner.ops[i].read_done {
                // A read of a key this transaction already wrote is served
                // from the pending write; the data write itself is deferred
                // until commit, so the store cannot answer it.
                if let Some(value) = local_write_before(&inner.ops, i) {
                    let timestamp = inner.timestamp;
                    let op = &mut inner.ops[i];
                    op.require_read_lock = false;
                    op.read_done = true;
                    op.rc = ReturnCode::Success;
                    op.timestamp = timestamp;
                    op.read_value = Some(value);
                } else {
                    self.acquire_read(i, inner, tm);
                    continue;
                }
            }
            if inner.ops[i].require_write && !inner.ops[i].write_locked {
                self.begin_write(i, inner, tm);
                continue;
            }
            if inner.ops[i].log_write_durable {
                self.send_paxos_2b(i, inner, tm);
            }
            if !self.is_durable(i, inner) {
                self.send_paxos_2a(i, inner, tm);
                if !inner.ops[i].log_write_issued {
                    let entry = self.generate_log_entry(i, inner);
                    if let Some(recno) = tm.append_log(&entry) {
                        tm.callback_when_durable(recno, self.tg, i as u64);
                        inner.ops[i].log_write_issued = true;
                    }
                }
                continue;
            }
            if inner.ops[i].client.is_some() {
                self.send_response(i, inner, tm);
            }
            done += 1;
        }

        if done == inner.ops.len()
            && !inner.ops.is_empty()
            && matches!(
                inner.ops.last().unwrap().kind,
                OpKind::Prepare | OpKind::Abort
            )
        {
            debug!(
                "{} executed all operations; moving to the data center vote",
                self.tg
            );
            inner.state = TxState::LocalCommitVote;
            self.work(inner, tm);
        }
    }

    fn work_local_commit_vote(&self, inner: &mut TxInner, tm: &TransactionManager) {
        for i in 0..inner.ops.len() {
            self.send_paxos_2a(i, inner, tm);
            self.send_paxos_2b(i, inner, tm);
        }

        let voter = tm.local_voter(self.tg);
        let prefer_commit = inner.prefer_to_commit
            && inner.ops.last().map(|op| op.kind) == Some(OpKind::Prepare);
        voter.set_preferred_vote(if prefer_commit {
            VOTE_COMMIT
        } else {
            VOTE_ABORT
        });

        let Some(outcome) = voter.outcome() else {
            voter.externally_work_state_machine(tm);
            return;
        };

        debug_assert!(!inner.dcs.is_empty());
        let single_dc = inner.dcs.len() == 1;
        match outcome {
            VOTE_COMMIT if single_dc => {
                debug!("{} data center vote chose COMMIT; committing", self.tg);
                inner.state = TxState::Committed;
                tm.record_disposition(self.tg, Vote::Commit);
            }
            VOTE_COMMIT => {
                debug!(
                    "{} data center vote chose COMMIT; moving to the global vote",
                    self.tg
                );
                inner.state = TxState::GlobalCommitVote;
            }
            VOTE_ABORT if single_dc || self.tg.is_home() => {
                debug!("{} data center vote chose ABORT; aborting", self.tg);
                inner.state = TxState::Aborted;
                tm.record_disposition(self.tg, Vote::Abort);
            }
            VOTE_ABORT => {
                debug!(
                    "{} data center vote chose ABORT; moving to the global vote",
                    self.tg
                );
                inner.state = TxState::GlobalCommitVote;
            }
            other => {
                error!("{} data center vote learned invalid value {other}", self.tg);
                return;
            }
        }
        self.work(inner, tm);
    }

    fn work_global_commit_vote(&self, inner: &mut TxInner, tm: &TransactionManager) {
        let voter = tm.global_voter(self.tg);

        // Gossip the commit record to data centers that have not voted yet.
        self.gossip_commit_record(inner, tm, true);

        if !voter.initialized() {
            let local = tm.local_voter(self.tg);
            let Some(vote) = local.outcome() else {
                return;
            };
            voter.init(vote, &inner.dcs, tm);
        }
        voter.externally_work_state_machine(tm);

        let Some(outcome) = voter.outcome() else {
            return;
        };
        match outcome {
            VOTE_COMMIT => {
                debug!("{} global vote chose COMMIT; committing", self.tg);
                inner.state = TxState::Committed;
                tm.record_disposition(self.tg, Vote::Commit);
            }
            VOTE_ABORT => {
                debug!("{} global vote chose ABORT; aborting", self.tg);
                inner.state = TxState::Aborted;
                tm.record_disposition(self.tg, Vote::Abort);
            }
            other => {
                error!("{} global vote learned invalid value {other}", self.tg);
                return;
            }
        }
        self.work(inner, tm);
    }

    /// Side effects after the outcome: finish or cancel writes and release
    /// read locks. Nothing is released until the disposition is durable
    /// locally.
    fn work_finalize(&self, inner: &mut TxInner, tm: &TransactionManager, committed: bool) {
        if !tm.dispositions().has(&self.tg) {
            return;
        }
        let mut non_nop = 0;
        let mut done = 0;
        for i in 0..inner.ops.len() {
            if inner.ops[i].kind == OpKind::Nop {
                continue;
            }
            non_nop += 1;
            if inner.ops[i].require_read_lock && !inner.ops[i].read_lock_released {
                self.release_read_lock(i, inner, tm);
                continue;
            }
            if inner.ops[i].require_write && !inner.ops[i].write_finished {
                if committed {
                    self.finish_write(i, inner, tm);
                } else {
                    self.cancel_write(i, inner, tm);
                }
                continue;
            }
            done += 1;
        }
        if done == non_nop {
            let rc = if committed {
                ReturnCode::Success
            } else {
                ReturnCode::Aborted
            };
            self.send_finished(rc, inner, tm);
            debug!("{} terminated", self.tg);
            inner.state = TxState::Terminated;
            self.work(inner, tm);
        }
    }

    /// A committed home transaction keeps gossiping its commit record until
    /// every participating data center has confirmed the outcome, so a data
    /// center partitioned through the vote still learns it.
    fn work_terminated(&self, inner: &mut TxInner, tm: &TransactionManager) {
        let outcome = tm.dispositions().get(&self.tg);
        if self.tg.is_home() && outcome == Some(Vote::Commit) {
            if inner.dcs_confirmed.iter().any(|confirmed| !confirmed) {
                self.gossip_commit_record(inner, tm, false);
                return;
            }
        }
        if outcome.is_some() {
            inner.state = TxState::Collected;
        }
    }

    /// A member of another participating data center acknowledged that it
    /// holds this transaction's outcome.
    pub fn confirm_dc(&self, dc: consus_config::DataCenterId, tm: &TransactionManager) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let config = tm.config();
        for (i, group) in inner.dcs.iter().enumerate() {
            if config.get_group(*group).map(|g| g.dc) == Some(dc) {
                inner.dcs_confirmed[i] = true;
            }
        }
        self.work(inner, tm);
    }

    /// Sends the commit record to one live member of each other data center
    /// that still needs it, at most once per resend interval per target.
    fn gossip_commit_record(&self, inner: &mut TxInner, tm: &TransactionManager, only_unvoted: bool) {
        let record: Vec<LogEntry> = (0..inner.ops.len())
            .map(|i| self.generate_log_entry(i, inner))
            .collect();
        let unvoted = if only_unvoted {
            let voter = tm.global_voter(self.tg);
            if voter.initialized() {
                Some(voter.unvoted_data_centers())
            } else {
                None
            }
        } else {
            None
        };
        let config = tm.config();
        let now = Instant::now();
        let resend = tm.resend_interval();
        for i in 0..inner.dcs.len() {
            let dc = inner.dcs[i];
            if dc == self.tg.group || inner.dcs_confirmed[i] {
                continue;
            }
            if let Some(unvoted) = &unvoted {
                if !unvoted.contains(&dc) {
                    continue;
                }
            }
            let due = inner.dcs_stamps[i]
                .map_or(true, |at| now.duration_since(at) >= resend);
            if !due {
                continue;
            }
            let Some(member) = config.first_alive(dc) else {
                continue;
            };
            tm.send(
                member,
                Message::CommitRecord {
                    tg: self.tg.with_group(dc),
                    entries: record.clone(),
                },
            );
            inner.dcs_stamps[i] = Some(now);
        }
    }

    // Quorum durability.

    fn is_durable(&self, seqno: usize, inner: &TxInner) -> bool {
        let Some(op) = inner.ops.get(seqno) else {
            return false;
        };
        let acks = inner
            .group
            .members
            .iter()
            .enumerate()
            .filter(|(idx, _)| op.durable[*idx])
            .count();
        !inner.group.members.is_empty() && acks >= inner.group.quorum()
    }

    // Message generation.

    fn generate_log_entry(&self, seqno: usize, inner: &TxInner) -> LogEntry {
        let op = &inner.ops[seqno];
        let seqno = seqno as u64;
        match op.kind {
            OpKind::Begin => LogEntry::TxBegin {
                tg: self.tg,
                seqno,
                timestamp: inner.init_timestamp,
                dcs: inner.dcs.clone(),
            },
            OpKind::Read => LogEntry::TxRead {
                tg: self.tg,
                seqno,
                table: op.table.clone(),
                key: op.key.clone(),
                timestamp: op.timestamp,
            },
            OpKind::Write => LogEntry::TxWrite {
                tg: self.tg,
                seqno,
                table: op.table.clone(),
                key: op.key.clone(),
                value: op.value.clone(),
            },
            OpKind::Prepare => LogEntry::TxPrepare { tg: self.tg, seqno },
            OpKind::Abort => LogEntry::TxAbort { tg: self.tg, seqno },
            OpKind::Nop => LogEntry::Nop,
        }
    }

    fn send_paxos_2a(&self, seqno: usize, inner: &mut TxInner, tm: &TransactionManager) {
        if inner.ops[seqno].kind == OpKind::Nop {
            return;
        }
        let entry = self.generate_log_entry(seqno, inner);
        let now = Instant::now();
        let resend = tm.resend_interval();
        let own = tm.own_id();
        let op = &mut inner.ops[seqno];
        for (idx, member) in inner.group.members.iter().enumerate() {
            if *member == own || op.durable[idx] {
                continue;
            }
            let due = op.paxos_stamps[idx]
                .map_or(true, |at| now.duration_since(at) >= resend);
            if due {
                tm.send(
                    *member,
                    Message::Paxos2a {
                        entry: entry.clone(),
                    },
                );
                op.paxos_stamps[idx] = Some(now);
            }
        }
    }

    fn send_paxos_2b(&self, seqno: usize, inner: &mut TxInner, tm: &TransactionManager) {
        let now = Instant::now();
        let resend = tm.resend_interval();
        let own = tm.own_id();
        let op = &mut inner.ops[seqno];
        for (idx, member) in inner.group.members.iter().enumerate() {
            if *member == own {
                continue;
            }
            let due = op.paxos_2b_stamps[idx]
                .map_or(true, |at| now.duration_since(at) >= resend);
            if due {
                tm.send(
                    *member,
                    Message::Paxos2b {
                        tg: self.tg,
                        seqno: seqno as u64,
                    },
                );
                op.paxos_2b_stamps[idx] = Some(now);
            }
        }
    }

    fn send_response(&self, seqno: usize, inner: &mut TxInner, tm: &TransactionManager) {
        let members = inner.group.members.clone();
        let txid = self.tg.txid;
        let op = &mut inner.ops[seqno];
        let Some((client, nonce)) = op.client else {
            return;
        };
        let reply = match op.kind {
            OpKind::Begin => ClientReply::Begun {
                txid,
                members,
            },
            OpKind::Read => ClientReply::Read {
                rc: op.rc,
                timestamp: op.timestamp,
                value: op.read_value.clone(),
            },
            OpKind::Write => ClientReply::Write {
                rc: ReturnCode::Success,
            },
            // Prepare and abort are answered only after the vote.
            OpKind::Prepare | OpKind::Abort | OpKind::Nop => return,
        };
        tm.send(client, Message::ClientResponse { nonce, reply });
        op.client = None;
    }

    fn send_finished(&self, rc: ReturnCode, inner: &mut TxInner, tm: &TransactionManager) {
        let Some(op) = inner.ops.last() else {
            return;
        };
        let Some((client, nonce)) = op.client else {
            return;
        };
        tm.send(
            client,
            Message::ClientResponse {
                nonce,
                reply: ClientReply::Finished { rc },
            },
        );
    }

    // Key-value store side effects, re-issued on the resend interval.

    fn acquire_read(&self, seqno: usize, inner: &mut TxInner, tm: &TransactionManager) {
        let now = Instant::now();
        let resend = tm.resend_interval();
        let tg = self.tg;
        let op = &mut inner.ops[seqno];
        let due = op
            .read_stamp
            .map_or(true, |at| now.duration_since(at) >= resend);
        if !due {
            return;
        }
        op.read_stamp = Some(now);
        if !op.read_locked {
            tm.issue_kvs_lock(
                LockOp::Lock,
                op.table.clone(),
                op.key.clone(),
                tg,
                TxCallback::ReadLocked {
                    tg,
                    seqno: seqno as u64,
                },
            );
        } else {
            tm.issue_kvs_read(
                op.table.clone(),
                op.key.clone(),
                u64::MAX,
                TxCallback::ReadValue {
                    tg,
                    seqno: seqno as u64,
                },
            );
        }
    }

    fn release_read_lock(&self, seqno: usize, inner: &mut TxInner, tm: &TransactionManager) {
        let now = Instant::now();
        let resend = tm.resend_interval();
        let tg = self.tg;
        let op = &mut inner.ops[seqno];
        let due = op
            .read_stamp
            .map_or(true, |at| now.duration_since(at) >= resend);
        if !due {
            return;
        }
        op.read_stamp = Some(now);
        tm.issue_kvs_lock(
            LockOp::Unlock,
            op.table.clone(),
            op.key.clone(),
            tg,
            TxCallback::ReadUnlocked {
                tg,
                seqno: seqno as u64,
            },
        );
    }

    fn begin_write(&self, seqno: usize, inner: &mut TxInner, tm: &TransactionManager) {
        let now = Instant::now();
        let resend = tm.resend_interval();
        let tg = self.tg;
        let op = &mut inner.ops[seqno];
        let due = op
            .write_stamp
            .map_or(true, |at| now.duration_since(at) >= resend);
        if !due {
            return;
        }
        op.write_stamp = Some(now);
        tm.issue_kvs_lock(
            LockOp::Lock,
            op.table.clone(),
            op.key.clone(),
            tg,
            TxCallback::WriteLocked {
                tg,
                seqno: seqno as u64,
            },
        );
    }

    fn finish_write(&self, seqno: usize, inner: &mut TxInner, tm: &TransactionManager) {
        let now = Instant::now();
        let resend = tm.resend_interval();
        let tg = self.tg;
        let timestamp = inner.timestamp;
        let op = &mut inner.ops[seqno];
        let due = op
            .write_stamp
            .map_or(true, |at| now.duration_since(at) >= resend);
        if !due {
            return;
        }
        op.write_stamp = Some(now);
        if !op.write_put_done {
            tm.issue_kvs_write(
                0,
                op.table.clone(),
                op.key.clone(),
                timestamp,
                op.value.clone(),
                TxCallback::WritePutDone {
                    tg,
                    seqno: seqno as u64,
                },
            );
        } else {
            tm.issue_kvs_lock(
                LockOp::Unlock,
                op.table.clone(),
                op.key.clone(),
                tg,
                TxCallback::WriteUnlocked {
                    tg,
                    seqno: seqno as u64,
                },
            );
        }
    }

    fn cancel_write(&self, seqno: usize, inner: &mut TxInner, tm: &TransactionManager) {
        let now = Instant::now();
        let resend = tm.resend_interval();
        let tg = self.tg;
        let op = &mut inner.ops[seqno];
        let due = op
            .write_stamp
            .map_or(true, |at| now.duration_since(at) >= resend);
        if !due {
            return;
        }
        op.write_stamp = Some(now);
        tm.issue_kvs_lock(
            LockOp::Unlock,
            op.table.clone(),
            op.key.clone(),
            tg,
            TxCallback::WriteUnlocked {
                tg,
                seqno: seqno as u64,
            },
        );
    }
}

/// The value of the latest write to the same key earlier in this transaction,
/// if any.
fn local_write_before(ops: &[Operation], read_idx: usize) -> Option<Bytes> {
    let read = &ops[read_idx];
    ops[..read_idx]
        .iter()
        .rev()
        .find(|op| op.kind == OpKind::Write && op.table == read.table && op.key == read.key)
        .map(|op| op.value.clone())
}
