// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fans a lock or unlock out to every replica's lock manager.
//!
//! Success requires a quorum of replicas acknowledging this transaction as
//! holder, with the current and transitioning owner of every slot agreeing on
//! the replica-set view. A lock held by fewer replicas than desired degrades
//! to `LessDurable`.
//!
//! Only the group that durably recorded a transaction's disposition ever
//! initiates its unlocks, so there is exactly one place in the system where
//! the decision to release a lock can be made. Liveness under contention
//! comes from leaking the holder to the transactions waiting on it: a waiter
//! with higher wound-wait priority wounds the holder's home transaction
//! manager, which abort-votes; everything else keeps waiting.

use std::time::Instant;

use bytes::Bytes;
use consus_config::{replica_sets_agree, CommId, ReplicaSet};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::ReturnCode;
use crate::kvs::node::KvsNode;
use crate::message::{LockOp, Message};
use crate::types::TransactionGroup;

struct LockStub {
    target: CommId,
    last_request: Option<Instant>,
    tg: TransactionGroup,
    rs: ReplicaSet,
}

impl LockStub {
    fn new(target: CommId) -> Self {
        Self {
            target,
            last_request: None,
            tg: TransactionGroup::default(),
            rs: ReplicaSet::default(),
        }
    }
}

struct LockReplicatorInner {
    finished: bool,
    stubs: Vec<LockStub>,
}

pub(crate) struct LockReplicator {
    state_key: u64,
    requester: CommId,
    nonce: u64,
    table: Bytes,
    key: Bytes,
    tg: TransactionGroup,
    op: LockOp,
    inner: Mutex<LockReplicatorInner>,
}

impl LockReplicator {
    pub fn new(
        state_key: u64,
        requester: CommId,
        nonce: u64,
        table: Bytes,
        key: Bytes,
        tg: TransactionGroup,
        op: LockOp,
    ) -> Self {
        Self {
            state_key,
            requester,
            nonce,
            table,
            key,
            tg,
            op,
            inner: Mutex::new(LockReplicatorInner {
                finished: false,
                stubs: Vec::new(),
            }),
        }
    }

    pub fn finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn response(&self, from: CommId, tg: TransactionGroup, rs: ReplicaSet, node: &KvsNode) {
        {
            let mut inner = self.inner.lock();
            let Some(stub) = inner.stubs.iter_mut().find(|s| s.target == from) else {
                return;
            };
            stub.tg = tg;
            stub.rs = rs;
        }
        self.work(node);
    }

    /// The replicated lock lost a wound-wait race: stop retransmitting and
    /// tell the losing transaction's home manager to abort-vote.
    pub fn abort(&self, tg: TransactionGroup, node: &KvsNode) {
        self.drop_request(tg);
        let Some(target) = node.config().first_alive(tg.group) else {
            debug!("no live member of {} to wound", tg.group);
            return;
        };
        debug!("sending wound for {tg}");
        node.send(target, Message::TxWound { tg });
    }

    /// Another request of the same transaction supersedes this one.
    pub fn drop_request(&self, tg: TransactionGroup) {
        let mut inner = self.inner.lock();
        if self.tg == tg {
            inner.finished = true;
            inner.stubs.clear();
            debug!("dropping lock replication of {tg}");
        }
    }

    pub fn work(&self, node: &KvsNode) {
        let Some(mut rs) = node.config().hash(node.own_dc(), &self.table, &self.key) else {
            return;
        };
        let mut inner = self.inner.lock();
        if inner.finished {
            return;
        }

        let now = Instant::now();
        let mut complete = 0;
        for i in 0..rs.num_replicas() {
            let current = rs.replicas[i];
            let transitioning = rs.transitioning[i];
            for target in [current, transitioning] {
                if !target.is_none() && !inner.stubs.iter().any(|s| s.target == target) {
                    inner.stubs.push(LockStub::new(target));
                }
            }
            let current_idx = inner.stubs.iter().position(|s| s.target == current).unwrap();
            let transitioning_idx = inner.stubs.iter().position(|s| s.target == transitioning);

            let agree = match transitioning_idx {
                None => true,
                Some(t_idx) => replica_sets_agree(
                    current,
                    &inner.stubs[current_idx].rs,
                    &inner.stubs[t_idx].rs,
                ),
            };
            let acknowledged = inner.stubs[current_idx].tg == self.tg
                && transitioning_idx.map_or(true, |t_idx| inner.stubs[t_idx].tg == self.tg);
            if acknowledged && agree {
                complete += 1;
                continue;
            }

            for idx in [Some(current_idx), transitioning_idx].into_iter().flatten() {
                let resend = node.resend_interval();
                let stub = &mut inner.stubs[idx];
                if (stub.tg != self.tg || !agree)
                    && stub
                        .last_request
                        .map_or(true, |at| now.duration_since(at) >= resend)
                {
                    stub.last_request = Some(now);
                    node.send(
                        stub.target,
                        Message::KvsRawLk {
                            nonce: self.state_key,
                            tg: self.tg,
                            table: self.table.clone(),
                            key: self.key.clone(),
                            op: self.op,
                        },
                    );
                }
            }
        }

        let mut short_lock = false;
        if rs.desired_replication > rs.num_replicas() {
            rs.desired_replication = rs.num_replicas();
            short_lock = true;
        }

        let quorum = rs.desired_replication / 2 + 1;
        if complete >= quorum {
            let rc = if short_lock {
                ReturnCode::LessDurable
            } else {
                ReturnCode::Success
            };
            inner.finished = true;
            debug!(
                "lock op {:?} on ({:?}, {:?}) answering {rc:?} nonce={}",
                self.op, self.table, self.key, self.nonce
            );
            node.send(
                self.requester,
                Message::KvsLockOpResp {
                    nonce: self.nonce,
                    rc,
                },
            );
        }
    }
}
