// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fans a versioned write (or tombstone) out to every replica of a key. The
//! operation succeeds only when a quorum of replicas returns the same
//! terminal code and the current and transitioning owner of every slot agree
//! on the replica-set view; mixed terminal codes clear the slate and retry.

use std::time::Instant;

use bytes::Bytes;
use consus_config::{replica_sets_agree, CommId, ReplicaSet};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::ReturnCode;
use crate::kvs::node::KvsNode;
use crate::message::Message;

struct WriteStub {
    target: CommId,
    last_request: Option<Instant>,
    status: ReturnCode,
    rs: ReplicaSet,
}

impl WriteStub {
    fn new(target: CommId) -> Self {
        Self {
            target,
            last_request: None,
            status: ReturnCode::Garbage,
            rs: ReplicaSet::default(),
        }
    }
}

struct WriteInner {
    finished: bool,
    stubs: Vec<WriteStub>,
}

pub(crate) struct WriteReplicator {
    state_key: u64,
    requester: CommId,
    nonce: u64,
    flags: u8,
    table: Bytes,
    key: Bytes,
    timestamp: u64,
    value: Bytes,
    inner: Mutex<WriteInner>,
}

impl WriteReplicator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_key: u64,
        requester: CommId,
        nonce: u64,
        flags: u8,
        table: Bytes,
        key: Bytes,
        timestamp: u64,
        value: Bytes,
    ) -> Self {
        Self {
            state_key,
            requester,
            nonce,
            flags,
            table,
            key,
            timestamp,
            value,
            inner: Mutex::new(WriteInner {
                finished: false,
                stubs: Vec::new(),
            }),
        }
    }

    pub fn finished(&self) -> bool {
        self.inner.lock().finished
    }

    fn returncode_is_terminal(rc: ReturnCode) -> bool {
        matches!(
            rc,
            ReturnCode::Success | ReturnCode::UnknownTable | ReturnCode::Invalid
        )
    }

    pub fn response(&self, from: CommId, rc: ReturnCode, rs: ReplicaSet, node: &KvsNode) {
        {
            let mut inner = self.inner.lock();
            let Some(stub) = inner.stubs.iter_mut().find(|s| s.target == from) else {
                return;
            };
            if stub.status == ReturnCode::Garbage {
                stub.status = rc;
                stub.rs = rs;
            }
        }
        self.work(node);
    }

    pub fn work(&self, node: &KvsNode) {
        let Some(mut rs) = node.config().hash(node.own_dc(), &self.table, &self.key) else {
            return;
        };
        let mut inner = self.inner.lock();
        if inner.finished {
            return;
        }
        self.drive(&mut inner, &mut rs, node);
    }

    fn drive(&self, inner: &mut WriteInner, rs: &mut ReplicaSet, node: &KvsNode) {
        let now = Instant::now();
        let mut complete_success = 0;
        let mut complete_unknown = 0;
        let mut complete_invalid = 0;

        for i in 0..rs.num_replicas() {
            let current = rs.replicas[i];
            let transitioning = rs.transitioning[i];
            for target in [current, transitioning] {
                if !target.is_none() && !inner.stubs.iter().any(|s| s.target == target) {
                    inner.stubs.push(WriteStub::new(target));
                }
            }

            let current_idx = inner.stubs.iter().position(|s| s.target == current).unwrap();
            let transitioning_idx = inner.stubs.iter().position(|s| s.target == transitioning);

            // A migrating slot counts only when both sides terminated with
            // the same code and the same view of the replica set.
            let mut rc = inner.stubs[current_idx].status;
            if let Some(t_idx) = transitioning_idx {
                if inner.stubs[t_idx].status == ReturnCode::Garbage {
                    rc = ReturnCode::Garbage;
                } else if inner.stubs[current_idx].status != inner.stubs[t_idx].status
                    || !replica_sets_agree(
                        current,
                        &inner.stubs[current_idx].rs,
                        &inner.stubs[t_idx].rs,
                    )
                {
                    rc = ReturnCode::Garbage;
                    inner.stubs[current_idx].status = ReturnCode::Garbage;
                    inner.stubs[t_idx].status = ReturnCode::Garbage;
                }
            }

            match rc {
                ReturnCode::Success => complete_success += 1,
                ReturnCode::UnknownTable => complete_unknown += 1,
                ReturnCode::Invalid => complete_invalid += 1,
                _ => {
                    for idx in [Some(current_idx), transitioning_idx].into_iter().flatten() {
                        let resend = node.resend_interval();
                        let stub = &mut inner.stubs[idx];
                        if !Self::returncode_is_terminal(stub.status)
                            && stub
                                .last_request
                                .map_or(true, |at| now.duration_since(at) >= resend)
                        {
                            stub.last_request = Some(now);
                            node.send(
                                stub.target,
                                Message::KvsRawWr {
                                    nonce: self.state_key,
                                    flags: self.flags,
                                    table: self.table.clone(),
                                    key: self.key.clone(),
                                    timestamp: self.timestamp,
                                    value: self.value.clone(),
                                },
                            );
                        }
                    }
                }
            }
        }

        let mut short_write = false;
        if rs.desired_replication > rs.num_replicas() {
            warn!(
                "too few kvs nodes to achieve desired replication factor: {} more needed",
                rs.desired_replication - rs.num_replicas()
            );
            rs.desired_replication = rs.num_replicas();
            short_write = true;
        }

        let quorum = rs.desired_replication / 2 + 1;
        let sum = complete_success + complete_unknown + complete_invalid;
        let status = if sum > 0 && sum == complete_success && complete_success >= quorum {
            if short_write {
                ReturnCode::LessDurable
            } else {
                ReturnCode::Success
            }
        } else if sum > 0 && sum == complete_unknown && complete_unknown >= quorum {
            ReturnCode::UnknownTable
        } else if sum > 0 && sum == complete_invalid && complete_invalid >= quorum {
            ReturnCode::Invalid
        } else if sum > 0
            && sum != complete_success
            && sum != complete_unknown
            && sum != complete_invalid
        {
            // Mixed terminal codes: clear state and start over.
            node.metrics().replicator_mixed_responses.inc();
            inner.stubs.clear();
            self.drive(inner, rs, node);
            return;
        } else {
            ReturnCode::Garbage
        };

        if status != ReturnCode::Garbage {
            inner.finished = true;
            debug!(
                "write({:?}, {:?})@{} answering {:?} nonce={}",
                self.table, self.key, self.timestamp, status, self.nonce
            );
            node.send(
                self.requester,
                Message::KvsRepWrResp {
                    nonce: self.nonce,
                    rc: status,
                },
            );
        }
    }
}
