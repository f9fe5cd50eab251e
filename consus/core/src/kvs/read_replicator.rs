// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fans a read out to every replica of a key and answers the requester once a
//! quorum of replicas agree on the replica-set view, keeping the
//! highest-timestamp version observed.

use std::time::Instant;

use bytes::Bytes;
use consus_config::{replica_sets_agree, CommId, ReplicaSet};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::ReturnCode;
use crate::kvs::node::KvsNode;
use crate::message::Message;

struct ReadStub {
    target: CommId,
    last_request: Option<Instant>,
    rs: ReplicaSet,
}

impl ReadStub {
    fn new(target: CommId) -> Self {
        Self {
            target,
            last_request: None,
            rs: ReplicaSet::default(),
        }
    }
}

struct ReadInner {
    finished: bool,
    status: ReturnCode,
    timestamp: u64,
    value: Option<Bytes>,
    stubs: Vec<ReadStub>,
}

pub(crate) struct ReadReplicator {
    state_key: u64,
    requester: CommId,
    nonce: u64,
    table: Bytes,
    key: Bytes,
    read_timestamp: u64,
    inner: Mutex<ReadInner>,
}

impl ReadReplicator {
    pub fn new(
        state_key: u64,
        requester: CommId,
        nonce: u64,
        table: Bytes,
        key: Bytes,
        read_timestamp: u64,
    ) -> Self {
        Self {
            state_key,
            requester,
            nonce,
            table,
            key,
            read_timestamp,
            inner: Mutex::new(ReadInner {
                finished: false,
                status: ReturnCode::Garbage,
                timestamp: 0,
                value: None,
                stubs: Vec::new(),
            }),
        }
    }

    pub fn finished(&self) -> bool {
        self.inner.lock().finished
    }

    // Reads and writes may grow different terminal sets over time; each
    // replicator keeps its own predicate.
    fn returncode_is_terminal(rc: ReturnCode) -> bool {
        matches!(
            rc,
            ReturnCode::Success | ReturnCode::NotFound | ReturnCode::UnknownTable
        )
    }

    pub fn response(
        &self,
        from: CommId,
        rc: ReturnCode,
        timestamp: u64,
        value: Option<Bytes>,
        rs: ReplicaSet,
        node: &KvsNode,
    ) {
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(stub) = inner.stubs.iter_mut().find(|s| s.target == from) else {
                return;
            };
            if Self::returncode_is_terminal(rc) {
                stub.rs = rs;
                if inner.timestamp == 0 || timestamp > inner.timestamp {
                    inner.status = rc;
                    inner.timestamp = timestamp;
                    inner.value = value;
                }
            }
        }
        self.work(node);
    }

    pub fn work(&self, node: &KvsNode) {
        let Some(rs) = node.config().hash(node.own_dc(), &self.table, &self.key) else {
            return;
        };
        let mut inner = self.inner.lock();
        if inner.finished {
            return;
        }

        let now = Instant::now();
        let mut complete = 0;
        for target in &rs.replicas {
            if !inner.stubs.iter().any(|s| s.target == *target) {
                inner.stubs.push(ReadStub::new(*target));
            }
            let resend = node.resend_interval();
            let stub = inner.stubs.iter_mut().find(|s| s.target == *target).unwrap();
            if replica_sets_agree(*target, &rs, &stub.rs) {
                complete += 1;
            } else if stub
                .last_request
                .map_or(true, |at| now.duration_since(at) >= resend)
            {
                stub.last_request = Some(now);
                node.send(
                    *target,
                    Message::KvsRawRd {
                        nonce: self.state_key,
                        table: self.table.clone(),
                        key: self.key.clone(),
                        timestamp: self.read_timestamp,
                    },
                );
            }
        }

        let quorum = rs.desired_replication.min(rs.num_replicas()) / 2 + 1;
        if complete >= quorum {
            inner.finished = true;
            debug!(
                "read({:?}, {:?}) answering {:?} nonce={}",
                self.table, self.key, inner.status, self.nonce
            );
            node.send(
                self.requester,
                Message::KvsRepRdResp {
                    nonce: self.nonce,
                    rc: inner.status,
                    timestamp: inner.timestamp,
                    value: inner.value.clone(),
                },
            );
        }
    }
}
