// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-key exclusive locks with wound-wait deadlock avoidance.
//!
//! Each key's state holds the current holder at the queue head plus waiting
//! requests ordered by transaction priority. An older transaction arriving
//! behind a younger holder wounds it; duplicate requests from one transaction
//! collapse to the smallest nonce. Holder changes are persisted through the
//! datastore before anyone is told they hold the lock.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use consus_config::CommId;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::ReturnCode;
use crate::kvs::node::KvsNode;
use crate::message::{Message, WoundAction};
use crate::types::TransactionGroup;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TableKeyPair {
    pub table: Bytes,
    pub key: Bytes,
}

#[derive(Clone, Debug)]
struct LockRequest {
    id: CommId,
    nonce: u64,
    tg: TransactionGroup,
}

struct LockInner {
    initialized: bool,
    holder: TransactionGroup,
    requests: VecDeque<LockRequest>,
}

pub(crate) struct LockState {
    state_key: TableKeyPair,
    inner: Mutex<LockInner>,
}

impl LockState {
    fn new(state_key: TableKeyPair) -> Self {
        Self {
            state_key,
            inner: Mutex::new(LockInner {
                initialized: false,
                holder: TransactionGroup::default(),
                requests: VecDeque::new(),
            }),
        }
    }

    pub fn finished(&self) -> bool {
        let inner = self.inner.lock();
        !inner.initialized
            || (inner.requests.is_empty() && inner.holder == TransactionGroup::default())
    }

    pub fn enqueue_lock(&self, id: CommId, nonce: u64, tg: TransactionGroup, node: &KvsNode) {
        let mut inner = self.inner.lock();
        if !self.ensure_initialized(&mut inner, node) {
            return;
        }
        debug!(
            "lock({:?}, {:?}) {} nonce={nonce} id={id}",
            self.state_key.table, self.state_key.key, tg
        );

        if inner.holder == tg {
            self.send_response(id, nonce, tg, node);
            return;
        }

        // Collapse duplicate requests from this transaction to the smallest
        // nonce; the superseded replicator is told to stop retransmitting.
        let mut found = false;
        for request in inner.requests.iter_mut() {
            if request.tg == tg {
                found = true;
                if request.nonce > nonce {
                    self.send_wound(request.id, request.nonce, WoundAction::DropRequest, tg, node);
                    request.id = id;
                    request.nonce = nonce;
                } else {
                    self.send_wound(id, nonce, WoundAction::DropRequest, tg, node);
                }
            }
        }

        if !found {
            Self::ordered_enqueue(&mut inner, LockRequest { id, nonce, tg });
        }

        if inner.holder == TransactionGroup::default() {
            debug_assert_eq!(inner.requests.len(), 1);
            let rc = node.store().write_lock(&self.state_key.table, &self.state_key.key, tg);
            if rc != ReturnCode::Success {
                error!(
                    "failed to persist lock({:?}, {:?}) nonce={nonce}: {rc:?}",
                    self.state_key.table, self.state_key.key
                );
                inner.requests.pop_front();
                return;
            }
            self.send_response(id, nonce, tg, node);
            inner.holder = tg;
        }

        if tg.txid.preempts(&inner.holder.txid) {
            let holder = inner.holder;
            self.send_wound(id, nonce, WoundAction::Abort, holder, node);
        }

        self.invariant_check(&inner);
    }

    pub fn unlock(&self, id: CommId, nonce: u64, tg: TransactionGroup, node: &KvsNode) {
        let mut inner = self.inner.lock();
        if !self.ensure_initialized(&mut inner, node) {
            return;
        }
        debug!(
            "unlock({:?}, {:?}) {} nonce={nonce} id={id}",
            self.state_key.table, self.state_key.key, tg
        );

        if inner.holder == tg {
            debug_assert_eq!(inner.requests.front().map(|r| r.tg), Some(tg));
            let next = if inner.requests.len() > 1 {
                inner.requests.get(1).cloned()
            } else {
                None
            };
            let next_tg = next
                .as_ref()
                .map(|r| r.tg)
                .unwrap_or_default();
            let rc = node
                .store()
                .write_lock(&self.state_key.table, &self.state_key.key, next_tg);
            if rc != ReturnCode::Success {
                error!(
                    "failed to persist unlock({:?}, {:?}) nonce={nonce}: {rc:?}",
                    self.state_key.table, self.state_key.key
                );
                return;
            }
            inner.requests.pop_front();
            inner.holder = next_tg;
            if let Some(next) = next {
                self.send_response(next.id, next.nonce, next.tg, node);
            }
        } else {
            // A non-holder walking away: purge its queued requests.
            let mut kept = VecDeque::new();
            while let Some(request) = inner.requests.pop_front() {
                if request.tg == tg {
                    self.send_wound(
                        request.id,
                        request.nonce,
                        WoundAction::DropRequest,
                        request.tg,
                        node,
                    );
                } else {
                    kept.push_back(request);
                }
            }
            inner.requests = kept;
        }

        // The unlocker recorded its disposition durably before sending, so a
        // stale re-lock is harmless; always acknowledging preserves liveness.
        self.send_response(id, nonce, tg, node);
        self.invariant_check(&inner);
    }

    fn ensure_initialized(&self, inner: &mut LockInner, node: &KvsNode) -> bool {
        if inner.initialized {
            return true;
        }
        if let Some(holder) = node
            .store()
            .read_lock(&self.state_key.table, &self.state_key.key)
        {
            debug!(
                "restoring {holder} as durable lock holder of ({:?}, {:?})",
                self.state_key.table, self.state_key.key
            );
            inner.requests.push_back(LockRequest {
                id: CommId::none(),
                nonce: 0,
                tg: holder,
            });
            inner.holder = holder;
        }
        inner.initialized = true;
        true
    }

    /// Inserts behind the holder, ordered by wound-wait priority among the
    /// waiting requests.
    fn ordered_enqueue(inner: &mut LockInner, request: LockRequest) {
        if inner.requests.is_empty() {
            inner.requests.push_back(request);
            return;
        }
        let mut at = 1;
        while at < inner.requests.len() && inner.requests[at].tg.txid.preempts(&request.tg.txid) {
            at += 1;
        }
        inner.requests.insert(at, request);
    }

    fn send_wound(
        &self,
        id: CommId,
        nonce: u64,
        action: WoundAction,
        tg: TransactionGroup,
        node: &KvsNode,
    ) {
        if id == CommId::none() {
            return;
        }
        let kind = match action {
            WoundAction::DropRequest => "drop",
            WoundAction::Abort => "abort",
        };
        node.metrics().lock_wounds.with_label_values(&[kind]).inc();
        node.send(id, Message::KvsWoundXact { nonce, action, tg });
    }

    fn send_response(&self, id: CommId, nonce: u64, tg: TransactionGroup, node: &KvsNode) {
        if id == CommId::none() {
            return;
        }
        let rs = match node.config().hash(
            node.own_dc(),
            &self.state_key.table,
            &self.state_key.key,
        ) {
            Some(rs) => rs,
            None => {
                debug!("dropping lock response to {id}; hashing failed");
                return;
            }
        };
        node.send(id, Message::KvsRawLkResp { nonce, tg, rs });
    }

    fn invariant_check(&self, inner: &LockInner) {
        if inner.requests.is_empty() {
            debug_assert_eq!(inner.holder, TransactionGroup::default());
        } else {
            debug_assert_eq!(inner.holder, inner.requests[0].tg);
        }
    }
}

/// The per-node table of lock states.
#[derive(Default)]
pub(crate) struct LockManager {
    locks: DashMap<TableKeyPair, Arc<LockState>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, table: &Bytes, key: &Bytes) -> Arc<LockState> {
        let state_key = TableKeyPair {
            table: table.clone(),
            key: key.clone(),
        };
        self.locks
            .entry(state_key.clone())
            .or_insert_with(|| Arc::new(LockState::new(state_key)))
            .clone()
    }

    pub fn lock(
        &self,
        id: CommId,
        nonce: u64,
        table: &Bytes,
        key: &Bytes,
        tg: TransactionGroup,
        node: &KvsNode,
    ) {
        self.state(table, key).enqueue_lock(id, nonce, tg, node);
    }

    pub fn unlock(
        &self,
        id: CommId,
        nonce: u64,
        table: &Bytes,
        key: &Bytes,
        tg: TransactionGroup,
        node: &KvsNode,
    ) {
        self.state(table, key).unlock(id, nonce, tg, node);
    }

    /// Drops lock states with no holder and no waiters.
    pub fn collect_finished(&self) {
        self.locks.retain(|_, state| !state.finished());
    }
}
