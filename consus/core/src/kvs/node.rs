// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! A key-value store node: versioned storage plus per-key locks, fronted by
//! the replicator state machines that give each operation at-least-quorum
//! durability across the ring.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use consus_config::{ClusterConfig, CommId, DataCenterId, Parameters};
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::Registry;
use rand::RngCore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::context::Context;
use crate::error::{ConsusResult, ReturnCode};
use crate::kvs::lock_manager::LockManager;
use crate::kvs::lock_replicator::LockReplicator;
use crate::kvs::read_replicator::ReadReplicator;
use crate::kvs::store::{Datastore, StoreGet};
use crate::kvs::write_replicator::WriteReplicator;
use crate::message::{LockOp, Message, WoundAction, WRITE_TOMBSTONE};
use crate::metrics::{initialise_metrics, NodeMetrics};
use crate::network::{NetworkClient, NetworkService, Outbox};

pub struct KvsNode {
    context: Arc<Context>,
    outbox: Outbox,
    store: Arc<dyn Datastore>,
    locks: LockManager,
    read_replicators: DashMap<u64, Arc<ReadReplicator>>,
    write_replicators: DashMap<u64, Arc<WriteReplicator>>,
    lock_replicators: DashMap<u64, Arc<LockReplicator>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KvsNode {
    pub fn start(
        own_id: CommId,
        config: Arc<ClusterConfig>,
        parameters: Parameters,
        registry: Registry,
        network_client: Arc<dyn NetworkClient>,
        store: Arc<dyn Datastore>,
    ) -> Arc<Self> {
        info!("starting key-value store {own_id}");
        let metrics = initialise_metrics(registry);
        let context = Arc::new(Context::new(own_id, config, parameters, metrics.clone()));
        let (outbox, outbox_task) = Outbox::start(network_client, metrics);

        let node = Arc::new(Self {
            context,
            outbox,
            store,
            locks: LockManager::new(),
            read_replicators: DashMap::new(),
            write_replicators: DashMap::new(),
            lock_replicators: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let pump_node = Arc::downgrade(&node);
        let pump_interval = node.context.parameters.pump_interval;
        let pump_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pump_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(node) = pump_node.upgrade() else {
                    return;
                };
                node.pump();
            }
        });
        node.tasks.lock().extend([outbox_task, pump_task]);
        node
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn publish_config(&self, config: Arc<ClusterConfig>) {
        self.context.publish_config(config);
    }

    pub(crate) fn send(&self, to: CommId, message: Message) {
        self.outbox.send(to, message);
    }

    pub(crate) fn config(&self) -> Arc<ClusterConfig> {
        self.context.config()
    }

    pub(crate) fn resend_interval(&self) -> std::time::Duration {
        self.context.parameters.resend_interval
    }

    pub(crate) fn metrics(&self) -> &NodeMetrics {
        &self.context.metrics.node_metrics
    }

    pub(crate) fn store(&self) -> &dyn Datastore {
        self.store.as_ref()
    }

    pub(crate) fn own_dc(&self) -> DataCenterId {
        self.config()
            .kvs_dc(self.context.own_id)
            .unwrap_or_default()
    }

    /// Re-drives unfinished replicators and collects finished state.
    fn pump(&self) {
        self.metrics().pump_iterations.inc();
        self.read_replicators.retain(|_, r| !r.finished());
        self.write_replicators.retain(|_, r| !r.finished());
        self.lock_replicators.retain(|_, r| !r.finished());
        for r in self.read_replicators.iter() {
            r.work(self);
        }
        for r in self.write_replicators.iter() {
            r.work(self);
        }
        for r in self.lock_replicators.iter() {
            r.work(self);
        }
        self.locks.collect_finished();
    }

    fn fresh_state_key(&self) -> u64 {
        loop {
            let key = rand::thread_rng().next_u64();
            if key != 0
                && !self.read_replicators.contains_key(&key)
                && !self.write_replicators.contains_key(&key)
                && !self.lock_replicators.contains_key(&key)
            {
                return key;
            }
        }
    }

    fn handle(&self, from: CommId, message: Message) {
        self.metrics()
            .messages_received
            .with_label_values(&[message.name()])
            .inc();
        match message {
            Message::KvsRepRd {
                nonce,
                table,
                key,
                timestamp,
            } => {
                let state_key = self.fresh_state_key();
                let replicator = Arc::new(ReadReplicator::new(
                    state_key, from, nonce, table, key, timestamp,
                ));
                self.read_replicators.insert(state_key, replicator.clone());
                replicator.work(self);
            }
            Message::KvsRepWr {
                nonce,
                flags,
                table,
                key,
                timestamp,
                value,
            } => {
                let state_key = self.fresh_state_key();
                let replicator = Arc::new(WriteReplicator::new(
                    state_key, from, nonce, flags, table, key, timestamp, value,
                ));
                self.write_replicators.insert(state_key, replicator.clone());
                replicator.work(self);
            }
            Message::KvsLockOp {
                nonce,
                tg,
                table,
                key,
                op,
            } => {
                let state_key = self.fresh_state_key();
                let replicator = Arc::new(LockReplicator::new(
                    state_key, from, nonce, table, key, tg, op,
                ));
                self.lock_replicators.insert(state_key, replicator.clone());
                replicator.work(self);
            }
            Message::KvsRawRd {
                nonce,
                table,
                key,
                timestamp,
            } => {
                let (rc, version, value) = match self.store.get(&table, &key, timestamp) {
                    StoreGet::Value { timestamp, value } => {
                        (ReturnCode::Success, timestamp, Some(value))
                    }
                    StoreGet::Tombstone { timestamp } => (ReturnCode::NotFound, timestamp, None),
                    StoreGet::Missing => (ReturnCode::NotFound, 0, None),
                    StoreGet::UnknownTable => (ReturnCode::UnknownTable, 0, None),
                };
                let rs = self
                    .config()
                    .hash(self.own_dc(), &table, &key)
                    .unwrap_or_default();
                self.send(
                    from,
                    Message::KvsRawRdResp {
                        nonce,
                        rc,
                        timestamp: version,
                        value,
                        rs,
                    },
                );
            }
            Message::KvsRawRdResp {
                nonce,
                rc,
                timestamp,
                value,
                rs,
            } => {
                if let Some(replicator) = self.read_replicators.get(&nonce) {
                    replicator.response(from, rc, timestamp, value, rs, self);
                }
            }
            Message::KvsRawWr {
                nonce,
                flags,
                table,
                key,
                timestamp,
                value,
            } => {
                let rc = if flags & WRITE_TOMBSTONE != 0 {
                    self.store.del(&table, &key, timestamp)
                } else {
                    self.store.put(&table, &key, timestamp, value)
                };
                let rs = self
                    .config()
                    .hash(self.own_dc(), &table, &key)
                    .unwrap_or_default();
                self.send(from, Message::KvsRawWrResp { nonce, rc, rs });
            }
            Message::KvsRawWrResp { nonce, rc, rs } => {
                if let Some(replicator) = self.write_replicators.get(&nonce) {
                    replicator.response(from, rc, rs, self);
                }
            }
            Message::KvsRawLk {
                nonce,
                tg,
                table,
                key,
                op,
            } => match op {
                LockOp::Lock => self.locks.lock(from, nonce, &table, &key, tg, self),
                LockOp::Unlock => self.locks.unlock(from, nonce, &table, &key, tg, self),
            },
            Message::KvsRawLkResp { nonce, tg, rs } => {
                if let Some(replicator) = self.lock_replicators.get(&nonce) {
                    replicator.response(from, tg, rs, self);
                }
            }
            Message::KvsWoundXact { nonce, action, tg } => {
                if let Some(replicator) = self.lock_replicators.get(&nonce) {
                    match action {
                        WoundAction::DropRequest => replicator.drop_request(tg),
                        WoundAction::Abort => replicator.abort(tg, self),
                    }
                }
            }
            Message::KvsMigrateSyn { partition, version } => {
                // Only acknowledge a handshake for the configuration we hold;
                // a mismatch means one side must catch up first.
                if version == self.config().version {
                    self.send(from, Message::KvsMigrateAck { partition, version });
                }
            }
            Message::KvsMigrateAck { .. } => {}
            other => {
                debug!("key-value store ignoring {} message", other.name());
                self.metrics()
                    .invalid_messages
                    .with_label_values(&["unexpected_type"])
                    .inc();
            }
        }
    }
}

/// Network-facing wrapper, agnostic to the actual networking stack used.
pub struct KvsService(pub Arc<KvsNode>);

#[async_trait]
impl NetworkService for KvsService {
    async fn handle_message(&self, peer: CommId, message: Bytes) -> ConsusResult<()> {
        let message = Message::decode(&message).map_err(|err| {
            self.0
                .metrics()
                .invalid_messages
                .with_label_values(&["malformed"])
                .inc();
            err
        })?;
        self.0.handle(peer, message);
        Ok(())
    }
}

impl Drop for KvsNode {
    fn drop(&mut self) {
        self.stop();
    }
}
