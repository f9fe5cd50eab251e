// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! A transaction manager node: the state tables for transactions and voters,
//! the durable log with its durability fan-in, and the dispatch of every
//! message class onto the owning state machine.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use consus_config::{ClusterConfig, CommId, Parameters, PaxosGroup};
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::Registry;
use rand::RngCore;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::disposition::DispositionMap;
use crate::durable_log::{DurabilityFanIn, DurableAction, DurableLog};
use crate::error::{ConsusError, ConsusResult, ReturnCode};
use crate::global_voter::GlobalVoter;
use crate::kvs_client::{PendingKvsOp, TxCallback};
use crate::local_voter::LocalVoter;
use crate::message::{ClientReply, LockOp, LogEntry, Message};
use crate::metrics::{initialise_metrics, NodeMetrics};
use crate::network::{NetworkClient, NetworkService, Outbox};
use crate::transaction::Transaction;
use crate::types::{TransactionGroup, TransactionId, Vote};

// Pending key-value store operations are re-issued under fresh nonces; drop
// abandoned ones after a few resend intervals.
const KVS_OP_LIFETIMES: u32 = 5;

pub struct TransactionManager {
    context: Arc<Context>,
    outbox: Outbox,
    log: DurableLog,
    fan_in: DurabilityFanIn,
    fan_in_wakeup: Arc<Notify>,
    transactions: DashMap<TransactionGroup, Arc<Transaction>>,
    local_voters: DashMap<TransactionGroup, Arc<LocalVoter>>,
    global_voters: DashMap<TransactionGroup, Arc<GlobalVoter>>,
    dispositions: DispositionMap,
    kvs_ops: DashMap<u64, PendingKvsOp>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionManager {
    pub fn start(
        own_id: CommId,
        config: Arc<ClusterConfig>,
        parameters: Parameters,
        registry: Registry,
        network_client: Arc<dyn NetworkClient>,
    ) -> ConsusResult<Arc<Self>> {
        info!("starting transaction manager {own_id}");
        let log_dir = parameters
            .log_dir
            .clone()
            .ok_or(ConsusError::LogDirNotConfigured)?;
        let log = DurableLog::open(&log_dir)?;
        // Identity marker so operators (and restarts) can tell whose log
        // directory this is.
        std::fs::write(log_dir.join("TXMAN"), format!("{}\n", own_id.value()))?;
        let metrics = initialise_metrics(registry);
        let context = Arc::new(Context::new(own_id, config, parameters, metrics.clone()));
        let (outbox, outbox_task) = Outbox::start(network_client, metrics);

        let node = Arc::new(Self {
            context,
            outbox,
            log,
            fan_in: DurabilityFanIn::new(),
            fan_in_wakeup: Arc::new(Notify::new()),
            transactions: DashMap::new(),
            local_voters: DashMap::new(),
            global_voters: DashMap::new(),
            dispositions: DispositionMap::new(),
            kvs_ops: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let durability_node = Arc::downgrade(&node);
        let mut durable_rx = node.log.subscribe();
        let wakeup = node.fan_in_wakeup.clone();
        let durability_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = durable_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = wakeup.notified() => {}
                }
                let Some(node) = durability_node.upgrade() else {
                    return;
                };
                node.drain_durable();
            }
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

        node.tasks
            .lock()
            .extend([outbox_task, durability_task, pump_task]);
        Ok(node)
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn publish_config(&self, config: Arc<ClusterConfig>) {
        self.context.publish_config(config);
    }

    /// The recorded outcome of a transaction, if decided here.
    pub fn disposition(&self, tg: &TransactionGroup) -> Option<Vote> {
        self.dispositions.get(tg)
    }

    #[cfg(test)]
    pub(crate) fn log_durable_upper_bound(&self) -> u64 {
        self.log.durable()
    }

    pub(crate) fn own_id(&self) -> CommId {
        self.context.own_id
    }

    pub(crate) fn config(&self) -> Arc<ClusterConfig> {
        self.context.config()
    }

    pub(crate) fn resend_interval(&self) -> Duration {
        self.context.parameters.resend_interval
    }

    pub(crate) fn metrics(&self) -> &NodeMetrics {
        &self.context.metrics.node_metrics
    }

    pub(crate) fn dispositions(&self) -> &DispositionMap {
        &self.dispositions
    }

    pub(crate) fn send(&self, to: CommId, message: Message) {
        self.outbox.send(to, message);
    }

    /// Broadcasts to every member of `group`, this node included; local
    /// delivery loops through the network like any other message.
    pub(crate) fn send_group(&self, group: &PaxosGroup, message: Message) {
        for member in &group.members {
            self.send(*member, message.clone());
        }
    }

    /// Appends `entry` to the durable log, returning its record number.
    pub(crate) fn append_log(&self, entry: &LogEntry) -> Option<u64> {
        let encoded = match entry.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                error!("failed to encode log entry: {err}");
                return None;
            }
        };
        match self.log.append(&encoded) {
            Ok(recno) => {
                self.metrics().durable_log_appends.inc();
                self.metrics().durable_log_bytes.inc_by(encoded.len() as u64);
                Some(recno)
            }
            Err(err) => {
                error!("failed to append to the durable log: {err}");
                None
            }
        }
    }

    /// Queues `message` for transmission once log record `recno` is on disk.
    pub(crate) fn send_when_durable(&self, recno: u64, to: CommId, message: Message) {
        self.metrics().deferred_durable_actions.inc();
        self.fan_in.defer(recno, DurableAction::Send { to, message });
        self.fan_in_wakeup.notify_one();
    }

    /// Arranges for the transaction's durability callback once its own log
    /// write of operation `seqno` is on disk.
    pub(crate) fn callback_when_durable(&self, recno: u64, tg: TransactionGroup, seqno: u64) {
        self.metrics().deferred_durable_actions.inc();
        self.fan_in
            .defer(recno, DurableAction::OperationDurable { tg, seqno });
        self.fan_in_wakeup.notify_one();
    }

    /// Durably records a transaction outcome. The in-memory disposition map
    /// is updated only after the log write is on disk; unlocks key off the
    /// map, which upholds the rule that no unlock precedes a durable outcome.
    pub(crate) fn record_disposition(&self, tg: TransactionGroup, outcome: Vote) {
        if self.dispositions.has(&tg) {
            return;
        }
        let entry = LogEntry::Disposition {
            tg,
            outcome: outcome.as_u64(),
        };
        if let Some(recno) = self.append_log(&entry) {
            self.fan_in
                .defer(recno, DurableAction::DispositionDurable { tg, outcome });
            self.fan_in_wakeup.notify_one();
        }
    }

    fn drain_durable(self: &Arc<Self>) {
        let durable = self.log.durable();
        self.metrics().durable_upper_bound.set(durable as i64);
        for action in self.fan_in.drain(durable) {
            match action {
                DurableAction::Send { to, message } => self.send(to, message),
                DurableAction::OperationDurable { tg, seqno } => {
                    self.transaction(tg).log_durable(seqno, self);
                }
                DurableAction::DispositionDurable { tg, outcome } => {
                    if self.dispositions.put(tg, outcome) {
                        let (label, counter) = match outcome {
                            Vote::Commit => ("commit", &self.metrics().transactions_committed),
                            Vote::Abort => ("abort", &self.metrics().transactions_aborted),
                        };
                        counter.inc();
                        self.metrics()
                            .dispositions_recorded
                            .with_label_values(&[label])
                            .inc();
                    }
                    self.transaction(tg).externally_work_state_machine(self);
                }
            }
        }
    }

    // State table accessors, creating on first reference.

    pub(crate) fn transaction(&self, tg: TransactionGroup) -> Arc<Transaction> {
        self.transactions
            .entry(tg)
            .or_insert_with(|| Arc::new(Transaction::new(tg)))
            .clone()
    }

    pub(crate) fn local_voter(&self, tg: TransactionGroup) -> Arc<LocalVoter> {
        self.local_voters
            .entry(tg)
            .or_insert_with(|| Arc::new(LocalVoter::new(tg)))
            .clone()
    }

    pub(crate) fn global_voter(&self, tg: TransactionGroup) -> Arc<GlobalVoter> {
        self.global_voters
            .entry(tg)
            .or_insert_with(|| Arc::new(GlobalVoter::new(tg)))
            .clone()
    }

    // Replicated key-value store operations issued on behalf of transactions.

    fn fresh_nonce(&self) -> u64 {
        loop {
            let nonce = rand::thread_rng().next_u64();
            if nonce != 0 && !self.kvs_ops.contains_key(&nonce) {
                return nonce;
            }
        }
    }

    fn callback_tg(callback: &TxCallback) -> TransactionGroup {
        match callback {
            TxCallback::ReadLocked { tg, .. }
            | TxCallback::ReadValue { tg, .. }
            | TxCallback::ReadUnlocked { tg, .. }
            | TxCallback::WriteLocked { tg, .. }
            | TxCallback::WritePutDone { tg, .. }
            | TxCallback::WriteUnlocked { tg, .. } => *tg,
        }
    }

    fn kvs_target(&self, tg: TransactionGroup) -> Option<CommId> {
        let config = self.config();
        let group = config.get_group(tg.group)?;
        config.choose_kvs(group.dc)
    }

    pub(crate) fn issue_kvs_lock(
        &self,
        op: LockOp,
        table: Bytes,
        key: Bytes,
        tg: TransactionGroup,
        callback: TxCallback,
    ) {
        let Some(target) = self.kvs_target(tg) else {
            warn!("{tg} has no reachable key-value store; retrying later");
            return;
        };
        let nonce = self.fresh_nonce();
        self.kvs_ops.insert(nonce, PendingKvsOp::new(callback));
        self.send(
            target,
            Message::KvsLockOp {
                nonce,
                tg,
                table,
                key,
                op,
            },
        );
    }

    pub(crate) fn issue_kvs_read(
        &self,
        table: Bytes,
        key: Bytes,
        timestamp: u64,
        callback: TxCallback,
    ) {
        let tg = Self::callback_tg(&callback);
        let Some(target) = self.kvs_target(tg) else {
            warn!("{tg} has no reachable key-value store; retrying later");
            return;
        };
        let nonce = self.fresh_nonce();
        self.kvs_ops.insert(nonce, PendingKvsOp::new(callback));
        self.send(
            target,
            Message::KvsRepRd {
                nonce,
                table,
                key,
                timestamp,
            },
        );
    }

    pub(crate) fn issue_kvs_write(
        &self,
        flags: u8,
        table: Bytes,
        key: Bytes,
        timestamp: u64,
        value: Bytes,
        callback: TxCallback,
    ) {
        let tg = Self::callback_tg(&callback);
        let Some(target) = self.kvs_target(tg) else {
            warn!("{tg} has no reachable key-value store; retrying later");
            return;
        };
        let nonce = self.fresh_nonce();
        self.kvs_ops.insert(nonce, PendingKvsOp::new(callback));
        self.send(
            target,
            Message::KvsRepWr {
                nonce,
                flags,
                table,
                key,
                timestamp,
                value,
            },
        );
    }

    /// Re-drives every unfinished state machine and collects finished ones.
    fn pump(self: &Arc<Self>) {
        self.metrics().pump_iterations.inc();
        self.transactions.retain(|_, t| !t.finished());
        self.local_voters.retain(|_, v| !v.finished());
        self.global_voters.retain(|_, v| !v.finished());
        let stale = self.resend_interval() * KVS_OP_LIFETIMES;
        self.kvs_ops.retain(|_, op| op.issued.elapsed() < stale);

        let transactions: Vec<Arc<Transaction>> = self
            .transactions
            .iter()
            .map(|t| t.value().clone())
            .collect();
        for transaction in transactions {
            transaction.externally_work_state_machine(self);
        }
        let voters: Vec<Arc<LocalVoter>> = self
            .local_voters
            .iter()
            .map(|v| v.value().clone())
            .collect();
        for voter in voters {
            voter.externally_work_state_machine(self);
        }
        let voters: Vec<Arc<GlobalVoter>> = self
            .global_voters
            .iter()
            .map(|v| v.value().clone())
            .collect();
        for voter in voters {
            voter.externally_work_state_machine(self);
        }
    }

    // Message dispatch.

    fn handle(self: &Arc<Self>, from: CommId, message: Message) {
        self.metrics()
            .messages_received
            .with_label_values(&[message.name()])
            .inc();
        match message {
            Message::TxBegin { nonce } => self.process_begin(from, nonce),
            Message::TxRead {
                txid,
                nonce,
                seqno,
                table,
                key,
            } => {
                if let Some(tg) = self.client_tg(from, txid, nonce) {
                    self.transaction(tg)
                        .read(from, nonce, seqno, table, key, self);
                }
            }
            Message::TxWrite {
                txid,
                nonce,
                seqno,
                table,
                key,
                value,
            } => {
                if let Some(tg) = self.client_tg(from, txid, nonce) {
                    self.transaction(tg)
                        .write(from, nonce, seqno, table, key, value, self);
                }
            }
            Message::TxCommit { txid, nonce, seqno } => {
                if let Some(tg) = self.client_tg(from, txid, nonce) {
                    self.transaction(tg).prepare(from, nonce, seqno, self);
                }
            }
            Message::TxAbort { txid, nonce, seqno } => {
                if let Some(tg) = self.client_tg(from, txid, nonce) {
                    self.transaction(tg).abort(from, nonce, seqno, self);
                }
            }
            Message::TxWound { tg } => {
                self.transaction(tg).wound(self);
            }
            Message::Paxos2a { entry } => {
                if !entry.is_transaction_op() {
                    self.metrics()
                        .invalid_messages
                        .with_label_values(&["non_operation_2a"])
                        .inc();
                    return;
                }
                let Some(tg) = entry.transaction_group() else {
                    return;
                };
                self.transaction(tg).paxos_2a(entry, self);
            }
            Message::Paxos2b { tg, seqno } => {
                self.transaction(tg).paxos_2b(from, seqno, self);
            }
            Message::LvVote1a { tg, idx, ballot } => {
                self.local_voter(tg).vote_1a(from, idx as usize, ballot, self);
            }
            Message::LvVote1b {
                tg,
                idx,
                ballot,
                pvalue,
            } => {
                self.local_voter(tg)
                    .vote_1b(from, idx as usize, ballot, pvalue, self);
            }
            Message::LvVote2a { tg, idx, pvalue } => {
                self.local_voter(tg).vote_2a(from, idx as usize, pvalue, self);
            }
            Message::LvVote2b { tg, idx, pvalue } => {
                self.local_voter(tg).vote_2b(from, idx as usize, pvalue, self);
            }
            Message::LvVoteLearn { tg, idx, value } => {
                self.local_voter(tg).vote_learn(idx as usize, value, self);
            }
            Message::CommitRecord { tg, entries } => {
                if self.reply_known_outcome(from, tg) {
                    return;
                }
                self.transaction(tg).commit_record(entries, self);
            }
            Message::GvPropose { tg, command } => {
                if self.reply_known_outcome(from, tg) {
                    return;
                }
                self.global_voter(tg).process_propose(command, self);
            }
            Message::GvVote1a { tg, message } => {
                self.global_voter(tg).process_p1a(from, &message, self);
            }
            Message::GvVote1b { tg, message } => {
                self.global_voter(tg).process_p1b(&message, self);
            }
            Message::GvVote2a { tg, message } => {
                self.global_voter(tg).process_p2a(from, &message, self);
            }
            Message::GvVote2b { tg, message } => {
                self.global_voter(tg).process_p2b(&message, self);
            }
            Message::GvOutcome { tg, outcome } => {
                let Some(vote) = Vote::from_u64(outcome) else {
                    self.metrics()
                        .invalid_messages
                        .with_label_values(&["invalid_outcome"])
                        .inc();
                    return;
                };
                let config = self.config();
                // Record under this node's own execution of the transaction;
                // the sender may have addressed its copy of it.
                let local_tg = if config.is_member(tg.group, self.own_id()) {
                    Some(tg)
                } else {
                    config
                        .groups_for(self.own_id())
                        .first()
                        .map(|g| tg.with_group(*g))
                };
                if let Some(local_tg) = local_tg {
                    self.record_disposition(local_tg, vote);
                }
                // The sender's data center provably holds the outcome; stop
                // gossiping the commit record to it.
                if config.is_member(tg.txid.group, self.own_id()) {
                    if let Some(dc) = config.txman_dc(from) {
                        self.transaction(TransactionGroup::home(tg.txid))
                            .confirm_dc(dc, self);
                    }
                }
            }
            Message::KvsLockOpResp { nonce, rc } => {
                let Some((_, op)) = self.kvs_ops.remove(&nonce) else {
                    return;
                };
                match op.callback {
                    TxCallback::ReadLocked { tg, seqno } => {
                        self.transaction(tg).kvs_read_locked(seqno, rc, self);
                    }
                    TxCallback::WriteLocked { tg, seqno } => {
                        self.transaction(tg).kvs_write_locked(seqno, rc, self);
                    }
                    TxCallback::ReadUnlocked { tg, seqno } => {
                        self.transaction(tg).kvs_read_unlocked(seqno, self);
                    }
                    TxCallback::WriteUnlocked { tg, seqno } => {
                        self.transaction(tg).kvs_write_unlocked(seqno, self);
                    }
                    other => {
                        debug!("lock response routed to mismatched callback {other:?}");
                    }
                }
            }
            Message::KvsRepRdResp {
                nonce,
                rc,
                timestamp,
                value,
            } => {
                let Some((_, op)) = self.kvs_ops.remove(&nonce) else {
                    return;
                };
                match op.callback {
                    TxCallback::ReadValue { tg, seqno } => {
                        self.transaction(tg)
                            .kvs_read_value(seqno, rc, timestamp, value, self);
                    }
                    other => {
                        debug!("read response routed to mismatched callback {other:?}");
                    }
                }
            }
            Message::KvsRepWrResp { nonce, rc } => {
                let Some((_, op)) = self.kvs_ops.remove(&nonce) else {
                    return;
                };
                match op.callback {
                    TxCallback::WritePutDone { tg, seqno } => {
                        self.transaction(tg).kvs_write_put_done(seqno, rc, self);
                    }
                    other => {
                        debug!("write response routed to mismatched callback {other:?}");
                    }
                }
            }
            other => {
                debug!("transaction manager ignoring {} message", other.name());
                self.metrics()
                    .invalid_messages
                    .with_label_values(&["unexpected_type"])
                    .inc();
            }
        }
    }

    fn process_begin(self: &Arc<Self>, from: CommId, nonce: u64) {
        let config = self.config();
        let own_groups = config.groups_for(self.own_id());
        let Some(group_id) = own_groups.first().copied() else {
            self.respond_unavailable(from, nonce);
            return;
        };
        let Some(dcs) = config.choose_groups(group_id) else {
            self.respond_unavailable(from, nonce);
            return;
        };
        let group = config
            .get_group(group_id)
            .expect("groups_for returned a live group")
            .clone();
        let txid = TransactionId::new(group_id, now_micros(), rand::thread_rng().next_u64());
        let tg = TransactionGroup::home(txid);
        self.metrics().transactions_begun.inc();
        self.transaction(tg)
            .begin(from, nonce, txid.start, &group, dcs, self);
    }

    /// Client operations address the home group; this node must be a member.
    fn client_tg(&self, from: CommId, txid: TransactionId, nonce: u64) -> Option<TransactionGroup> {
        if !self.config().is_member(txid.group, self.own_id()) {
            self.send(
                from,
                Message::ClientResponse {
                    nonce,
                    reply: ClientReply::Finished {
                        rc: ReturnCode::Unavailable,
                    },
                },
            );
            return None;
        }
        Some(TransactionGroup::home(txid))
    }

    fn respond_unavailable(&self, to: CommId, nonce: u64) {
        self.send(
            to,
            Message::ClientResponse {
                nonce,
                reply: ClientReply::Finished {
                    rc: ReturnCode::Unavailable,
                },
            },
        );
    }

    /// If this transaction's outcome is already recorded, remind the peer and
    /// skip protocol work; the gossiped outcome lets a partitioned data
    /// center catch up.
    fn reply_known_outcome(&self, from: CommId, tg: TransactionGroup) -> bool {
        if let Some(vote) = self.dispositions.get(&tg) {
            self.send(
                from,
                Message::GvOutcome {
                    tg,
                    outcome: vote.as_u64(),
                },
            );
            return true;
        }
        false
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Network-facing wrapper, agnostic to the actual networking stack used.
pub struct TxmanService(pub Arc<TransactionManager>);

#[async_trait]
impl NetworkService for TxmanService {
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
