// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

pub(crate) struct Metrics {
    pub node_metrics: NodeMetrics,
}

pub(crate) fn initialise_metrics(registry: Registry) -> Arc<Metrics> {
    let node_metrics = NodeMetrics::new(&registry);
    Arc::new(Metrics { node_metrics })
}

#[cfg(test)]
pub(crate) fn test_metrics() -> Arc<Metrics> {
    initialise_metrics(Registry::new())
}

pub(crate) struct NodeMetrics {
    pub transactions_begun: IntCounter,
    pub transactions_committed: IntCounter,
    pub transactions_aborted: IntCounter,
    pub messages_received: IntCounterVec,
    pub messages_sent: IntCounter,
    pub invalid_messages: IntCounterVec,
    pub durable_log_appends: IntCounter,
    pub durable_log_bytes: IntCounter,
    pub durable_upper_bound: IntGauge,
    pub deferred_durable_actions: IntCounter,
    pub pump_iterations: IntCounter,
    pub lock_wounds: IntCounterVec,
    pub replicator_mixed_responses: IntCounter,
    pub dispositions_recorded: IntCounterVec,
}

impl NodeMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            transactions_begun: register_int_counter_with_registry!(
                "transactions_begun",
                "Number of transactions begun on this node as the home group",
                registry,
            )
            .unwrap(),
            transactions_committed: register_int_counter_with_registry!(
                "transactions_committed",
                "Number of transactions that reached the COMMITTED state",
                registry,
            )
            .unwrap(),
            transactions_aborted: register_int_counter_with_registry!(
                "transactions_aborted",
                "Number of transactions that reached the ABORTED state",
                registry,
            )
            .unwrap(),
            messages_received: register_int_counter_vec_with_registry!(
                "messages_received",
                "Messages processed, by wire type",
                &["type"],
                registry,
            )
            .unwrap(),
            messages_sent: register_int_counter_with_registry!(
                "messages_sent",
                "Messages handed to the network client",
                registry,
            )
            .unwrap(),
            invalid_messages: register_int_counter_vec_with_registry!(
                "invalid_messages",
                "Messages dropped during validation, by reason",
                &["reason"],
                registry,
            )
            .unwrap(),
            durable_log_appends: register_int_counter_with_registry!(
                "durable_log_appends",
                "Records appended to the durable log",
                registry,
            )
            .unwrap(),
            durable_log_bytes: register_int_counter_with_registry!(
                "durable_log_bytes",
                "Payload bytes appended to the durable log",
                registry,
            )
            .unwrap(),
            durable_upper_bound: register_int_gauge_with_registry!(
                "durable_upper_bound",
                "Highest log record number known durable",
                registry,
            )
            .unwrap(),
            deferred_durable_actions: register_int_counter_with_registry!(
                "deferred_durable_actions",
                "Sends and callbacks gated behind a log flush",
                registry,
            )
            .unwrap(),
            pump_iterations: register_int_counter_with_registry!(
                "pump_iterations",
                "Background passes over unfinished state machines",
                registry,
            )
            .unwrap(),
            lock_wounds: register_int_counter_vec_with_registry!(
                "lock_wounds",
                "Wound messages issued by the lock manager, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            replicator_mixed_responses: register_int_counter_with_registry!(
                "replicator_mixed_responses",
                "Replicated operations that observed mixed terminal codes and retried",
                registry,
            )
            .unwrap(),
            dispositions_recorded: register_int_counter_vec_with_registry!(
                "dispositions_recorded",
                "Transaction outcomes recorded durably, by outcome",
                &["outcome"],
                registry,
            )
            .unwrap(),
        }
    }
}
