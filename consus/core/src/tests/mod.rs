// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-crate tests that need visibility into the state machines.

use std::sync::Arc;
use std::time::Duration;

use consus_config::{local_cluster, LocalCluster, Parameters};
use prometheus::Registry;
use tempfile::TempDir;

use crate::network::TestNetwork;
use crate::node::{TransactionManager, TxmanService};

mod transaction_tests;

pub(crate) struct TestDeployment {
    pub network: TestNetwork,
    pub cluster: LocalCluster,
    pub txmans: Vec<Arc<TransactionManager>>,
    _log_dirs: Vec<TempDir>,
}

/// Starts every transaction manager of a local cluster on an in-process
/// network, with short intervals so tests converge quickly.
pub(crate) fn deploy_txmans(kvs_per_dc: usize, members: usize, dcs: usize) -> TestDeployment {
    let cluster = local_cluster(kvs_per_dc, members, dcs);
    let network = TestNetwork::new();
    let mut txmans = Vec::new();
    let mut log_dirs = Vec::new();
    for ids in &cluster.txman_ids {
        for id in ids {
            let log_dir = TempDir::new().unwrap();
            let parameters = Parameters {
                resend_interval: Duration::from_millis(50),
                pump_interval: Duration::from_millis(10),
                log_dir: Some(log_dir.path().to_path_buf()),
            };
            let node = TransactionManager::start(
                *id,
                Arc::new(cluster.config.clone()),
                parameters,
                Registry::new(),
                network.client(*id),
            )
            .unwrap();
            network.register(*id, Arc::new(TxmanService(node.clone())));
            txmans.push(node);
            log_dirs.push(log_dir);
        }
    }
    TestDeployment {
        network,
        cluster,
        txmans,
        _log_dirs: log_dirs,
    }
}

/// Polls `predicate` until it holds or the timeout expires.
pub(crate) async fn eventually(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
