// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end commit-path scenarios over an in-process cluster: transaction
//! managers with real durable logs, key-value stores with in-memory
//! datastores, and a test network that can partition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use consus_config::{local_cluster, CommId, LocalCluster, Parameters};
use consus_core::{
    ClientReply, ConsusResult, Datastore as _, KvsNode, KvsService, LockOp, MemStore, Message,
    NetworkService, ReturnCode, TestNetwork, TransactionGroup, TransactionId, TransactionManager,
    TxmanService, Vote,
};
use parking_lot::Mutex;
use prometheus::Registry;
use tempfile::TempDir;

const CLIENT_ID: CommId = CommId::new(77_777);

/// Records every message addressed to it; the tests poll for replies.
#[derive(Default)]
struct RecordingClient {
    replies: Mutex<HashMap<u64, ClientReply>>,
    messages: Mutex<Vec<Message>>,
}

#[async_trait]
impl NetworkService for RecordingClient {
    async fn handle_message(&self, _peer: CommId, message: Bytes) -> ConsusResult<()> {
        let message = Message::decode(&message)?;
        if let Message::ClientResponse { nonce, reply } = &message {
            self.replies.lock().insert(*nonce, reply.clone());
        }
        self.messages.lock().push(message);
        Ok(())
    }
}

impl RecordingClient {
    fn find_message<T>(&self, mut pick: impl FnMut(&Message) -> Option<T>) -> Option<T> {
        self.messages.lock().iter().find_map(|m| pick(m))
    }

    async fn await_message<T>(
        &self,
        timeout: Duration,
        mut pick: impl FnMut(&Message) -> Option<T>,
    ) -> T {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.find_message(&mut pick) {
                return found;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for a message"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

struct Deployment {
    network: TestNetwork,
    cluster: LocalCluster,
    txmans: Vec<Arc<TransactionManager>>,
    #[allow(dead_code)]
    kvss: Vec<Arc<KvsNode>>,
    stores: Vec<Arc<MemStore>>,
    client: Arc<RecordingClient>,
    _log_dirs: Vec<TempDir>,
}

fn deploy(
    kvs_per_dc: usize,
    members: usize,
    dcs: usize,
    tables: &[&str],
    with_txmans: bool,
) -> Deployment {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let cluster = local_cluster(kvs_per_dc, members, dcs);
    let network = TestNetwork::new();
    let parameters = |log_dir: Option<std::path::PathBuf>| Parameters {
        resend_interval: Duration::from_millis(50),
        pump_interval: Duration::from_millis(10),
        log_dir,
    };

    let mut txmans = Vec::new();
    let mut log_dirs = Vec::new();
    if with_txmans {
        for ids in &cluster.txman_ids {
            for id in ids {
                let log_dir = TempDir::new().unwrap();
                let node = TransactionManager::start(
                    *id,
                    Arc::new(cluster.config.clone()),
                    parameters(Some(log_dir.path().to_path_buf())),
                    Registry::new(),
                    network.client(*id),
                )
                .unwrap();
                network.register(*id, Arc::new(TxmanService(node.clone())));
                txmans.push(node);
                log_dirs.push(log_dir);
            }
        }
    }

    let mut kvss = Vec::new();
    let mut stores = Vec::new();
    for ids in &cluster.kvs_ids {
        for id in ids {
            let store = Arc::new(MemStore::with_tables(tables.iter().map(|t| t.as_bytes())));
            let node = KvsNode::start(
                *id,
                Arc::new(cluster.config.clone()),
                parameters(None),
                Registry::new(),
                network.client(*id),
                store.clone(),
            );
            network.register(*id, Arc::new(KvsService(node.clone())));
            kvss.push(node);
            stores.push(store);
        }
    }

    let client = Arc::new(RecordingClient::default());
    network.register(CLIENT_ID, client.clone());

    Deployment {
        network,
        cluster,
        txmans,
        kvss,
        stores,
        client,
        _log_dirs: log_dirs,
    }
}

impl Deployment {
    fn home_txman(&self) -> CommId {
        self.cluster.txman_ids[0][0]
    }

    async fn send(&self, to: CommId, message: Message) {
        use consus_core::NetworkClient as _;
        self.network
            .client(CLIENT_ID)
            .send(to, message.encode().unwrap())
            .await
            .unwrap();
    }

    async fn await_reply(&self, nonce: u64, timeout: Duration) -> ClientReply {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(reply) = self.client.replies.lock().get(&nonce) {
                return reply.clone();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for a reply to nonce {nonce}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn begin(&self, nonce: u64) -> (TransactionId, Vec<CommId>) {
        self.send(self.home_txman(), Message::TxBegin { nonce }).await;
        match self.await_reply(nonce, Duration::from_secs(10)).await {
            ClientReply::Begun { txid, members } => (txid, members),
            other => panic!("begin answered with {other:?}"),
        }
    }

    async fn write(&self, txid: TransactionId, nonce: u64, seqno: u64, table: &str, key: &str, value: &str) {
        self.send(
            self.home_txman(),
            Message::TxWrite {
                txid,
                nonce,
                seqno,
                table: Bytes::copy_from_slice(table.as_bytes()),
                key: Bytes::copy_from_slice(key.as_bytes()),
                value: Bytes::copy_from_slice(value.as_bytes()),
            },
        )
        .await;
        match self.await_reply(nonce, Duration::from_secs(10)).await {
            ClientReply::Write { rc } => assert_eq!(rc, ReturnCode::Success),
            other => panic!("write answered with {other:?}"),
        }
    }

    async fn read(
        &self,
        txid: TransactionId,
        nonce: u64,
        seqno: u64,
        table: &str,
        key: &str,
    ) -> (ReturnCode, u64, Option<Bytes>) {
        self.send(
            self.home_txman(),
            Message::TxRead {
                txid,
                nonce,
                seqno,
                table: Bytes::copy_from_slice(table.as_bytes()),
                key: Bytes::copy_from_slice(key.as_bytes()),
            },
        )
        .await;
        match self.await_reply(nonce, Duration::from_secs(10)).await {
            ClientReply::Read {
                rc,
                timestamp,
                value,
            } => (rc, timestamp, value),
            other => panic!("read answered with {other:?}"),
        }
    }

    async fn commit(&self, txid: TransactionId, nonce: u64, seqno: u64) -> ReturnCode {
        self.send(
            self.home_txman(),
            Message::TxCommit { txid, nonce, seqno },
        )
        .await;
        match self.await_reply(nonce, Duration::from_secs(20)).await {
            ClientReply::Finished { rc } => rc,
            other => panic!("commit answered with {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_dc_write_commit_read() {
    let deployment = deploy(3, 3, 1, &["t"], true);

    let (txid, members) = deployment.begin(1).await;
    assert_eq!(members.len(), 3);
    deployment.write(txid, 2, 1, "t", "k", "v").await;
    assert_eq!(deployment.commit(txid, 3, 2).await, ReturnCode::Success);

    // A fresh transaction observes the committed value at a timestamp no
    // older than the writer's start.
    let (txid2, _) = deployment.begin(4).await;
    let (rc, timestamp, value) = deployment.read(txid2, 5, 1, "t", "k").await;
    assert_eq!(rc, ReturnCode::Success);
    assert_eq!(value.as_deref(), Some(b"v".as_slice()));
    assert!(timestamp >= txid.start);
    assert!(txid2.start > timestamp || txid2.start >= txid.start);
    assert_eq!(deployment.commit(txid2, 6, 2).await, ReturnCode::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_your_writes_before_commit() {
    let deployment = deploy(3, 3, 1, &["t"], true);

    let (txid, _) = deployment.begin(1).await;
    deployment.write(txid, 2, 1, "t", "k", "v1").await;
    let (rc, _, value) = deployment.read(txid, 3, 2, "t", "k").await;
    assert_eq!(rc, ReturnCode::Success);
    assert_eq!(value.as_deref(), Some(b"v1".as_slice()));
    assert_eq!(deployment.commit(txid, 4, 3).await, ReturnCode::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_key_reads_not_found() {
    let deployment = deploy(3, 3, 1, &["t"], true);

    let (txid, _) = deployment.begin(1).await;
    let (rc, _, value) = deployment.read(txid, 2, 1, "t", "nope").await;
    assert_eq!(rc, ReturnCode::NotFound);
    assert_eq!(value, None);
    assert_eq!(deployment.commit(txid, 3, 2).await, ReturnCode::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_abort_rolls_back() {
    let deployment = deploy(3, 3, 1, &["t"], true);

    let (txid, _) = deployment.begin(1).await;
    deployment.write(txid, 2, 1, "t", "k", "doomed").await;
    deployment
        .send(
            deployment.home_txman(),
            Message::TxAbort {
                txid,
                nonce: 3,
                seqno: 2,
            },
        )
        .await;
    match deployment.await_reply(3, Duration::from_secs(20)).await {
        ClientReply::Finished { rc } => assert_eq!(rc, ReturnCode::Aborted),
        other => panic!("abort answered with {other:?}"),
    }

    // Nothing leaked into the stores, and the key is lockable again.
    let (txid2, _) = deployment.begin(4).await;
    let (rc, _, value) = deployment.read(txid2, 5, 1, "t", "k").await;
    assert_eq!(rc, ReturnCode::NotFound);
    assert_eq!(value, None);
    assert_eq!(deployment.commit(txid2, 6, 2).await, ReturnCode::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wound_wait_prefers_the_older_transaction() {
    // No transaction managers: drive the lock managers directly and observe
    // the wound reaching the (absent) home group member as a network message.
    let deployment = deploy(3, 1, 1, &["t"], false);
    let group = deployment.cluster.config.groups[0].id;
    let tm_id = deployment.cluster.txman_ids[0][0];
    let recorder = Arc::new(RecordingClient::default());
    deployment.network.register(tm_id, recorder.clone());

    let kvs = deployment.cluster.kvs_ids[0][0];
    let younger = TransactionGroup::home(TransactionId::new(group, 10, 1));
    let older = TransactionGroup::home(TransactionId::new(group, 5, 2));
    let table = Bytes::from_static(b"t");
    let key = Bytes::from_static(b"k");
    let lock_op = |nonce, tg, op| Message::KvsLockOp {
        nonce,
        tg,
        table: table.clone(),
        key: key.clone(),
        op,
    };

    // The younger transaction takes the lock.
    deployment.send(kvs, lock_op(1, younger, LockOp::Lock)).await;
    let rc = deployment
        .client
        .await_message(Duration::from_secs(10), |m| match m {
            Message::KvsLockOpResp { nonce: 1, rc } => Some(*rc),
            _ => None,
        })
        .await;
    assert_eq!(rc, ReturnCode::Success);

    // The older transaction queues behind it and wounds it: the younger
    // transaction's home group is told to abort-vote.
    deployment.send(kvs, lock_op(2, older, LockOp::Lock)).await;
    let wounded = recorder
        .await_message(Duration::from_secs(10), |m| match m {
            Message::TxWound { tg } => Some(*tg),
            _ => None,
        })
        .await;
    assert_eq!(wounded, younger);

    // Unlocking the younger transaction hands the lock to the older one; a
    // re-issued lock request then succeeds immediately.
    deployment.send(kvs, lock_op(3, younger, LockOp::Unlock)).await;
    deployment
        .client
        .await_message(Duration::from_secs(10), |m| match m {
            Message::KvsLockOpResp { nonce: 3, .. } => Some(()),
            _ => None,
        })
        .await;
    deployment.send(kvs, lock_op(4, older, LockOp::Lock)).await;
    let rc = deployment
        .client
        .await_message(Duration::from_secs(10), |m| match m {
            Message::KvsLockOpResp { nonce: 4, rc } => Some(*rc),
            _ => None,
        })
        .await;
    assert_eq!(rc, ReturnCode::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replica_disagreement_retries_until_consistent() {
    // Start the stores with no tables, then create the table everywhere
    // except the first replica of the key under test.
    let deployment = deploy(3, 1, 1, &[], false);
    let dc = deployment.cluster.config.data_centers[0].id;
    let rs = deployment.cluster.config.hash(dc, b"t", b"k").unwrap();
    let lagging = rs.replicas[0];
    let mut lagging_store = None;
    for (id, store) in deployment.cluster.kvs_ids[0].iter().zip(&deployment.stores) {
        if *id == lagging {
            lagging_store = Some(store.clone());
        } else {
            store.create_table(b"t");
        }
    }
    let lagging_store = lagging_store.expect("first replica is one of the stores");

    // SUCCESS, SUCCESS, UNKNOWN_TABLE is a disagreement: the operation clears
    // its state and retries instead of answering.
    let kvs = deployment.cluster.kvs_ids[0][0];
    deployment
        .send(
            kvs,
            Message::KvsRepWr {
                nonce: 9,
                flags: 0,
                table: Bytes::from_static(b"t"),
                key: Bytes::from_static(b"k"),
                timestamp: 100,
                value: Bytes::from_static(b"v"),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(deployment
        .client
        .find_message(|m| match m {
            Message::KvsRepWrResp { nonce: 9, rc } => Some(*rc),
            _ => None,
        })
        .is_none());

    // Once the lagging replica catches up, a consistent retry succeeds.
    lagging_store.create_table(b"t");
    let rc = deployment
        .client
        .await_message(Duration::from_secs(10), |m| match m {
            Message::KvsRepWrResp { nonce: 9, rc } => Some(*rc),
            _ => None,
        })
        .await;
    assert_eq!(rc, ReturnCode::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn partitioned_data_center_catches_up_after_commit() {
    let deployment = deploy(1, 3, 3, &["t"], true);

    // Cut the third data center's transaction managers off before committing.
    let isolated: Vec<CommId> = deployment.cluster.txman_ids[2].clone();
    for id in &isolated {
        deployment.network.isolate(*id);
    }

    let (txid, _) = deployment.begin(1).await;
    deployment.write(txid, 2, 1, "t", "k", "v").await;
    // Two of three data centers are a quorum; the commit must land.
    assert_eq!(deployment.commit(txid, 3, 2).await, ReturnCode::Success);

    // After the partition heals, commit-record gossip catches the third data
    // center up and it records the same outcome.
    deployment.network.heal_all();
    let third_group = deployment.cluster.config.groups[2].id;
    let tg = TransactionGroup::home(txid).with_group(third_group);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    'outer: loop {
        for tm in &deployment.txmans[6..9] {
            if tm.disposition(&tg) == Some(Vote::Commit) {
                break 'outer;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "the partitioned data center never learned the outcome"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
