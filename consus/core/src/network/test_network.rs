// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! An in-process network for tests and local clusters: every registered
//! service gets a delivery queue, and clients route into those queues. Links
//! can be cut and healed to simulate partitions; cut links drop messages
//! silently, exactly like a dead TCP peer.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use consus_config::CommId;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{NetworkClient, NetworkService};
use crate::error::{ConsusError, ConsusResult};

#[derive(Default)]
struct Hub {
    routes: DashMap<CommId, mpsc::UnboundedSender<(CommId, Bytes)>>,
    cut_links: Mutex<HashSet<(CommId, CommId)>>,
}

/// The shared fabric connecting every node of an in-process deployment.
#[derive(Clone, Default)]
pub struct TestNetwork {
    hub: Arc<Hub>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` as the handler for messages addressed to `id` and
    /// starts its delivery task.
    pub fn register(&self, id: CommId, service: Arc<dyn NetworkService>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<(CommId, Bytes)>();
        self.hub.routes.insert(id, sender);
        let task = tokio::spawn(async move {
            while let Some((from, bytes)) = receiver.recv().await {
                service.handle_message(from, bytes).await.ok();
            }
        });
        self.tasks.lock().push(task);
    }

    /// Returns a client that sends as `from`.
    pub fn client(&self, from: CommId) -> Arc<TestNetworkClient> {
        Arc::new(TestNetworkClient {
            from,
            hub: self.hub.clone(),
        })
    }

    /// Cuts the link between `a` and `b` in both directions.
    pub fn partition(&self, a: CommId, b: CommId) {
        let mut cut = self.hub.cut_links.lock();
        cut.insert((a, b));
        cut.insert((b, a));
    }

    /// Isolates `node` from every other registered node.
    pub fn isolate(&self, node: CommId) {
        let peers: Vec<CommId> = self.hub.routes.iter().map(|e| *e.key()).collect();
        for peer in peers {
            if peer != node {
                self.partition(node, peer);
            }
        }
    }

    pub fn heal(&self, a: CommId, b: CommId) {
        let mut cut = self.hub.cut_links.lock();
        cut.remove(&(a, b));
        cut.remove(&(b, a));
    }

    pub fn heal_all(&self) {
        self.hub.cut_links.lock().clear();
    }
}

impl Drop for TestNetwork {
    fn drop(&mut self) {
        if Arc::strong_count(&self.tasks) == 1 {
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
        }
    }
}

pub struct TestNetworkClient {
    from: CommId,
    hub: Arc<Hub>,
}

#[async_trait]
impl NetworkClient for TestNetworkClient {
    async fn send(&self, peer: CommId, message: Bytes) -> ConsusResult<()> {
        if self.hub.cut_links.lock().contains(&(self.from, peer)) {
            // A cut link swallows traffic; retransmission is the sender's job.
            return Ok(());
        }
        match self.hub.routes.get(&peer) {
            Some(route) => {
                route.send((self.from, message)).ok();
                Ok(())
            }
            None => Err(ConsusError::UnknownPeer(peer)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct RecordingService {
        received: SyncMutex<Vec<(CommId, Bytes)>>,
    }

    #[async_trait]
    impl NetworkService for RecordingService {
        async fn handle_message(&self, peer: CommId, message: Bytes) -> ConsusResult<()> {
            self.received.lock().push((peer, message));
            Ok(())
        }
    }

    #[tokio::test]
    async fn routes_and_partitions() {
        let network = TestNetwork::new();
        let a = CommId::new(1);
        let b = CommId::new(2);
        let service = Arc::new(RecordingService::default());
        network.register(b, service.clone());

        let client = network.client(a);
        client.send(b, Bytes::from_static(b"hi")).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(service.received.lock().len(), 1);
        assert_eq!(service.received.lock()[0].0, a);

        network.partition(a, b);
        client.send(b, Bytes::from_static(b"lost")).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(service.received.lock().len(), 1);

        network.heal(a, b);
        client.send(b, Bytes::from_static(b"back")).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(service.received.lock().len(), 2);

        assert!(client.send(CommId::new(9), Bytes::new()).await.is_err());
    }
}
