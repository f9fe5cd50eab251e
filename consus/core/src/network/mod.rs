// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Messaging abstractions, agnostic to the actual networking stack used.
//! Wire framing, connection pooling, and transport security live behind
//! these traits.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use consus_config::CommId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ConsusResult;
use crate::message::Message;
use crate::metrics::Metrics;

mod test_network;
pub use test_network::*;

/// Sends messages to peers. Delivery is best-effort; every protocol message
/// is retried by its state machine on the resend interval.
#[async_trait]
pub trait NetworkClient: Send + Sync + 'static {
    async fn send(&self, peer: CommId, message: Bytes) -> ConsusResult<()>;
}

/// Handles messages arriving from peers. The peer id is established by the
/// transport.
#[async_trait]
pub trait NetworkService: Send + Sync + 'static {
    async fn handle_message(&self, peer: CommId, message: Bytes) -> ConsusResult<()>;
}

/// A queue decoupling synchronous state machines from the async network
/// client. State machines enqueue; a background task encodes and sends.
pub(crate) struct Outbox {
    sender: mpsc::UnboundedSender<(CommId, Message)>,
}

impl Outbox {
    pub fn start(client: Arc<dyn NetworkClient>, metrics: Arc<Metrics>) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<(CommId, Message)>();
        let handle = tokio::spawn(async move {
            while let Some((peer, message)) = receiver.recv().await {
                let encoded = match message.encode() {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        debug!("failed to encode {} message: {err}", message.name());
                        continue;
                    }
                };
                metrics.node_metrics.messages_sent.inc();
                if let Err(err) = client.send(peer, encoded).await {
                    debug!("failed to send {} to {peer}: {err}", message.name());
                }
            }
        });
        (Self { sender }, handle)
    }

    pub fn send(&self, to: CommId, message: Message) {
        self.sender.send((to, message)).ok();
    }
}
