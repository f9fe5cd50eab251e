// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! The commit path of a geo-replicated, strictly-serializable transactional
//! key-value store: the transaction state machine, the per-data-center and
//! cross-data-center voters, the key-value store lock manager and
//! replicators, and the durable log that gates every protocol step.

mod context;
mod disposition;
mod durable_log;
mod error;
mod generalized_paxos;
mod global_voter;
mod kvs;
mod kvs_client;
mod local_voter;
mod message;
mod metrics;
mod network;
mod node;
mod paxos_synod;
mod transaction;
mod types;

#[cfg(test)]
mod tests;

pub use durable_log::DurableLog;
pub use error::{ConsusError, ConsusResult, ReturnCode};
pub use generalized_paxos::{
    BallotKind, CStruct, Command, CommandInterference, GpBallot, MessageP1a, MessageP1b,
    MessageP2a, MessageP2b, QuorumRule,
};
pub use kvs::{Datastore, KvsNode, KvsService, MemStore, StoreGet};
pub use message::{ClientReply, LockOp, LogEntry, Message, WoundAction, WRITE_TOMBSTONE};
pub use network::{NetworkClient, NetworkService, TestNetwork, TestNetworkClient};
pub use node::{TransactionManager, TxmanService};
pub use paxos_synod::{Ballot, PValue};
pub use types::{TransactionGroup, TransactionId, Vote, VOTE_ABORT, VOTE_COMMIT};
