// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

use consus_config::CommId;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use thiserror::Error;

/// Outcome code carried on the wire and surfaced to clients. The first block
/// is terminal per-operation, `LessDurable` is degraded, the middle block is
/// transient, and the last block is fatal for the affected state object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr)]
pub enum ReturnCode {
    Success,
    LessDurable,
    NotFound,
    Aborted,
    Committed,
    UnknownTable,
    NonePending,
    Invalid,
    Timeout,
    Interrupted,
    SeeErrno,
    CoordFail,
    Unavailable,
    ServerError,
    Internal,
    Garbage,
}

impl Default for ReturnCode {
    fn default() -> Self {
        ReturnCode::Garbage
    }
}

impl ReturnCode {
    /// Codes a client can act on without retrying.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReturnCode::Success
                | ReturnCode::LessDurable
                | ReturnCode::NotFound
                | ReturnCode::Aborted
                | ReturnCode::Committed
                | ReturnCode::UnknownTable
                | ReturnCode::Invalid
        )
    }
}

/// Errors internal to a node. Protocol-visible failures travel as
/// [`ReturnCode`]s instead; this type is for conditions that stop a local
/// component.
#[derive(Error, Debug)]
pub enum ConsusError {
    #[error("malformed message: {0}")]
    MalformedMessage(bcs::Error),

    #[error("serialization failed: {0}")]
    SerializationFailure(bcs::Error),

    #[error("unknown peer {0}")]
    UnknownPeer(CommId),

    #[error("durable log closed")]
    LogClosed,

    #[error("log directory is not configured")]
    LogDirNotConfigured,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node is shutting down")]
    Shutdown,
}

pub type ConsusResult<T> = Result<T, ConsusError>;
