// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Transaction-manager-side state for replicated key-value store operations.
//! Each outstanding lock, read, or write is keyed by a fresh nonce; the
//! response routes back to the owning transaction through the recorded
//! callback. Lost responses are covered by the transaction re-issuing the
//! operation under a new nonce on its resend interval.

use std::time::Instant;

use crate::types::TransactionGroup;

/// Where a key-value store response should land in the owning transaction.
#[derive(Clone, Copy, Debug)]
pub(crate) enum TxCallback {
    ReadLocked { tg: TransactionGroup, seqno: u64 },
    ReadValue { tg: TransactionGroup, seqno: u64 },
    ReadUnlocked { tg: TransactionGroup, seqno: u64 },
    WriteLocked { tg: TransactionGroup, seqno: u64 },
    WritePutDone { tg: TransactionGroup, seqno: u64 },
    WriteUnlocked { tg: TransactionGroup, seqno: u64 },
}

pub(crate) struct PendingKvsOp {
    pub callback: TxCallback,
    pub issued: Instant,
}

impl PendingKvsOp {
    pub fn new(callback: TxCallback) -> Self {
        Self {
            callback,
            issued: Instant::now(),
        }
    }
}
