// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

use dashmap::DashMap;

use crate::types::{TransactionGroup, Vote};

/// The per-node table of decided transaction outcomes.
///
/// Presence of a transaction group here means its outcome is durable locally;
/// every voter for that transaction is finished and eligible for collection,
/// and only now may unlocks for it be issued.
#[derive(Default)]
pub(crate) struct DispositionMap {
    map: DashMap<TransactionGroup, Vote>,
}

impl DispositionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `outcome`; the first recorded outcome wins. Returns whether
    /// this call inserted it.
    pub fn put(&self, tg: TransactionGroup, outcome: Vote) -> bool {
        let mut inserted = false;
        self.map.entry(tg).or_insert_with(|| {
            inserted = true;
            outcome
        });
        inserted
    }

    pub fn get(&self, tg: &TransactionGroup) -> Option<Vote> {
        self.map.get(tg).map(|v| *v)
    }

    pub fn has(&self, tg: &TransactionGroup) -> bool {
        self.map.contains_key(tg)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;
    use consus_config::PaxosGroupId;

    #[test]
    fn first_outcome_wins() {
        let dispositions = DispositionMap::new();
        let tg = TransactionGroup::home(TransactionId::new(PaxosGroupId::new(1), 10, 20));
        assert!(!dispositions.has(&tg));
        assert!(dispositions.put(tg, Vote::Commit));
        assert!(!dispositions.put(tg, Vote::Abort));
        assert_eq!(dispositions.get(&tg), Some(Vote::Commit));
        assert_eq!(dispositions.len(), 1);
    }
}
