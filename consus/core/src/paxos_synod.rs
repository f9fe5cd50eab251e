// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! A single-decree Paxos synod. The local voter runs one synod per group
//! member; each synod decides that member's commit-or-abort vote.
//!
//! The struct holds both the acceptor role and the (potential) leader role of
//! one server. Message I/O stays outside: callers feed phase transitions in
//! and forward the returned ballots and pvalues to their peers.

use consus_config::{CommId, PaxosGroup};
use serde::{Deserialize, Serialize};

/// A ballot, totally ordered by `(number, leader)`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ballot {
    pub number: u64,
    pub leader: CommId,
}

impl Ballot {
    pub fn new(number: u64, leader: CommId) -> Self {
        Self { number, leader }
    }
}

/// A ballot paired with the value it carries. Ordered by ballot; the value
/// tags along.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PValue {
    pub ballot: Ballot,
    pub value: u64,
}

impl PValue {
    pub fn new(ballot: Ballot, value: u64) -> Self {
        Self { ballot, value }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Phase1,
    Phase2,
    Learned,
}

#[derive(Clone, Copy, Debug, Default)]
struct Promise {
    ballot: Ballot,
    pvalue: PValue,
}

pub struct PaxosSynod {
    us: CommId,
    group: PaxosGroup,

    acceptor_ballot: Ballot,
    acceptor_pvalue: PValue,

    leader_phase: Phase,
    leader_ballot: Ballot,
    leader_pvalue: PValue,
    promises: Vec<Promise>,

    value: u64,
}

impl PaxosSynod {
    pub fn new(us: CommId, group: PaxosGroup) -> Self {
        let members = group.size();
        Self {
            us,
            group,
            acceptor_ballot: Ballot::default(),
            acceptor_pvalue: PValue::default(),
            leader_phase: Phase::Phase1,
            leader_ballot: Ballot::default(),
            leader_pvalue: PValue::default(),
            promises: vec![Promise::default(); members],
            value: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.leader_phase
    }

    /// Starts (or restarts) leadership with a ballot strictly greater than
    /// every ballot this synod has seen promised.
    pub fn phase1(&mut self) -> Ballot {
        debug_assert_eq!(self.leader_phase, Phase::Phase1);
        let mut number = self.leader_ballot.number;
        for promise in &self.promises {
            number = number.max(promise.ballot.number);
        }
        if self.leader_ballot.leader != self.us {
            number += 1;
        }
        self.leader_ballot = Ballot::new(number, self.us);
        self.leader_ballot
    }

    /// Acceptor side of phase 1: follow `b` if it is the highest ballot seen,
    /// and report the current promise plus any previously accepted pvalue.
    pub fn phase1a(&mut self, b: Ballot) -> (Ballot, PValue) {
        if b > self.acceptor_ballot {
            self.acceptor_ballot = b;
        }
        let reply = (self.acceptor_ballot, self.acceptor_pvalue);
        self.set_phase();
        reply
    }

    /// Leader side of phase 1: record a follower's promise.
    pub fn phase1b(&mut self, from: CommId, ballot: Ballot, pvalue: PValue) {
        if let Some(idx) = self.group.index(from) {
            if self.leader_ballot == ballot {
                self.promises[idx].ballot = ballot;
                self.promises[idx].pvalue = pvalue;
            }
        }
        self.set_phase();
    }

    /// Once a quorum promised, pick the value: the highest previously accepted
    /// pvalue wins, otherwise the leader's preference.
    pub fn phase2(&mut self, preferred: u64) -> PValue {
        debug_assert_eq!(self.leader_phase, Phase::Phase2);
        let mut highest = PValue::default();
        for promise in &self.promises {
            highest = highest.max(promise.pvalue);
        }
        let value = if highest == PValue::default() {
            preferred
        } else {
            highest.value
        };
        self.leader_pvalue = PValue::new(self.leader_ballot, value);
        let p = self.leader_pvalue;
        self.set_phase();
        p
    }

    /// Acceptor side of phase 2: accept iff the pvalue rides the promised
    /// ballot. Returns whether the acceptance should be sent.
    pub fn phase2a(&mut self, p: PValue) -> bool {
        let accept = p.ballot == self.acceptor_ballot;
        if accept {
            self.acceptor_pvalue = p;
        }
        self.set_phase();
        accept
    }

    /// Leader side of phase 2: record a follower's acceptance.
    pub fn phase2b(&mut self, from: CommId, p: PValue) {
        if let Some(idx) = self.group.index(from) {
            if self.leader_phase == Phase::Phase2 && self.leader_ballot == p.ballot {
                self.promises[idx].pvalue = p;
            }
        }
        self.set_phase();
    }

    /// Adopt a value learned elsewhere, bypassing the protocol.
    pub fn force_learn(&mut self, value: u64) {
        self.leader_phase = Phase::Learned;
        self.value = value;
    }

    pub fn learned(&self) -> u64 {
        debug_assert_eq!(self.leader_phase, Phase::Learned);
        self.value
    }

    fn set_phase(&mut self) {
        for promise in &self.promises {
            if promise.ballot > self.leader_ballot {
                self.leader_phase = Phase::Phase1;
                return;
            }
        }

        if self.leader_phase == Phase::Phase1 {
            let promised = self
                .promises
                .iter()
                .filter(|p| self.leader_ballot != Ballot::default() && p.ballot == self.leader_ballot)
                .count();
            if promised >= self.group.quorum() {
                self.leader_phase = Phase::Phase2;
            }
        }

        if self.leader_phase == Phase::Phase2 {
            let accepted = self
                .promises
                .iter()
                .filter(|p| {
                    p.ballot == self.leader_ballot
                        && p.pvalue == self.leader_pvalue
                        && self.leader_pvalue.ballot == self.leader_ballot
                })
                .count();
            if accepted >= self.group.quorum() {
                self.leader_phase = Phase::Learned;
                self.value = self.leader_pvalue.value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consus_config::{DataCenterId, PaxosGroupId};
    use rstest::rstest;

    fn group_of(n: u64) -> PaxosGroup {
        PaxosGroup::new(
            PaxosGroupId::new(1),
            DataCenterId::new(1),
            (1..=n).map(CommId::new).collect(),
        )
    }

    fn members(group: &PaxosGroup) -> Vec<CommId> {
        group.members.clone()
    }

    /// Drives a full synod among `n` members led by member 1 and returns what
    /// each instance learned.
    fn run_synod(n: u64, preferred: u64) -> Vec<u64> {
        let group = group_of(n);
        let ids = members(&group);
        let mut synods: Vec<PaxosSynod> = ids
            .iter()
            .map(|id| PaxosSynod::new(*id, group.clone()))
            .collect();

        let ballot = synods[0].phase1();
        for i in 0..ids.len() {
            let (a, p) = synods[i].phase1a(ballot);
            let from = ids[i];
            synods[0].phase1b(from, a, p);
        }
        assert_eq!(synods[0].phase(), Phase::Phase2);

        let pvalue = synods[0].phase2(preferred);
        for i in 0..ids.len() {
            if synods[i].phase2a(pvalue) {
                let from = ids[i];
                synods[0].phase2b(from, pvalue);
            }
        }
        assert_eq!(synods[0].phase(), Phase::Learned);
        let learned = synods[0].learned();
        for synod in synods.iter_mut() {
            synod.force_learn(learned);
        }
        synods.iter().map(|s| s.learned()).collect()
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(5)]
    #[case(9)]
    fn synod_learns_preferred_value_without_competition(#[case] members: u64) {
        let learned = run_synod(members, 42);
        assert!(learned.iter().all(|v| *v == 42));
    }

    #[test]
    fn quorum_boundary_is_majority() {
        let group = group_of(5);
        let ids = members(&group);
        let mut leader = PaxosSynod::new(ids[0], group.clone());
        let ballot = leader.phase1();

        // Two promises (including the leader's own) are one short of quorum.
        for id in &ids[..2] {
            let mut follower = PaxosSynod::new(*id, group.clone());
            let (a, p) = follower.phase1a(ballot);
            leader.phase1b(*id, a, p);
        }
        assert_eq!(leader.phase(), Phase::Phase1);

        // The third promise crosses the majority threshold.
        let mut follower = PaxosSynod::new(ids[2], group.clone());
        let (a, p) = follower.phase1a(ballot);
        leader.phase1b(ids[2], a, p);
        assert_eq!(leader.phase(), Phase::Phase2);
    }

    #[test]
    fn stale_ballot_is_not_accepted() {
        let group = group_of(3);
        let ids = members(&group);
        let mut follower = PaxosSynod::new(ids[1], group.clone());

        let low = Ballot::new(1, ids[0]);
        let high = Ballot::new(2, ids[2]);
        let (a, _) = follower.phase1a(low);
        assert_eq!(a, low);
        let (a, _) = follower.phase1a(high);
        assert_eq!(a, high);

        // The acceptor now follows the higher ballot; a 2a riding the lower
        // one must be refused, while the higher one is accepted.
        assert!(!follower.phase2a(PValue::new(low, 7)));
        assert!(follower.phase2a(PValue::new(high, 8)));
    }

    #[test]
    fn previously_accepted_value_wins_over_preference() {
        let group = group_of(3);
        let ids = members(&group);
        let mut leader = PaxosSynod::new(ids[0], group.clone());

        // One follower already accepted value 7 under an older ballot.
        let old = Ballot::new(1, ids[2]);
        let mut follower = PaxosSynod::new(ids[1], group.clone());
        follower.phase1a(old);
        assert!(follower.phase2a(PValue::new(old, 7)));

        let ballot = leader.phase1();
        assert!(ballot > old);
        for (i, id) in ids.iter().enumerate() {
            let (a, p) = if i == 1 {
                follower.phase1a(ballot)
            } else {
                let mut other = PaxosSynod::new(*id, group.clone());
                other.phase1a(ballot)
            };
            leader.phase1b(*id, a, p);
        }
        let chosen = leader.phase2(99);
        assert_eq!(chosen.value, 7);
    }
}
