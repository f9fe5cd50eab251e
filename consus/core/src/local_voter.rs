// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-data-center voter: one Paxos synod per member of the home group,
//! each deciding that member's commit-or-abort vote. A majority of member
//! votes determines the data center's outcome.
//!
//! Every phase transition that binds the acceptor (1a, 2a) is logged before
//! the acknowledgement is sent, so the voter's effective input replays after
//! a crash.

use std::time::Instant;

use consus_config::{CommId, MemberState, PaxosGroup};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::message::{LogEntry, Message};
use crate::node::TransactionManager;
use crate::paxos_synod::{Ballot, PValue, PaxosSynod, Phase};
use crate::types::{TransactionGroup, Vote, VOTE_ABORT, VOTE_COMMIT};

struct LocalVoterInner {
    initialized: bool,
    group: PaxosGroup,
    synods: Vec<PaxosSynod>,
    // Last phase broadcast per slot, for retransmit suppression.
    sent: Vec<Option<(Phase, Instant)>>,
    preferred: Option<u64>,
    outcome: Option<u64>,
    outcome_in_dispositions: bool,
}

pub(crate) struct LocalVoter {
    tg: TransactionGroup,
    inner: Mutex<LocalVoterInner>,
}

impl LocalVoter {
    pub fn new(tg: TransactionGroup) -> Self {
        Self {
            tg,
            inner: Mutex::new(LocalVoterInner {
                initialized: false,
                group: PaxosGroup::default(),
                synods: Vec::new(),
                sent: Vec::new(),
                preferred: None,
                outcome: None,
                outcome_in_dispositions: false,
            }),
        }
    }

    pub fn finished(&self) -> bool {
        let inner = self.inner.lock();
        !inner.initialized || inner.outcome_in_dispositions
    }

    /// First preference wins; later calls are no-ops.
    pub fn set_preferred_vote(&self, vote: u64) {
        let mut inner = self.inner.lock();
        if inner.preferred.is_none() {
            inner.preferred = Some(vote);
        }
    }

    /// A wound flips the preference to abort outright.
    pub fn preempt(&self) {
        self.inner.lock().preferred = Some(VOTE_ABORT);
    }

    pub fn outcome(&self) -> Option<u64> {
        self.inner.lock().outcome
    }

    pub fn vote_1a(&self, from: CommId, idx: usize, ballot: Ballot, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if !self.preconditions(&mut inner, tm) {
            return;
        }
        if idx >= inner.group.size() {
            error!("{} instance[{idx}] dropping 1a with invalid index", self.tg);
            return;
        }
        if from != ballot.leader {
            error!(
                "{} instance[{idx}] dropping 1a led by {} received from {from}",
                self.tg, ballot.leader
            );
            return;
        }
        debug!("{} instance[{idx}] asked to follow {ballot:?}", self.tg);
        let (promised, accepted) = inner.synods[idx].phase1a(ballot);
        let entry = LogEntry::LocalVote1a {
            tg: self.tg,
            idx: idx as u8,
            ballot,
        };
        if let Some(seqno) = tm.append_log(&entry) {
            tm.send_when_durable(
                seqno,
                ballot.leader,
                Message::LvVote1b {
                    tg: self.tg,
                    idx: idx as u8,
                    ballot: promised,
                    pvalue: accepted,
                },
            );
        }
    }

    pub fn vote_1b(
        &self,
        from: CommId,
        idx: usize,
        ballot: Ballot,
        pvalue: PValue,
        tm: &TransactionManager,
    ) {
        let mut inner = self.inner.lock();
        if !self.preconditions(&mut inner, tm) {
            return;
        }
        if idx >= inner.group.size() {
            error!("{} dropping 1b with invalid index", self.tg);
            return;
        }
        inner.synods[idx].phase1b(from, ballot, pvalue);
        self.work(&mut inner, tm);
    }

    pub fn vote_2a(&self, from: CommId, idx: usize, pvalue: PValue, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if !self.preconditions(&mut inner, tm) {
            return;
        }
        if idx >= inner.group.size() {
            error!("{} instance[{idx}] dropping 2a with invalid index", self.tg);
            return;
        }
        if from != pvalue.ballot.leader {
            error!(
                "{} instance[{idx}] dropping 2a led by {} received from {from}",
                self.tg, pvalue.ballot.leader
            );
            return;
        }
        if inner.synods[idx].phase2a(pvalue) {
            debug!(
                "{} instance[{idx}] accepted decision {}",
                self.tg,
                vote_name(pvalue.value)
            );
            let entry = LogEntry::LocalVote2a {
                tg: self.tg,
                idx: idx as u8,
                pvalue,
            };
            if let Some(seqno) = tm.append_log(&entry) {
                tm.send_when_durable(
                    seqno,
                    pvalue.ballot.leader,
                    Message::LvVote2b {
                        tg: self.tg,
                        idx: idx as u8,
                        pvalue,
                    },
                );
            }
        } else {
            debug!(
                "{} instance[{idx}] ignoring 2a; following a higher ballot",
                self.tg
            );
        }
    }

    pub fn vote_2b(&self, from: CommId, idx: usize, pvalue: PValue, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if !self.preconditions(&mut inner, tm) {
            return;
        }
        if idx >= inner.group.size() {
            error!("{} instance[{idx}] dropping 2b with invalid index", self.tg);
            return;
        }
        let before = inner.synods[idx].phase();
        inner.synods[idx].phase2b(from, pvalue);
        if before != Phase::Learned && inner.synods[idx].phase() == Phase::Learned {
            let entry = LogEntry::LocalLearn {
                tg: self.tg,
                idx: idx as u8,
                value: inner.synods[idx].learned(),
            };
            tm.append_log(&entry);
            debug!(
                "{} instance[{idx}] decided {}; votes now {}",
                self.tg,
                vote_name(inner.synods[idx].learned()),
                self.votes(&inner)
            );
        }
        self.work(&mut inner, tm);
    }

    pub fn vote_learn(&self, idx: usize, value: u64, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if !self.preconditions(&mut inner, tm) {
            return;
        }
        if idx >= inner.group.size() {
            error!(
                "{} instance[{idx}] dropping learn with invalid index",
                self.tg
            );
            return;
        }
        if inner.synods[idx].phase() == Phase::Learned && inner.synods[idx].learned() != value {
            // Quorums never learn two values; if this fires the disk or the
            // peer is lying to us.
            error!(
                "{} instance[{idx}] learned inconsistent values: {} vs {}",
                self.tg,
                vote_name(inner.synods[idx].learned()),
                vote_name(value)
            );
        } else if inner.synods[idx].phase() != Phase::Learned {
            let entry = LogEntry::LocalLearn {
                tg: self.tg,
                idx: idx as u8,
                value,
            };
            tm.append_log(&entry);
        }
        inner.synods[idx].force_learn(value);
        self.work(&mut inner, tm);
    }

    pub fn externally_work_state_machine(&self, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        self.work(&mut inner, tm);
    }

    fn preconditions(&self, inner: &mut LocalVoterInner, tm: &TransactionManager) -> bool {
        if let Some(vote) = tm.dispositions().get(&self.tg) {
            inner.outcome_in_dispositions = true;
            inner.outcome = Some(vote.as_u64());
            return false;
        }
        if !inner.initialized {
            let config = tm.config();
            let Some(group) = config.get_group(self.tg.group) else {
                return false;
            };
            inner.group = group.clone();
            inner.synods = group
                .members
                .iter()
                .map(|_| PaxosSynod::new(tm.own_id(), group.clone()))
                .collect();
            inner.sent = vec![None; group.size()];
            inner.initialized = true;
        }
        true
    }

    fn work(&self, inner: &mut LocalVoterInner, tm: &TransactionManager) {
        if !self.preconditions(inner, tm) {
            return;
        }
        let Some(our_idx) = inner.group.index(tm.own_id()) else {
            return;
        };

        if let Some(preferred) = inner.preferred {
            self.work_paxos_vote(inner, our_idx, preferred, tm);
        }

        // Step in for crashed members, in index order, voting abort on their
        // behalf to restore liveness.
        let config = tm.config();
        for i in 1..inner.group.size() {
            let idx = (our_idx + i) % inner.group.size();
            if config.txman_state(inner.group.members[idx]) == Some(MemberState::Online) {
                break;
            }
            self.work_paxos_vote(inner, idx, VOTE_ABORT, tm);
        }

        let mut voted = 0;
        let mut committed = 0;
        for synod in &inner.synods {
            if synod.phase() == Phase::Learned {
                voted += 1;
                match synod.learned() {
                    VOTE_COMMIT => committed += 1,
                    VOTE_ABORT => {}
                    other => {
                        error!("{} synod learned invalid value {other}", self.tg)
                    }
                }
            }
        }
        let aborted = voted - committed;
        if aborted >= inner.group.quorum() {
            inner.outcome = Some(VOTE_ABORT);
        }
        if committed >= inner.group.quorum() {
            inner.outcome = Some(VOTE_COMMIT);
        }

        if tm.dispositions().has(&self.tg) {
            inner.outcome_in_dispositions = true;
        }
    }

    fn work_paxos_vote(
        &self,
        inner: &mut LocalVoterInner,
        idx: usize,
        preferred: u64,
        tm: &TransactionManager,
    ) {
        let phase = inner.synods[idx].phase();
        let message = match phase {
            Phase::Phase1 => {
                let ballot = inner.synods[idx].phase1();
                Message::LvVote1a {
                    tg: self.tg,
                    idx: idx as u8,
                    ballot,
                }
            }
            Phase::Phase2 => {
                let pvalue = inner.synods[idx].phase2(preferred);
                Message::LvVote2a {
                    tg: self.tg,
                    idx: idx as u8,
                    pvalue,
                }
            }
            Phase::Learned => Message::LvVoteLearn {
                tg: self.tg,
                idx: idx as u8,
                value: inner.synods[idx].learned(),
            },
        };

        let now = Instant::now();
        let resend = tm.resend_interval();
        let stale = match inner.sent[idx] {
            Some((sent_phase, at)) => {
                sent_phase != phase || now.duration_since(at) >= resend
            }
            None => true,
        };
        if stale {
            tm.send_group(&inner.group, message);
            inner.sent[idx] = Some((phase, now));
        }
    }

    fn votes(&self, inner: &LocalVoterInner) -> String {
        inner
            .synods
            .iter()
            .map(|synod| {
                if synod.phase() == Phase::Learned {
                    match Vote::from_u64(synod.learned()) {
                        Some(Vote::Commit) => 'C',
                        Some(Vote::Abort) => 'A',
                        None => 'E',
                    }
                } else {
                    '?'
                }
            })
            .collect()
    }
}

fn vote_name(value: u64) -> &'static str {
    match Vote::from_u64(value) {
        Some(Vote::Commit) => "COMMIT",
        Some(Vote::Abort) => "ABORT",
        None => "???",
    }
}
