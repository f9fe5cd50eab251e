// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! The cross-data-center voter: two nested Generalized Paxos instances.
//!
//! The outer instance runs among the members of this data center's group and
//! agrees on a sequence of opaque envelopes. Each envelope is either a
//! cast-vote command or a message of the inner instance, whose acceptors are
//! the participating data centers themselves. A data center "sends" an inner
//! message by proposing it as an outer command in its own group; once the
//! outer instance learns it, every member feeds it to its inner engine.
//!
//! Vote envelopes commute; message envelopes conflict with everything, which
//! serializes inner ballot progression. The outer conflict predicate is
//! pluggable; the installed one conflicts unconditionally, reducing the outer
//! instance to classical Paxos.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use consus_config::{AbstractId, CommId, PaxosGroupId, MAX_REPLICATION_FACTOR};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::generalized_paxos::{
    Command, CommandInterference, CStruct, GeneralizedPaxos, MessageP1a, MessageP1b, MessageP2a,
    MessageP2b,
};
use crate::message::{LogEntry, Message};
use crate::node::TransactionManager;
use crate::types::{TransactionGroup, Vote, VOTE_ABORT, VOTE_COMMIT};

const ENVELOPE_COMMAND: u16 = 1;
const ENVELOPE_MESSAGE_1A: u16 = 2;
const ENVELOPE_MESSAGE_1B: u16 = 3;
const ENVELOPE_MESSAGE_2A: u16 = 4;
const ENVELOPE_MESSAGE_2B: u16 = 5;

/// Conflict predicate of the outer instance. Data-center-level conflict
/// detection conflicts unconditionally for now; the seam stays pluggable.
pub(crate) struct DataCenterInterference;

impl CommandInterference for DataCenterInterference {
    fn conflict(&self, _a: &Command, _b: &Command) -> bool {
        true
    }
}

/// Conflict predicate of the inner instance: cast votes commute, inner
/// protocol messages conflict with everything.
struct GlobalInterference;

impl CommandInterference for GlobalInterference {
    fn conflict(&self, a: &Command, b: &Command) -> bool {
        a.kind >= MAX_REPLICATION_FACTOR as u16 || b.kind >= MAX_REPLICATION_FACTOR as u16
    }
}

struct RateLimited<T: PartialEq + Clone> {
    last: Option<T>,
    stamp: Option<Instant>,
}

impl<T: PartialEq + Clone> Default for RateLimited<T> {
    fn default() -> Self {
        Self {
            last: None,
            stamp: None,
        }
    }
}

impl<T: PartialEq + Clone> RateLimited<T> {
    /// True when `message` differs from the last sent one or the resend
    /// interval elapsed; records the send.
    fn should_send(&mut self, message: &T, interval: std::time::Duration) -> bool {
        let now = Instant::now();
        let changed = self.last.as_ref() != Some(message);
        let elapsed = self
            .stamp
            .map_or(true, |at| now.duration_since(at) >= interval);
        if changed || elapsed {
            self.last = Some(message.clone());
            self.stamp = Some(now);
            true
        } else {
            false
        }
    }

    fn changed(&self, message: &T) -> bool {
        self.last.as_ref() != Some(message)
    }
}

struct GlobalVoterInner {
    dc_init: bool,
    global_init: bool,
    outcome_in_dispositions: bool,

    outer: Option<GeneralizedPaxos>,
    inner_gp: Option<GeneralizedPaxos>,

    highest_log_seqno: u64,
    dc_prev_learned: CStruct,
    executed: BTreeSet<Command>,

    local_vote: u64,
    dcs: Vec<PaxosGroupId>,
    outcome: Option<u64>,

    vote_stamp: Option<Instant>,
    outer_m1a: RateLimited<MessageP1a>,
    outer_m2a: RateLimited<MessageP2a>,
    outer_m2b: RateLimited<MessageP2b>,
    inner_m1a: RateLimited<MessageP1a>,
    inner_m1b: RateLimited<MessageP1b>,
    inner_m2a: RateLimited<MessageP2a>,
    inner_m2b: RateLimited<MessageP2b>,
}

pub(crate) struct GlobalVoter {
    tg: TransactionGroup,
    outer_interference: Arc<dyn CommandInterference>,
    inner: Mutex<GlobalVoterInner>,
}

impl GlobalVoter {
    pub fn new(tg: TransactionGroup) -> Self {
        Self::with_interference(tg, Arc::new(DataCenterInterference))
    }

    pub fn with_interference(
        tg: TransactionGroup,
        outer_interference: Arc<dyn CommandInterference>,
    ) -> Self {
        Self {
            tg,
            outer_interference,
            inner: Mutex::new(GlobalVoterInner {
                dc_init: false,
                global_init: false,
                outcome_in_dispositions: false,
                outer: None,
                inner_gp: None,
                highest_log_seqno: 0,
                dc_prev_learned: CStruct::default(),
                executed: BTreeSet::new(),
                local_vote: 0,
                dcs: Vec::new(),
                outcome: None,
                vote_stamp: None,
                outer_m1a: RateLimited::default(),
                outer_m2a: RateLimited::default(),
                outer_m2b: RateLimited::default(),
                inner_m1a: RateLimited::default(),
                inner_m1b: RateLimited::default(),
                inner_m2a: RateLimited::default(),
                inner_m2b: RateLimited::default(),
            }),
        }
    }

    pub fn finished(&self) -> bool {
        let inner = self.inner.lock();
        (!inner.dc_init && !inner.global_init) || inner.outcome_in_dispositions
    }

    pub fn initialized(&self) -> bool {
        self.inner.lock().global_init
    }

    pub fn outcome(&self) -> Option<u64> {
        self.inner.lock().outcome
    }

    /// Brings up the inner instance once this data center's local vote is
    /// known.
    pub fn init(&self, vote: u64, dcs: &[PaxosGroupId], tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if inner.global_init {
            return;
        }
        debug_assert!(dcs.contains(&self.tg.group));
        if !self.preconditions_for_data_center_paxos(&mut inner, tm) {
            return;
        }
        inner.local_vote = vote;
        inner.dcs = dcs.to_vec();
        let acceptors: Vec<AbstractId> = dcs.iter().map(|dc| AbstractId::from(*dc)).collect();
        // Votes commute and each data center casts exactly one, so the
        // cross-data-center instance runs on majority quorums and survives
        // the loss of any minority of data centers.
        inner.inner_gp = Some(GeneralizedPaxos::with_quorum_rule(
            Arc::new(GlobalInterference),
            AbstractId::from(self.tg.group),
            &acceptors,
            crate::generalized_paxos::QuorumRule::Majority,
        ));
        inner.global_init = true;
        debug!("{} voting {} across {:?}", self.tg, vote_name(vote), dcs);
        self.work(&mut inner, tm);
    }

    /// An envelope proposed into this data center's outer instance.
    pub fn process_propose(&self, command: Command, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if !self.preconditions_for_data_center_paxos(&mut inner, tm) {
            return;
        }
        let proposed = inner.outer.as_mut().unwrap().propose(command.clone());
        if proposed {
            let entry = LogEntry::GlobalPropose {
                tg: self.tg,
                command,
            };
            if let Some(seqno) = tm.append_log(&entry) {
                inner.highest_log_seqno = inner.highest_log_seqno.max(seqno);
            }
            self.work(&mut inner, tm);
        }
    }

    pub fn process_p1a(&self, from: CommId, m: &MessageP1a, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if !self.preconditions_for_data_center_paxos(&mut inner, tm) {
            return;
        }
        if from != CommId::new(m.ballot.leader.value()) {
            error!(
                "{} dropping outer 1a led by {} received from {from}",
                self.tg,
                m.ballot.leader.value()
            );
            return;
        }
        if m.ballot > inner.outer.as_ref().unwrap().acceptor_ballot() {
            // Logged once per new ballot rather than per retransmission.
            let entry = LogEntry::GlobalVote1a {
                tg: self.tg,
                message: m.clone(),
            };
            if let Some(seqno) = tm.append_log(&entry) {
                inner.highest_log_seqno = inner.highest_log_seqno.max(seqno);
            }
        }
        if let Some(reply) = inner.outer.as_mut().unwrap().process_p1a(m) {
            let seqno = inner.highest_log_seqno;
            tm.send_when_durable(
                seqno,
                from,
                Message::GvVote1b {
                    tg: self.tg,
                    message: reply,
                },
            );
        }
        self.work(&mut inner, tm);
    }

    pub fn process_p1b(&self, m: &MessageP1b, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if !self.preconditions_for_data_center_paxos(&mut inner, tm) {
            return;
        }
        if inner.outer.as_mut().unwrap().process_p1b(m) {
            self.work(&mut inner, tm);
        }
    }

    pub fn process_p2a(&self, from: CommId, m: &MessageP2a, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if !self.preconditions_for_data_center_paxos(&mut inner, tm) {
            return;
        }
        if from != CommId::new(m.ballot.leader.value()) {
            error!(
                "{} dropping outer 2a led by {} received from {from}",
                self.tg,
                m.ballot.leader.value()
            );
            return;
        }
        let reply = inner.outer.as_mut().unwrap().process_p2a(m);
        if inner.outer_m2b.changed(&reply) {
            let entry = LogEntry::GlobalVote2a {
                tg: self.tg,
                message: m.clone(),
            };
            if let Some(seqno) = tm.append_log(&entry) {
                inner.highest_log_seqno = inner.highest_log_seqno.max(seqno);
            }
        }
        let interval = tm.resend_interval();
        if inner.outer_m2b.should_send(&reply, interval) {
            self.send_to_group_when_durable(
                &inner,
                Message::GvVote2b {
                    tg: self.tg,
                    message: reply,
                },
                tm,
            );
        }
        self.work(&mut inner, tm);
    }

    pub fn process_p2b(&self, m: &MessageP2b, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if !self.preconditions_for_data_center_paxos(&mut inner, tm) {
            return;
        }
        if inner.outer.as_mut().unwrap().process_p2b(m) {
            let entry = LogEntry::GlobalVote2b {
                tg: self.tg,
                message: m.clone(),
            };
            if let Some(seqno) = tm.append_log(&entry) {
                inner.highest_log_seqno = inner.highest_log_seqno.max(seqno);
            }
            self.work(&mut inner, tm);
        }
    }

    pub fn externally_work_state_machine(&self, tm: &TransactionManager) {
        let mut inner = self.inner.lock();
        if !self.preconditions_for_data_center_paxos(&mut inner, tm) {
            return;
        }
        self.work(&mut inner, tm);
    }

    /// The participating data centers whose cast vote has not yet been
    /// accepted here, used to focus commit-record gossip.
    pub fn unvoted_data_centers(&self) -> Vec<PaxosGroupId> {
        let inner = self.inner.lock();
        let mut unvoted = inner.dcs.clone();
        let Some(outer) = inner.outer.as_ref() else {
            return unvoted;
        };
        for command in outer.accepted_value().commands {
            if command.kind != ENVELOPE_COMMAND {
                continue;
            }
            let Ok(vote_command) = bcs::from_bytes::<Command>(&command.value) else {
                continue;
            };
            let idx = vote_command.kind as usize % MAX_REPLICATION_FACTOR;
            if let Some(dc) = inner.dcs.get(idx) {
                unvoted.retain(|g| g != dc);
            }
        }
        unvoted
    }

    fn preconditions_for_data_center_paxos(
        &self,
        inner: &mut GlobalVoterInner,
        tm: &TransactionManager,
    ) -> bool {
        if let Some(vote) = tm.dispositions().get(&self.tg) {
            inner.outcome_in_dispositions = true;
            inner.outcome = Some(vote.as_u64());
            return false;
        }
        if !inner.dc_init {
            let config = tm.config();
            let Some(group) = config.get_group(self.tg.group) else {
                return false;
            };
            let acceptors: Vec<AbstractId> = group
                .members
                .iter()
                .map(|m| AbstractId::from(*m))
                .collect();
            inner.outer = Some(GeneralizedPaxos::new(
                self.outer_interference.clone(),
                AbstractId::from(tm.own_id()),
                &acceptors,
            ));
            inner.dc_init = true;
        }
        true
    }

    fn work(&self, inner: &mut GlobalVoterInner, tm: &TransactionManager) {
        let config = tm.config();
        let Some(group) = config.get_group(self.tg.group) else {
            return;
        };
        let lead_outer = group.members.first() == Some(&tm.own_id());
        let interval = tm.resend_interval();

        let advance = inner.outer.as_mut().unwrap().advance(lead_outer);
        if let Some(m1) = advance.p1a {
            if inner.outer_m1a.should_send(&m1, interval) {
                debug!("{} leading outer {:?}", self.tg, m1.ballot);
                self.send_to_group_when_durable(
                    inner,
                    Message::GvVote1a {
                        tg: self.tg,
                        message: m1,
                    },
                    tm,
                );
            }
        }
        if let Some(m2) = advance.p2a {
            if inner.outer_m2a.should_send(&m2, interval) {
                self.send_to_group_when_durable(
                    inner,
                    Message::GvVote2a {
                        tg: self.tg,
                        message: m2,
                    },
                    tm,
                );
            }
        }
        if let Some(m3) = advance.p2b {
            if inner.outer_m2b.should_send(&m3, interval) {
                self.send_to_group_when_durable(
                    inner,
                    Message::GvVote2b {
                        tg: self.tg,
                        message: m3,
                    },
                    tm,
                );
            }
        }

        if !inner.global_init {
            return;
        }

        // Cast (and periodically re-cast) this data center's vote.
        let vote_command = Command::new(
            self.member_index(inner),
            bcs::to_bytes(&inner.local_vote).expect("u64 serialization cannot fail"),
        );
        let envelope = Command::new(
            ENVELOPE_COMMAND,
            bcs::to_bytes(&vote_command).expect("command serialization cannot fail"),
        );
        let now = Instant::now();
        let vote_due = inner
            .vote_stamp
            .map_or(true, |at| now.duration_since(at) >= interval);
        if vote_due && self.propose_global(inner, &envelope, tm) {
            inner.vote_stamp = Some(now);
        }

        // Execute newly learned envelopes against the inner instance.
        let dc_learned = inner.outer.as_ref().unwrap().learned();
        if dc_learned != inner.dc_prev_learned {
            debug!(
                "{} learned {} outer envelopes",
                self.tg,
                dc_learned.commands.len()
            );
            inner.dc_prev_learned = dc_learned.clone();
        }

        let mut executed = 0;
        for command in dc_learned.commands {
            if !inner.executed.insert(command.clone()) {
                continue;
            }
            executed += 1;
            match command.kind {
                ENVELOPE_COMMAND => match bcs::from_bytes::<Command>(&command.value) {
                    Ok(inner_command) => {
                        inner.inner_gp.as_mut().unwrap().propose(inner_command);
                    }
                    Err(_) => error!("{} invalid vote envelope", self.tg),
                },
                ENVELOPE_MESSAGE_1A => match bcs::from_bytes::<MessageP1a>(&command.value) {
                    Ok(m) => {
                        if let Some(reply) = inner.inner_gp.as_mut().unwrap().process_p1a(&m) {
                            self.send_global_m1b(inner, reply, tm);
                        }
                    }
                    Err(_) => error!("{} invalid inner 1a envelope", self.tg),
                },
                ENVELOPE_MESSAGE_1B => match bcs::from_bytes::<MessageP1b>(&command.value) {
                    Ok(m) => {
                        inner.inner_gp.as_mut().unwrap().process_p1b(&m);
                    }
                    Err(_) => error!("{} invalid inner 1b envelope", self.tg),
                },
                ENVELOPE_MESSAGE_2A => match bcs::from_bytes::<MessageP2a>(&command.value) {
                    Ok(m) => {
                        let reply = inner.inner_gp.as_mut().unwrap().process_p2a(&m);
                        self.send_global_m2b(inner, reply, tm);
                    }
                    Err(_) => error!("{} invalid inner 2a envelope", self.tg),
                },
                ENVELOPE_MESSAGE_2B => match bcs::from_bytes::<MessageP2b>(&command.value) {
                    Ok(m) => {
                        inner.inner_gp.as_mut().unwrap().process_p2b(&m);
                    }
                    Err(_) => error!("{} invalid inner 2b envelope", self.tg),
                },
                other => error!("{} unknown envelope kind {other}", self.tg),
            }
        }

        let lead_inner = self.tg.is_home();
        if executed == 0 && !lead_inner {
            return;
        }

        let advance = inner.inner_gp.as_mut().unwrap().advance(lead_inner);
        if let Some(m1) = advance.p1a {
            self.send_global_m1a(inner, m1, tm);
        }
        if let Some(m2) = advance.p2a {
            self.send_global_m2a(inner, m2, tm);
        }
        if let Some(m3) = advance.p2b {
            if self.tally_votes("acceptor", &m3.value, inner).is_some() {
                self.send_global_m2b(inner, m3, tm);
            }
        }

        if inner.outcome.is_none() {
            let votes = inner.inner_gp.as_ref().unwrap().learned();
            if let Some(outcome) = self.tally_votes("learned", &votes, inner) {
                inner.outcome = Some(outcome);
            }
        }
    }

    fn member_index(&self, inner: &GlobalVoterInner) -> u16 {
        inner
            .dcs
            .iter()
            .position(|dc| *dc == self.tg.group)
            .unwrap_or(0) as u16
    }

    fn send_global_m1a(&self, inner: &mut GlobalVoterInner, m: MessageP1a, tm: &TransactionManager) {
        if inner.inner_m1a.should_send(&m, tm.resend_interval()) {
            let envelope = Command::new(
                ENVELOPE_MESSAGE_1A,
                bcs::to_bytes(&m).expect("message serialization cannot fail"),
            );
            self.propose_global(inner, &envelope, tm);
        }
    }

    fn send_global_m1b(&self, inner: &mut GlobalVoterInner, m: MessageP1b, tm: &TransactionManager) {
        if inner.inner_m1b.should_send(&m, tm.resend_interval()) {
            let envelope = Command::new(
                ENVELOPE_MESSAGE_1B,
                bcs::to_bytes(&m).expect("message serialization cannot fail"),
            );
            self.propose_global(inner, &envelope, tm);
        }
    }

    fn send_global_m2a(&self, inner: &mut GlobalVoterInner, m: MessageP2a, tm: &TransactionManager) {
        if inner.inner_m2a.should_send(&m, tm.resend_interval()) {
            let envelope = Command::new(
                ENVELOPE_MESSAGE_2A,
                bcs::to_bytes(&m).expect("message serialization cannot fail"),
            );
            self.propose_global(inner, &envelope, tm);
        }
    }

    fn send_global_m2b(&self, inner: &mut GlobalVoterInner, m: MessageP2b, tm: &TransactionManager) {
        if inner.inner_m2b.should_send(&m, tm.resend_interval()) {
            let envelope = Command::new(
                ENVELOPE_MESSAGE_2B,
                bcs::to_bytes(&m).expect("message serialization cannot fail"),
            );
            self.propose_global(inner, &envelope, tm);
        }
    }

    /// Proposes an envelope into every participating data center's outer
    /// instance. Only the outer leader of this group transmits.
    fn propose_global(
        &self,
        inner: &GlobalVoterInner,
        command: &Command,
        tm: &TransactionManager,
    ) -> bool {
        let config = tm.config();
        let Some(group) = config.get_group(self.tg.group) else {
            return false;
        };
        if group.members.first() != Some(&tm.own_id()) {
            return false;
        }
        for dc in &inner.dcs {
            let Some(target_group) = config.get_group(*dc) else {
                continue;
            };
            let message = Message::GvPropose {
                tg: self.tg.with_group(*dc),
                command: command.clone(),
            };
            for member in &target_group.members {
                tm.send_when_durable(inner.highest_log_seqno, *member, message.clone());
            }
        }
        true
    }

    fn send_to_group_when_durable(
        &self,
        inner: &GlobalVoterInner,
        message: Message,
        tm: &TransactionManager,
    ) {
        let config = tm.config();
        let Some(group) = config.get_group(self.tg.group) else {
            return;
        };
        for member in &group.members {
            tm.send_when_durable(inner.highest_log_seqno, *member, message.clone());
        }
    }

    fn tally_votes(
        &self,
        context: &str,
        votes: &CStruct,
        inner: &GlobalVoterInner,
    ) -> Option<u64> {
        let mut seen = [false; MAX_REPLICATION_FACTOR];
        let mut committed = 0;
        let mut aborted = 0;
        for command in &votes.commands {
            let idx = command.kind as usize;
            if idx >= 2 * MAX_REPLICATION_FACTOR {
                error!("{} {context} tally saw invalid vote kind {idx}", self.tg);
                continue;
            }
            if idx >= MAX_REPLICATION_FACTOR {
                // Reserved for re-cast votes after membership changes.
                continue;
            }
            if seen[idx] {
                continue;
            }
            match bcs::from_bytes::<u64>(&command.value) {
                Ok(VOTE_COMMIT) => {
                    committed += 1;
                    seen[idx] = true;
                }
                Ok(VOTE_ABORT) => {
                    aborted += 1;
                    seen[idx] = true;
                }
                Ok(other) => error!("{} {context} tally saw invalid vote {other}", self.tg),
                Err(_) => error!("{} {context} tally saw corrupt vote", self.tg),
            }
        }
        let quorum = inner.dcs.len() / 2 + 1;
        if committed >= quorum {
            Some(VOTE_COMMIT)
        } else if aborted >= quorum {
            Some(VOTE_ABORT)
        } else {
            None
        }
    }
}

fn vote_name(value: u64) -> &'static str {
    match Vote::from_u64(value) {
        Some(Vote::Commit) => "COMMIT",
        Some(Vote::Abort) => "ABORT",
        None => "???",
    }
}
