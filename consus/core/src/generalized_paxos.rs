// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! A Generalized Paxos engine, used twice by the global voter: once across the
//! members of the home paxos group and once across the participating data
//! centers.
//!
//! Values are cstructs: command histories whose partial order is induced by a
//! pluggable interference predicate. Acceptors may extend their value freely
//! under FAST ballots; CLASSIC ballots impose the leader's sequence. Learning
//! takes the greatest lower bound across every quorum that accepted the same
//! ballot.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use consus_config::AbstractId;
use serde::{Deserialize, Serialize};

/// An opaque command. `kind` scopes the payload; interference predicates
/// dispatch on it.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Command {
    pub kind: u16,
    pub value: Vec<u8>,
}

impl Command {
    pub fn new(kind: u16, value: Vec<u8>) -> Self {
        Self { kind, value }
    }
}

/// A command history. Equality here is structural; the engine's semantic
/// relations (`le`, `compatible`, ...) account for command reordering.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CStruct {
    pub commands: Vec<Command>,
}

impl CStruct {
    pub fn is_none(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum BallotKind {
    #[default]
    Classic,
    Fast,
}

/// A ballot. Ordering is by number first so that leadership changes are
/// totally ordered regardless of kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpBallot {
    pub kind: BallotKind,
    pub number: u64,
    pub leader: AbstractId,
}

impl GpBallot {
    pub fn new(kind: BallotKind, number: u64, leader: AbstractId) -> Self {
        Self {
            kind,
            number,
            leader,
        }
    }
}

impl Ord for GpBallot {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.number, self.kind, self.leader).cmp(&(other.number, other.kind, other.leader))
    }
}

impl PartialOrd for GpBallot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageP1a {
    pub ballot: GpBallot,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageP1b {
    pub ballot: GpBallot,
    pub acceptor: AbstractId,
    pub vballot: GpBallot,
    pub value: CStruct,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageP2a {
    pub ballot: GpBallot,
    pub value: CStruct,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageP2b {
    pub ballot: GpBallot,
    pub acceptor: AbstractId,
    pub value: CStruct,
}

/// Decides whether two commands must be ordered relative to each other.
pub trait CommandInterference: Send + Sync {
    fn conflict(&self, a: &Command, b: &Command) -> bool;
}

/// Messages the engine wants sent after [`GeneralizedPaxos::advance`].
#[derive(Debug, Default)]
pub struct AdvanceResult {
    pub p1a: Option<MessageP1a>,
    pub p2a: Option<MessageP2a>,
    pub p2b: Option<MessageP2b>,
}

/// Quorum size used for promises, acceptances, and learning.
///
/// Fast rounds classically need two-thirds quorums. When every command either
/// commutes or is idempotent per proposer, as with cast votes, a simple
/// majority suffices and tolerates the loss of half the acceptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumRule {
    FastTwoThirds,
    Majority,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum LeaderState {
    Participating,
    LeadingPhase1,
    LeadingPhase2,
}

type PartialOrderSet = BTreeSet<(Command, Command)>;

pub struct GeneralizedPaxos {
    interfere: Arc<dyn CommandInterference>,
    state: LeaderState,
    us: AbstractId,
    acceptors: Vec<AbstractId>,
    quorum_rule: QuorumRule,
    proposed: Vec<Command>,

    acceptor_ballot: GpBallot,
    acceptor_value: CStruct,
    acceptor_value_src: GpBallot,

    leader_ballot: GpBallot,
    leader_value: CStruct,
    promises: Vec<MessageP1b>,

    accepted: Vec<MessageP2b>,
}

impl GeneralizedPaxos {
    pub fn new(
        interfere: Arc<dyn CommandInterference>,
        us: AbstractId,
        acceptors: &[AbstractId],
    ) -> Self {
        Self::with_quorum_rule(interfere, us, acceptors, QuorumRule::FastTwoThirds)
    }

    pub fn with_quorum_rule(
        interfere: Arc<dyn CommandInterference>,
        us: AbstractId,
        acceptors: &[AbstractId],
        quorum_rule: QuorumRule,
    ) -> Self {
        assert!(acceptors.len() <= 63);
        Self {
            interfere,
            state: LeaderState::Participating,
            us,
            acceptors: acceptors.to_vec(),
            quorum_rule,
            proposed: Vec::new(),
            acceptor_ballot: GpBallot::default(),
            acceptor_value: CStruct::default(),
            acceptor_value_src: GpBallot::default(),
            leader_ballot: GpBallot::default(),
            leader_value: CStruct::default(),
            promises: vec![MessageP1b::default(); acceptors.len()],
            accepted: vec![MessageP2b::default(); acceptors.len()],
        }
    }

    pub fn propose(&mut self, c: Command) -> bool {
        if self.proposed.contains(&c) {
            return false;
        }
        self.proposed.push(c);
        true
    }

    /// Adopt every command carried by a peer's acceptance as our own proposal.
    pub fn propose_from_p2b(&mut self, m: &MessageP2b) -> bool {
        let mut proposed = false;
        for c in m.value.commands.clone() {
            proposed = self.propose(c) || proposed;
        }
        proposed
    }

    pub fn acceptor_ballot(&self) -> GpBallot {
        self.acceptor_ballot
    }

    pub fn accepted_value(&self) -> CStruct {
        self.acceptor_value.clone()
    }

    /// Drives leadership and the acceptor role forward, returning the messages
    /// to send. Safe to call repeatedly; the caller rate-limits resends.
    pub fn advance(&mut self, mut may_attempt_leadership: bool) -> AdvanceResult {
        let mut result = AdvanceResult::default();
        let (learn, conflict) = self.learned_with_conflict();

        // A classic round that fully propagated may hand leadership back.
        if self.state >= LeaderState::LeadingPhase2
            && self.leader_ballot.kind == BallotKind::Classic
            && self.cstruct_eq(&learn, &self.leader_value.clone())
        {
            may_attempt_leadership = true;
            self.state = LeaderState::Participating;
        }

        if may_attempt_leadership
            && (self.leader_ballot.leader != self.us
                || self.state == LeaderState::Participating
                || (self.leader_ballot.kind == BallotKind::Fast && conflict))
        {
            let kind = if conflict {
                BallotKind::Classic
            } else {
                BallotKind::Fast
            };
            let number = self.acceptor_ballot.max(self.leader_ballot).number + 1;
            self.leader_ballot = GpBallot::new(kind, number, self.us);
            self.state = LeaderState::LeadingPhase1;
        }

        if self.state >= LeaderState::LeadingPhase1 {
            let promised = self
                .promises
                .iter()
                .filter(|p| p.ballot == self.leader_ballot)
                .count();

            if promised < self.promises.len() {
                result.p1a = Some(MessageP1a {
                    ballot: self.leader_ballot,
                });
            }

            if promised >= self.quorum() && self.state < LeaderState::LeadingPhase2 {
                self.state = LeaderState::LeadingPhase2;
                let mut value = self.proven_safe();
                for i in 0..self.promises.len() {
                    if self.promises[i].ballot == self.leader_ballot {
                        let v = self.promises[i].value.clone();
                        if self.cstruct_compatible(&value, &v) {
                            value = self.cstruct_lub(&value, &v);
                        }
                    }
                }
                self.leader_value = value;
                let commands: Vec<Command> = self
                    .promises
                    .iter()
                    .flat_map(|p| p.value.commands.clone())
                    .collect();
                for c in commands {
                    self.propose(c);
                }
                self.proposed.sort();
            }
        }

        if self.state >= LeaderState::LeadingPhase2 && self.leader_ballot.kind == BallotKind::Classic
        {
            for i in 0..self.proposed.len() {
                let c = self.proposed[i].clone();
                if !self.leader_value.commands.contains(&c) {
                    self.leader_value.commands.push(c);
                }
            }
            result.p2a = Some(MessageP2a {
                ballot: self.leader_ballot,
                value: self.leader_value.clone(),
            });
        }

        // Under a fast ballot an acceptor may extend its own value with any
        // proposal it has seen.
        if self.acceptor_ballot.kind == BallotKind::Fast {
            for i in 0..self.proposed.len() {
                let c = self.proposed[i].clone();
                if !self.acceptor_value.commands.contains(&c) {
                    self.acceptor_value_src = self.acceptor_ballot;
                    self.acceptor_value.commands.push(c);
                }
            }
        }

        if self.acceptor_value_src > GpBallot::default() {
            result.p2b = Some(MessageP2b {
                ballot: self.acceptor_value_src,
                acceptor: self.us,
                value: self.acceptor_value.clone(),
            });
        }

        result
    }

    /// Phase 1b of the abstract algorithm.
    pub fn process_p1a(&mut self, m: &MessageP1a) -> Option<MessageP1b> {
        self.index_of(m.ballot.leader)?;

        if m.ballot > self.leader_ballot && self.state > LeaderState::Participating {
            if m.ballot.leader == self.us {
                self.leader_ballot = m.ballot;
                self.state = LeaderState::LeadingPhase1;
            } else {
                self.state = LeaderState::Participating;
            }
        }

        if m.ballot >= self.acceptor_ballot {
            self.acceptor_ballot = m.ballot;
            Some(MessageP1b {
                ballot: self.acceptor_ballot,
                acceptor: self.us,
                vballot: self.acceptor_value_src,
                value: self.acceptor_value.clone(),
            })
        } else {
            None
        }
    }

    pub fn process_p1b(&mut self, m: &MessageP1b) -> bool {
        let idx = match self.index_of(m.acceptor) {
            Some(idx) => idx,
            None => return false,
        };
        if m.ballot == self.leader_ballot
            && self.promises[idx].ballot <= self.leader_ballot
            && self.state >= LeaderState::LeadingPhase1
        {
            self.promises[idx] = m.clone();
            return true;
        }
        false
    }

    /// Phase 2b (classic) of the abstract algorithm. Always answers with the
    /// acceptor's current value so stragglers converge.
    pub fn process_p2a(&mut self, m: &MessageP2a) -> MessageP2b {
        if m.ballot.kind == BallotKind::Classic
            && m.ballot == self.acceptor_ballot
            && (self.acceptor_value_src != self.acceptor_ballot
                || self.cstruct_le(&self.acceptor_value.clone(), &m.value))
        {
            self.acceptor_value_src = self.acceptor_ballot;
            self.acceptor_value = m.value.clone();
        }
        MessageP2b {
            ballot: self.acceptor_value_src,
            acceptor: self.us,
            value: self.acceptor_value.clone(),
        }
    }

    pub fn process_p2b(&mut self, m: &MessageP2b) -> bool {
        let idx = match self.index_of(m.acceptor) {
            Some(idx) => idx,
            None => return false,
        };
        let mut changed = false;
        if self.accepted[idx].ballot < m.ballot {
            self.accepted[idx] = m.clone();
            changed = true;
        }
        if self.accepted[idx].ballot == m.ballot
            && self.cstruct_lt(&self.accepted[idx].value.clone(), &m.value)
        {
            self.accepted[idx] = m.clone();
            changed = true;
        }
        changed
    }

    /// What has been cumulatively learned, from the limited amount this
    /// instance can observe.
    pub fn learned(&self) -> CStruct {
        self.learned_with_conflict().0
    }

    pub fn learned_with_conflict(&self) -> (CStruct, bool) {
        let mut conflict = false;
        let mut ballots: Vec<(GpBallot, usize)> = Vec::new();
        for a in &self.accepted {
            match ballots.iter_mut().find(|(b, _)| *b == a.ballot) {
                Some((_, count)) => *count += 1,
                None => ballots.push((a.ballot, 1)),
            }
        }

        let mut learned_values = Vec::new();
        for (ballot, count) in ballots {
            if count >= self.quorum() {
                self.learned_for_ballot(ballot, &mut learned_values, &mut conflict);
            }
        }

        let mut ret = CStruct::default();
        for v in &learned_values {
            ret = self.cstruct_lub(&ret, v);
        }
        (ret, conflict)
    }

    /// Every command accepted anywhere, used to decide retransmits.
    pub fn all_accepted_commands(&self) -> Vec<Command> {
        let mut commands: Vec<Command> = self.acceptor_value.commands.clone();
        for a in &self.accepted {
            commands.extend(a.value.commands.iter().cloned());
        }
        commands.sort();
        commands.dedup();
        commands
    }

    fn index_of(&self, id: AbstractId) -> Option<usize> {
        self.acceptors.iter().position(|a| *a == id)
    }

    fn quorum(&self) -> usize {
        match self.quorum_rule {
            QuorumRule::FastTwoThirds => 2 * self.acceptors.len() / 3 + 1,
            QuorumRule::Majority => self.acceptors.len() / 2 + 1,
        }
    }

    fn learned_for_ballot(&self, ballot: GpBallot, lv: &mut Vec<CStruct>, conflict: &mut bool) {
        let vs: Vec<&CStruct> = self
            .accepted
            .iter()
            .filter(|a| a.ballot == ballot)
            .map(|a| &a.value)
            .collect();
        debug_assert!(!vs.is_empty());
        self.learned_subsets(&vs, self.quorum(), lv, conflict);
    }

    fn learned_subsets(
        &self,
        vs: &[&CStruct],
        max_sz: usize,
        lv: &mut Vec<CStruct>,
        conflict: &mut bool,
    ) {
        if vs.len() == 1 {
            lv.push(vs[0].clone());
        } else if vs.len() <= max_sz {
            lv.push(self.learned_glb(vs, conflict));
        } else {
            // Enumerate every subset of vs of size max_sz.
            let limit = 1u64 << vs.len();
            let mut v = (1u64 << max_sz) - 1;
            while v < limit {
                let subset: Vec<&CStruct> = (0..vs.len())
                    .filter(|i| v & (1 << i) != 0)
                    .map(|i| vs[i])
                    .collect();
                debug_assert_eq!(subset.len(), max_sz);
                lv.push(self.learned_glb(&subset, conflict));
                // Lexicographically next bit permutation.
                let t = (v | (v - 1)) + 1;
                v = t | ((((t & t.wrapping_neg()) / (v & v.wrapping_neg())) >> 1) - 1);
            }
        }
    }

    fn learned_glb(&self, vs: &[&CStruct], conflict: &mut bool) -> CStruct {
        debug_assert!(!vs.is_empty());
        let mut v = vs[0].clone();
        for other in vs {
            v = self.cstruct_glb(&v, other, conflict);
        }
        v
    }

    /// The largest cstruct proven safe at the current ballot, per the
    /// Generalized Paxos technical report.
    fn proven_safe(&self) -> CStruct {
        let mut k = GpBallot::default();
        for p in &self.promises {
            if p.ballot == self.leader_ballot && !p.value.is_none() {
                k = k.max(p.vballot);
            }
        }

        // Enumerate every quorum R and take the glb of the values reported at
        // ballot k by its members.
        let limit = 1u64 << self.promises.len();
        let mut v = (1u64 << self.quorum()) - 1;
        let mut gamma_r: Vec<CStruct> = Vec::new();
        while v < limit {
            let vs: Vec<&CStruct> = (0..self.promises.len())
                .filter(|i| {
                    v & (1 << i) != 0
                        && self.promises[*i].ballot == self.leader_ballot
                        && self.promises[*i].vballot == k
                        && !self.promises[*i].value.is_none()
                })
                .map(|i| &self.promises[i].value)
                .collect();
            if !vs.is_empty() {
                let mut conflict = false;
                gamma_r.push(self.learned_glb(&vs, &mut conflict));
            }
            let t = (v | (v - 1)) + 1;
            v = t | ((((t & t.wrapping_neg()) / (v & v.wrapping_neg())) >> 1) - 1);
        }

        if gamma_r.is_empty() {
            for p in &self.promises {
                if p.ballot == self.leader_ballot && p.vballot == k {
                    return p.value.clone();
                }
            }
        }

        for i in 0..gamma_r.len() {
            for j in i + 1..gamma_r.len() {
                if !self.cstruct_compatible(&gamma_r[i], &gamma_r[j]) {
                    return CStruct::default();
                }
            }
        }

        let mut ret = CStruct::default();
        for g in &gamma_r {
            ret = self.cstruct_lub(&ret, g);
        }
        ret
    }

    fn cstruct_lt(&self, lhs: &CStruct, rhs: &CStruct) -> bool {
        if lhs.commands.len() >= rhs.commands.len() {
            return false;
        }
        self.cstruct_le(lhs, rhs) && !self.cstruct_eq(lhs, rhs)
    }

    fn cstruct_le(&self, lhs: &CStruct, rhs: &CStruct) -> bool {
        if lhs.commands.len() > rhs.commands.len() {
            return false;
        }

        let (lhs_elem, lhs_order) = self.cstruct_pieces(lhs);
        let (rhs_elem, rhs_order) = self.cstruct_pieces(rhs);

        // rhs must include every element and every ordered pair of lhs.
        if !lhs_elem.iter().all(|c| rhs_elem.binary_search(c).is_ok()) {
            return false;
        }
        if !lhs_order.iter().all(|e| rhs_order.contains(e)) {
            return false;
        }

        // The commands rhs appends to lhs must never be ordered before a
        // command lhs already holds.
        let seq: Vec<&Command> = rhs_elem
            .iter()
            .filter(|c| lhs_elem.binary_search(c).is_err())
            .collect();
        for (v, w) in &rhs_order {
            if seq.iter().any(|c| *c == v) && !seq.iter().any(|c| *c == w) {
                return false;
            }
        }
        true
    }

    fn cstruct_eq(&self, lhs: &CStruct, rhs: &CStruct) -> bool {
        if lhs.commands.len() != rhs.commands.len() {
            return false;
        }
        let (lhs_elem, lhs_order) = self.cstruct_pieces(lhs);
        let (rhs_elem, rhs_order) = self.cstruct_pieces(rhs);
        lhs_elem == rhs_elem && lhs_order == rhs_order
    }

    /// Two cstructs are compatible when they agree on the subgraph of shared
    /// commands and no unshared command of one conflicts with an unshared
    /// command of the other.
    fn cstruct_compatible(&self, lhs: &CStruct, rhs: &CStruct) -> bool {
        let (lhs_elem, lhs_order) = self.cstruct_pieces(lhs);
        let (rhs_elem, rhs_order) = self.cstruct_pieces(rhs);

        let only_lhs: Vec<&Command> = lhs_elem
            .iter()
            .filter(|c| rhs_elem.binary_search(c).is_err())
            .collect();
        let only_rhs: Vec<&Command> = rhs_elem
            .iter()
            .filter(|c| lhs_elem.binary_search(c).is_err())
            .collect();
        for c in &only_lhs {
            for d in &only_rhs {
                if self.interfere.conflict(c, d) {
                    return false;
                }
            }
        }

        let common: Vec<&Command> = lhs_elem
            .iter()
            .filter(|c| rhs_elem.binary_search(c).is_ok())
            .collect();
        for edge in lhs_order.symmetric_difference(&rhs_order) {
            if common.iter().any(|c| **c == edge.0) && common.iter().any(|c| **c == edge.1) {
                return false;
            }
        }
        true
    }

    /// Greatest lower bound. Commands on a cycle mark a conflict and drop out,
    /// together with everything downstream of a dropped command.
    fn cstruct_glb(&self, lhs: &CStruct, rhs: &CStruct, conflict: &mut bool) -> CStruct {
        let (lhs_cmds, lhs_order) = self.cstruct_pieces(lhs);
        let (rhs_cmds, rhs_order) = self.cstruct_pieces(rhs);
        let mut edge_list = lhs_order;
        edge_list.extend(rhs_order);

        let mut all_cmds: Vec<Command> = lhs_cmds.iter().chain(rhs_cmds.iter()).cloned().collect();
        all_cmds.sort();
        all_cmds.dedup();

        let mut exclude: Vec<Command> = Vec::new();
        for c in &all_cmds {
            let in_lhs = lhs_cmds.binary_search(c).is_ok();
            let in_rhs = rhs_cmds.binary_search(c).is_ok();
            if in_lhs != in_rhs {
                exclude.push(c.clone());
            }
        }
        for c in &all_cmds {
            if directed_path_exists(c, c, &edge_list) {
                *conflict = true;
                exclude.push(c.clone());
            }
        }

        let mut i = 0;
        while i < exclude.len() {
            let u = exclude[i].clone();
            for v in &all_cmds {
                if directed_path_exists(&u, v, &edge_list) && !exclude.contains(v) {
                    exclude.push(v.clone());
                }
            }
            i += 1;
        }
        exclude.sort();
        exclude.dedup();

        CStruct {
            commands: lhs
                .commands
                .iter()
                .filter(|c| exclude.binary_search(c).is_err())
                .cloned()
                .collect(),
        }
    }

    /// Least upper bound of two compatible cstructs: lhs followed by the
    /// commands only rhs holds, in rhs order.
    fn cstruct_lub(&self, lhs: &CStruct, rhs: &CStruct) -> CStruct {
        let mut lhs_sorted = lhs.commands.clone();
        lhs_sorted.sort();
        let mut out = lhs.clone();
        for c in &rhs.commands {
            if lhs_sorted.binary_search(c).is_err() {
                out.commands.push(c.clone());
            }
        }
        out
    }

    /// Splits a cstruct into its sorted command set and the conflict-induced
    /// partial order over its sequence.
    fn cstruct_pieces(&self, c: &CStruct) -> (Vec<Command>, PartialOrderSet) {
        let mut commands = c.commands.clone();
        commands.sort();
        let mut order = PartialOrderSet::new();
        for i in 0..c.commands.len() {
            for j in i + 1..c.commands.len() {
                if self.interfere.conflict(&c.commands[i], &c.commands[j]) {
                    order.insert((c.commands[i].clone(), c.commands[j].clone()));
                }
            }
        }
        (commands, order)
    }
}

fn directed_path_exists(from: &Command, to: &Command, edges: &PartialOrderSet) -> bool {
    let mut seen = BTreeSet::new();
    directed_path_exists_inner(from, to, edges, &mut seen)
}

fn directed_path_exists_inner(
    from: &Command,
    to: &Command,
    edges: &PartialOrderSet,
    seen: &mut BTreeSet<Command>,
) -> bool {
    let lower = (from.clone(), Command::default());
    for (u, v) in edges.range(lower..) {
        if u != from {
            break;
        }
        if v == to {
            return true;
        }
        if seen.insert(v.clone()) && directed_path_exists_inner(v, to, edges, seen) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoConflict;
    impl CommandInterference for NoConflict {
        fn conflict(&self, _: &Command, _: &Command) -> bool {
            false
        }
    }

    struct AllConflict;
    impl CommandInterference for AllConflict {
        fn conflict(&self, _: &Command, _: &Command) -> bool {
            true
        }
    }

    fn acceptors(n: u64) -> Vec<AbstractId> {
        (1..=n).map(AbstractId::new).collect()
    }

    fn engines(interfere: Arc<dyn CommandInterference>, n: u64) -> Vec<GeneralizedPaxos> {
        let ids = acceptors(n);
        ids.iter()
            .map(|id| GeneralizedPaxos::new(interfere.clone(), *id, &ids))
            .collect()
    }

    #[test]
    fn five_acceptors_learn_commuting_commands() {
        let mut gp = engines(Arc::new(NoConflict), 5);

        // Member 0 takes leadership and collects promises from everyone.
        let advance = gp[0].advance(true);
        let m1 = advance.p1a.expect("leader should solicit promises");
        assert!(advance.p2a.is_none());
        assert!(advance.p2b.is_none());
        for i in 0..5 {
            if let Some(r1) = gp[i].process_p1a(&m1) {
                gp[0].process_p1b(&r1);
            }
        }

        for (i, e) in gp.iter_mut().enumerate() {
            e.propose(Command::new(i as u16, format!("hello from {i}").into_bytes()));
        }

        // With a fast ballot in place every engine emits acceptances that the
        // others absorb, and everyone converges on all five commands.
        let advance = gp[0].advance(true);
        assert!(advance.p1a.is_none());
        assert!(advance.p2a.is_none());
        let m3 = advance.p2b.expect("fast ballot accepts proposals");
        for e in gp.iter_mut() {
            e.process_p2b(&m3);
            e.propose_from_p2b(&m3);
        }

        for round in 0..10 {
            let idx = round % 5;
            let advance = gp[idx].advance(false);
            let m3 = advance.p2b.expect("acceptors keep answering");
            for e in gp.iter_mut() {
                e.process_p2b(&m3);
                e.propose_from_p2b(&m3);
            }
        }

        for e in &gp {
            assert_eq!(e.learned().commands.len(), 5);
        }
    }

    #[test]
    fn conflicting_commands_converge_via_classic_ballot() {
        let mut gp = engines(Arc::new(AllConflict), 3);

        let advance = gp[0].advance(true);
        let m1 = advance.p1a.unwrap();
        for i in 0..3 {
            if let Some(r1) = gp[i].process_p1a(&m1) {
                gp[0].process_p1b(&r1);
            }
        }

        // Conflicting proposals arrive at different acceptors in different
        // orders while the ballot is fast.
        gp[1].propose(Command::new(1, b"one".to_vec()));
        gp[2].propose(Command::new(2, b"two".to_vec()));
        let a1 = gp[1].advance(false).p2b.unwrap();
        let a2 = gp[2].advance(false).p2b.unwrap();
        for e in gp.iter_mut() {
            e.process_p2b(&a1);
            e.process_p2b(&a2);
            e.propose_from_p2b(&a1);
            e.propose_from_p2b(&a2);
        }

        // Pumping every engine surfaces the opposite orderings, which trips
        // the conflict detector; the leader then drives a classic round until
        // every acceptor holds an identical ordered history.
        for _ in 0..8 {
            for idx in 0..3 {
                let advance = gp[idx].advance(idx == 0);
                if let Some(m1) = advance.p1a {
                    let replies: Vec<_> =
                        gp.iter_mut().filter_map(|e| e.process_p1a(&m1)).collect();
                    for r in replies {
                        gp[idx].process_p1b(&r);
                    }
                }
                if let Some(m2) = advance.p2a {
                    let replies: Vec<_> = gp.iter_mut().map(|e| e.process_p2a(&m2)).collect();
                    for r in replies {
                        for e in gp.iter_mut() {
                            e.process_p2b(&r);
                        }
                    }
                }
                if let Some(m3) = advance.p2b {
                    for e in gp.iter_mut() {
                        e.process_p2b(&m3);
                        e.propose_from_p2b(&m3);
                    }
                }
            }
        }

        let learned: Vec<CStruct> = gp.iter().map(|e| e.learned()).collect();
        assert_eq!(learned[0].commands.len(), 2);
        assert_eq!(learned[0], learned[1]);
        assert_eq!(learned[1], learned[2]);
    }

    #[test]
    fn duplicate_proposals_are_rejected() {
        let ids = acceptors(3);
        let mut e = GeneralizedPaxos::new(Arc::new(NoConflict), ids[0], &ids);
        let c = Command::new(1, b"x".to_vec());
        assert!(e.propose(c.clone()));
        assert!(!e.propose(c));
    }

    #[test]
    fn glb_drops_unshared_and_cyclic_commands() {
        let ids = acceptors(3);
        let e = GeneralizedPaxos::new(Arc::new(AllConflict), ids[0], &ids);
        let a = Command::new(1, b"a".to_vec());
        let b = Command::new(2, b"b".to_vec());
        let c = Command::new(3, b"c".to_vec());

        let mut conflict = false;
        let lhs = CStruct {
            commands: vec![a.clone(), b.clone()],
        };
        let rhs = CStruct {
            commands: vec![a.clone(), c.clone()],
        };
        let glb = e.cstruct_glb(&lhs, &rhs, &mut conflict);
        assert_eq!(glb.commands, vec![a.clone()]);
        assert!(!conflict);

        // Opposite orders of the same conflicting pair form a cycle; nothing
        // survives and the conflict flag trips.
        let lhs = CStruct {
            commands: vec![a.clone(), b.clone()],
        };
        let rhs = CStruct {
            commands: vec![b, a],
        };
        let glb = e.cstruct_glb(&lhs, &rhs, &mut conflict);
        assert!(glb.commands.is_empty());
        assert!(conflict);
    }
}
