// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use consus_config::CommId;

use crate::tests::{deploy_txmans, eventually};
use crate::transaction::TxState;
use crate::types::{TransactionGroup, TransactionId, Vote};

fn client() -> CommId {
    CommId::new(7777)
}

#[tokio::test(flavor = "multi_thread")]
async fn exactly_a_majority_of_durable_acks_advances() {
    // Five members configured, but member 0 is cut off from the rest; the
    // other members' durable acknowledgements are injected by hand.
    let deployment = deploy_txmans(0, 5, 1);
    let group = deployment.cluster.config.groups[0].clone();
    let tm = deployment.txmans[0].clone();
    for member in &group.members[1..] {
        deployment.network.partition(group.members[0], *member);
    }

    let txid = TransactionId::new(group.id, 1_000_000, 1);
    let tg = TransactionGroup::home(txid);
    let tx = tm.transaction(tg);
    tx.begin(client(), 1, txid.start, &group, vec![group.id], &tm);
    tx.prepare(client(), 2, 1, &tm);

    // The node's own log write supplies the first durable bit.
    assert!(
        eventually(Duration::from_secs(5), || tm.log_durable_upper_bound() >= 2).await,
        "own log writes should become durable"
    );

    // One further ack is two of five: not a quorum.
    tx.paxos_2b(group.members[1], 0, &tm);
    tx.paxos_2b(group.members[1], 1, &tm);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(tx.state(), TxState::Executing);

    // A third ack reaches the majority and the vote begins.
    tx.paxos_2b(group.members[2], 0, &tm);
    tx.paxos_2b(group.members[2], 1, &tm);
    assert!(
        eventually(Duration::from_secs(5), || tx.state() >= TxState::LocalCommitVote).await,
        "a majority of durable acks should start the local vote"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_begin_merges_into_one_operation() {
    let deployment = deploy_txmans(0, 1, 1);
    let group = deployment.cluster.config.groups[0].clone();
    let tm = deployment.txmans[0].clone();

    let txid = TransactionId::new(group.id, 2_000_000, 2);
    let tg = TransactionGroup::home(txid);
    let tx = tm.transaction(tg);
    tx.begin(client(), 1, txid.start, &group, vec![group.id], &tm);
    tx.begin(client(), 1, txid.start, &group, vec![group.id], &tm);
    assert_eq!(tx.ops_len(), 1);

    // A single-member group decides alone; an idempotent retry must not have
    // poisoned the preference.
    tx.prepare(client(), 2, 1, &tm);
    assert!(
        eventually(Duration::from_secs(10), || {
            tm.disposition(&tg) == Some(Vote::Commit)
        })
        .await,
        "the duplicate begin should still commit"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn wound_flips_the_vote_to_abort() {
    let deployment = deploy_txmans(0, 1, 1);
    let group = deployment.cluster.config.groups[0].clone();
    let tm = deployment.txmans[0].clone();

    let txid = TransactionId::new(group.id, 3_000_000, 3);
    let tg = TransactionGroup::home(txid);
    let tx = tm.transaction(tg);
    tx.begin(client(), 1, txid.start, &group, vec![group.id], &tm);
    tx.wound(&tm);
    tx.prepare(client(), 2, 1, &tm);

    assert!(
        eventually(Duration::from_secs(10), || {
            tm.disposition(&tg) == Some(Vote::Abort)
        })
        .await,
        "a wounded transaction must abort"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_retry_prefers_abort() {
    let deployment = deploy_txmans(0, 1, 1);
    let group = deployment.cluster.config.groups[0].clone();
    let tm = deployment.txmans[0].clone();

    let txid = TransactionId::new(group.id, 4_000_000, 4);
    let tg = TransactionGroup::home(txid);
    let tx = tm.transaction(tg);
    tx.begin(client(), 1, txid.start, &group, vec![group.id], &tm);
    tx.write(
        client(),
        2,
        1,
        bytes::Bytes::from_static(b"t"),
        bytes::Bytes::from_static(b"k"),
        bytes::Bytes::from_static(b"v1"),
        &tm,
    );
    assert!(tx.prefers_commit());

    // A "retry" carrying a different value is not idempotent; the slot merge
    // must refuse it and flip the preference to abort.
    tx.write(
        client(),
        3,
        1,
        bytes::Bytes::from_static(b"t"),
        bytes::Bytes::from_static(b"k"),
        bytes::Bytes::from_static(b"v2"),
        &tm,
    );
    assert!(!tx.prefers_commit());
    assert_eq!(tx.ops_len(), 2);
}
