//! Unit tests for the split coordinator
//!
//! Tests target selection, concurrent splits on distinct shards and
//! bookkeeping of resolved operations.

use tokio::time::Instant;
use trieshard_core::coordinator::{
    AckResolution, ClusterRegistry, HeartbeatConfig, HeartbeatMonitor, SplitConfig, SplitCoordinator,
};
use trieshard_core::protocol::{
    HeartbeatAck, OperationId, ShardSelector, SplitAckStatus, SplitState, SplitTrieRequestAck, WorkerCommand,
    WorkerId,
};
use trieshard_core::ManagerError;

fn wid(addr: &str) -> WorkerId {
    WorkerId::from_address(addr).unwrap()
}

fn cluster(addrs: &[&str]) -> (ClusterRegistry, Vec<WorkerId>) {
    let mut registry = ClusterRegistry::new();
    let ids: Vec<WorkerId> = addrs.iter().map(|a| wid(a)).collect();
    for id in &ids {
        registry.register_worker(id.clone()).unwrap();
    }
    registry.assign_initial_shard(&ids[0]).unwrap();
    (registry, ids)
}

fn ack(op: OperationId, worker: &WorkerId, status: SplitAckStatus) -> SplitTrieRequestAck {
    SplitTrieRequestAck {
        operation_id: op,
        worker_id: worker.clone(),
        status,
    }
}

/// Propose a split of the shard holding `word` and ack it from every participant
fn split_and_commit(
    splits: &mut SplitCoordinator,
    registry: &mut ClusterRegistry,
    word: &str,
) -> (OperationId, WorkerId) {
    let mut out = Vec::new();
    let op = splits
        .propose(registry, &ShardSelector::Containing(word.into()), None, Instant::now(), &mut out)
        .unwrap();
    let status = splits.status(op).unwrap();

    for worker in [&status.source, &status.target] {
        splits.on_ack(registry, &ack(op, worker, SplitAckStatus::Ok), Instant::now(), &mut out);
    }
    assert_eq!(splits.status(op).unwrap().state, SplitState::Committed);
    (op, status.target)
}

#[test]
fn test_least_loaded_target_selection() {
    let (mut registry, ids) = cluster(&["a:1", "b:1", "c:1"]);
    let mut splits = SplitCoordinator::new(SplitConfig::default());

    // b and c both own nothing; the lower id wins
    let (_, first) = split_and_commit(&mut splits, &mut registry, "apple");
    assert_eq!(first, ids[1]);

    // Now c is the only worker without a shard
    let (_, second) = split_and_commit(&mut splits, &mut registry, "apple");
    assert_eq!(second, ids[2]);

    registry.check_partition().unwrap();
    assert_eq!(registry.shard_count(), 3);
    assert_eq!(registry.lookup_owner("apple").unwrap().1.id, ids[0]);
    assert_eq!(registry.lookup_owner("grape").unwrap().1.id, ids[2]);
    assert_eq!(registry.lookup_owner("zebra").unwrap().1.id, ids[1]);
}

#[test]
fn test_single_worker_splits_onto_itself() {
    let (mut registry, ids) = cluster(&["solo:1"]);
    let mut splits = SplitCoordinator::new(SplitConfig::default());

    let (_, target) = split_and_commit(&mut splits, &mut registry, "apple");
    assert_eq!(target, ids[0]);
    assert_eq!(registry.worker(&ids[0]).unwrap().shards.len(), 2);
}

#[test]
fn test_distinct_shards_split_concurrently() {
    let (mut registry, ids) = cluster(&["a:1", "b:1"]);
    let mut splits = SplitCoordinator::new(SplitConfig::default());
    split_and_commit(&mut splits, &mut registry, "apple");

    let mut out = Vec::new();
    let low = splits
        .propose(&registry, &ShardSelector::Containing("apple".into()), None, Instant::now(), &mut out)
        .unwrap();
    let high = splits
        .propose(&registry, &ShardSelector::Containing("zebra".into()), None, Instant::now(), &mut out)
        .unwrap();
    assert_eq!(splits.active_count(), 2);

    // Interleave acks across both operations
    for (op, worker) in [(low, &ids[0]), (high, &ids[1]), (high, &ids[0]), (low, &ids[1])] {
        splits.on_ack(&mut registry, &ack(op, worker, SplitAckStatus::Ok), Instant::now(), &mut out);
    }

    assert_eq!(splits.active_count(), 0);
    assert_eq!(registry.shard_count(), 4);
    registry.check_partition().unwrap();
}

#[test]
fn test_ack_from_outsider_is_ignored() {
    let (mut registry, ids) = cluster(&["a:1", "b:1", "c:1"]);
    let mut splits = SplitCoordinator::new(SplitConfig::default());
    let mut out = Vec::new();
    let op = splits
        .propose(&registry, &ShardSelector::Containing("apple".into()), None, Instant::now(), &mut out)
        .unwrap();

    // c is neither source nor target, so even a rejection from it is ignored
    let resolution = splits.on_ack(&mut registry, &ack(op, &ids[2], SplitAckStatus::Rejected), Instant::now(), &mut out);
    assert_eq!(resolution, AckResolution::Ignored);
    assert_eq!(splits.status(op).unwrap().state, SplitState::Sent);

    let unknown = splits.on_ack(&mut registry, &ack(OperationId(404), &ids[0], SplitAckStatus::Ok), Instant::now(), &mut out);
    assert_eq!(unknown, AckResolution::Ignored);
}

#[test]
fn test_rejection_frees_shard_for_retry() {
    let (mut registry, ids) = cluster(&["a:1", "b:1"]);
    let mut splits = SplitCoordinator::new(SplitConfig::default());
    let mut out = Vec::new();
    let selector = ShardSelector::Containing("apple".into());

    let op = splits.propose(&registry, &selector, None, Instant::now(), &mut out).unwrap();
    splits.on_ack(&mut registry, &ack(op, &ids[1], SplitAckStatus::Rejected), Instant::now(), &mut out);

    let status = splits.status(op).unwrap();
    assert_eq!(status.state, SplitState::Failed);
    assert!(status.reason.unwrap().contains("rejected"));
    assert!(out.iter().any(|c| matches!(c, WorkerCommand::Abort(w, _) if *w == ids[0])));

    let retry = splits.propose(&registry, &selector, None, Instant::now(), &mut out).unwrap();
    assert_ne!(retry, op);
}

#[test]
fn test_history_is_bounded() {
    let (mut registry, ids) = cluster(&["a:1", "b:1"]);
    let mut splits = SplitCoordinator::new(SplitConfig {
        history_limit: 2,
        ..Default::default()
    });
    let mut out = Vec::new();
    let selector = ShardSelector::Containing("apple".into());

    let mut ops = Vec::new();
    for _ in 0..3 {
        let op = splits.propose(&registry, &selector, None, Instant::now(), &mut out).unwrap();
        splits.on_ack(&mut registry, &ack(op, &ids[0], SplitAckStatus::Rejected), Instant::now(), &mut out);
        ops.push(op);
    }

    assert!(splits.status(ops[0]).is_none());
    assert_eq!(splits.status(ops[1]).unwrap().state, SplitState::Failed);
    assert_eq!(splits.status(ops[2]).unwrap().state, SplitState::Failed);
}

#[test]
fn test_split_point_outside_shard() {
    let (mut registry, ids) = cluster(&["a:1", "b:1"]);
    let mut splits = SplitCoordinator::new(SplitConfig::default());
    split_and_commit(&mut splits, &mut registry, "apple");

    let mut out = Vec::new();
    let result = splits.propose(
        &registry,
        &ShardSelector::Containing("zebra".into()),
        Some("c"),
        Instant::now(),
        &mut out,
    );
    assert!(matches!(result, Err(ManagerError::InvalidSplit { .. })));
    assert!(out.is_empty());
    assert_eq!(registry.lookup_owner("zebra").unwrap().1.id, ids[1]);
}

#[test]
fn test_suspected_owner_cannot_split() {
    let (mut registry, ids) = cluster(&["a:1", "b:1"]);
    let monitor = HeartbeatMonitor::new(HeartbeatConfig::default());
    let mut splits = SplitCoordinator::new(SplitConfig::default());

    // Only b answers, so a (the owner) becomes suspected
    for t in 0..3 {
        monitor.probe_round(&mut registry, t);
        monitor.on_ack(
            &mut registry,
            &HeartbeatAck {
                worker_id: ids[1].clone(),
                timestamp: t,
                loads: Vec::new(),
            },
        );
    }

    let mut out = Vec::new();
    let result = splits.propose(&registry, &ShardSelector::Containing("apple".into()), None, Instant::now(), &mut out);
    assert!(matches!(result, Err(ManagerError::InvalidSplit { .. })));
}
