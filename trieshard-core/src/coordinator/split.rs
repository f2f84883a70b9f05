//! Shard split protocol
//!
//! Drives each split through `Proposed -> Sent -> Acked -> Committed`, or
//! to `Failed` on rejection, eviction or deadline. The registry is only
//! touched on commit, so a failed split leaves ownership exactly as it was.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::registry::ClusterRegistry;
use crate::error::{ManagerError, Result};
use crate::keyspace::KeyRange;
use crate::protocol::{
    AbortSplit, AssignRange, OperationId, ShardId, ShardSelector, SplitAckStatus, SplitInstruction,
    SplitState, SplitStatus, SplitTrieRequestAck, WorkerCommand, WorkerId,
};

/// Resolved splits kept for status queries
const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// How the worker receiving the upper half is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetStrategy {
    /// Alive worker with the fewest shards, other than the source owner
    #[default]
    LeastLoaded,
    /// Source owner keeps both halves
    SameWorker,
}

/// Configuration for the split coordinator
#[derive(Debug, Clone)]
pub struct SplitConfig {
    /// Time allowed for all acknowledgments
    pub ack_deadline: Duration,
    /// Word count above which a shard is split automatically
    pub load_threshold: u64,
    pub strategy: TargetStrategy,
    pub history_limit: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            ack_deadline: Duration::from_secs(crate::DEFAULT_SPLIT_ACK_DEADLINE_SECS),
            load_threshold: 100_000,
            strategy: TargetStrategy::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// An in-flight split
#[derive(Debug, Clone)]
pub struct SplitOperation {
    pub id: OperationId,
    pub shard_id: ShardId,
    pub range: KeyRange,
    pub split_point: String,
    pub lower: KeyRange,
    pub upper: KeyRange,
    pub source: WorkerId,
    pub target: WorkerId,
    pub state: SplitState,
    /// Workers that must acknowledge before commit
    pub required: BTreeSet<WorkerId>,
    pub acked: BTreeSet<WorkerId>,
    pub deadline: Instant,
    pub reason: Option<String>,
}

impl SplitOperation {
    fn transition(&mut self, next: SplitState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ManagerError::Internal {
                message: format!("{} cannot move from {:?} to {:?}", self.id, self.state, next),
            });
        }
        debug!("{} {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    fn missing_acks(&self) -> Vec<String> {
        self.required
            .difference(&self.acked)
            .map(ToString::to_string)
            .collect()
    }

    pub fn status(&self) -> SplitStatus {
        SplitStatus {
            operation_id: self.id,
            state: self.state,
            shard_id: self.shard_id,
            range: self.range.clone(),
            split_point: self.split_point.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Result of feeding one ack into the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckResolution {
    /// Still waiting on other workers
    Pending,
    Committed(Vec<ShardId>),
    Failed(String),
    /// Ack did not match an active operation
    Ignored,
}

/// Tracks active splits; at most one per shard
#[derive(Debug)]
pub struct SplitCoordinator {
    config: SplitConfig,
    active: BTreeMap<OperationId, SplitOperation>,
    by_shard: HashMap<ShardId, OperationId>,
    history: VecDeque<SplitStatus>,
    next_id: u64,
}

impl SplitCoordinator {
    pub fn new(config: SplitConfig) -> Self {
        Self {
            config,
            active: BTreeMap::new(),
            by_shard: HashMap::new(),
            history: VecDeque::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// Validate a split request and send instructions to the workers involved
    pub fn propose(
        &mut self,
        registry: &ClusterRegistry,
        selector: &ShardSelector,
        split_point: Option<&str>,
        now: Instant,
        out: &mut Vec<WorkerCommand>,
    ) -> Result<OperationId> {
        let invalid = |reason: String| ManagerError::InvalidSplit { reason };

        let shard = match selector {
            ShardSelector::Id(id) => registry.shard(*id),
            ShardSelector::Containing(key) => registry.shard_containing(key),
        }
        .ok_or_else(|| invalid(format!("no shard matches {:?}", selector)))?;

        let source = shard
            .owner
            .clone()
            .filter(|owner| registry.worker(owner).is_some_and(|w| w.is_alive()))
            .ok_or_else(|| invalid(format!("{} has no alive owner", shard.id)))?;

        if let Some(op) = self.by_shard.get(&shard.id) {
            return Err(invalid(format!("{} is already being split by {}", shard.id, op)));
        }

        let split_point = match split_point {
            Some(point) => point.to_string(),
            None => shard
                .range
                .midpoint()
                .ok_or_else(|| invalid(format!("{} is too narrow to split", shard.range)))?,
        };
        let (lower, upper) = shard
            .range
            .split_at(&split_point)
            .ok_or_else(|| invalid(format!("{:?} is not inside {}", split_point, shard.range)))?;

        let target = self.select_target(registry, &source);
        let id = OperationId(self.next_id);
        self.next_id += 1;

        let mut op = SplitOperation {
            id,
            shard_id: shard.id,
            range: shard.range.clone(),
            split_point,
            lower,
            upper,
            required: BTreeSet::from([source.clone(), target.clone()]),
            source,
            target,
            state: SplitState::Proposed,
            acked: BTreeSet::new(),
            deadline: now + self.config.ack_deadline,
            reason: None,
        };

        info!(
            "Proposed {} of {} {} at {:?}: {} keeps {}, {} takes {}",
            id, op.shard_id, op.range, op.split_point, op.source, op.lower, op.target, op.upper
        );

        out.push(WorkerCommand::Split(
            op.source.clone(),
            SplitInstruction {
                operation_id: id,
                range: op.range.clone(),
                split_point: op.split_point.clone(),
                keep: op.lower.clone(),
                hand_off: op.upper.clone(),
                target: op.target.clone(),
            },
        ));
        if op.target != op.source {
            out.push(WorkerCommand::Assign(
                op.target.clone(),
                AssignRange {
                    operation_id: id,
                    range: op.upper.clone(),
                    source: op.source.clone(),
                },
            ));
        }
        op.transition(SplitState::Sent)?;

        self.by_shard.insert(op.shard_id, id);
        self.active.insert(id, op);
        Ok(id)
    }

    /// Feed a worker's split acknowledgment received at `now`
    ///
    /// An ack arriving at or after the deadline fails the operation even if
    /// it is the last one missing.
    pub fn on_ack(
        &mut self,
        registry: &mut ClusterRegistry,
        ack: &SplitTrieRequestAck,
        now: Instant,
        out: &mut Vec<WorkerCommand>,
    ) -> AckResolution {
        let Some(op) = self.active.get_mut(&ack.operation_id) else {
            if self.history.iter().any(|s| s.operation_id == ack.operation_id) {
                debug!("Late ack for resolved {} from {}", ack.operation_id, ack.worker_id);
            } else {
                warn!("Ack for unknown {} from {}", ack.operation_id, ack.worker_id);
            }
            return AckResolution::Ignored;
        };

        if !op.required.contains(&ack.worker_id) {
            warn!("{} is not a participant of {}", ack.worker_id, op.id);
            return AckResolution::Ignored;
        }

        if op.deadline <= now {
            let id = op.id;
            let reason = ManagerError::Timeout {
                operation_id: id.0,
                missing: op.missing_acks(),
            }
            .to_string();
            debug!("Ack for {} from {} arrived after the deadline", id, ack.worker_id);
            self.fail(id, reason.clone(), None, out);
            return AckResolution::Failed(reason);
        }

        if ack.status == SplitAckStatus::Rejected {
            let reason = format!("rejected by {}", ack.worker_id);
            let id = op.id;
            self.fail(id, reason.clone(), None, out);
            return AckResolution::Failed(reason);
        }

        op.acked.insert(ack.worker_id.clone());
        if op.acked != op.required {
            debug!("{} acked by {}, waiting on {:?}", op.id, ack.worker_id, op.missing_acks());
            return AckResolution::Pending;
        }

        let id = op.id;
        if let Err(e) = op.transition(SplitState::Acked) {
            error!("{}", e);
            return AckResolution::Ignored;
        }
        self.commit(id, registry, out)
    }

    /// Fail every split whose deadline has passed
    pub fn expire(&mut self, now: Instant, out: &mut Vec<WorkerCommand>) -> Vec<ManagerError> {
        let expired: Vec<OperationId> = self
            .active
            .values()
            .filter(|op| op.deadline <= now)
            .map(|op| op.id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                let op = self.active.get(&id)?;
                let timeout = ManagerError::Timeout {
                    operation_id: id.0,
                    missing: op.missing_acks(),
                };
                self.fail(id, timeout.to_string(), None, out);
                Some(timeout)
            })
            .collect()
    }

    /// Fail every split that depends on `worker`, which has just died
    pub fn fail_involving(&mut self, worker: &WorkerId, out: &mut Vec<WorkerCommand>) -> Vec<OperationId> {
        let doomed: Vec<OperationId> = self
            .active
            .values()
            .filter(|op| op.required.contains(worker))
            .map(|op| op.id)
            .collect();

        for id in &doomed {
            self.fail(*id, format!("participant {} was evicted", worker), Some(worker), out);
        }
        doomed
    }

    pub fn is_splitting(&self, shard_id: ShardId) -> bool {
        self.by_shard.contains_key(&shard_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Earliest deadline among active splits
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.values().map(|op| op.deadline).min()
    }

    pub fn status(&self, id: OperationId) -> Option<SplitStatus> {
        self.active
            .get(&id)
            .map(SplitOperation::status)
            .or_else(|| self.history.iter().rev().find(|s| s.operation_id == id).cloned())
    }

    pub fn active_statuses(&self) -> Vec<SplitStatus> {
        self.active.values().map(SplitOperation::status).collect()
    }

    fn select_target(&self, registry: &ClusterRegistry, source: &WorkerId) -> WorkerId {
        match self.config.strategy {
            TargetStrategy::SameWorker => source.clone(),
            TargetStrategy::LeastLoaded => registry
                .alive_workers()
                .filter(|w| w.id != *source)
                .min_by(|a, b| a.shards.len().cmp(&b.shards.len()).then_with(|| a.id.cmp(&b.id)))
                .map(|w| w.id.clone())
                .unwrap_or_else(|| source.clone()),
        }
    }

    fn commit(&mut self, id: OperationId, registry: &mut ClusterRegistry, out: &mut Vec<WorkerCommand>) -> AckResolution {
        let Some(op) = self.active.get(&id) else {
            return AckResolution::Ignored;
        };

        let ranges = [op.lower.clone(), op.upper.clone()];
        let owners = [op.source.clone(), op.target.clone()];
        match registry.transfer_shard(&op.range, &ranges, &owners) {
            Ok(new_shards) => {
                let Some(mut op) = self.take(id) else {
                    return AckResolution::Ignored;
                };
                if let Err(e) = op.transition(SplitState::Committed) {
                    error!("{}", e);
                }
                info!("Committed {}: {} now {} + {}", op.id, op.range, op.lower, op.upper);
                self.remember(op.status());
                AckResolution::Committed(new_shards)
            }
            Err(e) => {
                error!("Commit of {} failed: {}", id, e);
                let reason = e.to_string();
                self.fail(id, reason.clone(), None, out);
                AckResolution::Failed(reason)
            }
        }
    }

    /// Move an operation to `Failed` and tell participants to drop their
    /// partial work. `skip` names a participant that cannot be reached.
    fn fail(&mut self, id: OperationId, reason: String, skip: Option<&WorkerId>, out: &mut Vec<WorkerCommand>) {
        let Some(mut op) = self.take(id) else {
            return;
        };
        if let Err(e) = op.transition(SplitState::Failed) {
            error!("{}", e);
        }
        warn!("{} of {} failed: {}", op.id, op.range, reason);

        for worker in op.required.iter().filter(|w| Some(*w) != skip) {
            out.push(WorkerCommand::Abort(
                worker.clone(),
                AbortSplit {
                    operation_id: op.id,
                    range: op.range.clone(),
                },
            ));
        }

        op.reason = Some(reason);
        self.remember(op.status());
    }

    fn take(&mut self, id: OperationId) -> Option<SplitOperation> {
        let op = self.active.remove(&id)?;
        self.by_shard.remove(&op.shard_id);
        Some(op)
    }

    fn remember(&mut self, status: SplitStatus) {
        if self.history.len() >= self.config.history_limit.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(status);
    }
}
