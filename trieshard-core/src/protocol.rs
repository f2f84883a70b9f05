//! Wire protocol between manager, workers and clients
//!
//! Every message is a plain serde struct carried as JSON. Inbound requests
//! mirror the manager's RPC surface; outbound messages are the instructions
//! the manager sends to workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ManagerError, Result};
use crate::keyspace::KeyRange;

/// Worker identity, derived from its `host:port` network address
///
/// Deserialization goes through [`WorkerId::from_address`], so ids arriving
/// on the wire are normalized the same way as registered ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(String);

impl WorkerId {
    /// Derive an id from a worker's advertised address
    pub fn from_address(address: &str) -> Result<Self> {
        let address = address.trim();
        let invalid = |reason: &str| ManagerError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        Ok(Self(format!("{}:{}", host.to_ascii_lowercase(), port)))
    }

    /// Network address the worker listens on
    pub fn address(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WorkerId {
    type Error = ManagerError;

    fn try_from(address: String) -> Result<Self> {
        Self::from_address(&address)
    }
}

impl From<WorkerId> for String {
    fn from(id: WorkerId) -> Self {
        id.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shard identifier; never reused once a shard is split away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u64);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Split operation tracking id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "split-{}", self.0)
    }
}

/// Worker liveness as seen by the heartbeat monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Acknowledging probes
    Alive,
    /// Missed enough probes to be doubted
    Suspected,
    /// Evicted; shards reassigned
    Dead,
}

/// Split protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitState {
    Proposed,
    Sent,
    Acked,
    Committed,
    Failed,
}

impl SplitState {
    /// True once the operation can no longer change
    pub fn is_terminal(self) -> bool {
        matches!(self, SplitState::Committed | SplitState::Failed)
    }

    /// Whether the protocol permits moving from `self` to `next`
    pub fn can_transition_to(self, next: SplitState) -> bool {
        use SplitState::*;
        matches!(
            (self, next),
            (Proposed, Sent)
                | (Proposed, Failed)
                | (Sent, Acked)
                | (Sent, Failed)
                | (Acked, Committed)
                | (Acked, Failed)
        )
    }
}

/// Worker verdict on a split step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitAckStatus {
    /// Local partition done, serving the designated sub-range
    Ok,
    /// Worker could not carry out the step
    Rejected,
}

/// How a split request names its shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardSelector {
    Id(ShardId),
    /// The shard holding this key
    Containing(String),
}

// ========== Inbound RPC surface ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerResponse {
    pub worker_id: WorkerId,
    /// Ranges handed to the worker on joining (bootstrap shard or orphans)
    pub assigned: Vec<KeyRange>,
}

/// Word count a worker reports for one of its ranges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLoad {
    pub range: KeyRange,
    pub words: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub worker_id: WorkerId,
    /// Worker clock, milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default)]
    pub loads: Vec<ShardLoad>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitTrieRequest {
    pub shard: ShardSelector,
    #[serde(default)]
    pub split_point: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitTrieResponse {
    pub operation_id: OperationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitWordResponse {
    pub worker_id: WorkerId,
    pub shard_id: ShardId,
    pub range: KeyRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitTrieRequestAck {
    pub operation_id: OperationId,
    pub worker_id: WorkerId,
    pub status: SplitAckStatus,
}

/// Observable state of a split operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitStatus {
    pub operation_id: OperationId,
    pub state: SplitState,
    pub shard_id: ShardId,
    pub range: KeyRange,
    pub split_point: String,
    pub source: WorkerId,
    pub target: WorkerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerView {
    pub worker_id: WorkerId,
    pub liveness: Liveness,
    pub last_heartbeat: Option<i64>,
    pub missed_probes: u32,
    pub shards: Vec<ShardId>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardView {
    pub shard_id: ShardId,
    pub range: KeyRange,
    pub owner: Option<WorkerId>,
    pub load: u64,
}

/// Point-in-time view of cluster topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub workers: Vec<WorkerView>,
    pub shards: Vec<ShardView>,
    pub active_splits: Vec<SplitStatus>,
    pub taken_at: DateTime<Utc>,
}

// ========== Outbound worker instructions ==========

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatProbe {
    pub sent_at: i64,
}

/// Sent to the current owner: partition `range` at `split_point`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitInstruction {
    pub operation_id: OperationId,
    pub range: KeyRange,
    pub split_point: String,
    /// Sub-range the owner keeps serving
    pub keep: KeyRange,
    /// Sub-range handed to `target`
    pub hand_off: KeyRange,
    pub target: WorkerId,
}

/// Sent to a split target distinct from the owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignRange {
    pub operation_id: OperationId,
    pub range: KeyRange,
    pub source: WorkerId,
}

/// Discard any uncommitted partition from a failed split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortSplit {
    pub operation_id: OperationId,
    pub range: KeyRange,
}

/// Take over a range from an evicted worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdoptRange {
    pub shard_id: ShardId,
    pub range: KeyRange,
    /// `None` when the shard sat orphaned before this adoption
    pub previous_owner: Option<WorkerId>,
}

/// Instruction queued for delivery to one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    Probe(WorkerId, HeartbeatProbe),
    Split(WorkerId, SplitInstruction),
    Assign(WorkerId, AssignRange),
    Abort(WorkerId, AbortSplit),
    Adopt(WorkerId, AdoptRange),
    /// Worker was evicted; close its delivery queue once drained
    Release(WorkerId),
}

impl WorkerCommand {
    /// Worker this command is addressed to
    pub fn worker(&self) -> &WorkerId {
        match self {
            WorkerCommand::Probe(w, _)
            | WorkerCommand::Split(w, _)
            | WorkerCommand::Assign(w, _)
            | WorkerCommand::Abort(w, _)
            | WorkerCommand::Adopt(w, _)
            | WorkerCommand::Release(w) => w,
        }
    }

    /// Split operation this command belongs to, if any
    pub fn operation_id(&self) -> Option<OperationId> {
        match self {
            WorkerCommand::Split(_, s) => Some(s.operation_id),
            WorkerCommand::Assign(_, a) => Some(a.operation_id),
            WorkerCommand::Abort(_, a) => Some(a.operation_id),
            WorkerCommand::Probe(..) | WorkerCommand::Adopt(..) | WorkerCommand::Release(..) => None,
        }
    }
}
