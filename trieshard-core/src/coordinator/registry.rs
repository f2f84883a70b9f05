//! Cluster registry
//!
//! Authoritative map of workers and the shards they own. Only the manager
//! event loop holds a mutable reference; everything else sees snapshots.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::Bound;
use tracing::{debug, error, info, warn};

use crate::error::{ManagerError, Result};
use crate::keyspace::KeyRange;
use crate::protocol::{Liveness, ShardId, ShardView, WorkerId, WorkerView};

/// Evicted ids remembered for discarding their late acks
const EVICTED_MEMORY: usize = 1024;

/// A registered worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerNode {
    pub id: WorkerId,
    pub liveness: Liveness,
    /// Worker-reported time of the newest accepted ack (ms since epoch)
    pub last_heartbeat: Option<i64>,
    /// Consecutive probes that went unanswered
    pub missed_probes: u32,
    /// A probe was sent and has not been acknowledged yet
    pub probe_outstanding: bool,
    pub shards: BTreeSet<ShardId>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerNode {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            liveness: Liveness::Alive,
            last_heartbeat: None,
            missed_probes: 0,
            probe_outstanding: false,
            shards: BTreeSet::new(),
            registered_at: Utc::now(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.liveness == Liveness::Alive
    }
}

/// A contiguous slice of the trie key space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub id: ShardId,
    pub range: KeyRange,
    /// `None` while orphaned
    pub owner: Option<WorkerId>,
    /// Approximate word count, as last reported by the owner
    pub load: u64,
}

/// Result of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    New,
    /// A suspected node re-registered and is alive again
    Revived,
}

/// Shard handed to a new owner after its previous owner was evicted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassignment {
    pub shard_id: ShardId,
    pub range: KeyRange,
    pub previous_owner: WorkerId,
    /// `None` when no live worker could take it
    pub new_owner: Option<WorkerId>,
}

/// Workers and shard ownership
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    workers: BTreeMap<WorkerId, WorkerNode>,
    /// Shards keyed by range start
    shards: BTreeMap<String, Shard>,
    shard_starts: HashMap<ShardId, String>,
    evicted: HashSet<WorkerId>,
    /// Eviction order, oldest first
    evicted_order: VecDeque<WorkerId>,
    next_shard_id: u64,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, or revive it if it is currently suspected
    pub fn register_worker(&mut self, id: WorkerId) -> Result<Registration> {
        if let Some(node) = self.workers.get_mut(&id) {
            return match node.liveness {
                Liveness::Alive => Err(ManagerError::Duplicate {
                    worker_id: id.to_string(),
                }),
                Liveness::Suspected | Liveness::Dead => {
                    node.liveness = Liveness::Alive;
                    node.missed_probes = 0;
                    node.probe_outstanding = false;
                    info!("Worker {} re-registered, keeping {} shards", id, node.shards.len());
                    Ok(Registration::Revived)
                }
            };
        }

        if self.evicted.remove(&id) {
            self.evicted_order.retain(|w| *w != id);
        }
        info!("Registered worker {}", id);
        self.workers.insert(id.clone(), WorkerNode::new(id));
        Ok(Registration::New)
    }

    /// Hand the full key space to the first worker
    pub fn assign_initial_shard(&mut self, worker_id: &WorkerId) -> Result<ShardId> {
        if !self.shards.is_empty() {
            error!("Initial shard requested but {} shards already exist", self.shards.len());
            return Err(ManagerError::Conflict {
                range: KeyRange::full(),
                reason: "cluster is already bootstrapped".into(),
            });
        }
        if !self.workers.contains_key(worker_id) {
            return Err(ManagerError::WorkerNotRegistered {
                worker_id: worker_id.to_string(),
            });
        }

        let shard_id = self.insert_shard(KeyRange::full(), Some(worker_id.clone()), 0);
        info!("Bootstrapped key space as {} on worker {}", shard_id, worker_id);
        Ok(shard_id)
    }

    /// Shard whose range contains `key`
    pub fn shard_containing(&self, key: &str) -> Option<&Shard> {
        self.shards
            .range::<str, _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, shard)| shard)
            .filter(|shard| shard.range.contains(key))
    }

    /// Owner of the shard containing `key`
    pub fn lookup_owner(&self, key: &str) -> Result<(&Shard, &WorkerNode)> {
        let shard = self.shard_containing(key).ok_or_else(|| {
            error!(key, shards = self.shards.len(), "No shard covers key; partition is broken");
            ManagerError::NotFound { key: key.to_string() }
        })?;

        let node = shard
            .owner
            .as_ref()
            .and_then(|owner| self.workers.get(owner))
            .ok_or_else(|| ManagerError::Unavailable {
                range: shard.range.clone(),
            })?;

        Ok((shard, node))
    }

    /// Atomically replace the shard `old` with `new_ranges`
    ///
    /// `new_ranges` must tile `old` exactly, in key order, and every owner
    /// must be an alive worker. Fails without side effects otherwise.
    pub fn transfer_shard(
        &mut self,
        old: &KeyRange,
        new_ranges: &[KeyRange],
        new_owners: &[WorkerId],
    ) -> Result<Vec<ShardId>> {
        let conflict = |reason: String| {
            error!(range = %old, "Shard transfer rejected: {}", reason);
            ManagerError::Conflict {
                range: old.clone(),
                reason,
            }
        };

        let current = self
            .shards
            .get(&old.start)
            .filter(|shard| shard.range == *old)
            .ok_or_else(|| conflict("range is not a single intact shard".into()))?;

        if new_ranges.is_empty() || new_ranges.len() != new_owners.len() {
            return Err(conflict(format!(
                "{} ranges for {} owners",
                new_ranges.len(),
                new_owners.len()
            )));
        }
        if !tiles(old, new_ranges) {
            return Err(conflict("new ranges do not tile the old range".into()));
        }
        for owner in new_owners {
            if !self.workers.get(owner).is_some_and(WorkerNode::is_alive) {
                return Err(conflict(format!("owner {} is not alive", owner)));
            }
        }

        let old_id = current.id;
        let old_owner = current.owner.clone();
        let share = current.load / new_ranges.len() as u64;

        self.remove_shard(old_id);
        if let Some(owner) = old_owner.and_then(|o| self.workers.get_mut(&o)) {
            owner.shards.remove(&old_id);
        }

        let new_ids: Vec<ShardId> = new_ranges
            .iter()
            .zip(new_owners)
            .map(|(range, owner)| self.insert_shard(range.clone(), Some(owner.clone()), share))
            .collect();

        info!(
            "Transferred {} {} into {:?}",
            old_id,
            old,
            new_ids.iter().map(ToString::to_string).collect::<Vec<_>>()
        );
        self.check_partition()?;
        Ok(new_ids)
    }

    /// Remove a dead worker and hand its shards to their nearest live neighbours
    pub fn evict(&mut self, worker_id: &WorkerId) -> Vec<Reassignment> {
        let Some(node) = self.workers.remove(worker_id) else {
            return Vec::new();
        };
        self.remember_eviction(worker_id);

        let order: Vec<String> = self.shards.keys().cloned().collect();
        let mut reassignments = Vec::with_capacity(node.shards.len());

        for shard_id in &node.shards {
            let Some(start) = self.shard_starts.get(shard_id).cloned() else {
                continue;
            };
            let Ok(position) = order.binary_search(&start) else {
                continue;
            };

            let new_owner = self.nearest_live_owner(&order, position, worker_id);
            let Some(shard) = self.shards.get_mut(&start) else {
                continue;
            };
            shard.owner = new_owner.clone();

            match &new_owner {
                Some(owner) => {
                    info!("Reassigned {} {} from {} to {}", shard.id, shard.range, worker_id, owner);
                    if let Some(adopter) = self.workers.get_mut(owner) {
                        adopter.shards.insert(shard.id);
                    }
                }
                None => warn!("{} {} orphaned: no live worker left", shard.id, shard.range),
            }

            reassignments.push(Reassignment {
                shard_id: shard.id,
                range: shard.range.clone(),
                previous_owner: worker_id.clone(),
                new_owner,
            });
        }

        reassignments
    }

    /// Give every orphaned shard to `worker_id`
    pub fn adopt_orphans(&mut self, worker_id: &WorkerId) -> Vec<(ShardId, KeyRange)> {
        let Some(node) = self.workers.get_mut(worker_id) else {
            return Vec::new();
        };

        let mut adopted = Vec::new();
        for shard in self.shards.values_mut().filter(|s| s.owner.is_none()) {
            shard.owner = Some(worker_id.clone());
            node.shards.insert(shard.id);
            adopted.push((shard.id, shard.range.clone()));
        }

        if !adopted.is_empty() {
            info!("Worker {} adopted {} orphaned shards", worker_id, adopted.len());
        }
        adopted
    }

    /// Record a reported word count; ignored unless `worker_id` owns `range`
    pub fn record_load(&mut self, worker_id: &WorkerId, range: &KeyRange, words: u64) -> Option<ShardId> {
        let shard = self
            .shards
            .get_mut(&range.start)
            .filter(|s| s.range == *range && s.owner.as_ref() == Some(worker_id));

        match shard {
            Some(shard) => {
                shard.load = words;
                Some(shard.id)
            }
            None => {
                debug!("Ignoring load report from {} for {}", worker_id, range);
                None
            }
        }
    }

    /// Verify the shards tile the key space with no gaps or overlaps
    pub fn check_partition(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Ok(());
        }

        let ranges: Vec<KeyRange> = self.shards.values().map(|s| s.range.clone()).collect();
        if tiles(&KeyRange::full(), &ranges) {
            Ok(())
        } else {
            error!("Partition invariant violated: {:?}", ranges);
            Err(ManagerError::Conflict {
                range: KeyRange::full(),
                reason: "shards do not tile the key space".into(),
            })
        }
    }

    pub fn worker(&self, id: &WorkerId) -> Option<&WorkerNode> {
        self.workers.get(id)
    }

    pub(crate) fn worker_mut(&mut self, id: &WorkerId) -> Option<&mut WorkerNode> {
        self.workers.get_mut(id)
    }

    pub(crate) fn workers_mut(&mut self) -> impl Iterator<Item = &mut WorkerNode> {
        self.workers.values_mut()
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerNode> {
        self.workers.values()
    }

    pub fn alive_workers(&self) -> impl Iterator<Item = &WorkerNode> {
        self.workers.values().filter(|w| w.is_alive())
    }

    pub fn alive_count(&self) -> usize {
        self.alive_workers().count()
    }

    /// True if the worker was removed after being declared dead
    pub fn is_evicted(&self, id: &WorkerId) -> bool {
        self.evicted.contains(id)
    }

    pub fn shard(&self, id: ShardId) -> Option<&Shard> {
        self.shard_starts.get(&id).and_then(|start| self.shards.get(start))
    }

    /// Shards in key order
    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn worker_views(&self) -> Vec<WorkerView> {
        self.workers
            .values()
            .map(|w| WorkerView {
                worker_id: w.id.clone(),
                liveness: w.liveness,
                last_heartbeat: w.last_heartbeat,
                missed_probes: w.missed_probes,
                shards: w.shards.iter().copied().collect(),
                registered_at: w.registered_at,
            })
            .collect()
    }

    pub fn shard_views(&self) -> Vec<ShardView> {
        self.shards
            .values()
            .map(|s| ShardView {
                shard_id: s.id,
                range: s.range.clone(),
                owner: s.owner.clone(),
                load: s.load,
            })
            .collect()
    }

    fn remember_eviction(&mut self, worker_id: &WorkerId) {
        if self.evicted.insert(worker_id.clone()) {
            self.evicted_order.push_back(worker_id.clone());
        }
        while self.evicted_order.len() > EVICTED_MEMORY {
            if let Some(oldest) = self.evicted_order.pop_front() {
                self.evicted.remove(&oldest);
            }
        }
    }

    fn insert_shard(&mut self, range: KeyRange, owner: Option<WorkerId>, load: u64) -> ShardId {
        let id = ShardId(self.next_shard_id);
        self.next_shard_id += 1;

        if let Some(node) = owner.as_ref().and_then(|o| self.workers.get_mut(o)) {
            node.shards.insert(id);
        }
        self.shard_starts.insert(id, range.start.clone());
        self.shards.insert(range.start.clone(), Shard { id, range, owner, load });
        id
    }

    fn remove_shard(&mut self, id: ShardId) -> Option<Shard> {
        let start = self.shard_starts.remove(&id)?;
        self.shards.remove(&start)
    }

    /// Closest alive owner other than `excluded`, scanning outward from
    /// `position`; the left neighbour wins ties.
    fn nearest_live_owner(&self, order: &[String], position: usize, excluded: &WorkerId) -> Option<WorkerId> {
        let eligible = |idx: usize| -> Option<WorkerId> {
            let owner = self.shards.get(&order[idx])?.owner.as_ref()?;
            (owner != excluded && self.workers.get(owner).is_some_and(WorkerNode::is_alive))
                .then(|| owner.clone())
        };

        for distance in 1..order.len() {
            if let Some(owner) = position.checked_sub(distance).and_then(eligible) {
                return Some(owner);
            }
            if let Some(owner) = Some(position + distance).filter(|&i| i < order.len()).and_then(eligible) {
                return Some(owner);
            }
        }

        // No shard has a live owner; a live worker without shards still qualifies
        self.workers
            .values()
            .find(|w| w.is_alive() && w.id != *excluded)
            .map(|w| w.id.clone())
    }
}

/// True if `parts` cover `whole` exactly, contiguous and in order
fn tiles(whole: &KeyRange, parts: &[KeyRange]) -> bool {
    let (Some(first), Some(last)) = (parts.first(), parts.last()) else {
        return false;
    };
    if first.start != whole.start || last.end != whole.end {
        return false;
    }
    let non_empty = parts
        .iter()
        .all(|r| r.end.as_deref().map_or(true, |end| r.start.as_str() < end));
    non_empty && parts.windows(2).all(|pair| pair[0].adjoins(&pair[1]))
}
