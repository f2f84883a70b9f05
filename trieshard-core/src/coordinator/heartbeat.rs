//! Worker liveness tracking
//!
//! Counts unanswered probes instead of comparing wall-clock gaps, so a
//! single slow ack never demotes a worker.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::registry::ClusterRegistry;
use crate::protocol::{HeartbeatAck, HeartbeatProbe, Liveness, WorkerCommand, WorkerId};

/// Configuration for the heartbeat monitor
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between probe rounds
    pub interval: Duration,
    /// Missed probes before a worker is suspected
    pub missed_threshold: u32,
    /// Further missed probes before a suspected worker is declared dead
    pub grace_intervals: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::DEFAULT_HEARTBEAT_INTERVAL_SECS),
            missed_threshold: 2,
            grace_intervals: 1,
        }
    }
}

impl HeartbeatConfig {
    /// Missed probes after which a worker is dead
    pub fn dead_after(&self) -> u32 {
        self.missed_threshold + self.grace_intervals.max(1)
    }
}

/// Liveness changes produced by one probe round
#[derive(Debug, Default)]
pub struct ProbeRound {
    pub probes: Vec<WorkerCommand>,
    pub suspected: Vec<WorkerId>,
    pub dead: Vec<WorkerId>,
}

/// What happened to an incoming ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Worker state advanced
    Applied,
    /// Same ack seen before; nothing changed
    Duplicate,
    /// Older than the newest ack already accepted; proves liveness but
    /// its timestamp and payload are dropped
    Stale,
    /// Worker was evicted; not treated as a re-registration
    Evicted,
    Unknown,
}

impl AckOutcome {
    /// True when the ack came from a current member
    pub fn is_accepted(self) -> bool {
        matches!(self, AckOutcome::Applied | AckOutcome::Duplicate)
    }
}

/// Heartbeat monitor; the only component that changes worker liveness
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Run one probe round
    ///
    /// A probe still outstanding from the previous round counts as a miss.
    /// Workers crossing the dead threshold are marked `Dead` but stay in the
    /// registry; eviction is the caller's job.
    pub fn probe_round(&self, registry: &mut ClusterRegistry, now_ms: i64) -> ProbeRound {
        let mut round = ProbeRound::default();
        let dead_after = self.config.dead_after();

        for node in registry.workers_mut() {
            if node.liveness == Liveness::Dead {
                continue;
            }

            if node.probe_outstanding {
                node.missed_probes += 1;
                debug!("Worker {} missed probe ({} in a row)", node.id, node.missed_probes);
            }

            if node.missed_probes >= dead_after {
                warn!("Worker {} declared dead after {} missed probes", node.id, node.missed_probes);
                node.liveness = Liveness::Dead;
                round.dead.push(node.id.clone());
                continue;
            }

            if node.missed_probes >= self.config.missed_threshold && node.liveness == Liveness::Alive {
                warn!("Worker {} marked as suspected", node.id);
                node.liveness = Liveness::Suspected;
                round.suspected.push(node.id.clone());
            }

            node.probe_outstanding = true;
            round
                .probes
                .push(WorkerCommand::Probe(node.id.clone(), HeartbeatProbe { sent_at: now_ms }));
        }

        round
    }

    /// Apply a heartbeat acknowledgment
    pub fn on_ack(&self, registry: &mut ClusterRegistry, ack: &HeartbeatAck) -> AckOutcome {
        let evicted = registry.is_evicted(&ack.worker_id);
        let Some(node) = registry.worker_mut(&ack.worker_id) else {
            if evicted {
                warn!("Discarding heartbeat ack from evicted worker {}", ack.worker_id);
                return AckOutcome::Evicted;
            }
            warn!("Discarding heartbeat ack from unknown worker {}", ack.worker_id);
            return AckOutcome::Unknown;
        };

        if node.liveness == Liveness::Dead {
            warn!("Discarding heartbeat ack from dead worker {}", ack.worker_id);
            return AckOutcome::Evicted;
        }
        let stale = node.last_heartbeat.is_some_and(|last| ack.timestamp < last);
        if stale {
            debug!("Stale heartbeat ack from {} at {}", ack.worker_id, ack.timestamp);
        }

        let before = (node.liveness, node.last_heartbeat, node.missed_probes, node.probe_outstanding);

        if node.liveness == Liveness::Suspected {
            info!("Worker {} recovered from suspected status", node.id);
        }
        node.liveness = Liveness::Alive;
        if !stale {
            node.last_heartbeat = Some(ack.timestamp);
        }
        node.missed_probes = 0;
        node.probe_outstanding = false;

        let after = (node.liveness, node.last_heartbeat, node.missed_probes, node.probe_outstanding);
        if stale {
            AckOutcome::Stale
        } else if before == after {
            AckOutcome::Duplicate
        } else {
            AckOutcome::Applied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (HeartbeatMonitor, ClusterRegistry, WorkerId) {
        let mut registry = ClusterRegistry::new();
        let id = WorkerId::from_address("w:1").unwrap();
        registry.register_worker(id.clone()).unwrap();
        (HeartbeatMonitor::new(HeartbeatConfig::default()), registry, id)
    }

    fn ack(id: &WorkerId, timestamp: i64) -> HeartbeatAck {
        HeartbeatAck {
            worker_id: id.clone(),
            timestamp,
            loads: Vec::new(),
        }
    }

    #[test]
    fn test_missed_probes_demote_then_kill() {
        let (monitor, mut registry, id) = setup();

        let round = monitor.probe_round(&mut registry, 0);
        assert_eq!(round.probes.len(), 1);

        monitor.probe_round(&mut registry, 1);
        assert_eq!(registry.worker(&id).unwrap().liveness, Liveness::Alive);

        let round = monitor.probe_round(&mut registry, 2);
        assert_eq!(round.suspected, vec![id.clone()]);

        let round = monitor.probe_round(&mut registry, 3);
        assert_eq!(round.dead, vec![id.clone()]);
        assert!(round.probes.is_empty());
    }

    #[test]
    fn test_ack_resets_miss_counter() {
        let (monitor, mut registry, id) = setup();

        for t in 0..3 {
            monitor.probe_round(&mut registry, t);
        }
        assert_eq!(registry.worker(&id).unwrap().liveness, Liveness::Suspected);

        assert_eq!(monitor.on_ack(&mut registry, &ack(&id, 10)), AckOutcome::Applied);
        let node = registry.worker(&id).unwrap();
        assert_eq!(node.liveness, Liveness::Alive);
        assert_eq!(node.missed_probes, 0);
    }

    #[test]
    fn test_duplicate_ack_is_noop() {
        let (monitor, mut registry, id) = setup();
        monitor.probe_round(&mut registry, 0);

        assert_eq!(monitor.on_ack(&mut registry, &ack(&id, 5)), AckOutcome::Applied);
        let first = registry.worker(&id).unwrap().clone();
        assert_eq!(monitor.on_ack(&mut registry, &ack(&id, 5)), AckOutcome::Duplicate);
        assert_eq!(registry.worker(&id).unwrap(), &first);
    }

    #[test]
    fn test_stale_and_unknown_acks() {
        let (monitor, mut registry, id) = setup();
        monitor.on_ack(&mut registry, &ack(&id, 50));
        assert_eq!(monitor.on_ack(&mut registry, &ack(&id, 40)), AckOutcome::Stale);

        let stranger = WorkerId::from_address("x:9").unwrap();
        assert_eq!(monitor.on_ack(&mut registry, &ack(&stranger, 1)), AckOutcome::Unknown);

        registry.evict(&id);
        assert_eq!(monitor.on_ack(&mut registry, &ack(&id, 60)), AckOutcome::Evicted);
        assert!(registry.worker(&id).is_none());
    }

    #[test]
    fn test_stale_ack_still_proves_liveness() {
        let (monitor, mut registry, id) = setup();
        monitor.probe_round(&mut registry, 0);
        monitor.on_ack(&mut registry, &ack(&id, 50));

        // The worker's clock stepped back; it keeps answering with older times
        for t in 1..10 {
            monitor.probe_round(&mut registry, t);
            assert_eq!(monitor.on_ack(&mut registry, &ack(&id, 40)), AckOutcome::Stale);
        }

        let node = registry.worker(&id).unwrap();
        assert_eq!(node.liveness, Liveness::Alive);
        assert_eq!(node.missed_probes, 0);
        assert_eq!(node.last_heartbeat, Some(50));
    }
}
