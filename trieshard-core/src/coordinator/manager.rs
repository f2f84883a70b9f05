//! Manager event loop
//!
//! The manager exclusively owns the registry, heartbeat monitor and split
//! coordinator. One task drains the typed event channels and applies a
//! single event at a time, so no lock ever guards cluster state.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::events::{self, Event, EventReceivers, ManagerHandle, QueryEvent};
use super::heartbeat::{HeartbeatConfig, HeartbeatMonitor};
use super::registry::{ClusterRegistry, Registration};
use super::split::{AckResolution, SplitConfig, SplitCoordinator};
use crate::error::Result;
use crate::metrics::standard;
use crate::protocol::{
    AdoptRange, ClusterSnapshot, HeartbeatAck, OperationId, RegisterWorkerResponse, ShardSelector,
    SplitStatus, SplitTrieRequest, SplitTrieRequestAck, SplitTrieResponse, SplitWordResponse,
    WorkerCommand, WorkerId,
};
use crate::shutdown::ShutdownSignal;

/// Sleep target used when no split deadline is pending
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// Configuration for the manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Port the RPC surface listens on
    pub port: u16,
    pub heartbeat: HeartbeatConfig,
    pub split: SplitConfig,
    /// Capacity of each inbound event channel
    pub channel_capacity: usize,
    /// Per-request timeout for instructions sent to workers
    pub rpc_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_MANAGER_PORT,
            heartbeat: HeartbeatConfig::default(),
            split: SplitConfig::default(),
            channel_capacity: 1024,
            rpc_timeout: Duration::from_secs(2),
        }
    }
}

/// Authoritative cluster state and the logic that mutates it
pub struct Manager {
    registry: ClusterRegistry,
    monitor: HeartbeatMonitor,
    splits: SplitCoordinator,
    /// Worker instructions produced since the last drain
    outbox: Vec<WorkerCommand>,
}

impl Manager {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            registry: ClusterRegistry::new(),
            monitor: HeartbeatMonitor::new(config.heartbeat.clone()),
            splits: SplitCoordinator::new(config.split.clone()),
            outbox: Vec::new(),
        }
    }

    /// Start the event loop on its own task
    ///
    /// Returns the handle RPC handlers use, the stream of worker commands
    /// for the dispatcher, and the loop's join handle.
    pub fn spawn(
        config: &ManagerConfig,
        shutdown: &ShutdownSignal,
    ) -> (ManagerHandle, mpsc::UnboundedReceiver<WorkerCommand>, JoinHandle<()>) {
        let (handle, receivers) = events::channels(config.channel_capacity);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let manager = Manager::new(config);
        let probe_interval = config.heartbeat.interval;
        let shutdown = shutdown.subscribe();

        let task = tokio::spawn(manager.run(receivers, probe_interval, commands_tx, shutdown));
        (handle, commands_rx, task)
    }

    /// Process events until shutdown
    pub async fn run(
        mut self,
        mut rx: EventReceivers,
        probe_interval: Duration,
        commands: mpsc::UnboundedSender<WorkerCommand>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval(probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Manager event loop started");

        loop {
            let deadline = self.splits.next_deadline();
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);

            let event = tokio::select! {
                _ = shutdown.recv() => break,
                Some(event) = rx.register.recv() => Event::Register(event),
                Some(ack) = rx.heartbeat_ack.recv() => Event::HeartbeatAck(ack),
                Some(event) = rx.split_request.recv() => Event::SplitRequest(event),
                Some(event) = rx.split_word.recv() => Event::SplitWord(event),
                Some(ack) = rx.split_ack.recv() => Event::SplitAck(ack),
                Some(query) = rx.query.recv() => Event::Query(query),
                _ = ticker.tick() => Event::HeartbeatTick,
                _ = sleep_until(wake_at), if deadline.is_some() => Event::SplitDeadline,
            };

            self.handle(event);

            for command in self.drain_commands() {
                if commands.send(command).is_err() {
                    warn!("Command dispatcher is gone; dropping worker instructions");
                    break;
                }
            }
        }

        info!("Manager event loop stopped");
    }

    /// Apply one event and record it
    pub fn handle(&mut self, event: Event) {
        standard::EVENT_DURATION.time(|| self.apply(event));
        standard::EVENTS_PROCESSED.inc();
        self.update_gauges();
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::Register(event) => {
                let _ = event.reply.send(self.register_worker(&event.address));
            }
            Event::HeartbeatAck(ack) => self.heartbeat_ack(&ack, Instant::now()),
            Event::SplitRequest(event) => {
                let _ = event.reply.send(self.request_split(&event.request, Instant::now()));
            }
            Event::SplitWord(event) => {
                let _ = event.reply.send(self.route_word(&event.word));
            }
            Event::SplitAck(ack) => {
                self.split_ack(&ack, Instant::now());
            }
            Event::Query(QueryEvent::Snapshot(reply)) => {
                let _ = reply.send(self.snapshot());
            }
            Event::Query(QueryEvent::SplitStatus(id, reply)) => {
                let _ = reply.send(self.split_status(id));
            }
            Event::HeartbeatTick => self.heartbeat_tick(Utc::now().timestamp_millis()),
            Event::SplitDeadline => self.expire_splits(Instant::now()),
        }
    }

    /// Admit a worker; the first one receives the whole key space
    pub fn register_worker(&mut self, address: &str) -> Result<RegisterWorkerResponse> {
        let worker_id = WorkerId::from_address(address)?;
        let registration = self.registry.register_worker(worker_id.clone())?;

        if registration == Registration::New && self.registry.shard_count() == 0 {
            self.registry.assign_initial_shard(&worker_id)?;
        } else {
            self.registry.adopt_orphans(&worker_id);
        }

        let assigned = self
            .registry
            .shards()
            .filter(|s| s.owner.as_ref() == Some(&worker_id))
            .map(|s| s.range.clone())
            .collect();

        Ok(RegisterWorkerResponse { worker_id, assigned })
    }

    /// Apply a heartbeat ack and any load it reports
    pub fn heartbeat_ack(&mut self, ack: &HeartbeatAck, now: Instant) {
        let was_alive = self.registry.worker(&ack.worker_id).is_some_and(|w| w.is_alive());
        let outcome = self.monitor.on_ack(&mut self.registry, ack);
        if !was_alive && self.registry.worker(&ack.worker_id).is_some_and(|w| w.is_alive()) {
            self.hand_orphans_to(&ack.worker_id);
        }
        if !outcome.is_accepted() {
            return;
        }

        let threshold = self.splits.config().load_threshold;
        for load in &ack.loads {
            let Some(shard_id) = self.registry.record_load(&ack.worker_id, &load.range, load.words) else {
                continue;
            };
            if load.words <= threshold || self.splits.is_splitting(shard_id) {
                continue;
            }

            match self
                .splits
                .propose(&self.registry, &ShardSelector::Id(shard_id), None, now, &mut self.outbox)
            {
                Ok(op) => info!("{} holds {} words, started {}", shard_id, load.words, op),
                Err(e) => debug!("Load-driven split of {} not started: {}", shard_id, e),
            }
        }
    }

    /// Validate and launch a split; does not wait for it to finish
    pub fn request_split(&mut self, request: &SplitTrieRequest, now: Instant) -> Result<SplitTrieResponse> {
        let operation_id = self.splits.propose(
            &self.registry,
            &request.shard,
            request.split_point.as_deref(),
            now,
            &mut self.outbox,
        )?;
        Ok(SplitTrieResponse { operation_id })
    }

    /// Owner of the shard holding `word`
    pub fn route_word(&self, word: &str) -> Result<SplitWordResponse> {
        let (shard, owner) = self.registry.lookup_owner(word)?;
        Ok(SplitWordResponse {
            worker_id: owner.id.clone(),
            shard_id: shard.id,
            range: shard.range.clone(),
        })
    }

    pub fn split_ack(&mut self, ack: &SplitTrieRequestAck, now: Instant) -> AckResolution {
        let resolution = self.splits.on_ack(&mut self.registry, ack, now, &mut self.outbox);
        match &resolution {
            AckResolution::Committed(_) => standard::SPLITS_COMMITTED.inc(),
            AckResolution::Failed(_) => standard::SPLITS_FAILED.inc(),
            AckResolution::Pending | AckResolution::Ignored => {}
        }
        resolution
    }

    /// One heartbeat round: probe everyone, evict the dead
    pub fn heartbeat_tick(&mut self, now_ms: i64) {
        let round = self.monitor.probe_round(&mut self.registry, now_ms);
        self.outbox.extend(round.probes);

        for worker in round.dead {
            self.evict(&worker);
        }
    }

    /// Fail splits whose deadline has passed
    pub fn expire_splits(&mut self, now: Instant) {
        for timeout in self.splits.expire(now, &mut self.outbox) {
            error!("{}", timeout);
            standard::SPLITS_FAILED.inc();
        }
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            workers: self.registry.worker_views(),
            shards: self.registry.shard_views(),
            active_splits: self.splits.active_statuses(),
            taken_at: Utc::now(),
        }
    }

    pub fn split_status(&self, id: OperationId) -> Option<SplitStatus> {
        self.splits.status(id)
    }

    /// Take the worker instructions produced so far
    pub fn drain_commands(&mut self) -> Vec<WorkerCommand> {
        std::mem::take(&mut self.outbox)
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    pub fn splits(&self) -> &SplitCoordinator {
        &self.splits
    }

    fn evict(&mut self, worker: &WorkerId) {
        let failed = self.splits.fail_involving(worker, &mut self.outbox);
        standard::SPLITS_FAILED.inc_by(failed.len() as u64);

        for moved in self.registry.evict(worker) {
            if let Some(owner) = moved.new_owner {
                self.outbox.push(WorkerCommand::Adopt(
                    owner,
                    AdoptRange {
                        shard_id: moved.shard_id,
                        range: moved.range,
                        previous_owner: Some(moved.previous_owner),
                    },
                ));
            }
        }
        self.outbox.push(WorkerCommand::Release(worker.clone()));

        standard::WORKERS_EVICTED.inc();
        if let Err(e) = self.registry.check_partition() {
            error!("Partition broken after evicting {}: {}", worker, e);
        }
    }

    /// Give every orphaned shard to a worker that has just come back alive
    fn hand_orphans_to(&mut self, worker: &WorkerId) {
        for (shard_id, range) in self.registry.adopt_orphans(worker) {
            self.outbox.push(WorkerCommand::Adopt(
                worker.clone(),
                AdoptRange {
                    shard_id,
                    range,
                    previous_owner: None,
                },
            ));
        }
    }

    fn update_gauges(&self) {
        standard::ALIVE_WORKERS.set(self.registry.alive_count() as i64);
        standard::SHARDS.set(self.registry.shard_count() as i64);
        standard::ACTIVE_SPLITS.set(self.splits.active_count() as i64);
    }
}
