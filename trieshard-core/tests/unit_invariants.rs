//! Property tests for cluster-wide invariants
//!
//! Random sequences of registrations, splits, acks, heartbeat rounds and
//! deadline expiries are applied to a manager; after every step the
//! partition, split exclusivity, atomicity and eviction guarantees must hold.

use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use trieshard_core::coordinator::{AckResolution, Manager, ManagerConfig};
use trieshard_core::protocol::{
    HeartbeatAck, ShardSelector, SplitAckStatus, SplitTrieRequest, SplitTrieRequestAck, WorkerId,
};
use trieshard_core::ManagerError;

const WORKERS: usize = 5;
const WORDS: &[&str] = &["", "apple", "fig", "kiwi", "mango", "pear", "quince", "tomato", "zebra", "zz"];

#[derive(Debug, Clone)]
enum Step {
    Register(usize),
    Split(usize),
    Ack { pick: usize, from_target: bool, ok: bool },
    /// Heartbeat round; bit `i` set means worker `i` answers its probe
    Tick(u8),
    /// Same heartbeat ack delivered twice
    DoubleAck(usize),
    Expire,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        2 => (0..WORKERS).prop_map(Step::Register),
        3 => (0..WORDS.len()).prop_map(Step::Split),
        4 => (any::<usize>(), any::<bool>(), prop::bool::weighted(0.85))
            .prop_map(|(pick, from_target, ok)| Step::Ack { pick, from_target, ok }),
        2 => any::<u8>().prop_map(Step::Tick),
        1 => (0..WORKERS).prop_map(Step::DoubleAck),
        1 => Just(Step::Expire),
    ]
}

fn address(i: usize) -> String {
    format!("w{}:7000", i)
}

fn worker(i: usize) -> WorkerId {
    WorkerId::from_address(&address(i)).unwrap()
}

struct Harness {
    manager: Manager,
    now: Instant,
    clock: i64,
}

impl Harness {
    fn new() -> Self {
        Self {
            manager: Manager::new(&ManagerConfig::default()),
            now: Instant::now(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn apply(&mut self, step: &Step) {
        match step {
            Step::Register(i) => {
                let _ = self.manager.register_worker(&address(*i));
            }
            Step::Split(w) => {
                let request = SplitTrieRequest {
                    shard: ShardSelector::Containing(WORDS[*w].into()),
                    split_point: None,
                };
                let _ = self.manager.request_split(&request, self.now);
            }
            Step::Ack { pick, from_target, ok } => self.ack_split(*pick, *from_target, *ok),
            Step::Tick(mask) => self.heartbeat_round(*mask),
            Step::DoubleAck(i) => self.double_ack(*i),
            Step::Expire => {
                self.now += Duration::from_secs(31);
                let before = self.manager.registry().shard_views();
                self.manager.expire_splits(self.now);
                assert_eq!(self.manager.registry().shard_views(), before, "expiry touched the registry");
            }
        }
        self.manager.drain_commands();
    }

    fn ack_split(&mut self, pick: usize, from_target: bool, ok: bool) {
        let active = self.manager.snapshot().active_splits;
        if active.is_empty() {
            return;
        }
        let status = &active[pick % active.len()];
        let ack = SplitTrieRequestAck {
            operation_id: status.operation_id,
            worker_id: if from_target { status.target.clone() } else { status.source.clone() },
            status: if ok { SplitAckStatus::Ok } else { SplitAckStatus::Rejected },
        };

        let before = self.manager.registry().shard_views();
        let resolution = self.manager.split_ack(&ack, self.now);
        if let AckResolution::Failed(reason) = resolution {
            assert_eq!(
                self.manager.registry().shard_views(),
                before,
                "failed split ({}) changed shard ownership",
                reason
            );
        }
    }

    fn heartbeat_round(&mut self, mask: u8) {
        let owned_before: BTreeMap<String, Option<WorkerId>> = self
            .manager
            .registry()
            .shards()
            .map(|s| (s.range.start.clone(), s.owner.clone()))
            .collect();
        let known_before: HashSet<WorkerId> = self.manager.registry().workers().map(|w| w.id.clone()).collect();

        let now_ms = self.tick();
        self.manager.heartbeat_tick(now_ms);

        let registry = self.manager.registry();
        let evicted: Vec<&WorkerId> = known_before.iter().filter(|id| registry.worker(id).is_none()).collect();
        for gone in evicted {
            for (start, owner) in &owned_before {
                if owner.as_ref() != Some(gone) {
                    continue;
                }
                let shard = registry.shards().find(|s| &s.range.start == start).unwrap();
                match &shard.owner {
                    Some(new_owner) => assert!(
                        registry.worker(new_owner).is_some_and(|w| w.is_alive()),
                        "shard of evicted {} went to non-alive {}",
                        gone,
                        new_owner
                    ),
                    None => assert_eq!(registry.alive_count(), 0, "shard orphaned while workers are alive"),
                }
            }
        }

        for i in 0..WORKERS {
            if mask & (1 << i) != 0 {
                let ack = HeartbeatAck {
                    worker_id: worker(i),
                    timestamp: self.tick(),
                    loads: Vec::new(),
                };
                self.manager.heartbeat_ack(&ack, self.now);
            }
        }
    }

    fn double_ack(&mut self, i: usize) {
        let ack = HeartbeatAck {
            worker_id: worker(i),
            timestamp: self.tick(),
            loads: Vec::new(),
        };
        self.manager.heartbeat_ack(&ack, self.now);
        let once = self.manager.snapshot();
        self.manager.heartbeat_ack(&ack, self.now);
        let twice = self.manager.snapshot();

        assert_eq!(once.workers, twice.workers, "repeated ack changed worker state");
        assert_eq!(once.shards, twice.shards, "repeated ack changed shards");
        assert_eq!(once.active_splits, twice.active_splits);
    }

    fn check_invariants(&self) {
        let registry = self.manager.registry();
        if registry.shard_count() == 0 {
            return;
        }

        registry.check_partition().unwrap();

        for word in WORDS {
            match self.manager.route_word(word) {
                Ok(_) | Err(ManagerError::Unavailable { .. }) => {}
                Err(e) => panic!("routing {:?} failed: {}", word, e),
            }
        }

        for shard in registry.shards() {
            if let Some(owner) = &shard.owner {
                let node = registry.worker(owner).expect("owner must be registered");
                assert!(node.shards.contains(&shard.id));
            }
        }

        let active = self.manager.snapshot().active_splits;
        let distinct: HashSet<_> = active.iter().map(|s| s.shard_id).collect();
        assert_eq!(distinct.len(), active.len(), "two splits active on one shard");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_cluster_invariants_hold(steps in prop::collection::vec(step(), 1..120)) {
        let mut harness = Harness::new();
        for step in &steps {
            harness.apply(step);
            harness.check_invariants();
        }
    }
}

#[test]
fn test_long_deterministic_run() {
    let mut harness = Harness::new();
    for i in 0..WORKERS {
        harness.apply(&Step::Register(i));
    }

    // Split everything several times, acking from both sides
    for round in 0..4 {
        for w in 0..WORDS.len() {
            harness.apply(&Step::Split(w));
        }
        for pick in 0..16 {
            harness.apply(&Step::Ack { pick, from_target: false, ok: true });
            harness.apply(&Step::Ack { pick, from_target: true, ok: true });
        }
        harness.apply(&Step::Tick(0b11111 >> round));
        harness.check_invariants();
    }

    assert!(harness.manager.registry().shard_count() > 1);
}
