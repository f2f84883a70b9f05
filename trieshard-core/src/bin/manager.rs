//! Manager service binary

use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trieshard_core::coordinator::{HeartbeatConfig, Manager, ManagerConfig, SplitConfig, TargetStrategy};
use trieshard_core::shutdown::ShutdownSignal;
use trieshard_core::transport::{self, ClientConfig, CommandDispatcher, HttpWorkerClient};

/// Coordinates trie shards across index workers
#[derive(Parser, Debug, Clone)]
#[command(name = "trieshard-manager", version, about)]
struct Args {
    /// Port for the RPC surface
    #[arg(long, env = "TRIESHARD_MANAGER_PORT", default_value_t = trieshard_core::DEFAULT_MANAGER_PORT)]
    manager_port: u16,

    /// Seconds between heartbeat probes
    #[arg(long, env = "TRIESHARD_HEARTBEAT_INTERVAL", default_value_t = trieshard_core::DEFAULT_HEARTBEAT_INTERVAL_SECS, value_name = "SECS")]
    heartbeat_interval: u64,

    /// Missed probes before a worker is suspected
    #[arg(long, env = "TRIESHARD_MISSED_THRESHOLD", default_value = "2", value_name = "NUM")]
    missed_threshold: u32,

    /// Further missed probes before a suspected worker is evicted
    #[arg(long, env = "TRIESHARD_GRACE_INTERVALS", default_value = "1", value_name = "NUM")]
    grace_intervals: u32,

    /// Word count that triggers an automatic split
    #[arg(long, env = "TRIESHARD_SPLIT_LOAD_THRESHOLD", default_value = "100000", value_name = "WORDS")]
    split_load_threshold: u64,

    /// Seconds a split may wait for acknowledgments
    #[arg(long, env = "TRIESHARD_SPLIT_ACK_DEADLINE", default_value_t = trieshard_core::DEFAULT_SPLIT_ACK_DEADLINE_SECS, value_name = "SECS")]
    split_ack_deadline: u64,

    /// How the worker receiving the upper half of a split is chosen
    #[arg(long, env = "TRIESHARD_TARGET_STRATEGY", value_enum, default_value_t = Strategy::LeastLoaded)]
    target_strategy: Strategy,

    /// Capacity of each inbound event channel
    #[arg(long, env = "TRIESHARD_CHANNEL_CAPACITY", default_value = "1024", value_name = "NUM")]
    channel_capacity: usize,

    /// Milliseconds allowed for each instruction sent to a worker
    #[arg(long, env = "TRIESHARD_RPC_TIMEOUT_MS", default_value = "2000", value_name = "MS")]
    rpc_timeout_ms: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    LeastLoaded,
    SameWorker,
}

impl From<Strategy> for TargetStrategy {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::LeastLoaded => TargetStrategy::LeastLoaded,
            Strategy::SameWorker => TargetStrategy::SameWorker,
        }
    }
}

impl Args {
    fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            port: self.manager_port,
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(self.heartbeat_interval.max(1)),
                missed_threshold: self.missed_threshold.max(1),
                grace_intervals: self.grace_intervals,
            },
            split: SplitConfig {
                ack_deadline: Duration::from_secs(self.split_ack_deadline),
                load_threshold: self.split_load_threshold,
                strategy: self.target_strategy.into(),
                ..Default::default()
            },
            channel_capacity: self.channel_capacity,
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.manager_config();

    info!(
        "Starting trieshard manager (protocol v{}, heartbeat {:?}, ack deadline {:?}, strategy {:?})",
        trieshard_core::PROTOCOL_VERSION,
        config.heartbeat.interval,
        config.split.ack_deadline,
        config.split.strategy
    );

    let client = HttpWorkerClient::new(ClientConfig {
        connect_timeout: config.rpc_timeout.min(ClientConfig::default().connect_timeout),
        request_timeout: config.rpc_timeout,
    })?;

    let signal = ShutdownSignal::new();
    let (handle, commands, event_loop) = Manager::spawn(&config, &signal);

    let dispatcher = CommandDispatcher::new(Arc::new(client), handle.clone());
    let dispatch_task = tokio::spawn(dispatcher.run(commands, signal.subscribe()));

    let ctrl_c = signal.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => warn!("Failed to listen for ctrl-c: {}", e),
        }
        ctrl_c.shutdown();
    });

    let listener = match TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind port {}: {}", config.port, e);
            signal.shutdown();
            return Err(e.into());
        }
    };

    if let Err(e) = transport::serve(listener, handle, signal.clone()).await {
        error!("RPC server error: {}", e);
    }

    signal.shutdown();
    let _ = event_loop.await;
    let _ = dispatch_task.await;
    info!("Manager stopped");
    Ok(())
}
