//! Trieshard Core - manager for a distributed trie index
//!
//! This crate provides the manager process that:
//! - Registers workers and tracks their liveness by heartbeat
//! - Keeps the trie's key space partitioned into shards
//! - Coordinates shard splits across workers
//! - Routes words to the worker owning them

pub mod coordinator;
pub mod error;
pub mod keyspace;
pub mod metrics;
pub mod protocol;
pub mod shutdown;
pub mod transport;

pub use error::ManagerError;
pub use keyspace::KeyRange;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for the manager's RPC surface
pub const DEFAULT_MANAGER_PORT: u16 = 3000;

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Default time a split may wait for acknowledgments, in seconds
pub const DEFAULT_SPLIT_ACK_DEADLINE_SECS: u64 = 30;
