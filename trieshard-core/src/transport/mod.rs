//! Network edges of the manager
//!
//! Inbound RPCs arrive through the axum router in [`api`]; outbound worker
//! instructions leave through [`dispatch`] and the [`client`] it drives.

pub mod api;
pub mod client;
pub mod dispatch;

pub use api::{router, serve, AppState};
pub use client::{ClientConfig, HttpWorkerClient, WorkerClient};
pub use dispatch::CommandDispatcher;
