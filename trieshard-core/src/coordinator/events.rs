//! Typed inbound event channels
//!
//! RPC handlers never see the registry. They push one event per request
//! into the channel for its kind and, when the caller needs an answer, wait
//! on a oneshot reply filled in by the event loop.

use tokio::sync::{mpsc, oneshot};

use crate::error::{ManagerError, Result};
use crate::protocol::{
    ClusterSnapshot, HeartbeatAck, OperationId, RegisterWorkerResponse, SplitStatus, SplitTrieRequest,
    SplitTrieRequestAck, SplitTrieResponse, SplitWordResponse,
};

/// Worker joining the cluster
#[derive(Debug)]
pub struct RegisterEvent {
    pub address: String,
    pub reply: oneshot::Sender<Result<RegisterWorkerResponse>>,
}

/// Administrative or load-triggered split request
#[derive(Debug)]
pub struct SplitRequestEvent {
    pub request: SplitTrieRequest,
    pub reply: oneshot::Sender<Result<SplitTrieResponse>>,
}

/// Which worker owns this word?
#[derive(Debug)]
pub struct SplitWordEvent {
    pub word: String,
    pub reply: oneshot::Sender<Result<SplitWordResponse>>,
}

/// Read-only queries answered from the loop's current state
#[derive(Debug)]
pub enum QueryEvent {
    Snapshot(oneshot::Sender<ClusterSnapshot>),
    SplitStatus(OperationId, oneshot::Sender<Option<SplitStatus>>),
}

/// Anything the event loop can apply
#[derive(Debug)]
pub enum Event {
    Register(RegisterEvent),
    HeartbeatAck(HeartbeatAck),
    SplitRequest(SplitRequestEvent),
    SplitWord(SplitWordEvent),
    SplitAck(SplitTrieRequestAck),
    Query(QueryEvent),
    /// Heartbeat interval elapsed
    HeartbeatTick,
    /// The earliest split deadline passed
    SplitDeadline,
}

/// Receiving ends, owned by the event loop
#[derive(Debug)]
pub struct EventReceivers {
    pub register: mpsc::Receiver<RegisterEvent>,
    pub heartbeat_ack: mpsc::Receiver<HeartbeatAck>,
    pub split_request: mpsc::Receiver<SplitRequestEvent>,
    pub split_word: mpsc::Receiver<SplitWordEvent>,
    pub split_ack: mpsc::Receiver<SplitTrieRequestAck>,
    pub query: mpsc::Receiver<QueryEvent>,
}

/// Cloneable sending side used by RPC handlers
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    register: mpsc::Sender<RegisterEvent>,
    heartbeat_ack: mpsc::Sender<HeartbeatAck>,
    split_request: mpsc::Sender<SplitRequestEvent>,
    split_word: mpsc::Sender<SplitWordEvent>,
    split_ack: mpsc::Sender<SplitTrieRequestAck>,
    query: mpsc::Sender<QueryEvent>,
}

/// Create one bounded channel per event kind
pub fn channels(capacity: usize) -> (ManagerHandle, EventReceivers) {
    let capacity = capacity.max(1);
    let (register_tx, register_rx) = mpsc::channel(capacity);
    let (heartbeat_tx, heartbeat_rx) = mpsc::channel(capacity);
    let (split_request_tx, split_request_rx) = mpsc::channel(capacity);
    let (split_word_tx, split_word_rx) = mpsc::channel(capacity);
    let (split_ack_tx, split_ack_rx) = mpsc::channel(capacity);
    let (query_tx, query_rx) = mpsc::channel(capacity);

    let handle = ManagerHandle {
        register: register_tx,
        heartbeat_ack: heartbeat_tx,
        split_request: split_request_tx,
        split_word: split_word_tx,
        split_ack: split_ack_tx,
        query: query_tx,
    };
    let receivers = EventReceivers {
        register: register_rx,
        heartbeat_ack: heartbeat_rx,
        split_request: split_request_rx,
        split_word: split_word_rx,
        split_ack: split_ack_rx,
        query: query_rx,
    };
    (handle, receivers)
}

impl ManagerHandle {
    /// Register a worker and wait for the loop's verdict
    pub async fn register_worker(&self, address: impl Into<String>) -> Result<RegisterWorkerResponse> {
        let (reply, rx) = oneshot::channel();
        let event = RegisterEvent {
            address: address.into(),
            reply,
        };
        self.register.send(event).await.map_err(|_| ManagerError::ShutdownInProgress)?;
        rx.await.map_err(|_| ManagerError::ShutdownInProgress)?
    }

    /// Enqueue a heartbeat ack; processing failures are only logged
    pub async fn heartbeat_ack(&self, ack: HeartbeatAck) -> Result<()> {
        self.heartbeat_ack.send(ack).await.map_err(|_| ManagerError::ShutdownInProgress)
    }

    /// Start a split; returns once the operation is accepted, not completed
    pub async fn request_split(&self, request: SplitTrieRequest) -> Result<SplitTrieResponse> {
        let (reply, rx) = oneshot::channel();
        self.split_request
            .send(SplitRequestEvent { request, reply })
            .await
            .map_err(|_| ManagerError::ShutdownInProgress)?;
        rx.await.map_err(|_| ManagerError::ShutdownInProgress)?
    }

    /// Resolve the worker owning `word` under the latest committed partition
    pub async fn route_word(&self, word: impl Into<String>) -> Result<SplitWordResponse> {
        let (reply, rx) = oneshot::channel();
        let event = SplitWordEvent {
            word: word.into(),
            reply,
        };
        self.split_word.send(event).await.map_err(|_| ManagerError::ShutdownInProgress)?;
        rx.await.map_err(|_| ManagerError::ShutdownInProgress)?
    }

    pub async fn split_ack(&self, ack: SplitTrieRequestAck) -> Result<()> {
        self.split_ack.send(ack).await.map_err(|_| ManagerError::ShutdownInProgress)
    }

    pub async fn snapshot(&self) -> Result<ClusterSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.query
            .send(QueryEvent::Snapshot(reply))
            .await
            .map_err(|_| ManagerError::ShutdownInProgress)?;
        rx.await.map_err(|_| ManagerError::ShutdownInProgress)
    }

    pub async fn split_status(&self, operation_id: OperationId) -> Result<Option<SplitStatus>> {
        let (reply, rx) = oneshot::channel();
        self.query
            .send(QueryEvent::SplitStatus(operation_id, reply))
            .await
            .map_err(|_| ManagerError::ShutdownInProgress)?;
        rx.await.map_err(|_| ManagerError::ShutdownInProgress)
    }
}
