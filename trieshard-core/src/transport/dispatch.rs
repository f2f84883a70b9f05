//! Worker command dispatch
//!
//! Commands leave the event loop on one channel and fan out into a queue
//! per worker, so instructions to the same worker keep their order while a
//! slow worker cannot hold up the rest.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::client::WorkerClient;
use crate::coordinator::ManagerHandle;
use crate::protocol::{SplitAckStatus, SplitTrieRequestAck, WorkerCommand, WorkerId};

/// Routes worker commands into per-worker delivery queues
pub struct CommandDispatcher {
    client: Arc<dyn WorkerClient>,
    handle: ManagerHandle,
    queues: HashMap<WorkerId, mpsc::UnboundedSender<WorkerCommand>>,
}

impl CommandDispatcher {
    pub fn new(client: Arc<dyn WorkerClient>, handle: ManagerHandle) -> Self {
        Self {
            client,
            handle,
            queues: HashMap::new(),
        }
    }

    /// Forward commands until the stream ends or shutdown fires
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Command dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                command = commands.recv() => match command {
                    Some(command) => self.route(command),
                    None => break,
                },
            }
        }
        info!("Command dispatcher stopped after serving {} workers", self.queues.len());
    }

    fn route(&mut self, command: WorkerCommand) {
        if let WorkerCommand::Release(worker) = &command {
            // Dropping the sender lets the queue task finish what it holds and exit
            if self.queues.remove(worker).is_some() {
                debug!("Closing command queue for {}", worker);
            }
            return;
        }
        let worker = command.worker().clone();

        let command = match self.queues.get(&worker) {
            Some(queue) => match queue.send(command) {
                Ok(()) => return,
                Err(mpsc::error::SendError(command)) => command,
            },
            None => command,
        };

        let queue = self.spawn_queue(&worker);
        let _ = queue.send(command);
        self.queues.insert(worker, queue);
    }

    fn spawn_queue(&self, worker: &WorkerId) -> mpsc::UnboundedSender<WorkerCommand> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let handle = self.handle.clone();
        debug!("Opening command queue for {}", worker);

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                deliver(client.as_ref(), &handle, command).await;
            }
        });
        tx
    }
}

/// Send one command; undeliverable split steps are reported as rejections
pub async fn deliver(client: &dyn WorkerClient, handle: &ManagerHandle, command: WorkerCommand) {
    let result = match &command {
        WorkerCommand::Probe(worker, probe) => client.probe(worker, probe).await,
        WorkerCommand::Split(worker, instruction) => client.split(worker, instruction).await,
        WorkerCommand::Assign(worker, assignment) => client.assign(worker, assignment).await,
        WorkerCommand::Abort(worker, abort) => client.abort(worker, abort).await,
        WorkerCommand::Adopt(worker, adopt) => client.adopt(worker, adopt).await,
        WorkerCommand::Release(_) => Ok(()),
    };
    let Err(e) = result else {
        return;
    };

    let worker = command.worker();
    match &command {
        WorkerCommand::Probe(..) => debug!("Probe to {} failed: {}", worker, e),
        WorkerCommand::Split(..) | WorkerCommand::Assign(..) => {
            warn!("Split step for {} undeliverable: {}", worker, e);
            if let Some(operation_id) = command.operation_id() {
                let ack = SplitTrieRequestAck {
                    operation_id,
                    worker_id: worker.clone(),
                    status: SplitAckStatus::Rejected,
                };
                if handle.split_ack(ack).await.is_err() {
                    debug!("Manager stopped before rejection of {} was recorded", operation_id);
                }
            }
        }
        WorkerCommand::Abort(_, abort) => error!(
            "Worker {} may still hold the uncommitted partition of {} from {}: {}",
            worker, abort.range, abort.operation_id, e
        ),
        WorkerCommand::Adopt(_, adopt) => error!(
            "Worker {} was not told to adopt {} {}: {}",
            worker, adopt.shard_id, adopt.range, e
        ),
        WorkerCommand::Release(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::channels;
    use crate::error::{ManagerError, Result};
    use crate::keyspace::KeyRange;
    use crate::protocol::{AbortSplit, AdoptRange, AssignRange, HeartbeatProbe, OperationId, SplitInstruction};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call; fails the ones addressed to `down`
    #[derive(Default)]
    struct RecordingClient {
        calls: Mutex<Vec<(String, &'static str)>>,
        down: Option<WorkerId>,
    }

    impl RecordingClient {
        fn record(&self, worker: &WorkerId, kind: &'static str) -> Result<()> {
            self.calls.lock().unwrap().push((worker.to_string(), kind));
            if self.down.as_ref() == Some(worker) {
                return Err(ManagerError::ConnectionFailed {
                    endpoint: worker.to_string(),
                    reason: "refused".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl WorkerClient for RecordingClient {
        async fn probe(&self, worker: &WorkerId, _: &HeartbeatProbe) -> Result<()> {
            self.record(worker, "probe")
        }
        async fn split(&self, worker: &WorkerId, _: &SplitInstruction) -> Result<()> {
            self.record(worker, "split")
        }
        async fn assign(&self, worker: &WorkerId, _: &AssignRange) -> Result<()> {
            self.record(worker, "assign")
        }
        async fn abort(&self, worker: &WorkerId, _: &AbortSplit) -> Result<()> {
            self.record(worker, "abort")
        }
        async fn adopt(&self, worker: &WorkerId, _: &AdoptRange) -> Result<()> {
            self.record(worker, "adopt")
        }
    }

    #[tokio::test]
    async fn test_undeliverable_assign_becomes_rejection() {
        let b = WorkerId::from_address("b:1").unwrap();
        let client = RecordingClient {
            down: Some(b.clone()),
            ..Default::default()
        };
        let (handle, mut receivers) = channels(4);

        let command = WorkerCommand::Assign(
            b.clone(),
            AssignRange {
                operation_id: OperationId(7),
                range: KeyRange::new("m", None),
                source: WorkerId::from_address("a:1").unwrap(),
            },
        );
        deliver(&client, &handle, command).await;

        let ack = receivers.split_ack.recv().await.unwrap();
        assert_eq!(ack.operation_id, OperationId(7));
        assert_eq!(ack.worker_id, b);
        assert_eq!(ack.status, SplitAckStatus::Rejected);
    }

    #[tokio::test]
    async fn test_release_closes_worker_queue() {
        let client = Arc::new(RecordingClient::default());
        let (handle, _receivers) = channels(4);
        let mut dispatcher = CommandDispatcher::new(client.clone(), handle);
        let a = WorkerId::from_address("a:1").unwrap();

        dispatcher.route(WorkerCommand::Probe(a.clone(), HeartbeatProbe { sent_at: 1 }));
        assert!(dispatcher.queues.contains_key(&a));

        dispatcher.route(WorkerCommand::Release(a.clone()));
        assert!(dispatcher.queues.is_empty());

        // Whatever was queued before the release is still delivered
        for _ in 0..100 {
            if client.calls.lock().unwrap().len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(client.calls.lock().unwrap().len(), 1);

        // A worker registering again under the same address gets a new queue
        dispatcher.route(WorkerCommand::Probe(a.clone(), HeartbeatProbe { sent_at: 2 }));
        assert_eq!(dispatcher.queues.len(), 1);
    }

    #[tokio::test]
    async fn test_per_worker_order_is_kept() {
        let client = Arc::new(RecordingClient::default());
        let (handle, _receivers) = channels(4);
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = broadcast::channel(1);

        let a = WorkerId::from_address("a:1").unwrap();
        let range = KeyRange::full();
        tx.send(WorkerCommand::Probe(a.clone(), HeartbeatProbe { sent_at: 1 })).unwrap();
        tx.send(WorkerCommand::Abort(a.clone(), AbortSplit { operation_id: OperationId(1), range: range.clone() }))
            .unwrap();
        tx.send(WorkerCommand::Probe(a.clone(), HeartbeatProbe { sent_at: 2 })).unwrap();
        drop(tx);

        CommandDispatcher::new(client.clone(), handle).run(rx, stop_rx).await;
        drop(stop_tx);

        // Give the queue task a chance to drain
        for _ in 0..100 {
            if client.calls.lock().unwrap().len() == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let kinds: Vec<&str> = client.calls.lock().unwrap().iter().map(|(_, k)| *k).collect();
        assert_eq!(kinds, vec!["probe", "abort", "probe"]);
    }
}
