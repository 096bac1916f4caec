use crate::bus::SyncRoute;
use crate::coordinator::{
    CoordinatorStatus, IngestionCoordinator, RecordSink, SyncEvent, SyncOutcome,
};
use crate::error::SyncError;
use statline_core::sync_ipc::{RoutedReply, SyncReply};
use statline_core::{CategoryScope, Record, SyncState};
use statline_storage::BatchWrite;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReceipt {
    pub correlation_id: String,
    /// False when a sync was already in flight and its id was returned.
    pub started: bool,
}

enum Command {
    Start {
        scope: CategoryScope,
        from: i64,
        to: i64,
        reply: oneshot::Sender<Result<StartReceipt, SyncError>>,
    },
    AwaitOutcome {
        correlation_id: String,
        reply: oneshot::Sender<SyncOutcome>,
    },
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
}

/// Cloneable handle to a coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    stream: Arc<str>,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SyncEvent>,
}

impl CoordinatorHandle {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub async fn start_sync(
        &self,
        scope: CategoryScope,
        from: i64,
        to: i64,
    ) -> Result<StartReceipt, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start {
            scope,
            from,
            to,
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Resolves once the sync finalizes, or immediately if it already has.
    pub async fn await_outcome(&self, correlation_id: &str) -> Result<SyncOutcome, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AwaitOutcome {
            correlation_id: correlation_id.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| SyncError::UnknownCorrelation(correlation_id.to_string()))
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn state(&self) -> Result<SyncState, SyncError> {
        Ok(self.status().await?.state)
    }

    /// Starts (or joins) a sync and waits for its outcome.
    pub async fn run_sync(
        &self,
        scope: CategoryScope,
        from: i64,
        to: i64,
    ) -> Result<SyncOutcome, SyncError> {
        let receipt = self.start_sync(scope, from, to).await?;
        self.await_outcome(&receipt.correlation_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: Command) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.closed())
    }

    fn closed(&self) -> SyncError {
        SyncError::CoordinatorClosed(self.stream.to_string())
    }
}

/// Moves the coordinator onto its own task. The task ends when every handle
/// has been dropped.
pub fn spawn_coordinator(
    coordinator: IngestionCoordinator,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
    let handle = CoordinatorHandle {
        stream: Arc::from(coordinator.stream()),
        commands,
        events: coordinator.event_sender(),
    };
    let task = tokio::spawn(run(coordinator, rx));
    (handle, task)
}

enum Step {
    Command(Option<Command>),
    Reply(Option<RoutedReply>),
    Written(Result<BatchWrite, JoinError>),
    Deadline,
}

/// A batch being written on the blocking pool. Replies stay queued on the
/// route until it lands, so batches apply in receipt order.
struct PendingWrite {
    correlation_id: String,
    batch_len: usize,
    task: JoinHandle<BatchWrite>,
}

impl PendingWrite {
    fn spawn(sink: Arc<dyn RecordSink>, correlation_id: String, records: Vec<Record>) -> Self {
        let batch_len = records.len();
        let task = tokio::task::spawn_blocking(move || sink.write_batch(&records));
        Self {
            correlation_id,
            batch_len,
            task,
        }
    }
}

async fn run(mut coordinator: IngestionCoordinator, mut commands: mpsc::Receiver<Command>) {
    let mut route: Option<SyncRoute> = None;
    let mut waiters: HashMap<String, Vec<oneshot::Sender<SyncOutcome>>> = HashMap::new();
    let mut pending: Option<PendingWrite> = None;
    info!(event = "coordinator_started", stream = %coordinator.stream());

    loop {
        let deadline = coordinator.next_deadline();
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            reply = next_reply(route.as_mut()), if pending.is_none() => Step::Reply(reply),
            written = wait_write(pending.as_mut()) => Step::Written(written),
            _ = sleep_until(deadline) => Step::Deadline,
        };

        let finished = match step {
            Step::Command(None) => break,
            Step::Command(Some(command)) => {
                handle_command(&mut coordinator, &mut route, &mut waiters, command);
                None
            }
            Step::Reply(Some(RoutedReply {
                correlation_id,
                reply: SyncReply::Batch { records, total, .. },
            })) => {
                if coordinator.begin_batch(&correlation_id, total, Instant::now()) {
                    pending = Some(PendingWrite::spawn(
                        coordinator.sink(),
                        correlation_id,
                        records,
                    ));
                }
                None
            }
            Step::Reply(Some(reply)) => coordinator.on_reply(reply, Instant::now()),
            Step::Reply(None) => {
                route = None;
                None
            }
            Step::Written(result) => {
                if let Some(write) = pending.take() {
                    let report = result.unwrap_or_else(|err| {
                        warn!(
                            event = "sync_batch_write_failed",
                            stream = %coordinator.stream(),
                            correlation_id = %write.correlation_id,
                            error = %err
                        );
                        BatchWrite::default()
                    });
                    coordinator.apply_batch(
                        &write.correlation_id,
                        write.batch_len,
                        report,
                        Instant::now(),
                    );
                }
                None
            }
            Step::Deadline => coordinator.on_timer(Instant::now()),
        };

        if let Some(outcome) = finished {
            route = None;
            resolve_waiters(&mut waiters, &outcome);
        }
    }

    info!(event = "coordinator_stopped", stream = %coordinator.stream());
}

fn handle_command(
    coordinator: &mut IngestionCoordinator,
    route: &mut Option<SyncRoute>,
    waiters: &mut HashMap<String, Vec<oneshot::Sender<SyncOutcome>>>,
    command: Command,
) {
    match command {
        Command::Start {
            scope,
            from,
            to,
            reply,
        } => {
            let result = coordinator
                .start_sync(&scope, from, to, Instant::now())
                .map(|ticket| {
                    let started = ticket.is_new();
                    if let Some(new_route) = ticket.route {
                        *route = Some(new_route);
                    }
                    StartReceipt {
                        correlation_id: ticket.correlation_id,
                        started,
                    }
                });
            let _ = reply.send(result);
        }
        Command::AwaitOutcome {
            correlation_id,
            reply,
        } => {
            if let Some(outcome) = coordinator.outcome_for(&correlation_id) {
                let _ = reply.send(outcome.clone());
            } else if coordinator.correlation_id() == Some(correlation_id.as_str()) {
                waiters.entry(correlation_id).or_default().push(reply);
            } else {
                // Dropping the sender tells the caller the id is unknown.
                debug!(
                    event = "await_unknown_correlation",
                    stream = %coordinator.stream(),
                    correlation_id = %correlation_id
                );
            }
        }
        Command::Status { reply } => {
            let _ = reply.send(coordinator.status());
        }
    }
}

fn resolve_waiters(
    waiters: &mut HashMap<String, Vec<oneshot::Sender<SyncOutcome>>>,
    outcome: &SyncOutcome,
) {
    for waiter in waiters.remove(&outcome.correlation_id).unwrap_or_default() {
        let _ = waiter.send(outcome.clone());
    }
}

async fn next_reply(route: Option<&mut SyncRoute>) -> Option<RoutedReply> {
    match route {
        Some(route) => route.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_write(pending: Option<&mut PendingWrite>) -> Result<BatchWrite, JoinError> {
    match pending {
        Some(write) => (&mut write.task).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
