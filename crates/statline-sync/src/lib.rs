//! Sync side of statline: routes inbound frames, drives one ingestion state
//! machine per logical stream, and exposes cached reads to collaborators.

pub mod bus;
pub mod coordinator;
pub mod error;
pub mod retry;
pub mod runtime;
pub mod service;
pub mod timers;
pub mod transport;

pub use bus::{Dispatch, MessageBus, SyncRoute};
pub use coordinator::{
    CoordinatorConfig, CoordinatorStatus, FailureReason, IngestionCoordinator, RecordSink,
    SyncEvent, SyncOutcome, SyncProgress,
};
pub use error::{ServiceError, SyncError, TransportError};
pub use retry::{sync_with_retry, RetryPolicy, RetryReport};
pub use runtime::{spawn_coordinator, CoordinatorHandle, StartReceipt};
pub use service::ActivityService;
pub use timers::{SyncTimers, TimeoutKind};
pub use transport::{ChannelTransport, Transport};
