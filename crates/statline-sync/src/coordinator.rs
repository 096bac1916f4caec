use crate::bus::{MessageBus, SyncRoute};
use crate::error::SyncError;
use crate::timers::{SyncTimers, TimeoutKind};
use crate::transport::Transport;
use serde::Serialize;
use statline_core::sync_ipc::{RoutedReply, SyncReply, SyncRequestFrame};
use statline_core::{CategoryScope, Record, SyncRequest, SyncState};
use statline_storage::{BatchWrite, SharedStore, SkippedRecord, StorageError};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ABSOLUTE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_BATCH_SIZE_HINT: u32 = 500;
const DEFAULT_EVENT_CAPACITY: usize = 256;
const RECENT_OUTCOMES: usize = 16;

/// Where ingested records land. Implemented by [`SharedStore`]; tests swap
/// in sinks that fail on purpose.
///
/// `write_batch` blocks; the runtime calls it from the blocking pool.
pub trait RecordSink: Send + Sync {
    fn upsert(&self, record: &Record) -> Result<(), StorageError>;

    /// Writes a batch. Records that fail are reported, never fatal.
    fn write_batch(&self, records: &[Record]) -> BatchWrite {
        let mut report = BatchWrite::default();
        for record in records {
            match self.upsert(record) {
                Ok(()) => report.written += 1,
                Err(err) => report.skipped.push(SkippedRecord {
                    primary_key: record.primary_key.clone(),
                    error: err.to_string(),
                }),
            }
        }
        report
    }
}

impl RecordSink for SharedStore {
    fn upsert(&self, record: &Record) -> Result<(), StorageError> {
        SharedStore::upsert(self, record)
    }

    fn write_batch(&self, records: &[Record]) -> BatchWrite {
        match self.upsert_batch(records) {
            Ok(report) => report,
            Err(err) => {
                let error = err.to_string();
                BatchWrite {
                    written: 0,
                    skipped: records
                        .iter()
                        .map(|record| SkippedRecord {
                            primary_key: record.primary_key.clone(),
                            error: error.clone(),
                        })
                        .collect(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub idle_timeout: Duration,
    pub absolute_timeout: Duration,
    pub batch_size_hint: Option<u32>,
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            absolute_timeout: DEFAULT_ABSOLUTE_TIMEOUT,
            batch_size_hint: Some(DEFAULT_BATCH_SIZE_HINT),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Remote { error: String },
    IdleTimeout { after_ms: u64 },
    AbsoluteTimeout { after_ms: u64 },
}

impl FailureReason {
    fn timeout(kind: TimeoutKind, after: Duration) -> Self {
        let after_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
        match kind {
            TimeoutKind::Idle => FailureReason::IdleTimeout { after_ms },
            TimeoutKind::Absolute => FailureReason::AbsoluteTimeout { after_ms },
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Remote { error } => write!(f, "remote failure: {error}"),
            FailureReason::IdleTimeout { after_ms } => {
                write!(f, "no sync activity for {after_ms} ms")
            }
            FailureReason::AbsoluteTimeout { after_ms } => {
                write!(f, "sync did not finish within {after_ms} ms")
            }
        }
    }
}

/// Terminal result of one sync, published exactly once per correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub correlation_id: String,
    pub stream: String,
    pub status: SyncState,
    pub received: u64,
    pub skipped: u64,
    pub expected_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        self.status == SyncState::Done
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Started {
        stream: String,
        correlation_id: String,
    },
    Progress {
        stream: String,
        correlation_id: String,
        percent: u8,
        received: u64,
        expected_total: Option<u64>,
    },
    Finished {
        outcome: SyncOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub correlation_id: String,
    pub received: u64,
    pub skipped: u64,
    pub expected_total: Option<u64>,
    pub percent: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub stream: String,
    pub state: SyncState,
    pub progress: Option<SyncProgress>,
    pub last_outcome: Option<SyncOutcome>,
}

/// Result of [`IngestionCoordinator::start_sync`]. `route` is present only
/// when a new request went out.
pub struct StartTicket {
    pub correlation_id: String,
    pub route: Option<SyncRoute>,
}

impl StartTicket {
    pub fn is_new(&self) -> bool {
        self.route.is_some()
    }
}

struct ActiveSync {
    request: SyncRequest,
    expected_total: Option<u64>,
    received: u64,
    skipped: u64,
    last_percent: Option<u8>,
}

impl ActiveSync {
    fn percent(&self) -> Option<u8> {
        self.expected_total
            .filter(|total| *total > 0)
            .map(|total| progress_percent(self.received, total))
    }

    fn unmet(&self) -> bool {
        self.expected_total
            .is_some_and(|total| total > 0 && self.received < total)
    }
}

/// Rounded half-up, capped at 100.
pub fn progress_percent(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let received = u128::from(received);
    let total = u128::from(total);
    let percent = (received * 200 + total) / (total * 2);
    u8::try_from(percent.min(100)).unwrap_or(100)
}

/// Sync state machine for one logical stream.
///
/// Every method takes the current instant so the whole machine can be driven
/// without a runtime. [`crate::runtime::spawn_coordinator`] wraps it in a
/// task.
pub struct IngestionCoordinator {
    stream: String,
    config: CoordinatorConfig,
    sink: Arc<dyn RecordSink>,
    transport: Arc<dyn Transport>,
    bus: MessageBus,
    events: broadcast::Sender<SyncEvent>,
    state: SyncState,
    active: Option<ActiveSync>,
    timers: SyncTimers,
    recent: VecDeque<SyncOutcome>,
}

impl IngestionCoordinator {
    pub fn new(
        stream: impl Into<String>,
        sink: Arc<dyn RecordSink>,
        transport: Arc<dyn Transport>,
        bus: MessageBus,
        config: CoordinatorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            stream: stream.into(),
            config,
            sink,
            transport,
            bus,
            events,
            state: SyncState::Idle,
            active: None,
            timers: SyncTimers::new(),
            recent: VecDeque::with_capacity(RECENT_OUTCOMES),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.active
            .as_ref()
            .map(|active| active.request.correlation_id.as_str())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn sink(&self) -> Arc<dyn RecordSink> {
        Arc::clone(&self.sink)
    }

    pub fn event_sender(&self) -> broadcast::Sender<SyncEvent> {
        self.events.clone()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn timers(&self) -> &SyncTimers {
        &self.timers
    }

    pub fn progress(&self) -> Option<SyncProgress> {
        self.active.as_ref().map(|active| SyncProgress {
            correlation_id: active.request.correlation_id.clone(),
            received: active.received,
            skipped: active.skipped,
            expected_total: active.expected_total,
            percent: active.percent(),
        })
    }

    pub fn last_outcome(&self) -> Option<&SyncOutcome> {
        self.recent.back()
    }

    pub fn outcome_for(&self, correlation_id: &str) -> Option<&SyncOutcome> {
        self.recent
            .iter()
            .rev()
            .find(|outcome| outcome.correlation_id == correlation_id)
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            stream: self.stream.clone(),
            state: self.state,
            progress: self.progress(),
            last_outcome: self.last_outcome().cloned(),
        }
    }

    pub fn start_sync(
        &mut self,
        scope: &CategoryScope,
        from: i64,
        to: i64,
        now: Instant,
    ) -> Result<StartTicket, SyncError> {
        if let Some(correlation_id) = self.correlation_id() {
            debug!(
                event = "sync_start_reentrant",
                stream = %self.stream,
                correlation_id = %correlation_id
            );
            return Ok(StartTicket {
                correlation_id: correlation_id.to_string(),
                route: None,
            });
        }

        let request = SyncRequest::new(from, to)?;
        if !self.transport.is_connected() {
            warn!(
                event = "sync_start_rejected",
                stream = %self.stream,
                reason = "transport_disconnected"
            );
            return Err(SyncError::TransportUnavailable(
                "transport is not connected".to_string(),
            ));
        }

        let frame = SyncRequestFrame::new(&request, scope, self.config.batch_size_hint);
        // Route first so a fast reply cannot beat the registration.
        let route = self.bus.register(&request.correlation_id);
        if let Err(err) = self.transport.send(&frame) {
            self.bus.unregister(&request.correlation_id);
            warn!(
                event = "sync_start_rejected",
                stream = %self.stream,
                error = %err
            );
            return Err(err.into());
        }

        let correlation_id = request.correlation_id.clone();
        info!(
            event = "sync_start",
            stream = %self.stream,
            correlation_id = %correlation_id,
            from,
            to,
            categories = ?scope.categories()
        );
        self.timers.cancel();
        self.timers.arm_absolute(now, self.config.absolute_timeout);
        self.active = Some(ActiveSync {
            request,
            expected_total: None,
            received: 0,
            skipped: 0,
            last_percent: None,
        });
        self.state = SyncState::AwaitingStart;
        self.emit(SyncEvent::Started {
            stream: self.stream.clone(),
            correlation_id: correlation_id.clone(),
        });

        Ok(StartTicket {
            correlation_id,
            route: Some(route),
        })
    }

    /// Applies one reply. Returns the outcome when the reply finalized the
    /// sync; replies for any other correlation id are ignored.
    pub fn on_reply(&mut self, routed: RoutedReply, now: Instant) -> Option<SyncOutcome> {
        if self.correlation_id() != Some(routed.correlation_id.as_str()) {
            debug!(
                event = "sync_reply_stale",
                stream = %self.stream,
                correlation_id = %routed.correlation_id,
                phase = routed.reply.phase_label()
            );
            return None;
        }

        match routed.reply {
            SyncReply::Start { total } => {
                self.on_start(total, now);
                if self.active.as_ref()?.expected_total != Some(0) {
                    return None;
                }
                let active = self.active.take()?;
                Some(self.finalize(active, SyncState::Done, None))
            }
            SyncReply::Batch { records, total, .. } => {
                if self.begin_batch(&routed.correlation_id, total, now) {
                    let report = self.sink.write_batch(&records);
                    self.apply_batch(&routed.correlation_id, records.len(), report, now);
                }
                None
            }
            SyncReply::End { sent, total } => {
                debug!(
                    event = "sync_end_received",
                    stream = %self.stream,
                    sent = ?sent,
                    total = ?total
                );
                let active = self.active.take()?;
                Some(self.finalize(active, SyncState::Done, None))
            }
            SyncReply::Failure { error } => {
                let active = self.active.take()?;
                let reason = FailureReason::Remote { error };
                Some(self.finalize(active, SyncState::Failed, Some(reason)))
            }
        }
    }

    /// Finalizes the sync if one of its deadlines has passed.
    pub fn on_timer(&mut self, now: Instant) -> Option<SyncOutcome> {
        self.active.as_ref()?;
        let kind = self.timers.expired(now)?;
        let after = match kind {
            TimeoutKind::Idle => self.config.idle_timeout,
            TimeoutKind::Absolute => self.config.absolute_timeout,
        };
        debug!(
            event = "sync_timer_expired",
            stream = %self.stream,
            kind = kind.as_str()
        );
        let active = self.active.take()?;
        let reason = FailureReason::timeout(kind, after);
        Some(self.finalize(active, SyncState::Failed, Some(reason)))
    }

    fn on_start(&mut self, total: u64, now: Instant) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if self.state == SyncState::Receiving && active.expected_total.is_none() {
            // A batch without a total got here first.
            active.expected_total = Some(total);
            info!(
                event = "sync_announced_late",
                stream = %self.stream,
                correlation_id = %active.request.correlation_id,
                total,
                received = active.received
            );
            self.refresh_idle(now);
            return;
        }
        if self.state == SyncState::Receiving {
            warn!(
                event = "sync_protocol_error",
                stream = %self.stream,
                correlation_id = %active.request.correlation_id,
                error = "start received while already receiving"
            );
            self.refresh_idle(now);
            return;
        }
        active.expected_total = Some(total);
        info!(
            event = "sync_announced",
            stream = %self.stream,
            correlation_id = %active.request.correlation_id,
            total
        );
        if total > 0 {
            self.state = SyncState::Receiving;
        }
        self.refresh_idle(now);
    }

    /// Accepts a batch for `correlation_id` before its records are written.
    /// Returns false when the batch belongs to no current sync.
    pub fn begin_batch(
        &mut self,
        correlation_id: &str,
        total: Option<u64>,
        now: Instant,
    ) -> bool {
        if self.correlation_id() != Some(correlation_id) {
            return false;
        }
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if self.state == SyncState::AwaitingStart {
            active.expected_total = active.expected_total.or(total);
            self.state = SyncState::Receiving;
        }
        self.refresh_idle(now);
        true
    }

    /// Counts a written batch and publishes progress. Reports for a sync
    /// that has since finalized are dropped.
    pub fn apply_batch(
        &mut self,
        correlation_id: &str,
        batch_len: usize,
        report: BatchWrite,
        now: Instant,
    ) {
        if self.correlation_id() != Some(correlation_id) {
            debug!(
                event = "sync_batch_late",
                stream = %self.stream,
                correlation_id = %correlation_id,
                written = report.written
            );
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let batch_len = u64::try_from(batch_len).unwrap_or(u64::MAX);
        active.received += report.written;
        active.skipped += batch_len.saturating_sub(report.written);
        for skipped in &report.skipped {
            warn!(
                event = "sync_record_skipped",
                stream = %self.stream,
                correlation_id = %correlation_id,
                primary_key = %skipped.primary_key,
                error = %skipped.error
            );
        }
        debug!(
            event = "sync_batch_applied",
            stream = %self.stream,
            correlation_id = %correlation_id,
            batch_len,
            received = active.received,
            skipped = active.skipped
        );

        if let Some(percent) = active.percent() {
            if active.last_percent != Some(percent) {
                active.last_percent = Some(percent);
                let event = SyncEvent::Progress {
                    stream: self.stream.clone(),
                    correlation_id: active.request.correlation_id.clone(),
                    percent,
                    received: active.received,
                    expected_total: active.expected_total,
                };
                self.emit(event);
            }
        }
        self.refresh_idle(now);
    }

    fn refresh_idle(&mut self, now: Instant) {
        let unmet = self.active.as_ref().is_some_and(ActiveSync::unmet);
        if unmet {
            self.timers.arm_idle(now, self.config.idle_timeout);
        } else {
            self.timers.disarm_idle();
        }
    }

    fn finalize(
        &mut self,
        active: ActiveSync,
        status: SyncState,
        reason: Option<FailureReason>,
    ) -> SyncOutcome {
        self.timers.cancel();
        let correlation_id = active.request.correlation_id.clone();
        self.bus.unregister(&correlation_id);

        if status == SyncState::Done && active.last_percent != Some(100) {
            self.emit(SyncEvent::Progress {
                stream: self.stream.clone(),
                correlation_id: correlation_id.clone(),
                percent: 100,
                received: active.received,
                expected_total: active.expected_total,
            });
        }

        let outcome = SyncOutcome {
            correlation_id,
            stream: self.stream.clone(),
            status,
            received: active.received,
            skipped: active.skipped,
            expected_total: active.expected_total,
            reason,
        };
        match &outcome.reason {
            None => info!(
                event = "sync_done",
                stream = %outcome.stream,
                correlation_id = %outcome.correlation_id,
                received = outcome.received,
                skipped = outcome.skipped
            ),
            Some(reason) => warn!(
                event = "sync_failed",
                stream = %outcome.stream,
                correlation_id = %outcome.correlation_id,
                received = outcome.received,
                skipped = outcome.skipped,
                reason = %reason
            ),
        }

        self.state = status;
        if self.recent.len() == RECENT_OUTCOMES {
            self.recent.pop_front();
        }
        self.recent.push_back(outcome.clone());
        self.emit(SyncEvent::Finished {
            outcome: outcome.clone(),
        });
        outcome
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
