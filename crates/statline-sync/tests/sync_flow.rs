use serde_json::json;
use statline_core::sync_ipc::{InboundFrame, SyncRequestFrame};
use statline_core::{CategoryScope, Record, SyncState};
use statline_storage::SharedStore;
use statline_sync::{
    spawn_coordinator, sync_with_retry, ActivityService, ChannelTransport, CoordinatorConfig,
    CoordinatorHandle, Dispatch, FailureReason, IngestionCoordinator, MessageBus, RetryPolicy,
    SyncError, SyncEvent,
};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

const DAY: i64 = 86_400;
const JAN_1_2024: i64 = 1_704_067_200;

struct Fixture {
    store: SharedStore,
    bus: MessageBus,
    transport: Arc<ChannelTransport>,
    requests: mpsc::UnboundedReceiver<SyncRequestFrame>,
    handle: CoordinatorHandle,
}

fn fixture() -> Fixture {
    let store = SharedStore::in_memory("activity").expect("store");
    let (transport, requests) = ChannelTransport::new();
    let transport = Arc::new(transport);
    let bus = MessageBus::new();
    let coordinator = IngestionCoordinator::new(
        "matches",
        Arc::new(store.clone()),
        transport.clone(),
        bus.clone(),
        CoordinatorConfig::default(),
    );
    let (handle, _task) = spawn_coordinator(coordinator);
    Fixture {
        store,
        bus,
        transport,
        requests,
        handle,
    }
}

fn records(category_id: i64, keys: Range<i64>) -> Vec<Record> {
    keys.map(|n| {
        Record::new(
            format!("r-{n}"),
            category_id,
            JAN_1_2024 + n * DAY,
            json!({"kills": n}),
        )
    })
    .collect()
}

async fn next_progress(events: &mut broadcast::Receiver<SyncEvent>) -> (String, u8, u64) {
    loop {
        match events.recv().await.expect("event stream open") {
            SyncEvent::Progress {
                correlation_id,
                percent,
                received,
                ..
            } => return (correlation_id, percent, received),
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_fails_sync_and_keeps_partial_batches() {
    let mut f = fixture();
    let started_at = Instant::now();

    let receipt = f
        .handle
        .start_sync(CategoryScope::only([7]), 0, JAN_1_2024 * 2)
        .await
        .expect("start");
    let request = f.requests.recv().await.expect("outbound request");
    assert_eq!(request.correlation_id, receipt.correlation_id);
    assert_eq!(request.categories, Some(vec![7]));

    let id = receipt.correlation_id;
    f.bus.dispatch_frame(InboundFrame::start(&id, 50));
    f.bus
        .dispatch_frame(InboundFrame::batch(&id, records(7, 0..2), 2, 50));

    let outcome = f.handle.await_outcome(&id).await.expect("outcome");
    assert_eq!(outcome.status, SyncState::Failed);
    assert_eq!(
        outcome.reason,
        Some(FailureReason::IdleTimeout { after_ms: 30_000 })
    );
    assert_eq!(outcome.received, 2);
    assert_eq!(outcome.expected_total, Some(50));

    let elapsed = started_at.elapsed();
    assert!(elapsed >= Duration::from_secs(30), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(31), "{elapsed:?}");

    assert_eq!(f.store.query_by_category(7).expect("query").len(), 2);
    assert_eq!(f.handle.state().await.expect("state"), SyncState::Failed);
}

#[tokio::test(start_paused = true)]
async fn absolute_timeout_bounds_a_silent_source() {
    let mut f = fixture();
    let started_at = Instant::now();
    let outcome = f
        .handle
        .run_sync(CategoryScope::All, 0, 10)
        .await
        .expect("outcome");
    assert!(f.requests.recv().await.is_some());

    assert_eq!(
        outcome.reason,
        Some(FailureReason::AbsoluteTimeout { after_ms: 120_000 })
    );
    assert!(started_at.elapsed() >= Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn complete_sync_is_queryable_and_reports_one_hundred_once() {
    let mut f = fixture();
    let mut events = f.handle.subscribe();

    let receipt = f
        .handle
        .start_sync(CategoryScope::All, 0, JAN_1_2024 * 2)
        .await
        .expect("start");
    let again = f
        .handle
        .start_sync(CategoryScope::All, 0, JAN_1_2024 * 2)
        .await
        .expect("reentrant start");
    assert!(receipt.started);
    assert!(!again.started);
    assert_eq!(again.correlation_id, receipt.correlation_id);

    let id = receipt.correlation_id;
    f.requests.recv().await.expect("one request");
    assert!(f.requests.try_recv().is_err());

    f.bus.dispatch_frame(InboundFrame::start(&id, 5));
    f.bus
        .dispatch_frame(InboundFrame::batch(&id, records(3, 0..2), 2, 5));
    f.bus
        .dispatch_frame(InboundFrame::batch(&id, records(3, 2..4), 4, 5));
    f.bus
        .dispatch_frame(InboundFrame::batch(&id, records(3, 4..5), 5, 5));
    f.bus.dispatch_frame(InboundFrame::end(&id, 5, 5));

    let outcome = f.handle.await_outcome(&id).await.expect("outcome");
    assert!(outcome.is_success());
    assert_eq!((outcome.received, outcome.skipped), (5, 0));

    let mut percents = Vec::new();
    loop {
        match events.recv().await.expect("event") {
            SyncEvent::Progress { percent, .. } => percents.push(percent),
            SyncEvent::Finished { .. } => break,
            SyncEvent::Started { .. } => {}
        }
    }
    assert_eq!(percents, vec![40, 80, 100]);
    assert_eq!(percents.iter().filter(|p| **p == 100).count(), 1);
    assert_eq!(f.store.query_by_category(3).expect("query").len(), 5);
}

#[tokio::test(start_paused = true)]
async fn superseded_stream_ignores_late_replies() {
    let mut f = fixture();
    let mut events = f.handle.subscribe();

    let first = f
        .handle
        .start_sync(CategoryScope::All, 0, 100)
        .await
        .expect("first start")
        .correlation_id;
    f.requests.recv().await.expect("first request");
    f.bus.dispatch_frame(InboundFrame::start(&first, 10));
    let failed = f.handle.await_outcome(&first).await.expect("first outcome");
    assert_eq!(failed.status, SyncState::Failed);

    let second = f
        .handle
        .start_sync(CategoryScope::All, 0, 100)
        .await
        .expect("second start")
        .correlation_id;
    assert_ne!(first, second);
    f.requests.recv().await.expect("second request");
    f.bus.dispatch_frame(InboundFrame::start(&second, 4));

    let late = f
        .bus
        .dispatch_frame(InboundFrame::batch(&first, records(1, 0..3), 3, 10));
    assert_eq!(late, Dispatch::Unrouted);
    f.bus
        .dispatch_frame(InboundFrame::batch(&second, records(1, 10..12), 2, 4));

    let (progress_id, percent, received) = next_progress(&mut events).await;
    assert_eq!(progress_id, second);
    assert_eq!((percent, received), (50, 2));

    let status = f.handle.status().await.expect("status");
    let progress = status.progress.expect("active progress");
    assert_eq!(progress.correlation_id, second);
    assert_eq!(progress.received, 2);
    assert_eq!(progress.expected_total, Some(4));
    assert!(!f
        .store
        .with(|store| store.has_record("r-0"))
        .expect("lookup"));
}

#[tokio::test(start_paused = true)]
async fn cache_is_invalidated_when_a_sync_finishes() {
    let mut f = fixture();
    let service = ActivityService::new(f.store.clone(), Duration::from_secs(60));
    let _watcher = service.watch_sync(f.handle.subscribe());
    assert!(service.get_by_category(5).expect("cold read").is_empty());

    let id = f
        .handle
        .start_sync(CategoryScope::All, 0, JAN_1_2024 * 2)
        .await
        .expect("start")
        .correlation_id;
    f.requests.recv().await.expect("request");
    f.bus.dispatch_frame(InboundFrame::start(&id, 3));
    f.bus
        .dispatch_frame(InboundFrame::batch(&id, records(5, 0..3), 3, 3));
    f.bus.dispatch_frame(InboundFrame::end(&id, 3, 3));
    assert!(f.handle.await_outcome(&id).await.expect("outcome").is_success());

    for _ in 0..100 {
        if service.cache_stats().entries == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(service.cache_stats().entries, 0);
    assert_eq!(service.get_by_category(5).expect("warm read").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_reissues_after_remote_failure() {
    let f = fixture();
    let bus = f.bus.clone();
    let mut requests = f.requests;
    let responder = tokio::spawn(async move {
        let mut attempt = 0;
        while let Some(request) = requests.recv().await {
            attempt += 1;
            let id = request.correlation_id;
            if attempt == 1 {
                bus.dispatch_frame(InboundFrame::failure(&id, "source busy"));
            } else {
                bus.dispatch_frame(InboundFrame::start(&id, 2));
                bus.dispatch_frame(InboundFrame::batch(&id, records(9, 0..2), 2, 2));
                bus.dispatch_frame(InboundFrame::end(&id, 2, 2));
            }
        }
        attempt
    });

    let started_at = Instant::now();
    let report = sync_with_retry(
        &f.handle,
        &CategoryScope::All,
        0,
        JAN_1_2024 * 2,
        &RetryPolicy::default(),
    )
    .await
    .expect("retried sync");
    assert_eq!(report.attempts, 2);
    assert!(report.outcome.is_success());
    assert_eq!(report.outcome.received, 2);
    assert!(started_at.elapsed() >= Duration::from_secs(2));

    drop(f.handle);
    drop(f.transport);
    assert_eq!(responder.await.expect("responder"), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_gives_up_after_max_attempts_on_dead_transport() {
    let f = fixture();
    f.transport.set_connected(false);
    let started_at = Instant::now();

    let err = sync_with_retry(
        &f.handle,
        &CategoryScope::All,
        0,
        10,
        &RetryPolicy::default(),
    )
    .await
    .expect_err("transport stays down");
    assert!(matches!(err, SyncError::TransportUnavailable(_)));

    // Two waits between three attempts: 2s then 4s.
    let elapsed = started_at.elapsed();
    assert!(elapsed >= Duration::from_secs(6), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(7), "{elapsed:?}");
    assert_eq!(f.handle.state().await.expect("state"), SyncState::Idle);
}

#[tokio::test(start_paused = true)]
async fn retry_does_not_repeat_invalid_ranges() {
    let f = fixture();
    let started_at = Instant::now();
    let err = sync_with_retry(
        &f.handle,
        &CategoryScope::All,
        10,
        0,
        &RetryPolicy::default(),
    )
    .await
    .expect_err("inverted range");
    assert!(matches!(err, SyncError::InvalidRange(_)));
    assert!(started_at.elapsed() < Duration::from_secs(1));
}
