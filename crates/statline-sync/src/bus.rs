use statline_core::sync_ipc::{parse_inbound, Inbound, InboundFrame, RoutedReply, SyncReply};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    /// A sync reply nobody is waiting for (stale or unknown correlation id).
    Unrouted,
    /// A frame of a type this bus does not route.
    Foreign,
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusStats {
    pub delivered: u64,
    pub unrouted: u64,
    pub foreign: u64,
    pub malformed: u64,
}

/// Receiving end of one correlation id's route.
pub struct SyncRoute {
    correlation_id: String,
    rx: mpsc::UnboundedReceiver<SyncReply>,
}

impl SyncRoute {
    /// Next reply for this correlation id, in arrival order. `None` once the
    /// route has been unregistered and drained.
    pub async fn recv(&mut self) -> Option<RoutedReply> {
        let reply = self.rx.recv().await?;
        Some(RoutedReply {
            correlation_id: self.correlation_id.clone(),
            reply,
        })
    }
}

#[derive(Default)]
struct BusInner {
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<SyncReply>>>,
    delivered: AtomicU64,
    unrouted: AtomicU64,
    foreign: AtomicU64,
    malformed: AtomicU64,
}

/// Demultiplexes inbound frames to the coordinator that owns their
/// correlation id.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any existing route for the same id.
    pub fn register(&self, correlation_id: &str) -> SyncRoute {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes().insert(correlation_id.to_string(), tx);
        SyncRoute {
            correlation_id: correlation_id.to_string(),
            rx,
        }
    }

    pub fn unregister(&self, correlation_id: &str) -> bool {
        self.routes().remove(correlation_id).is_some()
    }

    pub fn is_routed(&self, correlation_id: &str) -> bool {
        self.routes().contains_key(correlation_id)
    }

    pub fn route_count(&self) -> usize {
        self.routes().len()
    }

    pub fn dispatch_text(&self, text: &str) -> Dispatch {
        match parse_inbound(text) {
            Ok(inbound) => self.dispatch_inbound(inbound),
            Err(err) => self.reject(err),
        }
    }

    pub fn dispatch_frame(&self, frame: InboundFrame) -> Dispatch {
        match frame.classify() {
            Ok(inbound) => self.dispatch_inbound(inbound),
            Err(err) => self.reject(err),
        }
    }

    pub fn dispatch(&self, routed: RoutedReply) -> Dispatch {
        let RoutedReply {
            correlation_id,
            reply,
        } = routed;
        let mut routes = self.routes();
        let Some(sender) = routes.get(&correlation_id) else {
            drop(routes);
            debug!(
                event = "bus_unrouted",
                correlation_id = %correlation_id,
                phase = reply.phase_label()
            );
            self.inner.unrouted.fetch_add(1, Ordering::Relaxed);
            return Dispatch::Unrouted;
        };
        if sender.send(reply).is_err() {
            // Owner went away without unregistering.
            routes.remove(&correlation_id);
            drop(routes);
            self.inner.unrouted.fetch_add(1, Ordering::Relaxed);
            return Dispatch::Unrouted;
        }
        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        Dispatch::Delivered
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            unrouted: self.inner.unrouted.load(Ordering::Relaxed),
            foreign: self.inner.foreign.load(Ordering::Relaxed),
            malformed: self.inner.malformed.load(Ordering::Relaxed),
        }
    }

    fn dispatch_inbound(&self, inbound: Inbound) -> Dispatch {
        match inbound {
            Inbound::Sync(routed) => self.dispatch(routed),
            Inbound::Other { kind } => {
                debug!(event = "bus_foreign_frame", kind = %kind);
                self.inner.foreign.fetch_add(1, Ordering::Relaxed);
                Dispatch::Foreign
            }
        }
    }

    fn reject(&self, err: impl std::fmt::Display) -> Dispatch {
        warn!(event = "bus_protocol_error", error = %err);
        self.inner.malformed.fetch_add(1, Ordering::Relaxed);
        Dispatch::Malformed
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<SyncReply>>> {
        self.inner
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_by_correlation_id_in_order() {
        let bus = MessageBus::new();
        let mut first = bus.register("c1");
        let mut second = bus.register("c2");

        assert_eq!(
            bus.dispatch_frame(InboundFrame::start("c2", 4)),
            Dispatch::Delivered
        );
        assert_eq!(
            bus.dispatch_frame(InboundFrame::start("c1", 2)),
            Dispatch::Delivered
        );
        assert_eq!(
            bus.dispatch_frame(InboundFrame::end("c1", 2, 2)),
            Dispatch::Delivered
        );

        let reply = first.recv().await.expect("c1 start");
        assert_eq!(reply.correlation_id, "c1");
        assert_eq!(reply.reply, SyncReply::Start { total: 2 });
        assert_eq!(
            first.recv().await.map(|r| r.reply.phase_label()),
            Some("end")
        );
        assert_eq!(
            second.recv().await.map(|r| r.reply),
            Some(SyncReply::Start { total: 4 })
        );
    }

    #[test]
    fn unregistered_and_unknown_ids_are_unrouted() {
        let bus = MessageBus::new();
        let route = bus.register("old");
        assert!(bus.unregister("old"));
        assert!(!bus.is_routed("old"));
        assert_eq!(
            bus.dispatch_frame(InboundFrame::end("old", 1, 1)),
            Dispatch::Unrouted
        );
        drop(route);

        let dropped = bus.register("dropped");
        drop(dropped);
        assert_eq!(
            bus.dispatch_frame(InboundFrame::start("dropped", 1)),
            Dispatch::Unrouted
        );
        assert_eq!(bus.route_count(), 0);
        assert_eq!(bus.stats().unrouted, 2);
    }

    #[test]
    fn foreign_and_malformed_text_is_counted_not_routed() {
        let bus = MessageBus::new();
        let _route = bus.register("c1");
        assert_eq!(bus.dispatch_text(r#"{"type":"pong"}"#), Dispatch::Foreign);
        assert_eq!(bus.dispatch_text("not json"), Dispatch::Malformed);
        assert_eq!(
            bus.dispatch_text(r#"{"type":"sync_response","correlationId":"c1"}"#),
            Dispatch::Malformed
        );
        assert_eq!(
            bus.stats(),
            BusStats {
                delivered: 0,
                unrouted: 0,
                foreign: 1,
                malformed: 2
            }
        );
    }
}
