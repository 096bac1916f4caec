use crate::error::TransportError;
use statline_core::sync_ipc::SyncRequestFrame;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Outbound half of the duplex channel to the sync source.
///
/// Connection management lives behind this trait. `send` never buffers: a
/// disconnected transport fails immediately and the caller decides whether
/// to retry.
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;
    fn send(&self, frame: &SyncRequestFrame) -> Result<(), TransportError>;
}

/// In-process transport that hands outbound requests to a receiver.
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<SyncRequestFrame>,
    connected: AtomicBool,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncRequestFrame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound,
                connected: AtomicBool::new(true),
            },
            rx,
        )
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Transport for ChannelTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    fn send(&self, frame: &SyncRequestFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("channel disconnected".to_string()));
        }
        self.outbound
            .send(frame.clone())
            .map_err(|_| TransportError::Unavailable("receiver dropped".to_string()))
    }
}
