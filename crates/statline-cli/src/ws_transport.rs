use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use statline_core::sync_ipc::SyncRequestFrame;
use statline_sync::{MessageBus, Transport, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// WebSocket client. Outbound requests go through a channel to the socket
/// task; every inbound text frame is handed to the bus.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    pub async fn connect(url: &Url, bus: MessageBus) -> Result<(Self, JoinHandle<()>)> {
        let (ws, _) = connect_async(url.clone())
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        info!(event = "source_connected", url = %url);

        let connected = Arc::new(AtomicBool::new(true));
        let (outbound, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(socket_loop(ws, rx, bus, connected.clone()));
        Ok((
            Self {
                outbound,
                connected,
            },
            task,
        ))
    }
}

impl Transport for WsTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &SyncRequestFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unavailable("socket closed".to_string()));
        }
        let text =
            serde_json::to_string(frame).map_err(|err| TransportError::Send(err.to_string()))?;
        self.outbound
            .send(text)
            .map_err(|_| TransportError::Unavailable("socket task stopped".to_string()))
    }
}

async fn socket_loop<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    bus: MessageBus,
    connected: Arc<AtomicBool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    bus.dispatch_text(&text);
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        bus.dispatch_text(text);
                    }
                    Err(_) => debug!(event = "source_binary_ignored", len = bytes.len()),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(event = "source_closed", frame = ?frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(event = "source_read_error", error = %err);
                    break;
                }
                None => break,
            },
            request = outbound.recv() => match request {
                Some(text) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        warn!(event = "source_write_error", error = %err);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = sink.close().await;
    info!(event = "source_disconnected");
}
