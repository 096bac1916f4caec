use anyhow::{Context, Result};
use statline_core::sync_ipc::{
    InboundFrame, NdjsonFrameDecoder, SyncRequestFrame, DEFAULT_MAX_FRAME_BYTES,
    SYNC_RESPONSE_TYPE,
};
use statline_sync::MessageBus;
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Canned source replies read from an NDJSON file. Sync responses are
/// re-addressed to whichever correlation id the live request carries, so a
/// fixture recorded once can answer any request.
#[derive(Debug, Clone, Default)]
pub struct ReplaySource {
    frames: Vec<InboundFrame>,
}

impl ReplaySource {
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read replay file {}", path.display()))?;
        let source = Self::from_bytes(&bytes);
        info!(
            event = "replay_loaded",
            path = %path.display(),
            frames = source.frames.len()
        );
        Ok(source)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut decoder = NdjsonFrameDecoder::<InboundFrame>::new(DEFAULT_MAX_FRAME_BYTES);
        let mut report = decoder.push_chunk(bytes);
        let tail = decoder.finish();
        report.frames.extend(tail.frames);
        report.errors.extend(tail.errors);
        for err in &report.errors {
            warn!(event = "replay_frame_skipped", error = %err);
        }
        Self {
            frames: report.frames,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames_for(&self, correlation_id: &str) -> Vec<InboundFrame> {
        self.frames
            .iter()
            .cloned()
            .map(|mut frame| {
                if frame.kind == SYNC_RESPONSE_TYPE {
                    frame.correlation_id = Some(correlation_id.to_string());
                }
                frame
            })
            .collect()
    }

    /// Answers every outbound request with the whole script.
    pub fn spawn(
        self,
        mut requests: mpsc::UnboundedReceiver<SyncRequestFrame>,
        bus: MessageBus,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                for frame in self.frames_for(&request.correlation_id) {
                    bus.dispatch_frame(frame);
                }
            }
        })
    }
}
