use crate::{CategoryId, CategoryScope, Record, SyncRequest};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use thiserror::Error;

pub const SYNC_REQUEST_TYPE: &str = "sync_request";
pub const SYNC_RESPONSE_TYPE: &str = "sync_response";
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Outbound request asking the source to stream records in `[from, to]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: i64,
    pub to: i64,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size_hint: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<CategoryId>>,
}

impl SyncRequestFrame {
    pub fn new(
        request: &SyncRequest,
        scope: &CategoryScope,
        batch_size_hint: Option<u32>,
    ) -> Self {
        Self {
            kind: SYNC_REQUEST_TYPE.to_string(),
            from: request.range_from,
            to: request.range_to,
            correlation_id: request.correlation_id.clone(),
            batch_size_hint,
            categories: scope.categories().map(<[CategoryId]>::to_vec),
        }
    }
}

/// Loose shape of every inbound frame. Field presence is validated by
/// [`InboundFrame::classify`], not by serde.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<Vec<Record>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncReply {
    Start {
        total: u64,
    },
    Batch {
        records: Vec<Record>,
        sent: Option<u64>,
        total: Option<u64>,
    },
    End {
        sent: Option<u64>,
        total: Option<u64>,
    },
    Failure {
        error: String,
    },
}

impl SyncReply {
    pub fn phase_label(&self) -> &'static str {
        match self {
            SyncReply::Start { .. } => "start",
            SyncReply::Batch { .. } => "batch",
            SyncReply::End { .. } => "end",
            SyncReply::Failure { .. } => "failure",
        }
    }
}

/// A sync reply paired with the correlation id it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedReply {
    pub correlation_id: String,
    pub reply: SyncReply,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Sync(RoutedReply),
    /// A well-formed frame of some other type; not ours to interpret.
    Other { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Decode(String),
    #[error("sync frame missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown sync phase '{0}'")]
    UnknownPhase(String),
}

impl InboundFrame {
    pub fn start(correlation_id: &str, total: u64) -> Self {
        Self {
            phase: Some("start".to_string()),
            total: Some(total),
            ..Self::empty(correlation_id)
        }
    }

    pub fn batch(correlation_id: &str, records: Vec<Record>, sent: u64, total: u64) -> Self {
        Self {
            phase: Some("batch".to_string()),
            batch: Some(records),
            sent: Some(sent),
            total: Some(total),
            ..Self::empty(correlation_id)
        }
    }

    pub fn end(correlation_id: &str, sent: u64, total: u64) -> Self {
        Self {
            phase: Some("end".to_string()),
            sent: Some(sent),
            total: Some(total),
            ..Self::empty(correlation_id)
        }
    }

    pub fn failure(correlation_id: &str, error: impl Into<String>) -> Self {
        Self {
            ok: Some(false),
            error: Some(error.into()),
            ..Self::empty(correlation_id)
        }
    }

    fn empty(correlation_id: &str) -> Self {
        Self {
            kind: SYNC_RESPONSE_TYPE.to_string(),
            correlation_id: Some(correlation_id.to_string()),
            phase: None,
            ok: None,
            error: None,
            total: None,
            sent: None,
            batch: None,
        }
    }

    pub fn classify(self) -> Result<Inbound, ProtocolError> {
        if self.kind != SYNC_RESPONSE_TYPE {
            return Ok(Inbound::Other { kind: self.kind });
        }
        let correlation_id = self
            .correlation_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(ProtocolError::MissingField("correlationId"))?;

        // An explicit failure wins over whatever phase the frame claims.
        if self.ok == Some(false) {
            let error = self
                .error
                .filter(|text| !text.trim().is_empty())
                .unwrap_or_else(|| "remote reported failure".to_string());
            return Ok(Inbound::Sync(RoutedReply {
                correlation_id,
                reply: SyncReply::Failure { error },
            }));
        }

        let phase = self.phase.ok_or(ProtocolError::MissingField("phase"))?;
        let reply = match phase.as_str() {
            "start" => SyncReply::Start {
                total: self.total.ok_or(ProtocolError::MissingField("total"))?,
            },
            "batch" => SyncReply::Batch {
                records: self.batch.ok_or(ProtocolError::MissingField("batch"))?,
                sent: self.sent,
                total: self.total,
            },
            "end" => SyncReply::End {
                sent: self.sent,
                total: self.total,
            },
            _ => return Err(ProtocolError::UnknownPhase(phase)),
        };

        Ok(Inbound::Sync(RoutedReply {
            correlation_id,
            reply,
        }))
    }
}

pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let frame: InboundFrame =
        serde_json::from_str(text).map_err(|err| ProtocolError::Decode(err.to_string()))?;
    frame.classify()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let raw = trim_line_ending(bytes);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

fn trim_line_ending(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

/// Incremental newline-delimited JSON splitter. Bad lines are reported and
/// skipped so one corrupt frame never stalls the stream.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    scanned: usize,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            scanned: 0,
            marker: PhantomData,
        }
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(offset) = self.pending[self.scanned..]
            .iter()
            .position(|byte| *byte == b'\n')
        {
            let line_end = self.scanned + offset;
            let line = trim_line_ending(&self.pending[consumed..line_end]);
            if !line.is_empty() {
                self.decode_line(line, &mut report);
            }
            consumed = line_end + 1;
            self.scanned = consumed;
        }
        self.pending.drain(..consumed);
        self.scanned = self.pending.len();

        // A partial line that is already too large can never become valid.
        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
            self.scanned = 0;
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let tail = std::mem::take(&mut self.pending);
        self.scanned = 0;
        let line = trim_line_ending(&tail);
        if !line.is_empty() {
            self.decode_line(line, &mut report);
        }
        report
    }

    fn decode_line(&self, line: &[u8], report: &mut DecodeReport<T>) {
        if line.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: line.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(line) {
            Ok(frame) => report.frames.push(frame),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}
