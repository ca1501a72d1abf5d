//! The persisted unit: one canonical request and what the provider answered.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InferenceError;
use crate::fingerprint::Fingerprint;
use crate::normalize::{CanonicalRequest, sorted};
use crate::request::{CompleteResponse, persistable_headers};

/// On-disk format version written by this crate.
pub const RECORDING_VERSION: u32 = 1;

/// Response fields that legitimately differ between two captures of the same
/// request and are ignored when looking for divergence.
const VOLATILE_RESPONSE_FIELDS: &[&str] = &["id", "created", "created_at", "system_fingerprint"];

/// A captured request/response pair keyed by its fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    #[serde(default = "default_version")]
    pub version: u32,
    pub fingerprint: Fingerprint,
    /// Informational only; never part of the fingerprint.
    pub created_at: DateTime<Utc>,
    pub request: CanonicalRequest,
    pub response: RecordedResponse,
}

fn default_version() -> u32 {
    RECORDING_VERSION
}

impl Recording {
    pub fn new(request: CanonicalRequest, response: RecordedResponse) -> Self {
        Self {
            version: RECORDING_VERSION,
            fingerprint: Fingerprint::of(&request),
            created_at: Utc::now(),
            request,
            response,
        }
    }
}

/// What the provider answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordedResponse {
    Complete {
        status: u16,
        #[serde(default)]
        headers: Vec<(String, String)>,
        body: Value,
    },
    Stream {
        status: u16,
        #[serde(default)]
        headers: Vec<(String, String)>,
        /// Chunks in arrival order, terminated by [`ChunkRecord::End`].
        chunks: Vec<ChunkRecord>,
    },
    /// A provider HTTP error; replayed as the same [`InferenceError::Provider`].
    Error {
        status: u16,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

/// One element of a captured chunk sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkRecord {
    Text { data: String },
    Binary { base64: String },
    End,
}

impl ChunkRecord {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => ChunkRecord::Text {
                data: text.to_string(),
            },
            Err(_) => ChunkRecord::Binary {
                base64: BASE64.encode(bytes),
            },
        }
    }

    /// Raw bytes of a data chunk; `None` for the terminal sentinel.
    pub fn to_bytes(&self) -> Option<Result<Bytes, base64::DecodeError>> {
        match self {
            ChunkRecord::Text { data } => Some(Ok(Bytes::from(data.clone()))),
            ChunkRecord::Binary { base64 } => Some(BASE64.decode(base64).map(Bytes::from)),
            ChunkRecord::End => None,
        }
    }
}

impl RecordedResponse {
    pub fn from_complete(response: &CompleteResponse) -> Self {
        RecordedResponse::Complete {
            status: response.status,
            headers: persistable_headers(&response.headers),
            body: response.body.clone(),
        }
    }

    /// Captures a provider error. Other errors are not recordable.
    pub fn from_error(error: &InferenceError) -> Option<Self> {
        match error {
            InferenceError::Provider {
                status,
                message,
                body,
            } => Some(RecordedResponse::Error {
                status: *status,
                message: message.clone(),
                body: body.clone(),
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RecordedResponse::Complete { .. } => "complete",
            RecordedResponse::Stream { .. } => "stream",
            RecordedResponse::Error { .. } => "error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            RecordedResponse::Complete { status, .. }
            | RecordedResponse::Stream { status, .. }
            | RecordedResponse::Error { status, .. } => *status,
        }
    }

    /// Checks the structural invariants a replayable recording must satisfy.
    pub fn validate(&self) -> Result<(), String> {
        let RecordedResponse::Stream { chunks, .. } = self else {
            return Ok(());
        };
        match chunks.iter().position(|chunk| *chunk == ChunkRecord::End) {
            None => Err("stream recording has no terminal end marker".to_string()),
            Some(pos) if pos + 1 != chunks.len() => {
                Err(format!("stream recording has chunks after the end marker at {pos}"))
            }
            Some(_) => Ok(()),
        }
    }

    /// True when both responses carry the same information, ignoring
    /// per-capture noise such as response ids, timestamps and the way a
    /// stream happened to be split into chunks.
    pub fn materially_matches(&self, other: &RecordedResponse) -> bool {
        match (self, other) {
            (
                RecordedResponse::Complete {
                    status: a_status,
                    body: a_body,
                    ..
                },
                RecordedResponse::Complete {
                    status: b_status,
                    body: b_body,
                    ..
                },
            ) => a_status == b_status && strip_volatile(a_body) == strip_volatile(b_body),
            (
                RecordedResponse::Stream {
                    status: a_status,
                    chunks: a_chunks,
                    ..
                },
                RecordedResponse::Stream {
                    status: b_status,
                    chunks: b_chunks,
                    ..
                },
            ) => a_status == b_status && stream_payloads(a_chunks) == stream_payloads(b_chunks),
            (
                RecordedResponse::Error {
                    status: a_status,
                    body: a_body,
                    ..
                },
                RecordedResponse::Error {
                    status: b_status,
                    body: b_body,
                    ..
                },
            ) => a_status == b_status && a_body.as_ref().map(strip_volatile) == b_body.as_ref().map(strip_volatile),
            _ => false,
        }
    }
}

fn strip_volatile(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut map = map.clone();
            for field in VOLATILE_RESPONSE_FIELDS {
                map.remove(*field);
            }
            sorted(&Value::Object(map))
        }
        other => sorted(other),
    }
}

#[derive(Debug, PartialEq)]
enum Payload {
    Json(Value),
    Raw(String),
}

/// Reassembles a chunk sequence and splits it into SSE `data:` payloads, so
/// two captures compare equal regardless of where the network cut chunks.
fn stream_payloads(chunks: &[ChunkRecord]) -> Vec<Payload> {
    let mut text = String::new();
    let mut payloads = Vec::new();
    for chunk in chunks {
        match chunk {
            ChunkRecord::Text { data } => text.push_str(data),
            ChunkRecord::Binary { base64 } => payloads.push(Payload::Raw(base64.clone())),
            ChunkRecord::End => {}
        }
    }
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        match serde_json::from_str::<Value>(data) {
            Ok(value) => payloads.push(Payload::Json(strip_volatile(&value))),
            Err(_) => payloads.push(Payload::Raw(data.to_string())),
        }
    }
    payloads
}
