//! Request and response shapes exchanged with an inference transport.

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InferenceError;

/// Stream of raw response chunks as delivered by the transport.
pub type ChunkStream = BoxStream<'static, Result<Bytes, InferenceError>>;

/// An outbound call to an inference provider, as issued by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub method: String,
    pub url: String,
    /// Sent on the wire; never part of the fingerprint and never persisted.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl InferenceRequest {
    /// Builds a request carrying a JSON body.
    pub fn json(method: impl Into<String>, url: impl Into<String>, body: &Value) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    /// Shorthand for a JSON `POST`.
    pub fn post_json(url: impl Into<String>, body: &Value) -> Self {
        Self::json("POST", url, body)
    }

    /// Appends a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A fully buffered provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// An incrementally delivered provider response.
///
/// When produced by a recording interceptor, the capture is persisted only
/// once the stream has been polled to its end; dropping it early discards the
/// capture.
pub struct ResponseStream {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub chunks: ChunkStream,
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// What a transport hands back for a successful call.
#[derive(Debug)]
pub enum InferenceResponse {
    Complete(CompleteResponse),
    Stream(ResponseStream),
}

impl InferenceResponse {
    pub fn status(&self) -> u16 {
        match self {
            InferenceResponse::Complete(response) => response.status,
            InferenceResponse::Stream(stream) => stream.status,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, InferenceResponse::Stream(_))
    }

    /// Returns the complete response, or `None` for a stream.
    pub fn into_complete(self) -> Option<CompleteResponse> {
        match self {
            InferenceResponse::Complete(response) => Some(response),
            InferenceResponse::Stream(_) => None,
        }
    }

    /// Returns the stream, or `None` for a complete response.
    pub fn into_stream(self) -> Option<ResponseStream> {
        match self {
            InferenceResponse::Stream(stream) => Some(stream),
            InferenceResponse::Complete(_) => None,
        }
    }
}

/// Header names whose values must never be written to a recording.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "set-cookie",
    "cookie",
    "x-api-key",
    "api-key",
    "x-goog-api-key",
    "openai-organization",
];

/// Lower-cases header names and drops credential-bearing headers.
pub(crate) fn persistable_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .filter(|(name, _)| !SENSITIVE_HEADERS.contains(&name.as_str()))
        .collect()
}
