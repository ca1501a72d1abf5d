//! The seam between callers and an inference provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::error::{InferenceError, Result};
use crate::request::{CompleteResponse, InferenceRequest, InferenceResponse, ResponseStream};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const EVENT_STREAM: &str = "text/event-stream";

/// Performs an inference call.
///
/// The recording interceptor implements this trait too, so callers cannot
/// tell a live transport from a replaying one.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    async fn perform(&self, request: InferenceRequest) -> Result<InferenceResponse>;
}

#[async_trait]
impl<T: InferenceTransport + ?Sized> InferenceTransport for Arc<T> {
    async fn perform(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        (**self).perform(request).await
    }
}

/// Transport that talks to a real provider over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InferenceTransport for HttpTransport {
    async fn perform(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                InferenceError::MalformedRequest(format!("invalid method `{}`", request.method))
            })?;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                InferenceError::MalformedRequest(format!("invalid header name `{name}`"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                InferenceError::MalformedRequest(format!("invalid value for header `{name}`"))
            })?;
            headers.append(name, value);
        }

        tracing::debug!(method = %method, url = %request.url, "sending inference request");
        let response = self
            .client
            .request(method, &request.url)
            .headers(headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let response_headers = header_pairs(response.headers());

        if !status.is_success() {
            let text = response.text().await.map_err(|err| {
                tracing::warn!(status = status.as_u16(), "failed to read provider error body: {err}");
                InferenceError::Network(err)
            })?;
            let body = serde_json::from_str::<Value>(&text).ok();
            let message = body
                .as_ref()
                .and_then(error_message)
                .unwrap_or_else(|| text.trim().to_string());
            return Err(InferenceError::Provider {
                status: status.as_u16(),
                message,
                body,
            });
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with(EVENT_STREAM));

        if is_stream {
            let chunks = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|err| InferenceError::Stream(err.to_string())))
                .boxed();
            return Ok(InferenceResponse::Stream(ResponseStream {
                status: status.as_u16(),
                headers: response_headers,
                chunks,
            }));
        }

        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|err| InferenceError::Decode(format!("response is not JSON: {err}")))?
        };
        Ok(InferenceResponse::Complete(CompleteResponse {
            status: status.as_u16(),
            headers: response_headers,
            body,
        }))
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

/// Pulls the human-readable message out of common provider error shapes:
/// `{"error": {"message": ...}}`, `{"error": "..."}` and `{"message": ...}`.
fn error_message(body: &Value) -> Option<String> {
    let error = body.get("error");
    error
        .and_then(|error| error.get("message"))
        .or_else(|| error.filter(|error| error.is_string()))
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
