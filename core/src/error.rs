//! Error taxonomy for intercepted inference calls.
//!
//! Store failures are kept apart from transport failures so an operator can
//! tell "the call worked but we failed to capture it" from "the call itself
//! failed".

use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::request::CompleteResponse;

/// Result type for interceptor and transport operations.
pub type Result<T> = std::result::Result<T, InferenceError>;

/// Errors surfaced by an [`InferenceTransport`](crate::InferenceTransport).
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The request could not be parsed into the expected shape.
    #[error("malformed inference request: {0}")]
    MalformedRequest(String),

    /// Replay mode found no recording for the request.
    #[error(
        "recording not found for fingerprint {fingerprint}: {summary}\n\
         Re-run with INFERENCE_TEST_MODE=record-if-missing to capture it."
    )]
    ReplayMiss {
        fingerprint: Fingerprint,
        summary: String,
    },

    /// The live call completed but its recording could not be persisted.
    #[error("captured response for {fingerprint} but failed to persist it: {source}")]
    StoreWrite {
        fingerprint: Fingerprint,
        #[source]
        source: StoreError,
        /// The live response, when the call produced a complete body.
        response: Option<Box<CompleteResponse>>,
        /// The provider error the live call returned, when it failed.
        live_error: Option<Box<InferenceError>>,
    },

    /// A fresh capture differs materially from the stored recording.
    #[error(
        "fingerprint {fingerprint} already holds a materially different response; \
         review the recording before overwriting it"
    )]
    Divergence {
        fingerprint: Fingerprint,
        response: Option<Box<CompleteResponse>>,
        live_error: Option<Box<InferenceError>>,
    },

    /// A recording could not be read back from the store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Network request failed.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The provider answered with a non-success status.
    #[error("provider error ({status}): {message}")]
    Provider {
        status: u16,
        message: String,
        body: Option<Value>,
    },

    /// The response stream failed while being read.
    #[error("stream error: {0}")]
    Stream(String),

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl InferenceError {
    /// Returns the live response carried by a persistence failure, if any.
    ///
    /// A [`StoreWrite`](Self::StoreWrite) or [`Divergence`](Self::Divergence)
    /// error means the network call already happened; callers that only care
    /// about the answer can recover it here.
    pub fn into_live_response(self) -> Option<CompleteResponse> {
        match self {
            InferenceError::StoreWrite { response, .. }
            | InferenceError::Divergence { response, .. } => response.map(|boxed| *boxed),
            _ => None,
        }
    }

    /// Returns the provider error the live call produced when a persistence
    /// failure hid it.
    pub fn into_live_error(self) -> Option<InferenceError> {
        match self {
            InferenceError::StoreWrite { live_error, .. }
            | InferenceError::Divergence { live_error, .. } => live_error.map(|boxed| *boxed),
            _ => None,
        }
    }

    /// True when the error originates from persistence rather than the network.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            InferenceError::StoreWrite { .. } | InferenceError::Store(_)
        )
    }
}

/// Errors from the file-backed recording store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem I/O error.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Recording file exists but cannot be trusted.
    #[error("recording corrupted at {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    /// `put` was asked to store a recording under a foreign key.
    #[error("fingerprint mismatch: key {expected}, recording carries {found}")]
    FingerprintMismatch {
        expected: Fingerprint,
        found: Fingerprint,
    },

    /// Suite name cannot be used as a directory.
    #[error("invalid suite name `{name}`: {reason}")]
    InvalidSuite { name: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
