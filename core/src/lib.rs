//! Deterministic recording and replay of inference provider calls.
//!
//! Every outbound call goes through an [`InferenceTransport`]. Wrapping the
//! real transport in a [`RecordingTransport`] makes each call normalized,
//! fingerprinted, and then recorded to or replayed from a
//! [`RecordingStore`] according to the configured [`InferenceMode`].

// Library code reports through tracing and return values only.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod interceptor;
pub mod mode;
pub mod normalize;
pub mod recording;
pub mod request;
pub mod store;
pub mod stream;
pub mod transport;

pub use crate::config::{ConfigError, ConfigLoader, RecorderConfig};
pub use error::{InferenceError, Result, StoreError};
pub use fingerprint::Fingerprint;
pub use interceptor::RecordingTransport;
pub use mode::{CallAction, DivergencePolicy, InferenceMode};
pub use normalize::{CanonicalRequest, Normalizer};
pub use recording::{ChunkRecord, RecordedResponse, Recording};
pub use request::{ChunkStream, CompleteResponse, InferenceRequest, InferenceResponse, ResponseStream};
pub use store::RecordingStore;
pub use transport::{HttpTransport, InferenceTransport};
