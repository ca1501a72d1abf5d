//! The recording interceptor: a transport decorator that records, replays or
//! passes calls through according to its [`InferenceMode`].

use async_trait::async_trait;

use crate::config::RecorderConfig;
use crate::error::{InferenceError, Result, StoreError};
use crate::fingerprint::Fingerprint;
use crate::mode::{CallAction, DivergencePolicy, InferenceMode};
use crate::normalize::{CanonicalRequest, Normalizer};
use crate::recording::{RecordedResponse, Recording};
use crate::request::{CompleteResponse, InferenceRequest, InferenceResponse, ResponseStream};
use crate::store::RecordingStore;
use crate::stream;
use crate::transport::InferenceTransport;

/// Wraps an [`InferenceTransport`] and routes every call through the
/// recording store.
///
/// The mode is fixed at construction. Several interceptors with different
/// modes or stores may coexist in one process.
#[derive(Debug)]
pub struct RecordingTransport<T> {
    inner: T,
    mode: InferenceMode,
    store: RecordingStore,
    normalizer: Normalizer,
    divergence: DivergencePolicy,
}

impl<T: InferenceTransport> RecordingTransport<T> {
    pub fn new(inner: T, mode: InferenceMode, store: RecordingStore) -> Self {
        Self {
            inner,
            mode,
            store,
            normalizer: Normalizer::default(),
            divergence: DivergencePolicy::default(),
        }
    }

    /// Builds an interceptor from loaded configuration.
    pub fn from_config(inner: T, config: &RecorderConfig) -> std::result::Result<Self, StoreError> {
        Ok(Self::new(inner, config.mode, config.store()?)
            .with_normalizer(config.normalizer())
            .with_divergence_policy(config.divergence))
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_divergence_policy(mut self, divergence: DivergencePolicy) -> Self {
        self.divergence = divergence;
        self
    }

    pub fn mode(&self) -> InferenceMode {
        self.mode
    }

    pub fn store(&self) -> &RecordingStore {
        &self.store
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    async fn forward_and_record(
        &self,
        request: InferenceRequest,
        canonical: CanonicalRequest,
        fingerprint: Fingerprint,
    ) -> Result<InferenceResponse> {
        match self.inner.perform(request).await {
            Ok(InferenceResponse::Complete(response)) => {
                let recording =
                    Recording::new(canonical, RecordedResponse::from_complete(&response));
                let endpoint = recording.request.endpoint.clone();
                if let Err(failure) = persist(&self.store, self.divergence, recording).await {
                    return Err(failure.into_error(fingerprint, Some(Box::new(response)), None));
                }
                tracing::info!(
                    fingerprint = %fingerprint.short(),
                    mode = %self.mode,
                    endpoint = %endpoint,
                    "recorded response"
                );
                Ok(InferenceResponse::Complete(response))
            }
            Ok(InferenceResponse::Stream(live)) => {
                let ResponseStream {
                    status,
                    headers,
                    chunks,
                } = live;
                let store = self.store.clone();
                let divergence = self.divergence;
                let persisted_headers = crate::request::persistable_headers(&headers);
                let chunks = stream::capture(chunks, move |captured| async move {
                    let chunk_count = captured.len();
                    let recording = Recording::new(
                        canonical,
                        RecordedResponse::Stream {
                            status,
                            headers: persisted_headers,
                            chunks: captured,
                        },
                    );
                    let endpoint = recording.request.endpoint.clone();
                    if let Err(failure) = persist(&store, divergence, recording).await {
                        return Err(failure.into_error(fingerprint, None, None));
                    }
                    tracing::info!(
                        fingerprint = %fingerprint.short(),
                        endpoint = %endpoint,
                        chunk_count,
                        "recorded stream"
                    );
                    Ok::<(), InferenceError>(())
                });
                Ok(InferenceResponse::Stream(ResponseStream {
                    status,
                    headers,
                    chunks,
                }))
            }
            Err(err) => {
                let Some(recorded) = RecordedResponse::from_error(&err) else {
                    return Err(err);
                };
                let recording = Recording::new(canonical, recorded);
                let endpoint = recording.request.endpoint.clone();
                if let Err(failure) = persist(&self.store, self.divergence, recording).await {
                    return Err(failure.into_error(fingerprint, None, Some(Box::new(err))));
                }
                tracing::info!(
                    fingerprint = %fingerprint.short(),
                    endpoint = %endpoint,
                    "recorded provider error"
                );
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<T: InferenceTransport> InferenceTransport for RecordingTransport<T> {
    async fn perform(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        if !self.mode.normalizes() {
            return self.inner.perform(request).await;
        }

        let canonical = match self.normalizer.normalize(&request) {
            Ok(canonical) => canonical,
            Err(err) if self.mode == InferenceMode::Replay => return Err(err),
            Err(err) => {
                tracing::warn!(mode = %self.mode, "forwarding without recording: {err}");
                return self.inner.perform(request).await;
            }
        };
        let fingerprint = Fingerprint::of(&canonical);

        let existing = if self.mode.consults_store() {
            load(&self.store, &fingerprint).await?
        } else {
            None
        };

        match self.mode.plan(existing.is_some()) {
            CallAction::Forward => self.inner.perform(request).await,
            CallAction::ForwardAndRecord => {
                self.forward_and_record(request, canonical, fingerprint).await
            }
            CallAction::ReplayMiss => {
                tracing::warn!(fingerprint = %fingerprint.short(), "no recording for request");
                Err(InferenceError::ReplayMiss {
                    summary: canonical.summary(),
                    fingerprint,
                })
            }
            CallAction::Replay => match existing {
                Some(recording) => {
                    tracing::debug!(
                        fingerprint = %fingerprint.short(),
                        kind = recording.response.kind(),
                        "replaying recording"
                    );
                    replay(recording)
                }
                None => Err(InferenceError::ReplayMiss {
                    summary: canonical.summary(),
                    fingerprint,
                }),
            },
        }
    }
}

/// Rebuilds the response a live call would have produced.
fn replay(recording: Recording) -> Result<InferenceResponse> {
    match recording.response {
        RecordedResponse::Complete {
            status,
            headers,
            body,
        } => Ok(InferenceResponse::Complete(CompleteResponse {
            status,
            headers,
            body,
        })),
        RecordedResponse::Stream {
            status,
            headers,
            chunks,
        } => Ok(InferenceResponse::Stream(ResponseStream {
            status,
            headers,
            chunks: stream::replay(&chunks)?,
        })),
        RecordedResponse::Error {
            status,
            message,
            body,
        } => Err(InferenceError::Provider {
            status,
            message,
            body,
        }),
    }
}

/// Why a capture was not persisted.
#[derive(Debug)]
enum PersistFailure {
    /// The stored recording differs and the policy forbids overwriting it.
    Diverged,
    Write(StoreError),
}

impl PersistFailure {
    fn into_error(
        self,
        fingerprint: Fingerprint,
        response: Option<Box<CompleteResponse>>,
        live_error: Option<Box<InferenceError>>,
    ) -> InferenceError {
        match self {
            PersistFailure::Diverged => InferenceError::Divergence {
                fingerprint,
                response,
                live_error,
            },
            PersistFailure::Write(source) => InferenceError::StoreWrite {
                fingerprint,
                source,
                response,
                live_error,
            },
        }
    }
}

/// Reads a recording on the blocking pool.
async fn load(store: &RecordingStore, fingerprint: &Fingerprint) -> Result<Option<Recording>> {
    let path = store.path_for(fingerprint);
    let store = store.clone();
    let fingerprint = fingerprint.clone();
    let recording = tokio::task::spawn_blocking(move || store.get(&fingerprint))
        .await
        .map_err(|err| StoreError::Io {
            path,
            source: std::io::Error::other(err),
        })??;
    Ok(recording)
}

/// Writes `recording` on the blocking pool, first checking it against any
/// recording already stored under the same fingerprint.
async fn persist(
    store: &RecordingStore,
    divergence: DivergencePolicy,
    recording: Recording,
) -> std::result::Result<(), PersistFailure> {
    let path = store.path_for(&recording.fingerprint);
    let store = store.clone();
    tokio::task::spawn_blocking(move || write_checked(&store, divergence, &recording))
        .await
        .unwrap_or_else(|err| {
            Err(PersistFailure::Write(StoreError::Io {
                path,
                source: std::io::Error::other(err),
            }))
        })
}

fn write_checked(
    store: &RecordingStore,
    divergence: DivergencePolicy,
    recording: &Recording,
) -> std::result::Result<(), PersistFailure> {
    let fingerprint = &recording.fingerprint;

    match store.get(fingerprint) {
        Ok(Some(previous)) if !previous.response.materially_matches(&recording.response) => {
            match divergence {
                DivergencePolicy::Warn => tracing::warn!(
                    fingerprint = %fingerprint,
                    path = %store.path_for(fingerprint).display(),
                    "captured response differs from the stored recording; overwriting, review the diff"
                ),
                DivergencePolicy::Fail => return Err(PersistFailure::Diverged),
            }
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(fingerprint = %fingerprint.short(), "replacing unreadable recording: {err}");
        }
    }

    store.put(fingerprint, recording).map_err(PersistFailure::Write)
}
