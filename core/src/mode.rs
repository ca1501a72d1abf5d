//! Operating modes and the per-call decision they imply.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the interceptor treats each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InferenceMode {
    /// Pass through to the provider; the store is never touched.
    Live,
    /// Always call the provider and persist the result.
    Record,
    /// Serve only from recordings; a miss is an error.
    #[default]
    Replay,
    /// Replay when a recording exists, otherwise call and record.
    #[serde(alias = "record_if_missing")]
    RecordIfMissing,
}

/// What to do with a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    Forward,
    ForwardAndRecord,
    Replay,
    ReplayMiss,
}

impl InferenceMode {
    pub const ALL: [InferenceMode; 4] = [
        InferenceMode::Live,
        InferenceMode::Record,
        InferenceMode::Replay,
        InferenceMode::RecordIfMissing,
    ];

    /// Resolves the action for a call whose recording does or does not exist.
    pub fn plan(self, recording_exists: bool) -> CallAction {
        match (self, recording_exists) {
            (InferenceMode::Live, _) => CallAction::Forward,
            (InferenceMode::Record, _) => CallAction::ForwardAndRecord,
            (InferenceMode::Replay, true) => CallAction::Replay,
            (InferenceMode::Replay, false) => CallAction::ReplayMiss,
            (InferenceMode::RecordIfMissing, true) => CallAction::Replay,
            (InferenceMode::RecordIfMissing, false) => CallAction::ForwardAndRecord,
        }
    }

    /// Whether the store must be checked before deciding.
    pub fn consults_store(self) -> bool {
        matches!(self, InferenceMode::Replay | InferenceMode::RecordIfMissing)
    }

    /// Whether calls are normalized at all.
    pub fn normalizes(self) -> bool {
        self != InferenceMode::Live
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InferenceMode::Live => "live",
            InferenceMode::Record => "record",
            InferenceMode::Replay => "replay",
            InferenceMode::RecordIfMissing => "record-if-missing",
        }
    }
}

impl fmt::Display for InferenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown inference mode `{0}` (expected live, record, replay or record-if-missing)")]
pub struct UnknownMode(pub String);

impl FromStr for InferenceMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "live" => Ok(InferenceMode::Live),
            "record" => Ok(InferenceMode::Record),
            "replay" => Ok(InferenceMode::Replay),
            "record-if-missing" => Ok(InferenceMode::RecordIfMissing),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

/// What to do when a fresh capture differs from the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DivergencePolicy {
    /// Overwrite and log a warning.
    #[default]
    Warn,
    /// Keep the existing recording and surface an error.
    Fail,
}

impl FromStr for DivergencePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(DivergencePolicy::Warn),
            "fail" => Ok(DivergencePolicy::Fail),
            other => Err(format!("unknown divergence policy `{other}` (expected warn or fail)")),
        }
    }
}
