//! File-backed recording store.
//!
//! One JSON file per fingerprint under a directory:
//!
//! ```text
//! <dir>/<fingerprint>.json
//! ```
//!
//! Writes go through a temp file in the same directory followed by fsync and
//! rename, so readers only ever observe a complete old or a complete new
//! recording.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::Builder;

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::recording::{RECORDING_VERSION, Recording};

const RECORDING_EXTENSION: &str = "json";
const TEMP_PREFIX: &str = ".";
const TEMP_SUFFIX: &str = ".tmp";
const MAX_SUITE_NAME_LEN: usize = 128;

/// Persistent mapping from fingerprint to recording.
///
/// Holds no state besides its directory, so independent instances (and
/// processes) pointed at the same directory observe each other's writes.
#[derive(Debug, Clone)]
pub struct RecordingStore {
    dir: PathBuf,
}

impl RecordingStore {
    /// Store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store for one named test suite, under `<root>/<suite>`.
    pub fn for_suite(root: impl AsRef<Path>, suite: &str) -> Result<Self, StoreError> {
        validate_suite_name(suite)?;
        Ok(Self::new(root.as_ref().join(suite)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORDING_EXTENSION}", fingerprint.as_str()))
    }

    /// Loads the recording for `fingerprint`, if one exists.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Recording>, StoreError> {
        let path = self.path_for(fingerprint);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let recording: Recording =
            serde_json::from_str(&contents).map_err(|err| StoreError::Corrupted {
                path: path.clone(),
                reason: err.to_string(),
            })?;

        if recording.version > RECORDING_VERSION {
            return Err(StoreError::Corrupted {
                path,
                reason: format!(
                    "recording version {} is newer than supported version {RECORDING_VERSION}",
                    recording.version
                ),
            });
        }
        if &recording.fingerprint != fingerprint {
            return Err(StoreError::Corrupted {
                path,
                reason: format!("file is named {fingerprint} but carries {}", recording.fingerprint),
            });
        }
        if let Err(reason) = recording.response.validate() {
            return Err(StoreError::Corrupted { path, reason });
        }

        Ok(Some(recording))
    }

    pub fn exists(&self, fingerprint: &Fingerprint) -> bool {
        self.path_for(fingerprint).is_file()
    }

    /// Atomically writes `recording` under `fingerprint`, replacing any
    /// previous recording.
    pub fn put(&self, fingerprint: &Fingerprint, recording: &Recording) -> Result<(), StoreError> {
        if &recording.fingerprint != fingerprint {
            return Err(StoreError::FingerprintMismatch {
                expected: fingerprint.clone(),
                found: recording.fingerprint.clone(),
            });
        }

        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut json = serde_json::to_string_pretty(recording)?;
        json.push('\n');

        let mut tmp = Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.dir)
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let tmp_path = tmp.path().to_path_buf();
        tmp.write_all(json.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|source| StoreError::Io {
                path: tmp_path,
                source,
            })?;

        let path = self.path_for(fingerprint);
        tmp.persist(&path).map_err(|err| StoreError::Io {
            path: path.clone(),
            source: err.error,
        })?;

        tracing::debug!(fingerprint = %fingerprint.short(), path = %path.display(), "recording stored");
        Ok(())
    }

    /// All fingerprints with a recording, sorted. Temp files and foreign
    /// files in the directory are ignored.
    pub fn fingerprints(&self) -> Result<Vec<Fingerprint>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut fingerprints = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORDING_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Ok(fingerprint) = stem.parse::<Fingerprint>() {
                fingerprints.push(fingerprint);
            }
        }
        fingerprints.sort();
        Ok(fingerprints)
    }

    /// Deletes the recording for `fingerprint`. Returns whether one existed.
    pub fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let path = self.path_for(fingerprint);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

/// Suite names become a single directory component.
pub fn validate_suite_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidSuite {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_SUITE_NAME_LEN {
        return Err(invalid("name is longer than 128 characters"));
    }
    if name == "." || name == ".." {
        return Err(invalid("name is a relative path component"));
    }
    if name.starts_with('.') {
        return Err(invalid("name must not start with `.`"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("only ASCII letters, digits, `-`, `_` and `.` are allowed"));
    }
    Ok(())
}
