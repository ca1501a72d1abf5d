use std::io::Write;

use anyhow::{Context, bail};
use clap::Args;
use inference_recorder_core::{Fingerprint, RecorderConfig, Recording, RecordingStore};
use serde::Serialize;

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Emit one JSON array instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    pub fingerprint: String,
}

#[derive(Debug, Args)]
pub struct RemoveArgs {
    #[arg(required = true)]
    pub fingerprints: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ListEntry {
    fingerprint: String,
    kind: String,
    status: Option<u16>,
    method: Option<String>,
    endpoint: Option<String>,
    created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ListEntry {
    fn from_recording(recording: &Recording) -> Self {
        Self {
            fingerprint: recording.fingerprint.to_string(),
            kind: recording.response.kind().to_string(),
            status: Some(recording.response.status()),
            method: Some(recording.request.method.clone()),
            endpoint: Some(recording.request.endpoint.clone()),
            created_at: Some(recording.created_at.to_rfc3339()),
            error: None,
        }
    }

    fn unreadable(fingerprint: &Fingerprint, error: String) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            kind: "unreadable".to_string(),
            status: None,
            method: None,
            endpoint: None,
            created_at: None,
            error: Some(error),
        }
    }
}

fn open_store(config: &RecorderConfig) -> anyhow::Result<RecordingStore> {
    config.store().context("invalid recording store location")
}

fn parse_fingerprint(raw: &str) -> anyhow::Result<Fingerprint> {
    raw.trim()
        .trim_end_matches(".json")
        .parse()
        .with_context(|| format!("`{raw}` is not a recording fingerprint"))
}

pub fn print_config(config: &RecorderConfig, out: &mut impl Write) -> anyhow::Result<()> {
    writeln!(out, "mode:            {}", config.mode)?;
    writeln!(out, "store:           {}", config.store_dir().display())?;
    writeln!(out, "volatile fields: {}", config.volatile_fields.join(", "))?;
    writeln!(out, "float precision: {}", config.float_precision)?;
    writeln!(out, "divergence:      {:?}", config.divergence)?;
    Ok(())
}

pub fn list(config: &RecorderConfig, args: &ListArgs, out: &mut impl Write) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let entries: Vec<ListEntry> = store
        .fingerprints()?
        .iter()
        .map(|fingerprint| match store.get(fingerprint) {
            Ok(Some(recording)) => ListEntry::from_recording(&recording),
            Ok(None) => ListEntry::unreadable(fingerprint, "removed while listing".to_string()),
            Err(err) => ListEntry::unreadable(fingerprint, err.to_string()),
        })
        .collect();

    if args.json {
        serde_json::to_writer_pretty(&mut *out, &entries)?;
        writeln!(out)?;
        return Ok(());
    }

    if entries.is_empty() {
        writeln!(out, "no recordings in {}", store.dir().display())?;
        return Ok(());
    }
    for entry in &entries {
        match &entry.error {
            Some(error) => writeln!(out, "{}  unreadable  {error}", short(&entry.fingerprint))?,
            None => writeln!(
                out,
                "{}  {:<8} {:>3}  {} {}  {}",
                short(&entry.fingerprint),
                entry.kind,
                entry.status.unwrap_or_default(),
                entry.method.as_deref().unwrap_or_default(),
                entry.endpoint.as_deref().unwrap_or_default(),
                entry.created_at.as_deref().unwrap_or_default(),
            )?,
        }
    }
    writeln!(out, "{} recording(s) in {}", entries.len(), store.dir().display())?;
    Ok(())
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

pub fn show(config: &RecorderConfig, args: &ShowArgs, out: &mut impl Write) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let fingerprint = parse_fingerprint(&args.fingerprint)?;
    let Some(recording) = store.get(&fingerprint)? else {
        bail!("no recording for {fingerprint} in {}", store.dir().display());
    };
    serde_json::to_writer_pretty(&mut *out, &recording)?;
    writeln!(out)?;
    Ok(())
}

/// Problems found by [`verify`], one per recording.
#[derive(Debug, PartialEq)]
enum Finding {
    Unreadable(String),
    /// The stored request now normalizes to a different fingerprint.
    Stale(Fingerprint),
}

fn check(store: &RecordingStore, config: &RecorderConfig, fingerprint: &Fingerprint) -> Option<Finding> {
    let recording = match store.get(fingerprint) {
        Ok(Some(recording)) => recording,
        Ok(None) => return None,
        Err(err) => return Some(Finding::Unreadable(err.to_string())),
    };
    let canonical = match config.normalizer().normalize(&recording.request.to_request()) {
        Ok(canonical) => canonical,
        Err(err) => return Some(Finding::Unreadable(err.to_string())),
    };
    let current = Fingerprint::of(&canonical);
    (&current != fingerprint).then_some(Finding::Stale(current))
}

pub fn verify(config: &RecorderConfig, out: &mut impl Write) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let fingerprints = store.fingerprints()?;
    let mut problems = 0usize;
    for fingerprint in &fingerprints {
        match check(&store, config, fingerprint) {
            None => {}
            Some(Finding::Unreadable(reason)) => {
                problems += 1;
                writeln!(out, "unreadable {fingerprint}: {reason}")?;
            }
            Some(Finding::Stale(current)) => {
                problems += 1;
                writeln!(
                    out,
                    "stale      {fingerprint}: request now fingerprints as {current}; re-record it"
                )?;
            }
        }
    }

    writeln!(
        out,
        "checked {} recording(s) in {}: {problems} problem(s)",
        fingerprints.len(),
        store.dir().display()
    )?;
    if problems > 0 {
        bail!("{problems} recording(s) failed verification");
    }
    Ok(())
}

pub fn remove(config: &RecorderConfig, args: &RemoveArgs, out: &mut impl Write) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let fingerprints = args
        .fingerprints
        .iter()
        .map(|raw| parse_fingerprint(raw))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut missing = 0usize;
    for fingerprint in &fingerprints {
        if store.remove(fingerprint)? {
            tracing::info!(fingerprint = %fingerprint.short(), "recording removed");
            writeln!(out, "removed {fingerprint}")?;
        } else {
            missing += 1;
            writeln!(out, "not found {fingerprint}")?;
        }
    }
    if missing > 0 {
        bail!("{missing} recording(s) not found");
    }
    Ok(())
}
