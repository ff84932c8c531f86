use crate::errors::AttractorError;
use crate::events::{ProgressEvent, ProgressSink, EVENT_STATUS_INGESTION_DECISION};
use crate::fsutil::atomic_write_json;
use crate::outcome::{Outcome, OutcomeStatus};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const META_INGESTED_FROM: &str = "ingested_from";

/// Parse a stage status payload (spec'd schema or the legacy
/// `outcome`+`details` shape) into an [`Outcome`]. Unknown top-level keys
/// are ignored; `status` is lowercased on read.
pub fn parse_status_payload(raw: &[u8]) -> Result<Outcome, String> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|error| format!("invalid JSON: {error}"))?;
    let object = value
        .as_object()
        .ok_or_else(|| "status payload must be a JSON object".to_string())?;

    let status_raw = object
        .get("status")
        .or_else(|| object.get("outcome"))
        .and_then(Value::as_str)
        .ok_or_else(|| "status payload is missing 'status'".to_string())?;
    let status = OutcomeStatus::parse(status_raw)
        .ok_or_else(|| format!("unknown status '{status_raw}'"))?;

    let failure_reason = object
        .get("failure_reason")
        .or_else(|| object.get("details"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let preferred_label = object
        .get("preferred_label")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let meta = object
        .get("meta")
        .and_then(Value::as_object)
        .map(to_btreemap)
        .unwrap_or_default();

    let context_updates = object
        .get("context_updates")
        .and_then(Value::as_object)
        .map(to_btreemap)
        .unwrap_or_default();

    Ok(Outcome {
        status,
        failure_reason,
        preferred_label,
        meta,
        context_updates,
    }
    .normalized())
}

fn to_btreemap(object: &Map<String, Value>) -> BTreeMap<String, Value> {
    object
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Canonical on-disk form. Serialization goes through the typed
/// [`Outcome`], so field order (and therefore the bytes) is stable across
/// repeated ingestion runs.
pub fn write_canonical_status(path: &Path, outcome: &Outcome) -> Result<(), AttractorError> {
    atomic_write_json(path, outcome)
}

/// Where a stage outcome was read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusSource {
    Canonical,
    Fallback(PathBuf),
    Missing,
}

pub struct StatusIngestion<'a> {
    pub canonical_path: PathBuf,
    pub fallback_paths: Vec<PathBuf>,
    pub run_id: &'a str,
    pub node_id: &'a str,
}

impl StatusIngestion<'_> {
    /// Resolve the authoritative outcome for a stage.
    ///
    /// The canonical `status.json` wins unconditionally. Otherwise the
    /// configured worktree fallbacks are tried in order; the first payload
    /// that parses and passes the ownership check is copied to the
    /// canonical path with a provenance marker, and a
    /// `status_ingestion_decision` event records the choice. Fallbacks
    /// never overwrite an existing canonical file.
    pub fn resolve(&self, sink: &ProgressSink) -> Result<(Option<Outcome>, StatusSource), AttractorError> {
        if let Ok(raw) = std::fs::read(&self.canonical_path) {
            match parse_status_payload(&raw) {
                Ok(outcome) => return Ok((Some(outcome), StatusSource::Canonical)),
                Err(reason) => {
                    sink.emit(self.decision_event("canonical_invalid", &reason, &self.canonical_path));
                }
            }
        }

        for fallback in &self.fallback_paths {
            let Ok(raw) = std::fs::read(fallback) else {
                continue;
            };
            let outcome = match parse_status_payload(&raw) {
                Ok(outcome) => outcome,
                Err(reason) => {
                    sink.emit(self.decision_event("fallback_invalid", &reason, fallback));
                    continue;
                }
            };
            if let Err(reason) = self.check_ownership(&raw) {
                sink.emit(self.decision_event("fallback_rejected", &reason, fallback));
                continue;
            }

            let mut imported = outcome;
            imported.meta.insert(
                META_INGESTED_FROM.to_string(),
                Value::String(fallback.display().to_string()),
            );
            write_canonical_status(&self.canonical_path, &imported)?;
            sink.emit(self.decision_event(
                "fallback_imported",
                "canonical status missing; imported worktree fallback",
                fallback,
            ));
            return Ok((Some(imported), StatusSource::Fallback(fallback.clone())));
        }

        Ok((None, StatusSource::Missing))
    }

    /// Ownership fields are optional, but when present they must match the
    /// stage that is ingesting. A stale payload from another run or node is
    /// never imported.
    fn check_ownership(&self, raw: &[u8]) -> Result<(), String> {
        let Ok(value) = serde_json::from_slice::<Value>(raw) else {
            return Err("unreadable payload".to_string());
        };
        let check = |key: &str, expected: &str| -> Result<(), String> {
            match value.get(key).and_then(Value::as_str) {
                Some(actual) if actual != expected => Err(format!(
                    "ownership mismatch: {key}={actual}, expected {expected}"
                )),
                _ => Ok(()),
            }
        };
        check("run_id", self.run_id)?;
        check("node_id", self.node_id)?;
        Ok(())
    }

    fn decision_event(&self, decision: &str, reason: &str, path: &Path) -> ProgressEvent {
        ProgressEvent::new(EVENT_STATUS_INGESTION_DECISION)
            .node(self.node_id)
            .field("decision", decision)
            .field("reason", reason)
            .field("path", path.display().to_string())
    }
}
