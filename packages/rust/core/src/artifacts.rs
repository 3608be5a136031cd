//! On-disk artifact naming and file helpers.
//!
//! Every chunk owns three paths derived from its 1-based index, and every
//! outer attempt gets its own raw log that is never overwritten.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use cardpipe_shared::{CardpipeError, Result};

/// Highest numbered variant tried before giving up on a unique attempt log.
const MAX_ATTEMPT_LOG_VARIANTS: u32 = 10_000;

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Input, output and log paths of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChunkPaths {
    pub input: PathBuf,
    pub output: PathBuf,
    pub log: PathBuf,
}

/// Base paths of a run, from which per-chunk paths are derived.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    pub input: PathBuf,
    pub output: PathBuf,
    pub log: PathBuf,
}

impl ArtifactLayout {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, log: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            log: log.into(),
        }
    }

    /// Paths of chunk `index` (1-based): `{stem}-{index}.json|.log` beside
    /// each base path.
    pub fn chunk(&self, index: usize) -> ChunkPaths {
        ChunkPaths {
            input: indexed_path(&self.input, index, "json"),
            output: indexed_path(&self.output, index, "json"),
            log: indexed_path(&self.log, index, "log"),
        }
    }

    /// The base paths themselves, used when chunking is disabled.
    pub fn whole(&self) -> ChunkPaths {
        ChunkPaths {
            input: self.input.clone(),
            output: self.output.clone(),
            log: self.log.clone(),
        }
    }
}

/// `dir/stem.ext` → `dir/stem-{index}.{extension}`.
pub fn indexed_path(base: &Path, index: usize, extension: &str) -> PathBuf {
    base.with_file_name(format!("{}-{index}.{extension}", file_stem(base)))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Attempt logs
// ---------------------------------------------------------------------------

/// Candidate name for attempt `attempt` (1-based) and collision variant
/// `variant` (0 for the plain name).
fn attempt_log_candidate(log: &Path, attempt: u32, variant: u32) -> PathBuf {
    let stem = file_stem(log);
    let name = if variant == 0 {
        format!("{stem}.attempt{attempt}.log")
    } else {
        format!("{stem}.attempt{attempt}.{variant}.log")
    };
    log.with_file_name(name)
}

/// Persist the raw text of one attempt to a file that did not exist before.
///
/// Returns the path actually written.
pub fn write_attempt_log(log: &Path, attempt: u32, raw: &str) -> Result<PathBuf> {
    if let Some(parent) = log.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| CardpipeError::io(parent, e))?;
    }

    for variant in 0..MAX_ATTEMPT_LOG_VARIANTS {
        let path = attempt_log_candidate(log, attempt, variant);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(raw.as_bytes())
                    .map_err(|e| CardpipeError::io(&path, e))?;
                debug!(path = %path.display(), bytes = raw.len(), "wrote attempt log");
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(CardpipeError::io(&path, e)),
        }
    }

    Err(CardpipeError::io(
        attempt_log_candidate(log, attempt, MAX_ATTEMPT_LOG_VARIANTS),
        std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "no free attempt log name",
        ),
    ))
}

// ---------------------------------------------------------------------------
// JSON files
// ---------------------------------------------------------------------------

/// Write `content` via a temp file and rename, creating parent directories.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent).map_err(|e| CardpipeError::io(parent, e))?;
    }

    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{name}.tmp"));

    std::fs::write(&temp, content).map_err(|e| CardpipeError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| CardpipeError::io(path, e))?;
    Ok(())
}

/// Write a JSON value (pretty-printed, two-space indent).
pub fn write_json<T: serde::Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| CardpipeError::Unexpected(format!("JSON serialization failed: {e}")))?;
    write_atomic(path, &json)?;
    debug!(path = %path.display(), "wrote JSON file");
    Ok(())
}

/// Read a file that must contain a JSON array.
///
/// A missing file is a filesystem error; malformed JSON or a non-array is
/// invalid input.
pub fn read_json_array(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path).map_err(|e| CardpipeError::io(path, e))?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        CardpipeError::invalid_input(format!("invalid JSON in {}: {e}", path.display()))
    })?;
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(CardpipeError::invalid_input(format!(
            "{} must contain a JSON array",
            path.display()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Merge / audit
// ---------------------------------------------------------------------------

/// Outcome of [`merge_parts`].
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Parts merged, in the order they were read.
    pub merged: Vec<PathBuf>,
    /// Parts that could not be read, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    pub item_count: usize,
}

/// Find `{prefix}-{k}.json` files in `dir`, sorted by numeric `k`.
pub fn find_parts(dir: &Path, prefix: &str) -> Result<Vec<(usize, PathBuf)>> {
    let entries = std::fs::read_dir(dir).map_err(|e| CardpipeError::io(dir, e))?;
    let mut parts = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|e| CardpipeError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let index = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|digits| digits.parse::<usize>().ok());
        if let Some(index) = index {
            parts.push((index, entry.path()));
        }
    }

    parts.sort_by_key(|(index, _)| *index);
    Ok(parts)
}

/// Concatenate every `{prefix}-{k}.json` array in `dir` into `target`.
pub fn merge_parts(dir: &Path, prefix: &str, target: &Path) -> Result<MergeReport> {
    let mut report = MergeReport::default();
    let mut merged: Vec<Value> = Vec::new();

    for (_, path) in find_parts(dir, prefix)? {
        match read_json_array(&path) {
            Ok(items) => {
                debug!(path = %path.display(), items = items.len(), "merging part");
                merged.extend(items);
                report.merged.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable part");
                report.skipped.push((path, e.to_string()));
            }
        }
    }

    report.item_count = merged.len();
    if !report.merged.is_empty() {
        write_json(target, &merged)?;
        info!(
            target = %target.display(),
            parts = report.merged.len(),
            items = report.item_count,
            "merged parts"
        );
    }
    Ok(report)
}

/// Entry count of one JSON file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub path: PathBuf,
    /// Array length, or 0 when the file is unreadable or not an array.
    pub entries: usize,
}

/// Count entries in every `*.json` file in `dir`, oldest file first.
pub fn audit_dir(dir: &Path) -> Result<Vec<AuditEntry>> {
    let entries = std::fs::read_dir(dir).map_err(|e| CardpipeError::io(dir, e))?;
    let mut found = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|e| CardpipeError::io(dir, e))?;
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") || !path.is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.created().or_else(|_| m.modified()))
            .ok();
        let count = read_json_array(&path).map(|items| items.len()).unwrap_or(0);
        found.push((modified, path, count));
    }

    found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(found
        .into_iter()
        .map(|(_, path, entries)| AuditEntry { path, entries })
        .collect())
}
