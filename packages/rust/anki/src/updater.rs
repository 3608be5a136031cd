//! Apply validated output artifacts to the flashcard store.
//!
//! Each `{prefix}-{k}.json` file is applied record by record. A file is
//! deleted only when every record in it was applied; anything else keeps the
//! file on disk for a later rerun.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use cardpipe_core::artifacts;
use cardpipe_shared::{CardpipeError, ExtraUpdate, Result, SchemaKind, TagAudit, TagUpdate};

use crate::client::AnkiClient;

/// Note field overwritten by free-text records.
const EXTRA_FIELD: &str = "Extra";

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What happened to one output file.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    /// Detected record shape, absent when the file could not be read.
    pub schema: Option<SchemaKind>,
    pub applied: usize,
    pub failed: usize,
    /// True when the file was removed after a clean apply.
    pub deleted: bool,
    /// Why the file was kept without applying anything.
    pub problem: Option<String>,
}

impl FileReport {
    fn kept(path: &Path, problem: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            schema: None,
            applied: 0,
            failed: 0,
            deleted: false,
            problem: Some(problem.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub files: Vec<FileReport>,
}

impl ApplyReport {
    pub fn applied(&self) -> usize {
        self.files.iter().map(|f| f.applied).sum()
    }

    pub fn failed(&self) -> usize {
        self.files.iter().map(|f| f.failed).sum()
    }

    /// Files left on disk for a rerun.
    pub fn kept(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| !f.deleted)
    }
}

// ---------------------------------------------------------------------------
// Schema detection
// ---------------------------------------------------------------------------

/// Detect the record shape of a file. Every entry must be an object of the
/// same shape; an empty collection has none.
pub fn detect_schema(entries: &[Value]) -> Option<SchemaKind> {
    let mut detected = None;
    for entry in entries {
        let keys: Vec<&str> = entry.as_object()?.keys().map(String::as_str).collect();
        let kind = SchemaKind::detect(&keys)?;
        match detected {
            None => detected = Some(kind),
            Some(seen) if seen != kind => return None,
            Some(_) => {}
        }
    }
    detected
}

/// Subject prefix of a tag: the part before the first `::`.
pub fn subject_of(tag: &str) -> &str {
    tag.split("::").next().unwrap_or(tag)
}

/// Reject subjects outside the configured list.
pub(crate) fn check_subject(subject: &str, subjects: &[String]) -> Result<()> {
    if subjects.iter().any(|s| s == subject) {
        Ok(())
    } else {
        Err(CardpipeError::invalid_input(format!(
            "subject '{subject}' is not one of {}",
            subjects.join(", ")
        )))
    }
}

/// Whether `tag` belongs to `subject` (`ENG` or `ENG::...`).
pub(crate) fn in_subject(tag: &str, subject: &str) -> bool {
    tag == subject
        || tag
            .strip_prefix(subject)
            .is_some_and(|rest| rest.starts_with("::"))
}

// ---------------------------------------------------------------------------
// Updater
// ---------------------------------------------------------------------------

/// Applies records through a bridge client.
pub struct Updater<'a> {
    client: &'a AnkiClient,
    subjects: &'a [String],
}

impl<'a> Updater<'a> {
    pub fn new(client: &'a AnkiClient, subjects: &'a [String]) -> Self {
        Self { client, subjects }
    }

    /// Apply every `{prefix}-{k}.json` file in `dir`, in numeric order.
    #[instrument(skip_all, fields(dir = %dir.display(), prefix = %prefix))]
    pub async fn apply_dir(&self, dir: &Path, prefix: &str) -> Result<ApplyReport> {
        let parts = artifacts::find_parts(dir, prefix)?;
        if parts.is_empty() {
            warn!("no output files found");
        }

        let mut report = ApplyReport::default();
        for (_, path) in parts {
            report.files.push(self.apply_file(&path).await);
        }

        info!(
            files = report.files.len(),
            applied = report.applied(),
            failed = report.failed(),
            kept = report.kept().count(),
            "apply finished"
        );
        Ok(report)
    }

    /// Apply one output file. Never returns an error: problems are folded
    /// into the report and the file is kept.
    pub async fn apply_file(&self, path: &Path) -> FileReport {
        let entries = match artifacts::read_json_array(path) {
            Ok(entries) if entries.is_empty() => {
                warn!(path = %path.display(), "empty output file, keeping it");
                return FileReport::kept(path, "empty file");
            }
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable output file, keeping it");
                return FileReport::kept(path, e.to_string());
            }
        };

        let Some(schema) = detect_schema(&entries) else {
            warn!(path = %path.display(), "entries do not share one record shape, keeping file");
            return FileReport::kept(path, "inconsistent record shape");
        };

        let mut report = FileReport {
            path: path.to_path_buf(),
            schema: Some(schema),
            applied: 0,
            failed: 0,
            deleted: false,
            problem: None,
        };

        for (i, entry) in entries.into_iter().enumerate() {
            match self.apply_entry(schema, entry).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(path = %path.display(), entry = i, error = %e, "record not applied");
                    report.failed += 1;
                }
            }
        }

        if report.failed == 0 {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    report.deleted = true;
                    info!(path = %path.display(), records = report.applied, "applied and removed");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "applied but could not remove file");
                }
            }
        } else {
            info!(
                path = %path.display(),
                applied = report.applied,
                failed = report.failed,
                "kept for retry"
            );
        }
        report
    }

    async fn apply_entry(&self, schema: SchemaKind, entry: Value) -> Result<()> {
        match schema {
            SchemaKind::TagAudit => self.replace_tag(&decode::<TagAudit>(entry)?).await,
            SchemaKind::TagAdd => self.tag_subject(&decode::<TagUpdate>(entry)?).await,
            SchemaKind::FieldUpdate => self.update_extra(&decode::<ExtraUpdate>(entry)?).await,
        }
    }

    async fn replace_tag(&self, record: &TagAudit) -> Result<()> {
        debug!(note = record.note_id, old = %record.old_tag, new = %record.new_tag, "replace tag");
        self.client
            .replace_tags(record.note_id, &record.old_tag, &record.new_tag)
            .await
    }

    /// Add a subject tag, replacing any existing tag of the same subject.
    async fn tag_subject(&self, record: &TagUpdate) -> Result<()> {
        let subject = subject_of(&record.new_tag);
        check_subject(subject, self.subjects)?;

        let current = self.client.note_tags(record.note_id).await?;
        if let Some(old) = current.iter().find(|t| in_subject(t, subject)) {
            debug!(note = record.note_id, old = %old, new = %record.new_tag, "replace subject tag");
            self.client.remove_tags(record.note_id, old).await?;
        } else {
            debug!(note = record.note_id, new = %record.new_tag, "add tag");
        }
        self.client.add_tags(record.note_id, &record.new_tag).await
    }

    async fn update_extra(&self, record: &ExtraUpdate) -> Result<()> {
        debug!(note = record.note_id, "update extra field");
        self.client
            .update_note_field(record.note_id, EXTRA_FIELD, &record.extra)
            .await
    }
}

fn decode<T: DeserializeOwned>(entry: Value) -> Result<T> {
    serde_json::from_value(entry)
        .map_err(|e| CardpipeError::invalid_input(format!("record does not match its shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::body_partial_json;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "result": result, "error": null }))
    }

    fn subjects() -> Vec<String> {
        ["ENG", "GK"].map(String::from).to_vec()
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cardpipe-apply-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn detect_requires_agreement() {
        let audit = json!({ "noteId": 1, "oldTag": "a", "newTag": "b" });
        let add = json!({ "noteId": 2, "newTag": "ENG" });
        let extra = json!({ "noteId": 3, "Extra": "x" });

        assert_eq!(detect_schema(&[audit.clone(), audit.clone()]), Some(SchemaKind::TagAudit));
        assert_eq!(detect_schema(&[add.clone()]), Some(SchemaKind::TagAdd));
        assert_eq!(detect_schema(&[extra.clone()]), Some(SchemaKind::FieldUpdate));
        assert_eq!(detect_schema(&[audit, add]), None);
        assert_eq!(detect_schema(&[extra, json!(5)]), None);
        assert_eq!(detect_schema(&[]), None);
    }

    #[test]
    fn subject_matching_is_prefix_aware() {
        assert_eq!(subject_of("ENG::Grammar::Tense"), "ENG");
        assert_eq!(subject_of("GK"), "GK");
        assert!(in_subject("ENG", "ENG"));
        assert!(in_subject("ENG::Vocab", "ENG"));
        assert!(!in_subject("ENGLISH", "ENG"));
        assert!(!in_subject("BENG::Poetry", "ENG"));
    }

    #[tokio::test]
    async fn clean_file_is_applied_and_removed() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({
            "action": "replaceTags",
            "params": { "tag_to_replace": "old", "replace_with_tag": "new" }
        })))
        .respond_with(ok(Value::Null))
        .expect(2)
        .mount(&server)
        .await;

        let dir = temp_dir();
        let file = dir.join("output-1.json");
        artifacts::write_json(
            &file,
            &json!([
                { "noteId": 1, "oldTag": "old", "newTag": "new" },
                { "noteId": 2, "oldTag": "old", "newTag": "new" }
            ]),
        )
        .unwrap();

        let client = AnkiClient::new(server.uri(), 6).unwrap();
        let subjects = subjects();
        let report = Updater::new(&client, &subjects)
            .apply_dir(&dir, "output")
            .await
            .unwrap();

        assert_eq!(report.applied(), 2);
        assert!(report.files[0].deleted);
        assert!(!file.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn partial_failure_keeps_file() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({
            "action": "updateNoteFields",
            "params": { "note": { "id": 1 } }
        })))
        .respond_with(ok(Value::Null))
        .mount(&server)
        .await;
        Mock::given(body_partial_json(json!({
            "action": "updateNoteFields",
            "params": { "note": { "id": 2 } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": null,
            "error": "note was not found: 2"
        })))
        .mount(&server)
        .await;

        let dir = temp_dir();
        let file = dir.join("output-1.json");
        artifacts::write_json(
            &file,
            &json!([{ "noteId": 1, "Extra": "a" }, { "noteId": 2, "Extra": "b" }]),
        )
        .unwrap();

        let client = AnkiClient::new(server.uri(), 6).unwrap();
        let subjects = subjects();
        let report = Updater::new(&client, &subjects).apply_file(&file).await;

        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.deleted);
        assert!(file.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn subject_tag_is_replaced() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({ "action": "notesInfo" })))
            .respond_with(ok(json!([{ "noteId": 4, "tags": ["pyq", "ENG::Old"], "fields": {} }])))
            .mount(&server)
            .await;
        Mock::given(body_partial_json(json!({
            "action": "removeTags",
            "params": { "notes": [4], "tags": "ENG::Old" }
        })))
        .respond_with(ok(Value::Null))
        .expect(1)
        .mount(&server)
        .await;
        Mock::given(body_partial_json(json!({
            "action": "addTags",
            "params": { "notes": [4], "tags": "ENG::Grammar" }
        })))
        .respond_with(ok(Value::Null))
        .expect(1)
        .mount(&server)
        .await;

        let client = AnkiClient::new(server.uri(), 6).unwrap();
        let subjects = subjects();
        let updater = Updater::new(&client, &subjects);
        updater
            .tag_subject(&TagUpdate {
                note_id: 4,
                new_tag: "ENG::Grammar".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn new_subject_tag_is_added_only() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({ "action": "notesInfo" })))
            .respond_with(ok(json!([{ "noteId": 4, "tags": ["BENG::Poetry"], "fields": {} }])))
            .mount(&server)
            .await;
        Mock::given(body_partial_json(json!({ "action": "removeTags" })))
            .respond_with(ok(Value::Null))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(body_partial_json(json!({ "action": "addTags" })))
            .respond_with(ok(Value::Null))
            .expect(1)
            .mount(&server)
            .await;

        let client = AnkiClient::new(server.uri(), 6).unwrap();
        let subjects = subjects();
        Updater::new(&client, &subjects)
            .tag_subject(&TagUpdate {
                note_id: 4,
                new_tag: "ENG".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_subject_is_rejected_without_calls() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({ "version": 6 })))
            .respond_with(ok(Value::Null))
            .expect(0)
            .mount(&server)
            .await;

        let client = AnkiClient::new(server.uri(), 6).unwrap();
        let subjects = subjects();
        let err = Updater::new(&client, &subjects)
            .tag_subject(&TagUpdate {
                note_id: 4,
                new_tag: "HIST::Medieval".into(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HIST"));
    }

    #[tokio::test]
    async fn mixed_and_empty_files_are_kept() {
        let server = MockServer::start().await;
        let dir = temp_dir();
        let mixed = dir.join("output-1.json");
        let empty = dir.join("output-2.json");
        let broken = dir.join("output-3.json");
        artifacts::write_json(
            &mixed,
            &json!([{ "noteId": 1, "Extra": "a" }, { "noteId": 2, "newTag": "ENG" }]),
        )
        .unwrap();
        artifacts::write_json(&empty, &json!([])).unwrap();
        std::fs::write(&broken, "[{").unwrap();

        let client = AnkiClient::new(server.uri(), 6).unwrap();
        let subjects = subjects();
        let report = Updater::new(&client, &subjects)
            .apply_dir(&dir, "output")
            .await
            .unwrap();

        assert_eq!(report.files.len(), 3);
        assert!(report.files.iter().all(|f| !f.deleted && f.problem.is_some()));
        assert!(mixed.exists() && empty.exists() && broken.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
