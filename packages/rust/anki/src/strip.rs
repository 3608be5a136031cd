//! Subject tag cleanup: collapse `SUBJ::...` subtags back to the bare
//! subject tag.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use cardpipe_shared::Result;

use crate::client::AnkiClient;
use crate::export::deck_query;
use crate::updater::check_subject;

/// Outcome of [`strip_subject_tags`] for one subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StripReport {
    pub subject: String,
    /// Notes returned by the subtag search.
    pub matched: usize,
    /// Subtags removed across all notes.
    pub removed: usize,
    /// Notes that received the bare subject tag.
    pub added: usize,
    /// Notes where some bridge call failed.
    pub failed: usize,
}

/// Search query selecting notes of `deck` tagged below `subject`.
pub fn subtag_query(deck: &str, subject: &str) -> String {
    format!("{} tag:\"{subject}::*\"", deck_query(deck))
}

/// Remove every `subject::...` tag from the matching notes of `deck`, then
/// add the bare `subject` tag where it is missing.
#[instrument(skip_all, fields(deck = %deck, subject = %subject))]
pub async fn strip_subject_tags(
    client: &AnkiClient,
    deck: &str,
    subject: &str,
    subjects: &[String],
) -> Result<StripReport> {
    check_subject(subject, subjects)?;

    let mut report = StripReport {
        subject: subject.to_string(),
        ..StripReport::default()
    };

    let ids = client.find_notes(&subtag_query(deck, subject)).await?;
    if ids.is_empty() {
        debug!("no notes carry subtags");
        return Ok(report);
    }
    let notes = client.notes_info(&ids).await?;
    report.matched = notes.len();

    let prefix = format!("{subject}::");
    for note in &notes {
        let mut subtags: Vec<&str> = note
            .tags
            .iter()
            .map(String::as_str)
            .filter(|t| t.starts_with(&prefix))
            .collect();
        if subtags.is_empty() {
            continue;
        }
        subtags.sort_unstable();
        subtags.dedup();

        let mut ok = true;
        for tag in &subtags {
            match client.remove_tags(note.note_id, tag).await {
                Ok(()) => {
                    debug!(note = note.note_id, tag = %tag, "removed subtag");
                    report.removed += 1;
                }
                Err(e) => {
                    warn!(note = note.note_id, tag = %tag, error = %e, "could not remove subtag");
                    ok = false;
                }
            }
        }

        if !note.tags.iter().any(|t| t == subject) {
            match client.add_tags(note.note_id, subject).await {
                Ok(()) => report.added += 1,
                Err(e) => {
                    warn!(note = note.note_id, error = %e, "could not add subject tag");
                    ok = false;
                }
            }
        }

        if !ok {
            report.failed += 1;
        }
    }

    info!(
        matched = report.matched,
        removed = report.removed,
        added = report.added,
        failed = report.failed,
        "subject tags stripped"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use wiremock::matchers::body_partial_json;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "result": result, "error": null }))
    }

    fn subjects() -> Vec<String> {
        ["ENG", "GK"].map(String::from).to_vec()
    }

    #[test]
    fn query_targets_subtags_in_deck() {
        assert_eq!(subtag_query("Mixed", "ENG"), "deck:\"Mixed\" tag:\"ENG::*\"");
    }

    #[tokio::test]
    async fn subtags_are_removed_and_subject_added() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({
            "action": "findNotes",
            "params": { "query": "deck:\"Mixed\" tag:\"ENG::*\"" }
        })))
        .respond_with(ok(json!([1])))
        .mount(&server)
        .await;
        Mock::given(body_partial_json(json!({ "action": "notesInfo" })))
            .respond_with(ok(json!([{
                "noteId": 1,
                "tags": ["ENG::Grammar", "ENG::Vocab", "BENG::Poetry", "pyq"],
                "fields": {}
            }])))
            .mount(&server)
            .await;
        Mock::given(body_partial_json(json!({
            "action": "removeTags",
            "params": { "notes": [1], "tags": "ENG::Grammar" }
        })))
        .respond_with(ok(Value::Null))
        .expect(1)
        .mount(&server)
        .await;
        Mock::given(body_partial_json(json!({
            "action": "removeTags",
            "params": { "notes": [1], "tags": "ENG::Vocab" }
        })))
        .respond_with(ok(Value::Null))
        .expect(1)
        .mount(&server)
        .await;
        Mock::given(body_partial_json(json!({
            "action": "addTags",
            "params": { "notes": [1], "tags": "ENG" }
        })))
        .respond_with(ok(Value::Null))
        .expect(1)
        .mount(&server)
        .await;

        let client = AnkiClient::new(server.uri(), 6).unwrap();
        let report = strip_subject_tags(&client, "Mixed", "ENG", &subjects())
            .await
            .unwrap();

        assert_eq!(report.matched, 1);
        assert_eq!(report.removed, 2);
        assert_eq!(report.added, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn bare_tag_already_present_is_not_added() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({ "action": "findNotes" })))
            .respond_with(ok(json!([2])))
            .mount(&server)
            .await;
        Mock::given(body_partial_json(json!({ "action": "notesInfo" })))
            .respond_with(ok(json!([{
                "noteId": 2,
                "tags": ["GK", "GK::History"],
                "fields": {}
            }])))
            .mount(&server)
            .await;
        Mock::given(body_partial_json(json!({
            "action": "removeTags",
            "params": { "notes": [2], "tags": "GK::History" }
        })))
        .respond_with(ok(Value::Null))
        .expect(1)
        .mount(&server)
        .await;
        Mock::given(body_partial_json(json!({ "action": "addTags" })))
            .respond_with(ok(Value::Null))
            .expect(0)
            .mount(&server)
            .await;

        let client = AnkiClient::new(server.uri(), 6).unwrap();
        let report = strip_subject_tags(&client, "Mixed", "GK", &subjects())
            .await
            .unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(report.added, 0);
    }

    #[tokio::test]
    async fn empty_match_makes_no_further_calls() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({ "action": "findNotes" })))
            .respond_with(ok(json!([])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(body_partial_json(json!({ "action": "notesInfo" })))
            .respond_with(ok(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let client = AnkiClient::new(server.uri(), 6).unwrap();
        let report = strip_subject_tags(&client, "Mixed", "ENG", &subjects())
            .await
            .unwrap();

        assert_eq!(
            report,
            StripReport {
                subject: "ENG".into(),
                ..StripReport::default()
            }
        );
    }

    #[tokio::test]
    async fn unknown_subject_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({ "version": 6 })))
            .respond_with(ok(Value::Null))
            .expect(0)
            .mount(&server)
            .await;

        let client = AnkiClient::new(server.uri(), 6).unwrap();
        let err = strip_subject_tags(&client, "Mixed", "HIST", &subjects())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HIST"));
    }

    #[tokio::test]
    async fn failed_removal_counts_note_as_failed() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({ "action": "findNotes" })))
            .respond_with(ok(json!([3])))
            .mount(&server)
            .await;
        Mock::given(body_partial_json(json!({ "action": "notesInfo" })))
            .respond_with(ok(json!([{ "noteId": 3, "tags": ["ENG::Old"], "fields": {} }])))
            .mount(&server)
            .await;
        Mock::given(body_partial_json(json!({ "action": "removeTags" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": null,
                "error": "note was not found: 3"
            })))
            .mount(&server)
            .await;
        Mock::given(body_partial_json(json!({ "action": "addTags" })))
            .respond_with(ok(Value::Null))
            .mount(&server)
            .await;

        let client = AnkiClient::new(server.uri(), 6).unwrap();
        let report = strip_subject_tags(&client, "Mixed", "ENG", &subjects())
            .await
            .unwrap();

        assert_eq!(report.removed, 0);
        assert_eq!(report.added, 1);
        assert_eq!(report.failed, 1);
    }
}
