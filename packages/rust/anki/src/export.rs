//! Deck export: flatten the notes of one deck into the pipeline's input
//! collection.

use std::path::Path;

use serde::Serialize;
use tracing::{info, instrument, warn};

use cardpipe_core::artifacts;
use cardpipe_shared::Result;

use crate::client::{AnkiClient, NoteInfo};

/// Option fields of a multiple-choice note, in order.
const OPTION_FIELDS: [&str; 4] = ["OP1", "OP2", "OP3", "OP4"];

/// One note as written to the input collection. Field order is the key
/// order of the exported JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedNote {
    #[serde(rename = "noteId")]
    pub note_id: i64,
    #[serde(rename = "SL")]
    pub sl: String,
    #[serde(rename = "Question")]
    pub question: String,
    #[serde(rename = "OP1")]
    pub op1: String,
    #[serde(rename = "OP2")]
    pub op2: String,
    #[serde(rename = "OP3")]
    pub op3: String,
    #[serde(rename = "OP4")]
    pub op4: String,
    /// Text of the option named by the note's answer index.
    #[serde(rename = "Answer")]
    pub answer: String,
    #[serde(rename = "Extra")]
    pub extra: String,
    #[serde(rename = "Video")]
    pub video: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
}

/// Flatten one note. Missing fields become empty strings.
pub fn flatten_note(note: &NoteInfo) -> ExportedNote {
    let field = |name: &str| note.field(name).unwrap_or_default().to_string();
    let index = field("Answer");

    ExportedNote {
        note_id: note.note_id,
        sl: field("SL"),
        question: field("Question"),
        op1: field(OPTION_FIELDS[0]),
        op2: field(OPTION_FIELDS[1]),
        op3: field(OPTION_FIELDS[2]),
        op4: field(OPTION_FIELDS[3]),
        answer: resolve_answer(note, &index),
        extra: field("Extra"),
        video: field("Video"),
        tags: note.tags.clone(),
    }
}

/// The answer field stores an option number; look up `OP{n}`.
fn resolve_answer(note: &NoteInfo, index: &str) -> String {
    let key = format!("OP{}", index.trim());
    match note.field(&key) {
        Some(text) if !index.trim().is_empty() => text.to_string(),
        _ => format!("Invalid Answer Index: '{index}'"),
    }
}

/// Search query selecting every note of a deck.
pub fn deck_query(deck: &str) -> String {
    format!("deck:\"{deck}\"")
}

/// Fetch every note of `deck`, flatten it, and write the collection to
/// `target`. Returns the number of notes written.
#[instrument(skip_all, fields(deck = %deck, target = %target.display()))]
pub async fn fetch_deck(client: &AnkiClient, deck: &str, target: &Path) -> Result<usize> {
    let ids = client.find_notes(&deck_query(deck)).await?;
    if ids.is_empty() {
        warn!("deck has no notes");
    }

    let notes = if ids.is_empty() {
        Vec::new()
    } else {
        client.notes_info(&ids).await?
    };
    let exported: Vec<ExportedNote> = notes.iter().map(flatten_note).collect();

    artifacts::write_json(target, &exported)?;
    info!(notes = exported.len(), "deck exported");
    Ok(exported.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::body_partial_json;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn note(value: serde_json::Value) -> NoteInfo {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn flatten_resolves_answer_option() {
        let n = note(json!({
            "noteId": 7,
            "tags": ["GK"],
            "fields": {
                "SL": { "value": "12" },
                "Question": { "value": "Capital of France?" },
                "OP1": { "value": "Rome" },
                "OP2": { "value": "Paris" },
                "OP3": { "value": "Berlin" },
                "OP4": { "value": "Madrid" },
                "Answer": { "value": "2" }
            }
        }));

        let flat = flatten_note(&n);
        assert_eq!(flat.answer, "Paris");
        assert_eq!(flat.extra, "");
        assert_eq!(flat.video, "");
        assert_eq!(flat.tags, vec!["GK"]);
    }

    #[test]
    fn flatten_reports_bad_answer_index() {
        let n = note(json!({
            "noteId": 7,
            "fields": { "OP1": { "value": "a" }, "Answer": { "value": "9" } }
        }));
        assert_eq!(flatten_note(&n).answer, "Invalid Answer Index: '9'");

        let blank = note(json!({ "noteId": 8, "fields": {} }));
        assert_eq!(flatten_note(&blank).answer, "Invalid Answer Index: ''");
    }

    #[test]
    fn exported_keys_keep_order() {
        let n = note(json!({ "noteId": 1, "fields": {} }));
        let text = serde_json::to_string(&flatten_note(&n)).unwrap();
        let order = [
            "noteId", "SL", "Question", "OP1", "OP2", "OP3", "OP4", "Answer", "Extra", "Video",
            "Tags",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|k| text.find(&format!("\"{k}\"")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn fetch_deck_writes_input_collection() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({
            "action": "findNotes",
            "params": { "query": "deck:\"Physics\"" }
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "result": [3], "error": null })),
        )
        .mount(&server)
        .await;
        Mock::given(body_partial_json(json!({
            "action": "notesInfo",
            "params": { "notes": [3] }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [{
                "noteId": 3,
                "tags": [],
                "fields": {
                    "Question": { "value": "Ünïcode?" },
                    "OP1": { "value": "yes" },
                    "Answer": { "value": "1" }
                }
            }],
            "error": null
        })))
        .mount(&server)
        .await;

        let dir = std::env::temp_dir().join(format!("cardpipe-fetch-{}", uuid::Uuid::now_v7()));
        let target = dir.join("input.json");
        let client = AnkiClient::new(server.uri(), 6).unwrap();

        let count = fetch_deck(&client, "Physics", &target).await.unwrap();
        assert_eq!(count, 1);

        let written = artifacts::read_json_array(&target).unwrap();
        assert_eq!(written[0]["noteId"], 3);
        assert_eq!(written[0]["Answer"], "yes");
        assert_eq!(written[0]["Question"], "Ünïcode?");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn fetch_empty_deck_skips_notes_info() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({ "action": "findNotes" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "result": [], "error": null })),
            )
            .mount(&server)
            .await;
        Mock::given(body_partial_json(json!({ "action": "notesInfo" })))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join(format!("cardpipe-fetch-{}", uuid::Uuid::now_v7()));
        let target = dir.join("input.json");
        let client = AnkiClient::new(server.uri(), 6).unwrap();

        assert_eq!(fetch_deck(&client, "Empty", &target).await.unwrap(), 0);
        assert!(artifacts::read_json_array(&target).unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
