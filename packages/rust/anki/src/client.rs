//! JSON-RPC client for the AnkiConnect bridge.
//!
//! Every call is a POST of `{action, version, params}`; the reply is
//! `{result, error}` and a non-null `error` means the action failed.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use cardpipe_shared::{AnkiConfig, CardpipeError, Result};

/// Default timeout for bridge calls.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Serialize)]
struct RequestBody<'a> {
    action: &'a str,
    version: u32,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// One field of a note as reported by `notesInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NoteField {
    #[serde(default)]
    pub value: String,
}

/// A note as reported by `notesInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NoteInfo {
    #[serde(rename = "noteId")]
    pub note_id: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fields: HashMap<String, NoteField>,
}

impl NoteInfo {
    /// Value of a field, if the note type has it.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|f| f.value.as_str())
    }
}

/// Client for a running AnkiConnect instance.
#[derive(Debug, Clone)]
pub struct AnkiClient {
    client: Client,
    url: String,
    version: u32,
}

impl AnkiClient {
    pub fn new(url: impl Into<String>, version: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| CardpipeError::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            version,
        })
    }

    pub fn from_config(config: &AnkiConfig) -> Result<Self> {
        Self::new(&config.url, config.version)
    }

    /// Issue one action and decode its `result`.
    pub async fn request<T: DeserializeOwned>(&self, action: &str, params: Value) -> Result<T> {
        let body = RequestBody {
            action,
            version: self.version,
            params,
        };
        debug!(action, "bridge request");

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    CardpipeError::transport(format!(
                        "could not connect to {}. Is Anki running with AnkiConnect installed?",
                        self.url
                    ))
                } else {
                    CardpipeError::transport(format!("{action}: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CardpipeError::service(
                status.as_u16(),
                format!("{action}: HTTP {status}"),
            ));
        }

        let reply: ResponseBody = response.json().await.map_err(|e| {
            CardpipeError::Unexpected(format!("{action}: undecodable bridge response: {e}"))
        })?;

        if let Some(error) = reply.error {
            return Err(CardpipeError::Bridge(format!("{action}: {error}")));
        }

        serde_json::from_value(reply.result).map_err(|e| {
            CardpipeError::Unexpected(format!("{action}: unexpected result shape: {e}"))
        })
    }

    /// Note ids matching a search query.
    pub async fn find_notes(&self, query: &str) -> Result<Vec<i64>> {
        self.request("findNotes", json!({ "query": query })).await
    }

    pub async fn notes_info(&self, notes: &[i64]) -> Result<Vec<NoteInfo>> {
        self.request("notesInfo", json!({ "notes": notes })).await
    }

    /// Current tags of one note (empty if the note is unknown).
    pub async fn note_tags(&self, note: i64) -> Result<Vec<String>> {
        Ok(self
            .notes_info(&[note])
            .await?
            .into_iter()
            .next()
            .map(|n| n.tags)
            .unwrap_or_default())
    }

    pub async fn add_tags(&self, note: i64, tags: &str) -> Result<()> {
        self.request::<Value>("addTags", json!({ "notes": [note], "tags": tags }))
            .await
            .map(drop)
    }

    pub async fn remove_tags(&self, note: i64, tags: &str) -> Result<()> {
        self.request::<Value>("removeTags", json!({ "notes": [note], "tags": tags }))
            .await
            .map(drop)
    }

    pub async fn replace_tags(&self, note: i64, old_tag: &str, new_tag: &str) -> Result<()> {
        self.request::<Value>(
            "replaceTags",
            json!({
                "notes": [note],
                "tag_to_replace": old_tag,
                "replace_with_tag": new_tag,
            }),
        )
        .await
        .map(drop)
    }

    /// Overwrite one field of a note.
    pub async fn update_note_field(&self, note: i64, field: &str, value: &str) -> Result<()> {
        self.request::<Value>(
            "updateNoteFields",
            json!({ "note": { "id": note, "fields": { field: value } } }),
        )
        .await
        .map(drop)
    }
}
