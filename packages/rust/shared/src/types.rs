//! Core domain types: run identifiers, operating modes, and record schemas.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CardpipeError;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one pipeline run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Operating mode: which instruction document is sent and which schema the
/// response must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    TagAuditor,
    GrammarExplain,
    ExtraGenerator,
    QuestionTagging,
}

impl Mode {
    pub const ALL: [Mode; 4] = [
        Mode::TagAuditor,
        Mode::GrammarExplain,
        Mode::ExtraGenerator,
        Mode::QuestionTagging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TagAuditor => "tag-auditor",
            Self::GrammarExplain => "grammar-explain",
            Self::ExtraGenerator => "extra-generator",
            Self::QuestionTagging => "question-tagging",
        }
    }

    /// Human-readable name used in run banners and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TagAuditor => "Tag Auditor",
            Self::GrammarExplain => "Grammar Explanation",
            Self::ExtraGenerator => "Extra Generator",
            Self::QuestionTagging => "Question Tagging",
        }
    }

    /// The record schema every output item must satisfy in this mode.
    pub fn schema(&self) -> SchemaKind {
        match self {
            Self::TagAuditor => SchemaKind::TagAudit,
            Self::QuestionTagging => SchemaKind::TagAdd,
            Self::GrammarExplain | Self::ExtraGenerator => SchemaKind::FieldUpdate,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = CardpipeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| CardpipeError::config(format!("unknown mode '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Model selection
// ---------------------------------------------------------------------------

/// Remote-service variant selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelChoice {
    #[default]
    Flash,
    Pro,
}

impl ModelChoice {
    /// The model identifier sent to the generation service.
    pub fn model_id(&self) -> &'static str {
        match self {
            Self::Flash => "gemini-2.5-flash",
            Self::Pro => "gemini-2.5-pro",
        }
    }
}

// ---------------------------------------------------------------------------
// Record schemas
// ---------------------------------------------------------------------------

/// The three output shapes. Field declaration order in the record structs
/// below is the canonical key order of the output artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaKind {
    /// `{noteId, oldTag, newTag}`
    TagAudit,
    /// `{noteId, newTag}`
    TagAdd,
    /// `{noteId, Extra}`
    FieldUpdate,
}

impl SchemaKind {
    /// Infer the schema from the keys of one record, if they match exactly one shape.
    pub fn detect(keys: &[&str]) -> Option<Self> {
        let has = |k: &str| keys.contains(&k);
        if !has("noteId") {
            return None;
        }
        match (has("oldTag"), has("newTag"), has("Extra")) {
            (true, true, false) => Some(Self::TagAudit),
            (false, true, false) => Some(Self::TagAdd),
            (false, false, true) => Some(Self::FieldUpdate),
            _ => None,
        }
    }
}

/// Replace one tag with another on a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagAudit {
    #[serde(rename = "noteId")]
    pub note_id: i64,
    #[serde(rename = "oldTag")]
    pub old_tag: String,
    #[serde(rename = "newTag")]
    pub new_tag: String,
}

/// Add (or replace the subject-level) tag on a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagUpdate {
    #[serde(rename = "noteId")]
    pub note_id: i64,
    #[serde(rename = "newTag")]
    pub new_tag: String,
}

/// Overwrite the free-text `Extra` field of a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraUpdate {
    #[serde(rename = "noteId")]
    pub note_id: i64,
    #[serde(rename = "Extra")]
    pub extra: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let s = id.to_string();
        let parsed: RunId = s.parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn mode_parses_cli_names() {
        for mode in Mode::ALL {
            let parsed: Mode = mode.as_str().parse().expect("parse mode");
            assert_eq!(parsed, mode);
        }
        assert!("summarize".parse::<Mode>().is_err());
    }

    #[test]
    fn grammar_and_extra_share_a_schema() {
        assert_eq!(Mode::GrammarExplain.schema(), SchemaKind::FieldUpdate);
        assert_eq!(Mode::ExtraGenerator.schema(), SchemaKind::FieldUpdate);
        assert_eq!(Mode::TagAuditor.schema(), SchemaKind::TagAudit);
        assert_eq!(Mode::QuestionTagging.schema(), SchemaKind::TagAdd);
    }

    #[test]
    fn record_serializes_in_declared_order() {
        let record = TagAudit {
            note_id: 7,
            old_tag: "MATH".into(),
            new_tag: "MATH::Algebra".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"noteId":7,"oldTag":"MATH","newTag":"MATH::Algebra"}"#);
    }

    #[test]
    fn schema_detection_from_keys() {
        assert_eq!(
            SchemaKind::detect(&["noteId", "oldTag", "newTag"]),
            Some(SchemaKind::TagAudit)
        );
        assert_eq!(
            SchemaKind::detect(&["newTag", "noteId"]),
            Some(SchemaKind::TagAdd)
        );
        assert_eq!(
            SchemaKind::detect(&["noteId", "Extra"]),
            Some(SchemaKind::FieldUpdate)
        );
        assert_eq!(SchemaKind::detect(&["noteId", "Extra", "newTag"]), None);
        assert_eq!(SchemaKind::detect(&["Extra"]), None);
    }

    #[test]
    fn model_choice_maps_to_model_ids() {
        assert_eq!(ModelChoice::Flash.model_id(), "gemini-2.5-flash");
        assert_eq!(ModelChoice::Pro.model_id(), "gemini-2.5-pro");
        assert_eq!(ModelChoice::default(), ModelChoice::Flash);
    }
}
