//! Failure classification: retryable vs. terminal.
//!
//! Classification happens in two pure steps. [`Classifier::cause_of`] maps an
//! error to a [`Cause`] using the configured heuristics, then a [`RetryTable`]
//! maps the cause to a [`Retryability`]. Both steps can be swapped or extended
//! without touching the retry loops that consume them.

use std::collections::HashMap;

use cardpipe_shared::{CardpipeError, HeuristicsConfig};

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retryability {
    Retryable,
    Terminal,
}

impl Retryability {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable)
    }
}

/// Fine-grained failure category, the key of the [`RetryTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    /// Connection refused, timeout.
    Transport,
    /// 5xx from the generation service.
    ServerError,
    /// 4xx whose message hints at rate limiting, timeouts or connection trouble.
    ClientTransient,
    /// Any other 4xx.
    ClientError,
    /// Unparseable payload that looks cut off (or is suspiciously short).
    TruncatedPayload,
    /// Unparseable payload with no truncation signal.
    MalformedPayload,
    /// Parsed, but not an array.
    UnexpectedShape,
    /// Parsed, but an empty array.
    EmptyPayload,
    /// Schema failure mentioning a missing or required field.
    MissingField,
    /// Schema failure on a response too short to trust.
    UnderCount,
    /// Any other schema failure.
    SchemaMismatch,
    FileSystem,
    InvalidInput,
    Config,
    Bridge,
    Unknown,
}

/// Mapping of cause category to retryability. Causes without an entry are
/// terminal.
#[derive(Debug, Clone)]
pub struct RetryTable {
    entries: HashMap<Cause, Retryability>,
}

impl Default for RetryTable {
    fn default() -> Self {
        use Cause::*;
        use Retryability::*;
        Self::from_entries([
            (Transport, Retryable),
            (ServerError, Retryable),
            (ClientTransient, Retryable),
            (ClientError, Terminal),
            (TruncatedPayload, Retryable),
            (MalformedPayload, Terminal),
            (UnexpectedShape, Retryable),
            (EmptyPayload, Retryable),
            (MissingField, Retryable),
            (UnderCount, Retryable),
            (SchemaMismatch, Terminal),
            (FileSystem, Terminal),
            (InvalidInput, Terminal),
            (Config, Terminal),
            (Bridge, Terminal),
            (Unknown, Terminal),
        ])
    }
}

impl RetryTable {
    pub fn from_entries(entries: impl IntoIterator<Item = (Cause, Retryability)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Override one entry.
    pub fn set(&mut self, cause: Cause, retryability: Retryability) {
        self.entries.insert(cause, retryability);
    }

    pub fn lookup(&self, cause: Cause) -> Retryability {
        self.entries
            .get(&cause)
            .copied()
            .unwrap_or(Retryability::Terminal)
    }
}

/// Pure failure classifier.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    table: RetryTable,
    heuristics: HeuristicsConfig,
}

impl Classifier {
    pub fn new(table: RetryTable, heuristics: HeuristicsConfig) -> Self {
        Self { table, heuristics }
    }

    /// Default table with the given heuristics.
    pub fn with_heuristics(heuristics: HeuristicsConfig) -> Self {
        Self::new(RetryTable::default(), heuristics)
    }

    pub fn classify(&self, error: &CardpipeError) -> Retryability {
        self.table.lookup(self.cause_of(error))
    }

    /// Map an error to its cause category.
    pub fn cause_of(&self, error: &CardpipeError) -> Cause {
        let h = &self.heuristics;
        match error {
            CardpipeError::Transport { .. } => Cause::Transport,
            CardpipeError::Service { status, message } => match *status {
                500..=599 => Cause::ServerError,
                429 => Cause::ClientTransient,
                400..=499 if mentions_any(message, &h.client_retry_hints) => {
                    Cause::ClientTransient
                }
                400..=499 => Cause::ClientError,
                _ => Cause::Unknown,
            },
            CardpipeError::Parse {
                message,
                payload_len,
            } => {
                if *payload_len < h.min_payload_chars
                    || mentions_any(message, &h.parse_retry_keywords)
                {
                    Cause::TruncatedPayload
                } else {
                    Cause::MalformedPayload
                }
            }
            CardpipeError::Shape { .. } => Cause::UnexpectedShape,
            CardpipeError::EmptyPayload => Cause::EmptyPayload,
            CardpipeError::Schema {
                message,
                item_count,
            } => {
                if mentions_any(message, &h.schema_retry_keywords) {
                    Cause::MissingField
                } else if *item_count < h.min_items {
                    Cause::UnderCount
                } else {
                    Cause::SchemaMismatch
                }
            }
            CardpipeError::Io { .. } => Cause::FileSystem,
            CardpipeError::InvalidInput { .. } => Cause::InvalidInput,
            CardpipeError::Config { .. } => Cause::Config,
            CardpipeError::Bridge(_) => Cause::Bridge,
            CardpipeError::Unexpected(_) => Cause::Unknown,
        }
    }
}

/// Case-insensitive substring match against a keyword list.
fn mentions_any(message: &str, keywords: &[String]) -> bool {
    let lower = message.to_lowercase();
    keywords
        .iter()
        .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
}
