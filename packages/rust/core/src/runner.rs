//! Chunk runner: the outer invoke-and-validate retry layer.
//!
//! Per chunk the runner moves through
//! `Pending → Invoking → Validating → {Succeeded | RetryWait → Invoking | Failed}`.
//! Each outer attempt persists its raw text to a fresh attempt log before the
//! text is judged.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use cardpipe_shared::{CardpipeError, Result, SchemaKind};

use crate::artifacts::{self, ChunkPaths};
use crate::classify::{Classifier, Retryability};
use crate::generate::{GenerationRequest, Generator, build_prompt};
use crate::invoke::Invoker;
use crate::pipeline::RunProgress;
use crate::planner::Chunk;
use crate::retry::RetryPolicy;
use crate::validate::{self, ValidatedPayload};

// ---------------------------------------------------------------------------
// State and outcome types
// ---------------------------------------------------------------------------

/// Lifecycle state of one chunk, reported through [`RunProgress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Invoking,
    Validating,
    RetryWait,
    Succeeded,
    Failed,
}

/// Outcome of one outer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    TerminalFailure,
}

/// Append-only record of one outer attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Where the raw text of this attempt was persisted.
    pub raw_log: Option<PathBuf>,
    pub outcome: AttemptOutcome,
    /// Failure description, absent on success.
    pub cause: Option<String>,
}

/// Final outcome of a chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkOutcome {
    Succeeded {
        item_count: usize,
    },
    Failed {
        cause: String,
        retryability: Retryability,
    },
}

/// Everything the runner learned about one chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkReport {
    pub index: usize,
    pub paths: ChunkPaths,
    pub outcome: ChunkOutcome,
    pub attempts: Vec<AttemptRecord>,
}

impl ChunkReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ChunkOutcome::Succeeded { .. })
    }

    /// Raw log of the last attempt, for failure messages.
    pub fn last_raw_log(&self) -> Option<&Path> {
        self.attempts.last().and_then(|a| a.raw_log.as_deref())
    }
}

// ---------------------------------------------------------------------------
// ChunkRunner
// ---------------------------------------------------------------------------

/// Fixed inputs shared by every chunk of a run.
pub struct ChunkRunner<'a, G> {
    pub(crate) invoker: Invoker<'a, G>,
    pub(crate) classifier: &'a Classifier,
    pub(crate) outer: RetryPolicy,
    pub(crate) model: &'a str,
    pub(crate) schema: SchemaKind,
    pub(crate) instruction_path: &'a Path,
    pub(crate) instructions: &'a str,
    pub(crate) total: usize,
    pub(crate) progress: &'a dyn RunProgress,
}

impl<G: Generator> ChunkRunner<'_, G> {
    /// Drive one chunk to `Succeeded` or `Failed`. Never returns an error:
    /// every failure is folded into the report.
    #[instrument(skip_all, fields(chunk = chunk.index, total = self.total))]
    pub async fn run(&self, chunk: &Chunk) -> ChunkReport {
        self.progress
            .chunk_state(chunk.index, self.total, ChunkState::Pending);

        let records = Mutex::new(Vec::new());
        let result = self.drive(chunk, &records).await;
        let attempts = records.into_inner().unwrap_or_else(|e| e.into_inner());

        let outcome = match result {
            Ok(payload) => {
                info!(
                    items = payload.item_count,
                    attempts = attempts.len(),
                    output = %chunk.paths.output.display(),
                    "chunk succeeded"
                );
                self.progress
                    .chunk_state(chunk.index, self.total, ChunkState::Succeeded);
                ChunkOutcome::Succeeded {
                    item_count: payload.item_count,
                }
            }
            Err((error, retryability)) => {
                let raw_log = attempts
                    .last()
                    .and_then(|a| a.raw_log.as_ref())
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".into());
                error!(
                    cause = %error,
                    retryable = retryability.is_retryable(),
                    attempts = attempts.len(),
                    raw_log = %raw_log,
                    "chunk failed"
                );
                self.progress
                    .chunk_state(chunk.index, self.total, ChunkState::Failed);
                ChunkOutcome::Failed {
                    cause: error.to_string(),
                    retryability,
                }
            }
        };

        ChunkReport {
            index: chunk.index,
            paths: chunk.paths.clone(),
            outcome,
            attempts,
        }
    }

    async fn drive(
        &self,
        chunk: &Chunk,
        records: &Mutex<Vec<AttemptRecord>>,
    ) -> std::result::Result<ValidatedPayload, (CardpipeError, Retryability)> {
        let input_json = std::fs::read_to_string(&chunk.paths.input)
            .map_err(|e| (CardpipeError::io(&chunk.paths.input, e), Retryability::Terminal))?;

        let request = GenerationRequest {
            model: self.model.to_string(),
            prompt: build_prompt(
                &chunk.paths.input,
                &input_json,
                self.instruction_path,
                self.instructions,
            ),
        };

        let this = self;
        let request = &request;
        self.outer
            .run(self.classifier, "chunk", move |attempt| {
                this.attempt(chunk, request, attempt, records)
            })
            .await
            .map_err(|failure| (failure.error, failure.retryability))
    }

    /// One outer attempt: invoke, persist, validate, write.
    async fn attempt(
        &self,
        chunk: &Chunk,
        request: &GenerationRequest,
        attempt: u32,
        records: &Mutex<Vec<AttemptRecord>>,
    ) -> Result<ValidatedPayload> {
        let number = attempt + 1;
        if attempt > 0 {
            info!(attempt = number, of = self.outer.attempts(), "retrying chunk");
        }
        self.progress
            .chunk_state(chunk.index, self.total, ChunkState::Invoking);

        let raw = match self.invoker.invoke(request).await {
            Ok(raw) => raw,
            Err(failure) => {
                // No response text exists; keep the failure itself as this
                // attempt's artifact.
                let raw_log = self.persist(chunk, number, &format!("[no response] {failure}"));
                return Err(self.record_failure(chunk, records, number, raw_log, failure.error));
            }
        };

        let raw_log = self.persist(chunk, number, &raw);
        self.progress
            .chunk_state(chunk.index, self.total, ChunkState::Validating);

        let outcome = validate::validate(&raw, self.schema).and_then(|payload| {
            artifacts::write_atomic(&chunk.paths.output, &payload.canonical_json)?;
            Ok(payload)
        });

        match outcome {
            Ok(payload) => {
                lock(records).push(AttemptRecord {
                    attempt: number,
                    raw_log,
                    outcome: AttemptOutcome::Success,
                    cause: None,
                });
                Ok(payload)
            }
            Err(error) => Err(self.record_failure(chunk, records, number, raw_log, error)),
        }
    }

    /// Write the attempt log. A failed write is logged, not fatal.
    fn persist(&self, chunk: &Chunk, number: u32, raw: &str) -> Option<PathBuf> {
        match artifacts::write_attempt_log(&chunk.paths.log, number, raw) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(attempt = number, error = %e, "could not persist attempt log");
                None
            }
        }
    }

    fn record_failure(
        &self,
        chunk: &Chunk,
        records: &Mutex<Vec<AttemptRecord>>,
        number: u32,
        raw_log: Option<PathBuf>,
        error: CardpipeError,
    ) -> CardpipeError {
        let retryability = self.classifier.classify(&error);
        let log_display = raw_log
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".into());
        warn!(
            attempt = number,
            cause = %error,
            retryable = retryability.is_retryable(),
            raw_log = %log_display,
            "attempt failed"
        );

        lock(records).push(AttemptRecord {
            attempt: number,
            raw_log,
            outcome: if retryability.is_retryable() {
                AttemptOutcome::RetryableFailure
            } else {
                AttemptOutcome::TerminalFailure
            },
            cause: Some(error.to_string()),
        });

        if retryability.is_retryable() && number <= self.outer.max_retries {
            self.progress
                .chunk_state(chunk.index, self.total, ChunkState::RetryWait);
        }
        error
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
