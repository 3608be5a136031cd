//! Pipeline orchestrator: input → plan → run every chunk → run summary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use cardpipe_shared::{CardpipeError, Mode, PipelineConfig, Result, RunId};

use crate::artifacts::{self, ArtifactLayout};
use crate::backoff::Backoff;
use crate::classify::Classifier;
use crate::generate::Generator;
use crate::invoke::Invoker;
use crate::planner;
use crate::retry::RetryPolicy;
use crate::runner::{ChunkReport, ChunkRunner, ChunkState};

// ---------------------------------------------------------------------------
// Job and result types
// ---------------------------------------------------------------------------

/// What to process in one run.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub mode: Mode,
    /// Input, output and raw-log base paths.
    pub layout: ArtifactLayout,
    /// Instruction document sent with every chunk.
    pub instruction: PathBuf,
}

/// Aggregate outcome of a run. Read-only once returned.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub mode: Mode,
    /// Chunks in the plan.
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// 1-based indices of failed chunks, ascending.
    pub failed_indices: Vec<usize>,
    /// Chunks skipped because their output already existed.
    pub skipped: Vec<usize>,
    /// Chunks left unprocessed by a cancellation.
    pub remaining: usize,
    pub cancelled: bool,
    /// Whether the input was split into chunk artifacts.
    pub chunked: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub chunks: Vec<ChunkReport>,
}

impl RunResult {
    fn empty(run_id: RunId, mode: Mode, chunked: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            mode,
            total: 0,
            succeeded: 0,
            failed: 0,
            failed_indices: Vec::new(),
            skipped: Vec::new(),
            remaining: 0,
            cancelled: false,
            chunked,
            started_at,
            finished_at: started_at,
            chunks: Vec::new(),
        }
    }

    /// True when nothing failed and the run was not cancelled.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait RunProgress: Send + Sync {
    /// Called once the plan is known.
    fn run_started(&self, mode: Mode, chunks: usize);
    /// Called on every chunk state transition.
    fn chunk_state(&self, index: usize, total: usize, state: ChunkState);
    /// Called when a chunk is skipped on resume.
    fn chunk_skipped(&self, index: usize, total: usize);
    /// Called when the run completes or is cancelled.
    fn done(&self, result: &RunResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl RunProgress for SilentProgress {
    fn run_started(&self, _mode: Mode, _chunks: usize) {}
    fn chunk_state(&self, _index: usize, _total: usize, _state: ChunkState) {}
    fn chunk_skipped(&self, _index: usize, _total: usize) {}
    fn done(&self, _result: &RunResult) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Sequential batch orchestrator, generic over the generation backend.
pub struct Pipeline<G> {
    generator: G,
    config: PipelineConfig,
    classifier: Classifier,
    cancel: Arc<AtomicBool>,
}

impl<G: Generator> Pipeline<G> {
    pub fn new(generator: G, config: PipelineConfig) -> Self {
        let classifier = Classifier::with_heuristics(config.heuristics.clone());
        Self {
            generator,
            config,
            classifier,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the classifier (custom retry table).
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Share an externally owned cancellation flag.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `job` to completion (or cancellation).
    ///
    /// 1. Read the instruction document
    /// 2. Plan chunks (an unreadable or malformed input aborts here)
    /// 3. Run every chunk in ascending order, recording failures
    /// 4. Tally the result
    #[instrument(skip_all, fields(mode = %job.mode, input = %job.layout.input.display()))]
    pub async fn run(&self, job: &JobSpec, progress: &dyn RunProgress) -> Result<RunResult> {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let chunked = self.config.chunk_size > 0;

        info!(%run_id, label = job.mode.label(), model = self.config.model.model_id(), "starting run");

        let instructions = std::fs::read_to_string(&job.instruction)
            .map_err(|e| CardpipeError::io(&job.instruction, e))?;

        let chunks = planner::plan(&job.layout, self.config.chunk_size)?;
        let mut result = RunResult::empty(run_id.clone(), job.mode, chunked, started_at);
        result.total = chunks.len();

        if chunks.is_empty() {
            warn!("nothing to process");
            result.finished_at = Utc::now();
            progress.done(&result);
            return Ok(result);
        }

        progress.run_started(job.mode, chunks.len());

        let backoff = Backoff::from(&self.config);
        let runner = ChunkRunner {
            invoker: Invoker::new(
                &self.generator,
                &self.classifier,
                RetryPolicy::new(self.config.inner_max_retries, backoff),
            ),
            classifier: &self.classifier,
            outer: RetryPolicy::new(self.config.max_retries, backoff),
            model: self.config.model.model_id(),
            schema: job.mode.schema(),
            instruction_path: &job.instruction,
            instructions: &instructions,
            total: chunks.len(),
            progress,
        };

        for (position, chunk) in chunks.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                result.cancelled = true;
                result.remaining = chunks.len() - position;
                warn!(
                    at_chunk = chunk.index,
                    remaining = result.remaining,
                    "run cancelled, remaining chunks left untouched"
                );
                break;
            }

            if self.config.resume && chunk.paths.output.exists() {
                info!(chunk = chunk.index, output = %chunk.paths.output.display(), "output exists, skipping");
                progress.chunk_skipped(chunk.index, chunks.len());
                result.skipped.push(chunk.index);
                continue;
            }

            let report = runner.run(chunk).await;
            if report.succeeded() {
                result.succeeded += 1;
            } else {
                result.failed += 1;
                result.failed_indices.push(chunk.index);
            }
            result.chunks.push(report);
        }

        // A cancellation raised while the last chunk was running.
        if !result.cancelled && self.cancel.load(Ordering::SeqCst) {
            result.cancelled = true;
            warn!("run cancelled during the final chunk");
        }

        result.finished_at = Utc::now();
        progress.done(&result);

        info!(
            %run_id,
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped.len(),
            cancelled = result.cancelled,
            elapsed_ms = (result.finished_at - result.started_at).num_milliseconds(),
            "run complete"
        );

        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Post-run helpers
// ---------------------------------------------------------------------------

/// Delete the chunk input artifacts of succeeded chunks.
///
/// Outputs and logs are never touched, and nothing is deleted for an
/// unchunked run (the input is the caller's source file).
pub fn cleanup_succeeded(result: &RunResult) -> Result<Vec<PathBuf>> {
    if !result.chunked {
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    for report in result.chunks.iter().filter(|r| r.succeeded()) {
        let path = &report.paths.input;
        match std::fs::remove_file(path) {
            Ok(()) => removed.push(path.clone()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CardpipeError::io(path, e)),
        }
    }
    info!(removed = removed.len(), "cleaned up chunk inputs");
    Ok(removed)
}

/// Write the run result as pretty JSON.
pub fn write_summary(path: &Path, result: &RunResult) -> Result<()> {
    artifacts::write_json(path, result)?;
    info!(path = %path.display(), "wrote run summary");
    Ok(())
}
