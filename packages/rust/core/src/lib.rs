//! Resilient batch pipeline for cardpipe.
//!
//! This crate partitions an item collection into chunks, drives each chunk
//! through the generation service under two stacked retry policies,
//! validates and canonicalises the responses, and tallies the run.

pub mod artifacts;
pub mod backoff;
pub mod classify;
pub mod generate;
pub mod invoke;
pub mod pipeline;
pub mod planner;
pub mod retry;
pub mod runner;
pub mod validate;

pub use artifacts::{ArtifactLayout, AuditEntry, ChunkPaths, MergeReport};
pub use backoff::Backoff;
pub use classify::{Cause, Classifier, RetryTable, Retryability};
pub use generate::{GeminiClient, GenerationRequest, Generator, build_prompt};
pub use invoke::Invoker;
pub use pipeline::{
    JobSpec, Pipeline, RunProgress, RunResult, SilentProgress, cleanup_succeeded, write_summary,
};
pub use planner::{Chunk, partition, plan, split_file};
pub use retry::{RetryFailure, RetryPolicy};
pub use runner::{AttemptOutcome, AttemptRecord, ChunkOutcome, ChunkReport, ChunkState};
pub use validate::{ValidatedPayload, strip_fences, validate};
