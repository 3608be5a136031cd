//! Shared types, error model, and configuration for cardpipe.
//!
//! This crate is the foundation depended on by all other cardpipe crates.
//! It provides:
//! - [`CardpipeError`], the unified error type
//! - Domain types ([`Mode`], [`SchemaKind`], the record structs, [`RunId`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnkiConfig, AppConfig, DefaultsConfig, GeminiConfig, HeuristicsConfig, InstructionsConfig,
    PipelineConfig, RetryConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, resolve_api_key,
};
pub use error::{CardpipeError, ErrorKind, Result};
pub use types::{ExtraUpdate, Mode, ModelChoice, RunId, SchemaKind, TagAudit, TagUpdate};
