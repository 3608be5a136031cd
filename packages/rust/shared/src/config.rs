//! Application configuration for cardpipe.
//!
//! User config lives at `~/.cardpipe/cardpipe.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CardpipeError, Result};
use crate::types::{Mode, ModelChoice};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "cardpipe.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".cardpipe";

// ---------------------------------------------------------------------------
// Config structs (matching cardpipe.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Generation service settings.
    #[serde(default)]
    pub gemini: GeminiConfig,

    /// Retry budgets and backoff envelope.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Payload-retryability heuristics.
    #[serde(default)]
    pub heuristics: HeuristicsConfig,

    /// Default instruction documents per mode.
    #[serde(default)]
    pub instructions: InstructionsConfig,

    /// Flashcard store bridge settings.
    #[serde(default)]
    pub anki: AnkiConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Input collection path.
    #[serde(default = "default_input")]
    pub input: PathBuf,

    /// Canonical output path.
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Raw response log path.
    #[serde(default = "default_log")]
    pub log: PathBuf,

    /// Items per chunk; 0 disables chunking.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Model variant.
    #[serde(default)]
    pub model: ModelChoice,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            input: default_input(),
            output: default_output(),
            log: default_log(),
            chunk_size: default_chunk_size(),
            model: ModelChoice::default(),
        }
    }
}

fn default_input() -> PathBuf {
    PathBuf::from("data/input/input.json")
}
fn default_output() -> PathBuf {
    PathBuf::from("data/output/output.json")
}
fn default_log() -> PathBuf {
    PathBuf::from("data/output/output_raw.log")
}
fn default_chunk_size() -> usize {
    25
}

/// `[gemini]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the generation API.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl GeminiConfig {
    /// Parse the configured endpoint.
    pub fn endpoint_url(&self) -> Result<Url> {
        Url::parse(&self.endpoint).map_err(|e| {
            CardpipeError::config(format!("invalid gemini endpoint '{}': {e}", self.endpoint))
        })
    }
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".into()
}
fn default_endpoint() -> String {
    "https://generativelanguage.googleapis.com".into()
}
fn default_timeout_secs() -> u64 {
    300
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Outer (invoke + validate) retry budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Inner (transport) retry budget per outer attempt.
    #[serde(default = "default_inner_max_retries")]
    pub inner_max_retries: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl RetryConfig {
    /// Reject delays and factors that cannot form a backoff envelope.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("base_delay_secs", self.base_delay_secs),
            ("max_delay_secs", self.max_delay_secs),
        ] {
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(CardpipeError::config(format!(
                    "retry.{name} must be a finite, non-negative number of seconds, got {value}"
                )));
            }
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(CardpipeError::config(format!(
                "retry.backoff_factor must be at least 1.0, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            inner_max_retries: default_inner_max_retries(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_inner_max_retries() -> u32 {
    2
}
fn default_base_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    60.0
}
fn default_backoff_factor() -> f64 {
    2.0
}

/// `[heuristics]` section.
///
/// These thresholds come from observed behaviour of the generation service,
/// not from a documented contract. Tune them if the service changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicsConfig {
    /// Cleaned payloads shorter than this are treated as truncated.
    #[serde(default = "default_min_payload_chars")]
    pub min_payload_chars: usize,

    /// Schema failures on responses with fewer items than this are treated
    /// as truncated.
    #[serde(default = "default_min_items")]
    pub min_items: usize,

    /// Parse-error message fragments that indicate a truncated response.
    #[serde(default = "default_parse_retry_keywords")]
    pub parse_retry_keywords: Vec<String>,

    /// Schema-error message fragments that indicate a dropped field.
    #[serde(default = "default_schema_retry_keywords")]
    pub schema_retry_keywords: Vec<String>,

    /// 4xx message fragments that still indicate a transient condition.
    #[serde(default = "default_client_retry_hints")]
    pub client_retry_hints: Vec<String>,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            min_payload_chars: default_min_payload_chars(),
            min_items: default_min_items(),
            parse_retry_keywords: default_parse_retry_keywords(),
            schema_retry_keywords: default_schema_retry_keywords(),
            client_retry_hints: default_client_retry_hints(),
        }
    }
}

fn default_min_payload_chars() -> usize {
    10
}
fn default_min_items() -> usize {
    3
}
fn default_parse_retry_keywords() -> Vec<String> {
    ["eof while parsing", "unexpected", "truncated", "incomplete", "malformed"]
        .map(String::from)
        .to_vec()
}
fn default_schema_retry_keywords() -> Vec<String> {
    ["missing field", "required field", "invalid type: null"]
        .map(String::from)
        .to_vec()
}
fn default_client_retry_hints() -> Vec<String> {
    ["rate limit", "429", "resource exhausted", "timeout", "connection"]
        .map(String::from)
        .to_vec()
}

/// `[instructions]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionsConfig {
    #[serde(default = "default_tag_auditor_instruction")]
    pub tag_auditor: PathBuf,
    #[serde(default = "default_grammar_explain_instruction")]
    pub grammar_explain: PathBuf,
    #[serde(default = "default_extra_generator_instruction")]
    pub extra_generator: PathBuf,
    #[serde(default = "default_question_tagging_instruction")]
    pub question_tagging: PathBuf,
}

impl Default for InstructionsConfig {
    fn default() -> Self {
        Self {
            tag_auditor: default_tag_auditor_instruction(),
            grammar_explain: default_grammar_explain_instruction(),
            extra_generator: default_extra_generator_instruction(),
            question_tagging: default_question_tagging_instruction(),
        }
    }
}

impl InstructionsConfig {
    /// The instruction document used for `mode` when none is given on the CLI.
    pub fn for_mode(&self, mode: Mode) -> &Path {
        match mode {
            Mode::TagAuditor => &self.tag_auditor,
            Mode::GrammarExplain => &self.grammar_explain,
            Mode::ExtraGenerator => &self.extra_generator,
            Mode::QuestionTagging => &self.question_tagging,
        }
    }
}

fn default_tag_auditor_instruction() -> PathBuf {
    PathBuf::from("instructions/tag-auditor.md")
}
fn default_grammar_explain_instruction() -> PathBuf {
    PathBuf::from("instructions/grammar-explain.md")
}
fn default_extra_generator_instruction() -> PathBuf {
    PathBuf::from("instructions/extra-generator.md")
}
fn default_question_tagging_instruction() -> PathBuf {
    PathBuf::from("instructions/question-tagging.md")
}

/// `[anki]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnkiConfig {
    /// Bridge endpoint.
    #[serde(default = "default_anki_url")]
    pub url: String,

    /// Bridge protocol version.
    #[serde(default = "default_anki_version")]
    pub version: u32,

    /// Deck exported by `fetch`.
    #[serde(default = "default_deck")]
    pub deck: String,

    /// Subject prefixes accepted by tag-add records.
    #[serde(default = "default_subjects")]
    pub subjects: Vec<String>,

    /// Directory scanned by `apply` for `output-*.json` files.
    #[serde(default = "default_anki_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for AnkiConfig {
    fn default() -> Self {
        Self {
            url: default_anki_url(),
            version: default_anki_version(),
            deck: default_deck(),
            subjects: default_subjects(),
            output_dir: default_anki_output_dir(),
        }
    }
}

fn default_anki_url() -> String {
    "http://localhost:8765".into()
}
fn default_anki_version() -> u32 {
    6
}
fn default_deck() -> String {
    "_Custom Study Session".into()
}
fn default_subjects() -> Vec<String> {
    ["ENG", "BENG", "MATH", "GK", "GI"].map(String::from).to_vec()
}
fn default_anki_output_dir() -> PathBuf {
    PathBuf::from("data/output")
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, merged from config file + CLI flags and
/// handed to the orchestrator at construction.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Partition width; 0 disables chunking.
    pub chunk_size: usize,
    /// Outer attempt budget (attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Inner transport attempt budget per outer attempt.
    pub inner_max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Remote-service variant.
    pub model: ModelChoice,
    /// Skip chunks whose output artifact already exists.
    pub resume: bool,
    pub heuristics: HeuristicsConfig,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.defaults.chunk_size,
            max_retries: config.retry.max_retries,
            inner_max_retries: config.retry.inner_max_retries,
            base_delay: secs(config.retry.base_delay_secs),
            max_delay: secs(config.retry.max_delay_secs),
            backoff_factor: config.retry.backoff_factor,
            model: config.defaults.model,
            resume: false,
            heuristics: config.heuristics.clone(),
        }
    }
}

/// Negative or NaN values collapse to zero; values past the range of
/// `Duration` saturate.
fn secs(value: f64) -> Duration {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) => duration,
        Err(_) if value > 0.0 => Duration::MAX,
        Err(_) => Duration::ZERO,
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.cardpipe/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CardpipeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.cardpipe/cardpipe.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CardpipeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        CardpipeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.retry.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CardpipeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CardpipeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CardpipeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the generation API key from the env var named in the config.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.gemini.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(CardpipeError::config(format!(
            "generation API key not found. Set the {var_name} environment variable."
        ))),
    }
}
