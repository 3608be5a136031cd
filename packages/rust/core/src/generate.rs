//! Remote generation client.
//!
//! The pipeline only needs "prompt in, text out", so the service sits behind
//! the [`Generator`] trait. [`GeminiClient`] is the production implementation
//! over the `generateContent` REST endpoint.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use cardpipe_shared::{CardpipeError, GeminiConfig, Result};

/// User-Agent string for generation requests.
const USER_AGENT: &str = concat!("cardpipe/", env!("CARGO_PKG_VERSION"));

/// Longest slice of an error body echoed into a service error.
const MAX_ERROR_BODY_CHARS: usize = 300;

// ---------------------------------------------------------------------------
// Request / trait
// ---------------------------------------------------------------------------

/// One generation call: which model, and the full prompt text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
}

/// Something that turns a prompt into text.
///
/// Implementations map their failures onto the shared taxonomy
/// (`Transport`, `Service`, `Unexpected`) so the classifier can judge them.
pub trait Generator {
    fn generate(&self, request: &GenerationRequest) -> impl Future<Output = Result<String>> + Send;
}

/// Render the prompt sent for one chunk.
pub fn build_prompt(
    input_path: &Path,
    input_json: &str,
    instruction_path: &Path,
    instructions: &str,
) -> String {
    format!(
        "\n<file_contents>\nFile: {input}\n```json\n{input_json}\n```\n\n\
         File: {instruction}\n```markdown\n{instructions}\n```\n</file_contents>\n\n\
         <user_instructions>\n\
         Follow the Instructions as mentioned in the instruction markdown file\n\
         </user_instructions>\n",
        input = input_path.display(),
        instruction = instruction_path.display(),
    )
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GenerateContentBody<'a> {
    contents: Vec<ContentBody<'a>>,
}

#[derive(Debug, Serialize)]
struct ContentBody<'a> {
    parts: Vec<PartBody<'a>>,
}

#[derive(Debug, Serialize)]
struct PartBody<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

// ---------------------------------------------------------------------------
// GeminiClient
// ---------------------------------------------------------------------------

/// HTTP client for the Gemini `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl GeminiClient {
    /// Build a client against `endpoint` (scheme + host, optional base path).
    pub fn new(endpoint: &str, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| CardpipeError::transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Build a client from the `[gemini]` config section.
    pub fn from_config(config: &GeminiConfig, api_key: impl Into<String>) -> Result<Self> {
        let endpoint = config.endpoint_url()?;
        Self::new(
            endpoint.as_str(),
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn url_for(&self, model: &str) -> String {
        format!("{}/v1beta/models/{model}:generateContent", self.endpoint)
    }
}

impl Generator for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let url = self.url_for(&request.model);
        let body = GenerateContentBody {
            contents: vec![ContentBody {
                parts: vec![PartBody {
                    text: &request.prompt,
                }],
            }],
        };

        debug!(model = %request.model, prompt_chars = request.prompt.len(), "calling generation service");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CardpipeError::transport(format!("{}: {e}", request.model)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CardpipeError::transport(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(CardpipeError::service(status.as_u16(), error_message(&text)));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&text).map_err(|e| {
            CardpipeError::Unexpected(format!("undecodable generation response: {e}"))
        })?;

        Ok(response_text(parsed))
    }
}

/// Concatenate the text parts of the first candidate.
fn response_text(response: GenerateContentResponse) -> String {
    let joined: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect()
        })
        .unwrap_or_default();
    joined.trim().to_string()
}

/// Prefer `error.message` from a JSON error body, else a prefix of the raw body.
fn error_message(body: &str) -> String {
    if let Ok(ErrorEnvelope {
        error: Some(ErrorBody {
            message: Some(message),
        }),
    }) = serde_json::from_str::<ErrorEnvelope>(body)
    {
        return message;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty error body".to_string()
    } else {
        trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect()
    }
}
