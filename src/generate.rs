//! Artifact generation.
//!
//! The [`Generator`] trait is the opaque context-to-artifact collaborator:
//! it receives either retrieved repository context or the explicit
//! [`GenerationContext::NoContext`] signal, plus an [`InstructionKind`], and
//! returns text. Providers:
//!
//! - `echo`: offline; renders an outline of the context it was given.
//! - `ollama`: `POST {url}/api/generate`.
//! - `openai`: `POST {url}/v1/chat/completions`, key from `OPENAI_API_KEY`.
//!
//! [`generate_artifact`] wraps one call with a per-call timeout and retries,
//! then turns the output into an [`Artifact`]. Diagram kinds are parsed as
//! JSON after stripping Markdown fences and surrounding prose; a parse
//! failure is recorded on the artifact.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use repo_lens_core::error::PipelineError;
use repo_lens_core::models::RetrievalResult;

use crate::config::GenerationConfig;

/// What the caller wants produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstructionKind {
    Documentation,
    HighLevelDesign,
    LowLevelDesign,
    Chat { question: String },
}

impl InstructionKind {
    /// Parse a kind name. `chat` requires a question.
    pub fn parse(name: &str, question: Option<&str>) -> Result<Self> {
        match name {
            "documentation" | "docs" => Ok(InstructionKind::Documentation),
            "high_level_design" | "hld" => Ok(InstructionKind::HighLevelDesign),
            "low_level_design" | "lld" => Ok(InstructionKind::LowLevelDesign),
            "chat" => match question.map(str::trim).filter(|q| !q.is_empty()) {
                Some(q) => Ok(InstructionKind::Chat {
                    question: q.to_string(),
                }),
                None => bail!("instruction 'chat' requires a question"),
            },
            other => bail!(
                "Unknown instruction '{}'. Must be documentation, high_level_design, low_level_design, or chat.",
                other
            ),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InstructionKind::Documentation => "documentation",
            InstructionKind::HighLevelDesign => "high_level_design",
            InstructionKind::LowLevelDesign => "low_level_design",
            InstructionKind::Chat { .. } => "chat",
        }
    }

    /// Text embedded to retrieve context for this instruction.
    pub fn query_text(&self) -> String {
        match self {
            InstructionKind::Documentation => {
                "project overview, purpose, setup, configuration, main modules and public interfaces"
                    .to_string()
            }
            InstructionKind::HighLevelDesign => {
                "system architecture, services, components, data stores, external dependencies and how they communicate"
                    .to_string()
            }
            InstructionKind::LowLevelDesign => {
                "request handling flow, control flow, core functions, error handling and data transformations"
                    .to_string()
            }
            InstructionKind::Chat { question } => question.clone(),
        }
    }

    /// Whether the output is a JSON diagram payload.
    pub fn expects_json(&self) -> bool {
        matches!(
            self,
            InstructionKind::HighLevelDesign | InstructionKind::LowLevelDesign
        )
    }

    fn task(&self) -> String {
        match self {
            InstructionKind::Documentation => {
                "Write technical documentation for this repository in Markdown.".to_string()
            }
            InstructionKind::HighLevelDesign => {
                "Describe the high-level architecture of this repository as a JSON object \
                 with `nodes` (id, label, kind) and `edges` (from, to, label). Return only JSON."
                    .to_string()
            }
            InstructionKind::LowLevelDesign => {
                "Describe the main runtime flow of this repository as a JSON object \
                 with `nodes` (id, label, kind) and `edges` (from, to, label). Return only JSON."
                    .to_string()
            }
            InstructionKind::Chat { question } => {
                format!("Answer this question about the repository: {}", question)
            }
        }
    }
}

impl std::fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Context handed to the generator.
#[derive(Debug, Clone)]
pub enum GenerationContext {
    Grounded(RetrievalResult),
    /// Retrieval found nothing; the generator must not pretend otherwise.
    NoContext,
}

impl GenerationContext {
    pub fn from_result(result: RetrievalResult) -> Self {
        if result.is_empty() {
            GenerationContext::NoContext
        } else {
            GenerationContext::Grounded(result)
        }
    }

    pub fn is_grounded(&self) -> bool {
        matches!(self, GenerationContext::Grounded(_))
    }
}

/// Failure of one generation call.
#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("transient generation failure: {0}")]
    Transient(String),
    #[error("generation request rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        context: &GenerationContext,
        instruction: &InstructionKind,
    ) -> Result<String, GenerateError>;
}

/// A produced artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub instruction: InstructionKind,
    pub text: String,
    /// Parsed diagram payload for JSON kinds.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub parse_error: Option<String>,
    /// `false` when generated under the no-context signal.
    pub grounded: bool,
}

impl Artifact {
    pub fn from_output(instruction: InstructionKind, text: String, grounded: bool) -> Self {
        let (payload, parse_error) = if instruction.expects_json() {
            match parse_json_object(&text) {
                Ok(v) => (Some(v), None),
                Err(e) => (None, Some(e)),
            }
        } else {
            (None, None)
        };
        Self {
            instruction,
            text,
            payload,
            parse_error,
            grounded,
        }
    }
}

/// Strip Markdown fences and surrounding prose, leaving the outermost
/// `{...}` span.
pub fn clean_json_response(raw: &str) -> &str {
    let mut cleaned = raw.trim();
    if cleaned.starts_with("```") {
        cleaned = cleaned.trim_start_matches('`');
        cleaned = cleaned.strip_prefix("json").unwrap_or(cleaned).trim();
        cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned).trim();
    }
    if !cleaned.starts_with('{') {
        if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
            if end > start {
                cleaned = &cleaned[start..=end];
            }
        }
    }
    cleaned
}

fn parse_json_object(raw: &str) -> std::result::Result<serde_json::Value, String> {
    if raw.trim().is_empty() {
        return Err("empty response".to_string());
    }
    let cleaned = clean_json_response(raw);
    match serde_json::from_str::<serde_json::Value>(cleaned) {
        Ok(v) if v.is_object() => Ok(v),
        Ok(_) => Err("response was not a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

/// Prompt text for network providers.
pub fn build_prompt(context: &GenerationContext, instruction: &InstructionKind) -> String {
    let body = match context {
        GenerationContext::Grounded(result) => result.render_context(),
        GenerationContext::NoContext => {
            "No repository context was found for this request. State that the answer is not grounded in the repository.\n"
                .to_string()
        }
    };
    format!("{}\n\n--- CONTEXT ---\n{}--- END CONTEXT ---\n", instruction.task(), body)
}

/// Retry and timeout policy for generation calls.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub call_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl GenerationSettings {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            call_timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Produce one artifact, retrying transient failures and timeouts.
pub async fn generate_artifact(
    generator: &dyn Generator,
    context: &GenerationContext,
    instruction: &InstructionKind,
    settings: &GenerationSettings,
) -> Result<Artifact, PipelineError> {
    let mut last_error = String::new();
    for attempt in 0..=settings.max_retries {
        if attempt > 0 {
            let delay = settings.retry_backoff * (1u32 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }
        let outcome =
            tokio::time::timeout(settings.call_timeout, generator.generate(context, instruction))
                .await;
        match outcome {
            Ok(Ok(text)) => {
                let artifact =
                    Artifact::from_output(instruction.clone(), text, context.is_grounded());
                if let Some(err) = &artifact.parse_error {
                    tracing::warn!(instruction = %instruction, error = %err, "diagram payload did not parse");
                }
                return Ok(artifact);
            }
            Ok(Err(GenerateError::Rejected(msg))) => {
                return Err(PipelineError::GenerationCallFailed {
                    attempts: attempt + 1,
                    message: msg,
                });
            }
            Ok(Err(GenerateError::Transient(msg))) => last_error = msg,
            Err(_) => {
                last_error = format!(
                    "call exceeded {}s",
                    settings.call_timeout.as_secs_f64()
                )
            }
        }
        tracing::debug!(instruction = %instruction, attempt, error = %last_error, "generation attempt failed");
    }
    Err(PipelineError::GenerationCallFailed {
        attempts: settings.max_retries + 1,
        message: last_error,
    })
}

/// Build the generator named by `generation.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "echo" => Ok(Arc::new(EchoGenerator)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

// ============ Echo ============

/// Offline generator that reflects the context it receives.
#[derive(Debug, Default, Clone)]
pub struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(
        &self,
        context: &GenerationContext,
        instruction: &InstructionKind,
    ) -> Result<String, GenerateError> {
        let result = match context {
            GenerationContext::Grounded(result) => result,
            GenerationContext::NoContext => {
                return Ok(if instruction.expects_json() {
                    serde_json::json!({ "nodes": [], "edges": [], "grounded": false }).to_string()
                } else {
                    format!("# {}\n\nNo repository context was found.\n", instruction.name())
                });
            }
        };

        if instruction.expects_json() {
            let nodes: Vec<_> = result
                .summaries()
                .map(|item| {
                    serde_json::json!({
                        "id": item.path,
                        "label": item.path,
                        "kind": item.language.as_str(),
                    })
                })
                .collect();
            let edges: Vec<_> = result
                .structural()
                .filter_map(|item| {
                    item.symbol.as_ref().map(|sym| {
                        serde_json::json!({ "from": item.path, "to": sym, "label": "defines" })
                    })
                })
                .collect();
            return Ok(serde_json::json!({ "nodes": nodes, "edges": edges }).to_string());
        }

        let mut out = format!("# {}\n\n", instruction.name());
        if let InstructionKind::Chat { question } = instruction {
            out.push_str(&format!("Question: {}\n\n", question));
        }
        out.push_str("## Files\n\n");
        for item in result.summaries() {
            out.push_str(&format!("- `{}` ({})\n", item.path, item.language.as_str()));
        }
        let symbols: Vec<_> = result
            .structural()
            .filter_map(|item| {
                item.symbol.as_ref().map(|sym| {
                    format!(
                        "- `{}` in `{}` (lines {}-{})\n",
                        sym, item.path, item.start_line, item.end_line
                    )
                })
            })
            .collect();
        if !symbols.is_empty() {
            out.push_str("\n## Symbols\n\n");
            out.extend(symbols);
        }
        Ok(out)
    }
}

// ============ HTTP providers ============

async fn post_json(
    request: reqwest::RequestBuilder,
    provider: &str,
) -> Result<serde_json::Value, GenerateError> {
    let response = request
        .send()
        .await
        .map_err(|e| GenerateError::Transient(format!("{} connection error: {}", provider, e)))?;
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| GenerateError::Transient(format!("{} response read error: {}", provider, e)));
    }
    let body_text = response.text().await.unwrap_or_default();
    let message = format!("{} API error {}: {}", provider, status, body_text);
    if status.as_u16() == 429 || status.is_server_error() {
        Err(GenerateError::Transient(message))
    } else {
        Err(GenerateError::Rejected(message))
    }
}

pub struct OllamaGenerator {
    client: reqwest::Client,
    model: String,
    url: String,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        // Per-call deadlines are enforced by `generate_artifact`.
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            model,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(
        &self,
        context: &GenerationContext,
        instruction: &InstructionKind,
    ) -> Result<String, GenerateError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": build_prompt(context, instruction),
            "stream": false,
        });
        let request = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body);
        let json = post_json(request, "Ollama").await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| GenerateError::Rejected("Invalid Ollama response: missing response".into()))
    }
}

pub struct OpenAIGenerator {
    client: reqwest::Client,
    model: String,
    url: String,
    api_key: String,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            model,
            url: url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(
        &self,
        context: &GenerationContext,
        instruction: &InstructionKind,
    ) -> Result<String, GenerateError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": "You analyse source repositories for engineers." },
                { "role": "user", "content": build_prompt(context, instruction) }
            ],
            "temperature": 0.2
        });
        let request = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = post_json(request, "OpenAI").await?;
        json.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                GenerateError::Rejected("OpenAI response did not include assistant content".into())
            })
    }
}
