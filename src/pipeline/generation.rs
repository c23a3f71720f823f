use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{GenerationError, PipelineError, PipelineResult};

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Anything that turns a prompt into text under a token budget.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub temperature: f32,
}

impl GenerationSettings {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "generation base URL is empty".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "generation model name is empty".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(PipelineError::InvalidInput(
                "generation timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    settings: GenerationSettings,
}

impl ChatCompletionsClient {
    pub fn new(settings: GenerationSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, settings })
    }
}

#[async_trait]
impl TextGenerator for ChatCompletionsClient {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, GenerationError> {
        let request = ChatCompletionRequest {
            model: &self.settings.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.settings.temperature,
            max_tokens,
        };

        let response = self
            .http
            .post(self.settings.endpoint())
            .bearer_auth(&self.settings.api_key)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        extract_content(&body)
    }
}

fn transport_error(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Transport(err.to_string())
    }
}

/// Pulls `choices[0].message.content` out of a completion body.
fn extract_content(body: &str) -> Result<String, GenerationError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body)
        .map_err(|err| GenerationError::Envelope(err.to_string()))?;

    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| GenerationError::Envelope("response has no message content".to_string()))?;

    if content.trim().is_empty() {
        return Err(GenerationError::Envelope(
            "response message content is empty".to_string(),
        ));
    }
    Ok(content)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_unit: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based) grows linearly.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_unit.checked_mul(attempt).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub text: String,
    pub attempts: u32,
    pub waited: Duration,
}

/// Calls the generator until it succeeds or the policy runs out of attempts.
pub async fn call_model(
    generator: &dyn TextGenerator,
    policy: &RetryPolicy,
    prompt: &str,
    max_tokens: u32,
) -> PipelineResult<Generated> {
    let max_attempts = policy.max_retries.max(1);
    let mut waited = Duration::ZERO;
    let mut last_error = GenerationError::Transport("no attempt made".to_string());

    for attempt in 1..=max_attempts {
        match generator.generate(prompt, max_tokens).await {
            Ok(text) => {
                debug!(attempt, chars = text.chars().count(), "generation succeeded");
                return Ok(Generated {
                    text,
                    attempts: attempt,
                    waited,
                });
            }
            Err(err) => {
                warn!(attempt, max_attempts, error = %err, "generation attempt failed");
                last_error = err;
                if attempt < max_attempts {
                    let delay = policy.delay_after(attempt);
                    tokio::time::sleep(delay).await;
                    waited = waited.saturating_add(delay);
                }
            }
        }
    }

    Err(PipelineError::GenerationFailure {
        attempts: max_attempts,
        last_error,
    })
}
