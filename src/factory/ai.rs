//! Model providers, model selection, and the assessment reply contract.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::models::Assessment;
use crate::config::Secrets;

pub const SETTING_ASSESSMENT_MODEL: &str = "assessment_model";
pub const SETTING_AGENT_MODEL: &str = "agent_model";

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-5.2";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-5";

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Openai,
    Anthropic,
}

impl Provider {
    /// `gpt*` models go to OpenAI, everything else to Anthropic.
    pub fn for_model(model: &str) -> Self {
        if model.starts_with("gpt") {
            Self::Openai
        } else {
            Self::Anthropic
        }
    }
}

/// Map a short model name to the identifier the provider expects.
pub fn provider_model_id(model: &str) -> &str {
    match model {
        "claude-sonnet-4-5" => "claude-sonnet-4-5-20250929",
        "GPT-5.2" => "gpt-5.2",
        "GPT-4o-mini" => "gpt-4o-mini",
        other => other,
    }
}

/// Sends a single prompt to a model and returns its text reply.
/// Real implementation: `HttpModelClient`. Test double:
/// `test_support::FakeModel`.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String>;
}

pub struct HttpModelClient {
    http: reqwest::Client,
    openai_key: Option<String>,
    anthropic_key: Option<String>,
}

impl HttpModelClient {
    pub fn new(secrets: &Secrets, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build model HTTP client")?;
        Ok(Self {
            http,
            openai_key: secrets.openai_key.clone(),
            anthropic_key: secrets.anthropic_key.clone(),
        })
    }

    async fn openai(&self, model: &str, prompt: &str) -> Result<String> {
        let key = self
            .openai_key
            .as_deref()
            .context("OpenAI API key not configured (set OPENAI_KEY)")?;
        let resp: serde_json::Value = self
            .http
            .post(OPENAI_CHAT_URL)
            .bearer_auth(key)
            .json(&json!({
                "model": provider_model_id(model),
                "messages": [{"role": "user", "content": prompt}],
            }))
            .send()
            .await
            .context("Failed to send OpenAI request")?
            .error_for_status()
            .context("OpenAI API returned error status")?
            .json()
            .await
            .context("Failed to parse OpenAI response")?;
        resp.pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .context("OpenAI response has no message content")
    }

    async fn anthropic(&self, model: &str, prompt: &str) -> Result<String> {
        let key = self
            .anthropic_key
            .as_deref()
            .context("Anthropic API key not configured (set ANTHROPIC_KEY)")?;
        let resp: serde_json::Value = self
            .http
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": provider_model_id(model),
                "max_tokens": 1024,
                "messages": [{"role": "user", "content": prompt}],
            }))
            .send()
            .await
            .context("Failed to send Anthropic request")?
            .error_for_status()
            .context("Anthropic API returned error status")?
            .json()
            .await
            .context("Failed to parse Anthropic response")?;
        resp.pointer("/content/0/text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .context("Anthropic response has no text content")
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String> {
        debug!(model, provider = ?Provider::for_model(model), "model request");
        match Provider::for_model(model) {
            Provider::Openai => self.openai(model, prompt).await,
            Provider::Anthropic => self.anthropic(model, prompt).await,
        }
    }
}

// ── Model selection ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelOption {
    pub value: &'static str,
    pub label: &'static str,
    pub provider: Provider,
}

/// Picks model identifiers: explicit argument, then the stored setting,
/// then whichever provider has a key, then a fixed default.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelResolver {
    has_openai: bool,
    has_anthropic: bool,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl ModelResolver {
    pub fn new(has_openai: bool, has_anthropic: bool) -> Self {
        Self {
            has_openai,
            has_anthropic,
        }
    }

    pub fn from_secrets(secrets: &Secrets) -> Self {
        Self::new(secrets.openai_key.is_some(), secrets.anthropic_key.is_some())
    }

    pub fn assessment_model(&self, explicit: Option<&str>, setting: Option<&str>) -> String {
        if let Some(model) = non_blank(explicit).or(non_blank(setting)) {
            return model.to_string();
        }
        if self.has_openai {
            DEFAULT_OPENAI_MODEL
        } else if self.has_anthropic {
            DEFAULT_ANTHROPIC_MODEL
        } else {
            DEFAULT_OPENAI_MODEL
        }
        .to_string()
    }

    pub fn agent_model(&self, explicit: Option<&str>, setting: Option<&str>) -> String {
        if let Some(model) = non_blank(explicit).or(non_blank(setting)) {
            return model.to_string();
        }
        if self.has_anthropic || !self.has_openai {
            DEFAULT_ANTHROPIC_MODEL
        } else {
            DEFAULT_OPENAI_MODEL
        }
        .to_string()
    }

    pub fn available_models(&self) -> Vec<ModelOption> {
        let mut models = Vec::new();
        if self.has_openai {
            models.push(ModelOption {
                value: "gpt-5.2",
                label: "GPT-5.2",
                provider: Provider::Openai,
            });
            models.push(ModelOption {
                value: "gpt-4o-mini",
                label: "GPT-4o Mini",
                provider: Provider::Openai,
            });
        }
        if self.has_anthropic {
            models.push(ModelOption {
                value: "claude-sonnet-4-5",
                label: "Claude Sonnet 4.5",
                provider: Provider::Anthropic,
            });
            models.push(ModelOption {
                value: "claude-opus-4-6",
                label: "Claude Opus 4.6",
                provider: Provider::Anthropic,
            });
        }
        models
    }
}

// ── Assessment replies ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssessmentReply {
    pub assessment: Assessment,
    pub summary: String,
}

#[derive(Deserialize)]
struct RawReply {
    assessment: String,
    summary: String,
}

/// Parse a model reply into an assessment. Tolerates code fences and
/// prose around the JSON object; rejects any other assessment value.
pub fn parse_assessment_reply(text: &str) -> Result<AssessmentReply> {
    let start = text.find('{').context("Reply contains no JSON object")?;
    let end = text.rfind('}').context("Reply contains no JSON object")?;
    if end < start {
        anyhow::bail!("Reply contains no JSON object");
    }
    let raw: RawReply =
        serde_json::from_str(&text[start..=end]).context("Reply is not the expected JSON shape")?;
    let assessment = match raw.assessment.as_str() {
        "agentic_pr_capable" => Assessment::AgenticPrCapable,
        "too_complex" => Assessment::TooComplex,
        other => anyhow::bail!("Unexpected assessment value: {:?}", other),
    };
    Ok(AssessmentReply {
        assessment,
        summary: raw.summary.trim().to_string(),
    })
}

/// Ask for an assessment, retrying exactly once with a corrective prompt
/// when the first reply does not parse. Transport errors are not retried.
pub async fn request_assessment(
    client: &dyn ModelClient,
    model: &str,
    prompt: &str,
) -> Result<AssessmentReply> {
    let first = client.complete(model, prompt).await?;
    let parse_err = match parse_assessment_reply(&first) {
        Ok(reply) => return Ok(reply),
        Err(e) => e,
    };
    warn!(model, error = %format!("{:#}", parse_err), "unparseable assessment reply, retrying once");

    let retry_prompt = format!(
        "{}\n\nYour previous reply could not be used ({:#}). Reply with only a JSON object of the form \
         {{\"assessment\": \"agentic_pr_capable\" | \"too_complex\", \"summary\": \"...\"}} and nothing else.",
        prompt, parse_err
    );
    let second = client.complete(model, &retry_prompt).await?;
    parse_assessment_reply(&second).with_context(|| {
        format!(
            "Failed to parse model response after retry: {}",
            second.chars().take(200).collect::<String>()
        )
    })
}
