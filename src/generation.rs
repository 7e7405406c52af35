//! Query generation backend.
//!
//! The language model is an opaque text-in/text-out service behind the
//! [`QueryGenerator`] trait. [`ChatCompletionGenerator`] talks to OpenAI or
//! Azure OpenAI chat completions; [`DisabledGenerator`] always fails, which
//! sends the orchestrator down its fallback path and, from there, to a
//! structured error.

use anyhow::bail;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use nl2kql_core::ranking::PrioritizedContext;
use nl2kql_core::{CoreError, Result};

use crate::config::GenerationConfig;

/// System prompt for retrieval-grounded generation.
pub const RAG_SYSTEM_PROMPT: &str = "You are an expert KQL (Kusto Query Language) assistant. \
Generate ONLY a valid KQL query for the request, based on the provided context.\n\
Rules:\n\
1. Return ONLY the KQL query, no explanations or markdown\n\
2. Use only tables and fields mentioned in the context\n\
3. Include TimeGenerated filters when the request implies a time range\n\
4. Ensure field names match exactly as provided in the context\n\
5. Prefer simple, efficient queries over complex ones";

/// System prompt for the non-retrieval fallback path.
pub const FALLBACK_SYSTEM_PROMPT: &str = "You are an assistant that ONLY returns valid Kusto Query \
Language (KQL) queries. Do not return greetings or explanations. Only output the KQL query. \
If projecting columns, ensure they are common and likely to exist for the described log type. \
If unsure about specific columns, project only very common columns like TimeGenerated, or omit \
the 'project' operator entirely.";

/// System prompt for describing schema fields during ingestion.
pub const DESCRIPTION_SYSTEM_PROMPT: &str =
    "You are a log analytics expert. Generate concise, technical field descriptions.";

/// Input to one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// System prompt sent to the model.
    pub instructions: String,
    pub question: String,
    /// Assembled context text; empty on the fallback path.
    pub context: String,
}

impl GenerationRequest {
    /// Request grounded in the prioritized context.
    pub fn grounded(question: &str, context: &PrioritizedContext) -> Self {
        Self {
            instructions: format!("{}\n\n{}", RAG_SYSTEM_PROMPT, context.instructions()),
            question: question.to_string(),
            context: context.render(),
        }
    }

    /// Request for the non-retrieval path: static schema hints only.
    pub fn fallback(question: &str, schema_hints: &str) -> Self {
        Self {
            instructions: format!("{} {}", FALLBACK_SYSTEM_PROMPT, schema_hints),
            question: question.to_string(),
            context: String::new(),
        }
    }

    /// Request for a one or two sentence description of a schema field.
    pub fn field_description(table: &str, field: &str, data_type: &str, samples: &[String]) -> Self {
        let samples = if samples.is_empty() {
            "No samples available".to_string()
        } else {
            samples.join(", ")
        };
        Self {
            instructions: DESCRIPTION_SYSTEM_PROMPT.to_string(),
            question: format!(
                "Generate a concise, technical description for this log analytics field:\n\n\
                 Table: {}\nField: {}\nData Type: {}\nSample Values: {}\n\n\
                 Provide a 1-2 sentence description explaining what this field represents \
                 and how it is used in KQL queries.",
                table, field, data_type, samples
            ),
            context: String::new(),
        }
    }

    /// The user message sent to the model.
    pub fn user_message(&self) -> String {
        if self.context.trim().is_empty() {
            return self.question.clone();
        }
        format!(
            "Natural Language Request: {}\n\nContext Information:\n{}\n\nGenerate a valid KQL query that answers the request using the provided context.",
            self.question, self.context
        )
    }
}

/// Opaque query-writing backend.
#[async_trait]
pub trait QueryGenerator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Always fails with [`CoreError::GenerationError`].
pub struct DisabledGenerator {
    reason: String,
}

impl DisabledGenerator {
    /// Disabled because the configured backend could not be built.
    pub fn because(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for DisabledGenerator {
    fn default() -> Self {
        Self::because("generation provider is disabled; set [generation] provider in the config")
    }
}

#[async_trait]
impl QueryGenerator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        Err(CoreError::GenerationError(self.reason.clone()))
    }
}

/// Chat-completions client for `"openai"` and `"azure"`.
pub struct ChatCompletionGenerator {
    provider: String,
    url: String,
    model: Option<String>,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl ChatCompletionGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let key_env = config.key_env();
        let api_key = std::env::var(key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", key_env))?;

        let url = match config.provider.as_str() {
            "openai" => {
                let base = config
                    .endpoint
                    .as_deref()
                    .unwrap_or("https://api.openai.com")
                    .trim_end_matches('/');
                format!("{}/v1/chat/completions", base)
            }
            "azure" => {
                let (Some(endpoint), Some(deployment)) = (&config.endpoint, &config.deployment)
                else {
                    bail!("generation.endpoint and generation.deployment are required for azure");
                };
                format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    endpoint.trim_end_matches('/'),
                    deployment,
                    config.api_version
                )
            }
            other => bail!("Unsupported chat completion provider: {}", other),
        };

        let model = match config.provider.as_str() {
            "openai" => Some(config.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string())),
            _ => config.model.clone(),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            provider: config.provider.clone(),
            url,
            model,
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
            client,
        })
    }

    fn request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let system = if request.instructions.trim().is_empty() {
            RAG_SYSTEM_PROMPT
        } else {
            request.instructions.as_str()
        };
        let mut body = serde_json::json!({
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": request.user_message()},
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if let Some(model) = &self.model {
            body["model"] = serde_json::Value::String(model.clone());
        }
        body
    }
}

#[async_trait]
impl QueryGenerator for ChatCompletionGenerator {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let body = self.request_body(request);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(GenerationConfig::retry_delay(attempt)).await;
            }

            let mut builder = self.client.post(&self.url).json(&body);
            builder = if self.provider == "azure" {
                builder.header("api-key", &self.api_key)
            } else {
                builder.header("Authorization", format!("Bearer {}", self.api_key))
            };

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| CoreError::GenerationError(e.to_string()))?;
                        let text = parse_completion(&json)?;
                        debug!(chars = text.len(), "generation backend returned a query");
                        return Ok(strip_fences(&text));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = CoreError::GenerationError(format!(
                        "chat completion error {}: {}",
                        status, body_text
                    ));
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) if e.is_timeout() => {
                    last_err = Some(CoreError::GenerationTimeout(self.timeout_secs));
                    continue;
                }
                Err(e) => {
                    last_err = Some(CoreError::GenerationError(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            CoreError::GenerationError("generation failed after retries".to_string())
        }))
    }
}

fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| CoreError::GenerationError("invalid response: missing message content".to_string()))
}

/// Remove a surrounding markdown code fence (```` ```kusto ````, ```` ```kql ````,
/// or bare ```` ``` ````).
pub fn strip_fences(text: &str) -> String {
    let mut t = text.trim();
    for prefix in ["```kusto", "```kql", "```"] {
        if let Some(rest) = t.strip_prefix(prefix) {
            t = rest;
            break;
        }
    }
    if let Some(rest) = t.trim_end().strip_suffix("```") {
        t = rest;
    }
    t.trim().to_string()
}

/// Create the generator named by `config.provider`.
pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Arc<dyn QueryGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator::default())),
        "openai" | "azure" => Ok(Arc::new(ChatCompletionGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("```kusto\nPerf\n| take 5\n```"), "Perf\n| take 5");
        assert_eq!(strip_fences("```kql\nPerf\n```"), "Perf");
        assert_eq!(strip_fences("```\nPerf\n```"), "Perf");
        assert_eq!(strip_fences("  Perf | take 1  "), "Perf | take 1");
    }

    #[test]
    fn test_user_message_with_and_without_context() {
        let mut req = GenerationRequest {
            instructions: String::new(),
            question: "failed logins".to_string(),
            context: "## Tables\n### SecurityEvent\n".to_string(),
        };
        let msg = req.user_message();
        assert!(msg.starts_with("Natural Language Request: failed logins"));
        assert!(msg.contains("### SecurityEvent"));

        req.context.clear();
        assert_eq!(req.user_message(), "failed logins");
    }

    #[test]
    fn test_field_description_request() {
        let samples = vec!["alice".to_string(), "bob".to_string()];
        let r = GenerationRequest::field_description("SecurityEvent", "Account", "string", &samples);
        assert_eq!(r.instructions, DESCRIPTION_SYSTEM_PROMPT);
        let msg = r.user_message();
        assert!(msg.contains("Table: SecurityEvent\nField: Account\nData Type: string"));
        assert!(msg.contains("Sample Values: alice, bob"));

        let r = GenerationRequest::field_description("Perf", "CounterValue", "real", &[]);
        assert!(r.user_message().contains("Sample Values: No samples available"));
    }

    #[test]
    fn test_parse_completion() {
        let json = serde_json::json!({
            "choices": [{"message": {"content": "  SecurityEvent | take 10 "}}]
        });
        assert_eq!(parse_completion(&json).unwrap(), "SecurityEvent | take 10");
        assert!(parse_completion(&serde_json::json!({"choices": []})).is_err());
    }

    #[tokio::test]
    async fn test_disabled_generator_fails() {
        let req = GenerationRequest {
            instructions: String::new(),
            question: "q".to_string(),
            context: String::new(),
        };
        let err = DisabledGenerator::default().generate(&req).await.unwrap_err();
        assert!(matches!(err, CoreError::GenerationError(_)));
    }

    #[test]
    fn test_azure_url() {
        std::env::set_var("NL2KQL_TEST_AZURE_KEY", "k");
        let config = GenerationConfig {
            provider: "azure".to_string(),
            endpoint: Some("https://res.openai.azure.com/".to_string()),
            deployment: Some("gpt-4.1".to_string()),
            api_key_env: Some("NL2KQL_TEST_AZURE_KEY".to_string()),
            ..GenerationConfig::default()
        };
        let g = ChatCompletionGenerator::new(&config).unwrap();
        assert_eq!(
            g.url,
            "https://res.openai.azure.com/openai/deployments/gpt-4.1/chat/completions?api-version=2024-12-01-preview"
        );
        let body = g.request_body(&GenerationRequest::fallback("q", "Common tables: Perf."));
        assert!(body.get("model").is_none());
        let system = body["messages"][0]["content"].as_str().unwrap();
        assert!(system.starts_with(FALLBACK_SYSTEM_PROMPT));
        assert!(system.ends_with("Common tables: Perf."));
        assert_eq!(body["messages"][1]["content"], "q");
    }
}
