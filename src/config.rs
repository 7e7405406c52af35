//! Configuration parsing and validation.
//!
//! nl2kql is configured via a TOML file (default: `config/nl2kql.toml`).
//! Every section except `[db]` is optional and falls back to defaults.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/nl2kql.sqlite"
//!
//! [embedding]
//! provider = "local"          # "local" | "openai" | "hash"
//! model = "all-minilm-l6-v2"
//! dims = 384
//!
//! [generation]
//! provider = "azure"          # "openai" | "azure" | "disabled"
//! endpoint = "https://my-resource.openai.azure.com"
//! deployment = "gpt-4.1"
//!
//! [ranking]
//! similarity_weight = 1.0
//! lexical_weight = 0.5
//! usage_weight = 0.1
//! table_aggregation = "max"
//!
//! [server]
//! bind = "127.0.0.1:8080"
//! ```

use anyhow::{bail, Context, Result};
use nl2kql_core::ranking::RankingConfig;
use nl2kql_core::validate::ValidationConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Embedding backend selection.
///
/// `"hash"` skips the model entirely and uses the deterministic feature-hash
/// embedder; `"local"` and `"openai"` fall back to it at runtime when the
/// backend is unreachable.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL of an OpenAI-compatible embeddings API.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            api_key_env: default_openai_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn uses_model(&self) -> bool {
        self.provider != "hash"
    }
}

/// Language-model backend used to write the query.
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    /// Base URL. Required for `"azure"`; defaults to `https://api.openai.com` for `"openai"`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Azure deployment name.
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Environment variable holding the API key. Defaults per provider.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            endpoint: None,
            deployment: None,
            model: None,
            api_version: default_api_version(),
            api_key_env: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_retries: default_generation_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "disabled".to_string()
}
fn default_api_version() -> String {
    "2024-12-01-preview".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    500
}
fn default_generation_retries() -> u32 {
    2
}

impl GenerationConfig {
    /// Upper bound on one generation call, across all retry attempts and
    /// the backoff between them.
    pub fn request_timeout(&self) -> std::time::Duration {
        let attempts = u64::from(self.max_retries) + 1;
        let backoff: std::time::Duration = (1..=self.max_retries).map(Self::retry_delay).sum();
        std::time::Duration::from_secs(self.timeout_secs.saturating_mul(attempts)) + backoff
    }

    /// Sleep before retry `attempt` (1-based): 1s, 2s, 4s, capped at 32s.
    pub fn retry_delay(attempt: u32) -> std::time::Duration {
        std::time::Duration::from_secs(1 << attempt.saturating_sub(1).min(5))
    }

    pub fn key_env(&self) -> &str {
        match &self.api_key_env {
            Some(name) => name,
            None if self.provider == "azure" => "AZURE_OPENAI_API_KEY",
            None => "OPENAI_API_KEY",
        }
    }
}

/// Per-collection candidate counts pulled on every request.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_fields_k")]
    pub fields_k: usize,
    #[serde(default = "default_values_k")]
    pub values_k: usize,
    #[serde(default = "default_schemas_k")]
    pub schemas_k: usize,
    #[serde(default = "default_examples_k")]
    pub examples_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            fields_k: default_fields_k(),
            values_k: default_values_k(),
            schemas_k: default_schemas_k(),
            examples_k: default_examples_k(),
        }
    }
}

fn default_fields_k() -> usize {
    15
}
fn default_values_k() -> usize {
    8
}
fn default_schemas_k() -> usize {
    5
}
fn default_examples_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Maximum number of embedding batches in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_ingest_tables")]
    pub max_tables: usize,
    #[serde(default = "default_value_fields")]
    pub max_value_fields_per_table: usize,
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,
    /// Ask the generation backend to describe fields that have no
    /// description. Heuristics are used when the backend fails.
    #[serde(default)]
    pub generate_descriptions: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_tables: default_ingest_tables(),
            max_value_fields_per_table: default_value_fields(),
            sample_limit: default_sample_limit(),
            generate_descriptions: false,
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_ingest_tables() -> usize {
    20
}
fn default_value_fields() -> usize {
    10
}
fn default_sample_limit() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Config {
    /// All defaults, hash embeddings, generation disabled.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            retrieval: RetrievalConfig::default(),
            ranking: RankingConfig::default(),
            validation: ValidationConfig::default(),
            ingest: IngestConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Check value ranges and provider names.
    pub fn validate(&self) -> Result<()> {
        match self.embedding.provider.as_str() {
            "hash" | "local" | "openai" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, local, or openai.",
                other
            ),
        }
        if self.embedding.dims == 0 {
            bail!("embedding.dims must be > 0");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be >= 1");
        }

        match self.generation.provider.as_str() {
            "disabled" | "openai" => {}
            "azure" => {
                if self.generation.endpoint.is_none() {
                    bail!("generation.endpoint must be set when provider is 'azure'");
                }
                if self.generation.deployment.is_none() {
                    bail!("generation.deployment must be set when provider is 'azure'");
                }
            }
            other => bail!(
                "Unknown generation provider: '{}'. Must be disabled, openai, or azure.",
                other
            ),
        }

        let r = &self.retrieval;
        for (name, value) in [
            ("retrieval.fields_k", r.fields_k),
            ("retrieval.values_k", r.values_k),
            ("retrieval.schemas_k", r.schemas_k),
            ("retrieval.examples_k", r.examples_k),
        ] {
            if value == 0 {
                bail!("{} must be >= 1", name);
            }
        }

        let k = &self.ranking;
        for (name, value) in [
            ("ranking.similarity_weight", k.similarity_weight),
            ("ranking.lexical_weight", k.lexical_weight),
            ("ranking.usage_weight", k.usage_weight),
        ] {
            if value < 0.0 || !value.is_finite() {
                bail!("{} must be a non-negative number", name);
            }
        }
        for (name, value) in [
            ("ranking.max_tables", k.max_tables),
            ("ranking.max_fields", k.max_fields),
            ("ranking.max_fields_per_table", k.max_fields_per_table),
            ("ranking.max_examples", k.max_examples),
            ("ranking.max_value_sets_per_table", k.max_value_sets_per_table),
            ("ranking.max_sample_values", k.max_sample_values),
            ("ranking.max_items", k.max_items),
        ] {
            if value == 0 {
                bail!("{} must be >= 1", name);
            }
        }
        if k.max_fields_per_table > k.max_fields {
            bail!("ranking.max_fields_per_table must be <= ranking.max_fields");
        }

        let v = &self.validation;
        for (name, value) in [
            ("validation.filter", v.filter),
            ("validation.projection", v.projection),
            ("validation.aggregation", v.aggregation),
            ("validation.join", v.join),
        ] {
            if value < 0.0 || !value.is_finite() {
                bail!("{} must be a non-negative number", name);
            }
        }
        if v.medium_threshold >= v.high_threshold {
            bail!("validation.medium_threshold must be < validation.high_threshold");
        }

        let i = &self.ingest;
        for (name, value) in [
            ("ingest.concurrency", i.concurrency),
            ("ingest.max_tables", i.max_tables),
            ("ingest.max_value_fields_per_table", i.max_value_fields_per_table),
            ("ingest.sample_limit", i.sample_limit),
        ] {
            if value == 0 {
                bail!("{} must be >= 1", name);
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nl2kql_core::ranking::TableAggregation;

    fn parse(toml_text: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_text)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config = parse("[db]\npath = \"x.sqlite\"\n").unwrap();
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.dims, 384);
        assert_eq!(config.generation.provider, "disabled");
        assert_eq!(config.retrieval.fields_k, 15);
        assert_eq!(config.retrieval.values_k, 8);
        assert_eq!(config.ranking.max_fields, 24);
        assert_eq!(config.ingest.concurrency, 4);
        assert!(!config.ingest.generate_descriptions);
        assert_eq!(config.server.bind, "127.0.0.1:8080");
    }

    #[test]
    fn test_ranking_section_overrides() {
        let config = parse(
            r#"
[db]
path = "x.sqlite"

[ranking]
lexical_weight = 0.8
table_aggregation = "sum"
max_fields = 10
max_fields_per_table = 5
"#,
        )
        .unwrap();
        assert_eq!(config.ranking.lexical_weight, 0.8);
        assert_eq!(config.ranking.table_aggregation, TableAggregation::Sum);
        assert_eq!(config.ranking.similarity_weight, 1.0);
        assert_eq!(config.ranking.max_fields_per_table, 5);
    }

    #[test]
    fn test_rejects_unknown_providers() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
        let err = parse("[db]\npath = \"x\"\n[generation]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown generation provider"));
    }

    #[test]
    fn test_azure_requires_endpoint_and_deployment() {
        let err = parse("[db]\npath = \"x\"\n[generation]\nprovider = \"azure\"\n").unwrap_err();
        assert!(err.to_string().contains("generation.endpoint"));
    }

    #[test]
    fn test_rejects_bad_ranges() {
        assert!(parse("[db]\npath = \"x\"\n[ranking]\nusage_weight = -1.0\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[ranking]\nmax_items = 0\n").is_err());
        assert!(parse(
            "[db]\npath = \"x\"\n[ranking]\nmax_fields = 4\nmax_fields_per_table = 5\n"
        )
        .is_err());
        assert!(parse(
            "[db]\npath = \"x\"\n[validation]\nmedium_threshold = 5.0\nhigh_threshold = 2.0\n"
        )
        .is_err());
        assert!(parse("[db]\npath = \"x\"\n[embedding]\ndims = 0\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[ingest]\nconcurrency = 0\n").is_err());
    }

    #[test]
    fn test_key_env_defaults_per_provider() {
        let mut g = GenerationConfig::default();
        assert_eq!(g.key_env(), "OPENAI_API_KEY");
        g.provider = "azure".to_string();
        assert_eq!(g.key_env(), "AZURE_OPENAI_API_KEY");
        g.api_key_env = Some("MY_KEY".to_string());
        assert_eq!(g.key_env(), "MY_KEY");
    }

    #[test]
    fn test_request_timeout_covers_retries_and_backoff() {
        let mut g = GenerationConfig {
            timeout_secs: 30,
            max_retries: 0,
            ..GenerationConfig::default()
        };
        assert_eq!(g.request_timeout(), std::time::Duration::from_secs(30));
        g.max_retries = 3;
        // 4 attempts plus 1s + 2s + 4s of backoff.
        assert_eq!(g.request_timeout(), std::time::Duration::from_secs(127));
        assert_eq!(GenerationConfig::retry_delay(1), std::time::Duration::from_secs(1));
        assert_eq!(GenerationConfig::retry_delay(9), std::time::Duration::from_secs(32));
    }

    #[test]
    fn test_load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/nl2kql.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse(include_str!("../config/nl2kql.example.toml")).unwrap();
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.generation.provider, "disabled");
        assert_eq!(config.ranking.table_aggregation, TableAggregation::Max);
        assert_eq!(config.server.bind, "127.0.0.1:8080");
    }
}
