//! Embedding provider with a degraded fallback mode.
//!
//! [`EmbeddingProvider`] wraps an optional primary [`EmbeddingBackend`]
//! (local fastembed model or an OpenAI-compatible HTTP API) and the
//! deterministic [`HashEmbedder`]. Every primary call is bounded by a
//! timeout. The first failure of any kind (transport error, timeout, wrong
//! vector count or dimension) switches the provider to the hash embedder
//! for the rest of the process lifetime; the switch is logged once and
//! callers never see the error.
//!
//! # Backends
//!
//! | Config Value | Backend |
//! |-------------|----------|
//! | `"hash"` | none, hash embedder only |
//! | `"local"` | [`LocalBackend`] (fastembed, feature `local-embeddings-fastembed`) |
//! | `"openai"` | [`OpenAiBackend`] (`POST /v1/embeddings`) |

use anyhow::bail;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use nl2kql_core::embedding::{check_dims, EmbeddingBackend, HashEmbedder};
use nl2kql_core::{CoreError, Result};

use crate::config::EmbeddingConfig;

/// Version tag of the fallback embedder, reported by
/// [`EmbeddingProvider::provider_version`].
pub const FALLBACK_VERSION: &str = "hash-fallback-v1";

/// Result of an embedding call, tagged with the mode that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedOutcome<T = Vec<f32>> {
    Primary(T),
    /// Produced by the hash fallback.
    Degraded(T),
}

impl<T> EmbedOutcome<T> {
    pub fn is_degraded(&self) -> bool {
        matches!(self, EmbedOutcome::Degraded(_))
    }

    pub fn value(&self) -> &T {
        match self {
            EmbedOutcome::Primary(v) | EmbedOutcome::Degraded(v) => v,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            EmbedOutcome::Primary(v) | EmbedOutcome::Degraded(v) => v,
        }
    }
}

pub struct EmbeddingProvider {
    primary: Option<Box<dyn EmbeddingBackend>>,
    fallback: HashEmbedder,
    dims: usize,
    timeout: Duration,
    degraded: AtomicBool,
}

impl EmbeddingProvider {
    pub fn new(primary: Option<Box<dyn EmbeddingBackend>>, dims: usize, timeout: Duration) -> Self {
        Self {
            primary,
            fallback: HashEmbedder::new(dims),
            dims,
            timeout,
            degraded: AtomicBool::new(false),
        }
    }

    /// A provider that only ever uses the hash embedder.
    pub fn hash_only(dims: usize) -> Self {
        Self::new(None, dims, Duration::from_secs(1))
    }

    /// Build from configuration. A backend that cannot be constructed
    /// (missing API key, feature not compiled in) activates the fallback
    /// immediately instead of failing.
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        match create_backend(config) {
            Ok(primary) => Self::new(primary, config.dims, timeout),
            Err(e) => {
                let provider = Self::new(None, config.dims, timeout);
                provider.activate_fallback(&e.to_string());
                provider
            }
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// True once the hash fallback is in use because the primary failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// `model@dims` for the primary, `hash-fallback-v1@dims` otherwise.
    pub fn provider_version(&self) -> String {
        match &self.primary {
            Some(p) if !self.is_degraded() => format!("{}@{}", p.model_name(), self.dims),
            _ => format!("{}@{}", FALLBACK_VERSION, self.dims),
        }
    }

    fn activate_fallback(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                reason,
                dims = self.dims,
                "embedding backend unavailable; using hash fallback for the rest of this process"
            );
        }
    }

    async fn try_primary(
        &self,
        primary: &dyn EmbeddingBackend,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let vectors = tokio::time::timeout(self.timeout, primary.embed(texts))
            .await
            .map_err(|_| {
                CoreError::EmbeddingUnavailable(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                ))
            })??;
        if vectors.len() != texts.len() {
            return Err(CoreError::EmbeddingUnavailable(format!(
                "backend returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        for v in &vectors {
            check_dims(v, self.dims)?;
        }
        Ok(vectors)
    }

    /// Embed a batch of texts. Never fails.
    pub async fn embed_batch(&self, texts: &[String]) -> EmbedOutcome<Vec<Vec<f32>>> {
        if let Some(primary) = self.primary.as_deref() {
            if !self.is_degraded() {
                match self.try_primary(primary, texts).await {
                    Ok(vectors) => return EmbedOutcome::Primary(vectors),
                    Err(e) => self.activate_fallback(&e.to_string()),
                }
            }
        }
        debug!(count = texts.len(), "embedding with hash fallback");
        EmbedOutcome::Degraded(texts.iter().map(|t| self.fallback.embed_one(t)).collect())
    }

    /// Embed one text. Never fails.
    pub async fn embed(&self, text: &str) -> EmbedOutcome {
        match self.embed_batch(&[text.to_string()]).await {
            EmbedOutcome::Primary(mut v) => EmbedOutcome::Primary(v.pop().unwrap_or_default()),
            EmbedOutcome::Degraded(mut v) => EmbedOutcome::Degraded(v.pop().unwrap_or_default()),
        }
    }
}

/// Create the primary backend named by `config.provider`, or `None` for
/// `"hash"`.
pub fn create_backend(config: &EmbeddingConfig) -> anyhow::Result<Option<Box<dyn EmbeddingBackend>>> {
    match config.provider.as_str() {
        "hash" => Ok(None),
        "openai" => Ok(Some(Box::new(OpenAiBackend::new(config)?))),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Some(Box::new(LocalBackend::new(config)?))),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ OpenAI-compatible Backend ============

/// Backend calling an OpenAI-compatible `POST /v1/embeddings` endpoint.
///
/// Requires the API key environment variable named by
/// `embedding.api_key_env`. Rate limits (429) and server errors are
/// retried with exponential backoff; other client errors fail fast.
pub struct OpenAiBackend {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "text-embedding-3-small".to_string());
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/v1/embeddings", self.url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| CoreError::EmbeddingUnavailable(e.to_string()))?;
                        return parse_embeddings_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = CoreError::EmbeddingUnavailable(format!(
                        "embeddings API error {}: {}",
                        status, body_text
                    ));
                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(CoreError::EmbeddingUnavailable(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            CoreError::EmbeddingUnavailable("embedding failed after retries".to_string())
        }))
    }
}

/// Extract `data[].embedding` arrays, ordered by `data[].index`.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let invalid = |what: &str| CoreError::EmbeddingUnavailable(format!("invalid response: {}", what));
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| invalid("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (i, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(i);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| invalid("missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Local Backend (fastembed) ============

/// Local sentence-embedding model run through fastembed.
///
/// The model is downloaded from Hugging Face on first use and cached;
/// inference runs on the blocking thread pool.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalBackend {
    model_name: String,
    dims: usize,
    model: fastembed::EmbeddingModel,
    batch_size: usize,
    loaded: std::sync::Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalBackend {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let model = config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims: config.dims,
            model,
            batch_size: config.batch_size,
            loaded: std::sync::Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> anyhow::Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingBackend for LocalBackend {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let texts = texts.to_vec();
        let model = self.model.clone();
        let batch_size = self.batch_size;
        let loaded = std::sync::Arc::clone(&self.loaded);

        tokio::task::spawn_blocking(move || {
            let unavailable = |e: String| CoreError::EmbeddingUnavailable(e);
            let mut guard = loaded
                .lock()
                .map_err(|_| unavailable("local model lock poisoned".to_string()))?;
            if guard.is_none() {
                let init = fastembed::InitOptions::new(model).with_show_download_progress(false);
                let instance = fastembed::TextEmbedding::try_new(init).map_err(|e| {
                    unavailable(format!("failed to initialize local embedding model: {}", e))
                })?;
                *guard = Some(instance);
            }
            let instance = guard
                .as_mut()
                .ok_or_else(|| unavailable("local model not loaded".to_string()))?;
            instance
                .embed(texts, Some(batch_size))
                .map_err(|e| unavailable(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| CoreError::EmbeddingUnavailable(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct FailingBackend {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EmbeddingBackend for FailingBackend {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::EmbeddingUnavailable("certificate verify failed".into()))
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl EmbeddingBackend for SlowBackend {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(texts.iter().map(|_| vec![1.0; 8]).collect())
        }
    }

    struct FixedBackend {
        dims: usize,
    }

    #[async_trait]
    impl EmbeddingBackend for FixedBackend {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.5; self.dims]).collect())
        }
    }

    #[tokio::test]
    async fn test_primary_success() {
        let p = EmbeddingProvider::new(
            Some(Box::new(FixedBackend { dims: 8 })),
            8,
            Duration::from_secs(1),
        );
        let out = p.embed("hello").await;
        assert!(!out.is_degraded());
        assert_eq!(out.value().len(), 8);
        assert_eq!(p.provider_version(), "fixed@8");
    }

    #[tokio::test]
    async fn test_failure_activates_fallback_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let p = EmbeddingProvider::new(
            Some(Box::new(FailingBackend {
                calls: Arc::clone(&calls),
            })),
            8,
            Duration::from_secs(1),
        );

        let first = p.embed("failed logins").await;
        assert!(first.is_degraded());
        assert!(p.is_degraded());
        assert_eq!(first.value(), &HashEmbedder::new(8).embed_one("failed logins"));

        let second = p.embed("failed logins").await;
        assert!(second.is_degraded());
        assert_eq!(first, second);
        // The primary is never retried after the switch.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.provider_version(), "hash-fallback-v1@8");
    }

    #[tokio::test]
    async fn test_timeout_activates_fallback() {
        let p = EmbeddingProvider::new(Some(Box::new(SlowBackend)), 8, Duration::from_millis(50));
        let out = p.embed("x").await;
        assert!(out.is_degraded());
        assert!(p.is_degraded());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_activates_fallback() {
        let p = EmbeddingProvider::new(
            Some(Box::new(FixedBackend { dims: 4 })),
            8,
            Duration::from_secs(1),
        );
        let out = p.embed_batch(&["a".to_string(), "b".to_string()]).await;
        assert!(out.is_degraded());
        assert_eq!(out.value().len(), 2);
        assert!(out.value().iter().all(|v| v.len() == 8));
    }

    #[tokio::test]
    async fn test_hash_only_is_not_marked_degraded() {
        let p = EmbeddingProvider::hash_only(16);
        let out = p.embed("SecurityEvent").await;
        assert!(out.is_degraded());
        assert!(!p.is_degraded());
        assert_eq!(p.provider_version(), "hash-fallback-v1@16");
    }

    #[test]
    fn test_from_config_without_key_falls_back() {
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            api_key_env: "NL2KQL_TEST_KEY_THAT_IS_NOT_SET".to_string(),
            ..EmbeddingConfig::default()
        };
        let p = EmbeddingProvider::from_config(&config);
        assert!(p.is_degraded());
    }

    #[test]
    fn test_parse_embeddings_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [2.0, 2.0]},
                {"index": 0, "embedding": [1.0, 1.0]}
            ]
        });
        let out = parse_embeddings_response(&json).unwrap();
        assert_eq!(out, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
        assert!(parse_embeddings_response(&serde_json::json!({})).is_err());
    }
}
