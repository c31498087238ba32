//! Text to vector providers.
//!
//! The retriever only sees the [`EmbeddingProvider`] trait. Two providers
//! ship with the crate: a deterministic feature-hashing embedder for offline
//! use and tests, and an HTTP client for an Ollama-style embeddings endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{EmbeddingFailure, Result, RetrievalError};
use crate::model::{NewTransaction, Transaction};
use crate::vector;

/// Default Ollama API URL.
pub const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Errors raised by an embedding backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("provider returned {got} dimensions, expected {expected}")]
    Dimension { expected: usize, got: usize },

    #[error("Provider not available: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Retrying cannot fix a model that emits the wrong vector size.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Dimension { .. })
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Maps text to a fixed-length vector.
///
/// Implementations must be deterministic for a given model and always
/// return `dimension()` values.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> ProviderResult<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> ProviderResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

// --- HASHING EMBEDDER ---

/// Feature-hashing embedder: each lower-cased alphanumeric token adds
/// +-1 to one bucket chosen by `seahash`, then the vector is L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in tokens(text) {
            let h = seahash::hash(token.as_bytes());
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
            v[bucket] += sign;
        }
        vector::normalize(&mut v);
        v
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> ProviderResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

// --- HTTP EMBEDDER ---

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Client for `POST {base_url}/api/embeddings`.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimension,
        }
    }

    /// Overrides the HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/embeddings", self.base_url)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn name(&self) -> &str {
        "http"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> ProviderResult<Vec<f32>> {
        let body = EmbeddingRequest { model: &self.model, prompt: text };
        let response = self.client.post(self.endpoint()).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status: status.as_u16(), message });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        if parsed.embedding.is_empty() {
            return Err(ProviderError::InvalidResponse("empty embedding".to_string()));
        }
        if parsed.embedding.len() != self.dimension {
            return Err(ProviderError::Dimension { expected: self.dimension, got: parsed.embedding.len() });
        }
        debug!(model = %self.model, chars = text.len(), "embedded text");
        Ok(parsed.embedding)
    }
}

/// Embeds the text of each new record and returns finished transactions.
pub async fn embed_transactions(
    provider: &dyn EmbeddingProvider,
    batch: Vec<NewTransaction>,
) -> Result<Vec<Transaction>> {
    let texts: Vec<String> = batch.iter().map(NewTransaction::embedding_text).collect();
    let vectors = provider.embed_batch(&texts).await.map_err(|e| match e {
        ProviderError::Dimension { expected, got } => RetrievalError::DimensionMismatch { expected, got },
        other => RetrievalError::EmbeddingUnavailable {
            attempts: 1,
            cause: EmbeddingFailure::Provider(other.to_string()),
        },
    })?;

    if vectors.len() != batch.len() {
        return Err(RetrievalError::EmbeddingUnavailable {
            attempts: 1,
            cause: EmbeddingFailure::Provider(format!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            )),
        });
    }

    let dimension = provider.dimension();
    let mut out = Vec::with_capacity(batch.len());
    for (record, embedding) in batch.into_iter().zip(vectors) {
        if embedding.len() != dimension {
            return Err(RetrievalError::DimensionMismatch { expected: dimension, got: embedding.len() });
        }
        out.push(record.with_embedding(embedding));
    }
    info!(provider = provider.name(), count = out.len(), "embedded transactions");
    Ok(out)
}

/// Embeds `pending` in provider rounds of at most `batch_size` records.
/// Nothing is returned unless every round succeeds.
pub async fn embed_in_batches(
    provider: &dyn EmbeddingProvider,
    pending: Vec<NewTransaction>,
    batch_size: usize,
) -> Result<Vec<Transaction>> {
    let batch_size = batch_size.max(1);
    let mut out = Vec::with_capacity(pending.len());
    let mut rest = pending.into_iter().peekable();
    while rest.peek().is_some() {
        let round: Vec<NewTransaction> = rest.by_ref().take(batch_size).collect();
        out.extend(embed_transactions(provider, round).await?);
    }
    Ok(out)
}
