//! Retrieval orchestrator: query text plus predicate in, ranked records out.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::embedding::EmbeddingProvider;
use crate::error::{EmbeddingFailure, Result, RetrievalError};
use crate::filter::Predicate;
use crate::model::{Transaction, TxnId};
use crate::storage::RecordStore;
use crate::summary::{self, Summary};
use crate::{Catalog, Corpus};

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub max_top_k: usize,
    /// Post-filter asks the index for `top_k * overfetch_multiplier` hits first.
    pub overfetch_multiplier: usize,
    pub overfetch_ceiling: usize,
    /// Stores at or below this size always pre-filter.
    pub prefilter_max_records: usize,
    /// Above `prefilter_max_records`, pre-filter when the sampled match rate is below this.
    pub prefilter_selectivity: f64,
    pub selectivity_sample: usize,
    pub embed_timeout: Duration,
    /// Total tries, the first one included.
    pub embed_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            max_top_k: 100,
            overfetch_multiplier: 3,
            overfetch_ceiling: 1000,
            prefilter_max_records: 10_000,
            prefilter_selectivity: 0.05,
            selectivity_sample: 512,
            embed_timeout: Duration::from_secs(5),
            embed_attempts: 3,
            backoff_base: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Unfiltered,
    /// Predicate evaluated inside the index scan.
    PreFilter,
    /// Over-fetch from the index, then drop non-matching hits.
    PostFilter,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Unfiltered => "unfiltered",
            Strategy::PreFilter => "pre-filter",
            Strategy::PostFilter => "post-filter",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub predicate: Predicate,
    pub top_k: usize,
    /// Bypasses strategy selection when set.
    pub strategy: Option<Strategy>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, top_k: usize) -> Self {
        Self { query: query.into(), predicate: Predicate::all(), top_k, strategy: None }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub record: Arc<Transaction>,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub strategy: Strategy,
    pub generation: Uuid,
}

impl SearchResponse {
    pub fn ids(&self) -> Vec<TxnId> {
        self.hits.iter().map(|h| h.record.id).collect()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn summary(&self) -> Option<Summary> {
        summary::summarize(self.hits.iter().map(|h| h.record.as_ref()))
    }
}

pub struct Retriever {
    catalog: Arc<Catalog>,
    provider: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(catalog: Arc<Catalog>, provider: Arc<dyn EmbeddingProvider>, config: RetrievalConfig) -> Self {
        Self { catalog, provider, config }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Embeds the query, then ranks the active generation against it.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.check_top_k(request.top_k)?;
        if request.query.trim().is_empty() {
            return Err(RetrievalError::invalid("query text is empty"));
        }

        let vector = self.embed_query(&request.query).await?;
        let corpus = self.catalog.snapshot();
        let response = self.rank(&corpus, &vector, &request.predicate, request.top_k, request.strategy)?;

        info!(
            query = %request.query,
            filter = %request.predicate,
            top_k = request.top_k,
            hits = response.hits.len(),
            strategy = %response.strategy,
            "search complete"
        );
        Ok(response)
    }

    /// Ranks against a precomputed query vector.
    pub fn search_vector(&self, vector: &[f32], predicate: &Predicate, top_k: usize) -> Result<SearchResponse> {
        self.check_top_k(top_k)?;
        let corpus = self.catalog.snapshot();
        self.rank(&corpus, vector, predicate, top_k, None)
    }

    fn check_top_k(&self, top_k: usize) -> Result<()> {
        if top_k == 0 || top_k > self.config.max_top_k {
            return Err(RetrievalError::invalid(format!(
                "top_k must be between 1 and {}, got {}",
                self.config.max_top_k, top_k
            )));
        }
        Ok(())
    }

    // --- EMBEDDING ---

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let attempts = self.config.embed_attempts.max(1);
        let mut cause = EmbeddingFailure::Provider("no attempt made".to_string());

        for attempt in 1..=attempts {
            match timeout(self.config.embed_timeout, self.provider.embed(text)).await {
                Ok(Ok(vector)) => return Ok(vector),
                Ok(Err(e)) if !e.is_retryable() => {
                    return Err(match e {
                        crate::embedding::ProviderError::Dimension { expected, got } => {
                            RetrievalError::DimensionMismatch { expected, got }
                        }
                        other => RetrievalError::EmbeddingUnavailable {
                            attempts: attempt,
                            cause: EmbeddingFailure::Provider(other.to_string()),
                        },
                    });
                }
                Ok(Err(e)) => {
                    warn!(provider = self.provider.name(), attempt, error = %e, "embedding failed");
                    cause = EmbeddingFailure::Provider(e.to_string());
                }
                Err(_) => {
                    warn!(provider = self.provider.name(), attempt, timeout = ?self.config.embed_timeout, "embedding timed out");
                    cause = EmbeddingFailure::Timeout(self.config.embed_timeout);
                }
            }

            if attempt < attempts {
                sleep(self.backoff(attempt)).await;
            }
        }

        Err(RetrievalError::EmbeddingUnavailable { attempts, cause })
    }

    /// `base * 2^(attempt-1)` plus up to half of that again as jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base.saturating_mul(1u32 << (attempt - 1).min(10));
        let spread = (base.as_millis() as u64) / 2;
        let jitter = if spread == 0 { 0 } else { rand::thread_rng().gen_range(0..=spread) };
        base + Duration::from_millis(jitter)
    }

    // --- RANKING ---

    fn choose_strategy(&self, corpus: &Corpus, predicate: &Predicate) -> Strategy {
        if predicate.is_empty() {
            return Strategy::Unfiltered;
        }
        if corpus.len() <= self.config.prefilter_max_records {
            return Strategy::PreFilter;
        }
        let selectivity = predicate.selectivity(corpus.records(), self.config.selectivity_sample);
        debug!(selectivity, "sampled predicate selectivity");
        if selectivity < self.config.prefilter_selectivity {
            Strategy::PreFilter
        } else {
            Strategy::PostFilter
        }
    }

    fn rank(
        &self,
        corpus: &Corpus,
        query: &[f32],
        predicate: &Predicate,
        top_k: usize,
        forced: Option<Strategy>,
    ) -> Result<SearchResponse> {
        let strategy = match (forced, predicate.is_empty()) {
            (_, true) => Strategy::Unfiltered,
            (Some(s), false) => s,
            (None, false) => self.choose_strategy(corpus, predicate),
        };

        let store = corpus.records();
        let index = corpus.index();
        let matches = |id: TxnId| store.get(id).map_or(false, |r| predicate.matches(r));

        let raw = match strategy {
            Strategy::Unfiltered => index.search(query, top_k)?,
            Strategy::PreFilter => index.search_where(query, top_k, &matches)?,
            Strategy::PostFilter => {
                let total = index.len();
                let ceiling = self.config.overfetch_ceiling.max(top_k);
                let mut k = top_k.saturating_mul(self.config.overfetch_multiplier).clamp(top_k, ceiling);
                loop {
                    let fetched = index.search(query, k)?;
                    let survivors: Vec<(TxnId, f32)> = fetched.into_iter().filter(|(id, _)| matches(*id)).collect();
                    if survivors.len() >= top_k || k >= total || k >= ceiling {
                        debug!(k, survivors = survivors.len(), "post-filter settled");
                        break survivors;
                    }
                    k = k.saturating_mul(2).min(ceiling);
                }
            }
        };

        let hits = join(store, dedupe(raw, top_k))?;
        Ok(SearchResponse { hits, strategy, generation: corpus.generation() })
    }
}

/// Keeps the best-scoring occurrence of each id, ordered by score desc then id asc.
fn dedupe(mut raw: Vec<(TxnId, f32)>, top_k: usize) -> Vec<(TxnId, f32)> {
    raw.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let mut seen = HashSet::with_capacity(raw.len());
    raw.retain(|(id, _)| seen.insert(*id));
    raw.truncate(top_k);
    raw
}

fn join(store: &dyn RecordStore, ranked: Vec<(TxnId, f32)>) -> Result<Vec<SearchHit>> {
    ranked
        .into_iter()
        .map(|(id, score)| match store.get(id) {
            Some(record) => Ok(SearchHit { record: Arc::clone(record), score }),
            None => Err(RetrievalError::inconsistent(format!("{} is indexed but missing from the store", id))),
        })
        .collect()
}
