//! Start-up settings and the application context built from them.
//!
//! Precedence: built-in defaults, then `LEDGERLENS_*` environment variables
//! (a `.env` file is honoured), then command-line flags applied by the binaries.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::embedding::{EmbeddingProvider, HashingEmbedder, HttpEmbedder, OLLAMA_DEFAULT_URL};
use crate::model::DEFAULT_DIMENSION;
use crate::retrieval::{RetrievalConfig, Retriever};
use crate::vector::Metric;
use crate::Catalog;

pub const DEFAULT_LOG_FILTER: &str = "info,ledgerlens=info";
pub const DEFAULT_MODEL: &str = "all-minilm";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    /// Offline feature hashing. No network.
    Hashing,
    /// Ollama-style embeddings endpoint.
    Http,
}

impl FromStr for EmbedderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hashing" | "hash" => Ok(EmbedderKind::Hashing),
            "http" | "ollama" => Ok(EmbedderKind::Http),
            other => Err(format!("unknown embedder '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub embedder: EmbedderKind,
    pub embedder_url: String,
    pub embedder_model: String,
    pub dimension: usize,
    pub metric: Metric,
    pub retrieval: RetrievalConfig,
    pub worker_threads: usize,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            embedder: EmbedderKind::Hashing,
            embedder_url: OLLAMA_DEFAULT_URL.to_string(),
            embedder_model: DEFAULT_MODEL.to_string(),
            dimension: DEFAULT_DIMENSION,
            metric: Metric::Cosine,
            retrieval: RetrievalConfig::default(),
            worker_threads: worker_threads_for(thread::available_parallelism().map(|n| n.get()).unwrap_or(1)),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// One core still gets a compute thread and an I/O thread.
pub fn worker_threads_for(cores: usize) -> usize {
    if cores <= 1 {
        2
    } else {
        cores
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from any key/value source. `from_env` is this over the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Settings::default();
        let r = &d.retrieval;

        let retrieval = RetrievalConfig {
            default_top_k: parse_var(&lookup, "LEDGERLENS_TOP_K", r.default_top_k)?,
            max_top_k: parse_var(&lookup, "LEDGERLENS_MAX_TOP_K", r.max_top_k)?,
            overfetch_multiplier: parse_var(&lookup, "LEDGERLENS_OVERFETCH", r.overfetch_multiplier)?,
            overfetch_ceiling: parse_var(&lookup, "LEDGERLENS_OVERFETCH_CEILING", r.overfetch_ceiling)?,
            prefilter_max_records: parse_var(&lookup, "LEDGERLENS_PREFILTER_MAX_RECORDS", r.prefilter_max_records)?,
            prefilter_selectivity: parse_var(&lookup, "LEDGERLENS_PREFILTER_SELECTIVITY", r.prefilter_selectivity)?,
            selectivity_sample: parse_var(&lookup, "LEDGERLENS_SELECTIVITY_SAMPLE", r.selectivity_sample)?,
            embed_timeout: Duration::from_millis(parse_var(
                &lookup,
                "LEDGERLENS_EMBED_TIMEOUT_MS",
                r.embed_timeout.as_millis() as u64,
            )?),
            embed_attempts: parse_var(&lookup, "LEDGERLENS_EMBED_ATTEMPTS", r.embed_attempts)?,
            backoff_base: Duration::from_millis(parse_var(
                &lookup,
                "LEDGERLENS_BACKOFF_MS",
                r.backoff_base.as_millis() as u64,
            )?),
        };

        let settings = Settings {
            data_dir: lookup("LEDGERLENS_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            embedder: parse_var(&lookup, "LEDGERLENS_EMBEDDER", d.embedder)?,
            embedder_url: lookup("LEDGERLENS_EMBEDDER_URL").unwrap_or(d.embedder_url),
            embedder_model: lookup("LEDGERLENS_EMBEDDER_MODEL").unwrap_or(d.embedder_model),
            dimension: parse_var(&lookup, "LEDGERLENS_DIMENSION", d.dimension)?,
            metric: parse_var(&lookup, "LEDGERLENS_METRIC", d.metric)?,
            retrieval,
            worker_threads: parse_var(&lookup, "LEDGERLENS_WORKERS", d.worker_threads)?,
            log_filter: lookup("RUST_LOG").unwrap_or(d.log_filter),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, message: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid { key, message: message.to_string() })
        };
        if self.dimension == 0 {
            return invalid("LEDGERLENS_DIMENSION", "must be positive");
        }
        if self.retrieval.max_top_k == 0 {
            return invalid("LEDGERLENS_MAX_TOP_K", "must be positive");
        }
        if self.retrieval.default_top_k == 0 || self.retrieval.default_top_k > self.retrieval.max_top_k {
            return invalid("LEDGERLENS_TOP_K", "must be between 1 and the maximum");
        }
        if self.retrieval.overfetch_multiplier == 0 {
            return invalid("LEDGERLENS_OVERFETCH", "must be positive");
        }
        if self.retrieval.embed_attempts == 0 {
            return invalid("LEDGERLENS_EMBED_ATTEMPTS", "must be positive");
        }
        if !(0.0..=1.0).contains(&self.retrieval.prefilter_selectivity) {
            return invalid("LEDGERLENS_PREFILTER_SELECTIVITY", "must be within [0, 1]");
        }
        if self.worker_threads == 0 {
            return invalid("LEDGERLENS_WORKERS", "must be positive");
        }
        Ok(())
    }

    pub fn build_provider(&self) -> Arc<dyn EmbeddingProvider> {
        match self.embedder {
            EmbedderKind::Hashing => Arc::new(HashingEmbedder::new(self.dimension)),
            EmbedderKind::Http => Arc::new(HttpEmbedder::new(
                self.embedder_url.clone(),
                self.embedder_model.clone(),
                self.dimension,
            )),
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid { key, message: e.to_string() }),
    }
}

/// Installs the global `tracing` subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

/// Everything a binary needs, built once from `Settings` and passed down explicitly.
pub struct AppContext {
    pub settings: Settings,
    pub catalog: Arc<Catalog>,
    pub retriever: Arc<Retriever>,
}

impl AppContext {
    pub fn init(settings: Settings) -> crate::error::Result<Self> {
        let catalog = Arc::new(Catalog::open(&settings.data_dir, settings.dimension, settings.metric)?);
        let provider = settings.build_provider();
        let retriever = Arc::new(Retriever::new(catalog.clone(), provider, settings.retrieval.clone()));

        info!(
            data_dir = %settings.data_dir.display(),
            records = catalog.len(),
            embedder = retriever.provider().name(),
            dimension = settings.dimension,
            metric = settings.metric.name(),
            "application context ready"
        );
        Ok(Self { settings, catalog, retriever })
    }

    /// Persists the catalog if it changed. Returns whether anything was written.
    pub fn shutdown(&self) -> crate::error::Result<bool> {
        let saved = self.catalog.save_if_dirty(&self.settings.data_dir)?;
        info!(saved, "shutdown complete");
        Ok(saved)
    }
}
