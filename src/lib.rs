pub mod model;
pub mod error;
pub mod vector;
pub mod index;
pub mod storage;
pub mod filter;
pub mod parser;
pub mod embedding;
pub mod retrieval;
pub mod summary;
pub mod config;

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, RetrievalError};
use crate::index::{FlatIndex, VectorIndex};
use crate::model::{Category, Transaction, TxnId};
use crate::storage::{MemoryStore, RecordStore, StoreStats};
use crate::summary::Summary;
use crate::vector::Metric;

pub use crate::error::ErrorKind;
pub use crate::retrieval::{RetrievalConfig, Retriever, SearchRequest, SearchResponse};

pub const RECORDS_FILE: &str = "records.log";
pub const INDEX_FILE: &str = "vectors.idx";

/// One immutable generation of the record store and its vector index.
///
/// Scores are only comparable between hits from the same generation.
pub struct Corpus {
    generation: Uuid,
    records: MemoryStore,
    index: Box<dyn VectorIndex>,
}

impl Corpus {
    fn new(records: MemoryStore, index: Box<dyn VectorIndex>) -> Self {
        Self { generation: Uuid::new_v4(), records, index }
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn records(&self) -> &MemoryStore {
        &self.records
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Holder of the active corpus.
///
/// Readers take a cheap `Arc` snapshot and search it without holding any lock.
/// Writers are serialised, build the next generation off to the side and
/// publish it with a single pointer swap.
pub struct Catalog {
    active: RwLock<Arc<Corpus>>,
    writer: Mutex<()>,
    dimension: usize,
    metric: Metric,
    dirty: AtomicBool,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Catalog")
            .field("generation", &snapshot.generation)
            .field("records", &snapshot.len())
            .field("dimension", &self.dimension)
            .field("metric", &self.metric)
            .finish()
    }
}

impl Catalog {
    pub fn new(dimension: usize, metric: Metric) -> Self {
        let corpus = Corpus::new(MemoryStore::new(), Box::new(FlatIndex::new(dimension, metric)));
        Self {
            active: RwLock::new(Arc::new(corpus)),
            writer: Mutex::new(()),
            dimension,
            metric,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn from_transactions(dimension: usize, metric: Metric, records: Vec<Transaction>) -> Result<Self> {
        let catalog = Self::new(dimension, metric);
        catalog.ingest(records)?;
        Ok(catalog)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// True when the active generation has not been saved yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Arc<Corpus> {
        // Generations are immutable, so a poisoned lock still guards a whole one.
        let guard = self.active.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    fn publish(&self, corpus: Corpus) -> Uuid {
        let generation = corpus.generation;
        let mut guard = self.active.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(corpus);
        generation
    }

    // --- WRITES ---

    /// Adds a batch atomically: either every record becomes visible in one
    /// new generation, or nothing changes.
    pub fn ingest(&self, batch: Vec<Transaction>) -> Result<usize> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot();

        let mut seen = std::collections::HashSet::with_capacity(batch.len());
        for record in &batch {
            if record.embedding.len() != self.dimension {
                return Err(RetrievalError::DimensionMismatch { expected: self.dimension, got: record.embedding.len() });
            }
            if current.records.contains(record.id) || !seen.insert(record.id) {
                return Err(RetrievalError::DuplicateId(record.id));
            }
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let mut records = current.records.clone();
        let mut index = current.index.boxed_clone();
        let added = batch.len();
        for record in batch {
            index.insert(record.id, record.embedding.clone())?;
            records.push(Arc::new(record))?;
        }

        let generation = self.publish(Corpus::new(records, index));
        self.dirty.store(true, Ordering::Release);
        info!(%generation, added, total = current.len() + added, "published new corpus generation");
        Ok(added)
    }

    pub fn insert(&self, record: Transaction) -> Result<()> {
        self.ingest(vec![record]).map(|_| ())
    }

    /// Rebuilds the index from the stored embeddings into a fresh instance and
    /// swaps it in. Searches already running keep using the old generation.
    pub fn rebuild(&self) -> Result<Uuid> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot();

        let mut index = current.index.empty_like();
        for record in current.records.iter() {
            index.insert(record.id, record.embedding.clone())?;
        }

        let generation = self.publish(Corpus::new(current.records.clone(), index));
        info!(%generation, previous = %current.generation, records = current.len(), "index rebuilt");
        Ok(generation)
    }

    // --- READS ---

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn get(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.snapshot().records.get(id).cloned()
    }

    pub fn by_user(&self, user_id: &str, limit: usize) -> Vec<Arc<Transaction>> {
        self.snapshot().records.by_user(user_id, limit)
    }

    pub fn by_category(&self, category: Category, limit: usize) -> Vec<Arc<Transaction>> {
        self.snapshot().records.by_category(category, limit)
    }

    pub fn users(&self) -> Vec<String> {
        self.snapshot().records.users()
    }

    pub fn categories(&self) -> Vec<Category> {
        self.snapshot().records.categories()
    }

    pub fn stats(&self) -> StoreStats {
        self.snapshot().records.stats()
    }

    /// Rule-based summary of every record, or of one user's. `None` when
    /// nothing matches.
    pub fn summary(&self, user_id: Option<&str>) -> Option<Summary> {
        let corpus = self.snapshot();
        let records = corpus.records.iter().map(|t| t.as_ref());
        match user_id {
            Some(user) => summary::summarize(records.filter(|t| t.user_id == user)),
            None => summary::summarize(records),
        }
    }

    // --- PERSISTENCE ---

    /// Writes `records.log` and `vectors.idx` into `dir`. Each file is written
    /// under a temporary name and renamed into place.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let corpus = self.snapshot();
        fs::create_dir_all(dir)?;

        let records_path = dir.join(RECORDS_FILE);
        let index_path = dir.join(INDEX_FILE);
        let records_tmp = records_path.with_extension("log.tmp");
        let index_tmp = index_path.with_extension("idx.tmp");

        storage::write_record_log(&records_tmp, self.dimension, &corpus.records)?;
        corpus.index.save(&index_tmp)?;
        fs::rename(&records_tmp, &records_path)?;
        fs::rename(&index_tmp, &index_path)?;

        self.dirty.store(false, Ordering::Release);
        info!(dir = %dir.display(), records = corpus.len(), generation = %corpus.generation, "catalog saved");
        Ok(())
    }

    /// Loads the record log and the vector index independently and checks
    /// that they describe the same records. Any disagreement is fatal.
    pub fn open(dir: &Path, dimension: usize, metric: Metric) -> Result<Self> {
        let records_path = dir.join(RECORDS_FILE);
        let index_path = dir.join(INDEX_FILE);

        match (records_path.exists(), index_path.exists()) {
            (false, false) => {
                info!(dir = %dir.display(), "no persisted catalog, starting empty");
                return Ok(Self::new(dimension, metric));
            }
            (true, false) => {
                return Err(RetrievalError::inconsistent(format!(
                    "{} exists but {} is missing",
                    records_path.display(),
                    index_path.display()
                )))
            }
            (false, true) => {
                return Err(RetrievalError::inconsistent(format!(
                    "{} exists but {} is missing",
                    index_path.display(),
                    records_path.display()
                )))
            }
            (true, true) => {}
        }

        let log = storage::read_record_log(&records_path)?;
        let index = FlatIndex::load(&index_path)?;

        if log.dimension != index.dimension() {
            return Err(RetrievalError::inconsistent(format!(
                "record log has dimension {}, index has {}",
                log.dimension,
                index.dimension()
            )));
        }
        if index.dimension() != dimension {
            return Err(RetrievalError::DimensionMismatch { expected: dimension, got: index.dimension() });
        }
        if index.metric() != metric {
            return Err(RetrievalError::invalid(format!(
                "index was built with metric '{}', configured '{}'",
                index.metric().name(),
                metric.name()
            )));
        }
        if log.records.len() != index.len() {
            return Err(RetrievalError::inconsistent(format!(
                "record log holds {} records, index holds {} vectors",
                log.records.len(),
                index.len()
            )));
        }

        let mut records = MemoryStore::new();
        for record in log.records {
            match index.vector(record.id) {
                None => {
                    return Err(RetrievalError::inconsistent(format!("{} is stored but not indexed", record.id)));
                }
                Some(vector) if vector != record.embedding.as_slice() => {
                    return Err(RetrievalError::inconsistent(format!("{} has a stale index vector", record.id)));
                }
                Some(_) => {}
            }
            records.push(Arc::new(record)).map_err(|e| match e {
                RetrievalError::DuplicateId(id) => RetrievalError::Corrupt(format!("{} stored twice in record log", id)),
                other => other,
            })?;
        }

        let corpus = Corpus::new(records, Box::new(index));
        info!(dir = %dir.display(), records = corpus.len(), generation = %corpus.generation, "catalog loaded");
        Ok(Self {
            active: RwLock::new(Arc::new(corpus)),
            writer: Mutex::new(()),
            dimension,
            metric,
            dirty: AtomicBool::new(false),
        })
    }

    /// Saves only if something changed since the last save or load.
    pub fn save_if_dirty(&self, dir: &Path) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        match self.save(dir) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, "failed to persist catalog");
                Err(e)
            }
        }
    }
}
