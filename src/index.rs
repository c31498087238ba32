use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ordered_float::OrderedFloat;

use crate::error::{Result, RetrievalError};
use crate::model::TxnId;
use crate::vector::Metric;

const INDEX_MAGIC: &[u8; 4] = b"LLVX";
const INDEX_VERSION: u32 = 1;

/// Nearest-neighbour capability over one embedding per transaction.
///
/// Implementations must return hits ordered by descending similarity with
/// ties broken by ascending id, so that repeated queries are reproducible.
pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;
    fn metric(&self) -> Metric;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: TxnId) -> bool;

    /// Ids in insertion order.
    fn ids(&self) -> Vec<TxnId>;

    fn insert(&mut self, id: TxnId, vector: Vec<f32>) -> Result<()>;

    /// Top `k` by similarity, restricted to ids accepted by `accept`.
    fn search_where(&self, query: &[f32], k: usize, accept: &dyn Fn(TxnId) -> bool) -> Result<Vec<(TxnId, f32)>>;

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(TxnId, f32)>> {
        self.search_where(query, k, &|_| true)
    }

    /// A fresh, empty index with the same dimension and metric.
    fn empty_like(&self) -> Box<dyn VectorIndex>;

    fn boxed_clone(&self) -> Box<dyn VectorIndex>;

    fn save(&self, path: &Path) -> Result<()>;
}

/// Heap entry. "Greater" means a better hit: higher score, then lower id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ranked {
    score: OrderedFloat<f32>,
    id: TxnId,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Exact brute-force index. Vectors live in one contiguous buffer in
/// insertion order; positions are stable until the index is rebuilt.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    metric: Metric,
    ids: Vec<TxnId>,
    vectors: Vec<f32>,
    positions: HashMap<TxnId, usize>,
}

impl FlatIndex {
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            dimension,
            metric,
            ids: Vec::new(),
            vectors: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn vector(&self, id: TxnId) -> Option<&[f32]> {
        let pos = *self.positions.get(&id)?;
        Some(&self.vectors[pos * self.dimension..(pos + 1) * self.dimension])
    }

    fn check_query(&self, query: &[f32], k: usize) -> Result<()> {
        if k == 0 {
            return Err(RetrievalError::invalid("k must be greater than zero"));
        }
        if query.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch { expected: self.dimension, got: query.len() });
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            return Err(RetrievalError::Corrupt(format!("{}: not a vector index file", path.display())));
        }

        let version = read_u32(&mut reader)?;
        if version != INDEX_VERSION {
            return Err(RetrievalError::Corrupt(format!("{}: unsupported index version {}", path.display(), version)));
        }

        let dimension = read_u32(&mut reader)? as usize;
        let mut metric_byte = [0u8; 1];
        reader.read_exact(&mut metric_byte)?;
        let metric = Metric::from_code(metric_byte[0])
            .ok_or_else(|| RetrievalError::Corrupt(format!("{}: unknown metric code {}", path.display(), metric_byte[0])))?;
        let count = read_u32(&mut reader)? as usize;

        let mut index = FlatIndex::new(dimension, metric);
        index.ids.reserve(count);
        index.vectors.reserve(count * dimension);

        let mut id_buf = [0u8; 8];
        let mut f32_buf = [0u8; 4];
        for _ in 0..count {
            reader.read_exact(&mut id_buf)?;
            let id = TxnId(u64::from_le_bytes(id_buf));

            let mut vector = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                reader.read_exact(&mut f32_buf)?;
                vector.push(f32::from_le_bytes(f32_buf));
            }
            index.insert(id, vector).map_err(|e| match e {
                RetrievalError::DuplicateId(id) => {
                    RetrievalError::Corrupt(format!("{}: id {} stored twice", path.display(), id))
                }
                other => other,
            })?;
        }
        Ok(index)
    }
}

impl VectorIndex for FlatIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn contains(&self, id: TxnId) -> bool {
        self.positions.contains_key(&id)
    }

    fn ids(&self) -> Vec<TxnId> {
        self.ids.clone()
    }

    fn insert(&mut self, id: TxnId, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch { expected: self.dimension, got: vector.len() });
        }
        if self.positions.contains_key(&id) {
            return Err(RetrievalError::DuplicateId(id));
        }
        self.positions.insert(id, self.ids.len());
        self.ids.push(id);
        self.vectors.extend_from_slice(&vector);
        Ok(())
    }

    fn search_where(&self, query: &[f32], k: usize, accept: &dyn Fn(TxnId) -> bool) -> Result<Vec<(TxnId, f32)>> {
        self.check_query(query, k)?;

        // Min-heap of the best k seen so far; the root is the weakest survivor.
        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k.min(self.ids.len()) + 1);

        for (pos, id) in self.ids.iter().enumerate() {
            if !accept(*id) {
                continue;
            }
            let v = &self.vectors[pos * self.dimension..(pos + 1) * self.dimension];
            let cand = Ranked { score: OrderedFloat(self.metric.similarity(query, v)), id: *id };

            if heap.len() < k {
                heap.push(Reverse(cand));
            } else if let Some(Reverse(weakest)) = heap.peek() {
                if cand > *weakest {
                    heap.pop();
                    heap.push(Reverse(cand));
                }
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(r)| (r.id, r.score.into_inner()))
            .collect())
    }

    fn empty_like(&self) -> Box<dyn VectorIndex> {
        Box::new(FlatIndex::new(self.dimension, self.metric))
    }

    fn boxed_clone(&self) -> Box<dyn VectorIndex> {
        Box::new(self.clone())
    }

    fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(INDEX_MAGIC)?;
        writer.write_all(&INDEX_VERSION.to_le_bytes())?;
        writer.write_all(&(self.dimension as u32).to_le_bytes())?;
        writer.write_all(&[self.metric.code()])?;
        writer.write_all(&(self.ids.len() as u32).to_le_bytes())?;

        for (pos, id) in self.ids.iter().enumerate() {
            writer.write_all(&id.0.to_le_bytes())?;
            for val in &self.vectors[pos * self.dimension..(pos + 1) * self.dimension] {
                writer.write_all(&val.to_le_bytes())?;
            }
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

fn read_u32<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
