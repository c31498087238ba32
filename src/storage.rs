use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use rkyv::Deserialize;
use serde::Serialize;

use crate::error::{Result, RetrievalError};
use crate::model::{Amount, Category, Transaction, TxnId, TxnKind};

const LOG_MAGIC: &[u8; 4] = b"LLRL";
const LOG_VERSION: u32 = 1;
// magic + version + dimension + count
const LOG_HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Read access to the ingested transactions, in ingestion order.
pub trait RecordStore: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, id: TxnId) -> Option<&Arc<Transaction>>;

    /// Record at ingestion position `pos`.
    fn at(&self, pos: usize) -> Option<&Arc<Transaction>>;

    fn iter(&self) -> Box<dyn Iterator<Item = &Arc<Transaction>> + '_>;
}

/// Ordered in-memory store with an id lookup table.
///
/// Records are shared behind `Arc` so that cloning the store for a
/// copy-on-write publish only copies pointers.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Vec<Arc<Transaction>>,
    positions: HashMap<TxnId, usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: TxnId) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn push(&mut self, record: Arc<Transaction>) -> Result<()> {
        if self.positions.contains_key(&record.id) {
            return Err(RetrievalError::DuplicateId(record.id));
        }
        self.positions.insert(record.id, self.records.len());
        self.records.push(record);
        Ok(())
    }

    /// Newest first, ties by ascending id.
    pub fn by_user(&self, user_id: &str, limit: usize) -> Vec<Arc<Transaction>> {
        newest_first(self.records.iter().filter(|t| t.user_id == user_id), limit)
    }

    pub fn by_category(&self, category: Category, limit: usize) -> Vec<Arc<Transaction>> {
        newest_first(self.records.iter().filter(|t| t.category == category), limit)
    }

    pub fn users(&self) -> Vec<String> {
        let users: BTreeSet<&str> = self.records.iter().map(|t| t.user_id.as_str()).collect();
        users.into_iter().map(str::to_owned).collect()
    }

    pub fn categories(&self) -> Vec<Category> {
        let cats: BTreeSet<Category> = self.records.iter().map(|t| t.category).collect();
        cats.into_iter().collect()
    }

    pub fn stats(&self) -> StoreStats {
        let mut categories: BTreeMap<String, usize> = BTreeMap::new();
        let mut total = 0i64;
        let mut debit = 0i64;
        let mut credit = 0i64;

        for t in &self.records {
            *categories.entry(t.category.name().to_string()).or_insert(0) += 1;
            let minor = t.amount.minor();
            total += minor;
            match t.kind {
                TxnKind::Debit => debit += minor,
                TxnKind::Credit => credit += minor,
            }
        }

        let users = self.users();
        StoreStats {
            total_transactions: self.records.len(),
            total_users: users.len(),
            users,
            categories,
            total_amount: Amount::from_minor(total),
            total_debit: Amount::from_minor(debit),
            total_credit: Amount::from_minor(credit),
            net_balance: Amount::from_minor(credit - debit),
        }
    }
}

impl RecordStore for MemoryStore {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, id: TxnId) -> Option<&Arc<Transaction>> {
        self.positions.get(&id).map(|&pos| &self.records[pos])
    }

    fn at(&self, pos: usize) -> Option<&Arc<Transaction>> {
        self.records.get(pos)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Arc<Transaction>> + '_> {
        Box::new(self.records.iter())
    }
}

fn newest_first<'a>(records: impl Iterator<Item = &'a Arc<Transaction>>, limit: usize) -> Vec<Arc<Transaction>> {
    let mut out: Vec<Arc<Transaction>> = records.cloned().collect();
    out.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
    out.truncate(limit);
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_transactions: usize,
    pub total_users: usize,
    pub users: Vec<String>,
    pub categories: BTreeMap<String, usize>,
    pub total_amount: Amount,
    pub total_debit: Amount,
    pub total_credit: Amount,
    pub net_balance: Amount,
}

/// Contents of a record log as read back from disk.
#[derive(Debug)]
pub struct RecordLog {
    pub dimension: usize,
    pub records: Vec<Transaction>,
}

/// Writes every record as a length-prefixed rkyv frame:
/// `[header][len u32][bytes]...`.
pub fn write_record_log(path: &Path, dimension: usize, store: &dyn RecordStore) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(LOG_MAGIC)?;
    writer.write_all(&LOG_VERSION.to_le_bytes())?;
    writer.write_all(&(dimension as u32).to_le_bytes())?;
    writer.write_all(&(store.len() as u64).to_le_bytes())?;

    for record in store.iter() {
        let bytes = rkyv::to_bytes::<_, 4096>(record.as_ref())
            .map_err(|e| RetrievalError::Corrupt(format!("cannot encode {}: {}", record.id, e)))?;
        writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&bytes)?;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Reads a record log through a read-only memory map, validating every frame.
pub fn read_record_log(path: &Path) -> Result<RecordLog> {
    let file = File::open(path)?;
    let corrupt = |what: String| RetrievalError::Corrupt(format!("{}: {}", path.display(), what));

    if (file.metadata()?.len() as usize) < LOG_HEADER_LEN {
        return Err(corrupt("truncated header".into()));
    }

    // SAFETY: the file is opened read-only and only read through this mapping;
    // concurrent external truncation is outside the supported use.
    let mmap = unsafe { Mmap::map(&file)? };
    let bytes = &mmap[..];

    if &bytes[..4] != LOG_MAGIC {
        return Err(corrupt("not a record log".into()));
    }
    let version = le_u32(&bytes[4..8]);
    if version != LOG_VERSION {
        return Err(corrupt(format!("unsupported record log version {}", version)));
    }
    let dimension = le_u32(&bytes[8..12]) as usize;
    let count = le_u64(&bytes[12..20]) as usize;

    let mut records = Vec::with_capacity(count.min(1 << 20));
    let mut offset = LOG_HEADER_LEN;

    for n in 0..count {
        let len_end = offset + 4;
        if len_end > bytes.len() {
            return Err(corrupt(format!("frame {} missing", n)));
        }
        let len = le_u32(&bytes[offset..len_end]) as usize;
        let end = len_end + len;
        if end > bytes.len() {
            return Err(corrupt(format!("frame {} truncated", n)));
        }

        // rkyv needs the archive aligned; mmap offsets are not.
        let mut aligned = rkyv::AlignedVec::with_capacity(len);
        aligned.extend_from_slice(&bytes[len_end..end]);

        let archived = rkyv::check_archived_root::<Transaction>(&aligned[..])
            .map_err(|e| corrupt(format!("frame {} invalid: {:?}", n, e)))?;
        let record: Transaction = match archived.deserialize(&mut rkyv::Infallible) {
            Ok(record) => record,
            Err(never) => match never {},
        };
        records.push(record);
        offset = end;
    }

    if offset != bytes.len() {
        return Err(corrupt(format!("{} trailing bytes after {} records", bytes.len() - offset, count)));
    }

    Ok(RecordLog { dimension, records })
}

fn le_u32(b: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&b[..4]);
    u32::from_le_bytes(buf)
}

fn le_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TxDate;
    use pretty_assertions::assert_eq;

    fn txn(id: u64, user: &str, category: Category, kind: TxnKind, amount: i64, date: &str) -> Arc<Transaction> {
        Arc::new(Transaction {
            id: TxnId(id),
            user_id: user.to_string(),
            description: format!("txn {}", id),
            merchant: "Acme".to_string(),
            category,
            kind,
            amount: Amount::from_minor(amount),
            date: date.parse::<TxDate>().unwrap(),
            embedding: vec![id as f32, 1.0],
        })
    }

    fn sample_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.push(txn(1, "USER001", Category::FoodAndDining, TxnKind::Debit, 15_000, "2024-01-05")).unwrap();
        store.push(txn(2, "USER002", Category::Income, TxnKind::Credit, 5_000_000, "2024-01-31")).unwrap();
        store.push(txn(3, "USER001", Category::Travel, TxnKind::Debit, 2_500_000, "2024-03-10")).unwrap();
        store.push(txn(4, "USER001", Category::FoodAndDining, TxnKind::Debit, 16_000, "2024-03-10")).unwrap();
        store
    }

    #[test]
    fn push_rejects_duplicate_ids() {
        let mut store = sample_store();
        let err = store.push(txn(2, "USER009", Category::Shopping, TxnKind::Debit, 1, "2024-01-01")).unwrap_err();
        assert!(matches!(err, RetrievalError::DuplicateId(TxnId(2))));
        assert_eq!(store.len(), 4);
        assert_eq!(store.get(TxnId(2)).unwrap().user_id, "USER002");
    }

    #[test]
    fn lookup_by_id_and_position() {
        let store = sample_store();
        assert_eq!(store.at(2).unwrap().id, TxnId(3));
        assert!(store.get(TxnId(99)).is_none());
        assert!(store.at(4).is_none());
    }

    #[test]
    fn user_listing_is_newest_first() {
        let store = sample_store();
        let ids: Vec<u64> = store.by_user("USER001", 10).iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![3, 4, 1]);
        assert_eq!(store.by_user("USER001", 1).len(), 1);
        assert!(store.by_user("USER404", 10).is_empty());
    }

    #[test]
    fn category_listing_and_distinct_values() {
        let store = sample_store();
        let ids: Vec<u64> = store.by_category(Category::FoodAndDining, 10).iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![4, 1]);
        assert_eq!(store.users(), vec!["USER001".to_string(), "USER002".to_string()]);
        assert_eq!(
            store.categories(),
            vec![Category::FoodAndDining, Category::Travel, Category::Income]
        );
    }

    #[test]
    fn stats_split_debits_and_credits() {
        let stats = sample_store().stats();
        assert_eq!(stats.total_transactions, 4);
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.categories.get("Food & Dining"), Some(&2));
        assert_eq!(stats.total_debit, Amount::from_minor(2_531_000));
        assert_eq!(stats.total_credit, Amount::from_minor(5_000_000));
        assert_eq!(stats.net_balance, Amount::from_minor(2_469_000));
    }

    #[test]
    fn record_log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.log");
        let store = sample_store();
        write_record_log(&path, 2, &store).unwrap();

        let log = read_record_log(&path).unwrap();
        assert_eq!(log.dimension, 2);
        assert_eq!(log.records.len(), 4);
        assert_eq!(&log.records[2], store.at(2).unwrap().as_ref());
    }

    #[test]
    fn record_log_detects_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.log");
        write_record_log(&path, 2, &sample_store()).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(read_record_log(&path), Err(RetrievalError::Corrupt(_))));

        std::fs::write(&path, b"LLRL").unwrap();
        assert!(matches!(read_record_log(&path), Err(RetrievalError::Corrupt(_))));
    }
}
