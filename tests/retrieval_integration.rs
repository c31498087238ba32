use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use ledgerlens::embedding::{embed_transactions, EmbeddingProvider, HashingEmbedder, ProviderError, ProviderResult};
use ledgerlens::error::RetrievalError;
use ledgerlens::filter::Predicate;
use ledgerlens::model::{Amount, Category, NewTransaction, TxDate, TxnId, TxnKind};
use ledgerlens::retrieval::Strategy;
use ledgerlens::vector::Metric;
use ledgerlens::{Catalog, ErrorKind, RetrievalConfig, Retriever, SearchRequest, INDEX_FILE};

const DIM: usize = 64;

struct Fixture {
    vectors: HashMap<&'static str, Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for Fixture {
    fn name(&self) -> &str {
        "fixture"
    }

    fn dimension(&self) -> usize {
        3
    }

    async fn embed(&self, text: &str) -> ProviderResult<Vec<f32>> {
        self.vectors
            .get(text)
            .cloned()
            .ok_or_else(|| ProviderError::Unavailable(text.to_string()))
    }
}

/// Never answers in time.
struct Stalled;

#[async_trait]
impl EmbeddingProvider for Stalled {
    fn name(&self) -> &str {
        "stalled"
    }

    fn dimension(&self) -> usize {
        3
    }

    async fn embed(&self, _text: &str) -> ProviderResult<Vec<f32>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(vec![0.0; 3])
    }
}

fn quick() -> RetrievalConfig {
    RetrievalConfig {
        embed_timeout: Duration::from_millis(25),
        backoff_base: Duration::from_millis(1),
        ..RetrievalConfig::default()
    }
}

fn pending(id: u64, user: &str, description: &str, category: Category, amount: f64, day: u32) -> NewTransaction {
    NewTransaction {
        id: TxnId(id),
        user_id: user.to_string(),
        description: description.to_string(),
        merchant: String::new(),
        category,
        kind: if category == Category::Income { TxnKind::Credit } else { TxnKind::Debit },
        amount: Amount::from_major(amount),
        date: TxDate::from_ymd(2024, 5, day).unwrap(),
    }
}

fn three_record_retriever(provider: Arc<dyn EmbeddingProvider>) -> Retriever {
    let records = vec![
        pending(1, "USER001", "coffee", Category::FoodAndDining, 150.0, 1).with_embedding(vec![1.0, 0.0, 0.0]),
        pending(2, "USER001", "coffee shop", Category::FoodAndDining, 160.0, 2).with_embedding(vec![0.9, 0.3, 0.1]),
        pending(3, "USER002", "rent payment", Category::BillsAndUtilities, 15000.0, 3).with_embedding(vec![0.0, 0.2, 1.0]),
    ];
    let catalog = Arc::new(Catalog::from_transactions(3, Metric::Cosine, records).unwrap());
    Retriever::new(catalog, provider, quick())
}

fn coffee_fixture() -> Arc<dyn EmbeddingProvider> {
    let mut vectors = HashMap::new();
    vectors.insert("coffee", vec![1.0, 0.05, 0.0]);
    Arc::new(Fixture { vectors })
}

const DESCRIPTIONS: [(&str, Category); 12] = [
    ("Coffee at Blue Tokai", Category::FoodAndDining),
    ("Lunch at Saravana Bhavan", Category::FoodAndDining),
    ("Groceries at BigBasket", Category::Shopping),
    ("Uber ride to airport", Category::Transportation),
    ("Netflix subscription", Category::Entertainment),
    ("Electricity bill payment", Category::BillsAndUtilities),
    ("Pharmacy at Apollo", Category::Healthcare),
    ("Flight to Goa", Category::Travel),
    ("Online course fee", Category::Education),
    ("Monthly salary credit", Category::Income),
    ("Apartment rent payment", Category::BillsAndUtilities),
    ("Movie tickets at PVR", Category::Entertainment),
];

async fn hashed_catalog(count: u64) -> (Arc<Catalog>, Arc<HashingEmbedder>) {
    let embedder = Arc::new(HashingEmbedder::new(DIM));
    let batch: Vec<NewTransaction> = (1..=count)
        .map(|id| {
            let (text, category) = DESCRIPTIONS[(id as usize - 1) % DESCRIPTIONS.len()];
            let user = format!("USER{:03}", id % 4 + 1);
            pending(id, &user, &format!("{} #{}", text, id), category, 100.0 * id as f64, (id % 28 + 1) as u32)
        })
        .collect();
    let records = embed_transactions(embedder.as_ref(), batch).await.unwrap();
    let catalog = Arc::new(Catalog::from_transactions(DIM, Metric::Cosine, records).unwrap());
    (catalog, embedder)
}

#[tokio::test]
async fn coffee_ranks_above_rent() {
    let retriever = three_record_retriever(coffee_fixture());
    let response = retriever.search(&SearchRequest::new("coffee", 3)).await.unwrap();
    let ids = response.ids();
    assert_eq!(ids.len(), 3);
    let rent = ids.iter().position(|id| *id == TxnId(3)).unwrap();
    assert!(ids.iter().position(|id| *id == TxnId(1)).unwrap() < rent);
    assert!(ids.iter().position(|id| *id == TxnId(2)).unwrap() < rent);
}

#[tokio::test]
async fn large_amount_filter_yields_only_rent() {
    let retriever = three_record_retriever(coffee_fixture());
    let request = SearchRequest::new("coffee", 10).filter(Predicate::parse("amount >= 10000").unwrap());
    let response = retriever.search(&request).await.unwrap();
    assert_eq!(response.ids(), vec![TxnId(3)]);
}

#[tokio::test]
async fn filtered_results_summarise_to_their_own_totals() {
    let retriever = three_record_retriever(coffee_fixture());
    let request = SearchRequest::new("coffee", 10).filter(Predicate::parse("category = 'Food & Dining'").unwrap());
    let summary = retriever.search(&request).await.unwrap().summary().unwrap();
    assert_eq!(summary.overview.total_transactions, 2);
    assert_eq!(summary.overview.total_debit, Amount::from_major(310.0));
    assert_eq!(summary.insights.top_spending_category, Some(Category::FoodAndDining));
    assert_eq!(summary.insights.savings_rate, 0.0);
}

#[tokio::test]
async fn zero_top_k_is_invalid_argument() {
    let retriever = three_record_retriever(coffee_fixture());
    let err = retriever.search(&SearchRequest::new("coffee", 0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn provider_timeout_is_embedding_unavailable() {
    let retriever = three_record_retriever(Arc::new(Stalled));
    let err = retriever.search(&SearchRequest::new("coffee", 3)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmbeddingUnavailable);
    assert!(matches!(err, RetrievalError::EmbeddingUnavailable { attempts: 3, .. }));
}

#[tokio::test]
async fn own_embedding_comes_back_first() {
    let (catalog, embedder) = hashed_catalog(40).await;
    let retriever = Retriever::new(catalog.clone(), embedder, quick());

    for id in [1u64, 17, 40] {
        let record = catalog.get(TxnId(id)).unwrap();
        let response = retriever.search_vector(&record.embedding, &Predicate::all(), 5).unwrap();
        assert_eq!(response.hits[0].record.id, TxnId(id));
        assert!((response.hits[0].score - 1.0).abs() < 1e-4);
    }
}

#[tokio::test]
async fn ranking_invariants_hold_across_filters() {
    let (catalog, embedder) = hashed_catalog(60).await;
    let retriever = Retriever::new(catalog, embedder, quick());

    let filters = [
        "",
        "user_id = 'USER002'",
        "category IN ('Food & Dining', 'Travel')",
        "amount BETWEEN 500 AND 2500",
        "date >= 2024-05-10 AND amount < 4000",
        "user_id = 'USER404'",
    ];
    for expr in filters {
        let predicate = Predicate::parse(expr).unwrap();
        for strategy in [Strategy::PreFilter, Strategy::PostFilter] {
            for top_k in [1, 7, 100] {
                let request = SearchRequest::new("rent payment for apartment", top_k)
                    .filter(predicate.clone())
                    .strategy(strategy);
                let response = retriever.search(&request).await.unwrap();

                assert!(response.len() <= top_k);
                assert!(response.hits.windows(2).all(|w| {
                    w[0].score > w[1].score || (w[0].score == w[1].score && w[0].record.id < w[1].record.id)
                }));
                let unique: HashSet<TxnId> = response.ids().into_iter().collect();
                assert_eq!(unique.len(), response.len());
                assert!(response.hits.iter().all(|h| predicate.matches(&h.record)));
            }
        }
        if expr == "user_id = 'USER404'" {
            let response = retriever.search(&SearchRequest::new("rent", 5).filter(predicate)).await.unwrap();
            assert!(response.is_empty());
        }
    }
}

#[tokio::test]
async fn pre_and_post_filter_agree_when_matches_are_plentiful() {
    let (catalog, embedder) = hashed_catalog(48).await;
    let retriever = Retriever::new(catalog, embedder, quick());
    let predicate = Predicate::parse("user_id IN ('USER001', 'USER002', 'USER003')").unwrap();

    let pre = retriever
        .search(&SearchRequest::new("coffee", 5).filter(predicate.clone()).strategy(Strategy::PreFilter))
        .await
        .unwrap();
    let post = retriever
        .search(&SearchRequest::new("coffee", 5).filter(predicate).strategy(Strategy::PostFilter))
        .await
        .unwrap();
    assert_eq!(pre.ids(), post.ids());
}

#[tokio::test]
async fn rebuild_is_stable() {
    let (catalog, embedder) = hashed_catalog(30).await;
    let retriever = Retriever::new(catalog.clone(), embedder, quick());
    let request = SearchRequest::new("flight to goa", 10);

    let before = retriever.search(&request).await.unwrap();
    catalog.rebuild().unwrap();
    let after = retriever.search(&request).await.unwrap();

    assert_ne!(before.generation, after.generation);
    assert_eq!(before.ids(), after.ids());
    let scores = |r: &ledgerlens::SearchResponse| r.hits.iter().map(|h| h.score).collect::<Vec<_>>();
    assert_eq!(scores(&before), scores(&after));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn searches_run_while_writers_publish() {
    let (catalog, embedder) = hashed_catalog(20).await;
    let retriever = Arc::new(Retriever::new(catalog.clone(), embedder.clone(), quick()));

    let mut readers = Vec::new();
    for _ in 0..8 {
        let retriever = retriever.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..25 {
                let response = retriever.search(&SearchRequest::new("coffee", 10)).await.unwrap();
                let unique: HashSet<TxnId> = response.ids().into_iter().collect();
                assert_eq!(unique.len(), response.len());
                tokio::task::yield_now().await;
            }
        }));
    }

    for id in 21..=40u64 {
        let batch = vec![pending(id, "USER009", &format!("Coffee refill #{}", id), Category::FoodAndDining, 3.5, 9)];
        let records = embed_transactions(embedder.as_ref(), batch).await.unwrap();
        catalog.ingest(records).unwrap();
        if id % 5 == 0 {
            catalog.rebuild().unwrap();
        }
    }

    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(catalog.len(), 40);
    assert_eq!(catalog.snapshot().index().len(), 40);
}

#[tokio::test]
async fn persisted_catalog_serves_identical_results() {
    let dir = tempfile::tempdir().unwrap();
    let (catalog, embedder) = hashed_catalog(25).await;
    catalog.save(dir.path()).unwrap();
    let stats = catalog.stats();

    let reopened = Arc::new(Catalog::open(dir.path(), DIM, Metric::Cosine).unwrap());
    let request = SearchRequest::new("electricity bill", 5).filter(Predicate::parse("amount <= 2000").unwrap());

    let original = Retriever::new(catalog, embedder.clone(), quick()).search(&request).await.unwrap();
    let loaded = Retriever::new(reopened.clone(), embedder, quick()).search(&request).await.unwrap();
    assert_eq!(original.ids(), loaded.ids());
    assert_eq!(reopened.stats(), stats);
}

#[tokio::test]
async fn mismatched_files_fail_loudly() {
    let small_dir = tempfile::tempdir().unwrap();
    let large_dir = tempfile::tempdir().unwrap();
    let (small, _) = hashed_catalog(5).await;
    let (large, _) = hashed_catalog(6).await;
    small.save(small_dir.path()).unwrap();
    large.save(large_dir.path()).unwrap();

    fs::copy(large_dir.path().join(INDEX_FILE), small_dir.path().join(INDEX_FILE)).unwrap();
    let err = Catalog::open(small_dir.path(), DIM, Metric::Cosine).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IndexInconsistent);
}
