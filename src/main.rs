use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use ledgerlens::config::{self, AppContext, EmbedderKind, Settings};
use ledgerlens::embedding::embed_in_batches;
use ledgerlens::filter::Predicate;
use ledgerlens::model::NewTransaction;
use ledgerlens::vector::Metric;
use ledgerlens::SearchRequest;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Semantic search over financial transactions", long_about = None)]
struct Args {
    /// Directory holding records.log and vectors.idx.
    #[clap(long, env = "LEDGERLENS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// `hashing` (offline) or `http` (Ollama-style endpoint).
    #[clap(long)]
    embedder: Option<EmbedderKind>,

    #[clap(long)]
    embedder_url: Option<String>,

    #[clap(long)]
    model: Option<String>,

    #[clap(long)]
    dimension: Option<usize>,

    #[clap(long)]
    metric: Option<Metric>,

    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Embed a JSON array of transactions and add them to the catalog.
    Index {
        input: PathBuf,
        /// Records embedded per provider round.
        #[clap(long, default_value = "256")]
        batch: usize,
    },
    /// Rank transactions against a natural-language query.
    Query {
        text: String,
        /// e.g. "amount >= 500 AND category = 'Travel'"
        #[clap(long, short)]
        filter: Option<String>,
        #[clap(long, short = 'k')]
        top_k: Option<usize>,
        #[clap(long)]
        json: bool,
    },
    /// Totals, users and per-category counts.
    Stats {
        #[clap(long)]
        json: bool,
    },
    /// Rule-based summary of the catalog, one user, or a query's results.
    Summary {
        #[clap(long)]
        user: Option<String>,
        /// Summarise the top hits for this query instead of stored records.
        #[clap(long, conflicts_with = "user")]
        query: Option<String>,
        #[clap(long, short)]
        filter: Option<String>,
        #[clap(long, short = 'k')]
        top_k: Option<usize>,
        #[clap(long)]
        json: bool,
    },
    /// Rebuild the vector index from stored embeddings and save it.
    Rebuild,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(dir) = &self.data_dir {
            settings.data_dir = dir.clone();
        }
        if let Some(kind) = self.embedder {
            settings.embedder = kind;
        }
        if let Some(url) = &self.embedder_url {
            settings.embedder_url = url.clone();
        }
        if let Some(model) = &self.model {
            settings.embedder_model = model.clone();
        }
        if let Some(dimension) = self.dimension {
            settings.dimension = dimension;
        }
        if let Some(metric) = self.metric {
            settings.metric = metric;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut settings = Settings::from_env()?;
    args.apply(&mut settings);
    settings.validate()?;

    config::init_tracing(&settings.log_filter);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.worker_threads)
        .enable_all()
        .build()?;

    let result = runtime.block_on(async_main(args.command, settings));
    if let Err(e) = &result {
        error!(error = %e, "command failed");
    }
    result
}

async fn async_main(command: Cmd, settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = AppContext::init(settings)?;

    match command {
        Cmd::Index { input, batch } => {
            let raw = fs::read_to_string(&input)?;
            let pending: Vec<NewTransaction> = serde_json::from_str(&raw)?;
            info!(file = %input.display(), records = pending.len(), "loaded transactions");

            // Embed the whole file first so the import publishes one generation or none.
            let embedded = embed_in_batches(ctx.retriever.provider().as_ref(), pending, batch).await?;
            let added = ctx.catalog.ingest(embedded)?;
            println!("Indexed {} transactions ({} total).", added, ctx.catalog.len());
        }

        Cmd::Query { text, filter, top_k, json } => {
            let predicate = match filter {
                Some(expr) => Predicate::parse(&expr)?,
                None => Predicate::all(),
            };
            let top_k = top_k.unwrap_or(ctx.settings.retrieval.default_top_k);
            let request = SearchRequest::new(text, top_k).filter(predicate);
            let response = ctx.retriever.search(&request).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("Found {} matches ({}):", response.len(), response.strategy);
                for hit in &response.hits {
                    let t = &hit.record;
                    println!(
                        "  {:.4}  {}  {}  {:>12}  {:<18}  {}",
                        hit.score,
                        t.id,
                        t.date,
                        t.amount,
                        t.category.name(),
                        t.description
                    );
                }
            }
        }

        Cmd::Stats { json } => {
            let stats = ctx.catalog.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Transactions: {}", stats.total_transactions);
                println!("Users:        {}", stats.total_users);
                println!("Debit:        {}", stats.total_debit);
                println!("Credit:       {}", stats.total_credit);
                println!("Net balance:  {}", stats.net_balance);
                for (category, count) in &stats.categories {
                    println!("  {:<18} {}", category, count);
                }
            }
        }

        Cmd::Summary { user, query, filter, top_k, json } => {
            let summary = match query {
                Some(text) => {
                    let predicate = match filter {
                        Some(expr) => Predicate::parse(&expr)?,
                        None => Predicate::all(),
                    };
                    let top_k = top_k.unwrap_or(ctx.settings.retrieval.default_top_k);
                    let request = SearchRequest::new(text, top_k).filter(predicate);
                    ctx.retriever.search(&request).await?.summary()
                }
                None => ctx.catalog.summary(user.as_deref()),
            };

            match (summary, json) {
                (Some(summary), true) => println!("{}", serde_json::to_string_pretty(&summary)?),
                (Some(summary), false) => println!("{}", summary),
                (None, _) => println!("No transactions to summarize."),
            }
        }

        Cmd::Rebuild => {
            let generation = ctx.catalog.rebuild()?;
            ctx.catalog.save(&ctx.settings.data_dir)?;
            println!("Rebuilt index {} over {} transactions.", generation, ctx.catalog.len());
        }
    }

    ctx.shutdown()?;
    Ok(())
}
