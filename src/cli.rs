use std::io::{self, Write};

use ledgerlens::config::{self, AppContext, Settings};
use ledgerlens::filter::Predicate;
use ledgerlens::model::{Category, Transaction};
use ledgerlens::parser::{self, Command};
use ledgerlens::SearchRequest;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;
    // Shell output goes to stdout; keep the log quiet unless RUST_LOG says otherwise.
    config::init_tracing("warn");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.worker_threads)
        .enable_all()
        .build()?;

    print_banner();
    let ctx = match AppContext::init(settings) {
        Ok(ctx) => ctx,
        Err(e) => {
            println!("[\u{2717}] Could not open catalog: {}", e);
            return Err(e.into());
        }
    };
    println!(
        "[\u{2713}] Loaded {} transactions from {} ({} embedder).",
        ctx.catalog.len(),
        ctx.settings.data_dir.display(),
        ctx.retriever.provider().name()
    );
    println!("Type 'HELP' for supported commands or 'EXIT' to quit.\n");

    let stdin = io::stdin();
    let mut buffer = String::new();

    loop {
        print!("ledgerlens> ");
        io::stdout().flush()?;
        buffer.clear();

        if stdin.read_line(&mut buffer)? == 0 { break; }
        if buffer.trim().is_empty() { continue; }

        match parser::parse_command(&buffer) {
            Ok(Command::Exit) => break,
            Ok(cmd) => {
                if let Err(e) = execute_command(&runtime, &ctx, cmd) {
                    println!("[\u{26a0}\u{fe0f} Error] {}", e);
                }
            }
            Err(e) => {
                println!("[\u{2717} Syntax Error] {}", e);
                if buffer.to_uppercase().starts_with("SEARCH") && !buffer.contains('\'') && !buffer.contains('"') {
                    println!("    \u{2139}\u{fe0f}  Hint: quote the query text: SEARCH 'coffee' LIMIT 5");
                } else if buffer.to_uppercase().contains(" WHERE ") {
                    println!("    \u{2139}\u{fe0f}  Hint: WHERE amount >= 500 AND category = 'Travel'");
                }
            }
        }
    }

    if ctx.shutdown()? {
        println!("[\u{2713}] Catalog saved.");
    }
    Ok(())
}

fn print_banner() {
    println!("\n==================================================");
    println!("   LedgerLens Shell - Semantic Transaction Search");
    println!("==================================================\n");
}

fn print_help() {
    println!("\n--- Available Commands ---");
    println!("1. SEARCH:     SEARCH 'coffee shop' [WHERE amount <= 500 AND user_id = 'USER001'] [LIMIT 5]");
    println!("               filter fields: user_id, category, amount, date");
    println!("               operators: =  >=  <=  >  <  IN ('a', 'b')  BETWEEN x AND y");
    println!("2. GET:        GET TXN000042");
    println!("3. USER:       USER 'USER001' [LIMIT 20]");
    println!("4. CATEGORY:   CATEGORY 'Food & Dining' [LIMIT 20]");
    println!("5. USERS / CATEGORIES / STATS");
    println!("6. SUMMARY:    SUMMARY ['USER001']");
    println!("7. REBUILD:    Rebuild the vector index from stored embeddings");
    println!("8. SAVE:       Persist the catalog now");
    println!("9. EXIT:       Quit (saves pending changes)\n");
}

fn execute_command(
    runtime: &tokio::runtime::Runtime,
    ctx: &AppContext,
    cmd: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        Command::Help => print_help(),

        Command::Search { query, filter, limit } => {
            let predicate = Predicate::from_raw(filter)?;
            let top_k = limit.unwrap_or(ctx.settings.retrieval.default_top_k);
            let request = SearchRequest::new(query, top_k).filter(predicate);
            let response = runtime.block_on(ctx.retriever.search(&request))?;

            println!("\nFound {} matches ({}):", response.len(), response.strategy);
            for hit in &response.hits {
                print!("  \u{2022} ({:.4}) ", hit.score);
                print_transaction(&hit.record);
            }
            println!();
        }

        Command::Get { id } => match ctx.catalog.get(id) {
            Some(t) => print_transaction(&t),
            None => println!("[\u{2717}] {} Not Found.", id),
        },

        Command::User { user_id, limit } => {
            let list = ctx.catalog.by_user(&user_id, limit);
            println!("Transactions for {} (newest first):", user_id);
            list.iter().for_each(|t| print_transaction(t));
        }

        Command::Category { category, limit } => {
            let category: Category = category.parse()?;
            let list = ctx.catalog.by_category(category, limit);
            println!("{} (newest first):", category.name());
            list.iter().for_each(|t| print_transaction(t));
        }

        Command::Users => {
            let users = ctx.catalog.users();
            println!("{} users: {}", users.len(), users.join(", "));
        }

        Command::Categories => {
            let names: Vec<&str> = ctx.catalog.categories().into_iter().map(Category::name).collect();
            println!("{}", names.join(", "));
        }

        Command::Stats => {
            let stats = ctx.catalog.stats();
            println!("Transactions: {}  Users: {}", stats.total_transactions, stats.total_users);
            println!("Debit: {}  Credit: {}  Net: {}", stats.total_debit, stats.total_credit, stats.net_balance);
            for (category, count) in &stats.categories {
                println!("  {:<18} {}", category, count);
            }
        }

        Command::Summary { user_id } => match ctx.catalog.summary(user_id.as_deref()) {
            Some(summary) => println!("\n{}\n", summary),
            None => println!("[\u{2717}] No transactions to summarize."),
        },

        Command::Rebuild => {
            let generation = ctx.catalog.rebuild()?;
            println!("[\u{2713} OK] Index rebuilt (generation {}).", generation);
        }

        Command::Save => {
            ctx.catalog.save(&ctx.settings.data_dir)?;
            println!("[\u{2713} OK] Saved to {}.", ctx.settings.data_dir.display());
        }

        Command::Exit => {}
    }
    Ok(())
}

fn print_transaction(t: &Transaction) {
    println!(
        "{} | {} | {} | {} | {} {} | {}",
        t.id,
        t.date,
        t.user_id,
        t.category.name(),
        t.amount,
        t.kind,
        t.description
    );
}
