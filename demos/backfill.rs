//! Backfill embeddings for a seeded in-memory store.
//!
//! Usage:
//!   cargo run --example backfill
//!   cargo run --example backfill -- --items 500 --batch-size 25 --max-concurrency 8
//!   cargo run --example backfill -- --owner alice
//!   OPENAI_API_KEY=sk-... cargo run --example backfill -- --provider openai --provider mock
//!   cargo run --example backfill -- --config runner.json
//!
//! Ctrl-C stops the run at the next batch boundary.

use std::sync::Arc;

use clap::Parser;
use embed_orchestrator::{
    BatchEvent, BatchRunner, CancellationToken, EmbeddingCoordinator, EmbeddingProvider,
    EmbeddingStore, InMemoryStore, ItemProcessor, MockEmbedder, OpenAiEmbedder, RunnerConfig,
    WorkItem,
};

#[derive(Parser)]
#[command(name = "backfill", about = "Embed every item that is missing a vector")]
struct Cli {
    /// Provider: "mock", "mock2" or "openai". Repeat for several; exactly two
    /// runs in dual mode. Each may appear once, since vectors are stored
    /// under the provider's name.
    #[arg(long = "provider", default_values_t = vec!["mock".to_string(), "mock2".to_string()])]
    providers: Vec<String>,

    /// Number of items to seed
    #[arg(long, default_value_t = 50)]
    items: i64,

    /// Only process this owner's items
    #[arg(long)]
    owner: Option<String>,

    /// Items per batch (overrides the config file)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Cap on in-flight items per batch
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// JSON runner config
    #[arg(long)]
    config: Option<String>,

    /// OpenAI-compatible base URL
    #[arg(long)]
    base_url: Option<String>,

    /// OpenAI embedding model
    #[arg(long, default_value = "text-embedding-3-small")]
    model: String,
}

fn build_provider(cli: &Cli, name: &str) -> Arc<dyn EmbeddingProvider> {
    match name {
        "mock" => Arc::new(MockEmbedder::new("mock", 32)),
        "mock2" => Arc::new(MockEmbedder::new("mock2", 16)),
        "openai" => {
            let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| {
                eprintln!("error: OPENAI_API_KEY not set");
                std::process::exit(1);
            });
            let mut p = OpenAiEmbedder::new(api_key, &cli.model, 1536);
            if let Some(ref url) = cli.base_url {
                p = p.with_base_url(url);
            }
            Arc::new(p)
        }
        other => {
            eprintln!("error: unknown provider '{other}'. Use 'mock', 'mock2', or 'openai'.");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => RunnerConfig::load(path).await.unwrap_or_else(|e| {
            eprintln!("error: {e}");
            std::process::exit(1);
        }),
        None => RunnerConfig::default(),
    };
    if let Some(size) = cli.batch_size {
        config = config.with_batch_size(size);
    }
    if let Some(limit) = cli.max_concurrency {
        config = config.with_max_concurrency(limit);
    }
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let store = Arc::new(InMemoryStore::new());
    for id in 1..=cli.items {
        let owner = if id % 2 == 0 { "alice" } else { "bob" };
        store
            .insert_item(WorkItem::new(id, owner, format!("transcript number {id}")))
            .await;
    }
    let store_port: Arc<dyn EmbeddingStore> = store.clone();

    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = cli.providers.iter().find(|name| !seen.insert(name.as_str())) {
        eprintln!("error: provider '{dup}' given more than once");
        std::process::exit(1);
    }

    let mut coordinator = EmbeddingCoordinator::new(Arc::clone(&store_port));
    for name in &cli.providers {
        coordinator = coordinator.with_shared_provider(build_provider(&cli, name));
    }
    let mode = if coordinator.is_dual() { "dual" } else { "general" };
    let coordinator: Arc<dyn ItemProcessor> = Arc::new(coordinator);

    let (tx, mut rx) = tokio::sync::mpsc::channel::<BatchEvent>(64);
    let runner = Arc::new(
        BatchRunner::new(Arc::clone(&coordinator), Arc::clone(&store_port))
            .with_config(config)
            .with_events(tx),
    );

    eprintln!("embed-orchestrator backfill");
    eprintln!("providers: {} ({mode} mode)", coordinator.provider_names().join(", "));
    eprintln!("items: {}", cli.items);
    eprintln!("---");

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                BatchEvent::Progress {
                    batch,
                    progress,
                    processed,
                    failed,
                } => {
                    eprintln!("  batch {batch}: {progress:.1}% ({processed} ok, {failed} failed)");
                }
                BatchEvent::Paused { before_batch } => eprintln!("  paused before batch {before_batch}"),
                BatchEvent::Resumed => eprintln!("  resumed"),
                BatchEvent::Stopped { .. } => eprintln!("  stopped"),
                _ => {}
            }
        }
    });

    let stopper = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                runner.stop();
            }
        })
    };

    let cancel = CancellationToken::new();
    let outcome = match cli.owner {
        Some(ref owner) => runner.process_for_owner(&cancel, owner).await,
        None => runner.process_all(&cancel).await,
    };
    stopper.abort();
    let _ = stopper.await;
    drop(runner);
    printer.await.ok();

    match outcome {
        Ok(result) => {
            eprintln!(
                "done: {} processed, {} failed, {} vectors stored",
                result.processed,
                result.failed,
                store.embedding_count().await
            );
            for failure in result.errors.iter().take(5) {
                eprintln!("  item {}: {}", failure.item_id, failure.error);
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }

    if let Err(e) = store_port.close().await {
        eprintln!("error: failed to close store: {e}");
    }
}
