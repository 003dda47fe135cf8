use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use price_watcher::adapters::AdapterRegistry;
use price_watcher::config::{AppConfig, Secrets};
use price_watcher::db::store::OfferStore;
use price_watcher::monitoring::logger;
use price_watcher::notify::NotifierSet;
use price_watcher::watch::evaluator::Evaluator;
use price_watcher::watch::models::ProductWatch;

#[derive(Debug, Parser)]
#[command(name = "price-watcher")]
#[command(about = "Watch store prices and notify when a product drops below its limit")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a single watch run.
    Run,
    /// Run every `agent.frequency_minutes` until Ctrl-C.
    Watch,
    /// Print recorded offers for a store as JSON lines. Needs no secrets.
    History {
        #[arg(long)]
        store: String,
    },
    /// Validate the configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // History reads the offer store only, so it skips validation and secrets.
    let (config, secrets) = match &cli.command {
        Commands::History { .. } => (AppConfig::read(&cli.config)?, Secrets::default()),
        _ => AppConfig::load(&cli.config)?,
    };

    logger::init_logging(&config.monitoring)?;

    match cli.command {
        Commands::Run => {
            let evaluator = build_evaluator(&config, &secrets).await?;
            evaluator.run_once().await.context("Watch run aborted")?;
            Ok(())
        }
        Commands::Watch => watch(&config, &secrets).await,
        Commands::History { store } => history(&config, &store).await,
        Commands::CheckConfig => check_config(&cli.config, &config, &secrets),
    }
}

async fn build_evaluator(config: &AppConfig, secrets: &Secrets) -> Result<Evaluator> {
    let products = product_watches(config)?;
    let registry = AdapterRegistry::from_config(config, secrets)?;
    let notifiers = NotifierSet::from_config(config, secrets)?;
    let store = OfferStore::new(&config.database.path)
        .await
        .with_context(|| format!("Failed to open offer store at {}", config.database.path))?;

    if notifiers.is_empty() {
        tracing::warn!("No notification channels enabled; qualifying offers will only be logged");
    }

    tracing::info!(
        products = products.len(),
        stores = registry.len(),
        channels = ?notifiers.channel_names(),
        database = %config.database.path,
        "Price watcher initialized"
    );

    Ok(Evaluator::new(
        products,
        registry,
        Arc::new(store),
        notifiers,
        config.agent.search_timeout(),
        config.agent.max_concurrent_searches,
    ))
}

fn product_watches(config: &AppConfig) -> Result<Vec<ProductWatch>> {
    config
        .products
        .iter()
        .map(|p| Ok(ProductWatch::from_config(p)?))
        .collect()
}

async fn watch(config: &AppConfig, secrets: &Secrets) -> Result<()> {
    let evaluator = build_evaluator(config, secrets).await?;
    let interval = Duration::from_secs(config.agent.frequency_minutes.max(1) * 60);

    tracing::info!(frequency_minutes = config.agent.frequency_minutes, "Watching");

    loop {
        match evaluator.run_once().await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e).context("Watch run aborted"),
            Err(e) => tracing::error!(error = %e, "Watch run failed"),
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }

    Ok(())
}

async fn history(config: &AppConfig, store_id: &str) -> Result<()> {
    let store = OfferStore::new(&config.database.path)
        .await
        .with_context(|| format!("Failed to open offer store at {}", config.database.path))?;

    for record in store.all_for_store(store_id).await? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn check_config(path: &Path, config: &AppConfig, secrets: &Secrets) -> Result<()> {
    let products = product_watches(config)?;
    let registry = AdapterRegistry::from_config(config, secrets)?;
    let notifiers = NotifierSet::from_config(config, secrets)?;

    println!(
        "{}: OK ({} products, {} stores, channels: {:?})",
        path.display(),
        products.len(),
        registry.len(),
        notifiers.channel_names()
    );
    Ok(())
}
