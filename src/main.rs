mod config;
mod coordinator;
mod error;
mod models;
mod monitor;
mod notifier;
mod scrapers;
mod store;

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::{Config, USER_AGENT};
use monitor::{shutdown_signal, Monitor};
use notifier::{DiscordNotifier, Notifier};
use scrapers::{BrowserSession, CraigslistScraper, FacebookScraper, ListingSource};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};
use store::SeenStore;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// CouchFinder - watches Facebook Marketplace and Craigslist for new
/// furniture listings and posts them to Discord.
#[derive(Parser, Debug)]
#[command(name = "couch-finder", version)]
struct Cli {
    /// Skip Facebook Marketplace (Craigslist only)
    #[arg(long)]
    skip_facebook: bool,

    /// Skip Craigslist (Facebook only)
    #[arg(long)]
    skip_craigslist: bool,

    /// Verify the database, Chrome and Discord webhooks, then exit
    #[arg(long)]
    check: bool,

    /// Run a single check instead of polling
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    init_logging(&config.log_file)?;

    if cli.check {
        return run_check(&config).await;
    }

    info!("==================================================");
    info!("🛋️ CouchFinder Starting");
    info!("==================================================");

    let notifier = Arc::new(DiscordNotifier::new(config.webhooks())?);
    if !notifier.has_webhooks() {
        bail!("No Discord webhooks configured in .env");
    }

    if let Err(e) = run_monitor(&config, &cli, notifier.clone()).await {
        error!("Unexpected error: {:#}", e);
        notifier
            .send_error(&format!("CouchFinder crashed: {:#}", e))
            .await;
        return Err(e);
    }

    Ok(())
}

/// Log to stdout and append the same lines to `log_file`
fn init_logging(log_file: &Path) -> Result<()> {
    if let Some(dir) = log_file.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .init();

    Ok(())
}

async fn run_monitor(config: &Config, cli: &Cli, notifier: Arc<DiscordNotifier>) -> Result<()> {
    info!("Initializing database...");
    let store = SeenStore::open(&config.database_file)
        .await
        .with_context(|| format!("Failed to open {}", config.database_file.display()))?;

    if !notifier.test_webhooks().await {
        warn!("Discord webhook test failed - notifications may not work");
    }

    let mut sources: Vec<Arc<dyn ListingSource>> = Vec::new();

    if !cli.skip_facebook {
        info!("Initializing Facebook scraper...");
        match FacebookScraper::new(
            &config.facebook_marketplace_url,
            config.browser_data_dir.clone(),
            config.headless,
            config.search_params(),
            config.furniture_keywords.clone(),
            USER_AGENT,
        ) {
            Ok(scraper) => sources.push(Arc::new(scraper)),
            Err(e) => {
                error!("Failed to initialize Facebook scraper: {:#}", e);
                info!("Continuing with Craigslist only");
            }
        }
    }

    if !cli.skip_craigslist {
        info!("Initializing Craigslist scraper...");
        sources.push(Arc::new(CraigslistScraper::new(
            &config.craigslist_base_url,
            config.craigslist_categories.clone(),
            config.search_params(),
            USER_AGENT,
        )?));
    }

    if sources.is_empty() {
        bail!("No scrapers available, exiting");
    }

    notifier.send_startup().await;

    info!("Press Ctrl+C to stop");
    Monitor::new(config, store, notifier, sources)
        .run(shutdown_signal(), cli.once)
        .await;

    Ok(())
}

/// One-shot dependency check
async fn run_check(config: &Config) -> Result<()> {
    info!("Checking dependencies...");

    let store = SeenStore::open(&config.database_file)
        .await
        .with_context(|| format!("Failed to open {}", config.database_file.display()))?;
    info!("Database OK: {:?}", store.count_by_platform().await?);

    let profile_dir = config.browser_data_dir.clone();
    let session =
        tokio::task::spawn_blocking(move || BrowserSession::launch(&profile_dir, true, USER_AGENT))
            .await
            .context("Chrome launch task panicked")??;
    session.close();
    info!("Chrome OK");

    let notifier = DiscordNotifier::new(config.webhooks())?;
    if notifier.test_webhooks().await {
        info!("Discord webhooks OK");
    } else {
        warn!("Discord webhooks missing or unreachable");
    }

    Ok(())
}
