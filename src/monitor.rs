use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::CycleError;
use crate::models::Platform;
use crate::notifier::Notifier;
use crate::scrapers::ListingSource;
use crate::store::SeenStore;
use chrono::Local;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of one pass over every platform
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub new_listings: usize,
    pub failed_platforms: usize,
}

/// The long-running poll loop
pub struct Monitor {
    coordinator: Coordinator,
    store: SeenStore,
    notifier: Arc<dyn Notifier>,
    sources: Vec<Arc<dyn ListingSource>>,
    search_terms: Vec<String>,
    check_interval: Duration,
    retention_days: u32,
    login_timeout: Duration,
    needs_login: HashSet<Platform>,
    last_cleanup: Option<Instant>,
    check_count: u64,
}

impl Monitor {
    pub fn new(
        config: &Config,
        store: SeenStore,
        notifier: Arc<dyn Notifier>,
        sources: Vec<Arc<dyn ListingSource>>,
    ) -> Self {
        // Session-backed sources get a login check before their first fetch
        let needs_login = sources
            .iter()
            .filter(|source| source.session().is_some())
            .map(|source| source.platform())
            .collect();

        Self {
            coordinator: Coordinator::new(store.clone(), config.term_concurrency),
            store,
            notifier,
            sources,
            search_terms: config.search_terms.clone(),
            check_interval: config.check_interval,
            retention_days: config.retention_days,
            login_timeout: config.login_timeout,
            needs_login,
            last_cleanup: None,
            check_count: 0,
        }
    }

    /// Poll until `shutdown` is cancelled, or for a single cycle when `once` is set
    pub async fn run(mut self, shutdown: CancellationToken, once: bool) {
        info!(
            "Monitoring started. Check interval: {}s",
            self.check_interval.as_secs()
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Blocking browser work runs on its own threads, so dropping the
            // cycle future returns at once. The store write is a single
            // transaction and is either committed or never started.
            tokio::select! {
                summary = self.run_cycle() => {
                    debug!("Cycle finished: {:?}", summary);
                }
                _ = shutdown.cancelled() => {
                    info!("Abandoning in-flight check");
                    break;
                }
            }

            if once {
                break;
            }

            debug!("Sleeping {}s until next check...", self.check_interval.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.close();
    }

    /// One pass over every platform. Errors are logged, never propagated.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        self.check_count += 1;
        info!(
            "--- Check #{} at {} ---",
            self.check_count,
            Local::now().format("%H:%M:%S")
        );

        let mut summary = CycleSummary::default();

        for source in &self.sources {
            let platform = source.platform();

            if self.needs_login.contains(&platform) {
                if !ensure_session(Arc::clone(source), self.login_timeout).await {
                    error!("{} login failed, skipping {} this check", platform, platform);
                    summary.failed_platforms += 1;
                    continue;
                }
                self.needs_login.remove(&platform);
            }

            match self.poll_platform(source.as_ref()).await {
                Ok(new_listings) => summary.new_listings += new_listings,
                Err(CycleError::AuthRequired { reason, .. }) => {
                    warn!("{} session expired ({}), will log in before next check", platform, reason);
                    self.needs_login.insert(platform);
                    summary.failed_platforms += 1;
                }
                Err(e) => {
                    error!("Error scraping {}: {}", platform, e);
                    summary.failed_platforms += 1;
                }
            }
        }

        match self.store.count_by_platform().await {
            Ok(counts) => info!(
                "Total new this check: {} | DB totals: {:?}",
                summary.new_listings, counts
            ),
            Err(e) => warn!("Could not read DB totals: {}", e),
        }

        // First cleanup runs on the first cycle, then at most once a day
        let cleanup_due = self
            .last_cleanup
            .map_or(true, |last| last.elapsed() >= CLEANUP_INTERVAL);
        if cleanup_due {
            match self.store.cleanup_older_than(self.retention_days).await {
                Ok(removed) => info!("Cleanup: removed {} old listings", removed),
                Err(e) => error!("Cleanup failed: {}", e),
            }
            self.last_cleanup = Some(Instant::now());
        }

        summary
    }

    /// Acquire, notify, then persist. A failed write after a successful send
    /// means the listing is announced again next cycle rather than lost.
    async fn poll_platform(&self, source: &dyn ListingSource) -> Result<usize, CycleError> {
        let platform = source.platform();
        let new_listings = self
            .coordinator
            .collect_new_listings(source, &self.search_terms)
            .await?;

        if new_listings.is_empty() {
            debug!("{}: No new listings", platform);
            return Ok(0);
        }

        let sent = self.notifier.send_batch(platform, &new_listings).await;
        info!("Sent {} notifications to Discord", sent);

        let stored = self.store.store_listings(&new_listings).await?;
        info!("Stored {} listings in database", stored);

        Ok(new_listings.len())
    }

    fn close(&self) {
        info!("Shutting down scrapers...");
        for source in &self.sources {
            source.close();
        }
        info!("CouchFinder stopped");
    }
}

/// Make sure a session-backed source is logged in, waiting for a manual
/// login if needed. Sources without a session are always ready.
///
/// The login calls block, so they run on a blocking thread. Dropping the
/// returned future stops waiting for them; closing the source ends them.
async fn ensure_session(source: Arc<dyn ListingSource>, timeout: Duration) -> bool {
    if source.session().is_none() {
        return true;
    }
    let platform = source.platform();

    let check = tokio::task::spawn_blocking(move || {
        let Some(session) = source.session() else {
            return Ok(());
        };
        if session.is_authenticated() {
            return Ok(());
        }
        warn!("Cannot access {}", platform);
        session.establish_session(timeout)
    });

    match check.await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("{}", e);
            false
        }
        Err(e) => {
            error!("{} login task failed: {}", platform, e);
            false
        }
    }
}

/// Cancelled on the first Ctrl-C or SIGTERM; a second one exits immediately.
pub fn shutdown_signal() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, stopping... (press Ctrl+C again to force)");
        trigger.cancel();

        wait_for_signal().await;
        info!("Force exit...");
        std::process::exit(1);
    });

    shutdown
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Could not listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
