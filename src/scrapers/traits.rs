use crate::error::ScrapeError;
use crate::models::{Listing, Platform};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;

/// Common trait for marketplace scrapers.
///
/// Implementations must query the marketplace newest-first and stop reading a
/// result page at the first listing already in `seen_ids`.
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Platform this scraper reads
    fn platform(&self) -> Platform;

    /// Fetch listings for one search term.
    ///
    /// May return ids that are already in `seen_ids`; the coordinator filters
    /// them again.
    async fn fetch_listings(
        &self,
        term: &str,
        seen_ids: &HashSet<String>,
    ) -> Result<Vec<Listing>, ScrapeError>;

    /// Upper bound on terms fetched at the same time
    fn max_concurrent_terms(&self) -> usize {
        usize::MAX
    }

    /// Login controls for scrapers that depend on an authenticated session
    fn session(&self) -> Option<&dyn SessionAuth> {
        None
    }

    /// Release browsers or connections held by the scraper
    fn close(&self) {}
}

/// Out-of-band login for session-backed scrapers. Both calls block.
pub trait SessionAuth: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// Wait for a user to log in, giving up after `timeout`
    fn establish_session(&self, timeout: Duration) -> Result<(), ScrapeError>;
}
