//! Runs every search term for one platform and reduces the results to the
//! listings that have never been notified.

use crate::error::{CycleError, ScrapeError};
use crate::models::Listing;
use crate::scrapers::ListingSource;
use crate::store::SeenStore;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use tracing::{info, warn};

pub struct Coordinator {
    store: SeenStore,
    term_concurrency: usize,
}

impl Coordinator {
    pub fn new(store: SeenStore, term_concurrency: usize) -> Self {
        Self {
            store,
            term_concurrency: term_concurrency.max(1),
        }
    }

    /// New listings for `source` across all `terms`, in term order.
    ///
    /// The seen-set is read once and used both for the scrapers' early stop
    /// and for the final filter.
    pub async fn collect_new_listings(
        &self,
        source: &dyn ListingSource,
        terms: &[String],
    ) -> Result<Vec<Listing>, CycleError> {
        let platform = source.platform();
        let seen_ids = self.store.get_seen_ids(platform).await?;
        let limit = self.term_concurrency.min(source.max_concurrent_terms()).max(1);

        let mut fetches = stream::iter(terms.iter().filter(|term| !term.trim().is_empty()))
            .map(|term| {
                let seen_ids = &seen_ids;
                async move { (term, source.fetch_listings(term, seen_ids).await) }
            })
            .buffered(limit);

        let mut per_term = Vec::with_capacity(terms.len());
        while let Some((term, result)) = fetches.next().await {
            match result {
                Ok(listings) => per_term.push(listings),
                Err(ScrapeError::AuthRequired(reason)) => {
                    // Partial results from a dead session are not trusted
                    return Err(CycleError::AuthRequired { platform, reason });
                }
                Err(e) => warn!("{}: skipping term '{}': {}", platform, term, e),
            }
        }

        let fresh = merge_new_listings(per_term, &seen_ids);
        info!("{}: {} new listings across {} terms", platform, fresh.len(), terms.len());
        Ok(fresh)
    }
}

/// Flatten per-term results, keeping the first occurrence of each id and
/// dropping anything already in `seen_ids`.
pub fn merge_new_listings(
    per_term: Vec<Vec<Listing>>,
    seen_ids: &HashSet<String>,
) -> Vec<Listing> {
    let mut merged_ids = HashSet::new();
    per_term
        .into_iter()
        .flatten()
        .filter(|listing| !seen_ids.contains(&listing.id))
        .filter(|listing| merged_ids.insert(listing.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use crate::scrapers::early_stop::scan_newest_first;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn listing(id: &str) -> Listing {
        Listing {
            id: id.to_string(),
            platform: Platform::Craigslist,
            title: format!("Listing {}", id),
            price: None,
            url: format!("https://columbus.craigslist.org/fuo/d/{}.html", id),
            image_url: None,
            location: None,
            first_seen: None,
        }
    }

    /// Serves fixed newest-first pages and applies the real early-stop scan
    #[derive(Default)]
    struct FakeFeed {
        pages: HashMap<String, Vec<&'static str>>,
        failing: HashSet<String>,
        auth_wall: HashSet<String>,
        ignore_watermark: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeFeed {
        fn page(mut self, term: &str, ids: Vec<&'static str>) -> Self {
            self.pages.insert(term.to_string(), ids);
            self
        }
    }

    #[async_trait]
    impl ListingSource for FakeFeed {
        fn platform(&self) -> Platform {
            Platform::Craigslist
        }

        async fn fetch_listings(
            &self,
            term: &str,
            seen_ids: &HashSet<String>,
        ) -> Result<Vec<Listing>, ScrapeError> {
            self.calls.lock().unwrap().push(term.to_string());
            if self.failing.contains(term) {
                return Err(ScrapeError::fetch_failed(term, anyhow!("connection reset")));
            }
            if self.auth_wall.contains(term) {
                return Err(ScrapeError::AuthRequired("redirected to /login".to_string()));
            }

            let page = self.pages.get(term).cloned().unwrap_or_default();
            if self.ignore_watermark {
                return Ok(page.into_iter().map(listing).collect());
            }
            let outcome = scan_newest_first(page.into_iter().map(|id| Ok(listing(id))), seen_ids);
            Ok(outcome.listings)
        }
    }

    async fn coordinator_with_seen(seen: &[&str]) -> (TempDir, Coordinator) {
        let dir = TempDir::new().unwrap();
        let store = SeenStore::open(&dir.path().join("seen.db")).await.unwrap();
        let already: Vec<Listing> = seen.iter().map(|id| listing(id)).collect();
        store.store_listings(&already).await.unwrap();
        (dir, Coordinator::new(store, 2))
    }

    fn terms(terms: &[&str]) -> Vec<String> {
        terms.iter().map(|t| t.to_string()).collect()
    }

    fn ids(listings: &[Listing]) -> Vec<&str> {
        listings.iter().map(|l| l.id.as_str()).collect()
    }

    #[tokio::test]
    async fn sectional_and_futon_scenario() {
        let (_dir, coordinator) = coordinator_with_seen(&["cl_1"]).await;
        let feed = FakeFeed::default()
            .page("sectional", vec!["cl_2", "cl_1", "cl_3"])
            .page("futon", vec!["cl_4", "cl_5"]);

        let fresh = coordinator
            .collect_new_listings(&feed, &terms(&["sectional", "futon"]))
            .await
            .unwrap();

        assert_eq!(ids(&fresh), vec!["cl_2", "cl_4", "cl_5"]);
    }

    #[tokio::test]
    async fn listing_found_by_two_terms_is_returned_once() {
        let (_dir, coordinator) = coordinator_with_seen(&[]).await;
        let feed = FakeFeed::default()
            .page("sectional", vec!["cl_7", "cl_8"])
            .page("L-shaped", vec!["cl_9", "cl_7"]);

        let fresh = coordinator
            .collect_new_listings(&feed, &terms(&["sectional", "L-shaped"]))
            .await
            .unwrap();

        assert_eq!(ids(&fresh), vec!["cl_7", "cl_8", "cl_9"]);
    }

    #[tokio::test]
    async fn final_filter_drops_seen_ids_the_scraper_let_through() {
        let (_dir, coordinator) = coordinator_with_seen(&["cl_1"]).await;
        let feed = FakeFeed {
            ignore_watermark: true,
            ..FakeFeed::default()
        }
        .page("sectional", vec!["cl_2", "cl_1", "cl_3"]);

        let fresh = coordinator
            .collect_new_listings(&feed, &terms(&["sectional"]))
            .await
            .unwrap();

        assert_eq!(ids(&fresh), vec!["cl_2", "cl_3"]);
    }

    #[tokio::test]
    async fn failed_term_does_not_stop_the_others() {
        let (_dir, coordinator) = coordinator_with_seen(&[]).await;
        let mut feed = FakeFeed::default()
            .page("sectional", vec!["cl_2"])
            .page("futon", vec!["cl_4"]);
        feed.failing.insert("sectional".to_string());

        let fresh = coordinator
            .collect_new_listings(&feed, &terms(&["sectional", "futon"]))
            .await
            .unwrap();

        assert_eq!(ids(&fresh), vec!["cl_4"]);
        assert_eq!(feed.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn auth_wall_aborts_the_platform_cycle() {
        let (_dir, coordinator) = coordinator_with_seen(&[]).await;
        let mut feed = FakeFeed::default()
            .page("sectional", vec!["cl_2"])
            .page("futon", vec!["cl_4"]);
        feed.auth_wall.insert("futon".to_string());

        let result = coordinator
            .collect_new_listings(&feed, &terms(&["sectional", "futon"]))
            .await;

        assert!(matches!(
            result,
            Err(CycleError::AuthRequired {
                platform: Platform::Craigslist,
                ..
            })
        ));
    }

    #[test]
    fn merge_keeps_first_occurrence_in_term_order() {
        let seen: HashSet<String> = ["cl_1".to_string()].into_iter().collect();
        let merged = merge_new_listings(
            vec![
                vec![listing("cl_3"), listing("cl_1")],
                vec![listing("cl_2"), listing("cl_3")],
                vec![],
            ],
            &seen,
        );
        assert_eq!(ids(&merged), vec!["cl_3", "cl_2"]);
    }
}
