use crate::error::ScrapeError;
use crate::models::{Listing, Platform};
use crate::scrapers::early_stop::scan_newest_first;
use crate::scrapers::html::{first_text, image_attrs, selector, text_of};
use crate::scrapers::traits::ListingSource;
use crate::scrapers::types::{CandidateNormalizer, RawCandidate, SearchParams};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use scraper::Html;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Craigslist scraper reading the date-sorted search feed over plain HTTP
pub struct CraigslistScraper {
    client: Client,
    base_url: Url,
    categories: Vec<String>,
    params: SearchParams,
    normalizer: CandidateNormalizer,
}

impl CraigslistScraper {
    /// Create a scraper for one Craigslist site, e.g. `https://columbus.craigslist.org`
    pub fn new(
        base_url: &str,
        categories: Vec<String>,
        params: SearchParams,
        user_agent: &str,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid Craigslist base URL: {}", base_url))?;

        let normalizer = CandidateNormalizer::new(
            Platform::Craigslist,
            base_url.clone(),
            Regex::new(r"/(\d+)\.html$").context("Invalid Craigslist id pattern")?,
            params.default_location.clone(),
        );

        Ok(Self {
            client,
            base_url,
            categories,
            params,
            normalizer,
        })
    }

    /// Search URL for one category and term, newest postings first
    pub fn search_url(&self, category: &str, term: &str) -> Result<Url> {
        let mut url = self.base_url.join(&format!("/search/{}", category))?;
        url.query_pairs_mut()
            .append_pair("query", term)
            .append_pair("min_price", &self.params.min_price.to_string())
            .append_pair("max_price", &self.params.max_price.to_string())
            .append_pair("postal", &self.params.zip)
            .append_pair("search_distance", &self.params.radius_miles.to_string())
            .append_pair("sort", "date")
            .append_pair("searchNearby", "1");
        Ok(url)
    }

    async fn fetch_page(&self, url: &Url, term: &str) -> Result<String, ScrapeError> {
        debug!("Fetching URL: {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ScrapeError::fetch_failed(term, e))?;

        if !response.status().is_success() {
            warn!("Craigslist returned status: {}", response.status());
            return Err(ScrapeError::fetch_failed(
                term,
                anyhow!("Craigslist returned status {}", response.status()),
            ));
        }

        let html = response
            .text()
            .await
            .map_err(|e| ScrapeError::fetch_failed(term, e))?;
        debug!("Downloaded {} bytes of HTML", html.len());
        Ok(html)
    }
}

/// Pull result cards out of a Craigslist search page, in page order.
///
/// Handles both the JavaScript gallery layout and the static fallback
/// markup served to clients without scripting.
pub fn parse_candidates(html: &str) -> Vec<RawCandidate> {
    let document = Html::parse_document(html);
    let card_selector =
        selector("div.gallery-card, li.cl-static-search-result, li.cl-search-result");
    let posting_title = selector("a.posting-title");
    let posting_link = selector(r#"a[href$=".html"]"#);
    let label = selector("span.label");
    let title = selector("div.title");
    let price = selector("span.priceinfo, div.price");
    let location = selector("div.location");
    let img = selector("img");

    document
        .select(&card_selector)
        .map(|card| {
            let link = card
                .select(&posting_title)
                .next()
                .or_else(|| card.select(&posting_link).next());

            let card_title = link
                .and_then(|link| first_text(link, &label))
                .or_else(|| first_text(card, &title))
                .or_else(|| link.and_then(text_of));

            RawCandidate {
                href: link.and_then(|link| link.value().attr("href")).map(str::to_string),
                title: card_title,
                price: first_text(card, &price),
                image: image_attrs(card, &img),
                location: first_text(card, &location),
            }
        })
        .collect()
}

#[async_trait]
impl ListingSource for CraigslistScraper {
    fn platform(&self) -> Platform {
        Platform::Craigslist
    }

    async fn fetch_listings(
        &self,
        term: &str,
        seen_ids: &HashSet<String>,
    ) -> Result<Vec<Listing>, ScrapeError> {
        let mut listings = Vec::new();

        for category in &self.categories {
            let url = self
                .search_url(category, term)
                .map_err(|e| ScrapeError::fetch_failed(term, e))?;
            let html = self.fetch_page(&url, term).await?;

            let candidates = parse_candidates(&html);
            let outcome = scan_newest_first(
                candidates.iter().map(|raw| self.normalizer.normalize(raw)),
                seen_ids,
            );

            if outcome.parse_failures > 0 {
                warn!(
                    "Craigslist '{}' ({}): skipped {} malformed results",
                    term, category, outcome.parse_failures
                );
            }
            match &outcome.watermark {
                Some(id) => info!(
                    "Craigslist '{}' ({}): early stop at {}, {} new listings",
                    term,
                    category,
                    id,
                    outcome.listings.len()
                ),
                None => debug!(
                    "Craigslist '{}' ({}): {} listings parsed",
                    term,
                    category,
                    outcome.listings.len()
                ),
            }

            listings.extend(outcome.listings);
        }

        Ok(listings)
    }

    fn max_concurrent_terms(&self) -> usize {
        // Keep the request rate polite enough to avoid the block page
        2
    }
}
