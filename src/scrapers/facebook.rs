use crate::error::ScrapeError;
use crate::models::{Listing, Platform};
use crate::scrapers::early_stop::scan_newest_first;
use crate::scrapers::html::{image_attrs, selector, text_of};
use crate::scrapers::session::{is_login_url, BrowserSession};
use crate::scrapers::traits::{ListingSource, SessionAuth};
use crate::scrapers::types::{CandidateNormalizer, RawCandidate, SearchParams};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

const LOGIN_URL: &str = "https://www.facebook.com/login";
const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(10);
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

const DISMISS_POPUP_JS: &str = r#"
(() => {
    const close = document.querySelector('[aria-label="Close"]');
    if (close) { close.click(); return true; }
    document.dispatchEvent(new KeyboardEvent('keydown', { key: 'Escape', bubbles: true }));
    return false;
})()
"#;

const OPEN_SORT_MENU_JS: &str = r#"
(() => {
    const spans = Array.from(document.querySelectorAll('span'));
    const button = document.querySelector('[aria-label*="Sort"]')
        || spans.find(s => ['Sort by', 'Suggested'].includes(s.textContent.trim()));
    if (!button) return false;
    button.click();
    return true;
})()
"#;

const PICK_NEWEST_JS: &str = r#"
(() => {
    const option = Array.from(document.querySelectorAll('span'))
        .find(s => s.textContent.trim() === 'Date listed: Newest first');
    if (!option) return false;
    option.click();
    return true;
})()
"#;

/// Facebook Marketplace scraper driving a logged-in Chrome profile.
///
/// Chrome calls block, so they run on blocking threads against the shared
/// state in [`FacebookInner`].
pub struct FacebookScraper {
    inner: Arc<FacebookInner>,
}

struct FacebookInner {
    session: Mutex<Option<BrowserSession>>,
    closed: CancellationToken,
    marketplace_url: String,
    profile_dir: PathBuf,
    headless: bool,
    user_agent: String,
    params: SearchParams,
    keywords: Vec<String>,
    normalizer: CandidateNormalizer,
}

impl FacebookScraper {
    /// Create the scraper. Chrome is launched on first use.
    pub fn new(
        marketplace_url: &str,
        profile_dir: PathBuf,
        headless: bool,
        params: SearchParams,
        keywords: Vec<String>,
        user_agent: &str,
    ) -> Result<Self> {
        let origin = Url::parse(marketplace_url)
            .and_then(|url| url.join("/"))
            .with_context(|| format!("Invalid Facebook Marketplace URL: {}", marketplace_url))?;

        let normalizer = CandidateNormalizer::new(
            Platform::Facebook,
            origin,
            Regex::new(r"/item/(\d+)").context("Invalid Facebook id pattern")?,
            params.default_location.clone(),
        );

        Ok(Self {
            inner: Arc::new(FacebookInner {
                session: Mutex::new(None),
                closed: CancellationToken::new(),
                marketplace_url: marketplace_url.trim_end_matches('/').to_string(),
                profile_dir,
                headless,
                user_agent: user_agent.to_string(),
                params,
                keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
                normalizer,
            }),
        })
    }

    /// Marketplace search URL, newest listings first
    pub fn search_url(&self, term: &str) -> Result<Url> {
        self.inner.search_url(term)
    }

    /// Titles must mention a furniture word; "U-shaped" alone also matches
    /// boots, cushions and stair parts.
    pub fn matches_keywords(&self, title: &str) -> bool {
        self.inner.matches_keywords(title)
    }
}

impl FacebookInner {
    fn search_url(&self, term: &str) -> Result<Url> {
        let url = Url::parse_with_params(
            &format!("{}/search", self.marketplace_url),
            &[
                ("query", term.to_string()),
                ("minPrice", self.params.min_price.to_string()),
                ("maxPrice", self.params.max_price.to_string()),
                ("daysSinceListed", self.params.days_since_listed.to_string()),
                ("sortBy", "creation_date_descend".to_string()),
            ],
        )?;
        Ok(url)
    }

    fn matches_keywords(&self, title: &str) -> bool {
        let title = title.to_lowercase();
        self.keywords.is_empty() || self.keywords.iter().any(|kw| title.contains(kw.as_str()))
    }

    fn ensure_launched<'a>(
        &self,
        slot: &'a mut Option<BrowserSession>,
    ) -> Result<&'a BrowserSession> {
        if slot.is_none() {
            *slot = Some(BrowserSession::launch(
                &self.profile_dir,
                self.headless,
                &self.user_agent,
            )?);
        }
        slot.as_ref().context("browser session missing after launch")
    }

    fn dismiss_login_popup(session: &BrowserSession) {
        match session.run_script(DISMISS_POPUP_JS) {
            Ok(Some(serde_json::Value::Bool(true))) => {
                info!("Dismissed login popup");
                thread::sleep(Duration::from_secs(1));
            }
            Ok(_) => {}
            Err(e) => debug!("No login popup to dismiss: {}", e),
        }
    }

    /// The site ignores `sortBy` in the URL, so pick the option in the menu
    fn select_newest_sort(session: &BrowserSession) {
        Self::dismiss_login_popup(session);

        match session.run_script(OPEN_SORT_MENU_JS) {
            Ok(Some(serde_json::Value::Bool(true))) => {}
            Ok(_) => {
                warn!("Could not find sort dropdown button");
                return;
            }
            Err(e) => {
                warn!("Could not select newest sort: {}", e);
                return;
            }
        }

        thread::sleep(Duration::from_secs(1));

        match session.run_script(PICK_NEWEST_JS) {
            Ok(Some(serde_json::Value::Bool(true))) => {
                debug!("Selected 'Date listed: Newest first' sort option");
                thread::sleep(Duration::from_secs(2));
            }
            Ok(_) => warn!("Could not find 'Date listed: Newest first' option"),
            Err(e) => warn!("Could not select newest sort: {}", e),
        }
    }

    /// Run `f` with the browser slot locked. Once the scraper is closed the
    /// browser is shut down as soon as the current holder is done with it.
    fn with_session<T>(&self, f: impl FnOnce(&mut Option<BrowserSession>) -> T) -> Result<T> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| anyhow!("browser session lock poisoned"))?;
        if self.closed.is_cancelled() {
            bail!("Facebook scraper is closed");
        }

        let result = f(&mut *guard);

        if self.closed.is_cancelled() {
            if let Some(session) = guard.take() {
                session.close();
            }
        }
        Ok(result)
    }

    /// Sleep for `duration`, waking early if the scraper is closed.
    /// Returns false when closed.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while !self.closed.is_cancelled() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            thread::sleep(left.min(CLOSE_POLL_INTERVAL));
        }
        false
    }

    fn fetch_blocking(
        &self,
        term: &str,
        seen_ids: &HashSet<String>,
    ) -> Result<Vec<Listing>, ScrapeError> {
        let url = self
            .search_url(term)
            .map_err(|e| ScrapeError::fetch_failed(term, e))?;

        self.with_session(|slot| self.search(slot, term, &url, seen_ids))
            .map_err(|e| ScrapeError::fetch_failed(term, e))?
    }

    fn search(
        &self,
        slot: &mut Option<BrowserSession>,
        term: &str,
        url: &Url,
        seen_ids: &HashSet<String>,
    ) -> Result<Vec<Listing>, ScrapeError> {
        let session = self
            .ensure_launched(slot)
            .map_err(|e| ScrapeError::fetch_failed(term, e))?;

        info!("Searching Facebook: {}", term);
        session
            .goto(url.as_str(), Duration::from_secs(3))
            .map_err(|e| ScrapeError::fetch_failed(term, e))?;

        let landed = session.current_url();
        if is_login_url(&landed) {
            return Err(ScrapeError::AuthRequired(format!(
                "search for '{}' redirected to {}",
                term, landed
            )));
        }
        if self.closed.is_cancelled() {
            return Err(ScrapeError::fetch_failed(term, anyhow!("scraper closed mid-search")));
        }

        Self::select_newest_sort(session);

        let html = session
            .page_html()
            .map_err(|e| ScrapeError::fetch_failed(term, e))?;
        let candidates = parse_candidates(&html);
        let outcome = scan_newest_first(
            candidates.iter().map(|raw| self.normalizer.normalize(raw)),
            seen_ids,
        );

        if outcome.parse_failures > 0 {
            debug!(
                "Facebook '{}': skipped {} malformed results",
                term, outcome.parse_failures
            );
        }
        if outcome.watermark.is_some() {
            info!(
                "Facebook '{}': early stop triggered, {} new listings",
                term,
                outcome.listings.len()
            );
        } else {
            debug!("Facebook '{}': {} listings parsed", term, outcome.listings.len());
        }

        let (kept, filtered): (Vec<_>, Vec<_>) = outcome
            .listings
            .into_iter()
            .partition(|listing| self.matches_keywords(&listing.title));
        for listing in &filtered {
            debug!("Filtered out non-furniture listing: {}", listing.title);
        }

        Ok(kept)
    }

    fn check_marketplace_access(&self) -> Result<bool> {
        self.with_session(|slot| -> Result<bool> {
            let session = self.ensure_launched(slot)?;

            session.goto(&self.marketplace_url, Duration::from_secs(2))?;
            Self::dismiss_login_popup(session);

            let current = session.current_url();
            if is_login_url(&current) {
                debug!("Redirected to login: {}", current);
                return Ok(false);
            }
            if current.to_lowercase().contains("/marketplace") {
                return Ok(true);
            }
            Ok(session.page_html()?.contains("/marketplace/item/"))
        })?
    }

    fn wait_for_login(&self, timeout: Duration) -> Result<bool> {
        self.with_session(|slot| self.login_with_visible_browser(slot, timeout))?
    }

    fn login_with_visible_browser(
        &self,
        slot: &mut Option<BrowserSession>,
        timeout: Duration,
    ) -> Result<bool> {
        // Chrome locks the profile dir, so the headless instance has to go first
        let reuse = slot.as_ref().map(|s| !s.is_headless()).unwrap_or(false);
        if !reuse {
            if let Some(previous) = slot.take() {
                previous.close();
            }
            info!("Relaunching browser with visible window for login...");
            *slot = Some(BrowserSession::launch(&self.profile_dir, false, &self.user_agent)?);
        }
        let session = slot.as_ref().context("browser session missing after launch")?;

        warn!(
            "FACEBOOK LOGIN REQUIRED: log in using the browser window within {} minutes",
            timeout.as_secs() / 60
        );
        session.goto(LOGIN_URL, Duration::from_secs(1))?;

        let started = Instant::now();
        while started.elapsed() < timeout {
            if !self.pause(LOGIN_POLL_INTERVAL.min(timeout)) {
                info!("Login wait cancelled");
                return Ok(false);
            }

            let current = session.current_url();
            if !current.contains("facebook.com") || is_login_url(&current) {
                continue;
            }

            self.pause(Duration::from_secs(3));
            match session.goto(&self.marketplace_url, Duration::from_secs(2)) {
                Ok(()) if !is_login_url(&session.current_url()) => {
                    info!("Login successful!");
                    return Ok(true);
                }
                Ok(()) => {}
                Err(e) => debug!("Marketplace not reachable yet: {}", e),
            }
        }

        error!("Login timeout");
        Ok(false)
    }
}

/// Pull item cards out of a Marketplace results page, in page order.
///
/// The markup is obfuscated and changes often, so cards are located through
/// their item links and fields are guessed from the text around them.
pub fn parse_candidates(html: &str) -> Vec<RawCandidate> {
    let document = Html::parse_document(html);
    let item_link = selector(r#"a[href*="/marketplace/item/"]"#);
    let span = selector("span");
    let img = selector("img");

    document
        .select(&item_link)
        .map(|link| {
            let card = link
                .ancestors()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "div")
                .unwrap_or(link);

            let texts: Vec<String> = card.select(&span).filter_map(text_of).collect();

            // Price-like spans never double as title or location
            let (prices, others): (Vec<&String>, Vec<&String>) = texts
                .iter()
                .partition(|t| t.starts_with('$') || t.contains("Free"));

            let price = prices.last().map(|t| (*t).clone());

            let title = others
                .iter()
                .filter(|t| t.chars().count() > 10)
                .fold(None::<&String>, |best, t| match best {
                    Some(b) if b.chars().count() >= t.chars().count() => Some(b),
                    _ => Some(*t),
                })
                .cloned();

            let location = others
                .iter()
                .find(|t| t.contains(',') && t.chars().count() < 50 && Some(**t) != title.as_ref())
                .map(|t| (*t).clone());

            RawCandidate {
                href: link.value().attr("href").map(str::to_string),
                title,
                price,
                image: image_attrs(card, &img),
                location,
            }
        })
        .collect()
}

#[async_trait]
impl ListingSource for FacebookScraper {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    async fn fetch_listings(
        &self,
        term: &str,
        seen_ids: &HashSet<String>,
    ) -> Result<Vec<Listing>, ScrapeError> {
        let inner = Arc::clone(&self.inner);
        let owned_term = term.to_string();
        let seen_ids = seen_ids.clone();

        tokio::task::spawn_blocking(move || inner.fetch_blocking(&owned_term, &seen_ids))
            .await
            .map_err(|e| ScrapeError::fetch_failed(term, e))?
    }

    fn max_concurrent_terms(&self) -> usize {
        // One shared tab
        1
    }

    fn session(&self) -> Option<&dyn SessionAuth> {
        Some(self)
    }

    fn close(&self) {
        self.inner.closed.cancel();
        match self.inner.session.try_lock() {
            Ok(mut guard) => {
                if let Some(session) = guard.take() {
                    session.close();
                }
            }
            Err(TryLockError::WouldBlock) => {
                debug!("Browser busy, it closes when the current step returns")
            }
            Err(TryLockError::Poisoned(_)) => {
                error!("Error closing Facebook browser: session lock poisoned")
            }
        }
    }
}

impl SessionAuth for FacebookScraper {
    fn is_authenticated(&self) -> bool {
        match self.inner.check_marketplace_access() {
            Ok(accessible) => accessible,
            Err(e) => {
                error!("Error checking marketplace access: {:#}", e);
                false
            }
        }
    }

    fn establish_session(&self, timeout: Duration) -> Result<(), ScrapeError> {
        match self.inner.wait_for_login(timeout) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ScrapeError::AuthRequired(format!(
                "no login within {} seconds",
                timeout.as_secs()
            ))),
            Err(e) => Err(ScrapeError::AuthRequired(format!("login browser failed: {:#}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS_PAGE: &str = r#"
        <html><body><div role="main">
          <div class="card">
            <a href="/marketplace/item/1122334455/?ref=search&amp;referral_code=null">
              <img src="https://scontent.xx.fbcdn.net/v/t45/sectional.jpg">
              <span>$350</span>
              <span>Grey L-shaped sectional sofa</span>
              <span>Westerville, OH</span>
            </a>
          </div>
          <div class="card">
            <a href="/marketplace/item/1122334455/?ref=search">
              <span>Grey L-shaped sectional sofa</span>
            </a>
          </div>
          <div class="card">
            <a href="/marketplace/item/9988776655/">
              <span>Free</span>
              <span>U-shaped stair balusters</span>
            </a>
          </div>
          <div class="card">
            <a href="/marketplace/item/5544332211/">
              <span>$80</span>
            </a>
          </div>
        </div></body></html>
    "#;

    fn scraper() -> FacebookScraper {
        FacebookScraper::new(
            "https://www.facebook.com/marketplace/columbus/",
            PathBuf::from("browser_data"),
            true,
            SearchParams::default(),
            vec!["Sectional".to_string(), "sofa".to_string()],
            "couch-finder-test",
        )
        .unwrap()
    }

    #[test]
    fn parses_item_cards() {
        let candidates = parse_candidates(RESULTS_PAGE);
        assert_eq!(candidates.len(), 4);

        let first = &candidates[0];
        assert_eq!(first.title.as_deref(), Some("Grey L-shaped sectional sofa"));
        assert_eq!(first.price.as_deref(), Some("$350"));
        assert_eq!(first.location.as_deref(), Some("Westerville, OH"));
        assert_eq!(
            first.image.src.as_deref(),
            Some("https://scontent.xx.fbcdn.net/v/t45/sectional.jpg")
        );
        assert_eq!(candidates[2].price.as_deref(), Some("Free"));
        assert_eq!(candidates[3].title, None);
    }

    #[test]
    fn free_price_span_is_not_reused_as_title() {
        let html = r#"
            <div class="card">
              <a href="/marketplace/item/4455667788/">
                <span>Free sectional couch, must go</span>
                <span>Blue modular sofa set</span>
                <span>Dublin, OH</span>
              </a>
            </div>
        "#;

        let candidates = parse_candidates(html);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].price.as_deref(), Some("Free sectional couch, must go"));
        assert_eq!(candidates[0].title.as_deref(), Some("Blue modular sofa set"));
        assert_eq!(candidates[0].location.as_deref(), Some("Dublin, OH"));
    }

    #[test]
    fn normalizes_and_dedupes_a_results_page() {
        let scraper = scraper();
        let candidates = parse_candidates(RESULTS_PAGE);
        let outcome = scan_newest_first(
            candidates.iter().map(|raw| scraper.inner.normalizer.normalize(raw)),
            &HashSet::new(),
        );

        let ids: Vec<_> = outcome.listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["fb_1122334455", "fb_9988776655"]);
        assert_eq!(outcome.parse_failures, 1);
        assert_eq!(
            outcome.listings[0].url,
            "https://www.facebook.com/marketplace/item/1122334455/"
        );
    }

    #[test]
    fn stops_at_known_item() {
        let scraper = scraper();
        let candidates = parse_candidates(RESULTS_PAGE);
        let seen: HashSet<String> = ["fb_1122334455".to_string()].into_iter().collect();

        let outcome = scan_newest_first(
            candidates.iter().map(|raw| scraper.inner.normalizer.normalize(raw)),
            &seen,
        );

        assert!(outcome.listings.is_empty());
        assert_eq!(outcome.watermark.as_deref(), Some("fb_1122334455"));
    }

    #[test]
    fn keyword_filter_drops_non_furniture() {
        let scraper = scraper();
        assert!(scraper.matches_keywords("Grey L-shaped SECTIONAL"));
        assert!(!scraper.matches_keywords("U-shaped stair balusters"));
    }

    #[test]
    fn closed_scraper_stops_blocking_work() {
        let scraper = scraper();
        scraper.close();

        let started = Instant::now();
        assert!(!scraper.inner.pause(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(1));

        // No Chrome is launched once closed
        assert!(scraper.inner.check_marketplace_access().is_err());
        assert!(matches!(
            scraper.establish_session(Duration::from_secs(300)),
            Err(ScrapeError::AuthRequired(_))
        ));
    }

    #[test]
    fn search_url_sorts_by_creation_date() {
        let url = scraper().search_url("modular sofa").unwrap();
        assert_eq!(url.path(), "/marketplace/columbus/search");

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("sortBy".to_string(), "creation_date_descend".to_string())));
        assert!(pairs.contains(&("query".to_string(), "modular sofa".to_string())));
        assert!(pairs.contains(&("daysSinceListed".to_string(), "7".to_string())));
    }
}
