use crate::models::Platform;
use crate::scrapers::SearchParams;
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const DEFAULT_SEARCH_TERMS: &[&str] = &["sectional", "L-shaped", "U-shaped", "modular sofa"];

const DEFAULT_FURNITURE_KEYWORDS: &[&str] = &[
    "sectional",
    "sofa",
    "couch",
    "loveseat",
    "chaise",
    "recliner",
    "furniture",
    "seating",
    "living room",
    "modular",
];

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub craigslist_webhook: Option<String>,
    pub facebook_webhook: Option<String>,
    pub location_zip: String,
    pub location_radius_miles: u32,
    pub location_label: Option<String>,
    pub min_price: u32,
    pub max_price: u32,
    pub check_interval: Duration,
    pub database_file: PathBuf,
    pub log_file: PathBuf,
    pub browser_data_dir: PathBuf,
    pub headless: bool,
    pub search_terms: Vec<String>,
    pub furniture_keywords: Vec<String>,
    pub craigslist_base_url: String,
    pub craigslist_categories: Vec<String>,
    pub facebook_marketplace_url: String,
    pub retention_days: u32,
    pub login_timeout: Duration,
    pub term_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key lookup; unset and blank values fall
    /// back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let shared_webhook = get("DISCORD_WEBHOOK_URL");
        let search_terms = list_or(get("SEARCH_TERMS"), DEFAULT_SEARCH_TERMS);
        if search_terms.is_empty() {
            bail!("SEARCH_TERMS must contain at least one term");
        }

        let min_price = parse_or::<u32>(get("MIN_PRICE"), "MIN_PRICE", 0)?;
        let max_price = parse_or::<u32>(get("MAX_PRICE"), "MAX_PRICE", 1000)?;
        if min_price > max_price {
            bail!("MIN_PRICE ({}) is above MAX_PRICE ({})", min_price, max_price);
        }

        Ok(Self {
            craigslist_webhook: get("DISCORD_WEBHOOK_CRAIGSLIST").or_else(|| shared_webhook.clone()),
            facebook_webhook: get("DISCORD_WEBHOOK_FACEBOOK").or(shared_webhook),
            location_zip: get("LOCATION_ZIP").unwrap_or_else(|| "43215".to_string()),
            location_radius_miles: parse_or(get("LOCATION_RADIUS_MILES"), "LOCATION_RADIUS_MILES", 100)?,
            location_label: get("LOCATION_LABEL").or_else(|| Some("Columbus, OH".to_string())),
            min_price,
            max_price,
            check_interval: Duration::from_secs(parse_or(
                get("CHECK_INTERVAL_SECONDS"),
                "CHECK_INTERVAL_SECONDS",
                60,
            )?),
            database_file: PathBuf::from(get("DATABASE_FILE").unwrap_or_else(|| "couchfinder.db".to_string())),
            log_file: PathBuf::from(get("LOG_FILE").unwrap_or_else(|| "couchfinder.log".to_string())),
            browser_data_dir: PathBuf::from(get("BROWSER_DATA_DIR").unwrap_or_else(|| "browser_data".to_string())),
            headless: get("HEADLESS").map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false),
            search_terms,
            furniture_keywords: list_or(get("FURNITURE_KEYWORDS"), DEFAULT_FURNITURE_KEYWORDS),
            craigslist_base_url: get("CRAIGSLIST_BASE_URL")
                .unwrap_or_else(|| "https://columbus.craigslist.org".to_string()),
            craigslist_categories: list_or(get("CRAIGSLIST_CATEGORIES"), &["fua"]),
            facebook_marketplace_url: get("FACEBOOK_MARKETPLACE_URL")
                .unwrap_or_else(|| "https://www.facebook.com/marketplace/columbus".to_string()),
            retention_days: parse_or(get("RETENTION_DAYS"), "RETENTION_DAYS", 7)?,
            login_timeout: Duration::from_secs(
                60 * parse_or::<u64>(get("LOGIN_TIMEOUT_MINUTES"), "LOGIN_TIMEOUT_MINUTES", 5)?,
            ),
            term_concurrency: parse_or(get("TERM_CONCURRENCY"), "TERM_CONCURRENCY", 2)?,
        })
    }

    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            min_price: self.min_price,
            max_price: self.max_price,
            zip: self.location_zip.clone(),
            radius_miles: self.location_radius_miles,
            days_since_listed: self.retention_days,
            default_location: self.location_label.clone(),
        }
    }

    /// Webhook per platform, skipping platforms without one
    pub fn webhooks(&self) -> HashMap<Platform, String> {
        [
            (Platform::Craigslist, &self.craigslist_webhook),
            (Platform::Facebook, &self.facebook_webhook),
        ]
        .into_iter()
        .filter_map(|(platform, url)| url.clone().map(|url| (platform, url)))
        .collect()
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a valid number, got {:?}", key, raw)),
        None => Ok(default),
    }
}

fn list_or(value: Option<String>, default: &[&str]) -> Vec<String> {
    match value {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        None => default.iter().map(|item| item.to_string()).collect(),
    }
}
