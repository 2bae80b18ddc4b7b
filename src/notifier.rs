use crate::models::{Listing, Platform};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Discord accepts at most 10 embeds per message
pub const MAX_EMBEDS_PER_MESSAGE: usize = 10;

/// Webhooks allow ~30 requests per minute
const RATE_LIMIT_DELAY: Duration = Duration::from_millis(2100);

/// Destination for new-listing alerts.
///
/// Retrying a batch may notify twice; callers persist listings only after
/// sending, so a duplicate alert is the worst case.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send listings for one platform. Returns how many were delivered.
    async fn send_batch(&self, platform: Platform, listings: &[Listing]) -> usize;

    /// Lifecycle message posted once when monitoring starts
    async fn send_startup(&self) -> bool;

    /// Posted when the monitor dies
    async fn send_error(&self, message: &str) -> bool;
}

/// Posts embeds to one Discord webhook per platform
pub struct DiscordNotifier {
    client: Client,
    webhooks: HashMap<Platform, String>,
}

impl DiscordNotifier {
    pub fn new(webhooks: HashMap<Platform, String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, webhooks })
    }

    pub fn has_webhooks(&self) -> bool {
        !self.webhooks.is_empty()
    }

    fn distinct_webhooks(&self) -> Vec<&str> {
        let mut urls: Vec<&str> = self.webhooks.values().map(String::as_str).collect();
        urls.sort_unstable();
        urls.dedup();
        urls
    }

    /// A GET on a valid webhook returns its metadata
    pub async fn test_webhooks(&self) -> bool {
        if !self.has_webhooks() {
            return false;
        }

        for url in self.distinct_webhooks() {
            match self.client.get(url).send().await {
                Ok(response) if response.status() == StatusCode::OK => {}
                Ok(response) => {
                    warn!("Webhook check returned {}", response.status());
                    return false;
                }
                Err(e) => {
                    warn!("Webhook check failed: {}", e);
                    return false;
                }
            }
        }
        true
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<StatusCode, reqwest::Error> {
        Ok(self.client.post(url).json(payload).send().await?.status())
    }

    /// Post once, and once more after the advertised delay if rate limited
    async fn post_with_retry(&self, url: &str, payload: &Value) -> bool {
        let response = match self.client.post(url).json(payload).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to send batch: {}", e);
                return false;
            }
        };

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => true,
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|body| body.get("retry_after").and_then(Value::as_f64))
                    .unwrap_or(5.0);
                warn!("Rate limited, waiting {}s", retry_after);
                tokio::time::sleep(Duration::from_secs_f64(retry_after.max(0.0))).await;

                match self.post(url, payload).await {
                    Ok(status) => status.is_success(),
                    Err(e) => {
                        error!("Retry after rate limit failed: {}", e);
                        false
                    }
                }
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                error!("Discord error {}: {}", status, body);
                false
            }
        }
    }

    async fn broadcast(&self, embed: Value) -> bool {
        let payload = json!({ "embeds": [embed] });
        let mut delivered = self.has_webhooks();
        for url in self.distinct_webhooks() {
            match self.post(url, &payload).await {
                Ok(status) if status.is_success() => {}
                Ok(status) => {
                    warn!("Discord returned {} for lifecycle message", status);
                    delivered = false;
                }
                Err(e) => {
                    error!("Failed to send lifecycle message: {}", e);
                    delivered = false;
                }
            }
        }
        delivered
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send_batch(&self, platform: Platform, listings: &[Listing]) -> usize {
        if listings.is_empty() {
            return 0;
        }
        let Some(url) = self.webhooks.get(&platform) else {
            error!("No Discord webhook configured for {}", platform);
            return 0;
        };

        let now = Utc::now();
        let mut sent = 0;
        let batches: Vec<&[Listing]> = listings.chunks(MAX_EMBEDS_PER_MESSAGE).collect();

        for (i, batch) in batches.iter().enumerate() {
            let embeds: Vec<Value> = batch.iter().map(|l| listing_embed(l, now)).collect();
            let payload = json!({ "embeds": embeds });

            if self.post_with_retry(url, &payload).await {
                sent += batch.len();
                info!("Sent batch of {} listings", batch.len());
            }

            if i + 1 < batches.len() {
                tokio::time::sleep(RATE_LIMIT_DELAY).await;
            }
        }

        sent
    }

    async fn send_startup(&self) -> bool {
        self.broadcast(json!({
            "title": "🛋️ CouchFinder Started",
            "description": "Now monitoring Facebook Marketplace and Craigslist for new listings.",
            "color": 0x00FF00,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .await
    }

    async fn send_error(&self, message: &str) -> bool {
        let description: String = message.chars().take(2000).collect();
        self.broadcast(json!({
            "title": "⚠️ CouchFinder Error",
            "description": description,
            "color": 0xFF0000,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .await
    }
}

fn platform_color(platform: Platform) -> u32 {
    match platform {
        Platform::Facebook => 0x1877F2,
        Platform::Craigslist => 0x5C2D91,
    }
}

fn is_valid_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Discord embed for one listing. Discord rejects the whole message on an
/// invalid URL, so links and thumbnails are only set when they are http(s).
pub fn listing_embed(listing: &Listing, now: DateTime<Utc>) -> Value {
    let title: String = listing.title.chars().take(256).collect();
    let title = if title.is_empty() { "Listing".to_string() } else { title };

    let mut embed = json!({
        "title": title,
        "color": platform_color(listing.platform),
        "fields": [
            {
                "name": "Price",
                "value": listing.price.as_deref().unwrap_or("Not listed"),
                "inline": true,
            },
            {
                "name": "Platform",
                "value": capitalize(listing.platform.as_str()),
                "inline": true,
            },
        ],
        "timestamp": now.to_rfc3339(),
    });

    if is_valid_url(&listing.url) {
        embed["url"] = json!(listing.url);
    }
    if let Some(location) = &listing.location {
        embed["description"] = json!(format!("📍 {}", location));
    }
    if let Some(image) = listing.image_url.as_deref().filter(|u| is_valid_url(u)) {
        embed["thumbnail"] = json!({ "url": image });
    }

    debug!("Built embed for {}", listing.id);
    embed
}
