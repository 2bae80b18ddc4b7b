use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Marketplace a listing was scraped from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Craigslist,
}

impl Platform {
    /// Name stored in the database and used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Craigslist => "craigslist",
        }
    }

    /// Prefix that namespaces source-native ids
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Platform::Facebook => "fb",
            Platform::Craigslist => "cl",
        }
    }

    /// Build a globally unique listing id from the source's own id
    pub fn listing_id(&self, native_id: &str) -> String {
        format!("{}_{}", self.id_prefix(), native_id)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "facebook" => Ok(Platform::Facebook),
            "craigslist" => Ok(Platform::Craigslist),
            other => anyhow::bail!("unknown platform: {}", other),
        }
    }
}

/// Core listing data model.
///
/// Produced by a scraper on every fetch and only becomes durable once the
/// seen-set store records it; `first_seen` stays `None` until then.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub id: String,
    pub platform: Platform,
    pub title: String,
    pub price: Option<String>,
    pub url: String,
    pub image_url: Option<String>,
    pub location: Option<String>,
    pub first_seen: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_ids_are_prefixed_per_platform() {
        assert_eq!(Platform::Craigslist.listing_id("7712"), "cl_7712");
        assert_eq!(Platform::Facebook.listing_id("991"), "fb_991");
    }

    #[test]
    fn platform_round_trips_through_its_name() {
        for platform in [Platform::Facebook, Platform::Craigslist] {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
        assert!("ebay".parse::<Platform>().is_err());
    }
}
