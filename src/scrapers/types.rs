use crate::error::ParseFailure;
use crate::models::{Listing, Platform};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

const MAX_TITLE_CHARS: usize = 200;

/// Search filters shared by both marketplaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    /// Minimum price (USD)
    pub min_price: u32,
    /// Maximum price (USD)
    pub max_price: u32,
    /// ZIP code the radius is measured from
    pub zip: String,
    /// Search radius in miles
    pub radius_miles: u32,
    /// Only ask for listings posted within this many days (Facebook)
    pub days_since_listed: u32,
    /// Location shown when a result card carries none
    pub default_location: Option<String>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            min_price: 0,
            max_price: 1000,
            zip: "43215".to_string(),
            radius_miles: 100,
            days_since_listed: 7,
            default_location: None,
        }
    }
}

/// Image attributes found on a result card
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageAttrs {
    pub data_src: Option<String>,
    pub srcset: Option<String>,
    pub src: Option<String>,
}

impl ImageAttrs {
    /// Lazy-loaded and high-resolution sources win over `src`, which is
    /// often just a placeholder until the card scrolls into view.
    pub fn best(&self) -> Option<&str> {
        let from_srcset = self.srcset.as_deref().and_then(|set| {
            set.split(',')
                .filter_map(|entry| entry.split_whitespace().next())
                .last()
        });

        [self.data_src.as_deref(), from_srcset, self.src.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|candidate| is_usable_image(candidate))
    }
}

fn is_usable_image(candidate: &str) -> bool {
    let lower = candidate.to_ascii_lowercase();
    !candidate.is_empty()
        && !lower.starts_with("data:")
        && !lower.contains("blank")
        && !lower.contains("placeholder")
}

/// One result card as it appears on a search page, before normalization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCandidate {
    pub href: Option<String>,
    pub title: Option<String>,
    pub price: Option<String>,
    pub image: ImageAttrs,
    pub location: Option<String>,
}

/// Turns raw cards from one platform into canonical listings
#[derive(Debug, Clone)]
pub struct CandidateNormalizer {
    platform: Platform,
    base_url: Url,
    id_pattern: Regex,
    default_location: Option<String>,
}

impl CandidateNormalizer {
    /// `id_pattern` must capture the source-native id in group 1 when
    /// matched against the URL path.
    pub fn new(
        platform: Platform,
        base_url: Url,
        id_pattern: Regex,
        default_location: Option<String>,
    ) -> Self {
        Self {
            platform,
            base_url,
            id_pattern,
            default_location,
        }
    }

    pub fn normalize(&self, raw: &RawCandidate) -> Result<Listing, ParseFailure> {
        let href = non_empty(raw.href.as_deref()).ok_or(ParseFailure::MissingUrl)?;
        let url = self.canonical_url(href)?;

        let native_id = self
            .id_pattern
            .captures(url.path())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ParseFailure::MissingId {
                url: url.to_string(),
            })?;

        let title = non_empty(raw.title.as_deref()).ok_or_else(|| ParseFailure::MissingTitle {
            url: url.to_string(),
        })?;

        let image_url = raw
            .image
            .best()
            .and_then(|src| self.base_url.join(src).ok())
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .map(String::from);

        let location = non_empty(raw.location.as_deref())
            .map(str::to_string)
            .or_else(|| self.default_location.clone());

        Ok(Listing {
            id: self.platform.listing_id(&native_id),
            platform: self.platform,
            title: title.chars().take(MAX_TITLE_CHARS).collect(),
            price: non_empty(raw.price.as_deref()).map(str::to_string),
            url: url.to_string(),
            image_url,
            location,
            first_seen: None,
        })
    }

    /// Absolute URL with query and fragment removed, so tracking parameters
    /// never produce two URLs for the same post.
    fn canonical_url(&self, href: &str) -> Result<Url, ParseFailure> {
        let mut url = self
            .base_url
            .join(href)
            .map_err(|e| ParseFailure::InvalidUrl {
                url: href.to_string(),
                reason: e.to_string(),
            })?;
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn craigslist() -> CandidateNormalizer {
        CandidateNormalizer::new(
            Platform::Craigslist,
            Url::parse("https://columbus.craigslist.org").unwrap(),
            Regex::new(r"/(\d+)\.html$").unwrap(),
            Some("Columbus, OH".to_string()),
        )
    }

    fn card(href: &str, title: &str) -> RawCandidate {
        RawCandidate {
            href: Some(href.to_string()),
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn normalizes_relative_links_into_canonical_listings() {
        let mut raw = card("/fuo/d/columbus-grey-sectional/7801234567.html?lang=en#top", "  Grey sectional ");
        raw.price = Some("$450".to_string());

        let listing = craigslist().normalize(&raw).unwrap();

        assert_eq!(listing.id, "cl_7801234567");
        assert_eq!(
            listing.url,
            "https://columbus.craigslist.org/fuo/d/columbus-grey-sectional/7801234567.html"
        );
        assert_eq!(listing.title, "Grey sectional");
        assert_eq!(listing.price.as_deref(), Some("$450"));
        assert_eq!(listing.location.as_deref(), Some("Columbus, OH"));
        assert!(listing.first_seen.is_none());
    }

    #[test]
    fn tracking_parameters_do_not_change_the_id_or_url() {
        let a = craigslist().normalize(&card("/fuo/d/x/11.html?ref=a", "Sofa")).unwrap();
        let b = craigslist().normalize(&card("/fuo/d/x/11.html?ref=b", "Sofa")).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.url, b.url);
    }

    #[test]
    fn rejects_cards_without_id_title_or_link() {
        let n = craigslist();
        assert_eq!(
            n.normalize(&RawCandidate::default()),
            Err(ParseFailure::MissingUrl)
        );
        assert!(matches!(
            n.normalize(&card("/about/help", "Sofa")),
            Err(ParseFailure::MissingId { .. })
        ));
        assert!(matches!(
            n.normalize(&card("/fuo/d/x/12.html", "   ")),
            Err(ParseFailure::MissingTitle { .. })
        ));
    }

    #[test]
    fn long_titles_are_truncated() {
        let listing = craigslist()
            .normalize(&card("/fuo/d/x/13.html", &"é".repeat(300)))
            .unwrap();
        assert_eq!(listing.title.chars().count(), 200);
    }

    #[test]
    fn lazy_image_wins_over_placeholder_src() {
        let attrs = ImageAttrs {
            data_src: Some("https://images.craigslist.org/a_600x450.jpg".to_string()),
            srcset: None,
            src: Some("data:image/gif;base64,R0lGOD".to_string()),
        };
        assert_eq!(attrs.best(), Some("https://images.craigslist.org/a_600x450.jpg"));
    }

    #[test]
    fn highest_srcset_entry_is_used() {
        let attrs = ImageAttrs {
            data_src: None,
            srcset: Some("https://img/a_300.jpg 1x, https://img/a_600.jpg 2x".to_string()),
            src: Some("https://img/a_50.jpg".to_string()),
        };
        assert_eq!(attrs.best(), Some("https://img/a_600.jpg"));
    }

    #[test]
    fn placeholder_only_images_are_absent() {
        let mut raw = card("/fuo/d/x/14.html", "Couch");
        raw.image = ImageAttrs {
            data_src: None,
            srcset: None,
            src: Some("https://www.craigslist.org/images/blank.gif".to_string()),
        };
        assert_eq!(craigslist().normalize(&raw).unwrap().image_url, None);
    }
}
