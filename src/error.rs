//! Error taxonomy for the acquisition pipeline.
//!
//! Per-candidate and per-term failures are recovered where they happen;
//! only [`CycleError`] escapes a platform cycle.

use crate::models::Platform;
use thiserror::Error;

/// A single result card that could not be turned into a listing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("candidate has no link")]
    MissingUrl,

    #[error("no listing id in url: {url}")]
    MissingId { url: String },

    #[error("candidate has no title: {url}")]
    MissingTitle { url: String },

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Errors raised by a scraper while fetching one search term
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Network or browser failure for one term; later terms still run
    #[error("fetch failed for '{term}': {source}")]
    FetchFailed {
        term: String,
        #[source]
        source: anyhow::Error,
    },

    /// The session was bounced to a login or checkpoint page
    #[error("authentication required: {0}")]
    AuthRequired(String),
}

impl ScrapeError {
    pub fn fetch_failed(term: &str, source: impl Into<anyhow::Error>) -> Self {
        ScrapeError::FetchFailed {
            term: term.to_string(),
            source: source.into(),
        }
    }
}

/// Seen-set persistence failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid stored platform: {0}")]
    InvalidPlatform(String),

    #[error("could not prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures that abort one platform's polling cycle
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("{platform} session needs to log in again: {reason}")]
    AuthRequired { platform: Platform, reason: String },

    #[error("seen-set store unavailable: {0}")]
    Store(#[from] StoreError),
}
