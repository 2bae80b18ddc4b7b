use crate::error::ParseFailure;
use crate::models::Listing;
use std::collections::HashSet;
use tracing::debug;

/// What a newest-first scan of one result page produced
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Unseen listings in page order
    pub listings: Vec<Listing>,
    /// First already-seen id, if the scan stopped on one
    pub watermark: Option<String>,
    /// Cards that could not be normalized
    pub parse_failures: usize,
}

/// Consume normalized candidates in delivered order until the first one
/// already in `seen_ids`.
///
/// Results must be sorted newest-first: everything after the watermark was
/// already seen in an earlier cycle, so the iterator is not advanced past it.
pub fn scan_newest_first<I>(candidates: I, seen_ids: &HashSet<String>) -> ScanOutcome
where
    I: IntoIterator<Item = Result<Listing, ParseFailure>>,
{
    let mut outcome = ScanOutcome::default();
    let mut page_ids = HashSet::new();

    for candidate in candidates {
        let listing = match candidate {
            Ok(listing) => listing,
            Err(failure) => {
                debug!("Skipping malformed result: {}", failure);
                outcome.parse_failures += 1;
                continue;
            }
        };

        if seen_ids.contains(&listing.id) {
            debug!("Early stop: hit known listing {}", listing.id);
            outcome.watermark = Some(listing.id);
            break;
        }

        // The same card can be linked more than once on a page
        if page_ids.insert(listing.id.clone()) {
            outcome.listings.push(listing);
        }
    }

    outcome
}
