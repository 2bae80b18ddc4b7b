pub mod craigslist;
pub mod early_stop;
pub mod facebook;
pub mod html;
pub mod session;
pub mod traits;
pub mod types;

pub use craigslist::CraigslistScraper;
pub use facebook::FacebookScraper;
pub use session::BrowserSession;
pub use traits::ListingSource;
pub use types::SearchParams;
