//! SQLite-backed seen-set.
//!
//! One row per listing ever notified. Rows are only inserted, never updated,
//! so `first_seen` always records the first time an id was stored.

use crate::error::StoreError;
use crate::models::{Listing, Platform};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

#[cfg(test)]
type ListingRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    i64,
);

#[derive(Clone)]
pub struct SeenStore {
    pool: SqlitePool,
}

impl SeenStore {
    /// Open (or create) the database at `path` and make sure the schema exists
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                title TEXT NOT NULL,
                price TEXT,
                url TEXT NOT NULL,
                image_url TEXT,
                location TEXT,
                first_seen INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_platform ON listings(platform)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_first_seen ON listings(first_seen)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Every stored id for `platform`, regardless of age
    pub async fn get_seen_ids(&self, platform: Platform) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM listings WHERE platform = ?")
            .bind(platform.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    /// Record a batch of notified listings. Returns how many ids were new.
    pub async fn store_listings(&self, listings: &[Listing]) -> Result<u64, StoreError> {
        self.store_listings_at(listings, Utc::now()).await
    }

    /// All-or-nothing insert; ids already present keep their original row.
    pub(crate) async fn store_listings_at(
        &self,
        listings: &[Listing],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if listings.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut stored = 0;

        for listing in listings {
            let result = sqlx::query(
                r#"
                INSERT INTO listings (id, platform, title, price, url, image_url, location, first_seen)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&listing.id)
            .bind(listing.platform.as_str())
            .bind(&listing.title)
            .bind(&listing.price)
            .bind(&listing.url)
            .bind(&listing.image_url)
            .bind(&listing.location)
            .bind(now.timestamp())
            .execute(&mut *tx)
            .await?;

            stored += result.rows_affected();
        }

        tx.commit().await?;
        Ok(stored)
    }

    /// Drop entries first seen more than `days` days ago. Returns rows removed.
    pub async fn cleanup_older_than(&self, days: u32) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let result = sqlx::query("DELETE FROM listings WHERE first_seen < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Stored listing count per platform
    pub async fn count_by_platform(&self) -> Result<Vec<(Platform, i64)>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT platform, COUNT(*) FROM listings GROUP BY platform ORDER BY platform",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(platform, count)| Ok((parse_platform(&platform)?, count)))
            .collect()
    }

    #[cfg(test)]
    pub async fn get_listing(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        let row: Option<ListingRow> = sqlx::query_as(
            r#"
            SELECT id, platform, title, price, url, image_url, location, first_seen
            FROM listings WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, platform, title, price, url, image_url, location, first_seen)| {
            Ok(Listing {
                id,
                platform: parse_platform(&platform)?,
                title,
                price,
                url,
                image_url,
                location,
                first_seen: DateTime::from_timestamp(first_seen, 0),
            })
        })
        .transpose()
    }
}

fn parse_platform(value: &str) -> Result<Platform, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::InvalidPlatform(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, SeenStore) {
        let dir = TempDir::new().unwrap();
        let store = SeenStore::open(&dir.path().join("data").join("seen.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn listing(id: &str, platform: Platform) -> Listing {
        Listing {
            id: id.to_string(),
            platform,
            title: "Sectional sofa".to_string(),
            price: Some("$400".to_string()),
            url: format!("https://example.test/{}", id),
            image_url: None,
            location: Some("Columbus, OH".to_string()),
            first_seen: None,
        }
    }

    #[tokio::test]
    async fn storing_twice_keeps_original_first_seen() {
        let (_dir, store) = open_store().await;
        let earlier = Utc::now() - Duration::hours(5);
        let item = listing("cl_1", Platform::Craigslist);

        assert_eq!(store.store_listings_at(&[item.clone()], earlier).await.unwrap(), 1);
        assert_eq!(store.store_listings(&[item]).await.unwrap(), 0);

        let stored = store.get_listing("cl_1").await.unwrap().unwrap();
        assert_eq!(stored.first_seen.unwrap().timestamp(), earlier.timestamp());
        assert_eq!(store.count_by_platform().await.unwrap(), vec![(Platform::Craigslist, 1)]);
    }

    #[tokio::test]
    async fn failed_row_rolls_back_the_whole_batch() {
        let (_dir, store) = open_store().await;
        sqlx::query(
            r#"
            CREATE TRIGGER reject_cl_bad BEFORE INSERT ON listings
            WHEN NEW.id = 'cl_bad'
            BEGIN
                SELECT RAISE(ABORT, 'rejected');
            END
            "#,
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let batch = [
            listing("cl_1", Platform::Craigslist),
            listing("cl_bad", Platform::Craigslist),
            listing("cl_3", Platform::Craigslist),
        ];
        assert!(matches!(
            store.store_listings(&batch).await,
            Err(StoreError::Database(_))
        ));

        assert!(store.get_seen_ids(Platform::Craigslist).await.unwrap().is_empty());
        assert!(store.count_by_platform().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn seen_ids_are_scoped_per_platform() {
        let (_dir, store) = open_store().await;
        store
            .store_listings(&[
                listing("cl_1", Platform::Craigslist),
                listing("fb_1", Platform::Facebook),
                listing("cl_2", Platform::Craigslist),
            ])
            .await
            .unwrap();

        let seen = store.get_seen_ids(Platform::Craigslist).await.unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains("cl_1") && seen.contains("cl_2"));
        assert!(!seen.contains("fb_1"));
    }

    #[tokio::test]
    async fn cleanup_evicts_only_expired_entries() {
        let (_dir, store) = open_store().await;
        let old = Utc::now() - Duration::days(8);
        store
            .store_listings_at(&[listing("cl_old", Platform::Craigslist)], old)
            .await
            .unwrap();
        store
            .store_listings(&[listing("cl_new", Platform::Craigslist)])
            .await
            .unwrap();

        let before = store.get_seen_ids(Platform::Craigslist).await.unwrap();
        assert!(before.contains("cl_old"));

        assert_eq!(store.cleanup_older_than(7).await.unwrap(), 1);

        let after = store.get_seen_ids(Platform::Craigslist).await.unwrap();
        assert!(!after.contains("cl_old"));
        assert!(after.contains("cl_new"));
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let (_dir, store) = open_store().await;
        assert_eq!(store.store_listings(&[]).await.unwrap(), 0);
        assert!(store.count_by_platform().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopening_keeps_the_seen_set() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seen.db");

        let store = SeenStore::open(&path).await.unwrap();
        store
            .store_listings(&[listing("fb_9", Platform::Facebook)])
            .await
            .unwrap();
        drop(store);

        let reopened = SeenStore::open(&path).await.unwrap();
        assert!(reopened
            .get_seen_ids(Platform::Facebook)
            .await
            .unwrap()
            .contains("fb_9"));
    }
}
