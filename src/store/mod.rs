//! Storage abstraction for pricewatch.
//!
//! The [`Store`] trait defines every persistence operation the token
//! manager, executor, reconciliation engine, and history queries need.
//! Two implementations ship with the crate:
//!
//! - [`memory::InMemoryStore`] for tests and library use.
//! - [`sqlite::SqliteStore`] backed by an sqlx SQLite pool.
//!
//! Uniqueness rules live in the storage layer, not in callers:
//!
//! | Record | Unique on |
//! |--------|-----------|
//! | product | `(source, source_product_id)` |
//! | product unit | `(product_id, unit)` |
//! | product link | `(product_a, product_b, unit_a, unit_b)` |
//! | running job | `source` (at most one running job per source) |
//!
//! Price records are append-only; only [`Store::prune_prices`] deletes them,
//! and it never removes the newest record of a `(product, unit)` key.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::PageCursor;
use crate::models::{
    CanonicalProduct, Category, Offer, PriceRecord, ProductLink, ProductUpsert, ScrapeJob,
    Session, StoredProduct,
};

/// Resume point for an interrupted walk over a source's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    /// Position of `category_id` in the category list of the job that wrote it.
    pub category_index: usize,
    pub category_id: String,
    /// Next page to fetch in that category.
    pub cursor: PageCursor,
}

/// Per-source catalog sizes for status reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogCounts {
    pub categories: u64,
    pub products: u64,
    pub offers: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ── sessions ──
    async fn load_session(&self, source: &str) -> Result<Option<Session>>;
    async fn save_session(&self, source: &str, session: &Session) -> Result<()>;
    async fn delete_session(&self, source: &str) -> Result<()>;

    // ── jobs ──
    /// Insert a new job. Fails if `job` is running and the source already
    /// has a running job.
    async fn create_job(&self, job: &ScrapeJob) -> Result<()>;
    async fn update_job(&self, job: &ScrapeJob) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<Option<ScrapeJob>>;
    /// Most recent first.
    async fn list_jobs(&self, source: Option<&str>, limit: usize) -> Result<Vec<ScrapeJob>>;
    async fn running_jobs(&self) -> Result<Vec<ScrapeJob>>;

    // ── checkpoints ──
    async fn get_checkpoint(&self, source: &str) -> Result<Option<Checkpoint>>;
    async fn set_checkpoint(&self, source: &str, checkpoint: &Checkpoint) -> Result<()>;
    async fn clear_checkpoint(&self, source: &str) -> Result<()>;

    // ── catalog ──
    async fn upsert_categories(&self, categories: &[Category], now: DateTime<Utc>) -> Result<usize>;
    async fn upsert_offers(&self, offers: &[Offer], now: DateTime<Utc>) -> Result<usize>;
    /// Insert or update a product and replace its unit set.
    async fn upsert_product(
        &self,
        product: &CanonicalProduct,
        now: DateTime<Utc>,
    ) -> Result<ProductUpsert>;
    async fn get_product(&self, id: &str) -> Result<Option<StoredProduct>>;
    async fn find_product(
        &self,
        source: &str,
        source_product_id: &str,
    ) -> Result<Option<StoredProduct>>;
    async fn products_by_barcode(&self, barcode: &str) -> Result<Vec<StoredProduct>>;
    async fn catalog_counts(&self, source: &str) -> Result<CatalogCounts>;

    // ── price history ──
    async fn latest_price(&self, product_id: &str, unit: &str) -> Result<Option<PriceRecord>>;
    async fn append_price(&self, record: &PriceRecord) -> Result<()>;
    /// Records ascending by `recorded_at`, optionally limited to one unit
    /// and to records at or after `since`.
    async fn price_history(
        &self,
        product_id: &str,
        unit: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PriceRecord>>;
    /// Delete records older than `before`, keeping the newest record of
    /// every `(product, unit)` key. Returns the number deleted.
    async fn prune_prices(&self, before: DateTime<Utc>) -> Result<u64>;

    // ── links ──
    /// Insert a link. Returns `false` when the 4-tuple already exists.
    async fn upsert_link(&self, link: &ProductLink) -> Result<bool>;
    async fn links_for_product(&self, product_id: &str) -> Result<Vec<ProductLink>>;
    async fn delete_link(&self, link: &ProductLink) -> Result<bool>;
}
