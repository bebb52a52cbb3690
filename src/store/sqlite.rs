//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the schema created by
//! [`crate::migrate::apply`]. Timestamps are stored as Unix milliseconds.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::ErrorKind;
use crate::models::{
    normalize_barcode, CanonicalProduct, Category, JobCounts, JobState, Offer, PriceRecord,
    ProductLink, ProductUpsert, ScrapeJob, Session, StoredProduct,
};

use super::{CatalogCounts, Checkpoint, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_units(&self, product_id: &str) -> Result<BTreeSet<String>> {
        let units: Vec<String> =
            sqlx::query_scalar("SELECT unit FROM product_units WHERE product_id = ?")
                .bind(product_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(units.into_iter().collect())
    }

    async fn product_from_row(&self, row: &SqliteRow) -> Result<StoredProduct> {
        let id: String = row.try_get("id")?;
        let units = self.load_units(&id).await?;
        Ok(StoredProduct {
            source: row.try_get("source")?,
            source_product_id: row.try_get("source_product_id")?,
            name: row.try_get("name")?,
            barcode: row.try_get("barcode")?,
            category_id: row.try_get("category_id")?,
            units,
            first_seen: from_ms(row.try_get("first_seen")?)?,
            last_seen: from_ms(row.try_get("last_seen")?)?,
            id,
        })
    }
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {ms}"))
}

fn opt_from_ms(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_ms).transpose()
}

fn job_from_row(row: &SqliteRow) -> Result<ScrapeJob> {
    let state: String = row.try_get("state")?;
    let error_kind: Option<String> = row.try_get("error_kind")?;
    Ok(ScrapeJob {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        state: JobState::parse(&state).ok_or_else(|| anyhow!("unknown job state '{state}'"))?,
        started_at: opt_from_ms(row.try_get("started_at")?)?,
        finished_at: opt_from_ms(row.try_get("finished_at")?)?,
        counts: JobCounts {
            items_fetched: row.try_get::<i64, _>("items_fetched")? as u64,
            items_written: row.try_get::<i64, _>("items_written")? as u64,
            errors: row.try_get::<i64, _>("errors")? as u64,
            pages_ok: row.try_get::<i64, _>("pages_ok")? as u64,
            pages_failed: row.try_get::<i64, _>("pages_failed")? as u64,
            price_changes: row.try_get::<i64, _>("price_changes")? as u64,
        },
        error_kind: error_kind.as_deref().and_then(ErrorKind::parse),
        reason: row.try_get("reason")?,
    })
}

fn price_from_row(row: &SqliteRow) -> Result<PriceRecord> {
    Ok(PriceRecord {
        product_id: row.try_get("product_id")?,
        unit: row.try_get("unit")?,
        price: row.try_get("price")?,
        original_price: row.try_get("original_price")?,
        available: row.try_get::<i64, _>("available")? != 0,
        quantity: row.try_get("quantity")?,
        recorded_at: from_ms(row.try_get("recorded_at")?)?,
        job_id: row.try_get("job_id")?,
    })
}

fn link_from_row(row: &SqliteRow) -> Result<ProductLink> {
    Ok(ProductLink {
        product_a: row.try_get("product_a")?,
        product_b: row.try_get("product_b")?,
        unit_a: row.try_get("unit_a")?,
        unit_b: row.try_get("unit_b")?,
        link_type: row.try_get("link_type")?,
        created_at: from_ms(row.try_get("created_at")?)?,
    })
}

const JOB_COLUMNS: &str = "id, source, state, started_at, finished_at, items_fetched, \
    items_written, errors, pages_ok, pages_failed, price_changes, error_kind, reason";

const PRICE_COLUMNS: &str =
    "product_id, unit, price, original_price, available, quantity, recorded_at, job_id";

#[async_trait]
impl Store for SqliteStore {
    async fn load_session(&self, source: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT token, issued_at, expires_at FROM sessions WHERE source = ?")
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Session {
                token: row.try_get("token")?,
                issued_at: from_ms(row.try_get("issued_at")?)?,
                expires_at: opt_from_ms(row.try_get("expires_at")?)?,
            })
        })
        .transpose()
    }

    async fn save_session(&self, source: &str, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (source, token, issued_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                token = excluded.token,
                issued_at = excluded.issued_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(source)
        .bind(&session.token)
        .bind(to_ms(session.issued_at))
        .bind(session.expires_at.map(to_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_session(&self, source: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE source = ?")
            .bind(source)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_job(&self, job: &ScrapeJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scrape_jobs (id, source, state, started_at, finished_at,
                                     items_fetched, items_written, errors, pages_ok,
                                     pages_failed, price_changes, error_kind, reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.source)
        .bind(job.state.as_str())
        .bind(job.started_at.map(to_ms))
        .bind(job.finished_at.map(to_ms))
        .bind(job.counts.items_fetched as i64)
        .bind(job.counts.items_written as i64)
        .bind(job.counts.errors as i64)
        .bind(job.counts.pages_ok as i64)
        .bind(job.counts.pages_failed as i64)
        .bind(job.counts.price_changes as i64)
        .bind(job.error_kind.map(|k| k.as_str()))
        .bind(&job.reason)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create job for source '{}'", job.source))?;
        Ok(())
    }

    async fn update_job(&self, job: &ScrapeJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs SET
                state = ?, started_at = ?, finished_at = ?,
                items_fetched = ?, items_written = ?, errors = ?,
                pages_ok = ?, pages_failed = ?, price_changes = ?,
                error_kind = ?, reason = ?
            WHERE id = ?
            "#,
        )
        .bind(job.state.as_str())
        .bind(job.started_at.map(to_ms))
        .bind(job.finished_at.map(to_ms))
        .bind(job.counts.items_fetched as i64)
        .bind(job.counts.items_written as i64)
        .bind(job.counts.errors as i64)
        .bind(job.counts.pages_ok as i64)
        .bind(job.counts.pages_failed as i64)
        .bind(job.counts.price_changes as i64)
        .bind(job.error_kind.map(|k| k.as_str()))
        .bind(&job.reason)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("job {} not found", job.id);
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<ScrapeJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, source: Option<&str>, limit: usize) -> Result<Vec<ScrapeJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scrape_jobs \
             WHERE (?1 IS NULL OR source = ?1) \
             ORDER BY started_at DESC, rowid DESC LIMIT ?2"
        ))
        .bind(source)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn running_jobs(&self) -> Result<Vec<ScrapeJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE state = 'running'"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn get_checkpoint(&self, source: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT job_id, category_index, category_id, cursor FROM checkpoints WHERE source = ?",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let cursor: String = row.try_get("cursor")?;
            Ok(Checkpoint {
                job_id: row.try_get("job_id")?,
                category_index: row.try_get::<i64, _>("category_index")? as usize,
                category_id: row.try_get("category_id")?,
                cursor: serde_json::from_str(&cursor)
                    .with_context(|| format!("Corrupt checkpoint cursor for '{source}'"))?,
            })
        })
        .transpose()
    }

    async fn set_checkpoint(&self, source: &str, checkpoint: &Checkpoint) -> Result<()> {
        let cursor = serde_json::to_string(&checkpoint.cursor)?;
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, job_id, category_index, category_id, cursor, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                job_id = excluded.job_id,
                category_index = excluded.category_index,
                category_id = excluded.category_id,
                cursor = excluded.cursor,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source)
        .bind(&checkpoint.job_id)
        .bind(checkpoint.category_index as i64)
        .bind(&checkpoint.category_id)
        .bind(cursor)
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_checkpoint(&self, source: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE source = ?")
            .bind(source)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_categories(&self, categories: &[Category], now: DateTime<Utc>) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for c in categories {
            sqlx::query(
                r#"
                INSERT INTO categories (source, source_category_id, name, parent_id, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(source, source_category_id) DO UPDATE SET
                    name = excluded.name,
                    parent_id = excluded.parent_id,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&c.source)
            .bind(&c.source_category_id)
            .bind(&c.name)
            .bind(&c.parent_id)
            .bind(to_ms(now))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(categories.len())
    }

    async fn upsert_offers(&self, offers: &[Offer], now: DateTime<Utc>) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for o in offers {
            sqlx::query(
                r#"
                INSERT INTO offers (source, source_offer_id, title, product_ids, price, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(source, source_offer_id) DO UPDATE SET
                    title = excluded.title,
                    product_ids = excluded.product_ids,
                    price = excluded.price,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&o.source)
            .bind(&o.source_offer_id)
            .bind(&o.title)
            .bind(serde_json::to_string(&o.product_ids)?)
            .bind(o.price)
            .bind(to_ms(now))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(offers.len())
    }

    async fn upsert_product(
        &self,
        product: &CanonicalProduct,
        now: DateTime<Utc>,
    ) -> Result<ProductUpsert> {
        let barcode = product.normalized_barcode().map(str::to_string);
        let units = product.unit_set();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT id, barcode FROM products WHERE source = ? AND source_product_id = ?",
        )
        .bind(&product.source)
        .bind(&product.source_product_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some(row) => {
                let id: String = row.try_get("id")?;
                let old_barcode: Option<String> = row.try_get("barcode")?;
                let old_units: Vec<String> =
                    sqlx::query_scalar("SELECT unit FROM product_units WHERE product_id = ?")
                        .bind(&id)
                        .fetch_all(&mut *tx)
                        .await?;
                let old_units: BTreeSet<String> = old_units.into_iter().collect();

                sqlx::query(
                    r#"
                    UPDATE products SET name = ?, barcode = ?, category_id = ?, last_seen = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&product.name)
                .bind(&barcode)
                .bind(&product.category_id)
                .bind(to_ms(now))
                .bind(&id)
                .execute(&mut *tx)
                .await?;

                let identity_changed = old_barcode != barcode || old_units != units;
                let previous_barcode = old_barcode.filter(|old| Some(old) != barcode.as_ref());
                if old_units != units {
                    sqlx::query("DELETE FROM product_units WHERE product_id = ?")
                        .bind(&id)
                        .execute(&mut *tx)
                        .await?;
                    for unit in &units {
                        sqlx::query("INSERT INTO product_units (product_id, unit) VALUES (?, ?)")
                            .bind(&id)
                            .bind(unit)
                            .execute(&mut *tx)
                            .await?;
                    }
                }
                ProductUpsert {
                    product_id: id,
                    created: false,
                    identity_changed,
                    previous_barcode,
                }
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO products (id, source, source_product_id, name, barcode,
                                          category_id, first_seen, last_seen)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(&product.source)
                .bind(&product.source_product_id)
                .bind(&product.name)
                .bind(&barcode)
                .bind(&product.category_id)
                .bind(to_ms(now))
                .bind(to_ms(now))
                .execute(&mut *tx)
                .await?;
                for unit in &units {
                    sqlx::query("INSERT INTO product_units (product_id, unit) VALUES (?, ?)")
                        .bind(&id)
                        .bind(unit)
                        .execute(&mut *tx)
                        .await?;
                }
                ProductUpsert {
                    product_id: id,
                    created: true,
                    identity_changed: true,
                    previous_barcode: None,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_product(&self, id: &str) -> Result<Option<StoredProduct>> {
        let row = sqlx::query("SELECT * FROM products WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.product_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn find_product(
        &self,
        source: &str,
        source_product_id: &str,
    ) -> Result<Option<StoredProduct>> {
        let row = sqlx::query("SELECT * FROM products WHERE source = ? AND source_product_id = ?")
            .bind(source)
            .bind(source_product_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.product_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn products_by_barcode(&self, barcode: &str) -> Result<Vec<StoredProduct>> {
        let Some(barcode) = normalize_barcode(Some(barcode)) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query("SELECT * FROM products WHERE barcode = ? ORDER BY source, id")
            .bind(barcode)
            .fetch_all(&self.pool)
            .await?;
        let mut products = Vec::with_capacity(rows.len());
        for row in &rows {
            products.push(self.product_from_row(row).await?);
        }
        Ok(products)
    }

    async fn catalog_counts(&self, source: &str) -> Result<CatalogCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM categories WHERE source = ?1) AS categories,
                (SELECT COUNT(*) FROM products WHERE source = ?1) AS products,
                (SELECT COUNT(*) FROM offers WHERE source = ?1) AS offers
            "#,
        )
        .bind(source)
        .fetch_one(&self.pool)
        .await?;
        Ok(CatalogCounts {
            categories: row.try_get::<i64, _>("categories")? as u64,
            products: row.try_get::<i64, _>("products")? as u64,
            offers: row.try_get::<i64, _>("offers")? as u64,
        })
    }

    async fn latest_price(&self, product_id: &str, unit: &str) -> Result<Option<PriceRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PRICE_COLUMNS} FROM price_records \
             WHERE product_id = ? AND unit = ? \
             ORDER BY recorded_at DESC, id DESC LIMIT 1"
        ))
        .bind(product_id)
        .bind(unit)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(price_from_row).transpose()
    }

    async fn append_price(&self, record: &PriceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO price_records (product_id, unit, price, original_price, available,
                                       quantity, recorded_at, job_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.product_id)
        .bind(&record.unit)
        .bind(record.price)
        .bind(record.original_price)
        .bind(record.available as i64)
        .bind(record.quantity)
        .bind(to_ms(record.recorded_at))
        .bind(&record.job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn price_history(
        &self,
        product_id: &str,
        unit: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PriceRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PRICE_COLUMNS} FROM price_records \
             WHERE product_id = ?1 \
               AND (?2 IS NULL OR unit = ?2) \
               AND (?3 IS NULL OR recorded_at >= ?3) \
             ORDER BY recorded_at ASC, id ASC"
        ))
        .bind(product_id)
        .bind(unit)
        .bind(since.map(to_ms))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(price_from_row).collect()
    }

    async fn prune_prices(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM price_records
            WHERE recorded_at < ?
              AND id <> (
                  SELECT latest.id FROM price_records AS latest
                  WHERE latest.product_id = price_records.product_id
                    AND latest.unit = price_records.unit
                  ORDER BY latest.recorded_at DESC, latest.id DESC
                  LIMIT 1
              )
            "#,
        )
        .bind(to_ms(before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_link(&self, link: &ProductLink) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO product_links (product_a, product_b, unit_a, unit_b, link_type, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(product_a, product_b, unit_a, unit_b) DO NOTHING
            "#,
        )
        .bind(&link.product_a)
        .bind(&link.product_b)
        .bind(&link.unit_a)
        .bind(&link.unit_b)
        .bind(&link.link_type)
        .bind(to_ms(link.created_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn links_for_product(&self, product_id: &str) -> Result<Vec<ProductLink>> {
        let rows = sqlx::query(
            r#"
            SELECT product_a, product_b, unit_a, unit_b, link_type, created_at
            FROM product_links
            WHERE product_a = ?1 OR product_b = ?1
            ORDER BY product_a, product_b, unit_a, unit_b
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(link_from_row).collect()
    }

    async fn delete_link(&self, link: &ProductLink) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM product_links
            WHERE product_a = ? AND product_b = ? AND unit_a = ? AND unit_b = ?
            "#,
        )
        .bind(&link.product_a)
        .bind(&link.product_b)
        .bind(&link.unit_a)
        .bind(&link.unit_b)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
