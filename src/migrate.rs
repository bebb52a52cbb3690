use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Sessions: last token per source, reused across restarts
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            source TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            issued_at INTEGER NOT NULL,
            expires_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Scrape jobs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scrape_jobs (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            state TEXT NOT NULL,
            started_at INTEGER,
            finished_at INTEGER,
            items_fetched INTEGER NOT NULL DEFAULT 0,
            items_written INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0,
            pages_ok INTEGER NOT NULL DEFAULT 0,
            pages_failed INTEGER NOT NULL DEFAULT 0,
            price_changes INTEGER NOT NULL DEFAULT 0,
            error_kind TEXT,
            reason TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Checkpoints: resume point of the last unfinished walk per source
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            source TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            category_index INTEGER NOT NULL,
            category_id TEXT NOT NULL,
            cursor TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            source TEXT NOT NULL,
            source_category_id TEXT NOT NULL,
            name TEXT NOT NULL,
            parent_id TEXT,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (source, source_category_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS offers (
            source TEXT NOT NULL,
            source_offer_id TEXT NOT NULL,
            title TEXT NOT NULL,
            product_ids TEXT NOT NULL DEFAULT '[]',
            price INTEGER,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (source, source_offer_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            source_product_id TEXT NOT NULL,
            name TEXT NOT NULL,
            barcode TEXT,
            category_id TEXT,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            UNIQUE(source, source_product_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS product_units (
            product_id TEXT NOT NULL,
            unit TEXT NOT NULL,
            UNIQUE(product_id, unit),
            FOREIGN KEY (product_id) REFERENCES products(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Price records: append-only, one row per observed change
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS price_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            product_id TEXT NOT NULL,
            unit TEXT NOT NULL,
            price INTEGER NOT NULL,
            original_price INTEGER,
            available INTEGER NOT NULL,
            quantity INTEGER,
            recorded_at INTEGER NOT NULL,
            job_id TEXT,
            FOREIGN KEY (product_id) REFERENCES products(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS product_links (
            product_a TEXT NOT NULL,
            product_b TEXT NOT NULL,
            unit_a TEXT NOT NULL,
            unit_b TEXT NOT NULL,
            link_type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(product_a, product_b, unit_a, unit_b),
            CHECK (product_a < product_b)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_scrape_jobs_one_running ON scrape_jobs(source) WHERE state = 'running'",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scrape_jobs_started ON scrape_jobs(started_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_products_barcode ON products(barcode)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_price_records_key ON price_records(product_id, unit, recorded_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_product_links_b ON product_links(product_b)")
        .execute(pool)
        .await?;

    Ok(())
}
