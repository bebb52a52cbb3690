//! Read side of the price ledger.
//!
//! | Query | Returns |
//! |-------|---------|
//! | [`price_history`] | change records of a product, oldest first |
//! | [`latest_prices`] | the newest record of every unit of a product |
//! | [`compare_product`] | latest prices on both sides of every link of a product |
//! | [`compare_barcode`] | latest price of every (source, unit) sharing a barcode |
//! | [`daily_summary`] | per-day min / max / closing price of one unit |
//!
//! [`prune`] is the retention step run by the daily cleanup trigger.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{PriceRecord, ProductLink, StoredProduct};
use crate::store::Store;

pub async fn price_history(
    store: &dyn Store,
    product_id: &str,
    unit: Option<&str>,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<PriceRecord>> {
    store.price_history(product_id, unit, since).await
}

/// Newest record per unit of the product's current unit set.
pub async fn latest_prices(store: &dyn Store, product_id: &str) -> Result<Vec<PriceRecord>> {
    let product = require_product(store, product_id).await?;
    let mut latest = Vec::new();
    for unit in &product.units {
        if let Some(record) = store.latest_price(product_id, unit).await? {
            latest.push(record);
        }
    }
    Ok(latest)
}

/// One side-by-side row of [`compare_product`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceComparison {
    pub unit: String,
    pub price: Option<PriceRecord>,
    pub other: StoredProduct,
    pub other_unit: String,
    pub other_price: Option<PriceRecord>,
    pub same_unit: bool,
}

impl PriceComparison {
    /// `price - other_price` when both sides have a price.
    pub fn difference(&self) -> Option<i64> {
        Some(self.price.as_ref()?.price - self.other_price.as_ref()?.price)
    }
}

/// Latest prices on both sides of every link touching `product_id`.
/// Same-unit rows come first.
pub async fn compare_product(store: &dyn Store, product_id: &str) -> Result<Vec<PriceComparison>> {
    require_product(store, product_id).await?;
    let mut rows = Vec::new();
    for link in store.links_for_product(product_id).await? {
        if let Some(row) = compare_link(store, &link, product_id).await? {
            rows.push(row);
        }
    }
    rows.sort_by(|a, b| {
        (!a.same_unit, &a.unit, &a.other.source, &a.other_unit)
            .cmp(&(!b.same_unit, &b.unit, &b.other.source, &b.other_unit))
    });
    Ok(rows)
}

async fn compare_link(
    store: &dyn Store,
    link: &ProductLink,
    product_id: &str,
) -> Result<Option<PriceComparison>> {
    let Some((unit, other_id, other_unit)) = link.counterpart(product_id) else {
        return Ok(None);
    };
    let Some(other) = store.get_product(other_id).await? else {
        tracing::warn!(product = other_id, "link points at a missing product");
        return Ok(None);
    };
    Ok(Some(PriceComparison {
        unit: unit.to_string(),
        price: store.latest_price(product_id, unit).await?,
        other_unit: other_unit.to_string(),
        other_price: store.latest_price(other_id, other_unit).await?,
        same_unit: unit == other_unit,
        other,
    }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarcodeQuote {
    pub product: StoredProduct,
    pub unit: String,
    pub latest: PriceRecord,
}

/// Latest price of every (product, unit) carrying `barcode`, cheapest first.
pub async fn compare_barcode(store: &dyn Store, barcode: &str) -> Result<Vec<BarcodeQuote>> {
    let mut quotes = Vec::new();
    for product in store.products_by_barcode(barcode).await? {
        for unit in &product.units {
            if let Some(latest) = store.latest_price(&product.id, unit).await? {
                quotes.push(BarcodeQuote {
                    product: product.clone(),
                    unit: unit.clone(),
                    latest,
                });
            }
        }
    }
    quotes.sort_by(|a, b| {
        (&a.unit, a.latest.price, &a.product.source).cmp(&(&b.unit, b.latest.price, &b.product.source))
    });
    Ok(quotes)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    pub day: NaiveDate,
    pub min: i64,
    pub max: i64,
    /// Price in effect at the end of the day.
    pub close: i64,
    pub changes: usize,
}

/// Per-day summary of one unit over the last `days` days. The price in
/// effect when the window opens counts toward the first day, so days with
/// a carried-over price are not reported as empty.
pub async fn daily_summary(
    store: &dyn Store,
    product_id: &str,
    unit: &str,
    days: u32,
    now: DateTime<Utc>,
) -> Result<Vec<DailySummary>> {
    let window_start = (now - ChronoDuration::days(i64::from(days.max(1)) - 1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .context("invalid window start")?
        .and_utc();

    let all = store.price_history(product_id, Some(unit), None).await?;
    let carried = all.iter().rev().find(|r| r.recorded_at < window_start).map(|r| r.price);

    let mut by_day: BTreeMap<NaiveDate, Vec<i64>> = BTreeMap::new();
    for record in all.iter().filter(|r| r.recorded_at >= window_start && r.recorded_at <= now) {
        by_day
            .entry(record.recorded_at.date_naive())
            .or_default()
            .push(record.price);
    }

    let mut summaries = Vec::new();
    let mut open = carried;
    let mut day = window_start.date_naive();
    let today = now.date_naive();
    while day <= today {
        let changes = by_day.get(&day).map(Vec::as_slice).unwrap_or_default();
        let prices: Vec<i64> = open.into_iter().chain(changes.iter().copied()).collect();
        if let (Some(min), Some(max), Some(close)) =
            (prices.iter().min(), prices.iter().max(), prices.last())
        {
            summaries.push(DailySummary {
                day,
                min: *min,
                max: *max,
                close: *close,
                changes: changes.len(),
            });
            open = Some(*close);
        }
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    Ok(summaries)
}

/// Drop price records older than `retention_days`, keeping the newest
/// record of every (product, unit) key.
pub async fn prune(store: &dyn Store, retention_days: u32, now: DateTime<Utc>) -> Result<u64> {
    let cutoff = now - ChronoDuration::days(i64::from(retention_days));
    let removed = store.prune_prices(cutoff).await?;
    tracing::info!(retention_days, removed, "pruned price history");
    Ok(removed)
}

async fn require_product(store: &dyn Store, product_id: &str) -> Result<StoredProduct> {
    store
        .get_product(product_id)
        .await?
        .with_context(|| format!("unknown product {product_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalProduct, UnitVariant};
    use crate::reconcile::ReconciliationEngine;
    use crate::store::memory::InMemoryStore;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    fn product(source: &str, barcode: &str, variants: &[(&str, i64)]) -> CanonicalProduct {
        CanonicalProduct {
            source: source.into(),
            source_product_id: format!("{source}-1"),
            name: "Rice 1kg".into(),
            barcode: Some(barcode.into()),
            category_id: None,
            variants: variants
                .iter()
                .map(|(unit, price)| UnitVariant {
                    unit: unit.to_string(),
                    price: *price,
                    original_price: None,
                    quantity: None,
                    available: true,
                })
                .collect(),
            offer_ids: vec![],
        }
    }

    #[tokio::test]
    async fn test_compare_product_fifty_vs_forty_five() {
        let store = Arc::new(InMemoryStore::new());
        let engine = ReconciliationEngine::new(store.clone());
        let alpha = engine
            .ingest(&product("alpha", "123", &[("piece", 5000)]), None, at(1, 8))
            .await
            .unwrap();
        engine
            .ingest(&product("beta", "123", &[("piece", 4500)]), None, at(1, 9))
            .await
            .unwrap();

        let rows = compare_product(store.as_ref(), &alpha.product_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].same_unit);
        assert_eq!(rows[0].other.source, "beta");
        assert_eq!(rows[0].price.as_ref().map(|r| r.price), Some(5000));
        assert_eq!(rows[0].other_price.as_ref().map(|r| r.price), Some(4500));
        assert_eq!(rows[0].difference(), Some(500));

        let quotes = compare_barcode(store.as_ref(), "123").await.unwrap();
        let sources: Vec<&str> = quotes.iter().map(|q| q.product.source.as_str()).collect();
        assert_eq!(sources, vec!["beta", "alpha"]);
    }

    #[tokio::test]
    async fn test_latest_prices_per_unit() {
        let store = Arc::new(InMemoryStore::new());
        let engine = ReconciliationEngine::new(store.clone());
        let p = product("alpha", "9", &[("piece", 500), ("carton", 5500)]);
        let out = engine.ingest(&p, None, at(1, 8)).await.unwrap();
        engine
            .ingest(&product("alpha", "9", &[("piece", 450), ("carton", 5500)]), None, at(2, 8))
            .await
            .unwrap();

        let mut latest = latest_prices(store.as_ref(), &out.product_id).await.unwrap();
        latest.sort_by(|a, b| a.unit.cmp(&b.unit));
        let got: Vec<(&str, i64)> = latest.iter().map(|r| (r.unit.as_str(), r.price)).collect();
        assert_eq!(got, vec![("carton", 5500), ("piece", 450)]);
    }

    #[tokio::test]
    async fn test_daily_summary_carries_price_forward() {
        let store = Arc::new(InMemoryStore::new());
        let engine = ReconciliationEngine::new(store.clone());
        let mut id = String::new();
        for (day, hour, price) in [(1, 8, 5000), (3, 8, 4800), (3, 20, 5200)] {
            id = engine
                .ingest(&product("alpha", "9", &[("piece", price)]), None, at(day, hour))
                .await
                .unwrap()
                .product_id;
        }

        let summary = daily_summary(store.as_ref(), &id, "piece", 3, at(4, 12)).await.unwrap();
        let days: Vec<(u32, i64, i64, i64, usize)> = summary
            .iter()
            .map(|s| (chrono::Datelike::day(&s.day), s.min, s.max, s.close, s.changes))
            .collect();
        assert_eq!(
            days,
            vec![
                (2, 5000, 5000, 5000, 0),
                (3, 4800, 5200, 5200, 2),
                (4, 5200, 5200, 5200, 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_prune_keeps_latest_record() {
        let store = Arc::new(InMemoryStore::new());
        let engine = ReconciliationEngine::new(store.clone());
        let mut id = String::new();
        for (day, price) in [(1, 5000), (2, 4900), (3, 4800)] {
            id = engine
                .ingest(&product("alpha", "9", &[("piece", price)]), None, at(day, 8))
                .await
                .unwrap()
                .product_id;
        }
        let removed = prune(store.as_ref(), 10, at(30, 0)).await.unwrap();
        assert_eq!(removed, 2);
        let left = price_history(store.as_ref(), &id, None, None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].price, 4800);
    }

    #[tokio::test]
    async fn test_unknown_product_is_an_error() {
        let store = InMemoryStore::new();
        assert!(compare_product(&store, "nope").await.is_err());
    }
}
