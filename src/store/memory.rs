//! In-memory [`Store`] implementation for tests and library use.
//!
//! All state sits behind one `std::sync::Mutex`; no method holds the lock
//! across an await point.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    normalize_barcode, CanonicalProduct, Category, JobState, Offer, PriceRecord, ProductLink,
    ProductUpsert, ScrapeJob, Session, StoredProduct,
};

use super::{CatalogCounts, Checkpoint, Store};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    jobs: Vec<ScrapeJob>,
    checkpoints: HashMap<String, Checkpoint>,
    categories: HashMap<(String, String), Category>,
    offers: HashMap<(String, String), Offer>,
    products: HashMap<String, StoredProduct>,
    prices: Vec<PriceRecord>,
    links: Vec<ProductLink>,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn load_session(&self, source: &str) -> Result<Option<Session>> {
        Ok(self.lock()?.sessions.get(source).cloned())
    }

    async fn save_session(&self, source: &str, session: &Session) -> Result<()> {
        self.lock()?
            .sessions
            .insert(source.to_string(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, source: &str) -> Result<()> {
        self.lock()?.sessions.remove(source);
        Ok(())
    }

    async fn create_job(&self, job: &ScrapeJob) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.jobs.iter().any(|j| j.id == job.id) {
            anyhow::bail!("job {} already exists", job.id);
        }
        if job.state == JobState::Running
            && inner
                .jobs
                .iter()
                .any(|j| j.source == job.source && j.state == JobState::Running)
        {
            anyhow::bail!("source '{}' already has a running job", job.source);
        }
        inner.jobs.push(job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &ScrapeJob) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => anyhow::bail!("job {} not found", job.id),
        }
    }

    async fn get_job(&self, id: &str) -> Result<Option<ScrapeJob>> {
        Ok(self.lock()?.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_jobs(&self, source: Option<&str>, limit: usize) -> Result<Vec<ScrapeJob>> {
        let inner = self.lock()?;
        Ok(inner
            .jobs
            .iter()
            .rev()
            .filter(|j| source.map_or(true, |s| j.source == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn running_jobs(&self) -> Result<Vec<ScrapeJob>> {
        let inner = self.lock()?;
        Ok(inner
            .jobs
            .iter()
            .filter(|j| j.state == JobState::Running)
            .cloned()
            .collect())
    }

    async fn get_checkpoint(&self, source: &str) -> Result<Option<Checkpoint>> {
        Ok(self.lock()?.checkpoints.get(source).cloned())
    }

    async fn set_checkpoint(&self, source: &str, checkpoint: &Checkpoint) -> Result<()> {
        self.lock()?
            .checkpoints
            .insert(source.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn clear_checkpoint(&self, source: &str) -> Result<()> {
        self.lock()?.checkpoints.remove(source);
        Ok(())
    }

    async fn upsert_categories(&self, categories: &[Category], _now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        for c in categories {
            inner.categories.insert(
                (c.source.clone(), c.source_category_id.clone()),
                c.clone(),
            );
        }
        Ok(categories.len())
    }

    async fn upsert_offers(&self, offers: &[Offer], _now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        for o in offers {
            inner
                .offers
                .insert((o.source.clone(), o.source_offer_id.clone()), o.clone());
        }
        Ok(offers.len())
    }

    async fn upsert_product(
        &self,
        product: &CanonicalProduct,
        now: DateTime<Utc>,
    ) -> Result<ProductUpsert> {
        let mut inner = self.lock()?;
        let barcode = product.normalized_barcode().map(str::to_string);
        let units = product.unit_set();

        let existing_id = inner
            .products
            .values()
            .find(|p| p.source == product.source && p.source_product_id == product.source_product_id)
            .map(|p| p.id.clone());

        if let Some(id) = existing_id {
            let stored = inner
                .products
                .get_mut(&id)
                .ok_or_else(|| anyhow!("product {id} vanished during upsert"))?;
            let identity_changed = stored.barcode != barcode || stored.units != units;
            let previous_barcode = stored.barcode.clone().filter(|old| Some(old) != barcode.as_ref());
            stored.name = product.name.clone();
            stored.barcode = barcode;
            stored.category_id = product.category_id.clone();
            stored.units = units;
            stored.last_seen = now;
            return Ok(ProductUpsert {
                product_id: id,
                created: false,
                identity_changed,
                previous_barcode,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        inner.products.insert(
            id.clone(),
            StoredProduct {
                id: id.clone(),
                source: product.source.clone(),
                source_product_id: product.source_product_id.clone(),
                name: product.name.clone(),
                barcode,
                category_id: product.category_id.clone(),
                units,
                first_seen: now,
                last_seen: now,
            },
        );
        Ok(ProductUpsert {
            product_id: id,
            created: true,
            identity_changed: true,
            previous_barcode: None,
        })
    }

    async fn get_product(&self, id: &str) -> Result<Option<StoredProduct>> {
        Ok(self.lock()?.products.get(id).cloned())
    }

    async fn find_product(
        &self,
        source: &str,
        source_product_id: &str,
    ) -> Result<Option<StoredProduct>> {
        Ok(self
            .lock()?
            .products
            .values()
            .find(|p| p.source == source && p.source_product_id == source_product_id)
            .cloned())
    }

    async fn products_by_barcode(&self, barcode: &str) -> Result<Vec<StoredProduct>> {
        let Some(barcode) = normalize_barcode(Some(barcode)) else {
            return Ok(Vec::new());
        };
        let inner = self.lock()?;
        let mut found: Vec<StoredProduct> = inner
            .products
            .values()
            .filter(|p| p.barcode.as_deref() == Some(barcode))
            .cloned()
            .collect();
        found.sort_by(|a, b| (&a.source, &a.id).cmp(&(&b.source, &b.id)));
        Ok(found)
    }

    async fn catalog_counts(&self, source: &str) -> Result<CatalogCounts> {
        let inner = self.lock()?;
        Ok(CatalogCounts {
            categories: inner.categories.keys().filter(|(s, _)| s == source).count() as u64,
            products: inner.products.values().filter(|p| p.source == source).count() as u64,
            offers: inner.offers.keys().filter(|(s, _)| s == source).count() as u64,
        })
    }

    async fn latest_price(&self, product_id: &str, unit: &str) -> Result<Option<PriceRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .prices
            .iter()
            .enumerate()
            .filter(|(_, r)| r.product_id == product_id && r.unit == unit)
            .max_by_key(|(i, r)| (r.recorded_at, *i))
            .map(|(_, r)| r.clone()))
    }

    async fn append_price(&self, record: &PriceRecord) -> Result<()> {
        self.lock()?.prices.push(record.clone());
        Ok(())
    }

    async fn price_history(
        &self,
        product_id: &str,
        unit: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PriceRecord>> {
        let inner = self.lock()?;
        let mut records: Vec<PriceRecord> = inner
            .prices
            .iter()
            .filter(|r| r.product_id == product_id)
            .filter(|r| unit.map_or(true, |u| r.unit == u))
            .filter(|r| since.map_or(true, |s| r.recorded_at >= s))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }

    async fn prune_prices(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock()?;
        let mut newest: HashMap<(String, String), (DateTime<Utc>, usize)> = HashMap::new();
        for (i, r) in inner.prices.iter().enumerate() {
            let slot = newest
                .entry((r.product_id.clone(), r.unit.clone()))
                .or_insert((r.recorded_at, i));
            if (r.recorded_at, i) >= *slot {
                *slot = (r.recorded_at, i);
            }
        }
        let keep: BTreeSet<usize> = newest.into_values().map(|(_, i)| i).collect();
        let before_len = inner.prices.len();
        let mut index = 0;
        inner.prices.retain(|r| {
            let kept = keep.contains(&index) || r.recorded_at >= before;
            index += 1;
            kept
        });
        Ok((before_len - inner.prices.len()) as u64)
    }

    async fn upsert_link(&self, link: &ProductLink) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.links.iter().any(|l| l.key() == link.key()) {
            return Ok(false);
        }
        inner.links.push(link.clone());
        Ok(true)
    }

    async fn links_for_product(&self, product_id: &str) -> Result<Vec<ProductLink>> {
        let inner = self.lock()?;
        Ok(inner
            .links
            .iter()
            .filter(|l| l.involves(product_id))
            .cloned()
            .collect())
    }

    async fn delete_link(&self, link: &ProductLink) -> Result<bool> {
        let mut inner = self.lock()?;
        let before = inner.links.len();
        inner.links.retain(|l| l.key() != link.key());
        Ok(inner.links.len() != before)
    }
}
