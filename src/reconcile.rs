//! Reconciliation engine: canonical products in, stored rows, change-only
//! price history, and barcode-derived cross-source links out.
//!
//! # Ingest
//!
//! [`ReconciliationEngine::ingest`] upserts the product (and its unit set),
//! then for every unit variant compares `(price, available)` with the
//! newest [`PriceRecord`] of that `(product, unit)` key and appends a new
//! record only when one of them differs. The compare and the append run
//! under a per-key lock so two ingests of the same key cannot both decide
//! "changed".
//!
//! # Linking
//!
//! Links are a pure function of the current catalog. For one barcode:
//!
//! 1. load every product carrying it and group them by source;
//! 2. a source with more than one product for the barcode is a collision:
//!    it is logged as a `link_inconsistency` and left out entirely;
//! 3. every remaining pair of products from different sources gets one
//!    link per pair of unit variants (`unit_a × unit_b`);
//! 4. links touching the group that are no longer derivable are removed.
//!
//! Products without a barcode are never linked.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::ErrorKind;
use crate::models::{CanonicalProduct, PriceRecord, ProductLink, StoredProduct, LINK_TYPE_BARCODE};
use crate::store::Store;

const LOCK_STRIPES: usize = 64;

/// What one [`ReconciliationEngine::ingest`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub product_id: String,
    pub created: bool,
    /// Price records appended.
    pub price_changes: usize,
    /// Present when the product's identity changed and links were recomputed.
    pub relink: Option<RelinkOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelinkOutcome {
    pub created: usize,
    pub kept: usize,
    pub removed: usize,
    /// Sources whose own products collide on the barcode.
    pub inconsistencies: usize,
}

impl RelinkOutcome {
    fn absorb(&mut self, other: RelinkOutcome) {
        self.created += other.created;
        self.kept += other.kept;
        self.removed += other.removed;
        self.inconsistencies += other.inconsistencies;
    }
}

pub struct ReconciliationEngine {
    store: Arc<dyn Store>,
    price_locks: Vec<Mutex<()>>,
    barcode_locks: Vec<Mutex<()>>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            price_locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            barcode_locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Persist one product observation.
    pub async fn ingest(
        &self,
        product: &CanonicalProduct,
        job_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let upsert = self
            .store
            .upsert_product(product, now)
            .await
            .with_context(|| {
                format!("upserting {}/{}", product.source, product.source_product_id)
            })?;

        let mut price_changes = 0;
        let mut seen_units = HashSet::new();
        for variant in &product.variants {
            if !seen_units.insert(variant.unit.as_str()) {
                tracing::debug!(
                    source = %product.source,
                    product = %product.source_product_id,
                    unit = %variant.unit,
                    "duplicate unit variant ignored"
                );
                continue;
            }
            let record = PriceRecord::observe(&upsert.product_id, variant, now, job_id);
            if self.record_if_changed(record).await? {
                price_changes += 1;
            }
        }

        let relink = if upsert.identity_changed {
            let mut outcome = RelinkOutcome::default();
            if let Some(old) = &upsert.previous_barcode {
                outcome.absorb(self.relink_barcode(old, now).await?);
            }
            outcome.absorb(self.relink(&upsert.product_id, now).await?);
            Some(outcome)
        } else {
            None
        };

        Ok(IngestOutcome {
            product_id: upsert.product_id,
            created: upsert.created,
            price_changes,
            relink,
        })
    }

    /// Append `record` unless it matches the latest record of its key.
    async fn record_if_changed(&self, record: PriceRecord) -> Result<bool> {
        let _guard = self.price_locks[stripe(&(&record.product_id, &record.unit))]
            .lock()
            .await;
        let latest = self
            .store
            .latest_price(&record.product_id, &record.unit)
            .await?;
        if latest.as_ref().is_some_and(|prev| !record.differs_from(prev)) {
            return Ok(false);
        }
        self.store.append_price(&record).await?;
        Ok(true)
    }

    /// Recompute the links of one stored product.
    pub async fn relink(&self, product_id: &str, now: DateTime<Utc>) -> Result<RelinkOutcome> {
        let product = self
            .store
            .get_product(product_id)
            .await?
            .with_context(|| format!("unknown product {product_id}"))?;

        match product.barcode.as_deref() {
            Some(barcode) => self.relink_barcode(barcode, now).await,
            None => {
                let mut outcome = RelinkOutcome::default();
                for link in self.store.links_for_product(product_id).await? {
                    if link.link_type == LINK_TYPE_BARCODE && self.store.delete_link(&link).await? {
                        outcome.removed += 1;
                    }
                }
                Ok(outcome)
            }
        }
    }

    /// Recompute every link among the products carrying `barcode`.
    pub async fn relink_barcode(&self, barcode: &str, now: DateTime<Utc>) -> Result<RelinkOutcome> {
        let _guard = self.barcode_locks[stripe(&barcode)].lock().await;
        let members = self.store.products_by_barcode(barcode).await?;

        let mut by_source: BTreeMap<&str, Vec<&StoredProduct>> = BTreeMap::new();
        for p in &members {
            by_source.entry(p.source.as_str()).or_default().push(p);
        }

        let mut outcome = RelinkOutcome::default();
        let mut eligible = Vec::new();
        for (source, products) in &by_source {
            if products.len() > 1 {
                outcome.inconsistencies += 1;
                let ids: Vec<&str> = products.iter().map(|p| p.source_product_id.as_str()).collect();
                tracing::warn!(
                    error_kind = ErrorKind::LinkInconsistency.as_str(),
                    barcode,
                    source = %source,
                    products = ?ids,
                    "barcode shared by several products of one source, links withheld"
                );
            } else {
                eligible.extend(products.iter().copied());
            }
        }

        let mut desired = Vec::new();
        for (i, x) in eligible.iter().enumerate() {
            for y in &eligible[i + 1..] {
                for ux in &x.units {
                    for uy in &y.units {
                        desired.push(ProductLink::barcode(&x.id, ux, &y.id, uy, now));
                    }
                }
            }
        }
        let desired_keys: BTreeSet<(String, String, String, String)> =
            desired.iter().map(owned_key).collect();

        for link in &desired {
            if self.store.upsert_link(link).await? {
                outcome.created += 1;
            } else {
                outcome.kept += 1;
            }
        }

        let mut checked = BTreeSet::new();
        for member in &members {
            for link in self.store.links_for_product(&member.id).await? {
                let key = owned_key(&link);
                if link.link_type != LINK_TYPE_BARCODE
                    || desired_keys.contains(&key)
                    || !checked.insert(key)
                {
                    continue;
                }
                if self.store.delete_link(&link).await? {
                    outcome.removed += 1;
                }
            }
        }

        if outcome.created > 0 || outcome.removed > 0 {
            tracing::info!(
                barcode,
                created = outcome.created,
                removed = outcome.removed,
                kept = outcome.kept,
                "links updated"
            );
        }
        Ok(outcome)
    }
}

fn owned_key(link: &ProductLink) -> (String, String, String, String) {
    (
        link.product_a.clone(),
        link.product_b.clone(),
        link.unit_a.clone(),
        link.unit_b.clone(),
    )
}

fn stripe<K: Hash>(key: &K) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % LOCK_STRIPES
}
