//! Core data models shared by adapters, the executor, and the
//! reconciliation engine.
//!
//! Adapters produce [`CanonicalProduct`], [`Category`], and [`Offer`]
//! values; the reconciliation engine turns products into stored rows,
//! [`PriceRecord`]s, and [`ProductLink`]s; the executor tracks each run as a
//! [`ScrapeJob`] and reports a [`JobOutcome`].
//!
//! Prices are integer minor currency units (two decimal places) so change
//! detection is an exact comparison.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::ErrorKind;

// ═══════════════════════════════════════════════════════════════════════
// Credentials
// ═══════════════════════════════════════════════════════════════════════

/// Login material for one source.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub source: String,
    pub identifier: String,
    pub secret: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.source)
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// An upstream session token.
///
/// `expires_at = None` means the upstream did not report an expiry and the
/// source policy treats the token as long-lived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(token: impl Into<String>, issued_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            issued_at,
            expires_at: None,
        }
    }

    pub fn expiring_in(mut self, lifetime: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(lifetime)
            .ok()
            .and_then(|d| self.issued_at.checked_add_signed(d));
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    /// Span between issue and expiry, when the token expires at all.
    pub fn lifetime(&self) -> Option<Duration> {
        self.expires_at
            .and_then(|exp| (exp - self.issued_at).to_std().ok())
    }

    /// True when the token expires within `lead` of `now` (or already has).
    pub fn expires_within(&self, now: DateTime<Utc>, lead: Duration) -> bool {
        match self.expires_at {
            None => false,
            Some(exp) => {
                let lead = chrono::Duration::from_std(lead).unwrap_or(chrono::Duration::MAX);
                match now.checked_add_signed(lead) {
                    Some(horizon) => exp <= horizon,
                    None => true,
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Running,
    Succeeded,
    Failed,
    PartiallySucceeded,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::PartiallySucceeded => "partially_succeeded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "scheduled" => Self::Scheduled,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "partially_succeeded" => Self::PartiallySucceeded,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::PartiallySucceeded
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job counters. Every attempted page ends up in exactly one of
/// `pages_ok` / `pages_failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub items_fetched: u64,
    pub items_written: u64,
    pub errors: u64,
    pub pages_ok: u64,
    pub pages_failed: u64,
    pub price_changes: u64,
}

/// One execution attempt of one source's full-catalog scrape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: String,
    pub source: String,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: JobCounts,
    pub error_kind: Option<ErrorKind>,
    pub reason: Option<String>,
}

impl ScrapeJob {
    pub fn start(source: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.to_string(),
            state: JobState::Running,
            started_at: Some(now),
            finished_at: None,
            counts: JobCounts::default(),
            error_kind: None,
            reason: None,
        }
    }
}

/// Structured per-job record handed to logging/metrics collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub source: String,
    pub state: JobState,
    pub counts: JobCounts,
    pub duration_ms: u64,
    pub error_kind: Option<ErrorKind>,
    pub reason: Option<String>,
    pub needs_operator: bool,
}

impl JobOutcome {
    pub fn from_job(job: &ScrapeJob, duration: Duration) -> Self {
        Self {
            job_id: job.id.clone(),
            source: job.source.clone(),
            state: job.state,
            counts: job.counts.clone(),
            duration_ms: duration.as_millis().min(u64::MAX as u128) as u64,
            error_kind: job.error_kind,
            reason: job.reason.clone(),
            needs_operator: job.error_kind.is_some_and(|k| k.needs_operator()),
        }
    }

    /// Emit the outcome as a structured `tracing` event.
    pub fn emit(&self) {
        let error_kind = self.error_kind.map(|k| k.as_str()).unwrap_or("none");
        tracing::info!(
            target: "pricewatch::outcome",
            job_id = %self.job_id,
            source = %self.source,
            state = %self.state,
            items_fetched = self.counts.items_fetched,
            items_written = self.counts.items_written,
            errors = self.counts.errors,
            pages_ok = self.counts.pages_ok,
            pages_failed = self.counts.pages_failed,
            price_changes = self.counts.price_changes,
            duration_ms = self.duration_ms,
            error_kind,
            needs_operator = self.needs_operator,
            reason = self.reason.as_deref().unwrap_or(""),
            "scrape job finished"
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Catalog
// ═══════════════════════════════════════════════════════════════════════

/// One (unit, price, quantity) tuple of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitVariant {
    pub unit: String,
    pub price: i64,
    pub original_price: Option<i64>,
    pub quantity: Option<i64>,
    pub available: bool,
}

/// A product as seen by one source during one scrape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub source: String,
    pub source_product_id: String,
    pub name: String,
    pub barcode: Option<String>,
    pub category_id: Option<String>,
    pub variants: Vec<UnitVariant>,
    pub offer_ids: Vec<String>,
}

impl CanonicalProduct {
    /// Trimmed barcode, `None` when absent or blank.
    pub fn normalized_barcode(&self) -> Option<&str> {
        normalize_barcode(self.barcode.as_deref())
    }

    pub fn unit_set(&self) -> BTreeSet<String> {
        self.variants.iter().map(|v| v.unit.clone()).collect()
    }
}

pub fn normalize_barcode(barcode: Option<&str>) -> Option<&str> {
    barcode.map(str::trim).filter(|b| !b.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub source: String,
    pub source_category_id: String,
    pub name: String,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub source: String,
    pub source_offer_id: String,
    pub title: String,
    pub product_ids: Vec<String>,
    pub price: Option<i64>,
}

/// A product row as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProduct {
    pub id: String,
    pub source: String,
    pub source_product_id: String,
    pub name: String,
    pub barcode: Option<String>,
    pub category_id: Option<String>,
    pub units: BTreeSet<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Result of persisting a [`CanonicalProduct`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductUpsert {
    pub product_id: String,
    pub created: bool,
    /// New product, or its barcode or unit set changed since last seen.
    pub identity_changed: bool,
    /// Barcode stored before this upsert, when it differs from the new one.
    pub previous_barcode: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// History & links
// ═══════════════════════════════════════════════════════════════════════

/// An immutable (product, unit) price and availability observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub product_id: String,
    pub unit: String,
    pub price: i64,
    pub original_price: Option<i64>,
    pub available: bool,
    pub quantity: Option<i64>,
    pub recorded_at: DateTime<Utc>,
    pub job_id: Option<String>,
}

impl PriceRecord {
    pub fn observe(
        product_id: &str,
        variant: &UnitVariant,
        recorded_at: DateTime<Utc>,
        job_id: Option<&str>,
    ) -> Self {
        Self {
            product_id: product_id.to_string(),
            unit: variant.unit.clone(),
            price: variant.price,
            original_price: variant.original_price,
            available: variant.available,
            quantity: variant.quantity,
            recorded_at,
            job_id: job_id.map(str::to_string),
        }
    }

    /// Whether this observation records a different value than `previous`.
    /// Only price and availability count; quantity alone is not a change.
    pub fn differs_from(&self, previous: &PriceRecord) -> bool {
        self.price != previous.price || self.available != previous.available
    }
}

/// Link type for links derived from matching barcodes.
pub const LINK_TYPE_BARCODE: &str = "barcode";

/// Assertion that two per-source product units denote the same item.
///
/// Always stored with `product_a < product_b` so the 4-tuple key is
/// orientation-free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductLink {
    pub product_a: String,
    pub product_b: String,
    pub unit_a: String,
    pub unit_b: String,
    pub link_type: String,
    pub created_at: DateTime<Utc>,
}

impl ProductLink {
    pub fn barcode(
        product_x: &str,
        unit_x: &str,
        product_y: &str,
        unit_y: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let ((product_a, unit_a), (product_b, unit_b)) = if product_x <= product_y {
            ((product_x, unit_x), (product_y, unit_y))
        } else {
            ((product_y, unit_y), (product_x, unit_x))
        };
        Self {
            product_a: product_a.to_string(),
            product_b: product_b.to_string(),
            unit_a: unit_a.to_string(),
            unit_b: unit_b.to_string(),
            link_type: LINK_TYPE_BARCODE.to_string(),
            created_at: now,
        }
    }

    pub fn key(&self) -> (&str, &str, &str, &str) {
        (&self.product_a, &self.product_b, &self.unit_a, &self.unit_b)
    }

    pub fn involves(&self, product_id: &str) -> bool {
        self.product_a == product_id || self.product_b == product_id
    }

    /// The other side of the link as (product, unit), seen from `product_id`.
    pub fn counterpart(&self, product_id: &str) -> Option<(&str, &str, &str)> {
        if self.product_a == product_id {
            Some((&self.unit_a, &self.product_b, &self.unit_b))
        } else if self.product_b == product_id {
            Some((&self.unit_b, &self.product_a, &self.unit_a))
        } else {
            None
        }
    }
}

/// Format minor units as a decimal string (`4550` → `"45.50"`).
pub fn format_price(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}
