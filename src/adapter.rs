//! The capability set every upstream adapter implements.
//!
//! An adapter knows one upstream's endpoints and JSON shapes and nothing
//! else: it never retries, never sleeps, and never rate-limits itself. All
//! traffic goes through the shared [`RateLimitedClient`] and tokens come from
//! the [`TokenManager`]. Failures propagate typed as [`ScrapeError`] so the
//! executor can tell a flaky network from an upstream that changed shape.
//!
//! Pagination is a [`PageCursor`] the executor owns: it asks for one page at
//! a time, persists the returned cursor, and can resume from it after a
//! restart.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::ben_soliman::{BenSolimanAdapter, BenSolimanLogin};
use crate::adapters::paged_rest::{PagedRestAdapter, PagedRestLogin};
use crate::adapters::zahcode::{ZahcodeAdapter, ZahcodeLogin};
use crate::adapters::SourceContext;
use crate::client::RateLimitedClient;
use crate::config::{AdapterKind, Config, SourceConfig};
use crate::error::ScrapeError;
use crate::models::{CanonicalProduct, Category, Offer};
use crate::tokens::{Authenticator, TokenManager, TokenPolicy};

/// Position in a category's product listing.
///
/// `page` is always meaningful; `token` is set when the upstream hands out
/// opaque continuation tokens instead of page numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub page: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl PageCursor {
    pub fn first() -> Self {
        Self {
            page: 1,
            token: None,
        }
    }

    pub fn numbered(page: u32) -> Self {
        Self { page, token: None }
    }

    pub fn with_token(page: u32, token: impl Into<String>) -> Self {
        Self {
            page,
            token: Some(token.into()),
        }
    }

    pub fn next_page(&self) -> Self {
        Self::numbered(self.page.saturating_add(1))
    }

    pub fn is_numeric(&self) -> bool {
        self.token.is_none()
    }

    /// Where to continue after this page failed for good. Opaque cursors
    /// cannot be skipped past, so the rest of the category is abandoned.
    pub fn skip_failed(&self) -> Option<Self> {
        self.is_numeric().then(|| self.next_page())
    }
}

/// One page of results plus where the next one starts (`None` = done).
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageCursor>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

#[async_trait]
pub trait ScraperAdapter: Send + Sync {
    fn source(&self) -> &str;

    fn kind(&self) -> AdapterKind;

    async fn authenticate(&self) -> Result<(), ScrapeError>;

    async fn list_categories(&self) -> Result<Vec<Category>, ScrapeError>;

    async fn list_products(
        &self,
        category: &Category,
        cursor: &PageCursor,
    ) -> Result<Page<CanonicalProduct>, ScrapeError>;

    async fn list_offers(&self) -> Result<Vec<Offer>, ScrapeError>;
}

pub type AdapterSet = BTreeMap<String, Arc<dyn ScraperAdapter>>;

/// Build one adapter per enabled source and register its login with the
/// token manager. Sources whose credentials are missing from the
/// environment are skipped with a warning.
pub async fn build_adapters(
    config: &Config,
    client: Arc<RateLimitedClient>,
    tokens: Arc<TokenManager>,
) -> Result<AdapterSet> {
    let mut adapters = AdapterSet::new();
    for (name, source) in config.enabled_sources() {
        let credential = match source.credential(name) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(source = %name, error = %e, "skipping source without credentials");
                continue;
            }
        };
        let (adapter, authenticator) = build_one(name, source, client.clone(), tokens.clone());
        let policy = TokenPolicy {
            default_lifetime: source.token_lifetime(),
            refresh_lead: Duration::from_secs(config.tokens.refresh_lead_secs),
        };
        tokens.register(credential, policy, authenticator).await;
        adapters.insert(name.clone(), adapter);
    }
    Ok(adapters)
}

fn build_one(
    name: &str,
    source: &SourceConfig,
    client: Arc<RateLimitedClient>,
    tokens: Arc<TokenManager>,
) -> (Arc<dyn ScraperAdapter>, Arc<dyn Authenticator>) {
    let ctx = SourceContext::new(name, client.clone(), tokens);
    match source.adapter {
        AdapterKind::Zahcode => (
            Arc::new(ZahcodeAdapter::new(ctx, source.products_method)),
            Arc::new(ZahcodeLogin::new(name, client)),
        ),
        AdapterKind::BenSoliman => {
            let domain = source
                .domain_id
                .clone()
                .unwrap_or_else(|| crate::adapters::ben_soliman::DEFAULT_DOMAIN_ID.to_string());
            (
                Arc::new(BenSolimanAdapter::new(ctx, domain)),
                Arc::new(BenSolimanLogin::new(name, client)),
            )
        }
        AdapterKind::PagedRest => (
            Arc::new(PagedRestAdapter::new(ctx, source.page_size)),
            Arc::new(PagedRestLogin::new(name, client)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_cursor_skips_to_next_page() {
        let cursor = PageCursor::numbered(4);
        assert_eq!(cursor.skip_failed(), Some(PageCursor::numbered(5)));
    }

    #[test]
    fn test_opaque_cursor_cannot_skip() {
        let cursor = PageCursor::with_token(2, "eyJvZmZzZXQiOjUwfQ");
        assert!(!cursor.is_numeric());
        assert_eq!(cursor.skip_failed(), None);
    }

    #[test]
    fn test_cursor_serializes_compactly() {
        let json = serde_json::to_string(&PageCursor::first()).unwrap();
        assert_eq!(json, r#"{"page":1}"#);
        let back: PageCursor = serde_json::from_str(r#"{"page":3,"token":"abc"}"#).unwrap();
        assert_eq!(back, PageCursor::with_token(3, "abc"));
    }
}
