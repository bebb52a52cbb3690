//! Conventional `api/v1` REST backend with `data[]` envelopes.
//!
//! Products are paged. The end of a listing is detected from whichever
//! signal the response carries, checked in this order:
//!
//! 1. `next_cursor` (opaque continuation token),
//! 2. `has_more`,
//! 3. `meta.current_page` / `meta.last_page` or top-level `last_page` /
//!    `total_pages`,
//! 4. otherwise a short page ends the listing.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{
    array_field, extract_token, field_i64, field_price, field_str, first_str, require_str,
    SourceContext,
};
use crate::adapter::{Page, PageCursor, ScraperAdapter};
use crate::client::{ApiRequest, RateLimitedClient};
use crate::config::AdapterKind;
use crate::error::ScrapeError;
use crate::models::{CanonicalProduct, Category, Credential, Offer, Session, UnitVariant};
use crate::tokens::Authenticator;

const LOGIN: &str = "/api/v1/auth/login";
const CATEGORIES: &str = "/api/v1/categories";
const PRODUCTS: &str = "/api/v1/products";
const OFFERS: &str = "/api/v1/offers";

pub struct PagedRestLogin {
    source: String,
    client: Arc<RateLimitedClient>,
}

impl PagedRestLogin {
    pub fn new(source: &str, client: Arc<RateLimitedClient>) -> Self {
        Self {
            source: source.to_string(),
            client,
        }
    }
}

#[async_trait]
impl Authenticator for PagedRestLogin {
    async fn login(&self, credential: &Credential) -> Result<Session, ScrapeError> {
        let device_id = self.client.fingerprint(&self.source)?.device_id().to_string();
        let request = ApiRequest::post(LOGIN)
            .json(serde_json::json!({
                "phone": credential.identifier,
                "password": credential.secret,
                "device_id": device_id,
            }))
            .without_jitter();
        let body = self.client.send(&self.source, request).await?.body;
        let token = extract_token(&body, &["access_token", "token"])
            .ok_or_else(|| ScrapeError::missing_field("access_token", "login response"))?;
        let session = Session::new(token, Utc::now());
        let expires_in = field_i64(&body, "expires_in")
            .or_else(|| body.get("data").and_then(|d| field_i64(d, "expires_in")));
        Ok(match expires_in {
            Some(secs) if secs > 0 => session.expiring_in(Duration::from_secs(secs as u64)),
            _ => session,
        })
    }
}

pub struct PagedRestAdapter {
    ctx: SourceContext,
    page_size: u32,
}

impl PagedRestAdapter {
    pub fn new(ctx: SourceContext, page_size: u32) -> Self {
        Self { ctx, page_size }
    }

    fn parse_product(&self, raw: &Value) -> Result<CanonicalProduct, ScrapeError> {
        let id = require_str(raw, "id", "product")?;

        let variants = match raw.get("units").and_then(Value::as_array) {
            Some(units) => units
                .iter()
                .map(parse_variant)
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![parse_variant(raw)?],
        };

        let offer_ids = raw
            .get("offer_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(CanonicalProduct {
            source: self.ctx.source.clone(),
            source_product_id: id,
            name: first_str(raw, &["name", "name_ar", "name_en"]).unwrap_or_default(),
            barcode: first_str(raw, &["barcode", "upc"]),
            category_id: field_str(raw, "category_id"),
            variants,
            offer_ids,
        })
    }
}

fn parse_variant(raw: &Value) -> Result<UnitVariant, ScrapeError> {
    let price = field_price(raw, "price")
        .ok_or_else(|| ScrapeError::missing_field("price", "product unit"))?;
    let quantity = field_i64(raw, "quantity").or_else(|| field_i64(raw, "stock"));
    let available = match raw.get("available").or_else(|| raw.get("in_stock")) {
        Some(Value::Bool(b)) => *b,
        Some(other) => other.as_i64().map_or(false, |n| n > 0),
        None => quantity.map_or(true, |q| q > 0),
    };
    Ok(UnitVariant {
        unit: super::normalize_unit(&field_str(raw, "unit").unwrap_or_default()),
        price,
        original_price: field_price(raw, "original_price").filter(|p| *p != price),
        quantity,
        available,
    })
}

/// Cursor for the page after `cursor`, or `None` when the listing ended.
fn next_cursor(body: &Value, cursor: &PageCursor, received: usize, page_size: u32) -> Option<PageCursor> {
    if let Some(token) = field_str(body, "next_cursor") {
        return Some(PageCursor::with_token(cursor.page.saturating_add(1), token));
    }
    if body.get("next_cursor").is_some() {
        return None;
    }
    if let Some(more) = body.get("has_more").and_then(Value::as_bool) {
        return more.then(|| cursor.next_page());
    }
    let meta = body.get("meta").unwrap_or(body);
    let last = field_i64(meta, "last_page").or_else(|| field_i64(meta, "total_pages"));
    if let Some(last) = last {
        let current = field_i64(meta, "current_page").unwrap_or(i64::from(cursor.page));
        return (current < last).then(|| cursor.next_page());
    }
    (received >= page_size as usize && received > 0).then(|| cursor.next_page())
}

#[async_trait]
impl ScraperAdapter for PagedRestAdapter {
    fn source(&self) -> &str {
        &self.ctx.source
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::PagedRest
    }

    async fn authenticate(&self) -> Result<(), ScrapeError> {
        self.ctx.authenticate().await
    }

    async fn list_categories(&self) -> Result<Vec<Category>, ScrapeError> {
        let body = self.ctx.call(ApiRequest::get(CATEGORIES)).await?;
        array_field(&body, "data", "category list")?
            .iter()
            .map(|raw| {
                Ok(Category {
                    source: self.ctx.source.clone(),
                    source_category_id: require_str(raw, "id", "category")?,
                    name: first_str(raw, &["name", "name_ar", "name_en"]).unwrap_or_default(),
                    parent_id: field_str(raw, "parent_id"),
                })
            })
            .collect()
    }

    async fn list_products(
        &self,
        category: &Category,
        cursor: &PageCursor,
    ) -> Result<Page<CanonicalProduct>, ScrapeError> {
        let mut request = ApiRequest::get(PRODUCTS)
            .query("category_id", &category.source_category_id)
            .query("per_page", self.page_size);
        request = match &cursor.token {
            Some(token) => request.query("cursor", token),
            None => request.query("page", cursor.page),
        };
        let body = self.ctx.call(request).await?;
        let raw_items = array_field(&body, "data", "product list")?;
        let items = raw_items
            .iter()
            .map(|raw| self.parse_product(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let next = next_cursor(&body, cursor, raw_items.len(), self.page_size);
        Ok(Page { items, next })
    }

    async fn list_offers(&self) -> Result<Vec<Offer>, ScrapeError> {
        let body = self.ctx.call(ApiRequest::get(OFFERS)).await?;
        array_field(&body, "data", "offer list")?
            .iter()
            .map(|raw| {
                let product_ids = raw
                    .get("product_ids")
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|v| match v {
                                Value::String(s) => Some(s.clone()),
                                Value::Number(n) => Some(n.to_string()),
                                _ => None,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Offer {
                    source: self.ctx.source.clone(),
                    source_offer_id: require_str(raw, "id", "offer")?,
                    title: first_str(raw, &["title", "name"]).unwrap_or_default(),
                    product_ids,
                    price: field_price(raw, "price"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_cursor_prefers_opaque_token() {
        let body = json!({"data": [], "next_cursor": "abc", "has_more": false});
        assert_eq!(
            next_cursor(&body, &PageCursor::first(), 0, 50),
            Some(PageCursor::with_token(2, "abc"))
        );
        let end = json!({"data": [], "next_cursor": null});
        assert_eq!(next_cursor(&end, &PageCursor::with_token(3, "x"), 0, 50), None);
    }

    #[test]
    fn test_next_cursor_from_has_more_and_meta() {
        let more = json!({"has_more": true});
        assert_eq!(next_cursor(&more, &PageCursor::first(), 50, 50), Some(PageCursor::numbered(2)));

        let meta = json!({"meta": {"current_page": 3, "last_page": 3}});
        assert_eq!(next_cursor(&meta, &PageCursor::numbered(3), 10, 50), None);

        let top = json!({"last_page": 5});
        assert_eq!(next_cursor(&top, &PageCursor::numbered(2), 50, 50), Some(PageCursor::numbered(3)));
    }

    #[test]
    fn test_next_cursor_short_page_ends() {
        let body = json!({"data": []});
        assert_eq!(next_cursor(&body, &PageCursor::first(), 12, 50), None);
        assert_eq!(next_cursor(&body, &PageCursor::first(), 50, 50), Some(PageCursor::numbered(2)));
    }

    #[test]
    fn test_parse_variant_defaults() {
        let v = parse_variant(&json!({"unit": "كرتونة", "price": "120.5", "stock": 0})).unwrap();
        assert_eq!(v.unit, "carton");
        assert_eq!(v.price, 12050);
        assert!(!v.available);

        let missing = parse_variant(&json!({"unit": "piece"})).unwrap_err();
        assert!(matches!(missing, ScrapeError::UpstreamSchemaChanged(_)));
    }
}
