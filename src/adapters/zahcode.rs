//! Laravel-style API shared by several wholesale apps.
//!
//! Responses are bare JSON arrays. Each product carries its unit variants
//! under `variants[]` with a list `price` and an optional
//! `discounted_price`; stock is per product. There is no barcode, so these
//! products are stored and priced but never auto-linked.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{array_field, as_array, field_i64, field_price, field_str, require_str, SourceContext};
use crate::adapter::{Page, PageCursor, ScraperAdapter};
use crate::client::{ApiRequest, HttpMethod, RateLimitedClient};
use crate::config::AdapterKind;
use crate::error::ScrapeError;
use crate::models::{CanonicalProduct, Category, Credential, Offer, Session, UnitVariant};
use crate::tokens::Authenticator;

const LOGIN: &str = "auth/login";
const CATEGORIES: &str = "category/all";
const PRODUCTS_BY_CATEGORY: &str = "products/category_id";
const OFFERS: &str = "products/offers";

pub struct ZahcodeLogin {
    source: String,
    client: Arc<RateLimitedClient>,
}

impl ZahcodeLogin {
    pub fn new(source: &str, client: Arc<RateLimitedClient>) -> Self {
        Self {
            source: source.to_string(),
            client,
        }
    }
}

#[async_trait]
impl Authenticator for ZahcodeLogin {
    async fn login(&self, credential: &Credential) -> Result<Session, ScrapeError> {
        let request = ApiRequest::post(LOGIN)
            .form(&[
                ("mobile", credential.identifier.as_str()),
                ("password", credential.secret.as_str()),
            ])
            .without_jitter();
        let body = self.client.send(&self.source, request).await?.body;
        let token = field_str(&body, "access_token")
            .ok_or_else(|| ScrapeError::missing_field("access_token", "login response"))?;
        let session = Session::new(token, Utc::now());
        Ok(match field_i64(&body, "expires_in") {
            Some(secs) if secs > 0 => session.expiring_in(Duration::from_secs(secs as u64)),
            _ => session,
        })
    }
}

pub struct ZahcodeAdapter {
    ctx: SourceContext,
    products_method: HttpMethod,
}

impl ZahcodeAdapter {
    pub fn new(ctx: SourceContext, products_method: HttpMethod) -> Self {
        Self {
            ctx,
            products_method,
        }
    }

    fn parse_product(&self, raw: &Value, category_id: Option<&str>) -> Result<CanonicalProduct, ScrapeError> {
        let id = require_str(raw, "id", "product")?;
        let stock = field_i64(raw, "stock");
        let available = stock.unwrap_or(0) > 0;

        let mut variants = Vec::new();
        for v in array_field(raw, "variants", "product")? {
            let list_price = field_price(v, "price")
                .ok_or_else(|| ScrapeError::missing_field("price", "product variant"))?;
            let selling = field_price(v, "discounted_price")
                .filter(|p| *p > 0)
                .unwrap_or(list_price);
            variants.push(UnitVariant {
                unit: super::normalize_unit(&field_str(v, "unit").unwrap_or_default()),
                price: selling,
                original_price: (selling != list_price).then_some(list_price),
                quantity: stock,
                available,
            });
        }

        Ok(CanonicalProduct {
            source: self.ctx.source.clone(),
            source_product_id: id,
            name: field_str(raw, "name").unwrap_or_default(),
            barcode: None,
            category_id: category_id
                .map(str::to_string)
                .or_else(|| field_str(raw, "category_id")),
            variants,
            offer_ids: Vec::new(),
        })
    }

    fn request(&self, path: &str) -> ApiRequest {
        ApiRequest::new(self.products_method, path)
    }
}

#[async_trait]
impl ScraperAdapter for ZahcodeAdapter {
    fn source(&self) -> &str {
        &self.ctx.source
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Zahcode
    }

    async fn authenticate(&self) -> Result<(), ScrapeError> {
        self.ctx.authenticate().await
    }

    async fn list_categories(&self) -> Result<Vec<Category>, ScrapeError> {
        let body = self.ctx.call(ApiRequest::get(CATEGORIES)).await?;
        as_array(&body, "category list")?
            .iter()
            .map(|raw| {
                Ok(Category {
                    source: self.ctx.source.clone(),
                    source_category_id: require_str(raw, "id", "category")?,
                    name: field_str(raw, "name").unwrap_or_default(),
                    parent_id: None,
                })
            })
            .collect()
    }

    async fn list_products(
        &self,
        category: &Category,
        _cursor: &PageCursor,
    ) -> Result<Page<CanonicalProduct>, ScrapeError> {
        let request = self
            .request(PRODUCTS_BY_CATEGORY)
            .query("category_id", &category.source_category_id);
        let body = self.ctx.call(request).await?;
        let products = as_array(&body, "product list")?
            .iter()
            .map(|raw| self.parse_product(raw, Some(&category.source_category_id)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::last(products))
    }

    async fn list_offers(&self) -> Result<Vec<Offer>, ScrapeError> {
        let body = self.ctx.call(self.request(OFFERS)).await?;
        as_array(&body, "offer list")?
            .iter()
            .map(|raw| {
                let product = self.parse_product(raw, None)?;
                Ok(Offer {
                    source: self.ctx.source.clone(),
                    source_offer_id: product.source_product_id.clone(),
                    title: product.name.clone(),
                    price: product.variants.first().map(|v| v.price),
                    product_ids: vec![product.source_product_id],
                })
            })
            .collect()
    }
}
