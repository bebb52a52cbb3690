//! `customer_app/api/v2` backend.
//!
//! Every listing is scoped to a delivery domain (`domain_id`). Items carry
//! a barcode and a single sell unit taken from `u_codes[0].U_Name`. Tokens
//! are effectively permanent, so the source is normally configured without
//! a token lifetime.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

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

pub const DEFAULT_DOMAIN_ID: &str = "2";

const LOGIN: &str = "/customer_app/api/v2/login";
const CATEGORIES: &str = "/customer_app/api/v2/categories";
const ITEMS: &str = "/customer_app/api/v2/items";
const OFFERS: &str = "/customer_app/api/v2/offers";

pub struct BenSolimanLogin {
    source: String,
    client: Arc<RateLimitedClient>,
}

impl BenSolimanLogin {
    pub fn new(source: &str, client: Arc<RateLimitedClient>) -> Self {
        Self {
            source: source.to_string(),
            client,
        }
    }
}

#[async_trait]
impl Authenticator for BenSolimanLogin {
    async fn login(&self, credential: &Credential) -> Result<Session, ScrapeError> {
        let request = ApiRequest::post(LOGIN)
            .query("is_reset_password", "false")
            .json(serde_json::json!({
                "Mob": credential.identifier,
                "Password": credential.secret,
            }))
            .without_jitter();
        let body = self.client.send(&self.source, request).await?.body;
        let token = extract_token(&body, &["token", "access_token"])
            .ok_or_else(|| ScrapeError::missing_field("token", "login response"))?;
        Ok(Session::new(token, Utc::now()))
    }
}

pub struct BenSolimanAdapter {
    ctx: SourceContext,
    domain_id: String,
}

impl BenSolimanAdapter {
    pub fn new(ctx: SourceContext, domain_id: String) -> Self {
        Self { ctx, domain_id }
    }

    fn parse_item(&self, raw: &Value, category: &Category) -> Result<CanonicalProduct, ScrapeError> {
        let id = require_str(raw, "ItemCode", "item")?;
        let item_price = field_price(raw, "ItemPrice");
        let price = field_price(raw, "SellPrice")
            .filter(|p| *p > 0)
            .or(item_price)
            .ok_or_else(|| ScrapeError::missing_field("SellPrice", "item"))?;
        let balance = field_i64(raw, "Balance");
        let unit = raw
            .get("u_codes")
            .and_then(Value::as_array)
            .and_then(|codes| codes.first())
            .and_then(|c| field_str(c, "U_Name"))
            .unwrap_or_default();

        let offer_ids = raw
            .get("Offers")
            .and_then(Value::as_array)
            .map(|offers| {
                offers
                    .iter()
                    .filter_map(|o| match o {
                        Value::Object(_) => first_str(o, &["OfferId", "Id", "id"]),
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
            name: field_str(raw, "Name").unwrap_or_default(),
            barcode: field_str(raw, "BarCode"),
            category_id: field_str(raw, "CategoryCode")
                .or_else(|| Some(category.source_category_id.clone())),
            variants: vec![UnitVariant {
                unit: super::normalize_unit(&unit),
                price,
                original_price: item_price.filter(|p| *p != price),
                quantity: balance,
                available: balance.unwrap_or(0) > 0,
            }],
            offer_ids,
        })
    }
}

#[async_trait]
impl ScraperAdapter for BenSolimanAdapter {
    fn source(&self) -> &str {
        &self.ctx.source
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::BenSoliman
    }

    async fn authenticate(&self) -> Result<(), ScrapeError> {
        self.ctx.authenticate().await
    }

    async fn list_categories(&self) -> Result<Vec<Category>, ScrapeError> {
        let request = ApiRequest::get(CATEGORIES).query("domain_id", &self.domain_id);
        let body = self.ctx.call(request).await?;
        array_field(&body, "categories", "category list")?
            .iter()
            .map(|raw| {
                Ok(Category {
                    source: self.ctx.source.clone(),
                    source_category_id: require_str(raw, "category_Id", "category")?,
                    name: field_str(raw, "Name").unwrap_or_default(),
                    parent_id: None,
                })
            })
            .collect()
    }

    async fn list_products(
        &self,
        category: &Category,
        cursor: &PageCursor,
    ) -> Result<Page<CanonicalProduct>, ScrapeError> {
        let request = ApiRequest::get(ITEMS)
            .query("domain_id", &self.domain_id)
            .query("category_id", &category.source_category_id)
            .query("page", cursor.page);
        let body = self.ctx.call(request).await?;
        let items = array_field(&body, "data", "item list")?
            .iter()
            .map(|raw| self.parse_item(raw, category))
            .collect::<Result<Vec<_>, _>>()?;
        let next = (!items.is_empty()).then(|| cursor.next_page());
        Ok(Page { items, next })
    }

    async fn list_offers(&self) -> Result<Vec<Offer>, ScrapeError> {
        let request = ApiRequest::get(OFFERS).query("domain_id", &self.domain_id);
        let body = self.ctx.call(request).await?;
        let list = match &body {
            Value::Array(items) => items,
            other => other
                .get("data")
                .or_else(|| other.get("Offers"))
                .and_then(Value::as_array)
                .ok_or_else(|| ScrapeError::missing_field("data", "offer list"))?,
        };
        list.iter()
            .map(|raw| {
                let id = first_str(raw, &["OfferId", "Id", "id"])
                    .ok_or_else(|| ScrapeError::missing_field("OfferId", "offer"))?;
                Ok(Offer {
                    source: self.ctx.source.clone(),
                    source_offer_id: id,
                    title: first_str(raw, &["Name", "Title", "name"]).unwrap_or_default(),
                    product_ids: field_str(raw, "ItemCode").into_iter().collect(),
                    price: field_price(raw, "Price").or_else(|| field_price(raw, "SellPrice")),
                })
            })
            .collect()
    }
}
