//! Concrete upstream adapters and the JSON helpers they share.
//!
//! | Adapter | API family | Login | Paging |
//! |---------|------------|-------|--------|
//! | [`zahcode`] | Laravel apps sharing one backend | form `mobile`/`password`, short-lived JWT | one page per category |
//! | [`ben_soliman`] | `customer_app/api/v2` | JSON `Mob`/`Password`, long-lived token | page numbers until an empty page |
//! | [`paged_rest`] | conventional `api/v1` REST | JSON `phone`/`password`/`device_id` with `expires_in` | `has_more`, `last_page`, or opaque `next_cursor` |
//!
//! Field access goes through the helpers below: a missing required field
//! becomes [`ScrapeError::UpstreamSchemaChanged`], optional fields fall
//! back to `None`.

pub mod ben_soliman;
pub mod paged_rest;
pub mod zahcode;

use serde_json::Value;
use std::sync::Arc;

use crate::client::{ApiRequest, RateLimitedClient};
use crate::error::ScrapeError;
use crate::tokens::TokenManager;

/// Everything an adapter needs to make authenticated calls for one source.
pub struct SourceContext {
    pub source: String,
    pub client: Arc<RateLimitedClient>,
    pub tokens: Arc<TokenManager>,
}

impl SourceContext {
    pub fn new(source: &str, client: Arc<RateLimitedClient>, tokens: Arc<TokenManager>) -> Self {
        Self {
            source: source.to_string(),
            client,
            tokens,
        }
    }

    /// Send `request` with the source's bearer token. A 401/403 on a token
    /// we believed valid drops the session and retries once with a fresh
    /// login; a second rejection is returned as `AuthFailed`.
    pub async fn call(&self, request: ApiRequest) -> Result<Value, ScrapeError> {
        let token = self.tokens.token_for(&self.source).await?;
        match self.client.send(&self.source, request.clone().bearer(token)).await {
            Ok(response) => Ok(response.body),
            Err(ScrapeError::AuthFailed(reason)) => {
                tracing::info!(source = %self.source, %reason, "token rejected, logging in again");
                self.tokens.invalidate(&self.source).await;
                let token = self.tokens.token_for(&self.source).await?;
                let response = self.client.send(&self.source, request.bearer(token)).await?;
                Ok(response.body)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn authenticate(&self) -> Result<(), ScrapeError> {
        self.tokens.token_for(&self.source).await.map(|_| ())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// JSON field helpers
// ═══════════════════════════════════════════════════════════════════════

/// String or number field rendered as a string. Blank strings are `None`.
pub fn field_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn require_str(value: &Value, key: &str, context: &str) -> Result<String, ScrapeError> {
    field_str(value, key).ok_or_else(|| ScrapeError::missing_field(key, context))
}

/// First present key among `keys`.
pub fn first_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| field_str(value, k))
}

/// Integer field given as a number or numeric string.
pub fn field_i64(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.trunc() as i64),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Decimal price (number or string) converted to minor units.
pub fn parse_price(value: &Value) -> Option<i64> {
    let major = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok()?,
        _ => return None,
    };
    if !major.is_finite() || major < 0.0 {
        return None;
    }
    Some((major * 100.0).round() as i64)
}

pub fn field_price(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(parse_price)
}

pub fn as_array<'a>(value: &'a Value, context: &str) -> Result<&'a Vec<Value>, ScrapeError> {
    value.as_array().ok_or_else(|| {
        ScrapeError::UpstreamSchemaChanged(format!("expected a JSON array in {context}"))
    })
}

/// The array under `key`, failing when it is absent or not an array.
pub fn array_field<'a>(
    value: &'a Value,
    key: &str,
    context: &str,
) -> Result<&'a Vec<Value>, ScrapeError> {
    value
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| ScrapeError::missing_field(key, context))
}

/// Canonical unit name. Known Arabic and English aliases map to a fixed
/// vocabulary; anything else is kept verbatim in lowercase.
pub fn normalize_unit(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "piece".to_string();
    }
    let lower = trimmed.to_lowercase();
    let canonical = match lower.as_str() {
        "قطعة" | "قطعه" | "وحدة" | "piece" | "pieces" | "pcs" | "pc" | "unit" => "piece",
        "علبة" | "علبه" | "box" => "box",
        "باكت" | "عبوة" | "عبوه" | "pack" | "packet" => "pack",
        "كرتونة" | "كرتونه" | "كرتون" | "دستة" | "carton" | "ctn" => "carton",
        "كيلو" | "kg" | "kilo" => "kg",
        "جرام" | "gram" | "g" => "gram",
        "لتر" | "liter" | "litre" | "l" => "liter",
        "مل" | "ml" => "ml",
        _ => return lower,
    };
    canonical.to_string()
}

/// Access token from a login response, looked up under `keys` and then
/// under `data`.
pub fn extract_token(body: &Value, keys: &[&str]) -> Option<String> {
    first_str(body, keys).or_else(|| body.get("data").and_then(|d| first_str(d, keys)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_unit_aliases() {
        assert_eq!(normalize_unit("قطعة"), "piece");
        assert_eq!(normalize_unit("كرتونة"), "carton");
        assert_eq!(normalize_unit(" PCS "), "piece");
        assert_eq!(normalize_unit("باكت"), "pack");
        assert_eq!(normalize_unit("Litre"), "liter");
        assert_eq!(normalize_unit(""), "piece");
    }

    #[test]
    fn test_unknown_unit_kept_verbatim() {
        assert_eq!(normalize_unit("Shrink 6x"), "shrink 6x");
    }

    #[test]
    fn test_parse_price_forms() {
        assert_eq!(parse_price(&json!(45)), Some(4500));
        assert_eq!(parse_price(&json!(45.5)), Some(4550));
        assert_eq!(parse_price(&json!("1,250.75")), Some(125075));
        assert_eq!(parse_price(&json!(null)), None);
        assert_eq!(parse_price(&json!("n/a")), None);
        assert_eq!(parse_price(&json!(-3)), None);
    }

    #[test]
    fn test_field_helpers() {
        let v = json!({"id": 12, "name": " Rice ", "blank": "  ", "stock": "7"});
        assert_eq!(field_str(&v, "id").as_deref(), Some("12"));
        assert_eq!(field_str(&v, "name").as_deref(), Some("Rice"));
        assert_eq!(field_str(&v, "blank"), None);
        assert_eq!(field_i64(&v, "stock"), Some(7));
        let err = require_str(&v, "barcode", "product").unwrap_err();
        assert!(matches!(err, ScrapeError::UpstreamSchemaChanged(_)));
    }

    #[test]
    fn test_extract_token_nested() {
        assert_eq!(
            extract_token(&json!({"data": {"token": "t1"}}), &["token", "access_token"]).as_deref(),
            Some("t1")
        );
        assert_eq!(
            extract_token(&json!({"access_token": "t2"}), &["token", "access_token"]).as_deref(),
            Some("t2")
        );
        assert_eq!(extract_token(&json!({"message": "ok"}), &["token"]), None);
    }
}
