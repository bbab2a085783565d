//! 詳細ページ（JSON-LD）
//!
//! ページ内の `application/ld+json` ブロックを浅くマージして読む。

use super::{SourceContext, SourceStrategy};
use crate::error::{ListingAiError, Result};
use crate::fetcher::{FetchOptions, Method};
use async_trait::async_trait;
use lazy_static::lazy_static;
use listing_ai_common::{is_unset, ListingRecord, PartialRecord};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

const CACHE_NAMESPACE: &str = "page";

lazy_static! {
    static ref JSON_LD_BLOCK: Regex = Regex::new(
        r#"(?is)<script[^>]*type\s*=\s*["']application/ld\+json["'][^>]*>(.*?)</script>"#
    )
    .unwrap();
}

/// JSON-LD ブロックを浅くマージ（後のブロックが上書き）
pub fn parse_json_ld(html: &str) -> Map<String, Value> {
    let mut merged = Map::new();
    for capture in JSON_LD_BLOCK.captures_iter(html) {
        let text = capture.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(obj)) => merged.extend(obj),
            Ok(Value::Array(items)) => {
                for item in items {
                    if let Value::Object(obj) = item {
                        merged.extend(obj);
                    }
                }
            }
            _ => continue,
        }
    }
    merged
}

/// JSON-LD から掲載フィールドを取り出す
pub fn extract_listing_fields(json_ld: &Map<String, Value>) -> PartialRecord {
    let mut out = PartialRecord::new();
    let mut put = |key: &str, value: Option<&Value>| {
        if let Some(value) = value.filter(|v| !is_unset(v)) {
            out.entry(key.to_string()).or_insert_with(|| value.clone());
        }
    };

    let geo = json_ld.get("geo");
    put("latitude", geo.and_then(|g| g.get("latitude")));
    put("longitude", geo.and_then(|g| g.get("longitude")));
    put("floor", json_ld.get("floorLevel"));
    put("date_created", json_ld.get("dateCreated"));
    put("description", json_ld.get("description"));

    let address = json_ld.get("address");
    put("street_name", address.and_then(|a| a.get("streetAddress")));
    put("city_name", address.and_then(|a| a.get("addressLocality")));

    if let Some(Value::Array(props)) = json_ld.get("additionalProperty") {
        for prop in props {
            let name = prop
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase();
            if name.starts_with("floor") {
                put("floor", prop.get("value"));
            }
            if name.starts_with("year") || name.contains("rok") {
                put("year_built", prop.get("value"));
            }
        }
    }

    out
}

pub struct RenderedPageSource {
    context: Arc<SourceContext>,
}

impl RenderedPageSource {
    pub fn new(context: Arc<SourceContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl SourceStrategy for RenderedPageSource {
    fn name(&self) -> &str {
        "rendered_page"
    }

    async fn fetch(&self, listing_id: &str, known: &ListingRecord) -> Result<PartialRecord> {
        let url = self.context.detail_url(listing_id, known);
        let ttl = Duration::from_secs(self.context.cache_config.page_ttl_secs);
        let result = self
            .context
            .cache
            .get_or_fetch(
                &self.context.fetcher,
                CACHE_NAMESPACE,
                Method::Get,
                &url,
                FetchOptions::default(),
                Some(ttl),
            )
            .await
            .map_err(|e| ListingAiError::source_failed(self.name(), e))?;
        if !result.is_success() {
            return Err(ListingAiError::source_failed(
                self.name(),
                format!("ステータス {}", result.status),
            ));
        }

        let fields = extract_listing_fields(&parse_json_ld(&result.text()));
        if fields.is_empty() {
            return Err(ListingAiError::source_failed(self.name(), "JSON-LD がありません"));
        }
        Ok(fields)
    }
}
