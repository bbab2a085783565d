//! 取得元（ソース戦略）モジュール
//!
//! 各ソースは掲載IDから部分レコードを返す。優先順はリストの並びそのもの。

pub mod feed;
pub mod graphql;
pub mod offer_api;
pub mod rendered_page;

pub use feed::FeedSource;
pub use graphql::GraphQlSource;
pub use offer_api::OfferApiSource;
pub use rendered_page::RenderedPageSource;

use crate::cache::ResponseCache;
use crate::config::{CacheConfig, SourcesConfig};
use crate::error::Result;
use crate::fetcher::RateLimitedFetcher;
use async_trait::async_trait;
use listing_ai_common::{is_unset, ListingRecord, PartialRecord};
use serde_json::{Map, Value};
use std::sync::Arc;

#[async_trait]
pub trait SourceStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// 詳細ソース（一次フィード以外）か
    fn is_detail(&self) -> bool {
        true
    }

    /// `known` はここまでに統合済みのレコード（詳細URLなどの参照用）
    async fn fetch(&self, listing_id: &str, known: &ListingRecord) -> Result<PartialRecord>;
}

/// ソース間で共有する通信手段と設定
pub struct SourceContext {
    pub fetcher: Arc<RateLimitedFetcher>,
    pub cache: ResponseCache,
    pub sources: SourcesConfig,
    pub cache_config: CacheConfig,
}

impl SourceContext {
    /// 詳細ページURL（レコードにあればそれを優先）
    pub fn detail_url(&self, listing_id: &str, known: &ListingRecord) -> String {
        known
            .get_str("detail_url")
            .map(String::from)
            .unwrap_or_else(|| fill_template(&self.sources.detail_page_url, listing_id))
    }
}

/// `{id}` を掲載IDに置換
pub fn fill_template(template: &str, listing_id: &str) -> String {
    template.replace("{id}", listing_id)
}

/// 標準の優先順: フィード → オファーAPI → GraphQL → 詳細ページ
pub fn default_strategies(
    context: Arc<SourceContext>,
    feed: Option<FeedSource>,
) -> Vec<Arc<dyn SourceStrategy>> {
    let mut strategies: Vec<Arc<dyn SourceStrategy>> = Vec::new();
    if let Some(feed) = feed {
        strategies.push(Arc::new(feed));
    }
    strategies.push(Arc::new(OfferApiSource::new(context.clone())));
    strategies.push(Arc::new(GraphQlSource::new(context.clone())));
    strategies.push(Arc::new(RenderedPageSource::new(context)));
    strategies
}

/// `parameters: [{key, value}]` を平坦化
///
/// `value` がなければ `values` の先頭を使う。
pub fn flatten_parameters(obj: &Map<String, Value>) -> PartialRecord {
    let mut out = PartialRecord::new();
    let Some(Value::Array(params)) = obj.get("parameters") else {
        return out;
    };

    for param in params.iter().filter_map(Value::as_object) {
        let Some(key) = param.get("key").and_then(Value::as_str) else {
            continue;
        };
        let value = param
            .get("value")
            .filter(|v| !is_unset(v))
            .or_else(|| {
                param
                    .get("values")
                    .and_then(Value::as_array)
                    .and_then(|values| values.first())
            });
        if let Some(value) = value.filter(|v| !is_unset(v)) {
            out.entry(key.to_string()).or_insert_with(|| value.clone());
        }
    }
    out
}

/// `location` から座標と住所を取り出す
pub fn lift_location(obj: &Map<String, Value>, out: &mut PartialRecord) {
    let Some(location) = obj.get("location").and_then(Value::as_object) else {
        return;
    };

    let pick = |keys: &[&str]| keys.iter().filter_map(|k| location.get(*k)).find(|v| !is_unset(v)).cloned();
    if let Some(lat) = pick(&["latitude", "lat"]) {
        out.insert("latitude".into(), lat);
    }
    if let Some(lon) = pick(&["longitude", "lon", "lng"]) {
        out.insert("longitude".into(), lon);
    }

    // {"address": {"city": {"name": ..}, "street": {"name": ..}}}
    if let Some(address) = location.get("address").and_then(Value::as_object) {
        let name_of = |key: &str| {
            address
                .get(key)
                .and_then(|v| v.get("name").or(Some(v)))
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(|s| Value::String(s.to_string()))
        };
        if let Some(city) = name_of("city") {
            out.insert("city_name".into(), city);
        }
        if let Some(street) = name_of("street") {
            out.insert("street_name".into(), street);
        }
    }
}

/// トップレベルのスカラー値のみ
pub fn top_level_scalars(obj: &Map<String, Value>) -> PartialRecord {
    obj.iter()
        .filter(|(_, v)| matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
