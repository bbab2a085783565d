//! GraphQL エンドポイント（OfferBasic クエリ）

use super::{flatten_parameters, lift_location, SourceContext, SourceStrategy};
use crate::error::{ListingAiError, Result};
use crate::fetcher::{FetchOptions, Method};
use async_trait::async_trait;
use listing_ai_common::{is_unset, ListingRecord, PartialRecord};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

pub const OFFER_QUERY: &str = "query OfferBasic($id: ID!) { offer(id: $id) { id description location { latitude longitude } parameters { key value } } }";

const CACHE_NAMESPACE: &str = "gql";

pub struct GraphQlSource {
    context: Arc<SourceContext>,
}

impl GraphQlSource {
    pub fn new(context: Arc<SourceContext>) -> Self {
        Self { context }
    }

    /// キャッシュ済みなら (応答, true)
    async fn load(&self, listing_id: &str) -> Result<(Value, bool)> {
        if let Some(cached) = self.context.cache.get(CACHE_NAMESPACE, listing_id).await {
            if let Ok(value) = serde_json::from_str(&cached) {
                return Ok((value, true));
            }
        }

        let payload = json!({
            "query": OFFER_QUERY,
            "operationName": "OfferBasic",
            "variables": {"id": listing_id},
        });
        let options = FetchOptions::default()
            .header("Accept", "application/json")
            .json_body(&payload);
        let result = self
            .context
            .fetcher
            .fetch(Method::Post, &self.context.sources.graphql_url, options)
            .await
            .map_err(|e| ListingAiError::source_failed(self.name(), e))?;
        if result.status != 200 {
            return Err(ListingAiError::source_failed(
                self.name(),
                format!("ステータス {}", result.status),
            ));
        }

        let value: Value = result
            .json()
            .map_err(|e| ListingAiError::source_failed(self.name(), e))?;
        Ok((value, false))
    }
}

/// errors のない応答から offer を取り出す
fn offer_of(response: &Value) -> std::result::Result<&Map<String, Value>, &'static str> {
    if response.get("errors").is_some_and(|e| !e.is_null()) {
        return Err("GraphQLエラー応答");
    }
    response
        .get("data")
        .and_then(|d| d.get("offer"))
        .and_then(Value::as_object)
        .filter(|o| !o.is_empty())
        .ok_or("offer がありません")
}

#[async_trait]
impl SourceStrategy for GraphQlSource {
    fn name(&self) -> &str {
        "graphql"
    }

    async fn fetch(&self, listing_id: &str, _known: &ListingRecord) -> Result<PartialRecord> {
        let (response, from_cache) = self.load(listing_id).await?;
        let offer = offer_of(&response).map_err(|reason| ListingAiError::source_failed(self.name(), reason))?;

        // 有効な応答のみ保存
        if !from_cache {
            let ttl = Duration::from_secs(self.context.cache_config.graphql_ttl_secs);
            self.context
                .cache
                .set(CACHE_NAMESPACE, listing_id, &response.to_string(), Some(ttl))
                .await;
        }

        let mut out = PartialRecord::new();
        if let Some(description) = offer.get("description").filter(|v| !is_unset(v)) {
            out.insert("description".into(), description.clone());
        }
        lift_location(offer, &mut out);
        for (key, value) in flatten_parameters(offer) {
            out.entry(key).or_insert(value);
        }
        Ok(out)
    }
}
