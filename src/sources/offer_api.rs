//! 構造化オファーAPI
//!
//! 最初の呼び出しが空なら、詳細ページを一度開いてクッキーを得てから再試行する。

use super::{fill_template, flatten_parameters, lift_location, top_level_scalars, SourceContext, SourceStrategy};
use crate::error::{ListingAiError, Result};
use crate::fetcher::{FetchOptions, Method};
use async_trait::async_trait;
use listing_ai_common::{ListingRecord, PartialRecord};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

pub struct OfferApiSource {
    context: Arc<SourceContext>,
}

impl OfferApiSource {
    pub fn new(context: Arc<SourceContext>) -> Self {
        Self { context }
    }

    /// 200 かつエラーでないオブジェクトのみ採用
    async fn attempt(&self, api_url: &str) -> Result<Option<Map<String, Value>>> {
        let options = FetchOptions::default().header("Accept", "application/json, text/plain, */*");
        let result = self
            .context
            .fetcher
            .fetch(Method::Get, api_url, options)
            .await
            .map_err(|e| ListingAiError::source_failed(self.name(), e))?;

        if result.status != 200 {
            debug!(url = %api_url, status = result.status, "オファーAPIが200以外を返しました");
            return Ok(None);
        }
        match result.json::<Value>() {
            Ok(Value::Object(obj)) if !obj.is_empty() && obj.get("error").map_or(true, Value::is_null) => {
                Ok(Some(obj))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl SourceStrategy for OfferApiSource {
    fn name(&self) -> &str {
        "offer_api"
    }

    async fn fetch(&self, listing_id: &str, known: &ListingRecord) -> Result<PartialRecord> {
        let api_url = fill_template(&self.context.sources.offer_api_url, listing_id);

        let mut data = self.attempt(&api_url).await?;
        if data.is_none() {
            let detail_url = self.context.detail_url(listing_id, known);
            debug!(listing_id = %listing_id, url = %detail_url, "クッキー取得のため詳細ページを開きます");
            // 応答内容は使わない
            let _ = self.context.fetcher.get(&detail_url).await;
            data = self.attempt(&api_url).await?;
        }

        let Some(data) = data else {
            info!(listing_id = %listing_id, "オファーAPIの応答が空です");
            return Err(ListingAiError::source_failed(self.name(), "空の応答"));
        };

        let mut out = top_level_scalars(&data);
        for (key, value) in flatten_parameters(&data) {
            out.entry(key).or_insert(value);
        }
        lift_location(&data, &mut out);
        Ok(out)
    }
}
