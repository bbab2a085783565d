//! 一次フィード（検索結果などから取得済みの掲載一覧）

use super::SourceStrategy;
use crate::error::{ListingAiError, Result};
use async_trait::async_trait;
use listing_ai_common::{ListingRecord, PartialRecord};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct FeedSource {
    records: HashMap<String, PartialRecord>,
    /// 読み込み順のID
    order: Vec<String>,
}

impl FeedSource {
    /// `id` を持たない要素は捨てる
    pub fn new(items: impl IntoIterator<Item = PartialRecord>) -> Self {
        let mut feed = Self::default();
        for item in items {
            let id = match item.get("id") {
                Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
                Some(Value::Number(n)) => n.to_string(),
                _ => continue,
            };
            if !feed.records.contains_key(&id) {
                feed.order.push(id.clone());
            }
            feed.records.insert(id, item);
        }
        feed
    }

    /// JSON配列ファイルから読み込み
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let items: Vec<Value> = serde_json::from_str(&content)?;
        Ok(Self::new(items.into_iter().filter_map(|v| match v {
            Value::Object(obj) => Some(obj),
            _ => None,
        })))
    }

    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SourceStrategy for FeedSource {
    fn name(&self) -> &str {
        "feed"
    }

    fn is_detail(&self) -> bool {
        false
    }

    async fn fetch(&self, listing_id: &str, _known: &ListingRecord) -> Result<PartialRecord> {
        self.records
            .get(listing_id)
            .cloned()
            .ok_or_else(|| ListingAiError::source_failed(self.name(), "フィードに掲載がありません"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_feed_lookup() {
        let feed = FeedSource::new(vec![
            json!({"id": "a1", "title": "A"}).as_object().cloned().unwrap(),
            json!({"id": 42, "title": "B"}).as_object().cloned().unwrap(),
            json!({"title": "no id"}).as_object().cloned().unwrap(),
        ]);
        assert_eq!(feed.ids(), &["a1".to_string(), "42".to_string()]);

        let known = ListingRecord::new("42");
        let record = feed.fetch("42", &known).await.expect("見つかるべき");
        assert_eq!(record.get("title"), Some(&json!("B")));
        assert!(feed.fetch("missing", &known).await.is_err());
    }
}
