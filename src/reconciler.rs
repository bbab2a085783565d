//! 多ソース統合モジュール
//!
//! ソース戦略を優先順に畳み込み、既に値のあるフィールドは上書きしない。
//! 統合後に型正規化・欠損補完・ジオコーディングを行う。

use crate::error::{ListingAiError, Result};
use crate::geocode::Geocoder;
use crate::sources::SourceStrategy;
use listing_ai_common::{fill_missing_fields, normalize_listing_fields, FieldAliasTable, ListingRecord};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// ソースごとの結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceOutcome {
    pub source: String,
    /// 新たに埋まったフィールド数
    pub merged_fields: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub record: ListingRecord,
    pub outcomes: Vec<SourceOutcome>,
}

pub struct SourceReconciler {
    strategies: Vec<Arc<dyn SourceStrategy>>,
    aliases: FieldAliasTable,
    geocoder: Option<Arc<dyn Geocoder>>,
    detail_enabled: bool,
}

impl SourceReconciler {
    pub fn new(strategies: Vec<Arc<dyn SourceStrategy>>) -> Self {
        Self {
            strategies,
            aliases: FieldAliasTable::listing_preset(),
            geocoder: None,
            detail_enabled: true,
        }
    }

    pub fn with_aliases(mut self, aliases: FieldAliasTable) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    /// false なら詳細ソースを使わない
    pub fn with_detail_fetch(mut self, enabled: bool) -> Self {
        self.detail_enabled = enabled;
        self
    }

    /// 優先順のソース名
    pub fn source_names(&self) -> Vec<&str> {
        self.active_strategies().map(|s| s.name()).collect()
    }

    fn active_strategies(&self) -> impl Iterator<Item = &Arc<dyn SourceStrategy>> {
        self.strategies
            .iter()
            .filter(move |s| self.detail_enabled || !s.is_detail())
    }

    pub async fn reconcile(&self, listing_id: &str) -> Result<ListingRecord> {
        Ok(self.reconcile_detailed(listing_id).await?.record)
    }

    /// ソースごとの結果付きで統合
    ///
    /// 全ソースが失敗した場合のみエラー。
    pub async fn reconcile_detailed(&self, listing_id: &str) -> Result<Reconciliation> {
        let mut record = ListingRecord::new(listing_id);
        let mut outcomes = Vec::new();

        for strategy in self.active_strategies() {
            let outcome = match strategy.fetch(listing_id, &record).await {
                Ok(partial) => {
                    let translated = self.aliases.translate(&partial);
                    let merged = record.merge_missing(&translated);
                    debug!(listing_id = %listing_id, source = strategy.name(), merged, "ソースを統合");
                    SourceOutcome {
                        source: strategy.name().to_string(),
                        merged_fields: merged,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(listing_id = %listing_id, source = strategy.name(), error = %e, "ソース取得失敗");
                    SourceOutcome {
                        source: strategy.name().to_string(),
                        merged_fields: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        if !outcomes.is_empty() && outcomes.iter().all(|o| o.error.is_some()) {
            let reasons = outcomes
                .iter()
                .filter_map(|o| o.error.as_deref())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ListingAiError::AllSourcesFailed(format!("{}: {}", listing_id, reasons)));
        }

        normalize_listing_fields(&mut record);
        fill_missing_fields(&mut record);
        self.fill_coordinates(&mut record).await;

        Ok(Reconciliation { record, outcomes })
    }

    /// 座標がなく市名がある場合のみ
    async fn fill_coordinates(&self, record: &mut ListingRecord) {
        let Some(geocoder) = &self.geocoder else {
            return;
        };
        if record.is_set("latitude") && record.is_set("longitude") {
            return;
        }
        let Some(city) = record.get_str("city_name").map(String::from) else {
            return;
        };
        let street = record.get_str("street_name").map(String::from);

        if let Some((lat, lon)) = geocoder.geocode(street.as_deref(), &city).await {
            if let (Some(lat), Some(lon)) = (serde_json::Number::from_f64(lat), serde_json::Number::from_f64(lon)) {
                record.set("latitude", Value::Number(lat));
                record.set("longitude", Value::Number(lon));
            }
        }
    }
}
