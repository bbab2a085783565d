//! 掲載写真の解析パイプライン
//!
//! 取得・整形 → 解析 → 同室判定 → 集約 → 特徴量 → 紹介文

use crate::duplicates::{DuplicateRoomResolver, ResolutionStats};
use crate::fetcher::RateLimitedFetcher;
use crate::vision::{download_photos, Photo, VisionAnalysisClient};
use listing_ai_common::{
    build_summary_prompt, AggregatedMetrics, FeatureAggregator, FeatureVector, ListingComposites,
    PhotoAnalysisRecord, PropertySummary,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// 1掲載分の解析結果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingAnalysis {
    pub listing_id: String,
    pub records: Vec<PhotoAnalysisRecord>,
    /// 取得・整形に失敗した写真URL
    #[serde(default)]
    pub failed_images: Vec<String>,
    pub composites: ListingComposites,
    pub metrics: AggregatedMetrics,
    pub summary: PropertySummary,
    pub features: FeatureVector,
}

impl ListingAnalysis {
    /// 同室判定済みのレコードから集約
    pub fn from_records(
        listing_id: impl Into<String>,
        records: Vec<PhotoAnalysisRecord>,
        failed_images: Vec<String>,
        aggregator: &FeatureAggregator,
    ) -> Self {
        let total_images = records.len() + failed_images.len();
        let composites = ListingComposites::compute(&records, total_images);
        let metrics = aggregator.aggregate(&records);
        let summary = PropertySummary::from_records(&records);
        let features = FeatureVector::build(&metrics, &composites, &summary);

        Self {
            listing_id: listing_id.into(),
            records,
            failed_images,
            composites,
            metrics,
            summary,
            features,
        }
    }

    /// 保存済みの解析結果から集約をやり直す（紹介文は引き継ぐ）
    pub fn recompute(self, aggregator: &FeatureAggregator) -> Self {
        let summary_text = self.summary.summary_text;
        let mut analysis = Self::from_records(self.listing_id, self.records, self.failed_images, aggregator);
        if !summary_text.is_empty() {
            analysis.summary.summary_text = summary_text;
        }
        analysis
    }
}

pub struct PhotoPipeline {
    fetcher: Arc<RateLimitedFetcher>,
    vision: Arc<VisionAnalysisClient>,
    resolver: DuplicateRoomResolver,
    aggregator: FeatureAggregator,
}

impl PhotoPipeline {
    /// 設定に応じて比較問い合わせの有無を決める
    pub fn new(fetcher: Arc<RateLimitedFetcher>, vision: Arc<VisionAnalysisClient>) -> Self {
        let config = vision.config();
        let resolver = if config.duplicate_detection {
            DuplicateRoomResolver::with_comparator(vision.clone(), config.comparison_concurrency)
        } else {
            DuplicateRoomResolver::reported_only()
        };
        Self {
            fetcher,
            vision,
            resolver,
            aggregator: FeatureAggregator::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: DuplicateRoomResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// 写真URLから解析
    pub async fn analyze_listing(&self, listing_id: &str, urls: &[String]) -> ListingAnalysis {
        let config = self.vision.config();
        let downloaded =
            download_photos(&self.fetcher, urls, config.max_image_edge, config.jpeg_quality).await;
        info!(
            listing_id = %listing_id,
            downloaded = downloaded.photos.len(),
            failed = downloaded.failed.len(),
            "写真を取得"
        );
        self.analyze_photos(listing_id, downloaded.photos, downloaded.failed)
            .await
            .0
    }

    /// 整形済みの写真から解析
    pub async fn analyze_photos(
        &self,
        listing_id: &str,
        photos: Vec<Photo>,
        failed_images: Vec<String>,
    ) -> (ListingAnalysis, ResolutionStats) {
        let mut records = self.vision.classify(&photos).await;
        let stats = self.resolver.resolve(&mut records, &photos).await;
        let mut analysis = ListingAnalysis::from_records(listing_id, records, failed_images, &self.aggregator);
        if self.vision.config().text_summary && !analysis.records.is_empty() {
            if let Some(text) = self.describe(&analysis.summary).await {
                analysis.summary.summary_text = text;
            }
        }
        info!(
            listing_id = %listing_id,
            unique_rooms = analysis.composites.unique_rooms_detected,
            duplicates = analysis.composites.duplicate_images_found,
            "写真解析完了"
        );
        (analysis, stats)
    }

    /// モデルによる紹介文（失敗時は None で定型文のまま）
    async fn describe(&self, summary: &PropertySummary) -> Option<String> {
        let mut data = serde_json::to_value(summary).ok()?;
        if let Some(obj) = data.as_object_mut() {
            obj.remove("summary_text");
        }
        let prompt = build_summary_prompt(&serde_json::to_string_pretty(&data).ok()?);
        let text = self.vision.generate_text(&prompt).await;
        if text.is_none() {
            debug!("紹介文を生成できなかったため定型文を使います");
        }
        text
    }
}
