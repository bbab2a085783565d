//! ジオコーディング（住所 → 緯度経度）
//!
//! 結果は `geo` 名前空間にキャッシュする。失敗時は None を返し、呼び出し側は座標を未設定のまま残す。

use crate::cache::ResponseCache;
use crate::config::SourcesConfig;
use crate::fetcher::{FetchOptions, Method, RateLimitedFetcher};
use async_trait::async_trait;
use listing_ai_common::normalize_street;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CACHE_NAMESPACE: &str = "geo";

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, street: Option<&str>, city: &str) -> Option<(f64, f64)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct CachedPoint {
    lat: f64,
    lon: f64,
}

/// Nominatim 互換の検索API
pub struct NominatimGeocoder {
    fetcher: Arc<RateLimitedFetcher>,
    cache: ResponseCache,
    endpoint: String,
    country: String,
    user_agent: String,
    ttl: Duration,
}

impl NominatimGeocoder {
    pub fn new(
        fetcher: Arc<RateLimitedFetcher>,
        cache: ResponseCache,
        sources: &SourcesConfig,
        ttl: Duration,
    ) -> Self {
        Self {
            fetcher,
            cache,
            endpoint: sources.geocoder_url.clone(),
            country: sources.geocoder_country.clone(),
            user_agent: sources.geocoder_user_agent.clone(),
            ttl,
        }
    }

    /// 検索文字列（通り名が空になれば市名のみ）
    pub fn build_query(street: Option<&str>, city: &str) -> String {
        match street.map(normalize_street).filter(|s| !s.is_empty()) {
            Some(street) => format!("{}, {}", street, city),
            None => city.to_string(),
        }
    }

    async fn search(&self, query: &str) -> Option<(f64, f64)> {
        let url = url::Url::parse_with_params(
            &self.endpoint,
            &[
                ("q", query),
                ("format", "json"),
                ("limit", "1"),
                ("countrycodes", self.country.as_str()),
            ],
        )
        .ok()?;

        let options = FetchOptions::default().header("User-Agent", self.user_agent.as_str());
        let result = match self.fetcher.fetch(Method::Get, url.as_str(), options).await {
            Ok(result) if result.is_success() => result,
            Ok(result) => {
                warn!(query = %query, status = result.status, "ジオコーディングAPIがエラーを返しました");
                return None;
            }
            Err(e) => {
                warn!(query = %query, error = %e, "ジオコーディングに失敗");
                return None;
            }
        };

        let hits: Vec<Value> = result.json().ok()?;
        let hit = hits.first()?;
        Some((coordinate(hit.get("lat")?)?, coordinate(hit.get("lon")?)?))
    }
}

/// "51.1" / 51.1 どちらも受け付ける
fn coordinate(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, street: Option<&str>, city: &str) -> Option<(f64, f64)> {
        let raw_key = format!("{},{}", street.unwrap_or_default(), city);
        if let Some(cached) = self.cache.get(CACHE_NAMESPACE, &raw_key).await {
            if let Ok(point) = serde_json::from_str::<CachedPoint>(&cached) {
                return Some((point.lat, point.lon));
            }
        }

        let query = Self::build_query(street, city);
        debug!(query = %query, "ジオコーディング");
        let mut point = self.search(&query).await;
        if point.is_none() && query != city {
            info!(city = %city, "市名のみで再検索します");
            point = self.search(city).await;
        }

        let (lat, lon) = point?;
        if let Ok(body) = serde_json::to_string(&CachedPoint { lat, lon }) {
            self.cache.set(CACHE_NAMESPACE, &raw_key, &body, Some(self.ttl)).await;
        }
        Some((lat, lon))
    }
}
