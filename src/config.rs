//! 設定モジュール
//!
//! `~/.config/listing-ai/config.json` を読み込み、環境変数で上書きする。

use crate::error::{ListingAiError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "listing-ai";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
    pub sources: SourcesConfig,
    pub vision: VisionConfig,
    pub orchestrator: OrchestratorConfig,
}

/// HTTP取得の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// リクエスト間の最小間隔
    pub rate_limit_ms: u64,
    pub max_retries: u32,
    /// 指数バックオフの基準値（factor * 2^attempt）
    pub backoff_factor_ms: u64,
    pub retry_statuses: Vec<u16>,
    pub timeout_secs: u64,
    pub proxies: Vec<String>,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            rate_limit_ms: 500,
            max_retries: 3,
            backoff_factor_ms: 500,
            retry_statuses: vec![429, 500, 502, 503, 504],
            timeout_secs: 15,
            proxies: Vec::new(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) Gecko/20100101 Firefox/114.0"
                .into(),
        }
    }
}

impl FetchConfig {
    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// レスポンスキャッシュの設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 省略時は OS のキャッシュディレクトリ
    pub dir: Option<PathBuf>,
    pub default_ttl_secs: u64,
    pub geo_ttl_secs: u64,
    pub graphql_ttl_secs: u64,
    pub page_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            default_ttl_secs: 86_400,
            geo_ttl_secs: 604_800,
            graphql_ttl_secs: 259_200,
            page_ttl_secs: 604_800,
        }
    }
}

impl CacheConfig {
    pub fn resolve_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        let base = dirs::cache_dir()
            .ok_or_else(|| ListingAiError::Config("キャッシュディレクトリが見つかりません".into()))?;
        Ok(base.join(APP_DIR))
    }
}

/// 取得元の設定（`{id}` は掲載IDに置換）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// false なら一次フィード以外を取得しない
    pub enable_detail_fetch: bool,
    pub offer_api_url: String,
    pub graphql_url: String,
    pub detail_page_url: String,
    pub geocoder_url: String,
    pub geocoder_country: String,
    pub geocoder_user_agent: String,
    /// カスタムエイリアスファイル（組み込みテーブルにマージ）
    pub alias_file: Option<PathBuf>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            enable_detail_fetch: true,
            offer_api_url: "https://www.otodom.pl/api/v1/offers/{id}".into(),
            graphql_url: "https://www.otodom.pl/api/graphql".into(),
            detail_page_url: "https://www.otodom.pl/pl/oferta/{id}".into(),
            geocoder_url: "https://nominatim.openstreetmap.org/search".into(),
            geocoder_country: "pl".into(),
            geocoder_user_agent: "listing-ai/0.1".into(),
            alias_file: None,
        }
    }
}

/// 画像解析の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    /// 一括リクエストあたりの最大枚数
    pub batch_size: usize,
    pub single_image_mode: bool,
    pub duplicate_detection: bool,
    /// 連続リクエスト間の待機
    pub api_delay_ms: u64,
    pub max_attempts: u32,
    pub image_timeout_secs: u64,
    pub text_timeout_secs: u64,
    pub rate_limit_backoff_secs: u64,
    pub error_backoff_secs: u64,
    pub max_image_edge: u32,
    pub jpeg_quality: u8,
    /// 同室比較の同時実行数
    pub comparison_concurrency: usize,
    /// 物件紹介文をモデルに書かせる（失敗時は定型文）
    pub text_summary: bool,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemini-2.5-flash".into(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta/models".into(),
            batch_size: 8,
            single_image_mode: false,
            duplicate_detection: true,
            api_delay_ms: 500,
            max_attempts: 3,
            image_timeout_secs: 90,
            text_timeout_secs: 45,
            rate_limit_backoff_secs: 5,
            error_backoff_secs: 2,
            max_image_edge: 800,
            jpeg_quality: 75,
            comparison_concurrency: 1,
            text_summary: true,
        }
    }
}

/// 並列取得の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub per_listing_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            per_listing_timeout_secs: 120,
        }
    }
}

impl Config {
    /// 設定ファイル + 環境変数
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// ファイルがなければデフォルト
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| ListingAiError::Config("ホームディレクトリが見つかりません".into()))?;
        Ok(home.join(".config").join(APP_DIR).join("config.json"))
    }

    /// 環境変数による上書き
    ///
    /// 解釈できない値は無視して設定ファイルの値を残す。
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(list) = lookup("PROXY_LIST") {
            self.fetch.proxies = list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        // 秒単位の小数
        if let Some(secs) = lookup("REQUEST_RATE_LIMIT").and_then(|v| v.trim().parse::<f64>().ok()) {
            if secs.is_finite() && secs >= 0.0 {
                self.fetch.rate_limit_ms = (secs * 1000.0).round() as u64;
            }
        }
        if let Some(workers) = lookup("DETAIL_MAX_WORKERS").and_then(|v| v.trim().parse::<usize>().ok()) {
            if workers > 0 {
                self.orchestrator.workers = workers;
            }
        }
        if let Some(flag) = lookup("ENABLE_DETAIL_FETCH") {
            match flag.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => self.sources.enable_detail_fetch = true,
                "0" | "false" | "no" => self.sources.enable_detail_fetch = false,
                _ => {}
            }
        }
    }

    pub fn get_api_key(&self) -> Result<String> {
        // 環境変数を優先
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                return Ok(key);
            }
        }

        self.vision
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ListingAiError::MissingApiKey)
    }

    pub fn set_api_key(&mut self, key: String) -> Result<()> {
        self.vision.api_key = Some(key);
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.fetch.rate_limit_ms, 500);
        assert_eq!(config.fetch.retry_statuses, vec![429, 500, 502, 503, 504]);
        assert_eq!(config.vision.batch_size, 8);
        assert_eq!(config.orchestrator.workers, 8);
        assert!(config.sources.enable_detail_fetch);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"fetch": {"max_retries": 5}, "vision": {"batch_size": 4}}"#).unwrap();
        assert_eq!(config.fetch.max_retries, 5);
        assert_eq!(config.fetch.timeout_secs, 15);
        assert_eq!(config.vision.batch_size, 4);
        assert_eq!(config.vision.jpeg_quality, 75);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("PROXY_LIST", "http://p1:8080, ,http://p2:8080"),
            ("REQUEST_RATE_LIMIT", "1.25"),
            ("DETAIL_MAX_WORKERS", "3"),
            ("ENABLE_DETAIL_FETCH", "false"),
        ]));

        assert_eq!(config.fetch.proxies, vec!["http://p1:8080", "http://p2:8080"]);
        assert_eq!(config.fetch.rate_limit_ms, 1250);
        assert_eq!(config.orchestrator.workers, 3);
        assert!(!config.sources.enable_detail_fetch);
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("REQUEST_RATE_LIMIT", "fast"),
            ("DETAIL_MAX_WORKERS", "0"),
            ("ENABLE_DETAIL_FETCH", "maybe"),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.vision.api_key = Some("key-123".into());
        config.save_to(&path).expect("保存失敗");

        let loaded = Config::load_from(&path).expect("読み込み失敗");
        assert_eq!(loaded.vision.api_key.as_deref(), Some("key-123"));
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let loaded = Config::load_from(&dir.path().join("none.json")).expect("読み込み失敗");
        assert_eq!(loaded, Config::default());
    }
}
