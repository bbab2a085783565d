//! 写真解析クライアント
//!
//! - 一括リクエスト（最大 batch_size 枚）を優先し、失敗時は1枚ずつに切り替え
//! - 画像付きリクエストはテキストのみより長いタイムアウト
//! - 429 と一時的エラーは試行回数に比例した待機で再試行し、使い切ったら None

pub mod gemini;
pub mod images;

pub use gemini::GeminiModel;
pub use images::{download_photos, prepare_image, DownloadedPhotos, Photo, PreparedImage};

use crate::config::VisionConfig;
use async_trait::async_trait;
use listing_ai_common::{
    build_batch_prompt, build_comparison_prompt, build_single_prompt, parse_batch_response,
    parse_same_room_answer, parse_single_response, AnalysisSource, PhotoAnalysisRecord,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 画像1枚あたりの推定トークン数
const TOKENS_PER_IMAGE: usize = 258;

/// モデルへの1回分の問い合わせ
#[derive(Debug, Clone)]
pub struct VisionRequest<'a> {
    pub prompt: &'a str,
    pub images: Vec<&'a PreparedImage>,
    pub timeout: Duration,
    /// JSON 応答モードを要求するか
    pub expect_json: bool,
}

impl VisionRequest<'_> {
    /// 文字数/4 + 画像あたり固定値
    pub fn estimated_tokens(&self) -> usize {
        self.prompt.chars().count() / 4 + TOKENS_PER_IMAGE * self.images.len()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VisionCallError {
    #[error("レート制限 (429)")]
    RateLimited,

    #[error("タイムアウト: {0}")]
    Timeout(String),

    #[error("ステータス {0}")]
    Status(u16),

    #[error("通信エラー: {0}")]
    Transport(String),

    #[error("応答が空です")]
    EmptyResponse,

    #[error("応答形式が不正: {0}")]
    Malformed(String),
}

impl VisionCallError {
    /// 待機後に再試行する対象か
    pub fn is_retryable(&self) -> bool {
        match self {
            VisionCallError::RateLimited
            | VisionCallError::Timeout(_)
            | VisionCallError::Transport(_) => true,
            VisionCallError::Status(status) => *status >= 500,
            VisionCallError::EmptyResponse | VisionCallError::Malformed(_) => false,
        }
    }
}

/// 視覚言語モデル
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn generate(&self, request: &VisionRequest<'_>) -> Result<String, VisionCallError>;
}

pub struct VisionAnalysisClient {
    model: Arc<dyn VisionModel>,
    config: VisionConfig,
    last_call: Mutex<Option<Instant>>,
}

impl VisionAnalysisClient {
    pub fn new(model: Arc<dyn VisionModel>, config: VisionConfig) -> Self {
        Self {
            model,
            config,
            last_call: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    /// 写真群を解析
    ///
    /// 戻り値は入力と同じ順番・同じ件数。
    pub async fn classify(&self, photos: &[Photo]) -> Vec<PhotoAnalysisRecord> {
        if photos.is_empty() {
            return Vec::new();
        }
        if self.config.single_image_mode {
            return self.classify_individual(photos).await;
        }

        let batch_size = self.config.batch_size.max(1);
        let mut records = Vec::with_capacity(photos.len());
        for (chunk_no, chunk) in photos.chunks(batch_size).enumerate() {
            match self.classify_batch(chunk).await {
                Some(batch) => records.extend(batch),
                None => {
                    warn!(chunk = chunk_no, photos = chunk.len(), "一括解析に失敗、1枚ずつ解析します");
                    records.extend(self.classify_individual(chunk).await);
                }
            }
        }
        records
    }

    /// 1回の一括リクエスト
    ///
    /// 結果は image_index で対応付け、なければ配列内の位置で対応付ける。
    pub async fn classify_batch(&self, photos: &[Photo]) -> Option<Vec<PhotoAnalysisRecord>> {
        let indices: Vec<usize> = photos.iter().map(|p| p.index).collect();
        let prompt = build_batch_prompt(&indices);
        let images: Vec<&PreparedImage> = photos.iter().map(|p| &p.image).collect();

        let text = self.call(&prompt, images, true).await?;
        let items = match parse_batch_response(&text) {
            Ok(items) if !items.is_empty() => items,
            Ok(_) => {
                warn!("一括解析の結果が空です");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "一括解析の応答をパースできません");
                return None;
            }
        };

        let records = photos
            .iter()
            .enumerate()
            .map(|(position, photo)| match match_item(&items, photo.index, position) {
                Some(obj) => {
                    PhotoAnalysisRecord::from_model_output(photo.index, &photo.url, obj, AnalysisSource::Combined)
                }
                None => PhotoAnalysisRecord::placeholder(photo.index, &photo.url),
            })
            .collect();
        Some(records)
    }

    /// 1枚ずつ順番に解析
    pub async fn classify_individual(&self, photos: &[Photo]) -> Vec<PhotoAnalysisRecord> {
        let mut records = Vec::with_capacity(photos.len());
        for photo in photos {
            records.push(self.classify_one(photo).await);
        }
        records
    }

    /// 失敗時はデフォルト値のレコード
    pub async fn classify_one(&self, photo: &Photo) -> PhotoAnalysisRecord {
        let prompt = build_single_prompt();
        let Some(text) = self.call(&prompt, vec![&photo.image], true).await else {
            return PhotoAnalysisRecord::placeholder(photo.index, &photo.url);
        };

        match parse_single_response(&text) {
            Ok(obj) => PhotoAnalysisRecord::from_model_output(
                photo.index,
                &photo.url,
                &obj,
                AnalysisSource::Individual,
            ),
            Err(e) => {
                warn!(index = photo.index, error = %e, "単体解析の応答をパースできません");
                PhotoAnalysisRecord::placeholder(photo.index, &photo.url)
            }
        }
    }

    /// 2枚が同じ部屋か（失敗時は None）
    pub async fn compare_images(&self, a: &PreparedImage, b: &PreparedImage) -> Option<bool> {
        let text = self.call(build_comparison_prompt(), vec![a, b], false).await?;
        Some(parse_same_room_answer(&text))
    }

    /// 画像なしのテキスト生成（失敗・空応答は None）
    pub async fn generate_text(&self, prompt: &str) -> Option<String> {
        let text = self.call(prompt, Vec::new(), false).await?;
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    /// 再試行付きの問い合わせ
    async fn call(&self, prompt: &str, images: Vec<&PreparedImage>, expect_json: bool) -> Option<String> {
        let timeout = if images.is_empty() {
            Duration::from_secs(self.config.text_timeout_secs)
        } else {
            Duration::from_secs(self.config.image_timeout_secs)
        };
        let request = VisionRequest {
            prompt,
            images,
            timeout,
            expect_json,
        };
        debug!(
            images = request.images.len(),
            estimated_tokens = request.estimated_tokens(),
            "画像解析リクエスト"
        );

        let attempts = self.config.max_attempts.max(1);
        for attempt in 0..attempts {
            self.pace().await;
            let result = match tokio::time::timeout(request.timeout, self.model.generate(&request)).await {
                Ok(result) => result,
                Err(_) => Err(VisionCallError::Timeout(format!("{:?}", request.timeout))),
            };

            let error = match result {
                Ok(text) => return Some(text),
                Err(e) => e,
            };
            if !error.is_retryable() {
                warn!(error = %error, "画像解析リクエストに失敗");
                return None;
            }

            let factor = u64::from(attempt + 1);
            let wait = if error == VisionCallError::RateLimited {
                Duration::from_secs(self.config.rate_limit_backoff_secs * factor)
            } else {
                Duration::from_secs(self.config.error_backoff_secs * factor)
            };
            if attempt + 1 < attempts {
                warn!(error = %error, attempt = attempt + 1, wait_secs = wait.as_secs(), "画像解析を再試行します");
                tokio::time::sleep(wait).await;
            }
        }

        info!(attempts, "画像解析の再試行回数を超えました");
        None
    }

    /// 連続リクエストの間隔を空ける
    async fn pace(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let delay = Duration::from_millis(self.config.api_delay_ms);
            let elapsed = previous.elapsed();
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

/// image_index が一致する要素、なければ同じ位置の要素
fn match_item(items: &[Map<String, Value>], index: usize, position: usize) -> Option<&Map<String, Value>> {
    items
        .iter()
        .find(|item| item.get("image_index").and_then(Value::as_u64) == Some(index as u64))
        .or_else(|| {
            items
                .get(position)
                .filter(|item| item.get("image_index").and_then(Value::as_u64).is_none())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items(value: Value) -> Vec<Map<String, Value>> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn test_match_item_by_index_then_position() {
        let list = items(json!([
            {"image_index": 5, "room_type": "kitchen"},
            {"room_type": "bedroom"}
        ]));
        assert_eq!(match_item(&list, 5, 1).unwrap()["room_type"], "kitchen");
        assert_eq!(match_item(&list, 6, 1).unwrap()["room_type"], "bedroom");
        // 位置の要素が別インデックスを名乗っていれば採用しない
        assert!(match_item(&list, 7, 0).is_none());
    }

    #[test]
    fn test_estimated_tokens() {
        let image = PreparedImage::from_jpeg(vec![0]);
        let request = VisionRequest {
            prompt: "abcdefgh",
            images: vec![&image, &image],
            timeout: Duration::from_secs(1),
            expect_json: true,
        };
        assert_eq!(request.estimated_tokens(), 2 + 2 * TOKENS_PER_IMAGE);
    }

    #[test]
    fn test_estimated_tokens_counts_chars() {
        // 8文字・15バイト
        let request = VisionRequest {
            prompt: "łódźżółć",
            images: vec![],
            timeout: Duration::from_secs(1),
            expect_json: false,
        };
        assert_eq!(request.estimated_tokens(), 2);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(VisionCallError::RateLimited.is_retryable());
        assert!(VisionCallError::Status(503).is_retryable());
        assert!(!VisionCallError::Status(400).is_retryable());
        assert!(!VisionCallError::EmptyResponse.is_retryable());
    }
}
