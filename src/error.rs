use thiserror::Error;

use crate::fetcher::FetchError;

#[derive(Error, Debug)]
pub enum ListingAiError {
    #[error("設定エラー: {0}")]
    Config(String),

    #[error("APIキーが設定されていません。`listing-ai config --set-api-key YOUR_KEY` で設定してください")]
    MissingApiKey,

    #[error("取得エラー: {0}")]
    Fetch(#[from] FetchError),

    #[error("ソース {name} の取得に失敗: {message}")]
    Source { name: String, message: String },

    #[error("全ソースの取得に失敗しました: {0}")]
    AllSourcesFailed(String),

    #[error("タイムアウト: {0}")]
    Timeout(String),

    #[error("画像解析エラー: {0}")]
    Vision(String),

    #[error("キャッシュエラー: {0}")]
    Cache(String),

    #[error("画像処理エラー: {0}")]
    Image(String),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON解析エラー: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] listing_ai_common::Error),
}

impl ListingAiError {
    pub fn source_failed(name: impl Into<String>, message: impl ToString) -> Self {
        Self::Source {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ListingAiError>;
