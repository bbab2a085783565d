//! 共通ライブラリのエラー型
//!
//! モデル応答の解析とエイリアス定義の読み込みで発生する。

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),

    /// エイリアス定義が使えない（空・表記なし）
    #[error("エイリアス定義が不正: {0}")]
    Alias(String),

    /// モデル応答から期待する JSON を取り出せない
    #[error("応答の解析に失敗: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, Error>;
