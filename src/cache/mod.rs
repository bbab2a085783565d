//! レスポンスキャッシュモジュール
//!
//! 名前空間 + リクエスト識別子の SHA-256 をキーにした読み込み時キャッシュ。
//! バックエンドに到達できない場合はプロセス内キャッシュに切り替える。
//! 呼び出し側にはキャッシュのエラーを一切返さない。

pub mod file;
pub mod memory;

pub use file::{CacheFile, FileBackend};
pub use memory::MemoryBackend;

use crate::error::Result;
use crate::fetcher::{FetchError, FetchOptions, FetchResult, Method, RateLimitedFetcher};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// GET / SETEX 相当のキー・バリューストア
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// 到達確認
    async fn ping(&self) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// 溜めた書き込みを永続化
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct ResponseCache {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
}

impl ResponseCache {
    /// バックエンドへ接続（到達できなければプロセス内キャッシュ）
    pub async fn connect(primary: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        let backend = match primary.ping().await {
            Ok(()) => primary,
            Err(e) => {
                warn!(error = %e, "キャッシュバックエンドに接続できません、メモリキャッシュを使用します");
                Arc::new(MemoryBackend::new()) as Arc<dyn CacheBackend>
            }
        };
        Self {
            backend,
            default_ttl,
        }
    }

    pub fn in_memory(default_ttl: Duration) -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            default_ttl,
        }
    }

    /// `namespace:sha256(raw_key)`
    pub fn cache_key(namespace: &str, raw_key: &str) -> String {
        let digest = Sha256::digest(raw_key.as_bytes());
        format!("{}:{}", namespace, hex::encode(digest))
    }

    pub async fn get(&self, namespace: &str, raw_key: &str) -> Option<String> {
        let key = Self::cache_key(namespace, raw_key);
        match self.backend.get(&key).await {
            Ok(value) => value,
            Err(e) => {
                debug!(key = %key, error = %e, "キャッシュ読み込み失敗");
                None
            }
        }
    }

    /// ttl 省略時は既定値
    pub async fn set(&self, namespace: &str, raw_key: &str, body: &str, ttl: Option<Duration>) {
        let key = Self::cache_key(namespace, raw_key);
        let ttl = ttl.unwrap_or(self.default_ttl);
        if let Err(e) = self.backend.set_ex(&key, body, ttl).await {
            debug!(key = %key, error = %e, "キャッシュ書き込み失敗");
        }
    }

    /// バックエンドへ書き出す（失敗はログのみ）
    pub async fn flush(&self) {
        if let Err(e) = self.backend.flush().await {
            warn!(error = %e, "キャッシュの保存に失敗");
        }
    }

    /// キャッシュを通した取得
    ///
    /// 2xx の応答のみ保存する。
    pub async fn get_or_fetch(
        &self,
        fetcher: &RateLimitedFetcher,
        namespace: &str,
        method: Method,
        url: &str,
        options: FetchOptions,
        ttl: Option<Duration>,
    ) -> std::result::Result<FetchResult, FetchError> {
        let identity = request_identity(method, url, options.body.as_deref());
        if let Some(body) = self.get(namespace, &identity).await {
            debug!(url = %url, namespace = %namespace, "キャッシュヒット");
            return Ok(FetchResult {
                status: 200,
                body: body.into_bytes(),
                from_cache: true,
            });
        }

        let result = fetcher.fetch(method, url, options).await?;
        if result.is_success() {
            self.set(namespace, &identity, &result.text(), ttl).await;
        }
        Ok(result)
    }
}

/// リクエストの識別文字列（POST は本文も含める）
fn request_identity(method: Method, url: &str, body: Option<&str>) -> String {
    match (method, body) {
        (Method::Post, Some(body)) => format!("POST {}\n{}", url, body),
        _ => format!("{} {}", method, url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        let key = ResponseCache::cache_key("http", "https://example.com/");
        let (namespace, digest) = key.split_once(':').expect("区切りがない");
        assert_eq!(namespace, "http");
        assert_eq!(digest.len(), 64);
        assert_eq!(key, ResponseCache::cache_key("http", "https://example.com/"));
        assert_ne!(key, ResponseCache::cache_key("geo", "https://example.com/"));
    }

    #[test]
    fn test_request_identity_includes_post_body() {
        let a = request_identity(Method::Post, "http://x/graphql", Some("{\"id\":1}"));
        let b = request_identity(Method::Post, "http://x/graphql", Some("{\"id\":2}"));
        assert_ne!(a, b);
        assert_eq!(request_identity(Method::Get, "http://x/", None), "GET http://x/");
    }
}
