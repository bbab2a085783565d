//! レート制限付きHTTP取得モジュール
//!
//! - 全呼び出しで共有する直前呼び出し時刻による最小間隔
//! - 一時的なエラー（429/5xx、タイムアウト）の指数バックオフ再試行
//! - プロキシのラウンドロビン（失敗時は直接接続）

pub mod transport;

pub use transport::{HttpReply, HttpRequest, Method, ReqwestTransport, Transport, TransportError};

use crate::config::FetchConfig;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry-After の上限
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("再試行回数を超えました（{attempts}回, 最終ステータス: {last_status:?}, 最終エラー: {last_error:?}）")]
    RetriesExhausted {
        attempts: u32,
        last_status: Option<u16>,
        last_error: Option<String>,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("不正なリクエスト: {0}")]
    InvalidRequest(String),
}

/// 取得結果
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub status: u16,
    pub body: Vec<u8>,
    pub from_cache: bool,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// リクエストごとの追加指定
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json_body(mut self, body: &serde_json::Value) -> Self {
        self.body = Some(body.to_string());
        self.header("Content-Type", "application/json")
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct RateLimitedFetcher {
    transport: Arc<dyn Transport>,
    config: FetchConfig,
    /// 直前の送信時刻（待機中もロックを保持する）
    last_call: Mutex<Option<Instant>>,
    proxy_cursor: AtomicUsize,
}

impl RateLimitedFetcher {
    pub fn new(config: FetchConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config,
            last_call: Mutex::new(None),
            proxy_cursor: AtomicUsize::new(0),
        }
    }

    /// reqwest で通信する取得器
    pub fn with_reqwest(config: FetchConfig) -> Self {
        Self::new(config, Arc::new(ReqwestTransport::new()))
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// HTTPリクエストを送信
    ///
    /// 再試行対象外のステータス（404 など）はそのまま結果として返す。
    /// 再試行を使い切った場合のみ `RetriesExhausted`。
    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        options: FetchOptions,
    ) -> Result<FetchResult, FetchError> {
        url::Url::parse(url).map_err(|e| FetchError::InvalidRequest(format!("{}: {}", url, e)))?;

        let attempts = self.config.max_retries + 1;
        let mut last_status = None;
        let mut last_error = None;

        for attempt in 0..attempts {
            let is_last = attempt + 1 == attempts;
            match self.send_once(method, url, &options).await {
                Ok(reply) if self.config.retry_statuses.contains(&reply.status) => {
                    warn!(url = %url, status = reply.status, attempt = attempt + 1, "一時的なエラー応答");
                    last_status = Some(reply.status);
                    last_error = None;
                    if !is_last {
                        let delay = reply
                            .retry_after
                            .as_deref()
                            .and_then(parse_retry_after)
                            .unwrap_or_else(|| self.backoff_delay(attempt));
                        tokio::time::sleep(delay).await;
                    }
                }
                Ok(reply) => {
                    debug!(url = %url, status = reply.status, "取得完了");
                    return Ok(FetchResult {
                        status: reply.status,
                        body: reply.body,
                        from_cache: false,
                    });
                }
                Err(e) if e.is_transient() => {
                    warn!(url = %url, error = %e, attempt = attempt + 1, "通信エラー、再試行します");
                    last_error = Some(e.to_string());
                    if !is_last {
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                    }
                }
                Err(e) => return Err(FetchError::Transport(e)),
            }
        }

        Err(FetchError::RetriesExhausted {
            attempts,
            last_status,
            last_error,
        })
    }

    pub async fn get(&self, url: &str) -> Result<FetchResult, FetchError> {
        self.fetch(Method::Get, url, FetchOptions::default()).await
    }

    /// 1回分の送信（プロキシ失敗時は直接接続でやり直す）
    async fn send_once(
        &self,
        method: Method,
        url: &str,
        options: &FetchOptions,
    ) -> Result<HttpReply, TransportError> {
        let proxy = self.next_proxy();
        self.wait_for_slot().await;
        let result = self.transport.send(self.build_request(method, url, options, proxy.clone())).await;

        match result {
            Err(TransportError::Proxy(reason)) if proxy.is_some() => {
                debug!(proxy = ?proxy, reason = %reason, "プロキシ失敗、直接接続に切り替え");
                self.wait_for_slot().await;
                self.transport.send(self.build_request(method, url, options, None)).await
            }
            other => other,
        }
    }

    fn build_request(
        &self,
        method: Method,
        url: &str,
        options: &FetchOptions,
        proxy: Option<String>,
    ) -> HttpRequest {
        let mut headers = options.headers.clone();
        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("user-agent")) {
            headers.push(("User-Agent".into(), self.config.user_agent.clone()));
        }
        HttpRequest {
            method,
            url: url.to_string(),
            headers,
            body: options.body.clone(),
            timeout: options.timeout.unwrap_or_else(|| self.config.timeout()),
            proxy,
        }
    }

    /// 前回の送信から最小間隔が空くまで待つ
    async fn wait_for_slot(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            let spacing = self.config.rate_limit();
            if elapsed < spacing {
                tokio::time::sleep(spacing - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }

    fn next_proxy(&self) -> Option<String> {
        if self.config.proxies.is_empty() {
            return None;
        }
        let index = self.proxy_cursor.fetch_add(1, Ordering::Relaxed) % self.config.proxies.len();
        self.config.proxies.get(index).cloned()
    }

    /// factor * 2^attempt + ジッタ
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .backoff_factor_ms
            .saturating_mul(1u64 << attempt.min(16));
        let jitter = if base == 0 { 0 } else { fastrand::u64(0..=base / 4) };
        Duration::from_millis(base + jitter)
    }
}

/// Retry-After（秒数 または HTTP日付）
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    let delay = if let Ok(secs) = value.parse::<u64>() {
        Duration::from_secs(secs)
    } else {
        let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
        let millis = (at.with_timezone(&chrono::Utc) - chrono::Utc::now()).num_milliseconds();
        Duration::from_millis(millis.max(0) as u64)
    };
    Some(delay.min(MAX_RETRY_AFTER))
}
