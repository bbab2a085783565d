//! HTTP送信の抽象
//!
//! 取得処理はこのトレイト越しに通信するので、テストでは差し替えられる。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpReply {
    pub status: u16,
    /// Retry-After ヘッダの生値
    pub retry_after: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("タイムアウト: {0}")]
    Timeout(String),

    #[error("接続エラー: {0}")]
    Connect(String),

    #[error("プロキシエラー: {0}")]
    Proxy(String),

    #[error("通信エラー: {0}")]
    Other(String),
}

impl TransportError {
    /// 再試行で回復しうるか
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Connect(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpReply, TransportError>;
}

/// reqwest による実装（プロキシごとにクライアントを使い回す）
#[derive(Default)]
pub struct ReqwestTransport {
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client, TransportError> {
        let key = proxy.map(String::from);
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| TransportError::Other("クライアントキャッシュが破損しています".into()))?;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().cookie_store(true);
        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| TransportError::Proxy(format!("{}: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpReply, TransportError> {
        let client = self.client_for(request.proxy.as_deref())?;
        let via_proxy = request.proxy.is_some();

        let mut builder = match request.method {
            Method::Get => client.get(&request.url),
            Method::Post => client.post(&request.url),
        };
        builder = builder.timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                TransportError::Timeout(e.to_string())
            } else if e.is_connect() && via_proxy {
                TransportError::Proxy(e.to_string())
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        };

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.bytes().await.map_err(classify)?.to_vec();

        Ok(HttpReply {
            status,
            retry_after,
            body,
        })
    }
}
