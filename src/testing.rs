//! テスト用のモック実装
//!
//! ネットワークやモデルを呼ばずに取得・解析・同室判定を検証するためのもの。

use crate::duplicates::RoomComparator;
use crate::fetcher::{HttpReply, HttpRequest, Method, Transport, TransportError};
use crate::vision::{Photo, VisionCallError, VisionModel, VisionRequest};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 応答の台本
#[derive(Debug, Clone)]
pub enum MockReply {
    Response {
        status: u16,
        body: Vec<u8>,
        retry_after: Option<String>,
    },
    Fail(TransportError),
}

impl MockReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self::bytes(200, body.into().into_bytes())
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self::ok(value.to_string())
    }

    pub fn status(status: u16) -> Self {
        Self::bytes(status, Vec::new())
    }

    pub fn bytes(status: u16, body: Vec<u8>) -> Self {
        Self::Response {
            status,
            body,
            retry_after: None,
        }
    }

    pub fn error(error: TransportError) -> Self {
        Self::Fail(error)
    }

    pub fn with_retry_after(self, value: impl Into<String>) -> Self {
        match self {
            Self::Response { status, body, .. } => Self::Response {
                status,
                body,
                retry_after: Some(value.into()),
            },
            other => other,
        }
    }
}

/// 記録された呼び出し
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub proxy: Option<String>,
    pub timeout: Duration,
    pub at: Instant,
}

/// 台本どおりに応答する通信層
///
/// URLごとの応答キューを先頭から返し、最後の1件は繰り返し使う。
/// 該当がなければ 404。
#[derive(Default)]
pub struct MockTransport {
    exact: Mutex<HashMap<String, VecDeque<MockReply>>>,
    prefixes: Mutex<Vec<(String, VecDeque<MockReply>)>>,
    failing_proxies: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 完全一致のURLに応答を追加
    pub fn on(&self, url: &str, reply: MockReply) {
        lock(&self.exact).entry(url.to_string()).or_default().push_back(reply);
    }

    /// 応答キューを置き換え
    pub fn reset(&self, url: &str, reply: MockReply) {
        lock(&self.exact).insert(url.to_string(), VecDeque::from([reply]));
    }

    /// 前方一致のURLに応答を追加（登録順に照合）
    pub fn on_prefix(&self, prefix: &str, reply: MockReply) {
        let mut prefixes = lock(&self.prefixes);
        match prefixes.iter_mut().find(|(p, _)| p == prefix) {
            Some((_, queue)) => queue.push_back(reply),
            None => prefixes.push((prefix.to_string(), VecDeque::from([reply]))),
        }
    }

    /// このプロキシ経由の送信はプロキシエラーにする
    pub fn fail_proxy(&self, proxy: &str) {
        lock(&self.failing_proxies).insert(proxy.to_string());
    }

    /// 応答前に待つ時間
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.url == url).count()
    }

    fn next_reply(&self, url: &str) -> MockReply {
        fn take(queue: &mut VecDeque<MockReply>) -> Option<MockReply> {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        }

        if let Some(reply) = lock(&self.exact).get_mut(url).and_then(take) {
            return reply;
        }
        let mut prefixes = lock(&self.prefixes);
        prefixes
            .iter_mut()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .and_then(|(_, queue)| take(queue))
            .unwrap_or_else(|| MockReply::status(404))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpReply, TransportError> {
        lock(&self.calls).push(RecordedCall {
            method: request.method,
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            proxy: request.proxy.clone(),
            timeout: request.timeout,
            at: Instant::now(),
        });

        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(proxy) = &request.proxy {
            if lock(&self.failing_proxies).contains(proxy) {
                return Err(TransportError::Proxy(format!("{} に接続できません", proxy)));
            }
        }

        match self.next_reply(&request.url) {
            MockReply::Response {
                status,
                body,
                retry_after,
            } => Ok(HttpReply {
                status,
                retry_after,
                body,
            }),
            MockReply::Fail(error) => Err(error),
        }
    }
}

/// 記録された解析リクエスト
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedVisionCall {
    pub prompt: String,
    pub image_count: usize,
    pub timeout: Duration,
}

type VisionScript = Box<dyn Fn(&VisionRequest<'_>, usize) -> Result<String, VisionCallError> + Send + Sync>;

/// 関数で応答を決める視覚言語モデル
///
/// 関数には何回目の呼び出しか（0始まり）も渡す。
pub struct ScriptedVisionModel {
    script: VisionScript,
    calls: Mutex<Vec<RecordedVisionCall>>,
}

impl ScriptedVisionModel {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&VisionRequest<'_>, usize) -> Result<String, VisionCallError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedVisionCall> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl VisionModel for ScriptedVisionModel {
    async fn generate(&self, request: &VisionRequest<'_>) -> Result<String, VisionCallError> {
        let call_no = {
            let mut calls = lock(&self.calls);
            calls.push(RecordedVisionCall {
                prompt: request.prompt.to_string(),
                image_count: request.images.len(),
                timeout: request.timeout,
            });
            calls.len() - 1
        };
        (self.script)(request, call_no)
    }
}

/// 決められた組だけを同室と答える比較器
///
/// 組はインデックスの順序を問わない。`failing` の組は判定失敗（None）。
#[derive(Default)]
pub struct ScriptedComparator {
    same: BTreeSet<(usize, usize)>,
    failing: BTreeSet<(usize, usize)>,
    calls: Mutex<Vec<(usize, usize)>>,
}

fn ordered(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

impl ScriptedComparator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn same(mut self, a: usize, b: usize) -> Self {
        self.same.insert(ordered(a, b));
        self
    }

    pub fn failing(mut self, a: usize, b: usize) -> Self {
        self.failing.insert(ordered(a, b));
        self
    }

    /// 比較した組（小さいインデックスが先）
    pub fn calls(&self) -> Vec<(usize, usize)> {
        let mut calls = lock(&self.calls).clone();
        calls.sort();
        calls
    }
}

#[async_trait]
impl RoomComparator for ScriptedComparator {
    async fn same_room(&self, a: &Photo, b: &Photo) -> Option<bool> {
        let pair = ordered(a.index, b.index);
        lock(&self.calls).push(pair);
        if self.failing.contains(&pair) {
            return None;
        }
        Some(self.same.contains(&pair))
    }
}
