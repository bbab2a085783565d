//! 並列統合テスト
//!
//! 部分失敗・タイムアウト・並列度・キャンセルの動作を検証

use async_trait::async_trait;
use listing_ai_common::{ListingRecord, PartialRecord};
use listing_ai_rust::config::OrchestratorConfig;
use listing_ai_rust::error::{ListingAiError, Result};
use listing_ai_rust::orchestrator::EnrichmentOrchestrator;
use listing_ai_rust::reconciler::SourceReconciler;
use listing_ai_rust::sources::SourceStrategy;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// ID によって遅延・失敗するソース
#[derive(Default)]
struct ScriptedSource {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: Mutex<Vec<String>>,
}

#[async_trait]
impl SourceStrategy for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, listing_id: &str, _known: &ListingRecord) -> Result<PartialRecord> {
        self.started.lock().unwrap().push(listing_id.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = if listing_id == "slow" { 500 } else { 20 };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if listing_id.starts_with("bad") {
            return Err(ListingAiError::source_failed("scripted", "HTTP 500"));
        }
        match json!({"price": 1000, "city": "Wrocław"}) {
            Value::Object(obj) => Ok(obj),
            _ => unreachable!(),
        }
    }
}

fn orchestrator(source: Arc<ScriptedSource>, workers: usize) -> EnrichmentOrchestrator {
    let reconciler = Arc::new(SourceReconciler::new(vec![source as Arc<dyn SourceStrategy>]));
    let config = OrchestratorConfig {
        workers,
        per_listing_timeout_secs: 5,
    };
    EnrichmentOrchestrator::new(reconciler, &config)
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// 失敗した掲載があっても残りは成功
#[tokio::test]
async fn test_partial_failures_collected() {
    let source = Arc::new(ScriptedSource::default());
    let orchestrator = orchestrator(source, 4);

    let mut report = orchestrator.enrich_all(ids(&["1", "bad-2", "3", "bad-4", "5"])).await;
    report.sort_by_id();

    assert_eq!(report.success_count(), 3);
    assert_eq!(report.failure_count(), 2);
    let succeeded: Vec<_> = report.succeeded.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(succeeded, vec!["1", "3", "5"]);
    assert_eq!(report.failed[0].listing_id, "bad-2");
    assert!(report.failed[0].error.contains("HTTP 500"));
    assert_eq!(report.succeeded[0].get_str("city_name"), Some("Wrocław"));
}

/// 時間切れの掲載だけ失敗扱い
#[tokio::test]
async fn test_per_listing_timeout() {
    let source = Arc::new(ScriptedSource::default());
    let orchestrator = orchestrator(source, 4).with_timeout(Duration::from_millis(100));

    let report = orchestrator.enrich_all(ids(&["1", "slow", "2"])).await;

    assert_eq!(report.success_count(), 2);
    assert_eq!(report.failure_count(), 1);
    assert_eq!(report.failed[0].listing_id, "slow");
    assert!(report.failed[0].error.contains("タイムアウト"));
}

/// 同時実行数は workers 以下
#[tokio::test]
async fn test_worker_bound() {
    let source = Arc::new(ScriptedSource::default());
    let orchestrator = orchestrator(source.clone(), 2);

    let listing_ids: Vec<String> = (0..8).map(|i| i.to_string()).collect();
    let report = orchestrator.enrich_all(listing_ids).await;

    assert_eq!(report.success_count(), 8);
    assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 2);
}

/// 進捗コールバックは1件ごとに呼ばれる
#[tokio::test]
async fn test_progress_callback() {
    let source = Arc::new(ScriptedSource::default());
    let orchestrator = orchestrator(source, 3);
    let done = Mutex::new(Vec::new());

    orchestrator
        .enrich_all_with_progress(ids(&["1", "bad-2", "3"]), |id, ok| {
            done.lock().unwrap().push((id.to_string(), ok));
        })
        .await;

    let mut done = done.into_inner().unwrap();
    done.sort();
    assert_eq!(
        done,
        vec![
            ("1".to_string(), true),
            ("3".to_string(), true),
            ("bad-2".to_string(), false)
        ]
    );
}

/// キャンセル済みなら何も取得しない
#[tokio::test]
async fn test_cancelled_before_start() {
    let source = Arc::new(ScriptedSource::default());
    let token = CancellationToken::new();
    token.cancel();
    let orchestrator = orchestrator(source.clone(), 2).with_cancellation(token);

    let report = orchestrator.enrich_all(ids(&["1", "2"])).await;

    assert_eq!(report.failure_count(), 2);
    assert!(source.started.lock().unwrap().is_empty());
}

/// 処理中のキャンセルで打ち切る
#[tokio::test]
async fn test_cancel_in_flight() {
    let source = Arc::new(ScriptedSource::default());
    let token = CancellationToken::new();
    let orchestrator = orchestrator(source, 2).with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let started = tokio::time::Instant::now();
    let report = orchestrator.enrich_all(ids(&["slow"])).await;
    canceller.await.unwrap();

    assert_eq!(report.failure_count(), 1);
    assert!(started.elapsed() < Duration::from_millis(400));
}
