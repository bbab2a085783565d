//! 掲載の並列統合
//!
//! 上限付きの並列度で統合を走らせ、失敗は集めて返す（バッチは止めない）。
//! タイムアウト・キャンセルはその掲載の処理だけを中断する。

use crate::config::OrchestratorConfig;
use crate::error::ListingAiError;
use crate::reconciler::SourceReconciler;
use futures::stream::{self, StreamExt};
use listing_ai_common::ListingRecord;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingFailure {
    pub listing_id: String,
    pub error: String,
}

/// 統合結果（順番は入力順とは限らない）
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentReport {
    pub succeeded: Vec<ListingRecord>,
    pub failed: Vec<ListingFailure>,
}

impl EnrichmentReport {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    /// 掲載ID順に並べ替え
    pub fn sort_by_id(&mut self) {
        self.succeeded.sort_by(|a, b| a.id.cmp(&b.id));
        self.failed.sort_by(|a, b| a.listing_id.cmp(&b.listing_id));
    }
}

pub struct EnrichmentOrchestrator {
    reconciler: Arc<SourceReconciler>,
    workers: usize,
    per_listing_timeout: Duration,
    cancel: CancellationToken,
}

impl EnrichmentOrchestrator {
    pub fn new(reconciler: Arc<SourceReconciler>, config: &OrchestratorConfig) -> Self {
        Self {
            reconciler,
            workers: config.workers.max(1),
            per_listing_timeout: Duration::from_secs(config.per_listing_timeout_secs),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_listing_timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn enrich_all(&self, listing_ids: Vec<String>) -> EnrichmentReport {
        self.enrich_all_with_progress(listing_ids, |_, _| {}).await
    }

    /// 1件終わるごとに `on_done(listing_id, succeeded)` を呼ぶ
    pub async fn enrich_all_with_progress<F>(&self, listing_ids: Vec<String>, on_done: F) -> EnrichmentReport
    where
        F: Fn(&str, bool),
    {
        let total = listing_ids.len();
        let mut report = EnrichmentReport::default();

        let mut results = stream::iter(listing_ids)
            .map(|listing_id| async move {
                let outcome = self.enrich_one(&listing_id).await;
                (listing_id, outcome)
            })
            .buffer_unordered(self.workers);

        while let Some((listing_id, outcome)) = results.next().await {
            on_done(&listing_id, outcome.is_ok());
            match outcome {
                Ok(record) => report.succeeded.push(record),
                Err(error) => {
                    warn!(listing_id = %listing_id, error = %error, "掲載の統合に失敗");
                    report.failed.push(ListingFailure { listing_id, error });
                }
            }
        }

        info!(
            total,
            succeeded = report.success_count(),
            failed = report.failure_count(),
            "統合完了"
        );
        report
    }

    async fn enrich_one(&self, listing_id: &str) -> Result<ListingRecord, String> {
        if self.cancel.is_cancelled() {
            return Err("キャンセルされました".into());
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err("キャンセルされました".into()),
            outcome = tokio::time::timeout(self.per_listing_timeout, self.reconciler.reconcile(listing_id)) => {
                match outcome {
                    Ok(Ok(record)) => Ok(record),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(ListingAiError::Timeout(format!(
                        "{} ({}秒)",
                        listing_id,
                        self.per_listing_timeout.as_secs()
                    ))
                    .to_string()),
                }
            }
        }
    }
}
