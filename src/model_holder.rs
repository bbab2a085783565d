//! 推論モデルの保持と定期更新
//!
//! 現在のモデルは読み書きロックの中に置き、呼び出し側が起動・停止する
//! 更新タスクで差し替える。

use crate::error::{ListingAiError, Result};
use async_trait::async_trait;
use listing_ai_common::FeatureVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ModelLoader<M>: Send + Sync {
    async fn load(&self) -> Result<M>;
}

pub struct ModelHolder<M> {
    current: RwLock<Option<Arc<M>>>,
    loader: Arc<dyn ModelLoader<M>>,
}

impl<M: Send + Sync + 'static> ModelHolder<M> {
    pub fn new(loader: Arc<dyn ModelLoader<M>>) -> Self {
        Self {
            current: RwLock::new(None),
            loader,
        }
    }

    /// 読み込み済みのモデル
    pub fn current(&self) -> Option<Arc<M>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// すぐに読み込み直す（失敗時は以前のモデルを残す）
    pub async fn refresh_now(&self) -> Result<()> {
        let model = self.loader.load().await?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(model));
        debug!("モデルを更新しました");
        Ok(())
    }

    /// 定期更新タスクを起動（トークンのキャンセルで終了）
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let holder = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("モデル更新タスクを停止します");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = holder.refresh_now().await {
                            warn!(error = %e, "モデルの更新に失敗");
                        }
                    }
                }
            }
        })
    }
}

/// 特徴量の線形モデル
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearPriceModel {
    #[serde(default)]
    pub intercept: f64,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

impl LinearPriceModel {
    /// 欠けている特徴量は 0 とみなす
    pub fn predict(&self, features: &FeatureVector) -> f64 {
        self.weights
            .iter()
            .map(|(key, weight)| weight * features.get(key).unwrap_or(0.0))
            .sum::<f64>()
            + self.intercept
    }
}

/// JSONファイルからの読み込み
pub struct JsonModelLoader {
    path: PathBuf,
}

impl JsonModelLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ModelLoader<LinearPriceModel> for JsonModelLoader {
    async fn load(&self) -> Result<LinearPriceModel> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ListingAiError::Config(format!("モデルファイルを読めません: {}: {}", self.path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}
