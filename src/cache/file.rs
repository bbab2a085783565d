//! JSONファイルによるキャッシュ
//!
//! キャッシュディレクトリ直下の1ファイルに全エントリを保存する。
//! 書き込みはメモリ上に溜め、flush か破棄時にまとめて保存する。
//! 壊れたファイル・バージョン違いは空として読み直す。

use super::CacheBackend;
use crate::error::{ListingAiError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

const CACHE_FILE_NAME: &str = "response-cache.json";

/// キャッシュファイルの構造
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheFile {
    /// バージョン（互換性チェック用）
    version: u32,
    /// キー → エントリ
    entries: HashMap<String, CacheEntry>,
}

/// キャッシュエントリ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: String,
    /// 失効時刻（UNIXミリ秒）
    pub expires_at: i64,
}

impl CacheFile {
    const CURRENT_VERSION: u32 = 1;

    /// キャッシュファイルのパス
    pub fn cache_path(dir: &Path) -> PathBuf {
        dir.join(CACHE_FILE_NAME)
    }

    /// キャッシュファイルを読み込み
    pub fn load(dir: &Path) -> Self {
        let cache_path = Self::cache_path(dir);
        if !cache_path.exists() {
            return Self::default();
        }

        let file = match File::open(&cache_path) {
            Ok(f) => f,
            Err(_) => return Self::default(),
        };

        let reader = BufReader::new(file);
        match serde_json::from_reader::<_, CacheFile>(reader) {
            Ok(cache) if cache.version == Self::CURRENT_VERSION => cache,
            Ok(_) => {
                warn!(path = %cache_path.display(), "キャッシュバージョン不一致、再生成します");
                Self::default()
            }
            Err(e) => {
                warn!(path = %cache_path.display(), error = %e, "キャッシュファイルが壊れています、再生成します");
                Self::default()
            }
        }
    }

    /// キャッシュファイルを保存
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let file = File::create(Self::cache_path(dir))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// キャッシュファイルを削除（存在しなければ false）
    pub fn clear(dir: &Path) -> Result<bool> {
        let cache_path = Self::cache_path(dir);
        if cache_path.exists() {
            std::fs::remove_file(cache_path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// 有効なエントリを取得
    pub fn get(&self, key: &str, now_ms: i64) -> Option<&str> {
        self.entries
            .get(key)
            .filter(|e| now_ms < e.expires_at)
            .map(|e| e.value.as_str())
    }

    pub fn insert(&mut self, key: String, value: String, expires_at: i64) {
        self.entries.insert(key, CacheEntry { value, expires_at });
    }

    /// 期限切れエントリを削除
    pub fn purge_expired(&mut self, now_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now_ms < e.expires_at);
        before - self.entries.len()
    }

    /// キャッシュ件数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CacheFile {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            entries: HashMap::new(),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// ファイル永続化バックエンド
pub struct FileBackend {
    dir: PathBuf,
    state: Mutex<CacheFile>,
    /// 未保存の書き込みがある
    dirty: AtomicBool,
}

impl FileBackend {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let mut state = CacheFile::load(&dir);
        state.purge_expired(now_millis());
        Self {
            dir,
            state: Mutex::new(state),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }
}

#[async_trait]
impl CacheBackend for FileBackend {
    /// ディレクトリに書き込めるか確認
    async fn ping(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let meta = std::fs::metadata(&self.dir)?;
        if meta.permissions().readonly() {
            return Err(ListingAiError::Cache(format!(
                "書き込みできません: {}",
                self.dir.display()
            )));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.get(key, now_millis()).map(String::from))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = now_millis();
        state.purge_expired(now);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        state.insert(key.to_string(), value.to_string(), now.saturating_add(ttl_ms));
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// 変更があればスナップショットを別スレッドで書き出す
    async fn flush(&self) -> Result<()> {
        let snapshot = {
            let state = self.state.lock().await;
            if !self.dirty.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            state.clone()
        };

        let dir = self.dir.clone();
        let saved = tokio::task::spawn_blocking(move || snapshot.save(&dir))
            .await
            .map_err(|e| ListingAiError::Cache(e.to_string()))
            .and_then(|r| r);
        if saved.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        saved
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        if !*self.dirty.get_mut() {
            return;
        }
        if let Err(e) = self.state.get_mut().save(&self.dir) {
            warn!(path = %self.dir.display(), error = %e, "キャッシュを保存できませんでした");
        }
    }
}
