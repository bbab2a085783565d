//! プロセス内キャッシュ

use super::CacheBackend;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// 失効時刻が None のエントリは期限なし
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 期限切れを含む件数
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| is_live(*expires_at, Instant::now()))
            .map(|(value, _)| value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| is_live(*expires_at, now));
        // 表現できないほど先の期限は期限なし
        entries.insert(key.to_string(), (value.to_string(), now.checked_add(ttl)));
        Ok(())
    }
}

fn is_live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.map_or(true, |at| now < at)
}
