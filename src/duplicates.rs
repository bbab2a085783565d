//! 同室（重複写真）判定モジュール
//!
//! 1. 整形済み画像が完全一致する写真は比較せずにリンク
//! 2. モデルが一括応答で申告した same_room_as を双方向にする
//! 3. 1枚ずつ解析した写真は、同じ部屋タイプ（other 以外）の組ごとに比較問い合わせ
//!
//! リンクは直接比較した組だけに張る（推移閉包は取らない）。
//! 若いインデックスの写真とリンクを持つ写真を重複とする。

use crate::vision::{Photo, VisionAnalysisClient};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use listing_ai_common::{AnalysisSource, PhotoAnalysisRecord, OTHER_ROOM_TYPE};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// 2枚の写真が同じ部屋かを判定する
#[async_trait]
pub trait RoomComparator: Send + Sync {
    /// 判定できなかった場合は None
    async fn same_room(&self, a: &Photo, b: &Photo) -> Option<bool>;
}

#[async_trait]
impl RoomComparator for VisionAnalysisClient {
    async fn same_room(&self, a: &Photo, b: &Photo) -> Option<bool> {
        self.compare_images(&a.image, &b.image).await
    }
}

/// 判定結果の集計
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionStats {
    pub exact_matches: usize,
    pub comparisons: usize,
    pub positive_comparisons: usize,
    pub failed_comparisons: usize,
}

pub struct DuplicateRoomResolver {
    comparator: Option<Arc<dyn RoomComparator>>,
    concurrency: usize,
}

impl DuplicateRoomResolver {
    /// 比較問い合わせなし（完全一致と申告のみ）
    pub fn reported_only() -> Self {
        Self {
            comparator: None,
            concurrency: 1,
        }
    }

    pub fn with_comparator(comparator: Arc<dyn RoomComparator>, concurrency: usize) -> Self {
        Self {
            comparator: Some(comparator),
            concurrency: concurrency.max(1),
        }
    }

    /// 全段階を実行して重複フラグを確定
    pub async fn resolve(
        &self,
        records: &mut [PhotoAnalysisRecord],
        photos: &[Photo],
    ) -> ResolutionStats {
        let mut stats = ResolutionStats {
            exact_matches: link_exact_duplicates(records, photos),
            ..ResolutionStats::default()
        };
        symmetrize_reported(records);

        if let Some(comparator) = &self.comparator {
            self.compare_pairs(comparator.as_ref(), records, photos, &mut stats).await;
        }

        mark_duplicates(records);
        info!(
            exact = stats.exact_matches,
            comparisons = stats.comparisons,
            positive = stats.positive_comparisons,
            failed = stats.failed_comparisons,
            "同室判定完了"
        );
        stats
    }

    async fn compare_pairs(
        &self,
        comparator: &dyn RoomComparator,
        records: &mut [PhotoAnalysisRecord],
        photos: &[Photo],
        stats: &mut ResolutionStats,
    ) {
        let by_index: HashMap<usize, &Photo> = photos.iter().map(|p| (p.index, p)).collect();
        let pairs = candidate_pairs(records);

        let jobs = pairs.into_iter().filter_map(|(i, j)| {
            let a = by_index.get(&records[i].image_index)?;
            let b = by_index.get(&records[j].image_index)?;
            Some((i, j, *a, *b))
        });
        let jobs: Vec<_> = jobs.collect();
        stats.comparisons = jobs.len();

        let answers: Vec<(usize, usize, Option<bool>)> = stream::iter(jobs)
            .map(|(i, j, a, b)| async move { (i, j, comparator.same_room(a, b).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (i, j, answer) in answers {
            match answer {
                Some(true) => {
                    stats.positive_comparisons += 1;
                    link(records, i, j);
                }
                Some(false) => {}
                None => {
                    // 判定失敗は別の部屋とみなす
                    stats.failed_comparisons += 1;
                    debug!(a = records[i].image_index, b = records[j].image_index, "比較に失敗");
                }
            }
        }
    }
}

/// 比較対象の組（レコード位置）
///
/// 同じ部屋タイプ（other 以外）で、まだリンクがなく、
/// 両方が同じ一括応答由来ではない組。
pub fn candidate_pairs(records: &[PhotoAnalysisRecord]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for i in 0..records.len() {
        for j in (i + 1)..records.len() {
            let (a, b) = (&records[i], &records[j]);
            if a.room_type != b.room_type || a.room_type == OTHER_ROOM_TYPE {
                continue;
            }
            if a.source == AnalysisSource::Combined && b.source == AnalysisSource::Combined {
                continue;
            }
            if a.same_room_as.contains(&b.image_index) {
                continue;
            }
            pairs.push((i, j));
        }
    }
    pairs
}

/// 整形済み画像の SHA-256 が一致する写真をリンク
pub fn link_exact_duplicates(records: &mut [PhotoAnalysisRecord], photos: &[Photo]) -> usize {
    let digests: HashMap<usize, &str> = photos
        .iter()
        .map(|p| (p.index, p.image.digest.as_str()))
        .collect();

    let mut first_seen: HashMap<&str, usize> = HashMap::new();
    let mut links = Vec::new();
    for (position, record) in records.iter().enumerate() {
        let Some(digest) = digests.get(&record.image_index) else {
            continue;
        };
        match first_seen.get(digest) {
            Some(&earlier) => links.push((earlier, position)),
            None => {
                first_seen.insert(*digest, position);
            }
        }
    }

    for &(i, j) in &links {
        link(records, i, j);
    }
    links.len()
}

/// モデル申告のリンクを双方向にする（存在しないインデックスは捨てる）
pub fn symmetrize_reported(records: &mut [PhotoAnalysisRecord]) {
    let positions: HashMap<usize, usize> = records
        .iter()
        .enumerate()
        .map(|(pos, r)| (r.image_index, pos))
        .collect();

    let mut links = Vec::new();
    for (pos, record) in records.iter().enumerate() {
        for other in &record.same_room_as {
            if let Some(&other_pos) = positions.get(other) {
                if other_pos != pos {
                    links.push((pos, other_pos));
                }
            }
        }
    }

    for record in records.iter_mut() {
        let own = record.image_index;
        record.same_room_as = record
            .same_room_as
            .iter()
            .copied()
            .filter(|i| *i != own && positions.contains_key(i))
            .collect::<BTreeSet<_>>();
    }
    for (i, j) in links {
        link(records, i, j);
    }
}

/// 重複フラグを確定
pub fn mark_duplicates(records: &mut [PhotoAnalysisRecord]) {
    for record in records.iter_mut() {
        record.is_duplicate = record.links_to_earlier();
    }
}

fn link(records: &mut [PhotoAnalysisRecord], i: usize, j: usize) {
    let (a, b) = (records[i].image_index, records[j].image_index);
    if a == b {
        return;
    }
    records[i].same_room_as.insert(b);
    records[j].same_room_as.insert(a);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize, room_type: &str, source: AnalysisSource) -> PhotoAnalysisRecord {
        let mut record = PhotoAnalysisRecord::placeholder(index, format!("http://img/{index}.jpg"));
        record.room_type = room_type.to_string();
        record.source = source;
        record
    }

    #[test]
    fn test_symmetrize_reported() {
        let mut records = vec![
            record(0, "kitchen", AnalysisSource::Combined),
            record(1, "kitchen", AnalysisSource::Combined),
            record(2, "bedroom", AnalysisSource::Combined),
        ];
        records[1].same_room_as.insert(0);
        // 存在しない写真への申告は捨てる
        records[2].same_room_as.insert(9);

        symmetrize_reported(&mut records);
        mark_duplicates(&mut records);

        assert!(records[0].same_room_as.contains(&1));
        assert!(records[1].same_room_as.contains(&0));
        assert!(records[2].same_room_as.is_empty());
        assert!(!records[0].is_duplicate);
        assert!(records[1].is_duplicate);
        assert!(!records[2].is_duplicate);
    }

    #[test]
    fn test_candidate_pairs() {
        let records = vec![
            record(0, "kitchen", AnalysisSource::Individual),
            record(1, "kitchen", AnalysisSource::Individual),
            record(2, "other", AnalysisSource::Individual),
            record(3, "other", AnalysisSource::Individual),
            record(4, "kitchen", AnalysisSource::Combined),
            record(5, "kitchen", AnalysisSource::Combined),
        ];
        let pairs = candidate_pairs(&records);
        // other 同士・一括同士は比較しない
        assert_eq!(pairs, vec![(0, 1), (0, 4), (0, 5), (1, 4), (1, 5)]);
    }
}
