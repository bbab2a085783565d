//! 同室判定テスト
//!
//! リンクの対称性・非推移性・比較失敗・完全一致の動作を検証

use listing_ai_common::{AnalysisSource, PhotoAnalysisRecord};
use listing_ai_rust::duplicates::DuplicateRoomResolver;
use listing_ai_rust::testing::ScriptedComparator;
use listing_ai_rust::vision::{Photo, PreparedImage};
use std::collections::BTreeSet;
use std::sync::Arc;

fn record(index: usize, room_type: &str, source: AnalysisSource) -> PhotoAnalysisRecord {
    let mut record = PhotoAnalysisRecord::placeholder(index, format!("https://img.test/{index}.jpg"));
    record.room_type = room_type.to_string();
    record.source = source;
    record
}

fn photo(index: usize, content: u8) -> Photo {
    Photo {
        index,
        url: format!("https://img.test/{index}.jpg"),
        image: PreparedImage::from_jpeg(vec![content; 32]),
    }
}

/// 内容がすべて異なる写真
fn distinct_photos(count: usize) -> Vec<Photo> {
    (0..count).map(|i| photo(i, i as u8)).collect()
}

fn links(record: &PhotoAnalysisRecord) -> Vec<usize> {
    record.same_room_as.iter().copied().collect()
}

fn resolver(comparator: &Arc<ScriptedComparator>) -> DuplicateRoomResolver {
    DuplicateRoomResolver::with_comparator(comparator.clone(), 2)
}

// =============================================
// 比較問い合わせ
// =============================================

/// 同室と判定された組は双方向にリンク
#[tokio::test]
async fn test_links_are_symmetric() {
    let comparator = Arc::new(ScriptedComparator::new().same(0, 1));
    let mut records = vec![
        record(0, "kitchen", AnalysisSource::Individual),
        record(1, "kitchen", AnalysisSource::Individual),
    ];

    let stats = resolver(&comparator).resolve(&mut records, &distinct_photos(2)).await;

    assert_eq!(links(&records[0]), vec![1]);
    assert_eq!(links(&records[1]), vec![0]);
    assert!(!records[0].is_duplicate);
    assert!(records[1].is_duplicate);
    assert_eq!(stats.comparisons, 1);
    assert_eq!(stats.positive_comparisons, 1);
}

/// 推移閉包は取らない
#[tokio::test]
async fn test_links_are_not_transitive() {
    let comparator = Arc::new(ScriptedComparator::new().same(0, 1).same(1, 2));
    let mut records = vec![
        record(0, "bedroom", AnalysisSource::Individual),
        record(1, "bedroom", AnalysisSource::Individual),
        record(2, "bedroom", AnalysisSource::Individual),
    ];

    resolver(&comparator).resolve(&mut records, &distinct_photos(3)).await;

    assert_eq!(links(&records[0]), vec![1]);
    assert_eq!(links(&records[1]), vec![0, 2]);
    assert_eq!(links(&records[2]), vec![1]);
    assert_eq!(comparator.calls(), vec![(0, 1), (0, 2), (1, 2)]);
    let duplicates: Vec<_> = records.iter().map(|r| r.is_duplicate).collect();
    assert_eq!(duplicates, vec![false, true, true]);
}

/// 比較失敗は別の部屋
#[tokio::test]
async fn test_failed_comparison_means_different_rooms() {
    let comparator = Arc::new(ScriptedComparator::new().failing(0, 1));
    let mut records = vec![
        record(0, "bathroom", AnalysisSource::Individual),
        record(1, "bathroom", AnalysisSource::Individual),
    ];

    let stats = resolver(&comparator).resolve(&mut records, &distinct_photos(2)).await;

    assert!(records.iter().all(|r| r.same_room_as.is_empty()));
    assert!(records.iter().all(|r| !r.is_duplicate));
    assert_eq!(stats.failed_comparisons, 1);
}

/// other 同士・一括解析同士・部屋タイプ違いは比較しない
#[tokio::test]
async fn test_pairs_not_compared() {
    let comparator = Arc::new(ScriptedComparator::new().same(0, 1).same(2, 3).same(4, 5));
    let mut records = vec![
        record(0, "other", AnalysisSource::Individual),
        record(1, "other", AnalysisSource::Individual),
        record(2, "kitchen", AnalysisSource::Combined),
        record(3, "kitchen", AnalysisSource::Combined),
        record(4, "kitchen", AnalysisSource::Individual),
        record(5, "bedroom", AnalysisSource::Individual),
    ];

    let stats = resolver(&comparator).resolve(&mut records, &distinct_photos(6)).await;

    // 一括解析の kitchen と単体解析の kitchen の組だけ比較する
    assert_eq!(comparator.calls(), vec![(2, 4), (3, 4)]);
    assert_eq!(stats.positive_comparisons, 0);
    assert!(records.iter().all(|r| !r.is_duplicate));
}

// =============================================
// 完全一致・申告
// =============================================

/// 同一画像は比較せずにリンク
#[tokio::test]
async fn test_exact_duplicates_linked_without_comparison() {
    let comparator = Arc::new(ScriptedComparator::new());
    let photos = vec![photo(0, 7), photo(1, 8), photo(2, 7)];
    let mut records = vec![
        record(0, "living_room", AnalysisSource::Individual),
        record(1, "kitchen", AnalysisSource::Individual),
        record(2, "living_room", AnalysisSource::Individual),
    ];

    let stats = resolver(&comparator).resolve(&mut records, &photos).await;

    assert_eq!(stats.exact_matches, 1);
    assert_eq!(links(&records[0]), vec![2]);
    assert!(records[2].is_duplicate);
    assert!(comparator.calls().is_empty());
}

/// 部屋タイプが違っても同一画像はリンク
#[tokio::test]
async fn test_exact_duplicates_ignore_room_type() {
    let photos = vec![photo(0, 1), photo(1, 1)];
    let mut records = vec![
        record(0, "kitchen", AnalysisSource::Combined),
        record(1, "other", AnalysisSource::Combined),
    ];

    DuplicateRoomResolver::reported_only().resolve(&mut records, &photos).await;

    assert!(records[1].is_duplicate);
}

/// モデル申告のリンクは比較なしで双方向にする
#[tokio::test]
async fn test_reported_links_symmetrized() {
    let comparator = Arc::new(ScriptedComparator::new());
    let mut records = vec![
        record(0, "kitchen", AnalysisSource::Combined),
        record(1, "bedroom", AnalysisSource::Combined),
        record(2, "kitchen", AnalysisSource::Combined),
    ];
    records[2].same_room_as = BTreeSet::from([0]);

    resolver(&comparator).resolve(&mut records, &distinct_photos(3)).await;

    assert_eq!(links(&records[0]), vec![2]);
    assert_eq!(links(&records[2]), vec![0]);
    assert!(records[2].is_duplicate);
    assert!(!records[1].is_duplicate);
    assert!(comparator.calls().is_empty());
}

/// 比較なしの設定では申告と完全一致のみ
#[tokio::test]
async fn test_reported_only_skips_comparisons() {
    let mut records = vec![
        record(0, "kitchen", AnalysisSource::Individual),
        record(1, "kitchen", AnalysisSource::Individual),
    ];

    let stats = DuplicateRoomResolver::reported_only()
        .resolve(&mut records, &distinct_photos(2))
        .await;

    assert_eq!(stats.comparisons, 0);
    assert!(records.iter().all(|r| !r.is_duplicate));
}
