//! 特徴量集約モジュール
//!
//! 写真ごとの解析レコード（形の決まっていないフィールド群）を走査し、
//! フラットな統計量へ畳み込む。
//!
//! | 値の型 | 出力キー |
//! |---|---|
//! | 数値・真偽値 | `<key>_avg` `<key>_min` `<key>_max` `<key>_median` |
//! | 文字列 | `<key>_mode` `<key>_mode_ratio` |
//! | 文字列リスト | `<key>_<slug>_ratio`（上位20件） |
//! | オブジェクトリスト | `<key>_<subkey>_<slug>_ratio` |
//! | 1階層のオブジェクト | `<key>_<subkey>` として数値/カテゴリへ |

use crate::types::{AnalysisFields, FieldValue, ListItem, PhotoAnalysisRecord, ScalarValue};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// リスト項目の出力上限
pub const DEFAULT_TOP_ITEMS: usize = 20;

/// スラッグの最大長
const SLUG_MAX_LEN: usize = 40;

lazy_static! {
    static ref NON_ALNUM: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

/// 小文字化し英数字以外を `_` にまとめ、40文字で切る
pub fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase();
    let slug = NON_ALNUM.replace_all(&lowered, "_");
    slug.trim_matches('_').chars().take(SLUG_MAX_LEN).collect()
}

/// 小数第3位で丸める
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// 中央値（空なら None）
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// 集約値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::Text(s) => Some(s),
        }
    }
}

/// 集約結果（キー → 値）
pub type AggregatedMetrics = BTreeMap<String, MetricValue>;

/// 出現順を保つ頻度カウンタ
///
/// 同数の場合は先に現れた値を優先する。
#[derive(Debug, Clone, Default)]
pub struct FrequencyCounter {
    entries: Vec<(String, usize)>,
    index: HashMap<String, usize>,
}

impl FrequencyCounter {
    pub fn add(&mut self, item: &str) {
        match self.index.get(item) {
            Some(&pos) => self.entries[pos].1 += 1,
            None => {
                self.index.insert(item.to_string(), self.entries.len());
                self.entries.push((item.to_string(), 1));
            }
        }
    }

    pub fn count(&self, item: &str) -> usize {
        self.index.get(item).map(|&pos| self.entries[pos].1).unwrap_or(0)
    }

    /// 頻度の高い順に最大n件
    pub fn most_common(&self, n: usize) -> Vec<(&str, usize)> {
        let mut sorted: Vec<(&str, usize)> = self
            .entries
            .iter()
            .map(|(item, count)| (item.as_str(), *count))
            .collect();
        // 安定ソートなので同数は出現順のまま
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        sorted.truncate(n);
        sorted
    }

    /// 最頻値
    pub fn mode(&self) -> Option<(&str, usize)> {
        self.most_common(1).into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 集約中の状態
#[derive(Default)]
struct Accumulator {
    numeric: BTreeMap<String, Vec<f64>>,
    categorical: BTreeMap<String, FrequencyCounter>,
    lists: BTreeMap<String, FrequencyCounter>,
}

impl Accumulator {
    fn push_number(&mut self, key: String, value: f64) {
        self.numeric.entry(key).or_default().push(value);
    }

    fn push_category(&mut self, key: String, value: &str) {
        self.categorical.entry(key).or_default().add(value);
    }

    fn push_list_item(&mut self, key: String, value: &str) {
        self.lists.entry(key).or_default().add(value);
    }

    fn push_scalar(&mut self, key: String, value: &ScalarValue) {
        match value {
            ScalarValue::Number(n) => self.push_number(key, *n),
            ScalarValue::Bool(b) => self.push_number(key, if *b { 1.0 } else { 0.0 }),
            ScalarValue::Text(s) => self.push_category(key, s),
        }
    }

    fn visit(&mut self, key: &str, value: &FieldValue) {
        match value {
            FieldValue::Number(n) => self.push_number(key.to_string(), *n),
            FieldValue::Bool(b) => self.push_number(key.to_string(), if *b { 1.0 } else { 0.0 }),
            FieldValue::Text(s) => self.push_category(key.to_string(), s),
            FieldValue::List(items) => {
                for item in items {
                    match item {
                        ListItem::Text(s) => self.push_list_item(key.to_string(), s),
                        ListItem::Object(obj) => {
                            for (sub_key, sub_value) in obj {
                                self.push_list_item(format!("{key}_{sub_key}"), sub_value);
                            }
                        }
                    }
                }
            }
            FieldValue::Nested(map) => {
                for (sub_key, sub_value) in map {
                    self.push_scalar(format!("{key}_{sub_key}"), sub_value);
                }
            }
        }
    }
}

/// 特徴量集約器
#[derive(Debug, Clone)]
pub struct FeatureAggregator {
    top_items: usize,
}

impl Default for FeatureAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureAggregator {
    pub fn new() -> Self {
        Self {
            top_items: DEFAULT_TOP_ITEMS,
        }
    }

    /// リスト項目の出力上限を変更
    pub fn with_top_items(mut self, top_items: usize) -> Self {
        self.top_items = top_items;
        self
    }

    /// 解析レコード群を集約
    pub fn aggregate(&self, records: &[PhotoAnalysisRecord]) -> AggregatedMetrics {
        self.aggregate_fields(records.iter().map(|r| &r.fields))
    }

    /// 任意のJSONオブジェクト群を集約（オブジェクト以外は無視）
    pub fn aggregate_json(&self, values: &[Value]) -> AggregatedMetrics {
        let fields: Vec<AnalysisFields> = values
            .iter()
            .filter_map(|v| v.as_object().cloned().map(AnalysisFields::from))
            .collect();
        self.aggregate_fields(fields.iter())
    }

    /// 型付きフィールド群を集約
    pub fn aggregate_fields<'a, I>(&self, records: I) -> AggregatedMetrics
    where
        I: IntoIterator<Item = &'a AnalysisFields>,
    {
        let mut acc = Accumulator::default();
        let mut record_count = 0usize;

        for fields in records {
            record_count += 1;
            for (key, value) in fields.iter() {
                acc.visit(key, value);
            }
        }

        let mut metrics = AggregatedMetrics::new();
        if record_count == 0 {
            return metrics;
        }

        for (key, values) in &acc.numeric {
            if values.is_empty() {
                continue;
            }
            let sum: f64 = values.iter().sum();
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = sum / values.len() as f64;

            metrics.insert(format!("{key}_avg"), MetricValue::Number(round3(avg)));
            metrics.insert(format!("{key}_min"), MetricValue::Number(round3(min)));
            metrics.insert(format!("{key}_max"), MetricValue::Number(round3(max)));
            if let Some(med) = median(values) {
                metrics.insert(format!("{key}_median"), MetricValue::Number(round3(med)));
            }
        }

        for (key, counter) in &acc.categorical {
            if let Some((mode, count)) = counter.mode() {
                metrics.insert(format!("{key}_mode"), MetricValue::Text(mode.to_string()));
                metrics.insert(
                    format!("{key}_mode_ratio"),
                    MetricValue::Number(round3(count as f64 / record_count as f64)),
                );
            }
        }

        for (key, counter) in &acc.lists {
            for (item, count) in counter.most_common(self.top_items) {
                let slug = slugify(item);
                if slug.is_empty() {
                    continue;
                }
                // スラッグが衝突した場合は頻度の高い方を残す
                metrics
                    .entry(format!("{key}_{slug}_ratio"))
                    .or_insert(MetricValue::Number(round3(count as f64 / record_count as f64)));
            }
        }

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn number(metrics: &AggregatedMetrics, key: &str) -> f64 {
        metrics
            .get(key)
            .and_then(MetricValue::as_f64)
            .unwrap_or_else(|| panic!("{key} が見つからない"))
    }

    // =============================================
    // 数値フィールド
    // =============================================

    #[test]
    fn test_numeric_statistics() {
        let metrics = FeatureAggregator::new().aggregate_json(&[json!({"score": 4}), json!({"score": 2})]);

        assert_eq!(number(&metrics, "score_avg"), 3.0);
        assert_eq!(number(&metrics, "score_min"), 2.0);
        assert_eq!(number(&metrics, "score_max"), 4.0);
        assert_eq!(number(&metrics, "score_median"), 3.0);
    }

    #[test]
    fn test_boolean_as_numeric() {
        let metrics = FeatureAggregator::new().aggregate_json(&[
            json!({"is_multi_functional": true}),
            json!({"is_multi_functional": false}),
            json!({"is_multi_functional": false}),
        ]);
        assert_eq!(number(&metrics, "is_multi_functional_avg"), 0.333);
        assert_eq!(number(&metrics, "is_multi_functional_median"), 0.0);
    }

    #[test]
    fn test_odd_median() {
        let metrics = FeatureAggregator::new()
            .aggregate_json(&[json!({"s": 5}), json!({"s": 1}), json!({"s": 2})]);
        assert_eq!(number(&metrics, "s_median"), 2.0);
    }

    // =============================================
    // 文字列フィールド
    // =============================================

    #[test]
    fn test_string_mode() {
        let metrics = FeatureAggregator::new().aggregate_json(&[
            json!({"style": "modern"}),
            json!({"style": "modern"}),
            json!({"style": "rustic"}),
        ]);
        assert_eq!(metrics.get("style_mode").and_then(MetricValue::as_str), Some("modern"));
        assert!((number(&metrics, "style_mode_ratio") - 0.667).abs() < 1e-9);
    }

    #[test]
    fn test_mode_tie_prefers_first_seen() {
        let metrics = FeatureAggregator::new()
            .aggregate_json(&[json!({"lighting": "Poor"}), json!({"lighting": "Good"})]);
        assert_eq!(metrics.get("lighting_mode").and_then(MetricValue::as_str), Some("Poor"));
    }

    #[test]
    fn test_mode_ratio_uses_all_records() {
        let metrics = FeatureAggregator::new()
            .aggregate_json(&[json!({"style": "modern"}), json!({"other": 1})]);
        assert_eq!(number(&metrics, "style_mode_ratio"), 0.5);
    }

    // =============================================
    // リスト・ネスト
    // =============================================

    #[test]
    fn test_string_list_ratios() {
        let metrics = FeatureAggregator::new().aggregate_json(&[
            json!({"features": ["Balcony access", "Radiator"]}),
            json!({"features": ["Balcony access"]}),
        ]);
        assert_eq!(number(&metrics, "features_balcony_access_ratio"), 1.0);
        assert_eq!(number(&metrics, "features_radiator_ratio"), 0.5);
    }

    #[test]
    fn test_object_list_flattened() {
        let metrics = FeatureAggregator::new().aggregate_json(&[json!({
            "visible_issues": [
                {"issue": "Water damage", "severity": "Major"},
                {"issue": "Worn floor", "severity": "Minor"}
            ]
        })]);
        assert_eq!(number(&metrics, "visible_issues_issue_water_damage_ratio"), 1.0);
        assert_eq!(number(&metrics, "visible_issues_severity_major_ratio"), 1.0);
        assert_eq!(number(&metrics, "visible_issues_severity_minor_ratio"), 1.0);
    }

    #[test]
    fn test_list_top_items_limit() {
        let items: Vec<String> = (0..30).map(|i| format!("feature {i}")).collect();
        let metrics = FeatureAggregator::new().aggregate_json(&[json!({"features": items})]);
        let count = metrics.keys().filter(|k| k.starts_with("features_")).count();
        assert_eq!(count, DEFAULT_TOP_ITEMS);
        assert!(metrics.contains_key("features_feature_0_ratio"));
        assert!(!metrics.contains_key("features_feature_29_ratio"));
    }

    #[test]
    fn test_nested_object() {
        let metrics = FeatureAggregator::new().aggregate_json(&[
            json!({"dimensions": {"width": 3, "shape": "square"}}),
            json!({"dimensions": {"width": 5, "shape": "square"}}),
        ]);
        assert_eq!(number(&metrics, "dimensions_width_avg"), 4.0);
        assert_eq!(
            metrics.get("dimensions_shape_mode").and_then(MetricValue::as_str),
            Some("square")
        );
    }

    #[test]
    fn test_unsupported_values_skipped() {
        let metrics = FeatureAggregator::new().aggregate_json(&[
            json!({"notes": null, "deep": {"a": {"b": 1}}, "nums": [1, 2]}),
            json!("not an object"),
        ]);
        assert!(metrics.keys().all(|k| !k.starts_with("notes") && !k.starts_with("nums")));
        assert!(metrics.keys().all(|k| !k.starts_with("deep_a")));
    }

    #[test]
    fn test_empty_input() {
        assert!(FeatureAggregator::new().aggregate(&[]).is_empty());
    }

    // =============================================
    // ユーティリティ
    // =============================================

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Balcony access"), "balcony_access");
        assert_eq!(slugify("  Water-damage (ceiling)!"), "water_damage_ceiling");
        assert_eq!(slugify(&"x".repeat(60)).len(), 40);
        assert_eq!(slugify("łazienka"), "azienka");
    }

    #[test]
    fn test_frequency_counter() {
        let mut counter = FrequencyCounter::default();
        for item in ["a", "b", "b", "c"] {
            counter.add(item);
        }
        assert_eq!(counter.count("b"), 2);
        assert_eq!(counter.mode(), Some(("b", 2)));
        assert_eq!(counter.most_common(2), vec![("b", 2), ("a", 1)]);
    }
}
