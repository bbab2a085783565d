//! 掲載単位の特徴量
//!
//! - 順序尺度テーブル（散らかり具合・改修必要度・状態・採光・深刻度）
//! - ListingComposites: 部屋数・重複率などの掲載単位の集計
//! - PropertySummary: 構造化サマリとフォールバック文
//! - FeatureVector: 下流モデル向けの数値のみの特徴量

use crate::aggregate::{round3, slugify, AggregatedMetrics, FrequencyCounter, MetricValue};
use crate::prompts::room_type_by_id;
use crate::types::{Issue, PhotoAnalysisRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

// =============================================
// 順序尺度
// =============================================

const CLUTTER_LEVELS: &[(&str, u8)] = &[
    ("very tidy", 0),
    ("minimal clutter", 0),
    ("low", 0),
    ("slight clutter", 1),
    ("medium", 1),
    ("moderate clutter", 2),
    ("high", 2),
    ("significant clutter", 3),
    ("heavy clutter", 3),
    ("very cluttered", 3),
];

const RENOVATION_LEVELS: &[(&str, u8)] = &[
    ("none", 0),
    ("low", 1),
    ("minor", 1),
    ("minor cosmetic updates", 1),
    ("moderate", 2),
    ("moderate renovation", 2),
    ("significant", 3),
    ("significant renovation", 3),
    ("full", 4),
    ("full gut renovation", 4),
];

const CONDITION_LEVELS: &[(&str, u8)] = &[
    ("excellent", 3),
    ("very good", 2),
    ("good", 2),
    ("fair", 1),
    ("average", 1),
    ("poor", 0),
];

/// 採光は部分一致（先に並べたものを優先）
const LIGHTING_LEVELS: &[(&str, u8)] = &[
    ("poor", 0),
    ("adequate", 1),
    ("average", 1),
    ("excellent", 3),
    ("good", 2),
];

const SEVERITY_LEVELS: &[(&str, u8)] = &[
    ("minor", 1),
    ("low", 1),
    ("moderate", 2),
    ("medium", 2),
    ("major", 3),
    ("significant", 3),
    ("critical", 4),
];

/// 深刻度ラベル（分布の出力順）
pub const SEVERITY_LABELS: &[&str] = &["minor", "moderate", "major", "critical"];

fn exact_rank(table: &[(&str, u8)], value: &str) -> Option<u8> {
    let key = value.trim().to_lowercase();
    table.iter().find(|(label, _)| *label == key).map(|(_, rank)| *rank)
}

pub fn clutter_rank(value: &str) -> Option<u8> {
    exact_rank(CLUTTER_LEVELS, value)
}

pub fn renovation_rank(value: &str) -> Option<u8> {
    exact_rank(RENOVATION_LEVELS, value)
}

pub fn condition_rank(value: &str) -> Option<u8> {
    exact_rank(CONDITION_LEVELS, value)
}

pub fn severity_rank(value: &str) -> Option<u8> {
    exact_rank(SEVERITY_LEVELS, value)
}

pub fn lighting_rank(value: &str) -> Option<u8> {
    let key = value.trim().to_lowercase();
    LIGHTING_LEVELS
        .iter()
        .find(|(label, _)| key.contains(label))
        .map(|(_, rank)| *rank)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(round3(values.iter().sum::<f64>() / values.len() as f64))
    }
}

// =============================================
// ListingComposites
// =============================================

/// 掲載単位の集計値
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingComposites {
    /// ダウンロード失敗を含む写真枚数
    pub total_images: usize,
    pub analyzed_images: usize,
    /// 重複でない写真の数
    pub unique_rooms_detected: usize,
    /// 重複でない写真の部屋タイプ種類数
    pub unique_room_types_detected: usize,
    pub duplicate_images_found: usize,
    pub habitable_rooms: usize,
    pub duplicate_ratio: f64,
    pub habitable_room_ratio: Option<f64>,
    /// 重複を除いた部屋タイプ別枚数
    pub room_counts: BTreeMap<String, usize>,
    pub room_counts_with_duplicates: BTreeMap<String, usize>,
    pub avg_confidence_score: Option<f64>,
    pub avg_estimated_condition: Option<f64>,
    pub avg_renovation_need: Option<f64>,
    pub max_renovation_need: Option<u8>,
    pub avg_lighting_quality: Option<f64>,
    pub dominant_clutter_level: Option<u8>,
    pub total_potential_issues: usize,
    pub avg_issue_severity: Option<f64>,
    pub issue_severity_counts: BTreeMap<String, usize>,
}

impl ListingComposites {
    /// 重複判定済みのレコード群から集計
    pub fn compute(records: &[PhotoAnalysisRecord], total_images: usize) -> Self {
        let mut composites = Self {
            total_images,
            analyzed_images: records.len(),
            ..Self::default()
        };

        let mut unique_types = HashSet::new();
        let mut confidences = Vec::new();
        let mut conditions = Vec::new();
        let mut renovations = Vec::new();
        let mut lightings = Vec::new();
        let mut severities = Vec::new();
        let mut clutter = FrequencyCounter::default();

        for label in SEVERITY_LABELS {
            composites.issue_severity_counts.insert(label.to_string(), 0);
        }

        for record in records {
            *composites
                .room_counts_with_duplicates
                .entry(record.room_type.clone())
                .or_default() += 1;

            if record.is_duplicate {
                composites.duplicate_images_found += 1;
            } else {
                composites.unique_rooms_detected += 1;
                unique_types.insert(record.room_type.as_str());
                *composites.room_counts.entry(record.room_type.clone()).or_default() += 1;
                if record.is_habitable == Some(true) {
                    composites.habitable_rooms += 1;
                }
            }

            if let Some(c) = record.confidence.filter(|c| c.is_finite()) {
                confidences.push(c);
            }
            if let Some(rank) = record.condition.as_deref().and_then(condition_rank) {
                conditions.push(rank as f64);
            }
            if let Some(rank) = record.renovation_need.as_deref().and_then(renovation_rank) {
                renovations.push(rank as f64);
            }
            if let Some(rank) = record.lighting.as_deref().and_then(lighting_rank) {
                lightings.push(rank as f64);
            }
            if let Some(level) = record.clutter_level.as_deref() {
                clutter.add(level);
            }

            composites.total_potential_issues += record.issues.len();
            for issue in &record.issues {
                if let Some(rank) = issue.severity.as_deref().and_then(severity_rank) {
                    severities.push(rank as f64);
                    let label = SEVERITY_LABELS[(rank as usize).saturating_sub(1)];
                    *composites.issue_severity_counts.entry(label.to_string()).or_default() += 1;
                }
            }
        }

        composites.unique_room_types_detected = unique_types.len();
        if total_images > 0 {
            composites.duplicate_ratio =
                round3(composites.duplicate_images_found as f64 / total_images as f64);
        }
        if composites.unique_rooms_detected > 0 {
            composites.habitable_room_ratio = Some(round3(
                composites.habitable_rooms as f64 / composites.unique_rooms_detected as f64,
            ));
        }
        composites.avg_confidence_score = mean(&confidences);
        composites.avg_estimated_condition = mean(&conditions);
        composites.avg_renovation_need = mean(&renovations);
        composites.max_renovation_need = renovations.iter().map(|r| *r as u8).max();
        composites.avg_lighting_quality = mean(&lightings);
        composites.dominant_clutter_level = clutter.mode().and_then(|(level, _)| clutter_rank(level));
        composites.avg_issue_severity = mean(&severities);

        composites
    }
}

// =============================================
// PropertySummary
// =============================================

/// 物件サマリ
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySummary {
    pub room_counts: BTreeMap<String, usize>,
    pub overall_condition: Option<String>,
    pub dominant_style: Option<String>,
    pub overall_lighting: Option<String>,
    /// 重複を除いた特徴（出現順）
    pub key_features: Vec<String>,
    /// 重複を除いた指摘事項（出現順）
    pub visible_issues: Vec<Issue>,
    pub summary_text: String,
}

impl PropertySummary {
    pub fn from_records(records: &[PhotoAnalysisRecord]) -> Self {
        let mut summary = Self::default();
        let mut conditions = FrequencyCounter::default();
        let mut styles = FrequencyCounter::default();
        let mut lightings = FrequencyCounter::default();
        let mut seen_features = HashSet::new();
        let mut seen_issues = HashSet::new();

        for record in records {
            *summary.room_counts.entry(record.room_type.clone()).or_default() += 1;
            if let Some(c) = &record.condition {
                conditions.add(c);
            }
            if let Some(s) = &record.style {
                styles.add(s);
            }
            if let Some(l) = &record.lighting {
                lightings.add(l);
            }
            for feature in &record.characteristics {
                if seen_features.insert(feature.clone()) {
                    summary.key_features.push(feature.clone());
                }
            }
            for issue in &record.issues {
                if seen_issues.insert(issue.clone()) {
                    summary.visible_issues.push(issue.clone());
                }
            }
        }

        summary.overall_condition = conditions.mode().map(|(v, _)| v.to_string());
        summary.dominant_style = styles.mode().map(|(v, _)| v.to_string());
        summary.overall_lighting = lightings.mode().map(|(v, _)| v.to_string());
        summary.summary_text = summary.fallback_text();
        summary
    }

    /// LLMを使わない定型サマリ文
    pub fn fallback_text(&self) -> String {
        let mut parts = Vec::new();

        if !self.room_counts.is_empty() {
            let total: usize = self.room_counts.values().sum();
            let details = self
                .room_counts
                .iter()
                .map(|(id, count)| {
                    let name = room_type_by_id(id).map(|r| r.name).unwrap_or(id.as_str());
                    format!("{name}: {count}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!(
                "{} room types ({} photos): {}.",
                self.room_counts.len(),
                total,
                details
            ));
        }
        if let Some(condition) = &self.overall_condition {
            parts.push(format!("Overall condition: {condition}."));
        }
        if let Some(style) = &self.dominant_style {
            parts.push(format!("Dominant style: {style}."));
        }
        if !self.key_features.is_empty() {
            let shown = self.key_features.iter().take(5).cloned().collect::<Vec<_>>().join(", ");
            let more = if self.key_features.len() > 5 { "..." } else { "" };
            parts.push(format!("Key features: {shown}{more}."));
        }
        if !self.visible_issues.is_empty() {
            let shown = self
                .visible_issues
                .iter()
                .take(3)
                .map(|i| format!("{} (severity: {})", i.issue, i.severity.as_deref().unwrap_or("N/A")))
                .collect::<Vec<_>>()
                .join(", ");
            let more = if self.visible_issues.len() > 3 { "..." } else { "" };
            parts.push(format!(
                "{} visible issues: {shown}{more}.",
                self.visible_issues.len()
            ));
        }

        if parts.is_empty() {
            "No summary information could be extracted.".to_string()
        } else {
            parts.join(" ")
        }
    }
}

// =============================================
// FeatureVector
// =============================================

/// 数値のみの特徴量（有限値のみ保持）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(BTreeMap<String, f64>);

impl FeatureVector {
    /// 集約結果・集計値・サマリから組み立てる
    ///
    /// `_mode` の文字列値は `<key>_<slug>` = 1.0 のワンホットに変換する。
    pub fn build(
        metrics: &AggregatedMetrics,
        composites: &ListingComposites,
        summary: &PropertySummary,
    ) -> Self {
        let mut vector = Self::default();

        for (key, value) in metrics {
            match value {
                MetricValue::Number(n) => vector.insert(key.clone(), *n),
                MetricValue::Text(text) => {
                    let slug = slugify(text);
                    if !slug.is_empty() {
                        vector.insert(format!("{key}_{slug}"), 1.0);
                    }
                }
            }
        }
        if let Some(score) = metrics
            .get("overall_impression_score_avg")
            .and_then(MetricValue::as_f64)
        {
            vector.insert("avg_impression_score", score);
        }

        let c = composites;
        vector.insert("total_images", c.total_images as f64);
        vector.insert("analyzed_images", c.analyzed_images as f64);
        vector.insert("total_unique_rooms", c.unique_rooms_detected as f64);
        vector.insert("unique_room_types", c.unique_room_types_detected as f64);
        vector.insert("duplicate_images_found", c.duplicate_images_found as f64);
        vector.insert("duplicate_ratio", c.duplicate_ratio);
        for (room_type, count) in &c.room_counts {
            vector.insert(format!("room_count_{room_type}"), *count as f64);
            vector.insert(format!("has_{room_type}"), 1.0);
        }
        vector.insert_opt("habitable_room_ratio", c.habitable_room_ratio);
        vector.insert_opt("avg_confidence_score", c.avg_confidence_score);
        vector.insert_opt("avg_estimated_condition", c.avg_estimated_condition);
        vector.insert_opt("avg_renovation_need", c.avg_renovation_need);
        vector.insert_opt("max_renovation_need", c.max_renovation_need.map(f64::from));
        vector.insert_opt("avg_lighting_quality", c.avg_lighting_quality);
        vector.insert_opt("dominant_clutter_level", c.dominant_clutter_level.map(f64::from));
        vector.insert("total_potential_issues", c.total_potential_issues as f64);
        vector.insert_opt("avg_issue_severity", c.avg_issue_severity);
        for (label, count) in &c.issue_severity_counts {
            vector.insert(format!("issue_severity_{label}"), *count as f64);
        }

        vector.insert_opt(
            "overall_condition",
            summary.overall_condition.as_deref().and_then(condition_rank).map(f64::from),
        );
        vector.insert_opt(
            "overall_lighting",
            summary.overall_lighting.as_deref().and_then(lighting_rank).map(f64::from),
        );
        vector.insert("key_feature_count", summary.key_features.len() as f64);
        vector.insert("visible_issue_count", summary.visible_issues.len() as f64);

        vector
    }

    /// 有限値のみ挿入
    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        if value.is_finite() {
            self.0.insert(key.into(), value);
        }
    }

    fn insert_opt(&mut self, key: &str, value: Option<f64>) {
        if let Some(v) = value {
            self.insert(key, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::FeatureAggregator;
    use crate::types::AnalysisSource;
    use serde_json::json;

    fn record(index: usize, room_type: &str, duplicate: bool) -> PhotoAnalysisRecord {
        let renovation = if index == 0 { "Moderate Renovation" } else { "None" };
        let obj = json!({
            "room_type": room_type,
            "condition": "Good",
            "lighting": "Excellent",
            "clutter_level": "Minimal Clutter",
            "estimated_renovation_need": renovation,
            "features": ["Balcony access"],
            "visible_issues": [{"issue": "Worn floor", "severity": "Minor"}],
            "overall_impression_score": 4
        });
        let mut r = PhotoAnalysisRecord::from_model_output(
            index,
            format!("http://img/{index}.jpg"),
            obj.as_object().unwrap(),
            AnalysisSource::Combined,
        );
        r.is_duplicate = duplicate;
        r
    }

    #[test]
    fn test_ordinal_tables() {
        assert_eq!(clutter_rank("Heavy Clutter"), Some(3));
        assert_eq!(renovation_rank("full gut renovation"), Some(4));
        assert_eq!(condition_rank("Fair"), Some(1));
        assert_eq!(severity_rank("Critical"), Some(4));
        assert_eq!(lighting_rank("Very good natural light"), Some(2));
        assert_eq!(lighting_rank("excellent"), Some(3));
        assert_eq!(clutter_rank("chaotic"), None);
    }

    #[test]
    fn test_composites_counts() {
        let records = vec![
            record(0, "living_room", false),
            record(1, "kitchen", false),
            record(2, "bedroom", false),
            record(3, "living_room", true),
        ];
        let c = ListingComposites::compute(&records, 5);

        assert_eq!(c.unique_rooms_detected, 3);
        assert_eq!(c.unique_room_types_detected, 3);
        assert_eq!(c.duplicate_images_found, 1);
        assert_eq!(c.duplicate_ratio, 0.2);
        assert_eq!(c.habitable_rooms, 2);
        assert_eq!(c.habitable_room_ratio, Some(0.667));
        assert_eq!(c.room_counts.get("living_room"), Some(&1));
        assert_eq!(c.room_counts_with_duplicates.get("living_room"), Some(&2));
        assert_eq!(c.max_renovation_need, Some(2));
        assert_eq!(c.avg_renovation_need, Some(0.5));
        assert_eq!(c.dominant_clutter_level, Some(0));
        assert_eq!(c.total_potential_issues, 4);
        assert_eq!(c.issue_severity_counts.get("minor"), Some(&4));
        assert_eq!(c.issue_severity_counts.get("critical"), Some(&0));
    }

    #[test]
    fn test_composites_empty() {
        let c = ListingComposites::compute(&[], 0);
        assert_eq!(c.duplicate_ratio, 0.0);
        assert_eq!(c.habitable_room_ratio, None);
    }

    #[test]
    fn test_property_summary() {
        let records = vec![record(0, "kitchen", false), record(1, "bedroom", false)];
        let summary = PropertySummary::from_records(&records);

        assert_eq!(summary.overall_condition.as_deref(), Some("Good"));
        assert_eq!(summary.key_features, vec!["Balcony access".to_string()]);
        assert_eq!(summary.visible_issues.len(), 1);
        assert!(summary.summary_text.contains("2 room types (2 photos)"));
        assert!(summary.summary_text.contains("Kitchen: 1"));
    }

    #[test]
    fn test_fallback_text_empty() {
        let summary = PropertySummary::default();
        assert_eq!(summary.fallback_text(), "No summary information could be extracted.");
    }

    #[test]
    fn test_feature_vector_is_numeric() {
        let records = vec![record(0, "kitchen", false), record(1, "kitchen", true)];
        let metrics = FeatureAggregator::new().aggregate(&records);
        let composites = ListingComposites::compute(&records, 2);
        let summary = PropertySummary::from_records(&records);
        let vector = FeatureVector::build(&metrics, &composites, &summary);

        assert_eq!(vector.get("condition_mode_good"), Some(1.0));
        assert_eq!(vector.get("avg_impression_score"), Some(4.0));
        assert_eq!(vector.get("has_kitchen"), Some(1.0));
        assert_eq!(vector.get("room_count_kitchen"), Some(1.0));
        assert_eq!(vector.get("duplicate_ratio"), Some(0.5));
        assert_eq!(vector.get("overall_condition"), Some(2.0));
        assert!(vector.iter().all(|(_, v)| v.is_finite()));
    }

    #[test]
    fn test_feature_vector_drops_non_finite() {
        let mut vector = FeatureVector::default();
        vector.insert("nan", f64::NAN);
        vector.insert("ok", 1.0);
        assert_eq!(vector.len(), 1);
    }
}
