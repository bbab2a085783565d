//! 共通型定義
//!
//! - ListingRecord: 掲載1件分のフィールドマップ（非破壊マージ）
//! - FieldValue: 解析レコードの値を取り込み時に一度だけ型付けしたもの
//! - PhotoAnalysisRecord: 写真1枚分の解析結果

use crate::prompts::ROOM_TYPES;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// 1ソース分の部分レコード
pub type PartialRecord = Map<String, Value>;

/// 不明な部屋タイプの番兵値
pub const OTHER_ROOM_TYPE: &str = "other";

/// 値が未設定とみなされるか
///
/// null・空文字・空配列・空オブジェクトは未設定。`false` と `0` は設定済み。
pub fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

// =============================================
// ListingRecord
// =============================================

/// 掲載レコード
///
/// フィールドは一度設定されたら後続ソースで上書きされない。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    /// ソース側の掲載ID
    pub id: String,
    #[serde(flatten)]
    fields: BTreeMap<String, Value>,
}

impl ListingRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    /// フィールドが設定済みか
    pub fn is_set(&self, key: &str) -> bool {
        self.fields.get(key).is_some_and(|v| !is_unset(v))
    }

    /// フィールドを直接設定（型正規化・派生フィールド用）
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// 未設定フィールドのみ埋める
    ///
    /// 設定済みフィールドは値の内容にかかわらず変更しない。
    /// 戻り値は埋めたフィールド数。
    pub fn merge_missing(&mut self, partial: &PartialRecord) -> usize {
        let mut filled = 0;
        for (key, value) in partial {
            if key == "id" || is_unset(value) || self.is_set(key) {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
            filled += 1;
        }
        filled
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// =============================================
// FieldValue（型付き解析値）
// =============================================

/// オブジェクト内のスカラー値
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl ScalarValue {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Number(n) => number_to_json(*n),
            Self::Bool(b) => Value::Bool(*b),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    /// カウンタ用の文字列表現
    pub fn label(&self) -> String {
        match self {
            Self::Number(n) => format_number(*n),
            Self::Bool(b) => b.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

/// リスト要素
#[derive(Debug, Clone, PartialEq)]
pub enum ListItem {
    Text(String),
    /// 各値は文字列化済み
    Object(BTreeMap<String, String>),
}

/// 解析レコードの値
///
/// null や2階層以上のネストは取り込み時に捨てる。
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
    Text(String),
    List(Vec<ListItem>),
    Nested(BTreeMap<String, ScalarValue>),
}

impl FieldValue {
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Array(items) => {
                let list = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(ListItem::Text(s.clone())),
                        Value::Object(obj) => {
                            let flat: BTreeMap<String, String> = obj
                                .iter()
                                .filter_map(|(k, v)| {
                                    ScalarValue::from_json(v).map(|s| (k.clone(), s.label()))
                                })
                                .collect();
                            Some(ListItem::Object(flat))
                        }
                        _ => None,
                    })
                    .collect();
                Some(Self::List(list))
            }
            Value::Object(obj) => {
                let nested = obj
                    .iter()
                    .filter_map(|(k, v)| ScalarValue::from_json(v).map(|s| (k.clone(), s)))
                    .collect();
                Some(Self::Nested(nested))
            }
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Number(n) => number_to_json(*n),
            Self::Bool(b) => Value::Bool(*b),
            Self::Text(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| match item {
                        ListItem::Text(s) => Value::String(s.clone()),
                        ListItem::Object(obj) => Value::Object(
                            obj.iter()
                                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                                .collect(),
                        ),
                    })
                    .collect(),
            ),
            Self::Nested(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// 写真1枚分の型付きフィールド
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct AnalysisFields(BTreeMap<String, FieldValue>);

impl AnalysisFields {
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.0.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for AnalysisFields {
    fn from(map: Map<String, Value>) -> Self {
        Self(
            map.iter()
                .filter_map(|(k, v)| FieldValue::from_json(v).map(|fv| (k.clone(), fv)))
                .collect(),
        )
    }
}

impl From<AnalysisFields> for Map<String, Value> {
    fn from(fields: AnalysisFields) -> Self {
        fields.0.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
    }
}

// =============================================
// PhotoAnalysisRecord
// =============================================

/// 解析結果の出どころ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSource {
    /// 複数画像の一括リクエスト
    Combined,
    /// 1枚ずつのリクエスト
    Individual,
    /// 応答なし（デフォルト値）
    #[default]
    Default,
}

/// 指摘事項
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Issue {
    pub issue: String,
    #[serde(default)]
    pub severity: Option<String>,
}

/// 写真1枚分の解析結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoAnalysisRecord {
    pub image_index: usize,
    #[serde(default)]
    pub image_url: String,
    #[serde(default = "default_room_type")]
    pub room_type: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub characteristics: Vec<String>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub lighting: Option<String>,
    #[serde(default)]
    pub renovation_need: Option<String>,
    #[serde(default)]
    pub clutter_level: Option<String>,
    #[serde(default)]
    pub is_habitable: Option<bool>,
    /// 同じ部屋と判定された写真のインデックス
    #[serde(default)]
    pub same_room_as: BTreeSet<usize>,
    #[serde(default)]
    pub is_duplicate: bool,
    #[serde(default)]
    pub source: AnalysisSource,
    /// モデル出力の生フィールド（型付け済み）
    #[serde(default)]
    pub fields: AnalysisFields,
}

fn default_room_type() -> String {
    OTHER_ROOM_TYPE.to_string()
}

impl PhotoAnalysisRecord {
    /// 応答が得られなかった写真用
    pub fn placeholder(image_index: usize, image_url: impl Into<String>) -> Self {
        Self {
            image_index,
            image_url: image_url.into(),
            room_type: default_room_type(),
            confidence: None,
            characteristics: Vec::new(),
            issues: Vec::new(),
            condition: None,
            style: None,
            lighting: None,
            renovation_need: None,
            clutter_level: None,
            is_habitable: None,
            same_room_as: BTreeSet::new(),
            is_duplicate: false,
            source: AnalysisSource::Default,
            fields: AnalysisFields::default(),
        }
    }

    /// モデル出力のオブジェクトから生成
    ///
    /// 一括用・単体用どちらのキー体系も受け付ける。
    /// 必須キーが欠けていてもデフォルト値で埋めて返す。
    pub fn from_model_output(
        image_index: usize,
        image_url: impl Into<String>,
        obj: &Map<String, Value>,
        source: AnalysisSource,
    ) -> Self {
        let mut record = Self::placeholder(image_index, image_url);
        record.source = source;

        let room_type = first_str(obj, &["room_type", "identified_room_type_id", "room_type_id"])
            .map(|s| s.trim().to_lowercase());
        let room = room_type.as_deref().and_then(|id| ROOM_TYPES.iter().find(|r| r.id == id));
        record.room_type = room.map(|r| r.id).unwrap_or(OTHER_ROOM_TYPE).to_string();

        record.confidence = first_value(obj, &["confidence_score", "confidence"]).and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        record.characteristics = first_value(obj, &["main_characteristics", "features", "characteristics"])
            .map(string_list)
            .unwrap_or_default();
        record.issues = first_value(obj, &["potential_issues", "visible_issues", "issues"])
            .map(issue_list)
            .unwrap_or_default();
        record.condition = first_str(obj, &["condition", "estimated_condition"]).map(String::from);
        record.style = first_str(obj, &["style"]).map(String::from).or_else(|| {
            first_value(obj, &["dominant_style_elements"])
                .map(string_list)
                .and_then(|styles| styles.into_iter().next())
        });
        record.lighting = first_str(obj, &["lighting", "lighting_quality"]).map(String::from);
        record.renovation_need = first_str(
            obj,
            &["estimated_renovation_need", "renovation_need_impression", "renovation_need"],
        )
        .map(String::from);
        record.clutter_level = first_str(obj, &["clutter_level"]).map(String::from);
        record.is_habitable = first_value(obj, &["is_likely_habitable", "is_habitable"])
            .and_then(|v| match v {
                Value::Bool(b) => Some(*b),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "yes" => Some(true),
                    "false" | "no" => Some(false),
                    _ => None,
                },
                _ => None,
            })
            .or_else(|| room.map(|r| r.is_habitable));
        record.same_room_as = obj
            .get("same_room_as")
            .map(|v| same_room_indices(v, image_index))
            .unwrap_or_default();
        record.fields = AnalysisFields::from(obj.clone());
        record
    }

    /// より若いインデックスの写真と同室リンクを持つか
    pub fn links_to_earlier(&self) -> bool {
        self.same_room_as.iter().any(|&other| other < self.image_index)
    }
}

fn first_value<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !is_unset(v))
}

fn first_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn issue_list(value: &Value) -> Vec<Issue> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(Issue {
                issue: s.clone(),
                severity: None,
            }),
            Value::Object(obj) => obj.get("issue").and_then(Value::as_str).map(|issue| Issue {
                issue: issue.to_string(),
                severity: obj.get("severity").and_then(Value::as_str).map(String::from),
            }),
            _ => None,
        })
        .collect()
}

/// same_room_as の要素は整数、または image_index/index/id を持つオブジェクト
fn same_room_indices(value: &Value, own_index: usize) -> BTreeSet<usize> {
    let Value::Array(items) = value else {
        return BTreeSet::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Number(n) => n.as_u64(),
            Value::Object(obj) => ["image_index", "index", "id"]
                .iter()
                .find_map(|k| obj.get(*k))
                .and_then(Value::as_u64),
            _ => None,
        })
        .map(|i| i as usize)
        .filter(|&i| i != own_index)
        .collect()
}
