//! フィールドエイリアスモジュール
//!
//! ソースごとに異なるキー表記を正規のフィールド名へ寄せる。

use crate::error::{Error, Result};
use crate::types::{is_unset, PartialRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 正規フィールド名 → ソース別の表記（優先順）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldAliasTable {
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<String>>,
}

impl FieldAliasTable {
    /// 組み込みの掲載用テーブル
    pub fn listing_preset() -> Self {
        let mut table = Self::default();

        table.add("floor", &["floor", "floorLevel", "floor_no", "poziom"]);
        table.add("total_floors", &["total_floors", "totalFloors", "floorsTotal", "floors_num"]);
        table.add("year_built", &["year_built", "constructionYear", "yearOfConstruction", "build_year", "rokBudowy"]);
        table.add("building_type", &["building_type", "buildingType", "buildingtype"]);
        table.add("condition", &["condition", "construction_status", "stan"]);
        table.add("parking_spaces", &["parking_spaces", "parkingCount", "parkingSpaces"]);
        table.add("balcony_area", &["balcony_area", "balconyArea", "balconyarea"]);
        table.add("heating_type", &["heating_type", "heatingType", "heating", "heatType"]);

        // 所在地
        table.add("street_name", &["street_name", "streetName", "street"]);
        table.add("city_name", &["city_name", "cityName", "city"]);
        table.add("latitude", &["latitude", "lat"]);
        table.add("longitude", &["longitude", "lon", "lng"]);

        // 基本情報
        table.add("price", &["price", "totalPrice"]);
        table.add("area", &["area", "surface", "areaInSquareMeters"]);
        table.add("rooms", &["rooms", "roomsNum", "rooms_num"]);
        table.add("date_created", &["date_created", "dateCreated", "created_at", "createdAt"]);

        table
    }

    /// JSONファイルから読み込み
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// JSON文字列から読み込み
    ///
    /// 空のテーブルや表記のないフィールドは設定ミスとして扱う。
    pub fn from_json(json: &str) -> Result<Self> {
        let table: Self = serde_json::from_str(json)?;
        if table.fields.is_empty() {
            return Err(Error::Alias("fields が空です".into()));
        }
        if let Some((canonical, _)) = table
            .fields
            .iter()
            .find(|(_, spellings)| spellings.iter().all(|s| s.trim().is_empty()))
        {
            return Err(Error::Alias(format!("{} の表記がありません", canonical)));
        }
        Ok(table)
    }

    fn add(&mut self, canonical: &str, spellings: &[&str]) {
        self.fields.insert(
            canonical.to_string(),
            spellings.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// 設定をマージ（後から追加した設定が優先）
    pub fn merge(&mut self, other: &FieldAliasTable) {
        self.fields.extend(other.fields.clone());
    }

    /// 正規名で値を引く（最初に見つかった設定済みの表記）
    pub fn lookup<'a>(&self, canonical: &str, raw: &'a PartialRecord) -> Option<&'a Value> {
        match self.fields.get(canonical) {
            Some(spellings) => spellings
                .iter()
                .filter_map(|s| raw.get(s))
                .find(|v| !is_unset(v)),
            None => raw.get(canonical).filter(|v| !is_unset(v)),
        }
    }

    /// 生レコードのキーを正規名へ変換
    ///
    /// エイリアス表記は取り除き、正規名に最初の設定済みの値を入れる。
    /// テーブルにないキーはそのまま残す。
    pub fn translate(&self, raw: &PartialRecord) -> PartialRecord {
        let mut out = raw.clone();
        for (canonical, spellings) in &self.fields {
            let value = self.lookup(canonical, raw).cloned();
            for spelling in spellings {
                out.remove(spelling);
            }
            if let Some(value) = value {
                out.insert(canonical.clone(), value);
            }
        }
        out
    }
}
