//! 掲載フィールドの正規化
//!
//! - 整数フィールド: 単位などを除いて先頭の整数を採用
//! - 小数フィールド: カンマ小数点をドットに変換
//! - 欠損フィールドの補完（市区名・画像・個人出品フラグ）

use crate::types::ListingRecord;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

/// 整数として扱うフィールド
pub const INT_FIELDS: &[&str] = &["floor", "total_floors", "year_built", "parking_spaces", "rooms"];

/// 小数として扱うフィールド
pub const FLOAT_FIELDS: &[&str] = &["balcony_area", "area"];

/// 個人出品を表す seller_type
const PRIVATE_SELLER_TYPES: &[&str] = &["private", "osoba prywatna", "prywatny"];

lazy_static! {
    static ref INT_PATTERN: Regex = Regex::new(r"-?\d+").unwrap();
    static ref FLOAT_PATTERN: Regex = Regex::new(r"-?\d+(?:\.\d+)?").unwrap();
    static ref GROUND_FLOOR: Regex = Regex::new(r"(?i)^(ground(_|\s)?floor|parter)$").unwrap();
    static ref STREET_PREFIX: Regex =
        Regex::new(r"(?i)^\s*(ul\.|al\.|os\.|pl\.|(ulica|aleja|osiedle|plac)\b)\s*").unwrap();
    static ref MULTI_SPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// 整数っぽい値を整数に変換
///
/// "3" → 3, "3 piętro" → 3, 4.0 → 4。解釈できなければ None。
pub fn parse_int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            if GROUND_FLOOR.is_match(trimmed) {
                return Some(0);
            }
            INT_PATTERN
                .find(trimmed)
                .and_then(|m| m.as_str().parse().ok())
        }
        _ => None,
    }
}

/// 小数っぽい値を小数に変換
///
/// "10,3" → 10.3, "1 200,5 m²" → 1200.5
pub fn parse_float_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let compact: String = s
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| if c == ',' { '.' } else { c })
                .collect();
            FLOAT_PATTERN
                .find(&compact)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .filter(|f| f.is_finite())
        }
        _ => None,
    }
}

/// 型正規化
///
/// 解釈できない値は元のまま残す。
pub fn normalize_listing_fields(record: &mut ListingRecord) {
    for field in INT_FIELDS {
        if let Some(parsed) = record.get(field).and_then(parse_int_value) {
            record.set(*field, Value::from(parsed));
        }
    }
    for field in FLOAT_FIELDS {
        if let Some(parsed) = record.get(field).and_then(parse_float_value) {
            if let Some(number) = serde_json::Number::from_f64(parsed) {
                record.set(*field, Value::Number(number));
            }
        }
    }
}

/// 自由記述の所在地から市区名を推定
///
/// カンマ区切りを後ろから見て、3文字以上かつ大文字始まりの最初の要素を採用する。
pub fn derive_city_name(location: &str) -> Option<String> {
    location
        .split(',')
        .rev()
        .map(str::trim)
        .find(|part| {
            part.chars().count() > 2 && part.chars().next().is_some_and(char::is_uppercase)
        })
        .map(String::from)
}

/// 欠損フィールドを他フィールドから補完
pub fn fill_missing_fields(record: &mut ListingRecord) {
    if !record.is_set("city_name") {
        if let Some(city) = record.get_str("location_string").and_then(derive_city_name) {
            record.set("city_name", Value::String(city));
        }
    }

    if !record.is_set("images") && record.is_set("image_urls") {
        if let Some(urls) = record.get("image_urls").cloned() {
            record.set("images", urls);
        }
    }

    if !record.is_set("is_private_owner") {
        if let Some(seller) = record.get_str("seller_type") {
            let seller = seller.trim().to_lowercase();
            let is_private = PRIVATE_SELLER_TYPES.contains(&seller.as_str());
            record.set("is_private_owner", Value::Bool(is_private));
        }
    }
}

/// ジオコーディング用に通り名を整形
///
/// "ul. Legnicka 12/4" → "Legnicka 12 4"
pub fn normalize_street(street: &str) -> String {
    let stripped = STREET_PREFIX.replace(street, "");
    let replaced = stripped.replace('/', " ");
    MULTI_SPACE.replace_all(replaced.trim(), " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_with(key: &str, value: Value) -> ListingRecord {
        let mut record = ListingRecord::new("1");
        record.set(key, value);
        record
    }

    // =============================================
    // normalize_listing_fields テスト
    // =============================================

    #[test]
    fn test_floor_string_to_int() {
        let mut record = record_with("floor", json!("3"));
        normalize_listing_fields(&mut record);
        assert_eq!(record.get("floor"), Some(&json!(3)));
    }

    #[test]
    fn test_int_with_unit() {
        let mut record = record_with("year_built", json!("1975 r."));
        normalize_listing_fields(&mut record);
        assert_eq!(record.get("year_built"), Some(&json!(1975)));
    }

    #[test]
    fn test_ground_floor() {
        let mut record = record_with("floor", json!("parter"));
        normalize_listing_fields(&mut record);
        assert_eq!(record.get("floor"), Some(&json!(0)));
    }

    #[test]
    fn test_balcony_comma_decimal() {
        let mut record = record_with("balcony_area", json!("10,3"));
        normalize_listing_fields(&mut record);
        let area = record.get_f64("balcony_area").expect("小数に変換されるべき");
        assert!((area - 10.3).abs() < 1e-9);
    }

    #[test]
    fn test_area_with_thousands_and_unit() {
        assert_eq!(parse_float_value(&json!("1 200,5 m²")), Some(1200.5));
    }

    #[test]
    fn test_unparseable_value_left_unchanged() {
        let mut record = record_with("floor", json!("poddasze"));
        normalize_listing_fields(&mut record);
        assert_eq!(record.get("floor"), Some(&json!("poddasze")));
    }

    // =============================================
    // derive_city_name / fill_missing_fields テスト
    // =============================================

    #[test]
    fn test_derive_city_name() {
        assert_eq!(
            derive_city_name("ul. Legnicka, Fabryczna, Wrocław, dolnośląskie").as_deref(),
            Some("Wrocław")
        );
        assert_eq!(derive_city_name("a, bb, ccc"), None);
        assert_eq!(derive_city_name(""), None);
    }

    #[test]
    fn test_fill_missing_city_and_images() {
        let mut record = ListingRecord::new("1");
        record.set("location_string", json!("Krzyki, Wrocław, dolnośląskie"));
        record.set("image_urls", json!(["http://img/1.jpg"]));
        record.set("seller_type", json!("Osoba prywatna"));
        fill_missing_fields(&mut record);

        assert_eq!(record.get_str("city_name"), Some("Wrocław"));
        assert_eq!(record.get("images"), Some(&json!(["http://img/1.jpg"])));
        assert_eq!(record.get("is_private_owner"), Some(&json!(true)));
    }

    #[test]
    fn test_fill_missing_keeps_existing_city() {
        let mut record = ListingRecord::new("1");
        record.set("city_name", json!("Kraków"));
        record.set("location_string", json!("Wrocław"));
        fill_missing_fields(&mut record);
        assert_eq!(record.get_str("city_name"), Some("Kraków"));
    }

    #[test]
    fn test_fill_missing_without_sources_stays_unset() {
        let mut record = ListingRecord::new("1");
        fill_missing_fields(&mut record);
        assert!(!record.is_set("city_name"));
        assert!(!record.is_set("is_private_owner"));
    }

    #[test]
    fn test_normalize_street() {
        assert_eq!(normalize_street("ul. Legnicka 12/4"), "Legnicka 12 4");
        assert_eq!(normalize_street("Aleja  Armii Krajowej"), "Armii Krajowej");
        assert_eq!(normalize_street("Świdnicka"), "Świdnicka");
        assert_eq!(normalize_street("Placowa 5"), "Placowa 5");
    }
}
