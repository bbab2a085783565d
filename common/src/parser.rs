//! モデルレスポンスパーサー
//!
//! 視覚言語モデルのテキスト応答からJSONを抽出し、
//! 一括解析・単体解析・比較の結果をパースする

use crate::error::{Error, Result};
use serde_json::{Map, Value};

/// ```json ... ``` ブロックの中身
fn fenced_block(response: &str) -> Option<&str> {
    let start = response.find("```json")? + 7; // "```json" の長さ
    let end = start + response[start..].find("```")?;
    Some(response[start..end].trim())
}

/// レスポンスからJSON配列部分を抽出
///
/// 抽出優先順位:
/// 1. ```json ... ``` ブロック
/// 2. 最初の `[` から最後の `]` まで
/// 3. エラー
///
/// # Examples
/// ```
/// use listing_ai_common::extract_json;
///
/// let response = "Result: [{\"room_type\": \"kitchen\"}] done";
/// let json = extract_json(response).unwrap();
/// assert_eq!(json, "[{\"room_type\": \"kitchen\"}]");
/// ```
pub fn extract_json(response: &str) -> Result<&str> {
    if let Some(block) = fenced_block(response) {
        return Ok(block);
    }

    if let Some(start) = response.find('[') {
        if let Some(end) = response.rfind(']') {
            if end >= start {
                return Ok(&response[start..=end]);
            }
        }
    }

    Err(Error::Parse("JSONが見つかりません".into()))
}

/// レスポンスからJSONオブジェクト部分を抽出
pub fn extract_json_object(response: &str) -> Result<&str> {
    if let Some(block) = fenced_block(response) {
        return Ok(block);
    }

    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            if end >= start {
                return Ok(&response[start..=end]);
            }
        }
    }

    Err(Error::Parse("JSONオブジェクトが見つかりません".into()))
}

/// 一括解析レスポンスをパース
///
/// 配列中のオブジェクト以外の要素は捨てる。
/// `{"image_analyses": [...]}` 形式も受け付ける。
pub fn parse_batch_response(response: &str) -> Result<Vec<Map<String, Value>>> {
    let value: Value = match extract_json(response) {
        Ok(json_str) => serde_json::from_str(json_str.trim())
            .map_err(|e| Error::Parse(format!("一括解析 JSONパースエラー: {}", e)))?,
        Err(_) => {
            let json_str = extract_json_object(response)?;
            serde_json::from_str(json_str.trim())
                .map_err(|e| Error::Parse(format!("一括解析 JSONパースエラー: {}", e)))?
        }
    };

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("image_analyses") {
            Some(Value::Array(items)) => items,
            _ => return Err(Error::Parse("一括解析の結果が配列ではありません".into())),
        },
        _ => return Err(Error::Parse("一括解析の結果が配列ではありません".into())),
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(obj) => Some(obj),
            _ => None,
        })
        .collect())
}

/// 単体解析レスポンスをパース
pub fn parse_single_response(response: &str) -> Result<Map<String, Value>> {
    let json_str = extract_json_object(response)?;
    match serde_json::from_str(json_str.trim()) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(_) => Err(Error::Parse("単体解析の結果がオブジェクトではありません".into())),
        Err(e) => Err(Error::Parse(format!("単体解析 JSONパースエラー: {}", e))),
    }
}

/// 比較レスポンスを判定
///
/// 明確な肯定（"yes" / "oui"）のみ true。曖昧な応答は false。
pub fn parse_same_room_answer(response: &str) -> bool {
    let answer = response
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '!')
        .trim()
        .to_lowercase();
    matches!(answer.as_str(), "yes" | "oui")
}
