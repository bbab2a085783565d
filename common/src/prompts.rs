//! プロンプト生成モジュール
//!
//! 視覚言語モデルへ送るプロンプトを生成する:
//! - ROOM_TYPES: 部屋タイプの定数カタログ
//! - build_batch_prompt: 複数画像の一括解析用
//! - build_single_prompt: 1枚ずつの解析用
//! - build_comparison_prompt: 2枚が同じ部屋かの比較用
//! - build_summary_prompt: 解析結果からの物件紹介文（画像なし）

/// 部屋タイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomType {
    pub id: &'static str,
    pub name: &'static str,
    /// 居室として数えるか
    pub is_habitable: bool,
}

/// 部屋タイプカタログ（モデルはこのIDのみを返す）
pub const ROOM_TYPES: &[RoomType] = &[
    RoomType { id: "living_room", name: "Living Room", is_habitable: true },
    RoomType { id: "bedroom", name: "Bedroom", is_habitable: true },
    RoomType { id: "kids_room", name: "Kids Room", is_habitable: true },
    RoomType { id: "office", name: "Home Office", is_habitable: true },
    RoomType { id: "dining_room", name: "Dining Room", is_habitable: true },
    RoomType { id: "kitchen", name: "Kitchen", is_habitable: false },
    RoomType { id: "bathroom", name: "Bathroom", is_habitable: false },
    RoomType { id: "toilet", name: "Toilet", is_habitable: false },
    RoomType { id: "hallway", name: "Hallway", is_habitable: false },
    RoomType { id: "wardrobe", name: "Walk-in Wardrobe", is_habitable: false },
    RoomType { id: "laundry", name: "Laundry Room", is_habitable: false },
    RoomType { id: "balcony", name: "Balcony / Terrace", is_habitable: false },
    RoomType { id: "garden", name: "Garden", is_habitable: false },
    RoomType { id: "garage", name: "Garage / Parking", is_habitable: false },
    RoomType { id: "basement", name: "Basement / Storage", is_habitable: false },
    RoomType { id: "building_exterior", name: "Building Exterior", is_habitable: false },
    RoomType { id: "floor_plan", name: "Floor Plan", is_habitable: false },
    RoomType { id: "other", name: "Other", is_habitable: false },
];

/// IDから部屋タイプを検索
pub fn room_type_by_id(id: &str) -> Option<&'static RoomType> {
    ROOM_TYPES.iter().find(|r| r.id == id)
}

/// 部屋タイプ一覧のプロンプト断片
fn room_types_section() -> String {
    let lines = ROOM_TYPES
        .iter()
        .map(|r| format!("- {}: {}", r.id, r.name))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Here is the list of valid room_type values you MUST use in JSON responses:\n{lines}")
}

/// 一括解析プロンプト生成
///
/// # Arguments
/// * `image_indices` - リクエストに含める画像のインデックス（送信順）
pub fn build_batch_prompt(image_indices: &[usize]) -> String {
    let room_types = room_types_section();
    let indices = image_indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"You are a professional real estate analyst. You will receive {count} photos of the same property, labelled with image indices {indices}.
Analyse every photo and keep your answers consistent across photos.

{room_types}

For each image assess:
1. Room type and how certain you are (High / Medium / Low); whether the room is multi-functional.
2. Repetition: has this physical room appeared in a previous image? List the earlier image indices in "same_room_as".
3. Condition: Excellent / Good / Fair / Poor.
4. Interior style (Modern, Minimalist, Scandinavian, Rustic, Classic, Industrial, Traditional, Contemporary, Other).
5. Natural lighting: Excellent / Good / Average / Poor.
6. Size: Small (<10m2), Medium (10-20m2), Large (>20m2).
7. Notable features (e.g. balcony access, kitchen island, built-in wardrobe).
8. Visible issues with severity Minor / Moderate / Major.
9. Clutter level: Minimal Clutter / Slight Clutter / Moderate Clutter / Heavy Clutter.
10. Estimated renovation need: None / Minor Cosmetic Updates / Moderate Renovation / Significant Renovation / Full Gut Renovation.
11. Overall impression score from 1 (very poor) to 5 (excellent).

Return ONLY a JSON array with one object per image:
[
  {{
    "image_index": 0,
    "room_type": "bedroom",
    "function_certainty": "High",
    "is_multi_functional": false,
    "same_room_as": [],
    "condition": "Good",
    "style": "Modern",
    "lighting": "Good",
    "size": "Medium",
    "features": ["Balcony access"],
    "visible_issues": [{{"issue": "Worn floor", "severity": "Minor"}}],
    "clutter_level": "Minimal Clutter",
    "estimated_renovation_need": "Minor Cosmetic Updates",
    "overall_impression_score": 4
  }}
]
Base every answer on visual evidence only. For room_type use ONLY the identifiers listed above."#,
        count = image_indices.len(),
    )
}

/// 単体解析プロンプト生成
pub fn build_single_prompt() -> String {
    let room_types = room_types_section();
    format!(
        r#"You are an expert real estate property assessor.
Analyse the provided photo of a room and return a single JSON object. Do not write any text outside the JSON object.

{room_types}

{{
  "identified_room_type_id": "string",
  "confidence_score": 0.0,
  "main_characteristics": ["string"],
  "potential_issues": [{{"issue": "string", "severity": "string"}}],
  "estimated_condition": "string",
  "dominant_style_elements": ["string"],
  "lighting_quality": "string",
  "renovation_need_impression": "string",
  "is_likely_habitable": true,
  "additional_notes": "string"
}}"#
    )
}

/// 2枚比較プロンプト生成
///
/// 回答は "yes" / "no" の1語のみを求める。
pub fn build_comparison_prompt() -> &'static str {
    r#"Compare these two photos and decide whether they show the SAME physical room.

Treat them as the same room when:
- the main furniture is identical or nearly identical
- the general layout matches
- windows, doors and architectural elements correspond
- only the camera angle differs

Answer with exactly one word: "yes" if it is the same room, "no" otherwise."#
}

/// 物件紹介文プロンプト生成
///
/// # Arguments
/// * `analysis_json` - 集約済みの解析結果（部屋数・状態・特徴・指摘事項）
pub fn build_summary_prompt(analysis_json: &str) -> String {
    format!(
        r#"Please act as an experienced real estate copywriter. Write a concise, factual description of the property (4-6 sentences) based only on the photo analysis data below.
Mention the rooms found, the overall condition and style, the most notable features, and any visible issues that a buyer should know about.
Do not invent facts that are not present in the data. Answer with plain text only, without headings or markdown.

Here is the property analysis data:
```json
{analysis_json}
```"#
    )
}
