//! Listing AI Common Library
//!
//! 掲載データの型・正規化・写真解析結果の集約など、I/Oを伴わない共通処理

pub mod types;
pub mod alias;
pub mod error;
pub mod normalize;
pub mod parser;
pub mod prompts;
pub mod aggregate;
pub mod features;

pub use types::{
    is_unset, AnalysisFields, AnalysisSource, FieldValue, Issue, ListItem, ListingRecord,
    PartialRecord, PhotoAnalysisRecord, ScalarValue, OTHER_ROOM_TYPE,
};
pub use alias::FieldAliasTable;
pub use error::{Error, Result};
pub use normalize::{derive_city_name, fill_missing_fields, normalize_listing_fields, normalize_street};
pub use parser::{extract_json, parse_batch_response, parse_same_room_answer, parse_single_response};
pub use prompts::{build_batch_prompt, build_comparison_prompt, build_single_prompt, build_summary_prompt, room_type_by_id, RoomType, ROOM_TYPES};
pub use aggregate::{slugify, AggregatedMetrics, FeatureAggregator, FrequencyCounter, MetricValue};
pub use features::{FeatureVector, ListingComposites, PropertySummary};
