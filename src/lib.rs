//! Listing AI
//!
//! 掲載データの多ソース統合と、掲載写真のAI解析・特徴量生成

pub mod cache;
pub mod cli;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod fetcher;
pub mod geocode;
pub mod logging;
pub mod model_holder;
pub mod orchestrator;
pub mod pipeline;
pub mod reconciler;
pub mod sources;
pub mod testing;
pub mod vision;
