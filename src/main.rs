use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use listing_ai_common::{FeatureAggregator, FeatureVector, FieldAliasTable};
use listing_ai_rust::cache::{CacheFile, FileBackend, ResponseCache};
use listing_ai_rust::cli::{Cli, Commands};
use listing_ai_rust::config::Config;
use listing_ai_rust::fetcher::{RateLimitedFetcher, ReqwestTransport};
use listing_ai_rust::geocode::NominatimGeocoder;
use listing_ai_rust::model_holder::{JsonModelLoader, LinearPriceModel, ModelHolder};
use listing_ai_rust::orchestrator::EnrichmentOrchestrator;
use listing_ai_rust::pipeline::{ListingAnalysis, PhotoPipeline};
use listing_ai_rust::reconciler::SourceReconciler;
use listing_ai_rust::sources::{default_strategies, FeedSource, SourceContext};
use listing_ai_rust::vision::{GeminiModel, VisionAnalysisClient};
use listing_ai_rust::logging;
use rayon::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let config = Config::load()?;

    match cli.command {
        Commands::Enrich { ids, feed, output, workers, feed_only, alias } => {
            println!("🏠 listing-ai - 掲載データ統合\n");

            let mut config = config;
            if let Some(workers) = workers {
                config.orchestrator.workers = workers;
            }
            if feed_only {
                config.sources.enable_detail_fetch = false;
            }
            if alias.is_some() {
                config.sources.alias_file = alias;
            }

            // 1. フィード読み込み
            let feed = match &feed {
                Some(path) => {
                    println!("[1/3] フィードを読み込み中...");
                    let feed = FeedSource::from_file(path)?;
                    println!("✔ {}件の掲載を読み込み\n", feed.len());
                    Some(feed)
                }
                None => None,
            };

            let ids = if ids.is_empty() {
                feed.as_ref().map(|f| f.ids().to_vec()).unwrap_or_default()
            } else {
                ids
            };
            if ids.is_empty() {
                bail!("掲載IDがありません（IDを指定するか --feed を指定してください）");
            }

            // 2. 統合
            println!("[2/3] {}件を統合中...", ids.len());
            let cache = ResponseCache::connect(
                Arc::new(FileBackend::open(config.cache.resolve_dir()?)),
                Duration::from_secs(config.cache.default_ttl_secs),
            )
            .await;
            let reconciler = build_reconciler(&config, cache.clone(), feed)?;
            let cancel = cancel_on_ctrl_c();
            let orchestrator = EnrichmentOrchestrator::new(Arc::new(reconciler), &config.orchestrator)
                .with_cancellation(cancel);

            let progress = ProgressBar::new(ids.len() as u64);
            progress.set_style(
                ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            let mut report = orchestrator
                .enrich_all_with_progress(ids, |listing_id, _| {
                    progress.set_message(listing_id.to_string());
                    progress.inc(1);
                })
                .await;
            progress.finish_and_clear();
            cache.flush().await;
            report.sort_by_id();
            println!(
                "✔ 成功 {}件 / 失敗 {}件\n",
                report.success_count(),
                report.failure_count()
            );
            for failure in &report.failed {
                println!("  ✗ {}: {}", failure.listing_id, failure.error);
            }

            // 3. 保存
            println!("[3/3] 結果を保存中...");
            let json = serde_json::to_string_pretty(&report)?;
            write_or_print(output.as_deref(), &json)?;

            println!("\n✅ 統合完了");
        }

        Commands::Analyze {
            listing_id,
            urls,
            output,
            batch_size,
            single,
            no_compare,
            no_summary,
        } => {
            println!("📸 listing-ai - 写真解析\n");

            let api_key = config.get_api_key()?;
            let mut vision_config = config.vision.clone();
            if let Some(batch_size) = batch_size {
                vision_config.batch_size = batch_size;
            }
            vision_config.single_image_mode |= single;
            if no_compare {
                vision_config.duplicate_detection = false;
            }
            if no_summary {
                vision_config.text_summary = false;
            }

            let fetcher = Arc::new(RateLimitedFetcher::with_reqwest(config.fetch.clone()));
            let model = GeminiModel::new(
                Arc::new(ReqwestTransport::new()),
                vision_config.endpoint.clone(),
                vision_config.model.clone(),
                api_key,
            );
            let vision = Arc::new(VisionAnalysisClient::new(Arc::new(model), vision_config));
            let pipeline = PhotoPipeline::new(fetcher, vision);

            println!("[1/2] {}枚の写真を解析中...", urls.len());
            let analysis = pipeline.analyze_listing(&listing_id, &urls).await;
            println!(
                "✔ {}枚解析 / 取得失敗 {}枚 / 部屋 {} / 重複 {}\n",
                analysis.records.len(),
                analysis.failed_images.len(),
                analysis.composites.unique_rooms_detected,
                analysis.composites.duplicate_images_found
            );

            println!("[2/2] 結果を保存中...");
            let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.analysis.json", listing_id)));
            std::fs::write(&output, serde_json::to_string_pretty(&analysis)?)?;
            println!("✔ 結果を保存: {}", output.display());

            println!("\n✅ 解析完了");
        }

        Commands::Features { inputs, output } => {
            println!("🧮 listing-ai - 特徴量再計算\n");

            let aggregator = FeatureAggregator::new();
            let results: Vec<Result<ListingAnalysis>> = inputs
                .par_iter()
                .map(|path| {
                    let content = std::fs::read_to_string(path)
                        .with_context(|| format!("読み込み失敗: {}", path.display()))?;
                    let analysis: ListingAnalysis = serde_json::from_str(&content)
                        .with_context(|| format!("解析結果の形式が不正: {}", path.display()))?;
                    Ok(analysis.recompute(&aggregator))
                })
                .collect();

            let mut features = BTreeMap::new();
            for result in results {
                let analysis = result?;
                features.insert(analysis.listing_id, analysis.features);
            }
            println!("✔ {}件の特徴量を計算", features.len());

            write_or_print(output.as_deref(), &serde_json::to_string_pretty(&features)?)?;
        }

        Commands::Predict { model, input } => {
            let holder = ModelHolder::<LinearPriceModel>::new(Arc::new(JsonModelLoader::new(model)));
            holder.refresh_now().await?;
            let Some(model) = holder.current() else {
                bail!("モデルが読み込まれていません");
            };

            let content = std::fs::read_to_string(&input)
                .with_context(|| format!("読み込み失敗: {}", input.display()))?;
            let value: Value = serde_json::from_str(&content)?;
            for (listing_id, features) in feature_vectors(value)? {
                println!("{}: {:.2}", listing_id, model.predict(&features));
            }
        }

        Commands::Config { set_api_key, show } => {
            let mut config = config;

            if let Some(key) = set_api_key {
                config.set_api_key(key)?;
                println!("✔ APIキーを設定しました");
            }

            if show {
                println!("設定:");
                println!("  モデル: {}", config.vision.model);
                println!("  バッチサイズ: {}", config.vision.batch_size);
                println!("  最大画像サイズ: {}px", config.vision.max_image_edge);
                println!("  リクエスト間隔: {}ms", config.fetch.rate_limit_ms);
                println!("  並列数: {}", config.orchestrator.workers);
                println!("  プロキシ: {}件", config.fetch.proxies.len());
                println!(
                    "  詳細取得: {}",
                    if config.sources.enable_detail_fetch { "有効" } else { "無効" }
                );
                println!(
                    "  APIキー: {}",
                    if config.get_api_key().is_ok() { "設定済み" } else { "未設定" }
                );
            }
        }

        Commands::Cache { clear, info } => {
            let dir = config.cache.resolve_dir()?;
            let cache_path = CacheFile::cache_path(&dir);

            if info || !clear {
                if cache_path.exists() {
                    let cache = CacheFile::load(&dir);
                    println!("キャッシュ情報:");
                    println!("  パス: {}", cache_path.display());
                    println!("  件数: {}", cache.len());
                    if let Ok(meta) = std::fs::metadata(&cache_path) {
                        println!("  サイズ: {} bytes", meta.len());
                    }
                } else {
                    println!("キャッシュファイルが存在しません: {}", cache_path.display());
                }
            }

            if clear {
                match CacheFile::clear(&dir) {
                    Ok(true) => println!("✔ キャッシュを削除しました: {}", cache_path.display()),
                    Ok(false) => println!("キャッシュファイルが存在しません"),
                    Err(e) => println!("キャッシュ削除エラー: {}", e),
                }
            }
        }
    }

    Ok(())
}

fn build_reconciler(
    config: &Config,
    cache: ResponseCache,
    feed: Option<FeedSource>,
) -> Result<SourceReconciler> {
    let fetcher = Arc::new(RateLimitedFetcher::with_reqwest(config.fetch.clone()));

    let mut aliases = FieldAliasTable::listing_preset();
    if let Some(path) = &config.sources.alias_file {
        aliases.merge(&FieldAliasTable::from_file(path)?);
    }

    let geocoder = NominatimGeocoder::new(
        fetcher.clone(),
        cache.clone(),
        &config.sources,
        Duration::from_secs(config.cache.geo_ttl_secs),
    );
    let context = Arc::new(SourceContext {
        fetcher,
        cache,
        sources: config.sources.clone(),
        cache_config: config.cache.clone(),
    });

    Ok(SourceReconciler::new(default_strategies(context, feed))
        .with_aliases(aliases)
        .with_geocoder(Arc::new(geocoder))
        .with_detail_fetch(config.sources.enable_detail_fetch))
}

/// Ctrl-C で処理中の掲載を打ち切る
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n中断します...");
            child.cancel();
        }
    });
    token
}

fn write_or_print(output: Option<&Path>, json: &str) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, json)?;
            println!("✔ 結果を保存: {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// 解析結果1件、または `features` の出力（掲載ID → 特徴量）を受け付ける
fn feature_vectors(value: Value) -> Result<Vec<(String, FeatureVector)>> {
    if value.get("features").is_some() && value.get("listing_id").is_some() {
        let analysis: ListingAnalysis = serde_json::from_value(value)?;
        return Ok(vec![(analysis.listing_id, analysis.features)]);
    }
    let map: BTreeMap<String, FeatureVector> =
        serde_json::from_value(value).context("特徴量の形式が不正です")?;
    Ok(map.into_iter().collect())
}
