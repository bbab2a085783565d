use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "listing-ai")]
#[command(about = "不動産掲載データの多ソース統合・写真AI解析・特徴量生成ツール", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 詳細ログを出力
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 掲載IDごとに各ソースから項目を集めて統合
    Enrich {
        /// 掲載ID（省略時はフィードの全件）
        ids: Vec<String>,

        /// 一次フィードのJSONファイル（掲載オブジェクトの配列）
        #[arg(short, long)]
        feed: Option<PathBuf>,

        /// 出力JSONファイル（省略時は標準出力）
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 並列数（設定ファイルの値を上書き）
        #[arg(short, long)]
        workers: Option<usize>,

        /// フィードのみ使用（詳細ソースを呼ばない）
        #[arg(long)]
        feed_only: bool,

        /// カスタムエイリアスファイル（JSON）
        #[arg(long)]
        alias: Option<PathBuf>,
    },

    /// 掲載写真をAI解析して特徴量を出力
    Analyze {
        /// 掲載ID
        #[arg(short, long)]
        listing_id: String,

        /// 写真URL（掲載順）
        #[arg(required = true)]
        urls: Vec<String>,

        /// 出力JSONファイル（省略時は <掲載ID>.analysis.json）
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 一括リクエストあたりの枚数
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// 1枚ずつ解析する
        #[arg(long)]
        single: bool,

        /// 同室比較の問い合わせをしない
        #[arg(long)]
        no_compare: bool,

        /// 紹介文をモデルに書かせず定型文にする
        #[arg(long)]
        no_summary: bool,
    },

    /// 保存済みの解析結果から特徴量を再計算
    Features {
        /// 解析結果JSONファイル
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// 出力JSONファイル（省略時は標準出力）
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// 特徴量から価格を推定
    Predict {
        /// 線形モデルJSONファイル
        #[arg(short, long)]
        model: PathBuf,

        /// 特徴量JSONファイル（features の出力、または解析結果）
        #[arg(required = true)]
        input: PathBuf,
    },

    /// 設定を表示/編集
    Config {
        /// APIキーを設定
        #[arg(long)]
        set_api_key: Option<String>,

        /// 設定を表示
        #[arg(long)]
        show: bool,
    },

    /// キャッシュ管理
    Cache {
        /// キャッシュを削除
        #[arg(long)]
        clear: bool,

        /// キャッシュ情報を表示
        #[arg(long)]
        info: bool,
    },
}
