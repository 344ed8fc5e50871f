use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::semantic::{DEFAULT_EMBEDDING_DIM, DEFAULT_MODEL_ID};

#[derive(Parser, Debug)]
#[command(
    name = "mao-advisor",
    version,
    about = "Inverse recipe recommendation for micro-arc-oxidation thermal-control coatings"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Space(SpaceArgs),
    Corpus(CorpusArgs),
    Train(TrainArgs),
    Recommend(RecommendArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SpaceArgs {
    #[arg(long)]
    pub system: Option<String>,

    #[arg(long)]
    pub bounds_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CorpusArgs {
    #[arg(long, default_value = ".cache/mao-advisor")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// JSONL file of `{source_id, page, text}` passages.
    #[arg(long)]
    pub passages_path: PathBuf,

    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIM)]
    pub dimensions: usize,
}

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    #[arg(long, default_value = ".cache/mao-advisor")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// JSONL file of measured experiments. Omit to retrain from stored rows only.
    #[arg(long)]
    pub feedback_path: Option<PathBuf>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputMode {
    Pretty,
    Compact,
}

#[derive(Args, Debug, Clone)]
pub struct RecommendArgs {
    #[arg(long, default_value = ".cache/mao-advisor")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Full request as JSON. Flags below override its fields.
    #[arg(long)]
    pub request_path: Option<PathBuf>,

    #[arg(long)]
    pub system: Option<String>,

    #[arg(long)]
    pub target_alpha: Option<f64>,

    #[arg(long)]
    pub target_epsilon: Option<f64>,

    #[arg(long)]
    pub n: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub notes: Option<String>,

    /// `slot_id=answer`, repeatable; repeated slots become follow-up attempts.
    #[arg(long = "answer")]
    pub answers: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub best_effort: bool,

    #[arg(long)]
    pub bounds_path: Option<PathBuf>,

    #[arg(long)]
    pub weights_path: Option<PathBuf>,

    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[arg(long)]
    pub max_retries: Option<u32>,

    #[arg(long)]
    pub concurrency: Option<usize>,

    #[arg(long)]
    pub top_k: Option<usize>,

    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIM)]
    pub dimensions: usize,

    #[arg(long, value_enum, default_value_t = OutputMode::Pretty)]
    pub output: OutputMode,

    #[arg(long, default_value_t = false)]
    pub no_persist: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/mao-advisor")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, default_value_t = 5)]
    pub recent: usize,

    /// Print one stored batch as JSON instead of the summary.
    #[arg(long)]
    pub batch_id: Option<String>,
}
