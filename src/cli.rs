use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{
    DEFAULT_CACHE_ROOT, DEFAULT_ITERATIONS, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_SECS,
    DEFAULT_TIE_PRECISION, DEFAULT_TOP_N, DEFAULT_VECTOR_ITERATIONS, DEFAULT_VECTOR_MIN_COUNT,
    DEFAULT_VECTOR_SIZE,
};

#[derive(Parser, Debug)]
#[command(
    name = "reviewflow",
    version,
    about = "Staged review analysis pipeline with stochastic topic ranking"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Import(ImportArgs),
    Workflow(WorkflowArgs),
    Status(StatusArgs),
    Reset(ResetArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    #[arg(long, default_value = DEFAULT_CACHE_ROOT)]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub manifest: PathBuf,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RecrawlMode {
    Uncrawled,
    Failed,
}

impl RecrawlMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uncrawled => "uncrawled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct WorkflowArgs {
    /// Steps to run in order, e.g. `crawl_detail parse_detail analyze_reviews`.
    #[arg(required = true, value_name = "STEP")]
    pub steps: Vec<String>,

    #[arg(long, default_value = DEFAULT_CACHE_ROOT)]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long = "frsku")]
    pub frskus: Vec<String>,

    /// Training domain as `DOMAIN+SUBDOMAIN`.
    #[arg(long = "training")]
    pub training: Vec<String>,

    #[arg(long, value_enum)]
    pub recrawl: Option<RecrawlMode>,

    #[arg(long, default_value_t = false)]
    pub finished_crawling: bool,

    /// Skip the stage eligibility filter and operate on every matching record.
    #[arg(long, default_value_t = false)]
    pub ignore_params: bool,

    #[arg(long, default_value_t = false)]
    pub clear_db: bool,

    #[arg(long, default_value_t = false)]
    pub dump_to_csv: bool,

    #[arg(long)]
    pub merchant: Option<String>,

    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    pub iterations: usize,

    #[arg(long, default_value_t = DEFAULT_TIE_PRECISION)]
    pub tie_precision: usize,

    #[arg(long, default_value_t = DEFAULT_TOP_N)]
    pub top_n: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: usize,

    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_SECS)]
    pub retry_delay_secs: u64,

    #[arg(long, default_value_t = DEFAULT_VECTOR_SIZE)]
    pub vector_size: usize,

    #[arg(long, default_value_t = DEFAULT_VECTOR_ITERATIONS)]
    pub vector_iterations: usize,

    #[arg(long, default_value_t = DEFAULT_VECTOR_MIN_COUNT)]
    pub vector_min_count: usize,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub run_manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = DEFAULT_CACHE_ROOT)]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long = "frsku")]
    pub frskus: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ResetArgs {
    #[arg(long, default_value = DEFAULT_CACHE_ROOT)]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub frsku: String,

    /// First flag to clear, by name (`review_urls_crawled`) or code (`RC`).
    #[arg(long)]
    pub stage: String,

    #[arg(long)]
    pub merchant: Option<String>,
}
