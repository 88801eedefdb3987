use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};

use crate::cli::{RecrawlMode, WorkflowArgs};
use crate::modeling::VectorModelParams;

pub const DEFAULT_CACHE_ROOT: &str = ".cache/reviewflow";
pub const DEFAULT_ITERATIONS: usize = 1000;
pub const DEFAULT_TIE_PRECISION: usize = 17;
pub const DEFAULT_TOP_N: usize = 100;
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 30;
pub const DEFAULT_VECTOR_SIZE: usize = 100;
pub const DEFAULT_VECTOR_ITERATIONS: usize = 20;
pub const DEFAULT_VECTOR_MIN_COUNT: usize = 5;

const MAX_TIE_PRECISION: usize = 30;

pub fn resolve_db_path(cache_root: &Path, db_path: Option<&PathBuf>) -> PathBuf {
    db_path
        .cloned()
        .unwrap_or_else(|| cache_root.join("reviewflow.sqlite"))
}

/// Settings for one workflow run, shared by the controller, the aggregator and the ranker.
#[derive(Clone, Debug)]
pub struct WorkflowConfig {
    pub cache_root: PathBuf,
    pub db_path: PathBuf,
    pub iterations: usize,
    pub tie_precision: usize,
    pub top_n: usize,
    pub max_attempts: usize,
    pub retry_delay: Duration,
    pub vector: VectorModelParams,
    pub seed: Option<u64>,
    pub recrawl: Option<RecrawlMode>,
    pub merchant: Option<String>,
    pub finished_crawling: bool,
    pub ignore_params: bool,
    pub clear_db: bool,
    pub dump_to_csv: bool,
}

impl WorkflowConfig {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            cache_root: cache_root.to_path_buf(),
            db_path: resolve_db_path(cache_root, None),
            iterations: DEFAULT_ITERATIONS,
            tie_precision: DEFAULT_TIE_PRECISION,
            top_n: DEFAULT_TOP_N,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            vector: VectorModelParams {
                vector_size: DEFAULT_VECTOR_SIZE,
                iterations: DEFAULT_VECTOR_ITERATIONS,
                min_count: DEFAULT_VECTOR_MIN_COUNT,
            },
            seed: None,
            recrawl: None,
            merchant: None,
            finished_crawling: false,
            ignore_params: false,
            clear_db: false,
            dump_to_csv: false,
        }
    }

    pub fn from_args(args: &WorkflowArgs) -> Result<Self> {
        if args.iterations == 0 {
            bail!("--iterations must be at least 1");
        }
        if args.max_attempts == 0 {
            bail!("--max-attempts must be at least 1");
        }
        if args.tie_precision > MAX_TIE_PRECISION {
            bail!("--tie-precision must be at most {MAX_TIE_PRECISION}");
        }
        if args.vector_size == 0 {
            bail!("--vector-size must be at least 1");
        }

        Ok(Self {
            cache_root: args.cache_root.clone(),
            db_path: resolve_db_path(&args.cache_root, args.db_path.as_ref()),
            iterations: args.iterations,
            tie_precision: args.tie_precision,
            top_n: args.top_n,
            max_attempts: args.max_attempts,
            retry_delay: Duration::from_secs(args.retry_delay_secs),
            vector: VectorModelParams {
                vector_size: args.vector_size,
                iterations: args.vector_iterations,
                min_count: args.vector_min_count,
            },
            seed: args.seed,
            recrawl: args.recrawl,
            merchant: args
                .merchant
                .as_ref()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            finished_crawling: args.finished_crawling,
            ignore_params: args.ignore_params,
            clear_db: args.clear_db,
            dump_to_csv: args.dump_to_csv,
        })
    }

    pub fn models_root(&self) -> PathBuf {
        self.cache_root.join("models")
    }

    pub fn dump_root(&self) -> PathBuf {
        self.cache_root.join("file_dump")
    }

    pub fn topics_dir(&self) -> PathBuf {
        self.cache_root.join("lda_topics")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.cache_root.join("manifests")
    }
}
