use serde::{Deserialize, Serialize};

use crate::store::TrainingDomain;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportManifest {
    #[serde(default)]
    pub merchants: Vec<MerchantEntry>,
    #[serde(default)]
    pub training_domains: Vec<TrainingDomainEntry>,
    #[serde(default)]
    pub products: Vec<ProductEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantEntry {
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingDomainEntry {
    pub domain: String,
    pub subdomain: String,
    #[serde(default = "default_topic_count")]
    pub topic_count: usize,
    #[serde(default = "default_passes")]
    pub passes: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_no_below")]
    pub no_below: usize,
    #[serde(default = "default_no_above")]
    pub no_above: f64,
    #[serde(default)]
    pub keep_n: Option<usize>,
}

impl From<&TrainingDomainEntry> for TrainingDomain {
    fn from(entry: &TrainingDomainEntry) -> Self {
        Self {
            domain: entry.domain.trim().to_string(),
            subdomain: entry.subdomain.trim().to_string(),
            topic_count: entry.topic_count,
            passes: entry.passes,
            chunk_size: entry.chunk_size,
            no_below: entry.no_below,
            no_above: entry.no_above,
            keep_n: entry.keep_n,
        }
    }
}

fn default_topic_count() -> usize {
    20
}

fn default_passes() -> usize {
    10
}

fn default_chunk_size() -> usize {
    2000
}

fn default_no_below() -> usize {
    5
}

fn default_no_above() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductEntry {
    pub frsku: String,
    #[serde(default)]
    pub title: Option<String>,
    pub domain: String,
    pub subdomain: String,
    #[serde(default)]
    pub records: Vec<SourceRecordEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecordEntry {
    pub merchant: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Cached detail page, `key: value` lines.
    #[serde(default)]
    pub detail_page: Option<String>,
    #[serde(default)]
    pub review_pages: Vec<ReviewPageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewPageEntry {
    pub page_num: i64,
    /// Simulates a page whose fetch keeps failing.
    #[serde(default)]
    pub fail: bool,
    #[serde(default)]
    pub reviews: Vec<CachedReview>,
}

/// One review as cached on a review page; the page body is the JSON array of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedReview {
    pub rating: f64,
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportCounts {
    pub merchants: usize,
    pub training_domains: usize,
    pub products: usize,
    pub source_records: usize,
    pub review_pages: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowPaths {
    pub cache_root: String,
    pub db_path: String,
    pub models_root: String,
    pub dump_root: String,
}

/// Outcome of one step over one work item, for one attempt.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StepOutcome {
    pub dispatched: usize,
    pub advanced: usize,
    pub failed: usize,
    pub skipped: usize,
    pub remaining: usize,
}

impl StepOutcome {
    pub fn merge(&mut self, other: &StepOutcome) {
        self.dispatched += other.dispatched;
        self.advanced += other.advanced;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.remaining += other.remaining;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepAttempt {
    pub attempt: usize,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: String,
    pub work_items: Vec<String>,
    pub attempts: Vec<StepAttempt>,
    pub totals: StepOutcome,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelArtifact {
    pub name: String,
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub paths: WorkflowPaths,
    pub steps: Vec<StepReport>,
    pub model_artifacts: Vec<ModelArtifact>,
    pub warnings: Vec<String>,
}
