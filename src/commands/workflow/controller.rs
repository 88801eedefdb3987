use anyhow::{Result, anyhow, bail};
use chrono::Duration;
use tracing::{debug, error, info, warn};

use super::analysis::{build_product_data, store_aspect_ratings, store_summaries};
use super::export::{
    dump_predicted_sentences, dump_ranked_topics, dump_validation_files, read_topic_csv,
    write_summary_files, write_topic_csv,
};
use super::handlers::{HandlerError, HandlerResult, StageHandlers};
use crate::config::WorkflowConfig;
use crate::model::{ModelArtifact, StepOutcome};
use crate::modeling::{ModelService, TopicModelIdentity, VectorModelIdentity};
use crate::prediction::{PredictionAggregator, SentenceRanker};
use crate::stage::{Stage, WorkflowStep};
use crate::store::{FlagTarget, SourceRecord, StatusStore, WorkItem};
use crate::util::{file_name_component, sha256_file, write_json_pretty};

/// A claim older than this belongs to a run that died; it may be taken over.
const CLAIM_STALE_MINUTES: i64 = 30;

/// Terms kept per topic in the stored `raw_topic`.
const RAW_TOPIC_TERMS: usize = 10;

/// Drives work items through the pipeline and keeps their flags prefix-closed.
pub struct WorkflowController<H, M> {
    store: StatusStore,
    handlers: H,
    models: M,
    config: WorkflowConfig,
    artifacts: Vec<ModelArtifact>,
}

impl<H: StageHandlers, M: ModelService> WorkflowController<H, M> {
    pub fn new(store: StatusStore, handlers: H, models: M, config: WorkflowConfig) -> Self {
        Self {
            store,
            handlers,
            models,
            config,
            artifacts: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    #[cfg(test)]
    pub fn handlers(&self) -> &H {
        &self.handlers
    }

    #[cfg(test)]
    pub fn handlers_mut(&mut self) -> &mut H {
        &mut self.handlers
    }

    #[cfg(test)]
    pub fn config_mut(&mut self) -> &mut WorkflowConfig {
        &mut self.config
    }

    pub fn artifacts(&self) -> &[ModelArtifact] {
        &self.artifacts
    }

    /// Runs one step for one work item. Handler failures are logged and counted in the
    /// outcome; only store and filesystem failures come back as errors.
    pub fn advance(&mut self, work_item: &WorkItem, step: WorkflowStep) -> Result<StepOutcome> {
        match (step, work_item) {
            (
                WorkflowStep::CrawlDetail
                | WorkflowStep::ParseDetail
                | WorkflowStep::QueueReviewUrls
                | WorkflowStep::CrawlReviews
                | WorkflowStep::ParseReviews,
                WorkItem::Product { frsku },
            ) => {
                let Some(stage) = step.target_stage() else {
                    bail!("{step} does not complete a stage");
                };
                self.advance_records(work_item, frsku, step, stage)
            }
            (WorkflowStep::Nlp, _) => self.preprocess(work_item),
            (WorkflowStep::Ml, WorkItem::Product { frsku }) => self.analyze_product(work_item, frsku),
            (WorkflowStep::Ml, WorkItem::Training { domain, subdomain }) => {
                let result = self.train_domain(domain, subdomain);
                Ok(settle(work_item, step, result))
            }
            (WorkflowStep::UpdateTopics, WorkItem::Training { domain, subdomain }) => {
                let result = self.update_topics(domain, subdomain);
                Ok(settle(work_item, step, result))
            }
            (WorkflowStep::GenerateData, WorkItem::Product { frsku }) => {
                let result = self.generate_data(frsku);
                Ok(settle(work_item, step, result))
            }
            (WorkflowStep::SummaryToFile, WorkItem::Product { frsku }) => {
                let result = self.summary_to_file(frsku);
                Ok(settle(work_item, step, result))
            }
            _ => {
                info!(work_item = %work_item, step = step.as_str(), "step does not apply; skipping");
                Ok(StepOutcome {
                    skipped: 1,
                    ..StepOutcome::default()
                })
            }
        }
    }

    fn advance_records(
        &mut self,
        work_item: &WorkItem,
        frsku: &str,
        step: WorkflowStep,
        stage: Stage,
    ) -> Result<StepOutcome> {
        let merchant = self.config.merchant.clone();
        let merchant = merchant.as_deref();
        let mut outcome = StepOutcome::default();

        let records = if self.config.ignore_params {
            self.store.records_for(work_item, merchant)?
        } else {
            if self.store.all_flags_true(work_item, stage, merchant)? {
                debug!(work_item = %work_item, stage = %stage, "stage already complete");
                self.sync_product_flags(work_item, frsku, stage)?;
                return Ok(outcome);
            }
            self.store.get_records(work_item, stage, merchant)?
        };

        if step == WorkflowStep::CrawlReviews && self.config.finished_crawling {
            self.force_crawl_finished(work_item, frsku, merchant, &mut outcome)?;
        } else {
            for record in &records {
                self.dispatch_record(work_item, step, stage, record, &mut outcome)?;
            }
        }

        self.sync_product_flags(work_item, frsku, stage)?;
        outcome.remaining = self.store.get_records(work_item, stage, merchant)?.len();

        info!(
            work_item = %work_item,
            step = step.as_str(),
            dispatched = outcome.dispatched,
            advanced = outcome.advanced,
            failed = outcome.failed,
            skipped = outcome.skipped,
            remaining = outcome.remaining,
            "step finished"
        );
        Ok(outcome)
    }

    fn dispatch_record(
        &mut self,
        work_item: &WorkItem,
        step: WorkflowStep,
        stage: Stage,
        record: &SourceRecord,
        outcome: &mut StepOutcome,
    ) -> Result<()> {
        let stale_after = Duration::minutes(CLAIM_STALE_MINUTES);
        if !self.store.try_claim(record.record_id, stage, stale_after)? {
            info!(record_id = record.record_id, stage = %stage, "record is claimed by another run");
            outcome.skipped += 1;
            return Ok(());
        }

        let result = self.run_claimed(work_item, step, stage, record.record_id, outcome);
        self.store.release_claim(record.record_id, stage)?;
        result
    }

    fn run_claimed(
        &mut self,
        work_item: &WorkItem,
        step: WorkflowStep,
        stage: Stage,
        record_id: i64,
        outcome: &mut StepOutcome,
    ) -> Result<()> {
        // Re-read under the claim: another run may have finished the record meanwhile.
        let Some(current) = self.store.record(record_id)? else {
            warn!(record_id, "source record vanished before dispatch");
            outcome.skipped += 1;
            return Ok(());
        };
        if !self.config.ignore_params && !current.flags.is_eligible_for(stage) {
            debug!(record_id, flags = %current.flags, "record no longer eligible");
            outcome.skipped += 1;
            return Ok(());
        }

        outcome.dispatched += 1;
        debug!(record_id, merchant = %current.merchant, step = step.as_str(), "dispatching record");
        match self.call_handler(step, &current) {
            Ok(()) => match self.store.set_flag(FlagTarget::Record(record_id), stage, true) {
                Ok(true) => outcome.advanced += 1,
                Ok(false) => {}
                Err(err) => {
                    outcome.failed += 1;
                    warn!(record_id, stage = %stage, error = %format!("{err:#}"), "flag not advanced");
                }
            },
            Err(err) => {
                outcome.failed += 1;
                log_failure(work_item, step, Some(record_id), &err);
            }
        }
        Ok(())
    }

    fn call_handler(&mut self, step: WorkflowStep, record: &SourceRecord) -> HandlerResult<()> {
        let store = &mut self.store;
        match step {
            WorkflowStep::CrawlDetail => self.handlers.crawl_detail(store, record),
            WorkflowStep::ParseDetail => self.handlers.parse_detail(store, record),
            WorkflowStep::QueueReviewUrls => {
                self.handlers.queue_review_urls(store, record).map(|_| ())
            }
            WorkflowStep::CrawlReviews => self
                .handlers
                .crawl_reviews(store, record, self.config.recrawl)
                .map(|_| ()),
            WorkflowStep::ParseReviews => self.handlers.parse_reviews(store, record).map(|_| ()),
            other => Err(HandlerError::Other(anyhow!(
                "{} has no per-record handler",
                other.as_str()
            ))),
        }
    }

    /// Recomputes product flags through `up_to`: a stage is set iff every record carries it.
    /// The first stage some record lacks is cleared on the product with every later stage.
    fn sync_product_flags(&self, work_item: &WorkItem, frsku: &str, up_to: Stage) -> Result<()> {
        for stage in Stage::ALL.into_iter().take(up_to.index() + 1) {
            if !self.store.all_flags_true(work_item, stage, None)? {
                if self.store.reset_from(FlagTarget::Product(frsku), stage)? {
                    info!(frsku = %frsku, stage = %stage, "product flag lowered; records pending");
                }
                break;
            }
            if self.store.set_flag(FlagTarget::Product(frsku), stage, true)? {
                info!(frsku = %frsku, stage = %stage, "product flag advanced");
            }
        }
        Ok(())
    }

    /// Accepts crawl failures as final without crawling again: every record whose earlier
    /// stages are done is marked crawled, and the product follows once every record is.
    fn force_crawl_finished(
        &mut self,
        work_item: &WorkItem,
        frsku: &str,
        merchant: Option<&str>,
        outcome: &mut StepOutcome,
    ) -> Result<()> {
        let stage = Stage::ReviewUrlsCrawled;
        for record in self.store.records_for(work_item, merchant)? {
            if record.flags.is_set(stage) {
                continue;
            }
            if !record.flags.is_eligible_for(stage) {
                warn!(
                    record_id = record.record_id,
                    flags = %record.flags,
                    "earlier stages incomplete; crawl cannot be accepted as finished"
                );
                continue;
            }
            if self.store.set_flag(FlagTarget::Record(record.record_id), stage, true)? {
                outcome.advanced += 1;
                info!(record_id = record.record_id, merchant = %record.merchant, "crawl accepted as finished");
            }
        }

        self.sync_product_flags(work_item, frsku, stage)?;
        match self.store.flags(FlagTarget::Product(frsku))? {
            Some(flags) if flags.is_set(stage) => {
                info!(frsku = %frsku, "product crawl accepted as finished");
            }
            Some(flags) => {
                warn!(frsku = %frsku, flags = %flags, "some records not crawled; product flag stays down");
            }
            None => warn!(frsku = %frsku, "product not found; crawl not forced"),
        }
        Ok(())
    }

    fn preprocess(&mut self, work_item: &WorkItem) -> Result<StepOutcome> {
        let frskus = match work_item {
            WorkItem::Product { frsku } => vec![frsku.clone()],
            WorkItem::Training { domain, subdomain } => {
                self.store.products_in_domain(domain, subdomain)?
            }
        };

        let mut outcome = StepOutcome::default();
        for frsku in frskus {
            outcome.dispatched += 1;
            match self.handlers.preprocess(&mut self.store, &frsku) {
                Ok(counts) => {
                    outcome.advanced += 1;
                    debug!(frsku = %frsku, reviews = counts.reviews, "preprocess finished");
                }
                Err(err) => {
                    outcome.failed += 1;
                    log_failure(work_item, WorkflowStep::Nlp, None, &err);
                }
            }
        }
        Ok(outcome)
    }

    /// Product-mode ML: topic ranking, sentence ranking, aspect ratings and summary, then
    /// `reviews_analyzed` on the eligible records. With a merchant filter only that
    /// merchant's record advances and the product flag is left alone.
    fn analyze_product(&mut self, work_item: &WorkItem, frsku: &str) -> Result<StepOutcome> {
        let stage = Stage::ReviewsAnalyzed;
        let merchant = self.config.merchant.clone();
        let merchant = merchant.as_deref();
        let mut outcome = StepOutcome::default();

        if !self.config.ignore_params && self.store.all_flags_true(work_item, stage, merchant)? {
            debug!(work_item = %work_item, "reviews already analyzed");
            if merchant.is_none() {
                self.sync_product_flags(work_item, frsku, stage)?;
            }
            return Ok(outcome);
        }

        let records = if self.config.ignore_params {
            self.store.records_for(work_item, merchant)?
        } else {
            self.store.get_records(work_item, stage, merchant)?
        };
        if records.is_empty() {
            info!(work_item = %work_item, "no records ready for analysis");
            outcome.skipped += 1;
            return Ok(outcome);
        }

        outcome.dispatched = records.len();
        match self.run_analysis(frsku) {
            Ok(()) => {
                for record in &records {
                    match self
                        .store
                        .set_flag(FlagTarget::Record(record.record_id), stage, true)
                    {
                        Ok(true) => outcome.advanced += 1,
                        Ok(false) => {}
                        Err(err) => {
                            outcome.failed += 1;
                            warn!(
                                record_id = record.record_id,
                                error = %format!("{err:#}"),
                                "analysis flag not advanced"
                            );
                        }
                    }
                }
                if merchant.is_none() {
                    self.sync_product_flags(work_item, frsku, stage)?;
                }
            }
            Err(err) => {
                outcome.failed += records.len();
                log_failure(work_item, WorkflowStep::Ml, None, &err);
            }
        }

        outcome.remaining = self.store.get_records(work_item, stage, merchant)?.len();
        info!(
            work_item = %work_item,
            advanced = outcome.advanced,
            failed = outcome.failed,
            "analysis finished"
        );
        Ok(outcome)
    }

    fn run_analysis(&mut self, frsku: &str) -> HandlerResult<()> {
        let aggregator = PredictionAggregator::from_config(&self.config);
        let ranked = aggregator.predict(&mut self.store, &mut self.models, frsku)?;
        if ranked.is_empty() {
            return Err(HandlerError::MissingData(format!("no ranked topics for {frsku}")));
        }

        let ranker = SentenceRanker::new(self.config.top_n);
        let identity = VectorModelIdentity {
            frsku: frsku.to_string(),
            params: self.config.vector.clone(),
        };
        let Some(handle) = ranker.vector_model(&self.store, &mut self.models, &identity)? else {
            return Err(HandlerError::MissingData(format!(
                "no sentences to build a vector model for {frsku}"
            )));
        };
        self.record_artifact(&handle.name, &handle.path);

        if self.store.has_predicted_sentences(frsku)? && !self.config.clear_db {
            debug!(frsku = %frsku, "predicted sentences already stored");
        } else {
            self.store.clear_predicted_sentences(frsku)?;
            let topics = self.store.ranked_topics(frsku)?;
            let by_topic = ranker.rank_sentences(&self.store, &mut self.models, &handle, &topics)?;
            let mut kept = 0usize;
            for (topic_num, sentences) in &by_topic {
                self.store.store_predicted_sentences(frsku, *topic_num, sentences)?;
                kept += sentences.len();
            }
            info!(frsku = %frsku, topics = by_topic.len(), sentences = kept, "stored predicted sentences");
        }

        store_aspect_ratings(&self.store, frsku, self.config.clear_db)?;
        store_summaries(&mut self.store, frsku, self.config.clear_db)?;

        if self.config.dump_to_csv {
            let dump_root = self.config.dump_root();
            dump_ranked_topics(&self.store, &dump_root, frsku)?;
            dump_predicted_sentences(&self.store, &dump_root, frsku, &handle.name)?;
            dump_validation_files(&self.store, &dump_root, frsku, &handle.name, self.config.seed)?;
        }
        Ok(())
    }

    /// Training-mode ML: trains (or reuses) the domain model and publishes its topics for
    /// curation.
    fn train_domain(&mut self, domain: &str, subdomain: &str) -> HandlerResult<()> {
        let Some(training) = self.store.training_domain(domain, subdomain)? else {
            return Err(HandlerError::MissingData(format!(
                "training domain {domain}+{subdomain} not found"
            )));
        };
        let identity = TopicModelIdentity::for_domain(&training);
        let corpus = self
            .store
            .domain_bow_documents(domain, subdomain)?
            .into_iter()
            .map(|document| document.tokens)
            .filter(|tokens| !tokens.is_empty())
            .collect::<Vec<Vec<String>>>();
        if corpus.is_empty() {
            return Err(HandlerError::MissingData(format!(
                "no preprocessed documents for {domain}+{subdomain}"
            )));
        }

        let handle = self.models.train_topic_model(&identity, &corpus)?;
        self.record_artifact(&handle.name, &handle.path);

        let terms = self.models.topic_terms(&handle, RAW_TOPIC_TERMS)?;
        let topics = terms
            .iter()
            .enumerate()
            .map(|(topic_num, terms)| (topic_num, format_raw_topic(terms)))
            .collect::<Vec<(usize, String)>>();
        let inserted = self
            .store
            .store_lda_topics(&handle.name, domain, subdomain, &topics)?;

        let stored = self.store.lda_topics(&handle.name)?;
        let path = self.config.topics_dir().join(format!("{}.csv", handle.name));
        write_topic_csv(&path, &stored, self.config.clear_db)?;
        info!(
            model = %handle.name,
            documents = corpus.len(),
            topics = stored.len(),
            inserted,
            "topic model ready"
        );
        Ok(())
    }

    fn update_topics(&mut self, domain: &str, subdomain: &str) -> HandlerResult<()> {
        let Some(training) = self.store.training_domain(domain, subdomain)? else {
            return Err(HandlerError::MissingData(format!(
                "training domain {domain}+{subdomain} not found"
            )));
        };
        let model_name = TopicModelIdentity::for_domain(&training).name();
        let path = self.config.topics_dir().join(format!("{model_name}.csv"));
        if !path.exists() {
            return Err(HandlerError::MissingData(format!(
                "topic csv not found: {}",
                path.display()
            )));
        }

        let mut updated = 0usize;
        let mut incoherent = 0usize;
        for row in read_topic_csv(&path)? {
            let matched = self.store.update_lda_topic(
                &model_name,
                row.topic_num,
                row.coherent,
                &row.query,
                &row.label,
            )?;
            if !matched {
                warn!(model = %model_name, topic = row.topic_num, "no stored topic for csv row; skipping");
                continue;
            }
            updated += 1;
            if !row.coherent {
                incoherent += 1;
            }
        }
        info!(model = %model_name, updated, incoherent, "topics updated from csv");
        Ok(())
    }

    fn generate_data(&mut self, frsku: &str) -> HandlerResult<()> {
        let Some(data) = build_product_data(&self.store, frsku)? else {
            return Err(HandlerError::MissingData(format!("no ranked topics for {frsku}")));
        };
        self.store.store_product_data(frsku, &data)?;
        let path = self
            .config
            .dump_root()
            .join("data")
            .join(format!("{}.json", file_name_component(frsku)));
        write_json_pretty(&path, &data)?;
        info!(frsku = %frsku, path = %path.display(), "generated product data");
        Ok(())
    }

    fn summary_to_file(&mut self, frsku: &str) -> HandlerResult<()> {
        match write_summary_files(&self.store, &self.config.dump_root(), frsku)? {
            Some(_) => Ok(()),
            None => Err(HandlerError::MissingData(format!("no summary stored for {frsku}"))),
        }
    }

    fn record_artifact(&mut self, name: &str, path: &std::path::Path) {
        if self.artifacts.iter().any(|artifact| artifact.name == name) {
            return;
        }
        let sha256 = match sha256_file(path) {
            Ok(value) => value,
            Err(err) => {
                debug!(model = %name, error = %err, "model artifact not hashed");
                return;
            }
        };
        self.artifacts.push(ModelArtifact {
            name: name.to_string(),
            path: path.display().to_string(),
            sha256,
        });
    }
}

/// `0.045*"ice" + 0.030*"water"`: weight and term for each top term.
pub fn format_raw_topic(terms: &[(String, f64)]) -> String {
    terms
        .iter()
        .map(|(term, weight)| format!("{weight:.3}*\"{term}\""))
        .collect::<Vec<String>>()
        .join(" + ")
}

fn settle(work_item: &WorkItem, step: WorkflowStep, result: HandlerResult<()>) -> StepOutcome {
    let mut outcome = StepOutcome {
        dispatched: 1,
        ..StepOutcome::default()
    };
    match result {
        Ok(()) => outcome.advanced = 1,
        Err(err) => {
            outcome.failed = 1;
            log_failure(work_item, step, None, &err);
        }
    }
    outcome
}

fn log_failure(work_item: &WorkItem, step: WorkflowStep, record_id: Option<i64>, err: &HandlerError) {
    match err {
        HandlerError::Other(inner) => error!(
            work_item = %work_item,
            step = step.as_str(),
            record_id,
            error = %format!("{inner:#}"),
            "stage handler failed"
        ),
        _ => warn!(
            work_item = %work_item,
            step = step.as_str(),
            record_id,
            class = err.class(),
            error = %err,
            "stage handler failed; flag left pending"
        ),
    }
}
