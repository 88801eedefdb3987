use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use proptest::prelude::*;
use tempfile::tempdir;

use super::controller::{WorkflowController, format_raw_topic};
use super::handlers::{HandlerError, HandlerResult, StageHandlers};
use super::nlp::{PreprocessCounts, preprocess_reviews};
use super::run::{parse_steps, resolve_work_items, run_step};
use crate::cli::RecrawlMode;
use crate::config::WorkflowConfig;
use crate::modeling::{
    ModelHandle, ModelService, TaggedSentence, TopicModelIdentity, VectorHandle,
    VectorModelIdentity,
};
use crate::stage::{Stage, WorkflowStep};
use crate::store::{FlagTarget, NewReview, SourceRecord, StatusStore, TrainingDomain, WorkItem};

/// Logs every record it is handed; fails on request.
#[derive(Default)]
struct RecordingHandlers {
    calls: Vec<(&'static str, i64)>,
    failing: HashSet<(&'static str, i64)>,
    schedule: VecDeque<bool>,
}

impl RecordingHandlers {
    fn call(&mut self, step: &'static str, record: &SourceRecord) -> HandlerResult<()> {
        self.calls.push((step, record.record_id));
        let scheduled = self.schedule.pop_front().unwrap_or(false);
        if scheduled || self.failing.contains(&(step, record.record_id)) {
            return Err(HandlerError::Transient(format!(
                "{step} failed for record {}",
                record.record_id
            )));
        }
        Ok(())
    }

    fn calls_for(&self, step: &str) -> Vec<i64> {
        self.calls
            .iter()
            .filter(|(name, _)| *name == step)
            .map(|(_, record_id)| *record_id)
            .collect()
    }
}

impl StageHandlers for RecordingHandlers {
    fn crawl_detail(&mut self, _store: &mut StatusStore, record: &SourceRecord) -> HandlerResult<()> {
        self.call("crawl_detail", record)
    }

    fn parse_detail(&mut self, _store: &mut StatusStore, record: &SourceRecord) -> HandlerResult<()> {
        self.call("parse_detail", record)
    }

    fn queue_review_urls(
        &mut self,
        _store: &mut StatusStore,
        record: &SourceRecord,
    ) -> HandlerResult<usize> {
        self.call("queue_review_urls", record).map(|_| 1)
    }

    fn crawl_reviews(
        &mut self,
        _store: &mut StatusStore,
        record: &SourceRecord,
        _recrawl: Option<RecrawlMode>,
    ) -> HandlerResult<usize> {
        self.call("crawl_reviews", record).map(|_| 1)
    }

    fn parse_reviews(&mut self, _store: &mut StatusStore, record: &SourceRecord)
    -> HandlerResult<usize> {
        self.call("parse_reviews", record).map(|_| 0)
    }

    fn preprocess(&mut self, store: &mut StatusStore, frsku: &str) -> HandlerResult<PreprocessCounts> {
        Ok(preprocess_reviews(store, frsku)?)
    }
}

/// Deterministic stand-in for the topic and vector models. Documents mentioning a door
/// belong to topic 1, everything else to topic 0; every sentence is similar to every query.
#[derive(Default)]
struct StubModels {
    trained: bool,
    tags: Vec<String>,
}

impl ModelService for StubModels {
    fn train_topic_model(
        &mut self,
        identity: &TopicModelIdentity,
        _corpus: &[Vec<String>],
    ) -> Result<ModelHandle> {
        self.trained = true;
        Ok(ModelHandle {
            name: identity.name(),
            path: PathBuf::from("unused"),
        })
    }

    fn load_topic_model(&mut self, identity: &TopicModelIdentity) -> Result<Option<ModelHandle>> {
        Ok(self.trained.then(|| ModelHandle {
            name: identity.name(),
            path: PathBuf::from("unused"),
        }))
    }

    fn predict_topics(&mut self, _handle: &ModelHandle, document: &[String])
    -> Result<Vec<(usize, f64)>> {
        if document.iter().any(|token| token == "door") {
            Ok(vec![(0, 0.3), (1, 0.7)])
        } else {
            Ok(vec![(0, 0.7), (1, 0.3)])
        }
    }

    fn topic_terms(&mut self, _handle: &ModelHandle, _top_n: usize) -> Result<Vec<Vec<(String, f64)>>> {
        Ok(vec![
            vec![("ice".to_string(), 0.5), ("maker".to_string(), 0.2)],
            vec![("door".to_string(), 0.4)],
        ])
    }

    fn train_vector_model(
        &mut self,
        identity: &VectorModelIdentity,
        corpus: &[TaggedSentence],
    ) -> Result<VectorHandle> {
        self.tags = corpus.iter().map(|sentence| sentence.tag.clone()).collect();
        Ok(VectorHandle {
            name: identity.name(),
            path: PathBuf::from("unused"),
        })
    }

    fn load_vector_model(&mut self, identity: &VectorModelIdentity) -> Result<Option<VectorHandle>> {
        Ok((!self.tags.is_empty()).then(|| VectorHandle {
            name: identity.name(),
            path: PathBuf::from("unused"),
        }))
    }

    fn infer_similar(
        &mut self,
        _handle: &VectorHandle,
        _query_terms: &[String],
        top_n: usize,
    ) -> Result<Vec<(String, f64)>> {
        Ok(self
            .tags
            .iter()
            .take(top_n)
            .map(|tag| (tag.clone(), 0.9))
            .collect())
    }
}

type TestController = WorkflowController<RecordingHandlers, StubModels>;

fn seeded_store(merchants: &[&str]) -> StatusStore {
    let store = StatusStore::open_in_memory().expect("open store");
    store
        .upsert_training_domain(&TrainingDomain {
            domain: "kitchen".to_string(),
            subdomain: "fridge".to_string(),
            topic_count: 2,
            passes: 1,
            chunk_size: 100,
            no_below: 1,
            no_above: 1.0,
            keep_n: None,
        })
        .expect("domain");
    store
        .upsert_product("P001", Some("Frost Free 500"), "kitchen", "fridge")
        .expect("product");
    for merchant in merchants {
        store
            .upsert_source_record("P001", merchant, None, None)
            .expect("record");
    }
    store
}

fn controller(store: StatusStore, cache_root: &Path) -> TestController {
    let mut config = WorkflowConfig::new(cache_root);
    config.iterations = 5;
    config.retry_delay = Duration::ZERO;
    WorkflowController::new(store, RecordingHandlers::default(), StubModels::default(), config)
}

fn record_ids(store: &StatusStore) -> Vec<i64> {
    store
        .records_for(&WorkItem::product("P001"), None)
        .expect("records")
        .iter()
        .map(|record| record.record_id)
        .collect()
}

fn set_through(store: &StatusStore, record_id: i64, through: Stage) {
    for stage in Stage::ALL.into_iter().take(through.index() + 1) {
        store
            .set_flag(FlagTarget::Record(record_id), stage, true)
            .expect("set flag");
    }
}

fn product_flag(store: &StatusStore, stage: Stage) -> bool {
    store
        .flags(FlagTarget::Product("P001"))
        .expect("flags")
        .expect("product")
        .is_set(stage)
}

fn record_flag(store: &StatusStore, record_id: i64, stage: Stage) -> bool {
    store
        .flags(FlagTarget::Record(record_id))
        .expect("flags")
        .expect("record")
        .is_set(stage)
}

fn review(position: i64, rating: f64, body: &str) -> NewReview {
    NewReview {
        page_num: 1,
        position,
        rating,
        title: None,
        body: body.to_string(),
    }
}

/// Two merchants with parsed reviews, ready for nlp and ml.
fn analysis_ready_store() -> StatusStore {
    let mut store = seeded_store(&["acme", "bolt"]);
    let ids = record_ids(&store);
    store
        .insert_reviews(
            ids[0],
            "P001",
            "acme",
            &[
                review(0, 5.0, "The ice maker is great. Ice cubes come fast."),
                review(1, 2.0, "Door seal leaks. The door squeaks."),
            ],
        )
        .expect("acme reviews");
    store
        .insert_reviews(ids[1], "P001", "bolt", &[review(0, 3.0, "Ice maker stopped working.")])
        .expect("bolt reviews");
    for record_id in ids {
        set_through(&store, record_id, Stage::ReviewsParsed);
    }
    store
}

#[test]
fn crawl_detail_advances_records_and_product() {
    let dir = tempdir().expect("tempdir");
    let mut controller = controller(seeded_store(&["acme", "bolt"]), dir.path());
    let item = WorkItem::product("P001");

    let outcome = controller
        .advance(&item, WorkflowStep::CrawlDetail)
        .expect("advance");
    assert_eq!(outcome.dispatched, 2);
    assert_eq!(outcome.advanced, 2);
    assert_eq!(outcome.remaining, 0);
    assert!(product_flag(controller.store(), Stage::DetailCrawled));
    assert!(!product_flag(controller.store(), Stage::DetailParsed));
}

#[test]
fn partial_crawl_keeps_product_flag_down_and_skips_lagging_record() {
    let dir = tempdir().expect("tempdir");
    let store = seeded_store(&["acme", "bolt", "cold"]);
    let ids = record_ids(&store);
    let mut controller = controller(store, dir.path());
    let item = WorkItem::product("P001");

    controller.handlers_mut().failing.insert(("crawl_detail", ids[2]));
    let crawl = controller
        .advance(&item, WorkflowStep::CrawlDetail)
        .expect("crawl");
    assert_eq!(crawl.advanced, 2);
    assert_eq!(crawl.failed, 1);
    assert_eq!(crawl.remaining, 1);

    let parse = controller
        .advance(&item, WorkflowStep::ParseDetail)
        .expect("parse");
    assert_eq!(parse.advanced, 2);
    assert_eq!(controller.handlers().calls_for("parse_detail"), vec![ids[0], ids[1]]);

    let store = controller.store();
    assert!(record_flag(store, ids[0], Stage::DetailParsed));
    assert!(record_flag(store, ids[1], Stage::DetailParsed));
    assert!(!record_flag(store, ids[2], Stage::DetailCrawled));
    assert!(!product_flag(store, Stage::DetailCrawled));
    assert!(!product_flag(store, Stage::DetailParsed));
}

#[test]
fn new_record_lowers_product_flag_until_it_catches_up() {
    let dir = tempdir().expect("tempdir");
    let mut controller = controller(seeded_store(&["acme", "bolt"]), dir.path());
    let item = WorkItem::product("P001");

    controller
        .advance(&item, WorkflowStep::CrawlDetail)
        .expect("crawl");
    controller
        .advance(&item, WorkflowStep::ParseDetail)
        .expect("parse");
    assert!(product_flag(controller.store(), Stage::DetailParsed));

    let late = controller
        .store()
        .upsert_source_record("P001", "cold", None, None)
        .expect("late record");
    let parse = controller
        .advance(&item, WorkflowStep::ParseDetail)
        .expect("parse again");
    assert_eq!(parse.dispatched, 0);
    assert!(!product_flag(controller.store(), Stage::DetailCrawled));
    assert!(!product_flag(controller.store(), Stage::DetailParsed));

    controller
        .advance(&item, WorkflowStep::CrawlDetail)
        .expect("crawl late record");
    assert!(record_flag(controller.store(), late, Stage::DetailCrawled));
    assert!(product_flag(controller.store(), Stage::DetailCrawled));
    assert!(!product_flag(controller.store(), Stage::DetailParsed));
    controller
        .advance(&item, WorkflowStep::ParseDetail)
        .expect("parse late record");
    assert!(product_flag(controller.store(), Stage::DetailParsed));
}

#[test]
fn repeated_advance_changes_nothing() {
    let dir = tempdir().expect("tempdir");
    let mut controller = controller(seeded_store(&["acme", "bolt"]), dir.path());
    let item = WorkItem::product("P001");

    controller
        .advance(&item, WorkflowStep::CrawlDetail)
        .expect("first");
    let flags_before = controller
        .store()
        .records_for(&item, None)
        .expect("records")
        .iter()
        .map(|record| record.flags)
        .collect::<Vec<_>>();
    let calls_before = controller.handlers().calls.len();

    let second = controller
        .advance(&item, WorkflowStep::CrawlDetail)
        .expect("second");
    assert_eq!(second.dispatched, 0);
    assert_eq!(controller.handlers().calls.len(), calls_before);
    let flags_after = controller
        .store()
        .records_for(&item, None)
        .expect("records")
        .iter()
        .map(|record| record.flags)
        .collect::<Vec<_>>();
    assert_eq!(flags_before, flags_after);
}

#[test]
fn ignore_params_redispatches_finished_records() {
    let dir = tempdir().expect("tempdir");
    let mut controller = controller(seeded_store(&["acme"]), dir.path());
    let item = WorkItem::product("P001");

    controller
        .advance(&item, WorkflowStep::CrawlDetail)
        .expect("first");
    controller.config_mut().ignore_params = true;
    let again = controller
        .advance(&item, WorkflowStep::CrawlDetail)
        .expect("again");
    assert_eq!(again.dispatched, 1);
    assert_eq!(again.advanced, 0);
    assert_eq!(controller.handlers().calls_for("crawl_detail").len(), 2);
}

#[test]
fn finished_crawling_accepts_failed_pages_for_ready_records() {
    let dir = tempdir().expect("tempdir");
    let store = seeded_store(&["acme", "bolt"]);
    let ids = record_ids(&store);
    set_through(&store, ids[0], Stage::ReviewUrlsQueued);
    set_through(&store, ids[1], Stage::DetailParsed);
    let mut controller = controller(store, dir.path());
    controller.handlers_mut().failing.insert(("crawl_reviews", ids[0]));
    controller.config_mut().finished_crawling = true;

    let outcome = controller
        .advance(&WorkItem::product("P001"), WorkflowStep::CrawlReviews)
        .expect("advance");
    assert_eq!(outcome.dispatched, 0);
    assert_eq!(outcome.advanced, 1);
    assert_eq!(outcome.failed, 0);
    assert!(controller.handlers().calls_for("crawl_reviews").is_empty());
    let store = controller.store();
    assert!(record_flag(store, ids[0], Stage::ReviewUrlsCrawled));
    assert!(!record_flag(store, ids[1], Stage::ReviewUrlsCrawled));
    assert!(!product_flag(store, Stage::ReviewUrlsCrawled));
}

#[test]
fn finished_crawling_marks_product_once_every_record_is_queued() {
    let dir = tempdir().expect("tempdir");
    let store = seeded_store(&["acme", "bolt"]);
    for record_id in record_ids(&store) {
        set_through(&store, record_id, Stage::ReviewUrlsQueued);
    }
    let mut controller = controller(store, dir.path());
    controller.config_mut().finished_crawling = true;

    let outcome = controller
        .advance(&WorkItem::product("P001"), WorkflowStep::CrawlReviews)
        .expect("advance");
    assert_eq!(outcome.advanced, 2);
    assert_eq!(outcome.remaining, 0);
    assert!(controller.handlers().calls.is_empty());
    let store = controller.store();
    assert!(product_flag(store, Stage::ReviewUrlsQueued));
    assert!(product_flag(store, Stage::ReviewUrlsCrawled));
    assert!(!product_flag(store, Stage::ReviewsParsed));
}

#[test]
fn record_steps_do_not_apply_to_training_items() {
    let dir = tempdir().expect("tempdir");
    let mut controller = controller(seeded_store(&["acme"]), dir.path());
    let item = WorkItem::parse_training("kitchen+fridge").expect("training");

    let outcome = controller
        .advance(&item, WorkflowStep::CrawlDetail)
        .expect("advance");
    assert_eq!(outcome.skipped, 1);
    assert!(controller.handlers().calls.is_empty());
}

#[test]
fn crawl_reviews_retries_until_pages_arrive() {
    let dir = tempdir().expect("tempdir");
    let store = seeded_store(&["acme"]);
    set_through(&store, record_ids(&store)[0], Stage::ReviewUrlsQueued);
    let mut controller = controller(store, dir.path());
    controller.handlers_mut().schedule = VecDeque::from([true, true]);

    let report = run_step(
        &mut controller,
        WorkflowStep::CrawlReviews,
        &[WorkItem::product("P001")],
        5,
        Duration::ZERO,
    );
    assert_eq!(report.attempts.len(), 3);
    assert_eq!(report.totals.failed, 2);
    assert_eq!(report.totals.advanced, 1);
    assert_eq!(report.totals.remaining, 0);
    assert!(report.errors.is_empty());
}

#[test]
fn non_retried_steps_run_once() {
    let dir = tempdir().expect("tempdir");
    let mut controller = controller(seeded_store(&["acme"]), dir.path());
    controller.handlers_mut().schedule = VecDeque::from([true]);

    let report = run_step(
        &mut controller,
        WorkflowStep::CrawlDetail,
        &[WorkItem::product("P001")],
        5,
        Duration::ZERO,
    );
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.totals.remaining, 1);
}

#[test]
fn training_curation_and_product_analysis_flow() {
    let dir = tempdir().expect("tempdir");
    let mut controller = controller(analysis_ready_store(), dir.path());
    let product = WorkItem::product("P001");
    let training = WorkItem::parse_training("kitchen+fridge").expect("training");

    let nlp = controller.advance(&product, WorkflowStep::Nlp).expect("nlp");
    assert_eq!(nlp.advanced, 1);

    let trained = controller.advance(&training, WorkflowStep::Ml).expect("train");
    assert_eq!(trained.advanced, 1);
    let topics_dir = dir.path().join("lda_topics");
    let csv_path = std::fs::read_dir(&topics_dir)
        .expect("topics dir")
        .next()
        .expect("topic csv")
        .expect("entry")
        .path();
    std::fs::write(
        &csv_path,
        "domain,topic_num,coherent,raw_topic,query,label\n\
         kitchen+fridge,0,true,,,Ice maker\n\
         kitchen+fridge,1,true,,door seal,Door\n",
    )
    .expect("curate");
    let updated = controller
        .advance(&training, WorkflowStep::UpdateTopics)
        .expect("update topics");
    assert_eq!(updated.advanced, 1);

    controller.config_mut().dump_to_csv = true;
    controller.config_mut().seed = Some(7);
    let analyzed = controller.advance(&product, WorkflowStep::Ml).expect("analyze");
    assert_eq!(analyzed.advanced, 2);
    assert_eq!(analyzed.remaining, 0);

    let dump_root = dir.path().join("file_dump");
    let topics_csv = std::fs::read_to_string(dump_root.join("lda/LDA_predicted_TOPICS_P001.csv"))
        .expect("ranked topics csv");
    assert!(topics_csv.starts_with("topic_rank,topic_num,label,frequency"));
    let trials = std::fs::read_dir(dump_root.join("doc2vec/validation"))
        .expect("validation dir")
        .count();
    assert_eq!(trials, 5);

    let store = controller.store();
    assert!(product_flag(store, Stage::ReviewsAnalyzed));
    let ranked = store.ranked_topics("P001").expect("ranked");
    assert_eq!(ranked.len(), 2);
    assert_eq!(ranked[0].topic_num, 0);
    assert_eq!(ranked[0].label, "Ice maker");
    assert!(store.has_predicted_sentences("P001").expect("sentences"));
    assert!(store.raw_summary("P001").expect("summary").is_some());
    assert_eq!(store.aspect_ratings("P001").expect("ratings").len(), 2);

    let data = controller
        .advance(&product, WorkflowStep::GenerateData)
        .expect("generate data");
    assert_eq!(data.advanced, 1);
    assert!(dir.path().join("file_dump/data/P001.json").exists());
    assert!(controller.store().product_data("P001").expect("data").is_some());

    let summary = controller
        .advance(&product, WorkflowStep::SummaryToFile)
        .expect("summary");
    assert_eq!(summary.advanced, 1);
    assert!(dir.path().join("file_dump/summary/P001/raw/raw_summary.txt").exists());
}

#[test]
fn merchant_analysis_leaves_product_flag_alone() {
    let dir = tempdir().expect("tempdir");
    let store = analysis_ready_store();
    let ids = record_ids(&store);
    let mut controller = controller(store, dir.path());
    let product = WorkItem::product("P001");
    let training = WorkItem::parse_training("kitchen+fridge").expect("training");

    controller.advance(&product, WorkflowStep::Nlp).expect("nlp");
    controller.advance(&training, WorkflowStep::Ml).expect("train");
    controller.config_mut().merchant = Some("bolt".to_string());
    let outcome = controller.advance(&product, WorkflowStep::Ml).expect("analyze");

    assert_eq!(outcome.advanced, 1);
    let store = controller.store();
    assert!(!record_flag(store, ids[0], Stage::ReviewsAnalyzed));
    assert!(record_flag(store, ids[1], Stage::ReviewsAnalyzed));
    assert!(!product_flag(store, Stage::ReviewsAnalyzed));
}

#[test]
fn analysis_without_a_trained_model_fails_softly() {
    let dir = tempdir().expect("tempdir");
    let mut controller = controller(analysis_ready_store(), dir.path());
    let product = WorkItem::product("P001");

    controller.advance(&product, WorkflowStep::Nlp).expect("nlp");
    let outcome = controller.advance(&product, WorkflowStep::Ml).expect("analyze");
    assert_eq!(outcome.failed, 2);
    assert_eq!(outcome.remaining, 2);
    assert!(!product_flag(controller.store(), Stage::ReviewsAnalyzed));
}

#[test]
fn unknown_work_items_are_dropped() {
    let store = seeded_store(&["acme"]);
    let mut warnings = Vec::new();
    let items = resolve_work_items(
        &store,
        &["P001".to_string(), "P999".to_string()],
        &["kitchen+fridge".to_string(), "garden+hose".to_string()],
        &mut warnings,
    )
    .expect("resolve");
    assert_eq!(items.len(), 2);
    assert_eq!(warnings.len(), 2);

    let everything = resolve_work_items(&store, &[], &[], &mut warnings).expect("resolve");
    assert_eq!(everything, vec![WorkItem::product("P001")]);
}

#[test]
fn analyze_reviews_expands_in_order() {
    let steps = parse_steps(&["crawl_detail".to_string(), "analyze_reviews".to_string()])
        .expect("steps");
    assert_eq!(
        steps,
        vec![WorkflowStep::CrawlDetail, WorkflowStep::Nlp, WorkflowStep::Ml]
    );
    assert!(parse_steps(&["bogus".to_string()]).is_err());
}

#[test]
fn raw_topic_lists_weighted_terms() {
    let terms = vec![("ice".to_string(), 0.0451), ("water".to_string(), 0.03)];
    assert_eq!(format_raw_topic(&terms), r#"0.045*"ice" + 0.030*"water""#);
}

const RECORD_STEPS: [WorkflowStep; 5] = [
    WorkflowStep::CrawlDetail,
    WorkflowStep::ParseDetail,
    WorkflowStep::QueueReviewUrls,
    WorkflowStep::CrawlReviews,
    WorkflowStep::ParseReviews,
];

#[derive(Clone, Debug)]
enum Op {
    Advance { step: usize, finished_crawling: bool },
    Reset { stage: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..RECORD_STEPS.len(), any::<bool>())
            .prop_map(|(step, finished_crawling)| Op::Advance { step, finished_crawling }),
        1 => (0..Stage::ALL.len()).prop_map(|stage| Op::Reset { stage }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn flags_stay_prefix_closed(
        ops in prop::collection::vec(op_strategy(), 1..24),
        failures in prop::collection::vec(any::<bool>(), 0..48),
    ) {
        let dir = tempdir().expect("tempdir");
        let mut controller = controller(seeded_store(&["acme", "bolt", "cold"]), dir.path());
        controller.handlers_mut().schedule = failures.into();
        let item = WorkItem::product("P001");

        for op in ops {
            match op {
                Op::Advance { step, finished_crawling } => {
                    controller.config_mut().finished_crawling = finished_crawling;
                    controller.advance(&item, RECORD_STEPS[step]).expect("advance");
                }
                Op::Reset { stage } => {
                    let stage = Stage::ALL[stage];
                    let store = controller.store();
                    store.reset_from(FlagTarget::Product("P001"), stage).expect("reset product");
                    for record in store.records_for(&item, None).expect("records") {
                        store
                            .reset_from(FlagTarget::Record(record.record_id), stage)
                            .expect("reset record");
                    }
                }
            }

            let store = controller.store();
            let records = store.records_for(&item, None).expect("records");
            let product = store
                .flags(FlagTarget::Product("P001"))
                .expect("flags")
                .expect("product");
            prop_assert!(product.is_prefix_closed());
            for record in &records {
                prop_assert!(record.flags.is_prefix_closed());
            }
            for stage in Stage::ALL {
                if product.is_set(stage) {
                    prop_assert!(records.iter().all(|record| record.flags.is_set(stage)));
                }
            }
        }
    }
}
