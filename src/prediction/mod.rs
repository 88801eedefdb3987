use std::collections::BTreeSet;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::WorkflowConfig;
use crate::modeling::{ModelHandle, ModelService, TopicModelIdentity};
use crate::store::{StatusStore, StoredRankedTopic};

mod aggregate;
mod ranking;
mod regression;
mod sampling;
mod sentences;

pub use aggregate::{AggregatedPrediction, PredictionAccumulator};
pub use ranking::{RankedTopic, rank_topics, regression_points};
pub use regression::{RegressionModel, linregress};
pub use sampling::{GroupedFrequency, group_predictions, select_valid_predictions, sort_predictions};
pub use sentences::{
    SIMILARITY_THRESHOLD, SentencePrediction, SentenceRanker, raw_topic_terms, topic_query_terms,
};

/// Turns repeated stochastic topic predictions for one product into a stored ranking.
#[derive(Clone, Debug)]
pub struct PredictionAggregator {
    iterations: usize,
    tie_precision: usize,
    clear_db: bool,
}

impl PredictionAggregator {
    pub fn new(iterations: usize, tie_precision: usize, clear_db: bool) -> Self {
        Self {
            iterations,
            tie_precision,
            clear_db,
        }
    }

    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self::new(config.iterations, config.tie_precision, config.clear_db)
    }

    /// Ranks the product's topics and persists the ranking with its regression.
    ///
    /// A stored ranking is returned untouched unless clearing was requested. A missing
    /// product, domain, model or corpus yields an empty ranking and a logged diagnostic.
    pub fn predict<M: ModelService>(
        &self,
        store: &mut StatusStore,
        models: &mut M,
        frsku: &str,
    ) -> Result<Vec<RankedTopic>> {
        if store.has_ranked_topics(frsku)? && !self.clear_db {
            debug!(frsku = %frsku, "ranked topics already stored; skipping prediction");
            return Ok(store
                .ranked_topics(frsku)?
                .iter()
                .map(stored_to_ranked)
                .collect());
        }

        let Some(product) = store.product(frsku)? else {
            warn!(frsku = %frsku, "product not found; nothing to predict");
            return Ok(Vec::new());
        };
        let Some(domain) = store.training_domain(&product.domain, &product.subdomain)? else {
            warn!(
                frsku = %frsku,
                domain = %product.domain,
                subdomain = %product.subdomain,
                "training domain not found; nothing to predict"
            );
            return Ok(Vec::new());
        };
        let identity = TopicModelIdentity::for_domain(&domain);
        let Some(handle) = models.load_topic_model(&identity)? else {
            warn!(frsku = %frsku, model = %identity.name(), "topic model not trained yet");
            return Ok(Vec::new());
        };

        let corpus = store
            .bow_documents(frsku)?
            .into_iter()
            .map(|document| document.tokens)
            .filter(|tokens| !tokens.is_empty())
            .collect::<Vec<Vec<String>>>();
        if corpus.is_empty() {
            warn!(frsku = %frsku, "no documents to predict topics for");
            return Ok(Vec::new());
        }

        let incoherent = store.incoherent_topics(&handle.name)?;
        info!(
            frsku = %frsku,
            model = %handle.name,
            documents = corpus.len(),
            iterations = self.iterations,
            incoherent = incoherent.len(),
            "predicting topics"
        );

        let accumulator = run_iterations(
            models,
            &handle,
            &corpus,
            &incoherent,
            self.iterations,
            self.tie_precision,
        )
        .with_context(|| format!("topic prediction failed for {frsku}"))?;
        if accumulator.is_empty() {
            warn!(frsku = %frsku, "no coherent topic was ever predicted");
            return Ok(Vec::new());
        }

        let aggregated = accumulator.finalize();
        let points = regression_points(&aggregated);
        let regression = linregress(&points);
        let ranked = rank_topics(&aggregated, &regression);

        let cleared = store.clear_ranked_topics(frsku)?;
        if cleared > 0 {
            info!(frsku = %frsku, cleared, "cleared previous ranked topics");
        }
        store.store_ranked_topics(frsku, &handle.name, &ranked)?;
        store.store_regression(frsku, &handle.name, &regression, &points)?;

        info!(
            frsku = %frsku,
            topics = ranked.len(),
            slope = regression.slope,
            r_squared = regression.r_squared(),
            p_value = regression.p_value,
            "stored ranked topics"
        );
        Ok(ranked)
    }
}

/// The sequential sampling loop: every iteration scores every document once and folds the
/// grouped result into the accumulator before the next iteration starts.
pub fn run_iterations<M: ModelService>(
    models: &mut M,
    handle: &ModelHandle,
    corpus: &[Vec<String>],
    incoherent: &BTreeSet<usize>,
    iterations: usize,
    tie_precision: usize,
) -> Result<PredictionAccumulator> {
    (0..iterations).try_fold(PredictionAccumulator::default(), |accumulator, iteration| {
        let mut raw = Vec::<(usize, f64)>::new();
        for document in corpus {
            let mut predictions = models.predict_topics(handle, document)?;
            sort_predictions(&mut predictions);
            raw.extend(select_valid_predictions(&predictions, incoherent, tie_precision));
        }
        if raw.is_empty() {
            debug!(iteration, "iteration produced no valid predictions");
        }
        Ok(accumulator.absorb(&group_predictions(&raw)))
    })
}

fn stored_to_ranked(stored: &StoredRankedTopic) -> RankedTopic {
    RankedTopic {
        topic_id: stored.topic_num,
        frequency: stored.frequency,
        probability: stored.probability,
        predicted: stored.predicted,
        rank: stored.rank,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, VecDeque};
    use std::path::PathBuf;

    use anyhow::{Result, bail};

    use super::{PredictionAggregator, run_iterations};
    use crate::modeling::{
        ModelHandle, ModelService, TaggedSentence, TopicModelIdentity, VectorHandle,
        VectorModelIdentity,
    };
    use crate::store::{AnalyzedReview, NewReview, StatusStore, TrainingDomain};

    /// Replays scripted predictions in call order.
    struct ScriptedTopics {
        trained: bool,
        script: VecDeque<Vec<(usize, f64)>>,
        calls: usize,
    }

    impl ScriptedTopics {
        fn new(script: Vec<Vec<(usize, f64)>>) -> Self {
            Self {
                trained: true,
                script: script.into(),
                calls: 0,
            }
        }
    }

    impl ModelService for ScriptedTopics {
        fn train_topic_model(
            &mut self,
            identity: &TopicModelIdentity,
            _corpus: &[Vec<String>],
        ) -> Result<ModelHandle> {
            Ok(ModelHandle {
                name: identity.name(),
                path: PathBuf::from("unused"),
            })
        }

        fn load_topic_model(&mut self, identity: &TopicModelIdentity) -> Result<Option<ModelHandle>> {
            if !self.trained {
                return Ok(None);
            }
            Ok(Some(ModelHandle {
                name: identity.name(),
                path: PathBuf::from("unused"),
            }))
        }

        fn predict_topics(
            &mut self,
            _handle: &ModelHandle,
            _document: &[String],
        ) -> Result<Vec<(usize, f64)>> {
            self.calls += 1;
            match self.script.pop_front() {
                Some(predictions) => Ok(predictions),
                None => bail!("script exhausted"),
            }
        }

        fn topic_terms(&mut self, _handle: &ModelHandle, _top_n: usize) -> Result<Vec<Vec<(String, f64)>>> {
            Ok(Vec::new())
        }

        fn train_vector_model(
            &mut self,
            _identity: &VectorModelIdentity,
            _corpus: &[TaggedSentence],
        ) -> Result<VectorHandle> {
            bail!("not used")
        }

        fn load_vector_model(&mut self, _identity: &VectorModelIdentity) -> Result<Option<VectorHandle>> {
            Ok(None)
        }

        fn infer_similar(
            &mut self,
            _handle: &VectorHandle,
            _query_terms: &[String],
            _top_n: usize,
        ) -> Result<Vec<(String, f64)>> {
            Ok(Vec::new())
        }
    }

    fn handle() -> ModelHandle {
        ModelHandle {
            name: "LDA_MODEL_test".to_string(),
            path: PathBuf::from("unused"),
        }
    }

    fn store_with_documents(documents: usize) -> StatusStore {
        let mut store = StatusStore::open_in_memory().expect("open store");
        store
            .upsert_training_domain(&TrainingDomain {
                domain: "kitchen".to_string(),
                subdomain: "fridge".to_string(),
                topic_count: 2,
                passes: 5,
                chunk_size: 100,
                no_below: 1,
                no_above: 1.0,
                keep_n: None,
            })
            .expect("domain");
        store
            .upsert_product("P001", None, "kitchen", "fridge")
            .expect("product");
        let record_id = store
            .upsert_source_record("P001", "acme", None, None)
            .expect("record");
        let reviews = (0..documents)
            .map(|position| NewReview {
                page_num: 1,
                position: position as i64,
                rating: 5.0,
                title: None,
                body: format!("review {position}"),
            })
            .collect::<Vec<_>>();
        store
            .insert_reviews(record_id, "P001", "acme", &reviews)
            .expect("reviews");
        let analyzed = store
            .pending_reviews("P001")
            .expect("pending")
            .into_iter()
            .map(|review| AnalyzedReview {
                review_id: review.review_id,
                frsku: "P001".to_string(),
                text_hash: format!("hash-{}", review.review_id),
                duplicate: false,
                sentences: Vec::new(),
                tokens: vec!["ice".to_string(), "maker".to_string()],
            })
            .collect::<Vec<_>>();
        store.store_analysis(&analyzed).expect("analysis");
        store
    }

    #[test]
    fn scripted_iterations_average_exactly() {
        // Two documents, two iterations; each topic wins one document per iteration.
        let mut models = ScriptedTopics::new(vec![
            vec![(0, 0.8), (1, 0.2)],
            vec![(1, 0.6), (0, 0.4)],
            vec![(0, 0.7), (1, 0.3)],
            vec![(1, 0.9), (0, 0.1)],
        ]);
        let corpus = vec![vec!["a".to_string()], vec!["b".to_string()]];

        let aggregated = run_iterations(&mut models, &handle(), &corpus, &BTreeSet::new(), 2, 17)
            .expect("iterations")
            .finalize();

        assert_eq!(models.calls, 4);
        assert_eq!(aggregated[0].average_frequency, 1.0);
        assert_eq!(aggregated[1].average_frequency, 1.0);
        assert!((aggregated[0].average_probability - (0.4 + 0.35) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn incoherent_topics_never_rank() {
        let mut models = ScriptedTopics::new(vec![
            vec![(2, 0.9), (0, 0.1)],
            vec![(2, 0.7), (1, 0.3)],
        ]);
        let corpus = vec![vec!["a".to_string()]];
        let aggregated = run_iterations(
            &mut models,
            &handle(),
            &corpus,
            &BTreeSet::from([2]),
            2,
            17,
        )
        .expect("iterations")
        .finalize();
        assert_eq!(
            aggregated.iter().map(|topic| topic.topic_id).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn predict_persists_and_is_idempotent() {
        let mut store = store_with_documents(2);
        let mut models = ScriptedTopics::new(vec![
            vec![(0, 0.8), (1, 0.2)],
            vec![(0, 0.6), (1, 0.4)],
            vec![(1, 0.7), (0, 0.3)],
            vec![(0, 0.9), (1, 0.1)],
        ]);
        let aggregator = PredictionAggregator::new(2, 17, false);

        let ranked = aggregator
            .predict(&mut store, &mut models, "P001")
            .expect("predict");
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].topic_id, 0);
        assert_eq!(ranked[0].rank, 1);
        assert!(store.latest_regression("P001").expect("regression").is_some());

        let again = aggregator
            .predict(&mut store, &mut models, "P001")
            .expect("predict again");
        assert_eq!(models.calls, 4);
        assert_eq!(again, ranked);
    }

    #[test]
    fn clearing_rerun_replaces_stored_ranking() {
        let mut store = store_with_documents(2);
        let mut models = ScriptedTopics::new(vec![
            vec![(0, 0.8), (1, 0.2)],
            vec![(1, 0.7), (0, 0.3)],
        ]);
        let first = PredictionAggregator::new(1, 17, false)
            .predict(&mut store, &mut models, "P001")
            .expect("predict");
        assert_eq!(first.len(), 2);
        assert_eq!(store.count_rows("lda_regressions").expect("count"), 1);

        models.script.extend([vec![(0, 0.9)], vec![(0, 0.6)]]);
        let rerun = PredictionAggregator::new(1, 17, true)
            .predict(&mut store, &mut models, "P001")
            .expect("rerun");
        assert_eq!(models.calls, 4);
        assert_eq!(rerun.len(), 1);
        assert_eq!(rerun[0].topic_id, 0);

        let stored = store.ranked_topics("P001").expect("ranked");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].topic_num, 0);
        assert_eq!(stored[0].rank, 1);
        assert_eq!(store.count_rows("lda_regressions").expect("count"), 2);
    }

    #[test]
    fn missing_model_or_corpus_yields_empty_ranking() {
        let mut store = store_with_documents(1);
        let mut models = ScriptedTopics::new(Vec::new());
        models.trained = false;
        let aggregator = PredictionAggregator::new(3, 17, false);
        assert!(aggregator
            .predict(&mut store, &mut models, "P001")
            .expect("predict")
            .is_empty());

        let mut empty = store_with_documents(0);
        models.trained = true;
        assert!(aggregator
            .predict(&mut empty, &mut models, "P001")
            .expect("predict")
            .is_empty());
        assert!(aggregator
            .predict(&mut empty, &mut models, "UNKNOWN")
            .expect("predict")
            .is_empty());
        assert_eq!(models.calls, 0);
    }
}
