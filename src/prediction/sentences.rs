use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::modeling::{ModelService, TaggedSentence, VectorHandle, VectorModelIdentity};
use crate::semantic::bag_of_words;
use crate::store::{StatusStore, StoredRankedTopic};

/// Sentences scoring below this are never kept as predictions.
pub const SIMILARITY_THRESHOLD: f64 = 0.5;

#[derive(Clone, Debug, PartialEq)]
pub struct SentencePrediction {
    pub tag_uuid: String,
    pub sentence: String,
    pub review_rating: f64,
    pub similarity: f64,
    /// Position in the model's answer, 1-based, counted before thresholding.
    pub raw_sent_rank: usize,
}

pub struct SentenceRanker {
    top_n: usize,
}

impl SentenceRanker {
    pub fn new(top_n: usize) -> Self {
        Self { top_n }
    }

    /// Returns the product's vector model, training it over the product's sentences when
    /// no artifact exists yet.
    pub fn vector_model<M: ModelService>(
        &self,
        store: &StatusStore,
        models: &mut M,
        identity: &VectorModelIdentity,
    ) -> Result<Option<VectorHandle>> {
        if let Some(handle) = models.load_vector_model(identity)? {
            return Ok(Some(handle));
        }

        let corpus = store
            .sentences_for(&identity.frsku)?
            .into_iter()
            .map(|row| TaggedSentence {
                tokens: bag_of_words(&row.text),
                tag: row.tag_uuid,
            })
            .filter(|sentence| !sentence.tokens.is_empty())
            .collect::<Vec<TaggedSentence>>();
        if corpus.is_empty() {
            warn!(frsku = %identity.frsku, "no sentences to train a vector model on");
            return Ok(None);
        }

        info!(frsku = %identity.frsku, sentences = corpus.len(), "training vector model");
        models.train_vector_model(identity, &corpus).map(Some)
    }

    /// Queries the vector model once per ranked topic, in rank order. Topics without usable
    /// query terms are skipped.
    pub fn rank_sentences<M: ModelService>(
        &self,
        store: &StatusStore,
        models: &mut M,
        handle: &VectorHandle,
        ranked_topics: &[StoredRankedTopic],
    ) -> Result<Vec<(usize, Vec<SentencePrediction>)>> {
        let mut ordered = ranked_topics.iter().collect::<Vec<&StoredRankedTopic>>();
        ordered.sort_by_key(|topic| topic.rank);

        let mut out = Vec::<(usize, Vec<SentencePrediction>)>::new();
        for topic in ordered {
            let terms = topic_query_terms(topic);
            if terms.is_empty() {
                warn!(
                    topic = topic.topic_num,
                    rank = topic.rank,
                    "topic has no query terms; skipping"
                );
                continue;
            }

            let similar = models.infer_similar(handle, &terms, self.top_n)?;
            let mut kept = Vec::<SentencePrediction>::new();
            for (position, (tag, similarity)) in similar.into_iter().enumerate() {
                if similarity < SIMILARITY_THRESHOLD {
                    continue;
                }
                let Some(row) = store.sentence_by_tag(&tag)? else {
                    warn!(tag = %tag, topic = topic.topic_num, "sentence tag not found; skipping");
                    continue;
                };
                kept.push(SentencePrediction {
                    tag_uuid: row.tag_uuid,
                    sentence: row.text,
                    review_rating: row.rating,
                    similarity,
                    raw_sent_rank: position + 1,
                });
            }
            debug!(topic = topic.topic_num, kept = kept.len(), "ranked sentences for topic");
            out.push((topic.topic_num, kept));
        }
        Ok(out)
    }
}

/// Curated query first, then the label, then the topic's own top terms.
pub fn topic_query_terms(topic: &StoredRankedTopic) -> Vec<String> {
    let query = bag_of_words(&topic.query);
    if !query.is_empty() {
        return query;
    }
    let label = bag_of_words(&topic.label);
    if !label.is_empty() {
        return label;
    }
    raw_topic_terms(&topic.raw_topic)
}

/// Extracts the quoted terms from a `0.045*"ice" + 0.030*"water"` topic string.
pub fn raw_topic_terms(raw_topic: &str) -> Vec<String> {
    static TERM: OnceLock<Regex> = OnceLock::new();
    let pattern = TERM.get_or_init(|| Regex::new(r#""([^"]+)""#).expect("valid topic term regex"));
    pattern
        .captures_iter(raw_topic)
        .filter_map(|captures| captures.get(1))
        .map(|term| term.as_str().to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use anyhow::{Result, bail};

    use super::{SIMILARITY_THRESHOLD, SentenceRanker, raw_topic_terms, topic_query_terms};
    use crate::modeling::{
        ModelHandle, ModelService, TaggedSentence, TopicModelIdentity, VectorHandle,
        VectorModelIdentity,
    };
    use crate::store::{AnalyzedReview, NewReview, StatusStore, StoredRankedTopic};

    /// Answers every query from a fixed table keyed by the first query term.
    struct FixedSimilarity {
        answers: HashMap<String, Vec<(String, f64)>>,
    }

    impl ModelService for FixedSimilarity {
        fn train_topic_model(
            &mut self,
            _identity: &TopicModelIdentity,
            _corpus: &[Vec<String>],
        ) -> Result<ModelHandle> {
            bail!("not used")
        }

        fn load_topic_model(&mut self, _identity: &TopicModelIdentity) -> Result<Option<ModelHandle>> {
            Ok(None)
        }

        fn predict_topics(
            &mut self,
            _handle: &ModelHandle,
            _document: &[String],
        ) -> Result<Vec<(usize, f64)>> {
            bail!("not used")
        }

        fn topic_terms(&mut self, _handle: &ModelHandle, _top_n: usize) -> Result<Vec<Vec<(String, f64)>>> {
            bail!("not used")
        }

        fn train_vector_model(
            &mut self,
            identity: &VectorModelIdentity,
            _corpus: &[TaggedSentence],
        ) -> Result<VectorHandle> {
            Ok(VectorHandle {
                name: identity.name(),
                path: PathBuf::from("unused"),
            })
        }

        fn load_vector_model(&mut self, _identity: &VectorModelIdentity) -> Result<Option<VectorHandle>> {
            Ok(None)
        }

        fn infer_similar(
            &mut self,
            _handle: &VectorHandle,
            query_terms: &[String],
            top_n: usize,
        ) -> Result<Vec<(String, f64)>> {
            let mut answer = self
                .answers
                .get(&query_terms[0])
                .cloned()
                .unwrap_or_default();
            answer.truncate(top_n);
            Ok(answer)
        }
    }

    fn ranked(topic_num: usize, rank: usize, query: &str) -> StoredRankedTopic {
        StoredRankedTopic {
            topic_num,
            rank,
            model_name: "LDA_MODEL_test".to_string(),
            frequency: 1.0,
            probability: 0.5,
            predicted: 0.5,
            label: String::new(),
            query: query.to_string(),
            raw_topic: String::new(),
        }
    }

    fn seeded_store() -> StatusStore {
        let mut store = StatusStore::open_in_memory().expect("open store");
        store
            .upsert_product("P001", None, "kitchen", "fridge")
            .expect("product");
        let record_id = store
            .upsert_source_record("P001", "acme", None, None)
            .expect("record");
        store
            .insert_reviews(
                record_id,
                "P001",
                "acme",
                &[NewReview {
                    page_num: 1,
                    position: 0,
                    rating: 4.0,
                    title: None,
                    body: "Ice maker works. Door squeaks.".to_string(),
                }],
            )
            .expect("reviews");
        let review_id = store.pending_reviews("P001").expect("pending")[0].review_id;
        store
            .store_analysis(&[AnalyzedReview {
                review_id,
                frsku: "P001".to_string(),
                text_hash: "hash".to_string(),
                duplicate: false,
                sentences: vec![
                    ("tag-ice".to_string(), "Ice maker works.".to_string()),
                    ("tag-door".to_string(), "Door squeaks.".to_string()),
                ],
                tokens: vec!["ice".to_string(), "maker".to_string()],
            }])
            .expect("analysis");
        store
    }

    #[test]
    fn results_never_fall_below_threshold() {
        let store = seeded_store();
        let mut models = FixedSimilarity {
            answers: HashMap::from([
                (
                    "ice".to_string(),
                    vec![
                        ("tag-ice".to_string(), 0.91),
                        ("tag-door".to_string(), 0.49),
                    ],
                ),
                ("door".to_string(), vec![("tag-door".to_string(), 0.5)]),
            ]),
        };
        let handle = VectorHandle {
            name: "doc2vec".to_string(),
            path: PathBuf::from("unused"),
        };

        let ranker = SentenceRanker::new(100);
        let results = ranker
            .rank_sentences(
                &store,
                &mut models,
                &handle,
                &[ranked(4, 2, "door"), ranked(1, 1, "ice")],
            )
            .expect("rank sentences");

        assert_eq!(results.iter().map(|(topic, _)| *topic).collect::<Vec<_>>(), vec![1, 4]);
        for (_, sentences) in &results {
            assert!(sentences.iter().all(|s| s.similarity >= SIMILARITY_THRESHOLD));
        }
        assert_eq!(results[0].1.len(), 1);
        assert_eq!(results[0].1[0].sentence, "Ice maker works.");
        assert_eq!(results[0].1[0].review_rating, 4.0);
        assert_eq!(results[1].1[0].raw_sent_rank, 1);
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let store = seeded_store();
        let mut models = FixedSimilarity {
            answers: HashMap::from([(
                "ice".to_string(),
                vec![("missing".to_string(), 0.99), ("tag-ice".to_string(), 0.8)],
            )]),
        };
        let handle = VectorHandle {
            name: "doc2vec".to_string(),
            path: PathBuf::from("unused"),
        };
        let results = SentenceRanker::new(10)
            .rank_sentences(&store, &mut models, &handle, &[ranked(1, 1, "ice")])
            .expect("rank sentences");
        assert_eq!(results[0].1.len(), 1);
        assert_eq!(results[0].1[0].raw_sent_rank, 2);
    }

    #[test]
    fn query_terms_fall_back_to_raw_topic() {
        let mut topic = ranked(0, 1, "");
        topic.raw_topic = r#"0.045*"ice" + 0.030*"water""#.to_string();
        assert_eq!(topic_query_terms(&topic), vec!["ice", "water"]);

        topic.label = "Ice Maker".to_string();
        assert_eq!(topic_query_terms(&topic), vec!["ice", "maker"]);

        assert!(raw_topic_terms("").is_empty());
    }
}
