use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Result, bail};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{MIN_TOPIC_PROBABILITY, TopicModelParams};
use crate::util::now_utc_string;

const INFERENCE_SWEEPS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct LdaModel {
    pub name: String,
    pub topic_count: usize,
    pub alpha: f64,
    pub eta: f64,
    pub vocabulary: Vec<String>,
    /// `topic_word_counts[topic][word]`.
    pub topic_word_counts: Vec<Vec<u32>>,
    pub topic_totals: Vec<u64>,
    pub document_count: usize,
    pub trained_at: String,
    #[serde(skip)]
    word_index: HashMap<String, usize>,
}

impl LdaModel {
    pub fn train<R: Rng>(
        name: &str,
        corpus: &[Vec<String>],
        params: &TopicModelParams,
        rng: &mut R,
    ) -> Result<Self> {
        if params.topic_count == 0 {
            bail!("topic model {name} needs at least one topic");
        }

        let vocabulary = build_dictionary(corpus, params.no_below, params.no_above, params.keep_n);
        if vocabulary.is_empty() {
            bail!(
                "dictionary for {name} is empty after filtering {} documents",
                corpus.len()
            );
        }

        let word_index = index_words(&vocabulary);
        let documents = corpus
            .iter()
            .map(|document| {
                document
                    .iter()
                    .filter_map(|word| word_index.get(word).copied())
                    .collect::<Vec<usize>>()
            })
            .filter(|document| !document.is_empty())
            .collect::<Vec<Vec<usize>>>();

        let topic_count = params.topic_count;
        let vocabulary_size = vocabulary.len();
        let alpha = 1.0 / topic_count as f64;
        let eta = 1.0 / topic_count as f64;

        let mut doc_topic = vec![vec![0_u32; topic_count]; documents.len()];
        let mut topic_word = vec![vec![0_u32; vocabulary_size]; topic_count];
        let mut topic_totals = vec![0_u64; topic_count];
        let mut assignments = Vec::<Vec<usize>>::with_capacity(documents.len());

        for (doc, words) in documents.iter().enumerate() {
            let mut doc_assignments = Vec::<usize>::with_capacity(words.len());
            for word in words {
                let topic = rng.random_range(0..topic_count);
                doc_topic[doc][topic] += 1;
                topic_word[topic][*word] += 1;
                topic_totals[topic] += 1;
                doc_assignments.push(topic);
            }
            assignments.push(doc_assignments);
        }

        let mut weights = vec![0_f64; topic_count];
        for _ in 0..params.passes.max(1) {
            for (doc, words) in documents.iter().enumerate() {
                for (position, word) in words.iter().enumerate() {
                    let old = assignments[doc][position];
                    doc_topic[doc][old] -= 1;
                    topic_word[old][*word] -= 1;
                    topic_totals[old] -= 1;

                    for topic in 0..topic_count {
                        let phi = (f64::from(topic_word[topic][*word]) + eta)
                            / (topic_totals[topic] as f64 + vocabulary_size as f64 * eta);
                        weights[topic] = (f64::from(doc_topic[doc][topic]) + alpha) * phi;
                    }

                    let new = sample_index(&weights, rng);
                    assignments[doc][position] = new;
                    doc_topic[doc][new] += 1;
                    topic_word[new][*word] += 1;
                    topic_totals[new] += 1;
                }
            }
        }

        Ok(Self {
            name: name.to_string(),
            topic_count,
            alpha,
            eta,
            vocabulary,
            topic_word_counts: topic_word,
            topic_totals,
            document_count: documents.len(),
            trained_at: now_utc_string(),
            word_index,
        })
    }

    fn word_id(&self, word: &str) -> Option<usize> {
        if self.word_index.is_empty() {
            return self.vocabulary.binary_search_by(|probe| probe.as_str().cmp(word)).ok();
        }
        self.word_index.get(word).copied()
    }

    fn phi(&self, topic: usize, word: usize) -> f64 {
        (f64::from(self.topic_word_counts[topic][word]) + self.eta)
            / (self.topic_totals[topic] as f64 + self.vocabulary.len() as f64 * self.eta)
    }

    /// Runs a short Gibbs chain over the document from a random start.
    pub fn infer<R: Rng>(&self, document: &[String], rng: &mut R) -> Vec<(usize, f64)> {
        let words = document
            .iter()
            .filter_map(|word| self.word_id(word))
            .collect::<Vec<usize>>();

        let mut doc_topic = vec![0_u32; self.topic_count];
        let mut assignments = Vec::<usize>::with_capacity(words.len());
        for _ in &words {
            let topic = rng.random_range(0..self.topic_count);
            doc_topic[topic] += 1;
            assignments.push(topic);
        }

        let mut weights = vec![0_f64; self.topic_count];
        for _ in 0..INFERENCE_SWEEPS {
            for (position, word) in words.iter().enumerate() {
                let old = assignments[position];
                doc_topic[old] -= 1;
                for (topic, weight) in weights.iter_mut().enumerate() {
                    *weight = (f64::from(doc_topic[topic]) + self.alpha) * self.phi(topic, *word);
                }
                let new = sample_index(&weights, rng);
                assignments[position] = new;
                doc_topic[new] += 1;
            }
        }

        let denominator = words.len() as f64 + self.topic_count as f64 * self.alpha;
        doc_topic
            .iter()
            .enumerate()
            .map(|(topic, count)| (topic, (f64::from(*count) + self.alpha) / denominator))
            .filter(|(_, probability)| *probability >= MIN_TOPIC_PROBABILITY)
            .collect()
    }

    pub fn top_terms(&self, topic: usize, top_n: usize) -> Vec<(String, f64)> {
        let mut terms = (0..self.vocabulary.len())
            .map(|word| (word, self.phi(topic, word)))
            .collect::<Vec<(usize, f64)>>();
        terms.sort_by(|left, right| right.1.total_cmp(&left.1).then(left.0.cmp(&right.0)));
        terms
            .into_iter()
            .take(top_n)
            .map(|(word, weight)| (self.vocabulary[word].clone(), weight))
            .collect()
    }
}

/// Keeps words seen in at least `no_below` documents and at most `no_above` of them,
/// then the `keep_n` most frequent. The result is sorted.
pub(super) fn build_dictionary(
    corpus: &[Vec<String>],
    no_below: usize,
    no_above: f64,
    keep_n: Option<usize>,
) -> Vec<String> {
    let mut document_frequency = BTreeMap::<&str, usize>::new();
    for document in corpus {
        let unique = document.iter().map(String::as_str).collect::<HashSet<&str>>();
        for word in unique {
            *document_frequency.entry(word).or_default() += 1;
        }
    }

    let document_count = corpus.len().max(1) as f64;
    let mut kept = document_frequency
        .into_iter()
        .filter(|(_, frequency)| *frequency >= no_below)
        .filter(|(_, frequency)| *frequency as f64 / document_count <= no_above)
        .collect::<Vec<(&str, usize)>>();

    if let Some(limit) = keep_n {
        kept.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(right.0)));
        kept.truncate(limit);
    }

    let mut vocabulary = kept
        .into_iter()
        .map(|(word, _)| word.to_string())
        .collect::<Vec<String>>();
    vocabulary.sort();
    vocabulary
}

fn index_words(vocabulary: &[String]) -> HashMap<String, usize> {
    vocabulary
        .iter()
        .enumerate()
        .map(|(index, word)| (word.clone(), index))
        .collect()
}

fn sample_index<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    let total = weights.iter().sum::<f64>();
    if total <= 0.0 || !total.is_finite() {
        return rng.random_range(0..weights.len());
    }

    let mut target = rng.random::<f64>() * total;
    for (index, weight) in weights.iter().enumerate() {
        if target < *weight {
            return index;
        }
        target -= weight;
    }
    weights.len() - 1
}
