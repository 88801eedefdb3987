use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, bail};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{TaggedSentence, VectorModelParams};
use crate::semantic::{cosine_similarity, normalize_vector};
use crate::util::now_utc_string;

const CONTEXT_WINDOW: usize = 2;
const LEARNING_RATE: f32 = 0.025;
const INFERENCE_NOISE: f32 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct VectorModel {
    pub name: String,
    pub vector_size: usize,
    pub vocabulary: Vec<String>,
    pub word_vectors: Vec<Vec<f32>>,
    pub tags: Vec<String>,
    pub sentence_vectors: Vec<Vec<f32>>,
    pub trained_at: String,
}

impl VectorModel {
    pub fn train<R: Rng>(
        name: &str,
        corpus: &[TaggedSentence],
        params: &VectorModelParams,
        rng: &mut R,
    ) -> Result<Self> {
        if params.vector_size == 0 {
            bail!("vector model {name} needs a non-zero vector size");
        }

        let mut counts = BTreeMap::<&str, usize>::new();
        for sentence in corpus {
            for token in &sentence.tokens {
                *counts.entry(token.as_str()).or_default() += 1;
            }
        }
        let vocabulary = counts
            .into_iter()
            .filter(|(_, count)| *count >= params.min_count.max(1))
            .map(|(word, _)| word.to_string())
            .collect::<Vec<String>>();
        let index = vocabulary
            .iter()
            .enumerate()
            .map(|(position, word)| (word.as_str(), position))
            .collect::<HashMap<&str, usize>>();

        let scale = 1.0 / params.vector_size as f32;
        let mut word_vectors = (0..vocabulary.len())
            .map(|_| {
                let mut vector = (0..params.vector_size)
                    .map(|_| (rng.random::<f32>() - 0.5) * scale)
                    .collect::<Vec<f32>>();
                normalize_vector(&mut vector);
                vector
            })
            .collect::<Vec<Vec<f32>>>();

        let encoded = corpus
            .iter()
            .map(|sentence| {
                sentence
                    .tokens
                    .iter()
                    .filter_map(|token| index.get(token.as_str()).copied())
                    .collect::<Vec<usize>>()
            })
            .collect::<Vec<Vec<usize>>>();

        let iterations = params.iterations.max(1);
        for iteration in 0..iterations {
            let rate = LEARNING_RATE * (1.0 - iteration as f32 / iterations as f32);
            for words in &encoded {
                for (position, word) in words.iter().enumerate() {
                    let start = position.saturating_sub(CONTEXT_WINDOW);
                    let end = (position + CONTEXT_WINDOW + 1).min(words.len());
                    let mut context = vec![0_f32; params.vector_size];
                    let mut neighbours = 0usize;
                    for other in start..end {
                        if other == position {
                            continue;
                        }
                        for (slot, value) in context.iter_mut().zip(&word_vectors[words[other]]) {
                            *slot += value;
                        }
                        neighbours += 1;
                    }
                    if neighbours == 0 {
                        continue;
                    }
                    let vector = &mut word_vectors[*word];
                    for (slot, value) in vector.iter_mut().zip(&context) {
                        *slot += rate * value / neighbours as f32;
                    }
                    normalize_vector(vector);
                }
            }
        }

        let sentence_vectors = encoded
            .iter()
            .map(|words| mean_vector(words.iter().map(|word| &word_vectors[*word]), params.vector_size))
            .collect::<Vec<Vec<f32>>>();

        Ok(Self {
            name: name.to_string(),
            vector_size: params.vector_size,
            vocabulary,
            word_vectors,
            tags: corpus.iter().map(|sentence| sentence.tag.clone()).collect(),
            sentence_vectors,
            trained_at: now_utc_string(),
        })
    }

    /// Infers a query vector with a little random jitter and returns the closest tags.
    pub fn most_similar<R: Rng>(
        &self,
        query_terms: &[String],
        top_n: usize,
        rng: &mut R,
    ) -> Vec<(String, f64)> {
        let known = query_terms
            .iter()
            .filter_map(|term| {
                self.vocabulary
                    .binary_search_by(|probe| probe.as_str().cmp(term.as_str()))
                    .ok()
            })
            .collect::<Vec<usize>>();
        if known.is_empty() {
            return Vec::new();
        }

        let mut query = mean_vector(
            known.iter().map(|word| &self.word_vectors[*word]),
            self.vector_size,
        );
        for value in &mut query {
            *value += (rng.random::<f32>() - 0.5) * INFERENCE_NOISE;
        }
        normalize_vector(&mut query);

        let mut scored = self
            .tags
            .iter()
            .zip(&self.sentence_vectors)
            .map(|(tag, vector)| (tag.clone(), cosine_similarity(&query, vector)))
            .filter(|(_, similarity)| *similarity > 0.0)
            .collect::<Vec<(String, f64)>>();
        scored.sort_by(|left, right| right.1.total_cmp(&left.1).then_with(|| left.0.cmp(&right.0)));
        scored.truncate(top_n);
        scored
    }
}

fn mean_vector<'a, I>(vectors: I, size: usize) -> Vec<f32>
where
    I: Iterator<Item = &'a Vec<f32>>,
{
    let mut out = vec![0_f32; size];
    let mut count = 0usize;
    for vector in vectors {
        for (slot, value) in out.iter_mut().zip(vector) {
            *slot += value;
        }
        count += 1;
    }
    if count > 0 {
        normalize_vector(&mut out);
    }
    out
}
