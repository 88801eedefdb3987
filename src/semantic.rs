use std::sync::OnceLock;

use regex::Regex;

use crate::util::sha256_text;

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "also", "am", "an", "and", "any", "are", "as",
    "at", "be", "because", "been", "before", "being", "below", "between", "both", "but", "by",
    "can", "could", "did", "do", "does", "doing", "down", "during", "each", "even", "few", "for",
    "from", "further", "get", "got", "had", "has", "have", "having", "he", "her", "here", "hers",
    "him", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just", "me",
    "more", "most", "my", "no", "nor", "not", "now", "of", "off", "on", "once", "one", "only",
    "or", "other", "our", "out", "over", "own", "really", "same", "she", "should", "so", "some",
    "such", "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "those", "through", "to", "too", "under", "until", "up", "very", "was", "we", "were", "what",
    "when", "where", "which", "while", "who", "whom", "why", "will", "with", "would", "you",
    "your",
];

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Hash of the review text with case, punctuation and spacing folded away.
pub fn review_text_hash(text: &str) -> String {
    let folded = tokenize_words(text).join(" ");
    sha256_text(&folded)
}

pub fn tokenize_words(text: &str) -> Vec<String> {
    text.split(|character: char| !character.is_alphanumeric())
        .filter(|value| !value.is_empty())
        .map(str::to_lowercase)
        .collect()
}

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.binary_search(&word).is_ok()
}

/// Tokens that carry topic signal: lowercase, no stop words, no bare numbers, two chars or more.
pub fn bag_of_words(text: &str) -> Vec<String> {
    tokenize_words(text)
        .into_iter()
        .filter(|word| word.chars().count() >= 2)
        .filter(|word| !word.chars().all(|character| character.is_ascii_digit()))
        .filter(|word| !is_stop_word(word))
        .collect()
}

pub fn split_sentences(text: &str) -> Vec<String> {
    static BOUNDARY: OnceLock<Regex> = OnceLock::new();
    let boundary = BOUNDARY.get_or_init(|| {
        Regex::new(r"[.!?]+(?:\s+|$)|\n{2,}").expect("valid sentence boundary regex")
    });

    let mut out = Vec::<String>::new();
    let mut start = 0usize;
    for found in boundary.find_iter(text) {
        push_sentence(&mut out, &text[start..found.end()]);
        start = found.end();
    }
    push_sentence(&mut out, &text[start..]);
    out
}

fn push_sentence(out: &mut Vec<String>, raw: &str) {
    let sentence = normalize_whitespace(raw);
    if tokenize_words(&sentence).is_empty() {
        return;
    }
    out.push(sentence);
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let dot = left
        .iter()
        .zip(right.iter())
        .map(|(left_value, right_value)| f64::from(*left_value) * f64::from(*right_value))
        .sum::<f64>();
    let left_norm = squared_norm(left).sqrt();
    let right_norm = squared_norm(right).sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}

pub fn normalize_vector(values: &mut [f32]) {
    let norm = squared_norm(values).sqrt();
    if norm > 0.0 {
        for value in values {
            *value = (f64::from(*value) / norm) as f32;
        }
    }
}

fn squared_norm(values: &[f32]) -> f64 {
    values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>()
}
