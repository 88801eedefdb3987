use anyhow::Result;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::semantic::{bag_of_words, normalize_whitespace, review_text_hash, split_sentences};
use crate::store::{AnalyzedReview, StatusStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreprocessCounts {
    pub reviews: usize,
    pub duplicates: usize,
    pub sentences: usize,
    pub words: usize,
}

/// Maps a product's unanalyzed reviews into the corpus: duplicates by normalized text are
/// marked and excluded, the rest get UUID-tagged sentences and a bag-of-words document.
pub fn preprocess_reviews(store: &mut StatusStore, frsku: &str) -> Result<PreprocessCounts> {
    let pending = store.pending_reviews(frsku)?;
    let mut seen = store.known_review_hashes(frsku)?;
    let mut counts = PreprocessCounts::default();
    let mut batch = Vec::<AnalyzedReview>::with_capacity(pending.len());

    for review in pending {
        let text = review_text(review.title.as_deref(), &review.body);
        let text_hash = review_text_hash(&text);
        let duplicate = !seen.insert(text_hash.clone());
        counts.reviews += 1;

        if duplicate {
            counts.duplicates += 1;
            batch.push(AnalyzedReview {
                review_id: review.review_id,
                frsku: review.frsku,
                text_hash,
                duplicate,
                sentences: Vec::new(),
                tokens: Vec::new(),
            });
            continue;
        }

        let sentences = split_sentences(&text)
            .into_iter()
            .map(|sentence| (Uuid::new_v4().to_string(), sentence))
            .collect::<Vec<(String, String)>>();
        let tokens = bag_of_words(&text);
        counts.sentences += sentences.len();
        counts.words += tokens.len();

        batch.push(AnalyzedReview {
            review_id: review.review_id,
            frsku: review.frsku,
            text_hash,
            duplicate,
            sentences,
            tokens,
        });
    }

    store.store_analysis(&batch)?;
    info!(
        frsku = %frsku,
        reviews = counts.reviews,
        duplicates = counts.duplicates,
        sentences = counts.sentences,
        words = counts.words,
        "preprocessed reviews"
    );
    Ok(counts)
}

fn review_text(title: Option<&str>, body: &str) -> String {
    let body = normalize_whitespace(body);
    match title.map(normalize_whitespace) {
        Some(title) if !title.is_empty() => {
            let ends_sentence = title.ends_with(['.', '!', '?']);
            if ends_sentence {
                format!("{title} {body}")
            } else {
                format!("{title}. {body}")
            }
        }
        _ => body,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{preprocess_reviews, review_text};
    use crate::store::{NewReview, StatusStore};

    fn review(position: i64, body: &str) -> NewReview {
        NewReview {
            page_num: 1,
            position,
            rating: 4.0,
            title: None,
            body: body.to_string(),
        }
    }

    #[test]
    fn duplicates_are_marked_and_excluded() {
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
                &[
                    review(0, "The ice maker is loud. Shelves are sturdy!"),
                    review(1, "the  ICE maker is loud.   Shelves are sturdy"),
                    review(2, "Door seal leaks water."),
                ],
            )
            .expect("reviews");

        let counts = preprocess_reviews(&mut store, "P001").expect("preprocess");
        assert_eq!(counts.reviews, 3);
        assert_eq!(counts.duplicates, 1);
        assert_eq!(counts.sentences, 3);
        assert_eq!(store.bow_documents("P001").expect("bow").len(), 2);
        let distinct = store
            .sentences_for("P001")
            .expect("sentences")
            .into_iter()
            .map(|row| row.text)
            .collect::<HashSet<String>>();
        assert_eq!(distinct.len(), 3);

        let again = preprocess_reviews(&mut store, "P001").expect("second pass");
        assert_eq!(again.reviews, 0);
    }

    #[test]
    fn title_becomes_leading_sentence() {
        assert_eq!(review_text(Some("Great fridge"), "Cold fast."), "Great fridge. Cold fast.");
        assert_eq!(review_text(Some("Wow!"), "Cold fast."), "Wow! Cold fast.");
        assert_eq!(review_text(None, " Cold\nfast. "), "Cold fast.");
    }
}
