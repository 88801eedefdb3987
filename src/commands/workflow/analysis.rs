use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::store::{PredictedSentenceRow, StatusStore, StoredRankedTopic, TopicalSummary};
use crate::util::now_utc_string;

/// Sentences kept per aspect in a summary.
pub const SUMMARY_SENTENCES_PER_TOPIC: usize = 50;

const SUMMARY_RULE: &str = "----------------------------------------";

pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Mean star rating of each ranked topic's sentences; returns how many topics were rated.
pub fn store_aspect_ratings(store: &StatusStore, frsku: &str, clear_db: bool) -> Result<usize> {
    if store.has_aspect_ratings(frsku)? {
        if !clear_db {
            info!(frsku = %frsku, "aspect ratings already stored");
            return Ok(0);
        }
        store.clear_aspect_ratings(frsku)?;
    }

    let by_topic = sentences_by_topic(store.predicted_sentences(frsku)?);
    let mut rated = 0usize;
    for topic in store.ranked_topics(frsku)? {
        let Some(sentences) = by_topic.get(&topic.topic_num) else {
            warn!(frsku = %frsku, topic = topic.topic_num, "no predicted sentences; skipping aspect rating");
            continue;
        };
        let mean = sentences.iter().map(|row| row.review_rating).sum::<f64>() / sentences.len() as f64;
        store.store_aspect_rating(frsku, topic.topic_num, round_one_decimal(mean))?;
        rated += 1;
    }
    info!(frsku = %frsku, rated, "stored aspect ratings");
    Ok(rated)
}

/// Builds and stores the raw summary and one summary per ranked topic.
pub fn store_summaries(store: &mut StatusStore, frsku: &str, clear_db: bool) -> Result<usize> {
    if store.has_summary(frsku)? {
        if !clear_db {
            info!(frsku = %frsku, "summary already stored");
            return Ok(0);
        }
        store.clear_summaries(frsku)?;
    }

    let ranked = store.ranked_topics(frsku)?;
    let ratings = store.aspect_ratings(frsku)?;
    let by_topic = sentences_by_topic(store.predicted_sentences(frsku)?);

    let topical = ranked
        .iter()
        .map(|topic| {
            let sentences = by_topic
                .get(&topic.topic_num)
                .map(Vec::as_slice)
                .unwrap_or_default();
            TopicalSummary {
                topic_rank: topic.rank,
                topic_num: topic.topic_num,
                label: topic_label(topic),
                aspect_rating: ratings.get(&topic.topic_num).copied(),
                body: render_topic_summary(topic, sentences),
            }
        })
        .collect::<Vec<TopicalSummary>>();

    let raw = topical
        .iter()
        .map(|summary| summary.body.as_str())
        .collect::<Vec<&str>>()
        .join(&format!("\n{SUMMARY_RULE}\n\n"));
    store.store_summary(frsku, &raw, &topical)?;
    info!(frsku = %frsku, topics = topical.len(), "stored summary");
    Ok(topical.len())
}

pub fn topic_label(topic: &StoredRankedTopic) -> String {
    let label = topic.label.trim();
    if label.is_empty() {
        format!("Topic {}", topic.topic_num)
    } else {
        label.to_string()
    }
}

fn render_topic_summary(topic: &StoredRankedTopic, sentences: &[PredictedSentenceRow]) -> String {
    let mut body = format!("Aspect {}: {}\n", topic.rank, topic_label(topic));
    for (index, row) in sentences
        .iter()
        .take(SUMMARY_SENTENCES_PER_TOPIC)
        .enumerate()
    {
        body.push_str(&format!("{}. {}\n", index + 1, row.text));
    }
    body
}

fn sentences_by_topic(rows: Vec<PredictedSentenceRow>) -> BTreeMap<usize, Vec<PredictedSentenceRow>> {
    let mut out = BTreeMap::<usize, Vec<PredictedSentenceRow>>::new();
    for row in rows {
        out.entry(row.topic_num).or_default().push(row);
    }
    for rows in out.values_mut() {
        rows.sort_by_key(|row| row.raw_sent_rank);
    }
    out
}

/// The per-product document handed to the presentation layer.
pub fn build_product_data(store: &StatusStore, frsku: &str) -> Result<Option<Value>> {
    let ranked = store.ranked_topics(frsku)?;
    if ranked.is_empty() {
        return Ok(None);
    }
    let title = store.product(frsku)?.and_then(|product| product.title);
    let ratings = store.aspect_ratings(frsku)?;
    let distribution = store.rating_distribution(frsku)?;
    let regression = store.latest_regression(frsku)?;
    let reviews_analyzed = store.analyzed_review_count(frsku)?;

    let max_frequency = ranked
        .iter()
        .map(|topic| topic.frequency)
        .fold(0.0_f64, f64::max);
    let total_frequency = ranked.iter().map(|topic| topic.frequency).sum::<f64>();

    let aspects = ranked
        .iter()
        .map(|topic| {
            let weight = if max_frequency > 0.0 {
                topic.frequency / max_frequency
            } else {
                0.0
            };
            json!({
                "rank": topic.rank,
                "topic_num": topic.topic_num,
                "label": topic_label(topic),
                "rating": ratings.get(&topic.topic_num),
                "frequency": topic.frequency,
                "weight": weight,
            })
        })
        .collect::<Vec<Value>>();

    let (weighted_sum, weight_total) = ranked
        .iter()
        .filter_map(|topic| ratings.get(&topic.topic_num).map(|rating| (topic.frequency, *rating)))
        .fold((0.0, 0.0), |(sum, total), (frequency, rating)| {
            (sum + frequency * rating, total + frequency)
        });
    let adjusted_rating = (weight_total > 0.0).then(|| round_one_decimal(weighted_sum / weight_total));

    let topic_distribution = ranked
        .iter()
        .map(|topic| {
            let percent = if total_frequency > 0.0 {
                round_one_decimal(topic.frequency / total_frequency * 100.0)
            } else {
                0.0
            };
            json!({
                "topic_num": topic.topic_num,
                "label": topic_label(topic),
                "percent": percent,
            })
        })
        .collect::<Vec<Value>>();

    Ok(Some(json!({
        "frsku": frsku,
        "title": title,
        "generated_at": now_utc_string(),
        "aspects": aspects,
        "aspects_discovered": ranked.len(),
        "adjusted_rating": adjusted_rating,
        "rating_distribution": {
            "1": distribution[0],
            "2": distribution[1],
            "3": distribution[2],
            "4": distribution[3],
            "5": distribution[4],
        },
        "reviews_analyzed": reviews_analyzed,
        "regression": regression.map(|stored| json!({
            "slope": stored.model.slope,
            "intercept": stored.model.intercept,
            "r_value": stored.model.r_value,
            "r_squared": stored.model.r_squared(),
            "p_value": stored.model.p_value,
            "std_err": stored.model.std_err,
            "created_at": stored.created_at,
        })),
        "topic_distribution": topic_distribution,
    })))
}

#[cfg(test)]
mod tests {
    use super::{render_topic_summary, round_one_decimal, topic_label};
    use crate::store::{PredictedSentenceRow, StoredRankedTopic};

    fn topic(label: &str) -> StoredRankedTopic {
        StoredRankedTopic {
            topic_num: 7,
            rank: 2,
            model_name: "LDA_MODEL_test".to_string(),
            frequency: 3.0,
            probability: 0.4,
            predicted: 0.4,
            label: label.to_string(),
            query: String::new(),
            raw_topic: String::new(),
        }
    }

    #[test]
    fn rounding_keeps_one_decimal() {
        assert_eq!(round_one_decimal(4.26), 4.3);
        assert_eq!(round_one_decimal(3.0), 3.0);
    }

    #[test]
    fn unlabeled_topics_get_a_placeholder() {
        assert_eq!(topic_label(&topic("  ")), "Topic 7");
        assert_eq!(topic_label(&topic("Ice maker")), "Ice maker");
    }

    #[test]
    fn topic_summary_numbers_sentences() {
        let rows = (1..=60)
            .map(|rank| PredictedSentenceRow {
                topic_num: 7,
                topic_rank: 2,
                label: "Ice maker".to_string(),
                tag_uuid: format!("tag-{rank}"),
                text: format!("Sentence {rank}."),
                review_rating: 4.0,
                raw_sent_rank: rank,
                probability: 0.9,
            })
            .collect::<Vec<_>>();
        let body = render_topic_summary(&topic("Ice maker"), &rows);
        assert!(body.starts_with("Aspect 2: Ice maker\n1. Sentence 1.\n"));
        assert!(body.contains("50. Sentence 50.\n"));
        assert!(!body.contains("51. "));
    }
}
