use serde::Serialize;

use super::aggregate::AggregatedPrediction;
use super::regression::RegressionModel;

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct RankedTopic {
    pub topic_id: usize,
    pub frequency: f64,
    pub probability: f64,
    pub predicted: f64,
    /// 1 is the most confident topic.
    pub rank: usize,
}

/// Orders topics by regression-predicted probability. Exact ties fall back to average
/// frequency, then average probability (both descending), then topic id.
pub fn rank_topics(
    aggregated: &[AggregatedPrediction],
    regression: &RegressionModel,
) -> Vec<RankedTopic> {
    let mut scored = aggregated
        .iter()
        .map(|topic| (topic, regression.predict(topic.average_frequency)))
        .collect::<Vec<(&AggregatedPrediction, f64)>>();

    scored.sort_by(|(left, left_predicted), (right, right_predicted)| {
        right_predicted
            .total_cmp(left_predicted)
            .then_with(|| right.average_frequency.total_cmp(&left.average_frequency))
            .then_with(|| right.average_probability.total_cmp(&left.average_probability))
            .then_with(|| left.topic_id.cmp(&right.topic_id))
    });

    scored
        .into_iter()
        .enumerate()
        .map(|(position, (topic, predicted))| RankedTopic {
            topic_id: topic.topic_id,
            frequency: topic.average_frequency,
            probability: topic.average_probability,
            predicted,
            rank: position + 1,
        })
        .collect()
}

pub fn regression_points(aggregated: &[AggregatedPrediction]) -> Vec<(f64, f64)> {
    aggregated
        .iter()
        .map(|topic| (topic.average_frequency, topic.average_probability))
        .collect()
}
