use std::collections::BTreeMap;

use super::sampling::GroupedFrequency;

/// Averages for one topic over every iteration of a run.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AggregatedPrediction {
    pub topic_id: usize,
    pub average_frequency: f64,
    pub average_probability: f64,
}

/// Running totals threaded through the iteration loop as a fold value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PredictionAccumulator {
    iterations: usize,
    totals: BTreeMap<usize, TopicTotals>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
struct TopicTotals {
    frequency: u64,
    weighted_probability: f64,
}

impl PredictionAccumulator {
    pub fn absorb(mut self, iteration: &BTreeMap<usize, GroupedFrequency>) -> Self {
        self.iterations += 1;
        for (topic, grouped) in iteration {
            let totals = self.totals.entry(*topic).or_default();
            totals.frequency += grouped.frequency;
            totals.weighted_probability += grouped.weighted_mean_probability;
        }
        self
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    /// Divides every topic's totals by the number of iterations absorbed, in topic order.
    pub fn finalize(self) -> Vec<AggregatedPrediction> {
        if self.iterations == 0 {
            return Vec::new();
        }
        let iterations = self.iterations as f64;
        self.totals
            .into_iter()
            .map(|(topic_id, totals)| AggregatedPrediction {
                topic_id,
                average_frequency: totals.frequency as f64 / iterations,
                average_probability: totals.weighted_probability / iterations,
            })
            .collect()
    }
}
