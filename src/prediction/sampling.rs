use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

/// One iteration's summary for a topic.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GroupedFrequency {
    pub frequency: u64,
    pub weighted_mean_probability: f64,
}

/// Sorts one document's predictions by descending probability. The sort is stable, so equal
/// probabilities keep the model's topic order.
pub fn sort_predictions(predictions: &mut [(usize, f64)]) {
    predictions.sort_by(|left, right| right.1.total_cmp(&left.1));
}

/// Picks the most probable coherent topic plus the coherent entries right after it whose
/// probability is equal at `precision` decimal digits.
pub fn select_valid_predictions(
    sorted: &[(usize, f64)],
    incoherent: &BTreeSet<usize>,
    precision: usize,
) -> Vec<(usize, f64)> {
    let Some(chosen) = sorted
        .iter()
        .position(|(topic, _)| !incoherent.contains(topic))
    else {
        return Vec::new();
    };

    let (_, best) = sorted[chosen];
    let best_key = round_key(best, precision);
    let mut valid = vec![sorted[chosen]];

    for (topic, probability) in &sorted[chosen + 1..] {
        if round_key(*probability, precision) != best_key {
            break;
        }
        if !incoherent.contains(topic) {
            valid.push((*topic, *probability));
        }
    }

    valid
}

fn round_key(value: f64, precision: usize) -> String {
    format!("{value:.precision$}")
}

/// Groups one iteration's valid predictions by topic. Each topic's mean probability is
/// weighted by its share of the iteration's predictions.
pub fn group_predictions(raw: &[(usize, f64)]) -> BTreeMap<usize, GroupedFrequency> {
    let total = raw.len();
    let mut sums = BTreeMap::<usize, (u64, f64)>::new();
    for (topic, probability) in raw {
        let entry = sums.entry(*topic).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += probability;
    }

    let mut out = BTreeMap::<usize, GroupedFrequency>::new();
    for (topic, (frequency, probability_sum)) in sums {
        if frequency == 0 || total == 0 {
            warn!(topic, "zero samples for topic; skipping it in this iteration");
            continue;
        }
        let mean = probability_sum / frequency as f64;
        out.insert(
            topic,
            GroupedFrequency {
                frequency,
                weighted_mean_probability: (frequency as f64 / total as f64) * mean,
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{group_predictions, select_valid_predictions, sort_predictions};

    #[test]
    fn skips_incoherent_leader_and_keeps_ties() {
        let mut predictions = vec![(0, 0.2), (1, 0.4), (2, 0.3), (3, 0.3), (4, 0.3)];
        sort_predictions(&mut predictions);
        let incoherent = BTreeSet::from([1, 3]);

        let valid = select_valid_predictions(&predictions, &incoherent, 17);
        assert_eq!(valid, vec![(2, 0.3), (4, 0.3)]);
    }

    #[test]
    fn tie_precision_controls_adjacency() {
        let sorted = vec![(0, 0.500_01), (1, 0.500_009), (2, 0.1)];
        let incoherent = BTreeSet::new();

        assert_eq!(select_valid_predictions(&sorted, &incoherent, 17).len(), 1);
        assert_eq!(select_valid_predictions(&sorted, &incoherent, 3).len(), 2);
    }

    #[test]
    fn all_incoherent_yields_nothing() {
        let sorted = vec![(0, 0.9), (1, 0.1)];
        let incoherent = BTreeSet::from([0, 1]);
        assert!(select_valid_predictions(&sorted, &incoherent, 17).is_empty());
    }

    #[test]
    fn grouping_weights_mean_by_share() {
        let grouped = group_predictions(&[(0, 0.8), (0, 0.6), (1, 0.5), (0, 0.7)]);
        let topic_zero = grouped[&0];
        assert_eq!(topic_zero.frequency, 3);
        assert!((topic_zero.weighted_mean_probability - 0.75 * 0.7).abs() < 1e-12);
        assert_eq!(grouped[&1].frequency, 1);
        assert!((grouped[&1].weighted_mean_probability - 0.125).abs() < 1e-12);
    }
}
