use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::store::{LdaTopic, PredictedSentenceRow, StatusStore};
use crate::util::{ensure_directory, file_name_component, parse_csv, table_to_csv, write_text};

pub const VALIDATION_TRIALS: usize = 5;
pub const VALIDATION_SAMPLES: usize = 100;

const TOPIC_CSV_HEADER: [&str; 6] = ["domain", "topic_num", "coherent", "raw_topic", "query", "label"];

const SENTENCE_CSV_HEADER: [&str; 9] = [
    "topic_rank",
    "label",
    "raw_sent",
    "raw_sent_rank",
    "review_rating",
    "probability",
    "tag_uuid",
    "product_key",
    "summary_component",
];

/// Writes a trained model's topics for curation. An existing file is kept unless `overwrite`.
pub fn write_topic_csv(path: &Path, topics: &[LdaTopic], overwrite: bool) -> Result<bool> {
    if path.exists() && !overwrite {
        info!(path = %path.display(), "topic csv already present; keeping curated copy");
        return Ok(false);
    }
    let mut rows = vec![header(&TOPIC_CSV_HEADER)];
    rows.extend(topics.iter().map(|topic| {
        vec![
            format!("{}+{}", topic.domain, topic.subdomain),
            topic.topic_num.to_string(),
            topic.coherent.to_string(),
            topic.raw_topic.clone(),
            topic.query.clone(),
            topic.label.clone(),
        ]
    }));
    write_text(path, &table_to_csv(&rows))?;
    info!(path = %path.display(), topics = topics.len(), "wrote topic csv");
    Ok(true)
}

#[derive(Clone, Debug, PartialEq)]
pub struct TopicCuration {
    pub topic_num: usize,
    pub coherent: bool,
    pub query: String,
    pub label: String,
}

/// Reads curated topic rows back; malformed rows are logged and skipped.
pub fn read_topic_csv(path: &Path) -> Result<Vec<TopicCuration>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let rows = parse_csv(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
    let Some((head, body)) = rows.split_first() else {
        bail!("topic csv is empty: {}", path.display());
    };

    let column = |name: &str| -> Result<usize> {
        head.iter()
            .position(|value| value.trim().eq_ignore_ascii_case(name))
            .with_context(|| format!("topic csv {} has no {name} column", path.display()))
    };
    let topic_column = column("topic_num")?;
    let coherent_column = column("coherent")?;
    let query_column = column("query")?;
    let label_column = column("label")?;

    let mut out = Vec::<TopicCuration>::new();
    for (line, row) in body.iter().enumerate() {
        let cell = |index: usize| row.get(index).map(|value| value.trim()).unwrap_or_default();
        let Ok(topic_num) = cell(topic_column).parse::<usize>() else {
            warn!(line = line + 2, "topic csv row has no valid topic_num; skipping");
            continue;
        };
        let Some(coherent) = parse_flag(cell(coherent_column)) else {
            warn!(line = line + 2, topic = topic_num, "topic csv row has no valid coherent value; skipping");
            continue;
        };
        out.push(TopicCuration {
            topic_num,
            coherent,
            query: cell(query_column).to_string(),
            label: cell(label_column).to_string(),
        });
    }
    Ok(out)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

pub fn ranked_topics_csv_path(dump_root: &Path, frsku: &str) -> PathBuf {
    dump_root
        .join("lda")
        .join(format!("LDA_predicted_TOPICS_{}.csv", file_name_component(frsku)))
}

pub fn dump_ranked_topics(store: &StatusStore, dump_root: &Path, frsku: &str) -> Result<PathBuf> {
    let path = ranked_topics_csv_path(dump_root, frsku);
    let mut rows = vec![header(&["topic_rank", "topic_num", "label", "frequency"])];
    for topic in store.ranked_topics(frsku)? {
        rows.push(vec![
            topic.rank.to_string(),
            topic.topic_num.to_string(),
            topic.label.clone(),
            topic.frequency.to_string(),
        ]);
    }
    write_text(&path, &table_to_csv(&rows))?;
    info!(path = %path.display(), topics = rows.len() - 1, "dumped ranked topics");
    Ok(path)
}

/// Writes predicted sentences in topic rank then sentence rank order.
pub fn dump_predicted_sentences(
    store: &StatusStore,
    dump_root: &Path,
    frsku: &str,
    vector_model_name: &str,
) -> Result<PathBuf> {
    let name = vector_model_name.replace("MODEL", "SENTS");
    let path = dump_root
        .join("doc2vec")
        .join("analysis")
        .join(format!("{name}.csv"));
    let sentences = store.predicted_sentences(frsku)?;
    let quoted = summary_tags(&sentences);
    write_sentence_csv(&path, frsku, &sentences, &quoted, false)?;
    info!(path = %path.display(), sentences = sentences.len(), "dumped predicted sentences");
    Ok(path)
}

/// Samples (with replacement) predicted sentences into trial files for manual review.
pub fn dump_validation_files(
    store: &StatusStore,
    dump_root: &Path,
    frsku: &str,
    vector_model_name: &str,
    seed: Option<u64>,
) -> Result<Vec<PathBuf>> {
    let sentences = store.predicted_sentences(frsku)?;
    if sentences.is_empty() {
        warn!(frsku = %frsku, "no predicted sentences to sample for validation");
        return Ok(Vec::new());
    }

    let mut rng = match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => StdRng::from_os_rng(),
    };
    let quoted = summary_tags(&sentences);
    let name = vector_model_name.replace("MODEL", "VALIDATION");
    let directory = dump_root.join("doc2vec").join("validation");
    let mut written = Vec::<PathBuf>::with_capacity(VALIDATION_TRIALS);

    for trial in 1..=VALIDATION_TRIALS {
        let sample = (0..VALIDATION_SAMPLES)
            .map(|_| sentences[rng.random_range(0..sentences.len())].clone())
            .collect::<Vec<PredictedSentenceRow>>();
        let path = directory.join(format!("{name}_T{trial}.csv"));
        write_sentence_csv(&path, frsku, &sample, &quoted, true)?;
        written.push(path);
    }
    info!(frsku = %frsku, files = written.len(), "wrote validation files");
    Ok(written)
}

fn write_sentence_csv(
    path: &Path,
    frsku: &str,
    sentences: &[PredictedSentenceRow],
    quoted: &HashSet<String>,
    validation: bool,
) -> Result<()> {
    let mut head = header(&SENTENCE_CSV_HEADER);
    if validation {
        head.push("sent_valid".to_string());
    }
    let mut rows = vec![head];
    for sentence in sentences {
        let mut row = vec![
            sentence.topic_rank.to_string(),
            sentence.label.clone(),
            sentence.text.clone(),
            sentence.raw_sent_rank.to_string(),
            sentence.review_rating.to_string(),
            sentence.probability.to_string(),
            sentence.tag_uuid.clone(),
            frsku.to_string(),
            quoted.contains(&sentence.tag_uuid).to_string(),
        ];
        if validation {
            row.push(String::new());
        }
        rows.push(row);
    }
    write_text(path, &table_to_csv(&rows))
}

/// Tags of the sentences a topic summary quotes; rows arrive in topic then sentence rank order.
fn summary_tags(sentences: &[PredictedSentenceRow]) -> HashSet<String> {
    let mut per_topic = HashMap::<usize, usize>::new();
    let mut out = HashSet::<String>::new();
    for sentence in sentences {
        let taken = per_topic.entry(sentence.topic_num).or_insert(0);
        if *taken < super::analysis::SUMMARY_SENTENCES_PER_TOPIC {
            *taken += 1;
            out.insert(sentence.tag_uuid.clone());
        }
    }
    out
}

/// Writes the stored raw summary and each topical summary as text files.
pub fn write_summary_files(store: &StatusStore, dump_root: &Path, frsku: &str) -> Result<Option<PathBuf>> {
    let Some(raw) = store.raw_summary(frsku)? else {
        return Ok(None);
    };
    let root = dump_root.join("summary").join(file_name_component(frsku));
    let raw_path = root.join("raw").join("raw_summary.txt");
    write_text(&raw_path, &raw)?;

    let topical_dir = root.join("topical_raw");
    ensure_directory(&topical_dir)?;
    let topical = store.topical_summaries(frsku)?;
    for summary in &topical {
        let path = topical_dir.join(format!(
            "aspect_{}_topic_{}.txt",
            summary.topic_rank, summary.topic_num
        ));
        write_text(&path, &summary.body)?;
    }
    info!(frsku = %frsku, path = %root.display(), topical = topical.len(), "wrote summary files");
    Ok(Some(raw_path))
}

fn header(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|column| column.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{TopicCuration, read_topic_csv, write_topic_csv};
    use crate::store::LdaTopic;

    fn topic(topic_num: usize, raw_topic: &str) -> LdaTopic {
        LdaTopic {
            model_name: "LDA_MODEL_kitchen".to_string(),
            domain: "kitchen".to_string(),
            subdomain: "fridge".to_string(),
            topic_num,
            raw_topic: raw_topic.to_string(),
            coherent: true,
            query: String::new(),
            label: String::new(),
        }
    }

    #[test]
    fn topic_csv_round_trips_curation_columns() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("topics.csv");
        let topics = vec![
            topic(0, r#"0.045*"ice" + 0.030*"maker""#),
            topic(1, r#"0.050*"door", 0.020*"seal""#),
        ];
        assert!(write_topic_csv(&path, &topics, false).expect("write"));
        assert!(!write_topic_csv(&path, &topics, false).expect("keep curated"));

        let curated = std::fs::read_to_string(&path)
            .expect("read")
            .replacen("kitchen+fridge,1,true", "kitchen+fridge,1,no", 1);
        std::fs::write(&path, curated).expect("write curated");

        let rows = read_topic_csv(&path).expect("read topics");
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1],
            TopicCuration {
                topic_num: 1,
                coherent: false,
                query: String::new(),
                label: String::new(),
            }
        );
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("topics.csv");
        std::fs::write(
            &path,
            "domain,topic_num,coherent,raw_topic,query,label\n\
             kitchen+fridge,x,true,,,\n\
             kitchen+fridge,2,maybe,,,\n\
             kitchen+fridge,3,false,,ice cube,Ice\n",
        )
        .expect("write");
        let rows = read_topic_csv(&path).expect("read topics");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].topic_num, 3);
        assert_eq!(rows[0].query, "ice cube");
        assert!(!rows[0].coherent);
    }
}
