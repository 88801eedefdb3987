use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::{StatusStore, column_as};
use crate::prediction::{RankedTopic, RegressionModel, SentencePrediction};
use crate::util::now_utc_string;

#[derive(Clone, Debug, PartialEq)]
pub struct LdaTopic {
    pub model_name: String,
    pub domain: String,
    pub subdomain: String,
    pub topic_num: usize,
    pub raw_topic: String,
    pub coherent: bool,
    pub query: String,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredRankedTopic {
    pub topic_num: usize,
    pub rank: usize,
    pub model_name: String,
    pub frequency: f64,
    pub probability: f64,
    pub predicted: f64,
    pub label: String,
    pub query: String,
    pub raw_topic: String,
}

#[derive(Clone, Debug)]
pub struct StoredRegression {
    pub model: RegressionModel,
    pub points: Vec<(f64, f64)>,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PredictedSentenceRow {
    pub topic_num: usize,
    pub topic_rank: usize,
    pub label: String,
    pub tag_uuid: String,
    pub text: String,
    pub review_rating: f64,
    pub raw_sent_rank: usize,
    pub probability: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TopicalSummary {
    pub topic_rank: usize,
    pub topic_num: usize,
    pub label: String,
    pub aspect_rating: Option<f64>,
    pub body: String,
}

impl StatusStore {
    /// Stores a trained model's topics once; existing rows keep their curation.
    pub fn store_lda_topics(
        &mut self,
        model_name: &str,
        domain: &str,
        subdomain: &str,
        topics: &[(usize, String)],
    ) -> Result<usize> {
        let tx = self.connection_mut().transaction()?;
        let mut inserted = 0usize;
        {
            let mut statement = tx.prepare(
                "INSERT OR IGNORE INTO lda_topics(model_name, domain, subdomain, topic_num, raw_topic)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
            )?;
            for (topic_num, raw_topic) in topics {
                inserted += statement.execute(params![
                    model_name,
                    domain,
                    subdomain,
                    *topic_num as i64,
                    raw_topic
                ])?;
            }
        }
        tx.commit().context("failed to commit lda topics")?;
        Ok(inserted)
    }

    pub fn lda_topics(&self, model_name: &str) -> Result<Vec<LdaTopic>> {
        let mut statement = self.connection().prepare(
            "SELECT model_name, domain, subdomain, topic_num, raw_topic, coherent, query, label
             FROM lda_topics WHERE model_name = ?1 ORDER BY topic_num ASC",
        )?;
        let rows = statement.query_map([model_name], |row| {
            Ok(LdaTopic {
                model_name: row.get(0)?,
                domain: row.get(1)?,
                subdomain: row.get(2)?,
                topic_num: column_as::<usize>(row, 3)?,
                raw_topic: row.get(4)?,
                coherent: row.get::<_, i64>(5)? != 0,
                query: row.get(6)?,
                label: row.get(7)?,
            })
        })?;
        let mut out = Vec::<LdaTopic>::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Applies a curation row; returns false when no stored topic matches.
    pub fn update_lda_topic(
        &self,
        model_name: &str,
        topic_num: usize,
        coherent: bool,
        query: &str,
        label: &str,
    ) -> Result<bool> {
        let written = self.connection().execute(
            "UPDATE lda_topics SET coherent = ?1, query = ?2, label = ?3
             WHERE model_name = ?4 AND topic_num = ?5",
            params![coherent as i64, query, label, model_name, topic_num as i64],
        )?;
        Ok(written == 1)
    }

    pub fn incoherent_topics(&self, model_name: &str) -> Result<BTreeSet<usize>> {
        let mut statement = self.connection().prepare(
            "SELECT topic_num FROM lda_topics WHERE model_name = ?1 AND coherent = 0",
        )?;
        let rows = statement.query_map([model_name], |row| column_as::<usize>(row, 0))?;
        let mut out = BTreeSet::<usize>::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    pub fn has_ranked_topics(&self, frsku: &str) -> Result<bool> {
        Ok(count_for(self, "predicted_topics", frsku)? > 0)
    }

    pub fn clear_ranked_topics(&self, frsku: &str) -> Result<usize> {
        let removed = self
            .connection()
            .execute("DELETE FROM predicted_topics WHERE frsku = ?1", [frsku])?;
        Ok(removed)
    }

    pub fn store_ranked_topics(
        &mut self,
        frsku: &str,
        model_name: &str,
        topics: &[RankedTopic],
    ) -> Result<()> {
        let tx = self.connection_mut().transaction()?;
        {
            let mut statement = tx.prepare(
                "INSERT OR REPLACE INTO predicted_topics(
                   frsku, topic_num, model_name, frequency, probability, predicted, rank
                 ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for topic in topics {
                statement.execute(params![
                    frsku,
                    topic.topic_id as i64,
                    model_name,
                    topic.frequency,
                    topic.probability,
                    topic.predicted,
                    topic.rank as i64,
                ])?;
            }
        }
        tx.commit()
            .with_context(|| format!("failed to commit ranked topics for {frsku}"))?;
        Ok(())
    }

    pub fn ranked_topics(&self, frsku: &str) -> Result<Vec<StoredRankedTopic>> {
        let mut statement = self.connection().prepare(
            "SELECT p.topic_num, p.rank, p.model_name, p.frequency, p.probability, p.predicted,
                    COALESCE(t.label, ''), COALESCE(t.query, ''), COALESCE(t.raw_topic, '')
             FROM predicted_topics p
             LEFT JOIN lda_topics t ON t.model_name = p.model_name AND t.topic_num = p.topic_num
             WHERE p.frsku = ?1
             ORDER BY p.rank ASC",
        )?;
        let rows = statement.query_map([frsku], |row| {
            Ok(StoredRankedTopic {
                topic_num: column_as::<usize>(row, 0)?,
                rank: column_as::<usize>(row, 1)?,
                model_name: row.get(2)?,
                frequency: row.get(3)?,
                probability: row.get(4)?,
                predicted: row.get(5)?,
                label: row.get(6)?,
                query: row.get(7)?,
                raw_topic: row.get(8)?,
            })
        })?;
        let mut out = Vec::<StoredRankedTopic>::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn store_regression(
        &self,
        frsku: &str,
        model_name: &str,
        model: &RegressionModel,
        points: &[(f64, f64)],
    ) -> Result<()> {
        let encoded = serde_json::to_string(points).context("failed to encode regression data")?;
        self.connection().execute(
            "INSERT INTO lda_regressions(
               frsku, model_name, slope, intercept, r_value, p_value, std_err, points, created_at
             ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                frsku,
                model_name,
                model.slope,
                model.intercept,
                model.r_value,
                model.p_value,
                model.std_err,
                encoded,
                now_utc_string(),
            ],
        )?;
        Ok(())
    }

    pub fn latest_regression(&self, frsku: &str) -> Result<Option<StoredRegression>> {
        let row = self
            .connection()
            .query_row(
                "SELECT slope, intercept, r_value, p_value, std_err, points, created_at
                 FROM lda_regressions WHERE frsku = ?1
                 ORDER BY regression_id DESC LIMIT 1",
                [frsku],
                |row| {
                    Ok((
                        RegressionModel {
                            slope: row.get(0)?,
                            intercept: row.get(1)?,
                            r_value: row.get(2)?,
                            p_value: row.get(3)?,
                            std_err: row.get(4)?,
                        },
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((model, points, created_at)) = row else {
            return Ok(None);
        };
        let points = serde_json::from_str::<Vec<(f64, f64)>>(&points)
            .with_context(|| format!("failed to decode regression data for {frsku}"))?;
        Ok(Some(StoredRegression {
            model,
            points,
            created_at,
        }))
    }

    pub fn has_predicted_sentences(&self, frsku: &str) -> Result<bool> {
        Ok(count_for(self, "predicted_sents", frsku)? > 0)
    }

    pub fn clear_predicted_sentences(&self, frsku: &str) -> Result<usize> {
        let removed = self
            .connection()
            .execute("DELETE FROM predicted_sents WHERE frsku = ?1", [frsku])?;
        Ok(removed)
    }

    pub fn store_predicted_sentences(
        &mut self,
        frsku: &str,
        topic_num: usize,
        sentences: &[SentencePrediction],
    ) -> Result<()> {
        let tx = self.connection_mut().transaction()?;
        {
            let mut statement = tx.prepare(
                "INSERT OR REPLACE INTO predicted_sents(
                   frsku, topic_num, tag_uuid, raw_sent_rank, probability
                 ) VALUES(?1, ?2, ?3, ?4, ?5)",
            )?;
            for sentence in sentences {
                statement.execute(params![
                    frsku,
                    topic_num as i64,
                    sentence.tag_uuid,
                    sentence.raw_sent_rank as i64,
                    sentence.similarity,
                ])?;
            }
        }
        tx.commit()
            .with_context(|| format!("failed to commit predicted sentences for {frsku}"))?;
        Ok(())
    }

    /// Persisted sentences joined with their topic rank, ordered by topic rank then sentence rank.
    pub fn predicted_sentences(&self, frsku: &str) -> Result<Vec<PredictedSentenceRow>> {
        let mut statement = self.connection().prepare(
            "SELECT ps.topic_num, pt.rank, COALESCE(t.label, ''), ps.tag_uuid, s.text, r.rating,
                    ps.raw_sent_rank, ps.probability
             FROM predicted_sents ps
             JOIN predicted_topics pt ON pt.frsku = ps.frsku AND pt.topic_num = ps.topic_num
             LEFT JOIN lda_topics t ON t.model_name = pt.model_name AND t.topic_num = ps.topic_num
             JOIN sentences s ON s.tag_uuid = ps.tag_uuid
             JOIN reviews r ON r.review_id = s.review_id
             WHERE ps.frsku = ?1
             ORDER BY pt.rank ASC, ps.raw_sent_rank ASC",
        )?;
        let rows = statement.query_map([frsku], |row| {
            Ok(PredictedSentenceRow {
                topic_num: column_as::<usize>(row, 0)?,
                topic_rank: column_as::<usize>(row, 1)?,
                label: row.get(2)?,
                tag_uuid: row.get(3)?,
                text: row.get(4)?,
                review_rating: row.get(5)?,
                raw_sent_rank: column_as::<usize>(row, 6)?,
                probability: row.get(7)?,
            })
        })?;
        let mut out = Vec::<PredictedSentenceRow>::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn has_aspect_ratings(&self, frsku: &str) -> Result<bool> {
        Ok(count_for(self, "aspect_ratings", frsku)? > 0)
    }

    pub fn clear_aspect_ratings(&self, frsku: &str) -> Result<usize> {
        let removed = self
            .connection()
            .execute("DELETE FROM aspect_ratings WHERE frsku = ?1", [frsku])?;
        Ok(removed)
    }

    pub fn store_aspect_rating(&self, frsku: &str, topic_num: usize, rating: f64) -> Result<()> {
        self.connection().execute(
            "INSERT OR REPLACE INTO aspect_ratings(frsku, topic_num, rating) VALUES(?1, ?2, ?3)",
            params![frsku, topic_num as i64, rating],
        )?;
        Ok(())
    }

    pub fn aspect_ratings(&self, frsku: &str) -> Result<BTreeMap<usize, f64>> {
        let mut statement = self
            .connection()
            .prepare("SELECT topic_num, rating FROM aspect_ratings WHERE frsku = ?1")?;
        let rows = statement.query_map([frsku], |row| {
            Ok((column_as::<usize>(row, 0)?, row.get::<_, f64>(1)?))
        })?;
        let mut out = BTreeMap::<usize, f64>::new();
        for row in rows {
            let (topic_num, rating) = row?;
            out.insert(topic_num, rating);
        }
        Ok(out)
    }

    pub fn has_summary(&self, frsku: &str) -> Result<bool> {
        Ok(count_for(self, "raw_summaries", frsku)? > 0)
    }

    pub fn clear_summaries(&mut self, frsku: &str) -> Result<()> {
        let tx = self.connection_mut().transaction()?;
        tx.execute("DELETE FROM raw_summaries WHERE frsku = ?1", [frsku])?;
        tx.execute("DELETE FROM topical_summaries WHERE frsku = ?1", [frsku])?;
        tx.commit()
            .with_context(|| format!("failed to clear summaries for {frsku}"))?;
        Ok(())
    }

    pub fn store_summary(
        &mut self,
        frsku: &str,
        raw_body: &str,
        topical: &[TopicalSummary],
    ) -> Result<()> {
        let tx = self.connection_mut().transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO raw_summaries(frsku, body, created_at) VALUES(?1, ?2, ?3)",
            params![frsku, raw_body, now_utc_string()],
        )?;
        {
            let mut statement = tx.prepare(
                "INSERT OR REPLACE INTO topical_summaries(
                   frsku, topic_rank, topic_num, label, aspect_rating, body
                 ) VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for summary in topical {
                statement.execute(params![
                    frsku,
                    summary.topic_rank as i64,
                    summary.topic_num as i64,
                    summary.label,
                    summary.aspect_rating,
                    summary.body,
                ])?;
            }
        }
        tx.commit()
            .with_context(|| format!("failed to commit summary for {frsku}"))?;
        Ok(())
    }

    pub fn raw_summary(&self, frsku: &str) -> Result<Option<String>> {
        let body = self
            .connection()
            .query_row(
                "SELECT body FROM raw_summaries WHERE frsku = ?1",
                [frsku],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body)
    }

    pub fn topical_summaries(&self, frsku: &str) -> Result<Vec<TopicalSummary>> {
        let mut statement = self.connection().prepare(
            "SELECT topic_rank, topic_num, label, aspect_rating, body
             FROM topical_summaries WHERE frsku = ?1 ORDER BY topic_rank ASC",
        )?;
        let rows = statement.query_map([frsku], |row| {
            Ok(TopicalSummary {
                topic_rank: column_as::<usize>(row, 0)?,
                topic_num: column_as::<usize>(row, 1)?,
                label: row.get(2)?,
                aspect_rating: row.get(3)?,
                body: row.get(4)?,
            })
        })?;
        let mut out = Vec::<TopicalSummary>::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn store_product_data(&self, frsku: &str, data: &serde_json::Value) -> Result<()> {
        let encoded = serde_json::to_string(data).context("failed to encode product data")?;
        self.connection().execute(
            "INSERT INTO product_data(frsku, data_json, created_at) VALUES(?1, ?2, ?3)
             ON CONFLICT(frsku) DO UPDATE SET
               data_json = excluded.data_json,
               created_at = excluded.created_at",
            params![frsku, encoded, now_utc_string()],
        )?;
        Ok(())
    }

    pub fn product_data(&self, frsku: &str) -> Result<Option<serde_json::Value>> {
        let raw = self
            .connection()
            .query_row(
                "SELECT data_json FROM product_data WHERE frsku = ?1",
                [frsku],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        raw.map(|value| {
            serde_json::from_str(&value)
                .with_context(|| format!("failed to decode product data for {frsku}"))
        })
        .transpose()
    }
}

fn count_for(store: &StatusStore, table_name: &str, frsku: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {table_name} WHERE frsku = ?1");
    let count = store
        .connection()
        .query_row(&sql, [frsku], |row| row.get(0))
        .with_context(|| format!("failed to count {table_name} rows for {frsku}"))?;
    Ok(count)
}
