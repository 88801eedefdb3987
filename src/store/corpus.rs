use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use rusqlite::{OptionalExtension, params};

use super::{StatusStore, column_as};
use crate::util::now_utc_string;

#[derive(Clone, Debug, PartialEq)]
pub struct TrainingDomain {
    pub domain: String,
    pub subdomain: String,
    pub topic_count: usize,
    pub passes: usize,
    pub chunk_size: usize,
    pub no_below: usize,
    pub no_above: f64,
    pub keep_n: Option<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PageStatus {
    Uncrawled,
    Crawled,
    Failed,
}

impl PageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uncrawled => "uncrawled",
            Self::Crawled => "crawled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "uncrawled" => Ok(Self::Uncrawled),
            "crawled" => Ok(Self::Crawled),
            "failed" => Ok(Self::Failed),
            other => bail!("unknown review page status: {other}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReviewPage {
    pub record_id: i64,
    pub page_num: i64,
    pub body: String,
    pub fail: bool,
    pub status: PageStatus,
}

#[derive(Clone, Debug)]
pub struct NewReview {
    pub page_num: i64,
    pub position: i64,
    pub rating: f64,
    pub title: Option<String>,
    pub body: String,
}

#[derive(Clone, Debug)]
pub struct ReviewRow {
    pub review_id: i64,
    pub frsku: String,
    pub merchant: String,
    pub rating: f64,
    pub title: Option<String>,
    pub body: String,
}

/// NLP output for one review, written in a single transaction per batch.
#[derive(Clone, Debug)]
pub struct AnalyzedReview {
    pub review_id: i64,
    pub frsku: String,
    pub text_hash: String,
    pub duplicate: bool,
    pub sentences: Vec<(String, String)>,
    pub tokens: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SentenceRow {
    pub tag_uuid: String,
    pub review_id: i64,
    pub text: String,
    pub rating: f64,
}

#[derive(Clone, Debug)]
pub struct BowDocument {
    pub review_id: i64,
    pub tokens: Vec<String>,
}

impl StatusStore {
    pub fn upsert_merchant(&self, name: &str, base_url: Option<&str>) -> Result<()> {
        self.connection()
            .execute(
                "INSERT INTO merchants(name, base_url) VALUES(?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET base_url = excluded.base_url",
                params![name, base_url],
            )
            .with_context(|| format!("failed to upsert merchant {name}"))?;
        Ok(())
    }

    pub fn upsert_training_domain(&self, domain: &TrainingDomain) -> Result<()> {
        self.connection()
            .execute(
                "INSERT INTO training_domains(
                   domain, subdomain, topic_count, passes, chunk_size, no_below, no_above, keep_n
                 ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(domain, subdomain) DO UPDATE SET
                   topic_count = excluded.topic_count,
                   passes = excluded.passes,
                   chunk_size = excluded.chunk_size,
                   no_below = excluded.no_below,
                   no_above = excluded.no_above,
                   keep_n = excluded.keep_n",
                params![
                    domain.domain,
                    domain.subdomain,
                    domain.topic_count as i64,
                    domain.passes as i64,
                    domain.chunk_size as i64,
                    domain.no_below as i64,
                    domain.no_above,
                    domain.keep_n.map(|value| value as i64),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to upsert training domain {}+{}",
                    domain.domain, domain.subdomain
                )
            })?;
        Ok(())
    }

    pub fn training_domain(&self, domain: &str, subdomain: &str) -> Result<Option<TrainingDomain>> {
        let row = self
            .connection()
            .query_row(
                "SELECT domain, subdomain, topic_count, passes, chunk_size, no_below, no_above, keep_n
                 FROM training_domains WHERE domain = ?1 AND subdomain = ?2",
                params![domain, subdomain],
                |row| {
                    Ok(TrainingDomain {
                        domain: row.get(0)?,
                        subdomain: row.get(1)?,
                        topic_count: column_as::<usize>(row, 2)?,
                        passes: column_as::<usize>(row, 3)?,
                        chunk_size: column_as::<usize>(row, 4)?,
                        no_below: column_as::<usize>(row, 5)?,
                        no_above: row.get(6)?,
                        keep_n: match row.get::<_, Option<i64>>(7)? {
                            Some(_) => Some(column_as::<usize>(row, 7)?),
                            None => None,
                        },
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load training domain {domain}+{subdomain}"))?;
        Ok(row)
    }

    /// Inserts or refreshes a product without touching its progress flags.
    pub fn upsert_product(
        &self,
        frsku: &str,
        title: Option<&str>,
        domain: &str,
        subdomain: &str,
    ) -> Result<()> {
        self.connection()
            .execute(
                "INSERT INTO products(frsku, title, domain, subdomain, flags, updated_at)
                 VALUES(?1, ?2, ?3, ?4, 0, ?5)
                 ON CONFLICT(frsku) DO UPDATE SET
                   title = COALESCE(excluded.title, products.title),
                   domain = excluded.domain,
                   subdomain = excluded.subdomain",
                params![frsku, title, domain, subdomain, now_utc_string()],
            )
            .with_context(|| format!("failed to upsert product {frsku}"))?;
        Ok(())
    }

    pub fn upsert_source_record(
        &self,
        frsku: &str,
        merchant: &str,
        url: Option<&str>,
        detail_page: Option<&str>,
    ) -> Result<i64> {
        self.connection()
            .execute(
                "INSERT INTO source_records(frsku, merchant, url, detail_page, flags, updated_at)
                 VALUES(?1, ?2, ?3, ?4, 0, ?5)
                 ON CONFLICT(frsku, merchant) DO UPDATE SET
                   url = COALESCE(excluded.url, source_records.url),
                   detail_page = COALESCE(excluded.detail_page, source_records.detail_page)",
                params![frsku, merchant, url, detail_page, now_utc_string()],
            )
            .with_context(|| format!("failed to upsert source record {frsku}/{merchant}"))?;

        let record_id = self.connection().query_row(
            "SELECT record_id FROM source_records WHERE frsku = ?1 AND merchant = ?2",
            params![frsku, merchant],
            |row| row.get(0),
        )?;
        Ok(record_id)
    }

    pub fn upsert_review_page(
        &self,
        record_id: i64,
        page_num: i64,
        body: &str,
        fail: bool,
    ) -> Result<()> {
        self.connection()
            .execute(
                "INSERT INTO review_pages(record_id, page_num, body, fail, status)
                 VALUES(?1, ?2, ?3, ?4, 'uncrawled')
                 ON CONFLICT(record_id, page_num) DO UPDATE SET
                   body = excluded.body,
                   fail = excluded.fail",
                params![record_id, page_num, body, fail as i64],
            )
            .with_context(|| format!("failed to upsert review page {page_num} for {record_id}"))?;
        Ok(())
    }

    pub fn store_parsed_detail(
        &self,
        record_id: i64,
        title: Option<&str>,
        review_count: i64,
    ) -> Result<()> {
        self.connection().execute(
            "UPDATE source_records SET title = ?1, review_count = ?2, updated_at = ?3
             WHERE record_id = ?4",
            params![title, review_count, now_utc_string(), record_id],
        )?;
        Ok(())
    }

    pub fn store_queued_urls(&self, record_id: i64, urls: &[String]) -> Result<()> {
        let encoded = serde_json::to_string(urls).context("failed to encode queued urls")?;
        self.connection().execute(
            "UPDATE source_records SET queued_urls = ?1, updated_at = ?2 WHERE record_id = ?3",
            params![encoded, now_utc_string(), record_id],
        )?;
        Ok(())
    }

    pub fn review_pages(&self, record_id: i64, statuses: &[PageStatus]) -> Result<Vec<ReviewPage>> {
        let mut statement = self.connection().prepare(
            "SELECT record_id, page_num, body, fail, status
             FROM review_pages WHERE record_id = ?1 ORDER BY page_num ASC",
        )?;
        let mut rows = statement.query([record_id])?;
        let mut out = Vec::<ReviewPage>::new();

        while let Some(row) = rows.next()? {
            let status = row.get::<_, String>(4)?.parse::<PageStatus>()?;
            if !statuses.is_empty() && !statuses.contains(&status) {
                continue;
            }
            out.push(ReviewPage {
                record_id: row.get(0)?,
                page_num: row.get(1)?,
                body: row.get(2)?,
                fail: row.get::<_, i64>(3)? != 0,
                status,
            });
        }

        Ok(out)
    }

    pub fn set_page_status(&self, record_id: i64, page_num: i64, status: PageStatus) -> Result<()> {
        self.connection().execute(
            "UPDATE review_pages SET status = ?1, crawled_at = ?2
             WHERE record_id = ?3 AND page_num = ?4",
            params![status.as_str(), now_utc_string(), record_id, page_num],
        )?;
        Ok(())
    }

    /// Inserts parsed reviews; rows already present for the same page position are left alone.
    pub fn insert_reviews(
        &mut self,
        record_id: i64,
        frsku: &str,
        merchant: &str,
        reviews: &[NewReview],
    ) -> Result<usize> {
        let tx = self
            .connection_mut()
            .transaction()
            .context("failed to start review transaction")?;
        let mut inserted = 0usize;
        {
            let mut statement = tx.prepare(
                "INSERT OR IGNORE INTO reviews(
                   record_id, frsku, merchant, page_num, position, rating, title, body
                 ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for review in reviews {
                inserted += statement.execute(params![
                    record_id,
                    frsku,
                    merchant,
                    review.page_num,
                    review.position,
                    review.rating,
                    review.title,
                    review.body,
                ])?;
            }
        }
        tx.commit().context("failed to commit reviews")?;
        Ok(inserted)
    }

    pub fn pending_reviews(&self, frsku: &str) -> Result<Vec<ReviewRow>> {
        let mut statement = self.connection().prepare(
            "SELECT review_id, frsku, merchant, rating, title, body
             FROM reviews WHERE frsku = ?1 AND analyzed = 0
             ORDER BY review_id ASC",
        )?;
        let rows = statement.query_map([frsku], |row| {
            Ok(ReviewRow {
                review_id: row.get(0)?,
                frsku: row.get(1)?,
                merchant: row.get(2)?,
                rating: row.get(3)?,
                title: row.get(4)?,
                body: row.get(5)?,
            })
        })?;
        let mut out = Vec::<ReviewRow>::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn known_review_hashes(&self, frsku: &str) -> Result<HashSet<String>> {
        let mut statement = self.connection().prepare(
            "SELECT text_hash FROM reviews
             WHERE frsku = ?1 AND analyzed = 1 AND is_duplicate = 0 AND text_hash IS NOT NULL",
        )?;
        let rows = statement.query_map([frsku], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::<String>::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    pub fn store_analysis(&mut self, batch: &[AnalyzedReview]) -> Result<()> {
        let tx = self
            .connection_mut()
            .transaction()
            .context("failed to start analysis transaction")?;
        {
            let mut mark = tx.prepare(
                "UPDATE reviews SET text_hash = ?1, is_duplicate = ?2, analyzed = 1
                 WHERE review_id = ?3",
            )?;
            let mut sentence = tx.prepare(
                "INSERT OR REPLACE INTO sentences(tag_uuid, review_id, frsku, position, text)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut bow = tx.prepare(
                "INSERT OR REPLACE INTO bow_docs(review_id, frsku, tokens) VALUES(?1, ?2, ?3)",
            )?;

            for review in batch {
                mark.execute(params![review.text_hash, review.duplicate as i64, review.review_id])?;
                if review.duplicate {
                    continue;
                }
                for (position, (tag, text)) in review.sentences.iter().enumerate() {
                    sentence.execute(params![
                        tag,
                        review.review_id,
                        review.frsku,
                        position as i64,
                        text
                    ])?;
                }
                if !review.tokens.is_empty() {
                    bow.execute(params![
                        review.review_id,
                        review.frsku,
                        review.tokens.join(" ")
                    ])?;
                }
            }
        }
        tx.commit().context("failed to commit analysis")?;
        Ok(())
    }

    pub fn bow_documents(&self, frsku: &str) -> Result<Vec<BowDocument>> {
        let mut statement = self.connection().prepare(
            "SELECT review_id, tokens FROM bow_docs WHERE frsku = ?1 ORDER BY review_id ASC",
        )?;
        let rows = statement.query_map([frsku], |row| {
            let tokens: String = row.get(1)?;
            Ok(BowDocument {
                review_id: row.get(0)?,
                tokens: tokens.split_whitespace().map(ToOwned::to_owned).collect(),
            })
        })?;
        let mut out = Vec::<BowDocument>::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn domain_bow_documents(&self, domain: &str, subdomain: &str) -> Result<Vec<BowDocument>> {
        let mut out = Vec::<BowDocument>::new();
        for frsku in self.products_in_domain(domain, subdomain)? {
            out.extend(self.bow_documents(&frsku)?);
        }
        Ok(out)
    }

    pub fn sentences_for(&self, frsku: &str) -> Result<Vec<SentenceRow>> {
        let mut statement = self.connection().prepare(
            "SELECT s.tag_uuid, s.review_id, s.text, r.rating
             FROM sentences s JOIN reviews r ON r.review_id = s.review_id
             WHERE s.frsku = ?1
             ORDER BY s.review_id ASC, s.position ASC",
        )?;
        let rows = statement.query_map([frsku], sentence_from_row)?;
        let mut out = Vec::<SentenceRow>::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn sentence_by_tag(&self, tag_uuid: &str) -> Result<Option<SentenceRow>> {
        let row = self
            .connection()
            .query_row(
                "SELECT s.tag_uuid, s.review_id, s.text, r.rating
                 FROM sentences s JOIN reviews r ON r.review_id = s.review_id
                 WHERE s.tag_uuid = ?1",
                [tag_uuid],
                sentence_from_row,
            )
            .optional()
            .with_context(|| format!("failed to look up sentence {tag_uuid}"))?;
        Ok(row)
    }

    pub fn analyzed_review_count(&self, frsku: &str) -> Result<i64> {
        let count = self.connection().query_row(
            "SELECT COUNT(*) FROM reviews WHERE frsku = ?1 AND analyzed = 1 AND is_duplicate = 0",
            [frsku],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Counts of unique reviews per star, index 0 = one star.
    pub fn rating_distribution(&self, frsku: &str) -> Result<[i64; 5]> {
        let mut statement = self.connection().prepare(
            "SELECT CAST(ROUND(rating) AS INTEGER), COUNT(*) FROM reviews
             WHERE frsku = ?1 AND is_duplicate = 0
             GROUP BY CAST(ROUND(rating) AS INTEGER)",
        )?;
        let mut rows = statement.query([frsku])?;
        let mut out = [0_i64; 5];
        while let Some(row) = rows.next()? {
            let star: i64 = row.get(0)?;
            let count: i64 = row.get(1)?;
            if (1..=5).contains(&star) {
                out[(star - 1) as usize] += count;
            }
        }
        Ok(out)
    }
}

fn sentence_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SentenceRow> {
    Ok(SentenceRow {
        tag_uuid: row.get(0)?,
        review_id: row.get(1)?,
        text: row.get(2)?,
        rating: row.get(3)?,
    })
}
