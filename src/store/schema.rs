use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::Connection;

use crate::util::now_utc_string;

pub const DB_SCHEMA_VERSION: &str = "0.3.0";

pub(super) fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set busy timeout")?;
    Ok(())
}

pub(super) fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS merchants (
          name TEXT PRIMARY KEY,
          base_url TEXT
        );

        CREATE TABLE IF NOT EXISTS training_domains (
          domain TEXT NOT NULL,
          subdomain TEXT NOT NULL,
          topic_count INTEGER NOT NULL,
          passes INTEGER NOT NULL,
          chunk_size INTEGER NOT NULL,
          no_below INTEGER NOT NULL,
          no_above REAL NOT NULL,
          keep_n INTEGER,
          PRIMARY KEY (domain, subdomain)
        );

        CREATE TABLE IF NOT EXISTS products (
          frsku TEXT PRIMARY KEY,
          title TEXT,
          domain TEXT NOT NULL,
          subdomain TEXT NOT NULL,
          flags INTEGER NOT NULL DEFAULT 0,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS source_records (
          record_id INTEGER PRIMARY KEY AUTOINCREMENT,
          frsku TEXT NOT NULL,
          merchant TEXT NOT NULL,
          url TEXT,
          detail_page TEXT,
          title TEXT,
          review_count INTEGER,
          queued_urls TEXT,
          flags INTEGER NOT NULL DEFAULT 0,
          updated_at TEXT NOT NULL,
          UNIQUE (frsku, merchant),
          FOREIGN KEY (frsku) REFERENCES products(frsku)
        );

        CREATE TABLE IF NOT EXISTS stage_claims (
          record_id INTEGER NOT NULL,
          stage TEXT NOT NULL,
          claimed_at TEXT NOT NULL,
          PRIMARY KEY (record_id, stage)
        );

        CREATE TABLE IF NOT EXISTS review_pages (
          record_id INTEGER NOT NULL,
          page_num INTEGER NOT NULL,
          body TEXT NOT NULL,
          fail INTEGER NOT NULL DEFAULT 0,
          status TEXT NOT NULL DEFAULT 'uncrawled',
          crawled_at TEXT,
          PRIMARY KEY (record_id, page_num),
          FOREIGN KEY (record_id) REFERENCES source_records(record_id)
        );

        CREATE TABLE IF NOT EXISTS reviews (
          review_id INTEGER PRIMARY KEY AUTOINCREMENT,
          record_id INTEGER NOT NULL,
          frsku TEXT NOT NULL,
          merchant TEXT NOT NULL,
          page_num INTEGER NOT NULL,
          position INTEGER NOT NULL,
          rating REAL NOT NULL,
          title TEXT,
          body TEXT NOT NULL,
          text_hash TEXT,
          is_duplicate INTEGER NOT NULL DEFAULT 0,
          analyzed INTEGER NOT NULL DEFAULT 0,
          UNIQUE (record_id, page_num, position)
        );

        CREATE TABLE IF NOT EXISTS sentences (
          tag_uuid TEXT PRIMARY KEY,
          review_id INTEGER NOT NULL,
          frsku TEXT NOT NULL,
          position INTEGER NOT NULL,
          text TEXT NOT NULL,
          FOREIGN KEY (review_id) REFERENCES reviews(review_id)
        );

        CREATE TABLE IF NOT EXISTS bow_docs (
          review_id INTEGER PRIMARY KEY,
          frsku TEXT NOT NULL,
          tokens TEXT NOT NULL,
          FOREIGN KEY (review_id) REFERENCES reviews(review_id)
        );

        CREATE TABLE IF NOT EXISTS lda_topics (
          model_name TEXT NOT NULL,
          domain TEXT NOT NULL,
          subdomain TEXT NOT NULL,
          topic_num INTEGER NOT NULL,
          raw_topic TEXT NOT NULL,
          coherent INTEGER NOT NULL DEFAULT 1,
          query TEXT NOT NULL DEFAULT '',
          label TEXT NOT NULL DEFAULT '',
          PRIMARY KEY (model_name, topic_num)
        );

        CREATE TABLE IF NOT EXISTS predicted_topics (
          frsku TEXT NOT NULL,
          topic_num INTEGER NOT NULL,
          model_name TEXT NOT NULL,
          frequency REAL NOT NULL,
          probability REAL NOT NULL,
          predicted REAL NOT NULL,
          rank INTEGER NOT NULL,
          PRIMARY KEY (frsku, topic_num)
        );

        CREATE TABLE IF NOT EXISTS lda_regressions (
          regression_id INTEGER PRIMARY KEY AUTOINCREMENT,
          frsku TEXT NOT NULL,
          model_name TEXT NOT NULL,
          slope REAL NOT NULL,
          intercept REAL NOT NULL,
          r_value REAL NOT NULL,
          p_value REAL NOT NULL,
          std_err REAL NOT NULL,
          points TEXT NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS predicted_sents (
          frsku TEXT NOT NULL,
          topic_num INTEGER NOT NULL,
          tag_uuid TEXT NOT NULL,
          raw_sent_rank INTEGER NOT NULL,
          probability REAL NOT NULL,
          PRIMARY KEY (frsku, topic_num, tag_uuid)
        );

        CREATE TABLE IF NOT EXISTS aspect_ratings (
          frsku TEXT NOT NULL,
          topic_num INTEGER NOT NULL,
          rating REAL NOT NULL,
          PRIMARY KEY (frsku, topic_num)
        );

        CREATE TABLE IF NOT EXISTS raw_summaries (
          frsku TEXT PRIMARY KEY,
          body TEXT NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS topical_summaries (
          frsku TEXT NOT NULL,
          topic_rank INTEGER NOT NULL,
          topic_num INTEGER NOT NULL,
          label TEXT NOT NULL,
          aspect_rating REAL,
          body TEXT NOT NULL,
          PRIMARY KEY (frsku, topic_rank)
        );

        CREATE TABLE IF NOT EXISTS product_data (
          frsku TEXT PRIMARY KEY,
          data_json TEXT NOT NULL,
          created_at TEXT NOT NULL
        );
        ",
        )
        .context("failed to create schema")?;

    ensure_column_exists(connection, "reviews", "analyzed INTEGER NOT NULL DEFAULT 0")?;
    ensure_column_exists(connection, "source_records", "queued_urls TEXT")?;

    connection
        .execute_batch(
            "
        CREATE INDEX IF NOT EXISTS idx_source_records_frsku ON source_records(frsku);
        CREATE INDEX IF NOT EXISTS idx_reviews_frsku ON reviews(frsku, is_duplicate);
        CREATE INDEX IF NOT EXISTS idx_sentences_frsku ON sentences(frsku);
        CREATE INDEX IF NOT EXISTS idx_bow_docs_frsku ON bow_docs(frsku);
        CREATE INDEX IF NOT EXISTS idx_predicted_topics_rank ON predicted_topics(frsku, rank);
        ",
        )
        .context("failed to create indexes")?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

fn ensure_column_exists(
    connection: &Connection,
    table_name: &str,
    column_definition: &str,
) -> Result<()> {
    let Some(column_name) = column_definition.split_whitespace().next() else {
        bail!("invalid column definition: {column_definition}");
    };

    let pragma_sql = format!("PRAGMA table_info({table_name})");
    let mut statement = connection
        .prepare(&pragma_sql)
        .with_context(|| format!("failed to inspect schema for table {table_name}"))?;
    let mut rows = statement.query([])?;

    while let Some(row) = rows.next()? {
        let existing: String = row.get(1)?;
        if existing == column_name {
            return Ok(());
        }
    }

    connection
        .execute(
            &format!("ALTER TABLE {table_name} ADD COLUMN {column_definition}"),
            [],
        )
        .with_context(|| format!("failed to add column {column_name} to {table_name}"))?;

    Ok(())
}
