use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::stage::{FlagSet, Stage};
use crate::util::now_utc_string;

mod corpus;
mod results;
mod schema;

pub use corpus::*;
pub use results::*;
pub use schema::DB_SCHEMA_VERSION;

/// Unit of pipeline progress: one product, or one training domain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkItem {
    Product { frsku: String },
    Training { domain: String, subdomain: String },
}

impl WorkItem {
    pub fn product(frsku: &str) -> Self {
        Self::Product {
            frsku: frsku.trim().to_string(),
        }
    }

    /// Parses the `DOMAIN+SUBDOMAIN` form used on the command line.
    pub fn parse_training(value: &str) -> Result<Self> {
        let Some((domain, subdomain)) = value.split_once('+') else {
            bail!("training domain must look like DOMAIN+SUBDOMAIN: {value}");
        };
        let domain = domain.trim();
        let subdomain = subdomain.trim();
        if domain.is_empty() || subdomain.is_empty() {
            bail!("training domain must look like DOMAIN+SUBDOMAIN: {value}");
        }
        Ok(Self::Training {
            domain: domain.to_string(),
            subdomain: subdomain.to_string(),
        })
    }

    pub fn is_training(&self) -> bool {
        matches!(self, Self::Training { .. })
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Product { frsku } => write!(f, "product:{frsku}"),
            Self::Training { domain, subdomain } => write!(f, "training:{domain}+{subdomain}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceRecord {
    pub record_id: i64,
    pub frsku: String,
    pub merchant: String,
    pub url: Option<String>,
    pub detail_page: Option<String>,
    pub title: Option<String>,
    pub review_count: Option<i64>,
    pub queued_urls: Vec<String>,
    pub flags: FlagSet,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Product {
    pub frsku: String,
    pub title: Option<String>,
    pub domain: String,
    pub subdomain: String,
    pub flags: FlagSet,
}

/// Where a flag write lands: a merchant record or the product row above it.
#[derive(Copy, Clone, Debug)]
pub enum FlagTarget<'a> {
    Record(i64),
    Product(&'a str),
}

impl fmt::Display for FlagTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record(record_id) => write!(f, "record:{record_id}"),
            Self::Product(frsku) => write!(f, "product:{frsku}"),
        }
    }
}

const RECORD_COLUMNS: &str = "
  record_id, frsku, merchant, url, detail_page, title, review_count, queued_urls, flags
";

const CAS_ATTEMPTS: usize = 3;

pub struct StatusStore {
    connection: Connection,
}

impl StatusStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                crate::util::ensure_directory(parent)?;
            }
        }
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        schema::configure_connection(&connection)?;
        schema::ensure_schema(&connection)?;
        Ok(Self { connection })
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory database")?;
        schema::ensure_schema(&connection)?;
        Ok(Self { connection })
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn count_rows(&self, table_name: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {table_name}");
        let count = self
            .connection
            .query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("failed to count rows in {table_name}"))?;
        Ok(count)
    }

    pub fn product(&self, frsku: &str) -> Result<Option<Product>> {
        let product = self
            .connection
            .query_row(
                "SELECT frsku, title, domain, subdomain, flags FROM products WHERE frsku = ?1",
                [frsku],
                |row| {
                    Ok(Product {
                        frsku: row.get(0)?,
                        title: row.get(1)?,
                        domain: row.get(2)?,
                        subdomain: row.get(3)?,
                        flags: flags_column(row, 4)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load product {frsku}"))?;
        Ok(product)
    }

    pub fn list_products(&self) -> Result<Vec<String>> {
        let mut statement = self
            .connection
            .prepare("SELECT frsku FROM products ORDER BY frsku ASC")?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::<String>::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn products_in_domain(&self, domain: &str, subdomain: &str) -> Result<Vec<String>> {
        let mut statement = self.connection.prepare(
            "SELECT frsku FROM products WHERE domain = ?1 AND subdomain = ?2 ORDER BY frsku ASC",
        )?;
        let rows = statement.query_map(params![domain, subdomain], |row| row.get::<_, String>(0))?;
        let mut out = Vec::<String>::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn work_item_exists(&self, work_item: &WorkItem) -> Result<bool> {
        match work_item {
            WorkItem::Product { frsku } => Ok(self.product(frsku)?.is_some()),
            WorkItem::Training { domain, subdomain } => {
                Ok(self.training_domain(domain, subdomain)?.is_some())
            }
        }
    }

    /// Every source record under the work item, optionally narrowed to one merchant.
    pub fn records_for(
        &self,
        work_item: &WorkItem,
        merchant: Option<&str>,
    ) -> Result<Vec<SourceRecord>> {
        let (sql, keys): (String, Vec<String>) = match work_item {
            WorkItem::Product { frsku } => (
                format!("SELECT {RECORD_COLUMNS} FROM source_records WHERE frsku = ?1"),
                vec![frsku.clone()],
            ),
            WorkItem::Training { domain, subdomain } => (
                format!(
                    "SELECT {RECORD_COLUMNS} FROM source_records
                     WHERE frsku IN (SELECT frsku FROM products WHERE domain = ?1 AND subdomain = ?2)"
                ),
                vec![domain.clone(), subdomain.clone()],
            ),
        };

        let mut statement = self.connection.prepare(&sql)?;
        let mut rows = statement.query(rusqlite::params_from_iter(keys.iter()))?;
        let mut out = Vec::<SourceRecord>::new();
        while let Some(row) = rows.next()? {
            let record = source_record_from_row(row)?;
            if merchant.is_none_or(|name| record.merchant.eq_ignore_ascii_case(name)) {
                out.push(record);
            }
        }
        out.sort_by(|left, right| left.record_id.cmp(&right.record_id));
        Ok(out)
    }

    /// Records that are ready for `stage`: every earlier flag set and `stage` unset.
    pub fn get_records(
        &self,
        work_item: &WorkItem,
        stage: Stage,
        merchant: Option<&str>,
    ) -> Result<Vec<SourceRecord>> {
        let records = self.records_for(work_item, merchant)?;
        Ok(records
            .into_iter()
            .filter(|record| record.flags.is_eligible_for(stage))
            .collect())
    }

    pub fn record(&self, record_id: i64) -> Result<Option<SourceRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM source_records WHERE record_id = ?1");
        let record = self
            .connection
            .query_row(&sql, [record_id], source_record_from_row)
            .optional()
            .with_context(|| format!("failed to load source record {record_id}"))?;
        Ok(record)
    }

    pub fn flags(&self, target: FlagTarget<'_>) -> Result<Option<FlagSet>> {
        let flags = match target {
            FlagTarget::Record(record_id) => self
                .connection
                .query_row(
                    "SELECT flags FROM source_records WHERE record_id = ?1",
                    [record_id],
                    |row| flags_column(row, 0),
                )
                .optional()?,
            FlagTarget::Product(frsku) => self
                .connection
                .query_row(
                    "SELECT flags FROM products WHERE frsku = ?1",
                    [frsku],
                    |row| flags_column(row, 0),
                )
                .optional()?,
        };
        Ok(flags)
    }

    /// Sets or clears one flag. Returns whether the stored value changed; a write that would
    /// break prefix-closure is rejected with a [`crate::stage::FlagError`].
    pub fn set_flag(&self, target: FlagTarget<'_>, stage: Stage, value: bool) -> Result<bool> {
        self.update_flags(target, |flags| {
            let changed = if value {
                flags.set(stage)?
            } else {
                flags.clear(stage)?
            };
            Ok(changed)
        })
    }

    /// Clears `stage` and every later flag on the target.
    pub fn reset_from(&self, target: FlagTarget<'_>, stage: Stage) -> Result<bool> {
        self.update_flags(target, |flags| Ok(flags.reset_from(stage)))
    }

    fn update_flags<F>(&self, target: FlagTarget<'_>, mut apply: F) -> Result<bool>
    where
        F: FnMut(&mut FlagSet) -> Result<bool>,
    {
        for _ in 0..CAS_ATTEMPTS {
            let Some(current) = self.flags(target)? else {
                bail!("flag target not found: {target}");
            };

            let mut next = current;
            if !apply(&mut next)? {
                return Ok(false);
            }

            let now = now_utc_string();
            let written = match target {
                FlagTarget::Record(record_id) => self.connection.execute(
                    "UPDATE source_records SET flags = ?1, updated_at = ?2
                     WHERE record_id = ?3 AND flags = ?4",
                    params![next.bits() as i64, now, record_id, current.bits() as i64],
                )?,
                FlagTarget::Product(frsku) => self.connection.execute(
                    "UPDATE products SET flags = ?1, updated_at = ?2
                     WHERE frsku = ?3 AND flags = ?4",
                    params![next.bits() as i64, now, frsku, current.bits() as i64],
                )?,
            };

            if written == 1 {
                debug!(target = %target, flags = %next, "flags updated");
                return Ok(true);
            }
        }

        bail!("flags for {target} kept changing underneath the update")
    }

    /// True iff the work item has at least one record and every record has `stage` set.
    pub fn all_flags_true(
        &self,
        work_item: &WorkItem,
        stage: Stage,
        merchant: Option<&str>,
    ) -> Result<bool> {
        let records = self.records_for(work_item, merchant)?;
        Ok(!records.is_empty() && records.iter().all(|record| record.flags.is_set(stage)))
    }

    /// Takes the (record, stage) claim unless a fresh claim is already held.
    pub fn try_claim(&self, record_id: i64, stage: Stage, stale_after: Duration) -> Result<bool> {
        let now = Utc::now();
        let stale_before = (now - stale_after).to_rfc3339_opts(SecondsFormat::Micros, true);
        let written = self
            .connection
            .execute(
                "INSERT INTO stage_claims(record_id, stage, claimed_at) VALUES(?1, ?2, ?3)
                 ON CONFLICT(record_id, stage) DO UPDATE SET claimed_at = excluded.claimed_at
                 WHERE stage_claims.claimed_at < ?4",
                params![
                    record_id,
                    stage.as_str(),
                    now.to_rfc3339_opts(SecondsFormat::Micros, true),
                    stale_before
                ],
            )
            .with_context(|| format!("failed to claim record {record_id} for {stage}"))?;
        Ok(written == 1)
    }

    pub fn release_claim(&self, record_id: i64, stage: Stage) -> Result<()> {
        self.connection
            .execute(
                "DELETE FROM stage_claims WHERE record_id = ?1 AND stage = ?2",
                params![record_id, stage.as_str()],
            )
            .with_context(|| format!("failed to release claim on record {record_id}"))?;
        Ok(())
    }
}

/// Reads an integer column into a narrower type; out-of-range values fail the row.
pub(crate) fn column_as<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: TryFrom<i64>,
    T::Error: std::error::Error + Send + Sync + 'static,
{
    let value = row.get::<_, i64>(index)?;
    T::try_from(value).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Integer, Box::new(err))
    })
}

fn flags_column(row: &Row<'_>, index: usize) -> rusqlite::Result<FlagSet> {
    column_as::<u8>(row, index).map(FlagSet::from_bits)
}

fn source_record_from_row(row: &Row<'_>) -> rusqlite::Result<SourceRecord> {
    let queued_urls = row
        .get::<_, Option<String>>(7)?
        .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
        .unwrap_or_default();

    Ok(SourceRecord {
        record_id: row.get(0)?,
        frsku: row.get(1)?,
        merchant: row.get(2)?,
        url: row.get(3)?,
        detail_page: row.get(4)?,
        title: row.get(5)?,
        review_count: row.get(6)?,
        queued_urls,
        flags: flags_column(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::{FlagTarget, StatusStore, WorkItem};
    use crate::stage::Stage;

    fn seeded_store() -> StatusStore {
        let store = StatusStore::open_in_memory().expect("in-memory store");
        store
            .upsert_product("P001", Some("Fridge"), "Appliances", "Refrigerators")
            .expect("product");
        for merchant in ["alpha", "beta", "gamma"] {
            store
                .upsert_source_record("P001", merchant, None, None)
                .expect("record");
        }
        store
    }

    #[test]
    fn get_records_filters_on_prefix_and_stage() {
        let store = seeded_store();
        let item = WorkItem::product("P001");
        let records = store.records_for(&item, None).expect("records");
        store
            .set_flag(FlagTarget::Record(records[0].record_id), Stage::DetailCrawled, true)
            .expect("set");

        let crawl = store.get_records(&item, Stage::DetailCrawled, None).expect("eligible");
        assert_eq!(crawl.len(), 2);
        let parse = store.get_records(&item, Stage::DetailParsed, None).expect("eligible");
        assert_eq!(parse.len(), 1);
        assert_eq!(parse[0].merchant, "alpha");
    }

    #[test]
    fn set_flag_rejects_prefix_gap() {
        let store = seeded_store();
        let item = WorkItem::product("P001");
        let record_id = store.records_for(&item, Some("beta")).expect("records")[0].record_id;

        let err = store
            .set_flag(FlagTarget::Record(record_id), Stage::ReviewsParsed, true)
            .expect_err("gap must be rejected");
        assert!(err.to_string().contains("earlier stages are incomplete"));
        assert!(!store.set_flag(FlagTarget::Record(record_id), Stage::DetailCrawled, false).expect("noop"));
    }

    #[test]
    fn all_flags_true_requires_every_record() {
        let store = seeded_store();
        let item = WorkItem::product("P001");
        for record in store.records_for(&item, None).expect("records").iter().take(2) {
            store
                .set_flag(FlagTarget::Record(record.record_id), Stage::DetailCrawled, true)
                .expect("set");
        }
        assert!(!store.all_flags_true(&item, Stage::DetailCrawled, None).expect("check"));
        assert!(store.all_flags_true(&item, Stage::DetailCrawled, Some("alpha")).expect("check"));
    }

    #[test]
    fn claims_are_exclusive_until_released_or_stale() {
        let store = seeded_store();
        assert!(store.try_claim(1, Stage::DetailCrawled, Duration::minutes(10)).expect("claim"));
        assert!(!store.try_claim(1, Stage::DetailCrawled, Duration::minutes(10)).expect("claim"));
        assert!(store.try_claim(1, Stage::DetailCrawled, Duration::zero() - Duration::seconds(1)).expect("stale"));
        store.release_claim(1, Stage::DetailCrawled).expect("release");
        assert!(store.try_claim(1, Stage::DetailCrawled, Duration::minutes(10)).expect("claim"));
    }

    #[test]
    fn out_of_range_flag_columns_fail_the_read() {
        let store = seeded_store();
        store
            .connection()
            .execute("UPDATE source_records SET flags = -1 WHERE merchant = 'beta'", [])
            .expect("corrupt record");
        store
            .connection()
            .execute("UPDATE products SET flags = 300 WHERE frsku = 'P001'", [])
            .expect("corrupt product");

        assert!(store.records_for(&WorkItem::product("P001"), None).is_err());
        assert!(store.flags(FlagTarget::Product("P001")).is_err());
        assert!(store.product("P001").is_err());
    }

    #[test]
    fn training_work_item_parses_domain_pair() {
        let item = WorkItem::parse_training("Appliances+Refrigerators").expect("parse");
        assert_eq!(item.to_string(), "training:Appliances+Refrigerators");
        assert!(WorkItem::parse_training("Appliances").is_err());
    }
}
