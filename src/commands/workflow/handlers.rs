use thiserror::Error;
use tracing::{debug, info, warn};

use super::nlp::{PreprocessCounts, preprocess_reviews};
use crate::cli::RecrawlMode;
use crate::model::CachedReview;
use crate::store::{NewReview, PageStatus, SourceRecord, StatusStore};

/// Reviews per merchant review page.
pub const REVIEW_PAGE_SIZE: i64 = 10;

/// Failure classes a stage handler reports back to the controller.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("missing data: {0}")]
    MissingData(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn class(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::MissingData(_) => "missing_data",
            Self::Other(_) => "unclassified",
        }
    }
}

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// The crawl, parse and preprocessing collaborators driven by the controller.
pub trait StageHandlers {
    fn crawl_detail(&mut self, store: &mut StatusStore, record: &SourceRecord) -> HandlerResult<()>;

    fn parse_detail(&mut self, store: &mut StatusStore, record: &SourceRecord) -> HandlerResult<()>;

    /// Returns the number of review page URLs queued.
    fn queue_review_urls(
        &mut self,
        store: &mut StatusStore,
        record: &SourceRecord,
    ) -> HandlerResult<usize>;

    /// Returns the number of pages crawled. Pages that could not be fetched leave the call
    /// failing with [`HandlerError::Transient`].
    fn crawl_reviews(
        &mut self,
        store: &mut StatusStore,
        record: &SourceRecord,
        recrawl: Option<RecrawlMode>,
    ) -> HandlerResult<usize>;

    /// Returns the number of new review rows.
    fn parse_reviews(&mut self, store: &mut StatusStore, record: &SourceRecord)
    -> HandlerResult<usize>;

    fn preprocess(&mut self, store: &mut StatusStore, frsku: &str) -> HandlerResult<PreprocessCounts>;
}

/// Works from pages cached in the store by `import`; nothing touches the network.
#[derive(Debug, Default)]
pub struct OfflineHandlers;

impl StageHandlers for OfflineHandlers {
    fn crawl_detail(&mut self, _store: &mut StatusStore, record: &SourceRecord) -> HandlerResult<()> {
        match record.detail_page.as_deref().map(str::trim) {
            Some(page) if !page.is_empty() => {
                debug!(record_id = record.record_id, bytes = page.len(), "detail page cached");
                Ok(())
            }
            _ => Err(HandlerError::Transient(format!(
                "no detail page cached for {}/{}",
                record.frsku, record.merchant
            ))),
        }
    }

    fn parse_detail(&mut self, store: &mut StatusStore, record: &SourceRecord) -> HandlerResult<()> {
        let Some(page) = record.detail_page.as_deref() else {
            return Err(HandlerError::MissingData(format!(
                "detail page missing for record {}",
                record.record_id
            )));
        };
        let detail = parse_detail_page(page);
        let Some(review_count) = detail.review_count else {
            return Err(HandlerError::MissingData(format!(
                "review_count missing from detail page of record {}",
                record.record_id
            )));
        };
        store.store_parsed_detail(record.record_id, detail.title.as_deref(), review_count)?;
        Ok(())
    }

    fn queue_review_urls(
        &mut self,
        store: &mut StatusStore,
        record: &SourceRecord,
    ) -> HandlerResult<usize> {
        let Some(review_count) = record.review_count else {
            return Err(HandlerError::MissingData(format!(
                "record {} has no parsed review count",
                record.record_id
            )));
        };
        let base = record
            .url
            .clone()
            .unwrap_or_else(|| format!("{}/{}", record.merchant, record.frsku));
        let urls = review_page_urls(&base, review_count);
        store.store_queued_urls(record.record_id, &urls)?;
        Ok(urls.len())
    }

    fn crawl_reviews(
        &mut self,
        store: &mut StatusStore,
        record: &SourceRecord,
        recrawl: Option<RecrawlMode>,
    ) -> HandlerResult<usize> {
        let statuses = pages_to_crawl(recrawl);
        let pages = store.review_pages(record.record_id, statuses)?;
        if pages.len() < record.queued_urls.len() {
            debug!(
                record_id = record.record_id,
                queued = record.queued_urls.len(),
                cached = pages.len(),
                "fewer cached review pages than queued urls"
            );
        }

        let mut crawled = 0usize;
        for page in &pages {
            let status = if page.fail {
                PageStatus::Failed
            } else {
                crawled += 1;
                PageStatus::Crawled
            };
            store.set_page_status(record.record_id, page.page_num, status)?;
        }

        let failed = store
            .review_pages(record.record_id, &[PageStatus::Failed])?
            .len();
        if failed > 0 {
            return Err(HandlerError::Transient(format!(
                "{failed} review pages failed for {}/{}",
                record.frsku, record.merchant
            )));
        }
        info!(record_id = record.record_id, pages = crawled, "crawled review pages");
        Ok(crawled)
    }

    fn parse_reviews(
        &mut self,
        store: &mut StatusStore,
        record: &SourceRecord,
    ) -> HandlerResult<usize> {
        let pages = store.review_pages(record.record_id, &[PageStatus::Crawled])?;
        let mut reviews = Vec::<NewReview>::new();
        for page in &pages {
            let cached = serde_json::from_str::<Vec<CachedReview>>(&page.body).map_err(|err| {
                HandlerError::MissingData(format!(
                    "review page {} of record {} is not a review list: {err}",
                    page.page_num, record.record_id
                ))
            })?;
            reviews.extend(cached.into_iter().enumerate().map(|(position, review)| NewReview {
                page_num: page.page_num,
                position: position as i64,
                rating: review.rating,
                title: review.title,
                body: review.text,
            }));
        }

        let inserted = store.insert_reviews(
            record.record_id,
            &record.frsku,
            &record.merchant,
            &reviews,
        )?;
        if reviews.is_empty() {
            warn!(record_id = record.record_id, "no crawled reviews to parse");
        }
        info!(
            record_id = record.record_id,
            pages = pages.len(),
            parsed = reviews.len(),
            inserted,
            "parsed reviews"
        );
        Ok(inserted)
    }

    fn preprocess(&mut self, store: &mut StatusStore, frsku: &str) -> HandlerResult<PreprocessCounts> {
        Ok(preprocess_reviews(store, frsku)?)
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct DetailPage {
    pub title: Option<String>,
    pub review_count: Option<i64>,
}

/// Reads `key: value` lines; unknown keys and malformed counts are ignored.
pub fn parse_detail_page(page: &str) -> DetailPage {
    let mut detail = DetailPage::default();
    for line in page.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "title" if !value.is_empty() => detail.title = Some(value.to_string()),
            "review_count" => {
                let digits = value.replace(',', "");
                detail.review_count = digits.parse::<i64>().ok().filter(|count| *count >= 0);
            }
            _ => {}
        }
    }
    detail
}

pub fn review_page_urls(base: &str, review_count: i64) -> Vec<String> {
    let pages = (review_count.max(0) + REVIEW_PAGE_SIZE - 1) / REVIEW_PAGE_SIZE;
    (1..=pages)
        .map(|page| format!("{base}?page={page}"))
        .collect()
}

fn pages_to_crawl(recrawl: Option<RecrawlMode>) -> &'static [PageStatus] {
    match recrawl {
        None => &[PageStatus::Uncrawled, PageStatus::Failed],
        Some(RecrawlMode::Uncrawled) => &[PageStatus::Uncrawled],
        Some(RecrawlMode::Failed) => &[PageStatus::Failed],
    }
}
