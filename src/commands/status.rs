use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::config::resolve_db_path;
use crate::store::{StatusStore, WorkItem};

const COUNTED_TABLES: [&str; 8] = [
    "products",
    "source_records",
    "review_pages",
    "reviews",
    "sentences",
    "lda_topics",
    "predicted_topics",
    "predicted_sents",
];

pub fn run(args: StatusArgs) -> Result<()> {
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    info!(cache_root = %args.cache_root.display(), "status requested");

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database missing");
        return Ok(());
    }
    let store = StatusStore::open(&db_path)?;

    for table in COUNTED_TABLES {
        info!(table, rows = store.count_rows(table)?, "table status");
    }

    let frskus = if args.frskus.is_empty() {
        store.list_products()?
    } else {
        args.frskus.clone()
    };
    for frsku in frskus {
        let Some(product) = store.product(&frsku)? else {
            warn!(frsku = %frsku, "unknown product");
            continue;
        };
        info!(
            frsku = %product.frsku,
            title = product.title.as_deref().unwrap_or_default(),
            domain = %format!("{}+{}", product.domain, product.subdomain),
            flags = %product.flags,
            ranked = store.has_ranked_topics(&frsku)?,
            summary = store.has_summary(&frsku)?,
            data = store.product_data(&frsku)?.is_some(),
            "product status"
        );
        for record in store.records_for(&WorkItem::product(&frsku), None)? {
            info!(
                record_id = record.record_id,
                merchant = %record.merchant,
                review_count = record.review_count,
                queued_urls = record.queued_urls.len(),
                flags = %record.flags,
                "record status"
            );
        }
    }
    Ok(())
}
