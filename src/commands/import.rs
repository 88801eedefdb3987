use std::fs;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::cli::ImportArgs;
use crate::config::resolve_db_path;
use crate::model::{ImportCounts, ImportManifest};
use crate::store::{StatusStore, TrainingDomain};

pub fn run(args: ImportArgs) -> Result<()> {
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    info!(
        manifest = %args.manifest.display(),
        db_path = %db_path.display(),
        "starting import"
    );

    let raw = fs::read(&args.manifest)
        .with_context(|| format!("failed to read {}", args.manifest.display()))?;
    let manifest: ImportManifest = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", args.manifest.display()))?;

    let store = StatusStore::open(&db_path)?;
    let counts = import_manifest(&store, &manifest)?;

    info!(
        merchants = counts.merchants,
        training_domains = counts.training_domains,
        products = counts.products,
        source_records = counts.source_records,
        review_pages = counts.review_pages,
        "import finished"
    );
    Ok(())
}

/// Upserts everything in the manifest. Progress flags of existing rows are left as they are.
pub fn import_manifest(store: &StatusStore, manifest: &ImportManifest) -> Result<ImportCounts> {
    let mut counts = ImportCounts::default();

    for merchant in &manifest.merchants {
        store.upsert_merchant(merchant.name.trim(), merchant.base_url.as_deref())?;
        counts.merchants += 1;
    }

    for entry in &manifest.training_domains {
        let domain = TrainingDomain::from(entry);
        if domain.topic_count == 0 {
            bail!(
                "training domain {}+{} needs at least one topic",
                domain.domain,
                domain.subdomain
            );
        }
        store.upsert_training_domain(&domain)?;
        counts.training_domains += 1;
    }

    for product in &manifest.products {
        let frsku = product.frsku.trim();
        if frsku.is_empty() {
            warn!("product without frsku in manifest; skipping");
            continue;
        }
        if store
            .training_domain(product.domain.trim(), product.subdomain.trim())?
            .is_none()
        {
            warn!(
                frsku = %frsku,
                domain = %product.domain,
                subdomain = %product.subdomain,
                "product references an unknown training domain"
            );
        }
        store.upsert_product(
            frsku,
            product.title.as_deref(),
            product.domain.trim(),
            product.subdomain.trim(),
        )?;
        counts.products += 1;

        for record in &product.records {
            let record_id = store.upsert_source_record(
                frsku,
                record.merchant.trim(),
                record.url.as_deref(),
                record.detail_page.as_deref(),
            )?;
            counts.source_records += 1;

            for page in &record.review_pages {
                let body = serde_json::to_string(&page.reviews).with_context(|| {
                    format!("failed to encode review page {} for {frsku}", page.page_num)
                })?;
                store.upsert_review_page(record_id, page.page_num, &body, page.fail)?;
                counts.review_pages += 1;
            }
        }
    }

    Ok(counts)
}
