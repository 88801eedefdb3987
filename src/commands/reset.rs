use anyhow::{Result, bail};
use tracing::info;

use crate::cli::ResetArgs;
use crate::config::resolve_db_path;
use crate::stage::Stage;
use crate::store::{FlagTarget, StatusStore, WorkItem};

pub fn run(args: ResetArgs) -> Result<()> {
    let stage = args.stage.parse::<Stage>()?;
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    let store = StatusStore::open(&db_path)?;

    let cleared = reset_product(&store, args.frsku.trim(), stage, args.merchant.as_deref())?;
    info!(
        frsku = %args.frsku,
        stage = %stage,
        merchant = args.merchant.as_deref().unwrap_or("*"),
        records_changed = cleared,
        "reset flags"
    );
    Ok(())
}

/// Clears `stage` and every later flag on the product's records (or one merchant's record)
/// and on the product itself. Returns how many records changed.
pub fn reset_product(
    store: &StatusStore,
    frsku: &str,
    stage: Stage,
    merchant: Option<&str>,
) -> Result<usize> {
    if store.product(frsku)?.is_none() {
        bail!("unknown product: {frsku}");
    }
    let records = store.records_for(&WorkItem::product(frsku), merchant)?;
    if let Some(name) = merchant {
        if records.is_empty() {
            bail!("product {frsku} has no record for merchant {name}");
        }
    }

    let mut changed = 0usize;
    for record in &records {
        if store.reset_from(FlagTarget::Record(record.record_id), stage)? {
            changed += 1;
        }
    }
    store.reset_from(FlagTarget::Product(frsku), stage)?;
    Ok(changed)
}
