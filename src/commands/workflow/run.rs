use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{error, info, warn};

use super::controller::WorkflowController;
use super::handlers::{OfflineHandlers, StageHandlers};
use crate::cli::WorkflowArgs;
use crate::config::WorkflowConfig;
use crate::model::{StepAttempt, StepOutcome, StepReport, WorkflowPaths, WorkflowRunManifest};
use crate::modeling::{LocalModelService, ModelService};
use crate::stage::WorkflowStep;
use crate::store::{DB_SCHEMA_VERSION, StatusStore, WorkItem};
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};

pub fn run(args: WorkflowArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let config = WorkflowConfig::from_args(&args)?;
    let steps = parse_steps(&args.steps)?;
    let manifest_dir = config.manifest_dir();
    ensure_directory(&manifest_dir)?;
    let manifest_path = args.run_manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!("workflow_run_{}.json", utc_compact_string(started_ts)))
    });

    info!(
        cache_root = %config.cache_root.display(),
        run_id = %run_id,
        steps = %steps.iter().map(|step| step.as_str()).collect::<Vec<&str>>().join(","),
        "starting workflow"
    );

    let store = StatusStore::open(&config.db_path)?;
    let mut warnings = Vec::<String>::new();
    let work_items = resolve_work_items(&store, &args.frskus, &args.training, &mut warnings)?;
    if work_items.is_empty() {
        warn!("no work items matched; nothing to do");
    }

    let models = LocalModelService::new(&config.models_root(), config.seed);
    let mut controller = WorkflowController::new(store, OfflineHandlers, models, config.clone());

    let mut reports = Vec::<StepReport>::with_capacity(steps.len());
    for step in &steps {
        let report = run_step(
            &mut controller,
            *step,
            &work_items,
            config.max_attempts,
            config.retry_delay,
        );
        reports.push(report);
    }

    let failed = reports
        .iter()
        .any(|report| !report.errors.is_empty() || report.totals.failed > 0);
    let manifest = WorkflowRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: if failed {
            "completed_with_failures".to_string()
        } else {
            "completed".to_string()
        },
        started_at,
        updated_at: now_utc_string(),
        command: render_workflow_command(&args),
        paths: WorkflowPaths {
            cache_root: config.cache_root.display().to_string(),
            db_path: config.db_path.display().to_string(),
            models_root: config.models_root().display().to_string(),
            dump_root: config.dump_root().display().to_string(),
        },
        steps: reports,
        model_artifacts: controller.artifacts().to_vec(),
        warnings,
    };
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        run_id = %run_id,
        status = %manifest.status,
        manifest = %manifest_path.display(),
        "workflow finished"
    );
    Ok(())
}

pub(super) fn parse_steps(values: &[String]) -> Result<Vec<WorkflowStep>> {
    let mut steps = Vec::<WorkflowStep>::new();
    for value in values {
        steps.extend(WorkflowStep::parse_list(value)?);
    }
    if steps.is_empty() {
        bail!("at least one workflow step is required");
    }
    Ok(steps)
}

/// Products named with `--frsku` and domains named with `--training`; every product when
/// neither is given. Unknown names are dropped with a warning.
pub(super) fn resolve_work_items(
    store: &StatusStore,
    frskus: &[String],
    training: &[String],
    warnings: &mut Vec<String>,
) -> Result<Vec<WorkItem>> {
    let mut items = BTreeSet::<WorkItem>::new();
    for frsku in frskus {
        let item = WorkItem::product(frsku);
        if store.work_item_exists(&item)? {
            items.insert(item);
        } else {
            warn!(frsku = %frsku, "unknown product; skipping");
            warnings.push(format!("unknown product {frsku}"));
        }
    }
    for value in training {
        let item = WorkItem::parse_training(value)?;
        if store.work_item_exists(&item)? {
            items.insert(item);
        } else {
            warn!(training = %value, "unknown training domain; skipping");
            warnings.push(format!("unknown training domain {value}"));
        }
    }

    if frskus.is_empty() && training.is_empty() {
        for frsku in store.list_products()? {
            items.insert(WorkItem::Product { frsku });
        }
    }
    Ok(items.into_iter().collect())
}

/// Runs `step` over every work item. Crawl and parse steps that leave records behind are
/// retried for those items, up to `max_attempts` passes.
pub(super) fn run_step<H: StageHandlers, M: ModelService>(
    controller: &mut WorkflowController<H, M>,
    step: WorkflowStep,
    work_items: &[WorkItem],
    max_attempts: usize,
    retry_delay: Duration,
) -> StepReport {
    let mut report = StepReport {
        step: step.as_str().to_string(),
        work_items: work_items.iter().map(|item| item.to_string()).collect(),
        attempts: Vec::new(),
        totals: StepOutcome::default(),
        errors: Vec::new(),
    };

    let mut pending = work_items.iter().collect::<Vec<&WorkItem>>();
    for attempt in 1..=max_attempts.max(1) {
        let mut outcome = StepOutcome::default();
        let mut unfinished = Vec::<&WorkItem>::new();
        for work_item in &pending {
            match controller.advance(work_item, step) {
                Ok(result) => {
                    if result.remaining > 0 {
                        unfinished.push(*work_item);
                    }
                    outcome.merge(&result);
                }
                Err(err) => {
                    error!(work_item = %work_item, step = step.as_str(), error = %format!("{err:#}"), "step aborted for work item");
                    report.errors.push(format!("{work_item}: {err:#}"));
                }
            }
        }

        let remaining = outcome.remaining;
        report.totals.merge(&outcome);
        report.totals.remaining = remaining;
        report.attempts.push(StepAttempt { attempt, outcome });

        if !step.is_retried() || unfinished.is_empty() || attempt == max_attempts {
            break;
        }
        info!(
            step = step.as_str(),
            attempt,
            remaining,
            delay_secs = retry_delay.as_secs(),
            "records still pending; retrying"
        );
        std::thread::sleep(retry_delay);
        pending = unfinished;
    }
    report
}

pub(super) fn render_workflow_command(args: &WorkflowArgs) -> String {
    let mut command = vec!["reviewflow".to_string(), "workflow".to_string()];
    command.extend(args.steps.iter().cloned());
    command.push("--cache-root".to_string());
    command.push(args.cache_root.display().to_string());

    if let Some(path) = &args.db_path {
        command.push("--db-path".to_string());
        command.push(path.display().to_string());
    }
    for frsku in &args.frskus {
        command.push("--frsku".to_string());
        command.push(frsku.clone());
    }
    for training in &args.training {
        command.push("--training".to_string());
        command.push(training.clone());
    }
    if let Some(recrawl) = args.recrawl {
        command.push("--recrawl".to_string());
        command.push(recrawl.as_str().to_string());
    }
    if let Some(merchant) = &args.merchant {
        command.push("--merchant".to_string());
        command.push(merchant.clone());
    }
    for (flag, enabled) in [
        ("--finished-crawling", args.finished_crawling),
        ("--ignore-params", args.ignore_params),
        ("--clear-db", args.clear_db),
        ("--dump-to-csv", args.dump_to_csv),
    ] {
        if enabled {
            command.push(flag.to_string());
        }
    }
    command.push("--iterations".to_string());
    command.push(args.iterations.to_string());
    if let Some(seed) = args.seed {
        command.push("--seed".to_string());
        command.push(seed.to_string());
    }

    command.join(" ")
}
