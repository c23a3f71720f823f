use std::path::Path;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::model::RunSummary;
use crate::pipeline::progress::read_mirrored;
use crate::store::RunStore;

use super::{open_existing_store, progress_dir, resolve_db_path};

pub fn run(args: StatusArgs) -> Result<()> {
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    info!(cache_root = %args.cache_root.display(), "status requested");

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database file missing");
        if let Some(run_id) = &args.run_id {
            report_progress(&args.cache_root, run_id);
        }
        return Ok(());
    }
    let store = open_existing_store(&db_path)?;

    match &args.run_id {
        Some(run_id) => {
            match store.run_summary(run_id) {
                Some(summary) => log_summary(&summary, "run state"),
                None => warn!(run_id = %run_id, "run not found in database"),
            }
            report_progress(&args.cache_root, run_id);
        }
        None => {
            let Some(runs) = store.list_runs() else {
                bail!("could not list runs in {}", db_path.display());
            };
            if runs.is_empty() {
                info!(path = %db_path.display(), "no runs recorded");
            }
            for summary in &runs {
                log_summary(summary, "run");
            }
        }
    }

    Ok(())
}

fn log_summary(summary: &RunSummary, label: &str) {
    info!(
        run_id = %summary.run_id,
        title = %summary.title,
        status = summary.status.as_str(),
        created_at = %summary.created_at,
        updated_at = %summary.updated_at,
        chapters = summary.chapter_count,
        groups = summary.group_count,
        book = summary.book_count,
        "{label}"
    );
}

fn report_progress(cache_root: &Path, run_id: &str) {
    match read_mirrored(&progress_dir(cache_root), run_id) {
        Some(snapshot) => info!(
            run_id = %snapshot.run_id,
            percent = snapshot.percent,
            step = %snapshot.current_step,
            message = %snapshot.message,
            updated_at = %snapshot.updated_at,
            "last recorded progress"
        ),
        None => info!(run_id = %run_id, "no progress recorded"),
    }
}
