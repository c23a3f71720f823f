use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{info, warn};

use crate::cli::ResultsArgs;
use crate::model::Stage;
use crate::store::RunStore;
use crate::util::write_json_pretty;

use super::{open_existing_store, resolve_db_path};

pub fn run(args: ResultsArgs) -> Result<()> {
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    let store = open_existing_store(&db_path)?;

    let (value, records) = match args.stage {
        Some(stage) => stage_value(&store, &args.run_id, stage)?,
        None => {
            let Some(state) = store.get_run(&args.run_id) else {
                bail!("no run {} in {}", args.run_id, db_path.display());
            };
            let records = state.stage_results.chapter.len()
                + state.stage_results.group.len()
                + usize::from(state.stage_results.book.is_some());
            let value = serde_json::to_value(&state).context("failed to render run state")?;
            (value, records)
        }
    };
    let scope = args.stage.map_or("run", Stage::as_str);

    match &args.output {
        Some(path) => {
            write_json_pretty(path, &value)?;
            info!(
                run_id = %args.run_id,
                scope,
                records,
                path = %path.display(),
                "results written"
            );
        }
        None => {
            let rendered = serde_json::to_string_pretty(&value).context("failed to render results")?;
            println!("{rendered}");
        }
    }

    Ok(())
}

fn stage_value(store: &dyn RunStore, run_id: &str, stage: Stage) -> Result<(Value, usize)> {
    let Some(output) = store.get_stage_results(run_id, stage) else {
        bail!("no run {run_id} in the database");
    };
    if output.is_empty() {
        warn!(run_id, stage = stage.as_str(), "stage has no stored results");
    }
    Ok((output.to_value(), output.len()))
}
