use std::fs;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::cli::DeleteArgs;
use crate::pipeline::progress::mirror_path;
use crate::store::RunStore;

use super::{open_existing_store, progress_dir, resolve_db_path};

pub fn run(args: DeleteArgs) -> Result<()> {
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    let store = open_existing_store(&db_path)?;

    if !store.delete_run(&args.run_id) {
        bail!("run {} could not be deleted from {}", args.run_id, db_path.display());
    }

    let mirror = mirror_path(&progress_dir(&args.cache_root), &args.run_id);
    if mirror.exists() {
        if let Err(err) = fs::remove_file(&mirror) {
            warn!(path = %mirror.display(), error = %err, "failed to remove progress mirror");
        }
    }

    info!(run_id = %args.run_id, "run and stage results deleted");
    Ok(())
}
