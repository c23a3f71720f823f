use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::model::{ProgressSnapshot, ProgressStatus};
use crate::util::{now_utc_string, read_json, write_json_pretty};

/// Latest progress per run, shared by every run in the process.
#[derive(Debug, Default)]
pub struct ProgressStore {
    snapshots: Mutex<HashMap<String, ProgressSnapshot>>,
    mirror_dir: Option<PathBuf>,
}

impl ProgressStore {
    /// Also writes each snapshot to `<dir>/<run_id>.json`.
    pub fn with_mirror(dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshots: Mutex::default(),
            mirror_dir: Some(dir.into()),
        }
    }

    pub fn update(
        &self,
        run_id: &str,
        status: ProgressStatus,
        percent: u8,
        current_step: &str,
        message: impl Into<String>,
    ) {
        let snapshot = ProgressSnapshot {
            run_id: run_id.to_string(),
            status,
            percent: percent.min(100),
            current_step: current_step.to_string(),
            message: message.into(),
            updated_at: now_utc_string(),
        };
        debug!(
            run_id,
            percent = snapshot.percent,
            step = current_step,
            "progress updated"
        );

        if let Some(dir) = &self.mirror_dir {
            let path = mirror_path(dir, run_id);
            if let Err(err) = write_json_pretty(&path, &snapshot) {
                warn!(run_id, path = %path.display(), error = %err, "failed to mirror progress snapshot");
            }
        }

        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.to_string(), snapshot);
    }

    pub fn get(&self, run_id: &str) -> ProgressSnapshot {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
            .unwrap_or_else(|| not_found(run_id))
    }
}

pub fn mirror_path(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(format!("{run_id}.json"))
}

/// Last snapshot a previous process mirrored for `run_id`, if any.
pub fn read_mirrored(dir: &Path, run_id: &str) -> Option<ProgressSnapshot> {
    let path = mirror_path(dir, run_id);
    if !path.exists() {
        return None;
    }
    match read_json(&path) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!(run_id, error = %err, "ignoring unreadable progress mirror");
            None
        }
    }
}

fn not_found(run_id: &str) -> ProgressSnapshot {
    ProgressSnapshot {
        run_id: run_id.to_string(),
        status: ProgressStatus::NotFound,
        percent: 0,
        current_step: String::new(),
        message: "no progress recorded for this run".to_string(),
        updated_at: now_utc_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_run_reports_not_found() {
        let store = ProgressStore::default();
        let snapshot = store.get("missing");
        assert_eq!(snapshot.status, ProgressStatus::NotFound);
        assert_eq!(snapshot.percent, 0);
        assert_eq!(snapshot.run_id, "missing");
    }

    #[test]
    fn later_updates_overwrite_earlier_ones() {
        let store = ProgressStore::default();
        store.update("r1", ProgressStatus::Processing, 10, "decode", "reading source");
        store.update("r1", ProgressStatus::Processing, 130, "chapter", "over the top");

        let snapshot = store.get("r1");
        assert_eq!(snapshot.percent, 100);
        assert_eq!(snapshot.current_step, "chapter");
        assert_eq!(store.get("r2").status, ProgressStatus::NotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_keep_separate_snapshots() {
        let store = std::sync::Arc::new(ProgressStore::default());
        let mut handles = Vec::new();
        for run in 0..8 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let run_id = format!("run-{run}");
                for percent in 0..=100u8 {
                    store.update(&run_id, ProgressStatus::Processing, percent, "chapter", format!("{run}:{percent}"));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.expect("update task");
        }

        for run in 0..8 {
            let snapshot = store.get(&format!("run-{run}"));
            assert_eq!(snapshot.percent, 100);
            assert_eq!(snapshot.message, format!("{run}:100"));
        }
    }

    #[test]
    fn mirrored_snapshot_is_readable_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ProgressStore::with_mirror(dir.path());
        store.update("run-a", ProgressStatus::Completed, 100, "done", "finished");

        let mirrored = read_mirrored(dir.path(), "run-a").expect("mirror present");
        assert_eq!(mirrored, store.get("run-a"));
        assert!(read_mirrored(dir.path(), "run-b").is_none());
    }
}
