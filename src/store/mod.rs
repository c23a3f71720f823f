mod sqlite;


pub use sqlite::SqliteRunStore;

use crate::model::{AnalysisRecord, NewRun, RunState, RunStatus, RunSummary, Stage};

/// Stored output of one stage: a record list, or the single book record.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Records(Vec<AnalysisRecord>),
    Book(Option<AnalysisRecord>),
}

impl StageOutput {
    pub fn len(&self) -> usize {
        match self {
            Self::Records(records) => records.len(),
            Self::Book(book) => usize::from(book.is_some()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Records(records) => {
                serde_json::Value::Array(records.iter().map(AnalysisRecord::to_value).collect())
            }
            Self::Book(Some(book)) => book.to_value(),
            Self::Book(None) => serde_json::Value::Null,
        }
    }
}

/// Durable home of runs and their stage records.
///
/// Calls never raise: a failure is logged by the implementation and
/// reported as `None`/`false`, so the pipeline can keep going in memory.
pub trait RunStore: Send + Sync {
    fn is_available(&self) -> bool;

    fn create_run(&self, run: &NewRun) -> Option<String>;

    fn get_run(&self, run_id: &str) -> Option<RunState>;

    /// Applies forward transitions only.
    fn update_run_status(&self, run_id: &str, status: RunStatus) -> bool;

    /// Appends chapter or group records after any already stored.
    fn append_stage_results(&self, run_id: &str, stage: Stage, records: &[AnalysisRecord]) -> bool;

    fn set_book_result(&self, run_id: &str, record: &AnalysisRecord) -> bool;

    fn get_stage_results(&self, run_id: &str, stage: Stage) -> Option<StageOutput>;

    /// Run header plus per-stage record counts, without loading records.
    fn run_summary(&self, run_id: &str) -> Option<RunSummary>;

    /// Newest first. `None` when the store could not be read.
    fn list_runs(&self) -> Option<Vec<RunSummary>>;

    /// Removes the run and every record it owns.
    fn delete_run(&self, run_id: &str) -> bool;
}
