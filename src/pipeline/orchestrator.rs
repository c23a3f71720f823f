use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::model::{AnalysisCounts, NewRun, ProgressStatus, RunStatus, Stage, StageResults};
use crate::store::RunStore;

use super::decode::decode_source;
use super::error::{PipelineError, PipelineResult};
use super::generation::TextGenerator;
use super::progress::ProgressStore;
use super::response::ResponseParser;
use super::segment::segment;
use super::settings::PipelineSettings;
use super::stages::StageRunner;

/// Everything known about a run once it has stopped.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub failure_reason: Option<String>,
    pub storage_available: bool,
    pub counts: AnalysisCounts,
    pub results: StageResults,
}

impl RunOutcome {
    fn new(run_id: &str, storage_available: bool) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: RunStatus::Processing,
            failure_reason: None,
            storage_available,
            counts: AnalysisCounts::default(),
            results: StageResults::default(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Sequences decode, segmentation and the three stages for each run.
#[derive(Clone)]
pub struct Orchestrator {
    runner: Arc<StageRunner>,
    store: Arc<dyn RunStore>,
    progress: Arc<ProgressStore>,
}

impl Orchestrator {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn RunStore>,
        progress: Arc<ProgressStore>,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let parser = ResponseParser::new()?;
        let runner = StageRunner::new(
            generator,
            Arc::clone(&store),
            Arc::clone(&progress),
            parser,
            settings,
        );
        Ok(Self {
            runner: Arc::new(runner),
            store,
            progress,
        })
    }

    /// Registers a pending run and returns its ID.
    ///
    /// When the store cannot record the run, a local ID is minted instead,
    /// unless storage is required.
    pub fn start(&self, run: &NewRun) -> PipelineResult<String> {
        let settings = self.runner.settings();
        settings.validate()?;

        let run_id = match self.store.create_run(run) {
            Some(run_id) => run_id,
            None if settings.require_storage => {
                return Err(PipelineError::StorageUnavailable(
                    "could not register run".to_string(),
                ));
            }
            None => {
                let run_id = Uuid::new_v4().to_string();
                warn!(run_id, "run not registered in storage, continuing in memory");
                run_id
            }
        };

        info!(run_id, title = %run.title, source = %run.source_path, "run created");
        self.progress
            .update(&run_id, ProgressStatus::Processing, 0, "pending", "run created");
        Ok(run_id)
    }

    /// Runs the pipeline over `source`, the raw bytes registered with the
    /// run, on its own task. Any fault, including a panic, leaves the run
    /// `failed`.
    pub async fn execute(&self, run_id: &str, source: Vec<u8>) -> RunOutcome {
        let this = self.clone();
        let task_run_id = run_id.to_string();
        let handle = tokio::spawn(async move { this.drive(&task_run_id, &source).await });

        match handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                let err = PipelineError::Aborted(join_error.to_string());
                self.fail_run(run_id, &err);
                let mut outcome = RunOutcome::new(run_id, self.store.is_available());
                outcome.status = RunStatus::Failed;
                outcome.failure_reason = Some(err.to_string());
                outcome
            }
        }
    }

    async fn drive(&self, run_id: &str, source: &[u8]) -> RunOutcome {
        let mut outcome = RunOutcome::new(run_id, self.store.is_available());

        match self.run_stages(run_id, source, &mut outcome).await {
            Ok(()) => {
                self.progress
                    .update(run_id, ProgressStatus::Processing, 95, "finalize", "marking run completed");
                if !self.store.update_run_status(run_id, RunStatus::Completed) && self.store.is_available() {
                    warn!(run_id, "could not persist completed status");
                }
                outcome.status = RunStatus::Completed;
                self.progress
                    .update(run_id, ProgressStatus::Completed, 100, "done", "analysis complete");
                info!(
                    run_id,
                    chapters = outcome.counts.chapter.records,
                    groups = outcome.counts.group.records,
                    "run completed"
                );
            }
            Err(err) => {
                self.fail_run(run_id, &err);
                outcome.status = RunStatus::Failed;
                outcome.failure_reason = Some(err.to_string());
            }
        }

        outcome
    }

    async fn run_stages(&self, run_id: &str, source: &[u8], outcome: &mut RunOutcome) -> PipelineResult<()> {
        if !self.store.update_run_status(run_id, RunStatus::Processing) {
            if self.runner.settings().require_storage {
                return Err(PipelineError::StorageUnavailable(
                    "could not mark run as processing".to_string(),
                ));
            }
            if self.store.is_available() {
                warn!(run_id, "could not persist processing status");
            }
        }

        self.progress
            .update(run_id, ProgressStatus::Processing, 10, "read", "decoding source");
        let decoded = decode_source(source)?;
        outcome.counts.original_length = decoded.char_count();
        info!(run_id, encoding = decoded.encoding, chars = outcome.counts.original_length, "source decoded");

        self.progress
            .update(run_id, ProgressStatus::Processing, 20, "segment", "splitting source");
        let settings = self.runner.settings();
        let segments = segment(&decoded.text, settings.segment_size)?;
        outcome.counts.segments_count = segments.len();
        self.progress.update(
            run_id,
            ProgressStatus::Processing,
            25,
            "segment",
            format!("{} segments", segments.len()),
        );

        self.progress
            .update(run_id, ProgressStatus::Processing, 30, "chapter", "analyzing segments");
        let chapters = self.runner.run_chapter_stage(run_id, &segments).await?;
        outcome.counts.chapter = chapters.counts;
        outcome.results.chapter = chapters.output;
        if outcome.results.chapter.is_empty() {
            return Err(PipelineError::StageEmpty(Stage::Chapter));
        }
        self.progress
            .update(run_id, ProgressStatus::Processing, 50, "chapter", "segment analysis done");

        self.progress
            .update(run_id, ProgressStatus::Processing, 60, "group", "summarizing groups");
        let groups = self.runner.run_group_stage(run_id, &outcome.results.chapter).await?;
        outcome.counts.groups_count = groups.counts.units;
        outcome.counts.group = groups.counts;
        outcome.results.group = groups.output;
        if outcome.results.group.is_empty() {
            return Err(PipelineError::StageEmpty(Stage::Group));
        }
        self.progress
            .update(run_id, ProgressStatus::Processing, 75, "group", "group summaries done");

        self.progress
            .update(run_id, ProgressStatus::Processing, 85, "book", "summarizing whole book");
        let book = self.runner.run_book_stage(run_id, &outcome.results.group).await?;
        outcome.counts.book = book.counts;
        let Some(book) = book.output else {
            return Err(PipelineError::StageEmpty(Stage::Book));
        };
        outcome.results.book = Some(book);
        self.progress
            .update(run_id, ProgressStatus::Processing, 90, "book", "book summary done");

        Ok(())
    }

    fn fail_run(&self, run_id: &str, err: &PipelineError) {
        error!(run_id, error = %err, "run failed");
        if !self.store.update_run_status(run_id, RunStatus::Failed) && self.store.is_available() {
            warn!(run_id, "could not persist failed status");
        }
        self.progress
            .update(run_id, ProgressStatus::Failed, 0, "failed", err.to_string());
    }
}
