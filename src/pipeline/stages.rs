use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{AnalysisRecord, ProgressStatus, Segment, Stage, StageCounts};
use crate::store::RunStore;
use crate::util::now_utc_string;

use super::aggregate::{aggregate_chapters, aggregate_groups};
use super::error::{PipelineError, PipelineResult};
use super::generation::{TextGenerator, call_model};
use super::progress::ProgressStore;
use super::prompts::{book_prompt, chapter_prompt, group_prompt};
use super::response::ResponseParser;
use super::sanitize::sanitize_object;
use super::settings::PipelineSettings;

/// What one stage produced, plus how many of its units were dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome<T> {
    pub output: T,
    pub counts: StageCounts,
}

/// Runs the chapter, group and book stages for a single run.
pub struct StageRunner {
    generator: Arc<dyn TextGenerator>,
    store: Arc<dyn RunStore>,
    progress: Arc<ProgressStore>,
    parser: ResponseParser,
    settings: PipelineSettings,
}

impl StageRunner {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn RunStore>,
        progress: Arc<ProgressStore>,
        parser: ResponseParser,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            generator,
            store,
            progress,
            parser,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn run_chapter_stage(
        &self,
        run_id: &str,
        segments: &[Segment],
    ) -> PipelineResult<StageOutcome<Vec<AnalysisRecord>>> {
        let total = segments.len();
        let mut counts = StageCounts {
            units: total,
            ..StageCounts::default()
        };
        let mut records = Vec::with_capacity(total);
        info!(run_id, stage = "chapter", units = total, "stage started");

        for (position, segment) in segments.iter().enumerate() {
            let label = segment.label();
            let prompt = chapter_prompt(segment, &now_utc_string());

            if let Some(mut record) = self
                .analyze_unit(run_id, Stage::Chapter, &label, &prompt, self.settings.budgets.chapter, &mut counts)
                .await
            {
                record.set_meta("source_id", stamped_id(&label));
                record.set_meta("level", Stage::Chapter.as_str());
                record.set_meta("char_count", segment.char_count);
                record.set_field("segment_id", label.as_str());
                record.set_field("segment_number", segment.index);

                self.persist(run_id, Stage::Chapter, std::slice::from_ref(&record))?;
                records.push(record);
            }

            let done = position + 1;
            self.report(run_id, Stage::Chapter, &label, done, total);
            if done < total {
                pace(self.settings.pacing.chapter_delay).await;
            }
        }

        counts.records = records.len();
        info!(run_id, stage = "chapter", records = counts.records, units = total, "stage finished");
        Ok(StageOutcome {
            output: records,
            counts,
        })
    }

    pub async fn run_group_stage(
        &self,
        run_id: &str,
        chapters: &[AnalysisRecord],
    ) -> PipelineResult<StageOutcome<Vec<AnalysisRecord>>> {
        let batches: Vec<&[AnalysisRecord]> = chapters.chunks(self.settings.group_size.max(1)).collect();
        let total = batches.len();
        let mut counts = StageCounts {
            units: total,
            ..StageCounts::default()
        };
        let mut records = Vec::with_capacity(total);
        info!(run_id, stage = "group", units = total, "stage started");

        for (position, batch) in batches.iter().enumerate() {
            let number = position + 1;
            let label = format!("G{number:03}");
            let aggregate = aggregate_chapters(batch);
            let children = Value::Array(batch.iter().map(AnalysisRecord::to_value).collect());
            let prompt = group_prompt(&label, &aggregate, &children, &now_utc_string());

            if let Some(mut record) = self
                .analyze_unit(run_id, Stage::Group, &label, &prompt, self.settings.budgets.group, &mut counts)
                .await
            {
                record.set_meta("source_id", stamped_id(&label));
                record.set_meta("level", Stage::Group.as_str());
                record.set_meta("parent_ids", aggregate.parent_ids.clone());
                record.set_field("group_id", label.as_str());
                record.set_field("group_number", number);
                record.set_field("segment_range", aggregate.segment_range());
                record.content_refs = aggregate.content_refs;

                self.persist(run_id, Stage::Group, std::slice::from_ref(&record))?;
                records.push(record);
            }

            self.report(run_id, Stage::Group, &label, number, total);
            if number < total {
                pace(self.settings.pacing.group_delay).await;
            }
        }

        counts.records = records.len();
        info!(run_id, stage = "group", records = counts.records, units = total, "stage finished");
        Ok(StageOutcome {
            output: records,
            counts,
        })
    }

    pub async fn run_book_stage(
        &self,
        run_id: &str,
        groups: &[AnalysisRecord],
    ) -> PipelineResult<StageOutcome<Option<AnalysisRecord>>> {
        let mut counts = StageCounts {
            units: 1,
            ..StageCounts::default()
        };
        info!(run_id, stage = "book", groups = groups.len(), "stage started");

        let aggregate = aggregate_groups(groups);
        let children = Value::Array(groups.iter().map(AnalysisRecord::to_value).collect());
        let prompt = book_prompt(&aggregate, &children, &now_utc_string());

        let book = match self
            .analyze_unit(run_id, Stage::Book, "BOOK", &prompt, self.settings.budgets.book, &mut counts)
            .await
        {
            Some(mut record) => {
                record.set_meta("source_id", stamped_id("BOOK"));
                record.set_meta("level", Stage::Book.as_str());
                record.set_meta("parent_ids", aggregate.parent_ids.clone());
                record.content_refs = aggregate.content_refs;

                let stored = self.store.set_book_result(run_id, &record);
                self.check_persisted(stored, run_id, Stage::Book)?;
                counts.records = 1;
                Some(record)
            }
            None => None,
        };

        info!(run_id, stage = "book", analyzed = book.is_some(), "stage finished");
        Ok(StageOutcome {
            output: book,
            counts,
        })
    }

    /// One generation call plus parsing. Failures are counted and logged,
    /// never raised.
    async fn analyze_unit(
        &self,
        run_id: &str,
        stage: Stage,
        unit: &str,
        prompt: &str,
        max_tokens: u32,
        counts: &mut StageCounts,
    ) -> Option<AnalysisRecord> {
        let generated = match call_model(self.generator.as_ref(), &self.settings.retry, prompt, max_tokens).await {
            Ok(generated) => generated,
            Err(err) => {
                warn!(run_id, stage = stage.as_str(), unit, error = %err, "unit dropped, generation failed");
                counts.generation_failures += 1;
                return None;
            }
        };

        match self.parser.parse(&generated.text) {
            Ok(parsed) => {
                debug!(
                    run_id,
                    stage = stage.as_str(),
                    unit,
                    attempts = generated.attempts,
                    strategy = parsed.strategy.as_str(),
                    "unit analyzed"
                );
                Some(AnalysisRecord::from_object(sanitize_object(parsed.object)))
            }
            Err(err) => {
                warn!(
                    run_id,
                    stage = stage.as_str(),
                    unit,
                    response_chars = generated.text.chars().count(),
                    error = %err,
                    "unit dropped, response not parseable"
                );
                counts.parse_failures += 1;
                None
            }
        }
    }

    fn persist(&self, run_id: &str, stage: Stage, records: &[AnalysisRecord]) -> PipelineResult<()> {
        let stored = self.store.append_stage_results(run_id, stage, records);
        self.check_persisted(stored, run_id, stage)
    }

    fn check_persisted(&self, stored: bool, run_id: &str, stage: Stage) -> PipelineResult<()> {
        if stored {
            return Ok(());
        }
        if self.settings.require_storage {
            return Err(PipelineError::StorageUnavailable(format!(
                "could not store {} results for run {run_id}",
                stage.as_str()
            )));
        }
        if self.store.is_available() {
            warn!(run_id, stage = stage.as_str(), "stage results kept in memory only");
        }
        Ok(())
    }

    fn report(&self, run_id: &str, stage: Stage, unit: &str, done: usize, total: usize) {
        let (base, span) = match stage {
            Stage::Chapter => (30, 20),
            Stage::Group => (60, 15),
            Stage::Book => (85, 5),
        };
        let percent = base + span * done / total.max(1);
        self.progress.update(
            run_id,
            ProgressStatus::Processing,
            u8::try_from(percent).unwrap_or(100),
            stage.as_str(),
            format!("{} {unit} processed ({done}/{total})", stage.as_str()),
        );
    }
}

/// `uuid-<label>-<8 hex>`, unique within a run.
pub fn stamped_id(label: &str) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("uuid-{label}-{}", &random[..8])
}

async fn pace(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
