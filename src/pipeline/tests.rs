use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::error::{GenerationError, PipelineError};
use super::generation::TextGenerator;
use super::response::ResponseParser;
use super::segment::segment;
use super::stages::StageRunner;
use super::*;
use crate::model::{NewRun, ProgressStatus, RunStatus, Stage};
use crate::store::{RunStore, SqliteRunStore, StageOutput};

type Script = dyn Fn(&str) -> Result<String, GenerationError> + Send + Sync;

/// Answers prompts from a closure and remembers every call.
struct ScriptedGenerator {
    script: Box<Script>,
    calls: Mutex<Vec<(String, u32)>>,
}

impl ScriptedGenerator {
    fn new(script: impl Fn(&str) -> Result<String, GenerationError> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn budgets(&self) -> Vec<u32> {
        self.calls.lock().unwrap().iter().map(|(_, budget)| *budget).collect()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn prompts_containing(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(prompt, _)| prompt.contains(needle))
            .count()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, GenerationError> {
        self.calls.lock().unwrap().push((prompt.to_string(), max_tokens));
        (self.script)(prompt)
    }
}

fn well_formed(prompt: &str) -> Result<String, GenerationError> {
    if prompt.contains("Whole-work details") {
        return Ok(json!({
            "book_summary": "the whole story",
            "analysis": {"main_storylines": 2},
            "meta": {"source_id": "model-invented", "genre": ["fantasy"]}
        })
        .to_string());
    }
    if prompt.contains("Group details") {
        return Ok(format!(
            "```json\n{}\n```",
            json!({"summary": "a group", "analysis": {"tension": "high"}, "meta": {"word_count": 30, "genre": "fantasy"}})
        ));
    }
    Ok(format!(
        "Here you go: {}",
        json!({"summary": "a chapter", "analysis": {}, "meta": {"word_count": "10", "genre": ["fantasy"]}})
    ))
}

fn fast_settings(segment_size: usize, group_size: usize) -> PipelineSettings {
    PipelineSettings {
        segment_size,
        group_size,
        retry: RetryPolicy {
            max_retries: 3,
            backoff_unit: Duration::ZERO,
        },
        pacing: Pacing {
            chapter_delay: Duration::ZERO,
            group_delay: Duration::ZERO,
        },
        ..PipelineSettings::default()
    }
}

struct Harness {
    orchestrator: Orchestrator,
    generator: Arc<ScriptedGenerator>,
    store: Arc<dyn RunStore>,
    progress: Arc<ProgressStore>,
    source: Vec<u8>,
}

fn harness(
    text: &str,
    settings: PipelineSettings,
    store: Arc<dyn RunStore>,
    script: impl Fn(&str) -> Result<String, GenerationError> + Send + Sync + 'static,
) -> Harness {
    let generator = Arc::new(ScriptedGenerator::new(script));
    let progress = Arc::new(ProgressStore::default());
    let orchestrator = Orchestrator::new(
        generator.clone(),
        Arc::clone(&store),
        Arc::clone(&progress),
        settings,
    )
    .expect("orchestrator");

    Harness {
        orchestrator,
        generator,
        store,
        progress,
        source: text.as_bytes().to_vec(),
    }
}

fn memory_store() -> Arc<dyn RunStore> {
    Arc::new(SqliteRunStore::in_memory().expect("store"))
}

fn new_run(harness: &Harness) -> NewRun {
    NewRun {
        title: "Test Book".to_string(),
        source_path: "books/test-book.txt".to_string(),
        source_sha256: String::new(),
        source_bytes: harness.source.len(),
    }
}

async fn run_to_end(harness: &Harness) -> RunOutcome {
    let run_id = harness.orchestrator.start(&new_run(harness)).expect("start");
    harness.orchestrator.execute(&run_id, harness.source.clone()).await
}

/// A stage runner with no store, reporting into `progress`.
fn bare_runner(generator: Arc<ScriptedGenerator>, progress: Arc<ProgressStore>, group_size: usize) -> StageRunner {
    StageRunner::new(
        generator,
        Arc::new(SqliteRunStore::unavailable()),
        progress,
        ResponseParser::new().expect("parser"),
        fast_settings(10, group_size),
    )
}

#[tokio::test]
async fn three_segments_flow_through_all_stages() {
    let text = "a".repeat(120);
    let harness = harness(&text, fast_settings(50, 10), memory_store(), well_formed);

    let outcome = run_to_end(&harness).await;
    assert_eq!(outcome.status, RunStatus::Completed, "{:?}", outcome.failure_reason);
    assert_eq!(outcome.counts.original_length, 120);
    assert_eq!(outcome.counts.segments_count, 3);
    assert_eq!(outcome.counts.groups_count, 1);

    let chapter_ids: Vec<&str> = outcome
        .results
        .chapter
        .iter()
        .map(|record| record.source_id().expect("source id"))
        .collect();
    for (position, id) in chapter_ids.iter().enumerate() {
        let prefix = format!("uuid-S{:03}-", position + 1);
        assert!(id.starts_with(&prefix), "{id}");
        assert_eq!(id.len(), prefix.len() + 8);
    }
    assert_eq!(outcome.results.chapter[2].field("segment_number"), Some(&json!(3)));
    assert_eq!(outcome.results.chapter[2].meta["char_count"], json!(20));
    assert_eq!(outcome.results.chapter[0].meta["level"], json!("chapter"));

    let group = &outcome.results.group[0];
    assert_eq!(group.field("group_id"), Some(&json!("G001")));
    assert_eq!(group.meta["parent_ids"], json!(chapter_ids));
    assert_eq!(group.content_refs.len(), 3);
    assert_eq!(group.content_refs[1]["segment_id"], json!("S002"));

    let book = outcome.results.book.as_ref().expect("book record");
    assert_eq!(book.summary, "the whole story");
    assert!(book.source_id().expect("book id").starts_with("uuid-BOOK-"));
    assert_eq!(book.meta["level"], json!("book"));
    assert_eq!(book.meta["parent_ids"], json!([group.source_id().expect("group id")]));
    assert_eq!(book.content_refs[0]["group_id"], json!("G001"));

    assert_eq!(harness.generator.budgets(), vec![4000, 4000, 4000, 5000, 6000]);

    let stored = harness.store.get_run(&outcome.run_id).expect("stored run");
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.stage_results.chapter.len(), 3);
    assert!(stored.stage_results.book.is_some());

    let progress = harness.progress.get(&outcome.run_id);
    assert_eq!(progress.status, ProgressStatus::Completed);
    assert_eq!(progress.percent, 100);
}

#[tokio::test]
async fn chapter_stage_without_survivors_fails_before_grouping() {
    let harness = harness(
        &"b".repeat(30),
        fast_settings(10, 10),
        memory_store(),
        |_| Err(GenerationError::Timeout),
    );

    let outcome = run_to_end(&harness).await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(
        outcome
            .failure_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("chapter"))
    );
    assert_eq!(outcome.counts.chapter.units, 3);
    assert_eq!(outcome.counts.chapter.generation_failures, 3);
    assert_eq!(harness.generator.call_count(), 9);
    assert!(harness.generator.budgets().iter().all(|budget| *budget == 4000));
    assert!(outcome.results.book.is_none());

    let stored = harness.store.get_run(&outcome.run_id).expect("stored run");
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(
        harness.progress.get(&outcome.run_id).status,
        ProgressStatus::Failed
    );
}

#[tokio::test]
async fn unparseable_units_are_dropped_and_counted() {
    let harness = harness(&"c".repeat(30), fast_settings(10, 2), memory_store(), |prompt| {
        if prompt.contains("- segment: S002") {
            Ok("Sorry, I cannot summarize this.".to_string())
        } else {
            well_formed(prompt)
        }
    });

    let outcome = run_to_end(&harness).await;
    assert!(outcome.succeeded());
    assert_eq!(outcome.counts.chapter.parse_failures, 1);
    assert_eq!(outcome.counts.chapter.records, 2);
    assert_eq!(outcome.counts.groups_count, 1);

    let segment_ids: Vec<_> = outcome
        .results
        .chapter
        .iter()
        .map(|record| record.field("segment_id").cloned())
        .collect();
    assert_eq!(segment_ids, vec![Some(json!("S001")), Some(json!("S003"))]);
}

#[tokio::test]
async fn groups_follow_chapter_order() {
    let harness = harness(&"d".repeat(50), fast_settings(10, 2), memory_store(), well_formed);

    let outcome = run_to_end(&harness).await;
    assert!(outcome.succeeded());
    assert_eq!(outcome.counts.groups_count, 3);

    let ranges: Vec<_> = outcome
        .results
        .group
        .iter()
        .map(|record| record.field("segment_range").cloned())
        .collect();
    assert_eq!(
        ranges,
        vec![
            Some(json!({"start": 1, "end": 2})),
            Some(json!({"start": 3, "end": 4})),
            Some(json!({"start": 5, "end": 5})),
        ]
    );

    let Some(StageOutput::Records(stored)) =
        harness.store.get_stage_results(&outcome.run_id, Stage::Group)
    else {
        panic!("expected stored group records");
    };
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[2].field("group_number"), Some(&json!(3)));
}

#[tokio::test]
async fn missing_book_response_fails_the_run() {
    let harness = harness(&"e".repeat(10), fast_settings(10, 10), memory_store(), |prompt| {
        if prompt.contains("Whole-work details") {
            Ok("no json here".to_string())
        } else {
            well_formed(prompt)
        }
    });

    let outcome = run_to_end(&harness).await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.counts.book.parse_failures, 1);
    assert!(outcome.results.book.is_none());
    assert_eq!(outcome.results.group.len(), 1);
}

#[tokio::test]
async fn unavailable_store_keeps_results_in_memory() {
    let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::unavailable());
    let harness = harness(&"f".repeat(25), fast_settings(10, 10), store, well_formed);

    let outcome = run_to_end(&harness).await;
    assert!(outcome.succeeded());
    assert!(!outcome.storage_available);
    assert_eq!(outcome.results.chapter.len(), 3);
    assert!(outcome.results.book.is_some());
    assert!(harness.store.get_run(&outcome.run_id).is_none());
}

#[tokio::test]
async fn required_storage_refuses_to_start_without_a_store() {
    let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::unavailable());
    let settings = PipelineSettings {
        require_storage: true,
        ..fast_settings(10, 10)
    };
    let harness = harness("text", settings, store, well_formed);

    let error = harness
        .orchestrator
        .start(&new_run(&harness))
        .expect_err("storage required");
    assert!(matches!(error, PipelineError::StorageUnavailable(_)));
}

#[tokio::test]
async fn invalid_settings_are_rejected_at_start() {
    let harness = harness("text", fast_settings(0, 10), memory_store(), well_formed);
    let error = harness
        .orchestrator
        .start(&new_run(&harness))
        .expect_err("zero segment size");
    assert!(matches!(error, PipelineError::InvalidInput(_)));
}

#[tokio::test]
async fn blank_source_fails_without_calling_the_model() {
    let harness = harness(" \n\n ", fast_settings(10, 10), memory_store(), well_formed);

    let outcome = run_to_end(&harness).await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(
        outcome
            .failure_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("source unreadable"))
    );
    assert_eq!(harness.generator.call_count(), 0);
}

#[tokio::test]
async fn run_decodes_the_bytes_it_was_handed() {
    let harness = harness(&"h".repeat(25), fast_settings(10, 10), memory_store(), well_formed);
    let run_id = harness.orchestrator.start(&new_run(&harness)).expect("start");

    // GBK bytes for "第一章" followed by ASCII; no file is ever read.
    let mut source = vec![0xB5, 0xDA, 0xD2, 0xBB, 0xD5, 0xC2];
    source.extend_from_slice(b" opening");
    let outcome = harness.orchestrator.execute(&run_id, source).await;

    assert!(outcome.succeeded(), "{:?}", outcome.failure_reason);
    assert_eq!(outcome.counts.original_length, 11);
    assert_eq!(outcome.counts.segments_count, 2);
}

#[tokio::test]
async fn group_stage_without_survivors_fails_before_book() {
    let harness = harness(&"k".repeat(20), fast_settings(10, 10), memory_store(), |prompt| {
        if prompt.contains("Group details") {
            Err(GenerationError::Status {
                status: 500,
                body: "overloaded".to_string(),
            })
        } else {
            well_formed(prompt)
        }
    });

    let outcome = run_to_end(&harness).await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(
        outcome
            .failure_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("group"))
    );
    assert_eq!(outcome.results.chapter.len(), 2);
    assert_eq!(outcome.counts.group.generation_failures, 1);
    assert_eq!(harness.generator.prompts_containing("Whole-work details"), 0);
    assert_eq!(harness.generator.budgets(), vec![4000, 4000, 5000, 5000, 5000]);
    assert_eq!(
        harness.store.get_run(&outcome.run_id).expect("stored run").status,
        RunStatus::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn chapter_retried_twice_still_lands_in_results() {
    let attempts: Arc<Mutex<HashMap<String, u32>>> = Arc::default();
    let seen = Arc::clone(&attempts);
    let settings = PipelineSettings {
        retry: RetryPolicy {
            max_retries: 3,
            backoff_unit: Duration::from_secs(3),
        },
        ..fast_settings(10, 10)
    };
    let harness = harness(&"m".repeat(30), settings, memory_store(), move |prompt| {
        if prompt.contains("- segment: S002") {
            let mut attempts = seen.lock().unwrap();
            let count = attempts.entry("S002".to_string()).or_default();
            *count += 1;
            if *count <= 2 {
                return Err(GenerationError::Timeout);
            }
        }
        well_formed(prompt)
    });
    let started = tokio::time::Instant::now();

    let outcome = run_to_end(&harness).await;
    assert!(outcome.succeeded(), "{:?}", outcome.failure_reason);
    assert!(started.elapsed() >= Duration::from_secs(9));
    assert_eq!(attempts.lock().unwrap().get("S002"), Some(&3));
    assert_eq!(outcome.counts.chapter.generation_failures, 0);
    assert_eq!(outcome.counts.chapter.records, 3);
    assert_eq!(
        outcome.results.chapter[1].field("segment_id"),
        Some(&json!("S002"))
    );
    // three chapters, two retries, one group, one book
    assert_eq!(harness.generator.call_count(), 7);
}

#[tokio::test]
async fn stage_progress_advances_per_unit() {
    let progress = Arc::new(ProgressStore::default());
    let observed: Arc<Mutex<Vec<u8>>> = Arc::default();
    let (watch, log) = (Arc::clone(&progress), Arc::clone(&observed));
    let generator = Arc::new(ScriptedGenerator::new(move |prompt| {
        log.lock().unwrap().push(watch.get("run-p").percent);
        well_formed(prompt)
    }));
    let runner = bare_runner(generator, Arc::clone(&progress), 1);
    let segments = segment(&"n".repeat(30), 10).expect("segment");

    progress.update("run-p", ProgressStatus::Processing, 30, "chapter", "starting");
    let chapters = runner.run_chapter_stage("run-p", &segments).await.expect("chapters");
    assert_eq!(*observed.lock().unwrap(), vec![30, 36, 43]);
    assert_eq!(progress.get("run-p").percent, 50);

    observed.lock().unwrap().clear();
    let groups = runner.run_group_stage("run-p", &chapters.output).await.expect("groups");
    assert_eq!(groups.output.len(), 3);
    assert_eq!(*observed.lock().unwrap(), vec![50, 65, 70]);
    let last = progress.get("run-p");
    assert_eq!(last.percent, 75);
    assert_eq!(last.current_step, "group");
}

#[tokio::test]
async fn panicking_generator_aborts_the_run() {
    let harness = harness("text", fast_settings(10, 10), memory_store(), |_| {
        panic!("generator exploded")
    });

    let outcome = run_to_end(&harness).await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(
        outcome
            .failure_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("aborted"))
    );
    assert_eq!(
        harness.store.get_run(&outcome.run_id).expect("stored run").status,
        RunStatus::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn pacing_waits_between_units_only() {
    let settings = PipelineSettings {
        pacing: Pacing {
            chapter_delay: Duration::from_secs(3),
            group_delay: Duration::from_secs(5),
        },
        ..fast_settings(10, 1)
    };
    let harness = harness(&"g".repeat(20), settings, memory_store(), well_formed);
    let started = tokio::time::Instant::now();

    let outcome = run_to_end(&harness).await;
    assert!(outcome.succeeded());
    // two chapters and two groups: one gap each
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(8), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(9), "{elapsed:?}");
}
