use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::AnalyzeArgs;
use crate::model::{AnalysisRunManifest, ModelSummary, NewRun, StageCounts};
use crate::pipeline::generation::DEFAULT_TEMPERATURE;
use crate::pipeline::{
    ChatCompletionsClient, GenerationSettings, Orchestrator, Pacing, PipelineSettings,
    ProgressStore, RetryPolicy, RunOutcome, TokenBudgets,
};
use crate::store::{RunStore, SqliteRunStore};
use crate::util::{ensure_directory, now_utc_string, sha256_hex, utc_compact_string, write_json_pretty};

use super::{manifest_dir, progress_dir, resolve_db_path};

const MANIFEST_VERSION: u32 = 1;

pub fn run(args: AnalyzeArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();

    let cache_root = args.cache_root.clone();
    let manifest_dir = manifest_dir(&cache_root);
    ensure_directory(&manifest_dir)?;

    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!(
            "analysis_run_{}.json",
            utc_compact_string(started_ts)
        ))
    });
    let db_path = resolve_db_path(&cache_root, args.db_path.as_ref());

    let source_bytes = fs::read(&args.input)
        .with_context(|| format!("failed to read input {}", args.input.display()))?;
    let source_sha256 = sha256_hex(&source_bytes);
    let title = args.title.clone().unwrap_or_else(|| title_from_path(&args.input));

    let pipeline_settings = pipeline_settings(&args);
    let generation_settings = generation_settings(&args);
    pipeline_settings.validate()?;
    generation_settings.validate()?;

    info!(
        input = %args.input.display(),
        title = %title,
        bytes = source_bytes.len(),
        model = %generation_settings.model,
        "starting analysis"
    );

    let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::open_or_unavailable(&db_path));
    let progress = Arc::new(ProgressStore::with_mirror(progress_dir(&cache_root)));
    let generator = Arc::new(ChatCompletionsClient::new(generation_settings.clone())?);
    let orchestrator = Orchestrator::new(
        generator,
        Arc::clone(&store),
        Arc::clone(&progress),
        pipeline_settings,
    )?;

    let new_run = NewRun {
        title: title.clone(),
        source_path: args.input.display().to_string(),
        source_sha256: source_sha256.clone(),
        source_bytes: source_bytes.len(),
    };
    let run_id = orchestrator
        .start(&new_run)
        .context("failed to start analysis run")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    let outcome = runtime.block_on(orchestrator.execute(&run_id, source_bytes));

    let last_progress = progress.get(&run_id);
    info!(
        run_id = %run_id,
        status = ?last_progress.status,
        percent = last_progress.percent,
        step = %last_progress.current_step,
        message = %last_progress.message,
        "final progress"
    );

    let manifest = AnalysisRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id: outcome.run_id.clone(),
        status: outcome.status,
        started_at,
        updated_at: now_utc_string(),
        title,
        source_path: new_run.source_path.clone(),
        source_sha256,
        storage_available: outcome.storage_available,
        model: ModelSummary {
            base_url: generation_settings.base_url.clone(),
            model_name: generation_settings.model.clone(),
            timeout_secs: generation_settings.timeout.as_secs(),
            max_retries: args.max_retries,
        },
        counts: outcome.counts.clone(),
        failure_reason: outcome.failure_reason.clone(),
        warnings: collect_warnings(&outcome),
        stage_results: outcome.results.clone(),
    };
    write_json_pretty(&manifest_path, &manifest)?;

    for warning in &manifest.warnings {
        warn!(run_id = %outcome.run_id, warning = %warning, "analysis warning");
    }
    info!(
        run_id = %outcome.run_id,
        status = outcome.status.as_str(),
        segments = outcome.counts.segments_count,
        chapters = outcome.counts.chapter.records,
        groups = outcome.counts.group.records,
        manifest = %manifest_path.display(),
        "analysis finished"
    );

    if !outcome.succeeded() {
        bail!(
            "analysis run {} failed: {}",
            outcome.run_id,
            outcome.failure_reason.unwrap_or_default()
        );
    }

    Ok(())
}

fn pipeline_settings(args: &AnalyzeArgs) -> PipelineSettings {
    PipelineSettings {
        segment_size: args.segment_size,
        group_size: args.group_size,
        retry: RetryPolicy {
            max_retries: args.max_retries,
            backoff_unit: Duration::from_secs(args.retry_backoff_secs),
        },
        pacing: Pacing {
            chapter_delay: Duration::from_secs(args.chapter_delay_secs),
            group_delay: Duration::from_secs(args.group_delay_secs),
        },
        budgets: TokenBudgets::default(),
        require_storage: args.require_storage,
    }
}

fn generation_settings(args: &AnalyzeArgs) -> GenerationSettings {
    GenerationSettings {
        base_url: args.base_url.clone(),
        api_key: args.api_key.clone(),
        model: args.model.clone(),
        timeout: Duration::from_secs(args.timeout_secs),
        temperature: DEFAULT_TEMPERATURE,
    }
}

fn title_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "untitled".to_string())
}

fn collect_warnings(outcome: &RunOutcome) -> Vec<String> {
    let mut warnings = Vec::new();
    if !outcome.storage_available {
        warnings.push("storage unavailable; results exist only in this manifest".to_string());
    }

    let stages = [
        ("chapter", outcome.counts.chapter),
        ("group", outcome.counts.group),
        ("book", outcome.counts.book),
    ];
    for (stage, counts) in stages {
        if let Some(message) = dropped_units_warning(stage, counts) {
            warnings.push(message);
        }
    }
    warnings
}

fn dropped_units_warning(stage: &str, counts: StageCounts) -> Option<String> {
    let dropped = counts.generation_failures + counts.parse_failures;
    (dropped > 0).then(|| {
        format!(
            "{stage}: {dropped} of {} unit(s) dropped ({} generation, {} parse)",
            counts.units, counts.generation_failures, counts.parse_failures
        )
    })
}
