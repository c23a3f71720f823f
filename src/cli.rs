use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::model::Stage;

#[derive(Parser, Debug)]
#[command(
    name = "bookdigest",
    version,
    about = "Hierarchical segment, group and whole-book summaries of long texts"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Analyze a text file and record the run.
    Analyze(AnalyzeArgs),
    /// List runs, or show one run with its last known progress.
    Status(StatusArgs),
    /// Print the stored results of one stage, or of the whole run.
    Results(ResultsArgs),
    /// Delete a run and all of its stage results.
    Delete(DeleteArgs),
}

#[derive(Args, Debug, Clone)]
pub struct AnalyzeArgs {
    #[arg(long)]
    pub input: PathBuf,

    /// Defaults to the input file stem.
    #[arg(long)]
    pub title: Option<String>,

    #[arg(long, default_value = ".cache/bookdigest")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(long, default_value_t = 50_000)]
    pub segment_size: usize,

    #[arg(long, default_value_t = 10)]
    pub group_size: usize,

    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, default_value_t = 3)]
    pub retry_backoff_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub chapter_delay_secs: u64,

    #[arg(long, default_value_t = 5)]
    pub group_delay_secs: u64,

    #[arg(long, env = "BOOKDIGEST_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub base_url: String,

    #[arg(long, env = "BOOKDIGEST_API_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "BOOKDIGEST_MODEL")]
    pub model: String,

    #[arg(long, default_value_t = 120)]
    pub timeout_secs: u64,

    /// Fail instead of keeping results in memory when the database is unusable.
    #[arg(long, default_value_t = false)]
    pub require_storage: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/bookdigest")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub run_id: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ResultsArgs {
    #[arg(long, default_value = ".cache/bookdigest")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub run_id: String,

    /// Omit to print the whole run with every stage.
    #[arg(long, value_enum)]
    pub stage: Option<Stage>,

    /// Write to this file instead of stdout.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    #[arg(long, default_value = ".cache/bookdigest")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub run_id: String,
}
