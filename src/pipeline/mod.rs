pub mod aggregate;
pub mod decode;
pub mod error;
pub mod generation;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod response;
pub mod sanitize;
pub mod segment;
pub mod settings;
pub mod stages;
#[cfg(test)]
mod tests;

pub use generation::{ChatCompletionsClient, GenerationSettings, RetryPolicy};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use progress::ProgressStore;
pub use settings::{Pacing, PipelineSettings, TokenBudgets};
