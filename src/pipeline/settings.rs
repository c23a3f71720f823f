use std::time::Duration;

use super::error::{PipelineError, PipelineResult};
use super::generation::RetryPolicy;

pub const DEFAULT_SEGMENT_SIZE: usize = 50_000;
pub const DEFAULT_GROUP_SIZE: usize = 10;

/// Waits inserted between consecutive units of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub chapter_delay: Duration,
    pub group_delay: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            chapter_delay: Duration::from_secs(3),
            group_delay: Duration::from_secs(5),
        }
    }
}

/// `max_tokens` sent with each stage's generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudgets {
    pub chapter: u32,
    pub group: u32,
    pub book: u32,
}

impl Default for TokenBudgets {
    fn default() -> Self {
        Self {
            chapter: 4000,
            group: 5000,
            book: 6000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub segment_size: usize,
    pub group_size: usize,
    pub retry: RetryPolicy,
    pub pacing: Pacing,
    pub budgets: TokenBudgets,
    /// Treat an unavailable store as fatal instead of running in memory.
    pub require_storage: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            group_size: DEFAULT_GROUP_SIZE,
            retry: RetryPolicy::default(),
            pacing: Pacing::default(),
            budgets: TokenBudgets::default(),
            require_storage: false,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> PipelineResult<()> {
        let checks = [
            (self.segment_size == 0, "segment size must be positive"),
            (self.group_size == 0, "group size must be positive"),
            (self.retry.max_retries == 0, "max retries must be positive"),
            (
                self.budgets.chapter == 0 || self.budgets.group == 0 || self.budgets.book == 0,
                "token budgets must be positive",
            ),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(PipelineError::InvalidInput((*reason).to_string())),
            None => Ok(()),
        }
    }
}
