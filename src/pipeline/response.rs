use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Map, Value};

use super::error::{PipelineError, PipelineResult};

/// One way of locating a JSON object inside a model response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// The whole response is the object.
    Direct,
    /// The interior of a ```json fenced block.
    FencedBlock,
    /// Leftmost `{` through the last `}` in the text.
    BraceSpan,
}

impl ExtractionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::FencedBlock => "fenced_block",
            Self::BraceSpan => "brace_span",
        }
    }
}

pub const DEFAULT_STRATEGIES: [ExtractionStrategy; 3] = [
    ExtractionStrategy::Direct,
    ExtractionStrategy::FencedBlock,
    ExtractionStrategy::BraceSpan,
];

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub object: Map<String, Value>,
    pub strategy: ExtractionStrategy,
}

#[derive(Debug, Clone)]
pub struct ResponseParser {
    fenced_block: Regex,
    strategies: Vec<ExtractionStrategy>,
}

impl ResponseParser {
    pub fn new() -> Result<Self> {
        Self::with_strategies(DEFAULT_STRATEGIES.to_vec())
    }

    pub fn with_strategies(strategies: Vec<ExtractionStrategy>) -> Result<Self> {
        let fenced_block = Regex::new(r"(?s)```json\s*(.*?)\s*```")
            .context("failed to compile fenced block regex")?;
        Ok(Self {
            fenced_block,
            strategies,
        })
    }

    /// Tries each strategy in order; the first one yielding a JSON object wins.
    pub fn parse(&self, raw: &str) -> PipelineResult<ParsedResponse> {
        self.strategies
            .iter()
            .find_map(|strategy| {
                self.try_strategy(*strategy, raw)
                    .map(|object| ParsedResponse {
                        object,
                        strategy: *strategy,
                    })
            })
            .ok_or(PipelineError::ParseFailure)
    }

    pub fn try_strategy(&self, strategy: ExtractionStrategy, raw: &str) -> Option<Map<String, Value>> {
        let candidate = match strategy {
            ExtractionStrategy::Direct => Some(raw),
            ExtractionStrategy::FencedBlock => self
                .fenced_block
                .captures(raw)
                .and_then(|captures| captures.get(1))
                .map(|interior| interior.as_str()),
            ExtractionStrategy::BraceSpan => brace_span(raw),
        }?;

        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(object)) => Some(object),
            _ => None,
        }
    }
}

fn brace_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}
