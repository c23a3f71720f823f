use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A contiguous slice of the source document. Offsets count characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub char_count: usize,
}

impl Segment {
    pub fn label(&self) -> String {
        format!("S{:03}", self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Chapter,
    Group,
    Book,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chapter => "chapter",
            Self::Group => "group",
            Self::Book => "book",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chapter" => Some(Self::Chapter),
            "group" => Some(Self::Group),
            "book" => Some(Self::Book),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Statuses a run may be in immediately before moving to `self`.
    ///
    /// A failure may interrupt a run that never left `pending`, so `failed`
    /// accepts both non-terminal states.
    pub fn predecessors(self) -> &'static [RunStatus] {
        match self {
            Self::Pending => &[],
            Self::Processing => &[Self::Pending],
            Self::Completed => &[Self::Processing],
            Self::Failed => &[Self::Pending, Self::Processing],
        }
    }

    pub fn can_advance_to(self, next: RunStatus) -> bool {
        next.predecessors().contains(&self)
    }
}

/// Structured summary produced by one generation call.
///
/// `summary`, `analysis`, `meta` and `content_refs` are the fields the
/// pipeline reads; anything else the model returned rides along in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalysisRecord {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub analysis: Map<String, Value>,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub content_refs: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnalysisRecord {
    /// Builds a record from a parsed model object.
    ///
    /// `content_refs` from the model are discarded: the pipeline attaches its
    /// own references for aggregated stages.
    pub fn from_object(mut object: Map<String, Value>) -> Self {
        let summary = match object.remove("summary") {
            Some(value) => text_of(value),
            None => object.remove("book_summary").map(text_of).unwrap_or_default(),
        };

        let analysis = match object.remove("analysis") {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                object.insert("analysis_raw".to_string(), other);
                Map::new()
            }
        };

        let meta = match object.remove("meta") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        object.remove("content_refs");

        Self {
            summary,
            analysis,
            meta,
            content_refs: Vec::new(),
            extra: object,
        }
    }

    pub fn source_id(&self) -> Option<&str> {
        self.meta.get("source_id").and_then(Value::as_str)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.meta.insert(key.to_string(), value.into());
    }

    pub fn set_field(&mut self, key: &str, value: impl Into<Value>) {
        self.extra.insert(key.to_string(), value.into());
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn text_of(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageResults {
    pub chapter: Vec<AnalysisRecord>,
    pub group: Vec<AnalysisRecord>,
    pub book: Option<AnalysisRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    pub title: String,
    pub source_path: String,
    pub source_sha256: String,
    pub created_at: String,
    pub updated_at: String,
    pub stage_results: StageResults,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub title: String,
    pub source_path: String,
    pub source_sha256: String,
    pub source_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub title: String,
    pub status: RunStatus,
    pub created_at: String,
    pub updated_at: String,
    pub chapter_count: i64,
    pub group_count: i64,
    pub book_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotFound,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub status: ProgressStatus,
    pub percent: u8,
    pub current_step: String,
    pub message: String,
    pub updated_at: String,
}

/// Per-stage unit accounting. Dropped units only show up here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub units: usize,
    pub records: usize,
    pub generation_failures: usize,
    pub parse_failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub base_url: String,
    pub model_name: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisCounts {
    pub original_length: usize,
    pub segments_count: usize,
    pub groups_count: usize,
    pub chapter: StageCounts,
    pub group: StageCounts,
    pub book: StageCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: String,
    pub updated_at: String,
    pub title: String,
    pub source_path: String,
    pub source_sha256: String,
    pub storage_available: bool,
    pub model: ModelSummary,
    pub counts: AnalysisCounts,
    pub failure_reason: Option<String>,
    pub stage_results: StageResults,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_only_moves_forward() {
        assert!(RunStatus::Pending.can_advance_to(RunStatus::Processing));
        assert!(RunStatus::Processing.can_advance_to(RunStatus::Completed));
        assert!(RunStatus::Processing.can_advance_to(RunStatus::Failed));
        assert!(!RunStatus::Completed.can_advance_to(RunStatus::Processing));
        assert!(!RunStatus::Failed.can_advance_to(RunStatus::Completed));
        assert!(!RunStatus::Pending.can_advance_to(RunStatus::Completed));
        assert!(!RunStatus::Processing.can_advance_to(RunStatus::Pending));
    }

    #[test]
    fn from_object_splits_envelope_and_extra_fields() {
        let object = serde_json::json!({
            "summary": "a tale",
            "analysis": {"pace": "fast"},
            "meta": {"source_id": "model-made", "genre": ["drama"]},
            "content_refs": [{"bogus": true}],
            "main_characters": ["Ann"]
        });
        let Value::Object(map) = object else {
            unreachable!()
        };

        let record = AnalysisRecord::from_object(map);
        assert_eq!(record.summary, "a tale");
        assert_eq!(record.analysis["pace"], "fast");
        assert_eq!(record.source_id(), Some("model-made"));
        assert!(record.content_refs.is_empty());
        assert_eq!(record.extra["main_characters"][0], "Ann");
    }

    #[test]
    fn from_object_falls_back_to_book_summary() {
        let Value::Object(map) = serde_json::json!({"book_summary": "whole book", "analysis": 3})
        else {
            unreachable!()
        };

        let record = AnalysisRecord::from_object(map);
        assert_eq!(record.summary, "whole book");
        assert!(record.analysis.is_empty());
        assert_eq!(record.extra["analysis_raw"], 3);
    }

    #[test]
    fn record_serializes_flat() {
        let mut record = AnalysisRecord {
            summary: "s".to_string(),
            ..AnalysisRecord::default()
        };
        record.set_field("segment_id", "S001");
        let value = record.to_value();
        assert_eq!(value["segment_id"], "S001");
        assert_eq!(value["summary"], "s");
        assert!(value["content_refs"].as_array().is_some());
    }
}
