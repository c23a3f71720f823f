use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{Value, json};

use crate::model::AnalysisRecord;

/// What a parent stage learns from the records beneath it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChildAggregate {
    pub content_refs: Vec<Value>,
    pub parent_ids: Vec<String>,
    pub total_word_count: i64,
    pub genres: BTreeSet<String>,
    pub first_segment: Option<i64>,
    pub last_segment: Option<i64>,
    pub total_chapters: i64,
}

impl ChildAggregate {
    pub fn segment_range(&self) -> Value {
        json!({
            "start": self.first_segment,
            "end": self.last_segment,
        })
    }

    fn absorb_meta(&mut self, record: &AnalysisRecord, fallback_prefix: &str) {
        let parent_id = record
            .source_id()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{fallback_prefix}-{}", self.parent_ids.len()));
        self.parent_ids.push(parent_id);
        self.total_word_count = self
            .total_word_count
            .saturating_add(coerce_count(record.meta.get("word_count")));
        collect_tags(record.meta.get("genre"), &mut self.genres);
    }

    fn widen_range(&mut self, first: Option<i64>, last: Option<i64>) {
        if let Some(first) = first {
            self.first_segment = Some(self.first_segment.map_or(first, |seen| seen.min(first)));
        }
        if let Some(last) = last {
            self.last_segment = Some(self.last_segment.map_or(last, |seen| seen.max(last)));
        }
    }
}

/// Folds a batch of chapter records into the inputs of one group call.
pub fn aggregate_chapters(records: &[AnalysisRecord]) -> ChildAggregate {
    let mut aggregate = ChildAggregate::default();
    for record in records {
        aggregate.content_refs.push(json!({
            "segment_id": record.field("segment_id").cloned().unwrap_or(Value::Null),
            "summary": record.summary,
            "analysis": record.analysis,
        }));
        aggregate.absorb_meta(record, "unknown");

        let number = record.field("segment_number").and_then(Value::as_i64);
        aggregate.widen_range(number, number);
    }
    aggregate.total_chapters = aggregate.content_refs.len() as i64;
    aggregate
}

/// Folds every group record into the inputs of the book call.
pub fn aggregate_groups(records: &[AnalysisRecord]) -> ChildAggregate {
    let mut aggregate = ChildAggregate::default();
    for record in records {
        aggregate.content_refs.push(json!({
            "group_id": record.field("group_id").cloned().unwrap_or(Value::Null),
            "summary": record.summary,
            "analysis": record.analysis,
            "content_refs": record.content_refs,
        }));
        aggregate.absorb_meta(record, "unknown-group");

        let range = record.field("segment_range");
        aggregate.widen_range(
            range.and_then(|value| value.get("start")).and_then(Value::as_i64),
            range.and_then(|value| value.get("end")).and_then(Value::as_i64),
        );

        let group_number = record.field("group_number").and_then(Value::as_i64).unwrap_or(0);
        aggregate.total_chapters = aggregate.total_chapters.max(group_number);
    }
    aggregate
}

/// Reads a model-reported count. Numeric strings parse, floats truncate,
/// everything else counts as zero.
pub fn coerce_count(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.trunc() as i64))
            .unwrap_or(0),
        Some(Value::String(text)) => text.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    }
}

/// Unions string tags into `into`. A bare string is a single tag.
pub fn collect_tags(value: Option<&Value>, into: &mut BTreeSet<String>) {
    match value {
        Some(Value::Array(items)) => {
            into.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
        }
        Some(Value::String(tag)) => {
            into.insert(tag.clone());
        }
        _ => {}
    }
}
