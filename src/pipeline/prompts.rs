use serde_json::Value;

use crate::model::Segment;

use super::aggregate::ChildAggregate;

const CHAPTER_INSTRUCTIONS: &str = r#"You are analyzing one excerpt of a long narrative text.
Read the excerpt and report:
- a plot summary of 500 to 800 words
- the main characters with their personality, relationships and motives
- key events and conflicts
- how mood and atmosphere shift
- pacing and narrative structure
- scene types and how well they would adapt to screen
- tags for theme, emotion, genre, setting, era and recurring elements
- turning points and climaxes

Answer with a single JSON object with these fields:
segment_id, summary, main_characters, conflicts, emotional_flow, tags,
plot_points, analysis (object of metrics), meta (object; include
word_count and genre), content_refs (empty array)."#;

const GROUP_INSTRUCTIONS: &str = r#"You are given the summaries of several consecutive excerpts of a long narrative text.
Work one level higher and report:
- how many storylines run through these excerpts and what the side plots look like
- conflict density (estimated conflicts per ten thousand words)
- number and placement of climaxes and reversals
- the pacing trend (steady, accelerating or oscillating)
- how the main characters and their relationships develop
- where the narrative tension comes from
- the mix of scene types (interior or exterior, action, emotion, dialogue)
- whether the tags concentrate on a core theme

Answer with a single JSON object with these fields:
group_id, summary, analysis (object of metrics), meta (object; include
word_count and genre), content_refs."#;

const BOOK_INSTRUCTIONS: &str = r#"You are given the group-level summaries of an entire narrative text.
Produce a whole-work assessment covering storyline count, conflict density,
climax and reversal count, rhythm pattern, character count and protagonist
clarity, relationship complexity, screen adaptability, action to event
ratio, special effects need, plot tension, emotional resonance, audience
gender orientation, target age, tag count, core tags, tag concentration and
audience interest match.

Answer with a single JSON object shaped like this example:

```json
{
  "book_summary": "The book follows...",
  "analysis": {
    "main_storylines": 3,
    "avg_conflict_density": 0.017,
    "total_climax_points": 21,
    "rhythm_pattern": "fast with slow stretches",
    "character_count": 15,
    "protagonist_clarity": "strong",
    "relationship_complexity": "complex",
    "scene_adaptability": "high",
    "action_event_ratio": "7:3",
    "special_effects_need": "medium",
    "plot_tension": "strong",
    "emotional_resonance": "high",
    "gender_orientation": "neutral",
    "target_age": "16-25",
    "tag_count": 8,
    "core_tags": ["fantasy", "coming of age", "revenge"],
    "tag_concentration": "focused",
    "interest_matching": "high"
  },
  "meta": {
    "level": "book",
    "word_count": 0,
    "genre": []
  }
}
```"#;

pub fn chapter_prompt(segment: &Segment, timestamp: &str) -> String {
    format!(
        "{CHAPTER_INSTRUCTIONS}\n\nExcerpt details:\n- segment: {label}\n- characters: {count}\n- timestamp: {timestamp}\n\nExcerpt:\n{text}",
        label = segment.label(),
        count = segment.char_count,
        text = segment.text,
    )
}

pub fn group_prompt(label: &str, aggregate: &ChildAggregate, children: &Value, timestamp: &str) -> String {
    format!(
        "{GROUP_INSTRUCTIONS}\n\nGroup details:\n- group: {label}\n- parent ids: {parents}\n- segment range: {start}-{end}\n- total word count: {words}\n- genres: {genres}\n- timestamp: {timestamp}\n\nExcerpt summaries:\n{children}",
        parents = render(&aggregate.parent_ids),
        start = render_bound(aggregate.first_segment),
        end = render_bound(aggregate.last_segment),
        words = aggregate.total_word_count,
        genres = render(&aggregate.genres),
        children = pretty(children),
    )
}

pub fn book_prompt(aggregate: &ChildAggregate, groups: &Value, timestamp: &str) -> String {
    format!(
        "{BOOK_INSTRUCTIONS}\n\nWhole-work details:\n- parent ids: {parents}\n- total chapters: {chapters}\n- total word count: {words}\n- genres: {genres}\n- timestamp: {timestamp}\n\nGroup summaries:\n{groups}",
        parents = render(&aggregate.parent_ids),
        chapters = aggregate.total_chapters,
        words = aggregate.total_word_count,
        genres = render(&aggregate.genres),
        groups = pretty(groups),
    )
}

fn render<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn render_bound(bound: Option<i64>) -> String {
    bound.map_or_else(|| "?".to_string(), |value| value.to_string())
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
