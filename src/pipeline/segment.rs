use crate::model::Segment;

use super::error::{PipelineError, PipelineResult};

/// Splits `text` into consecutive chunks of `segment_size` characters.
///
/// The final chunk holds the remainder. Empty input yields no segments;
/// deciding whether that is fatal is left to the caller.
pub fn segment(text: &str, segment_size: usize) -> PipelineResult<Vec<Segment>> {
    if segment_size == 0 {
        return Err(PipelineError::InvalidInput(
            "segment size must be positive".to_string(),
        ));
    }

    let mut segments = Vec::new();
    let mut chars_in_chunk = 0usize;
    let mut chunk_start_byte = 0usize;
    let mut chunk_start_offset = 0usize;

    for (byte_index, _) in text.char_indices() {
        if chars_in_chunk == segment_size {
            push_segment(
                &mut segments,
                &text[chunk_start_byte..byte_index],
                chunk_start_offset,
                chars_in_chunk,
            );
            chunk_start_byte = byte_index;
            chunk_start_offset += chars_in_chunk;
            chars_in_chunk = 0;
        }
        chars_in_chunk += 1;
    }

    if chars_in_chunk > 0 {
        push_segment(
            &mut segments,
            &text[chunk_start_byte..],
            chunk_start_offset,
            chars_in_chunk,
        );
    }

    Ok(segments)
}

fn push_segment(segments: &mut Vec<Segment>, text: &str, start_offset: usize, char_count: usize) {
    segments.push(Segment {
        index: segments.len() + 1,
        text: text.to_string(),
        start_offset,
        end_offset: start_offset + char_count,
        char_count,
    });
}
