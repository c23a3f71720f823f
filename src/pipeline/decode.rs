use encoding_rs::{Encoding, GBK, UTF_8};

use super::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSource {
    pub text: String,
    pub encoding: &'static str,
}

impl DecodedSource {
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// Decodes source bytes: BOM first, then strict UTF-8, then strict GBK.
///
/// Text that decodes to nothing but whitespace counts as unreadable.
pub fn decode_source(bytes: &[u8]) -> PipelineResult<DecodedSource> {
    let decoded = if let Some((encoding, bom_length)) = Encoding::for_bom(bytes) {
        strict_decode(encoding, &bytes[bom_length..])
    } else {
        strict_decode(UTF_8, bytes).or_else(|| strict_decode(GBK, bytes))
    };

    let decoded = decoded.ok_or_else(|| {
        PipelineError::SourceUnreadable("source is not valid UTF-8, UTF-16 or GBK text".to_string())
    })?;

    if decoded.text.trim().is_empty() {
        return Err(PipelineError::SourceUnreadable("source text is empty".to_string()));
    }
    Ok(decoded)
}

fn strict_decode(encoding: &'static Encoding, bytes: &[u8]) -> Option<DecodedSource> {
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|text| DecodedSource {
            text: text.into_owned(),
            encoding: encoding.name(),
        })
}
