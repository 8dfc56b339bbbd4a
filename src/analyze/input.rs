//! Submission input: validation, normalized concatenation, clipping.

use crate::error::EngineError;

/// Fixed separator between the free text and the extracted document text.
pub const DOC_SEPARATOR: &str = "\n\n";

/// Immutable request value. `doc_text: Some("")` is kept distinct from `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisInput {
    text: String,
    doc_text: Option<String>,
}

impl AnalysisInput {
    /// Validates that `text` is non-empty after trimming.
    pub fn new(text: impl Into<String>, doc_text: Option<String>) -> Result<Self, EngineError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(EngineError::invalid_input("text must not be empty"));
        }
        Ok(Self { text, doc_text })
    }

    /// `trim(text)` or `trim(text) + "\n\n" + trim(doc_text)`.
    /// Cache equivalence is defined on these bytes.
    pub fn normalized(&self) -> String {
        let base = self.text.trim();
        match &self.doc_text {
            None => base.to_string(),
            Some(doc) => {
                let doc = doc.trim();
                let mut out = String::with_capacity(base.len() + DOC_SEPARATOR.len() + doc.len());
                out.push_str(base);
                out.push_str(DOC_SEPARATOR);
                out.push_str(doc);
                out
            }
        }
    }

    /// Normalized concatenation clipped to `max_chars` scalar values.
    /// What the matcher and the judgment provider actually see.
    pub fn analysis_text(&self, max_chars: usize) -> String {
        clip_chars(&self.normalized(), max_chars)
    }
}

fn clip_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_text_even_with_doc() {
        assert!(AnalysisInput::new("   \n\t", None).is_err());
        let err = AnalysisInput::new("", Some("資料本文".into())).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn normalized_concatenation() {
        let a = AnalysisInput::new("  新規事業  ", None).unwrap();
        assert_eq!(a.normalized(), "新規事業");

        let b = AnalysisInput::new("新規事業", Some(" 資料 ".into())).unwrap();
        assert_eq!(b.normalized(), "新規事業\n\n資料");

        let c = AnalysisInput::new("新規事業", Some(String::new())).unwrap();
        assert_eq!(c.normalized(), "新規事業\n\n");
        assert_ne!(a.normalized(), c.normalized(), "empty doc differs from absent doc");
    }

    #[test]
    fn clipping_counts_chars_not_bytes() {
        let a = AnalysisInput::new("予算予算予算", None).unwrap();
        assert_eq!(a.analysis_text(2), "予算");
        assert_eq!(a.analysis_text(100), "予算予算予算");
    }
}
