//! Candidate parsers: pull code out of a model response and check it.
//!
//! Models wrap code in fences inconsistently: sometimes ```` ```python ````,
//! sometimes a bare ```` ``` ````, sometimes no fence at all even when told
//! to use one. Extraction therefore tries, in order:
//!
//! 1. the first fence tagged `python` / `py`
//! 2. the first untagged fence
//! 3. the whole response, when it is bare code
//!
//! The result is cleaned (line endings, invisible Unicode) and then checked
//! statically for the entry point before it is ever executed.

use crate::error::SynthesisError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Name of the function every candidate must define at module top level.
pub const ENTRY_POINT: &str = "parse";

/// Where a candidate's source came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    /// Cold prompt, no prior candidate.
    Synthesized,
    /// Repair prompt built from a previous candidate and its failure.
    Repaired,
    /// Loaded from the parser store of an earlier run.
    Persisted,
}

/// One generated attempt at a PDF-to-table routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateParser {
    /// Python source of the module.
    pub source: String,
    /// Entry-point function name; always [`ENTRY_POINT`].
    pub entry_point: String,
    pub origin: CandidateOrigin,
}

impl CandidateParser {
    /// Validate `source` and wrap it as a candidate.
    pub fn new(source: impl Into<String>, origin: CandidateOrigin) -> Result<Self, SynthesisError> {
        let source = source.into();
        check_entry_point(&source)?;
        Ok(Self {
            source,
            entry_point: ENTRY_POINT.to_string(),
            origin,
        })
    }

    /// Extract, clean and validate the code in a model response.
    pub fn from_response(response: &str, origin: CandidateOrigin) -> Result<Self, SynthesisError> {
        let code = extract_code_block(response).ok_or(SynthesisError::NoCodeBlock)?;
        Self::new(clean_source(&code), origin)
    }
}

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+.-]*)[^\n]*\n(.*?)```").unwrap());

static RE_ENTRY_POINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?m)^(?:async[ \t]+)?def[ \t]+{ENTRY_POINT}[ \t]*\(")).unwrap()
});

/// Return the code carried by a model response, if any.
pub fn extract_code_block(response: &str) -> Option<String> {
    let text = normalise_line_endings(response);
    let mut untagged: Option<String> = None;

    for caps in RE_FENCE.captures_iter(&text) {
        let lang = caps[1].to_ascii_lowercase();
        let body = caps[2].trim();
        if body.is_empty() {
            continue;
        }
        match lang.as_str() {
            "python" | "py" | "python3" => return Some(body.to_string()),
            "" if untagged.is_none() => untagged = Some(body.to_string()),
            _ => {}
        }
    }

    if untagged.is_some() {
        return untagged;
    }

    // No usable fence: accept a bare-code response, never prose.
    if !text.contains("```") && RE_ENTRY_POINT.is_match(&text) {
        return Some(text.trim().to_string());
    }

    None
}

/// Static well-formedness: non-empty and defines `def parse(` at top level.
pub fn check_entry_point(source: &str) -> Result<(), SynthesisError> {
    if source.trim().is_empty() {
        return Err(SynthesisError::NoCodeBlock);
    }
    if !RE_ENTRY_POINT.is_match(source) {
        return Err(SynthesisError::MissingEntryPoint {
            entry_point: ENTRY_POINT.to_string(),
        });
    }
    Ok(())
}

/// Normalise line endings, strip invisible characters, end with one newline.
pub fn clean_source(code: &str) -> String {
    let s = normalise_line_endings(code);
    let s = remove_invisible_chars(&s);
    format!("{}\n", s.trim_end())
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

/// Zero-width spaces, BOMs and soft hyphens break Python tokenisation.
fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARSER: &str = "import pandas as pd\n\ndef parse(pdf_path: str) -> pd.DataFrame:\n    return pd.DataFrame()";

    #[test]
    fn python_fence_wins_over_untagged() {
        let response = format!("Here:\n```\nnot this\n```\nand\n```python\n{PARSER}\n```\n");
        let code = extract_code_block(&response).unwrap();
        assert!(code.starts_with("import pandas"));
    }

    #[test]
    fn first_python_fence_is_used() {
        let response = format!("```python\n{PARSER}\n```\n```python\nprint('second')\n```");
        let code = extract_code_block(&response).unwrap();
        assert!(!code.contains("second"));
    }

    #[test]
    fn untagged_fence_is_accepted() {
        let response = format!("```\n{PARSER}\n```");
        assert!(extract_code_block(&response).is_some());
    }

    #[test]
    fn bare_code_is_accepted() {
        assert_eq!(extract_code_block(PARSER).as_deref(), Some(PARSER));
    }

    #[test]
    fn prose_only_has_no_code() {
        assert_eq!(extract_code_block("I cannot help with that."), None);
    }

    #[test]
    fn crlf_fences_are_handled() {
        let response = "```python\r\ndef parse(p):\r\n    return []\r\n```\r\n";
        let code = extract_code_block(response).unwrap();
        assert_eq!(code, "def parse(p):\n    return []");
    }

    #[test]
    fn missing_entry_point_is_rejected() {
        let err = CandidateParser::from_response("```python\ndef extract(p):\n    pass\n```", CandidateOrigin::Synthesized)
            .unwrap_err();
        assert_eq!(
            err,
            SynthesisError::MissingEntryPoint {
                entry_point: "parse".into()
            }
        );
    }

    #[test]
    fn nested_parse_method_does_not_count() {
        let src = "class P:\n    def parse(self, p):\n        pass\n";
        assert!(check_entry_point(src).is_err());
    }

    #[test]
    fn parse_prefix_names_do_not_count() {
        assert!(check_entry_point("def parse_rows(p):\n    pass\n").is_err());
    }

    #[test]
    fn invisible_chars_are_stripped() {
        let cleaned = clean_source("\u{FEFF}def parse(p):\u{200B}\n    return []\n\n\n");
        assert_eq!(cleaned, "def parse(p):\n    return []\n");
    }

    #[test]
    fn from_response_tags_origin() {
        let c = CandidateParser::from_response(PARSER, CandidateOrigin::Repaired).unwrap();
        assert_eq!(c.origin, CandidateOrigin::Repaired);
        assert_eq!(c.entry_point, "parse");
        assert!(c.source.ends_with('\n'));
    }
}
