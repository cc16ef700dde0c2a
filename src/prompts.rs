//! Prompts for parser synthesis and repair.
//!
//! Every prompt the loop sends is built here so the wording can be changed
//! and tested without touching retry or sandbox logic. Callers can replace
//! the system prompt via [`crate::config::AgentConfig::system_prompt`].

use crate::output::AttemptOutcome;
use crate::pipeline::code::ENTRY_POINT;
use crate::pipeline::sandbox::ExecutionResult;

/// Default system prompt for writing a bank-statement parser.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert Python engineer. Your sole task is to write a standalone, production-quality parser module for one family of bank statement PDFs.

Follow these rules precisely:

1. CONTRACT
   - The module must define a top-level function `parse(pdf_path: str) -> pandas.DataFrame`
   - The returned DataFrame must match the sample table EXACTLY: same column names, same number of rows, same cell values

2. COVERAGE
   - Iterate over ALL pages of the PDF; transactions continue across page breaks
   - Skip repeated page headers, footers, and opening/closing balance lines unless the sample table contains them

3. CELL VALUES
   - Convert column headers to strings and strip them (`str(col).strip()`)
   - Strip whitespace from every cell; remove currency symbols
   - Keep dates in the exact format used by the sample table
   - Leave empty cells as empty strings, not NaN or None

4. DEBIT / CREDIT
   - A transaction has a value in the Debit column OR the Credit column, never both
   - When one is set, the other must be an empty string

5. DEPENDENCIES
   - Use only the standard library, `pandas`, `pdfplumber` and `camelot-py`
   - Do not access the network and do not write files

6. FAILURE
   - If the PDF cannot be parsed, return an empty DataFrame with the sample table's column names

7. OUTPUT FORMAT
   - Reply with the complete module in a single ```python fenced block
   - No placeholders, no explanations outside the block"#;

/// Marker used when the sample PDF has no extractable text.
pub const NO_TEXT_MARKER: &str = "[No extractable text detected.]";

/// Hint added when the produced table has the wrong number of rows.
pub const HINT_ALL_PAGES: &str = "The row count is wrong, which usually means rows were missed or \
duplicated. Your logic MUST iterate through every page of the document and keep transactions \
that continue across page breaks.";

/// Hint added when Debit/Credit cells are wrong.
pub const HINT_DEBIT_CREDIT: &str = "A transaction has a value in the Debit column OR the Credit \
column, never both. When one is set the other must be an empty string.";

/// Hint added when the column set is wrong.
pub const HINT_COLUMNS: &str = "Use exactly the column names of the sample table, spelled and \
capitalised the same way.";

/// Hint added after a timeout.
pub const HINT_TIMEOUT: &str = "Avoid per-character loops and repeated full-document scans; open \
the PDF once and walk its pages.";

/// What the model is shown about the sample.
#[derive(Debug, Clone, Copy)]
pub struct SampleContext<'a> {
    pub target: &'a str,
    /// Text of the first pages, or `None` when extraction failed or was empty.
    pub document_text: Option<&'a str>,
    /// Why text is missing, when it is.
    pub text_note: Option<&'a str>,
    pub page_count: Option<usize>,
    /// First rows of the reference table as CSV.
    pub reference_preview: &'a str,
    pub columns: &'a [String],
    pub reference_rows: usize,
    pub images_attached: usize,
}

fn sample_section(ctx: &SampleContext<'_>) -> String {
    let text = match ctx.document_text {
        Some(t) => t.to_string(),
        None => match ctx.text_note {
            Some(note) => format!("{NO_TEXT_MARKER} ({note})"),
            None => NO_TEXT_MARKER.to_string(),
        },
    };
    let pages = ctx
        .page_count
        .map(|n| format!("The statement has {n} page(s).\n"))
        .unwrap_or_default();
    let images = if ctx.images_attached > 0 {
        format!(
            "Images of the first {} page(s) are attached.\n",
            ctx.images_attached
        )
    } else {
        String::new()
    };

    format!(
        "**Statement family:** {target}\n\
         {pages}{images}\n\
         **Text from the first pages of the sample PDF:**\n```text\n{text}\n```\n\n\
         **Expected table preview (CSV):**\n```csv\n{preview}```\n\n\
         The full expected table has {rows} row(s) and exactly these columns: {columns}\n",
        target = ctx.target,
        preview = ctx.reference_preview,
        rows = ctx.reference_rows,
        columns = quoted_list(ctx.columns),
    )
}

/// Prompt for the first attempt.
pub fn initial_prompt(ctx: &SampleContext<'_>) -> String {
    format!(
        "{}\nWrite the complete Python module for `{}_parser.py`. It must define `{}(pdf_path)`.\n",
        sample_section(ctx),
        ctx.target,
        ENTRY_POINT
    )
}

/// Prompt for a repair attempt.
///
/// Carries the previous code, the failure description and any targeted
/// hints; only the most recent candidate is included.
pub fn repair_prompt(
    ctx: &SampleContext<'_>,
    previous_source: &str,
    feedback: &str,
    hints: &[&str],
) -> String {
    let mut out = String::from(
        "The following parser failed its test against the sample. Make a targeted correction: \
         keep the parts of the previous code that work and change only what the failure \
         feedback implicates. Do not start over from scratch.\n\n",
    );
    out.push_str(&format!("**Failure feedback:**\n```\n{feedback}\n```\n\n"));
    for hint in hints {
        out.push_str(&format!("**Hint:** {hint}\n"));
    }
    if !hints.is_empty() {
        out.push('\n');
    }
    out.push_str(&format!(
        "**Previous code:**\n```python\n{}\n```\n\n",
        previous_source.trim_end()
    ));
    out.push_str(&sample_section(ctx));
    out.push_str(
        "\nReply with the corrected code as the complete module, unchanged parts included, \
         in a single ```python block.\n",
    );
    out
}

/// Extra paragraph when the previous response could not be used at all.
pub fn unusable_response_note(reason: &str) -> String {
    format!(
        "Your previous reply could not be used ({reason}). Reply with the complete module in a \
         single ```python fenced block that defines a top-level `def {ENTRY_POINT}(pdf_path)`.\n\n"
    )
}

/// Targeted hints for a failed attempt.
pub fn repair_hints(outcome: &AttemptOutcome) -> Vec<&'static str> {
    let mut hints = Vec::new();
    match outcome {
        AttemptOutcome::Mismatch { diff } => {
            if diff.row_count.is_some() {
                hints.push(HINT_ALL_PAGES);
            }
            if diff.columns.is_some() {
                hints.push(HINT_COLUMNS);
            }
            let touches_debit_credit = diff.cells.iter().any(|c| {
                let col = c.column.to_ascii_lowercase();
                col.contains("debit") || col.contains("credit")
            });
            if touches_debit_credit {
                hints.push(HINT_DEBIT_CREDIT);
            }
        }
        AttemptOutcome::ExecutionFailed {
            result: ExecutionResult::TimeoutFailure { .. },
        } => hints.push(HINT_TIMEOUT),
        _ => {}
    }
    hints
}

fn quoted_list(items: &[String]) -> String {
    items
        .iter()
        .map(|s| format!("\"{s}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::verify::{CellMismatch, RowCountMismatch, VerificationDiff};

    fn ctx<'a>(columns: &'a [String], text: Option<&'a str>) -> SampleContext<'a> {
        SampleContext {
            target: "icici",
            document_text: text,
            text_note: None,
            page_count: Some(3),
            reference_preview: "Date,Amount\n01-08-2024,100.00\n",
            columns,
            reference_rows: 100,
            images_attached: 0,
        }
    }

    #[test]
    fn system_prompt_states_contract() {
        assert!(DEFAULT_SYSTEM_PROMPT.contains("parse(pdf_path: str) -> pandas.DataFrame"));
        assert!(DEFAULT_SYSTEM_PROMPT.contains("ALL pages"));
    }

    #[test]
    fn initial_prompt_has_text_preview_and_columns() {
        let cols = vec!["Date".to_string(), "Amount".to_string()];
        let p = initial_prompt(&ctx(&cols, Some("Statement of account")));
        assert!(p.contains("Statement of account"));
        assert!(p.contains("01-08-2024,100.00"));
        assert!(p.contains("\"Date\", \"Amount\""));
        assert!(p.contains("100 row(s)"));
        assert!(p.contains("icici_parser.py"));
    }

    #[test]
    fn missing_text_uses_marker() {
        let cols = vec!["Date".to_string()];
        let p = initial_prompt(&ctx(&cols, None));
        assert!(p.contains(NO_TEXT_MARKER));
    }

    #[test]
    fn repair_prompt_carries_code_feedback_and_hints() {
        let cols = vec!["Date".to_string()];
        let p = repair_prompt(
            &ctx(&cols, Some("t")),
            "def parse(p):\n    return None\n",
            "KeyError: 'Date'",
            &[HINT_ALL_PAGES],
        );
        assert!(p.contains("def parse(p):"));
        assert!(p.contains("KeyError: 'Date'"));
        assert!(p.contains("**Hint:**"));
        assert!(p.contains("change only what the failure"));
    }

    #[test]
    fn repair_prompt_asks_for_a_targeted_fix() {
        let cols = vec!["Date".to_string()];
        let p = repair_prompt(&ctx(&cols, None), "def parse(p):\n    return []\n", "boom", &[]);
        assert!(p.contains("targeted correction"), "{p}");
        assert!(p.contains("keep the parts of the previous code that work"), "{p}");
        assert!(!p.contains("rewrite the entire module"), "{p}");
        assert!(p.contains("complete module"), "{p}");
        assert!(p.contains("```python block"), "{p}");
    }

    #[test]
    fn row_and_debit_mismatch_get_both_hints() {
        let outcome = AttemptOutcome::Mismatch {
            diff: VerificationDiff {
                row_count: Some(RowCountMismatch {
                    expected: 100,
                    actual: 50,
                }),
                columns: None,
                cells: vec![CellMismatch {
                    row: 0,
                    column: "Debit Amt".into(),
                    expected: "".into(),
                    actual: "10".into(),
                }],
            },
        };
        assert_eq!(repair_hints(&outcome), vec![HINT_ALL_PAGES, HINT_DEBIT_CREDIT]);
    }

    #[test]
    fn timeout_gets_performance_hint() {
        let outcome = AttemptOutcome::ExecutionFailed {
            result: ExecutionResult::TimeoutFailure { after_secs: 60 },
        };
        assert_eq!(repair_hints(&outcome), vec![HINT_TIMEOUT]);
    }
}
