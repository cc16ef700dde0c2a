//! Table verification: compare a produced table against the reference.
//!
//! ## Matching rules
//!
//! - Column sets are compared order-insensitively and name-exactly. Names are
//!   case-sensitive; this is fixed, not configurable.
//! - Rows are order-sensitive (statements are chronological). A row-count
//!   mismatch is reported first, then cells are compared over the
//!   overlapping prefix of rows and the shared columns.
//! - Cells are trimmed and internal whitespace runs collapse to one space.
//!   When both sides look numeric they are compared by exact decimal value
//!   (`100.00 == 100`, `1,000 == 1000`); otherwise as exact strings.
//!
//! Nothing else is normalised: no currency symbols, date formats or
//! parenthesised negatives.

use crate::table::Table;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;

/// Produced and reference tables have different row counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCountMismatch {
    pub expected: usize,
    pub actual: usize,
}

impl RowCountMismatch {
    /// Reference rows the produced table lacks.
    pub fn missing_rows(&self) -> usize {
        self.expected.saturating_sub(self.actual)
    }

    /// Produced rows beyond the reference.
    pub fn extra_rows(&self) -> usize {
        self.actual.saturating_sub(self.expected)
    }
}

/// Column names present on only one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMismatch {
    /// In the reference but not produced.
    pub missing: Vec<String>,
    /// Produced but not in the reference.
    pub unexpected: Vec<String>,
}

/// One differing cell. `row` is 0-indexed over data rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellMismatch {
    pub row: usize,
    pub column: String,
    pub expected: String,
    pub actual: String,
}

/// Structured description of how a produced table differs from the reference.
///
/// An empty diff means the candidate is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationDiff {
    pub row_count: Option<RowCountMismatch>,
    pub columns: Option<ColumnMismatch>,
    pub cells: Vec<CellMismatch>,
}

impl VerificationDiff {
    pub fn is_empty(&self) -> bool {
        self.row_count.is_none() && self.columns.is_none() && self.cells.is_empty()
    }

    /// One-line summary for logs and progress output.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "tables match".to_string();
        }
        let mut parts = Vec::new();
        if let Some(rc) = &self.row_count {
            parts.push(format!("rows {} vs expected {}", rc.actual, rc.expected));
        }
        if let Some(cm) = &self.columns {
            parts.push(format!(
                "{} missing / {} unexpected columns",
                cm.missing.len(),
                cm.unexpected.len()
            ));
        }
        if !self.cells.is_empty() {
            parts.push(format!("{} mismatched cells", self.cells.len()));
        }
        parts.join(", ")
    }

    /// Multi-line rendering for a repair prompt, listing at most
    /// `max_cells` cell mismatches.
    pub fn render(&self, max_cells: usize) -> String {
        let mut out = String::new();
        if self.is_empty() {
            out.push_str("The produced table matches the reference.\n");
            return out;
        }

        if let Some(rc) = &self.row_count {
            let _ = writeln!(
                out,
                "ROW COUNT MISMATCH: produced {} rows, expected {}.",
                rc.actual, rc.expected
            );
            if rc.missing_rows() > 0 {
                let _ = writeln!(out, "  {} reference rows are missing.", rc.missing_rows());
            }
            if rc.extra_rows() > 0 {
                let _ = writeln!(out, "  {} extra rows were produced.", rc.extra_rows());
            }
        }

        if let Some(cm) = &self.columns {
            let _ = writeln!(out, "COLUMN MISMATCH (names are case-sensitive):");
            if !cm.missing.is_empty() {
                let _ = writeln!(out, "  missing:    {:?}", cm.missing);
            }
            if !cm.unexpected.is_empty() {
                let _ = writeln!(out, "  unexpected: {:?}", cm.unexpected);
            }
        }

        if !self.cells.is_empty() {
            let _ = writeln!(out, "CELL MISMATCHES ({} total):", self.cells.len());
            for m in self.cells.iter().take(max_cells) {
                let _ = writeln!(
                    out,
                    "  row {} column {:?}: expected {:?}, got {:?}",
                    m.row, m.column, m.expected, m.actual
                );
            }
            if self.cells.len() > max_cells {
                let _ = writeln!(out, "  ... and {} more", self.cells.len() - max_cells);
            }
        }
        out
    }
}

/// Compare `produced` against `reference`.
pub fn verify(produced: &Table, reference: &Table) -> VerificationDiff {
    let mut diff = VerificationDiff::default();

    let produced_cols: HashSet<&str> = produced.columns().iter().map(String::as_str).collect();
    let reference_cols: HashSet<&str> = reference.columns().iter().map(String::as_str).collect();

    let missing: Vec<String> = reference
        .columns()
        .iter()
        .filter(|c| !produced_cols.contains(c.as_str()))
        .cloned()
        .collect();
    let unexpected: Vec<String> = produced
        .columns()
        .iter()
        .filter(|c| !reference_cols.contains(c.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        diff.columns = Some(ColumnMismatch {
            missing,
            unexpected,
        });
    }

    if produced.row_count() != reference.row_count() {
        diff.row_count = Some(RowCountMismatch {
            expected: reference.row_count(),
            actual: produced.row_count(),
        });
    }

    // Shared columns in reference order, with their produced positions.
    let shared: Vec<(usize, usize, &str)> = reference
        .columns()
        .iter()
        .enumerate()
        .filter_map(|(ri, name)| produced.column_index(name).map(|pi| (ri, pi, name.as_str())))
        .collect();

    let overlap = produced.row_count().min(reference.row_count());
    for row in 0..overlap {
        let expected_row = &reference.rows()[row];
        let actual_row = &produced.rows()[row];
        for &(ri, pi, name) in &shared {
            let expected = &expected_row[ri];
            let actual = &actual_row[pi];
            if !cells_match(expected, actual) {
                diff.cells.push(CellMismatch {
                    row,
                    column: name.to_string(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
        }
    }

    diff
}

/// Equality after whitespace and numeric normalisation.
pub fn cells_match(expected: &str, actual: &str) -> bool {
    let e = normalize_whitespace(expected);
    let a = normalize_whitespace(actual);
    match (canonical_number(&e), canonical_number(&a)) {
        (Some(en), Some(an)) => en == an,
        _ => e == a,
    }
}

/// Trim and collapse internal whitespace runs to a single space.
pub fn normalize_whitespace(cell: &str) -> String {
    cell.split_whitespace().collect::<Vec<_>>().join(" ")
}

static RE_NUMERIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([+-]?)(\d{1,3}(?:,\d{3})+|\d+)?(?:\.(\d+))?$").unwrap()
});

/// Canonical decimal form of a numeric-looking cell, or `None`.
///
/// Accepts an optional sign, digits with optional well-formed `,` thousands
/// separators, and an optional fraction. Lakh grouping (`1,00,000`) is not
/// numeric and such cells compare as text. Leading integer zeros and trailing
/// fraction zeros are dropped and `-0` becomes `0`, so equal values map to
/// equal strings without going through floating point.
pub fn canonical_number(cell: &str) -> Option<String> {
    let caps = RE_NUMERIC.captures(cell)?;
    let int_part = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let frac_part = caps.get(3).map(|m| m.as_str()).unwrap_or("");
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    let int_digits: String = int_part.chars().filter(|c| *c != ',').collect();
    let int_trimmed = int_digits.trim_start_matches('0');
    let int_norm = if int_trimmed.is_empty() { "0" } else { int_trimmed };
    let frac_norm = frac_part.trim_end_matches('0');

    let magnitude = if frac_norm.is_empty() {
        int_norm.to_string()
    } else {
        format!("{int_norm}.{frac_norm}")
    };

    let negative = &caps[1] == "-" && magnitude != "0";
    Some(if negative {
        format!("-{magnitude}")
    } else {
        magnitude
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(columns: &[&str], rows: &[&[&str]]) -> Table {
        Table::new(
            columns.iter().map(|s| s.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
        )
        .unwrap()
    }

    fn statement() -> Table {
        table(
            &["Date", "Description", "Debit Amt", "Credit Amt", "Balance"],
            &[
                &["01-08-2024", "Salary Credit XYZ Pvt Ltd", "", "1935.3", "6864.58"],
                &["02-08-2024", "Salary Credit XYZ Pvt Ltd", "", "1652.61", "8517.19"],
                &["03-08-2024", "IMPS UPI Payment Amazon", "3886.08", "", "4631.11"],
            ],
        )
    }

    #[test]
    fn reference_against_itself_is_empty() {
        let t = statement();
        let diff = verify(&t, &t);
        assert!(diff.is_empty(), "{diff:?}");
    }

    #[test]
    fn single_changed_cell_yields_single_mismatch() {
        let reference = statement();
        let produced = reference.with_cell(1, "Balance", "8517.20").unwrap();
        let diff = verify(&produced, &reference);
        assert!(diff.row_count.is_none());
        assert!(diff.columns.is_none());
        assert_eq!(
            diff.cells,
            vec![CellMismatch {
                row: 1,
                column: "Balance".into(),
                expected: "8517.19".into(),
                actual: "8517.20".into(),
            }]
        );
    }

    #[test]
    fn trailing_zeros_match_numerically() {
        let reference = table(&["date", "amount"], &[&["2024-01-01", "100.00"]]);
        let produced = table(&["date", "amount"], &[&["2024-01-01", "100"]]);
        assert!(verify(&produced, &reference).is_empty());
    }

    #[test]
    fn zero_rows_reports_one_missing_row() {
        let reference = table(&["date", "amount"], &[&["2024-01-01", "100.00"]]);
        let produced = table(&["date", "amount"], &[]);
        let diff = verify(&produced, &reference);
        let rc = diff.row_count.clone().expect("row count mismatch");
        assert_eq!(rc.missing_rows(), 1);
        assert_eq!(rc.extra_rows(), 0);
        assert!(diff.cells.is_empty());
        assert!(!diff.is_empty());
    }

    #[test]
    fn column_order_is_ignored() {
        let reference = table(&["a", "b"], &[&["1", "2"]]);
        let produced = table(&["b", "a"], &[&["2", "1"]]);
        assert!(verify(&produced, &reference).is_empty());
    }

    #[test]
    fn column_names_are_case_sensitive() {
        let reference = table(&["Date"], &[&["x"]]);
        let produced = table(&["date"], &[&["x"]]);
        let diff = verify(&produced, &reference);
        let cm = diff.columns.expect("column mismatch");
        assert_eq!(cm.missing, vec!["Date".to_string()]);
        assert_eq!(cm.unexpected, vec!["date".to_string()]);
    }

    #[test]
    fn cells_compared_on_overlapping_prefix() {
        let reference = table(&["n"], &[&["1"], &["2"], &["3"]]);
        let produced = table(&["n"], &[&["1"], &["9"]]);
        let diff = verify(&produced, &reference);
        assert_eq!(diff.row_count.as_ref().map(|r| r.missing_rows()), Some(1));
        assert_eq!(diff.cells.len(), 1);
        assert_eq!(diff.cells[0].row, 1);
    }

    #[test]
    fn whitespace_is_normalised() {
        assert!(cells_match("  IMPS   UPI\tPayment ", "IMPS UPI Payment"));
        assert!(!cells_match("IMPS UPI", "IMPSUPI"));
    }

    #[test]
    fn numeric_canonical_forms() {
        assert_eq!(canonical_number("100.00").as_deref(), Some("100"));
        assert_eq!(canonical_number("1,234.50").as_deref(), Some("1234.5"));
        assert_eq!(canonical_number("-0.00").as_deref(), Some("0"));
        assert_eq!(canonical_number("+7").as_deref(), Some("7"));
        assert_eq!(canonical_number(".5").as_deref(), Some("0.5"));
        assert_eq!(canonical_number("007").as_deref(), Some("7"));
        assert_eq!(canonical_number("1,23"), None);
        assert_eq!(canonical_number(""), None);
        assert_eq!(canonical_number("-"), None);
        assert_eq!(canonical_number("₹100"), None);
        assert_eq!(canonical_number("01-08-2024"), None);
    }

    #[test]
    fn empty_vs_zero_is_a_mismatch() {
        assert!(!cells_match("", "0"));
        assert!(cells_match("", "   "));
    }

    #[test]
    fn thousands_separator_matches() {
        assert!(cells_match("1,000", "1000.0"));
        assert!(!cells_match("1,000", "100"));
    }

    #[test]
    fn lakh_grouping_is_compared_as_text() {
        assert_eq!(canonical_number("1,00,000.00"), None);
        assert!(!cells_match("1,00,000.00", "100000"));
        assert!(!cells_match("1,00,000.00", "1,00,000"));
        assert!(cells_match("1,00,000.00", "1,00,000.00"));
        assert_eq!(canonical_number("100,000.00").as_deref(), Some("100000"));
    }

    #[test]
    fn render_lists_cells_and_truncates() {
        let reference = table(&["n"], &[&["1"], &["2"], &["3"]]);
        let produced = table(&["n"], &[&["7"], &["8"], &["9"]]);
        let text = verify(&produced, &reference).render(2);
        assert!(text.contains("CELL MISMATCHES (3 total)"));
        assert!(text.contains("... and 1 more"));
    }
}
