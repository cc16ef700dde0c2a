//! The table model shared by the reference CSV and candidate output.
//!
//! A [`Table`] is a header of column names plus ordered rows of string
//! cells. Construction always goes through [`Table::new`], so a `Table`
//! value is table-shaped by construction: non-empty unique column names and
//! every row exactly as wide as the header.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Why a set of columns and rows is not a valid table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableShapeError {
    #[error("table has no header row")]
    NoColumns,

    #[error("column {position} has an empty name")]
    EmptyColumnName { position: usize },

    #[error("column '{name}' appears more than once")]
    DuplicateColumn { name: String },

    #[error("row {row} has {found} cells but the header has {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("CSV could not be read: {0}")]
    Csv(String),
}

/// Ordered rows of named string columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Build a table, validating its shape.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, TableShapeError> {
        if columns.is_empty() {
            return Err(TableShapeError::NoColumns);
        }

        let mut seen = HashSet::with_capacity(columns.len());
        for (position, name) in columns.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(TableShapeError::EmptyColumnName { position });
            }
            if !seen.insert(name.as_str()) {
                return Err(TableShapeError::DuplicateColumn { name: name.clone() });
            }
        }

        for (row, cells) in rows.iter().enumerate() {
            if cells.len() != columns.len() {
                return Err(TableShapeError::RaggedRow {
                    row,
                    expected: columns.len(),
                    found: cells.len(),
                });
            }
        }

        Ok(Self { columns, rows })
    }

    /// Parse CSV text; the first record is the header. Cells are trimmed.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, TableShapeError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut records = rdr.records();
        let columns: Vec<String> = match records.next() {
            Some(header) => header
                .map_err(|e| TableShapeError::Csv(e.to_string()))?
                .iter()
                .map(str::to_string)
                .collect(),
            None => return Err(TableShapeError::NoColumns),
        };

        let rows = records
            .map(|rec| {
                rec.map(|r| r.iter().map(str::to_string).collect::<Vec<_>>())
                    .map_err(|e| TableShapeError::Csv(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(columns, rows)
    }

    /// Read and parse a CSV file.
    pub fn from_csv_path(path: &Path) -> Result<Self, TableShapeError> {
        let file = std::fs::File::open(path).map_err(|e| TableShapeError::Csv(e.to_string()))?;
        Self::from_csv_reader(file)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by exact (case-sensitive) name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell at `row` under column `name`.
    pub fn cell(&self, row: usize, name: &str) -> Option<&str> {
        let col = self.column_index(name)?;
        self.rows.get(row).map(|r| r[col].as_str())
    }

    /// Return a copy with one cell replaced. `None` if out of range.
    pub fn with_cell(&self, row: usize, name: &str, value: impl Into<String>) -> Option<Self> {
        let col = self.column_index(name)?;
        let mut copy = self.clone();
        *copy.rows.get_mut(row)?.get_mut(col)? = value.into();
        Some(copy)
    }

    /// Render the header and the first `limit` rows as CSV text, for prompts.
    pub fn preview_csv(&self, limit: usize) -> String {
        let mut wtr = csv::WriterBuilder::new().from_writer(Vec::new());
        // Writing into a Vec cannot fail; a record error would only come
        // from mismatched widths, which `Table::new` already rules out.
        let _ = wtr.write_record(&self.columns);
        for row in self.rows.iter().take(limit) {
            let _ = wtr.write_record(row);
        }
        match wtr.into_inner() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn csv_header_becomes_columns() {
        let t = Table::from_csv_reader("date,amount\n2024-01-01, 100.00 \n".as_bytes()).unwrap();
        assert_eq!(t.columns(), &["date", "amount"]);
        assert_eq!(t.row_count(), 1);
        assert_eq!(t.cell(0, "amount"), Some("100.00"));
    }

    #[test]
    fn csv_quoted_commas_stay_in_cell() {
        let t = Table::from_csv_reader("desc,amount\n\"Rent, March\",\"1,200.00\"\n".as_bytes())
            .unwrap();
        assert_eq!(t.cell(0, "desc"), Some("Rent, March"));
        assert_eq!(t.cell(0, "amount"), Some("1,200.00"));
    }

    #[test]
    fn ragged_csv_is_rejected() {
        let err = Table::from_csv_reader("a,b\n1,2\n3\n".as_bytes()).unwrap_err();
        assert_eq!(
            err,
            TableShapeError::RaggedRow {
                row: 1,
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn empty_csv_has_no_columns() {
        assert_eq!(
            Table::from_csv_reader("".as_bytes()).unwrap_err(),
            TableShapeError::NoColumns
        );
    }

    #[test]
    fn duplicate_and_empty_names_rejected() {
        assert!(matches!(
            Table::new(cols(&["a", "a"]), vec![]),
            Err(TableShapeError::DuplicateColumn { .. })
        ));
        assert!(matches!(
            Table::new(cols(&["a", " "]), vec![]),
            Err(TableShapeError::EmptyColumnName { position: 1 })
        ));
    }

    #[test]
    fn with_cell_changes_exactly_one_cell() {
        let t = Table::new(cols(&["a", "b"]), vec![cols(&["1", "2"])]).unwrap();
        let changed = t.with_cell(0, "b", "3").unwrap();
        assert_eq!(changed.cell(0, "a"), Some("1"));
        assert_eq!(changed.cell(0, "b"), Some("3"));
        assert!(t.with_cell(5, "b", "3").is_none());
    }

    #[test]
    fn preview_is_limited() {
        let t = Table::new(
            cols(&["n"]),
            (0..10).map(|i| vec![i.to_string()]).collect(),
        )
        .unwrap();
        let preview = t.preview_csv(2);
        assert_eq!(preview, "n\n0\n1\n");
    }
}
