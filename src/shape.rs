//! Rectangular integer grids and the output obfuscation mask.
//!
//! Submitted programs print their grid with every cell XOR-masked so that
//! hardcoding the expected numbers is useless. The mask is an involution:
//! applying it twice restores the original cell.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// XOR key applied by the language templates to every printed cell.
pub const OBFUSCATION_KEY: i64 = 987_654_321;

/// Masks (or unmasks) a single cell value.
pub fn mask_cell(value: i64) -> i64 {
    value ^ OBFUSCATION_KEY
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("output contains no rows")]
    Empty,

    #[error("row {row} has {got} columns, expected {expected}")]
    Ragged {
        row: usize,
        got: usize,
        expected: usize,
    },

    #[error("row {row} contains non-numeric token {token:?}")]
    BadToken { row: usize, token: String },
}

/// A non-empty rectangular grid of cells.
///
/// Rectangularity is enforced at construction, so row and column counts
/// are always well defined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape {
    cells: Vec<Vec<i64>>,
}

impl Shape {
    /// Builds a shape from rows, rejecting empty and ragged input.
    pub fn from_rows(cells: Vec<Vec<i64>>) -> Result<Self, ShapeError> {
        if cells.is_empty() || cells[0].is_empty() {
            return Err(ShapeError::Empty);
        }
        let expected = cells[0].len();
        for (row, r) in cells.iter().enumerate() {
            if r.len() != expected {
                return Err(ShapeError::Ragged {
                    row,
                    got: r.len(),
                    expected,
                });
            }
        }
        Ok(Shape { cells })
    }

    /// Parses whitespace-separated cell values from program stdout.
    ///
    /// Blank lines (including the trailing newline) are skipped; rows are
    /// split on any run of spaces or tabs.
    pub fn parse_program_output(stdout: &str) -> Result<Self, ShapeError> {
        let mut cells = Vec::new();
        for line in stdout.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let row_idx = cells.len();
            let row = line
                .split_whitespace()
                .map(|token| {
                    token.parse::<i64>().map_err(|_| ShapeError::BadToken {
                        row: row_idx,
                        token: token.to_string(),
                    })
                })
                .collect::<Result<Vec<i64>, ShapeError>>()?;
            cells.push(row);
        }
        Shape::from_rows(cells)
    }

    /// Returns the same grid with the obfuscation mask applied to every cell.
    ///
    /// Used once on parsed program output to recover the real values.
    pub fn unmasked(&self) -> Shape {
        Shape {
            cells: self
                .cells
                .iter()
                .map(|row| row.iter().map(|&c| mask_cell(c)).collect())
                .collect(),
        }
    }

    pub fn rows(&self) -> usize {
        self.cells.len()
    }

    pub fn cols(&self) -> usize {
        self.cells[0].len()
    }

    pub fn cell(&self, row: usize, col: usize) -> i64 {
        self.cells[row][col]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(cells: &[&[i64]]) -> Shape {
        Shape::from_rows(cells.iter().map(|r| r.to_vec()).collect()).unwrap()
    }

    #[test]
    fn mask_is_an_involution() {
        for v in [0, 1, -1, 42, -987_654_321, i64::MAX, i64::MIN] {
            assert_eq!(mask_cell(mask_cell(v)), v);
        }
    }

    #[test]
    fn mask_changes_every_small_value() {
        for v in 0..64 {
            assert_ne!(mask_cell(v), v);
        }
    }

    #[test]
    fn parses_simple_grid() {
        let s = Shape::parse_program_output("1 2 3\n4 5 6\n").unwrap();
        assert_eq!(s.rows(), 2);
        assert_eq!(s.cols(), 3);
        assert_eq!(s.cell(1, 2), 6);
    }

    #[test]
    fn skips_blank_lines_and_collapses_whitespace() {
        let s = Shape::parse_program_output("\n  1\t 2  \n\n3 4\n\n").unwrap();
        assert_eq!(s, shape(&[&[1, 2], &[3, 4]]));
    }

    #[test]
    fn rejects_empty_output() {
        assert_eq!(Shape::parse_program_output("\n \n"), Err(ShapeError::Empty));
        assert_eq!(Shape::parse_program_output(""), Err(ShapeError::Empty));
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = Shape::parse_program_output("1 2\n3\n").unwrap_err();
        assert_eq!(
            err,
            ShapeError::Ragged {
                row: 1,
                got: 1,
                expected: 2
            }
        );
    }

    #[test]
    fn rejects_non_numeric_tokens() {
        let err = Shape::parse_program_output("1 x\n").unwrap_err();
        assert!(matches!(err, ShapeError::BadToken { row: 0, .. }));
    }

    #[test]
    fn decodes_masked_program_output() {
        let masked = format!(
            "{} {}\n{} {}\n",
            mask_cell(1),
            mask_cell(0),
            mask_cell(0),
            mask_cell(1)
        );
        let s = Shape::parse_program_output(&masked).unwrap().unmasked();
        assert_eq!(s, shape(&[&[1, 0], &[0, 1]]));
    }

    #[test]
    fn serializes_as_plain_matrix() {
        let s = shape(&[&[1, 2], &[3, 4]]);
        assert_eq!(serde_json::to_string(&s).unwrap(), "[[1,2],[3,4]]");
    }
}
