//! Cell-by-cell similarity between a target shape and program output.

use thiserror::Error;

use crate::shape::Shape;

/// Score awarded for an exact reproduction of the target.
pub const PERFECT_SCORE: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("output is {got_rows}x{got_cols}, target is {want_rows}x{want_cols}")]
    DimensionMismatch {
        got_rows: usize,
        got_cols: usize,
        want_rows: usize,
        want_cols: usize,
    },
}

/// Checks that the output grid has exactly the target's dimensions.
pub fn validate(target: &Shape, output: &Shape) -> bool {
    target.rows() == output.rows() && target.cols() == output.cols()
}

/// Percentage of cells equal to the target, rounded to two decimals.
///
/// Only defined for equal dimensions. A full match is exactly
/// [`PERFECT_SCORE`]; partial matches never round up to it because the
/// last differing cell keeps the ratio strictly below 1.
pub fn similarity(target: &Shape, output: &Shape) -> Result<f64, ScoreError> {
    if !validate(target, output) {
        return Err(ScoreError::DimensionMismatch {
            got_rows: output.rows(),
            got_cols: output.cols(),
            want_rows: target.rows(),
            want_cols: target.cols(),
        });
    }

    let total = target.rows() * target.cols();
    let mut matched = 0usize;
    for row in 0..target.rows() {
        for col in 0..target.cols() {
            if target.cell(row, col) == output.cell(row, col) {
                matched += 1;
            }
        }
    }

    let raw = matched as f64 / total as f64 * 100.0;
    Ok((raw * 100.0).round() / 100.0)
}

/// True when a similarity value means the challenge is solved.
pub fn is_perfect(score: f64) -> bool {
    score >= PERFECT_SCORE
}
