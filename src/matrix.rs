//! Per-batch measurement matrix with bounds-checked access.

use ndarray::{Array2, ArrayView2};

/// Dense `[T, cols]` block of measurements for one batch.
///
/// Row-major, zero-filled, with the batch's first identifier as the
/// placement anchor. Built by one worker, consumed once by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchMatrix {
    anchor: u32,
    data: Array2<i32>,
}

impl BatchMatrix {
    /// A zero-filled matrix of `rows` time buckets by `cols` identifiers.
    pub fn zeros(anchor: u32, rows: usize, cols: usize) -> Self {
        Self {
            anchor,
            data: Array2::zeros((rows, cols)),
        }
    }

    /// Identifier of column 0.
    pub fn anchor(&self) -> u32 {
        self.anchor
    }

    /// Number of time buckets.
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    /// Number of identifier columns.
    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    /// Value at `[row, col]`, or `None` if out of bounds.
    pub fn get(&self, row: usize, col: usize) -> Option<i32> {
        self.data.get((row, col)).copied()
    }

    /// Store `value` at `[row, col]`. Returns false if out of bounds.
    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: i32) -> bool {
        match self.data.get_mut((row, col)) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    /// Read-only view for writing into the persistent array.
    pub fn view(&self) -> ArrayView2<'_, i32> {
        self.data.view()
    }

    /// Number of cells holding a non-zero value.
    pub fn populated(&self) -> usize {
        self.data.iter().filter(|v| **v != 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_shape() {
        let m = BatchMatrix::zeros(533_900_001, 24, 16);
        assert_eq!(m.anchor(), 533_900_001);
        assert_eq!(m.rows(), 24);
        assert_eq!(m.cols(), 16);
        assert_eq!(m.populated(), 0);
        assert_eq!(m.get(23, 15), Some(0));
    }

    #[test]
    fn test_set_and_get() {
        let mut m = BatchMatrix::zeros(1, 4, 3);
        assert!(m.set(2, 1, 77));
        assert_eq!(m.get(2, 1), Some(77));
        assert_eq!(m.view()[[2, 1]], 77);
        assert_eq!(m.populated(), 1);
    }

    #[test]
    fn test_out_of_bounds_is_rejected() {
        let mut m = BatchMatrix::zeros(1, 4, 3);
        assert!(!m.set(4, 0, 1));
        assert!(!m.set(0, 3, 1));
        assert_eq!(m.get(4, 0), None);
        assert_eq!(m.populated(), 0);
    }
}
