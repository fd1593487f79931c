//! Persistent `[T, N]` array targets for the aggregator.
//!
//! The pipeline needs only `write_window` and `finish`. Reading back is
//! provided by [`ChunkedFile`] for verification and downstream tools.

mod chunked;
mod memory;

pub use chunked::ChunkedFile;
pub use memory::MemoryArray;

use ndarray::ArrayView2;
use thiserror::Error;

/// Errors from creating, writing, or reading an array.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(
        "window at [{row_offset}, {col_offset}] of size [{rows}, {cols}] \
         exceeds array shape [{shape_rows}, {shape_cols}]"
    )]
    OutOfBounds {
        row_offset: usize,
        col_offset: usize,
        rows: usize,
        cols: usize,
        shape_rows: usize,
        shape_cols: usize,
    },

    #[error("invalid array shape: {0}")]
    InvalidShape(&'static str),

    #[error("corrupt array file: {0}")]
    Corrupt(&'static str),

    #[error("array is already finished")]
    Finished,

    #[error("array file i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Fixed shape, chunk layout, and fill value of a persistent array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayShape {
    pub rows: usize,
    pub cols: usize,
    pub chunk_rows: usize,
    pub chunk_cols: usize,
    pub fill: i32,
}

impl ArrayShape {
    /// Validate dimensions and clamp chunk sizes to the array shape.
    pub fn new(
        rows: usize,
        cols: usize,
        chunk_rows: usize,
        chunk_cols: usize,
        fill: i32,
    ) -> Result<Self, StoreError> {
        if rows == 0 || cols == 0 {
            return Err(StoreError::InvalidShape("dimensions must be non-zero"));
        }
        if chunk_rows == 0 || chunk_cols == 0 {
            return Err(StoreError::InvalidShape("chunk dimensions must be non-zero"));
        }

        Ok(Self {
            rows,
            cols,
            chunk_rows: chunk_rows.min(rows),
            chunk_cols: chunk_cols.min(cols),
            fill,
        })
    }

    /// Number of chunks along each axis.
    pub fn chunk_grid(&self) -> (usize, usize) {
        (
            self.rows.div_ceil(self.chunk_rows),
            self.cols.div_ceil(self.chunk_cols),
        )
    }

    /// Reject a window that does not fit entirely inside the array.
    pub fn check_window(
        &self,
        row_offset: usize,
        col_offset: usize,
        rows: usize,
        cols: usize,
    ) -> Result<(), StoreError> {
        let row_end = row_offset.checked_add(rows);
        let col_end = col_offset.checked_add(cols);
        match (row_end, col_end) {
            (Some(r), Some(c)) if r <= self.rows && c <= self.cols => Ok(()),
            _ => Err(StoreError::OutOfBounds {
                row_offset,
                col_offset,
                rows,
                cols,
                shape_rows: self.rows,
                shape_cols: self.cols,
            }),
        }
    }
}

/// A fixed-shape 2-D array written in rectangular windows by one writer.
pub trait ArrayStore: Send {
    /// Shape the array was created with.
    fn shape(&self) -> ArrayShape;

    /// Write `window` with its top-left cell at `[row_offset, col_offset]`.
    fn write_window(
        &mut self,
        row_offset: usize,
        col_offset: usize,
        window: ArrayView2<'_, i32>,
    ) -> Result<(), StoreError>;

    /// Flush and close. Further writes fail with [`StoreError::Finished`].
    fn finish(&mut self) -> Result<(), StoreError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_clamps_chunks() {
        let shape = ArrayShape::new(24, 16, 8_760, 16, 0).unwrap();
        assert_eq!(shape.chunk_rows, 24);
        assert_eq!(shape.chunk_grid(), (1, 1));
    }

    #[test]
    fn test_chunk_grid_rounds_up() {
        let shape = ArrayShape::new(74_160, 25_600, 8_760, 16, 0).unwrap();
        assert_eq!(shape.chunk_grid(), (9, 1_600));
    }

    #[test]
    fn test_shape_rejects_zero() {
        assert!(ArrayShape::new(0, 1, 1, 1, 0).is_err());
        assert!(ArrayShape::new(1, 1, 0, 1, 0).is_err());
    }

    #[test]
    fn test_check_window() {
        let shape = ArrayShape::new(10, 20, 5, 4, 0).unwrap();
        assert!(shape.check_window(0, 0, 10, 20).is_ok());
        assert!(shape.check_window(0, 16, 10, 4).is_ok());
        assert!(matches!(
            shape.check_window(0, 17, 10, 4),
            Err(StoreError::OutOfBounds { col_offset: 17, .. })
        ));
        assert!(shape.check_window(usize::MAX, 0, 2, 1).is_err());
    }
}
