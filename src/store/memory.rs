use ndarray::{s, Array2, ArrayView2};

use super::{ArrayShape, ArrayStore, StoreError};

/// In-memory array target, used by tests and dry runs.
#[derive(Debug)]
pub struct MemoryArray {
    shape: ArrayShape,
    data: Array2<i32>,
    writes: usize,
    finished: bool,
}

impl MemoryArray {
    /// Allocate a fill-valued array of the given shape.
    pub fn new(shape: ArrayShape) -> Self {
        Self {
            shape,
            data: Array2::from_elem((shape.rows, shape.cols), shape.fill),
            writes: 0,
            finished: false,
        }
    }

    /// Current contents.
    pub fn data(&self) -> &Array2<i32> {
        &self.data
    }

    /// Number of successful `write_window` calls.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Whether `finish` has been called.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl ArrayStore for MemoryArray {
    fn shape(&self) -> ArrayShape {
        self.shape
    }

    fn write_window(
        &mut self,
        row_offset: usize,
        col_offset: usize,
        window: ArrayView2<'_, i32>,
    ) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::Finished);
        }
        let (rows, cols) = window.dim();
        self.shape.check_window(row_offset, col_offset, rows, cols)?;

        self.data
            .slice_mut(s![row_offset..row_offset + rows, col_offset..col_offset + cols])
            .assign(&window);
        self.writes += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StoreError> {
        self.finished = true;
        Ok(())
    }
}
