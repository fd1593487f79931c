use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2};

use super::{ArrayShape, ArrayStore, StoreError};

const MAGIC: [u8; 4] = *b"MPCA";
const FORMAT_VERSION: u32 = 1;
/// magic(4) version(4) rows(8) cols(8) chunk_rows(4) chunk_cols(4) fill(4) reserved(4)
const HEADER_SIZE: usize = 40;

/// Single-file chunked `i32` array.
///
/// Layout (little-endian):
///
/// ```text
/// header | column identifiers: u32 * cols | chunk presence: u8 * chunks | pad to 8
///        | chunk data: chunks in row-major grid order, each chunk_rows * chunk_cols i32
/// ```
///
/// Edge chunks are stored at full size. Chunks never written read back as
/// the fill value, so the file is created sparse and only touched chunks
/// occupy disk.
pub struct ChunkedFile {
    path: PathBuf,
    file: File,
    shape: ArrayShape,
    ids: Vec<u32>,
    present: Vec<bool>,
    presence_offset: u64,
    data_offset: u64,
    chunk: Vec<i32>,
    bytes: Vec<u8>,
    finished: bool,
}

impl std::fmt::Debug for ChunkedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedFile")
            .field("path", &self.path)
            .field("shape", &self.shape)
            .finish()
    }
}

impl ChunkedFile {
    /// Create (or truncate) an array file of `shape` whose columns are
    /// labelled by `ids`.
    pub fn create(path: &Path, shape: ArrayShape, ids: &[u32]) -> Result<Self, StoreError> {
        if ids.len() != shape.cols {
            return Err(StoreError::InvalidShape(
                "identifier count must equal column count",
            ));
        }

        let layout =
            Layout::of(&shape).ok_or(StoreError::InvalidShape("array too large to address"))?;

        let mut meta = Vec::with_capacity(layout.data_offset as usize);
        meta.extend_from_slice(&MAGIC);
        meta.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        meta.extend_from_slice(&(shape.rows as u64).to_le_bytes());
        meta.extend_from_slice(&(shape.cols as u64).to_le_bytes());
        meta.extend_from_slice(&(shape.chunk_rows as u32).to_le_bytes());
        meta.extend_from_slice(&(shape.chunk_cols as u32).to_le_bytes());
        meta.extend_from_slice(&shape.fill.to_le_bytes());
        meta.extend_from_slice(&0u32.to_le_bytes());
        for id in ids {
            meta.extend_from_slice(&id.to_le_bytes());
        }
        meta.resize(layout.data_offset as usize, 0);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&meta)?;
        file.set_len(layout.file_len)?;

        Ok(Self::assemble(
            path,
            file,
            shape,
            ids.to_vec(),
            vec![false; layout.chunks],
            &layout,
        ))
    }

    /// Open an existing array file for reading and further writes.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)
            .map_err(|_| StoreError::Corrupt("truncated header"))?;
        if header[0..4] != MAGIC {
            return Err(StoreError::Corrupt("bad magic"));
        }
        if read_u32_le(&header, 4) != FORMAT_VERSION {
            return Err(StoreError::Corrupt("unsupported version"));
        }

        let dimension = |offset| {
            usize::try_from(read_u64_le(&header, offset))
                .map_err(|_| StoreError::Corrupt("invalid dimensions"))
        };
        let shape = ArrayShape::new(
            dimension(8)?,
            dimension(16)?,
            read_u32_le(&header, 24) as usize,
            read_u32_le(&header, 28) as usize,
            read_u32_le(&header, 32) as i32,
        )
        .map_err(|_| StoreError::Corrupt("invalid shape"))?;

        // Sizes below come from the header, so every one is checked before
        // it drives an allocation.
        let layout = Layout::of(&shape).ok_or(StoreError::Corrupt("invalid dimensions"))?;
        if file.metadata()?.len() < layout.file_len {
            return Err(StoreError::Corrupt("file shorter than its shape"));
        }

        let mut raw = vec![0u8; (layout.data_offset - HEADER_SIZE as u64) as usize];
        file.read_exact(&mut raw)?;
        let ids = raw[..shape.cols * 4]
            .chunks_exact(4)
            .map(|b| read_u32_le(b, 0))
            .collect();
        let present = raw[shape.cols * 4..][..layout.chunks]
            .iter()
            .map(|b| *b != 0)
            .collect();

        Ok(Self::assemble(path, file, shape, ids, present, &layout))
    }

    fn assemble(
        path: &Path,
        file: File,
        shape: ArrayShape,
        ids: Vec<u32>,
        present: Vec<bool>,
        layout: &Layout,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            shape,
            ids,
            present,
            presence_offset: layout.presence_offset,
            data_offset: layout.data_offset,
            chunk: vec![shape.fill; layout.chunk_len],
            bytes: vec![0u8; layout.chunk_len * 4],
            finished: false,
        }
    }

    /// Identifier labelling each column.
    pub fn identifiers(&self) -> &[u32] {
        &self.ids
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of chunks that have been written at least once.
    pub fn chunks_written(&self) -> usize {
        self.present.iter().filter(|p| **p).count()
    }

    /// Read a `[rows, cols]` window starting at `[row_offset, col_offset]`.
    pub fn read_window(
        &mut self,
        row_offset: usize,
        col_offset: usize,
        rows: usize,
        cols: usize,
    ) -> Result<Array2<i32>, StoreError> {
        self.shape.check_window(row_offset, col_offset, rows, cols)?;
        let mut out = Array2::from_elem((rows, cols), self.shape.fill);
        if rows == 0 || cols == 0 {
            return Ok(out);
        }

        for span in self.spans(row_offset, col_offset, rows, cols) {
            if !self.present[span.index] {
                continue;
            }
            self.read_chunk(span.index)?;
            for r in span.rows.0..span.rows.1 {
                for c in span.cols.0..span.cols.1 {
                    out[[r - row_offset, c - col_offset]] = self.chunk[self.cell(&span, r, c)];
                }
            }
        }

        Ok(out)
    }

    /// Chunks intersecting a window, with the intersection in array coordinates.
    fn spans(
        &self,
        row_offset: usize,
        col_offset: usize,
        rows: usize,
        cols: usize,
    ) -> Vec<ChunkSpan> {
        let (cr, cc) = (self.shape.chunk_rows, self.shape.chunk_cols);
        let (_, grid_cols) = self.shape.chunk_grid();
        let (row_end, col_end) = (row_offset + rows, col_offset + cols);

        let mut spans = Vec::new();
        for ci in row_offset / cr..=(row_end - 1) / cr {
            for cj in col_offset / cc..=(col_end - 1) / cc {
                let origin = (ci * cr, cj * cc);
                let valid_end = (
                    (origin.0 + cr).min(self.shape.rows),
                    (origin.1 + cc).min(self.shape.cols),
                );
                let r = (row_offset.max(origin.0), row_end.min(valid_end.0));
                let c = (col_offset.max(origin.1), col_end.min(valid_end.1));
                spans.push(ChunkSpan {
                    index: ci * grid_cols + cj,
                    origin,
                    rows: r,
                    cols: c,
                    covers: r == (origin.0, valid_end.0) && c == (origin.1, valid_end.1),
                });
            }
        }
        spans
    }

    #[inline]
    fn cell(&self, span: &ChunkSpan, row: usize, col: usize) -> usize {
        (row - span.origin.0) * self.shape.chunk_cols + (col - span.origin.1)
    }

    fn chunk_offset(&self, index: usize) -> u64 {
        self.data_offset + (index * self.chunk.len() * 4) as u64
    }

    fn read_chunk(&mut self, index: usize) -> Result<(), StoreError> {
        self.file.seek(SeekFrom::Start(self.chunk_offset(index)))?;
        self.file.read_exact(&mut self.bytes)?;
        for (dst, src) in self.chunk.iter_mut().zip(self.bytes.chunks_exact(4)) {
            *dst = read_u32_le(src, 0) as i32;
        }
        Ok(())
    }

    fn write_chunk(&mut self, index: usize) -> Result<(), StoreError> {
        for (dst, src) in self.bytes.chunks_exact_mut(4).zip(self.chunk.iter()) {
            dst.copy_from_slice(&src.to_le_bytes());
        }
        self.file.seek(SeekFrom::Start(self.chunk_offset(index)))?;
        self.file.write_all(&self.bytes)?;

        if !self.present[index] {
            self.file
                .seek(SeekFrom::Start(self.presence_offset + index as u64))?;
            self.file.write_all(&[1])?;
            self.present[index] = true;
        }
        Ok(())
    }
}

impl ArrayStore for ChunkedFile {
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
        if rows == 0 || cols == 0 {
            return Ok(());
        }

        for span in self.spans(row_offset, col_offset, rows, cols) {
            // Partially covered chunks keep the cells outside the window.
            if !span.covers && self.present[span.index] {
                self.read_chunk(span.index)?;
            } else {
                self.chunk.fill(self.shape.fill);
            }

            for r in span.rows.0..span.rows.1 {
                for c in span.cols.0..span.cols.1 {
                    let cell = self.cell(&span, r, c);
                    self.chunk[cell] = window[[r - row_offset, c - col_offset]];
                }
            }

            self.write_chunk(span.index)?;
        }

        Ok(())
    }

    fn finish(&mut self) -> Result<(), StoreError> {
        if self.finished {
            return Ok(());
        }
        self.file.flush()?;
        self.file.sync_all()?;
        self.finished = true;
        Ok(())
    }
}

struct ChunkSpan {
    index: usize,
    origin: (usize, usize),
    rows: (usize, usize),
    cols: (usize, usize),
    covers: bool,
}

/// Byte layout of a file holding `shape`.
struct Layout {
    chunks: usize,
    chunk_len: usize,
    presence_offset: u64,
    data_offset: u64,
    file_len: u64,
}

impl Layout {
    /// `None` when any region size overflows.
    fn of(shape: &ArrayShape) -> Option<Self> {
        let (grid_rows, grid_cols) = shape.chunk_grid();
        let chunks = grid_rows.checked_mul(grid_cols)?;
        let chunk_len = shape.chunk_rows.checked_mul(shape.chunk_cols)?;
        let chunk_bytes = chunk_len.checked_mul(4)?;

        let id_bytes = shape.cols.checked_mul(4)?;
        let presence_offset = u64::try_from(id_bytes.checked_add(HEADER_SIZE)?).ok()?;
        let presence_end = presence_offset.checked_add(u64::try_from(chunks).ok()?)?;
        let data_offset = presence_end.checked_add(7)? / 8 * 8;
        let data_len = u64::try_from(chunks)
            .ok()?
            .checked_mul(u64::try_from(chunk_bytes).ok()?)?;

        Some(Self {
            chunks,
            chunk_len,
            presence_offset,
            data_offset,
            file_len: data_offset.checked_add(data_len)?,
        })
    }
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(buf)
}
