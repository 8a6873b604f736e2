//! Buffered typed reads from a column data file. Hides seek/EOF/short-read
//! handling and records every page range touched with the file manager.

use std::path::Path;
use std::sync::Arc;

use crate::errors::{PartError, PartResult};
use crate::file_manager::{FileManager, ManagedFile};

/// Upper bound on bytes held by one scan call.
pub const SCAN_BUF_BYTES: usize = 1 << 20;

pub struct ScanReader {
    file: Arc<ManagedFile>,
    fm: Arc<FileManager>,
    elem: usize,
    buf: Vec<u8>,
    buf_start: usize,
    buf_rows: usize,
}

impl ScanReader {
    pub fn open(fm: &Arc<FileManager>, path: &Path, elem: usize) -> PartResult<ScanReader> {
        assert!(elem > 0);
        let file = fm.open(path)?;
        file.begin_use();
        Ok(ScanReader {
            file,
            fm: fm.clone(),
            elem,
            buf: Vec::new(),
            buf_start: 0,
            buf_rows: 0,
        })
    }

    pub fn elem_size(&self) -> usize {
        self.elem
    }

    /// Number of rows one buffer fill can hold.
    pub fn capacity_rows(&self) -> usize {
        (SCAN_BUF_BYTES / self.elem).max(1)
    }

    pub fn num_rows(&self) -> PartResult<usize> {
        Ok((self.file.len()? / self.elem as u64) as usize)
    }

    /// Reads rows `[start, start + n)` into the internal buffer and returns
    /// the raw bytes. `n` must not exceed `capacity_rows`.
    pub fn fill(&mut self, start: usize, n: usize) -> PartResult<&[u8]> {
        debug_assert!(n <= self.capacity_rows());
        let bytes = n * self.elem;
        let offset = (start * self.elem) as u64;
        self.buf.resize(bytes, 0);
        let read = self.file.read_at(offset, &mut self.buf)?;
        if read < bytes {
            self.buf_rows = 0;
            return Err(PartError::BadFileSize {
                path: self.file.path().to_path_buf(),
                size: offset + read as u64,
                expected: offset + bytes as u64,
            });
        }
        self.fm
            .record_pages(self.file.path(), offset..offset + bytes as u64);
        self.buf_start = start;
        self.buf_rows = n;
        Ok(&self.buf[..bytes])
    }

    /// Reads a single row, reusing the buffer when the row is already in it.
    pub fn value(&mut self, row: usize) -> PartResult<&[u8]> {
        if row >= self.buf_start && row < self.buf_start + self.buf_rows {
            let k = (row - self.buf_start) * self.elem;
            return Ok(&self.buf[k..k + self.elem]);
        }
        let offset = (row * self.elem) as u64;
        self.buf.resize(self.elem, 0);
        self.buf_rows = 0;
        let read = self.file.read_at(offset, &mut self.buf)?;
        if read < self.elem {
            return Err(PartError::BadFileSize {
                path: self.file.path().to_path_buf(),
                size: offset + read as u64,
                expected: offset + self.elem as u64,
            });
        }
        self.fm
            .record_pages(self.file.path(), offset..offset + self.elem as u64);
        self.buf_start = row;
        self.buf_rows = 1;
        Ok(&self.buf[..self.elem])
    }
}

impl Drop for ScanReader {
    fn drop(&mut self) {
        self.file.end_use();
    }
}
