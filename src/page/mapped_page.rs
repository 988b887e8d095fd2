//! A single memory-mapped page file.
//!
//! A [`MappedPage`] owns the file handle and the read-write mapping of one
//! fixed-size page. All access goes through positional `read`/`write` calls
//! that bounds-check against the page size and fail with
//! [`Error::PageReleased`] once the mapping has been released, so a stale
//! handle can never touch unmapped memory.
//!
//! ## State Machine
//!
//! ```text
//!   open() ──> mapped ──write()──> dirty ──flush()──> mapped
//!                 │                  │
//!                 └──── release() ───┴──> released (terminal)
//! ```

use crate::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Live mapping state. `None` once released.
#[derive(Debug)]
struct Mapping {
    mmap: MmapMut,
    // Kept open for the lifetime of the mapping, closed on release.
    _file: File,
    dirty: bool,
}

/// One fixed-size, file-backed block of addressable memory.
#[derive(Debug)]
pub struct MappedPage {
    index: u64,
    path: PathBuf,
    page_size: usize,
    mapping: RwLock<Option<Mapping>>,
}

impl MappedPage {
    /// Opens (creating if absent) the page file at `path` and maps exactly
    /// `page_size` bytes read-write.
    ///
    /// A new or empty file is extended to `page_size`. An existing file of any
    /// other length is rejected: page sizes must not change across reopens.
    pub fn open(index: u64, path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io("open page file", path, e))?;

        let len = file
            .metadata()
            .map_err(|e| Error::io("stat page file", path, e))?
            .len();

        if len == 0 {
            file.set_len(page_size as u64)
                .map_err(|e| Error::io("size page file", path, e))?;
        } else if len != page_size as u64 {
            return Err(Error::PageSizeMismatch {
                path: path.to_path_buf(),
                expected: page_size,
                actual: len,
            });
        }

        // SAFETY: the mapping is only reachable through this struct, which
        // bounds-checks every access and drops the mapping on release. Page
        // files belong to a single map instance and are not modified by
        // other processes while mapped.
        let mmap = unsafe {
            MmapOptions::new()
                .len(page_size)
                .map_mut(&file)
                .map_err(|e| Error::io("map page file", path, e))?
        };

        Ok(Self {
            index,
            path: path.to_path_buf(),
            page_size,
            mapping: RwLock::new(Some(Mapping {
                mmap,
                _file: file,
                dirty: false,
            })),
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns true once the mapping has been released.
    pub fn is_released(&self) -> bool {
        self.mapping.read().is_none()
    }

    /// Returns true if there are writes not yet flushed.
    pub fn is_dirty(&self) -> bool {
        self.mapping.read().as_ref().is_some_and(|m| m.dirty)
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.page_size => Ok(()),
            _ => Err(Error::PageOutOfBounds {
                index: self.index,
                offset,
                len,
                page_size: self.page_size,
            }),
        }
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        let guard = self.mapping.read();
        let mapping = guard
            .as_ref()
            .ok_or(Error::PageReleased { index: self.index })?;
        buf.copy_from_slice(&mapping.mmap[offset..offset + buf.len()]);
        Ok(())
    }

    /// Reads `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Writes `data` at `offset` and marks the page dirty.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        let mut guard = self.mapping.write();
        let mapping = guard
            .as_mut()
            .ok_or(Error::PageReleased { index: self.index })?;
        mapping.mmap[offset..offset + data.len()].copy_from_slice(data);
        mapping.dirty = true;
        Ok(())
    }

    /// Forces pending writes to disk. A clean page is a no-op.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.mapping.write();
        let mapping = guard
            .as_mut()
            .ok_or(Error::PageReleased { index: self.index })?;
        if mapping.dirty {
            mapping
                .mmap
                .flush()
                .map_err(|e| Error::io("flush page file", &self.path, e))?;
            mapping.dirty = false;
        }
        Ok(())
    }

    /// Flushes, unmaps and closes the page. Idempotent.
    ///
    /// A failed flush is logged; the mapping is released regardless so the
    /// file can be deleted afterwards.
    pub fn release(&self) {
        let mut guard = self.mapping.write();
        if let Some(mapping) = guard.take() {
            if mapping.dirty {
                if let Err(e) = mapping.mmap.flush() {
                    warn!(
                        page = self.index,
                        path = %self.path.display(),
                        error = %e,
                        "Failed to flush page before unmapping"
                    );
                }
            }
            // Dropping the mapping unmaps it; dropping the file closes it.
            drop(mapping);
            debug!(page = self.index, "Page unmapped");
        }
    }
}

impl Drop for MappedPage {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_sized_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("page-0.dat");

        let page = MappedPage::open(0, &path, 4096).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
        assert_eq!(page.page_size(), 4096);
        assert!(!page.is_dirty());
        assert!(!page.is_released());
    }

    #[test]
    fn test_write_read_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("page-1.dat");
        let page = MappedPage::open(1, &path, 4096).unwrap();

        page.write(100, b"hello").unwrap();
        assert!(page.is_dirty());
        assert_eq!(page.read(100, 5).unwrap(), b"hello");

        page.flush().unwrap();
        assert!(!page.is_dirty());

        page.release();
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[100..105], b"hello");
    }

    #[test]
    fn test_out_of_bounds() {
        let dir = tempdir().unwrap();
        let page = MappedPage::open(0, &dir.path().join("p.dat"), 128).unwrap();

        assert!(matches!(
            page.write(126, b"abc"),
            Err(Error::PageOutOfBounds { .. })
        ));
        assert!(matches!(
            page.read(usize::MAX, 2),
            Err(Error::PageOutOfBounds { .. })
        ));
        assert!(page.read(0, 128).is_ok());
    }

    #[test]
    fn test_use_after_release_fails() {
        let dir = tempdir().unwrap();
        let page = MappedPage::open(7, &dir.path().join("p.dat"), 128).unwrap();

        page.release();
        page.release();

        assert!(page.is_released());
        assert!(matches!(
            page.read(0, 4),
            Err(Error::PageReleased { index: 7 })
        ));
        assert!(matches!(
            page.write(0, b"x"),
            Err(Error::PageReleased { index: 7 })
        ));
        assert!(page.flush().is_err());
    }

    #[test]
    fn test_reopen_keeps_data_and_rejects_other_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("page-0.dat");

        {
            let page = MappedPage::open(0, &path, 256).unwrap();
            page.write(0, b"persist").unwrap();
        }

        let page = MappedPage::open(0, &path, 256).unwrap();
        assert_eq!(page.read(0, 7).unwrap(), b"persist");
        page.release();

        assert!(matches!(
            MappedPage::open(0, &path, 512),
            Err(Error::PageSizeMismatch { actual: 256, .. })
        ));
    }
}
