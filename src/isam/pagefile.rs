//! Paginated file runtime.
//!
//! [`PageFile`] owns an index file and its memory mapping. It knows nothing
//! about either index format: it hands out page-sized byte slices by file
//! page number and grows the file by whole regions. Growing may move the
//! mapping, so callers must re-derive any page slice after a grow — the
//! engines therefore address pages by index everywhere and only hold a
//! slice between allocation points.
//!
//! An OS advisory lock (via `fs2`) is taken for the duration of open or
//! create so that header initialisation and validation cannot interleave
//! across processes; the caller releases it before returning to its own
//! caller. The long-lived single-writer guarantee is not this lock: it is
//! the `(pid, start time)` writer lock the engines keep inside the header.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::IsamError;

enum Mapping {
    Ro(Mmap),
    Rw(MmapMut),
}

/// An open paginated index file and its mapping.
pub struct PageFile {
    file: File,
    map: Mapping,
    size: u64,
    path: PathBuf,
    writable: bool,
    open_locked: bool,
}

impl PageFile {
    /// Create (or truncate) a file of `initial_bytes` and map it
    /// read-write. The open lock is held until
    /// [`release_open_lock`](Self::release_open_lock).
    pub fn create<P: AsRef<Path>>(path: P, initial_bytes: u64) -> Result<Self, IsamError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| IsamError::Open(format!("cannot create {}: {}", path.display(), e)))?;

        file.lock_exclusive()
            .map_err(|e| IsamError::Open(format!("cannot lock {}: {}", path.display(), e)))?;

        file.set_len(initial_bytes)
            .map_err(|e| IsamError::Open(format!("cannot size {}: {}", path.display(), e)))?;

        let map = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| IsamError::Open(format!("cannot map {}: {}", path.display(), e)))?;

        Ok(PageFile {
            file,
            map: Mapping::Rw(map),
            size: initial_bytes,
            path: path.to_path_buf(),
            writable: true,
            open_locked: true,
        })
    }

    /// Open an existing file and map it read-write or read-only. The open
    /// lock is held until [`release_open_lock`](Self::release_open_lock).
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self, IsamError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| IsamError::Open(format!("cannot open {}: {}", path.display(), e)))?;

        if writable {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        }
        .map_err(|e| IsamError::Open(format!("cannot lock {}: {}", path.display(), e)))?;

        let size = file
            .metadata()
            .map_err(|e| IsamError::Open(format!("cannot stat {}: {}", path.display(), e)))?
            .len();

        let map = if writable {
            Mapping::Rw(
                unsafe { MmapOptions::new().map_mut(&file) }
                    .map_err(|e| IsamError::Open(format!("cannot map {}: {}", path.display(), e)))?,
            )
        } else {
            Mapping::Ro(
                unsafe { MmapOptions::new().map(&file) }
                    .map_err(|e| IsamError::Open(format!("cannot map {}: {}", path.display(), e)))?,
            )
        };

        Ok(PageFile {
            file,
            map,
            size,
            path: path.to_path_buf(),
            writable,
            open_locked: true,
        })
    }

    /// Release the short-lived open lock once the header has been
    /// initialised or validated.
    pub fn release_open_lock(&mut self) -> Result<(), IsamError> {
        if self.open_locked {
            self.open_locked = false;
            FileExt::unlock(&self.file).map_err(|e| {
                IsamError::Io(format!("cannot unlock {}: {}", self.path.display(), e))
            })?;
        }
        Ok(())
    }

    /// Current file (and mapping) length in bytes.
    pub fn len(&self) -> u64 {
        self.size
    }

    /// True when the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// True when opened for writing.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// The path this file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Grow the file to `new_len` bytes and remap. Any previously obtained
    /// page slice is invalid after this returns. Shrinking is not
    /// supported.
    pub fn grow(&mut self, new_len: u64) -> Result<(), IsamError> {
        if !self.writable {
            return Err(IsamError::Io(format!(
                "{}: grow on read-only mapping",
                self.path.display()
            )));
        }
        if new_len < self.size {
            return Err(IsamError::Argument(format!(
                "{}: cannot shrink from {} to {}",
                self.path.display(),
                self.size,
                new_len
            )));
        }
        self.file.set_len(new_len).map_err(|e| {
            IsamError::Io(format!("cannot extend {} to {}: {}", self.path.display(), new_len, e))
        })?;
        self.map = Mapping::Rw(
            unsafe { MmapOptions::new().map_mut(&self.file) }.map_err(|e| {
                IsamError::Io(format!("cannot remap {}: {}", self.path.display(), e))
            })?,
        );
        self.size = new_len;
        Ok(())
    }

    /// The whole mapping.
    pub fn bytes(&self) -> &[u8] {
        match &self.map {
            Mapping::Ro(m) => m,
            Mapping::Rw(m) => m,
        }
    }

    /// The whole mapping, writable.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8], IsamError> {
        match &mut self.map {
            Mapping::Rw(m) => Ok(m),
            Mapping::Ro(_) => Err(IsamError::Io(format!(
                "{}: write access to read-only mapping",
                self.path.display()
            ))),
        }
    }

    /// Borrow one page of `page_size` bytes by file page number
    /// (page 0 is the header page).
    pub fn page(&self, pageno: u32, page_size: usize) -> Result<&[u8], IsamError> {
        let start = pageno as usize * page_size;
        let end = start + page_size;
        self.bytes().get(start..end).ok_or_else(|| {
            IsamError::Structural(format!(
                "{}: page {} beyond mapping ({} bytes)",
                self.path.display(),
                pageno,
                self.size
            ))
        })
    }

    /// Borrow one page writable. The slice dies at the next grow.
    pub fn page_mut(&mut self, pageno: u32, page_size: usize) -> Result<&mut [u8], IsamError> {
        let start = pageno as usize * page_size;
        let end = start + page_size;
        let size = self.size;
        let path = self.path.clone();
        self.bytes_mut()?.get_mut(start..end).ok_or_else(|| {
            IsamError::Structural(format!(
                "{}: page {} beyond mapping ({} bytes)",
                path.display(),
                pageno,
                size
            ))
        })
    }

    /// `msync` the whole mapping.
    pub fn sync(&self) -> Result<(), IsamError> {
        if let Mapping::Rw(m) = &self.map {
            m.flush()
                .map_err(|e| IsamError::Io(format!("cannot sync {}: {}", self.path.display(), e)))?;
        }
        Ok(())
    }
}

impl Drop for PageFile {
    fn drop(&mut self) {
        if self.open_locked {
            let _ = FileExt::unlock(&self.file);
        }
    }
}
