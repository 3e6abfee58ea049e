//! NDX: a prefix-compressed B+-tree over variable-length byte keys.
//!
//! Keys are 1-255 bytes, values 0-255 bytes; duplicate keys are kept in
//! insertion order. Every page, leaf or inner, has the same layout: a
//! 4-byte header `(level, tail, pagelen)` followed by front-coded
//! records `(common, suffix, datalen, suffix_bytes, data_bytes)` where
//! `common` is the length of the prefix shared with the previous
//! record's reconstructed key. Inner records carry a 3-byte child page
//! number as data. Every page ends with a sentinel record with an empty
//! key; on the rightmost page of an inner level the sentinel carries the
//! rightmost child pointer (`tail == 6`), elsewhere it is empty
//! (`tail == 3`).
//!
//! Splits copy the left half of a page into a freshly allocated sibling
//! and keep the right half in place, so the rightmost page of each level
//! never moves: the leaf level ends at page 1 and inner levels end at
//! their promotion page. Separator inserts walk up an explicit work
//! stack bounded by [`NDX_MAX_DEPTH`] rather than recursing.
//!
//! The engine records its latest error message on the handle
//! ([`Ndx::last_error`]) and can mirror messages to an [`ErrorSink`],
//! on top of the typed [`IsamError`] every operation returns.

use std::cell::RefCell;
use std::io::{self, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::isam::constants::*;
use crate::isam::pagefile::PageFile;
use crate::isam::process::{probe_lock, LockProbe, ProcessClock, SystemClock};
use crate::util::fmt::{fmt_data_bytes, fmt_key_bytes};
use crate::IsamError;

// ── raw page field access ───────────────────────────────────────────

fn pg_level(p: &[u8]) -> u8 {
    p[NDX_PAGE_LEVEL]
}

fn pg_tail(p: &[u8]) -> usize {
    p[NDX_PAGE_TAIL] as usize
}

fn pg_len(p: &[u8]) -> usize {
    LittleEndian::read_u16(&p[NDX_PAGE_LEN..NDX_PAGE_LEN + 2]) as usize
}

fn set_pg_len(p: &mut [u8], v: usize) {
    LittleEndian::write_u16(&mut p[NDX_PAGE_LEN..NDX_PAGE_LEN + 2], v as u16);
}

/// Read a 3-byte little-endian child page number.
fn get_pageno(d: &[u8]) -> u32 {
    d[0] as u32 | (d[1] as u32) << 8 | (d[2] as u32) << 16
}

fn set_pageno(d: &mut [u8], v: u32) {
    d[0] = v as u8;
    d[1] = (v >> 8) as u8;
    d[2] = (v >> 16) as u8;
}

/// Optional mirror for engine error messages; see
/// [`Ndx::set_error_sink`].
pub trait ErrorSink {
    fn report(&mut self, msg: &str);
}

/// Where a scan stopped inside one page: the offset of the first record
/// whose key is `>=` the probe (possibly the sentinel), whether it
/// matched exactly, and the prefix lengths the probe shares with the
/// records bracketing that spot.
#[derive(Debug, Clone, Copy, Default)]
struct ScanState {
    offset: usize,
    exact: bool,
    common_prev: usize,
    common_next: usize,
}

/// Per-level insert position remembered by the descent.
#[derive(Debug, Clone, Copy, Default)]
struct Cache {
    pageno: u32,
    offset: usize,
    common_prev: usize,
    common_next: usize,
}

/// A deferred insert: the user record at level 0, separators above.
struct Pending {
    level: usize,
    key: Vec<u8>,
    data: Vec<u8>,
}

/// Creation parameters; zero `pageshift` selects the default.
#[derive(Debug, Clone, Copy)]
pub struct NdxParams {
    pub pageshift: u32,
    pub minkeylen: usize,
    pub maxkeylen: usize,
    pub mindatalen: usize,
    pub maxdatalen: usize,
}

impl Default for NdxParams {
    fn default() -> Self {
        NdxParams {
            pageshift: 0,
            minkeylen: 1,
            maxkeylen: NDX_MAX_KEYLEN,
            mindatalen: 0,
            maxdatalen: NDX_MAX_DATALEN,
        }
    }
}

/// Header summary, also the `--json` payload of `isam info`.
#[derive(Debug, Clone, Serialize)]
pub struct NdxInfo {
    pub major: u32,
    pub minor: u32,
    pub pageshift: u32,
    pub pagesize: u32,
    pub root: u32,
    pub rootlevel: i32,
    pub nbpages: u32,
    pub nbkeys: u32,
    pub minkeylen: i32,
    pub maxkeylen: i32,
    pub mindatalen: i32,
    pub maxdatalen: i32,
    pub user_major: u32,
    pub user_minor: u32,
    pub wrlock_pid: u32,
    pub wrlock_time: u64,
}

/// An open NDX index.
pub struct Ndx {
    file: PageFile,
    clock: Box<dyn ProcessClock>,
    pageshift: u32,
    pagesize: usize,
    owns_lock: bool,
    last_error: RefCell<Option<String>>,
    sink: RefCell<Option<Box<dyn ErrorSink>>>,
}

impl std::fmt::Debug for Ndx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ndx")
            .field("pageshift", &self.pageshift)
            .field("pagesize", &self.pagesize)
            .field("owns_lock", &self.owns_lock)
            .finish_non_exhaustive()
    }
}

impl Ndx {
    // ── lifecycle ───────────────────────────────────────────────────

    /// Create (or truncate) an index at `path` and open it for writing.
    pub fn create<P: AsRef<Path>>(path: P, params: &NdxParams) -> Result<Self, IsamError> {
        Self::create_with_clock(path, params, Box::new(SystemClock))
    }

    /// [`create`](Self::create) with an injected [`ProcessClock`].
    pub fn create_with_clock<P: AsRef<Path>>(
        path: P,
        params: &NdxParams,
        clock: Box<dyn ProcessClock>,
    ) -> Result<Self, IsamError> {
        let pageshift = if params.pageshift == 0 { NDX_PAGESHIFT } else { params.pageshift };
        if !(NDX_MIN_PAGESHIFT..=NDX_MAX_PAGESHIFT).contains(&pageshift) {
            return Err(IsamError::Argument(format!("invalid pageshift {}", pageshift)));
        }
        let pagesize = 1usize << pageshift;
        if params.minkeylen < 1
            || params.maxkeylen > NDX_MAX_KEYLEN
            || params.maxkeylen < params.minkeylen
        {
            return Err(IsamError::Argument(format!(
                "invalid key size range {}..{}",
                params.minkeylen, params.maxkeylen
            )));
        }
        if params.maxdatalen > NDX_MAX_DATALEN || params.maxdatalen < params.mindatalen {
            return Err(IsamError::Argument(format!(
                "invalid data size range {}..{}",
                params.mindatalen, params.maxdatalen
            )));
        }
        // An empty page must be able to take one maximal record next to
        // a rightmost sentinel, or splitting could never make progress.
        if 4 + 6 + 3 + params.maxkeylen + params.maxdatalen > pagesize {
            return Err(IsamError::Argument(format!(
                "pagesize {} too small for {}-byte keys and {}-byte data",
                pagesize, params.maxkeylen, params.maxdatalen
            )));
        }

        let initial = (pagesize as u64 * 2 + 4095) & !4095;
        let file = PageFile::create(path, initial)?;
        let mut ndx = Ndx {
            file,
            clock,
            pageshift,
            pagesize,
            owns_lock: false,
            last_error: RefCell::new(None),
            sink: RefCell::new(None),
        };

        {
            let hdr = ndx.file.page_mut(0, pagesize)?;
            hdr[NDX_HDR_MAGIC..NDX_HDR_MAGIC + 4].copy_from_slice(&NDX_MAGIC);
            LittleEndian::write_u32(&mut hdr[NDX_HDR_MAJOR..], NDX_MAJOR);
            LittleEndian::write_u32(&mut hdr[NDX_HDR_MINOR..], NDX_MINOR);
            LittleEndian::write_u32(&mut hdr[NDX_HDR_PAGESHIFT..], pageshift);
            LittleEndian::write_u32(&mut hdr[NDX_HDR_PAGESIZE..], pagesize as u32);
            LittleEndian::write_u32(&mut hdr[NDX_HDR_ROOT..], 1);
            LittleEndian::write_i32(&mut hdr[NDX_HDR_ROOTLEVEL..], 0);
            LittleEndian::write_u32(&mut hdr[NDX_HDR_NBPAGES..], 2);
            LittleEndian::write_u32(&mut hdr[NDX_HDR_NBKEYS..], 0);
            LittleEndian::write_i32(&mut hdr[NDX_HDR_MINKEYLEN..], params.minkeylen as i32);
            LittleEndian::write_i32(&mut hdr[NDX_HDR_MAXKEYLEN..], params.maxkeylen as i32);
            LittleEndian::write_i32(&mut hdr[NDX_HDR_MINDATALEN..], params.mindatalen as i32);
            LittleEndian::write_i32(&mut hdr[NDX_HDR_MAXDATALEN..], params.maxdatalen as i32);
        }
        {
            // The initial root is an empty leaf holding only the sentinel.
            let root = ndx.file.page_mut(1, pagesize)?;
            root[NDX_PAGE_LEVEL] = 0;
            root[NDX_PAGE_TAIL] = 3;
            set_pg_len(root, 7);
            root[4] = 0;
            root[5] = 0;
            root[6] = 0;
        }

        ndx.take_writer_lock()?;
        ndx.file.sync()?;
        ndx.file.release_open_lock()?;
        Ok(ndx)
    }

    /// Open an existing index.
    ///
    /// Legacy `0.2` files have the same layout as `1.0`: a read-only
    /// open serves them as-is, a write open migrates the stored version
    /// to `1.0` before taking the writer lock.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self, IsamError> {
        Self::open_with_clock(path, writable, Box::new(SystemClock))
    }

    /// [`open`](Self::open) with an injected [`ProcessClock`].
    pub fn open_with_clock<P: AsRef<Path>>(
        path: P,
        writable: bool,
        clock: Box<dyn ProcessClock>,
    ) -> Result<Self, IsamError> {
        let file = PageFile::open(path, writable)?;
        if file.len() < 72 {
            return Err(IsamError::CorruptHeader(format!(
                "{}: file too small ({} bytes)",
                file.path().display(),
                file.len()
            )));
        }
        let hdr = file.bytes();
        let pageshift = LittleEndian::read_u32(&hdr[NDX_HDR_PAGESHIFT..]);
        let pagesize = LittleEndian::read_u32(&hdr[NDX_HDR_PAGESIZE..]);

        let mut ndx = Ndx {
            file,
            clock,
            pageshift,
            pagesize: pagesize as usize,
            owns_lock: false,
            last_error: RefCell::new(None),
            sink: RefCell::new(None),
        };
        ndx.check(0, &mut io::sink())
            .map_err(|e| IsamError::CorruptHeader(e.message().to_string()))?;

        if writable {
            let (major, minor) = ndx.version();
            if (major, minor) == (0, 2) {
                let hdr = ndx.file.page_mut(0, ndx.pagesize)?;
                LittleEndian::write_u32(&mut hdr[NDX_HDR_MAJOR..], NDX_MAJOR);
                LittleEndian::write_u32(&mut hdr[NDX_HDR_MINOR..], NDX_MINOR);
            }
            let (pid, stamp) = ndx.wrlock();
            match probe_lock(ndx.clock.as_ref(), pid, stamp) {
                LockProbe::Held => {
                    return Err(IsamError::WriterLocked(format!(
                        "{}: write lock held by pid {}",
                        ndx.file.path().display(),
                        pid
                    )));
                }
                LockProbe::Stale | LockProbe::Unlocked => ndx.take_writer_lock()?,
            }
            ndx.file.sync()?;
        }
        ndx.file.release_open_lock()?;
        Ok(ndx)
    }

    /// Close the index; a writer clears its in-header lock and syncs.
    pub fn close(mut self) -> Result<(), IsamError> {
        self.do_close()
    }

    fn do_close(&mut self) -> Result<(), IsamError> {
        if self.owns_lock {
            self.owns_lock = false;
            self.file.sync()?;
            self.set_wrlock(0, 0);
            self.file.sync()?;
        }
        Ok(())
    }

    fn take_writer_lock(&mut self) -> Result<(), IsamError> {
        let pid = self.clock.pid();
        let stamp = self.clock.start_time(pid).unwrap_or(0);
        self.set_wrlock(pid, stamp);
        self.owns_lock = true;
        Ok(())
    }

    // ── error slot ──────────────────────────────────────────────────

    /// Record `err` on the handle (and in the sink) before returning it.
    fn fail(&self, err: IsamError) -> IsamError {
        let msg = err.message().to_string();
        if let Some(s) = self.sink.borrow_mut().as_mut() {
            s.report(&msg);
        }
        *self.last_error.borrow_mut() = Some(msg);
        err
    }

    /// The most recent error message recorded on this handle.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    /// Install an error sink, returning the previous one.
    pub fn set_error_sink(&self, sink: Option<Box<dyn ErrorSink>>) -> Option<Box<dyn ErrorSink>> {
        std::mem::replace(&mut *self.sink.borrow_mut(), sink)
    }

    // ── header access ───────────────────────────────────────────────

    fn hdr(&self) -> &[u8] {
        &self.file.bytes()[..self.pagesize.min(self.file.len() as usize)]
    }

    fn hdr_u32(&self, at: usize) -> u32 {
        LittleEndian::read_u32(&self.hdr()[at..at + 4])
    }

    fn set_hdr_u32(&mut self, at: usize, v: u32) {
        let hdr = self.file.page_mut(0, self.pagesize).expect("header page");
        LittleEndian::write_u32(&mut hdr[at..at + 4], v);
    }

    fn version(&self) -> (u32, u32) {
        (self.hdr_u32(NDX_HDR_MAJOR), self.hdr_u32(NDX_HDR_MINOR))
    }

    fn root(&self) -> u32 {
        self.hdr_u32(NDX_HDR_ROOT)
    }

    fn rootlevel(&self) -> i32 {
        self.hdr_u32(NDX_HDR_ROOTLEVEL) as i32
    }

    fn nbpages(&self) -> u32 {
        self.hdr_u32(NDX_HDR_NBPAGES)
    }

    fn nbkeys(&self) -> u32 {
        self.hdr_u32(NDX_HDR_NBKEYS)
    }

    fn minkeylen(&self) -> usize {
        self.hdr_u32(NDX_HDR_MINKEYLEN) as usize
    }

    fn maxkeylen(&self) -> usize {
        self.hdr_u32(NDX_HDR_MAXKEYLEN) as usize
    }

    fn mindatalen(&self) -> usize {
        self.hdr_u32(NDX_HDR_MINDATALEN) as usize
    }

    fn maxdatalen(&self) -> usize {
        self.hdr_u32(NDX_HDR_MAXDATALEN) as usize
    }

    fn wrlock(&self) -> (u32, u64) {
        let hdr = self.hdr();
        (
            LittleEndian::read_u32(&hdr[NDX_HDR_WRLOCK..]),
            LittleEndian::read_u64(&hdr[NDX_HDR_WRLOCKT..]),
        )
    }

    fn set_wrlock(&mut self, pid: u32, stamp: u64) {
        let hdr = self.file.page_mut(0, self.pagesize).expect("header page");
        LittleEndian::write_u32(&mut hdr[NDX_HDR_WRLOCK..NDX_HDR_WRLOCK + 4], pid);
        LittleEndian::write_u64(&mut hdr[NDX_HDR_WRLOCKT..NDX_HDR_WRLOCKT + 8], stamp);
    }

    /// Header summary.
    pub fn info(&self) -> NdxInfo {
        let (wpid, wtime) = self.wrlock();
        NdxInfo {
            major: self.hdr_u32(NDX_HDR_MAJOR),
            minor: self.hdr_u32(NDX_HDR_MINOR),
            pageshift: self.pageshift,
            pagesize: self.pagesize as u32,
            root: self.root(),
            rootlevel: self.rootlevel(),
            nbpages: self.nbpages(),
            nbkeys: self.nbkeys(),
            minkeylen: self.hdr_u32(NDX_HDR_MINKEYLEN) as i32,
            maxkeylen: self.hdr_u32(NDX_HDR_MAXKEYLEN) as i32,
            mindatalen: self.hdr_u32(NDX_HDR_MINDATALEN) as i32,
            maxdatalen: self.hdr_u32(NDX_HDR_MAXDATALEN) as i32,
            user_major: self.hdr_u32(NDX_HDR_USER_MAJOR),
            user_minor: self.hdr_u32(NDX_HDR_USER_MINOR),
            wrlock_pid: wpid,
            wrlock_time: wtime,
        }
    }

    /// User private version stamp carried in the header.
    pub fn user_version(&self) -> (u32, u32) {
        (self.hdr_u32(NDX_HDR_USER_MAJOR), self.hdr_u32(NDX_HDR_USER_MINOR))
    }

    /// Set the user private version stamp.
    pub fn set_user_version(&mut self, major: u32, minor: u32) -> Result<(), IsamError> {
        if !self.file.writable() {
            return Err(self.fail(IsamError::Argument("index opened read-only".into())));
        }
        self.set_hdr_u32(NDX_HDR_USER_MAJOR, major);
        self.set_hdr_u32(NDX_HDR_USER_MINOR, minor);
        Ok(())
    }

    // ── page access ─────────────────────────────────────────────────

    fn page(&self, pageno: u32) -> Result<&[u8], IsamError> {
        if pageno < 1 || pageno >= self.nbpages() {
            return Err(self.fail(IsamError::Structural(format!("invalid pageno {}", pageno))));
        }
        self.file.page(pageno, self.pagesize)
    }

    fn page_mut(&mut self, pageno: u32) -> Result<&mut [u8], IsamError> {
        if pageno < 1 || pageno >= self.nbpages() {
            return Err(self.fail(IsamError::Structural(format!("invalid pageno {}", pageno))));
        }
        self.file.page_mut(pageno, self.pagesize)
    }

    /// Borrow a page with its header validated, so record walks stay in
    /// bounds on corrupt input.
    fn page_checked(&self, pageno: u32) -> Result<&[u8], IsamError> {
        let pagesize = self.pagesize;
        let page = self.page(pageno)?;
        let pagelen = pg_len(page);
        let tail = pg_tail(page);
        if (tail != 3 && tail != 6) || pagelen < NDX_PAGE_RECS + tail || pagelen > pagesize {
            return Err(self.fail(IsamError::Structural(format!(
                "page {}: invalid tail={} pagelen={}",
                pageno, tail, pagelen
            ))));
        }
        Ok(page)
    }

    /// Append a fresh page to the file, growing it when needed.
    /// Invalidates every outstanding page slice.
    fn new_page(&mut self) -> Result<u32, IsamError> {
        let newpageno = self.nbpages();
        let newfilesize = (newpageno as u64 + 1) << self.pageshift;
        if newfilesize > self.file.len() {
            self.file.grow(self.file.len() + NDX_GROW_BYTES)?;
        }
        self.set_hdr_u32(NDX_HDR_NBPAGES, newpageno + 1);
        Ok(newpageno)
    }

    // ── scan ────────────────────────────────────────────────────────

    /// Walk one page for `key`, returning where the probe belongs. An
    /// exact match only stops the scan at or after `min_offset`, which
    /// lets pushes skip every existing duplicate (pass the page size)
    /// and separator inserts resume from the remembered slot.
    fn scan(&self, page: &[u8], key: &[u8], min_offset: usize) -> Result<ScanState, IsamError> {
        let pagelen = pg_len(page);
        let tail = pg_tail(page);
        let p3 = pagelen - tail;
        let mut p = NDX_PAGE_RECS;
        let mut common = 0usize;
        let mut comm2 = 0usize;

        while p < p3 {
            common = comm2;
            let c = page[p] as usize;
            let s = page[p + 1] as usize;
            let d = page[p + 2] as usize;
            if c > comm2 {
                // current key extends an already-smaller key
                p += 3 + s + d;
                continue;
            }
            if c < comm2 {
                // current key diverges below the matched prefix
                return Ok(ScanState {
                    offset: p,
                    exact: false,
                    common_prev: common,
                    common_next: c,
                });
            }
            let mut p1 = p + 3;
            let p2 = p1 + s;
            if p2 + d > p3 {
                return Err(self.fail(IsamError::Structural("corrupted page in scan".into())));
            }
            loop {
                if p1 == p2 {
                    if comm2 == key.len() && p >= min_offset {
                        return Ok(ScanState {
                            offset: p,
                            exact: true,
                            common_prev: common,
                            common_next: comm2,
                        });
                    }
                    // current key is a prefix of (or equals) the probe
                    p += 3 + s + d;
                    break;
                }
                if comm2 >= key.len() {
                    // current key is larger
                    return Ok(ScanState {
                        offset: p,
                        exact: false,
                        common_prev: common,
                        common_next: comm2,
                    });
                }
                if page[p1] != key[comm2] {
                    if page[p1] < key[comm2] {
                        p += 3 + s + d;
                        break;
                    }
                    return Ok(ScanState {
                        offset: p,
                        exact: false,
                        common_prev: common,
                        common_next: comm2,
                    });
                }
                comm2 += 1;
                p1 += 1;
            }
        }
        if p == p3 {
            // ran into the sentinel
            return Ok(ScanState {
                offset: p,
                exact: false,
                common_prev: comm2,
                common_next: 0,
            });
        }
        Err(self.fail(IsamError::Structural("corrupted page in scan".into())))
    }

    // ── fetch ───────────────────────────────────────────────────────

    /// Append the data of every record stored under `key` to `out`, in
    /// insertion order, and return the record count.
    pub fn fetch(&self, key: &[u8], out: &mut Vec<u8>) -> Result<usize, IsamError> {
        if key.len() < self.minkeylen() || key.len() > self.maxkeylen() {
            return Err(self.fail(IsamError::Argument(format!(
                "invalid key length {}",
                key.len()
            ))));
        }
        self.fetch1(self.rootlevel(), self.root(), key, out)
    }

    /// [`fetch`](Self::fetch) keyed on the little-endian bytes of `key`.
    pub fn fetch_u64(&self, key: u64, out: &mut Vec<u8>) -> Result<usize, IsamError> {
        self.fetch(&key.to_le_bytes(), out)
    }

    fn fetch1(
        &self,
        level: i32,
        pageno: u32,
        key: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<usize, IsamError> {
        let page = self.page_checked(pageno)?;
        if pg_level(page) as i32 != level {
            return Err(self.fail(IsamError::Structural(format!(
                "page {}: incorrect level {} != {}",
                pageno,
                pg_level(page),
                level
            ))));
        }

        let mut sst = self.scan(page, key, 0)?;
        let mut found = 0usize;

        if level > 0 {
            loop {
                let page = self.page_checked(pageno)?;
                let pagelen = pg_len(page);
                let p = sst.offset;
                let child_at = p + 3 + page[p + 1] as usize;
                if child_at + 3 > pagelen {
                    return Err(self.fail(IsamError::Structural(format!(
                        "page {}: child pointer at {} out of bounds",
                        pageno, p
                    ))));
                }
                let child = get_pageno(&page[child_at..child_at + 3]);
                found += self.fetch1(level - 1, child, key, out)?;

                // equal keys may continue under the next child
                if !sst.exact {
                    break;
                }
                sst.offset += 3 + page[p + 1] as usize + page[p + 2] as usize;
                let p = sst.offset;
                if page[p + 2] == 0 {
                    break;
                }
                sst.exact = page[p] as usize == key.len() && page[p + 1] == 0;
            }
        } else {
            let p3 = pg_len(page) - pg_tail(page);
            while sst.exact {
                found += 1;
                let p = sst.offset;
                let s = page[p + 1] as usize;
                let d = page[p + 2] as usize;
                if p + 3 + s + d > p3 {
                    return Err(self.fail(IsamError::Structural(format!(
                        "page {}: record at {} overflows page",
                        pageno, p
                    ))));
                }
                out.extend_from_slice(&page[p + 3 + s..p + 3 + s + d]);
                sst.offset = p + 3 + s + d;
                let p = sst.offset;
                sst.exact = page[p] as usize == key.len() && page[p + 1] == 0;
            }
        }
        Ok(found)
    }

    // ── push ────────────────────────────────────────────────────────

    /// Insert a `(key, data)` record, after every existing record with
    /// an equal key.
    pub fn push(&mut self, key: &[u8], data: &[u8]) -> Result<(), IsamError> {
        if !self.file.writable() {
            return Err(self.fail(IsamError::Argument("index opened read-only".into())));
        }
        if key.len() < self.minkeylen() || key.len() > self.maxkeylen() {
            return Err(self.fail(IsamError::Argument(format!(
                "invalid key length {}",
                key.len()
            ))));
        }
        if data.len() < self.mindatalen() || data.len() > self.maxdatalen() {
            let err = if data.len() > NDX_MAX_DATALEN {
                IsamError::Oversized(format!("data length {}", data.len()))
            } else {
                IsamError::Argument(format!("invalid data length {}", data.len()))
            };
            return Err(self.fail(err));
        }

        // Descend, remembering the insert spot per level. The scan skips
        // every exact match so the new record lands after its equals.
        let mut ist = [Cache::default(); NDX_MAX_DEPTH];
        let mut pageno = self.root();
        let mut level = self.rootlevel();
        if !(0..NDX_MAX_DEPTH as i32).contains(&level) {
            return Err(self.fail(IsamError::Structural(format!("incorrect root level {}", level))));
        }
        loop {
            let page = self.page_checked(pageno)?;
            if pg_level(page) as i32 != level {
                return Err(self.fail(IsamError::Structural(format!(
                    "page {}: incorrect level {} != {}",
                    pageno,
                    pg_level(page),
                    level
                ))));
            }
            let sst = self.scan(page, key, self.pagesize)?;
            ist[level as usize] = Cache {
                pageno,
                offset: sst.offset,
                common_prev: sst.common_prev,
                common_next: sst.common_next,
            };
            if level == 0 {
                break;
            }
            let p = sst.offset;
            let child_at = p + 3 + page[p + 1] as usize;
            if child_at + 3 > pg_len(page) {
                return Err(self.fail(IsamError::Structural(format!(
                    "page {}: child pointer at {} out of bounds",
                    pageno, p
                ))));
            }
            pageno = get_pageno(&page[child_at..child_at + 3]);
            level -= 1;
        }

        self.insert_levels(&mut ist, key, data)
    }

    /// [`push`](Self::push) keyed on the little-endian bytes of `key`.
    pub fn push_u64(&mut self, key: u64, data: &[u8]) -> Result<(), IsamError> {
        self.push(&key.to_le_bytes(), data)
    }

    /// Drain the insert work stack: the user record first, then every
    /// separator produced by splits, each retried until its page fits.
    fn insert_levels(
        &mut self,
        ist: &mut [Cache; NDX_MAX_DEPTH],
        key: &[u8],
        data: &[u8],
    ) -> Result<(), IsamError> {
        let mut stack: Vec<Pending> = vec![Pending {
            level: 0,
            key: key.to_vec(),
            data: data.to_vec(),
        }];

        while let Some(top) = stack.last() {
            let level = top.level;
            let pageno = ist[level].pageno;
            let page = self.page_checked(pageno)?;
            let pagelen = pg_len(page);

            let sst = if level > 0 {
                // Separator keys need a rescan to recover prefix shares;
                // the remembered offset keeps duplicates in order.
                self.scan(page, &top.key, ist[level].offset)?
            } else {
                ScanState {
                    offset: ist[0].offset,
                    exact: false,
                    common_prev: ist[0].common_prev,
                    common_next: ist[0].common_next,
                }
            };

            let p = sst.offset;
            if p + 3 > pagelen {
                return Err(self.fail(IsamError::Structural(format!(
                    "page {}: insert offset {} out of bounds",
                    pageno, p
                ))));
            }
            if page[p] as usize > sst.common_next {
                return Err(self.fail(IsamError::Structural(format!(
                    "page {}: successor common {} exceeds shared prefix {}",
                    pageno, page[p], sst.common_next
                ))));
            }
            let cmp2 = sst.common_next - page[p] as usize;
            if cmp2 > page[p + 1] as usize {
                return Err(self.fail(IsamError::Structural(format!(
                    "page {}: successor suffix too short for prefix growth",
                    pageno
                ))));
            }
            let chunk = 3 + (top.key.len() - sst.common_prev) + top.data.len();
            let needed = chunk - cmp2;

            if pagelen + needed <= self.pagesize {
                let keylen = top.key.len();
                let datalen = top.data.len();
                let (ins_key, ins_data) = (top.key.clone(), top.data.clone());
                let page = self.page_mut(pageno)?;

                page.copy_within(p..pagelen, p + needed);
                // The successor record loses `cmp2` suffix bytes to the
                // grown common prefix.
                page[p + chunk + 2] = page[p + 2];
                page[p + chunk + 1] = page[p + 1] - cmp2 as u8;
                page[p + chunk] = page[p] + cmp2 as u8;
                page[p] = sst.common_prev as u8;
                page[p + 1] = (keylen - sst.common_prev) as u8;
                page[p + 2] = datalen as u8;
                page[p + 3..p + 3 + keylen - sst.common_prev]
                    .copy_from_slice(&ins_key[sst.common_prev..]);
                page[p + 3 + keylen - sst.common_prev..p + chunk].copy_from_slice(&ins_data);
                set_pg_len(page, pagelen + needed);

                if level == 0 {
                    let n = self.nbkeys();
                    self.set_hdr_u32(NDX_HDR_NBKEYS, n + 1);
                }
                stack.pop();
                continue;
            }

            if stack.len() >= NDX_MAX_DEPTH {
                return Err(self.fail(IsamError::Structural("tree too deep".into())));
            }
            let (sep_key, new_pageno) = self.split_page(ist, level, sst.offset, chunk)?;
            let mut sep_data = vec![0u8; 3];
            set_pageno(&mut sep_data, new_pageno);
            stack.push(Pending { level: level + 1, key: sep_key, data: sep_data });
        }
        Ok(())
    }

    /// Split `ist[level].pageno` around the middle: the left half moves
    /// into a fresh page, the right half stays (so rightmost pages never
    /// move). Returns the separator `(last key of the left half, new
    /// page number)` for the caller to insert one level up. Promotes a
    /// new root first when the split page is the root.
    fn split_page(
        &mut self,
        ist: &mut [Cache; NDX_MAX_DEPTH],
        level: usize,
        offset: usize,
        chunk: usize,
    ) -> Result<(Vec<u8>, u32), IsamError> {
        let pageno = ist[level].pageno;
        let newpageno = self.new_page()?;

        let (split, key2, newpagelen) = {
            let page = self.page_checked(pageno)?;
            let pagelen = pg_len(page);
            let tail = pg_tail(page);

            // Bias the split point to leave room for the pending insert.
            let mut split = pagelen >> 1;
            if offset < split {
                split = split.saturating_sub(chunk >> 1);
            } else {
                split = (split + (chunk >> 1)).min(pagelen - tail);
            }
            // An append at the very end of the rightmost page splits on
            // the sentinel: ascending loads leave full pages behind.
            if (pageno == 1 || tail == 6) && offset == pagelen - tail {
                split = pagelen - tail;
            }

            // Advance to the first record boundary at or past the target,
            // reconstructing the left half's last key on the way.
            let mut key2 = vec![0u8; NDX_MAX_KEYLEN + 1];
            let mut key2len = 0usize;
            let mut p = NDX_PAGE_RECS;
            loop {
                let c = page[p] as usize;
                let s = page[p + 1] as usize;
                let d = page[p + 2] as usize;
                if c + s > NDX_MAX_KEYLEN || p + 3 + s + d > pagelen {
                    return Err(self.fail(IsamError::Structural(format!(
                        "page {}: corrupt record at {}",
                        pageno, p
                    ))));
                }
                key2[c..c + s].copy_from_slice(&page[p + 3..p + 3 + s]);
                key2len = c + s;
                p += 3 + s + d;
                if p >= split {
                    break;
                }
            }
            let split = p;
            if split > pagelen - tail {
                return Err(self.fail(IsamError::Structural(format!(
                    "page {}: cannot split",
                    pageno
                ))));
            }
            key2.truncate(key2len);
            (split, key2, split + 3)
        };

        // Left half, plus a fresh empty sentinel, into the new page.
        {
            let left = self.page(pageno)?[..split].to_vec();
            let newpage = self.page_mut(newpageno)?;
            newpage[..split].copy_from_slice(&left);
            newpage[split] = 0;
            newpage[split + 1] = 0;
            newpage[split + 2] = 0;
            newpage[NDX_PAGE_TAIL] = 3;
            set_pg_len(newpage, newpagelen);
        }

        // The right half's first record regains the prefix bytes it
        // shared with its evicted predecessor.
        let shift = {
            let page = self.page_mut(pageno)?;
            let pagelen = pg_len(page);
            let common = page[split] as usize;
            let suffix = page[split + 1] as usize;
            let datalen = page[split + 2];
            if common > key2.len() {
                return Err(IsamError::Structural(format!(
                    "page {}: split record common {} exceeds separator key",
                    pageno, common
                )));
            }
            let newlen = NDX_PAGE_RECS + common + (pagelen - split);
            let shift = split - NDX_PAGE_RECS - common;

            page.copy_within(split + 3..pagelen, NDX_PAGE_RECS + 3 + common);
            page[NDX_PAGE_RECS] = 0;
            page[NDX_PAGE_RECS + 1] = (common + suffix) as u8;
            page[NDX_PAGE_RECS + 2] = datalen;
            page[NDX_PAGE_RECS + 3..NDX_PAGE_RECS + 3 + common].copy_from_slice(&key2[..common]);
            set_pg_len(page, newlen);
            shift
        };

        // A root split makes a page one level up whose only record is
        // the rightmost sentinel pointing at the old root; the separator
        // for the new page is inserted there by the caller.
        if level as i32 == self.rootlevel() {
            if level + 1 >= NDX_MAX_DEPTH {
                return Err(self.fail(IsamError::Structural("tree too deep".into())));
            }
            let rootpageno = self.new_page()?;
            {
                let rootpage = self.page_mut(rootpageno)?;
                rootpage[NDX_PAGE_LEVEL] = (level + 1) as u8;
                rootpage[NDX_PAGE_TAIL] = 6;
                set_pg_len(rootpage, NDX_PAGE_RECS + 6);
                rootpage[4] = 0;
                rootpage[5] = 0;
                rootpage[6] = 3;
                let at = 7;
                let (a, b, c) = (pageno as u8, (pageno >> 8) as u8, (pageno >> 16) as u8);
                rootpage[at] = a;
                rootpage[at + 1] = b;
                rootpage[at + 2] = c;
            }
            ist[level + 1] = Cache {
                pageno: rootpageno,
                offset: NDX_PAGE_RECS,
                common_prev: 0,
                common_next: 0,
            };
            self.set_hdr_u32(NDX_HDR_ROOTLEVEL, (level + 1) as u32);
            self.set_hdr_u32(NDX_HDR_ROOT, rootpageno);
        }

        // Re-point the remembered insert spot at whichever half it
        // landed in.
        if offset < newpagelen - 3 {
            ist[level].pageno = newpageno;
        } else if offset == newpagelen - 3 {
            ist[level].offset = NDX_PAGE_RECS;
            ist[level].common_prev = 0;
        } else {
            ist[level].offset -= shift;
        }

        Ok((key2, newpageno))
    }

    // ── enumerate / check ───────────────────────────────────────────

    /// Visit every `(key, data)` record in key order (duplicates in
    /// insertion order). The callback returns `false` to abort; the
    /// result tells whether it did. The callback must not mutate the
    /// index.
    pub fn enumerate<F>(&self, mut cb: F) -> Result<bool, IsamError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let mut run = WalkRun::new(self.nbpages(), None);
        let mut visit: Option<&mut dyn FnMut(&[u8], &[u8]) -> bool> = Some(&mut cb);
        let aborted = self.walk_page(
            &mut run,
            self.root(),
            self.rootlevel(),
            &[],
            NDX_CHECK_ISRIGHTMOST,
            &mut visit,
        )?;
        if let Some(msg) = run.first.take() {
            return Err(self.fail(IsamError::Structural(msg)));
        }
        Ok(aborted)
    }

    /// Validate the header, and with `NDX_CHECK_ALL` or
    /// `NDX_CHECK_PAGES` walk the whole tree, verifying page levels,
    /// key order, prefix coding and child pointers, and comparing the
    /// visited page and key totals against the header counters. Issues
    /// are written to `out`; the first is also returned as the error.
    pub fn check(&self, flags: u32, out: &mut dyn Write) -> Result<(), IsamError> {
        let hdr = self.hdr();
        if hdr.len() < 72 || hdr[NDX_HDR_MAGIC..NDX_HDR_MAGIC + 4] != NDX_MAGIC {
            return Err(self.fail(IsamError::CorruptHeader("invalid magic number".into())));
        }
        let (major, minor) = self.version();
        if (major, minor) != (NDX_MAJOR, NDX_MINOR) && (major, minor) != (0, 2) {
            return Err(self.fail(IsamError::CorruptHeader(format!(
                "invalid version number: {}.{}",
                major, minor
            ))));
        }
        let pagesize = self.hdr_u32(NDX_HDR_PAGESIZE);
        if !(256..=65536).contains(&pagesize) {
            return Err(self.fail(IsamError::CorruptHeader(format!(
                "invalid pagesize: {}",
                pagesize
            ))));
        }
        let pageshift = self.hdr_u32(NDX_HDR_PAGESHIFT);
        if pageshift > NDX_MAX_PAGESHIFT || 1u64 << pageshift != pagesize as u64 {
            return Err(self.fail(IsamError::CorruptHeader(format!(
                "invalid pagesize: {} != (1 << {})",
                pagesize, pageshift
            ))));
        }
        let nbpages = self.nbpages();
        if (nbpages as u64) << self.pageshift > self.file.len() {
            return Err(self.fail(IsamError::CorruptHeader(format!(
                "incorrect page number {}, filesize={}",
                nbpages,
                self.file.len()
            ))));
        }
        let root = self.root();
        let rootlevel = self.rootlevel();
        if root < 1 || root >= nbpages {
            return Err(self.fail(IsamError::CorruptHeader(format!(
                "incorrect root page {}, nbpages={}",
                root, nbpages
            ))));
        }
        if !(0..NDX_MAX_DEPTH as i32).contains(&rootlevel) {
            return Err(self.fail(IsamError::CorruptHeader(format!(
                "incorrect root level {}",
                rootlevel
            ))));
        }
        if self.minkeylen() < 1
            || self.maxkeylen() > NDX_MAX_KEYLEN
            || self.maxkeylen() < self.minkeylen()
        {
            return Err(self.fail(IsamError::CorruptHeader(format!(
                "invalid key size range {}..{}",
                self.minkeylen(),
                self.maxkeylen()
            ))));
        }
        if self.maxdatalen() > NDX_MAX_DATALEN || self.maxdatalen() < self.mindatalen() {
            return Err(self.fail(IsamError::CorruptHeader(format!(
                "invalid data size range {}..{}",
                self.mindatalen(),
                self.maxdatalen()
            ))));
        }

        if flags & (NDX_CHECK_ALL | NDX_CHECK_PAGES) != 0 {
            let mut run = WalkRun::new(nbpages, Some(out));
            let mut visit: Option<&mut dyn FnMut(&[u8], &[u8]) -> bool> = None;
            self.walk_page(
                &mut run,
                root,
                rootlevel,
                &[],
                flags | NDX_CHECK_ISRIGHTMOST,
                &mut visit,
            )?;
            // the header page is not walked
            if run.npages + 1 != nbpages {
                run.report(format!(
                    "{} lost pages",
                    nbpages as i64 - run.npages as i64 - 1
                ));
            }
            if run.nkeys != self.nbkeys() {
                run.report(format!(
                    "inconsistent key number: nbkeys={}, actual={}",
                    self.nbkeys(),
                    run.nkeys
                ));
            }
            if let Some(msg) = run.first.take() {
                return Err(self.fail(IsamError::Structural(msg)));
            }
        }
        Ok(())
    }

    /// Recursive walker shared by [`check`](Self::check) and
    /// [`enumerate`](Self::enumerate). Returns whether the callback
    /// aborted.
    fn walk_page(
        &self,
        run: &mut WalkRun<'_>,
        pageno: u32,
        level: i32,
        upkey: &[u8],
        flags: u32,
        cb: &mut Option<&mut dyn FnMut(&[u8], &[u8]) -> bool>,
    ) -> Result<bool, IsamError> {
        if pageno < 1 || pageno as usize >= run.states.len() {
            run.report(format!("page {}: out of bounds", pageno));
            return Ok(false);
        }
        if run.states[pageno as usize] != 0 {
            run.report(format!("page {}: referenced twice", pageno));
            return Ok(false);
        }
        run.states[pageno as usize] = 1;

        let page = self.page_checked(pageno)?;
        let pagelen = pg_len(page);
        let tail = pg_tail(page);

        if level != pg_level(page) as i32 {
            run.report(format!(
                "page {}: invalid level={}, expected={}",
                pageno,
                pg_level(page),
                level
            ));
            run.states[pageno as usize] = 3;
            return Ok(false);
        }

        let want_tail = if flags & NDX_CHECK_ISRIGHTMOST != 0 && level > 0 { 6 } else { 3 };
        if tail != want_tail {
            run.report(format!(
                "page {}: incorrect page tail={}, expected={}",
                pageno, tail, want_tail
            ));
        }

        let mut key = vec![0u8; 2 * (NDX_MAX_KEYLEN + 1)];
        let mut keylen = 0usize;
        let mut p = NDX_PAGE_RECS;
        let p2 = pagelen - tail;

        while p < p2 {
            let c = page[p] as usize;
            let s = page[p + 1] as usize;
            let d = page[p + 2] as usize;
            let p1 = p + 3 + s + d;
            if p1 > p2 {
                run.report(format!("page {}:{}: key data overflow", pageno, p));
                run.states[pageno as usize] = 3;
                return Ok(false);
            }
            if c > keylen {
                run.report(format!("page {}:{}: incorrect common={} keylen={}", pageno, p, c, keylen));
                run.states[pageno as usize] = 3;
                return Ok(false);
            }
            if c + s == 0 {
                run.report(format!("page {}:{}: invalid empty key", pageno, p));
            }
            if c + s > NDX_MAX_KEYLEN {
                run.report(format!(
                    "page {}:{}: incorrect suffix={} keylen={}",
                    pageno,
                    p,
                    s,
                    c + s
                ));
                run.states[pageno as usize] = 3;
                return Ok(false);
            }
            if c < keylen {
                if s == 0 || page[p + 3] < key[c] {
                    run.report(format!("page {}:{}: key out of order", pageno, p));
                } else if page[p + 3] == key[c] {
                    run.report(format!("page {}:{}: incorrect prefix", pageno, p));
                }
            }
            key[c..c + s].copy_from_slice(&page[p + 3..p + 3 + s]);
            keylen = c + s;

            if level > 0 {
                if d != 3 {
                    run.report(format!("page {}:{}: incorrect datalen={}", pageno, p, d));
                } else {
                    let child = get_pageno(&page[p + 3 + s..p + 3 + s + 3]);
                    if child < 1 || child >= self.nbpages() {
                        run.report(format!("page {}:{}: incorrect child page={}", pageno, p, child));
                    } else if self.walk_page(
                        run,
                        child,
                        level - 1,
                        &key[..keylen],
                        flags & !NDX_CHECK_ISRIGHTMOST,
                        cb,
                    )? {
                        return Ok(true);
                    }
                }
            } else {
                run.nkeys += 1;
                if let Some(f) = cb.as_mut() {
                    if !f(&key[..keylen], &page[p + 3 + s..p + 3 + s + d]) {
                        return Ok(true);
                    }
                }
            }
            p = p1;
        }

        // sentinel
        if page[p] != 0 || page[p + 1] != 0 || page[p + 2] as usize != tail - 3 {
            run.report(format!(
                "page {}:{}: invalid tail {} {} {}",
                pageno,
                p,
                page[p],
                page[p + 1],
                page[p + 2]
            ));
        }
        if tail == 6 {
            let child = get_pageno(&page[p + 3..p + 6]);
            if child < 1 || child >= self.nbpages() {
                run.report(format!("page {}:{}: incorrect child page={}", pageno, p, child));
            } else if self.walk_page(run, child, level - 1, upkey, flags | NDX_CHECK_ISRIGHTMOST, cb)? {
                return Ok(true);
            }
        } else if !upkey.is_empty() && key[..keylen] != *upkey {
            run.report(format!(
                "page {}:{}: upkey differs from last key {} != {}",
                pageno,
                p,
                fmt_key_bytes(&key[..keylen]),
                fmt_key_bytes(upkey)
            ));
        }

        run.npages += 1;
        run.states[pageno as usize] = 2;
        Ok(false)
    }

    // ── dump ────────────────────────────────────────────────────────

    /// Print the header summary, then per `flags` the key/data stream
    /// (`NDX_DUMP_ENUMERATE`) and the raw pages (`NDX_DUMP_PAGES`,
    /// `NDX_DUMP_KEYS`, `NDX_DUMP_ALL`).
    pub fn dump(&self, flags: u32, out: &mut dyn Write) -> io::Result<()> {
        let info = self.info();
        writeln!(out, "NDX magic   : ISGX")?;
        writeln!(out, "    version : {}.{}", info.major, info.minor)?;
        writeln!(out, "    pagesize: {} (1 << {})", info.pagesize, info.pageshift)?;
        writeln!(out, "    rootpage: {} (level {})", info.root, info.rootlevel)?;
        writeln!(out, "    nbpages : {}", info.nbpages)?;
        writeln!(out, "    nbkeys  : {}", info.nbkeys)?;
        writeln!(out, "    keylen  : {}..{}", info.minkeylen, info.maxkeylen)?;
        writeln!(out, "    datalen : {}..{}", info.mindatalen, info.maxdatalen)?;

        if flags & NDX_DUMP_ENUMERATE != 0 {
            writeln!(out)?;
            let mut lines: Vec<String> = Vec::new();
            let _ = self.enumerate(|key, data| {
                lines.push(format!(
                    "key: {}, data: {}",
                    fmt_key_bytes(key),
                    fmt_data_bytes(data)
                ));
                true
            });
            for line in lines {
                writeln!(out, "{}", line)?;
            }
        }

        if flags & (NDX_DUMP_ALL | NDX_DUMP_KEYS | NDX_DUMP_PAGES) != 0 {
            writeln!(out)?;
            for pageno in 1..self.nbpages() {
                self.dump_page(pageno, flags, out)?;
            }
        }
        Ok(())
    }

    /// Print one page: header line, and with `NDX_DUMP_KEYS` or
    /// `NDX_DUMP_ALL` every record with its reconstructed key.
    pub fn dump_page(&self, pageno: u32, flags: u32, out: &mut dyn Write) -> io::Result<()> {
        let page = match self.page(pageno) {
            Ok(p) => p,
            Err(e) => {
                writeln!(out, "Page {}: unreadable ({})", pageno, e)?;
                return Ok(());
            }
        };
        let pagelen = pg_len(page);
        writeln!(
            out,
            "Page {}: level={} tail={}, pagelen={}",
            pageno,
            pg_level(page),
            pg_tail(page),
            pagelen
        )?;

        if flags & (NDX_DUMP_ALL | NDX_DUMP_KEYS) != 0 {
            let mut key = vec![0u8; NDX_MAX_KEYLEN + 1];
            let mut p = NDX_PAGE_RECS;
            let p1 = pagelen.min(self.pagesize);
            while p + 3 <= p1 {
                let c = page[p] as usize;
                let s = page[p + 1] as usize;
                let d = page[p + 2] as usize;
                write!(out, "    {}: key {} {} {}", p, c, s, d)?;
                if c + s > NDX_MAX_KEYLEN {
                    writeln!(out, " invalid key length: {}", c + s)?;
                    break;
                }
                if p + 3 + s + d > p1 {
                    writeln!(out, " record overflows page")?;
                    break;
                }
                key[c..c + s].copy_from_slice(&page[p + 3..p + 3 + s]);
                let keylen = c + s;
                if keylen > 0 && (keylen > c || flags & NDX_DUMP_ALL != 0) {
                    write!(out, " {}", fmt_key_bytes(&key[..keylen]))?;
                }
                if d > 0 {
                    write!(out, " -- {}", fmt_data_bytes(&page[p + 3 + s..p + 3 + s + d]))?;
                }
                writeln!(out)?;
                p += 3 + s + d;
                if p == p1 {
                    break;
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

impl Drop for Ndx {
    fn drop(&mut self) {
        let _ = self.do_close();
    }
}

/// Scratch state for one walk: page states (0 unvisited, 1 visiting,
/// 2 ok, 3 corrupt), visited totals, and the error channel.
struct WalkRun<'a> {
    states: Vec<u8>,
    npages: u32,
    nkeys: u32,
    first: Option<String>,
    out: Option<&'a mut dyn Write>,
}

impl<'a> WalkRun<'a> {
    fn new(nbpages: u32, out: Option<&'a mut dyn Write>) -> Self {
        WalkRun {
            states: vec![0; nbpages as usize],
            npages: 0,
            nkeys: 0,
            first: None,
            out,
        }
    }

    fn report(&mut self, msg: String) {
        if let Some(out) = self.out.as_mut() {
            let _ = writeln!(out, "{}", msg);
        }
        if self.first.is_none() {
            self.first = Some(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scratch(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    fn checked(ndx: &Ndx) {
        ndx.check(NDX_CHECK_ALL, &mut io::sink()).unwrap();
    }

    #[test]
    fn test_create_empty_is_sound() {
        let (_dir, path) = scratch("t.ndx");
        let ndx = Ndx::create(&path, &NdxParams::default()).unwrap();
        assert_eq!(ndx.info().nbpages, 2);
        assert_eq!(ndx.info().nbkeys, 0);
        checked(&ndx);
        let mut out = Vec::new();
        assert_eq!(ndx.fetch(b"absent", &mut out).unwrap(), 0);
    }

    #[test]
    fn test_push_fetch_single() {
        let (_dir, path) = scratch("t.ndx");
        let mut ndx = Ndx::create(&path, &NdxParams::default()).unwrap();
        ndx.push(b"hello", b"world").unwrap();
        checked(&ndx);
        let mut out = Vec::new();
        assert_eq!(ndx.fetch(b"hello", &mut out).unwrap(), 1);
        assert_eq!(&out, b"world");
    }

    #[test]
    fn test_empty_data_records_are_valid() {
        let (_dir, path) = scratch("t.ndx");
        let mut ndx = Ndx::create(&path, &NdxParams::default()).unwrap();
        ndx.push(b"tag", b"").unwrap();
        checked(&ndx);
        let mut out = Vec::new();
        assert_eq!(ndx.fetch(b"tag", &mut out).unwrap(), 1);
        assert!(out.is_empty());
    }

    #[test]
    fn test_duplicates_preserve_push_order() {
        let (_dir, path) = scratch("t.ndx");
        let mut ndx = Ndx::create(&path, &NdxParams::default()).unwrap();
        ndx.push(b"cat", &[1]).unwrap();
        ndx.push(b"cat", &[2]).unwrap();
        ndx.push(b"cat", &[3]).unwrap();
        checked(&ndx);

        let mut out = Vec::new();
        assert_eq!(ndx.fetch(b"cat", &mut out).unwrap(), 3);
        assert_eq!(out, vec![1, 2, 3]);

        let mut seen = Vec::new();
        ndx.enumerate(|key, data| {
            seen.push((key.to_vec(), data.to_vec()));
            true
        })
        .unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(k, _)| k == b"cat"));
        assert_eq!(seen[0].1, vec![1]);
        assert_eq!(seen[2].1, vec![3]);
    }

    #[test]
    fn test_length_bounds_are_enforced() {
        let (_dir, path) = scratch("t.ndx");
        let params = NdxParams { minkeylen: 2, maxkeylen: 8, mindatalen: 1, maxdatalen: 4, ..Default::default() };
        let mut ndx = Ndx::create(&path, &params).unwrap();
        assert!(matches!(ndx.push(b"x", b"d"), Err(IsamError::Argument(_))));
        assert!(matches!(ndx.push(b"longerthan8", b"d"), Err(IsamError::Argument(_))));
        assert!(matches!(ndx.push(b"ok", b""), Err(IsamError::Argument(_))));
        assert!(matches!(ndx.push(b"ok", b"12345"), Err(IsamError::Argument(_))));
        assert!(ndx.last_error().is_some());
        ndx.push(b"ok", b"dat").unwrap();
    }

    #[test]
    fn test_ascending_load_splits_and_enumerates_sorted() {
        let (_dir, path) = scratch("t.ndx");
        let mut ndx = Ndx::create(&path, &NdxParams::default()).unwrap();
        for i in 0..5000u32 {
            let key = format!("key-{:08}", i);
            ndx.push(key.as_bytes(), &i.to_le_bytes()).unwrap();
        }
        checked(&ndx);
        assert!(ndx.info().rootlevel >= 1);
        assert_eq!(ndx.info().nbkeys, 5000);

        let mut last: Option<Vec<u8>> = None;
        let mut count = 0usize;
        ndx.enumerate(|key, _| {
            if let Some(prev) = &last {
                assert!(key > prev.as_slice());
            }
            last = Some(key.to_vec());
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 5000);
    }

    #[test]
    fn test_random_load_round_trips() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let (_dir, path) = scratch("t.ndx");
        let mut ndx = Ndx::create(&path, &NdxParams::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut keys = Vec::new();
        for i in 0..3000u32 {
            let len = rng.gen_range(1..=24);
            let key: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect();
            ndx.push(&key, &i.to_le_bytes()).unwrap();
            keys.push((key, i));
            if i % 500 == 0 {
                checked(&ndx);
            }
        }
        checked(&ndx);

        for (key, i) in keys.iter().take(200) {
            let mut out = Vec::new();
            let n = ndx.fetch(key, &mut out).unwrap();
            assert!(n >= 1);
            let found = out.chunks(4).any(|c| c == i.to_le_bytes());
            assert!(found, "value {} not found under {:?}", i, key);
        }
    }

    #[test]
    fn test_enumerate_abort() {
        let (_dir, path) = scratch("t.ndx");
        let mut ndx = Ndx::create(&path, &NdxParams::default()).unwrap();
        for i in 0..100u32 {
            ndx.push(format!("k{:04}", i).as_bytes(), &[1]).unwrap();
        }
        let mut count = 0;
        let aborted = ndx
            .enumerate(|_, _| {
                count += 1;
                count < 10
            })
            .unwrap();
        assert!(aborted);
        assert_eq!(count, 10);
    }

    #[test]
    fn test_reopen_round_trip_and_user_version() {
        let (_dir, path) = scratch("t.ndx");
        {
            let mut ndx = Ndx::create(&path, &NdxParams::default()).unwrap();
            ndx.set_user_version(3, 14).unwrap();
            for i in 0..1000u32 {
                ndx.push(format!("w{:05}", i).as_bytes(), &i.to_le_bytes()).unwrap();
            }
            ndx.close().unwrap();
        }
        let ndx = Ndx::open(&path, false).unwrap();
        assert_eq!(ndx.user_version(), (3, 14));
        assert_eq!(ndx.info().nbkeys, 1000);
        checked(&ndx);
        let mut out = Vec::new();
        assert_eq!(ndx.fetch(b"w00777", &mut out).unwrap(), 1);
        assert_eq!(out, 777u32.to_le_bytes());
    }

    #[test]
    fn test_u64_key_wrappers() {
        let (_dir, path) = scratch("t.ndx");
        let mut ndx = Ndx::create(&path, &NdxParams::default()).unwrap();
        ndx.push_u64(0xdead_beef, b"x").unwrap();
        let mut out = Vec::new();
        assert_eq!(ndx.fetch_u64(0xdead_beef, &mut out).unwrap(), 1);
        assert_eq!(&out, b"x");
    }

    #[test]
    fn test_small_pages_split_deeply() {
        let (_dir, path) = scratch("t.ndx");
        let params = NdxParams { pageshift: 9, maxkeylen: 64, maxdatalen: 64, ..Default::default() };
        let mut ndx = Ndx::create(&path, &params).unwrap();
        for i in 0..8000u32 {
            ndx.push(format!("{:06}", i).as_bytes(), &i.to_le_bytes()).unwrap();
        }
        checked(&ndx);
        assert!(ndx.info().rootlevel >= 2);
        let mut out = Vec::new();
        assert_eq!(ndx.fetch(b"007999", &mut out).unwrap(), 1);
    }

    #[test]
    fn test_create_rejects_bad_params() {
        let (_dir, path) = scratch("t.ndx");
        assert!(Ndx::create(&path, &NdxParams { pageshift: 7, ..Default::default() }).is_err());
        assert!(Ndx::create(&path, &NdxParams { minkeylen: 0, ..Default::default() }).is_err());
        assert!(Ndx::create(
            &path,
            &NdxParams { pageshift: 8, maxkeylen: 255, maxdatalen: 255, ..Default::default() }
        )
        .is_err());
    }

    #[test]
    fn test_error_sink_mirrors_messages() {
        use std::rc::Rc;

        struct CollectSink(Rc<RefCell<Vec<String>>>);
        impl ErrorSink for CollectSink {
            fn report(&mut self, msg: &str) {
                self.0.borrow_mut().push(msg.to_string());
            }
        }

        let (_dir, path) = scratch("t.ndx");
        let mut ndx = Ndx::create(&path, &NdxParams::default()).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        ndx.set_error_sink(Some(Box::new(CollectSink(seen.clone()))));

        assert!(ndx.push(&[], b"data").is_err());
        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].contains("key length"));
        assert_eq!(ndx.last_error().unwrap(), seen.borrow()[0]);
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let (_dir, path) = scratch("t.ndx");
        Ndx::create(&path, &NdxParams::default()).unwrap().close().unwrap();
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(0)).unwrap();
            f.write_all(b"NOPE").unwrap();
        }
        assert!(matches!(Ndx::open(&path, false), Err(IsamError::CorruptHeader(_))));
    }

    #[test]
    fn test_dump_runs() {
        let (_dir, path) = scratch("t.ndx");
        let mut ndx = Ndx::create(&path, &NdxParams::default()).unwrap();
        ndx.push(b"alpha", &[1, 0, 0, 0]).unwrap();
        ndx.push(b"beta", &[2, 0, 0, 0]).unwrap();
        let mut out = Vec::new();
        ndx.dump(NDX_DUMP_ENUMERATE | NDX_DUMP_KEYS, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("NDX magic"));
        assert!(text.contains("\"alpha\""));
    }
}
