//! BT64: a B+-tree indexed by 64-bit unsigned keys.
//!
//! Values are opaque byte blobs stored inline in the leaves. A key may
//! carry several records; [`Bt64::push`] appends into the key's first
//! record while it has room and chunks larger values transparently, so
//! [`Bt64::fetch`] returns the concatenation of everything pushed under
//! the key.
//!
//! On disk the file is a sequence of 1 KiB pages: a header page followed
//! by data pages addressed through 32-bit tagged pointers (bit 31
//! distinguishes node from leaf, the low 24 bits are the page index in
//! the data area). Inner nodes hold up to [`BT_ARITY`] keys where
//! `keys[i]` is the maximum key reachable through `ptrs[i]`; leaves hold
//! packed `(keylen=8, key, dlen, data)` records in ascending key order.
//! Every page carries a `next` pointer forming a per-level linked list,
//! `NIL` on the rightmost page. Unused pages sit on a singly linked
//! freelist whose on-disk terminator is 0; `NIL` appears only in
//! allocated pages.
//!
//! Page slices obtained from the mapping die at the next page
//! allocation (the file may grow and remap), so every operation works
//! with page indices and re-derives its slices after allocating.

use std::io::{self, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::isam::constants::*;
use crate::isam::pagefile::PageFile;
use crate::isam::process::{probe_lock, LockProbe, ProcessClock, SystemClock};
use crate::util::fmt::bt64_key_str;
use crate::IsamError;

/// Untagged page index of a page pointer.
pub(crate) fn btpp_offs(ptr: u32) -> u32 {
    ptr & BTPP_OFFS_MASK
}

/// True when the pointer targets a node page.
pub(crate) fn btpp_is_node(ptr: u32) -> bool {
    ptr & BTPP_NODE_MASK != 0
}

// ── raw page field access ───────────────────────────────────────────
//
// Leaves and nodes share the first field (`next`); the allocator relies
// on that to relink free pages without knowing their former kind.

pub(crate) fn page_next(p: &[u8]) -> u32 {
    LittleEndian::read_u32(&p[BT_LEAF_NEXT..BT_LEAF_NEXT + 4])
}

fn set_page_next(p: &mut [u8], v: u32) {
    LittleEndian::write_u32(&mut p[BT_LEAF_NEXT..BT_LEAF_NEXT + 4], v);
}

pub(crate) fn leaf_used(p: &[u8]) -> usize {
    LittleEndian::read_u32(&p[BT_LEAF_USED..BT_LEAF_USED + 4]) as usize
}

fn set_leaf_used(p: &mut [u8], v: usize) {
    LittleEndian::write_u32(&mut p[BT_LEAF_USED..BT_LEAF_USED + 4], v as u32);
}

pub(crate) fn leaf_data(p: &[u8]) -> &[u8] {
    &p[BT_LEAF_DATA..]
}

fn leaf_data_mut(p: &mut [u8]) -> &mut [u8] {
    &mut p[BT_LEAF_DATA..]
}

pub(crate) fn node_nbkeys(p: &[u8]) -> usize {
    LittleEndian::read_u32(&p[BT_NODE_NBKEYS..BT_NODE_NBKEYS + 4]) as usize
}

fn set_node_nbkeys(p: &mut [u8], v: usize) {
    LittleEndian::write_u32(&mut p[BT_NODE_NBKEYS..BT_NODE_NBKEYS + 4], v as u32);
}

pub(crate) fn node_ptr(p: &[u8], i: usize) -> u32 {
    let at = BT_NODE_PTRS + 4 * i;
    LittleEndian::read_u32(&p[at..at + 4])
}

fn set_node_ptr(p: &mut [u8], i: usize, v: u32) {
    let at = BT_NODE_PTRS + 4 * i;
    LittleEndian::write_u32(&mut p[at..at + 4], v);
}

pub(crate) fn node_key(p: &[u8], i: usize) -> u64 {
    let at = BT_NODE_KEYS + 8 * i;
    LittleEndian::read_u64(&p[at..at + 8])
}

fn set_node_key(p: &mut [u8], i: usize, v: u64) {
    let at = BT_NODE_KEYS + 8 * i;
    LittleEndian::write_u64(&mut p[at..at + 8], v);
}

/// Move `count` keys and `count + 1` child pointers from `src` to `dst`.
fn node_shift(p: &mut [u8], dst: usize, src: usize, count: usize) {
    debug_assert!(dst + count <= BT_ARITY && src + count <= BT_ARITY);
    let pfrom = BT_NODE_PTRS + 4 * src;
    let pto = BT_NODE_PTRS + 4 * dst;
    p.copy_within(pfrom..pfrom + 4 * (count + 1), pto);
    if count > 0 {
        let kfrom = BT_NODE_KEYS + 8 * src;
        let kto = BT_NODE_KEYS + 8 * dst;
        p.copy_within(kfrom..kfrom + 8 * count, kto);
    }
}

pub(crate) fn rec_key(d: &[u8], pos: usize) -> u64 {
    LittleEndian::read_u64(&d[pos + 1..pos + 9])
}

pub(crate) fn rec_dlen(d: &[u8], pos: usize) -> usize {
    d[pos + 1 + 8] as usize
}

pub(crate) fn rec_len(d: &[u8], pos: usize) -> usize {
    BT_REC_HDR + rec_dlen(d, pos)
}

fn structural(msg: String) -> IsamError {
    IsamError::Structural(msg)
}

/// One `(key, span)` entry of a range fetch; `dpos`/`dlen` locate the
/// key's concatenated data inside [`KeyRange::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRangeRec {
    pub key: u64,
    pub dpos: usize,
    pub dlen: usize,
}

/// Result of [`Bt64::fetch_range`]: one record per distinct key plus the
/// backing data bytes.
#[derive(Debug, Default)]
pub struct KeyRange {
    pub keys: Vec<KeyRangeRec>,
    pub data: Vec<u8>,
}

impl KeyRange {
    /// The data span of entry `i`.
    pub fn data_of(&self, i: usize) -> &[u8] {
        let r = &self.keys[i];
        &self.data[r.dpos..r.dpos + r.dlen]
    }
}

/// Header summary, also the `--json` payload of `isam info`.
#[derive(Debug, Clone, Serialize)]
pub struct Bt64Info {
    pub major: u8,
    pub minor: u8,
    pub root: u32,
    pub nbpages: u32,
    pub freelist: u32,
    pub depth: i16,
    pub wrlock_pid: u16,
    pub wrlock_time: u64,
}

/// An open BT64 index.
pub struct Bt64 {
    file: PageFile,
    clock: Box<dyn ProcessClock>,
    owns_lock: bool,
}

impl std::fmt::Debug for Bt64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bt64").field("owns_lock", &self.owns_lock).finish_non_exhaustive()
    }
}

impl Bt64 {
    // ── lifecycle ───────────────────────────────────────────────────

    /// Create (or truncate) an index at `path` and open it for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, IsamError> {
        Self::create_with_clock(path, Box::new(SystemClock))
    }

    /// [`create`](Self::create) with an injected [`ProcessClock`].
    pub fn create_with_clock<P: AsRef<Path>>(
        path: P,
        clock: Box<dyn ProcessClock>,
    ) -> Result<Self, IsamError> {
        let file = PageFile::create(path, BT_GROW_SIZE as u64)?;
        let mut bt = Bt64 { file, clock, owns_lock: false };

        {
            let hdr = bt.file.page_mut(0, BT_PAGE_SIZE)?;
            hdr[BT_HDR_MAGIC..BT_HDR_MAGIC + 4].copy_from_slice(&BT_MAGIC);
            hdr[BT_HDR_MAJOR] = BT_VERSION_MAJOR;
            hdr[BT_HDR_MINOR] = BT_VERSION_MINOR;
        }
        bt.set_root(0); // the initial root is an empty leaf
        bt.set_nbpages(BT_INIT_NBPAGES as u32 - 1);
        bt.set_freelist(1);
        bt.set_depth(0);
        bt.set_wrlock(0, 0);

        {
            let root = bt.page_mut(0)?;
            set_page_next(root, BTPP_NIL);
            set_leaf_used(root, 0);
        }
        // Free pages chain through `next` and terminate on 0.
        let last = BT_INIT_NBPAGES as u32 - 2;
        for idx in 1..last {
            set_page_next(bt.page_mut(idx)?, idx + 1);
        }
        set_page_next(bt.page_mut(last)?, 0);

        bt.take_writer_lock()?;
        bt.file.sync()?;
        bt.file.release_open_lock()?;
        Ok(bt)
    }

    /// Open an existing index. With `check`, the full integrity pass runs
    /// before the open returns; damage fails the open.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool, check: bool) -> Result<Self, IsamError> {
        Self::open_with_clock(path, writable, check, Box::new(SystemClock))
    }

    /// [`open`](Self::open) with an injected [`ProcessClock`].
    pub fn open_with_clock<P: AsRef<Path>>(
        path: P,
        writable: bool,
        check: bool,
        clock: Box<dyn ProcessClock>,
    ) -> Result<Self, IsamError> {
        let file = PageFile::open(path, writable)?;
        let mut bt = Bt64 { file, clock, owns_lock: false };

        bt.check_header(writable)
            .map_err(|e| IsamError::CorruptHeader(e.message().to_string()))?;
        if check {
            bt.check_integrity(writable, &mut io::sink())
                .map_err(|e| IsamError::CorruptHeader(e.message().to_string()))?;
        }

        if writable {
            let (pid, stamp) = bt.wrlock();
            match probe_lock(bt.clock.as_ref(), pid as u32, stamp) {
                LockProbe::Held => {
                    return Err(IsamError::WriterLocked(format!(
                        "{}: write lock held by pid {}",
                        bt.file.path().display(),
                        pid
                    )));
                }
                LockProbe::Stale | LockProbe::Unlocked => bt.take_writer_lock()?,
            }
            bt.file.sync()?;
        }
        bt.file.release_open_lock()?;
        Ok(bt)
    }

    /// Close the index. A writer clears its in-header lock and syncs the
    /// mapping before unmapping. Dropping without `close` does the same
    /// but swallows errors.
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
        self.set_wrlock(pid as u16, stamp);
        self.owns_lock = true;
        Ok(())
    }

    /// Header summary.
    pub fn info(&self) -> Bt64Info {
        let hdr = self.hdr();
        let (pid, stamp) = self.wrlock();
        Bt64Info {
            major: hdr[BT_HDR_MAJOR],
            minor: hdr[BT_HDR_MINOR],
            root: self.root(),
            nbpages: self.nbpages(),
            freelist: self.freelist(),
            depth: self.depth(),
            wrlock_pid: pid,
            wrlock_time: stamp,
        }
    }

    // ── header access ───────────────────────────────────────────────

    fn hdr(&self) -> &[u8] {
        &self.file.bytes()[..BT_PAGE_SIZE]
    }

    fn root(&self) -> u32 {
        LittleEndian::read_u32(&self.hdr()[BT_HDR_ROOT..])
    }

    fn set_root(&mut self, v: u32) {
        let hdr = self.file.page_mut(0, BT_PAGE_SIZE).expect("header page");
        LittleEndian::write_u32(&mut hdr[BT_HDR_ROOT..BT_HDR_ROOT + 4], v);
    }

    fn nbpages(&self) -> u32 {
        LittleEndian::read_u32(&self.hdr()[BT_HDR_NBPAGES..])
    }

    fn set_nbpages(&mut self, v: u32) {
        let hdr = self.file.page_mut(0, BT_PAGE_SIZE).expect("header page");
        LittleEndian::write_u32(&mut hdr[BT_HDR_NBPAGES..BT_HDR_NBPAGES + 4], v);
    }

    fn freelist(&self) -> u32 {
        LittleEndian::read_u32(&self.hdr()[BT_HDR_FREELIST..])
    }

    fn set_freelist(&mut self, v: u32) {
        let hdr = self.file.page_mut(0, BT_PAGE_SIZE).expect("header page");
        LittleEndian::write_u32(&mut hdr[BT_HDR_FREELIST..BT_HDR_FREELIST + 4], v);
    }

    fn depth(&self) -> i16 {
        LittleEndian::read_i16(&self.hdr()[BT_HDR_DEPTH..])
    }

    fn set_depth(&mut self, v: i16) {
        let hdr = self.file.page_mut(0, BT_PAGE_SIZE).expect("header page");
        LittleEndian::write_i16(&mut hdr[BT_HDR_DEPTH..BT_HDR_DEPTH + 2], v);
    }

    fn wrlock(&self) -> (u16, u64) {
        let hdr = self.hdr();
        (
            LittleEndian::read_u16(&hdr[BT_HDR_WRLOCK..]),
            LittleEndian::read_u64(&hdr[BT_HDR_WRLOCKT..]),
        )
    }

    fn set_wrlock(&mut self, pid: u16, stamp: u64) {
        let hdr = self.file.page_mut(0, BT_PAGE_SIZE).expect("header page");
        LittleEndian::write_u16(&mut hdr[BT_HDR_WRLOCK..BT_HDR_WRLOCK + 2], pid);
        LittleEndian::write_u64(&mut hdr[BT_HDR_WRLOCKT..BT_HDR_WRLOCKT + 8], stamp);
    }

    // ── page access ─────────────────────────────────────────────────

    fn page(&self, ptr: u32) -> Result<&[u8], IsamError> {
        let offs = btpp_offs(ptr);
        if offs == BTPP_NIL || offs >= self.nbpages() {
            return Err(structural(format!("page pointer {:#010x} out of bounds", ptr)));
        }
        self.file.page(1 + offs, BT_PAGE_SIZE)
    }

    fn page_mut(&mut self, ptr: u32) -> Result<&mut [u8], IsamError> {
        let offs = btpp_offs(ptr);
        if offs == BTPP_NIL || offs >= self.nbpages() {
            return Err(structural(format!("page pointer {:#010x} out of bounds", ptr)));
        }
        self.file.page_mut(1 + offs, BT_PAGE_SIZE)
    }

    /// Leaf `used` with its bound enforced, so record walks cannot run
    /// off the page on corrupt input.
    fn checked_used(&self, ptr: u32) -> Result<usize, IsamError> {
        let used = leaf_used(self.page(ptr)?);
        if used > BT_LEAF_CAP {
            return Err(structural(format!(
                "leaf {:03}: used={} beyond capacity",
                btpp_offs(ptr),
                used
            )));
        }
        Ok(used)
    }

    /// Pop a page off the freelist, growing the file by one region when
    /// the freelist is empty. Invalidates every outstanding page slice.
    fn alloc_page(&mut self) -> Result<u32, IsamError> {
        if self.freelist() == 0 {
            self.file.grow(self.file.len() + BT_GROW_SIZE as u64)?;
            let from = self.nbpages();
            let grow = BT_GROW_NBPAGES as u32;
            self.set_nbpages(from + grow);
            self.set_freelist(from);
            for idx in from..from + grow - 1 {
                set_page_next(self.page_mut(idx)?, idx + 1);
            }
            set_page_next(self.page_mut(from + grow - 1)?, 0);
        }
        let page = self.freelist();
        let next = page_next(self.page(page)?);
        self.set_freelist(next);
        let p = self.page_mut(page)?;
        set_page_next(p, BTPP_NIL);
        set_leaf_used(p, 0);
        Ok(page)
    }

    // ── descent ─────────────────────────────────────────────────────

    /// Binary search for the first position whose key is `>= key`,
    /// breaking ties to the left.
    pub(crate) fn node_bsearch(p: &[u8], key: u64) -> usize {
        let mut l = 0usize;
        let mut r = node_nbkeys(p);
        while r > l {
            let i = (l + r) >> 1;
            match key.cmp(&node_key(p, i)) {
                std::cmp::Ordering::Less => r = i,
                std::cmp::Ordering::Greater => l = i + 1,
                std::cmp::Ordering::Equal => {
                    let mut i = i;
                    while i > 0 && node_key(p, i - 1) == key {
                        i -= 1;
                    }
                    return i;
                }
            }
        }
        l
    }

    /// Descend to the leaf covering `key`. When `path` is given it
    /// receives `(page, pos)` per level; `path[0]` is the leaf.
    fn find_leaf(
        &self,
        key: u64,
        mut path: Option<&mut [(u32, usize)]>,
    ) -> Result<u32, IsamError> {
        let mut page = self.root();
        for level in (1..=self.depth() as usize).rev() {
            if !btpp_is_node(page) {
                return Err(structural(format!(
                    "node.L{} page {:03} is not tagged",
                    level,
                    btpp_offs(page)
                )));
            }
            let node = self.page(page)?;
            let nbkeys = node_nbkeys(node);
            if nbkeys == 0 || nbkeys > BT_ARITY {
                return Err(structural(format!(
                    "node.L{} page {:03}: invalid nbkeys={}",
                    level,
                    btpp_offs(page),
                    nbkeys
                )));
            }
            let pos = Self::node_bsearch(node, key);
            if let Some(p) = path.as_deref_mut() {
                p[level] = (page, pos);
            }
            page = node_ptr(node, pos);
        }
        if let Some(p) = path {
            p[0] = (page, 0);
        }
        Ok(page)
    }

    /// Locate `key` in a leaf record area. Returns the offset of the
    /// first matching record, plus the insertion slot (the first record
    /// with a larger key, or end of the used area).
    pub(crate) fn leaf_findslot(d: &[u8], used: usize, key: u64) -> Result<(Option<usize>, usize), IsamError> {
        let mut pos = 0;
        while pos < used {
            if pos + BT_REC_HDR > used || d[pos] != 8 {
                return Err(structural(format!("leaf record at {} malformed", pos)));
            }
            match key.cmp(&rec_key(d, pos)) {
                std::cmp::Ordering::Greater => {}
                std::cmp::Ordering::Equal => return Ok((Some(pos), pos)),
                std::cmp::Ordering::Less => return Ok((None, pos)),
            }
            pos += rec_len(d, pos);
            if pos > used {
                return Err(structural(format!("leaf record at {} overflows used area", pos)));
            }
        }
        Ok((None, pos))
    }

    /// Last key stored in a leaf, 0 when empty.
    fn leaf_max_key(&self, ptr: u32) -> Result<u64, IsamError> {
        let used = self.checked_used(ptr)?;
        let d = leaf_data(self.page(ptr)?);
        let mut pos = 0;
        let mut keypos = None;
        while pos < used {
            if pos + BT_REC_HDR > used {
                return Err(structural(format!("leaf {:03} truncated record", btpp_offs(ptr))));
            }
            keypos = Some(pos);
            pos += rec_len(d, pos);
        }
        Ok(match keypos {
            Some(p) => rec_key(d, p),
            None => 0,
        })
    }

    /// Maximum key reachable through a page pointer.
    fn max_key(&self, ptr: u32) -> Result<u64, IsamError> {
        if btpp_is_node(ptr) {
            let node = self.page(ptr)?;
            let nbkeys = node_nbkeys(node);
            if nbkeys == 0 || nbkeys > BT_ARITY {
                return Err(structural(format!(
                    "node {:03}: invalid nbkeys={}",
                    btpp_offs(ptr),
                    nbkeys
                )));
            }
            Ok(node_key(node, nbkeys - 1))
        } else {
            self.leaf_max_key(ptr)
        }
    }

    // ── fetch ───────────────────────────────────────────────────────

    /// Append the concatenated data stored under `key` to `out` and
    /// return its length; `Ok(0)` when the key is absent. Records may
    /// span into following leaves.
    pub fn fetch(&self, key: u64, out: &mut Vec<u8>) -> Result<usize, IsamError> {
        let ptr = self.find_leaf(key, None)?;
        let mut used = self.checked_used(ptr)?;
        let mut page = self.page(ptr)?;

        let (exact, _) = Self::leaf_findslot(leaf_data(page), used, key)?;
        let Some(mut pos) = exact else { return Ok(0) };

        let mut len = 0;
        loop {
            let d = leaf_data(page);
            pos += 1 + 8;
            if pos >= used {
                return Err(structural("leaf record without data length".into()));
            }
            let dlen = d[pos] as usize;
            pos += 1;
            if pos + dlen > used {
                return Err(structural("leaf record data overflows used area".into()));
            }
            out.extend_from_slice(&d[pos..pos + dlen]);
            len += dlen;
            pos += dlen;

            if pos >= used {
                pos = 0;
                let next = page_next(page);
                if next == BTPP_NIL {
                    break;
                }
                used = self.checked_used(next)?;
                page = self.page(next)?;
                if used == 0 {
                    return Err(structural("empty leaf in sibling chain".into()));
                }
            }
            let d = leaf_data(page);
            if pos + BT_REC_HDR > used || d[pos] != 8 {
                return Err(structural("leaf record malformed".into()));
            }
            if rec_key(d, pos) != key {
                break;
            }
        }
        Ok(len)
    }

    /// Collect every `(key, data)` with `kmin <= key <= kmax` into `out`,
    /// one [`KeyRangeRec`] per distinct key. `kmax` may be `u64::MAX`.
    pub fn fetch_range(
        &self,
        kmin: u64,
        kmax: u64,
        out: &mut KeyRange,
    ) -> Result<(), IsamError> {
        out.keys.clear();
        out.data.clear();

        let ptr = self.find_leaf(kmin, None)?;
        let mut used = self.checked_used(ptr)?;
        let mut page = self.page(ptr)?;

        let (_, mut pos) = Self::leaf_findslot(leaf_data(page), used, kmin)?;
        let mut cur = KeyRangeRec { key: kmin, dpos: 0, dlen: 0 };

        loop {
            if pos >= used {
                pos = 0;
                let next = page_next(page);
                if next == BTPP_NIL {
                    break;
                }
                used = self.checked_used(next)?;
                page = self.page(next)?;
                if used == 0 {
                    return Err(structural("empty leaf in sibling chain".into()));
                }
            }
            let d = leaf_data(page);
            if pos + BT_REC_HDR > used || d[pos] != 8 {
                return Err(structural("leaf record malformed".into()));
            }
            let key = rec_key(d, pos);
            pos += 1 + 8;
            // kmax may be u64::MAX; the exit test must not wrap.
            if key > kmax || key < kmin {
                break;
            }
            if key != cur.key {
                if cur.dlen > 0 {
                    out.keys.push(cur);
                }
                cur = KeyRangeRec { key, dpos: out.data.len(), dlen: 0 };
            }
            let dlen = d[pos] as usize;
            pos += 1;
            if pos + dlen > used {
                return Err(structural("leaf record data overflows used area".into()));
            }
            out.data.extend_from_slice(&d[pos..pos + dlen]);
            cur.dlen += dlen;
            pos += dlen;
        }
        if cur.dlen > 0 {
            out.keys.push(cur);
        }
        Ok(())
    }

    // ── push ────────────────────────────────────────────────────────

    /// Append `data` under `key`. Values longer than [`BT_MAX_DLEN`] are
    /// chunked, tail chunks pushed first so the stored order of chunks
    /// reconstructs the value. Pushing an empty value is a no-op.
    pub fn push(&mut self, key: u64, data: &[u8]) -> Result<(), IsamError> {
        if !self.file.writable() {
            return Err(IsamError::Argument("push on read-only index".into()));
        }
        let mut dlen = data.len();
        while dlen > BT_MAX_DLEN {
            self.push_one(key, &data[dlen - BT_MAX_DLEN..dlen])?;
            dlen -= BT_MAX_DLEN;
        }
        if dlen == 0 {
            return Ok(());
        }
        self.push_one(key, &data[..dlen])
    }

    fn push_one(&mut self, key: u64, data: &[u8]) -> Result<(), IsamError> {
        let dlen = data.len();
        debug_assert!(dlen >= 1 && dlen <= BT_MAX_DLEN);

        'restart: loop {
            let depth = self.depth() as usize;
            let mut path = vec![(0u32, 0usize); depth + 1];
            let lptr = self.find_leaf(key, Some(&mut path))?;

            let used = self.checked_used(lptr)?;
            let page = self.page(lptr)?;
            let (exact, slot) = Self::leaf_findslot(leaf_data(page), used, key)?;

            // An existing record for the key absorbs the new bytes while
            // it has room; otherwise a fresh record is inserted at the
            // slot (before the key's existing records).
            let mut reuse = false;
            let mut need = BT_REC_HDR + dlen;
            if let Some(pos) = exact {
                if rec_dlen(leaf_data(page), pos) + dlen <= BT_MAX_DLEN {
                    reuse = true;
                    need = dlen;
                }
            }

            if used + need > BT_LEAF_CAP {
                let rptr = page_next(self.page(lptr)?);
                if rptr == BTPP_NIL {
                    // Rightmost leaf: link a fresh empty overflow page and
                    // restart, the donation path below will fill it.
                    let npage = self.alloc_page()?;
                    let old_next = {
                        let lp = self.page_mut(lptr)?;
                        let old = page_next(lp);
                        set_page_next(lp, npage);
                        old
                    };
                    set_page_next(self.page_mut(npage)?, old_next);
                    self.insert_sibling(&path, 0, npage)?;
                    continue 'restart;
                }

                if slot + need > BT_LEAF_CAP {
                    // No boundary at or after the slot can keep the
                    // insert inside this page.
                    self.split_three(&path, lptr, rptr, slot)?;
                    continue 'restart;
                }

                // Find the last record boundary that keeps the insert
                // inside this page; everything after it moves right.
                let shift_from = {
                    let d = leaf_data(self.page(lptr)?);
                    let mut pos = slot;
                    let mut oldpos = slot;
                    while pos < used && pos + need <= BT_LEAF_CAP {
                        oldpos = pos;
                        if pos + BT_REC_HDR > used {
                            return Err(structural("leaf record truncated".into()));
                        }
                        pos += rec_len(d, pos);
                    }
                    oldpos
                };
                let shift = used - shift_from;
                let rused = self.checked_used(rptr)?;
                let extra = if shift_from == slot { need } else { 0 };

                if shift + rused + extra > BT_LEAF_CAP {
                    self.split_three(&path, lptr, rptr, slot)?;
                    continue 'restart;
                }

                // Donate the tail chunk to the right sibling.
                let chunk = leaf_data(self.page(lptr)?)[shift_from..used].to_vec();
                {
                    let rp = self.page_mut(rptr)?;
                    let d = leaf_data_mut(rp);
                    d.copy_within(0..rused, shift);
                    d[..shift].copy_from_slice(&chunk);
                    set_leaf_used(rp, rused + shift);
                }
                set_leaf_used(self.page_mut(lptr)?, shift_from);

                let lmax = self.leaf_max_key(lptr)?;
                self.update_maxkey(&path, 0, lmax)?;

                if shift_from == slot && reuse {
                    // The record to extend moved to the sibling.
                    continue 'restart;
                }
            }

            let p = self.page_mut(lptr)?;
            let used = leaf_used(p);
            let d = leaf_data_mut(p);
            let mut pos = slot;
            if reuse {
                pos += BT_REC_HDR;
                d.copy_within(pos..used, pos + need);
            } else {
                d.copy_within(pos..used, pos + need);
                d[pos] = 8;
                LittleEndian::write_u64(&mut d[pos + 1..pos + 9], key);
                d[pos + 1 + 8] = 0;
                pos += BT_REC_HDR;
            }
            d[pos - 1] += dlen as u8;
            d[pos..pos + dlen].copy_from_slice(data);
            set_leaf_used(p, used + need);

            // An insert at the end of a non-rightmost page raises the
            // page's maximum key; refresh the separators above.
            if pos + dlen == used + need && page_next(self.page(lptr)?) != BTPP_NIL {
                self.update_maxkey(&path, 0, key)?;
            }
            return Ok(());
        }
    }

    /// Redistribute `[lptr:rptr]` over three pages, inserting a fresh
    /// middle page that takes the tail of `lptr` and the head of `rptr`.
    fn split_three(
        &mut self,
        path: &[(u32, usize)],
        lptr: u32,
        rptr: u32,
        slot: usize,
    ) -> Result<(), IsamError> {
        let npage = self.alloc_page()?;

        let lused = self.checked_used(lptr)?;
        let rused = self.checked_used(rptr)?;

        // Boundary in the left page, near two thirds.
        let pos1 = {
            let d = leaf_data(self.page(lptr)?);
            let mut pos = 0;
            let mut lastpos = 0;
            while pos < lused && pos <= BT_LEAF_CAP * 2 / 3 {
                lastpos = pos;
                pos += rec_len(d, pos);
            }
            let mut pos1 = pos;
            if lastpos > 0 && (slot < lastpos || pos1 >= lused) {
                pos1 = lastpos;
            }
            if pos1 == 0 || pos1 >= lused {
                return Err(structural(format!(
                    "cannot split leaf {:03}",
                    btpp_offs(lptr)
                )));
            }
            pos1
        };

        // Boundary in the right page, near one third, capped so the
        // middle page cannot overflow.
        let pos2 = {
            let d = leaf_data(self.page(rptr)?);
            let mut pos = 0;
            let mut lastpos = 0;
            while pos < rused && pos <= BT_LEAF_CAP / 3 {
                lastpos = pos;
                pos += rec_len(d, pos);
                if lused - pos1 + pos > BT_LEAF_CAP {
                    pos = lastpos;
                    break;
                }
            }
            let mut pos2 = pos;
            if pos2 >= rused {
                pos2 = lastpos;
            }
            pos2
        };

        let lchunk = leaf_data(self.page(lptr)?)[pos1..lused].to_vec();
        let rchunk = leaf_data(self.page(rptr)?)[..pos2].to_vec();

        let lnext = {
            let lp = self.page_mut(lptr)?;
            let old = page_next(lp);
            set_page_next(lp, npage);
            set_leaf_used(lp, pos1);
            old
        };
        {
            let np = self.page_mut(npage)?;
            set_page_next(np, lnext);
            let d = leaf_data_mut(np);
            d[..lchunk.len()].copy_from_slice(&lchunk);
            d[lchunk.len()..lchunk.len() + rchunk.len()].copy_from_slice(&rchunk);
            set_leaf_used(np, lchunk.len() + rchunk.len());
        }
        {
            let rp = self.page_mut(rptr)?;
            let d = leaf_data_mut(rp);
            d.copy_within(pos2..rused, 0);
            set_leaf_used(rp, rused - pos2);
        }
        self.insert_sibling(path, 0, npage)
    }

    // ── separator maintenance ───────────────────────────────────────

    /// Refresh the max-key separators above `level` after the page at
    /// `path[level]` changed its maximum.
    fn update_maxkey(
        &mut self,
        path: &[(u32, usize)],
        level: usize,
        key: u64,
    ) -> Result<(), IsamError> {
        let depth = self.depth() as usize;
        let mut level = level + 1;
        while level <= depth {
            let (pg, pos) = path[level];
            let node = self.page_mut(pg)?;
            let nbkeys = node_nbkeys(node);
            if pos >= nbkeys {
                break;
            }
            set_node_key(node, pos, key);
            if pos < nbkeys - 1 {
                break;
            }
            level += 1;
        }
        Ok(())
    }

    /// Write `(lpage, rpage)` into a node at `pos`, opening the slot.
    fn node_insert_aux(
        &mut self,
        pg: u32,
        pos: usize,
        lpage: u32,
        rpage: u32,
    ) -> Result<(), IsamError> {
        let lmax = self.max_key(lpage)?;
        let rmax = self.max_key(rpage)?;
        let node = self.page_mut(pg)?;
        let nbkeys = node_nbkeys(node);
        node_shift(node, pos + 1, pos, nbkeys - pos);
        set_node_nbkeys(node, nbkeys + 1);
        set_node_ptr(node, pos, lpage);
        set_node_key(node, pos, lmax);
        set_node_ptr(node, pos + 1, rpage);
        if pos + 1 < nbkeys + 1 {
            set_node_key(node, pos + 1, rmax);
        }
        Ok(())
    }

    /// Insert `rpage` as the right sibling produced by a split of
    /// `path[level].page`, recursing when the parent splits too. A root
    /// split allocates a new root and grows the depth.
    fn insert_sibling(
        &mut self,
        path: &[(u32, usize)],
        level: usize,
        rpage: u32,
    ) -> Result<(), IsamError> {
        let lpage = path[level].0;
        let level = level + 1;

        if level > self.depth() as usize {
            let page = self.alloc_page()?;
            let lmax = self.max_key(lpage)?;
            self.set_depth(self.depth() + 1);
            self.set_root(page | BTPP_NODE_MASK);
            let node = self.page_mut(page)?;
            set_page_next(node, BTPP_NIL);
            set_node_nbkeys(node, 1);
            set_node_ptr(node, 0, lpage);
            set_node_key(node, 0, lmax);
            set_node_ptr(node, 1, rpage);
            return Ok(());
        }

        let (pg, pos) = path[level];
        let node = self.page(pg)?;
        let nbkeys = node_nbkeys(node);
        if nbkeys == 0 || nbkeys > BT_ARITY {
            return Err(structural(format!(
                "node {:03}: invalid nbkeys={}",
                btpp_offs(pg),
                nbkeys
            )));
        }

        if nbkeys < BT_ARITY {
            self.node_insert_aux(pg, pos, lpage, rpage)?;
            let node = self.page(pg)?;
            let nbkeys = node_nbkeys(node);
            if pos + 1 == nbkeys - 1 {
                let key = node_key(node, nbkeys - 1);
                return self.update_maxkey(path, level, key);
            }
            return Ok(());
        }

        // Full node: try to donate one entry to the right sibling.
        let next = page_next(node);
        if btpp_offs(next) != BTPP_NIL {
            let sib = self.page(next)?;
            let snb = node_nbkeys(sib);
            if snb > 0 && snb < BT_ARITY {
                if pos >= nbkeys {
                    return Err(structural(format!(
                        "node {:03}: separator slot {} out of range",
                        btpp_offs(pg),
                        pos
                    )));
                }
                let lmax = self.max_key(lpage)?;
                let rmax = self.max_key(rpage)?;
                let sptr = next;
                if pos < nbkeys - 1 {
                    let (spill_ptr, spill_key) = {
                        let node = self.page(pg)?;
                        (node_ptr(node, nbkeys - 1), node_key(node, nbkeys - 1))
                    };
                    {
                        let sib = self.page_mut(sptr)?;
                        node_shift(sib, 1, 0, snb);
                        set_node_nbkeys(sib, snb + 1);
                        set_node_ptr(sib, 0, spill_ptr);
                        set_node_key(sib, 0, spill_key);
                    }
                    let node = self.page_mut(pg)?;
                    node_shift(node, pos + 1, pos, nbkeys - 1 - pos);
                    set_node_ptr(node, pos, lpage);
                    set_node_key(node, pos, lmax);
                    set_node_ptr(node, pos + 1, rpage);
                    set_node_key(node, pos + 1, rmax);
                } else {
                    {
                        let node = self.page_mut(pg)?;
                        set_node_ptr(node, pos, lpage);
                        set_node_key(node, pos, lmax);
                        set_node_ptr(node, pos + 1, rpage);
                    }
                    let sib = self.page_mut(sptr)?;
                    node_shift(sib, 1, 0, snb);
                    set_node_nbkeys(sib, snb + 1);
                    set_node_ptr(sib, 0, rpage);
                    set_node_key(sib, 0, rmax);
                }
                let key = node_key(self.page(pg)?, nbkeys - 1);
                return self.update_maxkey(path, level, key);
            }
        }

        // Split the node.
        let npage_raw = self.alloc_page()?;
        let npage = npage_raw | BTPP_NODE_MASK;

        let mut split = BT_ARITY / 2;
        {
            let node = self.page(pg)?;
            if page_next(node) == BTPP_NIL && pos >= nbkeys - 1 {
                // The rightmost node of a level splits on its last key so
                // ascending inserts keep nodes densely packed.
                split = nbkeys - 1;
            }
        }

        let (old_next, moved_ptrs, moved_keys) = {
            let node = self.page(pg)?;
            let ptrs: Vec<u32> = (split..=nbkeys).map(|i| node_ptr(node, i)).collect();
            let keys: Vec<u64> = (split..nbkeys).map(|i| node_key(node, i)).collect();
            (page_next(node), ptrs, keys)
        };
        {
            let sib = self.page_mut(npage_raw)?;
            set_page_next(sib, old_next);
            for (i, p) in moved_ptrs.iter().enumerate() {
                set_node_ptr(sib, i, *p);
            }
            for (i, k) in moved_keys.iter().enumerate() {
                set_node_key(sib, i, *k);
            }
            set_node_nbkeys(sib, nbkeys - split);
        }
        {
            let node = self.page_mut(pg)?;
            set_page_next(node, npage & !BTPP_NODE_MASK);
            set_node_nbkeys(node, split);
        }

        let key = node_key(self.page(pg)?, split - 1);
        self.update_maxkey(path, level, key)?;

        if pos < split {
            self.node_insert_aux(pg, pos, lpage, rpage)?;
        } else {
            self.node_insert_aux(npage_raw, pos - split, lpage, rpage)?;
            let first = node_ptr(self.page(npage_raw)?, 0);
            let node = self.page_mut(pg)?;
            let nb = node_nbkeys(node);
            set_node_ptr(node, nb, first);
        }
        self.insert_sibling(path, level, npage)
    }

    // ── iteration ───────────────────────────────────────────────────

    /// In-order iterator over distinct keys; each item carries the
    /// concatenation of the key's records across adjacent leaves.
    pub fn iter(&self) -> Bt64Iter<'_> {
        let mut page = self.root();
        while btpp_is_node(page) {
            match self.page(page) {
                Ok(node) => page = node_ptr(node, 0),
                Err(_) => {
                    page = BTPP_NIL;
                    break;
                }
            }
        }
        Bt64Iter { bt: self, page, pos: 0 }
    }

    // ── integrity ───────────────────────────────────────────────────

    /// Validate the header: magic, version, size, counters. With `fix`,
    /// repair `nbpages` and `freelist` when the file length proves them
    /// wrong.
    pub fn check_header(&mut self, fix: bool) -> Result<bool, IsamError> {
        let fix = fix && self.file.writable();
        let size = self.file.len();
        let hdr = self.hdr();
        if hdr[BT_HDR_MAGIC..BT_HDR_MAGIC + 4] != BT_MAGIC {
            return Err(IsamError::CorruptHeader(format!(
                "{}: bad magic",
                self.file.path().display()
            )));
        }
        if hdr[BT_HDR_MAJOR] != BT_VERSION_MAJOR || hdr[BT_HDR_MINOR] != BT_VERSION_MINOR {
            return Err(IsamError::CorruptHeader(format!(
                "{}: unsupported version {}.{}",
                self.file.path().display(),
                hdr[BT_HDR_MAJOR],
                hdr[BT_HDR_MINOR]
            )));
        }
        if size < BT_PAGE_SIZE as u64 || size % BT_PAGE_SIZE as u64 != 0 {
            return Err(IsamError::CorruptHeader(format!(
                "{}: bad file size {}",
                self.file.path().display(),
                size
            )));
        }

        let mut did_fix = false;
        let max_pages = (size / BT_PAGE_SIZE as u64 - 1) as u32;
        if self.nbpages() > max_pages {
            if !fix {
                return Err(IsamError::CorruptHeader(format!(
                    "{}: nbpages {} exceeds file capacity {}",
                    self.file.path().display(),
                    self.nbpages(),
                    max_pages
                )));
            }
            self.set_nbpages(max_pages);
            did_fix = true;
        }
        if self.freelist() != 0 && self.freelist() >= self.nbpages() {
            if !fix {
                return Err(IsamError::CorruptHeader(format!(
                    "{}: freelist {} out of bounds",
                    self.file.path().display(),
                    self.freelist()
                )));
            }
            self.set_freelist(0);
            did_fix = true;
        }
        Ok(did_fix)
    }

    /// Full integrity check: header, tree walk, freelist walk. Issues
    /// are written to `out`; the first one is also returned as the
    /// error. With `fix`, provably wrong header counters are repaired
    /// (nothing else is ever mutated).
    pub fn check_integrity(
        &mut self,
        fix: bool,
        out: &mut dyn Write,
    ) -> Result<(), IsamError> {
        self.check_header(fix)?;

        let nbpages = self.nbpages() as usize;
        let mut run = CheckRun { states: vec![PageState::Unvisited; nbpages], first: None };

        // Freelist first, so the tree walk can spot allocated pages that
        // are also chained as free.
        let mut free = self.freelist();
        while free != 0 {
            if free == BTPP_NIL || free as usize >= nbpages {
                run.report(out, format!("freelist chains to invalid page {:#x}", free));
                break;
            }
            if run.states[free as usize] != PageState::Unvisited {
                run.report(out, format!("freelist revisits page {:03}", free));
                break;
            }
            run.states[free as usize] = PageState::Free;
            free = page_next(self.page(free)?);
        }

        let depth = self.depth();
        let root = self.root();
        self.check_page(&mut run, depth as i32, root, u64::MAX, BTPP_NIL, true, out)?;

        match run.first.take() {
            None => Ok(()),
            Some(msg) => Err(structural(msg)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_page(
        &self,
        run: &mut CheckRun,
        level: i32,
        page: u32,
        maxkey: u64,
        next: u32,
        is_root: bool,
        out: &mut dyn Write,
    ) -> Result<(), IsamError> {
        if btpp_offs(page) == BTPP_NIL {
            run.report(out, format!("L{}: NIL page pointer in tree", level));
            return Ok(());
        }
        let offs = btpp_offs(page) as usize;
        if offs >= run.states.len() {
            run.report(out, format!("L{}: page {:03} out of bounds", level, offs));
            return Ok(());
        }
        match run.states[offs] {
            PageState::Unvisited => run.states[offs] = PageState::Visiting,
            PageState::Free => {
                run.report(out, format!("page {:03} is both allocated and free", offs));
                return Ok(());
            }
            _ => {
                run.report(out, format!("page {:03} referenced twice", offs));
                return Ok(());
            }
        }
        let ok = if btpp_is_node(page) {
            if level <= 0 {
                run.report(out, format!("{:03}: node page below leaf level", offs));
                false
            } else {
                self.check_node(run, level, page, maxkey, next, out)?
            }
        } else if level > 0 {
            run.report(out, format!("{:03}: leaf page at node level {}", offs, level));
            false
        } else {
            self.check_leaf(run, page, maxkey, next, is_root, out)?
        };
        run.states[offs] = if ok { PageState::Ok } else { PageState::Corrupt };
        Ok(())
    }

    fn check_node(
        &self,
        run: &mut CheckRun,
        level: i32,
        page: u32,
        maxkey: u64,
        next: u32,
        out: &mut dyn Write,
    ) -> Result<bool, IsamError> {
        let offs = btpp_offs(page);
        let node = self.page(page)?;
        let nbkeys = node_nbkeys(node);
        if nbkeys == 0 || nbkeys > BT_ARITY {
            run.report(out, format!("{:03} (node.L{}): invalid nbkeys={}", offs, level, nbkeys));
            return Ok(false);
        }
        let node_next = page_next(node);
        let keys: Vec<u64> = (0..nbkeys).map(|i| node_key(node, i)).collect();
        let ptrs: Vec<u32> = (0..=nbkeys).map(|i| node_ptr(node, i)).collect();

        let mut ok = true;
        for i in 0..nbkeys {
            if keys[i] > maxkey {
                run.report(
                    out,
                    format!(
                        "{:03} (node.L{}): key[{}/{}]={} > maxkey={}",
                        offs,
                        level,
                        i,
                        nbkeys,
                        bt64_key_str(keys[i]),
                        bt64_key_str(maxkey)
                    ),
                );
                ok = false;
            }
            if i > 0 && keys[i] < keys[i - 1] {
                run.report(
                    out,
                    format!(
                        "{:03} (node.L{}): key[{}/{}]={} < key[{}]",
                        offs,
                        level,
                        i,
                        nbkeys,
                        bt64_key_str(keys[i]),
                        i - 1
                    ),
                );
                ok = false;
            }
            // ptrs[i + 1] duplicates the next child's first page for
            // i == nbkeys - 1 on non-rightmost nodes; it is only the
            // expected sibling of child i, not a tree edge.
            self.check_page(run, level - 1, ptrs[i], keys[i], ptrs[i + 1], false, out)?;
        }
        if btpp_offs(node_next) != BTPP_NIL && maxkey != keys[nbkeys - 1] {
            run.report(
                out,
                format!(
                    "{:03} (node.L{}): last key {} != maxkey={}",
                    offs,
                    level,
                    bt64_key_str(keys[nbkeys - 1]),
                    bt64_key_str(maxkey)
                ),
            );
            ok = false;
        }
        if next != BTPP_NIL && btpp_offs(node_next) != btpp_offs(next) {
            run.report(
                out,
                format!(
                    "{:03} (node.L{}): next={:03} != expected {:03}",
                    offs,
                    level,
                    btpp_offs(node_next),
                    btpp_offs(next)
                ),
            );
            ok = false;
        }
        if btpp_offs(node_next) == BTPP_NIL {
            if maxkey != u64::MAX {
                run.report(
                    out,
                    format!("{:03} (node.L{}): non-rightmost page has no next", offs, level),
                );
                ok = false;
            }
            self.check_page(run, level - 1, ptrs[nbkeys], maxkey, BTPP_NIL, false, out)?;
        }
        Ok(ok)
    }

    fn check_leaf(
        &self,
        run: &mut CheckRun,
        page: u32,
        maxkey: u64,
        next: u32,
        is_root: bool,
        out: &mut dyn Write,
    ) -> Result<bool, IsamError> {
        let offs = btpp_offs(page);
        let leaf = self.page(page)?;
        let used = leaf_used(leaf);
        let leaf_next = page_next(leaf);
        if used > BT_LEAF_CAP || (!is_root && used <= BT_REC_HDR) {
            run.report(out, format!("{:03} (leaf): invalid used={}", offs, used));
            return Ok(false);
        }
        let d = leaf_data(leaf);
        let mut ok = true;
        let mut lastkey = 0u64;
        let mut pos = 0;
        while pos < used {
            if d[pos] != 8 {
                run.report(
                    out,
                    format!("{:03} (leaf): pos={}/{}: invalid keylen={}", offs, pos, used, d[pos]),
                );
                return Ok(false);
            }
            if pos + BT_REC_HDR > used {
                run.report(out, format!("{:03} (leaf): pos={}/{}: overflow", offs, pos, used));
                return Ok(false);
            }
            let nextpos = pos + rec_len(d, pos);
            if nextpos > used {
                run.report(
                    out,
                    format!(
                        "{:03} (leaf): pos={}/{}: overflow dlen={}",
                        offs,
                        pos,
                        used,
                        rec_dlen(d, pos)
                    ),
                );
                return Ok(false);
            }
            let key = rec_key(d, pos);
            if pos > 0 && key < lastkey {
                run.report(
                    out,
                    format!(
                        "{:03} (leaf): pos={}/{}: key={} < lastkey={}",
                        offs,
                        pos,
                        used,
                        bt64_key_str(key),
                        bt64_key_str(lastkey)
                    ),
                );
                ok = false;
            }
            if key > maxkey {
                run.report(
                    out,
                    format!(
                        "{:03} (leaf): pos={}/{}: key={} > maxkey={}",
                        offs,
                        pos,
                        used,
                        bt64_key_str(key),
                        bt64_key_str(maxkey)
                    ),
                );
                ok = false;
            }
            if nextpos == used && btpp_offs(next) != BTPP_NIL && key != maxkey {
                run.report(
                    out,
                    format!(
                        "{:03} (leaf): pos={}/{}: last key {} != maxkey={}",
                        offs,
                        pos,
                        used,
                        bt64_key_str(key),
                        bt64_key_str(maxkey)
                    ),
                );
                ok = false;
            }
            lastkey = key;
            pos = nextpos;
        }
        if btpp_offs(leaf_next) != btpp_offs(next) {
            run.report(
                out,
                format!(
                    "{:03} (leaf): next={:03} != expected {:03}",
                    offs,
                    btpp_offs(leaf_next),
                    btpp_offs(next)
                ),
            );
            ok = false;
        }
        Ok(ok)
    }

    // ── dump ────────────────────────────────────────────────────────

    /// Human-readable walk over every level, leftmost to rightmost.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        let info = self.info();
        writeln!(out, "BT64 magic  : ISBT")?;
        writeln!(out, "    version : {}.{}", info.major, info.minor)?;
        writeln!(out, "    rootpage: {:03} (depth {})", btpp_offs(info.root), info.depth)?;
        writeln!(out, "    nbpages : {}", info.nbpages)?;

        let mut lmost = self.root();
        for level in (1..=self.depth()).rev() {
            writeln!(out, "====== level {}: nodes =====", level)?;
            let mut page = lmost;
            while btpp_offs(page) != BTPP_NIL {
                let node = match self.page(page) {
                    Ok(n) => n,
                    Err(_) => break,
                };
                let nbkeys = node_nbkeys(node).min(BT_ARITY);
                write!(
                    out,
                    "{:03}: node.L{}  [{:3}/{}]",
                    btpp_offs(page),
                    level,
                    nbkeys,
                    BT_ARITY
                )?;
                let next = page_next(node);
                if btpp_offs(next) == BTPP_NIL {
                    write!(out, " next=nil")?;
                } else {
                    write!(out, " next={:03}", btpp_offs(next))?;
                }
                write!(out, " {{")?;
                for i in 0..nbkeys {
                    write!(
                        out,
                        " {:03} {}",
                        btpp_offs(node_ptr(node, i)),
                        bt64_key_str(node_key(node, i))
                    )?;
                }
                writeln!(out, " {:03} }}", btpp_offs(node_ptr(node, nbkeys)))?;
                page = next;
            }
            lmost = match self.page(lmost) {
                Ok(n) => node_ptr(n, 0),
                Err(_) => break,
            };
        }

        writeln!(out, "====== level 0: leaves =====")?;
        let mut page = lmost;
        while btpp_offs(page) != BTPP_NIL {
            let leaf = match self.page(page) {
                Ok(l) => l,
                Err(_) => break,
            };
            let used = leaf_used(leaf).min(BT_LEAF_CAP);
            write!(out, "{:03}: leaf  [{:4}/{}] ", btpp_offs(page), used, BT_LEAF_CAP)?;
            let next = page_next(leaf);
            if btpp_offs(next) == BTPP_NIL {
                write!(out, "next=nil ")?;
            } else {
                write!(out, "next={:03} ", btpp_offs(next))?;
            }
            write!(out, "{{ ")?;
            let d = leaf_data(leaf);
            let mut pos = 0;
            while pos < used && pos + BT_REC_HDR <= used {
                if pos > 0 {
                    write!(out, ", ")?;
                }
                if d[pos] == 8 {
                    write!(out, "{} ", bt64_key_str(rec_key(d, pos)))?;
                } else {
                    write!(out, "BUG(keylen={}) ", d[pos])?;
                    break;
                }
                write!(out, "{}", rec_dlen(d, pos))?;
                pos += rec_len(d, pos);
            }
            writeln!(out, " }}")?;
            page = next;
        }
        Ok(())
    }
}

impl Drop for Bt64 {
    fn drop(&mut self) {
        let _ = self.do_close();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PageState {
    Unvisited,
    Visiting,
    Ok,
    Corrupt,
    Free,
}

struct CheckRun {
    states: Vec<PageState>,
    first: Option<String>,
}

impl CheckRun {
    fn report(&mut self, out: &mut dyn Write, msg: String) {
        let _ = writeln!(out, "{}", msg);
        if self.first.is_none() {
            self.first = Some(msg);
        }
    }
}

/// Ordered iterator over a [`Bt64`]; see [`Bt64::iter`].
pub struct Bt64Iter<'a> {
    bt: &'a Bt64,
    page: u32,
    pos: usize,
}

impl Iterator for Bt64Iter<'_> {
    type Item = (u64, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.page == BTPP_NIL {
            return None;
        }
        let mut leaf = self.bt.page(self.page).ok()?;
        let mut used = leaf_used(leaf).min(BT_LEAF_CAP);

        while self.pos >= used {
            let next = page_next(leaf);
            if next == BTPP_NIL {
                self.page = BTPP_NIL;
                return None;
            }
            self.page = next;
            self.pos = 0;
            leaf = self.bt.page(next).ok()?;
            used = leaf_used(leaf).min(BT_LEAF_CAP);
        }

        let d = leaf_data(leaf);
        if self.pos + BT_REC_HDR > used || d[self.pos] != 8 {
            self.page = BTPP_NIL;
            return None;
        }
        let key = rec_key(d, self.pos);
        let mut data = Vec::new();

        loop {
            let d = leaf_data(leaf);
            self.pos += 1 + 8;
            if self.pos >= used {
                self.page = BTPP_NIL;
                return Some((key, data));
            }
            let dlen = d[self.pos] as usize;
            self.pos += 1;
            if self.pos + dlen > used {
                self.page = BTPP_NIL;
                return Some((key, data));
            }
            data.extend_from_slice(&d[self.pos..self.pos + dlen]);
            self.pos += dlen;

            if self.pos >= used {
                self.pos = 0;
                let next = page_next(leaf);
                self.page = next;
                if next == BTPP_NIL {
                    return Some((key, data));
                }
                leaf = match self.bt.page(next) {
                    Ok(l) => l,
                    Err(_) => {
                        self.page = BTPP_NIL;
                        return Some((key, data));
                    }
                };
                used = leaf_used(leaf).min(BT_LEAF_CAP);
                if used == 0 {
                    self.page = BTPP_NIL;
                    return Some((key, data));
                }
            }
            let d = leaf_data(leaf);
            if self.pos + BT_REC_HDR > used || d[self.pos] != 8 || rec_key(d, self.pos) != key {
                return Some((key, data));
            }
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

    #[test]
    fn test_create_empty_is_sound() {
        let (_dir, path) = scratch("t.ibt");
        let mut bt = Bt64::create(&path).unwrap();
        assert_eq!(bt.info().depth, 0);
        assert_eq!(bt.info().nbpages, BT_INIT_NBPAGES as u32 - 1);
        bt.check_integrity(false, &mut io::sink()).unwrap();
        let mut out = Vec::new();
        assert_eq!(bt.fetch(1, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_push_fetch_single() {
        let (_dir, path) = scratch("t.ibt");
        let mut bt = Bt64::create(&path).unwrap();
        bt.push(0x0102030405060708, b"hello").unwrap();
        let mut out = Vec::new();
        assert_eq!(bt.fetch(0x0102030405060708, &mut out).unwrap(), 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_push_appends_in_order() {
        let (_dir, path) = scratch("t.ibt");
        let mut bt = Bt64::create(&path).unwrap();
        bt.push(42, b"a").unwrap();
        bt.push(42, b"bb").unwrap();
        bt.push(42, b"ccc").unwrap();
        let mut out = Vec::new();
        assert_eq!(bt.fetch(42, &mut out).unwrap(), 6);
        assert_eq!(&out, b"abbccc");

        let items: Vec<_> = bt.iter().collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, 42);
        assert_eq!(items[0].1, b"abbccc");
    }

    #[test]
    fn test_push_empty_is_noop() {
        let (_dir, path) = scratch("t.ibt");
        let mut bt = Bt64::create(&path).unwrap();
        bt.push(7, b"").unwrap();
        let mut out = Vec::new();
        assert_eq!(bt.fetch(7, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_large_value_chunking_round_trips() {
        let (_dir, path) = scratch("t.ibt");
        let mut bt = Bt64::create(&path).unwrap();
        let value: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
        bt.push(1, &value).unwrap();
        let mut out = Vec::new();
        assert_eq!(bt.fetch(1, &mut out).unwrap(), 1024);
        assert_eq!(out, value);
        bt.check_integrity(false, &mut io::sink()).unwrap();
    }

    #[test]
    fn test_many_keys_split_and_stay_sorted() {
        let (_dir, path) = scratch("t.ibt");
        let mut bt = Bt64::create(&path).unwrap();
        let n = 5000u64;
        for i in 0..n {
            // spread writes over the key space
            let key = (i * 2_654_435_761) % 100_000;
            bt.push(key, &key.to_le_bytes()).unwrap();
        }
        bt.check_integrity(false, &mut io::sink()).unwrap();
        assert!(bt.info().depth >= 1);

        let mut last = None;
        for (key, data) in bt.iter() {
            if let Some(prev) = last {
                assert!(key > prev, "iterator must ascend: {} after {}", key, prev);
            }
            assert_eq!(data.len() % 8, 0);
            assert_eq!(&data[..8], &key.to_le_bytes());
            last = Some(key);
        }
    }

    #[test]
    fn test_ascending_inserts_pack_densely() {
        let (_dir, path) = scratch("t.ibt");
        let mut bt = Bt64::create(&path).unwrap();
        for key in 0..20_000u64 {
            bt.push(key, &(key as u32).to_le_bytes()).unwrap();
        }
        bt.check_integrity(false, &mut io::sink()).unwrap();
        let mut out = Vec::new();
        assert_eq!(bt.fetch(19_999, &mut out).unwrap(), 4);
    }

    #[test]
    fn test_fetch_range() {
        let (_dir, path) = scratch("t.ibt");
        let mut bt = Bt64::create(&path).unwrap();
        for key in [10u64, 20, 20, 30, 40] {
            bt.push(key, b"x").unwrap();
        }
        let mut out = KeyRange::default();
        bt.fetch_range(15, 35, &mut out).unwrap();
        let keys: Vec<u64> = out.keys.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![20, 30]);
        assert_eq!(out.data_of(0), b"xx");
        assert_eq!(out.data_of(1), b"x");
    }

    #[test]
    fn test_fetch_range_max_key_no_overflow() {
        let (_dir, path) = scratch("t.ibt");
        let mut bt = Bt64::create(&path).unwrap();
        bt.push(u64::MAX, b"top").unwrap();
        bt.push(5, b"low").unwrap();
        let mut out = KeyRange::default();
        bt.fetch_range(0, u64::MAX, &mut out).unwrap();
        assert_eq!(out.keys.len(), 2);
        assert_eq!(out.keys[1].key, u64::MAX);
        assert_eq!(out.data_of(1), b"top");
    }

    #[test]
    fn test_reopen_round_trip() {
        let (_dir, path) = scratch("t.ibt");
        {
            let mut bt = Bt64::create(&path).unwrap();
            for key in 0..500u64 {
                bt.push(key, format!("v{}", key).as_bytes()).unwrap();
            }
            bt.close().unwrap();
        }
        let bt = Bt64::open(&path, false, true).unwrap();
        let mut out = Vec::new();
        assert!(bt.fetch(321, &mut out).unwrap() > 0);
        assert_eq!(&out, b"v321");
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let (_dir, path) = scratch("t.ibt");
        Bt64::create(&path).unwrap().close().unwrap();
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(0)).unwrap();
            f.write_all(b"XXXX").unwrap();
        }
        assert!(matches!(
            Bt64::open(&path, false, false),
            Err(IsamError::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_dump_runs() {
        let (_dir, path) = scratch("t.ibt");
        let mut bt = Bt64::create(&path).unwrap();
        for key in 0..100u64 {
            bt.push(key, b"abc").unwrap();
        }
        let mut out = Vec::new();
        bt.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("BT64 magic"));
        assert!(text.contains("leaves"));
    }
}
