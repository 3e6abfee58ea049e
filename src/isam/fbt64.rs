//! Read-only file-backed BT64 access.
//!
//! [`FBt64`] serves [`fetch`](FBt64::fetch) and
//! [`fetch_range`](FBt64::fetch_range) without mapping the index: each
//! page on the descent is read with `pread` into a stack buffer. For
//! large indexes under random access this keeps the resident set to the
//! pages actually touched instead of faulting the whole mapping in.
//!
//! Only the header is validated on open; a full integrity pass over a
//! file read one page at a time would defeat the point.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::isam::bt64::{
    btpp_is_node, btpp_offs, leaf_data, leaf_used, node_ptr, page_next, rec_key, Bt64, KeyRange,
    KeyRangeRec,
};
use crate::isam::constants::*;
use crate::IsamError;

/// A BT64 index opened for page-at-a-time reads.
pub struct FBt64 {
    file: File,
    root: u32,
    depth: i16,
    nbpages: u32,
}

impl FBt64 {
    /// Open an index read-only without mapping it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IsamError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| IsamError::Open(format!("cannot open {}: {}", path.display(), e)))?;
        let size = file
            .metadata()
            .map_err(|e| IsamError::Open(format!("cannot stat {}: {}", path.display(), e)))?
            .len();

        let mut hdr = [0u8; BT_PAGE_SIZE];
        file.read_exact_at(&mut hdr, 0)
            .map_err(|e| IsamError::Open(format!("cannot read header of {}: {}", path.display(), e)))?;

        if hdr[BT_HDR_MAGIC..BT_HDR_MAGIC + 4] != BT_MAGIC {
            return Err(IsamError::CorruptHeader(format!("{}: bad magic", path.display())));
        }
        if hdr[BT_HDR_MAJOR] != BT_VERSION_MAJOR || hdr[BT_HDR_MINOR] != BT_VERSION_MINOR {
            return Err(IsamError::CorruptHeader(format!(
                "{}: unsupported version {}.{}",
                path.display(),
                hdr[BT_HDR_MAJOR],
                hdr[BT_HDR_MINOR]
            )));
        }
        if size < BT_PAGE_SIZE as u64 || size % BT_PAGE_SIZE as u64 != 0 {
            return Err(IsamError::CorruptHeader(format!(
                "{}: bad file size {}",
                path.display(),
                size
            )));
        }
        let nbpages = LittleEndian::read_u32(&hdr[BT_HDR_NBPAGES..]);
        if nbpages as u64 > size / BT_PAGE_SIZE as u64 - 1 {
            return Err(IsamError::CorruptHeader(format!(
                "{}: nbpages {} exceeds file capacity",
                path.display(),
                nbpages
            )));
        }

        Ok(FBt64 {
            file,
            root: LittleEndian::read_u32(&hdr[BT_HDR_ROOT..]),
            depth: LittleEndian::read_i16(&hdr[BT_HDR_DEPTH..]),
            nbpages,
        })
    }

    fn read_page(&self, ptr: u32, buf: &mut [u8; BT_PAGE_SIZE]) -> Result<(), IsamError> {
        let offs = btpp_offs(ptr);
        if offs == BTPP_NIL || offs >= self.nbpages {
            return Err(IsamError::Structural(format!(
                "page pointer {:#010x} out of bounds",
                ptr
            )));
        }
        let at = (1 + offs) as u64 * BT_PAGE_SIZE as u64;
        self.file
            .read_exact_at(buf, at)
            .map_err(|e| IsamError::Io(format!("cannot read page {}: {}", offs, e)))
    }

    fn find_leaf(&self, key: u64) -> Result<u32, IsamError> {
        let mut page = self.root;
        let mut buf = [0u8; BT_PAGE_SIZE];
        for level in (1..=self.depth).rev() {
            if !btpp_is_node(page) {
                return Err(IsamError::Structural(format!(
                    "node.L{} page {:03} is not tagged",
                    level,
                    btpp_offs(page)
                )));
            }
            self.read_page(page, &mut buf)?;
            let nbkeys = crate::isam::bt64::node_nbkeys(&buf);
            if nbkeys == 0 || nbkeys > BT_ARITY {
                return Err(IsamError::Structural(format!(
                    "node.L{} page {:03}: invalid nbkeys={}",
                    level,
                    btpp_offs(page),
                    nbkeys
                )));
            }
            let pos = Bt64::node_bsearch(&buf, key);
            page = node_ptr(&buf, pos);
        }
        Ok(page)
    }

    fn checked_used(buf: &[u8; BT_PAGE_SIZE]) -> Result<usize, IsamError> {
        let used = leaf_used(buf);
        if used > BT_LEAF_CAP {
            return Err(IsamError::Structural(format!("leaf used={} beyond capacity", used)));
        }
        Ok(used)
    }

    /// Append the concatenated data stored under `key` to `out` and
    /// return its length; `Ok(0)` when the key is absent.
    pub fn fetch(&self, key: u64, out: &mut Vec<u8>) -> Result<usize, IsamError> {
        let ptr = self.find_leaf(key)?;
        let mut buf = [0u8; BT_PAGE_SIZE];
        self.read_page(ptr, &mut buf)?;
        let mut used = Self::checked_used(&buf)?;

        let (exact, _) = Bt64::leaf_findslot(leaf_data(&buf), used, key)?;
        let Some(mut pos) = exact else { return Ok(0) };

        let mut len = 0;
        loop {
            pos += 1 + 8;
            if pos >= used {
                return Err(IsamError::Structural("leaf record without data length".into()));
            }
            let dlen = leaf_data(&buf)[pos] as usize;
            pos += 1;
            if pos + dlen > used {
                return Err(IsamError::Structural("leaf record data overflows used area".into()));
            }
            out.extend_from_slice(&leaf_data(&buf)[pos..pos + dlen]);
            len += dlen;
            pos += dlen;

            if pos >= used {
                pos = 0;
                let next = page_next(&buf);
                if btpp_offs(next) == BTPP_NIL {
                    break;
                }
                self.read_page(next, &mut buf)?;
                used = Self::checked_used(&buf)?;
                if used == 0 {
                    return Err(IsamError::Structural("empty leaf in sibling chain".into()));
                }
            }
            let d = leaf_data(&buf);
            if pos + BT_REC_HDR > used || d[pos] != 8 {
                return Err(IsamError::Structural("leaf record malformed".into()));
            }
            if rec_key(d, pos) != key {
                break;
            }
        }
        Ok(len)
    }

    /// Collect every `(key, data)` with `kmin <= key <= kmax` into `out`.
    pub fn fetch_range(
        &self,
        kmin: u64,
        kmax: u64,
        out: &mut KeyRange,
    ) -> Result<(), IsamError> {
        out.keys.clear();
        out.data.clear();

        let ptr = self.find_leaf(kmin)?;
        let mut buf = [0u8; BT_PAGE_SIZE];
        self.read_page(ptr, &mut buf)?;
        let mut used = Self::checked_used(&buf)?;

        let (_, mut pos) = Bt64::leaf_findslot(leaf_data(&buf), used, kmin)?;
        let mut cur = KeyRangeRec { key: kmin, dpos: 0, dlen: 0 };

        loop {
            if pos >= used {
                pos = 0;
                let next = page_next(&buf);
                if btpp_offs(next) == BTPP_NIL {
                    break;
                }
                self.read_page(next, &mut buf)?;
                used = Self::checked_used(&buf)?;
                if used == 0 {
                    return Err(IsamError::Structural("empty leaf in sibling chain".into()));
                }
            }
            let d = leaf_data(&buf);
            if pos + BT_REC_HDR > used || d[pos] != 8 {
                return Err(IsamError::Structural("leaf record malformed".into()));
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
                return Err(IsamError::Structural("leaf record data overflows used area".into()));
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fetch_matches_mapped_engine() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.ibt");
        {
            let mut bt = Bt64::create(&path).unwrap();
            for key in 0..2000u64 {
                bt.push(key * 3, &key.to_le_bytes()).unwrap();
            }
            bt.close().unwrap();
        }

        let bt = Bt64::open(&path, false, false).unwrap();
        let fbt = FBt64::open(&path).unwrap();

        for key in [0u64, 3, 1500, 5997, 1_000_000] {
            let mut a = Vec::new();
            let mut b = Vec::new();
            let la = bt.fetch(key, &mut a).unwrap();
            let lb = fbt.fetch(key, &mut b).unwrap();
            assert_eq!(la, lb, "length mismatch for key {}", key);
            assert_eq!(a, b, "data mismatch for key {}", key);
        }

        let mut ra = KeyRange::default();
        let mut rb = KeyRange::default();
        bt.fetch_range(100, 400, &mut ra).unwrap();
        fbt.fetch_range(100, 400, &mut rb).unwrap();
        assert_eq!(ra.keys.len(), rb.keys.len());
        assert_eq!(ra.data, rb.data);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.ibt");
        std::fs::write(&path, vec![0u8; 2 * BT_PAGE_SIZE]).unwrap();
        assert!(matches!(FBt64::open(&path), Err(IsamError::CorruptHeader(_))));
    }
}
