//! On-disk constants for the BT64 (`ISBT`) and NDX (`ISGX`) file formats.
//!
//! Both formats are little-endian. Page 0 of every file is a header page;
//! data pages follow. BT64 addresses data pages through 32-bit tagged
//! pointers; NDX uses raw file page numbers (so its first data page is 1).

// ── BT64 geometry ───────────────────────────────────────────────────

/// BT64 page size as a shift (1 KiB pages).
pub const BT_PAGE_SHIFT: u32 = 10;
/// BT64 page size in bytes.
pub const BT_PAGE_SIZE: usize = 1 << BT_PAGE_SHIFT;
/// File growth unit in bytes (1 MiB).
pub const BT_GROW_SIZE: usize = 1 << 20;
/// Data pages added per growth step.
pub const BT_GROW_NBPAGES: usize = BT_GROW_SIZE / BT_PAGE_SIZE;
/// Total pages (header included) in a freshly created file.
pub const BT_INIT_NBPAGES: usize = BT_GROW_SIZE / BT_PAGE_SIZE;

/// Maximum data bytes per leaf record. The divisor keeps enough slack for
/// the three-page split to always find a feasible boundary.
pub const BT_MAX_DLEN: usize = (BT_PAGE_SIZE - 2 * 4) / 6 - 1 - 8 - 1;

/// Maximum keys per inner node (the L constant of the B-tree).
pub const BT_ARITY: usize = (BT_PAGE_SIZE - 4 * 4) / (8 + 4);

// ── BT64 header page (page 0) ───────────────────────────────────────

/// File magic, `'I' 'S' 'B' 'T'`.
pub const BT_MAGIC: [u8; 4] = *b"ISBT";
/// Major file format version.
pub const BT_VERSION_MAJOR: u8 = 1;
/// Minor version encodes the page-size variant: 0 for 4 KiB pages,
/// 1 for every other size. This build reads the 1 KiB variant only.
pub const BT_VERSION_MINOR: u8 = 1;

/// Offset of the magic. 4 bytes.
pub const BT_HDR_MAGIC: usize = 0;
/// Offset of the major version. 1 byte.
pub const BT_HDR_MAJOR: usize = 4;
/// Offset of the minor version. 1 byte.
pub const BT_HDR_MINOR: usize = 5;
/// Offset of the root page pointer. 4 bytes.
pub const BT_HDR_ROOT: usize = 8;
/// Offset of the allocated data-page count. 4 bytes.
pub const BT_HDR_NBPAGES: usize = 12;
/// Offset of the freelist head. 4 bytes.
pub const BT_HDR_FREELIST: usize = 16;
/// Offset of the tree depth. 2 bytes.
pub const BT_HDR_DEPTH: usize = 20;
/// Offset of the writer-lock pid. 2 bytes.
pub const BT_HDR_WRLOCK: usize = 22;
/// Offset of the writer-lock process start-time stamp. 8 bytes.
pub const BT_HDR_WRLOCKT: usize = 24;

// ── BT64 page pointers ──────────────────────────────────────────────

/// Bit 31 set means the pointer targets a node page, clear means a leaf.
pub const BTPP_NODE_MASK: u32 = 0x8000_0000;
/// Low 24 bits carry the page index in the data area.
pub const BTPP_OFFS_MASK: u32 = 0x00ff_ffff;
/// "No sibling / no child" sentinel in allocated pages. Free pages
/// terminate the freelist chain with 0 instead.
pub const BTPP_NIL: u32 = BTPP_OFFS_MASK;

// ── BT64 node and leaf pages ────────────────────────────────────────

/// Offset of the right-sibling page index. 4 bytes.
pub const BT_NODE_NEXT: usize = 0;
/// Offset of the unused flags word. 4 bytes.
pub const BT_NODE_FLAGS: usize = 4;
/// Offset of the key count. 4 bytes.
pub const BT_NODE_NBKEYS: usize = 8;
/// Offset of the child pointer array (`BT_ARITY + 1` entries, 4 bytes each).
pub const BT_NODE_PTRS: usize = 12;
/// Offset of the key array (`BT_ARITY` entries, 8 bytes each).
pub const BT_NODE_KEYS: usize = BT_NODE_PTRS + 4 * (BT_ARITY + 1);

/// Offset of the leaf right-sibling page index. 4 bytes.
pub const BT_LEAF_NEXT: usize = 0;
/// Offset of the used byte count. 4 bytes.
pub const BT_LEAF_USED: usize = 4;
/// Offset of the packed record area.
pub const BT_LEAF_DATA: usize = 8;
/// Capacity of the leaf record area.
pub const BT_LEAF_CAP: usize = BT_PAGE_SIZE - BT_LEAF_DATA;

/// Fixed bytes per leaf record before the data: keylen tag, key, datalen.
pub const BT_REC_HDR: usize = 1 + 8 + 1;

// ── NDX geometry ────────────────────────────────────────────────────

/// File magic, `'I' 'S' 'G' 'X'`.
pub const NDX_MAGIC: [u8; 4] = *b"ISGX";
/// Current file format version.
pub const NDX_MAJOR: u32 = 1;
/// Current file format version.
pub const NDX_MINOR: u32 = 0;

/// Default page size as a shift (1 KiB pages).
pub const NDX_PAGESHIFT: u32 = 10;
/// Smallest accepted page size (256 bytes).
pub const NDX_MIN_PAGESHIFT: u32 = 8;
/// Largest accepted page size (64 KiB).
pub const NDX_MAX_PAGESHIFT: u32 = 16;
/// File growth unit in bytes.
pub const NDX_GROW_BYTES: u64 = 32 * 4096;

/// Hard bound on key length, also the format bound (one length byte).
pub const NDX_MAX_KEYLEN: usize = 255;
/// Hard bound on data length.
pub const NDX_MAX_DATALEN: usize = 255;
/// Maximum tree depth; bounds the insert work stack.
pub const NDX_MAX_DEPTH: usize = 16;

// ── NDX header page (page 0) ────────────────────────────────────────

/// Offset of the magic. 4 bytes.
pub const NDX_HDR_MAGIC: usize = 0;
/// Offset of the major version. 4 bytes.
pub const NDX_HDR_MAJOR: usize = 4;
/// Offset of the minor version. 4 bytes.
pub const NDX_HDR_MINOR: usize = 8;
/// Offset of the page shift. 4 bytes.
pub const NDX_HDR_PAGESHIFT: usize = 12;
/// Offset of the page size. 4 bytes.
pub const NDX_HDR_PAGESIZE: usize = 16;
/// Offset of the root page number. 4 bytes.
pub const NDX_HDR_ROOT: usize = 20;
/// Offset of the root level. 4 bytes.
pub const NDX_HDR_ROOTLEVEL: usize = 24;
/// Offset of the allocated page count (header page included). 4 bytes.
pub const NDX_HDR_NBPAGES: usize = 28;
/// Offset of the stored key count. 4 bytes.
pub const NDX_HDR_NBKEYS: usize = 32;
/// Offset of the minimum key length. 4 bytes.
pub const NDX_HDR_MINKEYLEN: usize = 36;
/// Offset of the maximum key length. 4 bytes.
pub const NDX_HDR_MAXKEYLEN: usize = 40;
/// Offset of the minimum data length. 4 bytes.
pub const NDX_HDR_MINDATALEN: usize = 44;
/// Offset of the maximum data length. 4 bytes.
pub const NDX_HDR_MAXDATALEN: usize = 48;
/// Offset of the user private major version. 4 bytes.
pub const NDX_HDR_USER_MAJOR: usize = 52;
/// Offset of the user private minor version. 4 bytes.
pub const NDX_HDR_USER_MINOR: usize = 56;
/// Offset of the writer-lock pid. 4 bytes. Zero-filled in files written
/// before the field existed, which reads as "unlocked".
pub const NDX_HDR_WRLOCK: usize = 60;
/// Offset of the writer-lock process start-time stamp. 8 bytes.
pub const NDX_HDR_WRLOCKT: usize = 64;

// ── NDX pages ───────────────────────────────────────────────────────

/// Offset of the page level (0 for leaves). 1 byte.
pub const NDX_PAGE_LEVEL: usize = 0;
/// Offset of the sentinel record length (3, or 6 on the rightmost page
/// of an inner level). 1 byte.
pub const NDX_PAGE_TAIL: usize = 1;
/// Offset of the used byte count. 2 bytes.
pub const NDX_PAGE_LEN: usize = 2;
/// Offset of the packed record area.
pub const NDX_PAGE_RECS: usize = 4;

// ── NDX check and dump flags ────────────────────────────────────────

/// Run every check.
pub const NDX_CHECK_ALL: u32 = 1;
/// Walk the page tree.
pub const NDX_CHECK_PAGES: u32 = 2;
/// Verify key ordering and prefix coding.
pub const NDX_CHECK_KEYS: u32 = 4;
/// Internal: the page under check is the rightmost of its level.
pub const NDX_CHECK_ISRIGHTMOST: u32 = 8;

/// Dump everything.
pub const NDX_DUMP_ALL: u32 = 1;
/// Dump raw pages.
pub const NDX_DUMP_PAGES: u32 = 2;
/// Dump decoded keys.
pub const NDX_DUMP_KEYS: u32 = 4;
/// Dump the key/data stream through the enumerator.
pub const NDX_DUMP_ENUMERATE: u32 = 8;
