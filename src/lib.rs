//! Persistent memory-mapped ordered index engines.
//!
//! The `isam-utils` crate (library name `isam`) provides two single-writer /
//! multi-reader key/value index engines that persist as paginated files
//! mapped into memory:
//!
//! - **BT64** ([`isam::bt64::Bt64`]) — a B+-tree indexed by 64-bit unsigned
//!   keys. Values are opaque byte blobs stored inline in leaves; a key may
//!   carry several records and values larger than one record are chunked
//!   transparently on push.
//! - **NDX** ([`isam::ndx::Ndx`]) — a prefix-compressed B+-tree indexed by
//!   variable-length byte keys (1-255 bytes) with 0-255 byte values.
//!   Duplicate keys are kept in insertion order.
//!
//! Both engines share the same on-disk architecture: a header page, a
//! paginated data area, an in-file writer lock keyed by `(pid, process
//! start time)`, splitting leaves with a sibling-donation policy, a
//! recursive integrity checker and a text dumper.
//!
//! # CLI Reference
//!
//! The `isam` binary works with index files from the command line.
//!
//! | Command | Purpose |
//! |---------|---------|
//! | `isam dump <path>` | Walk the tree and print every level and leaf |
//! | `isam check <path>` | Run the integrity checker (`--fix` repairs the header) |
//! | `isam info <path>` | Print the header summary (`--json` for machine output) |
//!
//! The engine is auto-detected from the 4-byte magic (`ISBT` / `ISGX`).
//! Exit code is 0 on success and 1 when the index cannot be opened.
//!
//! # Library API
//!
//! ```no_run
//! use isam::isam::bt64::Bt64;
//!
//! let mut bt = Bt64::create("values.ibt").unwrap();
//! bt.push(42, b"hello").unwrap();
//!
//! let mut out = Vec::new();
//! let len = bt.fetch(42, &mut out).unwrap();
//! assert_eq!(&out[..len], b"hello");
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`isam::pagefile`] | Paginated file runtime: create/open/grow/sync over mmap |
//! | [`isam::process`] | Writer-lock staleness probe (`ProcessClock`) |
//! | [`isam::bt64`] | BT64 engine: push, fetch, range fetch, iteration, check, dump |
//! | [`isam::fbt64`] | Read-only BT64 variant reading pages with `pread` (no mmap) |
//! | [`isam::ndx`] | NDX engine: push, fetch, enumerate, check, dump |
//! | [`isam::constants`] | On-disk constants for both file formats |
//! | [`util::fmt`] | Key/data display helpers used by the dumpers |

#[cfg(feature = "cli")]
pub mod cli;
pub mod isam;
pub mod util;

use thiserror::Error;

/// Errors returned by `isam` operations.
#[derive(Error, Debug)]
pub enum IsamError {
    /// OS-level open/stat/map/truncate failure; the errno text is preserved.
    #[error("Open error: {0}")]
    Open(String),

    /// An I/O error occurred after open (read, write, sync).
    #[error("I/O error: {0}")]
    Io(String),

    /// Magic or version mismatch, or header counters out of range.
    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    /// Another live process owns the in-file writer lock.
    #[error("Writer lock held: {0}")]
    WriterLocked(String),

    /// Damage detected while traversing pages (bad level, bad lengths,
    /// keys out of order, out-of-bounds pointers).
    #[error("Structural error: {0}")]
    Structural(String),

    /// A key or data length outside the configured bounds.
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// A record larger than the format can store.
    #[error("Oversized record: {0}")]
    Oversized(String),
}

impl IsamError {
    /// The message carried by the error, without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            IsamError::Open(m)
            | IsamError::Io(m)
            | IsamError::CorruptHeader(m)
            | IsamError::WriterLocked(m)
            | IsamError::Structural(m)
            | IsamError::Argument(m)
            | IsamError::Oversized(m) => m,
        }
    }
}
