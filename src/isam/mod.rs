//! The two index engines and their shared paginated-file runtime.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`constants`] | On-disk constants for the `ISBT` and `ISGX` formats |
//! | [`pagefile`] | Paginated mmap file: create, open, grow, sync, close |
//! | [`process`] | `ProcessClock` capability backing writer-lock staleness |
//! | [`bt64`] | B+-tree over u64 keys with inline multi-record values |
//! | [`fbt64`] | Read-only BT64 served by `pread` instead of mmap |
//! | [`ndx`] | Prefix-compressed B+-tree over variable-length byte keys |

pub mod bt64;
pub mod constants;
pub mod fbt64;
pub mod ndx;
pub mod pagefile;
pub mod process;
