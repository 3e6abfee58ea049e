use std::io::Write;

use crate::cli::{detect_kind, IndexKind};
use crate::isam::bt64::Bt64;
use crate::isam::constants::{NDX_DUMP_ENUMERATE, NDX_DUMP_KEYS, NDX_DUMP_PAGES};
use crate::isam::ndx::Ndx;
use crate::IsamError;

pub struct DumpOptions {
    pub file: String,
    pub pages: bool,
    pub keys: bool,
    pub page: Option<u32>,
}

pub fn execute(opts: &DumpOptions, writer: &mut dyn Write) -> Result<(), IsamError> {
    match detect_kind(&opts.file)? {
        IndexKind::Bt64 => {
            let bt = Bt64::open(&opts.file, false, false)?;
            bt.dump(writer).map_err(|e| IsamError::Io(e.to_string()))
        }
        IndexKind::Ndx => {
            let ndx = Ndx::open(&opts.file, false)?;
            if let Some(page) = opts.page {
                return ndx
                    .dump_page(page, NDX_DUMP_KEYS, writer)
                    .map_err(|e| IsamError::Io(e.to_string()));
            }
            let mut flags = NDX_DUMP_ENUMERATE;
            if opts.pages {
                flags |= NDX_DUMP_PAGES;
            }
            if opts.keys {
                flags |= NDX_DUMP_KEYS;
            }
            ndx.dump(flags, writer).map_err(|e| IsamError::Io(e.to_string()))
        }
    }
}
