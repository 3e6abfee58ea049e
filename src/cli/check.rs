use std::io::Write;

use colored::Colorize;

use crate::cli::{detect_kind, wprintln, IndexKind};
use crate::isam::bt64::Bt64;
use crate::isam::constants::NDX_CHECK_ALL;
use crate::isam::ndx::Ndx;
use crate::IsamError;

pub struct CheckOptions {
    pub file: String,
    pub fix: bool,
}

/// Run the integrity checker. `Ok(true)` means the index is clean,
/// `Ok(false)` that damage was found (and printed); `Err` that the file
/// could not be opened at all.
pub fn execute(opts: &CheckOptions, writer: &mut dyn Write) -> Result<bool, IsamError> {
    let clean = match detect_kind(&opts.file)? {
        IndexKind::Bt64 => {
            let mut bt = Bt64::open(&opts.file, opts.fix, false)?;
            match bt.check_integrity(opts.fix, writer) {
                Ok(()) => true,
                Err(IsamError::Structural(_)) | Err(IsamError::CorruptHeader(_)) => false,
                Err(e) => return Err(e),
            }
        }
        IndexKind::Ndx => {
            let ndx = Ndx::open(&opts.file, false)?;
            match ndx.check(NDX_CHECK_ALL, writer) {
                Ok(()) => true,
                Err(IsamError::Structural(_)) | Err(IsamError::CorruptHeader(_)) => false,
                Err(e) => return Err(e),
            }
        }
    };

    if clean {
        wprintln!(writer, "{}: {}", opts.file, "OK".green())?;
    } else {
        wprintln!(writer, "{}: {}", opts.file, "CORRUPT".red())?;
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_check_clean_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.ibt");
        let mut bt = Bt64::create(&path).unwrap();
        for key in 0..100u64 {
            bt.push(key, b"data").unwrap();
        }
        bt.close().unwrap();

        let mut out = Vec::new();
        let clean = execute(
            &CheckOptions { file: path.to_str().unwrap().into(), fix: false },
            &mut out,
        )
        .unwrap();
        assert!(clean);
    }

    #[test]
    fn test_check_reports_damage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.ibt");
        let mut bt = Bt64::create(&path).unwrap();
        for key in 0..100u64 {
            bt.push(key, b"data").unwrap();
        }
        bt.close().unwrap();

        // clobber the root leaf's record area
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(1024 + 8)).unwrap();
            f.write_all(&[0xff; 16]).unwrap();
        }

        let mut out = Vec::new();
        let clean = execute(
            &CheckOptions { file: path.to_str().unwrap().into(), fix: false },
            &mut out,
        )
        .unwrap();
        assert!(!clean);
        assert!(!out.is_empty());
    }
}
