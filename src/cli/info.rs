use std::io::Write;

use crate::cli::{detect_kind, wprintln, IndexKind};
use crate::isam::bt64::Bt64;
use crate::isam::ndx::Ndx;
use crate::IsamError;

pub struct InfoOptions {
    pub file: String,
    pub json: bool,
}

pub fn execute(opts: &InfoOptions, writer: &mut dyn Write) -> Result<(), IsamError> {
    match detect_kind(&opts.file)? {
        IndexKind::Bt64 => {
            let bt = Bt64::open(&opts.file, false, false)?;
            let info = bt.info();
            if opts.json {
                let json = serde_json::to_string_pretty(&info)
                    .map_err(|e| IsamError::Io(e.to_string()))?;
                wprintln!(writer, "{}", json)?;
            } else {
                wprintln!(writer, "{}: BT64 index", opts.file)?;
                wprintln!(writer, "  version : {}.{}", info.major, info.minor)?;
                wprintln!(writer, "  depth   : {}", info.depth)?;
                wprintln!(writer, "  nbpages : {}", info.nbpages)?;
                wprintln!(writer, "  freelist: {}", info.freelist)?;
                wprintln!(writer, "  wrlock  : pid {} time {}", info.wrlock_pid, info.wrlock_time)?;
            }
        }
        IndexKind::Ndx => {
            let ndx = Ndx::open(&opts.file, false)?;
            let info = ndx.info();
            if opts.json {
                let json = serde_json::to_string_pretty(&info)
                    .map_err(|e| IsamError::Io(e.to_string()))?;
                wprintln!(writer, "{}", json)?;
            } else {
                wprintln!(writer, "{}: NDX index", opts.file)?;
                wprintln!(writer, "  version : {}.{}", info.major, info.minor)?;
                wprintln!(writer, "  pagesize: {} (1 << {})", info.pagesize, info.pageshift)?;
                wprintln!(writer, "  rootpage: {} (level {})", info.root, info.rootlevel)?;
                wprintln!(writer, "  nbpages : {}", info.nbpages)?;
                wprintln!(writer, "  nbkeys  : {}", info.nbkeys)?;
                wprintln!(writer, "  keylen  : {}..{}", info.minkeylen, info.maxkeylen)?;
                wprintln!(writer, "  datalen : {}..{}", info.mindatalen, info.maxdatalen)?;
                wprintln!(writer, "  userver : {}.{}", info.user_major, info.user_minor)?;
                wprintln!(writer, "  wrlock  : pid {} time {}", info.wrlock_pid, info.wrlock_time)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isam::ndx::NdxParams;
    use tempfile::tempdir;

    #[test]
    fn test_info_json_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.ndx");
        let mut ndx = Ndx::create(&path, &NdxParams::default()).unwrap();
        ndx.push(b"k", b"v").unwrap();
        ndx.close().unwrap();

        let mut out = Vec::new();
        execute(&InfoOptions { file: path.to_str().unwrap().into(), json: true }, &mut out)
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["nbkeys"], 1);
        assert_eq!(v["major"], 1);
    }
}
